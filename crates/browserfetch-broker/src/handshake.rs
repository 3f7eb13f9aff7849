//! Opening handshake.
//!
//! The first message on every connection is a text message: `"<version>
//! <host>"` from a browser tab, or just `"<version>"` from a sibling broker
//! opening a relay link. Anything else refuses that one connection.

use std::fmt;
use std::time::Duration;

use browserfetch_transport::{CloseFrame, Message, MessageReceiver, MessageSender};
use tracing::debug;

use crate::error::{BrokerError, Result};
use crate::protocol::CLOSE_PROTOCOL_ERROR;

/// Protocol version spoken by this broker and its userscript.
pub const PROTOCOL_VERSION: &str = "3";

const MAX_VERSION_LEN: usize = 16;

/// Configuration for the opening handshake.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// How long a new connection may take to introduce itself.
    pub timeout: Duration,
    /// Version token both sides must agree on.
    pub protocol_version: String,
    /// Longest accepted host name, in bytes.
    pub max_host_len: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            protocol_version: PROTOCOL_VERSION.to_string(),
            max_host_len: 255,
        }
    }
}

/// A parsed handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub version: String,
    /// `None` for relay links.
    pub host: Option<String>,
}

impl Hello {
    pub fn tab(version: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            host: Some(host.into()),
        }
    }

    pub fn relay(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            host: None,
        }
    }

    /// Parse the text form. Only the first space separates; host names may
    /// not contain further structure.
    pub fn parse(text: &str) -> Result<Self> {
        let (version, host) = match text.split_once(' ') {
            Some((version, host)) => (version, Some(host)),
            None => (text, None),
        };
        if version.is_empty() || version.len() > MAX_VERSION_LEN {
            return Err(BrokerError::Handshake(format!(
                "invalid protocol version token {version:?}"
            )));
        }
        if host == Some("") {
            return Err(BrokerError::Handshake("empty host name".to_string()));
        }
        Ok(Self {
            version: version.to_string(),
            host: host.map(str::to_string),
        })
    }

    pub fn encode(&self) -> String {
        match &self.host {
            Some(host) => format!("{} {}", self.version, host),
            None => self.version.clone(),
        }
    }

    /// The host name of a tab handshake.
    pub fn require_host(self) -> Result<String> {
        self.host
            .ok_or_else(|| BrokerError::Handshake("missing host name".to_string()))
    }
}

impl fmt::Display for Hello {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Wait for and validate the peer's handshake.
pub async fn handshake_server(
    receiver: &mut MessageReceiver,
    config: &HandshakeConfig,
) -> Result<Hello> {
    let message = tokio::time::timeout(config.timeout, receiver.recv())
        .await
        .map_err(|_| {
            BrokerError::Handshake(format!("no handshake within {:?}", config.timeout))
        })?;

    let text = match message {
        Some(Message::Text(text)) => text,
        Some(Message::Binary(_)) => {
            return Err(BrokerError::Handshake(
                "expected a text handshake, got a binary message".to_string(),
            ))
        }
        Some(Message::Close(_)) | None => {
            return Err(BrokerError::ConnectionClosed(
                "connection closed during handshake".to_string(),
            ))
        }
    };

    let hello = Hello::parse(text.trim_end())?;
    if hello.version != config.protocol_version {
        return Err(BrokerError::Handshake(format!(
            "protocol version {}, expected {}",
            hello.version, config.protocol_version
        )));
    }
    if let Some(host) = &hello.host {
        if host.len() > config.max_host_len {
            return Err(BrokerError::Handshake(format!(
                "host name too long: {} bytes (max {})",
                host.len(),
                config.max_host_len
            )));
        }
    }
    debug!(connection = %receiver.id(), hello = %hello, "handshake accepted");
    Ok(hello)
}

/// Introduce a relay link to the primary.
pub async fn handshake_client(sender: &MessageSender, config: &HandshakeConfig) -> Result<()> {
    let hello = Hello::relay(config.protocol_version.clone());
    sender.send(Message::Text(hello.encode())).await?;
    Ok(())
}

/// Close a connection whose handshake failed, telling the peer why.
pub fn reject(sender: &MessageSender, err: &BrokerError) {
    sender.close(Some(CloseFrame::new(CLOSE_PROTOCOL_ERROR, err.to_string())));
}
