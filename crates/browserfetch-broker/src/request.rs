//! Call shapes for `evaluate` and `fetch`.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::error::{BrokerError, Result};
use crate::protocol::{Action, Reply};

/// Arguments of an `evaluate` call.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluateRequest {
    /// JavaScript source. A function result is called with `arg` and a
    /// promise result is awaited.
    pub code: String,
    pub host: String,
    pub arg: Option<Value>,
    /// Falls back to the broker's default timeout.
    pub timeout: Option<Duration>,
}

impl EvaluateRequest {
    pub fn new(code: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            host: host.into(),
            arg: None,
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: Value) -> Self {
        self.arg = Some(arg);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub(crate) fn into_action(self) -> (String, Action, Option<Duration>) {
        (
            self.host,
            Action::Evaluate {
                string: self.code,
                arg: self.arg,
            },
            self.timeout,
        )
    }
}

/// Arguments of a `fetch` call. `options` is passed to the browser's
/// `fetch` as-is; see the builder methods for the common keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchRequest {
    pub url: String,
    /// Defaults to the URL's `host[:port]`.
    pub host: Option<String>,
    /// Appended to the URL's query string.
    pub params: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub options: Map<String, Value>,
    pub timeout: Option<Duration>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn method(self, method: &str) -> Self {
        self.option("method", Value::String(method.to_ascii_uppercase()))
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let headers = self
            .options
            .entry("headers")
            .or_insert_with(|| Value::Object(Map::new()));
        if !headers.is_object() {
            *headers = Value::Object(Map::new());
        }
        if let Value::Object(headers) = headers {
            headers.insert(name.into(), Value::String(value.into()));
        }
        self
    }

    pub fn option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// URL-encoded form body with the matching content type.
    pub fn form<K, V>(self, fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(fields)
            .finish();
        self.header("Content-Type", "application/x-www-form-urlencoded")
            .body(encoded)
    }

    /// JSON body with the matching content type.
    pub fn json<T: Serialize + ?Sized>(self, value: &T) -> Result<Self> {
        let encoded = serde_json::to_vec(value)?;
        Ok(self.header("Content-Type", "application/json").body(encoded))
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The URL with `params` appended.
    pub fn target_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.url)
            .map_err(|err| BrokerError::InvalidUrl(format!("{}: {err}", self.url)))?;
        if !self.params.is_empty() {
            url.query_pairs_mut().extend_pairs(&self.params);
        }
        Ok(url)
    }

    pub(crate) fn into_parts(self) -> Result<(String, Action, Option<Bytes>, Option<Duration>)> {
        let url = self.target_url()?;
        let host = match self.host {
            Some(host) => host,
            None => extract_host(&url)?,
        };
        // Without params the caller's URL goes out exactly as written.
        let url = if self.params.is_empty() {
            self.url
        } else {
            url.to_string()
        };
        let options = (!self.options.is_empty()).then_some(Value::Object(self.options));
        let action = Action::Fetch { url, options };
        Ok((host, action, self.body, self.timeout))
    }
}

/// `host[:port]` of a URL, the way a browser reports `location.host`.
pub fn extract_host(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| BrokerError::InvalidUrl(format!("{url}: no host")))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// What the browser's `fetch` resolved to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResponse {
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub ok: bool,
    #[serde(default)]
    pub redirected: bool,
    #[serde(rename = "type", default)]
    pub response_type: String,
    /// Final URL after redirects.
    #[serde(default)]
    pub url: String,
    #[serde(skip)]
    pub body: Bytes,
}

impl FetchResponse {
    pub fn from_reply(reply: Reply) -> Result<Self> {
        let mut response: FetchResponse =
            serde_json::from_value(Value::Object(reply.meta.fields))?;
        response.body = reply.body.unwrap_or_default();
        Ok(response)
    }

    pub fn final_url(&self) -> &str {
        &self.url
    }

    /// The body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}
