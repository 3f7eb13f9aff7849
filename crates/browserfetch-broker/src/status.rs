//! Status report served by the primary at `/` and `/status.json`.

use std::fmt::Write as _;

use serde::Serialize;

use crate::broker::Role;
use crate::protocol::CallId;
use crate::registry::EndpointKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostState {
    Claimed,
    Unclaimed,
}

/// One registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostStatus {
    pub host: String,
    pub state: HostState,
    pub connection: Option<String>,
    pub kind: Option<EndpointKind>,
    /// Callers queued on an unclaimed host.
    pub waiters: usize,
}

/// One pending call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingStatus {
    pub call_id: CallId,
    pub connection: Option<String>,
    /// `None` while the call still waits for its host.
    pub remaining_ms: Option<u64>,
    pub resolved: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub role: Role,
    pub version: String,
    pub hosts: Vec<HostStatus>,
    pub pending: Vec<PendingStatus>,
}

impl StatusReport {
    pub fn to_html(&self) -> String {
        let mut html = String::from("<!doctype html>\n<meta charset=\"utf-8\">\n");
        html.push_str("<title>browserfetch</title>\n");
        let _ = writeln!(
            html,
            "<p>browserfetch {} ({})</p>",
            escape_html(&self.version),
            role_label(self.role)
        );

        html.push_str("<h2>Hosts</h2>\n<ul>\n");
        for host in &self.hosts {
            let detail = match (host.state, &host.connection, host.kind) {
                (HostState::Claimed, Some(connection), Some(kind)) => {
                    format!("{} via {}", kind_label(kind), connection)
                }
                _ => format!("waiting ({} queued)", host.waiters),
            };
            let _ = writeln!(
                html,
                "<li>{}: {}</li>",
                escape_html(&host.host),
                escape_html(&detail)
            );
        }
        html.push_str("</ul>\n<h2>Pending calls</h2>\n<ul>\n");
        for call in &self.pending {
            let connection = call.connection.as_deref().unwrap_or("unsent");
            let remaining = match call.remaining_ms {
                Some(ms) => format!("{ms} ms left"),
                None => "awaiting host".to_string(),
            };
            let _ = writeln!(
                html,
                "<li>{}: {}, {}{}</li>",
                call.call_id,
                escape_html(connection),
                remaining,
                if call.resolved { ", resolved" } else { "" }
            );
        }
        html.push_str("</ul>\n");
        html
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::Starting => "starting",
        Role::Primary => "primary",
        Role::Relay => "relay",
    }
}

fn kind_label(kind: EndpointKind) -> &'static str {
    match kind {
        EndpointKind::Tab => "tab",
        EndpointKind::Relay => "relay",
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(ch),
        }
    }
    out
}
