//! Evaluate JavaScript and run `fetch()` inside your own browser tabs.
//!
//! Each tab runs a small userscript (see [`USERSCRIPT`]) that connects to a
//! local broker and registers under its host name. Any number of processes
//! can then call into those tabs; the first one to bind the well-known port
//! serves the tabs and the rest relay through it.
//!
//! # Crate Structure
//!
//! - [`transport`]: message-oriented connections (in-memory, WebSocket)
//! - [`frame`]: metadata/body wire framing
//! - [`broker`]: host registry, call correlation, primary/relay election

/// Re-export transport types.
pub mod transport {
    pub use browserfetch_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use browserfetch_frame::*;
}

/// Re-export broker types.
pub mod broker {
    pub use browserfetch_broker::*;
}

pub use browserfetch_broker::{
    Broker, BrokerConfig, BrokerError, EvaluateRequest, FetchRequest, FetchResponse, Result, Role,
};

/// The browser userscript. `generateHostName()` decides the name a tab
/// registers under; it defaults to `location.host`. It connects to a broker
/// on the default address.
pub const USERSCRIPT: &str = include_str!("../assets/browserfetch.js");

const DEFAULT_ENDPOINT_LINE: &str = "const ENDPOINT = 'ws://127.0.0.1:9404/ws';";
const DEFAULT_HOST_LINE: &str = "return location.host;";

/// The userscript pointed at the broker listening on `addr` (`host:port`).
/// `host_expression`, if given, replaces `location.host` as the name the tab
/// registers under.
pub fn userscript_for(addr: &str, host_expression: Option<&str>) -> String {
    let script = USERSCRIPT.replacen(
        DEFAULT_ENDPOINT_LINE,
        &format!("const ENDPOINT = 'ws://{addr}/ws';"),
        1,
    );
    match host_expression {
        Some(expression) => {
            script.replacen(DEFAULT_HOST_LINE, &format!("return {expression};"), 1)
        }
        None => script,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn userscript_speaks_the_broker_protocol() {
        assert!(USERSCRIPT.contains(&format!("'{}'", broker::PROTOCOL_VERSION)));
        assert!(USERSCRIPT.contains("/ws"));
        assert!(USERSCRIPT.contains(&broker::DEFAULT_PORT.to_string()));
    }

    #[test]
    fn default_address_leaves_script_unchanged() {
        let addr = BrokerConfig::default().addr();
        assert_eq!(userscript_for(&addr, None), USERSCRIPT);
    }

    #[test]
    fn endpoint_and_host_name_can_be_replaced() {
        let script = userscript_for("127.0.0.1:9999", Some("'test'"));
        assert!(script.contains("const ENDPOINT = 'ws://127.0.0.1:9999/ws';"));
        assert!(script.contains("return 'test';"));
        assert!(!script.contains("9404"));
        assert!(!script.contains("return location.host;"));
    }
}
