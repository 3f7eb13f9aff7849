//! Wire messages exchanged after the handshake.
//!
//! Every message is a binary frame (see `browserfetch-frame`) whose metadata
//! is one of three shapes:
//! - a request: carries `action`
//! - a reply: carries `call_id` but no `action`
//! - a relay control message: `announce`, `withdraw` or `rejected`

use std::fmt;
use std::time::Duration;

use browserfetch_frame::Frame;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{BrokerError, Result};

/// Normal closure (shutdown).
pub const CLOSE_NORMAL: u16 = 1000;
/// The host name is already claimed by another live connection.
pub const CLOSE_DUPLICATE_HOST: u16 = 4001;
/// Handshake or framing violation.
pub const CLOSE_PROTOCOL_ERROR: u16 = 4002;
/// The broker reset its registry; the peer should reconnect.
pub const CLOSE_REGISTRY_RESET: u16 = 4003;

/// Opaque correlation token for one outstanding call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(u64);

impl CallId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the browser is asked to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Evaluate `string`; if it yields a function, call it with `arg`.
    #[serde(alias = "eval")]
    Evaluate {
        string: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        arg: Option<Value>,
    },
    /// Call `fetch(url, options)`; the frame body becomes the request body.
    Fetch {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        options: Option<Value>,
    },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Evaluate { .. } => "evaluate",
            Action::Fetch { .. } => "fetch",
        }
    }
}

/// Request metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub call_id: CallId,
    #[serde(flatten)]
    pub action: Action,
    /// Seconds the caller is willing to wait.
    pub timeout: f64,
    /// Target host; only present on relay links.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl Request {
    /// The timeout as a duration, if it is a usable number of seconds.
    pub fn timeout_duration(&self) -> Option<Duration> {
        Duration::try_from_secs_f64(self.timeout).ok()
    }

    pub fn to_frame(&self, body: Option<Bytes>) -> Result<Frame> {
        Ok(Frame::from_json(self, body)?)
    }
}

/// Reply metadata: the echoed call id plus whatever the peer reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyMeta {
    pub call_id: CallId,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// A decoded reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub meta: ReplyMeta,
    pub body: Option<Bytes>,
}

impl Reply {
    pub fn new(call_id: CallId, fields: Map<String, Value>, body: Option<Bytes>) -> Self {
        Self {
            meta: ReplyMeta { call_id, fields },
            body,
        }
    }

    /// A reply reporting `message` as the failure.
    pub fn failure(call_id: CallId, message: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert("error".to_string(), Value::String(message.into()));
        Self::new(call_id, fields, None)
    }

    /// The reply a relay sends when it could not get an answer in time.
    pub fn relay_timeout(call_id: CallId) -> Self {
        let mut reply = Self::failure(call_id, "timed out in relay");
        reply
            .meta
            .fields
            .insert("timed_out".to_string(), Value::Bool(true));
        reply
    }

    pub fn call_id(&self) -> CallId {
        self.meta.call_id
    }

    /// The same reply correlated to another call.
    pub fn with_call_id(mut self, call_id: CallId) -> Self {
        self.meta.call_id = call_id;
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.meta.fields.get(name)
    }

    /// The reported failure, if any. A `null` error counts as none.
    pub fn error(&self) -> Option<String> {
        match self.field("error")? {
            Value::Null => None,
            Value::String(message) => Some(message.clone()),
            other => Some(other.to_string()),
        }
    }

    pub fn timed_out(&self) -> bool {
        matches!(self.field("timed_out"), Some(Value::Bool(true)))
    }

    /// The evaluation result, `null` when absent.
    pub fn result(&self) -> Value {
        self.field("result").cloned().unwrap_or(Value::Null)
    }

    pub fn to_frame(&self) -> Result<Frame> {
        Ok(Frame::from_json(&self.meta, self.body.clone())?)
    }
}

/// Messages that keep a primary's registry in step with a relay's tabs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayControl {
    /// Relay to primary: a local tab claimed this host.
    Announce(String),
    /// Relay to primary: the local tab for this host went away.
    Withdraw(String),
    /// Primary to relay: the announced host is already claimed elsewhere.
    Rejected { host: String, reason: String },
}

impl RelayControl {
    pub fn to_frame(&self) -> Result<Frame> {
        Ok(Frame::from_json(self, None)?)
    }
}

/// Any decoded post-handshake message.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request(Request, Option<Bytes>),
    Reply(Reply),
    Control(RelayControl),
}

impl Envelope {
    pub fn decode(frame: Frame) -> Result<Self> {
        let metadata: Map<String, Value> = frame.parse_metadata()?;
        if metadata.contains_key("action") {
            let request: Request = serde_json::from_value(Value::Object(metadata))?;
            return Ok(Envelope::Request(request, frame.body));
        }
        if metadata.contains_key("call_id") {
            let meta: ReplyMeta = serde_json::from_value(Value::Object(metadata))?;
            return Ok(Envelope::Reply(Reply {
                meta,
                body: frame.body,
            }));
        }
        if metadata.len() == 1
            && ["announce", "withdraw", "rejected"]
                .iter()
                .any(|key| metadata.contains_key(*key))
        {
            let control: RelayControl = serde_json::from_value(Value::Object(metadata))?;
            return Ok(Envelope::Control(control));
        }
        Err(BrokerError::Protocol(format!(
            "unrecognised message with keys {:?}",
            metadata.keys().collect::<Vec<_>>()
        )))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn decode(metadata: Value, body: Option<&'static [u8]>) -> Envelope {
        let frame = Frame::from_json(&metadata, body.map(Bytes::from_static)).unwrap();
        Envelope::decode(frame).unwrap()
    }

    #[test]
    fn evaluate_request_wire_shape() {
        let request = Request {
            call_id: CallId::new(5),
            action: Action::Evaluate {
                string: "() => 42".to_string(),
                arg: None,
            },
            timeout: 95.0,
            host: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({"call_id": 5, "action": "evaluate", "string": "() => 42", "timeout": 95.0})
        );
    }

    #[test]
    fn relayed_fetch_request_carries_host_and_body() {
        let envelope = decode(
            json!({
                "call_id": 9,
                "action": "fetch",
                "url": "https://example.com/api",
                "options": {"method": "POST"},
                "timeout": 1.5,
                "host": "example.com"
            }),
            Some(b"payload"),
        );
        let Envelope::Request(request, body) = envelope else {
            panic!("expected a request");
        };
        assert_eq!(request.host.as_deref(), Some("example.com"));
        assert_eq!(request.timeout_duration(), Some(Duration::from_millis(1500)));
        assert_eq!(body.as_deref(), Some(&b"payload"[..]));
        assert_eq!(request.action.name(), "fetch");
    }

    #[test]
    fn legacy_eval_action_name_is_accepted() {
        let envelope = decode(
            json!({"call_id": 1, "action": "eval", "string": "1", "timeout": 3}),
            None,
        );
        assert!(matches!(
            envelope,
            Envelope::Request(
                Request {
                    action: Action::Evaluate { .. },
                    ..
                },
                None
            )
        ));
    }

    #[test]
    fn unusable_timeouts_are_ignored() {
        let mut request = Request {
            call_id: CallId::new(1),
            action: Action::Evaluate {
                string: "1".to_string(),
                arg: None,
            },
            timeout: -1.0,
            host: None,
        };
        assert_eq!(request.timeout_duration(), None);
        request.timeout = f64::NAN;
        assert_eq!(request.timeout_duration(), None);
    }

    #[test]
    fn reply_accessors() {
        let Envelope::Reply(reply) = decode(
            json!({"call_id": 3, "status": 404, "ok": false, "error": null}),
            Some(b""),
        ) else {
            panic!("expected a reply");
        };
        assert_eq!(reply.call_id(), CallId::new(3));
        assert_eq!(reply.error(), None);
        assert_eq!(reply.field("status"), Some(&json!(404)));
        assert_eq!(reply.result(), Value::Null);

        let failed = Reply::failure(CallId::new(4), "Failed to fetch");
        assert_eq!(failed.error().as_deref(), Some("Failed to fetch"));
        assert!(!failed.timed_out());
        assert!(Reply::relay_timeout(CallId::new(4)).timed_out());
    }

    #[test]
    fn reply_survives_frame_encoding() {
        let reply = Reply::new(
            CallId::new(12),
            Map::from_iter([("result".to_string(), json!(11))]),
            None,
        )
        .with_call_id(CallId::new(13));
        let Envelope::Reply(decoded) = Envelope::decode(reply.to_frame().unwrap()).unwrap() else {
            panic!("expected a reply");
        };
        assert_eq!(decoded, reply);
        assert_eq!(decoded.result(), json!(11));
    }

    #[test]
    fn relay_control_wire_shapes() {
        assert_eq!(
            serde_json::to_value(RelayControl::Announce("x".to_string())).unwrap(),
            json!({"announce": "x"})
        );
        assert_eq!(
            decode(
                json!({"rejected": {"host": "x", "reason": "taken"}}),
                None
            ),
            Envelope::Control(RelayControl::Rejected {
                host: "x".to_string(),
                reason: "taken".to_string()
            })
        );
        assert_eq!(
            decode(json!({"withdraw": "x"}), None),
            Envelope::Control(RelayControl::Withdraw("x".to_string()))
        );
    }

    #[test]
    fn unknown_shapes_are_protocol_errors() {
        let frame = Frame::from_json(&json!({"hello": 1}), None).unwrap();
        assert!(matches!(
            Envelope::decode(frame),
            Err(BrokerError::Protocol(_))
        ));
        let frame = Frame::from_json(&json!([1, 2]), None).unwrap();
        assert!(matches!(Envelope::decode(frame), Err(BrokerError::Frame(_))));
    }
}
