#![allow(dead_code)]

use std::time::Duration;

use browserfetch_broker::{Action, Envelope, Reply, Request};
use browserfetch_frame::{decode_frame, DEFAULT_MAX_PAYLOAD};
use browserfetch_transport::{CloseFrame, Connection, Message};
use bytes::Bytes;
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;

/// What a browser tab would answer, keyed on the code it is asked to run.
pub fn answer(request: &Request) -> Option<Map<String, Value>> {
    let fields = match &request.action {
        Action::Evaluate { string, arg } => match string.as_str() {
            "() => 42" => json!({ "result": 42 }),
            "async () => 11" => json!({ "result": 11 }),
            "(a) => a + 7" => json!({ "result": arg.as_ref().and_then(Value::as_i64).unwrap_or(0) + 7 }),
            "throw new Error('boom')" => json!({ "error": "Error: boom" }),
            "hang" => return None,
            _ => json!({ "result": null }),
        },
        Action::Fetch { .. } => json!({ "error": "TypeError: Failed to fetch" }),
    };
    match fields {
        Value::Object(fields) => Some(fields),
        _ => None,
    }
}

pub async fn send_handshake(conn: &Connection, host: &str) {
    conn.send(Message::Text(format!("3 {host}"))).await.unwrap();
}

pub async fn send_reply(conn: &Connection, reply: Reply) {
    let wire = reply.to_frame().unwrap().encode(DEFAULT_MAX_PAYLOAD).unwrap();
    conn.send(Message::Binary(wire)).await.unwrap();
}

/// Next request the broker sent to this tab, or the close frame.
pub async fn next_request(conn: &mut Connection) -> Result<(Request, Option<Bytes>), Option<CloseFrame>> {
    loop {
        match conn.recv().await {
            Some(Message::Binary(data)) => {
                let frame = decode_frame(data, DEFAULT_MAX_PAYLOAD).unwrap();
                match Envelope::decode(frame).unwrap() {
                    Envelope::Request(request, body) => return Ok((request, body)),
                    other => panic!("tab received {other:?}"),
                }
            }
            Some(Message::Text(_)) => continue,
            Some(Message::Close(frame)) => return Err(frame),
            None => return Err(None),
        }
    }
}

/// Run a scripted tab on `conn` until the broker closes it.
///
/// Resolves to the close frame the broker sent, if any.
pub fn spawn_tab(mut conn: Connection, host: &str) -> JoinHandle<Option<CloseFrame>> {
    let host = host.to_string();
    tokio::spawn(async move {
        send_handshake(&conn, &host).await;
        loop {
            let (request, _body) = match next_request(&mut conn).await {
                Ok(request) => request,
                Err(frame) => return frame,
            };
            if let Some(fields) = answer(&request) {
                send_reply(&conn, Reply::new(request.call_id, fields, None)).await;
            }
        }
    })
}

/// Poll until `check` holds, failing the test after a few seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
