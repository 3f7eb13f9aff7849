//! Per-connection receive loops: browser tabs and relay links.

use browserfetch_transport::{CloseFrame, Connection, Message, MessageReceiver, MessageSender};
use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::error::{BrokerError, Result};
use crate::handshake::{handshake_server, reject};
use crate::protocol::{
    Envelope, RelayControl, Reply, Request, CLOSE_DUPLICATE_HOST, CLOSE_PROTOCOL_ERROR,
};
use crate::registry::{Endpoint, EndpointKind};

/// Which end of a relay link this broker holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkSide {
    /// The primary's end: the peer is a relay.
    Accepted,
    /// The relay's end: the peer is the primary.
    Upstream,
}

fn decode(broker: &Broker, data: Bytes) -> Result<Envelope> {
    let frame = broker.frame_config().decode(data)?;
    Envelope::decode(frame)
}

fn close_reason(frame: Option<CloseFrame>) -> String {
    match frame {
        Some(frame) if !frame.reason.is_empty() => {
            format!("closed by peer ({}): {}", frame.code, frame.reason)
        }
        Some(frame) => format!("closed by peer ({})", frame.code),
        None => "closed by peer".to_string(),
    }
}

fn protocol_violation(sender: &MessageSender, err: &BrokerError) -> String {
    warn!(connection = %sender.id(), error = %err, "malformed message; closing");
    sender.close(Some(CloseFrame::new(CLOSE_PROTOCOL_ERROR, err.to_string())));
    err.to_string()
}

/// Serve one browser tab until it disconnects.
pub(crate) async fn serve_tab(broker: Broker, connection: Connection) {
    let (sender, mut receiver) = connection.split();
    let id = sender.id();

    let host = match handshake_server(&mut receiver, &broker.config().handshake)
        .await
        .and_then(|hello| hello.require_host())
    {
        Ok(host) => host,
        Err(err) => {
            warn!(connection = %id, error = %err, "tab handshake failed");
            reject(&sender, &err);
            return;
        }
    };

    if let Err(dup) = broker.registry().register(&host, Endpoint::tab(sender.clone())) {
        warn!(connection = %id, %host, owner = %dup.owner, "duplicate host; closing");
        sender.close(Some(CloseFrame::new(CLOSE_DUPLICATE_HOST, dup.to_string())));
        return;
    }
    broker.track(sender.clone());
    info!(connection = %id, %host, "tab registered");
    broker
        .notify_upstream(RelayControl::Announce(host.clone()))
        .await;

    let reason = loop {
        match receiver.recv().await {
            Some(Message::Binary(data)) => match decode(&broker, data) {
                Ok(Envelope::Reply(reply)) => deliver(&broker, reply),
                Ok(other) => {
                    let err = BrokerError::Protocol(format!("tab sent {other:?}"));
                    break protocol_violation(&sender, &err);
                }
                Err(err) => break protocol_violation(&sender, &err),
            },
            Some(Message::Text(_)) => debug!(connection = %id, "ignoring text message"),
            Some(Message::Close(frame)) => break close_reason(frame),
            None => break "connection closed".to_string(),
        }
    };

    sender.close(None);
    if broker.registry().release(&host, id) {
        broker
            .notify_upstream(RelayControl::Withdraw(host.clone()))
            .await;
    }
    let failed = broker
        .pending()
        .fail_connection(id, &format!("tab `{host}` went away: {reason}"));
    broker.untrack(id);
    info!(connection = %id, %host, failed, %reason, "tab disconnected");
}

/// Serve a relay link accepted by the primary until it closes.
pub(crate) async fn serve_relay(broker: Broker, connection: Connection) {
    let (sender, mut receiver) = connection.split();
    let id = sender.id();

    match handshake_server(&mut receiver, &broker.config().handshake).await {
        Ok(hello) if hello.host.is_none() => {}
        Ok(hello) => {
            let err = BrokerError::Handshake(format!("relay handshake `{hello}` names a host"));
            warn!(connection = %id, error = %err, "relay handshake failed");
            reject(&sender, &err);
            return;
        }
        Err(err) => {
            warn!(connection = %id, error = %err, "relay handshake failed");
            reject(&sender, &err);
            return;
        }
    }
    broker.track(sender.clone());
    info!(connection = %id, "relay connected");

    let reason = serve_link(&broker, &sender, &mut receiver, LinkSide::Accepted).await;

    sender.close(None);
    let released = broker.registry().release_all(id);
    let failed = broker
        .pending()
        .fail_connection(id, &format!("relay link went away: {reason}"));
    broker.untrack(id);
    info!(connection = %id, ?released, failed, %reason, "relay disconnected");
}

/// Run the receive loop of a relay link, from either end.
///
/// Returns a description of why the link ended.
pub(crate) async fn serve_link(
    broker: &Broker,
    sender: &MessageSender,
    receiver: &mut MessageReceiver,
    side: LinkSide,
) -> String {
    loop {
        match receiver.recv().await {
            Some(Message::Binary(data)) => match decode(broker, data) {
                Ok(Envelope::Reply(reply)) => deliver(broker, reply),
                Ok(Envelope::Request(request, body)) => {
                    tokio::spawn(serve_forwarded(
                        broker.clone(),
                        sender.clone(),
                        request,
                        body,
                        side,
                    ));
                }
                Ok(Envelope::Control(control)) => {
                    handle_control(broker, sender, control, side).await
                }
                Err(err) => return protocol_violation(sender, &err),
            },
            Some(Message::Text(_)) => debug!(connection = %sender.id(), "ignoring text message"),
            Some(Message::Close(frame)) => return close_reason(frame),
            None => return "connection closed".to_string(),
        }
    }
}

fn deliver(broker: &Broker, reply: Reply) {
    let call_id = reply.call_id();
    if !broker.pending().deliver(reply) {
        debug!(%call_id, "dropping reply for a call that is no longer pending");
    }
}

async fn handle_control(
    broker: &Broker,
    sender: &MessageSender,
    control: RelayControl,
    side: LinkSide,
) {
    match (side, control) {
        (LinkSide::Accepted, RelayControl::Announce(host)) => {
            match broker
                .registry()
                .register(&host, Endpoint::relay(sender.clone()))
            {
                Ok(()) => info!(connection = %sender.id(), %host, "relayed host registered"),
                Err(dup) if dup.owner == sender.id() => {}
                Err(dup) => {
                    warn!(connection = %sender.id(), %host, owner = %dup.owner, "relayed host rejected");
                    let rejected = RelayControl::Rejected {
                        reason: dup.to_string(),
                        host,
                    };
                    if let Err(err) = send_frame(broker, sender, rejected.to_frame()).await {
                        debug!(error = %err, "failed to send rejection");
                    }
                }
            }
        }
        (LinkSide::Accepted, RelayControl::Withdraw(host)) => {
            if broker.registry().release(&host, sender.id()) {
                info!(connection = %sender.id(), %host, "relayed host withdrawn");
            }
        }
        (LinkSide::Upstream, RelayControl::Rejected { host, reason }) => {
            match broker.registry().claimant(&host) {
                Some(endpoint) if endpoint.kind == EndpointKind::Tab => {
                    warn!(%host, %reason, "primary rejected local tab; closing");
                    endpoint
                        .sender
                        .close(Some(CloseFrame::new(CLOSE_DUPLICATE_HOST, reason)));
                }
                _ => debug!(%host, "rejection for a host no longer claimed"),
            }
        }
        (side, control) => {
            warn!(connection = %sender.id(), ?side, ?control, "unexpected relay control");
        }
    }
}

/// Serve a request that arrived over a relay link and send the reply back.
///
/// The primary may route to any endpoint it knows. A relay only serves its
/// own tabs, never bouncing the request back upstream.
async fn serve_forwarded(
    broker: Broker,
    link: MessageSender,
    request: Request,
    body: Option<Bytes>,
    side: LinkSide,
) {
    let call_id = request.call_id;
    let timeout = request
        .timeout_duration()
        .unwrap_or(broker.config().default_timeout);
    let deadline = Instant::now() + timeout;

    let reply = match request.host {
        None => Reply::failure(call_id, "relayed request without a host"),
        Some(host) => {
            let outcome = tokio::select! {
                _ = broker.shutdown_token().cancelled() => Err(BrokerError::Shutdown),
                outcome = broker.dispatch(
                    &host,
                    request.action,
                    body,
                    timeout,
                    deadline,
                    side == LinkSide::Accepted,
                ) => outcome,
            };
            match outcome {
                Ok(reply) => reply.with_call_id(call_id),
                Err(BrokerError::Timeout(_)) => Reply::relay_timeout(call_id),
                // The link is closing too; the caller's own deadline applies.
                Err(BrokerError::Shutdown) => return,
                Err(err) => Reply::failure(call_id, err.to_string()),
            }
        }
    };

    if let Err(err) = send_frame(&broker, &link, reply.to_frame()).await {
        debug!(%call_id, error = %err, "failed to return relayed reply");
    }
}

async fn send_frame(
    broker: &Broker,
    sender: &MessageSender,
    frame: Result<browserfetch_frame::Frame>,
) -> Result<()> {
    let wire = broker.frame_config().encode(&frame?)?;
    sender.send(Message::Binary(wire)).await?;
    Ok(())
}
