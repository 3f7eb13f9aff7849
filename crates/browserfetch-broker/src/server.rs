//! HTTP side of the primary: WebSocket upgrades and the status page.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use browserfetch_transport::websocket;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::net::Incoming;
use crate::status::StatusReport;

#[derive(Clone)]
pub(crate) struct ServerState {
    incoming: mpsc::Sender<Incoming>,
    max_message_size: usize,
}

impl ServerState {
    pub(crate) fn new(incoming: mpsc::Sender<Incoming>, max_message_size: usize) -> Self {
        Self {
            incoming,
            max_message_size,
        }
    }
}

pub(crate) fn router(state: ServerState) -> Router {
    Router::new()
        .route("/", get(status_page))
        .route("/status.json", get(status_json))
        .route("/ws", get(tab_upgrade))
        .route("/relay", get(relay_upgrade))
        .with_state(state)
}

/// Serve until `shutdown` fires or the listener fails.
pub(crate) async fn serve(listener: TcpListener, state: ServerState, shutdown: CancellationToken) {
    let app = router(state);
    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
    {
        warn!(error = %err, "http server stopped");
    }
}

async fn tab_upgrade(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    upgrade(ws, state, Incoming::Tab)
}

async fn relay_upgrade(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    upgrade(ws, state, Incoming::Relay)
}

fn upgrade(
    ws: WebSocketUpgrade,
    state: ServerState,
    arrive: fn(browserfetch_transport::Connection) -> Incoming,
) -> Response {
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| async move {
            let connection = websocket::from_axum(socket);
            if state.incoming.send(arrive(connection)).await.is_err() {
                debug!("endpoint no longer accepting; dropping upgraded socket");
            }
        })
}

async fn status_report(state: &ServerState) -> Option<StatusReport> {
    let (tx, rx) = oneshot::channel();
    state.incoming.send(Incoming::Status(tx)).await.ok()?;
    rx.await.ok()
}

async fn status_page(State(state): State<ServerState>) -> Response {
    match status_report(&state).await {
        Some(report) => Html(report.to_html()).into_response(),
        None => unavailable(),
    }
}

async fn status_json(State(state): State<ServerState>) -> Response {
    match status_report(&state).await {
        Some(report) => Json(report).into_response(),
        None => unavailable(),
    }
}

fn unavailable() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "broker is not serving").into_response()
}
