use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::{
    bridge::{ClientEvent, Outbound, SessionContext, run_session},
    protocol::{ClientFrame, ServerFrame},
    shell::{ShellLauncher, TermSize},
};

const INBOUND_BUFFER: usize = 64;
const OUTBOUND_BUFFER: usize = 256;

pub struct ServerState<L> {
    pub sessions: SessionContext<L>,
    /// Applied to both frames and whole messages.
    pub max_message_bytes: usize,
}

pub fn router<L: ShellLauncher>(state: Arc<ServerState<L>>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/healthz", get(healthz::<L>))
        .route("/ws", get(session_ws::<L>))
        .with_state(state)
}

async fn index() -> &'static str {
    "cloudshell: connect a terminal to /ws\n"
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    vm: &'static str,
    vm_exit_code: Option<i32>,
}

async fn healthz<L: ShellLauncher>(State(state): State<Arc<ServerState<L>>>) -> Json<HealthzResponse> {
    let vm = state.sessions.vm_state();
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        vm: vm.label(),
        vm_exit_code: match vm {
            cloudshell_process::VmState::Exited(code) => code,
            _ => None,
        },
    })
}

async fn session_ws<L: ShellLauncher>(
    State(state): State<Arc<ServerState<L>>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let limit = state.max_message_bytes;
    // Oversized messages fail inside the websocket codec and end the connection.
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| handle_socket(state, socket))
}

/// What a text message asks the reader to do.
#[derive(Debug, PartialEq, Eq)]
enum Decoded {
    Event(ClientEvent),
    /// The next binary message is the body of this upload.
    AwaitBody { id: String, name: String },
    /// Send straight back without involving the session.
    Reply(ServerFrame),
    Ignore,
}

fn decode_text(text: &str) -> Decoded {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::debug!(error = %err, "ignoring malformed client frame");
            return Decoded::Ignore;
        }
    };
    match frame {
        ClientFrame::Data { data } => Decoded::Event(ClientEvent::Data(data.into_bytes())),
        ClientFrame::Resize { cols, rows } => {
            Decoded::Event(ClientEvent::Resize(TermSize { cols, rows }))
        }
        ClientFrame::Upload {
            id,
            name,
            payload_b64: None,
        } => Decoded::AwaitBody { id, name },
        ClientFrame::Upload {
            id,
            name,
            payload_b64: Some(b64),
        } => match base64::engine::general_purpose::STANDARD.decode(b64.as_bytes()) {
            Ok(payload) => Decoded::Event(ClientEvent::Upload { id, name, payload }),
            Err(err) => Decoded::Reply(ServerFrame::upload_result(
                id,
                &Err(cloudshell_core::Error::Validation(format!(
                    "payload is not base64: {err}"
                ))),
            )),
        },
        ClientFrame::Unknown => Decoded::Ignore,
    }
}

async fn handle_socket<L: ShellLauncher>(state: Arc<ServerState<L>>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(OUTBOUND_BUFFER);
    let (in_tx, in_rx) = mpsc::channel::<ClientEvent>(INBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(out) = out_rx.recv().await {
            let msg = match out {
                Outbound::Data(bytes) => Message::Binary(bytes),
                Outbound::Frame(frame) => match serde_json::to_string(&frame) {
                    Ok(text) => Message::Text(text),
                    Err(_) => continue,
                },
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let replies = out_tx.clone();
    let reader = tokio::spawn(async move {
        let mut pending_upload: Option<(String, String)> = None;
        while let Some(msg) = stream.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(err) => {
                    tracing::info!(error = %err, "client transport failed");
                    break;
                }
            };
            let ev = match msg {
                Message::Binary(bytes) => match pending_upload.take() {
                    Some((id, name)) => ClientEvent::Upload {
                        id,
                        name,
                        payload: bytes,
                    },
                    None => ClientEvent::Data(bytes),
                },
                Message::Text(text) => match decode_text(&text) {
                    Decoded::Event(ev) => ev,
                    Decoded::AwaitBody { id, name } => {
                        pending_upload = Some((id, name));
                        continue;
                    }
                    Decoded::Reply(frame) => {
                        let _ = replies.send(Outbound::Frame(frame)).await;
                        continue;
                    }
                    Decoded::Ignore => continue,
                },
                Message::Close(_) => break,
                _ => continue,
            };
            if in_tx.send(ev).await.is_err() {
                break;
            }
        }
    });

    let outcome = run_session(&state.sessions, in_rx, out_tx).await;
    tracing::debug!(?outcome, "websocket session done");
    reader.abort();
    let _ = writer.await;
}
