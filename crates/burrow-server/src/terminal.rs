//! WebSocket glue between a browser terminal and a [`SessionBridge`] session.
//!
//! Output is sent as binary frames. Input arrives either as binary frames
//! (raw keystrokes) or as JSON text frames, see [`TerminalMessage`]. The
//! server always ends the socket with a close frame whose reason says why
//! the session ended or could not start.
//!
//! [`SessionBridge`]: burrow_core::SessionBridge

use crate::auth::Caller;
use crate::http::{core_status, parse_instance_id, ApiError, AppState};
use crate::types::TerminalMessage;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use burrow_core::{
    ClientConnection, ClientFrame, CloseReason, CoreError, InstanceId, InstancePhase, OwnerId,
    RuntimeStatus, ServerFrame,
};
use bytes::Bytes;
use futures::channel::mpsc;
use futures::{stream, SinkExt, StreamExt};

/// Output frames buffered between the session and the socket writer.
const OUTPUT_BUFFER: usize = 32;

/// WebSocket close reasons are limited to 123 bytes.
const MAX_CLOSE_REASON: usize = 123;

/// `GET /instances/:id/terminal`
///
/// Ownership and container state are checked before the upgrade so that
/// refusals reach the client as ordinary HTTP errors.
pub async fn terminal_handler(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let id = parse_instance_id(&id)?;
    let owner = caller.owner().clone();
    precheck(&state, id, &owner).await?;

    Ok(ws.on_upgrade(move |socket| run_session(state, id, owner, socket)))
}

pub(crate) async fn precheck(
    state: &AppState,
    id: InstanceId,
    owner: &OwnerId,
) -> Result<(), ApiError> {
    let instance = state.controller.get(id, owner).await?;
    if instance.phase == InstancePhase::TeardownPending {
        return Err(CoreError::TeardownPending(id).into());
    }
    if state.bridge.is_attached(id) {
        return Err(CoreError::SessionBusy(id).into());
    }
    let status = state.controller.query_status(id, owner).await?;
    if status != RuntimeStatus::Running {
        return Err(CoreError::ContainerNotRunning {
            instance: id,
            state: status.to_string(),
        }
        .into());
    }
    Ok(())
}

async fn run_session(state: AppState, id: InstanceId, owner: OwnerId, socket: WebSocket) {
    let (mut ws_tx, ws_rx) = socket.split();
    let (frame_tx, mut frame_rx) = mpsc::channel::<ServerFrame>(OUTPUT_BUFFER);

    let frames = stream::unfold(ws_rx, |mut rx| async move {
        loop {
            match rx.next().await {
                Some(Ok(msg)) => match decode(msg) {
                    Decoded::Frame(frame) => return Some((frame, rx)),
                    Decoded::Skip => continue,
                    Decoded::Close => return None,
                },
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "WebSocket receive error");
                    return None;
                }
                None => return None,
            }
        }
    });

    // The pre-upgrade check can race with another attach or a shutdown.
    let session = match state
        .bridge
        .attach(id, &owner, ClientConnection::new(frame_tx, frames))
        .await
    {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(instance_id = %id, error = %e, "Terminal attach failed after upgrade");
            let _ = ws_tx.send(attach_failed_close(&e)).await;
            return;
        }
    };

    while let Some(ServerFrame::Output(bytes)) = frame_rx.next().await {
        if let Err(e) = ws_tx.send(Message::Binary(bytes.to_vec())).await {
            tracing::debug!(session_id = %session.id(), error = %e, "WebSocket send failed");
            break;
        }
    }
    // A failed send leaves the session to notice through its own sink.
    drop(frame_rx);

    let outcome = session.closed().await;
    let _ = ws_tx.send(session_ended_close(&outcome.reason)).await;
    tracing::debug!(
        session_id = %outcome.session_id,
        reason = %outcome.reason,
        "Terminal connection finished"
    );
}

fn close_message(code: u16, reason: String) -> Message {
    let mut end = reason.len().min(MAX_CLOSE_REASON);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    let mut reason = reason;
    reason.truncate(end);
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

fn attach_failed_close(err: &CoreError) -> Message {
    let code = if core_status(err).is_server_error() {
        close_code::ERROR
    } else {
        close_code::POLICY
    };
    close_message(code, err.to_string())
}

fn session_ended_close(reason: &CloseReason) -> Message {
    let code = match reason {
        CloseReason::EngineError(_) => close_code::ERROR,
        CloseReason::Detached => close_code::AWAY,
        _ => close_code::NORMAL,
    };
    close_message(code, reason.to_string())
}

#[derive(Debug, PartialEq, Eq)]
enum Decoded {
    Frame(ClientFrame),
    Skip,
    Close,
}

fn decode(msg: Message) -> Decoded {
    match msg {
        Message::Binary(data) => Decoded::Frame(ClientFrame::Input(Bytes::from(data))),
        Message::Text(text) => match serde_json::from_str::<TerminalMessage>(&text) {
            Ok(TerminalMessage::TerminalInput { data }) => {
                Decoded::Frame(ClientFrame::Input(Bytes::from(data)))
            }
            Ok(TerminalMessage::Resize { cols, rows }) => {
                Decoded::Frame(ClientFrame::Resize { cols, rows })
            }
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed terminal message");
                Decoded::Skip
            }
        },
        Message::Close(_) => Decoded::Close,
        Message::Ping(_) | Message::Pong(_) => Decoded::Skip,
    }
}
