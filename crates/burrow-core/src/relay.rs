//! Relay tasks moving terminal bytes between an exec channel and a client.

use crate::error::CoreError;
use crate::instance::InstanceId;
use crate::session::{
    ClientFrame, CloseReason, ServerFrame, SessionId, SessionOutcome, SessionState, SlotGuard,
};
use burrow_engine::{ContainerEngine, ExecInput, ExecOutput};
use bytes::{Bytes, BytesMut};
use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How long closing the client sink may take once a session ends.
const SINK_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound on one TTY resize round trip.
const RESIZE_TIMEOUT: Duration = Duration::from_secs(5);

/// Last time bytes moved in either direction.
pub(crate) struct Activity {
    last: Mutex<Instant>,
}

impl Activity {
    pub(crate) fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn last(&self) -> Instant {
        *self.last.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// State shared by the relay tasks of one session.
pub(crate) struct RelayContext {
    pub session_id: SessionId,
    pub instance_id: InstanceId,
    pub exec_id: String,
    pub engine: Arc<dyn ContainerEngine>,
    pub cancel: CancellationToken,
    pub activity: Activity,
}

/// Everything the supervisor takes ownership of.
pub(crate) struct Relay<Tx, Rx> {
    pub ctx: Arc<RelayContext>,
    pub output: ExecOutput,
    pub input: Option<ExecInput>,
    pub sink: Tx,
    pub stream: Rx,
    pub max_frame_bytes: usize,
    pub idle_timeout: Option<Duration>,
    pub slot: SlotGuard,
    pub state: watch::Sender<SessionState>,
    pub outcome: watch::Sender<Option<SessionOutcome>>,
}

struct InputSummary {
    end: Option<CloseReason>,
    bytes_in: u64,
    rejected: u64,
}

impl<Tx, Rx> Relay<Tx, Rx>
where
    Tx: Sink<ServerFrame> + Send + 'static,
    Tx::Error: fmt::Display + Send,
    Rx: Stream<Item = ClientFrame> + Send + 'static,
{
    /// Run both directions until one ends, then tear the other down.
    pub(crate) async fn supervise(self) {
        let Relay {
            ctx,
            output,
            input,
            sink,
            stream,
            max_frame_bytes,
            idle_timeout,
            slot,
            state,
            outcome,
        } = self;
        let started = Instant::now();

        let mut output_task = tokio::spawn(pump_output(ctx.clone(), output, sink, max_frame_bytes));
        let mut input_task = tokio::spawn(pump_input(ctx.clone(), stream, input));

        let mut bytes_out = None;
        let mut input_summary = None;
        let reason = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => CloseReason::Detached,
            res = &mut output_task => {
                let (end, n) = output_result(res);
                bytes_out = Some(n);
                end.unwrap_or(CloseReason::Detached)
            }
            res = &mut input_task => {
                let summary = input_result(res);
                let end = summary.end.clone().unwrap_or(CloseReason::Detached);
                input_summary = Some(summary);
                end
            }
            _ = idle_expired(&ctx.activity, idle_timeout) => CloseReason::IdleTimeout,
        };

        state.send_replace(SessionState::Closing);
        tracing::debug!(session_id = %ctx.session_id, reason = %reason, "Session closing");
        ctx.cancel.cancel();

        let bytes_out = match bytes_out {
            Some(n) => n,
            None => output_result(output_task.await).1,
        };
        let input_summary = match input_summary {
            Some(summary) => summary,
            None => input_result(input_task.await),
        };
        drop(slot);

        let result = SessionOutcome {
            session_id: ctx.session_id,
            instance_id: ctx.instance_id,
            reason,
            bytes_in: input_summary.bytes_in,
            bytes_out,
            input_rejected: input_summary.rejected,
        };
        tracing::info!(
            session_id = %ctx.session_id,
            instance_id = %ctx.instance_id,
            reason = %result.reason,
            bytes_in = result.bytes_in,
            bytes_out = result.bytes_out,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Session closed"
        );
        outcome.send_replace(Some(result));
        state.send_replace(SessionState::Closed);
    }
}

fn output_result(res: Result<(Option<CloseReason>, u64), JoinError>) -> (Option<CloseReason>, u64) {
    res.unwrap_or_else(|e| {
        tracing::error!(error = %e, "Output relay task failed");
        (Some(CloseReason::EngineError("output relay aborted".into())), 0)
    })
}

fn input_result(res: Result<InputSummary, JoinError>) -> InputSummary {
    res.unwrap_or_else(|e| {
        tracing::error!(error = %e, "Input relay task failed");
        InputSummary {
            end: Some(CloseReason::ClientError("input relay aborted".into())),
            bytes_in: 0,
            rejected: 0,
        }
    })
}

async fn idle_expired(activity: &Activity, timeout: Option<Duration>) {
    let Some(timeout) = timeout else {
        return std::future::pending::<()>().await;
    };
    loop {
        let deadline = activity.last() + timeout;
        if Instant::now() >= deadline {
            return;
        }
        tokio::time::sleep_until(deadline).await;
    }
}

// ============================================================================
// Engine -> client
// ============================================================================

/// Forward engine output to the client, in order, until end of stream.
///
/// Returns `None` as the end reason when stopped by cancellation.
async fn pump_output<Tx>(
    ctx: Arc<RelayContext>,
    mut output: ExecOutput,
    sink: Tx,
    max_frame_bytes: usize,
) -> (Option<CloseReason>, u64)
where
    Tx: Sink<ServerFrame> + Send + 'static,
    Tx::Error: fmt::Display + Send,
{
    let mut sink = Box::pin(sink);
    let mut bytes_out = 0u64;

    let end = loop {
        let next = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break None,
            next = output.next() => next,
        };
        let first = match next {
            None => break Some(CloseReason::ProcessExited),
            Some(Err(e)) => break Some(CloseReason::EngineError(e.to_string())),
            Some(Ok(chunk)) => chunk,
        };

        let (frame, pending_end) = coalesce(first, &mut output, max_frame_bytes);
        if !frame.is_empty() {
            let len = frame.len();
            let sent = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => break None,
                sent = sink.send(ServerFrame::Output(frame)) => sent,
            };
            if let Err(e) = sent {
                break Some(CloseReason::ClientError(e.to_string()));
            }
            bytes_out += len as u64;
            ctx.activity.touch();
            tracing::trace!(session_id = %ctx.session_id, bytes = len, "Relayed output");
        }
        if let Some(end) = pending_end {
            break Some(end);
        }
    };

    // Releases the exec output side before the client is told.
    drop(output);
    match tokio::time::timeout(SINK_CLOSE_TIMEOUT, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(session_id = %ctx.session_id, error = %e, "Client sink close failed"),
        Err(_) => tracing::debug!(session_id = %ctx.session_id, "Client sink close timed out"),
    }
    (end, bytes_out)
}

/// Merge chunks that are already buffered behind `first`, up to `max` bytes.
fn coalesce(first: Bytes, output: &mut ExecOutput, max: usize) -> (Bytes, Option<CloseReason>) {
    let mut end = None;
    let mut frame: Option<BytesMut> = None;
    let mut len = first.len();

    while len < max {
        let more = match output.next().now_or_never() {
            Some(Some(Ok(more))) => more,
            Some(Some(Err(e))) => {
                end = Some(CloseReason::EngineError(e.to_string()));
                break;
            }
            Some(None) => {
                end = Some(CloseReason::ProcessExited);
                break;
            }
            None => break,
        };
        let buf = frame.get_or_insert_with(|| BytesMut::from(&first[..]));
        buf.extend_from_slice(&more);
        len = buf.len();
    }

    match frame {
        Some(buf) => (buf.freeze(), end),
        None => (first, end),
    }
}

// ============================================================================
// Client -> engine
// ============================================================================

/// Forward client frames to the exec input, in order, until the client goes away.
///
/// The engine input half is shut down on every exit path.
async fn pump_input<Rx>(
    ctx: Arc<RelayContext>,
    stream: Rx,
    mut input: Option<ExecInput>,
) -> InputSummary
where
    Rx: Stream<Item = ClientFrame> + Send + 'static,
{
    let mut stream = Box::pin(stream);
    let mut bytes_in = 0u64;
    let mut rejected = 0u64;

    let end = loop {
        let frame = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break None,
            frame = stream.next() => frame,
        };

        match frame {
            None => break Some(CloseReason::ClientDisconnected),
            Some(ClientFrame::Input(data)) => {
                ctx.activity.touch();
                let Some(writer) = input.as_mut() else {
                    rejected += 1;
                    tracing::warn!(
                        session_id = %ctx.session_id,
                        bytes = data.len(),
                        error = %CoreError::InputUnavailable,
                        "Dropped terminal input"
                    );
                    continue;
                };
                let written = tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => break None,
                    written = write_frame(writer, &data) => written,
                };
                match written {
                    Ok(()) => {
                        bytes_in += data.len() as u64;
                        tracing::trace!(session_id = %ctx.session_id, bytes = data.len(), "Relayed input");
                    }
                    Err(e) => {
                        rejected += 1;
                        tracing::warn!(
                            session_id = %ctx.session_id,
                            error = %e,
                            "Exec input closed, session is now output-only"
                        );
                        input = None;
                    }
                }
            }
            Some(ClientFrame::Resize { cols, rows }) => {
                let resize = ctx.engine.exec_resize(&ctx.exec_id, cols, rows);
                let resized = tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => break None,
                    resized = tokio::time::timeout(RESIZE_TIMEOUT, resize) => resized,
                };
                match resized {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::debug!(session_id = %ctx.session_id, cols, rows, error = %e, "Resize failed");
                    }
                    Err(_) => {
                        tracing::debug!(session_id = %ctx.session_id, cols, rows, "Resize timed out");
                    }
                }
            }
        }
    };

    if let Some(mut writer) = input.take() {
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(session_id = %ctx.session_id, error = %e, "Exec input shutdown failed");
        }
    }
    InputSummary {
        end,
        bytes_in,
        rejected,
    }
}

async fn write_frame(writer: &mut ExecInput, data: &[u8]) -> std::io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_engine::EngineError;

    fn output_of(items: Vec<burrow_engine::Result<Bytes>>) -> ExecOutput {
        futures::stream::iter(items).boxed()
    }

    #[test]
    fn test_coalesce_merges_ready_chunks() {
        let mut output = output_of(vec![Ok(Bytes::from("b")), Ok(Bytes::from("c"))]);
        let (frame, end) = coalesce(Bytes::from("a"), &mut output, 1024);
        assert_eq!(frame, Bytes::from("abc"));
        assert_eq!(end, Some(CloseReason::ProcessExited));
    }

    #[test]
    fn test_coalesce_respects_bound() {
        let mut output = output_of(vec![
            Ok(Bytes::from("def")),
            Ok(Bytes::from("gh")),
        ]);
        let (frame, end) = coalesce(Bytes::from("abc"), &mut output, 4);
        assert_eq!(frame, Bytes::from("abcdef"));
        assert!(end.is_none());

        let (frame, _) = coalesce(Bytes::from("12345"), &mut output, 4);
        assert_eq!(frame, Bytes::from("12345"));
    }

    #[test]
    fn test_coalesce_keeps_bytes_before_error() {
        let mut output = output_of(vec![
            Ok(Bytes::from("b")),
            Err(EngineError::Stream("reset".into())),
        ]);
        let (frame, end) = coalesce(Bytes::from("a"), &mut output, 1024);
        assert_eq!(frame, Bytes::from("ab"));
        assert!(matches!(end, Some(CloseReason::EngineError(ref m)) if m.contains("reset")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_deadline_moves_with_activity() {
        let activity = Activity::new();
        let timeout = Some(Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(8)).await;
        activity.touch();

        let waited = Instant::now();
        idle_expired(&activity, timeout).await;
        assert!(waited.elapsed() >= Duration::from_secs(10));
    }
}
