//! Interactive terminal sessions.
//!
//! A [`Session`] bridges one shell exec inside an instance's container with
//! one client connection. The client side is any
//! `Sink<ServerFrame>` + `Stream<ClientFrame>` pair: WebSocket halves in the
//! server, plain channels in tests.
//!
//! # Lifecycle
//!
//! ```text
//! Requested ──▶ ExecCreated ──▶ Attached ──▶ Closing ──▶ Closed
//!     │              │
//!     └──────────────┴──▶ Failed
//! ```
//!
//! At most one session may be attached to an instance at a time.

use crate::config::SessionConfig;
use crate::error::{CoreError, Result};
use crate::instance::{InstanceId, InstancePhase, OwnerId};
use crate::locks::InstanceLocks;
use crate::registry::InstanceRegistry;
use crate::relay::{Activity, Relay, RelayContext};
use burrow_engine::{ContainerEngine, ExecInput, ExecOutput, ExecSpec};
use bytes::Bytes;
use futures::{Sink, Stream};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ============================================================================
// Frames and states
// ============================================================================

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// `terminal-input`: raw bytes typed by the user.
    Input(Bytes),
    /// Terminal window size changed.
    Resize { cols: u16, rows: u16 },
}

/// Frames sent to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    /// `terminal-output`: raw bytes produced by the shell.
    Output(Bytes),
}

/// The two halves of a client connection.
pub struct ClientConnection<Tx, Rx> {
    pub sink: Tx,
    pub stream: Rx,
}

impl<Tx, Rx> ClientConnection<Tx, Rx> {
    pub fn new(sink: Tx, stream: Rx) -> Self {
        Self { sink, stream }
    }
}

/// Unique identifier for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Requested,
    ExecCreated,
    Attached,
    Closing,
    Closed,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Requested => "requested",
            Self::ExecCreated => "exec_created",
            Self::Attached => "attached",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The client stream ended.
    ClientDisconnected,
    /// The shell's output reached end of stream.
    ProcessExited,
    /// [`Session::detach`] or [`SessionBridge::detach_all`] was called.
    Detached,
    /// No traffic for the configured idle timeout.
    IdleTimeout,
    /// The exec output stream failed.
    EngineError(String),
    /// Sending to the client failed.
    ClientError(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientDisconnected => write!(f, "client disconnected"),
            Self::ProcessExited => write!(f, "process exited"),
            Self::Detached => write!(f, "detached"),
            Self::IdleTimeout => write!(f, "idle timeout"),
            Self::EngineError(e) => write!(f, "engine error: {e}"),
            Self::ClientError(e) => write!(f, "client error: {e}"),
        }
    }
}

/// Summary published when a session closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub session_id: SessionId,
    pub instance_id: InstanceId,
    pub reason: CloseReason,
    /// Bytes written to the exec input.
    pub bytes_in: u64,
    /// Bytes delivered to the client.
    pub bytes_out: u64,
    /// Input frames dropped because the exec had no usable input side.
    pub input_rejected: u64,
}

// ============================================================================
// Session handle
// ============================================================================

/// Handle to a running session.
///
/// Dropping the handle does not end the session.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    instance_id: InstanceId,
    input_available: bool,
    cancel: CancellationToken,
    state: watch::Receiver<SessionState>,
    outcome: watch::Receiver<Option<SessionOutcome>>,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    /// Whether the exec accepted an input side. If not, input is dropped.
    pub fn input_available(&self) -> bool {
        self.input_available
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Stop relaying. Safe to call any number of times, including after close.
    pub fn detach(&self) {
        self.cancel.cancel();
    }

    /// Wait until the session has fully closed.
    pub async fn closed(&self) -> SessionOutcome {
        let mut rx = self.outcome.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(current) => current.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| SessionOutcome {
            session_id: self.id,
            instance_id: self.instance_id,
            reason: CloseReason::EngineError("session supervisor stopped".into()),
            bytes_in: 0,
            bytes_out: 0,
            input_rejected: 0,
        })
    }
}

// ============================================================================
// Exclusivity
// ============================================================================

struct ActiveEntry {
    session_id: SessionId,
    cancel: CancellationToken,
}

struct ActiveTable {
    sessions: Mutex<HashMap<InstanceId, ActiveEntry>>,
    count: watch::Sender<usize>,
}

impl ActiveTable {
    fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            count: watch::Sender::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<InstanceId, ActiveEntry>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn claim(
        self: &Arc<Self>,
        instance_id: InstanceId,
        session_id: SessionId,
        cancel: CancellationToken,
    ) -> Result<SlotGuard> {
        let mut sessions = self.lock();
        if sessions.contains_key(&instance_id) {
            return Err(CoreError::SessionBusy(instance_id));
        }
        sessions.insert(instance_id, ActiveEntry { session_id, cancel });
        self.count.send_replace(sessions.len());
        Ok(SlotGuard {
            table: self.clone(),
            instance_id,
            session_id,
        })
    }
}

/// Holds an instance's session slot; released on drop.
pub(crate) struct SlotGuard {
    table: Arc<ActiveTable>,
    instance_id: InstanceId,
    session_id: SessionId,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut sessions = self.table.lock();
        if sessions
            .get(&self.instance_id)
            .is_some_and(|e| e.session_id == self.session_id)
        {
            sessions.remove(&self.instance_id);
        }
        self.table.count.send_replace(sessions.len());
    }
}

// ============================================================================
// Bridge
// ============================================================================

struct Opened {
    slot: SlotGuard,
    cancel: CancellationToken,
    exec_id: String,
    output: ExecOutput,
    input: Option<ExecInput>,
}

/// Opens terminal sessions into running instances.
pub struct SessionBridge {
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<InstanceRegistry>,
    locks: Arc<InstanceLocks>,
    config: SessionConfig,
    active: Arc<ActiveTable>,
}

impl SessionBridge {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        registry: Arc<InstanceRegistry>,
        locks: Arc<InstanceLocks>,
        config: SessionConfig,
    ) -> Self {
        Self {
            engine,
            registry,
            locks,
            config,
            active: Arc::new(ActiveTable::new()),
        }
    }

    /// Start a shell in the instance's container and relay it to `client`.
    ///
    /// Fails without spawning anything if `requester` does not own the
    /// instance, its container is missing or stopped, another session is
    /// attached, or the exec cannot be started.
    pub async fn attach<Tx, Rx>(
        &self,
        instance_id: InstanceId,
        requester: &OwnerId,
        client: ClientConnection<Tx, Rx>,
    ) -> Result<Session>
    where
        Tx: Sink<ServerFrame> + Send + 'static,
        Tx::Error: fmt::Display + Send,
        Rx: Stream<Item = ClientFrame> + Send + 'static,
    {
        let session_id = SessionId::new();
        let (state_tx, state_rx) = watch::channel(SessionState::Requested);
        tracing::debug!(session_id = %session_id, instance_id = %instance_id, "Attach requested");

        let opened = match self.open(session_id, instance_id, requester, &state_tx).await {
            Ok(opened) => opened,
            Err(e) => {
                state_tx.send_replace(SessionState::Failed);
                tracing::warn!(session_id = %session_id, instance_id = %instance_id, error = %e, "Session failed");
                return Err(e);
            }
        };

        let input_available = opened.input.is_some();
        if !input_available {
            tracing::warn!(
                session_id = %session_id,
                error = %CoreError::InputUnavailable,
                "Exec has no input side, attaching output-only"
            );
        }

        let (outcome_tx, outcome_rx) = watch::channel(None);
        let ctx = Arc::new(RelayContext {
            session_id,
            instance_id,
            exec_id: opened.exec_id,
            engine: self.engine.clone(),
            cancel: opened.cancel.clone(),
            activity: Activity::new(),
        });
        tracing::info!(
            session_id = %session_id,
            instance_id = %instance_id,
            exec_id = %ctx.exec_id,
            input_available,
            "Session attached"
        );
        state_tx.send_replace(SessionState::Attached);

        let relay = Relay {
            ctx,
            output: opened.output,
            input: opened.input,
            sink: client.sink,
            stream: client.stream,
            max_frame_bytes: self.config.max_frame_bytes,
            idle_timeout: self.config.idle_timeout,
            slot: opened.slot,
            state: state_tx,
            outcome: outcome_tx,
        };
        tokio::spawn(relay.supervise());

        Ok(Session {
            id: session_id,
            instance_id,
            input_available,
            cancel: opened.cancel,
            state: state_rx,
            outcome: outcome_rx,
        })
    }

    async fn open(
        &self,
        session_id: SessionId,
        instance_id: InstanceId,
        requester: &OwnerId,
        state: &watch::Sender<SessionState>,
    ) -> Result<Opened> {
        let instance = self.registry.find_owned(instance_id, requester).await?;
        if instance.phase == InstancePhase::TeardownPending {
            return Err(CoreError::TeardownPending(instance_id));
        }
        let container_id = instance
            .container_id()
            .ok_or(CoreError::NotProvisioned(instance_id))?;

        let cancel = CancellationToken::new();
        let slot = self.active.claim(instance_id, session_id, cancel.clone())?;
        let _guard = self.locks.lock(instance_id).await;

        let status = self.engine.inspect(container_id).await?;
        if !status.is_running() {
            return Err(CoreError::ContainerNotRunning {
                instance: instance_id,
                state: status.state.to_string(),
            });
        }

        let exec_id = self
            .engine
            .exec_create(container_id, &ExecSpec::interactive_shell(&self.config.shell))
            .await?;
        state.send_replace(SessionState::ExecCreated);
        tracing::debug!(session_id = %session_id, exec_id = %exec_id, "Exec created");

        let (exec_id, output, input) = self.engine.exec_start(&exec_id).await?.into_parts();
        Ok(Opened {
            slot,
            cancel,
            exec_id,
            output,
            input,
        })
    }

    /// Number of attached sessions.
    pub fn active_sessions(&self) -> usize {
        self.active.lock().len()
    }

    /// Whether a session is attached to `instance_id`.
    pub fn is_attached(&self, instance_id: InstanceId) -> bool {
        self.active.lock().contains_key(&instance_id)
    }

    /// Detach every session. Returns how many were signalled.
    pub fn detach_all(&self) -> usize {
        let sessions = self.active.lock();
        for entry in sessions.values() {
            entry.cancel.cancel();
        }
        if !sessions.is_empty() {
            tracing::info!(count = sessions.len(), "Detaching all sessions");
        }
        sessions.len()
    }

    /// Wait until no sessions remain, up to `timeout`. Returns `false` on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let mut count = self.active.count.subscribe();
        let drained = tokio::time::timeout(timeout, count.wait_for(|n| *n == 0))
            .await
            .is_ok();
        drained
    }
}
