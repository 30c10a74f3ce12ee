//! In-memory container engine for tests.
//!
//! Containers are plain records; exec channels are backed by an unbounded
//! channel (output) and a `tokio::io::duplex` pipe (input), so tests can
//! play the role of the process inside the container through
//! [`FakeProcess`].

use crate::config::{ContainerSpec, ExecSpec};
use crate::engine::{ContainerEngine, ContainerStatus, ContainerSummary, ExecChannel, RawState};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::mpsc;

/// Capacity of the fake stdin pipe.
const INPUT_PIPE_BYTES: usize = 64 * 1024;

/// Engine operations that can be scripted to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    ListAll,
    Create,
    Start,
    Stop,
    Restart,
    Remove,
    Inspect,
    ExecCreate,
    ExecStart,
    ExecResize,
}

/// Failure injected by [`FakeEngine::fail_next`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeFailure {
    Unavailable,
    NotFound,
    Rejected(u16),
}

impl FakeFailure {
    fn into_error(self, op: FakeOp) -> EngineError {
        match self {
            Self::Unavailable => EngineError::Unavailable(format!("injected {op:?} failure")),
            Self::NotFound => EngineError::ContainerNotFound(format!("injected {op:?} failure")),
            Self::Rejected(status) => EngineError::Rejected {
                status,
                message: format!("injected {op:?} failure"),
            },
        }
    }
}

#[derive(Debug)]
struct FakeContainer {
    spec: ContainerSpec,
    state: RawState,
}

#[derive(Debug)]
struct FakeExec {
    container_id: String,
    started: bool,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    containers: HashMap<String, FakeContainer>,
    execs: HashMap<String, FakeExec>,
    processes: VecDeque<FakeProcess>,
    failures: HashMap<FakeOp, VecDeque<FakeFailure>>,
    calls: Vec<String>,
    resizes: Vec<(String, u16, u16)>,
    exec_without_input: bool,
    resize_delay: Option<Duration>,
}

/// The container-side end of an exec started on a [`FakeEngine`].
pub struct FakeProcess {
    pub exec_id: String,
    output: mpsc::UnboundedSender<Result<Bytes>>,
    input: DuplexStream,
}

impl FakeProcess {
    /// Emit bytes on the process output.
    pub fn emit(&self, bytes: impl Into<Bytes>) -> bool {
        self.output.send(Ok(bytes.into())).is_ok()
    }

    /// Emit an error on the output stream.
    pub fn fail(&self, message: &str) -> bool {
        self.output
            .send(Err(EngineError::Stream(message.to_string())))
            .is_ok()
    }

    /// Whether the attached side has dropped the output stream.
    pub fn output_released(&self) -> bool {
        self.output.is_closed()
    }

    /// Read exactly `n` bytes of stdin.
    pub async fn read_input(&mut self, n: usize) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.input.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Read stdin until the attached side closes it.
    pub async fn read_input_to_end(&mut self) -> std::io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.input.read_to_end(&mut buf).await?;
        Ok(buf)
    }

    /// Simulate the process exiting: output reaches end-of-stream.
    pub fn exit(self) {}
}

/// In-memory [`ContainerEngine`].
#[derive(Clone, Default)]
pub struct FakeEngine {
    inner: Arc<Mutex<Inner>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next call of `op` fail. Multiple calls queue up.
    pub fn fail_next(&self, op: FakeOp, failure: FakeFailure) {
        self.lock().failures.entry(op).or_default().push_back(failure);
    }

    /// Start subsequent execs without a writable input side.
    pub fn set_exec_without_input(&self, without: bool) {
        self.lock().exec_without_input = without;
    }

    /// Make `exec_resize` take `delay` before answering.
    pub fn set_resize_delay(&self, delay: Duration) {
        self.lock().resize_delay = Some(delay);
    }

    /// Force a container into `state`, as if changed outside burrow.
    pub fn set_state(&self, container_id: &str, state: RawState) {
        if let Some(c) = self.lock().containers.get_mut(container_id) {
            c.state = state;
        }
    }

    /// Remove a container behind the caller's back.
    pub fn forget(&self, container_id: &str) {
        self.lock().containers.remove(container_id);
    }

    /// Whether a container exists.
    pub fn exists(&self, container_id: &str) -> bool {
        self.lock().containers.contains_key(container_id)
    }

    /// Current state of a container.
    pub fn state_of(&self, container_id: &str) -> Option<RawState> {
        self.lock()
            .containers
            .get(container_id)
            .map(|c| c.state.clone())
    }

    /// The spec a container was created from.
    pub fn spec_of(&self, container_id: &str) -> Option<ContainerSpec> {
        self.lock()
            .containers
            .get(container_id)
            .map(|c| c.spec.clone())
    }

    /// Number of containers.
    pub fn container_count(&self) -> usize {
        self.lock().containers.len()
    }

    /// Recorded calls, e.g. `"stop fake-1"`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Number of recorded calls whose name starts with `prefix`.
    pub fn call_count(&self, prefix: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Recorded TTY resizes as `(exec_id, cols, rows)`.
    pub fn resizes(&self) -> Vec<(String, u16, u16)> {
        self.lock().resizes.clone()
    }

    /// Take the oldest started process not yet handed out.
    pub fn take_process(&self) -> Option<FakeProcess> {
        self.lock().processes.pop_front()
    }

    /// Wait until an exec has been started and take its process end.
    pub async fn next_process(&self) -> FakeProcess {
        loop {
            if let Some(p) = self.take_process() {
                return p;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn record(&self, op: FakeOp, call: String) -> Result<()> {
        let mut inner = self.lock();
        inner.calls.push(call);
        match inner.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(failure) => Err(failure.into_error(op)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn list_all(&self) -> Result<Vec<ContainerSummary>> {
        self.record(FakeOp::ListAll, "list_all".into())?;
        Ok(self
            .lock()
            .containers
            .iter()
            .map(|(id, c)| ContainerSummary {
                id: id.clone(),
                names: vec![c.spec.name.clone()],
                image: c.spec.image.clone(),
                state: c.state.clone(),
                labels: c.spec.labels.clone(),
            })
            .collect())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        self.record(FakeOp::Create, format!("create {}", spec.name))?;
        let mut inner = self.lock();
        if inner.containers.values().any(|c| c.spec.name == spec.name) {
            return Err(EngineError::Rejected {
                status: 409,
                message: format!("name {} already in use", spec.name),
            });
        }
        inner.next_id += 1;
        let id = format!("fake-{}", inner.next_id);
        inner.containers.insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                state: RawState::Created,
            },
        );
        Ok(id)
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        self.record(FakeOp::Start, format!("start {container_id}"))?;
        let mut inner = self.lock();
        let c = inner
            .containers
            .get_mut(container_id)
            .ok_or_else(|| EngineError::ContainerNotFound(container_id.to_string()))?;
        c.state = RawState::Running;
        Ok(())
    }

    async fn stop(&self, container_id: &str, _grace: Duration) -> Result<()> {
        self.record(FakeOp::Stop, format!("stop {container_id}"))?;
        let mut inner = self.lock();
        let c = inner
            .containers
            .get_mut(container_id)
            .ok_or_else(|| EngineError::ContainerNotFound(container_id.to_string()))?;
        if c.state == RawState::Running || c.state == RawState::Restarting {
            c.state = RawState::Exited;
        }
        Ok(())
    }

    async fn restart(&self, container_id: &str, _grace: Duration) -> Result<()> {
        self.record(FakeOp::Restart, format!("restart {container_id}"))?;
        let mut inner = self.lock();
        let c = inner
            .containers
            .get_mut(container_id)
            .ok_or_else(|| EngineError::ContainerNotFound(container_id.to_string()))?;
        c.state = RawState::Running;
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        self.record(FakeOp::Remove, format!("remove {container_id}"))?;
        let mut inner = self.lock();
        match inner.containers.get(container_id) {
            None => Err(EngineError::ContainerNotFound(container_id.to_string())),
            Some(c) if c.state == RawState::Running => Err(EngineError::Rejected {
                status: 409,
                message: "cannot remove a running container".into(),
            }),
            Some(_) => {
                inner.containers.remove(container_id);
                Ok(())
            }
        }
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerStatus> {
        self.record(FakeOp::Inspect, format!("inspect {container_id}"))?;
        let inner = self.lock();
        let c = inner
            .containers
            .get(container_id)
            .ok_or_else(|| EngineError::ContainerNotFound(container_id.to_string()))?;
        Ok(ContainerStatus {
            id: container_id.to_string(),
            state: c.state.clone(),
            exit_code: (c.state == RawState::Exited).then_some(0),
            started_at: None,
        })
    }

    async fn exec_create(&self, container_id: &str, spec: &ExecSpec) -> Result<String> {
        self.record(
            FakeOp::ExecCreate,
            format!("exec_create {container_id} {}", spec.cmd.join(" ")),
        )?;
        let mut inner = self.lock();
        let c = inner
            .containers
            .get(container_id)
            .ok_or_else(|| EngineError::ContainerNotFound(container_id.to_string()))?;
        if c.state != RawState::Running {
            return Err(EngineError::Rejected {
                status: 409,
                message: format!("container {container_id} is not running"),
            });
        }
        inner.next_id += 1;
        let exec_id = format!("exec-{}", inner.next_id);
        inner.execs.insert(
            exec_id.clone(),
            FakeExec {
                container_id: container_id.to_string(),
                started: false,
            },
        );
        Ok(exec_id)
    }

    async fn exec_start(&self, exec_id: &str) -> Result<ExecChannel> {
        self.record(FakeOp::ExecStart, format!("exec_start {exec_id}"))?;
        let mut inner = self.lock();
        let exec = inner
            .execs
            .get_mut(exec_id)
            .ok_or_else(|| EngineError::ContainerNotFound(format!("no such exec: {exec_id}")))?;
        if exec.started {
            return Err(EngineError::Rejected {
                status: 409,
                message: format!("exec {exec_id} already started"),
            });
        }
        exec.started = true;
        tracing::trace!(exec_id = %exec_id, container_id = %exec.container_id, "Fake exec started");

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (client_side, process_side) = tokio::io::duplex(INPUT_PIPE_BYTES);
        let output = futures::stream::unfold(output_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();

        let input = if inner.exec_without_input {
            None
        } else {
            Some(Box::pin(client_side) as crate::engine::ExecInput)
        };

        inner.processes.push_back(FakeProcess {
            exec_id: exec_id.to_string(),
            output: output_tx,
            input: process_side,
        });

        Ok(ExecChannel {
            exec_id: exec_id.to_string(),
            output,
            input,
        })
    }

    async fn exec_resize(&self, exec_id: &str, cols: u16, rows: u16) -> Result<()> {
        self.record(FakeOp::ExecResize, format!("exec_resize {exec_id}"))?;
        let delay = self.lock().resize_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.lock().resizes.push((exec_id.to_string(), cols, rows));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_fake_lifecycle() {
        let engine = FakeEngine::new();
        let id = engine
            .create(&ContainerSpec::new("alpine:latest", "a"))
            .await
            .unwrap();
        assert_eq!(engine.state_of(&id), Some(RawState::Created));

        engine.start(&id).await.unwrap();
        assert!(engine.inspect(&id).await.unwrap().is_running());

        assert!(matches!(
            engine.remove(&id).await,
            Err(EngineError::Rejected { status: 409, .. })
        ));
        engine.stop(&id, Duration::from_secs(1)).await.unwrap();
        engine.remove(&id).await.unwrap();
        assert!(!engine.exists(&id));
        assert!(matches!(
            engine.inspect(&id).await,
            Err(EngineError::ContainerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fake_duplicate_name_rejected() {
        let engine = FakeEngine::new();
        let spec = ContainerSpec::new("alpine:latest", "same");
        engine.create(&spec).await.unwrap();
        assert!(matches!(
            engine.create(&spec).await,
            Err(EngineError::Rejected { status: 409, .. })
        ));
    }

    #[tokio::test]
    async fn test_fake_injected_failure_is_one_shot() {
        let engine = FakeEngine::new();
        engine.fail_next(FakeOp::ListAll, FakeFailure::Unavailable);
        assert!(matches!(
            engine.list_all().await,
            Err(EngineError::Unavailable(_))
        ));
        assert!(engine.list_all().await.is_ok());
    }

    #[tokio::test]
    async fn test_fake_exec_round_trip() {
        let engine = FakeEngine::new();
        let id = engine
            .create(&ContainerSpec::new("alpine:latest", "a"))
            .await
            .unwrap();
        engine.start(&id).await.unwrap();

        let exec_id = engine
            .exec_create(&id, &ExecSpec::interactive_shell("/bin/sh"))
            .await
            .unwrap();
        let channel = engine.exec_start(&exec_id).await.unwrap();
        let (_, mut output, input) = channel.into_parts();
        let mut input = input.expect("input side");
        let mut process = engine.take_process().expect("process");

        input.write_all(b"echo hi\n").await.unwrap();
        assert_eq!(process.read_input(8).await.unwrap(), b"echo hi\n");

        assert!(process.emit(Bytes::from_static(b"hi\n")));
        let chunk = output.next().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"hi\n");

        drop(output);
        assert!(process.output_released());
    }

    #[tokio::test]
    async fn test_fake_exec_requires_running_container() {
        let engine = FakeEngine::new();
        let id = engine
            .create(&ContainerSpec::new("alpine:latest", "a"))
            .await
            .unwrap();
        assert!(matches!(
            engine
                .exec_create(&id, &ExecSpec::interactive_shell("/bin/sh"))
                .await,
            Err(EngineError::Rejected { status: 409, .. })
        ));
    }
}
