//! Integration tests for burrow-engine.
//!
//! These tests require:
//! - A reachable Docker daemon
//! - Permission to pull `alpine:latest`
//!
//! Run with: `cargo test -p burrow-engine -- --ignored`

use burrow_engine::{ContainerEngine, ContainerSpec, DockerEngine, EngineError, ExecSpec};
use futures::StreamExt;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

const IMAGE: &str = "alpine:latest";

fn unique_name() -> String {
    format!("burrow-test-{}", uuid::Uuid::new_v4())
}

async fn engine() -> DockerEngine {
    let engine = DockerEngine::connect_local().expect("Failed to build Docker client");
    engine.ping().await.expect("Docker daemon not reachable");
    engine
}

/// create -> start -> inspect -> stop -> remove
#[tokio::test]
#[ignore = "requires a running Docker daemon"]
async fn test_container_lifecycle() {
    let engine = engine().await;
    let id = engine
        .create(&ContainerSpec::new(IMAGE, unique_name()))
        .await
        .expect("Failed to create container");

    engine.start(&id).await.expect("Failed to start container");
    assert!(engine.inspect(&id).await.unwrap().is_running());

    let listed = engine.list_all().await.unwrap();
    assert!(listed.iter().any(|c| c.id == id));

    engine
        .stop(&id, Duration::from_secs(1))
        .await
        .expect("Failed to stop container");
    assert!(!engine.inspect(&id).await.unwrap().is_running());

    // Stopping twice is a no-op
    engine
        .stop(&id, Duration::from_secs(1))
        .await
        .expect("Second stop should be a no-op");

    engine.remove(&id).await.expect("Failed to remove container");
    assert!(matches!(
        engine.inspect(&id).await,
        Err(EngineError::ContainerNotFound(_))
    ));
}

/// Bytes written to an interactive shell come back on its output.
#[tokio::test]
#[ignore = "requires a running Docker daemon"]
async fn test_exec_round_trip() {
    let engine = engine().await;
    let id = engine
        .create(&ContainerSpec::new(IMAGE, unique_name()))
        .await
        .unwrap();
    engine.start(&id).await.unwrap();

    let exec_id = engine
        .exec_create(&id, &ExecSpec::interactive_shell("/bin/sh"))
        .await
        .unwrap();
    let channel = engine.exec_start(&exec_id).await.unwrap();
    let (_, mut output, input) = channel.into_parts();
    let mut input = input.expect("interactive exec has an input side");

    input.write_all(b"echo burrow-$((40+2))\nexit\n").await.unwrap();

    let mut seen = Vec::new();
    let collect = async {
        while let Some(chunk) = output.next().await {
            seen.extend_from_slice(&chunk.unwrap());
        }
    };
    tokio::time::timeout(Duration::from_secs(10), collect)
        .await
        .expect("exec did not finish");
    assert!(String::from_utf8_lossy(&seen).contains("burrow-42"));

    engine.stop(&id, Duration::from_secs(1)).await.unwrap();
    engine.remove(&id).await.unwrap();
}

/// An exec created without stdin or a TTY starts without an input side.
#[tokio::test]
#[ignore = "requires a running Docker daemon"]
async fn test_exec_without_stdin() {
    let engine = engine().await;
    let id = engine
        .create(&ContainerSpec::new(IMAGE, unique_name()))
        .await
        .unwrap();
    engine.start(&id).await.unwrap();

    let spec = ExecSpec {
        cmd: vec!["echo".into(), "plain".into()],
        attach_stdin: false,
        attach_stdout: true,
        attach_stderr: true,
        tty: false,
    };
    let exec_id = engine.exec_create(&id, &spec).await.unwrap();
    let (_, mut output, input) = engine.exec_start(&exec_id).await.unwrap().into_parts();
    assert!(input.is_none());

    let mut seen = Vec::new();
    let collect = async {
        while let Some(chunk) = output.next().await {
            seen.extend_from_slice(&chunk.unwrap());
        }
    };
    tokio::time::timeout(Duration::from_secs(10), collect)
        .await
        .expect("exec did not finish");
    assert!(String::from_utf8_lossy(&seen).contains("plain"));

    engine.stop(&id, Duration::from_secs(1)).await.unwrap();
    engine.remove(&id).await.unwrap();
}

/// Duplicate container names are rejected, not retried.
#[tokio::test]
#[ignore = "requires a running Docker daemon"]
async fn test_name_collision_rejected() {
    let engine = engine().await;
    let name = unique_name();
    let id = engine.create(&ContainerSpec::new(IMAGE, &name)).await.unwrap();

    let second = engine.create(&ContainerSpec::new(IMAGE, &name)).await;
    assert!(matches!(second, Err(EngineError::Rejected { status: 409, .. })));

    engine.remove(&id).await.unwrap();
}
