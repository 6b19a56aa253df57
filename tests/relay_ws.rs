//! End-to-end relay tests over a real websocket: handshake validation, the
//! bidirectional copy loop, single-attachment enforcement, and forced
//! disconnect when the environment leaves RUNNING.

mod common;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};

use challenge_relay::gateway::{router, AppState};
use challenge_relay::lifecycle::{EnvStatus, LifecycleManager};
use challenge_relay::registry::SessionRegistry;
use common::{FakeSpawner, MockRuntime, SpawnRecord};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestRig {
    lifecycle: Arc<LifecycleManager>,
    registry: Arc<SessionRegistry>,
    runtime: Arc<MockRuntime>,
    spawner: Arc<FakeSpawner>,
    record: Arc<SpawnRecord>,
    addr: String,
}

impl TestRig {
    async fn with_ttl(ttl: Duration) -> Self {
        let runtime = MockRuntime::new();
        let catalog = HashMap::from([("web-101".to_string(), "ctf-web-101".to_string())]);
        let lifecycle = Arc::new(LifecycleManager::new(runtime.clone(), catalog, ttl, 0));
        let registry = Arc::new(SessionRegistry::new());
        let (spawner, record) = FakeSpawner::new();

        let state = AppState {
            lifecycle: lifecycle.clone(),
            registry: registry.clone(),
            spawner: spawner.clone(),
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });

        Self {
            lifecycle,
            registry,
            runtime,
            spawner,
            record,
            addr,
        }
    }

    async fn new() -> Self {
        Self::with_ttl(Duration::from_secs(1800)).await
    }

    async fn connect(&self, instance_id: &str) -> WsClient {
        let url = format!("ws://{}/ws/terminal/{instance_id}", self.addr);
        let (ws, _) = connect_async(&url).await.unwrap();
        ws
    }

    /// Provision an environment and attach, consuming the banner frame.
    async fn attached(&self) -> (String, WsClient) {
        let env = self.lifecycle.start("web-101").await.unwrap();
        let mut ws = self.connect(&env.instance_id).await;
        let banner = next_frame(&mut ws).await;
        match banner {
            Message::Text(text) => assert!(text.contains(&env.instance_id)),
            other => panic!("expected banner text frame, got {other:?}"),
        }
        (env.instance_id, ws)
    }
}

async fn next_frame(ws: &mut WsClient) -> Message {
    tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("stream ended without a close frame")
        .expect("websocket error")
}

/// Skip data frames until the server closes, returning the close code.
async fn close_code(ws: &mut WsClient) -> u16 {
    loop {
        match next_frame(ws).await {
            Message::Close(Some(frame)) => return u16::from(frame.code),
            Message::Close(None) => panic!("close frame carried no code"),
            _ => {}
        }
    }
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

#[tokio::test]
async fn unknown_instance_is_rejected_without_allocating() {
    let rig = TestRig::new().await;
    let mut ws = rig.connect("no-such-instance").await;

    assert_eq!(close_code(&mut ws).await, 4404);
    assert_eq!(rig.record.spawns.load(Ordering::SeqCst), 0);
    assert!(rig.registry.is_empty());
}

#[tokio::test]
async fn stopped_instance_is_rejected() {
    let rig = TestRig::new().await;
    let env = rig.lifecycle.start("web-101").await.unwrap();
    rig.lifecycle.stop(&env.instance_id).await.unwrap();

    let mut ws = rig.connect(&env.instance_id).await;
    assert_eq!(close_code(&mut ws).await, 4404);
    assert_eq!(rig.record.spawns.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn process_output_reaches_the_client_in_order() {
    let rig = TestRig::new().await;
    let (_, mut ws) = rig.attached().await;

    let output_tx = rig.record.take_output_tx().unwrap();
    output_tx.send(b"user@ctf:~$ ".to_vec()).await.unwrap();
    output_tx.send(b"ls\r\nflag.txt\r\n".to_vec()).await.unwrap();

    let mut received = Vec::new();
    while received.len() < b"user@ctf:~$ ls\r\nflag.txt\r\n".len() {
        match next_frame(&mut ws).await {
            Message::Binary(bytes) => received.extend_from_slice(&bytes),
            other => panic!("expected binary output, got {other:?}"),
        }
    }
    assert_eq!(received, b"user@ctf:~$ ls\r\nflag.txt\r\n");

    // Closing the output stream ends the session normally.
    drop(output_tx);
    assert_eq!(close_code(&mut ws).await, 1000);
}

#[tokio::test]
async fn client_input_reaches_the_process() {
    let rig = TestRig::new().await;
    let (_, mut ws) = rig.attached().await;

    ws.send(Message::Binary(b"ls\n".to_vec())).await.unwrap();

    let record = rig.record.clone();
    eventually("input to arrive at the process", move || {
        *record.input.lock() == b"ls\n"
    })
    .await;
}

#[tokio::test]
async fn resize_messages_are_forwarded_not_echoed() {
    let rig = TestRig::new().await;
    let (_, mut ws) = rig.attached().await;

    ws.send(Message::Text(
        r#"{"type":"resize","cols":120,"rows":40}"#.to_string(),
    ))
    .await
    .unwrap();

    let record = rig.record.clone();
    eventually("resize to arrive at the process", move || {
        record.resizes.lock().contains(&(120, 40))
    })
    .await;
    // The resize produced no input bytes.
    assert!(rig.record.input.lock().is_empty());
}

#[tokio::test]
async fn second_attachment_is_rejected_while_first_lives() {
    let rig = TestRig::new().await;
    let (instance_id, mut first) = rig.attached().await;

    let mut second = rig.connect(&instance_id).await;
    assert_eq!(close_code(&mut second).await, 4409);
    // One spawn only: the loser allocated nothing.
    assert_eq!(rig.record.spawns.load(Ordering::SeqCst), 1);

    // The winner is unaffected.
    first.send(Message::Binary(b"pwd\n".to_vec())).await.unwrap();
    let record = rig.record.clone();
    eventually("first session still relaying", move || {
        *record.input.lock() == b"pwd\n"
    })
    .await;
}

#[tokio::test]
async fn stopping_the_environment_forces_the_session_closed() {
    let rig = TestRig::new().await;
    let (instance_id, mut ws) = rig.attached().await;

    rig.lifecycle.stop(&instance_id).await.unwrap();

    assert_eq!(close_code(&mut ws).await, 4408);
    let record = rig.record.clone();
    eventually("process termination", move || {
        record.terminations.load(Ordering::SeqCst) == 1
    })
    .await;
    let registry = rig.registry.clone();
    eventually("registry to drain", move || registry.is_empty()).await;
    assert_eq!(rig.runtime.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn expiry_sweep_forces_the_session_closed() {
    let rig = TestRig::with_ttl(Duration::from_millis(200)).await;
    let (instance_id, mut ws) = rig.attached().await;

    tokio::time::sleep(Duration::from_millis(250)).await;
    rig.lifecycle.sweep_once().await;

    assert_eq!(close_code(&mut ws).await, 4408);
    let after = rig.lifecycle.status(&instance_id).unwrap();
    assert_eq!(after.status, EnvStatus::Stopped);
    assert!(after.expired);
}

#[tokio::test]
async fn spawn_failure_closes_4500_and_leaves_environment_running() {
    let rig = TestRig::new().await;
    let env = rig.lifecycle.start("web-101").await.unwrap();
    rig.spawner.fail.store(true, Ordering::SeqCst);

    let mut ws = rig.connect(&env.instance_id).await;
    assert_eq!(close_code(&mut ws).await, 4500);

    // A retry can attach once the transient failure clears.
    assert_eq!(
        rig.lifecycle.status(&env.instance_id).unwrap().status,
        EnvStatus::Running
    );
    assert!(rig.registry.is_empty());

    rig.spawner.fail.store(false, Ordering::SeqCst);
    let mut retry = rig.connect(&env.instance_id).await;
    match next_frame(&mut retry).await {
        Message::Text(_) => {}
        other => panic!("expected banner after retry, got {other:?}"),
    }
}

#[tokio::test]
async fn client_disconnect_tears_the_session_down() {
    let rig = TestRig::new().await;
    let (instance_id, ws) = rig.attached().await;

    drop(ws);

    let record = rig.record.clone();
    eventually("process termination after disconnect", move || {
        record.terminations.load(Ordering::SeqCst) == 1
    })
    .await;
    let registry = rig.registry.clone();
    eventually("registry to drain", move || registry.is_empty()).await;
    // The environment itself keeps running; only the session died.
    assert_eq!(
        rig.lifecycle.status(&instance_id).unwrap().status,
        EnvStatus::Running
    );
}
