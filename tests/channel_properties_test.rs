//! Timing and concurrency properties of channels and correlated requests.
//!
//! Every test runs on a paused tokio clock, so reconnect delays and request
//! deadlines elapse instantly and deterministically.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use neolink::channel::{MemoryDialer, MemoryServer, KEEP_ALIVE};
use neolink::session::Credential;
use neolink::{
    Config, ConnectOptions, ConnectionState, CorrelatedRequest, CorrelationToken, Endpoint,
    Identity, Session, SessionError, SessionManager,
};
use serde_json::{json, Value};

fn options() -> ConnectOptions {
    ConnectOptions::new("secret", "60")
}

fn manager(dialer: &MemoryDialer) -> Arc<SessionManager> {
    let manager = SessionManager::with_dialer(Config::default(), Arc::new(dialer.clone())).unwrap();
    manager.session_context().establish(Session {
        identity: Identity {
            user_id: "42".to_string(),
            display_name: "neo".to_string(),
        },
        credential: Credential::from_session_token("secret"),
        profile: Value::Null,
    });
    Arc::new(manager)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

fn request_id_of(server: &MemoryServer, index: usize) -> String {
    let frame: Value = serde_json::from_str(&server.sent()[index]).unwrap();
    frame["request_id"].as_str().unwrap().to_string()
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_connects_dial_once() {
    let dialer = MemoryDialer::new();
    dialer.set_dial_delay(Duration::from_millis(200));
    let manager = manager(&dialer);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.connect(Endpoint::Primary, Some(options())).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(dialer.dial_count_for(Endpoint::Primary), 1);
    assert!(manager.channel(Endpoint::Primary).is_open());
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_never_reaches_subscribers() {
    let dialer = MemoryDialer::new();
    let manager = manager(&dialer);
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    manager.on_frame(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    manager.connect(Endpoint::Primary, Some(options())).await.unwrap();
    let server = dialer.last_server(Endpoint::Primary).unwrap();
    server.push_text(KEEP_ALIVE);
    server.push_text(KEEP_ALIVE);
    settle().await;

    assert_eq!(seen.load(Ordering::SeqCst), 0);
    let sent = server.sent();
    assert_eq!(&sent[2..], &[KEEP_ALIVE.to_string(), KEEP_ALIVE.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_request_times_out_and_releases_handler() {
    let dialer = MemoryDialer::new();
    let manager = manager(&dialer);
    manager.connect(Endpoint::Primary, Some(options())).await.unwrap();
    let baseline = manager.bus().subscriber_count();

    let token = CorrelationToken::generate();
    let request = CorrelatedRequest::new(token.clone(), json!({ "request_id": token.as_str() }), |_| false)
        .with_timeout(Duration::from_millis(100));
    let err = manager.send_and_await(Endpoint::Primary, request).await.unwrap_err();

    assert!(matches!(err, SessionError::Timeout { .. }));
    assert_eq!(manager.bus().subscriber_count(), baseline);
    assert!(!manager.engine().is_outstanding(&token));
}

#[tokio::test(start_paused = true)]
async fn test_send_and_await_without_connection_is_not_connected() {
    let manager = manager(&MemoryDialer::new());
    let request = CorrelatedRequest::new(CorrelationToken::generate(), json!({}), |_| true);

    let err = manager.send_and_await(Endpoint::Group, request).await.unwrap_err();
    assert!(matches!(err, SessionError::NotConnected(Endpoint::Group)));
    assert_eq!(manager.engine().outstanding(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_pending_request_survives_reconnect() {
    let dialer = MemoryDialer::new();
    let manager = manager(&dialer);
    manager.connect(Endpoint::Primary, Some(options())).await.unwrap();
    let first = dialer.last_server(Endpoint::Primary).unwrap();

    let task = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.create_conversation("char-1").await })
    };
    settle().await;
    let request_id = request_id_of(&first, 2);

    first.close(1006, "abnormal");
    settle().await;
    assert!(!task.is_finished());
    assert_eq!(manager.channel(Endpoint::Primary).state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_secs(5)).await;
    let second = dialer.last_server(Endpoint::Primary).unwrap();
    assert_eq!(dialer.dial_count(), 2);
    assert_eq!(dialer.dials()[1].1, options());

    second.push_text(json!({ "command": "add_turn", "request_id": request_id }).to_string());
    let reply = task.await.unwrap().unwrap();
    assert_eq!(reply["request_id"], request_id.as_str());
}

#[tokio::test(start_paused = true)]
async fn test_pending_request_still_times_out_across_disconnect() {
    let dialer = MemoryDialer::new();
    let manager = manager(&dialer);
    manager.connect(Endpoint::Primary, Some(options())).await.unwrap();

    let task = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.create_conversation("char-1").await })
    };
    settle().await;

    dialer.fail_always(true);
    dialer.last_server(Endpoint::Primary).unwrap().close(1006, "");
    let err = task.await.unwrap().unwrap_err();

    assert!(matches!(err, SessionError::Timeout { after, .. } if after == Duration::from_secs(30)));
    assert_eq!(manager.engine().outstanding(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_exhaustion_requires_explicit_connect() {
    let dialer = MemoryDialer::new();
    let manager = manager(&dialer);
    manager.connect(Endpoint::Primary, Some(options())).await.unwrap();

    dialer.fail_always(true);
    dialer.last_server(Endpoint::Primary).unwrap().fail("connection reset");
    tokio::time::sleep(Duration::from_secs(120)).await;

    let channel = manager.channel(Endpoint::Primary);
    assert_eq!(channel.state(), ConnectionState::GaveUp);
    assert_eq!(channel.reconnect_attempts(), 5);
    assert_eq!(dialer.dial_count(), 6);

    dialer.fail_always(false);
    let channel = manager.ensure_connected(Endpoint::Primary).await.unwrap();
    assert!(channel.is_open());
    assert_eq!(channel.reconnect_attempts(), 0);
    assert_eq!(dialer.dials().last().unwrap().1, options());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_abandons_pending_and_stops_reconnects() {
    let dialer = MemoryDialer::new();
    let manager = manager(&dialer);
    manager.connect(Endpoint::Primary, Some(options())).await.unwrap();

    let task = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.create_conversation("char-1").await })
    };
    settle().await;

    manager.shutdown().await;
    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, SessionError::Abandoned(_)));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(dialer.dial_count(), 1);
    assert_eq!(manager.bus().subscriber_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_channels_do_not_share_frames_order_per_endpoint() {
    let dialer = MemoryDialer::new();
    let manager = manager(&dialer);
    manager.connect(Endpoint::Primary, Some(options())).await.unwrap();
    manager.connect(Endpoint::Group, Some(options())).await.unwrap();

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    manager.on_frame(move |frame| {
        let n = frame.json().and_then(|v| v["n"].as_u64()).unwrap_or_default();
        sink.lock().unwrap().push((frame.endpoint(), n));
        Ok(())
    });

    let primary = dialer.last_server(Endpoint::Primary).unwrap();
    let group = dialer.last_server(Endpoint::Group).unwrap();
    for n in 1..=3 {
        primary.push_text(json!({ "n": n }).to_string());
        group.push_text(json!({ "n": n * 10 }).to_string());
    }
    settle().await;

    let seen = seen.lock().unwrap();
    let primary_order: Vec<u64> = seen
        .iter()
        .filter(|(ep, _)| *ep == Endpoint::Primary)
        .map(|(_, n)| *n)
        .collect();
    let group_order: Vec<u64> = seen
        .iter()
        .filter(|(ep, _)| *ep == Endpoint::Group)
        .map(|(_, n)| *n)
        .collect();
    assert_eq!(primary_order, vec![1, 2, 3]);
    assert_eq!(group_order, vec![10, 20, 30]);
}
