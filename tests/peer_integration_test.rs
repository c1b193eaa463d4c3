// Peer の結合テスト
// in-memory duplex streams stand in for the remote side

use peer_rpc::jsonrpc::{done_channel, CloseReason, Peer, PeerError};
use peer_rpc::PeerConfig;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
use tokio::sync::{mpsc, Notify};
use tokio::time::{timeout, Duration};

const WAIT: Duration = Duration::from_secs(2);

/// The other end of the stream
struct Remote {
    lines: Lines<BufReader<DuplexStream>>,
    writer: DuplexStream,
}

impl Remote {
    async fn read_line(&mut self) -> String {
        timeout(WAIT, self.lines.next_line())
            .await
            .expect("timed out waiting for the peer to write")
            .unwrap()
            .expect("peer closed its outbound stream")
    }

    async fn read_message(&mut self) -> Value {
        serde_json::from_str(&self.read_line().await).unwrap()
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }
}

fn connect(config: PeerConfig) -> (Peer, Remote) {
    let _ = env_logger::builder().is_test(true).try_init();

    let (peer_in, remote_out) = tokio::io::duplex(64 * 1024);
    let (remote_in, peer_out) = tokio::io::duplex(64 * 1024);
    let peer = Peer::new(peer_in, peer_out, config);
    let remote = Remote {
        lines: BufReader::new(remote_in).lines(),
        writer: remote_out,
    };
    (peer, remote)
}

/// Round trip through a fresh call; once it completes every earlier
/// inbound line has been processed by the reader loop.
async fn barrier(peer: &Peer, remote: &mut Remote) {
    let handle = peer.call::<_, Value>("barrier", Value::Null, None).await;
    let request = remote.read_message().await;
    assert_eq!(request["method"], "barrier");
    remote
        .send(&json!({"id": request["id"], "result": null}).to_string())
        .await;
    timeout(WAIT, handle.done())
        .await
        .expect("barrier timed out")
        .expect("barrier call was dropped");
}

#[tokio::test]
async fn test_echo_scenario() {
    let (peer, mut remote) = connect(PeerConfig::default());

    let (done, mut rx) = done_channel::<Value>(1);
    peer.call("echo", json!({"x": 1}), Some(done)).await;

    assert_eq!(
        remote.read_line().await,
        r#"{"id":1,"method":"echo","params":{"x":1}}"#
    );
    remote.send(r#"{"id":1,"result":{"x":1}}"#).await;

    let call = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(call.id, 1);
    assert_eq!(call.method, "echo");
    assert!(call.error.is_none());
    assert_eq!(call.reply, Some(json!({"x": 1})));
}

#[tokio::test]
async fn test_call_sync_decodes_typed_reply() {
    #[derive(Debug, Deserialize, PartialEq)]
    struct Point {
        x: i32,
        y: i32,
    }

    let (peer, mut remote) = connect(PeerConfig::default());
    let responder = tokio::spawn(async move {
        let request = remote.read_message().await;
        assert_eq!(request["method"], "locate");
        remote
            .send(&json!({"id": request["id"], "result": {"x": 3, "y": -4}}).to_string())
            .await;
        remote
    });

    let point: Point = timeout(WAIT, peer.call_sync("locate", json!({"name": "a"})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(point, Point { x: 3, y: -4 });
    responder.await.unwrap();
}

#[tokio::test]
async fn test_null_result_completes_call() {
    let (peer, mut remote) = connect(PeerConfig::default());
    let responder = tokio::spawn(async move {
        let request = remote.read_message().await;
        remote
            .send(&json!({"id": request["id"], "result": null}).to_string())
            .await;
        remote
    });

    timeout(WAIT, peer.call_sync::<_, ()>("save", Value::Null))
        .await
        .unwrap()
        .unwrap();
    responder.await.unwrap();
}

#[tokio::test]
async fn test_concurrent_calls_get_sequential_ids() {
    const CALLS: u64 = 32;
    let (peer, mut remote) = connect(PeerConfig::default());
    let peer = Arc::new(peer);

    let tasks: Vec<_> = (0..CALLS)
        .map(|i| {
            let peer = peer.clone();
            tokio::spawn(async move {
                peer.call::<_, Value>("work", json!({"n": i}), None).await.id()
            })
        })
        .collect();

    let mut handle_ids = Vec::new();
    for task in tasks {
        handle_ids.push(task.await.unwrap());
    }
    handle_ids.sort_unstable();
    assert_eq!(handle_ids, (1..=CALLS).collect::<Vec<_>>());

    // wire order equals ID order
    let mut wire_ids = Vec::new();
    for _ in 0..CALLS {
        wire_ids.push(remote.read_message().await["id"].as_u64().unwrap());
    }
    assert_eq!(wire_ids, (1..=CALLS).collect::<Vec<_>>());
    assert_eq!(peer.pending_calls(), CALLS as usize);
}

#[tokio::test]
async fn test_unmatched_response_is_dropped() {
    let (peer, mut remote) = connect(PeerConfig::default());

    let handle = peer.call::<_, Value>("slow", Value::Null, None).await;
    remote.read_message().await;

    remote.send(r#"{"id":99,"result":"stray"}"#).await;
    remote.send(r#"{"id":1,"result":"mine"}"#).await;
    // duplicate of an already completed call
    remote.send(r#"{"id":1,"result":"again"}"#).await;

    let call = timeout(WAIT, handle.done()).await.unwrap().unwrap();
    assert_eq!(call.reply, Some(json!("mine")));

    barrier(&peer, &mut remote).await;
    assert_eq!(peer.close_reason(), None);
    assert_eq!(peer.pending_calls(), 0);
}

#[tokio::test]
async fn test_responses_out_of_order() {
    let (peer, mut remote) = connect(PeerConfig::default());

    let first = peer.call::<_, Value>("a", Value::Null, None).await;
    let second = peer.call::<_, Value>("b", Value::Null, None).await;
    remote.read_message().await;
    remote.read_message().await;

    remote.send(r#"{"id":2,"result":"b"}"#).await;
    remote.send(r#"{"id":1,"result":"a"}"#).await;

    let second = timeout(WAIT, second.done()).await.unwrap().unwrap();
    let first = timeout(WAIT, first.done()).await.unwrap().unwrap();
    assert_eq!(first.reply, Some(json!("a")));
    assert_eq!(second.reply, Some(json!("b")));
}

#[tokio::test]
async fn test_notifications_dispatch_to_registered_handler() {
    let (peer, mut remote) = connect(PeerConfig::default());

    let (tx, mut rx) = mpsc::unbounded_channel();
    peer.handle("ping", move |params: Value| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(params);
        }
    });

    remote.send(r#"{"method":"unknown","params":[1]}"#).await;
    remote.send(r#"{"method":"ping","params":null}"#).await;

    let params = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(params, Value::Null);

    // nothing is written back for a notification
    barrier(&peer, &mut remote).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(peer.close_reason(), None);
}

#[tokio::test]
async fn test_blocked_handler_does_not_stall_responses() {
    let (peer, mut remote) = connect(PeerConfig::default());

    let release = Arc::new(Notify::new());
    let waiting = release.clone();
    peer.handle("stuck", move |_params: Value| {
        let waiting = waiting.clone();
        async move {
            waiting.notified().await;
        }
    });

    remote.send(r#"{"method":"stuck"}"#).await;
    barrier(&peer, &mut remote).await;
    release.notify_one();
}

#[tokio::test]
async fn test_handler_concurrency_limit() {
    let (peer, mut remote) = connect(PeerConfig::new().with_max_concurrent_handlers(Some(1)));

    let started = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(Notify::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    {
        let started = started.clone();
        let release = release.clone();
        peer.handle("job", move |params: Value| {
            let started = started.clone();
            let release = release.clone();
            let tx = tx.clone();
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(params);
                release.notified().await;
            }
        });
    }

    remote.send(r#"{"method":"job","params":1}"#).await;
    remote.send(r#"{"method":"job","params":2}"#).await;

    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap(), Some(json!(1)));
    barrier(&peer, &mut remote).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(started.load(Ordering::SeqCst), 1);

    release.notify_one();
    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap(), Some(json!(2)));
    release.notify_one();
}

#[tokio::test]
async fn test_shared_single_slot_channel_drops_second_completion() {
    let (peer, mut remote) = connect(PeerConfig::default());

    let (done, mut rx) = done_channel::<Value>(1);
    let first = peer.call("a", Value::Null, Some(done.clone())).await;
    let second = peer.call("b", Value::Null, Some(done)).await;
    assert_eq!((first.id(), second.id()), (1, 2));
    assert!(first.done().await.is_none());
    remote.read_message().await;
    remote.read_message().await;

    remote.send(r#"{"id":1,"result":"first"}"#).await;
    remote.send(r#"{"id":2,"result":"second"}"#).await;
    barrier(&peer, &mut remote).await;

    let delivered = rx.try_recv().unwrap();
    assert_eq!(delivered.id, 1);
    assert_eq!(delivered.reply, Some(json!("first")));
    assert!(rx.try_recv().is_err());
    assert_eq!(peer.pending_calls(), 0);
}

#[tokio::test]
#[should_panic(expected = "unbuffered")]
async fn test_zero_capacity_done_channel_panics() {
    let (peer, _remote) = connect(PeerConfig::default());
    peer.call("never", Value::Null, Some(done_channel::<Value>(0).0))
        .await;
}

#[tokio::test]
async fn test_write_failure_completes_call_with_error() {
    let _ = env_logger::builder().is_test(true).try_init();

    let writer = tokio_test::io::Builder::new()
        .write_error(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))
        .build();
    let (peer_in, _remote_out) = tokio::io::duplex(1024);
    let peer = Peer::new(peer_in, writer, PeerConfig::default());

    let handle = peer.call::<_, Value>("lost", Value::Null, None).await;
    assert_eq!(handle.id(), 1);

    let call = timeout(WAIT, handle.done()).await.unwrap().unwrap();
    match call.error {
        Some(PeerError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::BrokenPipe),
        other => panic!("Expected IO error, got {:?}", other),
    }
    assert_eq!(peer.pending_calls(), 0);
}

#[tokio::test]
async fn test_notify_omits_id() {
    let (peer, mut remote) = connect(PeerConfig::default());

    peer.notify("saved", json!({"path": "a.txt"})).await.unwrap();
    assert_eq!(
        remote.read_line().await,
        r#"{"method":"saved","params":{"path":"a.txt"}}"#
    );

    // notifications do not consume IDs
    let handle = peer.call::<_, Value>("next", Value::Null, None).await;
    assert_eq!(handle.id(), 1);
}

#[tokio::test]
async fn test_stream_end_fails_pending_calls() {
    let (peer, mut remote) = connect(PeerConfig::default());

    let handle = peer.call::<_, Value>("forever", Value::Null, None).await;
    remote.read_message().await;
    drop(remote.writer);

    let call = timeout(WAIT, handle.done()).await.unwrap().unwrap();
    assert!(matches!(
        call.error,
        Some(PeerError::Closed(CloseReason::StreamEnded))
    ));
    assert_eq!(timeout(WAIT, peer.closed()).await.unwrap(), CloseReason::StreamEnded);

    // later calls fail without touching the stream
    let result: Result<Value, PeerError> = peer.call_sync("late", Value::Null).await;
    assert!(matches!(
        result,
        Err(PeerError::Closed(CloseReason::StreamEnded))
    ));
    let handle = peer.call::<_, Value>("later", Value::Null, None).await;
    assert_eq!(handle.id(), 0);
    assert!(matches!(
        peer.notify("bye", Value::Null).await,
        Err(PeerError::Closed(_))
    ));
}

#[tokio::test]
async fn test_malformed_line_is_a_protocol_violation() {
    let (peer, mut remote) = connect(PeerConfig::default());

    let handle = peer.call::<_, Value>("pending", Value::Null, None).await;
    remote.read_message().await;
    remote.send("this is not json").await;

    let reason = timeout(WAIT, peer.closed()).await.unwrap();
    assert!(matches!(reason, CloseReason::Protocol(_)));

    let call = timeout(WAIT, handle.done()).await.unwrap().unwrap();
    assert!(matches!(
        call.error,
        Some(PeerError::Closed(CloseReason::Protocol(_)))
    ));
}

#[tokio::test]
async fn test_undecodable_result_is_a_protocol_violation() {
    let (peer, mut remote) = connect(PeerConfig::default());

    let (done, mut rx) = done_channel::<u32>(1);
    peer.call("count", Value::Null, Some(done)).await;
    remote.read_message().await;
    remote.send(r#"{"id":1,"result":"many"}"#).await;

    let call = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert!(matches!(call.error, Some(PeerError::Protocol(_))));
    assert!(matches!(
        timeout(WAIT, peer.closed()).await.unwrap(),
        CloseReason::Protocol(_)
    ));
}

#[tokio::test]
async fn test_message_without_method_is_dropped() {
    let (peer, mut remote) = connect(PeerConfig::default());

    let handle = peer.call::<_, Value>("lookup", Value::Null, None).await;
    remote.read_message().await;

    // JSON-RPC style error reply and a bare params object: nowhere to route them
    remote.send(r#"{"id":7,"error":{"code":1}}"#).await;
    remote.send(r#"{"params":{"orphan":true}}"#).await;
    remote.send(r#"{"id":1,"result":"found"}"#).await;

    let call = timeout(WAIT, handle.done()).await.unwrap().unwrap();
    assert!(call.error.is_none());
    assert_eq!(call.reply, Some(json!("found")));
    assert_eq!(peer.close_reason(), None);
}

#[tokio::test]
async fn test_invalid_utf8_line_is_a_protocol_violation() {
    let (peer, mut remote) = connect(PeerConfig::default());

    let (done, mut rx) = done_channel::<Value>(1);
    peer.call("lookup", Value::Null, Some(done)).await;
    remote.read_message().await;

    remote
        .writer
        .write_all(b"{\"method\":\"ping\",\"params\":\"\xff\"}\n")
        .await
        .unwrap();

    assert!(matches!(
        timeout(WAIT, peer.closed()).await.unwrap(),
        CloseReason::Protocol(_)
    ));
    let call = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert!(matches!(
        call.error,
        Some(PeerError::Closed(CloseReason::Protocol(_)))
    ));
}

#[tokio::test]
async fn test_shutdown_closes_outbound_and_fails_pending() {
    let (peer, mut remote) = connect(PeerConfig::default());

    let (done, mut rx) = done_channel::<Value>(1);
    peer.call("open", Value::Null, Some(done)).await;
    remote.read_message().await;

    peer.shutdown().await.unwrap();

    // the remote sees EOF
    let eof = timeout(WAIT, remote.lines.next_line()).await.unwrap().unwrap();
    assert!(eof.is_none());

    let call = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert!(matches!(
        call.error,
        Some(PeerError::Closed(CloseReason::Shutdown))
    ));
}
