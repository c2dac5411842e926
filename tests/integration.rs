//! End-to-end tests against the in-process fake server, covering the
//! round-trip laws and scenario table.

mod support;

use std::sync::Arc;
use std::time::Duration;

use redis_pipe::{callback, Arg, Connection, ErrorKind, Opts, Request, Value};
use support::fake_server::{FakeServer, ServerConfig};

fn fast_opts() -> Opts {
    let mut opts = Opts::default()
        .with_reconnect_pause(Some(Duration::from_millis(20)))
        .with_io_timeout(Some(Duration::from_millis(500)));
    opts.dial_timeout = Some(Duration::from_secs(1));
    opts
}

// Scenario 1 / law 7: PING under a healthy connection returns PONG.
#[tokio::test]
async fn ping_returns_pong() {
    let server = FakeServer::start(ServerConfig::default()).await;
    let conn = Connection::connect(&server.addr, fast_opts()).await.unwrap();
    assert!(conn.is_connected());

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let cb = callback(move |res, seq| {
        let _ = tx.send((seq, res));
    });
    conn.send(Request::new("PING"), cb, 1);

    let (seq, res) = rx.recv().await.unwrap();
    assert_eq!(seq, 1);
    assert_eq!(res.unwrap(), Value::Status("PONG".into()));
    server.stop();
}

// Law 8: SET k v followed by GET k returns v.
#[tokio::test]
async fn set_then_get_round_trips() {
    let server = FakeServer::start(ServerConfig::default()).await;
    let conn = Connection::connect(&server.addr, fast_opts()).await.unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let cb = callback(move |res, seq| {
        let _ = tx.send((seq, res));
    });
    conn.send(Request::new("SET").arg("k").arg("v"), cb.clone(), 1);
    conn.send(Request::new("GET").arg("k"), cb, 2);

    let mut by_seq = std::collections::HashMap::new();
    for _ in 0..2 {
        let (seq, res) = rx.recv().await.unwrap();
        by_seq.insert(seq, res);
    }
    assert_eq!(by_seq.remove(&1).unwrap().unwrap(), Value::Status("OK".into()));
    assert_eq!(by_seq.remove(&2).unwrap().unwrap(), Value::Bulk(b"v".to_vec()));
    server.stop();
}

// Scenario 3: wrong password, ReconnectPause >= 0 => Connect returns ErrAuth
// synchronously and the connection is Closed.
#[tokio::test]
async fn wrong_password_fails_connect_synchronously() {
    let server = FakeServer::start(ServerConfig {
        password: Some("correct-horse".into()),
        ..Default::default()
    })
    .await;

    let opts = fast_opts().with_password("wrong-password");
    let err = Connection::connect(&server.addr, opts).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Auth);
    server.stop();
}

// Scenario 4: Async connect against a server that isn't up yet. Connect
// returns immediately (not Disconnected), and once the server comes up the
// already-buffered PING is answered.
#[tokio::test]
async fn async_connect_buffers_until_server_is_up() {
    let (addr, server_task) =
        FakeServer::start_after_delay(Duration::from_millis(150), ServerConfig::default());

    let opts = fast_opts().with_async(true);
    let conn = Connection::connect(&addr, opts).await.unwrap();
    assert!(conn.may_be_connected());

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let cb = callback(move |res, seq| {
        let _ = tx.send((seq, res));
    });
    conn.send(Request::new("PING"), cb, 1);

    let (seq, res) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("callback should fire once the server comes up")
        .unwrap();
    assert_eq!(seq, 1);
    assert_eq!(res.unwrap(), Value::Status("PONG".into()));

    server_task.await.unwrap().stop();
}

// Scenario 2: socket killed mid-pipeline. Every submitted request still
// gets exactly one callback; none are lost or duplicated.
#[tokio::test]
async fn socket_killed_mid_pipeline_resolves_every_future() {
    const TOTAL: usize = 1000;
    const KILL_AFTER: usize = 500;

    let server = FakeServer::start(ServerConfig {
        kill_after_replies: Some(KILL_AFTER),
        ..Default::default()
    })
    .await;
    let opts = fast_opts().with_reconnect_pause(None); // no reconnect: isolate this session's drain
    let conn = Connection::connect(&server.addr, opts).await.unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    for seq in 0..TOTAL as u64 {
        let tx = tx.clone();
        let cb = callback(move |res, seq| {
            let _ = tx.send((seq, res));
        });
        conn.send(Request::new("SET").arg("k").arg(seq as i64), cb, seq);
    }
    drop(tx);

    let mut seen = std::collections::HashSet::new();
    let mut succeeded = 0usize;
    while let Some((seq, res)) = rx.recv().await {
        assert!(seen.insert(seq), "duplicate callback for seq {seq}");
        if res.is_ok() {
            succeeded += 1;
        }
    }
    assert_eq!(seen.len(), TOTAL, "every submitted future must resolve exactly once");
    assert!(
        succeeded >= KILL_AFTER,
        "at least the acked requests must have succeeded, got {succeeded}"
    );
    server.stop();
}

// Scenario 5 (reduced scale): many concurrent producers, exactly-once
// delivery. Per-shard FIFO isn't independently observable through the
// public API (shard assignment is internal), so this checks the
// invariant that is: every submitted request resolves exactly once.
#[tokio::test]
async fn concurrent_producers_get_exactly_one_callback_each() {
    const PRODUCERS: u64 = 4;
    const PER_PRODUCER: u64 = 500;

    let server = FakeServer::start(ServerConfig::default()).await;
    let conn = Connection::connect(&server.addr, fast_opts()).await.unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut handles = Vec::new();
    for p in 0..PRODUCERS {
        let conn = conn.clone();
        let tx = tx.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..PER_PRODUCER {
                let seq = p * PER_PRODUCER + i;
                let tx = tx.clone();
                let cb = callback(move |res, seq| {
                    let _ = tx.send((seq, res));
                });
                conn.send(Request::new("PING"), cb, seq);
            }
        }));
    }
    drop(tx);
    for h in handles {
        h.await.unwrap();
    }

    let total = PRODUCERS * PER_PRODUCER;
    let mut seen = std::collections::HashSet::new();
    for _ in 0..total {
        let (seq, res) = rx.recv().await.unwrap();
        assert!(seen.insert(seq), "duplicate callback for seq {seq}");
        assert_eq!(res.unwrap(), Value::Status("PONG".into()));
    }
    assert_eq!(seen.len() as u64, total);
    server.stop();
}

// Scenario 6: SendBatch where request index 3 has an unencodable arg.
#[tokio::test]
async fn batch_with_one_bad_request_fails_all_or_nothing() {
    let server = FakeServer::start(ServerConfig::default()).await;
    let conn = Connection::connect(&server.addr, fast_opts()).await.unwrap();

    let reqs = vec![
        Request::new("PING"),
        Request::new("PING"),
        Request::new("PING"),
        Request {
            cmd: "SET",
            args: vec![Arg::Str("k".into()), Arg::Invalid],
        },
        Request::new("PING"),
    ];

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let cb = callback(move |res, seq| {
        let _ = tx.send((seq, res));
    });
    conn.send_batch(reqs, cb, 0);

    let mut by_seq = std::collections::HashMap::new();
    for _ in 0..5 {
        let (seq, res) = rx.recv().await.unwrap();
        by_seq.insert(seq, res);
    }

    let bad = by_seq.remove(&3).unwrap().unwrap_err();
    assert_eq!(bad.kind(), ErrorKind::ArgumentType);
    for seq in [0u64, 1, 2, 4] {
        let err = by_seq.remove(&seq).unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BatchFailed(3));
    }
    server.stop();
}

// Law 9: after Close, every new Send's callback fires with ContextClosed.
#[tokio::test]
async fn send_after_close_fails_with_context_closed() {
    let server = FakeServer::start(ServerConfig::default()).await;
    let conn = Connection::connect(&server.addr, fast_opts()).await.unwrap();
    conn.close();

    // Give the close task a moment to flip the state atom.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let cb = callback(move |res, seq| {
        let _ = tx.send((seq, res));
    });
    conn.send(Request::new("PING"), cb, 1);

    let (_, res) = rx.recv().await.unwrap();
    assert_eq!(res.unwrap_err().kind(), ErrorKind::ContextClosed);
    server.stop();
}

#[allow(dead_code)]
fn _assert_callback_is_send_sync(c: Arc<dyn Fn(Result<Value, redis_pipe::Error>, u64) + Send + Sync>) {
    let _ = c;
}
