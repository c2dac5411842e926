//! The connection lifecycle state machine (§4.D) and the public submission
//! API (§4.E).

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio_util::codec::FramedRead;

use crate::error::{Error, ErrorKind};
use crate::log::{LogEvent, Logger};
use crate::opts::{Address, Handle, NormalizedOpts, Opts};
use crate::resp::{Request, Value, ValueCodec};
use crate::session::{roundtrip_many, CancelSignal, OneConn};
use crate::shard::{PendingFuture, ShardArray};
use crate::state::{State, StateCell};
use crate::transport::{ActualConnection, ReadHalf, WriteHalf};

/// A request's callback: invoked exactly once with the decoded value (or
/// the failure) and the sequence number it was submitted with.
pub type Callback = Arc<dyn Fn(Result<Value, Error>, u64) + Send + Sync + 'static>;

/// Convenience constructor for [`Callback`] from a plain closure.
pub fn callback(f: impl Fn(Result<Value, Error>, u64) + Send + Sync + 'static) -> Callback {
    Arc::new(f)
}

struct SessionSlot {
    current: Option<Arc<OneConn>>,
}

struct ConnectionInner {
    addr: Address,
    addr_tag: Arc<str>,
    opts: NormalizedOpts,
    handle: Option<Handle>,
    logger: Arc<dyn Logger>,
    state: StateCell,
    shards: Arc<ShardArray>,
    cancel: Arc<CancelSignal>,
    session: tokio::sync::Mutex<SessionSlot>,
    /// Last-known local/remote socket addresses, kept outside the async
    /// session mutex so synchronous inspection (`local_addr`/`remote_addr`)
    /// never has to await a lock.
    addrs: ArcSwapOption<(String, String)>,
    close_error: std::sync::Mutex<Option<Error>>,
}

/// A pipelined connection to a Redis-compatible server. Cheaply cloneable;
/// clones share the same shards, session, and state.
#[derive(Clone)]
pub struct Connection(Arc<ConnectionInner>);

impl Connection {
    /// Connects to `addr` (see the address syntax in §6) using `opts`.
    ///
    /// Synchronous unless `opts.r#async` is set: in that mode this returns
    /// as soon as the state leaves `Disconnected`, without waiting for the
    /// handshake, so the first subsequent `send` buffers instead of being
    /// rejected.
    pub async fn connect(addr: &str, opts: Opts) -> Result<Connection, Error> {
        let address = Address::parse(addr)?;
        let num_cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let normalized = opts.normalize(num_cpus);
        let addr_tag: Arc<str> = Arc::from(address.to_string());

        let inner = Arc::new(ConnectionInner {
            shards: Arc::new(ShardArray::new(normalized.concurrency)),
            addr: address,
            addr_tag: addr_tag.clone(),
            opts: normalized,
            handle: opts.handle,
            logger: opts.logger,
            state: StateCell::new(State::Disconnected),
            cancel: Arc::new(CancelSignal::new()),
            session: tokio::sync::Mutex::new(SessionSlot { current: None }),
            addrs: ArcSwapOption::from(None),
            close_error: std::sync::Mutex::new(None),
        });

        if opts.r#async {
            inner.state.store(State::Connecting);
            tokio::spawn(reconnect_loop(inner.clone()));
            tokio::spawn(health_probe_loop(inner.clone()));
            return Ok(Connection(inner));
        }

        inner
            .logger
            .log(LogEvent::Connecting { addr: addr_tag.clone() });

        match dial_and_handshake(&inner).await {
            Ok((read, write, local, remote)) => {
                install_session(&inner, read, write, local, remote).await;
                inner.state.store(State::Connected);
                tokio::spawn(reconnect_loop(inner.clone()));
                tokio::spawn(health_probe_loop(inner.clone()));
                Ok(Connection(inner))
            }
            Err(e) => {
                inner.logger.log(LogEvent::ConnectFailed {
                    addr: addr_tag.clone(),
                    error: e.clone(),
                });
                let terminal = e.kind() == ErrorKind::Auth || !inner.opts.reconnect_enabled;
                if terminal {
                    inner.state.store(State::Closed);
                    let mut close_err = inner.close_error.lock().unwrap();
                    if close_err.is_none() {
                        *close_err = Some(e.clone());
                    }
                    return Err(e);
                }
                inner.state.store(State::Disconnected);
                tokio::spawn(reconnect_loop(inner.clone()));
                tokio::spawn(health_probe_loop(inner.clone()));
                Ok(Connection(inner))
            }
        }
    }

    /// Implements `Send` (§4.A): picks a shard round-robin, admits or
    /// rejects based on connection state, and fires `cb(value_or_error,
    /// seq)` exactly once, never under the shard lock.
    pub fn send(&self, req: Request, cb: Callback, seq: u64) {
        let wrapped = Box::new(move |res: Result<Value, Error>| cb(res, seq));
        let future = PendingFuture { cb: wrapped, seq };
        self.0
            .shards
            .submit(&self.0.state, req, future, |future, err| {
                tokio::spawn(async move { future.fire(Err(err)) });
            });
    }

    /// Implements `SendBatch` (§4.A): all-or-nothing encoding across the
    /// batch, `seq` assigned as `start_seq + index`.
    pub fn send_batch(&self, reqs: Vec<Request>, cb: Callback, start_seq: u64) {
        let futures = reqs
            .iter()
            .enumerate()
            .map(|(i, _)| {
                let seq = start_seq + i as u64;
                let cb = cb.clone();
                PendingFuture {
                    seq,
                    cb: Box::new(move |res| cb(res, seq)),
                }
            })
            .collect();

        self.0
            .shards
            .submit_batch(&self.0.state, reqs, futures, |futures, errs| {
                tokio::spawn(async move {
                    for (future, err) in futures.into_iter().zip(errs) {
                        future.fire(Err(err));
                    }
                });
            });
    }

    pub fn is_connected(&self) -> bool {
        self.0.state.load() == State::Connected
    }

    pub fn may_be_connected(&self) -> bool {
        self.0.state.load().may_be_connected()
    }

    pub fn addr(&self) -> &Address {
        &self.0.addr
    }

    pub fn handle(&self) -> Option<&Handle> {
        self.0.handle.as_ref()
    }

    pub fn remote_addr(&self) -> Option<String> {
        self.0.addrs.load().as_ref().map(|a| a.1.clone())
    }

    pub fn local_addr(&self) -> Option<String> {
        self.0.addrs.load().as_ref().map(|a| a.0.clone())
    }

    /// Triggers shutdown and returns immediately; the actual teardown
    /// (closing the socket, draining shards and in-flight batches with
    /// `ErrorKind::ContextClosed`) completes on a spawned task. Idempotent.
    pub fn close(&self) {
        if !self.0.cancel.cancel() {
            return;
        }
        let inner = self.0.clone();
        tokio::spawn(async move {
            let err = Error::new(ErrorKind::ContextClosed).tagged(inner.addr_tag.clone());
            {
                let mut close_err = inner.close_error.lock().unwrap();
                if close_err.is_none() {
                    *close_err = Some(err.clone());
                }
            }
            inner.state.store(State::Closed);
            let mut guard = inner.session.lock().await;
            if let Some(session) = guard.current.take() {
                session.abort();
            }
            drop(guard);
            inner.shards.drain_all(&err);
            inner
                .logger
                .log(LogEvent::ContextClosed { addr: inner.addr_tag.clone() });
        });
    }

    /// The error the connection was closed with, if any.
    pub fn close_error(&self) -> Option<Error> {
        self.0.close_error.lock().unwrap().clone()
    }
}

async fn install_session(
    inner: &Arc<ConnectionInner>,
    read: ReadHalf,
    write: WriteHalf,
    local: String,
    remote: String,
) {
    let session = Arc::new(OneConn::spawn(
        read,
        write,
        local.clone(),
        remote.clone(),
        inner.shards.clone(),
        inner.cancel.clone(),
        inner.opts.io_timeout,
        inner.addr_tag.clone(),
    ));
    {
        let mut guard = inner.session.lock().await;
        guard.current = Some(session);
    }
    inner.addrs.store(Some(Arc::new((local.clone(), remote.clone()))));
    inner.logger.log(LogEvent::Connected {
        local: Arc::from(local),
        remote: Arc::from(remote),
    });
}

/// Runs under the connection's session mutex for the duration of each dial
/// attempt: publishes `Connecting`, dials, and on success installs the new
/// session and waits for it to fail before looping. On failure it drains
/// shard queues with the dial error and sleeps `ReconnectPause` (paced from
/// the start of the failed attempt, not from when the sleep begins).
///
/// The spec this implements describes holding the connection mutex across
/// the sleep so `Close` must wait for the sleeper's next wakeup. We instead
/// race the sleep against the cancellation signal with `select!`, which
/// wakes a pending pause immediately on `Close` while leaving the mutex
/// free for the duration of the sleep — a strict improvement with the same
/// observable reconnect cadence, noted here since the spec flags the
/// condvar-based alternative explicitly.
async fn reconnect_loop(inner: Arc<ConnectionInner>) {
    loop {
        if inner.state.load() == State::Closed {
            return;
        }

        let existing = { inner.session.lock().await.current.clone() };
        if let Some(session) = existing {
            tokio::select! {
                _ = inner.cancel.cancelled() => return,
                err = session.error_latch.wait() => {
                    inner.logger.log(LogEvent::Disconnected {
                        addr: inner.addr_tag.clone(),
                        error: err.clone(),
                    });
                    inner.shards.drain_all(&err);
                    inner.session.lock().await.current = None;
                    if !inner.opts.reconnect_enabled {
                        inner.state.store(State::Closed);
                        let mut close_err = inner.close_error.lock().unwrap();
                        if close_err.is_none() {
                            *close_err = Some(err);
                        }
                        return;
                    }
                    inner.state.store(State::Disconnected);
                }
            }
            continue;
        }

        if inner.state.load() == State::Closed {
            return;
        }

        inner.state.store(State::Connecting);
        inner
            .logger
            .log(LogEvent::Connecting { addr: inner.addr_tag.clone() });
        let attempt_start = tokio::time::Instant::now();

        match dial_and_handshake(&inner).await {
            Ok((read, write, local, remote)) => {
                if inner.cancel.is_cancelled() {
                    // `close()` fired while this dial was in flight. Let the
                    // freshly dialed socket drop rather than publish a
                    // session on top of a connection that is tearing down.
                    drop((read, write));
                    return;
                }
                install_session(&inner, read, write, local, remote).await;
                if inner.cancel.is_cancelled() {
                    // `close()` raced `install_session` itself: the session
                    // it just published is never seen by `close`'s own
                    // cleanup if that cleanup already ran its drain, so undo
                    // the install here instead of leaving `Closed` silently
                    // reverted to `Connected` by the store below.
                    let mut guard = inner.session.lock().await;
                    if let Some(session) = guard.current.take() {
                        session.abort();
                    }
                    drop(guard);
                    return;
                }
                inner.state.store(State::Connected);
            }
            Err(e) => {
                inner.logger.log(LogEvent::ConnectFailed {
                    addr: inner.addr_tag.clone(),
                    error: e.clone(),
                });
                inner.shards.drain_all(&e);
                let terminal = e.kind() == ErrorKind::Auth || !inner.opts.reconnect_enabled;
                if terminal {
                    inner.state.store(State::Closed);
                    let mut close_err = inner.close_error.lock().unwrap();
                    if close_err.is_none() {
                        *close_err = Some(e);
                    }
                    return;
                }
                if inner.cancel.is_cancelled() {
                    // `close()` fired while this dial attempt was failing;
                    // `Closed` must stay terminal, not bounce to
                    // `Disconnected` for the instant before the next loop
                    // iteration's cancellation check.
                    return;
                }
                inner.state.store(State::Disconnected);
                let deadline = attempt_start + inner.opts.reconnect_pause;
                tokio::select! {
                    _ = inner.cancel.cancelled() => return,
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
        }
    }
}

/// Background ticker at `IOTimeout/3` that issues a synchronous `PING`
/// through the normal pipeline. A `PONG` mismatch from an otherwise
/// working socket is treated as a server invariant violation and is
/// process-fatal by default (§4.D, §9 open question) — operators who'd
/// rather log-and-reconnect should swap this for their own loop built on
/// the same public `send` API.
async fn health_probe_loop(inner: Arc<ConnectionInner>) {
    let conn = Connection(inner.clone());
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = tokio::time::sleep(inner.opts.health_probe_interval) => {}
        }
        if inner.cancel.is_cancelled() {
            return;
        }
        if inner.state.load() != State::Connected {
            continue;
        }

        let (tx, rx) = tokio::sync::oneshot::channel();
        let cb = callback(move |res, _seq| {
            let _ = tx.send(res);
        });
        conn.send(Request::new("PING"), cb, 0);

        match rx.await {
            Ok(Ok(Value::Status(ref s))) if s == "PONG" => {}
            Ok(Ok(other)) => {
                let err = Error::with_message(
                    ErrorKind::Ping,
                    format!("expected PONG from health probe, got {other:?}"),
                )
                .tagged(inner.addr_tag.clone());
                inner.logger.log(LogEvent::Disconnected {
                    addr: inner.addr_tag.clone(),
                    error: err.clone(),
                });
                tracing::error!(
                    addr = %inner.addr_tag,
                    %err,
                    "health probe got a protocol mismatch from a working socket; aborting process"
                );
                std::process::abort();
            }
            // Session-level errors already trigger reconnection through
            // the normal writer/reader error-latch path; nothing to do.
            Ok(Err(_)) | Err(_) => {}
        }
    }
}

async fn dial_and_handshake(
    inner: &ConnectionInner,
) -> Result<(ReadHalf, WriteHalf, String, String), Error> {
    let actual = dial(&inner.addr, inner.opts.dial_timeout, inner.opts.tcp_keepalive).await?;
    handshake(actual, &inner.opts).await
}

async fn dial(
    addr: &Address,
    dial_timeout: std::time::Duration,
    keepalive: Option<std::time::Duration>,
) -> Result<ActualConnection, Error> {
    let connect = async {
        match addr {
            Address::Tcp(hostport) => {
                let stream = TcpStream::connect(hostport.as_str()).await?;
                stream.set_nodelay(true).ok();
                Ok(ActualConnection::Tcp(stream))
            }
            #[cfg(unix)]
            Address::Unix(path) => Ok(ActualConnection::Unix(UnixStream::connect(path).await?)),
            #[cfg(not(unix))]
            Address::Unix(_) => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "unix sockets are unsupported on this platform",
            )),
        }
    };

    let actual = tokio::time::timeout(dial_timeout, connect)
        .await
        .map_err(|_| Error::with_message(ErrorKind::Dial, "dial timed out"))?
        .map_err(|e| Error::with_cause(ErrorKind::Dial, e))?;

    actual
        .set_keepalive(keepalive)
        .map_err(|e| Error::with_cause(ErrorKind::Dial, e))?;

    Ok(actual)
}

/// Batches `AUTH`? + `PING` + `SELECT`? into one write, reads the replies
/// in the same order, and validates each (§4.D).
async fn handshake(
    actual: ActualConnection,
    opts: &NormalizedOpts,
) -> Result<(ReadHalf, WriteHalf, String, String), Error> {
    let local_addr = actual.local_addr().unwrap_or_default();
    let remote_addr = actual.peer_addr().unwrap_or_default();
    let (read_half, write_half) = actual.into_split();
    let mut framed = FramedRead::new(read_half, ValueCodec::default());
    let mut write_half = write_half;

    let mut packet = Vec::new();
    let has_auth = opts.password.is_some();
    if let Some(pw) = &opts.password {
        Request::new("AUTH")
            .arg(pw.as_str())
            .encode_into(&mut packet)
            .expect("AUTH password is always a valid bulk string");
    }
    Request::new("PING")
        .encode_into(&mut packet)
        .expect("PING has no args to fail encoding");
    let has_select = opts.db != 0;
    if has_select {
        Request::new("SELECT")
            .arg(opts.db)
            .encode_into(&mut packet)
            .expect("SELECT's integer arg always encodes");
    }

    let expected = has_auth as usize + 1 + has_select as usize;
    let roundtrip = roundtrip_many(&mut write_half, &mut framed, &packet, expected);
    let replies = match opts.io_timeout {
        Some(d) => tokio::time::timeout(d, roundtrip)
            .await
            .map_err(|_| Error::with_message(ErrorKind::Dial, "handshake timed out"))??,
        None => roundtrip.await?,
    };

    let mut idx = 0;
    if has_auth {
        let reply = &replies[idx];
        idx += 1;
        match reply {
            Value::Status(s) if s == "OK" => {}
            Value::Error(msg) if msg.to_lowercase().contains("password") => {
                return Err(Error::with_message(ErrorKind::Auth, msg.clone()));
            }
            other => {
                return Err(Error::with_message(
                    ErrorKind::Dial,
                    format!("AUTH failed: {other:?}"),
                ));
            }
        }
    }

    {
        let reply = &replies[idx];
        idx += 1;
        match reply {
            Value::Status(s) if s == "PONG" => {}
            other => {
                return Err(Error::with_message(
                    ErrorKind::Dial,
                    format!("handshake PING mismatch: {other:?}"),
                ));
            }
        }
    }

    if has_select {
        let reply = &replies[idx];
        match reply {
            Value::Status(s) if s == "OK" => {}
            // Open Question resolution (§9): the upstream source formats
            // this error with one value for a two-placeholder template.
            // Both the db index and the offending reply are included here.
            other => {
                return Err(Error::with_message(
                    ErrorKind::Response,
                    format!("SELECT {} failed: server replied {other:?}", opts.db),
                ));
            }
        }
    }

    Ok((framed.into_inner(), write_half, local_addr, remote_addr))
}
