//! The OneConn session (§4.C): a single live socket plus its writer and
//! reader workers, bound together by a one-shot error latch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;

use crate::error::{Error, ErrorKind};
use crate::resp::{Value, ValueCodec};
use crate::shard::{PendingFuture, ShardArray};
use crate::transport::{ReadHalf, WriteHalf};

/// A one-shot latch: the first error wins, everyone waiting is woken
/// exactly once, and later callers of `set` are no-ops. Shared by the
/// writer, the reader, and external observers (reconnect loop) of a single
/// session.
pub(crate) struct ErrorLatch {
    error: Mutex<Option<Error>>,
    notify: Notify,
}

impl ErrorLatch {
    fn new() -> Arc<Self> {
        Arc::new(ErrorLatch {
            error: Mutex::new(None),
            notify: Notify::new(),
        })
    }

    /// Returns `true` if this call is the one that latched the error.
    pub fn set(&self, err: Error) -> bool {
        let mut guard = self.error.lock().unwrap();
        if guard.is_some() {
            return false;
        }
        *guard = Some(err);
        drop(guard);
        self.notify.notify_waiters();
        true
    }

    pub fn get(&self) -> Option<Error> {
        self.error.lock().unwrap().clone()
    }

    /// Resolves once an error has been latched, delivering it. Used by the
    /// writer/reader select loops as one of the wakeup sources.
    pub async fn wait(&self) -> Error {
        loop {
            if let Some(e) = self.get() {
                return e;
            }
            self.notify.notified().await;
        }
    }
}

/// The connection-wide cancellation root (§5: "the single root"). Persists
/// across reconnects; sessions observe it alongside their own error latch.
pub(crate) struct CancelSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    pub fn new() -> Self {
        CancelSignal {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Fires the signal. Returns `true` if this call was the one that fired
    /// it (idempotent: later calls are no-ops), matching §4.D's "repeated
    /// cancellation is a no-op".
    pub fn cancel(&self) -> bool {
        if !self.flag.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
            true
        } else {
            false
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            self.notify.notified().await;
        }
    }
}

fn next_power_of_two_at_least(n: usize) -> usize {
    n.max(1).next_power_of_two()
}

/// Fires every future in a batch that never made it to the reader, so a
/// writer-side failure still resolves each one exactly once.
fn fire_batch(batch: Vec<PendingFuture>, err: Error) {
    for f in batch {
        f.fire(Err(err.clone()));
    }
}

/// All state tied to one live socket. Replaced wholesale on reconnect.
pub(crate) struct OneConn {
    pub error_latch: Arc<ErrorLatch>,
    pub local_addr: String,
    pub remote_addr: String,
    writer_task: JoinHandle<()>,
    reader_task: JoinHandle<()>,
}

impl OneConn {
    /// Splits the socket and spawns the writer and reader tasks. `shards`
    /// and `cancel` are owned by the connection and outlive every session.
    pub fn spawn(
        read: ReadHalf,
        write: WriteHalf,
        local_addr: String,
        remote_addr: String,
        shards: Arc<ShardArray>,
        cancel: Arc<CancelSignal>,
        io_timeout: Option<Duration>,
        addr_tag: Arc<str>,
    ) -> Self {
        let error_latch = ErrorLatch::new();
        // Bounded to 8N per the backpressure design (§5): caps the writer
        // ahead of the reader so a slow reader throttles the writer instead
        // of letting in-flight futures grow without bound.
        let inflight_cap = (8 * shards.len()).max(8);
        let (inflight_tx, inflight_rx) = mpsc::channel(inflight_cap);

        let writer_task = tokio::spawn(writer_loop(
            write,
            shards.clone(),
            error_latch.clone(),
            cancel.clone(),
            inflight_tx,
            io_timeout,
            addr_tag.clone(),
        ));

        let reader_task = tokio::spawn(reader_loop(
            read,
            inflight_rx,
            error_latch.clone(),
            cancel,
            addr_tag,
        ));

        OneConn {
            error_latch,
            local_addr,
            remote_addr,
            writer_task,
            reader_task,
        }
    }

    /// Aborts both workers immediately; used on shutdown once shards have
    /// already been drained.
    pub fn abort(&self) {
        self.writer_task.abort();
        self.reader_task.abort();
    }
}

async fn flush_with_timeout(
    write: &mut BufWriter<WriteHalf>,
    io_timeout: Option<Duration>,
) -> Result<(), Error> {
    match io_timeout {
        Some(d) => tokio::time::timeout(d, write.flush())
            .await
            .map_err(|_| Error::with_message(ErrorKind::Io, "flush timed out"))?
            .map_err(Error::from),
        None => write.flush().await.map_err(Error::from),
    }
}

async fn write_all_with_timeout(
    write: &mut BufWriter<WriteHalf>,
    packet: &[u8],
    io_timeout: Option<Duration>,
) -> Result<(), Error> {
    match io_timeout {
        Some(d) => tokio::time::timeout(d, write.write_all(packet))
            .await
            .map_err(|_| Error::with_message(ErrorKind::Io, "write timed out"))?
            .map_err(Error::from),
        None => write.write_all(packet).await.map_err(Error::from),
    }
}

/// The writer worker (§4.C). Swaps dirty shards' buffers out under their
/// lock, batches them into the socket's buffered writer, and hands the
/// corresponding futures to the reader over the in-flight channel.
async fn writer_loop(
    write_half: WriteHalf,
    shards: Arc<ShardArray>,
    latch: Arc<ErrorLatch>,
    cancel: Arc<CancelSignal>,
    inflight_tx: mpsc::Sender<Vec<PendingFuture>>,
    io_timeout: Option<Duration>,
    addr_tag: Arc<str>,
) {
    let mut write = BufWriter::new(write_half);
    let mut packet: Vec<u8> = Vec::new();
    let mut futures: Vec<PendingFuture> = Vec::new();
    let mut iterations: u64 = 0u64;

    'outer: loop {
        let idx = match try_next_dirty(&shards).await {
            Some(i) => i,
            None => {
                // Cooperative yield: a batching optimization, not a
                // correctness requirement. It lets more producers coalesce
                // onto this shard's buffer before we pay for a flush.
                tokio::task::yield_now().await;
                match try_next_dirty(&shards).await {
                    Some(i) => i,
                    None => {
                        if let Err(e) = flush_with_timeout(&mut write, io_timeout).await {
                            latch.set(e);
                            break 'outer;
                        }
                        let mut rx = shards.lock_dirty_rx().await;
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break 'outer,
                            _ = latch.wait() => break 'outer,
                            maybe = rx.recv() => match maybe {
                                Some(i) => i,
                                None => break 'outer,
                            },
                        }
                    }
                }
            }
        };

        shards.swap_out(idx, &mut packet, &mut futures);

        if packet.is_empty() {
            if !futures.is_empty() {
                unreachable!(
                    "shard invariant violated: empty buffer with {} pending futures",
                    futures.len()
                );
            }
            continue;
        }

        let prev_len = futures.len();
        let batch = std::mem::replace(
            &mut futures,
            Vec::with_capacity(next_power_of_two_at_least(prev_len)),
        );

        match inflight_tx.try_send(batch) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(batch)) => {
                if let Err(e) = flush_with_timeout(&mut write, io_timeout).await {
                    fire_batch(batch, e.clone());
                    latch.set(e);
                    break 'outer;
                }
                if let Err(mpsc::error::SendError(batch)) = inflight_tx.send(batch).await {
                    // Reader is gone; nothing left to hand batches to.
                    let err = latch
                        .get()
                        .unwrap_or_else(|| Error::new(ErrorKind::Io).tagged(addr_tag.clone()));
                    fire_batch(batch, err);
                    break 'outer;
                }
            }
            Err(mpsc::error::TrySendError::Closed(batch)) => {
                let err = latch
                    .get()
                    .unwrap_or_else(|| Error::new(ErrorKind::Io).tagged(addr_tag.clone()));
                fire_batch(batch, err);
                break 'outer;
            }
        }

        if let Err(e) = write_all_with_timeout(&mut write, &packet, io_timeout).await {
            latch.set(e);
            break 'outer;
        }

        iterations += 1;
        if iterations % 1024 == 0 {
            packet = Vec::new();
        } else {
            packet.clear();
        }
    }

    tracing::debug!(addr = %addr_tag, "writer loop exiting");
}

/// Tries to pull a dirty shard index without blocking, taking the shared
/// receiver lock only for the duration of the `try_recv`.
async fn try_next_dirty(shards: &ShardArray) -> Option<usize> {
    let mut rx = shards.lock_dirty_rx().await;
    rx.try_recv().ok()
}

/// The reader worker (§4.C). Consumes future-batches from the writer in
/// order; for each future, decodes one RESP value and fires its callback.
async fn reader_loop(
    read_half: ReadHalf,
    mut inflight_rx: mpsc::Receiver<Vec<PendingFuture>>,
    latch: Arc<ErrorLatch>,
    cancel: Arc<CancelSignal>,
    addr_tag: Arc<str>,
) {
    let mut framed = FramedRead::new(read_half, ValueCodec::default());

    'outer: while let Some(batch) = inflight_rx.recv().await {
        let mut remaining = batch.into_iter();
        while let Some(future) = remaining.next() {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let err = Error::new(ErrorKind::ContextClosed).tagged(addr_tag.clone());
                    future.fire(Err(err.clone()));
                    fire_batch(remaining.collect(), err);
                    break 'outer;
                }
                item = framed.next() => item,
            };

            match outcome {
                Some(Ok(value)) => future.fire(Ok(value)),
                Some(Err(e)) => {
                    let err = e.tagged(addr_tag.clone());
                    latch.set(err.clone());
                    future.fire(Err(err.clone()));
                    fire_batch(remaining.collect(), err);
                    break 'outer;
                }
                None => {
                    let err = Error::with_message(ErrorKind::Io, "connection closed by peer")
                        .tagged(addr_tag.clone());
                    latch.set(err.clone());
                    future.fire(Err(err.clone()));
                    fire_batch(remaining.collect(), err);
                    break 'outer;
                }
            }
        }
    }

    // Mandatory drain (§4.C): every future the writer already handed off
    // must be resolved even though we've stopped reading from the socket.
    let err = latch
        .get()
        .unwrap_or_else(|| Error::new(ErrorKind::Io).tagged(addr_tag.clone()));
    while let Some(batch) = inflight_rx.recv().await {
        for f in batch {
            f.fire(Err(err.clone()));
        }
    }

    tracing::debug!(addr = %addr_tag, "reader loop exiting");
}

/// Issues a single request and awaits its one reply, without going through
/// the sharded submission path. Used for the handshake and the health
/// probe, which both need a synchronous request/response outside of the
/// pipelined fast path.
pub(crate) async fn roundtrip_many(
    write: &mut (impl tokio::io::AsyncWrite + Unpin),
    read: &mut FramedRead<impl tokio::io::AsyncRead + Unpin, ValueCodec>,
    packet: &[u8],
    expected: usize,
) -> Result<Vec<Value>, Error> {
    write.write_all(packet).await?;
    write.flush().await?;
    let mut out = Vec::with_capacity(expected);
    for _ in 0..expected {
        match read.next().await {
            Some(Ok(v)) => out.push(v),
            Some(Err(e)) => return Err(e),
            None => {
                return Err(Error::with_message(
                    ErrorKind::Io,
                    "connection closed during handshake",
                ))
            }
        }
    }
    Ok(out)
}
