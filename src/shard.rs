//! The sharded submission fabric (§4.A): per-shard buffers that let N
//! producers enqueue requests without serializing on one mutex, plus the
//! dirty-shard signal that tells the writer which shards have work.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::error::{Error, ErrorKind};
use crate::resp::{Request, Value};
use crate::state::StateCell;

/// `(callback, sequence_number)`. Created at submission, consumed exactly
/// once: either by the reader with a decoded value, or by an error-draining
/// path with a failure.
pub struct PendingFuture {
    pub cb: Box<dyn FnOnce(Result<Value, Error>) + Send + 'static>,
    pub seq: u64,
}

impl PendingFuture {
    pub fn fire(self, result: Result<Value, Error>) {
        (self.cb)(result);
    }
}

struct ShardInner {
    buffer: Vec<u8>,
    futures: Vec<PendingFuture>,
}

/// One producer-group staging area. Padded to a cache-line multiple so
/// concurrent producers hitting different shards don't false-share a line,
/// the same trick the pack's pool-sharding code uses for its per-shard
/// bitsets.
#[cfg_attr(target_pointer_width = "64", repr(align(128)))]
#[cfg_attr(not(target_pointer_width = "64"), repr(align(64)))]
struct Shard {
    inner: Mutex<ShardInner>,
}

impl Shard {
    fn new() -> Self {
        Shard {
            inner: Mutex::new(ShardInner {
                buffer: Vec::new(),
                futures: Vec::new(),
            }),
        }
    }
}

/// The full array of shards plus the bounded dirty-shard channel that
/// announces which ones have pending bytes to flush.
pub struct ShardArray {
    shards: Box<[Shard]>,
    next: AtomicUsize,
    dirty_tx: mpsc::Sender<usize>,
    /// Only the currently-active writer holds this locked while it awaits
    /// the next signal; reconnects hand it to the new writer task.
    dirty_rx: tokio::sync::Mutex<mpsc::Receiver<usize>>,
}

/// The outcome of a `SubmitBatch` encoding pass, used to decide which
/// error each request in the batch receives.
enum EncodeOutcome {
    Ok,
    FailedAt(usize),
}

impl ShardArray {
    pub fn new(n: usize) -> Self {
        assert!(n > 0, "shard count must be positive");
        let (dirty_tx, dirty_rx) = mpsc::channel(2 * n);
        ShardArray {
            shards: (0..n).map(|_| Shard::new()).collect(),
            next: AtomicUsize::new(0),
            dirty_tx,
            dirty_rx: tokio::sync::Mutex::new(dirty_rx),
        }
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// Locks the dirty-shard receiver for the duration of a session's
    /// writer loop. Exactly one writer may hold this at a time; reconnects
    /// naturally serialize through the connection mutex so there's never
    /// contention in practice.
    pub async fn lock_dirty_rx(
        &self,
    ) -> tokio::sync::MutexGuard<'_, mpsc::Receiver<usize>> {
        self.dirty_rx.lock().await
    }

    fn pick_shard(&self) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % self.shards.len()
    }

    /// Implements §4.A `Submit`. `schedule_reject` is invoked (on a fresh
    /// task, never inline) when admission fails so the callback never runs
    /// under the shard lock.
    pub fn submit(
        &self,
        state: &StateCell,
        req: Request,
        future: PendingFuture,
        schedule_reject: impl FnOnce(PendingFuture, Error) + Send + 'static,
    ) {
        let idx = self.pick_shard();
        let shard = &self.shards[idx];
        let mut inner = shard.inner.lock().unwrap();

        let st = state.load();
        if !st.accepts_writes() {
            let err = if st == crate::state::State::Closed {
                Error::new(ErrorKind::ContextClosed)
            } else {
                Error::new(ErrorKind::Disconnected)
            };
            drop(inner);
            schedule_reject(future, err);
            return;
        }

        let was_empty = inner.buffer.is_empty();
        if let Err(err) = req.encode_into(&mut inner.buffer) {
            drop(inner);
            schedule_reject(future, err);
            return;
        }
        inner.futures.push(future);
        let now_len = inner.buffer.len();
        drop(inner);

        // Only a transition from empty to non-empty re-dirties the shard:
        // the writer is guaranteed to drain whatever is here by the time it
        // next observes the shard as clean, so signaling on every append
        // would just waste channel capacity.
        if was_empty && now_len > 0 {
            // `try_send` never blocks; the channel has capacity `2N` and is
            // only ever signaled on an empty->non-empty edge, so it cannot
            // overflow (§8 invariant 6). A full channel here would indicate
            // a logic bug, not legitimate backpressure, so the dropped
            // signal is acceptable: the writer will still observe the
            // shard's buffer on its next sweep triggered by a later signal.
            let _ = self.dirty_tx.try_send(idx);
        }
    }

    /// Implements §4.A `SubmitBatch`: all-or-nothing encoding. If the
    /// *i*-th request fails, every request fails (`i` with `ArgumentType`,
    /// the rest with `BatchFailed` naming `i`) and the shard is left
    /// unchanged.
    pub fn submit_batch(
        &self,
        state: &StateCell,
        reqs: Vec<Request>,
        mut futures: Vec<PendingFuture>,
        schedule_reject_all: impl FnOnce(Vec<PendingFuture>, Vec<Error>) + Send + 'static,
    ) {
        assert_eq!(reqs.len(), futures.len());
        let idx = self.pick_shard();
        let shard = &self.shards[idx];
        let mut inner = shard.inner.lock().unwrap();

        let st = state.load();
        if !st.accepts_writes() {
            let err = if st == crate::state::State::Closed {
                Error::new(ErrorKind::ContextClosed)
            } else {
                Error::new(ErrorKind::Disconnected)
            };
            drop(inner);
            let errs = vec![err; futures.len()];
            schedule_reject_all(futures, errs);
            return;
        }

        let was_empty = inner.buffer.is_empty();
        let start = inner.buffer.len();

        let outcome = {
            let mut outcome = EncodeOutcome::Ok;
            for (i, req) in reqs.iter().enumerate() {
                if req.encode_into(&mut inner.buffer).is_err() {
                    outcome = EncodeOutcome::FailedAt(i);
                    break;
                }
            }
            outcome
        };

        match outcome {
            EncodeOutcome::Ok => {
                let now_len = inner.buffer.len();
                inner.futures.append(&mut futures);
                drop(inner);
                if was_empty && now_len > 0 {
                    let _ = self.dirty_tx.try_send(idx);
                }
            }
            EncodeOutcome::FailedAt(bad_index) => {
                inner.buffer.truncate(start);
                drop(inner);
                let errs = (0..futures.len())
                    .map(|i| {
                        if i == bad_index {
                            Error::new(ErrorKind::ArgumentType)
                        } else {
                            Error::batch_failed(bad_index)
                        }
                    })
                    .collect();
                schedule_reject_all(futures, errs);
            }
        }
    }

    /// Swaps the shard's buffer and futures out under its lock, leaving it
    /// empty (so producers that append next will re-dirty it). Used by the
    /// writer on each dirty-shard signal.
    pub fn swap_out(&self, idx: usize, packet: &mut Vec<u8>, futures: &mut Vec<PendingFuture>) {
        let shard = &self.shards[idx];
        let mut inner = shard.inner.lock().unwrap();
        std::mem::swap(packet, &mut inner.buffer);
        std::mem::swap(futures, &mut inner.futures);
    }

    /// Drains every shard's buffer and futures, firing each pending future
    /// with `err`. Used on session failure and on shutdown: it is the only
    /// place futures already committed under the shard lock, but never
    /// handed to a writer, are released.
    pub fn drain_all(&self, err: &Error) {
        for shard in self.shards.iter() {
            let mut inner = shard.inner.lock().unwrap();
            inner.buffer.clear();
            let futures = std::mem::take(&mut inner.futures);
            drop(inner);
            for f in futures {
                f.fire(Err(err.clone()));
            }
        }
    }

    /// `true` iff every shard is quiescent (buffer and futures both empty),
    /// matching §3's invariant that the two are never empty/non-empty in
    /// different combinations.
    #[cfg(test)]
    pub fn all_quiescent(&self) -> bool {
        self.shards.iter().all(|s| {
            let inner = s.inner.lock().unwrap();
            inner.buffer.is_empty() == inner.futures.is_empty()
        })
    }
}
