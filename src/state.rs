//! The connection lifecycle state atom (§4.D).

use std::sync::atomic::{AtomicU8, Ordering};

/// `{Disconnected, Connecting, Connected, Closed}`, stored as a single
/// atomic word so admission checks (`Send`) never take a lock to read it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Closed = 3,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Disconnected,
            1 => State::Connecting,
            2 => State::Connected,
            3 => State::Closed,
            _ => unreachable!("invalid state byte {v}"),
        }
    }

    /// `Send`/`SendBatch` accept writes in `Connecting` and `Connected`
    /// (§4.D admission rule) so an async-starting client can enqueue before
    /// the handshake completes.
    pub fn accepts_writes(self) -> bool {
        matches!(self, State::Connecting | State::Connected)
    }

    pub fn may_be_connected(self) -> bool {
        matches!(self, State::Connecting | State::Connected)
    }
}

/// A single-writer (the reconnect loop), many-reader (submitters) atomic
/// holding the current [`State`].
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(initial: State) -> Self {
        StateCell(AtomicU8::new(initial as u8))
    }

    pub fn load(&self) -> State {
        State::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Publishes a new state. Once `Closed` is published no further
    /// transitions are allowed (§4.D: "Closed is terminal"); callers are
    /// responsible for checking `load() != Closed` before calling this,
    /// since the single-writer discipline means there's no need for a CAS.
    pub fn store(&self, state: State) {
        self.0.store(state as u8, Ordering::Release);
    }
}
