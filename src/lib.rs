//! A pipelined, sharded client connection to a Redis-compatible server.
//!
//! Requests submitted through [`Connection::send`] and
//! [`Connection::send_batch`] are fanned out across a fixed number of
//! shards so independent callers never serialize on one queue, batched onto
//! the wire by a single writer task, and matched back to their callbacks by
//! a single reader task relying on strict reply ordering. A background
//! reconnect loop and health probe keep the connection alive across drops
//! without the caller having to notice, short of an explicit [`Connection::close`].

mod connection;
mod error;
mod log;
mod opts;
mod resp;
mod session;
mod shard;
mod state;
mod transport;

pub use connection::{callback, Callback, Connection};
pub use error::{Error, ErrorKind, Result};
pub use log::{LogEvent, Logger};
pub use opts::{Address, Handle, Opts};
pub use resp::{Arg, Request, ToArg, Value};
