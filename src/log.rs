//! Lifecycle log events (§6) and the sink trait that consumes them.
//!
//! The default sink forwards to `tracing`, the logging crate already in
//! use across this pack's async network clients.

use std::sync::Arc;

use crate::error::Error;

/// A lifecycle event a [`Logger`] is notified of.
#[derive(Debug, Clone)]
pub enum LogEvent {
    Connecting { addr: Arc<str> },
    Connected { local: Arc<str>, remote: Arc<str> },
    ConnectFailed { addr: Arc<str>, error: Error },
    Disconnected { addr: Arc<str>, error: Error },
    ContextClosed { addr: Arc<str> },
}

/// Sink for connection lifecycle events. Implement this to forward events
/// into an application's own logging/metrics pipeline.
pub trait Logger: Send + Sync + 'static {
    fn log(&self, event: LogEvent);
}

/// The default [`Logger`], emitting one `tracing` event per [`LogEvent`]
/// at a severity appropriate to the event.
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, event: LogEvent) {
        match event {
            LogEvent::Connecting { addr } => {
                tracing::info!(%addr, "connecting");
            }
            LogEvent::Connected { local, remote } => {
                tracing::info!(%local, %remote, "connected");
            }
            LogEvent::ConnectFailed { addr, error } => {
                tracing::warn!(%addr, %error, "connect failed");
            }
            LogEvent::Disconnected { addr, error } => {
                tracing::warn!(%addr, %error, "disconnected");
            }
            LogEvent::ContextClosed { addr } => {
                tracing::info!(%addr, "context closed");
            }
        }
    }
}

pub fn tracing_logger() -> Arc<dyn Logger> {
    Arc::new(TracingLogger)
}
