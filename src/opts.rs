//! Connection options and address parsing (§6 of the spec).

use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, ErrorKind};
use crate::log::Logger;

/// The parsed transport kind and endpoint for a connection.
#[derive(Debug, Clone)]
pub enum Address {
    Tcp(String),
    Unix(String),
}

impl Address {
    /// Parses the address syntax from §6: `host:port`, `tcp://host:port`,
    /// `/path/to/socket`, `./relative/socket`, `unix:///abs/path`.
    pub fn parse(addr: &str) -> Result<Self, Error> {
        if let Some(rest) = addr.strip_prefix("unix://") {
            return Ok(Address::Unix(rest.to_owned()));
        }
        if let Some(rest) = addr.strip_prefix("tcp://") {
            return Ok(Address::Tcp(rest.to_owned()));
        }
        if addr.starts_with('.') || addr.starts_with('/') {
            return Ok(Address::Unix(addr.to_owned()));
        }
        if addr.is_empty() {
            return Err(Error::with_message(ErrorKind::Dial, "empty address"));
        }
        Ok(Address::Tcp(addr.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Address::Tcp(s) | Address::Unix(s) => s,
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Tcp(s) => write!(f, "tcp://{s}"),
            Address::Unix(s) => write!(f, "unix://{s}"),
        }
    }
}

/// An opaque token the caller can stash on a connection and read back via
/// [`crate::Connection::handle`]. Not interpreted by the core.
pub type Handle = Arc<dyn std::any::Any + Send + Sync>;

/// User-supplied connection configuration (§6).
///
/// Call [`Opts::normalize`] once (done internally by `Connect`) to turn the
/// `0`/negative sentinel values into concrete, ready-to-use settings.
pub struct Opts {
    pub reconnect_pause: Duration,
    /// `None` means reconnection is disabled (the `<0` sentinel).
    pub reconnect_enabled: bool,
    pub dial_timeout: Option<Duration>,
    pub db: i64,
    pub password: Option<String>,
    pub handle: Option<Handle>,
    /// `0` means "default to `2 * num_cpus`"; resolved in `normalize`.
    pub concurrency: usize,
    /// `None` disables I/O timeouts (the `<0` sentinel).
    pub io_timeout: Option<Duration>,
    pub tcp_keepalive: Option<Duration>,
    pub logger: Arc<dyn Logger>,
    pub r#async: bool,
}

impl Default for Opts {
    fn default() -> Self {
        Opts {
            reconnect_pause: Duration::from_millis(500),
            reconnect_enabled: true,
            dial_timeout: None,
            db: 0,
            password: None,
            handle: None,
            concurrency: 0,
            io_timeout: Some(Duration::from_secs(1)),
            tcp_keepalive: Some(Duration::from_millis(300)),
            logger: crate::log::tracing_logger(),
            r#async: false,
        }
    }
}

/// Normalized, ready-to-use settings derived from `Opts` by
/// [`Opts::normalize`].
#[derive(Debug, Clone)]
pub struct NormalizedOpts {
    pub reconnect_pause: Duration,
    pub reconnect_enabled: bool,
    pub dial_timeout: Duration,
    pub db: i64,
    pub password: Option<String>,
    pub concurrency: usize,
    pub io_timeout: Option<Duration>,
    pub health_probe_interval: Duration,
    pub tcp_keepalive: Option<Duration>,
}

impl Opts {
    /// Builds with an explicit reconnect pause, matching the `ReconnectPause`
    /// semantics directly: `<0` disables reconnection.
    pub fn with_reconnect_pause(mut self, pause: Option<Duration>) -> Self {
        match pause {
            Some(d) => {
                self.reconnect_pause = d;
                self.reconnect_enabled = true;
            }
            None => {
                self.reconnect_enabled = false;
            }
        }
        self
    }

    pub fn with_db(mut self, db: i64) -> Self {
        self.db = db;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    pub fn with_async(mut self, enabled: bool) -> Self {
        self.r#async = enabled;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// `None` disables I/O timeouts entirely (the `<0` sentinel); `Some(Duration::ZERO)`
    /// requests the 1s default.
    pub fn with_io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn with_tcp_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.tcp_keepalive = keepalive;
        self
    }

    pub fn with_handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub(crate) fn normalize(&self, num_cpus: usize) -> NormalizedOpts {
        let reconnect_pause = if self.reconnect_pause.is_zero() {
            Duration::from_millis(500)
        } else {
            self.reconnect_pause
        };

        let dial_timeout = self.dial_timeout.unwrap_or_else(|| {
            let half = reconnect_pause / 2;
            half.min(Duration::from_secs(5))
        });

        let default_concurrency = (2 * num_cpus).max(1);
        let max_concurrency = 128 * num_cpus.max(1);
        let concurrency = if self.concurrency == 0 || self.concurrency > max_concurrency {
            default_concurrency
        } else {
            self.concurrency
        };

        let io_timeout = match self.io_timeout {
            None => None,
            Some(d) if d.is_zero() => Some(Duration::from_secs(1)),
            Some(d) => Some(d),
        };
        let health_probe_interval = match io_timeout {
            Some(d) if !d.is_zero() => d / 3,
            _ => Duration::from_secs(1),
        };

        NormalizedOpts {
            reconnect_pause,
            reconnect_enabled: self.reconnect_enabled,
            dial_timeout,
            db: self.db,
            password: self.password.clone(),
            concurrency,
            io_timeout,
            health_probe_interval,
            tcp_keepalive: self.tcp_keepalive,
        }
    }
}
