//! The TCP/Unix transport union, split into owned read/write halves so the
//! writer and reader tasks can drive the same socket independently.
//!
//! Mirrors the `ActualConnection` enum the teacher crate uses to erase the
//! Tcp/Unix distinction behind one `AsyncRead + AsyncWrite` type, extended
//! to the split halves a concurrent writer/reader pair needs.

use std::io;
use std::pin::Pin;
use std::task::{self, Poll};

#[cfg(unix)]
use tokio::net::unix::{OwnedReadHalf as UnixReadHalf, OwnedWriteHalf as UnixWriteHalf};
use tokio::net::tcp::{OwnedReadHalf as TcpReadHalf, OwnedWriteHalf as TcpWriteHalf};
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::net::TcpStream;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub enum ReadHalf {
    Tcp(TcpReadHalf),
    #[cfg(unix)]
    Unix(UnixReadHalf),
}

pub enum WriteHalf {
    Tcp(TcpWriteHalf),
    #[cfg(unix)]
    Unix(UnixWriteHalf),
}

impl AsyncRead for ReadHalf {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            ReadHalf::Tcp(r) => Pin::new(r).poll_read(cx, buf),
            #[cfg(unix)]
            ReadHalf::Unix(r) => Pin::new(r).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for WriteHalf {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            WriteHalf::Tcp(w) => Pin::new(w).poll_write(cx, buf),
            #[cfg(unix)]
            WriteHalf::Unix(w) => Pin::new(w).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut task::Context) -> Poll<io::Result<()>> {
        match &mut *self {
            WriteHalf::Tcp(w) => Pin::new(w).poll_flush(cx),
            #[cfg(unix)]
            WriteHalf::Unix(w) => Pin::new(w).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut task::Context) -> Poll<io::Result<()>> {
        match &mut *self {
            WriteHalf::Tcp(w) => Pin::new(w).poll_shutdown(cx),
            #[cfg(unix)]
            WriteHalf::Unix(w) => Pin::new(w).poll_shutdown(cx),
        }
    }
}

pub enum ActualConnection {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl ActualConnection {
    pub fn local_addr(&self) -> io::Result<String> {
        match self {
            ActualConnection::Tcp(s) => s.local_addr().map(|a| a.to_string()),
            #[cfg(unix)]
            ActualConnection::Unix(s) => Ok(s
                .local_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
                .unwrap_or_else(|| "unix".to_owned())),
        }
    }

    pub fn peer_addr(&self) -> io::Result<String> {
        match self {
            ActualConnection::Tcp(s) => s.peer_addr().map(|a| a.to_string()),
            #[cfg(unix)]
            ActualConnection::Unix(s) => Ok(s
                .peer_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
                .unwrap_or_else(|| "unix".to_owned())),
        }
    }

    pub fn set_keepalive(&self, keepalive: Option<std::time::Duration>) -> io::Result<()> {
        if let ActualConnection::Tcp(s) = self {
            let sock_ref = socket2::SockRef::from(s);
            match keepalive {
                Some(d) => sock_ref.set_tcp_keepalive(&socket2::TcpKeepalive::new().with_time(d)),
                None => Ok(()),
            }
        } else {
            Ok(())
        }
    }

    pub fn into_split(self) -> (ReadHalf, WriteHalf) {
        match self {
            ActualConnection::Tcp(s) => {
                let (r, w) = s.into_split();
                (ReadHalf::Tcp(r), WriteHalf::Tcp(w))
            }
            #[cfg(unix)]
            ActualConnection::Unix(s) => {
                let (r, w) = s.into_split();
                (ReadHalf::Unix(r), WriteHalf::Unix(w))
            }
        }
    }
}
