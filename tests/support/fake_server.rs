//! A minimal in-process RESP server for exercising the pipeline end-to-end,
//! in the spirit of mini-redis's own accept loop: one task per listener,
//! one task per connection, no attempt at a production-grade command set.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

#[derive(Clone, Default)]
pub struct ServerConfig {
    /// When set, only this password is accepted by `AUTH`.
    pub password: Option<String>,
    /// When set, the connection is dropped after this many replies have
    /// been written, simulating a socket killed mid-pipeline.
    pub kill_after_replies: Option<usize>,
}

pub struct FakeServer {
    pub addr: String,
    shutdown: Arc<Notify>,
    accept_task: JoinHandle<()>,
}

impl FakeServer {
    /// Binds immediately and starts accepting connections.
    pub async fn start(config: ServerConfig) -> FakeServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        Self::serve(listener, addr, config)
    }

    /// Reserves a port, then only starts listening on it after `delay` —
    /// connection attempts made before then see `ECONNREFUSED`, simulating
    /// "server down" for the async-connect scenario.
    pub fn start_after_delay(delay: Duration, config: ServerConfig) -> (String, JoinHandle<FakeServer>) {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = std_listener.local_addr().unwrap().to_string();
        drop(std_listener);
        let task = {
            let addr = addr.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let listener = TcpListener::bind(&addr).await.unwrap();
                Self::serve(listener, addr, config)
            })
        };
        (addr, task)
    }

    fn serve(listener: TcpListener, addr: String, config: ServerConfig) -> FakeServer {
        let shutdown = Arc::new(Notify::new());
        let accept_task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.notified() => return,
                        accepted = listener.accept() => {
                            let Ok((stream, _)) = accepted else { continue };
                            let config = config.clone();
                            tokio::spawn(async move {
                                let _ = handle_connection(stream, config).await;
                            });
                        }
                    }
                }
            })
        };
        FakeServer {
            addr,
            shutdown,
            accept_task,
        }
    }

    pub fn stop(self) {
        self.shutdown.notify_waiters();
        self.accept_task.abort();
    }
}

async fn handle_connection(
    stream: TcpStream,
    config: ServerConfig,
) -> std::io::Result<()> {
    stream.set_nodelay(true).ok();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut store: HashMap<String, Vec<u8>> = HashMap::new();
    let mut replies_sent = 0usize;

    loop {
        let Some(cmd) = read_command(&mut reader).await? else {
            return Ok(());
        };
        let Some(name) = cmd.first() else { continue };
        let name = String::from_utf8_lossy(name).to_ascii_uppercase();

        match name.as_str() {
            "AUTH" => {
                let given = cmd.get(1).map(|b| String::from_utf8_lossy(b).into_owned());
                match (&config.password, given) {
                    (Some(expected), Some(given)) if *expected == given => {
                        write_status(&mut write_half, "OK").await?
                    }
                    _ => write_error(&mut write_half, "ERR invalid password").await?,
                }
            }
            "PING" => write_status(&mut write_half, "PONG").await?,
            "SELECT" => write_status(&mut write_half, "OK").await?,
            "SET" => {
                if let (Some(k), Some(v)) = (cmd.get(1), cmd.get(2)) {
                    store.insert(String::from_utf8_lossy(k).into_owned(), v.clone());
                }
                write_status(&mut write_half, "OK").await?
            }
            "GET" => {
                let key = cmd.get(1).map(|b| String::from_utf8_lossy(b).into_owned());
                match key.and_then(|k| store.get(&k).cloned()) {
                    Some(v) => write_bulk(&mut write_half, &v).await?,
                    None => write_half.write_all(b"$-1\r\n").await?,
                }
            }
            _ => write_status(&mut write_half, "OK").await?,
        }
        write_half.flush().await?;
        replies_sent += 1;

        if config.kill_after_replies == Some(replies_sent) {
            return Ok(());
        }
    }
}

async fn write_status(w: &mut (impl AsyncWriteExt + Unpin), s: &str) -> std::io::Result<()> {
    w.write_all(format!("+{s}\r\n").as_bytes()).await
}

async fn write_error(w: &mut (impl AsyncWriteExt + Unpin), s: &str) -> std::io::Result<()> {
    w.write_all(format!("-{s}\r\n").as_bytes()).await
}

async fn write_bulk(w: &mut (impl AsyncWriteExt + Unpin), bytes: &[u8]) -> std::io::Result<()> {
    w.write_all(format!("${}\r\n", bytes.len()).as_bytes()).await?;
    w.write_all(bytes).await?;
    w.write_all(b"\r\n").await
}

/// Reads one RESP array-of-bulk-strings command. Returns `Ok(None)` on a
/// clean EOF before any bytes of the next command arrive.
async fn read_command(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
) -> std::io::Result<Option<Vec<Vec<u8>>>> {
    let Some(header) = read_line(reader).await? else {
        return Ok(None);
    };
    if header.first() != Some(&b'*') {
        return Ok(Some(vec![]));
    }
    let count: usize = std::str::from_utf8(&header[1..])
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        let len_line = read_line(reader)
            .await?
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?;
        let len: usize = std::str::from_utf8(&len_line[1..])
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let mut buf = vec![0u8; len + 2];
        reader.read_exact(&mut buf).await?;
        buf.truncate(len);
        args.push(buf);
    }
    Ok(Some(args))
}

/// Reads one CRLF-terminated line, dropping the terminator, as a byte
/// vector starting with the RESP type tag.
async fn read_line(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            return if line.is_empty() {
                Ok(None)
            } else {
                Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof))
            };
        }
        if byte[0] == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Ok(Some(line));
        }
        line.push(byte[0]);
    }
}
