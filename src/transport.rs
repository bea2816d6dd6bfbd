//! Content-Length framing and byte-stream connections to a backend.
//!
//! A frame is a header block (`Content-Length: <n>\r\n\r\n`) followed by a
//! UTF-8 JSON body. Framing works over any `AsyncRead`/`AsyncWrite` pair so
//! the same code path serves child stdio pipes, TCP sockets, and in-memory
//! test streams.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::{Error, Result};

/// Caps on the header block: a peer that streams garbage must fail fast
/// instead of ballooning memory.
const MAX_HEADER_LINE_BYTES: usize = 16 * 1024;
const MAX_HEADER_LINES: usize = 128;

pub type BoxWriter = Box<dyn AsyncWrite + Unpin + Send>;
pub type BoxReader = Box<dyn AsyncRead + Unpin + Send>;

/// Write one framed message.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message body. Partial reads are fine; the frame is
/// reassembled regardless of how the bytes arrive. Header damage returns
/// `Error::MalformedFrame`, which the session treats as non-recoverable.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut header = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte).await?;
        header.push(byte[0]);
        if header.ends_with(b"\r\n\r\n") {
            break;
        }
        if header.len() > MAX_HEADER_LINE_BYTES * MAX_HEADER_LINES {
            return Err(Error::MalformedFrame("unterminated header block".to_string()));
        }
    }

    let header = String::from_utf8(header)
        .map_err(|_| Error::MalformedFrame("header is not UTF-8".to_string()))?;
    let content_length = content_length(&header)?;

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Extract Content-Length from a header block. Case-insensitive key match.
fn content_length(header: &str) -> Result<usize> {
    for line in header.lines() {
        let mut parts = line.splitn(2, ':');
        let key = parts.next().unwrap_or_default().trim();
        if key.eq_ignore_ascii_case("content-length") {
            let value = parts.next().unwrap_or_default().trim();
            return value.parse::<usize>().map_err(|_| {
                Error::MalformedFrame(format!("invalid Content-Length: {value}"))
            });
        }
    }
    Err(Error::MalformedFrame(
        "Content-Length header not found".to_string(),
    ))
}

/// One open byte stream to a backend. For a spawned backend the child handle
/// rides along so the session can kill the process on shutdown.
pub struct Connection {
    pub(crate) writer: BoxWriter,
    pub(crate) reader: BoxReader,
    pub(crate) child: Option<Child>,
}

/// Produces connections for a config. The seam exists so the supervisor can
/// be exercised against in-memory backends; production uses
/// [`ProcessConnector`].
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &ClientConfig) -> Result<Connection>;
}

/// Spawns the configured argv over stdio pipes, or dials the configured TCP
/// port. The environment overlay is merged over the inherited environment.
pub struct ProcessConnector;

#[async_trait]
impl Connector for ProcessConnector {
    async fn connect(&self, config: &ClientConfig) -> Result<Connection> {
        match config.tcp_port {
            Some(port) => connect_tcp(port).await,
            None => spawn_stdio(config),
        }
    }
}

fn spawn_stdio(config: &ClientConfig) -> Result<Connection> {
    let (exe, args) = config
        .command
        .split_first()
        .ok_or_else(|| Error::InvalidConfig {
            name: config.name.clone(),
            reason: "empty command".to_string(),
        })?;

    // Resolve up front so a missing binary is reported as such, not as a
    // generic spawn failure.
    which::which(exe).map_err(|_| Error::BinaryNotFound(exe.clone()))?;

    let mut cmd = Command::new(exe);
    cmd.args(args)
        .envs(&config.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|source| match source.kind() {
        std::io::ErrorKind::NotFound => Error::BinaryNotFound(exe.clone()),
        _ => Error::SpawnFailed {
            command: config.command.join(" "),
            source,
        },
    })?;

    let stdin = child.stdin.take().ok_or_else(|| Error::SpawnFailed {
        command: config.command.join(" "),
        source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "missing child stdin"),
    })?;
    let stdout = child.stdout.take().ok_or_else(|| Error::SpawnFailed {
        command: config.command.join(" "),
        source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "missing child stdout"),
    })?;

    if let Some(stderr) = child.stderr.take() {
        let name = config.name.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => debug!("[{name}] stderr: {}", line.trim_end()),
                }
            }
        });
    }

    Ok(Connection {
        writer: Box::new(stdin),
        reader: Box::new(BufReader::new(stdout)),
        child: Some(child),
    })
}

async fn connect_tcp(port: u16) -> Result<Connection> {
    let address = format!("127.0.0.1:{port}");
    let stream = TcpStream::connect(&address)
        .await
        .map_err(|source| Error::SpawnFailed {
            command: format!("tcp://{address}"),
            source,
        })?;
    let (reader, writer) = stream.into_split();
    Ok(Connection {
        writer: Box::new(writer),
        reader: Box::new(BufReader::new(reader)),
        child: None,
    })
}
