//! IPC transport to mpv's control interface.
//!
//! Every call opens a fresh connection, writes one command line and, when a
//! reply is wanted, keeps reading lines until the correlated reply shows up.
//! Three channel kinds exist: Unix stream sockets, Windows named pipes (opened
//! write-only, so nothing can be read back) and loopback TCP.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use uuid::Uuid;

use super::protocol::{MpvCommand, MpvMessage, MpvResponse};

const PIPE_PREFIX: &str = r"\\.\pipe\";

#[derive(Error, Debug)]
pub enum IpcError {
  #[error("Connection to {channel} failed: {source}")]
  ConnectionFailed {
    channel: String,
    #[source]
    source: std::io::Error,
  },
  #[error("IPC I/O failed: {0}")]
  Io(#[from] std::io::Error),
  #[error("Command timeout")]
  Timeout,
  #[error("Channel {0} is write-only and cannot carry replies")]
  ReplyUnsupported(String),
  #[error("Channel closed before a matching reply arrived")]
  Closed,
  #[error("Channel {0} is not available on this platform")]
  Unsupported(String),
  #[error("Failed to encode command: {0}")]
  Encode(#[from] serde_json::Error),
}

/// What a channel kind can guarantee about delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
  /// Bidirectional local stream socket.
  Stream,
  /// Named pipe opened for writing only.
  WriteOnly,
  /// Bidirectional loopback TCP connection.
  Loopback,
}

impl ChannelKind {
  /// Whether a successful `send` means the player actually received the
  /// command, and whether replies can be awaited at all.
  pub fn confirms_delivery(self) -> bool {
    match self {
      ChannelKind::Stream | ChannelKind::Loopback => true,
      ChannelKind::WriteOnly => false,
    }
  }
}

/// Endpoint of one player's control interface.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Channel {
  Socket(PathBuf),
  Pipe(String),
  Tcp(SocketAddr),
}

impl Channel {
  /// A new, unused endpoint for the platform's default channel kind.
  pub fn fresh() -> Self {
    let id = Uuid::new_v4().simple();
    #[cfg(windows)]
    {
      Channel::Pipe(format!("{}mpv-ipc-{}", PIPE_PREFIX, id))
    }
    #[cfg(not(windows))]
    {
      Channel::Socket(std::env::temp_dir().join(format!("mpv-socket-{}", id)))
    }
  }

  pub fn kind(&self) -> ChannelKind {
    match self {
      Channel::Socket(_) => ChannelKind::Stream,
      Channel::Pipe(_) => ChannelKind::WriteOnly,
      Channel::Tcp(_) => ChannelKind::Loopback,
    }
  }

  /// Remove the socket file left behind by a dead player. Anything at the
  /// path that is not a socket is left alone.
  pub fn cleanup(&self) {
    let Channel::Socket(path) = self else {
      return;
    };
    match std::fs::symlink_metadata(path) {
      Ok(meta) if is_socket(&meta) => match std::fs::remove_file(path) {
        Ok(()) => log::info!("Removed IPC socket {}", path.display()),
        Err(e) => log::warn!("Failed to remove IPC socket {}: {}", path.display(), e),
      },
      Ok(_) => log::warn!("Not removing {}: it is not a socket", path.display()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
      Err(e) => log::warn!("Failed to inspect IPC socket {}: {}", path.display(), e),
    }
  }
}

#[cfg(unix)]
fn is_socket(meta: &std::fs::Metadata) -> bool {
  use std::os::unix::fs::FileTypeExt;
  meta.file_type().is_socket()
}

#[cfg(not(unix))]
fn is_socket(_meta: &std::fs::Metadata) -> bool {
  false
}

impl fmt::Display for Channel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Channel::Socket(path) => write!(f, "{}", path.display()),
      Channel::Pipe(name) => f.write_str(name),
      Channel::Tcp(addr) => write!(f, "{}", addr),
    }
  }
}

impl TryFrom<String> for Channel {
  type Error = String;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    if value.trim().is_empty() {
      return Err("channel is empty".to_string());
    }
    if value.starts_with(PIPE_PREFIX) {
      return Ok(Channel::Pipe(value));
    }
    if let Ok(addr) = value.parse::<SocketAddr>() {
      if !addr.ip().is_loopback() {
        return Err(format!("{} is not a loopback address", addr));
      }
      return Ok(Channel::Tcp(addr));
    }
    Ok(Channel::Socket(PathBuf::from(value)))
  }
}

impl From<Channel> for String {
  fn from(channel: Channel) -> Self {
    channel.to_string()
  }
}

/// Result of a bounded liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
  /// The player answered a query.
  Confirmed,
  /// The endpoint exists, but the channel cannot prove the player responds.
  Unconfirmed,
  Dead,
}

impl Liveness {
  pub fn is_alive(self) -> bool {
    !matches!(self, Liveness::Dead)
  }

  pub fn is_confirmed(self) -> bool {
    matches!(self, Liveness::Confirmed)
  }
}

/// Delivers commands to a player over a [`Channel`].
#[async_trait]
pub trait Transport: Send + Sync {
  /// Best-effort delivery. Only implies execution when the channel kind
  /// [confirms delivery](ChannelKind::confirms_delivery).
  async fn send(&self, channel: &Channel, command: &MpvCommand) -> Result<(), IpcError>;

  /// Deliver a command and wait for its correlated reply.
  async fn send_and_await(
    &self,
    channel: &Channel,
    command: &MpvCommand,
    timeout: Duration,
  ) -> Result<MpvResponse, IpcError>;

  /// Check that the endpoint can be opened for writing, without sending.
  async fn open(&self, channel: &Channel) -> Result<(), IpcError>;

  /// Bounded liveness check. Every transport failure maps to `Dead`.
  async fn probe(&self, channel: &Channel, timeout: Duration) -> Liveness {
    if channel.kind().confirms_delivery() {
      match self.send_and_await(channel, &MpvCommand::get_pid(), timeout).await {
        Ok(response) if response.is_success() => Liveness::Confirmed,
        Ok(response) => {
          log::debug!("Probe of {} got error reply: {}", channel, response.error);
          Liveness::Dead
        }
        Err(e) => {
          log::debug!("Probe of {} failed: {}", channel, e);
          Liveness::Dead
        }
      }
    } else {
      match tokio::time::timeout(timeout, self.open(channel)).await {
        Ok(Ok(())) => Liveness::Unconfirmed,
        Ok(Err(e)) => {
          log::debug!("Probe of {} failed: {}", channel, e);
          Liveness::Dead
        }
        Err(_) => Liveness::Dead,
      }
    }
  }
}

/// [`Transport`] over real sockets and pipes.
pub struct MpvIpc {
  timeout: Duration,
}

impl MpvIpc {
  /// `timeout` bounds connecting and writing for fire-and-forget sends.
  pub fn new(timeout: Duration) -> Self {
    Self { timeout }
  }

  async fn write_line(&self, channel: &Channel, line: &[u8]) -> Result<(), IpcError> {
    match channel {
      #[cfg(unix)]
      Channel::Socket(path) => {
        let mut stream = tokio::net::UnixStream::connect(path)
          .await
          .map_err(|e| connection_failed(channel, e))?;
        stream.write_all(line).await?;
        stream.flush().await?;
        Ok(())
      }
      #[cfg(windows)]
      Channel::Pipe(_) => {
        let mut pipe = open_pipe(channel)?;
        pipe.write_all(line).await?;
        pipe.flush().await?;
        Ok(())
      }
      Channel::Tcp(addr) => {
        let mut stream = tokio::net::TcpStream::connect(addr)
          .await
          .map_err(|e| connection_failed(channel, e))?;
        stream.write_all(line).await?;
        stream.flush().await?;
        Ok(())
      }
      #[allow(unreachable_patterns)]
      _ => Err(IpcError::Unsupported(channel.to_string())),
    }
  }

  async fn request(&self, channel: &Channel, command: &MpvCommand) -> Result<MpvResponse, IpcError> {
    let line = command.to_line()?;
    match channel {
      #[cfg(unix)]
      Channel::Socket(path) => {
        let stream = tokio::net::UnixStream::connect(path)
          .await
          .map_err(|e| connection_failed(channel, e))?;
        exchange(stream, &line, command.request_id).await
      }
      Channel::Tcp(addr) => {
        let stream = tokio::net::TcpStream::connect(addr)
          .await
          .map_err(|e| connection_failed(channel, e))?;
        exchange(stream, &line, command.request_id).await
      }
      Channel::Pipe(_) => Err(IpcError::ReplyUnsupported(channel.to_string())),
      #[allow(unreachable_patterns)]
      _ => Err(IpcError::Unsupported(channel.to_string())),
    }
  }
}

#[async_trait]
impl Transport for MpvIpc {
  async fn send(&self, channel: &Channel, command: &MpvCommand) -> Result<(), IpcError> {
    let line = command.to_line()?;
    log::debug!("Sending to {}: {}", channel, String::from_utf8_lossy(&line).trim_end());
    tokio::time::timeout(self.timeout, self.write_line(channel, &line))
      .await
      .map_err(|_| IpcError::Timeout)?
  }

  async fn send_and_await(
    &self,
    channel: &Channel,
    command: &MpvCommand,
    timeout: Duration,
  ) -> Result<MpvResponse, IpcError> {
    match tokio::time::timeout(timeout, self.request(channel, command)).await {
      Ok(result) => result,
      Err(_) => {
        log::debug!(
          "No reply from {} within {:?}, request_id={}",
          channel,
          timeout,
          command.request_id
        );
        Err(IpcError::Timeout)
      }
    }
  }

  async fn open(&self, channel: &Channel) -> Result<(), IpcError> {
    match channel {
      #[cfg(unix)]
      Channel::Socket(path) => {
        tokio::net::UnixStream::connect(path)
          .await
          .map_err(|e| connection_failed(channel, e))?;
        Ok(())
      }
      #[cfg(windows)]
      Channel::Pipe(_) => open_pipe(channel).map(|_| ()),
      Channel::Tcp(addr) => {
        tokio::net::TcpStream::connect(addr)
          .await
          .map_err(|e| connection_failed(channel, e))?;
        Ok(())
      }
      #[allow(unreachable_patterns)]
      _ => Err(IpcError::Unsupported(channel.to_string())),
    }
  }
}

fn connection_failed(channel: &Channel, source: std::io::Error) -> IpcError {
  IpcError::ConnectionFailed {
    channel: channel.to_string(),
    source,
  }
}

#[cfg(windows)]
fn open_pipe(
  channel: &Channel,
) -> Result<tokio::net::windows::named_pipe::NamedPipeClient, IpcError> {
  use tokio::net::windows::named_pipe::ClientOptions;

  ClientOptions::new()
    .read(false)
    .open(channel.to_string())
    .map_err(|e| connection_failed(channel, e))
}

/// Write `line`, then read replies until one answers `request_id`.
async fn exchange<S>(stream: S, line: &[u8], request_id: i64) -> Result<MpvResponse, IpcError>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let (reader, mut writer) = tokio::io::split(stream);
  writer.write_all(line).await?;
  writer.flush().await?;

  let mut lines = BufReader::new(reader).lines();
  while let Some(line) = lines.next_line().await? {
    let trimmed = line.trim();
    if trimmed.is_empty() {
      continue;
    }
    match MpvMessage::parse(trimmed) {
      Ok(MpvMessage::Response(response)) if response.answers(request_id) => return Ok(response),
      Ok(MpvMessage::Response(response)) => {
        log::debug!("Skipping reply for request_id={:?}", response.request_id);
      }
      Ok(MpvMessage::Event(event)) => log::debug!("Skipping mpv event {}", event.event),
      Err(e) => log::warn!("Failed to parse mpv message: {} - {}", e, trimmed),
    }
  }
  Err(IpcError::Closed)
}
