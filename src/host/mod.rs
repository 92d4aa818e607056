//! Native messaging host loop.
//!
//! Reads length-prefixed JSON requests from the browser, dispatches them to the
//! [`SessionManager`] one at a time, and writes the replies back. Exit events
//! from the player's watcher share the same outbound writer.

mod codec;
mod message;

use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{FutureExt, SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};

pub use codec::{FrameCodec, MAX_FRAME_LENGTH};
pub use message::{request_id, HostEvent, Outcome, PlayRequest, ProtocolError, Request, Response};

use crate::mpv::ExitNotifier;
use crate::session::SessionManager;

type Writer = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, FrameCodec>;

/// Shared writer for replies and unsolicited events. Whole frames are written
/// under the lock, so frames never interleave.
#[derive(Clone)]
pub struct Outbound {
  writer: Arc<Mutex<Writer>>,
}

impl Outbound {
  pub fn new<W>(writer: W) -> Self
  where
    W: AsyncWrite + Send + Unpin + 'static,
  {
    let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
    Self {
      writer: Arc::new(Mutex::new(FramedWrite::new(writer, FrameCodec::new()))),
    }
  }

  pub async fn send<T>(&self, frame: &T) -> io::Result<()>
  where
    T: Serialize + Sync,
  {
    self.writer.lock().await.send(frame).await
  }
}

#[async_trait]
impl ExitNotifier for Outbound {
  async fn process_exited(&self, owner_id: &str, exit_code: Option<i32>) {
    let event = HostEvent::ProcessExited {
      owner_id: owner_id.to_string(),
      exit_code,
    };
    match self.send(&event).await {
      Ok(()) => log::info!(
        "Sent process_exited for folder '{}' (exit code {:?})",
        owner_id,
        exit_code
      ),
      Err(e) => log::error!("Failed to send process_exited event: {}", e),
    }
  }
}

/// Serve requests from `reader` until the browser closes the stream.
pub async fn serve<R>(
  reader: R,
  outbound: Outbound,
  manager: &mut SessionManager,
) -> io::Result<()>
where
  R: AsyncRead + Unpin,
{
  let mut frames = FramedRead::new(reader, FrameCodec::new());
  while let Some(frame) = frames.next().await {
    let frame = frame?;
    let response = handle_frame(manager, &frame).await;
    outbound.send(&response).await?;
  }
  log::info!("Browser closed the connection. Exiting.");
  Ok(())
}

async fn handle_frame(manager: &mut SessionManager, frame: &[u8]) -> Response {
  let value: serde_json::Value = match serde_json::from_slice(frame) {
    Ok(value) => value,
    Err(e) => {
      let err = ProtocolError::from(e);
      log::error!("{}", err);
      return Response::error(err.to_string());
    }
  };
  let request_id = request_id(&value);

  let request = match Request::from_value(value) {
    Ok(request) => request,
    Err(e) => {
      log::error!("Rejected message (ID: {:?}): {}", request_id, e);
      return Response::error(e.to_string()).with_request_id(request_id);
    }
  };

  let response = match AssertUnwindSafe(dispatch(manager, request))
    .catch_unwind()
    .await
  {
    Ok(response) => response,
    Err(panic) => {
      let reason = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
      log::error!("Command handler panicked: {}", reason);
      Response::error(format!(
        "An unexpected error occurred in the native host: {}",
        reason
      ))
    }
  };
  response.with_request_id(request_id)
}

async fn dispatch(manager: &mut SessionManager, request: Request) -> Response {
  match request {
    Request::Play(play) => {
      let options = play.options();
      let owner_id = play.owner_id.unwrap_or_default();
      log::info!(
        "Received play request for folder '{}' with {} item(s)",
        owner_id,
        play.playlist.len()
      );
      Response::from(manager.start(play.playlist, &owner_id, options).await)
    }
    Request::Close => Response::from(manager.close().await),
    Request::IsRunning => Response::from(manager.is_running().await),
    Request::Unknown(action) => {
      log::warn!("Unknown action '{}'", action);
      Response::error("Unknown command")
    }
  }
}
