//! mpv JSON IPC protocol types.
//!
//! Reference: https://mpv.io/manual/master/#json-ipc

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};

/// Request ID counter shared by every command this host sends.
static REQUEST_ID: AtomicI64 = AtomicI64::new(1);

/// Generate a unique request ID for mpv commands.
pub fn next_request_id() -> i64 {
  REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

/// Command sent to mpv, serialized as one newline-terminated JSON object.
#[derive(Debug, Clone, Serialize)]
pub struct MpvCommand {
  pub command: Vec<serde_json::Value>,
  pub request_id: i64,
}

impl MpvCommand {
  /// Create a new command with auto-generated request ID.
  pub fn new(args: Vec<serde_json::Value>) -> Self {
    Self {
      command: args,
      request_id: next_request_id(),
    }
  }

  /// Append a file to the playlist, starting playback if the player is idle.
  pub fn append_play(url: &str) -> Self {
    Self::new(vec!["loadfile".into(), url.into(), "append-play".into()])
  }

  /// Get a property value.
  pub fn get_property(name: &str) -> Self {
    Self::new(vec!["get_property".into(), name.into()])
  }

  /// Lightweight query used by the liveness probe.
  pub fn get_pid() -> Self {
    Self::get_property("pid")
  }

  /// Quit mpv.
  pub fn quit() -> Self {
    Self::new(vec!["quit".into()])
  }

  /// Encode as a single protocol line, including the trailing newline.
  pub fn to_line(&self) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(self)?;
    line.push(b'\n');
    Ok(line)
  }
}

/// Response from mpv for a command.
#[derive(Debug, Clone, Deserialize)]
pub struct MpvResponse {
  /// "success" or error message.
  pub error: String,
  /// Response data (command-specific).
  #[serde(default)]
  pub data: Option<serde_json::Value>,
  /// Matching request ID, absent when the command carried none.
  #[serde(default)]
  pub request_id: Option<i64>,
}

impl MpvResponse {
  /// Check if the command succeeded.
  pub fn is_success(&self) -> bool {
    self.error == "success"
  }

  /// Whether this reply answers the command with `request_id`.
  ///
  /// A reply without an id can only be correlated by its status, so an error
  /// reply is taken as the answer (mpv rejects unparseable commands that way).
  pub fn answers(&self, request_id: i64) -> bool {
    match self.request_id {
      Some(id) => id == request_id,
      None => !self.is_success(),
    }
  }
}

/// Event sent by mpv without being asked (property changes, end-file, ...).
#[derive(Debug, Clone, Deserialize)]
pub struct MpvEvent {
  pub event: String,
  #[serde(default)]
  pub reason: Option<String>,
}

/// Message received from mpv IPC (either response or event).
#[derive(Debug, Clone)]
pub enum MpvMessage {
  Response(MpvResponse),
  Event(MpvEvent),
}

impl MpvMessage {
  /// Parse a JSON line from mpv.
  pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(line)?;
    if value.get("event").is_some() {
      Ok(MpvMessage::Event(serde_json::from_value(value)?))
    } else {
      Ok(MpvMessage::Response(serde_json::from_value(value)?))
    }
  }
}
