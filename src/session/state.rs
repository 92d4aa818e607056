//! In-memory session record and its durable mirror.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mpv::{Channel, PlayerProcess};

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("Session file I/O failed: {0}")]
  Io(#[from] io::Error),
  #[error("Session file is malformed: {0}")]
  Malformed(String),
}

/// Durable form of an owned session, stored as `session.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
  pub pid: u32,
  pub channel: Channel,
  pub playlist: Vec<String>,
  pub owner_id: String,
}

impl SessionRecord {
  fn validate(&self) -> Result<(), StoreError> {
    if self.pid == 0 {
      return Err(StoreError::Malformed("pid is zero".to_string()));
    }
    if self.owner_id.is_empty() {
      return Err(StoreError::Malformed("ownerId is empty".to_string()));
    }
    if self.playlist.is_empty() {
      return Err(StoreError::Malformed("playlist is empty".to_string()));
    }
    Ok(())
  }
}

/// The active (or most recently active) controlled instance.
#[derive(Debug)]
pub struct Session {
  pub owner_id: String,
  pub playlist: Vec<String>,
  pub channel: Channel,
  pub pid: u32,
  /// Known only for processes launched by this host run.
  pub process: Option<PlayerProcess>,
}

impl Session {
  pub fn record(&self) -> SessionRecord {
    SessionRecord {
      pid: self.pid,
      channel: self.channel.clone(),
      playlist: self.playlist.clone(),
      owner_id: self.owner_id.clone(),
    }
  }

  /// Whether the exit watcher has already seen this process terminate.
  pub fn has_exited(&self) -> bool {
    self.process.as_ref().is_some_and(PlayerProcess::has_exited)
  }
}

impl From<SessionRecord> for Session {
  fn from(record: SessionRecord) -> Self {
    Self {
      owner_id: record.owner_id,
      playlist: record.playlist,
      channel: record.channel,
      pid: record.pid,
      process: None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
  Idle,
  Owned,
}

/// File holding the durable session record.
#[derive(Debug, Clone)]
pub struct SessionStore {
  path: PathBuf,
}

impl SessionStore {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Atomically replace the stored record.
  pub fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
    let json = serde_json::to_vec(record).map_err(|e| StoreError::Io(e.into()))?;
    if let Some(parent) = self.path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    let tmp = self.path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, &self.path)?;
    log::info!("Session info saved to {}", self.path.display());
    Ok(())
  }

  /// Read the stored record. `Ok(None)` when there is none.
  pub fn load(&self) -> Result<Option<SessionRecord>, StoreError> {
    let bytes = match std::fs::read(&self.path) {
      Ok(bytes) => bytes,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(e.into()),
    };
    let record: SessionRecord =
      serde_json::from_slice(&bytes).map_err(|e| StoreError::Malformed(e.to_string()))?;
    record.validate()?;
    Ok(Some(record))
  }

  /// Delete the stored record. Returns whether one existed.
  pub fn remove(&self) -> Result<bool, StoreError> {
    match std::fs::remove_file(&self.path) {
      Ok(()) => {
        log::info!("Cleaned up session file: {}", self.path.display());
        Ok(true)
      }
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
      Err(e) => Err(e.into()),
    }
  }
}

/// The session slot: Idle, or one Owned session mirrored to the store.
#[derive(Debug)]
pub struct SessionState {
  current: Option<Session>,
  store: SessionStore,
}

impl SessionState {
  pub fn new(store: SessionStore) -> Self {
    Self {
      current: None,
      store,
    }
  }

  pub fn status(&self) -> SessionStatus {
    match self.current {
      Some(_) => SessionStatus::Owned,
      None => SessionStatus::Idle,
    }
  }

  pub fn current(&self) -> Option<&Session> {
    self.current.as_ref()
  }

  pub fn current_mut(&mut self) -> Option<&mut Session> {
    self.current.as_mut()
  }

  pub fn store(&self) -> &SessionStore {
    &self.store
  }

  /// Become Owned by `session` and mirror it.
  pub fn own(&mut self, session: Session) -> Result<(), StoreError> {
    let record = session.record();
    self.current = Some(session);
    self.store.save(&record)
  }

  /// Repopulate from a record already known to be live. The record is
  /// already on disk, so nothing is written.
  pub fn adopt(&mut self, record: SessionRecord) {
    self.current = Some(record.into());
  }

  /// Replace the owned playlist and refresh the mirror. No-op when Idle.
  pub fn set_playlist(&mut self, playlist: Vec<String>) -> Result<(), StoreError> {
    let Some(session) = self.current.as_mut() else {
      return Ok(());
    };
    session.playlist = playlist;
    let record = session.record();
    self.store.save(&record)
  }

  /// Return to Idle and delete the mirror. Safe to call when already Idle.
  pub fn clear(&mut self) -> Option<Session> {
    let previous = self.current.take();
    if let Some(session) = &previous {
      log::info!("Clearing session state for PID: {}", session.pid);
    }
    if let Err(e) = self.store.remove() {
      log::warn!("Failed to remove session file during cleanup: {}", e);
    }
    previous
  }
}
