//! Session manager - owns the single controlled mpv instance.
//!
//! `start` either syncs new playlist items into the running player, rejects a
//! caller from another owner group, or launches a fresh player. `close` walks
//! graceful quit, cooperative termination and force kill, and always leaves
//! the manager Idle afterwards.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::state::{Session, SessionState, SessionStatus, SessionStore};
use crate::mpv::{
  kill_pid, terminate_pid, Channel, LaunchError, LaunchRequest, Launcher, Liveness, MpvCommand,
  PresentationOptions, Transport,
};

/// Poll interval while waiting for a process we hold no handle for.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum SessionError {
  #[error(
    "An MPV instance is already running for folder '{owner}'. Please close it to play from '{requested}'."
  )]
  OwnershipConflict { owner: String, requested: String },
  #[error("No ownerId provided for play action.")]
  MissingOwner,
  #[error("No playlist items provided for play action.")]
  EmptyPlaylist,
  #[error(transparent)]
  Launch(#[from] LaunchError),
}

/// Bounds for remote calls made by the manager.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
  /// Liveness probe reply bound.
  pub probe: Duration,
  /// How long each shutdown stage waits for the process to exit.
  pub shutdown: Duration,
}

impl Default for Timeouts {
  fn default() -> Self {
    Self {
      probe: Duration::from_millis(500),
      shutdown: Duration::from_secs(5),
    }
  }
}

/// Successful result of [`SessionManager::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
  Launched { pid: u32, items: usize },
  Synced { appended: usize },
}

impl StartOutcome {
  pub fn message(&self) -> String {
    match self {
      StartOutcome::Launched { .. } => "MPV playback initiated.".to_string(),
      StartOutcome::Synced { appended: 0 } => "Playlist is already up to date.".to_string(),
      StartOutcome::Synced { appended } => {
        format!("Added {} new item(s) to the MPV playlist.", appended)
      }
    }
  }
}

/// How [`SessionManager::close`] ended the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
  NothingToClose,
  /// The player was already gone when close ran; no signal was sent.
  AlreadyExited,
  Graceful,
  Terminated,
  Killed,
}

impl CloseOutcome {
  pub fn message(&self) -> &'static str {
    match self {
      CloseOutcome::NothingToClose => "No running MPV instance was found.",
      CloseOutcome::AlreadyExited => "MPV instance had already exited.",
      CloseOutcome::Graceful => "MPV instance has been closed.",
      CloseOutcome::Terminated => "MPV instance was closed with a termination signal.",
      CloseOutcome::Killed => "MPV instance was forcefully closed.",
    }
  }
}

/// Answer to an `isRunning` query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunningStatus {
  pub running: bool,
  /// False when the channel could only show that the endpoint exists.
  pub confirmed: bool,
}

pub struct SessionManager {
  state: SessionState,
  transport: Arc<dyn Transport>,
  launcher: Arc<dyn Launcher>,
  timeouts: Timeouts,
}

impl SessionManager {
  pub fn new(
    store: SessionStore,
    transport: Arc<dyn Transport>,
    launcher: Arc<dyn Launcher>,
    timeouts: Timeouts,
  ) -> Self {
    Self {
      state: SessionState::new(store),
      transport,
      launcher,
      timeouts,
    }
  }

  pub fn status(&self) -> SessionStatus {
    self.state.status()
  }

  pub fn current(&self) -> Option<&Session> {
    self.state.current()
  }

  /// Recover the session persisted by a previous host run, if still live.
  pub async fn restore(&mut self) {
    let record = match self.state.store().load() {
      Ok(None) => return,
      Ok(Some(record)) => record,
      Err(e) => {
        log::warn!("Stale or invalid session file found. Reason: {}. Cleaning up.", e);
        self.state.clear();
        return;
      }
    };

    log::info!(
      "Found session file: {}. Checking for live process.",
      self.state.store().path().display()
    );
    match self.transport.probe(&record.channel, self.timeouts.probe).await {
      Liveness::Dead => {
        log::warn!(
          "Stale session file found. Reason: process {} not responding on {}. Cleaning up.",
          record.pid,
          record.channel
        );
        self.state.clear();
        record.channel.cleanup();
      }
      liveness => {
        if !liveness.is_confirmed() {
          log::warn!(
            "Restoring session on {} without a confirmed reply; only the endpoint was reachable",
            record.channel
          );
        }
        log::info!(
          "Successfully restored session for MPV process (PID: {}) owned by folder '{}'.",
          record.pid,
          record.owner_id
        );
        self.state.adopt(record);
      }
    }
  }

  /// Play `playlist` for `owner_id`: sync, reject or launch.
  pub async fn start(
    &mut self,
    playlist: Vec<String>,
    owner_id: &str,
    options: PresentationOptions,
  ) -> Result<StartOutcome, SessionError> {
    if owner_id.is_empty() {
      return Err(SessionError::MissingOwner);
    }
    if playlist.is_empty() {
      return Err(SessionError::EmptyPlaylist);
    }

    if self.state.current().is_some() && !self.liveness().await.is_alive() {
      log::info!("Detected a stale MPV session. Clearing state before proceeding.");
      self.clear_stale();
    }

    if let Some(session) = self.state.current() {
      if session.owner_id != owner_id {
        let err = SessionError::OwnershipConflict {
          owner: session.owner_id.clone(),
          requested: owner_id.to_string(),
        };
        log::warn!("{}", err);
        return Err(err);
      }
      if let Some(outcome) = self.sync(&playlist).await {
        return Ok(outcome);
      }
    }

    self.launch(playlist, owner_id, options)
  }

  /// Append the items of `playlist` the running player does not know yet.
  /// `None` means the player could not be reached and state was cleared.
  async fn sync(&mut self, playlist: &[String]) -> Option<StartOutcome> {
    log::info!("MPV is running for the same folder. Attempting to sync playlist.");
    let session = self.state.current()?;
    let known: HashSet<&str> = session.playlist.iter().map(String::as_str).collect();
    let new_items: Vec<String> = playlist
      .iter()
      .filter(|url| !known.contains(url.as_str()))
      .cloned()
      .collect();
    let channel = session.channel.clone();

    if new_items.is_empty() {
      log::info!("Playlist is already in sync or only contains removals (which are not handled live).");
    } else {
      log::info!("Appending {} new item(s) to the playlist.", new_items.len());
      for url in &new_items {
        if let Err(e) = self.transport.send(&channel, &MpvCommand::append_play(url)).await {
          log::warn!(
            "Live playlist append failed: {}. Clearing state to allow a restart.",
            e
          );
          self.state.clear();
          return None;
        }
      }
    }

    if let Err(e) = self.state.set_playlist(playlist.to_vec()) {
      log::error!("Failed to update session file: {}", e);
    }
    Some(StartOutcome::Synced {
      appended: new_items.len(),
    })
  }

  fn launch(
    &mut self,
    playlist: Vec<String>,
    owner_id: &str,
    options: PresentationOptions,
  ) -> Result<StartOutcome, SessionError> {
    log::info!("Starting a new MPV instance.");
    let request = LaunchRequest {
      channel: Channel::fresh(),
      playlist,
      owner_id: owner_id.to_string(),
      options,
    };
    let process = self.launcher.launch(&request)?;
    let pid = process.pid();
    let items = request.playlist.len();

    let session = Session {
      owner_id: request.owner_id,
      playlist: request.playlist,
      channel: request.channel,
      pid,
      process: Some(process),
    };
    if let Err(e) = self.state.own(session) {
      log::error!("Failed to save session file: {}", e);
    }
    Ok(StartOutcome::Launched { pid, items })
  }

  /// Report whether the owned player is alive, clearing a stale session.
  pub async fn is_running(&mut self) -> RunningStatus {
    let liveness = self.liveness().await;
    if !liveness.is_alive() && self.state.current().is_some() {
      self.clear_stale();
    }
    let channel = self
      .state
      .current()
      .map(|session| session.channel.to_string())
      .unwrap_or_default();
    log::info!("MPV running status check: {:?} (Path: {})", liveness, channel);
    RunningStatus {
      running: liveness.is_alive(),
      confirmed: liveness.is_confirmed(),
    }
  }

  /// Shut the owned player down. Succeeds in every reachable end state.
  pub async fn close(&mut self) -> CloseOutcome {
    if self.state.current().is_none() {
      log::info!("Received 'close' command, but no active MPV process was found.");
      return CloseOutcome::NothingToClose;
    }

    let transport = self.transport.clone();
    let timeouts = self.timeouts;
    let mut guard = ClearOnDrop {
      state: &mut self.state,
    };
    let outcome = match guard.state.current_mut() {
      Some(session) => shutdown(transport.as_ref(), session, timeouts).await,
      None => CloseOutcome::NothingToClose,
    };
    outcome
  }

  async fn liveness(&self) -> Liveness {
    let Some(session) = self.state.current() else {
      return Liveness::Dead;
    };
    if session.has_exited() {
      return Liveness::Dead;
    }
    self.transport.probe(&session.channel, self.timeouts.probe).await
  }

  fn clear_stale(&mut self) {
    if let Some(session) = self.state.clear() {
      session.channel.cleanup();
    }
  }
}

/// Clears the session however `close` leaves, including unwinding.
struct ClearOnDrop<'a> {
  state: &'a mut SessionState,
}

impl Drop for ClearOnDrop<'_> {
  fn drop(&mut self) {
    if let Some(session) = self.state.clear() {
      session.channel.cleanup();
    }
  }
}

async fn shutdown(transport: &dyn Transport, session: &mut Session, timeouts: Timeouts) -> CloseOutcome {
  let pid = session.pid;

  // A recorded pid may have been reused once the player is gone.
  if is_gone(transport, session, timeouts).await {
    log::info!("MPV process (PID: {}) had already exited; nothing to signal.", pid);
    return CloseOutcome::AlreadyExited;
  }

  log::info!("Attempting to close MPV (PID: {}) via IPC: {}", pid, session.channel);
  match transport.send(&session.channel, &MpvCommand::quit()).await {
    Ok(()) => {
      if wait_gone(transport, session, timeouts).await {
        log::info!("MPV process (PID: {}) closed gracefully via IPC.", pid);
        return CloseOutcome::Graceful;
      }
      log::warn!("MPV process (PID: {}) ignored quit. Falling back to signal method.", pid);
    }
    Err(e) => {
      if is_gone(transport, session, timeouts).await {
        log::info!("MPV process (PID: {}) exited before it could be asked to quit.", pid);
        return CloseOutcome::AlreadyExited;
      }
      log::warn!("IPC command to close MPV failed: {}. Falling back to signal method.", e);
    }
  }

  let terminated = match &session.process {
    Some(process) => process.terminate(),
    None => terminate_pid(pid),
  };
  match terminated {
    Ok(()) => {
      if wait_gone(transport, session, timeouts).await {
        log::info!("MPV process (PID: {}) terminated successfully via signal.", pid);
        return CloseOutcome::Terminated;
      }
      log::warn!("MPV process (PID: {}) did not terminate in time, forcing kill.", pid);
    }
    Err(e) => {
      if is_gone(transport, session, timeouts).await {
        log::info!("MPV process (PID: {}) exited before termination.", pid);
        return CloseOutcome::AlreadyExited;
      }
      log::warn!("Termination signal to PID {} failed: {}. Forcing kill.", pid, e);
    }
  }

  let killed = match &session.process {
    Some(process) => process.kill(),
    None => kill_pid(pid),
  };
  if let Err(e) = killed {
    log::error!("Force kill of PID {} failed: {}", pid, e);
  }
  CloseOutcome::Killed
}

/// Whether the player is already gone: its watcher saw the exit, or, with no
/// handle, the channel no longer answers.
async fn is_gone(transport: &dyn Transport, session: &Session, timeouts: Timeouts) -> bool {
  match &session.process {
    Some(process) => process.has_exited(),
    None => !transport.probe(&session.channel, timeouts.probe).await.is_alive(),
  }
}

/// Wait for the player to exit: through its handle when we have one,
/// otherwise by probing the channel until it stops answering.
async fn wait_gone(transport: &dyn Transport, session: &mut Session, timeouts: Timeouts) -> bool {
  if let Some(process) = session.process.as_mut() {
    return process.wait_exit(timeouts.shutdown).await;
  }

  let deadline = tokio::time::Instant::now() + timeouts.shutdown;
  loop {
    if !transport.probe(&session.channel, timeouts.probe).await.is_alive() {
      return true;
    }
    if tokio::time::Instant::now() >= deadline {
      return false;
    }
    tokio::time::sleep(EXIT_POLL_INTERVAL).await;
  }
}
