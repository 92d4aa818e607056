//! mpv process detection, spawning and supervision.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};

use super::ipc::Channel;

#[derive(Error, Debug)]
pub enum LaunchError {
  #[error("'{0}' executable not found")]
  NotFound(String),
  #[error("Failed to spawn mpv: {0}")]
  SpawnFailed(#[from] io::Error),
}

/// Window and playback options supplied by the caller for one launch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresentationOptions {
  pub geometry: Option<String>,
  pub custom_width: Option<u32>,
  pub custom_height: Option<u32>,
  /// Extra flags as a single shell-style string.
  pub mpv_flags: Option<String>,
  pub start_paused: bool,
}

/// Everything needed to start one player instance.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
  pub channel: Channel,
  pub playlist: Vec<String>,
  pub owner_id: String,
  pub options: PresentationOptions,
}

/// Host-wide launch settings, taken from the config file.
#[derive(Debug, Clone, Default)]
pub struct LaunchSettings {
  /// Custom executable (None = auto-detect).
  pub mpv_path: Option<PathBuf>,
  /// Arguments added to every launch.
  pub extra_args: Vec<String>,
  /// Lua script reporting natural playlist completion, used when present.
  pub completion_script: Option<PathBuf>,
}

/// Observed state of a launched process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
  Running,
  Exited(Option<i32>),
}

/// Request delivered to a process's exit watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
  /// Cooperative shutdown (SIGTERM, or a close request on Windows).
  Terminate,
  Kill,
}

/// Receives the one notification emitted when a watched player exits.
#[async_trait]
pub trait ExitNotifier: Send + Sync {
  async fn process_exited(&self, owner_id: &str, exit_code: Option<i32>);
}

/// Starts player processes.
pub trait Launcher: Send + Sync {
  fn launch(&self, request: &LaunchRequest) -> Result<PlayerProcess, LaunchError>;
}

/// Handle to a launched player. The child itself is owned by its exit watcher.
#[derive(Debug)]
pub struct PlayerProcess {
  pid: u32,
  status: watch::Receiver<ProcessStatus>,
  signal_tx: mpsc::UnboundedSender<ProcessSignal>,
}

impl PlayerProcess {
  pub fn new(
    pid: u32,
    status: watch::Receiver<ProcessStatus>,
    signal_tx: mpsc::UnboundedSender<ProcessSignal>,
  ) -> Self {
    Self {
      pid,
      status,
      signal_tx,
    }
  }

  pub fn pid(&self) -> u32 {
    self.pid
  }

  pub fn has_exited(&self) -> bool {
    *self.status.borrow() != ProcessStatus::Running
  }

  /// Wait up to `timeout` for the process to exit. Returns whether it did.
  pub async fn wait_exit(&mut self, timeout: Duration) -> bool {
    let exited = self.status.wait_for(|status| *status != ProcessStatus::Running);
    match tokio::time::timeout(timeout, exited).await {
      Ok(Ok(_)) => true,
      // The watcher only drops its sender after reaping the child.
      Ok(Err(_)) => true,
      Err(_) => false,
    }
  }

  /// Ask the process to shut down cooperatively.
  pub fn terminate(&self) -> io::Result<()> {
    self.signal(ProcessSignal::Terminate)
  }

  /// Kill the process unconditionally.
  pub fn kill(&self) -> io::Result<()> {
    self.signal(ProcessSignal::Kill)
  }

  fn signal(&self, signal: ProcessSignal) -> io::Result<()> {
    self
      .signal_tx
      .send(signal)
      .map_err(|_| io::Error::other("exit watcher is no longer running"))
  }
}

/// Find mpv executable in common locations.
pub fn find_mpv() -> Option<PathBuf> {
  // Check PATH first
  if let Ok(path) = which::which("mpv") {
    return Some(path);
  }

  #[cfg(windows)]
  {
    let common_paths = [
      r"C:\Program Files\mpv\mpv.exe",
      r"C:\Program Files (x86)\mpv\mpv.exe",
      r"C:\mpv\mpv.exe",
    ];
    for path in common_paths {
      let p = PathBuf::from(path);
      if p.exists() {
        return Some(p);
      }
    }
  }

  #[cfg(target_os = "macos")]
  {
    let common_paths = [
      "/usr/local/bin/mpv",
      "/opt/homebrew/bin/mpv",
      "/Applications/mpv.app/Contents/MacOS/mpv",
    ];
    for path in common_paths {
      let p = PathBuf::from(path);
      if p.exists() {
        return Some(p);
      }
    }
  }

  #[cfg(target_os = "linux")]
  {
    let common_paths = ["/usr/bin/mpv", "/usr/local/bin/mpv"];
    for path in common_paths {
      let p = PathBuf::from(path);
      if p.exists() {
        return Some(p);
      }
    }
  }

  None
}

/// Resolve the executable: configured path first, then auto-detection.
pub fn resolve_mpv(configured: Option<&Path>) -> Result<PathBuf, LaunchError> {
  match configured {
    Some(path) if path.is_file() => Ok(path.to_path_buf()),
    Some(path) => which::which(path).map_err(|_| LaunchError::NotFound(path.display().to_string())),
    None => find_mpv().ok_or_else(|| LaunchError::NotFound("mpv".to_string())),
  }
}

/// Build the full argument list for a managed launch.
pub fn build_args(settings: &LaunchSettings, request: &LaunchRequest) -> Vec<String> {
  let mut args = vec![
    "--no-terminal".to_string(),
    "--force-window=yes".to_string(),
    "--save-position-on-quit".to_string(),
    "--write-filename-in-watch-later-config".to_string(),
    format!("--input-ipc-server={}", request.channel),
  ];

  match &settings.completion_script {
    Some(script) if script.exists() => args.push(format!("--script={}", script.display())),
    Some(script) => log::warn!(
      "Completion script not found at {}; playlist completion will not be reported",
      script.display()
    ),
    None => {}
  }

  let options = &request.options;
  if options.start_paused {
    args.push("--pause".to_string());
  }

  args.extend(settings.extra_args.iter().cloned());

  if let Some(flags) = options.mpv_flags.as_deref().filter(|f| !f.trim().is_empty()) {
    match split_flags(flags) {
      Some(parsed) => {
        log::info!("Applying custom mpv flags: {:?}", parsed);
        args.extend(parsed);
      }
      None => log::error!("Could not parse custom mpv flags '{}': unbalanced quote", flags),
    }
  }

  match (options.custom_width, options.custom_height, &options.geometry) {
    (Some(width), Some(height), _) => args.push(format!("--geometry={}x{}", width, height)),
    (_, _, Some(geometry)) if !geometry.is_empty() => args.push(format!("--geometry={}", geometry)),
    _ => {}
  }

  args.push("--".to_string());
  args.extend(request.playlist.iter().cloned());
  args
}

/// Split a flag string on whitespace, honoring single and double quotes and
/// backslash escapes outside single quotes. `None` on an unbalanced quote.
pub fn split_flags(input: &str) -> Option<Vec<String>> {
  let mut words = Vec::new();
  let mut current = String::new();
  let mut in_word = false;
  let mut quote: Option<char> = None;
  let mut chars = input.chars();

  while let Some(c) = chars.next() {
    match (quote, c) {
      (Some(q), c) if c == q => quote = None,
      (Some('"'), '\\') => match chars.next() {
        Some(next @ ('"' | '\\')) => current.push(next),
        Some(next) => {
          current.push('\\');
          current.push(next);
        }
        None => return None,
      },
      (Some(_), c) => current.push(c),
      (None, '\'' | '"') => {
        quote = Some(c);
        in_word = true;
      }
      (None, '\\') => {
        current.push(chars.next()?);
        in_word = true;
      }
      (None, c) if c.is_whitespace() => {
        if in_word {
          words.push(std::mem::take(&mut current));
          in_word = false;
        }
      }
      (None, c) => {
        current.push(c);
        in_word = true;
      }
    }
  }

  if quote.is_some() {
    return None;
  }
  if in_word {
    words.push(current);
  }
  Some(words)
}

/// Spawns mpv and supervises it, reporting exits to a notifier.
pub struct MpvLauncher {
  settings: LaunchSettings,
  notifier: Arc<dyn ExitNotifier>,
}

impl MpvLauncher {
  pub fn new(settings: LaunchSettings, notifier: Arc<dyn ExitNotifier>) -> Self {
    Self { settings, notifier }
  }
}

impl Launcher for MpvLauncher {
  fn launch(&self, request: &LaunchRequest) -> Result<PlayerProcess, LaunchError> {
    let mpv_exe = resolve_mpv(self.settings.mpv_path.as_deref())?;
    let args = build_args(&self.settings, request);

    log::info!("Spawning mpv: {:?} with IPC: {}", mpv_exe, request.channel);
    log::debug!("mpv args: {:?}", args);

    let mut cmd = Command::new(&mpv_exe);
    cmd.args(&args);

    #[cfg(windows)]
    {
      const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
      const CREATE_NO_WINDOW: u32 = 0x0800_0000;
      cmd.creation_flags(CREATE_NO_WINDOW | CREATE_NEW_PROCESS_GROUP);
    }
    #[cfg(unix)]
    {
      // Keep the browser's signals away from the player.
      cmd.process_group(0);
    }

    let process = spawn_watched(cmd, request.owner_id.clone(), self.notifier.clone())?;
    log::info!(
      "mpv process launched (PID: {}) with {} items",
      process.pid(),
      request.playlist.len()
    );
    Ok(process)
  }
}

/// Spawn `cmd` with stderr drained to the log and an exit watcher attached.
pub fn spawn_watched(
  mut cmd: Command,
  owner_id: String,
  notifier: Arc<dyn ExitNotifier>,
) -> Result<PlayerProcess, LaunchError> {
  let mut child = cmd
    .stdin(Stdio::null())
    .stdout(Stdio::null())
    .stderr(Stdio::piped())
    .spawn()?;

  let pid = child
    .id()
    .ok_or_else(|| io::Error::other("process exited before its pid was read"))?;

  if let Some(stderr) = child.stderr.take() {
    tokio::spawn(drain_output(stderr));
  }

  let (status_tx, status_rx) = watch::channel(ProcessStatus::Running);
  let (signal_tx, signal_rx) = mpsc::unbounded_channel();
  tokio::spawn(watch_exit(child, signal_rx, status_tx, owner_id, notifier));

  Ok(PlayerProcess::new(pid, status_rx, signal_tx))
}

/// Forward diagnostic output to the log until the stream closes.
async fn drain_output<R: AsyncRead + Unpin>(stream: R) {
  let mut reader = BufReader::new(stream);
  let mut buf = Vec::new();
  loop {
    buf.clear();
    match reader.read_until(b'\n', &mut buf).await {
      Ok(0) => break,
      Ok(_) => {
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim();
        if !line.is_empty() {
          log::warn!("[mpv] {}", line);
        }
      }
      Err(e) => {
        log::debug!("mpv output drain stopped: {}", e);
        break;
      }
    }
  }
}

async fn watch_exit(
  mut child: Child,
  mut signal_rx: mpsc::UnboundedReceiver<ProcessSignal>,
  status_tx: watch::Sender<ProcessStatus>,
  owner_id: String,
  notifier: Arc<dyn ExitNotifier>,
) {
  let status = loop {
    tokio::select! {
      status = child.wait() => break status,
      Some(signal) = signal_rx.recv() => match signal {
        ProcessSignal::Terminate => {
          if let Some(pid) = child.id() {
            if let Err(e) = terminate_pid(pid) {
              log::warn!("terminate({}) failed: {}", pid, e);
            }
          }
        }
        ProcessSignal::Kill => {
          if let Err(e) = child.start_kill() {
            log::error!("kill() failed: {}", e);
          }
        }
      },
    }
  };

  let code = match status {
    Ok(status) => status.code(),
    Err(e) => {
      log::error!("wait() failed: {}", e);
      None
    }
  };

  log::info!("mpv process for owner '{}' exited with code {:?}", owner_id, code);
  status_tx.send_replace(ProcessStatus::Exited(code));
  notifier.process_exited(&owner_id, code).await;
}

/// Send the platform's cooperative termination request to `pid`.
#[cfg(unix)]
pub fn terminate_pid(pid: u32) -> io::Result<()> {
  signal_pid(pid, nix::sys::signal::Signal::SIGTERM)
}

/// Kill `pid` unconditionally.
#[cfg(unix)]
pub fn kill_pid(pid: u32) -> io::Result<()> {
  signal_pid(pid, nix::sys::signal::Signal::SIGKILL)
}

#[cfg(unix)]
fn signal_pid(pid: u32, signal: nix::sys::signal::Signal) -> io::Result<()> {
  let raw = i32::try_from(pid).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
  nix::sys::signal::kill(nix::unistd::Pid::from_raw(raw), signal).map_err(io::Error::from)
}

#[cfg(windows)]
pub fn terminate_pid(pid: u32) -> io::Result<()> {
  taskkill(pid, false)
}

#[cfg(windows)]
pub fn kill_pid(pid: u32) -> io::Result<()> {
  taskkill(pid, true)
}

#[cfg(windows)]
fn taskkill(pid: u32, force: bool) -> io::Result<()> {
  let pid = pid.to_string();
  let mut args = vec!["/PID", pid.as_str()];
  if force {
    args.push("/F");
  }
  let status = std::process::Command::new("taskkill").args(&args).status()?;
  if status.success() {
    Ok(())
  } else {
    Err(io::Error::other(format!("taskkill exited with {}", status)))
  }
}
