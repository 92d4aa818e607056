//! In-memory player used by the session and host tests.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::mpv::{
  Channel, ExitNotifier, IpcError, LaunchError, LaunchRequest, Launcher, MpvCommand, MpvResponse,
  PlayerProcess, ProcessSignal, ProcessStatus, Transport,
};

/// First pid handed out. Far above any real pid_max, so a stray signal
/// cannot reach a real process.
const FIRST_PID: u32 = 900_000_001;

struct FakeInstance {
  pid: u32,
  owner_id: String,
  alive: bool,
  status_tx: Option<watch::Sender<ProcessStatus>>,
}

#[derive(Default)]
struct Inner {
  instances: HashMap<Channel, FakeInstance>,
  commands: Vec<(Channel, serde_json::Value)>,
  launches: Vec<LaunchRequest>,
  launch_error: bool,
  fail_appends: bool,
  ignore_quit: bool,
  ignore_terminate: bool,
  next_pid: u32,
  notifier: Option<Arc<dyn ExitNotifier>>,
}

impl Inner {
  /// Mark the instance dead, publish its exit and notify.
  fn finish(&mut self, channel: &Channel, code: Option<i32>) {
    let Some(instance) = self.instances.get_mut(channel) else {
      return;
    };
    instance.alive = false;
    if let Some(tx) = instance.status_tx.take() {
      tx.send_replace(ProcessStatus::Exited(code));
      if let Some(notifier) = self.notifier.clone() {
        let owner_id = instance.owner_id.clone();
        tokio::spawn(async move { notifier.process_exited(&owner_id, code).await });
      }
    }
  }

  fn ensure_alive(&self, channel: &Channel) -> Result<(), IpcError> {
    match self.instances.get(channel) {
      Some(instance) if instance.alive => Ok(()),
      _ => Err(IpcError::ConnectionFailed {
        channel: channel.to_string(),
        source: io::Error::from(io::ErrorKind::ConnectionRefused),
      }),
    }
  }
}

/// Fake mpv acting as both [`Transport`] and [`Launcher`].
#[derive(Clone, Default)]
pub struct FakeMpv {
  inner: Arc<Mutex<Inner>>,
}

impl FakeMpv {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_notifier(self, notifier: Arc<dyn ExitNotifier>) -> Self {
    self.inner.lock().notifier = Some(notifier);
    self
  }

  /// Register a player this host did not launch (left by a previous run).
  pub fn add_live(&self, channel: &Channel, pid: u32) {
    self.inner.lock().instances.insert(
      channel.clone(),
      FakeInstance {
        pid,
        owner_id: String::new(),
        alive: true,
        status_tx: None,
      },
    );
  }

  /// The player dies without anyone noticing through its handle.
  pub fn crash(&self, channel: &Channel) {
    if let Some(instance) = self.inner.lock().instances.get_mut(channel) {
      instance.alive = false;
    }
  }

  /// The player exits and its exit watcher reports it.
  pub fn exit(&self, channel: &Channel, code: i32) {
    self.inner.lock().finish(channel, Some(code));
  }

  /// The exit watcher reports an exit while the endpoint still accepts
  /// connections.
  pub fn mark_exited(&self, channel: &Channel) {
    if let Some(instance) = self.inner.lock().instances.get_mut(channel) {
      if let Some(tx) = instance.status_tx.take() {
        tx.send_replace(ProcessStatus::Exited(Some(0)));
      }
    }
  }

  pub fn set_launch_error(&self, value: bool) {
    self.inner.lock().launch_error = value;
  }

  pub fn set_fail_appends(&self, value: bool) {
    self.inner.lock().fail_appends = value;
  }

  pub fn set_ignore_quit(&self, value: bool) {
    self.inner.lock().ignore_quit = value;
  }

  pub fn set_ignore_terminate(&self, value: bool) {
    self.inner.lock().ignore_terminate = value;
  }

  pub fn is_alive(&self, channel: &Channel) -> bool {
    self.inner.lock().ensure_alive(channel).is_ok()
  }

  pub fn launches(&self) -> Vec<LaunchRequest> {
    self.inner.lock().launches.clone()
  }

  /// Items appended live to the player on `channel`, in order.
  pub fn appended(&self, channel: &Channel) -> Vec<String> {
    self
      .inner
      .lock()
      .commands
      .iter()
      .filter(|(c, command)| c == channel && command[0] == "loadfile")
      .filter_map(|(_, command)| command[1].as_str().map(str::to_string))
      .collect()
  }

  /// Names of every command delivered to `channel`.
  pub fn command_names(&self, channel: &Channel) -> Vec<String> {
    self
      .inner
      .lock()
      .commands
      .iter()
      .filter(|(c, _)| c == channel)
      .filter_map(|(_, command)| command[0].as_str().map(str::to_string))
      .collect()
  }
}

#[async_trait]
impl Transport for FakeMpv {
  async fn send(&self, channel: &Channel, command: &MpvCommand) -> Result<(), IpcError> {
    let mut inner = self.inner.lock();
    inner.ensure_alive(channel)?;
    let args = serde_json::Value::Array(command.command.clone());
    let name = args[0].as_str().unwrap_or_default().to_string();
    if name == "loadfile" && inner.fail_appends {
      return Err(IpcError::Io(io::Error::from(io::ErrorKind::BrokenPipe)));
    }
    inner.commands.push((channel.clone(), args));
    if name == "quit" && !inner.ignore_quit {
      inner.finish(channel, Some(0));
    }
    Ok(())
  }

  async fn send_and_await(
    &self,
    channel: &Channel,
    command: &MpvCommand,
    _timeout: Duration,
  ) -> Result<MpvResponse, IpcError> {
    let inner = self.inner.lock();
    inner.ensure_alive(channel)?;
    let pid = inner.instances.get(channel).map(|i| i.pid);
    Ok(MpvResponse {
      error: "success".to_string(),
      data: pid.map(serde_json::Value::from),
      request_id: Some(command.request_id),
    })
  }

  async fn open(&self, channel: &Channel) -> Result<(), IpcError> {
    self.inner.lock().ensure_alive(channel)
  }
}

impl Launcher for FakeMpv {
  fn launch(&self, request: &LaunchRequest) -> Result<PlayerProcess, LaunchError> {
    let mut inner = self.inner.lock();
    if inner.launch_error {
      return Err(LaunchError::NotFound("mpv".to_string()));
    }
    if inner.next_pid == 0 {
      inner.next_pid = FIRST_PID;
    }
    let pid = inner.next_pid;
    inner.next_pid += 1;

    let (status_tx, status_rx) = watch::channel(ProcessStatus::Running);
    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<ProcessSignal>();
    inner.instances.insert(
      request.channel.clone(),
      FakeInstance {
        pid,
        owner_id: request.owner_id.clone(),
        alive: true,
        status_tx: Some(status_tx),
      },
    );
    inner.launches.push(request.clone());

    let shared = self.inner.clone();
    let channel = request.channel.clone();
    tokio::spawn(async move {
      while let Some(signal) = signal_rx.recv().await {
        let mut inner = shared.lock();
        match signal {
          ProcessSignal::Terminate if inner.ignore_terminate => continue,
          ProcessSignal::Terminate => inner.finish(&channel, Some(143)),
          ProcessSignal::Kill => inner.finish(&channel, None),
        }
      }
    });

    Ok(PlayerProcess::new(pid, status_rx, signal_tx))
  }
}
