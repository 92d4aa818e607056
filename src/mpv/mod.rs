//! mpv module - spawns and controls an external mpv player via JSON IPC.
//!
//! Architecture:
//! - `protocol.rs` - JSON command/response types and serialization
//! - `ipc.rs` - Channel kinds and the request/response transport (Unix sockets,
//!   write-only Named Pipes on Windows, loopback TCP)
//! - `process.rs` - mpv binary detection, argument building, spawning and the
//!   exit watcher

mod ipc;
mod process;
mod protocol;

pub use ipc::{Channel, ChannelKind, IpcError, Liveness, MpvIpc, Transport};
pub use process::{
  build_args, find_mpv, kill_pid, split_flags, spawn_watched, terminate_pid, ExitNotifier,
  LaunchError, LaunchRequest, LaunchSettings, Launcher, MpvLauncher, PlayerProcess,
  PresentationOptions, ProcessSignal, ProcessStatus,
};
pub use protocol::{MpvCommand, MpvEvent, MpvMessage, MpvResponse};
