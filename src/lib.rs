use std::sync::Arc;
use std::time::Duration;

pub mod config;
pub mod host;
pub mod logging;
pub mod mpv;
pub mod session;

pub use config::HostConfig;
use host::Outbound;
use mpv::{MpvIpc, MpvLauncher};
use session::{SessionManager, SessionStore};

/// Run the native messaging host on stdin/stdout until the browser disconnects.
pub fn run() -> std::io::Result<()> {
  let data_dir = config::data_dir();
  let (config, config_error) = match HostConfig::load(&data_dir.join(config::CONFIG_FILE)) {
    Ok(config) => (config, None),
    Err(e) => (HostConfig::default(), Some(e)),
  };

  logging::init(&data_dir.join(config::LOG_FILE), config.log_filter());
  log::info!("Native host started in messaging mode.");
  if let Some(e) = config_error {
    log::warn!("{}. Using default settings.", e);
  }

  let runtime = tokio::runtime::Builder::new_multi_thread()
    .enable_all()
    .build()?;

  let result = runtime.block_on(async {
    let outbound = Outbound::new(tokio::io::stdout());
    let transport = Arc::new(MpvIpc::new(config.ipc_timeout()));
    let launcher = Arc::new(MpvLauncher::new(
      config.launch_settings(&data_dir),
      Arc::new(outbound.clone()),
    ));
    let mut manager = SessionManager::new(
      SessionStore::new(data_dir.join(config::SESSION_FILE)),
      transport,
      launcher,
      config.timeouts(),
    );

    // Pick up a player left running by a previous host process.
    manager.restore().await;
    host::serve(tokio::io::stdin(), outbound, &mut manager).await
  });

  // The stdin reader may still be parked on a blocking read.
  runtime.shutdown_timeout(Duration::from_millis(500));
  result
}
