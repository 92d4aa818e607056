//! Logger setup. Stdout carries protocol frames, so records go to a file.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use log::LevelFilter;

/// Install the global logger, appending to `log_file`. Falls back to stderr
/// when the file cannot be opened. `RUST_LOG` takes precedence over `level`.
pub fn init(log_file: &Path, level: LevelFilter) {
  let mut builder = env_logger::Builder::new();
  builder
    .filter_level(level)
    .parse_default_env()
    .format(|buf, record| {
      writeln!(
        buf,
        "{} - {} - {}",
        buf.timestamp_millis(),
        record.level(),
        record.args()
      )
    });

  let opened = log_file
    .parent()
    .map_or(Ok(()), std::fs::create_dir_all)
    .and_then(|()| OpenOptions::new().create(true).append(true).open(log_file));
  let fallback = match opened {
    Ok(file) => {
      builder.target(env_logger::Target::Pipe(Box::new(file)));
      None
    }
    Err(e) => {
      builder.target(env_logger::Target::Stderr);
      Some(e)
    }
  };

  if builder.try_init().is_err() {
    return;
  }
  if let Some(e) = fallback {
    log::warn!(
      "Could not open log file {}: {}. Logging to stderr.",
      log_file.display(),
      e
    );
  }
}
