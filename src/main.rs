use std::process::ExitCode;

fn main() -> ExitCode {
  match mpv_host_lib::run() {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      log::error!("Native host stopped: {}", e);
      ExitCode::FAILURE
    }
  }
}
