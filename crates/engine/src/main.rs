//! `arivox`: AI voice agent engine for Asterisk
//!
//! Usage: `arivox [config-path]`. The config path may also come from
//! `ARIVOX_CONFIG`; the default is `/etc/arivox/config.toml`.

use std::path::PathBuf;
use std::process::ExitCode;

use tracing::error;
use tracing_subscriber::EnvFilter;

use arivox_engine::app;

fn config_path() -> PathBuf {
    if let Some(arg) = std::env::args().nth(1) {
        return PathBuf::from(arg);
    }
    if let Ok(env) = std::env::var("ARIVOX_CONFIG") {
        return PathBuf::from(env);
    }
    PathBuf::from("/etc/arivox/config.toml")
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("runtime init failed: {e}");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(app::run(config_path())) {
        Ok(()) => ExitCode::SUCCESS,
        Err(fatal) => {
            error!("{fatal}");
            ExitCode::from(fatal.exit_code() as u8)
        }
    }
}
