//! Logging setup for cadre.
//!
//! Output goes to `~/.cadre/cadre.log`, truncated on startup, or to stderr
//! when the file cannot be opened. `RUST_LOG` takes precedence; otherwise
//! the level is `info`, or `debug` with `--debug` / `CADRE_DEBUG=1`.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

pub const DEBUG_ENV: &str = "CADRE_DEBUG";

/// True for `1` or `true` (any case).
pub fn debug_from_env(value: Option<&str>) -> bool {
    value
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Default directive when `RUST_LOG` is unset.
pub fn default_directive(debug: bool) -> &'static str {
    if debug {
        "cadre=debug,info"
    } else {
        "info"
    }
}

fn log_path() -> Option<PathBuf> {
    let dir = dirs::home_dir()?.join(".cadre");
    std::fs::create_dir_all(&dir).ok()?;
    Some(dir.join("cadre.log"))
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init(debug: bool) {
    let env_debug = debug_from_env(std::env::var(DEBUG_ENV).ok().as_deref());
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug || env_debug)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    // File::create truncates.
    let installed = match log_path().and_then(|path| File::create(path).ok()) {
        Some(file) => builder
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init(),
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    if installed.is_err() {
        tracing::debug!("Logging already initialized");
    }
}
