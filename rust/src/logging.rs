use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "medcall.log";

static INIT: OnceLock<()> = OnceLock::new();

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber once per process. Later calls are no-ops.
pub(crate) fn init_logging(data_dir: &str) {
    INIT.get_or_init(|| {
        let path = Path::new(data_dir).join(LOG_FILE);
        let file = std::fs::create_dir_all(data_dir)
            .and_then(|_| OpenOptions::new().create(true).append(true).open(&path));

        let result = match file {
            Ok(file) => tracing_subscriber::registry()
                .with(env_filter())
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
                .try_init(),
            Err(e) => {
                eprintln!("[medcall] log file {} unavailable: {e}", path.display());
                tracing_subscriber::registry()
                    .with(env_filter())
                    .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                    .try_init()
            }
        };
        // Host processes (tests, embedding apps) may already own the global subscriber.
        if let Err(e) = result {
            eprintln!("[medcall] tracing subscriber not installed: {e}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_string_lossy().into_owned();
        init_logging(&data_dir);
        init_logging(&data_dir);
        assert!(INIT.get().is_some());
    }
}
