//! slog root loggers for the hub and agent daemons.

use std::fs::OpenOptions;
use std::path::Path;

use slog::{o, Drain, Logger};

/// Root logger writing to `<dir>/<process>_<YYYYMMDD>.log`.
///
/// Falls back to stderr when the log directory cannot be created, so a
/// daemon still reports why it failed to start.
pub fn build_logger(dir: &Path, process: &str) -> Logger {
    let name = format!("{}_{}.log", process, chrono::Local::now().format("%Y%m%d"));

    let file = std::fs::create_dir_all(dir).and_then(|_| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(&name))
    });

    match file {
        Ok(file) => {
            let decorator = slog_term::PlainDecorator::new(file);
            let drain = slog_term::FullFormat::new(decorator).build().fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            Logger::root(drain, o!("process" => process.to_string()))
        }
        Err(_) => stderr_logger(process),
    }
}

pub fn stderr_logger(process: &str) -> Logger {
    let decorator = slog_term::PlainDecorator::new(std::io::stderr());
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!("process" => process.to_string()))
}

/// Logger that drops everything.
pub fn discard() -> Logger {
    Logger::root(slog::Discard, o!())
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::info;

    #[test]
    fn test_build_logger_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");

        {
            let logger = build_logger(&logs, "hub");
            info!(logger, "hello"; "port" => 7527);
        }

        let entries: Vec<_> = std::fs::read_dir(&logs).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let name = entries[0].as_ref().unwrap().file_name();
        assert!(name.to_string_lossy().starts_with("hub_"));
    }
}
