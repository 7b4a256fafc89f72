// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use slog::{Drain, Logger};
use std::io::Write;
use std::path::Path;

/// Root logger on stdout, for running under a supervisor that captures it.
pub fn init_logger() -> Logger {
    build_logger(std::io::stdout())
}

/// Root logger appending to a file, for installs where stdout goes nowhere.
pub fn init_file_logger<P: AsRef<Path>>(path: P) -> std::io::Result<Logger> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    Ok(build_logger(file))
}

pub fn build_logger<W: Write + Send + 'static>(w: W) -> Logger {
    let drain = slog_bunyan::new(w).build().fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(0x2000)
        .build()
        .fuse();
    slog::Logger::root(drain, slog::o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_logger_creates_and_appends() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("agent.log");

        {
            let log = init_file_logger(&path).unwrap();
            slog::info!(log, "first line");
        }
        // A second open must append, not truncate.
        {
            let log = init_file_logger(&path).unwrap();
            slog::info!(log, "second line");
        }
        // Drains are async; dropping the loggers above flushed them.
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("first line"));
        assert!(contents.contains("second line"));
    }

    #[test]
    fn file_logger_reports_unwritable_path() {
        assert!(init_file_logger("/nonexistent-dir/agent.log").is_err());
    }
}
