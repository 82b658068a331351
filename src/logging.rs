//! Per-session logging.
//!
//! Library-wide diagnostics go through the `log` facade; this module adds
//! the per-session command log: every framed command, module run and state
//! change of a session is appended to its own timestamped file so a session
//! can be audited after the fact.

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use chrono::Local;

/// Timestamped append-only log bound to one session. Falls back to
/// facade-only logging when the log file cannot be created.
pub struct SessionLog {
    session_id: u32,
    file: Option<Mutex<BufWriter<std::fs::File>>>,
}

impl SessionLog {
    /// Open (or create) `<dir>/session-<id>.log`.
    pub fn open(dir: &Path, session_id: u32) -> SessionLog {
        let file = std::fs::create_dir_all(dir)
            .and_then(|_| {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(dir.join(format!("session-{}.log", session_id)))
            })
            .map(|f| Mutex::new(BufWriter::new(f)));

        if let Err(err) = &file {
            log::warn!("session {}: log file unavailable: {}", session_id, err);
        }

        SessionLog {
            session_id,
            file: file.ok(),
        }
    }

    /// A log sink that only forwards to the facade. Used by tests and
    /// one-shot sessions.
    pub fn disabled(session_id: u32) -> SessionLog {
        SessionLog {
            session_id,
            file: None,
        }
    }

    pub fn log(&self, message: &str) {
        log::info!("[session {}] {}", self.session_id, message);

        if let Some(file) = &self.file {
            if let Ok(mut writer) = file.lock() {
                let _ = writeln!(
                    writer,
                    "{} {}",
                    Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                    message
                );
            }
        }
    }

    pub fn flush(&self) {
        if let Some(file) = &self.file {
            if let Ok(mut writer) = file.lock() {
                let _ = writer.flush();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_lines_are_timestamped_and_appended() {
        let dir = tempfile::tempdir().unwrap();
        let log = SessionLog::open(dir.path(), 3);
        log.log("probe identified /bin/dash");
        log.log("pty spawned via script");
        log.flush();

        let content = std::fs::read_to_string(dir.path().join("session-3.log")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("probe identified /bin/dash"));
        assert!(lines[1].contains("pty spawned"));
    }

    #[test]
    fn disabled_sink_does_not_write() {
        let log = SessionLog::disabled(1);
        log.log("nothing to see");
        log.flush();
    }
}
