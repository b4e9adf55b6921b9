use crate::shared::time::now_millis;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

pub fn engine_log_path(state_root: &Path) -> PathBuf {
    state_root.join("logs/engine.log")
}

/// Appends one JSON line to the engine log. Failures are swallowed: a broken
/// log must never take a session down with it.
pub fn append_engine_log(
    state_root: &Path,
    level: LogLevel,
    event: &str,
    session_id: Option<&str>,
    message: &str,
) {
    let payload = serde_json::json!({
        "timestamp": now_millis(),
        "level": level.as_str(),
        "event": event,
        "sessionId": session_id,
        "message": message,
    });

    let Ok(line) = serde_json::to_string(&payload) else {
        return;
    };

    let path = engine_log_path(state_root);
    if let Some(parent) = path.parent() {
        if fs::create_dir_all(parent).is_err() {
            return;
        }
    }
    let Ok(mut file) = fs::OpenOptions::new().create(true).append(true).open(path) else {
        return;
    };
    let _ = writeln!(file, "{line}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn appends_json_lines() {
        let dir = tempdir().expect("tempdir");
        append_engine_log(dir.path(), LogLevel::Info, "session.started", Some("s-1"), "go");
        append_engine_log(dir.path(), LogLevel::Warn, "var.mismatch", None, "x");

        let raw = fs::read_to_string(engine_log_path(dir.path())).expect("read log");
        let lines = raw.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).expect("json");
        assert_eq!(first["event"], "session.started");
        assert_eq!(first["sessionId"], "s-1");
        let second: serde_json::Value = serde_json::from_str(lines[1]).expect("json");
        assert_eq!(second["level"], "warn");
        assert!(second["sessionId"].is_null());
    }
}
