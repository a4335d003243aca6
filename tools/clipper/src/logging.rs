use crate::errors::ClipperError;
use crate::log_retention::enforce_total_budget;
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

pub const DEFAULT_DISK_BUDGET_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct JsonlLogger {
    pub path: PathBuf,
    pub max_payload_bytes: usize,
    pub budget_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent<'a> {
    pub level: &'a str,
    pub event_type: &'a str,
    pub ts_ms: u64,
    pub payload: Value,
}

impl JsonlLogger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_payload_bytes: 4096,
            budget_bytes: DEFAULT_DISK_BUDGET_BYTES,
        }
    }

    /// Writes one JSON line, then prunes older run logs in the same directory.
    pub fn append(&self, event: &LogEvent<'_>) -> Result<(), ClipperError> {
        let dir = self.path.parent().filter(|p| !p.as_os_str().is_empty());
        if let Some(dir) = dir {
            fs::create_dir_all(dir).map_err(io_error)?;
        }
        let record = LogEvent {
            payload: truncate_json(event.payload.clone(), self.max_payload_bytes),
            ..*event
        };
        let mut line = serde_json::to_vec(&record).map_err(|e| ClipperError::Io(e.to_string()))?;
        line.push(b'\n');

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(&line))
            .map_err(io_error)?;

        if let Some(dir) = dir {
            enforce_total_budget(dir, self.budget_bytes, &self.path)?;
        }
        Ok(())
    }
}

fn io_error(err: std::io::Error) -> ClipperError {
    ClipperError::Io(err.to_string())
}

static RUN_LOGGER: OnceLock<Mutex<Option<Arc<JsonlLogger>>>> = OnceLock::new();

fn logger_slot() -> &'static Mutex<Option<Arc<JsonlLogger>>> {
    RUN_LOGGER.get_or_init(|| Mutex::new(None))
}

/// Route every subsequent `append_run_log` call to a fresh file in `dir`.
pub fn init_run_log(dir: impl AsRef<Path>, budget_bytes: u64) -> Result<PathBuf, ClipperError> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).map_err(io_error)?;
    let path = dir.join(format!("run-{}-{}.jsonl", now_ms(), std::process::id()));
    let mut logger = JsonlLogger::new(&path);
    logger.budget_bytes = budget_bytes;
    *logger_slot()
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(logger));
    Ok(path)
}

pub fn clear_run_log() {
    *logger_slot()
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = None;
}

/// Best effort: a missing logger or a failed write never fails the run.
pub fn append_run_log(level: &str, event_type: &str, payload: Value) {
    let logger = logger_slot()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .as_ref()
        .map(Arc::clone);
    if let Some(logger) = logger {
        let _ = logger.append(&LogEvent {
            level,
            event_type,
            ts_ms: now_ms(),
            payload,
        });
    }
}

pub fn structured_fallback_line(component: &str, state: &str, message: &str) -> String {
    format!(
        "component={component} state={state} message={} ",
        message.replace('\n', "\\n")
    )
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn truncate_json(value: Value, max_bytes: usize) -> Value {
    let rendered = serde_json::to_string(&value).unwrap_or_default();
    if rendered.len() <= max_bytes {
        return value;
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    Value::String(format!("{}...", &rendered[..cut]))
}

#[cfg(test)]
mod tests {
    use super::{structured_fallback_line, truncate_json, JsonlLogger, LogEvent};
    use serde_json::{json, Value};

    #[test]
    fn logger_truncates_large_payloads_and_writes_jsonl() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run.jsonl");
        let mut logger = JsonlLogger::new(&path);
        logger.max_payload_bytes = 20;
        logger.budget_bytes = 1024;

        logger
            .append(&LogEvent {
                level: "info",
                event_type: "sweep.kill.sent",
                ts_ms: 7,
                payload: json!({"pids": "abcdefghijklmnopqrstuvwxyz"}),
            })
            .expect("append");

        let text = std::fs::read_to_string(&path).expect("read");
        assert!(text.contains("\"event_type\":\"sweep.kill.sent\""));
        assert!(text.contains("\"ts_ms\":7"));
        assert!(text.contains("..."));
    }

    #[test]
    fn truncation_respects_utf8_boundaries() {
        let value = truncate_json(json!({"k": "ééééééééééé"}), 10);
        let Value::String(text) = value else {
            panic!("expected truncated string");
        };
        assert!(text.ends_with("..."));
    }

    #[test]
    fn fallback_line_is_deterministic() {
        let line = structured_fallback_line("pipeline", "seeking", "offset\n120");
        assert_eq!(line, "component=pipeline state=seeking message=offset\\n120 ");
    }
}
