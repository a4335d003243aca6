use crate::errors::ClipperError;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

struct RunLogFile {
    path: PathBuf,
    modified: Option<SystemTime>,
    len: u64,
}

fn run_logs_in(dir: &Path) -> Result<Vec<RunLogFile>, ClipperError> {
    let entries = fs::read_dir(dir).map_err(|e| ClipperError::Io(e.to_string()))?;
    let mut logs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.extension().is_some_and(|ext| ext == "jsonl") {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        logs.push(RunLogFile {
            path,
            modified: meta.modified().ok(),
            len: meta.len(),
        });
    }
    logs.sort_by_key(|log| log.modified);
    Ok(logs)
}

/// Deletes the oldest run logs in `dir` until the total size fits `budget_bytes`.
/// `active` is never deleted, even when it alone exceeds the budget.
pub fn enforce_total_budget(
    dir: &Path,
    budget_bytes: u64,
    active: &Path,
) -> Result<Vec<PathBuf>, ClipperError> {
    let logs = run_logs_in(dir)?;
    let mut excess = logs
        .iter()
        .map(|log| log.len)
        .sum::<u64>()
        .saturating_sub(budget_bytes);

    let mut pruned = Vec::new();
    for log in logs.into_iter().filter(|log| log.path != active) {
        if excess == 0 {
            break;
        }
        fs::remove_file(&log.path)
            .map_err(|e| ClipperError::Io(format!("prune {}: {e}", log.path.display())))?;
        excess = excess.saturating_sub(log.len);
        pruned.push(log.path);
    }
    Ok(pruned)
}
