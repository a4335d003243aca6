use crate::errors::ClipperError;
use crate::logging::append_run_log;
use crate::sweeper::{SweepReport, Sweeper};
use serde::Serialize;
use serde_json::json;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Shared cancellation flag. Holding the guard returned by `enter` keeps
/// `cancel` from completing, so work started under it is never half-issued
/// when shutdown begins.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<Mutex<bool>>,
}

pub struct CancelGuard<'a> {
    _held: MutexGuard<'a, bool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) -> Result<CancelGuard<'_>, ClipperError> {
        let held = self.lock();
        if *held {
            return Err(ClipperError::Interrupted);
        }
        Ok(CancelGuard { _held: held })
    }

    /// Blocks until no guard is held.
    pub fn cancel(&self) {
        *self.lock() = true;
    }

    pub fn is_cancelled(&self) -> bool {
        *self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.cancelled.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownReason {
    Completed,
    Failed,
    Interrupted,
}

impl ShutdownReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
        }
    }
}

/// The single cleanup path for a run. Whoever calls `run` first performs the
/// sweep; everyone else waits for it and gets `Ok(None)`.
pub struct Shutdown {
    token: CancellationToken,
    sweeper: Sweeper,
    session_name: String,
    finished: Mutex<Option<ShutdownReason>>,
}

impl Shutdown {
    pub fn new(sweeper: Sweeper, session_name: impl Into<String>) -> Self {
        Self {
            token: CancellationToken::new(),
            sweeper,
            session_name: session_name.into(),
            finished: Mutex::new(None),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    /// Reason of the run that performed cleanup, once it has finished.
    pub fn finished_reason(&self) -> Option<ShutdownReason> {
        *self.finished.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn run(&self, reason: ShutdownReason) -> Result<Option<SweepReport>, ClipperError> {
        self.token.cancel();
        let mut finished = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(first) = *finished {
            append_run_log(
                "debug",
                "shutdown.already_done",
                json!({
                    "reason": reason.as_str(),
                    "first_reason": first.as_str()
                }),
            );
            return Ok(None);
        }

        append_run_log(
            "info",
            "shutdown.started",
            json!({
                "reason": reason.as_str(),
                "session": self.session_name
            }),
        );
        let result = self.sweeper.sweep(&self.session_name);
        *finished = Some(reason);
        match result {
            Ok(report) => {
                append_run_log(
                    "info",
                    "shutdown.completed",
                    json!({
                        "reason": reason.as_str(),
                        "killed": report.killed.len()
                    }),
                );
                Ok(Some(report))
            }
            Err(err) => {
                append_run_log(
                    "error",
                    "shutdown.failed",
                    json!({
                        "reason": reason.as_str(),
                        "error": err.to_string()
                    }),
                );
                Err(err)
            }
        }
    }
}
