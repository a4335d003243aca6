use crate::errors::ClipperError;
use crate::logging::{append_run_log, structured_fallback_line};
use crate::runtime::{ProcessTable, Terminal};
use crate::shutdown::{Shutdown, ShutdownReason};
use serde_json::json;
use std::sync::mpsc;
use std::sync::Arc;
use tokio::signal::unix::{signal as unix_signal, SignalKind};

/// Cleanup performed when the orchestrator receives a termination signal.
pub struct InterruptHandler {
    shutdown: Arc<Shutdown>,
    table: Arc<dyn ProcessTable>,
    terminal: Arc<dyn Terminal>,
}

impl InterruptHandler {
    pub fn new(
        shutdown: Arc<Shutdown>,
        table: Arc<dyn ProcessTable>,
        terminal: Arc<dyn Terminal>,
    ) -> Self {
        Self {
            shutdown,
            table,
            terminal,
        }
    }

    /// Sweeps the session, then kills the rest of our process group. Returns
    /// the exit code the process should leave with.
    pub fn handle(&self, signal: &str) -> i32 {
        append_run_log(
            "warn",
            "interrupt.received",
            json!({
                "signal": signal,
                "session": self.shutdown.session_name()
            }),
        );
        let _ = self.terminal.write_line(&structured_fallback_line(
            "interrupt",
            "received",
            &format!("{signal}, cleaning up session {}", self.shutdown.session_name()),
        ));

        let mut exit_code = 0;
        if let Err(err) = self.shutdown.run(ShutdownReason::Interrupted) {
            let _ = self.terminal.write_line(&structured_fallback_line(
                "interrupt",
                "sweep_failed",
                &err.to_string(),
            ));
            exit_code = 1;
        }
        match self.kill_process_group() {
            Ok(killed) => append_run_log(
                "info",
                "interrupt.group.killed",
                json!({ "killed": killed }),
            ),
            Err(err) => {
                append_run_log(
                    "error",
                    "interrupt.group.failed",
                    json!({ "error": err.to_string() }),
                );
                exit_code = 1;
            }
        }
        append_run_log(
            "info",
            "interrupt.exit",
            json!({ "exit_code": exit_code }),
        );
        exit_code
    }

    fn kill_process_group(&self) -> Result<Vec<u32>, ClipperError> {
        let own_pid = self.table.own_pid();
        let pgid = self.table.own_process_group();
        let members = self
            .table
            .snapshot()?
            .into_iter()
            .filter(|entry| entry.pgid == pgid && entry.pid != own_pid && entry.pid > 1)
            .map(|entry| entry.pid)
            .collect::<Vec<_>>();
        let mut killed = Vec::new();
        let mut failures = Vec::new();
        for pid in members {
            match self.table.kill(pid) {
                Ok(()) => killed.push(pid),
                Err(err) => failures.push(err.to_string()),
            }
        }
        if failures.is_empty() {
            return Ok(killed);
        }
        Err(ClipperError::Process(format!(
            "killed {killed:?} but {} group member(s) survived: {}",
            failures.len(),
            failures.join("; ")
        )))
    }
}

/// Starts the signal thread and returns once SIGINT, SIGTERM and SIGHUP are
/// being listened for. The first signal runs `handler` and exits the process.
pub fn install(handler: InterruptHandler) -> Result<(), ClipperError> {
    let (ready_tx, ready_rx) = mpsc::channel::<Result<(), String>>();
    std::thread::Builder::new()
        .name("clipper-signals".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    let _ = ready_tx.send(Err(err.to_string()));
                    return;
                }
            };
            let Some(signal) = runtime.block_on(wait_for_signal(ready_tx)) else {
                return;
            };
            let code = handler.handle(signal);
            std::process::exit(code);
        })
        .map_err(|e| ClipperError::Io(format!("failed to start signal thread: {e}")))?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(()),
        Ok(Err(reason)) => Err(ClipperError::Io(format!(
            "failed to install signal handlers: {reason}"
        ))),
        Err(_) => Err(ClipperError::Io(
            "signal thread exited before installing handlers".to_string(),
        )),
    }
}

async fn wait_for_signal(ready: mpsc::Sender<Result<(), String>>) -> Option<&'static str> {
    let streams = unix_signal(SignalKind::interrupt()).and_then(|int| {
        let term = unix_signal(SignalKind::terminate())?;
        let hup = unix_signal(SignalKind::hangup())?;
        Ok((int, term, hup))
    });
    let (mut sigint, mut sigterm, mut sighup) = match streams {
        Ok(streams) => streams,
        Err(err) => {
            let _ = ready.send(Err(err.to_string()));
            return None;
        }
    };
    let _ = ready.send(Ok(()));

    tokio::select! {
        _ = sigint.recv() => Some("SIGINT"),
        _ = sigterm.recv() => Some("SIGTERM"),
        _ = sighup.recv() => Some("SIGHUP"),
    }
}
