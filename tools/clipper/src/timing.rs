use crate::commands::{
    display_command, pause_keys, recorder_request, replay_command, seek_keys, ui_command,
    DISPLAY_PANE, REPLAY_PANE, UI_PANE,
};
use crate::config::AppConfig;
use crate::errors::ClipperError;
use crate::logging::append_run_log;
use crate::pipeline::PipelineTracker;
use crate::readiness::ReplayReadiness;
use crate::runtime::ProcessRunner;
use crate::session::{Session, SessionManager};
use crate::shutdown::CancellationToken;
use crate::types::{PipelineState, Route};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipRequest {
    pub start_seconds: u64,
    pub route: Route,
    /// Passed to the replay player when route files were prefetched.
    pub data_dir: Option<PathBuf>,
}

/// Drives one run through the pipeline states. Each `step` performs exactly
/// one transition.
pub struct TimingController<'a> {
    cfg: &'a AppConfig,
    request: &'a ClipRequest,
    sessions: &'a dyn SessionManager,
    runner: &'a dyn ProcessRunner,
    readiness: &'a dyn ReplayReadiness,
    token: &'a CancellationToken,
    tracker: PipelineTracker,
    session: Option<Session>,
    recorder: Option<u64>,
}

impl<'a> TimingController<'a> {
    pub fn new(
        cfg: &'a AppConfig,
        request: &'a ClipRequest,
        sessions: &'a dyn SessionManager,
        runner: &'a dyn ProcessRunner,
        readiness: &'a dyn ReplayReadiness,
        token: &'a CancellationToken,
    ) -> Self {
        Self {
            cfg,
            request,
            sessions,
            runner,
            readiness,
            token,
            tracker: PipelineTracker::default(),
            session: None,
            recorder: None,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.tracker.state
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn run(&mut self) -> Result<PipelineState, ClipperError> {
        while !self.tracker.is_done() {
            self.step()?;
        }
        Ok(self.tracker.state)
    }

    pub fn step(&mut self) -> Result<PipelineState, ClipperError> {
        let Some(next) = self.tracker.state.next() else {
            return Err(ClipperError::InvalidTransition(format!(
                "{} is terminal",
                self.tracker.state.as_str()
            )));
        };
        match next {
            PipelineState::DisplayUp => self.start_display()?,
            PipelineState::ReplayAndUiUp => self.start_replay_and_ui()?,
            PipelineState::ReplayPaused => self.pause_replay()?,
            PipelineState::Seeking => self.seek()?,
            PipelineState::CaptureRunning => self.start_capture()?,
            PipelineState::Done => self.finish_capture()?,
            PipelineState::Idle => {}
        }
        self.tracker.transition(next)?;
        Ok(next)
    }

    /// Reaps a recorder that was started but never waited on.
    pub fn release_recorder(&mut self) {
        if let Some(handle) = self.recorder.take() {
            if let Err(err) = self.runner.kill(handle) {
                append_run_log(
                    "warn",
                    "capture.release_failed",
                    json!({ "error": err.to_string() }),
                );
            }
        }
    }

    fn live_session(&self) -> Result<&Session, ClipperError> {
        self.session.as_ref().ok_or_else(|| {
            ClipperError::InvalidTransition("no session has been created".to_string())
        })
    }

    fn start_display(&mut self) -> Result<(), ClipperError> {
        let command = display_command(self.cfg)?;
        let _guard = self.token.enter()?;
        let session =
            self.sessions
                .create_session(&self.cfg.session.name, DISPLAY_PANE, &command)?;
        self.session = Some(session);
        Ok(())
    }

    fn start_replay_and_ui(&mut self) -> Result<(), ClipperError> {
        let replay = replay_command(
            self.cfg,
            &self.request.route,
            self.request.start_seconds,
            self.request.data_dir.as_deref(),
        );
        let ui = ui_command(self.cfg);
        let _guard = self.token.enter()?;
        let session = self.session.as_mut().ok_or_else(|| {
            ClipperError::InvalidTransition("no session has been created".to_string())
        })?;
        self.sessions.add_pane(session, REPLAY_PANE, &replay)?;
        self.sessions.add_pane(session, UI_PANE, &ui)?;
        Ok(())
    }

    fn pause_replay(&mut self) -> Result<(), ClipperError> {
        {
            let _guard = self.token.enter()?;
            self.sessions
                .send_input(self.live_session()?, REPLAY_PANE, &pause_keys(self.cfg))?;
        }
        let timeout = Duration::from_secs(self.cfg.timing.ready_timeout_seconds);
        let outcome = self.readiness.wait_until_ready(timeout, self.token)?;
        append_run_log(
            "info",
            "replay.ready",
            json!({ "outcome": format!("{outcome:?}") }),
        );
        Ok(())
    }

    fn seek(&mut self) -> Result<(), ClipperError> {
        let keys = seek_keys(self.cfg, self.request.start_seconds);
        let _guard = self.token.enter()?;
        self.sessions
            .send_input(self.live_session()?, REPLAY_PANE, &keys)?;
        append_run_log(
            "info",
            "replay.seek.sent",
            json!({ "offset_seconds": self.request.start_seconds }),
        );
        Ok(())
    }

    fn start_capture(&mut self) -> Result<(), ClipperError> {
        let request = recorder_request(self.cfg)?;
        let _guard = self.token.enter()?;
        let handle = self.runner.spawn(request)?;
        self.recorder = Some(handle);
        append_run_log(
            "info",
            "capture.started",
            json!({
                "duration_seconds": self.cfg.capture.duration_seconds,
                "output": self.cfg.capture.output_path.display().to_string()
            }),
        );
        Ok(())
    }

    fn finish_capture(&mut self) -> Result<(), ClipperError> {
        let handle = self.recorder.take().ok_or_else(|| {
            ClipperError::InvalidTransition("recorder was never started".to_string())
        })?;
        let output = self.runner.wait(handle);
        if self.token.is_cancelled() {
            return Err(ClipperError::Interrupted);
        }
        let output = output?;
        if output.exit_code != 0 {
            return Err(ClipperError::Process(format!(
                "{} exited with {}: {}",
                self.cfg.capture.program,
                output.exit_code,
                last_line(&output.stderr)
            )));
        }
        append_run_log(
            "info",
            "capture.finished",
            json!({ "output": self.cfg.capture.output_path.display().to_string() }),
        );
        Ok(())
    }
}

fn last_line(text: &str) -> &str {
    text.lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or_default()
        .trim()
}
