use crate::errors::ClipperError;
use crate::logging::append_run_log;
use crate::types::PipelineState;
use serde_json::json;

/// Current position of one run in the startup sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineTracker {
    pub state: PipelineState,
    pub transitions: u32,
}

impl Default for PipelineTracker {
    fn default() -> Self {
        Self {
            state: PipelineState::Idle,
            transitions: 0,
        }
    }
}

impl PipelineTracker {
    pub fn transition(&mut self, next: PipelineState) -> Result<(), ClipperError> {
        validate_transition(self.state, next)?;
        append_run_log(
            "info",
            "pipeline.transition",
            json!({
                "from": self.state.as_str(),
                "to": next.as_str()
            }),
        );
        self.state = next;
        self.transitions = self.transitions.saturating_add(1);
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        self.state == PipelineState::Done
    }
}

pub fn validate_transition(from: PipelineState, to: PipelineState) -> Result<(), ClipperError> {
    use PipelineState as S;

    let allowed = match from {
        S::Idle => matches!(to, S::DisplayUp),
        S::DisplayUp => matches!(to, S::ReplayAndUiUp),
        S::ReplayAndUiUp => matches!(to, S::ReplayPaused),
        S::ReplayPaused => matches!(to, S::Seeking),
        S::Seeking => matches!(to, S::CaptureRunning),
        S::CaptureRunning => matches!(to, S::Done),
        S::Done => false,
    };

    if !allowed {
        return Err(ClipperError::InvalidTransition(format!(
            "{} -> {}",
            from.as_str(),
            to.as_str()
        )));
    }
    Ok(())
}
