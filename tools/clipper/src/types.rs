use crate::errors::ClipperError;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_ROUTE: &str = "a2a0ccea32023010|2023-07-27--13-01-19";

/// Dataset identifier plus timestamp, handed to the replay player untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Route(String);

impl Route {
    pub fn parse(value: &str) -> Result<Self, ClipperError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(ClipperError::Cli("route must not be empty".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Route name with a trailing `--<segment>` suffix removed.
    pub fn canonical(&self) -> &str {
        match self.0.rsplit_once("--") {
            Some((head, tail))
                if !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()) =>
            {
                head
            }
            _ => &self.0,
        }
    }

    pub fn dataset_id(&self) -> &str {
        self.canonical()
            .split_once('|')
            .map(|(id, _)| id)
            .unwrap_or_else(|| self.canonical())
    }

    pub fn route_date(&self) -> &str {
        self.canonical()
            .split_once('|')
            .map(|(_, date)| date)
            .unwrap_or_else(|| self.canonical())
    }

    pub fn url_encoded(&self) -> String {
        self.canonical().replace('|', "%7C")
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn parse(value: &str) -> Result<Self, ClipperError> {
        let (w, h) = value
            .trim()
            .split_once(|c: char| c == 'x' || c == 'X')
            .ok_or_else(|| ClipperError::InvalidConfig(format!("resolution `{value}` is not WxH")))?;
        let width = w
            .parse::<u32>()
            .map_err(|e| ClipperError::InvalidConfig(format!("resolution width `{w}`: {e}")))?;
        let height = h
            .parse::<u32>()
            .map_err(|e| ClipperError::InvalidConfig(format!("resolution height `{h}`: {e}")))?;
        if width == 0 || height == 0 {
            return Err(ClipperError::InvalidConfig(format!(
                "resolution `{value}` must be non-zero"
            )));
        }
        Ok(Self { width, height })
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    DisplayUp,
    ReplayAndUiUp,
    ReplayPaused,
    Seeking,
    CaptureRunning,
    Done,
}

impl PipelineState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::DisplayUp => "display_up",
            Self::ReplayAndUiUp => "replay_and_ui_up",
            Self::ReplayPaused => "replay_paused",
            Self::Seeking => "seeking",
            Self::CaptureRunning => "capture_running",
            Self::Done => "done",
        }
    }

    pub fn next(self) -> Option<Self> {
        match self {
            Self::Idle => Some(Self::DisplayUp),
            Self::DisplayUp => Some(Self::ReplayAndUiUp),
            Self::ReplayAndUiUp => Some(Self::ReplayPaused),
            Self::ReplayPaused => Some(Self::Seeking),
            Self::Seeking => Some(Self::CaptureRunning),
            Self::CaptureRunning => Some(Self::Done),
            Self::Done => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_strips_segment_suffix_only_when_numeric() {
        let segment = Route::parse("a2a0ccea32023010|2023-07-27--13-01-19--5").expect("route");
        assert_eq!(segment.canonical(), "a2a0ccea32023010|2023-07-27--13-01-19");
        assert_eq!(segment.dataset_id(), "a2a0ccea32023010");
        assert_eq!(segment.route_date(), "2023-07-27--13-01-19");
        assert_eq!(
            segment.url_encoded(),
            "a2a0ccea32023010%7C2023-07-27--13-01-19"
        );

        let route = Route::parse(DEFAULT_ROUTE).expect("route");
        assert_eq!(route.canonical(), DEFAULT_ROUTE);
        assert_eq!(route.as_str(), DEFAULT_ROUTE);
    }

    #[test]
    fn route_rejects_blank_input() {
        assert!(matches!(Route::parse("  "), Err(ClipperError::Cli(_))));
    }

    #[test]
    fn resolution_parses_and_rejects_garbage() {
        let res = Resolution::parse("2160x1080").expect("res");
        assert_eq!((res.width, res.height), (2160, 1080));
        assert_eq!(res.to_string(), "2160x1080");
        assert!(Resolution::parse("2160").is_err());
        assert!(Resolution::parse("0x1080").is_err());
    }

    #[test]
    fn pipeline_states_form_a_single_chain() {
        let mut state = PipelineState::Idle;
        let mut visited = vec![state];
        while let Some(next) = state.next() {
            visited.push(next);
            state = next;
        }
        assert_eq!(visited.len(), 7);
        assert_eq!(state, PipelineState::Done);
    }
}
