use crate::errors::ClipperError;
use crate::logging::append_run_log;
use crate::runtime::{Clock, FileSystem};
use crate::shutdown::CancellationToken;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessOutcome {
    /// The fixed settle interval elapsed.
    Settled,
    /// Every readiness marker appeared.
    Ready,
    /// Markers never appeared; fell back to the settle interval.
    TimedOut,
}

/// Decides when the paused replay player can accept a seek.
pub trait ReplayReadiness: Send + Sync {
    fn wait_until_ready(
        &self,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<ReadinessOutcome, ClipperError>;
}

/// Longest single sleep while waiting, so a cancelled token is noticed
/// within about a second.
const SLEEP_SLICE: Duration = Duration::from_secs(1);

fn sleep_unless_cancelled(
    clock: &dyn Clock,
    duration: Duration,
    token: &CancellationToken,
) -> Result<(), ClipperError> {
    let mut remaining = duration;
    while !remaining.is_zero() {
        if token.is_cancelled() {
            return Err(ClipperError::Interrupted);
        }
        let slice = remaining.min(SLEEP_SLICE);
        clock.sleep(slice)?;
        remaining -= slice;
    }
    if token.is_cancelled() {
        return Err(ClipperError::Interrupted);
    }
    Ok(())
}

pub struct FixedSettle {
    clock: Arc<dyn Clock>,
    settle: Duration,
}

impl FixedSettle {
    pub fn new(clock: Arc<dyn Clock>, settle: Duration) -> Self {
        Self { clock, settle }
    }
}

impl ReplayReadiness for FixedSettle {
    fn wait_until_ready(
        &self,
        _timeout: Duration,
        token: &CancellationToken,
    ) -> Result<ReadinessOutcome, ClipperError> {
        sleep_unless_cancelled(self.clock.as_ref(), self.settle, token)?;
        Ok(ReadinessOutcome::Settled)
    }
}

/// Polls for the prefetched files the replay player reads at startup.
///
/// Markers only prove the files are on disk, not that the player has loaded
/// them, so a short `min_settle` still follows once every marker exists.
pub struct MarkerReadiness {
    clock: Arc<dyn Clock>,
    file_system: Arc<dyn FileSystem>,
    markers: Vec<PathBuf>,
    poll: Duration,
    min_settle: Duration,
    fallback: FixedSettle,
}

impl MarkerReadiness {
    pub fn new(
        clock: Arc<dyn Clock>,
        file_system: Arc<dyn FileSystem>,
        markers: Vec<PathBuf>,
        poll: Duration,
        min_settle: Duration,
        settle: Duration,
    ) -> Self {
        let fallback = FixedSettle::new(Arc::clone(&clock), settle);
        Self {
            clock,
            file_system,
            markers,
            poll,
            min_settle,
            fallback,
        }
    }

    fn missing(&self) -> Vec<&PathBuf> {
        self.markers
            .iter()
            .filter(|path| !self.file_system.exists(path))
            .collect()
    }
}

impl ReplayReadiness for MarkerReadiness {
    fn wait_until_ready(
        &self,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<ReadinessOutcome, ClipperError> {
        let deadline = self.clock.now() + timeout;
        loop {
            if token.is_cancelled() {
                return Err(ClipperError::Interrupted);
            }
            let missing = self.missing();
            if missing.is_empty() {
                append_run_log(
                    "info",
                    "readiness.markers.ready",
                    json!({
                        "markers": self.markers.len(),
                        "min_settle_ms": self.min_settle.as_millis() as u64
                    }),
                );
                sleep_unless_cancelled(self.clock.as_ref(), self.min_settle, token)?;
                return Ok(ReadinessOutcome::Ready);
            }
            let remaining = deadline
                .duration_since(self.clock.now())
                .unwrap_or(Duration::ZERO);
            if remaining.is_zero() {
                append_run_log(
                    "warn",
                    "readiness.markers.timeout",
                    json!({
                        "timeout_ms": timeout.as_millis() as u64,
                        "missing": missing
                            .iter()
                            .map(|p| p.display().to_string())
                            .collect::<Vec<_>>()
                    }),
                );
                self.fallback.wait_until_ready(timeout, token)?;
                return Ok(ReadinessOutcome::TimedOut);
            }
            sleep_unless_cancelled(self.clock.as_ref(), self.poll.min(remaining), token)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{FakeClock, FakeFileSystem};
    use std::time::SystemTime;

    #[test]
    fn fixed_settle_waits_the_whole_interval_in_slices() {
        let clock = FakeClock::default();
        let settle = FixedSettle::new(Arc::new(clock.clone()), Duration::from_millis(2500));
        let outcome = settle
            .wait_until_ready(Duration::from_secs(120), &CancellationToken::new())
            .expect("settled");
        assert_eq!(outcome, ReadinessOutcome::Settled);
        assert_eq!(
            clock.sleeps(),
            vec![
                SystemTime::UNIX_EPOCH + Duration::from_secs(1),
                SystemTime::UNIX_EPOCH + Duration::from_secs(2),
                SystemTime::UNIX_EPOCH + Duration::from_millis(2500),
            ]
        );
    }

    #[test]
    fn cancelled_token_cuts_the_settle_short() {
        let token = CancellationToken::new();
        token.cancel();
        let clock = FakeClock::default();
        let settle = FixedSettle::new(Arc::new(clock.clone()), Duration::from_secs(5));
        assert!(matches!(
            settle.wait_until_ready(Duration::from_secs(120), &token),
            Err(ClipperError::Interrupted)
        ));
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn present_markers_still_get_the_minimum_settle() {
        let clock = FakeClock::default();
        let fs = FakeFileSystem::with_file("/data/r--0/rlog", "");
        let readiness = MarkerReadiness::new(
            Arc::new(clock.clone()),
            Arc::new(fs),
            vec![PathBuf::from("/data/r--0/rlog")],
            Duration::from_millis(500),
            Duration::from_millis(750),
            Duration::from_secs(5),
        );
        let outcome = readiness
            .wait_until_ready(Duration::from_secs(10), &CancellationToken::new())
            .expect("ready");
        assert_eq!(outcome, ReadinessOutcome::Ready);
        assert_eq!(
            clock.sleeps(),
            vec![SystemTime::UNIX_EPOCH + Duration::from_millis(750)]
        );
    }

    #[test]
    fn missing_markers_time_out_into_the_settle_fallback() {
        let clock = FakeClock::default();
        let readiness = MarkerReadiness::new(
            Arc::new(clock.clone()),
            Arc::new(FakeFileSystem::default()),
            vec![PathBuf::from("/data/r--0/rlog")],
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(5),
        );
        let outcome = readiness
            .wait_until_ready(Duration::from_secs(3), &CancellationToken::new())
            .expect("fallback");
        assert_eq!(outcome, ReadinessOutcome::TimedOut);
        assert_eq!(
            clock.now(),
            SystemTime::UNIX_EPOCH + Duration::from_secs(3 + 5)
        );
    }

    #[test]
    fn cancellation_stops_polling() {
        let token = CancellationToken::new();
        token.cancel();
        let readiness = MarkerReadiness::new(
            Arc::new(FakeClock::default()),
            Arc::new(FakeFileSystem::default()),
            vec![PathBuf::from("/never")],
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(5),
        );
        assert!(matches!(
            readiness.wait_until_ready(Duration::from_secs(60), &token),
            Err(ClipperError::Interrupted)
        ));
    }
}
