use crate::config::AppConfig;
use crate::download::{prefetch_route, PrefetchPlan, PrefetchReport, RouteApi};
use crate::errors::ClipperError;
use crate::logging::{append_run_log, structured_fallback_line};
use crate::readiness::{FixedSettle, MarkerReadiness, ReplayReadiness};
use crate::runtime::{ProcessTable, ProductionRuntime};
use crate::segments::SegmentWindow;
use crate::session::SessionManager;
use crate::shutdown::{Shutdown, ShutdownReason};
use crate::sweeper::{SweepReport, Sweeper};
use crate::timing::{ClipRequest, TimingController};
use crate::types::{PipelineState, Route};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Everything a run talks to outside its own memory.
pub struct ClipContext<'a> {
    pub runtime: &'a ProductionRuntime,
    pub sessions: Arc<dyn SessionManager>,
    /// Required only when prefetch is enabled.
    pub route_api: Option<&'a dyn RouteApi>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipOutcome {
    pub final_state: PipelineState,
    pub output: PathBuf,
    pub leading_sweep: SweepReport,
    /// `None` when an interrupt already performed the cleanup.
    pub final_sweep: Option<SweepReport>,
    pub prefetch: Option<PrefetchReport>,
}

pub fn sweeper_for(
    cfg: &AppConfig,
    sessions: Arc<dyn SessionManager>,
    table: Arc<dyn ProcessTable>,
) -> Sweeper {
    Sweeper::new(sessions, table, cfg.stale_processes())
}

pub fn shutdown_for(
    cfg: &AppConfig,
    sessions: Arc<dyn SessionManager>,
    table: Arc<dyn ProcessTable>,
) -> Shutdown {
    Shutdown::new(sweeper_for(cfg, sessions, table), cfg.session.name.clone())
}

/// Manual cleanup: kill whatever a previous run left behind.
pub fn sweep_only(ctx: &ClipContext<'_>, cfg: &AppConfig) -> Result<SweepReport, ClipperError> {
    let sweeper = sweeper_for(
        cfg,
        Arc::clone(&ctx.sessions),
        Arc::clone(&ctx.runtime.process_table),
    );
    let report = sweeper.sweep(&cfg.session.name)?;
    progress(
        ctx,
        "sweep",
        if report.is_noop() { "noop" } else { "done" },
        &format!("session={} killed={}", report.session, report.killed.len()),
    );
    Ok(report)
}

/// One complete run. Cleanup goes through `shutdown` whether the pipeline
/// completes, fails or is interrupted.
pub fn run_clip(
    ctx: &ClipContext<'_>,
    cfg: &AppConfig,
    start_seconds: u64,
    route: &Route,
    shutdown: &Shutdown,
) -> Result<ClipOutcome, ClipperError> {
    append_run_log(
        "info",
        "run.started",
        json!({
            "session": cfg.session.name,
            "route": route.as_str(),
            "start_seconds": start_seconds,
            "duration_seconds": cfg.capture.duration_seconds
        }),
    );
    let leading_sweep = sweep_only(ctx, cfg)?;

    let result = drive(ctx, cfg, start_seconds, route, shutdown);
    let reason = match &result {
        Ok(_) => ShutdownReason::Completed,
        Err(ClipperError::Interrupted) => ShutdownReason::Interrupted,
        Err(_) => ShutdownReason::Failed,
    };
    let final_sweep = shutdown.run(reason);

    let (final_state, prefetch) = match result {
        Ok(done) => done,
        Err(err) => {
            append_run_log(
                "error",
                "run.failed",
                json!({ "error": err.to_string() }),
            );
            progress(ctx, "run", "failed", &err.to_string());
            if let Err(sweep_err) = final_sweep {
                progress(ctx, "shutdown", "failed", &sweep_err.to_string());
            }
            return Err(err);
        }
    };
    let final_sweep = final_sweep?;
    progress(
        ctx,
        "run",
        "done",
        &format!("output={}", cfg.capture.output_path.display()),
    );
    append_run_log(
        "info",
        "run.completed",
        json!({ "output": cfg.capture.output_path.display().to_string() }),
    );
    Ok(ClipOutcome {
        final_state,
        output: cfg.capture.output_path.clone(),
        leading_sweep,
        final_sweep,
        prefetch,
    })
}

fn drive(
    ctx: &ClipContext<'_>,
    cfg: &AppConfig,
    start_seconds: u64,
    route: &Route,
    shutdown: &Shutdown,
) -> Result<(PipelineState, Option<PrefetchReport>), ClipperError> {
    let runtime = ctx.runtime;
    if let Some(parent) = cfg.capture.output_path.parent() {
        if !parent.as_os_str().is_empty() {
            runtime.file_system.create_dir_all(parent)?;
        }
    }

    let prefetch = if cfg.download.enabled {
        progress(ctx, "prefetch", "started", route.canonical());
        Some(prefetch_window(ctx, cfg, start_seconds, route)?)
    } else {
        None
    };

    let settle = Duration::from_secs(cfg.timing.settle_seconds);
    let readiness: Box<dyn ReplayReadiness> = match &prefetch {
        Some(report) if !report.markers.is_empty() => Box::new(MarkerReadiness::new(
            Arc::clone(&runtime.clock),
            Arc::clone(&runtime.file_system),
            report.markers.clone(),
            Duration::from_millis(cfg.timing.ready_poll_millis),
            Duration::from_millis(cfg.timing.ready_min_settle_millis),
            settle,
        )),
        _ => Box::new(FixedSettle::new(Arc::clone(&runtime.clock), settle)),
    };

    let request = ClipRequest {
        start_seconds,
        route: route.clone(),
        data_dir: prefetch.as_ref().map(|_| cfg.download.data_dir.clone()),
    };
    let mut controller = TimingController::new(
        cfg,
        &request,
        ctx.sessions.as_ref(),
        runtime.process_runner.as_ref(),
        readiness.as_ref(),
        shutdown.token(),
    );
    while controller.state() != PipelineState::Done {
        match controller.step() {
            Ok(state) => progress(ctx, "pipeline", state.as_str(), ""),
            Err(err) => {
                controller.release_recorder();
                return Err(err);
            }
        }
    }
    Ok((controller.state(), prefetch))
}

fn prefetch_window(
    ctx: &ClipContext<'_>,
    cfg: &AppConfig,
    start_seconds: u64,
    route: &Route,
) -> Result<PrefetchReport, ClipperError> {
    let api = ctx.route_api.ok_or_else(|| {
        ClipperError::Download("prefetch is enabled but no route API is configured".to_string())
    })?;
    let kinds = cfg.file_kinds()?;
    let plan = PrefetchPlan {
        route,
        window: SegmentWindow::compute(
            start_seconds,
            cfg.replay.smear_seconds,
            cfg.capture.duration_seconds,
        ),
        kinds: &kinds,
        data_dir: &cfg.download.data_dir,
        max_connections: cfg.download.max_connections as usize,
        bzip2_program: &cfg.download.bzip2_program,
    };
    let report = prefetch_route(
        &plan,
        api,
        ctx.runtime.process_runner.as_ref(),
        ctx.runtime.file_system.as_ref(),
    )?;
    progress(
        ctx,
        "prefetch",
        "done",
        &format!(
            "segments={}..={} downloaded={}",
            report.window.first, report.window.last, report.downloaded
        ),
    );
    Ok(report)
}

fn progress(ctx: &ClipContext<'_>, component: &str, state: &str, message: &str) {
    let _ = ctx
        .runtime
        .terminal
        .write_line(&structured_fallback_line(component, state, message));
}
