pub mod commands;
pub mod config;
pub mod download;
pub mod errors;
pub mod interrupt;
pub mod log_retention;
pub mod logging;
pub mod orchestrator;
pub mod pipeline;
pub mod readiness;
pub mod runtime;
pub mod segments;
pub mod session;
pub mod shutdown;
pub mod sweeper;
pub mod timing;
pub mod types;

use clap::{error::ErrorKind, Parser};
use config::{load_config, AppConfig, CliOverrides};
use download::HttpRouteApi;
use errors::ClipperError;
use interrupt::InterruptHandler;
use logging::{init_run_log, structured_fallback_line};
use orchestrator::{run_clip, shutdown_for, sweep_only, ClipContext};
use runtime::ProductionRuntime;
use session::{SessionManager, TmuxSessionManager};
use std::sync::Arc;
use types::{Route, DEFAULT_ROUTE};

#[derive(Debug, Clone, Parser)]
#[command(name = "clipper")]
#[command(about = "Record a clip of a replayed route inside a managed tmux session")]
pub struct Cli {
    /// Offset into the route, in seconds, where the clip starts.
    #[arg(default_value_t = 60)]
    pub start_seconds: u64,
    /// Route as `<datasetId>|<timestamp>`.
    #[arg(default_value = DEFAULT_ROUTE)]
    pub route: String,
    #[arg(long)]
    pub config: Option<std::path::PathBuf>,
    #[arg(long)]
    pub session: Option<String>,
    #[arg(long)]
    pub output: Option<std::path::PathBuf>,
    /// Capture length in seconds.
    #[arg(long)]
    pub duration: Option<u64>,
    #[arg(long)]
    pub time_scale: Option<f64>,
    /// Download the route segments covering the clip before starting.
    #[arg(long, default_value_t = false)]
    pub prefetch: bool,
    #[arg(long)]
    pub data_dir: Option<std::path::PathBuf>,
    /// Kill everything left over from a previous run and exit.
    #[arg(long, default_value_t = false)]
    pub sweep_only: bool,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            config_path: self.config.clone(),
            session: self.session.clone(),
            output: self.output.clone(),
            duration_seconds: self.duration,
            time_scale: self.time_scale,
            prefetch: self.prefetch,
            data_dir: self.data_dir.clone(),
        }
    }
}

pub fn run() -> Result<i32, ClipperError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let runtime = ProductionRuntime::new();
    run_with_runtime(&args, &runtime)
}

pub fn run_with_runtime(
    args: &[std::ffi::OsString],
    runtime: &ProductionRuntime,
) -> Result<i32, ClipperError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(ClipperError::Cli(error.to_string())),
        },
    };

    let route = Route::parse(&cli.route)?;
    let cfg = load_config(&cli.overrides(), runtime.file_system.as_ref())?;
    start_run_log(runtime, &cfg);

    let sessions: Arc<dyn SessionManager> = Arc::new(TmuxSessionManager::new(
        Arc::clone(&runtime.process_runner),
        cfg.session.tmux_socket.clone(),
    ));

    if cli.sweep_only {
        let ctx = ClipContext {
            runtime,
            sessions,
            route_api: None,
        };
        sweep_only(&ctx, &cfg)?;
        return Ok(0);
    }

    let shutdown = Arc::new(shutdown_for(
        &cfg,
        Arc::clone(&sessions),
        Arc::clone(&runtime.process_table),
    ));
    interrupt::install(InterruptHandler::new(
        Arc::clone(&shutdown),
        Arc::clone(&runtime.process_table),
        Arc::clone(&runtime.terminal),
    ))?;

    let route_api = if cfg.download.enabled {
        Some(HttpRouteApi::new(cfg.download.api_base.clone())?)
    } else {
        None
    };
    let ctx = ClipContext {
        runtime,
        sessions,
        route_api: route_api.as_ref().map(|api| api as &dyn download::RouteApi),
    };
    run_clip(&ctx, &cfg, cli.start_seconds, &route, &shutdown)?;
    Ok(0)
}

fn start_run_log(runtime: &ProductionRuntime, cfg: &AppConfig) {
    match init_run_log(&cfg.logging.dir, cfg.logging.budget_bytes) {
        Ok(path) => {
            let _ = runtime.terminal.write_line(&structured_fallback_line(
                "logging",
                "ready",
                &path.display().to_string(),
            ));
        }
        Err(err) => {
            let _ = runtime.terminal.write_line(&structured_fallback_line(
                "logging",
                "disabled",
                &err.to_string(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;

    fn args(values: &[&str]) -> Vec<OsString> {
        values.iter().map(OsString::from).collect()
    }

    #[test]
    fn positional_defaults_match_the_demo_route() {
        let cli = Cli::try_parse_from(args(&["clipper"])).expect("parse");
        assert_eq!(cli.start_seconds, 60);
        assert_eq!(cli.route, DEFAULT_ROUTE);
        assert!(!cli.prefetch);
        assert!(!cli.sweep_only);
    }

    #[test]
    fn flags_become_overrides() {
        let cli = Cli::try_parse_from(args(&[
            "clipper",
            "120",
            "abc|2024-01-01--00-00-00",
            "--duration",
            "30",
            "--time-scale",
            "0.5",
            "--session",
            "clip2",
            "--prefetch",
        ]))
        .expect("parse");
        let overrides = cli.overrides();
        assert_eq!(cli.start_seconds, 120);
        assert_eq!(cli.route, "abc|2024-01-01--00-00-00");
        assert_eq!(overrides.duration_seconds, Some(30));
        assert_eq!(overrides.time_scale, Some(0.5));
        assert_eq!(overrides.session.as_deref(), Some("clip2"));
        assert!(overrides.prefetch);
    }

    #[test]
    fn non_numeric_offset_is_a_cli_error() {
        let runtime = ProductionRuntime::new();
        let err = run_with_runtime(&args(&["clipper", "soon"]), &runtime).expect_err("bad offset");
        assert!(matches!(err, ClipperError::Cli(_)));
    }

    #[test]
    fn help_exits_zero() {
        let runtime = ProductionRuntime::new();
        assert_eq!(
            run_with_runtime(&args(&["clipper", "--help"]), &runtime).expect("help"),
            0
        );
    }
}
