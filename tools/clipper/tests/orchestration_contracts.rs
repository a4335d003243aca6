use clipper::config::AppConfig;
use clipper::download::FakeRouteApi;
use clipper::errors::ClipperError;
use clipper::interrupt::InterruptHandler;
use clipper::orchestrator::{run_clip, shutdown_for, sweep_only, ClipContext};
use clipper::readiness::FixedSettle;
use clipper::runtime::{
    Clock, FakeClock, FakeFileSystem, FakeProcessRunner, FakeProcessTable, FakeTerminal,
    FileSystem, ProductionRuntime,
};
use clipper::segments::FileList;
use clipper::session::{FakeSessionManager, Keystroke, SessionManager};
use clipper::shutdown::Shutdown;
use clipper::timing::{ClipRequest, TimingController};
use clipper::types::{PipelineState, Route, DEFAULT_ROUTE};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

const OWN_PID: u32 = 4000;

struct Rig {
    table: FakeProcessTable,
    sessions: FakeSessionManager,
    runner: FakeProcessRunner,
    clock: FakeClock,
    fs: FakeFileSystem,
    runtime: ProductionRuntime,
}

impl Rig {
    fn new() -> Self {
        let table = FakeProcessTable::new(OWN_PID, OWN_PID);
        let sessions = FakeSessionManager::new(table.clone());
        let runner = FakeProcessRunner::with_process_table(table.clone());
        let clock = FakeClock::default();
        let fs = FakeFileSystem::default();
        let runtime = ProductionRuntime {
            clock: Arc::new(clock.clone()),
            file_system: Arc::new(fs.clone()),
            process_runner: Arc::new(runner.clone()),
            process_table: Arc::new(table.clone()),
            terminal: Arc::new(FakeTerminal::default()),
        };
        Self {
            table,
            sessions,
            runner,
            clock,
            fs,
            runtime,
        }
    }

    fn ctx<'a>(&'a self, route_api: Option<&'a FakeRouteApi>) -> ClipContext<'a> {
        ClipContext {
            runtime: &self.runtime,
            sessions: Arc::new(self.sessions.clone()),
            route_api: route_api.map(|api| api as &dyn clipper::download::RouteApi),
        }
    }

    fn shutdown(&self, cfg: &AppConfig) -> Shutdown {
        shutdown_for(
            cfg,
            Arc::new(self.sessions.clone()),
            Arc::new(self.table.clone()),
        )
    }

    fn run(&self, cfg: &AppConfig, start_seconds: u64) -> Result<clipper::orchestrator::ClipOutcome, ClipperError> {
        let shutdown = self.shutdown(cfg);
        run_clip(&self.ctx(None), cfg, start_seconds, &route(), &shutdown)
    }

    /// Nothing but init, the orchestrator itself and the fake tmux server.
    fn assert_nothing_left(&self) {
        assert!(
            self.sessions.live_pipeline_pids().is_empty(),
            "pipeline survivors: {:?}",
            self.sessions.live_pipeline_pids()
        );
        assert!(self.sessions.session_names().is_empty());
        for pid in self.sessions.spawned_pane_pids() {
            assert!(!self.table.is_alive(pid), "pane process {pid} survived");
        }
        for pid in self.table.live_pids() {
            if pid == FakeProcessTable::INIT_PID || pid == OWN_PID {
                continue;
            }
            let orphaned_in_group = self
                .runner
                .spawned()
                .iter()
                .enumerate()
                .any(|(handle, _)| self.runner.pid_of(handle as u64) == Some(pid));
            assert!(!orphaned_in_group, "child {pid} of the orchestrator survived");
        }
    }
}

fn route() -> Route {
    Route::parse(DEFAULT_ROUTE).expect("route")
}

fn cfg() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.capture.output_path = PathBuf::from("/out/clip.mp4");
    cfg
}

#[test]
fn full_run_records_once_and_leaves_nothing_running() {
    let rig = Rig::new();
    rig.runner.push_success("");

    let outcome = rig.run(&cfg(), 60).expect("run");

    assert_eq!(outcome.final_state, PipelineState::Done);
    assert_eq!(outcome.output, PathBuf::from("/out/clip.mp4"));
    assert!(outcome.leading_sweep.is_noop());
    assert!(outcome.final_sweep.as_ref().is_some_and(|r| !r.is_noop()));

    let spawned = rig.runner.spawned();
    assert_eq!(spawned.len(), 1);
    assert_eq!(spawned[0].program, "ffmpeg");
    let args = spawned[0].args.join(" ");
    assert!(args.contains("-i :0.0 -t 60 -vf setpts=1*PTS"));
    assert!(args.ends_with("/out/clip.mp4"));
    assert_eq!(rig.fs.created_dirs(), vec![PathBuf::from("/out")]);
    assert_eq!(
        rig.clock.now(),
        SystemTime::UNIX_EPOCH + Duration::from_secs(5),
        "one settle interval before seeking"
    );
    rig.assert_nothing_left();
}

#[test]
fn capture_duration_comes_from_config() {
    let rig = Rig::new();
    rig.runner.push_success("");
    let mut cfg = cfg();
    cfg.capture.duration_seconds = 15;
    rig.run(&cfg, 60).expect("run");
    assert!(rig.runner.spawned()[0].args.join(" ").contains("-t 15 "));
}

#[test]
fn sweep_twice_is_a_noop_the_second_time() {
    let rig = Rig::new();
    let mut session = rig
        .sessions
        .create_session("clipper", "display", "Xtigervnc :0")
        .expect("session");
    rig.sessions
        .add_pane(&mut session, "replay", "replay --start 60")
        .expect("pane");
    let ctx = rig.ctx(None);

    let first = sweep_only(&ctx, &cfg()).expect("first sweep");
    assert!(!first.is_noop());
    let second = sweep_only(&ctx, &cfg()).expect("second sweep");
    assert!(second.is_noop());
    rig.assert_nothing_left();
}

#[test]
fn run_after_a_crashed_run_does_not_hit_session_exists() {
    let rig = Rig::new();
    let mut stale = rig
        .sessions
        .create_session("clipper", "display", "Xtigervnc :0")
        .expect("stale session");
    rig.sessions
        .add_pane(&mut stale, "ui", "ui")
        .expect("stale pane");
    let stale_pids = rig.sessions.live_pipeline_pids();
    rig.runner.push_success("");

    let outcome = rig.run(&cfg(), 60).expect("run");

    assert!(outcome.leading_sweep.session_existed);
    for pid in stale_pids {
        assert!(outcome.leading_sweep.killed.contains(&pid));
    }
    rig.assert_nothing_left();
}

#[test]
fn interrupt_at_every_state_leaves_zero_pipeline_processes() {
    for steps in 0..=5 {
        let rig = Rig::new();
        let cfg = cfg();
        let shutdown = Arc::new(rig.shutdown(&cfg));
        let request = ClipRequest {
            start_seconds: 60,
            route: route(),
            data_dir: None,
        };
        let readiness = FixedSettle::new(Arc::new(rig.clock.clone()), Duration::from_secs(5));
        let mut controller = TimingController::new(
            &cfg,
            &request,
            &rig.sessions,
            &rig.runner,
            &readiness,
            shutdown.token(),
        );
        for _ in 0..steps {
            controller.step().expect("step");
        }

        let handler = InterruptHandler::new(
            Arc::clone(&shutdown),
            Arc::new(rig.table.clone()),
            Arc::new(FakeTerminal::default()),
        );
        assert_eq!(handler.handle("SIGINT"), 0, "after {steps} steps");

        rig.assert_nothing_left();
        if steps == 5 {
            let recorder = rig.runner.pid_of(0).expect("recorder pid");
            assert!(!rig.table.is_alive(recorder));
        }
        assert!(
            matches!(controller.step(), Err(ClipperError::Interrupted)),
            "controller must stop after {steps} steps"
        );
    }
}

#[test]
fn seek_types_the_offset_then_confirms() {
    for offset in [120_u64, 0] {
        let rig = Rig::new();
        rig.runner.push_success("");
        rig.run(&cfg(), offset).expect("run");

        let seek = rig
            .sessions
            .inputs()
            .into_iter()
            .find(|input| input.keys.contains(&Keystroke::literal(offset.to_string())))
            .expect("seek input");
        assert_eq!(seek.label, "replay");
        assert_eq!(
            seek.keys.last(),
            Some(&Keystroke::key("Enter")),
            "offset {offset} must be confirmed"
        );
    }
}

#[test]
fn back_to_back_runs_both_succeed() {
    let rig = Rig::new();
    rig.runner.push_success("");
    rig.run(&cfg(), 60).expect("first run");

    let leaked = rig.table.spawn(
        FakeProcessTable::INIT_PID,
        None,
        "Xtigervnc :0 -geometry 2160x1080",
    );
    rig.runner.push_success("");
    let second = rig.run(&cfg(), 90).expect("second run");

    assert_eq!(second.leading_sweep.killed, vec![leaked]);
    assert_eq!(rig.runner.spawned().len(), 2);
    rig.assert_nothing_left();
}

#[test]
fn pane_spawn_failure_tears_the_pipeline_down() {
    let rig = Rig::new();
    rig.sessions.fail_pane("ui");

    let err = rig.run(&cfg(), 60).expect_err("spawn failure");

    assert!(matches!(err, ClipperError::SpawnFailure { target, .. } if target == "ui"));
    assert!(rig.runner.spawned().is_empty());
    rig.assert_nothing_left();
}

#[test]
fn missing_recorder_binary_tears_the_pipeline_down() {
    let rig = Rig::new();
    rig.runner.fail_spawn_of("ffmpeg");

    let err = rig.run(&cfg(), 60).expect_err("recorder missing");

    assert!(matches!(err, ClipperError::SpawnFailure { target, .. } if target == "ffmpeg"));
    rig.assert_nothing_left();
}

#[test]
fn prefetched_logs_replace_the_settle_wait() {
    let rig = Rig::new();
    let mut cfg = cfg();
    cfg.download.enabled = true;
    cfg.download.data_dir = PathBuf::from("/data");
    for segment in [1, 2] {
        rig.fs
            .write_string(
                Path::new(&format!("/data/2023-07-27--13-01-19--{segment}/rlog")),
                "",
            )
            .expect("seed log");
    }
    let url = |segment: u64, name: &str| {
        format!("https://blob.example/a2a0ccea32023010/2023-07-27--13-01-19/{segment}/{name}")
    };
    let api = FakeRouteApi::new(
        Some(FileList {
            cameras: vec![url(1, "fcamera.hevc"), url(2, "fcamera.hevc")],
            ecameras: vec![url(1, "ecamera.hevc"), url(2, "ecamera.hevc")],
            dcameras: Vec::new(),
            logs: vec![url(1, "rlog.bz2"), url(2, "rlog.bz2")],
        }),
        None,
        rig.fs.clone(),
    );
    rig.runner.push_success("");
    let shutdown = rig.shutdown(&cfg);

    let outcome = run_clip(&rig.ctx(Some(&api)), &cfg, 60, &route(), &shutdown).expect("run");

    let prefetch = outcome.prefetch.expect("prefetch report");
    assert_eq!((prefetch.window.first, prefetch.window.last), (1, 2));
    assert_eq!(prefetch.downloaded, 4);
    assert!(prefetch.decompressed.is_empty());
    assert_eq!(
        rig.clock.now(),
        SystemTime::UNIX_EPOCH + Duration::from_secs(1),
        "markers cut the wait down to the minimum settle"
    );
    rig.assert_nothing_left();
}

#[test]
fn unavailable_segments_fail_before_anything_starts() {
    let rig = Rig::new();
    let mut cfg = cfg();
    cfg.download.enabled = true;
    let api = FakeRouteApi::new(Some(FileList::default()), None, rig.fs.clone());
    let shutdown = rig.shutdown(&cfg);

    let err = run_clip(&rig.ctx(Some(&api)), &cfg, 60, &route(), &shutdown)
        .expect_err("missing uploads");

    assert!(matches!(err, ClipperError::Download(message) if message.contains("segment 1")));
    assert!(rig.sessions.inputs().is_empty());
    rig.assert_nothing_left();
}
