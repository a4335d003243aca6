use crate::errors::ClipperError;
use crate::runtime::FileSystem;
use crate::segments::FileKind;
use crate::sweeper::StaleProcess;
use crate::types::Resolution;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub session: Option<String>,
    pub output: Option<PathBuf>,
    pub duration_seconds: Option<u64>,
    pub time_scale: Option<f64>,
    pub prefetch: bool,
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub session: SessionConfig,
    pub display: DisplayConfig,
    pub replay: ReplayConfig,
    pub ui: UiConfig,
    pub timing: TimingConfig,
    pub capture: CaptureConfig,
    pub sweep: SweepConfig,
    pub download: DownloadConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    pub name: String,
    pub tmux_socket: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DisplayConfig {
    pub program: String,
    pub index: u32,
    pub resolution: String,
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplayConfig {
    pub program: String,
    pub start_flag: String,
    pub data_dir_flag: String,
    pub extra_args: Vec<String>,
    pub pause_key: String,
    pub seek_prompt_key: Option<String>,
    pub confirm_key: String,
    pub smear_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UiConfig {
    pub program: String,
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimingConfig {
    pub settle_seconds: u64,
    pub ready_timeout_seconds: u64,
    pub ready_poll_millis: u64,
    /// Extra wait after every readiness marker exists.
    pub ready_min_settle_millis: u64,
    pub time_scale: f64,
    pub faketime_program: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CaptureConfig {
    pub program: String,
    pub duration_seconds: u64,
    pub capture_framerate: u32,
    pub encode_framerate: u32,
    pub codec: String,
    pub output_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SweepConfig {
    /// Also kill display servers and recorders a crashed run left outside any session.
    pub orphans: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadConfig {
    pub enabled: bool,
    pub data_dir: PathBuf,
    pub file_types: Vec<String>,
    pub api_base: String,
    pub max_connections: u32,
    pub bzip2_program: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub dir: PathBuf,
    pub budget_bytes: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig {
                name: "clipper".to_string(),
                tmux_socket: None,
            },
            display: DisplayConfig {
                program: "Xtigervnc".to_string(),
                index: 0,
                resolution: "2160x1080".to_string(),
                extra_args: vec!["-SecurityTypes".to_string(), "None".to_string()],
            },
            replay: ReplayConfig {
                program: "./tools/replay/replay".to_string(),
                start_flag: "--start".to_string(),
                data_dir_flag: "--data_dir".to_string(),
                extra_args: vec!["--ecam".to_string()],
                pause_key: "Space".to_string(),
                seek_prompt_key: Some("Enter".to_string()),
                confirm_key: "Enter".to_string(),
                smear_seconds: 0,
            },
            ui: UiConfig {
                program: "./selfdrive/ui/ui".to_string(),
                extra_args: Vec::new(),
            },
            timing: TimingConfig {
                settle_seconds: 5,
                ready_timeout_seconds: 120,
                ready_poll_millis: 500,
                ready_min_settle_millis: 1000,
                time_scale: 1.0,
                faketime_program: "faketime".to_string(),
            },
            capture: CaptureConfig {
                program: "ffmpeg".to_string(),
                duration_seconds: 60,
                capture_framerate: 20,
                encode_framerate: 20,
                codec: "libx264".to_string(),
                output_path: PathBuf::from("./shared/clip.mp4"),
            },
            sweep: SweepConfig {
                orphans: true,
            },
            download: DownloadConfig {
                enabled: false,
                data_dir: PathBuf::from("./shared/data_dir"),
                file_types: vec![
                    "cameras".to_string(),
                    "ecameras".to_string(),
                    "logs".to_string(),
                ],
                api_base: "https://api.commadotai.com".to_string(),
                max_connections: 20,
                bzip2_program: "bzip2".to_string(),
            },
            logging: LoggingConfig {
                dir: PathBuf::from(".cache/clipper/logs"),
                budget_bytes: crate::logging::DEFAULT_DISK_BUDGET_BYTES,
            },
        }
    }
}

impl AppConfig {
    pub fn resolution(&self) -> Result<Resolution, ClipperError> {
        Resolution::parse(&self.display.resolution)
    }

    /// Orphaned collaborators of an earlier run with this config: the display
    /// server on our display index and the recorder writing our output file.
    pub fn stale_processes(&self) -> Vec<StaleProcess> {
        if !self.sweep.orphans {
            return Vec::new();
        }
        vec![
            StaleProcess::new(&self.display.program, format!(":{}", self.display.index)),
            StaleProcess::new(
                &self.capture.program,
                self.capture.output_path.display().to_string(),
            ),
        ]
    }

    pub fn file_kinds(&self) -> Result<Vec<FileKind>, ClipperError> {
        self.download
            .file_types
            .iter()
            .map(|name| FileKind::parse(name))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialAppConfig {
    session: Option<PartialSessionConfig>,
    display: Option<PartialDisplayConfig>,
    replay: Option<PartialReplayConfig>,
    ui: Option<PartialUiConfig>,
    timing: Option<PartialTimingConfig>,
    capture: Option<PartialCaptureConfig>,
    sweep: Option<PartialSweepConfig>,
    download: Option<PartialDownloadConfig>,
    logging: Option<PartialLoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialSessionConfig {
    name: Option<String>,
    tmux_socket: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialDisplayConfig {
    program: Option<String>,
    index: Option<u32>,
    resolution: Option<String>,
    extra_args: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialReplayConfig {
    program: Option<String>,
    start_flag: Option<String>,
    data_dir_flag: Option<String>,
    extra_args: Option<Vec<String>>,
    pause_key: Option<String>,
    seek_prompt_key: Option<String>,
    confirm_key: Option<String>,
    smear_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialUiConfig {
    program: Option<String>,
    extra_args: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialTimingConfig {
    settle_seconds: Option<u64>,
    ready_timeout_seconds: Option<u64>,
    ready_poll_millis: Option<u64>,
    ready_min_settle_millis: Option<u64>,
    time_scale: Option<f64>,
    faketime_program: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialCaptureConfig {
    program: Option<String>,
    duration_seconds: Option<u64>,
    capture_framerate: Option<u32>,
    encode_framerate: Option<u32>,
    codec: Option<String>,
    output_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialSweepConfig {
    orphans: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialDownloadConfig {
    enabled: Option<bool>,
    data_dir: Option<PathBuf>,
    file_types: Option<Vec<String>>,
    api_base: Option<String>,
    max_connections: Option<u32>,
    bzip2_program: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLoggingConfig {
    dir: Option<PathBuf>,
    budget_bytes: Option<u64>,
}

pub fn load_config(
    overrides: &CliOverrides,
    fs: &dyn FileSystem,
) -> Result<AppConfig, ClipperError> {
    let mut cfg = AppConfig::default();

    if let Some(path) = &overrides.config_path {
        let file_contents = fs.read_to_string(path)?;
        let partial: PartialAppConfig = toml::from_str(&file_contents)
            .map_err(|e| ClipperError::ConfigParse(e.to_string()))?;
        merge_partial_config(&mut cfg, partial);
    }

    apply_cli_overrides(&mut cfg, overrides);
    validate_config(&cfg)?;
    Ok(cfg)
}

fn merge_partial_config(cfg: &mut AppConfig, partial: PartialAppConfig) {
    if let Some(session) = partial.session {
        if let Some(name) = session.name {
            cfg.session.name = name;
        }
        if let Some(socket) = session.tmux_socket {
            cfg.session.tmux_socket = Some(socket);
        }
    }

    if let Some(display) = partial.display {
        if let Some(program) = display.program {
            cfg.display.program = program;
        }
        if let Some(index) = display.index {
            cfg.display.index = index;
        }
        if let Some(resolution) = display.resolution {
            cfg.display.resolution = resolution;
        }
        if let Some(extra_args) = display.extra_args {
            cfg.display.extra_args = extra_args;
        }
    }

    if let Some(replay) = partial.replay {
        if let Some(program) = replay.program {
            cfg.replay.program = program;
        }
        if let Some(start_flag) = replay.start_flag {
            cfg.replay.start_flag = start_flag;
        }
        if let Some(data_dir_flag) = replay.data_dir_flag {
            cfg.replay.data_dir_flag = data_dir_flag;
        }
        if let Some(extra_args) = replay.extra_args {
            cfg.replay.extra_args = extra_args;
        }
        if let Some(pause_key) = replay.pause_key {
            cfg.replay.pause_key = pause_key;
        }
        if let Some(seek_prompt_key) = replay.seek_prompt_key {
            // An empty string disables the prompt key entirely.
            cfg.replay.seek_prompt_key = (!seek_prompt_key.is_empty()).then_some(seek_prompt_key);
        }
        if let Some(confirm_key) = replay.confirm_key {
            cfg.replay.confirm_key = confirm_key;
        }
        if let Some(smear_seconds) = replay.smear_seconds {
            cfg.replay.smear_seconds = smear_seconds;
        }
    }

    if let Some(ui) = partial.ui {
        if let Some(program) = ui.program {
            cfg.ui.program = program;
        }
        if let Some(extra_args) = ui.extra_args {
            cfg.ui.extra_args = extra_args;
        }
    }

    if let Some(timing) = partial.timing {
        if let Some(settle_seconds) = timing.settle_seconds {
            cfg.timing.settle_seconds = settle_seconds;
        }
        if let Some(ready_timeout_seconds) = timing.ready_timeout_seconds {
            cfg.timing.ready_timeout_seconds = ready_timeout_seconds;
        }
        if let Some(ready_poll_millis) = timing.ready_poll_millis {
            cfg.timing.ready_poll_millis = ready_poll_millis;
        }
        if let Some(ready_min_settle_millis) = timing.ready_min_settle_millis {
            cfg.timing.ready_min_settle_millis = ready_min_settle_millis;
        }
        if let Some(time_scale) = timing.time_scale {
            cfg.timing.time_scale = time_scale;
        }
        if let Some(faketime_program) = timing.faketime_program {
            cfg.timing.faketime_program = faketime_program;
        }
    }

    if let Some(capture) = partial.capture {
        if let Some(program) = capture.program {
            cfg.capture.program = program;
        }
        if let Some(duration_seconds) = capture.duration_seconds {
            cfg.capture.duration_seconds = duration_seconds;
        }
        if let Some(capture_framerate) = capture.capture_framerate {
            cfg.capture.capture_framerate = capture_framerate;
        }
        if let Some(encode_framerate) = capture.encode_framerate {
            cfg.capture.encode_framerate = encode_framerate;
        }
        if let Some(codec) = capture.codec {
            cfg.capture.codec = codec;
        }
        if let Some(output_path) = capture.output_path {
            cfg.capture.output_path = output_path;
        }
    }

    if let Some(sweep) = partial.sweep {
        if let Some(orphans) = sweep.orphans {
            cfg.sweep.orphans = orphans;
        }
    }

    if let Some(download) = partial.download {
        if let Some(enabled) = download.enabled {
            cfg.download.enabled = enabled;
        }
        if let Some(data_dir) = download.data_dir {
            cfg.download.data_dir = data_dir;
        }
        if let Some(file_types) = download.file_types {
            cfg.download.file_types = file_types;
        }
        if let Some(api_base) = download.api_base {
            cfg.download.api_base = api_base;
        }
        if let Some(max_connections) = download.max_connections {
            cfg.download.max_connections = max_connections;
        }
        if let Some(bzip2_program) = download.bzip2_program {
            cfg.download.bzip2_program = bzip2_program;
        }
    }

    if let Some(logging) = partial.logging {
        if let Some(dir) = logging.dir {
            cfg.logging.dir = dir;
        }
        if let Some(budget_bytes) = logging.budget_bytes {
            cfg.logging.budget_bytes = budget_bytes;
        }
    }
}

fn apply_cli_overrides(cfg: &mut AppConfig, overrides: &CliOverrides) {
    if let Some(session) = &overrides.session {
        cfg.session.name = session.clone();
    }
    if let Some(output) = &overrides.output {
        cfg.capture.output_path = output.clone();
    }
    if let Some(duration) = overrides.duration_seconds {
        cfg.capture.duration_seconds = duration;
    }
    if let Some(time_scale) = overrides.time_scale {
        cfg.timing.time_scale = time_scale;
    }
    if overrides.prefetch {
        cfg.download.enabled = true;
    }
    if let Some(data_dir) = &overrides.data_dir {
        cfg.download.data_dir = data_dir.clone();
    }
}

pub fn validate_config(cfg: &AppConfig) -> Result<(), ClipperError> {
    let name = cfg.session.name.trim();
    if name.is_empty() {
        return Err(ClipperError::InvalidConfig(
            "session.name must not be empty".to_string(),
        ));
    }
    // tmux reserves these characters in target names.
    if name.contains(|c: char| c == ':' || c == '.') {
        return Err(ClipperError::InvalidConfig(format!(
            "session.name `{name}` must not contain ':' or '.'"
        )));
    }
    cfg.resolution()?;
    if !cfg.timing.time_scale.is_finite() || cfg.timing.time_scale <= 0.0 {
        return Err(ClipperError::InvalidConfig(format!(
            "timing.time_scale must be a positive number, got {}",
            cfg.timing.time_scale
        )));
    }
    if cfg.timing.ready_poll_millis == 0 {
        return Err(ClipperError::InvalidConfig(
            "timing.ready_poll_millis must be >= 1".to_string(),
        ));
    }
    if cfg.capture.duration_seconds == 0 {
        return Err(ClipperError::InvalidConfig(
            "capture.duration_seconds must be >= 1".to_string(),
        ));
    }
    if cfg.capture.capture_framerate == 0 || cfg.capture.encode_framerate == 0 {
        return Err(ClipperError::InvalidConfig(
            "capture frame rates must be >= 1".to_string(),
        ));
    }
    for (field, program) in [
        ("display.program", &cfg.display.program),
        ("replay.program", &cfg.replay.program),
        ("ui.program", &cfg.ui.program),
        ("capture.program", &cfg.capture.program),
    ] {
        if program.trim().is_empty() {
            return Err(ClipperError::InvalidConfig(format!(
                "{field} must not be empty"
            )));
        }
    }
    cfg.file_kinds()?;
    if cfg.download.max_connections == 0 {
        return Err(ClipperError::InvalidConfig(
            "download.max_connections must be >= 1".to_string(),
        ));
    }
    Ok(())
}
