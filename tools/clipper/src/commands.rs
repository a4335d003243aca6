//! Command lines for the pipeline collaborators.
//!
//! Pane commands are shell strings because the multiplexer hands them to
//! `sh -c`. The recorder runs as our own child, so it gets a plain
//! `ProcessRequest` with no shell in between.

use crate::config::AppConfig;
use crate::errors::ClipperError;
use crate::runtime::ProcessRequest;
use crate::session::Keystroke;
use crate::types::Route;
use std::path::Path;

pub const DISPLAY_PANE: &str = "display";
pub const REPLAY_PANE: &str = "replay";
pub const UI_PANE: &str = "ui";

pub fn display_command(cfg: &AppConfig) -> Result<String, ClipperError> {
    let resolution = cfg.resolution()?;
    let mut words = vec![
        cfg.display.program.clone(),
        format!(":{}", cfg.display.index),
        "-geometry".to_string(),
        resolution.to_string(),
    ];
    words.extend(cfg.display.extra_args.iter().cloned());
    Ok(join_shell(&words))
}

/// Replay player started `smear_seconds` ahead of the offset, under the
/// time-scale wrapper.
pub fn replay_command(
    cfg: &AppConfig,
    route: &Route,
    start_seconds: u64,
    data_dir: Option<&Path>,
) -> String {
    let mut words = vec![
        cfg.replay.program.clone(),
        cfg.replay.start_flag.clone(),
        start_seconds
            .saturating_sub(cfg.replay.smear_seconds)
            .to_string(),
    ];
    if let Some(dir) = data_dir {
        words.push(cfg.replay.data_dir_flag.clone());
        words.push(dir.display().to_string());
    }
    words.extend(cfg.replay.extra_args.iter().cloned());
    words.push(route.as_str().to_string());
    scaled(cfg, &words)
}

pub fn ui_command(cfg: &AppConfig) -> String {
    let mut words = vec![cfg.ui.program.clone()];
    words.extend(cfg.ui.extra_args.iter().cloned());
    scaled(cfg, &words)
}

fn scaled(cfg: &AppConfig, words: &[String]) -> String {
    let mut wrapped = vec![
        format!("DISPLAY=:{}", cfg.display.index),
        cfg.timing.faketime_program.clone(),
        "-m".to_string(),
        "-f".to_string(),
        format!("+0 x{}", cfg.timing.time_scale),
    ];
    wrapped.extend(words.iter().cloned());
    join_shell(&wrapped)
}

pub fn recorder_request(cfg: &AppConfig) -> Result<ProcessRequest, ClipperError> {
    let resolution = cfg.resolution()?;
    let capture = &cfg.capture;
    Ok(ProcessRequest::new(
        capture.program.clone(),
        [
            "-y".to_string(),
            "-framerate".to_string(),
            capture.capture_framerate.to_string(),
            "-video_size".to_string(),
            resolution.to_string(),
            "-f".to_string(),
            "x11grab".to_string(),
            "-draw_mouse".to_string(),
            "0".to_string(),
            "-i".to_string(),
            format!(":{}.0", cfg.display.index),
            "-t".to_string(),
            capture.duration_seconds.to_string(),
            "-vf".to_string(),
            format!("setpts={}*PTS", cfg.timing.time_scale),
            "-r".to_string(),
            capture.encode_framerate.to_string(),
            "-c:v".to_string(),
            capture.codec.clone(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            capture.output_path.display().to_string(),
        ],
    ))
}

pub fn pause_keys(cfg: &AppConfig) -> Vec<Keystroke> {
    vec![Keystroke::key(cfg.replay.pause_key.clone())]
}

/// Opens the seek prompt, types the offset and confirms.
pub fn seek_keys(cfg: &AppConfig, offset_seconds: u64) -> Vec<Keystroke> {
    let mut keys = Vec::with_capacity(3);
    if let Some(prompt) = &cfg.replay.seek_prompt_key {
        keys.push(Keystroke::key(prompt.clone()));
    }
    keys.push(Keystroke::literal(offset_seconds.to_string()));
    keys.push(Keystroke::key(cfg.replay.confirm_key.clone()));
    keys
}

fn join_shell(words: &[String]) -> String {
    words
        .iter()
        .map(|word| shell_quote(word))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '=' | '+' | ',' | '@' | '%')
        });
    if safe {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}
