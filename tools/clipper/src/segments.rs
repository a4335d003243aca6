//! Segment-window arithmetic and download planning for route prefetch.
//!
//! Routes are stored as consecutive 60 second segments numbered from 0. A
//! clip starting at `start` seconds and lasting `length` seconds needs every
//! segment overlapping `[start - smear, start + length]`.

use crate::errors::ClipperError;
use crate::types::Route;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const SEGMENT_SECONDS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FileKind {
    Cameras,
    Ecameras,
    Dcameras,
    Logs,
}

impl FileKind {
    pub const ALL: [FileKind; 4] = [
        FileKind::Cameras,
        FileKind::Ecameras,
        FileKind::Dcameras,
        FileKind::Logs,
    ];

    pub fn parse(value: &str) -> Result<Self, ClipperError> {
        match value {
            "cameras" => Ok(Self::Cameras),
            "ecameras" => Ok(Self::Ecameras),
            "dcameras" => Ok(Self::Dcameras),
            "logs" => Ok(Self::Logs),
            other => Err(ClipperError::InvalidConfig(format!(
                "invalid file type `{other}`; valid file types are cameras, ecameras, dcameras, logs"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cameras => "cameras",
            Self::Ecameras => "ecameras",
            Self::Dcameras => "dcameras",
            Self::Logs => "logs",
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            Self::Cameras => "fcamera.hevc",
            Self::Ecameras => "ecamera.hevc",
            Self::Dcameras => "dcamera.hevc",
            Self::Logs => "rlog.bz2",
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Self::Cameras => "forward camera",
            Self::Ecameras => "wide camera",
            Self::Dcameras => "driver camera",
            Self::Logs => "log",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentWindow {
    pub first: u64,
    pub last: u64,
}

impl SegmentWindow {
    pub fn compute(start_seconds: u64, smear_seconds: u64, length_seconds: u64) -> Self {
        let actual_start = start_seconds.saturating_sub(smear_seconds);
        Self {
            first: actual_start / SEGMENT_SECONDS,
            last: start_seconds.saturating_add(length_seconds) / SEGMENT_SECONDS,
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = u64> {
        self.first..=self.last
    }
}

/// Signed URLs per file kind, as returned by `/v1/route/<route>/files`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FileList {
    #[serde(default)]
    pub cameras: Vec<String>,
    #[serde(default)]
    pub dcameras: Vec<String>,
    #[serde(default)]
    pub ecameras: Vec<String>,
    #[serde(default)]
    pub logs: Vec<String>,
}

impl FileList {
    fn urls(&self, kind: FileKind) -> &[String] {
        match kind {
            FileKind::Cameras => &self.cameras,
            FileKind::Ecameras => &self.ecameras,
            FileKind::Dcameras => &self.dcameras,
            FileKind::Logs => &self.logs,
        }
    }

    pub fn url_for(&self, kind: FileKind, segment: u64) -> Option<&str> {
        let needle = format!("/{segment}/{}", kind.file_name());
        self.urls(kind)
            .iter()
            .find(|url| url.contains(&needle))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RouteInfo {
    #[serde(default)]
    pub segment_start_times: Vec<i64>,
    #[serde(default)]
    pub segment_end_times: Vec<i64>,
}

impl RouteInfo {
    /// Viewer link covering the window, when the route info spans it.
    pub fn viewer_url(&self, route: &Route, window: SegmentWindow) -> Option<String> {
        let start = self.segment_start_times.get(window.first as usize)?;
        let end = self.segment_end_times.get(window.last as usize)?;
        Some(format!(
            "https://connect.comma.ai/{}/{start}/{end}",
            route.dataset_id()
        ))
    }
}

/// Fails on the first segment missing any requested kind.
pub fn validate_file_list(
    files: &FileList,
    window: SegmentWindow,
    kinds: &[FileKind],
    upload_hint: &str,
) -> Result<(), ClipperError> {
    for segment in window.ids() {
        for kind in FileKind::ALL {
            if !kinds.contains(&kind) {
                continue;
            }
            if files.url_for(kind, segment).is_none() {
                return Err(ClipperError::Download(format!(
                    "segment {segment} does not have a {} upload. {upload_hint}",
                    kind.describe()
                )));
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadItem {
    pub url: String,
    pub dest: PathBuf,
    pub kind: FileKind,
    pub segment: u64,
}

pub fn segment_dir(data_dir: &Path, route: &Route, segment: u64) -> PathBuf {
    data_dir.join(format!("{}--{segment}", route.route_date()))
}

/// Builds the download queue. Files already present are skipped; a log counts
/// as present when either its compressed or its decompressed form exists.
pub fn plan_downloads(
    files: &FileList,
    route: &Route,
    window: SegmentWindow,
    kinds: &[FileKind],
    data_dir: &Path,
    exists: impl Fn(&Path) -> bool,
) -> Vec<DownloadItem> {
    let mut items = Vec::new();
    for segment in window.ids() {
        let dir = segment_dir(data_dir, route, segment);
        for kind in FileKind::ALL {
            if !kinds.contains(&kind) {
                continue;
            }
            let Some(url) = files.url_for(kind, segment) else {
                continue;
            };
            let dest = dir.join(kind.file_name());
            let present = match kind {
                FileKind::Logs => exists(&dest) || exists(&dir.join("rlog")),
                _ => exists(&dest),
            };
            if present {
                continue;
            }
            items.push(DownloadItem {
                url: url.to_string(),
                dest,
                kind,
                segment,
            });
        }
    }
    items
}

/// Decompressed log per segment; their presence means the window is local.
pub fn log_markers(data_dir: &Path, route: &Route, window: SegmentWindow) -> Vec<PathBuf> {
    window
        .ids()
        .map(|segment| segment_dir(data_dir, route, segment).join("rlog"))
        .collect()
}
