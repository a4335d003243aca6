use crate::errors::ClipperError;
use crate::logging::append_run_log;
use crate::runtime::{FakeFileSystem, FileSystem, ProcessRequest, ProcessRunner};
use crate::segments::{
    log_markers, plan_downloads, segment_dir, validate_file_list, DownloadItem, FileKind,
    FileList, RouteInfo, SegmentWindow,
};
use crate::types::Route;
use serde_json::json;
use std::collections::VecDeque;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Remote side of route prefetch.
pub trait RouteApi: Send + Sync {
    fn route_files(&self, route: &Route) -> Result<FileList, ClipperError>;
    fn route_info(&self, route: &Route) -> Result<RouteInfo, ClipperError>;
    fn download(&self, url: &str, dest: &Path) -> Result<(), ClipperError>;
}

pub struct HttpRouteApi {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl HttpRouteApi {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClipperError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("clipper/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ClipperError::Download(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn route_url(&self, route: &Route) -> String {
        format!("{}/v1/route/{}", self.base_url, route.url_encoded())
    }

    fn get(&self, url: &str) -> Result<reqwest::blocking::Response, ClipperError> {
        self.client
            .get(url)
            .send()
            .map_err(|e| ClipperError::Download(format!("GET {url}: {e}")))
    }
}

impl RouteApi for HttpRouteApi {
    fn route_files(&self, route: &Route) -> Result<FileList, ClipperError> {
        let url = format!("{}/files", self.route_url(route));
        append_run_log("info", "prefetch.files.requested", json!({ "url": url }));
        let response = self.get(&url)?;
        if response.status().as_u16() != 200 {
            return Err(ClipperError::Download(format!(
                "route {} is not accessible ({}). Open https://connect.comma.ai/{}, view the route, \
                 open \"More Info\" and toggle \"Public\"; it can be switched back off afterwards",
                route.canonical(),
                response.status(),
                route.dataset_id()
            )));
        }
        response
            .json::<FileList>()
            .map_err(|e| ClipperError::Download(format!("file list for {}: {e}", route.canonical())))
    }

    fn route_info(&self, route: &Route) -> Result<RouteInfo, ClipperError> {
        let url = self.route_url(route);
        let response = self.get(&url)?;
        if !response.status().is_success() {
            return Err(ClipperError::Download(format!(
                "route info for {} returned {}",
                route.canonical(),
                response.status()
            )));
        }
        response
            .json::<RouteInfo>()
            .map_err(|e| ClipperError::Download(format!("route info for {}: {e}", route.canonical())))
    }

    fn download(&self, url: &str, dest: &Path) -> Result<(), ClipperError> {
        let mut response = self.get(url)?;
        if !response.status().is_success() {
            return Err(ClipperError::Download(format!(
                "{} returned {}",
                dest.display(),
                response.status()
            )));
        }
        let partial = partial_path(dest);
        let mut file = File::create(&partial).map_err(|e| ClipperError::Io(e.to_string()))?;
        response
            .copy_to(&mut file)
            .map_err(|e| ClipperError::Download(format!("{}: {e}", dest.display())))?;
        std::fs::rename(&partial, dest).map_err(|e| ClipperError::Io(e.to_string()))
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    dest.with_file_name(format!("{name}.part"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefetchPlan<'a> {
    pub route: &'a Route,
    pub window: SegmentWindow,
    pub kinds: &'a [FileKind],
    pub data_dir: &'a Path,
    pub max_connections: usize,
    pub bzip2_program: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefetchReport {
    pub window: SegmentWindow,
    pub downloaded: usize,
    pub decompressed: Vec<u64>,
    pub viewer_url: Option<String>,
    /// Decompressed logs the replay player reads; empty when logs were not fetched.
    pub markers: Vec<PathBuf>,
}

/// Makes every requested file for the window available locally.
pub fn prefetch_route(
    plan: &PrefetchPlan<'_>,
    api: &dyn RouteApi,
    runner: &dyn ProcessRunner,
    fs: &dyn FileSystem,
) -> Result<PrefetchReport, ClipperError> {
    let files = api.route_files(plan.route)?;
    let viewer_url = match api.route_info(plan.route) {
        Ok(info) => info.viewer_url(plan.route, plan.window),
        Err(err) => {
            append_run_log(
                "warn",
                "prefetch.route_info.failed",
                json!({ "error": err.to_string() }),
            );
            None
        }
    };
    let hint = match &viewer_url {
        Some(url) => format!(
            "Visit {url}, open \"Files\" and choose \"Upload All Files\", then try again once uploads finish"
        ),
        None => "Upload all files for the route from the viewer, then try again".to_string(),
    };
    validate_file_list(&files, plan.window, plan.kinds, &hint)?;
    append_run_log(
        "info",
        "prefetch.window",
        json!({
            "route": plan.route.canonical(),
            "first_segment": plan.window.first,
            "last_segment": plan.window.last,
            "viewer_url": viewer_url
        }),
    );

    let items = plan_downloads(
        &files,
        plan.route,
        plan.window,
        plan.kinds,
        plan.data_dir,
        |path| fs.exists(path),
    );
    for segment in plan.window.ids() {
        fs.create_dir_all(&segment_dir(plan.data_dir, plan.route, segment))?;
    }
    let downloaded = items.len();
    download_all(api, items, plan.max_connections)?;

    let mut decompressed = Vec::new();
    let mut markers = Vec::new();
    if plan.kinds.contains(&FileKind::Logs) {
        for segment in plan.window.ids() {
            let dir = segment_dir(plan.data_dir, plan.route, segment);
            if fs.exists(&dir.join("rlog")) {
                continue;
            }
            let compressed = dir.join(FileKind::Logs.file_name());
            if !fs.exists(&compressed) {
                return Err(ClipperError::Download(format!(
                    "segment {segment} does not have a log upload"
                )));
            }
            let out = runner.run(ProcessRequest::new(
                plan.bzip2_program,
                ["-d".to_string(), compressed.display().to_string()],
            ))?;
            if out.exit_code != 0 {
                return Err(ClipperError::Download(format!(
                    "{} -d {} failed: {}",
                    plan.bzip2_program,
                    compressed.display(),
                    out.stderr.trim()
                )));
            }
            decompressed.push(segment);
        }
        markers = log_markers(plan.data_dir, plan.route, plan.window);
    }

    append_run_log(
        "info",
        "prefetch.completed",
        json!({
            "downloaded": downloaded,
            "decompressed": decompressed
        }),
    );
    Ok(PrefetchReport {
        window: plan.window,
        downloaded,
        decompressed,
        viewer_url,
        markers,
    })
}

/// Runs downloads on up to `max_connections` scoped threads and reports every
/// failure at once.
fn download_all(
    api: &dyn RouteApi,
    items: Vec<DownloadItem>,
    max_connections: usize,
) -> Result<(), ClipperError> {
    if items.is_empty() {
        return Ok(());
    }
    let workers = max_connections.clamp(1, items.len());
    let queue = Mutex::new(items.into_iter().collect::<VecDeque<_>>());
    let errors = Mutex::new(Vec::<String>::new());

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let next = queue
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .pop_front();
                let Some(item) = next else {
                    break;
                };
                match api.download(&item.url, &item.dest) {
                    Ok(()) => append_run_log(
                        "debug",
                        "prefetch.file.downloaded",
                        json!({
                            "segment": item.segment,
                            "kind": item.kind.as_str(),
                            "dest": item.dest.display().to_string()
                        }),
                    ),
                    Err(err) => errors
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(format!("{}: {err}", item.dest.display())),
                }
            });
        }
    });

    let errors = errors.into_inner().unwrap_or_else(PoisonError::into_inner);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ClipperError::Download(format!(
            "download failed: {}",
            errors.join("; ")
        )))
    }
}

/// Serves a fixed file list and "downloads" by writing empty files into a
/// `FakeFileSystem`.
#[derive(Clone, Default)]
pub struct FakeRouteApi {
    files: Option<FileList>,
    info: Option<RouteInfo>,
    fs: FakeFileSystem,
    failing_urls: Arc<Mutex<Vec<String>>>,
    downloads: Arc<Mutex<Vec<PathBuf>>>,
}

impl FakeRouteApi {
    pub fn new(files: Option<FileList>, info: Option<RouteInfo>, fs: FakeFileSystem) -> Self {
        Self {
            files,
            info,
            fs,
            ..Self::default()
        }
    }

    pub fn fail_url(&self, url: &str) {
        self.failing_urls
            .lock()
            .expect("failing lock")
            .push(url.to_string());
    }

    pub fn downloads(&self) -> Vec<PathBuf> {
        let mut downloads = self.downloads.lock().expect("downloads lock").clone();
        downloads.sort();
        downloads
    }
}

impl RouteApi for FakeRouteApi {
    fn route_files(&self, route: &Route) -> Result<FileList, ClipperError> {
        self.files.clone().ok_or_else(|| {
            ClipperError::Download(format!("route {} is not accessible", route.canonical()))
        })
    }

    fn route_info(&self, route: &Route) -> Result<RouteInfo, ClipperError> {
        self.info.clone().ok_or_else(|| {
            ClipperError::Download(format!("route info for {} unavailable", route.canonical()))
        })
    }

    fn download(&self, url: &str, dest: &Path) -> Result<(), ClipperError> {
        if self
            .failing_urls
            .lock()
            .expect("failing lock")
            .iter()
            .any(|u| u == url)
        {
            return Err(ClipperError::Download(format!("{url} returned 403")));
        }
        self.downloads
            .lock()
            .expect("downloads lock")
            .push(dest.to_path_buf());
        self.fs.write_string(dest, "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FakeProcessRunner;
    use crate::types::DEFAULT_ROUTE;

    fn url(segment: u64, name: &str) -> String {
        format!("https://blob.example/a2a0ccea32023010/2023-07-27--13-01-19/{segment}/{name}?sig=1")
    }

    fn files(segments: &[u64]) -> FileList {
        FileList {
            cameras: segments.iter().map(|s| url(*s, "fcamera.hevc")).collect(),
            ecameras: segments.iter().map(|s| url(*s, "ecamera.hevc")).collect(),
            dcameras: Vec::new(),
            logs: segments.iter().map(|s| url(*s, "rlog.bz2")).collect(),
        }
    }

    fn kinds() -> Vec<FileKind> {
        vec![FileKind::Cameras, FileKind::Ecameras, FileKind::Logs]
    }

    #[test]
    fn prefetch_downloads_missing_files_and_decompresses_logs() {
        let route = Route::parse(DEFAULT_ROUTE).expect("route");
        let kinds = kinds();
        let fs = FakeFileSystem::default();
        let api = FakeRouteApi::new(
            Some(files(&[0, 1, 2])),
            Some(RouteInfo {
                segment_start_times: vec![10, 20, 30],
                segment_end_times: vec![19, 29, 39],
            }),
            fs.clone(),
        );
        let runner = FakeProcessRunner::default();
        runner.push_success("");
        runner.push_success("");
        let plan = PrefetchPlan {
            route: &route,
            window: SegmentWindow::compute(10, 0, 60),
            kinds: &kinds,
            data_dir: Path::new("/data"),
            max_connections: 4,
            bzip2_program: "bzip2",
        };

        let report = prefetch_route(&plan, &api, &runner, &fs).expect("prefetch");

        assert_eq!(report.downloaded, 6);
        assert_eq!(api.downloads().len(), 6);
        assert_eq!(report.decompressed, vec![0, 1]);
        assert_eq!(
            report.viewer_url.as_deref(),
            Some("https://connect.comma.ai/a2a0ccea32023010/10/29")
        );
        let bzip = runner.spawned();
        assert_eq!(bzip[0].program, "bzip2");
        assert_eq!(
            bzip[0].args,
            vec!["-d", "/data/2023-07-27--13-01-19--0/rlog.bz2"]
        );
        assert_eq!(report.markers.len(), 2);
    }

    #[test]
    fn already_decompressed_segments_are_left_alone() {
        let route = Route::parse(DEFAULT_ROUTE).expect("route");
        let kinds = kinds();
        let fs = FakeFileSystem::with_file("/data/2023-07-27--13-01-19--0/rlog", "");
        fs.write_string(Path::new("/data/2023-07-27--13-01-19--0/fcamera.hevc"), "")
            .expect("seed");
        fs.write_string(Path::new("/data/2023-07-27--13-01-19--0/ecamera.hevc"), "")
            .expect("seed");
        let api = FakeRouteApi::new(Some(files(&[0])), None, fs.clone());
        let runner = FakeProcessRunner::default();
        let plan = PrefetchPlan {
            route: &route,
            window: SegmentWindow { first: 0, last: 0 },
            kinds: &kinds,
            data_dir: Path::new("/data"),
            max_connections: 20,
            bzip2_program: "bzip2",
        };

        let report = prefetch_route(&plan, &api, &runner, &fs).expect("prefetch");
        assert_eq!(report.downloaded, 0);
        assert!(report.decompressed.is_empty());
        assert!(runner.spawned().is_empty());
        assert!(report.viewer_url.is_none());
    }

    #[test]
    fn inaccessible_route_fails_before_downloading() {
        let route = Route::parse(DEFAULT_ROUTE).expect("route");
        let kinds = kinds();
        let fs = FakeFileSystem::default();
        let api = FakeRouteApi::new(None, None, fs.clone());
        let plan = PrefetchPlan {
            route: &route,
            window: SegmentWindow { first: 0, last: 0 },
            kinds: &kinds,
            data_dir: Path::new("/data"),
            max_connections: 1,
            bzip2_program: "bzip2",
        };
        let err = prefetch_route(&plan, &api, &FakeProcessRunner::default(), &fs)
            .expect_err("inaccessible");
        assert!(matches!(err, ClipperError::Download(message) if message.contains("not accessible")));
        assert!(api.downloads().is_empty());
    }

    #[test]
    fn every_failed_download_is_reported() {
        let route = Route::parse(DEFAULT_ROUTE).expect("route");
        let kinds = vec![FileKind::Cameras];
        let fs = FakeFileSystem::default();
        let api = FakeRouteApi::new(Some(files(&[0, 1])), None, fs.clone());
        api.fail_url(&url(0, "fcamera.hevc"));
        api.fail_url(&url(1, "fcamera.hevc"));
        let plan = PrefetchPlan {
            route: &route,
            window: SegmentWindow { first: 0, last: 1 },
            kinds: &kinds,
            data_dir: Path::new("/data"),
            max_connections: 2,
            bzip2_program: "bzip2",
        };
        let err = prefetch_route(&plan, &api, &FakeProcessRunner::default(), &fs)
            .expect_err("downloads failed");
        let ClipperError::Download(message) = err else {
            panic!("expected download error");
        };
        assert!(message.contains("--0/fcamera.hevc"));
        assert!(message.contains("--1/fcamera.hevc"));
    }

    #[test]
    fn partial_files_sit_next_to_their_destination() {
        assert_eq!(
            partial_path(Path::new("/d/seg--0/rlog.bz2")),
            PathBuf::from("/d/seg--0/rlog.bz2.part")
        );
    }
}
