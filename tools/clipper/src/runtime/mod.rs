use crate::errors::ClipperError;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

mod process_table;

pub use process_table::{parse_ps_output, ProductionProcessTable};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    pub program: String,
    pub args: Vec<String>,
}

impl ProcessRequest {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// One row of a process-table snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub ppid: u32,
    pub pgid: u32,
    pub command: String,
}

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
    fn sleep_until(&self, deadline: SystemTime) -> Result<(), ClipperError>;

    fn sleep(&self, duration: Duration) -> Result<(), ClipperError> {
        self.sleep_until(self.now() + duration)
    }
}

pub trait ProcessRunner: Send + Sync {
    fn spawn(&self, request: ProcessRequest) -> Result<u64, ClipperError>;
    fn wait(&self, handle: u64) -> Result<ProcessOutput, ClipperError>;
    fn kill(&self, handle: u64) -> Result<(), ClipperError>;

    fn run(&self, request: ProcessRequest) -> Result<ProcessOutput, ClipperError> {
        let handle = self.spawn(request)?;
        self.wait(handle)
    }
}

/// Whole-system view used by the sweeper and the interrupt handler.
pub trait ProcessTable: Send + Sync {
    fn snapshot(&self) -> Result<Vec<ProcessEntry>, ClipperError>;
    /// Sends SIGKILL. A process that is already gone counts as killed.
    fn kill(&self, pid: u32) -> Result<(), ClipperError>;
    fn own_pid(&self) -> u32;
    fn own_process_group(&self) -> u32;
}

pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> Result<String, ClipperError>;
    /// Creates or truncates `path`.
    fn write_string(&self, path: &Path, contents: &str) -> Result<(), ClipperError>;
    fn create_dir_all(&self, path: &Path) -> Result<(), ClipperError>;
    fn exists(&self, path: &Path) -> bool;
}

pub trait Terminal: Send + Sync {
    fn write_line(&self, line: &str) -> Result<(), ClipperError>;
}

pub struct ProductionClock;

impl Clock for ProductionClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep_until(&self, deadline: SystemTime) -> Result<(), ClipperError> {
        let now = SystemTime::now();
        if let Ok(duration) = deadline.duration_since(now) {
            std::thread::sleep(duration);
        }
        Ok(())
    }
}

pub struct ProductionFileSystem;

fn io_at(path: &Path) -> impl FnOnce(std::io::Error) -> ClipperError + '_ {
    move |err| ClipperError::Io(format!("{}: {err}", path.display()))
}

impl FileSystem for ProductionFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, ClipperError> {
        std::fs::read_to_string(path).map_err(io_at(path))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), ClipperError> {
        std::fs::write(path, contents).map_err(io_at(path))
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), ClipperError> {
        std::fs::create_dir_all(path).map_err(io_at(path))
    }

    fn exists(&self, path: &Path) -> bool {
        path.try_exists().unwrap_or(false)
    }
}

/// Runs real child processes. Handles stay valid until waited on or killed.
#[derive(Default)]
pub struct ProductionProcessRunner {
    next_handle: AtomicU64,
    children: Mutex<HashMap<u64, Child>>,
}

impl ProductionProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn take_child(&self, handle: u64) -> Result<Child, ClipperError> {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle)
            .ok_or_else(|| ClipperError::Process(format!("no child process for handle {handle}")))
    }
}

impl ProcessRunner for ProductionProcessRunner {
    fn spawn(&self, request: ProcessRequest) -> Result<u64, ClipperError> {
        let child = Command::new(&request.program)
            .args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ClipperError::spawn(&request.program, e.to_string()))?;
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle, child);
        Ok(handle)
    }

    fn wait(&self, handle: u64) -> Result<ProcessOutput, ClipperError> {
        let output = self
            .take_child(handle)?
            .wait_with_output()
            .map_err(|e| ClipperError::Process(e.to_string()))?;
        Ok(ProcessOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn kill(&self, handle: u64) -> Result<(), ClipperError> {
        let mut child = self.take_child(handle)?;
        child
            .kill()
            .map_err(|e| ClipperError::Process(e.to_string()))?;
        let _ = child.wait();
        Ok(())
    }
}

pub struct ProductionTerminal;

impl Terminal for ProductionTerminal {
    fn write_line(&self, line: &str) -> Result<(), ClipperError> {
        use std::io::Write;
        let mut out = std::io::stdout();
        writeln!(out, "{line}").map_err(|e| ClipperError::Io(e.to_string()))
    }
}

pub struct ProductionRuntime {
    pub clock: Arc<dyn Clock>,
    pub file_system: Arc<dyn FileSystem>,
    pub process_runner: Arc<dyn ProcessRunner>,
    pub process_table: Arc<dyn ProcessTable>,
    pub terminal: Arc<dyn Terminal>,
}

impl ProductionRuntime {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(ProductionClock),
            file_system: Arc::new(ProductionFileSystem),
            process_runner: Arc::new(ProductionProcessRunner::new()),
            process_table: Arc::new(ProductionProcessTable),
            terminal: Arc::new(ProductionTerminal),
        }
    }
}

impl Default for ProductionRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<SystemTime>>,
    sleeps: Arc<Mutex<Vec<SystemTime>>>,
}

impl FakeClock {
    pub fn new(now: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn sleeps(&self) -> Vec<SystemTime> {
        self.sleeps.lock().expect("sleep lock").clone()
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(SystemTime::UNIX_EPOCH)
    }
}

impl Clock for FakeClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().expect("clock lock")
    }

    fn sleep_until(&self, deadline: SystemTime) -> Result<(), ClipperError> {
        self.sleeps.lock().expect("sleep lock").push(deadline);
        let mut now = self.now.lock().expect("clock lock");
        if deadline > *now {
            *now = deadline;
        }
        Ok(())
    }
}

/// Files live in a map keyed by path. Directories are only recorded.
#[derive(Default, Clone)]
pub struct FakeFileSystem {
    files: Arc<Mutex<HashMap<PathBuf, String>>>,
    dirs: Arc<Mutex<Vec<PathBuf>>>,
}

impl FakeFileSystem {
    pub fn with_file(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        let fs = Self::default();
        fs.put(path, contents);
        fs
    }

    pub fn put(&self, path: impl Into<PathBuf>, contents: impl Into<String>) {
        self.files
            .lock()
            .expect("files lock")
            .insert(path.into(), contents.into());
    }

    pub fn created_dirs(&self) -> Vec<PathBuf> {
        self.dirs.lock().expect("dirs lock").clone()
    }
}

impl FileSystem for FakeFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, ClipperError> {
        let files = self.files.lock().expect("files lock");
        match files.get(path) {
            Some(contents) => Ok(contents.clone()),
            None => Err(ClipperError::Io(format!("{}: not found", path.display()))),
        }
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), ClipperError> {
        self.put(path, contents);
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), ClipperError> {
        let mut dirs = self.dirs.lock().expect("dirs lock");
        if !dirs.iter().any(|dir| dir == path) {
            dirs.push(path.to_path_buf());
        }
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().expect("files lock").contains_key(path)
    }
}

#[derive(Default, Clone)]
pub struct FakeTerminal {
    writes: Arc<Mutex<Vec<String>>>,
}

impl FakeTerminal {
    pub fn written_lines(&self) -> Vec<String> {
        self.writes.lock().expect("writes lock").clone()
    }
}

impl Terminal for FakeTerminal {
    fn write_line(&self, line: &str) -> Result<(), ClipperError> {
        self.writes
            .lock()
            .expect("writes lock")
            .push(line.to_string());
        Ok(())
    }
}

struct FakeTableState {
    processes: BTreeMap<u32, ProcessEntry>,
    next_pid: u32,
    kills: Vec<u32>,
    unkillable: Vec<u32>,
}

/// In-memory process table. Killing a pid removes it immediately, which is
/// what SIGKILL promises.
#[derive(Clone)]
pub struct FakeProcessTable {
    state: Arc<Mutex<FakeTableState>>,
    own_pid: u32,
    own_pgid: u32,
}

impl FakeProcessTable {
    pub const INIT_PID: u32 = 1;

    pub fn new(own_pid: u32, own_pgid: u32) -> Self {
        let mut processes = BTreeMap::new();
        processes.insert(
            Self::INIT_PID,
            ProcessEntry {
                pid: Self::INIT_PID,
                ppid: 0,
                pgid: Self::INIT_PID,
                command: "/sbin/init".to_string(),
            },
        );
        processes.insert(
            own_pid,
            ProcessEntry {
                pid: own_pid,
                ppid: Self::INIT_PID,
                pgid: own_pgid,
                command: "clipper".to_string(),
            },
        );
        Self {
            state: Arc::new(Mutex::new(FakeTableState {
                processes,
                next_pid: own_pid.max(own_pgid) + 1,
                kills: Vec::new(),
                unkillable: Vec::new(),
            })),
            own_pid,
            own_pgid,
        }
    }

    /// Registers a new live process and returns its pid.
    pub fn spawn(&self, ppid: u32, pgid: Option<u32>, command: &str) -> u32 {
        let mut state = self.state.lock().expect("table lock");
        let pid = state.next_pid;
        state.next_pid += 1;
        state.processes.insert(
            pid,
            ProcessEntry {
                pid,
                ppid,
                pgid: pgid.unwrap_or(pid),
                command: command.to_string(),
            },
        );
        pid
    }

    /// Simulates a process exiting on its own.
    pub fn exit(&self, pid: u32) {
        self.state.lock().expect("table lock").processes.remove(&pid);
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        self.state
            .lock()
            .expect("table lock")
            .processes
            .contains_key(&pid)
    }

    pub fn live_pids(&self) -> Vec<u32> {
        self.state
            .lock()
            .expect("table lock")
            .processes
            .keys()
            .copied()
            .collect()
    }

    pub fn kills(&self) -> Vec<u32> {
        self.state.lock().expect("table lock").kills.clone()
    }

    /// Makes every later kill of `pid` fail and leave it running.
    pub fn refuse_kill(&self, pid: u32) {
        self.state.lock().expect("table lock").unkillable.push(pid);
    }
}

impl Default for FakeProcessTable {
    fn default() -> Self {
        Self::new(100, 100)
    }
}

impl ProcessTable for FakeProcessTable {
    fn snapshot(&self) -> Result<Vec<ProcessEntry>, ClipperError> {
        Ok(self
            .state
            .lock()
            .expect("table lock")
            .processes
            .values()
            .cloned()
            .collect())
    }

    fn kill(&self, pid: u32) -> Result<(), ClipperError> {
        let mut state = self.state.lock().expect("table lock");
        state.kills.push(pid);
        if state.unkillable.contains(&pid) {
            return Err(ClipperError::Process(format!(
                "kill {pid}: operation not permitted"
            )));
        }
        state.processes.remove(&pid);
        Ok(())
    }

    fn own_pid(&self) -> u32 {
        self.own_pid
    }

    fn own_process_group(&self) -> u32 {
        self.own_pgid
    }
}

#[derive(Default, Clone)]
pub struct FakeProcessRunner {
    responses: Arc<Mutex<Vec<Result<ProcessOutput, ClipperError>>>>,
    spawned: Arc<Mutex<Vec<ProcessRequest>>>,
    waits: Arc<Mutex<Vec<u64>>>,
    kills: Arc<Mutex<Vec<u64>>>,
    next_handle: Arc<Mutex<u64>>,
    failing_programs: Arc<Mutex<Vec<String>>>,
    pids: Arc<Mutex<HashMap<u64, u32>>>,
    table: Option<FakeProcessTable>,
}

impl FakeProcessRunner {
    /// Every spawned child also appears in `table`, inside the caller's
    /// process group, until it is waited on or killed.
    pub fn with_process_table(table: FakeProcessTable) -> Self {
        Self {
            table: Some(table),
            ..Self::default()
        }
    }

    pub fn push_response(&self, output: Result<ProcessOutput, ClipperError>) {
        self.responses.lock().expect("responses lock").push(output);
    }

    pub fn push_success(&self, stdout: &str) {
        self.push_response(Ok(ProcessOutput {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }));
    }

    pub fn fail_spawn_of(&self, program: &str) {
        self.failing_programs
            .lock()
            .expect("failing lock")
            .push(program.to_string());
    }

    pub fn spawned(&self) -> Vec<ProcessRequest> {
        self.spawned.lock().expect("spawned lock").clone()
    }

    pub fn waits(&self) -> Vec<u64> {
        self.waits.lock().expect("waits lock").clone()
    }

    pub fn kills(&self) -> Vec<u64> {
        self.kills.lock().expect("kills lock").clone()
    }

    pub fn pid_of(&self, handle: u64) -> Option<u32> {
        self.pids.lock().expect("pids lock").get(&handle).copied()
    }

    fn forget(&self, handle: u64) {
        let pid = self.pids.lock().expect("pids lock").remove(&handle);
        if let (Some(table), Some(pid)) = (&self.table, pid) {
            table.exit(pid);
        }
    }
}

impl ProcessRunner for FakeProcessRunner {
    fn spawn(&self, request: ProcessRequest) -> Result<u64, ClipperError> {
        let fails = self
            .failing_programs
            .lock()
            .expect("failing lock")
            .contains(&request.program);
        if fails {
            return Err(ClipperError::spawn(
                &request.program,
                "No such file or directory (os error 2)",
            ));
        }
        let command = std::iter::once(request.program.clone())
            .chain(request.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        self.spawned.lock().expect("spawned lock").push(request);
        let mut next = self.next_handle.lock().expect("next lock");
        let handle = *next;
        *next += 1;
        if let Some(table) = &self.table {
            let pid = table.spawn(
                table.own_pid(),
                Some(table.own_process_group()),
                &command,
            );
            self.pids.lock().expect("pids lock").insert(handle, pid);
        }
        Ok(handle)
    }

    fn wait(&self, handle: u64) -> Result<ProcessOutput, ClipperError> {
        self.waits.lock().expect("waits lock").push(handle);
        self.forget(handle);
        let mut responses = self.responses.lock().expect("responses lock");
        if responses.is_empty() {
            return Err(ClipperError::Process(
                "no fake response queued".to_string(),
            ));
        }
        responses.remove(0)
    }

    fn kill(&self, handle: u64) -> Result<(), ClipperError> {
        self.kills.lock().expect("kills lock").push(handle);
        self.forget(handle);
        Ok(())
    }
}
