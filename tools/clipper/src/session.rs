use crate::errors::ClipperError;
use crate::logging::append_run_log;
use crate::runtime::{FakeProcessTable, ProcessOutput, ProcessRequest, ProcessRunner};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Input delivered to a pane as if typed at its terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Keystroke {
    /// A named key such as `Space` or `Enter`.
    Key(String),
    /// Text typed verbatim.
    Literal(String),
}

impl Keystroke {
    pub fn key(name: impl Into<String>) -> Self {
        Self::Key(name.into())
    }

    pub fn literal(text: impl Into<String>) -> Self {
        Self::Literal(text.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pane {
    pub label: String,
    pub command: String,
    /// Root process of the pane as reported by the multiplexer.
    pub pid: Option<u32>,
}

/// A named multi-pane session owned by one orchestrator run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    name: String,
    panes: Vec<Pane>,
}

impl Session {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            panes: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn panes(&self) -> &[Pane] {
        &self.panes
    }

    pub fn pane(&self, label: &str) -> Option<&Pane> {
        self.panes.iter().find(|pane| pane.label == label)
    }

    fn push_pane(&mut self, pane: Pane) {
        self.panes.push(pane);
    }
}

pub trait SessionManager: Send + Sync {
    fn has_session(&self, name: &str) -> Result<bool, ClipperError>;
    /// Fails with `SessionExists` when `name` is live; sweep first.
    fn create_session(
        &self,
        name: &str,
        first_label: &str,
        command: &str,
    ) -> Result<Session, ClipperError>;
    fn add_pane(&self, session: &mut Session, label: &str, command: &str)
        -> Result<(), ClipperError>;
    fn send_input(
        &self,
        session: &Session,
        label: &str,
        keys: &[Keystroke],
    ) -> Result<(), ClipperError>;
    /// Root pid of every pane; empty when the session does not exist.
    fn pane_pids(&self, name: &str) -> Result<Vec<u32>, ClipperError>;
    /// Closes the session construct. Absent sessions are not an error.
    fn destroy_session(&self, name: &str) -> Result<(), ClipperError>;
}

pub struct TmuxSessionManager {
    runner: Arc<dyn ProcessRunner>,
    socket_name: Option<String>,
}

impl TmuxSessionManager {
    pub fn new(runner: Arc<dyn ProcessRunner>, socket_name: Option<String>) -> Self {
        Self {
            runner,
            socket_name,
        }
    }

    fn run_tmux(&self, args: Vec<String>) -> Result<ProcessOutput, ClipperError> {
        let mut full = Vec::with_capacity(args.len() + 2);
        if let Some(socket) = &self.socket_name {
            full.push("-L".to_string());
            full.push(socket.clone());
        }
        full.extend(args);
        self.runner.run(ProcessRequest::new("tmux", full))
    }

    fn spawn_pane(
        &self,
        target: &str,
        args: Vec<String>,
        command: &str,
    ) -> Result<Option<u32>, ClipperError> {
        let out = self.run_tmux(args)?;
        if out.exit_code != 0 {
            append_run_log(
                "error",
                "session.pane.spawn_failed",
                json!({
                    "target": target,
                    "command": command,
                    "exit_code": out.exit_code,
                    "stderr": out.stderr
                }),
            );
            return Err(ClipperError::spawn(target, out.stderr.trim()));
        }
        let pid = out.stdout.trim().parse::<u32>().ok();
        append_run_log(
            "info",
            "session.pane.spawned",
            json!({
                "target": target,
                "command": command,
                "pid": pid
            }),
        );
        Ok(pid)
    }
}

/// `=` forces an exact session-name match instead of tmux's prefix matching.
fn exact(name: &str) -> String {
    format!("={name}")
}

fn pane_target(session: &str, label: &str) -> String {
    format!("={session}:{label}")
}

pub fn is_absent_session_error(stderr: &str) -> bool {
    let normalized = stderr.to_ascii_lowercase();
    normalized.contains("can't find session")
        || normalized.contains("no current target")
        || normalized.contains("no sessions")
        || normalized.contains("no server running")
        || normalized.contains("error connecting to")
}

impl SessionManager for TmuxSessionManager {
    fn has_session(&self, name: &str) -> Result<bool, ClipperError> {
        let out = self.run_tmux(vec![
            "has-session".to_string(),
            "-t".to_string(),
            exact(name),
        ])?;
        Ok(out.exit_code == 0)
    }

    fn create_session(
        &self,
        name: &str,
        first_label: &str,
        command: &str,
    ) -> Result<Session, ClipperError> {
        if self.has_session(name)? {
            append_run_log(
                "error",
                "session.create.exists",
                json!({ "session": name }),
            );
            return Err(ClipperError::SessionExists(name.to_string()));
        }
        let target = format!("{name}:{first_label}");
        let pid = self.spawn_pane(
            &target,
            vec![
                "new-session".to_string(),
                "-d".to_string(),
                "-s".to_string(),
                name.to_string(),
                "-n".to_string(),
                first_label.to_string(),
                "-P".to_string(),
                "-F".to_string(),
                "#{pane_pid}".to_string(),
                command.to_string(),
            ],
            command,
        )?;
        let mut session = Session::new(name);
        session.push_pane(Pane {
            label: first_label.to_string(),
            command: command.to_string(),
            pid,
        });
        Ok(session)
    }

    fn add_pane(
        &self,
        session: &mut Session,
        label: &str,
        command: &str,
    ) -> Result<(), ClipperError> {
        let target = format!("{}:{label}", session.name());
        let pid = self.spawn_pane(
            &target,
            vec![
                "new-window".to_string(),
                "-d".to_string(),
                "-t".to_string(),
                format!("{}:", exact(session.name())),
                "-n".to_string(),
                label.to_string(),
                "-P".to_string(),
                "-F".to_string(),
                "#{pane_pid}".to_string(),
                command.to_string(),
            ],
            command,
        )?;
        session.push_pane(Pane {
            label: label.to_string(),
            command: command.to_string(),
            pid,
        });
        Ok(())
    }

    fn send_input(
        &self,
        session: &Session,
        label: &str,
        keys: &[Keystroke],
    ) -> Result<(), ClipperError> {
        if session.pane(label).is_none() {
            return Err(ClipperError::Process(format!(
                "pane `{label}` not found in session `{}`",
                session.name()
            )));
        }
        let target = pane_target(session.name(), label);
        for key in keys {
            let mut args = vec!["send-keys".to_string(), "-t".to_string(), target.clone()];
            match key {
                Keystroke::Key(name) => args.push(name.clone()),
                Keystroke::Literal(text) => {
                    if text.is_empty() {
                        continue;
                    }
                    args.push("-l".to_string());
                    args.push(text.clone());
                }
            }
            let out = self.run_tmux(args)?;
            if out.exit_code != 0 {
                return Err(ClipperError::Process(format!(
                    "tmux send-keys to {target} failed: {}",
                    out.stderr.trim()
                )));
            }
        }
        append_run_log(
            "info",
            "session.input.sent",
            json!({
                "session": session.name(),
                "pane": label,
                "keys": keys.iter().map(|k| format!("{k:?}")).collect::<Vec<_>>()
            }),
        );
        Ok(())
    }

    fn pane_pids(&self, name: &str) -> Result<Vec<u32>, ClipperError> {
        let out = self.run_tmux(vec![
            "list-panes".to_string(),
            "-s".to_string(),
            "-t".to_string(),
            exact(name),
            "-F".to_string(),
            "#{pane_pid}".to_string(),
        ])?;
        if out.exit_code != 0 {
            if is_absent_session_error(&out.stderr) {
                return Ok(Vec::new());
            }
            return Err(ClipperError::Process(format!(
                "tmux list-panes for {name} failed: {}",
                out.stderr.trim()
            )));
        }
        Ok(out
            .stdout
            .lines()
            .filter_map(|line| line.trim().parse::<u32>().ok())
            .collect())
    }

    fn destroy_session(&self, name: &str) -> Result<(), ClipperError> {
        let out = self.run_tmux(vec![
            "kill-session".to_string(),
            "-t".to_string(),
            exact(name),
        ])?;
        if out.exit_code != 0 && !is_absent_session_error(&out.stderr) {
            return Err(ClipperError::Process(format!(
                "tmux kill-session {name} failed: {}",
                out.stderr.trim()
            )));
        }
        append_run_log(
            "info",
            "session.destroyed",
            json!({ "session": name, "existed": out.exit_code == 0 }),
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentInput {
    pub session: String,
    pub label: String,
    pub keys: Vec<Keystroke>,
}

#[derive(Default)]
struct FakeSessions {
    sessions: BTreeMap<String, Vec<Pane>>,
    inputs: Vec<SentInput>,
    failing_labels: Vec<String>,
    server_pid: Option<u32>,
    pane_processes: Vec<u32>,
}

/// Multiplexer stand-in backed by a `FakeProcessTable`. Each pane is a
/// process under a shared server process plus one child, so sweeping has a
/// real tree to walk. Destroying a session does not kill its processes.
#[derive(Clone)]
pub struct FakeSessionManager {
    state: Arc<Mutex<FakeSessions>>,
    table: FakeProcessTable,
}

impl FakeSessionManager {
    pub fn new(table: FakeProcessTable) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeSessions::default())),
            table,
        }
    }

    pub fn fail_pane(&self, label: &str) {
        self.state
            .lock()
            .expect("sessions lock")
            .failing_labels
            .push(label.to_string());
    }

    pub fn inputs(&self) -> Vec<SentInput> {
        self.state.lock().expect("sessions lock").inputs.clone()
    }

    pub fn session_names(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("sessions lock")
            .sessions
            .keys()
            .cloned()
            .collect()
    }

    /// Root and child of every pane ever spawned, whether or not its session
    /// still exists.
    pub fn spawned_pane_pids(&self) -> Vec<u32> {
        self.state
            .lock()
            .expect("sessions lock")
            .pane_processes
            .clone()
    }

    /// Spawned pane processes that are still alive, plus anything they forked.
    pub fn live_pipeline_pids(&self) -> Vec<u32> {
        let snapshot = crate::runtime::ProcessTable::snapshot(&self.table).unwrap_or_default();
        let alive = self
            .spawned_pane_pids()
            .into_iter()
            .filter(|pid| self.table.is_alive(*pid))
            .collect::<Vec<_>>();
        crate::sweeper::descendants_of(&snapshot, &alive)
    }

    fn spawn_pane(&self, state: &mut FakeSessions, label: &str, command: &str) -> Result<Pane, ClipperError> {
        if state.failing_labels.iter().any(|l| l == label) {
            return Err(ClipperError::spawn(label, "command not found"));
        }
        let server = match state.server_pid {
            Some(pid) if self.table.is_alive(pid) => pid,
            _ => {
                let pid = self
                    .table
                    .spawn(FakeProcessTable::INIT_PID, None, "tmux: server");
                state.server_pid = Some(pid);
                pid
            }
        };
        let root = self.table.spawn(server, None, &format!("sh -c {command}"));
        let first_word = command.split_whitespace().next().unwrap_or(command);
        let child = self.table.spawn(root, Some(root), first_word);
        state.pane_processes.extend([root, child]);
        Ok(Pane {
            label: label.to_string(),
            command: command.to_string(),
            pid: Some(root),
        })
    }
}

impl SessionManager for FakeSessionManager {
    fn has_session(&self, name: &str) -> Result<bool, ClipperError> {
        Ok(self
            .state
            .lock()
            .expect("sessions lock")
            .sessions
            .contains_key(name))
    }

    fn create_session(
        &self,
        name: &str,
        first_label: &str,
        command: &str,
    ) -> Result<Session, ClipperError> {
        let mut state = self.state.lock().expect("sessions lock");
        if state.sessions.contains_key(name) {
            return Err(ClipperError::SessionExists(name.to_string()));
        }
        let pane = self.spawn_pane(&mut state, first_label, command)?;
        state.sessions.insert(name.to_string(), vec![pane.clone()]);
        let mut session = Session::new(name);
        session.push_pane(pane);
        Ok(session)
    }

    fn add_pane(
        &self,
        session: &mut Session,
        label: &str,
        command: &str,
    ) -> Result<(), ClipperError> {
        let mut state = self.state.lock().expect("sessions lock");
        if !state.sessions.contains_key(session.name()) {
            return Err(ClipperError::spawn(
                format!("{}:{label}", session.name()),
                "can't find session",
            ));
        }
        let pane = self.spawn_pane(&mut state, label, command)?;
        if let Some(panes) = state.sessions.get_mut(session.name()) {
            panes.push(pane.clone());
        }
        session.push_pane(pane);
        Ok(())
    }

    fn send_input(
        &self,
        session: &Session,
        label: &str,
        keys: &[Keystroke],
    ) -> Result<(), ClipperError> {
        if session.pane(label).is_none() {
            return Err(ClipperError::Process(format!(
                "pane `{label}` not found in session `{}`",
                session.name()
            )));
        }
        self.state
            .lock()
            .expect("sessions lock")
            .inputs
            .push(SentInput {
                session: session.name().to_string(),
                label: label.to_string(),
                keys: keys.to_vec(),
            });
        Ok(())
    }

    fn pane_pids(&self, name: &str) -> Result<Vec<u32>, ClipperError> {
        let state = self.state.lock().expect("sessions lock");
        Ok(state
            .sessions
            .get(name)
            .map(|panes| {
                panes
                    .iter()
                    .filter_map(|pane| pane.pid)
                    .filter(|pid| self.table.is_alive(*pid))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn destroy_session(&self, name: &str) -> Result<(), ClipperError> {
        self.state
            .lock()
            .expect("sessions lock")
            .sessions
            .remove(name);
        Ok(())
    }
}
