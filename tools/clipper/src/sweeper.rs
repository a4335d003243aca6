use crate::errors::ClipperError;
use crate::logging::append_run_log;
use crate::runtime::{ProcessEntry, ProcessTable};
use crate::session::SessionManager;
use serde_json::json;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub session: String,
    /// Pids signalled, in the order they were killed.
    pub killed: Vec<u32>,
    pub session_existed: bool,
}

impl SweepReport {
    /// Nothing was running and there was no session to close.
    pub fn is_noop(&self) -> bool {
        self.killed.is_empty() && !self.session_existed
    }
}

/// A collaborator left over from an earlier run. Only a process running
/// `program` with `argument` among its arguments is ours; the same program
/// with other arguments belongs to someone else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleProcess {
    pub program: String,
    pub argument: String,
}

impl StaleProcess {
    pub fn new(program: impl Into<String>, argument: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            argument: argument.into(),
        }
    }

    pub fn matches(&self, command: &str) -> bool {
        let mut words = command.split_whitespace();
        let Some(executable) = words.next() else {
            return false;
        };
        basename(executable) == basename(&self.program) && words.any(|word| word == self.argument)
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Force-terminates everything a session left behind, whether the session
/// is still alive or only its orphans are.
pub struct Sweeper {
    sessions: Arc<dyn SessionManager>,
    table: Arc<dyn ProcessTable>,
    stale: Vec<StaleProcess>,
}

impl Sweeper {
    pub fn new(
        sessions: Arc<dyn SessionManager>,
        table: Arc<dyn ProcessTable>,
        stale: Vec<StaleProcess>,
    ) -> Self {
        Self {
            sessions,
            table,
            stale,
        }
    }

    pub fn sweep(&self, session_name: &str) -> Result<SweepReport, ClipperError> {
        let session_existed = self.sessions.has_session(session_name)?;
        let roots = self.sessions.pane_pids(session_name)?;
        let snapshot = self.table.snapshot()?;

        let mut seeds = roots.clone();
        seeds.extend(
            snapshot
                .iter()
                .filter(|entry| self.stale.iter().any(|stale| stale.matches(&entry.command)))
                .map(|entry| entry.pid),
        );

        let own_pid = self.table.own_pid();
        let mut targets = descendants_of(&snapshot, &seeds);
        targets.retain(|pid| *pid != own_pid && *pid > 1);
        targets.reverse();

        let mut killed = Vec::with_capacity(targets.len());
        let mut failures = Vec::new();
        for pid in targets {
            match self.table.kill(pid) {
                Ok(()) => {
                    append_run_log("debug", "sweep.kill.sent", json!({ "pid": pid }));
                    killed.push(pid);
                }
                Err(err) => {
                    append_run_log(
                        "warn",
                        "sweep.kill.failed",
                        json!({ "pid": pid, "error": err.to_string() }),
                    );
                    failures.push(format!("{pid}: {err}"));
                }
            }
        }

        self.sessions.destroy_session(session_name)?;

        let report = SweepReport {
            session: session_name.to_string(),
            killed,
            session_existed,
        };
        append_run_log(
            "info",
            if report.is_noop() {
                "sweep.noop"
            } else {
                "sweep.completed"
            },
            json!({
                "session": session_name,
                "pane_roots": roots,
                "killed": report.killed,
                "session_existed": session_existed,
                "failed": failures
            }),
        );

        if !failures.is_empty() {
            return Err(ClipperError::Process(format!(
                "sweep of `{session_name}` could not kill {}",
                failures.join(", ")
            )));
        }
        Ok(report)
    }
}

/// Breadth-first walk from `roots` over the parent links in `snapshot`.
/// Parents precede their children; roots absent from the snapshot are
/// dropped and each pid appears once.
pub fn descendants_of(snapshot: &[ProcessEntry], roots: &[u32]) -> Vec<u32> {
    let live = snapshot.iter().map(|e| e.pid).collect::<BTreeSet<_>>();
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for entry in snapshot {
        if entry.pid != entry.ppid {
            children.entry(entry.ppid).or_default().push(entry.pid);
        }
    }

    let mut seen = BTreeSet::new();
    let mut order = Vec::new();
    let mut queue = roots
        .iter()
        .copied()
        .filter(|pid| live.contains(pid))
        .collect::<VecDeque<_>>();
    while let Some(pid) = queue.pop_front() {
        if !seen.insert(pid) {
            continue;
        }
        order.push(pid);
        if let Some(kids) = children.get(&pid) {
            queue.extend(kids.iter().copied());
        }
    }
    order
}
