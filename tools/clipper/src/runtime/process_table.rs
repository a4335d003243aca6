use super::{ProcessEntry, ProcessTable};
use crate::errors::ClipperError;
use std::io;
use std::process::Command;

/// Reads the live process table through `ps` and signals with `kill(2)`.
pub struct ProductionProcessTable;

impl ProcessTable for ProductionProcessTable {
    fn snapshot(&self) -> Result<Vec<ProcessEntry>, ClipperError> {
        let output = Command::new("ps")
            .args(["-eo", "pid=,ppid=,pgid=,args="])
            .output()
            .map_err(|e| ClipperError::Process(format!("failed to run ps: {e}")))?;
        if !output.status.success() {
            return Err(ClipperError::Process(format!(
                "ps failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(parse_ps_output(&String::from_utf8_lossy(&output.stdout)))
    }

    fn kill(&self, pid: u32) -> Result<(), ClipperError> {
        let Ok(raw) = i32::try_from(pid) else {
            return Err(ClipperError::Process(format!("pid {pid} out of range")));
        };
        if raw <= 1 {
            return Err(ClipperError::Process(format!("refusing to signal pid {pid}")));
        }
        // SAFETY: kill(2) has no memory-safety preconditions; raw is a positive pid.
        let rc = unsafe { libc::kill(raw, libc::SIGKILL) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == libc::ESRCH => Ok(()),
            _ => Err(ClipperError::Process(format!("kill -9 {pid} failed: {err}"))),
        }
    }

    fn own_pid(&self) -> u32 {
        std::process::id()
    }

    fn own_process_group(&self) -> u32 {
        // SAFETY: getpgrp(2) cannot fail and touches no memory.
        let pgid = unsafe { libc::getpgrp() };
        u32::try_from(pgid).unwrap_or_default()
    }
}

/// Parses `ps -eo pid=,ppid=,pgid=,args=` output. Malformed rows are skipped.
pub fn parse_ps_output(output: &str) -> Vec<ProcessEntry> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let pid = fields.next()?.parse::<u32>().ok()?;
            let ppid = fields.next()?.parse::<u32>().ok()?;
            let pgid = fields.next()?.parse::<u32>().ok()?;
            let command = fields.collect::<Vec<_>>().join(" ");
            Some(ProcessEntry {
                pid,
                ppid,
                pgid,
                command,
            })
        })
        .collect()
}
