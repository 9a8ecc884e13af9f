//! Per-host remote command execution.
//!
//! One thread per host drains that host's standard output. Lines from a
//! single host are reported in arrival order; there is no ordering
//! guarantee across hosts. A remote command ends its output with a
//! sentinel-bracketed JSON payload:
//!
//! ```text
//! ...ordinary output lines...
//! @netrig:payload:begin@
//! {"ok": true, "detail": "step complete"}
//! @netrig:payload:end@
//! ```
//!
//! An interrupt kills the in-flight children; their threads record
//! `Interrupted` rather than `Excepted`. The parent joins with a
//! bounded poll so interrupts surface promptly.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Start demarcator for the structured result payload.
pub const PAYLOAD_BEGIN: &str = "@netrig:payload:begin@";

/// End demarcator for the structured result payload.
pub const PAYLOAD_END: &str = "@netrig:payload:end@";

/// The structured result a remote command appends after its output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub ok: bool,
    pub detail: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Terminal state of one host's command.
#[derive(Debug)]
pub enum HostStatus {
    /// The command exited cleanly and produced a payload.
    Completed(CommandResult),
    /// Spawn failure, bad exit status, or missing/bad payload.
    Excepted(String),
    /// The command was cut short by an interrupt.
    Interrupted,
}

/// What one host produced.
#[derive(Debug)]
pub struct HostReport {
    pub host: String,
    pub status: HostStatus,
    /// Ordinary output lines, in arrival order.
    pub output: Vec<String>,
}

impl HostReport {
    pub fn excepted(&self) -> bool {
        matches!(self.status, HostStatus::Excepted(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("command excepted on host(s): {}", .failed.join(", "))]
    HostsFailed {
        failed: Vec<String>,
        /// Every host's report, failures included.
        reports: Vec<HostReport>,
    },
}

#[derive(Debug, thiserror::Error)]
#[error("cannot ship {path} to {host}: {detail}")]
pub struct ShipError {
    pub host: String,
    pub path: PathBuf,
    pub detail: String,
}

/// Signals in-flight commands to stop.
///
/// Cloneable; all clones share the same flag and child registry.
/// `interrupt()` sets the flag and sends SIGTERM to every registered
/// child, which unblocks the reader threads.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
    pids: Arc<Mutex<Vec<i32>>>,
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let pids = self.pids.lock().unwrap_or_else(|e| e.into_inner());
        for &pid in pids.iter() {
            // SAFETY: pids are child process IDs registered by our own
            // worker threads; at worst the process already exited and
            // kill returns ESRCH.
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn register(&self, pid: i32) {
        self.pids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(pid);
    }

    fn unregister(&self, pid: i32) {
        self.pids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|&p| p != pid);
    }
}

/// Executes one command across a set of hosts.
#[derive(Debug, Clone)]
pub struct RemoteRunner {
    /// The ssh client binary.
    pub ssh_program: String,
    /// The file-copy binary used by [`RemoteRunner::ship`].
    pub scp_program: String,
    /// How often the parent wakes while waiting on workers.
    pub poll_interval: Duration,
}

impl Default for RemoteRunner {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            scp_program: "scp".to_string(),
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl RemoteRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `command` on every host concurrently and gather reports.
    ///
    /// Per-host failures are isolated: a failing host never stops the
    /// others. After all hosts complete, any excepted host turns the
    /// call into an aggregate [`ExecuteError::HostsFailed`].
    pub fn execute(&self, hosts: &[String], command: &str) -> Result<Vec<HostReport>, ExecuteError> {
        self.execute_with_interrupt(hosts, command, &InterruptHandle::new())
    }

    /// Like [`RemoteRunner::execute`], with caller-controlled interrupt.
    pub fn execute_with_interrupt(
        &self,
        hosts: &[String],
        command: &str,
        interrupt: &InterruptHandle,
    ) -> Result<Vec<HostReport>, ExecuteError> {
        let (tx, rx) = crossbeam_channel::unbounded::<HostReport>();
        let mut handles = Vec::with_capacity(hosts.len());

        for host in hosts {
            let tx = tx.clone();
            let interrupt = interrupt.clone();
            let host = host.clone();
            let command = command.to_string();
            let ssh_program = self.ssh_program.clone();
            handles.push(std::thread::spawn(move || {
                let report = run_host(&ssh_program, &host, &command, &interrupt);
                let _ = tx.send(report);
            }));
        }
        drop(tx);

        let mut reports = Vec::with_capacity(hosts.len());
        while reports.len() < hosts.len() {
            match rx.recv_timeout(self.poll_interval) {
                Ok(report) => reports.push(report),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        }
        for handle in handles {
            let _ = handle.join();
        }

        reports.sort_by(|a, b| a.host.cmp(&b.host));
        let failed: Vec<String> = reports
            .iter()
            .filter(|r| r.excepted())
            .map(|r| r.host.clone())
            .collect();
        if failed.is_empty() {
            Ok(reports)
        } else {
            Err(ExecuteError::HostsFailed { failed, reports })
        }
    }

    /// Ship a local file to a path on `host`. Local hosts get a plain
    /// filesystem copy; remote hosts go through the scp program.
    pub fn ship(&self, host: &str, local: &Path, remote: &Path) -> Result<(), ShipError> {
        let fail = |detail: String| ShipError {
            host: host.to_string(),
            path: local.to_path_buf(),
            detail,
        };

        if is_local(host) {
            if let Some(parent) = remote.parent() {
                std::fs::create_dir_all(parent).map_err(|e| fail(e.to_string()))?;
            }
            std::fs::copy(local, remote).map_err(|e| fail(e.to_string()))?;
            return Ok(());
        }

        let output = Command::new(&self.scp_program)
            .arg(local)
            .arg(format!("{host}:{}", remote.display()))
            .output()
            .map_err(|e| fail(e.to_string()))?;
        if !output.status.success() {
            return Err(fail(String::from_utf8_lossy(&output.stderr).into_owned()));
        }
        Ok(())
    }
}

fn is_local(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

/// Worker body: spawn, drain, frame the payload, classify the outcome.
fn run_host(ssh_program: &str, host: &str, command: &str, interrupt: &InterruptHandle) -> HostReport {
    let mut cmd = if is_local(host) {
        let mut c = Command::new("sh");
        c.arg("-c").arg(command);
        c
    } else {
        let mut c = Command::new(ssh_program);
        c.arg(host).arg(command);
        c
    };
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return HostReport {
                host: host.to_string(),
                status: HostStatus::Excepted(format!("spawn failed: {e}")),
                output: Vec::new(),
            }
        }
    };
    let pid = child.id() as i32;
    interrupt.register(pid);

    // Drain stderr separately so the child never stalls on a full pipe.
    let stderr_thread = child.stderr.take().map(|stderr| {
        let host = host.to_string();
        std::thread::spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                tracing::warn!(host = %host, line = %line, "remote stderr");
            }
        })
    });

    let mut output = Vec::new();
    let mut payload_buf = String::new();
    let mut payload: Option<String> = None;
    let mut in_payload = false;

    if let Some(stdout) = child.stdout.take() {
        for line in BufReader::new(stdout).lines().map_while(Result::ok) {
            if line == PAYLOAD_BEGIN {
                in_payload = true;
                payload_buf.clear();
                continue;
            }
            if line == PAYLOAD_END {
                in_payload = false;
                payload = Some(payload_buf.clone());
                continue;
            }
            if in_payload {
                payload_buf.push_str(&line);
                payload_buf.push('\n');
            } else {
                tracing::info!(host = %host, line = %line, "remote output");
                output.push(line);
            }
        }
    }

    let exit = child.wait();
    interrupt.unregister(pid);
    if let Some(handle) = stderr_thread {
        let _ = handle.join();
    }

    let status = if interrupt.is_interrupted() {
        HostStatus::Interrupted
    } else {
        match exit {
            Ok(st) if st.success() => match payload {
                Some(raw) => match serde_json::from_str::<CommandResult>(&raw) {
                    Ok(result) => HostStatus::Completed(result),
                    Err(e) => HostStatus::Excepted(format!("bad result payload: {e}")),
                },
                None => HostStatus::Excepted("no result payload in output".to_string()),
            },
            Ok(st) => HostStatus::Excepted(format!("exit status {st}")),
            Err(e) => HostStatus::Excepted(format!("wait failed: {e}")),
        }
    };

    HostReport {
        host: host.to_string(),
        status,
        output,
    }
}

/// Wrap a shell command so its stdout ends with a well-formed payload.
///
/// Useful for remote sides that do not emit the demarcators themselves.
pub fn with_payload(command: &str, result: &CommandResult) -> String {
    let json = serde_json::to_string(result).unwrap_or_else(|_| "{\"ok\":false}".to_string());
    format!(
        "{command} && printf '%s\\n%s\\n%s\\n' '{PAYLOAD_BEGIN}' '{}' '{PAYLOAD_END}'",
        json.replace('\'', "'\\''")
    )
}
