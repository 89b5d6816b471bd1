//! Child-process plumbing: process-group spawning, tagged line streaming,
//! and kill escalation for single PIDs and whole groups.
//!
//! Every long-lived child (gateway, tunnel) is started in its own process
//! group. The gateway spawns MCP servers of its own; killing only the gateway
//! would leave those orphaned, so teardown signals the whole group. Windows
//! gets the same effect from `CREATE_NEW_PROCESS_GROUP` plus
//! `taskkill /T /F`.
//!
//! Line streaming reads raw bytes with lossy UTF-8 decoding — gateway and
//! tunnel output is not guaranteed to be valid UTF-8, and a decode error must
//! not kill a reader task.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

use crate::error::LaunchError;

/// Grace after SIGTERM to a single PID.
const SINGLE_KILL_GRACE: Duration = Duration::from_millis(300);
/// Grace between group SIGTERM and group SIGKILL.
const GROUP_TERM_GRACE: Duration = Duration::from_millis(800);

/// Shared append-only log file, guarded by a process-wide mutex around each
/// formatted write.
#[derive(Clone)]
pub struct LogSink {
    file: Arc<Mutex<std::fs::File>>,
}

impl LogSink {
    /// Open (or create) the log file in append mode.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Append one tagged line.
    pub fn append(&self, tag: &str, line: &str) {
        use std::io::Write;
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{tag}] {line}");
        }
    }
}

/// Where streamed child output goes besides the optional per-line hook.
#[derive(Clone, Default)]
pub struct StreamOptions {
    /// Print `[tag] line` to standard output.
    pub echo: bool,
    /// Tee every tagged line into the shared log file.
    pub log: Option<LogSink>,
}

/// Per-line callback used for things like tunnel URL extraction.
pub type LineHook = Box<dyn FnMut(&str) + Send + 'static>;

/// A started child plus its PID (the PID outlives the `Child` handle and is
/// what teardown signals).
pub struct SpawnedChild {
    pub child: Child,
    pub pid: u32,
}

/// Start a process in a new process group with piped stdout/stderr and a
/// closed stdin.
pub fn spawn_group(
    program: &str,
    args: &[String],
    env: &BTreeMap<String, String>,
) -> crate::Result<SpawnedChild> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    for (k, v) in env {
        cmd.env(k, v);
    }
    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    configure_process_group(&mut cmd);

    let child = cmd
        .spawn()
        .map_err(|e| LaunchError::Spawn(program.to_string(), e.to_string()))?;
    let pid = child
        .id()
        .ok_or_else(|| LaunchError::Spawn(program.to_string(), "child has no PID".to_string()))?;
    Ok(SpawnedChild { child, pid })
}

#[cfg(unix)]
fn configure_process_group(cmd: &mut Command) {
    use nix::unistd::{Pid, setpgid};
    // setpgid(0, 0): the child becomes leader of a fresh group, so a single
    // negative-PID signal later reaps its whole subtree.
    unsafe {
        cmd.pre_exec(|| {
            setpgid(Pid::from_raw(0), Pid::from_raw(0)).map_err(io::Error::other)?;
            Ok(())
        });
    }
}

#[cfg(windows)]
fn configure_process_group(cmd: &mut Command) {
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
}

/// Spawn a background task reading one stream line-by-line (no accumulation
/// across newlines). Each line is optionally echoed as `[tag] line`, teed to
/// the shared log file, and handed to `line_hook`. The task ends when the
/// pipe closes.
pub fn stream_lines(
    stream: impl AsyncRead + Unpin + Send + 'static,
    tag: String,
    opts: StreamOptions,
    mut line_hook: Option<LineHook>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf: Vec<u8> = Vec::with_capacity(1024);
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if buf.last() == Some(&b'\n') {
                        buf.pop();
                        if buf.last() == Some(&b'\r') {
                            buf.pop();
                        }
                    }
                    let line = String::from_utf8_lossy(&buf).to_string();
                    if line.trim().is_empty() {
                        continue;
                    }
                    if opts.echo {
                        println!("[{tag}] {line}");
                    }
                    if let Some(sink) = &opts.log {
                        sink.append(&tag, &line);
                    }
                    if let Some(hook) = line_hook.as_mut() {
                        hook(&line);
                    }
                }
                Err(e) => {
                    tracing::debug!(tag = %tag, error = %e, "stream reader exiting on read error");
                    break;
                }
            }
        }
        tracing::debug!(tag = %tag, "stream reader done");
    })
}

/// Terminate a single PID: SIGTERM plus a short grace on POSIX, tree-kill on
/// Windows. A PID that is already gone is not an error.
pub async fn kill_pid(pid: u32) -> crate::Result<()> {
    if pid == 0 {
        return Ok(());
    }
    #[cfg(unix)]
    {
        kill_pid_unix(pid).await
    }
    #[cfg(not(unix))]
    {
        kill_tree_windows(pid).await
    }
}

/// Terminate an entire process group: group SIGTERM, grace, group SIGKILL on
/// POSIX. Windows delegates to [`kill_pid`] — the tree-kill flag already
/// covers descendants.
pub async fn kill_process_group(pid: u32) -> crate::Result<()> {
    if pid == 0 {
        return Ok(());
    }
    #[cfg(unix)]
    {
        kill_group_unix(pid).await
    }
    #[cfg(not(unix))]
    {
        kill_tree_windows(pid).await
    }
}

#[cfg(unix)]
async fn kill_pid_unix(pid: u32) -> crate::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => return Err(LaunchError::Shutdown(format!("SIGTERM pid {pid}: {e}"))),
    }
    tokio::time::sleep(SINGLE_KILL_GRACE).await;
    Ok(())
}

#[cfg(unix)]
async fn kill_group_unix(pid: u32) -> crate::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::{Pid, getpgrp};

    // Never signal our own group.
    if getpgrp() == Pid::from_raw(pid as i32) {
        return Ok(());
    }

    let group = Pid::from_raw(-(pid as i32));
    match kill(group, Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => {
            return Err(LaunchError::Shutdown(format!(
                "SIGTERM group {pid}: {e}"
            )));
        }
    }
    tokio::time::sleep(GROUP_TERM_GRACE).await;
    match kill(group, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(LaunchError::Shutdown(format!("SIGKILL group {pid}: {e}"))),
    }
}

#[cfg(not(unix))]
async fn kill_tree_windows(pid: u32) -> crate::Result<()> {
    let status = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .status()
        .await
        .map_err(|e| LaunchError::Shutdown(format!("taskkill {pid}: {e}")))?;
    if !status.success() {
        tracing::debug!(pid = %pid, code = ?status.code(), "taskkill reported failure (process may be gone)");
    }
    Ok(())
}

/// Look up an executable on PATH (with the `.exe` fallback on Windows).
/// Explicit paths are returned as-is when they exist.
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    if name.contains(std::path::MAIN_SEPARATOR) {
        let p = PathBuf::from(name);
        return p.is_file().then_some(p);
    }
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
        #[cfg(windows)]
        {
            let exe = dir.join(format!("{name}.exe"));
            if exe.is_file() {
                return Some(exe);
            }
        }
    }
    None
}
