//! Child process launching with line-buffered capture and a registry of running processes.
//!
//! Each launched command gets two reader threads (stdout, stderr) that push
//! completed lines into per-stream channels, so the caller can poll output
//! without blocking and the OS pipe buffers never fill up.
//!
//! Every live process is recorded in a registry shared by all clones of a
//! [`ProcessRunner`]. The interrupt handler sweeps the same registry, so the
//! map is only touched under its mutex.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

/// Delay between liveness polls while waiting for a process to exit.
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Upper bound on waiting for reader threads to flush after the process exits.
const DRAIN_WAIT: Duration = Duration::from_millis(500);

/// Which output stream to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Registry entry for a live process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningProcess {
    /// Friendly name (the command line).
    pub name: String,
    pub pid: u32,
}

type Registry = Arc<Mutex<HashMap<String, RunningProcess>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<String, RunningProcess>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Remove `key` only while it still names `pid`; a reused id keeps its newer process.
fn remove_entry(registry: &Registry, key: &str, pid: u32) {
    let mut registry = lock(registry);
    if registry.get(key).is_some_and(|p| p.pid == pid) {
        registry.remove(key);
    }
}

/// Launches commands and tracks the processes it started.
///
/// Cloning is cheap and every clone shares one registry.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    registry: Registry,
    grace: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl ProcessRunner {
    /// `grace` is the window between the terminate signal and the forceful kill.
    pub fn new(grace: Duration) -> Self {
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
            grace,
        }
    }

    /// Launch `command` through the platform shell inside `workdir`.
    ///
    /// The child inherits the current environment. When `command_id` is set
    /// and a process is already registered under it, that process is
    /// terminated first so the id always names exactly one process.
    #[instrument(skip_all, fields(command = %command, command_id = ?command_id))]
    pub fn run(
        &self,
        command: &str,
        workdir: &Path,
        command_id: Option<&str>,
    ) -> Result<ProcessHandle> {
        if let Some(id) = command_id {
            self.terminate_by_id(id);
        }

        let mut cmd = shell_command(command);
        cmd.current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group so the whole tree can be signalled at once.
            cmd.process_group(0);
        }

        debug!(workdir = %workdir.display(), "spawning child process");
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                error!(err = %e, "failed to spawn command");
                return Err(e).with_context(|| format!("spawn `{command}`"));
            }
        };
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;
        let (stdout_tx, stdout_rx) = mpsc::channel();
        let (stderr_tx, stderr_rx) = mpsc::channel();
        spawn_line_reader(stdout, stdout_tx);
        spawn_line_reader(stderr, stderr_tx);

        let key = command_id
            .map(str::to_string)
            .unwrap_or_else(|| format!("pid:{pid}"));
        lock(&self.registry).insert(
            key.clone(),
            RunningProcess {
                name: command.to_string(),
                pid,
            },
        );
        info!(pid, key = %key, "process started");

        Ok(ProcessHandle {
            child,
            pid,
            key,
            stdout_rx,
            stderr_rx,
            started: Instant::now(),
            grace: self.grace,
            registry: Arc::clone(&self.registry),
        })
    }

    /// Terminate the process tree rooted at `pid`.
    ///
    /// Sends the graceful signal to the whole process group, waits up to the
    /// grace window, then kills it. Never fails when the process is already gone.
    #[instrument(skip(self))]
    pub fn terminate(&self, pid: u32) {
        terminate_tree(pid, self.grace);
    }

    /// Terminate the process registered under `command_id`.
    ///
    /// Unknown ids are a no-op, so calling this twice is safe.
    pub fn terminate_by_id(&self, command_id: &str) {
        let entry = lock(&self.registry).remove(command_id);
        match entry {
            Some(process) => {
                info!(command_id, pid = process.pid, "terminating process by id");
                self.terminate(process.pid);
            }
            None => debug!(command_id, "no running process registered under id"),
        }
    }

    /// Terminate every registered process and clear the registry.
    pub fn terminate_all(&self) {
        let drained: Vec<(String, RunningProcess)> = lock(&self.registry).drain().collect();
        if !drained.is_empty() {
            info!(count = drained.len(), "terminating all running processes");
        }
        for (key, process) in drained {
            debug!(key = %key, pid = process.pid, name = %process.name, "terminating");
            self.terminate(process.pid);
        }
    }

    /// Kill every registered process without a grace window and clear the registry.
    ///
    /// Used when the run is interrupted.
    pub fn kill_all(&self) {
        let drained: Vec<(String, RunningProcess)> = lock(&self.registry).drain().collect();
        if !drained.is_empty() {
            info!(count = drained.len(), "killing all running processes");
        }
        for (key, process) in drained {
            debug!(key = %key, pid = process.pid, name = %process.name, "killing");
            kill_tree(process.pid);
        }
    }

    /// Snapshot of the registry, sorted by key.
    pub fn running(&self) -> Vec<(String, RunningProcess)> {
        let mut entries: Vec<_> = lock(&self.registry)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn is_registered(&self, command_id: &str) -> bool {
        lock(&self.registry).contains_key(command_id)
    }

    /// Best-effort liveness probe. "No such process" means not running.
    pub fn is_process_running(pid: u32) -> bool {
        is_alive(pid)
    }
}

/// A launched process and the receiving ends of its output channels.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    key: String,
    stdout_rx: Receiver<String>,
    stderr_rx: Receiver<String>,
    started: Instant,
    grace: Duration,
    registry: Registry,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Registry key (the command id, or `pid:<pid>`).
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn receiver(&self, stream: Stream) -> &Receiver<String> {
        match stream {
            Stream::Stdout => &self.stdout_rx,
            Stream::Stderr => &self.stderr_rx,
        }
    }

    /// Next complete line from `stream`, without blocking.
    pub fn read_line(&self, stream: Stream) -> Option<String> {
        match self.receiver(stream).try_recv() {
            Ok(line) => Some(line),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Everything left on `stream`, waiting briefly for the reader to reach end of stream.
    ///
    /// Each line is newline-terminated. Descendants that keep the pipe open
    /// cannot hold the caller for longer than a short bounded wait.
    pub fn read_remaining(&self, stream: Stream) -> String {
        let rx = self.receiver(stream);
        let deadline = Instant::now() + DRAIN_WAIT;
        let mut out = String::new();
        loop {
            let wait = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(wait) {
                Ok(line) => {
                    out.push_str(&line);
                    out.push('\n');
                }
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => break,
            }
        }
        out
    }

    /// Exit status if the process has finished.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        self.child.try_wait().context("poll child status")
    }

    /// Terminate the process group gracefully, then forcefully, and reap it.
    ///
    /// Returns `None` when the exit status is unavailable because the
    /// process was already reaped elsewhere (for example by an interrupt sweep).
    #[instrument(skip(self), fields(pid = self.pid))]
    pub fn terminate(&mut self) -> Option<ExitStatus> {
        self.unregister();
        match self.child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {}
            Err(e) => {
                debug!(err = %e, "process already reaped");
                return None;
            }
        }
        signal_tree(self.pid, false);
        match self.child.wait_timeout(self.grace) {
            Ok(Some(status)) => {
                debug!("process exited after terminate signal");
                return Some(status);
            }
            Ok(None) => {}
            Err(e) => {
                debug!(err = %e, "wait after terminate signal failed");
                return None;
            }
        }
        warn!(
            grace_ms = self.grace.as_millis() as u64,
            "process ignored terminate signal, killing"
        );
        self.kill_and_reap()
    }

    /// Kill the process group at once, skipping the grace window, and reap it.
    #[instrument(skip(self), fields(pid = self.pid))]
    pub fn kill(&mut self) -> Option<ExitStatus> {
        self.unregister();
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status),
            Ok(None) => self.kill_and_reap(),
            Err(e) => {
                debug!(err = %e, "process already reaped");
                None
            }
        }
    }

    fn kill_and_reap(&mut self) -> Option<ExitStatus> {
        signal_tree(self.pid, true);
        if let Err(e) = self.child.kill() {
            debug!(err = %e, "kill after group signal");
        }
        match self.child.wait() {
            Ok(status) => Some(status),
            Err(e) => {
                debug!(err = %e, "wait after kill failed");
                None
            }
        }
    }

    /// Drop this process from the registry without signalling it.
    pub fn unregister(&self) {
        remove_entry(&self.registry, &self.key, self.pid);
    }

    /// Leave the process running in the background.
    ///
    /// A watcher thread reaps it when it exits and removes its registry
    /// entry. Output keeps being drained but is no longer delivered.
    pub fn detach(self) {
        let ProcessHandle {
            mut child,
            pid,
            key,
            registry,
            ..
        } = self;
        thread::spawn(move || {
            match child.wait() {
                Ok(status) => info!(pid, key = %key, ?status, "background process exited"),
                // Reaped by a terminate sweep.
                Err(e) => debug!(pid, err = %e, "background process already reaped"),
            }
            remove_entry(&registry, &key, pid);
        });
    }
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(not(unix))]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

fn spawn_line_reader<R: Read + Send + 'static>(reader: R, tx: Sender<String>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    // Keep draining after the receiver is gone so the child never blocks on a full pipe.
                    let _ = tx.send(line);
                }
                Err(e) => {
                    debug!(err = %e, "output reader stopped");
                    break;
                }
            }
        }
    });
}

#[cfg(unix)]
fn signal_tree(pid: u32, force: bool) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    let signal = if force {
        Signal::SIGKILL
    } else {
        Signal::SIGTERM
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, err = %e, ?signal, "failed to signal process group"),
    }
}

#[cfg(not(unix))]
fn signal_tree(pid: u32, _force: bool) {
    let result = Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(e) = result {
        warn!(pid, err = %e, "taskkill failed");
    }
}

#[cfg(unix)]
fn reap(pid: u32) {
    use nix::sys::wait::{WaitPidFlag, waitpid};
    use nix::unistd::Pid;

    if let Ok(raw) = i32::try_from(pid) {
        // Not our child (or already reaped) is fine.
        let _ = waitpid(Pid::from_raw(raw), Some(WaitPidFlag::WNOHANG));
    }
}

#[cfg(not(unix))]
fn reap(_pid: u32) {}

#[cfg(unix)]
fn is_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        // Exists but belongs to someone else.
        Err(_) => true,
    }
}

#[cfg(not(unix))]
fn is_alive(pid: u32) -> bool {
    Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH"])
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}

fn terminate_tree(pid: u32, grace: Duration) {
    if !is_alive(pid) {
        reap(pid);
        return;
    }
    signal_tree(pid, false);
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        reap(pid);
        if !is_alive(pid) {
            return;
        }
        thread::sleep(POLL_INTERVAL);
    }
    warn!(pid, "process ignored terminate signal, killing");
    kill_tree(pid);
}

fn kill_tree(pid: u32) {
    signal_tree(pid, true);
    thread::sleep(POLL_INTERVAL);
    reap(pid);
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn runner() -> ProcessRunner {
        ProcessRunner::new(Duration::from_millis(200))
    }

    fn wait_exit(handle: &mut ProcessHandle) -> ExitStatus {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(status) = handle.try_wait().expect("try_wait") {
                return status;
            }
            assert!(Instant::now() < deadline, "process did not exit");
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Verifies per-stream FIFO order and that stdout and stderr are kept apart.
    #[test]
    fn captures_lines_per_stream_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = runner();
        let mut handle = runner
            .run("echo one; echo two; echo oops >&2", temp.path(), None)
            .expect("run");
        let status = wait_exit(&mut handle);
        assert!(status.success());
        assert_eq!(handle.read_remaining(Stream::Stdout), "one\ntwo\n");
        assert_eq!(handle.read_remaining(Stream::Stderr), "oops\n");
        assert_eq!(handle.read_line(Stream::Stdout), None);
    }

    #[test]
    fn runs_inside_working_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("marker.txt"), "x").expect("write");
        let runner = runner();
        let mut handle = runner.run("ls", temp.path(), None).expect("run");
        wait_exit(&mut handle);
        assert!(handle.read_remaining(Stream::Stdout).contains("marker.txt"));
    }

    /// Verifies unknown ids and repeated termination leave the registry intact.
    #[test]
    fn terminate_by_id_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = runner();
        runner.terminate_by_id("nothing-here");

        let handle = runner
            .run("sleep 30", temp.path(), Some("server"))
            .expect("run");
        let other = runner.run("sleep 30", temp.path(), None).expect("run");
        assert!(runner.is_registered("server"));

        runner.terminate_by_id("server");
        runner.terminate_by_id("server");
        assert!(!runner.is_registered("server"));
        assert!(!ProcessRunner::is_process_running(handle.pid()));
        assert_eq!(runner.running().len(), 1);

        runner.terminate_all();
        assert!(runner.running().is_empty());
        assert!(!ProcessRunner::is_process_running(other.pid()));
    }

    /// Verifies re-using a command id replaces the earlier process.
    #[test]
    fn reusing_command_id_terminates_previous_process() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = runner();
        let first = runner
            .run("sleep 30", temp.path(), Some("dev-server"))
            .expect("run");
        let second = runner
            .run("sleep 30", temp.path(), Some("dev-server"))
            .expect("run");
        assert!(!ProcessRunner::is_process_running(first.pid()));
        assert_eq!(runner.running()[0].1.pid, second.pid());
        runner.terminate_all();
    }

    /// Verifies the handle kills a process that traps the terminate signal.
    #[test]
    fn handle_terminate_escalates_to_kill() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = runner();
        let mut handle = runner
            .run("trap '' TERM; sleep 30", temp.path(), None)
            .expect("run");
        thread::sleep(Duration::from_millis(100));
        let status = handle.terminate().expect("exit status");
        assert!(!status.success());
        assert!(runner.running().is_empty());
    }

    /// Verifies kill skips the grace window even for a process trapping the terminate signal.
    #[test]
    fn kill_skips_grace_window() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ProcessRunner::new(Duration::from_secs(10));
        let mut handle = runner
            .run("trap '' TERM; sleep 30", temp.path(), None)
            .expect("run");
        thread::sleep(Duration::from_millis(100));
        let started = Instant::now();
        let status = handle.kill().expect("exit status");
        assert!(!status.success());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(runner.running().is_empty());
    }

    #[test]
    fn kill_all_clears_registry_without_grace() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ProcessRunner::new(Duration::from_secs(10));
        let mut handle = runner
            .run("trap '' TERM; sleep 30", temp.path(), Some("server"))
            .expect("run");
        thread::sleep(Duration::from_millis(100));
        let started = Instant::now();
        runner.kill_all();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(runner.running().is_empty());
        // Either already reaped by the sweep or exited and waiting for us.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match handle.try_wait() {
                Ok(Some(_)) | Err(_) => break,
                Ok(None) => {
                    assert!(Instant::now() < deadline, "process survived kill_all");
                    thread::sleep(POLL_INTERVAL);
                }
            }
        }
    }

    /// Verifies a detached process is reaped and unregistered when it exits on its own.
    #[test]
    fn detached_process_is_unregistered_on_exit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = runner();
        let handle = runner
            .run("echo listening; sleep 0.3", temp.path(), Some("server"))
            .expect("run");
        let pid = handle.pid();
        handle.detach();
        assert!(runner.is_registered("server"));

        let deadline = Instant::now() + Duration::from_secs(10);
        while runner.is_registered("server") {
            assert!(Instant::now() < deadline, "entry was not removed");
            thread::sleep(POLL_INTERVAL);
        }
        // A zombie still answers the liveness probe; a reaped process does not.
        assert!(!ProcessRunner::is_process_running(pid));
    }

    /// Verifies terminating a detached process by id still works alongside the watcher.
    #[test]
    fn detached_process_can_be_terminated_by_id() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = runner();
        let handle = runner
            .run("sleep 30", temp.path(), Some("server"))
            .expect("run");
        let pid = handle.pid();
        handle.detach();
        runner.terminate_by_id("server");
        assert!(!runner.is_registered("server"));
        let deadline = Instant::now() + Duration::from_secs(5);
        while ProcessRunner::is_process_running(pid) {
            assert!(Instant::now() < deadline, "process still running");
            thread::sleep(POLL_INTERVAL);
        }
    }

    #[test]
    fn liveness_probe_treats_missing_process_as_stopped() {
        // pid_max on Linux is at most 2^22.
        assert!(!ProcessRunner::is_process_running(u32::MAX / 2));
        assert!(ProcessRunner::is_process_running(std::process::id()));
    }
}
