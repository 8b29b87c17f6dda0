//! Asynchronous child processes with line-oriented output callbacks.
//!
//! ```text
//! spawn ──► stdout reader ──► on_stdout(line)
//!       ──► stderr reader ──► on_stderr(line)
//!       ──► monitor: wait (or kill) ─► drain readers (bounded) ─► ProcessState
//! ```
//!
//! `ProcessState::is_running` flips to false once the readers have delivered
//! their last line, or once [`DRAIN_TIMEOUT`] has passed since the process
//! exited. Background descendants can hold the pipes open long after that.
//!
//! An [`AsyncCommand::isolated`] process leads a process group of its own;
//! killing it, or leaving descendants behind past the drain bound, signals
//! the whole group.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{Result, WorkerError};

pub type LineHandler = Arc<dyn Fn(String) + Send + Sync>;

/// How long output is still read after the process itself has exited.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Liveness and exit information shared between the monitor task and observers.
#[derive(Debug, Default)]
pub struct ProcessState {
    running: AtomicBool,
    exited: AtomicBool,
    successful: AtomicBool,
    exit_code: AtomicI32,
    pid: AtomicU32,
}

impl ProcessState {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Exited with status 0.
    pub fn is_successful(&self) -> bool {
        self.successful.load(Ordering::SeqCst)
    }

    /// `None` until the process has exited; `-1` when it was ended by a signal.
    pub fn exit_code(&self) -> Option<i32> {
        self.has_exited()
            .then(|| self.exit_code.load(Ordering::SeqCst))
    }

    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }
}

pub struct AsyncCommand {
    program: String,
    args: Vec<String>,
    working_directory: Option<PathBuf>,
    envs: Vec<(String, String)>,
    on_stdout: Option<LineHandler>,
    on_stderr: Option<LineHandler>,
    isolated: bool,
}

impl AsyncCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_directory: None,
            envs: Vec::new(),
            on_stdout: None,
            on_stderr: None,
            isolated: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// Set or override one variable; the rest of the parent environment is inherited.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn on_stdout(mut self, handler: LineHandler) -> Self {
        self.on_stdout = Some(handler);
        self
    }

    pub fn on_stderr(mut self, handler: LineHandler) -> Self {
        self.on_stderr = Some(handler);
        self
    }

    /// Start the process in a new process group and kill it if the handle's
    /// monitor is dropped. [`RunningCommand::kill`] then reaches every
    /// descendant that stayed in the group.
    pub fn isolated(mut self) -> Self {
        self.isolated = true;
        self
    }

    /// Launch without waiting. Must be called from within a tokio runtime.
    pub fn spawn(self) -> Result<RunningCommand> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.working_directory {
            command.current_dir(dir);
        }
        if self.isolated {
            command.kill_on_drop(true);
            #[cfg(unix)]
            command.process_group(0);
        }

        let mut child = command.spawn().map_err(|e| WorkerError::Spawn {
            command: self.program.clone(),
            source: e,
        })?;

        let pid = child.id().unwrap_or_default();
        let state = Arc::new(ProcessState::default());
        state.pid.store(pid, Ordering::SeqCst);
        state.running.store(true, Ordering::SeqCst);

        let stdout_reader = child
            .stdout
            .take()
            .map(|out| tokio::spawn(read_lines(out, self.on_stdout)));
        let stderr_reader = child
            .stderr
            .take()
            .map(|err| tokio::spawn(read_lines(err, self.on_stderr)));

        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let monitor_state = Arc::clone(&state);
        let program = self.program;
        let isolated = self.isolated;
        let monitor = tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Ok(()) = &mut kill_rx => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(program = %program, error = %e, "failed to kill process");
                    }
                    child.wait().await
                }
            };

            match status {
                Ok(status) => {
                    monitor_state
                        .exit_code
                        .store(status.code().unwrap_or(-1), Ordering::SeqCst);
                    monitor_state
                        .successful
                        .store(status.success(), Ordering::SeqCst);
                }
                Err(e) => {
                    tracing::warn!(program = %program, error = %e, "failed to wait on process");
                    monitor_state.exit_code.store(-1, Ordering::SeqCst);
                }
            }
            monitor_state.exited.store(true, Ordering::SeqCst);

            let mut readers: Vec<JoinHandle<()>> =
                [stdout_reader, stderr_reader].into_iter().flatten().collect();
            let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
                for reader in readers.iter_mut() {
                    let _ = reader.await;
                }
            })
            .await
            .is_ok();

            if !drained {
                tracing::warn!(program = %program, pid, "output still open after exit; abandoning it");
                if isolated {
                    signal_group(pid);
                }
                for reader in &readers {
                    reader.abort();
                }
            }
            monitor_state.running.store(false, Ordering::SeqCst);
        });

        Ok(RunningCommand {
            state,
            kill: Some(kill_tx),
            isolated,
            monitor,
        })
    }
}

/// SIGKILL every process left in the group led by `pgid`.
#[cfg(unix)]
fn signal_group(pgid: u32) {
    let pgid = match libc::pid_t::try_from(pgid) {
        Ok(pgid) if pgid > 0 => pgid,
        _ => return,
    };
    // SAFETY: killpg only delivers a signal and shares no memory with the target.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!(pgid, error = %err, "failed to signal process group");
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: u32) {}

async fn read_lines<R: AsyncRead + Unpin>(stream: R, handler: Option<LineHandler>) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                if let Some(handler) = &handler {
                    handler(String::from_utf8_lossy(&buf).into_owned());
                }
            }
        }
    }
}

/// Handle to a spawned [`AsyncCommand`].
pub struct RunningCommand {
    state: Arc<ProcessState>,
    kill: Option<oneshot::Sender<()>>,
    isolated: bool,
    monitor: JoinHandle<()>,
}

impl RunningCommand {
    pub fn state(&self) -> Arc<ProcessState> {
        Arc::clone(&self.state)
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// Force-terminate the process. For an isolated command this also reaches
    /// descendants still holding its output open. Later calls are no-ops.
    pub fn kill(&mut self) {
        let Some(kill) = self.kill.take() else {
            return;
        };
        if self.isolated && self.state.is_running() {
            if let Some(pid) = self.state.pid() {
                signal_group(pid);
            }
        }
        let _ = kill.send(());
    }

    /// Wait until the process has exited and its output has been drained.
    pub async fn wait(self) -> Arc<ProcessState> {
        let _ = self.monitor.await;
        self.state
    }
}

/// Capability probe: can `program` be started on this host at all?
///
/// Exit status is irrelevant; only a failed launch counts as unsupported.
pub async fn probe(program: &str) -> bool {
    Command::new(program)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::{Duration, Instant};

    fn collector() -> (LineHandler, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        (Arc::new(move |line| sink.lock().push(line)), lines)
    }

    #[tokio::test]
    async fn test_lines_delivered_in_order_before_exit() {
        let (stdout, lines) = collector();
        let running = AsyncCommand::new("bash")
            .args(["-c", "for i in 1 2 3; do echo line$i; done; exit 3"])
            .on_stdout(stdout)
            .spawn()
            .unwrap();

        let state = running.wait().await;
        assert!(!state.is_running());
        assert_eq!(state.exit_code(), Some(3));
        assert!(!state.is_successful());
        assert_eq!(*lines.lock(), vec!["line1", "line2", "line3"]);
    }

    #[tokio::test]
    async fn test_stderr_routed_separately() {
        let (stdout, out_lines) = collector();
        let (stderr, err_lines) = collector();
        let state = AsyncCommand::new("bash")
            .args(["-c", "echo out; echo err >&2"])
            .on_stdout(stdout)
            .on_stderr(stderr)
            .spawn()
            .unwrap()
            .wait()
            .await;

        assert!(state.is_successful());
        assert_eq!(*out_lines.lock(), vec!["out"]);
        assert_eq!(*err_lines.lock(), vec!["err"]);
    }

    #[tokio::test]
    async fn test_kill_terminates_long_running_process() {
        let started = Instant::now();
        let mut running = AsyncCommand::new("bash")
            .args(["-c", "sleep 30"])
            .spawn()
            .unwrap();
        assert!(running.is_running());

        running.kill();
        let state = running.wait().await;
        assert!(!state.is_running());
        assert!(!state.is_successful());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_environment_override_and_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let (stdout, lines) = collector();
        AsyncCommand::new("bash")
            .args(["-c", "echo $OVERRIDE_VALUE; pwd"])
            .env("OVERRIDE_VALUE", "overridden")
            .current_dir(dir.path())
            .on_stdout(stdout)
            .spawn()
            .unwrap()
            .wait()
            .await;

        let lines = lines.lock();
        assert_eq!(lines[0], "overridden");
        let reported = std::fs::canonicalize(&lines[1]).unwrap();
        assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let err = AsyncCommand::new("definitely-not-an-interpreter-xyz")
            .spawn()
            .err()
            .unwrap();
        assert!(matches!(err, WorkerError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_probe() {
        assert!(probe("bash").await);
        // a launched program counts as available whatever its exit status
        assert!(probe("false").await);
        assert!(!probe("definitely-not-an-interpreter-xyz").await);
    }

    fn alive(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .is_some_and(|rest| !rest.trim_start().starts_with('Z')),
            Err(_) => false,
        }
    }

    async fn wait_for_line(lines: &Arc<Mutex<Vec<String>>>) -> String {
        let started = Instant::now();
        loop {
            if let Some(line) = lines.lock().first().cloned() {
                return line;
            }
            assert!(started.elapsed() < Duration::from_secs(10), "no output");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_background_child_does_not_hold_exit_open() {
        let (stdout, lines) = collector();
        let started = Instant::now();
        let state = AsyncCommand::new("bash")
            .args(["-c", "sleep 30 & echo $!; exit 0"])
            .isolated()
            .on_stdout(stdout)
            .spawn()
            .unwrap()
            .wait()
            .await;

        assert!(started.elapsed() < DRAIN_TIMEOUT + Duration::from_secs(5));
        assert!(!state.is_running());
        assert!(state.is_successful());

        let background: u32 = lines.lock()[0].parse().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while alive(background) {
            assert!(Instant::now() < deadline, "background child survived");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_kill_after_exit_reaches_background_child() {
        let (stdout, lines) = collector();
        let mut running = AsyncCommand::new("bash")
            .args(["-c", "sleep 30 & echo $!; exit 0"])
            .isolated()
            .on_stdout(stdout)
            .spawn()
            .unwrap();
        let background: u32 = wait_for_line(&lines).await.parse().unwrap();

        let state = running.state();
        while !state.has_exited() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(running.is_running());

        let killed_at = Instant::now();
        running.kill();
        let state = running.wait().await;
        assert!(!state.is_running());
        assert!(killed_at.elapsed() < DRAIN_TIMEOUT);

        let deadline = Instant::now() + Duration::from_secs(5);
        while alive(background) {
            assert!(Instant::now() < deadline, "background child survived kill");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
