use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::ex::app::Application;
use crate::ex::asyncutil::tasks;
use crate::ex::config::Configuration;
use crate::ex::logging::{ex_event, AppLogSink, Level};
use crate::ex::status::{ProcState, ProcessState};

/// Raw read block for the child's stdout/stderr pipes.
const PIPE_READ_BLOCK: usize = 4096;
/// Channel depth between a pipe reader and its ring drain; the reader must never block on a
/// slow status consumer.
const OUTPUT_CHANNEL_DEPTH: usize = 4096;
/// Fixed extra grace on top of the per-app timeout before escalating to SIGKILL.
const KILL_GRACE_SECS: u64 = 10;
/// After SIGKILL, give the wait task up to this many 50ms polls to reap the child before the
/// liveness probe decides it is detached.
const REAP_SETTLE_POLLS: u32 = 20;

/// Supervises one instance of an Application's program.
///
/// All operations spawn onto the tracker and return immediately; callers observe completion
/// through the shared [`ProcessState`].
pub struct Process {
    name: String,
    app: Application,
    state: Arc<ProcessState>,
    proc_root: PathBuf,
    sink: AppLogSink,
}

impl Process {
    pub fn new(app: Application, state: Arc<ProcessState>, cfg: &Configuration) -> Arc<Process> {
        Process::with_proc_root(app, state, cfg, PathBuf::from("/proc"))
    }

    /// Like [`Process::new`] but with an explicit pid-probe root in place of `/proc`.
    pub fn with_proc_root(
        app: Application,
        state: Arc<ProcessState>,
        cfg: &Configuration,
        proc_root: PathBuf,
    ) -> Arc<Process> {
        let sink = AppLogSink::open(std::path::Path::new(&cfg.log_path), &app.name);
        Arc::new(Process {
            name: app.name.clone(),
            app,
            state,
            proc_root,
            sink,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> i32 {
        self.state.pid()
    }

    pub fn exit_code(&self) -> i32 {
        self.state.exit_code()
    }

    pub fn state(&self) -> ProcState {
        self.state.state()
    }

    pub fn error(&self) -> Option<String> {
        self.state.error()
    }

    pub fn stdout(&self) -> Vec<String> {
        self.state.list_stdout()
    }

    pub fn stderr(&self) -> Vec<String> {
        self.state.list_stderr()
    }

    /// A child that survived the stop escalation: still present under the probe root while the
    /// state machine has given up on it.
    pub fn zombie(&self) -> bool {
        self.proc_alive(self.state.pid()) && self.state.state() == ProcState::Failed
    }

    pub fn start(self: &Arc<Self>) {
        let proc = Arc::clone(self);
        tasks().spawn(async move {
            proc.run_start().await;
        });
    }

    pub fn stop(self: &Arc<Self>) {
        let proc = Arc::clone(self);
        tasks().spawn(async move {
            proc.run_stop().await;
        });
    }

    pub fn restart(self: &Arc<Self>) {
        let proc = Arc::clone(self);
        tasks().spawn(async move {
            proc.run_stop().await;
            proc.run_start().await;
        });
    }

    async fn run_start(&self) {
        if self.state.state() == ProcState::Started {
            ex_event(
                Level::Warn,
                "process",
                Some(&self.name),
                "operation=start already started",
            );
            return;
        }
        // The CAS is the one-child guard: concurrent starts race here and at most one wins.
        if !self
            .state
            .compare_and_set_state(ProcState::Stopped, ProcState::Starting)
        {
            ex_event(
                Level::Warn,
                "process",
                Some(&self.name),
                format!("operation=start process busy state={}", self.state.state()),
            );
            return;
        }
        self.state.set_error(None);
        self.state.set_exit_code(0);

        let arguments: Vec<&str> = self.app.arguments.split_whitespace().collect();
        let mut cmd = Command::new(&self.app.command);
        cmd.args(&arguments);
        if let Some((uid, gid)) = self.find_credential() {
            ex_event(
                Level::Trace,
                "process",
                Some(&self.name),
                format!(
                    "operation=start user={} group={} uid={uid} gid={gid}",
                    self.app.user, self.app.group
                ),
            );
            cmd.uid(uid);
            cmd.gid(gid);
        }
        for env in &self.app.environment {
            cmd.env(&env.name, &env.value);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.state.set_state(ProcState::Stopped);
                self.state.set_exit_code(-1);
                self.state.set_error(Some(format!("spawn failed: {e}")));
                ex_event(
                    Level::Error,
                    "process",
                    Some(&self.name),
                    format!(
                        "operation=start spawn failed command={} err={e}",
                        self.app.command
                    ),
                );
                return;
            }
        };

        let pid = child.id().map(|p| p as i32).unwrap_or(0);
        self.state.set_pid(pid);

        let (out_tx, out_rx) = mpsc::channel::<String>(OUTPUT_CHANNEL_DEPTH);
        let (err_tx, err_rx) = mpsc::channel::<String>(OUTPUT_CHANNEL_DEPTH);
        if let Some(pipe) = child.stdout.take() {
            self.pump_pipe(pipe, out_tx);
        }
        if let Some(pipe) = child.stderr.take() {
            self.pump_pipe(pipe, err_tx);
        }
        self.drain_channel(out_rx, true);
        self.drain_channel(err_rx, false);

        self.state.set_state(ProcState::Started);
        ex_event(
            Level::Info,
            "process",
            Some(&self.name),
            format!("operation=start pid={pid}"),
        );

        match child.wait().await {
            Ok(status) => {
                if let Some(code) = status.code() {
                    self.state.set_exit_code(code);
                    self.state.set_error(None);
                } else {
                    self.state.set_exit_code(-1);
                    match status.signal() {
                        Some(sig) => self
                            .state
                            .set_error(Some(format!("terminated by signal {sig}"))),
                        None => self
                            .state
                            .set_error(Some("no exit status available".to_string())),
                    }
                }
            }
            Err(e) => {
                self.state.set_exit_code(-1);
                self.state.set_error(Some(format!("wait failed: {e}")));
                ex_event(
                    Level::Error,
                    "process",
                    Some(&self.name),
                    format!("operation=start wait failed pid={pid} err={e}"),
                );
            }
        }
        self.state.set_state(ProcState::Stopped);
        ex_event(
            Level::Info,
            "process",
            Some(&self.name),
            format!(
                "operation=start exited pid={pid} code={}",
                self.state.exit_code()
            ),
        );
    }

    async fn run_stop(&self) {
        if self.state.state() == ProcState::Stopped {
            ex_event(
                Level::Trace,
                "process",
                Some(&self.name),
                "operation=stop already stopped",
            );
            return;
        }
        if !self
            .state
            .compare_and_set_state(ProcState::Started, ProcState::Stopping)
        {
            ex_event(
                Level::Warn,
                "process",
                Some(&self.name),
                format!("operation=stop process busy state={}", self.state.state()),
            );
            return;
        }
        self.state.set_error(None);
        self.state.set_exit_code(-1);

        let pid = self.state.pid();
        match self.send_signal(pid, Signal::SIGINT) {
            Ok(()) => ex_event(
                Level::Trace,
                "process",
                Some(&self.name),
                format!("operation=stop pid={pid} interrupt sent"),
            ),
            Err(e) => {
                // Keep escalating: the kill below and the liveness probe decide the outcome.
                self.state.set_error(Some(format!("interrupt failed: {e}")));
                ex_event(
                    Level::Error,
                    "process",
                    Some(&self.name),
                    format!("operation=stop pid={pid} interrupt failed err={e}"),
                );
            }
        }

        tokio::time::sleep(Duration::from_secs(
            self.app.timeout.saturating_add(KILL_GRACE_SECS),
        ))
        .await;

        if self.state.state() != ProcState::Stopped {
            match self.send_signal(pid, Signal::SIGKILL) {
                Ok(()) => ex_event(
                    Level::Info,
                    "process",
                    Some(&self.name),
                    format!("operation=stop pid={pid} kill sent"),
                ),
                Err(e) => {
                    self.state.set_error(Some(format!("kill failed: {e}")));
                    ex_event(
                        Level::Error,
                        "process",
                        Some(&self.name),
                        format!("operation=stop pid={pid} kill failed err={e}"),
                    );
                }
            }
            // The wait task flips the state to Stopped once it reaps the child; give it a
            // bounded window so the probe below only fires for truly detached processes.
            for _ in 0..REAP_SETTLE_POLLS {
                if self.state.state() == ProcState::Stopped {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }

        if self.proc_alive(pid) {
            self.state.set_state(ProcState::Failed);
            self.state.set_exit_code(-1);
            ex_event(
                Level::Error,
                "process",
                Some(&self.name),
                format!("operation=stop pid={pid} process running detached"),
            );
        } else {
            ex_event(
                Level::Trace,
                "process",
                Some(&self.name),
                format!("operation=stop pid={pid} process gone"),
            );
        }
    }

    fn send_signal(&self, pid: i32, sig: Signal) -> anyhow::Result<()> {
        anyhow::ensure!(pid > 0, "no child pid recorded");
        signal::kill(Pid::from_raw(pid), sig)?;
        Ok(())
    }

    fn proc_alive(&self, pid: i32) -> bool {
        pid > 0 && self.proc_root.join(pid.to_string()).exists()
    }

    fn pump_pipe<R>(&self, pipe: R, tx: mpsc::Sender<String>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let name = self.name.clone();
        tasks().spawn(async move {
            let mut pipe = pipe;
            let mut buf = vec![0u8; PIPE_READ_BLOCK];
            loop {
                match pipe.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buf[..n]);
                        let mut closed = false;
                        // One ring entry per captured line; the trailing newline is noise.
                        for line in chunk.trim_end_matches('\n').split('\n') {
                            if tx.send(line.to_string()).await.is_err() {
                                closed = true;
                                break;
                            }
                        }
                        if closed {
                            break;
                        }
                    }
                    Err(e) => {
                        ex_event(
                            Level::Error,
                            "process",
                            Some(&name),
                            format!("pipe read failed err={e}"),
                        );
                        break;
                    }
                }
            }
        });
    }

    fn drain_channel(&self, mut rx: mpsc::Receiver<String>, is_stdout: bool) {
        let state = Arc::clone(&self.state);
        let sink = self.sink.clone();
        tasks().spawn(async move {
            while let Some(item) = rx.recv().await {
                if is_stdout {
                    state.add_stdout(&item);
                } else {
                    state.add_stderr(&item);
                }
                sink.write(&item);
            }
        });
    }

    /// Both user and group must be configured, resolvable, and non-root; anything else means
    /// the child inherits the supervisor's credentials.
    fn find_credential(&self) -> Option<(u32, u32)> {
        if self.app.user.is_empty() || self.app.group.is_empty() {
            return None;
        }
        let uid = users::get_user_by_name(&self.app.user).map(|u| u.uid())?;
        let gid = users::get_group_by_name(&self.app.group).map(|g| g.gid())?;
        if uid > 0 && gid > 0 {
            Some((uid, gid))
        } else {
            None
        }
    }
}

/// Build a Process from a stored definition: defensive copy plus a fresh state record sized
/// and formatted from the configuration.
pub fn build_process(app: &Application, cfg: &Configuration) -> anyhow::Result<Arc<Process>> {
    let snapshot = app.copy()?;
    let state = Arc::new(ProcessState::with_format(
        cfg.std_lines_count,
        &cfg.date_prefix,
        &cfg.date_layout,
        &cfg.date_suffix,
    ));
    Ok(Process::new(snapshot, state, cfg))
}

/// Control-plane snapshot of one process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcStatus {
    pub name: String,
    pub pid: i32,
    pub code: i32,
    pub error: String,
    pub state: String,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl ProcStatus {
    fn snapshot(proc: &Process) -> ProcStatus {
        ProcStatus {
            name: proc.name().to_string(),
            pid: proc.pid(),
            code: proc.exit_code(),
            error: proc.error().unwrap_or_default(),
            state: proc.state().as_str().to_string(),
            stdout: proc.stdout(),
            stderr: proc.stderr(),
        }
    }
}

/// Registry of managed processes. Operations dispatch into the per-process tasks and return
/// promptly; none of them wait for the underlying state machine to finish.
#[derive(Default)]
pub struct Manager {
    processes: Mutex<HashMap<String, Arc<Process>>>,
}

impl Manager {
    pub fn new() -> Manager {
        Manager::default()
    }

    /// Insert a process; an existing entry under the same name is replaced.
    pub fn append(&self, proc: Arc<Process>) {
        let mut map = self.processes.lock().unwrap_or_else(|p| p.into_inner());
        map.insert(proc.name().to_string(), proc);
    }

    /// Issue a stop on the named process and drop it from the registry. The stop escalation
    /// finishes in the background; delete does not wait for it.
    pub fn delete(&self, name: &str) {
        if let Some(proc) = self.get(name) {
            proc.stop();
            let mut map = self.processes.lock().unwrap_or_else(|p| p.into_inner());
            map.remove(name);
        }
    }

    fn get(&self, name: &str) -> Option<Arc<Process>> {
        let map = self.processes.lock().unwrap_or_else(|p| p.into_inner());
        map.get(name).cloned()
    }

    pub fn start(&self, name: &str) {
        if let Some(proc) = self.get(name) {
            proc.start();
        }
    }

    pub fn stop(&self, name: &str) {
        if let Some(proc) = self.get(name) {
            proc.stop();
        }
    }

    pub fn restart(&self, name: &str) {
        if let Some(proc) = self.get(name) {
            proc.restart();
        }
    }

    pub fn start_all(&self) {
        for proc in self.list() {
            proc.start();
        }
    }

    pub fn stop_all(&self) {
        for proc in self.list() {
            proc.stop();
        }
    }

    pub fn restart_all(&self) {
        for proc in self.list() {
            proc.restart();
        }
    }

    /// Point-in-time snapshot of the current members.
    pub fn list(&self) -> Vec<Arc<Process>> {
        let map = self.processes.lock().unwrap_or_else(|p| p.into_inner());
        map.values().cloned().collect()
    }

    pub fn status(&self, name: &str) -> Option<ProcStatus> {
        self.get(name).map(|proc| ProcStatus::snapshot(&proc))
    }

    pub fn status_all(&self) -> Vec<ProcStatus> {
        self.list()
            .iter()
            .map(|proc| ProcStatus::snapshot(proc))
            .collect()
    }
}
