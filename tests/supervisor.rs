use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use exorsus::ex::app::Application;
use exorsus::ex::config::Configuration;
use exorsus::ex::daemon::{run_shutdown, EXIT_OK, EXIT_ZOMBIE};
use exorsus::ex::process::{build_process, Manager, Process};
use exorsus::ex::status::{ProcState, ProcessState};

struct TestEnv {
    tmp: tempfile::TempDir,
    cfg: Configuration,
}

impl TestEnv {
    fn new() -> TestEnv {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cfg = Configuration {
            log_path: tmp.path().to_string_lossy().into_owned(),
            ..Configuration::default()
        };
        TestEnv { tmp, cfg }
    }

    fn with_ring(mut self, lines: usize) -> TestEnv {
        self.cfg.std_lines_count = lines;
        self
    }

    fn path(&self) -> &Path {
        self.tmp.path()
    }

    /// Drop an executable shell script into the sandbox and return its path.
    fn script(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.path().join(name);
        std::fs::write(&path, contents).expect("write script");
        let mut perms = std::fs::metadata(&path).expect("stat script").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod script");
        path
    }
}

fn app(name: &str, command: &str, arguments: &str, timeout: u64) -> Application {
    Application {
        name: name.to_string(),
        command: command.to_string(),
        arguments: arguments.to_string(),
        timeout,
        user: String::new(),
        group: String::new(),
        environment: Vec::new(),
    }
}

async fn wait_for<F: FnMut() -> bool>(timeout: Duration, mut f: F) {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timeout waiting for condition");
}

fn proc_present(pid: i32) -> bool {
    pid > 0 && Path::new("/proc").join(pid.to_string()).exists()
}

#[tokio::test(flavor = "multi_thread")]
async fn start_echo_runs_to_completion_and_captures_output() {
    let env = TestEnv::new();
    let proc = build_process(&app("echo1", "/bin/echo", "hello world", 1), &env.cfg).unwrap();

    proc.start();
    wait_for(Duration::from_secs(2), || {
        proc.pid() > 0 && proc.state() == ProcState::Stopped
    })
    .await;

    assert_eq!(proc.exit_code(), 0);
    assert!(proc.error().is_none());
    let stdout = proc.stdout();
    assert_eq!(stdout.len(), 1, "stdout: {stdout:?}");
    assert!(stdout[0].ends_with("hello world"));
    assert!(stdout[0].starts_with('['), "timestamp prefix: {}", stdout[0]);
    assert!(proc.stderr().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn environment_reaches_the_child() {
    let env = TestEnv::new();
    let script = env.script("env.sh", "#!/bin/sh\necho \"$GREETING\"\n");
    let mut definition = app("envy", script.to_str().unwrap(), "", 1);
    definition.environment.push(exorsus::ex::app::Environment {
        name: "GREETING".to_string(),
        value: "from-exorsus".to_string(),
    });
    let proc = build_process(&definition, &env.cfg).unwrap();

    proc.start();
    wait_for(Duration::from_secs(2), || {
        proc.pid() > 0 && proc.state() == ProcState::Stopped
    })
    .await;

    let stdout = proc.stdout();
    assert_eq!(stdout.len(), 1);
    assert!(stdout[0].ends_with("from-exorsus"), "stdout: {stdout:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn graceful_stop_interrupts_a_sleeping_child() {
    let env = TestEnv::new();
    let proc = build_process(&app("s", "/bin/sleep", "60", 2), &env.cfg).unwrap();

    proc.start();
    wait_for(Duration::from_secs(2), || proc.state() == ProcState::Started).await;
    let pid = proc.pid();
    assert!(pid > 0);

    proc.stop();
    // SIGINT lands immediately; the wait task flips the state as soon as the child is reaped.
    wait_for(Duration::from_secs(3), || proc.state() == ProcState::Stopped).await;
    wait_for(Duration::from_secs(2), || !proc_present(pid)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_escalates_to_kill_for_an_interrupt_immune_child() {
    let env = TestEnv::new();
    // An ignored SIGINT stays ignored across exec, so the sleep itself shrugs it off.
    let script = env.script("trap.sh", "#!/bin/sh\ntrap '' INT\nexec sleep 60\n");
    let proc = build_process(&app("trap", script.to_str().unwrap(), "", 0), &env.cfg).unwrap();

    proc.start();
    wait_for(Duration::from_secs(2), || proc.state() == ProcState::Started).await;
    let pid = proc.pid();

    proc.stop();
    // The escalation sleeps timeout (0) + 10 fixed grace seconds before SIGKILL.
    wait_for(Duration::from_secs(14), || proc.state() == ProcState::Stopped).await;
    wait_for(Duration::from_secs(2), || !proc_present(pid)).await;
    assert!(!proc.zombie());
}

#[tokio::test(flavor = "multi_thread")]
async fn second_start_on_a_started_process_changes_nothing() {
    let env = TestEnv::new();
    let proc = build_process(&app("s2", "/bin/sleep", "30", 1), &env.cfg).unwrap();

    proc.start();
    wait_for(Duration::from_secs(2), || proc.state() == ProcState::Started).await;
    let pid = proc.pid();

    proc.start();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(proc.state(), ProcState::Started);
    assert_eq!(proc.pid(), pid);

    proc.stop();
    wait_for(Duration::from_secs(3), || proc.state() == ProcState::Stopped).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn second_stop_on_a_stopped_process_changes_nothing() {
    let env = TestEnv::new();
    let proc = build_process(&app("once", "/bin/echo", "done", 1), &env.cfg).unwrap();

    proc.start();
    wait_for(Duration::from_secs(2), || {
        proc.pid() > 0 && proc.state() == ProcState::Stopped
    })
    .await;
    let code = proc.exit_code();

    proc.stop();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(proc.state(), ProcState::Stopped);
    assert_eq!(proc.exit_code(), code);
}

#[tokio::test(flavor = "multi_thread")]
async fn spawn_failure_records_the_error() {
    let env = TestEnv::new();
    let proc = build_process(
        &app("ghost", "/nonexistent/binary", "", 1),
        &env.cfg,
    )
    .unwrap();

    proc.start();
    wait_for(Duration::from_secs(2), || {
        proc.state() == ProcState::Stopped && proc.error().is_some()
    })
    .await;
    assert_eq!(proc.exit_code(), -1);
    assert!(proc.error().unwrap().contains("spawn failed"));
}

#[tokio::test(flavor = "multi_thread")]
async fn ring_keeps_the_last_lines_of_a_chatty_child() {
    let env = TestEnv::new().with_ring(10);
    let script = env.script(
        "count.sh",
        "#!/bin/sh\ni=1\nwhile [ $i -le 100 ]; do echo \"line $i\"; i=$((i+1)); done\n",
    );
    let proc = build_process(&app("chatty", script.to_str().unwrap(), "", 1), &env.cfg).unwrap();

    proc.start();
    wait_for(Duration::from_secs(3), || {
        proc.pid() > 0 && proc.state() == ProcState::Stopped
    })
    .await;
    // The drains may still be flushing the channel right after the state flips.
    wait_for(Duration::from_secs(2), || {
        proc.stdout()
            .last()
            .map(|l| l.ends_with("line 100"))
            .unwrap_or(false)
    })
    .await;

    let stdout = proc.stdout();
    assert_eq!(stdout.len(), 10, "stdout: {stdout:?}");
    for (offset, line) in stdout.iter().enumerate() {
        assert!(
            line.ends_with(&format!("line {}", 91 + offset)),
            "unexpected line {line:?}"
        );
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_produces_a_fresh_child() {
    let env = TestEnv::new();
    let proc = build_process(&app("r", "/bin/sleep", "30", 0), &env.cfg).unwrap();

    proc.start();
    wait_for(Duration::from_secs(2), || proc.state() == ProcState::Started).await;
    let first_pid = proc.pid();

    proc.restart();
    // Restart stops (SIGINT + the 10s fixed grace) before the new child comes up.
    wait_for(Duration::from_secs(14), || {
        proc.state() == ProcState::Started && proc.pid() != first_pid
    })
    .await;

    proc.stop();
    wait_for(Duration::from_secs(3), || proc.state() == ProcState::Stopped).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_reports_a_zombie_survivor() {
    let env = TestEnv::new();
    let manager = Manager::new();
    let state = Arc::new(ProcessState::new(10));
    let proc = Process::with_proc_root(
        app("undead", "/bin/true", "", 0),
        Arc::clone(&state),
        &env.cfg,
        env.path().to_path_buf(),
    );
    manager.append(proc);

    let flag = AtomicBool::new(false);
    assert_eq!(run_shutdown(&manager, &flag, 0).await, EXIT_OK);

    // Simulate a child that survived the escalation: probe entry present, state Failed.
    state.set_pid(4242);
    state.set_state(ProcState::Failed);
    std::fs::create_dir(env.path().join("4242")).unwrap();

    let flag = AtomicBool::new(false);
    assert_eq!(run_shutdown(&manager, &flag, 0).await, EXIT_ZOMBIE);
}

mod rest_update {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use exorsus::ex::rest::{build_router, RestState};
    use exorsus::ex::store::AppStore;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    #[tokio::test(flavor = "multi_thread")]
    async fn update_while_running_starts_the_replacement() {
        let env = TestEnv::new();
        let state = RestState {
            store: Arc::new(AppStore::open(env.path().join("applications.json"))),
            manager: Arc::new(Manager::new()),
            config: Arc::new(env.cfg.clone()),
        };
        let router = build_router(state.clone());

        let create = serde_json::to_string(&app("run", "/bin/sleep", "30", 1)).unwrap();
        let resp = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/applications/")
                    .header("content-type", "application/json")
                    .body(Body::from(create))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        state.manager.start("run");
        wait_for(Duration::from_secs(2), || {
            state
                .manager
                .status("run")
                .map(|s| s.state == "Started")
                .unwrap_or(false)
        })
        .await;
        let old_pid = state.manager.status("run").unwrap().pid;

        let update = serde_json::to_string(&app("run", "/bin/sleep", "5", 1)).unwrap();
        let resp = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/applications/run")
                    .header("content-type", "application/json")
                    .body(Body::from(update))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], "run");

        wait_for(Duration::from_secs(2), || {
            state
                .manager
                .status("run")
                .map(|s| s.state == "Started" && s.pid != old_pid && s.pid > 0)
                .unwrap_or(false)
        })
        .await;

        state.manager.stop_all();
        wait_for(Duration::from_secs(3), || {
            state
                .manager
                .status("run")
                .map(|s| s.state == "Stopped")
                .unwrap_or(false)
        })
        .await;
    }
}
