use anyhow::Context as _;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal as unix_signal, SignalKind};

use crate::ex::asyncutil::tasks;
use crate::ex::config::Configuration;
use crate::ex::logging::{self, ex_event, Level};
use crate::ex::process::{build_process, Manager};
use crate::ex::rest::{self, RestState};
use crate::ex::store::AppStore;

pub const EXIT_OK: i32 = 0;
pub const EXIT_LISTEN_FAILURE: i32 = 1;
pub const EXIT_ZOMBIE: i32 = 2;

/// Run the supervisor until a termination signal lands. Returns the process exit code; the
/// binary turns anything non-zero into `std::process::exit`.
pub async fn run_daemon(cfg: Configuration, config_dir: &Path) -> anyhow::Result<i32> {
    logging::init(&cfg);
    write_pid_file(&cfg);

    let store = Arc::new(AppStore::open(cfg.applications_path(config_dir)));
    let manager = Arc::new(Manager::new());
    let mut max_timeout = 0u64;
    for app in store.list() {
        match build_process(&app, &cfg) {
            Ok(proc) => {
                if app.timeout > max_timeout {
                    max_timeout = app.timeout;
                }
                manager.append(proc);
            }
            Err(e) => ex_event(
                Level::Error,
                "daemon",
                Some(&app.name),
                format!("skip application due error err={e}"),
            ),
        }
    }

    let shutting_down = Arc::new(AtomicBool::new(false));
    let state = RestState {
        store: Arc::clone(&store),
        manager: Arc::clone(&manager),
        config: Arc::new(cfg.clone()),
    };

    manager.start_all();

    if let Err(e) = rest::start(state, &cfg, Arc::clone(&shutting_down)).await {
        ex_event(
            Level::Error,
            "rest",
            None,
            format!("can not start listener port={} err={e}", cfg.listen_port),
        );
        return Ok(EXIT_LISTEN_FAILURE);
    }

    ex_event(
        Level::Info,
        "daemon",
        None,
        format!("exorsus started pid={}", std::process::id()),
    );

    let drain_secs = max_timeout.saturating_add(cfg.shutdown_timeout);
    let code = signal_loop(&manager, Arc::clone(&shutting_down), drain_secs).await?;
    ex_event(
        Level::Debug,
        "daemon",
        None,
        format!(
            "background tasks active={} spawned_total={}",
            tasks().active_count(),
            tasks().total_spawned()
        ),
    );
    if code == EXIT_OK {
        clear_pid_file(&cfg);
        ex_event(Level::Info, "daemon", None, "exorsus stopped");
    }
    Ok(code)
}

/// Block on OS signals. USR1 rotates the daemon log, HUP is logged, INT/TERM run the shutdown
/// sequence and end the loop.
async fn signal_loop(
    manager: &Manager,
    shutting_down: Arc<AtomicBool>,
    drain_secs: u64,
) -> anyhow::Result<i32> {
    let mut term = unix_signal(SignalKind::terminate()).context("SIGTERM handler")?;
    let mut int = unix_signal(SignalKind::interrupt()).context("SIGINT handler")?;
    let mut hup = unix_signal(SignalKind::hangup()).context("SIGHUP handler")?;
    let mut usr1 = unix_signal(SignalKind::user_defined1()).context("SIGUSR1 handler")?;

    loop {
        tokio::select! {
            _ = term.recv() => {
                ex_event(Level::Info, "signals", None, "signal=SIGTERM received");
                break;
            }
            _ = int.recv() => {
                ex_event(Level::Info, "signals", None, "signal=SIGINT received");
                break;
            }
            _ = hup.recv() => {
                ex_event(Level::Info, "signals", None, "signal=SIGHUP received");
            }
            _ = usr1.recv() => {
                ex_event(Level::Info, "signals", None, "signal=SIGUSR1 received, rotating log");
                logging::request_log_rotation();
            }
        }
    }

    Ok(run_shutdown(manager, &shutting_down, drain_secs).await)
}

/// Stop everything, let the HTTP server drain, wait out the bounded window, then classify
/// survivors. A zombie forces exit code 2 so init systems notice the leak.
pub async fn run_shutdown(
    manager: &Manager,
    shutting_down: &AtomicBool,
    drain_secs: u64,
) -> i32 {
    manager.stop_all();
    shutting_down.store(true, Ordering::Relaxed);
    ex_event(
        Level::Info,
        "signals",
        None,
        format!("waiting for the processes to complete drain_secs={drain_secs}"),
    );
    tokio::time::sleep(Duration::from_secs(drain_secs)).await;
    for proc in manager.list() {
        if proc.zombie() {
            ex_event(
                Level::Error,
                "signals",
                Some(proc.name()),
                format!("found zombie process pid={}, force exit", proc.pid()),
            );
            return EXIT_ZOMBIE;
        }
    }
    EXIT_OK
}

fn write_pid_file(cfg: &Configuration) {
    let path = cfg.pid_file_path();
    if let Err(e) = std::fs::write(&path, std::process::id().to_string()) {
        ex_event(
            Level::Warn,
            "daemon",
            None,
            format!("can not write pid file path={} err={e}", path.display()),
        );
    }
}

fn clear_pid_file(cfg: &Configuration) {
    let path = cfg.pid_file_path();
    if let Err(e) = std::fs::write(&path, "") {
        ex_event(
            Level::Warn,
            "daemon",
            None,
            format!("can not truncate pid file path={} err={e}", path.display()),
        );
    }
}
