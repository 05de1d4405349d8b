use chrono::{Local, Utc};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::ex::asyncutil::tasks;
use crate::ex::config::{Configuration, DEFAULT_LOG_FILE_NAME};

const EARLY_LOG_MAX_LINES: usize = 1000;
const STAMP_LAYOUT: &str = "%Y-%m-%d_%H:%M:%S%.3f";

static MIN_LEVEL: AtomicU8 = AtomicU8::new(0);
static LOCAL_TIME: AtomicBool = AtomicBool::new(true);
static LOG_TX: OnceLock<mpsc::UnboundedSender<LogMsg>> = OnceLock::new();
static EARLY_LOG: OnceLock<Mutex<VecDeque<String>>> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl Level {
    pub fn parse(raw: &str) -> Level {
        match raw {
            "debug" => Level::Debug,
            "info" => Level::Info,
            "warn" => Level::Warn,
            "error" => Level::Error,
            // "trace" and anything unrecognized log everything.
            _ => Level::Trace,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

enum LogMsg {
    Line(String),
    Rotate,
}

/// Apply the configured level and timestamp mode, then start the daemon log file task.
/// Events emitted before this point are buffered and flushed into the file once it opens.
pub fn init(cfg: &Configuration) {
    MIN_LEVEL.store(Level::parse(&cfg.log_level) as u8, Ordering::Relaxed);
    LOCAL_TIME.store(cfg.log_local_time, Ordering::Relaxed);
    start_log_file(cfg);
}

fn timestamp() -> String {
    if LOCAL_TIME.load(Ordering::Relaxed) {
        Local::now().format(STAMP_LAYOUT).to_string()
    } else {
        Utc::now().format(STAMP_LAYOUT).to_string()
    }
}

/// Emit one supervisor event: stamped line to stderr plus the daemon log file.
pub fn ex_event(level: Level, component: &str, app: Option<&str>, msg: impl AsRef<str>) {
    if (level as u8) < MIN_LEVEL.load(Ordering::Relaxed) {
        return;
    }
    let ts = timestamp();
    let line = match app {
        Some(a) => format!("{ts} {} [{component}] app={a} {}", level.as_str(), msg.as_ref()),
        None => format!("{ts} {} [{component}] {}", level.as_str(), msg.as_ref()),
    };
    eprintln!("{line}");
    if let Some(tx) = LOG_TX.get() {
        let _ = tx.send(LogMsg::Line(line));
    } else {
        let q = EARLY_LOG.get_or_init(|| Mutex::new(VecDeque::new()));
        let mut g = q.lock().unwrap_or_else(|p| p.into_inner());
        g.push_back(line);
        while g.len() > EARLY_LOG_MAX_LINES {
            g.pop_front();
        }
    }
}

/// Force a rotation of the daemon log file (SIGUSR1 handler).
pub fn request_log_rotation() {
    if let Some(tx) = LOG_TX.get() {
        let _ = tx.send(LogMsg::Rotate);
    }
}

fn start_log_file(cfg: &Configuration) {
    let base_path = Path::new(&cfg.log_path).join(DEFAULT_LOG_FILE_NAME);
    let max_bytes = cfg.log_max_size.saturating_mul(1024 * 1024);
    let backups = cfg.log_max_backups;
    let max_age_days = cfg.log_max_age;

    let (tx, mut rx) = mpsc::unbounded_channel::<LogMsg>();
    if LOG_TX.set(tx).is_err() {
        return;
    }

    ex_event(
        Level::Info,
        "log",
        None,
        format!(
            "daemon_log_file path={} max_bytes={max_bytes} backups={backups} max_age_days={max_age_days}",
            base_path.display()
        ),
    );

    tasks().spawn(async move {
        let mut f = match open_append(&base_path).await {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "{} ERROR [log] failed to open daemon log file {} err={e}",
                    timestamp(),
                    base_path.display()
                );
                // Keep draining so senders never see a closed channel.
                while rx.recv().await.is_some() {}
                return;
            }
        };

        // Flush early boot lines (config parse warnings and the like) into the file.
        if let Some(q) = EARLY_LOG.get() {
            let drained: Vec<String> = {
                let mut g = q.lock().unwrap_or_else(|p| p.into_inner());
                g.drain(..).collect()
            };
            for line in drained {
                let _ = f.write_all(line.as_bytes()).await;
                let _ = f.write_all(b"\n").await;
            }
            let _ = f.flush().await;
        }

        let mut bytes_written: u64 = tokio::fs::metadata(&base_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        while let Some(msg) = rx.recv().await {
            match msg {
                LogMsg::Line(line) => {
                    if max_bytes > 0 && bytes_written >= max_bytes {
                        let _ = f.flush().await;
                        if let Ok(nf) =
                            rotate_numbered_reopen(&base_path, backups, max_age_days).await
                        {
                            f = nf;
                            bytes_written = 0;
                        }
                    }
                    let mut s = line;
                    s.push('\n');
                    if f.write_all(s.as_bytes()).await.is_ok() {
                        bytes_written = bytes_written.saturating_add(s.len() as u64);
                    }
                }
                LogMsg::Rotate => {
                    let _ = f.flush().await;
                    if let Ok(nf) = rotate_numbered_reopen(&base_path, backups, max_age_days).await
                    {
                        f = nf;
                        bytes_written = 0;
                    }
                }
            }
        }
    });
}

async fn open_append(path: &Path) -> anyhow::Result<tokio::fs::File> {
    if let Some(dir) = path.parent() {
        let _ = tokio::fs::create_dir_all(dir).await;
    }
    let f = tokio::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .await?;
    Ok(f)
}

fn numbered(base: &Path, idx: usize) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(format!(".{idx}"));
    PathBuf::from(name)
}

/// Shift `base` into `base.1`, `base.1` into `base.2`, ... dropping everything beyond
/// `backups`, then reopen a fresh `base` for appending.
async fn rotate_numbered_reopen(
    base: &Path,
    backups: usize,
    max_age_days: u64,
) -> anyhow::Result<tokio::fs::File> {
    let keep = backups.max(1);
    let oldest = numbered(base, keep);
    if tokio::fs::try_exists(&oldest).await.unwrap_or(false) {
        let _ = tokio::fs::remove_file(&oldest).await;
    }
    for idx in (1..keep).rev() {
        let from = numbered(base, idx);
        if tokio::fs::try_exists(&from).await.unwrap_or(false) {
            let _ = tokio::fs::rename(&from, numbered(base, idx + 1)).await;
        }
    }
    if tokio::fs::try_exists(base).await.unwrap_or(false) {
        let _ = tokio::fs::rename(base, numbered(base, 1)).await;
    }
    prune_aged_backups(base, keep, max_age_days).await;
    open_append(base).await
}

/// Remove numbered backups whose mtime exceeds the configured age.
async fn prune_aged_backups(base: &Path, keep: usize, max_age_days: u64) {
    if max_age_days == 0 {
        return;
    }
    let cutoff = Duration::from_secs(max_age_days.saturating_mul(24 * 60 * 60));
    let now = SystemTime::now();
    for idx in 1..=keep {
        let path = numbered(base, idx);
        let Ok(meta) = tokio::fs::metadata(&path).await else {
            continue;
        };
        let Ok(modified) = meta.modified() else {
            continue;
        };
        if now.duration_since(modified).unwrap_or_default() > cutoff {
            let _ = tokio::fs::remove_file(&path).await;
        }
    }
}

/// Append-only sink for one application's captured output lines.
///
/// Writes go through a channel into a dedicated task, so the pipe drains never block on disk.
#[derive(Debug, Clone)]
pub struct AppLogSink {
    tx: mpsc::UnboundedSender<String>,
}

impl AppLogSink {
    pub fn open(log_dir: &Path, app: &str) -> AppLogSink {
        let path = log_dir.join(format!("app_{app}.log"));
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let app = app.to_string();
        tasks().spawn(async move {
            let mut f = match open_append(&path).await {
                Ok(f) => f,
                Err(e) => {
                    ex_event(
                        Level::Error,
                        "log",
                        Some(&app),
                        format!("failed to open app log {} err={e}", path.display()),
                    );
                    while rx.recv().await.is_some() {}
                    return;
                }
            };
            while let Some(line) = rx.recv().await {
                let s = format!("{} {line}\n", timestamp());
                let _ = f.write_all(s.as_bytes()).await;
            }
            let _ = f.flush().await;
        });
        AppLogSink { tx }
    }

    pub fn write(&self, line: &str) {
        let _ = self.tx.send(line.to_string());
    }
}
