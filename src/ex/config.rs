use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::ex::logging::{ex_event, Level};
use crate::ex::store;

pub const DEFAULT_CONFIG_FILE_NAME: &str = "config.json";
pub const DEFAULT_APPLICATIONS_FILE_NAME: &str = "applications.json";
pub const DEFAULT_LOG_FILE_NAME: &str = "exorsus.log";

/// Supervisor configuration, read from `<config dir>/config.json`.
///
/// Every key is optional and falls back to its default; unknown keys are ignored. On a missing
/// or unreadable file the defaults are written back so operators have a template to edit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Configuration {
    pub log_path: String,
    pub log_level: String,
    /// Daemon log rotation threshold, MiB.
    pub log_max_size: u64,
    pub log_max_backups: usize,
    /// Rotated files older than this many days are pruned.
    pub log_max_age: u64,
    pub log_local_time: bool,
    /// Capacity of each process's stdout/stderr ring.
    pub std_lines_count: usize,
    /// Extra seconds added to the largest app timeout for the shutdown drain window.
    pub shutdown_timeout: u64,
    pub listen_port: u16,
    pub date_layout: String,
    pub date_prefix: String,
    pub date_suffix: String,
    pub pid_path: String,
    pub pid_file_name: String,
}

impl Default for Configuration {
    fn default() -> Configuration {
        Configuration {
            log_path: "./log/".to_string(),
            log_level: "info".to_string(),
            log_max_size: 10,
            log_max_backups: 30,
            log_max_age: 28,
            log_local_time: true,
            std_lines_count: 500,
            shutdown_timeout: 4,
            listen_port: 5202,
            date_layout: "%Y-%m-%d %H:%M:%S".to_string(),
            date_prefix: "[".to_string(),
            date_suffix: "]".to_string(),
            pid_path: "/tmp/".to_string(),
            pid_file_name: "exorsus.pid".to_string(),
        }
    }
}

impl Configuration {
    pub fn load(config_dir: &Path) -> Configuration {
        let path = config_dir.join(DEFAULT_CONFIG_FILE_NAME);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) => {
                ex_event(
                    Level::Warn,
                    "config",
                    None,
                    format!("configuration load error path={} err={e}", path.display()),
                );
                return Configuration::default().write_back(config_dir);
            }
        };
        match serde_json::from_str(&raw) {
            Ok(cfg) => cfg,
            Err(e) => {
                ex_event(
                    Level::Warn,
                    "config",
                    None,
                    format!("configuration decode error path={} err={e}", path.display()),
                );
                Configuration::default().write_back(config_dir)
            }
        }
    }

    /// First-run path: create the config and log directories and save the defaults.
    fn write_back(self, config_dir: &Path) -> Configuration {
        if let Err(e) = fs::create_dir_all(config_dir) {
            ex_event(
                Level::Error,
                "config",
                None,
                format!(
                    "can not create configuration directory path={} err={e}",
                    config_dir.display()
                ),
            );
            return self;
        }
        if let Err(e) = fs::create_dir_all(&self.log_path) {
            ex_event(
                Level::Error,
                "config",
                None,
                format!("can not create log directory path={} err={e}", self.log_path),
            );
        }
        let path = config_dir.join(DEFAULT_CONFIG_FILE_NAME);
        match store::to_pretty_json(&self) {
            Ok(pretty) => {
                if let Err(e) = store::write_file_0664(&path, &pretty) {
                    ex_event(
                        Level::Error,
                        "config",
                        None,
                        format!("can not save defaults path={} err={e}", path.display()),
                    );
                }
            }
            Err(e) => {
                ex_event(
                    Level::Error,
                    "config",
                    None,
                    format!("can not marshal configuration err={e}"),
                );
            }
        }
        self
    }

    pub fn applications_path(&self, config_dir: &Path) -> PathBuf {
        config_dir.join(DEFAULT_APPLICATIONS_FILE_NAME)
    }

    pub fn pid_file_path(&self) -> PathBuf {
        Path::new(&self.pid_path).join(&self.pid_file_name)
    }
}
