use serde::Serialize;
use serde_json::ser::{PrettyFormatter, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::ex::app::Application;
use crate::ex::logging::{ex_event, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    AlreadyExists,
    NotFound,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::AlreadyExists => f.write_str("already exist"),
            StoreError::NotFound => f.write_str("not found"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Serialize with the applications-file conventions: 4-space indented JSON.
pub(crate) fn to_pretty_json<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let mut buf = Vec::new();
    let fmt = PrettyFormatter::with_indent(b"    ");
    let mut ser = Serializer::with_formatter(&mut buf, fmt);
    value.serialize(&mut ser)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

pub(crate) fn write_file_0664(path: &Path, contents: &str) -> std::io::Result<()> {
    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o664)
        .open(path)?;
    f.write_all(contents.as_bytes())
}

/// Durable registry of Application definitions.
///
/// The map lock covers only in-memory mutation; the file lock covers only disk I/O, so
/// lookups never queue behind a rewrite in flight.
pub struct AppStore {
    path: PathBuf,
    applications: Mutex<HashMap<String, Application>>,
    io_lock: Mutex<()>,
}

impl AppStore {
    pub fn open(path: impl Into<PathBuf>) -> AppStore {
        let store = AppStore {
            path: path.into(),
            applications: Mutex::new(HashMap::new()),
            io_lock: Mutex::new(()),
        };
        store.load();
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) {
        let raw = {
            let _io = self.io_lock.lock().unwrap_or_else(|p| p.into_inner());
            match std::fs::read_to_string(&self.path) {
                Ok(raw) => raw,
                Err(e) => {
                    ex_event(
                        Level::Error,
                        "storage",
                        None,
                        format!(
                            "can not load applications file path={} err={e}",
                            self.path.display()
                        ),
                    );
                    return;
                }
            }
        };
        let apps: Vec<Application> = match serde_json::from_str(&raw) {
            Ok(apps) => apps,
            Err(e) => {
                ex_event(
                    Level::Error,
                    "storage",
                    None,
                    format!(
                        "can not decode applications file path={} err={e}",
                        self.path.display()
                    ),
                );
                return;
            }
        };
        let mut map = self.applications.lock().unwrap_or_else(|p| p.into_inner());
        for app in apps {
            map.insert(app.name.clone(), app);
        }
    }

    pub fn add(&self, app: Application) -> Result<(), StoreError> {
        {
            let mut map = self.applications.lock().unwrap_or_else(|p| p.into_inner());
            if map.contains_key(&app.name) {
                return Err(StoreError::AlreadyExists);
            }
            map.insert(app.name.clone(), app);
        }
        self.persist();
        Ok(())
    }

    /// Upsert under `app.name`; a rename drops the old key first.
    pub fn update(&self, name: &str, app: Application) -> Result<(), StoreError> {
        {
            let mut map = self.applications.lock().unwrap_or_else(|p| p.into_inner());
            if !map.contains_key(name) {
                return Err(StoreError::NotFound);
            }
            if name != app.name {
                map.remove(name);
            }
            map.insert(app.name.clone(), app);
        }
        self.persist();
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Application> {
        let map = self.applications.lock().unwrap_or_else(|p| p.into_inner());
        map.get(name).cloned()
    }

    pub fn delete(&self, name: &str) -> Result<(), StoreError> {
        {
            let mut map = self.applications.lock().unwrap_or_else(|p| p.into_inner());
            if map.remove(name).is_none() {
                return Err(StoreError::NotFound);
            }
        }
        self.persist();
        Ok(())
    }

    pub fn list(&self) -> Vec<Application> {
        let map = self.applications.lock().unwrap_or_else(|p| p.into_inner());
        map.values().cloned().collect()
    }

    /// Rewrite the whole file from the current map. Failures are logged, never propagated;
    /// the in-memory mutation stands either way.
    pub fn persist(&self) {
        let apps: Vec<Application> = {
            let map = self.applications.lock().unwrap_or_else(|p| p.into_inner());
            map.values().cloned().collect()
        };
        let pretty = if apps.is_empty() {
            "[]".to_string()
        } else {
            match to_pretty_json(&apps) {
                Ok(pretty) => pretty,
                Err(e) => {
                    ex_event(
                        Level::Error,
                        "storage",
                        None,
                        format!(
                            "can not build JSON for applications path={} err={e}",
                            self.path.display()
                        ),
                    );
                    return;
                }
            }
        };
        let _io = self.io_lock.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = write_file_0664(&self.path, &pretty) {
            ex_event(
                Level::Error,
                "storage",
                None,
                format!(
                    "can not write applications file path={} err={e}",
                    self.path.display()
                ),
            );
        }
    }
}
