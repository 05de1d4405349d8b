use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub name: String,
    pub value: String,
}

/// Operator-registered description of a program to manage.
///
/// `arguments` is a single whitespace-separated string, split at spawn time with no quoting.
/// `timeout` is the number of seconds to wait between the graceful stop signal and the kill
/// escalation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub arguments: String,
    #[serde(default)]
    pub timeout: u64,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub environment: Vec<Environment>,
}

impl Application {
    /// Deep copy via a JSON round-trip.
    ///
    /// Processes hold their own Application snapshot; edits to the stored definition must not
    /// reach a running child.
    pub fn copy(&self) -> anyhow::Result<Application> {
        let raw = serde_json::to_string(self)?;
        Ok(serde_json::from_str(&raw)?)
    }
}
