//! Configuration for devpush
//!
//! Two layers of configuration exist:
//!
//! - [`Settings`] - tool-wide knobs (timeouts, bootstrap image), read from an
//!   optional TOML file and falling back to defaults.
//! - [`EnvInfo`] - per-project state persisted under `.devpush/env.yaml`:
//!   component identity, namespace, linked services and the last run mode.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Directory holding per-project state, relative to the project root
pub const STATE_DIR: &str = ".devpush";
const ENV_FILE: &str = "env.yaml";

/// Image of the init container that installs supervisord into the pod
pub const DEFAULT_BOOTSTRAP_IMAGE: &str = "quay.io/devpush/supervisord-init:1.1";

/// Port the debug program listens on unless the project sets one
pub const DEFAULT_DEBUG_PORT: i32 = 5858;

/// Execution posture of a component
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Run,
    Debug,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Run => write!(f, "run"),
            RunMode::Debug => write!(f, "debug"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Settings {
    /// Seconds to wait for a pod of the component to reach `Running`
    pub pod_timeout_secs: u64,
    /// Seconds to wait for the deployment rollout to complete
    pub rollout_timeout_secs: u64,
    /// Milliseconds the supervisor is given to report the program running
    pub supervisor_wait_ms: u64,
    /// Number of log lines shown when the supervised program is not running
    pub log_tail_lines: usize,
    pub bootstrap_image: String,
    /// Size requested for volume claims that do not declare one
    pub default_volume_size: String,
    /// Field manager used for server-side apply
    pub field_manager: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pod_timeout_secs: 240,
            rollout_timeout_secs: 300,
            supervisor_wait_ms: 1000,
            log_tail_lines: 20,
            bootstrap_image: DEFAULT_BOOTSTRAP_IMAGE.to_string(),
            default_volume_size: "1Gi".to_string(),
            field_manager: "devpush".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file; a missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(content)?;
        if settings.log_tail_lines == 0 {
            return Err(Error::ConfigError(
                "log-tail-lines must be greater than zero".to_string(),
            ));
        }
        Ok(settings)
    }

    pub fn pod_timeout(&self) -> Duration {
        Duration::from_secs(self.pod_timeout_secs)
    }

    pub fn rollout_timeout(&self) -> Duration {
        Duration::from_secs(self.rollout_timeout_secs)
    }

    pub fn supervisor_wait(&self) -> Duration {
        Duration::from_millis(self.supervisor_wait_ms)
    }
}

/// A service binding the component consumes secrets from
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvInfo {
    pub name: String,
    #[serde(default)]
    pub app: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_mode: Option<RunMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_port: Option<i32>,
    #[serde(default)]
    pub links: Vec<Link>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_push: Option<DateTime<Utc>>,

    #[serde(skip)]
    path: Option<PathBuf>,
}

impl EnvInfo {
    pub fn new(name: impl Into<String>, app: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            app: app.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Path of the env file for a project rooted at `context`
    pub fn file_path(context: &Path) -> PathBuf {
        context.join(STATE_DIR).join(ENV_FILE)
    }

    /// Read the env file, or `None` when the project has not been pushed yet.
    pub fn load(context: &Path) -> Result<Option<Self>> {
        let path = Self::file_path(context);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        let mut info: EnvInfo = serde_yaml::from_str(&content)?;
        info.path = Some(path);
        Ok(Some(info))
    }

    pub fn save(&self, context: &Path) -> Result<()> {
        let path = self
            .path
            .clone()
            .unwrap_or_else(|| Self::file_path(context));
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// Run mode recorded by the previous push; `Run` if never pushed.
    pub fn previous_run_mode(&self) -> RunMode {
        self.run_mode.unwrap_or_default()
    }

    pub fn record_push(&mut self, mode: RunMode) {
        self.run_mode = Some(mode);
        self.last_push = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults_when_file_missing() {
        let settings = Settings::load(Some(Path::new("/nonexistent/devpush.toml"))).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.supervisor_wait(), Duration::from_secs(1));
        assert_eq!(settings.log_tail_lines, 20);
    }

    #[test]
    fn test_settings_partial_toml_keeps_defaults() {
        let settings = Settings::from_toml("pod-timeout-secs = 30\n").unwrap();
        assert_eq!(settings.pod_timeout(), Duration::from_secs(30));
        assert_eq!(settings.rollout_timeout_secs, 300);
        assert_eq!(settings.bootstrap_image, DEFAULT_BOOTSTRAP_IMAGE);
    }

    #[test]
    fn test_settings_reject_zero_tail() {
        assert!(Settings::from_toml("log-tail-lines = 0\n").is_err());
    }

    #[test]
    fn test_env_info_round_trips_through_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(EnvInfo::load(dir.path()).unwrap().is_none());

        let mut info = EnvInfo::new("nodejs", "app", "dev");
        info.links.push(Link {
            name: "db-binding".to_string(),
        });
        info.record_push(RunMode::Debug);
        info.save(dir.path()).unwrap();

        let loaded = EnvInfo::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.name, "nodejs");
        assert_eq!(loaded.previous_run_mode(), RunMode::Debug);
        assert_eq!(loaded.links.len(), 1);
        assert!(loaded.last_push.is_some());
    }

    #[test]
    fn test_previous_run_mode_defaults_to_run() {
        let info = EnvInfo::new("nodejs", "app", "dev");
        assert_eq!(info.previous_run_mode(), RunMode::Run);
    }
}
