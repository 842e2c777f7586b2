use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_POLL_SECONDS: u64 = 5;
const DEFAULT_MAX_RECENT: usize = 5;
const MAX_RECENT_CAP: usize = 10;
const CONFIG_SCHEMA_VERSION: u32 = 1;

pub const HOME_ENV: &str = "ANTIGRAVITY_MONITOR_HOME";
pub const POLL_SECONDS_ENV: &str = "ANTIGRAVITY_MONITOR_POLL_SECONDS";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    pub schema_version: u32,
    pub polling_interval_secs: u64,
    pub context_limits: BTreeMap<String, i64>,
    pub workspace: Option<String>,
    pub display: DisplayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DisplayConfig {
    pub show_recent: bool,
    pub max_recent: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct RuntimeSettings {
    pub poll_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            polling_interval_secs: DEFAULT_POLL_SECONDS,
            context_limits: BTreeMap::new(),
            workspace: None,
            display: DisplayConfig::default(),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            show_recent: true,
            max_recent: DEFAULT_MAX_RECENT,
        }
    }
}

impl MonitorConfig {
    pub fn load_or_init() -> Result<Self> {
        Self::load_or_init_at(&config_path())
    }

    pub fn load_or_init_at(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let mut parsed: MonitorConfig = serde_json::from_str(&raw)
                .with_context(|| format!("invalid JSON in {}", path.display()))?;
            if parsed.normalize_and_migrate() {
                parsed.save_to(path)?;
            }
            Ok(parsed)
        } else {
            let cfg = MonitorConfig::default();
            cfg.save_to(path)?;
            Ok(cfg)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory {}", parent.display())
            })?;
        }

        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn recent_limit(&self) -> usize {
        if self.display.show_recent {
            self.display.max_recent
        } else {
            0
        }
    }

    fn normalize_and_migrate(&mut self) -> bool {
        let mut changed = false;

        if self.schema_version < CONFIG_SCHEMA_VERSION {
            self.schema_version = CONFIG_SCHEMA_VERSION;
            changed = true;
        }

        if self.polling_interval_secs == 0 {
            self.polling_interval_secs = 1;
            changed = true;
        }

        let normalized: BTreeMap<String, i64> = self
            .context_limits
            .iter()
            .filter(|(model, _)| !model.trim().is_empty())
            .map(|(model, limit)| (model.trim().to_string(), (*limit).max(1)))
            .collect();
        if normalized != self.context_limits {
            self.context_limits = normalized;
            changed = true;
        }

        if self
            .workspace
            .as_deref()
            .is_some_and(|workspace| workspace.trim().is_empty())
        {
            self.workspace = None;
            changed = true;
        }

        if self.display.max_recent > MAX_RECENT_CAP {
            self.display.max_recent = MAX_RECENT_CAP;
            changed = true;
        }

        changed
    }
}

pub fn runtime_settings(config: &MonitorConfig) -> RuntimeSettings {
    let seconds = env_u64(POLL_SECONDS_ENV, config.polling_interval_secs).max(1);
    RuntimeSettings {
        poll_interval: Duration::from_secs(seconds),
    }
}

pub fn monitor_home() -> PathBuf {
    if let Ok(custom) = env::var(HOME_ENV) {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".antigravity-context-monitor")
}

pub fn config_path() -> PathBuf {
    monitor_home().join("config.json")
}

pub fn state_path() -> PathBuf {
    monitor_home().join("state.json")
}

pub fn log_path() -> PathBuf {
    monitor_home().join("monitor.log")
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_load_writes_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.json");

        let cfg = MonitorConfig::load_or_init_at(&path).expect("load");
        assert_eq!(cfg, MonitorConfig::default());
        assert!(path.exists());
        assert_eq!(cfg.polling_interval_secs, 5);
        assert_eq!(cfg.recent_limit(), 5);
    }

    #[test]
    fn partial_files_are_filled_and_normalized() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{
                "schema_version": 0,
                "polling_interval_secs": 0,
                "context_limits": {" MODEL_X ": 0, "": 5, "MODEL_Y": 64000},
                "workspace": "  ",
                "display": {"max_recent": 50}
            }"#,
        )
        .expect("write");

        let cfg = MonitorConfig::load_or_init_at(&path).expect("load");
        assert_eq!(cfg.schema_version, CONFIG_SCHEMA_VERSION);
        assert_eq!(cfg.polling_interval_secs, 1);
        assert_eq!(cfg.context_limits.get("MODEL_X"), Some(&1));
        assert_eq!(cfg.context_limits.get("MODEL_Y"), Some(&64_000));
        assert_eq!(cfg.context_limits.len(), 2);
        assert_eq!(cfg.workspace, None);
        assert!(cfg.display.show_recent);
        assert_eq!(cfg.display.max_recent, MAX_RECENT_CAP);

        let rewritten = fs::read_to_string(&path).expect("read back");
        assert!(rewritten.contains("\"MODEL_X\": 1"));
    }

    #[test]
    fn invalid_json_is_reported_with_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, "{oops").expect("write");
        let err = MonitorConfig::load_or_init_at(&path).expect_err("invalid");
        assert!(format!("{err:#}").contains("invalid JSON"));
    }

    #[test]
    fn hidden_recent_list_has_no_limit() {
        let cfg = MonitorConfig {
            display: DisplayConfig {
                show_recent: false,
                max_recent: 5,
            },
            ..MonitorConfig::default()
        };
        assert_eq!(cfg.recent_limit(), 0);
    }

    #[test]
    fn runtime_interval_is_floored_at_one_second() {
        let cfg = MonitorConfig {
            polling_interval_secs: 0,
            ..MonitorConfig::default()
        };
        if env::var_os(POLL_SECONDS_ENV).is_none() {
            assert_eq!(runtime_settings(&cfg).poll_interval, Duration::from_secs(1));
        }
    }
}
