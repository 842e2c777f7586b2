use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::conversation::normalize_uri;

const NO_WORKSPACE_KEY: &str = "<no-workspace>";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorState {
    pub last_known_models: BTreeMap<String, String>,
}

pub fn workspace_key(workspace_uri: Option<&str>) -> String {
    workspace_uri
        .map(str::trim)
        .filter(|uri| !uri.is_empty())
        .map(normalize_uri)
        .unwrap_or_else(|| NO_WORKSPACE_KEY.to_string())
}

impl MonitorState {
    pub fn load(path: &Path) -> Self {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to read monitor state");
                return Self::default();
            }
        };
        serde_json::from_str(&raw).unwrap_or_else(|err| {
            warn!(path = %path.display(), error = %err, "ignoring corrupt monitor state");
            Self::default()
        })
    }

    pub fn last_known_model(&self, workspace_uri: Option<&str>) -> Option<&str> {
        self.last_known_models
            .get(&workspace_key(workspace_uri))
            .map(String::as_str)
    }

    pub fn remember_model(&mut self, workspace_uri: Option<&str>, model: &str) -> bool {
        let model = model.trim();
        if model.is_empty() {
            return false;
        }
        let key = workspace_key(workspace_uri);
        if self.last_known_models.get(&key).map(String::as_str) == Some(model) {
            return false;
        }
        self.last_known_models.insert(key, model.to_string());
        true
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create state directory {}", parent.display())
            })?;
        }
        let data = serde_json::to_string_pretty(self)?;
        let tmp = tmp_path(path);
        fs::write(&tmp, data).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("failed to move {} into place", path.display()))?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remembered_model_survives_a_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.json");

        let mut state = MonitorState::load(&path);
        assert_eq!(state, MonitorState::default());
        assert!(state.remember_model(Some("file:///Users/me/Proj/"), "MODEL_PLACEHOLDER_M26"));
        state.save(&path).expect("save");
        assert!(!path.with_file_name("state.json.tmp").exists());

        let reloaded = MonitorState::load(&path);
        assert_eq!(
            reloaded.last_known_model(Some("file:///users/me/proj")),
            Some("MODEL_PLACEHOLDER_M26")
        );
        assert_eq!(reloaded.last_known_model(None), None);
    }

    #[test]
    fn unchanged_or_blank_models_are_not_rewritten() {
        let mut state = MonitorState::default();
        assert!(state.remember_model(None, "M1"));
        assert!(!state.remember_model(None, "M1"));
        assert!(!state.remember_model(None, "   "));
        assert_eq!(state.last_known_model(None), Some("M1"));
    }

    #[test]
    fn corrupt_state_is_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        fs::write(&path, "{not json").expect("write");
        assert_eq!(MonitorState::load(&path), MonitorState::default());
    }
}
