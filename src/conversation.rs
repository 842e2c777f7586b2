use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::lenient;
use crate::rpc::{CancelToken, METHOD_LIST_TRAJECTORIES, RpcError, RpcTransport};

const LIST_TIMEOUT: Duration = Duration::from_secs(10);
const STATUS_RUNNING: &str = "CASCADE_RUN_STATUS_RUNNING";
const STATUS_IDLE: &str = "CASCADE_RUN_STATUS_IDLE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Idle,
    Other(String),
}

impl RunStatus {
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim() {
            STATUS_RUNNING => Self::Running,
            STATUS_IDLE => Self::Idle,
            "" => Self::Other("unknown".to_string()),
            other => Self::Other(other.to_string()),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Running => "running",
            Self::Idle => "idle",
            Self::Other(raw) => raw
                .strip_prefix("CASCADE_RUN_STATUS_")
                .unwrap_or(raw.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub cascade_id: String,
    pub trajectory_id: String,
    pub summary: String,
    pub step_count: u64,
    pub status: RunStatus,
    pub last_modified_time: String,
    pub created_time: String,
    pub requested_model: String,
    pub generator_model: String,
    pub workspace_uris: Vec<String>,
}

impl ConversationSummary {
    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }

    pub fn is_orphan(&self) -> bool {
        self.workspace_uris.is_empty()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ListResponse {
    #[serde(deserialize_with = "lenient::object")]
    trajectory_summaries: Option<BTreeMap<String, Value>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawSummary {
    #[serde(deserialize_with = "lenient::string")]
    trajectory_id: String,
    #[serde(deserialize_with = "lenient::string")]
    summary: String,
    #[serde(deserialize_with = "lenient::u64")]
    step_count: u64,
    #[serde(deserialize_with = "lenient::string")]
    status: String,
    #[serde(deserialize_with = "lenient::string")]
    last_modified_time: String,
    #[serde(deserialize_with = "lenient::string")]
    created_time: String,
    #[serde(deserialize_with = "lenient::object")]
    latest_task_boundary_step: Option<LatestStep>,
    #[serde(deserialize_with = "lenient::object")]
    latest_notify_user_step: Option<LatestStep>,
    #[serde(deserialize_with = "lenient::list")]
    workspaces: Vec<RawWorkspace>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LatestStep {
    #[serde(deserialize_with = "lenient::object")]
    step: Option<LatestStepBody>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LatestStepBody {
    #[serde(deserialize_with = "lenient::object")]
    metadata: Option<LatestStepMetadata>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct LatestStepMetadata {
    #[serde(deserialize_with = "lenient::string")]
    generator_model: String,
    #[serde(deserialize_with = "lenient::model_ref")]
    requested_model: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawWorkspace {
    #[serde(deserialize_with = "lenient::string")]
    workspace_folder_absolute_uri: String,
}

impl RawSummary {
    fn into_summary(self, cascade_id: String) -> ConversationSummary {
        let mut requested_model = String::new();
        let mut generator_model = String::new();
        // notify step is more recent than the task boundary, so it is applied last
        for latest in [&self.latest_task_boundary_step, &self.latest_notify_user_step] {
            let Some(meta) = latest
                .as_ref()
                .and_then(|latest| latest.step.as_ref())
                .and_then(|step| step.metadata.as_ref())
            else {
                continue;
            };
            if !meta.generator_model.is_empty() {
                generator_model = meta.generator_model.clone();
            }
            if !meta.requested_model.is_empty() {
                requested_model = meta.requested_model.clone();
            }
        }

        let summary = if self.summary.trim().is_empty() {
            cascade_id.clone()
        } else {
            self.summary
        };

        ConversationSummary {
            summary,
            trajectory_id: self.trajectory_id,
            step_count: self.step_count,
            status: RunStatus::from_raw(&self.status),
            last_modified_time: self.last_modified_time,
            created_time: self.created_time,
            requested_model,
            generator_model,
            workspace_uris: self
                .workspaces
                .into_iter()
                .map(|ws| ws.workspace_folder_absolute_uri)
                .filter(|uri| !uri.is_empty())
                .collect(),
            cascade_id,
        }
    }
}

pub fn list_conversations(
    rpc: &dyn RpcTransport,
    cancel: &CancelToken,
) -> Result<Vec<ConversationSummary>, RpcError> {
    let payload = json!({
        "metadata": { "ideName": "antigravity", "extensionName": "antigravity" }
    });
    let response = rpc.call(METHOD_LIST_TRAJECTORIES, &payload, LIST_TIMEOUT, cancel)?;
    Ok(parse_conversation_list(response))
}

pub fn parse_conversation_list(response: Value) -> Vec<ConversationSummary> {
    let Ok(parsed) = serde_json::from_value::<ListResponse>(response) else {
        return Vec::new();
    };
    let Some(summaries) = parsed.trajectory_summaries else {
        return Vec::new();
    };

    let mut conversations: Vec<ConversationSummary> = summaries
        .into_iter()
        .filter_map(|(cascade_id, raw)| {
            let raw: RawSummary = serde_json::from_value(raw).ok()?;
            Some(raw.into_summary(cascade_id))
        })
        .collect();

    conversations.sort_by(|a, b| {
        match (
            a.last_modified_time.is_empty(),
            b.last_modified_time.is_empty(),
        ) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => b.last_modified_time.cmp(&a.last_modified_time),
        }
    });
    conversations
}

pub fn normalize_uri(uri: &str) -> String {
    let stripped = if let Some(rest) = uri.strip_prefix("file:///") {
        format!("/{rest}")
    } else if let Some(rest) = uri.strip_prefix("file://") {
        rest.to_string()
    } else {
        uri.to_string()
    };

    let decoded = urlencoding::decode(&stripped)
        .map(|text| text.into_owned())
        .unwrap_or(stripped);
    let trimmed = decoded.strip_suffix('/').unwrap_or(&decoded);
    trimmed.to_lowercase()
}

/// The `--workspace_id` value the language server is launched with for a folder URI.
pub fn workspace_id_for_uri(uri: &str) -> String {
    uri.replacen(":///", "_", 1).replace('/', "_")
}

pub fn workspace_uri_from_path(path: &Path) -> String {
    let raw = path.to_string_lossy().replace('\\', "/");
    let encoded = raw
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/");
    if encoded.starts_with('/') {
        format!("file://{encoded}")
    } else {
        format!("file:///{encoded}")
    }
}

pub fn resolve_workspace_uri(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.contains("://") {
        return trimmed.to_string();
    }
    let path = Path::new(trimmed);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    workspace_uri_from_path(&absolute)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn conversation(id: &str, steps: u64, status: RunStatus, workspaces: &[&str]) -> ConversationSummary {
        ConversationSummary {
            cascade_id: id.to_string(),
            trajectory_id: String::new(),
            summary: id.to_string(),
            step_count: steps,
            status,
            last_modified_time: String::new(),
            created_time: String::new(),
            requested_model: String::new(),
            generator_model: String::new(),
            workspace_uris: workspaces.iter().map(|ws| ws.to_string()).collect(),
        }
    }
}
