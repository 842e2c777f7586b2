use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::lenient;
use crate::rpc::{CancelToken, METHOD_USER_STATUS, RpcError, RpcTransport};

pub const DEFAULT_CONTEXT_LIMIT: u64 = 1_000_000;
pub const UNKNOWN_MODEL_LABEL: &str = "Unknown Model";

const USER_STATUS_TIMEOUT: Duration = Duration::from_secs(10);

const BUILTIN_MODELS: [(&str, &str, u64); 6] = [
    ("MODEL_PLACEHOLDER_M37", "Gemini 3.1 Pro (High)", 1_000_000),
    ("MODEL_PLACEHOLDER_M36", "Gemini 3.1 Pro (Low)", 1_000_000),
    ("MODEL_PLACEHOLDER_M18", "Gemini 3 Flash", 1_000_000),
    ("MODEL_PLACEHOLDER_M35", "Claude Sonnet 4.6 (Thinking)", 200_000),
    ("MODEL_PLACEHOLDER_M26", "Claude Opus 4.6 (Thinking)", 200_000),
    ("MODEL_OPENAI_GPT_OSS_120B_MEDIUM", "GPT-OSS 120B (Medium)", 128_000),
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LimitSource {
    Override,
    Catalog,
    #[default]
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitResolution {
    pub limit: u64,
    pub source: LimitSource,
}

pub fn resolve_context_limit(model_id: &str, overrides: &BTreeMap<String, i64>) -> LimitResolution {
    let key = model_id.trim();

    if let Some(value) = overrides.get(key) {
        return LimitResolution {
            limit: (*value).max(1) as u64,
            source: LimitSource::Override,
        };
    }

    if let Some(limit) = builtin_context_limit(key) {
        return LimitResolution {
            limit,
            source: LimitSource::Catalog,
        };
    }

    LimitResolution {
        limit: DEFAULT_CONTEXT_LIMIT,
        source: LimitSource::Default,
    }
}

fn builtin_context_limit(model_id: &str) -> Option<u64> {
    BUILTIN_MODELS
        .iter()
        .find(|(id, _, _)| *id == model_id)
        .map(|(_, _, limit)| *limit)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayNameSource {
    Catalog,
    RawModelId,
    Unknown,
}

pub const DISPLAY_NAME_ORDER: [DisplayNameSource; 3] = [
    DisplayNameSource::Catalog,
    DisplayNameSource::RawModelId,
    DisplayNameSource::Unknown,
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModelConfig {
    #[serde(deserialize_with = "lenient::model_ref")]
    pub model_or_alias: String,
    #[serde(deserialize_with = "lenient::string")]
    pub label: String,
    #[serde(deserialize_with = "lenient::bool")]
    pub supports_images: bool,
}

#[derive(Debug, Clone)]
pub struct ModelCatalog {
    display_names: HashMap<String, String>,
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelCatalog {
    pub fn new() -> Self {
        let display_names = BUILTIN_MODELS
            .iter()
            .map(|(id, label, _)| (id.to_string(), label.to_string()))
            .collect();
        Self { display_names }
    }

    pub fn enrich(&mut self, configs: &[ModelConfig]) -> usize {
        let mut added = 0;
        for config in configs {
            let id = config.model_or_alias.trim();
            let label = config.label.trim();
            if id.is_empty() || label.is_empty() || self.display_names.contains_key(id) {
                continue;
            }
            self.display_names.insert(id.to_string(), label.to_string());
            added += 1;
        }
        added
    }

    pub fn display_name(&self, model_id: &str) -> String {
        let model_id = model_id.trim();
        DISPLAY_NAME_ORDER
            .iter()
            .find_map(|source| self.resolve_from(*source, model_id))
            .unwrap_or_else(|| UNKNOWN_MODEL_LABEL.to_string())
    }

    fn resolve_from(&self, source: DisplayNameSource, model_id: &str) -> Option<String> {
        match source {
            DisplayNameSource::Catalog => self.display_names.get(model_id).cloned(),
            DisplayNameSource::RawModelId => {
                (!model_id.is_empty()).then(|| model_id.to_string())
            }
            DisplayNameSource::Unknown => Some(UNKNOWN_MODEL_LABEL.to_string()),
        }
    }

    pub fn len(&self) -> usize {
        self.display_names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.display_names.is_empty()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct UserStatusResponse {
    #[serde(deserialize_with = "lenient::object")]
    user_status: Option<UserStatus>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct UserStatus {
    #[serde(deserialize_with = "lenient::object")]
    cascade_model_config_data: Option<CascadeModelConfigData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct CascadeModelConfigData {
    #[serde(deserialize_with = "lenient::list")]
    client_model_configs: Vec<ModelConfig>,
}

pub fn parse_model_configs(response: Value) -> Vec<ModelConfig> {
    serde_json::from_value::<UserStatusResponse>(response)
        .ok()
        .and_then(|response| response.user_status)
        .and_then(|status| status.cascade_model_config_data)
        .map(|data| data.client_model_configs)
        .unwrap_or_default()
}

pub fn fetch_model_configs(
    rpc: &dyn RpcTransport,
    cancel: &CancelToken,
) -> Result<Vec<ModelConfig>, RpcError> {
    let payload = json!({
        "metadata": { "ideName": "antigravity", "extensionName": "antigravity" }
    });
    let response = rpc.call(METHOD_USER_STATUS, &payload, USER_STATUS_TIMEOUT, cancel)?;
    Ok(parse_model_configs(response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_limits_resolve_from_catalog() {
        let overrides = BTreeMap::new();
        let resolved = resolve_context_limit("MODEL_PLACEHOLDER_M26", &overrides);
        assert_eq!(resolved.limit, 200_000);
        assert_eq!(resolved.source, LimitSource::Catalog);

        let resolved = resolve_context_limit("MODEL_OPENAI_GPT_OSS_120B_MEDIUM", &overrides);
        assert_eq!(resolved.limit, 128_000);
    }

    #[test]
    fn unknown_models_use_default_limit() {
        let resolved = resolve_context_limit("MODEL_SOMETHING_NEW", &BTreeMap::new());
        assert_eq!(resolved.limit, DEFAULT_CONTEXT_LIMIT);
        assert_eq!(resolved.source, LimitSource::Default);
        assert_eq!(resolve_context_limit("", &BTreeMap::new()).limit, DEFAULT_CONTEXT_LIMIT);
    }

    #[test]
    fn overrides_win_and_are_clamped() {
        let mut overrides = BTreeMap::new();
        overrides.insert("MODEL_PLACEHOLDER_M26".to_string(), 500_000);
        overrides.insert("MODEL_BROKEN".to_string(), -20);

        let resolved = resolve_context_limit("MODEL_PLACEHOLDER_M26", &overrides);
        assert_eq!(resolved.limit, 500_000);
        assert_eq!(resolved.source, LimitSource::Override);
        assert_eq!(resolve_context_limit("MODEL_BROKEN", &overrides).limit, 1);
    }

    #[test]
    fn display_name_falls_back_through_the_chain() {
        let catalog = ModelCatalog::new();
        assert_eq!(catalog.display_name("MODEL_PLACEHOLDER_M37"), "Gemini 3.1 Pro (High)");
        assert_eq!(catalog.display_name("MODEL_CUSTOM"), "MODEL_CUSTOM");
        assert_eq!(catalog.display_name(""), UNKNOWN_MODEL_LABEL);
    }

    #[test]
    fn enrichment_never_overrides_existing_names() {
        let mut catalog = ModelCatalog::new();
        let before = catalog.len();
        let added = catalog.enrich(&[
            ModelConfig {
                model_or_alias: "MODEL_PLACEHOLDER_M37".to_string(),
                label: "Renamed".to_string(),
                supports_images: true,
            },
            ModelConfig {
                model_or_alias: "MODEL_NEW".to_string(),
                label: "Shiny New Model".to_string(),
                supports_images: false,
            },
            ModelConfig::default(),
        ]);
        assert_eq!(added, 1);
        assert_eq!(catalog.len(), before + 1);
        assert_eq!(catalog.display_name("MODEL_PLACEHOLDER_M37"), "Gemini 3.1 Pro (High)");
        assert_eq!(catalog.display_name("MODEL_NEW"), "Shiny New Model");
    }

    #[test]
    fn user_status_response_is_parsed_defensively() {
        let response = json!({
            "userStatus": {
                "cascadeModelConfigData": {
                    "clientModelConfigs": [
                        {"modelOrAlias": {"model": "MODEL_A"}, "label": "Model A", "supportsImages": true},
                        {"label": "No id"},
                        "junk"
                    ]
                }
            }
        });
        let configs = parse_model_configs(response);
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].model_or_alias, "MODEL_A");
        assert!(configs[0].supports_images);
        assert_eq!(configs[1].model_or_alias, "");

        assert!(parse_model_configs(json!({"userStatus": null})).is_empty());
    }
}
