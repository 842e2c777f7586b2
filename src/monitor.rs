use std::collections::BTreeMap;
use std::path::PathBuf;
use std::thread;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::conversation::{ConversationSummary, list_conversations};
use crate::discovery::{Connection, Locator};
use crate::models::{ModelCatalog, fetch_model_configs, resolve_context_limit};
use crate::rpc::{CancelToken, Endpoint, RpcError, RpcTransport};
use crate::selection::{
    Selection, SelectionReason, SelectionState, UsageObservation, qualified_conversations,
    recent_scope,
};
use crate::state::MonitorState;
use crate::usage::{ContextUsage, get_context_usage};

#[derive(Error, Debug)]
pub enum PollError {
    #[error("no Antigravity language server found")]
    NotFound,

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl PollError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Rpc(err) if err.is_cancelled())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum DisplayState {
    Disconnected,
    NoConversations {
        context_limit: u64,
        model: Option<String>,
    },
    Idle {
        context_limit: u64,
        model: Option<String>,
    },
    Active {
        reason: SelectionReason,
        current: ContextUsage,
        recent: Vec<ContextUsage>,
    },
}

impl DisplayState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::NoConversations { .. } => "no conversations",
            Self::Idle { .. } => "idle",
            Self::Active { .. } => "active",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MonitorSettings {
    pub workspace_uri: Option<String>,
    pub context_limits: BTreeMap<String, i64>,
    pub max_recent: usize,
}

pub struct Monitor {
    locator: Box<dyn Locator>,
    connection: Option<Connection>,
    selection: SelectionState,
    catalog: ModelCatalog,
    settings: MonitorSettings,
    state: MonitorState,
    state_path: Option<PathBuf>,
}

impl Monitor {
    pub fn new(locator: Box<dyn Locator>, settings: MonitorSettings) -> Self {
        Self {
            locator,
            connection: None,
            selection: SelectionState::new(),
            catalog: ModelCatalog::new(),
            settings,
            state: MonitorState::default(),
            state_path: None,
        }
    }

    pub fn with_persistence(mut self, path: PathBuf) -> Self {
        self.state = MonitorState::load(&path);
        let remembered = self
            .state
            .last_known_model(self.settings.workspace_uri.as_deref())
            .map(str::to_string);
        self.selection = SelectionState::new().with_last_known_model(remembered);
        self.state_path = Some(path);
        self
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.connection.as_ref().map(|connection| &connection.endpoint)
    }

    pub fn invalidate(&mut self) {
        if let Some(connection) = self.connection.take() {
            info!(endpoint = %connection.endpoint.describe(), "language server endpoint dropped");
        }
    }

    pub fn poll(&mut self, cancel: &CancelToken) -> Result<DisplayState, PollError> {
        let result = self.poll_once(cancel);
        if let Err(err) = &result {
            if !err.is_cancelled() {
                warn!(error = %err, "poll failed");
            }
            self.invalidate();
        }
        result
    }

    fn poll_once(&mut self, cancel: &CancelToken) -> Result<DisplayState, PollError> {
        let (connection, conversations) = self.list(cancel)?;
        let workspace = self.settings.workspace_uri.clone();
        let selection = self.selection.select(&conversations, workspace.as_deref());

        let (cascade_id, reason) = match &selection {
            Selection::Tracking { cascade_id, reason } => (cascade_id.clone(), *reason),
            Selection::NoConversations | Selection::Idle => {
                self.finish(&selection, &conversations, &[], None);
                return Ok(self.empty_state(&selection));
            }
        };
        let Some(conversation) = conversations.iter().find(|c| c.cascade_id == cascade_id) else {
            self.finish(&Selection::Idle, &conversations, &[], None);
            return Ok(self.empty_state(&Selection::Idle));
        };

        let rpc = connection.rpc.as_ref();
        let mut current = get_context_usage(
            rpc,
            conversation,
            &self.settings.context_limits,
            &self.catalog,
            cancel,
        )?;
        let mut observations = vec![self.selection.observe(&mut current)];

        let mut recent = self.recent_usages(rpc, &conversations, &current, cancel)?;
        for usage in recent
            .iter_mut()
            .filter(|usage| usage.cascade_id != current.cascade_id)
        {
            observations.push(self.selection.observe(usage));
        }

        let model = current.model.clone();
        self.finish(&selection, &conversations, &observations, Some(&model));
        Ok(DisplayState::Active {
            reason,
            current,
            recent,
        })
    }

    fn empty_state(&self, selection: &Selection) -> DisplayState {
        let model = self.selection.last_known_model();
        let context_limit =
            resolve_context_limit(model.unwrap_or_default(), &self.settings.context_limits).limit;
        let model = model.map(|model| self.catalog.display_name(model));
        match selection {
            Selection::NoConversations => DisplayState::NoConversations {
                context_limit,
                model,
            },
            _ => DisplayState::Idle {
                context_limit,
                model,
            },
        }
    }

    fn finish(
        &mut self,
        selection: &Selection,
        conversations: &[ConversationSummary],
        observations: &[UsageObservation],
        model: Option<&str>,
    ) {
        let changed = self
            .selection
            .commit(selection, conversations, observations, model);
        if !changed {
            return;
        }
        let Some(model) = self.selection.last_known_model() else {
            return;
        };
        let workspace = self.settings.workspace_uri.as_deref();
        if self.state.remember_model(workspace, model)
            && let Some(path) = &self.state_path
            && let Err(err) = self.state.save(path)
        {
            warn!(error = %err, "failed to persist monitor state");
        }
    }

    fn connect(&mut self, cancel: &CancelToken) -> Result<Connection, PollError> {
        if let Some(connection) = &self.connection {
            return Ok(connection.clone());
        }
        cancel.check()?;
        let connection = self
            .locator
            .locate(self.settings.workspace_uri.as_deref(), cancel)
            .ok_or(PollError::NotFound)?;
        self.enrich_catalog(connection.rpc.as_ref(), cancel);
        self.connection = Some(connection.clone());
        Ok(connection)
    }

    fn enrich_catalog(&mut self, rpc: &dyn RpcTransport, cancel: &CancelToken) {
        match fetch_model_configs(rpc, cancel) {
            Ok(configs) => {
                let added = self.catalog.enrich(&configs);
                debug!(added, known = self.catalog.len(), "model catalog enriched");
            }
            Err(err) => debug!(error = %err, "model metadata unavailable; using built-in names"),
        }
    }

    fn list(
        &mut self,
        cancel: &CancelToken,
    ) -> Result<(Connection, Vec<ConversationSummary>), PollError> {
        let was_cached = self.connection.is_some();
        let connection = self.connect(cancel)?;
        match list_conversations(connection.rpc.as_ref(), cancel) {
            Ok(conversations) => Ok((connection, conversations)),
            Err(err) if was_cached && !err.is_cancelled() => {
                warn!(error = %err, "listing failed on cached endpoint; rediscovering");
                self.invalidate();
                let connection = self.connect(cancel)?;
                let conversations = list_conversations(connection.rpc.as_ref(), cancel)?;
                Ok((connection, conversations))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn recent_usages(
        &self,
        rpc: &dyn RpcTransport,
        conversations: &[ConversationSummary],
        current: &ContextUsage,
        cancel: &CancelToken,
    ) -> Result<Vec<ContextUsage>, RpcError> {
        if self.settings.max_recent == 0 {
            return Ok(Vec::new());
        }
        let qualified =
            qualified_conversations(conversations, self.settings.workspace_uri.as_deref());
        let scope = recent_scope(conversations, &qualified, self.settings.max_recent);
        let limits = &self.settings.context_limits;
        let catalog = &self.catalog;

        let computed: Vec<Option<ContextUsage>> = thread::scope(|s| {
            let handles: Vec<_> = scope
                .iter()
                .map(|&conversation| {
                    (conversation.cascade_id != current.cascade_id).then(|| {
                        s.spawn(move || {
                            get_context_usage(rpc, conversation, limits, catalog, cancel)
                        })
                    })
                })
                .collect();

            handles
                .into_iter()
                .zip(&scope)
                .map(|(handle, conversation)| {
                    let Some(handle) = handle else {
                        return Some(current.clone());
                    };
                    match handle.join() {
                        Ok(Ok(usage)) => Some(usage),
                        Ok(Err(err)) => {
                            debug!(
                                cascade_id = %conversation.cascade_id,
                                error = %err,
                                "skipping recent conversation"
                            );
                            None
                        }
                        Err(_) => {
                            debug!(cascade_id = %conversation.cascade_id, "recent usage worker panicked");
                            None
                        }
                    }
                })
                .collect()
        });

        cancel.check()?;
        Ok(computed.into_iter().flatten().collect())
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::usage::fakes::FakeServer;

    #[derive(Default)]
    pub struct FakeLocator {
        pub servers: Mutex<Vec<Arc<FakeServer>>>,
        pub calls: Arc<AtomicUsize>,
    }

    impl FakeLocator {
        pub fn serving(servers: Vec<Arc<FakeServer>>) -> Self {
            Self {
                servers: Mutex::new(servers),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl Locator for FakeLocator {
        fn locate(&self, _workspace_hint: Option<&str>, cancel: &CancelToken) -> Option<Connection> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if cancel.is_cancelled() {
                return None;
            }
            let mut servers = self.servers.lock().expect("servers lock");
            let server = if servers.len() > 1 {
                servers.remove(0)
            } else {
                servers.first().cloned()?
            };
            Some(Connection {
                endpoint: Endpoint {
                    pid: 4242,
                    port: 50_000 + servers.len() as u16,
                    csrf_token: "fake".to_string(),
                    use_tls: true,
                },
                rpc: server,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    use serde_json::{Value, json};

    use super::fakes::FakeLocator;
    use super::*;
    use crate::estimator::estimate_tokens;
    use crate::models::DEFAULT_CONTEXT_LIMIT;
    use crate::steps::{STEP_TYPE_CHECKPOINT, STEP_TYPE_PLANNER_RESPONSE, STEP_TYPE_USER_INPUT};
    use crate::usage::fakes::FakeServer;

    const WS: &str = "file:///ws";

    fn listing(entries: &[(&str, u64, &str, &str)]) -> Value {
        let mut summaries = serde_json::Map::new();
        for (index, (id, steps, status, workspace)) in entries.iter().enumerate() {
            summaries.insert(
                id.to_string(),
                json!({
                    "summary": format!("conversation {id}"),
                    "stepCount": steps,
                    "status": status,
                    "lastModifiedTime": format!("2026-03-0{}T10:00:00Z", 9 - index),
                    "workspaces": [{"workspaceFolderAbsoluteUri": workspace}],
                }),
            );
        }
        json!({ "trajectorySummaries": summaries })
    }

    fn scenario_steps() -> Vec<Value> {
        vec![
            json!({"type": STEP_TYPE_USER_INPUT, "userInput": {"userResponse": "hello"}}),
            json!({
                "type": STEP_TYPE_CHECKPOINT,
                "metadata": {"modelUsage": {
                    "model": "MODEL_PLACEHOLDER_M26",
                    "inputTokens": "500",
                    "outputTokens": "20"
                }}
            }),
            json!({"type": STEP_TYPE_PLANNER_RESPONSE, "plannerResponse": {"response": "ok"}}),
        ]
    }

    fn server(list: Value) -> Arc<FakeServer> {
        let server = FakeServer::default().with_steps("A", scenario_steps());
        *server.listing.lock().expect("listing lock") = Some(list);
        Arc::new(server)
    }

    fn settings() -> MonitorSettings {
        MonitorSettings {
            workspace_uri: Some(WS.to_string()),
            context_limits: BTreeMap::new(),
            max_recent: 5,
        }
    }

    #[test]
    fn running_conversation_in_workspace_becomes_active() {
        let server = server(listing(&[("A", 3, "CASCADE_RUN_STATUS_RUNNING", WS)]));
        let mut monitor = Monitor::new(Box::new(FakeLocator::serving(vec![server])), settings());

        let state = monitor.poll(&CancelToken::new()).expect("poll");
        let DisplayState::Active {
            reason,
            current,
            recent,
        } = state
        else {
            panic!("expected active state, got {state:?}");
        };
        assert_eq!(reason, SelectionReason::Running);
        assert_eq!(current.cascade_id, "A");
        assert_eq!(current.context_used, 500 + 20 + estimate_tokens("ok"));
        assert!(current.is_estimated);
        assert_eq!(current.context_limit, 200_000);
        assert_eq!(current.model_display_name, "Claude Opus 4.6 (Thinking)");
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0], current);
        assert!(monitor.endpoint().is_some());
    }

    #[test]
    fn missing_server_is_not_found() {
        let mut monitor = Monitor::new(Box::new(FakeLocator::default()), settings());
        let err = monitor.poll(&CancelToken::new()).expect_err("no server");
        assert!(matches!(err, PollError::NotFound));
        assert!(monitor.endpoint().is_none());
    }

    #[test]
    fn empty_listing_reports_no_conversations_with_default_limit() {
        let server = server(json!({"trajectorySummaries": {}}));
        let mut monitor = Monitor::new(Box::new(FakeLocator::serving(vec![server])), settings());
        let state = monitor.poll(&CancelToken::new()).expect("poll");
        assert_eq!(
            state,
            DisplayState::NoConversations {
                context_limit: DEFAULT_CONTEXT_LIMIT,
                model: None,
            }
        );
    }

    #[test]
    fn idle_display_uses_the_remembered_model() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        let mut saved = MonitorState::default();
        saved.remember_model(Some(WS), "MODEL_PLACEHOLDER_M26");
        saved.save(&path).expect("save");

        let server = server(listing(&[("A", 3, "CASCADE_RUN_STATUS_IDLE", WS)]));
        let mut monitor = Monitor::new(Box::new(FakeLocator::serving(vec![server])), settings())
            .with_persistence(path);
        let state = monitor.poll(&CancelToken::new()).expect("poll");
        assert_eq!(
            state,
            DisplayState::Idle {
                context_limit: 200_000,
                model: Some("Claude Opus 4.6 (Thinking)".to_string()),
            }
        );
    }

    #[test]
    fn active_model_is_persisted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        let server = server(listing(&[("A", 3, "CASCADE_RUN_STATUS_RUNNING", WS)]));
        let mut monitor = Monitor::new(Box::new(FakeLocator::serving(vec![server])), settings())
            .with_persistence(path.clone());
        monitor.poll(&CancelToken::new()).expect("poll");

        let reloaded = MonitorState::load(&path);
        assert_eq!(reloaded.last_known_model(Some(WS)), Some("MODEL_PLACEHOLDER_M26"));
    }

    #[test]
    fn listing_failure_on_cached_endpoint_rediscovers_once() {
        let first = server(listing(&[("A", 3, "CASCADE_RUN_STATUS_RUNNING", WS)]));
        let second = server(listing(&[("A", 3, "CASCADE_RUN_STATUS_RUNNING", WS)]));
        let locator = FakeLocator::serving(vec![Arc::clone(&first), second]);
        let calls = Arc::clone(&locator.calls);
        let mut monitor = Monitor::new(Box::new(locator), settings());

        monitor.poll(&CancelToken::new()).expect("first poll");
        *first.fail_listing.lock().expect("listing lock") = true;
        let state = monitor.poll(&CancelToken::new()).expect("retried poll");
        assert_eq!(state.label(), "active");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn listing_failure_on_fresh_endpoint_fails_the_cycle() {
        let down = server(json!({}));
        *down.fail_listing.lock().expect("listing lock") = true;
        let mut monitor = Monitor::new(Box::new(FakeLocator::serving(vec![down])), settings());
        let err = monitor.poll(&CancelToken::new()).expect_err("listing down");
        assert!(matches!(err, PollError::Rpc(RpcError::Transport { .. })));
        assert!(monitor.endpoint().is_none());
    }

    #[test]
    fn recent_list_covers_other_workspace_conversations() {
        let server = server(listing(&[
            ("A", 3, "CASCADE_RUN_STATUS_RUNNING", WS),
            ("B", 60, "CASCADE_RUN_STATUS_IDLE", WS),
            ("C", 1, "CASCADE_RUN_STATUS_IDLE", "file:///elsewhere"),
        ]));
        server.fail_batch("B", 50);
        let mut monitor = Monitor::new(Box::new(FakeLocator::serving(vec![server])), settings());

        let state = monitor.poll(&CancelToken::new()).expect("poll");
        let DisplayState::Active { recent, .. } = state else {
            panic!("expected active state");
        };
        let ids: Vec<&str> = recent.iter().map(|usage| usage.cascade_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);
        assert!(recent[1].has_gaps);
    }

    #[test]
    fn recent_list_can_be_disabled() {
        let server = server(listing(&[("A", 3, "CASCADE_RUN_STATUS_RUNNING", WS)]));
        let mut monitor = Monitor::new(
            Box::new(FakeLocator::serving(vec![server])),
            MonitorSettings {
                max_recent: 0,
                ..settings()
            },
        );
        let DisplayState::Active { recent, .. } = monitor.poll(&CancelToken::new()).expect("poll")
        else {
            panic!("expected active state");
        };
        assert!(recent.is_empty());
    }

    #[test]
    fn cancelled_poll_is_reported_as_cancelled() {
        let server = server(listing(&[("A", 3, "CASCADE_RUN_STATUS_RUNNING", WS)]));
        let mut monitor = Monitor::new(Box::new(FakeLocator::serving(vec![server])), settings());
        monitor.poll(&CancelToken::new()).expect("first poll");

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = monitor.poll(&cancel).expect_err("cancelled");
        assert!(err.is_cancelled());
    }

    #[test]
    fn display_state_serializes_with_a_state_tag() {
        let state = DisplayState::Idle {
            context_limit: 200_000,
            model: None,
        };
        let value = serde_json::to_value(&state).expect("serialize");
        assert_eq!(value["state"], "idle");
        assert_eq!(value["contextLimit"], 200_000);
    }
}
