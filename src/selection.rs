use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::{debug, info};

use crate::conversation::{ConversationSummary, normalize_uri};
use crate::usage::ContextUsage;

pub const COMPRESSION_HOLD_POLLS: u8 = 3;
pub const CROSS_POLL_DROP_RATIO: f64 = 0.01;
pub const RECENT_CONVERSATIONS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionReason {
    Running,
    StepCountChanged,
    NewConversation,
    Sticky,
}

impl SelectionReason {
    pub fn label(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::StepCountChanged => "step count changed",
            Self::NewConversation => "new conversation",
            Self::Sticky => "tracked",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    NoConversations,
    Idle,
    Tracking {
        cascade_id: String,
        reason: SelectionReason,
    },
}

impl Selection {
    pub fn tracked_id(&self) -> Option<&str> {
        match self {
            Self::Tracking { cascade_id, .. } => Some(cascade_id),
            Self::NoConversations | Self::Idle => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageObservation {
    pub cascade_id: String,
    pub step_count: u64,
    pub context_used: u64,
    pub fresh_compression: bool,
    pub previous_context_used: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ContextBaseline {
    step_count: u64,
    context_used: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CompressionHold {
    remaining: u8,
    previous_context_used: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct SelectionState {
    tracked: Option<String>,
    previous_step_counts: HashMap<String, u64>,
    previous_ids: HashSet<String>,
    first_poll_done: bool,
    context_baselines: HashMap<String, ContextBaseline>,
    compression_holds: HashMap<String, CompressionHold>,
    last_known_model: Option<String>,
}

pub fn qualified_conversations<'a>(
    conversations: &'a [ConversationSummary],
    workspace: Option<&str>,
) -> Vec<&'a ConversationSummary> {
    let target = workspace
        .map(str::trim)
        .filter(|uri| !uri.is_empty())
        .map(normalize_uri);

    conversations
        .iter()
        .filter(|conversation| match &target {
            Some(target) => conversation
                .workspace_uris
                .iter()
                .any(|uri| normalize_uri(uri) == *target),
            None => conversation.is_orphan(),
        })
        .collect()
}

pub fn recent_scope<'a>(
    conversations: &'a [ConversationSummary],
    qualified: &[&'a ConversationSummary],
    limit: usize,
) -> Vec<&'a ConversationSummary> {
    if qualified.is_empty() {
        conversations.iter().take(limit).collect()
    } else {
        qualified.iter().take(limit).copied().collect()
    }
}

impl SelectionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_last_known_model(mut self, model: Option<String>) -> Self {
        self.last_known_model = model.filter(|model| !model.trim().is_empty());
        self
    }

    pub fn last_known_model(&self) -> Option<&str> {
        self.last_known_model.as_deref()
    }

    pub fn select(
        &self,
        conversations: &[ConversationSummary],
        workspace: Option<&str>,
    ) -> Selection {
        if conversations.is_empty() {
            return Selection::NoConversations;
        }

        let qualified = qualified_conversations(conversations, workspace);
        let tracked = self.tracked.as_deref();
        let prefer_tracked = |candidates: &[&ConversationSummary]| -> Option<String> {
            candidates
                .iter()
                .find(|c| Some(c.cascade_id.as_str()) == tracked)
                .or_else(|| candidates.first())
                .map(|c| c.cascade_id.clone())
        };

        let running: Vec<&ConversationSummary> =
            qualified.iter().copied().filter(|c| c.is_running()).collect();
        if let Some(cascade_id) = prefer_tracked(&running) {
            return Selection::Tracking {
                cascade_id,
                reason: SelectionReason::Running,
            };
        }

        if self.first_poll_done {
            let changed: Vec<&ConversationSummary> = qualified
                .iter()
                .copied()
                .filter(|c| {
                    self.previous_step_counts
                        .get(&c.cascade_id)
                        .is_some_and(|previous| *previous != c.step_count)
                })
                .collect();
            if let Some(cascade_id) = prefer_tracked(&changed) {
                return Selection::Tracking {
                    cascade_id,
                    reason: SelectionReason::StepCountChanged,
                };
            }

            if let Some(created) = qualified
                .iter()
                .find(|c| !self.previous_ids.contains(&c.cascade_id))
            {
                return Selection::Tracking {
                    cascade_id: created.cascade_id.clone(),
                    reason: SelectionReason::NewConversation,
                };
            }
        }

        match tracked {
            Some(id) if qualified.iter().any(|c| c.cascade_id == id) => Selection::Tracking {
                cascade_id: id.to_string(),
                reason: SelectionReason::Sticky,
            },
            _ => Selection::Idle,
        }
    }

    pub fn observe(&self, usage: &mut ContextUsage) -> UsageObservation {
        let id = usage.cascade_id.as_str();
        let baseline = self.context_baselines.get(id).copied();
        let previous_used = baseline.map(|baseline| baseline.context_used);
        // the baseline may predate an undo that happened while unobserved
        let rewound = baseline.is_some_and(|baseline| usage.step_count < baseline.step_count)
            || self
                .previous_step_counts
                .get(id)
                .is_some_and(|previous| usage.step_count < *previous);

        let threshold = usage.context_limit as f64 * CROSS_POLL_DROP_RATIO;
        let cross_poll = match previous_used {
            Some(previous) if !rewound && previous > usage.context_used => {
                (previous - usage.context_used) as f64 > threshold
            }
            _ => false,
        };

        if cross_poll {
            usage.compression_detected = true;
            usage.previous_context_used = previous_used;
            info!(
                cascade_id = id,
                previous = previous_used.unwrap_or(0),
                current = usage.context_used,
                "context dropped between polls; treating as compression"
            );
        }

        let fresh = cross_poll || usage.compression_detected;
        if !fresh
            && let Some(hold) = self.compression_holds.get(id)
            && hold.remaining > 0
        {
            usage.compression_detected = true;
            if usage.previous_context_used.is_none() {
                usage.previous_context_used = hold.previous_context_used;
            }
        }

        UsageObservation {
            cascade_id: usage.cascade_id.clone(),
            step_count: usage.step_count,
            context_used: usage.context_used,
            fresh_compression: fresh,
            previous_context_used: usage.previous_context_used,
        }
    }

    pub fn commit(
        &mut self,
        selection: &Selection,
        conversations: &[ConversationSummary],
        observations: &[UsageObservation],
        model: Option<&str>,
    ) -> bool {
        let tracked = selection.tracked_id().map(str::to_string);
        if tracked != self.tracked {
            debug!(
                from = self.tracked.as_deref().unwrap_or("none"),
                to = tracked.as_deref().unwrap_or("none"),
                "tracked conversation changed"
            );
        }
        self.tracked = tracked;

        for observation in observations {
            self.context_baselines.insert(
                observation.cascade_id.clone(),
                ContextBaseline {
                    step_count: observation.step_count,
                    context_used: observation.context_used,
                },
            );
            if observation.fresh_compression {
                self.compression_holds.insert(
                    observation.cascade_id.clone(),
                    CompressionHold {
                        remaining: COMPRESSION_HOLD_POLLS,
                        previous_context_used: observation.previous_context_used,
                    },
                );
            } else if let Some(hold) = self.compression_holds.get_mut(&observation.cascade_id) {
                hold.remaining = hold.remaining.saturating_sub(1);
                if hold.remaining == 0 {
                    self.compression_holds.remove(&observation.cascade_id);
                }
            }
        }

        self.previous_step_counts = conversations
            .iter()
            .map(|c| (c.cascade_id.clone(), c.step_count))
            .collect();
        self.previous_ids = conversations.iter().map(|c| c.cascade_id.clone()).collect();
        self.first_poll_done = true;

        let present = &self.previous_ids;
        self.context_baselines.retain(|id, _| present.contains(id));
        self.compression_holds.retain(|id, _| present.contains(id));

        match model.map(str::trim).filter(|model| !model.is_empty()) {
            Some(model) if self.last_known_model.as_deref() != Some(model) => {
                self.last_known_model = Some(model.to_string());
                true
            }
            _ => false,
        }
    }
}
