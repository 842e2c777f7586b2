use std::collections::BTreeMap;
use std::ops::Range;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::conversation::{ConversationSummary, RunStatus};
use crate::models::{LimitSource, ModelCatalog, resolve_context_limit};
use crate::rpc::{CancelToken, METHOD_TRAJECTORY_STEPS, RpcError, RpcTransport};
use crate::steps::{ModelUsage, Step, TokenUsageResult, parse_steps_response, process_steps};

pub const STEP_BATCH_SIZE: u64 = 50;
pub const MAX_PARALLEL_BATCHES: usize = 5;

const STEPS_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSource {
    Detected,
    Requested,
    Generator,
}

pub const MODEL_RESOLUTION_ORDER: [ModelSource; 3] = [
    ModelSource::Detected,
    ModelSource::Requested,
    ModelSource::Generator,
];

impl ModelSource {
    fn resolve<'a>(
        self,
        result: &'a TokenUsageResult,
        conversation: &'a ConversationSummary,
    ) -> Option<&'a str> {
        let candidate = match self {
            Self::Detected => result.model.as_str(),
            Self::Requested => conversation.requested_model.as_str(),
            Self::Generator => conversation.generator_model.as_str(),
        };
        (!candidate.trim().is_empty()).then_some(candidate)
    }
}

pub fn effective_model(result: &TokenUsageResult, conversation: &ConversationSummary) -> String {
    MODEL_RESOLUTION_ORDER
        .iter()
        .find_map(|source| source.resolve(result, conversation))
        .unwrap_or_default()
        .to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextUsage {
    pub cascade_id: String,
    pub title: String,
    pub model: String,
    pub model_display_name: String,
    pub context_used: u64,
    pub total_output_tokens: u64,
    pub total_tool_call_output_tokens: u64,
    pub context_limit: u64,
    pub limit_source: LimitSource,
    /// Not capped at 100.
    pub usage_percent: f64,
    pub step_count: u64,
    pub last_modified_time: String,
    pub status: RunStatus,
    pub is_estimated: bool,
    pub last_model_usage: Option<ModelUsage>,
    pub estimated_delta_since_checkpoint: u64,
    pub image_gen_step_count: u32,
    pub has_gaps: bool,
    pub compression_detected: bool,
    pub checkpoint_compression_drop: u64,
    pub previous_context_used: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionSource {
    CrossPoll,
    Checkpoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CompressionStats {
    pub source: CompressionSource,
    pub dropped_tokens: u64,
    pub drop_percent: f64,
}

impl ContextUsage {
    pub fn is_over_limit(&self) -> bool {
        self.usage_percent > 100.0
    }

    pub fn compression_stats(&self) -> Option<CompressionStats> {
        if !self.compression_detected {
            return None;
        }

        if let Some(previous) = self.previous_context_used
            && previous > self.context_used
        {
            let dropped = previous - self.context_used;
            return Some(CompressionStats {
                source: CompressionSource::CrossPoll,
                dropped_tokens: dropped,
                drop_percent: dropped as f64 * 100.0 / previous as f64,
            });
        }

        if self.checkpoint_compression_drop > 0 {
            let before = self
                .last_model_usage
                .as_ref()
                .map(|usage| usage.input_tokens.saturating_add(self.checkpoint_compression_drop))
                .unwrap_or(0);
            let drop_percent = if before > 0 {
                self.checkpoint_compression_drop as f64 * 100.0 / before as f64
            } else {
                0.0
            };
            return Some(CompressionStats {
                source: CompressionSource::Checkpoint,
                dropped_tokens: self.checkpoint_compression_drop,
                drop_percent,
            });
        }

        None
    }
}

pub fn batch_ranges(total_steps: u64) -> Vec<Range<u64>> {
    (0..total_steps)
        .step_by(STEP_BATCH_SIZE as usize)
        .map(|start| start..start.saturating_add(STEP_BATCH_SIZE).min(total_steps))
        .collect()
}

pub fn fetch_steps(
    rpc: &dyn RpcTransport,
    cascade_id: &str,
    range: Range<u64>,
    cancel: &CancelToken,
) -> Result<Vec<Step>, RpcError> {
    let payload = json!({
        "cascadeId": cascade_id,
        "startIndex": range.start,
        "endIndex": range.end,
    });
    let response = rpc.call(METHOD_TRAJECTORY_STEPS, &payload, STEPS_TIMEOUT, cancel)?;
    let mut steps = parse_steps_response(response);
    steps.truncate((range.end - range.start) as usize);
    Ok(steps)
}

pub fn get_usage(
    rpc: &dyn RpcTransport,
    cascade_id: &str,
    total_steps: u64,
    cancel: &CancelToken,
) -> Result<TokenUsageResult, RpcError> {
    let ranges = batch_ranges(total_steps);
    let mut steps: Vec<Step> = Vec::new();
    let mut has_gaps = false;

    for group in ranges.chunks(MAX_PARALLEL_BATCHES) {
        cancel.check()?;

        let results: Vec<Result<Vec<Step>, RpcError>> = thread::scope(|scope| {
            let handles: Vec<_> = group
                .iter()
                .cloned()
                .map(|range| scope.spawn(move || fetch_steps(rpc, cascade_id, range, cancel)))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(RpcError::transport(
                            METHOD_TRAJECTORY_STEPS,
                            "batch worker panicked",
                        ))
                    })
                })
                .collect()
        });

        for (range, result) in group.iter().zip(results) {
            match result {
                Ok(batch) => steps.extend(batch),
                Err(RpcError::Cancelled) => return Err(RpcError::Cancelled),
                Err(err) => {
                    has_gaps = true;
                    warn!(
                        cascade_id,
                        start = range.start,
                        end = range.end,
                        error = %err,
                        "step batch failed; usage may undercount"
                    );
                }
            }
        }
    }

    let mut result = process_steps(&steps);
    result.has_gaps = has_gaps;
    Ok(result)
}

pub fn get_context_usage(
    rpc: &dyn RpcTransport,
    conversation: &ConversationSummary,
    limit_overrides: &BTreeMap<String, i64>,
    catalog: &ModelCatalog,
    cancel: &CancelToken,
) -> Result<ContextUsage, RpcError> {
    let result = get_usage(rpc, &conversation.cascade_id, conversation.step_count, cancel)?;
    debug!(
        cascade_id = %conversation.cascade_id,
        steps = conversation.step_count,
        context_used = result.context_used,
        estimated = result.is_estimated,
        "computed context usage"
    );
    Ok(build_context_usage(conversation, result, limit_overrides, catalog))
}

pub fn build_context_usage(
    conversation: &ConversationSummary,
    result: TokenUsageResult,
    limit_overrides: &BTreeMap<String, i64>,
    catalog: &ModelCatalog,
) -> ContextUsage {
    let model = effective_model(&result, conversation);
    let limit = resolve_context_limit(&model, limit_overrides);
    let usage_percent = result.context_used as f64 * 100.0 / limit.limit as f64;

    ContextUsage {
        cascade_id: conversation.cascade_id.clone(),
        title: conversation.summary.clone(),
        model_display_name: catalog.display_name(&model),
        model,
        context_used: result.context_used,
        total_output_tokens: result.total_output_tokens,
        total_tool_call_output_tokens: result.total_tool_call_output_tokens,
        context_limit: limit.limit,
        limit_source: limit.source,
        usage_percent,
        step_count: conversation.step_count,
        last_modified_time: conversation.last_modified_time.clone(),
        status: conversation.status.clone(),
        is_estimated: result.is_estimated,
        last_model_usage: result.last_model_usage,
        estimated_delta_since_checkpoint: result.estimated_delta_since_checkpoint,
        image_gen_step_count: result.image_gen_step_count,
        has_gaps: result.has_gaps,
        compression_detected: result.checkpoint_compression_detected,
        checkpoint_compression_drop: result.checkpoint_compression_drop,
        previous_context_used: None,
    }
}


#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::fakes::FakeServer;
    use super::*;
    use crate::conversation::fixtures::conversation;
    use crate::estimator::estimate_tokens;
    use crate::steps::{STEP_TYPE_CHECKPOINT, STEP_TYPE_PLANNER_RESPONSE, STEP_TYPE_USER_INPUT};

    fn tool_step(tokens: u64) -> Value {
        json!({"type": "CORTEX_STEP_TYPE_RUN_COMMAND", "metadata": {"toolCallOutputTokens": tokens}})
    }

    #[test]
    fn batch_ranges_never_pass_the_end() {
        assert!(batch_ranges(0).is_empty());
        assert_eq!(batch_ranges(1), vec![0..1]);
        assert_eq!(batch_ranges(50), vec![0..50]);
        assert_eq!(batch_ranges(51), vec![0..50, 50..51]);
        for total in [7u64, 99, 100, 101, 333] {
            let ranges = batch_ranges(total);
            assert!(ranges.iter().all(|range| range.end <= total));
            assert_eq!(ranges.iter().map(|r| r.end - r.start).sum::<u64>(), total);
        }
    }

    #[test]
    fn get_usage_requests_only_existing_indices() {
        let steps: Vec<Value> = (0..260).map(|_| tool_step(1)).collect();
        let server = FakeServer::default().with_steps("A", steps);

        let result = get_usage(&server, "A", 260, &CancelToken::new()).expect("usage");
        assert_eq!(result.total_tool_call_output_tokens, 260);
        assert!(!result.has_gaps);

        let requests = server.requests.lock().expect("requests");
        assert_eq!(requests.len(), 6);
        assert!(requests.iter().all(|(_, _, end)| *end <= 260));
    }

    #[test]
    fn failed_batch_sets_gaps_and_keeps_the_rest() {
        let steps: Vec<Value> = (0..100).map(|_| tool_step(2)).collect();
        let server = FakeServer::default().with_steps("A", steps);
        server.fail_batch("A", 0);

        let result = get_usage(&server, "A", 100, &CancelToken::new()).expect("usage");
        assert!(result.has_gaps);
        assert_eq!(result.total_tool_call_output_tokens, 100);
    }

    #[test]
    fn cancellation_aborts_usage() {
        let server = FakeServer::default().with_steps("A", vec![tool_step(1)]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = get_usage(&server, "A", 1, &cancel).expect_err("cancelled");
        assert!(err.is_cancelled());
    }

    #[test]
    fn end_to_end_usage_for_running_conversation() {
        let server = FakeServer::default().with_steps(
            "A",
            vec![
                json!({"type": STEP_TYPE_USER_INPUT, "userInput": {"userResponse": "hello"}}),
                json!({"type": STEP_TYPE_CHECKPOINT, "metadata": {"modelUsage": {"inputTokens": 500, "outputTokens": 20}}}),
                json!({"type": STEP_TYPE_PLANNER_RESPONSE, "plannerResponse": {"response": "ok"}}),
            ],
        );
        let conv = conversation("A", 3, RunStatus::Running, &["file:///ws"]);

        let usage = get_context_usage(
            &server,
            &conv,
            &BTreeMap::new(),
            &ModelCatalog::new(),
            &CancelToken::new(),
        )
        .expect("usage");
        assert_eq!(usage.context_used, 500 + 20 + estimate_tokens("ok"));
        assert!(usage.is_estimated);
        assert_eq!(usage.model_display_name, "Unknown Model");
    }

    #[test]
    fn unmapped_model_uses_default_limit_and_uncapped_percent() {
        let conv = conversation("A", 1, RunStatus::Idle, &[]);
        let result = TokenUsageResult {
            context_used: 250_000,
            model: "MODEL_UNMAPPED".to_string(),
            ..TokenUsageResult::default()
        };
        let usage = build_context_usage(&conv, result, &BTreeMap::new(), &ModelCatalog::new());
        assert_eq!(usage.context_limit, 1_000_000);
        assert_eq!(usage.usage_percent, 25.0);

        let over = TokenUsageResult {
            context_used: 300_000,
            model: "MODEL_PLACEHOLDER_M26".to_string(),
            ..TokenUsageResult::default()
        };
        let usage = build_context_usage(&conv, over, &BTreeMap::new(), &ModelCatalog::new());
        assert_eq!(usage.usage_percent, 150.0);
        assert!(usage.is_over_limit());
    }

    #[test]
    fn model_resolution_prefers_detected_then_requested_then_generator() {
        let mut conv = conversation("A", 1, RunStatus::Idle, &[]);
        conv.requested_model = "REQ".to_string();
        conv.generator_model = "GEN".to_string();

        let detected = TokenUsageResult {
            model: "DET".to_string(),
            ..TokenUsageResult::default()
        };
        assert_eq!(effective_model(&detected, &conv), "DET");
        assert_eq!(effective_model(&TokenUsageResult::default(), &conv), "REQ");
        conv.requested_model.clear();
        assert_eq!(effective_model(&TokenUsageResult::default(), &conv), "GEN");
        conv.generator_model.clear();
        assert_eq!(effective_model(&TokenUsageResult::default(), &conv), "");
    }

    #[test]
    fn compression_stats_prefer_cross_poll_source() {
        let conv = conversation("A", 1, RunStatus::Idle, &[]);
        let mut usage =
            build_context_usage(&conv, TokenUsageResult::default(), &BTreeMap::new(), &ModelCatalog::new());
        assert!(usage.compression_stats().is_none());

        usage.compression_detected = true;
        usage.context_used = 40_000;
        usage.previous_context_used = Some(100_000);
        let stats = usage.compression_stats().expect("stats");
        assert_eq!(stats.source, CompressionSource::CrossPoll);
        assert_eq!(stats.dropped_tokens, 60_000);
        assert_eq!(stats.drop_percent, 60.0);

        usage.previous_context_used = None;
        usage.checkpoint_compression_drop = 30_000;
        usage.last_model_usage = Some(ModelUsage {
            input_tokens: 90_000,
            ..ModelUsage::default()
        });
        let stats = usage.compression_stats().expect("stats");
        assert_eq!(stats.source, CompressionSource::Checkpoint);
        assert_eq!(stats.dropped_tokens, 30_000);
        assert_eq!(stats.drop_percent, 25.0);
    }
}
