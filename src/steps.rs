use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::estimator::estimate_tokens;
use crate::lenient;

pub const STEP_TYPE_USER_INPUT: &str = "CORTEX_STEP_TYPE_USER_INPUT";
pub const STEP_TYPE_PLANNER_RESPONSE: &str = "CORTEX_STEP_TYPE_PLANNER_RESPONSE";
pub const STEP_TYPE_CHECKPOINT: &str = "CORTEX_STEP_TYPE_CHECKPOINT";

pub const SYSTEM_PROMPT_OVERHEAD: u64 = 10_000;
pub const USER_INPUT_FALLBACK: u64 = 500;
pub const PLANNER_RESPONSE_FALLBACK: u64 = 800;
pub const CHECKPOINT_COMPRESSION_MIN_DROP: u64 = 5_000;

const IMAGE_MODEL_MARKERS: [&str; 3] = ["nano", "banana", "image"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    UserInput,
    PlannerResponse,
    Checkpoint,
    Other,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Step {
    #[serde(rename = "type", deserialize_with = "lenient::string")]
    pub step_type: String,
    #[serde(deserialize_with = "lenient::object")]
    pub metadata: Option<StepMetadata>,
    #[serde(deserialize_with = "lenient::object")]
    pub user_input: Option<UserInput>,
    #[serde(deserialize_with = "lenient::object")]
    pub planner_response: Option<PlannerResponse>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StepMetadata {
    #[serde(deserialize_with = "lenient::u64")]
    pub tool_call_output_tokens: u64,
    #[serde(deserialize_with = "lenient::string")]
    pub generator_model: String,
    #[serde(deserialize_with = "lenient::model_ref")]
    pub requested_model: String,
    #[serde(deserialize_with = "lenient::object")]
    pub model_usage: Option<ModelUsage>,
    #[serde(deserialize_with = "lenient::list")]
    pub retry_infos: Vec<RetryInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UserInput {
    #[serde(deserialize_with = "lenient::string")]
    pub user_response: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlannerResponse {
    #[serde(deserialize_with = "lenient::string")]
    pub response: String,
    #[serde(deserialize_with = "lenient::string")]
    pub thinking: String,
    #[serde(deserialize_with = "lenient::list")]
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ToolCall {
    #[serde(deserialize_with = "lenient::string")]
    pub arguments_json: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModelUsage {
    #[serde(deserialize_with = "lenient::string")]
    pub model: String,
    #[serde(deserialize_with = "lenient::u64")]
    pub input_tokens: u64,
    #[serde(deserialize_with = "lenient::u64")]
    pub output_tokens: u64,
    #[serde(deserialize_with = "lenient::u64")]
    pub response_output_tokens: u64,
    #[serde(deserialize_with = "lenient::u64")]
    pub cache_read_tokens: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RetryInfo {
    #[serde(deserialize_with = "lenient::object")]
    pub usage: Option<ModelUsage>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StepsResponse {
    #[serde(deserialize_with = "lenient::list")]
    pub steps: Vec<Step>,
}

impl Step {
    pub fn kind(&self) -> StepKind {
        match self.step_type.as_str() {
            STEP_TYPE_USER_INPUT => StepKind::UserInput,
            STEP_TYPE_PLANNER_RESPONSE => StepKind::PlannerResponse,
            STEP_TYPE_CHECKPOINT => StepKind::Checkpoint,
            _ => StepKind::Other,
        }
    }

    fn is_image_generation(&self) -> bool {
        if self.step_type.contains("IMAGE") || self.step_type.contains("GENERATE") {
            return true;
        }
        self.metadata.as_ref().is_some_and(|meta| {
            let model = meta.generator_model.to_ascii_lowercase();
            !model.is_empty() && IMAGE_MODEL_MARKERS.iter().any(|m| model.contains(m))
        })
    }

    fn estimated_overhead(&self) -> u64 {
        match self.kind() {
            StepKind::UserInput => self
                .user_input
                .as_ref()
                .map(|input| estimate_tokens(&input.user_response))
                .unwrap_or(USER_INPUT_FALLBACK),
            StepKind::PlannerResponse => self
                .planner_response
                .as_ref()
                .map(|planner| {
                    let mut text = String::with_capacity(
                        planner.response.len() + planner.thinking.len(),
                    );
                    text.push_str(&planner.response);
                    text.push_str(&planner.thinking);
                    for call in &planner.tool_calls {
                        text.push_str(&call.arguments_json);
                    }
                    estimate_tokens(&text)
                })
                .unwrap_or(PLANNER_RESPONSE_FALLBACK),
            StepKind::Checkpoint | StepKind::Other => 0,
        }
    }
}

pub fn parse_steps_response(value: Value) -> Vec<Step> {
    serde_json::from_value::<StepsResponse>(value)
        .map(|response| response.steps)
        .unwrap_or_default()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsageResult {
    pub context_used: u64,
    pub is_estimated: bool,
    pub total_output_tokens: u64,
    pub total_tool_call_output_tokens: u64,
    pub model: String,
    pub last_model_usage: Option<ModelUsage>,
    pub estimated_delta_since_checkpoint: u64,
    pub image_gen_step_count: u32,
    pub has_gaps: bool,
    pub checkpoint_compression_detected: bool,
    pub checkpoint_compression_drop: u64,
}

/// Folds an ordered step sequence (oldest first) into a usage estimate.
pub fn process_steps(steps: &[Step]) -> TokenUsageResult {
    let mut tool_output_tokens = 0u64;
    let mut estimation_overhead = 0u64;
    let mut output_since_checkpoint = 0u64;
    let mut model = String::new();
    let mut last_model_usage: Option<ModelUsage> = None;
    let mut image_gen_step_count = 0u32;
    let mut previous_checkpoint_input: Option<u64> = None;
    let mut compression_detected = false;
    let mut compression_drop = 0u64;

    for step in steps {
        estimation_overhead = estimation_overhead.saturating_add(step.estimated_overhead());

        if step.is_image_generation() {
            image_gen_step_count = image_gen_step_count.saturating_add(1);
        }

        if step.kind() == StepKind::Checkpoint
            && let Some(meta) = &step.metadata
            && let Some(usage) = &meta.model_usage
        {
            log_retry_usage(meta, usage);

            if usage.input_tokens > 0 || usage.output_tokens > 0 {
                if let Some(previous) = previous_checkpoint_input
                    && previous > 0
                    && usage.input_tokens < previous
                {
                    let drop = previous - usage.input_tokens;
                    if drop > CHECKPOINT_COMPRESSION_MIN_DROP {
                        compression_detected = true;
                        compression_drop = drop;
                    }
                }
                previous_checkpoint_input = Some(usage.input_tokens);
                last_model_usage = Some(usage.clone());
                estimation_overhead = 0;
                output_since_checkpoint = 0;
            }
        }

        let Some(meta) = &step.metadata else {
            continue;
        };

        if meta.tool_call_output_tokens > 0 {
            tool_output_tokens = tool_output_tokens.saturating_add(meta.tool_call_output_tokens);
            output_since_checkpoint =
                output_since_checkpoint.saturating_add(meta.tool_call_output_tokens);
        }

        // generator < checkpoint model < explicit user selection
        if !meta.generator_model.is_empty() {
            model = meta.generator_model.clone();
        }
        if let Some(usage) = &last_model_usage
            && !usage.model.is_empty()
        {
            model = usage.model.clone();
        }
        if !meta.requested_model.is_empty() {
            model = meta.requested_model.clone();
        }
    }

    let estimated_delta = output_since_checkpoint.saturating_add(estimation_overhead);

    if let Some(usage) = last_model_usage
        && usage.input_tokens > 0
    {
        return TokenUsageResult {
            context_used: usage
                .input_tokens
                .saturating_add(usage.output_tokens)
                .saturating_add(estimated_delta),
            is_estimated: estimated_delta > 0,
            total_output_tokens: usage.output_tokens,
            total_tool_call_output_tokens: tool_output_tokens,
            model,
            last_model_usage: Some(usage),
            estimated_delta_since_checkpoint: estimated_delta,
            image_gen_step_count,
            has_gaps: false,
            checkpoint_compression_detected: compression_detected,
            checkpoint_compression_drop: compression_drop,
        };
    }

    let estimated_total = tool_output_tokens
        .saturating_add(SYSTEM_PROMPT_OVERHEAD)
        .saturating_add(estimation_overhead);
    TokenUsageResult {
        context_used: estimated_total,
        is_estimated: true,
        total_output_tokens: 0,
        total_tool_call_output_tokens: tool_output_tokens,
        model,
        last_model_usage: None,
        estimated_delta_since_checkpoint: estimated_total,
        image_gen_step_count,
        has_gaps: false,
        checkpoint_compression_detected: false,
        checkpoint_compression_drop: 0,
    }
}

fn log_retry_usage(meta: &StepMetadata, usage: &ModelUsage) {
    if meta.retry_infos.is_empty() {
        return;
    }
    let (retry_input, retry_output) = meta
        .retry_infos
        .iter()
        .filter_map(|retry| retry.usage.as_ref())
        .fold((0u64, 0u64), |(input, output), retry| {
            (
                input.saturating_add(retry.input_tokens),
                output.saturating_add(retry.output_tokens),
            )
        });
    debug!(
        retries = meta.retry_infos.len(),
        retry_input,
        retry_output,
        checkpoint_input = usage.input_tokens,
        checkpoint_output = usage.output_tokens,
        "checkpoint carries retry usage"
    );
}

#[cfg(test)]
pub(crate) mod fixtures {
    use serde_json::{Value, json};

    use super::*;

    pub fn step(value: Value) -> Step {
        serde_json::from_value(value).expect("step fixture")
    }

    pub fn user_input(text: &str) -> Step {
        step(json!({"type": STEP_TYPE_USER_INPUT, "userInput": {"userResponse": text}}))
    }

    pub fn planner(text: &str) -> Step {
        step(json!({"type": STEP_TYPE_PLANNER_RESPONSE, "plannerResponse": {"response": text}}))
    }

    pub fn checkpoint(input: u64, output: u64) -> Step {
        step(json!({
            "type": STEP_TYPE_CHECKPOINT,
            "metadata": {
                "modelUsage": {
                    "model": "MODEL_PLACEHOLDER_M26",
                    "inputTokens": input.to_string(),
                    "outputTokens": output.to_string(),
                }
            }
        }))
    }

    pub fn tool_output(tokens: u64) -> Step {
        step(json!({
            "type": "CORTEX_STEP_TYPE_RUN_COMMAND",
            "metadata": {"toolCallOutputTokens": tokens}
        }))
    }
}
