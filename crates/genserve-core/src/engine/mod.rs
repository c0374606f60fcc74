//! The contract between the serving frontend and an inference engine.
//!
//! The frontend never touches tensors. It hands token ids and a [`GenerationConfig`] to
//! a [`ContinuousBatchingPipeline`] (or a blocking [`LlmPipeline`]) and reads generated
//! ids back through a [`GenerationHandle`].

use std::{collections::BTreeSet, sync::Arc};

use anyhow::Result;
use derivative::Derivative;
use serde::{Deserialize, Serialize};

use crate::streamer::TextStreamer;

pub mod reference;

pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>>;
    fn decode(&self, tokens: &[u32]) -> Result<String>;
    fn eos_token_id(&self) -> Option<u32>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationFinishReason {
    /// Still generating.
    #[default]
    None,
    /// Stopped on EOS or a stop string.
    Stop,
    /// Hit `max_new_tokens` or `max_length`.
    Length,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum GenerationStatus {
    #[default]
    Running,
    Finished,
    /// Stopped by the owner of the handle.
    Stop,
    Failed,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct GenerationOutput {
    pub generated_ids: Vec<u32>,
    pub generated_log_probs: Vec<f32>,
    pub score: f32,
    pub finish_reason: GenerationFinishReason,
}

impl GenerationOutput {
    /// The placeholder used when a handle yields nothing: empty and finished.
    pub fn empty_stop() -> Self {
        Self {
            finish_reason: GenerationFinishReason::Stop,
            ..Default::default()
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuralTagItem {
    pub begin: String,
    pub schema: String,
    pub end: String,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuralTagsConfig {
    pub structural_tags: Vec<StructuralTagItem>,
    pub triggers: Vec<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredOutputConfig {
    pub json_schema: Option<String>,
    pub structural_tags_config: Option<StructuralTagsConfig>,
}

impl StructuredOutputConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(schema) = &self.json_schema {
            let value: serde_json::Value = serde_json::from_str(schema)?;
            if !value.is_object() {
                anyhow::bail!("json schema must be an object");
            }
        }
        if let Some(tags) = &self.structural_tags_config {
            if !tags.structural_tags.is_empty() && tags.triggers.is_empty() {
                anyhow::bail!("structural tags require at least one trigger");
            }
            for tag in &tags.structural_tags {
                if tag.begin.is_empty() {
                    anyhow::bail!("structural tag begin cannot be empty");
                }
                serde_json::from_str::<serde_json::Value>(&tag.schema)?;
            }
        }
        Ok(())
    }
}

/// Per-request generation parameters understood by the engine.
#[derive(Debug, Clone, PartialEq, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct GenerationConfig {
    #[derivative(Default(value = "usize::MAX"))]
    pub max_new_tokens: usize,
    #[derivative(Default(value = "usize::MAX"))]
    pub max_length: usize,
    pub ignore_eos: bool,
    pub echo: bool,
    #[derivative(Default(value = "true"))]
    pub apply_chat_template: bool,
    #[derivative(Default(value = "1"))]
    pub num_beam_groups: usize,
    #[derivative(Default(value = "1"))]
    pub num_beams: usize,
    #[derivative(Default(value = "usize::MAX"))]
    pub no_repeat_ngram_size: usize,
    #[derivative(Default(value = "1"))]
    pub num_return_sequences: usize,
    #[derivative(Default(value = "1.0"))]
    pub repetition_penalty: f32,
    #[derivative(Default(value = "1.0"))]
    pub length_penalty: f32,
    pub diversity_penalty: f32,
    #[derivative(Default(value = "1.0"))]
    pub temperature: f32,
    #[derivative(Default(value = "usize::MAX"))]
    pub top_k: usize,
    #[derivative(Default(value = "1.0"))]
    pub top_p: f32,
    pub rng_seed: u64,
    pub do_sample: bool,
    pub stop_strings: BTreeSet<String>,
    pub include_stop_str_in_output: bool,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub logprobs: usize,
    pub num_assistant_tokens: usize,
    pub assistant_confidence_threshold: f32,
    pub max_ngram_size: usize,
    #[serde(skip)]
    pub structured_output_config: Option<StructuredOutputConfig>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct PipelineMetrics {
    /// Requests admitted and not yet finished.
    pub requests: usize,
    /// Requests that took part in the last step.
    pub scheduled_requests: usize,
    /// KV cache usage in percent.
    pub cache_usage: f32,
    pub kv_cache_usage_bytes: usize,
}

pub trait GenerationHandle: Send + Sync {
    fn status(&self) -> GenerationStatus;
    /// Whether a `read` would return something new right now.
    fn can_read(&self) -> bool;
    /// Returns newly generated outputs. Waits at most one poll interval when nothing is
    /// ready, in which case a single empty output without a finish reason is returned.
    fn read(&self) -> Result<Vec<GenerationOutput>>;
    /// Blocks until the generation ends and returns the full outputs.
    fn read_all(&self) -> Result<Vec<GenerationOutput>>;
    fn stop(&self);
}

pub trait ContinuousBatchingPipeline: Send + Sync {
    fn add_request(
        &self,
        request_id: u64,
        input_ids: &[u32],
        config: GenerationConfig,
    ) -> Result<Arc<dyn GenerationHandle>>;
    /// Advances every scheduled request by one iteration.
    fn step(&self) -> Result<()>;
    fn has_non_finished_requests(&self) -> bool;
    fn metrics(&self) -> PipelineMetrics;
}

/// A pipeline that runs one request to completion per call.
pub trait LlmPipeline: Send + Sync {
    fn generate(
        &self,
        input_ids: &[u32],
        config: &GenerationConfig,
        streamer: Option<&mut TextStreamer>,
    ) -> Result<Vec<GenerationOutput>>;
}
