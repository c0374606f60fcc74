use std::{collections::HashMap, path::PathBuf};

use derivative::Derivative;
use salvo::oapi::ToSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PipelineType {
    /// Many requests share one pipeline stepped by a background executor.
    #[default]
    ContinuousBatching,
    /// Requests are queued and generated one at a time.
    Legacy,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMode {
    #[default]
    Sum,
    NormSum,
}

#[derive(Debug, Clone, PartialEq, Eq, Derivative, Serialize, Deserialize, ToSchema)]
#[derivative(Default)]
#[serde(default)]
pub struct CacheEvictionConfig {
    /// Tokens at the beginning of the sequence that are never evicted.
    #[derivative(Default(value = "32"))]
    pub start_size: usize,
    /// Most recent tokens that are never evicted.
    #[derivative(Default(value = "128"))]
    pub recent_size: usize,
    /// Upper bound of cached tokens per sequence.
    #[derivative(Default(value = "672"))]
    pub max_cache_size: usize,
    pub aggregation_mode: AggregationMode,
    pub apply_rotation: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Derivative, Serialize, Deserialize, ToSchema)]
#[derivative(Default)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum tokens processed by one pipeline step.
    #[derivative(Default(value = "256"))]
    pub max_num_batched_tokens: usize,
    /// KV cache size in GB. `0` lets the cache grow on demand.
    #[derivative(Default(value = "8"))]
    pub cache_size: usize,
    #[derivative(Default(value = "true"))]
    pub dynamic_split_fuse: bool,
    /// Maximum sequences scheduled at once.
    #[derivative(Default(value = "256"))]
    pub max_num_seqs: usize,
    pub enable_prefix_caching: bool,
    pub cache_eviction_config: Option<CacheEvictionConfig>,
}

/// Draft model for speculative decoding. Unset scheduler fields fall back to the main model's.
///
/// The resolved [`DraftModel`] is carried in the servable properties for engines that
/// speculate. The reference engine runs the main model alone.
#[derive(Debug, Clone, Derivative, Serialize, Deserialize, ToSchema)]
#[derivative(Default)]
#[serde(default)]
pub struct DraftOption {
    /// Path to the draft model used for speculative decoding.
    #[salvo(schema(value_type = Option<String>))]
    pub models_path: Option<PathBuf>,
    #[derivative(Default(value = "\"CPU\".into()"))]
    pub device: String,
    pub max_num_batched_tokens: Option<usize>,
    pub cache_size: Option<usize>,
    pub max_num_seqs: Option<usize>,
    pub dynamic_split_fuse: Option<bool>,
}

impl DraftOption {
    pub fn has_scheduler_overrides(&self) -> bool {
        self.max_num_batched_tokens.is_some()
            || self.cache_size.is_some()
            || self.max_num_seqs.is_some()
            || self.dynamic_split_fuse.is_some()
    }

    /// Scheduler of the draft pipeline. Prefix caching and cache eviction stay off.
    pub fn scheduler_config(&self, main: &SchedulerConfig) -> SchedulerConfig {
        SchedulerConfig {
            max_num_batched_tokens: self
                .max_num_batched_tokens
                .unwrap_or(main.max_num_batched_tokens),
            cache_size: self.cache_size.unwrap_or(main.cache_size),
            dynamic_split_fuse: self.dynamic_split_fuse.unwrap_or(main.dynamic_split_fuse),
            max_num_seqs: self.max_num_seqs.unwrap_or(main.max_num_seqs),
            ..Default::default()
        }
    }
}

/// A draft model with its path and scheduler resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftModel {
    pub models_path: PathBuf,
    pub device: String,
    pub scheduler: SchedulerConfig,
}

/// Configuration of one served model.
#[derive(Debug, Clone, Derivative, Serialize, Deserialize, ToSchema)]
#[derivative(Default)]
#[serde(default)]
pub struct ServableConfig {
    /// Name clients put in the `model` field.
    #[derivative(Default(value = "\"default\".into()"))]
    pub name: String,
    /// Folder with the model, its `generation_config.json` and chat template.
    #[derivative(Default(value = "\"assets/models\".into()"))]
    #[serde(alias = "model_path")]
    #[salvo(schema(value_type = String))]
    pub models_path: PathBuf,
    pub pipeline_type: PipelineType,
    #[derivative(Default(value = "\"CPU\".into()"))]
    pub device: String,
    pub plugin_config: HashMap<String, String>,
    /// Upper bound (exclusive) for `max_tokens` in requests.
    #[derivative(Default(value = "4096"))]
    pub max_tokens_limit: u32,
    /// Upper bound (exclusive) for `best_of` in requests.
    #[derivative(Default(value = "20"))]
    pub best_of_limit: u32,
    /// Context length. Defaults to the one declared in the model's `config.json`.
    pub max_model_length: Option<usize>,
    /// Prompt limit for legacy pipelines on NPU.
    #[derivative(Default(value = "1024"))]
    pub max_prompt_length: usize,
    pub tool_parser: Option<String>,
    pub enable_tool_guided_generation: bool,
    /// Use prompt lookup decoding.
    pub prompt_lookup: bool,
    pub draft: DraftOption,
    /// Chat template file. Falls back to `template.toml` in the model folder.
    #[salvo(schema(value_type = Option<String>))]
    pub chat_template: Option<PathBuf>,
    /// Handed to the engine as is, including `cache_eviction_config`.
    pub scheduler: SchedulerConfig,
}

impl ServableConfig {
    /// The draft model, if configured. A relative draft path is resolved against `models_path`.
    pub fn draft_model(&self) -> Option<DraftModel> {
        let path = self.draft.models_path.as_ref()?;
        let models_path = match path.is_relative() {
            true => self.models_path.join(path),
            false => path.clone(),
        };
        Some(DraftModel {
            models_path,
            device: self.draft.device.clone(),
            scheduler: self.draft.scheduler_config(&self.scheduler),
        })
    }
}
