//! Turns a [`ServableConfig`] into a running [`Servable`].

use std::{path::Path, sync::Arc};

use anyhow::{bail, Context, Result};

use super::{Admission, BatchingBackend, LegacyBackend, Properties, Servable};
use crate::{
    config::{DraftModel, PipelineType, SchedulerConfig, ServableConfig},
    engine::{
        reference::{ByteTokenizer, ReferenceLlm, ReferencePipeline},
        ContinuousBatchingPipeline, GenerationConfig, LlmPipeline, Tokenizer,
    },
    executor::{exit_on_fatal, FatalHandler},
    generation::DecodingMethod,
    template::{RoleTemplate, TemplateProcessor},
};

pub const GENERATION_CONFIG_FILE: &str = "generation_config.json";
pub const TEMPLATE_FILE: &str = "template.toml";
pub const MODEL_CONFIG_FILE: &str = "config.json";

/// Keys of `config.json` that hold the context length, in lookup order.
const MODEL_LENGTH_KEYS: [&str; 6] = [
    "max_position_embeddings",
    "n_positions",
    "seq_len",
    "seq_length",
    "n_ctx",
    "sliding_window",
];

/// The engine a servable drives.
pub enum Engine {
    ContinuousBatching(Arc<dyn ContinuousBatchingPipeline>),
    Legacy(Arc<dyn LlmPipeline>),
}

fn load_generation_config(models_path: &Path) -> Result<GenerationConfig> {
    let path = models_path.join(GENERATION_CONFIG_FILE);
    if !path.is_file() {
        return Ok(GenerationConfig::default());
    }
    let contents = std::fs::read_to_string(&path)?;
    let config = serde_json::from_str(&contents)
        .with_context(|| format!("invalid {}", path.display()))?;
    log::info!("[init] loaded {}", path.display());
    Ok(config)
}

/// Context length declared by the model's `config.json`. A missing or malformed file yields `None`.
fn load_max_model_length(models_path: &Path) -> Option<usize> {
    let path = models_path.join(MODEL_CONFIG_FILE);
    let contents = std::fs::read_to_string(&path).ok()?;
    let config: serde_json::Value = match serde_json::from_str(&contents) {
        Ok(config) => config,
        Err(err) => {
            log::warn!("[init] ignoring {}: {err}", path.display());
            return None;
        }
    };
    let length = MODEL_LENGTH_KEYS
        .iter()
        .find_map(|key| config.get(*key)?.as_u64())
        .and_then(|length| usize::try_from(length).ok())?;
    log::debug!("[init] {}: max model length {length}", path.display());
    Some(length)
}

fn load_template(config: &ServableConfig) -> Result<Arc<dyn TemplateProcessor>> {
    let template = match &config.chat_template {
        Some(path) => RoleTemplate::load(path)
            .with_context(|| format!("failed to load chat template {}", path.display()))?,
        None => {
            let path = config.models_path.join(TEMPLATE_FILE);
            match path.is_file() {
                true => RoleTemplate::load(&path)?,
                false => {
                    log::info!("[init] {}: using the built-in chat template", config.name);
                    RoleTemplate::default()
                }
            }
        }
    };
    Ok(Arc::new(template))
}

fn decoding_method(config: &ServableConfig) -> DecodingMethod {
    let plugin_flag = |key: &str| {
        config
            .plugin_config
            .get(key)
            .is_some_and(|value| value.eq_ignore_ascii_case("true"))
    };
    if config.prompt_lookup || plugin_flag("prompt_lookup") {
        return DecodingMethod::PromptLookup;
    }
    if config.draft.models_path.is_some() || config.plugin_config.contains_key("draft_model") {
        return DecodingMethod::SpeculativeDecoding;
    }
    DecodingMethod::Standard
}

fn validate(config: &ServableConfig) -> Result<()> {
    if config.draft.models_path.is_none() && config.draft.has_scheduler_overrides() {
        bail!(
            "{}: draft model scheduler options are set but draft models_path is missing",
            config.name
        );
    }
    if config.pipeline_type == PipelineType::Legacy && config.draft.models_path.is_some() {
        bail!("{}: speculative decoding needs a continuous batching pipeline", config.name);
    }
    if config.max_tokens_limit == 0 {
        bail!("{}: max_tokens_limit must be greater than 0", config.name);
    }
    Ok(())
}

fn log_scheduler(name: &str, scheduler: &SchedulerConfig) {
    log::info!(
        "[init] {name}: max_num_batched_tokens: {}; cache_size: {} GB; dynamic_split_fuse: {}; max_num_seqs: {}; enable_prefix_caching: {}",
        scheduler.max_num_batched_tokens,
        scheduler.cache_size,
        scheduler.dynamic_split_fuse,
        scheduler.max_num_seqs,
        scheduler.enable_prefix_caching,
    );
    if let Some(eviction) = &scheduler.cache_eviction_config {
        log::info!(
            "[init] {name}: cache eviction start_size: {}; recent_size: {}; max_cache_size: {}; aggregation_mode: {:?}",
            eviction.start_size,
            eviction.recent_size,
            eviction.max_cache_size,
            eviction.aggregation_mode,
        );
    }
}

fn log_draft(name: &str, draft: &DraftModel) {
    log::info!(
        "[init] {name}: draft model {} on {}",
        draft.models_path.display(),
        draft.device
    );
    log_scheduler(&format!("{name}-draft"), &draft.scheduler);
}

/// Loads a servable on the in-process reference engine.
pub fn initialize(config: &ServableConfig) -> Result<Servable> {
    let engine = match config.pipeline_type {
        PipelineType::ContinuousBatching => {
            Engine::ContinuousBatching(Arc::new(ReferencePipeline::new(config.scheduler.clone())))
        }
        PipelineType::Legacy => Engine::Legacy(Arc::new(ReferenceLlm)),
    };
    initialize_with_engine(config, Arc::new(ByteTokenizer), engine, exit_on_fatal())
}

pub fn initialize_with_engine(
    config: &ServableConfig,
    tokenizer: Arc<dyn Tokenizer>,
    engine: Engine,
    fatal: FatalHandler,
) -> Result<Servable> {
    validate(config)?;

    let decoding_method = decoding_method(config);
    let draft = config.draft_model();
    let properties = Properties {
        name: config.name.clone(),
        models_path: config.models_path.clone(),
        device: config.device.clone(),
        plugin_config: config.plugin_config.clone(),
        tokenizer,
        template: load_template(config)?,
        max_tokens_limit: config.max_tokens_limit,
        best_of_limit: config.best_of_limit,
        max_model_length: config
            .max_model_length
            .or_else(|| load_max_model_length(&config.models_path)),
        max_prompt_length: config.max_prompt_length,
        scheduler: config.scheduler.clone(),
        draft: draft.clone(),
        base_generation_config: load_generation_config(&config.models_path)?,
        tool_parser: config.tool_parser.clone(),
        enable_tool_guided_generation: config.enable_tool_guided_generation,
        decoding_method,
    };

    let admission = match engine {
        Engine::ContinuousBatching(pipeline) => {
            log_scheduler(&config.name, &config.scheduler);
            if let Some(draft) = &draft {
                log_draft(&config.name, draft);
            }
            Admission::ContinuousBatching(BatchingBackend::spawn_with_fatal_handler(
                &config.name,
                pipeline,
                config.scheduler.cache_size == 0,
                fatal,
            )?)
        }
        Engine::Legacy(pipeline) => Admission::Legacy(LegacyBackend::spawn_with_fatal_handler(
            &config.name,
            pipeline,
            fatal,
        )?),
    };

    log::info!(
        "[init] {}: {:?} on {}, decoding: {:?}",
        config.name,
        admission.pipeline_type(),
        config.device,
        decoding_method
    );
    Ok(Servable::new(properties, admission))
}
