use std::{collections::HashMap, path::PathBuf, sync::Arc, time::SystemTime};

use crate::{
    apis::{Endpoint, OpenAiHandler, TokenizeRequest, ALLOWED_ENDPOINTS_MESSAGE},
    config::{DraftModel, PipelineType, SchedulerConfig},
    context::{ContextState, ExecutionContext},
    engine::{GenerationConfig, GenerationFinishReason, Tokenizer},
    error::{Result, ServableError},
    generation::DecodingMethod,
    payload::HttpPayload,
    streamer::{StreamingStatus, TextStreamer},
    template::TemplateProcessor,
};

pub mod continuous_batching;
pub mod initializer;
pub mod legacy;

pub use continuous_batching::BatchingBackend;
pub use initializer::{initialize, initialize_with_engine, Engine};
pub use legacy::{LegacyBackend, LegacyQueue, REQUEST_FAILED_MESSAGE};

const SSE_DONE: &str = "[DONE]";

/// Frames one server-sent event.
pub fn wrap_sse(text: &str) -> String {
    format!("data: {text}\n\n")
}

/// Everything a servable knows about its model, fixed at load time.
pub struct Properties {
    pub name: String,
    pub models_path: PathBuf,
    pub device: String,
    pub plugin_config: HashMap<String, String>,
    pub tokenizer: Arc<dyn Tokenizer>,
    pub template: Arc<dyn TemplateProcessor>,
    pub max_tokens_limit: u32,
    pub best_of_limit: u32,
    pub max_model_length: Option<usize>,
    pub max_prompt_length: usize,
    pub scheduler: SchedulerConfig,
    pub draft: Option<DraftModel>,
    pub base_generation_config: GenerationConfig,
    pub tool_parser: Option<String>,
    pub enable_tool_guided_generation: bool,
    pub decoding_method: DecodingMethod,
}

impl std::fmt::Debug for Properties {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Properties")
            .field("name", &self.name)
            .field("models_path", &self.models_path)
            .field("device", &self.device)
            .field("max_tokens_limit", &self.max_tokens_limit)
            .field("best_of_limit", &self.best_of_limit)
            .field("max_model_length", &self.max_model_length)
            .field("decoding_method", &self.decoding_method)
            .field("draft", &self.draft)
            .finish_non_exhaustive()
    }
}

/// How scheduled requests reach the engine.
pub enum Admission {
    ContinuousBatching(BatchingBackend),
    Legacy(LegacyBackend),
}

impl Admission {
    pub fn pipeline_type(&self) -> PipelineType {
        match self {
            Self::ContinuousBatching(_) => PipelineType::ContinuousBatching,
            Self::Legacy(_) => PipelineType::Legacy,
        }
    }
}

/// One served model. The lifecycle steps are called in order on an [`ExecutionContext`]:
/// load, parse, prepare inputs, schedule, then either one complete read + response or
/// repeated partial reads + responses while the loopback flag stays raised.
pub struct Servable {
    properties: Properties,
    admission: Admission,
}

impl Servable {
    pub fn new(properties: Properties, admission: Admission) -> Self {
        Self {
            properties,
            admission,
        }
    }

    pub fn name(&self) -> &str {
        &self.properties.name
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn pipeline_type(&self) -> PipelineType {
        self.admission.pipeline_type()
    }

    pub fn create_execution_context(&self) -> ExecutionContext {
        ExecutionContext::new()
    }

    pub fn load_request(&self, ctx: &mut ExecutionContext, payload: HttpPayload) -> Result<()> {
        ctx.transition("load_request", &[ContextState::Created], ContextState::Loaded)?;
        log::debug!("[servable][load] uri: {}", payload.uri);
        log::trace!("[servable][load] body: {}", payload.body);

        let parsed = payload.parsed_json.is_ok();
        let endpoint = Endpoint::from_uri(&payload.uri);
        ctx.payload = Some(payload);
        if !parsed {
            return Err(ServableError::invalid(
                "Non-json request received in text generation calculator",
            ));
        }
        match endpoint {
            Some(endpoint) => {
                ctx.endpoint = Some(endpoint);
                Ok(())
            }
            None => Err(ServableError::invalid(ALLOWED_ENDPOINTS_MESSAGE)),
        }
    }

    pub fn parse_request(&self, ctx: &mut ExecutionContext) -> Result<()> {
        ctx.transition("parse_request", &[ContextState::Loaded], ContextState::Parsed)?;
        if let Admission::Legacy(_) = self.admission {
            ctx.ensure_connected()?;
        }

        let endpoint = ctx.endpoint()?;
        let json = ctx
            .payload
            .as_ref()
            .and_then(|payload| payload.parsed_json.as_ref().ok())
            .cloned()
            .ok_or_else(|| ServableError::internal("request is not loaded"))?;

        if endpoint == Endpoint::Tokenize {
            ctx.tokenize = Some(TokenizeRequest::parse(&json)?);
            return Ok(());
        }

        let properties = &self.properties;
        let mut handler = OpenAiHandler::new(
            json,
            endpoint,
            SystemTime::now(),
            properties.tokenizer.clone(),
        );
        if let Err(err) = handler.parse_request(
            properties.max_tokens_limit,
            properties.best_of_limit,
            properties.max_model_length,
        ) {
            log::error!("[servable][parse] failed to parse request: {err}");
            return Err(err);
        }

        if handler.is_stream() {
            let mailbox = ctx.mailbox.clone();
            ctx.text_streamer = Some(TextStreamer::new(
                properties.tokenizer.clone(),
                move |text| {
                    log::trace!("[servable][streamer] {text:?}");
                    mailbox.append(text);
                    StreamingStatus::Running
                },
            ));
        }

        ctx.generation_config = Some(handler.create_generation_config(
            &properties.base_generation_config,
            properties.decoding_method,
            properties.tool_parser.as_deref(),
            properties.enable_tool_guided_generation,
        ));
        ctx.api_handler = Some(handler);
        Ok(())
    }

    pub fn prepare_inputs(&self, ctx: &mut ExecutionContext) -> Result<()> {
        ctx.transition(
            "prepare_inputs",
            &[ContextState::Parsed],
            ContextState::InputsPrepared,
        )?;
        let properties = &self.properties;
        let endpoint = ctx.endpoint()?;
        let handler = ctx.api_handler()?;

        if handler.request().image_count > 0 {
            return Err(ServableError::internal(
                "This servable supports only text input, but image_url has been provided",
            ));
        }

        let text = match endpoint {
            Endpoint::ChatCompletions => {
                let text = properties
                    .template
                    .apply_template(handler.chat_history())
                    .map_err(|err| {
                        log::debug!("[servable][inputs] failed to apply chat template: {err:#}");
                        ServableError::invalid(
                            "Failed to apply chat template. The model either does not have chat template or has an invalid one.",
                        )
                    })?;
                if text.is_empty() {
                    return Err(ServableError::invalid(
                        "Final prompt after applying chat template is empty",
                    ));
                }
                text
            }
            Endpoint::Completions => handler.prompt().unwrap_or_default().to_owned(),
            Endpoint::Tokenize => {
                return Err(ServableError::internal(
                    "Tokenize endpoint should not reach prepare_inputs stage",
                ))
            }
        };

        let add_special_tokens = endpoint == Endpoint::Completions;
        let input_ids = properties
            .tokenizer
            .encode(&text, add_special_tokens)
            .map_err(|err| ServableError::internal(format!("{err:#}")))?;

        if let Some(max_model_length) = properties.max_model_length {
            if input_ids.len() > max_model_length {
                let message = format!(
                    "Number of prompt tokens: {} exceeds model max length: {max_model_length}",
                    input_ids.len()
                );
                log::error!("[servable][inputs] {message}");
                return Err(ServableError::invalid(message));
            }
            if let Some(max_tokens) = handler.max_tokens() {
                if input_ids.len() + max_tokens as usize > max_model_length {
                    let message = format!(
                        "Number of prompt tokens: {} + max tokens value: {max_tokens} exceeds model max length: {max_model_length}",
                        input_ids.len()
                    );
                    log::error!("[servable][inputs] {message}");
                    return Err(ServableError::invalid(message));
                }
            }
        }

        if let Admission::Legacy(_) = self.admission {
            legacy::validate_input_length(properties, input_ids.len())?;
        }

        log::trace!("[servable][inputs] prompt: {text:?}");
        log::debug!("[servable][inputs] prompt tokens: {}", input_ids.len());
        let prompt_tokens = input_ids.len();
        ctx.input_ids = input_ids;
        ctx.api_handler_mut()?.set_prompt_tokens_usage(prompt_tokens);
        Ok(())
    }

    /// Hands the request to the engine. Called at most once per context.
    pub fn schedule_execution(&self, ctx: &mut ExecutionContext) -> Result<()> {
        ctx.transition(
            "schedule_execution",
            &[ContextState::InputsPrepared],
            ContextState::Scheduled,
        )?;
        ctx.ensure_connected()?;
        match &self.admission {
            Admission::ContinuousBatching(backend) => backend.schedule(ctx),
            Admission::Legacy(backend) => backend.schedule(ctx),
        }
    }

    /// Blocks until the whole generation is available.
    pub fn read_complete_execution_results(&self, ctx: &mut ExecutionContext) -> Result<()> {
        ctx.transition(
            "read_complete_execution_results",
            &[ContextState::Scheduled],
            ContextState::ReadingComplete,
        )?;
        ctx.ensure_connected()?;
        match &self.admission {
            Admission::ContinuousBatching(backend) => backend.read_complete(ctx),
            Admission::Legacy(backend) => backend.read_complete(ctx),
        }
    }

    pub fn prepare_complete_response(&self, ctx: &mut ExecutionContext) -> Result<()> {
        if ctx.is_tokenize() {
            ctx.transition(
                "prepare_complete_response",
                &[ContextState::Parsed],
                ContextState::Done,
            )?;
            let request = ctx
                .tokenize
                .as_ref()
                .ok_or_else(|| ServableError::internal("tokenize request is not parsed"))?;
            ctx.response = request.process(self.properties.tokenizer.as_ref())?;
            return Ok(());
        }

        ctx.transition(
            "prepare_complete_response",
            &[ContextState::ReadingComplete],
            ContextState::Done,
        )?;
        if let Admission::Legacy(_) = self.admission {
            ctx.ensure_connected()?;
        }
        if ctx.generation_outputs.is_empty() {
            return Err(ServableError::internal("No generation outputs available"));
        }
        let outputs = std::mem::take(&mut ctx.generation_outputs);
        ctx.response = ctx.api_handler_mut()?.serialize_unary_response(&outputs)?;
        ctx.generation_outputs = outputs;
        log::debug!("[servable][response] complete: {}", ctx.response);
        Ok(())
    }

    /// One streaming read. Waits at most one engine poll interval.
    pub fn read_partial_execution_results(&self, ctx: &mut ExecutionContext) -> Result<()> {
        ctx.transition(
            "read_partial_execution_results",
            &[ContextState::Scheduled, ContextState::PartialPrepared],
            ContextState::ReadingPartial,
        )?;
        match &self.admission {
            Admission::ContinuousBatching(backend) => backend.read_partial(ctx),
            Admission::Legacy(_) => Ok(()),
        }
    }

    pub fn prepare_partial_response(&self, ctx: &mut ExecutionContext) -> Result<()> {
        ctx.transition(
            "prepare_partial_response",
            &[ContextState::ReadingPartial],
            ContextState::PartialPrepared,
        )?;
        match &self.admission {
            Admission::ContinuousBatching(backend) => backend.prepare_partial(ctx)?,
            Admission::Legacy(backend) => {
                backend.prepare_partial(ctx, self.properties.tokenizer.as_ref())?
            }
        }
        if !ctx.send_loopback_signal {
            ctx.state = ContextState::Done;
        }
        Ok(())
    }
}

/// Emits a delta chunk for `text`, if any, and asks for another iteration.
fn continue_stream(ctx: &mut ExecutionContext, text: &str) -> Result<()> {
    if !text.is_empty() {
        let chunk = ctx
            .api_handler()?
            .serialize_streaming_chunk(text, GenerationFinishReason::None)?;
        ctx.response = wrap_sse(&chunk);
        log::trace!("[servable][response] partial: {}", ctx.response);
    }
    ctx.send_loopback_signal = true;
    Ok(())
}

/// Emits the terminal chunk, the usage chunk when requested and `[DONE]`.
fn finish_stream(
    ctx: &mut ExecutionContext,
    text: &str,
    finish_reason: GenerationFinishReason,
) -> Result<()> {
    let handler = ctx.api_handler()?;
    let mut response = wrap_sse(&handler.serialize_streaming_chunk(text, finish_reason)?);
    if handler.stream_options().include_usage {
        response += &wrap_sse(&handler.serialize_streaming_usage_chunk()?);
    }
    response += &wrap_sse(SSE_DONE);
    log::debug!("[servable][response] final: {response}");
    ctx.response = response;
    ctx.send_loopback_signal = false;
    Ok(())
}
