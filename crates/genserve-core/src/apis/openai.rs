//! OpenAI completions and chat completions: request validation, usage accounting and
//! response serialization.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::Serialize;
use serde_json::{Map, Value};

use super::{Endpoint, FinishReason, Usage};
use crate::{
    engine::{GenerationConfig, GenerationFinishReason, GenerationOutput, Tokenizer},
    error::{Result, ServableError},
    generation::{DecodingMethod, GenerationConfigBuilder, ToolDefinition},
    template::{ChatHistory, ChatMessage},
};

/// `max_tokens` used (and allowed at most) when `ignore_eos` is set.
pub const IGNORE_EOS_MAX_TOKENS_LIMIT: u32 = 4000;
/// Maximum number of stop strings.
pub const MAX_STOP_STRINGS: usize = 4;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    pub include_usage: bool,
}

/// Validated request parameters.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct OpenAiRequest {
    pub chat_history: ChatHistory,
    pub prompt: Option<String>,
    pub image_count: usize,
    pub stream: bool,
    pub stream_options: StreamOptions,
    pub model: String,
    pub max_tokens: Option<u32>,
    pub max_model_length: Option<usize>,
    pub ignore_eos: Option<bool>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub repetition_penalty: Option<f32>,
    pub diversity_penalty: Option<f32>,
    pub length_penalty: Option<f32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<i32>,
    pub seed: Option<u64>,
    pub stop: Option<BTreeSet<String>>,
    pub include_stop_str_in_output: Option<bool>,
    pub best_of: Option<u32>,
    pub num_return_sequences: Option<u32>,
    /// Completions: number of logprobs, 0 or 1.
    pub logprobs: u32,
    /// Chat completions: whether logprobs are returned.
    pub logprobs_chat: bool,
    pub echo: bool,
    pub num_assistant_tokens: Option<usize>,
    pub assistant_confidence_threshold: Option<f32>,
    pub max_ngram_size: Option<usize>,
    /// JSON schema the output must follow, serialized.
    pub response_format: Option<String>,
    pub tools: Vec<ToolDefinition>,
}

fn invalid<T>(message: impl Into<String>) -> Result<T> {
    Err(ServableError::invalid(message))
}

fn as_u32(value: &Value) -> Option<u32> {
    value.as_u64().and_then(|value| u32::try_from(value).ok())
}

fn as_number(value: &Value, name: &str) -> Result<f32> {
    match value.as_f64() {
        Some(value) => Ok(value as f32),
        None => invalid(format!("{name} is not a valid number")),
    }
}

fn as_bool(value: &Value, message: &str) -> Result<bool> {
    value.as_bool().map_or_else(|| invalid(message), Ok)
}

/// Parses a token count field the way `max_tokens` and `max_completion_tokens` are parsed.
fn parse_token_limit(value: &Value, name: &str, limit: u32, ignore_eos: bool) -> Result<u32> {
    let Some(tokens) = as_u32(value) else {
        if value.as_u64().is_some() {
            return invalid(format!("{name} value can't be greater than 4294967295"));
        }
        return invalid(format!("{name} is not an unsigned integer"));
    };
    if tokens >= limit {
        return invalid(format!(
            "{name} exceeds limit provided in graph config: {limit}"
        ));
    }
    if ignore_eos && tokens > IGNORE_EOS_MAX_TOKENS_LIMIT {
        return invalid(format!(
            "when ignore_eos is true {name} can not be greater than {IGNORE_EOS_MAX_TOKENS_LIMIT}"
        ));
    }
    Ok(tokens)
}

#[derive(Debug, Serialize)]
struct ChatRecord {
    content: String,
    role: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum ChoiceContent {
    Message(ChatRecord),
    Text(String),
}

#[derive(Debug, Serialize)]
struct TokenLogprob {
    token: String,
    logprob: Option<f32>,
    bytes: Vec<u8>,
    top_logprobs: Vec<TokenLogprob>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Logprobs {
    Chat {
        content: Vec<TokenLogprob>,
    },
    Completion {
        tokens: Vec<String>,
        token_logprobs: Vec<Option<f32>>,
        top_logprobs: Vec<HashMap<String, Option<f32>>>,
        text_offset: Vec<usize>,
    },
}

#[derive(Debug, Serialize)]
struct Choice {
    finish_reason: FinishReason,
    index: usize,
    logprobs: Option<Logprobs>,
    #[serde(flatten)]
    content: ChoiceContent,
}

#[derive(Debug, Serialize)]
struct UnaryResponse<'a> {
    choices: Vec<Choice>,
    created: u64,
    model: &'a str,
    object: &'static str,
    usage: Usage,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum ChunkContent {
    Delta { content: String },
    Text(String),
}

#[derive(Debug, Serialize)]
struct ChunkChoice {
    finish_reason: FinishReason,
    index: usize,
    logprobs: Option<()>,
    #[serde(flatten)]
    content: ChunkContent,
}

#[derive(Debug, Serialize)]
struct ChunkResponse<'a> {
    choices: Vec<ChunkChoice>,
    created: u64,
    model: &'a str,
    object: &'static str,
    /// `Some(None)` renders `"usage": null`.
    #[serde(skip_serializing_if = "Option::is_none")]
    usage: Option<Option<Usage>>,
}

/// Log probabilities are `ln p`, anything above zero is reported as unknown.
fn logprob_value(logprob: f32) -> Option<f32> {
    (logprob <= 0.0).then_some(logprob)
}

pub struct OpenAiHandler {
    json: Value,
    endpoint: Endpoint,
    created: SystemTime,
    tokenizer: Arc<dyn Tokenizer>,
    request: OpenAiRequest,
    usage: Usage,
    processed_tokens: usize,
}

impl std::fmt::Debug for OpenAiHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiHandler")
            .field("endpoint", &self.endpoint)
            .field("request", &self.request)
            .field("usage", &self.usage)
            .finish()
    }
}

impl OpenAiHandler {
    pub fn new(
        json: Value,
        endpoint: Endpoint,
        created: SystemTime,
        tokenizer: Arc<dyn Tokenizer>,
    ) -> Self {
        Self {
            json,
            endpoint,
            created,
            tokenizer,
            request: OpenAiRequest::default(),
            usage: Usage::default(),
            processed_tokens: 0,
        }
    }

    pub fn parse_request(
        &mut self,
        max_tokens_limit: u32,
        best_of_limit: u32,
        max_model_length: Option<usize>,
    ) -> Result<()> {
        let json = std::mem::take(&mut self.json);
        let result = match json.as_object() {
            Some(object) => self.parse_object(object, max_tokens_limit, best_of_limit),
            None => invalid("Received json is not an object"),
        };
        self.json = json;
        self.request.max_model_length = max_model_length;
        result
    }

    fn parse_object(
        &mut self,
        object: &Map<String, Value>,
        max_tokens_limit: u32,
        best_of_limit: u32,
    ) -> Result<()> {
        self.parse_common_part(object, max_tokens_limit, best_of_limit)?;
        match self.endpoint {
            Endpoint::Completions => self.parse_completions_part(object),
            _ => self.parse_chat_completions_part(object, max_tokens_limit),
        }
    }

    fn parse_common_part(
        &mut self,
        object: &Map<String, Value>,
        max_tokens_limit: u32,
        best_of_limit: u32,
    ) -> Result<()> {
        let request = &mut self.request;

        if let Some(value) = object.get("stream") {
            request.stream = as_bool(value, "Stream is not bool")?;
        }

        if let Some(value) = object.get("stream_options") {
            if !request.stream {
                return invalid("stream_options provided, but stream not set to true");
            }
            let Some(options) = value.as_object() else {
                return invalid("stream_options is not an object");
            };
            let mut found = 0;
            if let Some(value) = options.get("include_usage") {
                request.stream_options.include_usage =
                    as_bool(value, "stream_options.include_usage is not a boolean")?;
                found += 1;
            }
            if options.len() > found {
                return invalid(
                    "Found unexpected stream options. Properties accepted in stream_options: include_usage",
                );
            }
        }

        match object.get("model") {
            Some(Value::String(model)) => request.model = model.clone(),
            Some(_) => return invalid("model is not a string"),
            None => return invalid("model missing in request"),
        }

        if let Some(value) = object.get("ignore_eos") {
            request.ignore_eos = Some(as_bool(value, "ignore_eos accepts values true or false")?);
        }
        let ignore_eos = request.ignore_eos.unwrap_or_default();

        if let Some(value) = object.get("max_tokens") {
            request.max_tokens = Some(parse_token_limit(
                value,
                "max_tokens",
                max_tokens_limit,
                ignore_eos,
            )?);
        }
        if ignore_eos && request.max_tokens.is_none() {
            request.max_tokens = Some(IGNORE_EOS_MAX_TOKENS_LIMIT);
        }

        if let Some(value) = object.get("frequency_penalty") {
            let penalty = as_number(value, "frequency_penalty")?;
            if !(-2.0..=2.0).contains(&penalty) {
                return invalid("frequency_penalty out of range(-2.0, 2.0)");
            }
            request.frequency_penalty = Some(penalty);
        }
        if let Some(value) = object.get("presence_penalty") {
            let penalty = as_number(value, "presence_penalty")?;
            if !(-2.0..=2.0).contains(&penalty) {
                return invalid("presence_penalty out of range(-2.0, 2.0)");
            }
            request.presence_penalty = Some(penalty);
        }
        if let Some(value) = object.get("repetition_penalty") {
            request.repetition_penalty = Some(as_number(value, "repetition_penalty")?);
        }
        if let Some(value) = object.get("diversity_penalty") {
            request.diversity_penalty = Some(as_number(value, "diversity_penalty")?);
        }
        if let Some(value) = object.get("length_penalty") {
            request.length_penalty = Some(as_number(value, "length_penalty")?);
        }

        if let Some(value) = object.get("temperature") {
            let temperature = as_number(value, "temperature")?;
            if !(0.0..=2.0).contains(&temperature) {
                return invalid("temperature out of range(0.0, 2.0)");
            }
            request.temperature = Some(temperature);
        }
        if let Some(value) = object.get("top_p") {
            let top_p = as_number(value, "top_p")?;
            if !(0.0..=1.0).contains(&top_p) {
                return invalid("top_p out of range(0.0, 1.0)");
            }
            request.top_p = Some(top_p);
        }
        if let Some(value) = object.get("top_k") {
            let Some(top_k) = value.as_i64().and_then(|top_k| i32::try_from(top_k).ok()) else {
                return invalid("top_k is not an integer");
            };
            request.top_k = Some(top_k);
        }
        if let Some(value) = object.get("seed") {
            let Some(seed) = as_u32(value) else {
                return invalid("seed is not an unsigned integer");
            };
            request.seed = Some(seed.into());
        }

        if let Some(value) = object.get("stop") {
            match value {
                Value::String(stop) => request.stop = Some([stop.clone()].into()),
                Value::Array(stops) => {
                    if stops.len() > MAX_STOP_STRINGS {
                        return invalid("stop array must have no more than 4 strings");
                    }
                    if !stops.is_empty() {
                        let stops = stops
                            .iter()
                            .map(|stop| match stop {
                                Value::String(stop) => Ok(stop.clone()),
                                _ => invalid("stop array contains non string element"),
                            })
                            .collect::<Result<BTreeSet<_>>>()?;
                        request.stop = Some(stops);
                    }
                }
                _ => return invalid("stop is not a string or array of strings"),
            }
        }

        if request.stream {
            request.include_stop_str_in_output = Some(true);
        }
        if let Some(value) = object.get("include_stop_str_in_output") {
            let include = as_bool(value, "include_stop_str_in_output accepts values true or false")?;
            if !include && request.stream {
                return invalid("include_stop_str_in_output cannot be set to false if streaming is used");
            }
            request.include_stop_str_in_output = Some(include);
        }

        if let Some(value) = object.get("best_of") {
            let Some(best_of) = as_u32(value) else {
                return invalid("best_of is not an unsigned integer");
            };
            if best_of == 0 {
                return invalid("best_of value should be greater than 0");
            }
            if best_of >= best_of_limit {
                return invalid(format!(
                    "best_of exceeds limit provided in graph config: {best_of_limit}"
                ));
            }
            if request.stream {
                return invalid("best_of cannot be used in streaming mode");
            }
            request.best_of = Some(best_of);
        }

        if let Some(value) = object.get("n") {
            let Some(n) = as_u32(value) else {
                return invalid("n is not an unsigned integer");
            };
            if n == 0 {
                return invalid("n value should be greater than 0");
            }
            if request.best_of.unwrap_or(1) < n {
                return invalid("n value cannot be greater than best_of");
            }
            request.num_return_sequences = Some(n);
        }

        if let Some(value) = object.get("num_assistant_tokens") {
            let Some(tokens) = as_u32(value) else {
                return invalid("num_assistant_tokens is not an unsigned integer");
            };
            request.num_assistant_tokens = Some(tokens as usize);
        }
        if let Some(value) = object.get("assistant_confidence_threshold") {
            request.assistant_confidence_threshold =
                Some(as_number(value, "assistant_confidence_threshold")?);
        }
        if request.num_assistant_tokens.is_some() && request.assistant_confidence_threshold.is_some() {
            return invalid(
                "num_assistant_tokens and assistant_confidence_threshold are mutually exclusive and cannot both be set.",
            );
        }
        if let Some(value) = object.get("max_ngram_size") {
            let Some(size) = as_u32(value) else {
                return invalid("max_ngram_size is not an unsigned integer");
            };
            request.max_ngram_size = Some(size as usize);
        }

        if let Some(value) = object.get("response_format") {
            request.response_format = Self::parse_response_format(value)?;
        }

        Ok(())
    }

    fn parse_response_format(value: &Value) -> Result<Option<String>> {
        let Some(format) = value.as_object() else {
            return invalid("response_format is not an object");
        };
        match format.get("type").and_then(Value::as_str) {
            Some("text") => Ok(None),
            Some("json_object") => Ok(Some(r#"{"type": "object"}"#.to_owned())),
            Some("json_schema") => match format.get("json_schema").and_then(|schema| schema.get("schema")) {
                Some(schema) => Ok(Some(schema.to_string())),
                None => invalid("response_format.json_schema.schema is missing"),
            },
            Some(_) => invalid("Unsupported response_format type"),
            None => invalid("response_format.type is not a string"),
        }
    }

    fn parse_completions_part(&mut self, object: &Map<String, Value>) -> Result<()> {
        let request = &mut self.request;

        match object.get("prompt") {
            Some(Value::String(prompt)) => request.prompt = Some(prompt.clone()),
            Some(_) => return invalid("prompt is not a string"),
            None => {}
        }
        if request.prompt.as_deref().unwrap_or_default().is_empty() {
            return invalid("prompt is missing");
        }

        match object.get("logprobs") {
            None | Some(Value::Null) => {}
            Some(value) => match value.as_i64() {
                Some(1) => request.logprobs = 1,
                Some(_) => return invalid("accepted logprobs value is currently 1 only"),
                None => return invalid("logprobs accepts integer values"),
            },
        }
        if request.logprobs > 0 && request.stream {
            return invalid("logprobs are not supported in streaming mode.");
        }

        if let Some(value) = object.get("echo") {
            request.echo = as_bool(value, "echo accepts values true or false")?;
        }
        if request.max_tokens == Some(0) && !request.echo {
            return invalid("max_tokens value should be greater than 0 unless echo is set");
        }
        Ok(())
    }

    fn parse_chat_completions_part(
        &mut self,
        object: &Map<String, Value>,
        max_tokens_limit: u32,
    ) -> Result<()> {
        self.parse_messages(object)?;
        self.parse_tools(object)?;
        let request = &mut self.request;

        if let Some(value) = object.get("logprobs") {
            request.logprobs_chat = as_bool(value, "logprobs accepts values true or false")?;
        }
        if request.logprobs_chat && request.stream {
            return invalid("logprobs are not supported in streaming mode.");
        }

        if let Some(value) = object.get("max_completion_tokens") {
            request.max_tokens = Some(parse_token_limit(
                value,
                "max_completion_tokens",
                max_tokens_limit,
                request.ignore_eos.unwrap_or_default(),
            )?);
        }
        if request.max_tokens == Some(0) {
            return invalid("max_tokens value should be greater than 0");
        }
        Ok(())
    }

    fn parse_messages(&mut self, object: &Map<String, Value>) -> Result<()> {
        let messages = match object.get("messages") {
            None => return invalid("Messages missing in request"),
            Some(Value::Array(messages)) => messages,
            Some(_) => return invalid("Messages are not an array"),
        };
        if messages.is_empty() {
            return invalid("Messages array cannot be empty");
        }

        let mut history = ChatHistory::with_capacity(messages.len());
        for message in messages {
            let Some(message) = message.as_object() else {
                return invalid("Message is not a JSON object");
            };
            let Some(role) = message.get("role").and_then(Value::as_str) else {
                return invalid("Invalid message structure");
            };
            let content = match message.get("content") {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(content)) => content.clone(),
                Some(Value::Array(parts)) => self.parse_content_parts(parts)?,
                Some(_) => {
                    return invalid("Invalid message structure - content should be string or array")
                }
            };
            history.push(ChatMessage {
                role: role.to_owned(),
                content,
            });
        }
        self.request.chat_history = history;
        Ok(())
    }

    /// Returns the text of a multi-part content and counts its images.
    fn parse_content_parts(&mut self, parts: &[Value]) -> Result<String> {
        if parts.is_empty() {
            return invalid("Invalid message structure - content array is empty");
        }
        let mut text = String::new();
        for part in parts {
            let Some(part) = part.as_object() else {
                return invalid("Invalid message structure - content array should contain objects");
            };
            match part.get("type").and_then(Value::as_str) {
                Some("text") => match part.get("text").and_then(Value::as_str) {
                    Some(part) => text = part.to_owned(),
                    None => return invalid("Invalid message structure - content text missing"),
                },
                Some("image_url") => {
                    let Some(image) = part.get("image_url").and_then(Value::as_object) else {
                        return invalid("Invalid message structure - content image_url missing");
                    };
                    let Some(url) = image.get("url").and_then(Value::as_str) else {
                        return invalid("Invalid message structure - image_url does not have url field");
                    };
                    if !url.contains("base64,") {
                        return invalid(
                            "Url should contain base64 encoded string followed by \"base64,\" prefix",
                        );
                    }
                    self.request.image_count += 1;
                }
                Some(_) => return invalid("Unsupported content type"),
                None => return invalid("Invalid message structure - content object type missing"),
            }
        }
        Ok(text)
    }

    fn parse_tools(&mut self, object: &Map<String, Value>) -> Result<()> {
        let tools = match object.get("tools") {
            None | Some(Value::Null) => return Ok(()),
            Some(Value::Array(tools)) => tools,
            Some(_) => return invalid("Tools are not an array"),
        };

        let mut definitions = Vec::with_capacity(tools.len());
        for tool in tools {
            let Some(tool) = tool.as_object() else {
                return invalid("Tool is not a JSON object");
            };
            let Some(function) = tool.get("function").and_then(Value::as_object) else {
                return invalid("Tool function is missing");
            };
            let Some(name) = function.get("name").and_then(Value::as_str) else {
                return invalid("Tool function name is missing");
            };
            let parameters = function
                .get("parameters")
                .map(Value::to_string)
                .unwrap_or_else(|| r#"{"type": "object"}"#.to_owned());
            definitions.push(ToolDefinition {
                name: name.to_owned(),
                parameters,
            });
        }

        match object.get("tool_choice") {
            None | Some(Value::Null) => {}
            Some(Value::String(choice)) => match choice.as_str() {
                "none" => definitions.clear(),
                "auto" | "required" => {}
                _ => return invalid("tool_choice is not a valid string or object"),
            },
            Some(Value::Object(choice)) => {
                let Some(name) = choice
                    .get("function")
                    .and_then(|function| function.get("name"))
                    .and_then(Value::as_str)
                else {
                    return invalid("tool_choice is not a valid string or object");
                };
                definitions.retain(|tool| tool.name == name);
                if definitions.is_empty() {
                    return invalid(format!("tool_choice refers to unknown tool: {name}"));
                }
            }
            Some(_) => return invalid("tool_choice is not a valid string or object"),
        }

        self.request.tools = definitions;
        Ok(())
    }

    pub fn request(&self) -> &OpenAiRequest {
        &self.request
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn is_stream(&self) -> bool {
        self.request.stream
    }

    pub fn stream_options(&self) -> StreamOptions {
        self.request.stream_options
    }

    pub fn model(&self) -> &str {
        &self.request.model
    }

    pub fn chat_history(&self) -> &ChatHistory {
        &self.request.chat_history
    }

    pub fn prompt(&self) -> Option<&str> {
        self.request.prompt.as_deref()
    }

    pub fn max_tokens(&self) -> Option<u32> {
        self.request.max_tokens
    }

    pub fn usage(&self) -> Usage {
        self.usage.totalled()
    }

    pub fn set_prompt_tokens_usage(&mut self, prompt_tokens: usize) {
        self.usage.prompt_tokens = prompt_tokens;
    }

    /// Counts streamed tokens. With `echo` the prompt comes back first and is not a completion.
    pub fn increment_processed_tokens(&mut self, tokens: usize) {
        self.processed_tokens += tokens;
        if !self.request.echo || self.processed_tokens > self.usage.prompt_tokens {
            self.usage.completion_tokens += tokens;
        }
    }

    pub fn create_generation_config(
        &self,
        base: &GenerationConfig,
        decoding_method: DecodingMethod,
        tool_parser: Option<&str>,
        enable_tool_guided_generation: bool,
    ) -> GenerationConfig {
        let mut builder = GenerationConfigBuilder::new(base.clone(), decoding_method);
        builder.parse_config_from_request(&self.request);
        if enable_tool_guided_generation {
            builder.apply_tool_guidance(tool_parser, &self.request.tools);
        }
        builder.adjust_config_for_decoding_method();
        builder.validate_structured_output_config();
        builder.build()
    }

    fn created_secs(&self) -> u64 {
        self.created
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_secs())
            .unwrap_or_default()
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(tokens)
            .map_err(|err| ServableError::internal(format!("{err:#}")))
    }

    fn serialize_logprobs(&self, output: &GenerationOutput) -> Result<Option<Logprobs>> {
        if !self.request.logprobs_chat && self.request.logprobs == 0 {
            return Ok(None);
        }
        let ids = &output.generated_ids;
        let logprob = |index: usize| {
            output
                .generated_log_probs
                .get(index)
                .copied()
                .and_then(logprob_value)
        };
        let tokens = ids
            .iter()
            .map(|&id| self.decode(&[id]))
            .collect::<Result<Vec<_>>>()?;

        let logprobs = match self.endpoint {
            Endpoint::ChatCompletions => Logprobs::Chat {
                content: tokens
                    .into_iter()
                    .enumerate()
                    .map(|(index, token)| TokenLogprob {
                        bytes: token.as_bytes().to_vec(),
                        token,
                        logprob: logprob(index),
                        top_logprobs: vec![],
                    })
                    .collect(),
            },
            _ => {
                let text_offset = (0..ids.len())
                    .map(|index| match index {
                        0 => Ok(0),
                        _ => self.decode(&ids[..index]).map(|text| text.len()),
                    })
                    .collect::<Result<Vec<_>>>()?;
                Logprobs::Completion {
                    token_logprobs: (0..ids.len()).map(logprob).collect(),
                    top_logprobs: tokens
                        .iter()
                        .enumerate()
                        .map(|(index, token)| [(token.clone(), logprob(index))].into())
                        .collect(),
                    tokens,
                    text_offset,
                }
            }
        };
        Ok(Some(logprobs))
    }

    pub fn serialize_unary_response(&mut self, outputs: &[GenerationOutput]) -> Result<String> {
        let mut choices = Vec::with_capacity(outputs.len());
        let mut completion_tokens = 0;
        for (index, output) in outputs.iter().enumerate() {
            log::trace!("[openai][unary] generated tokens: {:?}", output.generated_ids);
            let generated = output.generated_ids.len();
            completion_tokens += match self.request.echo {
                true => generated.saturating_sub(self.usage.prompt_tokens),
                false => generated,
            };
            let text = self.decode(&output.generated_ids)?;
            let content = match self.endpoint {
                Endpoint::ChatCompletions => ChoiceContent::Message(ChatRecord {
                    content: text,
                    role: "assistant",
                }),
                _ => ChoiceContent::Text(text),
            };
            choices.push(Choice {
                finish_reason: output.finish_reason.into(),
                index,
                logprobs: self.serialize_logprobs(output)?,
                content,
            });
        }
        self.usage.completion_tokens = completion_tokens;

        let object = match self.endpoint {
            Endpoint::ChatCompletions => "chat.completion",
            _ => "text_completion",
        };
        let response = UnaryResponse {
            choices,
            created: self.created_secs(),
            model: &self.request.model,
            object,
            usage: self.usage(),
        };
        serde_json::to_string(&response).map_err(|err| ServableError::internal(err.to_string()))
    }

    pub fn serialize_streaming_chunk(
        &self,
        text: &str,
        finish_reason: GenerationFinishReason,
    ) -> Result<String> {
        let (content, object) = match self.endpoint {
            Endpoint::ChatCompletions => (
                ChunkContent::Delta {
                    content: text.to_owned(),
                },
                "chat.completion.chunk",
            ),
            _ => (ChunkContent::Text(text.to_owned()), "text_completion.chunk"),
        };
        let chunk = ChunkResponse {
            choices: vec![ChunkChoice {
                finish_reason: finish_reason.into(),
                index: 0,
                logprobs: None,
                content,
            }],
            created: self.created_secs(),
            model: &self.request.model,
            object,
            usage: self.request.stream_options.include_usage.then_some(None),
        };
        serde_json::to_string(&chunk).map_err(|err| ServableError::internal(err.to_string()))
    }

    pub fn serialize_streaming_usage_chunk(&self) -> Result<String> {
        let object = match self.endpoint {
            Endpoint::ChatCompletions => "chat.completion.chunk",
            _ => "text_completion.chunk",
        };
        let chunk = ChunkResponse {
            choices: vec![],
            created: self.created_secs(),
            model: &self.request.model,
            object,
            usage: Some(Some(self.usage())),
        };
        serde_json::to_string(&chunk).map_err(|err| ServableError::internal(err.to_string()))
    }
}
