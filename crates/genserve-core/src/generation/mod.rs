use serde::{Deserialize, Serialize};

use crate::{
    apis::openai::OpenAiRequest,
    engine::{GenerationConfig, StructuredOutputConfig},
};

pub mod tools;

pub use tools::{tool_grammar, ToolDefinition};

/// Stop string appended when a response format constrains the output.
pub const STRUCTURED_OUTPUT_STOP: &str = "#";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecodingMethod {
    #[default]
    Standard,
    SpeculativeDecoding,
    PromptLookup,
}

/// Builds the engine config for one request on top of the servable's base config.
#[derive(Debug, Clone)]
pub struct GenerationConfigBuilder {
    config: GenerationConfig,
    decoding_method: DecodingMethod,
}

impl GenerationConfigBuilder {
    pub fn new(base: GenerationConfig, decoding_method: DecodingMethod) -> Self {
        Self {
            config: base,
            decoding_method,
        }
    }

    pub fn parse_config_from_request(&mut self, request: &OpenAiRequest) {
        let config = &mut self.config;
        config.apply_chat_template = false;
        if let Some(max_tokens) = request.max_tokens {
            config.max_new_tokens = max_tokens as usize;
        }
        if let Some(max_model_length) = request.max_model_length {
            config.max_length = max_model_length;
        }
        if let Some(ignore_eos) = request.ignore_eos {
            config.ignore_eos = ignore_eos;
        }
        config.echo = request.echo;

        config.num_beam_groups = 1;
        config.num_beams = 1;
        config.no_repeat_ngram_size = usize::MAX;
        if let Some(best_of) = request.best_of {
            config.num_beams = best_of as usize;
        }

        if let Some(n) = request.num_return_sequences {
            config.num_return_sequences = n as usize;
        }
        if let Some(penalty) = request.repetition_penalty {
            config.repetition_penalty = penalty;
        }
        if let Some(penalty) = request.length_penalty {
            config.length_penalty = penalty;
        }
        if let Some(penalty) = request.diversity_penalty {
            config.diversity_penalty = penalty;
        }

        if let Some(temperature) = request.temperature {
            config.temperature = temperature;
        }
        if let Some(top_k) = request.top_k {
            config.top_k = usize::try_from(top_k).unwrap_or(usize::MAX);
        }
        if let Some(top_p) = request.top_p {
            config.top_p = top_p;
        }
        if let Some(seed) = request.seed {
            config.rng_seed = seed;
        }
        if let Some(stop) = &request.stop {
            config.stop_strings = stop.clone();
        }
        if let Some(include) = request.include_stop_str_in_output {
            config.include_stop_str_in_output = include;
        }
        if let Some(penalty) = request.frequency_penalty {
            config.frequency_penalty = penalty;
        }
        if let Some(penalty) = request.presence_penalty {
            config.presence_penalty = penalty;
        }
        config.do_sample = config.temperature > 0.0 && config.num_beams == 1;

        if request.logprobs_chat || request.logprobs > 0 {
            config.logprobs = 1;
        }

        if let Some(tokens) = request.num_assistant_tokens {
            config.num_assistant_tokens = tokens;
        }
        if let Some(threshold) = request.assistant_confidence_threshold {
            config.assistant_confidence_threshold = threshold;
        }
        if let Some(size) = request.max_ngram_size {
            config.max_ngram_size = size;
        }

        if let Some(schema) = &request.response_format {
            config.structured_output_config = Some(StructuredOutputConfig {
                json_schema: Some(schema.clone()),
                structural_tags_config: None,
            });
            config.stop_strings.insert(STRUCTURED_OUTPUT_STOP.to_owned());
        }
    }

    /// Constrains tool calls with the grammar of `tool_parser`. Unknown parsers and
    /// requests without tools leave the config untouched.
    pub fn apply_tool_guidance(&mut self, tool_parser: Option<&str>, tools: &[ToolDefinition]) {
        if tools.is_empty() {
            return;
        }
        let Some(grammar) = tool_parser.and_then(tool_grammar) else {
            return;
        };
        let tags = grammar(tools);
        match &mut self.config.structured_output_config {
            Some(structured) => structured.structural_tags_config = Some(tags),
            None => {
                self.config.structured_output_config = Some(StructuredOutputConfig {
                    json_schema: None,
                    structural_tags_config: Some(tags),
                })
            }
        }
    }

    pub fn adjust_config_for_decoding_method(&mut self) {
        let config = &mut self.config;
        match self.decoding_method {
            DecodingMethod::Standard => {}
            DecodingMethod::SpeculativeDecoding => {
                if config.num_assistant_tokens == 0 && config.assistant_confidence_threshold == 0.0 {
                    config.num_assistant_tokens = 5;
                }
            }
            DecodingMethod::PromptLookup => {
                if config.num_assistant_tokens == 0 {
                    config.num_assistant_tokens = 5;
                }
                if config.max_ngram_size == 0 {
                    config.max_ngram_size = 3;
                }
            }
        }
    }

    /// Drops a structured output config the engine would reject.
    pub fn validate_structured_output_config(&mut self) {
        let invalid = match &self.config.structured_output_config {
            Some(structured) => structured.validate().err(),
            None => None,
        };
        if let Some(err) = invalid {
            log::debug!("[generation][structured] dropping invalid config: {err:#}");
            self.config.structured_output_config = None;
        }
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    pub fn build(self) -> GenerationConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(request: OpenAiRequest, method: DecodingMethod) -> GenerationConfig {
        let mut builder = GenerationConfigBuilder::new(GenerationConfig::default(), method);
        builder.parse_config_from_request(&request);
        builder.adjust_config_for_decoding_method();
        builder.build()
    }

    #[test]
    fn test_defaults_from_empty_request() {
        let config = build(OpenAiRequest::default(), DecodingMethod::Standard);
        assert!(!config.apply_chat_template);
        assert_eq!(config.num_beams, 1);
        assert_eq!(config.num_beam_groups, 1);
        assert_eq!(config.no_repeat_ngram_size, usize::MAX);
        assert!(config.do_sample);
        assert_eq!(config.logprobs, 0);
    }

    #[test]
    fn test_best_of_disables_sampling() {
        let config = build(
            OpenAiRequest {
                best_of: Some(3),
                num_return_sequences: Some(2),
                ..Default::default()
            },
            DecodingMethod::Standard,
        );
        assert_eq!(config.num_beams, 3);
        assert_eq!(config.num_return_sequences, 2);
        assert!(!config.do_sample);
    }

    #[test]
    fn test_zero_temperature_is_greedy() {
        let config = build(
            OpenAiRequest {
                temperature: Some(0.0),
                ..Default::default()
            },
            DecodingMethod::Standard,
        );
        assert!(!config.do_sample);
    }

    #[test]
    fn test_response_format_adds_sentinel_stop() {
        let config = build(
            OpenAiRequest {
                response_format: Some(r#"{"type":"object"}"#.into()),
                ..Default::default()
            },
            DecodingMethod::Standard,
        );
        assert!(config.stop_strings.contains(STRUCTURED_OUTPUT_STOP));
        assert!(config.structured_output_config.is_some());
    }

    #[test]
    fn test_speculative_defaults() {
        let config = build(OpenAiRequest::default(), DecodingMethod::SpeculativeDecoding);
        assert_eq!(config.num_assistant_tokens, 5);

        let config = build(
            OpenAiRequest {
                assistant_confidence_threshold: Some(0.4),
                ..Default::default()
            },
            DecodingMethod::SpeculativeDecoding,
        );
        assert_eq!(config.num_assistant_tokens, 0);
    }

    #[test]
    fn test_prompt_lookup_defaults() {
        let config = build(OpenAiRequest::default(), DecodingMethod::PromptLookup);
        assert_eq!(config.num_assistant_tokens, 5);
        assert_eq!(config.max_ngram_size, 3);
    }

    #[test]
    fn test_tool_guidance_for_known_parser() {
        let mut builder =
            GenerationConfigBuilder::new(GenerationConfig::default(), DecodingMethod::Standard);
        let tools = [ToolDefinition {
            name: "lookup".into(),
            parameters: "{}".into(),
        }];
        builder.apply_tool_guidance(Some("phi4"), &tools);
        let tags = builder
            .config()
            .structured_output_config
            .as_ref()
            .and_then(|structured| structured.structural_tags_config.as_ref())
            .expect("test");
        assert_eq!(tags.triggers, vec!["functools["]);

        let mut builder =
            GenerationConfigBuilder::new(GenerationConfig::default(), DecodingMethod::Standard);
        builder.apply_tool_guidance(Some("unknown"), &tools);
        assert!(builder.config().structured_output_config.is_none());
    }

    #[test]
    fn test_invalid_structured_output_is_dropped() {
        let mut builder =
            GenerationConfigBuilder::new(GenerationConfig::default(), DecodingMethod::Standard);
        builder.parse_config_from_request(&OpenAiRequest {
            response_format: Some("not json".into()),
            ..Default::default()
        });
        builder.validate_structured_output_config();
        assert!(builder.config().structured_output_config.is_none());
    }
}
