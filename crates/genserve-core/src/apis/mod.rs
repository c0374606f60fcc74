use serde::{Deserialize, Serialize};

use crate::engine::GenerationFinishReason;

pub mod openai;
pub mod tokenize;

pub use openai::{OpenAiHandler, OpenAiRequest};
pub use tokenize::TokenizeRequest;

pub const ALLOWED_ENDPOINTS_MESSAGE: &str =
    "Wrong endpoint. Allowed endpoints: /v3/chat/completions, /v3/completions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    ChatCompletions,
    Completions,
    Tokenize,
}

impl Endpoint {
    pub fn from_uri(uri: &str) -> Option<Self> {
        let path = uri.split('?').next().unwrap_or_default();
        match path {
            "/v3/chat/completions" | "/v3/v1/chat/completions" => Some(Self::ChatCompletions),
            "/v3/completions" | "/v3/v1/completions" => Some(Self::Completions),
            "/v3/tokenize" | "/v3/v1/tokenize" => Some(Self::Tokenize),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural stop point or a stop string.
    Stop,
    /// Incomplete output due to `max_tokens` or the model length.
    Length,
    /// Still in progress.
    #[default]
    #[serde(untagged)]
    Null,
}

impl From<GenerationFinishReason> for FinishReason {
    fn from(value: GenerationFinishReason) -> Self {
        match value {
            GenerationFinishReason::Stop => Self::Stop,
            GenerationFinishReason::Length => Self::Length,
            GenerationFinishReason::None => Self::Null,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl Usage {
    pub fn totalled(self) -> Self {
        Self {
            total_tokens: self.prompt_tokens + self.completion_tokens,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_from_uri() {
        assert_eq!(Endpoint::from_uri("/v3/v1/chat/completions"), Some(Endpoint::ChatCompletions));
        assert_eq!(Endpoint::from_uri("/v3/completions"), Some(Endpoint::Completions));
        assert_eq!(Endpoint::from_uri("/v3/tokenize"), Some(Endpoint::Tokenize));
        assert_eq!(Endpoint::from_uri("/v3/embeddings"), None);
    }

    #[test]
    fn test_finish_reason_serialization() {
        let json = serde_json::to_string(&[FinishReason::Stop, FinishReason::Length, FinishReason::Null])
            .expect("test");
        assert_eq!(json, r#"["stop","length",null]"#);
    }
}
