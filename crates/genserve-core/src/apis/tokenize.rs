use serde::Serialize;
use serde_json::Value;

use crate::{
    engine::Tokenizer,
    error::{Result, ServableError},
};

const FIELD: &str = "text";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PaddingSide {
    Left,
    #[default]
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizeRequest {
    pub text: Vec<String>,
    pub add_special_tokens: bool,
    pub max_length: Option<usize>,
    pub pad_to_max_length: bool,
    pub padding_side: PaddingSide,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Tokens {
    Single(Vec<u32>),
    Batch(Vec<Vec<u32>>),
}

#[derive(Debug, Serialize)]
struct TokenizeResponse {
    tokens: Tokens,
}

fn invalid<T>(message: impl Into<String>) -> Result<T> {
    Err(ServableError::invalid(message))
}

impl TokenizeRequest {
    pub fn parse(json: &Value) -> Result<Self> {
        let Some(object) = json.as_object() else {
            return invalid("Received json is not an object");
        };

        let text = match object.get(FIELD) {
            None => return invalid(format!("{FIELD} field is required")),
            Some(Value::String(text)) => vec![text.clone()],
            Some(Value::Array(items)) if items.is_empty() => {
                return invalid(format!("{FIELD} array should not be empty"))
            }
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(text) => Ok(text.clone()),
                    _ => invalid("Input should be string or array of strings"),
                })
                .collect::<Result<_>>()?,
            Some(_) => {
                return invalid(format!(
                    "{FIELD} should be string, array of strings or array of integers"
                ))
            }
        };

        let max_length = match object.get("max_length") {
            None => None,
            Some(value) => match value.as_u64() {
                Some(max_length) => Some(max_length as usize),
                None => return invalid("max_length should be integer"),
            },
        };
        let pad_to_max_length = match object.get("pad_to_max_length") {
            None => false,
            Some(value) => match value.as_bool() {
                Some(pad) => pad,
                None => return invalid("pad_to_max_length should be boolean"),
            },
        };
        let add_special_tokens = match object.get("add_special_tokens") {
            None => true,
            Some(value) => match value.as_bool() {
                Some(add) => add,
                None => return invalid("add_special_tokens should be boolean"),
            },
        };
        let padding_side = match object.get("padding_side") {
            None => PaddingSide::default(),
            Some(Value::String(side)) => match side.as_str() {
                "left" => PaddingSide::Left,
                "right" => PaddingSide::Right,
                _ => return invalid("padding_side should be either left or right"),
            },
            Some(_) => return invalid("padding_side should be string, either left or right"),
        };

        Ok(Self {
            text,
            add_special_tokens,
            max_length,
            pad_to_max_length,
            padding_side,
        })
    }

    /// Encodes every input and serializes `{"tokens": ...}`. A single input gives a flat
    /// array, several give one array per input.
    pub fn process(&self, tokenizer: &dyn Tokenizer) -> Result<String> {
        let pad = tokenizer.eos_token_id().unwrap_or_default();
        let mut batch = self
            .text
            .iter()
            .map(|text| {
                let mut tokens = tokenizer
                    .encode(text, self.add_special_tokens)
                    .map_err(|err| ServableError::internal(format!("{err:#}")))?;
                if let Some(max_length) = self.max_length {
                    tokens.truncate(max_length);
                }
                Ok(tokens)
            })
            .collect::<Result<Vec<_>>>()?;

        if self.pad_to_max_length {
            let width = match self.max_length {
                Some(max_length) => max_length,
                None => batch.iter().map(Vec::len).max().unwrap_or_default(),
            };
            for tokens in batch.iter_mut() {
                let padding = std::iter::repeat(pad).take(width - tokens.len());
                match self.padding_side {
                    PaddingSide::Right => tokens.extend(padding),
                    PaddingSide::Left => {
                        tokens.splice(0..0, padding);
                    }
                }
            }
        }

        let tokens = match batch.len() {
            1 => Tokens::Single(batch.remove(0)),
            _ => Tokens::Batch(batch),
        };
        serde_json::to_string(&TokenizeResponse { tokens })
            .map_err(|err| ServableError::internal(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::engine::reference::{ByteTokenizer, BOS_TOKEN, EOS_TOKEN};

    #[test]
    fn test_single_text() {
        let request = TokenizeRequest::parse(&json!({"model": "m", "text": "hi"})).expect("test");
        assert!(request.add_special_tokens);
        let response = request.process(&ByteTokenizer).expect("test");
        assert_eq!(response, format!(r#"{{"tokens":[{BOS_TOKEN},104,105]}}"#));
    }

    #[test]
    fn test_batch_is_nested() {
        let request = TokenizeRequest::parse(
            &json!({"text": ["a", "bc"], "add_special_tokens": false}),
        )
        .expect("test");
        let response = request.process(&ByteTokenizer).expect("test");
        assert_eq!(response, r#"{"tokens":[[97],[98,99]]}"#);
    }

    #[test]
    fn test_truncate_and_pad() {
        let request = TokenizeRequest::parse(&json!({
            "text": ["abc", "a"],
            "add_special_tokens": false,
            "max_length": 2,
            "pad_to_max_length": true,
            "padding_side": "left"
        }))
        .expect("test");
        let response: Value =
            serde_json::from_str(&request.process(&ByteTokenizer).expect("test")).expect("test");
        assert_eq!(response, json!({"tokens": [[97, 98], [EOS_TOKEN, 97]]}));
    }

    #[test]
    fn test_invalid_requests() {
        let error = |json: Value| match TokenizeRequest::parse(&json) {
            Err(ServableError::InvalidArgument(message)) => message,
            other => panic!("expected invalid argument, got {other:?}"),
        };
        assert_eq!(error(json!({"model": "m"})), "text field is required");
        assert_eq!(error(json!({"text": []})), "text array should not be empty");
        assert_eq!(error(json!({"text": [1, 2]})), "Input should be string or array of strings");
        assert_eq!(
            error(json!({"text": "a", "padding_side": "up"})),
            "padding_side should be either left or right"
        );
        assert_eq!(error(json!({"text": "a", "max_length": "3"})), "max_length should be integer");
    }
}
