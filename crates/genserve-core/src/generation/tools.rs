//! Structural tags that constrain tool calls, keyed by tool parser name.

use crate::engine::{StructuralTagItem, StructuralTagsConfig};

/// A tool the client offered to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    /// JSON schema of the arguments, serialized.
    pub parameters: String,
}

pub type ToolGrammar = fn(&[ToolDefinition]) -> StructuralTagsConfig;

fn tagged(
    tools: &[ToolDefinition],
    trigger: &str,
    begin: impl Fn(&str) -> String,
    end: &str,
) -> StructuralTagsConfig {
    let structural_tags = tools
        .iter()
        .map(|tool| StructuralTagItem {
            begin: begin(&tool.name),
            schema: tool.parameters.clone(),
            end: end.to_owned(),
        })
        .collect();
    StructuralTagsConfig {
        structural_tags,
        triggers: vec![trigger.to_owned()],
    }
}

fn hermes3(tools: &[ToolDefinition]) -> StructuralTagsConfig {
    tagged(
        tools,
        "<tool_call>",
        |name| format!("<tool_call>\n{{\"name\": \"{name}\", \"arguments\": "),
        "}\n</tool_call>",
    )
}

fn phi4(tools: &[ToolDefinition]) -> StructuralTagsConfig {
    tagged(
        tools,
        "functools[",
        |name| format!("functools[{{\"name\": \"{name}\", \"arguments\": "),
        "}]",
    )
}

fn llama3(tools: &[ToolDefinition]) -> StructuralTagsConfig {
    tagged(
        tools,
        "<|python_tag|>",
        |name| format!("<|python_tag|>{{\"name\": \"{name}\", \"parameters\": "),
        "}",
    )
}

/// Returns the grammar builder for a tool parser, if it has one.
pub fn tool_grammar(parser: &str) -> Option<ToolGrammar> {
    match parser {
        "hermes3" | "qwen3" => Some(hermes3),
        "phi4" => Some(phi4),
        "llama3" => Some(llama3),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weather() -> ToolDefinition {
        ToolDefinition {
            name: "get_weather".into(),
            parameters: r#"{"type":"object"}"#.into(),
        }
    }

    #[test]
    fn test_hermes3_and_qwen3_share_grammar() {
        let hermes = tool_grammar("hermes3").expect("test")(&[weather()]);
        let qwen = tool_grammar("qwen3").expect("test")(&[weather()]);
        assert_eq!(hermes, qwen);
        assert_eq!(hermes.triggers, vec!["<tool_call>"]);
        assert_eq!(
            hermes.structural_tags[0].begin,
            "<tool_call>\n{\"name\": \"get_weather\", \"arguments\": "
        );
    }

    #[test]
    fn test_unknown_parser_has_no_grammar() {
        assert!(tool_grammar("mistral").is_none());
    }

    #[test]
    fn test_llama3_uses_python_tag() {
        let config = tool_grammar("llama3").expect("test")(&[weather()]);
        assert_eq!(config.triggers, vec!["<|python_tag|>"]);
        assert_eq!(config.structural_tags[0].schema, r#"{"type":"object"}"#);
    }
}
