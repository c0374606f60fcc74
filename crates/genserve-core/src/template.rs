use std::{collections::HashMap, path::Path};

use anyhow::Result;
use derivative::Derivative;
use itertools::Itertools;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

pub type ChatHistory = Vec<ChatMessage>;

/// Turns a chat history into the prompt text fed to the tokenizer.
pub trait TemplateProcessor: Send + Sync {
    fn apply_template(&self, history: &ChatHistory) -> Result<String>;
}

fn default_names() -> HashMap<String, String> {
    [
        ("system", "System"),
        ("user", "User"),
        ("assistant", "Assistant"),
        ("tool", "Tool"),
    ]
    .into_iter()
    .map(|(role, name)| (role.to_owned(), name.to_owned()))
    .collect()
}

/// Line-oriented template: every message becomes `message` with `{role}` and `{content}`
/// substituted, messages are joined by `separator`, and `generation_prompt` is appended.
#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct RoleTemplate {
    #[derivative(Default(value = "\"{role}: {content}\".into()"))]
    pub message: String,
    #[derivative(Default(value = "\"\\n\\n\".into()"))]
    pub separator: String,
    #[derivative(Default(value = "\"\\n\\nAssistant:\".into()"))]
    pub generation_prompt: String,
    /// Display names per role. Unknown roles are used as given.
    #[derivative(Default(value = "default_names()"))]
    pub names: HashMap<String, String>,
    /// Collapse runs of blank lines inside message content.
    #[derivative(Default(value = "true"))]
    pub collapse_blank_lines: bool,
}

impl RoleTemplate {
    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }
}

impl TemplateProcessor for RoleTemplate {
    fn apply_template(&self, history: &ChatHistory) -> Result<String> {
        let re = Regex::new(r"\n(\s*\n)+")?;
        let prompt = history
            .iter()
            .map(|ChatMessage { role, content }| {
                let role = self.names.get(role).unwrap_or(role);
                let content = match self.collapse_blank_lines {
                    true => re.replace_all(content, "\n"),
                    false => content.into(),
                };
                self.message
                    .replace("{role}", role)
                    .replace("{content}", content.trim())
            })
            .join(&self.separator);
        if prompt.is_empty() {
            return Ok(prompt);
        }
        Ok(prompt + &self.generation_prompt)
    }
}
