//! Categorization collaborator.
//!
//! Transform depends only on [`Categorizer::categorize`]. Backends:
//! - **OpenAI / Ollama**: rig-core agents (`rig_adapter.rs`)
//! - **Keyword rules**: deterministic regex rules for test mode (`keyword.rs`)

pub mod keyword;
pub mod rig_adapter;

pub use keyword::KeywordCategorizer;
pub use rig_adapter::RigCategorizer;

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::{CategorizerProvider, TransformConfig};
use crate::error::{CollaboratorError, ConfigError};
use crate::pipeline::types::EmailRecord;

/// What a categorizer said about one email.
///
/// `category` is unchecked; Transform maps anything outside the configured
/// vocabulary to the fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Categorization {
    pub category: String,
    #[serde(default, alias = "explanation")]
    pub rationale: Option<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
}

#[async_trait]
pub trait Categorizer: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    async fn categorize(&self, email: &EmailRecord) -> Result<Categorization, CollaboratorError>;
}

/// Build the configured model-backed categorizer.
pub fn create_categorizer(config: &TransformConfig) -> Result<Arc<dyn Categorizer>, ConfigError> {
    let categorizer = match config.provider {
        CategorizerProvider::OpenAi => rig_adapter::openai_from_env(config)?,
        CategorizerProvider::Ollama => rig_adapter::ollama_categorizer(config)?,
    };
    tracing::info!(
        provider = categorizer.name(),
        model = %config.model,
        "Categorizer ready"
    );
    Ok(categorizer)
}

static SCRIPT_OR_STYLE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?is)<script\b.*?</script>|<style\b.*?</style>").ok());
static TAG: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(?s)<[^>]+>").ok());
static WHITESPACE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\s+").ok());

/// Strip markup and collapse whitespace, then cut to `max_chars` characters.
pub fn prepare_content(raw: &str, max_chars: usize) -> String {
    let mut text = raw.to_string();
    let markup: [&Option<Regex>; 2] = [&SCRIPT_OR_STYLE, &TAG];
    for re in markup.into_iter().flatten() {
        text = re.replace_all(&text, " ").into_owned();
    }
    let text = text
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">");
    let text = match &*WHITESPACE {
        Some(re) => re.replace_all(&text, " ").into_owned(),
        None => text,
    };
    text.trim().chars().take(max_chars).collect()
}

/// Pull the JSON object out of a model reply (bare, fenced, or surrounded by prose).
pub fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_html_and_truncates() {
        let raw = "<html><style>p {color: red}</style><p>Hello&nbsp;<b>there</b></p>\n\n<script>x()</script>World</html>";
        assert_eq!(prepare_content(raw, 100), "Hello there World");
        assert_eq!(prepare_content(raw, 5), "Hello");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(prepare_content("héllo wörld", 4), "héll");
    }

    #[test]
    fn extracts_fenced_json() {
        let reply = "Sure!\n```json\n{\"category\": \"Bills\"}\n```";
        assert_eq!(extract_json_object(reply), "{\"category\": \"Bills\"}");
        let reply = "The answer is {\"category\": \"Work\"} as requested.";
        assert_eq!(extract_json_object(reply), "{\"category\": \"Work\"}");
    }

    #[test]
    fn categorization_accepts_explanation_alias() {
        let parsed: Categorization =
            serde_json::from_str(r#"{"category":"Bills","explanation":"invoice"}"#).unwrap();
        assert_eq!(parsed.rationale.as_deref(), Some("invoice"));
        assert_eq!(parsed.confidence, None);
    }
}
