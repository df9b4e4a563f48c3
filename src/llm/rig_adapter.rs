//! Categorizer backed by a rig-core agent.
//!
//! One agent per provider, built once with the category list as its
//! preamble. Each email is a single `prompt` call whose reply must be
//! `{"category", "explanation", "confidence"}`.

use std::sync::Arc;

use async_trait::async_trait;
use rig::agent::Agent;
use rig::client::{CompletionClient, Nothing};
use rig::completion::{CompletionModel, Prompt};
use rig::providers::{ollama, openai};
use secrecy::{ExposeSecret, SecretString};

use crate::config::TransformConfig;
use crate::error::{CollaboratorError, ConfigError};
use crate::llm::{Categorization, Categorizer, extract_json_object, prepare_content};
use crate::pipeline::types::EmailRecord;

const TEMPERATURE: f64 = 0.3;

pub struct RigCategorizer<M: CompletionModel> {
    agent: Agent<M>,
    provider: &'static str,
    max_content_length: usize,
}

impl<M: CompletionModel> RigCategorizer<M> {
    fn with_client<C>(client: &C, provider: &'static str, config: &TransformConfig) -> Self
    where
        C: CompletionClient<CompletionModel = M>,
    {
        let agent = client
            .agent(config.model.as_str())
            .preamble(&system_prompt(&config.categories))
            .temperature(TEMPERATURE)
            .build();
        Self {
            agent,
            provider,
            max_content_length: config.max_content_length,
        }
    }
}

fn client_error(provider: &str, e: impl std::fmt::Display) -> ConfigError {
    ConfigError::InvalidValue {
        key: "pipeline.transform.base_url".into(),
        message: format!("failed to create {provider} client: {e}"),
    }
}

/// OpenAI, optionally through a compatible gateway at `transform.base_url`.
pub fn openai_categorizer(
    api_key: &SecretString,
    config: &TransformConfig,
) -> Result<Arc<dyn Categorizer>, ConfigError> {
    let client: openai::Client = match &config.base_url {
        Some(url) => openai::Client::builder()
            .api_key(api_key.expose_secret())
            .base_url(url)
            .build()
            .map_err(|e| client_error("openai", e))?,
        None => openai::Client::new(api_key.expose_secret())
            .map_err(|e| client_error("openai", e))?,
    };
    Ok(Arc::new(RigCategorizer::with_client(&client, "openai", config)))
}

/// OpenAI with the key from `OPENAI_API_KEY`.
pub fn openai_from_env(config: &TransformConfig) -> Result<Arc<dyn Categorizer>, ConfigError> {
    let key = std::env::var("OPENAI_API_KEY")
        .ok()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| ConfigError::MissingRequired {
            key: "OPENAI_API_KEY".into(),
            hint: "Set it, or use provider: ollama".into(),
        })?;
    openai_categorizer(&SecretString::from(key), config)
}

/// Local Ollama server; `transform.base_url` is the server root.
pub fn ollama_categorizer(config: &TransformConfig) -> Result<Arc<dyn Categorizer>, ConfigError> {
    let client: ollama::Client = match &config.base_url {
        Some(url) => ollama::Client::builder()
            .api_key(Nothing)
            .base_url(url)
            .build()
            .map_err(|e| client_error("ollama", e))?,
        None => ollama::Client::new(Nothing).map_err(|e| client_error("ollama", e))?,
    };
    Ok(Arc::new(RigCategorizer::with_client(&client, "ollama", config)))
}

fn system_prompt(categories: &[String]) -> String {
    let mut prompt = String::with_capacity(512);
    prompt.push_str("You categorize emails. Choose exactly one category from this list:\n");
    for category in categories {
        prompt.push_str(&format!("- {category}\n"));
    }
    prompt.push_str(
        "\nRespond with ONLY a JSON object:\n\
         {\"category\": \"...\", \"explanation\": \"...\", \"confidence\": 0.0}\n\
         Use the category name exactly as listed. Keep the explanation to one sentence.",
    );
    prompt
}

fn user_prompt(email: &EmailRecord, max_content_length: usize) -> String {
    format!(
        "From: {}\nSubject: {}\n\n{}",
        email.sender,
        email.subject,
        prepare_content(&email.content, max_content_length)
    )
}

/// Parse the model's reply text into a categorization.
pub(crate) fn parse_reply(text: &str) -> Result<Categorization, String> {
    let json = extract_json_object(text);
    let parsed: Categorization =
        serde_json::from_str(&json).map_err(|e| format!("unparseable reply: {e}"))?;
    Ok(Categorization {
        category: parsed.category.trim().to_string(),
        ..parsed
    })
}

/// Sort a provider failure into the collaborator taxonomy by its message.
///
/// rig reports HTTP status and transport failures as text.
fn classify_failure(provider: &str, reason: String) -> CollaboratorError {
    let lower = reason.to_ascii_lowercase();

    if mentions_any(&lower, &["401", "403", "unauthorized", "forbidden", "invalid api key", "invalid_api_key"]) {
        CollaboratorError::Auth {
            service: provider.into(),
            reason,
        }
    } else if mentions_any(&lower, &[
        "429",
        "rate limit",
        "timed out",
        "timeout",
        "connect",
        "error sending request",
        "502",
        "503",
        "504",
        "overloaded",
    ]) {
        CollaboratorError::Transient {
            service: provider.into(),
            reason,
        }
    } else {
        CollaboratorError::Rejected {
            service: provider.into(),
            reason,
        }
    }
}

fn mentions_any(text: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| text.contains(n))
}

#[async_trait]
impl<M> Categorizer for RigCategorizer<M>
where
    M: CompletionModel + 'static,
{
    fn name(&self) -> &str {
        self.provider
    }

    async fn categorize(&self, email: &EmailRecord) -> Result<Categorization, CollaboratorError> {
        let reply = self
            .agent
            .prompt(user_prompt(email, self.max_content_length))
            .await
            .map_err(|e| classify_failure(self.provider, e.to_string()))?;

        let categorization = parse_reply(&reply).map_err(|reason| CollaboratorError::Rejected {
            service: self.provider.into(),
            reason,
        })?;
        tracing::debug!(
            email_id = %email.id,
            provider = self.provider,
            category = %categorization.category,
            "Categorized"
        );
        Ok(categorization)
    }
}
