//! Provider factory - builds the single active completion backend from config.
//!
//! Exactly one provider is active at a time; there is no routing or failover.

use std::sync::Arc;
use std::time::Duration;

use chatminds_config::AppConfig;
use chatminds_core::error::ProviderError;
use chatminds_core::provider::Provider;
use tracing::info;

use crate::gemini::GeminiProvider;
use crate::openai_compat::OpenAiCompatProvider;

/// Build the configured provider.
///
/// Well-known names get their default endpoint; any other name is treated as
/// OpenAI-compatible and must come with an explicit `api_url`.
pub fn build_from_config(config: &AppConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    let name = config.provider.as_str();
    let timeout = Duration::from_secs(config.request_timeout_secs);

    let provider: Arc<dyn Provider> = match name {
        "gemini" => {
            let mut p = GeminiProvider::with_timeout(require_key(config)?, timeout)?;
            if let Some(url) = &config.api_url {
                p = p.with_base_url(url);
            }
            Arc::new(p)
        }
        "ollama" => {
            let base_url = config.api_url.clone().unwrap_or_else(|| default_base_url(name).into());
            let api_key = config.api_key.clone().unwrap_or_else(|| "ollama".into());
            Arc::new(OpenAiCompatProvider::with_timeout(name, base_url, api_key, timeout)?)
        }
        "openai" | "openrouter" => {
            let base_url = config.api_url.clone().unwrap_or_else(|| default_base_url(name).into());
            Arc::new(OpenAiCompatProvider::with_timeout(
                name,
                base_url,
                require_key(config)?,
                timeout,
            )?)
        }
        custom => {
            let base_url = config.api_url.clone().ok_or_else(|| {
                ProviderError::NotConfigured(format!(
                    "Unknown provider '{custom}'; set api_url for an OpenAI-compatible endpoint"
                ))
            })?;
            let api_key = config.api_key.clone().unwrap_or_default();
            Arc::new(OpenAiCompatProvider::with_timeout(custom, base_url, api_key, timeout)?)
        }
    };

    info!(provider = %provider.name(), model = %config.model, "Completion backend ready");
    Ok(provider)
}

fn require_key(config: &AppConfig) -> Result<String, ProviderError> {
    config
        .api_key
        .clone()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| {
            ProviderError::NotConfigured(format!(
                "No API key for provider '{}' (set api_key or CHATMINDS_API_KEY)",
                config.provider
            ))
        })
}

/// Get the default base URL for well-known providers.
fn default_base_url(provider_name: &str) -> &'static str {
    match provider_name {
        "openrouter" => "https://openrouter.ai/api/v1",
        "openai" => "https://api.openai.com/v1",
        "ollama" => "http://localhost:11434/v1",
        _ => "",
    }
}
