//! HTTP plumbing shared by the provider adapters.

use std::time::Duration;

use chatminds_core::error::ProviderError;
use tracing::warn;

/// Used when a 429 carries no usable `Retry-After`.
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// Build the adapter's client. The timeout bounds a whole request, streaming included.
pub(crate) fn build_client(timeout: Duration) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ProviderError::NotConfigured(format!("Failed to create HTTP client: {e}")))
}

/// Map a transport failure.
pub(crate) fn send_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(e.to_string())
    } else {
        ProviderError::Network(e.to_string())
    }
}

/// Pass through 2xx responses, turn everything else into a [`ProviderError`].
pub(crate) async fn check_status(
    response: reqwest::Response,
    provider: &str,
    model: &str,
) -> Result<reqwest::Response, ProviderError> {
    let status = response.status().as_u16();

    if response.status().is_success() {
        return Ok(response);
    }

    if status == 429 {
        let retry_after_secs = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
        return Err(ProviderError::RateLimited { retry_after_secs });
    }

    if status == 401 || status == 403 {
        return Err(ProviderError::AuthenticationFailed(
            "Invalid API key or insufficient permissions".into(),
        ));
    }

    let error_body = response.text().await.unwrap_or_default();
    warn!(provider, status, body = %error_body, "Provider returned error");

    if status == 404 {
        return Err(ProviderError::ModelNotFound(model.to_string()));
    }

    // Gemini reports a bad key as a 400
    if status == 400 && error_body.contains("API_KEY_INVALID") {
        return Err(ProviderError::AuthenticationFailed("API key not valid".into()));
    }

    Err(ProviderError::ApiError {
        status_code: status,
        message: error_body,
    })
}
