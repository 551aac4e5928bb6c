//! Gateway module
//!
//! This module provides access to the language model that turns an utterance
//! into a JSON payload. The HTTP implementation talks to an OpenAI-compatible
//! chat-completions endpoint; the scripted one replays canned replies.

mod http;
mod scripted;
mod trait_def;

use std::time::Duration;

pub use http::HttpGateway;
pub use scripted::ScriptedGateway;
pub use trait_def::Gateway;

pub const DEFAULT_TEMPERATURE: f32 = 0.1;
pub const DEFAULT_MAX_TOKENS: u32 = 4096;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Gateway configuration
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Gateway errors
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("language model unavailable: {0}")]
    LlmUnavailable(String),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("response carried no message content")]
    MissingContent,

    #[error("gateway misconfigured: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl GatewayError {
    /// Whether the same request may succeed if sent again later
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::LlmUnavailable(_) => true,
            GatewayError::Api { status, .. } => *status == 429 || *status >= 500,
            GatewayError::Http(err) => err.is_timeout() || err.is_connect(),
            GatewayError::MissingContent | GatewayError::Config(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(GatewayError::LlmUnavailable("timeout".into()).is_retryable());
        assert!(GatewayError::Api { status: 429, body: String::new() }.is_retryable());
        assert!(GatewayError::Api { status: 503, body: String::new() }.is_retryable());
        assert!(!GatewayError::Api { status: 401, body: String::new() }.is_retryable());
        assert!(!GatewayError::Config("no key".into()).is_retryable());
    }

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.temperature, DEFAULT_TEMPERATURE);
        assert_eq!(config.timeout, Duration::from_secs(60));
    }
}
