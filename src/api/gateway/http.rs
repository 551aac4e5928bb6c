use reqwest::{Client as ReqwestClient, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Gateway, GatewayConfig, GatewayError};
use crate::api::prompt::render_prompt;
use crate::models::TaskTree;

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}

/// Gateway for an OpenAI-compatible chat-completions endpoint
#[derive(Debug, Clone)]
pub struct HttpGateway {
    http_client: ReqwestClient,
    config: GatewayConfig,
}

impl HttpGateway {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        if config.base_url.trim().is_empty() {
            return Err(GatewayError::Config("MODEL_BASE_URL is not set".to_string()));
        }
        if config.api_key.trim().is_empty() {
            return Err(GatewayError::Config("MODEL_API_KEY is not set".to_string()));
        }
        let http_client = ReqwestClient::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http_client,
            config,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait::async_trait]
impl Gateway for HttpGateway {
    async fn interpret(&self, tree: &TaskTree, input: &str) -> Result<String, GatewayError> {
        let prompt = render_prompt(tree, input);
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &prompt,
            }],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let url = self.endpoint();
        debug!(%url, model = %self.config.model, "sending chat completion request");
        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() || err.is_connect() {
                    GatewayError::LlmUnavailable(err.to_string())
                } else {
                    GatewayError::Http(err)
                }
            })?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "chat completion request failed");
            return Err(GatewayError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let body: ChatResponse = response.json().await?;
        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(GatewayError::MissingContent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GatewayConfig {
        GatewayConfig {
            base_url: "https://llm.example.com/v1/".to_string(),
            api_key: "key".to_string(),
            ..GatewayConfig::default()
        }
    }

    #[test]
    fn test_endpoint_joins_without_double_slash() {
        let gateway = HttpGateway::new(config()).unwrap();
        assert_eq!(gateway.endpoint(), "https://llm.example.com/v1/chat/completions");
    }

    #[test]
    fn test_missing_key_is_config_error() {
        let err = HttpGateway::new(GatewayConfig {
            api_key: String::new(),
            ..config()
        })
        .unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[test]
    fn test_request_shape() {
        let request = ChatRequest {
            model: "m",
            messages: vec![ChatMessage {
                role: "user",
                content: "hi",
            }],
            temperature: 0.1,
            max_tokens: 10,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["messages"][0]["role"], "user");
        assert_eq!(value["max_tokens"], 10);
    }
}
