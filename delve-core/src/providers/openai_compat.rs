//! OpenAI-compatible model provider.
//!
//! Supports OpenAI, Azure OpenAI, Ollama, vLLM, LM Studio, and any endpoint
//! that follows the chat completions API with `response_format: json_schema`.

use super::{ModelProvider, StructuredRequest, StructuredResponse, resolve_api_key, with_retry};
use crate::config::{ModelConfig, RetryConfig};
use crate::error::{ConfigError, ModelError};
use crate::types::TokenUsage;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

/// OpenAI-compatible structured-output provider.
pub struct OpenAiCompatibleProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    timeout: Duration,
    retry: RetryConfig,
}

impl OpenAiCompatibleProvider {
    /// Create a new provider from configuration.
    ///
    /// Reads the API key from `config.api_key` or the environment variable in
    /// `config.api_key_env`. Local endpoints do not need a key.
    pub fn new(config: &ModelConfig) -> Result<Self, ConfigError> {
        let is_local =
            config.base_url.contains("localhost") || config.base_url.contains("127.0.0.1");

        let api_key = resolve_api_key(config.api_key.as_deref(), &config.api_key_env)
            .or_else(|| {
                if is_local {
                    debug!("No API key set for local provider; using dummy bearer token");
                    Some("ollama".to_string())
                } else {
                    None
                }
            })
            .ok_or_else(|| ConfigError::EnvVarMissing {
                var: config.api_key_env.clone(),
            })?;

        Ok(Self {
            client: Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            timeout: config.timeout(),
            retry: config.retry.clone(),
        })
    }

    fn request_body(&self, request: &StructuredRequest) -> Value {
        json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [
                { "role": "system", "content": request.system_prompt },
                { "role": "user", "content": request.user_prompt },
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": request.schema_name,
                    "schema": request.schema,
                    "strict": true,
                }
            },
        })
    }

    /// Parse a chat completions body into a structured response.
    fn parse_response(body: &Value) -> Result<StructuredResponse, ModelError> {
        let choice = body
            .get("choices")
            .and_then(|c| c.get(0))
            .ok_or_else(|| ModelError::ResponseParse {
                message: "No choices in response".to_string(),
            })?;

        let message = choice
            .get("message")
            .ok_or_else(|| ModelError::ResponseParse {
                message: "No message in choice".to_string(),
            })?;

        if let Some(refusal) = message.get("refusal").and_then(|r| r.as_str()) {
            return Err(ModelError::ResponseParse {
                message: format!("Model refused: {refusal}"),
            });
        }

        let content = message
            .get("content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| ModelError::ResponseParse {
                message: "Message has no text content".to_string(),
            })?;

        let value: Value = serde_json::from_str(strip_code_fence(content)).map_err(|e| {
            ModelError::ResponseParse {
                message: format!("Content is not valid JSON: {e}"),
            }
        })?;

        let usage = body
            .get("usage")
            .map(|u| TokenUsage {
                input_tokens: u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                output_tokens: u
                    .get("completion_tokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0),
            })
            .unwrap_or_default();

        Ok(StructuredResponse { value, usage })
    }

    fn map_http_error(status: reqwest::StatusCode, body: &str) -> ModelError {
        match status.as_u16() {
            401 | 403 => {
                debug!(body = %body, "Authentication failed");
                ModelError::AuthFailed {
                    provider: "OpenAI-compatible".to_string(),
                }
            }
            429 => {
                // "Rate limit reached ... Please try again in 7s."
                let retry_secs = serde_json::from_str::<Value>(body)
                    .ok()
                    .and_then(|v| {
                        v.get("error")?
                            .get("message")?
                            .as_str()
                            .map(|s| s.to_string())
                    })
                    .and_then(|msg| {
                        let tail = msg.split("in ").last()?;
                        tail.trim_end_matches('.')
                            .trim_end_matches('s')
                            .parse::<u64>()
                            .ok()
                    })
                    .unwrap_or(5);
                ModelError::RateLimited {
                    retry_after_secs: retry_secs,
                }
            }
            status if status >= 500 => ModelError::ApiRequest {
                message: format!("Server error ({status}): {body}"),
            },
            _ => ModelError::ApiRequest {
                message: format!("HTTP {status}: {body}"),
            },
        }
    }

    async fn send_once(
        &self,
        body: &Value,
        timeout: Duration,
    ) -> Result<StructuredResponse, ModelError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::Timeout {
                        timeout_secs: timeout.as_secs(),
                    }
                } else {
                    ModelError::ApiRequest {
                        message: format!("Request failed: {e}"),
                    }
                }
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| ModelError::ApiRequest {
            message: format!("Failed to read response body: {e}"),
        })?;

        if !status.is_success() {
            return Err(Self::map_http_error(status, &text));
        }

        let json: Value = serde_json::from_str(&text).map_err(|e| ModelError::ResponseParse {
            message: format!("Invalid JSON: {e}"),
        })?;
        Self::parse_response(&json)
    }
}

/// Some local servers wrap JSON replies in a markdown code fence.
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

#[async_trait]
impl ModelProvider for OpenAiCompatibleProvider {
    async fn generate_structured(
        &self,
        request: StructuredRequest,
    ) -> Result<StructuredResponse, ModelError> {
        let body = self.request_body(&request);
        let timeout = request.timeout.unwrap_or(self.timeout);
        debug!(
            model = %self.model,
            schema = %request.schema_name,
            "Sending structured completion request"
        );
        with_retry(&self.retry, || self.send_once(&body, timeout)).await
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> ModelConfig {
        ModelConfig {
            base_url: "http://localhost:11434/v1/".to_string(),
            model: "qwen2.5:14b".to_string(),
            api_key_env: "DELVE_TEST_UNSET_KEY_VAR".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_local_provider_needs_no_key() {
        let provider = OpenAiCompatibleProvider::new(&local_config()).unwrap();
        assert_eq!(provider.model_name(), "qwen2.5:14b");
        assert_eq!(provider.base_url, "http://localhost:11434/v1");
    }

    #[test]
    fn test_remote_provider_requires_key() {
        let config = ModelConfig {
            api_key_env: "DELVE_TEST_UNSET_KEY_VAR".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            OpenAiCompatibleProvider::new(&config),
            Err(ConfigError::EnvVarMissing { ref var }) if var == "DELVE_TEST_UNSET_KEY_VAR"
        ));
    }

    #[test]
    fn test_request_body_carries_schema() {
        let provider = OpenAiCompatibleProvider::new(&local_config()).unwrap();
        let body = provider.request_body(&StructuredRequest {
            system_prompt: "sys".into(),
            user_prompt: "user".into(),
            schema_name: "serp_queries".into(),
            schema: json!({"type": "object"}),
            timeout: None,
        });
        assert_eq!(body["response_format"]["json_schema"]["name"], "serp_queries");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "user");
    }

    #[test]
    fn test_parse_response() {
        let body = json!({
            "choices": [{
                "message": { "role": "assistant", "content": "{\"score\": 0.9}" },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 120, "completion_tokens": 30 }
        });
        let response = OpenAiCompatibleProvider::parse_response(&body).unwrap();
        assert_eq!(response.value["score"], 0.9);
        assert_eq!(response.usage.total(), 150);
    }

    #[test]
    fn test_parse_response_fenced_content() {
        let body = json!({
            "choices": [{ "message": { "content": "```json\n{\"ok\": true}\n```" } }]
        });
        let response = OpenAiCompatibleProvider::parse_response(&body).unwrap();
        assert_eq!(response.value["ok"], true);
        assert_eq!(response.usage, TokenUsage::default());
    }

    #[test]
    fn test_parse_response_not_json() {
        let body = json!({ "choices": [{ "message": { "content": "sorry, no" } }] });
        assert!(matches!(
            OpenAiCompatibleProvider::parse_response(&body),
            Err(ModelError::ResponseParse { .. })
        ));
    }

    #[test]
    fn test_map_http_error() {
        let err = OpenAiCompatibleProvider::map_http_error(
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            r#"{"error":{"message":"Rate limit reached. Please try again in 7s."}}"#,
        );
        assert!(matches!(
            err,
            ModelError::RateLimited {
                retry_after_secs: 7
            }
        ));
        let err = OpenAiCompatibleProvider::map_http_error(
            reqwest::StatusCode::UNAUTHORIZED,
            "",
        );
        assert!(matches!(err, ModelError::AuthFailed { .. }));
        let err = OpenAiCompatibleProvider::map_http_error(
            reqwest::StatusCode::BAD_GATEWAY,
            "upstream",
        );
        assert!(matches!(err, ModelError::ApiRequest { .. }));
        let err = OpenAiCompatibleProvider::map_http_error(
            reqwest::StatusCode::BAD_REQUEST,
            r#"{"error":{"message":"unknown model"}}"#,
        );
        assert!(matches!(err, ModelError::ApiRequest { ref message } if message.contains("400")));
    }
}
