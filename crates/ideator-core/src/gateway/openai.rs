use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use super::{ChatBackend, ChatMessage, CompletionRequest, GatewayError};
use crate::rate_limit::rate_limit_delay;
use crate::{ApiKey, PipelineConfig};

/// Backend for any endpoint following the OpenAI chat completions format
/// (Groq by default).
pub struct OpenAiCompatBackend {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<ApiKey>,
}

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiCompatBackend {
    pub fn new(config: &PipelineConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("ideator/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl ChatBackend for OpenAiCompatBackend {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    fn complete<'a>(
        &'a self,
        request: &'a CompletionRequest,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<String, GatewayError>> + Send + 'a>> {
        Box::pin(async move {
            let body = ChatBody {
                model: &self.model,
                messages: &request.messages,
                temperature: request.temperature,
                max_tokens: request.max_tokens,
            };

            let mut req = self.client.post(&self.endpoint).json(&body).timeout(timeout);
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key.expose());
            }

            let resp = req.send().await.map_err(map_transport_error)?;

            if let Some(retry_after) = rate_limit_delay(&resp) {
                return Err(GatewayError::RateLimited { retry_after });
            }

            let status = resp.status();
            if !status.is_success() {
                let message = resp.text().await.unwrap_or_default();
                return Err(GatewayError::Service {
                    status: status.as_u16(),
                    message: service_message(&message),
                });
            }

            let data: Value = resp
                .json()
                .await
                .map_err(|_| GatewayError::EmptyResponse)?;
            completion_text(&data).ok_or(GatewayError::EmptyResponse)
        })
    }
}

fn map_transport_error(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Transient("request timed out".into())
    } else {
        GatewayError::Transient(err.to_string())
    }
}

/// Pull `choices[0].message.content` out of a completion body.
fn completion_text(data: &Value) -> Option<String> {
    data["choices"][0]["message"]["content"]
        .as_str()
        .filter(|s| !s.trim().is_empty())
        .map(String::from)
}

/// Error bodies are usually `{"error": {"message": ...}}`; fall back to the
/// raw text, shortened.
fn service_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(String::from))
        .unwrap_or_else(|| crate::truncate_chars(body.trim(), 200).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn endpoint_joins_base_url() {
        let config = PipelineConfig {
            base_url: "http://localhost:8080/v1/".into(),
            ..PipelineConfig::default()
        };
        let backend = OpenAiCompatBackend::new(&config);
        assert_eq!(backend.endpoint(), "http://localhost:8080/v1/chat/completions");
    }

    #[test]
    fn completion_text_from_choices() {
        let data = json!({"choices": [{"message": {"role": "assistant", "content": "hi there"}}]});
        assert_eq!(completion_text(&data).as_deref(), Some("hi there"));
    }

    #[test]
    fn completion_text_missing_or_blank() {
        assert!(completion_text(&json!({"choices": []})).is_none());
        assert!(completion_text(&json!({"choices": [{"message": {"content": "  "}}]})).is_none());
        assert!(completion_text(&json!({"error": "x"})).is_none());
    }

    #[test]
    fn service_message_prefers_error_field() {
        let body = r#"{"error": {"message": "Invalid API Key", "type": "invalid_request_error"}}"#;
        assert_eq!(service_message(body), "Invalid API Key");
        assert_eq!(service_message("Bad Gateway"), "Bad Gateway");
    }

    #[test]
    fn body_serializes_role_tags() {
        let messages = vec![ChatMessage::system("be terse"), ChatMessage::user("hello")];
        let body = ChatBody {
            model: "m",
            messages: &messages,
            temperature: 0.1,
            max_tokens: 5,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][1]["content"], "hello");
        assert_eq!(value["max_tokens"], 5);
    }
}
