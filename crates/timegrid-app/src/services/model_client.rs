//! HTTP client for multimodal chat-completion providers.
//!
//! The pipeline only ever talks to model providers through the [`ChatModel`]
//! trait; this module supplies the one concrete implementation, speaking the
//! OpenAI-compatible `/chat/completions` dialect with inline data-URL images.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

/// A single-turn multimodal completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: String,
    pub user_text: String,
    /// PNG or JPEG bytes attached as a data URL when present.
    pub image: Option<ImageAttachment>,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct ImageAttachment {
    pub bytes: Vec<u8>,
    pub mime_type: &'static str,
}

/// Errors produced by model provider calls.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("missing `{0}` environment variable")]
    MissingApiKey(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("model endpoint returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model response contained no message content")]
    EmptyResponse,
}

/// Abstract multimodal completion backend.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<String, ModelError>;
}

/// OpenAI-compatible chat-completions client.
#[derive(Clone)]
pub struct HttpChatModel {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpChatModel {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            model: model.into(),
            api_key,
        })
    }

    /// Read the API key from the named environment variable.
    pub fn from_env(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key_env: &str,
        timeout: Duration,
    ) -> Result<Self, ModelError> {
        let api_key = std::env::var(api_key_env)
            .map_err(|_| ModelError::MissingApiKey(api_key_env.to_string()))?;
        Self::new(endpoint, model, Some(api_key), timeout)
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[async_trait]
impl ChatModel for HttpChatModel {
    async fn complete(&self, request: ChatRequest) -> Result<String, ModelError> {
        let mut user_parts = Vec::with_capacity(2);
        if let Some(image) = &request.image {
            user_parts.push(json!({
                "type": "image_url",
                "image_url": {
                    "url": format!(
                        "data:{};base64,{}",
                        image.mime_type,
                        BASE64_STANDARD.encode(&image.bytes)
                    )
                }
            }));
        }
        user_parts.push(json!({ "type": "text", "text": request.user_text }));

        let body = json!({
            "model": self.model,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": user_parts },
            ],
        });

        let mut http_request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            http_request = http_request.bearer_auth(key);
        }

        let response = http_request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: CompletionResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(ModelError::EmptyResponse)
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn sends_openai_shaped_request_and_extracts_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(json!({ "temperature": 0.0 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": "{\"ok\":true}" } }]
            })))
            .mount(&server)
            .await;

        let model = HttpChatModel::new(
            format!("{}/chat/completions", server.uri()),
            "test-model",
            None,
            Duration::from_secs(5),
        )
        .expect("client builds");

        let content = model
            .complete(ChatRequest {
                system: "You output JSON.".to_string(),
                user_text: "go".to_string(),
                image: Some(ImageAttachment {
                    bytes: vec![1, 2, 3],
                    mime_type: "image/png",
                }),
                temperature: 0.0,
                max_tokens: 64,
            })
            .await
            .expect("completion succeeds");
        assert_eq!(content, "{\"ok\":true}");
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("upstream down"))
            .mount(&server)
            .await;

        let model = HttpChatModel::new(
            format!("{}/chat/completions", server.uri()),
            "test-model",
            None,
            Duration::from_secs(5),
        )
        .expect("client builds");

        let err = model
            .complete(ChatRequest {
                system: String::new(),
                user_text: "go".to_string(),
                image: None,
                temperature: 0.0,
                max_tokens: 16,
            })
            .await
            .expect_err("500 must surface");
        assert!(matches!(err, ModelError::Status { status: 500, .. }));
    }
}
