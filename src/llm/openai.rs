use super::{ChatMessage, ChatRequest, CompletionClient, LlmError};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_MODEL: &str = "openrouter/free";

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    /// Sent as `HTTP-Referer` to identify the calling origin.
    pub referer: Option<String>,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            referer: None,
        }
    }
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: ChatMessage,
}

pub async fn chat(
    client: &Client,
    config: &OpenAiConfig,
    request: &ChatRequest,
) -> Result<ChatMessage, LlmError> {
    let body = OpenAiRequest {
        model: &request.model,
        messages: &request.messages,
    };

    let mut req = client
        .post(format!("{}/chat/completions", config.base_url.trim_end_matches('/')))
        .header("Content-Type", "application/json")
        .json(&body);

    if !config.api_key.is_empty() {
        req = req.header("Authorization", format!("Bearer {}", config.api_key));
    }
    if let Some(referer) = &config.referer {
        req = req.header("HTTP-Referer", referer.as_str());
    }

    debug!(model = %request.model, turns = request.messages.len(), "requesting completion");
    let resp = req.send().await?;

    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        return Err(LlmError::Api {
            status,
            message: text,
        });
    }

    let raw = resp.text().await?;
    let data: OpenAiResponse =
        serde_json::from_str(&raw).map_err(|e| LlmError::Parse(e.to_string()))?;
    data.choices
        .into_iter()
        .next()
        .map(|c| c.message)
        .ok_or_else(|| LlmError::Parse("response contained no choices".to_string()))
}

/// OpenAI-compatible chat-completions client (OpenRouter by default).
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: Client,
    config: OpenAiConfig,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }

    pub fn config(&self) -> &OpenAiConfig {
        &self.config
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    async fn complete(&self, turns: &[ChatMessage]) -> Result<ChatMessage, LlmError> {
        let request = ChatRequest {
            messages: turns.to_vec(),
            model: self.config.model.clone(),
        };
        chat(&self.http, &self.config, &request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::Role;
    use mockito::Matcher;
    use serde_json::json;

    fn client_for(server: &mockito::ServerGuard) -> OpenAiClient {
        OpenAiClient::new(OpenAiConfig {
            api_key: "sk-test".to_string(),
            base_url: server.url(),
            model: "openrouter/free".to_string(),
            referer: Some("http://localhost:5173".to_string()),
        })
    }

    fn turns() -> Vec<ChatMessage> {
        vec![
            ChatMessage::system("You are a helpful code debugging assistant."),
            ChatMessage::user("fix my loop"),
        ]
    }

    #[tokio::test]
    async fn returns_first_choice_message() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_header("http-referer", "http://localhost:5173")
            .match_body(Matcher::PartialJson(json!({
                "model": "openrouter/free",
                "messages": [
                    { "role": "system", "content": "You are a helpful code debugging assistant." },
                    { "role": "user", "content": "fix my loop" }
                ]
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "choices": [
                        { "message": { "role": "assistant", "content": "try a for-loop" } },
                        { "message": { "role": "assistant", "content": "ignored" } }
                    ]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let reply = client_for(&server).complete(&turns()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(reply.role, Role::Assistant);
        assert_eq!(reply.content.text(), "try a for-loop");
    }

    #[tokio::test]
    async fn non_success_status_is_an_api_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(429)
            .with_body("rate limited")
            .create_async()
            .await;

        let err = client_for(&server).complete(&turns()).await.unwrap_err();
        match err {
            LlmError::Api { status, message } => {
                assert_eq!(status, 429);
                assert_eq!(message, "rate limited");
            }
            other => panic!("expected API error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn empty_choices_is_a_parse_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(json!({ "choices": [] }).to_string())
            .create_async()
            .await;

        let err = client_for(&server).complete(&turns()).await.unwrap_err();
        assert!(matches!(err, LlmError::Parse(_)));
    }

    #[tokio::test]
    async fn malformed_body_is_a_parse_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body("<html>gateway</html>")
            .create_async()
            .await;

        let err = client_for(&server).complete(&turns()).await.unwrap_err();
        assert!(matches!(err, LlmError::Parse(_)));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_an_http_error() {
        let client = OpenAiClient::new(OpenAiConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            ..OpenAiConfig::default()
        });

        let err = client.complete(&turns()).await.unwrap_err();
        assert!(matches!(err, LlmError::Http(_)));
    }
}
