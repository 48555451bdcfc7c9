//! Language-model backend client.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::history::ChatMessage;
use crate::core::repair::{Expect, extract_json};

/// Failure talking to a model server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Timeout after {0}s")]
    Timeout(u64),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Provider not available: {0}")]
    Unavailable(String),
}

/// One non-streaming chat completion request.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub stream: bool,
    /// Ollama output constraint; `"json"` forces a JSON reply.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<&'a str>,
}

impl<'a> ChatRequest<'a> {
    pub fn new(model: &'a str, messages: &'a [ChatMessage]) -> Self {
        Self {
            model,
            messages,
            stream: false,
            format: None,
        }
    }

    /// Ask the backend to constrain the reply to JSON.
    pub fn json(mut self) -> Self {
        self.format = Some("json");
        self
    }
}

/// Text-in, text-out model backend.
pub trait ModelClient {
    fn chat(&self, request: &ChatRequest<'_>) -> Result<String, ModelError>;
}

/// Ollama `/api/chat` client.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: Client,
    endpoint: String,
    timeout: Duration,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: Option<ResponseMessage>,
    response: Option<String>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: String,
}

impl OllamaClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("build HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl ModelClient for OllamaClient {
    #[instrument(skip_all, fields(model = request.model, messages = request.messages.len()))]
    fn chat(&self, request: &ChatRequest<'_>) -> Result<String, ModelError> {
        let url = format!("{}/api/chat", self.endpoint);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .map_err(|err| transport_error(&err, self.timeout))?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|err| transport_error(&err, self.timeout))?;
        if !status.is_success() {
            warn!(status = status.as_u16(), "model server returned an error status");
            return Err(ModelError::Api {
                status: status.as_u16(),
                message: body.trim().to_string(),
            });
        }

        let content = reply_content(&body)?;
        debug!(bytes = content.len(), "model replied");
        Ok(content)
    }
}

pub(crate) fn transport_error(err: &reqwest::Error, timeout: Duration) -> ModelError {
    if err.is_timeout() {
        ModelError::Timeout(timeout.as_secs())
    } else if err.is_connect() {
        ModelError::Unavailable(err.to_string())
    } else {
        ModelError::Http(err.to_string())
    }
}

/// Pull the assistant text out of a chat or generate response body.
///
/// Bodies that are not clean JSON go through the repair pipeline first.
pub(crate) fn reply_content(body: &str) -> Result<String, ModelError> {
    let parsed: ChatResponse = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(_) => {
            let repaired = extract_json(body, Expect::Object)
                .map_err(|err| ModelError::InvalidResponse(err.reason))?;
            serde_json::from_str(&repaired)
                .map_err(|err| ModelError::InvalidResponse(err.to_string()))?
        }
    };

    if let Some(error) = parsed.error {
        return Err(ModelError::InvalidResponse(error));
    }
    let content = parsed
        .message
        .map(|message| message.content)
        .or(parsed.response)
        .ok_or_else(|| ModelError::InvalidResponse("response has no message content".into()))?;
    if content.trim().is_empty() {
        return Err(ModelError::InvalidResponse("empty reply".into()));
    }
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_body_content_is_extracted() {
        let body = r#"{"model":"llama3.2","message":{"role":"assistant","content":"{\"commands\":[]}"},"done":true}"#;
        assert_eq!(reply_content(body).expect("content"), r#"{"commands":[]}"#);
    }

    #[test]
    fn generate_body_content_is_extracted() {
        let body = r#"{"model":"gemma3:12b","response":"A login screen.","done":true}"#;
        assert_eq!(reply_content(body).expect("content"), "A login screen.");
    }

    #[test]
    fn noisy_body_is_repaired() {
        let body = "data: {\"message\": {\"content\": \"hi\"},}\n";
        assert_eq!(reply_content(body).expect("content"), "hi");
    }

    #[test]
    fn error_and_empty_bodies_are_invalid() {
        assert_eq!(
            reply_content(r#"{"error":"model 'x' not found"}"#),
            Err(ModelError::InvalidResponse("model 'x' not found".into()))
        );
        assert!(reply_content(r#"{"message":{"content":"  "}}"#).is_err());
        assert!(reply_content("<html>bad gateway</html>").is_err());
    }

    #[test]
    fn request_serializes_roles_and_disables_streaming() {
        let messages = vec![ChatMessage::system("rules"), ChatMessage::user("Goal: x")];
        let value =
            serde_json::to_value(ChatRequest::new("llama3.2", &messages)).expect("serialize");
        assert_eq!(value["model"], "llama3.2");
        assert_eq!(value["stream"], false);
        assert_eq!(value["messages"][1]["role"], "user");
        assert!(value.get("format").is_none());

        let value = serde_json::to_value(ChatRequest::new("llama3.2", &messages).json())
            .expect("serialize");
        assert_eq!(value["format"], "json");
    }

    #[test]
    fn unreachable_server_is_reported_not_panicked() {
        let client = OllamaClient::new("http://127.0.0.1:9", Duration::from_secs(2)).expect("client");
        let messages = vec![ChatMessage::user("hi")];
        let err = client
            .chat(&ChatRequest::new("llama3.2", &messages))
            .expect_err("no server");
        assert!(matches!(
            err,
            ModelError::Unavailable(_) | ModelError::Http(_) | ModelError::Timeout(_)
        ));
    }
}
