//! LM Studio HTTP client.
//!
//! Speaks the OpenAI-style surface the server exposes: one chat-completion
//! endpoint and the loaded-model listing used by the load gate. Everything
//! the rest of the daemon needs from the server goes through the
//! [`InferenceBackend`] trait so the dispatcher and gate can be exercised
//! against fakes.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Timeout for the cheap `/v1/models` probe, independent of the request budget.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// One chat-completion request, fully assembled by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    /// System prompt; empty means no system message is sent.
    pub system_prompt: String,
    /// Model id; empty means "use whatever the server has loaded".
    pub model_id: String,
    pub user_message: String,
}

/// Error surface of one server interaction.
///
/// `ModelNotLoaded` is the only retryable variant; classification of
/// ambiguous HTTP errors deliberately falls through to `Http`.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("cannot reach inference server: {0}")]
    Connection(String),
    #[error("model not loaded: {0}")]
    ModelNotLoaded(String),
    #[error("server returned HTTP {status}: {detail}")]
    Http { status: u16, detail: String },
    #[error("malformed server response: {0}")]
    Malformed(String),
}

/// What the daemon needs from the inference server.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Issue one chat completion and return the (trimmed) response text.
    async fn chat(&self, request: &ChatRequest) -> Result<String, ChatError>;

    /// List the ids of currently loaded models.
    async fn loaded_models(&self) -> Result<Vec<String>, ChatError>;
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct WireChatPayload<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
}

#[derive(Deserialize)]
struct WireChatResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireChoiceMessage,
}

#[derive(Deserialize)]
struct WireChoiceMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct WireModelList {
    #[serde(default)]
    data: Vec<WireModel>,
}

#[derive(Deserialize)]
struct WireModel {
    id: String,
}

/// Reqwest-backed client for a single configured base URL.
pub struct LmStudioClient {
    base_url: String,
    request_timeout: Duration,
    http: reqwest::Client,
}

impl LmStudioClient {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            request_timeout,
            http: reqwest::Client::new(),
        }
    }

    fn payload<'a>(request: &'a ChatRequest) -> WireChatPayload<'a> {
        let mut messages = Vec::with_capacity(2);
        if !request.system_prompt.is_empty() {
            messages.push(WireMessage {
                role: "system",
                content: &request.system_prompt,
            });
        }
        messages.push(WireMessage {
            role: "user",
            content: &request.user_message,
        });
        WireChatPayload {
            model: (!request.model_id.is_empty()).then_some(request.model_id.as_str()),
            messages,
            stream: false,
        }
    }
}

/// Decide whether an HTTP error status + body means "model not loaded".
///
/// LM Studio answers a request for an unloaded model with a 404, or a 4xx
/// whose error body names the missing model. Anything else stays an
/// unclassified HTTP error and is not retried.
fn classify_http_error(status: u16, body: &str) -> ChatError {
    let detail = if body.trim().is_empty() {
        "(empty body)".to_string()
    } else {
        body.trim().to_string()
    };

    if status == 404 {
        return ChatError::ModelNotLoaded(detail);
    }
    if (400..500).contains(&status) {
        let lower = detail.to_ascii_lowercase();
        if lower.contains("not loaded") || lower.contains("not found") || lower.contains("no model")
        {
            return ChatError::ModelNotLoaded(detail);
        }
    }
    ChatError::Http { status, detail }
}

fn extract_content(body: &str) -> Result<String, ChatError> {
    let parsed: WireChatResponse =
        serde_json::from_str(body).map_err(|e| ChatError::Malformed(e.to_string()))?;
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ChatError::Malformed("response has no choices".into()))?;
    Ok(choice.message.content.trim().to_string())
}

#[async_trait]
impl InferenceBackend for LmStudioClient {
    async fn chat(&self, request: &ChatRequest) -> Result<String, ChatError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&Self::payload(request))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| ChatError::Connection(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ChatError::Connection(e.to_string()))?;

        if !status.is_success() {
            return Err(classify_http_error(status.as_u16(), &body));
        }

        extract_content(&body)
    }

    async fn loaded_models(&self) -> Result<Vec<String>, ChatError> {
        let url = format!("{}/v1/models", self.base_url);
        let response = self
            .http
            .get(&url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|e| ChatError::Connection(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ChatError::Connection(e.to_string()))?;

        if !status.is_success() {
            return Err(classify_http_error(status.as_u16(), &body));
        }

        let parsed: WireModelList =
            serde_json::from_str(&body).map_err(|e| ChatError::Malformed(e.to_string()))?;
        Ok(parsed.data.into_iter().map(|m| m.id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_includes_system_message_when_present() {
        let request = ChatRequest {
            system_prompt: "Always answer in French.".into(),
            model_id: "qwen3b".into(),
            user_message: "Hello".into(),
        };
        let json = serde_json::to_value(LmStudioClient::payload(&request)).unwrap();
        assert_eq!(json["model"], "qwen3b");
        assert_eq!(json["stream"], false);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["role"], "user");
        assert_eq!(json["messages"][1]["content"], "Hello");
    }

    #[test]
    fn payload_omits_empty_system_prompt_and_model() {
        let request = ChatRequest {
            system_prompt: String::new(),
            model_id: String::new(),
            user_message: "hi".into(),
        };
        let json = serde_json::to_value(LmStudioClient::payload(&request)).unwrap();
        assert!(json.get("model").is_none());
        assert_eq!(json["messages"].as_array().unwrap().len(), 1);
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[test]
    fn extract_content_trims_response() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"  Bonjour \n"}}]}"#;
        assert_eq!(extract_content(body).unwrap(), "Bonjour");
    }

    #[test]
    fn extract_content_accepts_empty_text() {
        let body = r#"{"choices":[{"message":{"content":""}}]}"#;
        assert_eq!(extract_content(body).unwrap(), "");
    }

    #[test]
    fn extract_content_rejects_missing_choices() {
        assert!(matches!(
            extract_content(r#"{"choices":[]}"#),
            Err(ChatError::Malformed(_))
        ));
    }

    #[test]
    fn http_404_is_model_not_loaded() {
        assert!(matches!(
            classify_http_error(404, r#"{"error":"model 'x' not found"}"#),
            ChatError::ModelNotLoaded(_)
        ));
    }

    #[test]
    fn http_400_mentioning_unloaded_model_is_model_not_loaded() {
        assert!(matches!(
            classify_http_error(400, "No models loaded"),
            ChatError::ModelNotLoaded(_)
        ));
    }

    #[test]
    fn ambiguous_errors_stay_unclassified() {
        assert!(matches!(
            classify_http_error(500, "internal error"),
            ChatError::Http { status: 500, .. }
        ));
        assert!(matches!(
            classify_http_error(429, "rate limited"),
            ChatError::Http { status: 429, .. }
        ));
    }
}
