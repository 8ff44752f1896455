//! Request dispatch.
//!
//! Maps one hotkey invocation to a fully resolved outcome: gate the model
//! load, issue the chat completion, retry once if the request raced the
//! server's first-touch load, and bound the whole thing with the configured
//! wall-clock budget. Every failure is resolved here into a
//! [`DispatchError`]; nothing propagates past the event loop.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::PromptProfile;
use crate::loader::{LoadFailure, LoadStrategy, ModelGate};
use crate::server::{ChatError, ChatRequest, InferenceBackend};

/// Terminal classification of one dispatch.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("clipboard input is empty")]
    EmptyInput,
    #[error("model load failed: {0}")]
    LoadFailed(LoadFailure),
    #[error("cannot reach inference server: {0}")]
    ConnectionError(String),
    #[error("model unavailable after retry: {0}")]
    ModelUnavailable(String),
    #[error("request exceeded the {}s budget", .0.as_secs())]
    Timeout(Duration),
    #[error("unexpected server failure: {0}")]
    Unknown(String),
}

/// `Ok(response_text)` (possibly empty) or a typed failure.
pub type RequestOutcome = Result<String, DispatchError>;

pub struct Dispatcher {
    backend: Arc<dyn InferenceBackend>,
    gate: ModelGate,
    strategy: LoadStrategy,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        gate: ModelGate,
        strategy: LoadStrategy,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            gate,
            strategy,
            timeout,
        }
    }

    /// Run one capture-to-response round trip.
    ///
    /// Whitespace-only input short-circuits before any network traffic.
    /// Everything after that runs under the wall-clock budget; on expiry the
    /// in-flight call is abandoned and its late result discarded.
    pub async fn dispatch(&self, profile: &PromptProfile, input_text: &str) -> RequestOutcome {
        if input_text.trim().is_empty() {
            return Err(DispatchError::EmptyInput);
        }

        match tokio::time::timeout(self.timeout, self.run(profile, input_text)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(DispatchError::Timeout(self.timeout)),
        }
    }

    async fn run(&self, profile: &PromptProfile, input_text: &str) -> RequestOutcome {
        self.gate
            .ensure_ready(&profile.model_id, self.strategy, self.timeout)
            .await
            .map_err(DispatchError::LoadFailed)?;

        let request = ChatRequest {
            system_prompt: profile.system_prompt.clone(),
            model_id: profile.model_id.clone(),
            user_message: input_text.to_string(),
        };

        match self.backend.chat(&request).await {
            Ok(text) => Ok(text),
            Err(ChatError::ModelNotLoaded(detail)) => {
                // Expected first-touch condition under `jit`: confirm the
                // gate again and retry exactly once.
                tracing::info!(model = %request.model_id, detail = %detail, "model not loaded, retrying once");
                self.gate
                    .ensure_ready(&profile.model_id, self.strategy, self.timeout)
                    .await
                    .map_err(DispatchError::LoadFailed)?;
                match self.backend.chat(&request).await {
                    Ok(text) => Ok(text),
                    Err(ChatError::ModelNotLoaded(detail)) => {
                        Err(DispatchError::ModelUnavailable(detail))
                    }
                    Err(other) => Err(Self::map_terminal(other)),
                }
            }
            Err(other) => Err(Self::map_terminal(other)),
        }
    }

    fn map_terminal(error: ChatError) -> DispatchError {
        match error {
            ChatError::Connection(detail) => DispatchError::ConnectionError(detail),
            ChatError::ModelNotLoaded(detail) => DispatchError::ModelUnavailable(detail),
            ChatError::Http { status, detail } => {
                DispatchError::Unknown(format!("HTTP {status}: {detail}"))
            }
            ChatError::Malformed(detail) => DispatchError::Unknown(detail),
        }
    }
}
