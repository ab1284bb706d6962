pub mod providers;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use crate::core::config::AgentConfig;
use crate::core::error::QaError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn provider_id(&self) -> &str;

    // Execute a prompt against a model using a structured conversation history
    async fn generate(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<String>;
}

/// A provider bound to one model, temperature and per-call timeout.
#[derive(Clone)]
pub struct LlmClient {
    provider: Arc<dyn LlmProvider>,
    model: String,
    temperature: f32,
    timeout: Duration,
}

impl LlmClient {
    pub fn new(provider: Arc<dyn LlmProvider>, config: &AgentConfig) -> Self {
        info!(
            "Using LLM provider {} ({})",
            provider.provider_id(),
            config.model
        );
        Self {
            provider,
            model: config.model.clone(),
            temperature: config.temperature,
            timeout: config.model_timeout,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Single-prompt completion. Each call is self-contained: no conversation
    /// state is kept between calls.
    pub async fn complete(&self, prompt: &str) -> Result<String, QaError> {
        let messages = [ChatMessage::user(prompt)];
        let call = self
            .provider
            .generate(&self.model, &messages, self.temperature);
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(text)) => {
                debug!("LLM replied with {} chars", text.len());
                Ok(text)
            }
            Ok(Err(e)) => Err(QaError::ModelUnavailable(format!("{:#}", e))),
            Err(_) => Err(QaError::Timeout {
                stage: "model call",
                after: self.timeout,
            }),
        }
    }
}
