use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;

use crate::core::llm::{ChatMessage, LlmProvider};
use crate::core::protocol::SQL_PROMPT_MARKER;

/// Test double: replays canned SQL-generation replies in order (the last one
/// repeats once the queue runs dry) and answers every other prompt with a
/// fixed text. All prompts are recorded.
pub struct ScriptedProvider {
    sql_replies: Mutex<VecDeque<String>>,
    answer: String,
    error: Option<String>,
    delay: Option<Duration>,
    sql_prompts: Mutex<Vec<String>>,
    answer_prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new<S: Into<String>>(sql_replies: Vec<S>, answer: impl Into<String>) -> Self {
        Self {
            sql_replies: Mutex::new(sql_replies.into_iter().map(Into::into).collect()),
            answer: answer.into(),
            error: None,
            delay: None,
            sql_prompts: Mutex::new(Vec::new()),
            answer_prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        let mut provider = Self::new(Vec::<String>::new(), "");
        provider.error = Some(message.into());
        provider
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn sql_prompts(&self) -> Vec<String> {
        self.sql_prompts.lock().unwrap().clone()
    }

    pub fn answer_prompts(&self) -> Vec<String> {
        self.answer_prompts.lock().unwrap().clone()
    }
}

pub fn sql_reply(sql: &str) -> String {
    serde_json::json!({ "type": "sql", "sql": sql, "params": {} }).to_string()
}

pub fn clarify_reply(question: &str) -> String {
    serde_json::json!({ "type": "clarify", "question": question }).to_string()
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn provider_id(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        _model_id: &str,
        messages: &[ChatMessage],
        _temperature: f32,
    ) -> Result<String> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = &self.error {
            return Err(anyhow!(error.clone()));
        }

        let prompt = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if prompt.contains(SQL_PROMPT_MARKER) {
            self.sql_prompts.lock().unwrap().push(prompt);
            let mut queue = self.sql_replies.lock().unwrap();
            let reply = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
            return reply.ok_or_else(|| anyhow!("no scripted SQL reply"));
        }

        self.answer_prompts.lock().unwrap().push(prompt);
        Ok(self.answer.clone())
    }
}
