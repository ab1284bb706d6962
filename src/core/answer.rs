use tracing::debug;

use crate::core::db::ResultSet;
use crate::core::error::QaError;
use crate::core::llm::LlmClient;

/// Sentence used when a query succeeds but returns nothing. Built without the
/// model so nothing can be invented.
pub fn no_matching_data(question: &str) -> String {
    format!(
        "No matching data was found for \"{}\". The query ran successfully but returned no rows.",
        question.trim()
    )
}

pub fn build_answer_prompt(question: &str, sql: &str, rows: &ResultSet) -> String {
    format!(
        "You are a helpful assistant. Write a concise, human-readable answer grounded ONLY in the SQL result.\n\
         Do not mention SQL, tables or columns unless asked.\n\
         User question: {}\n\
         SQL: {}\n\
         Result: {}",
        question,
        sql,
        rows.to_compact_json()
    )
}

pub struct AnswerRenderer {
    llm: LlmClient,
}

impl AnswerRenderer {
    pub fn new(llm: LlmClient) -> Self {
        Self { llm }
    }

    /// Clarifications pass through untouched.
    pub fn clarification(question: &str) -> String {
        question.trim().to_string()
    }

    /// Phrase the final answer for a successful query. Empty results never
    /// reach the model.
    pub async fn render(
        &self,
        question: &str,
        sql: &str,
        rows: &ResultSet,
    ) -> Result<String, QaError> {
        if rows.is_empty() {
            debug!("Empty result, using the no-data answer");
            return Ok(no_matching_data(question));
        }
        let reply = self
            .llm
            .complete(&build_answer_prompt(question, sql, rows))
            .await?;
        let text = reply.trim();
        if text.is_empty() {
            return Err(QaError::ModelUnavailable(
                "model returned an empty answer".to_string(),
            ));
        }
        Ok(text.to_string())
    }
}
