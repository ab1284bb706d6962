use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::core::agent::ExecutionAttempt;
use crate::core::db::SqlParams;
use crate::core::error::QaError;
use crate::core::llm::LlmClient;
use crate::core::schema::SchemaDescription;

/// Appears in every SQL-generation prompt and nowhere else.
pub const SQL_PROMPT_MARKER: &str = "Convert the user question into a single SQL SELECT query.";

/// What the model asked for. The wire form is a JSON object tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ModelAction {
    #[serde(rename = "sql")]
    SqlRequest {
        sql: String,
        #[serde(default, deserialize_with = "null_as_default")]
        params: SqlParams,
    },
    #[serde(rename = "clarify")]
    ClarifyRequest { question: String },
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl ModelAction {
    fn checked(self) -> Result<Self, QaError> {
        match self {
            ModelAction::SqlRequest { sql, params } => {
                let sql = sql.trim().to_string();
                if sql.is_empty() {
                    return Err(QaError::MalformedModelOutput(
                        "sql request has an empty \"sql\" field".to_string(),
                    ));
                }
                Ok(ModelAction::SqlRequest { sql, params })
            }
            ModelAction::ClarifyRequest { question } => {
                let question = question.trim().to_string();
                if question.is_empty() {
                    return Err(QaError::MalformedModelOutput(
                        "clarify request has an empty \"question\" field".to_string(),
                    ));
                }
                Ok(ModelAction::ClarifyRequest { question })
            }
        }
    }
}

/// Inputs to one generation call. The full attempt history is passed every
/// time; the model is never assumed to remember earlier calls.
pub struct GenerationContext<'a> {
    pub question: &'a str,
    pub schema: &'a SchemaDescription,
    pub attempts: &'a [ExecutionAttempt],
}

pub fn build_sql_prompt(ctx: &GenerationContext<'_>) -> String {
    let mut prompt = format!(
        "You are a careful data assistant. {marker}\n\
         Rules:\n\
         - Use ONLY tables/columns in the schema. Prefer explicit JOINs.\n\
         - You may use named parameters (:name) and supply their values in \"params\".\n\
         - If the question is ambiguous, ask for clarification instead of guessing.\n\
         - Return STRICT JSON only (no markdown):\n  \
         {{\"type\":\"sql\",\"sql\":\"...\",\"params\":{{}}}}  or  {{\"type\":\"clarify\",\"question\":\"...\"}}\n\
         Schema:\n{schema}\n\
         User question: {question}",
        marker = SQL_PROMPT_MARKER,
        schema = ctx.schema.text().trim_end(),
        question = ctx.question,
    );

    let failures: Vec<&ExecutionAttempt> =
        ctx.attempts.iter().filter(|a| !a.succeeded()).collect();
    if !failures.is_empty() {
        prompt.push_str("\n\nEarlier attempts failed. Oldest first:");
        for attempt in failures {
            let error = attempt
                .error()
                .map(|e| e.to_string())
                .unwrap_or_default();
            prompt.push_str(&format!(
                "\n--- Previous attempt {n} failed ---\nSQL: {sql}\nError: {error}\n--- End of attempt {n} ---",
                n = attempt.number,
                sql = attempt.sql.as_deref().unwrap_or("(none)"),
                error = error,
            ));
        }
        prompt.push_str("\nFix it.");
    }
    prompt
}

/// One generation call: prompt the model with the full context and parse
/// its reply.
pub async fn request(llm: &LlmClient, ctx: &GenerationContext<'_>) -> Result<ModelAction, QaError> {
    let raw = llm.complete(&build_sql_prompt(ctx)).await?;
    debug!("Model proposed: {}", raw.trim());
    parse_model_output(&raw)
}

/// Parse the model's reply into a [`ModelAction`].
///
/// The whole reply is tried first; failing that, each `{` starts a candidate
/// and the first complete JSON object that has a valid action shape wins.
pub fn parse_model_output(raw: &str) -> Result<ModelAction, QaError> {
    let trimmed = raw.trim();
    let first_error = match serde_json::from_str::<ModelAction>(trimmed) {
        Ok(action) => return action.checked(),
        Err(e) => e,
    };

    let mut saw_object = false;
    for (start, _) in trimmed.match_indices('{') {
        let mut stream =
            serde_json::Deserializer::from_str(&trimmed[start..]).into_iter::<Value>();
        if let Some(Ok(value @ Value::Object(_))) = stream.next() {
            saw_object = true;
            if let Ok(action) = serde_json::from_value::<ModelAction>(value) {
                return action.checked();
            }
        }
    }

    let detail = if saw_object {
        format!("no JSON object matched the action contract ({})", first_error)
    } else {
        format!("no JSON object found ({})", first_error)
    };
    Err(QaError::MalformedModelOutput(detail))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::agent::AttemptOutcome;
    use crate::core::schema::TableDef;
    use serde_json::json;

    #[test]
    fn parses_clean_sql_request() {
        let action =
            parse_model_output(r#"{"type":"sql","sql":" SELECT 1 ","params":{"x":1}}"#).unwrap();
        let mut params = SqlParams::new();
        params.insert("x".into(), json!(1));
        assert_eq!(
            action,
            ModelAction::SqlRequest {
                sql: "SELECT 1".into(),
                params
            }
        );
    }

    #[test]
    fn missing_or_null_params_mean_no_params() {
        for raw in [
            r#"{"type":"sql","sql":"SELECT 1"}"#,
            r#"{"type":"sql","sql":"SELECT 1","params":null}"#,
        ] {
            match parse_model_output(raw).unwrap() {
                ModelAction::SqlRequest { params, .. } => assert!(params.is_empty()),
                other => panic!("unexpected action {:?}", other),
            }
        }
    }

    #[test]
    fn extracts_object_wrapped_in_prose_or_fences() {
        let action =
            parse_model_output("Sure! {\"type\":\"clarify\",\"question\":\"Which semester?\"} done.")
                .unwrap();
        assert_eq!(
            action,
            ModelAction::ClarifyRequest {
                question: "Which semester?".into()
            }
        );

        let fenced = "```json\n{\"type\":\"sql\",\"sql\":\"SELECT name FROM teachers\"}\n```";
        assert!(matches!(
            parse_model_output(fenced).unwrap(),
            ModelAction::SqlRequest { .. }
        ));
    }

    #[test]
    fn skips_objects_that_are_not_actions() {
        let raw = r#"{"note":"thinking"} then {"type":"sql","sql":"SELECT 2"}"#;
        assert!(matches!(
            parse_model_output(raw).unwrap(),
            ModelAction::SqlRequest { sql, .. } if sql == "SELECT 2"
        ));
    }

    #[test]
    fn rejects_garbage_and_wrong_shapes() {
        for raw in [
            "not json at all",
            r#"{"type":"query","sql":"SELECT 1"}"#,
            r#"{"type":"sql"}"#,
            r#"{"type":"sql","sql":"   "}"#,
            r#"{"type":"clarify","question":""}"#,
            r#"{"sql":"SELECT 1"}"#,
        ] {
            let err = parse_model_output(raw).unwrap_err();
            assert_eq!(err.kind(), "malformed_model_output", "raw: {}", raw);
        }
    }

    fn schema() -> SchemaDescription {
        SchemaDescription::new(vec![TableDef {
            name: "teachers".into(),
            columns: vec![],
            unique: vec![],
            foreign_keys: vec![],
            checks: vec![],
        }])
    }

    #[test]
    fn first_prompt_has_schema_once_and_no_repair_block() {
        let schema = schema();
        let prompt = build_sql_prompt(&GenerationContext {
            question: "Who teaches?",
            schema: &schema,
            attempts: &[],
        });
        assert!(prompt.contains(SQL_PROMPT_MARKER));
        assert_eq!(prompt.matches("TABLE teachers").count(), 1);
        assert!(prompt.ends_with("User question: Who teaches?"));
        assert!(!prompt.contains("Previous attempt"));
    }

    #[test]
    fn retry_prompt_lists_every_failure_in_order() {
        let schema = schema();
        let attempts = vec![
            ExecutionAttempt {
                number: 1,
                action: None,
                sql: None,
                outcome: AttemptOutcome::Failure(QaError::MalformedModelOutput("bad".into())),
            },
            ExecutionAttempt {
                number: 2,
                action: None,
                sql: Some("SELECT fullname FROM teachers LIMIT 50".into()),
                outcome: AttemptOutcome::Failure(QaError::ExecutionError(
                    "no such column: fullname".into(),
                )),
            },
        ];
        let prompt = build_sql_prompt(&GenerationContext {
            question: "q",
            schema: &schema,
            attempts: &attempts,
        });
        let first = prompt.find("Previous attempt 1 failed").unwrap();
        let second = prompt.find("Previous attempt 2 failed").unwrap();
        assert!(first < second);
        assert!(prompt.contains("Error: no such column: fullname"));
        assert!(prompt.contains("SQL: SELECT fullname FROM teachers LIMIT 50"));
        assert!(prompt.ends_with("Fix it."));
    }
}
