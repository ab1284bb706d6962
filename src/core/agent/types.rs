use serde::Serialize;

use crate::core::db::ResultSet;
use crate::core::error::QaError;
use crate::core::protocol::ModelAction;

/// Controller states. `Answered`, `Clarified` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Start,
    LoadSchema,
    GenerateAction,
    Validate,
    Execute,
    Clarify,
    Render,
    Answered,
    Clarified,
    Failed,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Start => "start",
            RunState::LoadSchema => "load_schema",
            RunState::GenerateAction => "generate_action",
            RunState::Validate => "validate",
            RunState::Execute => "execute",
            RunState::Clarify => "clarify",
            RunState::Render => "render",
            RunState::Answered => "answered",
            RunState::Clarified => "clarified",
            RunState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Answered | RunState::Clarified | RunState::Failed
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Question {
    pub run_id: String,
    pub text: String,
}

impl Question {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Success { rows: usize },
    Failure(QaError),
}

/// One pass through generate → validate → execute.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionAttempt {
    /// 1-based.
    pub number: u32,
    /// `None` when the model output could not be parsed or the call failed.
    pub action: Option<ModelAction>,
    /// SQL as executed (after validation) or as proposed when rejected.
    pub sql: Option<String>,
    pub outcome: AttemptOutcome,
}

impl ExecutionAttempt {
    pub fn error(&self) -> Option<&QaError> {
        match &self.outcome {
            AttemptOutcome::Failure(e) => Some(e),
            AttemptOutcome::Success { .. } => None,
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Success { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    SchemaUnavailable,
    RetryBudgetExhausted,
    Cancelled,
    AnswerUnavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunResult {
    Answered {
        text: String,
    },
    Clarify {
        text: String,
    },
    Failed {
        reason: FailureReason,
        last_error: String,
    },
}

impl RunResult {
    pub fn status(&self) -> &'static str {
        match self {
            RunResult::Answered { .. } => "answered",
            RunResult::Clarify { .. } => "clarify",
            RunResult::Failed { .. } => "failed",
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, RunResult::Failed { .. })
    }

    /// What the user sees. Failures never expose more than the last error
    /// message.
    pub fn message(&self) -> String {
        match self {
            RunResult::Answered { text } | RunResult::Clarify { text } => text.clone(),
            RunResult::Failed { reason, last_error } => match reason {
                FailureReason::RetryBudgetExhausted => format!(
                    "Couldn't run a valid SQL query.\nError: {}\nTry rephrasing or adding missing details.",
                    last_error
                ),
                FailureReason::SchemaUnavailable => {
                    format!("The database schema could not be loaded: {}", last_error)
                }
                FailureReason::Cancelled => "The question was cancelled before an answer was ready.".to_string(),
                FailureReason::AnswerUnavailable => format!(
                    "The query ran, but no answer could be written: {}",
                    last_error
                ),
            },
        }
    }
}

/// Everything a finished run produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub question: String,
    pub result: RunResult,
    pub attempts: Vec<ExecutionAttempt>,
    /// Generation cycles started, clarifications included.
    pub iterations: u32,
    pub final_sql: Option<String>,
    pub rows: Option<ResultSet>,
    pub states: Vec<RunState>,
}
