mod types;

pub use types::{
    AttemptOutcome, ExecutionAttempt, FailureReason, Question, RunReport, RunResult, RunState,
};

use std::future::Future;
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::answer::AnswerRenderer;
use crate::core::config::AgentConfig;
use crate::core::db::{Database, ResultSet, SqlParams};
use crate::core::error::QaError;
use crate::core::llm::LlmClient;
use crate::core::protocol::{GenerationContext, ModelAction, request};
use crate::core::safety::SqlValidator;
use crate::core::schema::SchemaIntrospector;
use crate::core::trace::{TraceSink, Tracer};

pub fn can_transition(from: RunState, to: RunState) -> bool {
    if from.is_terminal() {
        return false;
    }
    match from {
        RunState::Start => matches!(to, RunState::LoadSchema | RunState::Failed),
        RunState::LoadSchema => matches!(to, RunState::GenerateAction | RunState::Failed),
        RunState::GenerateAction => matches!(
            to,
            RunState::Validate | RunState::Clarify | RunState::GenerateAction | RunState::Failed
        ),
        RunState::Validate => matches!(
            to,
            RunState::Execute | RunState::GenerateAction | RunState::Failed
        ),
        RunState::Execute => matches!(
            to,
            RunState::Render | RunState::GenerateAction | RunState::Failed
        ),
        RunState::Clarify => matches!(to, RunState::Clarified | RunState::Failed),
        RunState::Render => matches!(to, RunState::Answered | RunState::Failed),
        RunState::Answered | RunState::Clarified | RunState::Failed => false,
    }
}

/// Answers one question at a time against a database, asking the model for
/// SQL and feeding failures back until the attempt budget runs out.
pub struct QaAgent {
    db: Arc<dyn Database>,
    llm: LlmClient,
    renderer: AnswerRenderer,
    validator: SqlValidator,
    config: AgentConfig,
    trace_sink: Arc<dyn TraceSink>,
}

impl QaAgent {
    pub fn new(
        db: Arc<dyn Database>,
        llm: LlmClient,
        config: AgentConfig,
        trace_sink: Arc<dyn TraceSink>,
    ) -> Self {
        Self {
            renderer: AnswerRenderer::new(llm.clone()),
            validator: SqlValidator::new(config.default_row_limit),
            db,
            llm,
            config,
            trace_sink,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn llm(&self) -> &LlmClient {
        &self.llm
    }

    pub async fn run(&self, question: &str) -> RunReport {
        self.run_with_cancel(question, &CancellationToken::new())
            .await
    }

    /// Like [`run`](Self::run), but `cancel` ends the run at the next
    /// suspension point with `Failed(Cancelled)`.
    pub async fn run_with_cancel(&self, question: &str, cancel: &CancellationToken) -> RunReport {
        let question = Question::new(question);
        info!("Run {} started: {}", question.run_id, question.text);
        let tracer = Tracer::new(question.run_id.clone(), self.trace_sink.clone());
        let mut run = Run::new(tracer, self.config.max_attempts);
        let result = self.drive(&question, &mut run, cancel).await;
        run.finish(question, result)
    }

    async fn drive(
        &self,
        question: &Question,
        run: &mut Run,
        cancel: &CancellationToken,
    ) -> RunResult {
        run.enter(RunState::LoadSchema);
        let schema = match guarded(cancel, SchemaIntrospector::describe(self.db.as_ref())).await {
            Ok(schema) => schema,
            Err(QaError::Cancelled) => return run.cancelled(),
            Err(e) => {
                warn!("Schema load failed: {}", e);
                run.tracer
                    .record("load_schema", json!({ "ok": false, "error": e.to_string() }));
                return run.fail(FailureReason::SchemaUnavailable, &e);
            }
        };
        run.tracer.record(
            "load_schema",
            json!({
                "ok": true,
                "tables": schema.table_names(),
                "chars": schema.text().len(),
            }),
        );

        loop {
            run.enter(RunState::GenerateAction);
            run.iterations += 1;
            let number = run.attempts.len() as u32 + 1;
            run.tracer.record(
                "attempt",
                json!({ "attempt": number, "max_attempts": self.config.max_attempts }),
            );

            let ctx = GenerationContext {
                question: &question.text,
                schema: &schema,
                attempts: &run.attempts,
            };
            let generated = guarded(cancel, request(&self.llm, &ctx)).await;
            let action = match generated {
                Ok(action) => action,
                Err(QaError::Cancelled) => return run.cancelled(),
                Err(e) => {
                    run.tracer.record(
                        "generate",
                        json!({
                            "attempt": number,
                            "ok": false,
                            "kind": e.kind(),
                            "error": e.to_string(),
                        }),
                    );
                    match run.fail_attempt(number, None, None, e) {
                        Some(result) => return result,
                        None => continue,
                    }
                }
            };

            let (sql, params) = match &action {
                ModelAction::ClarifyRequest { question: ask } => {
                    run.tracer.record(
                        "generate",
                        json!({ "attempt": number, "ok": true, "type": "clarify", "question": ask }),
                    );
                    run.enter(RunState::Clarify);
                    let text = AnswerRenderer::clarification(ask);
                    run.tracer
                        .record("answer", json!({ "status": "clarify", "text": text }));
                    run.enter(RunState::Clarified);
                    return RunResult::Clarify { text };
                }
                ModelAction::SqlRequest { sql, params } => (sql.clone(), params.clone()),
            };
            run.tracer.record(
                "generate",
                json!({ "attempt": number, "ok": true, "type": "sql", "sql": sql, "params": params }),
            );

            run.enter(RunState::Validate);
            let validated = match self.validator.validate(&sql, &schema) {
                Ok(validated) => validated,
                Err(violation) => {
                    run.tracer.record(
                        "validate",
                        json!({
                            "attempt": number,
                            "ok": false,
                            "reason": violation.reason(),
                            "error": violation.to_string(),
                        }),
                    );
                    match run.fail_attempt(number, Some(action), Some(sql), violation.into()) {
                        Some(result) => return result,
                        None => continue,
                    }
                }
            };
            run.tracer.record(
                "validate",
                json!({
                    "attempt": number,
                    "ok": true,
                    "sql": validated.sql,
                    "limit_appended": validated.limit_appended,
                    "tables": validated.tables,
                }),
            );

            run.enter(RunState::Execute);
            let rows = match guarded(cancel, self.execute(&validated.sql, &params)).await {
                Ok(rows) => rows,
                Err(QaError::Cancelled) => return run.cancelled(),
                Err(e) => {
                    run.tracer.record(
                        "execute",
                        json!({
                            "attempt": number,
                            "ok": false,
                            "sql": validated.sql,
                            "kind": e.kind(),
                            "error": e.to_string(),
                        }),
                    );
                    match run.fail_attempt(number, Some(action), Some(validated.sql), e) {
                        Some(result) => return result,
                        None => continue,
                    }
                }
            };
            run.tracer.record(
                "execute",
                json!({
                    "attempt": number,
                    "ok": true,
                    "sql": validated.sql,
                    "columns": rows.columns,
                    "row_count": rows.len(),
                }),
            );
            run.attempts.push(ExecutionAttempt {
                number,
                action: Some(action),
                sql: Some(validated.sql.clone()),
                outcome: AttemptOutcome::Success { rows: rows.len() },
            });
            run.final_sql = Some(validated.sql.clone());

            run.enter(RunState::Render);
            let rendered = guarded(
                cancel,
                self.renderer.render(&question.text, &validated.sql, &rows),
            )
            .await;
            run.rows = Some(rows);
            return match rendered {
                Ok(text) => {
                    run.tracer
                        .record("answer", json!({ "status": "answered", "text": text }));
                    run.enter(RunState::Answered);
                    RunResult::Answered { text }
                }
                Err(QaError::Cancelled) => run.cancelled(),
                Err(e) => {
                    warn!("Answer rendering failed: {}", e);
                    run.tracer.record(
                        "answer",
                        json!({ "status": "failed", "kind": e.kind(), "error": e.to_string() }),
                    );
                    run.fail(FailureReason::AnswerUnavailable, &e)
                }
            };
        }
    }

    async fn execute(
        &self,
        sql: &str,
        params: &SqlParams,
    ) -> Result<ResultSet, QaError> {
        let limit = self.config.query_timeout;
        match tokio::time::timeout(limit, self.db.query(sql, params)).await {
            Ok(result) => result,
            Err(_) => Err(QaError::Timeout {
                stage: "query",
                after: limit,
            }),
        }
    }
}

/// Await `fut` unless `cancel` fires first.
async fn guarded<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, QaError>
where
    F: Future<Output = Result<T, QaError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(QaError::Cancelled),
        out = fut => out,
    }
}

/// Mutable bookkeeping for one run.
struct Run {
    tracer: Tracer,
    max_attempts: u32,
    states: Vec<RunState>,
    attempts: Vec<ExecutionAttempt>,
    iterations: u32,
    final_sql: Option<String>,
    rows: Option<ResultSet>,
}

impl Run {
    fn new(tracer: Tracer, max_attempts: u32) -> Self {
        Self {
            tracer,
            max_attempts,
            states: vec![RunState::Start],
            attempts: Vec::new(),
            iterations: 0,
            final_sql: None,
            rows: None,
        }
    }

    fn current(&self) -> RunState {
        self.states.last().copied().unwrap_or(RunState::Start)
    }

    fn enter(&mut self, next: RunState) {
        let current = self.current();
        debug_assert!(
            can_transition(current, next),
            "illegal transition {:?} -> {:?}",
            current,
            next
        );
        debug!("{} -> {}", current.as_str(), next.as_str());
        self.states.push(next);
    }

    /// Record a failed attempt. Returns the terminal result once the budget
    /// is spent.
    fn fail_attempt(
        &mut self,
        number: u32,
        action: Option<ModelAction>,
        sql: Option<String>,
        error: QaError,
    ) -> Option<RunResult> {
        debug_assert!(error.is_retryable(), "{} cannot be retried", error.kind());
        info!(
            "Attempt {}/{} failed ({}): {}",
            number,
            self.max_attempts,
            error.kind(),
            error
        );
        let message = error.to_string();
        self.attempts.push(ExecutionAttempt {
            number,
            action,
            sql,
            outcome: AttemptOutcome::Failure(error),
        });
        if self.attempts.len() as u32 >= self.max_attempts {
            warn!("Retry budget of {} attempts exhausted", self.max_attempts);
            self.enter(RunState::Failed);
            return Some(RunResult::Failed {
                reason: FailureReason::RetryBudgetExhausted,
                last_error: message,
            });
        }
        None
    }

    fn fail(&mut self, reason: FailureReason, error: &QaError) -> RunResult {
        self.enter(RunState::Failed);
        RunResult::Failed {
            reason,
            last_error: error.to_string(),
        }
    }

    fn cancelled(&mut self) -> RunResult {
        let state = self.current();
        info!("Run cancelled during {}", state.as_str());
        self.tracer.record(
            "cancelled",
            json!({ "state": state.as_str(), "attempts": self.attempts.len() }),
        );
        self.fail(FailureReason::Cancelled, &QaError::Cancelled)
    }

    fn finish(self, question: Question, result: RunResult) -> RunReport {
        info!(
            "Run {} finished: {} after {} attempt(s)",
            question.run_id,
            result.status(),
            self.attempts.len()
        );
        RunReport {
            run_id: question.run_id,
            question: question.text,
            result,
            attempts: self.attempts,
            iterations: self.iterations,
            final_sql: self.final_sql,
            rows: self.rows,
            states: self.states,
        }
    }
}

#[cfg(test)]
mod tests;
