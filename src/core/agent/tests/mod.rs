
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::agent::QaAgent;
use crate::core::config::AgentConfig;
use crate::core::db::{Database, ResultSet, SqlParams, SqliteDatabase, UNIVERSITY_SEED, open_seeded};
use crate::core::error::QaError;
use crate::core::llm::LlmClient;
use crate::core::llm::providers::scripted::ScriptedProvider;
use crate::core::trace::MemoryTraceSink;

pub(super) const CS101_TEACHER_SQL: &str = "SELECT t.name FROM course_offerings o \
     JOIN teachers t ON t.teacher_id = o.teacher_id \
     JOIN courses c ON c.course_id = o.course_id \
     WHERE c.code = 'CS101' AND o.semester = 'Spring' AND o.year = 2026";

pub(super) const BAD_COLUMN_SQL: &str = "SELECT t.fullname FROM course_offerings o \
     JOIN teachers t ON t.teacher_id = o.teacher_id \
     JOIN courses c ON c.course_id = o.course_id \
     WHERE c.code = 'CS101' AND o.semester = 'Spring' AND o.year = 2026";

pub(super) fn seeded_db() -> Arc<dyn Database> {
    Arc::new(SqliteDatabase::new(
        open_seeded(None, UNIVERSITY_SEED).expect("seed db"),
    ))
}

pub(super) struct Harness {
    pub agent: QaAgent,
    pub provider: Arc<ScriptedProvider>,
    pub trace: Arc<MemoryTraceSink>,
}

pub(super) fn harness(provider: ScriptedProvider, config: AgentConfig) -> Harness {
    harness_with_db(seeded_db(), provider, config)
}

pub(super) fn harness_with_db(
    db: Arc<dyn Database>,
    provider: ScriptedProvider,
    config: AgentConfig,
) -> Harness {
    let provider = Arc::new(provider);
    let trace = Arc::new(MemoryTraceSink::new());
    let llm = LlmClient::new(provider.clone(), &config);
    let agent = QaAgent::new(db, llm, config, trace.clone());
    Harness {
        agent,
        provider,
        trace,
    }
}

/// Passes catalog reads straight through and stalls everything else.
pub(super) struct StallingDatabase {
    pub inner: Arc<dyn Database>,
    pub stall: Duration,
}

#[async_trait]
impl Database for StallingDatabase {
    async fn query(&self, sql: &str, params: &SqlParams) -> Result<ResultSet, QaError> {
        let catalog = sql.contains("sqlite_master") || sql.contains("pragma_");
        if !catalog {
            tokio::time::sleep(self.stall).await;
        }
        self.inner.query(sql, params).await
    }
}
