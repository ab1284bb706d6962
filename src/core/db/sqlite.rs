use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{Connection, InterruptHandle, OpenFlags};
use tracing::debug;

use super::{Database, ResultSet, Scalar, SqlParams};
use crate::core::error::{QaError, SafetyViolation};

/// SQLite-backed [`Database`].
///
/// The connection is shared behind a mutex and every query runs on the
/// blocking pool. A query whose future is dropped before it completes (timeout
/// or cancellation) interrupts the running statement.
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
}

impl SqliteDatabase {
    pub fn new(conn: Connection) -> Self {
        let interrupt = Arc::new(conn.get_interrupt_handle());
        Self {
            conn: Arc::new(Mutex::new(conn)),
            interrupt,
        }
    }

    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open database {}", path.display()))?;
        Ok(Self::new(conn))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryPhase {
    Queued,
    Running,
    Finished,
    Abandoned,
}

/// Interrupts the connection if the query future is dropped while its
/// statement is running. The phase lock is held across both the interrupt
/// and the blocking task leaving `Running`, and the task leaves `Running`
/// before it releases the connection, so the interrupt can only reach this
/// query's statement.
struct InterruptOnDrop {
    handle: Arc<InterruptHandle>,
    phase: Arc<Mutex<QueryPhase>>,
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        match *phase {
            QueryPhase::Queued => *phase = QueryPhase::Abandoned,
            QueryPhase::Running => {
                debug!("Interrupting abandoned query");
                self.handle.interrupt();
            }
            QueryPhase::Finished | QueryPhase::Abandoned => {}
        }
    }
}

fn set_phase(phase: &Mutex<QueryPhase>, next: QueryPhase) {
    *phase.lock().unwrap_or_else(|e| e.into_inner()) = next;
}

#[async_trait]
impl Database for SqliteDatabase {
    async fn query(&self, sql: &str, params: &SqlParams) -> Result<ResultSet, QaError> {
        let conn = Arc::clone(&self.conn);
        let phase = Arc::new(Mutex::new(QueryPhase::Queued));
        let _guard = InterruptOnDrop {
            handle: Arc::clone(&self.interrupt),
            phase: Arc::clone(&phase),
        };

        let sql = sql.to_string();
        let bindings = to_bindings(params);
        let task = tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            {
                let mut current = phase.lock().unwrap_or_else(|e| e.into_inner());
                if *current == QueryPhase::Abandoned {
                    return Err(QaError::ExecutionError("interrupted".to_string()));
                }
                *current = QueryPhase::Running;
            }
            let out = run_query(&conn, &sql, &bindings);
            set_phase(&phase, QueryPhase::Finished);
            drop(conn);
            out
        });

        task.await
            .map_err(|e| QaError::ExecutionError(format!("query task failed: {}", e)))?
    }
}

fn engine_error(e: rusqlite::Error) -> QaError {
    QaError::ExecutionError(e.to_string())
}

fn run_query(
    conn: &Connection,
    sql: &str,
    bindings: &[(String, Value)],
) -> Result<ResultSet, QaError> {
    let mut stmt = conn.prepare(sql).map_err(engine_error)?;
    if !stmt.readonly() {
        return Err(SafetyViolation::WriteOperationForbidden {
            keyword: "non-read-only statement".to_string(),
        }
        .into());
    }

    // Parameters the statement does not declare are ignored.
    for (name, value) in bindings {
        if let Some(idx) = stmt.parameter_index(name).map_err(engine_error)? {
            stmt.raw_bind_parameter(idx, value).map_err(engine_error)?;
        }
    }

    let columns: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(String::from)
        .collect();

    let mut rows = stmt.raw_query();
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(engine_error)? {
        let mut values = Vec::with_capacity(columns.len());
        for idx in 0..columns.len() {
            values.push(Scalar::from(row.get_ref(idx).map_err(engine_error)?));
        }
        out.push(values);
    }

    Ok(ResultSet { columns, rows: out })
}

fn to_bindings(params: &SqlParams) -> Vec<(String, Value)> {
    params
        .iter()
        .map(|(name, value)| (parameter_name(name), json_to_sql(value)))
        .collect()
}

fn parameter_name(name: &str) -> String {
    if name.starts_with([':', '@', '$']) {
        name.to_string()
    } else {
        format!(":{}", name)
    }
}

fn json_to_sql(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Integer(i64::from(*b)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => Value::Real(n.as_f64().unwrap_or_default()),
        },
        serde_json::Value::String(s) => Value::Text(s.clone()),
        other => Value::Text(other.to_string()),
    }
}
