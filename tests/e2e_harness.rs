#![allow(dead_code)]

use axum::{Json, Router, extract::State, routing::post};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use uuid::Uuid;

pub type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub const CS101_SQL: &str = "SELECT t.name FROM course_offerings o \
     JOIN teachers t ON t.teacher_id = o.teacher_id \
     JOIN courses c ON c.course_id = o.course_id \
     WHERE c.code = 'CS101' AND o.semester = 'Spring' AND o.year = 2026";

pub const BAD_COLUMN_SQL: &str = "SELECT t.fullname FROM course_offerings o \
     JOIN teachers t ON t.teacher_id = o.teacher_id \
     JOIN courses c ON c.course_id = o.course_id \
     WHERE c.code = 'CS101' AND o.semester = 'Spring' AND o.year = 2026";

/// One finished `askdb` process.
pub struct CliRun {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl From<Output> for CliRun {
    fn from(out: Output) -> Self {
        Self {
            code: out.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&out.stdout).to_string(),
            stderr: String::from_utf8_lossy(&out.stderr).to_string(),
        }
    }
}

/// Runs the `askdb` binary against a mock model endpoint, with its config
/// directory pointed at a throwaway location.
pub struct CliHarness {
    base_url: String,
    home: LocalTempDir,
    artifact_dir: PathBuf,
}

impl CliHarness {
    pub fn new(base_url: String) -> TestResult<Self> {
        Ok(Self {
            base_url,
            home: LocalTempDir::new("askdb-e2e-home")?,
            artifact_dir: prepare_artifact_dir()?,
        })
    }

    /// Scratch space removed when the harness is dropped.
    pub fn work_dir(&self) -> &Path {
        self.home.path()
    }

    /// Where logs meant to outlive the test run are written.
    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    pub async fn run(&self, args: &[&str]) -> TestResult<CliRun> {
        let out = tokio::process::Command::new(askdb_binary_path()?)
            .args(args)
            .env("OPENAI_API_KEY", "dummy")
            .env("ASKDB_BASE_URL", &self.base_url)
            .env("XDG_CONFIG_HOME", self.home.path())
            .env("HOME", self.home.path())
            .env_remove("ASKDB_MODEL")
            .env_remove("ASKDB_MAX_ATTEMPTS")
            .env_remove("ASKDB_ROW_LIMIT")
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(out.into())
    }
}

#[derive(Clone)]
struct MockServerState {
    traces: Arc<Mutex<Vec<String>>>,
}

pub struct MockLlmServer {
    pub port: u16,
    traces: Arc<Mutex<Vec<String>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

#[derive(Debug, Deserialize, Serialize)]
struct MockChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MockOpenAiRequest {
    model: String,
    messages: Vec<MockChatMessage>,
}

async fn mock_chat_completion(
    State(state): State<MockServerState>,
    Json(payload): Json<MockOpenAiRequest>,
) -> Json<Value> {
    let prompt = payload
        .messages
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let response_content = mock_llm_response(&prompt);
    let response = json!({
        "choices": [{
            "message": {
                "role": "assistant",
                "content": response_content
            }
        }]
    });

    let mut traces = state.traces.lock().unwrap_or_else(|e| e.into_inner());
    traces.push(format!(
        "REQUEST model={}\n{}\nRESPONSE {}",
        payload.model, prompt, response
    ));
    drop(traces);

    Json(response)
}

impl MockLlmServer {
    pub async fn start() -> TestResult<Self> {
        let port = find_free_port()?;
        let traces = Arc::new(Mutex::new(Vec::new()));
        let state = MockServerState {
            traces: Arc::clone(&traces),
        };
        let app = Router::new()
            .route("/v1/chat/completions", post(mock_chat_completion))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Ok(Self {
            port,
            traces,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}/v1/chat/completions", self.port)
    }

    pub fn requests(&self) -> Vec<String> {
        self.traces.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn persist_trace_file(&self, dir: &Path, name: &str) -> TestResult<PathBuf> {
        let path = dir.join(format!("{}.mock.trace.log", name));
        let lines = self.traces.lock().unwrap_or_else(|e| e.into_inner());
        std::fs::write(&path, lines.join("\n\n---\n\n"))?;
        Ok(path)
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

pub fn find_free_port() -> TestResult<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

fn prepare_artifact_dir() -> TestResult<PathBuf> {
    let path = std::env::var("ASKDB_E2E_ARTIFACTS")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            PathBuf::from(env!("CARGO_MANIFEST_DIR"))
                .join("target")
                .join("e2e-artifacts")
        });
    std::fs::create_dir_all(&path)?;
    Ok(path)
}

fn askdb_binary_path() -> TestResult<PathBuf> {
    if let Some(path) = option_env!("CARGO_BIN_EXE_askdb") {
        return Ok(PathBuf::from(path));
    }

    let candidate = PathBuf::from("target")
        .join("debug")
        .join(if cfg!(windows) { "askdb.exe" } else { "askdb" });
    if candidate.exists() {
        return Ok(candidate);
    }

    Err("Could not locate askdb test binary path".into())
}

/// Canned model behaviour keyed on markers in the user question:
/// `[retry]` sends a bad column first, `[broken]` never recovers, and
/// "about courses" asks for clarification.
fn mock_llm_response(prompt: &str) -> String {
    if !prompt.contains("Convert the user question") {
        if prompt.contains("Dr. Alice Nguyen") {
            return "Dr. Alice Nguyen taught CS101 in Spring 2026.".to_string();
        }
        return "The result does not say.".to_string();
    }

    let question = prompt
        .split("User question: ")
        .nth(1)
        .and_then(|rest| rest.lines().next())
        .unwrap_or_default();

    if question.contains("about courses") {
        return json!({
            "type": "clarify",
            "question": "Which courses do you mean: a department, a semester, or a teacher?"
        })
        .to_string();
    }

    let retrying = prompt.contains("--- Previous attempt");
    let sql = if question.contains("[broken]") || (question.contains("[retry]") && !retrying) {
        BAD_COLUMN_SQL
    } else {
        CS101_SQL
    };
    // Wrapped in a fence the way chat models often reply.
    format!(
        "```json\n{}\n```",
        json!({ "type": "sql", "sql": sql, "params": {} })
    )
}

struct LocalTempDir {
    path: PathBuf,
}

impl LocalTempDir {
    fn new(prefix: &str) -> TestResult<Self> {
        let path = std::env::temp_dir().join(format!("{}-{}", prefix, Uuid::new_v4().simple()));
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LocalTempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}
