use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::CommandArgs;
use crate::core::agent::QaAgent;
use crate::core::config::AgentConfig;
use crate::core::db::{Database, SqliteDatabase, UNIVERSITY_SEED, load_sql_file, open_seeded};
use crate::core::llm::LlmClient;
use crate::core::llm::providers::OpenAiProvider;
use crate::core::trace::{
    FanoutTraceSink, JsonlTraceSink, LogTraceSink, MemoryTraceSink, TraceSink,
};

/// Open the database named on the command line.
///
/// `--seed` is applied first (into `--db` when given, otherwise into memory).
/// Without either flag the bundled university data is loaded in memory.
pub(crate) fn open_database(args: &CommandArgs) -> Result<Arc<dyn Database>> {
    let db: Arc<dyn Database> = match (&args.db, &args.seed) {
        (Some(path), Some(seed)) => {
            drop(load_sql_file(seed, Some(path))?);
            Arc::new(SqliteDatabase::open_read_only(path)?)
        }
        (Some(path), None) => {
            if !path.exists() {
                anyhow::bail!("database {} does not exist", path.display());
            }
            Arc::new(SqliteDatabase::open_read_only(path)?)
        }
        (None, Some(seed)) => Arc::new(SqliteDatabase::new(load_sql_file(seed, None)?)),
        (None, None) => {
            info!("No --db given, using the bundled university data");
            Arc::new(SqliteDatabase::new(open_seeded(None, UNIVERSITY_SEED)?))
        }
    };
    Ok(db)
}

pub(crate) fn load_config(args: &CommandArgs) -> Result<AgentConfig> {
    let mut config = AgentConfig::load(args.config.as_deref())?;
    if let Some(model) = &args.model {
        config.model = model.clone();
    }
    if let Some(max_attempts) = args.max_attempts {
        config.max_attempts = max_attempts;
    }
    config.validate()?;
    Ok(config)
}

/// Everything one CLI invocation needs to run questions.
pub(crate) struct Session {
    pub agent: QaAgent,
    pub memory: Arc<MemoryTraceSink>,
}

impl Session {
    pub fn open(args: &CommandArgs) -> Result<Self> {
        let config = load_config(args)?;
        let api_key = config.require_api_key()?.to_string();
        let db = open_database(args)?;

        let provider = Arc::new(OpenAiProvider::new(api_key, config.base_url.clone()));
        let llm = LlmClient::new(provider, &config);

        let memory = Arc::new(MemoryTraceSink::new());
        let mut sinks: Vec<Arc<dyn TraceSink>> = vec![memory.clone(), Arc::new(LogTraceSink)];
        if let Some(path) = &args.trace_file {
            let sink = JsonlTraceSink::open(path)
                .with_context(|| format!("cannot write trace file {}", path.display()))?;
            sinks.push(Arc::new(sink));
        }
        let trace_sink = Arc::new(FanoutTraceSink::new(sinks));

        Ok(Self {
            agent: QaAgent::new(db, llm, config, trace_sink),
            memory,
        })
    }
}

/// A token that fires on Ctrl-C.
pub(crate) fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Ctrl-C received, cancelling");
                trigger.cancel();
            }
            Err(e) => warn!("Cannot listen for Ctrl-C: {}", e),
        }
    });
    token
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::db::{Scalar, SqlParams};

    #[tokio::test]
    async fn default_database_is_the_bundled_seed() {
        let db = open_database(&CommandArgs::default()).unwrap();
        let rs = db
            .query("SELECT COUNT(*) AS n FROM teachers", &SqlParams::new())
            .await
            .unwrap();
        assert_eq!(rs.get(0, "n").and_then(Scalar::as_i64), Some(3));
    }

    #[tokio::test]
    async fn seed_into_file_then_reopen_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let seed = dir.path().join("tiny.sql");
        std::fs::write(
            &seed,
            "CREATE TABLE pets (name TEXT NOT NULL); INSERT INTO pets VALUES ('Rex');",
        )
        .unwrap();
        let args = CommandArgs {
            db: Some(dir.path().join("pets.db")),
            seed: Some(seed),
            ..CommandArgs::default()
        };

        let db = open_database(&args).unwrap();
        let rs = db.query("SELECT name FROM pets", &SqlParams::new()).await.unwrap();
        assert_eq!(rs.get(0, "name").and_then(Scalar::as_str), Some("Rex"));
    }

    #[test]
    fn missing_database_file_is_an_error() {
        let args = CommandArgs {
            db: Some("/definitely/not/here.db".into()),
            ..CommandArgs::default()
        };
        assert!(open_database(&args).is_err());
    }

    #[test]
    fn flags_override_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("askdb.toml");
        std::fs::write(&path, "model = \"from-file\"\nmax_attempts = 4\n").unwrap();
        let args = CommandArgs {
            config: Some(path),
            model: Some("from-flag".into()),
            ..CommandArgs::default()
        };
        let config = load_config(&args).unwrap();
        assert_eq!(config.model, "from-flag");
        assert_eq!(config.max_attempts, 4);
    }
}
