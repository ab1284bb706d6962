use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::info;

/// Demo university schema and data: teachers, students, courses, offerings
/// and enrollments.
pub const UNIVERSITY_SEED: &str = include_str!("university.sql");

/// Open `db_path` (or a fresh in-memory database) with foreign keys enforced
/// and run `script` against it.
pub fn open_seeded(db_path: Option<&Path>, script: &str) -> Result<Connection> {
    let conn = match db_path {
        Some(path) => Connection::open(path)
            .with_context(|| format!("failed to open database {}", path.display()))?,
        None => Connection::open_in_memory().context("failed to open in-memory database")?,
    };
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute_batch(script).context("failed to apply seed script")?;
    Ok(conn)
}

pub fn load_sql_file(sql_path: &Path, db_path: Option<&Path>) -> Result<Connection> {
    let script = std::fs::read_to_string(sql_path)
        .with_context(|| format!("failed to read seed file {}", sql_path.display()))?;
    info!("Seeding database from {}", sql_path.display());
    open_seeded(db_path, &script)
}
