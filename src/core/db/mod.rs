mod seed;
mod sqlite;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use serde::Serialize;

use crate::core::error::QaError;

pub use seed::{UNIVERSITY_SEED, load_sql_file, open_seeded};
pub use sqlite::SqliteDatabase;

/// Named query parameters as produced by the model (`{"code": "CS101"}`).
pub type SqlParams = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Scalar {
    #[cfg(test)]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => write!(f, "NULL"),
            Scalar::Integer(v) => write!(f, "{}", v),
            Scalar::Real(v) => write!(f, "{}", v),
            Scalar::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<ValueRef<'_>> for Scalar {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Scalar::Null,
            ValueRef::Integer(v) => Scalar::Integer(v),
            ValueRef::Real(v) => Scalar::Real(v),
            ValueRef::Text(bytes) => Scalar::Text(String::from_utf8_lossy(bytes).into_owned()),
            // Blobs have no natural text form; hex keeps them printable in prompts.
            ValueRef::Blob(bytes) => Scalar::Text(format!("x'{}'", hex::encode(bytes))),
        }
    }
}

/// Rows returned by a successful query, in engine order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Scalar>>,
}

impl ResultSet {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value of `column` in row `row`, matched case-insensitively.
    #[cfg(test)]
    pub fn get(&self, row: usize, column: &str) -> Option<&Scalar> {
        let idx = self
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    /// `{"columns":[...],"rows":[[...]]}` on a single line, for prompts.
    pub fn to_compact_json(&self) -> String {
        serde_json::json!({ "columns": self.columns, "rows": self.rows }).to_string()
    }
}

/// Read access to the database a question is answered against.
///
/// The handle is opened and closed by the caller; implementations must be
/// safe to share between concurrent runs.
#[async_trait]
pub trait Database: Send + Sync {
    async fn query(&self, sql: &str, params: &SqlParams) -> Result<ResultSet, QaError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ResultSet {
        ResultSet {
            columns: vec!["name".into(), "avg_grade".into(), "note".into()],
            rows: vec![vec![
                Scalar::Text("Dr. Alice Nguyen".into()),
                Scalar::Real(90.5),
                Scalar::Null,
            ]],
        }
    }

    #[test]
    fn compact_json_keeps_column_order_and_nulls() {
        assert_eq!(
            sample().to_compact_json(),
            r#"{"columns":["name","avg_grade","note"],"rows":[["Dr. Alice Nguyen",90.5,null]]}"#
        );
    }

    #[test]
    fn get_matches_columns_case_insensitively() {
        let rs = sample();
        assert_eq!(
            rs.get(0, "NAME").and_then(Scalar::as_str),
            Some("Dr. Alice Nguyen")
        );
        assert!(rs.get(1, "name").is_none());
        assert!(rs.get(0, "missing").is_none());
    }

    #[test]
    fn blob_values_render_as_hex_literals() {
        let scalar = Scalar::from(ValueRef::Blob(&[0xde, 0xad]));
        assert_eq!(scalar, Scalar::Text("x'dead'".into()));
    }
}
