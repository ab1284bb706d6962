use std::fmt::Write as _;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::json;
use tracing::debug;

use crate::core::db::{Database, ResultSet, Scalar, SqlParams};
use crate::core::error::QaError;

static CHECK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bCHECK\s*\(").expect("valid CHECK regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub decl_type: String,
    pub not_null: bool,
    pub default: Option<String>,
    /// 1-based position inside the primary key, 0 when not part of it.
    pub pk_position: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub columns: Vec<String>,
    pub parent: String,
    pub parent_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub unique: Vec<Vec<String>>,
    pub foreign_keys: Vec<ForeignKey>,
    pub checks: Vec<String>,
}

/// Tables of the target database plus their prompt rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaDescription {
    tables: Vec<TableDef>,
    text: String,
}

impl SchemaDescription {
    pub fn new(tables: Vec<TableDef>) -> Self {
        let text = render(&tables);
        Self { tables, text }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.iter().any(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }
}

const TABLES_SQL: &str = "SELECT name, sql FROM sqlite_master \
     WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name";
const COLUMNS_SQL: &str = "SELECT name, type, \"notnull\", dflt_value, pk \
     FROM pragma_table_info(:table) ORDER BY cid";
const UNIQUE_SQL: &str = "SELECT il.name AS index_name, ii.name AS column_name \
     FROM pragma_index_list(:table) AS il JOIN pragma_index_info(il.name) AS ii \
     WHERE il.\"unique\" = 1 AND il.origin != 'pk' AND il.partial = 0 \
     ORDER BY il.name, ii.seqno";
const FOREIGN_KEYS_SQL: &str = "SELECT id, \"table\", \"from\", \"to\" \
     FROM pragma_foreign_key_list(:table) ORDER BY id, seq";

pub struct SchemaIntrospector;

impl SchemaIntrospector {
    /// Read every user table with its columns and constraints.
    ///
    /// Tables come out sorted by name and columns in declaration order, so an
    /// unchanged database always yields byte-identical text.
    pub async fn describe(db: &dyn Database) -> Result<SchemaDescription, QaError> {
        let unavailable = |e: QaError| QaError::SchemaUnavailable(e.to_string());

        let tables = db
            .query(TABLES_SQL, &SqlParams::new())
            .await
            .map_err(unavailable)?;
        if tables.is_empty() {
            return Err(QaError::SchemaUnavailable(
                "database contains no tables".to_string(),
            ));
        }

        let mut defs = Vec::with_capacity(tables.len());
        for row in &tables.rows {
            let name = text_at(row, 0);
            let ddl = text_at(row, 1);
            let mut params = SqlParams::new();
            params.insert("table".to_string(), json!(name));

            let columns = db.query(COLUMNS_SQL, &params).await.map_err(unavailable)?;
            let unique = db.query(UNIQUE_SQL, &params).await.map_err(unavailable)?;
            let fks = db
                .query(FOREIGN_KEYS_SQL, &params)
                .await
                .map_err(unavailable)?;

            defs.push(TableDef {
                columns: columns_from(&columns),
                unique: unique_from(&unique),
                foreign_keys: foreign_keys_from(&fks),
                checks: extract_checks(&ddl),
                name,
            });
        }

        debug!("Introspected {} tables", defs.len());
        Ok(SchemaDescription::new(defs))
    }
}

fn text_at(row: &[Scalar], idx: usize) -> String {
    match row.get(idx) {
        Some(Scalar::Null) | None => String::new(),
        Some(v) => v.to_string(),
    }
}

fn int_at(row: &[Scalar], idx: usize) -> i64 {
    row.get(idx).and_then(Scalar::as_i64).unwrap_or_default()
}

fn columns_from(rs: &ResultSet) -> Vec<ColumnDef> {
    rs.rows
        .iter()
        .map(|row| ColumnDef {
            name: text_at(row, 0),
            decl_type: text_at(row, 1),
            not_null: int_at(row, 2) != 0,
            default: row.get(3).filter(|v| !v.is_null()).map(Scalar::to_string),
            pk_position: int_at(row, 4),
        })
        .collect()
}

fn unique_from(rs: &ResultSet) -> Vec<Vec<String>> {
    let mut out: Vec<(String, Vec<String>)> = Vec::new();
    for row in &rs.rows {
        let index = text_at(row, 0);
        let column = text_at(row, 1);
        match out.last_mut() {
            Some((name, cols)) if *name == index => cols.push(column),
            _ => out.push((index, vec![column])),
        }
    }
    out.into_iter().map(|(_, cols)| cols).collect()
}

fn foreign_keys_from(rs: &ResultSet) -> Vec<ForeignKey> {
    let mut out: Vec<(i64, ForeignKey)> = Vec::new();
    for row in &rs.rows {
        let id = int_at(row, 0);
        let parent = text_at(row, 1);
        let from = text_at(row, 2);
        let to = text_at(row, 3);
        match out.last_mut() {
            Some((last, fk)) if *last == id => {
                fk.columns.push(from);
                fk.parent_columns.push(to);
            }
            _ => out.push((
                id,
                ForeignKey {
                    columns: vec![from],
                    parent,
                    parent_columns: vec![to],
                },
            )),
        }
    }
    out.into_iter().map(|(_, fk)| fk).collect()
}

/// Pull every `CHECK (...)` expression out of a `CREATE TABLE` statement,
/// with whitespace runs collapsed.
pub fn extract_checks(ddl: &str) -> Vec<String> {
    let mut checks = Vec::new();
    for m in CHECK_RE.find_iter(ddl) {
        let open = m.end() - 1;
        if let Some(close) = matching_paren(ddl, open) {
            let inner = ddl[open + 1..close].split_whitespace().collect::<Vec<_>>();
            checks.push(format!("CHECK ({})", inner.join(" ")));
        }
    }
    checks
}

fn matching_paren(text: &str, open: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            continue;
        }
        match b {
            b'\'' | b'"' => quote = Some(b),
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn render(tables: &[TableDef]) -> String {
    let mut out = String::new();
    for (i, table) in tables.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let _ = writeln!(out, "TABLE {} (", table.name);

        let pk_columns: Vec<&ColumnDef> = {
            let mut pk: Vec<&ColumnDef> =
                table.columns.iter().filter(|c| c.pk_position > 0).collect();
            pk.sort_by_key(|c| c.pk_position);
            pk
        };
        let single_pk = pk_columns.len() == 1;

        let mut lines: Vec<String> = Vec::new();
        for col in &table.columns {
            let mut line = format!("  {}", col.name);
            if !col.decl_type.is_empty() {
                line.push(' ');
                line.push_str(&col.decl_type);
            }
            if single_pk && col.pk_position > 0 {
                line.push_str(" PRIMARY KEY");
            }
            if col.not_null {
                line.push_str(" NOT NULL");
            }
            if let Some(default) = &col.default {
                let _ = write!(line, " DEFAULT {}", default);
            }
            if table.unique.iter().any(|u| u.len() == 1 && u[0] == col.name) {
                line.push_str(" UNIQUE");
            }
            for fk in &table.foreign_keys {
                if fk.columns.len() == 1 && fk.columns[0] == col.name {
                    let _ = write!(line, " REFERENCES {}", fk.parent);
                    if !fk.parent_columns[0].is_empty() {
                        let _ = write!(line, "({})", fk.parent_columns[0]);
                    }
                }
            }
            lines.push(line);
        }

        if pk_columns.len() > 1 {
            let names: Vec<&str> = pk_columns.iter().map(|c| c.name.as_str()).collect();
            lines.push(format!("  PRIMARY KEY ({})", names.join(", ")));
        }
        for unique in table.unique.iter().filter(|u| u.len() > 1) {
            lines.push(format!("  UNIQUE ({})", unique.join(", ")));
        }
        for fk in table.foreign_keys.iter().filter(|fk| fk.columns.len() > 1) {
            let mut line = format!(
                "  FOREIGN KEY ({}) REFERENCES {}",
                fk.columns.join(", "),
                fk.parent
            );
            if fk.parent_columns.iter().all(|c| !c.is_empty()) {
                let _ = write!(line, "({})", fk.parent_columns.join(", "));
            }
            lines.push(line);
        }
        for check in &table.checks {
            lines.push(format!("  {}", check));
        }

        out.push_str(&lines.join(",\n"));
        out.push_str("\n);\n");
    }
    out
}
