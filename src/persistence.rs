//! Persistence contract over `rusqlite`.
//!
//! The core never issues SQL directly; it calls `get/all/run/exec` on a
//! `Persistence` handle. Call sites write `$1, $2, …` ordinal placeholders
//! (the Open Question resolution recorded in DESIGN.md); this module
//! rewrites them to rusqlite's native `?1, ?2, …` once, centrally, so the
//! rewrite never leaks past this file.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{types::Value, Connection};

/// One row as a map from column name to value.
pub type Row = std::collections::HashMap<String, Value>;

pub struct RunResult {
    pub changes: usize,
    pub last_insert_rowid: i64,
}

/// Rewrite `$1, $2, …` to `?1, ?2, …`. `$` is not a valid SQL token
/// elsewhere in the statements this crate issues, so a single linear scan
/// is sufficient — no need to parse string literals specially.
fn rewrite_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' && chars.peek().map(|c| c.is_ascii_digit()).unwrap_or(false) {
            out.push('?');
        } else {
            out.push(c);
        }
    }
    out
}

pub struct Persistence {
    conn: Mutex<Connection>,
}

impl Persistence {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).context("opening sqlite database")?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL; PRAGMA foreign_keys = ON;",
        )
        .context("applying sqlite pragmas")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory sqlite database")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Schema DDL / migrations. Not parameterised.
    pub fn exec(&self, sql: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(sql).context("executing DDL")?;
        Ok(())
    }

    /// `get(sql, params) -> row | null`.
    pub fn get(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Option<Row>> {
        let conn = self.conn.lock();
        let rewritten = rewrite_placeholders(sql);
        let mut stmt = conn.prepare(&rewritten).context("preparing statement")?;
        let col_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let mut rows = stmt.query(params).context("executing query")?;
        if let Some(row) = rows.next().context("fetching row")? {
            Ok(Some(row_to_map(row, &col_names)?))
        } else {
            Ok(None)
        }
    }

    /// `all(sql, params) -> rows`.
    pub fn all(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Row>> {
        let conn = self.conn.lock();
        let rewritten = rewrite_placeholders(sql);
        let mut stmt = conn.prepare(&rewritten).context("preparing statement")?;
        let col_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let mut rows = stmt.query(params).context("executing query")?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().context("fetching row")? {
            out.push(row_to_map(row, &col_names)?);
        }
        Ok(out)
    }

    /// `run(sql, params) -> {changes, lastInsertRowid}`.
    pub fn run(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<RunResult> {
        let conn = self.conn.lock();
        let rewritten = rewrite_placeholders(sql);
        let changes = conn
            .execute(&rewritten, params)
            .context("executing statement")?;
        Ok(RunResult {
            changes,
            last_insert_rowid: conn.last_insert_rowid(),
        })
    }

    /// `run` variant for statements using `RETURNING id`.
    pub fn run_returning_id(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<i64> {
        let conn = self.conn.lock();
        let rewritten = rewrite_placeholders(sql);
        let id: i64 = conn
            .query_row(&rewritten, params, |row| row.get(0))
            .context("executing RETURNING statement")?;
        Ok(id)
    }
}

fn row_to_map(row: &rusqlite::Row, col_names: &[String]) -> Result<Row> {
    let mut map = Row::new();
    for (i, name) in col_names.iter().enumerate() {
        let value: Value = row.get(i).context("reading column value")?;
        map.insert(name.clone(), value);
    }
    Ok(map)
}
