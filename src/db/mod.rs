//! Direct database connections for the local manager.
//!
//! The local manager talks to its database through [`SqlConnection`], a small
//! surface covering what dumping, clearing and importing need. Two engines
//! implement it:
//!
//! - [`mysql::MySqlConnection`] for the MySQL/MariaDB servers projects deploy on
//! - [`sqlite::SqliteConnection`] for embedded databases (fixtures, offline work)
//!
//! SQL text that differs between engines is rendered by [`Dialect`].

pub mod dump;
pub mod mysql;
pub mod sqlite;

use std::io;

use thiserror::Error;

use crate::credentials::ConnectionDescriptor;

pub use dump::{DumpStats, StatementReader, write_dump};

#[derive(Error, Debug)]
pub enum DbError {
    #[error("MySQL error: {0}")]
    MySql(#[from] ::mysql::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Table {0} does not exist")]
    MissingTable(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A single column value read from a table.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Unsigned(u64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// SQL flavour of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    MySql,
    Sqlite,
}

impl Dialect {
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Self::MySql => format!("`{}`", name.replace('`', "``")),
            Self::Sqlite => format!("\"{}\"", name.replace('"', "\"\"")),
        }
    }

    /// Render a value as a literal that fits on a single line.
    pub fn literal(self, value: &SqlValue) -> String {
        match value {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Integer(i) => i.to_string(),
            SqlValue::Unsigned(u) => u.to_string(),
            SqlValue::Real(f) if f.is_finite() => f.to_string(),
            SqlValue::Real(_) => "NULL".to_string(),
            SqlValue::Blob(bytes) if bytes.is_empty() => "''".to_string(),
            SqlValue::Blob(bytes) => format!("X'{}'", hex::encode_upper(bytes)),
            SqlValue::Text(text) => match self {
                Self::MySql => mysql_string(text),
                Self::Sqlite => sqlite_string(text),
            },
        }
    }

    pub fn foreign_key_checks(self, enabled: bool) -> &'static str {
        match (self, enabled) {
            (Self::MySql, false) => "SET FOREIGN_KEY_CHECKS = 0",
            (Self::MySql, true) => "SET FOREIGN_KEY_CHECKS = 1",
            (Self::Sqlite, false) => "PRAGMA foreign_keys = OFF",
            (Self::Sqlite, true) => "PRAGMA foreign_keys = ON",
        }
    }

    pub fn begin(self) -> &'static str {
        match self {
            Self::MySql => "START TRANSACTION",
            Self::Sqlite => "BEGIN",
        }
    }
}

fn mysql_string(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            '\u{1a}' => out.push_str("\\Z"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

// SQLite has no backslash escapes, so line breaks are spliced in with char().
fn sqlite_string(text: &str) -> String {
    let mut parts = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        match c {
            '\n' | '\r' => {
                parts.push(format!("'{}'", current.replace('\'', "''")));
                parts.push(format!("char({})", c as u32));
                current.clear();
            }
            c => current.push(c),
        }
    }
    parts.push(format!("'{}'", current.replace('\'', "''")));
    parts.join(" || ")
}

/// Visitor receiving each row of a table scan with the column names.
pub type RowVisitor<'a> = dyn FnMut(&[String], &[SqlValue]) -> Result<(), DbError> + 'a;

/// An open connection to one database.
pub trait SqlConnection {
    fn dialect(&self) -> Dialect;

    /// Execute a statement that returns no rows.
    fn execute(&mut self, sql: &str) -> Result<(), DbError>;

    /// Names of all base tables, views excluded.
    fn list_tables(&mut self) -> Result<Vec<String>, DbError>;

    /// `CREATE TABLE` statement for `table`, without a trailing semicolon.
    fn create_table_statement(&mut self, table: &str) -> Result<String, DbError>;

    /// Stream every row of `table` to `visit`.
    fn scan_table(&mut self, table: &str, visit: &mut RowVisitor<'_>) -> Result<(), DbError>;

    fn set_foreign_key_checks(&mut self, enabled: bool) -> Result<(), DbError> {
        let sql = self.dialect().foreign_key_checks(enabled);
        self.execute(sql)
    }

    fn begin(&mut self) -> Result<(), DbError> {
        let sql = self.dialect().begin();
        self.execute(sql)
    }

    fn commit(&mut self) -> Result<(), DbError> {
        self.execute("COMMIT")
    }

    fn rollback(&mut self) -> Result<(), DbError> {
        self.execute("ROLLBACK")
    }
}

/// Opens connections from resolved credentials.
pub trait Connector {
    fn connect(
        &self,
        credentials: &ConnectionDescriptor,
    ) -> Result<Box<dyn SqlConnection>, DbError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_escape_their_quote_character() {
        assert_eq!(Dialect::MySql.quote_identifier("we`ird"), "`we``ird`");
        assert_eq!(Dialect::Sqlite.quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn mysql_strings_stay_on_one_line() {
        let literal = Dialect::MySql.literal(&SqlValue::Text("it's\na \\ test".into()));
        assert_eq!(literal, r"'it\'s\na \\ test'");
        assert!(!literal.contains('\n'));
    }

    #[test]
    fn sqlite_strings_splice_line_breaks() {
        let literal = Dialect::Sqlite.literal(&SqlValue::Text("it's\nok".into()));
        assert_eq!(literal, "'it''s' || char(10) || 'ok'");
    }

    #[test]
    fn blobs_render_as_hex() {
        let blob = SqlValue::Blob(vec![0xde, 0xad, 0x00]);
        assert_eq!(Dialect::MySql.literal(&blob), "X'DEAD00'");
        assert_eq!(Dialect::Sqlite.literal(&blob), "X'DEAD00'");
    }

    #[test]
    fn non_finite_reals_become_null() {
        assert_eq!(Dialect::Sqlite.literal(&SqlValue::Real(f64::NAN)), "NULL");
        assert_eq!(Dialect::MySql.literal(&SqlValue::Real(1.5)), "1.5");
    }
}
