//! Embedded SQLite databases.

use std::path::{Path, PathBuf};

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OptionalExtension};

use super::{Connector, DbError, Dialect, RowVisitor, SqlConnection, SqlValue};
use crate::credentials::ConnectionDescriptor;

pub struct SqliteConnection {
    conn: Connection,
}

impl SqliteConnection {
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "opened SQLite database");
        Ok(Self { conn })
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn raw(&self) -> &Connection {
        &self.conn
    }
}

impl SqlConnection for SqliteConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn execute(&mut self, sql: &str) -> Result<(), DbError> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    fn list_tables(&mut self) -> Result<Vec<String>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let tables = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tables)
    }

    fn create_table_statement(&mut self, table: &str) -> Result<String, DbError> {
        self.conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .ok_or_else(|| DbError::MissingTable(table.to_string()))
    }

    fn scan_table(&mut self, table: &str, visit: &mut RowVisitor<'_>) -> Result<(), DbError> {
        let sql = format!("SELECT * FROM {}", Dialect::Sqlite.quote_identifier(table));
        let mut stmt = self.conn.prepare(&sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let values = (0..columns.len())
                .map(|i| row.get_ref(i).map(from_sqlite))
                .collect::<Result<Vec<_>, _>>()?;
            visit(&columns, &values)?;
        }
        Ok(())
    }
}

fn from_sqlite(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Integer(i),
        ValueRef::Real(f) => SqlValue::Real(f),
        ValueRef::Text(bytes) => SqlValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => SqlValue::Blob(bytes.to_vec()),
    }
}

/// Opens one fixed SQLite file regardless of the credentials' host or user.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    path: PathBuf,
}

impl SqliteConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Connector for SqliteConnector {
    fn connect(
        &self,
        credentials: &ConnectionDescriptor,
    ) -> Result<Box<dyn SqlConnection>, DbError> {
        tracing::debug!(
            db_name = credentials.db_name(),
            path = %self.path.display(),
            "using SQLite file for database"
        );
        Ok(Box::new(SqliteConnection::open(&self.path)?))
    }
}
