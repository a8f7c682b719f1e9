//! MySQL / MariaDB connections.

use std::time::Instant;

use ::mysql::prelude::Queryable;
use ::mysql::{Conn, OptsBuilder, Value};

use super::{Connector, DbError, Dialect, RowVisitor, SqlConnection, SqlValue};
use crate::credentials::ConnectionDescriptor;

pub struct MySqlConnection {
    conn: Conn,
}

impl MySqlConnection {
    /// Connect using only the fields present in `credentials`; anything
    /// absent is left to the driver.
    pub fn open(credentials: &ConnectionDescriptor) -> Result<Self, DbError> {
        let start = Instant::now();
        let mut opts = OptsBuilder::new()
            .ip_or_hostname(credentials.host())
            .user(credentials.user())
            .pass(credentials.password())
            .db_name(Some(credentials.db_name()));
        if let Some(port) = credentials.port() {
            opts = opts.tcp_port(port);
        }

        let mut conn = Conn::new(opts)?;
        conn.query_drop("SET NAMES utf8mb4")?;

        tracing::info!(
            dsn = %credentials.to_dsn(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "opened MySQL connection"
        );
        Ok(Self { conn })
    }
}

impl SqlConnection for MySqlConnection {
    fn dialect(&self) -> Dialect {
        Dialect::MySql
    }

    fn execute(&mut self, sql: &str) -> Result<(), DbError> {
        self.conn.query_drop(sql)?;
        Ok(())
    }

    fn list_tables(&mut self) -> Result<Vec<String>, DbError> {
        let tables: Vec<(String, String)> = self
            .conn
            .query("SHOW FULL TABLES WHERE Table_type = 'BASE TABLE'")?;
        Ok(tables.into_iter().map(|(name, _)| name).collect())
    }

    fn create_table_statement(&mut self, table: &str) -> Result<String, DbError> {
        let sql = format!("SHOW CREATE TABLE {}", Dialect::MySql.quote_identifier(table));
        self.conn
            .query_first::<(String, String), _>(sql)?
            .map(|(_, ddl)| ddl)
            .ok_or_else(|| DbError::MissingTable(table.to_string()))
    }

    fn scan_table(&mut self, table: &str, visit: &mut RowVisitor<'_>) -> Result<(), DbError> {
        let sql = format!("SELECT * FROM {}", Dialect::MySql.quote_identifier(table));
        let mut columns: Option<Vec<String>> = None;

        for row in self.conn.query_iter(sql)? {
            let row = row?;
            let names = columns.get_or_insert_with(|| {
                row.columns_ref()
                    .iter()
                    .map(|c| c.name_str().into_owned())
                    .collect()
            });
            let values: Vec<SqlValue> = (0..row.len())
                .map(|i| row.as_ref(i).map_or(SqlValue::Null, from_mysql))
                .collect();
            visit(names, &values)?;
        }
        Ok(())
    }
}

fn from_mysql(value: &Value) -> SqlValue {
    match value {
        Value::NULL => SqlValue::Null,
        Value::Bytes(bytes) => match String::from_utf8(bytes.clone()) {
            Ok(text) => SqlValue::Text(text),
            Err(e) => SqlValue::Blob(e.into_bytes()),
        },
        Value::Int(i) => SqlValue::Integer(*i),
        Value::UInt(u) => SqlValue::Unsigned(*u),
        Value::Float(f) => SqlValue::Real(f64::from(*f)),
        Value::Double(d) => SqlValue::Real(*d),
        Value::Date(year, month, day, hour, minute, second, micros) => {
            let mut text =
                format!("{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}");
            if *micros > 0 {
                text.push_str(&format!(".{micros:06}"));
            }
            SqlValue::Text(text)
        }
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let sign = if *negative { "-" } else { "" };
            let hours = u64::from(*days) * 24 + u64::from(*hours);
            let mut text = format!("{sign}{hours:02}:{minutes:02}:{seconds:02}");
            if *micros > 0 {
                text.push_str(&format!(".{micros:06}"));
            }
            SqlValue::Text(text)
        }
    }
}

/// Connects to MySQL with the project's resolved credentials.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlConnector;

impl Connector for MySqlConnector {
    fn connect(
        &self,
        credentials: &ConnectionDescriptor,
    ) -> Result<Box<dyn SqlConnection>, DbError> {
        Ok(Box::new(MySqlConnection::open(credentials)?))
    }
}
