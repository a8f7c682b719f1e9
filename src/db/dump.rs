//! Logical SQL dumps: writing them from a connection and splitting them back
//! into statements.
//!
//! Dumps are plain SQL. Comment lines start with `--` or `/*`, table
//! definitions may span several lines, and every row is a single-line
//! `INSERT`. A statement ends on the first line whose last character is `;`.

use std::io::{self, BufRead, Write};

use super::{DbError, SqlConnection};

/// What a dump contained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct DumpStats {
    pub tables: usize,
    pub rows: u64,
}

/// Write a dump of every base table reachable through `conn`.
pub fn write_dump<W: Write>(
    conn: &mut dyn SqlConnection,
    db_name: &str,
    out: &mut W,
) -> Result<DumpStats, DbError> {
    let dialect = conn.dialect();
    let mut stats = DumpStats::default();

    writeln!(out, "-- Databaser SQL dump")?;
    writeln!(out, "-- Database: {db_name}")?;
    writeln!(out, "-- Generated: {}", chrono::Local::now().to_rfc3339())?;

    for table in conn.list_tables()? {
        let quoted = dialect.quote_identifier(&table);
        let ddl = conn.create_table_statement(&table)?;

        writeln!(out)?;
        writeln!(out, "--")?;
        writeln!(out, "-- Table structure for table {quoted}")?;
        writeln!(out, "--")?;
        writeln!(out)?;
        writeln!(out, "DROP TABLE IF EXISTS {quoted};")?;
        writeln!(out, "{};", ddl.trim_end().trim_end_matches(';'))?;

        let mut rows = 0u64;
        conn.scan_table(&table, &mut |columns, values| {
            if rows == 0 {
                writeln!(out)?;
                writeln!(out, "--")?;
                writeln!(out, "-- Dumping data for table {quoted}")?;
                writeln!(out, "--")?;
                writeln!(out)?;
            }
            let columns = columns
                .iter()
                .map(|c| dialect.quote_identifier(c))
                .collect::<Vec<_>>()
                .join(", ");
            let values = values
                .iter()
                .map(|v| dialect.literal(v))
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(out, "INSERT INTO {quoted} ({columns}) VALUES ({values});")?;
            rows += 1;
            Ok(())
        })?;

        tracing::debug!(table = %table, rows, "dumped table");
        stats.tables += 1;
        stats.rows += rows;
    }

    writeln!(out)?;
    writeln!(out, "-- Dump completed")?;
    Ok(stats)
}

/// Splits a dump into executable statements.
///
/// Lines starting with `/*` or `--` are skipped. Remaining lines accumulate,
/// joined by newlines, until one ends with `;`. A trailing fragment without a
/// terminator is dropped.
pub struct StatementReader<R> {
    input: R,
    line: String,
    buffer: String,
}

impl<R: BufRead> StatementReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            line: String::new(),
            buffer: String::new(),
        }
    }
}

impl<R: BufRead> Iterator for StatementReader<R> {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.line.clear();
            match self.input.read_line(&mut self.line) {
                Ok(0) => {
                    if !self.buffer.trim().is_empty() {
                        tracing::warn!(
                            fragment_len = self.buffer.len(),
                            "ignoring trailing SQL without terminating semicolon"
                        );
                        self.buffer.clear();
                    }
                    return None;
                }
                Ok(_) => {}
                Err(e) => return Some(Err(e)),
            }

            let line = self.line.trim_end_matches(['\n', '\r']);
            if line.starts_with("/*") || line.starts_with("--") {
                continue;
            }
            if line.trim().is_empty() && self.buffer.is_empty() {
                continue;
            }

            if !self.buffer.is_empty() {
                self.buffer.push('\n');
            }
            self.buffer.push_str(line);

            if line.trim_end().ends_with(';') {
                return Some(Ok(std::mem::take(&mut self.buffer)));
            }
        }
    }
}
