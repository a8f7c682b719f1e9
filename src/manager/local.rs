//! Manager for the database of the local project.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use flate2::Compression;
use flate2::write::GzEncoder;
use tempfile::TempPath;

use super::{DumpArtifact, Manager, ManagerError, normalize_project_path};
use crate::archiver::{Archiver, GzipArchiver};
use crate::credentials::{
    self, ConfigFormat, ConnectionDescriptor, CredentialsError, DATABASE_URL_KEY,
};
use crate::db::mysql::MySqlConnector;
use crate::db::{Connector, DbError, DumpStats, SqlConnection, StatementReader, write_dump};

/// Dotenv file holding `DATABASE_URL`, relative to the project root.
pub const DOTENV_FILE: &str = ".env";

/// Structured parameters file, relative to the project root.
pub const PARAMETERS_FILE: &str = "app/config/parameters.yml";

/// Direct access to the local project's database.
///
/// Credentials and the connection are opened on first use and reused
/// afterwards. Temporary files created while importing live as long as the
/// manager and are removed when it is dropped, whatever the outcome.
pub struct LocalManager {
    project_path: String,
    credentials: Option<ConnectionDescriptor>,
    connector: Box<dyn Connector>,
    connection: Option<Box<dyn SqlConnection>>,
    archiver: Box<dyn Archiver>,
    artifact: DumpArtifact,
    temp_files: Vec<TempPath>,
}

impl LocalManager {
    /// Manager for a MySQL-backed project.
    pub fn new(project_path: &str) -> Self {
        Self::with_connector(project_path, MySqlConnector)
    }

    pub fn with_connector(project_path: &str, connector: impl Connector + 'static) -> Self {
        Self {
            project_path: normalize_project_path(project_path),
            credentials: None,
            connector: Box::new(connector),
            connection: None,
            archiver: Box::new(GzipArchiver::new()),
            artifact: DumpArtifact::default(),
            temp_files: Vec::new(),
        }
    }

    pub fn with_archiver(mut self, archiver: impl Archiver + 'static) -> Self {
        self.archiver = Box::new(archiver);
        self
    }

    /// Credentials from `.env`, falling back to `app/config/parameters.yml`.
    pub fn credentials(&mut self) -> Result<&ConnectionDescriptor, ManagerError> {
        let resolved = match self.credentials.take() {
            Some(resolved) => resolved,
            None => {
                let resolved = resolve_local_credentials(&self.project_path)?;
                tracing::debug!(
                    project = %self.project_path,
                    dsn = %resolved.to_dsn(),
                    "resolved local credentials"
                );
                resolved
            }
        };
        Ok(self.credentials.insert(resolved))
    }

    fn connection(&mut self) -> Result<&mut dyn SqlConnection, ManagerError> {
        let conn = match self.connection.take() {
            Some(conn) => conn,
            None => {
                let start = Instant::now();
                let credentials = self.credentials()?.clone();
                let conn = self.connector.connect(&credentials)?;
                tracing::info!(
                    db_name = credentials.db_name(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "lazily opened local database connection"
                );
                conn
            }
        };
        Ok(self.connection.insert(conn).as_mut())
    }

    /// True when the database has no tables.
    pub fn database_is_empty(&mut self) -> Result<bool, ManagerError> {
        Ok(self.connection()?.list_tables()?.is_empty())
    }

    /// Drop every table in one transaction with foreign key checks disabled.
    ///
    /// Returns the number of dropped tables. The rollback on failure only
    /// restores the schema on engines with transactional DDL such as SQLite;
    /// MySQL commits each `DROP TABLE` implicitly, so tables dropped before
    /// the failure stay dropped.
    pub fn clear_database(&mut self) -> Result<usize, ManagerError> {
        let conn = self.connection()?;
        let tables = conn.list_tables()?;
        let dialect = conn.dialect();

        without_foreign_keys(conn, |conn| {
            in_transaction(conn, |conn| {
                for table in &tables {
                    conn.execute(&format!("DROP TABLE {}", dialect.quote_identifier(table)))?;
                }
                Ok(())
            })
        })
        .map_err(|e| ManagerError::Clear(e.to_string()))?;

        tracing::info!(tables = tables.len(), "cleared local database");
        Ok(tables.len())
    }

    /// Write a gzip-compressed dump of the whole database to
    /// [`dump_pathname`](Manager::dump_pathname).
    pub fn dump_database(&mut self) -> Result<DumpStats, ManagerError> {
        let pathname = self.dump_pathname()?;
        let db_name = self.credentials()?.db_name().to_string();
        let start = Instant::now();
        let dump_err = |reason: String| ManagerError::Dump {
            pathname: pathname.clone(),
            reason,
        };

        // No file is created until the database is reachable.
        let conn = self.connection().map_err(|e| dump_err(e.to_string()))?;
        let file = File::create(&pathname).map_err(|e| dump_err(e.to_string()))?;

        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        let written = write_dump(conn, &db_name, &mut encoder).and_then(|stats| {
            encoder.finish()?.flush()?;
            Ok(stats)
        });

        match written {
            Ok(stats) => {
                tracing::info!(
                    pathname = %pathname,
                    tables = stats.tables,
                    rows = stats.rows,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "dumped local database"
                );
                Ok(stats)
            }
            Err(e) => {
                if let Err(rm) = fs::remove_file(&pathname) {
                    tracing::debug!(pathname = %pathname, error = %rm, "unable to remove partial dump");
                }
                Err(dump_err(e.to_string()))
            }
        }
    }

    /// Replay a gzip-compressed dump into the database.
    ///
    /// The archive is extracted to a private temporary file, then executed
    /// statement by statement in a single transaction with foreign key checks
    /// disabled. Returns the number of executed statements.
    ///
    /// On MySQL the `DROP TABLE`/`CREATE TABLE` statements of a dump commit
    /// implicitly, so a failed import can leave the tables created before the
    /// failing statement. Only row inserts since the last DDL are rolled back.
    pub fn import_dump(&mut self, pathname: &Path) -> Result<u64, ManagerError> {
        let start = Instant::now();
        let import_err = |reason: String| ManagerError::Import {
            pathname: pathname.display().to_string(),
            reason,
        };

        let scratch = tempfile::Builder::new()
            .prefix("db_")
            .suffix(".sql")
            .tempfile()
            .map_err(|e| import_err(format!("unable to create temporary file: {e}")))?
            .into_temp_path();
        let sql_path = scratch.to_path_buf();
        self.temp_files.push(scratch);

        self.archiver
            .extract(pathname, &sql_path)
            .map_err(|e| import_err(e.to_string()))?;
        let file = File::open(&sql_path).map_err(|e| {
            import_err(format!("unable to read {}: {e}", sql_path.display()))
        })?;
        let statements = StatementReader::new(BufReader::new(file));

        let conn = self.connection()?;
        let executed = without_foreign_keys(conn, |conn| {
            in_transaction(conn, |conn| {
                let mut executed = 0u64;
                for statement in statements {
                    let statement = statement?;
                    if let Err(e) = conn.execute(&statement) {
                        tracing::warn!(statement_number = executed + 1, "dump statement failed");
                        return Err(e);
                    }
                    executed += 1;
                }
                Ok(executed)
            })
        })
        .map_err(|e| import_err(e.to_string()))?;

        tracing::info!(
            pathname = %pathname.display(),
            statements = executed,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "imported dump into local database"
        );
        Ok(executed)
    }
}

impl Manager for LocalManager {
    fn project_path(&self) -> &str {
        &self.project_path
    }

    fn dump_filename(&mut self) -> Result<String, ManagerError> {
        let db_name = self.credentials()?.db_name().to_string();
        Ok(self.artifact.filename(&db_name).to_string())
    }

    fn dump_pathname(&mut self) -> Result<String, ManagerError> {
        let db_name = self.credentials()?.db_name().to_string();
        Ok(self
            .artifact
            .pathname(&self.project_path, &db_name)
            .to_string())
    }
}

impl Drop for LocalManager {
    fn drop(&mut self) {
        for path in self.temp_files.drain(..) {
            let shown = path.display().to_string();
            if let Err(e) = path.close() {
                tracing::debug!(path = %shown, error = %e, "unable to remove temporary file");
            }
        }
    }
}

fn resolve_local_credentials(project_path: &str) -> Result<ConnectionDescriptor, CredentialsError> {
    let dotenv = PathBuf::from(format!("{project_path}{DOTENV_FILE}"));
    match fs::read(&dotenv) {
        Ok(raw) => match credentials::resolve(&raw, ConfigFormat::DatabaseUrl) {
            Ok(resolved) => return Ok(resolved),
            Err(CredentialsError::MissingRequiredField {
                field: DATABASE_URL_KEY,
                ..
            }) => {
                tracing::debug!(path = %dotenv.display(), "no DATABASE_URL, trying parameters file");
            }
            Err(e) => return Err(e),
        },
        Err(e) => {
            tracing::debug!(path = %dotenv.display(), error = %e, "dotenv file not readable");
        }
    }

    let parameters = PathBuf::from(format!("{project_path}{PARAMETERS_FILE}"));
    match fs::read(&parameters) {
        Ok(raw) => credentials::resolve(&raw, ConfigFormat::Parameters),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(CredentialsError::ConfigNotFound {
                searched: vec![dotenv, parameters],
            })
        }
        Err(source) => Err(CredentialsError::Io {
            path: parameters,
            source,
        }),
    }
}

/// Run `f` with foreign key checks off, turning them back on afterwards even
/// when `f` fails.
fn without_foreign_keys<T>(
    conn: &mut dyn SqlConnection,
    f: impl FnOnce(&mut dyn SqlConnection) -> Result<T, DbError>,
) -> Result<T, DbError> {
    conn.set_foreign_key_checks(false)?;
    let result = f(&mut *conn);
    let restored = conn.set_foreign_key_checks(true);
    let value = result?;
    restored?;
    Ok(value)
}

fn in_transaction<T>(
    conn: &mut dyn SqlConnection,
    f: impl FnOnce(&mut dyn SqlConnection) -> Result<T, DbError>,
) -> Result<T, DbError> {
    conn.begin()?;
    match f(&mut *conn) {
        Ok(value) => {
            conn.commit()?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = conn.rollback() {
                tracing::warn!(error = %rollback, "rollback failed");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::SqliteConnector;
    use tempfile::TempDir;

    fn project_with(files: &[(&str, &str)]) -> TempDir {
        let tmp = TempDir::new().unwrap();
        for (name, content) in files {
            let path = tmp.path().join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        tmp
    }

    fn manager_for(project: &TempDir) -> LocalManager {
        let db = project.path().join("local.sqlite");
        LocalManager::with_connector(project.path().to_str().unwrap(), SqliteConnector::new(db))
    }

    #[test]
    fn dotenv_url_wins_over_parameters() {
        let project = project_with(&[
            (DOTENV_FILE, "DATABASE_URL=mysql://app:pw@127.0.0.1:3306/from_env\n"),
            (PARAMETERS_FILE, "parameters:\n    database_name: from_yaml\n"),
        ]);
        let mut manager = manager_for(&project);
        assert_eq!(manager.credentials().unwrap().db_name(), "from_env");
    }

    #[test]
    fn dotenv_without_url_falls_back_to_parameters() {
        let project = project_with(&[
            (DOTENV_FILE, "APP_ENV=dev\n"),
            (PARAMETERS_FILE, "parameters:\n    database_name: from_yaml\n"),
        ]);
        let mut manager = manager_for(&project);
        assert_eq!(manager.credentials().unwrap().db_name(), "from_yaml");
    }

    #[test]
    fn missing_dotenv_falls_back_to_parameters() {
        let project = project_with(&[(PARAMETERS_FILE, "parameters:\n    database_name: shop\n")]);
        let mut manager = manager_for(&project);
        assert_eq!(manager.credentials().unwrap().db_name(), "shop");
    }

    #[test]
    fn no_configuration_is_config_not_found() {
        let project = project_with(&[]);
        let mut manager = manager_for(&project);
        let err = manager.credentials().unwrap_err();
        assert!(matches!(
            err,
            ManagerError::Credentials(CredentialsError::ConfigNotFound { ref searched }) if searched.len() == 2
        ));
    }

    #[test]
    fn malformed_url_does_not_fall_back() {
        let project = project_with(&[
            (DOTENV_FILE, "DATABASE_URL=definitely-not-a-url\n"),
            (PARAMETERS_FILE, "parameters:\n    database_name: shop\n"),
        ]);
        let mut manager = manager_for(&project);
        assert!(matches!(
            manager.credentials().unwrap_err(),
            ManagerError::Credentials(CredentialsError::ConfigFormat { .. })
        ));
    }

    #[test]
    fn dump_names_are_stable_for_the_manager_lifetime() {
        let project = project_with(&[(PARAMETERS_FILE, "parameters:\n    database_name: shop\n")]);
        let mut manager = manager_for(&project);
        let filename = manager.dump_filename().unwrap();
        let pathname = manager.dump_pathname().unwrap();
        assert_eq!(manager.dump_filename().unwrap(), filename);
        assert_eq!(manager.dump_pathname().unwrap(), pathname);
        assert_eq!(pathname, format!("{}{}", manager.project_path(), filename));
        assert!(manager.project_path().ends_with('/'));
    }

    #[test]
    fn temporary_files_are_removed_on_drop_even_after_failure() {
        let project = project_with(&[(PARAMETERS_FILE, "parameters:\n    database_name: shop\n")]);
        let broken = project.path().join("broken.sql.gz");
        fs::write(&broken, b"not gzip").unwrap();

        let mut manager = manager_for(&project);
        let err = manager.import_dump(&broken).unwrap_err();
        assert!(matches!(err, ManagerError::Import { .. }));

        let scratch: Vec<PathBuf> = manager.temp_files.iter().map(|p| p.to_path_buf()).collect();
        assert_eq!(scratch.len(), 1);
        assert!(scratch[0].exists());

        drop(manager);
        assert!(!scratch[0].exists());
    }

    #[test]
    fn clear_database_rolls_back_when_a_drop_fails() {
        struct FailingDrop(crate::db::sqlite::SqliteConnection);

        impl SqlConnection for FailingDrop {
            fn dialect(&self) -> crate::db::Dialect {
                self.0.dialect()
            }
            fn execute(&mut self, sql: &str) -> Result<(), DbError> {
                if sql.starts_with("DROP TABLE \"b\"") {
                    return Err(DbError::MissingTable("b".into()));
                }
                self.0.execute(sql)
            }
            fn list_tables(&mut self) -> Result<Vec<String>, DbError> {
                self.0.list_tables()
            }
            fn create_table_statement(&mut self, table: &str) -> Result<String, DbError> {
                self.0.create_table_statement(table)
            }
            fn scan_table(
                &mut self,
                table: &str,
                visit: &mut crate::db::RowVisitor<'_>,
            ) -> Result<(), DbError> {
                self.0.scan_table(table, visit)
            }
        }

        struct FailingConnector(PathBuf);

        impl Connector for FailingConnector {
            fn connect(
                &self,
                _: &ConnectionDescriptor,
            ) -> Result<Box<dyn SqlConnection>, DbError> {
                Ok(Box::new(FailingDrop(crate::db::sqlite::SqliteConnection::open(&self.0)?)))
            }
        }

        let project = project_with(&[(PARAMETERS_FILE, "parameters:\n    database_name: shop\n")]);
        let db = project.path().join("local.sqlite");
        {
            let mut conn = crate::db::sqlite::SqliteConnection::open(&db).unwrap();
            conn.execute("CREATE TABLE a (id INTEGER); CREATE TABLE b (id INTEGER); CREATE TABLE c (id INTEGER);")
                .unwrap();
        }

        let mut manager =
            LocalManager::with_connector(project.path().to_str().unwrap(), FailingConnector(db));
        assert!(matches!(manager.clear_database(), Err(ManagerError::Clear(_))));
        assert_eq!(
            manager.connection().unwrap().list_tables().unwrap(),
            vec!["a", "b", "c"]
        );
    }

    #[test]
    fn unreachable_database_is_a_dump_error_without_leftover_file() {
        let project = project_with(&[(PARAMETERS_FILE, "parameters:\n    database_name: shop\n")]);
        let unreachable = project.path().join("no/such/dir/db.sqlite");
        let mut manager = LocalManager::with_connector(
            project.path().to_str().unwrap(),
            SqliteConnector::new(unreachable),
        );

        let err = manager.dump_database().unwrap_err();
        let pathname = manager.dump_pathname().unwrap();
        assert!(
            matches!(err, ManagerError::Dump { pathname: ref p, .. } if *p == pathname),
            "{err:?}"
        );
        assert!(!Path::new(&pathname).exists());
    }
}
