#![allow(dead_code)]

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use databaser::db::sqlite::{SqliteConnection, SqliteConnector};
use databaser::db::{SqlConnection, StatementReader, write_dump};
use databaser::manager::LocalManager;
use databaser::manager::local::PARAMETERS_FILE;
use databaser::transport::{Transport, TransportError};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tempfile::TempDir;

/// Captures tracing output for tests.
pub struct TestTracing {
    buffer: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
}

impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    pub fn assert_contains(&self, needle: &str) {
        let out = self.output();
        assert!(
            out.contains(needle),
            "expected logs to contain `{needle}`, got:\n{out}"
        );
    }
}

struct TestWriter(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

impl Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Project directory with an `app/config/parameters.yml` naming `db_name`.
pub fn project_dir(db_name: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    let parameters = dir.path().join(PARAMETERS_FILE);
    fs::create_dir_all(parameters.parent().unwrap()).unwrap();
    fs::write(
        &parameters,
        format!(
            "parameters:\n    database_host: 127.0.0.1\n    database_name: {db_name}\n    database_user: app\n    database_password: secret\n"
        ),
    )
    .unwrap();
    dir
}

pub fn path_str(dir: &TempDir) -> String {
    dir.path().to_str().unwrap().to_string()
}

/// Create `tables` tables named `t0..`, table `tN` holding `N + 1` rows.
pub fn seed_tables(db: &Path, tables: usize) {
    let mut conn = SqliteConnection::open(db).unwrap();
    for i in 0..tables {
        conn.execute(&format!(
            "CREATE TABLE t{i} (id INTEGER PRIMARY KEY, label TEXT, payload BLOB)"
        ))
        .unwrap();
        for row in 0..=i {
            conn.execute(&format!(
                "INSERT INTO t{i} (label, payload) VALUES ('row {row} of t{i}', X'00{row:02X}')"
            ))
            .unwrap();
        }
    }
}

/// Row count per table.
pub fn row_counts(db: &Path) -> HashMap<String, i64> {
    let mut conn = SqliteConnection::open(db).unwrap();
    let tables = conn.list_tables().unwrap();
    tables
        .into_iter()
        .map(|table| {
            let count = conn
                .raw()
                .query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |r| r.get::<_, i64>(0))
                .unwrap();
            (table, count)
        })
        .collect()
}

pub fn table_count(db: &Path) -> usize {
    SqliteConnection::open(db).unwrap().list_tables().unwrap().len()
}

/// Local manager over a SQLite file inside `project`.
pub fn local_manager(project: &TempDir) -> (LocalManager, PathBuf) {
    let db = project.path().join("local.sqlite");
    let manager = LocalManager::with_connector(&path_str(project), SqliteConnector::new(db.clone()));
    (manager, db)
}

/// Dump files (`*.sql.gz`) directly inside `dir`.
pub fn dumps_in(dir: &Path) -> Vec<PathBuf> {
    let mut dumps: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|p| p.to_string_lossy().ends_with(".sql.gz"))
        .collect();
    dumps.sort();
    dumps
}

/// In-process stand-in for a deployed host.
///
/// The remote filesystem is the real local filesystem, and the remote MySQL
/// server is a SQLite file. The MySQL client pipelines the remote manager
/// builds are parsed and carried out against that file.
pub struct FakeRemote {
    pub project: TempDir,
    pub db: PathBuf,
    pub commands: Vec<String>,
    pub uploads: Vec<(PathBuf, String)>,
    pub downloads: Vec<(String, PathBuf)>,
    failures: Vec<(String, i32, String)>,
}

impl FakeRemote {
    pub fn new(db_name: &str) -> Self {
        let project = project_dir(db_name);
        let db = project.path().join("remote.sqlite");
        SqliteConnection::open(&db).unwrap();
        Self {
            project,
            db,
            commands: Vec::new(),
            uploads: Vec::new(),
            downloads: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn project_path(&self) -> String {
        path_str(&self.project)
    }

    /// Make every command starting with `program` exit with `status`.
    pub fn fail(&mut self, program: &str, status: i32, stderr: &str) {
        self.failures
            .push((program.to_string(), status, stderr.to_string()));
    }

    pub fn ran(&self, program: &str) -> bool {
        self.commands.iter().any(|c| c.starts_with(program))
    }

    fn run(&mut self, command: &str) -> Result<String, String> {
        let words = shell_words::split(command).map_err(|e| e.to_string())?;
        match words.as_slice() {
            [cat, path] if cat == "cat" => fs::read_to_string(path)
                .map_err(|e| format!("cat: {path}: {e}")),
            [first, ..] if first == "mysqldump" => {
                let target = words
                    .iter()
                    .position(|w| w == ">")
                    .and_then(|i| words.get(i + 1))
                    .ok_or("no dump target")?;
                let file = File::create(target).map_err(|e| e.to_string())?;
                let mut out = GzEncoder::new(BufWriter::new(file), Compression::default());
                let mut conn = SqliteConnection::open(&self.db).map_err(|e| e.to_string())?;
                write_dump(&mut conn, "remote", &mut out).map_err(|e| e.to_string())?;
                out.finish()
                    .and_then(|mut w| w.flush())
                    .map_err(|e| e.to_string())?;
                Ok(String::new())
            }
            [cat, source, ..] if cat == "cat" && words.iter().any(|w| w == "mysql") => {
                let file = File::open(source).map_err(|e| e.to_string())?;
                let mut conn = SqliteConnection::open(&self.db).map_err(|e| e.to_string())?;
                for statement in StatementReader::new(BufReader::new(GzDecoder::new(file))) {
                    let statement = statement.map_err(|e| e.to_string())?;
                    conn.execute(&statement).map_err(|e| e.to_string())?;
                }
                Ok(String::new())
            }
            [first, ..] if first == "mysqladmin" && words.iter().any(|w| w == "drop") => {
                fs::remove_file(&self.db).map_err(|e| e.to_string())?;
                Ok(String::new())
            }
            [first, ..] if first == "mysqladmin" && words.iter().any(|w| w == "create") => {
                SqliteConnection::open(&self.db).map_err(|e| e.to_string())?;
                Ok(String::new())
            }
            _ => Err(format!("sh: unsupported command: {command}")),
        }
    }
}

impl Transport for FakeRemote {
    fn exec(&mut self, command: &str) -> Result<String, TransportError> {
        self.commands.push(command.to_string());
        if let Some((_, status, stderr)) = self
            .failures
            .iter()
            .find(|(program, _, _)| command.starts_with(program.as_str()))
        {
            return Err(TransportError::RemoteCommand {
                exit_status: *status,
                stderr: stderr.clone(),
            });
        }
        self.run(command)
            .map(|out| out.trim().to_string())
            .map_err(|stderr| TransportError::RemoteCommand {
                exit_status: 1,
                stderr,
            })
    }

    fn get_file(&mut self, remote: &str, local: &Path) -> Result<(), TransportError> {
        fs::copy(remote, local).map_err(|e| TransportError::Transfer {
            from: remote.to_string(),
            to: local.display().to_string(),
            reason: e.to_string(),
        })?;
        self.downloads.push((remote.to_string(), local.to_path_buf()));
        Ok(())
    }

    fn put_file(&mut self, local: &Path, remote: &str) -> Result<(), TransportError> {
        fs::copy(local, remote).map_err(|e| TransportError::Transfer {
            from: local.display().to_string(),
            to: remote.to_string(),
            reason: e.to_string(),
        })?;
        self.uploads.push((local.to_path_buf(), remote.to_string()));
        Ok(())
    }

    fn host(&self) -> &str {
        "fake.example.org"
    }
}
