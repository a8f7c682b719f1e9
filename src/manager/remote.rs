//! Manager for the database of a remote deployment.
//!
//! Every operation is a shell pipeline run through a [`Transport`]. Credential
//! values are single-quoted inside the client argument list; database names
//! and paths are shell-escaped separately.

use std::path::Path;
use std::time::Instant;

use super::local::PARAMETERS_FILE;
use super::{DumpArtifact, Manager, ManagerError, normalize_project_path};
use crate::credentials::{self, ConfigFormat, ConnectionDescriptor, CredentialsError};
use crate::transport::{Transport, TransportError};

/// Remote side of a sync, driven over one transport session.
pub struct RemoteManager<T: Transport> {
    transport: T,
    project_path: String,
    credentials: Option<ConnectionDescriptor>,
    artifact: DumpArtifact,
}

impl<T: Transport> RemoteManager<T> {
    pub fn new(transport: T, project_path: &str) -> Self {
        Self {
            transport,
            project_path: normalize_project_path(project_path),
            credentials: None,
            artifact: DumpArtifact::default(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Credentials read from the remote `app/config/parameters.yml`.
    ///
    /// Only the structured parameters format is supported on this side.
    pub fn credentials(&mut self) -> Result<&ConnectionDescriptor, ManagerError> {
        let resolved = match self.credentials.take() {
            Some(resolved) => resolved,
            None => self.fetch_credentials()?,
        };
        Ok(self.credentials.insert(resolved))
    }

    fn fetch_credentials(&mut self) -> Result<ConnectionDescriptor, ManagerError> {
        let pathname = format!("{}{}", self.project_path, PARAMETERS_FILE);
        let raw = match self.transport.exec(&format!("cat {}", shell_words::quote(&pathname))) {
            Ok(raw) => raw,
            Err(TransportError::RemoteCommand { exit_status, stderr }) => {
                tracing::debug!(
                    host = %self.transport.host(),
                    pathname = %pathname,
                    exit_status,
                    stderr = %stderr.trim(),
                    "unable to read remote parameters file"
                );
                return Err(CredentialsError::ConfigNotFound {
                    searched: vec![pathname.into()],
                }
                .into());
            }
            Err(e) => return Err(e.into()),
        };

        let resolved = credentials::resolve(raw.as_bytes(), ConfigFormat::Parameters)?;
        tracing::debug!(
            host = %self.transport.host(),
            dsn = %resolved.to_dsn(),
            "resolved remote credentials"
        );
        Ok(resolved)
    }

    pub fn create_database(&mut self) -> Result<(), ManagerError> {
        let creds = self.credentials()?.clone();
        self.run(
            "create database",
            create_command(&creds.client_args(), creds.db_name()),
            create_command(&creds.redacted_client_args(), creds.db_name()),
        )
    }

    /// Drop the database. The `--force` flag keeps mysqladmin from prompting.
    pub fn drop_database(&mut self) -> Result<(), ManagerError> {
        let creds = self.credentials()?.clone();
        self.run(
            "drop database",
            drop_command(&creds.client_args(), creds.db_name()),
            drop_command(&creds.redacted_client_args(), creds.db_name()),
        )
    }

    /// Dump the database, gzip-compressed, to
    /// [`dump_pathname`](Manager::dump_pathname) on the remote host.
    pub fn dump_database(&mut self) -> Result<(), ManagerError> {
        let pathname = self.dump_pathname()?;
        let creds = self.credentials()?.clone();
        self.run(
            "dump database",
            dump_command(&creds.client_args(), creds.db_name(), &pathname),
            dump_command(&creds.redacted_client_args(), creds.db_name(), &pathname),
        )
    }

    /// Copy the remote dump to `local_pathname`.
    pub fn download_dump(&mut self, local_pathname: &Path) -> Result<(), ManagerError> {
        let pathname = self.dump_pathname()?;
        let start = Instant::now();
        self.transport.get_file(&pathname, local_pathname)?;
        tracing::info!(
            host = %self.transport.host(),
            from = %pathname,
            to = %local_pathname.display(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "downloaded remote dump"
        );
        Ok(())
    }

    /// Replay a gzip-compressed dump that already sits on the remote host.
    pub fn import_dump(&mut self, pathname: &str) -> Result<(), ManagerError> {
        let creds = self.credentials()?.clone();
        self.run(
            "import dump",
            import_command(&creds.client_args(), creds.db_name(), pathname),
            import_command(&creds.redacted_client_args(), creds.db_name(), pathname),
        )
    }

    pub fn upload(&mut self, local_pathname: &Path, remote_pathname: &str) -> Result<(), ManagerError> {
        let start = Instant::now();
        self.transport.put_file(local_pathname, remote_pathname)?;
        tracing::info!(
            host = %self.transport.host(),
            from = %local_pathname.display(),
            to = %remote_pathname,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "uploaded file"
        );
        Ok(())
    }

    fn run(&mut self, action: &str, command: String, redacted: String) -> Result<(), ManagerError> {
        let start = Instant::now();
        tracing::debug!(host = %self.transport.host(), command = %redacted, "running remote command");
        self.transport.exec(&command)?;
        tracing::info!(
            host = %self.transport.host(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "remote {action} finished"
        );
        Ok(())
    }
}

impl<T: Transport> Manager for RemoteManager<T> {
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

fn shell_line(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
}

/// `mysqldump <args> <db> | gzip -c > <path>`
pub fn dump_command(client_args: &str, db_name: &str, pathname: &str) -> String {
    shell_line(&[
        "mysqldump",
        client_args,
        &*shell_words::quote(db_name),
        "| gzip -c >",
        &*shell_words::quote(pathname),
    ])
}

/// `cat <path> | gunzip | mysql <args> <db>`
pub fn import_command(client_args: &str, db_name: &str, pathname: &str) -> String {
    shell_line(&[
        "cat",
        &*shell_words::quote(pathname),
        "| gunzip | mysql",
        client_args,
        &*shell_words::quote(db_name),
    ])
}

/// `mysqladmin <args> create <db>`
pub fn create_command(client_args: &str, db_name: &str) -> String {
    shell_line(&["mysqladmin", client_args, "create", &*shell_words::quote(db_name)])
}

/// `mysqladmin <args> drop <db> --force`
pub fn drop_command(client_args: &str, db_name: &str) -> String {
    shell_line(&[
        "mysqladmin",
        client_args,
        "drop",
        &*shell_words::quote(db_name),
        "--force",
    ])
}
