//! Remote command execution and file transfer.
//!
//! The [`Transport`] trait is the only way the remote manager reaches the
//! deployed host. A single implementation instance wraps one authenticated
//! session and is reused for every command and copy of a workflow run.
//!
//! # Escaping
//!
//! Transports execute command strings as given. Callers must shell-escape
//! every interpolated value (database names, paths, credential fragments)
//! before handing a command over.

pub mod ssh;

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub use ssh::SshTransport;

/// Errors raised by a transport session.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Unable to connect to {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        source: io::Error,
    },

    #[error("SSH handshake with {host} failed: {reason}")]
    Handshake { host: String, reason: String },

    #[error("Unable to login at host \"{host}\" as user \"{user}\": {reason}")]
    Authentication {
        user: String,
        host: String,
        reason: String,
    },

    #[error("Remote command exited with status {exit_status}: {stderr}")]
    RemoteCommand { exit_status: i32, stderr: String },

    #[error("Transfer {from} -> {to} failed: {reason}")]
    Transfer {
        from: String,
        to: String,
        reason: String,
    },

    #[error("SSH channel error: {0}")]
    Channel(String),
}

impl TransportError {
    pub(crate) fn transfer(from: impl Into<String>, to: impl Into<String>, reason: impl ToString) -> Self {
        Self::Transfer {
            from: from.into(),
            to: to.into(),
            reason: reason.to_string(),
        }
    }
}

/// Authentication material for a transport session.
#[derive(Debug, Clone, Default)]
pub struct SshAuth {
    /// Private key file. Tried first when it exists.
    pub private_key: Option<PathBuf>,
    /// Interactive secret: the key passphrase when a key is used, otherwise
    /// the account password.
    pub secret: Option<String>,
}

impl SshAuth {
    pub fn with_key(path: impl Into<PathBuf>) -> Self {
        Self {
            private_key: Some(path.into()),
            secret: None,
        }
    }

    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// The private key, if one was given and exists on disk.
    pub fn usable_key(&self) -> Option<&Path> {
        self.private_key.as_deref().filter(|p| p.is_file())
    }
}

/// Run commands and move files on a remote host.
pub trait Transport {
    /// Run `command` through the remote shell and return its trimmed stdout.
    ///
    /// Fails with [`TransportError::RemoteCommand`] when the exit status is
    /// non-zero; stderr is attached as captured.
    fn exec(&mut self, command: &str) -> Result<String, TransportError>;

    /// Copy a remote file to the local filesystem.
    fn get_file(&mut self, remote_pathname: &str, local_pathname: &Path)
    -> Result<(), TransportError>;

    /// Copy a local file to the remote host.
    fn put_file(&mut self, local_pathname: &Path, remote_pathname: &str)
    -> Result<(), TransportError>;

    /// Host the session is connected to, for messages.
    fn host(&self) -> &str;
}

/// Turn a finished command's status and streams into the `exec` contract.
pub fn command_result(exit_status: i32, stdout: &str, stderr: &str) -> Result<String, TransportError> {
    if exit_status != 0 {
        return Err(TransportError::RemoteCommand {
            exit_status,
            stderr: stderr.to_string(),
        });
    }
    Ok(stdout.trim().to_string())
}
