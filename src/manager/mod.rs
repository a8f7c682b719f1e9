//! Database managers.
//!
//! A manager owns one side of a sync: the local project, reached through a
//! direct database connection ([`LocalManager`]), or the remote deployment,
//! reached through shell commands on a [`Transport`](crate::transport::Transport)
//! ([`RemoteManager`]). Both expose the shared [`Manager`] contract so the
//! workflows can name dump artifacts without caring which side they are on.

pub mod local;
pub mod remote;

use thiserror::Error;

use crate::archiver::ArchiveError;
use crate::credentials::CredentialsError;
use crate::db::DbError;
use crate::transport::TransportError;

pub use local::LocalManager;
pub use remote::RemoteManager;

/// Timestamp embedded in dump filenames.
pub const DUMP_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M";

/// Extension of every dump artifact.
pub const DUMP_EXTENSION: &str = ".sql.gz";

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error(transparent)]
    Credentials(#[from] CredentialsError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Unable to dump database to {pathname}: {reason}")]
    Dump { pathname: String, reason: String },

    #[error("Unable to import dump {pathname}: {reason}")]
    Import { pathname: String, reason: String },

    #[error("Unable to clear database: {0}")]
    Clear(String),

    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

/// Operations shared by local and remote managers.
///
/// Dump names are computed once per manager and cached, so every step of a
/// workflow refers to the same artifact even as the clock moves on.
pub trait Manager {
    /// Project root, normalized to end with a single `/` (empty when unset).
    fn project_path(&self) -> &str;

    /// `<dbName>_<YYYY-MM-DD_HH-MM>.sql.gz`
    fn dump_filename(&mut self) -> Result<String, ManagerError>;

    /// [`project_path`](Self::project_path) followed by the dump filename.
    fn dump_pathname(&mut self) -> Result<String, ManagerError>;
}

/// Normalize a project path to end with exactly one `/`.
pub fn normalize_project_path(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }
    format!("{}/", path.trim_end_matches('/'))
}

/// Lazily computed, then fixed, dump artifact names.
#[derive(Debug, Clone, Default)]
pub struct DumpArtifact {
    filename: Option<String>,
    pathname: Option<String>,
}

impl DumpArtifact {
    pub fn filename(&mut self, db_name: &str) -> &str {
        self.filename.get_or_insert_with(|| {
            format!(
                "{}_{}{}",
                db_name,
                chrono::Local::now().format(DUMP_TIMESTAMP_FORMAT),
                DUMP_EXTENSION
            )
        })
    }

    pub fn pathname(&mut self, project_path: &str, db_name: &str) -> &str {
        let filename = self.filename(db_name).to_string();
        self.pathname
            .get_or_insert_with(|| format!("{project_path}{filename}"))
    }
}

/// Insert `suffix` before the dump extension: `a.sql.gz` -> `a_suffix.sql.gz`.
pub fn with_dump_suffix(pathname: &str, suffix: &str) -> String {
    match pathname.strip_suffix(DUMP_EXTENSION) {
        Some(stem) => format!("{stem}_{suffix}{DUMP_EXTENSION}"),
        None => format!("{pathname}_{suffix}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_paths_end_with_one_separator() {
        assert_eq!(normalize_project_path(""), "");
        assert_eq!(normalize_project_path("/var/www/app"), "/var/www/app/");
        assert_eq!(normalize_project_path("/var/www/app///"), "/var/www/app/");
        assert_eq!(normalize_project_path("/"), "/");
    }

    #[test]
    fn artifact_names_are_fixed_on_first_use() {
        let mut artifact = DumpArtifact::default();
        let first = artifact.filename("shop").to_string();
        assert!(first.starts_with("shop_"));
        assert!(first.ends_with(".sql.gz"));
        // "shop_" + "YYYY-MM-DD_HH-MM" + ".sql.gz"
        assert_eq!(first.len(), 5 + 16 + 7);

        assert_eq!(artifact.filename("other"), first);
        assert_eq!(artifact.pathname("/srv/", "other"), format!("/srv/{first}"));
        assert_eq!(artifact.pathname("/elsewhere/", "shop"), format!("/srv/{first}"));
    }

    #[test]
    fn suffix_goes_before_extension() {
        assert_eq!(
            with_dump_suffix("/srv/shop_2024-01-01_10-00.sql.gz", "local"),
            "/srv/shop_2024-01-01_10-00_local.sql.gz"
        );
        assert_eq!(with_dump_suffix("dump", "remote"), "dump_remote");
    }
}
