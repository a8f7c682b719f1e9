//! Pull, push and download workflows.
//!
//! Each workflow is a fixed sequence of manager operations run one after the
//! other. The first failing step aborts the run and is reported as
//! [`WorkflowError::Step`]; completed steps are never undone.
//!
//! ```no_run
//! use databaser::manager::{LocalManager, RemoteManager};
//! use databaser::transport::{SshAuth, SshTransport};
//! use databaser::workflow::SyncWorkflow;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = SshTransport::connect(
//!     "deploy",
//!     "example.org",
//!     22,
//!     &SshAuth::with_key("/home/me/.ssh/id_rsa"),
//!     Duration::from_secs(10),
//! )?;
//! let mut remote = RemoteManager::new(transport, "/var/www/shop");
//! let mut local = LocalManager::new("/home/me/shop");
//!
//! let report = SyncWorkflow::new(&mut local, &mut remote).pull(|p| println!("{}", p.message))?;
//! println!("{:?}", report.status);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use crate::archiver::Archiver;
use crate::manager::{
    DUMP_EXTENSION, LocalManager, Manager, ManagerError, RemoteManager, with_dump_suffix,
};
use crate::transport::Transport;

/// One blocking step of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStep {
    CheckLocal,
    DumpRemote,
    Download,
    DumpLocal,
    ClearLocal,
    ImportLocal,
    Upload,
    DropRemote,
    CreateRemote,
    ImportRemote,
    Extract,
}

impl fmt::Display for SyncStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::CheckLocal => "Checking local database",
            Self::DumpRemote => "Dumping remote database",
            Self::Download => "Downloading remote dump",
            Self::DumpLocal => "Dumping local database",
            Self::ClearLocal => "Clearing local database",
            Self::ImportLocal => "Importing dump into local database",
            Self::Upload => "Uploading local dump",
            Self::DropRemote => "Dropping remote database",
            Self::CreateRemote => "Creating remote database",
            Self::ImportRemote => "Importing dump into remote database",
            Self::Extract => "Extracting dump",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    Pull,
    Push,
    Download,
}

/// How a workflow ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Completed,
    /// Push found nothing to send.
    SkippedEmptyLocal,
    /// The operator refused the destructive step.
    Declined,
}

/// Progress update emitted when a step starts.
#[derive(Debug, Clone, Serialize)]
pub struct SyncProgress {
    pub step: SyncStep,
    pub message: String,
    /// Elapsed time since the workflow started.
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step: SyncStep,
    pub duration_ms: u64,
}

/// Summary of a finished workflow, printable as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowReport {
    pub workflow: WorkflowKind,
    pub status: WorkflowStatus,
    pub steps: Vec<StepRecord>,
    /// Dump written on the remote host.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_dump: Option<String>,
    /// Dump written on the local machine.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_dump: Option<String>,
    /// Copy of a dump on the other side of the transport.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transferred: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted: Option<String>,
    pub duration_ms: u64,
}

impl WorkflowReport {
    pub fn performed(&self) -> Vec<SyncStep> {
        self.steps.iter().map(|record| record.step).collect()
    }
}

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("{step} failed: {source}")]
    Step { step: SyncStep, source: ManagerError },

    #[error("Unable to read confirmation: {0}")]
    Confirmation(#[source] io::Error),
}

impl WorkflowError {
    pub fn step(&self) -> Option<SyncStep> {
        match self {
            Self::Step { step, .. } => Some(*step),
            Self::Confirmation(_) => None,
        }
    }
}

/// Asks the operator before a destructive step.
pub trait Confirmation {
    fn confirm(&mut self, question: &str) -> io::Result<bool>;
}

impl<F> Confirmation for F
where
    F: FnMut(&str) -> io::Result<bool>,
{
    fn confirm(&mut self, question: &str) -> io::Result<bool> {
        self(question)
    }
}

/// Step bookkeeping shared by every workflow.
struct Run<'p, F> {
    report: WorkflowReport,
    start: Instant,
    on_progress: &'p F,
}

impl<'p, F: Fn(SyncProgress)> Run<'p, F> {
    fn new(workflow: WorkflowKind, on_progress: &'p F) -> Self {
        tracing::info!(workflow = ?workflow, "workflow started");
        Self {
            report: WorkflowReport {
                workflow,
                status: WorkflowStatus::Completed,
                steps: Vec::new(),
                remote_dump: None,
                local_dump: None,
                transferred: None,
                extracted: None,
                duration_ms: 0,
            },
            start: Instant::now(),
            on_progress,
        }
    }

    fn step<R>(
        &mut self,
        step: SyncStep,
        op: impl FnOnce() -> Result<R, ManagerError>,
    ) -> Result<R, WorkflowError> {
        (self.on_progress)(SyncProgress {
            step,
            message: step.to_string(),
            elapsed: self.start.elapsed(),
        });
        let started = Instant::now();

        match op() {
            Ok(value) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                tracing::info!(step = %step, duration_ms, "step finished");
                self.report.steps.push(StepRecord { step, duration_ms });
                Ok(value)
            }
            Err(source) => {
                tracing::warn!(step = %step, error = %source, "step failed, aborting workflow");
                Err(WorkflowError::Step { step, source })
            }
        }
    }

    fn finish(mut self, status: WorkflowStatus) -> WorkflowReport {
        self.report.status = status;
        self.report.duration_ms = self.start.elapsed().as_millis() as u64;
        tracing::info!(
            workflow = ?self.report.workflow,
            status = ?status,
            duration_ms = self.report.duration_ms,
            "workflow finished"
        );
        self.report
    }
}

/// Pull and push between one local project and one remote deployment.
pub struct SyncWorkflow<'a, T: Transport> {
    local: &'a mut LocalManager,
    remote: &'a mut RemoteManager<T>,
}

impl<'a, T: Transport> SyncWorkflow<'a, T> {
    pub fn new(local: &'a mut LocalManager, remote: &'a mut RemoteManager<T>) -> Self {
        Self { local, remote }
    }

    /// Replace the local database with a copy of the remote one.
    ///
    /// A non-empty local database is dumped as a backup and cleared before
    /// the import.
    pub fn pull<F: Fn(SyncProgress)>(&mut self, on_progress: F) -> Result<WorkflowReport, WorkflowError> {
        let mut run = Run::new(WorkflowKind::Pull, &on_progress);
        let local = &mut *self.local;
        let remote = &mut *self.remote;

        // Local credentials resolve here, before anything touches the remote.
        let local_is_empty = run.step(SyncStep::CheckLocal, || {
            local.dump_pathname()?;
            local.database_is_empty()
        })?;

        run.report.remote_dump = Some(run.step(SyncStep::DumpRemote, || {
            remote.dump_database()?;
            remote.dump_pathname()
        })?);

        let downloaded = run.step(SyncStep::Download, || {
            let mut target = format!("{}{}", local.project_path(), remote.dump_filename()?);
            if target == local.dump_pathname()? {
                target = with_dump_suffix(&target, "remote");
            }
            remote.download_dump(Path::new(&target))?;
            Ok(target)
        })?;
        run.report.transferred = Some(downloaded.clone());

        if local_is_empty {
            tracing::info!("local database is empty, no backup needed");
        } else {
            run.report.local_dump = Some(run.step(SyncStep::DumpLocal, || {
                local.dump_database()?;
                local.dump_pathname()
            })?);
            run.step(SyncStep::ClearLocal, || local.clear_database())?;
        }

        run.step(SyncStep::ImportLocal, || local.import_dump(Path::new(&downloaded)))?;
        Ok(run.finish(WorkflowStatus::Completed))
    }

    /// Replace the remote database with a copy of the local one.
    ///
    /// Nothing happens when the local database is empty. The remote database
    /// is backed up, then dropped only once `confirmation` agrees.
    pub fn push<C, F>(&mut self, confirmation: &mut C, on_progress: F) -> Result<WorkflowReport, WorkflowError>
    where
        C: Confirmation + ?Sized,
        F: Fn(SyncProgress),
    {
        let mut run = Run::new(WorkflowKind::Push, &on_progress);
        let local = &mut *self.local;
        let remote = &mut *self.remote;

        if run.step(SyncStep::CheckLocal, || local.database_is_empty())? {
            tracing::warn!("local database is empty, nothing to push");
            return Ok(run.finish(WorkflowStatus::SkippedEmptyLocal));
        }

        let local_dump = run.step(SyncStep::DumpLocal, || {
            local.dump_database()?;
            local.dump_pathname()
        })?;
        run.report.local_dump = Some(local_dump.clone());

        let uploaded = run.step(SyncStep::Upload, || {
            let mut target = format!("{}{}", remote.project_path(), local.dump_filename()?);
            if target == remote.dump_pathname()? {
                target = with_dump_suffix(&target, "local");
            }
            remote.upload(Path::new(&local_dump), &target)?;
            Ok(target)
        })?;
        run.report.transferred = Some(uploaded.clone());

        let (remote_dump, db_name) = run.step(SyncStep::DumpRemote, || {
            remote.dump_database()?;
            let db_name = remote.credentials()?.db_name().to_string();
            Ok((remote.dump_pathname()?, db_name))
        })?;
        run.report.remote_dump = Some(remote_dump);

        let question = format!(
            "Drop database \"{db_name}\" on {} and replace it with the local dump?",
            remote.transport().host()
        );
        if !confirmation
            .confirm(&question)
            .map_err(WorkflowError::Confirmation)?
        {
            tracing::info!(db_name = %db_name, "remote drop declined, leaving remote database untouched");
            return Ok(run.finish(WorkflowStatus::Declined));
        }

        run.step(SyncStep::DropRemote, || remote.drop_database())?;
        run.step(SyncStep::CreateRemote, || remote.create_database())?;
        run.step(SyncStep::ImportRemote, || remote.import_dump(&uploaded))?;
        Ok(run.finish(WorkflowStatus::Completed))
    }
}

/// Dump the remote database, download the archive into `target_dir` and
/// extract it next to the archive as plain SQL.
pub fn download<T, F>(
    remote: &mut RemoteManager<T>,
    target_dir: &Path,
    archiver: &dyn Archiver,
    on_progress: F,
) -> Result<WorkflowReport, WorkflowError>
where
    T: Transport,
    F: Fn(SyncProgress),
{
    let mut run = Run::new(WorkflowKind::Download, &on_progress);

    run.report.remote_dump = Some(run.step(SyncStep::DumpRemote, || {
        remote.dump_database()?;
        remote.dump_pathname()
    })?);

    let archive = run.step(SyncStep::Download, || {
        let archive = target_dir.join(remote.dump_filename()?);
        remote.download_dump(&archive)?;
        Ok(archive)
    })?;
    run.report.transferred = Some(archive.display().to_string());

    let extracted = run.step(SyncStep::Extract, || {
        let archive_name = archive.to_string_lossy();
        let sql_name = archive_name
            .strip_suffix(".gz")
            .filter(|_| archive_name.ends_with(DUMP_EXTENSION))
            .map(str::to_string)
            .unwrap_or_else(|| format!("{archive_name}.sql"));
        archiver.extract(&archive, Path::new(&sql_name))?;
        Ok(sql_name)
    })?;
    run.report.extracted = Some(extracted);

    Ok(run.finish(WorkflowStatus::Completed))
}
