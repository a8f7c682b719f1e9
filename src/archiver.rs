//! Dump archive extraction.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Unable to read archive file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("Unable to write target file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

/// Decompresses a single archive into a target file.
pub trait Archiver {
    fn extract(&self, source: &Path, target: &Path) -> Result<(), ArchiveError>;
}

/// gzip archives (`.gz`), the format every dump artifact is written in.
///
/// Concatenated gzip members are extracted one after another.
#[derive(Debug, Clone, Copy)]
pub struct GzipArchiver {
    buffer_size: usize,
}

impl GzipArchiver {
    pub fn new() -> Self {
        Self::with_buffer_size(64 * 1024)
    }

    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self { buffer_size }
    }
}

impl Default for GzipArchiver {
    fn default() -> Self {
        Self::new()
    }
}

impl Archiver for GzipArchiver {
    fn extract(&self, source: &Path, target: &Path) -> Result<(), ArchiveError> {
        let read_err = |source_err| ArchiveError::Read {
            path: source.to_path_buf(),
            source: source_err,
        };
        let write_err = |source_err| ArchiveError::Write {
            path: target.to_path_buf(),
            source: source_err,
        };

        let input = File::open(source).map_err(read_err)?;
        let mut decoder = MultiGzDecoder::new(BufReader::with_capacity(self.buffer_size, input));
        let output = File::create(target).map_err(write_err)?;
        let mut writer = BufWriter::with_capacity(self.buffer_size, output);

        let mut chunk = vec![0u8; self.buffer_size.max(1)];
        loop {
            let read = match io::Read::read(&mut decoder, &mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(read_err(e)),
            };
            writer.write_all(&chunk[..read]).map_err(write_err)?;
        }
        writer.flush().map_err(write_err)?;

        tracing::debug!(
            source = %source.display(),
            target = %target.display(),
            "extracted gzip archive"
        );
        Ok(())
    }
}
