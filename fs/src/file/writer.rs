use super::super::utils::{validate_path, FsError};
use super::super::LocalFile;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::{fs, io};
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("error creating file: {0}")]
    ErrorCreatingFile(#[from] io::Error),

    #[error("invalid path: {0}")]
    InvalidPath(#[from] FsError),
}

pub trait FileWriter {
    /// Write a file with the default (0600) mode, truncating any previous
    /// contents.
    fn write(&self, path: &Path, buf: String) -> Result<(), WriteError>;

    /// Write a file with an explicit mode.
    fn write_with_mode(&self, path: &Path, buf: String, mode: u32) -> Result<(), WriteError>;
}

impl FileWriter for LocalFile {
    #[instrument(skip_all, fields(path = %path.display()))]
    fn write(&self, path: &Path, content: String) -> Result<(), WriteError> {
        use std::os::unix::fs::PermissionsExt;
        self.write_with_mode(
            path,
            content,
            super::super::utils::get_file_permissions().mode(),
        )
    }

    fn write_with_mode(&self, path: &Path, content: String, mode: u32) -> Result<(), WriteError> {
        validate_path(path)?;

        let mut file_options = fs::OpenOptions::new();
        file_options
            .create(true)
            .write(true)
            .truncate(true)
            .mode(mode);

        file_options.open(path)?.write_all(content.as_bytes())?;
        Ok(())
    }
}
