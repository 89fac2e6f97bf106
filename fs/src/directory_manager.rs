use super::utils::validate_path;
use std::fs::{remove_dir_all, DirBuilder};
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum DirectoryManagementError {
    #[error("invalid path: {0}")]
    InvalidPath(#[from] super::utils::FsError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub trait DirectoryManager {
    /// Recursively create a directory with the default (0700) mode.
    fn create(&self, path: &Path) -> Result<(), DirectoryManagementError>;

    /// Recursively create a directory with an explicit mode.
    fn create_with_mode(&self, path: &Path, mode: u32) -> Result<(), DirectoryManagementError>;

    /// Delete the directory and its contents. A missing directory is not an
    /// error.
    fn delete(&self, path: &Path) -> Result<(), DirectoryManagementError>;
}

#[derive(Clone, Default)]
pub struct DirectoryManagerFs;

impl DirectoryManager for DirectoryManagerFs {
    fn create(&self, path: &Path) -> Result<(), DirectoryManagementError> {
        self.create_with_mode(
            path,
            super::utils::get_directory_permissions().mode(),
        )
    }

    fn create_with_mode(&self, path: &Path, mode: u32) -> Result<(), DirectoryManagementError> {
        validate_path(path)?;
        let mut directory_builder = DirBuilder::new();
        directory_builder.recursive(true).mode(mode);
        directory_builder.create(path)?;
        Ok(())
    }

    #[instrument(skip_all, fields(path = %path.display()))]
    fn delete(&self, path: &Path) -> Result<(), DirectoryManagementError> {
        validate_path(path)?;

        if !path.exists() {
            return Ok(());
        }
        Ok(remove_dir_all(path)?)
    }
}

#[cfg(feature = "mocks")]
pub mod mock {
    use super::*;
    use mockall::{mock, predicate};
    use std::path::PathBuf;

    mock! {
        pub DirectoryManager {}

        impl DirectoryManager for DirectoryManager {
            fn create(&self, path: &Path) -> Result<(), DirectoryManagementError>;
            fn create_with_mode(&self, path: &Path, mode: u32) -> Result<(), DirectoryManagementError>;
            fn delete(&self, path: &Path) -> Result<(), DirectoryManagementError>;
        }
        impl Clone for DirectoryManager {
            fn clone(&self) -> Self;
        }
    }

    impl MockDirectoryManager {
        pub fn should_create(&mut self, path: &Path) {
            let expected = PathBuf::from(path);
            self.expect_create()
                .with(predicate::eq(expected))
                .once()
                .returning(|_| Ok(()));
        }

        pub fn should_delete(&mut self, path: &Path) {
            let expected = PathBuf::from(path);
            self.expect_delete()
                .with(predicate::eq(expected))
                .once()
                .returning(|_| Ok(()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;

    #[test]
    fn create_and_delete_directory() {
        let base = tempfile::tempdir().unwrap();
        let target = base.path().join("nested/dir");

        let manager = DirectoryManagerFs;
        manager.create(&target).unwrap();
        assert!(target.is_dir());

        manager.delete(&target).unwrap();
        assert!(!target.exists());
        // deleting again is not an error
        manager.delete(&target).unwrap();
    }

    #[test]
    fn create_with_mode_applies_permissions() {
        let base = tempfile::tempdir().unwrap();
        let target = base.path().join("runtime");

        DirectoryManagerFs
            .create_with_mode(&target, 0o755)
            .unwrap();

        let mode = target.metadata().unwrap().mode() & 0o777;
        assert_eq!(mode, 0o755);
    }
}
