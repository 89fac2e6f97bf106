use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum FsError {
    #[error("invalid path: `{0}`")]
    InvalidPath(String),

    #[error("dots disallowed in path `{0}`")]
    DotsDisallowed(String),
}

/// Rejects non-unicode paths and paths containing `..` components.
pub fn validate_path(path: &Path) -> Result<(), FsError> {
    match path.to_str() {
        None => Err(FsError::InvalidPath(format!(
            "{} is not valid unicode",
            path.to_string_lossy()
        ))),
        Some(valid_path) => {
            if valid_path.contains("..") {
                Err(FsError::DotsDisallowed(valid_path.to_string()))
            } else {
                Ok(())
            }
        }
    }
}

pub fn get_file_permissions() -> Permissions {
    Permissions::from_mode(0o600)
}

pub fn get_directory_permissions() -> Permissions {
    Permissions::from_mode(0o700)
}

pub fn get_pid_file_permissions() -> Permissions {
    Permissions::from_mode(0o644)
}

pub fn get_runtime_directory_permissions() -> Permissions {
    Permissions::from_mode(0o755)
}
