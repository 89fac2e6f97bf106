use super::super::LocalFile;
use std::io;
use std::path::Path;

pub trait FileDeleter {
    /// Delete a file. A missing file is not an error.
    fn delete(&self, file_path: &Path) -> io::Result<()>;
}

impl FileDeleter for LocalFile {
    fn delete(&self, file_path: &Path) -> io::Result<()> {
        if !file_path.exists() {
            return Ok(());
        }
        std::fs::remove_file(file_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe");
        std::fs::write(&path, "x").unwrap();

        LocalFile.delete(&path).unwrap();
        assert!(!path.exists());
        LocalFile.delete(&path).unwrap();
    }
}
