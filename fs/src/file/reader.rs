use super::super::LocalFile;
use std::io;
use std::path::Path;

pub trait FileReader {
    /// Read the contents of `file_path` as UTF-8 text.
    fn read(&self, file_path: &Path) -> io::Result<String>;

    /// Count the entries of a directory without materializing their paths.
    /// Used for things like `/proc/<pid>/fd`, where only the count matters
    /// and the entries may vanish mid-listing.
    fn entry_count(&self, dir_path: &Path) -> io::Result<usize>;
}

impl FileReader for LocalFile {
    fn read(&self, file_path: &Path) -> io::Result<String> {
        if !file_path.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("file not found or not a file: {}", file_path.display()),
            ));
        }

        std::fs::read_to_string(file_path).map_err(|err| {
            io::Error::new(err.kind(), format!("{}: {err}", file_path.display()))
        })
    }

    fn entry_count(&self, dir_path: &Path) -> io::Result<usize> {
        if !dir_path.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!(
                    "directory not found or not a directory: {}",
                    dir_path.display()
                ),
            ));
        }
        // entries that disappear while the directory is being walked (file
        // descriptors close all the time) are skipped, not errors
        Ok(std::fs::read_dir(dir_path)?
            .filter(|entry| entry.is_ok())
            .count())
    }
}
