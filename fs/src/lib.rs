pub mod directory_manager;
pub mod file;
pub mod utils;

/// Stateless handle implementing the file traits against the local filesystem.
#[derive(Clone, Default)]
pub struct LocalFile;

#[cfg(feature = "mocks")]
pub mod mock {
    use std::io;
    use std::path::Path;

    use super::file::deleter::FileDeleter;
    use super::file::reader::FileReader;
    use super::file::writer::{FileWriter, WriteError};
    use mockall::mock;

    mock! {
        pub LocalFile {}

        impl FileReader for LocalFile {
            fn read(&self, file_path: &Path) -> io::Result<String>;
            fn entry_count(&self, dir_path: &Path) -> io::Result<usize>;
        }

        impl FileWriter for LocalFile {
            fn write(&self, path: &Path, buf: String) -> Result<(), WriteError>;
            fn write_with_mode(&self, path: &Path, buf: String, mode: u32) -> Result<(), WriteError>;
        }

        impl FileDeleter for LocalFile {
            fn delete(&self, file_path: &Path) -> io::Result<()>;
        }
    }
}
