//! Opening backends by path.

use crate::backend::StorageBackend;
use crate::error::StorageResult;
use crate::file::FileBackend;
use std::path::Path;

/// Opens the backends behind named files.
///
/// The journal asks a factory for every record and ack file it touches, so
/// tests can wrap the real files in a failing backend.
pub trait BackendFactory: Send + Sync {
    /// Creates a new, empty backend at `path`. Fails if one already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend exists or cannot be created.
    fn create(&self, path: &Path) -> StorageResult<Box<dyn StorageBackend>>;

    /// Opens the existing backend at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be opened.
    fn open(&self, path: &Path) -> StorageResult<Box<dyn StorageBackend>>;
}

/// Opens plain [`FileBackend`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileBackendFactory;

impl BackendFactory for FileBackendFactory {
    fn create(&self, path: &Path) -> StorageResult<Box<dyn StorageBackend>> {
        Ok(Box::new(FileBackend::create_new(path)?))
    }

    fn open(&self, path: &Path) -> StorageResult<Box<dyn StorageBackend>> {
        Ok(Box::new(FileBackend::open(path)?))
    }
}
