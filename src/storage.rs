//! Content storage for received files
//!
//! Files land in a per-recipient area, namespaced by sender so two
//! senders uploading the same filename never share a target:
//! `<root>/<recipient>/<sender>/<filename>`.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::error::AppError;

/// Reject names that could escape the recipient's area
pub fn validate_filename(filename: &str) -> Result<(), AppError> {
    if filename.is_empty()
        || filename == "."
        || filename.contains('/')
        || filename.contains('\\')
        || filename.contains("..")
        || filename.contains('\0')
    {
        return Err(AppError::Invalid(format!("Invalid filename: {:?}", filename)));
    }
    Ok(())
}

/// Where received files are written
pub trait ContentStore: Send + Sync + std::fmt::Debug {
    /// Open a fresh, empty target for one transfer
    fn open(
        &self,
        recipient: &str,
        sender: &str,
        filename: &str,
    ) -> Result<Box<dyn ContentTarget>, AppError>;
}

/// Offset-addressed write target for one file
pub trait ContentTarget: Send + std::fmt::Debug {
    /// Write `data` starting at `offset`; gaps read back as zeros
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Make everything written so far durable
    fn finish(&mut self) -> io::Result<()>;
}

/// Filesystem-backed store
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path a transfer is written to
    pub fn path_for(&self, recipient: &str, sender: &str, filename: &str) -> Result<PathBuf, AppError> {
        for part in [recipient, sender, filename] {
            validate_filename(part)?;
        }
        Ok(self.root.join(recipient).join(sender).join(filename))
    }
}

impl ContentStore for DiskStore {
    fn open(
        &self,
        recipient: &str,
        sender: &str,
        filename: &str,
    ) -> Result<Box<dyn ContentTarget>, AppError> {
        let path = self.path_for(recipient, sender, filename)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(AppError::Storage)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(AppError::Storage)?;

        debug!(path = %path.display(), "Opened transfer target");
        Ok(Box::new(DiskTarget { file, path }))
    }
}

#[derive(Debug)]
struct DiskTarget {
    file: File,
    path: PathBuf,
}

impl ContentTarget for DiskTarget {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)
    }

    fn finish(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        debug!(path = %self.path.display(), "Transfer target flushed");
        Ok(())
    }
}

type Contents = Arc<Mutex<HashMap<(String, String, String), Vec<u8>>>>;

/// In-memory store, keyed by (recipient, sender, filename)
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    files: Contents,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes stored for one transfer
    pub fn contents(&self, recipient: &str, sender: &str, filename: &str) -> Option<Vec<u8>> {
        lock(&self.files)
            .get(&key(recipient, sender, filename))
            .cloned()
    }
}

impl ContentStore for MemoryStore {
    fn open(
        &self,
        recipient: &str,
        sender: &str,
        filename: &str,
    ) -> Result<Box<dyn ContentTarget>, AppError> {
        validate_filename(filename)?;
        let key = key(recipient, sender, filename);
        lock(&self.files).insert(key.clone(), Vec::new());
        Ok(Box::new(MemoryTarget {
            files: self.files.clone(),
            key,
        }))
    }
}

#[derive(Debug)]
struct MemoryTarget {
    files: Contents,
    key: (String, String, String),
}

impl ContentTarget for MemoryTarget {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset too large"))?;
        let end = start + data.len();

        let mut files = lock(&self.files);
        let buf = files.entry(self.key.clone()).or_default();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[start..end].copy_from_slice(data);
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn key(recipient: &str, sender: &str, filename: &str) -> (String, String, String) {
    (recipient.to_string(), sender.to_string(), filename.to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
