//! Secure key-value storage abstraction (§ external interfaces).
//!
//! A host app backs this with its platform keychain; this crate ships two
//! reference implementations so the core is runnable standalone: an
//! in-memory store for tests and a file-backed store for the demo binary.

use crate::error::StorageError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::fs;

#[async_trait]
pub trait Keystore: Send + Sync {
    async fn read(&self, tag: &str) -> Result<Option<Vec<u8>>, StorageError>;
    async fn write(&self, tag: &str, bytes: Vec<u8>) -> Result<(), StorageError>;
    async fn delete(&self, tag: &str) -> Result<(), StorageError>;
}

#[derive(Default)]
pub struct MemoryKeystore {
    inner: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKeystore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Keystore for MemoryKeystore {
    async fn read(&self, tag: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.inner.lock().unwrap().get(tag).cloned())
    }

    async fn write(&self, tag: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        self.inner.lock().unwrap().insert(tag.to_string(), bytes);
        Ok(())
    }

    async fn delete(&self, tag: &str) -> Result<(), StorageError> {
        self.inner.lock().unwrap().remove(tag);
        Ok(())
    }
}

/// Persists each tag as a separate file under `base_dir`. Tags are hashed
/// into filenames so arbitrary tag strings never escape the directory.
pub struct FileKeystore {
    base_dir: PathBuf,
}

impl FileKeystore {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    fn path_for(&self, tag: &str) -> PathBuf {
        use blake2::Digest;
        let digest = hex::encode(blake2::Blake2s256::digest(tag.as_bytes()));
        self.base_dir.join(format!("{digest}.key"))
    }
}

#[async_trait]
impl Keystore for FileKeystore {
    async fn read(&self, tag: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(self.path_for(tag)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn write(&self, tag: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        fs::create_dir_all(&self.base_dir).await?;
        fs::write(self.path_for(tag), bytes).await?;
        Ok(())
    }

    async fn delete(&self, tag: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path_for(tag)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}
