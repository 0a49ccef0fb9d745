//! Sparse File Writer.
//!
//! Owns the destination file handle. Extends logical length to totalSize
//! without zero-fill and exposes a positioned write that many workers
//! call concurrently.

use crate::error::{EngineError, EngineResult};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

const TIER_FULL_PREALLOC: u64 = 8 * 1024 * 1024 * 1024;
const TIER_PARTIAL_PREALLOC: u64 = 32 * 1024 * 1024 * 1024;
const PARTIAL_PREALLOC_SIZE: u64 = 4 * 1024 * 1024 * 1024;

pub struct SparseWriter {
    file: Arc<Mutex<Option<File>>>,
    path: PathBuf,
}

impl SparseWriter {
    /// Create the destination file if absent and truncate its logical
    /// length to `total_size` in one operation. Tiered the same way the
    /// engine always has: small files get a full pre-allocation, large
    /// ones a partial allocation, and very large ones grow lazily.
    pub async fn open(path: &Path, total_size: u64) -> EngineResult<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(false)
            .open(path)
            .await?;

        if total_size > 0 {
            if total_size < TIER_FULL_PREALLOC {
                file.set_len(total_size).await?;
            } else if total_size < TIER_PARTIAL_PREALLOC {
                file.set_len(PARTIAL_PREALLOC_SIZE).await?;
            }
            // >= 32GB: lazy growth, file stays at whatever length it has.
        }

        Ok(Self {
            file: Arc::new(Mutex::new(Some(file))),
            path: path.to_path_buf(),
        })
    }

    /// Positioned write. Safe to call from many workers concurrently;
    /// each call is atomic with respect to the others because the
    /// seek+write pair is serialized through the shared file lock.
    /// Tolerates offsets beyond the file's current logical length —
    /// the OS extends the file on demand.
    pub async fn write_at(&self, offset: u64, bytes: &[u8]) -> EngineResult<()> {
        let mut guard = self.file.lock().await;
        let file = guard
            .as_mut()
            .ok_or_else(|| EngineError::StorageFailure(format!("write at {}: writer already closed", offset)))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| EngineError::StorageFailure(format!("seek to {}: {}", offset, e)))?;
        file.write_all(bytes)
            .await
            .map_err(|e| EngineError::StorageFailure(format!("write at {}: {}", offset, e)))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes and drops the underlying handle, releasing the file
    /// descriptor. Idempotent: closing an already-closed writer is a
    /// no-op.
    pub async fn close(&self) -> EngineResult<()> {
        let mut guard = self.file.lock().await;
        if let Some(mut file) = guard.take() {
            file.flush().await?;
            drop(file);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile_like::TempDir;

    // Minimal temp-dir helper so this module's tests don't need an extra
    // dev-dependency beyond what the rest of the crate already pulls in.
    mod tempfile_like {
        use std::path::PathBuf;

        pub struct TempDir(pub PathBuf);

        impl TempDir {
            pub fn new() -> Self {
                let mut p = std::env::temp_dir();
                p.push(format!("multiget-writer-test-{}", uuid::Uuid::new_v4()));
                std::fs::create_dir_all(&p).unwrap();
                Self(p)
            }

            pub fn child(&self, name: &str) -> PathBuf {
                self.0.join(name)
            }
        }

        impl Drop for TempDir {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }
    }

    #[tokio::test]
    async fn truncates_to_declared_length() {
        let dir = TempDir::new();
        let path = dir.child("out.bin");
        let writer = SparseWriter::open(&path, 1024).await.unwrap();
        let meta = tokio::fs::metadata(writer.path()).await.unwrap();
        assert_eq!(meta.len(), 1024);
    }

    #[tokio::test]
    async fn positioned_writes_land_at_correct_offsets() {
        let dir = TempDir::new();
        let path = dir.child("out.bin");
        let writer = SparseWriter::open(&path, 20).await.unwrap();
        writer.write_at(10, b"hello").await.unwrap();
        writer.write_at(0, b"world").await.unwrap();
        let contents = tokio::fs::read(&path).await.unwrap();
        assert_eq!(&contents[0..5], b"world");
        assert_eq!(&contents[10..15], b"hello");
    }

    #[tokio::test]
    async fn write_beyond_declared_length_extends_file() {
        let dir = TempDir::new();
        let path = dir.child("out.bin");
        let writer = SparseWriter::open(&path, 0).await.unwrap();
        writer.write_at(100, b"tail").await.unwrap();
        let meta = tokio::fs::metadata(&path).await.unwrap();
        assert!(meta.len() >= 104);
    }

    #[tokio::test]
    async fn close_releases_the_handle() {
        let dir = TempDir::new();
        let path = dir.child("out.bin");
        let writer = SparseWriter::open(&path, 20).await.unwrap();
        writer.close().await.unwrap();
        assert!(writer.write_at(0, b"late").await.is_err());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let dir = TempDir::new();
        let path = dir.child("out.bin");
        let writer = SparseWriter::open(&path, 20).await.unwrap();
        writer.close().await.unwrap();
        writer.close().await.unwrap();
    }
}
