//! In-memory blob store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::store::{BlobProperties, BlobStore, RequestOptions, StoreFuture};
use crate::{BlobUri, StoreError, checksum_bytes};

/// Counters of calls served, by operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStoreStats {
    pub properties: usize,
    pub reads: usize,
    pub blocks_staged: usize,
    pub commits: usize,
    pub whole_puts: usize,
}

/// Blob store that keeps committed blobs and staged blocks in memory.
///
/// Keys are the URI path, so two URIs differing only in query string address
/// the same blob.
#[derive(Default)]
pub struct MemoryBlobStore {
    inner: Mutex<MemoryInner>,
    properties: AtomicUsize,
    reads: AtomicUsize,
    blocks_staged: AtomicUsize,
    commits: AtomicUsize,
    whole_puts: AtomicUsize,
}

#[derive(Default)]
struct MemoryInner {
    blobs: HashMap<String, Vec<u8>>,
    staged: HashMap<String, HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a committed blob.
    pub fn insert(&self, path: &str, data: Vec<u8>) {
        self.inner.lock().blobs.insert(path.to_string(), data);
    }

    /// Returns a copy of a committed blob.
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.inner.lock().blobs.get(path).cloned()
    }

    /// Number of staged, uncommitted blocks for `path`.
    pub fn staged_blocks(&self, path: &str) -> usize {
        self.inner.lock().staged.get(path).map_or(0, HashMap::len)
    }

    pub fn stats(&self) -> MemoryStoreStats {
        MemoryStoreStats {
            properties: self.properties.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            blocks_staged: self.blocks_staged.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            whole_puts: self.whole_puts.load(Ordering::Relaxed),
        }
    }

    fn length_of(&self, path: &str) -> Result<u64, StoreError> {
        self.inner
            .lock()
            .blobs
            .get(path)
            .map(|b| b.len() as u64)
            .ok_or_else(|| StoreError::http(404, format!("blob not found: {path}")))
    }

    fn copy_range(&self, path: &str, offset: u64, buf: &mut [u8]) -> Result<(), StoreError> {
        let inner = self.inner.lock();
        let blob = inner
            .blobs
            .get(path)
            .ok_or_else(|| StoreError::http(404, format!("blob not found: {path}")))?;
        let start = usize::try_from(offset)
            .map_err(|_| StoreError::http(416, "range start out of bounds"))?;
        let end = start
            .checked_add(buf.len())
            .filter(|end| *end <= blob.len())
            .ok_or_else(|| {
                StoreError::http(
                    416,
                    format!(
                        "range {start}+{} exceeds blob length {}",
                        buf.len(),
                        blob.len()
                    ),
                )
            })?;
        buf.copy_from_slice(&blob[start..end]);
        Ok(())
    }

    fn stage(
        &self,
        path: &str,
        block_id: &str,
        data: &[u8],
        checksum: Option<&str>,
    ) -> Result<(), StoreError> {
        if let Some(expected) = checksum
            && checksum_bytes(data) != expected
        {
            return Err(StoreError::http(400, format!("checksum mismatch for block {block_id}")));
        }
        self.inner
            .lock()
            .staged
            .entry(path.to_string())
            .or_default()
            .insert(block_id.to_string(), data.to_vec());
        Ok(())
    }

    fn commit(&self, path: &str, block_ids: &[String]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let mut blob = Vec::new();
        {
            let staged = inner.staged.get(path);
            for id in block_ids {
                let block = staged
                    .and_then(|s| s.get(id))
                    .ok_or_else(|| StoreError::http(400, format!("invalid block list: {id}")))?;
                blob.extend_from_slice(block);
            }
        }
        inner.staged.remove(path);
        inner.blobs.insert(path.to_string(), blob);
        Ok(())
    }

    fn replace(&self, path: &str, data: &[u8]) {
        let mut inner = self.inner.lock();
        inner.staged.remove(path);
        inner.blobs.insert(path.to_string(), data.to_vec());
    }
}

impl BlobStore for MemoryBlobStore {
    fn properties<'a>(
        &'a self,
        uri: &'a BlobUri,
        _opts: &'a RequestOptions,
    ) -> StoreFuture<'a, BlobProperties> {
        Box::pin(async move {
            self.properties.fetch_add(1, Ordering::Relaxed);
            let length = self.length_of(uri.path())?;
            Ok(BlobProperties { length })
        })
    }

    fn read_range<'a>(
        &'a self,
        uri: &'a BlobUri,
        offset: u64,
        buf: &'a mut [u8],
        _opts: &'a RequestOptions,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.reads.fetch_add(1, Ordering::Relaxed);
            self.copy_range(uri.path(), offset, buf)
        })
    }

    fn put_block<'a>(
        &'a self,
        uri: &'a BlobUri,
        block_id: &'a str,
        data: &'a [u8],
        checksum: Option<&'a str>,
        _opts: &'a RequestOptions,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.stage(uri.path(), block_id, data, checksum)?;
            self.blocks_staged.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }

    fn commit_blocks<'a>(
        &'a self,
        uri: &'a BlobUri,
        block_ids: &'a [String],
        _opts: &'a RequestOptions,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.commit(uri.path(), block_ids)?;
            self.commits.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }

    fn put_blob<'a>(
        &'a self,
        uri: &'a BlobUri,
        data: &'a [u8],
        _opts: &'a RequestOptions,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.replace(uri.path(), data);
            self.whole_puts.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }
}
