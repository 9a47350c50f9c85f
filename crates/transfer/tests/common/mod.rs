//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use blockshift_blob_store::{
    BlobProperties, BlobStore, BlobUri, MemoryBlobStore, RequestOptions, SignatureProvider,
    StoreError, StoreFuture,
};
use blockshift_transfer::{PoolRegistry, TransferConfig};
use parking_lot::Mutex;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

/// Small blocks so multi-block transfers stay cheap.
pub fn small_config(block_size: usize, threshold: u64) -> TransferConfig {
    TransferConfig {
        concurrency: 4,
        single_shot_threshold: threshold,
        download_block_size: block_size,
        upload_initial_block_size: block_size,
        upload_block_step: block_size,
        upload_max_block_size: block_size * 4,
        ..TransferConfig::default()
    }
}

pub fn registry() -> Arc<PoolRegistry> {
    Arc::new(PoolRegistry::new(64 * 1024 * 1024, 64))
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

pub fn uri(path: &str) -> BlobUri {
    BlobUri::parse(&format!("mem://store/{path}")).unwrap()
}

/// Memory store wrapper that injects faults and records calls.
#[derive(Default)]
pub struct FaultyStore {
    pub inner: MemoryBlobStore,
    /// Remaining 403 answers per read offset.
    forbidden_reads: Mutex<HashMap<u64, u32>>,
    /// Remaining 403 answers per staged block id.
    forbidden_blocks: Mutex<HashMap<String, u32>>,
    /// Artificial latency per read offset.
    read_delays: Mutex<HashMap<u64, Duration>>,
    read_attempts: Mutex<HashMap<u64, u32>>,
    block_attempts: Mutex<HashMap<String, u32>>,
    /// `(offset, length)` of every read, in call order.
    pub reads: Mutex<Vec<(u64, usize)>>,
    /// Canceled once this many reads or block writes have started.
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
    pub remote_ops: AtomicUsize,
    /// Answer every properties call with 403 this many times.
    pub forbidden_properties: AtomicU32,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forbid_read(&self, offset: u64, times: u32) {
        self.forbidden_reads.lock().insert(offset, times);
    }

    pub fn forbid_block(&self, block_id: &str, times: u32) {
        self.forbidden_blocks.lock().insert(block_id.to_string(), times);
    }

    pub fn delay_read(&self, offset: u64, delay: Duration) {
        self.read_delays.lock().insert(offset, delay);
    }

    pub fn cancel_after(&self, ops: usize, token: CancellationToken) {
        *self.cancel_after.lock() = Some((ops, token));
    }

    pub fn read_attempts(&self, offset: u64) -> u32 {
        self.read_attempts.lock().get(&offset).copied().unwrap_or(0)
    }

    pub fn block_attempts(&self, block_id: &str) -> u32 {
        self.block_attempts.lock().get(block_id).copied().unwrap_or(0)
    }

    fn start_op(&self) {
        let started = self.remote_ops.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((limit, token)) = &*self.cancel_after.lock()
            && started >= *limit
        {
            token.cancel();
        }
    }
}

fn consume<K: std::hash::Hash + Eq>(map: &Mutex<HashMap<K, u32>>, key: &K) -> bool {
    let mut map = map.lock();
    match map.get_mut(key) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

fn bump<K: std::hash::Hash + Eq>(map: &Mutex<HashMap<K, u32>>, key: K) {
    *map.lock().entry(key).or_default() += 1;
}

impl BlobStore for FaultyStore {
    fn properties<'a>(
        &'a self,
        uri: &'a BlobUri,
        opts: &'a RequestOptions,
    ) -> StoreFuture<'a, BlobProperties> {
        Box::pin(async move {
            let forbidden = self
                .forbidden_properties
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if forbidden {
                return Err(StoreError::http(403, "signature not yet valid"));
            }
            self.inner.properties(uri, opts).await
        })
    }

    fn read_range<'a>(
        &'a self,
        uri: &'a BlobUri,
        offset: u64,
        buf: &'a mut [u8],
        opts: &'a RequestOptions,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.start_op();
            bump(&self.read_attempts, offset);
            self.reads.lock().push((offset, buf.len()));
            let delay = self.read_delays.lock().get(&offset).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if consume(&self.forbidden_reads, &offset) {
                return Err(StoreError::http(403, "signature expired"));
            }
            self.inner.read_range(uri, offset, buf, opts).await
        })
    }

    fn put_block<'a>(
        &'a self,
        uri: &'a BlobUri,
        block_id: &'a str,
        data: &'a [u8],
        checksum: Option<&'a str>,
        opts: &'a RequestOptions,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.start_op();
            bump(&self.block_attempts, block_id.to_string());
            if consume(&self.forbidden_blocks, &block_id.to_string()) {
                return Err(StoreError::http(403, "signature expired"));
            }
            self.inner
                .put_block(uri, block_id, data, checksum, opts)
                .await
        })
    }

    fn commit_blocks<'a>(
        &'a self,
        uri: &'a BlobUri,
        block_ids: &'a [String],
        opts: &'a RequestOptions,
    ) -> StoreFuture<'a, ()> {
        self.inner.commit_blocks(uri, block_ids, opts)
    }

    fn put_blob<'a>(
        &'a self,
        uri: &'a BlobUri,
        data: &'a [u8],
        opts: &'a RequestOptions,
    ) -> StoreFuture<'a, ()> {
        self.inner.put_blob(uri, data, opts)
    }
}

/// Issues `sig=1`, `sig=2`, ... and counts refreshes.
#[derive(Default)]
pub struct CountingSigner {
    pub issued: AtomicU32,
}

impl SignatureProvider for CountingSigner {
    fn fetch(&self) -> StoreFuture<'_, String> {
        Box::pin(async move {
            let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("sig={n}"))
        })
    }
}

/// In-memory writer whose contents outlive the transfer.
#[derive(Clone, Default)]
pub struct SharedWriter(pub Arc<Mutex<Vec<u8>>>);

impl SharedWriter {
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().clone()
    }
}

impl AsyncWrite for SharedWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.0.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
