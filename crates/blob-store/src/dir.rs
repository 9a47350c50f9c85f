//! Directory-backed blob store.
//!
//! Committed blobs are plain files below the root. Staged blocks live under
//! `<root>/.staging/<hex(path)>/<hex(block id)>` until the block list is
//! committed, at which point they are concatenated in list order into the
//! blob file and removed.

use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use crate::store::{BlobProperties, BlobStore, RequestOptions, StoreFuture};
use crate::{BlobUri, StoreError, checksum_bytes, validate_blob_key};

/// Name of the staging directory below the store root.
pub(crate) const STAGING_DIR: &str = ".staging";

/// File inside a blob's staging directory that a commit is assembled into.
/// Never a valid hex-encoded block id.
const ASSEMBLY_FILE: &str = ".assembling";

/// Blob store mapping blob paths onto files below a root directory.
#[derive(Debug, Clone)]
pub struct DirBlobStore {
    root: PathBuf,
}

impl DirBlobStore {
    /// Creates a store rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, uri: &BlobUri) -> Result<PathBuf, StoreError> {
        validate_blob_key(uri.path())?;
        Ok(self.root.join(uri.path()))
    }

    fn staging_dir(&self, uri: &BlobUri) -> PathBuf {
        self.root
            .join(STAGING_DIR)
            .join(hex::encode(uri.path().as_bytes()))
    }

    async fn read_into(&self, path: &Path, offset: u64, len: usize) -> Result<Vec<u8>, StoreError> {
        let mut file = tokio::fs::File::open(path).await.map_err(not_found)?;
        let length = file.metadata().await?.len();
        if offset.checked_add(len as u64).is_none_or(|end| end > length) {
            return Err(StoreError::http(
                416,
                format!("range {offset}+{len} exceeds blob length {length}"),
            ));
        }
        file.seek(SeekFrom::Start(offset)).await?;
        let mut data = vec![0u8; len];
        file.read_exact(&mut data).await?;
        Ok(data)
    }

    async fn write_block(&self, dir: &Path, block_id: &str, data: &[u8]) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(dir.join(hex::encode(block_id.as_bytes())), data).await?;
        Ok(())
    }

    async fn assemble(
        &self,
        staging: &Path,
        target: &Path,
        block_ids: &[String],
    ) -> Result<(), StoreError> {
        for id in block_ids {
            let staged = staging.join(hex::encode(id.as_bytes()));
            if !tokio::fs::try_exists(&staged).await? {
                return Err(StoreError::http(400, format!("invalid block list: {id}")));
            }
        }

        tokio::fs::create_dir_all(staging).await?;
        let assembly = staging.join(ASSEMBLY_FILE);
        let mut out = tokio::fs::File::create(&assembly).await?;
        for id in block_ids {
            let data = tokio::fs::read(staging.join(hex::encode(id.as_bytes()))).await?;
            out.write_all(&data).await?;
        }
        out.flush().await?;
        drop(out);

        replace_with(&assembly, target, staging).await?;
        debug!(path = %target.display(), blocks = block_ids.len(), "committed block list");
        Ok(())
    }

    async fn write_whole(&self, target: &Path, staging: &Path, data: &[u8]) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(staging).await?;
        let assembly = staging.join(ASSEMBLY_FILE);
        tokio::fs::write(&assembly, data).await?;
        replace_with(&assembly, target, staging).await
    }
}

/// Renames `assembled` over `target`, then drops the staging directory.
///
/// The previous blob stays intact until the rename.
async fn replace_with(assembled: &Path, target: &Path, staging: &Path) -> Result<(), StoreError> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::rename(assembled, target).await?;
    match tokio::fs::remove_dir_all(staging).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Maps a missing file onto the 404 a remote store would answer.
fn not_found(err: std::io::Error) -> StoreError {
    if err.kind() == ErrorKind::NotFound {
        StoreError::http(404, "blob not found")
    } else {
        StoreError::Io(err)
    }
}

impl BlobStore for DirBlobStore {
    fn properties<'a>(
        &'a self,
        uri: &'a BlobUri,
        opts: &'a RequestOptions,
    ) -> StoreFuture<'a, BlobProperties> {
        Box::pin(async move {
            let path = self.blob_path(uri)?;
            let meta = opts
                .execute(|| async { tokio::fs::metadata(&path).await.map_err(not_found) })
                .await?;
            Ok(BlobProperties { length: meta.len() })
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
            let path = self.blob_path(uri)?;
            let len = buf.len();
            let data = opts
                .execute(|| self.read_into(&path, offset, len))
                .await?;
            buf.copy_from_slice(&data);
            Ok(())
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
            validate_blob_key(uri.path())?;
            if let Some(expected) = checksum
                && checksum_bytes(data) != expected
            {
                return Err(StoreError::http(
                    400,
                    format!("checksum mismatch for block {block_id}"),
                ));
            }
            let dir = self.staging_dir(uri);
            opts.execute(|| self.write_block(&dir, block_id, data))
                .await
        })
    }

    fn commit_blocks<'a>(
        &'a self,
        uri: &'a BlobUri,
        block_ids: &'a [String],
        opts: &'a RequestOptions,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let target = self.blob_path(uri)?;
            let staging = self.staging_dir(uri);
            opts.execute(|| self.assemble(&staging, &target, block_ids))
                .await
        })
    }

    fn put_blob<'a>(
        &'a self,
        uri: &'a BlobUri,
        data: &'a [u8],
        opts: &'a RequestOptions,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let target = self.blob_path(uri)?;
            let staging = self.staging_dir(uri);
            opts.execute(|| self.write_whole(&target, &staging, data))
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(path: &str) -> BlobUri {
        BlobUri::parse(&format!("file://local/{path}")).unwrap()
    }

    #[tokio::test]
    async fn staged_blocks_commit_into_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirBlobStore::new(dir.path());
        let target = uri("media/out.bin");
        let opts = RequestOptions::default();

        store
            .put_block(&target, "AAE=", b" World", None, &opts)
            .await
            .unwrap();
        store
            .put_block(&target, "AAA=", b"Hello", None, &opts)
            .await
            .unwrap();
        store
            .commit_blocks(&target, &["AAA=".into(), "AAE=".into()], &opts)
            .await
            .unwrap();

        let content = std::fs::read(dir.path().join("media/out.bin")).unwrap();
        assert_eq!(&content, b"Hello World");
        assert!(!store.staging_dir(&target).exists());

        let props = store.properties(&target, &opts).await.unwrap();
        assert_eq!(props.length, 11);
    }

    #[tokio::test]
    async fn failed_commit_keeps_previous_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirBlobStore::new(dir.path());
        let target = uri("media/out.bin");
        let opts = RequestOptions::default();
        store.put_blob(&target, b"previous", &opts).await.unwrap();

        store
            .put_block(&target, "AAA=", b"new", None, &opts)
            .await
            .unwrap();
        // A directory where the second block should be: it exists but cannot be read.
        let unreadable = store.staging_dir(&target).join(hex::encode("AAE="));
        std::fs::create_dir_all(&unreadable).unwrap();

        let err = store
            .commit_blocks(&target, &["AAA=".into(), "AAE=".into()], &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        assert_eq!(
            std::fs::read(dir.path().join("media/out.bin")).unwrap(),
            b"previous"
        );
    }

    #[tokio::test]
    async fn read_range_reads_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("in.bin"), b"0123456789").unwrap();
        let store = DirBlobStore::new(dir.path());

        let mut buf = [0u8; 3];
        store
            .read_range(&uri("in.bin"), 6, &mut buf, &RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(&buf, b"678");
    }

    #[tokio::test]
    async fn missing_blob_maps_to_404() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirBlobStore::new(dir.path());
        let err = store
            .properties(&uri("nope.bin"), &RequestOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(404));
    }

    #[tokio::test]
    async fn commit_with_unknown_block_keeps_existing_blob() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep.bin"), b"old").unwrap();
        let store = DirBlobStore::new(dir.path());

        let err = store
            .commit_blocks(&uri("keep.bin"), &["x".into()], &RequestOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(400));
        assert_eq!(std::fs::read(dir.path().join("keep.bin")).unwrap(), b"old");
    }

    #[tokio::test]
    async fn put_blob_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirBlobStore::new(dir.path());
        let target = uri("a/b/c.bin");
        store
            .put_blob(&target, b"", &RequestOptions::default())
            .await
            .unwrap();
        assert!(std::fs::read(dir.path().join("a/b/c.bin")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn traversal_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirBlobStore::new(dir.path().join("root"));
        let err = store
            .put_blob(&uri("../escape.bin"), b"x", &RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidUri(_)));
    }
}
