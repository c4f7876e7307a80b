//! Content-addressed blob store.
//!
//! A [`BlobStore`] is a directory of files named by an opaque mapping from
//! a 20-byte SHA-1 key to a filename, plus a streaming writer that computes
//! the key incrementally so large attachments never have to sit fully in
//! memory. The key -> filename index itself is injected via [`BlobIndex`]
//! so each storage adapter can back it with whatever table its own engine
//! already has open (a `redb` table, a `HashMap`, ...).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use md5::Md5;
use sha1::{Digest, Sha1};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use burrow_core::error::{BurrowError, Result};

pub type BlobKey = [u8; 20];

pub fn format_key(key: &BlobKey) -> String {
    hex::encode(key)
}

pub fn parse_key(s: &str) -> Option<BlobKey> {
    let bytes = hex::decode(s).ok()?;
    bytes.try_into().ok()
}

/// The key -> filename index backing a [`BlobStore`]. Implementations are
/// expected to treat this as the authoritative record: a file on disk with
/// no corresponding row is an orphan, tolerated until the next `gc`.
#[async_trait]
pub trait BlobIndex: Send + Sync {
    async fn lookup(&self, key: &BlobKey) -> Result<Option<String>>;
    async fn insert(&self, key: &BlobKey, filename: &str) -> Result<()>;
    async fn remove(&self, key: &BlobKey) -> Result<()>;
    async fn all(&self) -> Result<Vec<(BlobKey, String)>>;
}

pub struct BlobStore {
    root: PathBuf,
    index: Arc<dyn BlobIndex>,
}

impl BlobStore {
    /// Synchronous on purpose: directory creation is the only setup work,
    /// and callers that open a durable adapter (`RedbAdapter::open`) need a
    /// blocking constructor so the facade can offer a plain, non-async
    /// `Database::open`.
    pub fn new(root: impl Into<PathBuf>, index: Arc<dyn BlobIndex>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root, index })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store a byte slice whole. Dedupes on content hash: if a blob with
    /// the same SHA-1 already exists, its key is returned without writing
    /// anything new.
    pub async fn store(&self, bytes: &[u8]) -> Result<BlobKey> {
        let mut writer = self.open_writer()?;
        writer.append(bytes).await?;
        self.install(writer).await
    }

    /// Open a temp file under the store root that accumulates digests as
    /// bytes are appended. Not visible in the store until [`Self::install`]
    /// succeeds.
    pub fn open_writer(&self) -> Result<BlobWriter> {
        BlobWriter::new(&self.root)
    }

    /// Seal and publish a writer: assign it a filename, move its temp file
    /// into the store, and register the key -> filename row. If a blob
    /// with the same key already exists, the temp file is discarded and the
    /// existing filename kept.
    pub async fn install(&self, mut writer: BlobWriter) -> Result<BlobKey> {
        let key = writer.finish();
        if self.index.lookup(&key).await?.is_some() {
            return Ok(key);
        }

        let filename = format_key(&key);
        let dest = self.root.join(&filename);
        if fs::metadata(&dest).await.is_ok() {
            // Stale leftover from a prior attempt that rolled back.
            let _ = fs::remove_file(&dest).await;
        }

        let temp_path = writer.path().to_path_buf();
        fs::rename(&temp_path, &dest).await?;

        if let Err(e) = self.index.insert(&key, &filename).await {
            let _ = fs::remove_file(&dest).await;
            return Err(e);
        }

        Ok(key)
    }

    pub async fn read(&self, key: &BlobKey) -> Result<BlobReader> {
        let filename = self
            .index
            .lookup(key)
            .await?
            .ok_or_else(|| BurrowError::NotFound(format!("blob {}", format_key(key))))?;
        let path = self.root.join(&filename);
        let file = fs::File::open(&path).await?;
        let len = file.metadata().await?.len();
        Ok(BlobReader { file, len })
    }

    /// Remove filename-table rows whose key is not in `keep`, then delete
    /// on-disk files that aren't among the filenames still retained.
    pub async fn gc(&self, keep: &HashSet<BlobKey>) -> Result<GcStats> {
        let all = self.index.all().await?;
        let mut keep_filenames = HashSet::new();
        let mut removed_rows = 0u64;
        for (key, filename) in &all {
            if keep.contains(key) {
                keep_filenames.insert(filename.clone());
            } else {
                self.index.remove(key).await?;
                removed_rows += 1;
            }
        }

        let mut removed_files = 0u64;
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !keep_filenames.contains(&name) {
                let _ = fs::remove_file(entry.path()).await;
                removed_files += 1;
            }
        }

        Ok(GcStats {
            removed_rows,
            removed_files,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub removed_rows: u64,
    pub removed_files: u64,
}

/// A streaming writer backed by a fresh temp file under the store's root.
/// `append` may be called any number of times (once per network chunk, for
/// instance). Dropping a writer that was never installed deletes its temp
/// file; this is a property of `tempfile::NamedTempFile`, not custom logic.
pub struct BlobWriter {
    temp: tempfile::NamedTempFile,
    file: fs::File,
    sha1: Sha1,
    md5: Md5,
    len: u64,
    sealed_key: Option<BlobKey>,
}

impl BlobWriter {
    fn new(root: &Path) -> Result<Self> {
        let temp = tempfile::NamedTempFile::new_in(root)?;
        let file = fs::File::from_std(temp.reopen()?);
        Ok(Self {
            temp,
            file,
            sha1: Sha1::new(),
            md5: Md5::new(),
            len: 0,
            sealed_key: None,
        })
    }

    pub async fn append(&mut self, bytes: &[u8]) -> Result<()> {
        self.sha1.update(bytes);
        self.md5.update(bytes);
        self.len += bytes.len() as u64;
        self.file.write_all(bytes).await?;
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Seal the running digest into a key. Idempotent.
    pub fn finish(&mut self) -> BlobKey {
        if let Some(key) = self.sealed_key {
            return key;
        }
        let digest = self.sha1.clone().finalize();
        let mut key = [0u8; 20];
        key.copy_from_slice(&digest);
        self.sealed_key = Some(key);
        key
    }

    /// Hex MD5 of the bytes written so far, used to cross-check multipart
    /// responses that advertise a `Content-MD5`-style digest.
    pub fn md5_hex(&self) -> String {
        hex::encode(self.md5.clone().finalize())
    }

    fn path(&self) -> &Path {
        self.temp.path()
    }
}

pub struct BlobReader {
    file: fs::File,
    len: u64,
}

impl BlobReader {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub async fn read_to_end(mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.len as usize);
        self.file.read_to_end(&mut buf).await?;
        Ok(buf)
    }

    pub fn into_inner(self) -> fs::File {
        self.file
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemIndex(Mutex<HashMap<BlobKey, String>>);

    #[async_trait]
    impl BlobIndex for MemIndex {
        async fn lookup(&self, key: &BlobKey) -> Result<Option<String>> {
            Ok(self.0.lock().unwrap().get(key).cloned())
        }
        async fn insert(&self, key: &BlobKey, filename: &str) -> Result<()> {
            self.0.lock().unwrap().insert(*key, filename.to_string());
            Ok(())
        }
        async fn remove(&self, key: &BlobKey) -> Result<()> {
            self.0.lock().unwrap().remove(key);
            Ok(())
        }
        async fn all(&self) -> Result<Vec<(BlobKey, String)>> {
            Ok(self
                .0
                .lock()
                .unwrap()
                .iter()
                .map(|(k, v)| (*k, v.clone()))
                .collect())
        }
    }

    async fn new_store() -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(MemIndex::default());
        let store = BlobStore::new(dir.path().join("blobs"), index).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn store_and_read_round_trip() {
        let (_dir, store) = new_store().await;
        let key = store.store(b"hello world").await.unwrap();
        let bytes = store.read(&key).await.unwrap().read_to_end().await.unwrap();
        assert_eq!(bytes, b"hello world");
    }

    #[tokio::test]
    async fn content_addressing_dedupes() {
        let (_dir, store) = new_store().await;
        let k1 = store.store(b"same bytes").await.unwrap();
        let k2 = store.store(b"same bytes").await.unwrap();
        assert_eq!(k1, k2);
    }

    #[tokio::test]
    async fn store_then_read_then_store_is_stable() {
        let (_dir, store) = new_store().await;
        let key = store.store(b"abc").await.unwrap();
        let read_back = store.read(&key).await.unwrap().read_to_end().await.unwrap();
        let key2 = store.store(&read_back).await.unwrap();
        assert_eq!(key, key2);
    }

    #[tokio::test]
    async fn read_missing_key_fails() {
        let (_dir, store) = new_store().await;
        assert!(store.read(&[0u8; 20]).await.is_err());
    }

    #[tokio::test]
    async fn streaming_writer_matches_whole_buffer_store() {
        let (_dir, store) = new_store().await;
        let mut writer = store.open_writer().unwrap();
        writer.append(b"chunk one ").await.unwrap();
        writer.append(b"chunk two").await.unwrap();
        let key = store.install(writer).await.unwrap();

        let direct = store.store(b"chunk one chunk two").await.unwrap();
        assert_eq!(key, direct);
    }

    #[tokio::test]
    async fn gc_removes_unreferenced_blobs() {
        let (_dir, store) = new_store().await;
        let keep = store.store(b"keep me").await.unwrap();
        let drop_key = store.store(b"drop me").await.unwrap();

        let mut keep_set = HashSet::new();
        keep_set.insert(keep);
        let stats = store.gc(&keep_set).await.unwrap();

        assert_eq!(stats.removed_rows, 1);
        assert!(store.read(&keep).await.is_ok());
        assert!(store.read(&drop_key).await.is_err());
    }

    #[tokio::test]
    async fn unfinished_writer_releases_temp_file_on_drop() {
        let (_dir, store) = new_store().await;
        let mut writer = store.open_writer().unwrap();
        writer.append(b"abandoned").await.unwrap();
        let path = writer.path().to_path_buf();
        drop(writer);
        assert!(fs::metadata(&path).await.is_err());
    }
}
