//! Local content cache
//!
//! One file per item under `<root>/objects`, named by the hex-encoded item
//! id. New content is always written to a temporary file under
//! `<root>/staging` and renamed into place once complete, so a reader never
//! sees a half-written object.
//!
//! Readers pin an item while they use its file. Eviction takes an exclusive
//! guard that only succeeds when nobody holds a pin, and blocks new pins
//! until the file is gone.

use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use moka::sync::Cache;
use parking_lot::Mutex;
use tempfile::{NamedTempFile, TempPath};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

const OBJECTS_DIR: &str = "objects";
const STAGING_DIR: &str = "staging";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PinSlot {
    Readers(usize),
    Evicting,
}

type PinTable = Arc<Mutex<HashMap<String, PinSlot>>>;

/// Files of hydrated and locally written items
#[derive(Clone)]
pub struct ContentCache {
    objects: PathBuf,
    staging: PathBuf,
    pins: PinTable,
    /// Recently read files: id → content
    hot: Cache<String, Bytes>,
    hot_limit: u64,
    /// Bumped on every change to a cached file. A read that overlapped one
    /// does not populate `hot`.
    epoch: Arc<Mutex<u64>>,
}

impl std::fmt::Debug for ContentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentCache")
            .field("objects", &self.objects)
            .field("hot_entries", &self.hot.entry_count())
            .finish()
    }
}

impl ContentCache {
    /// Open the cache rooted at `root`, discarding staging files left by a
    /// previous process.
    pub async fn open(root: impl AsRef<Path>, hot_bytes: u64) -> io::Result<Self> {
        let root = root.as_ref();
        let objects = root.join(OBJECTS_DIR);
        let staging = root.join(STAGING_DIR);

        tokio::fs::create_dir_all(&objects).await?;
        if tokio::fs::try_exists(&staging).await? {
            tokio::fs::remove_dir_all(&staging).await?;
        }
        tokio::fs::create_dir_all(&staging).await?;

        // single files larger than a quarter of the budget are not kept hot
        let hot_limit = hot_bytes / 4;
        let hot = Cache::builder()
            .max_capacity(hot_bytes)
            .weigher(|_id: &String, data: &Bytes| data.len().try_into().unwrap_or(u32::MAX))
            .build();

        Ok(Self {
            objects,
            staging,
            pins: Arc::new(Mutex::new(HashMap::new())),
            hot,
            hot_limit,
            epoch: Arc::new(Mutex::new(0)),
        })
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.objects.join(hex::encode(id))
    }

    pub async fn contains(&self, id: &str) -> bool {
        tokio::fs::try_exists(self.path_for(id))
            .await
            .unwrap_or(false)
    }

    /// Size of the cached file, `None` when absent
    pub async fn len(&self, id: &str) -> io::Result<Option<u64>> {
        match tokio::fs::metadata(self.path_for(id)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Start writing a new version of `id`
    pub fn stage(&self, id: &str) -> io::Result<StagedFile> {
        let (file, path) = NamedTempFile::new_in(&self.staging)?.into_parts();
        Ok(StagedFile {
            id: id.to_string(),
            file: File::from_std(file),
            path,
            written: 0,
        })
    }

    /// Replace the content of `id` in one step
    pub async fn write_all(&self, id: &str, data: &[u8]) -> io::Result<u64> {
        let mut staged = self.stage(id)?;
        staged.write(data).await?;
        staged.commit(self).await
    }

    /// Whole content of `id`
    pub async fn read(&self, id: &str) -> io::Result<Bytes> {
        if let Some(data) = self.hot.get(id) {
            return Ok(data);
        }
        let epoch = self.hot_epoch();
        let data = Bytes::from(tokio::fs::read(self.path_for(id)).await?);
        self.keep_hot(id, &data, epoch);
        Ok(data)
    }

    fn hot_epoch(&self) -> u64 {
        *self.epoch.lock()
    }

    /// Remember `data`, read when the epoch was `epoch`, unless a file
    /// changed since
    fn keep_hot(&self, id: &str, data: &Bytes, epoch: u64) {
        if (data.len() as u64) > self.hot_limit {
            return;
        }
        let current = self.epoch.lock();
        if *current == epoch {
            self.hot.insert(id.to_string(), data.clone());
        }
    }

    fn invalidate(&self, id: &str) {
        let mut epoch = self.epoch.lock();
        *epoch += 1;
        self.hot.invalidate(id);
    }

    /// `len` bytes of `id` starting at `offset`
    pub async fn read_range(&self, id: &str, offset: u64, len: u64) -> io::Result<Bytes> {
        let mut file = File::open(self.path_for(id)).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::with_capacity(len as usize);
        file.take(len).read_to_end(&mut buf).await?;
        if (buf.len() as u64) < len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{id} ended before {}", offset + len),
            ));
        }
        Ok(Bytes::from(buf))
    }

    /// Delete the file of `id`, returning the bytes freed
    pub async fn remove(&self, id: &str) -> io::Result<u64> {
        let removed = self.remove_file(id).await;
        self.invalidate(id);
        removed
    }

    async fn remove_file(&self, id: &str) -> io::Result<u64> {
        let path = self.path_for(id);
        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(size),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Bytes held by every cached file
    pub async fn total_size(&self) -> io::Result<u64> {
        let mut total = 0;
        let mut entries = tokio::fs::read_dir(&self.objects).await?;
        while let Some(entry) = entries.next_entry().await? {
            total += entry.metadata().await?.len();
        }
        Ok(total)
    }

    /// Mark `id` as in use. `None` while it is being evicted.
    pub fn pin(&self, id: &str) -> Option<PinGuard> {
        let mut pins = self.pins.lock();
        let slot = pins.entry(id.to_string()).or_insert(PinSlot::Readers(0));
        match slot {
            PinSlot::Readers(n) => {
                *n += 1;
                Some(PinGuard {
                    id: id.to_string(),
                    pins: self.pins.clone(),
                })
            }
            PinSlot::Evicting => None,
        }
    }

    /// Exclusive access for removing the file of `id`. `None` while any
    /// pin is held.
    pub fn begin_eviction(&self, id: &str) -> Option<EvictionGuard> {
        let mut pins = self.pins.lock();
        match pins.get(id) {
            None => {
                pins.insert(id.to_string(), PinSlot::Evicting);
                Some(EvictionGuard {
                    id: id.to_string(),
                    pins: self.pins.clone(),
                })
            }
            Some(_) => None,
        }
    }

    pub fn readers(&self, id: &str) -> usize {
        match self.pins.lock().get(id) {
            Some(PinSlot::Readers(n)) => *n,
            _ => 0,
        }
    }
}

/// Keeps a cached file from being evicted
#[derive(Debug)]
pub struct PinGuard {
    id: String,
    pins: PinTable,
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        let mut pins = self.pins.lock();
        if let Some(PinSlot::Readers(n)) = pins.get_mut(&self.id) {
            *n -= 1;
            if *n == 0 {
                pins.remove(&self.id);
            }
        }
    }
}

/// Held while a cached file is removed
#[derive(Debug)]
pub struct EvictionGuard {
    id: String,
    pins: PinTable,
}

impl Drop for EvictionGuard {
    fn drop(&mut self) {
        let mut pins = self.pins.lock();
        if pins.get(&self.id) == Some(&PinSlot::Evicting) {
            pins.remove(&self.id);
        }
    }
}

/// A new version of an item being written. Dropping it without
/// [`commit`](Self::commit) deletes the temporary file.
#[derive(Debug)]
pub struct StagedFile {
    id: String,
    file: File,
    path: TempPath,
    written: u64,
}

impl StagedFile {
    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data).await?;
        self.written += data.len() as u64;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush and atomically move the file into place
    pub async fn commit(self, cache: &ContentCache) -> io::Result<u64> {
        let StagedFile {
            id,
            mut file,
            path,
            written,
        } = self;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let dest = cache.path_for(&id);
        path.persist(&dest).map_err(|e| e.error)?;
        cache.invalidate(&id);
        debug!(id = %id, bytes = written, "committed cached content");
        Ok(written)
    }
}

/// Cached content handed to a reader; the file cannot be evicted while this
/// value (or the stream made from it) is alive.
#[derive(Debug)]
pub struct HydratedContent {
    pub id: String,
    pub size: u64,
    pub etag: Option<String>,
    cache: ContentCache,
    pin: PinGuard,
}

impl HydratedContent {
    pub(crate) fn new(
        id: &str,
        size: u64,
        etag: Option<String>,
        cache: ContentCache,
        pin: PinGuard,
    ) -> Self {
        Self {
            id: id.to_string(),
            size,
            etag,
            cache,
            pin,
        }
    }

    pub fn path(&self) -> PathBuf {
        self.cache.path_for(&self.id)
    }

    pub async fn read_all(&self) -> io::Result<Bytes> {
        self.cache.read(&self.id).await
    }

    /// Stream the content in chunks without loading it whole
    pub async fn into_stream(self) -> io::Result<ContentStream> {
        let file = File::open(self.path()).await.map_err(|e| {
            warn!(id = %self.id, error = %e, "cached file vanished under a pin");
            e
        })?;
        Ok(ContentStream {
            inner: ReaderStream::new(file),
            _pin: self.pin,
        })
    }
}

/// Byte stream over a pinned cached file
pub struct ContentStream {
    inner: ReaderStream<File>,
    _pin: PinGuard,
}

impl Stream for ContentStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use tempfile::TempDir;

    use super::*;

    async fn setup() -> (ContentCache, TempDir) {
        let dir = TempDir::new().unwrap();
        let cache = ContentCache::open(dir.path(), 1024 * 1024).await.unwrap();
        (cache, dir)
    }

    #[tokio::test]
    async fn test_write_read_remove() {
        let (cache, _dir) = setup().await;
        assert!(!cache.contains("a").await);

        cache.write_all("a", b"hello").await.unwrap();
        assert!(cache.contains("a").await);
        assert_eq!(cache.len("a").await.unwrap(), Some(5));
        assert_eq!(&cache.read("a").await.unwrap()[..], b"hello");
        assert_eq!(&cache.read_range("a", 1, 3).await.unwrap()[..], b"ell");

        assert_eq!(cache.remove("a").await.unwrap(), 5);
        assert_eq!(cache.remove("a").await.unwrap(), 0);
        assert!(cache.len("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rewrite_invalidates_hot_copy() {
        let (cache, _dir) = setup().await;
        cache.write_all("a", b"one").await.unwrap();
        assert_eq!(&cache.read("a").await.unwrap()[..], b"one");

        cache.write_all("a", b"two").await.unwrap();
        assert_eq!(&cache.read("a").await.unwrap()[..], b"two");
    }

    #[tokio::test]
    async fn test_read_overlapping_rewrite_is_not_kept_hot() {
        let (cache, _dir) = setup().await;
        cache.write_all("a", b"old").await.unwrap();

        // a read that finished with the old bytes just as a write landed
        let epoch = cache.hot_epoch();
        let old = Bytes::from(tokio::fs::read(cache.path_for("a")).await.unwrap());
        cache.write_all("a", b"new").await.unwrap();
        cache.keep_hot("a", &old, epoch);

        assert_eq!(&cache.read("a").await.unwrap()[..], b"new");
        assert_eq!(&cache.read("a").await.unwrap()[..], b"new");
    }

    #[tokio::test]
    async fn test_removed_file_is_not_served_hot() {
        let (cache, _dir) = setup().await;
        cache.write_all("a", b"gone soon").await.unwrap();
        assert_eq!(&cache.read("a").await.unwrap()[..], b"gone soon");

        cache.remove("a").await.unwrap();
        assert!(cache.read("a").await.is_err());
    }

    #[tokio::test]
    async fn test_abandoned_stage_leaves_nothing() {
        let (cache, _dir) = setup().await;
        cache.write_all("a", b"original").await.unwrap();

        let mut staged = cache.stage("a").unwrap();
        staged.write(b"partial").await.unwrap();
        drop(staged);

        assert_eq!(&cache.read("a").await.unwrap()[..], b"original");
        let mut leftovers = tokio::fs::read_dir(&cache.staging).await.unwrap();
        assert!(leftovers.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pins_block_eviction() {
        let (cache, _dir) = setup().await;

        let first = cache.pin("a").unwrap();
        let second = cache.pin("a").unwrap();
        assert_eq!(cache.readers("a"), 2);
        assert!(cache.begin_eviction("a").is_none());

        drop(first);
        assert!(cache.begin_eviction("a").is_none());
        drop(second);

        let guard = cache.begin_eviction("a").unwrap();
        assert!(cache.pin("a").is_none());
        drop(guard);
        assert!(cache.pin("a").is_some());
    }

    #[tokio::test]
    async fn test_stream_holds_pin() {
        let (cache, _dir) = setup().await;
        cache.write_all("a", b"streamed bytes").await.unwrap();

        let content = HydratedContent::new("a", 14, None, cache.clone(), cache.pin("a").unwrap());
        let mut stream = content.into_stream().await.unwrap();
        assert!(cache.begin_eviction("a").is_none());

        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(out, b"streamed bytes");

        drop(stream);
        assert!(cache.begin_eviction("a").is_some());
    }

    #[tokio::test]
    async fn test_open_clears_staging_and_sizes() {
        let dir = TempDir::new().unwrap();
        {
            let cache = ContentCache::open(dir.path(), 0).await.unwrap();
            cache.write_all("a", b"12345").await.unwrap();
            cache.write_all("b", b"678").await.unwrap();
            let staged = cache.stage("c").unwrap();
            std::mem::forget(staged);
        }

        let cache = ContentCache::open(dir.path(), 0).await.unwrap();
        assert_eq!(cache.total_size().await.unwrap(), 8);
        let mut leftovers = tokio::fs::read_dir(&cache.staging).await.unwrap();
        assert!(leftovers.next_entry().await.unwrap().is_none());
    }
}
