use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use zarrs::storage::{
    ReadableStorage, ReadableStorageTraits, StoreKey, WritableStorageTraits, byte_range::ByteRange,
    store::MemoryStore,
};

use crate::{Error, Result};

/// Byte-range access to a single ASDF file held under a key of a zarrs store.
///
/// Any [ReadableStorageTraits] implementation works as a backing store:
/// the local filesystem, memory, or an object store adapter.
/// Stores which do not support partial reads are fetched once in full
/// and sliced from then on.
#[derive(Clone)]
pub struct AsdfSource {
    storage: ReadableStorage,
    key: StoreKey,
    whole: Arc<Mutex<Option<Bytes>>>,
}

impl std::fmt::Debug for AsdfSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsdfSource")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl AsdfSource {
    pub fn new(storage: ReadableStorage, key: StoreKey) -> Self {
        Self {
            storage,
            key,
            whole: Default::default(),
        }
    }

    /// Wrap an in-memory buffer in a [MemoryStore].
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self> {
        let store = MemoryStore::new();
        let key = StoreKey::new("file.asdf").map_err(Error::wrap)?;
        store.set(&key, bytes.into())?;
        Ok(Self::new(Arc::new(store), key))
    }

    pub fn key(&self) -> &StoreKey {
        &self.key
    }

    /// Total size of the file in bytes.
    pub fn size(&self) -> Result<u64> {
        self.storage
            .size_key(&self.key)?
            .ok_or_else(|| self.missing())
    }

    /// Read exactly `length` bytes starting at `offset`.
    pub fn read(&self, offset: u64, length: u64) -> Result<Bytes> {
        let bytes = if self.storage.supports_get_partial() {
            log::trace!("partial read of {}: {offset}+{length}", self.key.as_str());
            self.storage
                .get_partial(&self.key, ByteRange::FromStart(offset, Some(length)))?
                .ok_or_else(|| self.missing())?
        } else {
            let whole = self.whole()?;
            let start = (offset as usize).min(whole.len());
            let end = (offset.saturating_add(length) as usize).min(whole.len());
            whole.slice(start..end)
        };
        if (bytes.len() as u64) < length {
            return Err(Error::Truncated {
                context: format!("{} at offset {offset}", self.key.as_str()),
                expected: length,
                found: bytes.len() as u64,
            });
        }
        Ok(bytes)
    }

    /// Read up to `length` bytes starting at `offset`, stopping early at the end of the file.
    pub fn read_up_to(&self, offset: u64, length: u64) -> Result<Bytes> {
        let size = self.size()?;
        if offset >= size {
            return Ok(Bytes::new());
        }
        self.read(offset, length.min(size - offset))
    }

    fn whole(&self) -> Result<Bytes> {
        let mut guard = self.whole.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(b) = guard.as_ref() {
            return Ok(b.clone());
        }
        log::debug!("store does not support partial reads, fetching {}", self.key.as_str());
        let b = self.storage.get(&self.key)?.ok_or_else(|| self.missing())?;
        *guard = Some(b.clone());
        Ok(b)
    }

    fn missing(&self) -> Error {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no such key in store: {}", self.key.as_str()),
        ))
    }
}
