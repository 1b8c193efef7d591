use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{codec::Compression, schema::Validator};

pub use crate::info::InfoOptions;

/// Default number of bytes read at a time while scanning for the end of the tree.
pub const DEFAULT_READ_CHUNK: usize = 64 * 1024;

/// How to open a file.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Defer reading array payloads until they are accessed.
    pub lazy: bool,
    /// Check the tree after parsing; failures abort the open.
    pub validator: Option<Arc<dyn Validator>>,
    /// Granularity of reads while looking for the tree and block headers.
    pub read_chunk: usize,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            lazy: true,
            validator: None,
            read_chunk: DEFAULT_READ_CHUNK,
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Values below 16 bytes are raised to 16.
    pub fn read_chunk(mut self, read_chunk: usize) -> Self {
        self.read_chunk = read_chunk.max(16);
        self
    }
}

/// How to serialise a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteOptions {
    /// Compression applied to every block.
    pub compression: Compression,
    /// Append a block index so readers can skip walking the blocks.
    pub block_index: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            compression: Compression::None,
            block_index: true,
        }
    }
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn block_index(mut self, block_index: bool) -> Self {
        self.block_index = block_index;
        self
    }
}
