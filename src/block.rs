use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;

use crate::{Error, Result, codec::Compression, storage::AsdfSource};

pub(crate) const BLOCK_MAGIC: &[u8; 4] = b"\xd3BLK";
pub(crate) const BLOCK_INDEX_HEADER: &[u8] = b"#ASDF BLOCK INDEX";
/// Bytes in the fixed part of a block header, after the magic and size fields.
pub(crate) const MIN_HEADER_SIZE: u16 = 48;
const STREAMED: u32 = 0x1;

/// Header of one binary block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    /// Offset of the block magic in the file.
    pub offset: u64,
    pub(crate) header_size: u16,
    pub flags: u32,
    pub compression: Compression,
    pub allocated_size: u64,
    pub used_size: u64,
    pub data_size: u64,
    pub checksum: [u8; 16],
}

impl BlockHeader {
    /// Parse a header from bytes beginning with the block magic.
    pub(crate) fn from_bytes(bytes: &[u8], offset: u64) -> Result<Self> {
        if bytes.len() < 6 || &bytes[..4] != BLOCK_MAGIC {
            return Err(Error::format(format!("no block magic at offset {offset}")));
        }
        let header_size = BigEndian::read_u16(&bytes[4..6]);
        if header_size < MIN_HEADER_SIZE {
            return Err(Error::format(format!(
                "block header at {offset} declares {header_size} bytes, need at least {MIN_HEADER_SIZE}"
            )));
        }
        let h = &bytes[6..];
        if h.len() < MIN_HEADER_SIZE as usize {
            return Err(Error::format(format!(
                "block header at {offset} is truncated"
            )));
        }
        let compression = Compression::from_header(h[4..8].try_into().map_err(Error::wrap)?)?;
        Ok(Self {
            offset,
            header_size,
            flags: BigEndian::read_u32(&h[0..4]),
            compression,
            allocated_size: BigEndian::read_u64(&h[8..16]),
            used_size: BigEndian::read_u64(&h[16..24]),
            data_size: BigEndian::read_u64(&h[24..32]),
            checksum: h[32..48].try_into().map_err(Error::wrap)?,
        })
    }

    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; 6 + self.header_size as usize];
        out[..4].copy_from_slice(BLOCK_MAGIC);
        BigEndian::write_u16(&mut out[4..6], self.header_size);
        let h = &mut out[6..];
        BigEndian::write_u32(&mut h[0..4], self.flags);
        h[4..8].copy_from_slice(&self.compression.to_header());
        BigEndian::write_u64(&mut h[8..16], self.allocated_size);
        BigEndian::write_u64(&mut h[16..24], self.used_size);
        BigEndian::write_u64(&mut h[24..32], self.data_size);
        h[32..48].copy_from_slice(&self.checksum);
        out
    }

    /// Offset of the first payload byte.
    pub fn data_offset(&self) -> u64 {
        self.offset.saturating_add(6 + self.header_size as u64)
    }

    /// The block runs to the end of the file and its sizes are not recorded.
    pub fn is_streamed(&self) -> bool {
        self.flags & STREAMED != 0
    }

    /// Offset of the following block.
    pub(crate) fn end(&self) -> Result<u64> {
        self.data_offset()
            .checked_add(self.allocated_size)
            .ok_or_else(|| Error::format(format!("block at {} overflows", self.offset)))
    }

    /// Check the sizes against each other and a file of `size` bytes.
    fn check(&self, size: u64) -> Result<()> {
        if self.used_size > self.allocated_size {
            return Err(Error::format(format!(
                "block at {} uses {} of {} allocated bytes",
                self.offset, self.used_size, self.allocated_size
            )));
        }
        if self.end()? > size {
            return Err(Error::format(format!("block at {} overruns the file", self.offset)));
        }
        Ok(())
    }

    /// Fetch and decompress the payload.
    pub(crate) fn read(&self, source: &AsdfSource) -> Result<Bytes> {
        log::debug!(
            "reading block at {} ({} bytes, {:?})",
            self.offset,
            self.used_size,
            self.compression
        );
        let used = source.read(self.data_offset(), self.used_size)?;
        self.compression.decode(used, self.data_size)
    }
}

/// Locate every block header after the tree, without reading payloads.
///
/// `first` is the first byte after the YAML tree.
pub(crate) fn discover(source: &AsdfSource, first: u64, chunk: usize) -> Result<Vec<BlockHeader>> {
    let size = source.size()?;
    if first >= size {
        return Ok(Vec::new());
    }
    let head = source.read_up_to(first, chunk as u64)?;
    let Some(start) = find(&head, BLOCK_MAGIC) else {
        if find(&head, BLOCK_INDEX_HEADER).is_none() && head.iter().any(|b| !b.is_ascii_whitespace()) {
            log::warn!("{} trailing bytes after tree without a block", size - first);
        }
        return Ok(Vec::new());
    };
    let start = first + start as u64;

    match from_index(source, start, size, chunk) {
        Ok(Some(headers)) => return Ok(headers),
        Ok(None) => log::debug!("no block index, walking block headers"),
        Err(e) => log::warn!("ignoring unusable block index: {e}"),
    }
    walk(source, start, size)
}

fn read_header(source: &AsdfSource, offset: u64) -> Result<BlockHeader> {
    let bytes = source.read_up_to(offset, 6 + MIN_HEADER_SIZE as u64)?;
    let header = BlockHeader::from_bytes(&bytes, offset)?;
    log::trace!("block header {header:?}");
    Ok(header)
}

fn walk(source: &AsdfSource, start: u64, size: u64) -> Result<Vec<BlockHeader>> {
    let mut out = Vec::new();
    let mut pos = start;
    while pos < size {
        let peek = source.read_up_to(pos, BLOCK_INDEX_HEADER.len() as u64)?;
        if !peek.starts_with(BLOCK_MAGIC) {
            if peek.as_ref() == BLOCK_INDEX_HEADER {
                break;
            }
            return Err(Error::format(format!("expected block magic at offset {pos}")));
        }
        let mut header = read_header(source, pos)?;
        if header.is_streamed() {
            let data_size = size.checked_sub(header.data_offset()).ok_or_else(|| {
                Error::format(format!("streamed block at {pos} has no room for a payload"))
            })?;
            header.allocated_size = data_size;
            header.used_size = data_size;
            header.data_size = data_size;
            out.push(header);
            break;
        }
        header.check(size)?;
        pos = header.end()?;
        out.push(header);
    }
    Ok(out)
}

/// Read the optional block index at the end of the file.
///
/// Returns `None` if the file has no index.
fn from_index(
    source: &AsdfSource,
    start: u64,
    size: u64,
    chunk: usize,
) -> Result<Option<Vec<BlockHeader>>> {
    let tail_start = size.saturating_sub(chunk as u64).max(start);
    let tail = source.read(tail_start, size - tail_start)?;
    let Some(at) = rfind(&tail, BLOCK_INDEX_HEADER) else {
        return Ok(None);
    };
    let body = tail[at + BLOCK_INDEX_HEADER.len()..].trim_ascii_start();
    let offsets: Vec<u64> = serde_yaml::from_slice(body)?;
    if offsets.first() != Some(&start) {
        return Err(Error::format("block index does not start at the first block"));
    }
    let mut out = Vec::with_capacity(offsets.len());
    for offset in offsets {
        let header = read_header(source, offset)?;
        if header.is_streamed() {
            return Ok(None);
        }
        header.check(size)?;
        out.push(header);
    }
    Ok(Some(out))
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

/// Render a block index for `offsets`.
pub(crate) fn index_bytes(offsets: &[u64]) -> Vec<u8> {
    let mut out = Vec::from(BLOCK_INDEX_HEADER);
    out.extend_from_slice(b"\n%YAML 1.1\n---\n");
    for o in offsets {
        out.extend_from_slice(format!("- {o}\n").as_bytes());
    }
    out.extend_from_slice(b"...\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> BlockHeader {
        BlockHeader {
            offset: 100,
            header_size: MIN_HEADER_SIZE,
            flags: 0,
            compression: Compression::Zlib,
            allocated_size: 64,
            used_size: 40,
            data_size: 128,
            checksum: [7; 16],
        }
    }

    #[test]
    fn header_layout() {
        let h = header();
        let bytes = h.to_bytes();
        assert_eq!(bytes.len(), 54);
        assert_eq!(&bytes[..4], BLOCK_MAGIC);
        assert_eq!(&bytes[10..14], b"zlib");
        assert_eq!(BlockHeader::from_bytes(&bytes, 100).unwrap(), h);
        assert_eq!(h.data_offset(), 154);
        assert_eq!(h.end().unwrap(), 218);
    }

    #[test]
    fn rejects_bad_magic_and_short_headers() {
        let mut bytes = header().to_bytes();
        assert!(BlockHeader::from_bytes(&bytes[..20], 0).unwrap_err().is_format_error());
        bytes[0] = b'X';
        assert!(BlockHeader::from_bytes(&bytes, 0).unwrap_err().is_format_error());
    }

    #[test]
    fn walks_blocks_and_stops_at_index() {
        let mut file = b"tree...\n".to_vec();
        let first = file.len() as u64;
        let mut offsets = Vec::new();
        for n in [3u64, 5] {
            let h = BlockHeader {
                offset: file.len() as u64,
                compression: Compression::None,
                allocated_size: n + 2,
                used_size: n,
                data_size: n,
                ..header()
            };
            offsets.push(h.offset);
            file.extend(h.to_bytes());
            file.extend(vec![1u8; (n + 2) as usize]);
        }
        file.extend(index_bytes(&offsets));
        let source = AsdfSource::from_bytes(file).unwrap();

        let indexed = discover(&source, first, 1 << 16).unwrap();
        let walked = walk(&source, first, source.size().unwrap()).unwrap();
        assert_eq!(indexed, walked);
        assert_eq!(walked.len(), 2);
        assert_eq!(walked[1].data_size, 5);
    }

    fn file_with(h: &BlockHeader, payload: usize) -> AsdfSource {
        let mut file = h.to_bytes();
        file.extend(vec![0u8; payload]);
        AsdfSource::from_bytes(file).unwrap()
    }

    #[test]
    fn inconsistent_headers_are_format_errors() {
        let huge = BlockHeader {
            offset: 0,
            allocated_size: u64::MAX,
            used_size: 4,
            ..header()
        };
        let source = file_with(&huge, 4);
        let err = walk(&source, 0, source.size().unwrap()).unwrap_err();
        assert!(err.is_format_error(), "{err}");

        let overrun = BlockHeader {
            offset: 0,
            allocated_size: 64,
            used_size: 64,
            ..header()
        };
        let source = file_with(&overrun, 8);
        assert!(walk(&source, 0, source.size().unwrap()).unwrap_err().is_format_error());

        let overused = BlockHeader {
            offset: 0,
            allocated_size: 4,
            used_size: 8,
            ..header()
        };
        let source = file_with(&overused, 8);
        assert!(walk(&source, 0, source.size().unwrap()).unwrap_err().is_format_error());
    }

    #[test]
    fn streamed_header_without_room_is_a_format_error() {
        let streamed = BlockHeader {
            offset: 0,
            header_size: 200,
            flags: STREAMED,
            ..header()
        };
        let mut file = streamed.to_bytes();
        file.truncate(6 + MIN_HEADER_SIZE as usize);
        let source = AsdfSource::from_bytes(file).unwrap();
        let err = walk(&source, 0, source.size().unwrap()).unwrap_err();
        assert!(err.is_format_error(), "{err}");
    }

    #[test]
    fn index_offsets_past_the_file_are_rejected() {
        let h = BlockHeader {
            offset: 0,
            compression: Compression::None,
            allocated_size: 4,
            used_size: 4,
            data_size: 4,
            ..header()
        };
        let mut file = h.to_bytes();
        file.extend([1u8; 4]);
        file.extend(index_bytes(&[0, u64::MAX]));
        let source = AsdfSource::from_bytes(file).unwrap();
        let size = source.size().unwrap();
        assert!(from_index(&source, 0, size, 1 << 16).is_err());
        // the walk still finds the one real block
        assert_eq!(discover(&source, 0, 1 << 16).unwrap().len(), 1);
    }
}
