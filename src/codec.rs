use std::io::{Read, Write};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Upper bound on the up-front allocation, as a multiple of the compressed size.
const MAX_RATIO_HINT: usize = 16;

/// ASDF block compression, as named by the 4-byte field of the block header.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Uncompressed.
    #[default]
    None,
    Zlib,
    Bzp2,
    Lz4,
}

impl Compression {
    pub fn from_header(label: [u8; 4]) -> Result<Self> {
        match &label {
            [0, 0, 0, 0] => Ok(Self::None),
            b"zlib" => Ok(Self::Zlib),
            b"bzp2" => Ok(Self::Bzp2),
            b"lz4\0" => Ok(Self::Lz4),
            other => Err(Error::format(format!(
                "unknown block compression {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    pub fn to_header(self) -> [u8; 4] {
        match self {
            Self::None => [0; 4],
            Self::Zlib => *b"zlib",
            Self::Bzp2 => *b"bzp2",
            Self::Lz4 => *b"lz4\0",
        }
    }

    /// Inflate a block's used bytes into `data_size` bytes of array data.
    ///
    /// A payload that does not decompress is a format error, as is one that
    /// inflates to anything other than `data_size` bytes.
    pub fn decode(self, used: Bytes, data_size: u64) -> Result<Bytes> {
        let capacity = usize::try_from(data_size)
            .unwrap_or(usize::MAX)
            .min(used.len().saturating_mul(MAX_RATIO_HINT));
        let mut out = Vec::with_capacity(capacity);
        // one byte more than declared is enough to notice an oversized payload
        let limit = data_size.saturating_add(1);
        let inflated = match self {
            Self::None => return Ok(used),
            Self::Zlib => flate2::read::ZlibDecoder::new(used.as_ref())
                .take(limit)
                .read_to_end(&mut out),
            Self::Bzp2 => bzip2::read::BzDecoder::new(used.as_ref())
                .take(limit)
                .read_to_end(&mut out),
            // TODO: lz4 blocks are framed per chunk; needs a frame reader.
            Self::Lz4 => {
                return Err(Error::Unsupported("lz4 block compression".into()));
            }
        };
        if let Err(e) = inflated {
            return Err(Error::format(format!("corrupt {self:?} block: {e}")));
        }
        if out.len() as u64 != data_size {
            return Err(Error::format(format!(
                "decompressed block has {} bytes, header declares {data_size}",
                out.len()
            )));
        }
        Ok(Bytes::from(out))
    }

    pub fn encode(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Zlib => {
                let mut enc =
                    flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                enc.write_all(data)?;
                Ok(enc.finish()?)
            }
            Self::Bzp2 => {
                let mut enc = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::best());
                enc.write_all(data)?;
                Ok(enc.finish()?)
            }
            Self::Lz4 => Err(Error::Unsupported("lz4 block compression".into())),
        }
    }
}
