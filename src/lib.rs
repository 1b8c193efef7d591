pub mod array;
mod block;
pub mod codec;
pub mod dtype;
mod error;
pub mod info;
pub mod node;
pub mod options;
pub mod schema;
pub mod storage;
pub mod tag;
pub mod time;
pub mod tree;
pub mod unit;
mod write;

pub use zarrs;

pub use array::{ArrayBlock, NdArray};
pub use block::BlockHeader;
pub use codec::Compression;
pub use dtype::{ByteOrder, DType};
pub use error::{Error, Result};
pub use info::InfoOptions;
pub use node::{Group, Item, Node, NodeKind, Scalar};
pub use options::{OpenOptions, WriteOptions};
pub use schema::{SchemaRegistry, Validator};
pub use tag::Tag;
pub use time::{TimeDelta, TimeScale, TimeUnit, TimeValue};
pub use tree::{AsdfFile, Tree};
pub use unit::{Magnitude, Quantity, Unit};
