use zarrs::storage::StorageError;

use crate::node::NodeKind;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The byte stream is not a recognisable ASDF container.
    #[error("invalid ASDF format: {0}")]
    Format(String),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    /// The tree does not conform to the requested schema.
    #[error("tree does not conform to schema {schema}: {}", failures.join("; "))]
    Validation {
        schema: String,
        failures: Vec<String>,
    },
    #[error("no key {key:?} in {path:?}")]
    KeyNotFound { key: String, path: String },
    #[error("index {index} out of range for sequence {path:?} of length {len}")]
    IndexOutOfRange {
        index: usize,
        len: usize,
        path: String,
    },
    /// A group-only operation was applied to another kind of node.
    #[error("{path:?} is a {kind:?}, not a group")]
    NotAGroup { path: String, kind: NodeKind },
    #[error("{path:?} is a {found:?}, expected {expected}")]
    WrongKind {
        path: String,
        expected: &'static str,
        found: NodeKind,
    },
    #[error("incompatible units: {left:?} and {right:?}")]
    IncompatibleUnits { left: String, right: String },
    #[error("cannot compare times in scales {left} and {right}")]
    IncompatibleScales { left: String, right: String },
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The store returned fewer bytes than the block header promised.
    #[error("truncated read of {context}: expected {expected} bytes, got {found}")]
    Truncated {
        context: String,
        expected: u64,
        found: u64,
    },
    #[error("{0}")]
    General(String),
    #[error(transparent)]
    Wrapped(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    pub fn general(message: impl Into<String>) -> Self {
        Self::General(message.into())
    }

    pub fn format(message: impl Into<String>) -> Self {
        Self::Format(message.into())
    }

    pub fn wrap(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Wrapped(Box::new(error))
    }

    /// The container could not be parsed at all.
    pub fn is_format_error(&self) -> bool {
        matches!(self, Self::Format(_) | Self::Yaml(_))
    }

    pub fn is_key_error(&self) -> bool {
        matches!(self, Self::KeyNotFound { .. } | Self::IndexOutOfRange { .. })
    }

    pub fn is_type_error(&self) -> bool {
        matches!(self, Self::NotAGroup { .. } | Self::WrongKind { .. })
    }

    /// The failure came from the backing store rather than the data.
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Storage(_) | Self::Io(_) | Self::Truncated { .. }
        )
    }
}
