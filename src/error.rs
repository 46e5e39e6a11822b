// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{DecodeError, EncodeError},
    converter::ConvertError,
};

/// Represents errors that can occur in the ingest engine
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// Decompression failed
    Decompress,

    /// Malformed glob pattern
    BadPattern(&'static str),

    /// Malformed template, or a template referenced an undefined capture
    BadTemplate(String),

    /// Invalid table definition
    BadDefinition(String),

    /// The index seal did not verify under the tenant key
    SealMismatch,

    /// The on-disk index has a format version this build cannot read
    IndexObsolete(u8),

    /// The encoded index exceeded the maximum size
    IndexTooLarge(usize),

    /// An object was overwritten out-of-band (path)
    ETagChanged(String),

    /// The cached index etag disagrees with the store; reload and retry
    SyncViolation(String),

    /// Conversion of a source object failed
    Convert(ConvertError),

    /// The table is partially built; re-invoke the same operation later
    BuildAgain,

    /// GC ran past its soft budget; a resumption cursor was persisted
    LongGc,

    /// Permission denied by the object store
    Permission(String),

    /// An URI scheme or format this build does not support
    Unsupported(&'static str),

    /// Invariant violation in on-disk or in-memory state
    Corrupt(&'static str),

    /// Multiple tables failed independently
    Multi(Vec<Error>),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PackDbError: {self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            Self::Convert(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

impl From<ConvertError> for Error {
    fn from(value: ConvertError) -> Self {
        Self::Convert(value)
    }
}

impl Error {
    /// Returns `true` if the error is a not-found condition.
    #[must_use]
    pub fn is_not_exist(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }

    /// Returns `true` if the error is a permission failure, which stops
    /// the queue runner so operators can fix the store policy.
    #[must_use]
    pub fn is_permission(&self) -> bool {
        matches!(self, Self::Permission(_))
            || matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied)
    }

    /// Returns `true` if an index load failure may be handled by
    /// starting from a fresh empty index.
    ///
    /// A missing index, an unverifiable seal and an unreadable format
    /// version are all equivalent to "no usable index on disk".
    #[must_use]
    pub fn is_recoverable_load(&self) -> bool {
        self.is_not_exist() || matches!(self, Self::SealMismatch | Self::IndexObsolete(_))
    }

    pub(crate) fn not_exist(path: &str) -> Self {
        Self::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            path.to_owned(),
        ))
    }
}

/// Crate result
pub type Result<T> = std::result::Result<T, Error>;
