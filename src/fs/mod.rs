// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Filesystem abstractions for pluggable storage backends.
//!
//! Everything the engine touches is an [`InputFs`]; writable stores are
//! additionally an [`OutputFs`] and a [`RemoveFs`]. Paths are `/`-separated
//! strings rooted at the filesystem root, never absolute OS paths.

pub mod dir;
pub mod memory;

pub use dir::DirFs;
pub use memory::MemoryFs;

use crate::{sparse::Micros, Result};
use enum_dispatch::enum_dispatch;
use std::io::{Read, Write};

/// Store metadata of one object.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Meta {
    /// Entity tag; changes whenever the object content changes
    pub etag: String,

    /// Object size in bytes
    pub size: u64,

    /// Last modification time (µs)
    pub last_modified: Micros,
}

/// Flow control for [`InputFs::walk`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WalkFlow {
    /// Keep walking
    Continue,

    /// Stop the walk without error
    Stop,
}

/// Expectation for a conditional overwrite.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Precondition {
    /// Unconditional write
    None,

    /// The object must not exist yet
    Absent,

    /// The object must currently carry this etag
    MatchETag(String),
}

/// Streaming upload of one object.
///
/// Dropping an unfinished upload must leave no visible object behind;
/// `abort` additionally releases any multi-part state eagerly.
pub trait Upload: Write + Send {
    /// Completes the upload, making the object visible, and returns
    /// its store metadata.
    fn finish(&mut self) -> Result<Meta>;

    /// Releases the upload without making the object visible.
    fn abort(&mut self) -> Result<()>;
}

/// Read access to an object store.
#[enum_dispatch]
pub trait InputFs {
    /// Opens an object for reading.
    fn open_object(&self, path: &str) -> Result<Box<dyn Read + Send>>;

    /// Returns store metadata for an object.
    fn stat(&self, path: &str) -> Result<Meta>;

    /// Visits objects matching `glob` in lexicographic path order,
    /// starting strictly after `start_after` (`""` = from the beginning).
    fn walk(
        &self,
        glob: &str,
        start_after: &str,
        visit: &mut dyn FnMut(&str, &Meta) -> Result<WalkFlow>,
    ) -> Result<()>;

    /// Synthesizes a fetchable URL for an object.
    fn url(&self, path: &str, etag: &str) -> Result<String>;
}

/// Write access to an object store.
#[enum_dispatch]
pub trait OutputFs: InputFs {
    /// Writes a whole object, returning its new metadata.
    fn put(&self, path: &str, body: &[u8]) -> Result<Meta>;

    /// Writes a whole object subject to a precondition.
    ///
    /// A failed precondition surfaces as [`crate::Error::SyncViolation`].
    fn put_cond(&self, path: &str, body: &[u8], expect: &Precondition) -> Result<Meta>;

    /// Starts a streaming upload.
    fn start_upload(&self, path: &str) -> Result<Box<dyn Upload>>;
}

/// Delete access to an object store.
#[enum_dispatch]
pub trait RemoveFs {
    /// Removes an object. Removing a missing object is an error
    /// (`NotFound`); garbage collection treats that as success.
    fn remove(&self, path: &str) -> Result<()>;
}

/// A concrete filesystem, statically dispatched.
#[enum_dispatch(InputFs, OutputFs, RemoveFs)]
#[derive(Clone)]
pub enum AnyFs {
    /// Local directory tree (dev loopback)
    Dir(DirFs),

    /// In-memory store with exact conditional-write semantics
    Memory(MemoryFs),
}

impl std::fmt::Debug for AnyFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dir(_) => write!(f, "AnyFs::Dir"),
            Self::Memory(_) => write!(f, "AnyFs::Memory"),
        }
    }
}

// Paths handed to the filesystems must stay inside the root.
pub(crate) fn check_path(path: &str) -> Result<()> {
    if path.is_empty()
        || path.starts_with('/')
        || path
            .split('/')
            .any(|seg| seg.is_empty() || seg == "." || seg == "..")
    {
        return Err(crate::Error::Corrupt("invalid object path"));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn path_check() {
        assert!(check_path("db/default/t/index").is_ok());
        assert!(check_path("").is_err());
        assert!(check_path("/abs").is_err());
        assert!(check_path("a//b").is_err());
        assert!(check_path("a/../b").is_err());
        assert!(check_path("a/./b").is_err());
    }
}
