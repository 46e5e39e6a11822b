// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Interface to the external packed-object writer.
//!
//! The engine never looks inside source objects; a [`Converter`] turns a
//! batch of opened sources (plus an optional prior object to merge) into
//! one packed object and its trailer.

use crate::{partition::TypedValue, trailer::Trailer};
use std::io::{Read, Write};

/// One opened source object queued for conversion.
pub struct Source {
    /// Store path of the source
    pub path: String,

    /// Entity tag observed when the source was opened
    pub etag: String,

    /// Size in bytes, when known
    pub size: u64,

    /// Explicit format hint from the table definition
    pub format: Option<String>,

    /// Opaque per-pattern hints from the table definition
    pub hints: Option<serde_json::Value>,

    /// Source bytes
    pub body: Box<dyn Read + Send>,
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("path", &self.path)
            .field("etag", &self.etag)
            .field("size", &self.size)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

/// The prior packed object of a partition, handed to the converter so
/// its content is carried into the new object without re-ingesting.
pub struct Prepend {
    /// Prior object bytes
    pub body: Box<dyn Read + Send>,

    /// Prior object trailer
    pub trailer: Trailer,
}

/// One conversion request: sources in, one packed object out.
pub struct Conversion {
    /// Sources to ingest, in input order
    pub sources: Vec<Source>,

    /// Prior object to merge, if the partition has a small tail
    pub prepend: Option<Prepend>,

    /// Partition constants to stamp onto every row
    pub constants: Vec<(String, TypedValue)>,

    /// Compression label for the output
    pub algo: String,

    /// Block alignment for the output
    pub align: usize,
}

/// Writes packed objects.
///
/// Implementations run synchronously inside the engine's worker threads
/// and must be shareable across them.
pub trait Converter: Send + Sync {
    /// Converts `job` into one packed object written to `out`,
    /// returning the object's trailer.
    fn convert(&self, job: Conversion, out: &mut dyn Write) -> Result<Trailer, ConvertError>;
}

/// Conversion failure.
///
/// `fatal` distinguishes poisoned bytes (parse-level errors that will
/// fail identically on every retry) from transient I/O. Fatal failures
/// cause the offending inputs to be remembered as rejected.
#[derive(Debug)]
pub struct ConvertError {
    /// Source object that caused the failure, when attributable
    pub path: Option<String>,

    /// `true` for parse-level poison, `false` for I/O
    pub fatal: bool,

    /// Human-readable cause
    pub reason: String,
}

impl ConvertError {
    /// A parse-level error attributed to one source.
    #[must_use]
    pub fn fatal(path: &str, reason: impl Into<String>) -> Self {
        Self {
            path: Some(path.to_owned()),
            fatal: true,
            reason: reason.into(),
        }
    }

    /// A transient I/O error.
    #[must_use]
    pub fn io(err: &std::io::Error) -> Self {
        Self {
            path: None,
            fatal: false,
            reason: err.to_string(),
        }
    }
}

impl std::fmt::Display for ConvertError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ConvertError({}{}: {})",
            if self.fatal { "fatal" } else { "transient" },
            self.path
                .as_deref()
                .map(|p| format!(", {p}"))
                .unwrap_or_default(),
            self.reason,
        )
    }
}

impl std::error::Error for ConvertError {}
