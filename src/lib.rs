// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Ingest, indexing and compaction engine for object-storage-backed
//! columnar tables.
//!
//! ##### About
//!
//! This crate turns a stream of newly arrived source objects (JSON,
//! newline-delimited records, binary row blobs) into compacted, signed,
//! queryable *packed objects*, together with a sealed per-table *index*
//! listing them and their metadata. The index is the contract between
//! ingest and query: a query engine fetches it, filters descriptors
//! through their sparse summaries, and receives a list of blob URLs.
//!
//! What lives here:
//!
//! * a per-table state machine (definitions, partitions, scanning vs.
//!   incremental append, input deduplication, atomic index replacement
//!   under optimistic etag concurrency),
//! * a queue-driven batched ingest runner multiplexing a notification
//!   queue across all tables of a tenant,
//! * a compaction policy that merges small tail objects ("prepend")
//!   and flushes grown inline manifests into an indirect reference
//!   tree, plus the garbage collection keeping the store free of
//!   orphaned objects,
//! * the glob/capture pattern language used to match source paths and
//!   derive partition keys.
//!
//! The columnar packfile writer itself is external: implement
//! [`Converter`] to plug a format in. Likewise, the notification
//! transport is anything implementing [`Queue`].
//!
//! # Example
//!
//! ```
//! use packdb::{AnyFs, Config, Definition, Key, LocalTenant, MemoryFs, Store};
//! use std::sync::Arc;
//! # use std::io::Read;
//! # struct NullConverter;
//! # impl packdb::Converter for NullConverter {
//! #     fn convert(
//! #         &self,
//! #         mut job: packdb::Conversion,
//! #         out: &mut dyn std::io::Write,
//! #     ) -> Result<packdb::Trailer, packdb::ConvertError> {
//! #         let mut n = 0u64;
//! #         for src in &mut job.sources {
//! #             let mut buf = vec![];
//! #             src.body.read_to_end(&mut buf).map_err(|e| packdb::ConvertError::io(&e))?;
//! #             out.write_all(&buf).map_err(|e| packdb::ConvertError::io(&e))?;
//! #             n += buf.len() as u64;
//! #         }
//! #         Ok(packdb::Trailer { algo: job.algo, decompressed: n, ..Default::default() })
//! #     }
//! # }
//!
//! let fs = MemoryFs::new();
//! let tenant = Arc::new(LocalTenant::new(
//!     "tenant-0",
//!     Key::derive_for_testing("tenant-0"),
//!     AnyFs::from(fs.clone()),
//! ));
//!
//! let store = Store::new(tenant, Config::default(), Arc::new(NullConverter));
//!
//! // A table is defined by a JSON object in the store
//! let def = Definition::from_json(
//!     br#"{"input": [{"pattern": "mem://a-prefix/*.json"}]}"#,
//! )?;
//! packdb::write_definition(&fs, "default", "events", &def)?;
//!
//! // Sync lists the sources, ingests what is new, and seals the index
//! store.sync("default", "events")?;
//! # Ok::<(), packdb::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]

mod blobs;
mod checksum;
mod coding;
mod config;
mod converter;
mod definition;
mod descriptor;
mod error;
mod fs;
mod gc;
mod index;
mod partition;

pub mod pattern;

mod queue;
mod runner;
mod slice;
mod sparse;
mod store;
mod table;
mod tenant;
mod trailer;

pub use blobs::{project as blobs, Blob};
pub use checksum::Checksum;
pub use coding::{Decode, DecodeError, Encode, EncodeError};
pub use config::Config;
pub use converter::{ConvertError, Conversion, Converter, Prepend, Source};
pub use definition::{
    definition_path, index_path, load_definition, table_dir, write_definition, Definition,
    InputSpec, PartitionSpec, PartitionType, RetentionPolicy, MAX_DEFINITION_SIZE,
};
pub use descriptor::{algo_suffix, Descriptor, ObjectInfo, FORMAT_VERSION};
pub use error::{Error, Result};
pub use fs::{
    AnyFs, DirFs, InputFs, MemoryFs, Meta, OutputFs, Precondition, RemoveFs, Upload, WalkFlow,
};
pub use gc::GcConfig;
pub use index::indirect::{BlockRef, IndirectTree, Purged};
pub use index::{
    BlockCache, Index, InputTree, PageRef, Quarantined, UserData, FLAG_SKIP_INPUTS,
    MAX_INDEX_SIZE, REJECTED,
};
pub use partition::{Collector, Group, TypedValue};
pub use pattern::{expand, has_capture, match_pattern, to_glob, Captures, MAX_CAPTURES};
pub use queue::{ItemStatus, Polled, Queue, QueueItem, StatusCell};
pub use runner::{Runner, RunnerConfig, StopSignal};
pub use slice::Slice;
pub use sparse::{CmpOp, FieldRange, Filter, Micros, SparseIndex};
pub use store::Store;
pub use table::Table;
pub use tenant::{Key, LocalTenant, SharedTenant, Tenant};
pub use trailer::{BlockDesc, Trailer};
