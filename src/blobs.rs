// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Projection of an index into a flat blob list for query consumers.

use crate::{
    fs::InputFs,
    index::{BlockCache, Index},
    sparse::{Filter, Micros},
    trailer::Trailer,
    Result,
};
use rustc_hash::FxHashMap;

/// One fetchable packed object.
#[derive(Clone, Debug)]
pub struct Blob {
    /// Fetch URL synthesized by the store
    pub url: String,

    /// Object etag
    pub etag: String,

    /// Compressed size in bytes
    pub size: u64,

    /// Last modification time (µs)
    pub last_modified: Micros,

    /// `true` if the object may be rewritten by the next ingest;
    /// consumers must treat the reference as short-lived
    pub ephemeral: bool,

    /// Block layout and sparse index of the object
    pub trailer: Trailer,
}

/// Lists the blobs of `idx` that may satisfy `filter`.
///
/// The single small tail object of each partition is marked ephemeral:
/// the next ingest may replace it with a merged successor.
pub fn project(
    fs: &impl InputFs,
    cache: &BlockCache,
    idx: &Index,
    filter: &Filter,
    min_merge_size: u64,
) -> Result<Vec<Blob>> {
    let mut out = vec![];

    for desc in idx.indirect.search(fs, cache, filter)? {
        out.push(Blob {
            url: fs.url(&desc.info.path, &desc.info.etag)?,
            etag: desc.info.etag,
            size: desc.info.size,
            last_modified: desc.info.last_modified,
            ephemeral: false,
            trailer: desc.trailer,
        });
    }

    // The mergeable tail per partition is the last inline descriptor
    let mut tail_of: FxHashMap<&str, usize> = FxHashMap::default();
    for (i, desc) in idx.inline.iter().enumerate() {
        tail_of.insert(desc.partition_dir(), i);
    }

    for (i, desc) in idx.inline.iter().enumerate() {
        if !filter.is_trivial() && !desc.trailer.sparse.matches_any(filter) {
            continue;
        }

        let ephemeral = tail_of.get(desc.partition_dir()) == Some(&i)
            && desc.info.size < min_merge_size;

        out.push(Blob {
            url: fs.url(&desc.info.path, &desc.info.etag)?,
            etag: desc.info.etag.clone(),
            size: desc.info.size,
            last_modified: desc.info.last_modified,
            ephemeral,
            trailer: desc.trailer.clone(),
        });
    }

    Ok(out)
}
