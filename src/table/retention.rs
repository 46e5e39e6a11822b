// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Retention-driven purge.
//!
//! With a retention policy of `field` / `valid_for`, every write drops
//! descriptors whose sparse index provably lies outside
//! `[now - valid_for, now]`. Objects whose summary overlaps the window
//! (or carries no information about the field) are always kept.

use super::Table;
use crate::{index::Index, sparse, sparse::Filter, Result};

pub(crate) fn purge_expired(table: &Table, idx: &mut Index) -> Result<bool> {
    let Some(policy) = &table.definition().retention else {
        return Ok(false);
    };

    let window = policy.window()?;

    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    let cutoff = sparse::now_micros() - window.as_micros() as i64;
    let keep = Filter::since(&policy.field, cutoff);

    let expiry = table.quarantine_expiry();
    let mut dropped = 0usize;

    // Indirect blocks first: whole subtrees can be skipped or dropped
    // through their aggregated summaries
    let purged = idx.indirect.purge(
        table.output(),
        table.blocks(),
        &table.part_dir(""),
        &keep,
    )?;

    dropped += purged.dropped_packed.len();

    for path in purged.superseded_blocks {
        idx.quarantine(path, expiry);
    }
    for path in purged.dropped_packed {
        idx.quarantine(path, expiry);
    }

    // Inline descriptors are cheap to test directly
    let mut kept = Vec::with_capacity(idx.inline.len());
    let mut doomed = vec![];

    for desc in std::mem::take(&mut idx.inline) {
        if desc.trailer.sparse.matches_any(&keep) {
            kept.push(desc);
        } else {
            doomed.push(desc.info.path);
        }
    }

    idx.inline = kept;
    dropped += doomed.len();

    for path in doomed {
        idx.quarantine(path, expiry);
    }

    if dropped > 0 {
        log::info!(
            "{}/{}: retention dropped {dropped} objects older than {}",
            table.db(),
            table.name(),
            policy.valid_for,
        );
    }

    Ok(dropped > 0)
}
