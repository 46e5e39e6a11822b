// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! One step of the cursor-driven backfill.
//!
//! A scan step lists each input pattern from its stored cursor, dedups
//! against the fingerprint tree, and collects new sources until an
//! object/byte cap or the step deadline is reached. The cursor always
//! records the last fully processed relative path; a step that reaches
//! the end of every listing clears the table's `scanning` state.

use super::{find_prepend, PartWork, Table};
use crate::{
    converter::Source,
    descriptor::Descriptor,
    fs::{InputFs, WalkFlow},
    index::Index,
    partition::Collector,
    pattern, Error, Result,
};
use rustc_hash::FxHashMap;
use std::time::Instant;

pub(crate) struct Outcome {
    /// Partition-grouped new sources, ready for conversion
    pub work: Vec<PartWork>,

    /// Cursors, flags or hashes changed and must be persisted
    pub changed: bool,

    /// The step actually walked listings (the table was scanning)
    pub walked: bool,
}

struct GroupMeta {
    target_id: i64,
    prepend: Option<(usize, Descriptor)>,

    /// Set once the first new source of the group is accepted
    committed: bool,
}

pub(crate) fn step(table: &Table, idx: &mut Index) -> Result<Outcome> {
    let def = table.definition();
    let mut changed = false;

    // A changed definition invalidates all listing progress
    let hash = def.hash();
    if idx.user_data.definition_hash != hash {
        log::info!(
            "{}/{}: definition changed, restarting backfill",
            table.db(),
            table.name(),
        );
        idx.user_data.definition_hash = hash;
        idx.cursors = vec![String::new(); def.inputs.len()];
        idx.scanning = !def.skip_backfill;
        changed = true;
    } else if idx.cursors.len() != def.inputs.len() {
        idx.cursors = vec![String::new(); def.inputs.len()];
        idx.scanning = true;
        changed = true;
    }

    if !idx.scanning {
        return Ok(Outcome {
            work: vec![],
            changed,
            walked: false,
        });
    }

    let mut collector = Collector::new(&def.partitions)?;
    let mut meta_by_key: FxHashMap<String, GroupMeta> = FxHashMap::default();
    let mut extra: i64 = 0;

    let deadline = Instant::now() + table.config().max_scan_time;
    let max_objects = table.config().max_scan_objects;
    let max_bytes = table.config().max_scan_bytes;
    let min_merge = table.config().min_merge_size;

    let mut total_objects = 0usize;
    let mut total_bytes = 0u64;
    let mut completed = true;

    for (i, spec) in def.inputs.iter().enumerate() {
        let Some((scheme, _)) = spec.pattern.split_once("://") else {
            return Err(Error::BadPattern("input pattern is not a URI"));
        };

        let (infs, pat) = table.tenant().split(&spec.pattern)?;
        let glob = pattern::to_glob(&pat)?;

        let mut cursor = idx.cursors.get(i).cloned().unwrap_or_default();
        // Legacy cursors occasionally carried a trailing slash
        while cursor.ends_with('/') {
            cursor.pop();
        }

        let start = cursor.clone();
        let mut stopped = false;

        infs.walk(&glob, &start, &mut |path, meta| {
            if Instant::now() > deadline {
                stopped = true;
                return Ok(WalkFlow::Stop);
            }

            // Globbed listings overmatch; captures are the authority
            let key = match collector.key_of(&pat, path) {
                Ok(Some(key)) => key,
                Ok(None) => {
                    cursor = path.to_owned();
                    return Ok(WalkFlow::Continue);
                }
                Err(e) => {
                    log::warn!("{}: skipping {path}: {e}", table.name());
                    cursor = path.to_owned();
                    return Ok(WalkFlow::Continue);
                }
            };

            // Assign or reuse the partition's descriptor ordinal. Fresh
            // ids stay provisional until a source is actually accepted,
            // so that groups emptied by dedup never consume one
            if !meta_by_key.contains_key(&key) {
                let prepend = find_prepend(idx, &table.part_dir(&key), min_merge);

                meta_by_key.insert(
                    key.clone(),
                    GroupMeta {
                        target_id: 0,
                        prepend,
                        committed: false,
                    },
                );
            }

            let target_id = {
                #[allow(clippy::expect_used)]
                let group = meta_by_key.get(&key).expect("entry was just ensured");

                if group.committed {
                    group.target_id
                } else {
                    #[allow(clippy::cast_possible_wrap)]
                    match &group.prepend {
                        Some((pos, _)) => idx.indirect.orig_objects() as i64 + *pos as i64,
                        None => idx.objects() as i64 + extra,
                    }
                }
            };

            let uri = format!("{scheme}://{path}");

            match idx.inputs.append(table.output(), &uri, &meta.etag, target_id) {
                Ok(true) => {}
                Ok(false) => {
                    cursor = path.to_owned();
                    return Ok(WalkFlow::Continue);
                }
                Err(Error::ETagChanged(p)) => {
                    log::warn!("{}: {p} changed out-of-band, skipping", table.name());
                    cursor = path.to_owned();
                    return Ok(WalkFlow::Continue);
                }
                Err(e) => return Err(e),
            }

            // The first accepted source commits the group: its id
            // becomes real, its merge target gets quarantined
            #[allow(clippy::expect_used)]
            let group = meta_by_key.get_mut(&key).expect("entry was just ensured");
            if !group.committed {
                group.committed = true;
                group.target_id = target_id;
                match &group.prepend {
                    Some((_, desc)) => {
                        let doomed = desc.info.path.clone();
                        idx.quarantine(doomed, table.quarantine_expiry());
                    }
                    None => extra += 1,
                }
            }

            let body = infs.open_object(path)?;

            collector.add(
                &pat,
                Source {
                    path: uri,
                    etag: meta.etag.clone(),
                    size: meta.size,
                    format: spec.format.clone(),
                    hints: spec.hints.clone(),
                    body,
                },
            )?;

            total_objects += 1;
            total_bytes += meta.size;
            cursor = path.to_owned();

            if total_objects >= max_objects || total_bytes >= max_bytes {
                stopped = true;
                return Ok(WalkFlow::Stop);
            }

            Ok(WalkFlow::Continue)
        })?;

        if idx.cursors.get(i) != Some(&cursor) {
            if let Some(slot) = idx.cursors.get_mut(i) {
                *slot = cursor;
            }
            changed = true;
        }

        if stopped {
            completed = false;
            break;
        }
    }

    if idx.scanning == completed {
        changed = true;
    }
    idx.scanning = !completed;

    let (count, bytes) = collector.total();
    if count > 0 {
        log::debug!(
            "{}/{}: scan step collected {count} objects ({bytes} B), complete={completed}",
            table.db(),
            table.name(),
        );
    }

    // Pair every surviving group with its ordinal and merge target
    let work = collector
        .into_groups()
        .into_iter()
        .filter(|group| !group.sources.is_empty())
        .map(|group| {
            let meta = meta_by_key.remove(&group.prefix).unwrap_or(GroupMeta {
                target_id: 0,
                prepend: None,
                committed: true,
            });

            PartWork {
                prefix: group.prefix,
                constants: group.constants,
                sources: group.sources,
                target_id: meta.target_id,
                prepend: meta.prepend,
            }
        })
        .collect();

    Ok(Outcome {
        work,
        changed,
        walked: true,
    })
}
