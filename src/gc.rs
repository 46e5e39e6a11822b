// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Three-mode garbage collector.
//!
//! 1. *Precise*: deletes quarantined objects past their expiry.
//! 2. *Packed sweep*: deletes `packed-*` objects no index entry
//!    references, once they are old enough that no in-flight writer or
//!    reader can still hold them.
//! 3. *Page sweep*: same for `inputs-*` fingerprint pages and `refs-*`
//!    descriptor blocks.
//!
//! Deletion is idempotent: an object already gone counts as collected.

use crate::{
    config::Config,
    definition::table_dir,
    fs::{AnyFs, InputFs, RemoveFs, WalkFlow},
    index::{BlockCache, Index, Quarantined},
    sparse::{now_micros, Filter, Micros},
    Error, Result,
};
use rustc_hash::{FxHashMap, FxHashSet};
use std::time::{Duration, Instant};

/// Age and budget knobs of the collector.
#[derive(Clone, Debug)]
pub struct GcConfig {
    /// Unreferenced packed objects younger than this are kept
    pub minimum_age: Duration,

    /// Unreferenced page objects younger than this are kept
    pub input_minimum_age: Duration,

    /// Soft wall-clock budget for a sweep before it persists a
    /// resumption cursor
    pub max_delay: Duration,
}

impl From<&Config> for GcConfig {
    fn from(config: &Config) -> Self {
        Self {
            minimum_age: config.gc_minimum_age,
            input_minimum_age: config.input_minimum_age,
            max_delay: config.gc_max_delay,
        }
    }
}

/// Deletes quarantined objects past their expiry, one deletion task per
/// entry. Entries whose deletion failed (other than not-found) are
/// re-queued. Returns `true` if the quarantine list shrank.
pub fn precise(fs: &AnyFs, idx: &mut Index) -> bool {
    let now = now_micros();
    let before = idx.to_delete.len();

    let (due, keep): (Vec<Quarantined>, Vec<Quarantined>) = std::mem::take(&mut idx.to_delete)
        .into_iter()
        .partition(|entry| entry.expiry <= now);

    idx.to_delete = keep;

    if due.is_empty() {
        return false;
    }

    let (tx, rx) = std::sync::mpsc::channel::<Quarantined>();

    std::thread::scope(|scope| {
        for entry in due {
            let tx = tx.clone();
            scope.spawn(move || match fs.remove(&entry.path) {
                Ok(()) => {}
                Err(e) if e.is_not_exist() => {}
                Err(e) => {
                    log::warn!("gc: cannot delete {}: {e}", entry.path);
                    let _ = tx.send(entry);
                }
            });
        }
        drop(tx);
    });

    idx.to_delete.extend(rx.into_iter());

    idx.to_delete.len() < before
}

/// Runs the packed-object sweep followed by the page sweep.
///
/// When the packed sweep exceeds its budget, the next directory to
/// visit is persisted into the index user data and [`Error::LongGc`] is
/// returned; the caller flushes the index and schedules another pass.
pub fn sweep(
    fs: &AnyFs,
    cache: &BlockCache,
    db: &str,
    table: &str,
    idx: &mut Index,
    config: &GcConfig,
) -> Result<()> {
    sweep_packed(fs, cache, idx, config)?;
    sweep_pages(fs, db, table, idx, config)
}

fn sweep_packed(
    fs: &AnyFs,
    cache: &BlockCache,
    idx: &mut Index,
    config: &GcConfig,
) -> Result<()> {
    let start = Instant::now();
    let now = now_micros();

    // Referenced base names per partition directory. Base names carry
    // random suffixes, so membership per directory is unambiguous.
    let mut referenced: FxHashMap<String, FxHashSet<String>> = FxHashMap::default();

    for desc in idx
        .inline
        .iter()
        .cloned()
        .chain(idx.indirect.search(fs, cache, &Filter::All)?)
    {
        referenced
            .entry(desc.partition_dir().to_owned())
            .or_default()
            .insert(desc.base_name().to_owned());
    }

    let mut dirs: Vec<&String> = referenced.keys().collect();
    dirs.sort_unstable();

    let cursor = idx.user_data.packed_gc_cursor.clone();

    for dir in dirs {
        // Resume after an interrupted sweep
        if dir.as_str() < cursor.as_str() {
            continue;
        }

        if start.elapsed() > config.max_delay {
            log::debug!("gc: budget exhausted, resuming at {dir}");
            idx.user_data.packed_gc_cursor = dir.clone();
            return Err(Error::LongGc);
        }

        #[allow(clippy::expect_used)]
        let names = referenced.get(dir).expect("dir key comes from the map");

        remove_unreferenced(
            fs,
            &format!("{dir}/packed-*"),
            names,
            now,
            config.minimum_age,
        )?;
    }

    idx.user_data.packed_gc_cursor = String::new();

    Ok(())
}

fn sweep_pages(
    fs: &AnyFs,
    db: &str,
    table: &str,
    idx: &mut Index,
    config: &GcConfig,
) -> Result<()> {
    let now = now_micros();
    let dir = table_dir(db, table);

    let mut referenced = FxHashSet::default();
    idx.inputs.each_page(|page| {
        referenced.insert(base_name(&page.path).to_owned());
    });
    idx.indirect.each_ref(|block| {
        referenced.insert(base_name(&block.path).to_owned());
    });

    for glob in [format!("{dir}/inputs-*"), format!("{dir}/refs-*")] {
        remove_unreferenced(fs, &glob, &referenced, now, config.input_minimum_age)?;
    }

    Ok(())
}

fn remove_unreferenced(
    fs: &AnyFs,
    glob: &str,
    referenced: &FxHashSet<String>,
    now: Micros,
    minimum_age: Duration,
) -> Result<()> {
    let mut doomed = vec![];

    fs.walk(glob, "", &mut |path, meta| {
        if referenced.contains(base_name(path)) {
            return Ok(WalkFlow::Continue);
        }

        let age = now.saturating_sub(meta.last_modified);
        if age < min_age_micros(minimum_age) {
            return Ok(WalkFlow::Continue);
        }

        doomed.push(path.to_owned());
        Ok(WalkFlow::Continue)
    })?;

    for path in doomed {
        log::debug!("gc: removing orphan {path}");
        match fs.remove(&path) {
            Ok(()) => {}
            Err(e) if e.is_not_exist() => {}
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

fn base_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => path.get(i + 1..).unwrap_or_default(),
        None => path,
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn min_age_micros(age: Duration) -> Micros {
    age.as_micros() as Micros
}
