// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-table controller: index load/cache, optimistic-concurrency
//! writes, deduplicated appends, compaction and GC hookup.

pub mod retention;
pub mod scan;

use crate::{
    config::Config,
    converter::{ConvertError, Conversion, Converter, Prepend, Source},
    definition::{index_path, table_dir, Definition},
    descriptor::{packed_name, Descriptor, ObjectInfo, FORMAT_VERSION},
    fs::{AnyFs, InputFs, OutputFs, Precondition},
    gc,
    index::{BlockCache, Index, REJECTED},
    partition::{Group, TypedValue},
    sparse::{now_micros, Filter, Micros},
    tenant::SharedTenant,
    Error, Result,
};
use std::io::Read;
use std::sync::{Arc, Mutex};

/// Index state checked out by the running operation.
struct OpIndex {
    idx: Box<Index>,

    /// Store etag observed at load; `""` means "the index must not
    /// exist yet"
    etag: String,

    /// Set on fresh loads: we may have crashed mid-transaction, so the
    /// next write should collect garbage first
    should_gc: bool,
}

#[derive(Default)]
struct CacheSlot {
    state: Option<OpIndex>,
}

/// One partition's worth of work for the converter.
pub(crate) struct PartWork {
    pub prefix: String,
    pub constants: Vec<(String, TypedValue)>,
    pub sources: Vec<Source>,

    /// Descriptor ordinal recorded for the partition's inputs
    #[allow(dead_code)]
    pub target_id: i64,

    /// Inline position and copy of the descriptor being merged over
    pub prepend: Option<(usize, Descriptor)>,
}

/// Per-(db, table) controller.
///
/// All operations on one table are serialized by the caller (the queue
/// runner processes one batch at a time per table); the embedded cache
/// is a checkout slot, not a concurrency mechanism.
pub struct Table {
    tenant: SharedTenant,
    db: String,
    name: String,
    def: Arc<Definition>,
    config: Config,
    converter: Arc<dyn Converter>,
    ofs: AnyFs,
    cache: Mutex<CacheSlot>,
    block_cache: Arc<BlockCache>,
}

impl Table {
    /// Opens a table controller.
    ///
    /// Feature flags of the definition are applied to a private copy of
    /// `config`; the shared configuration is never mutated.
    pub fn open(
        tenant: SharedTenant,
        db: &str,
        name: &str,
        def: Definition,
        config: &Config,
        converter: Arc<dyn Converter>,
    ) -> Result<Self> {
        def.validate()?;

        let mut config = config.clone();
        def.apply_features(&mut config);

        let ofs = tenant.root().clone();

        Ok(Self {
            tenant,
            db: db.into(),
            name: name.into(),
            def: Arc::new(def),
            config,
            converter,
            ofs,
            cache: Mutex::new(CacheSlot::default()),
            block_cache: Arc::new(BlockCache::default()),
        })
    }

    /// Database name.
    #[must_use]
    pub fn db(&self) -> &str {
        &self.db
    }

    /// Table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The definition the controller was opened with.
    #[must_use]
    pub fn definition(&self) -> &Definition {
        &self.def
    }

    /// The per-table configuration (feature flags applied).
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn tenant(&self) -> &SharedTenant {
        &self.tenant
    }

    pub(crate) fn output(&self) -> &AnyFs {
        &self.ofs
    }

    pub(crate) fn blocks(&self) -> &BlockCache {
        &self.block_cache
    }

    fn dir(&self) -> String {
        table_dir(&self.db, &self.name)
    }

    fn index_path(&self) -> String {
        index_path(&self.db, &self.name)
    }

    pub(crate) fn part_dir(&self, prefix: &str) -> String {
        if prefix.is_empty() {
            self.dir()
        } else {
            format!("{}/{prefix}", self.dir())
        }
    }

    pub(crate) fn quarantine_expiry(&self) -> Micros {
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let age = self.config.gc_minimum_age.as_micros() as Micros;
        now_micros() + age
    }

    // ---- load & cache -------------------------------------------------

    fn take_cached(&self) -> Option<OpIndex> {
        #[allow(clippy::expect_used)]
        self.cache.lock().expect("lock is poisoned").state.take()
    }

    fn restore(&self, state: OpIndex) {
        #[allow(clippy::expect_used)]
        let mut slot = self.cache.lock().expect("lock is poisoned");
        slot.state = Some(state);
    }

    /// Drops any cached index state so the next operation reloads.
    pub fn invalidate(&self) {
        #[allow(clippy::expect_used)]
        let mut slot = self.cache.lock().expect("lock is poisoned");
        slot.state = None;
    }

    /// Checks the index out of the cache, loading and verifying it from
    /// the store when the cache is cold.
    fn load_index(&self) -> Result<OpIndex> {
        if let Some(state) = self.take_cached() {
            return Ok(state);
        }

        let path = self.index_path();
        let meta = self.ofs.stat(&path)?;

        let mut body = vec![];
        self.ofs.open_object(&path)?.read_to_end(&mut body)?;

        let idx = Index::decode(self.tenant.key(), &body, 0)?;

        log::trace!(
            "{}/{}: loaded index etag={} objects={}",
            self.db,
            self.name,
            meta.etag,
            idx.objects(),
        );

        Ok(OpIndex {
            idx: Box::new(idx),
            etag: meta.etag,
            should_gc: true,
        })
    }

    /// A fresh, empty index for a table with no usable index object.
    fn fresh_index(&self) -> OpIndex {
        let mut idx = Index::new(&self.name, &self.config.algo, self.def.hash());
        idx.scanning = !self.def.skip_backfill;
        idx.cursors = vec![String::new(); self.def.inputs.len()];

        OpIndex {
            idx: Box::new(idx),
            etag: String::new(),
            should_gc: false,
        }
    }

    // ---- write & concurrency ------------------------------------------

    /// Seals and writes the index under optimistic concurrency.
    ///
    /// At most one of two racing writers can succeed; the loser observes
    /// [`Error::SyncViolation`], reloads and retries. The cache is
    /// populated on success and stays invalidated on failure.
    fn write_index(&self, mut state: OpIndex) -> Result<()> {
        let path = self.index_path();

        // Cheap pre-check with a clear verdict before the conditional
        // write; the write itself re-checks
        match self.ofs.stat(&path) {
            Ok(meta) => {
                if state.etag.is_empty() || meta.etag != state.etag {
                    return Err(Error::SyncViolation(path));
                }
            }
            Err(e) if e.is_not_exist() => {
                if !state.etag.is_empty() {
                    return Err(Error::SyncViolation(path));
                }
            }
            Err(e) => return Err(e),
        }

        let body = state.idx.encode(self.tenant.key())?;

        let expect = if state.etag.is_empty() {
            Precondition::Absent
        } else {
            Precondition::MatchETag(state.etag.clone())
        };

        let meta = self.ofs.put_cond(&path, &body, &expect)?;

        log::debug!(
            "{}/{}: wrote index etag={} objects={} ({} B)",
            self.db,
            self.name,
            meta.etag,
            state.idx.objects(),
            body.len(),
        );

        state.etag = meta.etag;
        state.should_gc = false;
        self.restore(state);

        Ok(())
    }

    /// Syncs staged tree state and writes the index.
    fn flush(&self, mut state: OpIndex) -> Result<()> {
        let dir = self.dir();
        let expiry = self.quarantine_expiry();

        state
            .idx
            .sync_inputs(&self.ofs, &dir, self.config.max_inputs_per_page, expiry)?;
        state.idx.sync_outputs(
            &self.ofs,
            &self.block_cache,
            &dir,
            self.config.max_inline_bytes,
            self.config.target_merge_size,
            expiry,
        )?;

        self.write_index(state)
    }

    // ---- append -------------------------------------------------------

    /// Ingests partition-grouped sources.
    ///
    /// Returns [`Error::BuildAgain`] while the table's initial backfill
    /// is still running; callers re-enqueue the same batch later.
    pub fn append(&self, parts: Vec<Group>) -> Result<()> {
        let mut state = match self.load_index() {
            Ok(state) => state,
            Err(e) if e.is_recoverable_load() => {
                if !self.def.skip_backfill {
                    // Start the backfill instead; the caller retries
                    let state = self.fresh_index();
                    self.scan_state(state, true)?;
                    self.invalidate();
                    return Err(Error::BuildAgain);
                }
                self.fresh_index()
            }
            Err(e) => return Err(e),
        };

        self.run_gc(&mut state);

        if state.idx.scanning && !self.def.skip_backfill {
            self.scan_state(state, true)?;
            self.invalidate();
            return Err(Error::BuildAgain);
        }

        let work = self.dedup(&mut state, parts)?;

        if work.is_empty() {
            // Nothing new; keep the (possibly GC-trimmed) state cached
            self.restore(state);
            return Ok(());
        }

        self.force(state, work)
    }

    /// Dedups sources against the fingerprint tree and picks per-
    /// partition merge targets.
    fn dedup(&self, state: &mut OpIndex, parts: Vec<Group>) -> Result<Vec<PartWork>> {
        let idx = &mut state.idx;
        let mut work = vec![];
        let mut extra: i64 = 0;

        for group in parts {
            let prepend = find_prepend(
                idx,
                &self.part_dir(&group.prefix),
                self.config.min_merge_size,
            );

            #[allow(clippy::cast_possible_wrap)]
            let target_id = match &prepend {
                Some((pos, _)) => idx.indirect.orig_objects() as i64 + *pos as i64,
                None => {
                    let id = idx.objects() as i64 + extra;
                    extra += 1;
                    id
                }
            };

            idx.inputs
                .prefetch(&self.ofs, group.sources.iter().map(|s| s.path.as_str()))?;

            let mut sources = vec![];
            for source in group.sources {
                match idx
                    .inputs
                    .append(&self.ofs, &source.path, &source.etag, target_id)
                {
                    Ok(true) => sources.push(source),
                    Ok(false) => {
                        log::trace!("{}: {} already ingested", self.name, source.path);
                        // Dropping the source closes its reader
                    }
                    Err(Error::ETagChanged(path)) => {
                        log::warn!("{}: {path} changed out-of-band, skipping", self.name);
                    }
                    Err(e) => return Err(e),
                }
            }

            if sources.is_empty() {
                if prepend.is_none() {
                    extra -= 1;
                }
                continue;
            }

            if let Some((_, desc)) = &prepend {
                // The merged successor supersedes this object
                idx.quarantine(desc.info.path.clone(), self.quarantine_expiry());
            }

            work.push(PartWork {
                prefix: group.prefix,
                constants: group.constants,
                sources,
                target_id,
                prepend,
            });
        }

        Ok(work)
    }

    /// Converts every partition concurrently, merges the results into
    /// the index, applies retention and flushes.
    pub(crate) fn force(&self, mut state: OpIndex, work: Vec<PartWork>) -> Result<()> {
        let outcomes: Vec<std::result::Result<Converted, FailedPart>> =
            std::thread::scope(|scope| {
                let handles: Vec<_> = work
                    .into_iter()
                    .map(|part| scope.spawn(move || self.convert_one(part)))
                    .collect();

                handles
                    .into_iter()
                    .map(|h| match h.join() {
                        Ok(outcome) => outcome,
                        Err(_) => Err(FailedPart {
                            error: ConvertError {
                                path: None,
                                fatal: false,
                                reason: "conversion worker panicked".into(),
                            },
                            sources: vec![],
                        }),
                    })
                    .collect()
            });

        let mut converted = vec![];
        let mut failed: Option<FailedPart> = None;
        let mut rejected = vec![];

        for outcome in outcomes {
            match outcome {
                Ok(c) => converted.push(c),
                Err(f) => {
                    if f.error.fatal {
                        rejected.extend(f.sources.iter().cloned());
                    }
                    failed.get_or_insert(f);
                }
            }
        }

        if let Some(f) = failed {
            // The in-memory index holds speculative input stamps for
            // objects that were never written; discard it and remember
            // only the poisoned inputs
            drop(state);
            self.invalidate();
            self.update_failed(&rejected);
            return Err(Error::Convert(f.error));
        }

        let idx = &mut state.idx;

        for c in converted {
            match c.prepend {
                Some(pos) => {
                    if let Some(slot) = idx.inline.get_mut(pos) {
                        *slot = c.desc;
                    } else {
                        return Err(Error::Corrupt("prepend position out of range"));
                    }
                }
                None => idx.inline.push(c.desc),
            }
        }

        idx.created = now_micros();

        retention::purge_expired(self, idx)?;

        self.flush(state)
    }

    fn convert_one(&self, part: PartWork) -> std::result::Result<Converted, FailedPart> {
        let pairs: Vec<(String, String)> = part
            .sources
            .iter()
            .map(|s| (s.path.clone(), s.etag.clone()))
            .collect();

        match self.convert_inner(part) {
            Ok(converted) => Ok(converted),
            Err(error) => Err(FailedPart {
                error,
                sources: pairs,
            }),
        }
    }

    fn convert_inner(&self, part: PartWork) -> std::result::Result<Converted, ConvertError> {
        let out_path = format!(
            "{}/{}",
            self.part_dir(&part.prefix),
            packed_name(&self.config.algo),
        );

        let prepend = match &part.prepend {
            Some((_, desc)) => {
                let body = self
                    .ofs
                    .open_object(&desc.info.path)
                    .map_err(|e| ConvertError {
                        path: Some(desc.info.path.clone()),
                        fatal: false,
                        reason: e.to_string(),
                    })?;
                Some(Prepend {
                    body,
                    trailer: desc.trailer.clone(),
                })
            }
            None => None,
        };

        let job = Conversion {
            sources: part.sources,
            prepend,
            constants: part.constants,
            algo: self.config.algo.clone(),
            align: self.config.align,
        };

        let mut upload = self.ofs.start_upload(&out_path).map_err(|e| ConvertError {
            path: None,
            fatal: false,
            reason: e.to_string(),
        })?;

        log::trace!("{}: converting into {out_path}", self.name);

        let trailer = match self.converter.convert(job, &mut *upload) {
            Ok(trailer) => trailer,
            Err(e) => {
                if let Err(abort_err) = upload.abort() {
                    log::warn!("{}: abort of {out_path} failed: {abort_err}", self.name);
                }
                return Err(e);
            }
        };

        let meta = upload.finish().map_err(|e| ConvertError {
            path: None,
            fatal: false,
            reason: e.to_string(),
        })?;

        Ok(Converted {
            prepend: part.prepend.map(|(pos, _)| pos),
            desc: Descriptor {
                info: ObjectInfo {
                    path: out_path,
                    etag: meta.etag,
                    last_modified: meta.last_modified,
                    size: meta.size,
                    format: FORMAT_VERSION,
                },
                trailer,
            },
        })
    }

    /// Stamps poisoned inputs as rejected so retries skip them.
    ///
    /// Runs against a freshly loaded index: the failed transaction's
    /// in-memory state was discarded. Best effort; the original
    /// conversion error is what the caller reports.
    fn update_failed(&self, rejected: &[(String, String)]) {
        if rejected.is_empty() {
            return;
        }

        let result = (|| -> Result<()> {
            let mut state = match self.load_index() {
                Ok(state) => state,
                Err(e) if e.is_recoverable_load() => self.fresh_index(),
                Err(e) => return Err(e),
            };

            for (path, etag) in rejected {
                match state.idx.inputs.append(&self.ofs, path, etag, REJECTED) {
                    Ok(_) => {}
                    Err(Error::ETagChanged(p)) => {
                        log::warn!("{}: {p} changed while poisoning", self.name);
                    }
                    Err(e) => return Err(e),
                }
            }

            log::info!(
                "{}/{}: recorded {} rejected inputs",
                self.db,
                self.name,
                rejected.len(),
            );

            self.flush(state)
        })();

        if let Err(e) = result {
            self.invalidate();
            log::error!("{}: cannot record rejected inputs: {e}", self.name);
        }
    }

    // ---- scan ---------------------------------------------------------

    /// Runs one scan step against the current index (loading or creating
    /// it as needed). Returns `true` while the table is still scanning.
    pub fn scan_once(&self, flush_on_complete: bool) -> Result<bool> {
        let state = match self.load_index() {
            Ok(state) => state,
            Err(e) if e.is_recoverable_load() => self.fresh_index(),
            Err(e) => return Err(e),
        };

        self.scan_state(state, flush_on_complete)
    }

    /// Runs one *sync* step: like [`Table::scan_once`], but a table
    /// whose backfill already completed is restarted from the beginning
    /// so that sources added since the last pass are picked up (the
    /// fingerprint tree dedups everything already ingested).
    pub fn sync_once(&self) -> Result<bool> {
        let mut state = match self.load_index() {
            Ok(state) => state,
            Err(e) if e.is_recoverable_load() => self.fresh_index(),
            Err(e) => return Err(e),
        };

        if !state.idx.scanning && !self.def.skip_backfill {
            state.idx.scanning = true;
            state.idx.cursors = vec![String::new(); self.def.inputs.len()];
        }

        self.scan_state(state, true)
    }

    fn scan_state(&self, mut state: OpIndex, flush_on_complete: bool) -> Result<bool> {
        let outcome = scan::step(self, &mut state.idx)?;
        let still_scanning = state.idx.scanning;

        if !outcome.work.is_empty() {
            self.force(state, outcome.work)?;
        } else if outcome.changed || (flush_on_complete && outcome.walked) {
            self.flush(state)?;
        } else {
            self.restore(state);
        }

        Ok(still_scanning)
    }

    // ---- gc -----------------------------------------------------------

    /// Opportunistic GC at the start of a write: precise collection on
    /// every fresh load, plus an occasional full sweep. Failures are
    /// logged, never fatal to the write.
    fn run_gc(&self, state: &mut OpIndex) {
        if state.should_gc {
            let shrunk = gc::precise(&self.ofs, &mut state.idx);
            state.should_gc = false;

            if shrunk {
                log::trace!("{}: quarantine shrank", self.name);
            }
        }

        let roll: u32 = rand::Rng::gen_range(&mut rand::thread_rng(), 0..100);
        if roll < self.config.gc_likelihood {
            match gc::sweep(
                &self.ofs,
                &self.block_cache,
                &self.db,
                &self.name,
                &mut state.idx,
                &gc::GcConfig::from(&self.config),
            ) {
                Ok(()) => {}
                // The cursor rides along with the next index write
                Err(Error::LongGc) => log::debug!("{}: sweep paused on budget", self.name),
                Err(e) => log::warn!("{}: sweep failed: {e}", self.name),
            }
        }
    }

    /// Explicit GC pass: precise collection plus a full sweep.
    ///
    /// On [`Error::LongGc`] the resumption cursor has been persisted;
    /// schedule another pass to continue.
    pub fn gc_run(&self) -> Result<()> {
        let mut state = self.load_index()?;

        gc::precise(&self.ofs, &mut state.idx);

        let swept = gc::sweep(
            &self.ofs,
            &self.block_cache,
            &self.db,
            &self.name,
            &mut state.idx,
            &gc::GcConfig::from(&self.config),
        );

        match swept {
            Ok(()) => self.flush(state),
            Err(Error::LongGc) => {
                self.flush(state)?;
                Err(Error::LongGc)
            }
            Err(e) => {
                self.invalidate();
                Err(e)
            }
        }
    }

    // ---- inspection ---------------------------------------------------

    /// Loads the index (through the cache) and hands it to `f`.
    ///
    /// The index is returned to the cache afterwards. Intended for
    /// consumers that only read (queries, tests); mutations made through
    /// this hook are not persisted.
    pub fn inspect<R>(&self, f: impl FnOnce(&mut Index) -> R) -> Result<R> {
        let mut state = self.load_index()?;
        let result = f(&mut state.idx);
        self.restore(state);
        Ok(result)
    }

    /// Projects the index into a flat blob list for query consumers.
    pub fn blobs(&self, filter: &Filter) -> Result<Vec<crate::blobs::Blob>> {
        let state = self.load_index()?;
        let result = crate::blobs::project(
            &self.ofs,
            &self.block_cache,
            &state.idx,
            filter,
            self.config.min_merge_size,
        );
        self.restore(state);
        result
    }
}

struct Converted {
    prepend: Option<usize>,
    desc: Descriptor,
}

struct FailedPart {
    error: ConvertError,
    sources: Vec<(String, String)>,
}

/// Finds the partition's merge target: the last inline descriptor in
/// `dir`, provided it is still below the merge threshold.
fn find_prepend(idx: &Index, dir: &str, min_merge_size: u64) -> Option<(usize, Descriptor)> {
    let (pos, desc) = idx
        .inline
        .iter()
        .enumerate()
        .rev()
        .find(|(_, d)| d.partition_dir() == dir)?;

    (desc.info.size < min_merge_size).then(|| (pos, desc.clone()))
}
