// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Queue-driven ingest: multiplexes a notification queue over every
//! table of a tenant.
//!
//! The runner gathers notifications into batches, filters each batch
//! against every table's input patterns, appends per table in parallel,
//! and finalizes each item with the worst verdict any table produced.
//! Batches are double-buffered: while batch N is processed on a worker
//! thread, batch N+1 is being gathered. Tables still running their
//! initial backfill report `TryAgain` instead of racing the scanner.

use crate::{
    config::Config,
    converter::{Converter, Source},
    definition::{load_definition, Definition},
    fs::{InputFs, WalkFlow},
    partition::Collector,
    queue::{ItemStatus, Polled, Queue, QueueItem, StatusCell},
    table::Table,
    tenant::SharedTenant,
    Error, Result,
};
use rustc_hash::FxHashMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

/// Cooperative cancellation flag for background scanners.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// Requests a stop.
    pub fn send(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns whether a stop was requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Batch and refresh knobs of the runner.
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    /// Target byte size of one batch
    pub batch_size: u64,

    /// Maximum item count of one batch
    pub batch_items: usize,

    /// Maximum time spent growing one batch
    pub batch_interval: Duration,

    /// Interval between definition refreshes
    pub table_refresh: Duration,

    /// Backoff after transient queue errors
    pub io_err_delay: Duration,

    /// Run background backfill scanners
    pub scan: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            batch_size: /* 100 MiB */ 100 * 1_024 * 1_024,
            batch_items: 5_000,
            batch_interval: Duration::from_secs(1),
            table_refresh: Duration::from_secs(60),
            io_err_delay: Duration::from_secs(1),
            scan: true,
        }
    }
}

struct ScanTask {
    stop: StopSignal,
    handle: std::thread::JoinHandle<()>,
}

struct TableInfo {
    table: Arc<Table>,

    /// `true` while a backfill thread is running
    scanning: Arc<AtomicBool>,

    scan: Option<ScanTask>,
}

/// Snapshot of one table handed to a batch worker.
struct BatchTable {
    table: Arc<Table>,
    scanning: Arc<AtomicBool>,
}

/// The long-running ingest driver of one tenant.
pub struct Runner {
    tenant: SharedTenant,
    config: Config,
    runner_config: RunnerConfig,
    converter: Arc<dyn Converter>,
    tables: FxHashMap<(String, String), TableInfo>,
    last_refresh: Option<Instant>,
}

impl Runner {
    /// Creates a runner; tables are discovered on the first
    /// [`Runner::run`] iteration.
    #[must_use]
    pub fn new(
        tenant: SharedTenant,
        config: Config,
        runner_config: RunnerConfig,
        converter: Arc<dyn Converter>,
    ) -> Self {
        Self {
            tenant,
            config,
            runner_config,
            converter,
            tables: FxHashMap::default(),
            last_refresh: None,
        }
    }

    /// Returns the controller of a known table.
    #[must_use]
    pub fn table(&self, db: &str, name: &str) -> Option<Arc<Table>> {
        self.tables
            .get(&(db.to_owned(), name.to_owned()))
            .map(|info| info.table.clone())
    }

    /// Drives ingest until the queue closes.
    ///
    /// Returns [`Error::Permission`]-class failures immediately so the
    /// operator can fix store policy; transient errors back off and
    /// continue.
    pub fn run<Q: Queue>(&mut self, mut queue: Q) -> Result<()> {
        self.update_defs()?;

        // (items of the in-flight batch, its worker)
        let mut pending: Option<(
            Arc<Vec<QueueItem>>,
            std::thread::JoinHandle<Vec<ItemStatus>>,
        )> = None;

        let result = loop {
            // While a batch is in flight we poll with a bounded pause so
            // its verdicts can be finalized promptly
            let first_pause = if pending.is_some() {
                Some(self.runner_config.batch_interval)
            } else {
                None
            };

            let (items, closed) = match self.gather(&mut queue, first_pause) {
                Ok(gathered) => gathered,
                Err(e) if e.is_permission() => break Err(e),
                Err(e) => {
                    log::warn!("queue error, backing off: {e}");
                    std::thread::sleep(self.runner_config.io_err_delay);
                    continue;
                }
            };

            if let Some((batch, handle)) = pending.take() {
                finalize_batch(&mut queue, batch.as_slice(), handle);
            }

            let has_def_writes = items
                .iter()
                .any(|item| item.path.ends_with("/definition.json"));

            if has_def_writes || self.refresh_due() {
                if let Err(e) = self.update_defs() {
                    if e.is_permission() {
                        break Err(e);
                    }
                    log::warn!("definition refresh failed: {e}");
                }
            }

            if !items.is_empty() {
                let batch = Arc::new(items);
                let snapshot: Vec<BatchTable> = self
                    .tables
                    .values()
                    .map(|info| BatchTable {
                        table: info.table.clone(),
                        scanning: info.scanning.clone(),
                    })
                    .collect();

                let worker_batch = batch.clone();
                let handle = std::thread::spawn(move || {
                    process_batch(&snapshot, worker_batch.as_slice())
                });

                pending = Some((batch, handle));
            }

            if closed {
                log::info!("queue closed, draining");
                break Ok(());
            }
        };

        if let Some((batch, handle)) = pending.take() {
            finalize_batch(&mut queue, batch.as_slice(), handle);
        }

        self.stop_scans();

        if result.is_ok() {
            queue.close()?;
        }

        result
    }

    /// Stops and joins every background scanner.
    pub fn stop_scans(&mut self) {
        for info in self.tables.values_mut() {
            stop_scan(info);
        }
    }

    fn refresh_due(&self) -> bool {
        match self.last_refresh {
            None => true,
            Some(t) => t.elapsed() >= self.runner_config.table_refresh,
        }
    }

    /// Gathers one batch: a first (possibly blocking) pull, then more
    /// items until the batch is big, long or old enough.
    fn gather(
        &self,
        queue: &mut impl Queue,
        first_pause: Option<Duration>,
    ) -> Result<(Vec<QueueItem>, bool)> {
        let mut items = vec![];
        let mut bytes = 0u64;

        match queue.next(first_pause)? {
            Polled::Item(item) => {
                bytes += item.size;
                items.push(item);
            }
            Polled::TimedOut => return Ok((items, false)),
            Polled::Closed => return Ok((items, true)),
        }

        let started = Instant::now();

        loop {
            if items.len() >= self.runner_config.batch_items
                || bytes >= self.runner_config.batch_size
            {
                return Ok((items, false));
            }

            let Some(remaining) = self
                .runner_config
                .batch_interval
                .checked_sub(started.elapsed())
            else {
                return Ok((items, false));
            };

            match queue.next(Some(remaining))? {
                Polled::Item(item) => {
                    bytes += item.size;
                    items.push(item);
                }
                Polled::TimedOut => return Ok((items, false)),
                Polled::Closed => return Ok((items, true)),
            }
        }
    }

    /// Re-lists `db/*/*/definition.json` and installs, replaces or
    /// removes table controllers to match.
    fn update_defs(&mut self) -> Result<()> {
        let root = self.tenant.root();
        let mut found: Vec<(String, String)> = vec![];

        let walked = root.walk("db/*/*/definition.json", "", &mut |path, _| {
            let mut parts = path.split('/');
            let (Some("db"), Some(db), Some(table), Some("definition.json"), None) = (
                parts.next(),
                parts.next(),
                parts.next(),
                parts.next(),
                parts.next(),
            ) else {
                return Ok(WalkFlow::Continue);
            };

            found.push((db.to_owned(), table.to_owned()));
            Ok(WalkFlow::Continue)
        });

        walked?;

        self.last_refresh = Some(Instant::now());

        // Stage: removed tables go, new or changed ones (re)install
        let mut keep: FxHashMap<(String, String), Definition> = FxHashMap::default();

        for key in found {
            match load_definition(root, &key.0, &key.1) {
                Ok(def) => {
                    keep.insert(key, def);
                }
                Err(e) => {
                    log::warn!("skipping {}/{}: bad definition: {e}", key.0, key.1);
                }
            }
        }

        let stale: Vec<(String, String)> = self
            .tables
            .keys()
            .filter(|key| !keep.contains_key(*key))
            .cloned()
            .collect();

        for key in stale {
            if let Some(mut info) = self.tables.remove(&key) {
                log::info!("removing table {}/{}", key.0, key.1);
                stop_scan(&mut info);
            }
        }

        for (key, def) in keep {
            if let Some(info) = self.tables.get(&key) {
                if *info.table.definition() == def {
                    continue;
                }
                log::info!("definition of {}/{} changed", key.0, key.1);
            } else {
                log::info!("installing table {}/{}", key.0, key.1);
            }

            // Cancel + join any scanner before swapping the controller
            if let Some(mut old) = self.tables.remove(&key) {
                stop_scan(&mut old);
            }

            match self.init_table(&key.0, &key.1, def) {
                Ok(info) => {
                    self.tables.insert(key, info);
                }
                Err(e) => {
                    log::warn!("cannot open table {}/{}: {e}", key.0, key.1);
                }
            }
        }

        Ok(())
    }

    fn init_table(&self, db: &str, name: &str, def: Definition) -> Result<TableInfo> {
        let table = Arc::new(Table::open(
            self.tenant.clone(),
            db,
            name,
            def,
            &self.config,
            self.converter.clone(),
        )?);

        let mut info = TableInfo {
            table: table.clone(),
            scanning: Arc::new(AtomicBool::new(false)),
            scan: None,
        };

        if !self.runner_config.scan {
            return Ok(info);
        }

        let needs_scan = match table.inspect(|idx| idx.scanning) {
            Ok(scanning) => scanning,
            Err(e) if e.is_recoverable_load() => !table.definition().skip_backfill,
            Err(e) => return Err(e),
        };

        if needs_scan {
            start_scan(&mut info, self.runner_config.io_err_delay);
        }

        Ok(info)
    }
}

fn start_scan(info: &mut TableInfo, io_err_delay: Duration) {
    let table = info.table.clone();
    let scanning = info.scanning.clone();
    let stop = StopSignal::default();
    let thread_stop = stop.clone();

    scanning.store(true, Ordering::Release);

    log::info!("{}/{}: starting backfill", table.db(), table.name());

    let handle = std::thread::spawn(move || {
        loop {
            if thread_stop.is_stopped() {
                break;
            }

            match table.scan_once(true) {
                Ok(true) => {}
                Ok(false) => {
                    log::info!("{}/{}: backfill complete", table.db(), table.name());
                    break;
                }
                Err(e) => {
                    log::warn!("{}/{}: scan step failed: {e}", table.db(), table.name());
                    table.invalidate();
                    std::thread::sleep(io_err_delay);
                }
            }
        }

        scanning.store(false, Ordering::Release);
    });

    info.scan = Some(ScanTask { stop, handle });
}

fn stop_scan(info: &mut TableInfo) {
    if let Some(task) = info.scan.take() {
        task.stop.send();
        if task.handle.join().is_err() {
            log::error!(
                "{}/{}: scanner panicked",
                info.table.db(),
                info.table.name(),
            );
        }
        info.scanning.store(false, Ordering::Release);
    }
}

/// Filters a batch against every table and appends in parallel,
/// merging per-item verdicts worse-wins.
fn process_batch(tables: &[BatchTable], items: &[QueueItem]) -> Vec<ItemStatus> {
    let statuses: Vec<StatusCell> = items.iter().map(|_| StatusCell::default()).collect();

    std::thread::scope(|scope| {
        for entry in tables {
            let statuses = &statuses;
            scope.spawn(move || {
                process_table(entry, items, statuses);
            });
        }
    });

    statuses.iter().map(StatusCell::get).collect()
}

fn process_table(entry: &BatchTable, items: &[QueueItem], statuses: &[StatusCell]) {
    let table = &entry.table;
    let def = table.definition();

    let mut collector = match Collector::new(&def.partitions) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{}/{}: bad partition specs: {e}", table.db(), table.name());
            return;
        }
    };

    let mut matched: Vec<usize> = vec![];

    for (i, item) in items.iter().enumerate() {
        for spec in &def.inputs {
            let key = match collector.key_of(&spec.pattern, &item.path) {
                Ok(Some(_)) => true,
                Ok(None) => false,
                Err(e) => {
                    log::warn!("{}: skipping {}: {e}", table.name(), item.path);
                    false
                }
            };

            if !key {
                continue;
            }

            match open_source(table, spec, item) {
                Ok(source) => {
                    match collector.add(&spec.pattern, source) {
                        Ok(Some(_)) => matched.push(i),
                        Ok(None) => {}
                        Err(e) => {
                            log::warn!("{}: cannot place {}: {e}", table.name(), item.path);
                        }
                    }
                }
                Err(e) if e.is_not_exist() => {
                    // Deleted before we got to it; nothing to ingest
                    log::debug!("{}: {} vanished", table.name(), item.path);
                }
                Err(e) => {
                    log::warn!("{}: cannot open {}: {e}", table.name(), item.path);
                    if let Some(cell) = statuses.get(i) {
                        cell.worsen(ItemStatus::WriteError);
                    }
                }
            }

            break;
        }
    }

    if collector.is_empty() {
        return;
    }

    // Never race the backfill scanner on the same table
    if entry.scanning.load(Ordering::Acquire) {
        for &i in &matched {
            if let Some(cell) = statuses.get(i) {
                cell.worsen(ItemStatus::TryAgain);
            }
        }
        return;
    }

    let verdict = match table.append(collector.into_groups()) {
        Ok(()) => ItemStatus::Ok,
        Err(Error::BuildAgain) => ItemStatus::TryAgain,
        Err(e) => {
            log::error!("{}/{}: append failed: {e}", table.db(), table.name());
            table.invalidate();
            ItemStatus::WriteError
        }
    };

    for &i in &matched {
        if let Some(cell) = statuses.get(i) {
            cell.worsen(verdict);
        }
    }
}

fn open_source(
    table: &Table,
    spec: &crate::definition::InputSpec,
    item: &QueueItem,
) -> Result<Source> {
    let (fs, _) = table.tenant().split(&spec.pattern)?;

    let Some((_, rel)) = item.path.split_once("://") else {
        return Err(Error::BadPattern("queue item path is not a URI"));
    };

    // The notification already carries etag and size; stat only when
    // the transport left them out
    let (etag, size) = if item.etag.is_empty() {
        let meta = fs.stat(rel)?;
        (meta.etag, meta.size)
    } else {
        (item.etag.clone(), item.size)
    };

    let body = fs.open_object(rel)?;

    Ok(Source {
        path: item.path.clone(),
        etag,
        size,
        format: spec.format.clone(),
        hints: spec.hints.clone(),
        body,
    })
}

fn finalize_batch(
    queue: &mut impl Queue,
    items: &[QueueItem],
    handle: std::thread::JoinHandle<Vec<ItemStatus>>,
) {
    let statuses = match handle.join() {
        Ok(statuses) => statuses,
        Err(_) => {
            log::error!("batch worker panicked");
            vec![ItemStatus::WriteError; items.len()]
        }
    };

    for (item, status) in items.iter().zip(statuses) {
        if let Err(e) = queue.finalize(item, status) {
            log::warn!("cannot finalize {}: {e}", item.path);
        }
    }
}
