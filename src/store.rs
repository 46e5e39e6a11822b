// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Public entry points: single-table append, multi-table sync, and
//! single-table scan iteration.

use crate::{
    config::Config,
    converter::Converter,
    definition::{load_definition, Definition},
    fs::{InputFs, WalkFlow},
    partition::Group,
    table::Table,
    tenant::SharedTenant,
    Error, Result,
};
use std::sync::Arc;

/// Entry points of the ingest engine for one tenant.
pub struct Store {
    tenant: SharedTenant,
    config: Config,
    converter: Arc<dyn Converter>,
}

impl Store {
    /// Creates a store over a tenant.
    #[must_use]
    pub fn new(tenant: SharedTenant, config: Config, converter: Arc<dyn Converter>) -> Self {
        Self {
            tenant,
            config,
            converter,
        }
    }

    /// The store configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Opens a table controller by loading its definition.
    pub fn open_table(&self, db: &str, table: &str) -> Result<Table> {
        let def = load_definition(self.tenant.root(), db, table)?;
        self.open_with(db, table, def)
    }

    /// Opens a table controller with an explicit definition.
    pub fn open_with(&self, db: &str, table: &str, def: Definition) -> Result<Table> {
        Table::open(
            self.tenant.clone(),
            db,
            table,
            def,
            &self.config,
            self.converter.clone(),
        )
    }

    /// Appends partition-grouped sources to one table.
    pub fn append(&self, db: &str, table: &str, parts: Vec<Group>) -> Result<()> {
        self.open_table(db, table)?.append(parts)
    }

    /// Runs one scan iteration on one table.
    ///
    /// Returns [`Error::BuildAgain`] while the table remains scanning.
    pub fn scan(&self, db: &str, table: &str) -> Result<()> {
        let still_scanning = self.open_table(db, table)?.scan_once(true)?;

        if still_scanning {
            Err(Error::BuildAgain)
        } else {
            Ok(())
        }
    }

    /// Discovers every table matching `table_pattern` under `db` and
    /// runs one sync step on each, in parallel.
    ///
    /// Individual failures are combined; if every table succeeded but
    /// some are still catching up, [`Error::BuildAgain`] asks the
    /// caller to invoke `sync` again.
    pub fn sync(&self, db: &str, table_pattern: &str) -> Result<()> {
        let glob = format!("db/{db}/{table_pattern}/definition.json");
        let mut names = vec![];

        self.tenant.root().walk(&glob, "", &mut |path, _| {
            let mut parts = path.split('/');
            let (Some("db"), Some(_), Some(table), Some("definition.json"), None) = (
                parts.next(),
                parts.next(),
                parts.next(),
                parts.next(),
                parts.next(),
            ) else {
                return Ok(WalkFlow::Continue);
            };

            names.push(table.to_owned());
            Ok(WalkFlow::Continue)
        })?;

        if names.is_empty() {
            return Err(Error::not_exist(&glob));
        }

        log::debug!("sync {db}/{table_pattern}: {} tables", names.len());

        let outcomes: Vec<(String, Result<bool>)> = std::thread::scope(|scope| {
            let handles: Vec<_> = names
                .into_iter()
                .map(|name| {
                    scope.spawn(move || {
                        let result = self
                            .open_table(db, &name)
                            .and_then(|table| table.sync_once());
                        (name, result)
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(outcome) => outcome,
                    Err(_) => (
                        String::new(),
                        Err(Error::Corrupt("sync worker panicked")),
                    ),
                })
                .collect()
        });

        let mut errors = vec![];
        let mut still_scanning = false;

        for (name, outcome) in outcomes {
            match outcome {
                Ok(scanning) => still_scanning |= scanning,
                Err(e) => {
                    log::warn!("sync {db}/{name}: {e}");
                    errors.push(e);
                }
            }
        }

        match errors.len() {
            0 if still_scanning => Err(Error::BuildAgain),
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Multi(errors)),
        }
    }
}
