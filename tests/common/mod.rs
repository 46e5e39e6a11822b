// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Shared helpers for the integration scenarios: an in-memory tenant
//! and a line-delimited JSON converter standing in for the external
//! packed-object writer.

#![allow(dead_code)]

use packdb::{
    AnyFs, Config, ConvertError, Conversion, Converter, Definition, Key, LocalTenant, MemoryFs,
    OutputFs, SharedTenant, SparseIndex, Store, Trailer, TypedValue,
};
use std::io::{Read, Write};
use std::sync::Arc;

/// An in-memory tenant plus a store over it.
pub struct TestEnv {
    pub mem: MemoryFs,
    pub fs: AnyFs,
    pub tenant: SharedTenant,
    pub store: Store,
}

/// Builds a test environment with the given engine configuration.
pub fn env_with(config: Config) -> TestEnv {
    let mem = MemoryFs::new();
    let fs = AnyFs::from(mem.clone());
    let tenant: SharedTenant = Arc::new(LocalTenant::new(
        "tenant-0",
        Key::derive_for_testing("tenant-0"),
        fs.clone(),
    ));
    let store = Store::new(tenant.clone(), config, Arc::new(JsonLinesConverter));

    TestEnv {
        mem,
        fs,
        tenant,
        store,
    }
}

pub fn env() -> TestEnv {
    env_with(Config::default())
}

/// A second store over the same tenant, e.g. with different knobs or
/// to model an independent writer.
pub fn store_with(env: &TestEnv, config: Config) -> Store {
    Store::new(env.tenant.clone(), config, Arc::new(JsonLinesConverter))
}

impl TestEnv {
    /// Writes a table definition into the store.
    pub fn define(&self, db: &str, table: &str, json: &str) -> packdb::Result<Definition> {
        let def = Definition::from_json(json.as_bytes())?;
        packdb::write_definition(&self.mem, db, table, &def)?;
        Ok(def)
    }

    /// Puts a source object made of JSON lines.
    pub fn put_lines(&self, path: &str, lines: &[&str]) -> packdb::Result<packdb::Meta> {
        let mut body = String::new();
        for line in lines {
            body.push_str(line);
            body.push('\n');
        }
        self.mem.put(path, body.as_bytes())
    }

    /// Reads a stored object back as text.
    pub fn read_text(&self, path: &str) -> packdb::Result<String> {
        use packdb::InputFs;

        let mut body = String::new();
        self.mem
            .open_object(path)?
            .read_to_string(&mut body)
            .map_err(packdb::Error::from)?;
        Ok(body)
    }
}

/// Repeats `sync` until the table finishes its backfill; returns the
/// number of rounds it took.
pub fn sync_until_done(store: &Store, db: &str, pattern: &str) -> packdb::Result<usize> {
    for round in 1..=64 {
        match store.sync(db, pattern) {
            Ok(()) => return Ok(round),
            Err(packdb::Error::BuildAgain) => {}
            Err(e) => return Err(e),
        }
    }
    panic!("sync did not converge");
}

/// Line-delimited JSON converter.
///
/// The "packed" format is simply the concatenated records (constants
/// stamped in), which keeps merge behavior observable from tests. Any
/// RFC 3339 string value feeds the sparse index under its field name.
pub struct JsonLinesConverter;

impl Converter for JsonLinesConverter {
    fn convert(&self, mut job: Conversion, out: &mut dyn Write) -> Result<Trailer, ConvertError> {
        let mut sparse = SparseIndex::new(0);
        let mut rows = 0u64;
        let mut written = 0u64;

        // Prior object first, so the new object is a strict superset
        if let Some(mut prepend) = job.prepend.take() {
            let mut prior = vec![];
            prepend
                .body
                .read_to_end(&mut prior)
                .map_err(|e| ConvertError::io(&e))?;
            out.write_all(&prior).map_err(|e| ConvertError::io(&e))?;

            written += prior.len() as u64;
            rows += prepend.trailer.rows();
            sparse.merge(&prepend.trailer.sparse);
        }

        let mut block_sparse = SparseIndex::new(1);

        for source in &mut job.sources {
            let mut body = String::new();
            source
                .body
                .read_to_string(&mut body)
                .map_err(|e| ConvertError::io(&e))?;

            for line in body.lines() {
                if line.trim().is_empty() {
                    continue;
                }

                let mut record: serde_json::Map<String, serde_json::Value> =
                    serde_json::from_str(line)
                        .map_err(|e| ConvertError::fatal(&source.path, e.to_string()))?;

                for (field, value) in &job.constants {
                    record.insert(field.clone(), constant_json(value));
                }

                for (field, value) in &record {
                    if let Some(s) = value.as_str() {
                        if let Ok(t) = chrono::DateTime::parse_from_rfc3339(s) {
                            block_sparse.push(field, t.timestamp_micros());
                        }
                    }
                }

                let line = serde_json::Value::Object(record).to_string();
                out.write_all(line.as_bytes())
                    .map_err(|e| ConvertError::io(&e))?;
                out.write_all(b"\n").map_err(|e| ConvertError::io(&e))?;

                written += line.len() as u64 + 1;
                rows += 1;
            }
        }

        sparse.merge(&block_sparse);

        #[allow(clippy::cast_possible_truncation)]
        Ok(Trailer {
            algo: job.algo,
            decompressed: written,
            align: job.align as u32,
            blocks: vec![packdb::BlockDesc { offset: 0, rows }],
            sparse,
        })
    }
}

fn constant_json(value: &TypedValue) -> serde_json::Value {
    match value {
        TypedValue::String(s) => serde_json::Value::String(s.clone()),
        TypedValue::Int(i) => serde_json::Value::from(*i),
        TypedValue::Timestamp(us) => {
            let t = chrono::DateTime::from_timestamp_micros(*us)
                .unwrap_or_default()
                .to_rfc3339();
            serde_json::Value::String(t)
        }
    }
}
