// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

mod common;

use packdb::{
    Config, ItemStatus, Polled, Queue, QueueItem, Runner, RunnerConfig,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_log::test;

/// A queue over a fixed item list; closes once drained.
struct FixedQueue {
    items: VecDeque<QueueItem>,
    finalized: Arc<Mutex<Vec<(String, ItemStatus)>>>,
    closed: Arc<Mutex<bool>>,
}

impl Queue for FixedQueue {
    fn next(&mut self, _pause: Option<Duration>) -> packdb::Result<Polled> {
        Ok(match self.items.pop_front() {
            Some(item) => Polled::Item(item),
            None => Polled::Closed,
        })
    }

    fn finalize(&mut self, item: &QueueItem, status: ItemStatus) -> packdb::Result<()> {
        self.finalized
            .lock()
            .unwrap()
            .push((item.path.clone(), status));
        Ok(())
    }

    fn close(&mut self) -> packdb::Result<()> {
        *self.closed.lock().unwrap() = true;
        Ok(())
    }
}

#[test]
fn runner_ingests_notified_objects() -> packdb::Result<()> {
    let env = common::env();
    env.define(
        "default",
        "events",
        r#"{"input": [{"pattern": "mem://q-src/*.json"}], "skip_backfill": true}"#,
    )?;

    let m1 = env.put_lines("q-src/a.json", &[r#"{"n": 1}"#])?;
    let m2 = env.put_lines("q-src/b.json", &[r#"{"n": 2}"#])?;
    let m3 = env.put_lines("other/c.json", &[r#"{"n": 3}"#])?;

    let item = |path: &str, meta: &packdb::Meta| QueueItem {
        path: path.into(),
        etag: meta.etag.clone(),
        size: meta.size,
        event_time: meta.last_modified,
    };

    let finalized = Arc::new(Mutex::new(vec![]));
    let closed = Arc::new(Mutex::new(false));
    let queue = FixedQueue {
        items: VecDeque::from(vec![
            item("mem://q-src/a.json", &m1),
            item("mem://q-src/b.json", &m2),
            // Matches no table; still acknowledged
            item("mem://other/c.json", &m3),
        ]),
        finalized: finalized.clone(),
        closed: closed.clone(),
    };

    let mut runner = Runner::new(
        env.tenant.clone(),
        Config::default(),
        RunnerConfig {
            batch_interval: Duration::from_millis(20),
            scan: false,
            ..RunnerConfig::default()
        },
        Arc::new(common::JsonLinesConverter),
    );

    runner.run(queue)?;

    assert!(*closed.lock().unwrap(), "queue must be closed on EOF");

    let verdicts = finalized.lock().unwrap();
    assert_eq!(3, verdicts.len());
    assert!(verdicts.iter().all(|(_, s)| *s == ItemStatus::Ok));

    // Both matching sources landed in one packed object
    let table = env.store.open_table("default", "events")?;
    table.inspect(|idx| {
        assert_eq!(1, idx.objects());
        assert!(idx.inputs.contains(&env.mem, "mem://q-src/a.json").unwrap());
        assert!(idx.inputs.contains(&env.mem, "mem://q-src/b.json").unwrap());
        assert!(!idx.inputs.contains(&env.mem, "mem://other/c.json").unwrap());
    })?;

    Ok(())
}

#[test]
fn runner_discovers_tables_from_definitions() -> packdb::Result<()> {
    let env = common::env();
    env.define(
        "default",
        "events",
        r#"{"input": [{"pattern": "mem://q2/*.json"}], "skip_backfill": true}"#,
    )?;

    let queue = FixedQueue {
        items: VecDeque::new(),
        finalized: Arc::new(Mutex::new(vec![])),
        closed: Arc::new(Mutex::new(false)),
    };

    let mut runner = Runner::new(
        env.tenant.clone(),
        Config::default(),
        RunnerConfig {
            scan: false,
            ..RunnerConfig::default()
        },
        Arc::new(common::JsonLinesConverter),
    );

    runner.run(queue)?;

    assert!(runner.table("default", "events").is_some());
    assert!(runner.table("default", "missing").is_none());

    Ok(())
}
