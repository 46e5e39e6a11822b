// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

mod common;

use packdb::{Config, Error, InputFs, OutputFs};
use std::time::Duration;
use test_log::test;

#[test]
fn interrupted_sweep_resumes_from_cursor() -> packdb::Result<()> {
    let env = common::env();
    env.define(
        "default",
        "blocks",
        r#"{
            "input": [{"pattern": "mem://b/{part}/*.block"}],
            "partitions": [{"field": "part"}]
        }"#,
    )?;

    for part in ["p1", "p2", "p3"] {
        env.put_lines(&format!("b/{part}/x.block"), &[r#"{"v": 1}"#])?;
    }
    common::sync_until_done(&env.store, "default", "blocks")?;

    // Pre-seed orphans old enough to collect
    for part in ["p1", "p2", "p3"] {
        let bogus = format!("db/default/blocks/{part}/packed-deleteme.zion");
        env.mem.put(&bogus, b"junk")?;
        env.mem.backdate(&bogus, 0);
    }

    // A sweep with no time budget parks a resumption cursor
    let strict = common::store_with(&env, Config::default().gc_max_delay(Duration::from_nanos(0)));
    let table = strict.open_table("default", "blocks")?;

    assert!(matches!(table.gc_run(), Err(Error::LongGc)));

    let table = env.store.open_table("default", "blocks")?;
    table.inspect(|idx| {
        assert!(
            !idx.user_data.packed_gc_cursor.is_empty(),
            "cursor must be persisted",
        );
    })?;

    // A budgeted pass finishes the sweep and clears the cursor
    let table = env.store.open_table("default", "blocks")?;
    table.gc_run()?;

    let table = env.store.open_table("default", "blocks")?;
    let live = table.inspect(|idx| {
        assert!(idx.user_data.packed_gc_cursor.is_empty());
        idx.inline
            .iter()
            .map(|d| d.info.path.clone())
            .collect::<Vec<_>>()
    })?;

    // Everything referenced survives; every orphan is gone
    assert_eq!(3, live.len());
    for path in live {
        assert!(env.mem.stat(&path).is_ok());
    }
    for part in ["p1", "p2", "p3"] {
        let bogus = format!("db/default/blocks/{part}/packed-deleteme.zion");
        assert!(env.mem.stat(&bogus).unwrap_err().is_not_exist());
    }

    Ok(())
}
