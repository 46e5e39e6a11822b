// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

mod common;

use test_log::test;

#[test]
fn changed_definition_restarts_backfill() -> packdb::Result<()> {
    let env = common::env();
    env.define(
        "default",
        "logs",
        r#"{"input": [{"pattern": "mem://logs-a/*.json"}]}"#,
    )?;

    env.put_lines("logs-a/one.json", &[r#"{"n": 1}"#])?;
    common::sync_until_done(&env.store, "default", "logs")?;

    let table = env.store.open_table("default", "logs")?;
    table.inspect(|idx| assert_eq!(1, idx.objects()))?;

    // The definition grows a second input pattern: the stored hash no
    // longer matches and the next scan starts over
    env.define(
        "default",
        "logs",
        r#"{"input": [
            {"pattern": "mem://logs-a/*.json"},
            {"pattern": "mem://logs-b/*.json"}
        ]}"#,
    )?;
    env.put_lines("logs-b/two.json", &[r#"{"n": 2}"#])?;

    common::sync_until_done(&env.store, "default", "logs")?;

    let table = env.store.open_table("default", "logs")?;
    table.inspect(|idx| {
        // Old data is deduplicated, new data ingested
        assert!(idx.inputs.contains(&env.mem, "mem://logs-a/one.json").unwrap());
        assert!(idx.inputs.contains(&env.mem, "mem://logs-b/two.json").unwrap());
        assert_eq!(2, idx.cursors.len());
        assert!(!idx.scanning);
    })?;

    Ok(())
}
