// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

mod common;

use packdb::InputFs;
use test_log::test;

#[test]
fn empty_table_sync() -> packdb::Result<()> {
    let env = common::env();
    env.define(
        "default",
        "parking",
        r#"{"input": [{"pattern": "mem://a-prefix/*.10n"}]}"#,
    )?;

    common::sync_until_done(&env.store, "default", "parking")?;

    // The sealed index exists even though nothing was ingested
    assert!(env.mem.stat("db/default/parking/index").is_ok());

    let table = env.store.open_table("default", "parking")?;
    table.inspect(|idx| {
        assert_eq!(0, idx.objects());
        assert!(idx.inline.is_empty());
        assert!(!idx.scanning);
        assert!(idx.to_delete.is_empty());
    })?;

    // Syncing again is a no-op
    common::sync_until_done(&env.store, "default", "parking")?;

    let table = env.store.open_table("default", "parking")?;
    table.inspect(|idx| assert_eq!(0, idx.objects()))?;

    Ok(())
}

#[test]
fn sync_unknown_table_fails() {
    let env = common::env();
    assert!(env.store.sync("default", "missing").unwrap_err().is_not_exist());
}
