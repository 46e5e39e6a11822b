// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

mod common;

use packdb::Config;
use test_log::test;

#[test]
fn small_tail_objects_merge() -> packdb::Result<()> {
    // Everything below 4 KiB keeps merging into one object
    let env = common::env_with(Config::default().min_merge_size(4 * 1_024).align(1_024));
    env.define(
        "default",
        "parking",
        r#"{"input": [{"pattern": "mem://a-prefix/*.10n"}, {"pattern": "mem://a-prefix/*.json"}]}"#,
    )?;

    env.put_lines("a-prefix/parking.10n", &[r#"{"ticket": 1}"#])?;
    common::sync_until_done(&env.store, "default", "parking")?;

    let table = env.store.open_table("default", "parking")?;
    let first = table.inspect(|idx| {
        assert_eq!(1, idx.objects());
        idx.inline[0].info.path.clone()
    })?;

    env.put_lines("a-prefix/parking2.json", &[r#"{"ticket": 2}"#])?;
    common::sync_until_done(&env.store, "default", "parking")?;

    let table = env.store.open_table("default", "parking")?;
    let merged = table.inspect(|idx| {
        // Still one object: the tail was rewritten, not extended
        assert_eq!(1, idx.objects());
        assert_eq!(1, idx.inline.len());

        let path = idx.inline[0].info.path.clone();
        assert_ne!(first, path);

        // The superseded object sits in quarantine
        assert!(idx.to_delete.iter().any(|q| q.path == first));

        assert!(idx
            .inputs
            .contains(&env.mem, "mem://a-prefix/parking.10n")
            .unwrap());
        assert!(idx
            .inputs
            .contains(&env.mem, "mem://a-prefix/parking2.json")
            .unwrap());

        path
    })?;

    // The merged object carries both sources' records
    let body = env.read_text(&merged)?;
    assert!(body.contains(r#""ticket":1"#));
    assert!(body.contains(r#""ticket":2"#));
    assert_eq!(2, body.lines().count());

    Ok(())
}
