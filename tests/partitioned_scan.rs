// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

mod common;

use packdb::{Config, Filter, InputFs};
use test_log::test;

#[test]
fn scan_splits_partitions() -> packdb::Result<()> {
    // One object per scan step, so the backfill takes several rounds
    let env = common::env_with(Config::default().max_scan_objects(1));
    env.define(
        "default",
        "blocks",
        r#"{
            "input": [{"pattern": "mem://b/{part}/*.block"}],
            "partitions": [{"field": "part"}]
        }"#,
    )?;

    env.put_lines("b/p1/x.block", &[r#"{"v": 1}"#])?;
    env.put_lines("b/p2/x.block", &[r#"{"v": 2}"#])?;

    let rounds = common::sync_until_done(&env.store, "default", "blocks")?;
    assert!(rounds > 1, "one-object steps must take multiple rounds");

    let table = env.store.open_table("default", "blocks")?;

    let (p1, p2) = table.inspect(|idx| {
        assert_eq!(2, idx.objects(), "one object per partition");

        let p1 = idx
            .inline
            .iter()
            .find(|d| d.info.path.starts_with("db/default/blocks/p1/packed-"))
            .expect("p1 packed object")
            .info
            .path
            .clone();
        let p2 = idx
            .inline
            .iter()
            .find(|d| d.info.path.starts_with("db/default/blocks/p2/packed-"))
            .expect("p2 packed object")
            .info
            .path
            .clone();

        // Fingerprint ids segment by partition
        let mut ids = vec![];
        idx.inputs
            .walk(&env.mem, |path, _etag, id| ids.push((path.to_owned(), id)))
            .unwrap();

        assert_eq!(2, ids.len());
        assert_ne!(ids[0].1, ids[1].1);

        (p1, p2)
    })?;

    assert!(env.mem.stat(&p1).is_ok());
    assert!(env.mem.stat(&p2).is_ok());

    // The partition constant is stamped onto every row
    let body = env.read_text(&p1)?;
    assert!(body.contains(r#""part":"p1""#), "got {body}");

    // Both blobs are projected; small tails are ephemeral
    let blobs = table.blobs(&Filter::All)?;
    assert_eq!(2, blobs.len());
    assert!(blobs.iter().all(|b| b.ephemeral));
    assert!(blobs.iter().all(|b| b.url.starts_with("mem://db/default/blocks/")));

    Ok(())
}
