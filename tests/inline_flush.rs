// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

mod common;

use packdb::{Config, Filter, Group, InputFs, Source};
use test_log::test;

fn group(path: &str, body: &str) -> Group {
    Group {
        prefix: String::new(),
        constants: vec![],
        sources: vec![Source {
            path: path.into(),
            etag: "e1".into(),
            size: body.len() as u64,
            format: None,
            hints: None,
            body: Box::new(std::io::Cursor::new(body.as_bytes().to_vec())),
        }],
    }
}

#[test]
fn grown_inline_list_flushes_to_indirect() -> packdb::Result<()> {
    // Any inline payload overflows straight into the indirect tree
    let env = common::env_with(
        Config::default()
            .min_merge_size(0)
            .max_inline_bytes(1)
            .target_merge_size(1_024 * 1_024),
    );
    env.define(
        "default",
        "events",
        r#"{"input": [{"pattern": "mem://src/*.json"}], "skip_backfill": true}"#,
    )?;

    let table = env.store.open_table("default", "events")?;
    table.append(vec![group("mem://src/a.json", r#"{"n": 1}"#)])?;
    table.append(vec![group("mem://src/b.json", r#"{"n": 2}"#)])?;

    let table = env.store.open_table("default", "events")?;
    table.inspect(|idx| {
        assert!(idx.inline.is_empty(), "inline list must have flushed");
        assert_eq!(2, idx.indirect.orig_objects());
        assert_eq!(2, idx.objects());

        // The second flush topped up the first block and quarantined it
        assert!(idx
            .to_delete
            .iter()
            .any(|q| q.path.contains("/refs-")));

        let mut refs = 0;
        idx.indirect.each_ref(|_| refs += 1);
        assert_eq!(1, refs);
    })?;

    // Flushed descriptors still resolve to live objects
    let blobs = table.blobs(&Filter::All)?;
    assert_eq!(2, blobs.len());
    assert!(blobs.iter().all(|b| !b.ephemeral));

    for blob in &blobs {
        let rel = blob.url.strip_prefix("mem://").unwrap();
        assert!(env.mem.stat(rel).is_ok(), "missing {rel}");
    }

    Ok(())
}
