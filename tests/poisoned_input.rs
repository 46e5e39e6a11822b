// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

mod common;

use packdb::{Error, Group, Source, REJECTED};
use test_log::test;

fn group(path: &str, etag: &str, body: &str) -> Group {
    Group {
        prefix: String::new(),
        constants: vec![],
        sources: vec![Source {
            path: path.into(),
            etag: etag.into(),
            size: body.len() as u64,
            format: None,
            hints: None,
            body: Box::new(std::io::Cursor::new(body.as_bytes().to_vec())),
        }],
    }
}

#[test]
fn poisoned_input_is_rejected_once() -> packdb::Result<()> {
    let env = common::env();
    env.define(
        "default",
        "events",
        r#"{"input": [{"pattern": "mem://src/*.json"}], "skip_backfill": true}"#,
    )?;

    let table = env.store.open_table("default", "events")?;
    let path = "mem://src/bad.json";

    // Not JSON at all
    let err = table
        .append(vec![group(path, "e1", r#"{"foo": barbazquux}"#)])
        .unwrap_err();

    match err {
        Error::Convert(e) => assert!(e.fatal, "parse errors are fatal"),
        other => panic!("expected a conversion error, got {other:?}"),
    }

    // The index reflects the rejection, not the object
    let table = env.store.open_table("default", "events")?;
    table.inspect(|idx| {
        assert_eq!(0, idx.objects());
        let (etag, id) = idx.inputs.get(&env.mem, path).unwrap().unwrap();
        assert_eq!("e1", etag);
        assert_eq!(REJECTED, id);
    })?;

    // Same bytes again: silently skipped
    table.append(vec![group(path, "e1", r#"{"foo": barbazquux}"#)])?;
    table.inspect(|idx| assert_eq!(0, idx.objects()))?;

    // The source was fixed and re-uploaded: ingested normally
    table.append(vec![group(path, "e2", r#"{"foo": "quux"}"#)])?;
    table.inspect(|idx| {
        assert_eq!(1, idx.objects());
        let (etag, id) = idx.inputs.get(&env.mem, path).unwrap().unwrap();
        assert_eq!("e2", etag);
        assert_eq!(0, id);
    })?;

    Ok(())
}
