// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

mod common;

use chrono::{Duration, Utc};
use packdb::{Config, Group, Source};
use test_log::test;

fn group(path: &str, body: String) -> Group {
    Group {
        prefix: String::new(),
        constants: vec![],
        sources: vec![Source {
            path: path.into(),
            etag: "e1".into(),
            size: body.len() as u64,
            format: None,
            hints: None,
            body: Box::new(std::io::Cursor::new(body.into_bytes())),
        }],
    }
}

fn record_at(t: chrono::DateTime<Utc>) -> String {
    format!(r#"{{"ts": "{}"}}"#, t.to_rfc3339())
}

#[test]
fn expired_objects_move_to_quarantine() -> packdb::Result<()> {
    // No prepend-merging, so old and new data stay in separate objects
    let env = common::env_with(Config::default().min_merge_size(0));
    env.define(
        "default",
        "events",
        r#"{
            "input": [{"pattern": "mem://src/*.json"}],
            "retention_policy": {"field": "ts", "valid_for": "1h"},
            "skip_backfill": true
        }"#,
    )?;

    let table = env.store.open_table("default", "events")?;

    // Data two hours old is already outside the window: it is packed,
    // then immediately quarantined by the same write
    let stale = record_at(Utc::now() - Duration::hours(2));
    table.append(vec![group("mem://src/old.json", stale)])?;

    table.inspect(|idx| {
        assert_eq!(0, idx.objects(), "expired data must not stay live");

        let packed: Vec<_> = idx
            .to_delete
            .iter()
            .filter(|q| q.path.contains("packed-"))
            .collect();
        assert_eq!(1, packed.len());
    })?;

    // Fresh data survives its own write
    let fresh = record_at(Utc::now());
    table.append(vec![group("mem://src/new.json", fresh)])?;

    table.inspect(|idx| {
        assert_eq!(1, idx.objects());
        assert!(idx.inline[0].info.path.contains("packed-"));

        // Only the stale object sits in quarantine
        let packed: Vec<_> = idx
            .to_delete
            .iter()
            .filter(|q| q.path.contains("packed-"))
            .collect();
        assert_eq!(1, packed.len());
        assert_ne!(packed[0].path, idx.inline[0].info.path);
    })?;

    Ok(())
}
