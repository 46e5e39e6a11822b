// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-table configuration loaded from `db/<db>/<table>/definition.json`.

use crate::{
    checksum::Checksum,
    config::Config,
    fs::{InputFs, OutputFs},
    pattern, Error, Result,
};
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Serialized definitions above this size are rejected before parsing.
pub const MAX_DEFINITION_SIZE: usize = 1_024 * 1_024;

/// One input pattern of a table definition.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct InputSpec {
    /// URI glob pattern selecting source objects
    pub pattern: String,

    /// Explicit format override; `None` means "derive from suffix"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    /// Opaque hints forwarded to the format plug-in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hints: Option<serde_json::Value>,
}

/// Type of a partition field constant.
#[derive(Copy, Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PartitionType {
    /// Verbatim string (the default)
    #[default]
    String,

    /// Base-10 signed 64-bit integer
    Int,

    /// Calendar date, stored as midnight UTC
    Date,

    /// Full timestamp
    #[serde(alias = "timestamp")]
    Datetime,
}

/// One partition field of a table definition.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct PartitionSpec {
    /// Field name stamped onto rows
    pub field: String,

    /// Constant type
    #[serde(default, rename = "type")]
    pub kind: PartitionType,

    /// Value template over the pattern's captures; `None` uses the
    /// capture group named like the field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Retention policy of a table definition.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Dotted path of the timestamp field the policy applies to
    pub field: String,

    /// Validity window, e.g. `"90days"`
    pub valid_for: String,
}

impl RetentionPolicy {
    /// Parses the validity window.
    pub fn window(&self) -> Result<std::time::Duration> {
        humantime::parse_duration(&self.valid_for)
            .map_err(|e| Error::BadDefinition(format!("retention valid_for: {e}")))
    }
}

/// A table definition.
///
/// Unknown top-level fields are ignored for forward compatibility.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Definition {
    /// Input patterns; at least one is required
    #[serde(rename = "input")]
    pub inputs: Vec<InputSpec>,

    /// Partition fields derived from pattern captures
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partitions: Vec<PartitionSpec>,

    /// Retention policy
    #[serde(default, rename = "retention_policy", skip_serializing_if = "Option::is_none")]
    pub retention: Option<RetentionPolicy>,

    /// Feature flags mutating the ingest configuration
    #[serde(default, rename = "beta_features", skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<String>,

    /// Suppresses the initial backfill listing
    #[serde(default, rename = "skip_backfill", skip_serializing_if = "std::ops::Not::not")]
    pub skip_backfill: bool,
}

impl Definition {
    /// Parses a definition from its JSON serialization.
    pub fn from_json(body: &[u8]) -> Result<Self> {
        if body.len() > MAX_DEFINITION_SIZE {
            return Err(Error::BadDefinition("definition too large".into()));
        }

        let def: Self = serde_json::from_slice(body)
            .map_err(|e| Error::BadDefinition(e.to_string()))?;
        def.validate()?;

        Ok(def)
    }

    /// Validates patterns, partitions and retention.
    pub fn validate(&self) -> Result<()> {
        if self.inputs.is_empty() {
            return Err(Error::BadDefinition("no input patterns".into()));
        }

        for input in &self.inputs {
            let (_, glob) = input
                .pattern
                .split_once("://")
                .ok_or(Error::BadPattern("input pattern is not a URI"))?;
            pattern::verify(glob)?;
        }

        crate::partition::verify_specs(&self.partitions)?;

        if let Some(retention) = &self.retention {
            if retention.field.is_empty() {
                return Err(Error::BadDefinition("retention field is empty".into()));
            }
            retention.window()?;
        }

        Ok(())
    }

    /// Content hash of the canonical serialization, stored in the index
    /// to detect definition changes.
    #[must_use]
    pub fn hash(&self) -> Checksum {
        #[allow(clippy::expect_used)]
        let bytes = serde_json::to_vec(self).expect("definition serializes");
        Checksum::of(&bytes)
    }

    /// Applies feature flags to a per-operation configuration copy.
    ///
    /// Unknown flags are ignored.
    pub fn apply_features(&self, config: &mut Config) {
        for flag in &self.features {
            match flag.as_str() {
                "legacy-zstd" => config.algo = "zstd".into(),
                "iguana-v0" => config.algo = "zion+iguana_v0".into(),
                _ => log::debug!("ignoring unknown beta feature {flag:?}"),
            }
        }
    }
}

/// Path of a table's definition object.
#[must_use]
pub fn definition_path(db: &str, table: &str) -> String {
    format!("db/{db}/{table}/definition.json")
}

/// Path of a table's signed index object.
#[must_use]
pub fn index_path(db: &str, table: &str) -> String {
    format!("db/{db}/{table}/index")
}

/// Directory of a table's objects.
#[must_use]
pub fn table_dir(db: &str, table: &str) -> String {
    format!("db/{db}/{table}")
}

/// Loads and validates a definition from the tenant root.
pub fn load_definition(fs: &impl InputFs, db: &str, table: &str) -> Result<Definition> {
    let path = definition_path(db, table);
    let mut body = vec![];

    fs.open_object(&path)?
        .take(MAX_DEFINITION_SIZE as u64 + 1)
        .read_to_end(&mut body)?;

    Definition::from_json(&body)
}

/// Writes a definition to the tenant root.
pub fn write_definition(
    fs: &impl OutputFs,
    db: &str,
    table: &str,
    def: &Definition,
) -> Result<()> {
    def.validate()?;

    let body = serde_json::to_vec_pretty(def)
        .map_err(|e| Error::BadDefinition(e.to_string()))?;
    fs.put(&definition_path(db, table), &body)?;

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<Definition> {
        Definition::from_json(json.as_bytes())
    }

    #[test]
    fn minimal() {
        let def = parse(r#"{"input":[{"pattern":"file://a-prefix/*.10n"}]}"#).unwrap();
        assert_eq!(1, def.inputs.len());
        assert!(def.partitions.is_empty());
        assert!(!def.skip_backfill);
    }

    #[test]
    fn unknown_fields_ignored() {
        let def = parse(
            r#"{"input":[{"pattern":"file://x/*"}],"future_field":{"a":1}}"#,
        )
        .unwrap();
        assert_eq!(1, def.inputs.len());
    }

    #[test]
    fn full_shape() {
        let def = parse(
            r#"{
                "input": [{"pattern": "file://b/{part}/*.block", "format": "json", "hints": {"k": 1}}],
                "partitions": [{"field": "part"}, {"field": "n", "type": "int", "value": "$part"}],
                "retention_policy": {"field": "attrs.time", "valid_for": "90days"},
                "beta_features": ["legacy-zstd"],
                "skip_backfill": true
            }"#,
        )
        .unwrap();

        assert_eq!(PartitionType::Int, def.partitions[1].kind);
        assert!(def.skip_backfill);

        let mut config = Config::default();
        def.apply_features(&mut config);
        assert_eq!("zstd", config.algo);
    }

    #[test]
    fn timestamp_alias() {
        let def = parse(
            r#"{"input":[{"pattern":"file://x/{t}/*"}],
                "partitions":[{"field":"t","type":"timestamp"}]}"#,
        )
        .unwrap();
        assert_eq!(PartitionType::Datetime, def.partitions[0].kind);
    }

    #[test]
    fn rejects_bad_shapes() {
        assert!(parse(r#"{"input":[]}"#).is_err());
        assert!(parse(r#"{"input":[{"pattern":"no-scheme/*"}]}"#).is_err());
        assert!(parse(r#"{"input":[{"pattern":"file://x/{a}{b}"}]}"#).is_err());
        assert!(parse(
            r#"{"input":[{"pattern":"file://x/*"}],
                "retention_policy":{"field":"t","valid_for":"not a duration"}}"#,
        )
        .is_err());
    }

    #[test]
    fn rejects_oversized() {
        let mut json = String::from(r#"{"input":[{"pattern":"file://x/*"}],"pad":""#);
        json.push_str(&"x".repeat(MAX_DEFINITION_SIZE));
        json.push_str(r#""}"#);
        assert!(parse(&json).is_err());
    }

    #[test]
    fn hash_tracks_content() {
        let a = parse(r#"{"input":[{"pattern":"file://x/*"}]}"#).unwrap();
        let b = parse(r#"{"input":[{"pattern":"file://x/*"}]}"#).unwrap();
        let c = parse(r#"{"input":[{"pattern":"file://y/*"}]}"#).unwrap();

        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());

        // Unknown fields do not survive canonicalization
        let d = parse(r#"{"input":[{"pattern":"file://x/*"}],"zzz":3}"#).unwrap();
        assert_eq!(a.hash(), d.hash());
    }

    #[test]
    fn paths() {
        assert_eq!("db/d/t/definition.json", definition_path("d", "t"));
        assert_eq!("db/d/t/index", index_path("d", "t"));
        assert_eq!("db/d/t", table_dir("d", "t"));
    }
}
