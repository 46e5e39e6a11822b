// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Groups incoming sources by the partition key computed from pattern
//! captures.

use crate::{
    converter::Source,
    definition::{PartitionSpec, PartitionType},
    pattern::{self, Captures},
    sparse::Micros,
    Error, Result,
};
use chrono::{NaiveDate, Utc};
use rustc_hash::FxHashMap;

/// A typed partition constant, stamped onto every row of the partition
/// by the converter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypedValue {
    /// Verbatim string
    String(String),

    /// Base-10 signed integer
    Int(i64),

    /// Timestamp (µs)
    Timestamp(Micros),
}

/// Validates partition specs before any matching happens.
pub fn verify_specs(specs: &[PartitionSpec]) -> Result<()> {
    for (i, spec) in specs.iter().enumerate() {
        if spec.field.is_empty() {
            return Err(Error::BadDefinition("empty partition field name".into()));
        }

        if specs
            .iter()
            .take(i)
            .any(|other| other.field == spec.field)
        {
            return Err(Error::BadDefinition(format!(
                "duplicate partition field {:?}",
                spec.field,
            )));
        }

        // Without a template the field doubles as the capture name
        if spec.value.is_none()
            && !spec
                .field
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(Error::BadDefinition(format!(
                "partition field {:?} is not a capture identifier",
                spec.field,
            )));
        }
    }

    Ok(())
}

/// One partition's worth of collected sources.
pub struct Group {
    /// Partition path prefix (`""` for unpartitioned tables)
    pub prefix: String,

    /// Constants stamped onto every row
    pub constants: Vec<(String, TypedValue)>,

    /// Collected sources, in arrival order
    pub sources: Vec<Source>,
}

/// Collects `(glob, source)` pairs into partition groups.
pub struct Collector<'d> {
    specs: &'d [PartitionSpec],
    groups: Vec<Group>,
    lookup: FxHashMap<String, usize>,
}

impl<'d> Collector<'d> {
    /// Creates a collector; spec validation failures surface here,
    /// before any matching.
    pub fn new(specs: &'d [PartitionSpec]) -> Result<Self> {
        verify_specs(specs)?;

        Ok(Self {
            specs,
            groups: vec![],
            lookup: FxHashMap::default(),
        })
    }

    /// Matches `source` against `glob` and files it under its partition.
    ///
    /// Returns the group index, or `None` if the path does not match the
    /// pattern (globbed listings overmatch; captures are the authority).
    pub fn add(&mut self, glob: &str, source: Source) -> Result<Option<usize>> {
        let Some(caps) = pattern::match_pattern(glob, &source.path)? else {
            return Ok(None);
        };

        let mut prefix = String::new();

        for spec in self.specs {
            let segment = segment_value(spec, &caps)?;
            check_segment(&segment)?;

            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(&segment);
        }

        let idx = match self.lookup.get(&prefix) {
            Some(&idx) => idx,
            None => {
                // Typed constants are evaluated once per key, against the
                // first matching source's captures
                let constants = self
                    .specs
                    .iter()
                    .map(|spec| {
                        let raw = segment_value(spec, &caps)?;
                        Ok((spec.field.clone(), typed_value(spec.kind, &raw)?))
                    })
                    .collect::<Result<Vec<_>>>()?;

                let idx = self.groups.len();
                self.groups.push(Group {
                    prefix: prefix.clone(),
                    constants,
                    sources: vec![],
                });
                self.lookup.insert(prefix, idx);
                idx
            }
        };

        #[allow(clippy::indexing_slicing)]
        self.groups[idx].sources.push(source);

        Ok(Some(idx))
    }

    /// Computes the partition key `path` would land in, without
    /// collecting anything.
    ///
    /// Scanners use this to decide whether a listed object is worth
    /// opening before it is filed with [`Collector::add`].
    pub fn key_of(&self, glob: &str, path: &str) -> Result<Option<String>> {
        let Some(caps) = pattern::match_pattern(glob, path)? else {
            return Ok(None);
        };

        let mut prefix = String::new();

        for spec in self.specs {
            let segment = segment_value(spec, &caps)?;
            check_segment(&segment)?;

            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(&segment);
        }

        Ok(Some(prefix))
    }

    /// Returns total source count and byte size.
    #[must_use]
    pub fn total(&self) -> (usize, u64) {
        let mut count = 0;
        let mut bytes = 0;

        for group in &self.groups {
            count += group.sources.len();
            bytes += group.sources.iter().map(|s| s.size).sum::<u64>();
        }

        (count, bytes)
    }

    /// Returns `true` if no partition holds any source.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(|g| g.sources.is_empty())
    }

    /// Returns the collected groups.
    #[must_use]
    pub fn into_groups(self) -> Vec<Group> {
        self.groups
    }

    /// Borrows the collected groups.
    #[must_use]
    pub fn groups(&self) -> &[Group] {
        &self.groups
    }
}

fn segment_value(spec: &PartitionSpec, caps: &Captures) -> Result<String> {
    match &spec.value {
        Some(template) => pattern::expand(template, caps),
        None => caps
            .get(&spec.field)
            .map(str::to_owned)
            .ok_or_else(|| {
                Error::BadTemplate(format!("undefined capture ${}", spec.field))
            }),
    }
}

fn check_segment(segment: &str) -> Result<()> {
    let ok = !segment.is_empty()
        && segment
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..");

    if ok {
        Ok(())
    } else {
        Err(Error::BadDefinition(format!(
            "invalid partition segment {segment:?}",
        )))
    }
}

fn typed_value(kind: PartitionType, raw: &str) -> Result<TypedValue> {
    match kind {
        PartitionType::String => Ok(TypedValue::String(raw.to_owned())),

        PartitionType::Int => raw
            .parse::<i64>()
            .map(TypedValue::Int)
            .map_err(|_| Error::BadDefinition(format!("not an integer: {raw:?}"))),

        PartitionType::Date => {
            let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map_err(|_| Error::BadDefinition(format!("not a date: {raw:?}")))?;
            let midnight = date
                .and_hms_opt(0, 0, 0)
                .ok_or(Error::Corrupt("invalid midnight"))?
                .and_utc();
            Ok(TypedValue::Timestamp(midnight.timestamp_micros()))
        }

        PartitionType::Datetime => {
            let parsed = chrono::DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .or_else(|_| {
                    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| ()).and_then(|d| {
                        d.and_hms_opt(0, 0, 0).map(|t| t.and_utc()).ok_or(())
                    })
                })
                .map_err(|()| Error::BadDefinition(format!("not a timestamp: {raw:?}")))?;
            Ok(TypedValue::Timestamp(parsed.timestamp_micros()))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn source(path: &str, size: u64) -> Source {
        Source {
            path: path.into(),
            etag: "e1".into(),
            size,
            format: None,
            hints: None,
            body: Box::new(std::io::empty()),
        }
    }

    fn spec(field: &str, kind: PartitionType, value: Option<&str>) -> PartitionSpec {
        PartitionSpec {
            field: field.into(),
            kind,
            value: value.map(str::to_owned),
        }
    }

    #[test]
    fn groups_by_capture() -> Result<()> {
        let specs = vec![spec("part", PartitionType::String, None)];
        let mut collector = Collector::new(&specs)?;

        collector.add("b/{part}/*.block", source("b/p1/x.block", 10))?;
        collector.add("b/{part}/*.block", source("b/p2/x.block", 20))?;
        collector.add("b/{part}/*.block", source("b/p1/y.block", 30))?;

        let groups = collector.into_groups();
        assert_eq!(2, groups.len());
        assert_eq!("p1", groups[0].prefix);
        assert_eq!(2, groups[0].sources.len());
        assert_eq!(
            vec![("part".to_owned(), TypedValue::String("p1".into()))],
            groups[0].constants,
        );

        Ok(())
    }

    #[test]
    fn non_matching_path_is_dropped() -> Result<()> {
        let specs = vec![spec("part", PartitionType::String, None)];
        let mut collector = Collector::new(&specs)?;

        // Matches the glob rewrite but not the capture (empty capture)
        let placed = collector.add("b/x{part}/*.block", source("b/x/y.block", 1))?;
        assert!(placed.is_none());
        assert!(collector.is_empty());

        Ok(())
    }

    #[test]
    fn typed_values() -> Result<()> {
        let specs = vec![
            spec("day", PartitionType::Date, None),
            spec("n", PartitionType::Int, Some("$num")),
        ];
        let mut collector = Collector::new(&specs)?;

        collector.add(
            "logs/{day}/{num}.json",
            source("logs/2024-03-05/17.json", 1),
        )?;

        let groups = collector.into_groups();
        assert_eq!("2024-03-05/17", groups[0].prefix);

        let expected_day = NaiveDate::from_ymd_opt(2024, 3, 5)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp_micros();

        assert_eq!(
            vec![
                ("day".to_owned(), TypedValue::Timestamp(expected_day)),
                ("n".to_owned(), TypedValue::Int(17)),
            ],
            groups[0].constants,
        );

        Ok(())
    }

    #[test]
    fn bad_int_value_errors() -> Result<()> {
        let specs = vec![spec("n", PartitionType::Int, None)];
        let mut collector = Collector::new(&specs)?;

        assert!(collector
            .add("x/{n}.json", source("x/notanint.json", 1))
            .is_err());

        Ok(())
    }

    #[test]
    fn rejects_dotted_segments() -> Result<()> {
        let specs = vec![spec("part", PartitionType::String, None)];
        let mut collector = Collector::new(&specs)?;

        assert!(collector
            .add("b/{part}/x", source("b/../x", 1))
            .is_err());

        Ok(())
    }

    #[test]
    fn spec_validation() {
        assert!(verify_specs(&[spec("", PartitionType::String, None)]).is_err());
        assert!(verify_specs(&[
            spec("a", PartitionType::String, None),
            spec("a", PartitionType::String, None),
        ])
        .is_err());
        assert!(verify_specs(&[spec("a-b", PartitionType::String, None)]).is_err());
        assert!(verify_specs(&[spec("a-b", PartitionType::String, Some("$x"))]).is_ok());
    }

    #[test]
    fn totals() -> Result<()> {
        let specs = vec![];
        let mut collector = Collector::new(&specs)?;

        assert!(collector.is_empty());
        collector.add("*.json", source("a.json", 100))?;
        collector.add("*.json", source("b.json", 50))?;

        assert_eq!((2, 150), collector.total());
        assert!(!collector.is_empty());

        let groups = collector.groups();
        assert_eq!(1, groups.len());
        assert_eq!("", groups[0].prefix);

        Ok(())
    }
}
