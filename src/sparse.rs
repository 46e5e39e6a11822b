// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-object sparse index: the range of timestamp values observed per
//! field path, used to skip blobs during query and to drive retention.

use crate::coding::{read_str, write_str, Decode, DecodeError, Encode, EncodeError};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::io::{Read, Write};

/// Microseconds since the Unix epoch.
pub type Micros = i64;

/// Converts a [`DateTime`] to index-resolution microseconds.
#[must_use]
pub fn micros(t: DateTime<Utc>) -> Micros {
    t.timestamp_micros()
}

/// Current wall-clock time in index resolution.
#[must_use]
pub fn now_micros() -> Micros {
    micros(Utc::now())
}

/// Closed range of observed values for one field path.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FieldRange {
    /// Minimum observed value
    pub min: Micros,
    /// Maximum observed value
    pub max: Micros,
}

impl FieldRange {
    /// Creates a single-point range.
    #[must_use]
    pub fn point(v: Micros) -> Self {
        Self { min: v, max: v }
    }

    /// Widens the range to include `v`.
    pub fn extend(&mut self, v: Micros) {
        self.min = self.min.min(v);
        self.max = self.max.max(v);
    }

    /// Widens the range to include all of `other`.
    pub fn merge(&mut self, other: Self) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }
}

/// Comparison operator of a filter leaf.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CmpOp {
    /// `field == value`
    Eq,
    /// `field >= value`
    Ge,
    /// `field <= value`
    Le,
}

/// A conservative filter over sparse summaries.
///
/// `matches_any` answers "may this object contain a matching row?", so
/// absent fields always pass: without range information nothing can be
/// proven about the object's contents.
#[derive(Clone, Debug)]
pub enum Filter {
    /// Matches everything
    All,

    /// Compares one field path against a constant
    Cmp {
        /// Dotted field path
        path: String,
        /// Comparison operator
        op: CmpOp,
        /// Comparison constant
        value: Micros,
    },

    /// Both sides may match
    And(Box<Filter>, Box<Filter>),

    /// Either side may match
    Or(Box<Filter>, Box<Filter>),
}

impl Filter {
    /// Builds the retention filter `field >= cutoff`.
    #[must_use]
    pub fn since(path: &str, cutoff: Micros) -> Self {
        Self::Cmp {
            path: path.into(),
            op: CmpOp::Ge,
            value: cutoff,
        }
    }

    /// Returns `true` for the trivial filter.
    #[must_use]
    pub fn is_trivial(&self) -> bool {
        matches!(self, Self::All)
    }
}

/// Summary of the value ranges stored per field path.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SparseIndex {
    fields: BTreeMap<String, FieldRange>,
    blocks: u32,
}

impl SparseIndex {
    /// Creates an empty summary covering `blocks` blocks.
    #[must_use]
    pub fn new(blocks: u32) -> Self {
        Self {
            fields: BTreeMap::new(),
            blocks,
        }
    }

    /// Returns the number of summarized blocks.
    #[must_use]
    pub fn blocks(&self) -> u32 {
        self.blocks
    }

    /// Returns the range recorded for `path`.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<FieldRange> {
        self.fields.get(path).copied()
    }

    /// Returns all indexed field paths.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Widens the range of `path` to include `v`.
    pub fn push(&mut self, path: &str, v: Micros) {
        self.fields
            .entry(path.to_owned())
            .and_modify(|r| r.extend(v))
            .or_insert_with(|| FieldRange::point(v));
    }

    /// Merges another summary into this one.
    pub fn merge(&mut self, other: &Self) {
        for (path, range) in &other.fields {
            self.fields
                .entry(path.clone())
                .and_modify(|r| r.merge(*range))
                .or_insert(*range);
        }
        self.blocks += other.blocks;
    }

    /// Returns whether any summarized row may satisfy `filter`.
    #[must_use]
    pub fn matches_any(&self, filter: &Filter) -> bool {
        match filter {
            Filter::All => true,
            Filter::And(a, b) => self.matches_any(a) && self.matches_any(b),
            Filter::Or(a, b) => self.matches_any(a) || self.matches_any(b),
            Filter::Cmp { path, op, value } => match self.get(path) {
                // No range info: cannot rule the object out
                None => true,
                Some(range) => match op {
                    CmpOp::Eq => range.min <= *value && *value <= range.max,
                    CmpOp::Ge => range.max >= *value,
                    CmpOp::Le => range.min <= *value,
                },
            },
        }
    }
}

impl Encode for SparseIndex {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        use varint_rs::VarintWriter;

        writer.write_u32::<LittleEndian>(self.blocks)?;

        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32_varint(self.fields.len() as u32)?;

        for (path, range) in &self.fields {
            write_str(writer, path)?;
            writer.write_i64::<LittleEndian>(range.min)?;
            writer.write_i64::<LittleEndian>(range.max)?;
        }

        Ok(())
    }
}

impl Decode for SparseIndex {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        use varint_rs::VarintReader;

        let blocks = reader.read_u32::<LittleEndian>()?;
        let field_count = reader.read_u32_varint()? as usize;

        if field_count > MAX_SPARSE_FIELDS {
            return Err(DecodeError::InvalidLength("sparse field count"));
        }

        let mut fields = BTreeMap::new();

        for _ in 0..field_count {
            let path = read_str(reader)?;
            let min = reader.read_i64::<LittleEndian>()?;
            let max = reader.read_i64::<LittleEndian>()?;
            fields.insert(path, FieldRange { min, max });
        }

        Ok(Self { fields, blocks })
    }
}

const MAX_SPARSE_FIELDS: usize = 1_024;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn sparse(min: Micros, max: Micros) -> SparseIndex {
        let mut s = SparseIndex::new(1);
        s.push("ts", min);
        s.push("ts", max);
        s
    }

    #[test]
    fn range_queries() {
        let s = sparse(100, 200);

        assert!(s.matches_any(&Filter::All));
        assert!(s.matches_any(&Filter::since("ts", 150)));
        assert!(s.matches_any(&Filter::since("ts", 200)));
        assert!(!s.matches_any(&Filter::since("ts", 201)));

        // Unknown fields are conservative
        assert!(s.matches_any(&Filter::since("other", 999)));
    }

    #[test]
    fn and_or() {
        let s = sparse(100, 200);

        let hit = Filter::since("ts", 150);
        let miss = Filter::since("ts", 500);

        assert!(!s.matches_any(&Filter::And(Box::new(hit.clone()), Box::new(miss.clone()))));
        assert!(s.matches_any(&Filter::Or(Box::new(hit), Box::new(miss))));
    }

    #[test]
    fn merge_widens() {
        let mut a = sparse(100, 200);
        let b = sparse(50, 150);
        a.merge(&b);

        assert_eq!(
            Some(FieldRange { min: 50, max: 200 }),
            a.get("ts")
        );
        assert_eq!(2, a.blocks());
    }

    #[test]
    fn roundtrip() {
        let s = sparse(-5, 1_700_000_000_000_000);

        let buf = s.encode_into_vec().unwrap();
        let got = SparseIndex::decode_from(&mut &buf[..]).unwrap();

        assert_eq!(s, got);
    }
}
