// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{read_str, write_str, Decode, DecodeError, Encode, EncodeError},
    sparse::Micros,
    trailer::Trailer,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Version identifier of the packed object encoding.
pub const FORMAT_VERSION: u8 = 1;

/// Identity and store metadata of one object.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ObjectInfo {
    /// Store path, rooted at the tenant root
    pub path: String,

    /// Store entity tag at the time the object was observed
    pub etag: String,

    /// Last modification time (µs)
    pub last_modified: Micros,

    /// Compressed size in bytes
    pub size: u64,

    /// Packed encoding version
    pub format: u8,
}

impl ObjectInfo {
    /// Two infos identify the same object iff path and etag match.
    #[must_use]
    pub fn same_object(&self, other: &Self) -> bool {
        self.path == other.path && self.etag == other.etag
    }
}

impl Encode for ObjectInfo {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        write_str(writer, &self.path)?;
        write_str(writer, &self.etag)?;
        writer.write_i64::<LittleEndian>(self.last_modified)?;
        writer.write_u64::<LittleEndian>(self.size)?;
        writer.write_u8(self.format)?;
        Ok(())
    }
}

impl Decode for ObjectInfo {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let path = read_str(reader)?;
        let etag = read_str(reader)?;
        let last_modified = reader.read_i64::<LittleEndian>()?;
        let size = reader.read_u64::<LittleEndian>()?;
        let format = reader.read_u8()?;

        Ok(Self {
            path,
            etag,
            last_modified,
            size,
            format,
        })
    }
}

/// A manifest entry for one packed object.
#[derive(Clone, Debug, PartialEq)]
pub struct Descriptor {
    /// Object identity and store metadata
    pub info: ObjectInfo,

    /// Self-description written by the converter
    pub trailer: Trailer,
}

impl Descriptor {
    /// Returns the partition directory of the object
    /// (its parent directory).
    #[must_use]
    pub fn partition_dir(&self) -> &str {
        match self.info.path.rfind('/') {
            Some(i) => self.info.path.get(..i).unwrap_or_default(),
            None => "",
        }
    }

    /// Returns the object's base name.
    #[must_use]
    pub fn base_name(&self) -> &str {
        match self.info.path.rfind('/') {
            Some(i) => self.info.path.get(i + 1..).unwrap_or_default(),
            None => &self.info.path,
        }
    }
}

impl Encode for Descriptor {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        self.info.encode_into(writer)?;
        self.trailer.encode_into(writer)?;
        Ok(())
    }
}

impl Decode for Descriptor {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let info = ObjectInfo::decode_from(reader)?;
        let trailer = Trailer::decode_from(reader)?;
        Ok(Self { info, trailer })
    }
}

/// Returns the object suffix for a compression label.
#[must_use]
pub fn algo_suffix(algo: &str) -> &'static str {
    if algo == "zstd" {
        ".ion.zst"
    } else {
        ".zion"
    }
}

/// Generates a fresh packed object base name: `packed-<base32-uuid><suffix>`.
///
/// The random component guarantees per-directory uniqueness, which the
/// GC sweep relies on when comparing base names.
#[must_use]
pub fn packed_name(algo: &str) -> String {
    format!(
        "packed-{}{}",
        base32(uuid::Uuid::new_v4().as_bytes()),
        algo_suffix(algo),
    )
}

/// Generates a fresh input page base name.
#[must_use]
pub fn inputs_name() -> String {
    format!("inputs-{}", base32(uuid::Uuid::new_v4().as_bytes()))
}

/// Generates a fresh indirect reference block base name.
#[must_use]
pub fn refs_name() -> String {
    format!("refs-{}", base32(uuid::Uuid::new_v4().as_bytes()))
}

const B32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

// Unpadded RFC 4648 base32, lowercased for friendlier object paths.
#[allow(clippy::indexing_slicing)] // idx is masked to 0..32
fn base32(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len().div_ceil(5) * 8);
    let mut acc: u32 = 0;
    let mut bits = 0u32;

    for &b in bytes {
        acc = (acc << 8) | u32::from(b);
        bits += 8;

        while bits >= 5 {
            bits -= 5;
            let idx = ((acc >> bits) & 0x1f) as usize;
            out.push(char::from(B32_ALPHABET[idx]));
        }
    }

    if bits > 0 {
        let idx = ((acc << (5 - bits)) & 0x1f) as usize;
        out.push(char::from(B32_ALPHABET[idx]));
    }

    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::sparse::SparseIndex;

    #[test]
    fn packed_names_are_unique() {
        let a = packed_name("zion");
        let b = packed_name("zion");

        assert!(a.starts_with("packed-"));
        assert!(a.ends_with(".zion"));
        assert_ne!(a, b);

        assert!(packed_name("zstd").ends_with(".ion.zst"));
        assert!(packed_name("zion+iguana_v0").ends_with(".zion"));
    }

    #[test]
    fn base32_known_values() {
        assert_eq!("", base32(b""));
        assert_eq!("me", base32(b"f"));
        assert_eq!("mzxw6ytboi", base32(b"foobar"));
    }

    #[test]
    fn path_helpers() {
        let desc = Descriptor {
            info: ObjectInfo {
                path: "db/default/parking/p1/packed-abc.zion".into(),
                etag: "v1".into(),
                last_modified: 0,
                size: 10,
                format: FORMAT_VERSION,
            },
            trailer: Trailer::default(),
        };

        assert_eq!("db/default/parking/p1", desc.partition_dir());
        assert_eq!("packed-abc.zion", desc.base_name());
    }

    #[test]
    fn roundtrip() {
        let desc = Descriptor {
            info: ObjectInfo {
                path: "db/d/t/packed-x.zion".into(),
                etag: "etag-1".into(),
                last_modified: 123_456,
                size: 999,
                format: FORMAT_VERSION,
            },
            trailer: Trailer {
                algo: "zion".into(),
                decompressed: 1_234,
                align: 1_024,
                blocks: vec![],
                sparse: SparseIndex::new(0),
            },
        };

        let buf = desc.encode_into_vec().unwrap();
        let got = Descriptor::decode_from(&mut &buf[..]).unwrap();
        assert_eq!(desc, got);
    }
}
