// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{read_str, write_str, Decode, DecodeError, Encode, EncodeError},
    sparse::SparseIndex,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Offset and row count of one block inside a packed object.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BlockDesc {
    /// Byte offset of the block start
    pub offset: u64,
    /// Number of rows stored in the block
    pub rows: u64,
}

/// Self-description appended to every packed object by the converter.
///
/// The engine treats the trailer as opaque except for its sparse index;
/// block layout and row counts are carried through for query consumers.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Trailer {
    /// Compression label the object was written with
    pub algo: String,

    /// Total decompressed payload size in bytes
    pub decompressed: u64,

    /// Block alignment the object was written with
    pub align: u32,

    /// Block layout
    pub blocks: Vec<BlockDesc>,

    /// Ranges of values stored per field path
    pub sparse: SparseIndex,
}

impl Trailer {
    /// Returns the total row count across blocks.
    #[must_use]
    pub fn rows(&self) -> u64 {
        self.blocks.iter().map(|b| b.rows).sum()
    }
}

impl Encode for Trailer {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        use varint_rs::VarintWriter;

        write_str(writer, &self.algo)?;
        writer.write_u64::<LittleEndian>(self.decompressed)?;
        writer.write_u32::<LittleEndian>(self.align)?;

        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32_varint(self.blocks.len() as u32)?;

        for block in &self.blocks {
            writer.write_u64_varint(block.offset)?;
            writer.write_u64_varint(block.rows)?;
        }

        self.sparse.encode_into(writer)?;

        Ok(())
    }
}

impl Decode for Trailer {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        use varint_rs::VarintReader;

        let algo = read_str(reader)?;
        let decompressed = reader.read_u64::<LittleEndian>()?;
        let align = reader.read_u32::<LittleEndian>()?;

        let block_count = reader.read_u32_varint()? as usize;
        if block_count > MAX_BLOCKS {
            return Err(DecodeError::InvalidLength("trailer block count"));
        }

        let mut blocks = Vec::with_capacity(block_count);
        for _ in 0..block_count {
            let offset = reader.read_u64_varint()?;
            let rows = reader.read_u64_varint()?;
            blocks.push(BlockDesc { offset, rows });
        }

        let sparse = SparseIndex::decode_from(reader)?;

        Ok(Self {
            algo,
            decompressed,
            align,
            blocks,
            sparse,
        })
    }
}

const MAX_BLOCKS: usize = 1 << 20;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut sparse = SparseIndex::new(2);
        sparse.push("attrs.time", 1_700_000_000_000_000);

        let trailer = Trailer {
            algo: "zion".into(),
            decompressed: 4_096,
            align: 1_024,
            blocks: vec![
                BlockDesc { offset: 0, rows: 10 },
                BlockDesc {
                    offset: 2_048,
                    rows: 7,
                },
            ],
            sparse,
        };

        let buf = trailer.encode_into_vec().unwrap();
        let got = Trailer::decode_from(&mut &buf[..]).unwrap();

        assert_eq!(trailer, got);
        assert_eq!(17, got.rows());
    }
}
