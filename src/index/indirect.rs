// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Reference tree of descriptors that have outgrown the inline list.
//!
//! Older descriptors are packed into compressed reference blocks stored
//! as separate objects; the index keeps one [`BlockRef`] per block with
//! an aggregated sparse index, so queries and retention can skip whole
//! blocks without fetching them.

use crate::{
    coding::{read_str, write_str, Decode, DecodeError, Encode, EncodeError},
    descriptor::{refs_name, Descriptor},
    fs::{InputFs, OutputFs},
    sparse::{Filter, SparseIndex},
    Error, Result,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use std::sync::Arc;

const BLOCK_MAGIC: [u8; 4] = *b"PDRB";

/// Reference to one stored descriptor block.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockRef {
    /// Store path of the block object
    pub path: String,

    /// Block object etag
    pub etag: String,

    /// Block object size
    pub size: u64,

    /// Number of descriptors in the block
    pub objects: u32,

    /// Total decompressed payload of the referenced packed objects
    pub raw_bytes: u64,

    /// Union of the referenced objects' sparse indexes
    pub sparse: SparseIndex,
}

/// Cache of decoded descriptor blocks, keyed by `(path, etag)`.
pub struct BlockCache {
    inner: quick_cache::sync::Cache<(String, String), Arc<Vec<Descriptor>>>,
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new(256)
    }
}

impl BlockCache {
    /// Creates a cache holding up to `blocks` decoded blocks.
    #[must_use]
    pub fn new(blocks: usize) -> Self {
        Self {
            inner: quick_cache::sync::Cache::new(blocks),
        }
    }

    fn fetch(&self, fs: &impl InputFs, block: &BlockRef) -> Result<Arc<Vec<Descriptor>>> {
        let key = (block.path.clone(), block.etag.clone());

        if let Some(hit) = self.inner.get(&key) {
            return Ok(hit);
        }

        let mut body = vec![];
        fs.open_object(&block.path)?.read_to_end(&mut body)?;

        let descs = Arc::new(decode_block(&body)?);
        self.inner.insert(key, descs.clone());

        Ok(descs)
    }
}

/// Result of a retention purge over the tree.
#[derive(Debug, Default)]
pub struct Purged {
    /// Block objects that were replaced or emptied
    pub superseded_blocks: Vec<String>,

    /// Packed objects no longer referenced anywhere
    pub dropped_packed: Vec<String>,
}

/// The indirect descriptor reference tree.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IndirectTree {
    refs: Vec<BlockRef>,
}

impl IndirectTree {
    /// Returns the number of descriptors across all blocks.
    #[must_use]
    pub fn orig_objects(&self) -> u64 {
        self.refs.iter().map(|r| u64::from(r.objects)).sum()
    }

    /// Returns `true` if the tree holds no blocks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    /// Visits every block reference.
    pub fn each_ref(&self, mut visit: impl FnMut(&BlockRef)) {
        for block in &self.refs {
            visit(block);
        }
    }

    /// Returns descriptors whose sparse summary may satisfy `filter`.
    ///
    /// Blocks whose aggregate cannot match are skipped without a fetch.
    pub fn search(
        &self,
        fs: &impl InputFs,
        cache: &BlockCache,
        filter: &Filter,
    ) -> Result<Vec<Descriptor>> {
        let mut out = vec![];

        for block in &self.refs {
            if !block.sparse.matches_any(filter) {
                continue;
            }

            let descs = cache.fetch(fs, block)?;

            if filter.is_trivial() {
                out.extend(descs.iter().cloned());
            } else {
                out.extend(
                    descs
                        .iter()
                        .filter(|d| d.trailer.sparse.matches_any(filter))
                        .cloned(),
                );
            }
        }

        Ok(out)
    }

    /// Appends descriptors flushed from the inline list.
    ///
    /// The trailing block is topped up to `target_raw_bytes` of
    /// decompressed payload before fresh blocks are opened. Returns the
    /// store paths of superseded block objects.
    pub fn append(
        &mut self,
        ofs: &impl OutputFs,
        cache: &BlockCache,
        dir: &str,
        mut descs: Vec<Descriptor>,
        target_raw_bytes: u64,
    ) -> Result<Vec<String>> {
        if descs.is_empty() {
            return Ok(vec![]);
        }

        let mut superseded = vec![];

        // Reopen the trailing block if it still has room
        if let Some(last) = self.refs.last() {
            if last.raw_bytes < target_raw_bytes {
                let existing = cache.fetch(ofs, last)?;
                let mut merged = existing.as_ref().clone();
                merged.append(&mut descs);
                descs = merged;

                superseded.push(last.path.clone());
                self.refs.pop();
            }
        }

        let mut chunk: Vec<Descriptor> = vec![];
        let mut chunk_raw = 0u64;
        let total = descs.len();

        for (i, desc) in descs.into_iter().enumerate() {
            chunk_raw += desc.trailer.decompressed;
            chunk.push(desc);

            if chunk_raw >= target_raw_bytes || i + 1 == total {
                let block = write_block(ofs, dir, std::mem::take(&mut chunk))?;
                self.refs.push(block);
                chunk_raw = 0;
            }
        }

        Ok(superseded)
    }

    /// Drops descriptors that `keep` cannot match, rewriting the blocks
    /// that shrank.
    pub fn purge(
        &mut self,
        ofs: &impl OutputFs,
        cache: &BlockCache,
        dir: &str,
        keep: &Filter,
    ) -> Result<Purged> {
        let mut result = Purged::default();
        let mut kept_refs = vec![];

        for block in std::mem::take(&mut self.refs) {
            if block.sparse.matches_any(keep) {
                // The aggregate may still hide expired members
                let descs = cache.fetch(ofs, &block)?;
                let (kept, dropped): (Vec<_>, Vec<_>) = descs
                    .iter()
                    .cloned()
                    .partition(|d| d.trailer.sparse.matches_any(keep));

                if dropped.is_empty() {
                    kept_refs.push(block);
                    continue;
                }

                result
                    .dropped_packed
                    .extend(dropped.iter().map(|d| d.info.path.clone()));
                result.superseded_blocks.push(block.path.clone());

                if !kept.is_empty() {
                    kept_refs.push(write_block(ofs, dir, kept)?);
                }
            } else {
                // Nothing in the block can be in range
                let descs = cache.fetch(ofs, &block)?;
                result
                    .dropped_packed
                    .extend(descs.iter().map(|d| d.info.path.clone()));
                result.superseded_blocks.push(block.path.clone());
            }
        }

        self.refs = kept_refs;

        Ok(result)
    }
}

fn write_block(ofs: &impl OutputFs, dir: &str, descs: Vec<Descriptor>) -> Result<BlockRef> {
    use varint_rs::VarintWriter;

    let mut payload = vec![];

    #[allow(clippy::cast_possible_truncation)]
    payload.write_u32_varint(descs.len() as u32)?;

    let mut sparse = SparseIndex::new(0);
    let mut raw_bytes = 0u64;

    for desc in &descs {
        desc.encode_into(&mut payload).map_err(Error::Encode)?;
        sparse.merge(&desc.trailer.sparse);
        raw_bytes += desc.trailer.decompressed;
    }

    let mut body = BLOCK_MAGIC.to_vec();
    body.extend_from_slice(&lz4_flex::compress_prepend_size(&payload));

    let path = format!("{dir}/{}", refs_name());
    let meta = ofs.put(&path, &body)?;

    log::trace!("wrote descriptor block {path} ({} descriptors)", descs.len());

    #[allow(clippy::cast_possible_truncation)]
    Ok(BlockRef {
        path,
        etag: meta.etag,
        size: meta.size,
        objects: descs.len() as u32,
        raw_bytes,
        sparse,
    })
}

fn decode_block(body: &[u8]) -> Result<Vec<Descriptor>> {
    use varint_rs::VarintReader;

    let Some((magic, compressed)) = body.split_at_checked(BLOCK_MAGIC.len()) else {
        return Err(Error::Decode(DecodeError::InvalidHeader("descriptor block")));
    };
    if magic != BLOCK_MAGIC {
        return Err(Error::Decode(DecodeError::InvalidHeader("descriptor block")));
    }

    let payload =
        lz4_flex::decompress_size_prepended(compressed).map_err(|_| Error::Decompress)?;
    let mut reader = &payload[..];

    let count = reader.read_u32_varint()? as usize;
    let mut descs = Vec::with_capacity(count.min(1 << 16));

    for _ in 0..count {
        descs.push(Descriptor::decode_from(&mut reader).map_err(Error::Decode)?);
    }

    Ok(descs)
}

impl Encode for IndirectTree {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        use varint_rs::VarintWriter;

        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32_varint(self.refs.len() as u32)?;

        for block in &self.refs {
            write_str(writer, &block.path)?;
            write_str(writer, &block.etag)?;
            writer.write_u64::<LittleEndian>(block.size)?;
            writer.write_u32::<LittleEndian>(block.objects)?;
            writer.write_u64::<LittleEndian>(block.raw_bytes)?;
            block.sparse.encode_into(writer)?;
        }

        Ok(())
    }
}

impl Decode for IndirectTree {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        use varint_rs::VarintReader;

        let count = reader.read_u32_varint()? as usize;
        if count > MAX_BLOCK_REFS {
            return Err(DecodeError::InvalidLength("block ref count"));
        }

        let mut refs = Vec::with_capacity(count);

        for _ in 0..count {
            let path = read_str(reader)?;
            let etag = read_str(reader)?;
            let size = reader.read_u64::<LittleEndian>()?;
            let objects = reader.read_u32::<LittleEndian>()?;
            let raw_bytes = reader.read_u64::<LittleEndian>()?;
            let sparse = SparseIndex::decode_from(reader)?;
            refs.push(BlockRef {
                path,
                etag,
                size,
                objects,
                raw_bytes,
                sparse,
            });
        }

        Ok(Self { refs })
    }
}

const MAX_BLOCK_REFS: usize = 1 << 20;
