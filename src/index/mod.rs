// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The per-table index: the authoritative manifest of packed objects,
//! seen inputs, quarantined paths and scan progress.
//!
//! On disk the index is a single sealed object at
//! `db/<db>/<table>/index`; it is either fully present and valid under
//! the tenant key, or treated as absent.

pub mod indirect;
pub mod inputs;

pub use indirect::{BlockCache, BlockRef, IndirectTree};
pub use inputs::{InputTree, PageRef, REJECTED};

use crate::{
    checksum::Checksum,
    coding::{read_str, write_str, Decode, DecodeError, Encode},
    descriptor::Descriptor,
    fs::OutputFs,
    sparse::Micros,
    tenant::Key,
    Error, Result,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Read;

/// Maximum size of the sealed index object.
///
/// The index is fetched and verified on every table operation, so it
/// must stay cheap; descriptors beyond this budget belong in the
/// indirect tree.
pub const MAX_INDEX_SIZE: usize = 15 * 1_024 * 1_024;

/// Current index format version.
pub const INDEX_VERSION: u8 = 1;

const INDEX_MAGIC: [u8; 3] = *b"PDX";

/// Decode flag: skip loading the input fingerprint tree.
///
/// Query readers never consult inputs; skipping them keeps hot-path
/// loads small.
pub const FLAG_SKIP_INPUTS: u32 = 1;

/// An object awaiting safe physical deletion.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Quarantined {
    /// Store path of the doomed object
    pub path: String,

    /// Earliest time (µs) at which deletion is safe
    pub expiry: Micros,
}

/// Engine-owned state persisted opaquely alongside the manifest.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UserData {
    /// Content hash of the definition the index was built under
    pub definition_hash: Checksum,

    /// Resumption cursor of an interrupted packed-object sweep
    pub packed_gc_cursor: String,
}

/// The table manifest.
#[derive(Debug)]
pub struct Index {
    /// Table name
    pub name: String,

    /// Compression label of newly packed objects
    pub algo: String,

    /// Time of the last successful write (µs)
    pub created: Micros,

    /// Engine-owned opaque state
    pub user_data: UserData,

    /// Recently written descriptors, referenced directly
    pub inline: Vec<Descriptor>,

    /// Older descriptors, referenced through compressed blocks
    pub indirect: IndirectTree,

    /// Fingerprints of every source ever accepted or rejected
    pub inputs: InputTree,

    /// Quarantine list
    pub to_delete: Vec<Quarantined>,

    /// One list cursor per input pattern
    pub cursors: Vec<String>,

    /// `true` while the initial backfill is still catching up
    pub scanning: bool,
}

impl Index {
    /// Creates a fresh index for a table.
    #[must_use]
    pub fn new(name: &str, algo: &str, definition_hash: Checksum) -> Self {
        Self {
            name: name.into(),
            algo: algo.into(),
            created: crate::sparse::now_micros(),
            user_data: UserData {
                definition_hash,
                packed_gc_cursor: String::new(),
            },
            inline: vec![],
            indirect: IndirectTree::default(),
            inputs: InputTree::default(),
            to_delete: vec![],
            cursors: vec![],
            scanning: false,
        }
    }

    /// Total number of live descriptors.
    #[must_use]
    pub fn objects(&self) -> u64 {
        self.inline.len() as u64 + self.indirect.orig_objects()
    }

    /// Appends a path to the quarantine list.
    pub fn quarantine(&mut self, path: String, expiry: Micros) {
        self.to_delete.push(Quarantined { path, expiry });
    }

    /// Persists staged input fingerprints as page objects under `dir`,
    /// quarantining superseded pages.
    pub fn sync_inputs(
        &mut self,
        ofs: &impl OutputFs,
        dir: &str,
        max_per_page: usize,
        expiry: Micros,
    ) -> Result<()> {
        for path in self.inputs.sync(ofs, dir, max_per_page)? {
            self.quarantine(path, expiry);
        }
        Ok(())
    }

    /// Flushes inline descriptors into the indirect tree once their
    /// cumulative decompressed size exceeds `max_inline_bytes`.
    ///
    /// The oldest descriptors flush first; superseded reference blocks
    /// are quarantined.
    pub fn sync_outputs(
        &mut self,
        ofs: &impl OutputFs,
        cache: &BlockCache,
        dir: &str,
        max_inline_bytes: u64,
        target_merge_size: u64,
        expiry: Micros,
    ) -> Result<()> {
        let mut total: u64 = self.inline.iter().map(|d| d.trailer.decompressed).sum();

        if total <= max_inline_bytes {
            return Ok(());
        }

        let mut flush_count = 0;
        for desc in &self.inline {
            if total <= max_inline_bytes {
                break;
            }
            total -= desc.trailer.decompressed;
            flush_count += 1;
        }

        if flush_count == 0 {
            return Ok(());
        }

        log::debug!(
            "{}: flushing {flush_count} inline descriptors to the indirect tree",
            self.name,
        );

        let flushed: Vec<Descriptor> = self.inline.drain(..flush_count).collect();
        let superseded = self
            .indirect
            .append(ofs, cache, dir, flushed, target_merge_size)?;

        for path in superseded {
            self.quarantine(path, expiry);
        }

        Ok(())
    }

    /// Seals the index under the tenant key.
    pub fn encode(&self, key: &Key) -> Result<Vec<u8>> {
        let mut payload = vec![];

        write_str(&mut payload, &self.name)?;
        write_str(&mut payload, &self.algo)?;
        payload.write_i64::<LittleEndian>(self.created)?;

        payload.write_u128::<LittleEndian>(self.user_data.definition_hash.into_u128())?;
        write_str(&mut payload, &self.user_data.packed_gc_cursor)?;

        {
            use varint_rs::VarintWriter;

            #[allow(clippy::cast_possible_truncation)]
            payload.write_u32_varint(self.cursors.len() as u32)?;
            for cursor in &self.cursors {
                write_str(&mut payload, cursor)?;
            }

            payload.write_u8(u8::from(self.scanning))?;

            #[allow(clippy::cast_possible_truncation)]
            payload.write_u32_varint(self.to_delete.len() as u32)?;
            for entry in &self.to_delete {
                write_str(&mut payload, &entry.path)?;
                payload.write_i64::<LittleEndian>(entry.expiry)?;
            }

            #[allow(clippy::cast_possible_truncation)]
            payload.write_u32_varint(self.inline.len() as u32)?;
            for desc in &self.inline {
                desc.encode_into(&mut payload)?;
            }
        }

        self.indirect.encode_into(&mut payload)?;

        // Inputs encode last so query readers can stop early
        self.inputs.encode_into(&mut payload)?;

        let mut body = INDEX_MAGIC.to_vec();
        body.push(INDEX_VERSION);
        body.extend_from_slice(&lz4_flex::compress_prepend_size(&payload));

        let digest = key.seal(&body);
        body.extend_from_slice(&digest.into_u128().to_le_bytes());

        if body.len() > MAX_INDEX_SIZE {
            return Err(Error::IndexTooLarge(body.len()));
        }

        Ok(body)
    }

    /// Verifies and decodes a sealed index.
    pub fn decode(key: &Key, body: &[u8], flags: u32) -> Result<Self> {
        if body.len() > MAX_INDEX_SIZE {
            return Err(Error::IndexTooLarge(body.len()));
        }

        let Some(split_at) = body.len().checked_sub(16) else {
            return Err(Error::SealMismatch);
        };

        #[allow(clippy::indexing_slicing)]
        let (head, digest_bytes) = body.split_at(split_at);

        let mut raw = [0u8; 16];
        raw.copy_from_slice(digest_bytes);
        key.verify(head, Checksum::from_raw(u128::from_le_bytes(raw)))?;

        let Some((magic, rest)) = head.split_at_checked(INDEX_MAGIC.len()) else {
            return Err(Error::SealMismatch);
        };
        if magic != INDEX_MAGIC {
            return Err(Error::SealMismatch);
        }

        let Some((&version, compressed)) = rest.split_first() else {
            return Err(Error::SealMismatch);
        };
        if version != INDEX_VERSION {
            return Err(Error::IndexObsolete(version));
        }

        let payload =
            lz4_flex::decompress_size_prepended(compressed).map_err(|_| Error::Decompress)?;
        let mut reader = &payload[..];

        Self::decode_payload(&mut reader, flags)
    }

    fn decode_payload(reader: &mut &[u8], flags: u32) -> Result<Self> {
        use varint_rs::VarintReader;

        let name = read_str(reader).map_err(Error::Decode)?;
        let algo = read_str(reader).map_err(Error::Decode)?;
        let created = reader.read_i64::<LittleEndian>()?;

        let definition_hash = Checksum::from_raw(reader.read_u128::<LittleEndian>()?);
        let packed_gc_cursor = read_str(reader).map_err(Error::Decode)?;

        let cursor_count = reader.read_u32_varint()? as usize;
        if cursor_count > MAX_LIST {
            return Err(Error::Decode(DecodeError::InvalidLength("cursor count")));
        }
        let mut cursors = Vec::with_capacity(cursor_count);
        for _ in 0..cursor_count {
            cursors.push(read_str(reader).map_err(Error::Decode)?);
        }

        let scanning = reader.read_u8()? != 0;

        let quarantine_count = reader.read_u32_varint()? as usize;
        if quarantine_count > MAX_LIST {
            return Err(Error::Decode(DecodeError::InvalidLength("quarantine count")));
        }
        let mut to_delete = Vec::with_capacity(quarantine_count);
        for _ in 0..quarantine_count {
            let path = read_str(reader).map_err(Error::Decode)?;
            let expiry = reader.read_i64::<LittleEndian>()?;
            to_delete.push(Quarantined { path, expiry });
        }

        let inline_count = reader.read_u32_varint()? as usize;
        if inline_count > MAX_LIST {
            return Err(Error::Decode(DecodeError::InvalidLength("inline count")));
        }
        let mut inline = Vec::with_capacity(inline_count);
        for _ in 0..inline_count {
            inline.push(Descriptor::decode_from(reader).map_err(Error::Decode)?);
        }

        let indirect = IndirectTree::decode_from(reader).map_err(Error::Decode)?;

        let inputs = if flags & FLAG_SKIP_INPUTS == 0 {
            InputTree::decode_from(reader).map_err(Error::Decode)?
        } else {
            InputTree::default()
        };

        Ok(Self {
            name,
            algo,
            created,
            user_data: UserData {
                definition_hash,
                packed_gc_cursor,
            },
            inline,
            indirect,
            inputs,
            to_delete,
            cursors,
            scanning,
        })
    }
}

const MAX_LIST: usize = 1 << 22;
