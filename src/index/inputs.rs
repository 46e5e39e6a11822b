// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Paged fingerprint tree of already-seen source objects.
//!
//! Every source the engine has ever accepted (or permanently rejected)
//! is remembered as a `(path, etag, id)` triple, where `id` is the
//! ordinal of the descriptor the source landed in, or `-1` for sources
//! rejected as unparseable. Pages live as separate objects in the table
//! directory and are fetched on demand; the tree only borrows the
//! filesystem for page I/O.

use crate::{
    coding::{read_str, write_str, Decode, DecodeError, Encode, EncodeError},
    descriptor::inputs_name,
    fs::{InputFs, OutputFs},
    Error, Result,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::io::{Read, Write};

/// Marker id for permanently rejected sources.
pub const REJECTED: i64 = -1;

const PAGE_MAGIC: [u8; 4] = *b"PDIP";

/// Reference to one stored fingerprint page.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PageRef {
    /// Greatest source path stored in the page
    pub last: String,

    /// Store path of the page object
    pub path: String,

    /// Page object etag
    pub etag: String,

    /// Page object size
    pub size: u64,

    /// Number of entries in the page
    pub count: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
struct Entry {
    etag: String,
    id: i64,
}

#[derive(Debug, Default)]
struct Page {
    entries: BTreeMap<String, Entry>,
}

impl Page {
    fn encode(&self) -> Result<Vec<u8>> {
        use varint_rs::VarintWriter;

        let mut payload = vec![];

        #[allow(clippy::cast_possible_truncation)]
        payload.write_u32_varint(self.entries.len() as u32)?;

        for (path, entry) in &self.entries {
            write_str(&mut payload, path).map_err(Error::Encode)?;
            write_str(&mut payload, &entry.etag).map_err(Error::Encode)?;
            payload.write_i64::<LittleEndian>(entry.id)?;
        }

        let mut out = PAGE_MAGIC.to_vec();
        out.extend_from_slice(&lz4_flex::compress_prepend_size(&payload));

        Ok(out)
    }

    fn decode(body: &[u8]) -> Result<Self> {
        use varint_rs::VarintReader;

        let Some((magic, compressed)) = body.split_at_checked(PAGE_MAGIC.len()) else {
            return Err(Error::Decode(DecodeError::InvalidHeader("input page")));
        };
        if magic != PAGE_MAGIC {
            return Err(Error::Decode(DecodeError::InvalidHeader("input page")));
        }

        let payload =
            lz4_flex::decompress_size_prepended(compressed).map_err(|_| Error::Decompress)?;
        let mut reader = &payload[..];

        let count = reader.read_u32_varint()? as usize;
        let mut entries = BTreeMap::new();

        for _ in 0..count {
            let path = read_str(&mut reader).map_err(Error::Decode)?;
            let etag = read_str(&mut reader).map_err(Error::Decode)?;
            let id = reader.read_i64::<LittleEndian>()?;
            entries.insert(path, Entry { etag, id });
        }

        Ok(Self { entries })
    }
}

/// The fingerprint tree.
#[derive(Debug, Default)]
pub struct InputTree {
    pages: Vec<PageRef>,
    loaded: FxHashMap<usize, Page>,
    dirty: BTreeMap<String, Entry>,
}

impl InputTree {
    /// Records a source observation.
    ///
    /// * `Ok(true)`: the source is new (or replaces a rejected entry
    ///   whose bytes changed) and should be ingested.
    /// * `Ok(false)`: the identical `(path, etag)` is already known.
    /// * [`Error::ETagChanged`]: the path is known under a different
    ///   etag and was already ingested; the caller skips it.
    pub fn append(&mut self, fs: &impl InputFs, path: &str, etag: &str, id: i64) -> Result<bool> {
        if let Some(existing) = self.lookup(fs, path)? {
            if existing.etag == etag {
                return Ok(false);
            }
            if existing.id != REJECTED {
                return Err(Error::ETagChanged(path.to_owned()));
            }
            // Rejected bytes were overwritten; give the new content a chance
        }

        self.dirty.insert(
            path.to_owned(),
            Entry {
                etag: etag.to_owned(),
                id,
            },
        );

        Ok(true)
    }

    /// Returns whether `path` is known, under any etag.
    pub fn contains(&mut self, fs: &impl InputFs, path: &str) -> Result<bool> {
        Ok(self.lookup(fs, path)?.is_some())
    }

    /// Returns the `(etag, id)` recorded for `path`.
    pub fn get(&mut self, fs: &impl InputFs, path: &str) -> Result<Option<(String, i64)>> {
        Ok(self.lookup(fs, path)?.map(|e| (e.etag.clone(), e.id)))
    }

    /// Warms the page cache for a batch of paths.
    pub fn prefetch<'a>(
        &mut self,
        fs: &impl InputFs,
        paths: impl Iterator<Item = &'a str>,
    ) -> Result<()> {
        let mut wanted: Vec<usize> = paths.filter_map(|p| self.page_of(p)).collect();
        wanted.sort_unstable();
        wanted.dedup();

        for idx in wanted {
            self.load(fs, idx)?;
        }

        Ok(())
    }

    /// Visits every page reference.
    pub fn each_page(&self, mut visit: impl FnMut(&PageRef)) {
        for page in &self.pages {
            visit(page);
        }
    }

    /// Visits every entry in path order. Loads all pages.
    pub fn walk(
        &mut self,
        fs: &impl InputFs,
        mut visit: impl FnMut(&str, &str, i64),
    ) -> Result<()> {
        for idx in 0..self.pages.len() {
            self.load(fs, idx)?;
        }

        // Pages partition the key space, so page order is path order;
        // dirty entries overlay them
        let mut merged: BTreeMap<&String, &Entry> = BTreeMap::new();
        for page in self.loaded.values() {
            for (path, entry) in &page.entries {
                merged.insert(path, entry);
            }
        }
        for (path, entry) in &self.dirty {
            merged.insert(path, entry);
        }

        for (path, entry) in merged {
            visit(path, &entry.etag, entry.id);
        }

        Ok(())
    }

    /// Returns `true` if no staged entries await [`InputTree::sync`].
    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.dirty.is_empty()
    }

    /// Writes staged entries into page objects under `dir`, returning
    /// the store paths of superseded pages for quarantining.
    pub fn sync(
        &mut self,
        ofs: &impl OutputFs,
        dir: &str,
        max_per_page: usize,
    ) -> Result<Vec<String>> {
        if self.dirty.is_empty() {
            return Ok(vec![]);
        }

        let max_per_page = max_per_page.max(1);
        let mut superseded = vec![];
        let mut new_pages: Vec<PageRef> = vec![];
        let dirty = std::mem::take(&mut self.dirty);

        // Partition staged entries by the page whose range covers them;
        // everything beyond the final page boundary joins the last page
        let mut per_page: FxHashMap<usize, BTreeMap<String, Entry>> = FxHashMap::default();
        for (path, entry) in dirty {
            let idx = match self.page_of(&path) {
                Some(idx) => idx,
                None => self.pages.len().saturating_sub(1),
            };
            per_page.entry(idx).or_default().insert(path, entry);
        }

        for idx in 0..self.pages.len().max(1) {
            let staged = per_page.remove(&idx);

            if staged.is_none() {
                if let Some(page) = self.pages.get(idx) {
                    new_pages.push(page.clone());
                }
                continue;
            }

            let mut entries = match self.pages.get(idx) {
                Some(_) => {
                    self.load(ofs, idx)?;
                    self.loaded
                        .remove(&idx)
                        .map(|p| p.entries)
                        .unwrap_or_default()
                }
                None => BTreeMap::new(),
            };

            if let Some(staged) = staged {
                entries.extend(staged);
            }

            if let Some(old) = self.pages.get(idx) {
                superseded.push(old.path.clone());
            }

            // Split oversized pages
            let mut chunk = BTreeMap::new();
            let total = entries.len();
            for (i, (path, entry)) in entries.into_iter().enumerate() {
                chunk.insert(path, entry);

                if chunk.len() == max_per_page || i + 1 == total {
                    let page = Page {
                        entries: std::mem::take(&mut chunk),
                    };
                    new_pages.push(write_page(ofs, dir, &page)?);
                }
            }
        }

        self.loaded.clear();
        self.pages = new_pages;

        Ok(superseded)
    }

    fn lookup(&mut self, fs: &impl InputFs, path: &str) -> Result<Option<&Entry>> {
        if self.dirty.contains_key(path) {
            return Ok(self.dirty.get(path));
        }

        let Some(idx) = self.page_of(path) else {
            return Ok(None);
        };

        self.load(fs, idx)?;

        Ok(self
            .loaded
            .get(&idx)
            .and_then(|page| page.entries.get(path)))
    }

    // First page whose greatest path is >= `path`
    fn page_of(&self, path: &str) -> Option<usize> {
        let idx = self
            .pages
            .partition_point(|page| page.last.as_str() < path);
        (idx < self.pages.len()).then_some(idx)
    }

    fn load(&mut self, fs: &impl InputFs, idx: usize) -> Result<()> {
        if self.loaded.contains_key(&idx) {
            return Ok(());
        }

        let Some(page_ref) = self.pages.get(idx) else {
            return Err(Error::Corrupt("input page index out of range"));
        };

        let mut body = vec![];
        fs.open_object(&page_ref.path)?.read_to_end(&mut body)?;

        let page = Page::decode(&body)?;
        self.loaded.insert(idx, page);

        Ok(())
    }
}

fn write_page(ofs: &impl OutputFs, dir: &str, page: &Page) -> Result<PageRef> {
    let Some(last) = page.entries.keys().next_back().cloned() else {
        return Err(Error::Corrupt("empty input page"));
    };

    let path = format!("{dir}/{}", inputs_name());
    let body = page.encode()?;
    let meta = ofs.put(&path, &body)?;

    log::trace!("wrote input page {path} ({} entries)", page.entries.len());

    #[allow(clippy::cast_possible_truncation)]
    Ok(PageRef {
        last,
        path,
        etag: meta.etag,
        size: meta.size,
        count: page.entries.len() as u32,
    })
}

impl Encode for InputTree {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        use varint_rs::VarintWriter;

        if !self.is_synced() {
            return Err(EncodeError::Unsynced("input tree"));
        }

        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32_varint(self.pages.len() as u32)?;

        for page in &self.pages {
            write_str(writer, &page.last)?;
            write_str(writer, &page.path)?;
            write_str(writer, &page.etag)?;
            writer.write_u64::<LittleEndian>(page.size)?;
            writer.write_u32::<LittleEndian>(page.count)?;
        }

        Ok(())
    }
}

impl Decode for InputTree {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        use varint_rs::VarintReader;

        let count = reader.read_u32_varint()? as usize;
        if count > MAX_PAGES {
            return Err(DecodeError::InvalidLength("input page count"));
        }

        let mut pages = Vec::with_capacity(count);

        for _ in 0..count {
            let last = read_str(reader)?;
            let path = read_str(reader)?;
            let etag = read_str(reader)?;
            let size = reader.read_u64::<LittleEndian>()?;
            let count = reader.read_u32::<LittleEndian>()?;
            pages.push(PageRef {
                last,
                path,
                etag,
                size,
                count,
            });
        }

        Ok(Self {
            pages,
            loaded: FxHashMap::default(),
            dirty: BTreeMap::new(),
        })
    }
}

const MAX_PAGES: usize = 1 << 20;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::fs::MemoryFs;

    #[test]
    fn append_dedup_semantics() -> Result<()> {
        let fs = MemoryFs::new();
        let mut tree = InputTree::default();

        assert!(tree.append(&fs, "src/a.json", "e1", 0)?);
        assert!(!tree.append(&fs, "src/a.json", "e1", 0)?, "same etag dedups");
        assert!(!tree.append(&fs, "src/a.json", "e1", 5)?, "id is irrelevant");

        assert!(matches!(
            tree.append(&fs, "src/a.json", "e2", 1),
            Err(Error::ETagChanged(_))
        ));

        assert!(tree.contains(&fs, "src/a.json")?);
        assert!(!tree.contains(&fs, "src/b.json")?);

        Ok(())
    }

    #[test]
    fn rejected_entries_allow_new_bytes() -> Result<()> {
        let fs = MemoryFs::new();
        let mut tree = InputTree::default();

        assert!(tree.append(&fs, "bad.json", "e1", REJECTED)?);
        assert!(!tree.append(&fs, "bad.json", "e1", 7)?, "same bytes stay rejected");

        // New bytes under a new etag may be retried
        assert!(tree.append(&fs, "bad.json", "e2", 7)?);
        assert_eq!(Some(("e2".into(), 7)), tree.get(&fs, "bad.json")?);

        Ok(())
    }

    #[test]
    fn sync_pages_and_reload() -> Result<()> {
        let fs = MemoryFs::new();
        let mut tree = InputTree::default();

        for i in 0..10 {
            tree.append(&fs, &format!("src/{i:02}.json"), "e1", i)?;
        }

        assert!(!tree.is_synced());
        let superseded = tree.sync(&fs, "db/d/t", 4)?;
        assert!(superseded.is_empty(), "fresh tree supersedes nothing");
        assert!(tree.is_synced());

        // 10 entries / 4 per page = 3 pages
        let mut page_count = 0;
        tree.each_page(|_| page_count += 1);
        assert_eq!(3, page_count);

        // Reload through the encoded root
        let root = tree.encode_into_vec().unwrap();
        let mut reloaded = InputTree::decode_from(&mut &root[..]).unwrap();

        for i in 0..10 {
            assert!(reloaded.contains(&fs, &format!("src/{i:02}.json"))?);
        }
        assert!(!reloaded.contains(&fs, "src/99.json")?);

        Ok(())
    }

    #[test]
    fn resync_supersedes_touched_pages() -> Result<()> {
        let fs = MemoryFs::new();
        let mut tree = InputTree::default();

        for i in 0..8 {
            tree.append(&fs, &format!("src/{i:02}.json"), "e1", i)?;
        }
        tree.sync(&fs, "db/d/t", 4)?;

        let mut before = vec![];
        tree.each_page(|p| before.push(p.path.clone()));
        assert_eq!(2, before.len());

        // Touches only the first page's range
        tree.append(&fs, "src/00a.json", "e1", 9)?;
        let superseded = tree.sync(&fs, "db/d/t", 4)?;

        assert_eq!(vec![before[0].clone()], superseded);

        let mut after = vec![];
        tree.each_page(|p| after.push(p.path.clone()));
        assert!(after.contains(&before[1]), "untouched page survives");
        assert!(!after.contains(&before[0]));

        Ok(())
    }

    #[test]
    fn encode_requires_sync() {
        let fs = MemoryFs::new();
        let mut tree = InputTree::default();
        tree.append(&fs, "a", "e1", 0).unwrap();

        assert!(matches!(
            tree.encode_into_vec(),
            Err(EncodeError::Unsynced(_))
        ));
    }
}
