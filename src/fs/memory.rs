// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{check_path, Meta, Precondition, Upload, WalkFlow};
use crate::{pattern, slice::Slice, sparse::now_micros, Error, Result};
use std::{
    collections::BTreeMap,
    io::Read,
    sync::{Arc, Mutex},
};

#[derive(Clone, Debug)]
struct MemObject {
    data: Slice,
    etag: String,
    last_modified: i64,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<String, MemObject>,
    etag_counter: u64,
}

/// In-memory object store.
///
/// Conditional writes are exact (single lock), which makes this the
/// backend of choice for concurrency tests.
#[derive(Clone, Default)]
pub struct MemoryFs {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryFs {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    /// Returns `true` if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrites an object's modification time, for age-based tests.
    #[doc(hidden)]
    pub fn backdate(&self, path: &str, last_modified: i64) {
        if let Some(obj) = self.lock().objects.get_mut(path) {
            obj.last_modified = last_modified;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        #[allow(clippy::expect_used)]
        self.inner.lock().expect("lock is poisoned")
    }

    fn put_locked(
        inner: &mut Inner,
        path: &str,
        body: &[u8],
        expect: &Precondition,
    ) -> Result<Meta> {
        match (expect, inner.objects.get(path)) {
            (Precondition::None, _) => {}
            (Precondition::Absent, None) => {}
            (Precondition::Absent, Some(_)) => {
                return Err(Error::SyncViolation(path.to_owned()));
            }
            (Precondition::MatchETag(want), Some(cur)) if cur.etag == *want => {}
            (Precondition::MatchETag(_), _) => {
                return Err(Error::SyncViolation(path.to_owned()));
            }
        }

        inner.etag_counter += 1;
        let obj = MemObject {
            data: Slice::new(body),
            etag: format!("m{:08x}", inner.etag_counter),
            last_modified: now_micros(),
        };
        let meta = Meta {
            etag: obj.etag.clone(),
            size: obj.data.len() as u64,
            last_modified: obj.last_modified,
        };
        inner.objects.insert(path.to_owned(), obj);

        Ok(meta)
    }
}

impl super::InputFs for MemoryFs {
    fn open_object(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        let inner = self.lock();
        let obj = inner
            .objects
            .get(path)
            .ok_or_else(|| Error::not_exist(path))?;

        Ok(Box::new(Cursor {
            data: obj.data.clone(),
            pos: 0,
        }))
    }

    fn stat(&self, path: &str) -> Result<Meta> {
        let inner = self.lock();
        let obj = inner
            .objects
            .get(path)
            .ok_or_else(|| Error::not_exist(path))?;

        Ok(Meta {
            etag: obj.etag.clone(),
            size: obj.data.len() as u64,
            last_modified: obj.last_modified,
        })
    }

    fn walk(
        &self,
        glob: &str,
        start_after: &str,
        visit: &mut dyn FnMut(&str, &Meta) -> Result<WalkFlow>,
    ) -> Result<()> {
        // Snapshot matching entries so the visitor may re-enter the store
        let entries: Vec<(String, Meta)> = {
            let inner = self.lock();
            inner
                .objects
                .range::<str, _>((
                    std::ops::Bound::Excluded(start_after),
                    std::ops::Bound::Unbounded,
                ))
                .filter(|(path, _)| pattern::matches(glob, path).unwrap_or(false))
                .map(|(path, obj)| {
                    (
                        path.clone(),
                        Meta {
                            etag: obj.etag.clone(),
                            size: obj.data.len() as u64,
                            last_modified: obj.last_modified,
                        },
                    )
                })
                .collect()
        };

        for (path, meta) in entries {
            if visit(&path, &meta)? == WalkFlow::Stop {
                return Ok(());
            }
        }

        Ok(())
    }

    fn url(&self, path: &str, _etag: &str) -> Result<String> {
        Ok(format!("mem://{path}"))
    }
}

impl super::OutputFs for MemoryFs {
    fn put(&self, path: &str, body: &[u8]) -> Result<Meta> {
        self.put_cond(path, body, &Precondition::None)
    }

    fn put_cond(&self, path: &str, body: &[u8], expect: &Precondition) -> Result<Meta> {
        check_path(path)?;
        Self::put_locked(&mut self.lock(), path, body, expect)
    }

    fn start_upload(&self, path: &str) -> Result<Box<dyn Upload>> {
        check_path(path)?;
        Ok(Box::new(MemUpload {
            fs: self.clone(),
            path: path.to_owned(),
            buf: Some(vec![]),
        }))
    }
}

impl super::RemoveFs for MemoryFs {
    fn remove(&self, path: &str) -> Result<()> {
        if self.lock().objects.remove(path).is_none() {
            return Err(Error::not_exist(path));
        }
        Ok(())
    }
}

struct Cursor {
    data: Slice,
    pos: usize,
}

impl Read for Cursor {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = self.data.get(self.pos..).unwrap_or_default();
        let n = remaining.len().min(buf.len());

        #[allow(clippy::indexing_slicing)]
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;

        Ok(n)
    }
}

struct MemUpload {
    fs: MemoryFs,
    path: String,
    buf: Option<Vec<u8>>,
}

impl std::io::Write for MemUpload {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.buf {
            Some(v) => {
                v.extend_from_slice(buf);
                Ok(buf.len())
            }
            None => Err(std::io::Error::other("upload already finished")),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Upload for MemUpload {
    fn finish(&mut self) -> Result<Meta> {
        let Some(body) = self.buf.take() else {
            return Err(Error::Corrupt("upload already finished"));
        };
        MemoryFs::put_locked(&mut self.fs.lock(), &self.path, &body, &Precondition::None)
    }

    fn abort(&mut self) -> Result<()> {
        self.buf = None;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::fs::{InputFs, OutputFs, RemoveFs};

    #[test]
    fn put_get_roundtrip() -> Result<()> {
        let fs = MemoryFs::new();
        let meta = fs.put("a/b", b"hello")?;

        assert_eq!(5, meta.size);

        let mut body = vec![];
        fs.open_object("a/b")?.read_to_end(&mut body)?;
        assert_eq!(b"hello", &body[..]);

        Ok(())
    }

    #[test]
    fn conditional_writes() -> Result<()> {
        let fs = MemoryFs::new();

        let m1 = fs.put_cond("x", b"1", &Precondition::Absent)?;
        assert!(fs.put_cond("x", b"2", &Precondition::Absent).is_err());

        let m2 = fs.put_cond("x", b"2", &Precondition::MatchETag(m1.etag.clone()))?;
        assert_ne!(m1.etag, m2.etag);

        // Stale etag loses
        assert!(matches!(
            fs.put_cond("x", b"3", &Precondition::MatchETag(m1.etag)),
            Err(Error::SyncViolation(_))
        ));

        Ok(())
    }

    #[test]
    fn walk_with_cursor() -> Result<()> {
        let fs = MemoryFs::new();
        for name in ["p/a", "p/b", "p/c", "q/d"] {
            fs.put(name, b"x")?;
        }

        let mut seen = vec![];
        fs.walk("p/*", "p/a", &mut |path, _| {
            seen.push(path.to_owned());
            Ok(WalkFlow::Continue)
        })?;

        assert_eq!(vec!["p/b".to_owned(), "p/c".to_owned()], seen);
        Ok(())
    }

    #[test]
    fn remove_missing_is_not_found() {
        let fs = MemoryFs::new();
        assert!(fs.remove("nope").unwrap_err().is_not_exist());
    }
}
