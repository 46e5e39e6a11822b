// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{check_path, InputFs, Meta, Precondition, Upload, WalkFlow};
use crate::{pattern, Error, Result};
use std::{
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::UNIX_EPOCH,
};

/// Local directory tree acting as an object store.
///
/// This is the development loopback: etags are derived from length and
/// mtime, and conditional writes are read-compare-persist rather than
/// atomic. Production stores provide real preconditions; the engine's
/// correctness tests for races run against [`super::MemoryFs`].
#[derive(Clone)]
pub struct DirFs {
    root: Arc<PathBuf>,
}

impl DirFs {
    /// Creates a filesystem rooted at `root`.
    #[must_use]
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: Arc::new(root.as_ref().into()),
        }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        check_path(path)?;
        Ok(self.root.join(path))
    }

    fn meta_of(meta: &std::fs::Metadata) -> Meta {
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_nanos());

        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        Meta {
            etag: format!("{:x}-{mtime:x}", meta.len()),
            size: meta.len(),
            last_modified: (mtime / 1_000) as i64,
        }
    }

    fn walk_dir(
        &self,
        dir: &Path,
        prefix: &str,
        glob: &str,
        start_after: &str,
        visit: &mut dyn FnMut(&str, &Meta) -> Result<WalkFlow>,
    ) -> Result<WalkFlow> {
        let mut entries: Vec<(String, PathBuf, bool)> = match std::fs::read_dir(dir) {
            Ok(iter) => iter
                .map(|entry| {
                    entry.and_then(|e| {
                        let is_dir = e.file_type()?.is_dir();
                        Ok((e.file_name().to_string_lossy().into_owned(), e.path(), is_dir))
                    })
                })
                .collect::<std::io::Result<_>>()?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(WalkFlow::Continue),
            Err(e) => return Err(e.into()),
        };

        // Sort so traversal order equals byte order of full relative
        // paths (directories compare with a trailing '/')
        entries.sort_by(|a, b| {
            let ka = if a.2 { format!("{}/", a.0) } else { a.0.clone() };
            let kb = if b.2 { format!("{}/", b.0) } else { b.0.clone() };
            ka.cmp(&kb)
        });

        for (name, full, is_dir) in entries {
            let rel = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };

            if is_dir {
                // Skip subtrees the cursor has fully passed: every path
                // below `rel/` is lexicographically smaller than the
                // cursor once the cursor diverges above it
                let dir_prefix = format!("{rel}/");
                if start_after > dir_prefix.as_str() && !start_after.starts_with(&dir_prefix) {
                    continue;
                }
                if self.walk_dir(&full, &rel, glob, start_after, visit)? == WalkFlow::Stop {
                    return Ok(WalkFlow::Stop);
                }
            } else {
                if rel.as_str() <= start_after {
                    continue;
                }
                if !pattern::matches(glob, &rel).unwrap_or(false) {
                    continue;
                }

                let meta = Self::meta_of(&std::fs::metadata(&full)?);
                if visit(&rel, &meta)? == WalkFlow::Stop {
                    return Ok(WalkFlow::Stop);
                }
            }
        }

        Ok(WalkFlow::Continue)
    }

    fn persist(&self, path: &str, body: &[u8]) -> Result<Meta> {
        let dest = self.resolve(path)?;

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        #[allow(clippy::expect_used)]
        let parent = dest.parent().expect("object paths have a parent");

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(body)?;
        tmp.flush()?;
        tmp.as_file_mut().sync_all()?;
        tmp.persist(&dest).map_err(|e| Error::Io(e.error))?;

        Ok(Self::meta_of(&std::fs::metadata(&dest)?))
    }
}

impl super::InputFs for DirFs {
    fn open_object(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        let full = self.resolve(path)?;
        let file = std::fs::File::open(full)?;
        Ok(Box::new(file))
    }

    fn stat(&self, path: &str) -> Result<Meta> {
        let full = self.resolve(path)?;
        let meta = std::fs::metadata(full)?;

        if meta.is_dir() {
            return Err(Error::not_exist(path));
        }

        Ok(Self::meta_of(&meta))
    }

    fn walk(
        &self,
        glob: &str,
        start_after: &str,
        visit: &mut dyn FnMut(&str, &Meta) -> Result<WalkFlow>,
    ) -> Result<()> {
        self.walk_dir(&self.root.clone(), "", glob, start_after, visit)
            .map(|_| ())
    }

    fn url(&self, path: &str, _etag: &str) -> Result<String> {
        Ok(format!("file://{}", self.root.join(path).display()))
    }
}

impl super::OutputFs for DirFs {
    fn put(&self, path: &str, body: &[u8]) -> Result<Meta> {
        self.persist(path, body)
    }

    fn put_cond(&self, path: &str, body: &[u8], expect: &Precondition) -> Result<Meta> {
        match expect {
            Precondition::None => {}
            Precondition::Absent => {
                if self.stat(path).is_ok() {
                    return Err(Error::SyncViolation(path.to_owned()));
                }
            }
            Precondition::MatchETag(want) => match self.stat(path) {
                Ok(meta) if meta.etag == *want => {}
                Ok(_) => return Err(Error::SyncViolation(path.to_owned())),
                Err(e) if e.is_not_exist() => {
                    return Err(Error::SyncViolation(path.to_owned()));
                }
                Err(e) => return Err(e),
            },
        }

        self.persist(path, body)
    }

    fn start_upload(&self, path: &str) -> Result<Box<dyn Upload>> {
        let dest = self.resolve(path)?;

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        #[allow(clippy::expect_used)]
        let parent = dest.parent().expect("object paths have a parent").to_owned();

        let tmp = tempfile::NamedTempFile::new_in(parent)?;

        Ok(Box::new(DirUpload {
            dest,
            tmp: Some(tmp),
        }))
    }
}

impl super::RemoveFs for DirFs {
    fn remove(&self, path: &str) -> Result<()> {
        let full = self.resolve(path)?;
        std::fs::remove_file(full)?;
        Ok(())
    }
}

struct DirUpload {
    dest: PathBuf,
    tmp: Option<tempfile::NamedTempFile>,
}

impl Write for DirUpload {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.tmp {
            Some(tmp) => tmp.write(buf),
            None => Err(std::io::Error::other("upload already finished")),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.tmp {
            Some(tmp) => tmp.flush(),
            None => Ok(()),
        }
    }
}

impl Upload for DirUpload {
    fn finish(&mut self) -> Result<Meta> {
        let Some(mut tmp) = self.tmp.take() else {
            return Err(Error::Corrupt("upload already finished"));
        };

        tmp.flush()?;
        tmp.as_file_mut().sync_all()?;
        tmp.persist(&self.dest).map_err(|e| Error::Io(e.error))?;

        Ok(DirFs::meta_of(&std::fs::metadata(&self.dest)?))
    }

    fn abort(&mut self) -> Result<()> {
        // NamedTempFile unlinks on drop
        self.tmp = None;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::fs::{InputFs, OutputFs, RemoveFs};
    use test_log::test;

    #[test]
    fn put_walk_remove() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let fs = DirFs::new(dir.path());

        fs.put("db/d/t/index", b"abc")?;
        fs.put("db/d/t/p1/packed-a.zion", b"defg")?;
        fs.put("db/d/t/p2/packed-b.zion", b"hij")?;

        let meta = fs.stat("db/d/t/index")?;
        assert_eq!(3, meta.size);

        let mut seen = vec![];
        fs.walk("db/d/t/*/packed-*", "", &mut |path, _| {
            seen.push(path.to_owned());
            Ok(WalkFlow::Continue)
        })?;
        assert_eq!(
            vec![
                "db/d/t/p1/packed-a.zion".to_owned(),
                "db/d/t/p2/packed-b.zion".to_owned(),
            ],
            seen,
        );

        fs.remove("db/d/t/index")?;
        assert!(fs.stat("db/d/t/index").unwrap_err().is_not_exist());

        Ok(())
    }

    #[test]
    fn walk_resumes_after_cursor() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let fs = DirFs::new(dir.path());

        for name in ["logs/a.json", "logs/b.json", "logs/c.json"] {
            fs.put(name, b"{}")?;
        }

        let mut seen = vec![];
        fs.walk("logs/*.json", "logs/a.json", &mut |path, _| {
            seen.push(path.to_owned());
            Ok(WalkFlow::Continue)
        })?;

        assert_eq!(vec!["logs/b.json".to_owned(), "logs/c.json".to_owned()], seen);
        Ok(())
    }

    #[test]
    fn upload_abort_leaves_nothing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let fs = DirFs::new(dir.path());

        let mut up = fs.start_upload("db/d/t/p/packed-x.zion")?;
        up.write_all(b"partial")?;
        up.abort()?;

        assert!(fs.stat("db/d/t/p/packed-x.zion").unwrap_err().is_not_exist());
        Ok(())
    }
}
