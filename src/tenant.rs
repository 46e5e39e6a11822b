// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{checksum::Checksum, fs::AnyFs, Error, Result};
use std::sync::Arc;

/// Key under which a tenant's indexes are sealed.
///
/// Sealing is a narrow interface: the engine only needs "a keyed digest
/// nobody without the key can forge". The digest here is a keyed
/// xxh3-128; deployments that require real authenticated encryption wrap
/// index bytes one layer further out.
#[derive(Clone)]
pub struct Key([u8; 32]);

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log key material
        write!(f, "Key(..)")
    }
}

impl Key {
    /// Wraps raw key bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derives a deterministic test key from a label.
    #[must_use]
    pub fn derive_for_testing(label: &str) -> Self {
        let mut bytes = [0u8; 32];
        let a = xxhash_rust::xxh3::xxh3_128(label.as_bytes()).to_le_bytes();
        let b = xxhash_rust::xxh3::xxh3_128_with_seed(label.as_bytes(), 1).to_le_bytes();

        let (lo, hi) = bytes.split_at_mut(16);
        lo.copy_from_slice(&a);
        hi.copy_from_slice(&b);

        Self(bytes)
    }

    /// Seals a payload, returning its keyed digest.
    #[must_use]
    pub fn seal(&self, payload: &[u8]) -> Checksum {
        let seed = xxhash_rust::xxh3::xxh3_64(&self.0);
        Checksum::from_raw(xxhash_rust::xxh3::xxh3_128_with_seed(payload, seed))
    }

    /// Verifies a payload against its claimed digest.
    pub fn verify(&self, payload: &[u8], claimed: Checksum) -> Result<()> {
        self.seal(payload).check(claimed)
    }
}

/// The identity, key and root filesystem bundle under which all
/// operations are authorized.
pub trait Tenant: Send + Sync {
    /// Tenant identifier.
    fn id(&self) -> &str;

    /// Index sealing key.
    fn key(&self) -> &Key;

    /// Filesystem holding `db/...` (definitions, indexes, packed objects).
    fn root(&self) -> &AnyFs;

    /// Peels the URI scheme off an input pattern, returning the
    /// filesystem to list and the trailing glob within it.
    fn split(&self, pattern: &str) -> Result<(AnyFs, String)>;
}

/// A tenant whose sources live on the same filesystem as its tables.
///
/// `file://` and `mem://` patterns resolve against the root; `s3://`
/// is recognized but requires the production resolver.
pub struct LocalTenant {
    id: String,
    key: Key,
    root: AnyFs,
}

impl LocalTenant {
    /// Creates a tenant over `root`.
    #[must_use]
    pub fn new(id: &str, key: Key, root: AnyFs) -> Self {
        Self {
            id: id.into(),
            key,
            root,
        }
    }
}

impl Tenant for LocalTenant {
    fn id(&self) -> &str {
        &self.id
    }

    fn key(&self) -> &Key {
        &self.key
    }

    fn root(&self) -> &AnyFs {
        &self.root
    }

    fn split(&self, pattern: &str) -> Result<(AnyFs, String)> {
        let Some((scheme, rest)) = pattern.split_once("://") else {
            return Err(Error::BadPattern("input pattern is not a URI"));
        };

        match scheme {
            "file" | "mem" => Ok((self.root.clone(), rest.to_owned())),
            "s3" => Err(Error::Unsupported("s3 resolver not configured")),
            _ => Err(Error::BadPattern("unknown URI scheme")),
        }
    }
}

/// Convenience alias used throughout the engine.
pub type SharedTenant = Arc<dyn Tenant>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::fs::MemoryFs;

    #[test]
    fn seal_verify() {
        let key = Key::derive_for_testing("a");
        let other = Key::derive_for_testing("b");

        let digest = key.seal(b"payload");
        assert!(key.verify(b"payload", digest).is_ok());
        assert!(key.verify(b"tampered", digest).is_err());
        assert!(other.verify(b"payload", digest).is_err());
    }

    #[test]
    fn split_schemes() {
        let tenant = LocalTenant::new(
            "t0",
            Key::derive_for_testing("t0"),
            AnyFs::from(MemoryFs::new()),
        );

        let (_, glob) = tenant.split("file://a-prefix/*.10n").unwrap();
        assert_eq!("a-prefix/*.10n", glob);

        assert!(tenant.split("no-scheme/*.json").is_err());
        assert!(matches!(
            tenant.split("s3://bucket/x/*"),
            Err(Error::Unsupported(_))
        ));
    }
}
