// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::time::Duration;

/// Compression label applied to newly packed objects.
///
/// The label selects the packed object suffix and is stamped into the
/// index so query readers know how to open the blobs.
pub const DEFAULT_ALGO: &str = "zion";

/// Engine configuration builder
///
/// A table operation takes a *copy* of this configuration at its start;
/// definition feature flags mutate the copy, never the shared value.
#[derive(Clone, Debug)]
pub struct Config {
    /// Compression label for newly packed objects
    pub algo: String,

    /// Block alignment handed to the converter
    pub align: usize,

    /// Objects below this size stay open for prepend-merging
    pub min_merge_size: u64,

    /// Decompressed inline bytes above which descriptors are
    /// flushed into the indirect tree
    pub max_inline_bytes: u64,

    /// Target decompressed payload per indirect reference block
    pub target_merge_size: u64,

    /// Maximum number of objects visited per scan step
    pub max_scan_objects: usize,

    /// Maximum number of source bytes collected per scan step
    pub max_scan_bytes: u64,

    /// Soft deadline for a single scan step
    pub max_scan_time: Duration,

    /// Quarantined objects younger than this are never deleted
    pub gc_minimum_age: Duration,

    /// Unreferenced input/reference pages younger than this are never deleted
    pub input_minimum_age: Duration,

    /// Soft budget for a full GC sweep before a resumption
    /// cursor is persisted
    pub gc_max_delay: Duration,

    /// Percent chance that a write additionally runs a full packfile sweep
    pub gc_likelihood: u32,

    /// Maximum fingerprint entries per input page object
    pub max_inputs_per_page: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            algo: DEFAULT_ALGO.into(),
            align: 1_024 * 1_024,
            min_merge_size: /* 50 MiB */ 50 * 1_024 * 1_024,
            max_inline_bytes: /* 100 GiB */ 100 * 1_024 * 1_024 * 1_024,
            target_merge_size: /* 1 GiB */ 1_024 * 1_024 * 1_024,
            max_scan_objects: 8_192,
            max_scan_bytes: /* 1 GiB */ 1_024 * 1_024 * 1_024,
            max_scan_time: Duration::from_secs(15),
            gc_minimum_age: Duration::from_secs(15 * 60),
            input_minimum_age: Duration::from_secs(30),
            gc_max_delay: Duration::from_secs(30),
            gc_likelihood: 1,
            max_inputs_per_page: 8_192,
        }
    }
}

impl Config {
    /// Sets the compression label.
    #[must_use]
    pub fn algo(mut self, algo: &str) -> Self {
        self.algo = algo.into();
        self
    }

    /// Sets the converter block alignment.
    #[must_use]
    pub fn align(mut self, align: usize) -> Self {
        self.align = align;
        self
    }

    /// Sets the prepend-merge threshold.
    #[must_use]
    pub fn min_merge_size(mut self, bytes: u64) -> Self {
        self.min_merge_size = bytes;
        self
    }

    /// Sets the inline flush threshold.
    #[must_use]
    pub fn max_inline_bytes(mut self, bytes: u64) -> Self {
        self.max_inline_bytes = bytes;
        self
    }

    /// Sets the indirect block target size.
    #[must_use]
    pub fn target_merge_size(mut self, bytes: u64) -> Self {
        self.target_merge_size = bytes;
        self
    }

    /// Caps the number of objects per scan step.
    #[must_use]
    pub fn max_scan_objects(mut self, n: usize) -> Self {
        self.max_scan_objects = n;
        self
    }

    /// Caps the number of collected bytes per scan step.
    #[must_use]
    pub fn max_scan_bytes(mut self, bytes: u64) -> Self {
        self.max_scan_bytes = bytes;
        self
    }

    /// Sets the per-step scan deadline.
    #[must_use]
    pub fn max_scan_time(mut self, d: Duration) -> Self {
        self.max_scan_time = d;
        self
    }

    /// Sets the quarantine minimum age.
    #[must_use]
    pub fn gc_minimum_age(mut self, d: Duration) -> Self {
        self.gc_minimum_age = d;
        self
    }

    /// Sets the input page minimum age.
    #[must_use]
    pub fn input_minimum_age(mut self, d: Duration) -> Self {
        self.input_minimum_age = d;
        self
    }

    /// Sets the full-sweep soft budget.
    #[must_use]
    pub fn gc_max_delay(mut self, d: Duration) -> Self {
        self.gc_max_delay = d;
        self
    }

    /// Sets the percent chance of a full sweep per write.
    #[must_use]
    pub fn gc_likelihood(mut self, percent: u32) -> Self {
        self.gc_likelihood = percent.min(100);
        self
    }
}
