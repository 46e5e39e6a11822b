// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Contract of the pull-based notification queue feeding the runner.
//!
//! The transport (S3 event delivery, SQS, a local channel in tests) is
//! external; the engine only pulls, processes and finalizes.

use crate::{sparse::Micros, Result};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

/// One queued object notification.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QueueItem {
    /// Full source URI, matched against input patterns
    pub path: String,

    /// Source etag at event time
    pub etag: String,

    /// Source size in bytes
    pub size: u64,

    /// Event timestamp (µs)
    pub event_time: Micros,
}

/// Final verdict on one queue item.
///
/// The order is a severity order: when several tables process the same
/// item, the worst verdict wins.
#[derive(Copy, Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[repr(u8)]
pub enum ItemStatus {
    /// Handled (including "matched nothing")
    Ok = 0,

    /// The table was busy (scanning); redeliver later
    TryAgain = 1,

    /// Ingest failed; redeliver per the transport's retry policy
    WriteError = 2,
}

impl ItemStatus {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Ok,
            1 => Self::TryAgain,
            _ => Self::WriteError,
        }
    }
}

/// Concurrently mergeable status cell: later writers may only worsen
/// the verdict, never improve it.
#[derive(Debug, Default)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    /// Merges `status` in, keeping the worse of the two.
    pub fn worsen(&self, status: ItemStatus) {
        self.0.fetch_max(status as u8, Ordering::AcqRel);
    }

    /// Reads the merged verdict.
    #[must_use]
    pub fn get(&self) -> ItemStatus {
        ItemStatus::from_raw(self.0.load(Ordering::Acquire))
    }
}

/// Result of one [`Queue::next`] pull.
#[derive(Debug)]
pub enum Polled {
    /// An item arrived
    Item(QueueItem),

    /// The pause elapsed without an item
    TimedOut,

    /// The queue is closed; drain and shut down
    Closed,
}

/// A pull-based notification queue.
pub trait Queue: Send {
    /// Pulls the next item, blocking forever when `pause` is `None`.
    fn next(&mut self, pause: Option<Duration>) -> Result<Polled>;

    /// Delivers the final verdict for an item.
    fn finalize(&mut self, item: &QueueItem, status: ItemStatus) -> Result<()>;

    /// Releases the queue.
    fn close(&mut self) -> Result<()>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn severity_merge_is_worse_wins() {
        let cell = StatusCell::default();
        assert_eq!(ItemStatus::Ok, cell.get());

        cell.worsen(ItemStatus::TryAgain);
        assert_eq!(ItemStatus::TryAgain, cell.get());

        cell.worsen(ItemStatus::Ok);
        assert_eq!(ItemStatus::TryAgain, cell.get(), "status never improves");

        cell.worsen(ItemStatus::WriteError);
        assert_eq!(ItemStatus::WriteError, cell.get());
    }

    #[test]
    fn severity_order() {
        assert!(ItemStatus::Ok < ItemStatus::TryAgain);
        assert!(ItemStatus::TryAgain < ItemStatus::WriteError);
    }
}
