use crate::frame::Frame;
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Pending entries further than this past `expected` are treated as stale
/// artifacts of a prior reset and discarded during cleanup.
pub const STALE_WINDOW: u64 = 10;

/// Once more than this many entries sit in `pending` after cleanup, the
/// expected sequence number is assumed lost and skipped.
pub const SKIP_THRESHOLD: usize = 2;

/// Rebuilds strict sequence order from a producer that delivers frames in
/// arbitrary arrival order, with bounded patience for missing frames.
///
/// Live camera delivery is best-effort: waiting forever for one sequence
/// number would stall the entire downstream pipeline, so a frame that fails
/// to arrive while `pending` keeps growing is skipped.
///
/// Owned exclusively by the window mutation task; `expected` only increases.
pub struct ReorderStage {
    expected: u64,
    pending: BTreeMap<u64, Frame>,
}

impl ReorderStage {
    pub fn new() -> Self {
        Self {
            expected: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Accept a frame in arrival order. Ordering between submissions is not
    /// required; release order is established by `drain`.
    pub fn submit(&mut self, frame: Frame) {
        trace!(
            "Reorder submit: sequence {} (expected {})",
            frame.sequence,
            self.expected
        );
        self.pending.insert(frame.sequence, frame);
    }

    /// Release the contiguous run of frames starting at `expected`, in
    /// increasing sequence order, then clean up the pending map.
    ///
    /// Cleanup discards entries already superseded (`< expected`) or too far
    /// ahead to belong to the current run (`> expected + STALE_WINDOW`). If
    /// more than `SKIP_THRESHOLD` entries remain pending afterwards, the
    /// missing expected frame is presumed dropped by the producer and
    /// skipped, so the stream keeps moving.
    pub fn drain(&mut self) -> Vec<Frame> {
        let mut released = Vec::new();

        while let Some(frame) = self.pending.remove(&self.expected) {
            self.expected += 1;
            released.push(frame);
        }

        let expected = self.expected;
        let before = self.pending.len();
        self.pending
            .retain(|&sequence, _| sequence >= expected && sequence <= expected + STALE_WINDOW);
        if self.pending.len() != before {
            debug!(
                "Reorder cleanup dropped {} stale entries (expected {})",
                before - self.pending.len(),
                expected
            );
        }

        if self.pending.len() > SKIP_THRESHOLD {
            debug!(
                "Skipping missing frame {}: {} frames waiting behind it",
                self.expected,
                self.pending.len()
            );
            self.expected += 1;
        }

        released
    }

    /// Forget all pending frames and restart the sequence at zero.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.expected = 0;
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl Default for ReorderStage {
    fn default() -> Self {
        Self::new()
    }
}
