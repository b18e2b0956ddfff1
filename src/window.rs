use crate::frame::{Frame, StorageHandle};
use std::collections::VecDeque;

/// Bounded FIFO of frames, used for both the delay window and the replay
/// window.
///
/// Pushing while full is a contract violation, not a runtime condition: the
/// orchestrator always pops before pushing when full, so the panic here is
/// unreachable in correct code. `reconfigure` keeps existing contents, which
/// may leave the window over its new capacity until pops drain the excess.
pub struct BoundedWindow {
    capacity: usize,
    items: VecDeque<Frame>,
}

impl BoundedWindow {
    /// Create a window holding at most `capacity` frames.
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        if capacity == 0 {
            panic!("Window capacity must be greater than 0");
        }
        Self {
            capacity,
            items: VecDeque::with_capacity(capacity),
        }
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a frame at the back.
    ///
    /// # Panics
    /// Panics if the window is already full. Callers must pop first.
    pub fn push_back(&mut self, frame: Frame) {
        if self.is_full() {
            panic!(
                "push into full window (len {} >= capacity {})",
                self.items.len(),
                self.capacity
            );
        }
        self.items.push_back(frame);
    }

    /// Remove and return the oldest frame.
    pub fn pop_front(&mut self) -> Option<Frame> {
        self.items.pop_front()
    }

    /// Change the capacity without clearing contents. A shrink may leave the
    /// window oversized; the caller drains the excess through `pop_front`
    /// before any push can succeed.
    pub fn reconfigure(&mut self, new_capacity: usize) {
        if new_capacity == 0 {
            panic!("Window capacity must be greater than 0");
        }
        self.capacity = new_capacity;
    }

    /// Clear all contents without touching the underlying storage. The
    /// caller is responsible for storage cleanup, since a reset is also how
    /// ownership of the stored frames is transferred away.
    pub fn reset(&mut self) {
        self.items.clear();
    }

    /// Snapshot of the contained handles in sequence order.
    ///
    /// The FIFO already preserves sequence order by construction; the sort
    /// re-establishes it defensively should that guarantee ever relax.
    pub fn ordered_handles(&self) -> Vec<StorageHandle> {
        let mut handles: Vec<StorageHandle> =
            self.items.iter().map(|frame| frame.handle.clone()).collect();
        handles.sort_by_key(|handle| handle.sequence);
        handles
    }
}
