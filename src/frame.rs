use std::path::PathBuf;
use std::sync::Arc;

/// A decoded camera frame as delivered by the capture layer or produced by
/// the codec capability.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Pixel data (shared ownership for efficiency)
    pub data: Arc<Vec<u8>>,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
}

impl RawFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data: Arc::new(data),
            width,
            height,
        }
    }
}

/// Identifies a single frame's encoded bytes persisted on disk.
///
/// Ownership of a handle transfers from the reorder stage to the delay
/// window, then to the replay window; the underlying file is deleted at most
/// once, on final eviction or bulk clear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageHandle {
    /// Capture-order sequence number of the persisted frame
    pub sequence: u64,
    /// Location of the encoded bytes
    pub path: PathBuf,
}

/// A frame as tracked by the buffering pipeline: its sequence number plus
/// the handle to its persisted encoded bytes.
#[derive(Debug, Clone)]
pub struct Frame {
    pub sequence: u64,
    pub handle: StorageHandle,
}

impl Frame {
    pub fn new(handle: StorageHandle) -> Self {
        Self {
            sequence: handle.sequence,
            handle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_carries_handle_sequence() {
        let handle = StorageHandle {
            sequence: 42,
            path: PathBuf::from("/tmp/frames/42"),
        };
        let frame = Frame::new(handle.clone());

        assert_eq!(frame.sequence, 42);
        assert_eq!(frame.handle, handle);
    }

    #[test]
    fn test_raw_frame_shares_data() {
        let frame = RawFrame::new(vec![1, 2, 3], 3, 1);
        let clone = frame.clone();
        assert!(Arc::ptr_eq(&frame.data, &clone.data));
    }
}
