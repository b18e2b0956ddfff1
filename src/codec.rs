use crate::error::{ExportError, ProcessingError};
use crate::frame::RawFrame;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Still-image codec capability: rotate, encode, decode. Implementations
/// live outside the core (hardware JPEG, libjpeg bindings, ...); the
/// pipeline only orchestrates calls to them.
#[async_trait]
pub trait FrameCodec: Send + Sync {
    /// Rotate a frame by the given number of degrees (0, 90, 180, 270).
    async fn rotate(&self, frame: RawFrame, degrees: u16) -> Result<RawFrame, ProcessingError>;

    /// Encode a raw frame into its persisted byte form.
    async fn encode(&self, frame: &RawFrame) -> Result<Vec<u8>, ProcessingError>;

    /// Decode persisted bytes back into a raw frame.
    async fn decode(&self, bytes: &[u8]) -> Result<RawFrame, ProcessingError>;
}

/// One unit of encoder output.
///
/// Encoders may emit codec configuration data (headers) before any real
/// payload; such chunks are flagged and must not be muxed as samples.
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    pub data: Vec<u8>,
    pub is_config: bool,
}

impl EncodedChunk {
    pub fn sample(data: Vec<u8>) -> Self {
        Self {
            data,
            is_config: false,
        }
    }

    pub fn config(data: Vec<u8>) -> Self {
        Self {
            data,
            is_config: true,
        }
    }
}

/// External video encoder capability. Frames go in encode order; output
/// chunks come back in the same order, possibly delayed (an encoder may
/// buffer several frames before producing its first chunk).
pub trait VideoEncoder: Send {
    fn encode(&mut self, frame: &[u8]) -> Result<Vec<EncodedChunk>, ExportError>;

    /// Signal end-of-stream and drain any buffered output.
    fn finish(&mut self) -> Result<Vec<EncodedChunk>, ExportError>;
}

/// External container muxer capability. `start` is called once, before the
/// first sample; a muxer that is never started must not leave a finished
/// file behind.
pub trait VideoMuxer: Send {
    fn start(&mut self) -> Result<(), ExportError>;

    fn write_sample(&mut self, data: &[u8], presentation_time_us: u64)
        -> Result<(), ExportError>;

    fn finish(&mut self) -> Result<(), ExportError>;
}

/// External "save a still image" capability.
#[async_trait]
pub trait ImageSink: Send + Sync {
    async fn save_image(&self, bytes: &[u8], name: &str) -> Result<(), ExportError>;
}

/// Codec that treats raw and encoded bytes as identical.
///
/// Stands in where no real codec is wired up: the synthetic test-pattern
/// source and the unit tests. Rotation is a no-op beyond dimension swap.
pub struct PassthroughCodec;

#[async_trait]
impl FrameCodec for PassthroughCodec {
    async fn rotate(&self, frame: RawFrame, degrees: u16) -> Result<RawFrame, ProcessingError> {
        match degrees {
            0 | 180 => Ok(frame),
            90 | 270 => Ok(RawFrame {
                data: Arc::clone(&frame.data),
                width: frame.height,
                height: frame.width,
            }),
            other => Err(ProcessingError::Rotation {
                details: format!("unsupported rotation: {} degrees", other),
            }),
        }
    }

    async fn encode(&self, frame: &RawFrame) -> Result<Vec<u8>, ProcessingError> {
        // Prefix the dimensions so decode can reconstruct them
        let mut bytes = Vec::with_capacity(8 + frame.data.len());
        bytes.extend_from_slice(&frame.width.to_be_bytes());
        bytes.extend_from_slice(&frame.height.to_be_bytes());
        bytes.extend_from_slice(&frame.data);
        Ok(bytes)
    }

    async fn decode(&self, bytes: &[u8]) -> Result<RawFrame, ProcessingError> {
        if bytes.len() < 8 {
            return Err(ProcessingError::Decoding {
                details: format!("truncated frame: {} bytes", bytes.len()),
            });
        }
        let width = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let height = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        debug!("Decoded passthrough frame {}x{}", width, height);
        Ok(RawFrame::new(bytes[8..].to_vec(), width, height))
    }
}
