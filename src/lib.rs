pub mod config;
pub mod error;
pub mod frame;
pub mod codec;
pub mod store;
pub mod reorder;
pub mod window;
pub mod export_lock;
pub mod pipeline;
pub mod playback;
pub mod source;

pub use config::ReplayConfig;
pub use error::{ReplayError, Result};
pub use frame::{Frame, RawFrame, StorageHandle};
pub use codec::{
    EncodedChunk, FrameCodec, ImageSink, PassthroughCodec, VideoEncoder, VideoMuxer,
};
pub use store::FrameStore;
pub use reorder::ReorderStage;
pub use window::BoundedWindow;
pub use export_lock::ExportLock;
pub use pipeline::{IngestStatus, PipelineStats, ReplayPipeline};
pub use playback::{ExportSummary, MediaPlayer, PlayerFrame};
pub use source::{run_source, FrameSource, TestPatternSource};
