use crate::frame::RawFrame;
use crate::pipeline::{IngestStatus, ReplayPipeline};
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// The camera seam: a best-effort stream of `(raw_frame, orientation)`
/// pairs at the configured resolution. Arrival order is not guaranteed to
/// match capture order; the pipeline's reorder stage handles that.
#[async_trait]
pub trait FrameSource: Send {
    /// Deliver the next frame, or `None` when the stream ends.
    async fn next_frame(&mut self) -> Option<(RawFrame, u16)>;
}

/// Synthetic frame generator pacing itself at the configured frame rate.
///
/// Produces a scrolling gradient so successive frames differ. Used by the
/// binary as a smoke harness; a real deployment binds an actual camera
/// behind `FrameSource` instead.
pub struct TestPatternSource {
    width: u32,
    height: u32,
    orientation_degrees: u16,
    interval: Duration,
    counter: u64,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32, frame_rate: u32, orientation_degrees: u16) -> Self {
        Self {
            width,
            height,
            orientation_degrees,
            interval: Duration::from_secs_f64(1.0 / frame_rate.max(1) as f64),
            counter: 0,
        }
    }
}

#[async_trait]
impl FrameSource for TestPatternSource {
    async fn next_frame(&mut self) -> Option<(RawFrame, u16)> {
        tokio::time::sleep(self.interval).await;

        let size = (self.width * self.height) as usize;
        let offset = self.counter;
        let data: Vec<u8> = (0..size)
            .map(|i| ((i as u64 + offset) % 256) as u8)
            .collect();
        self.counter = self.counter.wrapping_add(1);

        Some((RawFrame::new(data, self.width, self.height), self.orientation_degrees))
    }
}

/// Pump frames from a source into the pipeline until the source ends or
/// `shutdown` fires. Honors backpressure: an overloaded pipeline pauses
/// capture instead of queuing unboundedly.
pub async fn run_source<S: FrameSource>(
    pipeline: &ReplayPipeline,
    source: &mut S,
    shutdown: CancellationToken,
) {
    let mut overload = pipeline.overload();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = source.next_frame() => {
                let Some((frame, orientation)) = next else {
                    debug!("Frame source ended");
                    break;
                };
                match pipeline.ingest(frame, orientation) {
                    IngestStatus::Accepted => {}
                    IngestStatus::Overloaded => {
                        // Frame dropped; hold capture until pressure clears
                        let _ = tokio::time::timeout(
                            Duration::from_secs(1),
                            overload.wait_for(|flagged| !flagged),
                        )
                        .await;
                    }
                    IngestStatus::Paused => {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    }
                }
            }
        }
    }
    info!("Frame source pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PassthroughCodec;
    use crate::config::ReplayConfig;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_pattern_source_produces_distinct_frames() {
        let mut source = TestPatternSource::new(4, 4, 1000, 90);

        let (first, orientation) = source.next_frame().await.unwrap();
        let (second, _) = source.next_frame().await.unwrap();

        assert_eq!(orientation, 90);
        assert_eq!(first.width, 4);
        assert_eq!(first.data.len(), 16);
        assert_ne!(first.data, second.data);
    }

    #[tokio::test]
    async fn test_run_source_feeds_the_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ReplayConfig::default();
        config.recording.frame_rate = 50;
        config.recording.delay_seconds = 1;
        config.recording.replay_seconds = 1;
        config.storage.root = dir.path().to_string_lossy().into_owned();

        let pipeline = ReplayPipeline::new(config, Arc::new(PassthroughCodec))
            .await
            .unwrap();
        let mut source = TestPatternSource::new(4, 4, 200, 0);
        let shutdown = CancellationToken::new();

        let stop = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            stop.cancel();
        });

        run_source(&pipeline, &mut source, shutdown).await;

        let stats = pipeline.stats().await.unwrap();
        assert!(stats.delay_len > 0, "no frames reached the delay window");
    }
}
