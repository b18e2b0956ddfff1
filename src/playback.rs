use crate::codec::{EncodedChunk, FrameCodec, ImageSink, VideoEncoder, VideoMuxer};
use crate::config::ExportConfig;
use crate::error::{ExportError, ReplayError, Result};
use crate::frame::{RawFrame, StorageHandle};
use crate::pipeline::{MutationMsg, SessionSnapshot};
use crate::store::FrameStore;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// A decoded playback frame together with its position in the snapshot,
/// for progress display.
#[derive(Debug, Clone)]
pub struct PlayerFrame {
    pub frame: RawFrame,
    pub position: usize,
}

/// Result of a finished video export.
#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub session_id: Uuid,
    pub frames: usize,
    pub samples: u64,
    pub duration_us: u64,
}

const MODE_IDLE: u8 = 0;
const MODE_PLAYING: u8 = 1;
const MODE_EXPORTING: u8 = 2;

/// Playback/export engine over a point-in-time snapshot of the replay
/// window.
///
/// The snapshot is taken, and the export lock acquired, when the session
/// opens, so window eviction can never delete a frame the session is about
/// to read. The engine moves between explicit modes, `Idle → Playing →
/// Idle` and `Idle → Exporting → Idle`; closing the session releases the
/// lock and flushes the deletions that were deferred while it ran.
pub struct MediaPlayer {
    session_id: Uuid,
    snapshot: Arc<Vec<StorageHandle>>,
    frame_rate: u32,
    export: ExportConfig,
    store: Arc<FrameStore>,
    codec: Arc<dyn FrameCodec>,
    output: Arc<watch::Sender<Option<PlayerFrame>>>,
    mutation_tx: mpsc::Sender<MutationMsg>,
    position: Arc<AtomicUsize>,
    speed_permille: Arc<AtomicU64>,
    mode: Arc<AtomicU8>,
    play_task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    closed: AtomicBool,
}

impl MediaPlayer {
    pub(crate) fn new(
        snapshot: SessionSnapshot,
        store: Arc<FrameStore>,
        codec: Arc<dyn FrameCodec>,
        output: Arc<watch::Sender<Option<PlayerFrame>>>,
        mutation_tx: mpsc::Sender<MutationMsg>,
    ) -> Self {
        let session_id = Uuid::new_v4();
        info!(
            "Playback session {} opened over {} frames",
            session_id,
            snapshot.handles.len()
        );

        let player = Self {
            session_id,
            snapshot: Arc::new(snapshot.handles),
            frame_rate: snapshot.frame_rate,
            export: snapshot.export,
            store,
            codec,
            output,
            mutation_tx,
            position: Arc::new(AtomicUsize::new(0)),
            speed_permille: Arc::new(AtomicU64::new(1000)),
            mode: Arc::new(AtomicU8::new(MODE_IDLE)),
            play_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        };

        // Show the first frame right away, like the delayed viewer would
        player.spawn_emit(0);
        player
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn len(&self) -> usize {
        self.snapshot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.is_empty()
    }

    pub fn snapshot_handles(&self) -> &[StorageHandle] {
        &self.snapshot
    }

    pub fn position(&self) -> usize {
        self.position.load(Ordering::SeqCst)
    }

    pub fn speed(&self) -> f64 {
        self.speed_permille.load(Ordering::SeqCst) as f64 / 1000.0
    }

    /// Change the playback speed. Takes effect on the next scheduled frame.
    pub fn set_speed(&self, speed: f64) {
        if speed <= 0.0 {
            warn!("Ignoring non-positive playback speed {}", speed);
            return;
        }
        self.speed_permille
            .store((speed * 1000.0) as u64, Ordering::SeqCst);
    }

    /// Start sequential playback. Frames load at `1000 / (frame_rate *
    /// speed)` millisecond intervals, wrapping at the end of the snapshot.
    /// No-op while already playing or exporting.
    pub async fn play(&self) {
        if self
            .mode
            .compare_exchange(MODE_IDLE, MODE_PLAYING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("play ignored: session not idle");
            return;
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_playback(
            Arc::clone(&self.snapshot),
            self.frame_rate,
            Arc::clone(&self.speed_permille),
            Arc::clone(&self.position),
            Arc::clone(&self.store),
            Arc::clone(&self.codec),
            Arc::clone(&self.output),
            token.clone(),
        ));
        *self.play_task.lock().await = Some((token, handle));
    }

    /// Stop playback. Deterministic: no further frame loads happen once
    /// this returns.
    pub async fn pause(&self) {
        if let Some((token, handle)) = self.play_task.lock().await.take() {
            token.cancel();
            let _ = handle.await;
        }
        let _ = self.mode.compare_exchange(
            MODE_PLAYING,
            MODE_IDLE,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Pause and move exactly one frame forward, wrapping at the end.
    pub async fn step_forward(&self) {
        self.pause().await;
        let next = (self.position.load(Ordering::SeqCst) + 1) % self.snapshot.len();
        self.position.store(next, Ordering::SeqCst);
        self.emit_current().await;
    }

    /// Pause and move exactly one frame back, wrapping at the start.
    pub async fn step_backward(&self) {
        self.pause().await;
        let current = self.position.load(Ordering::SeqCst);
        let previous = if current > 0 {
            current - 1
        } else {
            self.snapshot.len() - 1
        };
        self.position.store(previous, Ordering::SeqCst);
        self.emit_current().await;
    }

    /// Pause and jump to `index`, clamped to the snapshot.
    pub async fn seek(&self, index: usize) {
        self.pause().await;
        let clamped = index.min(self.snapshot.len() - 1);
        self.position.store(clamped, Ordering::SeqCst);
        self.emit_current().await;
    }

    /// Export the whole snapshot as a video clip through the external
    /// encoder and muxer.
    ///
    /// Frames are fed in sequence order; every non-configuration chunk the
    /// encoder produces becomes one sample with presentation timestamp
    /// `sample_index * 1_000_000 / frame_rate` microseconds. The muxer is
    /// started lazily on the first real chunk and finalized only after the
    /// end-of-stream drain, so an export that errors leaves no finished
    /// container behind.
    pub async fn export_video(
        &self,
        encoder: &mut dyn VideoEncoder,
        muxer: &mut dyn VideoMuxer,
    ) -> Result<ExportSummary> {
        self.pause().await;
        if self.snapshot.is_empty() {
            return Err(ExportError::EmptySnapshot.into());
        }
        if self
            .mode
            .compare_exchange(MODE_IDLE, MODE_EXPORTING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ExportError::AlreadyExporting.into());
        }

        let result = self.run_export(encoder, muxer).await;
        self.mode.store(MODE_IDLE, Ordering::SeqCst);
        result
    }

    async fn run_export(
        &self,
        encoder: &mut dyn VideoEncoder,
        muxer: &mut dyn VideoMuxer,
    ) -> Result<ExportSummary> {
        let started_at = Utc::now();
        info!(
            "Export {} started: {} frames at {} fps",
            self.session_id,
            self.snapshot.len(),
            self.frame_rate
        );

        let mut sample_index: u64 = 0;
        let mut muxer_started = false;

        for handle in self.snapshot.iter() {
            let bytes = self.store.load(handle).await?;
            let chunks = encoder.encode(&bytes)?;
            write_chunks(
                muxer,
                chunks,
                &mut sample_index,
                &mut muxer_started,
                self.frame_rate,
            )?;
        }

        // End-of-stream: drain whatever the encoder still buffers, then
        // finalize. No sample corresponds to the EOS signal itself.
        let tail = encoder.finish()?;
        write_chunks(
            muxer,
            tail,
            &mut sample_index,
            &mut muxer_started,
            self.frame_rate,
        )?;
        if muxer_started {
            muxer.finish()?;
        }

        let summary = ExportSummary {
            session_id: self.session_id,
            frames: self.snapshot.len(),
            samples: sample_index,
            duration_us: self.snapshot.len() as u64 * 1_000_000 / self.frame_rate as u64,
        };
        info!(
            "Export {} finished: {} samples, {} us",
            self.session_id, summary.samples, summary.duration_us
        );

        if self.export.save_metadata {
            if let Err(e) = self.write_metadata(&summary, &started_at).await {
                warn!("Export metadata sidecar not written: {}", e);
            }
        }

        Ok(summary)
    }

    async fn write_metadata(
        &self,
        summary: &ExportSummary,
        started_at: &chrono::DateTime<Utc>,
    ) -> Result<()> {
        let dir = PathBuf::from(&self.export.path);
        tokio::fs::create_dir_all(&dir).await?;

        let metadata = serde_json::json!({
            "session_id": summary.session_id.to_string(),
            "frames": summary.frames,
            "samples": summary.samples,
            "frame_rate": self.frame_rate,
            "duration_us": summary.duration_us,
            "created_at": started_at.to_rfc3339(),
        });
        let contents = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| ReplayError::system(format!("Failed to serialize export metadata: {}", e)))?;

        let name = format!("replay_{}.json", started_at.format("%Y%m%d_%H%M%S"));
        tokio::fs::write(dir.join(&name), contents).await?;
        debug!("Export metadata written: {}", name);
        Ok(())
    }

    /// Save the frame at the current playback position as a still image.
    /// The sink receives the stored encoded bytes.
    pub async fn export_image(&self, sink: &dyn ImageSink) -> Result<()> {
        if self.snapshot.is_empty() {
            return Err(ExportError::EmptySnapshot.into());
        }
        let position = self.position.load(Ordering::SeqCst).min(self.snapshot.len() - 1);
        let handle = &self.snapshot[position];
        let bytes = self.store.load(handle).await?;

        let name = format!("replay_img_{}.jpg", Utc::now().format("%Y%m%d_%H%M%S_%3f"));
        sink.save_image(&bytes, &name).await?;
        info!(
            "Still image exported from position {} as {}",
            position, name
        );
        Ok(())
    }

    /// End the session: stop playback, release the export lock, and let the
    /// pipeline flush the deletions deferred while the session ran.
    pub async fn close(self) {
        self.pause().await;
        self.closed.store(true, Ordering::SeqCst);

        let (done, rx) = oneshot::channel();
        if self
            .mutation_tx
            .send(MutationMsg::CloseSession { done: Some(done) })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
        info!("Playback session {} closed", self.session_id);
    }

    fn spawn_emit(&self, position: usize) {
        let snapshot = Arc::clone(&self.snapshot);
        let store = Arc::clone(&self.store);
        let codec = Arc::clone(&self.codec);
        let output = Arc::clone(&self.output);
        tokio::spawn(async move {
            emit_frame(&snapshot, position, &store, &codec, &output).await;
        });
    }

    async fn emit_current(&self) {
        let position = self.position.load(Ordering::SeqCst);
        emit_frame(
            &self.snapshot,
            position,
            &self.store,
            &self.codec,
            &self.output,
        )
        .await;
    }
}

impl Drop for MediaPlayer {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.play_task.try_lock() {
            if let Some((token, _)) = guard.take() {
                token.cancel();
            }
        }
        if !self.closed.load(Ordering::SeqCst) {
            // Best effort: release the export lock even on an unclosed drop
            let _ = self.mutation_tx.try_send(MutationMsg::CloseSession { done: None });
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_playback(
    snapshot: Arc<Vec<StorageHandle>>,
    frame_rate: u32,
    speed_permille: Arc<AtomicU64>,
    position: Arc<AtomicUsize>,
    store: Arc<FrameStore>,
    codec: Arc<dyn FrameCodec>,
    output: Arc<watch::Sender<Option<PlayerFrame>>>,
    token: CancellationToken,
) {
    loop {
        if token.is_cancelled() {
            break;
        }

        let current = position.load(Ordering::SeqCst);
        emit_frame(&snapshot, current, &store, &codec, &output).await;
        position.store((current + 1) % snapshot.len(), Ordering::SeqCst);

        let speed = speed_permille.load(Ordering::SeqCst) as f64 / 1000.0;
        let interval_ms = 1000.0 / (frame_rate as f64 * speed);
        let interval = std::time::Duration::from_secs_f64((interval_ms / 1000.0).max(0.001));
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    trace!("Playback task stopped");
}

/// Load, decode, and publish one snapshot frame. Failures are logged and
/// skipped; playback keeps going.
async fn emit_frame(
    snapshot: &[StorageHandle],
    position: usize,
    store: &FrameStore,
    codec: &Arc<dyn FrameCodec>,
    output: &watch::Sender<Option<PlayerFrame>>,
) {
    let Some(handle) = snapshot.get(position) else {
        return;
    };
    let bytes = match store.load(handle).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Playback load failed at position {}: {}", position, e);
            return;
        }
    };
    match codec.decode(&bytes).await {
        Ok(frame) => {
            output.send_replace(Some(PlayerFrame { frame, position }));
        }
        Err(e) => warn!("Playback decode failed at position {}: {}", position, e),
    }
}

fn write_chunks(
    muxer: &mut dyn VideoMuxer,
    chunks: Vec<EncodedChunk>,
    sample_index: &mut u64,
    muxer_started: &mut bool,
    frame_rate: u32,
) -> Result<()> {
    for chunk in chunks {
        if chunk.is_config {
            // Codec configuration data carries no sample payload
            trace!("Skipping {} bytes of codec config", chunk.data.len());
            continue;
        }
        if !*muxer_started {
            muxer.start()?;
            *muxer_started = true;
        }
        let pts = *sample_index * 1_000_000 / frame_rate as u64;
        muxer.write_sample(&chunk.data, pts)?;
        *sample_index += 1;
    }
    Ok(())
}
