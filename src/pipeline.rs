use crate::codec::FrameCodec;
use crate::config::{ExportConfig, ReplayConfig};
use crate::error::{ReplayError, Result};
use crate::export_lock::ExportLock;
use crate::frame::{Frame, RawFrame, StorageHandle};
use crate::playback::{MediaPlayer, PlayerFrame};
use crate::reorder::ReorderStage;
use crate::store::{clear_directory, FrameStore};
use crate::window::BoundedWindow;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Outcome of offering one raw frame to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStatus {
    /// Frame accepted into the transform stage
    Accepted,
    /// Too many frames in flight; the capture layer should slow down
    Overloaded,
    /// Intake is paused (reconfiguration in progress)
    Paused,
}

/// Point-in-time view of the pipeline's buffering state. Best-effort: the
/// numbers may trail the mutation task by a few frames.
#[derive(Debug, Clone)]
pub struct PipelineStats {
    pub delay_len: usize,
    pub delay_capacity: usize,
    pub replay_len: usize,
    pub replay_capacity: usize,
    pub reorder_expected: u64,
    pub reorder_pending: usize,
    pub session_active: bool,
}

/// Snapshot handed to a playback/export session at open.
pub(crate) struct SessionSnapshot {
    pub handles: Vec<StorageHandle>,
    pub frame_rate: u32,
    pub export: ExportConfig,
}

pub(crate) enum MutationMsg {
    Arrived {
        generation: u64,
        frame: Frame,
    },
    Reconfigure {
        config: Box<ReplayConfig>,
        generation: u64,
        done: oneshot::Sender<Result<()>>,
    },
    Reset {
        generation: u64,
        done: oneshot::Sender<Result<()>>,
    },
    OpenSession {
        reply: oneshot::Sender<Result<SessionSnapshot>>,
    },
    CloseSession {
        done: Option<oneshot::Sender<()>>,
    },
    Stats {
        reply: oneshot::Sender<PipelineStats>,
    },
}

/// Work-cancellation handle for the in-flight transform stage. Replaced
/// wholesale on every reconfiguration so stale work is discarded, not
/// awaited.
struct WorkGeneration {
    generation: u64,
    token: CancellationToken,
}

/// State observable from the ingestion side and the outputs. Watch senders
/// live here so receivers can be subscribed at any time.
struct Shared {
    sequence: AtomicU64,
    accepting: AtomicBool,
    realtime_attached: AtomicBool,
    delay_attached: AtomicBool,
    /// Encoded size of the first frame after each reconfiguration; 0 = unknown
    frame_memory_size: AtomicU64,
    realtime: watch::Sender<Option<RawFrame>>,
    delayed: watch::Sender<Option<RawFrame>>,
    fill: watch::Sender<(usize, usize)>,
    overload: watch::Sender<bool>,
}

/// The frame buffering and replay pipeline.
///
/// Data flows camera → transform → store → reorder → delay window →
/// (live emission | replay window). Transform and persistence run on a
/// bounded worker pool; everything from the reorder stage on is owned by a
/// single mutation task, which keeps window FIFO order deterministic
/// without fine-grained locking.
pub struct ReplayPipeline {
    shared: Arc<Shared>,
    mutation_tx: mpsc::Sender<MutationMsg>,
    work: watch::Sender<WorkGeneration>,
    semaphore: Arc<Semaphore>,
    store: Arc<FrameStore>,
    codec: Arc<dyn FrameCodec>,
    player_tx: Arc<watch::Sender<Option<PlayerFrame>>>,
}

impl ReplayPipeline {
    /// Build a pipeline for the given configuration. The working
    /// directories are cleared: buffers are always rebuilt fresh for a
    /// session, never resumed.
    pub async fn new(config: ReplayConfig, codec: Arc<dyn FrameCodec>) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(FrameStore::open(config.frame_dir()).await?);
        store.clear().await?;
        let export_staging = config.export_staging_dir();
        clear_directory(&export_staging).await?;

        let shared = Arc::new(Shared {
            sequence: AtomicU64::new(0),
            accepting: AtomicBool::new(true),
            realtime_attached: AtomicBool::new(false),
            delay_attached: AtomicBool::new(false),
            frame_memory_size: AtomicU64::new(0),
            realtime: watch::channel(None).0,
            delayed: watch::channel(None).0,
            fill: watch::channel((0, config.delay_capacity())).0,
            overload: watch::channel(false).0,
        });
        let player_tx = Arc::new(watch::channel(None).0);

        let semaphore = Arc::new(Semaphore::new(config.system.max_frames_in_flight));
        let (mutation_tx, mutation_rx) = mpsc::channel(config.system.mutation_queue_capacity);
        let (work, _) = watch::channel(WorkGeneration {
            generation: 0,
            token: CancellationToken::new(),
        });

        // Delayed-viewer emission runs apart from window mutation so a slow
        // viewer can never stall capture; a full channel drops the frame.
        let (emit_tx, emit_rx) = mpsc::channel(2);
        tokio::spawn(run_delayed_emitter(
            emit_rx,
            Arc::clone(&store),
            Arc::clone(&codec),
            Arc::clone(&shared),
        ));

        let state = MutationState {
            reorder: ReorderStage::new(),
            delay: BoundedWindow::new(config.delay_capacity()),
            replay: BoundedWindow::new(config.replay_capacity()),
            lock: ExportLock::new(),
            generation: 0,
            session_active: false,
            export_staging,
            config,
            store: Arc::clone(&store),
            shared: Arc::clone(&shared),
            emit_tx,
        };
        tokio::spawn(run_mutation_task(state, mutation_rx));

        info!("Replay pipeline started");

        Ok(Self {
            shared,
            mutation_tx,
            work,
            semaphore,
            store,
            codec,
            player_tx,
        })
    }

    /// Offer one raw camera frame with its orientation.
    ///
    /// Transform and persistence are spawned onto the bounded worker pool;
    /// the call itself never blocks. `Overloaded` means the pool is
    /// exhausted and the frame was dropped; the capture layer should pause
    /// rather than keep pushing.
    pub fn ingest(&self, frame: RawFrame, orientation_degrees: u16) -> IngestStatus {
        if !self.shared.accepting.load(Ordering::SeqCst) {
            return IngestStatus::Paused;
        }

        let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => {
                self.shared.overload.send_if_modified(|flagged| {
                    let was = *flagged;
                    *flagged = false;
                    was
                });
                permit
            }
            Err(_) => {
                let newly = self.shared.overload.send_if_modified(|flagged| {
                    let was = *flagged;
                    *flagged = true;
                    !was
                });
                if newly {
                    warn!("Transform pool exhausted, signalling backpressure");
                }
                return IngestStatus::Overloaded;
            }
        };

        let sequence = self.shared.sequence.fetch_add(1, Ordering::SeqCst);
        let (generation, token) = {
            let work = self.work.borrow();
            (work.generation, work.token.child_token())
        };

        let shared = Arc::clone(&self.shared);
        let codec = Arc::clone(&self.codec);
        let store = Arc::clone(&self.store);
        let mutation_tx = self.mutation_tx.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let work = async {
                let rotated = codec.rotate(frame, orientation_degrees).await?;

                // Realtime viewing never waits on the windows
                if shared.realtime_attached.load(Ordering::SeqCst) {
                    shared.realtime.send_replace(Some(rotated.clone()));
                }

                let bytes = codec.encode(&rotated).await?;
                let _ = shared.frame_memory_size.compare_exchange(
                    0,
                    bytes.len() as u64,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                let handle = store.persist(sequence, &bytes).await?;
                Ok::<Frame, ReplayError>(Frame::new(handle))
            };

            tokio::select! {
                _ = token.cancelled() => {
                    trace!("Discarding in-flight frame {} after reconfiguration", sequence);
                }
                result = work => match result {
                    Ok(frame) => {
                        let _ = mutation_tx
                            .send(MutationMsg::Arrived { generation, frame })
                            .await;
                    }
                    Err(e) => {
                        // Transient per-frame failure: drop and continue; the
                        // reorder stage skips past the hole.
                        warn!("Dropping frame {}: {}", sequence, e);
                    }
                },
            }
        });

        IngestStatus::Accepted
    }

    pub fn attach_realtime_viewer(&self) {
        self.shared.realtime_attached.store(true, Ordering::SeqCst);
    }

    pub fn detach_realtime_viewer(&self) {
        self.shared.realtime_attached.store(false, Ordering::SeqCst);
    }

    pub fn attach_delayed_viewer(&self) {
        self.shared.delay_attached.store(true, Ordering::SeqCst);
    }

    pub fn detach_delayed_viewer(&self) {
        self.shared.delay_attached.store(false, Ordering::SeqCst);
    }

    /// Post-transform frames for the realtime viewer
    pub fn realtime_frames(&self) -> watch::Receiver<Option<RawFrame>> {
        self.shared.realtime.subscribe()
    }

    /// Frames leaving the delay window, for the delayed viewer
    pub fn delayed_frames(&self) -> watch::Receiver<Option<RawFrame>> {
        self.shared.delayed.subscribe()
    }

    /// `(current_fill, target_fill)` of the delay window while warming up
    pub fn fill_state(&self) -> watch::Receiver<(usize, usize)> {
        self.shared.fill.subscribe()
    }

    /// True while the transform pool is exhausted; the capture layer should
    /// pause ingestion until it clears
    pub fn overload(&self) -> watch::Receiver<bool> {
        self.shared.overload.subscribe()
    }

    /// Current frame of the active playback session, with its position
    pub fn player_frames(&self) -> watch::Receiver<Option<PlayerFrame>> {
        self.player_tx.subscribe()
    }

    /// Encoded size of the first frame observed since the last
    /// reconfiguration, for memory/disk budgeting
    pub fn frame_memory_size(&self) -> Option<u64> {
        match self.shared.frame_memory_size.load(Ordering::SeqCst) {
            0 => None,
            size => Some(size),
        }
    }

    pub async fn stats(&self) -> Result<PipelineStats> {
        let (reply, rx) = oneshot::channel();
        self.mutation_tx
            .send(MutationMsg::Stats { reply })
            .await
            .map_err(|_| ReplayError::system("Pipeline mutation task is gone"))?;
        rx.await
            .map_err(|_| ReplayError::system("Pipeline mutation task is gone"))
    }

    /// Replace the configuration. Intake stops, in-flight per-frame work is
    /// cancelled and discarded, reorder state and both windows are rebuilt
    /// at the new capacities, and both working directories are cleared.
    pub async fn reconfigure(&self, config: ReplayConfig) -> Result<()> {
        config.validate()?;
        info!(
            "Reconfiguring pipeline: {} fps, delay {}s, replay {}s",
            config.recording.frame_rate,
            config.recording.delay_seconds,
            config.recording.replay_seconds
        );

        let generation = self.pause_and_invalidate();
        let (done, rx) = oneshot::channel();
        self.mutation_tx
            .send(MutationMsg::Reconfigure {
                config: Box::new(config),
                generation,
                done,
            })
            .await
            .map_err(|_| ReplayError::system("Pipeline mutation task is gone"))?;
        let result = rx
            .await
            .map_err(|_| ReplayError::system("Pipeline mutation task is gone"))?;

        self.shared.sequence.store(0, Ordering::SeqCst);
        self.shared.accepting.store(true, Ordering::SeqCst);
        result
    }

    /// Full clear of both windows and their storage, keeping the current
    /// configuration.
    pub async fn reset(&self) -> Result<()> {
        info!("Resetting pipeline buffers");

        let generation = self.pause_and_invalidate();
        let (done, rx) = oneshot::channel();
        self.mutation_tx
            .send(MutationMsg::Reset { generation, done })
            .await
            .map_err(|_| ReplayError::system("Pipeline mutation task is gone"))?;
        let result = rx
            .await
            .map_err(|_| ReplayError::system("Pipeline mutation task is gone"))?;

        self.shared.sequence.store(0, Ordering::SeqCst);
        self.shared.accepting.store(true, Ordering::SeqCst);
        result
    }

    /// Clear buffers and storage on the way out. Intake stays paused.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down pipeline");

        let generation = self.pause_and_invalidate();
        let (done, rx) = oneshot::channel();
        self.mutation_tx
            .send(MutationMsg::Reset { generation, done })
            .await
            .map_err(|_| ReplayError::system("Pipeline mutation task is gone"))?;
        rx.await
            .map_err(|_| ReplayError::system("Pipeline mutation task is gone"))?
    }

    /// Open a playback/export session over the current replay window.
    ///
    /// Takes a sequence-ordered snapshot of the window and holds the export
    /// lock until the returned player is closed; eviction cannot delete a
    /// snapshot frame while the session runs.
    pub async fn open_player(&self) -> Result<MediaPlayer> {
        let (reply, rx) = oneshot::channel();
        self.mutation_tx
            .send(MutationMsg::OpenSession { reply })
            .await
            .map_err(|_| ReplayError::system("Pipeline mutation task is gone"))?;
        let snapshot = rx
            .await
            .map_err(|_| ReplayError::system("Pipeline mutation task is gone"))??;

        Ok(MediaPlayer::new(
            snapshot,
            Arc::clone(&self.store),
            Arc::clone(&self.codec),
            Arc::clone(&self.player_tx),
            self.mutation_tx.clone(),
        ))
    }

    /// Stop intake and invalidate all in-flight per-frame work. Returns the
    /// new work generation.
    fn pause_and_invalidate(&self) -> u64 {
        self.shared.accepting.store(false, Ordering::SeqCst);
        self.work.send_modify(|work| {
            work.token.cancel();
            work.generation += 1;
            work.token = CancellationToken::new();
        });
        self.work.borrow().generation
    }
}

/// Single-owner state of the window mutation task. Reorder drain, window
/// pushes, and eviction side effects all run here, serialized, so FIFO
/// order is deterministic by construction.
struct MutationState {
    reorder: ReorderStage,
    delay: BoundedWindow,
    replay: BoundedWindow,
    lock: ExportLock,
    generation: u64,
    session_active: bool,
    export_staging: PathBuf,
    config: ReplayConfig,
    store: Arc<FrameStore>,
    shared: Arc<Shared>,
    emit_tx: mpsc::Sender<StorageHandle>,
}

async fn run_mutation_task(mut state: MutationState, mut rx: mpsc::Receiver<MutationMsg>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            MutationMsg::Arrived { generation, frame } => {
                if generation != state.generation {
                    // Late completion from before a reconfiguration: the
                    // frame's file would otherwise linger in the cleared
                    // directory.
                    trace!("Dropping stale frame {}", frame.sequence);
                    let _ = state.store.delete(&frame.handle).await;
                    continue;
                }
                state.on_frame(frame).await;
            }
            MutationMsg::Reconfigure {
                config,
                generation,
                done,
            } => {
                let result = state.apply_config(*config, generation).await;
                let _ = done.send(result);
            }
            MutationMsg::Reset { generation, done } => {
                let config = state.config.clone();
                let result = state.apply_config(config, generation).await;
                let _ = done.send(result);
            }
            MutationMsg::OpenSession { reply } => {
                let _ = reply.send(state.open_session());
            }
            MutationMsg::CloseSession { done } => {
                state.close_session().await;
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            MutationMsg::Stats { reply } => {
                let _ = reply.send(PipelineStats {
                    delay_len: state.delay.len(),
                    delay_capacity: state.delay.capacity(),
                    replay_len: state.replay.len(),
                    replay_capacity: state.replay.capacity(),
                    reorder_expected: state.reorder.expected(),
                    reorder_pending: state.reorder.pending_len(),
                    session_active: state.session_active,
                });
            }
        }
    }
    debug!("Window mutation task stopped");
}

impl MutationState {
    /// Run one in-order frame through the cascade. When the delay window is
    /// full its oldest frame moves into the replay window (and out to the
    /// delayed viewer), pushing the replay window's own oldest frame to
    /// deletion if that one is full too; while the delay window is still
    /// warming up, report fill progress instead.
    async fn on_frame(&mut self, frame: Frame) {
        self.reorder.submit(frame);
        for frame in self.reorder.drain() {
            if self.delay.is_full() {
                // The while loops also drain any excess left by a shrink
                // before the push below may proceed.
                while self.delay.is_full() {
                    let Some(evicted) = self.delay.pop_front() else {
                        break;
                    };
                    if self.shared.delay_attached.load(Ordering::SeqCst) {
                        // Full emission channel = viewer lagging: drop
                        let _ = self.emit_tx.try_send(evicted.handle.clone());
                    }
                    while self.replay.is_full() {
                        let Some(old) = self.replay.pop_front() else {
                            break;
                        };
                        if let Some(handle) = self.lock.request_delete(old.handle) {
                            if let Err(e) = self.store.delete(&handle).await {
                                warn!("Eviction delete failed: {}", e);
                            }
                        }
                    }
                    self.replay.push_back(evicted);
                }
                self.delay.push_back(frame);
            } else {
                self.delay.push_back(frame);
                self.shared
                    .fill
                    .send_replace((self.delay.len(), self.delay.capacity()));
            }
        }
    }

    /// Rebuild everything against `config`: reorder state, both windows,
    /// both working directories, and the per-frame memory estimate.
    async fn apply_config(&mut self, config: ReplayConfig, generation: u64) -> Result<()> {
        self.generation = generation;
        self.reorder.reset();
        // Window resets do not delete storage; the bulk clears below do.
        self.delay.reset();
        self.replay.reset();
        self.delay.reconfigure(config.delay_capacity());
        self.replay.reconfigure(config.replay_capacity());

        self.store.clear().await?;
        clear_directory(&self.export_staging).await?;

        self.shared.frame_memory_size.store(0, Ordering::SeqCst);
        self.shared.delayed.send_replace(None);
        self.shared
            .fill
            .send_replace((0, config.delay_capacity()));

        self.config = config;
        debug!(
            "Pipeline state rebuilt: delay capacity {}, replay capacity {}",
            self.delay.capacity(),
            self.replay.capacity()
        );
        Ok(())
    }

    fn open_session(&mut self) -> Result<SessionSnapshot> {
        if self.session_active {
            return Err(ReplayError::component(
                "playback",
                "a playback/export session is already active",
            ));
        }
        if self.replay.is_empty() {
            return Err(ReplayError::component(
                "playback",
                "replay window is empty, nothing to play",
            ));
        }

        self.lock.begin_session();
        self.session_active = true;
        Ok(SessionSnapshot {
            handles: self.replay.ordered_handles(),
            frame_rate: self.config.recording.frame_rate,
            export: self.config.export.clone(),
        })
    }

    async fn close_session(&mut self) {
        if !self.session_active {
            return;
        }
        self.session_active = false;
        let deferred = self.lock.end_session();
        for handle in deferred {
            if let Err(e) = self.store.delete(&handle).await {
                warn!("Deferred delete failed: {}", e);
            }
        }
    }
}

/// Loads and decodes frames leaving the delay window and publishes them for
/// the delayed viewer. Runs apart from window mutation.
async fn run_delayed_emitter(
    mut rx: mpsc::Receiver<StorageHandle>,
    store: Arc<FrameStore>,
    codec: Arc<dyn FrameCodec>,
    shared: Arc<Shared>,
) {
    while let Some(handle) = rx.recv().await {
        let bytes = match store.load(&handle).await {
            Ok(bytes) => bytes,
            Err(e) => {
                // The frame may have been cleared by a reconfiguration in
                // the meantime; emission is best-effort.
                debug!("Delayed emission skipped frame {}: {}", handle.sequence, e);
                continue;
            }
        };
        match codec.decode(&bytes).await {
            Ok(frame) => {
                shared.delayed.send_replace(Some(frame));
            }
            Err(e) => warn!("Delayed emission decode failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PassthroughCodec;
    use crate::error::ProcessingError;
    use async_trait::async_trait;
    use std::time::Duration;

    fn test_config(root: &std::path::Path, frame_rate: u32, delay_s: u32, replay_s: u32) -> ReplayConfig {
        let mut config = ReplayConfig::default();
        config.recording.frame_rate = frame_rate;
        config.recording.delay_seconds = delay_s;
        config.recording.replay_seconds = replay_s;
        config.storage.root = root.to_string_lossy().into_owned();
        // One transform at a time keeps arrival order deterministic, so the
        // tests below can assert exact window contents.
        config.system.max_frames_in_flight = 1;
        config
    }

    fn raw_frame() -> RawFrame {
        RawFrame::new(vec![1u8; 64], 8, 8)
    }

    async fn ingest_accepted(pipeline: &ReplayPipeline, count: usize) {
        let mut accepted = 0;
        while accepted < count {
            match pipeline.ingest(raw_frame(), 0) {
                IngestStatus::Accepted => accepted += 1,
                _ => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }
    }

    async fn wait_for<F>(pipeline: &ReplayPipeline, mut pred: F) -> PipelineStats
    where
        F: FnMut(&PipelineStats) -> bool,
    {
        for _ in 0..500 {
            let stats = pipeline.stats().await.unwrap();
            if pred(&stats) {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached: {:?}", pipeline.stats().await);
    }

    #[tokio::test]
    async fn test_warmup_reports_fill_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), 2, 2, 1); // delay capacity 4
        let pipeline = ReplayPipeline::new(config, Arc::new(PassthroughCodec))
            .await
            .unwrap();

        ingest_accepted(&pipeline, 3).await;
        let stats = wait_for(&pipeline, |s| s.delay_len == 3).await;
        assert_eq!(stats.replay_len, 0);

        assert_eq!(*pipeline.fill_state().borrow(), (3, 4));
    }

    #[tokio::test]
    async fn test_delay_eviction_cascades_into_replay() {
        let dir = tempfile::tempdir().unwrap();
        // delay capacity 60, replay capacity 30
        let config = test_config(dir.path(), 30, 2, 1);
        let pipeline = ReplayPipeline::new(config, Arc::new(PassthroughCodec))
            .await
            .unwrap();

        // One more than the delay capacity: exactly one eviction
        ingest_accepted(&pipeline, 61).await;
        let stats = wait_for(&pipeline, |s| s.replay_len == 1).await;
        assert_eq!(stats.delay_len, 60);

        // The evicted frame is sequence 0; the delay window holds 1..60
        let player = pipeline.open_player().await.unwrap();
        assert_eq!(player.len(), 1);
        let sequences: Vec<u64> = player.snapshot_handles().iter().map(|h| h.sequence).collect();
        assert_eq!(sequences, vec![0]);
        player.close().await;
    }

    #[tokio::test]
    async fn test_replay_overflow_deletes_oldest() {
        let dir = tempfile::tempdir().unwrap();
        // delay capacity 1, replay capacity 1
        let config = test_config(dir.path(), 1, 1, 1);
        let pipeline = ReplayPipeline::new(config, Arc::new(PassthroughCodec))
            .await
            .unwrap();

        ingest_accepted(&pipeline, 3).await;
        // Frame 0 cascades into replay, then frame 1 replaces it
        let stats = wait_for(&pipeline, |s| s.reorder_expected == 3).await;
        assert_eq!(stats.delay_len, 1);
        assert_eq!(stats.replay_len, 1);

        let player = pipeline.open_player().await.unwrap();
        let sequences: Vec<u64> = player.snapshot_handles().iter().map(|h| h.sequence).collect();
        assert_eq!(sequences, vec![1]);
        player.close().await;
    }

    #[tokio::test]
    async fn test_export_lock_defers_deletion_until_close() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), 1, 1, 1);
        let pipeline = ReplayPipeline::new(config, Arc::new(PassthroughCodec))
            .await
            .unwrap();

        // Warm up until frame 0 sits in the replay window
        ingest_accepted(&pipeline, 2).await;
        wait_for(&pipeline, |s| s.replay_len == 1).await;

        let player = pipeline.open_player().await.unwrap();
        let snapshot_path = player.snapshot_handles()[0].path.clone();

        // Evict frame 0 out of the replay window while the session runs
        ingest_accepted(&pipeline, 2).await;
        let stats = wait_for(&pipeline, |s| s.reorder_expected == 4).await;
        assert_eq!(stats.replay_len, 1);

        // Deletion was deferred: the snapshot frame is still on disk
        assert!(tokio::fs::metadata(&snapshot_path).await.is_ok());

        player.close().await;

        // Flushed exactly once on release
        assert!(tokio::fs::metadata(&snapshot_path).await.is_err());
    }

    #[tokio::test]
    async fn test_only_one_session_at_a_time() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), 1, 1, 1);
        let pipeline = ReplayPipeline::new(config, Arc::new(PassthroughCodec))
            .await
            .unwrap();

        ingest_accepted(&pipeline, 2).await;
        wait_for(&pipeline, |s| s.replay_len == 1).await;

        let player = pipeline.open_player().await.unwrap();
        assert!(pipeline.open_player().await.is_err());
        player.close().await;

        let player = pipeline.open_player().await.unwrap();
        player.close().await;
    }

    #[tokio::test]
    async fn test_open_player_requires_replay_frames() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), 2, 2, 1);
        let pipeline = ReplayPipeline::new(config, Arc::new(PassthroughCodec))
            .await
            .unwrap();

        assert!(pipeline.open_player().await.is_err());
    }

    #[tokio::test]
    async fn test_reconfigure_rebuilds_everything() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), 2, 2, 1);
        let pipeline = ReplayPipeline::new(config.clone(), Arc::new(PassthroughCodec))
            .await
            .unwrap();

        ingest_accepted(&pipeline, 6).await;
        wait_for(&pipeline, |s| s.reorder_expected == 6).await;
        assert!(pipeline.frame_memory_size().is_some());

        let new_config = test_config(dir.path(), 3, 2, 2);
        pipeline.reconfigure(new_config.clone()).await.unwrap();

        let stats = pipeline.stats().await.unwrap();
        assert_eq!(stats.delay_len, 0);
        assert_eq!(stats.replay_len, 0);
        assert_eq!(stats.reorder_expected, 0);
        assert_eq!(stats.reorder_pending, 0);
        assert_eq!(stats.delay_capacity, new_config.delay_capacity());
        assert_eq!(stats.replay_capacity, new_config.replay_capacity());
        assert_eq!(pipeline.frame_memory_size(), None);

        // Working directory was cleared
        let mut entries = tokio::fs::read_dir(new_config.frame_dir()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());

        // Sequence numbering restarts so frames line up with expected = 0
        ingest_accepted(&pipeline, 2).await;
        wait_for(&pipeline, |s| s.delay_len == 2).await;
    }

    #[tokio::test]
    async fn test_reset_clears_buffers_and_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), 2, 2, 1);
        let pipeline = ReplayPipeline::new(config.clone(), Arc::new(PassthroughCodec))
            .await
            .unwrap();

        ingest_accepted(&pipeline, 4).await;
        wait_for(&pipeline, |s| s.delay_len == 4).await;

        pipeline.reset().await.unwrap();

        let stats = pipeline.stats().await.unwrap();
        assert_eq!(stats.delay_len, 0);
        assert_eq!(stats.reorder_expected, 0);
        // Capacities are unchanged by a reset
        assert_eq!(stats.delay_capacity, config.delay_capacity());

        let mut entries = tokio::fs::read_dir(config.frame_dir()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_realtime_emission_bypasses_windows() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), 2, 2, 1);
        let pipeline = ReplayPipeline::new(config, Arc::new(PassthroughCodec))
            .await
            .unwrap();

        let mut frames = pipeline.realtime_frames();
        pipeline.attach_realtime_viewer();

        ingest_accepted(&pipeline, 1).await;
        tokio::time::timeout(Duration::from_secs(2), frames.wait_for(|f| f.is_some()))
            .await
            .expect("realtime frame not emitted")
            .unwrap();
    }

    #[tokio::test]
    async fn test_delayed_emission_on_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), 1, 1, 1);
        let pipeline = ReplayPipeline::new(config, Arc::new(PassthroughCodec))
            .await
            .unwrap();

        let mut frames = pipeline.delayed_frames();
        pipeline.attach_delayed_viewer();

        ingest_accepted(&pipeline, 3).await;
        tokio::time::timeout(Duration::from_secs(2), frames.wait_for(|f| f.is_some()))
            .await
            .expect("delayed frame not emitted")
            .unwrap();
    }

    #[tokio::test]
    async fn test_detached_viewers_receive_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), 1, 1, 1);
        let pipeline = ReplayPipeline::new(config, Arc::new(PassthroughCodec))
            .await
            .unwrap();

        let frames = pipeline.realtime_frames();
        ingest_accepted(&pipeline, 3).await;
        wait_for(&pipeline, |s| s.reorder_expected == 3).await;

        assert!(frames.borrow().is_none());
    }

    /// Codec whose encode stalls, for exercising backpressure.
    struct SlowCodec;

    #[async_trait]
    impl FrameCodec for SlowCodec {
        async fn rotate(
            &self,
            frame: RawFrame,
            _degrees: u16,
        ) -> std::result::Result<RawFrame, ProcessingError> {
            Ok(frame)
        }

        async fn encode(
            &self,
            frame: &RawFrame,
        ) -> std::result::Result<Vec<u8>, ProcessingError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(frame.data.to_vec())
        }

        async fn decode(&self, bytes: &[u8]) -> std::result::Result<RawFrame, ProcessingError> {
            Ok(RawFrame::new(bytes.to_vec(), 1, 1))
        }
    }

    #[tokio::test]
    async fn test_overload_signals_backpressure() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path(), 2, 2, 1);
        config.system.max_frames_in_flight = 1;
        let pipeline = ReplayPipeline::new(config, Arc::new(SlowCodec))
            .await
            .unwrap();

        assert_eq!(pipeline.ingest(raw_frame(), 0), IngestStatus::Accepted);
        assert_eq!(pipeline.ingest(raw_frame(), 0), IngestStatus::Overloaded);
        assert!(*pipeline.overload().borrow());

        // Pressure clears once the in-flight frame completes
        let mut overload = pipeline.overload();
        loop {
            match pipeline.ingest(raw_frame(), 0) {
                IngestStatus::Accepted => break,
                _ => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        tokio::time::timeout(Duration::from_secs(2), overload.wait_for(|o| !o))
            .await
            .expect("overload flag never cleared")
            .unwrap();
    }

    #[tokio::test]
    async fn test_frame_memory_size_recorded_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), 2, 2, 1);
        let pipeline = ReplayPipeline::new(config, Arc::new(PassthroughCodec))
            .await
            .unwrap();

        assert_eq!(pipeline.frame_memory_size(), None);
        ingest_accepted(&pipeline, 1).await;
        wait_for(&pipeline, |s| s.delay_len == 1).await;

        // Passthrough encoding adds an 8-byte dimension prefix
        assert_eq!(pipeline.frame_memory_size(), Some(64 + 8));
    }

    #[tokio::test]
    async fn test_paused_intake_rejects_frames() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), 2, 2, 1);
        let pipeline = ReplayPipeline::new(config, Arc::new(PassthroughCodec))
            .await
            .unwrap();

        pipeline.shutdown().await.unwrap();
        assert_eq!(pipeline.ingest(raw_frame(), 0), IngestStatus::Paused);
    }
}
