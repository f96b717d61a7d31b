//! Per-frame detection pipeline and its background tasks.
//!
//!   detector → category filter → semantic filter → tracker ─┬→ FrameReport
//!                                                           └→ narration worker (only when idle)
//!
//! The narration worker owns the `SceneNarrationCache`. A job is handed over
//! only while the worker is idle; frames arriving during a narration are not
//! queued, so slow providers never build a backlog of stale scenes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::detector::{CategoryFilter, Detection, ObjectDetector};
use crate::error::PipelineError;
use crate::frame::{Frame, FrameSource};
use crate::narration::{NarrationOutcome, SceneNarrationCache, SceneSnapshot};
use crate::semantic::SemanticFilter;
use crate::tracker::{EntityTracker, TrackedEntity};

// ─── Messages ────────────────────────────────────────────────────────────────

/// Result of one `process_frame` call.
#[derive(Debug, Clone, Serialize)]
pub struct FrameReport {
    pub frame_index:      u64,
    pub captured_at:      DateTime<Utc>,
    /// Detections that survived both filters, highest score first.
    pub detections:       Vec<Detection>,
    /// Tracker snapshot after this frame, in display order.
    pub entities:         Vec<TrackedEntity>,
    pub narration_queued: bool,
}

/// Narration outcome tagged with the frame that triggered it.
#[derive(Debug, Clone, PartialEq)]
pub struct NarrationReport {
    pub frame_index: u64,
    pub outcome:     NarrationOutcome,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames:          u64,
    pub detector_errors: u64,
    pub rejected_frames: u64,
}

// ─── Pipeline ────────────────────────────────────────────────────────────────

pub struct DetectionPipeline<D: ObjectDetector> {
    detector:       D,
    categories:     CategoryFilter,
    semantic:       SemanticFilter,
    tracker:        EntityTracker,
    narration_tx:   Option<flume::Sender<SceneSnapshot>>,
    narration_task: Option<JoinHandle<()>>,
    /// Set while a job is waiting for or inside the worker.
    narration_busy: Arc<AtomicBool>,
    stop_tx:        Arc<watch::Sender<bool>>,
    stop_rx:        watch::Receiver<bool>,
}

impl<D: ObjectDetector> DetectionPipeline<D> {
    pub fn new(detector: D, categories: CategoryFilter, semantic: SemanticFilter, tracker: EntityTracker) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            detector,
            categories,
            semantic,
            tracker,
            narration_tx: None,
            narration_task: None,
            narration_busy: Arc::new(AtomicBool::new(false)),
            stop_tx: Arc::new(stop_tx),
            stop_rx,
        }
    }

    /// Spawn the narration worker and route tracker snapshots to it.
    /// Outcomes go to `outcomes` when given. Must be called inside a Tokio runtime.
    pub fn with_narration(
        mut self,
        cache: SceneNarrationCache,
        outcomes: Option<flume::Sender<NarrationReport>>,
    ) -> Self {
        let (tx, task) = spawn_narration_worker(
            cache,
            outcomes,
            Arc::clone(&self.narration_busy),
            self.stop_rx.clone(),
        );
        self.narration_tx = Some(tx);
        self.narration_task = Some(task);
        self
    }

    pub fn tracker(&self) -> &EntityTracker {
        &self.tracker
    }

    pub fn semantic_enabled(&self) -> bool {
        self.semantic.is_enabled()
    }

    /// Run one frame through every stage, in order.
    pub async fn process_frame(&mut self, frame: &Frame) -> Result<FrameReport, PipelineError> {
        let raw = self
            .detector
            .detect(frame)
            .await
            .map_err(PipelineError::Detector)?;
        let raw_count = raw.len();

        let detections = self.categories.apply(raw);
        let mut detections = self.semantic.apply(detections, frame).await;
        if !self.semantic.is_enabled() {
            detections.sort_by(|a, b| b.score.total_cmp(&a.score));
        }
        let entities = self.tracker.update(&detections, frame.captured_at)?;

        debug!(
            "Frame {}: {} raw → {} kept, {} tracked",
            frame.index,
            raw_count,
            detections.len(),
            entities.len()
        );

        let narration_queued = self.queue_narration(&entities, &detections, frame);

        Ok(FrameReport {
            frame_index: frame.index,
            captured_at: frame.captured_at,
            detections,
            entities,
            narration_queued,
        })
    }

    /// Hand the scene to the narration worker if it is idle. Never waits.
    fn queue_narration(&mut self, entities: &[TrackedEntity], detections: &[Detection], frame: &Frame) -> bool {
        let Some(tx) = &self.narration_tx else {
            return false;
        };
        if entities.is_empty() {
            return false;
        }
        if self.narration_busy.swap(true, Ordering::AcqRel) {
            debug!("Narration busy, frame {} not queued", frame.index);
            return false;
        }

        let job = SceneSnapshot {
            entities: entities.to_vec(),
            detections: detections.to_vec(),
            frame: frame.clone(),
        };
        match tx.try_send(job) {
            Ok(()) => true,
            Err(flume::TrySendError::Full(_)) => {
                self.narration_busy.store(false, Ordering::Release);
                false
            }
            Err(flume::TrySendError::Disconnected(_)) => {
                warn!("Narration worker gone, disabling narration");
                self.narration_busy.store(false, Ordering::Release);
                self.narration_tx = None;
                false
            }
        }
    }

    /// Close the narration channel and wait for the worker to drain.
    pub async fn finish(&mut self) {
        self.narration_tx = None;
        if let Some(task) = self.narration_task.take() {
            if let Err(e) = task.await {
                warn!("Narration worker ended abnormally: {}", e);
            }
        }
    }
}

impl<D: ObjectDetector + 'static> DetectionPipeline<D> {
    /// Start the frame loop in a background task. Returns a handle to stop it.
    pub fn start<S>(self, source: S, camera_id: &str, reports: Option<flume::Sender<FrameReport>>) -> PipelineHandle
    where
        S: FrameSource + 'static,
    {
        let stop_tx = Arc::clone(&self.stop_tx);
        let camera = camera_id.to_string();
        let started_at = Utc::now();
        let task = tokio::spawn(run_loop(self, source, camera.clone(), reports));
        PipelineHandle { camera_id: camera, started_at, stop_tx, task }
    }
}

async fn run_loop<D, S>(
    mut pipeline: DetectionPipeline<D>,
    mut source: S,
    camera_id: String,
    reports: Option<flume::Sender<FrameReport>>,
) -> PipelineStats
where
    D: ObjectDetector,
    S: FrameSource,
{
    let mut stats = PipelineStats::default();
    let stop_rx = pipeline.stop_rx.clone();
    info!("Pipeline running. Camera: {}", camera_id);

    loop {
        if *stop_rx.borrow() {
            info!("Pipeline stop signal received for {}", camera_id);
            // In-flight narration finishes on its own; its result is discarded.
            return stats;
        }

        let Some(frame) = source.next_frame().await else {
            break;
        };
        stats.frames += 1;

        match pipeline.process_frame(&frame).await {
            Ok(report) => {
                if let Some(tx) = &reports {
                    if tx.send_async(report).await.is_err() {
                        debug!("Frame report receiver dropped");
                    }
                }
            }
            Err(PipelineError::Detector(e)) => {
                stats.detector_errors += 1;
                warn!("Detector error on frame {}: {}", frame.index, e);
            }
            Err(PipelineError::Validation(e)) => {
                stats.rejected_frames += 1;
                warn!("Frame {} rejected: {}", frame.index, e);
            }
        }
    }

    pipeline.finish().await;
    info!(
        "Frame source exhausted for {} ({} frames, {} detector errors)",
        camera_id, stats.frames, stats.detector_errors
    );
    stats
}

// ─── Handle ──────────────────────────────────────────────────────────────────

/// A running pipeline that can be stopped via the stop signal.
pub struct PipelineHandle {
    pub camera_id:  String,
    pub started_at: DateTime<Utc>,
    stop_tx:        Arc<watch::Sender<bool>>,
    task:           JoinHandle<PipelineStats>,
}

impl PipelineHandle {
    /// Signal the pipeline to stop after the current frame.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Wait for the frame loop to end.
    pub async fn join(self) -> PipelineStats {
        match self.task.await {
            Ok(stats) => stats,
            Err(e) => {
                warn!("Pipeline task failed: {}", e);
                PipelineStats::default()
            }
        }
    }
}

// ─── Narration worker ────────────────────────────────────────────────────────

/// Spawn the task that owns `cache`. Callers set `busy` before sending a job
/// and the worker clears it once the job is done, so at most one job exists
/// at a time.
pub fn spawn_narration_worker(
    mut cache: SceneNarrationCache,
    outcomes: Option<flume::Sender<NarrationReport>>,
    busy: Arc<AtomicBool>,
    stop_rx: watch::Receiver<bool>,
) -> (flume::Sender<SceneSnapshot>, JoinHandle<()>) {
    let (tx, rx) = flume::bounded::<SceneSnapshot>(1);

    let task = tokio::spawn(async move {
        while let Ok(scene) = rx.recv_async().await {
            let frame_index = scene.frame.index;
            let outcome = cache.maybe_narrate(&scene, scene.frame.captured_at).await;
            busy.store(false, Ordering::Release);

            if *stop_rx.borrow() {
                debug!("Pipeline stopped, discarding narration for frame {}", frame_index);
                break;
            }

            match &outcome {
                NarrationOutcome::Narrated(text) | NarrationOutcome::Recalled(text) => {
                    info!("Narration (frame {}): {}", frame_index, text)
                }
                NarrationOutcome::Failed(text) => warn!("Narration (frame {}): {}", frame_index, text),
                other => debug!("Narration (frame {}): {:?}", frame_index, other),
            }

            if let Some(out) = &outcomes {
                if out.send_async(NarrationReport { frame_index, outcome }).await.is_err() {
                    debug!("Narration report receiver dropped");
                }
            }
        }
        debug!("Narration worker exited");
    });

    (tx, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{BBox, ReplayDetector};
    use crate::error::ProviderError;
    use crate::frame::PacedFrames;
    use crate::narration::{NarrationMode, Narrator};
    use crate::semantic::tests::MockEmbedder;
    use crate::semantic::SemanticMatcher;
    use crate::store::SqliteSceneStore;
    use async_trait::async_trait;
    use chrono::Duration;
    use tokio::sync::Semaphore;

    fn t(ms: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z").unwrap().with_timezone(&Utc)
            + Duration::milliseconds(ms)
    }

    fn det(class: &str, score: f32, x: f32) -> Detection {
        Detection::new(class, score, BBox::new(x, 0.0, 10.0, 10.0))
    }

    fn pipeline(frames: Vec<Vec<Detection>>) -> DetectionPipeline<ReplayDetector> {
        DetectionPipeline::new(
            ReplayDetector::new(frames),
            CategoryFilter::new(0.5, Vec::<String>::new()),
            SemanticFilter::Disabled,
            EntityTracker::default(),
        )
    }

    /// Blocks inside `narrate` until the test hands out a permit.
    struct GateNarrator {
        started: flume::Sender<()>,
        gate:    Arc<Semaphore>,
        fail:    AtomicBool,
    }

    impl GateNarrator {
        fn new(started: flume::Sender<()>, gate: Arc<Semaphore>) -> Self {
            Self { started, gate, fail: AtomicBool::new(false) }
        }
    }

    #[async_trait]
    impl Narrator for GateNarrator {
        async fn narrate(&self, objects: &[TrackedEntity], _frame: &Frame) -> Result<String, ProviderError> {
            let _ = self.started.send(());
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| ProviderError::Unavailable("narration"))?;
            if self.fail.swap(false, Ordering::SeqCst) {
                return Err(ProviderError::Unavailable("narration"));
            }
            let classes: Vec<&str> = objects.iter().map(|e| e.class.as_str()).collect();
            Ok(classes.join(","))
        }
    }

    struct FlakyDetector;

    #[async_trait]
    impl ObjectDetector for FlakyDetector {
        async fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, ProviderError> {
            if frame.index % 2 == 1 {
                return Err(ProviderError::Unavailable("detector"));
            }
            Ok(vec![Detection::new("cup", 0.9, BBox::default())])
        }
    }

    #[tokio::test]
    async fn stages_run_in_order() {
        let embedder = MockEmbedder::new(vec![1.0, 0.0])
            .region(1, vec![1.0, 0.0])
            .region(2, vec![0.0, 1.0]);
        let semantic = SemanticFilter::Enabled {
            matcher: Arc::new(SemanticMatcher::new(Arc::new(embedder))),
            prompt: "red car".into(),
            threshold: 0.5,
        };
        let mut p = DetectionPipeline::new(
            ReplayDetector::new(vec![vec![
                det("car", 0.7, 1.0),
                det("car", 0.3, 1.0),   // below score threshold
                det("truck", 0.9, 2.0), // fails the prompt
                det("bus", 0.95, 1.0),
            ]]),
            CategoryFilter::new(0.5, ["car", "truck"]),
            semantic,
            EntityTracker::default(),
        );
        assert!(p.semantic_enabled());

        let report = p.process_frame(&Frame::blank(0, t(0))).await.unwrap();
        assert_eq!(report.detections.len(), 1);
        assert_eq!(report.detections[0].class, "car");
        assert_eq!(report.entities.len(), 1);
        assert_eq!(p.tracker().classes(), vec!["car"]);
        assert!(!report.narration_queued);
    }

    #[tokio::test]
    async fn detections_come_back_highest_score_first() {
        let mut p = pipeline(vec![vec![det("a", 0.6, 0.0), det("b", 0.9, 0.0), det("c", 0.7, 0.0)]]);
        let report = p.process_frame(&Frame::blank(0, t(0))).await.unwrap();
        let order: Vec<&str> = report.detections.iter().map(|d| d.class.as_str()).collect();
        assert_eq!(order, vec!["b", "c", "a"]);
    }

    #[tokio::test]
    async fn validation_errors_surface_per_frame() {
        let mut p = pipeline(vec![vec![det("cup", 0.9, 0.0)], vec![det("cup", 0.9, 0.0)]]);
        p.process_frame(&Frame::blank(0, t(1_000))).await.unwrap();
        let err = p.process_frame(&Frame::blank(1, t(500))).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert_eq!(p.tracker().get("cup").unwrap().count, 1);
    }

    #[tokio::test]
    async fn busy_narration_drops_frames() {
        let (started_tx, started_rx) = flume::unbounded();
        let gate = Arc::new(Semaphore::new(0));
        let narrator = Arc::new(GateNarrator::new(started_tx, gate.clone()));
        let store = Arc::new(SqliteSceneStore::open_in_memory().unwrap());
        let cache = SceneNarrationCache::new(NarrationMode::Enabled(narrator), store);
        let (out_tx, out_rx) = flume::unbounded();

        let cup = || vec![det("cup", 0.9, 0.0)];
        let mut p = pipeline(vec![cup(), cup(), cup()]).with_narration(cache, Some(out_tx));

        assert!(p.process_frame(&Frame::blank(0, t(0))).await.unwrap().narration_queued);
        started_rx.recv_async().await.unwrap();
        // Worker busy with frame 0: nothing waits behind it
        assert!(!p.process_frame(&Frame::blank(1, t(100))).await.unwrap().narration_queued);
        assert!(!p.process_frame(&Frame::blank(2, t(200))).await.unwrap().narration_queued);

        gate.add_permits(1);
        p.finish().await;

        let reports: Vec<NarrationReport> = out_rx.drain().collect();
        assert_eq!(
            reports,
            vec![NarrationReport { frame_index: 0, outcome: NarrationOutcome::Narrated("cup".into()) }]
        );
    }

    #[tokio::test]
    async fn scene_after_failed_narration_is_current() {
        let (started_tx, started_rx) = flume::unbounded();
        let gate = Arc::new(Semaphore::new(0));
        let narrator = Arc::new(GateNarrator::new(started_tx, gate.clone()));
        narrator.fail.store(true, Ordering::SeqCst);
        let store = Arc::new(SqliteSceneStore::open_in_memory().unwrap());
        let cache = SceneNarrationCache::new(NarrationMode::Enabled(narrator), store.clone());
        let (out_tx, out_rx) = flume::unbounded();

        let mut p = pipeline(vec![
            vec![det("cup", 0.9, 0.0)],
            vec![det("cup", 0.9, 0.0)],
            vec![det("dog", 0.9, 0.0)],
        ])
        .with_narration(cache, Some(out_tx));

        assert!(p.process_frame(&Frame::blank(0, t(0))).await.unwrap().narration_queued);
        started_rx.recv_async().await.unwrap();
        assert!(!p.process_frame(&Frame::blank(1, t(100))).await.unwrap().narration_queued);

        gate.add_permits(1);
        let first = out_rx.recv_async().await.unwrap();
        assert_eq!(first.frame_index, 0);
        assert!(matches!(first.outcome, NarrationOutcome::Failed(_)));

        // 20 s later the cup is gone and only the dog is tracked
        let report = p.process_frame(&Frame::blank(2, t(20_000))).await.unwrap();
        let classes: Vec<&str> = report.entities.iter().map(|e| e.class.as_str()).collect();
        assert_eq!(classes, vec!["dog"]);
        assert!(report.narration_queued);

        gate.add_permits(1);
        p.finish().await;

        let rest: Vec<NarrationReport> = out_rx.drain().collect();
        assert_eq!(
            rest,
            vec![NarrationReport { frame_index: 2, outcome: NarrationOutcome::Narrated("dog".into()) }]
        );
        assert_eq!(store.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn loop_survives_detector_errors() {
        let p = DetectionPipeline::new(
            FlakyDetector,
            CategoryFilter::new(0.5, Vec::<String>::new()),
            SemanticFilter::Disabled,
            EntityTracker::default(),
        );
        let (tx, rx) = flume::unbounded();
        let handle = p.start(PacedFrames::new(t(0), 10.0, Some(4)), "cam0", Some(tx));
        let stats = handle.join().await;

        assert_eq!(stats, PipelineStats { frames: 4, detector_errors: 2, rejected_frames: 0 });
        let indices: Vec<u64> = rx.drain().map(|r| r.frame_index).collect();
        assert_eq!(indices, vec![0, 2]);
    }

    #[tokio::test]
    async fn stop_ends_an_endless_source() {
        let p = pipeline(Vec::new());
        let handle = p.start(PacedFrames::new(t(0), 100.0, None).realtime(true), "cam0", None);
        assert_eq!(handle.camera_id, "cam0");

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        handle.stop();
        let stats = handle.join().await;
        assert!(stats.frames > 0);
    }
}
