//! The detection engine: one adaptive-rate loop binding stream reads,
//! detector invocation, tracking, annotation, and encoding into a
//! single-slot broadcast payload, decoupled from delivery.
//!
//! There is exactly one engine per process, constructed at startup and
//! injected into the HTTP layer. Switching sources always stops the current
//! run first; stats, tracker state, and the payload slot are reset per
//! session.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread,
    time::{Duration, Instant},
};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tracing::{debug, error, info, warn};
use video_ingest::{CaptureError, OpenInfo, OpenRequest, SourceKind, StreamSource, VideoSource};

use crate::traffic::{
    annotate::{self, AnnotateOptions},
    config::Settings,
    data::{
        BroadcastPayload, EngineStats, LiveFrame, MetaBlock, PerfStats, StatsView, StreamComplete,
        TrackingStats,
    },
    detector::Detector,
    store::CounterStore,
    tracker::VehicleTracker,
};

const IDLE_SLEEP: Duration = Duration::from_millis(50);
const NO_FRAME_SLEEP: Duration = Duration::from_millis(10);
const STALE_FRAME_SLEEP: Duration = Duration::from_millis(5);
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// The engine as wired in production.
pub type TrafficEngine = DetectionEngine<StreamSource>;

/// Cheap clonable handle to the engine; all state lives behind the `Arc`.
pub struct DetectionEngine<S: VideoSource> {
    inner: Arc<EngineInner<S>>,
}

impl<S: VideoSource> Clone for DetectionEngine<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct EngineInner<S> {
    source: S,
    detector: Mutex<Box<dyn Detector>>,
    tracker: Mutex<VehicleTracker>,
    store: Arc<dyn CounterStore>,
    stats: Mutex<EngineStats>,
    payload: Mutex<Option<BroadcastPayload>>,
    broadcast_seq: AtomicU64,
    running: AtomicBool,
    stop_flag: AtomicBool,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    confidence: Mutex<f32>,
    settings: Settings,
}

/// Recover from a poisoned mutex; the engine is single-writer, so the
/// guarded data is always in a consistent state even after a panic.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<S: VideoSource> DetectionEngine<S> {
    pub fn new(
        source: S,
        detector: Box<dyn Detector>,
        store: Arc<dyn CounterStore>,
        settings: Settings,
    ) -> Self {
        let tracker = VehicleTracker::new(
            settings.assumed_fps,
            settings.pixels_per_meter,
            settings.track_max_age,
        );
        Self {
            inner: Arc::new(EngineInner {
                source,
                detector: Mutex::new(detector),
                tracker: Mutex::new(tracker),
                store,
                stats: Mutex::new(EngineStats::default()),
                payload: Mutex::new(None),
                broadcast_seq: AtomicU64::new(0),
                running: AtomicBool::new(false),
                stop_flag: AtomicBool::new(false),
                worker: Mutex::new(None),
                confidence: Mutex::new(settings.confidence),
                settings,
            }),
        }
    }

    pub fn set_source_file(&self, path: &str) -> Result<OpenInfo, CaptureError> {
        self.stop_processing();
        let info = self.inner.source.open(OpenRequest::File {
            path: path.to_string(),
        })?;
        self.start_session(SourceKind::File, None, None);
        self.start_processing();
        Ok(info)
    }

    /// Returns the open info plus whether counts were resumed from the
    /// counter store for a known camera id.
    pub fn set_source_rtsp(
        &self,
        url: &str,
        camera_id: Option<String>,
        camera_name: Option<String>,
    ) -> Result<(OpenInfo, bool), CaptureError> {
        self.stop_processing();
        let info = self.inner.source.open(OpenRequest::Rtsp {
            url: url.to_string(),
        })?;
        let resumed = self.start_session(SourceKind::Rtsp, camera_id, camera_name);
        self.start_processing();
        Ok((info, resumed))
    }

    pub fn set_source_webcam(&self, index: i32) -> Result<OpenInfo, CaptureError> {
        self.stop_processing();
        let info = self.inner.source.open(OpenRequest::Webcam { index })?;
        self.start_session(SourceKind::Webcam, None, None);
        self.start_processing();
        Ok(info)
    }

    /// Stop the loop, the source, and flush final counts. Idempotent.
    pub fn stop_processing(&self) {
        self.inner.stop_flag.store(true, Ordering::SeqCst);
        let handle = lock(&self.inner.worker).take();
        if let Some(handle) = handle {
            if !join_with_timeout(handle, WORKER_JOIN_TIMEOUT) {
                warn!("engine worker did not stop within {WORKER_JOIN_TIMEOUT:?}; detaching");
            }
        }
        self.inner.source.stop();
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.stop_flag.store(false, Ordering::SeqCst);
        self.persist_counts();
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Relaxed)
    }

    /// Read-and-clear the broadcast mailbox. Two consecutive reads without
    /// an intervening publish return a payload, then `None`.
    pub fn take_broadcast_payload(&self) -> Option<BroadcastPayload> {
        lock(&self.inner.payload).take()
    }

    pub fn stats_view(&self) -> StatsView {
        let stats = lock(&self.inner.stats);
        StatsView {
            counts: stats.counts.clone(),
            timeline: stats.timeline.iter().copied().collect(),
            frame_count: stats.frame_count,
            is_running: self.is_running(),
            source_type: stats.source_type.map(SourceKind::label),
            total_detected: stats.total_detected(),
            perf: PerfStats {
                fps: stats.actual_fps,
                infer_ms: stats.infer_ms,
            },
            last_error: stats.last_error.clone(),
        }
    }

    /// Live confidence adjustment from viewer config messages.
    pub fn set_confidence(&self, confidence: f32) {
        let clamped = confidence.clamp(0.0, 1.0);
        *lock(&self.inner.confidence) = clamped;
        debug!("detector confidence set to {clamped}");
    }

    fn start_session(
        &self,
        kind: SourceKind,
        camera_id: Option<String>,
        camera_name: Option<String>,
    ) -> bool {
        let mut resumed = false;
        {
            let mut stats = lock(&self.inner.stats);
            stats.reset_session();
            stats.source_type = Some(kind);
            stats.camera_id = camera_id.clone();
            stats.camera_name = camera_name;
            if let Some(id) = &camera_id {
                if let Some(saved) = self.inner.store.load(id) {
                    stats.counts = saved;
                    resumed = true;
                }
            }
        }
        lock(&self.inner.tracker).reset();
        self.inner.broadcast_seq.store(0, Ordering::SeqCst);
        *lock(&self.inner.payload) = None;
        resumed
    }

    fn start_processing(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.stop_flag.store(false, Ordering::SeqCst);
        let inner = self.inner.clone();
        let handle = thread::Builder::new()
            .name("traffic-engine".into())
            .spawn(move || process_loop(inner))
            .expect("failed to spawn engine thread");
        *lock(&self.inner.worker) = Some(handle);
        info!("detection engine started");
    }

    fn persist_counts(&self) {
        let (camera_id, camera_name, counts) = {
            let stats = lock(&self.inner.stats);
            let Some(id) = stats.camera_id.clone() else {
                return;
            };
            (
                id,
                stats.camera_name.clone().unwrap_or_default(),
                stats.counts.clone(),
            )
        };
        self.inner.store.save(&camera_id, &camera_name, &counts);
    }
}

/// The adaptive processing loop. Reads the latest frame, runs the detector
/// and tracker, annotates and encodes, publishes the payload, and paces
/// itself to the target interval without ever accumulating sleep debt.
fn process_loop<S: VideoSource>(inner: Arc<EngineInner<S>>) {
    let settings = &inner.settings;
    let target = Duration::from_secs_f64(1.0 / f64::from(settings.infer_fps));
    let tracking = settings.tracking_enabled();
    let annotate_base = AnnotateOptions {
        resize_width: settings.resize_width,
        jpeg_quality: settings.jpeg_quality,
        show_timestamp: false,
    };

    let mut last_seq = 0u64;
    let mut fps_counter = 0u32;
    let mut fps_timer = Instant::now();

    while !inner.stop_flag.load(Ordering::Relaxed) {
        let loop_start = Instant::now();

        if !inner.source.is_running() {
            thread::sleep(IDLE_SLEEP);
            continue;
        }

        let Some(frame) = inner.source.read_frame() else {
            if matches!(inner.source.kind(), Some(SourceKind::File)) {
                handle_file_end(&inner);
                break;
            }
            thread::sleep(NO_FRAME_SLEEP);
            continue;
        };

        // The grabber has not refreshed the slot since the last iteration.
        if frame.seq == last_seq {
            thread::sleep(STALE_FRAME_SLEEP);
            continue;
        }
        last_seq = frame.seq;

        let confidence = *lock(&inner.confidence);
        let infer_start = Instant::now();
        let detections = {
            let mut detector = lock(&inner.detector);
            match detector.detect(&frame, confidence, tracking) {
                Ok(detections) => detections,
                Err(err) => {
                    fail(&inner, format!("detector error: {err:#}"));
                    break;
                }
            }
        };
        let infer_ms = infer_start.elapsed().as_secs_f32() * 1000.0;
        metrics::histogram!("traffic_inference_seconds").record(infer_start.elapsed().as_secs_f64());

        let mut snapshots = Vec::new();
        let mut tracking_stats = TrackingStats::default();
        let mut persist = None;
        {
            let mut stats = lock(&inner.stats);
            stats.frame_count += 1;
            stats.infer_ms = (infer_ms * 10.0).round() / 10.0;

            if tracking {
                let mut tracker = lock(&inner.tracker);
                snapshots = tracker.update(&detections, stats.frame_count);
                tracking_stats = tracker.statistics();
                stats.count_unique(&detections);
            } else {
                stats.count_per_detection(&detections);
            }

            stats.push_timeline(detections.len() as u32);

            if let Some(camera_id) = stats.camera_id.clone() {
                if stats.frame_count % settings.persist_interval == 0 {
                    persist = Some((
                        camera_id,
                        stats.camera_name.clone().unwrap_or_default(),
                        stats.counts.clone(),
                    ));
                }
            }
        }
        if let Some((camera_id, camera_name, counts)) = persist {
            inner.store.save(&camera_id, &camera_name, &counts);
        }

        let live = matches!(inner.source.kind(), Some(kind) if kind.is_live());
        let jpeg = match annotate::render(
            &frame,
            &detections,
            &snapshots,
            AnnotateOptions {
                show_timestamp: live,
                ..annotate_base
            },
        ) {
            Ok(jpeg) => jpeg,
            Err(err) => {
                fail(&inner, format!("annotation error: {err:#}"));
                break;
            }
        };

        let seq = inner.broadcast_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let meta = if seq % settings.meta_every == 0 {
            let stats = lock(&inner.stats);
            Some(MetaBlock {
                counts: stats.counts.clone(),
                timeline: stats.timeline.iter().copied().collect(),
                frame_count: stats.frame_count,
                total_detected: stats.total_detected(),
                tracking_stats,
                source_type: stats.source_type.map(SourceKind::label),
                perf: PerfStats {
                    fps: stats.actual_fps,
                    infer_ms: stats.infer_ms,
                },
            })
        } else {
            None
        };

        *lock(&inner.payload) = Some(BroadcastPayload::Live(LiveFrame {
            frame: BASE64.encode(&jpeg),
            seq,
            is_running: true,
            meta,
        }));
        metrics::counter!("traffic_frames_processed_total").increment(1);

        fps_counter += 1;
        let window = fps_timer.elapsed().as_secs_f32();
        if window >= 1.0 {
            let fps = fps_counter as f32 / window;
            lock(&inner.stats).actual_fps = (fps * 10.0).round() / 10.0;
            metrics::gauge!("traffic_pipeline_fps").set(f64::from(fps));
            fps_counter = 0;
            fps_timer = Instant::now();
        }

        // Adaptive pacing: sleep off the remainder of the target interval,
        // but never carry debt from an overrun into the next iteration.
        let elapsed = loop_start.elapsed();
        if elapsed < target {
            thread::sleep(target - elapsed);
        } else if elapsed > target.mul_f32(1.5) {
            debug!(
                "frame over budget: {}ms (target {}ms)",
                elapsed.as_millis(),
                target.as_millis()
            );
        }
    }
}

/// File exhausted: publish the terminal summary, stop the source, and leave
/// the engine in the Stopped state.
fn handle_file_end<S: VideoSource>(inner: &Arc<EngineInner<S>>) {
    let (counts, total) = {
        let stats = lock(&inner.stats);
        (stats.counts.clone(), stats.total_detected())
    };
    *lock(&inner.payload) = Some(BroadcastPayload::Complete(StreamComplete {
        status: "complete",
        counts,
        total_detected: total,
    }));
    inner.source.stop();
    inner.running.store(false, Ordering::SeqCst);
    info!("file source complete");
}

/// Fatal loop error: a broken detector must not emit silently-empty
/// detections forever, so the engine stops and surfaces the error.
fn fail<S: VideoSource>(inner: &Arc<EngineInner<S>>, message: String) {
    error!("{message}");
    lock(&inner.stats).last_error = Some(message);
    inner.source.stop();
    inner.running.store(false, Ordering::SeqCst);
}

fn join_with_timeout(handle: thread::JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
    let _ = handle.join();
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traffic::data::{Counts, Detection, VehicleClass};
    use anyhow::anyhow;
    use std::collections::BTreeMap;
    use video_ingest::{Frame, FrameFormat};

    /// Synthetic source delivering a fixed number of frames, then behaving
    /// like an exhausted file (or a silent live stream).
    struct StubSource {
        total: u64,
        served: AtomicU64,
        running: AtomicBool,
        kind: Mutex<Option<SourceKind>>,
    }

    impl StubSource {
        fn new(total: u64) -> Self {
            Self {
                total,
                served: AtomicU64::new(0),
                running: AtomicBool::new(false),
                kind: Mutex::new(None),
            }
        }
    }

    impl VideoSource for StubSource {
        fn open(&self, request: OpenRequest) -> Result<OpenInfo, CaptureError> {
            *lock(&self.kind) = Some(request.kind());
            self.served.store(0, Ordering::SeqCst);
            self.running.store(true, Ordering::SeqCst);
            Ok(match request {
                OpenRequest::File { .. } => OpenInfo::File {
                    total_frames: self.total as i64,
                    fps: 25.0,
                },
                OpenRequest::Rtsp { .. } => OpenInfo::Rtsp {
                    transport: video_ingest::RtspTransport::Tcp,
                },
                OpenRequest::Webcam { index } => OpenInfo::Webcam {
                    index,
                    width: 32,
                    height: 24,
                    fps: 25.0,
                },
            })
        }

        fn read_frame(&self) -> Option<Frame> {
            if !self.running.load(Ordering::SeqCst) {
                return None;
            }
            let n = self.served.fetch_add(1, Ordering::SeqCst) + 1;
            if n > self.total {
                return None;
            }
            Some(Frame {
                data: vec![90u8; 32 * 24 * 3],
                width: 32,
                height: 24,
                seq: n,
                timestamp_ms: 0,
                format: FrameFormat::Bgr8,
            })
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn kind(&self) -> Option<SourceKind> {
            *lock(&self.kind)
        }

        fn stop(&self) {
            self.running.store(false, Ordering::SeqCst);
        }
    }

    /// Detector emitting one car with a fixed track id for the first
    /// `active_until` frames of the session.
    struct ScriptedDetector {
        active_until: u64,
        fail_at: Option<u64>,
    }

    impl Detector for ScriptedDetector {
        fn detect(
            &mut self,
            frame: &Frame,
            _confidence: f32,
            tracking: bool,
        ) -> anyhow::Result<Vec<Detection>> {
            if let Some(fail_at) = self.fail_at {
                if frame.seq >= fail_at {
                    return Err(anyhow!("model exploded"));
                }
            }
            if frame.seq <= self.active_until {
                Ok(vec![Detection {
                    class: VehicleClass::Car,
                    confidence: 0.9,
                    bbox: [4, 4, 16, 16],
                    track_id: tracking.then_some(1),
                }])
            } else {
                Ok(Vec::new())
            }
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        saved: Mutex<Vec<(String, Counts)>>,
        preset: Mutex<BTreeMap<String, Counts>>,
    }

    impl CounterStore for MemoryStore {
        fn save(&self, camera_id: &str, _camera_name: &str, counts: &Counts) -> bool {
            lock(&self.saved).push((camera_id.to_string(), counts.clone()));
            true
        }

        fn load(&self, camera_id: &str) -> Option<Counts> {
            lock(&self.preset).get(camera_id).cloned()
        }

        fn all(&self) -> Vec<crate::traffic::store::CameraRecord> {
            Vec::new()
        }
    }

    fn engine_with(
        frames: u64,
        detector: ScriptedDetector,
        settings: Settings,
    ) -> (DetectionEngine<StubSource>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::default());
        let engine = DetectionEngine::new(
            StubSource::new(frames),
            Box::new(detector),
            store.clone(),
            settings,
        );
        (engine, store)
    }

    fn wait_for_complete(engine: &DetectionEngine<StubSource>) -> BroadcastPayload {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(payload) = engine.take_broadcast_payload() {
                if payload.is_complete() {
                    return payload;
                }
            }
            assert!(Instant::now() < deadline, "engine never completed");
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn wait_until_stopped(engine: &DetectionEngine<StubSource>) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while engine.is_running() {
            assert!(Instant::now() < deadline, "engine never stopped");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn file_session_ends_with_complete_summary() {
        let (engine, _) = engine_with(
            20,
            ScriptedDetector {
                active_until: 10,
                fail_at: None,
            },
            Settings::for_tests(),
        );
        engine.set_source_file("clip.mp4").unwrap();

        let payload = wait_for_complete(&engine);
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["status"], "complete");
        assert_eq!(value["total_detected"], 1);
        assert_eq!(value["counts"]["car"], 1);

        wait_until_stopped(&engine);
        let view = engine.stats_view();
        assert_eq!(view.counts[&VehicleClass::Car], 1);
        assert_eq!(view.frame_count, 20);
        assert_eq!(view.timeline.len(), 20);
    }

    #[test]
    fn mailbox_is_consumed_by_reads() {
        let (engine, _) = engine_with(
            5,
            ScriptedDetector {
                active_until: 5,
                fail_at: None,
            },
            Settings::for_tests(),
        );
        engine.set_source_file("clip.mp4").unwrap();

        let payload = wait_for_complete(&engine);
        assert!(payload.is_complete());
        // nothing writes after the terminal payload: a second read is empty
        assert!(engine.take_broadcast_payload().is_none());
    }

    #[test]
    fn switching_sources_resets_the_session() {
        let (engine, _) = engine_with(
            5,
            ScriptedDetector {
                active_until: 1_000,
                fail_at: None,
            },
            Settings::for_tests(),
        );

        engine.set_source_file("a.mp4").unwrap();
        wait_for_complete(&engine);
        assert_eq!(engine.stats_view().counts[&VehicleClass::Car], 1);

        // same detector, same track id: a fresh session counts it again
        engine.set_source_file("b.mp4").unwrap();
        wait_for_complete(&engine);
        let view = engine.stats_view();
        assert_eq!(view.counts[&VehicleClass::Car], 1);
        assert_eq!(view.frame_count, 5);
    }

    #[test]
    fn rtsp_session_resumes_persisted_counts() {
        let (engine, store) = engine_with(
            0,
            ScriptedDetector {
                active_until: 0,
                fail_at: None,
            },
            Settings::for_tests(),
        );
        let mut saved = crate::traffic::data::new_counts();
        saved.insert(VehicleClass::Car, 41);
        lock(&store.preset).insert("cam-7".into(), saved);

        let (_, resumed) = engine
            .set_source_rtsp("rtsp://cam/stream", Some("cam-7".into()), Some("Gate".into()))
            .unwrap();
        assert!(resumed);
        assert_eq!(engine.stats_view().counts[&VehicleClass::Car], 41);

        // stopping flushes the final counts back to the store
        engine.stop_processing();
        assert!(lock(&store.saved)
            .iter()
            .any(|(id, counts)| id == "cam-7" && counts[&VehicleClass::Car] == 41));
    }

    #[test]
    fn fallback_counting_without_tracking_overcounts() {
        let mut settings = Settings::for_tests();
        settings.no_tracking = true;
        let (engine, _) = engine_with(
            5,
            ScriptedDetector {
                active_until: 5,
                fail_at: None,
            },
            settings,
        );
        engine.set_source_file("clip.mp4").unwrap();
        wait_for_complete(&engine);
        // one detection per frame, counted every frame
        assert_eq!(engine.stats_view().counts[&VehicleClass::Car], 5);
    }

    #[test]
    fn detector_failure_stops_the_engine() {
        let (engine, _) = engine_with(
            50,
            ScriptedDetector {
                active_until: 50,
                fail_at: Some(3),
            },
            Settings::for_tests(),
        );
        engine.set_source_file("clip.mp4").unwrap();

        wait_until_stopped(&engine);
        let view = engine.stats_view();
        assert!(view.last_error.as_deref().unwrap().contains("detector error"));
        assert!(!view.is_running);
    }

    fn next_live_payload(engine: &DetectionEngine<StubSource>) -> LiveFrame {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(BroadcastPayload::Live(live)) = engine.take_broadcast_payload() {
                return live;
            }
            assert!(Instant::now() < deadline, "no live payload seen");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn metadata_cadence_follows_meta_every() {
        let mut settings = Settings::for_tests();
        settings.meta_every = 1;
        // effectively endless live session so live payloads keep flowing
        let (engine, _) = engine_with(
            1_000_000,
            ScriptedDetector {
                active_until: u64::MAX,
                fail_at: None,
            },
            settings,
        );
        engine.set_source_webcam(0).unwrap();

        // with meta_every = 1 every live payload carries the metadata block
        let live = next_live_payload(&engine);
        assert!(live.meta.is_some());
        assert!(!live.frame.is_empty());
        engine.stop_processing();
    }

    #[test]
    fn metadata_withheld_between_ticks() {
        let mut settings = Settings::for_tests();
        settings.meta_every = 1_000_000;
        let (engine, _) = engine_with(
            1_000_000,
            ScriptedDetector {
                active_until: u64::MAX,
                fail_at: None,
            },
            settings,
        );
        engine.set_source_webcam(0).unwrap();

        let live = next_live_payload(&engine);
        assert!(live.meta.is_none());
        engine.stop_processing();
    }

    #[test]
    fn stop_processing_is_idempotent() {
        let (engine, _) = engine_with(
            5,
            ScriptedDetector {
                active_until: 5,
                fail_at: None,
            },
            Settings::for_tests(),
        );
        engine.set_source_file("clip.mp4").unwrap();
        engine.stop_processing();
        engine.stop_processing();
        assert!(!engine.is_running());
    }
}
