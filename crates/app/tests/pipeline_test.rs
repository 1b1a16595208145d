//! End-to-end pipeline run against synthetic collaborators: a scripted
//! detector and an in-memory source standing in for a 100-frame video file.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use trafficwatch::traffic::{
    config::Settings,
    data::{Counts, Detection, VehicleClass},
    detector::Detector,
    engine::DetectionEngine,
    store::{CameraRecord, CounterStore},
};
use video_ingest::{
    CaptureError, Frame, FrameFormat, OpenInfo, OpenRequest, RtspTransport, SourceKind,
    VideoSource,
};

/// Serves `total` distinct frames, then reports end-of-stream.
struct FileStub {
    total: u64,
    served: AtomicU64,
    running: AtomicBool,
    kind: Mutex<Option<SourceKind>>,
}

impl FileStub {
    fn new(total: u64) -> Self {
        Self {
            total,
            served: AtomicU64::new(0),
            running: AtomicBool::new(false),
            kind: Mutex::new(None),
        }
    }
}

impl VideoSource for FileStub {
    fn open(&self, request: OpenRequest) -> Result<OpenInfo, CaptureError> {
        *self.kind.lock().unwrap() = Some(request.kind());
        self.served.store(0, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        Ok(match request {
            OpenRequest::File { .. } => OpenInfo::File {
                total_frames: self.total as i64,
                fps: 25.0,
            },
            OpenRequest::Rtsp { .. } => OpenInfo::Rtsp {
                transport: RtspTransport::Tcp,
            },
            OpenRequest::Webcam { index } => OpenInfo::Webcam {
                index,
                width: 64,
                height: 48,
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
            data: vec![60u8; 64 * 48 * 3],
            width: 64,
            height: 48,
            seq: n,
            timestamp_ms: 0,
            format: FrameFormat::Bgr8,
        })
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn kind(&self) -> Option<SourceKind> {
        *self.kind.lock().unwrap()
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// One car with track id 1 on the first fifty frames, nothing after.
struct FiftyFrameCar;

impl Detector for FiftyFrameCar {
    fn detect(
        &mut self,
        frame: &Frame,
        _confidence: f32,
        tracking: bool,
    ) -> anyhow::Result<Vec<Detection>> {
        if frame.seq <= 50 {
            Ok(vec![Detection {
                class: VehicleClass::Car,
                confidence: 0.92,
                bbox: [10, 10, 40, 30],
                track_id: tracking.then_some(1),
            }])
        } else {
            Ok(Vec::new())
        }
    }
}

#[derive(Default)]
struct MemoryStore {
    saved: Mutex<BTreeMap<String, Counts>>,
}

impl CounterStore for MemoryStore {
    fn save(&self, camera_id: &str, _camera_name: &str, counts: &Counts) -> bool {
        self.saved
            .lock()
            .unwrap()
            .insert(camera_id.to_string(), counts.clone());
        true
    }

    fn load(&self, camera_id: &str) -> Option<Counts> {
        self.saved.lock().unwrap().get(camera_id).cloned()
    }

    fn all(&self) -> Vec<CameraRecord> {
        Vec::new()
    }
}

#[test]
fn hundred_frame_file_counts_one_car_and_completes() {
    let engine = DetectionEngine::new(
        FileStub::new(100),
        Box::new(FiftyFrameCar),
        Arc::new(MemoryStore::default()),
        Settings::for_tests(),
    );

    engine.set_source_file("traffic.mp4").unwrap();

    // act as the broadcast side: drain the payload slot until the terminal
    // summary arrives
    let deadline = Instant::now() + Duration::from_secs(20);
    let complete = loop {
        if let Some(payload) = engine.take_broadcast_payload() {
            if payload.is_complete() {
                break payload;
            }
        }
        assert!(Instant::now() < deadline, "pipeline never completed");
        thread::sleep(Duration::from_millis(2));
    };

    let value = serde_json::to_value(&complete).unwrap();
    assert_eq!(value["status"], "complete");
    assert_eq!(value["total_detected"], 1);
    assert_eq!(value["counts"]["car"], 1);

    // the same vehicle across fifty frames counts exactly once
    let view = engine.stats_view();
    assert_eq!(view.counts[&VehicleClass::Car], 1);
    assert_eq!(view.total_detected, 1);
    assert_eq!(view.frame_count, 100);
    assert_eq!(view.timeline.len(), 100);
    assert!(!view.is_running);

    // first fifty timeline entries saw one vehicle, the rest none
    assert!(view.timeline[..50].iter().all(|&n| n == 1));
    assert!(view.timeline[50..].iter().all(|&n| n == 0));

    // the mailbox was consumed by the terminal read
    assert!(engine.take_broadcast_payload().is_none());
}

#[test]
fn persisted_counts_survive_a_source_switch() {
    let store = Arc::new(MemoryStore::default());
    let engine = DetectionEngine::new(
        FileStub::new(100),
        Box::new(FiftyFrameCar),
        store.clone(),
        Settings::for_tests(),
    );

    // session one records a car for camera gate-1
    engine
        .set_source_rtsp("rtsp://cam/stream", Some("gate-1".into()), Some("Gate".into()))
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(20);
    while engine.stats_view().frame_count < 60 {
        assert!(Instant::now() < deadline, "pipeline stalled");
        thread::sleep(Duration::from_millis(2));
    }
    engine.stop_processing();
    assert_eq!(
        store.load("gate-1").unwrap()[&VehicleClass::Car],
        1,
        "final counts flushed on stop"
    );

    // reconnecting to the same camera resumes the persisted counts; the new
    // session keeps counting on top of them
    let (_, resumed) = engine
        .set_source_rtsp("rtsp://cam/stream", Some("gate-1".into()), Some("Gate".into()))
        .unwrap();
    assert!(resumed);
    assert!(engine.stats_view().counts[&VehicleClass::Car] >= 1);
    engine.stop_processing();
}
