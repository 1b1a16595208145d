//! Records passed between the detector, tracker, engine, and viewers.

use std::collections::{BTreeMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use video_ingest::SourceKind;

/// Per-frame detection counts kept for the dashboard sparkline.
pub const TIMELINE_CAPACITY: usize = 100;

/// Vehicle classes the detector is allowed to report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleClass {
    Car,
    Motorcycle,
    Bus,
    Truck,
    Bicycle,
}

impl VehicleClass {
    pub const ALL: [VehicleClass; 5] = [
        VehicleClass::Car,
        VehicleClass::Motorcycle,
        VehicleClass::Bus,
        VehicleClass::Truck,
        VehicleClass::Bicycle,
    ];

    /// Map a COCO class id onto the vehicle allow-list.
    pub fn from_coco(class_id: usize) -> Option<Self> {
        match class_id {
            1 => Some(VehicleClass::Bicycle),
            2 => Some(VehicleClass::Car),
            3 => Some(VehicleClass::Motorcycle),
            5 => Some(VehicleClass::Bus),
            7 => Some(VehicleClass::Truck),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            VehicleClass::Car => "car",
            VehicleClass::Motorcycle => "motorcycle",
            VehicleClass::Bus => "bus",
            VehicleClass::Truck => "truck",
            VehicleClass::Bicycle => "bicycle",
        }
    }
}

/// One detector output for one frame. Consumed immediately, never retained.
#[derive(Clone, Debug, Serialize)]
pub struct Detection {
    pub class: VehicleClass,
    pub confidence: f32,
    pub bbox: [i32; 4],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_id: Option<i64>,
}

/// Cumulative unique counts per vehicle class.
pub type Counts = BTreeMap<VehicleClass, u64>;

pub fn new_counts() -> Counts {
    VehicleClass::ALL.iter().map(|&c| (c, 0)).collect()
}

pub fn counts_total(counts: &Counts) -> u64 {
    counts.values().sum()
}

/// Snapshot of one track enriched with kinematics, as sent to viewers.
#[derive(Clone, Debug, Serialize)]
pub struct TrackSnapshot {
    pub track_id: i64,
    pub class: VehicleClass,
    pub bbox: [i32; 4],
    pub centroid: [f32; 2],
    pub speed_kmh: f32,
    pub direction: String,
    pub frames_tracked: u64,
    /// Most recent trajectory points, oldest first.
    pub trajectory: Vec<[f32; 2]>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct TrackingStats {
    pub active_tracks: usize,
    pub avg_speed: f32,
    pub direction_distribution: BTreeMap<String, u32>,
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct PerfStats {
    pub fps: f32,
    pub infer_ms: f32,
}

/// Metadata block attached to every Nth live payload to bound bandwidth.
#[derive(Clone, Debug, Serialize)]
pub struct MetaBlock {
    pub counts: Counts,
    pub timeline: Vec<u32>,
    pub frame_count: u64,
    pub total_detected: u64,
    pub tracking_stats: TrackingStats,
    pub source_type: Option<&'static str>,
    pub perf: PerfStats,
}

/// A live frame as delivered to viewers. `meta` is flattened into the JSON
/// object when present.
#[derive(Clone, Debug, Serialize)]
pub struct LiveFrame {
    /// Base64-encoded JPEG.
    pub frame: String,
    pub seq: u64,
    pub is_running: bool,
    /// Flattened into the payload object when present; absent payloads are
    /// frame-only to bound bandwidth.
    #[serde(flatten)]
    pub meta: Option<MetaBlock>,
}

/// Terminal message published once a file source is exhausted.
#[derive(Clone, Debug, Serialize)]
pub struct StreamComplete {
    pub status: &'static str,
    pub counts: Counts,
    pub total_detected: u64,
}

/// Single most-recent payload, overwritten by the processing loop and
/// consumed (read-then-clear) by the broadcast loop.
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum BroadcastPayload {
    Live(LiveFrame),
    Complete(StreamComplete),
}

impl BroadcastPayload {
    pub fn is_complete(&self) -> bool {
        matches!(self, BroadcastPayload::Complete(_))
    }
}

/// Process-wide detection statistics. Reset on every source change, mutated
/// only by the processing loop, read by status handlers as an
/// eventually-consistent snapshot.
#[derive(Clone, Debug)]
pub struct EngineStats {
    pub counts: Counts,
    pub seen_ids: HashSet<i64>,
    pub timeline: VecDeque<u32>,
    pub frame_count: u64,
    pub source_type: Option<SourceKind>,
    pub camera_id: Option<String>,
    pub camera_name: Option<String>,
    pub actual_fps: f32,
    pub infer_ms: f32,
    pub last_error: Option<String>,
}

impl Default for EngineStats {
    fn default() -> Self {
        Self {
            counts: new_counts(),
            seen_ids: HashSet::new(),
            timeline: VecDeque::with_capacity(TIMELINE_CAPACITY),
            frame_count: 0,
            source_type: None,
            camera_id: None,
            camera_name: None,
            actual_fps: 0.0,
            infer_ms: 0.0,
            last_error: None,
        }
    }
}

impl EngineStats {
    /// Reset everything tied to a camera session; identity fields are set
    /// separately by the caller.
    pub fn reset_session(&mut self) {
        self.counts = new_counts();
        self.seen_ids.clear();
        self.timeline.clear();
        self.frame_count = 0;
        self.actual_fps = 0.0;
        self.infer_ms = 0.0;
        self.last_error = None;
    }

    /// Append one frame's detection count, evicting the oldest entry once
    /// the cap is reached.
    pub fn push_timeline(&mut self, detections_in_frame: u32) {
        if self.timeline.len() == TIMELINE_CAPACITY {
            self.timeline.pop_front();
        }
        self.timeline.push_back(detections_in_frame);
    }

    /// Count each track id exactly once per session.
    pub fn count_unique(&mut self, detections: &[Detection]) {
        for det in detections {
            if let Some(id) = det.track_id {
                if self.seen_ids.insert(id) {
                    *self.counts.entry(det.class).or_insert(0) += 1;
                }
            }
        }
    }

    /// Fallback counting when tracking is disabled: one increment per
    /// detection per frame. Overcounts vehicles that stay in view; this is
    /// the documented accuracy trade-off of running without track ids.
    pub fn count_per_detection(&mut self, detections: &[Detection]) {
        for det in detections {
            *self.counts.entry(det.class).or_insert(0) += 1;
        }
    }

    pub fn total_detected(&self) -> u64 {
        counts_total(&self.counts)
    }
}

/// Status snapshot returned by `GET /api/stats`.
#[derive(Clone, Debug, Serialize)]
pub struct StatsView {
    pub counts: Counts,
    pub timeline: Vec<u32>,
    pub frame_count: u64,
    pub is_running: bool,
    pub source_type: Option<&'static str>,
    pub total_detected: u64,
    pub perf: PerfStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}
