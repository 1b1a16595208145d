//! Multi-object tracking: temporal enrichment of detector-assigned identities.
//!
//! Track identity is delegated to the detector, which carries a persistent
//! id across frames via its own short-term association. This module's job is
//! kinematics (direction, calibrated speed) and lifecycle management of
//! stale tracks — it never re-identifies objects.

use std::collections::{hash_map::Entry, BTreeMap, HashMap, VecDeque};

use tracing::debug;

use crate::traffic::data::{Detection, TrackSnapshot, TrackingStats, VehicleClass};

/// Bounded trajectory history per track.
pub const TRAJECTORY_CAPACITY: usize = 30;
/// Direction and speed need at least this many samples to be meaningful.
const MIN_KINEMATIC_SAMPLES: usize = 5;
/// Speed is measured over at most this many recent samples.
const SPEED_WINDOW: usize = 10;
const MAX_SPEED_KMH: f32 = 200.0;

const COMPASS: [&str; 8] = [
    "East",
    "Northeast",
    "North",
    "Northwest",
    "West",
    "Southwest",
    "South",
    "Southeast",
];

/// One tracked vehicle. Owned exclusively by the tracker; the outside world
/// only ever sees [`TrackSnapshot`]s.
pub struct Track {
    pub track_id: i64,
    pub class: VehicleClass,
    pub bbox: [i32; 4],
    pub centroid: (f32, f32),
    trajectory: VecDeque<((f32, f32), u64)>,
    pub frames_tracked: u64,
    pub speed_kmh: f32,
    pub direction: String,
    pub last_update_frame: u64,
}

impl Track {
    fn new(track_id: i64, class: VehicleClass, bbox: [i32; 4], frame_number: u64) -> Self {
        let centroid = centroid_of(bbox);
        let mut trajectory = VecDeque::with_capacity(TRAJECTORY_CAPACITY);
        trajectory.push_back((centroid, frame_number));
        Self {
            track_id,
            class,
            bbox,
            centroid,
            trajectory,
            frames_tracked: 1,
            speed_kmh: 0.0,
            direction: "Unknown".to_string(),
            last_update_frame: frame_number,
        }
    }

    fn update(&mut self, bbox: [i32; 4], frame_number: u64) {
        self.bbox = bbox;
        self.centroid = centroid_of(bbox);
        if self.trajectory.len() == TRAJECTORY_CAPACITY {
            self.trajectory.pop_front();
        }
        self.trajectory.push_back((self.centroid, frame_number));
        self.frames_tracked += 1;
        self.last_update_frame = frame_number;
    }

    /// Coarse flow plus 8-sector compass label from the oldest-to-newest
    /// trajectory displacement. In image space y grows downward, so an
    /// increasing vertical coordinate reads as movement toward the camera.
    fn calculate_direction(&self) -> String {
        if self.trajectory.len() < MIN_KINEMATIC_SAMPLES {
            return "Unknown".to_string();
        }

        let (start, _) = self.trajectory[0];
        let (end, _) = self.trajectory[self.trajectory.len() - 1];
        let dx = end.0 - start.0;
        let dy = end.1 - start.1;

        let flow = if dy > 0.0 { "Inbound" } else { "Outbound" };

        let mut angle = (-dy).atan2(dx).to_degrees();
        if angle < 0.0 {
            angle += 360.0;
        }
        let sector = ((angle + 22.5) / 45.0) as usize % 8;

        format!("{flow} ({})", COMPASS[sector])
    }

    /// Speed in km/h over the most recent trajectory window, converted with
    /// fixed calibration constants and clamped to a plausible range.
    fn calculate_speed(&self, fps: f32, pixels_per_meter: f32) -> f32 {
        if self.trajectory.len() < MIN_KINEMATIC_SAMPLES || fps <= 0.0 || pixels_per_meter <= 0.0 {
            return 0.0;
        }

        let window = SPEED_WINDOW.min(self.trajectory.len());
        let (start, start_frame) = self.trajectory[self.trajectory.len() - window];
        let (end, end_frame) = self.trajectory[self.trajectory.len() - 1];

        let frames_elapsed = end_frame.saturating_sub(start_frame);
        if frames_elapsed == 0 {
            return 0.0;
        }

        let dx = end.0 - start.0;
        let dy = end.1 - start.1;
        let distance_meters = (dx * dx + dy * dy).sqrt() / pixels_per_meter;
        let time_seconds = frames_elapsed as f32 / fps;

        let speed_kmh = (distance_meters / time_seconds * 3.6).clamp(0.0, MAX_SPEED_KMH);
        (speed_kmh * 10.0).round() / 10.0
    }

    fn snapshot(&self) -> TrackSnapshot {
        let tail = self.trajectory.len().saturating_sub(10);
        TrackSnapshot {
            track_id: self.track_id,
            class: self.class,
            bbox: self.bbox,
            centroid: [self.centroid.0, self.centroid.1],
            speed_kmh: self.speed_kmh,
            direction: self.direction.clone(),
            frames_tracked: self.frames_tracked,
            trajectory: self
                .trajectory
                .iter()
                .skip(tail)
                .map(|((x, y), _)| [*x, *y])
                .collect(),
        }
    }
}

fn centroid_of(bbox: [i32; 4]) -> (f32, f32) {
    (
        (bbox[0] + bbox[2]) as f32 / 2.0,
        (bbox[1] + bbox[3]) as f32 / 2.0,
    )
}

/// Manages all vehicle tracks for one camera session.
pub struct VehicleTracker {
    tracks: HashMap<i64, Track>,
    fps: f32,
    pixels_per_meter: f32,
    max_age: u64,
}

impl VehicleTracker {
    pub fn new(fps: f32, pixels_per_meter: f32, max_age: u64) -> Self {
        Self {
            tracks: HashMap::new(),
            fps,
            pixels_per_meter,
            max_age,
        }
    }

    /// Fold one frame's detections into the track table.
    ///
    /// Detections without a track id are skipped. Tracks unseen for more
    /// than `max_age` frames are evicted, once per call, regardless of what
    /// arrived. Only tracks updated by this call appear in the returned
    /// snapshots, with direction and speed freshly computed.
    pub fn update(&mut self, detections: &[Detection], frame_number: u64) -> Vec<TrackSnapshot> {
        let mut current_ids = Vec::new();

        for det in detections {
            let Some(track_id) = det.track_id else {
                continue;
            };
            current_ids.push(track_id);
            match self.tracks.entry(track_id) {
                Entry::Occupied(mut entry) => entry.get_mut().update(det.bbox, frame_number),
                Entry::Vacant(entry) => {
                    entry.insert(Track::new(track_id, det.class, det.bbox, frame_number));
                }
            }
        }

        let max_age = self.max_age;
        self.tracks.retain(|track_id, track| {
            let stale = frame_number.saturating_sub(track.last_update_frame) > max_age;
            if stale {
                debug!("removed stale track {track_id}");
            }
            !stale
        });

        let mut snapshots = Vec::with_capacity(current_ids.len());
        for track_id in current_ids {
            if let Some(track) = self.tracks.get_mut(&track_id) {
                track.direction = track.calculate_direction();
                track.speed_kmh = track.calculate_speed(self.fps, self.pixels_per_meter);
                snapshots.push(track.snapshot());
            }
        }
        snapshots
    }

    pub fn statistics(&self) -> TrackingStats {
        if self.tracks.is_empty() {
            return TrackingStats::default();
        }

        let speeds: Vec<f32> = self
            .tracks
            .values()
            .map(|t| t.speed_kmh)
            .filter(|&s| s > 0.0)
            .collect();
        let avg_speed = if speeds.is_empty() {
            0.0
        } else {
            let mean = speeds.iter().sum::<f32>() / speeds.len() as f32;
            (mean * 10.0).round() / 10.0
        };

        let mut direction_distribution: BTreeMap<String, u32> = BTreeMap::new();
        for track in self.tracks.values() {
            if track.direction != "Unknown" {
                *direction_distribution
                    .entry(track.direction.clone())
                    .or_insert(0) += 1;
            }
        }

        TrackingStats {
            active_tracks: self.tracks.len(),
            avg_speed,
            direction_distribution,
        }
    }

    pub fn set_calibration(&mut self, fps: Option<f32>, pixels_per_meter: Option<f32>) {
        if let Some(fps) = fps {
            self.fps = fps;
        }
        if let Some(ppm) = pixels_per_meter {
            self.pixels_per_meter = ppm;
        }
    }

    pub fn reset(&mut self) {
        self.tracks.clear();
    }

    pub fn active_tracks(&self) -> usize {
        self.tracks.len()
    }
}
