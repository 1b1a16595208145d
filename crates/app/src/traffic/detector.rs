//! External-detector contract and the ONNX Runtime implementation.
//!
//! The engine only knows the [`Detector`] trait: given a frame it gets back
//! vehicle detections, already filtered to the class allow-list, each
//! carrying a persistent `track_id` when tracking is requested. Identity
//! assignment lives here — the tracker downstream only enriches it.

use std::path::Path;

use anyhow::{bail, Context, Result};
use ort::session::{builder::GraphOptimizationLevel, Session};
use tracing::info;
use video_ingest::{Frame, FrameFormat};

use crate::traffic::data::{Detection, VehicleClass};

const YOLO_INPUT_SIZE: usize = 640;
const YOLO_ATTRS: usize = 84; // 4 bbox coords + 80 COCO class scores

/// Detection backend contract. Implementations must filter to the vehicle
/// allow-list and, when `tracking` is set, stamp each detection with a
/// persistent track id.
pub trait Detector: Send {
    fn detect(&mut self, frame: &Frame, confidence: f32, tracking: bool)
        -> Result<Vec<Detection>>;
}

#[derive(Clone, Debug)]
pub struct DetectorOptions {
    pub iou_threshold: f32,
    pub max_detections: usize,
    pub intra_threads: usize,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self {
            iou_threshold: 0.45,
            max_detections: 300,
            intra_threads: 4,
        }
    }
}

/// YOLOv8-family detector running through ONNX Runtime.
pub struct YoloDetector {
    session: Session,
    options: DetectorOptions,
    associator: TrackAssociator,
}

impl YoloDetector {
    pub fn new(model_path: &Path, options: DetectorOptions) -> Result<Self> {
        info!("loading detection model: {}", model_path.display());

        let builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(options.intra_threads)?;

        #[cfg(feature = "cuda")]
        let builder = builder.with_execution_providers([
            ort::execution_providers::CUDAExecutionProvider::default()
                .with_device_id(0)
                .build(),
        ])?;

        let session = builder
            .commit_from_file(model_path)
            .with_context(|| format!("failed to load model {}", model_path.display()))?;

        info!("detector initialized");
        Ok(Self {
            session,
            options,
            associator: TrackAssociator::new(),
        })
    }

    fn preprocess(&self, frame: &Frame) -> Result<Vec<f32>> {
        if frame.format != FrameFormat::Bgr8 {
            bail!("unsupported frame format");
        }
        let src_w = frame.width as usize;
        let src_h = frame.height as usize;
        if frame.data.len() < src_w * src_h * 3 {
            bail!("frame buffer shorter than {}x{}x3", src_w, src_h);
        }

        let (scale, pad_x, pad_y) = letterbox_params(src_w, src_h);
        let scaled_w = (src_w as f32 * scale) as usize;
        let scaled_h = (src_h as f32 * scale) as usize;

        let resized = resize_bilinear(&frame.data, src_w, src_h, scaled_w, scaled_h);

        // Gray letterbox canvas with the resized image centered.
        let mut canvas = vec![114u8; YOLO_INPUT_SIZE * YOLO_INPUT_SIZE * 3];
        for y in 0..scaled_h {
            for x in 0..scaled_w {
                let src_idx = (y * scaled_w + x) * 3;
                let dst_idx = ((y + pad_y as usize) * YOLO_INPUT_SIZE + x + pad_x as usize) * 3;
                canvas[dst_idx..dst_idx + 3].copy_from_slice(&resized[src_idx..src_idx + 3]);
            }
        }

        // Normalize to [0,1], HWC -> CHW, BGR -> RGB.
        let mut input = vec![0.0f32; 3 * YOLO_INPUT_SIZE * YOLO_INPUT_SIZE];
        for c in 0..3 {
            for h in 0..YOLO_INPUT_SIZE {
                for w in 0..YOLO_INPUT_SIZE {
                    let hwc_idx = (h * YOLO_INPUT_SIZE + w) * 3 + (2 - c);
                    let chw_idx = c * YOLO_INPUT_SIZE * YOLO_INPUT_SIZE + h * YOLO_INPUT_SIZE + w;
                    input[chw_idx] = canvas[hwc_idx] as f32 / 255.0;
                }
            }
        }
        Ok(input)
    }

    fn infer(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        let shape = [1usize, 3, YOLO_INPUT_SIZE, YOLO_INPUT_SIZE];
        let value =
            ort::value::Value::from_array((shape.as_slice(), input.to_vec().into_boxed_slice()))?;
        let outputs = self.session.run(ort::inputs!["images" => value])?;
        let (_, data) = outputs[0].try_extract_tensor::<f32>()?;
        Ok(data.to_vec())
    }

    fn postprocess(&self, output: &[f32], frame: &Frame, conf_threshold: f32) -> Vec<Detection> {
        let preds = output.len() / YOLO_ATTRS;
        let src_w = frame.width as f32;
        let src_h = frame.height as f32;
        let (scale, pad_x, pad_y) = letterbox_params(frame.width as usize, frame.height as usize);

        let mut candidates = Vec::new();
        for i in 0..preds {
            let mut max_conf = 0.0f32;
            let mut best_class = 0usize;
            for c in 0..(YOLO_ATTRS - 4) {
                let conf = output[preds * (4 + c) + i];
                if conf > max_conf {
                    max_conf = conf;
                    best_class = c;
                }
            }

            if max_conf < conf_threshold {
                continue;
            }
            let Some(class) = VehicleClass::from_coco(best_class) else {
                continue;
            };

            let cx = output[i];
            let cy = output[preds + i];
            let w = output[preds * 2 + i];
            let h = output[preds * 3 + i];

            // Center format to corners, then undo the letterbox transform.
            let x1 = ((cx - w / 2.0 - pad_x) / scale).clamp(0.0, src_w - 1.0);
            let y1 = ((cy - h / 2.0 - pad_y) / scale).clamp(0.0, src_h - 1.0);
            let x2 = ((cx + w / 2.0 - pad_x) / scale).clamp(0.0, src_w - 1.0);
            let y2 = ((cy + h / 2.0 - pad_y) / scale).clamp(0.0, src_h - 1.0);
            if x2 <= x1 || y2 <= y1 {
                continue;
            }

            candidates.push(RawDetection {
                bbox: [x1, y1, x2, y2],
                confidence: max_conf,
                class,
            });
        }

        let kept = nms(candidates, self.options.iou_threshold);
        kept.into_iter()
            .take(self.options.max_detections)
            .map(|raw| Detection {
                class: raw.class,
                confidence: (raw.confidence * 1000.0).round() / 1000.0,
                bbox: [
                    raw.bbox[0].round() as i32,
                    raw.bbox[1].round() as i32,
                    raw.bbox[2].round() as i32,
                    raw.bbox[3].round() as i32,
                ],
                track_id: None,
            })
            .collect()
    }
}

impl Detector for YoloDetector {
    fn detect(
        &mut self,
        frame: &Frame,
        confidence: f32,
        tracking: bool,
    ) -> Result<Vec<Detection>> {
        let input = self.preprocess(frame)?;
        let output = self.infer(&input)?;
        let mut detections = self.postprocess(&output, frame, confidence);
        if tracking {
            self.associator.assign(&mut detections);
        }
        Ok(detections)
    }
}

#[derive(Clone)]
struct RawDetection {
    bbox: [f32; 4],
    confidence: f32,
    class: VehicleClass,
}

/// Letterbox scale and padding for fitting a source image into the square
/// model input while preserving aspect ratio.
fn letterbox_params(src_w: usize, src_h: usize) -> (f32, f32, f32) {
    let target = YOLO_INPUT_SIZE as f32;
    let scale = (target / src_w as f32).min(target / src_h as f32);
    let pad_x = (target - src_w as f32 * scale) / 2.0;
    let pad_y = (target - src_h as f32 * scale) / 2.0;
    (scale, pad_x, pad_y)
}

fn resize_bilinear(src: &[u8], src_w: usize, src_h: usize, dst_w: usize, dst_h: usize) -> Vec<u8> {
    let mut dst = vec![0u8; dst_w * dst_h * 3];
    if dst_w == 0 || dst_h == 0 {
        return dst;
    }
    let x_ratio = src_w as f32 / dst_w as f32;
    let y_ratio = src_h as f32 / dst_h as f32;

    for dy in 0..dst_h {
        for dx in 0..dst_w {
            let sx = dx as f32 * x_ratio;
            let sy = dy as f32 * y_ratio;
            let sx0 = sx.floor() as usize;
            let sy0 = sy.floor() as usize;
            let sx1 = (sx0 + 1).min(src_w - 1);
            let sy1 = (sy0 + 1).min(src_h - 1);
            let fx = sx - sx0 as f32;
            let fy = sy - sy0 as f32;

            for c in 0..3 {
                let p00 = src[(sy0 * src_w + sx0) * 3 + c] as f32;
                let p10 = src[(sy0 * src_w + sx1) * 3 + c] as f32;
                let p01 = src[(sy1 * src_w + sx0) * 3 + c] as f32;
                let p11 = src[(sy1 * src_w + sx1) * 3 + c] as f32;
                let val = p00 * (1.0 - fx) * (1.0 - fy)
                    + p10 * fx * (1.0 - fy)
                    + p01 * (1.0 - fx) * fy
                    + p11 * fx * fy;
                dst[(dy * dst_w + dx) * 3 + c] = val.round() as u8;
            }
        }
    }
    dst
}

fn nms(mut candidates: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<RawDetection> = Vec::new();
    'outer: for candidate in candidates {
        for survivor in &kept {
            if iou(&candidate.bbox, &survivor.bbox) >= iou_threshold {
                continue 'outer;
            }
        }
        kept.push(candidate);
    }
    kept
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = a[2].min(b[2]);
    let y2 = a[3].min(b[3]);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        return 0.0;
    }
    inter / union
}

struct TrackedBox {
    id: i64,
    bbox: [f32; 4],
    class: VehicleClass,
    last_seen: u64,
}

/// Short-term association by greedy IoU matching against the previous
/// frames' boxes. Good enough to keep an id stable while a vehicle crosses
/// the view; anything fancier (motion models, re-id) belongs in a dedicated
/// tracking backend.
struct TrackAssociator {
    next_id: i64,
    frame: u64,
    active: Vec<TrackedBox>,
    match_iou: f32,
    max_gap: u64,
}

impl TrackAssociator {
    fn new() -> Self {
        Self {
            next_id: 1,
            frame: 0,
            active: Vec::new(),
            match_iou: 0.3,
            max_gap: 30,
        }
    }

    fn assign(&mut self, detections: &mut [Detection]) {
        self.frame += 1;
        let mut claimed = vec![false; self.active.len()];
        let mut fresh: Vec<TrackedBox> = Vec::new();

        for det in detections.iter_mut() {
            let bbox = [
                det.bbox[0] as f32,
                det.bbox[1] as f32,
                det.bbox[2] as f32,
                det.bbox[3] as f32,
            ];

            let mut best: Option<(usize, f32)> = None;
            for (idx, tracked) in self.active.iter().enumerate() {
                if claimed[idx] || tracked.class != det.class {
                    continue;
                }
                let overlap = iou(&bbox, &tracked.bbox);
                if overlap >= self.match_iou && best.map_or(true, |(_, b)| overlap > b) {
                    best = Some((idx, overlap));
                }
            }

            let id = match best {
                Some((idx, _)) => {
                    claimed[idx] = true;
                    self.active[idx].bbox = bbox;
                    self.active[idx].last_seen = self.frame;
                    self.active[idx].id
                }
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    fresh.push(TrackedBox {
                        id,
                        bbox,
                        class: det.class,
                        last_seen: self.frame,
                    });
                    id
                }
            };
            det.track_id = Some(id);
        }

        self.active.extend(fresh);
        let frame = self.frame;
        let max_gap = self.max_gap;
        self.active
            .retain(|tracked| frame.saturating_sub(tracked.last_seen) <= max_gap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(class: VehicleClass, bbox: [i32; 4]) -> Detection {
        Detection {
            class,
            confidence: 0.9,
            bbox,
            track_id: None,
        }
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = [0.0, 0.0, 10.0, 10.0];
        assert!((iou(&b, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        assert_eq!(iou(&[0.0, 0.0, 10.0, 10.0], &[20.0, 20.0, 30.0, 30.0]), 0.0);
    }

    #[test]
    fn nms_drops_overlapping_lower_confidence() {
        let candidates = vec![
            RawDetection {
                bbox: [0.0, 0.0, 10.0, 10.0],
                confidence: 0.6,
                class: VehicleClass::Car,
            },
            RawDetection {
                bbox: [1.0, 1.0, 11.0, 11.0],
                confidence: 0.9,
                class: VehicleClass::Car,
            },
            RawDetection {
                bbox: [50.0, 50.0, 60.0, 60.0],
                confidence: 0.5,
                class: VehicleClass::Bus,
            },
        ];
        let kept = nms(candidates, 0.45);
        assert_eq!(kept.len(), 2);
        assert!((kept[0].confidence - 0.9).abs() < 1e-6);
        assert_eq!(kept[1].class, VehicleClass::Bus);
    }

    #[test]
    fn letterbox_centers_wide_frames() {
        let (scale, pad_x, pad_y) = letterbox_params(1280, 720);
        assert!((scale - 0.5).abs() < 1e-6);
        assert_eq!(pad_x, 0.0);
        assert!((pad_y - 140.0).abs() < 1e-6);
    }

    #[test]
    fn associator_keeps_id_for_overlapping_box() {
        let mut associator = TrackAssociator::new();

        let mut first = vec![det(VehicleClass::Car, [100, 100, 200, 200])];
        associator.assign(&mut first);
        let id = first[0].track_id.unwrap();

        let mut second = vec![det(VehicleClass::Car, [105, 102, 205, 202])];
        associator.assign(&mut second);
        assert_eq!(second[0].track_id, Some(id));
    }

    #[test]
    fn associator_separates_classes_and_distant_boxes() {
        let mut associator = TrackAssociator::new();

        let mut first = vec![det(VehicleClass::Car, [100, 100, 200, 200])];
        associator.assign(&mut first);

        let mut second = vec![
            det(VehicleClass::Bus, [100, 100, 200, 200]),
            det(VehicleClass::Car, [500, 500, 600, 600]),
        ];
        associator.assign(&mut second);

        let ids: Vec<i64> = second.iter().map(|d| d.track_id.unwrap()).collect();
        assert!(!ids.contains(&first[0].track_id.unwrap()));
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn associator_forgets_after_max_gap() {
        let mut associator = TrackAssociator::new();

        let mut first = vec![det(VehicleClass::Car, [100, 100, 200, 200])];
        associator.assign(&mut first);
        let id = first[0].track_id.unwrap();

        // age the entry past max_gap with empty frames
        for _ in 0..31 {
            associator.assign(&mut []);
        }

        let mut reappeared = vec![det(VehicleClass::Car, [100, 100, 200, 200])];
        associator.assign(&mut reappeared);
        assert_ne!(reappeared[0].track_id, Some(id));
    }

    #[test]
    fn resize_preserves_solid_color() {
        let src = vec![200u8; 8 * 8 * 3];
        let out = resize_bilinear(&src, 8, 8, 4, 4);
        assert_eq!(out.len(), 4 * 4 * 3);
        assert!(out.iter().all(|&v| v == 200));
    }
}
