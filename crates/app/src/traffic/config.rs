//! Runtime settings shared by every pipeline stage.
//!
//! Everything is a CLI flag with a sane default; the handful of deployment
//! knobs also read from the environment so containers can configure the
//! service without wrapping the command line.

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;

#[derive(Parser, Clone, Debug)]
#[command(name = "trafficwatch", about = "Vehicle detection and broadcast backend")]
pub struct Settings {
    /// HTTP bind address.
    #[arg(long, default_value = "0.0.0.0", env = "TRAFFICWATCH_HOST")]
    pub host: String,

    /// HTTP bind port.
    #[arg(long, default_value_t = 8000, env = "TRAFFICWATCH_PORT")]
    pub port: u16,

    /// Path to the ONNX detection model.
    #[arg(long, default_value = "yolov8n.onnx", env = "TRAFFICWATCH_MODEL")]
    pub model: PathBuf,

    /// Target inference rate; the processing loop paces itself to this and
    /// degrades gracefully under load instead of queueing.
    #[arg(long, default_value_t = 12)]
    pub infer_fps: u32,

    /// Rate at which the broadcast loop drains the payload slot.
    #[arg(long, default_value_t = 15)]
    pub broadcast_fps: u32,

    /// Full metadata (counts, timeline, perf) rides along every Nth payload.
    #[arg(long, default_value_t = 5)]
    pub meta_every: u64,

    /// JPEG encode quality, 1-100.
    #[arg(long, default_value_t = 75)]
    pub jpeg_quality: u8,

    /// Annotated frames wider than this are downscaled before encoding.
    #[arg(long, default_value_t = 960)]
    pub resize_width: u32,

    /// Frames between counter-store writes for the active camera.
    #[arg(long, default_value_t = 60)]
    pub persist_interval: u64,

    /// Default detector confidence threshold.
    #[arg(long, default_value_t = 0.30)]
    pub confidence: f32,

    /// NMS overlap threshold.
    #[arg(long, default_value_t = 0.45)]
    pub iou: f32,

    /// Maximum detections kept per frame.
    #[arg(long, default_value_t = 300)]
    pub max_detections: usize,

    /// Assumed stream frame rate used for speed estimation. A calibration
    /// constant, not measured from the stream.
    #[arg(long, default_value_t = 25.0)]
    pub assumed_fps: f32,

    /// Pixels per meter at road level, for speed estimation.
    #[arg(long, default_value_t = 50.0)]
    pub pixels_per_meter: f32,

    /// Frames a track may go unseen before it is evicted.
    #[arg(long, default_value_t = 30)]
    pub track_max_age: u64,

    /// Counter-store file path.
    #[arg(long, default_value = "counters.json", env = "TRAFFICWATCH_STORE")]
    pub store_path: PathBuf,

    /// Disable track-id based unique counting. Counts then increment once
    /// per detection per frame, which overcounts vehicles that stay in view;
    /// kept as an explicit fallback for detectors without tracking.
    #[arg(long)]
    pub no_tracking: bool,
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.infer_fps == 0 {
            bail!("--infer-fps must be at least 1");
        }
        if self.broadcast_fps == 0 {
            bail!("--broadcast-fps must be at least 1");
        }
        if self.meta_every == 0 {
            bail!("--meta-every must be at least 1");
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            bail!("--jpeg-quality must be between 1 and 100");
        }
        if self.resize_width < 64 {
            bail!("--resize-width must be at least 64");
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            bail!("--confidence must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.iou) {
            bail!("--iou must be within [0, 1]");
        }
        if self.assumed_fps <= 0.0 {
            bail!("--assumed-fps must be positive");
        }
        if self.pixels_per_meter <= 0.0 {
            bail!("--pixels-per-meter must be positive");
        }
        Ok(())
    }

    pub fn tracking_enabled(&self) -> bool {
        !self.no_tracking
    }

    /// Defaults without touching the process environment or CLI; used by
    /// tests that build engines directly.
    pub fn for_tests() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            model: PathBuf::from("model.onnx"),
            infer_fps: 500,
            broadcast_fps: 50,
            meta_every: 5,
            jpeg_quality: 75,
            resize_width: 320,
            persist_interval: 60,
            confidence: 0.30,
            iou: 0.45,
            max_detections: 300,
            assumed_fps: 25.0,
            pixels_per_meter: 50.0,
            track_max_age: 30,
            store_path: PathBuf::from("counters.json"),
            no_tracking: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(Settings::for_tests().validate().is_ok());
    }

    #[test]
    fn rejects_bad_quality() {
        let mut settings = Settings::for_tests();
        settings.jpeg_quality = 0;
        assert!(settings.validate().is_err());
        settings.jpeg_quality = 101;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_zero_rates() {
        let mut settings = Settings::for_tests();
        settings.infer_fps = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::for_tests();
        settings.meta_every = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn tracking_flag_inverts() {
        let mut settings = Settings::for_tests();
        assert!(settings.tracking_enabled());
        settings.no_tracking = true;
        assert!(!settings.tracking_enabled());
    }
}
