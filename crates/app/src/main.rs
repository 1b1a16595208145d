use std::sync::Arc;

use clap::Parser;
use video_ingest::StreamSource;

use trafficwatch::traffic::{
    config::Settings,
    detector::{DetectorOptions, YoloDetector},
    engine::DetectionEngine,
    server,
    store::{CounterStore, JsonFileStore},
    telemetry,
};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let settings = Settings::parse();
    settings.validate()?;

    let prometheus = telemetry::init();

    let store: Arc<dyn CounterStore> = Arc::new(JsonFileStore::new(&settings.store_path));
    let detector = YoloDetector::new(
        &settings.model,
        DetectorOptions {
            iou_threshold: settings.iou,
            max_detections: settings.max_detections,
            ..DetectorOptions::default()
        },
    )?;

    let engine = DetectionEngine::new(
        StreamSource::new(),
        Box::new(detector),
        store.clone(),
        settings.clone(),
    );

    server::run(engine, store, settings, prometheus)
}
