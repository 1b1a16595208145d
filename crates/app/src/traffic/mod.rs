//! Vehicle detection pipeline: ingest, track, annotate, and broadcast.
//!
//! The module is split into focused submodules:
//! - `config`: CLI/env settings shared by every stage.
//! - `data`: payload and statistics structs passed between stages.
//! - `detector`: the external-detector contract and the ONNX implementation.
//! - `tracker`: per-object kinematics and track lifecycle.
//! - `engine`: the adaptive capture → detect → track → encode loop.
//! - `annotate`: drawing primitives and JPEG encoding.
//! - `store`: persisted per-camera counters.
//! - `server`: Actix Web control surface.
//! - `ws`: viewer connections, backpressure, and the broadcast loop.
//! - `telemetry`: tracing subscriber and Prometheus recorder setup.

pub mod annotate;
pub mod config;
pub mod data;
pub mod detector;
pub mod engine;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod tracker;
pub mod ws;

pub use config::Settings;
pub use engine::{DetectionEngine, TrafficEngine};
