//! Actix Web control surface: source selection, status, persisted counts,
//! the viewer WebSocket, and Prometheus exposition.

use std::sync::Arc;

use actix_web::{
    middleware::DefaultHeaders,
    web::{self, Json},
    App, HttpResponse, HttpServer,
};
use anyhow::Context;
use chrono::Utc;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use video_ingest::{OpenInfo, StreamSource};

use crate::traffic::{
    config::Settings,
    engine::TrafficEngine,
    store::CounterStore,
    ws::{self, ConnectionRegistry, WsSink},
};

#[derive(Debug, Deserialize)]
struct FileRequest {
    path: String,
}

#[derive(Debug, Deserialize)]
struct RtspRequest {
    url: String,
    camera_id: Option<String>,
    camera_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WebcamRequest {
    index: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct TestRtspRequest {
    url: String,
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn stats(engine: web::Data<TrafficEngine>) -> HttpResponse {
    HttpResponse::Ok().json(engine.stats_view())
}

fn open_error(err: impl std::fmt::Display) -> HttpResponse {
    HttpResponse::BadRequest().json(json!({
        "status": "error",
        "error": err.to_string(),
    }))
}

async fn start_file(
    engine: web::Data<TrafficEngine>,
    request: Json<FileRequest>,
) -> HttpResponse {
    let engine = engine.get_ref().clone();
    let path = request.into_inner().path;
    match web::block(move || engine.set_source_file(&path)).await {
        Ok(Ok(OpenInfo::File { total_frames, fps })) => HttpResponse::Ok().json(json!({
            "status": "started",
            "source": "file",
            "total_frames": total_frames,
            "fps": fps,
        })),
        Ok(Ok(_)) => HttpResponse::InternalServerError().finish(),
        Ok(Err(err)) => open_error(err),
        Err(err) => open_error(err),
    }
}

async fn start_rtsp(
    engine: web::Data<TrafficEngine>,
    request: Json<RtspRequest>,
) -> HttpResponse {
    let engine = engine.get_ref().clone();
    let RtspRequest {
        url,
        camera_id,
        camera_name,
    } = request.into_inner();
    let result = web::block({
        let engine = engine.clone();
        move || engine.set_source_rtsp(&url, camera_id, camera_name)
    })
    .await;
    match result {
        Ok(Ok((OpenInfo::Rtsp { transport }, resumed))) => HttpResponse::Ok().json(json!({
            "status": "started",
            "source": "rtsp",
            "transport": transport.label(),
            "counts": engine.stats_view().counts,
            "resumed": resumed,
        })),
        Ok(Ok(_)) => HttpResponse::InternalServerError().finish(),
        Ok(Err(err)) => open_error(err),
        Err(err) => open_error(err),
    }
}

async fn start_webcam(
    engine: web::Data<TrafficEngine>,
    request: Json<WebcamRequest>,
) -> HttpResponse {
    let engine = engine.get_ref().clone();
    let index = request.into_inner().index.unwrap_or(0);
    match web::block(move || engine.set_source_webcam(index)).await {
        Ok(Ok(OpenInfo::Webcam {
            index,
            width,
            height,
            fps,
        })) => HttpResponse::Ok().json(json!({
            "status": "started",
            "source": "webcam",
            "index": index,
            "width": width,
            "height": height,
            "fps": fps,
        })),
        Ok(Ok(_)) => HttpResponse::InternalServerError().finish(),
        Ok(Err(err)) => open_error(err),
        Err(err) => open_error(err),
    }
}

async fn stop(engine: web::Data<TrafficEngine>) -> HttpResponse {
    let blocking_engine = engine.get_ref().clone();
    let _ = web::block(move || blocking_engine.stop_processing()).await;
    HttpResponse::Ok().json(json!({
        "status": "stopped",
        "final_counts": engine.stats_view().counts,
    }))
}

async fn test_rtsp(request: Json<TestRtspRequest>) -> HttpResponse {
    let url = request.into_inner().url;
    match web::block(move || StreamSource::test_rtsp(&url)).await {
        Ok(Ok(transport)) => HttpResponse::Ok().json(json!({
            "success": true,
            "transport": transport.label(),
        })),
        Ok(Err(err)) => HttpResponse::Ok().json(json!({
            "success": false,
            "error": err.to_string(),
        })),
        Err(err) => open_error(err),
    }
}

async fn list_cameras() -> HttpResponse {
    match web::block(|| StreamSource::scan_cameras(5)).await {
        Ok(cameras) => {
            let cameras: Vec<_> = cameras
                .into_iter()
                .map(|probe| {
                    json!({
                        "index": probe.index,
                        "name": probe.name,
                        "width": probe.width,
                        "height": probe.height,
                    })
                })
                .collect();
            HttpResponse::Ok().json(json!({ "cameras": cameras }))
        }
        Err(err) => open_error(err),
    }
}

async fn camera_counts(store: web::Data<dyn CounterStore>) -> HttpResponse {
    HttpResponse::Ok().json(json!({ "cameras": store.all() }))
}

async fn metrics_endpoint(handle: web::Data<PrometheusHandle>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(handle.render())
}

/// Run the HTTP server on the current thread until shutdown, then tear the
/// engine down. The broadcast loop is spawned onto the same Actix runtime.
pub fn run(
    engine: TrafficEngine,
    store: Arc<dyn CounterStore>,
    settings: Settings,
    prometheus: PrometheusHandle,
) -> anyhow::Result<()> {
    actix_web::rt::System::new().block_on(async move {
        let registry = Arc::new(ConnectionRegistry::<WsSink>::new());
        ws::spawn_broadcast_loop(engine.clone(), registry.clone(), settings.broadcast_fps);

        let engine_data = web::Data::new(engine.clone());
        let registry_data = web::Data::from(registry);
        let store_data = web::Data::from(store);
        let prometheus_data = web::Data::new(prometheus);

        info!("listening on {}:{}", settings.host, settings.port);
        HttpServer::new(move || {
            App::new()
                .app_data(engine_data.clone())
                .app_data(registry_data.clone())
                .app_data(store_data.clone())
                .app_data(prometheus_data.clone())
                .wrap(DefaultHeaders::new().add(("Access-Control-Allow-Origin", "*")))
                .route("/api/health", web::get().to(health))
                .route("/api/stats", web::get().to(stats))
                .route("/api/stop", web::post().to(stop))
                .route("/api/start/file", web::post().to(start_file))
                .route("/api/start/rtsp", web::post().to(start_rtsp))
                .route("/api/start/webcam", web::post().to(start_webcam))
                .route("/api/test-rtsp", web::post().to(test_rtsp))
                .route("/api/cameras", web::get().to(list_cameras))
                .route("/api/cameras/counts", web::get().to(camera_counts))
                .route("/ws/video", web::get().to(ws::video_ws))
                .route("/metrics", web::get().to(metrics_endpoint))
        })
        .bind((settings.host.as_str(), settings.port))
        .with_context(|| format!("failed to bind {}:{}", settings.host, settings.port))?
        .run()
        .await
        .context("HTTP server error")?;

        engine.stop_processing();
        Ok(())
    })
}
