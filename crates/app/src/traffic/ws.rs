//! Viewer connections and the fixed-cadence broadcast fan-out.
//!
//! Delivery is backpressure-aware per viewer: a `ready` flag guarantees at
//! most one in-flight send per connection. A broadcast tick skips not-ready
//! viewers entirely — their dropped counter increments and nothing is
//! queued, so a slow viewer can never accumulate backlog or stall the rest.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use actix_web::{web, HttpRequest, HttpResponse};
use actix_ws::Message;
use futures_util::StreamExt;
use serde::Deserialize;
use tracing::{debug, error, info};

use crate::traffic::engine::TrafficEngine;

/// Transport abstraction for one viewer connection; production uses
/// [`WsSink`], tests substitute recording sinks.
pub trait PayloadSink: Clone + Send + Sync + 'static {
    fn deliver(&self, text: String) -> impl Future<Output = Result<(), ()>> + Send;
}

struct ClientState<K> {
    sink: K,
    ready: Arc<AtomicBool>,
    frames_sent: Arc<AtomicU64>,
    frames_dropped: Arc<AtomicU64>,
}

/// Tracks connected viewers and their delivery stats.
pub struct ConnectionRegistry<K: PayloadSink> {
    clients: Mutex<HashMap<u64, ClientState<K>>>,
    next_id: AtomicU64,
}

impl<K: PayloadSink> Default for ConnectionRegistry<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: PayloadSink> ConnectionRegistry<K> {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn connect(&self, sink: K) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut clients = self.clients.lock().unwrap_or_else(|p| p.into_inner());
        clients.insert(
            id,
            ClientState {
                sink,
                ready: Arc::new(AtomicBool::new(true)),
                frames_sent: Arc::new(AtomicU64::new(0)),
                frames_dropped: Arc::new(AtomicU64::new(0)),
            },
        );
        metrics::gauge!("traffic_viewers").set(clients.len() as f64);
        info!("viewer {id} connected (total: {})", clients.len());
        id
    }

    pub fn disconnect(&self, id: u64) {
        let mut clients = self.clients.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(client) = clients.remove(&id) {
            let sent = client.frames_sent.load(Ordering::Relaxed);
            let dropped = client.frames_dropped.load(Ordering::Relaxed);
            let dropped_pct = if sent + dropped > 0 {
                dropped as f64 / (sent + dropped) as f64 * 100.0
            } else {
                0.0
            };
            metrics::gauge!("traffic_viewers").set(clients.len() as f64);
            info!(
                "viewer {id} disconnected: sent={sent}, dropped={dropped} ({dropped_pct:.0}%), remaining: {}",
                clients.len()
            );
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    /// Fan one serialized payload out to every viewer currently ready.
    ///
    /// Each attempted viewer is marked not-ready before its send and ready
    /// again afterward, success or not. Delivery errors are swallowed here;
    /// dead connections are reaped by the connection-lifecycle handler.
    pub async fn broadcast(&self, text: &str) {
        let mut sends = Vec::new();
        {
            let clients = self.clients.lock().unwrap_or_else(|p| p.into_inner());
            for client in clients.values() {
                if client.ready.swap(false, Ordering::SeqCst) {
                    let sink = client.sink.clone();
                    let ready = client.ready.clone();
                    let sent = client.frames_sent.clone();
                    let text = text.to_string();
                    sends.push(async move {
                        if sink.deliver(text).await.is_ok() {
                            sent.fetch_add(1, Ordering::Relaxed);
                        }
                        ready.store(true, Ordering::SeqCst);
                    });
                } else {
                    client.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("traffic_broadcast_dropped_total").increment(1);
                }
            }
        }
        futures_util::future::join_all(sends).await;
    }

    #[cfg(test)]
    fn force_not_ready(&self, id: u64) {
        let clients = self.clients.lock().unwrap();
        clients[&id].ready.store(false, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn delivery_stats(&self, id: u64) -> (u64, u64) {
        let clients = self.clients.lock().unwrap();
        let client = &clients[&id];
        (
            client.frames_sent.load(Ordering::Relaxed),
            client.frames_dropped.load(Ordering::Relaxed),
        )
    }
}

/// Viewer sink backed by an `actix-ws` session.
#[derive(Clone)]
pub struct WsSink {
    session: actix_ws::Session,
}

impl PayloadSink for WsSink {
    fn deliver(&self, text: String) -> impl Future<Output = Result<(), ()>> + Send {
        let mut session = self.session.clone();
        async move { session.text(text).await.map_err(|_| ()) }
    }
}

/// Fixed-interval delivery loop, independent of the inference cadence.
///
/// Each tick consumes the engine's payload slot; if no new payload was
/// published since the last tick nothing is sent. Serialization happens
/// once per tick, and the fan-out runs as its own task so a slow tick can
/// never delay the next one.
pub fn spawn_broadcast_loop(
    engine: TrafficEngine,
    registry: Arc<ConnectionRegistry<WsSink>>,
    broadcast_fps: u32,
) {
    actix_web::rt::spawn(async move {
        let period = Duration::from_secs_f64(1.0 / f64::from(broadcast_fps.max(1)));
        let mut ticker = actix_web::rt::time::interval(period);
        loop {
            ticker.tick().await;
            let Some(payload) = engine.take_broadcast_payload() else {
                continue;
            };
            if registry.client_count() == 0 {
                continue;
            }
            match serde_json::to_string(&payload) {
                Ok(text) => {
                    let registry = registry.clone();
                    actix_web::rt::spawn(async move {
                        registry.broadcast(&text).await;
                    });
                }
                Err(err) => error!("failed to serialize broadcast payload: {err}"),
            }
        }
    });
}

/// Optional live-config updates sent by viewers.
#[derive(Debug, Deserialize)]
struct ClientConfig {
    confidence: Option<f32>,
    command: Option<String>,
}

/// `GET /ws/video` — upgrade, register with the registry, and service
/// client messages until the connection closes.
pub async fn video_ws(
    req: HttpRequest,
    body: web::Payload,
    engine: web::Data<TrafficEngine>,
    registry: web::Data<ConnectionRegistry<WsSink>>,
) -> actix_web::Result<HttpResponse> {
    let (response, session, mut stream) = actix_ws::handle(&req, body)?;

    let id = registry.connect(WsSink {
        session: session.clone(),
    });
    let engine = engine.get_ref().clone();
    let registry = registry.into_inner();

    actix_web::rt::spawn(async move {
        let mut session = session;
        while let Some(Ok(msg)) = stream.next().await {
            match msg {
                Message::Text(text) => {
                    handle_client_message(&engine, &mut session, &text).await;
                }
                Message::Ping(bytes) => {
                    let _ = session.pong(&bytes).await;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        registry.disconnect(id);
        let _ = session.close(None).await;
    });

    Ok(response)
}

async fn handle_client_message(
    engine: &TrafficEngine,
    session: &mut actix_ws::Session,
    text: &str,
) {
    let Ok(config) = serde_json::from_str::<ClientConfig>(text) else {
        debug!("ignoring malformed client message");
        return;
    };
    if let Some(confidence) = config.confidence {
        engine.set_confidence(confidence);
    }
    if config.command.as_deref() == Some("stop") {
        let engine = engine.clone();
        let _ = web::block(move || engine.stop_processing()).await;
        let _ = session.text(r#"{"status":"stopped"}"#).await;
    }
}
