//! OpenCV-backed video acquisition with a single-slot latest-frame mailbox.
//!
//! A [`StreamSource`] owns a background grab thread that continuously reads
//! from the active capture (RTSP stream, local file, or webcam) and
//! overwrites the shared slot with the newest frame. Consumers call
//! [`StreamSource::read_frame`] and never block on device I/O; frames the
//! consumer is too slow to pick up are intentionally dropped, since only the
//! newest frame matters for a live feed.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use chrono::Utc;
use opencv::{
    prelude::*,
    videoio::{self, VideoCapture},
};
use tracing::{debug, error, info, warn};

mod types;

pub use types::{
    CameraProbe, CaptureError, Frame, FrameFormat, OpenInfo, OpenRequest, RtspTransport,
    SourceKind,
};

const RECONNECT_BACKOFF: Duration = Duration::from_millis(500);
const READ_RETRY_BACKOFF: Duration = Duration::from_millis(100);
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Seam between the engine and the capture layer. Production code uses
/// [`StreamSource`]; tests drive the engine with synthetic sources.
pub trait VideoSource: Send + Sync + 'static {
    fn open(&self, request: OpenRequest) -> Result<OpenInfo, CaptureError>;
    /// Non-blocking copy of the latest grabbed frame, if any.
    fn read_frame(&self) -> Option<Frame>;
    fn is_running(&self) -> bool;
    fn kind(&self) -> Option<SourceKind>;
    fn stop(&self);
}

struct Shared {
    slot: Mutex<Option<Frame>>,
    meta: Mutex<Option<SourceKind>>,
    stop: AtomicBool,
    running: AtomicBool,
    seq: AtomicU64,
}

/// Video capture front-end managing at most one open source at a time.
///
/// Opening a new source always stops the previous one first. All methods
/// take `&self`; internal state is shared with the grab thread.
pub struct StreamSource {
    shared: Arc<Shared>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Default for StreamSource {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamSource {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(None),
                meta: Mutex::new(None),
                stop: AtomicBool::new(false),
                running: AtomicBool::new(false),
                seq: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Open an RTSP stream, preferring TCP transport and falling back to UDP.
    ///
    /// A transport only counts as connected once an actual frame has been
    /// read; a successful handshake with no decodable video is treated as a
    /// failure so we never keep a half-open capture.
    pub fn open_rtsp(&self, url: &str) -> Result<OpenInfo, CaptureError> {
        self.stop();

        let connected = negotiate_rtsp(|transport| {
            info!("trying RTSP over {}", transport.label());
            let mut cap = create_rtsp_capture(url, transport)?;
            if read_probe_frame(&mut cap) {
                Some(cap)
            } else {
                let _ = cap.release();
                None
            }
        });

        match connected {
            Some((cap, transport)) => {
                self.begin_session(cap, SourceKind::Rtsp, url.to_string());
                Ok(OpenInfo::Rtsp { transport })
            }
            None => Err(CaptureError::Connect {
                url: url.to_string(),
            }),
        }
    }

    /// Open a local video file. The grab loop is started even though
    /// sequential reads would be safe synchronously, so the read API behaves
    /// identically across source kinds.
    pub fn open_file(&self, path: &str) -> Result<OpenInfo, CaptureError> {
        self.stop();

        let cap = match VideoCapture::from_file(path, videoio::CAP_ANY) {
            Ok(cap) if cap.is_opened().unwrap_or(false) => cap,
            _ => {
                return Err(CaptureError::OpenFile {
                    path: path.to_string(),
                });
            }
        };

        let total_frames = cap.get(videoio::CAP_PROP_FRAME_COUNT).unwrap_or(0.0) as i64;
        let fps = cap.get(videoio::CAP_PROP_FPS).unwrap_or(0.0);
        self.begin_session(cap, SourceKind::File, path.to_string());
        Ok(OpenInfo::File { total_frames, fps })
    }

    /// Open a local capture device by index, requesting a 1280x720 mode and
    /// verifying one frame is readable before declaring success.
    pub fn open_webcam(&self, index: i32) -> Result<OpenInfo, CaptureError> {
        self.stop();

        let mut cap = open_device(index).ok_or(CaptureError::OpenDevice { index })?;
        let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, 1280.0);
        let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, 720.0);
        let _ = cap.set(videoio::CAP_PROP_BUFFERSIZE, 1.0);

        if !read_probe_frame(&mut cap) {
            let _ = cap.release();
            return Err(CaptureError::NoFrames { index });
        }

        let width = cap.get(videoio::CAP_PROP_FRAME_WIDTH).unwrap_or(0.0) as i32;
        let height = cap.get(videoio::CAP_PROP_FRAME_HEIGHT).unwrap_or(0.0) as i32;
        let fps = cap.get(videoio::CAP_PROP_FPS).unwrap_or(0.0);
        self.begin_session(cap, SourceKind::Webcam, index.to_string());
        Ok(OpenInfo::Webcam {
            index,
            width,
            height,
            fps,
        })
    }

    /// Copy of the most recently grabbed frame, without blocking on device
    /// I/O. `None` when nothing has been captured yet, the source is
    /// stopped, or a file source has been exhausted.
    pub fn read_frame(&self) -> Option<Frame> {
        if !self.shared.running.load(Ordering::Relaxed) {
            return None;
        }
        match self.shared.slot.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Relaxed)
    }

    pub fn kind(&self) -> Option<SourceKind> {
        match self.shared.meta.lock() {
            Ok(guard) => *guard,
            Err(_) => None,
        }
    }

    /// Stop the grab loop and release the capture. Idempotent.
    ///
    /// The grab thread owns the capture handle, so a thread stuck inside a
    /// blocking device read is left to exit (and release) on its own once
    /// the read returns; we only wait a bounded amount of time for it.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        let handle = match self.worker.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            if !join_with_timeout(handle, STOP_JOIN_TIMEOUT) {
                warn!("grab thread did not stop within {STOP_JOIN_TIMEOUT:?}; detaching");
            }
        }
        self.shared.running.store(false, Ordering::SeqCst);
        if let Ok(mut slot) = self.shared.slot.lock() {
            *slot = None;
        }
        if let Ok(mut meta) = self.shared.meta.lock() {
            *meta = None;
        }
        self.shared.stop.store(false, Ordering::SeqCst);
    }

    /// Probe local device indices and report the ones that deliver frames.
    pub fn scan_cameras(max_count: i32) -> Vec<CameraProbe> {
        let mut cameras = Vec::new();
        for index in 0..max_count {
            let Some(mut cap) = open_device(index) else {
                continue;
            };
            if read_probe_frame(&mut cap) {
                cameras.push(CameraProbe {
                    index,
                    name: format!("Camera {index}"),
                    width: cap.get(videoio::CAP_PROP_FRAME_WIDTH).unwrap_or(0.0) as i32,
                    height: cap.get(videoio::CAP_PROP_FRAME_HEIGHT).unwrap_or(0.0) as i32,
                });
            }
            let _ = cap.release();
        }
        cameras
    }

    /// Test an RTSP connection without keeping it open.
    pub fn test_rtsp(url: &str) -> Result<RtspTransport, CaptureError> {
        for transport in [RtspTransport::Tcp, RtspTransport::Udp] {
            if let Some(mut cap) = create_rtsp_capture(url, transport) {
                let ok = read_probe_frame(&mut cap);
                let _ = cap.release();
                if ok {
                    return Ok(transport);
                }
            }
        }
        Err(CaptureError::Connect {
            url: url.to_string(),
        })
    }

    fn begin_session(&self, cap: VideoCapture, kind: SourceKind, url: String) {
        if let Ok(mut meta) = self.shared.meta.lock() {
            *meta = Some(kind);
        }
        if let Ok(mut slot) = self.shared.slot.lock() {
            *slot = None;
        }
        self.shared.stop.store(false, Ordering::SeqCst);
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("video-ingest-grab".into())
            .spawn(move || grab_loop(shared, cap, kind, url))
            .expect("failed to spawn grab thread");
        if let Ok(mut worker) = self.worker.lock() {
            *worker = Some(handle);
        }
    }
}

impl Drop for StreamSource {
    fn drop(&mut self) {
        self.stop();
    }
}

impl VideoSource for StreamSource {
    fn open(&self, request: OpenRequest) -> Result<OpenInfo, CaptureError> {
        match request {
            OpenRequest::Rtsp { url } => self.open_rtsp(&url),
            OpenRequest::File { path } => self.open_file(&path),
            OpenRequest::Webcam { index } => self.open_webcam(index),
        }
    }

    fn read_frame(&self) -> Option<Frame> {
        StreamSource::read_frame(self)
    }

    fn is_running(&self) -> bool {
        StreamSource::is_running(self)
    }

    fn kind(&self) -> Option<SourceKind> {
        StreamSource::kind(self)
    }

    fn stop(&self) {
        StreamSource::stop(self)
    }
}

/// Background grab loop. Runs until stopped; transient I/O failures are
/// handled with backoff (and reconnect for network sources) and never
/// surface to `read_frame` callers beyond a temporarily empty slot. A file
/// source ending clears the slot and exits the loop so the consumer can
/// observe end-of-stream.
fn grab_loop(shared: Arc<Shared>, mut cap: VideoCapture, kind: SourceKind, url: String) {
    let mut mat = Mat::default();

    while !shared.stop.load(Ordering::Relaxed) {
        match cap.read(&mut mat) {
            Ok(true) if mat_has_data(&mat) => {
                match mat_to_frame(&mat, &shared.seq) {
                    Ok(frame) => {
                        if let Ok(mut slot) = shared.slot.lock() {
                            *slot = Some(frame);
                        }
                    }
                    Err(err) => {
                        warn!("failed to copy grabbed frame: {err}");
                        thread::sleep(READ_RETRY_BACKOFF);
                    }
                }
                continue;
            }
            Ok(_) => {}
            Err(err) => error!("capture read error: {err}"),
        }

        match kind {
            SourceKind::File => {
                debug!("file source exhausted");
                if let Ok(mut slot) = shared.slot.lock() {
                    *slot = None;
                }
                break;
            }
            SourceKind::Rtsp => {
                warn!("stream read failed (empty frame)");
                reconnect_rtsp(&mut cap, &url);
                thread::sleep(RECONNECT_BACKOFF);
            }
            SourceKind::Webcam => {
                thread::sleep(READ_RETRY_BACKOFF);
            }
        }
    }

    let _ = cap.release();
}

/// Recreate the RTSP capture with the default reliable transport and swap it
/// in if the new connection opens.
fn reconnect_rtsp(cap: &mut VideoCapture, url: &str) {
    info!("attempting to reconnect to RTSP: {url}");
    let _ = cap.release();
    match create_rtsp_capture(url, RtspTransport::Tcp) {
        Some(fresh) => {
            *cap = fresh;
            info!("reconnection successful");
        }
        None => {
            error!("reconnection failed");
        }
    }
}

/// Try each RTSP transport in preference order (TCP first, UDP fallback)
/// until one yields a validated connection.
fn negotiate_rtsp<F, C>(mut connect: F) -> Option<(C, RtspTransport)>
where
    F: FnMut(RtspTransport) -> Option<C>,
{
    for transport in [RtspTransport::Tcp, RtspTransport::Udp] {
        if let Some(capture) = connect(transport) {
            return Some((capture, transport));
        }
    }
    None
}

/// FFmpeg capture options for a low-latency live stream: minimal internal
/// buffering, quick probing, 15s socket timeout.
fn low_latency_options(transport: RtspTransport) -> String {
    format!(
        "rtsp_transport;{}|analyzeduration;1000000|probesize;500000|fflags;nobuffer|flags;low_delay|stimeout;15000000",
        transport.ffmpeg_token()
    )
}

fn create_rtsp_capture(url: &str, transport: RtspTransport) -> Option<VideoCapture> {
    std::env::set_var(
        "OPENCV_FFMPEG_CAPTURE_OPTIONS",
        low_latency_options(transport),
    );
    match VideoCapture::from_file(url, videoio::CAP_FFMPEG) {
        Ok(mut cap) if cap.is_opened().unwrap_or(false) => {
            let _ = cap.set(videoio::CAP_PROP_BUFFERSIZE, 1.0);
            Some(cap)
        }
        _ => None,
    }
}

fn open_device(index: i32) -> Option<VideoCapture> {
    for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
        if let Ok(cap) = VideoCapture::new(index, backend) {
            if cap.is_opened().unwrap_or(false) {
                return Some(cap);
            }
        }
    }
    None
}

fn read_probe_frame(cap: &mut VideoCapture) -> bool {
    let mut mat = Mat::default();
    matches!(cap.read(&mut mat), Ok(true)) && mat_has_data(&mat)
}

fn mat_has_data(mat: &Mat) -> bool {
    mat.size()
        .map(|s| s.width > 0 && s.height > 0)
        .unwrap_or(false)
}

fn mat_to_frame(mat: &Mat, seq: &AtomicU64) -> anyhow::Result<Frame> {
    let size = mat.size()?;
    let data = mat.data_bytes()?.to_vec();
    Ok(Frame {
        data,
        width: size.width,
        height: size.height,
        seq: seq.fetch_add(1, Ordering::Relaxed) + 1,
        timestamp_ms: Utc::now().timestamp_millis(),
        format: FrameFormat::Bgr8,
    })
}

/// Poll-join a thread with a deadline; returns whether it finished in time.
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
