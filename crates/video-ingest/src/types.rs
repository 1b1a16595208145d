use anyhow::Error;
use thiserror::Error;

/// Raw BGR frame copied out of the latest-frame slot.
///
/// `seq` is a generation counter stamped by the grab loop; consumers compare
/// it against the last sequence they processed to detect a stale slot.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub seq: u64,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to connect to {url:?} — check URL, credentials, and network reachability")]
    Connect { url: String },
    #[error("failed to open video file {path:?}")]
    OpenFile { path: String },
    #[error("failed to open camera {index}")]
    OpenDevice { index: i32 },
    #[error("camera {index} opened but produced no frames")]
    NoFrames { index: i32 },
    #[error(transparent)]
    Other(#[from] Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    Rtsp,
    File,
    Webcam,
}

impl SourceKind {
    pub fn label(self) -> &'static str {
        match self {
            SourceKind::Rtsp => "rtsp",
            SourceKind::File => "file",
            SourceKind::Webcam => "webcam",
        }
    }

    /// Live sources never end; a missing frame only means the grabber has
    /// nothing new yet.
    pub fn is_live(self) -> bool {
        !matches!(self, SourceKind::File)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RtspTransport {
    Tcp,
    Udp,
}

impl RtspTransport {
    pub fn label(self) -> &'static str {
        match self {
            RtspTransport::Tcp => "TCP",
            RtspTransport::Udp => "UDP",
        }
    }

    pub(crate) fn ffmpeg_token(self) -> &'static str {
        match self {
            RtspTransport::Tcp => "tcp",
            RtspTransport::Udp => "udp",
        }
    }
}

/// Details reported back to the caller after a successful `open_*`.
#[derive(Clone, Debug)]
pub enum OpenInfo {
    Rtsp {
        transport: RtspTransport,
    },
    File {
        total_frames: i64,
        fps: f64,
    },
    Webcam {
        index: i32,
        width: i32,
        height: i32,
        fps: f64,
    },
}

/// Source selection passed through the [`crate::VideoSource`] seam.
#[derive(Clone, Debug)]
pub enum OpenRequest {
    Rtsp { url: String },
    File { path: String },
    Webcam { index: i32 },
}

impl OpenRequest {
    pub fn kind(&self) -> SourceKind {
        match self {
            OpenRequest::Rtsp { .. } => SourceKind::Rtsp,
            OpenRequest::File { .. } => SourceKind::File,
            OpenRequest::Webcam { .. } => SourceKind::Webcam,
        }
    }
}

/// Result of probing one local capture device.
#[derive(Clone, Debug)]
pub struct CameraProbe {
    pub index: i32,
    pub name: String,
    pub width: i32,
    pub height: i32,
}
