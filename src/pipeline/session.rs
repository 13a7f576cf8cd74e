//! One MJPEG viewer
//!
//! A session moves `Handshaking -> Streaming -> Closed`. Each call to
//! [`StreamSession::step`] does at most one acquire/encode/send/release
//! cycle and never keeps a frame checked out when it returns.

use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::capture::{CaptureProfile, ConsumerId, Frame, FrameCodec, FrameSource};
use crate::error::{AcquireError, TransportError};

/// Byte sink for one connected client
pub trait Transport: Send {
    /// False once the peer has gone away
    fn is_connected(&self) -> bool;

    /// False while a previous write is still queued
    fn is_writable(&self) -> bool {
        true
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Write one multipart part: header, body, trailing CRLF
    fn write_part(&mut self, header: &[u8], body: &Bytes) -> Result<(), TransportError> {
        self.write_bytes(header)?;
        self.write_bytes(body)?;
        self.write_bytes(b"\r\n")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Streaming,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    HandshakeFailed,
    /// Peer went away between frames
    Disconnected,
    TransportFailure,
    HardwareFailure,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Response headers went out
    Handshaken,
    /// One frame went out
    Sent,
    /// Not time for the next frame yet, or the transport is backed up
    Idle,
    /// No frame this round (pool busy or frame failed to encode)
    Skipped,
    Closed(CloseReason),
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub boundary: String,
    /// Minimum time between two frames
    pub frame_interval: Duration,
    /// Sensor profile while any session is streaming
    pub profile: CaptureProfile,
}

pub struct StreamSession {
    id: ConsumerId,
    transport: Box<dyn Transport>,
    settings: StreamSettings,
    state: SessionState,
    frames_sent: u64,
    started_at: Instant,
    next_frame_at: Instant,
    profile_entered: bool,
    close_reason: Option<CloseReason>,
}

/// `HTTP/1.1 200` head announcing a multipart stream
pub fn response_head(boundary: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: multipart/x-mixed-replace; boundary={boundary}\r\n\
         Cache-Control: no-cache, no-store\r\n\
         Pragma: no-cache\r\n\
         Connection: close\r\n\
         \r\n"
    )
}

/// Header preceding each JPEG in the stream
pub fn part_header(boundary: &str, len: usize) -> String {
    format!("--{boundary}\r\nContent-Type: image/jpeg\r\nContent-Length: {len}\r\n\r\n")
}

impl StreamSession {
    pub fn new(id: ConsumerId, transport: Box<dyn Transport>, settings: StreamSettings) -> Self {
        let now = Instant::now();
        Self {
            id,
            transport,
            settings,
            state: SessionState::Handshaking,
            frames_sent: 0,
            started_at: now,
            next_frame_at: now,
            profile_entered: false,
            close_reason: None,
        }
    }

    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Advance the session by one unit of work
    pub fn step(&mut self, source: &mut FrameSource, codec: &FrameCodec) -> StepOutcome {
        match self.state {
            SessionState::Handshaking => self.handshake(source),
            SessionState::Streaming => self.stream_frame(source, codec),
            SessionState::Closed => StepOutcome::Closed(
                self.close_reason.unwrap_or(CloseReason::Shutdown),
            ),
        }
    }

    /// Close from outside, e.g. on shutdown. No-op if already closed.
    pub fn close(&mut self, source: &mut FrameSource, reason: CloseReason) {
        if self.state == SessionState::Closed {
            return;
        }

        if self.profile_entered {
            if let Err(e) = source.leave_streaming() {
                warn!(session = %self.id, error = %e, "Failed to restore still profile");
            }
            self.profile_entered = false;
        }

        self.state = SessionState::Closed;
        self.close_reason = Some(reason);
        info!(
            session = %self.id,
            ?reason,
            frames = self.frames_sent,
            duration = ?self.started_at.elapsed(),
            "Stream closed"
        );
    }

    fn handshake(&mut self, source: &mut FrameSource) -> StepOutcome {
        if let Err(e) = source.enter_streaming(self.settings.profile) {
            warn!(session = %self.id, error = %e, "Stream profile not applied");
        }
        self.profile_entered = true;

        let head = response_head(&self.settings.boundary);
        if let Err(e) = self.transport.write_bytes(head.as_bytes()) {
            debug!(session = %self.id, error = %e, "Handshake failed");
            self.close(source, CloseReason::HandshakeFailed);
            return StepOutcome::Closed(CloseReason::HandshakeFailed);
        }

        self.state = SessionState::Streaming;
        info!(session = %self.id, "Stream started");
        StepOutcome::Handshaken
    }

    fn stream_frame(&mut self, source: &mut FrameSource, codec: &FrameCodec) -> StepOutcome {
        if !self.transport.is_connected() {
            self.close(source, CloseReason::Disconnected);
            return StepOutcome::Closed(CloseReason::Disconnected);
        }

        let now = Instant::now();
        if now < self.next_frame_at || !self.transport.is_writable() {
            return StepOutcome::Idle;
        }

        let frame = match source.acquire(self.id) {
            Ok(frame) => frame,
            Err(AcquireError::Busy { .. }) => return StepOutcome::Skipped,
            Err(e @ AcquireError::HardwareFailure(_)) => {
                warn!(session = %self.id, error = %e, "Capture failed during stream");
                self.close(source, CloseReason::HardwareFailure);
                return StepOutcome::Closed(CloseReason::HardwareFailure);
            }
        };

        let encoded = match source.convert(&frame, codec, self.settings.profile.quality) {
            Ok(encoded) => encoded,
            Err(e) => {
                debug!(session = %self.id, error = %e, "Dropping frame that failed to encode");
                self.release(source, frame);
                return StepOutcome::Skipped;
            }
        };

        let header = part_header(&self.settings.boundary, encoded.len());
        let written = self.transport.write_part(header.as_bytes(), &encoded.data);
        self.release(source, frame);

        match written {
            Ok(()) => {
                self.frames_sent += 1;
                self.next_frame_at = now + self.settings.frame_interval;
                metrics::counter!("frames_streamed_total").increment(1);
                StepOutcome::Sent
            }
            Err(e) => {
                debug!(session = %self.id, error = %e, "Client write failed");
                self.close(source, CloseReason::TransportFailure);
                StepOutcome::Closed(CloseReason::TransportFailure)
            }
        }
    }

    fn release(&self, source: &mut FrameSource, frame: Frame) {
        if let Err(e) = source.release(frame) {
            warn!(session = %self.id, error = %e, "Frame release rejected");
        }
    }
}
