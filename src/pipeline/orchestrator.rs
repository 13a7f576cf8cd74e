//! Single point of arbitration over the frame source
//!
//! One [`CaptureOrchestrator::poll`] services, in order: the daily schedule,
//! one step of every stream session, and at most one on-demand capture.
//! No checkout outlives the poll that took it, so consumers interleave at
//! poll granularity and none can starve another.

use std::collections::VecDeque;
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

use super::scheduler::{CaptureScheduler, Tick, WallClock};
use super::session::{CloseReason, StepOutcome, StreamSession, StreamSettings, Transport};
use crate::capture::{ConsumerId, FrameCodec, FrameSource};
use crate::error::{CaptureError, ReleaseError};
use crate::storage::ImageStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureKind {
    /// Daily unattended capture
    Scheduled { day_of_year: Option<u16> },
    /// Requested by a client
    OnDemand { flash: bool },
    /// One frame of a stream session
    Streamed { session: ConsumerId },
}

#[derive(Debug, Clone, Copy)]
pub struct CaptureRequest {
    pub kind: CaptureKind,
    pub requested_at: Instant,
}

impl CaptureRequest {
    pub fn new(kind: CaptureKind) -> Self {
        Self {
            kind,
            requested_at: Instant::now(),
        }
    }
}

pub type CaptureReply = oneshot::Sender<Result<String, CaptureError>>;

/// Messages from the outside world into the capture loop
pub enum Command {
    OpenStream(Box<dyn Transport>),
    Capture {
        flash: bool,
        reply: Option<CaptureReply>,
    },
    Shutdown,
}

/// Cloneable sender side of the orchestrator's command channel
#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: flume::Sender<Command>,
}

impl OrchestratorHandle {
    /// Hand a freshly accepted client to the capture loop
    pub fn open_stream(&self, transport: Box<dyn Transport>) -> Result<(), CaptureError> {
        self.tx
            .send(Command::OpenStream(transport))
            .map_err(|_| CaptureError::Unavailable)
    }

    /// Queue an on-demand capture; the filename arrives on the receiver
    pub fn request_capture(
        &self,
        flash: bool,
    ) -> Result<oneshot::Receiver<Result<String, CaptureError>>, CaptureError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Capture {
                flash,
                reply: Some(reply),
            })
            .map_err(|_| CaptureError::Unavailable)?;
        Ok(rx)
    }

    /// Capture and persist one image, returning its filename
    pub async fn capture(&self, flash: bool) -> Result<String, CaptureError> {
        let rx = self.request_capture(flash)?;
        rx.await.map_err(|_| CaptureError::Unavailable)?
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FlashSettings {
    /// Light the flash for scheduled captures
    pub scheduled: bool,
    pub stabilization: Duration,
    pub trailing: Duration,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// JPEG quality for persisted captures
    pub still_quality: u8,
    pub flash: FlashSettings,
    pub stream: StreamSettings,
    /// Sleep between polls in [`CaptureOrchestrator::run`]
    pub poll_interval: Duration,
    /// Polls a retryable capture is attempted before giving up
    pub max_capture_attempts: u32,
}

/// What happened to the scheduled capture during one poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduledAttempt {
    Saved(String),
    Deferred,
    Abandoned,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub scheduled: Option<ScheduledAttempt>,
    pub frames_sent: usize,
    pub sessions_closed: usize,
    pub on_demand_served: usize,
}

/// A persisted capture waiting for its turn
struct Pending {
    request: CaptureRequest,
    flash: bool,
    reply: Option<CaptureReply>,
    attempts: u32,
}

impl Pending {
    fn scheduled(day_of_year: Option<u16>, flash: bool) -> Self {
        Self {
            request: CaptureRequest::new(CaptureKind::Scheduled { day_of_year }),
            flash,
            reply: None,
            attempts: 0,
        }
    }

    fn on_demand(flash: bool, reply: Option<CaptureReply>) -> Self {
        Self {
            request: CaptureRequest::new(CaptureKind::OnDemand { flash }),
            flash,
            reply,
            attempts: 0,
        }
    }
}

impl CaptureKind {
    /// Short name used in logs and as the storage hint
    pub fn label(&self) -> &'static str {
        match self {
            CaptureKind::Scheduled { .. } => "scheduled",
            CaptureKind::OnDemand { .. } => "on-demand",
            CaptureKind::Streamed { .. } => "streamed",
        }
    }
}

pub struct CaptureOrchestrator {
    source: FrameSource,
    codec: FrameCodec,
    scheduler: CaptureScheduler,
    clock: Box<dyn WallClock>,
    store: Box<dyn ImageStore>,
    settings: OrchestratorSettings,
    sessions: Vec<StreamSession>,
    scheduled: Option<Pending>,
    on_demand: VecDeque<Pending>,
    commands: flume::Receiver<Command>,
    next_consumer: u64,
    shutdown: bool,
}

impl CaptureOrchestrator {
    pub fn new(
        source: FrameSource,
        scheduler: CaptureScheduler,
        clock: Box<dyn WallClock>,
        store: Box<dyn ImageStore>,
        settings: OrchestratorSettings,
    ) -> (Self, OrchestratorHandle) {
        let (tx, rx) = flume::unbounded();

        let orchestrator = Self {
            source,
            codec: FrameCodec::new(),
            scheduler,
            clock,
            store,
            settings,
            sessions: Vec::new(),
            scheduled: None,
            on_demand: VecDeque::new(),
            commands: rx,
            next_consumer: 1,
            shutdown: false,
        };

        (orchestrator, OrchestratorHandle { tx })
    }

    pub fn source(&self) -> &FrameSource {
        &self.source
    }

    pub fn scheduler(&self) -> &CaptureScheduler {
        &self.scheduler
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn queued_captures(&self) -> usize {
        self.on_demand.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown
    }

    /// One bounded pass over schedule, sessions and on-demand queue
    pub fn poll(&mut self) -> PollReport {
        let mut report = PollReport::default();
        self.drain_commands();

        // 1. Daily schedule
        let now = self.clock.now();
        if self.scheduler.tick(now) == Tick::Due {
            info!("Time for scheduled capture");
            if self.scheduled.is_some() {
                warn!("Previous scheduled capture still pending, replacing it");
            }
            self.scheduled = Some(Pending::scheduled(
                now.map(|r| r.day_of_year),
                self.settings.flash.scheduled,
            ));
        }
        if let Some(mut pending) = self.scheduled.take() {
            let attempt = match self.serve(&pending) {
                Ok(name) => ScheduledAttempt::Saved(name),
                Err(e) => {
                    pending.attempts += 1;
                    if e.is_retryable() && pending.attempts < self.settings.max_capture_attempts {
                        warn!(error = %e, attempt = pending.attempts, "Scheduled capture failed, retrying next poll");
                        self.scheduled = Some(pending);
                        ScheduledAttempt::Deferred
                    } else {
                        error!(error = %e, attempts = pending.attempts, "Scheduled capture abandoned");
                        metrics::counter!("capture_failures_total").increment(1);
                        ScheduledAttempt::Abandoned
                    }
                }
            };
            report.scheduled = Some(attempt);
        }

        // 2. Stream sessions, one step each
        for session in &mut self.sessions {
            let request = CaptureRequest::new(CaptureKind::Streamed {
                session: session.id(),
            });
            match session.step(&mut self.source, &self.codec) {
                StepOutcome::Sent => report.frames_sent += 1,
                StepOutcome::Closed(_) => report.sessions_closed += 1,
                _ => {}
            }
            trace!(
                kind = request.kind.label(),
                session = %session.id(),
                elapsed = ?request.requested_at.elapsed(),
                "Session stepped"
            );
        }
        self.sessions.retain(|s| !s.is_closed());

        // 3. At most one on-demand capture
        if let Some(mut pending) = self.on_demand.pop_front() {
            match self.serve(&pending) {
                Err(e)
                    if e.is_retryable()
                        && pending.attempts + 1 < self.settings.max_capture_attempts =>
                {
                    pending.attempts += 1;
                    debug!(error = %e, attempt = pending.attempts, "On-demand capture deferred");
                    self.on_demand.push_front(pending);
                }
                result => {
                    if let Err(e) = &result {
                        warn!(error = %e, "On-demand capture failed");
                        metrics::counter!("capture_failures_total").increment(1);
                    }
                    debug!(
                        waited = ?pending.request.requested_at.elapsed(),
                        "On-demand capture served"
                    );
                    if let Some(reply) = pending.reply.take() {
                        let _ = reply.send(result);
                    }
                    report.on_demand_served += 1;
                }
            }
        }

        report
    }

    /// Poll until shut down or every handle is dropped
    pub fn run(mut self) {
        info!(
            pool_size = self.source.pool_size(),
            poll_interval = ?self.settings.poll_interval,
            "Capture loop started"
        );

        while !self.shutdown {
            self.poll();
            if self.commands.is_disconnected() && self.commands.is_empty() {
                info!("All handles dropped");
                break;
            }
            thread::sleep(self.settings.poll_interval);
        }

        self.close_all();
        info!("Capture loop stopped");
    }

    /// Close every session and fail every queued capture
    pub fn close_all(&mut self) {
        for session in &mut self.sessions {
            session.close(&mut self.source, CloseReason::Shutdown);
        }
        self.sessions.clear();

        for mut pending in self.on_demand.drain(..) {
            if let Some(reply) = pending.reply.take() {
                let _ = reply.send(Err(CaptureError::Unavailable));
            }
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::OpenStream(transport) => {
                    let id = self.allocate_consumer();
                    debug!(session = %id, "Stream session opened");
                    self.sessions.push(StreamSession::new(
                        id,
                        transport,
                        self.settings.stream.clone(),
                    ));
                }
                Command::Capture { flash, reply } => {
                    info!(flash, "Manual capture requested");
                    self.on_demand.push_back(Pending::on_demand(flash, reply));
                }
                Command::Shutdown => {
                    info!("Shutdown requested");
                    self.shutdown = true;
                }
            }
        }
    }

    fn serve(&mut self, pending: &Pending) -> Result<String, CaptureError> {
        self.capture_and_store(pending.flash, pending.request.kind.label())
    }

    /// acquire -> normalize -> store -> release. The frame is released on
    /// every path before returning.
    fn capture_and_store(&mut self, flash: bool, hint: &str) -> Result<String, CaptureError> {
        let consumer = self.allocate_consumer();

        let frame = if flash {
            let FlashSettings {
                stabilization,
                trailing,
                ..
            } = self.settings.flash;
            self.source.with_flash(consumer, stabilization, trailing)?
        } else {
            self.source.acquire(consumer)?
        };

        let stored = self
            .source
            .convert(&frame, &self.codec, self.settings.still_quality)
            .map_err(CaptureError::from)
            .and_then(|encoded| self.store.store(&encoded, hint).map_err(CaptureError::from));
        let stored = settle(stored, self.source.release(frame));

        if stored.is_ok() {
            metrics::counter!("captures_total").increment(1);
        }
        stored
    }

    fn allocate_consumer(&mut self) -> ConsumerId {
        let id = ConsumerId(self.next_consumer);
        self.next_consumer += 1;
        id
    }
}

/// Combine the capture outcome with the release of its frame. A file that
/// already reached storage is reported as saved even if the release is
/// rejected; the rejection is only surfaced when nothing was stored.
fn settle(
    stored: Result<String, CaptureError>,
    released: Result<(), ReleaseError>,
) -> Result<String, CaptureError> {
    match (stored, released) {
        (stored, Ok(())) => stored,
        (Ok(name), Err(e)) => {
            error!(file = %name, error = %e, "Frame release rejected after save");
            Ok(name)
        }
        (Err(e), Err(release)) => {
            error!(error = %release, "Frame release rejected after failed capture");
            Err(e)
        }
    }
}
