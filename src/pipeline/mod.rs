pub mod orchestrator;
pub mod scheduler;
pub mod session;

pub use orchestrator::{
    CaptureKind, CaptureOrchestrator, CaptureRequest, Command, FlashSettings,
    OrchestratorHandle, OrchestratorSettings, PollReport, ScheduledAttempt,
};
pub use scheduler::{CaptureScheduler, ClockReading, ScheduleState, SystemClock, Tick, WallClock};
pub use session::{
    part_header, response_head, CloseReason, SessionState, StepOutcome, StreamSession,
    StreamSettings, Transport,
};
