//! Core agent logic.
//!
//! The agent runtime orchestrates:
//! - Platform connections, at most one live per agent
//! - Jittered, resumable schedules for each posting mode
//! - Per-user interaction throttling
//! - Novelty checks against recently published posts
//! - Chat turns for platforms that push messages

mod chat;
mod connection;
mod novelty;
mod orchestrator;
mod runtime;
mod schedule;
mod throttle;

pub use chat::ChatResponder;
pub use connection::{
    ConnectionLifecycle, ConnectionRegistry, ConnectionStatus, StartOutcome, StopOutcome,
};
pub use novelty::{AcceptAll, EmbeddingSimilarity, NoveltyGuard, SimilarityCheck};
pub use orchestrator::{AgentDeps, AgentOrchestrator, Mode, TickOutcome, format_time_remaining};
pub use runtime::{AgentRuntime, AgentStatus, ModeStatus, StopReport};
pub use schedule::{
    JitterSource, ResumableScheduler, ResumePoint, ScheduleBounds, ScheduleDone,
    ScheduleHandle, ThreadRngJitter,
};
pub use throttle::InteractionThrottle;
