//! Coordinator-side scheduling for FleetCI.
//!
//! - `queue`: per-agent priority queues
//! - `registry`: connected agents and their capacity
//! - `dispatcher`: job placement, credential injection and agent reports
//! - `cron`: persisted cron triggers
//! - `runner`: workflow triggers to jobs
//! - `shutdown`: the ordered shutdown pipeline
//! - `orchestrator`: the coordinator object tying these together

pub mod cron;
pub mod dispatcher;
pub mod orchestrator;
pub mod queue;
pub mod registry;
pub mod runner;
pub mod shutdown;

pub use crate::cron::{CronError, CronScheduler, CronTimerInfo, ScheduleReport, parse_timezone};
pub use dispatcher::{CancelOutcome, DispatchError, Dispatcher, SubmitOutcome, SubmitRequest};
pub use orchestrator::{Coordinator, CoordinatorParts};
pub use queue::{JobQueue, QueueError, QueueStats};
pub use registry::{AgentRegistry, AgentSender, AgentSummary};
pub use runner::DispatchRunner;
pub use shutdown::{
    ShutdownCoordinator, ShutdownHook, ShutdownOptions, ShutdownReport, install_shutdown_handler,
};
