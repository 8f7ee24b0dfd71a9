pub mod config;
pub mod error;
pub mod event;
pub mod requirement;
pub mod run;
pub mod schedule;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{EnsembleError, Result};
pub use event::EventBus;
pub use requirement::{Requirement, RequirementKind, RequirementStatus, RequirementTarget, Resolution};
pub use run::{PathSegment, Run, RunState, StepOutput, StepPath, StepRecord};
pub use schedule::{Schedule, ScheduleRun, ScheduleRunStatus};
pub use types::*;
