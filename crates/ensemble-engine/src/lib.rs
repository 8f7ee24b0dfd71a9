pub mod agent;
pub mod engine;
pub mod expr;
pub mod graph;
pub mod resolver;
pub mod run_log;
pub mod scheduler;
pub mod schedules;
pub mod step;
pub mod team;
pub mod tools;
pub mod trigger;

pub use agent::Agent;
pub use engine::{Engine, FieldSpec, FieldType, InputSchema, Workflow};
pub use expr::{Bindings, Expr};
pub use graph::{
    ConditionNode, Flow, GraphExecutor, LoopNode, ParallelNode, Predicate, RouterNode, Scope,
    Selection, Selector, SequenceNode, Step, WorkflowNode,
};
pub use resolver::{CachedResolver, FnResolver, ResolveContext, Resolver};
pub use run_log::RunLogger;
pub use scheduler::SchedulePoller;
pub use schedules::{
    next_run_after, normalize_cron, parse_timezone, NewSchedule, ScheduleManager, ScheduleZone,
};
pub use step::{EventSink, FnStep, ResumeData, StepContext, StepExecutor, StepInput, StepOutcome};
pub use team::{
    CapabilityLeader, InferenceLeader, MemberProfile, Team, TeamLeader, TeamMember, TeamMode,
};
pub use tools::ToolRegistry;
pub use trigger::{EngineTrigger, HttpTrigger};
