//! Workflow graphs: node definitions, per-pass scope, and the executor.

pub mod executor;
pub mod node;
pub mod scope;

pub use executor::{Flow, GraphExecutor};
pub use node::{
    ConditionNode, LoopNode, ParallelNode, Predicate, RouterNode, Selection, Selector,
    SequenceNode, Step, WorkflowNode,
};
pub use scope::Scope;
