use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use ensemble_core::error::{EnsembleError, Result};
use ensemble_core::run::{PathSegment, StepPath};

use crate::expr::{Bindings, Expr};
use crate::step::StepExecutor;

/// A leaf: one invocation of a step executor, with its failure policy.
#[derive(Clone)]
pub struct Step {
    pub name: String,
    pub executor: Arc<dyn StepExecutor>,
    /// Extra attempts after a failed one.
    pub max_retries: u32,
    /// Elapsing counts as a failure. `None` falls back to the engine default.
    pub timeout: Option<Duration>,
    /// Errors terminate the run instead of becoming a failed output.
    pub fail_fast: bool,
}

impl Step {
    pub fn new(executor: impl StepExecutor) -> Self {
        Self::from_arc(Arc::new(executor))
    }

    pub fn from_arc(executor: Arc<dyn StepExecutor>) -> Self {
        Self {
            name: executor.name().to_string(),
            executor,
            max_retries: 0,
            timeout: None,
            fail_fast: false,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn fail_fast(mut self) -> Self {
        self.fail_fast = true;
        self
    }
}

type PredicateFn = dyn Fn(&Bindings<'_>) -> bool + Send + Sync;

/// A side-effect-free test over run state.
#[derive(Clone)]
pub enum Predicate {
    Expr(Expr),
    Func(Arc<PredicateFn>),
}

impl Predicate {
    /// Compile an expression predicate; unbound names are rejected here.
    pub fn expr(source: &str) -> Result<Self> {
        Expr::compile(source).map(Self::Expr)
    }

    pub fn func(f: impl Fn(&Bindings<'_>) -> bool + Send + Sync + 'static) -> Self {
        Self::Func(Arc::new(f))
    }

    pub fn evaluate(&self, bindings: &Bindings<'_>) -> Result<bool> {
        match self {
            Self::Expr(expr) => expr.is_true(bindings),
            Self::Func(f) => Ok(f(bindings)),
        }
    }
}

/// What a router selector picked.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// A choice by name.
    Name(String),
    /// A choice by position.
    Index(usize),
    /// Several choices, executed in this order.
    Many(Vec<Selection>),
}

impl From<&str> for Selection {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

type SelectorFn = dyn Fn(&Bindings<'_>) -> Selection + Send + Sync;

/// Picks router choices at run time.
#[derive(Clone)]
pub enum Selector {
    /// Must evaluate to a choice name or a list of names.
    Expr(Expr),
    Func(Arc<SelectorFn>),
}

impl Selector {
    pub fn expr(source: &str) -> Result<Self> {
        Expr::compile(source).map(Self::Expr)
    }

    pub fn func(f: impl Fn(&Bindings<'_>) -> Selection + Send + Sync + 'static) -> Self {
        Self::Func(Arc::new(f))
    }

    pub fn select(&self, bindings: &Bindings<'_>) -> Result<Selection> {
        match self {
            Self::Func(f) => Ok(f(bindings)),
            Self::Expr(expr) => match expr.evaluate(bindings)? {
                serde_json::Value::String(name) => Ok(Selection::Name(name)),
                serde_json::Value::Array(items) => items
                    .into_iter()
                    .map(|item| match item {
                        serde_json::Value::String(name) => Ok(Selection::Name(name)),
                        other => Err(EnsembleError::Expression(format!(
                            "router selector yielded non-name {}",
                            other
                        ))),
                    })
                    .collect::<Result<Vec<_>>>()
                    .map(Selection::Many),
                other => Err(EnsembleError::Expression(format!(
                    "router selector '{}' yielded {}",
                    expr.source(),
                    other
                ))),
            },
        }
    }
}

#[derive(Clone)]
pub struct SequenceNode {
    pub name: String,
    pub children: Vec<WorkflowNode>,
    pub continue_on_error: bool,
}

#[derive(Clone)]
pub struct ParallelNode {
    pub name: String,
    pub children: Vec<WorkflowNode>,
    pub continue_on_error: bool,
}

#[derive(Clone)]
pub struct ConditionNode {
    pub name: String,
    pub predicate: Predicate,
    pub then: Box<WorkflowNode>,
    pub otherwise: Option<Box<WorkflowNode>>,
}

#[derive(Clone)]
pub struct RouterNode {
    pub name: String,
    pub selector: Selector,
    pub choices: Vec<WorkflowNode>,
}

#[derive(Clone)]
pub struct LoopNode {
    pub name: String,
    /// Executed as a sequence on every pass.
    pub body: Vec<WorkflowNode>,
    pub end_condition: Option<Predicate>,
    /// Hard cap, always enforced.
    pub max_iterations: u32,
    pub continue_on_error: bool,
}

/// A node of a workflow graph. The graph is a tree; a loop repeats its body
/// rather than pointing back at it.
#[derive(Clone)]
pub enum WorkflowNode {
    Step(Step),
    Sequence(SequenceNode),
    Parallel(ParallelNode),
    Condition(ConditionNode),
    Router(RouterNode),
    Loop(LoopNode),
}

impl From<Step> for WorkflowNode {
    fn from(step: Step) -> Self {
        Self::Step(step)
    }
}

/// A nested list becomes an implicit sequence named after its members.
impl From<Vec<WorkflowNode>> for WorkflowNode {
    fn from(children: Vec<WorkflowNode>) -> Self {
        let name = children
            .iter()
            .map(|c| c.name())
            .collect::<Vec<_>>()
            .join("+");
        Self::sequence(name, children)
    }
}

impl WorkflowNode {
    pub fn step(executor: impl StepExecutor) -> Self {
        Self::Step(Step::new(executor))
    }

    pub fn sequence(name: impl Into<String>, children: Vec<WorkflowNode>) -> Self {
        Self::Sequence(SequenceNode {
            name: name.into(),
            children,
            continue_on_error: false,
        })
    }

    pub fn parallel(name: impl Into<String>, children: Vec<WorkflowNode>) -> Self {
        Self::Parallel(ParallelNode {
            name: name.into(),
            children,
            continue_on_error: false,
        })
    }

    pub fn condition(
        name: impl Into<String>,
        predicate: Predicate,
        then: impl Into<WorkflowNode>,
        otherwise: Option<WorkflowNode>,
    ) -> Self {
        Self::Condition(ConditionNode {
            name: name.into(),
            predicate,
            then: Box::new(then.into()),
            otherwise: otherwise.map(Box::new),
        })
    }

    pub fn router(name: impl Into<String>, selector: Selector, choices: Vec<WorkflowNode>) -> Self {
        Self::Router(RouterNode {
            name: name.into(),
            selector,
            choices,
        })
    }

    pub fn repeat(
        name: impl Into<String>,
        body: Vec<WorkflowNode>,
        end_condition: Option<Predicate>,
        max_iterations: u32,
    ) -> Self {
        Self::Loop(LoopNode {
            name: name.into(),
            body,
            end_condition,
            max_iterations,
            continue_on_error: false,
        })
    }

    /// Keep going past failed children (Sequence, Parallel and Loop only).
    pub fn continue_on_error(mut self) -> Self {
        match &mut self {
            Self::Sequence(n) => n.continue_on_error = true,
            Self::Parallel(n) => n.continue_on_error = true,
            Self::Loop(n) => n.continue_on_error = true,
            Self::Step(_) | Self::Condition(_) | Self::Router(_) => {}
        }
        self
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Step(s) => &s.name,
            Self::Sequence(n) => &n.name,
            Self::Parallel(n) => &n.name,
            Self::Condition(n) => &n.name,
            Self::Router(n) => &n.name,
            Self::Loop(n) => &n.name,
        }
    }

    /// Check structural rules: loops are bounded, sibling names are unique
    /// where outputs are keyed by them.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Step(_) => Ok(()),
            Self::Sequence(n) => n.children.iter().try_for_each(|c| c.validate()),
            Self::Parallel(n) => {
                unique_names(&n.name, &n.children)?;
                n.children.iter().try_for_each(|c| c.validate())
            }
            Self::Condition(n) => {
                n.then.validate()?;
                match &n.otherwise {
                    Some(o) => o.validate(),
                    None => Ok(()),
                }
            }
            Self::Router(n) => {
                if n.choices.is_empty() {
                    return Err(EnsembleError::Validation(format!(
                        "router '{}' has no choices",
                        n.name
                    )));
                }
                unique_names(&n.name, &n.choices)?;
                n.choices.iter().try_for_each(|c| c.validate())
            }
            Self::Loop(n) => {
                if n.max_iterations == 0 {
                    return Err(EnsembleError::Validation(format!(
                        "loop '{}' needs max_iterations >= 1",
                        n.name
                    )));
                }
                n.body.iter().try_for_each(|c| c.validate())
            }
        }
    }

    /// Whether `path` addresses a node of this graph. Segments past a step
    /// (team members) belong to the step and are accepted.
    pub fn contains_path(&self, path: &StepPath) -> bool {
        self.locate(&path.0)
    }

    fn locate(&self, segments: &[PathSegment]) -> bool {
        let Some((head, rest)) = segments.split_first() else {
            return true;
        };
        match (self, head) {
            (Self::Step(_), PathSegment::Member(_)) => true,
            (Self::Sequence(n), PathSegment::Child(i)) => {
                n.children.get(*i).is_some_and(|c| c.locate(rest))
            }
            (Self::Parallel(n), PathSegment::Child(i)) => {
                n.children.get(*i).is_some_and(|c| c.locate(rest))
            }
            (Self::Condition(n), PathSegment::Branch(b)) => match b.as_str() {
                "then" => n.then.locate(rest),
                "else" => n.otherwise.as_ref().is_some_and(|o| o.locate(rest)),
                _ => false,
            },
            (Self::Router(n), PathSegment::Child(_)) => match rest.split_first() {
                None => true,
                Some((PathSegment::Branch(b), rest)) => n
                    .choices
                    .iter()
                    .find(|c| c.name() == b)
                    .is_some_and(|c| c.locate(rest)),
                Some(_) => false,
            },
            (Self::Loop(n), PathSegment::Iteration(k)) => {
                if *k == 0 || *k > n.max_iterations {
                    return false;
                }
                match rest.split_first() {
                    None => true,
                    Some((PathSegment::Child(i), rest)) => {
                        n.body.get(*i).is_some_and(|c| c.locate(rest))
                    }
                    Some(_) => false,
                }
            }
            _ => false,
        }
    }
}

fn unique_names(parent: &str, children: &[WorkflowNode]) -> Result<()> {
    let mut seen = HashSet::new();
    for child in children {
        if !seen.insert(child.name()) {
            return Err(EnsembleError::Validation(format!(
                "'{}' has two children named '{}'",
                parent,
                child.name()
            )));
        }
    }
    Ok(())
}
