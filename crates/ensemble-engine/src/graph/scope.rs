use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use ensemble_core::requirement::Requirement;
use ensemble_core::run::{Run, StepOutput, StepPath, StepRecord};

use crate::expr::Bindings;

/// Mutable state of one drive pass over a workflow graph.
///
/// Owned by the task driving the run. `Parallel` children each get a
/// [`Scope::fork`] and are merged back at the barrier, so no lock is needed.
#[derive(Debug, Clone)]
pub struct Scope {
    pub input: Value,
    /// Recorded outputs, restored from the run and extended as steps finish.
    pub outputs: Vec<StepRecord>,
    /// Branch choices, router selections and loop progress by path key.
    pub decisions: BTreeMap<String, Value>,
    pub session_state: Map<String, Value>,
    /// States of steps that suspended on the previous pass.
    resume_states: Arc<BTreeMap<String, Value>>,
    /// Requirements resolved for this pass.
    resolved: Arc<Vec<Requirement>>,
    /// States of steps that suspended during this pass.
    pub suspended: BTreeMap<String, Value>,
    /// Session-state keys written since this scope was forked.
    state_writes: Map<String, Value>,
}

impl Scope {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            outputs: Vec::new(),
            decisions: BTreeMap::new(),
            session_state: Map::new(),
            resume_states: Arc::new(BTreeMap::new()),
            resolved: Arc::new(Vec::new()),
            suspended: BTreeMap::new(),
            state_writes: Map::new(),
        }
    }

    /// Restore a pass from a run snapshot plus the requirements just resolved.
    pub fn from_run(run: &Run, resolved: Vec<Requirement>) -> Self {
        Self {
            input: run.input.clone(),
            outputs: run.step_outputs.clone(),
            decisions: run.decisions.clone(),
            session_state: run.session_state.clone(),
            resume_states: Arc::new(run.suspended.clone()),
            resolved: Arc::new(resolved),
            suspended: BTreeMap::new(),
            state_writes: Map::new(),
        }
    }

    /// Copy everything a pass produced back onto the run.
    pub fn write_back(self, run: &mut Run) {
        run.step_outputs = self.outputs;
        run.decisions = self.decisions;
        run.session_state = self.session_state;
        run.suspended = self.suspended;
    }

    pub fn fork(&self) -> Self {
        Self {
            suspended: BTreeMap::new(),
            state_writes: Map::new(),
            ..self.clone()
        }
    }

    /// Fold a forked child back in. `base` is the output count at fork time.
    pub fn merge(&mut self, fork: Scope, base: usize) {
        self.outputs.extend(fork.outputs.into_iter().skip(base));
        self.decisions.extend(fork.decisions);
        self.suspended.extend(fork.suspended);
        for (key, value) in fork.state_writes {
            self.session_state.insert(key.clone(), value.clone());
            self.state_writes.insert(key, value);
        }
    }

    /// Output already recorded at `path`, if this node ran on an earlier pass.
    pub fn recorded(&self, path: &StepPath) -> Option<StepOutput> {
        self.outputs
            .iter()
            .rev()
            .find(|r| r.path == *path)
            .map(|r| r.output.clone())
    }

    pub fn record(&mut self, path: StepPath, name: &str, output: StepOutput) {
        for (key, value) in &output.state_updates {
            self.session_state.insert(key.clone(), value.clone());
            self.state_writes.insert(key.clone(), value.clone());
        }
        self.outputs.push(StepRecord {
            path,
            name: name.to_string(),
            output,
        });
    }

    pub fn resume_state(&self, path: &StepPath) -> Option<&Value> {
        self.resume_states.get(&path.key())
    }

    /// Resolved requirements raised by the step at `path`.
    pub fn resolved_for(&self, path: &StepPath) -> Vec<Requirement> {
        self.resolved
            .iter()
            .filter(|r| r.target.step_path == *path)
            .cloned()
            .collect()
    }

    pub fn bindings<'a>(
        &'a self,
        last: Option<&'a StepOutput>,
        iteration: Option<(u32, u32)>,
        pass: Option<&'a [StepRecord]>,
    ) -> Bindings<'a> {
        Bindings {
            input: &self.input,
            outputs: &self.outputs,
            last,
            state: &self.session_state,
            iteration,
            pass,
        }
    }
}
