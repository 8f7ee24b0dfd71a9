//! Dependency bookkeeping for the team's task mode.

use std::collections::{BTreeMap, HashMap, HashSet};

use ensemble_core::error::{EnsembleError, Result};
use ensemble_core::run::StepOutput;

use super::leader::TaskSpec;

/// Reject duplicate ids, unknown members or dependencies, and cycles.
pub fn validate_tasks(tasks: &[TaskSpec], members: &[&str]) -> Result<()> {
    let mut ids = HashSet::new();
    for task in tasks {
        if !ids.insert(task.id.as_str()) {
            return Err(EnsembleError::Validation(format!(
                "duplicate task id '{}'",
                task.id
            )));
        }
        if !members.contains(&task.member_id.as_str()) {
            return Err(EnsembleError::Validation(format!(
                "task '{}' assigned to unknown member '{}'",
                task.id, task.member_id
            )));
        }
    }
    for task in tasks {
        if let Some(dep) = task.depends_on.iter().find(|d| !ids.contains(d.as_str())) {
            return Err(EnsembleError::Validation(format!(
                "task '{}' depends on unknown task '{}'",
                task.id, dep
            )));
        }
    }

    // Kahn's algorithm: anything left unvisited sits on a cycle.
    let deps: HashMap<&str, HashSet<&str>> = tasks
        .iter()
        .map(|t| (t.id.as_str(), t.depends_on.iter().map(String::as_str).collect()))
        .collect();
    let mut indegree: HashMap<&str, usize> =
        deps.iter().map(|(id, d)| (*id, d.len())).collect();
    let mut queue: Vec<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0;
    while let Some(id) = queue.pop() {
        visited += 1;
        for (dependent, _) in deps.iter().filter(|(_, d)| d.contains(id)) {
            if let Some(d) = indegree.get_mut(dependent) {
                *d -= 1;
                if *d == 0 {
                    queue.push(*dependent);
                }
            }
        }
    }
    if visited != tasks.len() {
        return Err(EnsembleError::Validation(
            "task dependencies form a cycle".into(),
        ));
    }
    Ok(())
}

/// Next wave of work given the outputs so far, keyed by task id.
#[derive(Debug, Default, PartialEq)]
pub struct Wave<'a> {
    /// Tasks whose dependencies all succeeded.
    pub ready: Vec<&'a TaskSpec>,
    /// Tasks with a failed dependency, paired with the first such dependency.
    pub blocked: Vec<(&'a TaskSpec, &'a str)>,
}

impl Wave<'_> {
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.blocked.is_empty()
    }
}

pub fn next_wave<'a>(tasks: &'a [TaskSpec], done: &BTreeMap<String, StepOutput>) -> Wave<'a> {
    let mut wave = Wave::default();
    for task in tasks.iter().filter(|t| !done.contains_key(&t.id)) {
        let failed = task
            .depends_on
            .iter()
            .find(|d| done.get(d.as_str()).is_some_and(|o| !o.success));
        if let Some(dep) = failed {
            wave.blocked.push((task, dep.as_str()));
        } else if task.depends_on.iter().all(|d| done.contains_key(d)) {
            wave.ready.push(task);
        }
    }
    wave
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: &[&str]) -> TaskSpec {
        TaskSpec {
            id: id.into(),
            member_id: "m".into(),
            task: format!("do {}", id),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    #[test]
    fn rejects_cycles_and_unknown_refs() {
        assert!(validate_tasks(&[task("a", &["b"]), task("b", &["a"])], &["m"]).is_err());
        assert!(validate_tasks(&[task("a", &["zzz"])], &["m"]).is_err());
        assert!(validate_tasks(&[task("a", &[]), task("a", &[])], &["m"]).is_err());
        assert!(validate_tasks(&[task("a", &[])], &["other"]).is_err());
        assert!(validate_tasks(&[task("a", &[]), task("b", &["a"])], &["m"]).is_ok());
    }

    #[test]
    fn repeated_dependency_is_not_a_cycle() {
        let tasks = vec![task("a", &[]), task("b", &["a", "a"]), task("c", &["b", "a", "b"])];
        assert!(validate_tasks(&tasks, &["m"]).is_ok());
    }

    #[test]
    fn failure_blocks_dependents_only() {
        let tasks = vec![task("a", &[]), task("b", &["a"]), task("c", &[])];
        let mut done = BTreeMap::new();

        let wave = next_wave(&tasks, &done);
        let ready: Vec<&str> = wave.ready.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ready, vec!["a", "c"]);

        done.insert("a".to_string(), StepOutput::failure("boom"));
        done.insert("c".to_string(), StepOutput::success("ok"));
        let wave = next_wave(&tasks, &done);
        assert!(wave.ready.is_empty());
        assert_eq!(wave.blocked.len(), 1);
        assert_eq!(wave.blocked[0].0.id, "b");
        assert_eq!(wave.blocked[0].1, "a");
    }
}
