//! Definition registry: validates and stores workflow definitions
//!
//! Definitions are immutable once registered. Lookups hand out `Arc`s so that a run
//! keeps a consistent view of its definition for as long as it executes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};
use tracing::info;

use super::definition::{Transition, WorkflowDefinition};
use super::mapping::referenced_step;
use crate::error::{Error, Result};

/// Registry of workflow definitions, keyed by name
#[derive(Debug, Default)]
pub struct DefinitionRegistry {
    /// Registered definitions
    definitions: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
}

impl DefinitionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a definition.
    ///
    /// A name can only be registered once.
    pub fn register(&self, definition: WorkflowDefinition) -> Result<Arc<WorkflowDefinition>> {
        validate(&definition)?;

        let mut definitions = self
            .definitions
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if definitions.contains_key(&definition.name) {
            return Err(Error::Definition(format!(
                "workflow '{}' is already registered",
                definition.name
            )));
        }

        let name = definition.name.clone();
        let steps = definition.steps.len();
        let definition = Arc::new(definition);
        definitions.insert(name.clone(), definition.clone());

        info!(workflow = %name, steps, "Workflow definition registered");
        Ok(definition)
    }

    /// Get a definition by name
    pub fn get(&self, name: &str) -> Result<Arc<WorkflowDefinition>> {
        self.definitions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| Error::DefinitionNotFound(name.to_string()))
    }

    /// Whether a definition with this name is registered
    pub fn contains(&self, name: &str) -> bool {
        self.definitions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    /// Names of all registered definitions, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .definitions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Number of registered definitions
    pub fn len(&self) -> usize {
        self.definitions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Structural checks run before a definition is accepted
pub fn validate(definition: &WorkflowDefinition) -> Result<()> {
    let fail = |msg: String| Err(Error::Definition(format!("{}: {}", definition.name, msg)));

    if definition.name.trim().is_empty() {
        return Err(Error::Definition("workflow name must not be empty".to_string()));
    }
    if definition.steps.is_empty() {
        return fail("workflow has no steps".to_string());
    }

    let mut index = HashMap::new();
    for (i, step) in definition.steps.iter().enumerate() {
        if step.id.trim().is_empty() {
            return fail("step id must not be empty".to_string());
        }
        if index.insert(step.id.as_str(), i).is_some() {
            return fail(format!("duplicate step id '{}'", step.id));
        }
    }

    // (path, whether the step may read its own output)
    let mut reads: Vec<Vec<(String, bool)>> = Vec::with_capacity(definition.steps.len());
    for step in &definition.steps {
        for target in step.next.targets() {
            if !index.contains_key(target) {
                return fail(format!("step '{}' transitions to unknown step '{}'", step.id, target));
            }
        }

        if let Some(fan_out) = &step.fan_out {
            if fan_out.over.trim().is_empty() {
                return fail(format!("step '{}' fans out over an empty path", step.id));
            }
        }

        let mut paths: Vec<(String, bool)> =
            step.input.paths().into_iter().map(|p| (p, false)).collect();
        if let Some(fan_out) = &step.fan_out {
            paths.push((fan_out.over.clone(), false));
        }
        if let Transition::Branch { when, .. } = &step.next {
            paths.extend(when.paths().into_iter().map(|p| (p.to_string(), true)));
        }

        for (path, _) in &paths {
            let root = path.trim().split('.').next().unwrap_or_default();
            match root {
                "input" => {}
                "steps" => match referenced_step(path) {
                    Some(source) if index.contains_key(source) => {}
                    Some(source) => {
                        return fail(format!(
                            "step '{}' references unknown step '{}'",
                            step.id, source
                        ))
                    }
                    None => return fail(format!("step '{}' has an incomplete path '{}'", step.id, path)),
                },
                "item" | "index" if step.fan_out.is_some() => {}
                "item" | "index" => {
                    return fail(format!(
                        "step '{}' uses '{}' outside a fan-out",
                        step.id, path
                    ))
                }
                _ => return fail(format!("step '{}' has an unknown path '{}'", step.id, path)),
            }
        }
        reads.push(paths);
    }

    let edges = transition_edges(definition, &index);
    check_acyclic(definition, &edges)?;

    let ancestors = ancestors(&edges);
    for (i, step) in definition.steps.iter().enumerate() {
        for (path, own) in &reads[i] {
            let Some(source) = referenced_step(path) else {
                continue;
            };
            let Some(&j) = index.get(source) else {
                continue;
            };
            if (j == i && *own) || ancestors[i].contains(&j) {
                continue;
            }
            return fail(format!(
                "step '{}' reads the output of step '{}', which cannot run before it",
                step.id, source
            ));
        }
    }
    Ok(())
}

/// Successors of every step in the transition graph
fn transition_edges(definition: &WorkflowDefinition, index: &HashMap<&str, usize>) -> Vec<Vec<usize>> {
    let steps = &definition.steps;
    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (i, step) in steps.iter().enumerate() {
        match &step.next {
            Transition::Next if i + 1 < steps.len() => edges[i].push(i + 1),
            Transition::Next | Transition::End => {}
            other => edges[i].extend(other.targets().into_iter().filter_map(|t| index.get(t).copied())),
        }
    }
    edges
}

/// Kahn's algorithm over the transition graph
fn check_acyclic(definition: &WorkflowDefinition, edges: &[Vec<usize>]) -> Result<()> {
    let steps = &definition.steps;
    let mut in_degree = vec![0usize; steps.len()];
    for targets in edges {
        for &t in targets {
            in_degree[t] += 1;
        }
    }

    let mut queue: VecDeque<usize> = (0..steps.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut visited = 0;
    while let Some(node) = queue.pop_front() {
        visited += 1;
        for &t in &edges[node] {
            in_degree[t] -= 1;
            if in_degree[t] == 0 {
                queue.push_back(t);
            }
        }
    }

    if visited != steps.len() {
        let cyclic: Vec<&str> = (0..steps.len())
            .filter(|&i| in_degree[i] > 0)
            .map(|i| steps[i].id.as_str())
            .collect();
        return Err(Error::Definition(format!(
            "{}: step graph contains a cycle through {}",
            definition.name,
            cyclic.join(", ")
        )));
    }
    Ok(())
}

/// Steps from which each step can be reached
fn ancestors(edges: &[Vec<usize>]) -> Vec<HashSet<usize>> {
    let mut predecessors: Vec<Vec<usize>> = vec![Vec::new(); edges.len()];
    for (from, targets) in edges.iter().enumerate() {
        for &to in targets {
            predecessors[to].push(from);
        }
    }

    (0..edges.len())
        .map(|start| {
            let mut seen = HashSet::new();
            let mut stack = predecessors[start].clone();
            while let Some(node) = stack.pop() {
                if seen.insert(node) {
                    stack.extend(&predecessors[node]);
                }
            }
            seen
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityKind;
    use crate::workflow::definition::Step;
    use crate::workflow::mapping::{BranchPredicate, InputMapping};
    use serde_json::json;

    fn two_steps(name: &str) -> WorkflowDefinition {
        WorkflowDefinition::new(name)
            .step(Step::new("copy", ActivityKind::GenerateEmailCopy))
            .step(Step::new("send", ActivityKind::SendEmail).input(InputMapping::Template {
                template: json!({"to": "{{input.email}}", "subject": "{{steps.copy.subject}}"}),
            }))
    }

    fn expect_definition_error(result: Result<Arc<WorkflowDefinition>>, needle: &str) {
        match result {
            Err(Error::Definition(msg)) => assert!(msg.contains(needle), "{}", msg),
            other => panic!("expected definition error, got {:?}", other),
        }
    }

    #[test]
    fn test_register_and_get() {
        let registry = DefinitionRegistry::new();
        registry.register(two_steps("outreach")).unwrap();

        assert!(registry.contains("outreach"));
        assert_eq!(registry.get("outreach").unwrap().steps.len(), 2);
        assert_eq!(registry.names(), vec!["outreach".to_string()]);
        assert!(matches!(registry.get("missing"), Err(Error::DefinitionNotFound(_))));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = DefinitionRegistry::new();
        registry.register(two_steps("outreach")).unwrap();
        expect_definition_error(registry.register(two_steps("outreach")), "already registered");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_empty_definition_rejected() {
        let registry = DefinitionRegistry::new();
        expect_definition_error(registry.register(WorkflowDefinition::new("empty")), "no steps");
    }

    #[test]
    fn test_duplicate_step_ids_rejected() {
        let registry = DefinitionRegistry::new();
        let def = WorkflowDefinition::new("dup")
            .step(Step::new("a", ActivityKind::QualifyLead))
            .step(Step::new("a", ActivityKind::SendEmail));
        expect_definition_error(registry.register(def), "duplicate step id");
    }

    #[test]
    fn test_unknown_references_rejected() {
        let registry = DefinitionRegistry::new();

        let def = WorkflowDefinition::new("goto")
            .step(Step::new("a", ActivityKind::QualifyLead).then(Transition::Goto { step: "zzz".into() }));
        expect_definition_error(registry.register(def), "unknown step 'zzz'");

        let def = WorkflowDefinition::new("mapping").step(
            Step::new("a", ActivityKind::SendEmail)
                .input(InputMapping::Step { step: "ghost".into() }),
        );
        expect_definition_error(registry.register(def), "unknown step 'ghost'");

        let def = WorkflowDefinition::new("item").step(
            Step::new("a", ActivityKind::GenerateSocialPost).input(InputMapping::Item),
        );
        expect_definition_error(registry.register(def), "outside a fan-out");
    }

    #[test]
    fn test_empty_fan_out_path_rejected() {
        let registry = DefinitionRegistry::new();
        let def = WorkflowDefinition::new("fan")
            .step(Step::new("a", ActivityKind::GenerateSocialPost).fan_out(""));
        expect_definition_error(registry.register(def), "empty path");
    }

    #[test]
    fn test_cycle_rejected() {
        let registry = DefinitionRegistry::new();
        let def = WorkflowDefinition::new("loop")
            .step(Step::new("a", ActivityKind::QualifyLead))
            .step(Step::new("b", ActivityKind::GenerateEmailCopy).then(Transition::Branch {
                when: BranchPredicate::Truthy { path: "steps.a.qualified".into() },
                then: "a".into(),
                otherwise: None,
            }));
        expect_definition_error(registry.register(def), "cycle");
        assert!(!registry.contains("loop"));
    }

    #[test]
    fn test_reading_own_output_rejected() {
        let registry = DefinitionRegistry::new();
        let def = WorkflowDefinition::new("own").step(
            Step::new("send", ActivityKind::SendEmail).input(InputMapping::Template {
                template: json!({"to": "{{input.email}}", "subject": "{{steps.send.message_id}}"}),
            }),
        );
        expect_definition_error(registry.register(def), "cannot run before");
    }

    #[test]
    fn test_reading_later_step_rejected() {
        let registry = DefinitionRegistry::new();
        let def = WorkflowDefinition::new("later")
            .step(Step::new("send", ActivityKind::SendEmail).input(InputMapping::Step {
                step: "copy".into(),
            }))
            .step(Step::new("copy", ActivityKind::GenerateEmailCopy));
        expect_definition_error(registry.register(def), "step 'copy', which cannot run before");

        // A sibling branch never runs before the other branch either
        let def = WorkflowDefinition::new("siblings")
            .step(Step::new("score", ActivityKind::QualifyLead).then(Transition::Branch {
                when: BranchPredicate::Truthy { path: "steps.score.qualified".into() },
                then: "copy".into(),
                otherwise: Some("social".into()),
            }))
            .step(Step::new("copy", ActivityKind::GenerateEmailCopy).then(Transition::End))
            .step(Step::new("social", ActivityKind::GenerateSocialPost).input(InputMapping::Step {
                step: "copy".into(),
            }));
        expect_definition_error(registry.register(def), "cannot run before");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_forward_branch_accepted() {
        let registry = DefinitionRegistry::new();
        let def = WorkflowDefinition::new("branchy")
            .step(Step::new("score", ActivityKind::QualifyLead).then(Transition::Branch {
                when: BranchPredicate::Truthy { path: "steps.score.qualified".into() },
                then: "copy".into(),
                otherwise: None,
            }))
            .step(Step::new("copy", ActivityKind::GenerateEmailCopy).then(Transition::End));
        assert!(registry.register(def).is_ok());
    }
}
