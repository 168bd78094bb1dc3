//! Input mappings and branch predicates.
//!
//! Both operate on a read-only view of a run: its initial input (`input.*`), the
//! outputs of completed steps (`steps.<id>.*`) and, inside a fan-out, the current
//! element (`item.*`) and its position (`index`). Paths are dotted; numeric segments
//! index into arrays.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// How a step's input is derived
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum InputMapping {
    /// The run's initial input, unchanged
    #[default]
    Initial,
    /// The output of an earlier step, unchanged
    Step {
        /// Source step id
        step: String,
    },
    /// The current fan-out element, unchanged
    Item,
    /// A JSON template whose `{{path}}` placeholders are filled from the context.
    /// A string that is exactly one placeholder takes the referenced value as is;
    /// placeholders inside longer strings are interpolated as text.
    Template {
        /// Template document
        template: Value,
    },
}

impl InputMapping {
    /// Build the step input from `ctx`
    pub fn build(&self, ctx: &MappingContext<'_>) -> Result<Value, String> {
        match self {
            InputMapping::Initial => Ok(ctx.input.clone()),
            InputMapping::Step { step } => ctx
                .outputs
                .get(step)
                .cloned()
                .ok_or_else(|| format!("step '{}' has no output yet", step)),
            InputMapping::Item => ctx
                .item
                .map(|(_, item)| item.clone())
                .ok_or_else(|| "no fan-out element in scope".to_string()),
            InputMapping::Template { template } => render(template, ctx),
        }
    }

    /// Every context path the mapping reads
    pub fn paths(&self) -> Vec<String> {
        match self {
            InputMapping::Initial => vec!["input".to_string()],
            InputMapping::Step { step } => vec![format!("steps.{}", step)],
            InputMapping::Item => vec!["item".to_string()],
            InputMapping::Template { template } => {
                let mut paths = Vec::new();
                collect_placeholders(template, &mut paths);
                paths
            }
        }
    }
}

/// Read-only view of a run used by mappings and predicates
#[derive(Debug, Clone, Copy)]
pub struct MappingContext<'a> {
    /// Initial input of the run
    pub input: &'a Value,

    /// Outputs of completed steps
    pub outputs: &'a HashMap<String, Value>,

    /// Current fan-out element and its index
    pub item: Option<(usize, &'a Value)>,
}

impl<'a> MappingContext<'a> {
    /// Context without a fan-out element
    pub fn new(input: &'a Value, outputs: &'a HashMap<String, Value>) -> Self {
        Self {
            input,
            outputs,
            item: None,
        }
    }

    /// Same context with a fan-out element in scope
    pub fn with_item(self, index: usize, item: &'a Value) -> Self {
        Self {
            item: Some((index, item)),
            ..self
        }
    }

    /// Value at a dotted path, if present
    pub fn resolve(&self, path: &str) -> Option<Value> {
        let mut segments = path.trim().split('.');
        match segments.next()? {
            "input" => descend(self.input, segments).cloned(),
            "steps" => {
                let step = segments.next()?;
                descend(self.outputs.get(step)?, segments).cloned()
            }
            "item" => descend(self.item?.1, segments).cloned(),
            "index" => {
                if segments.next().is_some() {
                    return None;
                }
                self.item.map(|(index, _)| Value::from(index))
            }
            _ => None,
        }
    }
}

fn descend<'v, 's>(mut value: &'v Value, segments: impl Iterator<Item = &'s str>) -> Option<&'v Value> {
    for segment in segments {
        value = match value {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(value)
}

fn render(template: &Value, ctx: &MappingContext<'_>) -> Result<Value, String> {
    match template {
        Value::String(text) => render_string(text, ctx),
        Value::Array(items) => items
            .iter()
            .map(|item| render(item, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut rendered = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                rendered.insert(key.clone(), render(value, ctx)?);
            }
            Ok(Value::Object(rendered))
        }
        other => Ok(other.clone()),
    }
}

fn render_string(text: &str, ctx: &MappingContext<'_>) -> Result<Value, String> {
    let trimmed = text.trim();
    if let Some(path) = whole_placeholder(trimmed) {
        return ctx
            .resolve(path)
            .ok_or_else(|| format!("unresolved reference '{}'", path));
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        let path = rest[start + 2..start + 2 + len].trim();
        let value = ctx
            .resolve(path)
            .ok_or_else(|| format!("unresolved reference '{}'", path))?;
        out.push_str(&rest[..start]);
        match value {
            Value::String(s) => out.push_str(&s),
            Value::Null => {}
            other => out.push_str(&other.to_string()),
        }
        rest = &rest[start + 2 + len + 2..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

fn whole_placeholder(text: &str) -> Option<&str> {
    let inner = text.strip_prefix("{{")?.strip_suffix("}}")?;
    (!inner.contains("{{") && !inner.contains("}}")).then(|| inner.trim())
}

fn collect_placeholders(template: &Value, paths: &mut Vec<String>) {
    match template {
        Value::String(text) => {
            let mut rest = text.as_str();
            while let Some(start) = rest.find("{{") {
                let Some(len) = rest[start + 2..].find("}}") else {
                    break;
                };
                paths.push(rest[start + 2..start + 2 + len].trim().to_string());
                rest = &rest[start + 2 + len + 2..];
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect_placeholders(item, paths)),
        Value::Object(map) => map.values().for_each(|value| collect_placeholders(value, paths)),
        _ => {}
    }
}

/// Condition evaluated by a branch transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BranchPredicate {
    /// The path resolves to any value
    Exists {
        /// Context path
        path: String,
    },
    /// The path resolves to a value other than null, false, 0, "" or an empty collection
    Truthy {
        /// Context path
        path: String,
    },
    /// The path resolves to exactly `value`
    Equals {
        /// Context path
        path: String,
        /// Expected value
        value: Value,
    },
    /// The path resolves to a number greater than `value`
    GreaterThan {
        /// Context path
        path: String,
        /// Threshold
        value: f64,
    },
    /// The path resolves to a number less than `value`
    LessThan {
        /// Context path
        path: String,
        /// Threshold
        value: f64,
    },
    /// Negation
    Not {
        /// Negated predicate
        predicate: Box<BranchPredicate>,
    },
    /// Every predicate holds
    All {
        /// Conjuncts
        predicates: Vec<BranchPredicate>,
    },
    /// At least one predicate holds
    Any {
        /// Disjuncts
        predicates: Vec<BranchPredicate>,
    },
}

impl BranchPredicate {
    /// Evaluate against `ctx`; unresolved paths count as absent
    pub fn evaluate(&self, ctx: &MappingContext<'_>) -> bool {
        match self {
            BranchPredicate::Exists { path } => ctx.resolve(path).is_some(),
            BranchPredicate::Truthy { path } => ctx.resolve(path).map_or(false, |v| truthy(&v)),
            BranchPredicate::Equals { path, value } => ctx.resolve(path).as_ref() == Some(value),
            BranchPredicate::GreaterThan { path, value } => ctx
                .resolve(path)
                .and_then(|v| v.as_f64())
                .map_or(false, |n| n > *value),
            BranchPredicate::LessThan { path, value } => ctx
                .resolve(path)
                .and_then(|v| v.as_f64())
                .map_or(false, |n| n < *value),
            BranchPredicate::Not { predicate } => !predicate.evaluate(ctx),
            BranchPredicate::All { predicates } => predicates.iter().all(|p| p.evaluate(ctx)),
            BranchPredicate::Any { predicates } => predicates.iter().any(|p| p.evaluate(ctx)),
        }
    }

    /// Every context path the predicate reads
    pub fn paths(&self) -> Vec<&str> {
        match self {
            BranchPredicate::Exists { path }
            | BranchPredicate::Truthy { path }
            | BranchPredicate::Equals { path, .. }
            | BranchPredicate::GreaterThan { path, .. }
            | BranchPredicate::LessThan { path, .. } => vec![path.as_str()],
            BranchPredicate::Not { predicate } => predicate.paths(),
            BranchPredicate::All { predicates } | BranchPredicate::Any { predicates } => {
                predicates.iter().flat_map(|p| p.paths()).collect()
            }
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Step id referenced by a `steps.<id>...` path
pub fn referenced_step(path: &str) -> Option<&str> {
    let mut segments = path.trim().split('.');
    match (segments.next(), segments.next()) {
        (Some("steps"), Some(step)) => Some(step),
        _ => None,
    }
}
