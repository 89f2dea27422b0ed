//! Aggregation value tree (C6): the declarative shape that workflows and
//! procedures are written in (spec §3 "Aggregation value", §4.6).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A node of the aggregation tree. `serde(untagged)` mirrors the dynamic
/// JSON shape of spec §3: a value is either a plain JSON literal, a
/// `{ref, invert?}` reference, a `{{...}}` template string (carried as a
/// plain `Literal(String)` and detected at resolution time), or a step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum AggregationValue {
    Step(Box<Step>),
    Reference(Reference),
    Mapping(BTreeMap<String, AggregationValue>),
    Sequence(Vec<AggregationValue>),
    Literal(Value),
}

impl AggregationValue {
    pub fn literal(value: impl Into<Value>) -> Self {
        AggregationValue::Literal(value.into())
    }

    pub fn template(s: impl Into<String>) -> Self {
        AggregationValue::Literal(Value::String(s.into()))
    }

    /// A template string contains at least one `{{...}}` placeholder.
    /// References carry their referent's type untouched; templates always
    /// stringify (spec §9 Open Question 3).
    pub fn as_template(&self) -> Option<&str> {
        match self {
            AggregationValue::Literal(Value::String(s)) if s.contains("{{") => Some(s.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reference {
    #[serde(rename = "ref")]
    pub ref_: String,
    #[serde(default)]
    pub invert: bool,
}

/// Scheduling tag on a step (spec §4.7). Only `immediate` is evaluated
/// eagerly by this interpreter; `parent`/`never` are accepted but only
/// `dag.traverse`-style built-ins may special-case them (spec §9 Open
/// Question 2: this implementation provides `immediate` only, and lets
/// `dag.traverse` take a procedure path directly rather than a deferred step).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum When {
    #[default]
    Immediate,
    Parent,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    /// Dotted/segmented procedure path, e.g. `["client", "chain"]` or
    /// `["pnpm", "install"]`.
    pub proc: Vec<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_input")]
    pub input: AggregationValue,
    #[serde(default)]
    pub when: When,
}

fn default_input() -> AggregationValue {
    AggregationValue::Literal(Value::Null)
}

impl Step {
    pub fn new(proc: &[&str], input: AggregationValue) -> Self {
        Step {
            proc: proc.iter().map(|s| s.to_string()).collect(),
            name: None,
            input,
            when: When::Immediate,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn when(mut self, when: When) -> Self {
        self.when = when;
        self
    }

    pub fn proc_path(&self) -> String {
        self.proc.join(".")
    }
}

/// Helper for building a step as an [`AggregationValue`] inline.
pub fn step(proc: &[&str], input: AggregationValue) -> AggregationValue {
    AggregationValue::Step(Box::new(Step::new(proc, input)))
}

pub fn reference(path: impl Into<String>) -> AggregationValue {
    AggregationValue::Reference(Reference {
        ref_: path.into(),
        invert: false,
    })
}

pub fn inverted_reference(path: impl Into<String>) -> AggregationValue {
    AggregationValue::Reference(Reference {
        ref_: path.into(),
        invert: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_with_proc_key_parses_as_nested_step_not_descended_mapping() {
        let json = serde_json::json!({
            "proc": ["client", "identity"],
            "input": {"ok": true}
        });
        let value: AggregationValue = serde_json::from_value(json).unwrap();
        assert!(matches!(value, AggregationValue::Step(_)));
    }

    #[test]
    fn reference_round_trips() {
        let json = serde_json::json!({"ref": "install.success", "invert": true});
        let value: AggregationValue = serde_json::from_value(json).unwrap();
        match value {
            AggregationValue::Reference(r) => {
                assert_eq!(r.ref_, "install.success");
                assert!(r.invert);
            }
            other => panic!("expected Reference, got {other:?}"),
        }
    }

    #[test]
    fn template_detection_requires_braces() {
        let plain = AggregationValue::template("hello");
        let templated = AggregationValue::template("hello {{name}}");
        assert!(plain.as_template().is_none());
        assert!(templated.as_template().is_some());
    }
}
