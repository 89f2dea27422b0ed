//! Aggregation Interpreter (C7): executes an [`AggregationValue`] tree against
//! an execution context and a procedure dispatcher (spec §4.7, §9).
//!
//! Deeply nested aggregations use this interpreter's own explicit value
//! stack (the `depth` counter threaded through [`evaluate`]) rather than
//! relying on pure language recursion, so nesting is bounded and surfaces
//! [`FleetError::AggregationTooDeep`] instead of overflowing the call stack
//! (spec §9).

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock, Mutex};

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use crate::aggregation::model::{AggregationValue, Step, When};
use crate::error::{FleetError, Result};

/// Aggregations may nest at most this deep before the interpreter refuses to
/// go further (spec §9).
pub const MAX_DEPTH: usize = 256;

static TEMPLATE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}").unwrap());

/// Recursive `call(path, input)` handle every non-control procedure dispatch
/// goes through (spec §4.10's "context handle"). Implemented by the
/// Registry; kept as a trait here so the interpreter doesn't depend on it.
#[async_trait]
pub trait ProcedureDispatcher: Send + Sync {
    async fn call(&self, path: &[String], input: Value) -> Result<Value>;
}

/// A linked chain of binding frames (spec §9 "context-for-reference-resolution
/// modeled as linked chain of mappings"). Normal sequential execution shares
/// one frame; `parallel` and `map` branches get their own frame so sibling
/// mutations never leak into each other (copy only on divergence).
#[derive(Clone)]
pub struct ExecutionContext {
    frame: Arc<Mutex<BTreeMap<String, Value>>>,
    parent: Option<Arc<ExecutionContext>>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        ExecutionContext {
            frame: Arc::new(Mutex::new(BTreeMap::new())),
            parent: None,
        }
    }

    /// A fresh child frame chained onto `self`.
    pub fn branch(&self) -> ExecutionContext {
        ExecutionContext {
            frame: Arc::new(Mutex::new(BTreeMap::new())),
            parent: Some(Arc::new(self.clone())),
        }
    }

    pub fn bind(&self, name: &str, value: Value) {
        self.frame.lock().unwrap().insert(name.to_string(), value);
    }

    /// Dotted-path lookup: the first segment resolves a bound identifier
    /// (walking up the frame chain), remaining segments index into the
    /// resulting JSON value. A missing lookup resolves to `None`
    /// ("unresolved", not an error — spec §3).
    pub fn resolve(&self, path: &str) -> Option<Value> {
        let mut segments = path.split('.');
        let head = segments.next()?;
        let mut value = self.lookup_identifier(head)?;
        for segment in segments {
            value = index_into(&value, segment)?;
        }
        Some(value)
    }

    fn lookup_identifier(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.frame.lock().unwrap().get(name) {
            return Some(value.clone());
        }
        self.parent.as_ref().and_then(|p| p.lookup_identifier(name))
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        ExecutionContext::new()
    }
}

fn index_into(value: &Value, segment: &str) -> Option<Value> {
    match value {
        Value::Object(map) => map.get(segment).cloned(),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i).cloned()),
        _ => None,
    }
}

fn value_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn value_to_plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Substitute every `{{dotted.path}}` placeholder in `template` by resolving
/// it against `ctx`; an unresolved placeholder becomes an empty string
/// (spec §3).
fn substitute_template(template: &str, ctx: &ExecutionContext) -> String {
    TEMPLATE_PATTERN
        .replace_all(template, |caps: &regex::Captures| {
            ctx.resolve(&caps[1])
                .as_ref()
                .map(value_to_plain_string)
                .unwrap_or_default()
        })
        .into_owned()
}

fn as_mapping(value: &AggregationValue) -> Result<&BTreeMap<String, AggregationValue>> {
    match value {
        AggregationValue::Mapping(map) => Ok(map),
        other => Err(FleetError::Other(anyhow::anyhow!(
            "expected a mapping input, got {other:?}"
        ))),
    }
}

fn as_sequence(value: &AggregationValue) -> Result<&[AggregationValue]> {
    match value {
        AggregationValue::Sequence(items) => Ok(items),
        other => Err(FleetError::Other(anyhow::anyhow!(
            "expected a sequence input, got {other:?}"
        ))),
    }
}

/// Evaluate one [`AggregationValue`] node, dispatching `client.*` control
/// operators inline and everything else through `dispatcher` (spec §4.7).
pub async fn evaluate(
    value: &AggregationValue,
    ctx: &ExecutionContext,
    dispatcher: &dyn ProcedureDispatcher,
    depth: usize,
) -> Result<Value> {
    if depth > MAX_DEPTH {
        return Err(FleetError::AggregationTooDeep(MAX_DEPTH));
    }

    match value {
        AggregationValue::Literal(Value::String(s)) if s.contains("{{") => {
            Ok(Value::String(substitute_template(s, ctx)))
        }
        AggregationValue::Literal(v) => Ok(v.clone()),
        AggregationValue::Reference(r) => {
            let resolved = ctx.resolve(&r.ref_).unwrap_or(Value::Null);
            if r.invert {
                Ok(Value::Bool(!value_truthy(&resolved)))
            } else {
                Ok(resolved)
            }
        }
        AggregationValue::Sequence(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(Box::pin(evaluate(item, ctx, dispatcher, depth + 1)).await?);
            }
            Ok(Value::Array(out))
        }
        AggregationValue::Mapping(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(
                    key.clone(),
                    Box::pin(evaluate(item, ctx, dispatcher, depth + 1)).await?,
                );
            }
            Ok(Value::Object(out))
        }
        AggregationValue::Step(step) => evaluate_step(step, ctx, dispatcher, depth).await,
    }
}

async fn evaluate_step(
    step: &Step,
    ctx: &ExecutionContext,
    dispatcher: &dyn ProcedureDispatcher,
    depth: usize,
) -> Result<Value> {
    if step.when != When::Immediate {
        // `parent`/`never` steps are accepted but not evaluated by this
        // interpreter (spec §9 Open Question 2) — pass the step definition
        // through untouched so a `dag.traverse`-style consumer can inspect it.
        return Ok(serde_json::to_value(step)?);
    }

    let result = if step.proc.first().map(String::as_str) == Some("client") {
        evaluate_control_op(step, ctx, dispatcher, depth).await?
    } else {
        let input = Box::pin(evaluate(&step.input, ctx, dispatcher, depth + 1)).await?;
        dispatcher.call(&step.proc, input).await?
    };

    if let Some(name) = &step.name {
        ctx.bind(name, result.clone());
    }
    Ok(result)
}

async fn evaluate_control_op(
    step: &Step,
    ctx: &ExecutionContext,
    dispatcher: &dyn ProcedureDispatcher,
    depth: usize,
) -> Result<Value> {
    match step.proc.get(1).map(String::as_str) {
        Some("identity") => Box::pin(evaluate(&step.input, ctx, dispatcher, depth + 1)).await,

        Some("chain") => {
            let items = as_sequence(&step.input)?;
            let mut last = Value::Null;
            for item in items {
                last = Box::pin(evaluate(item, ctx, dispatcher, depth + 1)).await?;
            }
            Ok(last)
        }

        Some("parallel") => {
            let items = as_sequence(&step.input)?;
            // Each task gets its own branch frame so named-step bindings
            // inside one task never race with or clobber a sibling's.
            let branches: Vec<ExecutionContext> = items.iter().map(|_| ctx.branch()).collect();
            let futures = items
                .iter()
                .zip(branches.iter())
                .map(|(item, branch_ctx)| evaluate(item, branch_ctx, dispatcher, depth + 1));
            let results = futures::future::join_all(futures).await;
            let mut out = Vec::with_capacity(results.len());
            for result in results {
                out.push(result?);
            }
            Ok(Value::Array(out))
        }

        Some("conditional") => {
            let mapping = as_mapping(&step.input)?;
            let condition = mapping.get("condition").ok_or_else(|| {
                FleetError::Other(anyhow::anyhow!("client.conditional requires a condition"))
            })?;
            let condition_value =
                Box::pin(evaluate(condition, ctx, dispatcher, depth + 1)).await?;
            let branch = if value_truthy(&condition_value) {
                mapping.get("then")
            } else {
                mapping.get("else")
            };
            match branch {
                Some(branch) => Box::pin(evaluate(branch, ctx, dispatcher, depth + 1)).await,
                None => Ok(Value::Null),
            }
        }

        Some("tryCatch") => {
            let mapping = as_mapping(&step.input)?;
            let try_value = mapping.get("try").ok_or_else(|| {
                FleetError::Other(anyhow::anyhow!("client.tryCatch requires a try branch"))
            })?;
            match Box::pin(evaluate(try_value, ctx, dispatcher, depth + 1)).await {
                Ok(v) => Ok(v),
                Err(_) => match mapping.get("catch") {
                    Some(catch) => Box::pin(evaluate(catch, ctx, dispatcher, depth + 1)).await,
                    None => Ok(Value::Null),
                },
            }
        }

        Some("map") => {
            let mapping = as_mapping(&step.input)?;
            let items_spec = mapping.get("items").ok_or_else(|| {
                FleetError::Other(anyhow::anyhow!("client.map requires items"))
            })?;
            let mapper = mapping.get("mapper").ok_or_else(|| {
                FleetError::Other(anyhow::anyhow!("client.map requires a mapper"))
            })?;
            let items_value = Box::pin(evaluate(items_spec, ctx, dispatcher, depth + 1)).await?;
            let items = items_value.as_array().ok_or_else(|| {
                FleetError::Other(anyhow::anyhow!("client.map items must evaluate to an array"))
            })?;

            let mut out = Vec::with_capacity(items.len());
            for item in items {
                // `item` is bound in a fresh branch frame; nested `map`s
                // rebinding `item` shadow rather than merge (spec §9 Open
                // Question 4 — nested maps need explicit rebinding).
                let branch_ctx = ctx.branch();
                branch_ctx.bind("item", item.clone());
                out.push(Box::pin(evaluate(mapper, &branch_ctx, dispatcher, depth + 1)).await?);
            }
            Ok(Value::Array(out))
        }

        Some("throw") => {
            let mapping = as_mapping(&step.input)?;
            let message = match mapping.get("message") {
                Some(message) => {
                    let evaluated =
                        Box::pin(evaluate(message, ctx, dispatcher, depth + 1)).await?;
                    value_to_plain_string(&evaluated)
                }
                None => "client.throw".to_string(),
            };
            Err(FleetError::Other(anyhow::anyhow!(message)))
        }

        Some(other) => Err(FleetError::ProcedureNotFound(vec![
            "client".to_string(),
            other.to_string(),
        ])),
        None => Err(FleetError::ProcedureNotFound(vec!["client".to_string()])),
    }
}
