//! Registry & Dispatcher (C10): a path -> procedure-record map with exact
//! dotted-path lookup, `replace`-gated re-registration, and tagged-variant
//! dispatch between native handlers and aggregations (spec §4.10).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::aggregation::interpreter::{self, ExecutionContext, ProcedureDispatcher};
use crate::aggregation::model::AggregationValue;
use crate::error::{FleetError, Result};

/// Circular procedure refs aren't detected structurally (spec §4.10); this
/// bounds the blast radius the way `AggregationTooDeep` bounds aggregation
/// nesting.
pub const MAX_CALL_DEPTH: usize = 256;

pub type NativeHandler =
    Arc<dyn Fn(CallHandle, Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

pub enum ProcedureBody {
    Native(NativeHandler),
    Aggregation(AggregationValue),
}

pub struct ProcedureRecord {
    pub path: Vec<String>,
    pub body: ProcedureBody,
    pub metadata: BTreeMap<String, Value>,
}

/// The recursive `call(path, input)` handle a native handler receives, so it
/// can invoke other registered procedures without reaching back into a
/// global (spec §4.10).
#[derive(Clone)]
pub struct CallHandle {
    registry: Arc<Registry>,
    depth: usize,
}

impl CallHandle {
    pub async fn call(&self, path: &[String], input: Value) -> Result<Value> {
        dispatch(self.registry.clone(), path.to_vec(), input, self.depth).await
    }
}

#[async_trait]
impl ProcedureDispatcher for CallHandle {
    async fn call(&self, path: &[String], input: Value) -> Result<Value> {
        CallHandle::call(self, path, input).await
    }
}

#[derive(Default)]
pub struct Registry {
    procedures: RwLock<HashMap<Vec<String>, Arc<ProcedureRecord>>>,
}

impl Registry {
    pub fn new() -> Arc<Registry> {
        Arc::new(Registry {
            procedures: RwLock::new(HashMap::new()),
        })
    }

    /// Register a procedure at `path`. Fails unless `replace` is set and a
    /// record already exists there (spec §3 "immutable unless replace").
    pub fn register(
        &self,
        path: Vec<String>,
        body: ProcedureBody,
        metadata: BTreeMap<String, Value>,
        replace: bool,
    ) -> Result<()> {
        let mut procedures = self.procedures.write().unwrap();
        if procedures.contains_key(&path) && !replace {
            return Err(FleetError::Other(anyhow::anyhow!(
                "procedure {path:?} is already registered; pass replace=true to overwrite"
            )));
        }
        procedures.insert(
            path.clone(),
            Arc::new(ProcedureRecord {
                path,
                body,
                metadata,
            }),
        );
        Ok(())
    }

    pub fn is_registered(&self, path: &[String]) -> bool {
        self.procedures.read().unwrap().contains_key(path)
    }

    /// Exact dotted-path lookup and dispatch — no prefix matching (spec §4.10).
    pub async fn call(self: Arc<Self>, path: &[String], input: Value) -> Result<Value> {
        dispatch(self, path.to_vec(), input, 0).await
    }
}

#[async_trait]
impl ProcedureDispatcher for Arc<Registry> {
    async fn call(&self, path: &[String], input: Value) -> Result<Value> {
        Registry::call(self.clone(), path, input).await
    }
}

fn dispatch(
    registry: Arc<Registry>,
    path: Vec<String>,
    input: Value,
    depth: usize,
) -> BoxFuture<'static, Result<Value>> {
    Box::pin(async move {
        if depth > MAX_CALL_DEPTH {
            return Err(FleetError::Other(anyhow::anyhow!(
                "procedure call recursion exceeded {MAX_CALL_DEPTH} levels (possible circular procedure reference at {path:?})"
            )));
        }

        let record = {
            let procedures = registry.procedures.read().unwrap();
            procedures.get(&path).cloned()
        }
        .ok_or_else(|| FleetError::ProcedureNotFound(path.clone()))?;

        let handle = CallHandle {
            registry: registry.clone(),
            depth: depth + 1,
        };

        match &record.body {
            ProcedureBody::Native(handler) => handler(handle, input).await,
            ProcedureBody::Aggregation(aggregation) => {
                let ctx = ExecutionContext::new();
                ctx.bind("input", input);
                interpreter::evaluate(aggregation, &ctx, &handle, 0).await
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(segments: &[&str]) -> Vec<String> {
        segments.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn dispatches_native_handler_by_exact_path() {
        let registry = Registry::new();
        registry
            .register(
                path(&["fs", "exists"]),
                ProcedureBody::Native(Arc::new(|_handle, input| {
                    Box::pin(async move { Ok(Value::Bool(input.is_null())) })
                })),
                BTreeMap::new(),
                false,
            )
            .unwrap();

        let result = registry.clone().call(&path(&["fs", "exists"]), Value::Null).await.unwrap();
        assert_eq!(result, Value::Bool(true));
    }

    #[tokio::test]
    async fn unregistered_path_is_procedure_not_found() {
        let registry = Registry::new();
        let err = registry
            .clone()
            .call(&path(&["nope"]), Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::ProcedureNotFound(_)));
    }

    #[tokio::test]
    async fn re_registering_without_replace_fails() {
        let registry = Registry::new();
        let handler: NativeHandler = Arc::new(|_h, _i| Box::pin(async { Ok(Value::Null) }));
        registry
            .register(path(&["a"]), ProcedureBody::Native(handler.clone()), BTreeMap::new(), false)
            .unwrap();
        let err = registry
            .register(path(&["a"]), ProcedureBody::Native(handler.clone()), BTreeMap::new(), false)
            .unwrap_err();
        assert!(matches!(err, FleetError::Other(_)));

        registry
            .register(path(&["a"]), ProcedureBody::Native(handler), BTreeMap::new(), true)
            .unwrap();
    }

    #[tokio::test]
    async fn native_handler_can_recursively_call_other_procedures() {
        let registry = Registry::new();
        registry
            .register(
                path(&["leaf"]),
                ProcedureBody::Native(Arc::new(|_h, _input| {
                    Box::pin(async move { Ok(Value::String("leaf-result".to_string())) })
                })),
                BTreeMap::new(),
                false,
            )
            .unwrap();
        registry
            .register(
                path(&["root"]),
                ProcedureBody::Native(Arc::new(|handle, input| {
                    Box::pin(async move { handle.call(&path(&["leaf"]), input).await })
                })),
                BTreeMap::new(),
                false,
            )
            .unwrap();

        let result = registry.clone().call(&path(&["root"]), Value::Null).await.unwrap();
        assert_eq!(result, Value::String("leaf-result".to_string()));
    }

    #[tokio::test]
    async fn aggregation_procedure_is_interpreted_with_input_bound() {
        use crate::aggregation::model::{reference, step};

        let registry = Registry::new();
        registry
            .register(
                path(&["echo-input"]),
                ProcedureBody::Aggregation(step(&["client", "identity"], reference("input"))),
                BTreeMap::new(),
                false,
            )
            .unwrap();

        let result = registry
            .clone()
            .call(&path(&["echo-input"]), serde_json::json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"x": 1}));
    }

    #[tokio::test]
    async fn circular_procedure_reference_is_bounded_not_infinite() {
        let registry = Registry::new();
        registry
            .register(
                path(&["loopy"]),
                ProcedureBody::Native(Arc::new(|handle, input| {
                    Box::pin(async move { handle.call(&path(&["loopy"]), input).await })
                })),
                BTreeMap::new(),
                false,
            )
            .unwrap();

        let err = registry.clone().call(&path(&["loopy"]), Value::Null).await.unwrap_err();
        assert!(matches!(err, FleetError::Other(_)));
    }
}
