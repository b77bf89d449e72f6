//! Extension Runtime (spec §9): a capability surface user code plugs into,
//! standing in for the source's embedded multi-language script host.
//! Registration only happens through [`RuntimeBuilder`], which is consumed
//! by [`RuntimeBuilder::build`] — once a [`Runtime`] exists there is no way
//! to add another handler, matching "registration API during init only".

pub mod capability;

pub use capability::{InvocationMode, RuntimeCallError, RuntimeContext, RuntimeFunction};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::error::{CoreError, CoreResult};

const DEFAULT_CALL_CEILING: Duration = Duration::from_secs(5);

#[derive(Default)]
pub struct RuntimeBuilder {
    functions: HashMap<String, Arc<dyn RuntimeFunction>>,
    call_ceiling: Option<Duration>,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_call_ceiling(mut self, ceiling: Duration) -> Self {
        self.call_ceiling = Some(ceiling);
        self
    }

    /// Registers a handler under the registration key a matching
    /// [`InvocationMode`] would compute. Re-registering the same key
    /// overwrites the previous handler, mirroring a script host reloading
    /// a module — init is expected to run once, so this is not a runtime
    /// concern in practice.
    pub fn register(mut self, key: impl Into<String>, function: impl RuntimeFunction) -> Self {
        self.functions.insert(key.into(), Arc::new(function));
        self
    }

    pub fn build(self) -> Runtime {
        Runtime {
            functions: self.functions,
            call_ceiling: self.call_ceiling.unwrap_or(DEFAULT_CALL_CEILING),
        }
    }
}

pub struct Runtime {
    functions: HashMap<String, Arc<dyn RuntimeFunction>>,
    call_ceiling: Duration,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.functions.contains_key(key)
    }

    /// Dispatches `mode` to its registered handler under a wall-clock
    /// ceiling, translating failures into the typed error surface (spec
    /// §7: RPCs not found become `RuntimeFunctionNotFound`, a handler that
    /// runs long becomes `RuntimeFunctionException` with no status, and a
    /// handler that returns an error keeps its message and status).
    pub async fn invoke(&self, ctx: RuntimeContext, mode: InvocationMode) -> CoreResult<serde_json::Value> {
        let key = mode.registration_key();
        let function = self
            .functions
            .get(&key)
            .ok_or_else(|| CoreError::RuntimeFunctionNotFound(key.clone()))?
            .clone();
        let payload = mode.payload();

        match tokio::time::timeout(self.call_ceiling, function.call(ctx, payload)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(CoreError::RuntimeFunctionException {
                message: err.message,
                status: err.status,
            }),
            Err(_) => {
                warn!(key, "runtime function exceeded its wall-clock ceiling");
                Err(CoreError::RuntimeFunctionException {
                    message: format!("{key} exceeded the call ceiling"),
                    status: None,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn unregistered_rpc_is_not_found() {
        let runtime = Runtime::builder().build();
        let result = runtime
            .invoke(
                RuntimeContext::default(),
                InvocationMode::Rpc {
                    id: "ping".into(),
                    payload: json!(null),
                },
            )
            .await;
        assert!(matches!(result, Err(CoreError::RuntimeFunctionNotFound(_))));
    }

    #[tokio::test]
    async fn registered_rpc_echoes_payload() {
        let runtime = Runtime::builder()
            .register("rpc:echo", |_ctx: RuntimeContext, payload: serde_json::Value| async move {
                Ok(payload)
            })
            .build();

        let result = runtime
            .invoke(
                RuntimeContext::default(),
                InvocationMode::Rpc {
                    id: "echo".into(),
                    payload: json!({"hello": "world"}),
                },
            )
            .await
            .unwrap();
        assert_eq!(result, json!({"hello": "world"}));
    }

    #[tokio::test]
    async fn handler_error_keeps_message_and_status() {
        let runtime = Runtime::builder()
            .register("rpc:fails", |_ctx: RuntimeContext, _payload: serde_json::Value| async move {
                Err(RuntimeCallError::with_status("bad request", 3))
            })
            .build();

        let result = runtime
            .invoke(
                RuntimeContext::default(),
                InvocationMode::Rpc {
                    id: "fails".into(),
                    payload: json!(null),
                },
            )
            .await;
        match result {
            Err(CoreError::RuntimeFunctionException { message, status }) => {
                assert_eq!(message, "bad request");
                assert_eq!(status, Some(3));
            }
            other => panic!("expected RuntimeFunctionException, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_handler_is_cut_off_by_the_ceiling() {
        let runtime = Runtime::builder()
            .with_call_ceiling(Duration::from_millis(20))
            .register("rpc:slow", |_ctx: RuntimeContext, _payload: serde_json::Value| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!(null))
            })
            .build();

        let result = runtime
            .invoke(
                RuntimeContext::default(),
                InvocationMode::Rpc {
                    id: "slow".into(),
                    payload: json!(null),
                },
            )
            .await;
        assert!(matches!(result, Err(CoreError::RuntimeFunctionException { .. })));
    }
}
