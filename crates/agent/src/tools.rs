use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jsonschema::{JSONSchema, ValidationError};
use parley_core::{Backend, ToolError, ToolInvocation, ToolOperation, ToolResult};
use serde_json::{Map, Value};
use tracing::{info, warn};

const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// A connected system exposing a discoverable catalog of operations.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    fn backend(&self) -> Backend;

    fn discovery_timeout(&self) -> Duration {
        DEFAULT_DISCOVERY_TIMEOUT
    }

    async fn discover(&self) -> Result<Vec<ToolOperation>, ToolError>;

    async fn invoke(&self, invocation: &ToolInvocation) -> Result<ToolResult, ToolError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendStatus {
    pub backend: Backend,
    pub available: bool,
    pub operation_count: usize,
    pub reason: Option<String>,
}

/// Operation catalog built once at startup; reads never lock.
pub struct ToolRegistry {
    operations: Arc<[ToolOperation]>,
    index: HashMap<String, usize>,
    /// Argument schemas compiled at discovery, keyed by operation name.
    validators: HashMap<String, JSONSchema>,
    backends: HashMap<Backend, Arc<dyn ToolBackend>>,
    status: Vec<BackendStatus>,
    invoke_timeout: Duration,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::empty(Duration::from_secs(30))
    }
}

impl ToolRegistry {
    pub fn empty(invoke_timeout: Duration) -> Self {
        Self {
            operations: Arc::from(Vec::new()),
            index: HashMap::new(),
            validators: HashMap::new(),
            backends: HashMap::new(),
            status: Vec::new(),
            invoke_timeout,
        }
    }

    /// Queries every backend for its catalog. Failures mark the backend
    /// unavailable and drop its operations; they never abort startup.
    pub async fn discover(backends: Vec<Arc<dyn ToolBackend>>, invoke_timeout: Duration) -> Self {
        let mut operations = Vec::new();
        let mut index = HashMap::new();
        let mut validators = HashMap::new();
        let mut reachable = HashMap::new();
        let mut status = BTreeMap::new();

        for backend in backends {
            let kind = backend.backend();
            let outcome =
                match tokio::time::timeout(backend.discovery_timeout(), backend.discover()).await {
                    Ok(result) => result,
                    Err(_) => Err(ToolError::BackendUnavailable {
                        backend: kind,
                        reason: format!(
                            "discovery timed out after {}s",
                            backend.discovery_timeout().as_secs()
                        ),
                    }),
                };

            match outcome {
                Ok(discovered) => {
                    let mut added = 0;
                    for operation in discovered {
                        if index.contains_key(&operation.name) {
                            warn!(
                                event_name = "registry.operation.duplicate",
                                backend = %kind,
                                operation = %operation.name,
                                "operation name already registered; keeping the first"
                            );
                            continue;
                        }
                        let validator = match compile_schema(&operation.argument_schema) {
                            Ok(validator) => validator,
                            Err(reason) => {
                                warn!(
                                    event_name = "registry.operation.invalid_schema",
                                    backend = %kind,
                                    operation = %operation.name,
                                    reason = %reason,
                                    "argument schema does not compile; operation excluded"
                                );
                                continue;
                            }
                        };
                        validators.insert(operation.name.clone(), validator);
                        index.insert(operation.name.clone(), operations.len());
                        operations.push(ToolOperation { backend: kind, ..operation });
                        added += 1;
                    }
                    info!(
                        event_name = "registry.backend.ready",
                        backend = %kind,
                        operation_count = added,
                        "backend catalog discovered"
                    );
                    reachable.insert(kind, backend);
                    status.insert(
                        kind,
                        BackendStatus {
                            backend: kind,
                            available: true,
                            operation_count: added,
                            reason: None,
                        },
                    );
                }
                Err(error) => {
                    warn!(
                        event_name = "registry.backend.unavailable",
                        backend = %kind,
                        error_class = error.class(),
                        error = %error,
                        "backend discovery failed; its operations are excluded"
                    );
                    status.insert(
                        kind,
                        BackendStatus {
                            backend: kind,
                            available: false,
                            operation_count: 0,
                            reason: Some(error.to_string()),
                        },
                    );
                }
            }
        }

        Self {
            operations: Arc::from(operations),
            index,
            validators,
            backends: reachable,
            status: status.into_values().collect(),
            invoke_timeout,
        }
    }

    pub fn list_operations(&self) -> Arc<[ToolOperation]> {
        Arc::clone(&self.operations)
    }

    pub fn operation(&self, name: &str) -> Option<&ToolOperation> {
        self.index.get(name).and_then(|position| self.operations.get(*position))
    }

    pub fn availability(&self) -> &[BackendStatus] {
        &self.status
    }

    pub fn is_available(&self, backend: Backend) -> bool {
        self.backends.contains_key(&backend)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Turns an oracle-proposed call into a validated invocation.
    pub fn resolve(&self, name: &str, arguments: Value) -> Result<ToolInvocation, ToolError> {
        let operation = self.operation(name).ok_or_else(|| ToolError::InvalidArguments {
            operation: name.to_owned(),
            reason: "unknown operation".to_owned(),
        })?;

        let arguments = match arguments {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(ToolError::InvalidArguments {
                    operation: name.to_owned(),
                    reason: format!("arguments must be a JSON object, got {other}"),
                });
            }
        };

        self.check_arguments(name, &arguments)?;

        Ok(ToolInvocation { operation: operation.clone(), arguments })
    }

    fn check_arguments(&self, name: &str, arguments: &Map<String, Value>) -> Result<(), ToolError> {
        let Some(validator) = self.validators.get(name) else {
            return Ok(());
        };
        let instance = Value::Object(arguments.clone());
        let reason = match validator.validate(&instance) {
            Ok(()) => return Ok(()),
            Err(errors) => errors.map(|error| describe(&error)).collect::<Vec<_>>().join("; "),
        };
        Err(ToolError::InvalidArguments { operation: name.to_owned(), reason })
    }

    /// Validates then dispatches; a timeout surfaces as a backend error.
    pub async fn invoke(&self, invocation: &ToolInvocation) -> Result<ToolResult, ToolError> {
        let name = invocation.operation.name.as_str();
        let known = self.operation(name).ok_or_else(|| ToolError::InvalidArguments {
            operation: name.to_owned(),
            reason: "unknown operation".to_owned(),
        })?;
        let backend_kind = known.backend;
        self.check_arguments(name, &invocation.arguments)?;

        let backend =
            self.backends.get(&backend_kind).ok_or_else(|| ToolError::BackendUnavailable {
                backend: backend_kind,
                reason: "backend was not reachable at startup".to_owned(),
            })?;

        match tokio::time::timeout(self.invoke_timeout, backend.invoke(invocation)).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::BackendError {
                backend: backend_kind,
                message: format!(
                    "`{name}` timed out after {}s",
                    self.invoke_timeout.as_secs()
                ),
            }),
        }
    }
}

/// A missing schema accepts any argument object.
fn compile_schema(schema: &Value) -> Result<JSONSchema, String> {
    let schema = match schema {
        Value::Null => Value::Object(Map::new()),
        other => other.clone(),
    };
    JSONSchema::compile(&schema).map_err(|error| error.to_string())
}

fn describe(error: &ValidationError<'_>) -> String {
    let path = error.instance_path.to_string();
    if path.is_empty() {
        error.to_string()
    } else {
        format!("`{path}` {error}")
    }
}
