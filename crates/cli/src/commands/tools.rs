use std::time::Duration;

use parley_agent::ToolRegistry;
use parley_core::config::{AppConfig, LoadOptions};
use parley_core::Backend;
use parley_mcp::backends_from_config;
use serde::Serialize;

use crate::commands::{async_runtime, CommandResult};

#[derive(Debug, Serialize)]
struct OperationEntry {
    name: String,
    description: String,
}

#[derive(Debug, Serialize)]
struct BackendEntry {
    backend: Backend,
    available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    operations: Vec<OperationEntry>,
}

#[derive(Debug, Serialize)]
struct CatalogReport {
    operation_count: usize,
    backends: Vec<BackendEntry>,
}

pub fn run(json_output: bool) -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "tools",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };
    let runtime = match async_runtime("tools") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let rendered = runtime.block_on(async {
        let backends = backends_from_config(&config);
        let registry = ToolRegistry::discover(
            backends.as_tool_backends(),
            Duration::from_secs(config.orchestrator.tool_timeout_secs),
        )
        .await;
        backends.shutdown().await;
        render(&registry, json_output)
    });

    CommandResult { exit_code: 0, output: rendered }
}

/// Groups the catalog by backend.
pub fn render(registry: &ToolRegistry, json_output: bool) -> String {
    let operations = registry.list_operations();
    let report = CatalogReport {
        operation_count: operations.len(),
        backends: registry
            .availability()
            .iter()
            .map(|status| BackendEntry {
                backend: status.backend,
                available: status.available,
                reason: status.reason.clone(),
                operations: operations
                    .iter()
                    .filter(|operation| operation.backend == status.backend)
                    .map(|operation| OperationEntry {
                        name: operation.name.clone(),
                        description: operation.description.clone(),
                    })
                    .collect(),
            })
            .collect(),
    };

    if json_output {
        return serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            let message = error.to_string().replace('"', "'");
            format!("{{\"operation_count\":0,\"error\":\"{message}\"}}")
        });
    }
    render_human(&report)
}

fn render_human(report: &CatalogReport) -> String {
    let mut lines = Vec::new();
    if report.backends.is_empty() {
        lines.push("no backends are enabled".to_string());
    }

    for entry in &report.backends {
        if entry.available {
            lines.push(format!("{} ({} operations)", entry.backend, entry.operations.len()));
        } else {
            let reason = entry.reason.as_deref().unwrap_or("unknown reason");
            lines.push(format!("{} (unavailable: {reason})", entry.backend));
        }
        for operation in &entry.operations {
            if operation.description.is_empty() {
                lines.push(format!("  - {}", operation.name));
            } else {
                lines.push(format!("  - {}: {}", operation.name, operation.description));
            }
        }
    }

    lines.push(format!("Total operations: {}", report.operation_count));
    lines.join("\n")
}
