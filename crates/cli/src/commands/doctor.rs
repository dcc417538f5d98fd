use std::time::Duration;

use parley_agent::{OpenAiCompatibleOracle, ToolRegistry};
use parley_core::config::{AppConfig, LoadOptions};
use parley_core::Backend;
use parley_db::{connect_with_settings, migrations};
use parley_mcp::backends_from_config;
use serde::Serialize;

use crate::commands::{async_runtime, CommandResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    details: String,
}

impl DoctorCheck {
    fn new(name: impl Into<String>, status: CheckStatus, details: impl Into<String>) -> Self {
        Self { name: name.into(), status, details: details.into() }
    }
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code = if report.overall_status == CheckStatus::Fail { 1 } else { 0 };

    if json_output {
        let output = serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
        return CommandResult { exit_code, output };
    }

    CommandResult { exit_code, output: render_human(&report) }
}

fn backend_check_name(backend: Backend) -> String {
    format!("backend_{}", backend.config_key())
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck::new(
                "config_validation",
                CheckStatus::Pass,
                "configuration loaded and validated",
            ));
            checks.push(check_oracle_client(&config));
            match async_runtime("doctor") {
                Ok(runtime) => {
                    checks.push(runtime.block_on(check_database(&config)));
                    checks.extend(runtime.block_on(check_backends(&config)));
                }
                Err(_) => checks.push(DoctorCheck::new(
                    "runtime_init",
                    CheckStatus::Fail,
                    "failed to initialize async runtime",
                )),
            }
        }
        Err(error) => {
            checks.push(DoctorCheck::new(
                "config_validation",
                CheckStatus::Fail,
                error.to_string(),
            ));
            let skipped = ["oracle_client".to_string(), "database_connectivity".to_string()]
                .into_iter()
                .chain(Backend::ALL.into_iter().map(backend_check_name));
            for name in skipped {
                checks.push(DoctorCheck::new(
                    name,
                    CheckStatus::Skipped,
                    "skipped because configuration did not load",
                ));
            }
        }
    }

    let any_failed = checks.iter().any(|check| check.status == CheckStatus::Fail);
    let overall_status = if any_failed { CheckStatus::Fail } else { CheckStatus::Pass };
    let summary = if any_failed {
        "doctor: one or more readiness checks failed".to_string()
    } else {
        "doctor: all readiness checks passed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

/// Builds the client only; no request is sent to the endpoint.
fn check_oracle_client(config: &AppConfig) -> DoctorCheck {
    match OpenAiCompatibleOracle::from_config(&config.llm) {
        Ok(_) => DoctorCheck::new(
            "oracle_client",
            CheckStatus::Pass,
            format!("model `{}` at `{}`", config.llm.model, config.llm.endpoint()),
        ),
        Err(error) => DoctorCheck::new("oracle_client", CheckStatus::Fail, error.to_string()),
    }
}

async fn check_database(config: &AppConfig) -> DoctorCheck {
    let pool = match connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    {
        Ok(pool) => pool,
        Err(error) => {
            return DoctorCheck::new(
                "database_connectivity",
                CheckStatus::Fail,
                format!("failed to connect to database: {error}"),
            );
        }
    };

    let pending = migrations::pending_versions(&pool).await;
    pool.close().await;
    match pending {
        Ok(pending) if pending.is_empty() => DoctorCheck::new(
            "database_connectivity",
            CheckStatus::Pass,
            format!("connected using `{}`; schema is current", config.database.url),
        ),
        Ok(pending) => DoctorCheck::new(
            "database_connectivity",
            CheckStatus::Pass,
            format!(
                "connected using `{}`; {} migration(s) pending, run `parley migrate`",
                config.database.url,
                pending.len()
            ),
        ),
        Err(error) => DoctorCheck::new(
            "database_connectivity",
            CheckStatus::Fail,
            format!("could not read migration state: {error}"),
        ),
    }
}

async fn check_backends(config: &AppConfig) -> Vec<DoctorCheck> {
    let backends = backends_from_config(config);
    let registry = ToolRegistry::discover(
        backends.as_tool_backends(),
        Duration::from_secs(config.orchestrator.tool_timeout_secs),
    )
    .await;
    backends.shutdown().await;

    Backend::ALL
        .into_iter()
        .map(|backend| {
            let name = backend_check_name(backend);
            let status = registry.availability().iter().find(|status| status.backend == backend);
            match status {
                None => DoctorCheck::new(name, CheckStatus::Skipped, "disabled in configuration"),
                Some(status) if status.available => DoctorCheck::new(
                    name,
                    CheckStatus::Pass,
                    format!("{} operations discovered", status.operation_count),
                ),
                Some(status) => DoctorCheck::new(
                    name,
                    CheckStatus::Fail,
                    status.reason.clone().unwrap_or_else(|| "discovery failed".to_string()),
                ),
            }
        })
        .collect()
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
