use std::env;
use std::sync::{Mutex, OnceLock};

use parley_cli::commands::{doctor, migrate, tools};
use serde_json::Value;

const OFFLINE: &[(&str, &str)] = &[
    ("PARLEY_DATABASE_URL", "sqlite::memory:"),
    ("PARLEY_BACKENDS_CRM_ENABLED", "false"),
    ("PARLEY_BACKENDS_REPO_HOST_ENABLED", "false"),
    ("PARLEY_BACKENDS_FILESYSTEM_ENABLED", "false"),
];

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(OFFLINE, || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
        assert_eq!(payload["message"], "applied 1 pending migration(s)");
    });
}

#[test]
fn migrate_returns_config_failure_for_non_sqlite_url() {
    with_env(&[("PARLEY_DATABASE_URL", "postgres://localhost/parley")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn doctor_passes_with_backends_disabled() {
    with_env(OFFLINE, || {
        let result = doctor::run(true);
        assert_eq!(result.exit_code, 0, "expected doctor to pass: {}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["overall_status"], "pass");

        let checks = payload["checks"].as_array().cloned().unwrap_or_default();
        let status_of = |name: &str| {
            checks
                .iter()
                .find(|check| check["name"] == name)
                .map(|check| check["status"].clone())
                .unwrap_or(Value::Null)
        };
        assert_eq!(status_of("config_validation"), "pass");
        assert_eq!(status_of("oracle_client"), "pass");
        assert_eq!(status_of("database_connectivity"), "pass");
        assert_eq!(status_of("backend_crm"), "skipped");
        assert_eq!(status_of("backend_repo_host"), "skipped");
        assert_eq!(status_of("backend_filesystem"), "skipped");
    });
}

#[test]
fn doctor_skips_dependent_checks_when_config_invalid() {
    with_env(&[("PARLEY_DATABASE_URL", "postgres://localhost/parley")], || {
        let result = doctor::run(false);
        assert_eq!(result.exit_code, 1);
        assert!(result.output.starts_with("doctor: one or more readiness checks failed"));
        assert!(result.output.contains("- [fail] config_validation"));
        assert!(result.output.contains("- [skip] database_connectivity"));
        assert!(result.output.contains("- [skip] backend_filesystem"));
    });
}

#[test]
fn tools_reports_empty_catalog_when_backends_disabled() {
    with_env(OFFLINE, || {
        let human = tools::run(false);
        assert_eq!(human.exit_code, 0);
        assert_eq!(last_line(&human.output), "Total operations: 0");

        let json = tools::run(true);
        let payload = parse_payload(&json.output);
        assert_eq!(payload["operation_count"], 0);
        assert_eq!(payload["backends"], Value::Array(Vec::new()));
    });
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn last_line(output: &str) -> &str {
    output.lines().last().unwrap_or_default()
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "PARLEY_DATABASE_URL",
        "PARLEY_DATABASE_MAX_CONNECTIONS",
        "PARLEY_DATABASE_TIMEOUT_SECS",
        "PARLEY_LLM_PROVIDER",
        "PARLEY_LLM_API_KEY",
        "PARLEY_LLM_BASE_URL",
        "PARLEY_LLM_MODEL",
        "PARLEY_LLM_TIMEOUT_SECS",
        "PARLEY_LLM_MAX_RETRIES",
        "PARLEY_LLM_TEMPERATURE",
        "PARLEY_ORCHESTRATOR_TOOL_TIMEOUT_SECS",
        "PARLEY_BACKENDS_CRM_ENABLED",
        "PARLEY_BACKENDS_REPO_HOST_ENABLED",
        "PARLEY_BACKENDS_FILESYSTEM_ENABLED",
        "PARLEY_LOGGING_LEVEL",
        "PARLEY_LOGGING_FORMAT",
        "PARLEY_LOG_LEVEL",
        "PARLEY_LOG_FORMAT",
        "OPENAI_API_KEY",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
