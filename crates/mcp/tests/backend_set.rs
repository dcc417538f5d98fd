use std::time::Duration;

use parley_agent::{ToolBackend, ToolRegistry};
use parley_core::{AppConfig, Backend};

#[test]
fn only_enabled_backends_are_built() {
    let mut config = AppConfig::default();
    config.backends.crm.enabled = false;
    config.backends.repo_host.enabled = false;
    config.backends.filesystem.enabled = true;

    let backends = parley_mcp::backends_from_config(&config);

    assert_eq!(backends.len(), 1);
    let kinds = backends.as_tool_backends().iter().map(|b| b.backend()).collect::<Vec<_>>();
    assert_eq!(kinds, vec![Backend::Filesystem]);
}

#[tokio::test]
async fn unreachable_processes_leave_an_empty_catalog() {
    let mut config = AppConfig::default();
    for backend in [&mut config.backends.crm, &mut config.backends.filesystem] {
        backend.enabled = true;
        backend.command = "/nonexistent/parley-mcp-server".to_string();
        backend.args.clear();
        backend.discovery_timeout_secs = 2;
    }
    config.backends.repo_host.enabled = false;

    let backends = parley_mcp::backends_from_config(&config);
    let registry =
        ToolRegistry::discover(backends.as_tool_backends(), Duration::from_secs(2)).await;

    assert!(registry.is_empty());
    assert_eq!(registry.availability().len(), 2);
    assert!(registry.availability().iter().all(|status| !status.available));
    backends.shutdown().await;
}
