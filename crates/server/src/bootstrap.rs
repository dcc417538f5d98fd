use std::sync::Arc;
use std::time::Duration;

use parley_agent::{
    AgentRuntime, OpenAiCompatibleOracle, Oracle, OracleError, RuntimeSettings, ToolRegistry,
};
use parley_core::config::{AppConfig, ConfigError, LoadOptions};
use parley_core::OutputGuard;
use parley_db::{connect_with_settings, migrations, ConversationStore, DbPool, SqlConversationStore};
use parley_mcp::{backends_from_config, McpBackends};
use thiserror::Error;
use tracing::{info, warn};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub runtime: Arc<AgentRuntime>,
    pub backends: McpBackends,
}

impl Application {
    /// Stops backend child processes and closes the pool.
    pub async fn shutdown(&self) {
        self.backends.shutdown().await;
        self.db_pool.close().await;
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("oracle client could not be built: {0}")]
    Oracle(#[from] OracleError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    let oracle: Arc<dyn Oracle> = Arc::new(OpenAiCompatibleOracle::from_config(&config.llm)?);
    bootstrap_with_oracle(config, oracle).await
}

/// Connects storage, discovers backends and assembles the runtime around
/// the given oracle.
pub async fn bootstrap_with_oracle(
    config: AppConfig,
    oracle: Arc<dyn Oracle>,
) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        llm_provider = ?config.llm.provider,
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let backends = backends_from_config(&config);
    let registry = ToolRegistry::discover(
        backends.as_tool_backends(),
        Duration::from_secs(config.orchestrator.tool_timeout_secs),
    )
    .await;
    let unavailable = registry.availability().iter().filter(|status| !status.available).count();
    if registry.is_empty() {
        warn!(
            event_name = "system.bootstrap.no_tools",
            correlation_id = "bootstrap",
            configured_backends = backends.len(),
            "no tool operations discovered; the assistant will answer without tools"
        );
    }
    info!(
        event_name = "system.bootstrap.registry_ready",
        correlation_id = "bootstrap",
        operation_count = registry.len(),
        unavailable_backends = unavailable,
        "tool registry ready"
    );

    let store: Arc<dyn ConversationStore> = Arc::new(SqlConversationStore::new(db_pool.clone()));
    let runtime = AgentRuntime::new(
        oracle,
        Arc::new(registry),
        store,
        OutputGuard::from_config(&config.guard),
        RuntimeSettings::from_config(&config.orchestrator),
    );

    Ok(Application { config, db_pool, runtime: Arc::new(runtime), backends })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parley_agent::testing::ScriptedOracle;
    use parley_agent::TurnRequest;
    use parley_core::config::{ConfigOverrides, LoadOptions};
    use parley_core::{AppConfig, Backend, ConversationId, TurnRole};

    use crate::bootstrap::{bootstrap_with_oracle, BootstrapError};

    fn offline_config(database_url: &str) -> AppConfig {
        AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(database_url.to_string()),
                disabled_backends: Backend::ALL.to_vec(),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .expect("config should load with overrides")
    }

    #[tokio::test]
    async fn bootstrap_applies_migrations_and_answers_turns() {
        let oracle = Arc::new(ScriptedOracle::direct("Nothing to look up for that."));
        let app = bootstrap_with_oracle(offline_config("sqlite::memory:"), oracle)
            .await
            .expect("bootstrap should succeed offline");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name = 'conversation_turn'",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("schema query");
        assert_eq!(table_count, 1);
        assert!(app.runtime.registry().is_empty());
        assert!(app.backends.is_empty());

        let id = ConversationId("bootstrap-smoke".to_string());
        let response = app
            .runtime
            .handle_turn(TurnRequest {
                conversation_id: id.clone(),
                message: "What is a SOQL query?".to_string(),
            })
            .await
            .expect("turn should complete");
        assert_eq!(response.reply, "Nothing to look up for that.");

        let history = app.runtime.store().history(&id).await.expect("history");
        let roles: Vec<TurnRole> = history.iter().map(|turn| turn.role).collect();
        assert_eq!(roles, vec![TurnRole::User, TurnRole::Assistant]);

        app.shutdown().await;
    }

    #[tokio::test]
    async fn bootstrap_reports_unreachable_database() {
        let oracle = Arc::new(ScriptedOracle::direct("unused"));
        let result = bootstrap_with_oracle(
            offline_config("sqlite:///nonexistent-parley-dir/nested/parley.db"),
            oracle,
        )
        .await;

        assert!(matches!(result, Err(BootstrapError::DatabaseConnect(_))));
    }
}
