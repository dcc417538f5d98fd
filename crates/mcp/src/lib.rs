//! Parley MCP (Model Context Protocol) client adapters
//!
//! Each enabled backend in `[backends.*]` is an MCP server started as a child
//! process and spoken to over stdio. `McpBackend` implements the agent's
//! `ToolBackend` trait, so discovery (`tools/list`) and invocation
//! (`tools/call`) go through the same registry as any other backend.
//!
//! ## Example Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use parley_agent::ToolRegistry;
//! use parley_core::{AppConfig, LoadOptions};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = AppConfig::load(LoadOptions::default())?;
//! let backends = parley_mcp::backends_from_config(&config);
//! let timeout = Duration::from_secs(30);
//! let registry = ToolRegistry::discover(backends.as_tool_backends(), timeout).await;
//! println!("{} operations", registry.len());
//! backends.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod client;
mod convert;

use std::sync::Arc;

pub use client::McpBackend;
pub use convert::{operation_from_tool, result_from_call};

use parley_agent::ToolBackend;
use parley_core::AppConfig;

/// The MCP backends enabled in configuration, kept for shutdown.
#[derive(Clone, Default)]
pub struct McpBackends {
    backends: Vec<Arc<McpBackend>>,
}

impl McpBackends {
    pub fn as_tool_backends(&self) -> Vec<Arc<dyn ToolBackend>> {
        self.backends.iter().map(|backend| Arc::clone(backend) as Arc<dyn ToolBackend>).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<McpBackend>> {
        self.backends.iter()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub async fn shutdown(&self) {
        for backend in &self.backends {
            backend.shutdown().await;
        }
    }
}

pub fn backends_from_config(config: &AppConfig) -> McpBackends {
    let backends = config
        .backends
        .enabled()
        .map(|(backend, settings)| Arc::new(McpBackend::new(backend, settings.clone())))
        .collect();
    McpBackends { backends }
}
