//! Agent Runtime - per-turn tool routing for the parley assistant
//!
//! This crate decides, for every user message, whether to answer directly or
//! to call exactly one operation on a connected backend (CRM, repository host,
//! filesystem), then folds the bounded result back into a reply.
//!
//! # Architecture
//!
//! Each turn walks the state machine in `parley_core::turn`:
//! 1. **Pre-filter** (`guardrails`) - greetings, thanks and capability
//!    questions are answered without touching the oracle or any backend
//! 2. **Decision** (`llm`, `openai`) - the oracle sees history plus the catalog
//! 3. **Dispatch** (`tools`) - arguments are schema-checked, then invoked
//!    with a timeout and at most one retry for transient failures
//! 4. **Bounding** - `parley_core::guard::OutputGuard` caps the result
//! 5. **Composition + persistence** (`runtime`) - user, tool and assistant
//!    turns are appended in that order before the reply is returned
//!
//! # Key Types
//!
//! - `AgentRuntime` - turn orchestrator, serialises turns per conversation
//! - `Oracle` - pluggable reasoning capability (`decide` / `compose`)
//! - `ToolBackend` / `ToolRegistry` - discovered operation catalog
//!
//! # Safety Principle
//!
//! Raw tool payloads never reach the user unless they ask for raw output, and
//! then only after bounding. Tool failures are summarised in plain language.

pub mod conversation;
pub mod guardrails;
pub mod llm;
pub mod openai;
pub mod runtime;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tools;

pub use llm::{Decision, Oracle, OracleError, ProposedCall, ToolOutcome};
pub use openai::OpenAiCompatibleOracle;
pub use runtime::{AgentRuntime, RuntimeSettings, TurnError, TurnRequest, TurnResponse};
pub use tools::{BackendStatus, ToolBackend, ToolRegistry};
