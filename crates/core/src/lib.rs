pub mod config;
pub mod domain;
pub mod errors;
pub mod guard;
pub mod turn;

pub use config::{AppConfig, ConfigError, LoadOptions};
pub use domain::conversation::{ConversationId, Turn, TurnContent, TurnRole};
pub use domain::tool::{
    Backend, ToolCallRef, ToolError, ToolInvocation, ToolOperation, ToolPayload, ToolResult,
};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use guard::{BoundedResult, GuardPolicy, GuardRejected, OutputGuard};
pub use turn::{TurnEvent, TurnMachine, TurnState, TurnTransitionError};
