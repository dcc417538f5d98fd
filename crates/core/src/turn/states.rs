use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnState {
    ReceivedMessage,
    Reasoning,
    DirectAnswer,
    ToolSelected,
    ToolInvoking,
    ToolResultReady,
    ComposingFinalAnswer,
    Persisted,
    Done,
    Cancelled,
}

impl TurnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReceivedMessage => "received_message",
            Self::Reasoning => "reasoning",
            Self::DirectAnswer => "direct_answer",
            Self::ToolSelected => "tool_selected",
            Self::ToolInvoking => "tool_invoking",
            Self::ToolResultReady => "tool_result_ready",
            Self::ComposingFinalAnswer => "composing_final_answer",
            Self::Persisted => "persisted",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnEvent {
    /// Trivial input answered by the pre-filter without consulting the oracle.
    PreFiltered,
    ContextAssembled,
    NoToolNeeded,
    ContractViolated,
    /// The oracle could not be reached or timed out while deciding.
    DecisionFailed,
    ToolChosen,
    DispatchStarted,
    ResultBounded,
    ToolFailed,
    ComposeStarted,
    TurnsAppended,
    ReplyReturned,
    CancelRequested,
}

impl TurnEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreFiltered => "pre_filtered",
            Self::ContextAssembled => "context_assembled",
            Self::NoToolNeeded => "no_tool_needed",
            Self::ContractViolated => "contract_violated",
            Self::DecisionFailed => "decision_failed",
            Self::ToolChosen => "tool_chosen",
            Self::DispatchStarted => "dispatch_started",
            Self::ResultBounded => "result_bounded",
            Self::ToolFailed => "tool_failed",
            Self::ComposeStarted => "compose_started",
            Self::TurnsAppended => "turns_appended",
            Self::ReplyReturned => "reply_returned",
            Self::CancelRequested => "cancel_requested",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnAction {
    ConsultOracle,
    ValidateArguments,
    InvokeTool,
    BoundOutput,
    NoticeFailure,
    ComposeReply,
    AppendTurns,
    PersistUserTurn,
    ReturnReply,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: TurnState,
    pub to: TurnState,
    pub event: TurnEvent,
    pub actions: Vec<TurnAction>,
}
