use thiserror::Error;

use crate::turn::states::{TransitionOutcome, TurnAction, TurnEvent, TurnState};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TurnTransitionError {
    #[error("invalid turn transition from {state:?} using event {event:?}")]
    InvalidTransition { state: TurnState, event: TurnEvent },
}

/// Pure transition table for a single conversational turn.
pub fn transition(
    current: TurnState,
    event: TurnEvent,
) -> Result<TransitionOutcome, TurnTransitionError> {
    use TurnAction::{
        AppendTurns, BoundOutput, ComposeReply, ConsultOracle, InvokeTool, NoticeFailure,
        PersistUserTurn, ReturnReply, ValidateArguments,
    };
    use TurnEvent::{
        CancelRequested, ComposeStarted, ContextAssembled, ContractViolated, DecisionFailed,
        DispatchStarted, NoToolNeeded, PreFiltered, ReplyReturned, ResultBounded, ToolChosen,
        ToolFailed, TurnsAppended,
    };
    use TurnState::{
        Cancelled, ComposingFinalAnswer, DirectAnswer, Done, Persisted, ReceivedMessage,
        Reasoning, ToolInvoking, ToolResultReady, ToolSelected,
    };

    let (to, actions) = match (current, event) {
        (ReceivedMessage, PreFiltered) => (DirectAnswer, Vec::new()),
        (ReceivedMessage, ContextAssembled) => (Reasoning, vec![ConsultOracle]),
        (Reasoning, NoToolNeeded) | (Reasoning, ContractViolated) => (DirectAnswer, Vec::new()),
        (Reasoning, DecisionFailed) => (DirectAnswer, vec![NoticeFailure]),
        (Reasoning, ToolChosen) => (ToolSelected, vec![ValidateArguments]),
        (ToolSelected, DispatchStarted) => (ToolInvoking, vec![InvokeTool]),
        (ToolInvoking, ResultBounded) => (ToolResultReady, vec![BoundOutput]),
        (ToolInvoking, ToolFailed) => (ComposingFinalAnswer, vec![NoticeFailure]),
        (DirectAnswer, ComposeStarted) => (ComposingFinalAnswer, Vec::new()),
        (ToolResultReady, ComposeStarted) => (ComposingFinalAnswer, vec![ComposeReply]),
        (ComposingFinalAnswer, TurnsAppended) => (Persisted, vec![AppendTurns]),
        (Persisted, ReplyReturned) => (Done, vec![ReturnReply]),
        (Persisted, CancelRequested) | (Done, _) | (Cancelled, _) => {
            return Err(TurnTransitionError::InvalidTransition { state: current, event });
        }
        (_, CancelRequested) => (Cancelled, vec![PersistUserTurn]),
        _ => {
            return Err(TurnTransitionError::InvalidTransition { state: current, event });
        }
    };

    Ok(TransitionOutcome { from: current, to, event, actions })
}

/// Tracks the current state of one turn and the transitions taken so far.
#[derive(Clone, Debug)]
pub struct TurnMachine {
    state: TurnState,
    trace: Vec<TransitionOutcome>,
}

impl Default for TurnMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnMachine {
    pub fn new() -> Self {
        Self { state: TurnState::ReceivedMessage, trace: Vec::new() }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn trace(&self) -> &[TransitionOutcome] {
        &self.trace
    }

    pub fn apply(&mut self, event: TurnEvent) -> Result<&TransitionOutcome, TurnTransitionError> {
        let outcome = transition(self.state, event)?;
        self.state = outcome.to;
        self.trace.push(outcome);
        Ok(&self.trace[self.trace.len() - 1])
    }
}

#[cfg(test)]
mod tests {
    use super::{transition, TurnMachine, TurnTransitionError};
    use crate::turn::states::{TurnAction, TurnEvent, TurnState};

    #[test]
    fn tool_path_reaches_done() {
        let mut machine = TurnMachine::new();
        for event in [
            TurnEvent::ContextAssembled,
            TurnEvent::ToolChosen,
            TurnEvent::DispatchStarted,
            TurnEvent::ResultBounded,
            TurnEvent::ComposeStarted,
            TurnEvent::TurnsAppended,
            TurnEvent::ReplyReturned,
        ] {
            machine.apply(event).expect("valid tool path");
        }

        assert_eq!(machine.state(), TurnState::Done);
        assert_eq!(machine.trace().len(), 7);
        assert_eq!(machine.trace()[1].actions, vec![TurnAction::ValidateArguments]);
    }

    #[test]
    fn pre_filtered_input_skips_reasoning() {
        let mut machine = TurnMachine::new();
        let outcome = machine.apply(TurnEvent::PreFiltered).expect("pre-filter");
        assert_eq!(outcome.to, TurnState::DirectAnswer);

        machine.apply(TurnEvent::ComposeStarted).expect("compose");
        assert_eq!(machine.state(), TurnState::ComposingFinalAnswer);
    }

    #[test]
    fn tool_failure_goes_straight_to_composition() {
        let outcome = transition(TurnState::ToolInvoking, TurnEvent::ToolFailed)
            .expect("failure is a valid exit");
        assert_eq!(outcome.to, TurnState::ComposingFinalAnswer);
        assert_eq!(outcome.actions, vec![TurnAction::NoticeFailure]);
    }

    #[test]
    fn failed_decision_degrades_to_direct_answer() {
        let outcome = transition(TurnState::Reasoning, TurnEvent::DecisionFailed)
            .expect("oracle failure is a valid exit");
        assert_eq!(outcome.to, TurnState::DirectAnswer);
        assert_eq!(outcome.actions, vec![TurnAction::NoticeFailure]);
    }

    #[test]
    fn skipping_dispatch_is_rejected() {
        let error = transition(TurnState::ToolSelected, TurnEvent::ResultBounded)
            .expect_err("result cannot arrive before dispatch");
        assert_eq!(
            error,
            TurnTransitionError::InvalidTransition {
                state: TurnState::ToolSelected,
                event: TurnEvent::ResultBounded,
            }
        );
    }

    #[test]
    fn cancellation_persists_user_turn_but_not_after_persistence() {
        let outcome = transition(TurnState::ToolInvoking, TurnEvent::CancelRequested)
            .expect("cancel mid-flight");
        assert_eq!(outcome.to, TurnState::Cancelled);
        assert_eq!(outcome.actions, vec![TurnAction::PersistUserTurn]);
        assert!(outcome.to.is_terminal());

        assert!(transition(TurnState::Persisted, TurnEvent::CancelRequested).is_err());
        assert!(transition(TurnState::Done, TurnEvent::ContextAssembled).is_err());
    }

    #[test]
    fn machine_leaves_state_unchanged_on_error() {
        let mut machine = TurnMachine::new();
        assert!(machine.apply(TurnEvent::ReplyReturned).is_err());
        assert_eq!(machine.state(), TurnState::ReceivedMessage);
        assert!(machine.trace().is_empty());
    }
}
