pub mod engine;
pub mod states;

pub use engine::{transition, TurnMachine, TurnTransitionError};
pub use states::{TransitionOutcome, TurnAction, TurnEvent, TurnState};
