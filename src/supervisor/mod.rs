pub mod cooldown;
pub mod decision;
pub mod dispatcher;
pub mod prompt;
pub mod runtime;

pub use cooldown::Cooldown;
pub use decision::{Decision, DecisionAction, NonEmptyCommand};
pub use dispatcher::{
    DecisionContext, Dispatcher, InteractiveDispatcher, IterationProgress, MockDispatcher,
    PrintModeDispatcher, SupervisorStopSlot,
};
pub use runtime::SupervisorRuntime;
