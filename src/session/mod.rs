pub mod history;
pub mod state;

pub use history::{ToolHistoryEntry, ToolHistoryRing};
pub use state::{InvalidTransition, SessionHandle, SessionMetadata, SessionState, StateTag};
