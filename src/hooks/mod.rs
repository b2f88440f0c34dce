pub mod controller;
pub mod events;
pub mod ingress;

pub use controller::{Controller, ControllerState, Injector};
pub use events::{
    HookResponse, PostToolUseEvent, SessionEndEvent, SessionStartEvent, SessionStartSource,
    StopEvent, ToolResponse,
};
pub use ingress::{build_hooks_router, ControllerSlot, HooksState, SupervisorStopRegistry};
