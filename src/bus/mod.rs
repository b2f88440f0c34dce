pub mod broadcaster;

pub use broadcaster::{clean_for_display, Broadcaster, Envelope, EventKind, SharedBroadcaster};
