//! Event broadcast and the inbound control protocol.

pub mod control;
pub mod events;
pub mod hub;

pub use control::{ControlDispatcher, ControlMessage, ControlReply, ControlType};
pub use events::{Event, EventType};
pub use hub::{EventBroadcaster, EventReceiver, Subscription, TokenSink};
