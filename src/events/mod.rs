//! Event channel
//!
//! Message kinds exchanged with services and producers, the in-process
//! broadcast bus, the bus-backed execution collaborator and the dispatcher
//! for inbound messages.

mod bus;
mod dispatch;
mod messages;
mod remote;

pub use bus::{BusPublisher, EventBus};
pub use dispatch::{Dispatch, InboundDispatcher};
pub use messages::{Event, ModelPublished, PriceUpdate, TaskResult};
pub use remote::RemoteExecutor;
