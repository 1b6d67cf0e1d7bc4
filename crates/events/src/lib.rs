//! Publish/subscribe mechanics for backend change notifications.
//!
//! The identity backend pushes session changes through an [`EventBus`]; the
//! session synchronizer is the single registered consumer.

pub mod bus;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
