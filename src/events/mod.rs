//! Event bus and schema registry.
//!
//! Every state transition and terminal outcome is announced as an
//! [`Event`] with a dot-namespaced type from [`catalog`] and a payload
//! validated against the [`SchemaRegistry`].

pub mod bus;
pub mod catalog;
pub mod event;
pub mod schema;

pub use bus::{
    DispatchMode, DispatchReport, EventBus, EventHandler, HandlerFailure, PublishOutcome,
    ALL_EVENTS,
};
pub use event::{Event, EventId, EventMetadata};
pub use schema::{EventSchema, SchemaRegistry};
