// ============================================================================
// Courier Types - Wire schema shared by every producer and consumer
// ============================================================================
//
// This crate has NO dependency on the broker or on any service. It defines:
// - `EventEnvelope`: the unit of transport (metadata + opaque payload)
// - `EventType` / `EventFamily`: the enumerated event type registry
// - `DomainEvent`: typed payload dispatch over the registry
//
// ============================================================================

pub mod domain;
pub mod envelope;
pub mod event_type;
pub mod payloads;

pub use domain::DomainEvent;
pub use envelope::{EnvelopeError, EventEnvelope, DEFAULT_CONTENT_TYPE, DEFAULT_DATA_VERSION};
pub use event_type::{topics, EventFamily, EventType};
pub use payloads::*;
