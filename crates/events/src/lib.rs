//! `folio-events` — event, command and read-side mechanics.
//!
//! Pure building blocks shared by domain crates and infrastructure: the event
//! and command contracts, the payload codec, the bus abstraction, handler and
//! projection capabilities, sagas and the upcaster registry. No storage here.

pub mod bus;
pub mod command;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_bus;
pub mod projection;
pub mod saga;
pub mod upcast;

pub use bus::{EventBus, Subscription};
pub use command::{Command, CommandEnvelope};
pub use envelope::{EventEnvelope, EventMetadata};
pub use event::{CodecError, Event, decode_payload, encode_payload};
pub use handler::{EventHandler, ProjectionApplyError, execute};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use projection::{Projection, RowChange};
pub use saga::{Saga, SagaInstance, Transition};
pub use upcast::{UpcastError, Upcasters};
