//! Optimistic command/state synchronization core for machine panels.
//!
//! Server-pushed events flow `transport -> registry -> ingestion -> throttle ->
//! store`; operator commands flow `controller -> schema check -> prediction ->
//! mutation transport`, with the prediction rolled back on any failure.

pub mod dispatcher;
pub mod error;
pub mod ingestion;
pub mod optimistic;
pub mod registry;
pub mod schema;
pub mod store;
pub mod throttle;
pub mod transport;
pub mod units;
pub mod ws;

pub use dispatcher::{
    check_index, CommandOutcome, ControllerEvent, DispatchHandle, MachineCommand,
    MachineController,
};
pub use error::{CommandError, RegistryError, TransportError};
pub use ingestion::{ingest, Ingested, MachineNamespace, MachineStore};
pub use optimistic::OptimisticState;
pub use registry::{NamespaceHandle, NamespaceRegistry};
pub use schema::{Contract, SchemaViolation, Shape};
pub use store::{NamespaceStore, Store, Subscription};
pub use throttle::{ThrottleOptions, ThrottledStoreUpdater};
pub use transport::{
    EventHandler, EventTransport, HttpMutationClient, LocalEventBus, MutationTransport,
};
pub use units::{LinearScale, RotaryScale};
pub use ws::{WsEventTransport, WsTransportOptions};

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
