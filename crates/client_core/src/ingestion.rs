//! Per-namespace demultiplexing of inbound events.

use std::{convert::Infallible, fmt};

use serde::de::DeserializeOwned;
use shared::{
    domain::NamespaceId,
    protocol::{Event, GenericEvent},
};
use tracing::{debug, error, warn};

use crate::{
    schema::{Contract, SchemaViolation},
    store::NamespaceStore,
    throttle::ThrottledStoreUpdater,
};

pub const STATE_EVENT: &str = "StateEvent";
pub const LIVE_VALUES_EVENT: &str = "LiveValuesEvent";

/// Event contracts of one machine kind.
pub trait MachineNamespace: Send + Sync + 'static {
    /// Controllable state: outputs, axis targets, sequence progress.
    type State: DeserializeOwned + Clone + PartialEq + fmt::Debug + Send + Sync + 'static;
    /// High-frequency sensor telemetry.
    type LiveValues: DeserializeOwned + Clone + PartialEq + fmt::Debug + Send + Sync + 'static;

    /// Human-readable kind name used in logs and registry diagnostics.
    const KIND: &'static str;
    /// Events the server may send that this client deliberately does not store.
    const IGNORED_EVENTS: &'static [&'static str] = &[];

    fn state_contract() -> Contract;
    fn live_values_contract() -> Contract;
}

pub type MachineStore<N> =
    NamespaceStore<<N as MachineNamespace>::State, <N as MachineNamespace>::LiveValues>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingested {
    State,
    LiveValues,
    /// Known event kind with no store field.
    Ignored,
    /// Unrecognized name; dropped for forward compatibility.
    Unknown,
    /// Failed validation; dropped.
    Rejected(SchemaViolation),
}

/// Validates `event` against the contracts of `N` and stages the resulting
/// store transition on `updater`. Never fails: bad or unknown events are
/// logged and dropped so the store stays at its last good value.
pub fn ingest<N: MachineNamespace>(
    namespace: &NamespaceId,
    updater: &ThrottledStoreUpdater<MachineStore<N>>,
    event: GenericEvent,
) -> Ingested {
    let GenericEvent { name, data, ts } = event;

    let outcome = if name == STATE_EVENT {
        N::state_contract().parse::<N::State>(data).map(|data| {
            let event = Event { name, data, ts };
            let _ = updater.update_with(|store| Ok::<_, Infallible>(store.with_state(event)));
            Ingested::State
        })
    } else if name == LIVE_VALUES_EVENT {
        N::live_values_contract()
            .parse::<N::LiveValues>(data)
            .map(|data| {
                let event = Event { name, data, ts };
                let _ = updater
                    .update_with(|store| Ok::<_, Infallible>(store.with_live_values(event)));
                Ingested::LiveValues
            })
    } else if N::IGNORED_EVENTS.contains(&name.as_str()) {
        debug!(kind = N::KIND, %namespace, event = %name, "ignoring event");
        Ok(Ingested::Ignored)
    } else {
        warn!(kind = N::KIND, %namespace, event = %name, "unknown event ignored");
        Ok(Ingested::Unknown)
    };

    outcome.unwrap_or_else(|violation| {
        error!(kind = N::KIND, %namespace, %violation, "dropping malformed event");
        Ingested::Rejected(violation)
    })
}

#[cfg(test)]
#[path = "tests/ingestion_tests.rs"]
mod tests;
