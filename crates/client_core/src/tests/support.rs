//! Test-only machine kind and transports shared by the unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared::{
    domain::{MachineIdentification, MachineIdentificationUnique, NamespaceId},
    protocol::{GenericEvent, MutationRequest, MutationResponse},
};
use tokio::sync::mpsc;

use crate::{
    dispatcher::{check_index, MachineCommand},
    error::{CommandError, TransportError},
    ingestion::{MachineNamespace, LIVE_VALUES_EVENT, STATE_EVENT},
    schema::{Contract, Shape},
    transport::MutationTransport,
};

pub const PUMP_AXES: usize = 2;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PumpState {
    pub output_states: [bool; 2],
    pub axis_speeds: [i32; PUMP_AXES],
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PumpLive {
    pub pressure: f64,
}

pub struct Pump;

impl MachineNamespace for Pump {
    type State = PumpState;
    type LiveValues = PumpLive;

    const KIND: &'static str = "pump";
    const IGNORED_EVENTS: &'static [&'static str] = &["DebugEvent"];

    fn state_contract() -> Contract {
        Contract::event_data(
            STATE_EVENT,
            Shape::object([
                ("output_states", Shape::tuple_of(Shape::Bool, 2)),
                ("axis_speeds", Shape::tuple_of(Shape::Integer, PUMP_AXES)),
            ]),
        )
    }

    fn live_values_contract() -> Contract {
        Contract::event_data(LIVE_VALUES_EVENT, Shape::object([("pressure", Shape::Number)]))
    }
}

/// Same wire contracts as [`Pump`], different kind.
pub struct OtherPump;

impl MachineNamespace for OtherPump {
    type State = PumpState;
    type LiveValues = PumpLive;

    const KIND: &'static str = "other-pump";

    fn state_contract() -> Contract {
        Pump::state_contract()
    }

    fn live_values_contract() -> Contract {
        Pump::live_values_contract()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", content = "value")]
pub enum PumpCommand {
    SetSpeed {
        index: usize,
        speed: i32,
    },
    /// Serializes under the `SetSpeed` action with a fractional speed.
    #[serde(rename = "SetSpeed")]
    SetSpeedFraction {
        index: usize,
        speed: f64,
    },
    Purge,
}

impl MachineCommand for PumpCommand {
    type State = PumpState;

    fn action(&self) -> &'static str {
        match self {
            Self::SetSpeed { .. } | Self::SetSpeedFraction { .. } => "SetSpeed",
            Self::Purge => "Purge",
        }
    }

    fn contract(&self) -> Contract {
        match self {
            Self::SetSpeed { .. } | Self::SetSpeedFraction { .. } => Contract::command(
                "SetSpeed",
                Some(Shape::object([
                    ("index", Shape::Integer),
                    ("speed", Shape::Integer),
                ])),
            ),
            Self::Purge => Contract::command("Purge", None),
        }
    }

    fn check_bounds(&self) -> Result<(), CommandError> {
        match self {
            Self::SetSpeed { index, .. } | Self::SetSpeedFraction { index, .. } => {
                check_index(self.action(), "index", *index, PUMP_AXES)
            }
            Self::Purge => Ok(()),
        }
    }

    fn predict(&self, current: &PumpState) -> Option<PumpState> {
        match self {
            Self::SetSpeed { index, speed } => {
                let mut next = current.clone();
                next.axis_speeds[*index] = *speed;
                Some(next)
            }
            Self::SetSpeedFraction { .. } | Self::Purge => None,
        }
    }
}

pub fn pump_namespace(serial: u16) -> NamespaceId {
    NamespaceId::machine(MachineIdentificationUnique::new(
        MachineIdentification::new(1, 99),
        serial,
    ))
}

pub fn state_event(speeds: [i32; PUMP_AXES]) -> GenericEvent {
    GenericEvent::new(
        STATE_EVENT,
        json!({ "output_states": [false, false], "axis_speeds": speeds }),
    )
}

pub fn live_event(pressure: f64) -> GenericEvent {
    GenericEvent::new(LIVE_VALUES_EVENT, json!({ "pressure": pressure }))
}

pub fn raw_event(name: &str, data: Value) -> GenericEvent {
    GenericEvent::new(name, data)
}

type Reply = Result<MutationResponse, TransportError>;

/// Records every request and answers each with the next scripted reply, in
/// call order. Calls wait until a reply is scripted.
pub struct ScriptedMutations {
    requests: Mutex<Vec<MutationRequest>>,
    replies_tx: mpsc::UnboundedSender<Reply>,
    replies_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Reply>>,
}

impl ScriptedMutations {
    pub fn new() -> Arc<Self> {
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            replies_tx,
            replies_rx: tokio::sync::Mutex::new(replies_rx),
        })
    }

    pub fn reply(&self, reply: Reply) {
        self.replies_tx.send(reply).expect("receiver alive");
    }

    pub fn requests(&self) -> Vec<MutationRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl MutationTransport for ScriptedMutations {
    async fn mutate(&self, request: MutationRequest) -> Result<MutationResponse, TransportError> {
        self.requests.lock().expect("requests lock").push(request);
        let mut replies = self.replies_rx.lock().await;
        replies
            .recv()
            .await
            .unwrap_or_else(|| Err(TransportError::Connect("no scripted reply".into())))
    }
}

/// Waits until `predicate` holds, yielding to spawned tasks in between.
pub async fn eventually(mut predicate: impl FnMut() -> bool) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}
