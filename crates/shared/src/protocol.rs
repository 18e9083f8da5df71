use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{domain::MachineIdentificationUnique, error::ApiError};

/// Server to client push message. `name` selects the contract `data` is checked against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event<T> {
    pub name: String,
    pub data: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<u64>,
}

impl<T> Event<T> {
    pub fn new(name: impl Into<String>, data: T) -> Self {
        Self {
            name: name.into(),
            data,
            ts: None,
        }
    }

    pub fn with_ts(mut self, ts: u64) -> Self {
        self.ts = Some(ts);
        self
    }
}

/// An event whose payload has not been validated yet.
pub type GenericEvent = Event<Value>;

/// Body of `POST /api/v1/machine/mutate`. `data` is the `{action, value}` command envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRequest {
    pub machine_identification_unique: MachineIdentificationUnique,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MutationResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { namespace: String },
    Unsubscribe { namespace: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Event {
        namespace: String,
        event: GenericEvent,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        namespace: Option<String>,
        error: ApiError,
    },
}
