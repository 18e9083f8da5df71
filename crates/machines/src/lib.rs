//! Machine kinds known to the panel: their event contracts, commands with
//! optimistic predictions, and controller helpers.

use std::{fmt, str::FromStr};

use client_core::Shape;
use shared::domain::{MachineIdentification, MachineIdentificationUnique, NamespaceId};
use thiserror::Error;

pub mod bbm_automatik_v2;
pub mod schneidemaschine_v0;

pub use bbm_automatik_v2::{BbmAutomatikV2, BbmAutomatikV2Controller};
pub use schneidemaschine_v0::{SchneidemaschineV0, SchneidemaschineV0Controller};

pub const VENDOR_QITECH: u16 = 0x0001;
pub const SCHNEIDEMASCHINE_V0: u16 = 0x0031;
pub const BBM_AUTOMATIK_V2: u16 = 0x0032;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MachineKind {
    BbmAutomatikV2,
    SchneidemaschineV0,
}

impl MachineKind {
    pub const ALL: [MachineKind; 2] = [Self::BbmAutomatikV2, Self::SchneidemaschineV0];

    pub const fn identification(self) -> MachineIdentification {
        match self {
            Self::BbmAutomatikV2 => MachineIdentification::new(VENDOR_QITECH, BBM_AUTOMATIK_V2),
            Self::SchneidemaschineV0 => {
                MachineIdentification::new(VENDOR_QITECH, SCHNEIDEMASCHINE_V0)
            }
        }
    }

    pub const fn slug(self) -> &'static str {
        match self {
            Self::BbmAutomatikV2 => "bbm-automatik-v2",
            Self::SchneidemaschineV0 => "schneidemaschine-v0",
        }
    }

    pub fn namespace(self, serial: u16) -> NamespaceId {
        NamespaceId::machine(MachineIdentificationUnique::new(
            self.identification(),
            serial,
        ))
    }
}

impl fmt::Display for MachineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown machine kind '{0}' (expected one of: bbm-automatik-v2, schneidemaschine-v0)")]
pub struct UnknownMachineKind(pub String);

impl FromStr for MachineKind {
    type Err = UnknownMachineKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.slug().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownMachineKind(s.to_string()))
    }
}

pub(crate) fn bools(arity: usize) -> Shape {
    Shape::tuple_of(Shape::Bool, arity)
}

pub(crate) fn integers(arity: usize) -> Shape {
    Shape::tuple_of(Shape::Integer, arity)
}

pub(crate) fn numbers(arity: usize) -> Shape {
    Shape::tuple_of(Shape::Number, arity)
}
