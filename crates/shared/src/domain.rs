use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u16);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(VendorId);
id_newtype!(MachineId);
id_newtype!(Serial);

/// Identifies a machine model: who built it and which kind it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MachineIdentification {
    pub vendor: VendorId,
    pub machine: MachineId,
}

impl MachineIdentification {
    pub const fn new(vendor: u16, machine: u16) -> Self {
        Self {
            vendor: VendorId(vendor),
            machine: MachineId(machine),
        }
    }
}

/// Addresses exactly one physical machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MachineIdentificationUnique {
    pub machine_identification: MachineIdentification,
    pub serial: Serial,
}

impl MachineIdentificationUnique {
    pub const fn new(machine_identification: MachineIdentification, serial: u16) -> Self {
        Self {
            machine_identification,
            serial: Serial(serial),
        }
    }
}

impl fmt::Display for MachineIdentificationUnique {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.machine_identification.vendor, self.machine_identification.machine, self.serial
        )
    }
}

/// Routing key multiplexing one transport connection across machine instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NamespaceId {
    Machine {
        machine_identification_unique: MachineIdentificationUnique,
    },
}

impl NamespaceId {
    pub fn machine(machine_identification_unique: MachineIdentificationUnique) -> Self {
        Self::Machine {
            machine_identification_unique,
        }
    }

    pub fn machine_identification_unique(&self) -> &MachineIdentificationUnique {
        match self {
            Self::Machine {
                machine_identification_unique,
            } => machine_identification_unique,
        }
    }

    /// Wire path of this namespace, e.g. `/machine/1/17/42`.
    pub fn path(&self) -> String {
        match self {
            Self::Machine {
                machine_identification_unique,
            } => format!("/machine/{machine_identification_unique}"),
        }
    }
}

impl fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}
