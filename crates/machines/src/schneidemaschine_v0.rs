//! Schneidemaschine V0: cutting machine with two linear axes.

use std::{fmt, sync::Arc};

use client_core::{
    check_index, CommandError, Contract, DispatchHandle, LinearScale, MachineCommand,
    MachineController, MachineNamespace, MutationTransport, NamespaceHandle, NamespaceRegistry,
    RegistryError, Shape,
};
use serde::{Deserialize, Serialize};

use crate::{bools, integers, numbers, MachineKind};

pub const AXIS_COUNT: usize = 2;
pub const INPUT_COUNT: usize = 8;
pub const OUTPUT_COUNT: usize = 8;

pub const LINEAR: LinearScale = LinearScale::new(20.0);
pub const MAX_SPEED_MM_S: f64 = 230.0;

/// Emitted on request by [`Mutation::DebugPto`]; not stored.
pub const DEBUG_PTO_EVENT: &str = "DebugPtoEvent";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub output_states: [bool; OUTPUT_COUNT],
    pub axis_speeds: [i32; AXIS_COUNT],
    pub axis_target_speeds: [i32; AXIS_COUNT],
    pub axis_accelerations: [f64; AXIS_COUNT],
    // Older firmware omits the position fields.
    #[serde(default)]
    pub axis_target_positions: Option<[u32; AXIS_COUNT]>,
    #[serde(default)]
    pub axis_position_mode: Option<[bool; AXIS_COUNT]>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveValues {
    pub input_states: [bool; INPUT_COUNT],
    pub axis_positions: [u32; AXIS_COUNT],
}

pub struct SchneidemaschineV0;

impl MachineNamespace for SchneidemaschineV0 {
    type State = State;
    type LiveValues = LiveValues;

    const KIND: &'static str = "schneidemaschine_v0";
    const IGNORED_EVENTS: &'static [&'static str] = &[DEBUG_PTO_EVENT];

    fn state_contract() -> Contract {
        Contract::event_data(
            client_core::ingestion::STATE_EVENT,
            Shape::object([
                ("output_states", bools(OUTPUT_COUNT)),
                ("axis_speeds", integers(AXIS_COUNT)),
                ("axis_target_speeds", integers(AXIS_COUNT)),
                ("axis_accelerations", numbers(AXIS_COUNT)),
                (
                    "axis_target_positions",
                    Shape::optional(integers(AXIS_COUNT)),
                ),
                ("axis_position_mode", Shape::optional(bools(AXIS_COUNT))),
            ]),
        )
    }

    fn live_values_contract() -> Contract {
        Contract::event_data(
            client_core::ingestion::LIVE_VALUES_EVENT,
            Shape::object([
                ("input_states", bools(INPUT_COUNT)),
                ("axis_positions", integers(AXIS_COUNT)),
            ]),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", content = "value")]
pub enum Mutation {
    SetOutput { index: usize, on: bool },
    SetAllOutputs { on: bool },
    SetAxisSpeed { index: usize, speed: i32 },
    SetAxisSpeedMmS { index: usize, speed_mm_s: f64 },
    SetAxisAcceleration { index: usize, accel_mm_s2: f64 },
    MoveToPosition {
        index: usize,
        position_mm: f64,
        speed_mm_s: f64,
    },
    StopAllAxes,
    DebugPto { index: usize },
    DebugLogAll,
}

impl MachineCommand for Mutation {
    type State = State;

    fn action(&self) -> &'static str {
        match self {
            Self::SetOutput { .. } => "SetOutput",
            Self::SetAllOutputs { .. } => "SetAllOutputs",
            Self::SetAxisSpeed { .. } => "SetAxisSpeed",
            Self::SetAxisSpeedMmS { .. } => "SetAxisSpeedMmS",
            Self::SetAxisAcceleration { .. } => "SetAxisAcceleration",
            Self::MoveToPosition { .. } => "MoveToPosition",
            Self::StopAllAxes => "StopAllAxes",
            Self::DebugPto { .. } => "DebugPto",
            Self::DebugLogAll => "DebugLogAll",
        }
    }

    fn contract(&self) -> Contract {
        let value = match self {
            Self::SetOutput { .. } => Some(Shape::object([
                ("index", Shape::Integer),
                ("on", Shape::Bool),
            ])),
            Self::SetAllOutputs { .. } => Some(Shape::object([("on", Shape::Bool)])),
            Self::SetAxisSpeed { .. } => Some(Shape::object([
                ("index", Shape::Integer),
                ("speed", Shape::Integer),
            ])),
            Self::SetAxisSpeedMmS { .. } => Some(Shape::object([
                ("index", Shape::Integer),
                ("speed_mm_s", Shape::Number),
            ])),
            Self::SetAxisAcceleration { .. } => Some(Shape::object([
                ("index", Shape::Integer),
                ("accel_mm_s2", Shape::Number),
            ])),
            Self::MoveToPosition { .. } => Some(Shape::object([
                ("index", Shape::Integer),
                ("position_mm", Shape::Number),
                ("speed_mm_s", Shape::Number),
            ])),
            Self::DebugPto { .. } => Some(Shape::object([("index", Shape::Integer)])),
            Self::StopAllAxes | Self::DebugLogAll => None,
        };
        Contract::command(self.action(), value)
    }

    fn check_bounds(&self) -> Result<(), CommandError> {
        match self {
            Self::SetOutput { index, .. } => {
                check_index(self.action(), "index", *index, OUTPUT_COUNT)
            }
            Self::SetAxisSpeed { index, .. }
            | Self::SetAxisSpeedMmS { index, .. }
            | Self::SetAxisAcceleration { index, .. }
            | Self::MoveToPosition { index, .. }
            | Self::DebugPto { index } => check_index(self.action(), "index", *index, AXIS_COUNT),
            Self::SetAllOutputs { .. } | Self::StopAllAxes | Self::DebugLogAll => Ok(()),
        }
    }

    fn predict(&self, current: &State) -> Option<State> {
        let mut next = current.clone();
        match *self {
            Self::SetOutput { index, on } => next.output_states[index] = on,
            Self::SetAllOutputs { on } => next.output_states = [on; OUTPUT_COUNT],
            Self::SetAxisSpeed { index, speed } => next.axis_speeds[index] = speed,
            Self::SetAxisSpeedMmS { index, speed_mm_s } => {
                next.axis_speeds[index] = LINEAR.speed_to_hz(speed_mm_s)
            }
            Self::SetAxisAcceleration { index, accel_mm_s2 } => {
                next.axis_accelerations[index] = accel_mm_s2
            }
            Self::MoveToPosition {
                index, position_mm, ..
            } => {
                // Negative targets clamp to 0 on this machine.
                let pulses = LINEAR.position_to_pulses(position_mm).max(0).unsigned_abs();
                next.axis_target_positions.get_or_insert([0; AXIS_COUNT])[index] = pulses;
                next.axis_position_mode.get_or_insert([false; AXIS_COUNT])[index] = true;
            }
            Self::StopAllAxes => next.axis_speeds = [0; AXIS_COUNT],
            Self::DebugPto { .. } | Self::DebugLogAll => return None,
        }
        Some(next)
    }
}

pub struct SchneidemaschineV0Controller {
    controller: MachineController<SchneidemaschineV0>,
}

impl SchneidemaschineV0Controller {
    pub fn new(
        registry: &Arc<NamespaceRegistry>,
        serial: u16,
        transport: Arc<dyn MutationTransport>,
    ) -> Result<Self, RegistryError> {
        let handle = registry
            .get_or_create::<SchneidemaschineV0>(MachineKind::SchneidemaschineV0.namespace(serial))?;
        Ok(Self::from_handle(handle, transport))
    }

    pub fn from_handle(
        handle: NamespaceHandle<SchneidemaschineV0>,
        transport: Arc<dyn MutationTransport>,
    ) -> Self {
        Self {
            controller: MachineController::new(handle, transport),
        }
    }

    pub fn controller(&self) -> &MachineController<SchneidemaschineV0> {
        &self.controller
    }

    pub fn state(&self) -> Option<State> {
        self.controller.state()
    }

    pub fn default_state(&self) -> Option<State> {
        self.controller.default_state()
    }

    pub fn live_values(&self) -> Option<LiveValues> {
        self.controller.live_values()
    }

    pub fn is_loading(&self) -> bool {
        self.controller.is_loading()
    }

    pub fn is_disabled(&self) -> bool {
        self.controller.is_disabled()
    }

    pub fn set_output(&self, index: usize, on: bool) -> Result<DispatchHandle, CommandError> {
        self.controller.dispatch(Mutation::SetOutput { index, on })
    }

    pub fn toggle_output(&self, index: usize) -> Result<Option<DispatchHandle>, CommandError> {
        let Some(state) = self.state() else {
            return Ok(None);
        };
        let on = !state.output_states.get(index).copied().unwrap_or(false);
        self.set_output(index, on).map(Some)
    }

    pub fn set_all_outputs(&self, on: bool) -> Result<DispatchHandle, CommandError> {
        self.controller.dispatch(Mutation::SetAllOutputs { on })
    }

    pub fn set_axis_speed(&self, index: usize, speed: i32) -> Result<DispatchHandle, CommandError> {
        self.controller.dispatch(Mutation::SetAxisSpeed { index, speed })
    }

    pub fn set_axis_speed_mm_s(
        &self,
        index: usize,
        speed_mm_s: f64,
    ) -> Result<DispatchHandle, CommandError> {
        self.controller
            .dispatch(Mutation::SetAxisSpeedMmS { index, speed_mm_s })
    }

    pub fn set_axis_acceleration(
        &self,
        index: usize,
        accel_mm_s2: f64,
    ) -> Result<DispatchHandle, CommandError> {
        self.controller
            .dispatch(Mutation::SetAxisAcceleration { index, accel_mm_s2 })
    }

    pub fn move_to_position(
        &self,
        index: usize,
        position_mm: f64,
        speed_mm_s: f64,
    ) -> Result<DispatchHandle, CommandError> {
        self.controller.dispatch(Mutation::MoveToPosition {
            index,
            position_mm,
            speed_mm_s,
        })
    }

    /// This machine has no single-axis stop; a zero speed stops the axis.
    pub fn stop_axis(&self, index: usize) -> Result<DispatchHandle, CommandError> {
        self.set_axis_speed_mm_s(index, 0.0)
    }

    pub fn stop_all_axes(&self) -> Result<DispatchHandle, CommandError> {
        self.controller.dispatch(Mutation::StopAllAxes)
    }

    pub fn debug_pto(&self, index: usize) -> Result<DispatchHandle, CommandError> {
        self.controller.dispatch(Mutation::DebugPto { index })
    }

    pub fn debug_log_all(&self) -> Result<DispatchHandle, CommandError> {
        self.controller.dispatch(Mutation::DebugLogAll)
    }

    pub fn axis_speed_mm_s(&self, index: usize) -> Option<f64> {
        let hz = *self.state()?.axis_speeds.get(index)?;
        Some(LINEAR.pulses_to_mm(hz))
    }

    pub fn axis_position_mm(&self, index: usize) -> Option<f64> {
        let pulses = *self.live_values()?.axis_positions.get(index)?;
        Some(f64::from(pulses) / LINEAR.pulses_per_mm)
    }
}

impl fmt::Debug for SchneidemaschineV0Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchneidemaschineV0Controller")
            .field("controller", &self.controller)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn state_without_position_fields_is_accepted() {
        let state: State = SchneidemaschineV0::state_contract()
            .parse(json!({
                "output_states": vec![false; 8],
                "axis_speeds": [4600, 0],
                "axis_target_speeds": [4600, 0],
                "axis_accelerations": [100.0, 100.0],
            }))
            .expect("valid payload");

        assert_eq!(state.axis_speeds, [4600, 0]);
        assert_eq!(state.axis_target_positions, None);
    }

    #[test]
    fn negative_positions_are_rejected_at_decode() {
        let err = SchneidemaschineV0::live_values_contract()
            .parse::<LiveValues>(json!({
                "input_states": vec![false; 8],
                "axis_positions": [-1, 0],
            }))
            .expect_err("unsigned positions");
        assert_eq!(err.path, "data");
    }

    #[test]
    fn debug_pto_event_is_known_but_ignored() {
        assert!(SchneidemaschineV0::IGNORED_EVENTS.contains(&DEBUG_PTO_EVENT));
    }

    #[test]
    fn max_speed_prediction() {
        let next = Mutation::SetAxisSpeedMmS {
            index: 1,
            speed_mm_s: MAX_SPEED_MM_S,
        }
        .predict(&State::default())
        .expect("prediction");
        assert_eq!(next.axis_speeds, [0, 4600]);
    }

    #[test]
    fn stop_all_only_zeroes_speeds() {
        let state = State {
            axis_speeds: [100, 200],
            axis_target_speeds: [100, 200],
            ..State::default()
        };
        let next = Mutation::StopAllAxes.predict(&state).expect("prediction");
        assert_eq!(next.axis_speeds, [0, 0]);
        assert_eq!(next.axis_target_speeds, [100, 200]);
    }

    #[test]
    fn move_to_position_fills_missing_position_fields() {
        let next = Mutation::MoveToPosition {
            index: 1,
            position_mm: 10.0,
            speed_mm_s: 50.0,
        }
        .predict(&State::default())
        .expect("prediction");
        assert_eq!(next.axis_target_positions, Some([0, 200]));
        assert_eq!(next.axis_position_mode, Some([false, true]));
    }

    #[test]
    fn fractional_inputs_predict_what_the_machine_reports() {
        let speed = Mutation::SetAxisSpeedMmS {
            index: 0,
            speed_mm_s: 12.53,
        }
        .predict(&State::default())
        .expect("prediction");
        assert_eq!(speed.axis_speeds, [250, 0]);

        let position = Mutation::MoveToPosition {
            index: 0,
            position_mm: 12.5,
            speed_mm_s: 50.0,
        }
        .predict(&State::default())
        .expect("prediction");
        assert_eq!(position.axis_target_positions, Some([260, 0]));
    }

    #[test]
    fn debug_commands_carry_no_prediction() {
        assert_eq!(Mutation::DebugPto { index: 0 }.predict(&State::default()), None);
        assert_eq!(Mutation::DebugLogAll.predict(&State::default()), None);
        assert_eq!(
            serde_json::to_value(Mutation::DebugLogAll).expect("serialize"),
            json!({ "action": "DebugLogAll" })
        );
    }

    #[test]
    fn debug_pto_index_is_range_checked() {
        Mutation::DebugPto { index: 2 }
            .check_bounds()
            .expect_err("two axes only");
    }
}
