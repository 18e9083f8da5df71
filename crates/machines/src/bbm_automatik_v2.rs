//! BBM Automatik V2: magazine filling machine with three linear axes
//! (Transporter, Schieber, Drücker) and one rotating brush (Bürste).
//!
//! Speeds travel as raw pulse frequencies (Hz) and positions as pulse counts;
//! the linear axes use 20 pulses per mm, the brush 200 pulses per revolution.
//! The automatic sequence runs on the machine itself; the panel only starts
//! and stops it and follows its progress.

use std::{
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use client_core::{
    check_index, CommandError, Contract, DispatchHandle, LinearScale, MachineCommand,
    MachineController, MachineNamespace, MachineStore, MutationTransport, NamespaceHandle,
    NamespaceRegistry, RegistryError, RotaryScale, Shape, Store, Subscription,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{bools, integers, numbers, MachineKind};

pub const AXIS_COUNT: usize = 4;
pub const INPUT_COUNT: usize = 8;
pub const OUTPUT_COUNT: usize = 8;

pub mod axis {
    pub const MT: usize = 0;
    pub const SCHIEBER: usize = 1;
    pub const DRUECKER: usize = 2;
    pub const BUERSTE: usize = 3;
}

pub const AXIS_NAMES: [&str; AXIS_COUNT] = ["Transporter", "Schieber", "Drücker", "Bürste"];

pub fn axis_name(index: usize) -> Option<&'static str> {
    AXIS_NAMES.get(index).copied()
}

pub mod input {
    pub const REF_MT: usize = 0;
    pub const REF_SCHIEBER: usize = 1;
    pub const REF_DRUECKER: usize = 2;
    pub const TUER: usize = 6;

    /// Reference switch of `axis`. The brush has none.
    pub const fn reference_switch(axis: usize) -> Option<usize> {
        match axis {
            super::axis::MT => Some(REF_MT),
            super::axis::SCHIEBER => Some(REF_SCHIEBER),
            super::axis::DRUECKER => Some(REF_DRUECKER),
            _ => None,
        }
    }
}

pub mod output {
    pub const RUETTELMOTOR: usize = 0;
    pub const AMPEL_ROT: usize = 1;
    pub const AMPEL_GELB: usize = 2;
    pub const AMPEL_GRUEN: usize = 3;
}

pub const LINEAR: LinearScale = LinearScale::new(20.0);
pub const ROTARY: RotaryScale = RotaryScale::new(200.0);

pub const MAX_SPEED_MM_S: f64 = 250.0;
pub const MAX_SPEED_RPM: f64 = 100.0;
pub const DEFAULT_ACCELERATION_MM_S2: f64 = 100.0;
pub const MIN_ACCELERATION_MM_S2: f64 = 4.0;
pub const MAX_ACCELERATION_MM_S2: f64 = 500.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub output_states: [bool; OUTPUT_COUNT],
    pub axis_speeds: [i32; AXIS_COUNT],
    pub axis_target_speeds: [i32; AXIS_COUNT],
    pub axis_accelerations: [f64; AXIS_COUNT],
    pub axis_target_positions: [i32; AXIS_COUNT],
    pub axis_position_mode: [bool; AXIS_COUNT],
    pub axis_homing_active: [bool; AXIS_COUNT],
    /// Max travel in mm; `None` for the brush, which has no limit.
    pub axis_soft_limit_max: [Option<f64>; AXIS_COUNT],
    pub axis_alarm_active: [bool; AXIS_COUNT],
    pub door_interlock_active: bool,
    pub auto_running: bool,
    pub auto_current_set: u32,
    pub auto_current_block: u32,
    pub auto_current_cycle: u32,
    pub auto_total_sets: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveValues {
    pub input_states: [bool; INPUT_COUNT],
    pub axis_positions: [i32; AXIS_COUNT],
}

/// Namespace marker for BBM Automatik V2 machines.
pub struct BbmAutomatikV2;

impl MachineNamespace for BbmAutomatikV2 {
    type State = State;
    type LiveValues = LiveValues;

    const KIND: &'static str = "bbm_automatik_v2";

    fn state_contract() -> Contract {
        Contract::event_data(
            client_core::ingestion::STATE_EVENT,
            Shape::object([
                ("output_states", bools(OUTPUT_COUNT)),
                ("axis_speeds", integers(AXIS_COUNT)),
                ("axis_target_speeds", integers(AXIS_COUNT)),
                ("axis_accelerations", numbers(AXIS_COUNT)),
                ("axis_target_positions", integers(AXIS_COUNT)),
                ("axis_position_mode", bools(AXIS_COUNT)),
                ("axis_homing_active", bools(AXIS_COUNT)),
                (
                    "axis_soft_limit_max",
                    Shape::tuple_of(Shape::nullable(Shape::Number), AXIS_COUNT),
                ),
                ("axis_alarm_active", bools(AXIS_COUNT)),
                ("door_interlock_active", Shape::Bool),
                ("auto_running", Shape::Bool),
                ("auto_current_set", Shape::Integer),
                ("auto_current_block", Shape::Integer),
                ("auto_current_cycle", Shape::Integer),
                ("auto_total_sets", Shape::Integer),
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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedPreset {
    Slow,
    Medium,
    Fast,
}

impl SpeedPreset {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Slow => "slow",
            Self::Medium => "medium",
            Self::Fast => "fast",
        }
    }
}

impl fmt::Display for SpeedPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpeedPreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "slow" => Ok(Self::Slow),
            "medium" => Ok(Self::Medium),
            "fast" => Ok(Self::Fast),
            other => Err(format!(
                "unknown speed preset '{other}' (expected slow, medium or fast)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", content = "value")]
pub enum Mutation {
    SetOutput { index: usize, on: bool },
    SetAllOutputs { on: bool },
    /// Raw pulse frequency in Hz.
    SetAxisSpeed { index: usize, speed: i32 },
    SetAxisSpeedMmS { index: usize, speed_mm_s: f64 },
    /// Brush only.
    SetAxisSpeedRpm { index: usize, rpm: f64 },
    SetAxisAcceleration { index: usize, accel_mm_s2: f64 },
    MoveToPosition {
        index: usize,
        position_mm: f64,
        speed_mm_s: f64,
    },
    StopAxis { index: usize },
    StopAllAxes,
    SetRuettelmotor { on: bool },
    SetAmpel { rot: bool, gelb: bool, gruen: bool },
    StartHoming { index: usize },
    CancelHoming { index: usize },
    StartAutoSequence { speed_preset: SpeedPreset, sets: u32 },
    StopAutoSequence,
}

fn predict_with(current: &State, apply: impl FnOnce(&mut State)) -> Option<State> {
    let mut next = current.clone();
    apply(&mut next);
    Some(next)
}

impl MachineCommand for Mutation {
    type State = State;

    fn action(&self) -> &'static str {
        match self {
            Self::SetOutput { .. } => "SetOutput",
            Self::SetAllOutputs { .. } => "SetAllOutputs",
            Self::SetAxisSpeed { .. } => "SetAxisSpeed",
            Self::SetAxisSpeedMmS { .. } => "SetAxisSpeedMmS",
            Self::SetAxisSpeedRpm { .. } => "SetAxisSpeedRpm",
            Self::SetAxisAcceleration { .. } => "SetAxisAcceleration",
            Self::MoveToPosition { .. } => "MoveToPosition",
            Self::StopAxis { .. } => "StopAxis",
            Self::StopAllAxes => "StopAllAxes",
            Self::SetRuettelmotor { .. } => "SetRuettelmotor",
            Self::SetAmpel { .. } => "SetAmpel",
            Self::StartHoming { .. } => "StartHoming",
            Self::CancelHoming { .. } => "CancelHoming",
            Self::StartAutoSequence { .. } => "StartAutoSequence",
            Self::StopAutoSequence => "StopAutoSequence",
        }
    }

    fn contract(&self) -> Contract {
        let value = match self {
            Self::SetOutput { .. } => Some(Shape::object([
                ("index", Shape::Integer),
                ("on", Shape::Bool),
            ])),
            Self::SetAllOutputs { .. } | Self::SetRuettelmotor { .. } => {
                Some(Shape::object([("on", Shape::Bool)]))
            }
            Self::SetAxisSpeed { .. } => Some(Shape::object([
                ("index", Shape::Integer),
                ("speed", Shape::Integer),
            ])),
            Self::SetAxisSpeedMmS { .. } => Some(Shape::object([
                ("index", Shape::Integer),
                ("speed_mm_s", Shape::Number),
            ])),
            Self::SetAxisSpeedRpm { .. } => Some(Shape::object([
                ("index", Shape::Integer),
                ("rpm", Shape::Number),
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
            Self::StopAxis { .. } | Self::StartHoming { .. } | Self::CancelHoming { .. } => {
                Some(Shape::object([("index", Shape::Integer)]))
            }
            Self::SetAmpel { .. } => Some(Shape::object([
                ("rot", Shape::Bool),
                ("gelb", Shape::Bool),
                ("gruen", Shape::Bool),
            ])),
            Self::StartAutoSequence { .. } => Some(Shape::object([
                ("speed_preset", Shape::Str),
                ("sets", Shape::Integer),
            ])),
            Self::StopAllAxes | Self::StopAutoSequence => None,
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
            | Self::SetAxisSpeedRpm { index, .. }
            | Self::SetAxisAcceleration { index, .. }
            | Self::MoveToPosition { index, .. }
            | Self::StopAxis { index }
            | Self::StartHoming { index }
            | Self::CancelHoming { index } => {
                check_index(self.action(), "index", *index, AXIS_COUNT)
            }
            _ => Ok(()),
        }
    }

    fn predict(&self, current: &State) -> Option<State> {
        match *self {
            Self::SetOutput { index, on } => {
                predict_with(current, |s| s.output_states[index] = on)
            }
            Self::SetAllOutputs { on } => {
                predict_with(current, |s| s.output_states = [on; OUTPUT_COUNT])
            }
            Self::SetAxisSpeed { index, speed } => {
                predict_with(current, |s| s.axis_speeds[index] = speed)
            }
            Self::SetAxisSpeedMmS { index, speed_mm_s } => predict_with(current, |s| {
                s.axis_speeds[index] = LINEAR.speed_to_hz(speed_mm_s)
            }),
            Self::SetAxisSpeedRpm { index, rpm } => {
                predict_with(current, |s| s.axis_speeds[index] = ROTARY.rpm_to_hz(rpm))
            }
            Self::SetAxisAcceleration { index, accel_mm_s2 } => predict_with(current, |s| {
                s.axis_accelerations[index] =
                    accel_mm_s2.clamp(MIN_ACCELERATION_MM_S2, MAX_ACCELERATION_MM_S2)
            }),
            Self::MoveToPosition {
                index, position_mm, ..
            } => predict_with(current, |s| {
                s.axis_target_positions[index] = LINEAR.position_to_pulses(position_mm);
                s.axis_position_mode[index] = true;
            }),
            Self::StopAxis { index } => predict_with(current, |s| {
                s.axis_speeds[index] = 0;
                s.axis_target_speeds[index] = 0;
            }),
            Self::StopAllAxes => predict_with(current, |s| {
                s.axis_speeds = [0; AXIS_COUNT];
                s.axis_target_speeds = [0; AXIS_COUNT];
            }),
            Self::SetRuettelmotor { on } => {
                predict_with(current, |s| s.output_states[output::RUETTELMOTOR] = on)
            }
            Self::SetAmpel { rot, gelb, gruen } => predict_with(current, |s| {
                s.output_states[output::AMPEL_ROT] = rot;
                s.output_states[output::AMPEL_GELB] = gelb;
                s.output_states[output::AMPEL_GRUEN] = gruen;
            }),
            Self::StartHoming { index } => {
                predict_with(current, |s| s.axis_homing_active[index] = true)
            }
            Self::CancelHoming { index } => {
                predict_with(current, |s| s.axis_homing_active[index] = false)
            }
            // Sequence progress is owned by the machine.
            Self::StartAutoSequence { .. } | Self::StopAutoSequence => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoProgress {
    pub set: u32,
    pub block: u32,
    pub cycle: u32,
    pub total_sets: u32,
}

/// Lifecycle of the automatic sequence as seen from consecutive states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AutoPhase {
    #[default]
    Idle,
    Running,
    Completed,
    Aborted,
}

impl AutoPhase {
    /// A run that stops having reached its last set counts as completed,
    /// anything earlier as aborted. Completed and Aborted persist until the
    /// next run starts.
    pub fn next(self, state: &State) -> Self {
        if state.auto_running {
            return Self::Running;
        }
        match self {
            Self::Running
                if state.auto_total_sets > 0
                    && state.auto_current_set >= state.auto_total_sets =>
            {
                Self::Completed
            }
            Self::Running => Self::Aborted,
            settled => settled,
        }
    }
}

pub struct BbmAutomatikV2Controller {
    controller: MachineController<BbmAutomatikV2>,
    phase: Store<AutoPhase>,
    _phase_binding: Subscription,
}

impl BbmAutomatikV2Controller {
    pub fn new(
        registry: &Arc<NamespaceRegistry>,
        serial: u16,
        transport: Arc<dyn MutationTransport>,
    ) -> Result<Self, RegistryError> {
        let handle =
            registry.get_or_create::<BbmAutomatikV2>(MachineKind::BbmAutomatikV2.namespace(serial))?;
        Ok(Self::from_handle(handle, transport))
    }

    pub fn from_handle(
        handle: NamespaceHandle<BbmAutomatikV2>,
        transport: Arc<dyn MutationTransport>,
    ) -> Self {
        let phase = Store::new(AutoPhase::Idle);
        let last_revision = Arc::new(AtomicU64::new(0));
        let track = {
            let phase = phase.clone();
            move |snapshot: &Arc<MachineStore<BbmAutomatikV2>>| {
                let Some(state) = snapshot.state_data() else {
                    return;
                };
                if last_revision.fetch_max(snapshot.state_revision, Ordering::AcqRel)
                    >= snapshot.state_revision
                {
                    return;
                }
                let current = *phase.get();
                let next = current.next(state);
                if next != current {
                    debug!(from = ?current, to = ?next, set = state.auto_current_set, "auto phase changed");
                    phase.replace(next);
                }
            }
        };
        let binding = handle.subscribe(track.clone());
        track(&handle.snapshot());

        Self {
            controller: MachineController::new(handle, transport),
            phase,
            _phase_binding: binding,
        }
    }

    pub fn controller(&self) -> &MachineController<BbmAutomatikV2> {
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

    /// Inverts the displayed output. `Ok(None)` while no state is known.
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

    pub fn set_axis_speed_rpm(&self, index: usize, rpm: f64) -> Result<DispatchHandle, CommandError> {
        self.controller
            .dispatch(Mutation::SetAxisSpeedRpm { index, rpm })
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

    pub fn stop_axis(&self, index: usize) -> Result<DispatchHandle, CommandError> {
        self.controller.dispatch(Mutation::StopAxis { index })
    }

    pub fn stop_all_axes(&self) -> Result<DispatchHandle, CommandError> {
        self.controller.dispatch(Mutation::StopAllAxes)
    }

    pub fn set_ruettelmotor(&self, on: bool) -> Result<DispatchHandle, CommandError> {
        self.controller.dispatch(Mutation::SetRuettelmotor { on })
    }

    pub fn set_ampel(
        &self,
        rot: bool,
        gelb: bool,
        gruen: bool,
    ) -> Result<DispatchHandle, CommandError> {
        self.controller
            .dispatch(Mutation::SetAmpel { rot, gelb, gruen })
    }

    pub fn start_homing(&self, index: usize) -> Result<DispatchHandle, CommandError> {
        self.controller.dispatch(Mutation::StartHoming { index })
    }

    pub fn cancel_homing(&self, index: usize) -> Result<DispatchHandle, CommandError> {
        self.controller.dispatch(Mutation::CancelHoming { index })
    }

    pub fn start_auto_sequence(
        &self,
        speed_preset: SpeedPreset,
        sets: u32,
    ) -> Result<DispatchHandle, CommandError> {
        self.controller
            .dispatch(Mutation::StartAutoSequence { speed_preset, sets })
    }

    pub fn stop_auto_sequence(&self) -> Result<DispatchHandle, CommandError> {
        self.controller.dispatch(Mutation::StopAutoSequence)
    }

    pub fn is_axis_homing(&self, index: usize) -> bool {
        self.state()
            .and_then(|s| s.axis_homing_active.get(index).copied())
            .unwrap_or(false)
    }

    pub fn axis_speed_mm_s(&self, index: usize) -> Option<f64> {
        let hz = *self.state()?.axis_speeds.get(index)?;
        Some(LINEAR.pulses_to_mm(hz))
    }

    pub fn axis_speed_rpm(&self, index: usize) -> Option<f64> {
        let hz = *self.state()?.axis_speeds.get(index)?;
        Some(ROTARY.hz_to_rpm(hz))
    }

    /// Measured position from live values.
    pub fn axis_position_mm(&self, index: usize) -> Option<f64> {
        let pulses = *self.live_values()?.axis_positions.get(index)?;
        Some(LINEAR.pulses_to_mm(pulses))
    }

    pub fn axis_acceleration(&self, index: usize) -> Option<f64> {
        self.state()?.axis_accelerations.get(index).copied()
    }

    /// `None` for the brush and until live values have arrived.
    pub fn is_at_reference(&self, axis: usize) -> Option<bool> {
        let switch = input::reference_switch(axis)?;
        Some(self.live_values()?.input_states[switch])
    }

    /// `false` until live values have arrived.
    pub fn are_doors_closed(&self) -> bool {
        self.live_values()
            .map(|live| live.input_states[input::TUER])
            .unwrap_or(false)
    }

    pub fn is_door_interlock_active(&self) -> bool {
        self.state().is_some_and(|s| s.door_interlock_active)
    }

    pub fn is_any_alarm_active(&self) -> bool {
        self.state()
            .is_some_and(|s| s.axis_alarm_active.iter().any(|alarm| *alarm))
    }

    pub fn is_auto_running(&self) -> bool {
        self.state().is_some_and(|s| s.auto_running)
    }

    pub fn auto_progress(&self) -> Option<AutoProgress> {
        self.state().map(|s| AutoProgress {
            set: s.auto_current_set,
            block: s.auto_current_block,
            cycle: s.auto_current_cycle,
            total_sets: s.auto_total_sets,
        })
    }

    pub fn auto_phase(&self) -> AutoPhase {
        *self.phase.get()
    }

    pub fn subscribe_auto_phase(
        &self,
        listener: impl Fn(&Arc<AutoPhase>) + Send + Sync + 'static,
    ) -> Subscription {
        self.phase.subscribe(listener)
    }

    pub fn can_start_auto(&self) -> bool {
        !self.is_disabled()
            && !self.is_auto_running()
            && !self.is_door_interlock_active()
            && !self.is_any_alarm_active()
    }
}

impl fmt::Debug for BbmAutomatikV2Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BbmAutomatikV2Controller")
            .field("controller", &self.controller)
            .field("auto_phase", &self.auto_phase())
            .finish()
    }
}

#[cfg(test)]
#[path = "tests/bbm_automatik_v2_tests.rs"]
mod tests;
