use super::*;
use serde_json::json;

fn all_mutations() -> Vec<Mutation> {
    vec![
        Mutation::SetOutput { index: 1, on: true },
        Mutation::SetAllOutputs { on: false },
        Mutation::SetAxisSpeed {
            index: 0,
            speed: 1000,
        },
        Mutation::SetAxisSpeedMmS {
            index: 0,
            speed_mm_s: 50.0,
        },
        Mutation::SetAxisSpeedRpm {
            index: axis::BUERSTE,
            rpm: 60.0,
        },
        Mutation::SetAxisAcceleration {
            index: 2,
            accel_mm_s2: 250.0,
        },
        Mutation::MoveToPosition {
            index: 1,
            position_mm: 12.5,
            speed_mm_s: 40.0,
        },
        Mutation::StopAxis { index: 3 },
        Mutation::StopAllAxes,
        Mutation::SetRuettelmotor { on: true },
        Mutation::SetAmpel {
            rot: true,
            gelb: false,
            gruen: true,
        },
        Mutation::StartHoming { index: 0 },
        Mutation::CancelHoming { index: 0 },
        Mutation::StartAutoSequence {
            speed_preset: SpeedPreset::Medium,
            sets: 5,
        },
        Mutation::StopAutoSequence,
    ]
}

fn running_state() -> State {
    State {
        axis_speeds: [1000, 800, 600, 200],
        axis_target_speeds: [1000, 800, 600, 200],
        axis_accelerations: [DEFAULT_ACCELERATION_MM_S2; AXIS_COUNT],
        axis_soft_limit_max: [Some(230.0), Some(53.0), Some(107.0), None],
        ..State::default()
    }
}

#[test]
fn every_mutation_satisfies_its_own_contract() {
    for mutation in all_mutations() {
        let envelope = serde_json::to_value(&mutation).expect("serialize");
        assert_eq!(envelope["action"], mutation.action());
        mutation
            .contract()
            .check(&envelope)
            .unwrap_or_else(|err| panic!("{}: {err}", mutation.action()));
        mutation.check_bounds().expect("in range");
    }
}

#[test]
fn envelopes_match_wire_format() {
    assert_eq!(
        serde_json::to_value(Mutation::SetAxisSpeedMmS {
            index: 0,
            speed_mm_s: 50.0
        })
        .expect("serialize"),
        json!({ "action": "SetAxisSpeedMmS", "value": { "index": 0, "speed_mm_s": 50.0 } })
    );
    assert_eq!(
        serde_json::to_value(Mutation::StopAllAxes).expect("serialize"),
        json!({ "action": "StopAllAxes" })
    );
    assert_eq!(
        serde_json::to_value(Mutation::StartAutoSequence {
            speed_preset: SpeedPreset::Fast,
            sets: 2
        })
        .expect("serialize"),
        json!({ "action": "StartAutoSequence", "value": { "speed_preset": "fast", "sets": 2 } })
    );
}

#[test]
fn speed_in_mm_s_is_predicted_as_pulses() {
    let next = Mutation::SetAxisSpeedMmS {
        index: axis::MT,
        speed_mm_s: 50.0,
    }
    .predict(&State::default())
    .expect("prediction");

    assert_eq!(next.axis_speeds, [1000, 0, 0, 0]);
}

#[test]
fn brush_rpm_is_predicted_as_hz() {
    let next = Mutation::SetAxisSpeedRpm {
        index: axis::BUERSTE,
        rpm: MAX_SPEED_RPM,
    }
    .predict(&State::default())
    .expect("prediction");

    assert_eq!(next.axis_speeds[axis::BUERSTE], 333);
}

#[test]
fn move_to_position_sets_target_and_position_mode() {
    let next = Mutation::MoveToPosition {
        index: axis::DRUECKER,
        position_mm: 107.0,
        speed_mm_s: 20.0,
    }
    .predict(&State::default())
    .expect("prediction");

    assert_eq!(next.axis_target_positions[axis::DRUECKER], 2140);
    assert!(next.axis_position_mode[axis::DRUECKER]);
    assert_eq!(next.axis_speeds, [0; AXIS_COUNT]);
}

#[test]
fn fractional_inputs_predict_what_the_machine_reports() {
    let speed = Mutation::SetAxisSpeedMmS {
        index: axis::SCHIEBER,
        speed_mm_s: 12.53,
    }
    .predict(&State::default())
    .expect("prediction");
    assert_eq!(speed.axis_speeds[axis::SCHIEBER], 250);

    let rpm = Mutation::SetAxisSpeedRpm {
        index: axis::BUERSTE,
        rpm: 0.45,
    }
    .predict(&State::default())
    .expect("prediction");
    assert_eq!(rpm.axis_speeds[axis::BUERSTE], 1);

    let position = Mutation::MoveToPosition {
        index: axis::DRUECKER,
        position_mm: 12.5,
        speed_mm_s: 20.0,
    }
    .predict(&State::default())
    .expect("prediction");
    assert_eq!(position.axis_target_positions[axis::DRUECKER], 260);
}

#[test]
fn acceleration_prediction_is_clamped_to_machine_limits() {
    let predict = |accel_mm_s2| {
        Mutation::SetAxisAcceleration {
            index: axis::MT,
            accel_mm_s2,
        }
        .predict(&State::default())
        .expect("prediction")
        .axis_accelerations[axis::MT]
    };

    assert_eq!(predict(1.0), MIN_ACCELERATION_MM_S2);
    assert_eq!(predict(250.0), 250.0);
    assert_eq!(predict(9000.0), MAX_ACCELERATION_MM_S2);
}

#[test]
fn brush_has_no_reference_switch() {
    assert_eq!(input::reference_switch(axis::MT), Some(input::REF_MT));
    assert_eq!(input::reference_switch(axis::DRUECKER), Some(input::REF_DRUECKER));
    assert_eq!(input::reference_switch(axis::BUERSTE), None);
    assert_eq!(axis_name(axis::BUERSTE), Some("Bürste"));
    assert_eq!(axis_name(AXIS_COUNT), None);
}

#[test]
fn stop_commands_zero_speed_and_target_speed() {
    let one = Mutation::StopAxis { index: axis::SCHIEBER }
        .predict(&running_state())
        .expect("prediction");
    assert_eq!(one.axis_speeds, [1000, 0, 600, 200]);
    assert_eq!(one.axis_target_speeds, [1000, 0, 600, 200]);

    let all = Mutation::StopAllAxes
        .predict(&running_state())
        .expect("prediction");
    assert_eq!(all.axis_speeds, [0; AXIS_COUNT]);
    assert_eq!(all.axis_target_speeds, [0; AXIS_COUNT]);
    assert_eq!(all.axis_soft_limit_max, running_state().axis_soft_limit_max);
}

#[test]
fn convenience_outputs_map_to_fixed_indices() {
    let next = Mutation::SetAmpel {
        rot: true,
        gelb: false,
        gruen: true,
    }
    .predict(&State::default())
    .expect("prediction");
    assert_eq!(
        next.output_states,
        [false, true, false, true, false, false, false, false]
    );

    let next = Mutation::SetRuettelmotor { on: true }
        .predict(&next)
        .expect("prediction");
    assert!(next.output_states[output::RUETTELMOTOR]);
}

#[test]
fn homing_flags_follow_start_and_cancel() {
    let homing = Mutation::StartHoming { index: axis::MT }
        .predict(&State::default())
        .expect("prediction");
    assert_eq!(homing.axis_homing_active, [true, false, false, false]);

    let cancelled = Mutation::CancelHoming { index: axis::MT }
        .predict(&homing)
        .expect("prediction");
    assert_eq!(cancelled.axis_homing_active, [false; AXIS_COUNT]);
}

#[test]
fn auto_sequence_commands_are_not_predicted() {
    let state = running_state();
    assert_eq!(
        Mutation::StartAutoSequence {
            speed_preset: SpeedPreset::Slow,
            sets: 1
        }
        .predict(&state),
        None
    );
    assert_eq!(Mutation::StopAutoSequence.predict(&state), None);
}

#[test]
fn out_of_range_indices_are_rejected() {
    let err = Mutation::SetAxisSpeed {
        index: AXIS_COUNT,
        speed: 1,
    }
    .check_bounds()
    .expect_err("axis out of range");
    assert!(matches!(
        err,
        CommandError::OutOfRange {
            action: "SetAxisSpeed",
            len: AXIS_COUNT,
            ..
        }
    ));

    Mutation::SetOutput { index: 7, on: true }
        .check_bounds()
        .expect("last output");
    Mutation::SetOutput { index: 8, on: true }
        .check_bounds()
        .expect_err("output out of range");
}

#[test]
fn state_contract_accepts_server_payload() {
    let payload = json!({
        "output_states": vec![false; 8],
        "axis_speeds": [0, 0, 0, 0],
        "axis_target_speeds": [0, 0, 0, 0],
        "axis_accelerations": [100.0, 100.0, 100.0, 100.0],
        "axis_target_positions": [0, -20, 0, 0],
        "axis_position_mode": vec![false; 4],
        "axis_homing_active": vec![false; 4],
        "axis_soft_limit_max": [230.0, 53.0, 107.0, null],
        "axis_alarm_active": vec![false; 4],
        "door_interlock_active": false,
        "auto_running": false,
        "auto_current_set": 0,
        "auto_current_block": 0,
        "auto_current_cycle": 0,
        "auto_total_sets": 0
    });

    let state: State = BbmAutomatikV2::state_contract()
        .parse(payload)
        .expect("valid payload");
    assert_eq!(state.axis_target_positions[1], -20);
    assert_eq!(state.axis_soft_limit_max[3], None);
}

#[test]
fn state_contract_requires_sequence_fields() {
    let mut payload = serde_json::to_value(State::default()).expect("serialize");
    payload
        .as_object_mut()
        .expect("object")
        .remove("auto_total_sets");

    let err = BbmAutomatikV2::state_contract()
        .check(&payload)
        .expect_err("missing field");
    assert_eq!(err.path, "data.auto_total_sets");
}

fn phase_after(states: &[(bool, u32, u32)]) -> AutoPhase {
    states
        .iter()
        .fold(AutoPhase::Idle, |phase, &(running, set, total)| {
            phase.next(&State {
                auto_running: running,
                auto_current_set: set,
                auto_total_sets: total,
                ..State::default()
            })
        })
}

#[test]
fn auto_phase_follows_run_lifecycle() {
    assert_eq!(phase_after(&[(false, 0, 0)]), AutoPhase::Idle);
    assert_eq!(phase_after(&[(true, 1, 5)]), AutoPhase::Running);
    assert_eq!(
        phase_after(&[(true, 4, 5), (true, 5, 5), (false, 5, 5)]),
        AutoPhase::Completed
    );
    assert_eq!(
        phase_after(&[(true, 2, 5), (false, 2, 5)]),
        AutoPhase::Aborted
    );
    assert_eq!(
        phase_after(&[(true, 2, 5), (false, 2, 5), (false, 0, 0)]),
        AutoPhase::Aborted
    );
    assert_eq!(
        phase_after(&[(true, 5, 5), (false, 5, 5), (true, 1, 3)]),
        AutoPhase::Running
    );
}

#[test]
fn speed_presets_parse_case_insensitively() {
    assert_eq!("Fast".parse::<SpeedPreset>(), Ok(SpeedPreset::Fast));
    assert!("turbo".parse::<SpeedPreset>().is_err());
}
