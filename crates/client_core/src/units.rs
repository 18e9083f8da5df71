//! Engineering-unit conversions at the machine boundary.
//!
//! Machines store raw pulse counts (positions) and pulse frequencies in Hz
//! (speeds). Conversions to raw units reproduce the machine's own arithmetic:
//! single precision, truncated toward zero, saturating at the `i32` range.
//! A prediction built with them equals the state the machine later reports.

/// Linear axis driven through a ball screw.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearScale {
    pub pulses_per_mm: f64,
}

impl LinearScale {
    pub const fn new(pulses_per_mm: f64) -> Self {
        Self { pulses_per_mm }
    }

    /// mm/s → pulse frequency in Hz.
    pub fn speed_to_hz(&self, mm_per_s: f64) -> i32 {
        truncate(mm_per_s as f32 * self.pulses_per_mm as f32)
    }

    /// Target position in pulses. Positioning works in whole millimetres.
    pub fn position_to_pulses(&self, mm: f64) -> i32 {
        truncate((mm as f32).round() * self.pulses_per_mm as f32)
    }

    pub fn pulses_to_mm(&self, pulses: i32) -> f64 {
        f64::from(pulses) / self.pulses_per_mm
    }
}

/// Rotation axis without a screw: speed is set in revolutions per minute.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RotaryScale {
    pub pulses_per_rev: f64,
}

impl RotaryScale {
    pub const fn new(pulses_per_rev: f64) -> Self {
        Self { pulses_per_rev }
    }

    pub fn rpm_to_hz(&self, rpm: f64) -> i32 {
        truncate(rpm as f32 * self.pulses_per_rev as f32 / 60.0)
    }

    pub fn hz_to_rpm(&self, hz: i32) -> f64 {
        f64::from(hz) * 60.0 / self.pulses_per_rev
    }
}

fn truncate(value: f32) -> i32 {
    // `as` truncates, saturates and maps NaN to 0.
    value as i32
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const LINEAR: LinearScale = LinearScale::new(20.0);
    const ROTARY: RotaryScale = RotaryScale::new(200.0);

    #[test]
    fn converts_known_values() {
        assert_eq!(LINEAR.speed_to_hz(50.0), 1000);
        assert_eq!(LINEAR.speed_to_hz(230.0), 4600);
        assert_eq!(LINEAR.position_to_pulses(107.0), 2140);
        assert_eq!(LINEAR.pulses_to_mm(1000), 50.0);
        assert_eq!(ROTARY.rpm_to_hz(60.0), 200);
        assert_eq!(ROTARY.rpm_to_hz(100.0), 333);
        assert_eq!(ROTARY.hz_to_rpm(200), 60.0);
    }

    #[test]
    fn speeds_truncate_toward_zero() {
        assert_eq!(LINEAR.speed_to_hz(12.53), 250);
        assert_eq!(LINEAR.speed_to_hz(0.049), 0);
        assert_eq!(LINEAR.speed_to_hz(-12.53), -250);
        // 0.45 rpm * 200 / 60 = 1.5 Hz
        assert_eq!(ROTARY.rpm_to_hz(0.45), 1);
        assert_eq!(ROTARY.rpm_to_hz(-0.45), -1);
    }

    #[test]
    fn positions_snap_to_whole_millimetres() {
        assert_eq!(LINEAR.position_to_pulses(12.5), 260);
        assert_eq!(LINEAR.position_to_pulses(12.49), 240);
        assert_eq!(LINEAR.position_to_pulses(-0.5), -20);
        assert_eq!(LINEAR.position_to_pulses(0.025), 0);
    }

    #[test]
    fn saturates_out_of_range_inputs() {
        assert_eq!(LINEAR.speed_to_hz(f64::INFINITY), i32::MAX);
        assert_eq!(LINEAR.speed_to_hz(f64::NEG_INFINITY), i32::MIN);
        assert_eq!(LINEAR.speed_to_hz(f64::NAN), 0);
        assert_eq!(LINEAR.position_to_pulses(1e12), i32::MAX);
    }

    #[test]
    fn reported_raw_values_convert_back_unchanged() {
        for hz in [-4600, -20, 0, 20, 1000, 4600] {
            assert_eq!(LINEAR.speed_to_hz(LINEAR.pulses_to_mm(hz)), hz);
        }
        for hz in [0, 200, 600] {
            assert_eq!(ROTARY.rpm_to_hz(ROTARY.hz_to_rpm(hz)), hz);
        }
    }

    proptest! {
        #[test]
        fn speed_within_one_pulse_below_input(speed in 0.0f64..500.0) {
            let back = LINEAR.pulses_to_mm(LINEAR.speed_to_hz(speed));
            prop_assert!(back <= speed + 1e-3);
            prop_assert!(speed - back <= 1.0 / LINEAR.pulses_per_mm + 1e-3);
        }

        #[test]
        fn position_is_a_whole_millimetre(mm in -500.0f64..500.0) {
            let back = LINEAR.pulses_to_mm(LINEAR.position_to_pulses(mm));
            prop_assert_eq!(back, back.round());
            prop_assert!((back - mm).abs() <= 0.5 + 1e-3);
        }

        #[test]
        fn rpm_within_one_pulse_of_input(rpm in -100.0f64..100.0) {
            let back = ROTARY.hz_to_rpm(ROTARY.rpm_to_hz(rpm));
            prop_assert!((back - rpm).abs() <= 60.0 / ROTARY.pulses_per_rev + 1e-3);
        }
    }
}
