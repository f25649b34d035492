use serde::Serialize;

use crate::config::HeaterConfig;

/// DS18B20 power-on/bus-glitch reading. A probe reporting exactly this value
/// has not produced a real conversion result.
pub const SENSOR_FAULT_SENTINEL_C: f32 = 85.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockReason {
    Critical,
    TempLock,
    Standby,
    PowerLock,
}

/// Decides each fast tick whether actuation is permitted.
///
/// Owns the two pieces of guard state that need history: the bounded sentinel
/// fault counter and the temp-lock hysteresis latch.
#[derive(Debug, Default)]
pub struct InterlockEvaluator {
    sensor_faults: u8,
    decay_phase: bool,
    temp_locked: bool,
}

impl InterlockEvaluator {
    /// Filters one raw probe reading. The sentinel is not a valid measurement
    /// and must not feed the over-temperature comparison; it advances the
    /// bounded fault counter instead. Non-finite readings are discarded
    /// without counting.
    pub fn record_temperature(&mut self, value: f32, config: &HeaterConfig) -> Option<f32> {
        if !value.is_finite() {
            return None;
        }
        if value == SENSOR_FAULT_SENTINEL_C {
            if self.sensor_faults < config.sensor_fault_limit {
                self.sensor_faults += 1;
            }
            return None;
        }
        Some(value)
    }

    /// The counter reached its cap: repeated bus glitches become a critical
    /// fault, distinct from a plain over-temperature.
    pub fn sensor_fault_critical(&self, config: &HeaterConfig) -> bool {
        self.sensor_faults >= config.sensor_fault_limit
    }

    pub fn sensor_fault_count(&self) -> u8 {
        self.sensor_faults
    }

    /// Called once per slow tick. The fault counter decays by one every
    /// second call, tolerating transient glitches without manual reset.
    pub fn decay_tick(&mut self) {
        if self.sensor_faults == 0 {
            self.decay_phase = false;
            return;
        }
        if self.decay_phase {
            self.sensor_faults -= 1;
        }
        self.decay_phase = !self.decay_phase;
    }

    pub fn reset_faults(&mut self) {
        self.sensor_faults = 0;
        self.decay_phase = false;
    }

    /// Hard cutoff on either probe. Only valid (sentinel-filtered) readings
    /// reach this comparison.
    pub fn is_over_temp(
        temp_in: Option<f32>,
        temp_out: Option<f32>,
        config: &HeaterConfig,
    ) -> bool {
        let over = |t: Option<f32>| t.is_some_and(|v| v >= config.hard_cutoff_c);
        over(temp_in) || over(temp_out)
    }

    /// True iff the outlet temperature is a known, valid reading below the
    /// target. An unknown reading cannot confirm "low enough" and fails
    /// toward not running.
    pub fn is_temp_too_low(temp_out: Option<f32>, target_c: f32) -> bool {
        temp_out.is_some_and(|v| v.is_finite() && v < target_c)
    }

    /// Advances the temp-lock latch and returns its state. Locks when the
    /// outlet cannot be confirmed below the target; releases only once it has
    /// dropped the full margin below, so the output does not chatter at the
    /// threshold.
    pub fn update_temp_lock(
        &mut self,
        temp_out: Option<f32>,
        target_c: f32,
        config: &HeaterConfig,
    ) -> bool {
        if self.temp_locked {
            let released =
                temp_out.is_some_and(|v| v.is_finite() && v < target_c - config.temp_release_margin_c);
            if released {
                self.temp_locked = false;
            }
        } else if !Self::is_temp_too_low(temp_out, target_c) {
            self.temp_locked = true;
        }
        self.temp_locked
    }

    pub fn is_temp_locked(&self) -> bool {
        self.temp_locked
    }

    /// Local power ceiling. When exceeded, the controller ratchets duty down
    /// regardless of mode.
    pub fn local_power_limit_exceeded(current_power: f32, max_power: f32) -> bool {
        current_power > max_power
    }
}
