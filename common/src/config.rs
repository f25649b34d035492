use serde::{Deserialize, Serialize};

/// Fixed controller parameters. The target has no reliable non-volatile
/// storage, so every boot starts from these defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaterConfig {
    pub fast_interval_ms: u64,
    pub slow_interval_ms: u64,
    pub publish_interval_ms: u64,

    /// PWM counts written to the SCR driver, 0..=duty_max.
    pub duty_max: u16,
    pub duty_step: u16,

    pub target_temp_min_c: f32,
    pub target_temp_max_c: f32,
    /// Hard over-temperature cutoff on either probe.
    pub hard_cutoff_c: f32,
    /// Temp lock releases only this far below the target.
    pub temp_release_margin_c: f32,

    /// Consecutive sentinel readings before the critical sensor fault.
    pub sensor_fault_limit: u8,

    /// Fast ticks of insufficient export before power lock engages.
    pub power_lock_set_ticks: u32,
    /// Fast ticks of sustained export before power lock releases.
    pub power_lock_clear_ticks: u32,

    /// Meter samples older than this freeze duty instead of stepping it.
    pub meter_stale_timeout_ms: u64,
}

impl Default for HeaterConfig {
    fn default() -> Self {
        Self {
            fast_interval_ms: 500,
            slow_interval_ms: 2_000,
            publish_interval_ms: 1_000,
            duty_max: 254,
            duty_step: 1,
            target_temp_min_c: 45.0,
            target_temp_max_c: 60.0,
            hard_cutoff_c: 62.0,
            temp_release_margin_c: 5.0,
            sensor_fault_limit: 6,
            power_lock_set_ticks: 120,
            power_lock_clear_ticks: 20,
            meter_stale_timeout_ms: 10_000,
        }
    }
}

/// User-adjustable limits, mutated only through the command setters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    pub target_temperature_c: f32,
    pub max_power_w: f32,
    pub min_power_w: f32,
    pub max_consume_kwh: f32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            target_temperature_c: 50.0,
            max_power_w: 6_000.0,
            min_power_w: 500.0,
            max_consume_kwh: 5.0,
        }
    }
}

impl Limits {
    pub fn sanitize(&mut self) {
        self.target_temperature_c = self.target_temperature_c.clamp(45.0, 60.0);
        self.max_power_w = self.max_power_w.clamp(2_000.0, 6_000.0);
        self.min_power_w = self.min_power_w.clamp(0.0, 2_000.0);
        self.max_consume_kwh = self.max_consume_kwh.clamp(1.0, 10.0);
    }
}
