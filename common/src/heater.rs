use crate::config::{HeaterConfig, Limits};
use crate::interlock::{InterlockEvaluator, LockReason};
use crate::measurement::Measurement;
use crate::types::{HeaterMode, HeaterStatePayload, RegulationState};

/// Desired output state for one fast tick, consumed by the actuation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaterOutput {
    pub pwm_duty: u16,
    pub scr_enabled: bool,
    pub pump_enabled: bool,
    pub state: RegulationState,
    pub reason: Option<LockReason>,
}

#[derive(Debug, Clone, Copy)]
struct ConsumeSession {
    start_kwh: f32,
}

/// The duty-cycle controller. One instance, owned by the control loop; every
/// mutation happens from that single logical context.
#[derive(Debug)]
pub struct HeaterEngine {
    pub config: HeaterConfig,
    limits: Limits,
    mode: HeaterMode,
    standby: bool,
    critical: bool,
    fault_title: Option<&'static str>,
    power_lock: bool,
    duty: u16,
    manual_duty: Option<u16>,
    state: RegulationState,
    measurement: Measurement,
    session: Option<ConsumeSession>,
    interlock: InterlockEvaluator,
    import_ticks: u32,
    export_ticks: u32,
}

impl HeaterEngine {
    pub fn new(config: HeaterConfig) -> Self {
        let mut limits = Limits::default();
        limits.sanitize();
        Self {
            config,
            limits,
            mode: HeaterMode::Consume,
            standby: true,
            critical: false,
            fault_title: None,
            power_lock: false,
            duty: 0,
            manual_duty: None,
            state: RegulationState::SafeShutdown,
            measurement: Measurement::default(),
            session: None,
            interlock: InterlockEvaluator::default(),
            import_ticks: 0,
            export_ticks: 0,
        }
    }

    pub fn mode(&self) -> HeaterMode {
        self.mode
    }

    pub fn is_standby(&self) -> bool {
        self.standby
    }

    pub fn is_faulted(&self) -> bool {
        self.critical
    }

    pub fn duty(&self) -> u16 {
        self.duty
    }

    pub fn state(&self) -> RegulationState {
        self.state
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Runs the interlock chain and one regulation step. Evaluation order is
    /// strict: critical/standby, temp lock, local power ceiling, then the
    /// mode algorithm.
    pub fn tick(&mut self, now_ms: u64) -> HeaterOutput {
        self.latch_faults();

        if self.critical || self.standby {
            return self.safe_shutdown_output();
        }

        let locked = self.interlock.update_temp_lock(
            self.measurement.temperature_out(),
            self.limits.target_temperature_c,
            &self.config,
        );
        if locked {
            self.duty = 0;
            self.state = RegulationState::TempLocked;
            // SCR drops out, but the pump keeps circulating so the outlet
            // probe sees falling water temperature and the lock can release.
            return HeaterOutput {
                pwm_duty: 0,
                scr_enabled: false,
                pump_enabled: true,
                state: self.state,
                reason: Some(LockReason::TempLock),
            };
        }

        if let Some(power) = self.measurement.current_power() {
            if InterlockEvaluator::local_power_limit_exceeded(power, self.limits.max_power_w) {
                self.duty = self.duty.saturating_sub(self.config.duty_step);
                self.state = RegulationState::PowerLimited;
                return HeaterOutput {
                    pwm_duty: self.duty,
                    scr_enabled: true,
                    pump_enabled: true,
                    state: self.state,
                    reason: Some(LockReason::PowerLock),
                };
            }
        }

        self.state = RegulationState::Regulating;
        match self.mode {
            HeaterMode::Dynamic => self.regulate_dynamic(now_ms),
            HeaterMode::Consume => self.regulate_consume(now_ms),
        }

        // Budget exhaustion or power lock may have forced the safe state.
        if self.standby {
            return self.safe_shutdown_output();
        }
        if self.power_lock {
            self.duty = 0;
            self.state = RegulationState::SafeShutdown;
            return HeaterOutput {
                pwm_duty: 0,
                scr_enabled: false,
                pump_enabled: false,
                state: self.state,
                reason: Some(LockReason::PowerLock),
            };
        }

        HeaterOutput {
            pwm_duty: self.duty,
            scr_enabled: true,
            pump_enabled: true,
            state: self.state,
            reason: None,
        }
    }

    /// Called once per slow interval for counter decay.
    pub fn on_slow_tick(&mut self) {
        self.interlock.decay_tick();
    }

    fn latch_faults(&mut self) {
        if self.critical {
            return;
        }
        if self.interlock.sensor_fault_critical(&self.config) {
            self.raise_fault("temperature sensor fault");
        } else if InterlockEvaluator::is_over_temp(
            self.measurement.temperature_in(),
            self.measurement.temperature_out(),
            &self.config,
        ) {
            self.raise_fault("overtemperature cutoff");
        }
    }

    fn raise_fault(&mut self, title: &'static str) {
        self.critical = true;
        self.fault_title = Some(title);
        self.enter_standby();
    }

    fn enter_standby(&mut self) {
        self.standby = true;
        self.duty = 0;
        self.session = None;
    }

    fn safe_shutdown_output(&mut self) -> HeaterOutput {
        self.duty = 0;
        self.state = RegulationState::SafeShutdown;
        let reason = if self.critical {
            LockReason::Critical
        } else {
            LockReason::Standby
        };
        // Manual test mode: in standby the override may drive the PWM line
        // while the SCR enable stays off, so no power can flow.
        let pwm = match (self.standby && !self.critical, self.manual_duty) {
            (true, Some(value)) => value,
            _ => 0,
        };
        HeaterOutput {
            pwm_duty: pwm,
            scr_enabled: false,
            pump_enabled: false,
            state: self.state,
            reason: Some(reason),
        }
    }

    /// Zero-export tracking: step toward consuming exactly the surplus. A
    /// plain bounded step (not PI control) is intentional; the SCR plant and
    /// the meter sampling latency make step-and-settle more robust than a
    /// continuous controller.
    fn regulate_dynamic(&mut self, now_ms: u64) {
        let Some(sample) = self.measurement.house_power_sample() else {
            return;
        };
        if sample.age_ms(now_ms) > self.config.meter_stale_timeout_ms {
            // Stale reading: freeze duty rather than step on old data.
            return;
        }

        let exporting_enough = sample.value <= -self.limits.min_power_w;
        if exporting_enough {
            self.import_ticks = 0;
            self.export_ticks = self.export_ticks.saturating_add(1);
            if self.power_lock && self.export_ticks >= self.config.power_lock_clear_ticks {
                self.power_lock = false;
            }
            if !self.power_lock {
                self.duty = (self.duty + self.config.duty_step).min(self.config.duty_max);
            }
        } else {
            self.export_ticks = 0;
            self.import_ticks = self.import_ticks.saturating_add(1);
            self.duty = self.duty.saturating_sub(self.config.duty_step);
            if self.import_ticks >= self.config.power_lock_set_ticks {
                // Sustained lack of surplus: park the output without the
                // user-visible standby, so generation returning resumes it.
                self.power_lock = true;
            }
        }
    }

    /// Fixed-budget session: regulate at the power ceiling until the energy
    /// counter has advanced by the budget, then fall back to standby.
    fn regulate_consume(&mut self, now_ms: u64) {
        let Some(session) = self.session else {
            self.duty = 0;
            return;
        };

        let consumed = self
            .measurement
            .consumption()
            .unwrap_or(session.start_kwh);
        if consumed >= session.start_kwh + self.limits.max_consume_kwh {
            self.enter_standby();
            return;
        }

        self.regulate_max_power(now_ms);
    }

    fn regulate_max_power(&mut self, now_ms: u64) {
        let Some(sample) = self.measurement.current_power_sample() else {
            return;
        };
        if sample.age_ms(now_ms) > self.config.meter_stale_timeout_ms {
            return;
        }

        if sample.value > self.limits.max_power_w {
            self.duty = self.duty.saturating_sub(self.config.duty_step);
        } else if !self.power_lock {
            self.duty = (self.duty + self.config.duty_step).min(self.config.duty_max);
        }
    }

    // Command setters, invoked synchronously from the binding dispatch.

    pub fn set_mode(&mut self, mode: HeaterMode) -> bool {
        if self.mode == mode {
            return false;
        }
        self.mode = mode;
        // No carry-over across strategies.
        self.duty = 0;
        self.session = None;
        self.power_lock = false;
        self.import_ticks = 0;
        self.export_ticks = 0;
        true
    }

    pub fn set_standby(&mut self, cond: bool) {
        if cond {
            self.enter_standby();
        } else {
            self.standby = false;
            self.manual_duty = None;
        }
    }

    /// The consume session only starts from within Consume mode; the command
    /// is a no-op otherwise.
    pub fn start_consume(&mut self, _now_ms: u64) -> bool {
        if self.mode != HeaterMode::Consume || self.critical {
            return false;
        }
        self.session = Some(ConsumeSession {
            start_kwh: self.measurement.consumption().unwrap_or(0.0),
        });
        self.standby = false;
        self.manual_duty = None;
        true
    }

    pub fn set_target_temperature(&mut self, value: f32) -> bool {
        let clamped = value.clamp(self.config.target_temp_min_c, self.config.target_temp_max_c);
        if (self.limits.target_temperature_c - clamped).abs() > f32::EPSILON {
            self.limits.target_temperature_c = clamped;
            true
        } else {
            false
        }
    }

    pub fn set_max_power(&mut self, value: f32) -> bool {
        let clamped = value.clamp(2_000.0, 6_000.0);
        if (self.limits.max_power_w - clamped).abs() > f32::EPSILON {
            self.limits.max_power_w = clamped;
            true
        } else {
            false
        }
    }

    pub fn set_min_power(&mut self, value: f32) -> bool {
        let clamped = value.clamp(0.0, 2_000.0);
        if (self.limits.min_power_w - clamped).abs() > f32::EPSILON {
            self.limits.min_power_w = clamped;
            true
        } else {
            false
        }
    }

    pub fn set_max_consume(&mut self, value: f32) -> bool {
        let clamped = value.clamp(1.0, 10.0);
        if (self.limits.max_consume_kwh - clamped).abs() > f32::EPSILON {
            self.limits.max_consume_kwh = clamped;
            true
        } else {
            false
        }
    }

    /// Manual PWM override for bench testing, honored only while in standby
    /// and not faulted.
    pub fn set_manual_duty(&mut self, value: u16) -> bool {
        if !self.standby || self.critical {
            return false;
        }
        self.manual_duty = Some(value.min(self.config.duty_max));
        true
    }

    /// Clears a latched critical fault (long press / command). The device
    /// stays in standby until explicitly restarted.
    pub fn clear_fault(&mut self) {
        self.critical = false;
        self.fault_title = None;
        self.interlock.reset_faults();
    }

    // Measurement ingest. Probe readings pass the sentinel filter; meter
    // values arrive pre-decoded from the Modbus layer.

    pub fn update_temperature_in(&mut self, value: f32, now_ms: u64) {
        if let Some(value) = self.interlock.record_temperature(value, &self.config) {
            self.measurement.set_temperature_in(value, now_ms);
        }
    }

    pub fn update_temperature_out(&mut self, value: f32, now_ms: u64) {
        if let Some(value) = self.interlock.record_temperature(value, &self.config) {
            self.measurement.set_temperature_out(value, now_ms);
        }
    }

    pub fn update_temperatures(&mut self, temp_in: f32, temp_out: f32, now_ms: u64) {
        self.update_temperature_in(temp_in, now_ms);
        self.update_temperature_out(temp_out, now_ms);
    }

    pub fn update_current_power(&mut self, watts: f32, now_ms: u64) {
        self.measurement.set_current_power(watts, now_ms);
    }

    pub fn update_house_power(&mut self, watts: f32, now_ms: u64) {
        self.measurement.set_house_power(watts, now_ms);
    }

    pub fn update_consumption(&mut self, kwh: f32, now_ms: u64) {
        self.measurement.set_consumption(kwh, now_ms);
    }

    pub fn update_flow_rate(&mut self, litres_per_min: f32, now_ms: u64) {
        self.measurement.set_flow_rate(litres_per_min, now_ms);
    }

    pub fn state_payload(&self) -> HeaterStatePayload {
        HeaterStatePayload {
            power: self.measurement.current_power().unwrap_or(0.0),
            duty: self.duty,
            flow: self.measurement.flow_rate().unwrap_or(0.0),
            temp_in: self.measurement.temperature_in().unwrap_or(0.0),
            temp_out: self.measurement.temperature_out().unwrap_or(0.0),
            consumption: self.measurement.consumption().unwrap_or(0.0),
            standby: self.standby,
            mode: self.mode.as_str(),
            state: self.state.as_str(),
            fault: self.fault_title,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::interlock::SENSOR_FAULT_SENTINEL_C;

    fn engine() -> HeaterEngine {
        HeaterEngine::new(HeaterConfig::default())
    }

    /// Running engine in Dynamic mode with sane temperatures.
    fn running_dynamic() -> HeaterEngine {
        let mut engine = engine();
        engine.set_mode(HeaterMode::Dynamic);
        engine.set_standby(false);
        engine.update_temperatures(28.0, 35.0, 0);
        engine
    }

    #[test]
    fn standby_forces_duty_zero_and_scr_off() {
        let mut engine = running_dynamic();
        engine.update_house_power(-2_000.0, 0);
        for _ in 0..10 {
            engine.tick(100);
        }
        assert!(engine.duty() > 0);

        engine.set_standby(true);
        let out = engine.tick(200);

        assert_eq!(engine.duty(), 0);
        assert!(!out.scr_enabled);
        assert!(!out.pump_enabled);
        assert_eq!(out.state, RegulationState::SafeShutdown);
        assert_eq!(out.reason, Some(LockReason::Standby));
    }

    #[test]
    fn dynamic_duty_saturates_at_max_without_oscillation() {
        let mut engine = running_dynamic();
        engine.update_house_power(-2_000.0, 0);

        for _ in 0..300 {
            engine.tick(100);
        }
        assert_eq!(engine.duty(), engine.config.duty_max);

        // Saturated: repeated steps are idempotent at the boundary.
        let out = engine.tick(100);
        assert_eq!(out.pwm_duty, engine.config.duty_max);
        assert_eq!(out.state, RegulationState::Regulating);
    }

    #[test]
    fn dynamic_insufficient_export_ratchets_down_to_zero() {
        let mut engine = running_dynamic();
        engine.update_house_power(-2_000.0, 0);
        for _ in 0..20 {
            engine.tick(100);
        }
        assert_eq!(engine.duty(), 20);

        // Exporting less than min_power counts as insufficient generation.
        engine.update_house_power(-100.0, 100);
        for _ in 0..25 {
            engine.tick(200);
        }
        assert_eq!(engine.duty(), 0);
        assert!(!engine.is_standby());
    }

    #[test]
    fn sustained_import_engages_power_lock_not_standby() {
        let mut engine = running_dynamic();
        engine.update_house_power(800.0, 0);

        let mut out = engine.tick(100);
        for _ in 0..engine.config.power_lock_set_ticks {
            out = engine.tick(100);
        }

        assert_eq!(out.state, RegulationState::SafeShutdown);
        assert_eq!(out.reason, Some(LockReason::PowerLock));
        assert!(!engine.is_standby());
    }

    #[test]
    fn power_lock_releases_after_sustained_export() {
        let mut engine = running_dynamic();
        engine.update_house_power(800.0, 0);
        for _ in 0..=engine.config.power_lock_set_ticks {
            engine.tick(100);
        }

        engine.update_house_power(-2_000.0, 200);
        let clear_ticks = engine.config.power_lock_clear_ticks;
        for _ in 0..clear_ticks {
            engine.tick(300);
        }
        let out = engine.tick(300);

        assert_eq!(out.state, RegulationState::Regulating);
        assert!(out.pwm_duty > 0);
    }

    #[test]
    fn stale_house_power_freezes_duty() {
        let mut engine = running_dynamic();
        engine.update_house_power(-2_000.0, 0);
        for _ in 0..10 {
            engine.tick(100);
        }
        let held = engine.duty();

        // Sample is now older than the staleness deadline.
        let late = engine.config.meter_stale_timeout_ms + 1_000;
        for _ in 0..10 {
            engine.tick(late);
        }
        assert_eq!(engine.duty(), held);
    }

    #[test]
    fn sentinel_trips_critical_exactly_on_sixth_reading() {
        let mut engine = running_dynamic();
        engine.update_house_power(-2_000.0, 0);

        for _ in 0..5 {
            engine.update_temperatures(28.0, SENSOR_FAULT_SENTINEL_C, 100);
        }
        let out = engine.tick(100);
        assert!(!engine.is_faulted());
        assert_eq!(out.state, RegulationState::Regulating);

        engine.update_temperatures(28.0, SENSOR_FAULT_SENTINEL_C, 200);
        let out = engine.tick(200);
        assert!(engine.is_faulted());
        assert!(engine.is_standby());
        assert_eq!(out.state, RegulationState::SafeShutdown);
        assert_eq!(out.reason, Some(LockReason::Critical));
    }

    #[test]
    fn sentinel_counter_decays_between_bursts() {
        let mut engine = running_dynamic();
        engine.update_house_power(-2_000.0, 0);

        for _ in 0..5 {
            engine.update_temperatures(28.0, SENSOR_FAULT_SENTINEL_C, 100);
        }
        // Two slow intervals decay the counter by one.
        engine.on_slow_tick();
        engine.on_slow_tick();

        engine.update_temperatures(28.0, SENSOR_FAULT_SENTINEL_C, 200);
        engine.tick(200);
        assert!(!engine.is_faulted());
    }

    #[test]
    fn sentinel_does_not_count_as_over_temperature() {
        let mut engine = running_dynamic();
        engine.update_house_power(-2_000.0, 0);

        // 85.0 exceeds the 62 degree cutoff numerically, but it is a bus
        // glitch, not a measurement.
        engine.update_temperatures(28.0, SENSOR_FAULT_SENTINEL_C, 100);
        engine.tick(100);
        assert!(!engine.is_faulted());
    }

    #[test]
    fn hard_overtemp_latches_critical_fault() {
        let mut engine = running_dynamic();
        engine.update_temperatures(28.0, 62.5, 100);
        let out = engine.tick(100);

        assert!(engine.is_faulted());
        assert_eq!(out.reason, Some(LockReason::Critical));
        assert_eq!(engine.state_payload().fault, Some("overtemperature cutoff"));

        // Cleared only by the explicit reset; stays in standby after.
        engine.clear_fault();
        assert!(!engine.is_faulted());
        assert!(engine.is_standby());
    }

    #[test]
    fn temp_lock_holds_until_hysteresis_release() {
        let mut engine = running_dynamic();
        engine.set_target_temperature(60.0);
        engine.update_house_power(-2_000.0, 0);

        engine.update_temperatures(40.0, 60.0, 100);
        let out = engine.tick(100);
        assert_eq!(out.state, RegulationState::TempLocked);
        assert_eq!(out.pwm_duty, 0);
        assert!(!out.scr_enabled);
        assert!(out.pump_enabled);

        engine.update_temperatures(40.0, 56.0, 200);
        assert_eq!(engine.tick(200).state, RegulationState::TempLocked);

        engine.update_temperatures(40.0, 54.5, 300);
        assert_eq!(engine.tick(300).state, RegulationState::Regulating);
    }

    #[test]
    fn unknown_outlet_temperature_blocks_heating() {
        let mut engine = engine();
        engine.set_mode(HeaterMode::Dynamic);
        engine.set_standby(false);
        engine.update_house_power(-2_000.0, 0);

        // No probe reading yet: cannot confirm the water is cool enough.
        let out = engine.tick(100);
        assert_eq!(out.state, RegulationState::TempLocked);
        assert_eq!(out.pwm_duty, 0);
    }

    #[test]
    fn local_power_ceiling_overrides_mode_logic() {
        let mut engine = running_dynamic();
        engine.update_house_power(-2_000.0, 0);
        for _ in 0..50 {
            engine.tick(100);
        }
        let before = engine.duty();

        engine.update_current_power(6_500.0, 200);
        let out = engine.tick(200);
        assert_eq!(out.state, RegulationState::PowerLimited);
        assert_eq!(out.pwm_duty, before - 1);
    }

    #[test]
    fn consume_budget_keeps_regulating_below_threshold() {
        let mut engine = engine();
        engine.update_temperatures(28.0, 35.0, 0);
        engine.set_max_consume(5.0);
        engine.update_consumption(10.0, 0);
        assert!(engine.start_consume(0));

        engine.update_current_power(3_000.0, 0);
        engine.update_consumption(14.9, 100);
        let out = engine.tick(100);

        assert_eq!(out.state, RegulationState::Regulating);
        assert!(!engine.is_standby());
    }

    #[test]
    fn consume_budget_exhaustion_forces_standby() {
        let mut engine = engine();
        engine.update_temperatures(28.0, 35.0, 0);
        engine.set_max_consume(5.0);
        engine.update_consumption(10.0, 0);
        assert!(engine.start_consume(0));

        engine.update_consumption(15.0, 100);
        let out = engine.tick(100);

        assert!(engine.is_standby());
        assert_eq!(engine.duty(), 0);
        assert_eq!(out.state, RegulationState::SafeShutdown);
    }

    #[test]
    fn consume_regulates_toward_power_ceiling() {
        let mut engine = engine();
        engine.update_temperatures(28.0, 35.0, 0);
        engine.update_consumption(0.0, 0);
        assert!(engine.start_consume(0));

        engine.update_current_power(3_000.0, 100);
        engine.tick(100);
        assert_eq!(engine.duty(), 1);

        // Over the ceiling: PowerLimited takes over and ratchets down.
        engine.update_current_power(6_500.0, 200);
        let out = engine.tick(200);
        assert_eq!(out.state, RegulationState::PowerLimited);
        assert_eq!(engine.duty(), 0);
    }

    #[test]
    fn start_consume_requires_consume_mode() {
        let mut engine = engine();
        engine.set_mode(HeaterMode::Dynamic);
        assert!(!engine.start_consume(0));
        assert!(engine.is_standby());
    }

    #[test]
    fn mode_switch_zeroes_duty_and_session() {
        let mut engine = running_dynamic();
        engine.update_house_power(-2_000.0, 0);
        for _ in 0..30 {
            engine.tick(100);
        }
        assert!(engine.duty() > 0);

        assert!(engine.set_mode(HeaterMode::Consume));
        assert_eq!(engine.duty(), 0);

        // Without a started session, Consume mode does not actuate.
        engine.update_current_power(0.0, 200);
        let out = engine.tick(200);
        assert_eq!(out.pwm_duty, 0);
    }

    #[test]
    fn manual_duty_only_honored_in_standby() {
        let mut engine = engine();
        assert!(engine.set_manual_duty(80));
        let out = engine.tick(100);
        assert_eq!(out.pwm_duty, 80);
        assert!(!out.scr_enabled);

        engine.set_mode(HeaterMode::Dynamic);
        engine.set_standby(false);
        assert!(!engine.set_manual_duty(80));
    }

    #[test]
    fn setters_clamp_at_boundary() {
        let mut engine = engine();
        engine.set_target_temperature(90.0);
        assert_eq!(engine.limits().target_temperature_c, 60.0);
        engine.set_max_power(100.0);
        assert_eq!(engine.limits().max_power_w, 2_000.0);
        engine.set_max_consume(50.0);
        assert_eq!(engine.limits().max_consume_kwh, 10.0);
    }
}
