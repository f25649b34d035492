use tracing::debug;

use pvheater_common::HeaterOutput;

/// Physical levels for the enable lines. Both are active-low at the driver
/// board: logical "enabled" writes the pin low, and a floating/reset pin
/// reads high, i.e. disabled. This polarity is safety-relevant and must not
/// be normalized away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinLevels {
    pub scr_enable_pin_high: bool,
    pub pump_enable_pin_high: bool,
    pub pwm_duty: u16,
}

impl PinLevels {
    pub fn from_output(output: &HeaterOutput) -> Self {
        Self {
            scr_enable_pin_high: !output.scr_enabled,
            pump_enable_pin_high: !output.pump_enabled,
            pwm_duty: output.pwm_duty,
        }
    }
}

/// Applies engine output to the hardware and reports whether anything
/// changed, so the loop can mirror state to the binding without spamming it.
#[derive(Debug, Default)]
pub struct Actuator {
    last: Option<HeaterOutput>,
}

impl Actuator {
    pub fn apply(&mut self, output: &HeaterOutput) -> bool {
        let changed = self.last.as_ref() != Some(output);
        if changed {
            let levels = PinLevels::from_output(output);
            // Hardware integration point: write the PWM channel and the two
            // enable GPIOs here on the target build.
            debug!(
                duty = levels.pwm_duty,
                scr_pin_high = levels.scr_enable_pin_high,
                pump_pin_high = levels.pump_enable_pin_high,
                state = output.state.as_str(),
                "actuation update"
            );
            self.last = Some(*output);
        }
        changed
    }
}
