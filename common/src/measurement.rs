use std::collections::VecDeque;

/// Number of 16-bit registers spanned by one float value.
pub const METER_REGISTER_LEN: u16 = 2;

/// SDM-style input register map.
pub const REG_ACTIVE_POWER: u16 = 0x0034;
pub const REG_IMPORT_ENERGY: u16 = 0x0048;

/// Correlates an asynchronous meter read with its later response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeterToken {
    /// Active power drawn by the heating element (local meter).
    LocalPower,
    /// Cumulative import energy of the heating element (local meter).
    LocalConsumption,
    /// Signed house import/export power (house meter).
    RemotePower,
}

impl MeterToken {
    pub fn register(self) -> u16 {
        match self {
            Self::LocalPower | Self::RemotePower => REG_ACTIVE_POWER,
            Self::LocalConsumption => REG_IMPORT_ENERGY,
        }
    }
}

/// Two consecutive big-endian registers form one IEEE-754 float32.
pub fn decode_float32_be(words: [u16; 2]) -> f32 {
    f32::from_bits(((words[0] as u32) << 16) | words[1] as u32)
}

pub fn encode_float32_be(value: f32) -> [u16; 2] {
    let bits = value.to_bits();
    [(bits >> 16) as u16, bits as u16]
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub value: f32,
    pub at_ms: u64,
}

impl Sample {
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.at_ms)
    }
}

/// Last valid reading per channel. A failed read never overwrites a cached
/// value; stale-but-valid data is preferred over an artificial zero.
#[derive(Debug, Clone, Default)]
pub struct Measurement {
    temperature_in: Option<Sample>,
    temperature_out: Option<Sample>,
    current_power: Option<Sample>,
    house_power: Option<Sample>,
    consumption: Option<Sample>,
    flow_rate: Option<Sample>,
}

impl Measurement {
    pub fn set_temperature_in(&mut self, value: f32, now_ms: u64) {
        self.temperature_in = Some(Sample { value, at_ms: now_ms });
    }

    pub fn set_temperature_out(&mut self, value: f32, now_ms: u64) {
        self.temperature_out = Some(Sample { value, at_ms: now_ms });
    }

    pub fn set_current_power(&mut self, value: f32, now_ms: u64) {
        self.current_power = Some(Sample { value, at_ms: now_ms });
    }

    pub fn set_house_power(&mut self, value: f32, now_ms: u64) {
        self.house_power = Some(Sample { value, at_ms: now_ms });
    }

    pub fn set_consumption(&mut self, value: f32, now_ms: u64) {
        self.consumption = Some(Sample { value, at_ms: now_ms });
    }

    pub fn set_flow_rate(&mut self, value: f32, now_ms: u64) {
        self.flow_rate = Some(Sample { value, at_ms: now_ms });
    }

    pub fn temperature_in(&self) -> Option<f32> {
        self.temperature_in.map(|s| s.value)
    }

    pub fn temperature_out(&self) -> Option<f32> {
        self.temperature_out.map(|s| s.value)
    }

    pub fn current_power(&self) -> Option<f32> {
        self.current_power.map(|s| s.value)
    }

    pub fn house_power(&self) -> Option<f32> {
        self.house_power.map(|s| s.value)
    }

    pub fn consumption(&self) -> Option<f32> {
        self.consumption.map(|s| s.value)
    }

    pub fn flow_rate(&self) -> Option<f32> {
        self.flow_rate.map(|s| s.value)
    }

    pub fn current_power_sample(&self) -> Option<Sample> {
        self.current_power
    }

    pub fn house_power_sample(&self) -> Option<Sample> {
        self.house_power
    }
}

/// Bounded queue of outstanding meter reads. When the peer stops answering
/// and the backlog hits the cap, the queue is cleared and restarted; there is
/// no per-request retry or backoff.
#[derive(Debug)]
pub struct RequestQueue {
    pending: VecDeque<MeterToken>,
    cap: usize,
}

impl RequestQueue {
    pub const DEFAULT_CAP: usize = 10;

    pub fn new(cap: usize) -> Self {
        Self {
            pending: VecDeque::with_capacity(cap),
            cap,
        }
    }

    /// Returns false if the backlog overflowed and was cleared; the pushed
    /// token becomes the first entry of the restarted queue.
    pub fn push(&mut self, token: MeterToken) -> bool {
        if self.pending.len() >= self.cap {
            self.pending.clear();
            self.pending.push_back(token);
            return false;
        }
        self.pending.push_back(token);
        true
    }

    pub fn pop(&mut self) -> Option<MeterToken> {
        self.pending.pop_front()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAP)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn decodes_big_endian_float() {
        // 1000.0 == 0x447A0000
        assert_eq!(decode_float32_be([0x447A, 0x0000]), 1_000.0);
        // -2000.0 == 0xC4FA0000
        assert_eq!(decode_float32_be([0xC4FA, 0x0000]), -2_000.0);
    }

    #[test]
    fn encodes_big_endian_float() {
        assert_eq!(encode_float32_be(1_000.0), [0x447A, 0x0000]);
    }

    #[test]
    fn token_register_mapping() {
        assert_eq!(MeterToken::LocalPower.register(), REG_ACTIVE_POWER);
        assert_eq!(MeterToken::RemotePower.register(), REG_ACTIVE_POWER);
        assert_eq!(MeterToken::LocalConsumption.register(), REG_IMPORT_ENERGY);
    }

    #[test]
    fn queue_overflow_clears_and_restarts() {
        let mut queue = RequestQueue::default();
        for _ in 0..RequestQueue::DEFAULT_CAP {
            assert!(queue.push(MeterToken::LocalPower));
        }
        assert_eq!(queue.len(), 10);

        assert!(!queue.push(MeterToken::RemotePower));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(), Some(MeterToken::RemotePower));
    }

    #[test]
    fn failed_read_keeps_last_value() {
        let mut measurement = Measurement::default();
        measurement.set_house_power(-1_200.0, 1_000);

        // No setter call on a read error; the cached sample survives.
        assert_eq!(measurement.house_power(), Some(-1_200.0));
        let sample = measurement.house_power_sample().unwrap();
        assert_eq!(sample.age_ms(11_000), 10_000);
    }
}
