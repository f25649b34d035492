use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Operating strategy. "Off" is not a mode: the home-automation binding maps
/// it to standby instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HeaterMode {
    /// Burn a fixed energy budget per session, capped at the power ceiling.
    Consume,
    /// Zero-export tracking of the house meter.
    Dynamic,
}

impl HeaterMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Consume => "CONSUME",
            Self::Dynamic => "DYNAMIC",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown mode command: {0:?}")]
pub struct ParseModeError(pub String);

impl FromStr for HeaterMode {
    type Err = ParseModeError;

    // HA climate modes: Heat selects the consume strategy, Auto the
    // zero-export strategy. Off is handled by the binding as standby.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HEAT" | "CONSUME" => Ok(Self::Consume),
            "AUTO" | "DYNAMIC" => Ok(Self::Dynamic),
            other => Err(ParseModeError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegulationState {
    SafeShutdown,
    TempLocked,
    PowerLimited,
    Regulating,
}

impl RegulationState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SafeShutdown => "SAFE_SHUTDOWN",
            Self::TempLocked => "TEMP_LOCKED",
            Self::PowerLimited => "POWER_LIMITED",
            Self::Regulating => "REGULATING",
        }
    }
}

/// Retained telemetry payload for the home-automation binding.
#[derive(Debug, Clone, Serialize)]
pub struct HeaterStatePayload {
    pub power: f32,
    pub duty: u16,
    pub flow: f32,
    #[serde(rename = "tempIn")]
    pub temp_in: f32,
    #[serde(rename = "tempOut")]
    pub temp_out: f32,
    pub consumption: f32,
    pub standby: bool,
    pub mode: &'static str,
    pub state: &'static str,
    pub fault: Option<&'static str>,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_ha_mode_commands() {
        assert_eq!("HEAT".parse::<HeaterMode>(), Ok(HeaterMode::Consume));
        assert_eq!("auto".parse::<HeaterMode>(), Ok(HeaterMode::Dynamic));
        assert!("COOL".parse::<HeaterMode>().is_err());
    }

    #[test]
    fn payload_serializes_camel_case() {
        let payload = HeaterStatePayload {
            power: 1_500.0,
            duty: 120,
            flow: 4.2,
            temp_in: 31.5,
            temp_out: 44.0,
            consumption: 3.25,
            standby: false,
            mode: HeaterMode::Dynamic.as_str(),
            state: RegulationState::Regulating.as_str(),
            fault: None,
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["tempIn"], 31.5);
        assert_eq!(json["state"], "REGULATING");
        assert_eq!(json["fault"], serde_json::Value::Null);
    }
}
