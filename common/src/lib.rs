pub mod config;
pub mod heater;
pub mod interlock;
pub mod measurement;
pub mod topics;
pub mod types;

pub use config::{HeaterConfig, Limits};
pub use heater::{HeaterEngine, HeaterOutput};
pub use interlock::{InterlockEvaluator, LockReason, SENSOR_FAULT_SENTINEL_C};
pub use measurement::{Measurement, MeterToken, RequestQueue, Sample};
pub use topics::*;
pub use types::{HeaterMode, HeaterStatePayload, ParseModeError, RegulationState};
