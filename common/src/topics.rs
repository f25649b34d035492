pub const TOPIC_PROBE_TEMP_IN: &str = "pvheater/probe/temperature_in";
pub const TOPIC_PROBE_TEMP_OUT: &str = "pvheater/probe/temperature_out";
pub const TOPIC_PROBE_FLOW: &str = "pvheater/probe/flow";
pub const TOPIC_PROBE_STATUS: &str = "pvheater/probe/status";

pub const TOPIC_HEATER_STATE: &str = "pvheater/controller/state";
pub const TOPIC_SCR_STATE: &str = "pvheater/controller/scr";
pub const TOPIC_PUMP_STATE: &str = "pvheater/controller/pump";

pub const TOPIC_CMD_TARGET: &str = "pvheater/cmnd/target";
pub const TOPIC_CMD_MODE: &str = "pvheater/cmnd/mode";
pub const TOPIC_CMD_MAX_POWER: &str = "pvheater/cmnd/max_power";
pub const TOPIC_CMD_MIN_POWER: &str = "pvheater/cmnd/min_power";
pub const TOPIC_CMD_CONSUME_MAX: &str = "pvheater/cmnd/consume_max";
pub const TOPIC_CMD_CONSUME_START: &str = "pvheater/cmnd/consume_start";
pub const TOPIC_CMD_MANUAL_DUTY: &str = "pvheater/cmnd/manual_duty";
pub const TOPIC_CMD_FAULT_RESET: &str = "pvheater/cmnd/fault_reset";
