pub const TOPIC_HEATER_STATE: &str = "myheater/state";
pub const TOPIC_SENSOR_STATUS: &str = "myheater/sensor/status";

pub const TOPIC_CMD_MODE: &str = "myheater/cmnd/mode";
pub const TOPIC_CMD_TARGET: &str = "myheater/cmnd/target";
pub const TOPIC_CMD_TIMER: &str = "myheater/cmnd/timer";

/// Payload published on an action topic to fire the action.
pub const ACTION_TRIGGER_PAYLOAD: &str = "TRIGGER";
