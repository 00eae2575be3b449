use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HeaterMode {
    Off,
    Heat,
}

impl HeaterMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::Heat => "HEAT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "HEAT" => Some(Self::Heat),
            "OFF" => Some(Self::Off),
            _ => None,
        }
    }
}

/// One-way trigger sent to the heater. `Toggle` flips power; two toggles
/// flip it twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HeaterAction {
    Toggle,
    StepUp,
    StepDown,
}

impl HeaterAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Toggle => "TOGGLE",
            Self::StepUp => "STEP_UP",
            Self::StepDown => "STEP_DOWN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    Power,
    Temperature,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeaterStatus {
    #[serde(rename = "entityName")]
    pub entity_name: String,
    pub mode: &'static str,
    #[serde(rename = "targetTemp")]
    pub target_temp: f32,
    #[serde(rename = "currentTemp")]
    pub current_temp: Option<f32>,
    #[serde(rename = "powerUsage")]
    pub power_usage: Option<f32>,
    #[serde(rename = "heaterOn")]
    pub heater_on: Option<bool>,
    #[serde(rename = "minTemp")]
    pub min_temp: f32,
    #[serde(rename = "maxTemp")]
    pub max_temp: f32,
    #[serde(rename = "offTimerMinutes")]
    pub off_timer_minutes: u32,
    #[serde(rename = "offTimerRemainingMs")]
    pub off_timer_remaining_ms: Option<u64>,
    #[serde(rename = "failsafePending")]
    pub failsafe_pending: bool,
    #[serde(rename = "lastCorrectionAgoMs")]
    pub last_correction_ago_ms: Option<u64>,
}
