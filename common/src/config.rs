use serde::{Deserialize, Serialize};

/// Power draw above which the heater is considered on.
pub const POWER_ON_THRESHOLD: f32 = 10.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaterConfig {
    pub min_temp: f32,
    pub max_temp: f32,
    pub default_temp: f32,
    /// 0 disables the off-timer.
    pub off_timer_minutes: u32,
    /// Raised by `sanitize` to at least one second past
    /// `failsafe_recheck_delay_ms` so a heater that ignored the off toggle is
    /// not re-adopted as an auto-on.
    pub auto_on_cooldown_ms: u64,
    pub failsafe_recheck_delay_ms: u64,
    pub drift_deadband: f32,
    pub drift_check_interval_ms: u64,
    pub min_correction_interval_ms: u64,
    pub sensor_stale_timeout_ms: u64,
    pub min_action_spacing_ms: u64,
}

impl Default for HeaterConfig {
    fn default() -> Self {
        Self {
            min_temp: 16.0,
            max_temp: 30.0,
            default_temp: 20.0,
            off_timer_minutes: 30,
            auto_on_cooldown_ms: 90_000,
            failsafe_recheck_delay_ms: 60_000,
            drift_deadband: 1.0,
            drift_check_interval_ms: 120_000,
            min_correction_interval_ms: 240_000,
            sensor_stale_timeout_ms: 600_000,
            min_action_spacing_ms: 1_000,
        }
    }
}

impl HeaterConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();

        if !self.min_temp.is_finite()
            || !self.max_temp.is_finite()
            || self.min_temp >= self.max_temp
        {
            self.min_temp = defaults.min_temp;
            self.max_temp = defaults.max_temp;
        }
        if !self.default_temp.is_finite() {
            self.default_temp = defaults.default_temp;
        }
        self.default_temp = self.clamp_target(self.default_temp);

        if !self.drift_deadband.is_finite() || self.drift_deadband < 0.0 {
            self.drift_deadband = defaults.drift_deadband;
        }

        self.min_action_spacing_ms = self.min_action_spacing_ms.max(1_000);
        self.drift_check_interval_ms = self.drift_check_interval_ms.max(1_000);
        self.sensor_stale_timeout_ms = self.sensor_stale_timeout_ms.max(1_000);

        let cooldown_floor = self.failsafe_recheck_delay_ms.saturating_add(1_000);
        self.auto_on_cooldown_ms = self.auto_on_cooldown_ms.max(cooldown_floor);
    }

    pub fn clamp_target(&self, value: f32) -> f32 {
        value.clamp(self.min_temp, self.max_temp)
    }

    /// Restored targets outside the configured range are discarded, not clamped.
    pub fn restore_target(&self, value: f32) -> f32 {
        if value.is_finite() && (self.min_temp..=self.max_temp).contains(&value) {
            value
        } else {
            self.default_temp
        }
    }

    pub fn off_timer_ms(&self) -> Option<u64> {
        (self.off_timer_minutes > 0).then(|| u64::from(self.off_timer_minutes) * 60_000)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EntityConfig {
    pub entity_name: String,
    pub toggle_action: String,
    pub step_up_action: String,
    pub step_down_action: String,
    pub power_sensor: String,
    pub temperature_sensor: String,
}

impl Default for EntityConfig {
    fn default() -> Self {
        Self {
            entity_name: "My Heater".to_string(),
            toggle_action: "myheater/action/toggle".to_string(),
            step_up_action: "myheater/action/temp_up".to_string(),
            step_down_action: "myheater/action/temp_down".to_string(),
            power_sensor: "myheater/sensor/power".to_string(),
            temperature_sensor: "myheater/sensor/temperature".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub heater: HeaterConfig,
    #[serde(default)]
    pub entity: EntityConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}
