use crate::types::SensorKind;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub value: f32,
    pub observed_at_ms: u64,
}

/// Last known power and temperature readings. A reading older than the
/// staleness window reads as `None`, never as its last value.
#[derive(Debug, Clone)]
pub struct SensorCache {
    stale_timeout_ms: u64,
    power: Option<SensorReading>,
    temperature: Option<SensorReading>,
}

impl SensorCache {
    pub fn new(stale_timeout_ms: u64) -> Self {
        Self {
            stale_timeout_ms,
            power: None,
            temperature: None,
        }
    }

    /// Returns false when the value is not a finite number and was dropped.
    pub fn record(&mut self, kind: SensorKind, value: f32, at_ms: u64) -> bool {
        if !value.is_finite() {
            return false;
        }
        let reading = Some(SensorReading {
            value,
            observed_at_ms: at_ms,
        });
        match kind {
            SensorKind::Power => self.power = reading,
            SensorKind::Temperature => self.temperature = reading,
        }
        true
    }

    pub fn record_power(&mut self, value: f32, at_ms: u64) -> bool {
        self.record(SensorKind::Power, value, at_ms)
    }

    pub fn record_temperature(&mut self, value: f32, at_ms: u64) -> bool {
        self.record(SensorKind::Temperature, value, at_ms)
    }

    pub fn power(&self, now_ms: u64) -> Option<f32> {
        self.power_reading(now_ms).map(|r| r.value)
    }

    pub fn temperature(&self, now_ms: u64) -> Option<f32> {
        self.fresh(self.temperature, now_ms).map(|r| r.value)
    }

    /// Fresh power reading together with the time it was observed.
    pub fn power_reading(&self, now_ms: u64) -> Option<SensorReading> {
        self.fresh(self.power, now_ms)
    }

    fn fresh(&self, reading: Option<SensorReading>, now_ms: u64) -> Option<SensorReading> {
        reading.filter(|r| now_ms.saturating_sub(r.observed_at_ms) < self.stale_timeout_ms)
    }
}
