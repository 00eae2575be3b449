use tracing::{debug, info, warn};

use crate::{
    actuator::{ActionSink, ActuatorGateway, Dispatch},
    config::{EntityConfig, HeaterConfig, POWER_ON_THRESHOLD},
    sensor::SensorCache,
    store::{PersistedState, StateStore},
    timer::{TimerFired, TimerKind, Timers},
    types::{HeaterAction, HeaterMode, HeaterStatus, SensorKind},
};

/// Inputs to the engine. Sensor pushes, user commands and timer firings are
/// all funneled through [`HeaterEngine::handle`] one at a time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HeaterEvent {
    Sensor { kind: SensorKind, value: f32 },
    SetMode(HeaterMode),
    SetTargetTemperature(f32),
    SetOffTimerMinutes(u32),
    Timer(TimerFired),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClimateState {
    pub mode: HeaterMode,
    pub target_temperature: f32,
    pub last_manual_off_ms: Option<u64>,
    pub last_correction_ms: Option<u64>,
    pub heat_started_ms: Option<u64>,
}

pub struct HeaterEngine<S, A> {
    config: HeaterConfig,
    entity_name: String,
    state: ClimateState,
    sensors: SensorCache,
    gateway: ActuatorGateway<A>,
    timers: Timers,
    store: S,
}

impl<S: StateStore, A: ActionSink> HeaterEngine<S, A> {
    pub fn new(
        mut config: HeaterConfig,
        entity: &EntityConfig,
        store: S,
        sink: A,
        now_ms: u64,
    ) -> Self {
        config.sanitize();

        let restored = match store.load() {
            Ok(Some(persisted)) => Some(persisted),
            Ok(None) => {
                info!("no persisted heater state, starting OFF");
                None
            }
            Err(err) => {
                warn!("failed to load persisted heater state: {err}");
                None
            }
        };
        let (mode, target_temperature) = match restored {
            Some(persisted) => (
                persisted.mode,
                config.restore_target(persisted.target_temperature),
            ),
            None => (HeaterMode::Off, config.default_temp),
        };

        let mut engine = Self {
            sensors: SensorCache::new(config.sensor_stale_timeout_ms),
            gateway: ActuatorGateway::new(sink, entity, config.min_action_spacing_ms),
            entity_name: entity.entity_name.clone(),
            state: ClimateState {
                mode,
                target_temperature,
                last_manual_off_ms: None,
                last_correction_ms: None,
                heat_started_ms: None,
            },
            timers: Timers::new(),
            store,
            config,
        };

        if mode == HeaterMode::Heat {
            info!("restored HEAT mode, resuming heat activities");
            engine.start_heat_activities(now_ms);
        }
        engine
    }

    pub fn config(&self) -> &HeaterConfig {
        &self.config
    }

    pub fn state(&self) -> &ClimateState {
        &self.state
    }

    pub fn mode(&self) -> HeaterMode {
        self.state.mode
    }

    pub fn target_temperature(&self) -> f32 {
        self.state.target_temperature
    }

    pub fn sensors(&self) -> &SensorCache {
        &self.sensors
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn sink(&self) -> &A {
        self.gateway.sink()
    }

    pub fn sink_mut(&mut self) -> &mut A {
        self.gateway.sink_mut()
    }

    pub fn off_timer_deadline_ms(&self) -> Option<u64> {
        self.timers.deadline_ms(TimerKind::OffTimer)
    }

    pub fn failsafe_recheck_at_ms(&self) -> Option<u64> {
        self.timers.deadline_ms(TimerKind::FailsafeRecheck)
    }

    pub fn next_timer_deadline_ms(&self) -> Option<u64> {
        self.timers.next_deadline_ms()
    }

    pub fn take_due_timers(&mut self, now_ms: u64) -> Vec<TimerFired> {
        self.timers.take_due(now_ms)
    }

    /// Processes one event. Issues at most one actuator call and returns
    /// whether the climate state changed.
    pub fn handle(&mut self, event: HeaterEvent, now_ms: u64) -> bool {
        match event {
            HeaterEvent::Sensor { kind, value } => self.update_sensor(kind, value, now_ms),
            HeaterEvent::SetMode(mode) => self.set_mode(mode, now_ms),
            HeaterEvent::SetTargetTemperature(value) => self.set_target_temperature(value, now_ms),
            HeaterEvent::SetOffTimerMinutes(minutes) => self.set_off_timer_minutes(minutes, now_ms),
            HeaterEvent::Timer(fired) => self.on_timer(fired, now_ms),
        }
    }

    pub fn update_sensor(&mut self, kind: SensorKind, value: f32, now_ms: u64) -> bool {
        if !self.sensors.record(kind, value, now_ms) {
            warn!("dropping non-finite {kind:?} reading");
            return false;
        }
        if kind == SensorKind::Power {
            return self.detect_external_power_on(now_ms);
        }
        false
    }

    pub fn set_mode(&mut self, mode: HeaterMode, now_ms: u64) -> bool {
        if self.state.mode == mode {
            return false;
        }

        match mode {
            HeaterMode::Heat => {
                match self.sensors.power(now_ms) {
                    Some(power) if power > POWER_ON_THRESHOLD => {
                        info!("heater already drawing {power:.1}, entering HEAT without toggle");
                    }
                    _ => {
                        self.gateway.toggle_power(now_ms);
                    }
                }
                self.state.mode = HeaterMode::Heat;
                self.start_heat_activities(now_ms);
                self.persist();
                info!("mode set to HEAT");
            }
            HeaterMode::Off => {
                self.turn_off(now_ms);
                info!("mode set to OFF");
            }
        }
        true
    }

    /// Saturates to the configured range and steps the heater once in the
    /// direction of the change. The target only moves when the step was sent.
    pub fn set_target_temperature(&mut self, value: f32, now_ms: u64) -> bool {
        if !value.is_finite() {
            warn!("ignoring non-finite target temperature");
            return false;
        }
        let clamped = self.config.clamp_target(value);
        let current = self.state.target_temperature;
        if (clamped - current).abs() <= f32::EPSILON {
            return false;
        }

        let dispatch = if clamped > current {
            self.gateway.step_up(now_ms)
        } else {
            self.gateway.step_down(now_ms)
        };
        if dispatch != Dispatch::Sent {
            warn!("target step {dispatch:?}, keeping {current:.1}");
            return false;
        }
        self.state.target_temperature = clamped;
        self.persist();
        info!("target temperature {current:.1} -> {clamped:.1}");
        true
    }

    /// Live update of the off-timer duration. While heating the deadline is
    /// recomputed from the moment HEAT was entered.
    pub fn set_off_timer_minutes(&mut self, minutes: u32, now_ms: u64) -> bool {
        if self.config.off_timer_minutes == minutes {
            return false;
        }
        self.config.off_timer_minutes = minutes;
        self.timers.cancel(TimerKind::OffTimer);

        if self.state.mode == HeaterMode::Heat {
            if let Some(duration_ms) = self.config.off_timer_ms() {
                let started = self.state.heat_started_ms.unwrap_or(now_ms);
                let deadline = started.saturating_add(duration_ms);
                self.timers
                    .after(TimerKind::OffTimer, deadline.saturating_sub(now_ms), now_ms);
            }
        }
        info!("off-timer set to {minutes} min");
        true
    }

    pub fn status(&self, now_ms: u64) -> HeaterStatus {
        let power = self.sensors.power(now_ms);
        HeaterStatus {
            entity_name: self.entity_name.clone(),
            mode: self.state.mode.as_str(),
            target_temp: self.state.target_temperature,
            current_temp: self.sensors.temperature(now_ms),
            power_usage: power,
            heater_on: power.map(|p| p > POWER_ON_THRESHOLD),
            min_temp: self.config.min_temp,
            max_temp: self.config.max_temp,
            off_timer_minutes: self.config.off_timer_minutes,
            off_timer_remaining_ms: self
                .off_timer_deadline_ms()
                .map(|deadline| deadline.saturating_sub(now_ms)),
            failsafe_pending: self.timers.is_armed(TimerKind::FailsafeRecheck),
            last_correction_ago_ms: self
                .state
                .last_correction_ms
                .map(|last| now_ms.saturating_sub(last)),
        }
    }

    fn on_timer(&mut self, fired: TimerFired, now_ms: u64) -> bool {
        if !self.timers.accept(fired) {
            debug!("ignoring stale {} firing", fired.kind.as_str());
            return false;
        }

        match fired.kind {
            TimerKind::OffTimer => {
                if self.state.mode != HeaterMode::Heat {
                    return false;
                }
                info!("off-timer expired, turning heater off");
                self.turn_off(now_ms);
                true
            }
            TimerKind::FailsafeRecheck => {
                self.recheck_power_after_off(now_ms);
                false
            }
            TimerKind::DriftCheck => {
                if self.state.mode == HeaterMode::Heat {
                    self.correct_drift(now_ms);
                }
                false
            }
        }
    }

    fn detect_external_power_on(&mut self, now_ms: u64) -> bool {
        if self.state.mode != HeaterMode::Off {
            return false;
        }
        let Some(power) = self.sensors.power(now_ms) else {
            return false;
        };
        if power <= POWER_ON_THRESHOLD {
            return false;
        }
        if let Some(last_off) = self.state.last_manual_off_ms {
            let since_off = now_ms.saturating_sub(last_off);
            if since_off <= self.config.auto_on_cooldown_ms {
                debug!("power {power:.1} within auto-on cooldown ({since_off}ms since off)");
                return false;
            }
        }

        info!("power {power:.1} above threshold while OFF, adopting HEAT");
        self.state.mode = HeaterMode::Heat;
        self.start_heat_activities(now_ms);
        self.persist();
        true
    }

    fn turn_off(&mut self, now_ms: u64) {
        self.gateway.toggle_power(now_ms);
        self.state.mode = HeaterMode::Off;
        self.state.last_manual_off_ms = Some(now_ms);
        self.state.heat_started_ms = None;
        self.timers.cancel(TimerKind::OffTimer);
        self.timers.cancel(TimerKind::FailsafeRecheck);
        self.timers.cancel(TimerKind::DriftCheck);
        self.persist();

        self.timers.after(
            TimerKind::FailsafeRecheck,
            self.config.failsafe_recheck_delay_ms,
            now_ms,
        );
    }

    fn recheck_power_after_off(&mut self, now_ms: u64) {
        if self.state.mode != HeaterMode::Off {
            return;
        }
        // Only a reading taken after the off toggle says anything about it.
        let power = self
            .sensors
            .power_reading(now_ms)
            .filter(|reading| {
                self.state
                    .last_manual_off_ms
                    .is_none_or(|off| reading.observed_at_ms > off)
            })
            .map(|reading| reading.value);
        match power {
            Some(power) if power > POWER_ON_THRESHOLD => {
                warn!("power still {power:.1} after off, sending toggle again");
                if self.gateway.toggle_power(now_ms) != Dispatch::Throttled {
                    self.state.last_manual_off_ms = Some(now_ms);
                }
            }
            Some(power) => debug!("power {power:.1} confirms heater off"),
            None => info!("no power reading since off, skipping retry"),
        }
    }

    fn correct_drift(&mut self, now_ms: u64) {
        let (Some(current), Some(power)) = (
            self.sensors.temperature(now_ms),
            self.sensors.power(now_ms),
        ) else {
            debug!("sensor data stale, skipping drift check");
            return;
        };

        let error = self.state.target_temperature - current;
        let deadband = self.config.drift_deadband;
        let action = if error > deadband && power <= POWER_ON_THRESHOLD {
            HeaterAction::StepUp
        } else if error < -deadband && power > POWER_ON_THRESHOLD {
            HeaterAction::StepDown
        } else {
            return;
        };

        if let Some(last) = self.state.last_correction_ms {
            if now_ms.saturating_sub(last) < self.config.min_correction_interval_ms {
                debug!("skipping {} within correction interval", action.as_str());
                return;
            }
        }

        info!(
            "drift {error:+.1} (current {current:.1}, power {power:.1}), sending {}",
            action.as_str()
        );
        if self.gateway.trigger(action, now_ms) == Dispatch::Sent {
            self.state.last_correction_ms = Some(now_ms);
        }
    }

    fn start_heat_activities(&mut self, now_ms: u64) {
        self.state.heat_started_ms = Some(now_ms);
        self.timers.cancel(TimerKind::FailsafeRecheck);
        match self.config.off_timer_ms() {
            Some(duration_ms) => {
                self.timers.after(TimerKind::OffTimer, duration_ms, now_ms);
            }
            None => {
                self.timers.cancel(TimerKind::OffTimer);
            }
        }
        self.timers.every(
            TimerKind::DriftCheck,
            self.config.drift_check_interval_ms,
            now_ms,
        );
    }

    fn persist(&mut self) {
        let persisted = PersistedState {
            mode: self.state.mode,
            target_temperature: self.state.target_temperature,
        };
        if let Err(err) = self.store.save(&persisted) {
            warn!("failed to persist heater state: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{actuator::RecordingSink, store::MemoryStore};

    const MIN: u64 = 60_000;

    fn config() -> HeaterConfig {
        HeaterConfig {
            min_temp: 16.0,
            max_temp: 30.0,
            default_temp: 20.0,
            off_timer_minutes: 30,
            auto_on_cooldown_ms: 90_000,
            failsafe_recheck_delay_ms: 60_000,
            drift_deadband: 1.0,
            drift_check_interval_ms: 120_000,
            min_correction_interval_ms: 300_000,
            sensor_stale_timeout_ms: 600_000,
            min_action_spacing_ms: 1_000,
        }
    }

    fn engine_with(
        config: HeaterConfig,
        store: MemoryStore,
    ) -> HeaterEngine<MemoryStore, RecordingSink> {
        HeaterEngine::new(
            config,
            &EntityConfig::default(),
            store,
            RecordingSink::default(),
            0,
        )
    }

    fn engine() -> HeaterEngine<MemoryStore, RecordingSink> {
        engine_with(config(), MemoryStore::new())
    }

    fn heating_engine(target: f32) -> HeaterEngine<MemoryStore, RecordingSink> {
        let store = MemoryStore::with_state(PersistedState {
            mode: HeaterMode::Heat,
            target_temperature: target,
        })
        .unwrap();
        engine_with(config(), store)
    }

    fn power(engine: &mut HeaterEngine<MemoryStore, RecordingSink>, value: f32, now_ms: u64) {
        engine.handle(
            HeaterEvent::Sensor {
                kind: SensorKind::Power,
                value,
            },
            now_ms,
        );
    }

    fn temperature(engine: &mut HeaterEngine<MemoryStore, RecordingSink>, value: f32, now_ms: u64) {
        engine.handle(
            HeaterEvent::Sensor {
                kind: SensorKind::Temperature,
                value,
            },
            now_ms,
        );
    }

    fn run_timers(engine: &mut HeaterEngine<MemoryStore, RecordingSink>, now_ms: u64) -> usize {
        let due = engine.take_due_timers(now_ms);
        let count = due.len();
        for fired in due {
            engine.handle(HeaterEvent::Timer(fired), now_ms);
        }
        count
    }

    fn toggles(engine: &HeaterEngine<MemoryStore, RecordingSink>) -> usize {
        engine.sink().count(HeaterAction::Toggle)
    }

    #[test]
    fn cold_start_uses_defaults() {
        let engine = engine();

        assert_eq!(engine.mode(), HeaterMode::Off);
        assert_eq!(engine.target_temperature(), 20.0);
        assert_eq!(engine.next_timer_deadline_ms(), None);
    }

    #[test]
    fn engine_exposes_sanitized_config() {
        let engine = engine_with(
            HeaterConfig {
                auto_on_cooldown_ms: 15_000,
                min_action_spacing_ms: 200,
                ..config()
            },
            MemoryStore::new(),
        );

        assert_eq!(engine.config().auto_on_cooldown_ms, 61_000);
        assert_eq!(engine.config().min_action_spacing_ms, 1_000);
    }

    #[test]
    fn restores_persisted_heat_without_actuation() {
        let engine = heating_engine(22.0);

        assert_eq!(engine.mode(), HeaterMode::Heat);
        assert_eq!(engine.target_temperature(), 22.0);
        assert!(engine.sink().calls.is_empty());
        assert_eq!(engine.off_timer_deadline_ms(), Some(30 * MIN));
    }

    #[test]
    fn malformed_store_falls_back_to_defaults() {
        let engine = engine_with(config(), MemoryStore::with_raw("{\"mode\":"));

        assert_eq!(engine.mode(), HeaterMode::Off);
        assert_eq!(engine.target_temperature(), 20.0);
    }

    #[test]
    fn out_of_range_restored_target_uses_default() {
        let engine = heating_engine(45.0);

        assert_eq!(engine.mode(), HeaterMode::Heat);
        assert_eq!(engine.target_temperature(), 20.0);
    }

    #[test]
    fn target_requests_saturate_to_range() {
        let mut engine = engine();
        let mut now = 0;

        for (requested, expected) in [(35.0, 30.0), (10.0, 16.0), (22.5, 22.5), (30.0, 30.0)] {
            now += 5_000;
            engine.handle(HeaterEvent::SetTargetTemperature(requested), now);
            assert_eq!(engine.target_temperature(), expected);
            assert_eq!(
                engine.store().load().unwrap().map(|s| s.target_temperature),
                Some(expected)
            );
        }
    }

    #[test]
    fn target_change_steps_once_in_direction_of_change() {
        let mut engine = engine();

        assert!(engine.set_target_temperature(25.0, 1_000));
        assert!(engine.set_target_temperature(18.0, 3_000));
        assert!(!engine.set_target_temperature(18.0, 5_000));

        assert_eq!(
            engine.sink().calls,
            vec![HeaterAction::StepUp, HeaterAction::StepDown]
        );
    }

    #[test]
    fn throttled_step_keeps_previous_target() {
        let mut engine = engine();
        engine.set_mode(HeaterMode::Heat, 0);

        assert!(!engine.set_target_temperature(25.0, 500));

        assert_eq!(engine.sink().calls, vec![HeaterAction::Toggle]);
        assert_eq!(engine.target_temperature(), 20.0);
        assert_eq!(
            engine.store().load().unwrap().map(|s| s.target_temperature),
            Some(20.0)
        );

        assert!(engine.set_target_temperature(25.0, 1_000));
        assert_eq!(engine.target_temperature(), 25.0);
    }

    #[test]
    fn failed_step_keeps_previous_target() {
        let mut engine = engine();
        engine.sink_mut().fail = true;

        assert!(!engine.set_target_temperature(25.0, 5_000));

        assert_eq!(engine.sink().calls, vec![HeaterAction::StepUp]);
        assert_eq!(engine.target_temperature(), 20.0);
        assert_eq!(engine.store().saves(), 0);
    }

    #[test]
    fn heat_from_off_toggles_and_arms_timers() {
        let mut engine = engine();

        assert!(engine.set_mode(HeaterMode::Heat, 1_000));

        assert_eq!(engine.sink().calls, vec![HeaterAction::Toggle]);
        assert_eq!(engine.off_timer_deadline_ms(), Some(1_000 + 30 * MIN));
        assert_eq!(
            engine.store().load().unwrap().map(|s| s.mode),
            Some(HeaterMode::Heat)
        );
        assert!(!engine.set_mode(HeaterMode::Heat, 5_000));
        assert_eq!(toggles(&engine), 1);
    }

    #[test]
    fn heat_while_power_already_high_skips_toggle() {
        let mut engine = engine();
        engine.set_mode(HeaterMode::Heat, 0);
        engine.set_mode(HeaterMode::Off, 10_000);
        power(&mut engine, 1_500.0, 20_000);

        engine.set_mode(HeaterMode::Heat, 30_000);

        assert_eq!(engine.mode(), HeaterMode::Heat);
        assert_eq!(toggles(&engine), 2);
        assert_eq!(engine.failsafe_recheck_at_ms(), None);
    }

    #[test]
    fn disabled_off_timer_never_arms() {
        let mut engine = engine_with(
            HeaterConfig {
                off_timer_minutes: 0,
                ..config()
            },
            MemoryStore::new(),
        );

        engine.set_mode(HeaterMode::Heat, 0);

        assert_eq!(engine.off_timer_deadline_ms(), None);
    }

    #[test]
    fn manual_off_toggles_once_and_schedules_recheck() {
        let mut engine = heating_engine(22.0);

        assert!(engine.handle(HeaterEvent::SetMode(HeaterMode::Off), 10_000));

        assert_eq!(engine.sink().calls, vec![HeaterAction::Toggle]);
        assert_eq!(engine.mode(), HeaterMode::Off);
        assert_eq!(engine.failsafe_recheck_at_ms(), Some(70_000));
        assert_eq!(engine.off_timer_deadline_ms(), None);
        assert_eq!(engine.next_timer_deadline_ms(), Some(70_000));
        assert_eq!(engine.state().last_manual_off_ms, Some(10_000));
    }

    #[test]
    fn failsafe_retries_once_when_power_stays_high() {
        let mut engine = heating_engine(22.0);
        engine.set_mode(HeaterMode::Off, 10_000);
        power(&mut engine, 1_400.0, 65_000);

        assert_eq!(run_timers(&mut engine, 70_000), 1);

        assert_eq!(toggles(&engine), 2);
        assert_eq!(engine.failsafe_recheck_at_ms(), None);
        assert_eq!(engine.next_timer_deadline_ms(), None);
        assert_eq!(run_timers(&mut engine, 200_000), 0);
        assert_eq!(toggles(&engine), 2);
    }

    #[test]
    fn failsafe_does_nothing_when_power_dropped() {
        let mut engine = heating_engine(22.0);
        engine.set_mode(HeaterMode::Off, 10_000);
        power(&mut engine, 2.0, 40_000);

        run_timers(&mut engine, 70_000);

        assert_eq!(toggles(&engine), 1);
        assert_eq!(engine.mode(), HeaterMode::Off);
    }

    #[test]
    fn failsafe_skips_retry_on_unknown_power() {
        let mut engine = heating_engine(22.0);
        engine.set_mode(HeaterMode::Off, 10_000);

        run_timers(&mut engine, 70_000);

        assert_eq!(toggles(&engine), 1);
    }

    #[test]
    fn failsafe_ignores_power_observed_before_off() {
        let mut engine = heating_engine(22.0);
        power(&mut engine, 1_400.0, 5_000);
        engine.set_mode(HeaterMode::Off, 10_000);

        assert_eq!(run_timers(&mut engine, 70_000), 1);

        assert_eq!(toggles(&engine), 1);
        assert_eq!(engine.state().last_manual_off_ms, Some(10_000));
    }

    #[test]
    fn recheck_cancelled_by_heat_is_ignored() {
        let mut engine = heating_engine(22.0);
        engine.set_mode(HeaterMode::Off, 10_000);
        let stale = engine.take_due_timers(70_000);
        engine.set_mode(HeaterMode::Heat, 70_000);
        power(&mut engine, 1_400.0, 70_500);

        for fired in stale {
            assert!(!engine.handle(HeaterEvent::Timer(fired), 71_000));
        }

        assert_eq!(engine.mode(), HeaterMode::Heat);
        assert_eq!(toggles(&engine), 2);
    }

    #[test]
    fn auto_on_adopts_heat_without_toggle() {
        let mut engine = engine();
        power(&mut engine, 0.5, 1_000);

        power(&mut engine, 1_200.0, 2_000);

        assert_eq!(engine.mode(), HeaterMode::Heat);
        assert!(engine.sink().calls.is_empty());
        assert_eq!(engine.off_timer_deadline_ms(), Some(2_000 + 30 * MIN));
        assert_eq!(
            engine.store().load().unwrap().map(|s| s.mode),
            Some(HeaterMode::Heat)
        );
    }

    #[test]
    fn auto_on_ignores_power_at_threshold() {
        let mut engine = engine();

        power(&mut engine, POWER_ON_THRESHOLD, 1_000);

        assert_eq!(engine.mode(), HeaterMode::Off);
    }

    #[test]
    fn auto_on_suppressed_during_cooldown() {
        let cooldown = config().auto_on_cooldown_ms;
        let off_at = 10_000;

        let mut early = heating_engine(22.0);
        early.set_mode(HeaterMode::Off, off_at);
        power(&mut early, 2.0, off_at + 50_000);
        run_timers(&mut early, off_at + 60_000);
        power(&mut early, 1_300.0, off_at + cooldown - 1_000);
        assert_eq!(early.mode(), HeaterMode::Off);

        let mut late = heating_engine(22.0);
        late.set_mode(HeaterMode::Off, off_at);
        power(&mut late, 2.0, off_at + 50_000);
        run_timers(&mut late, off_at + 60_000);
        power(&mut late, 1_300.0, off_at + cooldown + 1_000);
        assert_eq!(late.mode(), HeaterMode::Heat);
        assert_eq!(toggles(&late), 1);
    }

    #[test]
    fn short_cooldown_cannot_preempt_failsafe() {
        let mut engine = engine_with(
            HeaterConfig {
                auto_on_cooldown_ms: 15_000,
                ..config()
            },
            MemoryStore::new(),
        );
        engine.set_mode(HeaterMode::Heat, 0);
        engine.set_mode(HeaterMode::Off, 10_000);

        power(&mut engine, 1_400.0, 30_000);

        assert_eq!(engine.mode(), HeaterMode::Off);
        assert_eq!(engine.failsafe_recheck_at_ms(), Some(70_000));
        run_timers(&mut engine, 70_000);
        assert_eq!(toggles(&engine), 3);
    }

    #[test]
    fn failsafe_retry_restarts_cooldown() {
        let mut engine = heating_engine(22.0);
        engine.set_mode(HeaterMode::Off, 0);
        power(&mut engine, 1_300.0, 55_000);
        run_timers(&mut engine, 60_000);

        power(&mut engine, 1_300.0, 100_000);

        assert_eq!(engine.mode(), HeaterMode::Off);
        assert_eq!(engine.state().last_manual_off_ms, Some(60_000));
    }

    #[test]
    fn off_timer_expiry_runs_off_sequence() {
        let mut engine = engine_with(
            HeaterConfig {
                off_timer_minutes: 5,
                ..config()
            },
            MemoryStore::new(),
        );
        engine.set_mode(HeaterMode::Heat, 0);

        run_timers(&mut engine, 5 * MIN);

        assert_eq!(engine.mode(), HeaterMode::Off);
        assert_eq!(toggles(&engine), 2);
        assert_eq!(engine.failsafe_recheck_at_ms(), Some(6 * MIN));
        assert_eq!(engine.state().last_manual_off_ms, Some(5 * MIN));
        assert_eq!(
            engine.store().load().unwrap().map(|s| s.mode),
            Some(HeaterMode::Off)
        );
    }

    #[test]
    fn live_timer_update_rearms_from_heat_start() {
        let mut engine = engine();
        engine.set_mode(HeaterMode::Heat, 0);

        assert!(engine.handle(HeaterEvent::SetOffTimerMinutes(10), 4 * MIN));
        assert_eq!(engine.off_timer_deadline_ms(), Some(10 * MIN));

        engine.set_off_timer_minutes(0, 5 * MIN);
        assert_eq!(engine.off_timer_deadline_ms(), None);

        engine.set_off_timer_minutes(3, 5 * MIN);
        run_timers(&mut engine, 5 * MIN);
        assert_eq!(engine.mode(), HeaterMode::Off);
    }

    #[test]
    fn off_timer_and_drift_due_together_make_one_call() {
        let mut engine = engine_with(
            HeaterConfig {
                off_timer_minutes: 4,
                ..config()
            },
            MemoryStore::new(),
        );
        engine.set_mode(HeaterMode::Heat, 0);
        run_timers(&mut engine, 2 * MIN);
        temperature(&mut engine, 19.0, 3 * MIN);
        power(&mut engine, 3.0, 3 * MIN);

        let due = engine.take_due_timers(4 * MIN);
        assert_eq!(
            due.iter().map(|fired| fired.kind).collect::<Vec<_>>(),
            vec![TimerKind::OffTimer, TimerKind::DriftCheck]
        );
        assert!(engine.handle(HeaterEvent::Timer(due[0]), 4 * MIN));
        assert!(!engine.handle(HeaterEvent::Timer(due[1]), 4 * MIN + 2_000));

        assert_eq!(
            engine.sink().calls,
            vec![HeaterAction::Toggle, HeaterAction::Toggle]
        );
        assert_eq!(engine.next_timer_deadline_ms(), Some(5 * MIN));
    }

    #[test]
    fn drift_steps_up_when_cold_and_heater_idle() {
        let mut engine = heating_engine(22.0);
        temperature(&mut engine, 19.5, 100_000);
        power(&mut engine, 3.0, 100_000);

        run_timers(&mut engine, 120_000);

        assert_eq!(engine.sink().calls, vec![HeaterAction::StepUp]);
        assert_eq!(engine.state().last_correction_ms, Some(120_000));
    }

    #[test]
    fn drift_steps_down_when_overshooting() {
        let mut engine = heating_engine(22.0);
        temperature(&mut engine, 24.0, 100_000);
        power(&mut engine, 1_500.0, 100_000);

        run_timers(&mut engine, 120_000);

        assert_eq!(engine.sink().calls, vec![HeaterAction::StepDown]);
    }

    #[test]
    fn drift_within_deadband_or_already_heating_is_left_alone() {
        let mut engine = heating_engine(22.0);
        temperature(&mut engine, 21.5, 100_000);
        power(&mut engine, 3.0, 100_000);
        run_timers(&mut engine, 120_000);

        temperature(&mut engine, 19.0, 230_000);
        power(&mut engine, 1_500.0, 230_000);
        run_timers(&mut engine, 240_000);

        assert!(engine.sink().calls.is_empty());
    }

    #[test]
    fn drift_skips_on_stale_sensor() {
        let mut engine = heating_engine(22.0);
        power(&mut engine, 3.0, 100_000);

        run_timers(&mut engine, 120_000);

        assert!(engine.sink().calls.is_empty());
    }

    #[test]
    fn drift_corrections_are_rate_limited() {
        let mut engine = heating_engine(22.0);
        temperature(&mut engine, 19.0, 110_000);
        power(&mut engine, 3.0, 110_000);

        run_timers(&mut engine, 120_000);
        temperature(&mut engine, 19.0, 230_000);
        power(&mut engine, 3.0, 230_000);
        run_timers(&mut engine, 240_000);

        assert_eq!(engine.sink().calls, vec![HeaterAction::StepUp]);

        run_timers(&mut engine, 360_000);
        run_timers(&mut engine, 480_000);
        assert_eq!(engine.sink().count(HeaterAction::StepUp), 2);
    }

    #[test]
    fn failed_correction_is_not_recorded() {
        let mut engine = heating_engine(22.0);
        engine.sink_mut().fail = true;
        temperature(&mut engine, 19.0, 110_000);
        power(&mut engine, 3.0, 110_000);

        run_timers(&mut engine, 120_000);

        assert_eq!(engine.sink().calls.len(), 1);
        assert_eq!(engine.state().last_correction_ms, None);
    }

    #[test]
    fn dispatch_failure_still_changes_mode() {
        let mut engine = engine();
        engine.sink_mut().fail = true;

        assert!(engine.set_mode(HeaterMode::Heat, 1_000));

        assert_eq!(engine.mode(), HeaterMode::Heat);
    }

    #[test]
    fn drift_check_stops_after_off() {
        let mut engine = heating_engine(22.0);
        engine.set_mode(HeaterMode::Off, 1_000);
        temperature(&mut engine, 15.0, 110_000);
        power(&mut engine, 0.0, 110_000);

        run_timers(&mut engine, 240_000);

        assert_eq!(engine.sink().calls, vec![HeaterAction::Toggle]);
    }

    #[test]
    fn status_reports_unknown_readings_as_null() {
        let mut engine = heating_engine(22.0);
        power(&mut engine, 1_500.0, 1_000);

        let status = engine.status(2_000);
        assert_eq!(status.mode, "HEAT");
        assert_eq!(status.current_temp, None);
        assert_eq!(status.heater_on, Some(true));
        assert_eq!(status.off_timer_remaining_ms, Some(30 * MIN - 2_000));

        let status = engine.status(1_000 + 600_000);
        assert_eq!(status.power_usage, None);
    }
}
