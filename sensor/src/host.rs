use std::{io::ErrorKind, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::sync::Mutex;
use tracing::{info, warn};

use heater_common::{EntityConfig, HeaterAction, RuntimeConfig, TOPIC_SENSOR_STATUS};

const HEATING_WATTS: f32 = 1_500.0;
const STANDBY_WATTS: f32 = 4.0;
const AMBIENT_TEMP: f32 = 15.0;

/// Stand-in for the IR heater: toggles and steps on action triggers, reports
/// power draw and room temperature like the real sensors would.
#[derive(Debug, Clone)]
struct SimulatedHeater {
    on: bool,
    setpoint: f32,
    room_temp: f32,
}

impl Default for SimulatedHeater {
    fn default() -> Self {
        Self {
            on: false,
            setpoint: 20.0,
            room_temp: 18.0,
        }
    }
}

impl SimulatedHeater {
    fn apply(&mut self, action: HeaterAction) {
        match action {
            HeaterAction::Toggle => self.on = !self.on,
            HeaterAction::StepUp => self.setpoint = (self.setpoint + 1.0).min(30.0),
            HeaterAction::StepDown => self.setpoint = (self.setpoint - 1.0).max(16.0),
        }
    }

    fn is_heating(&self) -> bool {
        self.on && self.room_temp < self.setpoint
    }

    fn power_watts(&self) -> f32 {
        match (self.on, self.is_heating()) {
            (true, true) => HEATING_WATTS,
            (true, false) => STANDBY_WATTS,
            (false, _) => 0.0,
        }
    }

    fn advance(&mut self) {
        if self.is_heating() {
            self.room_temp += 0.3;
        } else if self.room_temp > AMBIENT_TEMP {
            self.room_temp = (self.room_temp - 0.1).max(AMBIENT_TEMP);
        }
    }
}

fn action_for_topic(entity: &EntityConfig, topic: &str) -> Option<HeaterAction> {
    if topic == entity.toggle_action {
        Some(HeaterAction::Toggle)
    } else if topic == entity.step_up_action {
        Some(HeaterAction::StepUp)
    } else if topic == entity.step_down_action {
        Some(HeaterAction::StepDown)
    } else {
        None
    }
}

fn entity_from_runtime(raw: &[u8]) -> anyhow::Result<EntityConfig> {
    let runtime: RuntimeConfig = serde_json::from_slice(raw)?;
    Ok(runtime.entity)
}

/// Entity topics from the controller's `runtime.json`, so both binaries agree
/// on action and sensor topics.
async fn load_entity() -> EntityConfig {
    let path = std::env::var("HEATER_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.heater"))
        .join("runtime.json");

    match tokio::fs::read(&path).await {
        Ok(raw) => entity_from_runtime(&raw).unwrap_or_else(|err| {
            warn!("failed to parse {}: {err:#}", path.display());
            EntityConfig::default()
        }),
        Err(err) if err.kind() == ErrorKind::NotFound => EntityConfig::default(),
        Err(err) => {
            warn!("failed to read {}: {err}", path.display());
            EntityConfig::default()
        }
    }
}

async fn subscribe_actions(mqtt: &AsyncClient, entity: &EntityConfig) -> anyhow::Result<()> {
    for topic in [
        &entity.toggle_action,
        &entity.step_up_action,
        &entity.step_down_action,
    ] {
        mqtt.subscribe(topic.as_str(), QoS::AtMostOnce)
            .await
            .with_context(|| format!("failed to subscribe to {topic}"))?;
    }
    Ok(())
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);
    let interval_secs = std::env::var("SENSOR_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(30)
        .max(1);

    let mut mqtt_options = MqttOptions::new("heater-sensor-rust", mqtt_host, mqtt_port);

    if let Ok(user) = std::env::var("MQTT_USER") {
        let pass = std::env::var("MQTT_PASS").unwrap_or_default();
        mqtt_options.set_credentials(user, pass);
    }

    let (mqtt, mut eventloop) = AsyncClient::new(mqtt_options, 32);
    let entity = load_entity().await;
    let heater = Arc::new(Mutex::new(SimulatedHeater::default()));

    mqtt.publish(TOPIC_SENSOR_STATUS, QoS::AtLeastOnce, true, "online")
        .await
        .context("failed to publish sensor online status")?;
    subscribe_actions(&mqtt, &entity).await?;

    {
        let heater = heater.clone();
        let entity = entity.clone();
        let mqtt = mqtt.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("sensor mqtt connected");
                        if let Err(err) = subscribe_actions(&mqtt, &entity).await {
                            warn!("sensor resubscribe failed: {err:#}");
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(message))) => {
                        if let Some(action) = action_for_topic(&entity, &message.topic) {
                            let mut heater = heater.lock().await;
                            heater.apply(action);
                            info!(
                                "received {}: on={} setpoint={:.0}",
                                action.as_str(),
                                heater.on,
                                heater.setpoint
                            );
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!("sensor mqtt poll error: {err}");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });
    }

    info!("simulated heater started");

    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;

        let (power, temperature) = {
            let mut heater = heater.lock().await;
            heater.advance();
            (heater.power_watts(), heater.room_temp)
        };

        mqtt.publish(
            entity.power_sensor.as_str(),
            QoS::AtLeastOnce,
            true,
            format!("{power:.1}"),
        )
        .await
        .context("failed to publish power reading")?;
        mqtt.publish(
            entity.temperature_sensor.as_str(),
            QoS::AtLeastOnce,
            true,
            format!("{temperature:.1}"),
        )
        .await
        .context("failed to publish temperature reading")?;
    }
}
