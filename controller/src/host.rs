use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot, watch},
};
use tracing::{debug, info, warn};

use heater_common::{
    ActionSink, DispatchError, EntityConfig, HeaterAction, HeaterEngine, HeaterEvent, HeaterMode,
    HeaterStatus, RuntimeConfig, SensorKind, StateStore, ACTION_TRIGGER_PAYLOAD, TOPIC_CMD_MODE,
    TOPIC_CMD_TARGET, TOPIC_CMD_TIMER, TOPIC_HEATER_STATE,
};

use crate::store::{self, JsonFileStore, RuntimeStore};

const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const EVENT_QUEUE_DEPTH: usize = 64;
const MAX_OFF_TIMER_MINUTES: u32 = 1_440;

#[derive(Debug)]
struct ControlMessage {
    event: HeaterEvent,
    reply: Option<oneshot::Sender<HeaterStatus>>,
}

#[derive(Clone)]
struct AppState {
    events: mpsc::Sender<ControlMessage>,
    status: watch::Receiver<HeaterStatus>,
    entity: Arc<EntityConfig>,
    store: RuntimeStore,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct StatusEnvelope {
    #[serde(flatten)]
    status: HeaterStatus,
    #[serde(rename = "updatedEpoch")]
    updated_epoch: i64,
}

impl StatusEnvelope {
    fn new(status: HeaterStatus) -> Self {
        Self {
            status,
            updated_epoch: Utc::now().timestamp(),
        }
    }
}

/// Fires heater actions by publishing to the action's MQTT topic. Never
/// blocks: a full client queue is reported as a dispatch failure.
struct MqttActionSink {
    mqtt: AsyncClient,
}

impl ActionSink for MqttActionSink {
    fn dispatch(&mut self, action: HeaterAction, action_id: &str) -> Result<(), DispatchError> {
        debug!("publishing {} to {action_id}", action.as_str());
        self.mqtt
            .try_publish(action_id, QoS::AtLeastOnce, false, ACTION_TRIGGER_PAYLOAD)
            .map_err(|err| DispatchError::Unavailable(err.to_string()))
    }
}

impl AppState {
    async fn enqueue(&self, event: HeaterEvent) -> anyhow::Result<()> {
        self.events
            .send(ControlMessage { event, reply: None })
            .await
            .map_err(|_| anyhow!("engine loop stopped"))
    }

    async fn submit(&self, event: HeaterEvent) -> anyhow::Result<HeaterStatus> {
        let (reply, response) = oneshot::channel();
        self.events
            .send(ControlMessage {
                event,
                reply: Some(reply),
            })
            .await
            .map_err(|_| anyhow!("engine loop stopped"))?;
        response.await.context("engine loop dropped reply")
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = store::data_dir();
    let runtime_store = RuntimeStore::new(&data_dir);
    let mut runtime = runtime_store
        .load_runtime_config()
        .await
        .unwrap_or_else(|err| {
            warn!("failed to load runtime config from store: {err:#}");
            RuntimeConfig::default()
        });
    runtime.heater.sanitize();

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or(runtime.network.mqtt_host.clone());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.network.mqtt_port);

    let mut mqtt_options = MqttOptions::new("heater-controller-rust", mqtt_host, mqtt_port);
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or(runtime.network.mqtt_user.clone());
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or(runtime.network.mqtt_pass.clone());
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let engine = HeaterEngine::new(
        runtime.heater.clone(),
        &runtime.entity,
        JsonFileStore::new(data_dir.join("state.json")),
        MqttActionSink { mqtt: mqtt.clone() },
        monotonic_ms(),
    );
    info!(
        "{} starting in {} (target {:.1})",
        runtime.entity.entity_name,
        engine.mode().as_str(),
        engine.target_temperature()
    );

    let (status_tx, status_rx) = watch::channel(engine.status(monotonic_ms()));
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

    let app_state = AppState {
        events: events_tx,
        status: status_rx,
        entity: Arc::new(runtime.entity.clone()),
        store: runtime_store,
    };

    subscribe_topics(&mqtt, &app_state.entity).await?;
    spawn_mqtt_loop(app_state.clone(), mqtt.clone(), eventloop);
    spawn_engine_loop(engine, events_rx, status_tx);
    spawn_state_publish_loop(mqtt, app_state.status.clone());

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/mode", post(handle_set_mode))
        .route("/api/target", post(handle_set_target))
        .route("/api/timer", post(handle_set_timer))
        .with_state(app_state);

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn subscribe_topics(mqtt: &AsyncClient, entity: &EntityConfig) -> anyhow::Result<()> {
    let topics = [
        entity.power_sensor.as_str(),
        entity.temperature_sensor.as_str(),
        TOPIC_CMD_MODE,
        TOPIC_CMD_TARGET,
        TOPIC_CMD_TIMER,
    ];

    for topic in topics {
        mqtt.subscribe(topic, QoS::AtMostOnce).await?;
    }
    Ok(())
}

fn spawn_mqtt_loop(app_state: AppState, mqtt: AsyncClient, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, message.topic, message.payload.to_vec())
                            .await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    if let Err(err) = subscribe_topics(&mqtt, &app_state.entity).await {
                        warn!("mqtt resubscribe failed: {err:#}");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

/// Single consumer of the event queue. Owns the engine, so sensor pushes,
/// commands and timer firings are processed strictly one at a time.
fn spawn_engine_loop<S, A>(
    mut engine: HeaterEngine<S, A>,
    mut events: mpsc::Receiver<ControlMessage>,
    status: watch::Sender<HeaterStatus>,
) where
    S: StateStore + Send + 'static,
    A: ActionSink + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let deadline = engine.next_timer_deadline_ms().map(deadline_instant);

            tokio::select! {
                message = events.recv() => {
                    let Some(message) = message else {
                        info!("event queue closed, stopping engine loop");
                        break;
                    };
                    let now_ms = monotonic_ms();
                    engine.handle(message.event, now_ms);

                    let snapshot = engine.status(now_ms);
                    if let Some(reply) = message.reply {
                        let _ = reply.send(snapshot.clone());
                    }
                    status.send_replace(snapshot);
                }
                _ = sleep_until_deadline(deadline) => {
                    let now_ms = monotonic_ms();
                    for fired in engine.take_due_timers(now_ms) {
                        debug!("{} timer fired", fired.kind.as_str());
                        engine.handle(HeaterEvent::Timer(fired), now_ms);
                    }
                    status.send_replace(engine.status(now_ms));
                }
            }
        }
    });
}

fn spawn_state_publish_loop(mqtt: AsyncClient, mut status: watch::Receiver<HeaterStatus>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = interval.tick() => {}
            }

            let snapshot = status.borrow_and_update().clone();
            match serde_json::to_vec(&StatusEnvelope::new(snapshot)) {
                Ok(body) => {
                    if let Err(err) = mqtt
                        .publish(TOPIC_HEATER_STATE, QoS::AtLeastOnce, true, body)
                        .await
                    {
                        warn!("heater state publish failed: {err}");
                    }
                }
                Err(err) => warn!("heater state serialization failed: {err}"),
            }
        }
    });
}

async fn sleep_until_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn handle_mqtt_message(
    app_state: &AppState,
    topic: String,
    payload: Vec<u8>,
) -> anyhow::Result<()> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    let message = String::from_utf8(payload).context("non utf8 mqtt payload")?;
    let Some(event) = parse_mqtt_event(&app_state.entity, &topic, message.trim()) else {
        warn!("ignoring unusable payload on {topic}: {message:?}");
        return Ok(());
    };

    if let HeaterEvent::SetOffTimerMinutes(minutes) = event {
        persist_off_timer(app_state, minutes).await?;
    }
    app_state.enqueue(event).await
}

fn parse_mqtt_event(entity: &EntityConfig, topic: &str, message: &str) -> Option<HeaterEvent> {
    let reading = |kind| {
        message
            .parse::<f32>()
            .ok()
            .filter(|value| value.is_finite())
            .map(|value| HeaterEvent::Sensor { kind, value })
    };

    if topic == entity.power_sensor {
        return reading(SensorKind::Power);
    }
    if topic == entity.temperature_sensor {
        return reading(SensorKind::Temperature);
    }

    match topic {
        TOPIC_CMD_MODE => HeaterMode::parse(message).map(HeaterEvent::SetMode),
        TOPIC_CMD_TARGET => message
            .parse::<f32>()
            .ok()
            .filter(|value| value.is_finite())
            .map(HeaterEvent::SetTargetTemperature),
        TOPIC_CMD_TIMER => message
            .parse::<u32>()
            .ok()
            .filter(|minutes| *minutes <= MAX_OFF_TIMER_MINUTES)
            .map(HeaterEvent::SetOffTimerMinutes),
        _ => None,
    }
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.status.borrow().clone();
    Json(StatusEnvelope::new(status))
}

async fn handle_set_mode(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Some(mode) = HeaterMode::parse(value) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid mode. Use 'HEAT' or 'OFF'");
    };

    submit_response(&state, HeaterEvent::SetMode(mode)).await
}

async fn handle_set_target(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Some(target) = value.parse::<f32>().ok().filter(|t| t.is_finite()) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid temperature value");
    };

    submit_response(&state, HeaterEvent::SetTargetTemperature(target)).await
}

async fn handle_set_timer(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("minutes") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'minutes' parameter");
    };
    let Some(minutes) = value
        .parse::<u32>()
        .ok()
        .filter(|minutes| *minutes <= MAX_OFF_TIMER_MINUTES)
    else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Invalid timer value (0-1440 minutes, 0 disables)",
        );
    };

    if let Err(err) = persist_off_timer(&state, minutes).await {
        warn!("failed to persist off-timer update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist runtime settings",
        );
    }

    submit_response(&state, HeaterEvent::SetOffTimerMinutes(minutes)).await
}

async fn submit_response(state: &AppState, event: HeaterEvent) -> axum::response::Response {
    match state.submit(event).await {
        Ok(status) => Json(StatusEnvelope::new(status)).into_response(),
        Err(err) => {
            warn!("failed to submit {event:?}: {err:#}");
            error_response(StatusCode::SERVICE_UNAVAILABLE, "Heater engine unavailable")
        }
    }
}

async fn persist_off_timer(state: &AppState, minutes: u32) -> anyhow::Result<()> {
    let mut runtime = state.store.load_runtime_config().await?;
    runtime.heater.off_timer_minutes = minutes;
    state.store.save_runtime_config(&runtime).await
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn start_instant() -> Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    *START.get_or_init(Instant::now)
}

fn monotonic_ms() -> u64 {
    start_instant()
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

fn deadline_instant(deadline_ms: u64) -> tokio::time::Instant {
    tokio::time::Instant::from_std(start_instant() + Duration::from_millis(deadline_ms))
}
