use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::sync::Mutex;
use tracing::{info, warn};

use pvheater_common::{
    HeaterConfig, HeaterEngine, HeaterMode, MeterToken, TOPIC_CMD_CONSUME_MAX,
    TOPIC_CMD_CONSUME_START, TOPIC_CMD_FAULT_RESET, TOPIC_CMD_MANUAL_DUTY, TOPIC_CMD_MAX_POWER,
    TOPIC_CMD_MIN_POWER, TOPIC_CMD_MODE, TOPIC_CMD_TARGET, TOPIC_HEATER_STATE,
    TOPIC_PROBE_FLOW, TOPIC_PROBE_TEMP_IN, TOPIC_PROBE_TEMP_OUT, TOPIC_PUMP_STATE,
    TOPIC_SCR_STATE,
};

use crate::meter::{spawn_meter_loop, MeterConfig, MeterScheduler};
use crate::outputs::Actuator;

const MAX_MQTT_PAYLOAD_BYTES: usize = 64;

#[derive(Clone)]
struct AppState {
    engine: Arc<Mutex<HeaterEngine>>,
    mqtt: AsyncClient,
    scheduler: MeterScheduler,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = HeaterConfig::default();
    let engine = HeaterEngine::new(config.clone());

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);

    let mut mqtt_options = MqttOptions::new("pvheater-controller", mqtt_host, mqtt_port);
    if let Ok(user) = std::env::var("MQTT_USER") {
        let pass = std::env::var("MQTT_PASS").unwrap_or_default();
        mqtt_options.set_credentials(user, pass);
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let meter_config = MeterConfig {
        local_addr: parse_addr("METER_ADDR", "127.0.0.1:1502")?,
        house_addr: match std::env::var("HOUSE_METER_ADDR") {
            Ok(value) => Some(value.parse().context("invalid HOUSE_METER_ADDR")?),
            Err(_) => None,
        },
        slave: std::env::var("METER_SLAVE")
            .ok()
            .and_then(|value| value.parse::<u8>().ok())
            .unwrap_or(1),
    };

    let app_state = AppState {
        engine: Arc::new(Mutex::new(engine)),
        mqtt,
        scheduler: MeterScheduler::new(),
    };

    subscribe_topics(&app_state.mqtt).await?;
    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_meter_loop(
        app_state.engine.clone(),
        app_state.scheduler.clone(),
        meter_config,
    );
    spawn_fast_loop(app_state.clone(), config.fast_interval_ms);
    spawn_slow_loop(app_state.clone(), config.slow_interval_ms);
    spawn_state_publish_loop(app_state.clone(), config.publish_interval_ms);

    info!("controller running");
    tokio::signal::ctrl_c().await?;
    info!("controller shutting down");
    Ok(())
}

fn parse_addr(var: &str, default: &str) -> anyhow::Result<SocketAddr> {
    std::env::var(var)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .with_context(|| format!("invalid {var}"))
}

async fn subscribe_topics(mqtt: &AsyncClient) -> anyhow::Result<()> {
    let topics = [
        TOPIC_PROBE_TEMP_IN,
        TOPIC_PROBE_TEMP_OUT,
        TOPIC_PROBE_FLOW,
        TOPIC_CMD_TARGET,
        TOPIC_CMD_MODE,
        TOPIC_CMD_MAX_POWER,
        TOPIC_CMD_MIN_POWER,
        TOPIC_CMD_CONSUME_MAX,
        TOPIC_CMD_CONSUME_START,
        TOPIC_CMD_MANUAL_DUTY,
        TOPIC_CMD_FAULT_RESET,
    ];

    for topic in topics {
        mqtt.subscribe(topic, QoS::AtMostOnce).await?;
    }
    Ok(())
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    handle_mqtt_message(&app_state, &message.topic, &message.payload).await;
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
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

/// Command dispatch. Runs inline on the event loop task and only touches the
/// engine through its mutex, so every mutation is serialized with the tick
/// loops; the engine itself never needs locking discipline beyond this.
async fn handle_mqtt_message(app_state: &AppState, topic: &str, payload: &[u8]) {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized payload on {topic} ({} bytes)",
            payload.len()
        );
        return;
    }
    let Ok(message) = std::str::from_utf8(payload) else {
        warn!("non utf8 payload on {topic}");
        return;
    };
    let message = message.trim();
    let now_ms = monotonic_ms();

    match topic {
        TOPIC_PROBE_TEMP_IN => {
            if let Some(value) = parse_plausible_temp(message) {
                app_state
                    .engine
                    .lock()
                    .await
                    .update_temperature_in(value, now_ms);
            }
        }
        TOPIC_PROBE_TEMP_OUT => {
            if let Some(value) = parse_plausible_temp(message) {
                app_state
                    .engine
                    .lock()
                    .await
                    .update_temperature_out(value, now_ms);
            }
        }
        TOPIC_PROBE_FLOW => {
            if let Ok(value) = message.parse::<f32>() {
                if value.is_finite() && value >= 0.0 {
                    app_state.engine.lock().await.update_flow_rate(value, now_ms);
                }
            }
        }
        TOPIC_CMD_TARGET => {
            if let Ok(value) = message.parse::<f32>() {
                if value.is_finite() {
                    let changed = app_state.engine.lock().await.set_target_temperature(value);
                    if changed {
                        info!("target temperature set to {value}");
                    }
                }
            }
        }
        TOPIC_CMD_MODE => {
            let mut engine = app_state.engine.lock().await;
            if message.eq_ignore_ascii_case("OFF") {
                engine.set_standby(true);
                info!("standby requested");
            } else {
                match message.parse::<HeaterMode>() {
                    Ok(mode) => {
                        engine.set_mode(mode);
                        // Dynamic tracking starts immediately; a consume
                        // session waits for the explicit start command.
                        if mode == HeaterMode::Dynamic {
                            engine.set_standby(false);
                        }
                        info!("mode set to {}", mode.as_str());
                    }
                    Err(err) => warn!("{err}"),
                }
            }
        }
        TOPIC_CMD_MAX_POWER => {
            if let Ok(value) = message.parse::<f32>() {
                if value.is_finite() {
                    app_state.engine.lock().await.set_max_power(value);
                }
            }
        }
        TOPIC_CMD_MIN_POWER => {
            if let Ok(value) = message.parse::<f32>() {
                if value.is_finite() {
                    app_state.engine.lock().await.set_min_power(value);
                }
            }
        }
        TOPIC_CMD_CONSUME_MAX => {
            if let Ok(value) = message.parse::<f32>() {
                if value.is_finite() {
                    app_state.engine.lock().await.set_max_consume(value);
                }
            }
        }
        TOPIC_CMD_CONSUME_START => {
            let started = app_state.engine.lock().await.start_consume(now_ms);
            if started {
                info!("consume session started");
            } else {
                warn!("consume start ignored outside consume mode");
            }
        }
        TOPIC_CMD_MANUAL_DUTY => {
            if let Ok(value) = message.parse::<u16>() {
                let accepted = app_state.engine.lock().await.set_manual_duty(value);
                if !accepted {
                    warn!("manual duty only honored in standby");
                }
            }
        }
        TOPIC_CMD_FAULT_RESET => {
            app_state.engine.lock().await.clear_fault();
            info!("fault cleared");
        }
        _ => {}
    }
}

fn parse_plausible_temp(message: &str) -> Option<f32> {
    let value = message.parse::<f32>().ok()?;
    // The sentinel (85.0) must pass through to the fault counter; only
    // physically impossible probe values are rejected here.
    (value.is_finite() && (-55.0..=125.0).contains(&value)).then_some(value)
}

/// Fast tick: local power read, one regulation step, actuation.
fn spawn_fast_loop(app_state: AppState, interval_ms: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
        let mut actuator = Actuator::default();

        loop {
            interval.tick().await;
            app_state.scheduler.schedule(MeterToken::LocalPower).await;

            let output = {
                let mut engine = app_state.engine.lock().await;
                engine.tick(monotonic_ms())
            };

            if actuator.apply(&output) {
                mirror_output(&app_state.mqtt, output.scr_enabled, output.pump_enabled).await;
            }
        }
    });
}

/// Slow tick: counter decay plus the consumption and house meter reads.
fn spawn_slow_loop(app_state: AppState, interval_ms: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));

        loop {
            interval.tick().await;

            let mode = {
                let mut engine = app_state.engine.lock().await;
                engine.on_slow_tick();
                engine.mode()
            };

            app_state
                .scheduler
                .schedule(MeterToken::LocalConsumption)
                .await;
            if mode == HeaterMode::Dynamic {
                app_state.scheduler.schedule(MeterToken::RemotePower).await;
            }
        }
    });
}

fn spawn_state_publish_loop(app_state: AppState, interval_ms: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));

        loop {
            interval.tick().await;

            let payload = {
                let engine = app_state.engine.lock().await;
                serde_json::to_vec(&engine.state_payload())
            };

            match payload {
                Ok(body) => {
                    if let Err(err) = app_state
                        .mqtt
                        .publish(TOPIC_HEATER_STATE, QoS::AtLeastOnce, true, body)
                        .await
                    {
                        warn!("state publish failed: {err}");
                    }
                }
                Err(err) => warn!("state serialization failed: {err}"),
            }
        }
    });
}

/// Best-effort mirror of the output lines; never blocks the control loop
/// beyond the client's bounded request queue.
async fn mirror_output(mqtt: &AsyncClient, scr: bool, pump: bool) {
    let on_off = |state: bool| if state { "ON" } else { "OFF" };
    if let Err(err) = mqtt
        .publish(TOPIC_SCR_STATE, QoS::AtMostOnce, true, on_off(scr))
        .await
    {
        warn!("scr state publish failed: {err}");
    }
    if let Err(err) = mqtt
        .publish(TOPIC_PUMP_STATE, QoS::AtMostOnce, true, on_off(pump))
        .await
    {
        warn!("pump state publish failed: {err}");
    }
}

pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
