use std::time::Duration;

use anyhow::Context;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use tracing::{info, warn};

use pvheater_common::{
    TOPIC_PROBE_FLOW, TOPIC_PROBE_STATUS, TOPIC_PROBE_TEMP_IN, TOPIC_PROBE_TEMP_OUT,
};

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);

    let mut mqtt_options = MqttOptions::new("pvheater-probe", mqtt_host, mqtt_port);

    if let Ok(user) = std::env::var("MQTT_USER") {
        let pass = std::env::var("MQTT_PASS").unwrap_or_default();
        mqtt_options.set_credentials(user, pass);
    }

    let (mqtt, mut eventloop) = AsyncClient::new(mqtt_options, 32);

    mqtt.publish(TOPIC_PROBE_STATUS, QoS::AtLeastOnce, true, "online")
        .await
        .context("failed to publish probe online status")?;

    tokio::spawn(async move {
        loop {
            if let Err(err) = eventloop.poll().await {
                warn!("probe mqtt poll error: {err}");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    });

    info!("probe publisher started");

    let mut tick: u64 = 0;
    let mut interval = tokio::time::interval(Duration::from_secs(2));

    loop {
        interval.tick().await;
        tick = tick.saturating_add(1);

        // Hardware integration point:
        // replace these simulated readings with the DS18B20 pair and the hall
        // flow counter drivers on the target build.
        let temp_in = 24.0 + ((tick % 8) as f32 * 0.2);
        let temp_out = 38.0 + ((tick % 12) as f32 * 0.5);
        let flow = 9.0 + ((tick % 4) as f32 * 0.25);

        mqtt.publish(
            TOPIC_PROBE_TEMP_IN,
            QoS::AtLeastOnce,
            true,
            format!("{temp_in:.1}"),
        )
        .await
        .context("failed to publish inlet temperature")?;
        mqtt.publish(
            TOPIC_PROBE_TEMP_OUT,
            QoS::AtLeastOnce,
            true,
            format!("{temp_out:.1}"),
        )
        .await
        .context("failed to publish outlet temperature")?;
        mqtt.publish(TOPIC_PROBE_FLOW, QoS::AtLeastOnce, true, format!("{flow:.2}"))
            .await
            .context("failed to publish flow rate")?;
    }
}
