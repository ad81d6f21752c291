//! ---
//! ems_section: "03-protocol-adapters"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "MQTT subscription adapter."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use helios_core::{SourceAdapter, SourceFilter, SourceUnit};
use helios_values::{
    apply_correction, ListenFn, ListeningSource, SourceKind, SourceState, ValueKey,
};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::extract;
use crate::rows::MqttSourceConfig;
use crate::store::SourceConfigStore;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

fn handle_publish(config: &MqttSourceConfig, state: &SourceState, topic: &str, payload: &[u8]) {
    let Ok(text) = std::str::from_utf8(payload) else {
        warn!(source = %state.key(), topic, "non-utf8 payload dropped");
        return;
    };
    for result in config.results.iter().filter(|r| r.topic == topic) {
        match extract::extract(text, &result.extraction) {
            Ok(raw) => {
                let value = apply_correction(raw, result.correction_factor, result.operator);
                state.update_value(
                    ValueKey::new(result.usage, result.result_id),
                    Utc::now(),
                    value,
                );
                state.clear_error();
            }
            Err(err) => {
                warn!(source = %state.key(), topic, error = %format!("{err:#}"), "payload extraction failed");
                state.record_error(err.to_string(), Some(format!("{err:?}")));
            }
        }
    }
}

/// Topics to subscribe for one session, deduplicated so that several
/// result rows on the same topic issue a single SUBSCRIBE.
fn subscription_topics(config: &MqttSourceConfig) -> Vec<&str> {
    let mut topics: Vec<&str> = Vec::with_capacity(config.results.len());
    for result in &config.results {
        if !topics.contains(&result.topic.as_str()) {
            topics.push(result.topic.as_str());
        }
    }
    topics
}

async fn subscribe_all(client: &AsyncClient, config: &MqttSourceConfig) -> Result<()> {
    for topic in subscription_topics(config) {
        client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .with_context(|| format!("subscribe to {topic} failed"))?;
    }
    Ok(())
}

/// Persistent broker session: pump the event loop until the token fires.
/// Subscriptions are issued on every CONNACK because the broker forgets a
/// clean session on reconnect. Poll errors are recorded and retried;
/// rumqttc re-establishes the session on the next poll.
async fn listen(
    config: Arc<MqttSourceConfig>,
    state: Arc<SourceState>,
    token: CancellationToken,
) -> Result<()> {
    let client_id = config
        .client_id
        .clone()
        .unwrap_or_else(|| format!("helios-{}", state.key().source_id));
    let mut options = MqttOptions::new(client_id, config.host.as_str(), config.port);
    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        options.set_credentials(username, password);
    }

    let (client, mut eventloop) = AsyncClient::new(options, 10);

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                let _ = client.disconnect().await;
                return Ok(());
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    handle_publish(&config, &state, &publish.topic, &publish.payload);
                }
                // Sessions are not persistent, so every (re)connection must
                // subscribe again or the broker never delivers another publish.
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    debug!(source = %state.key(), topics = config.results.len(), "mqtt session established; subscribing");
                    subscribe_all(&client, &config).await?;
                }
                Ok(_) => {}
                Err(err) => {
                    if token.is_cancelled() {
                        return Ok(());
                    }
                    debug!(source = %state.key(), error = %err, "mqtt connection lost; retrying");
                    state.record_error(err.to_string(), Some(format!("{err:?}")));
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                }
            }
        }
    }
}

/// Builds one push unit per configured broker session.
pub struct MqttAdapter {
    store: Arc<dyn SourceConfigStore>,
    history_capacity: usize,
}

impl MqttAdapter {
    pub fn new(store: Arc<dyn SourceConfigStore>, history_capacity: usize) -> Self {
        Self {
            store,
            history_capacity,
        }
    }
}

#[async_trait]
impl SourceAdapter for MqttAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Mqtt
    }

    async fn build_units(&self, filter: &SourceFilter) -> Result<Vec<SourceUnit>> {
        let rows = self.store.sources(filter).await?;
        let units = rows
            .into_iter()
            .filter_map(|decoded| match decoded.row {
                crate::registry::SourceRow::Mqtt(config) => {
                    let config = Arc::new(config);
                    let listen_fn: Arc<ListenFn> = Arc::new(move |state, token| {
                        let config = config.clone();
                        Box::pin(async move { listen(config, state, token).await })
                    });
                    Some(ListeningSource::new(decoded.key, self.history_capacity, listen_fn).into())
                }
                _ => None,
            })
            .collect();
        Ok(units)
    }
}
