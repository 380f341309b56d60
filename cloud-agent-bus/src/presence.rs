use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use rumqttc::{Event, EventLoop, Outgoing, Packet};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::util::config::{Paths, Settings};
use crate::util::connectivity::ConnectionState;
use crate::util::providers::Providers;

use super::broker::{self, Broker, BrokerUrl, BusError};

/// Topic the controller publishes its hardware revision on
pub const HW_REVISION_TOPIC: &str = "/devices/system/controls/HW Revision";

/// Topic listing the configured providers
pub const PROVIDERS_TOPIC: &str = "/wb-cloud-agent/providers";

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// How long pending messages may take to reach the broker on shutdown
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

const CONTROLS: [(&str, &str); 3] = [
    ("status", "Status"),
    ("activation_link", "Link"),
    ("cloud_base_url", "URL"),
];

/// Drops every request
struct Detached;

impl Broker for Detached {
    fn publish(&self, _topic: &str, _payload: &str) -> Result<(), BusError> {
        Ok(())
    }

    fn subscribe(&self, _topic: &str) -> Result<(), BusError> {
        Ok(())
    }

    fn unsubscribe(&self, _topic: &str) -> Result<(), BusError> {
        Ok(())
    }

    fn disconnect(&self) -> Result<(), BusError> {
        Ok(())
    }
}

#[derive(Default)]
struct State {
    /// Last value published for each control, in publish order
    controls: Vec<(String, String)>,
    providers: Option<String>,
    was_disconnected: bool,
    link: ConnectionState,
}

/// The agent's presence on the local message bus.
///
/// Publishes a virtual device reflecting the cloud connection status and
/// keeps the last published control values so they can be restored after
/// the broker connection drops.
pub struct Presence {
    broker: Arc<dyn Broker>,
    prefix: String,
    state: Mutex<State>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Presence {
    pub fn new(broker: Arc<dyn Broker>, prefix: impl Into<String>) -> Self {
        Self {
            broker,
            prefix: prefix.into(),
            state: Mutex::new(State::default()),
            event_loop: Mutex::new(None),
        }
    }

    /// A presence that keeps control values without a broker behind it
    pub fn detached(prefix: impl Into<String>) -> Arc<Presence> {
        Arc::new(Presence::new(Arc::new(Detached), prefix))
    }

    /// Connect to the broker configured in `settings`.
    ///
    /// If `update_status` is set, the broker is asked to set the status
    /// control to `stopped` if the agent goes away without notice, and the
    /// status is set to `starting`.
    ///
    /// Returns the presence along with a channel receiving the controller
    /// hardware revision once it is seen on the bus.
    pub fn start(
        settings: &Settings,
        update_status: bool,
    ) -> Result<(Arc<Presence>, mpsc::UnboundedReceiver<String>), BusError> {
        let url: BrokerUrl = settings.broker_url.parse()?;
        let client_id = format!("wb-cloud-agent@{}", settings.provider);
        let status_topic = format!("{}/controls/status", settings.mqtt_prefix);
        let last_will = update_status.then(|| (status_topic, "stopped".to_owned()));

        debug!("connecting to MQTT broker at {url} as {client_id}");
        let (client, eventloop) = broker::connect(&url, &client_id, last_will);

        let presence = Arc::new(Presence::new(Arc::new(client), &settings.mqtt_prefix));
        let (hw_tx, hw_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_event_loop(eventloop, Arc::downgrade(&presence), hw_tx));
        *presence
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        if update_status {
            presence.publish_ctrl("status", "starting");
        }

        Ok((presence, hw_rx))
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, topic: &str, payload: &str) {
        if let Err(e) = self.broker.publish(topic, payload) {
            error!("failed to publish to {topic}: {e}");
        }
    }

    /// Publish a control value, remembering it for reconnects
    pub fn publish_ctrl(&self, name: &str, value: &str) {
        {
            let mut state = self.state();
            match state.controls.iter_mut().find(|(n, _)| n == name) {
                Some((_, v)) => *v = value.to_owned(),
                None => state.controls.push((name.to_owned(), value.to_owned())),
            }
        }
        self.publish(&format!("{}/controls/{name}", self.prefix), value);
    }

    /// The last value published for a control
    pub fn control(&self, name: &str) -> Option<String> {
        self.state()
            .controls
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    }

    /// Publish the virtual device metadata
    pub fn publish_vdev(&self) {
        self.publish(&format!("{}/meta/name", self.prefix), "cloud status");
        self.publish(&format!("{}/meta/driver", self.prefix), "wb-cloud-agent");
        for (order, (control, title)) in CONTROLS.iter().enumerate() {
            let meta = json!({
                "type": "text",
                "readonly": true,
                "order": order + 1,
                "title": {"en": title},
            });
            self.publish(
                &format!("{}/controls/{control}/meta", self.prefix),
                &meta.to_string(),
            );
        }
    }

    /// Clear every retained topic of the virtual device
    pub fn remove_vdev(&self) {
        self.publish(&format!("{}/meta/name", self.prefix), "");
        self.publish(&format!("{}/meta/driver", self.prefix), "");
        for (control, _) in CONTROLS {
            self.publish(&format!("{}/controls/{control}/meta", self.prefix), "");
        }
        for (control, _) in CONTROLS {
            self.publish(&format!("{}/controls/{control}", self.prefix), "");
        }
    }

    pub fn publish_providers(&self, providers: &[String]) {
        let list = providers.join(",");
        self.state().providers = Some(list.clone());
        self.publish(PROVIDERS_TOPIC, &list);
    }

    /// Publish the providers currently configured on disk
    pub async fn update_providers_list(&self, paths: &Paths) {
        match Providers::new(paths).names().await {
            Ok(names) => self.publish_providers(&names),
            Err(e) => error!("failed to list providers: {e}"),
        }
    }

    pub fn disconnect(&self) {
        if let Err(e) = self.broker.disconnect() {
            debug!("failed to disconnect from the MQTT broker: {e}");
        }
    }

    /// Disconnect and wait for queued messages to be sent
    pub async fn shutdown(&self) {
        self.disconnect();

        let handle = self
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(FLUSH_TIMEOUT, &mut handle).await.is_err() {
                debug!("MQTT event loop did not finish in time");
                handle.abort();
            }
        }
    }

    fn on_connect(&self) {
        let (replay, providers) = {
            let mut state = self.state();
            if state.link.update(true) {
                info!("connected to the MQTT broker");
            }
            if state.was_disconnected {
                state.was_disconnected = false;
                (Some(state.controls.clone()), state.providers.clone())
            } else {
                (None, None)
            }
        };

        if let Some(controls) = replay {
            debug!("restoring virtual device after reconnect");
            self.publish_vdev();
            for (name, value) in controls {
                self.publish(&format!("{}/controls/{name}", self.prefix), &value);
            }
            if let Some(providers) = providers {
                self.publish(PROVIDERS_TOPIC, &providers);
            }
        }

        if let Err(e) = self.broker.subscribe(HW_REVISION_TOPIC) {
            error!("failed to subscribe to {HW_REVISION_TOPIC}: {e}");
        }
    }

    fn on_connection_error(&self, err: &rumqttc::ConnectionError) {
        let mut state = self.state();
        state.was_disconnected = true;
        if state.link.update(false) {
            warn!("MQTT connection lost: {err}");
        }
    }

    fn on_hw_revision(&self, revision: String, hw_tx: &mpsc::UnboundedSender<String>) {
        if let Err(e) = self.broker.unsubscribe(HW_REVISION_TOPIC) {
            debug!("failed to unsubscribe from {HW_REVISION_TOPIC}: {e}");
        }
        // the receiver may already be gone during shutdown
        let _ = hw_tx.send(revision);
    }
}

#[instrument(name = "bus", skip_all)]
async fn run_event_loop(
    mut eventloop: EventLoop,
    presence: Weak<Presence>,
    hw_tx: mpsc::UnboundedSender<String>,
) {
    loop {
        let event = eventloop.poll().await;
        let Some(presence) = presence.upgrade() else {
            break;
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => presence.on_connect(),
            Ok(Event::Incoming(Packet::Publish(publish))) if publish.topic == HW_REVISION_TOPIC => {
                let revision = String::from_utf8_lossy(&publish.payload).into_owned();
                debug!("received hardware revision {revision}");
                presence.on_hw_revision(revision, &hw_tx);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                presence.on_connection_error(&e);
                drop(presence);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
    debug!("MQTT event loop finished");
}
