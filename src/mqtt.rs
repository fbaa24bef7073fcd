//! MQTT session with The Things Stack

use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, SubscribeReasonCode, Transport,
};

use crate::{
    config::{MqttConfig, TtnConfig},
    errors::RecorderError,
    retry::{Backoff, RetryPolicy},
    shutdown::ShutdownHandle,
};

/// Raw uplink as delivered by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uplink {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Connection state of the broker session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Subscribed,
}

/// What the event task has to do after an event
#[derive(Debug, PartialEq)]
pub enum SessionAction {
    /// Broker accepted the connection, (re)subscribe
    Subscribe,
    /// Hand an uplink to the pipeline
    Deliver(Uplink),
    /// Connection failed, wait before polling again
    Backoff(Duration),
    Idle,
}

/// Session state machine
///
/// Kept free of I/O so that connection handling can be tested by feeding it
/// events. `rumqttc` reconnects on the next poll after an error; the
/// subscription is not restored by the library, so every accepted ConnAck
/// produces a [`SessionAction::Subscribe`].
#[derive(Debug)]
pub struct Session {
    state: SessionState,
    backoff: Backoff,
}

impl Session {
    pub fn new(reconnect: RetryPolicy) -> Self {
        Self {
            state: SessionState::Connecting,
            backoff: Backoff::new(reconnect),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Called once the backoff delay has elapsed
    pub fn reconnecting(&mut self) {
        self.state = SessionState::Connecting;
    }

    pub fn on_event(&mut self, event: Result<Event, ConnectionError>) -> SessionAction {
        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    info!(
                        "Connected to MQTT broker (session present: {})",
                        ack.session_present
                    );
                    self.backoff.reset();
                    self.state = SessionState::Subscribed;
                    SessionAction::Subscribe
                } else {
                    error!("Connection refused by broker: {:?}", ack.code);
                    self.disconnected()
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if self.state == SessionState::Subscribed {
                    debug!("Received message on {}", publish.topic);
                    SessionAction::Deliver(Uplink {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    })
                } else {
                    warn!(
                        "Ignoring message on {} while {:?}",
                        publish.topic, self.state
                    );
                    SessionAction::Idle
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    error!("Broker rejected subscription: {:?}", ack.return_codes);
                } else {
                    info!("Subscription confirmed");
                }
                SessionAction::Idle
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("Broker closed the session");
                self.state = SessionState::Disconnected;
                SessionAction::Idle
            }
            Ok(_) => SessionAction::Idle,
            Err(ConnectionError::ConnectionRefused(code)) => {
                error!("Connection refused by broker: {:?}", code);
                self.disconnected()
            }
            Err(e) => {
                error!("MQTT Error: {}", e);
                self.disconnected()
            }
        }
    }

    fn disconnected(&mut self) -> SessionAction {
        self.state = SessionState::Disconnected;
        SessionAction::Backoff(self.backoff.next_delay())
    }
}

/// MQTT client for receiving tracker uplinks
pub struct MqttClientBuilder {
    client: AsyncClient,
    event_loop: EventLoop,
    topic: String,
    reconnect: RetryPolicy,
    tx: mpsc::Sender<Uplink>,
    rx: mpsc::Receiver<Uplink>,
}

pub struct MqttClient {
    rx: mpsc::Receiver<Uplink>,
    handle: tokio::task::JoinHandle<Result<(), RecorderError>>,
}

impl MqttClientBuilder {
    /// Create a TLS client authenticated with the application credentials
    pub fn new(ttn: &TtnConfig, mqtt: &MqttConfig) -> Self {
        let host = ttn.broker_host();
        info!(
            "Connecting to {}:{} as {} (tenant {})",
            host, mqtt.port, ttn.app_id, ttn.tenant
        );

        let mut mqtt_options = MqttOptions::new(&ttn.app_id, host, mqtt.port);
        mqtt_options.set_credentials(&ttn.app_id, &ttn.api_key);
        mqtt_options.set_transport(Transport::tls_with_default_config());
        mqtt_options.set_keep_alive(mqtt.keep_alive);
        // Missed messages are not replayed after a reconnect
        mqtt_options.set_clean_session(true);

        let (client, event_loop) = AsyncClient::new(mqtt_options, 10);
        let (tx, rx) = mpsc::channel(mqtt.channel_capacity);

        Self {
            client,
            event_loop,
            topic: mqtt.topic.clone(),
            reconnect: mqtt.reconnect.clone(),
            tx,
            rx,
        }
    }

    /// Start the event loop task
    ///
    /// Subscription happens in the event loop on every ConnAck.
    pub fn connect(self, shutdown: ShutdownHandle) -> MqttClient {
        let handle = tokio::spawn(Self::process_events(
            self.tx,
            self.event_loop,
            self.client,
            self.topic,
            Session::new(self.reconnect),
            shutdown,
        ));

        MqttClient {
            rx: self.rx,
            handle,
        }
    }

    /// Process MQTT events until shutdown or until the receiver is dropped
    ///
    /// NOTE: If queuing the subscription fails, the loop will break and
    /// return an error. This only happens when the event loop is gone.
    async fn process_events(
        tx: mpsc::Sender<Uplink>,
        mut event_loop: EventLoop,
        client: AsyncClient,
        topic: String,
        mut session: Session,
        mut shutdown: ShutdownHandle,
    ) -> Result<(), RecorderError> {
        loop {
            let event = tokio::select! {
                event = event_loop.poll() => event,
                _ = shutdown.wait() => {
                    Self::disconnect(&client, &mut event_loop).await;
                    break Ok(());
                }
            };

            match session.on_event(event) {
                SessionAction::Subscribe => {
                    info!("Subscribing to topic: {}", topic);
                    if let Err(e) = client.subscribe(&topic, QoS::AtLeastOnce).await {
                        error!("Failed to subscribe: {}", e);
                        break Err(e.into());
                    }
                }
                SessionAction::Deliver(uplink) => {
                    if !deliver(&tx, uplink) {
                        info!("Uplink receiver closed, stopping MQTT session");
                        break Ok(());
                    }
                }
                SessionAction::Backoff(delay) => {
                    warn!("Reconnecting in {:?}", delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => session.reconnecting(),
                        _ = shutdown.wait() => break Ok(()),
                    }
                }
                SessionAction::Idle => {}
            }
        }
    }

    async fn disconnect(client: &AsyncClient, event_loop: &mut EventLoop) {
        info!("Disconnecting from MQTT broker");
        if let Err(e) = client.disconnect().await {
            warn!("Failed to queue disconnect: {}", e);
            return;
        }
        // Drive the event loop until the disconnect packet is out
        let flushed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        })
        .await;
        if flushed.is_err() {
            warn!("Timed out waiting for disconnect to be sent");
        }
    }
}

/// Hand an uplink to the pipeline without waiting for room in the channel
///
/// The event loop also answers keep-alive pings, so it must not stall while
/// the pipeline is busy retrying a write. When the channel is full the uplink
/// is dropped. Returns `false` once the receiver is gone.
fn deliver(tx: &mpsc::Sender<Uplink>, uplink: Uplink) -> bool {
    match tx.try_send(uplink) {
        Ok(()) => true,
        Err(TrySendError::Full(uplink)) => {
            warn!("Uplink channel full, dropping message on {}", uplink.topic);
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

impl MqttClient {
    /// Channel of uplinks in broker delivery order
    pub fn uplinks(&mut self) -> &mut mpsc::Receiver<Uplink> {
        &mut self.rx
    }

    /// Wait for the event loop task to finish
    pub async fn join(self) -> Result<(), RecorderError> {
        drop(self.rx);
        self.handle.await?
    }
}
