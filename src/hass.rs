//! Home Assistant integration over MQTT.
//!
//! Every entity is announced with an MQTT discovery document and polled periodically. Values are
//! published retained to per-channel state topics and commands arrive on the matching `/set`
//! topics. The climate entity maps onto several channels, everything else has a single `state`.

use crate::connection::RegisterAccess;
use crate::entity::{self, Device, Entity, Platform, STATE, State, Traits, button, climate};
use futures::StreamExt as _;
use futures::stream::BoxStream;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::IntervalStream;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, trace, warn};

const ONLINE: &str = "online";
const OFFLINE: &str = "offline";
/// Delay before the MQTT event loop attempts to reconnect to the broker.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const TIME_PATTERN: &str = r"^([01]\d|2[0-3]):[0-5]\d$";

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "hass::Args")]
pub struct Args {
    /// The MQTT broker to connect to, e.g. `mqtt://localhost:1883`.
    ///
    /// Options such as `client_id`, `keep_alive_secs` or credentials may be given as query
    /// parameters. A client id is derived from the device if none is given.
    #[arg(long, short = 'm')]
    mqtt_broker: String,

    /// Topic prefix Home Assistant watches for discovery documents.
    #[arg(long, default_value = "homeassistant")]
    discovery_prefix: String,

    /// Topic prefix for entity states and commands.
    #[arg(long, default_value = "systemair")]
    topic_prefix: String,

    /// How often all entities are read from the unit.
    #[arg(long, default_value = "30s")]
    poll_interval: humantime::Duration,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not use `{1}` as the MQTT broker URL")]
    BrokerUrl(#[source] rumqttc::OptionError, String),
    #[error("could not publish to `{1}`")]
    Publish(#[source] rumqttc::ClientError, String),
    #[error("could not subscribe to `{1}`")]
    Subscribe(#[source] rumqttc::ClientError, String),
    #[error("the MQTT event loop stopped")]
    EventLoopGone,
    #[error("the MQTT client stopped")]
    ClientGone,
}

/// The topic layout for one device.
#[derive(Clone, Debug)]
pub struct Topics {
    topic_prefix: String,
    discovery_prefix: String,
    node_id: String,
}

impl Topics {
    pub fn new(args: &Args, device: &Device) -> Self {
        Topics {
            topic_prefix: args.topic_prefix.trim_end_matches('/').to_string(),
            discovery_prefix: args.discovery_prefix.trim_end_matches('/').to_string(),
            node_id: device.node_id(),
        }
    }

    pub fn state(&self, unique_id: &str, channel: &str) -> String {
        format!("{}/{unique_id}/{channel}", self.topic_prefix)
    }

    pub fn command(&self, unique_id: &str, channel: &str) -> String {
        format!("{}/{unique_id}/{channel}/set", self.topic_prefix)
    }

    pub fn availability(&self) -> String {
        format!("{}/{}/availability", self.topic_prefix, self.node_id)
    }

    pub fn discovery(&self, platform: Platform, unique_id: &str) -> String {
        format!(
            "{}/{}/{}/{unique_id}/config",
            self.discovery_prefix,
            component(platform),
            self.node_id
        )
    }

    /// Filter matching every command topic.
    pub fn command_filter(&self) -> String {
        format!("{}/+/+/set", self.topic_prefix)
    }

    /// Home Assistant announces its restarts here.
    pub fn status(&self) -> String {
        format!("{}/status", self.discovery_prefix)
    }

    /// Split a command topic into the unique id and the channel.
    pub fn parse_command<'t>(&self, topic: &'t str) -> Option<(&'t str, &'t str)> {
        let rest = topic.strip_prefix(self.topic_prefix.as_str())?.strip_prefix('/')?;
        let rest = rest.strip_suffix("/set")?;
        let (unique_id, channel) = rest.split_once('/')?;
        if unique_id.is_empty() || channel.is_empty() || channel.contains('/') {
            return None;
        }
        Some((unique_id, channel))
    }
}

/// The MQTT component an entity is announced as. Home Assistant has no MQTT time platform, so
/// times are exposed as validated text.
pub fn component(platform: Platform) -> &'static str {
    match platform {
        Platform::Time => "text",
        other => other.into(),
    }
}

/// The discovery document announcing `entity`.
pub fn discovery_payload(entity: &dyn Entity, device: &Device, topics: &Topics) -> Value {
    let uid = entity.unique_id(device);
    let name = Some(entity.name()).filter(|n| !n.is_empty());
    let descriptor = entity.descriptor();
    let mut doc = json!({
        "unique_id": uid,
        "object_id": uid,
        "name": name,
        "icon": descriptor.icon,
        "availability_topic": topics.availability(),
        "device": {
            "identifiers": [device.identifier()],
            "name": device.name(),
            "manufacturer": device.manufacturer(),
            "model": device.model_name(),
        },
    });
    if let Some(category) = descriptor.category {
        doc["entity_category"] = json!(category);
    }
    let state = topics.state(&uid, STATE);
    let command = topics.command(&uid, STATE);
    let extra = match descriptor.traits {
        Traits::Sensor { device_class, state_class, unit } => json!({
            "state_topic": state,
            "device_class": device_class,
            "state_class": state_class,
            "unit_of_measurement": unit,
        }),
        Traits::BinarySensor { device_class } => json!({
            "state_topic": state,
            "device_class": device_class,
            "payload_on": "ON",
            "payload_off": "OFF",
        }),
        Traits::Number { min, max, step, unit } => json!({
            "state_topic": state,
            "command_topic": command,
            "min": min,
            "max": max,
            "step": step,
            "unit_of_measurement": unit,
            "mode": "box",
        }),
        Traits::Select { options } => json!({
            "state_topic": state,
            "command_topic": command,
            "options": options,
        }),
        Traits::Button => json!({
            "command_topic": topics.command(&uid, button::PRESS),
            "payload_press": "PRESS",
        }),
        Traits::Switch => json!({
            "state_topic": state,
            "command_topic": command,
            "payload_on": "ON",
            "payload_off": "OFF",
            "state_on": "ON",
            "state_off": "OFF",
        }),
        Traits::Time => json!({
            "state_topic": state,
            "command_topic": command,
            "min": 5,
            "max": 5,
            "pattern": TIME_PATTERN,
        }),
        Traits::Climate { min, max, step, modes, presets } => json!({
            "current_temperature_topic": topics.state(&uid, climate::CURRENT_TEMPERATURE),
            "temperature_state_topic": topics.state(&uid, climate::TEMPERATURE),
            "temperature_command_topic": topics.command(&uid, climate::TEMPERATURE),
            "mode_state_topic": topics.state(&uid, climate::MODE),
            "mode_command_topic": topics.command(&uid, climate::MODE),
            "action_topic": topics.state(&uid, climate::ACTION),
            "preset_mode_state_topic": topics.state(&uid, climate::PRESET_MODE),
            "preset_mode_command_topic": topics.command(&uid, climate::PRESET_MODE),
            "json_attributes_topic": topics.state(&uid, climate::ATTRIBUTES),
            "modes": modes,
            "preset_modes": presets,
            "min_temp": min,
            "max_temp": max,
            "temp_step": step,
            "precision": 0.1,
            "temperature_unit": "C",
        }),
    };
    if let (Value::Object(doc), Value::Object(extra)) = (&mut doc, extra) {
        // Home Assistant rejects explicit nulls and empty units.
        doc.extend(extra.into_iter().filter(|(_, v)| !v.is_null() && v.as_str() != Some("")));
    }
    doc
}

/// An MQTT message to be published.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

impl Message {
    fn retained(topic: String, payload: impl Into<String>) -> Self {
        Message { topic, payload: payload.into(), retain: true }
    }
}

/// Payloads last published per topic.
#[derive(Default, Debug)]
struct Published(HashMap<String, String>);

impl Published {
    /// Record `payload` for `topic`, returning whether it differs from the previous one.
    fn changed(&mut self, topic: &str, payload: &str) -> bool {
        if self.0.get(topic).is_some_and(|p| p == payload) {
            return false;
        }
        self.0.insert(topic.to_string(), payload.to_string());
        true
    }

    fn clear(&mut self) {
        self.0.clear();
    }
}

pub type Readings = BoxStream<'static, (usize, Result<State, entity::Error>)>;

/// Read every entity once, in order.
fn read_all(entities: Arc<Vec<Box<dyn Entity>>>, hub: Arc<dyn RegisterAccess>) -> Readings {
    Box::pin(async_stream::stream! {
        for idx in 0..entities.len() {
            let result = entities[idx].update(&*hub).await;
            yield (idx, result);
        }
    })
}

/// Everything the bridge does apart from talking to the broker.
pub struct Bridge {
    device: Device,
    topics: Topics,
    hub: Arc<dyn RegisterAccess>,
    entities: Arc<Vec<Box<dyn Entity>>>,
    by_unique_id: HashMap<String, usize>,
    published: Published,
}

impl Bridge {
    pub fn new(
        device: Device,
        topics: Topics,
        hub: Arc<dyn RegisterAccess>,
        entities: Vec<Box<dyn Entity>>,
    ) -> Self {
        let by_unique_id =
            entities.iter().enumerate().map(|(idx, e)| (e.unique_id(&device), idx)).collect();
        Bridge {
            device,
            topics,
            hub,
            entities: Arc::new(entities),
            by_unique_id,
            published: Published::default(),
        }
    }

    /// Forget what has been published so that the next values are sent out regardless.
    pub fn reset(&mut self) {
        self.published.clear();
    }

    pub fn discovery(&self) -> Vec<Message> {
        self.entities
            .iter()
            .map(|entity| {
                let uid = entity.unique_id(&self.device);
                let doc = discovery_payload(entity.as_ref(), &self.device, &self.topics);
                Message::retained(self.topics.discovery(entity.platform(), &uid), doc.to_string())
            })
            .collect()
    }

    pub fn availability(&mut self, online: bool) -> Option<Message> {
        let topic = self.topics.availability();
        let payload = if online { ONLINE } else { OFFLINE };
        self.published.changed(&topic, payload).then(|| Message::retained(topic, payload))
    }

    /// Messages for the channels of `state` that changed since they were last published.
    pub fn state_messages(&mut self, idx: usize, state: &State) -> Vec<Message> {
        let Some(entity) = self.entities.get(idx) else {
            return Vec::new();
        };
        let uid = entity.unique_id(&self.device);
        let mut messages = Vec::new();
        for (channel, payload) in state.channels() {
            let topic = self.topics.state(&uid, channel);
            if self.published.changed(&topic, &payload) {
                messages.push(Message::retained(topic, payload));
            }
        }
        messages
    }

    pub fn read_all(&self) -> Readings {
        read_all(Arc::clone(&self.entities), Arc::clone(&self.hub))
    }

    /// Apply a command received on `topic` and return the refreshed state of the entity.
    pub async fn command(&mut self, topic: &str, payload: &str) -> Vec<Message> {
        let Some((uid, channel)) = self.topics.parse_command(topic) else {
            debug!(message = "ignoring message on an unexpected topic", topic);
            return Vec::new();
        };
        let Some(&idx) = self.by_unique_id.get(uid) else {
            debug!(message = "command for an unknown entity", uid);
            return Vec::new();
        };
        let entities = Arc::clone(&self.entities);
        let entity = &entities[idx];
        info!(message = "applying command", key = entity.key(), channel, payload);
        if let Err(e) = entity.command(&*self.hub, channel, payload).await {
            warn!(
                message = "command failed",
                key = entity.key(),
                error = (&e as &dyn std::error::Error)
            );
        }
        let refreshed = entity.update(&*self.hub).await;
        match refreshed {
            Ok(state) => self.state_messages(idx, &state),
            Err(e) => {
                warn!(
                    message = "could not refresh after a command",
                    key = entity.key(),
                    error = (&e as &dyn std::error::Error)
                );
                Vec::new()
            }
        }
    }

    fn entity_key(&self, idx: usize) -> &'static str {
        self.entities.get(idx).map_or("?", |e| e.key())
    }
}

/// Progress of an ongoing poll.
struct Poll {
    readings: Readings,
    succeeded: usize,
}

impl Poll {
    fn start(bridge: &Bridge) -> Self {
        Poll { readings: bridge.read_all(), succeeded: 0 }
    }
}

#[derive(Debug)]
enum MqttEvent {
    Connected,
    Disconnected,
    Message { topic: String, payload: String },
}

/// What the bridge asks of the MQTT client.
#[derive(Debug)]
enum Outgoing {
    Publish(Message),
    Subscribe(String),
}

async fn next_reading(poll: &mut Option<Poll>) -> Option<(usize, Result<State, entity::Error>)> {
    match poll {
        Some(poll) => poll.readings.next().await,
        None => std::future::pending().await,
    }
}

fn mqtt_options(args: &Args, device: &Device) -> Result<MqttOptions, Error> {
    let mut url = args.mqtt_broker.clone();
    if !url.contains("client_id=") {
        let separator = if url.contains('?') { '&' } else { '?' };
        url = format!("{url}{separator}client_id=systemair-save-hass-{}", device.node_id());
    }
    let mut options =
        MqttOptions::parse_url(url).map_err(|e| Error::BrokerUrl(e, args.mqtt_broker.clone()))?;
    let topics = Topics::new(args, device);
    options.set_last_will(LastWill::new(topics.availability(), OFFLINE, QoS::AtLeastOnce, true));
    Ok(options)
}

async fn publish(client: &AsyncClient, message: Message) -> Result<(), Error> {
    let Message { topic, payload, retain } = message;
    trace!(message = "publishing", topic = topic.as_str(), payload = payload.as_str());
    client
        .publish(&topic, QoS::AtLeastOnce, retain, payload)
        .await
        .map_err(|e| Error::Publish(e, topic))
}

async fn subscribe(client: &AsyncClient, filter: String) -> Result<(), Error> {
    client.subscribe(&filter, QoS::AtLeastOnce).await.map_err(|e| Error::Subscribe(e, filter))
}

fn emit(
    outgoing: &mpsc::UnboundedSender<Outgoing>,
    messages: impl IntoIterator<Item = Message>,
) -> Result<(), Error> {
    for message in messages {
        outgoing.send(Outgoing::Publish(message)).map_err(|_| Error::ClientGone)?;
    }
    Ok(())
}

/// Start a poll, or have one start right after the poll that is currently running.
fn request_poll(bridge: &Bridge, poll: &mut Option<Poll>, poll_again: &mut bool) {
    if poll.is_some() {
        *poll_again = true;
    } else {
        *poll = Some(Poll::start(bridge));
    }
}

/// React to broker events, poll ticks and readings until the event source goes away.
async fn serve<T>(
    mut bridge: Bridge,
    mut events: mpsc::UnboundedReceiver<MqttEvent>,
    mut ticks: T,
    outgoing: mpsc::UnboundedSender<Outgoing>,
) -> Result<(), Error>
where
    T: futures::Stream + Unpin,
{
    let topics = bridge.topics.clone();
    let subscribe_to =
        |filter: String| outgoing.send(Outgoing::Subscribe(filter)).map_err(|_| Error::ClientGone);
    let mut connected = false;
    let mut poll: Option<Poll> = None;
    // Set when the entities were announced again in the middle of a poll.
    let mut poll_again = false;
    loop {
        tokio::select! {
            event = events.recv() => match event.ok_or(Error::EventLoopGone)? {
                MqttEvent::Connected => {
                    info!(message = "connected to the MQTT broker", entities = bridge.entities.len());
                    connected = true;
                    bridge.reset();
                    emit(&outgoing, bridge.discovery())?;
                    subscribe_to(topics.command_filter())?;
                    subscribe_to(topics.status())?;
                    emit(&outgoing, bridge.availability(true))?;
                    request_poll(&bridge, &mut poll, &mut poll_again);
                }
                MqttEvent::Disconnected => connected = false,
                MqttEvent::Message { topic, payload } if topic == topics.status() => {
                    if payload == ONLINE {
                        info!("Home Assistant came online, announcing entities again");
                        bridge.reset();
                        emit(&outgoing, bridge.discovery())?;
                        emit(&outgoing, bridge.availability(true))?;
                        request_poll(&bridge, &mut poll, &mut poll_again);
                    }
                }
                MqttEvent::Message { topic, payload } => {
                    let messages = bridge.command(&topic, &payload).await;
                    emit(&outgoing, messages)?;
                }
            },
            Some(_) = ticks.next() => {
                if !connected {
                    trace!("not connected, skipping poll");
                } else if poll.is_some() {
                    debug!("previous poll still running, skipping");
                } else {
                    poll = Some(Poll::start(&bridge));
                }
            },
            reading = next_reading(&mut poll) => match reading {
                Some((idx, Ok(state))) => {
                    if state != State::Stateless {
                        if let Some(poll) = &mut poll {
                            poll.succeeded += 1;
                        }
                    }
                    emit(&outgoing, bridge.state_messages(idx, &state))?;
                }
                Some((idx, Err(e))) => {
                    warn!(
                        message = "could not read entity",
                        key = bridge.entity_key(idx),
                        error = (&e as &dyn std::error::Error)
                    );
                }
                None => {
                    let succeeded = poll.take().map_or(0, |p| p.succeeded);
                    debug!(message = "poll finished", succeeded);
                    emit(&outgoing, bridge.availability(succeeded > 0))?;
                    if std::mem::take(&mut poll_again) {
                        poll = Some(Poll::start(&bridge));
                    }
                }
            },
        }
    }
}

/// Bridge the unit behind `hub` to Home Assistant until the MQTT client fails.
pub async fn run(args: Args, device: Device, hub: Arc<dyn RegisterAccess>) -> Result<(), Error> {
    let options = mqtt_options(&args, &device)?;
    let topics = Topics::new(&args, &device);
    let (client, mut eventloop) = AsyncClient::new(options, 64);
    let (event_sender, events) = mpsc::unbounded_channel();
    let _eventloop = AbortOnDropHandle::new(tokio::spawn(async move {
        loop {
            let event = match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => MqttEvent::Connected,
                Ok(Event::Incoming(Packet::Publish(p))) => MqttEvent::Message {
                    payload: String::from_utf8_lossy(&p.payload).into_owned(),
                    topic: p.topic,
                },
                Ok(_) => continue,
                Err(e) => {
                    warn!(
                        message = "MQTT connection failed, reconnecting",
                        error = (&e as &dyn std::error::Error),
                        delay = ?RECONNECT_DELAY,
                    );
                    if event_sender.send(MqttEvent::Disconnected).is_err() {
                        return;
                    }
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };
            if event_sender.send(event).is_err() {
                return;
            }
        }
    }));

    let bridge = Bridge::new(device, topics, hub, entity::all_entities());
    let mut interval = tokio::time::interval((*args.poll_interval).max(Duration::from_secs(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let (outgoing, mut requests) = mpsc::unbounded_channel();
    let forward = async {
        while let Some(request) = requests.recv().await {
            match request {
                Outgoing::Publish(message) => publish(&client, message).await?,
                Outgoing::Subscribe(filter) => subscribe(&client, filter).await?,
            }
        }
        Ok::<_, Error>(())
    };
    futures::try_join!(serve(bridge, events, IntervalStream::new(interval), outgoing), forward)?;
    Ok(())
}
