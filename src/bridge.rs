//! Messaging bridge between serial lines, readings and one MQTT broker.
//!
//! A [`Bridge`] owns one broker connection (local or cloud) and everything
//! bound to it: publish timers, subscriptions, command listeners and report
//! timers. Inbound messages of a connection are forwarded by exactly one
//! dispatcher task into the gateway loop, which asks [`Bridge::route`] what to
//! do with them.
use crate::config::{
    channel_or_default, BrokerConfig, BrokerId, ChannelConfig, CommandBinding, CommandKind,
    ExtractionRule, PublishBinding, Qos, ReportBinding, ReportSource, SubscribeBinding,
};
use crate::io::output_level;
use crate::readings::{Readings, Source};
use crate::scheduler::{Scheduler, TimerKey};
use crate::serial::{ConnectionManager, LineValue};
use crate::{Error, Result};
use async_trait::async_trait;
use log::*;
use paho_mqtt as paho;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Topic and payload of a received message, as delivered by a connector.
pub type InboundMessages = mpsc::UnboundedReceiver<(String, Vec<u8>)>;

/// A received message, tagged with the broker it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub broker: BrokerId,
    pub topic: String,
    pub payload: Vec<u8>,
}

/// An established broker connection.
#[async_trait]
pub trait BrokerLink: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos, retain: bool) -> Result<()>;
    async fn subscribe(&self, topic: &str, qos: Qos) -> Result<()>;
    async fn unsubscribe(&self, topic: &str) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
}

/// Establishes broker connections.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(
        &self,
        broker: BrokerId,
        config: &BrokerConfig,
    ) -> Result<(Arc<dyn BrokerLink>, InboundMessages)>;
}

/// Connects with the Eclipse Paho client.
#[derive(Debug, Default)]
pub struct PahoConnector;

#[async_trait]
impl BrokerConnector for PahoConnector {
    async fn connect(
        &self,
        broker: BrokerId,
        config: &BrokerConfig,
    ) -> Result<(Arc<dyn BrokerLink>, InboundMessages)> {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("iogate-{broker}"));
        let create_opts = paho::CreateOptionsBuilder::new()
            .server_uri(&config.url)
            .client_id(client_id)
            .finalize();
        let mut client = paho::AsyncClient::new(create_opts)?;

        let conn_opts = {
            let mut conn_builder = paho::ConnectOptionsBuilder::with_mqtt_version(config.mqtt_version);
            conn_builder
                .keep_alive_interval(config.keep_alive)
                .clean_session(config.clean_session)
                .connect_timeout(config.connect_timeout)
                .automatic_reconnect(config.reconnect_period, config.reconnect_period);
            if let Some(user_name) = &config.username {
                conn_builder.user_name(user_name);
            }
            if let Some(password) = &config.password {
                conn_builder.password(password);
            }
            if let Some(will) = &config.last_will {
                let message = if will.retain {
                    paho::Message::new_retained(&will.topic, will.payload.clone(), will.qos.as_i32())
                } else {
                    paho::Message::new(&will.topic, will.payload.clone(), will.qos.as_i32())
                };
                conn_builder.will_message(message);
            }
            conn_builder.finalize()
        };

        // Get message stream before connecting.
        let stream = client.get_stream(25);
        client
            .connect(conn_opts)
            .await
            .map_err(|err| Error::Connection {
                target: config.url.clone(),
                reason: err.to_string(),
            })?;

        let (sender, messages) = mpsc::unbounded_channel();
        let url = config.url.clone();
        tokio::spawn(async move {
            while let Ok(message) = stream.recv().await {
                match message {
                    Some(message) => {
                        let received = (message.topic().to_string(), message.payload().to_vec());
                        if sender.send(received).is_err() {
                            break;
                        }
                    }
                    // A "None" means we were disconnected.
                    None => warn!("Lost connection to {url}, waiting for automatic reconnect"),
                }
            }
            debug!("Message stream of {url} ended");
        });

        Ok((Arc::new(PahoLink { client }), messages))
    }
}

pub struct PahoLink {
    client: paho::AsyncClient,
}

#[async_trait]
impl BrokerLink for PahoLink {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos, retain: bool) -> Result<()> {
        let message = if retain {
            paho::Message::new_retained(topic, payload, qos.as_i32())
        } else {
            paho::Message::new(topic, payload, qos.as_i32())
        };
        self.client.publish(message).await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: Qos) -> Result<()> {
        self.client.subscribe(topic, qos.as_i32()).await?;
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.client.unsubscribe(topic).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.client.disconnect(None).await?;
        Ok(())
    }
}

/// Reduces `value` to `{key: value[key]}`; without a rule the value is unchanged.
/// A missing key yields an empty object.
pub fn extract(rule: Option<&ExtractionRule>, value: Value) -> Value {
    let Some(rule) = rule else {
        return value;
    };
    let mut reduced = Map::new();
    if let Some(field) = value.get(&rule.key) {
        reduced.insert(rule.key.clone(), field.clone());
    }
    Value::Object(reduced)
}

/// A message ready to be published from its own task.
pub struct Publish {
    link: Arc<dyn BrokerLink>,
    topic: String,
    payload: Vec<u8>,
    qos: Qos,
    retain: bool,
}

impl Publish {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub async fn execute(self) -> Result<()> {
        self.link
            .publish(&self.topic, self.payload, self.qos, self.retain)
            .await?;
        trace!("Published to {}", self.topic);
        Ok(())
    }
}

/// A decoded command message.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Register {
        device: u8,
        function_code: u8,
        register: u16,
        value: Value,
    },
    DigitalOutput {
        output: String,
        high: bool,
    },
}

#[derive(Deserialize)]
struct CommandPayload {
    #[serde(default, alias = "deviceID", alias = "output")]
    target: Option<Value>,
    #[serde(default, alias = "functionCode")]
    operation: Option<Value>,
    #[serde(default, alias = "registerAddress")]
    address: Option<Value>,
    #[serde(default)]
    value: Value,
}

fn command_number<T: TryFrom<u64>>(field: Option<&Value>, name: &str) -> Result<T> {
    let number = match field {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    number
        .and_then(|n| T::try_from(n).ok())
        .ok_or_else(|| Error::Protocol(format!("Command field '{name}' is missing or invalid")))
}

impl Command {
    pub fn parse(kind: CommandKind, payload: &[u8]) -> Result<Self> {
        let payload: CommandPayload = serde_json::from_slice(payload)?;
        match kind {
            CommandKind::Register => Ok(Command::Register {
                device: command_number(payload.target.as_ref(), "target")?,
                function_code: command_number(payload.operation.as_ref(), "operation")?,
                register: command_number(payload.address.as_ref(), "address")?,
                value: payload.value,
            }),
            CommandKind::DigitalOutput => {
                let output = match payload.target {
                    Some(Value::String(output)) => output,
                    _ => return Err(Error::Protocol("Command field 'target' is missing".into())),
                };
                Ok(Command::DigitalOutput {
                    output,
                    high: output_level(&payload.value)?,
                })
            }
        }
    }
}

/// What the gateway has to do with an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Write the value to a serial line.
    Serial { line: String, value: Value },
    /// Execute a command, then acknowledge it.
    Command {
        binding: CommandBinding,
        command: Command,
        raw: String,
    },
}

/// Value forwarded to a serial line for a subscribed message.
fn forward_value(binding: &SubscribeBinding, payload: &[u8]) -> Result<Value> {
    match &binding.extract {
        Some(rule) => {
            let value: Value = serde_json::from_slice(payload)?;
            Ok(extract(Some(rule), value))
        }
        None => Ok(Value::String(String::from_utf8_lossy(payload).into_owned())),
    }
}

pub struct Bridge {
    id: BrokerId,
    connector: Arc<dyn BrokerConnector>,
    inbound: mpsc::UnboundedSender<Inbound>,
    link: Option<Arc<dyn BrokerLink>>,
    messages: Option<InboundMessages>,
    dispatcher: Option<JoinHandle<()>>,
    publishing: BTreeMap<(String, String), PublishBinding>,
    subscriptions: BTreeMap<String, SubscribeBinding>,
    commands: BTreeMap<String, CommandBinding>,
    reports: BTreeMap<String, ReportBinding>,
}

impl Bridge {
    /// Creates a disconnected bridge; received messages are sent to `inbound`.
    pub fn new(
        id: BrokerId,
        connector: Arc<dyn BrokerConnector>,
        inbound: mpsc::UnboundedSender<Inbound>,
    ) -> Self {
        Self {
            id,
            connector,
            inbound,
            link: None,
            messages: None,
            dispatcher: None,
            publishing: BTreeMap::new(),
            subscriptions: BTreeMap::new(),
            commands: BTreeMap::new(),
            reports: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> BrokerId {
        self.id
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    pub fn has_dispatcher(&self) -> bool {
        self.dispatcher.is_some()
    }

    pub fn subscribed_topics(&self) -> impl Iterator<Item = &String> {
        self.subscriptions.keys()
    }

    fn link(&self) -> Result<Arc<dyn BrokerLink>> {
        self.link.clone().ok_or(Error::NotConnected)
    }

    /// Drops the current connection and everything bound to it, then connects
    /// with `config`. A missing or disabled configuration only tears down.
    pub async fn configure_and_connect(
        &mut self,
        config: Option<&BrokerConfig>,
        scheduler: &mut Scheduler,
    ) -> Result<bool> {
        self.teardown(scheduler).await;
        let Some(config) = config.filter(|c| c.enabled) else {
            info!("The {} broker is not enabled", self.id);
            return Ok(false);
        };
        let (link, messages) = self.connector.connect(self.id, config).await?;
        info!("Connected to {} broker at {}", self.id, config.url);
        self.link = Some(link);
        self.messages = Some(messages);
        Ok(true)
    }

    pub async fn teardown(&mut self, scheduler: &mut Scheduler) {
        let id = self.id;
        scheduler.cancel_where(|key| match key {
            TimerKey::Publish { broker, .. } | TimerKey::Report { broker, .. } => *broker == id,
            _ => false,
        });
        self.publishing.clear();
        self.reports.clear();
        self.subscriptions.clear();
        self.commands.clear();
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
        }
        self.messages = None;
        if let Some(link) = self.link.take() {
            match link.disconnect().await {
                Ok(()) => info!("Disconnected from {} broker", self.id),
                Err(err) => warn!("Error disconnecting from {} broker: {err}", self.id),
            }
        }
    }

    /// Starts forwarding received messages, once per connection.
    fn ensure_dispatcher(&mut self) -> bool {
        if self.dispatcher.is_some() {
            return false;
        }
        let Some(mut messages) = self.messages.take() else {
            return false;
        };
        let inbound = self.inbound.clone();
        let broker = self.id;
        self.dispatcher = Some(tokio::spawn(async move {
            while let Some((topic, payload)) = messages.recv().await {
                trace!("Received message on {broker} topic {topic}");
                let message = Inbound {
                    broker,
                    topic,
                    payload,
                };
                if inbound.send(message).is_err() {
                    break;
                }
            }
            debug!("Dispatcher of {broker} broker stopped");
        }));
        debug!("Dispatcher of {} broker registered", self.id);
        true
    }

    fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.contains_key(topic) || self.commands.contains_key(topic)
    }

    /// Attaches a decoder to every line with a publish binding and arms one
    /// timer per binding.
    pub fn start_publishing_all(
        &mut self,
        bindings: &[PublishBinding],
        channels: &[ChannelConfig],
        serial: &mut ConnectionManager,
        scheduler: &mut Scheduler,
    ) -> Result<usize> {
        self.link()?;
        let bindings: Vec<&PublishBinding> =
            bindings.iter().filter(|b| b.broker == self.id).collect();
        let lines: BTreeSet<&str> = bindings.iter().map(|b| b.line.as_str()).collect();
        for line in lines {
            serial.listen(line, &channel_or_default(channels, line), scheduler);
        }
        for binding in &bindings {
            scheduler.arm(
                TimerKey::Publish {
                    broker: self.id,
                    line: binding.line.clone(),
                    topic: binding.topic.clone(),
                },
                binding.interval,
            );
            self.publishing.insert(
                (binding.line.clone(), binding.topic.clone()),
                (*binding).clone(),
            );
            debug!(
                "Publishing {} to {} topic {} every {:?}",
                binding.line, self.id, binding.topic, binding.interval
            );
        }
        info!("Started {} publishers on {} broker", bindings.len(), self.id);
        Ok(bindings.len())
    }

    pub fn stop_publishing_all(&mut self, scheduler: &mut Scheduler) -> Result<usize> {
        self.link()?;
        let id = self.id;
        let stopped = scheduler
            .cancel_where(|key| matches!(key, TimerKey::Publish { broker, .. } if *broker == id));
        self.publishing.clear();
        info!("Stopped {stopped} publishers on {} broker", self.id);
        Ok(stopped)
    }

    /// Builds the publish of one timer tick; `None` until the line has a value.
    pub fn publish_tick(
        &self,
        line: &str,
        topic: &str,
        latest: Option<&LineValue>,
    ) -> Option<Publish> {
        let binding = self
            .publishing
            .get(&(line.to_string(), topic.to_string()))?;
        let link = self.link.clone()?;
        let Some(latest) = latest else {
            trace!("No data from {line} yet, skipping publish to {topic}");
            return None;
        };
        let payload = match (latest, &binding.extract) {
            (LineValue::Raw(text), None) => text.clone().into_bytes(),
            (value, rule) => extract(rule.as_ref(), value.to_json())
                .to_string()
                .into_bytes(),
        };
        Some(Publish {
            link,
            topic: binding.topic.clone(),
            payload,
            qos: binding.qos,
            retain: binding.retain,
        })
    }

    /// Subscribes every topic bound to this broker that is not subscribed yet.
    /// Returns the number of new subscriptions.
    pub async fn start_subscribing_all(&mut self, bindings: &[SubscribeBinding]) -> Result<usize> {
        let link = self.link()?;
        self.ensure_dispatcher();
        let mut subscribed = 0;
        for binding in bindings.iter().filter(|b| b.broker == self.id) {
            if self.subscriptions.contains_key(&binding.topic) {
                debug!("Already subscribed to {}", binding.topic);
                continue;
            }
            let shared = self.commands.contains_key(&binding.topic);
            self.subscriptions
                .insert(binding.topic.clone(), binding.clone());
            if shared {
                continue;
            }
            match link.subscribe(&binding.topic, binding.qos).await {
                Ok(()) => {
                    info!("Subscribed to {} topic {}", self.id, binding.topic);
                    subscribed += 1;
                }
                Err(err) => {
                    error!("Error subscribing to {}: {err}", binding.topic);
                    self.subscriptions.remove(&binding.topic);
                }
            }
        }
        Ok(subscribed)
    }

    /// Unsubscribes every serial subscription. The dispatcher stays registered.
    pub async fn stop_subscribing_all(&mut self) -> Result<usize> {
        let link = self.link()?;
        let topics: Vec<String> = std::mem::take(&mut self.subscriptions).into_keys().collect();
        let mut unsubscribed = 0;
        for topic in topics {
            if self.commands.contains_key(&topic) {
                continue;
            }
            match link.unsubscribe(&topic).await {
                Ok(()) => {
                    info!("Unsubscribed from {} topic {topic}", self.id);
                    unsubscribed += 1;
                }
                Err(err) => error!("Error unsubscribing from {topic}: {err}"),
            }
        }
        Ok(unsubscribed)
    }

    /// Listens for commands on `binding.topic`. Returns `false` when a
    /// listener is already registered for that topic.
    pub async fn enable_command(&mut self, binding: &CommandBinding) -> Result<bool> {
        let link = self.link()?;
        if self.commands.contains_key(&binding.topic) {
            debug!("Command listener for {} already registered", binding.topic);
            return Ok(false);
        }
        let shared = self.subscriptions.contains_key(&binding.topic);
        self.commands.insert(binding.topic.clone(), binding.clone());
        self.ensure_dispatcher();
        if !shared {
            if let Err(err) = link.subscribe(&binding.topic, binding.qos).await {
                self.commands.remove(&binding.topic);
                return Err(err);
            }
        }
        info!(
            "{:?} commands enabled on {} topic {}",
            binding.kind, self.id, binding.topic
        );
        Ok(true)
    }

    pub async fn disable_command(&mut self, topic: &str) -> Result<bool> {
        let link = self.link()?;
        if self.commands.remove(topic).is_none() {
            return Ok(false);
        }
        if !self.is_subscribed(topic) {
            link.unsubscribe(topic).await?;
        }
        info!("Commands disabled on {} topic {topic}", self.id);
        Ok(true)
    }

    /// Starts a template report, replacing a running one with the same name.
    pub fn start_report(
        &mut self,
        binding: &ReportBinding,
        scheduler: &mut Scheduler,
    ) -> Result<()> {
        self.link()?;
        scheduler.arm(
            TimerKey::Report {
                broker: self.id,
                name: binding.name.clone(),
            },
            binding.interval,
        );
        self.reports.insert(binding.name.clone(), binding.clone());
        info!(
            "Report {} started on {} topic {}",
            binding.name, self.id, binding.topic
        );
        Ok(())
    }

    pub fn stop_report(&mut self, name: &str, scheduler: &mut Scheduler) -> bool {
        scheduler.cancel(&TimerKey::Report {
            broker: self.id,
            name: name.to_string(),
        });
        self.reports.remove(name).is_some()
    }

    /// Builds the publish of one report tick.
    pub fn report_tick(&self, name: &str, readings: &Readings) -> Option<Publish> {
        let binding = self.reports.get(name)?;
        let link = self.link.clone()?;
        let sources: &[Source] = match binding.source {
            ReportSource::Field => &[Source::Field],
            ReportSource::Io => &[Source::Digital, Source::Analog],
        };
        let report = readings.render(sources, &binding.template);
        Some(Publish {
            link,
            topic: binding.topic.clone(),
            payload: report.to_string().into_bytes(),
            qos: binding.qos,
            retain: false,
        })
    }

    /// Builds the acknowledgement of an executed command.
    pub fn acknowledgement(&self, binding: &CommandBinding, raw: &str) -> Option<Publish> {
        let link = self.link.clone()?;
        let payload = json!({
            "message": format!("Received data from {}", binding.topic),
            "originalMessage": raw,
        });
        Some(Publish {
            link,
            topic: binding.response_topic.clone(),
            payload: payload.to_string().into_bytes(),
            qos: binding.response_qos,
            retain: false,
        })
    }

    /// Looks up the bindings of an inbound message by exact topic.
    /// Malformed payloads are logged and dropped.
    pub fn route(&self, inbound: &Inbound) -> Vec<Route> {
        let mut routes = Vec::new();
        let topic = &inbound.topic;
        if let Some(binding) = self.subscriptions.get(topic) {
            match forward_value(binding, &inbound.payload) {
                Ok(value) => routes.push(Route::Serial {
                    line: binding.line.clone(),
                    value,
                }),
                Err(err) => error!("Dropping message on {topic}: {err}"),
            }
        }
        if let Some(binding) = self.commands.get(topic) {
            match Command::parse(binding.kind, &inbound.payload) {
                Ok(command) => routes.push(Route::Command {
                    binding: binding.clone(),
                    command,
                    raw: String::from_utf8_lossy(&inbound.payload).into_owned(),
                }),
                Err(err) => error!("Dropping command on {topic}: {err}"),
            }
        }
        if !self.is_subscribed(topic) {
            debug!("No binding for {} topic {topic}", self.id);
        }
        routes
    }
}
