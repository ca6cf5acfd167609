//! The gateway context: owns every registry of the data plane and drives all
//! of them from one loop.
//!
//! [`Gateway::apply`] (re)builds connections and timers from a configuration
//! snapshot. [`Gateway::run`] then waits on the scheduler, serial line traffic
//! and inbound broker messages. Anything that talks to a device or a broker
//! after startup is spawned, so a slow device never delays other timers.
use crate::bridge::{Bridge, BrokerConnector, Command, Inbound, PahoConnector, Publish, Route};
use crate::config::{
    channel_or_default, AutomationRule, BrokerId, CommandBinding, GatewayConfig, IoConfig,
    ReportBinding,
};
use crate::field::{ClientFactory, FieldPoller, RtuClientFactory};
use crate::io::{
    sample_into, DigitalOutputs, IioAnalogInputs, InputSampler, MemoryStateStore, OutputDriver,
    OutputStateStore, SysfsDigitalInputs, SysfsOutputs, YamlStateStore,
};
use crate::readings::Readings;
use crate::rules::{Actuation, RuleEngine};
use crate::scheduler::{Scheduler, TimerKey};
use crate::serial::{
    ChannelEvent, ConnectionManager, LineEvent, LineValue, SerialOpener, TokioSerialOpener,
};
use crate::Result;
use log::*;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio::time::Instant;

/// The hardware and network seams of a gateway.
pub struct Backends {
    pub serial: Arc<dyn SerialOpener>,
    pub field: Arc<dyn ClientFactory>,
    pub brokers: Arc<dyn BrokerConnector>,
    pub outputs: Arc<dyn DigitalOutputs>,
    pub state: Arc<dyn OutputStateStore>,
}

impl Backends {
    /// Real serial ports, Modbus RTU, MQTT and sysfs GPIO.
    pub fn system(io: &IoConfig) -> Self {
        let state: Arc<dyn OutputStateStore> = match &io.state_file {
            Some(path) => Arc::new(YamlStateStore::new(path)),
            None => Arc::new(MemoryStateStore::default()),
        };
        Self {
            serial: Arc::new(TokioSerialOpener),
            field: Arc::new(RtuClientFactory),
            brokers: Arc::new(PahoConnector),
            outputs: Arc::new(SysfsOutputs::new(&io.gpio_root)),
            state,
        }
    }
}

pub struct Gateway {
    config: GatewayConfig,
    readings: Readings,
    scheduler: Scheduler,
    serial: ConnectionManager,
    line_events: mpsc::UnboundedReceiver<LineEvent>,
    poller: FieldPoller,
    local: Bridge,
    cloud: Bridge,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    rules: RuleEngine,
    output_driver: Arc<dyn DigitalOutputs>,
    output_state: Arc<dyn OutputStateStore>,
    outputs: OutputDriver,
    samplers: Vec<Arc<dyn InputSampler>>,
    polls_in_flight: Arc<Mutex<HashSet<TimerKey>>>,
    tasks: JoinSet<()>,
}

impl Gateway {
    pub fn new(backends: Backends) -> Self {
        let readings = Readings::new();
        let (serial, line_events) = ConnectionManager::new(backends.serial);
        let (inbound_sender, inbound) = mpsc::unbounded_channel();
        Self {
            config: GatewayConfig::default(),
            poller: FieldPoller::new(backends.field, readings.clone()),
            readings,
            scheduler: Scheduler::new(),
            serial,
            line_events,
            local: Bridge::new(
                BrokerId::Local,
                backends.brokers.clone(),
                inbound_sender.clone(),
            ),
            cloud: Bridge::new(BrokerId::Cloud, backends.brokers, inbound_sender),
            inbound,
            rules: RuleEngine::new(),
            outputs: OutputDriver::new(
                BTreeMap::new(),
                backends.outputs.clone(),
                backends.state.clone(),
            ),
            output_driver: backends.outputs,
            output_state: backends.state,
            samplers: Vec::new(),
            polls_in_flight: Arc::default(),
            tasks: JoinSet::new(),
        }
    }

    /// Rebuilds connections and timers from `config`.
    ///
    /// Every part is attempted; the first broker connection failure is returned
    /// after the rest has been set up.
    pub async fn apply(&mut self, config: GatewayConfig) -> Result<()> {
        self.config = config;
        let config = &self.config;

        let clients = self
            .poller
            .ensure_connections(&config.devices, &config.channels);
        debug!("{clients} field-bus lines connected");
        self.poller
            .schedule(&config.devices, &config.nodes, &mut self.scheduler);

        self.outputs = OutputDriver::new(
            config.io.outputs.clone(),
            self.output_driver.clone(),
            self.output_state.clone(),
        );
        match self.outputs.restore().await {
            Ok(0) => {}
            Ok(restored) => info!("Restored {restored} digital outputs"),
            Err(err) => warn!("Cannot restore digital outputs: {err}"),
        }

        self.scheduler
            .cancel_where(|key| matches!(key, TimerKey::Sample(..)));
        self.samplers = samplers(&config.io);
        for sampler in &self.samplers {
            self.scheduler
                .arm(TimerKey::Sample(sampler.source()), config.io.sample_interval);
        }

        let rules = self.rules.schedule(&config.rules, &mut self.scheduler);
        info!("{rules} automation rules enabled");

        let mut failure = None;
        for bridge in [&mut self.local, &mut self.cloud] {
            if let Err(err) =
                connect_bridge(bridge, config, &mut self.serial, &mut self.scheduler).await
            {
                error!("Cannot set up {} broker: {err}", bridge.id());
                failure.get_or_insert(err);
            }
        }
        failure.map_or(Ok(()), Err)
    }

    /// Runs until `shutdown` completes, then shuts the gateway down.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        info!("Gateway running");
        loop {
            let deadline = self.scheduler.next_deadline();
            tokio::select! {
                _ = &mut shutdown => break,
                _ = sleep_until(deadline) => {
                    for key in self.scheduler.pop_due(Instant::now()) {
                        self.dispatch(key);
                    }
                }
                Some(event) = self.line_events.recv() => {
                    self.serial.on_line_event(event, &mut self.scheduler);
                }
                Some(message) = self.inbound.recv() => self.on_inbound(message),
                Some(result) = self.tasks.join_next() => {
                    if let Err(err) = result {
                        if err.is_panic() {
                            error!("Gateway task panicked: {err}");
                        }
                    }
                }
            }
        }
        self.shutdown().await;
    }

    /// Cancels all timers and tasks, closes serial lines and disconnects brokers.
    pub async fn shutdown(&mut self) {
        self.tasks.abort_all();
        self.scheduler.cancel_where(|_| true);
        self.serial.shutdown();
        self.local.teardown(&mut self.scheduler).await;
        self.cloud.teardown(&mut self.scheduler).await;
        info!("Gateway stopped");
    }

    fn dispatch(&mut self, key: TimerKey) {
        match key {
            TimerKey::Poll { device, node } => {
                let key = TimerKey::Poll {
                    device,
                    node: node.clone(),
                };
                let Some(in_flight) = InFlight::claim(&self.polls_in_flight, key) else {
                    debug!("Node {node} of device {device} is still being polled, skipping tick");
                    return;
                };
                match self.poller.poll_request(device, &node) {
                    Ok(request) => {
                        self.tasks.spawn(async move {
                            let _in_flight = in_flight;
                            if let Err(err) = request.execute().await {
                                error!("Error polling node {node} of device {device}: {err}");
                            }
                        });
                    }
                    Err(err) => error!("Cannot poll node {node} of device {device}: {err}"),
                }
            }
            TimerKey::Publish {
                broker,
                line,
                topic,
            } => {
                let latest = self.serial.latest(&line);
                if let Some(publish) = self.bridge(broker).publish_tick(&line, &topic, latest) {
                    spawn_publish(&mut self.tasks, publish);
                }
            }
            TimerKey::Report { broker, name } => {
                if let Some(publish) = self.bridge(broker).report_tick(&name, &self.readings) {
                    spawn_publish(&mut self.tasks, publish);
                }
            }
            TimerKey::Rule(name) => {
                if let Some(actuation) = self.rules.tick(&name, &self.readings) {
                    self.spawn_actuation(actuation);
                }
            }
            TimerKey::Reopen(line) => self.serial.reopen(&line, &mut self.scheduler),
            TimerKey::Sample(source) => {
                if let Some(sampler) = self.samplers.iter().find(|s| s.source() == source) {
                    let sampler = sampler.clone();
                    let readings = self.readings.clone();
                    self.tasks.spawn(async move {
                        sample_into(sampler, readings).await;
                    });
                }
            }
        }
    }

    fn spawn_actuation(&mut self, actuation: Actuation) {
        let outputs = self.outputs.clone();
        self.tasks.spawn(async move {
            if let Err(err) = outputs.set(&actuation.output, actuation.high).await {
                error!(
                    "Rule {} cannot drive output {}: {err}",
                    actuation.rule, actuation.output
                );
            }
        });
    }

    fn on_inbound(&mut self, message: Inbound) {
        for route in self.bridge(message.broker).route(&message) {
            match route {
                Route::Serial { line, value } => {
                    let config = channel_or_default(&self.config.channels, &line);
                    self.serial
                        .write(&line, &config, &value, &mut self.scheduler);
                }
                Route::Command {
                    binding,
                    command,
                    raw,
                } => {
                    let ack = self.bridge(message.broker).acknowledgement(&binding, &raw);
                    let topic = binding.topic;
                    match command {
                        Command::Register {
                            device,
                            function_code,
                            register,
                            value,
                        } => match self
                            .poller
                            .write_request(device, function_code, register, &value)
                        {
                            Ok(request) => {
                                self.tasks.spawn(async move {
                                    let result = request.execute().await;
                                    acknowledge(&topic, result, ack).await;
                                });
                            }
                            Err(err) => error!("Command on {topic} rejected: {err}"),
                        },
                        Command::DigitalOutput { output, high } => {
                            let outputs = self.outputs.clone();
                            self.tasks.spawn(async move {
                                let result = outputs.set(&output, high).await;
                                acknowledge(&topic, result, ack).await;
                            });
                        }
                    }
                }
            }
        }
    }

    pub fn bridge(&self, broker: BrokerId) -> &Bridge {
        match broker {
            BrokerId::Local => &self.local,
            BrokerId::Cloud => &self.cloud,
        }
    }

    /// Arms the publishers bound to `broker` in the current configuration.
    pub fn start_publishing(&mut self, broker: BrokerId) -> Result<usize> {
        let bridge = match broker {
            BrokerId::Local => &mut self.local,
            BrokerId::Cloud => &mut self.cloud,
        };
        bridge.start_publishing_all(
            &self.config.publish,
            &self.config.channels,
            &mut self.serial,
            &mut self.scheduler,
        )
    }

    pub fn stop_publishing(&mut self, broker: BrokerId) -> Result<usize> {
        let bridge = match broker {
            BrokerId::Local => &mut self.local,
            BrokerId::Cloud => &mut self.cloud,
        };
        bridge.stop_publishing_all(&mut self.scheduler)
    }

    /// Subscribes the topics bound to `broker` in the current configuration.
    pub async fn start_subscribing(&mut self, broker: BrokerId) -> Result<usize> {
        let bridge = match broker {
            BrokerId::Local => &mut self.local,
            BrokerId::Cloud => &mut self.cloud,
        };
        bridge.start_subscribing_all(&self.config.subscribe).await
    }

    pub async fn stop_subscribing(&mut self, broker: BrokerId) -> Result<usize> {
        let bridge = match broker {
            BrokerId::Local => &mut self.local,
            BrokerId::Cloud => &mut self.cloud,
        };
        bridge.stop_subscribing_all().await
    }

    pub async fn enable_command(&mut self, binding: &CommandBinding) -> Result<bool> {
        let bridge = match binding.broker {
            BrokerId::Local => &mut self.local,
            BrokerId::Cloud => &mut self.cloud,
        };
        bridge.enable_command(binding).await
    }

    pub async fn disable_command(&mut self, broker: BrokerId, topic: &str) -> Result<bool> {
        let bridge = match broker {
            BrokerId::Local => &mut self.local,
            BrokerId::Cloud => &mut self.cloud,
        };
        bridge.disable_command(topic).await
    }

    pub fn start_report(&mut self, binding: &ReportBinding) -> Result<()> {
        let bridge = match binding.broker {
            BrokerId::Local => &mut self.local,
            BrokerId::Cloud => &mut self.cloud,
        };
        bridge.start_report(binding, &mut self.scheduler)
    }

    pub fn stop_report(&mut self, broker: BrokerId, name: &str) -> bool {
        let bridge = match broker {
            BrokerId::Local => &mut self.local,
            BrokerId::Cloud => &mut self.cloud,
        };
        bridge.stop_report(name, &mut self.scheduler)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn readings(&self) -> &Readings {
        &self.readings
    }

    pub fn serial(&self) -> &ConnectionManager {
        &self.serial
    }

    pub fn poller(&self) -> &FieldPoller {
        &self.poller
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Data and raw-data events of every serial line.
    pub fn channel_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.serial.subscribe()
    }

    pub fn latest(&self, line: &str) -> Option<&LineValue> {
        self.serial.latest(line)
    }

    /// Writes one value to a serial line; the outcome is only logged.
    pub fn write_line(&mut self, line: &str, value: &Value) {
        let config = channel_or_default(&self.config.channels, line);
        self.serial
            .write(line, &config, value, &mut self.scheduler);
    }

    pub async fn write_device(
        &self,
        address: u8,
        function_code: u8,
        register: u16,
        value: &Value,
    ) -> Result<()> {
        self.poller
            .write(address, function_code, register, value)
            .await
    }

    pub async fn set_output(&self, output: &str, high: bool) -> Result<()> {
        self.outputs.set(output, high).await
    }

    pub fn enable_rule(&mut self, rule: &AutomationRule) {
        self.rules.enable(rule, &mut self.scheduler);
    }

    pub fn disable_rule(&mut self, name: &str) -> bool {
        self.rules.disable(name, &mut self.scheduler)
    }
}

/// Connects one bridge and starts everything bound to it.
async fn connect_bridge(
    bridge: &mut Bridge,
    config: &GatewayConfig,
    serial: &mut ConnectionManager,
    scheduler: &mut Scheduler,
) -> Result<()> {
    let id = bridge.id();
    if !bridge
        .configure_and_connect(config.brokers.get(id), scheduler)
        .await?
    {
        return Ok(());
    }
    if config.autostart.publish {
        bridge.start_publishing_all(&config.publish, &config.channels, serial, scheduler)?;
    }
    if config.autostart.subscribe {
        bridge.start_subscribing_all(&config.subscribe).await?;
    }
    for command in config.commands.iter().filter(|c| c.broker == id) {
        if let Err(err) = bridge.enable_command(command).await {
            error!("Cannot enable commands on {}: {err}", command.topic);
        }
    }
    for report in config.reports.iter().filter(|r| r.broker == id) {
        bridge.start_report(report, scheduler)?;
    }
    Ok(())
}

/// Marks a timer key as busy until dropped.
struct InFlight {
    keys: Arc<Mutex<HashSet<TimerKey>>>,
    key: TimerKey,
}

impl InFlight {
    /// `None` while a previous claim of `key` is still alive.
    fn claim(keys: &Arc<Mutex<HashSet<TimerKey>>>, key: TimerKey) -> Option<Self> {
        let claimed = keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone());
        claimed.then(|| Self {
            keys: keys.clone(),
            key,
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

fn samplers(io: &IoConfig) -> Vec<Arc<dyn InputSampler>> {
    let mut samplers: Vec<Arc<dyn InputSampler>> = Vec::new();
    if !io.inputs.is_empty() {
        samplers.push(Arc::new(SysfsDigitalInputs::new(
            &io.gpio_root,
            io.inputs.clone(),
        )));
    }
    match &io.iio_device {
        Some(device) if !io.analog.is_empty() => {
            samplers.push(Arc::new(IioAnalogInputs::new(device, io.analog.clone())));
        }
        None if !io.analog.is_empty() => {
            warn!("Analog inputs configured without an IIO device, not sampling them");
        }
        _ => {}
    }
    samplers
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn spawn_publish(tasks: &mut JoinSet<()>, publish: Publish) {
    tasks.spawn(async move {
        let topic = publish.topic().to_string();
        if let Err(err) = publish.execute().await {
            error!("Error publishing to {topic}: {err}");
        }
    });
}

/// Publishes the acknowledgement once the command has been carried out.
async fn acknowledge(topic: &str, result: Result<()>, ack: Option<Publish>) {
    if let Err(err) = result {
        error!("Command on {topic} failed: {err}");
        return;
    }
    let Some(ack) = ack else {
        warn!("Command on {topic} executed, but the broker is gone");
        return;
    };
    let response = ack.topic().to_string();
    match ack.execute().await {
        Ok(()) => debug!("Command on {topic} acknowledged on {response}"),
        Err(err) => error!("Error acknowledging command on {topic}: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::tests::{broker_config, FakeConnector, LinkCall};
    use crate::config::{
        Autostart, ChannelConfig, CommandKind, Comparator, ExtractionRule, FieldDevice,
        PublishBinding, Qos, RegisterNode, ReportSource, RuleAction, SubscribeBinding, Threshold,
    };
    use crate::field::tests::FakeFactory;
    use crate::field::WriteOp;
    use crate::io::MemoryOutputs;
    use crate::protocol::DataType;
    use crate::readings::Source;
    use crate::serial::tests::DuplexOpener;
    use crate::Error;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::sync::oneshot;

    const LINE: &str = "/dev/ttyS1";

    struct Harness {
        opener: Arc<DuplexOpener>,
        factory: FakeFactory,
        connector: FakeConnector,
        outputs: MemoryOutputs,
        gateway: Gateway,
    }

    fn harness() -> Harness {
        harness_with(FakeFactory::default())
    }

    fn harness_with(factory: FakeFactory) -> Harness {
        let opener = Arc::new(DuplexOpener::default());
        let connector = FakeConnector::default();
        let outputs = MemoryOutputs::default();
        let gateway = Gateway::new(Backends {
            serial: opener.clone(),
            field: Arc::new(factory.clone()),
            brokers: Arc::new(connector.clone()),
            outputs: Arc::new(outputs.clone()),
            state: Arc::new(MemoryStateStore::default()),
        });
        Harness {
            opener,
            factory,
            connector,
            outputs,
            gateway,
        }
    }

    fn published(connector: &FakeConnector, topic: &str) -> Vec<String> {
        connector
            .link
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                LinkCall::Publish {
                    topic: t, payload, ..
                } if t == topic => Some(payload),
                _ => None,
            })
            .collect()
    }

    /// Advances one second and dispatches whatever became due, without `run`.
    async fn tick(gateway: &mut Gateway) {
        tokio::time::sleep(Duration::from_secs(1)).await;
        for key in gateway.scheduler.pop_due(Instant::now()) {
            gateway.dispatch(key);
        }
    }

    fn meter(interval: Duration, timeout: Duration) -> FieldDevice {
        FieldDevice {
            name: "meter".into(),
            channel: "/dev/ttyUSB0".into(),
            address: 1,
            interval,
            timeout,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn serial_traffic_is_bridged() {
        let mut harness = harness();
        let mut config = GatewayConfig {
            channels: vec![ChannelConfig::new(LINE)],
            publish: vec![PublishBinding {
                broker: BrokerId::Local,
                line: LINE.into(),
                topic: "plant/temp".into(),
                qos: Qos::AtLeastOnce,
                extract: Some(ExtractionRule::new("temp")),
                interval: Duration::from_secs(5),
                retain: false,
            }],
            subscribe: vec![SubscribeBinding {
                broker: BrokerId::Local,
                line: LINE.into(),
                topic: "plant/cmd".into(),
                qos: Qos::AtMostOnce,
                extract: None,
            }],
            commands: vec![CommandBinding {
                broker: BrokerId::Local,
                kind: CommandKind::DigitalOutput,
                topic: "io/cmd".into(),
                qos: Qos::AtLeastOnce,
                response_topic: "io/ack".into(),
                response_qos: Qos::AtMostOnce,
            }],
            ..GatewayConfig::default()
        };
        config.brokers.local = Some(broker_config());
        config.io.outputs = BTreeMap::from([("DO0".to_string(), 535)]);
        harness.gateway.apply(config).await.unwrap();

        let mut peer = BufReader::new(harness.opener.take_peer());
        let mut events = harness.gateway.channel_events();
        let connector = harness.connector.clone();
        let outputs = harness.outputs.clone();
        let (stop, stopped) = oneshot::channel::<()>();
        let driver = async {
            assert!(published(&connector, "plant/temp").is_empty());
            peer.get_mut()
                .write_all(b"{\"temp\": 21.5, \"hum\": 40}\n")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(6)).await;
            assert_matches!(
                events.try_recv(),
                Ok(ChannelEvent::Data { line, value })
                    if line == LINE && value == json!({"temp": 21.5, "hum": 40})
            );
            assert_eq!(published(&connector, "plant/temp"), vec![r#"{"temp":21.5}"#]);

            connector.deliver("plant/cmd", "hello");
            let mut received = String::new();
            peer.read_line(&mut received).await.unwrap();
            assert_eq!(received, "\"hello\"\n");

            connector.deliver("io/cmd", r#"{"output": "DO0", "value": 1}"#);
            connector.deliver("io/cmd", r#"{"output": "DO0", "value": 7}"#);
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(outputs.level(535), Some(true));
            assert_eq!(published(&connector, "io/ack").len(), 1);
            stop.send(()).unwrap();
        };
        tokio::join!(
            harness.gateway.run(async {
                let _ = stopped.await;
            }),
            driver
        );

        assert!(harness.gateway.scheduler().is_empty());
        assert!(connector.link.calls().contains(&LinkCall::Disconnect));
    }

    #[tokio::test(start_paused = true)]
    async fn polled_readings_drive_rules() {
        let mut harness = harness();
        harness
            .factory
            .bus
            .registers
            .lock()
            .unwrap()
            .insert((1, 100), 1234);
        let config = GatewayConfig {
            devices: vec![FieldDevice {
                name: "meter".into(),
                channel: "/dev/ttyUSB0".into(),
                address: 1,
                interval: Duration::from_secs(2),
                timeout: Duration::from_secs(1),
            }],
            nodes: vec![RegisterNode {
                name: "voltage".into(),
                device: 1,
                function_code: 3,
                register_address: 100,
                data_type: DataType::UInt16,
            }],
            rules: vec![AutomationRule {
                name: "overvoltage".into(),
                trigger_point: "voltage".into(),
                condition: Comparator::Greater,
                lower_threshold: Some(Threshold::Integer(100)),
                upper_threshold: None,
                scanning_cycle: Duration::from_secs(1),
                output: "DO1".into(),
                action: RuleAction::Close,
                enabled: true,
            }],
            io: IoConfig {
                outputs: BTreeMap::from([("DO1".to_string(), 536)]),
                ..IoConfig::default()
            },
            ..GatewayConfig::default()
        };
        harness.gateway.apply(config).await.unwrap();
        assert_eq!(harness.gateway.scheduler().len(), 2);

        let readings = harness.gateway.readings().clone();
        let outputs = harness.outputs.clone();
        let (stop, stopped) = oneshot::channel::<()>();
        let driver = async {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            assert_eq!(readings.get(Source::Field, "voltage"), None);
            assert_eq!(outputs.level(536), None);
            tokio::time::sleep(Duration::from_millis(1600)).await;
            assert_eq!(readings.get(Source::Field, "voltage"), Some(json!(123.4)));
            assert_eq!(outputs.level(536), Some(true));
            stop.send(()).unwrap();
        };
        tokio::join!(
            harness.gateway.run(async {
                let _ = stopped.await;
            }),
            driver
        );
    }

    #[tokio::test]
    async fn writes_without_bindings() {
        let mut harness = harness();
        let mut config = GatewayConfig {
            publish: vec![PublishBinding {
                broker: BrokerId::Cloud,
                line: LINE.into(),
                topic: "plant/temp".into(),
                qos: Qos::AtMostOnce,
                extract: None,
                interval: Duration::from_secs(5),
                retain: false,
            }],
            ..GatewayConfig::default()
        };
        config.brokers.local = Some(broker_config());
        harness.gateway.apply(config).await.unwrap();
        // Nothing is bound to the cloud broker, which is not configured.
        assert!(harness.gateway.bridge(BrokerId::Local).is_connected());
        assert!(!harness.gateway.bridge(BrokerId::Cloud).is_connected());
        assert!(harness.gateway.scheduler().is_empty());
        assert!(harness.gateway.latest(LINE).is_none());

        harness.gateway.write_line(LINE, &json!({"set": 1}));
        let mut peer = BufReader::new(harness.opener.take_peer());
        let mut received = String::new();
        peer.read_line(&mut received).await.unwrap();
        assert_eq!(received, "{\"set\":1}\n");

        assert_matches!(
            harness.gateway.write_device(9, 6, 0, &json!(1)).await,
            Err(Error::UnknownDevice(9))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn register_commands_are_acknowledged() {
        let mut harness = harness();
        let mut config = GatewayConfig {
            devices: vec![meter(Duration::from_secs(60), Duration::from_secs(1))],
            commands: vec![CommandBinding {
                broker: BrokerId::Local,
                kind: CommandKind::Register,
                topic: "modbus/cmd".into(),
                qos: Qos::AtLeastOnce,
                response_topic: "modbus/ack".into(),
                response_qos: Qos::AtMostOnce,
            }],
            ..GatewayConfig::default()
        };
        config.brokers.local = Some(broker_config());
        harness.gateway.apply(config).await.unwrap();

        let connector = harness.connector.clone();
        let writes = harness.factory.bus.writes.clone();
        let (stop, stopped) = oneshot::channel::<()>();
        let driver = async {
            let raw = r#"{"deviceID": 1, "functionCode": 6, "registerAddress": 10, "value": 42}"#;
            connector.deliver("modbus/cmd", raw);
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(
                *writes.lock().unwrap(),
                vec![(1, 10, WriteOp::SingleRegister(42))]
            );
            let acks = published(&connector, "modbus/ack");
            assert_eq!(acks.len(), 1);
            assert_eq!(
                serde_json::from_str::<Value>(&acks[0]).unwrap(),
                json!({"message": "Received data from modbus/cmd", "originalMessage": raw})
            );

            // Unknown device, then a read function code: neither is acknowledged.
            connector.deliver(
                "modbus/cmd",
                r#"{"deviceID": 9, "functionCode": 6, "registerAddress": 10, "value": 1}"#,
            );
            connector.deliver(
                "modbus/cmd",
                r#"{"deviceID": 1, "functionCode": 3, "registerAddress": 10, "value": 1}"#,
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(writes.lock().unwrap().len(), 1);
            assert_eq!(published(&connector, "modbus/ack").len(), 1);
            stop.send(()).unwrap();
        };
        tokio::join!(
            harness.gateway.run(async {
                let _ = stopped.await;
            }),
            driver
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rule_keeps_scanning_after_output_failure() {
        let mut harness = harness();
        let config = GatewayConfig {
            rules: vec![AutomationRule {
                name: "pump".into(),
                trigger_point: "level".into(),
                condition: Comparator::Greater,
                lower_threshold: Some(Threshold::Integer(1)),
                upper_threshold: None,
                scanning_cycle: Duration::from_secs(1),
                // Not in io.outputs, so every write fails.
                output: "DO7".into(),
                action: RuleAction::Close,
                enabled: true,
            }],
            ..GatewayConfig::default()
        };
        harness.gateway.apply(config).await.unwrap();
        harness
            .gateway
            .readings()
            .set(Source::Field, "level", json!(5));
        let rule = TimerKey::Rule("pump".into());

        tick(&mut harness.gateway).await;
        assert_eq!(harness.gateway.tasks.len(), 1);
        tick(&mut harness.gateway).await;
        assert_eq!(harness.gateway.tasks.len(), 2);
        assert!(harness.gateway.scheduler().is_armed(&rule));
        assert!(harness.gateway.rules.is_enabled("pump"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_polls_are_not_stacked() {
        let mut factory = FakeFactory::default();
        factory.bus.delay = Some(Duration::from_secs(60));
        let mut harness = harness_with(factory);
        let config = GatewayConfig {
            devices: vec![meter(Duration::from_secs(1), Duration::from_millis(2500))],
            nodes: (0..5)
                .map(|register| RegisterNode {
                    name: format!("n{register}"),
                    device: 1,
                    function_code: 3,
                    register_address: register,
                    data_type: DataType::UInt16,
                })
                .collect(),
            ..GatewayConfig::default()
        };
        harness.gateway.apply(config).await.unwrap();
        let gateway = &mut harness.gateway;

        tick(gateway).await;
        assert_eq!(gateway.tasks.len(), 5);
        // Every poll is still waiting for the bus or the line.
        tick(gateway).await;
        tick(gateway).await;
        assert_eq!(gateway.tasks.len(), 5);
        assert_eq!(gateway.polls_in_flight.lock().unwrap().len(), 5);
        // All five timed out at 3.5 s and are polled again.
        tick(gateway).await;
        assert_eq!(gateway.tasks.len(), 10);
        assert_eq!(gateway.polls_in_flight.lock().unwrap().len(), 5);
        assert_eq!(gateway.readings().get(Source::Field, "n0"), None);
    }

    #[tokio::test]
    async fn bindings_are_controlled_at_runtime() {
        let mut harness = harness();
        let mut config = GatewayConfig {
            channels: vec![ChannelConfig::new(LINE)],
            publish: vec![PublishBinding {
                broker: BrokerId::Local,
                line: LINE.into(),
                topic: "plant/temp".into(),
                qos: Qos::AtMostOnce,
                extract: None,
                interval: Duration::from_secs(5),
                retain: false,
            }],
            subscribe: vec![SubscribeBinding {
                broker: BrokerId::Local,
                line: LINE.into(),
                topic: "plant/cmd".into(),
                qos: Qos::AtMostOnce,
                extract: None,
            }],
            io: IoConfig {
                outputs: BTreeMap::from([("DO0".to_string(), 535)]),
                ..IoConfig::default()
            },
            autostart: Autostart {
                publish: false,
                subscribe: false,
            },
            ..GatewayConfig::default()
        };
        config.brokers.local = Some(broker_config());
        harness.gateway.apply(config).await.unwrap();
        let gateway = &mut harness.gateway;
        let publisher = TimerKey::Publish {
            broker: BrokerId::Local,
            line: LINE.into(),
            topic: "plant/temp".into(),
        };
        assert!(!gateway.scheduler().is_armed(&publisher));

        assert_eq!(gateway.start_publishing(BrokerId::Local).unwrap(), 1);
        assert!(gateway.scheduler().is_armed(&publisher));
        assert!(gateway.serial().decoder(LINE).is_some());
        assert_eq!(gateway.stop_publishing(BrokerId::Local).unwrap(), 1);
        assert!(!gateway.scheduler().is_armed(&publisher));
        assert_matches!(
            gateway.start_publishing(BrokerId::Cloud),
            Err(Error::NotConnected)
        );

        assert_eq!(gateway.start_subscribing(BrokerId::Local).await.unwrap(), 1);
        assert_eq!(gateway.start_subscribing(BrokerId::Local).await.unwrap(), 0);
        assert_eq!(gateway.stop_subscribing(BrokerId::Local).await.unwrap(), 1);

        let command = CommandBinding {
            broker: BrokerId::Local,
            kind: CommandKind::DigitalOutput,
            topic: "io/cmd".into(),
            qos: Qos::AtLeastOnce,
            response_topic: "io/ack".into(),
            response_qos: Qos::AtMostOnce,
        };
        assert!(gateway.enable_command(&command).await.unwrap());
        assert!(!gateway.enable_command(&command).await.unwrap());
        assert!(gateway
            .disable_command(BrokerId::Local, "io/cmd")
            .await
            .unwrap());

        let report = ReportBinding {
            broker: BrokerId::Local,
            name: "meter".into(),
            source: ReportSource::Field,
            topic: "plant/meter".into(),
            qos: Qos::AtMostOnce,
            interval: Duration::from_secs(10),
            template: BTreeMap::new(),
        };
        let report_timer = TimerKey::Report {
            broker: BrokerId::Local,
            name: "meter".into(),
        };
        gateway.start_report(&report).unwrap();
        assert!(gateway.scheduler().is_armed(&report_timer));
        assert!(gateway.stop_report(BrokerId::Local, "meter"));
        assert!(!gateway.scheduler().is_armed(&report_timer));

        let calls = harness.connector.link.calls();
        let count = |call: LinkCall| calls.iter().filter(|c| **c == call).count();
        assert_eq!(count(LinkCall::Subscribe("plant/cmd".into())), 1);
        assert_eq!(count(LinkCall::Unsubscribe("plant/cmd".into())), 1);
        assert_eq!(count(LinkCall::Subscribe("io/cmd".into())), 1);
        assert_eq!(count(LinkCall::Unsubscribe("io/cmd".into())), 1);

        let gateway = &mut harness.gateway;
        gateway.set_output("DO0", true).await.unwrap();
        assert_eq!(harness.outputs.level(535), Some(true));

        let fan = AutomationRule {
            name: "fan".into(),
            trigger_point: "temp".into(),
            condition: Comparator::Greater,
            lower_threshold: Some(Threshold::Integer(30)),
            upper_threshold: None,
            scanning_cycle: Duration::from_secs(2),
            output: "DO0".into(),
            action: RuleAction::Close,
            enabled: false,
        };
        gateway.enable_rule(&fan);
        assert!(gateway.scheduler().is_armed(&TimerKey::Rule("fan".into())));
        assert!(gateway.disable_rule("fan"));
        assert!(!gateway.scheduler().is_armed(&TimerKey::Rule("fan".into())));
    }
}
