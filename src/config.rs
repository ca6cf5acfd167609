//! Read-only configuration snapshots consumed by the gateway core.
//!
//! The records mirror what the administrative surface stores: serial lines,
//! field devices and their register nodes, topic bindings, automation rules
//! and the local I/O layout. A snapshot is loaded once and handed to
//! [`crate::gateway::Gateway::apply`]; later edits take effect only after
//! another explicit `apply`.
use crate::protocol::DataType;
use crate::{Error, Result};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    #[default]
    None,
    Software,
    Hardware,
}

/// Settings of one serial line, keyed by its device path.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChannelConfig {
    pub path: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub flow_control: FlowControl,
}

impl ChannelConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            parity: Parity::None,
            stop_bits: default_stop_bits(),
            flow_control: FlowControl::None,
        }
    }
}

/// Settings of `line`, or the defaults when it has no entry.
pub fn channel_or_default(channels: &[ChannelConfig], line: &str) -> ChannelConfig {
    channels
        .iter()
        .find(|c| c.path == line)
        .cloned()
        .unwrap_or_else(|| ChannelConfig::new(line))
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

/// A field-bus slave reached through a serial line.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FieldDevice {
    pub name: String,
    /// Path of the serial line the device is wired to.
    pub channel: String,
    #[serde(deserialize_with = "de_number")]
    pub address: u8,
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub interval: Duration,
    #[serde(default = "default_device_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_device_timeout() -> Duration {
    Duration::from_secs(1)
}

/// One register of a field device, published under `name`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RegisterNode {
    pub name: String,
    /// Address of the owning [`FieldDevice`].
    #[serde(deserialize_with = "de_number")]
    pub device: u8,
    /// Kept raw so unsupported codes surface when the node is polled.
    #[serde(deserialize_with = "de_number")]
    pub function_code: u8,
    #[serde(deserialize_with = "de_number")]
    pub register_address: u16,
    #[serde(default)]
    pub data_type: DataType,
}

impl<'de> Deserialize<'de> for DataType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let code: u8 = de_number(deserializer)?;
        DataType::try_from(code).map_err(D::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerId {
    #[default]
    Local,
    Cloud,
}

impl fmt::Display for BrokerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerId::Local => write!(f, "local"),
            BrokerId::Cloud => write!(f, "cloud"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Qos {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl Qos {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }
}

impl TryFrom<u8> for Qos {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            _ => Err(Error::Protocol(format!("Invalid QoS {value}"))),
        }
    }
}

impl<'de> Deserialize<'de> for Qos {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let level: u8 = de_number(deserializer)?;
        Qos::try_from(level).map_err(D::Error::custom)
    }
}

/// Reduces a payload to `{key: payload[key]}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct ExtractionRule {
    pub key: String,
}

impl ExtractionRule {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

/// Periodically publishes the latest value of a serial line.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PublishBinding {
    #[serde(default)]
    pub broker: BrokerId,
    pub line: String,
    pub topic: String,
    #[serde(default)]
    pub qos: Qos,
    #[serde(default)]
    pub extract: Option<ExtractionRule>,
    #[serde(default = "default_publish_interval", with = "humantime_serde")]
    pub interval: Duration,
    #[serde(default)]
    pub retain: bool,
}

fn default_publish_interval() -> Duration {
    Duration::from_secs(5)
}

/// Forwards messages of a topic to a serial line.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubscribeBinding {
    #[serde(default)]
    pub broker: BrokerId,
    pub line: String,
    pub topic: String,
    #[serde(default)]
    pub qos: Qos,
    /// When present the payload is decoded as JSON before extraction.
    #[serde(default)]
    pub extract: Option<ExtractionRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Writes field device registers or coils.
    Register,
    /// Drives a local digital output.
    DigitalOutput,
}

/// A command topic whose messages trigger writes, acknowledged on `response_topic`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CommandBinding {
    #[serde(default)]
    pub broker: BrokerId,
    pub kind: CommandKind,
    pub topic: String,
    #[serde(default)]
    pub qos: Qos,
    pub response_topic: String,
    #[serde(default)]
    pub response_qos: Qos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportSource {
    /// Register node readings.
    #[default]
    Field,
    /// Digital then analog input readings.
    Io,
}

/// Publishes a JSON object built from a template of point names.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReportBinding {
    #[serde(default)]
    pub broker: BrokerId,
    pub name: String,
    #[serde(default)]
    pub source: ReportSource,
    pub topic: String,
    #[serde(default)]
    pub qos: Qos,
    #[serde(default = "default_publish_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// Output key to point name.
    pub template: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Comparator {
    #[serde(rename = "larger", alias = "greater")]
    Greater,
    #[serde(rename = "larger equal", alias = "greater_equal")]
    GreaterOrEqual,
    #[serde(rename = "smaller", alias = "less")]
    Less,
    #[serde(rename = "smaller equal", alias = "less_equal")]
    LessOrEqual,
    #[serde(rename = "within threshold", alias = "within")]
    Within,
    #[serde(rename = "out of threshold", alias = "outside")]
    Outside,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    /// Drive the output high.
    Close,
    /// Drive the output low.
    Open,
}

impl RuleAction {
    pub fn level(&self) -> bool {
        matches!(self, RuleAction::Close)
    }
}

/// A threshold as configured, interpreted as an integer when evaluated.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Threshold {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl Threshold {
    /// Integer part of the threshold, or `None` when it is not numeric.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Threshold::Integer(v) => Some(*v),
            Threshold::Float(v) if v.is_finite() => Some(v.trunc() as i64),
            Threshold::Float(_) => None,
            Threshold::Text(s) => {
                let s = s.trim();
                s.parse::<i64>().ok().or_else(|| {
                    s.parse::<f64>()
                        .ok()
                        .filter(|v| v.is_finite())
                        .map(|v| v.trunc() as i64)
                })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AutomationRule {
    pub name: String,
    pub trigger_point: String,
    pub condition: Comparator,
    #[serde(default)]
    pub lower_threshold: Option<Threshold>,
    #[serde(default)]
    pub upper_threshold: Option<Threshold>,
    #[serde(with = "humantime_serde")]
    pub scanning_cycle: Duration,
    /// Digital output driven when the condition holds.
    pub output: String,
    pub action: RuleAction,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LastWill {
    pub topic: String,
    pub payload: String,
    #[serde(default)]
    pub qos: Qos,
    #[serde(default)]
    pub retain: bool,
}

/// Connection options of one broker (local or cloud endpoint).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Server URI, e.g. `tcp://localhost:1883`.
    pub url: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive", with = "humantime_serde")]
    pub keep_alive: Duration,
    #[serde(default = "default_reconnect_period", with = "humantime_serde")]
    pub reconnect_period: Duration,
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    #[serde(default = "default_mqtt_version")]
    pub mqtt_version: u32,
    #[serde(default)]
    pub last_will: Option<LastWill>,
}

fn default_true() -> bool {
    true
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(60)
}

fn default_reconnect_period() -> Duration {
    Duration::from_secs(1)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_mqtt_version() -> u32 {
    4
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Brokers {
    #[serde(default)]
    pub local: Option<BrokerConfig>,
    #[serde(default)]
    pub cloud: Option<BrokerConfig>,
}

impl Brokers {
    pub fn get(&self, id: BrokerId) -> Option<&BrokerConfig> {
        match id {
            BrokerId::Local => self.local.as_ref(),
            BrokerId::Cloud => self.cloud.as_ref(),
        }
    }
}

/// Local GPIO and analog input layout.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IoConfig {
    #[serde(default = "default_gpio_root")]
    pub gpio_root: PathBuf,
    /// Output name (e.g. `DO0`) to GPIO number.
    #[serde(default)]
    pub outputs: BTreeMap<String, u32>,
    /// Input name (e.g. `DI0`) to GPIO number.
    #[serde(default)]
    pub inputs: BTreeMap<String, u32>,
    /// IIO device directory of the analog converter.
    #[serde(default)]
    pub iio_device: Option<PathBuf>,
    /// Analog point name (e.g. `AI0`) to converter channel.
    #[serde(default)]
    pub analog: BTreeMap<String, u8>,
    #[serde(default = "default_sample_interval", with = "humantime_serde")]
    pub sample_interval: Duration,
    /// Where the last written output states are kept.
    #[serde(default)]
    pub state_file: Option<PathBuf>,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            gpio_root: default_gpio_root(),
            outputs: BTreeMap::new(),
            inputs: BTreeMap::new(),
            iio_device: None,
            analog: BTreeMap::new(),
            sample_interval: default_sample_interval(),
            state_file: None,
        }
    }
}

fn default_gpio_root() -> PathBuf {
    PathBuf::from("/sys/class/gpio")
}

fn default_sample_interval() -> Duration {
    Duration::from_secs(1)
}

/// Which bridges start publishing/subscribing right after `apply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Autostart {
    #[serde(default = "default_true")]
    pub publish: bool,
    #[serde(default = "default_true")]
    pub subscribe: bool,
}

impl Default for Autostart {
    fn default() -> Self {
        Self {
            publish: true,
            subscribe: true,
        }
    }
}

/// A complete configuration snapshot.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub devices: Vec<FieldDevice>,
    #[serde(default)]
    pub nodes: Vec<RegisterNode>,
    #[serde(default)]
    pub brokers: Brokers,
    #[serde(default)]
    pub publish: Vec<PublishBinding>,
    #[serde(default)]
    pub subscribe: Vec<SubscribeBinding>,
    #[serde(default)]
    pub commands: Vec<CommandBinding>,
    #[serde(default)]
    pub reports: Vec<ReportBinding>,
    #[serde(default)]
    pub rules: Vec<AutomationRule>,
    #[serde(default)]
    pub io: IoConfig,
    #[serde(default)]
    pub autostart: Autostart,
}

impl GatewayConfig {
    pub const DEFAULT_CONFIG_FILE: &'static str = "iogate.yml";

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        log::debug!("Loading config file from {path:?}");
        let file = File::open(path)?;
        Ok(serde_yaml::from_reader(file)?)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn channel(&self, line: &str) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.path == line)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(u64),
    Text(String),
}

/// Accepts `3`, `"3"` or `"03"`.
fn de_number<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<u64> + FromStr,
{
    match NumberOrText::deserialize(deserializer)? {
        NumberOrText::Number(n) => {
            T::try_from(n).map_err(|_| D::Error::custom(format!("{n} is out of range")))
        }
        NumberOrText::Text(s) => s
            .trim()
            .parse::<T>()
            .map_err(|_| D::Error::custom(format!("'{s}' is not a number"))),
    }
}
