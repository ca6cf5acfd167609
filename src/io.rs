//! Local I/O of the gateway board: digital outputs driven by commands and
//! rules, and samplers that feed the digital and analog input readings.
//!
//! The Linux implementations go through sysfs (`/sys/class/gpio`) and the IIO
//! subsystem (`/sys/bus/iio/devices/iio:deviceN`), so no board specific crate is
//! needed.
use crate::readings::{Readings, Source};
use crate::{Error, Result};
use async_trait::async_trait;
use log::*;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Converts a command value into an output level; only `0` and `1` are accepted.
pub fn output_level(value: &Value) -> Result<bool> {
    let level = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    match level {
        Some(0) => Ok(false),
        Some(1) => Ok(true),
        _ => Err(Error::Protocol(format!(
            "Invalid output value {value}, expected 0 or 1"
        ))),
    }
}

#[async_trait]
pub trait DigitalOutputs: Send + Sync {
    async fn write(&self, pin: u32, high: bool) -> Result<()>;
}

/// Exports `pin` and sets its direction unless it is already exported.
async fn export_pin(root: &Path, pin: u32, direction: &str) -> Result<PathBuf> {
    let dir = root.join(format!("gpio{pin}"));
    if tokio::fs::metadata(&dir).await.is_err() {
        debug!("Exporting GPIO {pin} as {direction}");
        tokio::fs::write(root.join("export"), pin.to_string()).await?;
        tokio::fs::write(dir.join("direction"), direction).await?;
    }
    Ok(dir)
}

/// GPIO outputs through the sysfs interface.
#[derive(Debug, Clone)]
pub struct SysfsOutputs {
    root: PathBuf,
}

impl SysfsOutputs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl DigitalOutputs for SysfsOutputs {
    async fn write(&self, pin: u32, high: bool) -> Result<()> {
        let dir = export_pin(&self.root, pin, "out").await?;
        tokio::fs::write(dir.join("value"), if high { "1" } else { "0" }).await?;
        Ok(())
    }
}

/// Outputs kept in memory, for boards without GPIO and for tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryOutputs {
    levels: Arc<Mutex<BTreeMap<u32, bool>>>,
}

impl MemoryOutputs {
    pub fn level(&self, pin: u32) -> Option<bool> {
        let levels = self.levels.lock().unwrap_or_else(|e| e.into_inner());
        levels.get(&pin).copied()
    }
}

#[async_trait]
impl DigitalOutputs for MemoryOutputs {
    async fn write(&self, pin: u32, high: bool) -> Result<()> {
        let mut levels = self.levels.lock().unwrap_or_else(|e| e.into_inner());
        levels.insert(pin, high);
        Ok(())
    }
}

/// Remembers the last level written to each output.
#[async_trait]
pub trait OutputStateStore: Send + Sync {
    async fn save(&self, output: &str, high: bool) -> Result<()>;
    async fn load(&self) -> Result<BTreeMap<String, bool>>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    states: Arc<Mutex<BTreeMap<String, bool>>>,
}

#[async_trait]
impl OutputStateStore for MemoryStateStore {
    async fn save(&self, output: &str, high: bool) -> Result<()> {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.insert(output.to_string(), high);
        Ok(())
    }

    async fn load(&self) -> Result<BTreeMap<String, bool>> {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        Ok(states.clone())
    }
}

/// Output states in a small YAML file, e.g. `DO0: true`.
#[derive(Debug)]
pub struct YamlStateStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl YamlStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait]
impl OutputStateStore for YamlStateStore {
    async fn save(&self, output: &str, high: bool) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut states = self.load().await?;
        states.insert(output.to_string(), high);
        tokio::fs::write(&self.path, serde_yaml::to_string(&states)?).await?;
        Ok(())
    }

    async fn load(&self) -> Result<BTreeMap<String, bool>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) if text.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(text) => Ok(serde_yaml::from_str(&text)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Named digital outputs: drives the pin, then persists the new state.
#[derive(Clone)]
pub struct OutputDriver {
    outputs: BTreeMap<String, u32>,
    driver: Arc<dyn DigitalOutputs>,
    store: Arc<dyn OutputStateStore>,
}

impl OutputDriver {
    pub fn new(
        outputs: BTreeMap<String, u32>,
        driver: Arc<dyn DigitalOutputs>,
        store: Arc<dyn OutputStateStore>,
    ) -> Self {
        Self {
            outputs,
            driver,
            store,
        }
    }

    pub fn pin(&self, output: &str) -> Result<u32> {
        self.outputs
            .get(output)
            .copied()
            .ok_or_else(|| Error::UnknownOutput(output.to_string()))
    }

    pub async fn set(&self, output: &str, high: bool) -> Result<()> {
        let pin = self.pin(output)?;
        self.driver.write(pin, high).await?;
        self.store.save(output, high).await?;
        info!(
            "Output {output} (GPIO {pin}) set {}",
            if high { "high" } else { "low" }
        );
        Ok(())
    }

    /// Drives every known output back to its persisted state.
    pub async fn restore(&self) -> Result<usize> {
        let mut restored = 0;
        for (output, high) in self.store.load().await? {
            let Ok(pin) = self.pin(&output) else {
                debug!("Ignoring persisted state of unknown output {output}");
                continue;
            };
            match self.driver.write(pin, high).await {
                Ok(()) => restored += 1,
                Err(err) => warn!("Cannot restore output {output}: {err}"),
            }
        }
        Ok(restored)
    }
}

/// A group of local inputs read together on one timer.
#[async_trait]
pub trait InputSampler: Send + Sync {
    /// Namespace the samples are stored in.
    fn source(&self) -> Source;

    /// Reads every input; a failing input does not hide the others.
    async fn sample(&self) -> Vec<(String, Result<Value>)>;
}

/// Samples once and stores what could be read. Returns the number stored.
pub async fn sample_into(sampler: Arc<dyn InputSampler>, readings: Readings) -> usize {
    let source = sampler.source();
    let mut stored = 0;
    for (name, result) in sampler.sample().await {
        match result {
            Ok(value) => {
                trace!("{source:?} input {name}: {value}");
                readings.set(source, name, value);
                stored += 1;
            }
            Err(err) => warn!("Cannot sample {source:?} input {name}: {err}"),
        }
    }
    stored
}

fn parse_integer(name: &str, text: &str) -> Result<Value> {
    text.trim()
        .parse::<i64>()
        .map(Value::from)
        .map_err(|_| Error::Protocol(format!("Unexpected value '{}' for {name}", text.trim())))
}

/// Digital inputs read from sysfs GPIO value files.
#[derive(Debug, Clone)]
pub struct SysfsDigitalInputs {
    root: PathBuf,
    inputs: BTreeMap<String, u32>,
}

impl SysfsDigitalInputs {
    pub fn new(root: impl Into<PathBuf>, inputs: BTreeMap<String, u32>) -> Self {
        Self {
            root: root.into(),
            inputs,
        }
    }

    async fn read(&self, name: &str, pin: u32) -> Result<Value> {
        let dir = export_pin(&self.root, pin, "in").await?;
        let text = tokio::fs::read_to_string(dir.join("value")).await?;
        parse_integer(name, &text)
    }
}

#[async_trait]
impl InputSampler for SysfsDigitalInputs {
    fn source(&self) -> Source {
        Source::Digital
    }

    async fn sample(&self) -> Vec<(String, Result<Value>)> {
        let mut samples = Vec::with_capacity(self.inputs.len());
        for (name, pin) in &self.inputs {
            samples.push((name.clone(), self.read(name, *pin).await));
        }
        samples
    }
}

/// Raw conversions of an IIO analog converter (`in_voltageN_raw`).
#[derive(Debug, Clone)]
pub struct IioAnalogInputs {
    device: PathBuf,
    channels: BTreeMap<String, u8>,
}

impl IioAnalogInputs {
    pub fn new(device: impl Into<PathBuf>, channels: BTreeMap<String, u8>) -> Self {
        Self {
            device: device.into(),
            channels,
        }
    }
}

#[async_trait]
impl InputSampler for IioAnalogInputs {
    fn source(&self) -> Source {
        Source::Analog
    }

    async fn sample(&self) -> Vec<(String, Result<Value>)> {
        let mut samples = Vec::with_capacity(self.channels.len());
        for (name, channel) in &self.channels {
            let path = self.device.join(format!("in_voltage{channel}_raw"));
            let result = match tokio::fs::read_to_string(&path).await {
                Ok(text) => parse_integer(name, &text),
                Err(err) => Err(err.into()),
            };
            samples.push((name.clone(), result));
        }
        samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    fn driver() -> (OutputDriver, MemoryOutputs, MemoryStateStore) {
        let outputs = MemoryOutputs::default();
        let store = MemoryStateStore::default();
        let driver = OutputDriver::new(
            BTreeMap::from([("DO0".to_string(), 535), ("DO1".to_string(), 536)]),
            Arc::new(outputs.clone()),
            Arc::new(store.clone()),
        );
        (driver, outputs, store)
    }

    #[test]
    fn output_levels() {
        assert!(output_level(&json!(1)).unwrap());
        assert!(!output_level(&json!(0)).unwrap());
        assert!(output_level(&json!("1")).unwrap());
        assert_matches!(output_level(&json!(2)), Err(Error::Protocol(..)));
        assert_matches!(output_level(&json!(true)), Err(Error::Protocol(..)));
        assert_matches!(output_level(&json!(-1)), Err(Error::Protocol(..)));
    }

    #[tokio::test]
    async fn set_drives_and_persists() {
        let (driver, outputs, store) = driver();
        driver.set("DO1", true).await.unwrap();
        assert_eq!(outputs.level(536), Some(true));
        assert_eq!(store.load().await.unwrap().get("DO1"), Some(&true));
        assert_matches!(
            driver.set("DO9", true).await,
            Err(Error::UnknownOutput(name)) if name == "DO9"
        );
    }

    #[tokio::test]
    async fn restore_persisted_states() {
        let (driver, outputs, store) = driver();
        store.save("DO0", true).await.unwrap();
        store.save("gone", true).await.unwrap();
        assert_eq!(driver.restore().await.unwrap(), 1);
        assert_eq!(outputs.level(535), Some(true));
    }

    #[tokio::test]
    async fn yaml_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = YamlStateStore::new(dir.path().join("outputs.yml"));
        assert!(store.load().await.unwrap().is_empty());
        store.save("DO0", true).await.unwrap();
        store.save("DO1", false).await.unwrap();
        let states = store.load().await.unwrap();
        assert_eq!(states.get("DO0"), Some(&true));
        assert_eq!(states.get("DO1"), Some(&false));
    }

    #[tokio::test]
    async fn sysfs_output_exports_pin() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        // The kernel creates the pin directory on export; emulate it.
        std::fs::create_dir_all(root.join("gpio535")).unwrap();
        SysfsOutputs::new(root).write(535, true).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(root.join("gpio535/value")).unwrap(),
            "1"
        );
    }

    #[tokio::test]
    async fn sample_inputs_into_readings() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("gpio525")).unwrap();
        std::fs::write(root.join("gpio525/value"), "1\n").unwrap();
        std::fs::create_dir_all(root.join("gpio529")).unwrap();
        std::fs::write(root.join("gpio529/value"), "garbage\n").unwrap();
        std::fs::write(root.join("in_voltage2_raw"), "812\n").unwrap();

        let readings = Readings::new();
        let digital = SysfsDigitalInputs::new(
            root,
            BTreeMap::from([("DI0".to_string(), 525), ("DI1".to_string(), 529)]),
        );
        assert_eq!(sample_into(Arc::new(digital), readings.clone()).await, 1);
        assert_eq!(readings.get(Source::Digital, "DI0"), Some(json!(1)));
        assert_eq!(readings.get(Source::Digital, "DI1"), None);

        let analog = IioAnalogInputs::new(
            root,
            BTreeMap::from([("AI2".to_string(), 2), ("AI3".to_string(), 3)]),
        );
        assert_eq!(sample_into(Arc::new(analog), readings.clone()).await, 1);
        assert_eq!(readings.get(Source::Analog, "AI2"), Some(json!(812)));
    }
}
