//! Field device poller: periodic register reads and on-demand writes over
//! `tokio-modbus` RTU clients.
//!
//! Devices wired to the same serial line share one client. The client is held
//! behind an `Arc<Mutex<_>>` so that poll ticks and command writes can run as
//! independent tasks while requests on one line stay serialized.
//!
//! Each `(device, node)` pair gets its own [`TimerKey::Poll`] timer. A tick
//! turns into a [`PollRequest`], which the gateway spawns; failures are logged
//! and simply retried on the next tick.
use crate::config::{channel_or_default, ChannelConfig, FieldDevice, RegisterNode};
use crate::protocol::{self as proto, FunctionCode};
use crate::readings::{Readings, Source};
use crate::scheduler::{Scheduler, TimerKey};
use crate::serial::serial_port_builder;
use crate::{Error, Result};
use async_trait::async_trait;
use log::*;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_modbus::prelude::{Reader, Writer};
use tokio_modbus::{slave::SlaveContext, Slave};

/// Register-level access to the devices of one field-bus line.
#[async_trait]
pub trait RegisterClient: Send {
    /// Selects the unit (slave) address used by the following requests.
    fn set_unit(&mut self, unit: u8);

    async fn read_coils(&mut self, address: u16, count: u16) -> Result<Vec<bool>>;
    async fn read_discrete_inputs(&mut self, address: u16, count: u16) -> Result<Vec<bool>>;
    async fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>>;
    async fn read_input_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>>;
    async fn write_single_coil(&mut self, address: u16, value: bool) -> Result<()>;
    async fn write_single_register(&mut self, address: u16, value: u16) -> Result<()>;
    async fn write_multiple_coils(&mut self, address: u16, values: &[bool]) -> Result<()>;
    async fn write_multiple_registers(&mut self, address: u16, values: &[u16]) -> Result<()>;
}

/// Helper function to map tokio result to our result.
fn map_tokio_result<T>(result: tokio_modbus::Result<T>) -> Result<T> {
    match result {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(err.into()), // Modbus exception
        Err(err) => Err(err.into()),     // IO error
    }
}

#[async_trait]
impl RegisterClient for tokio_modbus::client::Context {
    fn set_unit(&mut self, unit: u8) {
        self.set_slave(Slave(unit));
    }

    async fn read_coils(&mut self, address: u16, count: u16) -> Result<Vec<bool>> {
        map_tokio_result(Reader::read_coils(self, address, count).await)
    }

    async fn read_discrete_inputs(&mut self, address: u16, count: u16) -> Result<Vec<bool>> {
        map_tokio_result(Reader::read_discrete_inputs(self, address, count).await)
    }

    async fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>> {
        map_tokio_result(Reader::read_holding_registers(self, address, count).await)
    }

    async fn read_input_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>> {
        map_tokio_result(Reader::read_input_registers(self, address, count).await)
    }

    async fn write_single_coil(&mut self, address: u16, value: bool) -> Result<()> {
        map_tokio_result(Writer::write_single_coil(self, address, value).await)
    }

    async fn write_single_register(&mut self, address: u16, value: u16) -> Result<()> {
        map_tokio_result(Writer::write_single_register(self, address, value).await)
    }

    async fn write_multiple_coils(&mut self, address: u16, values: &[bool]) -> Result<()> {
        map_tokio_result(Writer::write_multiple_coils(self, address, values).await)
    }

    async fn write_multiple_registers(&mut self, address: u16, values: &[u16]) -> Result<()> {
        map_tokio_result(Writer::write_multiple_registers(self, address, values).await)
    }
}

/// Opens one protocol client per serial line.
pub trait ClientFactory: Send + Sync {
    fn connect(&self, config: &ChannelConfig) -> Result<Box<dyn RegisterClient>>;
}

/// Modbus RTU clients on real serial ports.
#[derive(Debug, Default)]
pub struct RtuClientFactory;

impl ClientFactory for RtuClientFactory {
    fn connect(&self, config: &ChannelConfig) -> Result<Box<dyn RegisterClient>> {
        let port = tokio_serial::SerialStream::open(&serial_port_builder(config)).map_err(|err| {
            Error::Connection {
                target: config.path.clone(),
                reason: err.to_string(),
            }
        })?;
        Ok(Box::new(tokio_modbus::client::rtu::attach_slave(
            port,
            Slave::broadcast(),
        )))
    }
}

/// A client shared by all devices on one line.
pub type SharedClient = Arc<Mutex<Box<dyn RegisterClient>>>;

/// One scheduled register read, ready to run as its own task.
pub struct PollRequest {
    client: SharedClient,
    device: FieldDevice,
    node: RegisterNode,
    readings: Readings,
}

impl PollRequest {
    pub fn device(&self) -> &FieldDevice {
        &self.device
    }

    pub fn node(&self) -> &RegisterNode {
        &self.node
    }

    /// Reads the node and stores the decoded value under the node name.
    pub async fn execute(self) -> Result<Value> {
        let code = FunctionCode::try_from(self.node.function_code)?;
        if !code.is_read() {
            return Err(Error::UnsupportedOperation(self.node.function_code));
        }
        let address = self.node.register_address;
        let data_type = self.node.data_type;
        // The timeout also covers waiting for other devices on the same line.
        let read = async {
            let mut client = self.client.lock().await;
            client.set_unit(self.device.address);
            match code {
                FunctionCode::ReadCoils => first_bit(client.read_coils(address, 1).await?),
                FunctionCode::ReadDiscreteInputs => {
                    first_bit(client.read_discrete_inputs(address, 1).await?)
                }
                FunctionCode::ReadHoldingRegisters => {
                    let words = client
                        .read_holding_registers(address, data_type.register_count())
                        .await?;
                    proto::register_reading(code, data_type, &words)
                }
                FunctionCode::ReadInputRegisters => {
                    let words = client
                        .read_input_registers(address, data_type.register_count())
                        .await?;
                    proto::register_reading(code, data_type, &words)
                }
                _ => Err(Error::UnsupportedOperation(code as u8)),
            }
        };
        let value = tokio::time::timeout(self.device.timeout, read)
            .await
            .map_err(|_| Error::Timeout {
                address: self.device.address,
                timeout: self.device.timeout,
            })??;

        debug!(
            "Device {}, node {} ({code:?}): {value}",
            self.device.name, self.node.name
        );
        self.readings
            .set(Source::Field, self.node.name.clone(), value.clone());
        Ok(value)
    }
}

fn first_bit(bits: Vec<bool>) -> Result<Value> {
    bits.first()
        .map(|bit| Value::Bool(*bit))
        .ok_or_else(|| Error::Protocol("Empty bit response".into()))
}

/// A validated write operation.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    SingleCoil(bool),
    SingleRegister(u16),
    MultipleCoils(Vec<bool>),
    MultipleRegisters(Vec<u16>),
}

impl WriteOp {
    pub fn new(function_code: u8, value: &Value) -> Result<Self> {
        match FunctionCode::try_from(function_code)? {
            FunctionCode::WriteSingleCoil => Ok(Self::SingleCoil(proto::coil_value(value)?)),
            FunctionCode::WriteSingleRegister => {
                Ok(Self::SingleRegister(proto::register_value(value)?))
            }
            FunctionCode::WriteMultipleCoils => Ok(Self::MultipleCoils(proto::value_list(
                value,
                proto::coil_value,
            )?)),
            FunctionCode::WriteMultipleRegisters => Ok(Self::MultipleRegisters(
                proto::value_list(value, proto::register_value)?,
            )),
            _ => Err(Error::UnsupportedOperation(function_code)),
        }
    }
}

/// A resolved write, ready to run as its own task.
pub struct WriteRequest {
    client: SharedClient,
    device: FieldDevice,
    register: u16,
    op: WriteOp,
}

impl WriteRequest {
    pub async fn execute(self) -> Result<()> {
        let register = self.register;
        let write = async {
            let mut client = self.client.lock().await;
            client.set_unit(self.device.address);
            debug!("Unit address set to {}", self.device.address);
            match &self.op {
                WriteOp::SingleCoil(value) => client.write_single_coil(register, *value).await,
                WriteOp::SingleRegister(value) => {
                    client.write_single_register(register, *value).await
                }
                WriteOp::MultipleCoils(values) => {
                    client.write_multiple_coils(register, values).await
                }
                WriteOp::MultipleRegisters(values) => {
                    client.write_multiple_registers(register, values).await
                }
            }
        };
        tokio::time::timeout(self.device.timeout, write)
            .await
            .map_err(|_| Error::Timeout {
                address: self.device.address,
                timeout: self.device.timeout,
            })??;
        info!(
            "Wrote {:?} to device {} at register {register}",
            self.op, self.device.name
        );
        Ok(())
    }
}

pub struct FieldPoller {
    factory: Arc<dyn ClientFactory>,
    clients: HashMap<String, SharedClient>,
    devices: Vec<FieldDevice>,
    nodes: Vec<RegisterNode>,
    readings: Readings,
}

impl FieldPoller {
    pub fn new(factory: Arc<dyn ClientFactory>, readings: Readings) -> Self {
        Self {
            factory,
            clients: HashMap::new(),
            devices: Vec::new(),
            nodes: Vec::new(),
            readings,
        }
    }

    /// Opens one client for every line used by `devices` that has none yet.
    /// Returns the number of lines with a client.
    pub fn ensure_connections(
        &mut self,
        devices: &[FieldDevice],
        channels: &[ChannelConfig],
    ) -> usize {
        for device in devices {
            if self.clients.contains_key(&device.channel) {
                trace!(
                    "Client for line {} already exists, skipping creation",
                    device.channel
                );
                continue;
            }
            let config = channel_or_default(channels, &device.channel);
            match self.factory.connect(&config) {
                Ok(client) => {
                    info!(
                        "Connected to field device {} on line {}",
                        device.name, device.channel
                    );
                    self.clients
                        .insert(device.channel.clone(), Arc::new(Mutex::new(client)));
                }
                Err(err) => error!(
                    "Error connecting to field device {} on line {}: {err}",
                    device.name, device.channel
                ),
            }
        }
        self.clients.len()
    }

    /// Replaces every poll timer with one timer per `(device, node)` pair.
    pub fn schedule(
        &mut self,
        devices: &[FieldDevice],
        nodes: &[RegisterNode],
        scheduler: &mut Scheduler,
    ) -> usize {
        scheduler.cancel_where(|key| matches!(key, TimerKey::Poll { .. }));
        self.devices = devices.to_vec();
        self.nodes = nodes.to_vec();
        let mut armed = 0;
        for device in devices {
            for node in nodes.iter().filter(|node| node.device == device.address) {
                scheduler.arm(
                    TimerKey::Poll {
                        device: device.address,
                        node: node.name.clone(),
                    },
                    device.interval,
                );
                armed += 1;
            }
        }
        info!("Scheduled {armed} register polls");
        armed
    }

    pub fn device(&self, address: u8) -> Option<&FieldDevice> {
        self.devices.iter().find(|d| d.address == address)
    }

    fn client(&self, device: &FieldDevice) -> Result<SharedClient> {
        self.clients
            .get(&device.channel)
            .cloned()
            .ok_or_else(|| Error::NoClient(device.channel.clone()))
    }

    /// Resolves the request behind a poll tick.
    pub fn poll_request(&self, device: u8, node: &str) -> Result<PollRequest> {
        let device = self.device(device).ok_or(Error::UnknownDevice(device))?;
        let node = self
            .nodes
            .iter()
            .find(|n| n.device == device.address && n.name == node)
            .ok_or_else(|| Error::Protocol(format!("Unknown register node {node}")))?;
        self.request_for(device, node)
    }

    fn request_for(&self, device: &FieldDevice, node: &RegisterNode) -> Result<PollRequest> {
        Ok(PollRequest {
            client: self.client(device)?,
            device: device.clone(),
            node: node.clone(),
            readings: self.readings.clone(),
        })
    }

    /// Polls one node right away.
    pub async fn poll(&self, device: &FieldDevice, node: &RegisterNode) -> Result<Value> {
        self.request_for(device, node)?.execute().await
    }

    /// Resolves a write to the device with unit address `address`.
    pub fn write_request(
        &self,
        address: u8,
        function_code: u8,
        register: u16,
        value: &Value,
    ) -> Result<WriteRequest> {
        let device = self.device(address).ok_or(Error::UnknownDevice(address))?;
        let client = self.client(device)?;
        let op = WriteOp::new(function_code, value)?;
        Ok(WriteRequest {
            client,
            device: device.clone(),
            register,
            op,
        })
    }

    pub async fn write(
        &self,
        address: u8,
        function_code: u8,
        register: u16,
        value: &Value,
    ) -> Result<()> {
        self.write_request(address, function_code, register, value)?
            .execute()
            .await
    }
}
