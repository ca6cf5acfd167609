//! Serial connection manager: owns every serial line, keeps it open, and turns
//! the newline-delimited text it receives into frames.
//!
//! Each line gets a reader task and a writer task. The reader forwards raw
//! chunks as [`LineEvent`]s to the gateway loop, which hands them back to
//! [`ConnectionManager::on_line_event`] for framing. Reopening after errors is
//! driven by [`TimerKey::Reopen`] timers, never by blocking waits.
use crate::config::{ChannelConfig, FlowControl, Parity};
use crate::scheduler::{Scheduler, TimerKey};
use log::*;
use serde_json::Value;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Delay before retrying an open that was refused with "access denied".
pub const REOPEN_BACKOFF: Duration = Duration::from_secs(3);
/// Frame buffers longer than this are dropped.
pub const MAX_BUFFER_LEN: usize = 1024;

pub type LineReader = Box<dyn AsyncRead + Send + Unpin>;
pub type LineWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Opens the byte stream behind a serial line.
pub trait SerialOpener: Send + Sync {
    fn open(&self, config: &ChannelConfig) -> io::Result<(LineReader, LineWriter)>;
}

/// Creates a `tokio_serial::SerialPortBuilder` from a channel configuration.
pub fn serial_port_builder(config: &ChannelConfig) -> tokio_serial::SerialPortBuilder {
    let data_bits = match config.data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    };
    let stop_bits = match config.stop_bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    };
    let parity = match config.parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Odd => tokio_serial::Parity::Odd,
        Parity::Even => tokio_serial::Parity::Even,
    };
    let flow_control = match config.flow_control {
        FlowControl::None => tokio_serial::FlowControl::None,
        FlowControl::Software => tokio_serial::FlowControl::Software,
        FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
    };
    tokio_serial::new(&config.path, config.baud_rate)
        .parity(parity)
        .stop_bits(stop_bits)
        .data_bits(data_bits)
        .flow_control(flow_control)
}

/// Opens real serial devices through `tokio-serial`.
#[derive(Debug, Default)]
pub struct TokioSerialOpener;

impl SerialOpener for TokioSerialOpener {
    fn open(&self, config: &ChannelConfig) -> io::Result<(LineReader, LineWriter)> {
        let port = tokio_serial::SerialStream::open(&serial_port_builder(config))
            .map_err(io::Error::from)?;
        let (reader, writer) = tokio::io::split(port);
        Ok((Box::new(reader), Box::new(writer)))
    }
}

fn is_access_denied(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::PermissionDenied || err.to_string().contains("Access denied")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Closed,
    Opening,
    Open,
    Error,
}

/// Latest decoded value of a line.
#[derive(Debug, Clone, PartialEq)]
pub enum LineValue {
    Json(Value),
    Raw(String),
}

impl LineValue {
    pub fn to_json(&self) -> Value {
        match self {
            LineValue::Json(value) => value.clone(),
            LineValue::Raw(text) => Value::String(text.clone()),
        }
    }
}

/// Frames emitted to listeners of a line.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Data { line: String, value: Value },
    RawData { line: String, text: String },
}

/// Raw traffic reported by the per-line tasks.
#[derive(Debug, Clone, PartialEq)]
pub enum LineEvent {
    Chunk {
        line: String,
        session: u64,
        text: String,
    },
    Closed {
        line: String,
        session: u64,
        reason: String,
    },
}

/// Identifies one attachment of a frame decoder to a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DecoderId(u64);

/// Accumulates text until it forms a brace-delimited object.
///
/// This is a boundary heuristic, not a parser: a frame is recognized once the
/// trimmed buffer starts with `{` and ends with `}`. Text that does not start
/// with `{` is passed through as raw data.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: String,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn push(&mut self, chunk: &str) -> Option<LineValue> {
        self.buffer.push_str(chunk.trim());
        if self.buffer.len() > MAX_BUFFER_LEN {
            warn!("Buffer too large ({} bytes), clearing it", self.buffer.len());
            self.buffer.clear();
            return None;
        }
        if self.buffer.is_empty() {
            return None;
        }
        if !self.buffer.starts_with('{') {
            trace!("Raw data: {}", self.buffer);
            return Some(LineValue::Raw(std::mem::take(&mut self.buffer)));
        }
        if !self.buffer.ends_with('}') {
            return None;
        }

        // Runs of duplicated leading braces collapse into one.
        let taken = std::mem::take(&mut self.buffer);
        let text = format!("{{{}", taken.trim_start_matches('{'));
        let mut values = serde_json::Deserializer::from_str(&text).into_iter::<Value>();
        match values.next() {
            Some(Ok(value)) => {
                if values.byte_offset() < text.len() {
                    debug!("Ignoring trailing frame text: {}", &text[values.byte_offset()..]);
                }
                trace!("Parsed data: {value}");
                Some(LineValue::Json(value))
            }
            Some(Err(err)) => {
                error!("Error parsing incoming message as JSON: {err} (buffer: {text})");
                None
            }
            None => None,
        }
    }
}

struct Channel {
    config: ChannelConfig,
    status: ChannelStatus,
    session: u64,
    reconnecting: bool,
    writer: Option<mpsc::UnboundedSender<String>>,
    tasks: Vec<JoinHandle<()>>,
    decoder: Option<DecoderId>,
    assembler: FrameAssembler,
    latest: Option<LineValue>,
}

impl Channel {
    fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            status: ChannelStatus::Closed,
            session: 0,
            reconnecting: false,
            writer: None,
            tasks: Vec::new(),
            decoder: None,
            assembler: FrameAssembler::new(),
            latest: None,
        }
    }

    fn close(&mut self) {
        self.writer = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

pub struct ConnectionManager {
    opener: Arc<dyn SerialOpener>,
    channels: HashMap<String, Channel>,
    line_events: mpsc::UnboundedSender<LineEvent>,
    events: broadcast::Sender<ChannelEvent>,
    sessions: u64,
    decoders: u64,
}

impl ConnectionManager {
    /// Creates a manager; line traffic arrives on the returned receiver.
    pub fn new(opener: Arc<dyn SerialOpener>) -> (Self, mpsc::UnboundedReceiver<LineEvent>) {
        let (line_events, receiver) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        (
            Self {
                opener,
                channels: HashMap::new(),
                line_events,
                events,
                sessions: 0,
                decoders: 0,
            },
            receiver,
        )
    }

    /// Returns the channel for `line`, creating and opening it if needed.
    /// A channel left closed by a failed open is opened again.
    pub fn acquire(
        &mut self,
        line: &str,
        config: &ChannelConfig,
        scheduler: &mut Scheduler,
    ) -> ChannelStatus {
        match self.channels.get_mut(line) {
            Some(channel) if channel.status != ChannelStatus::Closed => return channel.status,
            Some(channel) => channel.config = config.clone(),
            None => {
                self.channels
                    .insert(line.to_string(), Channel::new(config.clone()));
            }
        }
        self.open(line, scheduler);
        self.status(line).unwrap_or(ChannelStatus::Closed)
    }

    fn open(&mut self, line: &str, scheduler: &mut Scheduler) {
        let opener = self.opener.clone();
        let Some(channel) = self.channels.get_mut(line) else {
            return;
        };
        channel.status = ChannelStatus::Opening;
        match opener.open(&channel.config) {
            Ok((reader, writer)) => {
                self.sessions += 1;
                let session = self.sessions;
                let (queue, pending) = mpsc::unbounded_channel();
                channel.session = session;
                channel.writer = Some(queue);
                channel.tasks = vec![
                    tokio::spawn(read_lines(
                        line.to_string(),
                        session,
                        reader,
                        self.line_events.clone(),
                    )),
                    tokio::spawn(write_lines(line.to_string(), writer, pending)),
                ];
                channel.status = ChannelStatus::Open;
                channel.reconnecting = false;
                info!("Serial port {line} opened");
            }
            Err(err) => {
                error!("Failed to open port {line}: {err}");
                if is_access_denied(&err) || channel.reconnecting {
                    channel.status = ChannelStatus::Error;
                    scheduler.arm_once(TimerKey::Reopen(line.to_string()), REOPEN_BACKOFF);
                } else {
                    channel.status = ChannelStatus::Closed;
                }
            }
        }
    }

    /// Closes whatever is left of a line and opens it again.
    pub fn reopen(&mut self, line: &str, scheduler: &mut Scheduler) {
        let Some(channel) = self.channels.get_mut(line) else {
            return;
        };
        if !channel.tasks.is_empty() {
            channel.close();
            info!("Port {line} closed, reopening...");
        }
        self.open(line, scheduler);
    }

    /// Attaches a fresh frame decoder, detaching any previous one first.
    pub fn listen(
        &mut self,
        line: &str,
        config: &ChannelConfig,
        scheduler: &mut Scheduler,
    ) -> DecoderId {
        self.acquire(line, config, scheduler);
        self.decoders += 1;
        let decoder = DecoderId(self.decoders);
        if let Some(channel) = self.channels.get_mut(line) {
            if channel.decoder.replace(decoder).is_some() {
                info!("Removed existing decoder from port {line}");
            }
            channel.assembler.clear();
        }
        debug!("Listening to port {line}");
        decoder
    }

    /// Returns `true` if a decoder was attached.
    pub fn detach(&mut self, line: &str) -> bool {
        self.channels
            .get_mut(line)
            .and_then(|channel| channel.decoder.take())
            .is_some()
    }

    pub fn decoder(&self, line: &str) -> Option<DecoderId> {
        self.channels.get(line).and_then(|channel| channel.decoder)
    }

    /// Handles traffic reported by the line tasks.
    pub fn on_line_event(
        &mut self,
        event: LineEvent,
        scheduler: &mut Scheduler,
    ) -> Option<ChannelEvent> {
        match event {
            LineEvent::Chunk {
                line,
                session,
                text,
            } => {
                let channel = self.channels.get_mut(&line)?;
                if channel.session != session || channel.decoder.is_none() {
                    trace!("Dropping chunk from port {line}: no decoder attached");
                    return None;
                }
                let value = channel.assembler.push(&text)?;
                channel.latest = Some(value.clone());
                let event = match value {
                    LineValue::Json(value) => ChannelEvent::Data { line, value },
                    LineValue::Raw(text) => ChannelEvent::RawData { line, text },
                };
                // Nobody subscribed is fine.
                let _ = self.events.send(event.clone());
                Some(event)
            }
            LineEvent::Closed {
                line,
                session,
                reason,
            } => {
                let channel = self.channels.get_mut(&line)?;
                if channel.session != session || channel.status != ChannelStatus::Open {
                    return None;
                }
                warn!("Port {line} closed unexpectedly ({reason}). Attempting to reopen...");
                channel.close();
                channel.status = ChannelStatus::Error;
                channel.reconnecting = true;
                scheduler.arm_once(TimerKey::Reopen(line), Duration::ZERO);
                None
            }
        }
    }

    /// Queues `value` as one JSON line; the outcome is only logged.
    pub fn write(
        &mut self,
        line: &str,
        config: &ChannelConfig,
        value: &Value,
        scheduler: &mut Scheduler,
    ) {
        self.acquire(line, config, scheduler);
        let message = match serde_json::to_string(value) {
            Ok(message) => message,
            Err(err) => {
                error!("Cannot serialize message for port {line}: {err}");
                return;
            }
        };
        let Some(queue) = self.channels.get(line).and_then(|c| c.writer.as_ref()) else {
            error!("Error writing to port {line}: port is not open");
            return;
        };
        if queue.send(format!("{message}\n")).is_err() {
            error!("Error writing to port {line}: writer stopped");
        }
    }

    /// Last decoded value of a line.
    pub fn latest(&self, line: &str) -> Option<&LineValue> {
        self.channels.get(line).and_then(|channel| channel.latest.as_ref())
    }

    pub fn status(&self, line: &str) -> Option<ChannelStatus> {
        self.channels.get(line).map(|channel| channel.status)
    }

    /// Subscribes to the data/raw-data events of all lines.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    pub fn shutdown(&mut self) {
        for (line, channel) in self.channels.iter_mut() {
            channel.close();
            channel.status = ChannelStatus::Closed;
            debug!("Port {line} closed");
        }
    }
}

async fn read_lines(
    line: String,
    session: u64,
    reader: LineReader,
    events: mpsc::UnboundedSender<LineEvent>,
) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let reason = loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break String::from("end of stream"),
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf).into_owned();
                let chunk = LineEvent::Chunk {
                    line: line.clone(),
                    session,
                    text,
                };
                if events.send(chunk).is_err() {
                    return;
                }
            }
            Err(err) => break err.to_string(),
        }
    };
    let _ = events.send(LineEvent::Closed {
        line,
        session,
        reason,
    });
}

async fn write_lines(
    line: String,
    mut writer: LineWriter,
    mut pending: mpsc::UnboundedReceiver<String>,
) {
    while let Some(message) = pending.recv().await {
        let result = match writer.write_all(message.as_bytes()).await {
            Ok(()) => writer.flush().await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => debug!("Message sent to port {line}: {}", message.trim_end()),
            Err(err) => error!("Error writing to port {line}: {err}"),
        }
    }
}
