//! Mooshimeter multimeter driver built on the config-tree protocol.
//!
//! The meter exposes everything through its config tree: measurement
//! mappings and ranges are choosers, readings arrive as updates of
//! `CH1:VALUE`, `CH2:VALUE` and `REAL_PWR`, and sample buffers as updates of
//! `CH1:BUF` / `CH2:BUF`. Node observers only queue events; the driver turns
//! them into datafeed packets once the link call that decoded them returns.

use std::sync::mpsc;
use std::time::{Duration, Instant};

use crate::config_tree::{ConfigTreeNode, NodeIndex, NodeObserver, NodeValue};
use crate::datafeed::{
    Analog, AnalogMeaning, Channel, DatafeedBus, DatafeedError, MqFlags, Packet, Quantity, Unit,
};
use crate::handshake::{run_handshake, DEFAULT_INFLATE_LIMIT};
use crate::node_protocol::{read_integer, NodeLink, ProtocolError, ProtocolTimeouts};
use crate::transport::Transport;

/// Samplerate chosen on open, in Hz.
pub const DEFAULT_SAMPLERATE: f32 = 125.0;
/// Samples averaged per reading chosen on open.
pub const DEFAULT_AVG_SAMPLES: f32 = 64.0;
/// Buffer resolution forced on open; the meter sometimes comes up at 8.
pub const DEFAULT_BUFFER_BPS: i64 = 24;

#[derive(Debug, thiserror::Error)]
pub enum MooshimeterError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Datafeed error: {0}")]
    Datafeed(#[from] DatafeedError),

    #[error("No choice available for {number} at {parent}")]
    NoChoice { parent: String, number: f32 },

    #[error("Invalid channel configuration: {0}")]
    ChannelConfig(String),

    #[error("Device is not open")]
    NotOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MooshimeterConfig {
    pub timeouts: ProtocolTimeouts,
    /// The meter drops the connection after about 30 s without a command.
    pub heartbeat_interval: Duration,
    pub inflate_limit: usize,
}

impl Default for MooshimeterConfig {
    fn default() -> Self {
        Self {
            timeouts: ProtocolTimeouts::default(),
            heartbeat_interval: Duration::from_secs(10),
            inflate_limit: DEFAULT_INFLATE_LIMIT,
        }
    }
}

impl MooshimeterConfig {
    pub fn timeouts(mut self, timeouts: ProtocolTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn inflate_limit(mut self, limit: usize) -> Self {
        self.inflate_limit = limit;
        self
    }
}

/// Software limits ending an acquisition. Unset limits never trigger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquisitionLimits {
    pub samples: Option<u64>,
    pub duration: Option<Duration>,
}

impl AcquisitionLimits {
    pub fn samples(mut self, samples: u64) -> Self {
        self.samples = Some(samples);
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn reached(&self, samples_read: u64, elapsed: Duration) -> bool {
        self.samples.is_some_and(|limit| samples_read >= limit)
            || self.duration.is_some_and(|limit| elapsed >= limit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterChannel {
    Ch1,
    Ch2,
    /// Real power, derived from both inputs.
    Power,
}

impl MeterChannel {
    pub const ALL: [Self; 3] = [Self::Ch1, Self::Ch2, Self::Power];

    pub fn index(self) -> usize {
        match self {
            Self::Ch1 => 0,
            Self::Ch2 => 1,
            Self::Power => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Ch1 => "CH1",
            Self::Ch2 => "CH2",
            Self::Power => "P",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    /// CH1 only.
    Current,
    /// CH2 only.
    Voltage,
    Temperature,
    /// Low voltage input, shared between channels.
    AuxVoltage,
    /// Shared between channels.
    Resistance,
    /// Shared between channels.
    Diode,
}

impl ChannelMode {
    pub fn uses_shared_input(self) -> bool {
        matches!(self, Self::AuxVoltage | Self::Resistance | Self::Diode)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Analysis {
    Mean,
    Rms,
    Buffer,
}

impl Analysis {
    fn choice(self) -> &'static str {
        match self {
            Self::Mean => "MEAN",
            Self::Rms => "RMS",
            Self::Buffer => "BUFFER",
        }
    }
}

/// Tree locations and meaning of one channel mode.
struct ModeSetup {
    shared: Option<&'static str>,
    mapping: &'static str,
    range_parent: String,
    quantity: Quantity,
    unit: Unit,
    diode: bool,
}

fn mode_setup(channel: MeterChannel, mode: ChannelMode) -> Option<ModeSetup> {
    let prefix = channel.name();
    let own = |mapping: &'static str, quantity, unit| ModeSetup {
        shared: None,
        mapping,
        range_parent: format!("{prefix}:MAPPING:{mapping}"),
        quantity,
        unit,
        diode: false,
    };
    let shared = |input: &'static str, quantity, unit, diode| ModeSetup {
        shared: Some(input),
        mapping: "SHARED",
        range_parent: format!("SHARED:{input}"),
        quantity,
        unit,
        diode,
    };

    Some(match (channel, mode) {
        (MeterChannel::Power, _) => return None,
        (MeterChannel::Ch1, ChannelMode::Current) => own("CURRENT", Quantity::Current, Unit::Ampere),
        (MeterChannel::Ch2, ChannelMode::Voltage) => own("VOLTAGE", Quantity::Voltage, Unit::Volt),
        (MeterChannel::Ch1, ChannelMode::Temperature) => {
            own("TEMP", Quantity::Temperature, Unit::Kelvin)
        }
        (MeterChannel::Ch2, ChannelMode::Temperature) => {
            own("TEMP", Quantity::Temperature, Unit::Celsius)
        }
        (_, ChannelMode::AuxVoltage) => shared("AUX_V", Quantity::Voltage, Unit::Volt, false),
        (_, ChannelMode::Resistance) => shared("RESISTANCE", Quantity::Resistance, Unit::Ohm, false),
        (_, ChannelMode::Diode) => shared("DIODE", Quantity::Voltage, Unit::Volt, true),
        (MeterChannel::Ch1, ChannelMode::Voltage) | (MeterChannel::Ch2, ChannelMode::Current) => {
            return None
        }
    })
}

/// Numeric value of a chooser child name, 0 when it is not a number.
fn numeric_name(name: &str) -> f32 {
    name.trim().parse().unwrap_or(0.0)
}

/// Pick the smallest choice at or above `number`, or the largest one below
/// it when none is large enough. Non-positive choices are never picked.
///
/// ```
/// use labfeed_rs::mooshimeter::select_next_largest;
///
/// let rates = [125.0, 250.0, 500.0];
/// assert_eq!(select_next_largest(&rates, 200.0), Some(1));
/// assert_eq!(select_next_largest(&rates, 1000.0), Some(2));
/// ```
pub fn select_next_largest(choices: &[f32], number: f32) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (index, &value) in choices.iter().enumerate() {
        if value.is_nan() || value <= 0.0 {
            continue;
        }
        let distance = value - number;
        let Some((_, best_distance)) = best else {
            best = Some((index, distance));
            continue;
        };
        let better = if distance < 0.0 {
            best_distance <= 0.0 && distance > best_distance
        } else {
            best_distance < 0.0 || distance < best_distance
        };
        if better {
            best = Some((index, distance));
        }
    }
    best.map(|(index, _)| index)
}

/// Decode a packed sample buffer into scaled values.
///
/// Samples are `bits_per_sample` wide two's complement numbers stored little
/// endian in the fewest whole bytes (at most 4). Returns the values and the
/// largest magnitude among them, or `None` when nothing can be decoded.
pub fn decode_buffer(raw: &[u8], bits_per_sample: u32, lsb2native: f32) -> Option<(Vec<f32>, f32)> {
    if bits_per_sample == 0 || raw.is_empty() {
        return None;
    }
    let bytes_per_sample = bits_per_sample.div_ceil(8) as usize;
    if bytes_per_sample > 4 {
        return None;
    }

    let sign_bit = 1i64 << (bits_per_sample - 1);
    let mut maximum = 0.0f32;
    let values: Vec<f32> = raw
        .chunks_exact(bytes_per_sample)
        .map(|chunk| {
            let unscaled = chunk
                .iter()
                .rev()
                .fold(0i64, |acc, &byte| (acc << 8) | i64::from(byte));
            let signed = (unscaled & (sign_bit - 1)) - (unscaled & sign_bit);
            let converted = signed as f32 * lsb2native;
            maximum = maximum.max(converted.abs());
            converted
        })
        .collect();

    if values.is_empty() {
        None
    } else {
        Some((values, maximum))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Autorange {
    range_path: String,
    parent: String,
}

#[derive(Debug, Clone)]
struct ChannelState {
    channel: Channel,
    quantity: Quantity,
    unit: Unit,
    flags: MqFlags,
    autorange: Option<Autorange>,
    bits_per_sample: u32,
    lsb2native: f32,
}

impl ChannelState {
    fn new(channel: Channel, quantity: Quantity, unit: Unit, flags: MqFlags) -> Self {
        Self {
            channel,
            quantity,
            unit,
            flags,
            autorange: None,
            bits_per_sample: 0,
            lsb2native: 0.0,
        }
    }

    fn meaning(&self) -> AnalogMeaning {
        AnalogMeaning::new(self.quantity, self.unit, self.flags, &self.channel.name)
    }
}

#[derive(Debug)]
enum MeterEvent {
    Value { channel: usize, value: f32 },
    Buffer { channel: usize, raw: Vec<u8> },
    BitsPerSample { channel: usize, bits: i32 },
    Lsb2Native { channel: usize, scale: f32 },
}

#[derive(Debug, Clone, Copy)]
enum Role {
    Value,
    Buffer,
    BitsPerSample,
    Lsb2Native,
}

const UPDATE_HANDLERS: [(&str, usize, Role); 9] = [
    ("CH1:VALUE", 0, Role::Value),
    ("CH1:BUF", 0, Role::Buffer),
    ("CH1:BUF_BPS", 0, Role::BitsPerSample),
    ("CH1:BUF_LSB2NATIVE", 0, Role::Lsb2Native),
    ("CH2:VALUE", 1, Role::Value),
    ("CH2:BUF", 1, Role::Buffer),
    ("CH2:BUF_BPS", 1, Role::BitsPerSample),
    ("CH2:BUF_LSB2NATIVE", 1, Role::Lsb2Native),
    ("REAL_PWR", 2, Role::Value),
];

fn event_observer(role: Role, channel: usize, sender: mpsc::Sender<MeterEvent>) -> Box<dyn NodeObserver> {
    match role {
        Role::Value => Box::new(move |node: &ConfigTreeNode| {
            if let NodeValue::Float(value) = *node.value() {
                let _ = sender.send(MeterEvent::Value { channel, value });
            }
        }),
        Role::Buffer => Box::new(move |node: &ConfigTreeNode| {
            if let NodeValue::Binary(raw) = node.value() {
                let _ = sender.send(MeterEvent::Buffer {
                    channel,
                    raw: raw.clone(),
                });
            }
        }),
        Role::BitsPerSample => Box::new(move |node: &ConfigTreeNode| match read_integer(node) {
            Ok(bits) => {
                let _ = sender.send(MeterEvent::BitsPerSample { channel, bits });
            }
            Err(e) => log::error!("{e}"),
        }),
        Role::Lsb2Native => Box::new(move |node: &ConfigTreeNode| {
            if let NodeValue::Float(scale) = *node.value() {
                let _ = sender.send(MeterEvent::Lsb2Native { channel, scale });
            } else {
                log::warn!("Ignoring {} update of type {}", node.name(), node.node_type());
            }
        }),
    }
}

#[derive(Debug, Clone, Copy)]
struct Acquisition {
    started: Instant,
    samples_read: u64,
    last_heartbeat: Instant,
}

/// A Mooshimeter reached over `T`.
///
/// ```no_run
/// use labfeed_rs::mooshimeter::{Mooshimeter, MooshimeterConfig};
/// use labfeed_rs::transport::{SerialBridge, SerialBridgeConfig};
///
/// let bridge = SerialBridge::open(SerialBridgeConfig::new("/dev/ttyACM0")).unwrap();
/// let mut meter = Mooshimeter::new(bridge, MooshimeterConfig::default());
/// meter.open().unwrap();
/// meter.apply_channel_config("A,V:60:RMS").unwrap();
/// meter.start_acquisition().unwrap();
/// while meter.service().unwrap() {}
/// ```
#[derive(Debug)]
pub struct Mooshimeter<T: Transport> {
    link: NodeLink<T>,
    config: MooshimeterConfig,
    bus: DatafeedBus,
    channels: [ChannelState; 3],
    sender: mpsc::Sender<MeterEvent>,
    events: mpsc::Receiver<MeterEvent>,
    limits: AcquisitionLimits,
    acquisition: Option<Acquisition>,
    stream_enabled: bool,
    open: bool,
}

impl<T: Transport> Mooshimeter<T> {
    pub fn new(transport: T, config: MooshimeterConfig) -> Self {
        let (sender, events) = mpsc::channel();
        Self {
            link: NodeLink::new(transport, config.timeouts),
            config,
            bus: DatafeedBus::new(),
            channels: [
                ChannelState::new(Channel::analog(0, "CH1"), Quantity::Current, Unit::Ampere, MqFlags::DC),
                ChannelState::new(Channel::analog(1, "CH2"), Quantity::Voltage, Unit::Volt, MqFlags::DC),
                ChannelState::new(
                    Channel::analog(2, "P").disabled(),
                    Quantity::Power,
                    Unit::Watt,
                    MqFlags::RMS,
                ),
            ],
            sender,
            events,
            limits: AcquisitionLimits::default(),
            acquisition: None,
            stream_enabled: false,
            open: false,
        }
    }

    pub fn config(&self) -> &MooshimeterConfig {
        &self.config
    }

    pub fn link(&self) -> &NodeLink<T> {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut NodeLink<T> {
        &mut self.link
    }

    pub fn bus_mut(&mut self) -> &mut DatafeedBus {
        &mut self.bus
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn is_streaming(&self) -> bool {
        self.stream_enabled
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.channels.iter().map(|state| state.channel.clone()).collect()
    }

    pub fn set_channel_enabled(&mut self, channel: MeterChannel, enabled: bool) {
        self.channels[channel.index()].channel.enabled = enabled;
    }

    /// What packets of `channel` currently mean.
    pub fn meaning(&self, channel: MeterChannel) -> AnalogMeaning {
        self.channels[channel.index()].meaning()
    }

    pub fn limits(&self) -> AcquisitionLimits {
        self.limits
    }

    pub fn set_limits(&mut self, limits: AcquisitionLimits) {
        self.limits = limits;
    }

    fn ensure_open(&self) -> Result<(), MooshimeterError> {
        if self.open {
            Ok(())
        } else {
            Err(MooshimeterError::NotOpen)
        }
    }

    /// Run the startup handshake, install the update handlers and put the
    /// meter into a known idle state.
    pub fn open(&mut self) -> Result<(), MooshimeterError> {
        let _span = tracing::debug_span!("mooshimeter_open").entered();
        self.open = false;
        self.stream_enabled = false;
        self.acquisition = None;
        while self.events.try_recv().is_ok() {}

        run_handshake(&mut self.link, self.config.inflate_limit)?;
        self.install_update_handlers();
        self.open = true;

        self.apply_defaults()?;
        self.dispatch_events()
    }

    fn apply_defaults(&mut self) -> Result<(), MooshimeterError> {
        self.choose("SAMPLING:TRIGGER", "SAMPLING:TRIGGER:OFF")?;
        self.choose_larger_number("SAMPLING:RATE", "SAMPLING:RATE", DEFAULT_SAMPLERATE)?;
        self.choose_larger_number("SAMPLING:DEPTH", "SAMPLING:DEPTH", DEFAULT_AVG_SAMPLES)?;
        self.write_integer_and_wait("CH1:BUF_BPS", DEFAULT_BUFFER_BPS)?;
        self.write_integer_and_wait("CH2:BUF_BPS", DEFAULT_BUFFER_BPS)?;
        self.configure(MeterChannel::Ch1, ChannelMode::Current, 0.0)?;
        self.analysis(MeterChannel::Ch1, Analysis::Mean)?;
        self.configure(MeterChannel::Ch2, ChannelMode::Voltage, 0.0)?;
        self.analysis(MeterChannel::Ch2, Analysis::Mean)
    }

    /// Drop the received tree and all link state.
    pub fn close(&mut self) {
        self.stream_enabled = false;
        self.acquisition = None;
        self.open = false;
        self.link.reset();
        while self.events.try_recv().is_ok() {}
        log::debug!("Mooshimeter closed");
    }

    fn install_update_handlers(&mut self) {
        for (path, channel, role) in UPDATE_HANDLERS {
            let Some(index) = self.link.tree().lookup_path(path) else {
                log::warn!("No tree path for {path}");
                continue;
            };
            let observer = event_observer(role, channel, self.sender.clone());
            self.link.tree_mut().set_observer(index, observer);
        }
    }

    fn write_and_wait(&mut self, target: NodeIndex, value: i64) -> Result<(), MooshimeterError> {
        let original = self.link.tree().node(target).update_number();
        self.link.write_integer(target, value)?;
        let timeout = self.link.timeouts().node_update;
        self.link.wait_for_update(target, original, timeout)?;
        Ok(())
    }

    fn choose(&mut self, path: &str, choice: &str) -> Result<(), MooshimeterError> {
        let value = self.link.tree().chooser_index(choice).ok_or_else(|| {
            ProtocolError::Data(format!("Value {choice} not found for chooser {path}"))
        })?;
        let target = self.link.lookup(path)?;
        log::trace!("Setting chooser {path} to {choice} ({value})");
        self.write_and_wait(target, value as i64)
    }

    fn write_integer_and_wait(&mut self, path: &str, value: i64) -> Result<(), MooshimeterError> {
        let target = self.link.lookup(path)?;
        log::trace!("Setting integer {path} to {value}");
        self.write_and_wait(target, value)
    }

    fn number_choices(&self, parent: &str) -> Result<Vec<f32>, MooshimeterError> {
        let index = self.link.lookup(parent)?;
        Ok(self
            .link
            .tree()
            .children_of(index)
            .map(|child| numeric_name(child.name()))
            .collect())
    }

    fn choose_larger_number(&mut self, path: &str, parent: &str, number: f32) -> Result<(), MooshimeterError> {
        let choices = self.number_choices(parent)?;
        let selected = select_next_largest(&choices, number).ok_or_else(|| MooshimeterError::NoChoice {
            parent: parent.to_string(),
            number,
        })?;
        let target = self.link.lookup(path)?;
        log::trace!("Setting number choice {path} to index {selected} for requested {number}");
        self.write_and_wait(target, selected as i64)
    }

    /// Select the child of chooser `path` found at path `choice`, waiting
    /// for the meter to confirm.
    pub fn set_chooser(&mut self, path: &str, choice: &str) -> Result<(), MooshimeterError> {
        self.ensure_open()?;
        self.choose(path, choice)?;
        self.dispatch_events()
    }

    pub fn set_integer(&mut self, path: &str, value: i64) -> Result<(), MooshimeterError> {
        self.ensure_open()?;
        self.write_integer_and_wait(path, value)?;
        self.dispatch_events()
    }

    /// Point chooser `path` at the child of `parent` best covering `number`.
    pub fn set_larger_number(&mut self, path: &str, parent: &str, number: f32) -> Result<(), MooshimeterError> {
        self.ensure_open()?;
        self.choose_larger_number(path, parent, number)?;
        self.dispatch_events()
    }

    /// Re-range for a reading of `latest`. Nothing is sent, and `false`
    /// returned, when the best range is already selected. The write is not
    /// waited for.
    pub fn set_autorange(&mut self, path: &str, parent: &str, latest: f32) -> Result<bool, MooshimeterError> {
        let choices = self.number_choices(parent)?;
        let selected = select_next_largest(&choices, latest.abs()).ok_or_else(|| MooshimeterError::NoChoice {
            parent: parent.to_string(),
            number: latest,
        })?;
        let target = self.link.lookup(path)?;
        if read_integer(self.link.tree().node(target))? == selected as i32 {
            return Ok(false);
        }
        log::trace!("Changing autorange {path} to index {selected} for {latest}");
        self.link.write_integer(target, selected as i64)?;
        Ok(true)
    }

    /// Numeric name of the child of `parent` that chooser `path` selects.
    pub fn chosen_number(&self, path: &str, parent: &str) -> Result<f32, MooshimeterError> {
        let value_node = self.link.lookup(path)?;
        let available = self.link.lookup(parent)?;
        let selected = read_integer(self.link.tree().node(value_node))?;
        let child = usize::try_from(selected)
            .ok()
            .and_then(|selected| self.link.tree().node(available).children().get(selected).copied())
            .ok_or_else(|| {
                ProtocolError::Data(format!("{path} selects {selected}, outside of {parent}"))
            })?;
        Ok(numeric_name(self.link.tree().node(child).name()))
    }

    /// Numeric names of all children of `path`.
    pub fn available_number_choices(&self, path: &str) -> Result<Vec<f32>, MooshimeterError> {
        self.number_choices(path)
    }

    pub fn samplerate(&self) -> Result<u64, MooshimeterError> {
        self.ensure_open()?;
        Ok(self.chosen_number("SAMPLING:RATE", "SAMPLING:RATE")? as u64)
    }

    pub fn set_samplerate(&mut self, samplerate: u64) -> Result<(), MooshimeterError> {
        self.set_larger_number("SAMPLING:RATE", "SAMPLING:RATE", samplerate as f32)
    }

    pub fn samplerates(&self) -> Result<Vec<u64>, MooshimeterError> {
        self.ensure_open()?;
        Ok(self
            .available_number_choices("SAMPLING:RATE")?
            .into_iter()
            .map(|rate| rate as u64)
            .collect())
    }

    /// Number of samples averaged into one reading.
    pub fn avg_samples(&self) -> Result<u64, MooshimeterError> {
        self.ensure_open()?;
        Ok(self.chosen_number("SAMPLING:DEPTH", "SAMPLING:DEPTH")? as u64)
    }

    pub fn set_avg_samples(&mut self, samples: u64) -> Result<(), MooshimeterError> {
        self.set_larger_number("SAMPLING:DEPTH", "SAMPLING:DEPTH", samples as f32)
    }

    pub fn avg_samples_choices(&self) -> Result<Vec<u64>, MooshimeterError> {
        self.ensure_open()?;
        Ok(self
            .available_number_choices("SAMPLING:DEPTH")?
            .into_iter()
            .map(|depth| depth as u64)
            .collect())
    }

    /// Measure `mode` on `channel`. A `range` of zero or less enables
    /// autoranging; otherwise the smallest range covering it is selected.
    pub fn configure_channel(&mut self, channel: MeterChannel, mode: ChannelMode, range: f32) -> Result<(), MooshimeterError> {
        self.ensure_open()?;
        self.configure(channel, mode, range)?;
        self.dispatch_events()
    }

    fn configure(&mut self, channel: MeterChannel, mode: ChannelMode, range: f32) -> Result<(), MooshimeterError> {
        let setup = mode_setup(channel, mode).ok_or_else(|| {
            MooshimeterError::ChannelConfig(format!("{mode:?} is not available on {}", channel.name()))
        })?;
        let prefix = channel.name();

        if let Some(input) = setup.shared {
            self.choose("SHARED", &format!("SHARED:{input}"))?;
        }
        self.choose(
            &format!("{prefix}:MAPPING"),
            &format!("{prefix}:MAPPING:{}", setup.mapping),
        )?;
        let range_path = format!("{prefix}:RANGE_I");
        self.choose_larger_number(&range_path, &setup.range_parent, range)?;

        let state = &mut self.channels[channel.index()];
        if range <= 0.0 {
            state.autorange = Some(Autorange {
                range_path,
                parent: setup.range_parent,
            });
            state.flags.insert(MqFlags::AUTORANGE);
        } else {
            state.autorange = None;
            state.flags.remove(MqFlags::AUTORANGE);
        }
        state.flags.set(MqFlags::DIODE, setup.diode);
        state.quantity = setup.quantity;
        state.unit = setup.unit;
        log::debug!("{prefix} measuring {mode:?} (range {range})");
        Ok(())
    }

    pub fn set_analysis(&mut self, channel: MeterChannel, analysis: Analysis) -> Result<(), MooshimeterError> {
        self.ensure_open()?;
        self.analysis(channel, analysis)?;
        self.dispatch_events()
    }

    fn analysis(&mut self, channel: MeterChannel, analysis: Analysis) -> Result<(), MooshimeterError> {
        if channel == MeterChannel::Power {
            return Err(MooshimeterError::ChannelConfig(
                "the power channel has no analysis setting".to_string(),
            ));
        }
        let flags = &mut self.channels[channel.index()].flags;
        match analysis {
            Analysis::Mean => {
                flags.remove(MqFlags::RMS);
                flags.insert(MqFlags::DC);
            }
            Analysis::Rms => {
                flags.remove(MqFlags::DC);
                flags.insert(MqFlags::RMS);
            }
            Analysis::Buffer => flags.remove(MqFlags::DC | MqFlags::RMS),
        }
        let prefix = channel.name();
        self.choose(
            &format!("{prefix}:ANALYSIS"),
            &format!("{prefix}:ANALYSIS:{}", analysis.choice()),
        )
    }

    /// Apply a `CH1,CH2` configuration string.
    ///
    /// Each half reads `MODE[:RANGE[:ANALYSIS]]`; halves may also be split
    /// by `/` and fields by `;`. Modes are recognized by prefix, ignoring
    /// case: `Current`/`A`, `Voltage`/`V`, `Temperature`/`T`/`K`,
    /// `Resistance`/`Ohm`/`W`/`R`, `Diode`/`D` and `Aux`/`LV`. A range of 0
    /// or none autoranges. Analysis is `Mean`/`DC`, `RMS`/`AC` or
    /// `Buffer`/`Samples`, and is only applied when a range is given too.
    /// Only one channel may use the shared input.
    pub fn apply_channel_config(&mut self, config: &str) -> Result<(), MooshimeterError> {
        self.ensure_open()?;
        let mut halves = config.split([',', '/']);
        let mut shared_in_use = false;

        for channel in [MeterChannel::Ch1, MeterChannel::Ch2] {
            let Some(half) = halves.next() else {
                break;
            };
            let Some(spec) = ChannelSpec::parse(half, channel) else {
                continue;
            };
            if spec.mode.uses_shared_input() {
                if shared_in_use {
                    return Err(MooshimeterError::ChannelConfig(format!(
                        "{} cannot use the shared input, it is already taken",
                        channel.name()
                    )));
                }
                shared_in_use = true;
            }
            self.configure(channel, spec.mode, spec.range)?;
            if let Some(analysis) = spec.analysis {
                self.analysis(channel, analysis)?;
            }
        }
        self.dispatch_events()
    }

    /// Switch the meter to continuous sampling and start publishing.
    pub fn start_acquisition(&mut self) -> Result<(), MooshimeterError> {
        self.ensure_open()?;
        self.choose("SAMPLING:TRIGGER", "SAMPLING:TRIGGER:CONTINUOUS")?;
        // Readings that arrived while idle are not part of this run.
        self.dispatch_events()?;

        let now = Instant::now();
        self.acquisition = Some(Acquisition {
            started: now,
            samples_read: 0,
            last_heartbeat: now,
        });
        self.bus.publish(Packet::header())?;
        self.stream_enabled = true;
        log::debug!("Acquisition started");
        Ok(())
    }

    pub fn stop_acquisition(&mut self) -> Result<(), MooshimeterError> {
        self.finish_acquisition()?;
        self.dispatch_events()
    }

    fn finish_acquisition(&mut self) -> Result<(), MooshimeterError> {
        let Some(acquisition) = self.acquisition.take() else {
            return Ok(());
        };
        self.stream_enabled = false;
        let stopped = self.choose("SAMPLING:TRIGGER", "SAMPLING:TRIGGER:OFF");
        if let Err(e) = &stopped {
            log::error!("Failed to stop sampling: {e}");
        }
        self.bus.publish(Packet::End)?;
        log::debug!(
            "Acquisition stopped after {} samples",
            acquisition.samples_read
        );
        stopped
    }

    /// Poll a trivial node so the meter keeps the connection open.
    pub fn heartbeat(&mut self) -> Result<(), MooshimeterError> {
        let target = self
            .link
            .tree()
            .lookup_path("PCB_VERSION")
            .ok_or_else(|| ProtocolError::Data("Tree for PCB_VERSION not found".to_string()))?;
        log::trace!("Sending heartbeat request");
        self.link.poll_node(target)?;
        Ok(())
    }

    /// Handle every notification that already arrived.
    pub fn poll_incoming(&mut self) -> Result<usize, MooshimeterError> {
        let received = self.link.drain()?;
        self.dispatch_events()?;
        Ok(received)
    }

    /// One pass of the acquisition loop: wait up to one poll interval for
    /// data, handle it, and keep the link alive. Returns whether an
    /// acquisition is still running.
    pub fn service(&mut self) -> Result<bool, MooshimeterError> {
        self.ensure_open()?;
        let interval = self.link.timeouts().poll_interval;
        if self.link.pump(interval)? {
            self.link.drain()?;
        }
        self.dispatch_events()?;

        let Some(acquisition) = self.acquisition else {
            return Ok(false);
        };
        if self
            .limits
            .reached(acquisition.samples_read, acquisition.started.elapsed())
        {
            self.stop_acquisition()?;
            return Ok(false);
        }
        if acquisition.last_heartbeat.elapsed() >= self.config.heartbeat_interval {
            self.heartbeat()?;
            if let Some(running) = self.acquisition.as_mut() {
                running.last_heartbeat = Instant::now();
            }
        }
        Ok(true)
    }

    fn dispatch_events(&mut self) -> Result<(), MooshimeterError> {
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event)?;
        }
        Ok(())
    }

    fn streaming(&self, channel: usize) -> bool {
        self.stream_enabled && self.channels[channel].channel.enabled
    }

    fn handle_event(&mut self, event: MeterEvent) -> Result<(), MooshimeterError> {
        match event {
            MeterEvent::BitsPerSample { channel, bits } => {
                self.channels[channel].bits_per_sample = u32::try_from(bits).unwrap_or_default();
            }
            MeterEvent::Lsb2Native { channel, scale } => {
                self.channels[channel].lsb2native = scale;
            }
            MeterEvent::Value { channel, value } => {
                if !self.streaming(channel) {
                    return Ok(());
                }
                log::trace!("Received value for channel {channel} = {value}");
                self.publish_analog(channel, 2, vec![value])?;
                self.autorange(channel, value);
                self.count_samples(1)?;
            }
            MeterEvent::Buffer { channel, raw } => {
                if !self.streaming(channel) {
                    return Ok(());
                }
                let state = &self.channels[channel];
                let Some((values, maximum)) = decode_buffer(&raw, state.bits_per_sample, state.lsb2native) else {
                    return Ok(());
                };
                let count = values.len();
                log::trace!(
                    "Received buffer for channel {channel} with {} bytes ({count} samples)",
                    raw.len()
                );
                self.publish_analog(channel, 0, values)?;
                self.autorange(channel, maximum);
                self.count_samples(count as u64)?;
            }
        }
        Ok(())
    }

    fn publish_analog(&mut self, channel: usize, digits: i8, data: Vec<f32>) -> Result<(), MooshimeterError> {
        let packet = Packet::Analog(Analog {
            meaning: self.channels[channel].meaning(),
            digits,
            data,
        });
        self.bus.publish(packet)?;
        Ok(())
    }

    fn autorange(&mut self, channel: usize, value: f32) {
        let Some(target) = self.channels[channel].autorange.clone() else {
            return;
        };
        if let Err(e) = self.set_autorange(&target.range_path, &target.parent, value) {
            log::error!("Autorange of {} failed: {e}", target.range_path);
        }
    }

    fn count_samples(&mut self, samples: u64) -> Result<(), MooshimeterError> {
        let Some(acquisition) = self.acquisition.as_mut() else {
            return Ok(());
        };
        acquisition.samples_read += samples;
        if self
            .limits
            .reached(acquisition.samples_read, acquisition.started.elapsed())
        {
            self.finish_acquisition()?;
        }
        Ok(())
    }
}

/// One parsed half of a channel configuration string.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ChannelSpec {
    mode: ChannelMode,
    range: f32,
    analysis: Option<Analysis>,
}

fn has_prefix(text: &str, prefix: &str) -> bool {
    text.get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

impl ChannelSpec {
    /// `None` when the half has no mode and the channel stays as it is.
    fn parse(text: &str, channel: MeterChannel) -> Option<Self> {
        let fields: Vec<&str> = text.split([':', ';']).collect();
        let mode = fields[0];
        if mode.is_empty() {
            return None;
        }
        let range = fields.get(1).map_or(0.0, |range| numeric_name(range));

        let mode = if ["Resistance", "Ohm", "W", "R"].iter().any(|p| has_prefix(mode, p)) {
            ChannelMode::Resistance
        } else if ["Diode", "D"].iter().any(|p| has_prefix(mode, p)) {
            ChannelMode::Diode
        } else if ["Aux", "LV"].iter().any(|p| has_prefix(mode, p)) {
            ChannelMode::AuxVoltage
        } else if ["T", "K"].iter().any(|p| has_prefix(mode, p)) {
            ChannelMode::Temperature
        } else if channel == MeterChannel::Ch1 {
            if !["Current", "A"].iter().any(|p| has_prefix(mode, p)) {
                log::info!("Unrecognized mode for CH1: {mode}");
            }
            ChannelMode::Current
        } else {
            if !has_prefix(mode, "V") {
                log::info!("Unrecognized mode for CH2: {mode}");
            }
            ChannelMode::Voltage
        };

        let analysis = fields.get(2).map(|analysis| {
            if analysis.eq_ignore_ascii_case("RMS") || analysis.eq_ignore_ascii_case("AC") {
                Analysis::Rms
            } else if analysis.eq_ignore_ascii_case("Buffer") || analysis.eq_ignore_ascii_case("Samples") {
                Analysis::Buffer
            } else {
                Analysis::Mean
            }
        });

        Some(Self {
            mode,
            range,
            analysis,
        })
    }
}
