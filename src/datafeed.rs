//! Acquisition packets and the synchronous bus that delivers them.
//!
//! A packet published on a [`DatafeedBus`] first runs through the transform
//! modules in order; each may replace it, pass it on, or swallow it. Whatever
//! comes out of the last transform is handed to every callback in
//! registration order, on the calling thread.
//!
//! ```
//! use labfeed_rs::datafeed::{DatafeedBus, Packet};
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! let seen = Rc::new(RefCell::new(Vec::new()));
//! let sink = Rc::clone(&seen);
//! let mut bus = DatafeedBus::new();
//! bus.add_callback(move |packet: &Packet| sink.borrow_mut().push(packet.kind_name()));
//!
//! bus.publish(Packet::header()).unwrap();
//! bus.publish(Packet::End).unwrap();
//! assert_eq!(*seen.borrow(), vec!["HEADER", "END"]);
//! ```

use bitflags::bitflags;
use std::fmt;
use std::time::SystemTime;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum DatafeedError {
    #[error("Transform module '{module}' failed: {reason}")]
    TransformFailed { module: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelType {
    Logic,
    Analog,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Logic => "logic",
            Self::Analog => "analog",
        }
    }
}

/// One input of a device, as seen by triggers and session files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    /// Position among the channels of the same type, starting at 0.
    pub index: usize,
    pub kind: ChannelType,
    pub enabled: bool,
    pub name: String,
}

impl Channel {
    pub fn logic(index: usize, name: &str) -> Self {
        Self {
            index,
            kind: ChannelType::Logic,
            enabled: true,
            name: name.to_string(),
        }
    }

    pub fn analog(index: usize, name: &str) -> Self {
        Self {
            index,
            kind: ChannelType::Analog,
            enabled: true,
            name: name.to_string(),
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Measured quantity of an analog packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    Voltage,
    Current,
    Resistance,
    Temperature,
    Power,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Volt,
    Ampere,
    Ohm,
    Kelvin,
    Celsius,
    Watt,
    Unitless,
}

impl Unit {
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Volt => "V",
            Self::Ampere => "A",
            Self::Ohm => "Ω",
            Self::Kelvin => "K",
            Self::Celsius => "°C",
            Self::Watt => "W",
            Self::Unitless => "",
        }
    }
}

bitflags! {
    /// Measurement flags carried alongside an analog quantity.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct MqFlags: u32 {
        const AC = 1 << 0;
        const DC = 1 << 1;
        const RMS = 1 << 2;
        const DIODE = 1 << 3;
        const AUTORANGE = 1 << 4;
    }
}

/// What an analog packet's numbers mean.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalogMeaning {
    pub quantity: Quantity,
    pub unit: Unit,
    pub flags: MqFlags,
    pub channels: Vec<String>,
}

impl AnalogMeaning {
    pub fn new(quantity: Quantity, unit: Unit, flags: MqFlags, channel: &str) -> Self {
        Self {
            quantity,
            unit,
            flags,
            channels: vec![channel.to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Analog {
    pub meaning: AnalogMeaning,
    /// Decimal digits worth displaying.
    pub digits: i8,
    pub data: Vec<f32>,
}

impl Analog {
    pub fn num_samples(&self) -> usize {
        self.data.len()
    }
}

/// Older analog representation, upgraded on publish.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalogLegacy {
    pub channels: Vec<String>,
    pub quantity: Quantity,
    pub unit: Unit,
    pub flags: MqFlags,
    pub data: Vec<f32>,
}

impl From<AnalogLegacy> for Analog {
    fn from(legacy: AnalogLegacy) -> Self {
        Self {
            meaning: AnalogMeaning {
                quantity: legacy.quantity,
                unit: legacy.unit,
                flags: legacy.flags,
                channels: legacy.channels,
            },
            digits: 2,
            data: legacy.data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Logic {
    /// Bytes per sample.
    pub unitsize: usize,
    pub data: Vec<u8>,
}

impl Logic {
    pub fn new(unitsize: usize, data: Vec<u8>) -> Self {
        Self { unitsize, data }
    }

    pub fn num_samples(&self) -> usize {
        if self.unitsize == 0 {
            0
        } else {
            self.data.len() / self.unitsize
        }
    }
}

/// Typed configuration value carried by a meta packet.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaItem {
    Samplerate(u64),
    LimitSamples(u64),
    Other { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Header { feed_version: u32, start_time: SystemTime },
    End,
    Meta(Vec<MetaItem>),
    Trigger,
    Logic(Logic),
    FrameBegin,
    FrameEnd,
    Analog(Analog),
    AnalogLegacy(AnalogLegacy),
}

impl Packet {
    pub fn header() -> Self {
        Self::Header {
            feed_version: 1,
            start_time: SystemTime::now(),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Header { .. } => "HEADER",
            Self::End => "END",
            Self::Meta(_) => "META",
            Self::Trigger => "TRIGGER",
            Self::Logic(_) => "LOGIC",
            Self::FrameBegin => "FRAME_BEGIN",
            Self::FrameEnd => "FRAME_END",
            Self::Analog(_) => "ANALOG",
            Self::AnalogLegacy(_) => "ANALOG_OLD",
        }
    }

    /// Replace legacy representations by their current equivalent.
    pub fn upgrade(self) -> Self {
        match self {
            Self::AnalogLegacy(legacy) => Self::Analog(legacy.into()),
            other => other,
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Logic(logic) => write!(
                f,
                "LOGIC packet ({} bytes, unitsize = {})",
                logic.data.len(),
                logic.unitsize
            ),
            Self::Analog(analog) => write!(f, "ANALOG packet ({} samples)", analog.num_samples()),
            other => write!(f, "{} packet", other.kind_name()),
        }
    }
}

/// A pipeline stage that may rewrite or suppress packets.
pub trait Transform {
    fn name(&self) -> &str;

    /// `Ok(None)` swallows the packet without error.
    fn receive(&mut self, packet: Packet) -> Result<Option<Packet>, DatafeedError>;
}

type Callback = Box<dyn FnMut(&Packet)>;

/// Synchronous publish/subscribe channel for one acquisition.
#[derive(Default)]
pub struct DatafeedBus {
    transforms: Vec<Box<dyn Transform>>,
    callbacks: Vec<Callback>,
}

impl fmt::Debug for DatafeedBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatafeedBus")
            .field(
                "transforms",
                &self.transforms.iter().map(|t| t.name()).collect::<Vec<_>>(),
            )
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

impl DatafeedBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_callback<F: FnMut(&Packet) + 'static>(&mut self, callback: F) {
        self.callbacks.push(Box::new(callback));
    }

    pub fn add_transform<T: Transform + 'static>(&mut self, transform: T) {
        self.transforms.push(Box::new(transform));
    }

    pub fn clear_callbacks(&mut self) {
        self.callbacks.clear();
    }

    pub fn clear_transforms(&mut self) {
        self.transforms.clear();
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.len()
    }

    pub fn transform_count(&self) -> usize {
        self.transforms.len()
    }

    /// Run `packet` through the transforms and deliver what survives.
    pub fn publish(&mut self, packet: Packet) -> Result<(), DatafeedError> {
        let mut packet = packet.upgrade();

        for transform in &mut self.transforms {
            log::trace!("Running transform module '{}'", transform.name());
            match transform.receive(packet) {
                Ok(Some(out)) => packet = out.upgrade(),
                Ok(None) => {
                    log::trace!("Transform module didn't return a packet, aborting");
                    return Ok(());
                }
                Err(e) => {
                    log::error!("Error while running transform module: {e}");
                    return Err(e);
                }
            }
        }

        for callback in &mut self.callbacks {
            if log::log_enabled!(log::Level::Debug) {
                log::debug!("bus: Received {packet}");
            }
            callback(&packet);
        }
        Ok(())
    }
}

/// Stops passing sample data once a sample budget is used up.
///
/// Logic and analog packets are cut at the budget boundary; all other
/// packets pass unchanged.
#[derive(Debug, Clone)]
pub struct SampleLimit {
    limit: u64,
    seen: u64,
}

impl SampleLimit {
    pub fn new(limit: u64) -> Self {
        Self { limit, seen: 0 }
    }

    pub fn samples_seen(&self) -> u64 {
        self.seen
    }

    pub fn is_exhausted(&self) -> bool {
        self.seen >= self.limit
    }

    fn take(&mut self, available: usize) -> usize {
        let left = self.limit.saturating_sub(self.seen);
        let taken = usize::try_from(left).map_or(available, |left| left.min(available));
        self.seen += taken as u64;
        taken
    }
}

impl Transform for SampleLimit {
    fn name(&self) -> &str {
        "sample-limit"
    }

    fn receive(&mut self, packet: Packet) -> Result<Option<Packet>, DatafeedError> {
        match packet {
            Packet::Logic(mut logic) => {
                let taken = self.take(logic.num_samples());
                if taken == 0 {
                    return Ok(None);
                }
                logic.data.truncate(taken * logic.unitsize);
                Ok(Some(Packet::Logic(logic)))
            }
            Packet::Analog(mut analog) => {
                let taken = self.take(analog.num_samples());
                if taken == 0 {
                    return Ok(None);
                }
                analog.data.truncate(taken);
                Ok(Some(Packet::Analog(analog)))
            }
            other => Ok(Some(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Tag(&'static str);

    impl Transform for Tag {
        fn name(&self) -> &str {
            self.0
        }

        fn receive(&mut self, packet: Packet) -> Result<Option<Packet>, DatafeedError> {
            match packet {
                Packet::Meta(mut items) => {
                    items.push(MetaItem::Other {
                        key: self.0.to_string(),
                        value: String::new(),
                    });
                    Ok(Some(Packet::Meta(items)))
                }
                other => Ok(Some(other)),
            }
        }
    }

    struct DropTriggers;

    impl Transform for DropTriggers {
        fn name(&self) -> &str {
            "drop-triggers"
        }

        fn receive(&mut self, packet: Packet) -> Result<Option<Packet>, DatafeedError> {
            Ok((packet != Packet::Trigger).then_some(packet))
        }
    }

    struct Broken;

    impl Transform for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn receive(&mut self, _packet: Packet) -> Result<Option<Packet>, DatafeedError> {
            Err(DatafeedError::TransformFailed {
                module: "broken".to_string(),
                reason: "always fails".to_string(),
            })
        }
    }

    fn recording_bus() -> (DatafeedBus, Rc<RefCell<Vec<Packet>>>) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let mut bus = DatafeedBus::new();
        bus.add_callback(move |packet: &Packet| sink.borrow_mut().push(packet.clone()));
        (bus, seen)
    }

    #[test]
    fn test_transforms_run_in_order() {
        let (mut bus, seen) = recording_bus();
        bus.add_transform(Tag("first"));
        bus.add_transform(Tag("second"));
        bus.publish(Packet::Meta(Vec::new())).unwrap();

        let seen = seen.borrow();
        let Packet::Meta(items) = &seen[0] else {
            unreachable!("expected meta packet");
        };
        let keys: Vec<_> = items
            .iter()
            .map(|item| match item {
                MetaItem::Other { key, .. } => key.as_str(),
                _ => "",
            })
            .collect();
        assert_eq!(keys, vec!["first", "second"]);
    }

    #[test]
    fn test_swallowed_packet_is_not_an_error() {
        let (mut bus, seen) = recording_bus();
        bus.add_transform(DropTriggers);
        bus.add_transform(Broken);
        // Broken never runs because the packet stops at DropTriggers.
        bus.publish(Packet::Trigger).unwrap();
        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn test_failing_transform_aborts_publish() {
        let (mut bus, seen) = recording_bus();
        bus.add_transform(Broken);
        let err = bus.publish(Packet::End).unwrap_err();
        assert!(matches!(err, DatafeedError::TransformFailed { .. }));
        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn test_callbacks_in_registration_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut bus = DatafeedBus::new();
        for id in 0..3 {
            let order = Rc::clone(&order);
            bus.add_callback(move |_: &Packet| order.borrow_mut().push(id));
        }
        bus.publish(Packet::FrameBegin).unwrap();
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
        assert_eq!(bus.callback_count(), 3);
    }

    #[test]
    fn test_legacy_analog_is_upgraded() {
        let (mut bus, seen) = recording_bus();
        bus.publish(Packet::AnalogLegacy(AnalogLegacy {
            channels: vec!["CH1".to_string()],
            quantity: Quantity::Voltage,
            unit: Unit::Volt,
            flags: MqFlags::DC,
            data: vec![1.0, 2.0],
        }))
        .unwrap();

        let seen = seen.borrow();
        let Packet::Analog(analog) = &seen[0] else {
            unreachable!("expected analog packet");
        };
        assert_eq!(analog.num_samples(), 2);
        assert_eq!(analog.meaning.channels, vec!["CH1".to_string()]);
        assert!(analog.meaning.flags.contains(MqFlags::DC));
    }

    #[test]
    fn test_sample_limit_cuts_at_boundary() {
        let (mut bus, seen) = recording_bus();
        bus.add_transform(SampleLimit::new(5));

        bus.publish(Packet::Logic(Logic::new(2, vec![0; 8]))).unwrap();
        bus.publish(Packet::Logic(Logic::new(2, vec![1; 8]))).unwrap();
        bus.publish(Packet::Logic(Logic::new(2, vec![2; 8]))).unwrap();
        bus.publish(Packet::End).unwrap();

        let seen = seen.borrow();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[1], Packet::Logic(Logic::new(2, vec![1; 2])));
        assert_eq!(seen[2], Packet::End);
    }

    #[test]
    fn test_mq_flags() {
        let mut flags = MqFlags::DC | MqFlags::AUTORANGE;
        assert!(flags.contains(MqFlags::DC));
        flags.set(MqFlags::AUTORANGE, false);
        assert!(!flags.contains(MqFlags::AUTORANGE));
        flags.remove(MqFlags::DC);
        flags.insert(MqFlags::RMS);
        assert_eq!(flags, MqFlags::RMS);
        assert_eq!(flags.bits(), 0b100);
        assert_eq!(MqFlags::default(), MqFlags::empty());
    }

    #[test]
    fn test_packet_display() {
        let logic = Packet::Logic(Logic::new(1, vec![0; 3]));
        assert_eq!(logic.to_string(), "LOGIC packet (3 bytes, unitsize = 1)");
        assert_eq!(Packet::Trigger.to_string(), "TRIGGER packet");
    }
}
