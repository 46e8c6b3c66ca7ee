//! # LabFeed RS
//!
//! A Rust library for talking to lab instruments and moving their samples
//! around: a config-tree protocol engine for the Mooshimeter multimeter, a
//! datafeed bus with transforms, software triggers with pre-trigger history
//! and zip based session files.
//!
//! ## Features
//!
//! - **Config-tree protocol**: serial frame reassembly, the tree wire format,
//!   node reads/writes and the startup handshake
//! - **Mooshimeter driver**: channel modes, ranges and autoranging, sample
//!   rates, buffer decoding and heartbeats
//! - **Datafeed bus**: typed packets pushed through a transform chain to
//!   callbacks
//! - **Soft triggers**: multi-stage logic triggers with pre-trigger samples
//! - **Session files**: write, check and replay zip session archives
//! - **DataFrame output**: captured logic samples as `polars` frames
//!
//! ## Examples
//!
//! ### Streaming a Mooshimeter
//!
//! ```rust,no_run
//! use labfeed_rs::{Mooshimeter, MooshimeterConfig, Packet, SerialBridge, SerialBridgeConfig};
//!
//! let bridge = SerialBridge::open(SerialBridgeConfig::new("/dev/ttyACM0"))?;
//! let mut meter = Mooshimeter::new(bridge, MooshimeterConfig::default());
//! meter.open()?;
//! meter.set_samplerate(1000)?;
//! meter.apply_channel_config("A:1,V:60:RMS")?;
//!
//! meter.bus_mut().add_callback(|packet: &Packet| {
//!     println!("{packet}");
//! });
//! meter.start_acquisition()?;
//! while meter.service()? {}
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Soft Trigger
//!
//! ```rust
//! use labfeed_rs::{Channel, DatafeedBus, SoftTrigger, Trigger};
//!
//! let channels = [Channel::logic(0, "D0"), Channel::logic(1, "CLK")];
//! let trigger = Trigger::builder()
//!     .one(&channels[0])
//!     .rising(&channels[1])
//!     .build()?;
//! let mut soft = SoftTrigger::new(trigger, &channels, 4)?;
//!
//! let mut bus = DatafeedBus::new();
//! let hit = soft.check(&[0x00, 0x01, 0x03], &mut bus)?;
//! assert_eq!(hit.map(|h| h.offset), Some(2));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Replaying a Session
//!
//! ```rust,no_run
//! use labfeed_rs::{DatafeedBus, LogicCapture, SessionFile};
//!
//! let mut session = SessionFile::open("capture.sr")?;
//! let channels = session.devices()[0].channels.clone();
//!
//! let mut bus = DatafeedBus::new();
//! let capture = LogicCapture::attach(&channels, &mut bus);
//! session.replay(&mut bus)?;
//!
//! let df = capture.borrow().to_dataframe()?;
//! println!("{df}");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod capture;
pub mod config_tree;
pub mod datafeed;
pub mod handshake;
pub mod keyfile;
pub mod mooshimeter;
pub mod node_protocol;
pub mod serial_reassembly;
pub mod session_file;
pub mod soft_trigger;
pub mod transport;
pub mod tree_deserializer;
pub mod trigger;
pub mod units;

// Re-export the main types for convenience
pub use config_tree::{ConfigTree, ConfigTreeNode, NodeIndex, NodeType, NodeValue, TreeError};

pub use node_protocol::{NodeLink, ProtocolError, ProtocolTimeouts};

pub use transport::{MemoryTransport, SerialBridge, SerialBridgeConfig, Transport, TransportError};

pub use mooshimeter::{
    AcquisitionLimits, Analysis, ChannelMode, MeterChannel, Mooshimeter, MooshimeterConfig,
    MooshimeterError,
};

pub use datafeed::{
    Analog, AnalogMeaning, Channel, ChannelType, DatafeedBus, DatafeedError, Logic, MetaItem,
    MqFlags, Packet, Quantity, SampleLimit, Transform, Unit,
};

pub use trigger::{MatchKind, Trigger, TriggerBuilder, TriggerError};

pub use soft_trigger::{SoftTrigger, SoftTriggerError, TriggerHit};

pub use session_file::{SessionFile, SessionFileError, SessionWriter, SessionWriterConfig};

pub use capture::LogicCapture;
