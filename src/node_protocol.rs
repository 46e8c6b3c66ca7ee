//! Typed node reads, writes and update decoding.
//!
//! After the link layer strips the sequence byte, every message is a header
//! byte `(write << 7) | id` followed by the node's payload:
//!
//! | Node type            | Payload                                  |
//! |----------------------|------------------------------------------|
//! | Chooser, U8, S8      | 1 byte                                   |
//! | U16, S16             | 2 bytes little endian                    |
//! | U32, S32, Float      | 4 bytes little endian                    |
//! | String, Binary       | `u16` little endian length + bytes       |
//! | Plain, Link          | none, updates for them are errors        |
//!
//! The write bit is only ever set by the host.

use std::time::{Duration, Instant};

use crate::config_tree::{ConfigTree, ConfigTreeNode, NodeId, NodeIndex, NodeType, NodeValue, TreeError};
use crate::serial_reassembly::{SerialReassembly, TxSequence};
use crate::transport::{Transport, TransportError};

/// Header bit marking a host write.
pub const WRITE_FLAG: u8 = 0x80;
/// Header bits holding the node id.
pub const ID_MASK: u8 = 0x7F;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Config tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Deadlines for the bounded wait helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolTimeouts {
    /// Waiting for the echo of an ordinary write.
    pub node_update: Duration,
    /// The whole startup handshake.
    pub handshake: Duration,
    /// Longest single transport wait before deadlines are re-checked.
    pub poll_interval: Duration,
}

impl Default for ProtocolTimeouts {
    fn default() -> Self {
        Self {
            node_update: Duration::from_secs(5),
            handshake: Duration::from_secs(30),
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl ProtocolTimeouts {
    pub fn node_update(mut self, timeout: Duration) -> Self {
        self.node_update = timeout;
        self
    }

    pub fn handshake(mut self, timeout: Duration) -> Self {
        self.handshake = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

fn fixed_width(kind: NodeType) -> Option<usize> {
    match kind {
        NodeType::Chooser | NodeType::U8 | NodeType::S8 => Some(1),
        NodeType::U16 | NodeType::S16 => Some(2),
        NodeType::U32 | NodeType::S32 | NodeType::Float => Some(4),
        NodeType::Plain | NodeType::Link | NodeType::String | NodeType::Binary => None,
    }
}

/// Decode one payload of type `kind` from the front of `payload`.
///
/// Returns the value and the number of payload bytes it used, or `None` if
/// more bytes are needed (or the type carries no data).
pub fn decode_payload(kind: NodeType, payload: &[u8]) -> Option<(NodeValue, usize)> {
    if let Some(width) = fixed_width(kind) {
        let bytes = payload.get(..width)?;
        let value = match kind {
            NodeType::Chooser => NodeValue::Chooser(bytes[0]),
            NodeType::U8 => NodeValue::U8(bytes[0]),
            NodeType::S8 => NodeValue::S8(i8::from_le_bytes([bytes[0]])),
            NodeType::U16 => NodeValue::U16(u16::from_le_bytes([bytes[0], bytes[1]])),
            NodeType::S16 => NodeValue::S16(i16::from_le_bytes([bytes[0], bytes[1]])),
            NodeType::U32 => NodeValue::U32(u32::from_le_bytes(bytes.try_into().ok()?)),
            NodeType::S32 => NodeValue::S32(i32::from_le_bytes(bytes.try_into().ok()?)),
            NodeType::Float => NodeValue::Float(f32::from_le_bytes(bytes.try_into().ok()?)),
            _ => return None,
        };
        return Some((value, width));
    }

    match kind {
        NodeType::String | NodeType::Binary => {
            let length = payload.get(..2)?;
            let length = usize::from(u16::from_le_bytes([length[0], length[1]]));
            let data = payload.get(2..2 + length)?.to_vec();
            let value = if kind == NodeType::String {
                NodeValue::String(data)
            } else {
                NodeValue::Binary(data)
            };
            Some((value, 2 + length))
        }
        _ => None,
    }
}

/// Append the wire payload of `value` to `out`.
pub fn encode_payload(value: &NodeValue, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
    match value {
        NodeValue::None => {
            return Err(ProtocolError::InvalidArgument(
                "dataless nodes have no payload".to_string(),
            ))
        }
        NodeValue::Chooser(v) | NodeValue::U8(v) => out.push(*v),
        NodeValue::S8(v) => out.extend_from_slice(&v.to_le_bytes()),
        NodeValue::U16(v) => out.extend_from_slice(&v.to_le_bytes()),
        NodeValue::S16(v) => out.extend_from_slice(&v.to_le_bytes()),
        NodeValue::U32(v) => out.extend_from_slice(&v.to_le_bytes()),
        NodeValue::S32(v) => out.extend_from_slice(&v.to_le_bytes()),
        NodeValue::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
        NodeValue::String(bytes) | NodeValue::Binary(bytes) => {
            let length = u16::try_from(bytes.len()).map_err(|_| {
                ProtocolError::InvalidArgument(format!("{} byte payload is too long", bytes.len()))
            })?;
            out.extend_from_slice(&length.to_le_bytes());
            out.extend_from_slice(bytes);
        }
    }
    Ok(())
}

/// Integer view of a node: integer types as-is, floats truncated toward
/// zero. Dataless and byte nodes cannot be read this way.
pub fn read_integer(node: &ConfigTreeNode) -> Result<i32, ProtocolError> {
    let value = node.value().as_i64().ok_or_else(|| {
        ProtocolError::InvalidArgument(format!(
            "integer read attempted for {} node '{}'",
            node.node_type(),
            node.name()
        ))
    })?;
    // U32 values above i32::MAX wrap, as the meter's own integer view does.
    Ok(value as i32)
}

/// `[seq, id]`: ask the device to report a node's value.
pub fn encode_poll(seq: u8, id: NodeId) -> Vec<u8> {
    vec![seq, id & ID_MASK]
}

/// `[seq, 0x80 | id, payload...]`: write a value to a node.
pub fn encode_write(seq: u8, id: NodeId, value: &NodeValue) -> Result<Vec<u8>, ProtocolError> {
    let mut frame = vec![seq, WRITE_FLAG | (id & ID_MASK)];
    encode_payload(value, &mut frame)?;
    Ok(frame)
}

/// Result of decoding one update against a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The node was updated using this many bytes, header included.
    Applied { consumed: usize },
    /// The buffer does not hold the complete update yet.
    Incomplete,
    /// The id belongs to a node without data; two bytes should be dropped.
    Dataless,
}

/// Decode the update at the front of `buffer` (header byte included) into
/// `node`, bumping its update counter and notifying its observer.
pub fn apply_update(node: &mut ConfigTreeNode, buffer: &[u8]) -> Result<UpdateOutcome, ProtocolError> {
    if !node.node_type().has_id() {
        return Ok(UpdateOutcome::Dataless);
    }
    let Some(payload) = buffer.get(1..) else {
        return Ok(UpdateOutcome::Incomplete);
    };
    let Some((value, used)) = decode_payload(node.node_type(), payload) else {
        return Ok(UpdateOutcome::Incomplete);
    };
    node.record_update(value)?;
    Ok(UpdateOutcome::Applied { consumed: 1 + used })
}

/// What one step of the receive loop did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeStep {
    Updated(NodeIndex),
    /// Unknown id, one byte dropped to resynchronize.
    Skipped(u8),
    /// Update addressed to a dataless node, two bytes dropped.
    Dropped(NodeIndex),
    /// Fewer than two bytes, or an incomplete update, is buffered.
    NeedMore,
}

/// Decode at most one update from the reassembled stream.
pub fn consume_one(rx: &mut SerialReassembly, tree: &mut ConfigTree) -> Result<ConsumeStep, ProtocolError> {
    #[cfg(feature = "cpu-profiling")]
    let _span = tracy_client::span!("consume_one");

    if rx.contents().len() < 2 {
        return Ok(ConsumeStep::NeedMore);
    }

    let id = rx.contents()[0] & ID_MASK;
    let Some(index) = tree.by_id(id) else {
        log::error!("Command {id} does not map to a known node");
        rx.consume(1);
        return Ok(ConsumeStep::Skipped(id));
    };

    match apply_update(tree.node_mut(index), rx.contents())? {
        UpdateOutcome::Applied { consumed } => {
            rx.consume(consumed);
            Ok(ConsumeStep::Updated(index))
        }
        UpdateOutcome::Incomplete => Ok(ConsumeStep::NeedMore),
        UpdateOutcome::Dataless => {
            log::error!("Update for dataless node '{}'", tree.node(index).name());
            rx.consume(2);
            Ok(ConsumeStep::Dropped(index))
        }
    }
}

/// Decode every complete update in the stream, returning how many nodes
/// were updated.
pub fn consume_all(rx: &mut SerialReassembly, tree: &mut ConfigTree) -> Result<usize, ProtocolError> {
    let mut updated = 0;
    loop {
        match consume_one(rx, tree)? {
            ConsumeStep::Updated(_) => updated += 1,
            ConsumeStep::Skipped(_) | ConsumeStep::Dropped(_) => {}
            ConsumeStep::NeedMore => return Ok(updated),
        }
    }
}

/// One connection's protocol state: transport, link sequence numbers and
/// the config tree the ids refer to.
#[derive(Debug)]
pub struct NodeLink<T: Transport> {
    transport: T,
    rx: SerialReassembly,
    tx: TxSequence,
    tree: ConfigTree,
    timeouts: ProtocolTimeouts,
}

impl<T: Transport> NodeLink<T> {
    /// A link holding only the bootstrap tree.
    pub fn new(transport: T, timeouts: ProtocolTimeouts) -> Self {
        Self {
            transport,
            rx: SerialReassembly::new(),
            tx: TxSequence::new(),
            tree: ConfigTree::startup(),
            timeouts,
        }
    }

    /// Back to the bootstrap tree with fresh sequence state.
    pub fn reset(&mut self) {
        self.rx.reset();
        self.tx.reset();
        self.tree = ConfigTree::startup();
    }

    pub fn tree(&self) -> &ConfigTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut ConfigTree {
        &mut self.tree
    }

    /// Swap in a freshly deserialized tree, dropping the old one (and its
    /// observers).
    pub fn replace_tree(&mut self, tree: ConfigTree) -> ConfigTree {
        std::mem::replace(&mut self.tree, tree)
    }

    pub fn timeouts(&self) -> ProtocolTimeouts {
        self.timeouts
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    pub fn lookup(&self, path: &str) -> Result<NodeIndex, ProtocolError> {
        self.tree
            .lookup_path(path)
            .ok_or_else(|| ProtocolError::Data(format!("Tree path {path} not found")))
    }

    fn id_of(&self, index: NodeIndex) -> Result<NodeId, ProtocolError> {
        let node = self.tree.node(index);
        node.id().ok_or_else(|| {
            ProtocolError::InvalidArgument(format!("node '{}' has no id", node.name()))
        })
    }

    /// Ask the device to report the value of `index`.
    pub fn poll_node(&mut self, index: NodeIndex) -> Result<(), ProtocolError> {
        let id = self.id_of(index)?;
        let frame = encode_poll(self.tx.advance(), id);
        self.transport.write_frame(&frame)?;
        Ok(())
    }

    /// Write `value` to `index` without waiting. The local copy is updated
    /// immediately but the update counter is left alone.
    pub fn write_node(&mut self, index: NodeIndex, value: NodeValue) -> Result<(), ProtocolError> {
        let id = self.id_of(index)?;
        let node = self.tree.node(index);
        if !value.fits(node.node_type()) {
            return Err(ProtocolError::InvalidArgument(format!(
                "cannot write {} value to node '{}' of type {}",
                value.node_type(),
                node.name(),
                node.node_type()
            )));
        }
        let frame = encode_write(self.tx.peek(), id, &value)?;
        self.tree.node_mut(index).assign(value)?;
        self.tx.advance();
        self.transport.write_frame(&frame)?;
        Ok(())
    }

    /// Write an integer, converting it to the node's integer type.
    pub fn write_integer(&mut self, index: NodeIndex, value: i64) -> Result<(), ProtocolError> {
        let node = self.tree.node(index);
        let encoded = NodeValue::integer(node.node_type(), value).ok_or_else(|| {
            ProtocolError::InvalidArgument(format!(
                "{value} does not fit node '{}' of type {}",
                node.name(),
                node.node_type()
            ))
        })?;
        self.write_node(index, encoded)
    }

    /// Wait up to `timeout` for one notification and feed it to the
    /// reassembly layer, without decoding anything.
    pub fn receive(&mut self, timeout: Duration) -> Result<bool, ProtocolError> {
        match self.transport.read_notification(timeout)? {
            Some(frame) => {
                if !self.rx.ingest_frame(&frame) {
                    log::debug!("Ignoring empty notification");
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Decode at most one buffered update.
    pub fn next_update(&mut self) -> Result<ConsumeStep, ProtocolError> {
        consume_one(&mut self.rx, &mut self.tree)
    }

    /// Receive one notification and decode everything it completed.
    pub fn pump(&mut self, timeout: Duration) -> Result<bool, ProtocolError> {
        let received = self.receive(timeout)?;
        if received {
            consume_all(&mut self.rx, &mut self.tree)?;
        }
        Ok(received)
    }

    /// Handle every notification that is already available.
    pub fn drain(&mut self) -> Result<usize, ProtocolError> {
        let mut count = 0;
        while self.pump(Duration::ZERO)? {
            count += 1;
        }
        Ok(count)
    }

    /// Keep receiving until the update counter of `index` moves away from
    /// `original`, or `timeout` passes.
    pub fn wait_for_update(
        &mut self,
        index: NodeIndex,
        original: u32,
        timeout: Duration,
    ) -> Result<(), ProtocolError> {
        let start = Instant::now();
        loop {
            if self.tree.node(index).update_number() != original {
                return Ok(());
            }
            let remaining = timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Err(ProtocolError::Timeout {
                    what: format!("update of '{}'", self.tree.node(index).name()),
                    after: timeout,
                });
            }
            self.pump(remaining.min(self.timeouts.poll_interval))?;
        }
    }

    /// Write `value` and wait for the device to echo it back.
    pub fn set_and_wait(&mut self, index: NodeIndex, value: NodeValue) -> Result<(), ProtocolError> {
        let original = self.tree.node(index).update_number();
        self.write_node(index, value)?;
        self.wait_for_update(index, original, self.timeouts.node_update)
    }
}
