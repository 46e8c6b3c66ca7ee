//! Startup handshake: download, verify and activate the meter's config tree.
//!
//! ```text
//! AwaitingTree -> Decompressing -> Deserializing -> SendingCrc
//!     -> AwaitingCrcEcho -> Complete
//! ```
//!
//! Any step may end in `Failed`. The compressed tree blob arrives as an
//! update of the bootstrap `ADMIN:TREE` node; its CRC32 is written back to
//! `ADMIN:CRC32` of the new tree and must be echoed unchanged.

use std::sync::mpsc;
use std::time::Instant;

use flate2::{Decompress, FlushDecompress, Status};

use crate::config_tree::{ConfigTree, ConfigTreeNode, TREE_NODE_ID};
use crate::node_protocol::{ConsumeStep, NodeLink, ProtocolError};
use crate::transport::Transport;
use crate::tree_deserializer::deserialize_tree;

/// Initial inflate buffer size, doubled on demand.
pub const INFLATE_START_SIZE: usize = 4096;
/// Largest inflated tree accepted by default.
pub const DEFAULT_INFLATE_LIMIT: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingTree,
    Decompressing,
    Deserializing,
    SendingCrc,
    AwaitingCrcEcho,
    Complete,
    Failed(String),
}

/// CRC32 of the still compressed tree blob.
pub fn tree_crc(blob: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(blob);
    hasher.finalize()
}

/// Inflate a zlib stream into a buffer that starts at 4 KiB and doubles
/// while the output does not fit, up to `limit` bytes.
pub fn inflate_tree(blob: &[u8], limit: usize) -> Result<Vec<u8>, ProtocolError> {
    let mut output = vec![0u8; INFLATE_START_SIZE.min(limit.max(1))];
    let mut inflater = Decompress::new(true);
    loop {
        inflater.reset(true);
        let status = inflater
            .decompress(blob, &mut output, FlushDecompress::Finish)
            .map_err(|e| ProtocolError::Data(format!("Tree decompression failed: {e}")))?;
        let produced = usize::try_from(inflater.total_out())
            .map_err(|_| ProtocolError::Data("Tree decompression overflow".to_string()))?;

        match status {
            Status::StreamEnd => {
                output.truncate(produced);
                return Ok(output);
            }
            Status::Ok | Status::BufError if produced == output.len() => {
                if output.len() >= limit {
                    return Err(ProtocolError::Data(format!(
                        "Inflated tree exceeds {limit} bytes"
                    )));
                }
                let grown = (output.len() * 2).min(limit);
                output.resize(grown, 0);
            }
            Status::Ok | Status::BufError => {
                return Err(ProtocolError::Data(
                    "Tree decompression failed: truncated stream".to_string(),
                ));
            }
        }
    }
}

/// Handshake progress, independent of any transport.
#[derive(Debug)]
pub struct Handshake {
    state: HandshakeState,
    crc: Option<u32>,
    inflate_limit: usize,
}

impl Handshake {
    pub fn new(inflate_limit: usize) -> Self {
        Self {
            state: HandshakeState::AwaitingTree,
            crc: None,
            inflate_limit,
        }
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, HandshakeState::Complete | HandshakeState::Failed(_))
    }

    /// CRC of the received blob, once the tree has arrived.
    pub fn expected_crc(&self) -> Option<u32> {
        self.crc
    }

    /// Process the compressed tree. On success the new tree is returned and
    /// the handshake waits in `SendingCrc` for the caller to write the CRC.
    pub fn on_tree_blob(&mut self, blob: &[u8]) -> Result<ConfigTree, ProtocolError> {
        if self.state != HandshakeState::AwaitingTree {
            return Err(ProtocolError::InvalidArgument(format!(
                "tree received in state {:?}",
                self.state
            )));
        }

        let crc = tree_crc(blob);
        self.crc = Some(crc);

        self.state = HandshakeState::Decompressing;
        let inflated = inflate_tree(blob, self.inflate_limit).map_err(|e| self.fail(e))?;

        self.state = HandshakeState::Deserializing;
        let tree = deserialize_tree(&inflated).map_err(|e| self.fail(e.into()))?;

        log::debug!(
            "Config tree received ({} -> {} bytes) with CRC {crc:08X}",
            blob.len(),
            inflated.len()
        );
        self.state = HandshakeState::SendingCrc;
        Ok(tree)
    }

    /// The CRC write went out; wait for the echo.
    pub fn crc_sent(&mut self) {
        if self.state == HandshakeState::SendingCrc {
            self.state = HandshakeState::AwaitingCrcEcho;
        }
    }

    pub fn on_crc_echo(&mut self, received: u32) -> Result<(), ProtocolError> {
        let expected = self.crc.unwrap_or_default();
        if received != expected {
            log::error!("Tree CRC mismatch, expected {expected:08X} but received {received:08X}");
            return Err(self.fail(ProtocolError::Data(format!(
                "tree CRC mismatch, expected {expected:08X} but received {received:08X}"
            ))));
        }
        log::debug!("Startup handshake completed");
        self.state = HandshakeState::Complete;
        Ok(())
    }

    /// Record a fatal error and hand it back for propagation.
    pub fn fail(&mut self, err: ProtocolError) -> ProtocolError {
        log::debug!("Startup handshake failed: {err}");
        self.state = HandshakeState::Failed(err.to_string());
        err
    }
}

enum StartupEvent {
    Tree(Vec<u8>),
    CrcEcho(u32),
}

/// Logs the meter's diagnostic string.
pub fn log_diagnostic(node: &ConfigTreeNode) {
    match node.value().as_bytes() {
        Some(bytes) if !bytes.is_empty() => {
            let text = String::from_utf8_lossy(bytes);
            log::warn!("Mooshimeter error: {}", text.trim_end_matches('\0'));
        }
        _ => log::warn!("Mooshimeter error with no information"),
    }
}

/// Run the handshake over `link`, starting from the bootstrap tree.
///
/// Returns once the CRC echo matched, with the received tree installed.
pub fn run_handshake<T: Transport>(
    link: &mut NodeLink<T>,
    inflate_limit: usize,
) -> Result<(), ProtocolError> {
    let _span = tracing::debug_span!("handshake").entered();
    let timeout = link.timeouts().handshake;
    let poll_interval = link.timeouts().poll_interval;

    link.reset();
    let (sender, events) = mpsc::channel();
    let tree_node = link
        .tree()
        .by_id(TREE_NODE_ID)
        .ok_or_else(|| ProtocolError::Data("bootstrap tree has no TREE node".to_string()))?;
    let tree_sender = sender.clone();
    link.tree_mut().set_observer(
        tree_node,
        Box::new(move |node: &ConfigTreeNode| {
            let blob = node.value().as_bytes().unwrap_or_default().to_vec();
            let _ = tree_sender.send(StartupEvent::Tree(blob));
        }),
    );
    if let Some(diagnostic) = link.tree().lookup_path("DIAGNOSTIC") {
        link.tree_mut().set_observer(diagnostic, Box::new(log_diagnostic));
    }

    log::trace!("Initiating startup handshake");
    link.poll_node(tree_node)?;

    let mut handshake = Handshake::new(inflate_limit);
    let start = Instant::now();
    loop {
        let remaining = timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            return Err(handshake.fail(ProtocolError::Timeout {
                what: "startup handshake".to_string(),
                after: timeout,
            }));
        }
        if !link.receive(remaining.min(poll_interval))? {
            continue;
        }

        // One update at a time: the tree may be replaced in between.
        loop {
            let step = link.next_update()?;
            while let Ok(event) = events.try_recv() {
                match event {
                    StartupEvent::Tree(blob) => {
                        send_tree_crc(link, &mut handshake, &blob, &sender)?;
                    }
                    StartupEvent::CrcEcho(value) => handshake.on_crc_echo(value)?,
                }
            }
            if handshake.is_finished() {
                return Ok(());
            }
            if step == ConsumeStep::NeedMore {
                break;
            }
        }
    }
}

fn send_tree_crc<T: Transport>(
    link: &mut NodeLink<T>,
    handshake: &mut Handshake,
    blob: &[u8],
    sender: &mpsc::Sender<StartupEvent>,
) -> Result<(), ProtocolError> {
    let tree = handshake.on_tree_blob(blob)?;
    link.replace_tree(tree);

    if let Some(diagnostic) = link.tree().lookup_path("ADMIN:DIAGNOSTIC") {
        link.tree_mut().set_observer(diagnostic, Box::new(log_diagnostic));
    }

    let Some(crc_node) = link.tree().lookup_path("ADMIN:CRC32") else {
        log::error!("ADMIN:CRC32 node not found in received startup tree");
        return Err(handshake.fail(ProtocolError::Data(
            "ADMIN:CRC32 node not found in received tree".to_string(),
        )));
    };

    // Only the first echo belongs to the handshake.
    let echo_sender = sender.clone();
    let mut fired = false;
    link.tree_mut().set_observer(
        crc_node,
        Box::new(move |node: &ConfigTreeNode| {
            if !fired {
                fired = true;
                let value = node.value().as_i64().unwrap_or_default() as u32;
                let _ = echo_sender.send(StartupEvent::CrcEcho(value));
            }
        }),
    );

    let crc = handshake.expected_crc().unwrap_or_default();
    link.write_integer(crc_node, i64::from(crc))
        .map_err(|e| handshake.fail(e))?;
    handshake.crc_sent();
    Ok(())
}
