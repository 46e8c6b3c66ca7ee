//! Self-describing configuration tree exposed by the meter.
//!
//! The tree is stored as an arena: nodes live in one vector and refer to
//! their children by [`NodeIndex`]. Value carrying nodes additionally get a
//! 7-bit [`NodeId`] that the wire protocol uses to address them; the id to
//! node mapping is owned by the tree and rebuilt together with it.

use std::collections::HashMap;
use std::fmt;

/// Wire identifier of a value carrying node.
pub type NodeId = u8;

/// Number of usable node ids (0 through 126).
pub const NODE_ID_LIMIT: usize = 0x7F;

/// Fixed ids of the bootstrap nodes available before the handshake.
pub const CRC32_NODE_ID: NodeId = 0;
pub const TREE_NODE_ID: NodeId = 1;
pub const DIAGNOSTIC_NODE_ID: NodeId = 2;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("Tree data truncated: {needed} more byte(s) needed at offset {offset}")]
    Truncated { offset: usize, needed: usize },

    #[error("Unknown node type code {0}")]
    UnknownType(u8),

    #[error("Node id space exhausted at node '{name}'")]
    IdSpaceExhausted { name: String },

    #[error("Value of type {actual} does not fit node '{name}' of type {expected}")]
    TypeMismatch {
        name: String,
        expected: NodeType,
        actual: NodeType,
    },
}

/// Node datatype, with the wire type codes as discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NodeType {
    Plain = 0,
    Link = 1,
    Chooser = 2,
    U8 = 3,
    U16 = 4,
    U32 = 5,
    S8 = 6,
    S16 = 7,
    S32 = 8,
    String = 9,
    Binary = 10,
    Float = 11,
}

impl NodeType {
    pub const ALL: [Self; 12] = [
        Self::Plain,
        Self::Link,
        Self::Chooser,
        Self::U8,
        Self::U16,
        Self::U32,
        Self::S8,
        Self::S16,
        Self::S32,
        Self::String,
        Self::Binary,
        Self::Float,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(usize::from(code)).copied()
    }

    /// Plain and Link nodes are informational and never get an id.
    pub fn has_id(self) -> bool {
        !matches!(self, Self::Plain | Self::Link)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Link => "LINK",
            Self::Chooser => "CHOOSER",
            Self::U8 => "U8",
            Self::U16 => "U16",
            Self::U32 => "U32",
            Self::S8 => "S8",
            Self::S16 => "S16",
            Self::S32 => "S32",
            Self::String => "STR",
            Self::Binary => "BIN",
            Self::Float => "FLT",
        }
    }
}

impl TryFrom<u8> for NodeType {
    type Error = TreeError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Self::from_code(code).ok_or(TreeError::UnknownType(code))
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value held by a node. The variant always agrees with the node's type.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeValue {
    /// Plain and Link nodes carry no data.
    None,
    Chooser(u8),
    U8(u8),
    U16(u16),
    U32(u32),
    S8(i8),
    S16(i16),
    S32(i32),
    /// Raw bytes as sent by the meter, not necessarily UTF-8.
    String(Vec<u8>),
    Binary(Vec<u8>),
    Float(f32),
}

impl NodeValue {
    /// The zero value for a node of the given type.
    pub fn empty(kind: NodeType) -> Self {
        match kind {
            NodeType::Plain | NodeType::Link => Self::None,
            NodeType::Chooser => Self::Chooser(0),
            NodeType::U8 => Self::U8(0),
            NodeType::U16 => Self::U16(0),
            NodeType::U32 => Self::U32(0),
            NodeType::S8 => Self::S8(0),
            NodeType::S16 => Self::S16(0),
            NodeType::S32 => Self::S32(0),
            NodeType::String => Self::String(Vec::new()),
            NodeType::Binary => Self::Binary(Vec::new()),
            NodeType::Float => Self::Float(0.0),
        }
    }

    /// Whether this value may be stored in a node of type `kind`.
    pub fn fits(&self, kind: NodeType) -> bool {
        match self {
            Self::None => !kind.has_id(),
            other => other.node_type() == kind,
        }
    }

    /// Type of a data carrying value; `None` reports as Plain.
    pub fn node_type(&self) -> NodeType {
        match self {
            Self::None => NodeType::Plain,
            Self::Chooser(_) => NodeType::Chooser,
            Self::U8(_) => NodeType::U8,
            Self::U16(_) => NodeType::U16,
            Self::U32(_) => NodeType::U32,
            Self::S8(_) => NodeType::S8,
            Self::S16(_) => NodeType::S16,
            Self::S32(_) => NodeType::S32,
            Self::String(_) => NodeType::String,
            Self::Binary(_) => NodeType::Binary,
            Self::Float(_) => NodeType::Float,
        }
    }

    /// Integer view: integers as-is, floats truncated toward zero.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::Chooser(v) | Self::U8(v) => Some(i64::from(v)),
            Self::U16(v) => Some(i64::from(v)),
            Self::U32(v) => Some(i64::from(v)),
            Self::S8(v) => Some(i64::from(v)),
            Self::S16(v) => Some(i64::from(v)),
            Self::S32(v) => Some(i64::from(v)),
            Self::Float(v) => Some(v as i64),
            Self::None | Self::String(_) | Self::Binary(_) => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Self::Float(v) => Some(*v),
            other => other.as_i64().map(|v| v as f32),
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::String(bytes) | Self::Binary(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Build an integer value of type `kind`, rejecting out of range input.
    pub fn integer(kind: NodeType, value: i64) -> Option<Self> {
        Some(match kind {
            NodeType::Chooser => Self::Chooser(u8::try_from(value).ok()?),
            NodeType::U8 => Self::U8(u8::try_from(value).ok()?),
            NodeType::U16 => Self::U16(u16::try_from(value).ok()?),
            NodeType::U32 => Self::U32(u32::try_from(value).ok()?),
            NodeType::S8 => Self::S8(i8::try_from(value).ok()?),
            NodeType::S16 => Self::S16(i16::try_from(value).ok()?),
            NodeType::S32 => Self::S32(i32::try_from(value).ok()?),
            _ => return None,
        })
    }
}

/// Receives a notification every time a node's value is decoded.
pub trait NodeObserver {
    fn on_update(&mut self, node: &ConfigTreeNode);
}

impl<F: FnMut(&ConfigTreeNode)> NodeObserver for F {
    fn on_update(&mut self, node: &ConfigTreeNode) {
        self(node);
    }
}

/// Position of a node inside its [`ConfigTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeIndex(usize);

pub struct ConfigTreeNode {
    name: String,
    kind: NodeType,
    id: Option<NodeId>,
    index_in_parent: usize,
    value: NodeValue,
    children: Vec<NodeIndex>,
    update_number: u32,
    observer: Option<Box<dyn NodeObserver>>,
}

impl fmt::Debug for ConfigTreeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigTreeNode")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("index_in_parent", &self.index_in_parent)
            .field("value", &self.value)
            .field("children", &self.children.len())
            .field("update_number", &self.update_number)
            .field("observed", &self.observer.is_some())
            .finish()
    }
}

impl ConfigTreeNode {
    fn new(name: String, kind: NodeType, index_in_parent: usize) -> Self {
        Self {
            name,
            kind,
            id: None,
            index_in_parent,
            value: NodeValue::empty(kind),
            children: Vec::new(),
            update_number: 0,
            observer: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_type(&self) -> NodeType {
        self.kind
    }

    pub fn id(&self) -> Option<NodeId> {
        self.id
    }

    pub fn index_in_parent(&self) -> usize {
        self.index_in_parent
    }

    pub fn value(&self) -> &NodeValue {
        &self.value
    }

    pub fn children(&self) -> &[NodeIndex] {
        &self.children
    }

    /// Bumped on every successfully decoded update from the device.
    pub fn update_number(&self) -> u32 {
        self.update_number
    }

    pub fn has_observer(&self) -> bool {
        self.observer.is_some()
    }

    /// Store a locally written value without counting it as a device update.
    pub fn assign(&mut self, value: NodeValue) -> Result<(), TreeError> {
        self.check_fits(&value)?;
        self.value = value;
        Ok(())
    }

    /// Store a value decoded from the device, bump the update counter and
    /// notify the observer.
    pub fn record_update(&mut self, value: NodeValue) -> Result<(), TreeError> {
        self.check_fits(&value)?;
        self.value = value;
        self.update_number = self.update_number.wrapping_add(1);

        if let Some(mut observer) = self.observer.take() {
            observer.on_update(self);
            // The observer may not have been replaced while it ran.
            if self.observer.is_none() {
                self.observer = Some(observer);
            }
        }
        Ok(())
    }

    fn check_fits(&self, value: &NodeValue) -> Result<(), TreeError> {
        if value.fits(self.kind) {
            Ok(())
        } else {
            Err(TreeError::TypeMismatch {
                name: self.name.clone(),
                expected: self.kind,
                actual: value.node_type(),
            })
        }
    }
}

/// Owned configuration tree plus its id lookup table.
#[derive(Debug)]
pub struct ConfigTree {
    nodes: Vec<ConfigTreeNode>,
    by_id: HashMap<NodeId, NodeIndex>,
}

impl ConfigTree {
    /// A tree holding only `root`, with no ids assigned.
    pub fn with_root(name: &str, kind: NodeType) -> Self {
        Self {
            nodes: vec![ConfigTreeNode::new(name.to_string(), kind, 0)],
            by_id: HashMap::new(),
        }
    }

    /// The three node tree available on a fresh connection.
    pub fn startup() -> Self {
        let mut tree = Self::with_root("ADMIN", NodeType::Plain);
        let root = tree.root();
        for (name, kind, id) in [
            ("CRC32", NodeType::U32, CRC32_NODE_ID),
            ("TREE", NodeType::Binary, TREE_NODE_ID),
            ("DIAGNOSTIC", NodeType::String, DIAGNOSTIC_NODE_ID),
        ] {
            let index = tree.add_child(root, name, kind);
            tree.nodes[index.0].id = Some(id);
            tree.by_id.insert(id, index);
        }
        tree
    }

    pub fn root(&self) -> NodeIndex {
        NodeIndex(0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of nodes registered in the id lookup table.
    pub fn id_count(&self) -> usize {
        self.by_id.len()
    }

    pub fn node(&self, index: NodeIndex) -> &ConfigTreeNode {
        &self.nodes[index.0]
    }

    pub fn node_mut(&mut self, index: NodeIndex) -> &mut ConfigTreeNode {
        &mut self.nodes[index.0]
    }

    pub fn by_id(&self, id: NodeId) -> Option<NodeIndex> {
        self.by_id.get(&id).copied()
    }

    /// Append a child to `parent`; its `index_in_parent` is its position.
    pub fn add_child(&mut self, parent: NodeIndex, name: &str, kind: NodeType) -> NodeIndex {
        let position = self.nodes[parent.0].children.len();
        let index = NodeIndex(self.nodes.len());
        self.nodes
            .push(ConfigTreeNode::new(name.to_string(), kind, position));
        self.nodes[parent.0].children.push(index);
        index
    }

    /// Give `index` the next free id from `counter` if its type carries one.
    pub(crate) fn assign_next_id(
        &mut self,
        index: NodeIndex,
        counter: &mut usize,
    ) -> Result<(), TreeError> {
        let node = &mut self.nodes[index.0];
        if !node.kind.has_id() {
            return Ok(());
        }
        if *counter >= NODE_ID_LIMIT {
            return Err(TreeError::IdSpaceExhausted {
                name: node.name.clone(),
            });
        }
        let id = *counter as NodeId;
        *counter += 1;
        node.id = Some(id);
        self.by_id.insert(id, index);
        Ok(())
    }

    /// Resolve a colon separated path such as `CH1:MAPPING`, starting below
    /// the root. Names compare case-insensitively; with duplicate names the
    /// last one wins.
    pub fn lookup_path(&self, path: &str) -> Option<NodeIndex> {
        let mut current = self.root();
        for segment in path.split(':') {
            current = self.nodes[current.0]
                .children
                .iter()
                .rev()
                .copied()
                .find(|child| self.nodes[child.0].name.eq_ignore_ascii_case(segment))?;
        }
        Some(current)
    }

    pub fn lookup_path_node(&self, path: &str) -> Option<&ConfigTreeNode> {
        self.lookup_path(path).map(|index| self.node(index))
    }

    /// Position of the node at `path` among its siblings, used as the value
    /// written to a chooser.
    pub fn chooser_index(&self, path: &str) -> Option<usize> {
        self.lookup_path_node(path).map(ConfigTreeNode::index_in_parent)
    }

    pub fn set_observer(&mut self, index: NodeIndex, observer: Box<dyn NodeObserver>) {
        self.nodes[index.0].observer = Some(observer);
    }

    pub fn clear_observer(&mut self, index: NodeIndex) {
        self.nodes[index.0].observer = None;
    }

    /// Children of `index` in order.
    pub fn children_of(&self, index: NodeIndex) -> impl Iterator<Item = &ConfigTreeNode> + '_ {
        self.nodes[index.0]
            .children
            .iter()
            .map(move |child| &self.nodes[child.0])
    }

    fn write_tree(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut pending = vec![(self.root(), 0usize)];
        while let Some((index, depth)) = pending.pop() {
            let node = &self.nodes[index.0];
            for _ in 0..depth {
                f.write_str("\t")?;
            }
            write!(f, "{} ({})", node.name, node.kind)?;
            if let Some(id) = node.id {
                write!(f, " = {id}")?;
            }
            writeln!(f)?;
            pending.extend(node.children.iter().rev().map(|&child| (child, depth + 1)));
        }
        Ok(())
    }
}

impl fmt::Display for ConfigTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_tree(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn sample_tree() -> ConfigTree {
        let mut tree = ConfigTree::with_root("", NodeType::Plain);
        let root = tree.root();
        let ch1 = tree.add_child(root, "CH1", NodeType::Plain);
        let mapping = tree.add_child(ch1, "MAPPING", NodeType::Chooser);
        tree.add_child(mapping, "CURRENT", NodeType::Plain);
        tree.add_child(mapping, "TEMP", NodeType::Plain);
        tree.add_child(ch1, "VALUE", NodeType::Float);
        tree
    }

    #[test]
    fn test_type_codes() {
        for (code, kind) in NodeType::ALL.iter().enumerate() {
            assert_eq!(kind.code() as usize, code);
            assert_eq!(NodeType::try_from(code as u8), Ok(*kind));
        }
        assert_eq!(NodeType::try_from(12), Err(TreeError::UnknownType(12)));
        assert!(!NodeType::Plain.has_id());
        assert!(!NodeType::Link.has_id());
        assert!(NodeType::Chooser.has_id());
    }

    #[test]
    fn test_startup_tree() {
        let tree = ConfigTree::startup();
        assert_eq!(tree.id_count(), 3);
        let crc = tree.node(tree.by_id(CRC32_NODE_ID).unwrap());
        assert_eq!(crc.name(), "CRC32");
        assert_eq!(crc.node_type(), NodeType::U32);
        let blob = tree.node(tree.by_id(TREE_NODE_ID).unwrap());
        assert_eq!(blob.value(), &NodeValue::Binary(Vec::new()));
        let diag = tree.node(tree.by_id(DIAGNOSTIC_NODE_ID).unwrap());
        assert_eq!(diag.node_type(), NodeType::String);
    }

    #[test]
    fn test_lookup_path_is_case_insensitive() {
        let tree = sample_tree();
        let value = tree.lookup_path("ch1:value").unwrap();
        assert_eq!(tree.node(value).node_type(), NodeType::Float);
        assert!(tree.lookup_path("CH1:MISSING").is_none());
        assert!(tree.lookup_path("CH1:VALUE:DEEPER").is_none());
        assert_eq!(tree.chooser_index("CH1:MAPPING:TEMP"), Some(1));
    }

    #[test]
    fn test_record_update_bumps_counter_and_notifies() {
        let mut tree = sample_tree();
        let value = tree.lookup_path("CH1:VALUE").unwrap();
        let seen = Rc::new(Cell::new(0.0f32));
        let sink = Rc::clone(&seen);
        tree.set_observer(
            value,
            Box::new(move |node: &ConfigTreeNode| {
                sink.set(node.value().as_f32().unwrap_or_default());
            }),
        );

        let node = tree.node_mut(value);
        node.record_update(NodeValue::Float(2.5)).unwrap();
        assert_eq!(node.update_number(), 1);
        assert!(node.has_observer());
        assert_eq!(seen.get(), 2.5);
    }

    #[test]
    fn test_assign_rejects_wrong_type() {
        let mut tree = sample_tree();
        let value = tree.lookup_path("CH1:VALUE").unwrap();
        let err = tree.node_mut(value).assign(NodeValue::U8(3)).unwrap_err();
        assert!(matches!(err, TreeError::TypeMismatch { .. }));
        tree.node_mut(value).assign(NodeValue::Float(1.0)).unwrap();
        assert_eq!(tree.node(value).update_number(), 0);
    }

    #[test]
    fn test_integer_value_ranges() {
        assert_eq!(NodeValue::integer(NodeType::U8, 255), Some(NodeValue::U8(255)));
        assert_eq!(NodeValue::integer(NodeType::U8, 256), None);
        assert_eq!(NodeValue::integer(NodeType::S16, -2), Some(NodeValue::S16(-2)));
        assert_eq!(NodeValue::integer(NodeType::Float, 1), None);
        assert_eq!(NodeValue::Float(-3.7).as_i64(), Some(-3));
    }

    #[test]
    fn test_display_lists_ids() {
        let text = ConfigTree::startup().to_string();
        assert!(text.starts_with("ADMIN (PLAIN)\n"));
        assert!(text.contains("\tTREE (BIN) = 1\n"));
    }

    #[test]
    fn test_display_keeps_child_order() {
        let mut tree = ConfigTree::with_root("ROOT", NodeType::Plain);
        let root = tree.root();
        let ch1 = tree.add_child(root, "CH1", NodeType::Plain);
        tree.add_child(ch1, "RANGE", NodeType::U8);
        tree.add_child(root, "CH2", NodeType::Plain);
        assert_eq!(
            tree.to_string(),
            "ROOT (PLAIN)\n\tCH1 (PLAIN)\n\t\tRANGE (U8)\n\tCH2 (PLAIN)\n"
        );
    }
}
