//! Decoding of the (already inflated) config tree serialization.
//!
//! Each node is encoded depth first as:
//!
//! | Type         | Description              |
//! |--------------|--------------------------|
//! | `u8`         | node type code           |
//! | `u8`         | name length              |
//! | `[u8; len]`  | name                     |
//! | `u8`         | number of children       |
//! | `Node[n]`    | children, in order       |
//!
//! Ids are handed out during a pre-order walk from a counter starting at 0.
//! Plain and Link nodes are walked but never consume an id.

use crate::config_tree::{ConfigTree, NodeIndex, NodeType, TreeError};

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Result<u8, TreeError> {
        let byte = *self.data.get(self.offset).ok_or(TreeError::Truncated {
            offset: self.offset,
            needed: 1,
        })?;
        self.offset += 1;
        Ok(byte)
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], TreeError> {
        let remaining = self.data.len() - self.offset;
        if len > remaining {
            return Err(TreeError::Truncated {
                offset: self.offset,
                needed: len - remaining,
            });
        }
        let slice = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn header(&mut self) -> Result<(NodeType, String), TreeError> {
        let kind = NodeType::try_from(self.u8()?)?;
        let len = usize::from(self.u8()?);
        let name = String::from_utf8_lossy(self.bytes(len)?).into_owned();
        Ok((kind, name))
    }
}

/// Parse a serialized tree, assigning node ids in walk order.
///
/// On failure nothing is returned, so a partially decoded tree can never be
/// installed.
pub fn deserialize_tree(data: &[u8]) -> Result<ConfigTree, TreeError> {
    let mut reader = Reader { data, offset: 0 };
    let mut next_id = 0usize;

    let (kind, name) = reader.header()?;
    let mut tree = ConfigTree::with_root(&name, kind);
    let root = tree.root();
    tree.assign_next_id(root, &mut next_id)?;

    // Explicit stack of (node, children still to decode) keeps deep trees
    // off the call stack while preserving pre-order.
    let mut pending: Vec<(NodeIndex, u8)> = vec![(root, reader.u8()?)];
    while let Some(top) = pending.last_mut() {
        if top.1 == 0 {
            pending.pop();
            continue;
        }
        top.1 -= 1;
        let parent = top.0;

        let (kind, name) = reader.header()?;
        let child = tree.add_child(parent, &name, kind);
        tree.assign_next_id(child, &mut next_id)?;
        pending.push((child, reader.u8()?));
    }

    if reader.offset != data.len() {
        log::debug!(
            "Ignoring {} trailing byte(s) after config tree",
            data.len() - reader.offset
        );
    }
    log::debug!(
        "Deserialized config tree with {} nodes, {} ids",
        tree.len(),
        next_id
    );

    Ok(tree)
}

/// Serialize a tree back into the wire layout understood by
/// [`deserialize_tree`].
pub fn serialize_tree(tree: &ConfigTree) -> Result<Vec<u8>, TreeError> {
    let mut out = Vec::new();
    let mut pending = vec![tree.root()];
    while let Some(index) = pending.pop() {
        let node = tree.node(index);
        let name = node.name().as_bytes();
        let name_len = u8::try_from(name.len()).map_err(|_| TreeError::Truncated {
            offset: out.len(),
            needed: name.len(),
        })?;
        let child_count = u8::try_from(node.children().len()).map_err(|_| TreeError::Truncated {
            offset: out.len(),
            needed: node.children().len(),
        })?;

        out.push(node.node_type().code());
        out.push(name_len);
        out.extend_from_slice(name);
        out.push(child_count);
        // Pre-order: first child on top.
        pending.extend(node.children().iter().rev().copied());
    }
    Ok(out)
}
