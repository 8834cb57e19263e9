//! MetadataTree - extended, free-form stream description
//!
//! An ordered tree of named nodes with optional text values, stored in a slab
//! arena. Nodes are addressed by `NodeId` handles that stay valid until the
//! node is removed.

use serde::{Deserialize, Serialize};
use slab::Slab;

use crate::{Result, StreamError};

/// Handle to a node inside one `MetadataTree`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone)]
struct Node {
    name: String,
    value: Option<String>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl Node {
    fn new(name: String, value: Option<String>, parent: Option<NodeId>) -> Self {
        Self {
            name,
            value,
            parent,
            children: Vec::new(),
        }
    }
}

/// One `channels/channel` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub label: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default, rename = "type")]
    pub kind: String,
}

impl ChannelSpec {
    pub fn new(label: impl Into<String>, unit: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            unit: unit.into(),
            kind: kind.into(),
        }
    }
}

/// Ordered metadata tree rooted at a `desc` node
#[derive(Debug, Clone)]
pub struct MetadataTree {
    nodes: Slab<Node>,
    root: NodeId,
}

impl Default for MetadataTree {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataTree {
    pub const ROOT_NAME: &'static str = "desc";

    pub fn new() -> Self {
        let mut nodes = Slab::new();
        let root = NodeId(nodes.insert(Node::new(Self::ROOT_NAME.to_string(), None, None)));
        Self { nodes, root }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Number of nodes below the root
    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id.0)
            .ok_or_else(|| StreamError::argument(format!("unknown metadata node {}", id.0)))
    }

    // ========== Navigation ==========

    pub fn name(&self, id: NodeId) -> Option<&str> {
        self.node(id).map(|n| n.name.as_str())
    }

    pub fn value(&self, id: NodeId) -> Option<&str> {
        self.node(id).and_then(|n| n.value.as_deref())
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).and_then(|n| n.parent)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.node(id).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    pub fn first_child(&self, id: NodeId) -> Option<NodeId> {
        self.children(id).first().copied()
    }

    pub fn last_child(&self, id: NodeId) -> Option<NodeId> {
        self.children(id).last().copied()
    }

    /// First child with the given name
    pub fn child(&self, id: NodeId, name: &str) -> Option<NodeId> {
        self.children(id)
            .iter()
            .copied()
            .find(|c| self.name(*c) == Some(name))
    }

    /// Text value of the first child named `name`
    pub fn child_value(&self, id: NodeId, name: &str) -> Option<&str> {
        self.child(id, name).and_then(|c| self.value(c))
    }

    fn sibling_index(&self, id: NodeId) -> Option<(NodeId, usize)> {
        let parent = self.parent(id)?;
        let index = self.children(parent).iter().position(|c| *c == id)?;
        Some((parent, index))
    }

    pub fn next_sibling(&self, id: NodeId) -> Option<NodeId> {
        let (parent, index) = self.sibling_index(id)?;
        self.children(parent).get(index + 1).copied()
    }

    /// Next sibling with the given name
    pub fn next_sibling_named(&self, id: NodeId, name: &str) -> Option<NodeId> {
        let (parent, index) = self.sibling_index(id)?;
        self.children(parent)[index + 1..]
            .iter()
            .copied()
            .find(|c| self.name(*c) == Some(name))
    }

    pub fn previous_sibling(&self, id: NodeId) -> Option<NodeId> {
        let (parent, index) = self.sibling_index(id)?;
        index.checked_sub(1).map(|i| self.children(parent)[i])
    }

    // ========== Mutation ==========

    pub fn set_name(&mut self, id: NodeId, name: impl Into<String>) -> Result<()> {
        self.node_mut(id)?.name = name.into();
        Ok(())
    }

    pub fn set_value(&mut self, id: NodeId, value: impl Into<String>) -> Result<()> {
        self.node_mut(id)?.value = Some(value.into());
        Ok(())
    }

    fn insert_child(
        &mut self,
        parent: NodeId,
        name: String,
        value: Option<String>,
        at_front: bool,
    ) -> Result<NodeId> {
        self.node_mut(parent)?;
        let child = NodeId(self.nodes.insert(Node::new(name, value, Some(parent))));
        let children = &mut self.node_mut(parent)?.children;
        if at_front {
            children.insert(0, child);
        } else {
            children.push(child);
        }
        Ok(child)
    }

    pub fn append_child(&mut self, parent: NodeId, name: impl Into<String>) -> Result<NodeId> {
        self.insert_child(parent, name.into(), None, false)
    }

    pub fn prepend_child(&mut self, parent: NodeId, name: impl Into<String>) -> Result<NodeId> {
        self.insert_child(parent, name.into(), None, true)
    }

    /// Append a leaf carrying a text value
    pub fn append_child_value(
        &mut self,
        parent: NodeId,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<NodeId> {
        self.insert_child(parent, name.into(), Some(value.into()), false)
    }

    /// Append a deep copy of `source_node` (from `source`) under `parent`.
    ///
    /// `source` may be `self`'s own clone; the subtree is snapshotted first.
    pub fn append_copy(
        &mut self,
        parent: NodeId,
        source: &MetadataTree,
        source_node: NodeId,
    ) -> Result<NodeId> {
        let repr = source
            .to_repr(source_node)
            .ok_or_else(|| StreamError::argument("source node does not exist"))?;
        self.insert_repr(parent, &repr)
    }

    fn insert_repr(&mut self, parent: NodeId, repr: &NodeRepr) -> Result<NodeId> {
        let id = self.insert_child(parent, repr.name.clone(), repr.value.clone(), false)?;
        for child in &repr.children {
            self.insert_repr(id, child)?;
        }
        Ok(id)
    }

    /// Remove `child` (and its subtree) from `parent`.
    ///
    /// Returns `false` if `child` is not a direct child of `parent`.
    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> bool {
        let Some(node) = self.nodes.get_mut(parent.0) else {
            return false;
        };
        let Some(index) = node.children.iter().position(|c| *c == child) else {
            return false;
        };
        node.children.remove(index);
        self.free_subtree(child);
        true
    }

    fn free_subtree(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.try_remove(id.0) {
            for child in node.children {
                self.free_subtree(child);
            }
        }
    }

    /// Build `channels/channel/{label,unit,type}` under the root
    pub fn append_channels(&mut self, channels: &[ChannelSpec]) -> Result<NodeId> {
        let root = self.root;
        let list = self.append_child(root, "channels")?;
        for spec in channels {
            let channel = self.append_child(list, "channel")?;
            self.append_child_value(channel, "label", spec.label.as_str())?;
            self.append_child_value(channel, "unit", spec.unit.as_str())?;
            self.append_child_value(channel, "type", spec.kind.as_str())?;
        }
        Ok(list)
    }

    /// Read back `channels/channel` entries
    pub fn channels(&self) -> Vec<ChannelSpec> {
        let Some(list) = self.child(self.root, "channels") else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut cursor = self.child(list, "channel");
        while let Some(channel) = cursor {
            out.push(ChannelSpec::new(
                self.child_value(channel, "label").unwrap_or_default(),
                self.child_value(channel, "unit").unwrap_or_default(),
                self.child_value(channel, "type").unwrap_or_default(),
            ));
            cursor = self.next_sibling_named(channel, "channel");
        }
        out
    }

    // ========== Export ==========

    /// Indented XML rendering of the whole tree
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(self.root, 0, &mut out);
        out
    }

    pub(crate) fn write_xml(&self, id: NodeId, depth: usize, out: &mut String) {
        let Some(node) = self.node(id) else {
            return;
        };
        let indent = "  ".repeat(depth);
        let value = node.value.as_deref().map(escape_xml).unwrap_or_default();
        if node.children.is_empty() {
            if value.is_empty() {
                out.push_str(&format!("{indent}<{} />\n", node.name));
            } else {
                out.push_str(&format!("{indent}<{0}>{value}</{0}>\n", node.name));
            }
            return;
        }
        out.push_str(&format!("{indent}<{}>{value}\n", node.name));
        for child in &node.children {
            self.write_xml(*child, depth + 1, out);
        }
        out.push_str(&format!("{indent}</{}>\n", node.name));
    }

    fn to_repr(&self, id: NodeId) -> Option<NodeRepr> {
        let node = self.node(id)?;
        Some(NodeRepr {
            name: node.name.clone(),
            value: node.value.clone(),
            children: node
                .children
                .iter()
                .filter_map(|c| self.to_repr(*c))
                .collect(),
        })
    }
}

pub(crate) fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Nested serde representation; every field is always written so the
/// non-self-describing wire codec can read it back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct NodeRepr {
    name: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    children: Vec<NodeRepr>,
}

impl PartialEq for MetadataTree {
    fn eq(&self, other: &Self) -> bool {
        self.to_repr(self.root) == other.to_repr(other.root)
    }
}

impl Serialize for MetadataTree {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_repr(self.root)
            .unwrap_or_else(|| NodeRepr {
                name: Self::ROOT_NAME.to_string(),
                value: None,
                children: Vec::new(),
            })
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MetadataTree {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let repr = NodeRepr::deserialize(deserializer)?;
        let mut tree = MetadataTree::new();
        let root = tree.root;
        tree.set_name(root, repr.name).map_err(serde::de::Error::custom)?;
        if let Some(value) = repr.value {
            tree.set_value(root, value).map_err(serde::de::Error::custom)?;
        }
        for child in &repr.children {
            tree.insert_repr(root, child).map_err(serde::de::Error::custom)?;
        }
        Ok(tree)
    }
}
