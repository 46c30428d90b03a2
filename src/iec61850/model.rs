//! IEC 61850 object model built from the MMS variables of a device.
//!
//! Nodes live in one arena and refer to each other through [`NodeId`]s. The functional
//! constraint level of the MMS names (`LN$FC$DO$DA`) is folded into the attributes, so a
//! data object shows the attributes of every functional constraint.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::mms::{
    device::MmsDevice,
    type_spec::{MmsTypeSpec, TypeKind},
};

/// Functional constraints holding report control blocks. They are left out of the model.
const REPORT_CONTROL_FCS: [&str; 2] = ["BR", "RP"];

/// Index of a node in its [`IedModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(usize);

/// What a node stands for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum NodeClass {
    /// An MMS domain.
    LogicalDevice,
    /// A top level structured variable of a domain.
    LogicalNode,
    /// A component right below a functional constraint.
    DataObject,
    /// Anything below a data object.
    DataAttribute {
        /// The functional constraint of the MMS name.
        fc: String,
        /// Name of the MMS type.
        r#type: String,
    },
}

/// A node of the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelNode {
    /// Name of the node, unique among its siblings.
    pub name: String,
    /// What the node stands for.
    #[serde(flatten)]
    pub class: NodeClass,
    /// The parent. None for logical devices.
    pub parent: Option<NodeId>,
    /// The children in declaration order.
    pub children: Vec<NodeId>,
}

/// A data set of a logical device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    /// Name of the named variable list.
    pub name: String,
    /// The logical device holding the list.
    pub logical_device: String,
    /// The members as `domain/item` references.
    pub entries: Vec<String>,
}

/// The model of an IED.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IedModel {
    /// Name of the IED.
    pub name: String,
    /// Every node of the model.
    nodes: Vec<ModelNode>,
    /// The logical devices, sorted like the domains.
    logical_devices: Vec<NodeId>,
    /// The data sets of every logical device.
    datasets: Vec<Dataset>,
}

impl IedModel {
    /// Build the model of the domains of `device`.
    ///
    /// Top level variables that are not structures are not logical nodes and are skipped.
    #[must_use]
    #[instrument(skip(device), fields(device = %device.name))]
    pub fn from_device(device: &MmsDevice) -> Self {
        let mut model = Self { name: device.name.clone(), ..Self::default() };
        for domain in device.domains() {
            let ld = model.add_node(&domain.name, NodeClass::LogicalDevice, None);
            model.logical_devices.push(ld);
            for variable in domain.named_variables() {
                model.add_logical_node(ld, variable);
            }
            model.datasets.extend(domain.named_variable_lists.iter().map(|list| Dataset {
                name: list.name.clone(),
                logical_device: domain.name.clone(),
                entries: list
                    .entries
                    .iter()
                    .map(|entry| format!("{}/{}", entry.domain_id, entry.item_id))
                    .collect(),
            }));
        }
        debug!("Built model with {} nodes", model.nodes.len());
        model
    }

    /// Append a node to the arena and to the children of `parent`.
    fn add_node(&mut self, name: &str, class: NodeClass, parent: Option<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(ModelNode { name: name.to_owned(), class, parent, children: Vec::new() });
        if let Some(parent) = parent {
            self.nodes[parent.0].children.push(id);
        }
        id
    }

    /// Add a logical node and fold its functional constraints into the attributes.
    fn add_logical_node(&mut self, ld: NodeId, spec: &MmsTypeSpec) {
        let TypeKind::Structure(fcs) = &spec.kind else {
            debug!("Skipping {}: not a logical node", spec.name);
            return;
        };
        let ln = self.add_node(&spec.name, NodeClass::LogicalNode, Some(ld));
        for fc in fcs {
            if REPORT_CONTROL_FCS.contains(&fc.name.as_str()) {
                debug!("Skipping report control blocks {}${}", spec.name, fc.name);
                continue;
            }
            for data_object in fc.children() {
                let node = match self.get_child(ln, &data_object.name) {
                    Some(node) => node,
                    None => self.add_node(&data_object.name, NodeClass::DataObject, Some(ln)),
                };
                for attribute in data_object.children() {
                    self.add_attribute(node, &fc.name, attribute);
                }
            }
        }
    }

    /// Add an attribute and everything below it.
    fn add_attribute(&mut self, parent: NodeId, fc: &str, spec: &MmsTypeSpec) {
        let class = NodeClass::DataAttribute { fc: fc.to_owned(), r#type: type_name(&spec.kind) };
        let node = self.add_node(&spec.name, class, Some(parent));
        let children = match &spec.kind {
            TypeKind::Array { element, .. } => element.children(),
            _ => spec.children(),
        };
        for child in children {
            self.add_attribute(node, fc, child);
        }
    }

    /// The node behind `id`.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&ModelNode> {
        self.nodes.get(id.0)
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if the device has no domain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The logical devices.
    #[must_use]
    pub fn logical_devices(&self) -> &[NodeId] {
        &self.logical_devices
    }

    /// The logical device called `name`.
    #[must_use]
    pub fn get_logical_device(&self, name: &str) -> Option<NodeId> {
        self.logical_devices.iter().copied().find(|ld| self.nodes[ld.0].name == name)
    }

    /// The child of `node` called exactly `name`.
    #[must_use]
    pub fn get_child(&self, node: NodeId, name: &str) -> Option<NodeId> {
        self.node(node)?.children.iter().copied().find(|child| self.nodes[child.0].name == name)
    }

    /// Resolve an object reference like `LD/LN.DO.DA`.
    ///
    /// A reference without `/` names a logical device.
    #[must_use]
    pub fn get_node_by_reference(&self, reference: &str) -> Option<NodeId> {
        let Some((ld_name, path)) = reference.split_once('/') else {
            return self.get_logical_device(reference);
        };
        let mut node = self.get_logical_device(ld_name)?;
        let mut rest = path;
        while !rest.is_empty() {
            let (name, next) = rest.split_once('.').unwrap_or((rest, ""));
            node = self.get_child(node, name)?;
            rest = next;
        }
        Some(node)
    }

    /// The nodes from the logical device down to `node`.
    fn lineage(&self, node: NodeId) -> Option<Vec<&ModelNode>> {
        let mut lineage = vec![self.node(node)?];
        while let Some(parent) = lineage.last().and_then(|node| node.parent) {
            lineage.push(self.node(parent)?);
        }
        lineage.reverse();
        Some(lineage)
    }

    /// The object reference of `node`, e.g. `LD/LN.DO.DA`.
    #[must_use]
    pub fn reference(&self, node: NodeId) -> Option<String> {
        let lineage = self.lineage(node)?;
        let (ld, rest) = lineage.split_first()?;
        let path = rest.iter().map(|node| node.name.as_str()).collect::<Vec<_>>().join(".");
        Some(if path.is_empty() {
            ld.name.clone()
        } else {
            format!("{}/{path}", ld.name)
        })
    }

    /// The MMS domain and item name of a logical node or data attribute.
    ///
    /// Data objects spread over several functional constraints and have no MMS name.
    #[must_use]
    pub fn mms_address(&self, node: NodeId) -> Option<(String, String)> {
        let lineage = self.lineage(node)?;
        let (ld, rest) = lineage.split_first()?;
        let mut segments = Vec::with_capacity(rest.len() + 1);
        for (depth, node) in rest.iter().enumerate() {
            segments.push(node.name.as_str());
            // The functional constraint goes right after the logical node.
            if depth == 0
                && let Some(ModelNode {
                    class: NodeClass::DataAttribute { fc, .. },
                    ..
                }) = lineage.last()
            {
                segments.push(fc);
            }
        }
        match &lineage.last()?.class {
            NodeClass::LogicalNode | NodeClass::DataAttribute { .. } => {
                Some((ld.name.clone(), segments.join("$")))
            }
            NodeClass::LogicalDevice | NodeClass::DataObject => None,
        }
    }

    /// The data sets of every logical device.
    #[must_use]
    pub fn datasets(&self) -> &[Dataset] {
        &self.datasets
    }

    /// The data set `name` of `logical_device`.
    #[must_use]
    pub fn get_dataset(&self, logical_device: &str, name: &str) -> Option<&Dataset> {
        self.datasets.iter().find(|ds| ds.logical_device == logical_device && ds.name == name)
    }
}

/// Readable name of a type kind. Arrays are written as `[element]`.
fn type_name(kind: &TypeKind) -> String {
    match kind {
        TypeKind::Array { element, .. } => format!("[{}]", type_name(&element.kind)),
        TypeKind::Structure(_) => "structure".to_owned(),
        TypeKind::Boolean => "bool".to_owned(),
        TypeKind::Integer(_) => "integer".to_owned(),
        TypeKind::Unsigned(_) => "unsigned".to_owned(),
        TypeKind::Float { .. } => "floating_point".to_owned(),
        TypeKind::BitString(_) => "bit_string".to_owned(),
        TypeKind::OctetString(_) => "octet_string".to_owned(),
        TypeKind::VisibleString(_) => "visible_string".to_owned(),
        TypeKind::MmsString(_) => "mms_string".to_owned(),
        TypeKind::UtcTime => "utc_time".to_owned(),
        TypeKind::BinaryTime { .. } => "binary_time".to_owned(),
    }
}

impl fmt::Display for IedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            write!(f, "{}", serde_json::to_string_pretty(self).unwrap_or_default())
        } else {
            write!(f, "{}", serde_json::to_string(self).unwrap_or_default())
        }
    }
}
