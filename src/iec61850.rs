//! IEC 61850 view of the MMS object model.
//!
//! A logical device is an MMS domain and a logical node is one of its top level
//! structured variables. [`IedModel`] rebuilds the logical device, logical node, data
//! object and data attribute hierarchy from an [`MmsDevice`](crate::mms::device::MmsDevice)
//! and resolves object references like `LD/LN.DO.DA`.

pub mod model;

pub use model::{Dataset, IedModel, ModelNode, NodeClass, NodeId};
