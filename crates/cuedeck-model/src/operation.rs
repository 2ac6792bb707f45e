//! Operation - the node types of a timeline document
//!
//! A timeline is an ordered list of operations. Four kinds exist:
//! - `Instant`: executes and advances immediately
//! - `Timed`: spans time and carries offset branches that start relative to it
//! - `Flow`: branches into named sub-timelines chosen at execution time
//! - `Stack`: instant operations executed back-to-back
//!
//! The serialized form is shape-discriminated rather than tagged: a node
//! carrying `stack` is a stack, `offsets` a timed operation, `subFlows` a
//! flow, and anything else an instant operation. This matches the document
//! format the timeline editor produces.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// A single node in a timeline.
///
/// Variant order is load-bearing: serde tries untagged variants top to
/// bottom, so every variant with a discriminating required field
/// (`stack`, `offsets`, `subFlows`) must come before the instant fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operation {
    /// A stack of instant operations executed back-to-back.
    Stack(OperationStack),
    /// An operation spanning time, with offset branches.
    Timed(TimedOp),
    /// An operation that branches into sub-timelines.
    Flow(FlowOp),
    /// An operation that executes and advances immediately.
    Instant(InstantOp),
}

impl Operation {
    /// The node's unique id within its document.
    #[must_use]
    pub fn id(&self) -> Uuid {
        match self {
            Self::Stack(stack) => stack.id,
            Self::Timed(op) => op.id,
            Self::Flow(op) => op.id,
            Self::Instant(op) => op.id,
        }
    }

    /// Short kind label for logging.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Stack(_) => "stack",
            Self::Timed(_) => "timed",
            Self::Flow(_) => "flow",
            Self::Instant(_) => "instant",
        }
    }

    /// Assign a fresh id to this node and every nested node: offset
    /// branches, sub-timelines, stack members, and all their children.
    pub fn reassign_ids(&mut self) {
        match self {
            Self::Stack(stack) => {
                stack.id = Uuid::new_v4();
                for member in &mut stack.stack {
                    member.id = Uuid::new_v4();
                }
            }
            Self::Timed(op) => {
                op.id = Uuid::new_v4();
                for branch in &mut op.offsets {
                    branch.id = Uuid::new_v4();
                    for child in &mut branch.operations {
                        child.reassign_ids();
                    }
                }
            }
            Self::Flow(op) => {
                op.id = Uuid::new_v4();
                for sub_flow in &mut op.sub_flows {
                    sub_flow.id = Uuid::new_v4();
                    for child in &mut sub_flow.operations {
                        child.reassign_ids();
                    }
                }
            }
            Self::Instant(op) => op.id = Uuid::new_v4(),
        }
    }
}

/// An operation that executes and advances immediately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstantOp {
    /// Unique id within the document.
    pub id: Uuid,

    /// Handler namespace (typically the owning plugin).
    pub namespace: String,

    /// Handler name within the namespace.
    pub kind: String,

    /// Authored configuration, resolved against the run context before
    /// the handler sees it.
    #[serde(default)]
    pub config: Value,

    /// Maps fields of the handler's result object onto run context keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_mapping: Option<HashMap<String, String>>,
}

impl InstantOp {
    /// Create an instant operation with a fresh id.
    #[must_use]
    pub fn new(namespace: impl Into<String>, kind: impl Into<String>, config: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            namespace: namespace.into(),
            kind: kind.into(),
            config,
            result_mapping: None,
        }
    }

    /// Map result fields onto context keys.
    #[must_use]
    pub fn with_result_mapping(mut self, mapping: HashMap<String, String>) -> Self {
        self.result_mapping = Some(mapping);
        self
    }
}

/// An operation that spans time.
///
/// Offset branches start `offset` seconds after the operation begins and
/// run concurrently with it and with each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimedOp {
    /// Unique id within the document.
    pub id: Uuid,

    /// Handler namespace.
    pub namespace: String,

    /// Handler name within the namespace.
    pub kind: String,

    /// Authored configuration.
    #[serde(default)]
    pub config: Value,

    /// Maps fields of the handler's result object onto context keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_mapping: Option<HashMap<String, String>>,

    /// Branches started relative to this operation. Kept in the document
    /// even when empty; its presence is what marks the node as timed.
    pub offsets: Vec<OffsetBranch>,
}

impl TimedOp {
    /// Create a timed operation with a fresh id and no branches.
    #[must_use]
    pub fn new(namespace: impl Into<String>, kind: impl Into<String>, config: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            namespace: namespace.into(),
            kind: kind.into(),
            config,
            result_mapping: None,
            offsets: Vec::new(),
        }
    }

    /// Add an offset branch.
    #[must_use]
    pub fn with_offset(mut self, offset: f64, operations: Vec<Operation>) -> Self {
        self.offsets.push(OffsetBranch::new(offset, operations));
        self
    }

    /// Map result fields onto context keys.
    #[must_use]
    pub fn with_result_mapping(mut self, mapping: HashMap<String, String>) -> Self {
        self.result_mapping = Some(mapping);
        self
    }
}

/// A timeline starting a fixed number of seconds after its timed parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffsetBranch {
    /// Unique id within the document.
    pub id: Uuid,

    /// Seconds after the parent operation begins. Non-negative; branches
    /// of one operation are independent and may overlap.
    pub offset: f64,

    /// The branch's own operation list.
    pub operations: Vec<Operation>,
}

impl OffsetBranch {
    /// Create a branch with a fresh id.
    #[must_use]
    pub fn new(offset: f64, operations: Vec<Operation>) -> Self {
        Self {
            id: Uuid::new_v4(),
            offset,
            operations,
        }
    }
}

/// An operation that branches into named sub-timelines.
///
/// The flow handler picks which sub-timelines run; the executor runs the
/// selected ones concurrently and advances when all of them settle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowOp {
    /// Unique id within the document.
    pub id: Uuid,

    /// Handler namespace.
    pub namespace: String,

    /// Handler name within the namespace.
    pub kind: String,

    /// Authored configuration.
    #[serde(default)]
    pub config: Value,

    /// Candidate sub-timelines. Kept in the document even when empty; its
    /// presence is what marks the node as a flow.
    pub sub_flows: Vec<SubTimeline>,
}

impl FlowOp {
    /// Create a flow operation with a fresh id and no sub-timelines.
    #[must_use]
    pub fn new(namespace: impl Into<String>, kind: impl Into<String>, config: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            namespace: namespace.into(),
            kind: kind.into(),
            config,
            sub_flows: Vec::new(),
        }
    }

    /// Add a candidate sub-timeline.
    #[must_use]
    pub fn with_sub_flow(mut self, sub_flow: SubTimeline) -> Self {
        self.sub_flows.push(sub_flow);
        self
    }
}

/// A named child timeline of a flow operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTimeline {
    /// Unique id within the document; flow handlers select by this id.
    pub id: Uuid,

    /// Editor-facing label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Branch configuration handed to the flow handler at selection time.
    #[serde(default)]
    pub config: Value,

    /// The sub-timeline's own operation list.
    pub operations: Vec<Operation>,
}

impl SubTimeline {
    /// Create an empty sub-timeline with a fresh id.
    #[must_use]
    pub fn new(config: Value, operations: Vec<Operation>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: None,
            config,
            operations,
        }
    }

    /// Set the editor-facing label.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// A run of instant operations executed back-to-back with no scheduling
/// delay between members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationStack {
    /// Unique id within the document.
    pub id: Uuid,

    /// Members, executed in order. Kept in the document even when empty;
    /// its presence is what marks the node as a stack.
    pub stack: Vec<InstantOp>,
}

impl OperationStack {
    /// Create an empty stack with a fresh id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            stack: Vec::new(),
        }
    }

    /// Add a member to the end of the stack.
    #[must_use]
    pub fn with_member(mut self, member: InstantOp) -> Self {
        self.stack.push(member);
        self
    }
}

impl Default for OperationStack {
    fn default() -> Self {
        Self::new()
    }
}
