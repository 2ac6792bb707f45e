//! Timeline - ordered operation lists and recursive tree algorithms
//!
//! A timeline owns its operations outright: the tree is strictly acyclic,
//! children are exclusively owned, and there are no back-references. That
//! keeps id reassignment and lookup plain recursive functions.

use crate::operation::{InstantOp, Operation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An ordered list of operations, executed top to bottom.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    /// The operations, in execution order.
    pub operations: Vec<Operation>,
}

/// Read-only result of an id lookup.
///
/// Stack members carry ids of their own but are not tree nodes, so lookup
/// distinguishes them from operations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OperationRef<'a> {
    /// An operation node somewhere in the tree.
    Node(&'a Operation),
    /// A member of an operation stack.
    StackMember(&'a InstantOp),
}

impl OperationRef<'_> {
    /// The id of the found node or member.
    #[must_use]
    pub fn id(&self) -> Uuid {
        match self {
            Self::Node(op) => op.id(),
            Self::StackMember(member) => member.id,
        }
    }
}

/// Mutable result of an id lookup.
#[derive(Debug, PartialEq)]
pub enum OperationMut<'a> {
    /// An operation node somewhere in the tree.
    Node(&'a mut Operation),
    /// A member of an operation stack.
    StackMember(&'a mut InstantOp),
}

impl Timeline {
    /// Create an empty timeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operation, builder style.
    #[must_use]
    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    /// Append an operation.
    pub fn push(&mut self, operation: Operation) {
        self.operations.push(operation);
    }

    /// Number of top-level operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Whether the timeline has no operations at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Total number of id-bearing nodes in the tree: operations, stack
    /// members, offset branches, and sub-timelines, recursively.
    #[must_use]
    pub fn node_count(&self) -> usize {
        fn count(operations: &[Operation]) -> usize {
            operations
                .iter()
                .map(|op| match op {
                    Operation::Stack(stack) => 1 + stack.stack.len(),
                    Operation::Timed(timed) => {
                        1 + timed
                            .offsets
                            .iter()
                            .map(|branch| 1 + count(&branch.operations))
                            .sum::<usize>()
                    }
                    Operation::Flow(flow) => {
                        1 + flow
                            .sub_flows
                            .iter()
                            .map(|sub| 1 + count(&sub.operations))
                            .sum::<usize>()
                    }
                    Operation::Instant(_) => 1,
                })
                .sum()
        }
        count(&self.operations)
    }

    /// Assign fresh ids to every node in the tree, preserving structure.
    ///
    /// Used when duplicating a timeline so the copy never collides with
    /// the source document.
    pub fn reassign_ids(&mut self) {
        for operation in &mut self.operations {
            operation.reassign_ids();
        }
    }

    /// Depth-first lookup by id, in document order. Returns the operation
    /// or stack member carrying `id`, first match wins.
    #[must_use]
    pub fn find(&self, id: Uuid) -> Option<OperationRef<'_>> {
        find_in(&self.operations, id)
    }

    /// Mutable counterpart of [`find`](Self::find).
    pub fn find_mut(&mut self, id: Uuid) -> Option<OperationMut<'_>> {
        find_in_mut(&mut self.operations, id)
    }
}

fn find_in(operations: &[Operation], id: Uuid) -> Option<OperationRef<'_>> {
    for operation in operations {
        if operation.id() == id {
            return Some(OperationRef::Node(operation));
        }
        match operation {
            Operation::Stack(stack) => {
                if let Some(member) = stack.stack.iter().find(|member| member.id == id) {
                    return Some(OperationRef::StackMember(member));
                }
            }
            Operation::Timed(timed) => {
                for branch in &timed.offsets {
                    if let Some(found) = find_in(&branch.operations, id) {
                        return Some(found);
                    }
                }
            }
            Operation::Flow(flow) => {
                for sub_flow in &flow.sub_flows {
                    if let Some(found) = find_in(&sub_flow.operations, id) {
                        return Some(found);
                    }
                }
            }
            Operation::Instant(_) => {}
        }
    }
    None
}

fn find_in_mut(operations: &mut [Operation], id: Uuid) -> Option<OperationMut<'_>> {
    for operation in operations {
        if operation.id() == id {
            return Some(OperationMut::Node(operation));
        }
        match operation {
            Operation::Stack(stack) => {
                if let Some(member) = stack.stack.iter_mut().find(|member| member.id == id) {
                    return Some(OperationMut::StackMember(member));
                }
            }
            Operation::Timed(timed) => {
                for branch in &mut timed.offsets {
                    if let Some(found) = find_in_mut(&mut branch.operations, id) {
                        return Some(found);
                    }
                }
            }
            Operation::Flow(flow) => {
                for sub_flow in &mut flow.sub_flows {
                    if let Some(found) = find_in_mut(&mut sub_flow.operations, id) {
                        return Some(found);
                    }
                }
            }
            Operation::Instant(_) => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{FlowOp, InstantOp, OperationStack, SubTimeline, TimedOp};
    use serde_json::json;
    use std::collections::HashSet;

    /// A timeline exercising every node kind and two levels of nesting.
    fn deep_timeline() -> Timeline {
        let branch_child = Operation::Instant(InstantOp::new("chat", "send", json!({})));
        let timed = TimedOp::new("audio", "play", json!({"file": "intro.mp3"}))
            .with_offset(2.0, vec![branch_child])
            .with_offset(5.0, vec![]);

        let sub_child = Operation::Timed(TimedOp::new("obs", "transition", json!({})));
        let flow = FlowOp::new("logic", "branch", json!({})).with_sub_flow(
            SubTimeline::new(json!({"case": true}), vec![sub_child]).with_name("yes"),
        );

        let stack = OperationStack::new()
            .with_member(InstantOp::new("overlay", "show", json!({})))
            .with_member(InstantOp::new("overlay", "hide", json!({})));

        Timeline::new()
            .with_operation(Operation::Timed(timed))
            .with_operation(Operation::Flow(flow))
            .with_operation(Operation::Stack(stack))
            .with_operation(Operation::Instant(InstantOp::new("chat", "send", json!({}))))
    }

    fn collect_ids(timeline: &Timeline) -> Vec<Uuid> {
        fn walk(operations: &[Operation], out: &mut Vec<Uuid>) {
            for op in operations {
                out.push(op.id());
                match op {
                    Operation::Stack(stack) => {
                        out.extend(stack.stack.iter().map(|m| m.id));
                    }
                    Operation::Timed(timed) => {
                        for branch in &timed.offsets {
                            out.push(branch.id);
                            walk(&branch.operations, out);
                        }
                    }
                    Operation::Flow(flow) => {
                        for sub in &flow.sub_flows {
                            out.push(sub.id);
                            walk(&sub.operations, out);
                        }
                    }
                    Operation::Instant(_) => {}
                }
            }
        }
        let mut out = Vec::new();
        walk(&timeline.operations, &mut out);
        out
    }

    fn shape_of(timeline: &Timeline) -> Vec<String> {
        fn walk(operations: &[Operation], depth: usize, out: &mut Vec<String>) {
            for op in operations {
                out.push(format!("{depth}:{}", op.kind_name()));
                match op {
                    Operation::Stack(stack) => out.push(format!("{depth}:members={}", stack.stack.len())),
                    Operation::Timed(timed) => {
                        for branch in &timed.offsets {
                            walk(&branch.operations, depth + 1, out);
                        }
                    }
                    Operation::Flow(flow) => {
                        for sub in &flow.sub_flows {
                            walk(&sub.operations, depth + 1, out);
                        }
                    }
                    Operation::Instant(_) => {}
                }
            }
        }
        let mut out = Vec::new();
        walk(&timeline.operations, 0, &mut out);
        out
    }

    #[test]
    fn test_ids_unique_in_fresh_timeline() {
        let timeline = deep_timeline();
        let ids = collect_ids(&timeline);
        let unique: HashSet<_> = ids.iter().copied().collect();
        assert_eq!(ids.len(), unique.len());
    }

    #[test]
    fn test_reassign_preserves_shape_with_disjoint_ids() {
        let original = deep_timeline();
        let mut copy = original.clone();
        copy.reassign_ids();

        assert_eq!(shape_of(&original), shape_of(&copy));

        let before: HashSet<_> = collect_ids(&original).into_iter().collect();
        let after: HashSet<_> = collect_ids(&copy).into_iter().collect();
        assert_eq!(before.len(), after.len());
        assert!(before.is_disjoint(&after));
    }

    #[test]
    fn test_find_every_operation_id() {
        let timeline = deep_timeline();
        for id in collect_ids(&timeline) {
            // Branch and sub-timeline ids are structural, not operations;
            // everything find returns must carry the id it was asked for.
            if let Some(found) = timeline.find(id) {
                assert_eq!(found.id(), id);
            }
        }
    }

    #[test]
    fn test_find_nested_branch_child() {
        let timeline = deep_timeline();
        let Operation::Timed(timed) = &timeline.operations[0] else {
            panic!("expected timed head");
        };
        let child_id = timed.offsets[0].operations[0].id();

        let found = timeline.find(child_id).expect("nested child not found");
        assert_eq!(found.id(), child_id);
        assert!(matches!(found, OperationRef::Node(Operation::Instant(_))));
    }

    #[test]
    fn test_find_stack_member() {
        let timeline = deep_timeline();
        let Operation::Stack(stack) = &timeline.operations[2] else {
            panic!("expected stack");
        };
        let member_id = stack.stack[1].id;

        let found = timeline.find(member_id).expect("member not found");
        assert!(matches!(found, OperationRef::StackMember(m) if m.id == member_id));
    }

    #[test]
    fn test_find_absent_id() {
        let timeline = deep_timeline();
        assert!(timeline.find(Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_find_mut_edits_in_place() {
        let mut timeline = deep_timeline();
        let target = timeline.operations[3].id();

        match timeline.find_mut(target) {
            Some(OperationMut::Node(Operation::Instant(op))) => {
                op.config = json!({"message": "edited"});
            }
            other => panic!("unexpected lookup result: {other:?}"),
        }

        let Operation::Instant(op) = &timeline.operations[3] else {
            panic!("kind changed");
        };
        assert_eq!(op.config["message"], "edited");
    }

    #[test]
    fn test_node_count() {
        let timeline = deep_timeline();
        // 4 top-level + 2 branches + 1 branch child + 1 sub-timeline
        // + 1 sub-timeline child + 2 stack members.
        assert_eq!(timeline.node_count(), 11);
    }

    #[test]
    fn test_json_round_trip_identical() {
        let timeline = deep_timeline();
        let text = serde_json::to_string(&timeline).unwrap();
        let back: Timeline = serde_json::from_str(&text).unwrap();
        assert_eq!(back, timeline);
    }
}
