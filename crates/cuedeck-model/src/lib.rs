//! Cuedeck Model - Timeline Document Model
//!
//! This crate defines the timeline tree the Cuedeck engine executes:
//! - Operation: the four node kinds (instant, timed, flow, stack)
//! - Timeline: ordered operation lists plus recursive id algorithms
//!
//! The model is pure data: no runtime, no handler types, no I/O. The
//! serialized form round-trips losslessly through JSON.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod operation;
pub mod timeline;

pub use operation::{
    FlowOp, InstantOp, OffsetBranch, Operation, OperationStack, SubTimeline, TimedOp,
};
pub use timeline::{OperationMut, OperationRef, Timeline};
