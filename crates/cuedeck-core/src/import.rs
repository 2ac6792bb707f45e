//! Import - converts legacy flat operation lists into the offset tree
//!
//! Old project files store a single flat list in which every operation
//! runs at a global time, spelled out through explicit timestamp and
//! delay entries. The current document nests concurrency as offset
//! branches instead. Conversion walks the list with one forward-moving
//! cursor and a stack of open scopes: an operation falling inside an
//! open timed operation's window becomes an offset branch of that
//! operation, and everything else lands back on the outermost timeline,
//! padded with wait operations where the legacy data left gaps.

use crate::registry::{DurationHint, HandlerEntry, OperationRegistry};
use cuedeck_model::{InstantOp, Operation, OffsetBranch, TimedOp, Timeline};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

/// One entry of a legacy flat operation list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LegacyEntry {
    /// Jump the cursor forward to an absolute time. Never moves it back.
    Timestamp {
        /// Seconds from the start of the list.
        at: f64,
    },
    /// Advance the cursor by a relative amount.
    Delay {
        /// Seconds to advance. Negative values are ignored.
        seconds: f64,
    },
    /// An operation invoked at the current cursor time.
    Operation {
        /// Handler namespace.
        namespace: String,
        /// Handler name within the namespace.
        kind: String,
        /// Authored configuration.
        #[serde(default)]
        config: Value,
    },
}

/// Conversion options.
#[derive(Debug, Clone)]
pub struct ImportOptions {
    wait_namespace: String,
    wait_kind: String,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            wait_namespace: "time".to_string(),
            wait_kind: "delay".to_string(),
        }
    }
}

impl ImportOptions {
    /// Options using the stock `("time", "delay")` wait operation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different `(namespace, kind)` for synthesized wait operations.
    #[must_use]
    pub fn with_wait_operation(
        mut self,
        namespace: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        self.wait_namespace = namespace.into();
        self.wait_kind = kind.into();
        self
    }

    fn wait_operation(&self, seconds: f64) -> Operation {
        Operation::Timed(TimedOp::new(
            self.wait_namespace.clone(),
            self.wait_kind.clone(),
            json!({ "duration": seconds }),
        ))
    }
}

/// Convert a legacy flat list into a nested timeline.
///
/// Unknown operations are skipped with a warning. Durations come from
/// the registered handlers; only a finite positive fixed span makes an
/// imported operation timed and opens a window for branches.
pub async fn import_legacy(
    entries: Vec<LegacyEntry>,
    registry: &OperationRegistry,
    options: &ImportOptions,
) -> Timeline {
    let mut cursor = 0.0_f64;
    let mut scopes = Scopes::new();

    for entry in entries {
        match entry {
            LegacyEntry::Timestamp { at } => cursor = cursor.max(at),
            LegacyEntry::Delay { seconds } => cursor += seconds.max(0.0),
            LegacyEntry::Operation {
                namespace,
                kind,
                config,
            } => {
                let Some((operation, span)) = classify(registry, namespace, kind, config).await
                else {
                    continue;
                };
                scopes.place(cursor, operation, span, options);
            }
        }
    }

    while !scopes.open.is_empty() {
        scopes.close_innermost();
    }
    Timeline {
        operations: scopes.root.operations,
    }
}

/// Build the tree node for one legacy operation entry, plus the window
/// span it opens, if any.
async fn classify(
    registry: &OperationRegistry,
    namespace: String,
    kind: String,
    config: Value,
) -> Option<(Operation, Option<f64>)> {
    let handler = match registry.resolve(&namespace, &kind) {
        Some(HandlerEntry::Operation(handler)) => handler,
        Some(HandlerEntry::Flow(_)) => {
            warn!(namespace = %namespace, kind = %kind, "Legacy entry names a flow handler, skipping");
            return None;
        }
        None => {
            warn!(namespace = %namespace, kind = %kind, "Unknown operation in legacy data, skipping");
            return None;
        }
    };

    let span = match handler.duration(&config).await {
        Ok(DurationHint::Fixed(seconds)) if seconds.is_finite() && seconds > 0.0 => Some(seconds),
        Ok(_) => None,
        Err(error) => {
            warn!(
                namespace = %namespace,
                kind = %kind,
                error = %error,
                "Duration probe failed, importing as instant"
            );
            None
        }
    };

    let operation = match span {
        Some(_) => Operation::Timed(TimedOp::new(namespace, kind, config)),
        None => Operation::Instant(InstantOp::new(namespace, kind, config)),
    };
    Some((operation, span))
}

/// Span of global time in which a timed operation's branches may start.
#[derive(Debug, Clone, Copy)]
struct Window {
    start: f64,
    duration: f64,
}

impl Window {
    fn end(&self) -> f64 {
        self.start + self.duration
    }

    /// Half-open: a cursor exactly at the end is outside the window.
    fn contains(&self, at: f64) -> bool {
        self.start <= at && at < self.end()
    }
}

/// One timeline under construction.
struct Frame {
    operations: Vec<Operation>,
    /// Global time the next appended operation starts at.
    cursor: f64,
    /// Window of the most recently appended timed operation.
    window: Option<Window>,
}

impl Frame {
    fn starting_at(cursor: f64) -> Self {
        Self {
            operations: Vec::new(),
            cursor,
            window: None,
        }
    }

    /// Append at the current cursor. A fixed span opens the operation's
    /// window and moves the cursor past it.
    fn append(&mut self, operation: Operation, span: Option<f64>) {
        if let Some(duration) = span {
            self.window = Some(Window {
                start: self.cursor,
                duration,
            });
            self.cursor += duration;
        }
        self.operations.push(operation);
    }

    /// Whether the cursor can still land on this frame, either appended
    /// at its end or branched inside its window.
    fn fits(&self, cursor: f64) -> bool {
        cursor == self.cursor || self.window.is_some_and(|window| window.contains(cursor))
    }
}

/// An open branch scope: a frame plus where it attaches when closed.
struct OpenBranch {
    frame: Frame,
    /// Branch offset relative to the host operation's start.
    offset: f64,
}

/// The stack of open scopes. The root timeline sits at the bottom and
/// never closes.
struct Scopes {
    root: Frame,
    open: Vec<OpenBranch>,
}

impl Scopes {
    fn new() -> Self {
        Self {
            root: Frame::starting_at(0.0),
            open: Vec::new(),
        }
    }

    fn innermost(&mut self) -> &mut Frame {
        match self.open.last_mut() {
            Some(branch) => &mut branch.frame,
            None => &mut self.root,
        }
    }

    /// Place an operation at `cursor`: append on an exact cursor match,
    /// open a branch when the surviving frame's window contains the
    /// cursor, else pad the outermost timeline with a wait and append
    /// there.
    ///
    /// The append check runs before the window check, so a cursor exactly
    /// on a window boundary always lands on the enclosing timeline.
    fn place(
        &mut self,
        cursor: f64,
        operation: Operation,
        span: Option<f64>,
        options: &ImportOptions,
    ) {
        self.close_unfit(cursor);

        let frame = self.innermost();
        if cursor == frame.cursor {
            frame.append(operation, span);
            return;
        }

        match frame.window.filter(|window| window.contains(cursor)) {
            Some(window) => {
                self.open.push(OpenBranch {
                    frame: Frame::starting_at(cursor),
                    offset: cursor - window.start,
                });
                self.innermost().append(operation, span);
            }
            None => {
                // Only the root frame can still miss after the close
                // pass; bridge the gap before appending.
                let gap = cursor - frame.cursor;
                frame.append(options.wait_operation(gap), Some(gap));
                frame.append(operation, span);
            }
        }
    }

    /// Close scopes the cursor no longer fits. The cursor only moves
    /// forward, so a frame that cannot take it now never will.
    fn close_unfit(&mut self, cursor: f64) {
        while let Some(open) = self.open.last() {
            if open.frame.fits(cursor) {
                break;
            }
            self.close_innermost();
        }
    }

    /// Pop one scope and attach its timeline as an offset branch of the
    /// host operation.
    fn close_innermost(&mut self) {
        let Some(closed) = self.open.pop() else {
            return;
        };
        // A scope only ever opens inside the window of the parent frame's
        // last timed operation.
        if let Some(Operation::Timed(host)) = self.innermost().operations.last_mut() {
            host.offsets
                .push(OffsetBranch::new(closed.offset, closed.frame.operations));
        }
    }
}

#[cfg(test)]
mod tests;
