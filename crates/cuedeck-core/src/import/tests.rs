use super::*;
use crate::registry::{FlowBranch, FlowHandler, OperationHandler};
use crate::run::ContextView;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct Quick;

#[async_trait]
impl OperationHandler for Quick {
    async fn invoke(
        &self,
        _config: Value,
        _ctx: &ContextView,
        _abort: CancellationToken,
    ) -> anyhow::Result<Value> {
        Ok(Value::Null)
    }
}

struct Span(f64);

#[async_trait]
impl OperationHandler for Span {
    async fn invoke(
        &self,
        _config: Value,
        _ctx: &ContextView,
        _abort: CancellationToken,
    ) -> anyhow::Result<Value> {
        Ok(Value::Null)
    }

    async fn duration(&self, _config: &Value) -> anyhow::Result<DurationHint> {
        Ok(DurationHint::Fixed(self.0))
    }
}

struct Hold;

#[async_trait]
impl OperationHandler for Hold {
    async fn invoke(
        &self,
        _config: Value,
        _ctx: &ContextView,
        _abort: CancellationToken,
    ) -> anyhow::Result<Value> {
        Ok(Value::Null)
    }

    async fn duration(&self, _config: &Value) -> anyhow::Result<DurationHint> {
        Ok(DurationHint::Indefinite)
    }
}

struct BadProbe;

#[async_trait]
impl OperationHandler for BadProbe {
    async fn invoke(
        &self,
        _config: Value,
        _ctx: &ContextView,
        _abort: CancellationToken,
    ) -> anyhow::Result<Value> {
        Ok(Value::Null)
    }

    async fn duration(&self, _config: &Value) -> anyhow::Result<DurationHint> {
        Err(anyhow::anyhow!("unreadable cue sheet"))
    }
}

struct NoneFlow;

#[async_trait]
impl FlowHandler for NoneFlow {
    async fn select(
        &self,
        _config: Value,
        _branches: &[FlowBranch],
        _ctx: &ContextView,
        _abort: CancellationToken,
    ) -> anyhow::Result<Vec<Uuid>> {
        Ok(Vec::new())
    }
}

fn registry() -> OperationRegistry {
    let mut registry = OperationRegistry::new();
    registry.register("chat", "send", Arc::new(Quick)).unwrap();
    registry.register("light", "fade", Arc::new(Span(4.0))).unwrap();
    registry.register("scene", "hold", Arc::new(Span(10.0))).unwrap();
    registry.register("sound", "play", Arc::new(Span(3.0))).unwrap();
    registry.register("fx", "pop", Arc::new(Span(0.0))).unwrap();
    registry.register("obs", "stream", Arc::new(Hold)).unwrap();
    registry.register("old", "broken", Arc::new(BadProbe)).unwrap();
    registry
}

fn op(namespace: &str, kind: &str) -> LegacyEntry {
    LegacyEntry::Operation {
        namespace: namespace.to_string(),
        kind: kind.to_string(),
        config: json!({}),
    }
}

fn ts(at: f64) -> LegacyEntry {
    LegacyEntry::Timestamp { at }
}

fn delay(seconds: f64) -> LegacyEntry {
    LegacyEntry::Delay { seconds }
}

fn name(op: &Operation) -> (&str, &str) {
    match op {
        Operation::Instant(op) => (op.namespace.as_str(), op.kind.as_str()),
        Operation::Timed(op) => (op.namespace.as_str(), op.kind.as_str()),
        Operation::Flow(op) => (op.namespace.as_str(), op.kind.as_str()),
        Operation::Stack(_) => panic!("legacy data never imports as a stack"),
    }
}

fn names(ops: &[Operation]) -> Vec<(&str, &str)> {
    ops.iter().map(name).collect()
}

fn timed(op: &Operation) -> &TimedOp {
    match op {
        Operation::Timed(op) => op,
        other => panic!("expected a timed operation, got {}", other.kind_name()),
    }
}

fn instant(op: &Operation) -> &InstantOp {
    match op {
        Operation::Instant(op) => op,
        other => panic!("expected an instant operation, got {}", other.kind_name()),
    }
}

#[tokio::test]
async fn test_flat_instants_import_in_order() {
    let entries = vec![
        LegacyEntry::Operation {
            namespace: "chat".to_string(),
            kind: "send".to_string(),
            config: json!({"message": "hi"}),
        },
        op("chat", "send"),
    ];

    let timeline = import_legacy(entries, &registry(), &ImportOptions::default()).await;

    assert_eq!(names(&timeline.operations), vec![("chat", "send"); 2]);
    assert_eq!(instant(&timeline.operations[0]).config, json!({"message": "hi"}));
}

#[tokio::test]
async fn test_delay_becomes_wait_operation() {
    let entries = vec![op("chat", "send"), delay(2.5), op("chat", "send")];

    let timeline = import_legacy(entries, &registry(), &ImportOptions::default()).await;

    assert_eq!(
        names(&timeline.operations),
        vec![("chat", "send"), ("time", "delay"), ("chat", "send")]
    );
    let wait = timed(&timeline.operations[1]);
    assert_eq!(wait.config, json!({"duration": 2.5}));
    assert!(wait.offsets.is_empty());
}

#[tokio::test]
async fn test_cursor_never_moves_backward() {
    // The timestamp points before the cursor and the second delay is
    // negative; neither moves anything.
    let entries = vec![delay(5.0), ts(2.0), delay(-3.0), op("chat", "send")];

    let timeline = import_legacy(entries, &registry(), &ImportOptions::default()).await;

    assert_eq!(
        names(&timeline.operations),
        vec![("time", "delay"), ("chat", "send")]
    );
    assert_eq!(timed(&timeline.operations[0]).config, json!({"duration": 5.0}));
}

#[tokio::test]
async fn test_operation_during_window_becomes_branch() {
    let entries = vec![
        op("light", "fade"),
        ts(1.0),
        op("chat", "send"),
        ts(6.0),
        op("chat", "send"),
    ];

    let timeline = import_legacy(entries, &registry(), &ImportOptions::default()).await;

    assert_eq!(
        names(&timeline.operations),
        vec![("light", "fade"), ("time", "delay"), ("chat", "send")]
    );
    let fade = timed(&timeline.operations[0]);
    assert_eq!(fade.offsets.len(), 1);
    assert_eq!(fade.offsets[0].offset, 1.0);
    assert_eq!(names(&fade.offsets[0].operations), vec![("chat", "send")]);
    // The fade spans [0, 4) and the final operation sits at 6, so two
    // seconds of padding bridge the gap.
    assert_eq!(timed(&timeline.operations[1]).config, json!({"duration": 2.0}));
}

#[tokio::test]
async fn test_cursor_at_window_end_lands_on_enclosing_timeline() {
    // The fade spans [0, 4); the second send sits exactly at 4, a window
    // is half-open, so it closes the branch and appends after the fade.
    let entries = vec![
        op("light", "fade"),
        ts(1.0),
        op("chat", "send"),
        ts(4.0),
        op("chat", "send"),
    ];

    let timeline = import_legacy(entries, &registry(), &ImportOptions::default()).await;

    assert_eq!(
        names(&timeline.operations),
        vec![("light", "fade"), ("chat", "send")]
    );
    let fade = timed(&timeline.operations[0]);
    assert_eq!(fade.offsets.len(), 1);
    assert_eq!(names(&fade.offsets[0].operations), vec![("chat", "send")]);
}

#[tokio::test]
async fn test_nested_windows_nest_branches() {
    let entries = vec![
        op("scene", "hold"),
        ts(2.0),
        op("sound", "play"),
        ts(3.0),
        op("chat", "send"),
        ts(7.0),
        op("chat", "send"),
    ];

    let timeline = import_legacy(entries, &registry(), &ImportOptions::default()).await;

    assert_eq!(names(&timeline.operations), vec![("scene", "hold")]);
    let hold = timed(&timeline.operations[0]);
    assert_eq!(hold.offsets.len(), 2);
    assert_eq!(hold.offsets[0].offset, 2.0);

    // The play at 2 hosts the send at 3 as a nested branch.
    let inner = &hold.offsets[0].operations;
    assert_eq!(names(inner), vec![("sound", "play")]);
    let play = timed(&inner[0]);
    assert_eq!(play.offsets.len(), 1);
    assert_eq!(play.offsets[0].offset, 1.0);
    assert_eq!(names(&play.offsets[0].operations), vec![("chat", "send")]);

    // The send at 7 fits no inner scope but still falls inside the
    // hold's window, so it becomes a sibling branch of the play's.
    assert_eq!(hold.offsets[1].offset, 7.0);
    assert_eq!(names(&hold.offsets[1].operations), vec![("chat", "send")]);

    // Every imported node carries a fresh id.
    let mut ids = vec![
        hold.id,
        hold.offsets[0].id,
        hold.offsets[1].id,
        inner[0].id(),
        play.offsets[0].id,
        play.offsets[0].operations[0].id(),
        hold.offsets[1].operations[0].id(),
    ];
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 7);
}

#[tokio::test]
async fn test_open_scopes_close_at_end_of_input() {
    let entries = vec![op("light", "fade"), ts(2.0), op("chat", "send")];

    let timeline = import_legacy(entries, &registry(), &ImportOptions::default()).await;

    assert_eq!(names(&timeline.operations), vec![("light", "fade")]);
    let fade = timed(&timeline.operations[0]);
    assert_eq!(fade.offsets.len(), 1);
    assert_eq!(fade.offsets[0].offset, 2.0);
    assert_eq!(names(&fade.offsets[0].operations), vec![("chat", "send")]);
}

#[tokio::test]
async fn test_unknown_operation_skipped() {
    let entries = vec![op("ghost", "poke"), op("chat", "send")];

    let timeline = import_legacy(entries, &registry(), &ImportOptions::default()).await;

    assert_eq!(names(&timeline.operations), vec![("chat", "send")]);
}

#[tokio::test]
async fn test_flow_handler_entry_skipped() {
    let mut registry = registry();
    registry.register_flow("logic", "branch", Arc::new(NoneFlow)).unwrap();
    let entries = vec![op("logic", "branch"), op("chat", "send")];

    let timeline = import_legacy(entries, &registry, &ImportOptions::default()).await;

    assert_eq!(names(&timeline.operations), vec![("chat", "send")]);
}

#[tokio::test]
async fn test_duration_probe_failure_imports_instant() {
    let entries = vec![op("old", "broken"), ts(2.0), op("chat", "send")];

    let timeline = import_legacy(entries, &registry(), &ImportOptions::default()).await;

    // No window opened, so the later operation pads instead of branching.
    assert_eq!(
        names(&timeline.operations),
        vec![("old", "broken"), ("time", "delay"), ("chat", "send")]
    );
    instant(&timeline.operations[0]);
}

#[tokio::test]
async fn test_indefinite_duration_imports_instant() {
    let entries = vec![op("obs", "stream"), ts(3.0), op("chat", "send")];

    let timeline = import_legacy(entries, &registry(), &ImportOptions::default()).await;

    assert_eq!(
        names(&timeline.operations),
        vec![("obs", "stream"), ("time", "delay"), ("chat", "send")]
    );
    instant(&timeline.operations[0]);
}

#[tokio::test]
async fn test_zero_duration_opens_no_window() {
    let entries = vec![op("fx", "pop"), ts(1.0), op("chat", "send")];

    let timeline = import_legacy(entries, &registry(), &ImportOptions::default()).await;

    assert_eq!(
        names(&timeline.operations),
        vec![("fx", "pop"), ("time", "delay"), ("chat", "send")]
    );
    instant(&timeline.operations[0]);
}

#[tokio::test]
async fn test_custom_wait_operation() {
    let options = ImportOptions::new().with_wait_operation("wait", "hold");
    let entries = vec![op("chat", "send"), delay(1.0), op("chat", "send")];

    let timeline = import_legacy(entries, &registry(), &options).await;

    let wait = timed(&timeline.operations[1]);
    assert_eq!((wait.namespace.as_str(), wait.kind.as_str()), ("wait", "hold"));
    assert_eq!(wait.config, json!({"duration": 1.0}));
}

#[tokio::test]
async fn test_legacy_entries_deserialize() {
    let raw = json!([
        {"type": "timestamp", "at": 4.0},
        {"type": "delay", "seconds": 1.5},
        {"type": "operation", "namespace": "chat", "kind": "send"},
    ]);

    let entries: Vec<LegacyEntry> = serde_json::from_value(raw).unwrap();
    assert_eq!(
        entries,
        vec![
            ts(4.0),
            delay(1.5),
            LegacyEntry::Operation {
                namespace: "chat".to_string(),
                kind: "send".to_string(),
                config: Value::Null,
            },
        ]
    );

    let text = serde_json::to_string(&ts(4.0)).unwrap();
    assert!(text.contains("\"type\":\"timestamp\""));
}
