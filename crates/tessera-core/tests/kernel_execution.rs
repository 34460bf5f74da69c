//! Integration tests for reactive kernel execution.
//!
//! Cells are driven by a scripted executor: each cell's code token selects a
//! closure that computes its outputs from the request.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::broadcast;

use tessera_core::cache::{CacheUnit, ExecutionTrace, HashStrategy, ModuleRef, Resolved, UnitEnvironment};
use tessera_core::elements::{ElementKind, Lens};
use tessera_core::{
    Binding, CacheEngine, CellError, CellFailure, CellId, CellOutput, CellRequest, CellSpec,
    CellStatus, Kernel, KernelConfig, KernelMessage, ModelId, Task,
};

// =============================================================================
// Test Helpers
// =============================================================================

type Script = Arc<dyn Fn(&CellRequest) -> Result<CellOutput, CellFailure> + Send + Sync>;

/// Executor running a closure per code token and recording every call.
#[derive(Clone, Default)]
struct StubExecutor {
    scripts: Arc<Mutex<HashMap<String, Script>>>,
    calls: Arc<Mutex<Vec<CellId>>>,
}

impl StubExecutor {
    fn on<F>(&self, code: &str, f: F) -> &Self
    where
        F: Fn(&CellRequest) -> Result<CellOutput, CellFailure> + Send + Sync + 'static,
    {
        self.scripts.lock().insert(code.to_string(), Arc::new(f));
        self
    }

    fn calls(&self) -> Vec<CellId> {
        self.calls.lock().clone()
    }

    fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn run(&self, request: CellRequest) -> Task {
        self.calls.lock().push(request.cell);
        let script = self.scripts.lock().get(request.code.as_str()).cloned();
        let result = match script {
            Some(script) => script(&request),
            None => Err(CellFailure::new(format!("no script for {}", request.code.as_str()))),
        };
        Task::ready(result)
    }
}

fn config() -> KernelConfig {
    let mut config = KernelConfig::default();
    config.watch.enabled = false;
    config
}

fn kernel(exec: &StubExecutor) -> (Kernel, broadcast::Receiver<KernelMessage>) {
    let exec = exec.clone();
    Kernel::new(config(), move |request: CellRequest| exec.run(request)).unwrap()
}

fn cell(id: usize, code: &str, defs: &[&str], refs: &[&str]) -> CellSpec {
    CellSpec::new(CellId::new(id), code, defs.iter().copied(), refs.iter().copied())
}

fn int(request: &CellRequest, name: &str) -> i64 {
    request.value(name).and_then(Value::as_i64).unwrap_or_default()
}

fn drain(rx: &mut broadcast::Receiver<KernelMessage>) -> Vec<KernelMessage> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

const A: CellId = CellId::new(0);
const B: CellId = CellId::new(1);
const C: CellId = CellId::new(2);
const D: CellId = CellId::new(3);

// =============================================================================
// Scheduling
// =============================================================================

#[tokio::test]
async fn test_diamond_runs_in_dependency_order() {
    let exec = StubExecutor::default();
    exec.on("a", |_| Ok(CellOutput::new().bind("a", json!(1))))
        .on("b", |r| Ok(CellOutput::new().bind("b", json!(int(r, "a") + 10))))
        .on("c", |r| Ok(CellOutput::new().bind("c", json!(int(r, "a") + 100))))
        .on("d", |r| Ok(CellOutput::new().bind("d", json!(int(r, "b") + int(r, "c")))));
    let (mut kernel, _rx) = kernel(&exec);

    kernel.register_cells(vec![
        cell(3, "d", &["d"], &["b", "c"]),
        cell(1, "b", &["b"], &["a"]),
        cell(2, "c", &["c"], &["a"]),
        cell(0, "a", &["a"], &[]),
    ]);
    let report = kernel.run_until_idle().await;

    let position = |id: CellId| report.executed.iter().position(|c| *c == id).unwrap();
    assert_eq!(report.executed.len(), 4);
    assert!(position(A) < position(B));
    assert!(position(A) < position(C));
    assert!(position(B) < position(D));
    assert!(position(C) < position(D));
    // b and c are independent: registration order breaks the tie
    assert!(position(B) < position(C));
    assert_eq!(kernel.value("d"), Some(json!(112)));
}

#[tokio::test]
async fn test_rerun_reaches_only_descendants() {
    let exec = StubExecutor::default();
    exec.on("a", |_| Ok(CellOutput::new().bind("a", json!(1))))
        .on("b", |r| Ok(CellOutput::new().bind("b", json!(int(r, "a") + 1))))
        .on("c", |_| Ok(CellOutput::new().bind("c", json!(0))));
    let (mut kernel, _rx) = kernel(&exec);

    kernel.register_cells(vec![
        cell(0, "a", &["a"], &[]),
        cell(1, "b", &["b"], &["a"]),
        cell(2, "c", &["c"], &[]),
    ]);
    kernel.run_until_idle().await;
    exec.clear_calls();

    kernel.run_cells([A]).unwrap();
    let report = kernel.run_until_idle().await;
    assert_eq!(report.touched(), [A, B].into_iter().collect());
    assert!(!exec.calls().contains(&C));
}

#[tokio::test]
async fn test_cycle_blocks_both_cells() {
    let exec = StubExecutor::default();
    exec.on("x", |r| Ok(CellOutput::new().bind("x", json!(int(r, "y")))))
        .on("y", |r| Ok(CellOutput::new().bind("y", json!(int(r, "x")))))
        .on("z", |_| Ok(CellOutput::new().bind("z", json!(1))));
    let (mut kernel, _rx) = kernel(&exec);

    kernel.register_cells(vec![
        cell(0, "x", &["x"], &["y"]),
        cell(1, "y", &["y"], &["x"]),
        cell(2, "z", &["z"], &[]),
    ]);
    let report = kernel.run_until_idle().await;

    assert_eq!(report.blocked, vec![A, B]);
    assert_eq!(report.executed, vec![C]);
    assert_eq!(exec.calls(), vec![C]);
    for id in [A, B] {
        assert_eq!(kernel.status(id), Some(CellStatus::Error));
        assert_eq!(
            kernel.cell_error(id),
            Some(&CellError::Cycle { cycle: vec![A, B] })
        );
    }
}

#[tokio::test]
async fn test_affected_closure_is_stable() {
    let exec = StubExecutor::default();
    let (mut kernel, _rx) = kernel(&exec);
    kernel.register_cells(vec![
        cell(0, "a", &["a"], &[]),
        cell(1, "b", &["b"], &["a"]),
        cell(2, "c", &["c"], &["b"]),
        cell(3, "d", &["d"], &[]),
    ]);

    let changed = ["a".to_string()].into_iter().collect();
    let first = kernel.graph().affected_by(&changed);
    let second = kernel.graph().affected_by(&changed);
    assert_eq!(first, second);
    assert_eq!(first, [B, C].into_iter().collect());
}

// =============================================================================
// Errors
// =============================================================================

#[tokio::test]
async fn test_failure_marks_descendants_stale() {
    let exec = StubExecutor::default();
    exec.on("boom", |_| Err(CellFailure::new("division by zero")))
        .on("b", |r| Ok(CellOutput::new().bind("b", json!(int(r, "a")))))
        .on("c", |_| Ok(CellOutput::new().bind("c", json!(3))))
        .on("a", |_| Ok(CellOutput::new().bind("a", json!(7))));
    let (mut kernel, mut rx) = kernel(&exec);

    kernel.register_cells(vec![
        cell(0, "boom", &["a"], &[]),
        cell(1, "b", &["b"], &["a"]),
        cell(2, "c", &["c"], &[]),
    ]);
    let report = kernel.run_until_idle().await;

    assert_eq!(report.failed, vec![A]);
    assert_eq!(report.skipped, vec![B]);
    assert!(report.executed.contains(&C));
    assert_eq!(kernel.status(A), Some(CellStatus::Error));
    assert_eq!(kernel.status(B), Some(CellStatus::Stale));
    assert_eq!(
        kernel.cell_error(B),
        Some(&CellError::AncestorFailed { ancestor: A })
    );
    assert!(!exec.calls().contains(&B));

    let errors: Vec<KernelMessage> = drain(&mut rx)
        .into_iter()
        .filter(|m| matches!(m, KernelMessage::CellError { .. }))
        .collect();
    assert_eq!(errors.len(), 2);

    // fixing the failing cell brings the descendant back
    kernel.register_cells(vec![cell(0, "a", &["a"], &[])]);
    kernel.run_until_idle().await;
    assert_eq!(kernel.status(B), Some(CellStatus::Idle));
    assert_eq!(kernel.value("b"), Some(json!(7)));
    assert!(kernel.cell_error(B).is_none());
}

#[tokio::test]
async fn test_multiple_definition_blocks_only_offender() {
    let exec = StubExecutor::default();
    exec.on("x1", |_| Ok(CellOutput::new().bind("x", json!(1))))
        .on("x2", |_| Ok(CellOutput::new().bind("x", json!(2))))
        .on("y", |r| Ok(CellOutput::new().bind("y", json!(int(r, "x") * 10))))
        .on("z", |_| Ok(CellOutput::new().bind("z", json!(0))));
    let (mut kernel, _rx) = kernel(&exec);

    kernel.register_cells(vec![
        cell(0, "x1", &["x"], &[]),
        cell(1, "x2", &["x"], &[]),
        cell(2, "y", &["y"], &["x"]),
        cell(3, "z", &["z"], &[]),
    ]);
    let report = kernel.run_until_idle().await;

    assert!(kernel.is_parked(B));
    assert_eq!(
        kernel.cell_error(B),
        Some(&CellError::MultipleDefinition {
            name: "x".to_string(),
            cells: vec![A],
        })
    );
    assert_eq!(report.executed, vec![A, C, D]);
    assert_eq!(kernel.value("y"), Some(json!(10)));

    // once the first definer goes away the parked cell takes over
    kernel.delete_cell(A).unwrap();
    assert!(!kernel.is_parked(B));
    let report = kernel.run_until_idle().await;
    assert_eq!(report.executed, vec![B, C]);
    assert_eq!(kernel.value("y"), Some(json!(20)));
}

#[tokio::test]
async fn test_delete_reports_dangling_refs() {
    let exec = StubExecutor::default();
    exec.on("a", |_| Ok(CellOutput::new().bind("a", json!(1))))
        .on("b", |r| Ok(CellOutput::new().bind("b", json!(int(r, "a")))));
    let (mut kernel, mut rx) = kernel(&exec);

    kernel.register_cells(vec![cell(0, "a", &["a"], &[]), cell(1, "b", &["b"], &["a"])]);
    kernel.run_until_idle().await;
    drain(&mut rx);

    kernel.delete_cell(A).unwrap();
    let messages = drain(&mut rx);
    assert!(messages.contains(&KernelMessage::DanglingRefs {
        cell: B,
        names: vec!["a".to_string()],
    }));
    assert!(messages.contains(&KernelMessage::CellDeleted { cell: A }));
    assert!(kernel.graph().contains(B));
    assert_eq!(kernel.status(B), Some(CellStatus::Stale));
    assert_eq!(kernel.value("a"), None);
}

// =============================================================================
// Caching
// =============================================================================

#[tokio::test]
async fn test_unchanged_inputs_are_served_from_cache() {
    let exec = StubExecutor::default();
    exec.on("x = 1", |_| Ok(CellOutput::new().bind("x", json!(1))))
        .on("x = 0 + 1", |_| Ok(CellOutput::new().bind("x", json!(1))))
        .on("y", |r| {
            Ok(CellOutput::new()
                .bind("y", json!(int(r, "x") + 1))
                .with_display(json!("y computed")))
        });
    let (mut kernel, _rx) = kernel(&exec);

    kernel.register_cells(vec![cell(0, "x = 1", &["x"], &[]), cell(1, "y", &["y"], &["x"])]);
    kernel.run_until_idle().await;
    exec.clear_calls();

    // new code, same value: the dependent's code and inputs are unchanged
    kernel.register_cells(vec![cell(0, "x = 0 + 1", &["x"], &[])]);
    let report = kernel.run_until_idle().await;

    assert_eq!(report.executed, vec![A]);
    assert_eq!(report.cached, vec![B]);
    assert_eq!(exec.calls(), vec![A]);
    assert_eq!(kernel.value("y"), Some(json!(2)));
}

#[tokio::test]
async fn test_explicit_run_bypasses_cache() {
    let exec = StubExecutor::default();
    exec.on("x", |_| Ok(CellOutput::new().bind("x", json!(1))));
    let (mut kernel, _rx) = kernel(&exec);

    kernel.register_cells(vec![cell(0, "x", &["x"], &[])]);
    kernel.run_until_idle().await;

    kernel.run_cells([A]).unwrap();
    let report = kernel.run_until_idle().await;
    assert_eq!(report.executed, vec![A]);
    assert_eq!(exec.calls(), vec![A, A]);
}

#[tokio::test]
async fn test_cells_with_side_effects_are_not_cached() {
    let exec = StubExecutor::default();
    exec.on("noisy", |r| {
        r.runtime.record_effect("wrote to stdout")?;
        Ok(CellOutput::new().bind("n", json!(1)))
    })
    .on("m", |r| Ok(CellOutput::new().bind("m", json!(int(r, "n")))));
    let (mut kernel, _rx) = kernel(&exec);

    kernel.register_cells(vec![cell(0, "noisy", &["n"], &[]), cell(1, "m", &["m"], &["n"])]);
    kernel.run_until_idle().await;

    // only the pure reader was stored
    assert_eq!(kernel.cache().len(), 1);
    kernel.delete_cell(B).unwrap();
    assert!(kernel.cache().is_empty());
}

#[tokio::test]
async fn test_cache_survives_restart() {
    let temp = TempDir::new().unwrap();
    let mut cfg = config();
    cfg.cache.persist_path = Some(temp.path().join("cache.bin"));

    let exec = StubExecutor::default();
    exec.on("x", |_| Ok(CellOutput::new().bind("x", json!(41))))
        .on("y", |r| Ok(CellOutput::new().bind("y", json!(int(r, "x") + 1))));
    let cells = || vec![cell(0, "x", &["x"], &[]), cell(1, "y", &["y"], &["x"])];

    {
        let exec = exec.clone();
        let (mut first, _rx) =
            Kernel::new(cfg.clone(), move |r: CellRequest| exec.run(r)).unwrap();
        first.register_cells(cells());
        first.run_until_idle().await;
        assert!(first.save_cache().unwrap());
    }
    exec.clear_calls();

    let runner = exec.clone();
    let (mut second, _rx) = Kernel::new(cfg, move |r: CellRequest| runner.run(r)).unwrap();
    second.register_cells(cells());
    let report = second.run_until_idle().await;

    assert_eq!(report.cached, vec![A, B]);
    assert!(exec.calls().is_empty());
    assert_eq!(second.value("y"), Some(json!(42)));
}

/// Environment where a decorator closes over a mutable registry.
struct DecoratedEnv {
    calls: Vec<&'static str>,
}

impl UnitEnvironment for DecoratedEnv {
    fn resolve(&self, name: &str) -> Option<Resolved> {
        match name {
            "registry" => Some(Resolved::Impure {
                reason: "mutable registry".into(),
            }),
            "np" => Some(Resolved::Module(ModuleRef::new("numpy"))),
            _ => None,
        }
    }

    fn trace(&self, unit: &CacheUnit) -> Option<ExecutionTrace> {
        let mut trace = ExecutionTrace::new();
        trace.record_import(&ModuleRef::new("numpy"));
        for call in &self.calls {
            trace.record_call(*call, &json!([unit.name]), &json!(call.len()));
        }
        Some(trace)
    }
}

#[test]
fn test_impure_closure_falls_back_to_execution_path() {
    let cache = CacheEngine::new();
    let unit = CacheUnit::new("decorated", "@register\ndef f(x): return np.sum(x)")
        .closing_over(["registry", "np"]);

    let first = cache
        .identify(&unit, &DecoratedEnv { calls: vec!["register"] })
        .unwrap();
    let second = cache
        .identify(&unit, &DecoratedEnv { calls: vec!["register", "audit"] })
        .unwrap();

    assert!(matches!(first, HashStrategy::ExecutionPath(_)));
    assert!(matches!(second, HashStrategy::ExecutionPath(_)));
    assert_ne!(first.digest(), second.digest());
}

// =============================================================================
// UI elements, models and state
// =============================================================================

#[tokio::test]
async fn test_nested_element_update_projects_patch() {
    let exec = StubExecutor::default();
    exec.on("form", |r| {
        let rt = &r.runtime;
        let outer = rt.create_element(ElementKind::Array, json!([]))?;
        let row = rt.create_child_element(&outer, Lens::Index(2), ElementKind::Array, json!([]))?;
        let form = rt.create_child_element(&row, Lens::Index(1), ElementKind::Batch, json!({}))?;
        rt.create_child_element(&form, Lens::Key("x".into()), ElementKind::leaf("slider"), json!(1))?;
        rt.create_child_element(&form, Lens::Key("y".into()), ElementKind::leaf("slider"), json!(0))?;
        Ok(CellOutput::new().bind("grid", Binding::Element(outer)))
    })
    .on("read", |r| {
        let Some(Binding::Element(id)) = r.input("grid") else {
            return Err(CellFailure::new("grid is not an element"));
        };
        let value = r.runtime.element_value(id).unwrap_or(Value::Null);
        Ok(CellOutput::new().bind("picked", value[2][1]["x"].clone()))
    });
    let (mut kernel, mut rx) = kernel(&exec);

    kernel.register_cells(vec![
        cell(0, "form", &["grid"], &[]),
        cell(1, "read", &["picked"], &["grid"]),
    ]);
    kernel.run_until_idle().await;
    assert_eq!(kernel.value("picked"), Some(json!(1)));
    drain(&mut rx);
    exec.clear_calls();

    let leaf = tessera_core::ElementId::derive(A, 3);
    kernel.set_element_value(&leaf, json!(5)).unwrap();
    let messages = drain(&mut rx);
    assert!(messages.contains(&KernelMessage::ElementValue {
        element: tessera_core::ElementId::derive(A, 0),
        patch: json!({"2": {"1": {"x": 5}}}),
    }));

    let report = kernel.run_until_idle().await;
    assert_eq!(report.executed, vec![B]);
    assert_eq!(kernel.value("picked"), Some(json!(5)));
}

#[tokio::test]
async fn test_observer_write_does_not_rerun_owner() {
    let exec = StubExecutor::default();
    exec.on("widget", |r| {
        let rt = &r.runtime;
        let count = rt.create_state(json!(0))?;
        let model = ModelId::new("slider-model");
        rt.bind_model(model.clone())?;
        rt.observe(model.clone(), move |rt, patch| {
            rt.set_state(count, patch["value"].clone())
        })?;
        Ok(CellOutput::new()
            .bind("count", Binding::State(count))
            .bind("slider", Binding::Model(model)))
    })
    .on("double", |r| {
        let Some(Binding::State(id)) = r.input("count") else {
            return Err(CellFailure::new("count is not a state"));
        };
        let n = r.runtime.get_state(*id).and_then(|v| v.as_i64()).unwrap_or_default();
        Ok(CellOutput::new().bind("doubled", json!(n * 2)))
    });
    let (mut kernel, _rx) = kernel(&exec);

    kernel.register_cells(vec![
        cell(0, "widget", &["count", "slider"], &["count"]),
        cell(1, "double", &["doubled"], &["count"]),
    ]);
    kernel.run_until_idle().await;
    exec.clear_calls();

    kernel
        .model_update(&ModelId::new("slider-model"), json!({"value": 21}))
        .unwrap();
    let report = kernel.run_until_idle().await;

    assert_eq!(report.executed, vec![B]);
    assert_eq!(exec.calls(), vec![B]);
    assert_eq!(kernel.value("doubled"), Some(json!(42)));
}

#[tokio::test]
async fn test_observer_write_skips_owner_reading_the_state() {
    let exec = StubExecutor::default();
    exec.on("make", |r| {
        let id = r.runtime.create_state(json!(0))?;
        Ok(CellOutput::new().bind("count", Binding::State(id)))
    })
    .on("widget", |r| {
        let Some(Binding::State(id)) = r.input("count") else {
            return Err(CellFailure::new("count is not a state"));
        };
        let count = *id;
        let model = ModelId::new("slider-model");
        r.runtime.bind_model(model.clone())?;
        r.runtime.observe(model.clone(), move |rt, patch| {
            rt.set_state(count, patch["value"].clone())
        })?;
        Ok(CellOutput::new().bind("slider", Binding::Model(model)))
    })
    .on("double", |r| {
        let Some(Binding::State(id)) = r.input("count") else {
            return Err(CellFailure::new("count is not a state"));
        };
        let n = r.runtime.get_state(*id).and_then(|v| v.as_i64()).unwrap_or_default();
        Ok(CellOutput::new().bind("doubled", json!(n * 2)))
    });
    let (mut kernel, _rx) = kernel(&exec);

    // the widget cell reads the state its observer writes
    kernel.register_cells(vec![
        cell(0, "make", &["count"], &[]),
        cell(1, "widget", &["slider"], &["count"]),
        cell(2, "double", &["doubled"], &["count"]),
    ]);
    kernel.run_until_idle().await;
    assert_eq!(exec.calls(), vec![A, B, C]);
    exec.clear_calls();

    kernel
        .model_update(&ModelId::new("slider-model"), json!({"value": 21}))
        .unwrap();
    let report = kernel.run_until_idle().await;

    assert_eq!(report.executed, vec![C]);
    assert_eq!(exec.calls(), vec![C]);
    assert_eq!(kernel.value("doubled"), Some(json!(42)));
}

#[tokio::test]
async fn test_model_reader_reruns_but_owner_does_not() {
    let exec = StubExecutor::default();
    exec.on("widget", |r| {
        let model = ModelId::new("picker");
        r.runtime.bind_model(model.clone())?;
        r.runtime.observe(model.clone(), |_, _| Ok(()))?;
        Ok(CellOutput::new().bind("picker", Binding::Model(model)))
    })
    .on("show", |_| Ok(CellOutput::new().bind("shown", json!(true))));
    let (mut kernel, _rx) = kernel(&exec);

    kernel.register_cells(vec![
        cell(0, "widget", &["picker"], &[]),
        cell(1, "show", &["shown"], &["picker"]),
    ]);
    kernel.run_until_idle().await;
    exec.clear_calls();

    kernel.model_update(&ModelId::new("picker"), json!({"index": 2})).unwrap();
    kernel.run_until_idle().await;

    assert_eq!(exec.calls(), vec![B]);
}

#[tokio::test]
async fn test_external_state_write_reruns_readers() {
    let exec = StubExecutor::default();
    exec.on("make", |r| {
        let id = r.runtime.create_state(json!("draft"))?;
        Ok(CellOutput::new().bind("title", Binding::State(id)))
    })
    .on("show", |r| {
        let Some(Binding::State(id)) = r.input("title") else {
            return Err(CellFailure::new("title is not a state"));
        };
        Ok(CellOutput::new().bind("shown", r.runtime.get_state(*id).unwrap_or(Value::Null)))
    });
    let (mut kernel, _rx) = kernel(&exec);

    kernel.register_cells(vec![
        cell(0, "make", &["title"], &[]),
        cell(1, "show", &["shown"], &["title"]),
    ]);
    kernel.run_until_idle().await;

    let Some(Binding::State(id)) = kernel.binding("title") else {
        panic!("title should be bound to a state");
    };
    kernel.handle().set_state(id, json!("final"));
    let report = kernel.run_until_idle().await;

    assert_eq!(report.executed, vec![B]);
    assert_eq!(kernel.value("shown"), Some(json!("final")));
}

#[tokio::test]
async fn test_write_through_runtime_handle_is_picked_up() {
    let exec = StubExecutor::default();
    exec.on("make", |r| {
        let id = r.runtime.create_state(json!(1))?;
        Ok(CellOutput::new().bind("level", Binding::State(id)))
    })
    .on("show", |r| {
        let Some(Binding::State(id)) = r.input("level") else {
            return Err(CellFailure::new("level is not a state"));
        };
        Ok(CellOutput::new().bind("shown", r.runtime.get_state(*id).unwrap_or(Value::Null)))
    });
    let (mut kernel, _rx) = kernel(&exec);
    kernel.register_cells(vec![
        cell(0, "make", &["level"], &[]),
        cell(1, "show", &["shown"], &["level"]),
    ]);
    kernel.run_until_idle().await;
    assert_eq!(kernel.runtime().state_count(), 1);

    let Some(Binding::State(id)) = kernel.binding("level") else {
        panic!("level should be bound to a state");
    };
    let runtime = kernel.runtime().clone();
    std::thread::spawn(move || runtime.set_state(id, json!(9)))
        .join()
        .unwrap()
        .unwrap();

    let report = kernel.run_until_idle().await;
    assert_eq!(report.executed, vec![B]);
    assert_eq!(kernel.value("shown"), Some(json!(9)));
}

// =============================================================================
// Watched files
// =============================================================================

#[tokio::test]
async fn test_watched_file_is_read_downstream() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("input.txt");
    std::fs::write(&path, "first").unwrap();

    let exec = StubExecutor::default();
    let watched = path.clone();
    exec.on("open", move |r| {
        let file = r.runtime.watch_file(&watched)?;
        let guarded = file.read_text().is_err();
        Ok(CellOutput::new()
            .bind("file", Binding::Watch(file.id()))
            .bind("guarded", json!(guarded)))
    })
    .on("read", |r| {
        let Some(Binding::Watch(id)) = r.input("file") else {
            return Err(CellFailure::new("file is not watched"));
        };
        let file = r
            .runtime
            .watched_file(*id)
            .ok_or_else(|| CellFailure::new("handle is gone"))?;
        Ok(CellOutput::new().bind("contents", json!(file.read_text()?)))
    });
    let (mut kernel, _rx) = kernel(&exec);

    kernel.register_cells(vec![
        cell(0, "open", &["file", "guarded"], &[]),
        cell(1, "read", &["contents"], &["file"]),
    ]);
    kernel.run_until_idle().await;
    assert_eq!(kernel.value("guarded"), Some(json!(true)));
    assert_eq!(kernel.value("contents"), Some(json!("first")));
    exec.clear_calls();

    std::fs::write(&path, "second").unwrap();
    let Some(Binding::Watch(id)) = kernel.binding("file") else {
        panic!("file should be bound to a watch handle");
    };
    kernel.handle().send(tessera_core::KernelEvent::WatchTriggered(id));
    let report = kernel.run_until_idle().await;

    assert_eq!(report.executed, vec![B]);
    assert_eq!(kernel.value("contents"), Some(json!("second")));
}

// =============================================================================
// Completion and isolation
// =============================================================================

#[tokio::test]
async fn test_only_latest_completion_is_answered() {
    let exec = StubExecutor::default();
    exec.on("data", |_| {
        Ok(CellOutput::new()
            .bind("data", json!([1, 2]))
            .bind("df", json!({})))
    });
    let (mut kernel, mut rx) = kernel(&exec);
    kernel.register_cells(vec![cell(0, "data", &["data", "df"], &[])]);
    kernel.run_until_idle().await;
    drain(&mut rx);

    let handle = kernel.handle();
    handle.complete(1, "x");
    handle.complete(2, "da");
    handle.complete(3, "d");
    kernel.run_until_idle().await;

    let completions: Vec<KernelMessage> = drain(&mut rx)
        .into_iter()
        .filter(|m| matches!(m, KernelMessage::Completion { .. }))
        .collect();
    assert_eq!(
        completions,
        vec![KernelMessage::Completion {
            request: 3,
            names: Some(vec!["data".to_string(), "df".to_string()]),
        }]
    );
}

#[test]
fn test_completion_backs_off_while_kernel_holds_namespace() {
    let exec = StubExecutor::default();
    let (kernel, _rx) = kernel(&exec);
    let worker = kernel.completion_worker();

    let hold = kernel.namespace().hold();
    let answer = std::thread::scope(|s| s.spawn(|| worker.complete("")).join().unwrap());
    assert_eq!(answer, None);
    drop(hold);

    assert_eq!(worker.complete(""), Some(Vec::new()));
}

#[tokio::test]
async fn test_kernels_are_isolated() {
    let left_exec = StubExecutor::default();
    left_exec.on("x", |_| Ok(CellOutput::new().bind("x", json!("left"))));
    let right_exec = StubExecutor::default();
    right_exec
        .on("x", |_| Ok(CellOutput::new().bind("x", json!("right"))))
        .on("z", |_| Ok(CellOutput::new().bind("z", json!(0))));

    let (mut left, mut left_rx) = kernel(&left_exec);
    let (mut right, mut right_rx) = kernel(&right_exec);
    left.register_cells(vec![cell(0, "x", &["x"], &[])]);
    right.register_cells(vec![cell(0, "x", &["x"], &[]), cell(1, "z", &["z"], &[])]);

    left.run_until_idle().await;
    assert_eq!(left.value("x"), Some(json!("left")));
    assert_eq!(right.value("x"), None);
    assert!(right_rx.try_recv().is_err());
    assert!(!drain(&mut left_rx).is_empty());

    right.run_until_idle().await;
    assert_eq!(right.value("x"), Some(json!("right")));
    assert_eq!(left.value("x"), Some(json!("left")));
    assert_eq!(left.graph().len(), 1);
    assert_eq!(right.graph().len(), 2);
}
