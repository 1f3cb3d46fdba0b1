//! Parallel flow tests: isolation, merge order, conflicts and recovery.

use labflow_core::testing::{FnPart, MemoryRun, ScriptedResolver};
use labflow_core::{
    CancelToken, Experiment, ExperimentConfig, ExperimentManager, PartConfig, PartRegistry,
    RunOutcome, TerminationReason, TraceRecorder,
};
use labflow_proto::{
    EventKind, FailureKind, Outputs, PartContext, PartError, PartId, PartOutput, PartResult,
    Resolution, TraceEvent,
};
use proptest::prelude::*;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn build(config: &ExperimentConfig, registry: &PartRegistry) -> Arc<Experiment> {
    Arc::new(Experiment::from_config(config, registry).unwrap())
}

fn emit(
    name: &'static str,
    value: i64,
) -> impl Fn(&PartContext<'_>) -> PartResult + Send + Sync + 'static {
    move |_: &PartContext<'_>| Ok(PartOutput::Outputs(Outputs::new().with(name, value)))
}

fn fan(x: PartConfig, y: PartConfig) -> ExperimentConfig {
    ExperimentConfig::new("fan").part(
        "f",
        PartConfig::new("flow.parallel")
            .member("branchX", x)
            .member("branchY", y)
            .next("quit"),
    )
}

#[test]
fn test_branch_writes_reach_store_only_at_join() {
    let mut registry = PartRegistry::with_builtins();
    let y_done = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&y_done);
    FnPart::register_step(&mut registry, "test.x", emit("x", 1));
    FnPart::register_step(&mut registry, "test.y", move |ctx| {
        thread::sleep(Duration::from_millis(30));
        // Branches never see each other's writes.
        assert!(ctx.store.get("f.x").is_none());
        flag.store(true, Ordering::SeqCst);
        Ok(PartOutput::Outputs(Outputs::new().with("y", 2)))
    });
    let config = fan(
        PartConfig::new("test.x").output("x", "f.x"),
        PartConfig::new("test.y").output("y", "f.y"),
    );

    let mut recorder = TraceRecorder::new(Vec::new());
    let early_writes = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&early_writes);
    let flag = Arc::clone(&y_done);
    recorder.add_observer(move |event: &TraceEvent| {
        if let EventKind::DataWritten { key, .. } = &event.kind
            && !flag.load(Ordering::SeqCst)
        {
            seen.lock().unwrap().push(key.clone());
        }
    });

    let mut manager = ExperimentManager::new(
        build(&config, &registry),
        recorder,
        Box::new(ScriptedResolver::deferring()),
    );
    let outcome = manager.run().unwrap();

    assert_eq!(outcome, RunOutcome::Terminal(TerminationReason::Completed));
    assert!(early_writes.lock().unwrap().is_empty());
    assert_eq!(manager.store().get("f.x"), Some(&json!(1)));
    assert_eq!(manager.store().get("f.y"), Some(&json!(2)));
}

#[test]
fn test_merge_follows_declaration_order() {
    let mut registry = PartRegistry::with_builtins();
    FnPart::register_step(&mut registry, "test.slow", move |_| {
        thread::sleep(Duration::from_millis(40));
        Ok(PartOutput::Outputs(Outputs::new().with("x", 1)))
    });
    FnPart::register_step(&mut registry, "test.fast", emit("y", 2));
    let config = fan(
        PartConfig::new("test.slow").output("x", "f.x"),
        PartConfig::new("test.fast").output("y", "f.y"),
    );
    let run = MemoryRun::start(build(&config, &registry), ScriptedResolver::deferring()).unwrap();

    assert_eq!(run.started(), vec!["f", "f.branchX", "f.branchY"]);
    let parts: Vec<String> = run.events().iter().map(|e| e.part_id.to_string()).collect();
    assert_eq!(
        parts,
        vec!["f", "f.branchX", "f.branchX", "f.branchX", "f.branchY", "f.branchY", "f.branchY", "f"]
    );
    // Branch members always leave the flow.
    assert_eq!(
        run.events()[3].kind,
        EventKind::PartCompleted {
            next: Some(PartId::leave_flow())
        }
    );
}

#[test]
fn test_same_key_conflict_keeps_later_branch() {
    let mut registry = PartRegistry::with_builtins();
    FnPart::register_step(&mut registry, "test.one", move |_| {
        thread::sleep(Duration::from_millis(30));
        Ok(PartOutput::Outputs(Outputs::new().with("v", 1)))
    });
    FnPart::register_step(&mut registry, "test.two", emit("v", 2));
    let config = fan(
        PartConfig::new("test.one").output("v", "f.v"),
        PartConfig::new("test.two").output("v", "f.v"),
    );
    let run = MemoryRun::start(build(&config, &registry), ScriptedResolver::deferring()).unwrap();

    assert_eq!(run.outcome, RunOutcome::Terminal(TerminationReason::Completed));
    assert_eq!(run.store.get("f.v"), Some(&json!(2)));
    assert_eq!(run.log.filter_by_kind("data_written").count(), 2);

    let conflicts: Vec<&TraceEvent> = run.log.filter_by_kind("error_raised").collect();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].part_id, PartId::new("f"));
    let EventKind::ErrorRaised { kind, message } = &conflicts[0].kind else {
        unreachable!();
    };
    assert_eq!(*kind, FailureKind::MergeConflict);
    assert!(message.contains("f.v"));
}

#[test]
fn test_branch_failure_recovered_at_merge() {
    let mut registry = PartRegistry::with_builtins();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let calls = FnPart::register_step(&mut registry, "test.flaky", move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(PartError::execution("pipette jammed"));
        }
        Ok(PartOutput::Outputs(Outputs::new().with("x", 1)))
    });
    FnPart::register_step(&mut registry, "test.y", emit("y", 2));
    let config = fan(
        PartConfig::new("test.flaky").output("x", "f.x"),
        PartConfig::new("test.y").output("y", "f.y"),
    );
    let resolver = ScriptedResolver::new([Resolution::part("f.branchX")]);
    let seen = resolver.seen();
    let run = MemoryRun::start(build(&config, &registry), resolver).unwrap();

    assert_eq!(run.outcome, RunOutcome::Terminal(TerminationReason::Completed));
    assert_eq!(calls.count_for("f.branchX"), 2);
    assert_eq!(run.store.get("f.x"), Some(&json!(1)));
    assert_eq!(run.store.get("f.y"), Some(&json!(2)));

    let request = &seen.all()[0];
    assert_eq!(request.part_id, PartId::new("f.branchX"));
    assert_eq!(request.legal_choices.parts, vec![PartId::new("f.branchX")]);
    assert!(request.legal_choices.leave_flow);
}

#[test]
fn test_deferred_branch_failure_resumes_from_fork() {
    let mut registry = PartRegistry::with_builtins();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    FnPart::register_step(&mut registry, "test.x", emit("x", 1));
    FnPart::register_step(&mut registry, "test.flaky", move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(PartError::execution("plate reader offline"));
        }
        Ok(PartOutput::Outputs(Outputs::new().with("y", 2)))
    });
    let config = fan(
        PartConfig::new("test.x").output("x", "f.x"),
        PartConfig::new("test.flaky").output("y", "f.y"),
    );
    let experiment = build(&config, &registry);

    let first = MemoryRun::start(Arc::clone(&experiment), ScriptedResolver::deferring()).unwrap();
    assert!(matches!(first.outcome, RunOutcome::Suspended(_)));
    // The partial merge stays in the trace but not in the store.
    assert!(first.store.get("f.x").is_none());
    assert_eq!(first.log.filter_by_kind("data_written").count(), 1);

    let resumed =
        MemoryRun::resume(experiment, first.events(), ScriptedResolver::deferring()).unwrap();
    assert_eq!(resumed.outcome, RunOutcome::Terminal(TerminationReason::Completed));
    assert_eq!(resumed.store.get("f.x"), Some(&json!(1)));
    assert_eq!(resumed.store.get("f.y"), Some(&json!(2)));
}

#[test]
fn test_branch_timeout_then_end_abandons_rest() {
    let mut registry = PartRegistry::with_builtins();
    FnPart::register_step(&mut registry, "test.stuck", |_| {
        thread::sleep(Duration::from_secs(3));
        Ok(PartOutput::Outputs(Outputs::new()))
    });
    FnPart::register_step(&mut registry, "test.y", emit("y", 2));
    let config = ExperimentConfig::new("slow").part(
        "f",
        PartConfig::new("flow.parallel")
            .config_value("timeout_seconds", 1)
            .member("stuck", PartConfig::new("test.stuck"))
            .member("quick", PartConfig::new("test.y").output("y", "f.y"))
            .next("quit"),
    );
    let run = MemoryRun::start(
        build(&config, &registry),
        ScriptedResolver::new([Resolution::EndExperiment]),
    )
    .unwrap();

    assert_eq!(
        run.outcome,
        RunOutcome::Terminal(TerminationReason::EndedByResearcher)
    );
    let errors: Vec<(String, FailureKind)> = run
        .log
        .filter_by_kind("error_raised")
        .filter_map(|e| match &e.kind {
            EventKind::ErrorRaised { kind, .. } => Some((e.part_id.to_string(), *kind)),
            _ => None,
        })
        .collect();
    assert_eq!(
        errors,
        vec![
            ("f.stuck".to_string(), FailureKind::PartExecutionFailure),
            ("f.quick".to_string(), FailureKind::Abandoned),
        ]
    );
    assert!(run.store.get("f.y").is_none());
    assert_eq!(
        run.events().last().unwrap().kind,
        EventKind::PartCompleted {
            next: Some(PartId::terminal())
        }
    );
}

#[test]
fn test_interrupt_at_barrier_abandons_branches() {
    let mut registry = PartRegistry::with_builtins();
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    FnPart::register_step(&mut registry, "test.x", move |_| {
        trigger.cancel();
        Ok(PartOutput::Outputs(Outputs::new().with("x", 1)))
    });
    FnPart::register_step(&mut registry, "test.y", emit("y", 2));
    let config = fan(
        PartConfig::new("test.x").output("x", "f.x"),
        PartConfig::new("test.y").output("y", "f.y"),
    );
    let mut manager = ExperimentManager::new(
        build(&config, &registry),
        TraceRecorder::new(Vec::new()),
        Box::new(ScriptedResolver::deferring()),
    )
    .with_cancel_token(cancel);

    assert_eq!(manager.run().unwrap(), RunOutcome::Interrupted);
    assert!(manager.store().is_empty());
}

#[test]
fn test_cancel_wakes_barrier_without_timeout() {
    let mut registry = PartRegistry::with_builtins();
    FnPart::register_step(&mut registry, "test.slow", |_| {
        thread::sleep(Duration::from_secs(3));
        Ok(PartOutput::Outputs(Outputs::new().with("x", 1)))
    });
    FnPart::register_step(&mut registry, "test.y", emit("y", 2));
    let config = fan(
        PartConfig::new("test.slow").output("x", "f.x"),
        PartConfig::new("test.y").output("y", "f.y"),
    );
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    let mut manager = ExperimentManager::new(
        build(&config, &registry),
        TraceRecorder::new(Vec::new()),
        Box::new(ScriptedResolver::deferring()),
    )
    .with_cancel_token(cancel);

    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        trigger.cancel();
    });
    let started = Instant::now();
    assert_eq!(manager.run().unwrap(), RunOutcome::Interrupted);
    // No branch timeout is set, so only the cancel can end the wait early.
    assert!(started.elapsed() < Duration::from_secs(2));
    canceller.join().unwrap();
    assert!(manager.store().is_empty());
}

#[test]
fn test_branch_completing_experiment_ends_after_merge() {
    let mut registry = PartRegistry::with_builtins();
    FnPart::register_step(&mut registry, "test.x", emit("x", 1));
    let config = ExperimentConfig::new("nested")
        .part(
            "f",
            PartConfig::new("flow.parallel")
                .member(
                    "inner",
                    PartConfig::new("flow.standard")
                        .config_value("start_here", "a")
                        .member("a", PartConfig::new("test.x").output("x", "f.a").next("quit")),
                )
                .next("after"),
        )
        .part("after", PartConfig::new("step.dump").next("quit"));
    let run = MemoryRun::start(build(&config, &registry), ScriptedResolver::deferring()).unwrap();

    assert_eq!(run.outcome, RunOutcome::Terminal(TerminationReason::Completed));
    assert_eq!(run.store.get("f.a"), Some(&json!(1)));
    assert!(!run.started().contains(&"after".to_string()));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_disjoint_branches_merge_to_the_same_store(delays in prop::collection::vec(0u64..15, 2..5)) {
        let mut registry = PartRegistry::with_builtins();
        let mut flow = PartConfig::new("flow.parallel").next("quit");
        for (i, delay) in delays.iter().copied().enumerate() {
            let type_name = format!("test.b{i}");
            FnPart::register_step(&mut registry, &type_name, move |_| {
                thread::sleep(Duration::from_millis(delay));
                Ok(PartOutput::Outputs(Outputs::new().with("v", i as i64)))
            });
            flow = flow.member(
                format!("b{i}"),
                PartConfig::new(type_name).output("v", format!("f.b{i}")),
            );
        }
        let config = ExperimentConfig::new("prop").part("f", flow);
        let run = MemoryRun::start(build(&config, &registry), ScriptedResolver::deferring()).unwrap();

        prop_assert_eq!(&run.outcome, &RunOutcome::Terminal(TerminationReason::Completed));
        prop_assert_eq!(run.store.len(), delays.len());
        for i in 0..delays.len() {
            prop_assert_eq!(run.store.get(&format!("f.b{i}")), Some(&json!(i)));
        }
        let expected: Vec<String> = std::iter::once("f".to_string())
            .chain((0..delays.len()).map(|i| format!("f.b{i}")))
            .collect();
        prop_assert_eq!(run.started(), expected);
        prop_assert_eq!(run.log.filter_by_kind("error_raised").count(), 0);
    }
}
