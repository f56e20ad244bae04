use waypoint::build::{BuildOptions, Collaborators, load_build_state, run_build};
use waypoint::core::budget::Budgets;
use waypoint::core::build_state::NextAction;
use waypoint::core::types::{BuildOutcome, BuildReason};
use waypoint::test_support::{
    ScriptedExecutor, ScriptedGateRunner, ScriptedPlanner, TestWorkspace, gate,
};

#[test]
fn identical_failures_with_two_iterations_end_stuck() {
    let ws = TestWorkspace::new().expect("workspace");
    let dir = ws.layout.root.join("billing");
    let planner = ScriptedPlanner::default();
    let executor = ScriptedExecutor::default();
    let gates = ScriptedGateRunner::always_failing("validate", "step `fetch` has no handler");
    let agents = Collaborators {
        planner: &planner,
        executor: &executor,
        gates: &gates,
    };

    let report = run_build(
        &dir,
        BuildOptions {
            goal: "fetch invoices".to_string(),
            gates: vec![gate("validate"), gate("dry")],
            budgets: Budgets {
                max_iterations: 2,
                max_minutes: 60,
                doom_loop_threshold: 2,
            },
            ..BuildOptions::default()
        },
        &agents,
    )
    .expect("build");

    assert_eq!(report.outcome, BuildOutcome::Stuck);
    assert_eq!(report.reason, BuildReason::DoomLoop);
    assert_eq!(report.iterations, 2);
    assert_eq!(report.fingerprints.len(), 2);
    assert_eq!(report.fingerprints[0], report.fingerprints[1]);
    // validate then dry, twice.
    assert_eq!(gates.calls(), 4);

    let state = load_build_state(&dir, &report.build_id).expect("state");
    assert_eq!(state.next_action(), NextAction::Finished(report));
}

#[test]
fn changing_failures_run_until_max_iterations() {
    let ws = TestWorkspace::new().expect("workspace");
    let dir = ws.layout.root.join("billing");
    let planner = ScriptedPlanner::default();
    let executor = ScriptedExecutor::default();
    let gates = ScriptedGateRunner::always_failing("validate", "still broken");
    let agents = Collaborators {
        planner: &planner,
        executor: &executor,
        gates: &gates,
    };

    let report = run_build(
        &dir,
        BuildOptions {
            goal: "fetch invoices".to_string(),
            gates: vec![gate("validate")],
            budgets: Budgets {
                max_iterations: 3,
                max_minutes: 60,
                // Disables doom-loop detection.
                doom_loop_threshold: 0,
            },
            ..BuildOptions::default()
        },
        &agents,
    )
    .expect("build");

    assert_eq!(report.outcome, BuildOutcome::Stuck);
    assert_eq!(report.reason, BuildReason::MaxIterations);
    assert_eq!(planner.calls(), 3);
}

#[test]
fn executor_writes_through_the_execute_surface() {
    let ws = TestWorkspace::new().expect("workspace");
    let dir = ws.layout.root.join("billing");
    std::fs::create_dir_all(&dir).expect("mkdir");
    let planner = ScriptedPlanner::default();
    let executor = ScriptedExecutor::writing("workflow.toml", "steps = []\n");
    let gates = ScriptedGateRunner::passing();
    let agents = Collaborators {
        planner: &planner,
        executor: &executor,
        gates: &gates,
    };

    let report = run_build(
        &dir,
        BuildOptions {
            goal: "scaffold".to_string(),
            gates: vec![gate("validate")],
            ..BuildOptions::default()
        },
        &agents,
    )
    .expect("build");
    assert_eq!(report.outcome, BuildOutcome::Success);
    assert_eq!(
        std::fs::read_to_string(dir.join("workflow.toml")).expect("read"),
        "steps = []\n"
    );
}
