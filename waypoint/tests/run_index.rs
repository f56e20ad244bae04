use std::time::Duration;

use serde_json::{Map, json};
use waypoint::core::manifest::RunStatus;
use waypoint::io::run_index::{RunFilter, RunIndex};
use waypoint::reconcile::reconcile;
use waypoint::test_support::{
    TestWorkspace, step_completed, step_started, workflow_completed, workflow_started,
    write_events,
};

fn seed(ws: &TestWorkspace) {
    for (workflow, run_id, finished) in [
        ("billing", "run-1", true),
        ("billing", "run-2", false),
        ("reports", "run-3", true),
    ] {
        let run = ws.layout.run(workflow, run_id);
        let mut events = vec![
            workflow_started(&run, Map::new()),
            step_started(&run, "fetch"),
            step_completed(&run, "fetch", json!({"ok": true})),
        ];
        if finished {
            events.push(workflow_completed(&run));
        }
        write_events(&run, &events).expect("journal");
        std::thread::sleep(Duration::from_millis(5));
    }
    reconcile(&ws.layout.run("billing", "run-2"), Duration::ZERO).expect("reconcile");
}

#[test]
fn rebuild_recovers_every_run_with_stable_pages() {
    let ws = TestWorkspace::new().expect("workspace");
    seed(&ws);
    let index = ws.index();
    std::fs::write(index.path(), "not json\n").expect("corrupt index");

    assert_eq!(index.rebuild(&ws.layout).expect("rebuild"), 3);
    let all = RunFilter::default();
    assert_eq!(index.count(&all).expect("count"), 3);

    let first_page = index.list(&all, 0, 2).expect("page 1");
    let second_page = index.list(&all, 2, 2).expect("page 2");
    assert_eq!(first_page.len(), 2);
    assert_eq!(second_page.len(), 1);
    assert_eq!(index.list(&all, 0, 2).expect("page 1 again"), first_page);
    assert_eq!(index.list(&all, 2, 2).expect("page 2 again"), second_page);

    let statuses: Vec<(String, RunStatus)> = first_page
        .iter()
        .chain(&second_page)
        .map(|r| (r.run_id.clone(), r.status))
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("run-1".to_string(), RunStatus::Success),
            ("run-2".to_string(), RunStatus::Crashed),
            ("run-3".to_string(), RunStatus::Success),
        ]
    );
}

#[test]
fn filters_apply_before_pagination() {
    let ws = TestWorkspace::new().expect("workspace");
    seed(&ws);
    let index = RunIndex::for_layout(&ws.layout);
    index.rebuild(&ws.layout).expect("rebuild");

    let billing = RunFilter {
        workflow_id: Some("billing".to_string()),
        status: None,
    };
    assert_eq!(index.count(&billing).expect("count"), 2);
    let crashed = RunFilter {
        workflow_id: None,
        status: Some(RunStatus::Crashed),
    };
    let records = index.list(&crashed, 0, 10).expect("list");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].run_id, "run-2");
}
