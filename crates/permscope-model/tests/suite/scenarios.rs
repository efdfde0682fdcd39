use std::collections::BTreeSet;

use permscope_model::{
    classify_domains, pending_domains, solve, Component, ContextSnapshot, PermissionLedger,
    PermissionSet, SearchPolicy, Solution, StackFrame,
};
use pretty_assertions::assert_eq;

fn x() -> PermissionSet {
    PermissionSet::single("X")
}

#[test]
fn only_the_failing_component_can_be_granted_when_nothing_earlier_is_eligible() {
    let a = Component::bundle("A");
    let b = Component::bundle("B");
    let ledger = PermissionLedger::new();
    let domains = vec![Component::Root, a.clone(), b.clone()];

    assert_eq!(pending_domains(&domains, 1, &ledger, &x()), vec![1, 2]);
    let privileged = classify_domains(&domains, 1, &ledger, &x(), |idx| Some(idx == 2));
    let snapshot = ContextSnapshot::new(
        x(),
        domains,
        1,
        privileged,
        vec![
            StackFrame::new(Component::Root, "java.lang.Thread.run(Thread.java:833)"),
            StackFrame::new(a.clone(), "a.Worker.run(Worker.java:12)"),
            StackFrame::new(b.clone(), "b.Service.call(Service.java:40)"),
        ],
    );

    let solutions = solve(&snapshot, SearchPolicy::default());
    assert_eq!(
        solutions,
        vec![Solution {
            permissions: x(),
            grants: BTreeSet::from([a]),
            elevations: Vec::new(),
        }]
    );
    assert!(ledger.holds(&b, "X"));
}

fn elevation_scenario() -> (ContextSnapshot, StackFrame, Component) {
    let a = Component::bundle("A");
    let b = Component::bundle("B");
    let b_frame = StackFrame::new(b.clone(), "b.Caller.invoke(Caller.java:7)")
        .with_this(0x51)
        .eligible(true);
    let snapshot = ContextSnapshot::new(
        x(),
        vec![Component::Root, b, a.clone()],
        2,
        BTreeSet::new(),
        vec![
            StackFrame::new(Component::Root, "java.lang.Thread.run(Thread.java:833)"),
            b_frame.clone(),
            StackFrame::new(a.clone(), "a.$Proxy12.open(Unknown Source)").with_this(0x52),
        ],
    );
    (snapshot, b_frame, a)
}

#[test]
fn earlier_eligible_privileged_frame_offers_an_elevation() {
    let (snapshot, b_frame, a) = elevation_scenario();
    let solutions = solve(&snapshot, SearchPolicy::default());
    assert_eq!(
        solutions,
        vec![
            Solution {
                permissions: PermissionSet::new(),
                grants: BTreeSet::new(),
                elevations: vec![b_frame],
            },
            Solution {
                permissions: x(),
                grants: BTreeSet::from([a]),
                elevations: Vec::new(),
            },
        ]
    );
}

#[test]
fn every_solution_is_closed_under_reanalysis() {
    let (snapshot, _, _) = elevation_scenario();
    for solution in solve(&snapshot, SearchPolicy::default()) {
        let replayed = snapshot.apply(&solution);
        assert_eq!(solve(&replayed, SearchPolicy::default()), vec![solution]);
    }
}

#[test]
fn already_covered_context_is_not_a_failure() {
    let a = Component::bundle("A");
    let ledger = PermissionLedger::new();
    ledger.grant(&a, "X");
    let domains = vec![Component::Root, a.clone()];
    let privileged = classify_domains(&domains, 1, &ledger, &x(), |_| None);
    let snapshot = ContextSnapshot::new(
        x(),
        domains,
        1,
        privileged,
        vec![StackFrame::new(a, "a.Worker.run(Worker.java:12)")],
    );
    assert_eq!(solve(&snapshot, SearchPolicy::default()), vec![Solution::trivial()]);
}
