use std::collections::BTreeSet;
use std::sync::Arc;

use permscope_model::{
    classify_domains, solve, Component, ContextSnapshot, PermissionLedger, PermissionSet,
    SearchPolicy, StackFrame,
};
use proptest::prelude::*;

fn x() -> PermissionSet {
    PermissionSet::single("X")
}

proptest! {
    #[test]
    fn domains_before_first_lacking_are_privileged(holds in prop::collection::vec(any::<bool>(), 1..8)) {
        let domains: Vec<Component> = (0..holds.len())
            .map(|idx| Component::bundle(format!("c{idx}")))
            .collect();
        let failing = holds.iter().position(|held| !held).unwrap_or(holds.len());
        let ledger = PermissionLedger::new();

        let privileged = classify_domains(&domains, failing, &ledger, &x(), |idx| Some(holds[idx]));
        for component in &domains[..failing] {
            prop_assert!(privileged.contains(component));
        }
        if failing < domains.len() {
            prop_assert!(!privileged.contains(&domains[failing]));
        }

        let snapshot = ContextSnapshot::new(x(), domains.clone(), failing, privileged, Vec::new());
        for component in &domains[..failing] {
            prop_assert!(snapshot.is_privileged(component));
        }
    }

    #[test]
    fn solutions_are_ranked_valid_and_never_over_grant(
        frames in prop::collection::vec((0usize..4, any::<bool>()), 1..7),
        privileged_mask in 0u8..16,
        allow_elevation in any::<bool>(),
    ) {
        let component = |idx: usize| {
            if idx == 0 { Component::Root } else { Component::bundle(format!("c{idx}")) }
        };
        let stack: Vec<StackFrame> = frames
            .iter()
            .enumerate()
            .map(|(pos, (idx, eligible))| {
                StackFrame::new(component(*idx), format!("f{pos}")).eligible(*eligible)
            })
            .collect();
        let privileged: BTreeSet<Component> = (1..4)
            .filter(|idx| privileged_mask & (1 << idx) != 0)
            .map(component)
            .collect();
        let snapshot = ContextSnapshot::new(x(), Vec::new(), 0, privileged, stack);

        let solutions = solve(&snapshot, SearchPolicy { allow_elevation });
        prop_assert!(!solutions.is_empty());
        for pair in solutions.windows(2) {
            prop_assert!(pair[0] < pair[1]);
        }
        for solution in &solutions {
            if !allow_elevation {
                prop_assert!(solution.elevations.is_empty());
            }
            let walked = snapshot.apply(solution).walk();
            prop_assert!(walked.failing.is_none());
            prop_assert_eq!(&walked.consumed, &solution.grants);
        }
    }
}

#[test]
fn concurrent_grant_all_records_the_union() {
    let ledger = Arc::new(PermissionLedger::new());
    let component = Component::bundle("shared");
    let sets: Vec<PermissionSet> = (0..8)
        .map(|w| {
            (0..32)
                .map(|i| format!("p{}", (w * 7 + i) % 48))
                .collect()
        })
        .collect();
    let expected: BTreeSet<String> = sets
        .iter()
        .flat_map(|s| s.iter().map(str::to_owned))
        .collect();

    std::thread::scope(|scope| {
        for set in &sets {
            let ledger = ledger.clone();
            let component = component.clone();
            scope.spawn(move || {
                ledger.grant_all(&component, set);
            });
        }
    });

    let recorded: BTreeSet<String> = ledger
        .granted(&component)
        .iter()
        .map(str::to_owned)
        .collect();
    assert_eq!(recorded, expected);
}
