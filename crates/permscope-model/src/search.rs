//! Recursive remediation search over a [`ContextSnapshot`].

use std::collections::{BTreeSet, HashSet};

use crate::{Component, ContextSnapshot, Solution};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchPolicy {
    /// Administrative mode turns this off and only grants are proposed.
    pub allow_elevation: bool,
}

impl Default for SearchPolicy {
    fn default() -> Self {
        Self {
            allow_elevation: true,
        }
    }
}

/// Computes every valid solution for `snapshot`, ranked and deduplicated.
///
/// A snapshot that does not fail yields exactly one solution describing the
/// snapshot itself. Branches that grant a component the replay never needed
/// are dropped.
pub fn solve(snapshot: &ContextSnapshot, policy: SearchPolicy) -> Vec<Solution> {
    let mut search = Search {
        policy,
        explored: HashSet::new(),
        found: BTreeSet::new(),
        pruned: 0,
    };
    search.expand(snapshot);
    tracing::trace!(
        target = "permscope.model",
        solutions = search.found.len(),
        explored = search.explored.len(),
        pruned = search.pruned,
        "solution search finished"
    );
    search.found.into_iter().collect()
}

struct Search {
    policy: SearchPolicy,
    explored: HashSet<(BTreeSet<Component>, Vec<usize>)>,
    found: BTreeSet<Solution>,
    pruned: usize,
}

impl Search {
    fn expand(&mut self, snapshot: &ContextSnapshot) {
        let key = (snapshot.granted().clone(), snapshot.elevations().to_vec());
        if !self.explored.insert(key) {
            return;
        }

        let outcome = snapshot.walk();
        let Some(failing) = outcome.failing else {
            if outcome.consumed.len() == snapshot.granted().len() {
                self.found.insert(snapshot.to_solution());
            } else {
                self.pruned += 1;
            }
            return;
        };

        self.expand(&snapshot.with_grant(failing.component.clone()));

        if !self.policy.allow_elevation {
            return;
        }
        let stack = &snapshot.base().stack;
        for (idx, frame) in stack.iter().enumerate().take(failing.base_index) {
            if frame.is_elevation_marker()
                || !frame.boundary_eligible
                || !snapshot.is_privileged(&frame.component)
                || snapshot.elevations().contains(&idx)
            {
                continue;
            }
            self.expand(&snapshot.with_elevation(idx));
        }
    }
}
