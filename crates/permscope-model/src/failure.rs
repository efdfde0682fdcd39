//! Failure records move through `Captured -> Analyzed -> Reported`; each
//! step consumes the previous state.

use std::collections::BTreeSet;

use parking_lot::Mutex;

use crate::{solve, ContextSnapshot, PermissionLedger, PermissionSet, SearchPolicy, Solution};

#[derive(Debug)]
pub struct Captured;

#[derive(Debug)]
pub struct Analyzed {
    solutions: Vec<Solution>,
    applied_to_ledger: bool,
}

#[derive(Debug)]
pub struct Reported {
    solutions: Vec<Solution>,
    applied_to_ledger: bool,
}

/// Where the failure was observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOrigin {
    /// A stack-based permission check that was about to throw.
    AccessCheck { thread: String },
    /// A service event the framework was about to hide from a listener.
    ServiceEvent { listener: String },
}

#[derive(Debug)]
pub struct FailureRecord<S> {
    origin: FailureOrigin,
    snapshot: ContextSnapshot,
    state: S,
}

impl<S> FailureRecord<S> {
    pub fn origin(&self) -> &FailureOrigin {
        &self.origin
    }

    pub fn snapshot(&self) -> &ContextSnapshot {
        &self.snapshot
    }

    pub fn permissions(&self) -> &PermissionSet {
        self.snapshot.permissions()
    }
}

impl FailureRecord<Captured> {
    pub fn new(origin: FailureOrigin, snapshot: ContextSnapshot) -> Self {
        Self {
            origin,
            snapshot,
            state: Captured,
        }
    }

    /// Runs the solution search. A single pure-grant solution is written into
    /// `ledger` before the record is handed back.
    pub fn analyze(self, policy: SearchPolicy, ledger: &PermissionLedger) -> FailureRecord<Analyzed> {
        let solutions = solve(&self.snapshot, policy);
        let mut applied_to_ledger = false;
        if let [only] = solutions.as_slice() {
            if only.is_pure_grant() {
                for component in &only.grants {
                    ledger.grant_all(component, &only.permissions);
                }
                applied_to_ledger = true;
            }
        }
        FailureRecord {
            origin: self.origin,
            snapshot: self.snapshot,
            state: Analyzed {
                solutions,
                applied_to_ledger,
            },
        }
    }
}

impl FailureRecord<Analyzed> {
    pub fn solutions(&self) -> &[Solution] {
        &self.state.solutions
    }

    pub fn applied_to_ledger(&self) -> bool {
        self.state.applied_to_ledger
    }

    /// The single pure-grant solution, if that is all the search produced.
    pub fn sole_grant(&self) -> Option<&Solution> {
        match self.state.solutions.as_slice() {
            [only] if only.is_pure_grant() => Some(only),
            _ => None,
        }
    }

    /// True when the snapshot does not actually fail.
    pub fn is_acceptable(&self) -> bool {
        matches!(self.state.solutions.as_slice(), [only] if only.is_trivial())
    }

    /// Marks the record reported, unless it is acceptable or `history` has
    /// already seen the same solution set.
    pub fn report(self, history: &FailureHistory) -> Option<FailureRecord<Reported>> {
        if self.is_acceptable() || !history.record(&self.state.solutions) {
            return None;
        }
        Some(FailureRecord {
            origin: self.origin,
            snapshot: self.snapshot,
            state: Reported {
                solutions: self.state.solutions,
                applied_to_ledger: self.state.applied_to_ledger,
            },
        })
    }
}

impl FailureRecord<Reported> {
    pub fn solutions(&self) -> &[Solution] {
        &self.state.solutions
    }

    pub fn applied_to_ledger(&self) -> bool {
        self.state.applied_to_ledger
    }
}

/// Solution sets already reported this session.
#[derive(Debug, Default)]
pub struct FailureHistory {
    seen: Mutex<BTreeSet<Vec<Solution>>>,
}

impl FailureHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` the first time a given solution set is recorded.
    pub fn record(&self, solutions: &[Solution]) -> bool {
        self.seen.lock().insert(solutions.to_vec())
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
