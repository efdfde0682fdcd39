//! Check-time context snapshots and the re-derived security walk.
//!
//! A [`ContextSnapshot`] shares an immutable [`SnapshotBase`] through an
//! `Arc`; search branches only carry the components they grant and the stack
//! positions after which they insert an elevation marker.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::{Component, PermissionLedger, PermissionSet, Solution, StackFrame};

#[derive(Debug)]
pub struct SnapshotBase {
    pub permissions: PermissionSet,
    pub domains: Vec<Component>,
    pub failing_index: usize,
    pub privileged: BTreeSet<Component>,
    pub stack: Vec<StackFrame>,
}

#[derive(Debug, Clone)]
pub struct ContextSnapshot {
    base: Arc<SnapshotBase>,
    granted: BTreeSet<Component>,
    /// Base stack indices, ascending, after which a marker is inserted.
    elevations: Vec<usize>,
}

/// The first frame the walk could not pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailingFrame {
    /// Position in the captured stack.
    pub base_index: usize,
    pub component: Component,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkOutcome {
    pub failing: Option<FailingFrame>,
    /// Granted components that some walked frame needed to pass.
    pub consumed: BTreeSet<Component>,
}

impl ContextSnapshot {
    /// Builds a snapshot. Every domain before `failing_index` is added to
    /// `privileged`, whatever the caller passed.
    pub fn new(
        permissions: PermissionSet,
        domains: Vec<Component>,
        failing_index: usize,
        mut privileged: BTreeSet<Component>,
        stack: Vec<StackFrame>,
    ) -> Self {
        let failing_index = failing_index.min(domains.len());
        privileged.extend(domains[..failing_index].iter().cloned());
        privileged.insert(Component::Root);
        Self {
            base: Arc::new(SnapshotBase {
                permissions,
                domains,
                failing_index,
                privileged,
                stack,
            }),
            granted: BTreeSet::new(),
            elevations: Vec::new(),
        }
    }

    pub fn base(&self) -> &SnapshotBase {
        &self.base
    }

    pub fn permissions(&self) -> &PermissionSet {
        &self.base.permissions
    }

    pub fn granted(&self) -> &BTreeSet<Component> {
        &self.granted
    }

    pub fn elevations(&self) -> &[usize] {
        &self.elevations
    }

    pub fn is_privileged(&self, component: &Component) -> bool {
        component.is_root()
            || self.base.privileged.contains(component)
            || self.granted.contains(component)
    }

    pub fn with_grant(&self, component: Component) -> Self {
        let mut next = self.clone();
        next.granted.insert(component);
        next
    }

    /// A variant with a marker inserted right after base stack index `after`.
    pub fn with_elevation(&self, after: usize) -> Self {
        let mut next = self.clone();
        if let Err(pos) = next.elevations.binary_search(&after) {
            next.elevations.insert(pos, after);
        }
        next
    }

    /// Replays `solution` on top of this snapshot's base.
    ///
    /// Elevation frames that no longer appear in the stack are ignored.
    pub fn apply(&self, solution: &Solution) -> Self {
        let mut next = self.clone();
        next.granted.extend(solution.grants.iter().cloned());
        for frame in &solution.elevations {
            let found = self
                .base
                .stack
                .iter()
                .enumerate()
                .find(|(idx, candidate)| *candidate == frame && !next.elevations.contains(idx));
            if let Some((idx, _)) = found {
                next = next.with_elevation(idx);
            }
        }
        next
    }

    /// The stack as the walk sees it, markers included.
    pub fn effective_stack(&self) -> Vec<StackFrame> {
        let mut out = Vec::with_capacity(self.base.stack.len() + self.elevations.len());
        for (idx, frame) in self.base.stack.iter().enumerate() {
            out.push(frame.clone());
            if self.elevations.binary_search(&idx).is_ok() {
                out.push(StackFrame::elevation_marker());
            }
        }
        out
    }

    /// Walks frames front to back the way the runtime's check loop does.
    ///
    /// The walk stops at the first marker (real or inserted) or at the first
    /// frame whose component is not privileged.
    pub fn walk(&self) -> WalkOutcome {
        let mut consumed = BTreeSet::new();
        for (base_index, frame) in self.base.stack.iter().enumerate() {
            if frame.is_elevation_marker() {
                break;
            }
            let component = &frame.component;
            if !component.is_root() && !self.base.privileged.contains(component) {
                if self.granted.contains(component) {
                    consumed.insert(component.clone());
                } else {
                    return WalkOutcome {
                        failing: Some(FailingFrame {
                            base_index,
                            component: component.clone(),
                        }),
                        consumed,
                    };
                }
            }
            if self.elevations.binary_search(&base_index).is_ok() {
                break;
            }
        }
        WalkOutcome {
            failing: None,
            consumed,
        }
    }

    /// The solution this branch represents, as it stands.
    pub fn to_solution(&self) -> Solution {
        let permissions = if self.granted.is_empty() {
            PermissionSet::new()
        } else {
            self.base.permissions.clone()
        };
        Solution {
            permissions,
            grants: self.granted.clone(),
            elevations: self
                .elevations
                .iter()
                .filter_map(|idx| self.base.stack.get(*idx).cloned())
                .collect(),
        }
    }
}

/// Domain indices that still need a live permission check after the ledger
/// has been consulted.
pub fn pending_domains(
    domains: &[Component],
    failing_index: usize,
    ledger: &PermissionLedger,
    permissions: &PermissionSet,
) -> Vec<usize> {
    domains
        .iter()
        .enumerate()
        .skip(failing_index)
        .filter(|(_, component)| !ledger.holds_all(component, permissions))
        .map(|(idx, _)| idx)
        .collect()
}

/// Classifies the captured domains into the privileged set.
///
/// Domains before `failing_index` are privileged by definition. Later ones
/// are checked against the ledger first and then against `probe`; a
/// positive probe is promoted into the ledger. `probe` returning `None`
/// leaves the domain unresolved.
pub fn classify_domains<F>(
    domains: &[Component],
    failing_index: usize,
    ledger: &PermissionLedger,
    permissions: &PermissionSet,
    mut probe: F,
) -> BTreeSet<Component>
where
    F: FnMut(usize) -> Option<bool>,
{
    let failing_index = failing_index.min(domains.len());
    let mut privileged: BTreeSet<Component> = domains[..failing_index].iter().cloned().collect();
    for (idx, component) in domains.iter().enumerate().skip(failing_index) {
        if ledger.holds_all(component, permissions) {
            privileged.insert(component.clone());
            continue;
        }
        if probe(idx) == Some(true) {
            let added = ledger.grant_all(component, permissions);
            tracing::debug!(
                target = "permscope.model",
                component = %component,
                added,
                "live check passed; promoted to ledger"
            );
            privileged.insert(component.clone());
        }
    }
    privileged
}
