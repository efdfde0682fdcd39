use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use crate::{Component, PermissionSet, StackFrame};

/// One remediation: grant `permissions` to every component of `grants`, and
/// insert a privilege-elevation boundary after each frame of `elevations`.
///
/// Solutions order ascending by preference: fewer grants, then fewer granted
/// permissions, then fewer elevations, then elevation frames elementwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Solution {
    pub permissions: PermissionSet,
    pub grants: BTreeSet<Component>,
    /// In stack order.
    pub elevations: Vec<StackFrame>,
}

impl Solution {
    /// The solution of a snapshot that does not fail at all.
    pub fn trivial() -> Self {
        Self {
            permissions: PermissionSet::new(),
            grants: BTreeSet::new(),
            elevations: Vec::new(),
        }
    }

    pub fn is_trivial(&self) -> bool {
        self.grants.is_empty() && self.elevations.is_empty()
    }

    /// Grants only, no boundary insertions.
    pub fn is_pure_grant(&self) -> bool {
        self.elevations.is_empty() && !self.grants.is_empty()
    }

    fn granted_permission_count(&self) -> usize {
        if self.grants.is_empty() {
            0
        } else {
            self.permissions.len()
        }
    }
}

impl PartialOrd for Solution {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Solution {
    fn cmp(&self, other: &Self) -> Ordering {
        self.grants
            .len()
            .cmp(&other.grants.len())
            .then_with(|| {
                self.granted_permission_count()
                    .cmp(&other.granted_permission_count())
            })
            .then_with(|| self.elevations.len().cmp(&other.elevations.len()))
            .then_with(|| self.elevations.cmp(&other.elevations))
            .then_with(|| self.grants.cmp(&other.grants))
            .then_with(|| self.permissions.cmp(&other.permissions))
    }
}

impl fmt::Display for Solution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_trivial() {
            return f.write_str("no change needed");
        }
        let mut wrote = false;
        if !self.grants.is_empty() {
            f.write_str("grant ")?;
            for (idx, component) in self.grants.iter().enumerate() {
                if idx > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{component}")?;
            }
            write!(f, " {{{}}}", self.permissions)?;
            wrote = true;
        }
        if !self.elevations.is_empty() {
            if wrote {
                f.write_str("; ")?;
            }
            f.write_str("elevate after ")?;
            for (idx, frame) in self.elevations.iter().enumerate() {
                if idx > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{frame}")?;
            }
        }
        Ok(())
    }
}
