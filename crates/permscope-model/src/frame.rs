use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::Component;

/// Location string reserved for the synthetic privilege-elevation marker.
pub const ELEVATION_MARKER_LOCATION: &str = "<privileged block>";

/// One frame of the captured call stack, classified by owning component.
///
/// Equality, hashing and ordering only look at `(component, location)`; the
/// remote `this` handle and the eligibility flag are advisory.
#[derive(Debug, Clone)]
pub struct StackFrame {
    pub component: Component,
    pub location: String,
    /// Remote id of the frame's receiver, if it has one.
    pub this_object: Option<u64>,
    /// Whether a privilege-elevation boundary may be placed after this frame.
    pub boundary_eligible: bool,
}

impl StackFrame {
    pub fn new(component: Component, location: impl Into<String>) -> Self {
        Self {
            component,
            location: location.into(),
            this_object: None,
            boundary_eligible: false,
        }
    }

    pub fn with_this(mut self, this_object: u64) -> Self {
        self.this_object = Some(this_object);
        self
    }

    pub fn eligible(mut self, eligible: bool) -> Self {
        self.boundary_eligible = eligible;
        self
    }

    /// The synthetic frame standing for "the call below was wrapped in a privileged block".
    pub fn elevation_marker() -> Self {
        Self::new(Component::Root, ELEVATION_MARKER_LOCATION)
    }

    pub fn is_elevation_marker(&self) -> bool {
        self.component.is_root() && self.location == ELEVATION_MARKER_LOCATION
    }
}

impl PartialEq for StackFrame {
    fn eq(&self, other: &Self) -> bool {
        self.component == other.component && self.location == other.location
    }
}

impl Eq for StackFrame {}

impl Hash for StackFrame {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.component.hash(state);
        self.location.hash(state);
    }
}

impl PartialOrd for StackFrame {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StackFrame {
    fn cmp(&self, other: &Self) -> Ordering {
        self.component
            .cmp(&other.component)
            .then_with(|| self.location.cmp(&other.location))
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.component.is_root() {
            f.write_str(&self.location)
        } else {
            write!(f, "{} [{}]", self.location, self.component)
        }
    }
}
