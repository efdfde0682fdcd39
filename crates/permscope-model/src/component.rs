use std::cmp::Ordering;
use std::fmt;

/// Identity of an independently permissioned unit of code in the target.
///
/// Ordered [`Component::Root`] first, then bundles, then raw code sources,
/// each compared lexically. Solution ranking breaks its last tie on this.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Component {
    /// The runtime's own trusted base: no identity, always fully privileged.
    Root,
    /// A modular component, by symbolic name.
    Bundle(String),
    /// A raw code-location string (usually a URL).
    CodeSource(String),
}

impl Component {
    pub fn bundle(name: impl Into<String>) -> Self {
        Self::Bundle(name.into())
    }

    pub fn code_source(location: impl Into<String>) -> Self {
        Self::CodeSource(location.into())
    }

    pub fn is_root(&self) -> bool {
        matches!(self, Self::Root)
    }

    fn kind_rank(&self) -> u8 {
        match self {
            Self::Root => 0,
            Self::Bundle(_) => 1,
            Self::CodeSource(_) => 2,
        }
    }

    /// The identity string, `None` for root.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Root => None,
            Self::Bundle(name) | Self::CodeSource(name) => Some(name),
        }
    }
}

impl Ord for Component {
    fn cmp(&self, other: &Self) -> Ordering {
        self.kind_rank()
            .cmp(&other.kind_rank())
            .then_with(|| self.name().cmp(&other.name()))
    }
}

impl PartialOrd for Component {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root => f.write_str("<root>"),
            Self::Bundle(name) => write!(f, "bundle {name}"),
            Self::CodeSource(location) => f.write_str(location),
        }
    }
}
