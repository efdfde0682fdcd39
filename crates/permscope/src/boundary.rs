use permscope_config::BoundaryConfig;
use permscope_model::Component;

/// Decides which frames may host a privilege-elevation boundary.
#[derive(Debug, Clone)]
pub struct BoundaryPolicy {
    excluded_prefixes: Vec<String>,
    excluded_markers: Vec<String>,
}

impl Default for BoundaryPolicy {
    fn default() -> Self {
        Self::from(&BoundaryConfig::default())
    }
}

impl From<&BoundaryConfig> for BoundaryPolicy {
    fn from(config: &BoundaryConfig) -> Self {
        Self {
            excluded_prefixes: config.excluded_prefixes.clone(),
            excluded_markers: config.excluded_markers.clone(),
        }
    }
}

impl BoundaryPolicy {
    /// Whether code in `class_name` could be wrapped in a privileged block.
    ///
    /// Runtime classes and generated code (proxies, lambdas, reflective
    /// accessors) cannot be edited by the user, and root code never needs it.
    pub fn is_eligible(&self, component: &Component, class_name: &str, this_is_proxy: bool) -> bool {
        !component.is_root()
            && !this_is_proxy
            && !self
                .excluded_prefixes
                .iter()
                .any(|prefix| class_name.starts_with(prefix.as_str()))
            && !self
                .excluded_markers
                .iter()
                .any(|marker| class_name.contains(marker.as_str()))
    }
}
