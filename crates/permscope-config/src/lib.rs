//! Configuration for permscope: attach target, session behavior, boundary
//! exclusions and logging, loaded from `permscope.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod logging;

pub use logging::{
    init_tracing, init_tracing_with_config, LogBuffer, LogBufferMakeWriter, LoggingConfig,
};

/// Environment variable that points at an explicit config file.
pub const PERMSCOPE_CONFIG_ENV_VAR: &str = "PERMSCOPE_CONFIG";

/// File name looked up in the working directory when no path is given.
pub const CONFIG_FILE_NAME: &str = "permscope.toml";

/// The only debug transport the tracer can attach through.
pub const SOCKET_TRANSPORT: &str = "dt_socket";

/// Shortest pause between attach attempts.
pub const MIN_RETRY_INTERVAL_SECS: u64 = 1;

/// Class prefixes whose frames may never host a privilege-elevation boundary.
pub const DEFAULT_EXCLUDED_PREFIXES: &[&str] = &[
    "java.",
    "javax.",
    "jdk.",
    "sun.",
    "com.sun.",
    "org.eclipse.osgi.",
    "org.apache.felix.framework.",
];

/// Class-name fragments identifying generated proxies, lambdas and reflective accessors.
pub const DEFAULT_EXCLUDED_MARKERS: &[&str] = &["$Proxy", "$$Lambda", "GeneratedMethodAccessor"];

/// Helper singleton class looked up in the target when none is configured.
pub const DEFAULT_HELPER_CLASS: &str = "permscope.agent.Backdoor";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransportConfig {
    /// Wire transport identifier; only `dt_socket` is supported.
    #[serde(default = "TransportConfig::default_transport")]
    pub transport: String,

    #[serde(default = "TransportConfig::default_host")]
    pub host: String,

    /// Port of the target's JDWP agent. Kept as a string to match the agent's
    /// own `address=` syntax.
    #[serde(default = "TransportConfig::default_port")]
    pub port: String,

    /// Keep retrying the connection instead of failing on the first attempt.
    #[serde(default)]
    pub wait: bool,

    #[serde(default = "TransportConfig::default_wait_timeout_minutes")]
    pub wait_timeout_minutes: u64,

    /// Pause between attach attempts; values below one second count as one.
    #[serde(default = "TransportConfig::default_retry_interval_secs")]
    pub retry_interval_secs: u64,
}

impl TransportConfig {
    fn default_transport() -> String {
        SOCKET_TRANSPORT.to_owned()
    }

    fn default_host() -> String {
        "localhost".to_owned()
    }

    fn default_port() -> String {
        "8000".to_owned()
    }

    fn default_wait_timeout_minutes() -> u64 {
        5
    }

    fn default_retry_interval_secs() -> u64 {
        30
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_minutes.saturating_mul(60))
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs.max(MIN_RETRY_INTERVAL_SECS))
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            transport: Self::default_transport(),
            host: Self::default_host(),
            port: Self::default_port(),
            wait: false,
            wait_timeout_minutes: Self::default_wait_timeout_minutes(),
            retry_interval_secs: Self::default_retry_interval_secs(),
        }
    }
}

/// How grant blocks are rendered in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportMode {
    /// Modular runtime: one block may name several bundles.
    Modular,
    /// Plain runtime: one `grant codeBase` block per component.
    Classic,
}

impl Default for ReportMode {
    fn default() -> Self {
        Self::Modular
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Keep tracing after the first reported failure.
    #[serde(default = "SessionConfig::default_continuous")]
    pub continuous: bool,

    /// Push single pure-grant solutions into the live target through the helper.
    #[serde(default)]
    pub auto_apply: bool,

    /// Watch service-event permission checks of the modular framework.
    #[serde(default)]
    pub monitor_services: bool,

    /// Offer privilege-elevation solutions. Administrative mode turns this off.
    #[serde(default = "SessionConfig::default_allow_elevation")]
    pub allow_elevation: bool,

    #[serde(default)]
    pub report_mode: ReportMode,

    /// Fully qualified class holding the helper singleton in its static `INSTANCE` field.
    #[serde(default = "SessionConfig::default_helper_class")]
    pub helper_class: String,

    /// Invoke remote methods with `INVOKE_SINGLE_THREADED`.
    ///
    /// Other threads stay frozen during the call; a callee that needs a lock
    /// held by another stopped thread deadlocks.
    #[serde(default = "SessionConfig::default_invoke_single_threaded")]
    pub invoke_single_threaded: bool,
}

impl SessionConfig {
    fn default_continuous() -> bool {
        true
    }

    fn default_allow_elevation() -> bool {
        true
    }

    fn default_helper_class() -> String {
        DEFAULT_HELPER_CLASS.to_owned()
    }

    fn default_invoke_single_threaded() -> bool {
        true
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            continuous: Self::default_continuous(),
            auto_apply: false,
            monitor_services: false,
            allow_elevation: Self::default_allow_elevation(),
            report_mode: ReportMode::default(),
            helper_class: Self::default_helper_class(),
            invoke_single_threaded: Self::default_invoke_single_threaded(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BoundaryConfig {
    /// Declaring-class prefixes that can never host an elevation boundary.
    #[serde(default = "BoundaryConfig::default_excluded_prefixes")]
    pub excluded_prefixes: Vec<String>,

    /// Class-name fragments marking generated code.
    #[serde(default = "BoundaryConfig::default_excluded_markers")]
    pub excluded_markers: Vec<String>,
}

impl BoundaryConfig {
    fn default_excluded_prefixes() -> Vec<String> {
        DEFAULT_EXCLUDED_PREFIXES
            .iter()
            .map(|s| (*s).to_owned())
            .collect()
    }

    fn default_excluded_markers() -> Vec<String> {
        DEFAULT_EXCLUDED_MARKERS
            .iter()
            .map(|s| (*s).to_owned())
            .collect()
    }
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            excluded_prefixes: Self::default_excluded_prefixes(),
            excluded_markers: Self::default_excluded_markers(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
/// Top-level permscope configuration.
///
/// Example `permscope.toml`:
///
/// ```toml
/// [transport]
/// host = "127.0.0.1"
/// port = "5005"
/// wait = true
/// wait_timeout_minutes = 10
///
/// [session]
/// continuous = true
/// auto_apply = false
/// report_mode = "classic"
///
/// [logging]
/// level = "permscope=debug"
/// ```
pub struct PermscopeConfig {
    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub boundary: BoundaryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
    #[error("unsupported transport `{0}`; only `dt_socket` is available")]
    UnsupportedTransport(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // Keep just the message: the default `Display` echoes a source snippet.
        ConfigError::Toml(err.message().to_owned())
    }
}

impl PermscopeConfig {
    /// Load a config file from TOML.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        let config: PermscopeConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transport.transport != SOCKET_TRANSPORT {
            return Err(ConfigError::UnsupportedTransport(
                self.transport.transport.clone(),
            ));
        }
        Ok(())
    }
}

/// Locate the config file: `$PERMSCOPE_CONFIG` first, then `permscope.toml` in `dir`.
pub fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    if let Some(explicit) = std::env::var_os(PERMSCOPE_CONFIG_ENV_VAR) {
        let explicit = PathBuf::from(explicit);
        let explicit = if explicit.is_relative() {
            dir.join(explicit)
        } else {
            explicit
        };
        return explicit.is_file().then_some(explicit);
    }

    let candidate = dir.join(CONFIG_FILE_NAME);
    candidate.is_file().then_some(candidate)
}

/// Load the discovered config, or defaults when there is none.
pub fn load_for_dir(dir: &Path) -> Result<(PermscopeConfig, Option<PathBuf>), ConfigError> {
    match discover_config_path(dir) {
        Some(path) => Ok((PermscopeConfig::load_from_path(&path)?, Some(path))),
        None => Ok((PermscopeConfig::default(), None)),
    }
}
