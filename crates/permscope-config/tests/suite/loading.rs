use std::time::Duration;

use permscope_config::{ConfigError, PermscopeConfig, ReportMode};
use tempfile::tempdir;

#[test]
fn loads_every_section_from_toml() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("permscope.toml");
    std::fs::write(
        &path,
        r#"
[transport]
host = "10.0.0.5"
port = "5005"
wait = true
wait_timeout_minutes = 2
retry_interval_secs = 1

[session]
continuous = false
auto_apply = true
monitor_services = true
allow_elevation = false
report_mode = "classic"
helper_class = "com.example.Helper"
invoke_single_threaded = false

[boundary]
excluded_prefixes = ["com.vendor."]
excluded_markers = ["$Generated"]

[logging]
level = "debug"
json = true
stderr = false
"#,
    )
    .unwrap();

    let config = PermscopeConfig::load_from_path(&path).unwrap();
    assert_eq!(config.transport.host, "10.0.0.5");
    assert_eq!(config.transport.port, "5005");
    assert!(config.transport.wait);
    assert_eq!(config.transport.wait_timeout(), Duration::from_secs(120));
    assert_eq!(config.transport.retry_interval(), Duration::from_secs(1));
    assert!(!config.session.continuous);
    assert!(config.session.auto_apply);
    assert!(config.session.monitor_services);
    assert!(!config.session.allow_elevation);
    assert_eq!(config.session.report_mode, ReportMode::Classic);
    assert_eq!(config.session.helper_class, "com.example.Helper");
    assert!(!config.session.invoke_single_threaded);
    assert_eq!(config.boundary.excluded_prefixes, vec!["com.vendor.".to_owned()]);
    assert_eq!(config.boundary.excluded_markers, vec!["$Generated".to_owned()]);
    assert_eq!(config.logging.level, "debug");
    assert!(config.logging.json);
    assert!(!config.logging.stderr);
}

#[test]
fn unreadable_path_reports_io_error() {
    let dir = tempdir().unwrap();
    let err = PermscopeConfig::load_from_path(dir.path().join("missing.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
}

#[test]
fn type_errors_surface_as_toml_errors() {
    let err = PermscopeConfig::load_from_str("[transport]\nwait = \"yes\"\n").unwrap_err();
    assert!(matches!(err, ConfigError::Toml(_)));
}
