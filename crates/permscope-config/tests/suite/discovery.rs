use std::ffi::OsString;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use permscope_config::{discover_config_path, load_for_dir, PERMSCOPE_CONFIG_ENV_VAR};
use tempfile::tempdir;

static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Overrides `PERMSCOPE_CONFIG` for one test, serialized against the others.
struct ConfigEnv {
    prev: Option<OsString>,
    _lock: MutexGuard<'static, ()>,
}

impl ConfigEnv {
    fn new(value: Option<&Path>) -> Self {
        let lock = ENV_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let prev = std::env::var_os(PERMSCOPE_CONFIG_ENV_VAR);
        match value {
            Some(value) => std::env::set_var(PERMSCOPE_CONFIG_ENV_VAR, value),
            None => std::env::remove_var(PERMSCOPE_CONFIG_ENV_VAR),
        }
        Self { prev, _lock: lock }
    }
}

impl Drop for ConfigEnv {
    fn drop(&mut self) {
        match self.prev.take() {
            Some(prev) => std::env::set_var(PERMSCOPE_CONFIG_ENV_VAR, prev),
            None => std::env::remove_var(PERMSCOPE_CONFIG_ENV_VAR),
        }
    }
}

#[test]
fn discovers_permscope_toml_in_directory() {
    let _env = ConfigEnv::new(None);

    let dir = tempdir().unwrap();
    let config_path = dir.path().join("permscope.toml");
    std::fs::write(&config_path, "[session]\ncontinuous = false\n").unwrap();

    assert_eq!(discover_config_path(dir.path()), Some(config_path.clone()));
    let (config, path) = load_for_dir(dir.path()).unwrap();
    assert_eq!(path, Some(config_path));
    assert!(!config.session.continuous);
}

#[test]
fn env_var_overrides_directory_lookup() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("permscope.toml"), "[session]\nauto_apply = false\n").unwrap();
    let explicit = dir.path().join("custom.toml");
    std::fs::write(&explicit, "[session]\nauto_apply = true\n").unwrap();
    let _env = ConfigEnv::new(Some(&explicit));

    let (config, path) = load_for_dir(dir.path()).unwrap();
    assert_eq!(path, Some(explicit));
    assert!(config.session.auto_apply);
}

#[test]
fn missing_config_falls_back_to_defaults() {
    let _env = ConfigEnv::new(None);

    let dir = tempdir().unwrap();
    assert_eq!(discover_config_path(dir.path()), None);
    let (config, path) = load_for_dir(dir.path()).unwrap();
    assert!(path.is_none());
    assert_eq!(config, Default::default());
}
