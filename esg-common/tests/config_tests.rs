//! Integration tests for configuration loading and graceful degradation
//!
//! Note: Uses serial_test to prevent ENV variable race conditions.
//! Tests that manipulate ESG_TRENDS_ROOT are marked with #[serial].

use esg_common::config::{
    load_toml_config, resolve_root_folder, write_toml_config, LoggingConfig, TomlConfig,
    ROOT_FOLDER_ENV,
};
use serial_test::serial;
use std::env;
use std::path::PathBuf;
use tempfile::TempDir;

#[test]
fn test_missing_file_yields_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("absent.toml");

    let config = load_toml_config(Some(&missing)).unwrap();
    assert_eq!(config, TomlConfig::default());
    assert_eq!(config.logging.level, "info");
}

#[test]
fn test_write_then_load_preserves_engine_table() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("nested").join("esg-trends.toml");

    let mut engine = toml::Table::new();
    let mut fallback = toml::Table::new();
    fallback.insert(
        "staleness_ceiling_secs".to_string(),
        toml::Value::Integer(3600),
    );
    engine.insert("fallback".to_string(), toml::Value::Table(fallback));

    let config = TomlConfig {
        root_folder: Some(PathBuf::from("/srv/esg")),
        logging: LoggingConfig {
            level: "warn".to_string(),
            ansi: false,
        },
        engine,
    };

    write_toml_config(&config, &path).unwrap();
    assert!(!path.with_extension("toml.tmp").exists());

    let loaded = load_toml_config(Some(&path)).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn test_unparseable_file_is_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("broken.toml");
    std::fs::write(&path, "[logging\nlevel = ").unwrap();

    assert!(load_toml_config(Some(&path)).is_err());
}

#[test]
#[serial]
fn test_env_overrides_toml_root_folder() {
    env::set_var(ROOT_FOLDER_ENV, "/from/env");
    let toml_config = TomlConfig {
        root_folder: Some(PathBuf::from("/from/toml")),
        ..Default::default()
    };

    let resolved = resolve_root_folder(None, &toml_config);
    env::remove_var(ROOT_FOLDER_ENV);

    assert_eq!(resolved, PathBuf::from("/from/env"));
}

#[test]
#[serial]
fn test_toml_root_folder_used_without_env() {
    env::remove_var(ROOT_FOLDER_ENV);
    let toml_config = TomlConfig {
        root_folder: Some(PathBuf::from("/from/toml")),
        ..Default::default()
    };

    assert_eq!(
        resolve_root_folder(None, &toml_config),
        PathBuf::from("/from/toml")
    );
}

#[test]
#[serial]
fn test_default_root_folder_when_nothing_configured() {
    env::remove_var(ROOT_FOLDER_ENV);
    let resolved = resolve_root_folder(None, &TomlConfig::default());
    assert!(resolved.to_string_lossy().contains("esg"));
}
