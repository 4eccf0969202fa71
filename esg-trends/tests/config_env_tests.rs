//! Environment overrides of the engine configuration
//!
//! Note: Uses serial_test; every test here touches process environment.

use esg_common::config::TomlConfig;
use esg_trends::config::{EngineConfig, ENV_REFRESH_INTERVAL, ENV_STALENESS_CEILING};
use serial_test::serial;
use std::env;

#[test]
#[serial]
fn test_env_overrides_toml() {
    let toml_config = TomlConfig::from_toml_str(
        r#"
        [engine.scheduler]
        refresh_interval_secs = 600

        [engine.fallback]
        staleness_ceiling_secs = 7200
        "#,
    )
    .unwrap();

    env::set_var(ENV_REFRESH_INTERVAL, "42");
    let config = EngineConfig::from_toml(&toml_config);
    env::remove_var(ENV_REFRESH_INTERVAL);

    let config = config.unwrap();
    assert_eq!(config.scheduler.refresh_interval_secs, 42);
    assert_eq!(config.fallback.staleness_ceiling_secs, 7200);
}

#[test]
#[serial]
fn test_unparseable_env_value_is_an_error() {
    env::set_var(ENV_STALENESS_CEILING, "a day");
    let result = EngineConfig::from_toml(&TomlConfig::default());
    env::remove_var(ENV_STALENESS_CEILING);

    assert!(result.is_err());
}

#[test]
#[serial]
fn test_env_value_is_validated() {
    env::set_var(ENV_REFRESH_INTERVAL, "0");
    let result = EngineConfig::from_toml(&TomlConfig::default());
    env::remove_var(ENV_REFRESH_INTERVAL);

    assert!(result.is_err());
}

#[test]
#[serial]
fn test_defaults_without_env_or_file() {
    env::remove_var(ENV_REFRESH_INTERVAL);
    env::remove_var(ENV_STALENESS_CEILING);
    let config = EngineConfig::from_toml(&TomlConfig::default()).unwrap();
    assert_eq!(config, EngineConfig::default());
}
