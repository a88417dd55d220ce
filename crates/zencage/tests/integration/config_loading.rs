use zencage::config::{Config, ConfigError};
use zencage::{IsolationPolicy, OverflowPolicy, TimeoutStrategy};

use super::FIXTURES_PATH;

#[test]
fn test_load_valid_config() {
    let path = format!("{}/configs/valid_full.toml", FIXTURES_PATH);
    let config = Config::from_file(&path).expect("Failed to load config");

    assert_eq!(config.unit, "probe-tobuf");
    assert_eq!(config.policy, IsolationPolicy::Process);
    assert_eq!(config.timeout, Some(5.0));
    assert_eq!(config.on_timeout, TimeoutStrategy::Kill);
    assert_eq!(config.overflow, OverflowPolicy::Reject);
    assert_eq!(config.capacities.output, 8192);
    assert_eq!(config.capacities.logs, 1024);
}

#[test]
fn test_load_minimal_config() {
    let path = format!("{}/configs/valid_minimal.toml", FIXTURES_PATH);
    let config = Config::from_file(&path).expect("Failed to load config");

    assert_eq!(config.policy, IsolationPolicy::InProcess);
    assert_eq!(config.unit, "probe");
    assert_eq!(config.timeout, None);
}

#[test]
fn test_load_example_config() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/zencage.example.toml");
    let config = Config::from_file(path).expect("Failed to load example config");
    assert_eq!(config, Config::default());
}

#[test]
fn test_load_invalid_zero_capacity() {
    let path = format!("{}/configs/invalid_zero_capacity.toml", FIXTURES_PATH);
    let result = Config::from_file(&path);
    assert!(matches!(result, Err(ConfigError::Invalid(_))));
}

#[test]
fn test_load_invalid_timeout() {
    let path = format!("{}/configs/invalid_timeout.toml", FIXTURES_PATH);
    let result = Config::from_file(&path);
    assert!(matches!(result, Err(ConfigError::Invalid(_))));
}

#[test]
fn test_load_unknown_strategy() {
    let path = format!("{}/configs/invalid_on_timeout.toml", FIXTURES_PATH);
    let result = Config::from_file(&path);
    assert!(matches!(result, Err(ConfigError::Parse(_))));
}
