//! Integration tests for configuration management
//!
//! These tests point `TREESYNC_CONFIG_DIR` at a temporary directory, so they
//! run serially.

use serial_test::serial;
use tempfile::TempDir;
use treesync::config::{Config, CONFIG_DIR_ENV, CONFIG_FILE_NAME};
use treesync::diff::ConflictPolicy;

#[tokio::test]
#[serial]
async fn test_config_creation_and_loading() {
    let temp_dir = TempDir::new().unwrap();
    std::env::set_var(CONFIG_DIR_ENV, temp_dir.path());

    let config = Config::init().await.unwrap();
    assert_eq!(config.config_path(), temp_dir.path().join(CONFIG_FILE_NAME));

    let loaded = Config::load().await.unwrap();
    assert_eq!(loaded.client.server_addr, config.client.server_addr);
    assert_eq!(loaded.server.bind_addr, config.server.bind_addr);

    std::env::remove_var(CONFIG_DIR_ENV);
}

#[tokio::test]
#[serial]
async fn test_load_without_init_fails() {
    let temp_dir = TempDir::new().unwrap();
    std::env::set_var(CONFIG_DIR_ENV, temp_dir.path());

    let err = Config::load().await.unwrap_err();
    assert!(err.to_string().contains("treesync init"));

    let fallback = Config::load_or_default(None).await.unwrap();
    assert_eq!(fallback.client.sync_interval_secs, 10);

    std::env::remove_var(CONFIG_DIR_ENV);
}

#[tokio::test]
#[serial]
async fn test_modified_config_survives_reload() {
    let temp_dir = TempDir::new().unwrap();
    std::env::set_var(CONFIG_DIR_ENV, temp_dir.path());

    let mut config = Config::init().await.unwrap();
    config.client.root = temp_dir.path().join("tree");
    config.client.conflict_policy = ConflictPolicy::LocalWins;
    config.client.retry.max_attempts = Some(7);
    config.save().await.unwrap();

    let reloaded = Config::load().await.unwrap();
    assert_eq!(reloaded.client.root, temp_dir.path().join("tree"));
    assert_eq!(reloaded.client.conflict_policy, ConflictPolicy::LocalWins);
    assert_eq!(reloaded.client.retry.max_attempts, Some(7));

    std::env::remove_var(CONFIG_DIR_ENV);
}

#[tokio::test]
async fn test_invalid_file_is_reported() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("broken.toml");
    tokio::fs::write(&path, "[client]\nsync_interval_secs = \"soon\"\n")
        .await
        .unwrap();

    let err = Config::load_from(&path).await.unwrap_err();
    assert!(format!("{:#}", err).contains("Invalid configuration"));
}
