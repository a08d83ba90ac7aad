use std::fs;

use anyhow::Result;
use scanwarden_server::infra::config::{ConfigLoader, ConfigSource, validate};
use tempfile::TempDir;

#[test]
fn toml_file_fills_missing_sections_with_defaults() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("scanwarden.toml");
    fs::write(
        &path,
        r#"
[server]
port = 8443

[engine]
base_url = "http://zap.internal:8090"
api_key = "changeme"

[orchestrator]
max_active_scans = 4
poll_interval_ms = 2000

[orchestrator.retry]
max_attempts = 7
"#,
    )?;

    let (config, source) = ConfigLoader::new()
        .without_env_file()
        .with_config_path(&path)
        .load_base(None, None)?;

    assert_eq!(source, ConfigSource::File(path));
    assert_eq!(config.server.port, 8443);
    assert_eq!(config.server.host, "0.0.0.0");
    assert_eq!(config.engine.api_key.as_deref(), Some("changeme"));
    assert_eq!(config.orchestrator.max_active_scans, 4);
    assert_eq!(config.orchestrator.retry.max_attempts, 7);
    assert!(config.database.url.is_none());

    let warnings = validate(&config)?;
    assert_eq!(warnings.len(), 1, "only the missing database is worth a warning");
    Ok(())
}

#[test]
fn env_path_json_file_is_parsed_by_extension() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("settings.json");
    fs::write(
        &path,
        r#"{"database": {"url": "postgres://scan@localhost/scans", "max_connections": 9}}"#,
    )?;

    let (config, source) = ConfigLoader::new()
        .without_env_file()
        .load_base(Some(path.display().to_string()), Some("{not json".into()))?;

    assert_eq!(source, ConfigSource::EnvPath(path));
    assert_eq!(config.database.max_connections, 9);
    Ok(())
}

#[test]
fn missing_or_malformed_files_are_errors() -> Result<()> {
    let dir = TempDir::new()?;

    let missing = ConfigLoader::new()
        .without_env_file()
        .with_config_path(dir.path().join("absent.toml"))
        .load_base(None, None);
    assert!(missing.is_err());

    let broken = dir.path().join("broken.toml");
    fs::write(&broken, "[server\nport = ")?;
    let parsed = ConfigLoader::new()
        .without_env_file()
        .with_config_path(&broken)
        .load_base(None, None);
    assert!(parsed.is_err());
    Ok(())
}
