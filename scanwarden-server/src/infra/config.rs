//! Server configuration: file or inline JSON, then environment overrides.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, anyhow, bail};
use scanwarden_core::OrchestratorConfig;
use scanwarden_core::engine::ZapEngineConfig;
use serde::{Deserialize, Serialize};
use url::Url;

const CONFIG_PATH_ENV: &str = "SCANWARDEN_CONFIG_PATH";
const CONFIG_JSON_ENV: &str = "SCANWARDEN_CONFIG_JSON";

const DEFAULT_CANDIDATES: &[&str] = &[
    "scanwarden.toml",
    "scanwarden.json",
    "config/scanwarden.toml",
    "config/scanwarden.json",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub engine: ZapEngineConfig,
    pub database: DatabaseConfig,
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Origins allowed by CORS. Empty allows any origin.
    pub cors_allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            cors_allowed_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// PostgreSQL URL. Without one, jobs live in memory only.
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 5,
        }
    }
}

/// Where the configuration came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

/// A non-fatal finding from config validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub source: ConfigSource,
    pub env_file_loaded: bool,
    pub warnings: Vec<ConfigWarning>,
}

/// Environment values that override file settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub server_host: Option<String>,
    pub server_port: Option<String>,
    pub engine_url: Option<String>,
    pub engine_api_key: Option<String>,
    pub database_url: Option<String>,
}

impl EnvOverrides {
    pub fn gather() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        Self {
            server_host: read("SERVER_HOST"),
            server_port: read("SERVER_PORT"),
            engine_url: read("ZAP_API_URL"),
            engine_api_key: read("ZAP_API_KEY"),
            database_url: read("DATABASE_URL"),
        }
    }

    pub fn apply(&self, config: &mut Config) -> anyhow::Result<()> {
        if let Some(host) = &self.server_host {
            config.server.host = host.clone();
        }
        if let Some(port) = &self.server_port {
            config.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("SERVER_PORT is not a port number: {port}"))?;
        }
        if let Some(url) = &self.engine_url {
            config.engine.base_url = url.clone();
        }
        if let Some(key) = &self.engine_api_key {
            config.engine.api_key = Some(key.clone());
        }
        if let Some(url) = &self.database_url {
            config.database.url = Some(url.clone());
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    env_file: Option<PathBuf>,
    skip_env_file: bool,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.env_file = Some(path.into());
        self
    }

    /// Leaves `.env` untouched; used by tests.
    pub fn without_env_file(mut self) -> Self {
        self.skip_env_file = true;
        self
    }

    /// Evaluation order:
    /// 1) `.env` via dotenvy,
    /// 2) an explicit path or `$SCANWARDEN_CONFIG_PATH` (TOML or JSON file),
    /// 3) `$SCANWARDEN_CONFIG_JSON` (inline JSON),
    /// 4) the first default file candidate that exists,
    /// 5) built-in defaults,
    ///
    /// then environment overrides and validation.
    pub fn load(&self) -> anyhow::Result<ConfigLoad> {
        let env_file_loaded = self.load_env_file()?;
        let (mut config, source) = self.load_base(
            env::var(CONFIG_PATH_ENV).ok(),
            env::var(CONFIG_JSON_ENV).ok(),
        )?;
        EnvOverrides::gather().apply(&mut config)?;
        let warnings = validate(&config)?;
        Ok(ConfigLoad {
            config,
            source,
            env_file_loaded,
            warnings,
        })
    }

    fn load_env_file(&self) -> anyhow::Result<bool> {
        if self.skip_env_file {
            return Ok(false);
        }
        let loaded = match &self.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true),
            None => dotenvy::dotenv().map(|_| true),
        };
        match loaded {
            Ok(loaded) => Ok(loaded),
            Err(dotenvy::Error::Io(_)) => Ok(false),
            Err(err) => Err(err).context("failed to parse .env file"),
        }
    }

    pub fn load_base(
        &self,
        env_path: Option<String>,
        env_json: Option<String>,
    ) -> anyhow::Result<(Config, ConfigSource)> {
        if let Some(path) = &self.config_path {
            if !path.exists() {
                bail!("config file {} does not exist", path.display());
            }
            return Ok((load_from_file(path)?, ConfigSource::File(path.clone())));
        }

        if let Some(path_str) = env_path
            && !path_str.trim().is_empty()
        {
            let path = PathBuf::from(path_str);
            let config = load_from_file(&path)?;
            return Ok((config, ConfigSource::EnvPath(path)));
        }

        if let Some(raw) = env_json
            && !raw.trim().is_empty()
        {
            let config = parse_json(&raw)
                .with_context(|| format!("failed to parse {CONFIG_JSON_ENV}"))?;
            return Ok((config, ConfigSource::EnvInline));
        }

        if let Some(path) = find_default_file() {
            let config = load_from_file(&path)?;
            return Ok((config, ConfigSource::File(path)));
        }

        Ok((Config::default(), ConfigSource::Default))
    }
}

pub fn load_from_file(path: &Path) -> anyhow::Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config from {}", path.display()))?;

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => parse_json(&contents)
            .with_context(|| format!("invalid config {}", path.display())),
        Some("toml") | Some("tml") => toml::from_str(&contents)
            .map_err(|err| anyhow!("invalid config {}: {}", path.display(), err)),
        _ => parse_from_str(&contents, &path.display().to_string()),
    }
}

pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<Config> {
    toml::from_str(contents).or_else(|toml_err| {
        serde_json::from_str(contents).map_err(|json_err| {
            anyhow!(
                "failed to parse config {}: toml error: {}; json error: {}",
                origin,
                toml_err,
                json_err
            )
        })
    })
}

pub fn parse_json(raw: &str) -> anyhow::Result<Config> {
    serde_json::from_str(raw).map_err(|err| anyhow!("invalid config json: {err}"))
}

fn find_default_file() -> Option<PathBuf> {
    DEFAULT_CANDIDATES
        .iter()
        .map(Path::new)
        .find(|path| path.exists())
        .map(Path::to_path_buf)
}

/// Rejects settings the server cannot run with and collects warnings for
/// the ones it can but probably should not.
pub fn validate(config: &Config) -> anyhow::Result<Vec<ConfigWarning>> {
    let mut warnings = Vec::new();

    if config.server.port == 0 {
        bail!("server.port must be greater than zero");
    }

    let engine_url = Url::parse(&config.engine.base_url)
        .with_context(|| format!("engine.base_url is not a URL: {}", config.engine.base_url))?;
    if !matches!(engine_url.scheme(), "http" | "https") {
        bail!("engine.base_url must use http or https");
    }
    if config.engine.alert_page_size == 0 {
        bail!("engine.alert_page_size must be at least 1");
    }

    config
        .orchestrator
        .validate()
        .map_err(|err| anyhow!("orchestrator: {err}"))?;

    if let Some(url) = &config.database.url
        && !(url.starts_with("postgres://") || url.starts_with("postgresql://"))
    {
        bail!("database.url must start with postgres:// or postgresql://");
    }

    if config.database.url.is_none() {
        warnings.push(ConfigWarning {
            message: "No database configured; scan jobs will not survive a restart".into(),
            hint: Some("Set DATABASE_URL to a PostgreSQL connection string".into()),
        });
    }
    if config.engine.api_key.is_none() {
        warnings.push(ConfigWarning {
            message: "No engine API key configured".into(),
            hint: Some("Set ZAP_API_KEY unless the ZAP API key is disabled".into()),
        });
    }

    Ok(warnings)
}
