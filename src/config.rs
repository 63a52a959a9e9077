use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::OneError;

pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    pub base_url: String,
    #[serde(default)]
    pub cache_dir: Option<String>,
    #[serde(default)]
    pub http_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub base_url: String,
    pub cache_dir: Utf8PathBuf,
    pub http_timeout_secs: u64,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, OneError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from("one-client.json"),
        };

        if path.is_none() && !config_path.exists() {
            return Err(OneError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| OneError::ConfigRead(config_path.clone()))?;
        let config: Config =
            serde_json::from_str(&content).map_err(|err| OneError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, OneError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let base_url = match std::env::var("ONE_BASE_URL") {
            Ok(url) if !url.is_empty() => url,
            _ => config.base_url,
        };
        let base_url = base_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(OneError::ConfigParse("base_url must not be empty".to_string()));
        }

        let cache_dir = match config.cache_dir {
            Some(dir) => Utf8PathBuf::from(dir),
            None => default_cache_dir()?,
        };

        Ok(ResolvedConfig {
            schema_version,
            base_url,
            cache_dir,
            http_timeout_secs: config.http_timeout_secs.unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS),
        })
    }
}

pub fn default_cache_dir() -> Result<Utf8PathBuf, OneError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("one-client")).ok()
        })
        .ok_or_else(|| OneError::Filesystem("unable to resolve cache directory".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_config_defaults() {
        let config = Config {
            schema_version: None,
            base_url: "https://alyx.example.org/".to_string(),
            cache_dir: Some("/tmp/one-cache".to_string()),
            http_timeout_secs: None,
        };

        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.base_url, "https://alyx.example.org");
        assert_eq!(resolved.cache_dir, Utf8PathBuf::from("/tmp/one-cache"));
        assert_eq!(resolved.http_timeout_secs, DEFAULT_HTTP_TIMEOUT_SECS);
    }
}
