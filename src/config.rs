use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::StormsightError;

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_RETRY_LIMIT: u32 = 3;
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_TILE_CACHE_MB: u64 = 64;
pub const DEFAULT_TILE_CONCURRENCY: usize = 8;

/// On-disk shape of `stormsight.json`. Everything is optional; a missing
/// file resolves to pure defaults.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub catalog_url: Option<String>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub retry_limit: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub staging_dir: Option<String>,
    #[serde(default)]
    pub tile_cache_mb: Option<u64>,
    #[serde(default)]
    pub tile_concurrency: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub catalog_url: Option<Url>,
    pub workers: usize,
    pub retry_limit: u32,
    pub timeout_secs: u64,
    pub staging_dir: Option<Utf8PathBuf>,
    pub tile_cache_bytes: usize,
    pub tile_concurrency: usize,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            catalog_url: None,
            workers: DEFAULT_WORKERS,
            retry_limit: DEFAULT_RETRY_LIMIT,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            staging_dir: None,
            tile_cache_bytes: (DEFAULT_TILE_CACHE_MB * 1024 * 1024) as usize,
            tile_concurrency: DEFAULT_TILE_CONCURRENCY,
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// An explicitly named file must exist; the default `stormsight.json`
    /// may be absent, in which case defaults apply.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, StormsightError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from("stormsight.json"),
        };

        if path.is_none() && !config_path.exists() {
            return Ok(ResolvedConfig::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| StormsightError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| StormsightError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, StormsightError> {
        let catalog_url = config
            .catalog_url
            .map(|raw| {
                Url::parse(&raw)
                    .map_err(|err| StormsightError::ConfigParse(format!("catalog_url: {err}")))
            })
            .transpose()?;

        let workers = config.workers.unwrap_or(DEFAULT_WORKERS);
        if workers == 0 {
            return Err(StormsightError::ConfigParse(
                "workers must be at least 1".to_string(),
            ));
        }
        let tile_concurrency = config.tile_concurrency.unwrap_or(DEFAULT_TILE_CONCURRENCY);
        if tile_concurrency == 0 {
            return Err(StormsightError::ConfigParse(
                "tile_concurrency must be at least 1".to_string(),
            ));
        }
        let tile_cache_mb = config.tile_cache_mb.unwrap_or(DEFAULT_TILE_CACHE_MB);
        if tile_cache_mb == 0 {
            return Err(StormsightError::ConfigParse(
                "tile_cache_mb must be at least 1".to_string(),
            ));
        }

        Ok(ResolvedConfig {
            catalog_url,
            workers,
            retry_limit: config.retry_limit.unwrap_or(DEFAULT_RETRY_LIMIT),
            timeout_secs: config.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
            staging_dir: config.staging_dir.map(Utf8PathBuf::from),
            tile_cache_bytes: (tile_cache_mb * 1024 * 1024) as usize,
            tile_concurrency,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn empty_config_resolves_to_defaults() {
        let resolved = ConfigLoader::resolve_config(Config::default()).unwrap();
        assert_eq!(resolved.workers, DEFAULT_WORKERS);
        assert_eq!(resolved.retry_limit, DEFAULT_RETRY_LIMIT);
        assert_eq!(resolved.tile_cache_bytes, 64 * 1024 * 1024);
        assert!(resolved.catalog_url.is_none());
        assert!(resolved.staging_dir.is_none());
    }

    #[test]
    fn catalog_url_is_validated() {
        let config = Config {
            catalog_url: Some("https://stac.example.org/catalog.json".to_string()),
            ..Config::default()
        };
        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(
            resolved.catalog_url.unwrap().as_str(),
            "https://stac.example.org/catalog.json"
        );

        let bad = Config {
            catalog_url: Some("not a url".to_string()),
            ..Config::default()
        };
        assert_matches!(
            ConfigLoader::resolve_config(bad),
            Err(StormsightError::ConfigParse(_))
        );
    }

    #[test]
    fn zero_workers_rejected() {
        let config = Config {
            workers: Some(0),
            ..Config::default()
        };
        assert_matches!(
            ConfigLoader::resolve_config(config),
            Err(StormsightError::ConfigParse(_))
        );
    }
}
