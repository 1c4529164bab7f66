use std::fs;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::OttError;

pub const DEFAULT_CONFIG_FILE: &str = "ott-enricher.json";
pub const DEFAULT_RELEASE: &str = "15.1";
pub const DEFAULT_API_URL: &str = "https://api.opentreeoflife.org/v3";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub release: Option<String>,
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub tree_url: Option<String>,
    #[serde(default)]
    pub data_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub rate_limit_ms: Option<u64>,
    #[serde(default)]
    pub checkpoint_interval: Option<usize>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub download_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub release: String,
    pub api_url: String,
    pub tree_url: String,
    pub data_dir: Utf8PathBuf,
    /// Minimum spacing between two remote calls.
    pub rate_limit: Duration,
    /// Enrichment writes between commits.
    pub checkpoint_interval: usize,
    /// Names per `match_names` call.
    pub batch_size: usize,
    pub timeout: Duration,
    pub download_timeout: Duration,
}

impl ResolvedConfig {
    pub fn tree_path(&self) -> Utf8PathBuf {
        let suffix = if self.tree_url.ends_with(".gz") {
            "tre.gz"
        } else {
            "tre"
        };
        self.data_dir
            .join(format!("tree-{}.{suffix}", self.release))
    }

    pub fn store_path(&self) -> Utf8PathBuf {
        self.data_dir.join(format!("taxa-{}.db", self.release))
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads `path`, or `ott-enricher.json` in the working directory when it
    /// exists. With neither, built-in defaults apply.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, OttError> {
        let config_path = match path {
            Some(path) => Utf8PathBuf::from(path),
            None => Utf8PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.as_std_path().exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(config_path.as_std_path())
            .map_err(|_| OttError::ConfigRead(config_path.clone().into_std_path_buf()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| OttError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, OttError> {
        let release = config
            .release
            .unwrap_or_else(|| DEFAULT_RELEASE.to_string());
        let tree_url = config
            .tree_url
            .unwrap_or_else(|| default_tree_url(&release));
        let data_dir = match config.data_dir {
            Some(dir) => dir,
            None => default_data_dir()?,
        };

        Ok(ResolvedConfig {
            api_url: config
                .api_url
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            tree_url,
            data_dir,
            rate_limit: Duration::from_millis(config.rate_limit_ms.unwrap_or(500)),
            checkpoint_interval: config.checkpoint_interval.unwrap_or(100).max(1),
            batch_size: config.batch_size.unwrap_or(100).max(1),
            timeout: Duration::from_secs(config.timeout_secs.unwrap_or(10)),
            download_timeout: Duration::from_secs(config.download_timeout_secs.unwrap_or(3600)),
            release,
        })
    }
}

pub fn default_tree_url(release: &str) -> String {
    format!(
        "https://files.opentreeoflife.org/synthesis/opentree{release}/output/labelled_supertree/labelled_supertree.tre"
    )
}

fn default_data_dir() -> Result<Utf8PathBuf, OttError> {
    BaseDirs::new()
        .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.cache_dir().join("ott-enricher")).ok())
        .ok_or_else(|| OttError::Filesystem("unable to resolve cache directory".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_release() {
        let config = Config {
            release: Some("14.9".to_string()),
            data_dir: Some(Utf8PathBuf::from("/tmp/ott")),
            ..Config::default()
        };
        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert!(resolved.tree_url.contains("opentree14.9"));
        assert_eq!(resolved.tree_path(), Utf8PathBuf::from("/tmp/ott/tree-14.9.tre"));
        assert_eq!(resolved.store_path(), Utf8PathBuf::from("/tmp/ott/taxa-14.9.db"));
        assert_eq!(resolved.rate_limit, Duration::from_millis(500));
        assert_eq!(resolved.checkpoint_interval, 100);
        assert_eq!(resolved.timeout, Duration::from_secs(10));
        assert_eq!(resolved.download_timeout, Duration::from_secs(3600));
    }
}
