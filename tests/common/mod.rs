#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use camino::Utf8PathBuf;

use ott_enricher::app::{App, EnrichOptions, ResolveOptions};
use ott_enricher::cancel::CancellationToken;
use ott_enricher::config::{Config, ConfigLoader, ResolvedConfig};
use ott_enricher::domain::OttId;
use ott_enricher::error::OttError;
use ott_enricher::ott::{NameMatches, OttClient, TaxonRecord};
use ott_enricher::store::TaxonStore;

/// Six canonical ids and one composite (`mrcaott1ott4`).
pub const SAMPLE_TREE: &str = "((ott1,ott2)ott3,(ott4,mrcaott1ott4)ott5)ott6;";

#[derive(Default)]
pub struct MockOtt {
    pub tree: String,
    pub names: HashMap<String, Vec<u64>>,
    pub calls: Mutex<Vec<u64>>,
    pub batches: Mutex<Vec<Vec<String>>>,
    pub downloads: Mutex<usize>,
    pub fail_on: Option<u64>,
    /// Cancels the token once this many `taxon_info` calls have completed.
    pub cancel_after: Option<(usize, CancellationToken)>,
    /// Store file read through a separate connection on every `taxon_info` call.
    pub watch_store: Option<Utf8PathBuf>,
    /// Committed pending counts seen through `watch_store`, one per call.
    pub committed_pending: Mutex<Vec<u64>>,
}

impl MockOtt {
    pub fn with_tree(tree: &str) -> Self {
        Self {
            tree: tree.to_string(),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<u64> {
        self.calls.lock().unwrap().clone()
    }
}

impl OttClient for MockOtt {
    fn taxon_info(&self, id: OttId) -> Result<TaxonRecord, OttError> {
        if self.fail_on == Some(id.get()) {
            return Err(OttError::OttStatus {
                status: 503,
                message: "service unavailable".to_string(),
            });
        }
        if let Some(path) = &self.watch_store {
            let reader = rusqlite::Connection::open(path.as_std_path()).unwrap();
            let pending: i64 = reader
                .query_row("SELECT COUNT(*) FROM taxa WHERE enrichment IS NULL", [], |row| {
                    row.get(0)
                })
                .unwrap();
            self.committed_pending.lock().unwrap().push(pending as u64);
        }
        let mut calls = self.calls.lock().unwrap();
        calls.push(id.get());
        if let Some((limit, token)) = &self.cancel_after {
            if calls.len() >= *limit {
                token.cancel();
            }
        }
        Ok(TaxonRecord {
            name: Some(format!("Taxon {id}")),
            rank: Some("species".to_string()),
            flags: if id.get() % 2 == 0 {
                vec!["extinct".to_string()]
            } else {
                Vec::new()
            },
            synonyms: vec![format!("Synonym {id}")],
            tax_sources: vec![format!("ncbi:{id}")],
        })
    }

    fn match_names(&self, names: &[String]) -> Result<Vec<NameMatches>, OttError> {
        self.batches.lock().unwrap().push(names.to_vec());
        Ok(names
            .iter()
            .map(|name| NameMatches {
                name: name.clone(),
                matches: self
                    .names
                    .get(name)
                    .map(|ids| ids.iter().copied().map(OttId::new).collect())
                    .unwrap_or_default(),
            })
            .collect())
    }

    fn download_tree(&self, _url: &str, destination: &Path) -> Result<(), OttError> {
        *self.downloads.lock().unwrap() += 1;
        std::fs::write(destination, &self.tree).map_err(|err| OttError::Filesystem(err.to_string()))
    }
}

pub fn test_config(dir: &Path) -> ResolvedConfig {
    ConfigLoader::resolve_config(Config {
        data_dir: Some(Utf8PathBuf::from_path_buf(dir.to_path_buf()).unwrap()),
        rate_limit_ms: Some(0),
        checkpoint_interval: Some(1),
        batch_size: Some(2),
        ..Config::default()
    })
    .unwrap()
}

pub fn open_app(config: &ResolvedConfig, client: MockOtt) -> App<MockOtt> {
    let store = TaxonStore::open(&config.store_path()).unwrap();
    App::new(config.clone(), store, client)
}

pub fn enrich_options(config: &ResolvedConfig) -> EnrichOptions {
    EnrichOptions::from(config)
}

pub fn resolve_options(config: &ResolvedConfig) -> ResolveOptions {
    ResolveOptions::from(config)
}
