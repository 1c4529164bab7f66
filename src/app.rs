use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use flate2::read::GzDecoder;
use serde::Serialize;
use tempfile::Builder;
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::config::ResolvedConfig;
use crate::domain::{Enrichment, Resolution, TaxonId, TaxonKind, TaxonState};
use crate::error::OttError;
use crate::newick::Tree;
use crate::ott::OttClient;
use crate::progress::{ProgressEvent, ProgressReporter, ProgressSink};
use crate::store::{NameStats, StoreStats, TaxonStore};

#[derive(Debug, Clone, Copy)]
pub struct EnrichOptions {
    pub rate_limit: Duration,
    pub checkpoint_interval: usize,
}

impl From<&ResolvedConfig> for EnrichOptions {
    fn from(config: &ResolvedConfig) -> Self {
        Self {
            rate_limit: config.rate_limit,
            checkpoint_interval: config.checkpoint_interval,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResolveOptions {
    pub rate_limit: Duration,
    pub batch_size: usize,
}

impl From<&ResolvedConfig> for ResolveOptions {
    fn from(config: &ResolvedConfig) -> Self {
        Self {
            rate_limit: config.rate_limit,
            batch_size: config.batch_size,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TreeResult {
    pub path: String,
    pub action: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadResult {
    pub action: String,
    pub taxa: u64,
    pub tree: Option<TreeResult>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrichResult {
    pub processed: u64,
    pub enriched: u64,
    pub skipped: u64,
    pub remaining: u64,
    pub interrupted: bool,
    pub started_at: String,
    pub finished_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportResult {
    pub read: u64,
    pub inserted: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolveResult {
    pub batches: u64,
    pub resolved: u64,
    pub not_found: u64,
    pub ambiguous: u64,
    pub remaining: u64,
    pub interrupted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResult {
    pub loaded: bool,
    pub loaded_at: Option<String>,
    pub taxa: StoreStats,
    pub names: NameStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportResult {
    pub path: String,
    pub rows: u64,
}

#[derive(Serialize)]
struct ExportRow<'a> {
    id: &'a str,
    parent: Option<&'a str>,
    state: &'static str,
    name: Option<&'a str>,
    extant: Option<bool>,
    other_names: &'a [String],
    description: Option<&'a str>,
}

/// Spaces consecutive remote calls at least `interval` apart.
struct Pace {
    interval: Duration,
    last: Option<Instant>,
}

impl Pace {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    fn wait(&mut self) {
        if let Some(last) = self.last {
            let elapsed = last.elapsed();
            if elapsed < self.interval {
                thread::sleep(self.interval - elapsed);
            }
        }
        self.last = Some(Instant::now());
    }
}

pub struct App<C: OttClient> {
    config: ResolvedConfig,
    store: TaxonStore,
    client: C,
}

impl<C: OttClient> App<C> {
    pub fn new(config: ResolvedConfig, store: TaxonStore, client: C) -> Self {
        Self {
            config,
            store,
            client,
        }
    }

    pub fn store(&self) -> &TaxonStore {
        &self.store
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Downloads the tree unless a cached copy exists. The cache is never
    /// revalidated; delete the file to force a fresh download.
    pub fn prepare_tree(&self, sink: &dyn ProgressSink) -> Result<TreeResult, OttError> {
        let path = self.config.tree_path();
        if path.as_std_path().exists() {
            info!(path = %path, "using cached tree");
            sink.event(ProgressEvent::message(format!("Found {path}")));
            return Ok(TreeResult {
                path: path.to_string(),
                action: "cached".to_string(),
            });
        }

        sink.event(ProgressEvent::message(format!("Downloading {path}")));
        let parent = path
            .parent()
            .ok_or_else(|| OttError::Filesystem("invalid tree path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| OttError::Filesystem(err.to_string()))?;
        let temp = Builder::new()
            .prefix(".tree-download")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| OttError::Filesystem(err.to_string()))?;
        let started = Instant::now();
        self.client
            .download_tree(&self.config.tree_url, temp.path())?;
        temp.persist(path.as_std_path())
            .map_err(|err| OttError::Filesystem(err.to_string()))?;
        info!(path = %path, elapsed = ?started.elapsed(), "tree downloaded");

        Ok(TreeResult {
            path: path.to_string(),
            action: "downloaded".to_string(),
        })
    }

    /// Flattens the tree into the store once. A loaded store is left as is.
    pub fn load(&self, sink: &dyn ProgressSink) -> Result<LoadResult, OttError> {
        if self.store.exists()? {
            let taxa = self.store.count()?;
            debug!(taxa, "store already loaded");
            return Ok(LoadResult {
                action: "existing".to_string(),
                taxa,
                tree: None,
            });
        }

        let tree_result = self.prepare_tree(sink)?;
        sink.event(ProgressEvent::message("Processing tree"));
        let started = Instant::now();
        let tree = read_tree(Utf8Path::new(&tree_result.path))?;
        info!(nodes = tree.node_count(), elapsed = ?started.elapsed(), "tree parsed");

        let taxa = self.store.bulk_insert(tree.flatten())?;
        info!(taxa, "taxa loaded");
        sink.event(ProgressEvent::message(format!("Loaded {taxa} taxa")));

        Ok(LoadResult {
            action: "loaded".to_string(),
            taxa,
            tree: Some(tree_result),
        })
    }

    /// Walks every pending taxon once, committing every
    /// `checkpoint_interval` writes and once more on the way out.
    ///
    /// A remote failure stops the run with an error. Cancellation is seen
    /// between taxa and yields `interrupted = true`.
    pub fn enrich(
        &self,
        options: EnrichOptions,
        cancel: &CancellationToken,
        sink: &dyn ProgressSink,
    ) -> Result<EnrichResult, OttError> {
        if !self.store.exists()? {
            return Err(OttError::StoreNotInitialized);
        }

        let mut result = EnrichResult {
            started_at: Utc::now().to_rfc3339(),
            ..EnrichResult::default()
        };
        let outcome = self.enrich_pending(options, cancel, sink, &mut result);
        let committed = self.store.commit();
        outcome?;
        committed?;

        result.remaining = self.store.count_unenriched()?;
        result.finished_at = Utc::now().to_rfc3339();
        info!(
            processed = result.processed,
            enriched = result.enriched,
            skipped = result.skipped,
            remaining = result.remaining,
            interrupted = result.interrupted,
            "enrichment finished"
        );
        Ok(result)
    }

    fn enrich_pending(
        &self,
        options: EnrichOptions,
        cancel: &CancellationToken,
        sink: &dyn ProgressSink,
        result: &mut EnrichResult,
    ) -> Result<(), OttError> {
        let total = self.store.count_unenriched()?;
        info!(pending = total, "looking up taxa");
        let mut reporter = ProgressReporter::new(sink, "Processing taxon", total);
        let mut pace = Pace::new(options.rate_limit);
        let checkpoint_interval = options.checkpoint_interval.max(1);
        let mut since_checkpoint = 0usize;

        for id in self.store.iter_unenriched() {
            if cancel.is_cancelled() {
                warn!(processed = result.processed, "enrichment interrupted");
                result.interrupted = true;
                break;
            }
            let id = id?;
            reporter.tick(result.processed);

            match self.enrich_one(&id, &mut pace)? {
                TaxonState::Enriched => result.enriched += 1,
                TaxonState::Skipped => result.skipped += 1,
                TaxonState::Pending => {}
            }
            result.processed += 1;

            since_checkpoint += 1;
            if since_checkpoint >= checkpoint_interval {
                self.store.commit()?;
                debug!(processed = result.processed, "checkpoint");
                since_checkpoint = 0;
            }
        }

        reporter.finish(result.processed);
        Ok(())
    }

    fn enrich_one(&self, id: &TaxonId, pace: &mut Pace) -> Result<TaxonState, OttError> {
        match id.kind() {
            TaxonKind::Composite => {
                self.store.set_enrichment(id, &Enrichment::placeholder())?;
                Ok(TaxonState::Skipped)
            }
            TaxonKind::Canonical(ott_id) => {
                pace.wait();
                let record = self.client.taxon_info(ott_id)?;
                self.store.set_enrichment(id, &record.into_enrichment())?;
                Ok(TaxonState::Enriched)
            }
        }
    }

    /// Queues names from a newline-delimited file for resolution.
    pub fn import_names(&self, path: &Utf8Path) -> Result<ImportResult, OttError> {
        let file = File::open(path.as_std_path())
            .map_err(|err| OttError::Filesystem(format!("open {path}: {err}")))?;
        let mut names = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|err| OttError::Filesystem(err.to_string()))?;
            let name = line.trim();
            if !name.is_empty() {
                names.push(name.to_string());
            }
        }
        let read = names.len() as u64;
        let inserted = self.store.insert_names(&names)?;
        info!(read, inserted, "names imported");
        Ok(ImportResult { read, inserted })
    }

    /// Resolves pending names in batches, one rate-limited call and one
    /// commit per batch.
    pub fn resolve_names(
        &self,
        options: ResolveOptions,
        cancel: &CancellationToken,
        sink: &dyn ProgressSink,
    ) -> Result<ResolveResult, OttError> {
        let mut result = ResolveResult::default();
        let outcome = self.resolve_pending(options, cancel, sink, &mut result);
        let committed = self.store.commit();
        outcome?;
        committed?;

        result.remaining = self.store.count_unresolved_names()?;
        info!(
            resolved = result.resolved,
            not_found = result.not_found,
            ambiguous = result.ambiguous,
            remaining = result.remaining,
            "name resolution finished"
        );
        Ok(result)
    }

    fn resolve_pending(
        &self,
        options: ResolveOptions,
        cancel: &CancellationToken,
        sink: &dyn ProgressSink,
        result: &mut ResolveResult,
    ) -> Result<(), OttError> {
        let total = self.store.count_unresolved_names()?;
        let mut reporter = ProgressReporter::new(sink, "Processed name", total);
        let mut pace = Pace::new(options.rate_limit);
        let batch_size = options.batch_size.max(1);
        let mut after: Option<String> = None;
        let mut processed = 0u64;

        loop {
            if cancel.is_cancelled() {
                warn!(processed, "name resolution interrupted");
                result.interrupted = true;
                break;
            }
            let batch = self.store.unresolved_names(after.as_deref(), batch_size)?;
            let Some(last) = batch.last() else {
                break;
            };
            reporter.tick(processed);

            pace.wait();
            let matches = self.client.match_names(&batch)?;
            let mut wanted: HashSet<&str> = batch.iter().map(String::as_str).collect();
            for entry in matches {
                if !wanted.remove(entry.name.as_str()) {
                    warn!(name = %entry.name, "ignoring result for a name that was not requested");
                    continue;
                }
                let resolution = Resolution::from_match_count(&entry.matches);
                self.store.set_resolution(&entry.name, resolution)?;
                match resolution {
                    Resolution::Resolved(_) => result.resolved += 1,
                    Resolution::NotFound => result.not_found += 1,
                    Resolution::Ambiguous => result.ambiguous += 1,
                }
                processed += 1;
            }
            if !wanted.is_empty() {
                warn!(missing = wanted.len(), "names absent from response stay pending");
            }
            self.store.commit()?;
            result.batches += 1;
            after = Some(last.clone());
        }

        reporter.finish(processed);
        Ok(())
    }

    pub fn status(&self) -> Result<StatusResult, OttError> {
        Ok(StatusResult {
            loaded: self.store.exists()?,
            loaded_at: self.store.loaded_at()?,
            taxa: self.store.stats()?,
            names: self.store.name_stats()?,
        })
    }

    /// Writes every taxon as one JSON object per line, replacing `path` atomically.
    pub fn export(&self, path: &Utf8Path, sink: &dyn ProgressSink) -> Result<ExportResult, OttError> {
        if !self.store.exists()? {
            return Err(OttError::StoreNotInitialized);
        }
        let parent = match path.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent.to_path_buf(),
            _ => Utf8PathBuf::from("."),
        };
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| OttError::Filesystem(err.to_string()))?;
        let temp = Builder::new()
            .prefix(".export")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| OttError::Filesystem(err.to_string()))?;

        let total = self.store.count()?;
        let mut reporter = ProgressReporter::new(sink, "Exported taxon", total);
        let mut writer = BufWriter::new(temp.as_file());
        let rows = self.store.for_each_taxon(|taxon| {
            let state = taxon.state();
            let enrichment = taxon.enrichment.as_ref();
            let row = ExportRow {
                id: taxon.id.as_str(),
                parent: taxon.parent.as_ref().map(TaxonId::as_str),
                state: state.as_str(),
                name: enrichment.map(|e| e.name.as_str()),
                extant: enrichment.and_then(|e| e.extant),
                other_names: enrichment.map(|e| e.other_names.as_slice()).unwrap_or(&[]),
                description: enrichment.and_then(|e| e.description.as_deref()),
            };
            serde_json::to_writer(&mut writer, &row)
                .map_err(|err| OttError::Filesystem(err.to_string()))?;
            writer
                .write_all(b"\n")
                .map_err(|err| OttError::Filesystem(err.to_string()))?;
            Ok(())
        })?;
        reporter.finish(rows);
        writer
            .flush()
            .map_err(|err| OttError::Filesystem(err.to_string()))?;
        drop(writer);
        temp.persist(path.as_std_path())
            .map_err(|err| OttError::Filesystem(err.to_string()))?;

        Ok(ExportResult {
            path: path.to_string(),
            rows,
        })
    }
}

/// Reads a cached tree, decompressing `.gz` files on the fly.
pub fn read_tree(path: &Utf8Path) -> Result<Tree, OttError> {
    let file = File::open(path.as_std_path())
        .map_err(|err| OttError::Filesystem(format!("open {path}: {err}")))?;
    let reader = BufReader::new(file);
    if path.extension() == Some("gz") {
        Tree::from_reader(GzDecoder::new(reader))
    } else {
        Tree::from_reader(reader)
    }
}
