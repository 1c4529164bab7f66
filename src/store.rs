use std::collections::VecDeque;
use std::fs;

use camino::Utf8Path;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tracing::debug;

use crate::domain::{Enrichment, Resolution, Taxon, TaxonId, UNKNOWN_TAXON_NAME};
use crate::error::OttError;

const LOADED_KEY: &str = "loaded_at";
const DEFAULT_PAGE_SIZE: usize = 512;

/// Durable taxon table backed by a single SQLite file in WAL mode.
///
/// Point updates open a transaction lazily and stay uncommitted until
/// [`TaxonStore::commit`]; the driver decides how often to checkpoint. A crash
/// loses at most the writes since the last commit.
pub struct TaxonStore {
    conn: Connection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub taxa: u64,
    pub enriched: u64,
    pub pending: u64,
    pub placeholders: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NameStats {
    pub total: u64,
    pub resolved: u64,
    pub not_found: u64,
    pub ambiguous: u64,
    pub pending: u64,
}

impl TaxonStore {
    pub fn open(path: &Utf8Path) -> Result<Self, OttError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| OttError::Filesystem(err.to_string()))?;
        }
        let conn = Connection::open(path.as_std_path())?;
        Self::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, OttError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self { conn })
    }

    fn init_schema(conn: &Connection) -> Result<(), OttError> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;

            CREATE TABLE IF NOT EXISTS taxa (
                id TEXT PRIMARY KEY,
                parent TEXT,
                enrichment TEXT
            );

            -- keeps "what remains" cheap to find as the table fills in
            CREATE INDEX IF NOT EXISTS idx_taxa_pending
                ON taxa(id) WHERE enrichment IS NULL;

            CREATE TABLE IF NOT EXISTS names (
                name TEXT PRIMARY KEY,
                resolution TEXT
            );

            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// True once a bulk load has committed. An interrupted load leaves this false.
    pub fn exists(&self) -> Result<bool, OttError> {
        let loaded = self
            .conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![LOADED_KEY],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(loaded.is_some())
    }

    pub fn loaded_at(&self) -> Result<Option<String>, OttError> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![LOADED_KEY],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Inserts every pair in one transaction and marks the store as loaded.
    /// Any failure rolls the whole load back.
    pub fn bulk_insert<I, K>(&self, pairs: I) -> Result<u64, OttError>
    where
        I: IntoIterator<Item = (K, Option<K>)>,
        K: AsRef<str>,
    {
        self.commit()?;
        let tx = self.conn.unchecked_transaction()?;
        let mut inserted = 0u64;
        {
            let mut insert =
                tx.prepare("INSERT INTO taxa (id, parent, enrichment) VALUES (?1, ?2, NULL)")?;
            for (id, parent) in pairs {
                let parent: Option<&str> = parent.as_ref().map(AsRef::as_ref);
                insert.execute(params![id.as_ref(), parent])?;
                inserted += 1;
            }
        }
        tx.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![LOADED_KEY, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        debug!(inserted, "bulk load committed");
        Ok(inserted)
    }

    pub fn count(&self) -> Result<u64, OttError> {
        self.count_where("SELECT COUNT(*) FROM taxa")
    }

    pub fn count_unenriched(&self) -> Result<u64, OttError> {
        self.count_where("SELECT COUNT(*) FROM taxa WHERE enrichment IS NULL")
    }

    fn count_where(&self, sql: &str) -> Result<u64, OttError> {
        let count: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// Lazily pages through ids still lacking enrichment, in id order.
    ///
    /// Each page is re-queried against live state, so rows written while
    /// iterating are not revisited.
    pub fn iter_unenriched(&self) -> UnenrichedIds<'_> {
        self.iter_unenriched_paged(DEFAULT_PAGE_SIZE)
    }

    pub fn iter_unenriched_paged(&self, page_size: usize) -> UnenrichedIds<'_> {
        UnenrichedIds {
            store: self,
            after: None,
            page: VecDeque::new(),
            page_size: page_size.max(1),
            exhausted: false,
        }
    }

    fn unenriched_page(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<TaxonId>, OttError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id FROM taxa WHERE enrichment IS NULL AND (?1 IS NULL OR id > ?1) \
             ORDER BY id LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![after, limit as i64], |row| {
            row.get::<_, String>(0).map(TaxonId::from)
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn get(&self, id: &TaxonId) -> Result<Option<Taxon>, OttError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, parent, enrichment FROM taxa WHERE id = ?1",
                params![id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(id, parent, enrichment)| decode_taxon(id, parent, enrichment))
            .transpose()
    }

    /// Overwrites the enrichment column only. Stays pending until [`commit`](Self::commit).
    pub fn set_enrichment(&self, id: &TaxonId, enrichment: &Enrichment) -> Result<(), OttError> {
        let payload =
            serde_json::to_string(enrichment).map_err(|err| OttError::Store(err.to_string()))?;
        self.begin_if_needed()?;
        let updated = self.conn.execute(
            "UPDATE taxa SET enrichment = ?2 WHERE id = ?1",
            params![id.as_str(), payload],
        )?;
        if updated == 0 {
            return Err(OttError::Store(format!("unknown taxon {id}")));
        }
        Ok(())
    }

    /// Persists everything written since the last commit. No-op when nothing is pending.
    pub fn commit(&self) -> Result<(), OttError> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    pub fn has_uncommitted(&self) -> bool {
        !self.conn.is_autocommit()
    }

    fn begin_if_needed(&self) -> Result<(), OttError> {
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN")?;
        }
        Ok(())
    }

    /// Streams every taxon in id order without materializing the table.
    pub fn for_each_taxon<F>(&self, mut f: F) -> Result<u64, OttError>
    where
        F: FnMut(Taxon) -> Result<(), OttError>,
    {
        let mut stmt = self
            .conn
            .prepare("SELECT id, parent, enrichment FROM taxa ORDER BY id")?;
        let mut rows = stmt.query([])?;
        let mut seen = 0u64;
        while let Some(row) = rows.next()? {
            let taxon = decode_taxon(row.get(0)?, row.get(1)?, row.get(2)?)?;
            f(taxon)?;
            seen += 1;
        }
        Ok(seen)
    }

    pub fn stats(&self) -> Result<StoreStats, OttError> {
        let (taxa, pending, placeholders) = self.conn.query_row(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(enrichment IS NULL), 0),
                COALESCE(SUM(
                    json_extract(enrichment, '$.name') = ?1
                    AND json_extract(enrichment, '$.extant') IS NULL
                ), 0)
            FROM taxa
            "#,
            params![UNKNOWN_TAXON_NAME],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?)),
        )?;
        let (taxa, pending, placeholders) = (taxa as u64, pending as u64, placeholders as u64);
        Ok(StoreStats {
            taxa,
            enriched: taxa - pending,
            pending,
            placeholders,
        })
    }

    /// Adds names awaiting resolution; already known names are left untouched.
    pub fn insert_names<I, S>(&self, names: I) -> Result<u64, OttError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.commit()?;
        let tx = self.conn.unchecked_transaction()?;
        let mut inserted = 0u64;
        {
            let mut insert =
                tx.prepare("INSERT OR IGNORE INTO names (name, resolution) VALUES (?1, NULL)")?;
            for name in names {
                inserted += insert.execute(params![name.as_ref()])? as u64;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn count_unresolved_names(&self) -> Result<u64, OttError> {
        self.count_where("SELECT COUNT(*) FROM names WHERE resolution IS NULL")
    }

    /// Next `limit` unresolved names ordered after `after` (from the start when `None`).
    pub fn unresolved_names(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, OttError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT name FROM names WHERE resolution IS NULL AND (?1 IS NULL OR name > ?1) \
             ORDER BY name LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![after, limit as i64], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<String>, _>>()?)
    }

    pub fn resolution(&self, name: &str) -> Result<Option<Resolution>, OttError> {
        let value = self
            .conn
            .query_row(
                "SELECT resolution FROM names WHERE name = ?1",
                params![name],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten();
        value.map(|text| text.parse()).transpose()
    }

    pub fn set_resolution(&self, name: &str, resolution: Resolution) -> Result<(), OttError> {
        self.begin_if_needed()?;
        let updated = self.conn.execute(
            "UPDATE names SET resolution = ?2 WHERE name = ?1",
            params![name, resolution.to_string()],
        )?;
        if updated == 0 {
            return Err(OttError::Store(format!("unknown name `{name}`")));
        }
        Ok(())
    }

    pub fn name_stats(&self) -> Result<NameStats, OttError> {
        let mut stats = NameStats::default();
        let mut stmt = self.conn.prepare("SELECT resolution FROM names")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            stats.total += 1;
            match row.get::<_, Option<String>>(0)? {
                None => stats.pending += 1,
                Some(text) => match text.parse::<Resolution>()? {
                    Resolution::Resolved(_) => stats.resolved += 1,
                    Resolution::NotFound => stats.not_found += 1,
                    Resolution::Ambiguous => stats.ambiguous += 1,
                },
            }
        }
        Ok(stats)
    }
}

pub struct UnenrichedIds<'a> {
    store: &'a TaxonStore,
    after: Option<String>,
    page: VecDeque<TaxonId>,
    page_size: usize,
    exhausted: bool,
}

impl Iterator for UnenrichedIds<'_> {
    type Item = Result<TaxonId, OttError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.exhausted {
            match self.store.unenriched_page(self.after.as_deref(), self.page_size) {
                Ok(ids) => {
                    self.exhausted = ids.len() < self.page_size;
                    self.page.extend(ids);
                }
                Err(err) => {
                    self.exhausted = true;
                    return Some(Err(err));
                }
            }
        }
        let id = self.page.pop_front()?;
        self.after = Some(id.as_str().to_string());
        Some(Ok(id))
    }
}

fn decode_taxon(
    id: String,
    parent: Option<String>,
    enrichment: Option<String>,
) -> Result<Taxon, OttError> {
    let enrichment = enrichment
        .map(|payload| serde_json::from_str::<Enrichment>(&payload))
        .transpose()
        .map_err(|err| OttError::Store(format!("corrupt enrichment for {id}: {err}")))?;
    Ok(Taxon {
        id: TaxonId::from(id),
        parent: parent.map(TaxonId::from),
        enrichment,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wal_mode_enabled_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("taxa.db")).unwrap();
        let store = TaxonStore::open(&path).unwrap();
        let mode: String = store
            .conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode, "wal");
    }

    #[test]
    fn commit_is_repeatable() {
        let store = TaxonStore::open_in_memory().unwrap();
        store.bulk_insert([("ott1", None)]).unwrap();
        store.commit().unwrap();
        store
            .set_enrichment(&TaxonId::from("ott1"), &Enrichment::placeholder())
            .unwrap();
        assert!(store.has_uncommitted());
        store.commit().unwrap();
        store.commit().unwrap();
        assert!(!store.has_uncommitted());
    }
}
