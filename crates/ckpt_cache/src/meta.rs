//! Metadata facade: CRUD plus filtered listing over the durable checkpoint
//! record.
//!
//! The relational implementation keeps one table keyed on filename. It lives
//! on the shared storage root so every ring member reads the same metadata
//! namespace, mirroring the central metadata service the cache was built
//! against. Queries are synchronized explicitly with a mutex around the
//! connection; nothing here relies on driver connection affinity.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use rusqlite::{params, Connection, OptionalExtension};

use crate::types::{BatchFilter, CacheError, CacheResult, CheckpointState, Metadata};

pub trait MetaStore: Send + Sync {
    /// Insert or replace the record for `metadata.filename`.
    fn save(&self, metadata: &Metadata) -> CacheResult<()>;

    /// Load the full record. `NotFound` is distinct from failure.
    fn load(&self, filename: &str) -> CacheResult<Metadata>;

    fn update_state(&self, filename: &str, state: CheckpointState) -> CacheResult<()>;

    fn delete(&self, filename: &str) -> CacheResult<()>;

    /// Filtered listing. An empty result is reported as `NotFound` so callers
    /// can tell "nothing matched" from a transport failure.
    fn batch_load(&self, filter: &BatchFilter) -> CacheResult<Vec<Metadata>>;
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS metadata (
    filename  TEXT PRIMARY KEY,
    node_rank INTEGER NOT NULL,
    iteration TEXT NOT NULL,
    state     INTEGER NOT NULL,
    size      BIGINT NOT NULL
)";

pub struct SqliteMetaStore {
    job: String,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMetaStore {
    /// Open (or create) the metadata table. Failure here is fatal at startup;
    /// there is no degraded mode without metadata.
    pub fn open(path: impl AsRef<Path>, job: impl Into<String>) -> CacheResult<Arc<Self>> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("open metadata db at {}", path.as_ref().display()))?;
        // The database sits on a shared mount; WAL plus a busy timeout keeps
        // concurrent ring members from tripping over each other.
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("enable WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("set busy timeout")?;
        Self::with_connection(conn, job)
    }

    /// An in-memory store for tests and single-process setups.
    pub fn open_in_memory(job: impl Into<String>) -> CacheResult<Arc<Self>> {
        let conn = Connection::open_in_memory().context("open in-memory metadata db")?;
        Self::with_connection(conn, job)
    }

    fn with_connection(conn: Connection, job: impl Into<String>) -> CacheResult<Arc<Self>> {
        conn.execute(SCHEMA, []).context("create metadata table")?;
        Ok(Arc::new(SqliteMetaStore {
            job: job.into(),
            conn: Arc::new(Mutex::new(conn)),
        }))
    }

    fn row_to_metadata(&self, row: &rusqlite::Row<'_>) -> rusqlite::Result<Metadata> {
        let raw_state: i64 = row.get(3)?;
        Ok(Metadata {
            job: self.job.clone(),
            filename: row.get(0)?,
            node_rank: row.get(1)?,
            iteration: row.get(2)?,
            state: CheckpointState::from_i64(raw_state).unwrap_or(CheckpointState::Broken),
            size: row.get::<_, i64>(4)? as u64,
        })
    }
}

impl MetaStore for SqliteMetaStore {
    fn save(&self, metadata: &Metadata) -> CacheResult<()> {
        let conn = self.conn.lock().expect("metadata connection lock");
        conn.execute(
            "INSERT INTO metadata (filename, node_rank, iteration, state, size)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(filename) DO UPDATE SET
                 node_rank = excluded.node_rank,
                 iteration = excluded.iteration,
                 state     = excluded.state,
                 size      = excluded.size",
            params![
                metadata.filename,
                metadata.node_rank,
                metadata.iteration,
                metadata.state.as_i64(),
                metadata.size as i64,
            ],
        )
        .context("upsert metadata")?;
        Ok(())
    }

    fn load(&self, filename: &str) -> CacheResult<Metadata> {
        let conn = self.conn.lock().expect("metadata connection lock");
        let row = conn
            .query_row(
                "SELECT filename, node_rank, iteration, state, size
                 FROM metadata WHERE filename = ?1",
                params![filename],
                |row| self.row_to_metadata(row),
            )
            .optional()
            .context("load metadata")?;
        row.ok_or(CacheError::NotFound)
    }

    fn update_state(&self, filename: &str, state: CheckpointState) -> CacheResult<()> {
        let conn = self.conn.lock().expect("metadata connection lock");
        let changed = conn
            .execute(
                "UPDATE metadata SET state = ?2 WHERE filename = ?1",
                params![filename, state.as_i64()],
            )
            .context("update metadata state")?;
        if changed == 0 {
            return Err(CacheError::NotFound);
        }
        Ok(())
    }

    fn delete(&self, filename: &str) -> CacheResult<()> {
        let conn = self.conn.lock().expect("metadata connection lock");
        conn.execute("DELETE FROM metadata WHERE filename = ?1", params![filename])
            .context("delete metadata")?;
        Ok(())
    }

    fn batch_load(&self, filter: &BatchFilter) -> CacheResult<Vec<Metadata>> {
        let mut sql =
            String::from("SELECT filename, node_rank, iteration, state, size FROM metadata");
        let mut clauses = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(rank) = filter.node_rank {
            args.push(Box::new(rank));
            clauses.push(format!("node_rank = ?{}", args.len()));
        }
        if let Some(iteration) = &filter.iteration {
            args.push(Box::new(iteration.clone()));
            clauses.push(format!("iteration = ?{}", args.len()));
        }
        if let Some(state) = filter.state {
            args.push(Box::new(state.as_i64()));
            clauses.push(format!("state = ?{}", args.len()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY filename");

        let conn = self.conn.lock().expect("metadata connection lock");
        let mut stmt = conn.prepare(&sql).context("prepare batch load")?;
        let params = rusqlite::params_from_iter(args.iter().map(|a| a.as_ref()));
        let rows = stmt
            .query_map(params, |row| self.row_to_metadata(row))
            .context("run batch load")?
            .collect::<Result<Vec<_>, _>>()
            .context("read batch load rows")?;
        if rows.is_empty() {
            return Err(CacheError::NotFound);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Arc<SqliteMetaStore> {
        SqliteMetaStore::open_in_memory("job-a").unwrap()
    }

    fn metadata(filename: &str, rank: i64, iteration: &str, state: CheckpointState) -> Metadata {
        Metadata {
            job: "job-a".into(),
            filename: filename.into(),
            node_rank: rank,
            iteration: iteration.into(),
            state,
            size: 1024,
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let store = store();
        let m = metadata("/ckpt/a", 1, "7", CheckpointState::Cached);
        store.save(&m).unwrap();
        assert_eq!(store.load("/ckpt/a").unwrap(), m);

        // Upsert replaces in place.
        let mut updated = m.clone();
        updated.size = 2048;
        updated.state = CheckpointState::BackedUp;
        store.save(&updated).unwrap();
        assert_eq!(store.load("/ckpt/a").unwrap(), updated);
    }

    #[test]
    fn missing_records_are_not_found() {
        let store = store();
        assert!(matches!(store.load("nope"), Err(CacheError::NotFound)));
        assert!(matches!(
            store.update_state("nope", CheckpointState::Cached),
            Err(CacheError::NotFound)
        ));
        assert!(matches!(
            store.batch_load(&BatchFilter::default()),
            Err(CacheError::NotFound)
        ));
    }

    #[test]
    fn update_state_persists() {
        let store = store();
        store
            .save(&metadata("/ckpt/a", 0, "1", CheckpointState::Cached))
            .unwrap();
        store
            .update_state("/ckpt/a", CheckpointState::Persistent)
            .unwrap();
        assert_eq!(
            store.load("/ckpt/a").unwrap().state,
            CheckpointState::Persistent
        );
    }

    #[test]
    fn batch_load_filters_compose() {
        let store = store();
        store
            .save(&metadata("/a", 0, "1", CheckpointState::Cached))
            .unwrap();
        store
            .save(&metadata("/b", 0, "2", CheckpointState::Persistent))
            .unwrap();
        store
            .save(&metadata("/c", 1, "1", CheckpointState::Cached))
            .unwrap();

        let by_rank = store.batch_load(&BatchFilter::by_rank(0)).unwrap();
        assert_eq!(by_rank.len(), 2);

        let by_both = store
            .batch_load(&BatchFilter::by_rank_and_iteration(0, "1"))
            .unwrap();
        assert_eq!(by_both.len(), 1);
        assert_eq!(by_both[0].filename, "/a");

        let by_state = store
            .batch_load(&BatchFilter {
                node_rank: None,
                iteration: None,
                state: Some(CheckpointState::Persistent),
            })
            .unwrap();
        assert_eq!(by_state.len(), 1);
        assert_eq!(by_state[0].filename, "/b");

        store.delete("/a").unwrap();
        assert!(matches!(
            store.batch_load(&BatchFilter::by_rank_and_iteration(0, "1")),
            Err(CacheError::NotFound)
        ));
    }
}
