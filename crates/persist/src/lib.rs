//! Canopy persistence: SQLite checkpoints of (marker, snapshot, name map).
//! Synchronous on purpose; one small transaction per committed group.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use canopy_core::{AllPolicies, Checkpoint, NameMap, ResumeMarker};
use canopy_watch::CheckpointSink;
use metrics::{counter, histogram};
use tracing::{debug, info};

pub const DEFAULT_STREAM: &str = "default";
pub const DEFAULT_KEEP: usize = 3;

/// SQLite-backed checkpoint store. Rows are scoped by stream name so several
/// watchers can share one file; only the newest `keep` rows per stream survive.
pub struct SqliteCheckpointStore {
    db: Mutex<rusqlite::Connection>,
    stream: String,
    keep: usize,
}

impl SqliteCheckpointStore {
    /// `CANOPY_DB_PATH`, else `~/.canopy/canopy.db`.
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("CANOPY_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                stream   TEXT NOT NULL,
                marker   BLOB NOT NULL,
                ts       INTEGER NOT NULL,
                snapshot BLOB NOT NULL,
                names    BLOB NOT NULL
            )",
            [],
        )
        .context("creating checkpoints table")?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_checkpoints_stream_ts ON checkpoints(stream, ts DESC)",
            [],
        )
        .ok();
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(path, "checkpoint store opened");
        Ok(Self { db: Mutex::new(db), stream: DEFAULT_STREAM.to_string(), keep: DEFAULT_KEEP })
    }

    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = stream.into();
        self
    }

    /// Retain at least one row.
    pub fn with_keep(mut self, keep: usize) -> Self {
        self.keep = keep.max(1);
        self
    }

    pub fn stream(&self) -> &str { &self.stream }

    pub fn put(&self, cp: &Checkpoint) -> Result<()> {
        let started = std::time::Instant::now();
        let snapshot = maybe_compress(&serde_json::to_vec(&cp.snapshot).context("encoding snapshot")?);
        let names = serde_json::to_vec(&cp.names).context("encoding name map")?;
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO checkpoints(stream, marker, ts, snapshot, names) VALUES (?1, ?2, ?3, ?4, ?5)",
            (&self.stream, cp.marker.as_bytes(), cp.ts, &snapshot, &names),
        )?;
        tx.execute(
            "DELETE FROM checkpoints
             WHERE stream = ?1
               AND rowid NOT IN (
                   SELECT rowid FROM checkpoints WHERE stream = ?1 ORDER BY ts DESC, rowid DESC LIMIT ?2
               )",
            (&self.stream, self.keep as i64),
        )?;
        tx.commit()?;
        histogram!("checkpoint_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("checkpoint_put_total", 1u64);
        Ok(())
    }

    /// Newest checkpoint for this stream, if any.
    pub fn load_latest(&self) -> Result<Option<Checkpoint>> {
        Ok(self.history(Some(1))?.into_iter().next())
    }

    /// Newest first, capped at `limit` (default: the retention count).
    pub fn history(&self, limit: Option<usize>) -> Result<Vec<Checkpoint>> {
        let started = std::time::Instant::now();
        let cap = limit.unwrap_or(self.keep);
        let db = self.lock()?;
        let mut stmt = db.prepare(
            "SELECT marker, ts, snapshot, names FROM checkpoints
             WHERE stream = ?1 ORDER BY ts DESC, rowid DESC LIMIT ?2",
        )?;
        let mut rows = stmt.query((&self.stream, cap as i64))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let marker: Vec<u8> = row.get(0)?;
            let ts: i64 = row.get(1)?;
            let snapshot: Vec<u8> = row.get(2)?;
            let names: Vec<u8> = row.get(3)?;
            let marker = ResumeMarker::new(marker).ok_or_else(|| anyhow!("stored checkpoint has an empty marker"))?;
            let snapshot: AllPolicies =
                serde_json::from_slice(&maybe_decompress(&snapshot)).context("decoding stored snapshot")?;
            let names: NameMap = serde_json::from_slice(&names).context("decoding stored name map")?;
            out.push(Checkpoint { marker, snapshot, names, ts });
        }
        histogram!("checkpoint_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn lock(&self) -> Result<MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("checkpoint db mutex poisoned"))
    }
}

impl CheckpointSink for SqliteCheckpointStore {
    fn commit(&mut self, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        self.put(checkpoint)?;
        info!(stream = %self.stream, marker = %checkpoint.marker, "checkpoint written");
        Ok(())
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".canopy");
        let _ = std::fs::create_dir_all(&p);
        p.push("canopy.db");
        return p.to_string_lossy().to_string();
    }
    "canopy.db".to_string()
}

/// zstd-compress when built with the `zstd` feature (`CANOPY_ZSTD_LEVEL`, default 3).
pub fn maybe_compress(raw: &[u8]) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        let lvl: i32 = std::env::var("CANOPY_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        return zstd::encode_all(raw, lvl).unwrap_or_else(|_| raw.to_vec());
    }
    raw.to_vec()
}

/// Inverse of [`maybe_compress`]; plain rows written without the feature still read.
pub fn maybe_decompress(blob: &[u8]) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(blob)) {
            return de;
        }
    }
    blob.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::{Node, SyncRegistration};

    fn temp_db() -> String {
        let dir = std::env::temp_dir();
        let f = format!(
            "canopy-test-{}.db",
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos()
        );
        dir.join(f).to_string_lossy().to_string()
    }

    fn checkpoint(i: i64) -> Checkpoint {
        let mut snapshot = AllPolicies::from_nodes([Node::container("org", ""), Node::leaf(&format!("p{i}"), "org")]);
        snapshot.upsert_sync(SyncRegistration::new("s"));
        let mut names = NameMap::new();
        names.insert(String::new(), "org".into());
        Checkpoint { marker: ResumeMarker::new(format!("m{i}")).unwrap(), snapshot, names, ts: i }
    }

    #[test]
    fn put_load_rotate() {
        let path = temp_db();
        let s = SqliteCheckpointStore::open(&path).unwrap();
        assert!(s.load_latest().unwrap().is_none());
        for i in 0..5 {
            s.put(&checkpoint(i)).unwrap();
        }
        let rows = s.history(None).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].marker.to_string(), "m4");
        assert_eq!(rows[2].marker.to_string(), "m2");

        let latest = s.load_latest().unwrap().unwrap();
        assert_eq!(latest, checkpoint(4));
    }

    #[test]
    fn streams_are_isolated() {
        let path = temp_db();
        let mut a = SqliteCheckpointStore::open(&path).unwrap().with_stream("a");
        let b = SqliteCheckpointStore::open(&path).unwrap().with_stream("b").with_keep(0);
        a.commit(&checkpoint(1)).unwrap();
        b.put(&checkpoint(2)).unwrap();
        b.put(&checkpoint(3)).unwrap();
        assert_eq!(a.load_latest().unwrap().unwrap().marker.to_string(), "m1");
        assert_eq!(b.history(Some(10)).unwrap().len(), 1);
    }
}
