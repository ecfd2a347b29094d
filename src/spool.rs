// src/spool.rs
//
// Durable local FIFO queue backed by SQLite, buffering encoded samples
// before upload. This is the no-data-loss anchor of the edge agent:
// samples are written here before any upload attempt and deleted only
// after server acknowledgment. The file survives process restarts.
//
// AUTOINCREMENT keeps sequence numbers strictly monotonic - a deleted
// sequence is never handed out again, even across restarts.

use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS spool (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
";

/// Durable FIFO spool with peek/ack semantics.
///
/// The handle is cheaply cloneable; all mutations serialise through the
/// internal mutex, so concurrent enqueue and peek from independent tasks
/// cannot corrupt state. rusqlite::Connection is !Sync, hence Mutex.
#[derive(Clone)]
pub struct Spool {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Spool {
    /// Open (or create) the spool database at `path` and initialise the
    /// schema. WAL mode plus synchronous=FULL makes a returned `enqueue`
    /// visible to a fresh process after crash/restart.
    pub fn open(path: &Path) -> Result<Self, String> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| format!("Failed to create spool dir: {}", e))?;
            }
        }

        let conn = Connection::open(path)
            .map_err(|e| format!("Failed to open spool database: {}", e))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| format!("Failed to set WAL mode: {}", e))?;
        // FULL, not NORMAL: enqueue must be durable before it returns
        conn.execute_batch("PRAGMA synchronous=FULL;")
            .map_err(|e| format!("Failed to set synchronous mode: {}", e))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| format!("Failed to create spool schema: {}", e))?;

        Ok(Spool {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
        })
    }

    /// Append one payload. Durable before return.
    pub fn enqueue(&self, payload: &str) -> Result<(), String> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare_cached("INSERT INTO spool (payload) VALUES (?1)")
            .map_err(|e| format!("Failed to prepare enqueue: {}", e))?;
        stmt.execute(params![payload])
            .map_err(|e| format!("Failed to enqueue payload: {}", e))?;
        Ok(())
    }

    /// Return up to `n` oldest pending payloads without removing them,
    /// ordered by ascending sequence. Empty when the spool is empty or
    /// `n` is zero.
    pub fn peek(&self, n: usize) -> Result<Vec<(i64, String)>, String> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare_cached("SELECT seq, payload FROM spool ORDER BY seq ASC LIMIT ?1")
            .map_err(|e| format!("Failed to prepare peek: {}", e))?;

        let rows = stmt
            .query_map(params![n as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| format!("Failed to peek spool: {}", e))?;

        let mut result = Vec::with_capacity(n);
        for row in rows {
            result.push(row.map_err(|e| format!("Failed to read spool row: {}", e))?);
        }
        Ok(result)
    }

    /// Delete exactly the listed sequences (server-confirmed rows).
    /// Unknown sequences are silently ignored; an empty list is a no-op.
    pub fn ack(&self, seqs: &[i64]) -> Result<(), String> {
        if seqs.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock().unwrap();
        let placeholders = seqs.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("DELETE FROM spool WHERE seq IN ({})", placeholders);
        conn.execute(&sql, rusqlite::params_from_iter(seqs.iter()))
            .map_err(|e| format!("Failed to ack spool rows: {}", e))?;
        Ok(())
    }

    /// Number of pending (unacknowledged) payloads.
    pub fn count(&self) -> Result<u64, String> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM spool", [], |row| row.get(0))
            .map_err(|e| format!("Failed to count spool: {}", e))?;
        Ok(count as u64)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_spool_path() -> PathBuf {
        std::env::temp_dir().join(format!("sunlink-spool-test-{}.db", uuid::Uuid::new_v4()))
    }

    fn cleanup(path: &Path) {
        let _ = std::fs::remove_file(path);
        let _ = std::fs::remove_file(path.with_extension("db-wal"));
        let _ = std::fs::remove_file(path.with_extension("db-shm"));
    }

    #[test]
    fn test_enqueue_peek_fifo_order() {
        let path = temp_spool_path();
        let spool = Spool::open(&path).unwrap();

        spool.enqueue("a").unwrap();
        spool.enqueue("b").unwrap();
        spool.enqueue("c").unwrap();

        let rows = spool.peek(10).unwrap();
        let payloads: Vec<&str> = rows.iter().map(|(_, p)| p.as_str()).collect();
        assert_eq!(payloads, vec!["a", "b", "c"]);
        // peek does not remove
        assert_eq!(spool.count().unwrap(), 3);
        // sequences strictly increasing
        assert!(rows[0].0 < rows[1].0 && rows[1].0 < rows[2].0);

        cleanup(&path);
    }

    #[test]
    fn test_peek_zero_and_empty() {
        let path = temp_spool_path();
        let spool = Spool::open(&path).unwrap();
        assert!(spool.peek(0).unwrap().is_empty());
        assert!(spool.peek(5).unwrap().is_empty());
        cleanup(&path);
    }

    #[test]
    fn test_ack_removes_only_listed_rows() {
        let path = temp_spool_path();
        let spool = Spool::open(&path).unwrap();

        spool.enqueue("a").unwrap();
        spool.enqueue("b").unwrap();
        spool.enqueue("c").unwrap();
        let rows = spool.peek(3).unwrap();

        spool.ack(&[rows[0].0, rows[2].0]).unwrap();

        let remaining = spool.peek(10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].1, "b");

        cleanup(&path);
    }

    #[test]
    fn test_ack_unknown_and_empty_are_noops() {
        let path = temp_spool_path();
        let spool = Spool::open(&path).unwrap();

        spool.enqueue("a").unwrap();
        spool.ack(&[]).unwrap();
        spool.ack(&[99999]).unwrap();
        assert_eq!(spool.count().unwrap(), 1);

        cleanup(&path);
    }

    #[test]
    fn test_durable_across_reopen() {
        let path = temp_spool_path();

        {
            let spool = Spool::open(&path).unwrap();
            spool.enqueue("one").unwrap();
            spool.enqueue("two").unwrap();
            spool.enqueue("three").unwrap();
        }

        // Fresh handle simulates a fresh process after restart
        let first_two: Vec<i64> = {
            let spool = Spool::open(&path).unwrap();
            let rows = spool.peek(10).unwrap();
            let payloads: Vec<&str> = rows.iter().map(|(_, p)| p.as_str()).collect();
            assert_eq!(payloads, vec!["one", "two", "three"]);
            let acked: Vec<i64> = rows[..2].iter().map(|(seq, _)| *seq).collect();
            spool.ack(&acked).unwrap();
            acked
        };

        let spool = Spool::open(&path).unwrap();
        assert_eq!(spool.count().unwrap(), 1);
        let rows = spool.peek(10).unwrap();
        assert_eq!(rows[0].1, "three");
        assert!(!first_two.contains(&rows[0].0));

        cleanup(&path);
    }

    #[test]
    fn test_sequences_never_reused_after_delete() {
        let path = temp_spool_path();
        let spool = Spool::open(&path).unwrap();

        spool.enqueue("a").unwrap();
        spool.enqueue("b").unwrap();
        let rows = spool.peek(2).unwrap();
        let max_seq = rows[1].0;
        spool.ack(&rows.iter().map(|(s, _)| *s).collect::<Vec<_>>()).unwrap();

        spool.enqueue("c").unwrap();
        let rows = spool.peek(1).unwrap();
        assert!(rows[0].0 > max_seq, "sequence was reused after delete");

        cleanup(&path);
    }

    #[test]
    fn test_concurrent_enqueue_and_peek() {
        let path = temp_spool_path();
        let spool = Spool::open(&path).unwrap();

        let writer = {
            let spool = spool.clone();
            std::thread::spawn(move || {
                for i in 0..50 {
                    spool.enqueue(&format!("w-{}", i)).unwrap();
                }
            })
        };
        let reader = {
            let spool = spool.clone();
            std::thread::spawn(move || {
                for _ in 0..50 {
                    let _ = spool.peek(10).unwrap();
                }
            })
        };
        writer.join().unwrap();
        reader.join().unwrap();

        assert_eq!(spool.count().unwrap(), 50);

        cleanup(&path);
    }
}
