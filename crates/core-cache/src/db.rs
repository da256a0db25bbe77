//! SQLite store bootstrap.
//!
//! The schema ships as a packaged SQL file applied verbatim on every open
//! (idempotent `if not exists` statements). Concurrency is handled by a
//! busy handler with exponential backoff plus jitter, capped around four
//! seconds; if the database stays locked past that the operation fails and
//! the daemon treats it as fatal.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use rusqlite::Connection;
use thiserror::Error;
use tracing::error;

const SCHEMA: &str = include_str!("schema.sql");

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("database: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("daemon unreachable: {0}")]
    Unreachable(String),
}

fn busy_backoff(retries: i32) -> bool {
    // Powers of two from 64us; give up past ~4s cumulative.
    const START_POW_2: i32 = 6;
    const END_POW_2: i32 = 22;
    if retries > END_POW_2 - START_POW_2 {
        return false;
    }
    let base: u64 = 1 << START_POW_2;
    let wait = base << retries.max(0) as u64;
    let jitter = rand::thread_rng().gen_range(0..wait.max(1));
    std::thread::sleep(Duration::from_micros(wait + jitter));
    true
}

pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    /// Open (creating if necessary) `cache.db` under the cache root and
    /// apply the schema.
    pub fn open(cache_dir: &Path) -> Result<Self, CacheError> {
        std::fs::create_dir_all(cache_dir)?;
        let path = cache_dir.join("cache.db");
        let conn = Connection::open(&path)?;
        conn.busy_handler(Some(busy_backoff))?;
        conn.pragma_update(None, "foreign_keys", "on")?;
        if let Err(e) = conn.execute_batch(SCHEMA) {
            error!(target: "cache.db", error = %e, "schema bootstrap failed");
            return Err(e.into());
        }
        Ok(Self { conn, path })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_applies_and_reapplies() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(dir.path()).unwrap();
            db.conn()
                .execute(
                    "insert into jobs(directory, commandline, environment, stdin, bloom_filter)
                     values('.', 'true', '', '', 0)",
                    [],
                )
                .unwrap();
        }
        // Second open must keep the data.
        let db = Database::open(dir.path()).unwrap();
        let n: i64 = db
            .conn()
            .query_row("select count(*) from jobs", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 1);
        let size: i64 = db
            .conn()
            .query_row("select size from total_size", [], |r| r.get(0))
            .unwrap();
        assert_eq!(size, 0);
    }

    #[test]
    fn cascade_deletes_children() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        db.conn()
            .execute(
                "insert into jobs(directory, commandline, environment, stdin, bloom_filter)
                 values('.', 'true', '', '', 0)",
                [],
            )
            .unwrap();
        let id = db.conn().last_insert_rowid();
        db.conn()
            .execute(
                "insert into input_files(path, hash, job) values('a.c', 'ff', ?1)",
                [id],
            )
            .unwrap();
        db.conn().execute("delete from jobs", []).unwrap();
        let n: i64 = db
            .conn()
            .query_row("select count(*) from input_files", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 0);
    }
}
