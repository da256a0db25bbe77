//! The eviction worker: a child process fed NUL-terminated JSON commands
//! on stdin.
//!
//! `read` refreshes a job's `last_use`; `write` adds the job's `obytes` to
//! the running total (a proxy for on-disk size that over-approximates
//! reflinked files and under-approximates re-copied ones — kept as-is,
//! flagged suspicious) and, past the high watermark, deletes the oldest
//! jobs by `last_use` until the low watermark is restored. Rows go first
//! in one transaction; the backing blob directories are unlinked by a
//! background thread at a gentle pace, joined before the next round so the
//! command loop stays responsive. A startup sweep removes group/job
//! directories the database does not know about.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::params;
use tracing::{error, info, warn};

use crate::db::{CacheError, Database};
use crate::fsutil::group_name;
use crate::types::EvictionCommand;
use crate::wire::{MessageParser, ParserState};

pub trait EvictionPolicy {
    fn init(&mut self, cache_dir: &Path) -> Result<(), CacheError>;
    fn read(&mut self, job_id: i64);
    fn write(&mut self, job_id: i64);
}

/// Logs commands and never evicts; a debugging aid.
#[derive(Default)]
pub struct NilEvictionPolicy;

impl EvictionPolicy for NilEvictionPolicy {
    fn init(&mut self, cache_dir: &Path) -> Result<(), CacheError> {
        info!(target: "cache.evict", dir = %cache_dir.display(), "nil policy armed");
        Ok(())
    }

    fn read(&mut self, job_id: i64) {
        info!(target: "cache.evict", job_id, "nil policy read");
    }

    fn write(&mut self, job_id: i64) {
        info!(target: "cache.evict", job_id, "nil policy write");
    }
}

pub struct LruEvictionPolicy {
    max_cache_size: u64,
    low_cache_size: u64,
    dir: PathBuf,
    db: Option<Database>,
    cleaner: Option<JoinHandle<()>>,
    sweeper: Option<JoinHandle<()>>,
}

impl LruEvictionPolicy {
    pub fn new(max_cache_size: u64, low_cache_size: u64) -> Self {
        Self {
            max_cache_size,
            low_cache_size,
            dir: PathBuf::new(),
            db: None,
            cleaner: None,
            sweeper: None,
        }
    }

    fn db(&mut self) -> &mut Database {
        self.db.as_mut().expect("policy used before init")
    }

    fn now_micros() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0)
    }

    fn mark_new_use(&mut self, job_id: i64) {
        let time = Self::now_micros();
        let conn = self.db().conn();
        // Only track jobs that still exist; a stale command for an evicted
        // job is silently ignored.
        let exists: Result<i64, _> =
            conn.query_row("select job_id from jobs where job_id = ?1", [job_id], |r| {
                r.get(0)
            });
        if exists.is_err() {
            return;
        }
        if let Err(e) = conn.execute(
            "insert into lru_stats(job_id, last_use) values(?1, ?2) \
             on conflict(job_id) do update set last_use = excluded.last_use",
            params![job_id, time],
        ) {
            error!(target: "cache.evict", job_id, error = %e, "last_use update failed");
        }
    }

    /// Account the new job and return the updated running total.
    fn add_job_size(&mut self, job_id: i64) -> u64 {
        let conn = self.db().conn();
        let _ = conn.execute(
            "update total_size set size = size + \
             (select coalesce(sum(o.obytes), 0) from jobs j, job_output_info o \
              where j.job_id = ?1 and j.job_id = o.job)",
            [job_id],
        );
        conn.query_row("select size from total_size", [], |r| r.get::<_, i64>(0))
            .map(|v| v.max(0) as u64)
            .unwrap_or(0)
    }

    /// Delete the oldest jobs until roughly `bytes_to_remove` bytes of
    /// accounted size are gone, then unlink their blobs in the background.
    fn cleanup(&mut self, current_size: u64, bytes_to_remove: u64) {
        let mut doomed: Vec<i64> = Vec::new();
        let mut last_use: i64 = 0;
        let mut removed: u64 = 0;
        {
            let conn = self.db().conn();
            let rows = conn.prepare(
                "select l.last_use, o.obytes, j.job_id \
                 from lru_stats l, jobs j, job_output_info o \
                 where l.job_id = j.job_id and o.job = j.job_id \
                 order by l.last_use",
            );
            let mut stmt = match rows {
                Ok(s) => s,
                Err(e) => {
                    error!(target: "cache.evict", error = %e, "lru scan failed");
                    return;
                }
            };
            let iter = stmt.query_map([], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?, r.get::<_, i64>(2)?))
            });
            let Ok(iter) = iter else { return };
            let mut to_remove = bytes_to_remove;
            for row in iter.flatten() {
                let (use_time, obytes, job_id) = row;
                let obytes = obytes.max(0) as u64;
                last_use = use_time;
                doomed.push(job_id);
                removed += obytes;
                if obytes > to_remove {
                    break;
                }
                to_remove -= obytes;
            }
        }
        if doomed.is_empty() {
            return;
        }

        let new_size = current_size.saturating_sub(removed);
        {
            let db = self.db();
            let conn = db.conn_mut();
            let result = conn
                .transaction()
                .and_then(|tx| {
                    tx.execute(
                        "delete from jobs where job_id in \
                         (select job_id from lru_stats where last_use <= ?1)",
                        [last_use],
                    )?;
                    tx.execute("update total_size set size = ?1", [new_size as i64])?;
                    tx.commit()
                });
            if let Err(e) = result {
                error!(target: "cache.evict", error = %e, "eviction transaction failed");
                return;
            }
        }
        info!(
            target: "cache.evict",
            evicted = doomed.len(),
            freed_bytes = removed,
            remaining_bytes = new_size,
            "evicted_lru_jobs"
        );

        // Unlink blob directories off the command loop; join the previous
        // round first so at most one deleter runs.
        if let Some(prev) = self.cleaner.take() {
            let _ = prev.join();
        }
        let dir = self.dir.clone();
        self.cleaner = Some(std::thread::spawn(move || {
            for job_id in doomed {
                remove_job_dir(&dir.join(group_name(job_id)).join(job_id.to_string()));
            }
        }));
    }
}

impl EvictionPolicy for LruEvictionPolicy {
    fn init(&mut self, cache_dir: &Path) -> Result<(), CacheError> {
        self.dir = cache_dir.to_path_buf();
        self.db = Some(Database::open(cache_dir)?);
        // Orphan sweep in the background: remove job directories the
        // database does not know about.
        let sweep_db = Database::open(cache_dir)?;
        let dir = self.dir.clone();
        self.sweeper = Some(std::thread::spawn(move || {
            sweep_orphans(&sweep_db, &dir);
        }));
        Ok(())
    }

    fn read(&mut self, job_id: i64) {
        self.mark_new_use(job_id);
    }

    fn write(&mut self, job_id: i64) {
        self.mark_new_use(job_id);
        let size = self.add_job_size(job_id);
        if size > self.max_cache_size {
            let target = self.max_cache_size.saturating_sub(self.low_cache_size);
            self.cleanup(size, target.max(1));
        }
    }
}

/// Unlink one job directory at a rate-limited pace; failures are logged
/// and skipped so one bad entry never wedges the deleter.
fn remove_job_dir(job_dir: &Path) {
    let entries = match std::fs::read_dir(job_dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => {
            warn!(target: "cache.evict", dir = %job_dir.display(), error = %e, "open_job_dir_failed");
            return;
        }
    };
    for entry in entries.flatten() {
        let _ = std::fs::remove_file(entry.path());
        std::thread::sleep(Duration::from_micros(200));
    }
    let _ = std::fs::remove_dir(job_dir);
}

/// Remove every `<group>/<id>` directory whose id the database does not
/// know. Ids above the largest seen at startup are in-flight insertions
/// and are left alone.
fn sweep_orphans(db: &Database, dir: &Path) {
    let mut known = std::collections::HashSet::new();
    let mut max_job: i64 = -1;
    {
        let stmt = db.conn().prepare("select job_id from jobs");
        let Ok(mut stmt) = stmt else { return };
        let Ok(rows) = stmt.query_map([], |r| r.get::<_, i64>(0)) else {
            return;
        };
        for id in rows.flatten() {
            max_job = max_job.max(id);
            known.insert(id);
        }
    }

    for group in 0..=0xFFu32 {
        let group_dir = dir.join(format!("{group:02x}"));
        let Ok(entries) = std::fs::read_dir(&group_dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|s| s.parse::<i64>().ok()) else {
                continue;
            };
            if id > max_job || known.contains(&id) {
                continue;
            }
            info!(target: "cache.evict", job_id = id, "removing_orphaned_job_dir");
            remove_job_dir(&entry.path());
        }
    }
}

/// The worker's command loop: parse NUL-delimited JSON commands from
/// `source` until the pipe closes. Malformed input is fatal.
pub fn eviction_loop(
    cache_dir: &Path,
    mut policy: Box<dyn EvictionPolicy>,
    source: impl Read,
) -> Result<(), CacheError> {
    policy.init(cache_dir)?;

    let mut parser = MessageParser::new(source);
    let mut msgs = Vec::new();
    loop {
        let state = parser.read_messages(&mut msgs);
        for msg in msgs.drain(..) {
            let cmd: EvictionCommand = serde_json::from_str(&msg)
                .map_err(|e| CacheError::Protocol(format!("bad eviction command: {e}")))?;
            match cmd {
                EvictionCommand::Read { job_id } => policy.read(job_id),
                EvictionCommand::Write { size } => policy.write(size),
            }
        }
        match state {
            ParserState::Continue => {}
            ParserState::StopSuccess => return Ok(()),
            ParserState::StopFail => {
                return Err(CacheError::Protocol("eviction pipe read failed".into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CacheStore, NullSink};
    use crate::types::{AddJobRequest, OutputFile};

    fn add_job(store: &mut CacheStore, dir: &Path, name: &str, obytes: u64) -> i64 {
        let src = dir.join(name);
        std::fs::write(&src, name).unwrap();
        let mut req = AddJobRequest {
            cwd: "/w".into(),
            command_line: format!("make\0{name}"),
            obytes,
            ..AddJobRequest::default()
        };
        req.outputs.push(OutputFile {
            source: src.display().to_string(),
            path: format!("out/{name}"),
            hash: crate::fsutil::hash_bytes(name.as_bytes()),
            mode: 0o644,
        });
        store.add(&req, &mut NullSink).unwrap()
    }

    #[test]
    fn lru_write_evicts_oldest_past_watermark() {
        let tmp = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let mut store = CacheStore::open(tmp.path()).unwrap();
        let a = add_job(&mut store, scratch.path(), "a.o", 600);
        let b = add_job(&mut store, scratch.path(), "b.o", 600);
        drop(store);

        let mut policy = LruEvictionPolicy::new(1000, 500);
        policy.init(tmp.path()).unwrap();
        policy.write(a); // total 600, under the watermark
        std::thread::sleep(Duration::from_millis(2));
        policy.write(b); // total 1200 > 1000: evict oldest until 500 freed

        if let Some(c) = policy.cleaner.take() {
            c.join().unwrap();
        }
        let db = Database::open(tmp.path()).unwrap();
        let alive: Vec<i64> = db
            .conn()
            .prepare("select job_id from jobs order by job_id")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        // The older job went; the newer one survives.
        assert_eq!(alive, vec![b]);
        assert!(!tmp
            .path()
            .join(crate::fsutil::group_name(a))
            .join(a.to_string())
            .exists());
    }

    #[test]
    fn orphan_sweep_removes_unknown_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let mut store = CacheStore::open(tmp.path()).unwrap();
        let real = add_job(&mut store, scratch.path(), "real.o", 10);
        // Fabricate an orphan directory with an id below the max.
        let orphan = tmp.path().join(crate::fsutil::group_name(0)).join("0");
        std::fs::create_dir_all(&orphan).unwrap();
        std::fs::write(orphan.join("junk"), b"junk").unwrap();
        drop(store);

        let db = Database::open(tmp.path()).unwrap();
        sweep_orphans(&db, tmp.path());
        assert!(!orphan.exists());
        assert!(tmp
            .path()
            .join(crate::fsutil::group_name(real))
            .join(real.to_string())
            .exists());
    }

    #[test]
    fn command_loop_dispatches_and_stops() {
        let tmp = tempfile::tempdir().unwrap();
        let _store = CacheStore::open(tmp.path()).unwrap();
        let script = "{\"command\":\"read\",\"job_id\":1}\0{\"command\":\"write\",\"size\":1}\0";
        let policy = Box::new(NilEvictionPolicy);
        eviction_loop(tmp.path(), policy, std::io::Cursor::new(script.as_bytes())).unwrap();
    }

    #[test]
    fn malformed_command_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let _store = CacheStore::open(tmp.path()).unwrap();
        let policy = Box::new(NilEvictionPolicy);
        let err = eviction_loop(
            tmp.path(),
            policy,
            std::io::Cursor::new(b"not json\0".to_vec()),
        );
        assert!(err.is_err());
    }
}
