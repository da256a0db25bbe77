//! The cache store: lookup within one transaction, hard-link staged
//! restoration, and staged atomic insertion.
//!
//! Writes follow "files first, rows second, rename last": blobs are copied
//! into a transient directory, one transaction inserts every row, and the
//! directory is renamed into its group shard. Readers must therefore
//! tolerate the opposite skew — rows present but files missing reads as a
//! miss, and the orphan sweep reclaims the rows later.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use rusqlite::{params, TransactionBehavior};
use tracing::{debug, info, warn};

use crate::db::{CacheError, Database};
use crate::fsutil::{copy_with_mode, group_name, mkdir_p, unique_name};
use crate::trie::PathTrie;
use crate::types::{
    AddJobRequest, CachedOutputFile, EvictionCommand, FindJobRequest, JobOutputInfo, MatchingJob,
    OutputDirectory, OutputSymlink,
};

/// Sink for eviction commands; the daemon points this at the worker's
/// stdin, tests usually collect or drop them.
pub trait EvictionSink: Send {
    fn send(&mut self, cmd: EvictionCommand);
}

/// Drops every command.
pub struct NullSink;

impl EvictionSink for NullSink {
    fn send(&mut self, _cmd: EvictionCommand) {}
}

pub struct CacheStore {
    dir: PathBuf,
    db: Database,
}

impl CacheStore {
    pub fn open(dir: &Path) -> Result<Self, CacheError> {
        mkdir_p(dir)?;
        let db = Database::open(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            db,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    // -----------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------

    /// Find a job matching the request exactly: the four key strings, the
    /// bloom subset test, then every recorded input hash verified against
    /// what the requester can see. Runs in one transaction.
    fn find(&mut self, req: &FindJobRequest) -> Result<Option<(i64, MatchingJob)>, CacheError> {
        let tx = self
            .db
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidates: Vec<i64> = {
            let mut stmt = tx.prepare_cached(
                "select job_id from jobs \
                 where directory = ?1 and commandline = ?2 \
                 and environment = ?3 and stdin = ?4 \
                 and bloom_filter & ~?5 = 0",
            )?;
            let rows = stmt.query_map(
                params![
                    req.cwd,
                    req.command_line,
                    req.environment,
                    req.stdin,
                    req.bloom_filter.0 as i64
                ],
                |r| r.get(0),
            )?;
            rows.collect::<Result<_, _>>()?
        };

        for job_id in candidates {
            let Some(info) = read_output_info(&tx, job_id)? else {
                continue;
            };

            let input_files = read_pairs(&tx, "select path, hash from input_files where job = ?1", job_id)?;
            if !input_files
                .iter()
                .all(|(path, hash)| req.visible.get(path) == Some(hash))
            {
                continue;
            }
            let input_dirs = read_pairs(&tx, "select path, hash from input_dirs where job = ?1", job_id)?;
            if !input_dirs
                .iter()
                .all(|(path, hash)| req.dir_hashes.get(path) == Some(hash))
            {
                continue;
            }

            // This job matches exactly; collect its outputs.
            let mut result = MatchingJob {
                output_info: info,
                input_files: input_files.into_iter().map(|(p, _)| p).collect(),
                input_dirs: input_dirs.into_iter().map(|(p, _)| p).collect(),
                ..MatchingJob::default()
            };
            {
                let mut stmt = tx
                    .prepare_cached("select path, hash, mode from output_files where job = ?1")?;
                let rows = stmt.query_map([job_id], |r| {
                    Ok(CachedOutputFile {
                        path: r.get(0)?,
                        hash: r.get(1)?,
                        mode: r.get::<_, i64>(2)? as u32,
                    })
                })?;
                result.output_files = rows.collect::<Result<_, _>>()?;
            }
            {
                let mut stmt =
                    tx.prepare_cached("select path, mode from output_dirs where job = ?1")?;
                let rows = stmt.query_map([job_id], |r| {
                    Ok(OutputDirectory {
                        path: r.get(0)?,
                        mode: r.get::<_, i64>(1)? as u32,
                    })
                })?;
                result.output_dirs = rows.collect::<Result<_, _>>()?;
            }
            {
                let mut stmt =
                    tx.prepare_cached("select path, value from output_symlinks where job = ?1")?;
                let rows = stmt.query_map([job_id], |r| {
                    Ok(OutputSymlink {
                        path: r.get(0)?,
                        target: r.get(1)?,
                    })
                })?;
                result.output_symlinks = rows.collect::<Result<_, _>>()?;
            }

            tx.commit()?;
            return Ok(Some((job_id, result)));
        }

        tx.commit()?;
        Ok(None)
    }

    // -----------------------------------------------------------------
    // Restoration
    // -----------------------------------------------------------------

    /// Look up and, on a hit, restore the job's outputs into the
    /// requester's tree. Any staging failure (the eviction worker may be
    /// unlinking blobs under us) downgrades to a miss.
    pub fn read(
        &mut self,
        req: &FindJobRequest,
        evict: &mut dyn EvictionSink,
    ) -> Result<Option<MatchingJob>, CacheError> {
        let Some((job_id, mut result)) = self.find(req)? else {
            return Ok(None);
        };

        // Stage: hard-link every blob into a transient directory so a
        // concurrent eviction can at worst fail the whole read, never
        // corrupt a partial restore.
        let tmp_dir = self.dir.join(format!("tmp_outputs_{}", unique_name()));
        mkdir_p(&tmp_dir)?;
        let job_dir = self.dir.join(group_name(job_id)).join(job_id.to_string());

        let mut staged: Vec<(PathBuf, String, u32)> = Vec::new();
        let mut success = true;
        for out in &result.output_files {
            let blob = job_dir.join(&out.hash);
            let tmp = tmp_dir.join(&out.hash);
            match fs::hard_link(&blob, &tmp) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => {
                    debug!(
                        target: "cache.store",
                        job_id,
                        blob = %blob.display(),
                        error = %e,
                        "stage_link_failed"
                    );
                    success = false;
                    break;
                }
            }
            staged.push((tmp, out.path.clone(), out.mode));
        }

        let redirects = PathTrie::from_map(&req.dir_redirects);
        if success {
            // Directories first, shortest paths first, honoring modes.
            let mut dirs = result.output_dirs.clone();
            dirs.sort_by_key(|d| d.path.len());
            for d in &dirs {
                let target = redirects.redirect(&d.path);
                let _ = fs::DirBuilder::new().recursive(true).create(&target);
                let _ = fs::set_permissions(&target, fs::Permissions::from_mode(d.mode));
            }

            for (tmp, recorded_path, mode) in &staged {
                let target = redirects.redirect(recorded_path);
                let target_path = Path::new(&target);
                if let Some(parent) = target_path.parent() {
                    mkdir_p(parent)?;
                }
                let shadow = format!("{target}.{}", unique_name());
                copy_with_mode(tmp, Path::new(&shadow), *mode)?;
                fs::rename(&shadow, target_path)?;
            }

            for link in &result.output_symlinks {
                let target = redirects.redirect(&link.path);
                let target_path = Path::new(&target);
                if let Some(parent) = target_path.parent() {
                    mkdir_p(parent)?;
                }
                let shadow = format!("{target}.{}", unique_name());
                std::os::unix::fs::symlink(&link.target, &shadow)?;
                fs::rename(&shadow, target_path)?;
            }
        }

        for (tmp, _, _) in &staged {
            let _ = fs::remove_file(tmp);
        }
        let _ = fs::remove_dir(&tmp_dir);

        if !success {
            return Ok(None);
        }

        // The result still names sandbox paths; report real ones.
        for f in &mut result.output_files {
            f.path = redirects.redirect(&f.path);
        }
        for d in &mut result.output_dirs {
            d.path = redirects.redirect(&d.path);
        }
        for s in &mut result.output_symlinks {
            s.path = redirects.redirect(&s.path);
        }
        for p in result.input_files.iter_mut().chain(result.input_dirs.iter_mut()) {
            *p = redirects.redirect(p);
        }

        evict.send(EvictionCommand::Read { job_id });
        info!(target: "cache.store", job_id, "cache_hit");
        Ok(Some(result))
    }

    // -----------------------------------------------------------------
    // Insertion
    // -----------------------------------------------------------------

    /// Record a finished job: blobs into a transient directory, all rows
    /// in one transaction, then an atomic rename into the group shard.
    pub fn add(
        &mut self,
        req: &AddJobRequest,
        evict: &mut dyn EvictionSink,
    ) -> Result<i64, CacheError> {
        let tmp_dir = self.dir.join(format!("tmp_{}", unique_name()));
        mkdir_p(&tmp_dir)?;
        for out in &req.outputs {
            let blob = tmp_dir.join(&out.hash);
            copy_with_mode(Path::new(&out.source), &blob, out.mode)?;
        }

        let job_id = {
            let tx = self
                .db
                .conn_mut()
                .transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "insert into jobs(directory, commandline, environment, stdin, bloom_filter) \
                 values(?1, ?2, ?3, ?4, ?5)",
                params![
                    req.cwd,
                    req.command_line,
                    req.environment,
                    req.stdin,
                    req.bloom_filter.0 as i64
                ],
            )?;
            let job_id = tx.last_insert_rowid();
            tx.execute(
                "insert into job_output_info(job, stdout, stderr, ret, runtime, cputime, mem, ibytes, obytes) \
                 values(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    job_id,
                    req.stdout,
                    req.stderr,
                    req.status,
                    req.runtime,
                    req.cputime,
                    req.mem as i64,
                    req.ibytes as i64,
                    req.obytes as i64
                ],
            )?;
            for f in &req.inputs {
                tx.execute(
                    "insert into input_files(path, hash, job) values(?1, ?2, ?3)",
                    params![f.path, f.hash, job_id],
                )?;
            }
            for d in &req.input_dirs {
                tx.execute(
                    "insert into input_dirs(path, hash, job) values(?1, ?2, ?3)",
                    params![d.path, d.hash, job_id],
                )?;
            }
            for o in &req.outputs {
                tx.execute(
                    "insert into output_files(path, hash, mode, job) values(?1, ?2, ?3, ?4)",
                    params![o.path, o.hash, o.mode as i64, job_id],
                )?;
            }
            for d in &req.output_dirs {
                tx.execute(
                    "insert into output_dirs(path, mode, job) values(?1, ?2, ?3)",
                    params![d.path, d.mode as i64, job_id],
                )?;
            }
            for s in &req.output_symlinks {
                tx.execute(
                    "insert into output_symlinks(path, value, job) values(?1, ?2, ?3)",
                    params![s.path, s.target, job_id],
                )?;
            }
            // The rows commit before the blobs reach their final home; a
            // read in that window sees missing files and reports a miss.
            tx.commit()?;
            job_id
        };

        let group_dir = self.dir.join(group_name(job_id));
        mkdir_p(&group_dir)?;
        let job_dir = group_dir.join(job_id.to_string());
        if let Err(e) = fs::rename(&tmp_dir, &job_dir) {
            warn!(target: "cache.store", job_id, error = %e, "blob rename failed; entry will read as miss");
        }

        evict.send(EvictionCommand::Write { size: job_id });
        info!(target: "cache.store", job_id, outputs = req.outputs.len(), "cache_add");
        Ok(job_id)
    }
}

fn read_output_info(
    tx: &rusqlite::Transaction<'_>,
    job_id: i64,
) -> Result<Option<JobOutputInfo>, CacheError> {
    let mut stmt = tx.prepare_cached(
        "select stdout, stderr, ret, runtime, cputime, mem, ibytes, obytes \
         from job_output_info where job = ?1",
    )?;
    let mut rows = stmt.query([job_id])?;
    let Some(row) = rows.next()? else {
        return Ok(None);
    };
    Ok(Some(JobOutputInfo {
        stdout: row.get(0)?,
        stderr: row.get(1)?,
        status: row.get(2)?,
        runtime: row.get(3)?,
        cputime: row.get(4)?,
        mem: row.get::<_, i64>(5)? as u64,
        ibytes: row.get::<_, i64>(6)? as u64,
        obytes: row.get::<_, i64>(7)? as u64,
    }))
}

fn read_pairs(
    tx: &rusqlite::Transaction<'_>,
    sql: &str,
    job_id: i64,
) -> Result<Vec<(String, String)>, CacheError> {
    let mut stmt = tx.prepare_cached(sql)?;
    let rows = stmt.query_map([job_id], |r| Ok((r.get(0)?, r.get(1)?)))?;
    Ok(rows.collect::<Result<_, _>>()?)
}
