//! The job table: admission control, process launch, output collection,
//! and the wake-ups that feed job results back into the evaluator.
//!
//! Collection is channel-driven: every launched child gets two pipe reader
//! threads and one reaper thread (blocking `wait4`, which also yields the
//! child's rusage); all three feed one crossbeam channel the scheduler
//! drains with a timeout. The evaluator and the scheduler alternate on the
//! main thread: when the work stack runs dry, `wait` blocks for external
//! events and schedules `Job` wake-ups back onto the stack.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use core_eval::{EvalServices, Runtime, WORK_EXTERNAL};
use core_heap::{job, Addr, GcNeeded, Heap, RootId, NIL};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use num_bigint::BigInt;
use tracing::{debug, error, info, warn};

use crate::signal::exit_asap;
use crate::status::{CriticalJob, StatusState, ALMOST_ONE};
use crate::usage::Usage;

/// How many times to SIGTERM a process before SIGKILL.
const TERM_ATTEMPTS: u32 = 6;
/// Gap before the second SIGTERM attempt (doubles each round).
const TERM_BASE_GAP_MS: u64 = 100;

/// Constructor of the usage record delivered to `job_reality` waiters:
/// (status, runtime, cputime, mem, ibytes, obytes).
pub const CTOR_USAGE: usize = 0;

/// Cache interface the scheduler-side primitives consume. Requests and
/// responses are the NUL-terminated JSON bodies of the daemon protocol,
/// minus the terminator.
pub trait JobCache: Send {
    /// `cache/read`: returns the FindJobResponse JSON, or None when the
    /// daemon could not be reached (treated as a miss).
    fn read(&mut self, request_json: &str) -> Option<String>;
    /// `cache/add`: fire and forget.
    fn add(&mut self, request_json: &str);
}

/// Everything the evaluator's primitives and external work need.
pub struct JobServices {
    pub table: JobTable,
    pub cache: Option<Box<dyn JobCache>>,
}

impl JobServices {
    pub fn new(table: JobTable) -> Self {
        Self { table, cache: None }
    }

    pub fn with_cache(table: JobTable, cache: Box<dyn JobCache>) -> Self {
        Self {
            table,
            cache: Some(cache),
        }
    }
}

/// A job that is requested but not yet forked.
pub struct Task {
    pub job: RootId,
    pub db_id: i64,
    pub dir: String,
    pub stdin_file: String,
    pub environ: String,
    pub cmdline: String,
    pub label: String,
    pub pathtime: f64,
    pub predict: Usage,
}

enum JobEvent {
    Stdout(i64, Vec<u8>),
    StdoutEof(i64),
    Stderr(i64, Vec<u8>),
    StderrEof(i64),
    Exited(i64, i32, Usage),
}

struct RunningJob {
    pid: i32,
    job: RootId,
    label: String,
    threads: f64,
    memory: u64,
    pathtime: f64,
    predict: Usage,
    start: Instant,
    stdout_done: bool,
    stderr_done: bool,
    merged: bool,
}

#[derive(Default)]
pub struct JobStreams {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

pub struct JobTable {
    pending: Vec<Task>,
    running: HashMap<i64, RunningJob>,
    tx: Sender<JobEvent>,
    rx: Receiver<JobEvent>,
    active: f64,
    limit: f64,
    phys_active: u64,
    phys_limit: u64,
    max_children: usize,
    next_db_id: i64,
    streams: HashMap<i64, JobStreams>,
    usage_by_id: HashMap<i64, Usage>,
    pub status: StatusState,
}

impl JobTable {
    pub fn new(cpus: f64, memory_bytes: u64, reserved_fds: u64) -> Self {
        let (tx, rx) = unbounded();
        Self {
            pending: Vec::new(),
            running: HashMap::new(),
            tx,
            rx,
            active: 0.0,
            limit: cpus,
            phys_active: 0,
            phys_limit: memory_bytes,
            max_children: child_cap(cpus, reserved_fds),
            next_db_id: 0,
            streams: HashMap::new(),
            usage_by_id: HashMap::new(),
            status: StatusState::default(),
        }
    }

    pub fn next_db_id(&mut self) -> i64 {
        self.next_db_id += 1;
        self.next_db_id
    }

    /// Request a launch; the task runs when the budgets admit it.
    pub fn enqueue(&mut self, task: Task) {
        self.status.admit(task.pathtime, task.predict.runtime);
        self.pending.push(task);
    }

    pub fn pending_count(&self) -> usize {
        self.running.len() + self.pending.len()
    }

    /// Collected output text of a job (so far, or final after EOF).
    pub fn streams(&self, db_id: i64) -> Option<&JobStreams> {
        self.streams.get(&db_id)
    }

    /// Measured usage of a merged job.
    pub fn usage(&self, db_id: i64) -> Option<Usage> {
        self.usage_by_id.get(&db_id).copied()
    }

    /// Longest path through pending and running work above `nexttime`.
    fn crit_job(&self, nexttime: f64) -> CriticalJob {
        let mut out = CriticalJob {
            pathtime: nexttime,
            runtime: 0.0,
        };
        for r in self.running.values() {
            if r.pathtime > out.pathtime {
                out.pathtime = r.pathtime;
                out.runtime = r.predict.runtime;
            }
        }
        for t in &self.pending {
            if t.pathtime > out.pathtime {
                out.pathtime = t.pathtime;
                out.runtime = t.predict.runtime;
            }
        }
        out
    }

    // -----------------------------------------------------------------
    // Admission and launch
    // -----------------------------------------------------------------

    /// Pick the most urgent pending task: anything awaited on stdout or
    /// stderr first, then unknown runtimes, then the longest critical
    /// path, with the newest database id breaking ties.
    fn pick_best(&self, rt: &Runtime) -> Option<usize> {
        let awaited = |t: &Task| {
            let j = rt.heap.get_root(t.job);
            rt.heap.job_ptr(j, job::Q_STDOUT) != NIL || rt.heap.job_ptr(j, job::Q_STDERR) != NIL
        };
        let better = |a: &Task, b: &Task| {
            let (aw_a, aw_b) = (awaited(a), awaited(b));
            if aw_a != aw_b {
                return aw_a;
            }
            let (un_a, un_b) = (a.predict.runtime == 0.0, b.predict.runtime == 0.0);
            if un_a != un_b {
                return un_a;
            }
            if a.pathtime != b.pathtime {
                return a.pathtime > b.pathtime;
            }
            a.db_id > b.db_id
        };
        let mut best: Option<usize> = None;
        for (i, t) in self.pending.iter().enumerate() {
            match best {
                None => best = Some(i),
                Some(j) if better(t, &self.pending[j]) => best = Some(i),
                _ => {}
            }
        }
        best
    }

    /// Launch pending tasks while the budgets admit them. CPU may
    /// oversubscribe (forward progress beats precision); memory is
    /// conservative unless nothing is running at all. Returns how many
    /// launches failed outright (those complete immediately, so the
    /// evaluator already has work).
    pub fn launch(&mut self, rt: &mut Runtime) -> usize {
        let mut failed = 0;
        while !self.pending.is_empty()
            && self.running.len() < self.max_children
            && self.active < self.limit
        {
            let Some(idx) = self.pick_best(rt) else { break };
            let memory = self.pending[idx].predict.memory();
            if self.phys_active != 0 && self.phys_active + memory > self.phys_limit {
                break;
            }
            let task = self.pending.swap_remove(idx);
            if !self.spawn_task(rt, task) {
                failed += 1;
            }
        }
        failed
    }

    fn spawn_task(&mut self, rt: &mut Runtime, task: Task) -> bool {
        let threads = task.predict.threads();
        let memory = task.predict.memory();
        let argv = split_nul(&task.cmdline);
        if argv.is_empty() {
            self.fail_launch(rt, &task, "empty command line");
            rt.heap.release_root(task.job);
            return false;
        }

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(&task.dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear();
        for kv in split_nul(&task.environ) {
            if let Some((k, v)) = kv.split_once('=') {
                cmd.env(k, v);
            }
        }
        if task.stdin_file.is_empty() {
            cmd.stdin(Stdio::null());
        } else {
            match File::open(&task.stdin_file) {
                Ok(f) => {
                    cmd.stdin(Stdio::from(f));
                }
                Err(e) => {
                    self.fail_launch(rt, &task, &format!("stdin {}: {e}", task.stdin_file));
                    rt.heap.release_root(task.job);
                    return false;
                }
            }
        }

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                self.fail_launch(rt, &task, &format!("spawn {}: {e}", argv[0]));
                rt.heap.release_root(task.job);
                return false;
            }
        };
        let pid = child.id() as i32;

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        spawn_reader(self.tx.clone(), task.db_id, stdout, true);
        spawn_reader(self.tx.clone(), task.db_id, stderr, false);
        spawn_reaper(self.tx.clone(), task.db_id, pid);
        // The pipe handles have moved to the reader threads and the reaper
        // owns the wait; the Child handle has nothing left to manage.
        drop(child);

        let addr = rt.heap.get_root(task.job);
        rt.heap
            .set_job_state(addr, rt.heap.job_state(addr) | job::FORKED);
        self.active += threads;
        self.phys_active += memory;
        self.streams.entry(task.db_id).or_default();
        info!(
            target: "jobs.launch",
            db_id = task.db_id,
            pid,
            label = %task.label,
            dir = %task.dir,
            threads,
            memory,
            "job_forked"
        );
        self.running.insert(
            task.db_id,
            RunningJob {
                pid,
                job: task.job,
                label: task.label,
                threads,
                memory,
                pathtime: task.pathtime,
                predict: task.predict,
                start: Instant::now(),
                stdout_done: false,
                stderr_done: false,
                merged: false,
            },
        );
        true
    }

    /// A task that could not even fork: complete it immediately with a
    /// negative status and the failure text on stderr.
    fn fail_launch(&mut self, rt: &mut Runtime, task: &Task, msg: &str) {
        error!(target: "jobs.launch", db_id = task.db_id, label = %task.label, error = msg, "launch_failed");
        let streams = self.streams.entry(task.db_id).or_default();
        streams.stderr.extend_from_slice(msg.as_bytes());
        streams.stderr.push(b'\n');
        self.usage_by_id.insert(
            task.db_id,
            Usage {
                found: true,
                status: -1,
                ..Usage::default()
            },
        );
        let addr = rt.heap.get_root(task.job);
        let state = job::FORKED | job::STDOUT | job::STDERR | job::MERGED;
        rt.heap.set_job_state(addr, state);
        schedule_wjob(rt, addr);
    }

    // -----------------------------------------------------------------
    // Waiting
    // -----------------------------------------------------------------

    /// Launch what fits, then block for external events until at least one
    /// job makes observable progress. Returns whether the evaluator has
    /// new work.
    pub fn wait(&mut self, rt: &mut Runtime) -> bool {
        // A failed launch completes instantly, so the evaluator already
        // has a wake-up to process.
        let mut compute = self.launch(rt) > 0;
        while !compute && !exit_asap() && !self.running.is_empty() {
            let ev = match self.rx.recv_timeout(Duration::from_millis(200)) {
                Ok(ev) => ev,
                Err(RecvTimeoutError::Timeout) => {
                    // Fallback for a critical job that never got scheduled.
                    let crit = self.crit_job(0.0);
                    self.status.rebase_if_stale(crit);
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };
            let mut done = self.handle_event(rt, ev);
            while let Ok(ev) = self.rx.try_recv() {
                done += self.handle_event(rt, ev);
            }
            if done > 0 {
                compute = true;
                break;
            }
        }
        compute
    }

    /// Apply one collector event; returns 1 when it completed a stage some
    /// computation may be waiting on.
    fn handle_event(&mut self, rt: &mut Runtime, ev: JobEvent) -> usize {
        match ev {
            JobEvent::Stdout(id, chunk) => {
                if let Some(s) = self.streams.get_mut(&id) {
                    s.stdout.extend_from_slice(&chunk);
                }
                0
            }
            JobEvent::Stderr(id, chunk) => {
                if let Some(s) = self.streams.get_mut(&id) {
                    s.stderr.extend_from_slice(&chunk);
                }
                0
            }
            JobEvent::StdoutEof(id) => self.finish_stage(rt, id, job::STDOUT),
            JobEvent::StderrEof(id) => self.finish_stage(rt, id, job::STDERR),
            JobEvent::Exited(id, code, mut usage) => {
                let Some(entry) = self.running.get_mut(&id) else {
                    return 0;
                };
                usage.found = true;
                usage.status = code;
                usage.runtime = entry.start.elapsed().as_secs_f64();
                entry.merged = true;
                let addr = rt.heap.get_root(entry.job);
                rt.heap
                    .set_job_state(addr, rt.heap.job_state(addr) | job::MERGED);
                debug!(
                    target: "jobs.reap",
                    db_id = id,
                    status = code,
                    runtime = usage.runtime,
                    cputime = usage.cputime,
                    "job_merged"
                );
                self.finish_reality(rt, id, usage);
                self.reap_if_complete(rt, id);
                1
            }
        }
    }

    fn finish_stage(&mut self, rt: &mut Runtime, id: i64, bit: u64) -> usize {
        let Some(entry) = self.running.get_mut(&id) else {
            return 0;
        };
        match bit {
            job::STDOUT => entry.stdout_done = true,
            job::STDERR => entry.stderr_done = true,
            _ => {}
        }
        let addr = rt.heap.get_root(entry.job);
        rt.heap.set_job_state(addr, rt.heap.job_state(addr) | bit);
        schedule_wjob(rt, addr);
        self.reap_if_complete(rt, id);
        1
    }

    fn finish_reality(&mut self, rt: &mut Runtime, id: i64, usage: Usage) {
        let Some((root, pathtime, predict_runtime)) = self
            .running
            .get(&id)
            .map(|e| (e.job, e.pathtime, e.predict.runtime))
        else {
            return;
        };
        self.usage_by_id.insert(id, usage);
        let addr = rt.heap.get_root(root);
        schedule_wjob(rt, addr);
        // Critical path bookkeeping.
        if pathtime == self.status.remain {
            let crit = self.crit_job(ALMOST_ONE * (pathtime - predict_runtime));
            self.status.retire(crit);
        }
    }

    fn reap_if_complete(&mut self, rt: &mut Runtime, id: i64) {
        let complete = self
            .running
            .get(&id)
            .is_some_and(|e| e.stdout_done && e.stderr_done && e.merged);
        if !complete {
            return;
        }
        let entry = self.running.remove(&id).expect("checked above");
        self.active -= entry.threads;
        self.phys_active -= entry.memory;
        info!(
            target: "jobs.reap",
            db_id = id,
            label = %entry.label,
            "job_complete"
        );
        rt.heap.release_root(entry.job);
    }

    // -----------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------

    /// Terminate every running child: SIGTERM with exponentially growing
    /// gaps, then SIGKILL the survivors.
    pub fn cancel_all(&mut self) {
        let mut gap = Duration::from_millis(TERM_BASE_GAP_MS);
        for attempt in 0..TERM_ATTEMPTS {
            if self.running.is_empty() {
                break;
            }
            for entry in self.running.values() {
                unsafe {
                    libc::kill(entry.pid, libc::SIGTERM);
                }
            }
            std::thread::sleep(gap);
            gap *= 2;
            self.drain_exits();
            if attempt + 1 == TERM_ATTEMPTS && !self.running.is_empty() {
                for entry in self.running.values() {
                    warn!(
                        target: "jobs.cancel",
                        pid = entry.pid,
                        attempts = TERM_ATTEMPTS,
                        "force_killing_after_sigterm"
                    );
                    unsafe {
                        libc::kill(entry.pid, libc::SIGKILL);
                    }
                }
                self.drain_exits();
            }
        }
    }

    fn drain_exits(&mut self) {
        while let Ok(ev) = self.rx.try_recv() {
            if let JobEvent::Exited(id, ..) = ev {
                if let Some(entry) = self.running.remove(&id) {
                    self.active -= entry.threads;
                    self.phys_active -= entry.memory;
                }
            }
        }
    }
}

impl EvalServices for JobServices {
    /// A `Job` wake-up: deliver whatever stages have completed to the wait
    /// chains parked on the job value.
    fn execute_external(
        &mut self,
        rt: &mut Runtime,
        kind: u8,
        item: Addr,
    ) -> Result<(), GcNeeded> {
        assert_eq!(kind, WORK_EXTERNAL, "unknown work kind {kind}");
        let addr = rt.heap.work_payload(item, 0) as Addr;
        let state = rt.heap.job_state(addr);
        let id = rt.heap.job_db_id(addr);

        if state & job::STDOUT != 0 && rt.heap.job_ptr(addr, job::Q_STDOUT) != NIL {
            let text = self
                .table
                .streams(id)
                .map(|s| String::from_utf8_lossy(&s.stdout).into_owned())
                .unwrap_or_default();
            rt.heap.reserve(Heap::reserve_string(&text))?;
            let value = rt.heap.claim_string(&text);
            let chain = rt.heap.take_job_chain(addr, job::Q_STDOUT);
            wake(rt, chain, value);
        }
        if state & job::STDERR != 0 && rt.heap.job_ptr(addr, job::Q_STDERR) != NIL {
            let text = self
                .table
                .streams(id)
                .map(|s| String::from_utf8_lossy(&s.stderr).into_owned())
                .unwrap_or_default();
            rt.heap.reserve(Heap::reserve_string(&text))?;
            let value = rt.heap.claim_string(&text);
            let chain = rt.heap.take_job_chain(addr, job::Q_STDERR);
            wake(rt, chain, value);
        }
        if state & job::MERGED != 0 && rt.heap.job_ptr(addr, job::Q_REALITY) != NIL {
            let usage = self.table.usage_by_id.get(&id).copied().unwrap_or_default();
            let value = claim_usage_record_on(&mut rt.heap, &usage)?;
            let chain = rt.heap.take_job_chain(addr, job::Q_REALITY);
            wake(rt, chain, value);
        }
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// Build the usage record delivered to `job_reality` waiters:
/// `(status, runtime, cputime, mem, ibytes, obytes)`.
pub fn claim_usage_record_on(heap: &mut Heap, usage: &Usage) -> Result<Addr, GcNeeded> {
    let status = BigInt::from(usage.status);
    let mem = BigInt::from(usage.membytes);
    let ibytes = BigInt::from(usage.ibytes);
    let obytes = BigInt::from(usage.obytes);
    heap.reserve(
        Heap::reserve_record(6)
            + Heap::reserve_integer(&status)
            + Heap::reserve_double() * 2
            + Heap::reserve_integer(&mem)
            + Heap::reserve_integer(&ibytes)
            + Heap::reserve_integer(&obytes),
    )?;
    let status = heap.claim_integer(&status);
    let runtime = heap.claim_double(usage.runtime);
    let cputime = heap.claim_double(usage.cputime);
    let mem = heap.claim_integer(&mem);
    let ib = heap.claim_integer(&ibytes);
    let ob = heap.claim_integer(&obytes);
    let rec = heap.claim_record(CTOR_USAGE, 6);
    for (i, v) in [status, runtime, cputime, mem, ib, ob].into_iter().enumerate() {
        let slot = heap.record_slot(i);
        heap.instant_fulfill(rec, slot, v);
    }
    Ok(rec)
}

fn wake(rt: &mut Runtime, chain: Addr, value: Addr) {
    if chain == NIL {
        return;
    }
    // Splice through the runtime's stack root.
    rt.wake_chain(chain, value);
}

/// Claim and schedule a `Job` wake-up work item, collecting if needed.
/// Only callable from scheduler context (no unrooted addresses live).
fn schedule_wjob(rt: &mut Runtime, addr: Addr) {
    loop {
        match rt.heap.reserve(Heap::reserve_work()) {
            Ok(()) => break,
            Err(GcNeeded(n)) => rt.heap.gc(n),
        }
    }
    let item = rt
        .heap
        .claim_work(WORK_EXTERNAL, 0b0001, [addr as u64, 0, 0, 0]);
    rt.schedule(item);
}

// ---------------------------------------------------------------------
// Collector threads
// ---------------------------------------------------------------------

fn spawn_reader(
    tx: Sender<JobEvent>,
    id: i64,
    mut pipe: impl Read + Send + 'static,
    is_stdout: bool,
) {
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let chunk = buf[..n].to_vec();
                    let ev = if is_stdout {
                        JobEvent::Stdout(id, chunk)
                    } else {
                        JobEvent::Stderr(id, chunk)
                    };
                    if tx.send(ev).is_err() {
                        return;
                    }
                }
            }
        }
        let _ = tx.send(if is_stdout {
            JobEvent::StdoutEof(id)
        } else {
            JobEvent::StderrEof(id)
        });
    });
}

fn spawn_reaper(tx: Sender<JobEvent>, id: i64, pid: i32) {
    std::thread::spawn(move || {
        let mut status: libc::c_int = 0;
        let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::wait4(pid, &mut status, 0, &mut ru) };
        let code = if ret < 0 {
            -1
        } else if libc::WIFEXITED(status) {
            libc::WEXITSTATUS(status)
        } else if libc::WIFSIGNALED(status) {
            -libc::WTERMSIG(status)
        } else {
            -1
        };
        let usage = Usage {
            found: true,
            status: code,
            runtime: 0.0, // filled from wall clock by the table
            cputime: ru.ru_utime.tv_sec as f64
                + ru.ru_utime.tv_usec as f64 / 1e6
                + ru.ru_stime.tv_sec as f64
                + ru.ru_stime.tv_usec as f64 / 1e6,
            membytes: (ru.ru_maxrss as u64) * 1024,
            ibytes: (ru.ru_inblock as u64) * 512,
            obytes: (ru.ru_oublock as u64) * 512,
        };
        let _ = tx.send(JobEvent::Exited(id, code, usage));
    });
}

// ---------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------

fn rlimit(resource: u32) -> u64 {
    let mut lim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(resource, &mut lim) } == 0 {
        lim.rlim_cur
    } else {
        u64::MAX
    }
}

/// Hard cap on concurrent children: generous per CPU, but bounded by the
/// descriptor budget (two pipes each, minus our own reserved pool) and
/// half the process limit.
fn child_cap(cpus: f64, reserved_fds: u64) -> usize {
    let mut cap = (cpus * 100.0) as u64;
    let nofile = rlimit(libc::RLIMIT_NOFILE);
    if nofile != u64::MAX {
        cap = cap.min(nofile.saturating_sub(reserved_fds) / 2);
    }
    let nproc = rlimit(libc::RLIMIT_NPROC);
    if nproc != u64::MAX {
        cap = cap.min(nproc / 2);
    }
    cap.max(1) as usize
}

fn split_nul(s: &str) -> Vec<String> {
    s.split('\0')
        .filter(|p| !p.is_empty())
        .map(|p| p.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_cap_has_a_floor() {
        assert!(child_cap(0.0, 24) >= 1);
        assert!(child_cap(8.0, 24) >= 1);
    }

    #[test]
    fn split_nul_handles_argv() {
        assert_eq!(split_nul("ls\0-l\0"), vec!["ls", "-l"]);
        assert_eq!(split_nul(""), Vec::<String>::new());
    }
}
