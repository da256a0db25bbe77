//! Job-facing primitives: launching external processes and observing
//! their stages, plus the cache read/add pair enabled when a job cache is
//! attached.

use core_eval::{
    expect_args, expect_double, expect_job, expect_string, PrimError, PrimIo, PrimOutcome,
    PrimRegistry,
};
use core_heap::{job, Heap};
use core_ssa::PrimFlags;
use num_bigint::BigInt;

use crate::table::{JobServices, Task};
use crate::usage::Usage;

/// Register the job primitives. `job_cache_read` / `job_cache_add` fail at
/// run time unless the services carry a cache, so callers without a cache
/// root simply never see a hit.
pub fn register_job_prims(r: &mut PrimRegistry) {
    let effect = PrimFlags::EFFECT | PrimFlags::ORDERED;
    let pure = PrimFlags::empty();
    r.register("job_launch", effect, prim_job_launch);
    r.register("job_stdout", pure, prim_job_stdout);
    r.register("job_stderr", pure, prim_job_stderr);
    r.register("job_reality", pure, prim_job_reality);
    r.register("job_id", pure, prim_job_id);
    r.register("job_cache_read", effect, prim_job_cache_read);
    r.register("job_cache_add", effect, prim_job_cache_add);
}

fn services<'a>(io: &'a mut PrimIo<'_>) -> Result<&'a mut JobServices, PrimError> {
    io.ctx
        .downcast_mut::<JobServices>()
        .ok_or_else(|| PrimError::Fail("job services unavailable".into()))
}

/// `job_launch label dir stdin_file environ cmdline pathtime` — request a
/// launch; returns the Job value immediately, stages resolve as the
/// process advances.
fn prim_job_launch(io: &mut PrimIo<'_>, args: &[usize]) -> Result<PrimOutcome, PrimError> {
    expect_args(args, 6)?;
    let label = expect_string(io.heap, args[0])?;
    let dir = expect_string(io.heap, args[1])?;
    let stdin_file = expect_string(io.heap, args[2])?;
    let environ = expect_string(io.heap, args[3])?;
    let cmdline = expect_string(io.heap, args[4])?;
    let pathtime = expect_double(io.heap, args[5])?;

    io.heap.reserve(Heap::reserve_job())?;
    let svc = services(io)?;
    let db_id = svc.table.next_db_id();

    let addr = io
        .heap
        .claim_job(db_id, args[0], args[4], args[2], args[1]);
    io.heap.set_job_pathtime(addr, pathtime);
    let root = io.heap.root(addr);

    let svc = services(io)?;
    svc.table.enqueue(Task {
        job: root,
        db_id,
        dir,
        stdin_file,
        environ,
        cmdline,
        label,
        pathtime,
        predict: Usage::default(),
    });
    Ok(PrimOutcome::Value(addr))
}

fn prim_job_stdout(io: &mut PrimIo<'_>, args: &[usize]) -> Result<PrimOutcome, PrimError> {
    expect_args(args, 1)?;
    let j = expect_job(io.heap, args[0])?;
    if io.heap.job_state(j) & job::STDOUT == 0 {
        return Ok(PrimOutcome::Park {
            job: j,
            chain: job::Q_STDOUT,
        });
    }
    let id = io.heap.job_db_id(j);
    let svc = services(io)?;
    let text = svc
        .table
        .streams(id)
        .map(|s| String::from_utf8_lossy(&s.stdout).into_owned())
        .unwrap_or_default();
    Ok(PrimOutcome::Value(io.heap.alloc_string(&text)?))
}

fn prim_job_stderr(io: &mut PrimIo<'_>, args: &[usize]) -> Result<PrimOutcome, PrimError> {
    expect_args(args, 1)?;
    let j = expect_job(io.heap, args[0])?;
    if io.heap.job_state(j) & job::STDERR == 0 {
        return Ok(PrimOutcome::Park {
            job: j,
            chain: job::Q_STDERR,
        });
    }
    let id = io.heap.job_db_id(j);
    let svc = services(io)?;
    let text = svc
        .table
        .streams(id)
        .map(|s| String::from_utf8_lossy(&s.stderr).into_owned())
        .unwrap_or_default();
    Ok(PrimOutcome::Value(io.heap.alloc_string(&text)?))
}

/// Measured usage once the child has been reaped.
fn prim_job_reality(io: &mut PrimIo<'_>, args: &[usize]) -> Result<PrimOutcome, PrimError> {
    expect_args(args, 1)?;
    let j = expect_job(io.heap, args[0])?;
    if io.heap.job_state(j) & job::MERGED == 0 {
        return Ok(PrimOutcome::Park {
            job: j,
            chain: job::Q_REALITY,
        });
    }
    let id = io.heap.job_db_id(j);
    let svc = services(io)?;
    let usage = svc.table.usage(id).unwrap_or_default();
    let rec = crate::table::claim_usage_record_on(io.heap, &usage)?;
    Ok(PrimOutcome::Value(rec))
}

fn prim_job_id(io: &mut PrimIo<'_>, args: &[usize]) -> Result<PrimOutcome, PrimError> {
    expect_args(args, 1)?;
    let j = expect_job(io.heap, args[0])?;
    let id = io.heap.job_db_id(j);
    Ok(PrimOutcome::Value(
        io.heap.alloc_integer(&BigInt::from(id))?,
    ))
}

/// `job_cache_read request_json` — returns the FindJobResponse JSON. An
/// unreachable daemon is a miss, not an error.
fn prim_job_cache_read(io: &mut PrimIo<'_>, args: &[usize]) -> Result<PrimOutcome, PrimError> {
    expect_args(args, 1)?;
    let request = expect_string(io.heap, args[0])?;
    let svc = services(io)?;
    let Some(cache) = svc.cache.as_mut() else {
        return Err(PrimError::Fail("job cache not configured".into()));
    };
    let response = cache
        .read(&request)
        .unwrap_or_else(|| "{\"found\":false}".to_string());
    Ok(PrimOutcome::Value(io.heap.alloc_string(&response)?))
}

fn prim_job_cache_add(io: &mut PrimIo<'_>, args: &[usize]) -> Result<PrimOutcome, PrimError> {
    expect_args(args, 1)?;
    let request = expect_string(io.heap, args[0])?;
    let svc = services(io)?;
    let Some(cache) = svc.cache.as_mut() else {
        return Err(PrimError::Fail("job cache not configured".into()));
    };
    cache.add(&request);
    Ok(PrimOutcome::Value(core_eval::alloc_bool(io.heap, true)?))
}
