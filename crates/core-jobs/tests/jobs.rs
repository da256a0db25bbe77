//! Launch real processes through the whole pipeline: program → scheduler →
//! collector threads → wake-ups → promise fulfillment.

use core_eval::{PrimRegistry, Program, Runtime};
use core_heap::{GcNeeded, PromiseState, Tag};
use core_jobs::{register_job_prims, JobServices, JobTable};
use core_ssa::{LitId, LiteralPool, PrimFlags, Term, TermBuilder};
use num_bigint::BigInt;

fn str_lit(rt: &mut Runtime, pool: &mut LiteralPool, s: &str) -> LitId {
    loop {
        match rt.heap.alloc_string(s) {
            Ok(addr) => return pool.intern(&mut rt.heap, addr),
            Err(GcNeeded(n)) => rt.heap.gc(n),
        }
    }
}

fn dbl_lit(rt: &mut Runtime, pool: &mut LiteralPool, v: f64) -> LitId {
    loop {
        match rt.heap.alloc_double(v) {
            Ok(addr) => return pool.intern(&mut rt.heap, addr),
            Err(GcNeeded(n)) => rt.heap.gc(n),
        }
    }
}

/// Drive evaluator and scheduler alternately until the program settles
/// and every job has fully resolved.
fn drive(rt: &mut Runtime, program: &Program, pool: &LiteralPool, services: &mut JobServices) {
    rt.init(program, pool);
    loop {
        rt.run(program, pool, services);
        if services.table.pending_count() == 0 && rt.output_value().is_some() {
            break;
        }
        if !services.table.wait(rt) && services.table.pending_count() == 0 {
            rt.run(program, pool, services);
            if rt.output_value().is_some() {
                break;
            }
            panic!("evaluation stuck with no jobs in flight");
        }
    }
}

fn registry() -> PrimRegistry {
    let mut r = PrimRegistry::with_builtins();
    register_job_prims(&mut r);
    r
}

struct JobProgram {
    rt: Runtime,
    pool: LiteralPool,
    root: Term,
}

/// `job_stdout (job_launch label dir "" env cmdline 1.0)`
fn stdout_program(cmdline: &str) -> JobProgram {
    let mut rt = Runtime::new(2.0, 0);
    let mut pool = LiteralPool::new();
    let label = str_lit(&mut rt, &mut pool, "test job");
    let dir = str_lit(&mut rt, &mut pool, ".");
    let empty = str_lit(&mut rt, &mut pool, "");
    let env = str_lit(&mut rt, &mut pool, "PATH=/usr/bin:/bin\0");
    let cmd = str_lit(&mut rt, &mut pool, cmdline);
    let pt = dbl_lit(&mut rt, &mut pool, 1.0);

    let mut b = TermBuilder::new();
    b.begin_fun("main"); // 0
    let l_label = b.lit("", label); // 1
    let l_dir = b.lit("", dir); // 2
    let l_empty = b.lit("", empty); // 3
    let l_env = b.lit("", env); // 4
    let l_cmd = b.lit("", cmd); // 5
    let l_pt = b.lit("", pt); // 6
    let launch = b.prim(
        "job",
        "job_launch",
        PrimFlags::EFFECT | PrimFlags::ORDERED,
        vec![l_label, l_dir, l_empty, l_env, l_cmd, l_pt],
    ); // 7
    let out = b.prim("", "job_stdout", PrimFlags::empty(), vec![launch]); // 8
    let root = b.finish(out);
    JobProgram { rt, pool, root }
}

#[test]
fn echo_job_delivers_stdout() {
    let JobProgram {
        mut rt,
        pool,
        mut root,
    } = stdout_program("/bin/echo\0hello\0world");
    core_ssa::scope(&mut root, &pool);
    let program = Program::link(&root, &registry()).expect("link");
    let mut services = JobServices::new(JobTable::new(2.0, 1 << 30, 24));

    drive(&mut rt, &program, &pool, &mut services);
    let v = rt.output_value().expect("settled");
    assert_eq!(rt.heap.tag(v), Tag::String);
    assert_eq!(rt.heap.string_value(v), "hello world\n");
}

#[test]
fn failing_command_resolves_with_negative_status() {
    // A command that cannot even spawn still completes all stages.
    let JobProgram {
        mut rt,
        pool,
        mut root,
    } = stdout_program("/definitely/not/a/binary");
    core_ssa::scope(&mut root, &pool);
    let program = Program::link(&root, &registry()).expect("link");
    let mut services = JobServices::new(JobTable::new(2.0, 1 << 30, 24));

    drive(&mut rt, &program, &pool, &mut services);
    let v = rt.output_value().expect("settled");
    // stdout is empty; the job failed before producing any.
    assert_eq!(rt.heap.string_value(v), "");
}

#[test]
fn exit_status_reaches_reality_waiters() {
    let mut rt = Runtime::new(2.0, 0);
    let mut pool = LiteralPool::new();
    let label = str_lit(&mut rt, &mut pool, "status job");
    let dir = str_lit(&mut rt, &mut pool, ".");
    let empty = str_lit(&mut rt, &mut pool, "");
    let env = str_lit(&mut rt, &mut pool, "PATH=/usr/bin:/bin\0");
    let cmd = str_lit(&mut rt, &mut pool, "/bin/sh\0-c\0exit 3");
    let pt = dbl_lit(&mut rt, &mut pool, 1.0);

    let mut b = TermBuilder::new();
    b.begin_fun("main"); // 0
    let l_label = b.lit("", label); // 1
    let l_dir = b.lit("", dir); // 2
    let l_empty = b.lit("", empty); // 3
    let l_env = b.lit("", env); // 4
    let l_cmd = b.lit("", cmd); // 5
    let l_pt = b.lit("", pt); // 6
    let launch = b.prim(
        "job",
        "job_launch",
        PrimFlags::EFFECT | PrimFlags::ORDERED,
        vec![l_label, l_dir, l_empty, l_env, l_cmd, l_pt],
    ); // 7
    let reality = b.prim("", "job_reality", PrimFlags::empty(), vec![launch]); // 8
    let mut root = b.finish(reality);

    core_ssa::scope(&mut root, &pool);
    let program = Program::link(&root, &registry()).expect("link");
    let mut services = JobServices::new(JobTable::new(2.0, 1 << 30, 24));

    drive(&mut rt, &program, &pool, &mut services);
    let v = rt.output_value().expect("settled");
    assert_eq!(rt.heap.tag(v), Tag::Record);
    let status = match rt.heap.promise_state(v, rt.heap.record_slot(0)) {
        PromiseState::Fulfilled(s) => s,
        PromiseState::Waiting(_) => panic!("status slot unfulfilled"),
    };
    assert_eq!(rt.heap.integer_value(status), BigInt::from(3));
}

#[test]
fn two_jobs_run_and_both_resolve() {
    let mut rt = Runtime::new(2.0, 0);
    let mut pool = LiteralPool::new();
    let label = str_lit(&mut rt, &mut pool, "pair");
    let dir = str_lit(&mut rt, &mut pool, ".");
    let empty = str_lit(&mut rt, &mut pool, "");
    let env = str_lit(&mut rt, &mut pool, "PATH=/usr/bin:/bin\0");
    let cmd_a = str_lit(&mut rt, &mut pool, "/bin/echo\0alpha");
    let cmd_b = str_lit(&mut rt, &mut pool, "/bin/echo\0beta");
    let pt = dbl_lit(&mut rt, &mut pool, 1.0);

    let mut b = TermBuilder::new();
    b.begin_fun("main"); // 0
    let l_label = b.lit("", label); // 1
    let l_dir = b.lit("", dir); // 2
    let l_empty = b.lit("", empty); // 3
    let l_env = b.lit("", env); // 4
    let l_cmd_a = b.lit("", cmd_a); // 5
    let l_cmd_b = b.lit("", cmd_b); // 6
    let l_pt = b.lit("", pt); // 7
    let eff = PrimFlags::EFFECT | PrimFlags::ORDERED;
    let ja = b.prim(
        "a",
        "job_launch",
        eff,
        vec![l_label, l_dir, l_empty, l_env, l_cmd_a, l_pt],
    ); // 8
    let jb = b.prim(
        "b",
        "job_launch",
        eff,
        vec![l_label, l_dir, l_empty, l_env, l_cmd_b, l_pt],
    ); // 9
    let oa = b.prim("", "job_stdout", PrimFlags::empty(), vec![ja]); // 10
    let ob = b.prim("", "job_stdout", PrimFlags::empty(), vec![jb]); // 11
    let pair = b.con("pair", 0, vec![oa, ob]); // 12
    let mut root = b.finish(pair);

    core_ssa::scope(&mut root, &pool);
    let program = Program::link(&root, &registry()).expect("link");
    let mut services = JobServices::new(JobTable::new(2.0, 1 << 30, 24));

    drive(&mut rt, &program, &pool, &mut services);
    let v = rt.output_value().expect("settled");
    let get = |i: usize| match rt.heap.promise_state(v, rt.heap.record_slot(i)) {
        PromiseState::Fulfilled(s) => rt.heap.string_value(s),
        PromiseState::Waiting(_) => panic!("field unfulfilled"),
    };
    assert_eq!(get(0), "alpha\n");
    assert_eq!(get(1), "beta\n");
}
