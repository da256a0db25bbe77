//! The evaluator: a single-threaded, cooperative work loop over scoped SSA.
//!
//! Nothing here recurses into evaluation: every step either finishes a
//! value into a promise or parks a continuation on one. Function
//! application materializes a scope, binds argument promises, and walks the
//! body once, scheduling work for anything that must wait. All heap demand
//! of one step is reserved up front; a step interrupted by [`GcNeeded`] is
//! rescheduled untouched, the collector runs, and the step re-executes.

use std::any::Any;

use core_heap::{Addr, GcNeeded, Heap, PromiseState, RootId, Tag, NIL, WORK_FULFILL};
use core_ssa::{arg_depth, arg_offset, LiteralPool};
use tracing::{trace, warn};

use crate::prim::{PrimError, PrimIo, PrimOutcome, CTOR_ERROR};
use crate::program::{FunId, Op, Program};

// Work kinds owned by the evaluator (kind 0 is the heap's fulfiller).
pub const WORK_APP: u8 = 1;
pub const WORK_DES: u8 = 2;
pub const WORK_DES_APPLY: u8 = 3;
pub const WORK_PRIM: u8 = 4;
pub const WORK_GET: u8 = 5;
/// First kind available to external subsystems (the job scheduler).
pub const WORK_EXTERNAL: u8 = 6;

// Payload pointer masks per kind (bit i marks payload pad i as a pointer).
const MASK_SITE_TARGET: u8 = 0b0101; // [scope, site, holder, slot]
const MASK_SCOPE_ONLY: u8 = 0b0001; // [scope, site, next, -]
const MASK_TARGET_ONLY: u8 = 0b0010; // [index, holder, slot, -]

fn pack_site(fun: FunId, term: usize) -> u64 {
    ((fun as u64) << 32) | term as u64
}

fn site_fun(v: u64) -> FunId {
    (v >> 32) as usize
}

fn site_term(v: u64) -> usize {
    (v & 0xFFFF_FFFF) as usize
}

/// Process-wide services the evaluator threads through to primitives (via
/// `Any` downcast) and to which it hands work items of kinds it does not
/// own (the job scheduler's wake-ups, in practice).
pub trait EvalServices: Any {
    fn execute_external(&mut self, rt: &mut Runtime, kind: u8, item: Addr)
        -> Result<(), GcNeeded>;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// No services: for pure programs and tests.
pub struct NoServices;

impl EvalServices for NoServices {
    fn execute_external(
        &mut self,
        _rt: &mut Runtime,
        kind: u8,
        _item: Addr,
    ) -> Result<(), GcNeeded> {
        panic!("unexpected external work kind {kind}");
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct Runtime {
    pub heap: Heap,
    stack: RootId,
    output: RootId,
    steps: u64,
}

impl Runtime {
    pub fn new(heap_factor: f64, profile_level: u8) -> Self {
        let mut heap = Heap::new(heap_factor, profile_level);
        let stack = heap.root(NIL);
        heap.reserve(Heap::reserve_record(1))
            .expect("fresh heap cannot be exhausted");
        let out_rec = heap.claim_record(0, 1);
        let output = heap.root(out_rec);
        Self {
            heap,
            stack,
            output,
            steps: 0,
        }
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    // -----------------------------------------------------------------
    // Stack plumbing
    // -----------------------------------------------------------------

    fn with_stack<R>(&mut self, f: impl FnOnce(&mut Heap, &mut Addr) -> R) -> R {
        let mut head = self.heap.get_root(self.stack);
        let r = f(&mut self.heap, &mut head);
        self.heap.set_root(self.stack, head);
        r
    }

    pub fn schedule(&mut self, item: Addr) {
        self.with_stack(|h, s| h.schedule(s, item));
    }

    pub fn fulfill(&mut self, holder: Addr, slot: usize, value: Addr) {
        self.with_stack(|h, s| h.fulfill(holder, slot, value, s));
    }

    pub fn await_slot(&mut self, holder: Addr, slot: usize, cont: Addr) {
        self.with_stack(|h, s| h.await_slot(holder, slot, cont, s));
    }

    /// Wake a detached continuation chain (job wait queues) with `value`.
    pub fn wake_chain(&mut self, chain: Addr, value: Addr) {
        self.with_stack(|h, s| h.wake_chain(chain, value, s));
    }

    fn pop(&mut self) -> Option<Addr> {
        self.with_stack(|h, s| h.pop_work(s))
    }

    /// Resolve a packed `(depth, offset)` reference to a promise location.
    fn resolve(&self, scope: Addr, packed: usize) -> (Addr, usize) {
        let mut s = scope;
        for _ in 0..arg_depth(packed) {
            s = self.heap.scope_parent(s);
        }
        (s, self.heap.scope_slot(arg_offset(packed)))
    }

    // -----------------------------------------------------------------
    // Entry and the outer loop
    // -----------------------------------------------------------------

    /// Kick off evaluation of the program's root function (which must take
    /// no arguments); its result fulfills the runtime's output promise.
    pub fn init(&mut self, program: &Program, pool: &LiteralPool) {
        assert_eq!(program.fun(program.root).args, 0, "root takes arguments");
        loop {
            match self.start(program, pool) {
                Ok(()) => break,
                Err(GcNeeded(n)) => self.heap.gc(n),
            }
        }
    }

    fn start(&mut self, program: &Program, pool: &LiteralPool) -> Result<(), GcNeeded> {
        let def = program.fun(program.root);
        self.heap.reserve(def.apply_reserve)?;
        let scope = self.heap.claim_scope(program.root, def.ops.len(), NIL);
        let out = self.heap.get_root(self.output);
        let slot = self.heap.record_slot(0);
        self.interpret_body(program, pool, program.root, scope, (out, slot));
        Ok(())
    }

    /// The program's result, once evaluation has settled.
    pub fn output_value(&self) -> Option<Addr> {
        let out = self.heap.get_root(self.output);
        match self.heap.promise_state(out, self.heap.record_slot(0)) {
            PromiseState::Fulfilled(v) => Some(v),
            PromiseState::Waiting(_) => None,
        }
    }

    /// Drain the work stack. Returns when no work remains; external
    /// subsystems may then add more (job completions) and call again.
    pub fn run(
        &mut self,
        program: &Program,
        pool: &LiteralPool,
        services: &mut dyn EvalServices,
    ) {
        while let Some(item) = self.pop() {
            self.steps += 1;
            match self.execute(program, pool, services, item) {
                Ok(()) => {}
                Err(GcNeeded(n)) => {
                    // The step made no observable progress; retry after
                    // collecting (the stack root keeps the item alive).
                    self.schedule(item);
                    self.heap.gc(n);
                }
            }
        }
    }

    /// Convenience for tests and batch evaluation: init, drain, return the
    /// output value.
    pub fn eval(&mut self, program: &Program, pool: &LiteralPool) -> Option<Addr> {
        self.init(program, pool);
        self.run(program, pool, &mut NoServices);
        self.output_value()
    }

    fn execute(
        &mut self,
        program: &Program,
        pool: &LiteralPool,
        services: &mut dyn EvalServices,
        item: Addr,
    ) -> Result<(), GcNeeded> {
        let kind = self.heap.work_kind(item);
        trace!(target: "eval.step", kind, step = self.steps, "execute");
        match kind {
            WORK_FULFILL => {
                self.with_stack(|h, s| h.execute_fulfiller(item, s));
                Ok(())
            }
            WORK_APP => self.exec_app(program, pool, item),
            WORK_DES => self.exec_des(program, item),
            WORK_DES_APPLY => self.exec_des_apply(program, pool, item),
            WORK_PRIM => self.exec_prim(program, services, item),
            WORK_GET => self.exec_get(item),
            other => services.execute_external(self, other, item),
        }
    }

    // -----------------------------------------------------------------
    // Body interpretation
    // -----------------------------------------------------------------

    /// Walk one function body in order. Heap demand must already be
    /// reserved (`FunDef::apply_reserve` covers it), so nothing here can
    /// fail.
    fn interpret_body(
        &mut self,
        program: &Program,
        pool: &LiteralPool,
        fun: FunId,
        scope: Addr,
        target: (Addr, usize),
    ) {
        let def = program.fun(fun);
        let tail = def.tail_output;
        let out_off = arg_offset(def.output);

        for (i, op) in def.ops.iter().enumerate() {
            let slot = self.heap.scope_slot(i);
            let t = if tail && i == out_off {
                target
            } else {
                (scope, slot)
            };
            match op {
                Op::Arg => {}
                Op::Lit { value } => {
                    let v = pool.addr(&self.heap, *value);
                    self.fulfill(scope, slot, v);
                }
                Op::Fun { fun: nested } => {
                    let c = self.heap.claim_closure(*nested, 0, scope);
                    self.fulfill(scope, slot, c);
                }
                Op::Con { ctor, args } => {
                    let r = self.heap.claim_record(*ctor, args.len());
                    for (j, &aref) in args.iter().enumerate() {
                        let (sh, ss) = self.resolve(scope, aref);
                        let dst = self.heap.record_slot(j);
                        self.with_stack(|h, s| {
                            h.claim_instant_fulfiller(r, dst, sh, ss, s)
                        });
                    }
                    self.fulfill(scope, slot, r);
                }
                Op::App { args } => {
                    let w = self.heap.claim_work(
                        WORK_APP,
                        MASK_SITE_TARGET,
                        [scope as u64, pack_site(fun, i), t.0 as u64, t.1 as u64],
                    );
                    let (fh, fs) = self.resolve(scope, args[0]);
                    self.await_slot(fh, fs, w);
                }
                Op::Des { args } => {
                    let w = self.heap.claim_work(
                        WORK_DES,
                        MASK_SITE_TARGET,
                        [scope as u64, pack_site(fun, i), t.0 as u64, t.1 as u64],
                    );
                    let (sh, ss) = self.resolve(scope, *args.last().expect("empty Des"));
                    self.await_slot(sh, ss, w);
                }
                Op::Get { index, obj } => {
                    let w = self.heap.claim_work(
                        WORK_GET,
                        MASK_TARGET_ONLY,
                        [*index as u64, t.0 as u64, t.1 as u64, 0],
                    );
                    let (oh, os) = self.resolve(scope, *obj);
                    self.await_slot(oh, os, w);
                }
                Op::Prim { .. } => {
                    let w = self.heap.claim_work(
                        WORK_PRIM,
                        MASK_SCOPE_ONLY,
                        [scope as u64, pack_site(fun, i), 0, 0],
                    );
                    self.schedule(w);
                }
            }
        }

        if !tail {
            let (oh, os) = self.resolve(scope, def.output);
            let w = self.heap.claim_fulfiller(target.0, target.1);
            self.await_slot(oh, os, w);
        }
    }

    // -----------------------------------------------------------------
    // Application
    // -----------------------------------------------------------------

    fn exec_app(
        &mut self,
        program: &Program,
        pool: &LiteralPool,
        item: Addr,
    ) -> Result<(), GcNeeded> {
        let closure = self.heap.work_value(item);
        let scope = self.heap.work_payload(item, 0) as Addr;
        let site = self.heap.work_payload(item, 1);
        let target = (
            self.heap.work_payload(item, 2) as Addr,
            self.heap.work_payload(item, 3) as usize,
        );
        let Op::App { args } = &program.fun(site_fun(site)).ops[site_term(site)] else {
            panic!("app work at non-App site");
        };
        let sources: Vec<(Addr, usize)> =
            args[1..].iter().map(|&r| self.resolve(scope, r)).collect();
        self.apply_closure(program, pool, closure, &sources, target)
    }

    fn exec_des(&mut self, program: &Program, item: Addr) -> Result<(), GcNeeded> {
        let scrutinee = self.heap.work_value(item);
        let scope = self.heap.work_payload(item, 0) as Addr;
        let site = self.heap.work_payload(item, 1);
        let target = (
            self.heap.work_payload(item, 2) as Addr,
            self.heap.work_payload(item, 3) as usize,
        );
        assert_eq!(self.heap.tag(scrutinee), Tag::Record, "destructured non-record");
        let Op::Des { args } = &program.fun(site_fun(site)).ops[site_term(site)] else {
            panic!("des work at non-Des site");
        };
        let ctor = self.heap.record_ctor(scrutinee);
        assert!(ctor < args.len() - 1, "constructor {ctor} has no handler");
        let handler_ref = args[ctor];

        self.heap.reserve(Heap::reserve_work())?;
        let w = self.heap.claim_work(
            WORK_DES_APPLY,
            MASK_SITE_TARGET,
            [scope as u64, site, target.0 as u64, target.1 as u64],
        );
        let (hh, hs) = self.resolve(scope, handler_ref);
        self.await_slot(hh, hs, w);
        Ok(())
    }

    fn exec_des_apply(
        &mut self,
        program: &Program,
        pool: &LiteralPool,
        item: Addr,
    ) -> Result<(), GcNeeded> {
        let handler = self.heap.work_value(item);
        let scope = self.heap.work_payload(item, 0) as Addr;
        let site = self.heap.work_payload(item, 1);
        let target = (
            self.heap.work_payload(item, 2) as Addr,
            self.heap.work_payload(item, 3) as usize,
        );
        let Op::Des { args } = &program.fun(site_fun(site)).ops[site_term(site)] else {
            panic!("des-apply work at non-Des site");
        };
        let scrut_src = self.resolve(scope, *args.last().expect("empty Des"));
        self.apply_closure(program, pool, handler, &[scrut_src], target)
    }

    fn exec_get(&mut self, item: Addr) -> Result<(), GcNeeded> {
        let record = self.heap.work_value(item);
        let index = self.heap.work_payload(item, 0) as usize;
        let target = (
            self.heap.work_payload(item, 1) as Addr,
            self.heap.work_payload(item, 2) as usize,
        );
        assert_eq!(self.heap.tag(record), Tag::Record, "projection from non-record");
        assert!(index < self.heap.record_arity(record), "field index out of range");
        self.heap.reserve(Heap::reserve_work())?;
        let w = self.heap.claim_fulfiller(target.0, target.1);
        let slot = self.heap.record_slot(index);
        self.await_slot(record, slot, w);
        Ok(())
    }

    fn exec_prim(
        &mut self,
        program: &Program,
        services: &mut dyn EvalServices,
        item: Addr,
    ) -> Result<(), GcNeeded> {
        let scope = self.heap.work_payload(item, 0) as Addr;
        let site = self.heap.work_payload(item, 1);
        let next = self.heap.work_payload(item, 2) as usize;
        let Op::Prim { prim, args } = &program.fun(site_fun(site)).ops[site_term(site)] else {
            panic!("prim work at non-Prim site");
        };

        // Gather: wait on each operand in turn; once all are fulfilled the
        // values can simply be re-read.
        for i in next..args.len() {
            let (sh, ss) = self.resolve(scope, args[i]);
            match self.heap.promise_state(sh, ss) {
                PromiseState::Fulfilled(_) => continue,
                PromiseState::Waiting(_) => {
                    self.heap.set_work_payload(item, 2, i as u64);
                    self.await_slot(sh, ss, item);
                    return Ok(());
                }
            }
        }
        let values: Vec<Addr> = args
            .iter()
            .map(|&r| {
                let (sh, ss) = self.resolve(scope, r);
                match self.heap.promise_state(sh, ss) {
                    PromiseState::Fulfilled(v) => v,
                    PromiseState::Waiting(_) => unreachable!("gathered operand unfulfilled"),
                }
            })
            .collect();

        let def = &program.prims[*prim];
        let slot = self.heap.scope_slot(site_term(site));
        let mut io = PrimIo {
            heap: &mut self.heap,
            ctx: services.as_any_mut(),
        };
        match (def.run)(&mut io, &values) {
            Ok(PrimOutcome::Value(v)) => {
                self.fulfill(scope, slot, v);
                Ok(())
            }
            Ok(PrimOutcome::Park { job, chain }) => {
                // Not ready: hang a fulfiller for our own slot on the job's
                // wait chain; the scheduler wakes it with the value.
                self.heap.reserve(Heap::reserve_work())?;
                let cont = self.heap.claim_fulfiller(scope, slot);
                let head = self.heap.job_ptr(job, chain);
                self.heap.set_work_next(cont, head);
                self.heap.set_job_ptr(job, chain, cont);
                Ok(())
            }
            Err(PrimError::Gc(g)) => Err(g),
            Err(PrimError::Fail(msg)) => {
                // A failed primitive becomes an error value in the program.
                self.heap
                    .reserve(Heap::reserve_string(&msg) + Heap::reserve_record(1))?;
                let s = self.heap.claim_string(&msg);
                let r = self.heap.claim_record(CTOR_ERROR, 1);
                let msg_slot = self.heap.record_slot(0);
                self.heap.instant_fulfill(r, msg_slot, s);
                warn!(target: "eval.prim", prim = def.name, error = %msg, "primitive_failed");
                self.fulfill(scope, slot, r);
                Ok(())
            }
        }
    }

    fn apply_closure(
        &mut self,
        program: &Program,
        pool: &LiteralPool,
        closure: Addr,
        sources: &[(Addr, usize)],
        target: (Addr, usize),
    ) -> Result<(), GcNeeded> {
        assert_eq!(self.heap.tag(closure), Tag::Closure, "applied non-function");
        let fun = self.heap.closure_fun(closure);
        let applied = self.heap.closure_applied(closure);
        let def = program.fun(fun);
        let k = sources.len();

        if applied + k < def.args {
            // Partial application: push one single-slot scope per argument
            // onto the captured chain and wrap a fatter closure around it.
            let need = k * (Heap::reserve_scope(1) + Heap::reserve_work())
                + Heap::reserve_closure();
            self.heap.reserve(need)?;
            let mut env = self.heap.closure_scope(closure);
            for &(sh, ss) in sources {
                let s = self.heap.claim_scope(fun, 1, env);
                let dst = self.heap.scope_slot(0);
                self.with_stack(|h, st| h.claim_instant_fulfiller(s, dst, sh, ss, st));
                env = s;
            }
            let out = self.heap.claim_closure(fun, applied + k, env);
            self.fulfill(target.0, target.1, out);
            return Ok(());
        }

        assert!(
            applied + k == def.args,
            "over-application: {} args onto {}/{}",
            k,
            applied,
            def.args
        );

        self.heap.reserve(def.apply_reserve)?;

        // Strip the partial-argument scopes off the chain to find the real
        // captured environment, remembering each argument's promise.
        let mut chain = Vec::with_capacity(applied);
        let mut env = self.heap.closure_scope(closure);
        for _ in 0..applied {
            chain.push(env);
            env = self.heap.scope_parent(env);
        }

        let scope = self.heap.claim_scope(fun, def.ops.len(), env);
        for j in 0..applied {
            // chain[0] holds the most recently applied argument.
            let src = chain[applied - 1 - j];
            let src_slot = self.heap.scope_slot(0);
            let dst = self.heap.scope_slot(j);
            self.with_stack(|h, st| h.claim_instant_fulfiller(scope, dst, src, src_slot, st));
        }
        for (j, &(sh, ss)) in sources.iter().enumerate() {
            let dst = self.heap.scope_slot(applied + j);
            self.with_stack(|h, st| h.claim_instant_fulfiller(scope, dst, sh, ss, st));
        }

        self.interpret_body(program, pool, fun, scope, target);
        Ok(())
    }
}
