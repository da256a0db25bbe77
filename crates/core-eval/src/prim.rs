//! The primitive registry and the built-in primitive set.
//!
//! A primitive observes only already-fulfilled argument values. It either
//! finishes with a value, parks the current computation on a job's wait
//! chain (the runtime installs the continuation), or fails — and a failure
//! surfaces as an error value in the program, not a crash of the runtime.
//! Heap space must be reserved before any external effect: a primitive
//! interrupted by `GcNeeded` is re-executed after the collection, so
//! everything before the first irreversible effect must be idempotent.

use std::any::Any;
use std::collections::HashMap;

use core_heap::{Addr, GcNeeded, Heap, Tag};
use core_ssa::PrimFlags;
use num_bigint::BigInt;
use num_traits::{Signed, Zero};

/// Constructor case indices the lowering and the primitives agree on.
pub const CTOR_FALSE: usize = 0;
pub const CTOR_TRUE: usize = 1;
/// Error record: one field holding the message string.
pub const CTOR_ERROR: usize = 2;

pub enum PrimError {
    /// Re-execute after a collection.
    Gc(GcNeeded),
    /// Becomes a user-visible error value.
    Fail(String),
}

impl From<GcNeeded> for PrimError {
    fn from(g: GcNeeded) -> Self {
        PrimError::Gc(g)
    }
}

/// What a primitive produced.
pub enum PrimOutcome {
    Value(Addr),
    /// Not ready: park the caller on `job`'s wait chain at field `chain`
    /// (one of the `core_heap::job::Q_*` offsets). The runtime re-delivers
    /// whatever value the chain is eventually woken with.
    Park { job: Addr, chain: usize },
}

/// Everything a primitive may touch. `ctx` carries process-wide services
/// (the job table, the cache client) for the primitives that need them.
pub struct PrimIo<'a> {
    pub heap: &'a mut Heap,
    pub ctx: &'a mut dyn Any,
}

pub type PrimFn = fn(&mut PrimIo<'_>, &[Addr]) -> Result<PrimOutcome, PrimError>;

#[derive(Clone)]
pub struct PrimDef {
    pub name: &'static str,
    pub flags: PrimFlags,
    pub run: PrimFn,
}

#[derive(Default)]
pub struct PrimRegistry {
    map: HashMap<&'static str, PrimDef>,
}

impl PrimRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &'static str, flags: PrimFlags, run: PrimFn) {
        self.map.insert(name, PrimDef { name, flags, run });
    }

    pub fn lookup(&self, name: &str) -> Option<PrimDef> {
        self.map.get(name).cloned()
    }

    /// Registry with the arithmetic / string / regexp core.
    pub fn with_builtins() -> Self {
        let mut r = Self::new();
        let pure = PrimFlags::empty();
        r.register("iadd", pure, prim_iadd);
        r.register("isub", pure, prim_isub);
        r.register("imul", pure, prim_imul);
        r.register("idiv", pure, prim_idiv);
        r.register("imod", pure, prim_imod);
        r.register("icmp", pure, prim_icmp);
        r.register("ilt", pure, prim_ilt);
        r.register("ieq", pure, prim_ieq);
        r.register("scat", pure, prim_scat);
        r.register("slen", pure, prim_slen);
        r.register("scmp", pure, prim_scmp);
        r.register("dadd", pure, prim_dadd);
        r.register("dmul", pure, prim_dmul);
        r.register("re_match", pure, prim_re_match);
        r.register("panic", PrimFlags::ORDERED | PrimFlags::EFFECT, prim_panic);
        r
    }
}

fn value(addr: Addr) -> Result<PrimOutcome, PrimError> {
    Ok(PrimOutcome::Value(addr))
}

// ---------------------------------------------------------------------
// Argument accessors
// ---------------------------------------------------------------------

pub fn expect_args(args: &[Addr], n: usize) -> Result<(), PrimError> {
    if args.len() != n {
        return Err(PrimError::Fail(format!(
            "primitive expected {n} arguments, got {}",
            args.len()
        )));
    }
    Ok(())
}

pub fn expect_integer(heap: &Heap, addr: Addr) -> Result<BigInt, PrimError> {
    if heap.tag(addr) != Tag::Integer {
        return Err(PrimError::Fail(format!(
            "expected Integer, got {}",
            heap.tag(addr).name()
        )));
    }
    Ok(heap.integer_value(addr))
}

pub fn expect_string(heap: &Heap, addr: Addr) -> Result<String, PrimError> {
    if heap.tag(addr) != Tag::String {
        return Err(PrimError::Fail(format!(
            "expected String, got {}",
            heap.tag(addr).name()
        )));
    }
    Ok(heap.string_value(addr))
}

pub fn expect_double(heap: &Heap, addr: Addr) -> Result<f64, PrimError> {
    if heap.tag(addr) != Tag::Double {
        return Err(PrimError::Fail(format!(
            "expected Double, got {}",
            heap.tag(addr).name()
        )));
    }
    Ok(heap.double_value(addr))
}

pub fn expect_job(heap: &Heap, addr: Addr) -> Result<Addr, PrimError> {
    if heap.tag(addr) != Tag::Job {
        return Err(PrimError::Fail(format!(
            "expected Job, got {}",
            heap.tag(addr).name()
        )));
    }
    Ok(addr)
}

/// Allocate a nullary boolean record.
pub fn alloc_bool(heap: &mut Heap, v: bool) -> Result<Addr, GcNeeded> {
    heap.reserve(Heap::reserve_record(0))?;
    Ok(heap.claim_record(if v { CTOR_TRUE } else { CTOR_FALSE }, 0))
}

// ---------------------------------------------------------------------
// Integers
// ---------------------------------------------------------------------

fn int2(io: &mut PrimIo<'_>, args: &[Addr]) -> Result<(BigInt, BigInt), PrimError> {
    expect_args(args, 2)?;
    Ok((
        expect_integer(io.heap, args[0])?,
        expect_integer(io.heap, args[1])?,
    ))
}

fn prim_iadd(io: &mut PrimIo<'_>, args: &[Addr]) -> Result<PrimOutcome, PrimError> {
    let (a, b) = int2(io, args)?;
    value(io.heap.alloc_integer(&(a + b))?)
}

fn prim_isub(io: &mut PrimIo<'_>, args: &[Addr]) -> Result<PrimOutcome, PrimError> {
    let (a, b) = int2(io, args)?;
    value(io.heap.alloc_integer(&(a - b))?)
}

fn prim_imul(io: &mut PrimIo<'_>, args: &[Addr]) -> Result<PrimOutcome, PrimError> {
    let (a, b) = int2(io, args)?;
    value(io.heap.alloc_integer(&(a * b))?)
}

fn prim_idiv(io: &mut PrimIo<'_>, args: &[Addr]) -> Result<PrimOutcome, PrimError> {
    let (a, b) = int2(io, args)?;
    if b.is_zero() {
        return Err(PrimError::Fail("division by zero".into()));
    }
    value(io.heap.alloc_integer(&(a / b))?)
}

fn prim_imod(io: &mut PrimIo<'_>, args: &[Addr]) -> Result<PrimOutcome, PrimError> {
    let (a, b) = int2(io, args)?;
    if b.is_zero() {
        return Err(PrimError::Fail("modulo by zero".into()));
    }
    value(io.heap.alloc_integer(&(a % b))?)
}

/// Mathematical comparison as an Integer in {-1, 0, 1}.
fn prim_icmp(io: &mut PrimIo<'_>, args: &[Addr]) -> Result<PrimOutcome, PrimError> {
    let (a, b) = int2(io, args)?;
    let ord = (a - b).signum();
    value(io.heap.alloc_integer(&ord)?)
}

fn prim_ilt(io: &mut PrimIo<'_>, args: &[Addr]) -> Result<PrimOutcome, PrimError> {
    let (a, b) = int2(io, args)?;
    value(alloc_bool(io.heap, a < b)?)
}

fn prim_ieq(io: &mut PrimIo<'_>, args: &[Addr]) -> Result<PrimOutcome, PrimError> {
    let (a, b) = int2(io, args)?;
    value(alloc_bool(io.heap, a == b)?)
}

// ---------------------------------------------------------------------
// Strings
// ---------------------------------------------------------------------

fn prim_scat(io: &mut PrimIo<'_>, args: &[Addr]) -> Result<PrimOutcome, PrimError> {
    expect_args(args, 2)?;
    let mut s = expect_string(io.heap, args[0])?;
    s.push_str(&expect_string(io.heap, args[1])?);
    value(io.heap.alloc_string(&s)?)
}

fn prim_slen(io: &mut PrimIo<'_>, args: &[Addr]) -> Result<PrimOutcome, PrimError> {
    expect_args(args, 1)?;
    let s = expect_string(io.heap, args[0])?;
    value(io.heap.alloc_integer(&BigInt::from(s.len()))?)
}

/// Lexicographic byte comparison as an Integer in {-1, 0, 1}.
fn prim_scmp(io: &mut PrimIo<'_>, args: &[Addr]) -> Result<PrimOutcome, PrimError> {
    expect_args(args, 2)?;
    if io.heap.tag(args[0]) != Tag::String || io.heap.tag(args[1]) != Tag::String {
        return Err(PrimError::Fail("scmp expects two Strings".into()));
    }
    let a = io.heap.string_bytes(args[0]);
    let b = io.heap.string_bytes(args[1]);
    let ord = match a.cmp(&b) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    };
    value(io.heap.alloc_integer(&BigInt::from(ord))?)
}

// ---------------------------------------------------------------------
// Doubles
// ---------------------------------------------------------------------

fn prim_dadd(io: &mut PrimIo<'_>, args: &[Addr]) -> Result<PrimOutcome, PrimError> {
    expect_args(args, 2)?;
    let a = expect_double(io.heap, args[0])?;
    let b = expect_double(io.heap, args[1])?;
    value(io.heap.alloc_double(a + b)?)
}

fn prim_dmul(io: &mut PrimIo<'_>, args: &[Addr]) -> Result<PrimOutcome, PrimError> {
    expect_args(args, 2)?;
    let a = expect_double(io.heap, args[0])?;
    let b = expect_double(io.heap, args[1])?;
    value(io.heap.alloc_double(a * b)?)
}

// ---------------------------------------------------------------------
// Regular expressions
// ---------------------------------------------------------------------

fn prim_re_match(io: &mut PrimIo<'_>, args: &[Addr]) -> Result<PrimOutcome, PrimError> {
    expect_args(args, 2)?;
    if io.heap.tag(args[0]) != Tag::RegExp {
        return Err(PrimError::Fail("re_match expects a RegExp".into()));
    }
    let subject = expect_string(io.heap, args[1])?;
    let matched = io.heap.regexp(args[0]).is_match(&subject);
    value(alloc_bool(io.heap, matched)?)
}

// ---------------------------------------------------------------------
// Failure
// ---------------------------------------------------------------------

fn prim_panic(io: &mut PrimIo<'_>, args: &[Addr]) -> Result<PrimOutcome, PrimError> {
    expect_args(args, 1)?;
    let msg = expect_string(io.heap, args[0])?;
    Err(PrimError::Fail(msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn io_test<R>(f: impl FnOnce(&mut PrimIo<'_>) -> R) -> R {
        let mut heap = Heap::new(2.0, 0);
        let mut ctx = ();
        let mut io = PrimIo {
            heap: &mut heap,
            ctx: &mut ctx,
        };
        f(&mut io)
    }

    fn unwrap_value(out: Result<PrimOutcome, PrimError>) -> Addr {
        match out {
            Ok(PrimOutcome::Value(v)) => v,
            Ok(PrimOutcome::Park { .. }) => panic!("unexpected park"),
            Err(PrimError::Fail(msg)) => panic!("unexpected failure: {msg}"),
            Err(PrimError::Gc(_)) => panic!("unexpected GC demand"),
        }
    }

    #[test]
    fn integer_arithmetic() {
        io_test(|io| {
            let a = io.heap.alloc_integer(&BigInt::from(40)).unwrap();
            let b = io.heap.alloc_integer(&BigInt::from(2)).unwrap();
            let sum = unwrap_value(prim_iadd(io, &[a, b]));
            assert_eq!(io.heap.integer_value(sum), BigInt::from(42));
            let prod = unwrap_value(prim_imul(io, &[a, b]));
            assert_eq!(io.heap.integer_value(prod), BigInt::from(80));
        });
    }

    #[test]
    fn division_by_zero_fails() {
        io_test(|io| {
            let a = io.heap.alloc_integer(&BigInt::from(1)).unwrap();
            let z = io.heap.alloc_integer(&BigInt::from(0)).unwrap();
            match prim_idiv(io, &[a, z]) {
                Err(PrimError::Fail(msg)) => assert!(msg.contains("zero")),
                _ => panic!("expected failure"),
            }
        });
    }

    #[test]
    fn string_ops() {
        io_test(|io| {
            let a = io.heap.alloc_string("build").unwrap();
            let b = io.heap.alloc_string(" system").unwrap();
            let cat = unwrap_value(prim_scat(io, &[a, b]));
            assert_eq!(io.heap.string_value(cat), "build system");
            let len = unwrap_value(prim_slen(io, &[cat]));
            assert_eq!(io.heap.integer_value(len), BigInt::from(12));
            let ord = unwrap_value(prim_scmp(io, &[a, b]));
            assert_eq!(io.heap.integer_value(ord), BigInt::from(1));
        });
    }

    #[test]
    fn regexp_matches_across_newlines() {
        io_test(|io| {
            let pat = io.heap.alloc_string("a.b").unwrap();
            let re = regex::RegexBuilder::new("a.b")
                .dot_matches_new_line(true)
                .build()
                .unwrap();
            io.heap.reserve(Heap::reserve_regexp()).unwrap();
            let rx = io.heap.claim_regexp(pat, re);
            let subject = io.heap.alloc_string("a\nb").unwrap();
            let hit = unwrap_value(prim_re_match(io, &[rx, subject]));
            assert_eq!(io.heap.record_ctor(hit), CTOR_TRUE);
        });
    }

    #[test]
    fn wrong_types_fail_not_panic() {
        io_test(|io| {
            let s = io.heap.alloc_string("nope").unwrap();
            let i = io.heap.alloc_integer(&BigInt::from(1)).unwrap();
            assert!(matches!(prim_iadd(io, &[s, i]), Err(PrimError::Fail(_))));
        });
    }
}
