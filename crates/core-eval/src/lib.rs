//! Evaluator for scoped SSA: closures, partial application, promise-driven
//! scheduling, and the primitive registry.
//!
//! The split from `core-ssa` mirrors the pipeline: the optimizer owns the
//! term tree, this crate owns what happens after `scope` numbering — a
//! [`program::Program`] of flattened functions interpreted by a
//! [`runtime::Runtime`] against a `core-heap` heap.

pub mod prim;
pub mod program;
pub mod runtime;

pub use prim::{
    alloc_bool, expect_args, expect_double, expect_integer, expect_job, expect_string, PrimDef,
    PrimError, PrimFn, PrimIo, PrimOutcome, PrimRegistry, CTOR_ERROR, CTOR_FALSE, CTOR_TRUE,
};
pub use program::{FunDef, FunId, LinkError, Op, PrimId, Program};
pub use runtime::{
    EvalServices, NoServices, Runtime, WORK_APP, WORK_DES, WORK_DES_APPLY, WORK_EXTERNAL,
    WORK_GET, WORK_PRIM,
};
