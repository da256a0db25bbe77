//! SSA intermediate representation and the optimization pipeline.
//!
//! Programs arrive as a tree of functions whose operands are backward
//! "spine" references (see [`term`]); the passes rewrite the tree through a
//! [`stream::TermStream`] and finally number every reference into a
//! `(depth, offset)` pair the evaluator can chase through runtime scopes.
//!
//! Pass order matters: purity feeds usage (effects root liveness), usage
//! feeds sweep and the inliner's singleton decisions, and the constant
//! pool plus CSE run between inliner rounds so duplicated bodies collapse
//! back together.

pub mod cse;
pub mod inline;
pub mod pool;
pub mod purity;
pub mod scope;
pub mod stream;
pub mod sweep;
pub mod term;
pub mod usage;

pub use pool::{LitId, LiteralPool};
pub use term::{
    arg_depth, arg_offset, make_arg, format_term, PrimFlags, Term, TermBuilder, TermFlags,
    TermKind, GUARD_LABEL, INVALID,
};

use tracing::debug;

fn purity_round(term: &mut Term) {
    purity::pass_purity(term, PrimFlags::EFFECT, TermFlags::EFFECT);
    purity::pass_purity(
        term,
        PrimFlags::ORDERED | PrimFlags::EFFECT,
        TermFlags::ORDERED,
    );
}

/// The overall optimization strategy: two inliner rounds at increasing
/// thresholds, bracketed by purity/usage/sweep and followed by CSE.
pub fn optimize(mut term: Term) -> Term {
    purity_round(&mut term);
    usage::pass_usage(&mut term);
    let term = sweep::pass_sweep(term);

    let mut term = inline::pass_inline(term, 20);
    purity_round(&mut term);
    usage::pass_usage(&mut term);
    let term = sweep::pass_sweep(term);
    let mut term = cse::pass_cse(term);
    usage::pass_usage(&mut term);

    let mut term = inline::pass_inline(term, 50);
    purity_round(&mut term);
    usage::pass_usage(&mut term);
    let term = sweep::pass_sweep(term);
    let term = cse::pass_cse(term);

    debug!(target: "ssa.optimize", "optimization pipeline complete");
    term
}

/// Number references for interpretation. Run after [`optimize`].
pub fn scope(term: &mut Term, pool: &LiteralPool) {
    scope::pass_scope(term, pool);
}
