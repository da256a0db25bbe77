//! Purity propagation.
//!
//! Two flavors run over the same machinery: the `effect` flavor seeds from
//! primitives that declare an observable side effect, the `ordered` flavor
//! from primitives that must not be reordered (effectful primitives are
//! implicitly ordered). The seeded flag then flows to every term that uses
//! a flagged term, directly or transitively, including functions whose body
//! contains one. Flags are monotone, so the walk repeats until stable; the
//! second iteration only matters for recursive functions whose self
//! reference is seen before the function's own flag settles.

use crate::term::{PrimFlags, Term, TermFlags, TermKind};

struct Frame {
    start: usize,
    done: Vec<bool>,
}

fn lookup(frames: &[Frame], index: usize) -> bool {
    for f in frames.iter().rev() {
        if index >= f.start {
            let off = index - f.start;
            // A forward reference (recursion) has no entry yet; treat it as
            // clean this iteration and let the fixpoint carry it.
            return f.done.get(off).copied().unwrap_or(false);
        }
    }
    false
}

pub fn pass_purity(root: &mut Term, source: PrimFlags, sflag: TermFlags) {
    loop {
        let mut frames = Vec::new();
        let mut changed = false;
        walk_fun(root, 1, source, sflag, &mut frames, &mut changed);
        if !changed {
            break;
        }
    }
}

/// Returns whether any body term carries the flag, which becomes the
/// function's own flag: applying it would reach those terms.
fn walk_fun(
    fun: &mut Term,
    start: usize,
    source: PrimFlags,
    sflag: TermFlags,
    frames: &mut Vec<Frame>,
    changed: &mut bool,
) -> bool {
    let TermKind::Fun { terms, .. } = &mut fun.kind else {
        panic!("walk_fun on non-function");
    };
    frames.push(Frame {
        start,
        done: Vec::with_capacity(terms.len()),
    });

    let mut any = false;
    for j in 0..terms.len() {
        let own = match &terms[j].kind {
            TermKind::Prim { pflags, .. } => pflags.intersects(source),
            _ => false,
        };
        let mut val = own || terms[j].get(sflag);
        for k in 0..terms[j].args().len() {
            let a = terms[j].args()[k];
            if !val {
                val = lookup(frames, a);
            }
        }
        if terms[j].is_fun() {
            let body = walk_fun(&mut terms[j], start + j + 1, source, sflag, frames, changed);
            val = val || body;
        }
        if val && !terms[j].get(sflag) {
            terms[j].set(sflag, true);
            *changed = true;
        }
        any = any || val;
        frames.last_mut().unwrap().done.push(val);
    }

    frames.pop();
    if any && !fun.get(sflag) {
        fun.set(sflag, true);
        *changed = true;
    }
    fun.get(sflag) || any
}
