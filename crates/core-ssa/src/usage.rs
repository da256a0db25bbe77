//! Usage analysis.
//!
//! Walks every function body backwards marking exactly those terms whose
//! value reaches a function output or a used effectful term. Use counts are
//! tallied on the way, so the pass also refreshes the SINGLETON flag: a
//! term with exactly one use may later be moved (not cloned) by the
//! inliner.

use crate::term::{Term, TermFlags, TermKind};

struct Frame {
    start: usize,
    used: Vec<bool>,
    count: Vec<u32>,
}

fn mark(frames: &mut [Frame], index: usize) {
    for f in frames.iter_mut().rev() {
        if index >= f.start {
            let off = index - f.start;
            f.used[off] = true;
            f.count[off] += 1;
            return;
        }
    }
    panic!("operand reference {index} outside every frame");
}

pub fn pass_usage(root: &mut Term) {
    root.set(TermFlags::USED, true);
    let mut frames = Vec::new();
    walk_fun(root, true, 1, &mut frames);
}

fn walk_fun(fun: &mut Term, fun_used: bool, start: usize, frames: &mut Vec<Frame>) {
    let output = match &fun.kind {
        TermKind::Fun { output, .. } => *output,
        _ => panic!("walk_fun on non-function"),
    };
    let len = match &fun.kind {
        TermKind::Fun { terms, .. } => terms.len(),
        _ => unreachable!(),
    };
    frames.push(Frame {
        start,
        used: vec![false; len],
        count: vec![0; len],
    });
    if fun_used {
        mark(frames, output);
    }

    let TermKind::Fun { terms, .. } = &mut fun.kind else {
        unreachable!();
    };
    for j in (0..len).rev() {
        let f = frames.last().unwrap();
        let (seen, count) = (f.used[j], f.count[j]);
        let t = &mut terms[j];
        let u = seen || (t.get(TermFlags::EFFECT) && fun_used);
        t.set(TermFlags::USED, u);
        t.set(TermFlags::SINGLETON, u && count == 1);
        if u {
            for k in 0..t.args().len() {
                let a = t.args()[k];
                mark(frames, a);
            }
        }
        if t.is_fun() {
            walk_fun(t, u, start + j + 1, frames);
        }
    }

    frames.pop();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::{PrimFlags, TermBuilder};

    #[test]
    fn output_chain_is_used_dead_code_is_not() {
        let mut b = TermBuilder::new();
        b.begin_fun("main"); // 0
        let x = b.arg("x"); // 1
        let dead = b.con("dead", 0, vec![x]); // 2
        let live = b.con("live", 1, vec![x]); // 3
        let _ = dead;
        let mut root = b.finish(live);

        pass_usage(&mut root);
        let TermKind::Fun { terms, .. } = &root.kind else { unreachable!() };
        assert!(terms[0].get(TermFlags::USED)); // x feeds live
        assert!(!terms[1].get(TermFlags::USED)); // dead
        assert!(terms[2].get(TermFlags::USED)); // live (output)
    }

    #[test]
    fn effectful_terms_root_usage() {
        let mut b = TermBuilder::new();
        b.begin_fun("main"); // 0
        let x = b.arg("x"); // 1
        let arg_of_effect = b.con("c", 0, vec![x]); // 2
        let e = b.prim(
            "launch",
            "job_launch",
            PrimFlags::EFFECT | PrimFlags::ORDERED,
            vec![arg_of_effect],
        ); // 3
        let out = b.con("unit", 0, vec![]); // 4
        let _ = e;
        let mut root = b.finish(out);

        // Purity must run first so the prim carries its EFFECT flag.
        crate::purity::pass_purity(&mut root, PrimFlags::EFFECT, TermFlags::EFFECT);
        pass_usage(&mut root);
        let TermKind::Fun { terms, .. } = &root.kind else { unreachable!() };
        assert!(terms[2].get(TermFlags::USED), "effect is kept");
        assert!(terms[1].get(TermFlags::USED), "its operand is kept");
    }

    #[test]
    fn singleton_reflects_use_count() {
        let mut b = TermBuilder::new();
        b.begin_fun("main"); // 0
        let x = b.arg("x"); // 1
        let once = b.con("a", 0, vec![x]); // 2
        let twice = b.con("b", 1, vec![x, x]); // 3  (x now used 3x total)
        let out = b.con("pair", 2, vec![once, twice, twice]); // 4
        let mut root = b.finish(out);

        pass_usage(&mut root);
        let TermKind::Fun { terms, .. } = &root.kind else { unreachable!() };
        assert!(terms[1].get(TermFlags::SINGLETON), "one use of `once`");
        assert!(!terms[2].get(TermFlags::SINGLETON), "two uses of `twice`");
        assert!(!terms[0].get(TermFlags::SINGLETON), "three uses of x");
    }

    #[test]
    fn unused_functions_do_not_root_their_bodies() {
        let mut b = TermBuilder::new();
        b.begin_fun("main"); // 0
        let x = b.arg("x"); // 1
        b.begin_fun("dead_fn"); // 2
        let y = b.arg("y"); // 3
        let inner = b.con("c", 0, vec![y]); // 4
        let _ = inner;
        b.end_fun(inner).unwrap();
        let out = b.con("unit", 0, vec![x]); // 3 (parent numbering)
        let mut root = b.finish(out);

        pass_usage(&mut root);
        let TermKind::Fun { terms, .. } = &root.kind else { unreachable!() };
        assert!(!terms[1].get(TermFlags::USED), "dead fn unused");
        let TermKind::Fun { terms: body, .. } = &terms[1].kind else {
            unreachable!()
        };
        assert!(!body[1].get(TermFlags::USED), "its body unused too");
    }
}
