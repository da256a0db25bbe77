//! Dead-code sweep.
//!
//! Rebuilds the tree through a [`TermStream`], dropping every term that is
//! unused and effect-free. Arg terms always survive (they fix the arity of
//! their function); effectful terms survive even unused. Dropped terms map
//! to the invalid index, which is safe because nothing live references
//! them.

use crate::stream::{TargetScope, TermStream};
use crate::term::{Term, TermFlags, TermKind};

pub fn pass_sweep(root: Term) -> Term {
    let mut scope = TargetScope::new();
    let mut stream = TermStream::new(&mut scope, 0);
    sweep_fun(root, &mut stream);
    drop(stream);
    scope.finish()
}

fn sweep_fun(mut fun: Term, stream: &mut TermStream) {
    let (terms, old_output) = match &mut fun.kind {
        TermKind::Fun { terms, output, .. } => (std::mem::take(terms), *output),
        _ => panic!("sweep_fun on non-function"),
    };
    let fnid = stream.transfer(fun);
    let cp = stream.begin();

    for t in terms {
        let keep = t.get(TermFlags::USED) || t.get(TermFlags::EFFECT) || t.is_arg();
        if !keep {
            stream.discard();
        } else if t.is_fun() {
            sweep_fun(t, stream);
        } else {
            let mut t = t;
            t.update(stream.map());
            stream.transfer(t);
        }
    }

    let new_output = stream.map().get(old_output);
    let body = stream.end_at(cp);
    if let TermKind::Fun { terms, output, .. } = &mut stream.get_mut(fnid).kind {
        *terms = body;
        *output = new_output;
    }
}
