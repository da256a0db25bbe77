//! Common-subexpression elimination.
//!
//! Within each function (and against its ancestors), a pure term that is
//! structurally identical to an earlier one — same kind, same immediates,
//! same already-renumbered operands — is discarded in favor of the earlier
//! index. Ordered and effectful terms are never merged, and functions are
//! left alone: the inliner and scope pass own their fate.

use std::collections::HashMap;

use crate::pool::LitId;
use crate::stream::{TargetScope, TermStream};
use crate::term::{Term, TermFlags, TermKind};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Key {
    Lit(LitId),
    App(Vec<usize>),
    Prim(String, Vec<usize>),
    Get(usize, Vec<usize>),
    Des(Vec<usize>),
    Con(usize, Vec<usize>),
}

fn key_of(term: &Term) -> Option<Key> {
    match &term.kind {
        TermKind::Lit { value } => Some(Key::Lit(*value)),
        TermKind::App { args } => Some(Key::App(args.clone())),
        TermKind::Prim { name, args, .. } => Some(Key::Prim(name.clone(), args.clone())),
        TermKind::Get { index, args } => Some(Key::Get(*index, args.clone())),
        TermKind::Des { args } => Some(Key::Des(args.clone())),
        TermKind::Con { ctor, args } => Some(Key::Con(*ctor, args.clone())),
        TermKind::Arg | TermKind::Fun { .. } => None,
    }
}

pub fn pass_cse(root: Term) -> Term {
    let mut scope = TargetScope::new();
    let mut stream = TermStream::new(&mut scope, 0);
    let mut frames = Vec::new();
    cse_fun(root, &mut stream, &mut frames);
    drop(stream);
    scope.finish()
}

fn cse_fun(mut fun: Term, stream: &mut TermStream, frames: &mut Vec<HashMap<Key, usize>>) {
    let (terms, old_output) = match &mut fun.kind {
        TermKind::Fun { terms, output, .. } => (std::mem::take(terms), *output),
        _ => panic!("cse_fun on non-function"),
    };
    let fnid = stream.transfer(fun);
    let cp = stream.begin();
    frames.push(HashMap::new());

    for t in terms {
        if t.is_fun() {
            cse_fun(t, stream, frames);
            continue;
        }
        let mut t = t;
        t.update(stream.map());
        let mergeable = !t.get(TermFlags::EFFECT) && !t.get(TermFlags::ORDERED);
        if mergeable {
            if let Some(key) = key_of(&t) {
                if let Some(&at) = frames.iter().rev().find_map(|f| f.get(&key)) {
                    stream.discard_to(at, false);
                    continue;
                }
                let at = stream.transfer(t);
                frames.last_mut().unwrap().insert(key, at);
                continue;
            }
        }
        stream.transfer(t);
    }

    frames.pop();
    let new_output = stream.map().get(old_output);
    let body = stream.end_at(cp);
    if let TermKind::Fun { terms, output, .. } = &mut stream.get_mut(fnid).kind {
        *terms = body;
        *output = new_output;
    }
}
