//! Scope numbering.
//!
//! The final pass before interpretation: every operand reference becomes a
//! packed `(depth, offset)` pair — `depth` parent links to traverse at run
//! time, `offset` a slot in that scope. Each function also learns its
//! `escapes` (the ancestor references its body closes over, expressed in
//! the parent's frame) and a content hash fed from a canonical code
//! sequence: term type tags, operand references, primitive names, literal
//! deep hashes.

use crate::pool::LiteralPool;
use crate::term::{make_arg, Term, TermKind};

// Type tags for the canonical code sequence; must stay stable because they
// feed function content hashes.
const CODE_ARG: u64 = 0;
const CODE_LIT: u64 = 1;
const CODE_APP: u64 = 2;
const CODE_PRIM: u64 = 3;
const CODE_GET: u64 = 4;
const CODE_DES: u64 = 5;
const CODE_CON: u64 = 6;
const CODE_FUN: u64 = 7;

struct Frame {
    start: usize,
    index: usize,
    escapes: Vec<usize>,
    codes: Vec<u64>,
}

fn push_hash(codes: &mut Vec<u64>, hash: blake3::Hash) {
    for chunk in hash.as_bytes().chunks(8) {
        codes.push(u64::from_le_bytes(chunk.try_into().unwrap()));
    }
}

/// Convert one raw spine reference in the context of the innermost frame.
fn scope_arg(frames: &mut [Frame], input: usize) -> usize {
    let last = frames.len() - 1;
    let start = frames[last].start;
    if input < start {
        // Captured: find (or add) the escape ordinal, then express the
        // reference against the ancestor frame that owns it.
        let escape = match frames[last].escapes.iter().position(|&e| e == input) {
            Some(i) => i,
            None => {
                frames[last].escapes.push(input);
                frames[last].escapes.len() - 1
            }
        };
        let mut depth = 0;
        let mut level = last;
        loop {
            depth += 1;
            level -= 1;
            if input >= frames[level].start {
                break;
            }
        }
        let offset = input - frames[level].start;
        frames[last].codes.push(make_arg(1, escape) as u64);
        make_arg(depth, offset)
    } else {
        let out = make_arg(0, input - start);
        frames[last].codes.push(out as u64);
        out
    }
}

fn scope_redux(frames: &mut [Frame], args: &mut [usize], code: u64) {
    let last = frames.len() - 1;
    frames[last].codes.push(code);
    frames[last].codes.push(args.len() as u64);
    for a in args {
        *a = scope_arg(frames, *a);
    }
}

pub fn pass_scope(root: &mut Term, pool: &LiteralPool) {
    let mut frames = vec![Frame {
        start: 0,
        index: 0,
        escapes: Vec::new(),
        codes: Vec::new(),
    }];
    scope_fun(root, &mut frames, pool);
}

fn scope_term(term: &mut Term, frames: &mut Vec<Frame>, pool: &LiteralPool) {
    match &mut term.kind {
        TermKind::Arg => {
            frames.last_mut().unwrap().codes.push(CODE_ARG);
        }
        TermKind::Lit { value } => {
            let f = frames.last_mut().unwrap();
            f.codes.push(CODE_LIT);
            let hash = pool.hash(*value);
            push_hash(&mut f.codes, hash);
        }
        TermKind::App { args } => scope_redux(frames, args, CODE_APP),
        TermKind::Prim { name, args, .. } => {
            let name_hash = blake3::hash(name.as_bytes());
            scope_redux(frames, args, CODE_PRIM);
            push_hash(&mut frames.last_mut().unwrap().codes, name_hash);
        }
        TermKind::Get { index, args } => {
            let index = *index as u64;
            scope_redux(frames, args, CODE_GET);
            frames.last_mut().unwrap().codes.push(index);
        }
        TermKind::Des { args } => scope_redux(frames, args, CODE_DES),
        TermKind::Con { ctor, args } => {
            let ctor = *ctor as u64;
            scope_redux(frames, args, CODE_CON);
            frames.last_mut().unwrap().codes.push(ctor);
        }
        TermKind::Fun { .. } => scope_fun(term, frames, pool),
    }
}

fn scope_fun(fun: &mut Term, frames: &mut Vec<Frame>, pool: &LiteralPool) {
    let parent_index = frames.last().unwrap().index;
    frames.push(Frame {
        start: parent_index + 1,
        index: parent_index + 1,
        escapes: Vec::new(),
        codes: Vec::new(),
    });

    let TermKind::Fun { output, terms, .. } = &mut fun.kind else {
        panic!("scope_fun on non-function");
    };
    *output = scope_arg(frames, *output);
    for t in terms.iter_mut() {
        scope_term(t, frames, pool);
        frames.last_mut().unwrap().index += 1;
    }

    let frame = frames.pop().unwrap();
    let mut code_bytes = Vec::with_capacity(frame.codes.len() * 8);
    for c in &frame.codes {
        code_bytes.extend_from_slice(&c.to_le_bytes());
    }
    let content = blake3::hash(&code_bytes);

    {
        let parent = frames.last_mut().unwrap();
        parent.codes.push(CODE_FUN);
        push_hash(&mut parent.codes, content);
    }
    // Convert each captured raw index in the parent's frame.
    let mut raw_escapes = frame.escapes;
    for e in raw_escapes.iter_mut() {
        *e = scope_arg(frames, *e);
    }

    let TermKind::Fun { escapes, hash, .. } = &mut fun.kind else {
        unreachable!();
    };
    *hash = Some(content);
    *escapes = raw_escapes;
}
