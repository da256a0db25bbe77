//! Inlining, n-ary application combining, constructor elimination, and
//! literal deduplication.
//!
//! During this pass `meta` packs `(body size, unapplied args)` for every
//! placed term. An `App` whose function resolves (through a spine of
//! partial applications) to a fully-applied, non-recursive function is
//! substituted when the function is a singleton (moved, preventing
//! exponential growth) or its size is under the threshold (cloned). A
//! constant pool keyed by interned literal identity shares `Lit` terms
//! across the whole rewrite. `Get` of a known constructor projects
//! directly; `Des` of a known constructor applies the selected handler;
//! two stacked `Des` fuse when the inner one is a singleton constructor
//! source.

use std::collections::HashMap;

use crate::pool::LitId;
use crate::stream::{SourceMap, TargetScope};
use crate::term::{Term, TermFlags, TermKind, GUARD_LABEL, INVALID};

fn make_meta(size: u64, args: u64) -> u64 {
    (size << 8) | args
}

fn meta_size(meta: u64) -> u64 {
    meta >> 8
}

fn meta_args(meta: u64) -> u64 {
    meta & 0xFF
}

struct Inliner {
    scope: TargetScope,
    pool: HashMap<LitId, usize>,
    threshold: u64,
}

impl Inliner {
    fn transfer(&mut self, map: &mut SourceMap, t: Term) -> usize {
        let out = self.scope.append(t);
        map.place(out);
        out
    }

    fn discard_to(&mut self, map: &mut SourceMap, at: usize, singleton: bool) {
        if !singleton {
            self.scope.get_mut(at).set(TermFlags::SINGLETON, false);
        }
        map.place(at);
    }
}

pub fn pass_inline(mut root: Term, threshold: usize) -> Term {
    // Top-level definitions are not candidates for movement (inlining by
    // clone is still fine): moving them would make function hashes
    // sensitive to unrelated source changes.
    if let TermKind::Fun { terms, .. } = &mut root.kind {
        for t in terms.iter_mut() {
            t.set(TermFlags::SINGLETON, false);
        }
    }
    let mut inl = Inliner {
        scope: TargetScope::new(),
        pool: HashMap::new(),
        threshold: threshold as u64,
    };
    let mut map = SourceMap::new(0);
    fun_inline(&mut inl, &mut map, root);
    inl.scope.finish()
}

fn term_inline(inl: &mut Inliner, map: &mut SourceMap, mut t: Term) {
    match &t.kind {
        TermKind::Arg => {
            // Unapplied-arg count unknown; zero prevents inlining through it.
            t.meta = make_meta(1, 0);
            inl.transfer(map, t);
        }
        TermKind::Lit { .. } => lit_inline(inl, map, t),
        TermKind::App { .. } => {
            t.update(map);
            app_inline(inl, map, t);
        }
        TermKind::Prim { .. } => {
            t.meta = make_meta(1, 0);
            t.update(map);
            inl.transfer(map, t);
        }
        TermKind::Get { .. } => get_inline(inl, map, t),
        TermKind::Des { .. } => des_inline(inl, map, t),
        TermKind::Con { .. } => {
            t.meta = make_meta(1, 0);
            t.update(map);
            t.set(TermFlags::FRCON, true);
            inl.transfer(map, t);
        }
        TermKind::Fun { .. } => fun_inline(inl, map, t),
    }
}

fn lit_inline(inl: &mut Inliner, map: &mut SourceMap, mut t: Term) {
    t.meta = make_meta(1, 0);
    let TermKind::Lit { value } = t.kind else { unreachable!() };
    let me = inl.scope.end();
    match inl.pool.get(&value).copied() {
        None => {
            // First ever use of this constant.
            inl.pool.insert(value, me);
            inl.transfer(map, t);
        }
        Some(prior) => {
            // The pool survives scope unwinds, so verify the slot still
            // holds this constant before aliasing it.
            let still_there = prior < inl.scope.end()
                && matches!(inl.scope.get(prior).kind, TermKind::Lit { value: v } if v == value);
            if still_there {
                inl.discard_to(map, prior, false);
            } else {
                inl.pool.insert(value, me);
                inl.transfer(map, t);
            }
        }
    }
}

fn get_inline(inl: &mut Inliner, map: &mut SourceMap, mut t: Term) {
    t.meta = make_meta(1, 0);
    t.update(map);
    let TermKind::Get { index, ref args } = t.kind else { unreachable!() };
    let obj = args[0];
    let known_field = match &inl.scope.get(obj).kind {
        TermKind::Con { args: cargs, .. } => Some(cargs[index]),
        _ => None,
    };
    match known_field {
        Some(field) => inl.discard_to(map, field, false),
        None => {
            inl.transfer(map, t);
        }
    }
}

fn des_inline(inl: &mut Inliner, map: &mut SourceMap, mut t: Term) {
    t.meta = make_meta(1, 0);
    t.update(map);
    let args = t.args().to_vec();
    let n = args.len();

    // Every handler identical: no dispatch needed, just apply it.
    if (1..n - 1).all(|i| args[0] == args[i]) {
        let app = Term::new(
            t.label.clone(),
            TermKind::App {
                args: vec![args[0], args[n - 1]],
            },
        );
        app_inline(inl, map, app);
        return;
    }

    // Known constructor: select the handler statically.
    let known_ctor = match &inl.scope.get(args[n - 1]).kind {
        TermKind::Con { ctor, .. } => Some(*ctor),
        _ => None,
    };
    if let Some(ctor) = known_ctor {
        let app = Term::new(
            t.label.clone(),
            TermKind::App {
                args: vec![args[ctor], args[n - 1]],
            },
        );
        app_inline(inl, map, app);
        return;
    }

    // Fuse with an inner Des that always produces a constructor, as long
    // as reordering is allowed and nobody else observes it.
    let inner = inl.scope.get(args[n - 1]);
    let fusable = !inner.get(TermFlags::ORDERED)
        && inner.get(TermFlags::FRCON)
        && inner.get(TermFlags::SINGLETON)
        && matches!(inner.kind, TermKind::Des { .. });
    if fusable {
        let inner_args = inner.args().to_vec();
        for &h in &args[..n - 1] {
            inl.scope.get_mut(h).set(TermFlags::SINGLETON, false);
        }
        for &h in &inner_args[..inner_args.len() - 1] {
            inl.scope.get_mut(h).set(TermFlags::SINGLETON, false);
        }
        // Compose: one new function per inner handler, which applies that
        // handler and then dispatches our own cases on the result.
        let mut compose = Vec::new();
        for &inner_handler in &inner_args[..inner_args.len() - 1] {
            let fnid = inl.scope.end();
            compose.push(fnid);
            let mut cargs = args.clone();
            *cargs.last_mut().unwrap() = fnid + 2;
            let label = inl.scope.get(inner_handler).label.clone();
            let f = Term::new(
                label,
                TermKind::Fun {
                    fragment: String::new(),
                    output: fnid + 3,
                    terms: vec![
                        Term::new("", TermKind::Arg),
                        Term::new(
                            "",
                            TermKind::App {
                                args: vec![inner_handler, fnid + 1],
                            },
                        ),
                        Term::new(t.label.clone(), TermKind::Des { args: cargs }),
                    ],
                    escapes: Vec::new(),
                    hash: None,
                },
            );
            let mut qmap = SourceMap::new(fnid);
            fun_inline(inl, &mut qmap, f);
        }
        compose.push(*inner_args.last().unwrap());
        if let TermKind::Des { args } = &mut t.kind {
            *args = compose;
        }
    }

    let final_args = t.args().to_vec();
    let placed = inl.transfer(map, t);
    let known = final_args[..final_args.len() - 1]
        .iter()
        .all(|&h| inl.scope.get(h).get(TermFlags::FRCON));
    inl.scope.get_mut(placed).set(TermFlags::FRCON, known);
}

fn app_inline(inl: &mut Inliner, map: &mut SourceMap, mut app: Term) {
    let args = app.args().to_vec();
    let fnargs = meta_args(inl.scope.get(args[0]).meta);

    if fnargs as usize != args.len() - 1 {
        if fnargs == 0 {
            // Unknown function applied; leave the App alone.
            app.meta = make_meta(1, 0);
        } else {
            // Partial application: record how many args are still missing.
            app.meta = make_meta(1, fnargs + 1 - (args.len() as u64 - 1));
        }
        inl.transfer(map, app);
        return;
    }

    // Walk the spine of partial applications gathering the full argument
    // list right-to-left (preserving evaluation order) and tracking
    // whether every node on the way has exactly one use.
    let mut fargs = Vec::new();
    let mut singleton = true;
    let mut cur_args = args;
    let fnid;
    loop {
        for i in (1..cur_args.len()).rev() {
            let argid = cur_args[i];
            fargs.push(argid);
            if !singleton {
                inl.scope.get_mut(argid).set(TermFlags::SINGLETON, false);
            }
        }
        let f = cur_args[0];
        if !inl.scope.get(f).get(TermFlags::SINGLETON) {
            singleton = false;
        }
        if matches!(inl.scope.get(f).kind, TermKind::App { .. }) {
            cur_args = inl.scope.get(f).args().to_vec();
        } else {
            fnid = f;
            break;
        }
    }
    if inl.scope.get(fnid).label == GUARD_LABEL {
        singleton = true;
    }
    let target = inl.scope.get(fnid);
    assert!(!target.get(TermFlags::MOVED), "application of moved function");
    debug_assert!(target.is_fun(), "saturated application of non-function");
    let recursive = target.get(TermFlags::RECURSIVE);
    let small = meta_size(target.meta) < inl.threshold;

    if recursive || !(singleton || small) {
        // Combine into one n-ary App but do not inline.
        if !singleton {
            inl.scope.get_mut(fnid).set(TermFlags::SINGLETON, false);
        }
        let mut new_args = vec![fnid];
        for i in (0..fargs.len()).rev() {
            new_args.push(fargs[i]);
        }
        if let TermKind::App { args } = &mut app.kind {
            *args = new_args;
        }
        app.meta = make_meta(1, 0);
        inl.transfer(map, app);
        return;
    }

    // Take the body: move a singleton, clone anything else.
    let mut fun_terms;
    let fun_output;
    if singleton {
        match &mut inl.scope.get_mut(fnid).kind {
            TermKind::Fun { terms, output, .. } => {
                fun_terms = std::mem::take(terms);
                fun_output = *output;
            }
            _ => unreachable!(),
        }
    } else {
        // Guard against re-entry while this function's clone is rewritten
        // (a Y-combinator closing over it would otherwise recurse here).
        inl.scope.get_mut(fnid).set(TermFlags::RECURSIVE, true);
        let cloned = clone_term(inl, fnid);
        match cloned.kind {
            TermKind::Fun { terms, output, .. } => {
                fun_terms = terms;
                fun_output = output;
            }
            _ => unreachable!(),
        }
    }

    let mut qmap = SourceMap::new(fnid);
    qmap.place(INVALID); // the inlined function's own slot
    let n1 = fargs.len() - 1;
    for (i, _) in fun_terms.iter().take(fargs.len()).enumerate() {
        // Bind parameter i to the matching gathered argument.
        let arg_singleton = fun_terms[i].get(TermFlags::SINGLETON);
        if !arg_singleton {
            inl.scope
                .get_mut(fargs[n1 - i])
                .set(TermFlags::SINGLETON, false);
        }
        qmap.place(fargs[n1 - i]);
    }
    for i in fargs.len()..fun_terms.len() {
        let t = std::mem::replace(&mut fun_terms[i], Term::new("", TermKind::Arg));
        term_inline(inl, &mut qmap, t);
    }
    let new_output = qmap.get(fun_output);
    if !app.label.is_empty() {
        inl.scope.get_mut(new_output).label = app.label.clone();
    }
    // The App itself becomes an alias of the inlined function's output.
    let app_singleton = app.get(TermFlags::SINGLETON);
    inl.discard_to(map, new_output, app_singleton);

    if singleton {
        // Leave a husk behind: arity preserved, body gone, never applied
        // again (asserted above).
        fun_terms.truncate(fargs.len());
        let f = inl.scope.get_mut(fnid);
        if let TermKind::Fun { terms, output, .. } = &mut f.kind {
            *terms = fun_terms;
            *output = 0;
        }
        f.meta = make_meta(0, fargs.len() as u64);
        f.set(TermFlags::MOVED, true);
    } else {
        inl.scope.get_mut(fnid).set(TermFlags::RECURSIVE, false);
    }
}

/// Deep-clone the term at `index`, clearing the singleton flag of every
/// term the clone references outside itself (each gains a second user).
fn clone_term(inl: &mut Inliner, index: usize) -> Term {
    let cloned = inl.scope.get(index).clone();
    clear_refs(inl, &cloned, index);
    cloned
}

fn clear_refs(inl: &mut Inliner, t: &Term, id: usize) {
    for &a in t.args() {
        if a < id {
            inl.scope.get_mut(a).set(TermFlags::SINGLETON, false);
        }
    }
    if let TermKind::Fun { terms, output, .. } = &t.kind {
        if *output < id {
            inl.scope.get_mut(*output).set(TermFlags::SINGLETON, false);
        }
        for c in terms {
            clear_refs(inl, c, id);
        }
    }
}

fn fun_inline(inl: &mut Inliner, map: &mut SourceMap, mut fun: Term) {
    let (taken, mut output) = match &mut fun.kind {
        TermKind::Fun { terms, output, .. } => (std::mem::take(terms), *output),
        _ => panic!("fun_inline on non-function"),
    };
    let mut label = fun.label.clone();
    let fnid = inl.transfer(map, fun);
    let cp_target = inl.scope.end();
    let cp_source = map.end();

    let mut terms: Vec<Option<Term>> = taken.into_iter().map(Some).collect();
    let mut argcount = 0usize;
    let mut ate = 0usize;
    loop {
        while argcount < terms.len()
            && terms[argcount].as_ref().is_some_and(|t| t.is_arg())
        {
            let t = terms[argcount].take().unwrap();
            term_inline(inl, map, t);
            argcount += 1;
        }
        // Merge a nested single-argument function returned directly: peel
        // its body into ours, turning curried definitions n-ary without
        // changing call semantics.
        if argcount != terms.len().wrapping_sub(1) {
            break;
        }
        if output.checked_sub(ate) != Some(cp_source + argcount) {
            break;
        }
        let candidate = terms[argcount].as_ref().unwrap();
        if !candidate.is_fun() || candidate.get(TermFlags::RECURSIVE) {
            break;
        }
        let child = terms.pop().unwrap().unwrap();
        map.place(INVALID); // the merged child's own slot
        ate += 1;
        match child.kind {
            TermKind::Fun {
                terms: cterms,
                output: coutput,
                ..
            } => {
                for ct in cterms {
                    terms.push(Some(ct));
                }
                output = coutput;
                label = child.label;
            }
            _ => unreachable!(),
        }
    }

    // Size does not count while the body still rewrites (recursive use).
    inl.scope.get_mut(fnid).meta = make_meta(0, argcount as u64);
    for i in argcount..terms.len() {
        let t = terms[i].take().unwrap();
        term_inline(inl, map, t);
    }

    let new_output = map.get(output);
    let frcon = inl.scope.get(new_output).get(TermFlags::FRCON);
    map.unwind(cp_source);
    let body = inl.scope.unwind(cp_target);
    let size = 1 + body.iter().map(|t| meta_size(t.meta)).sum::<u64>();

    let f = inl.scope.get_mut(fnid);
    if let TermKind::Fun { terms, output, .. } = &mut f.kind {
        *terms = body;
        *output = new_output;
    }
    f.label = label;
    f.set(TermFlags::FRCON, frcon);
    f.meta = make_meta(size, argcount as u64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{LiteralPool, LitId};
    use crate::term::{PrimFlags, TermBuilder};
    use crate::usage::pass_usage;

    fn body(t: &Term) -> &Vec<Term> {
        match &t.kind {
            TermKind::Fun { terms, .. } => terms,
            _ => panic!("not a function"),
        }
    }

    fn out_of(t: &Term) -> usize {
        match &t.kind {
            TermKind::Fun { output, .. } => *output,
            _ => panic!("not a function"),
        }
    }

    fn lit(n: usize) -> LitId {
        LitId(n)
    }

    #[test]
    fn small_function_is_inlined() {
        // let f x = add x 1 in f 3
        let mut b = TermBuilder::new();
        b.begin_fun("main"); // 0
        let one = b.lit("one", lit(0)); // 1
        let f = b.begin_fun("f"); // 2
        let x = b.arg("x"); // 3
        let add = b.prim("", "iadd", PrimFlags::empty(), vec![x, one]); // 4
        b.end_fun(add).unwrap();
        let three = b.lit("three", lit(1)); // 3 (parent)
        let call = b.app("call", f, three); // 4
        let mut root = b.finish(call);
        pass_usage(&mut root);

        let inlined = pass_inline(root, 20);
        let terms = body(&inlined);
        // one, f-husk-or-fun, three, add — the App is gone.
        assert!(terms
            .iter()
            .all(|t| !matches!(t.kind, TermKind::App { .. })));
        let adds = terms
            .iter()
            .filter(|t| matches!(&t.kind, TermKind::Prim { name, .. } if name == "iadd"))
            .count();
        assert_eq!(adds, 1);
        // Output is the inlined add.
        let out = out_of(&inlined);
        assert!(matches!(
            &terms[out - 1].kind,
            TermKind::Prim { name, .. } if name == "iadd"
        ));
    }

    #[test]
    fn literals_are_pooled() {
        let mut b = TermBuilder::new();
        b.begin_fun("main"); // 0
        let a = b.lit("", lit(7)); // 1
        let c = b.lit("", lit(7)); // 2 same literal
        let out = b.con("pair", 0, vec![a, c]); // 3
        let mut root = b.finish(out);
        pass_usage(&mut root);

        let inlined = pass_inline(root, 20);
        let terms = body(&inlined);
        let lits = terms
            .iter()
            .filter(|t| matches!(t.kind, TermKind::Lit { .. }))
            .count();
        assert_eq!(lits, 1);
        assert_eq!(terms.last().unwrap().args(), &[1, 1]);
    }

    #[test]
    fn get_of_constructor_projects() {
        let mut b = TermBuilder::new();
        b.begin_fun("main"); // 0
        let x = b.arg("x"); // 1
        let y = b.arg("y"); // 2
        let pair = b.con("pair", 0, vec![x, y]); // 3
        let second = b.get("", 1, pair); // 4
        let out = b.con("box", 1, vec![second]); // 5
        let mut root = b.finish(out);
        pass_usage(&mut root);

        let inlined = pass_inline(root, 20);
        let terms = body(&inlined);
        assert!(!terms.iter().any(|t| matches!(t.kind, TermKind::Get { .. })));
        // box references y directly.
        assert_eq!(terms.last().unwrap().args(), &[2]);
    }

    #[test]
    fn des_of_constructor_applies_handler() {
        let mut b = TermBuilder::new();
        b.begin_fun("main"); // 0
        let x = b.arg("x"); // 1
        let h0 = b.begin_fun("case0"); // 2
        let s0 = b.arg("scrut"); // 3
        let r0 = b.con("left", 0, vec![s0]); // 4
        b.end_fun(r0).unwrap();
        let h1 = b.begin_fun("case1"); // 3 (parent numbering)
        let s1 = b.arg("scrut"); // 4
        let r1 = b.con("right", 1, vec![s1]); // 5
        b.end_fun(r1).unwrap();
        let scrut = b.con("second_case", 1, vec![x]); // 4
        let des = b.des("match", vec![h0, h1, scrut]); // 5
        let mut root = b.finish(des);
        pass_usage(&mut root);

        let inlined = pass_inline(root, 20);
        let terms = body(&inlined);
        assert!(!terms.iter().any(|t| matches!(t.kind, TermKind::Des { .. })));
        // The chosen handler (case1) body was inlined: the last `right`
        // Con's operand is the scrutinee record itself.
        let inlined_body = terms
            .iter()
            .rev()
            .find(|t| matches!(t.kind, TermKind::Con { ctor: 1, .. }))
            .expect("handler body must be inlined");
        let scrut_ref = inlined_body.args()[0];
        assert!(matches!(
            &terms[scrut_ref - 1].kind,
            TermKind::Con { ctor: 1, .. }
        ));
        assert_eq!(terms[scrut_ref - 1].args(), &[1], "scrutinee wraps x");
    }

    #[test]
    fn big_functions_combine_apps_instead() {
        let mut b = TermBuilder::new();
        b.begin_fun("main"); // 0
        let f = b.begin_fun("big"); // 1
        let x = b.arg("x"); // 2
        let y = b.arg("y"); // 3
        let mut acc = b.prim("", "iadd", PrimFlags::empty(), vec![x, y]); // 4
        for _ in 0..30 {
            acc = b.prim("", "iadd", PrimFlags::empty(), vec![acc, y]);
        }
        b.end_fun(acc).unwrap();
        let one = b.lit("", lit(0)); // 2 (parent)
        let two = b.lit("", lit(1)); // 3
        let partial = b.app("", f, one); // 4
        let call = b.app("", partial, two); // 5
        let mut root = b.finish(call);
        pass_usage(&mut root);

        let inlined = pass_inline(root, 8);
        let terms = body(&inlined);
        // The chain collapsed into an n-ary App of the big function; the
        // bypassed partial application is now dead and falls to the next
        // sweep.
        let nary = terms
            .iter()
            .find(|t| matches!(t.kind, TermKind::App { .. }) && t.args().len() == 3)
            .expect("combined application");
        assert!(terms[nary.args()[0] - 1].is_fun());

        let mut again = inlined;
        pass_usage(&mut again);
        let swept = crate::sweep::pass_sweep(again);
        let apps = body(&swept)
            .iter()
            .filter(|t| matches!(t.kind, TermKind::App { .. }))
            .count();
        assert_eq!(apps, 1);
    }

    #[test]
    fn curried_definitions_merge_to_nary() {
        // f = \x -> \y -> add x y ; the inner fun is the outer's output.
        let mut b = TermBuilder::new();
        b.begin_fun("main"); // 0
        let f = b.begin_fun("f"); // 1
        let x = b.arg("x"); // 2
        let g = b.begin_fun("g"); // 3
        let y = b.arg("y"); // 4
        let add = b.prim("", "iadd", PrimFlags::empty(), vec![x, y]); // 5
        b.end_fun(add).unwrap();
        b.end_fun(g).unwrap();
        let out = b.con("box", 0, vec![f]); // 2 (parent)
        let mut root = b.finish(out);
        pass_usage(&mut root);

        let inlined = pass_inline(root, 20);
        let terms = body(&inlined);
        let fun = terms
            .iter()
            .find(|t| t.is_fun())
            .expect("function survives");
        assert_eq!(fun.fun_args(), 2, "curried layers merged");
    }
}
