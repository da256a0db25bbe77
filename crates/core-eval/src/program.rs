//! Linking: flatten a scoped term tree into a table of functions whose
//! operations carry resolved primitive ids and precomputed reservation
//! budgets, so the evaluator can reserve a whole body's heap demand in one
//! step and claim infallibly afterwards.

use core_heap::Heap;
use core_ssa::{arg_depth, arg_offset, LitId, Term, TermKind};
use thiserror::Error;

use crate::prim::{PrimDef, PrimRegistry};

pub type FunId = usize;
pub type PrimId = usize;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("unknown primitive '{0}'")]
    UnknownPrim(String),
    #[error("program root is not a function")]
    RootNotFunction,
}

/// One linked body operation; operands are packed `(depth, offset)` refs.
#[derive(Debug, Clone)]
pub enum Op {
    Arg,
    Lit { value: LitId },
    App { args: Vec<usize> },
    Prim { prim: PrimId, args: Vec<usize> },
    Get { index: usize, obj: usize },
    Des { args: Vec<usize> },
    Con { ctor: usize, args: Vec<usize> },
    Fun { fun: FunId },
}

impl Op {
    fn tail_call_ok(&self) -> bool {
        matches!(self, Op::App { .. } | Op::Des { .. })
    }
}

#[derive(Debug, Clone)]
pub struct FunDef {
    pub label: String,
    pub args: usize,
    pub output: usize, // packed (depth, offset)
    pub ops: Vec<Op>,
    /// Pads to reserve before materializing a scope and walking the body.
    pub apply_reserve: usize,
    /// True when the output is the final body term and may reuse the
    /// caller's continuation.
    pub tail_output: bool,
}

pub struct Program {
    pub funs: Vec<FunDef>,
    pub prims: Vec<PrimDef>,
    pub root: FunId,
}

impl Program {
    /// Flatten `root` (already scope-numbered) against a primitive
    /// registry.
    pub fn link(root: &Term, registry: &PrimRegistry) -> Result<Program, LinkError> {
        if !root.is_fun() {
            return Err(LinkError::RootNotFunction);
        }
        let mut program = Program {
            funs: Vec::new(),
            prims: Vec::new(),
            root: 0,
        };
        let mut prim_ids = std::collections::HashMap::new();
        link_fun(root, registry, &mut program, &mut prim_ids)?;
        Ok(program)
    }

    pub fn fun(&self, id: FunId) -> &FunDef {
        &self.funs[id]
    }
}

fn op_reserve(op: &Op) -> usize {
    match op {
        Op::Arg | Op::Lit { .. } => 0,
        Op::Fun { .. } => Heap::reserve_closure(),
        Op::Con { args, .. } => {
            Heap::reserve_record(args.len()) + args.len() * Heap::reserve_work()
        }
        Op::App { .. } | Op::Des { .. } | Op::Get { .. } | Op::Prim { .. } => {
            Heap::reserve_work()
        }
    }
}

fn link_fun(
    fun: &Term,
    registry: &PrimRegistry,
    program: &mut Program,
    prim_ids: &mut std::collections::HashMap<String, PrimId>,
) -> Result<FunId, LinkError> {
    let TermKind::Fun { output, terms, .. } = &fun.kind else {
        return Err(LinkError::RootNotFunction);
    };
    // Reserve our slot first so nested functions number after us.
    let id = program.funs.len();
    program.funs.push(FunDef {
        label: fun.label.clone(),
        args: fun.fun_args(),
        output: *output,
        ops: Vec::new(),
        apply_reserve: 0,
        tail_output: false,
    });

    let mut ops = Vec::with_capacity(terms.len());
    for t in terms {
        let op = match &t.kind {
            TermKind::Arg => Op::Arg,
            TermKind::Lit { value } => Op::Lit { value: *value },
            TermKind::App { args } => Op::App { args: args.clone() },
            TermKind::Prim { name, args, .. } => {
                let prim = match prim_ids.get(name) {
                    Some(&p) => p,
                    None => {
                        let def = registry
                            .lookup(name)
                            .ok_or_else(|| LinkError::UnknownPrim(name.clone()))?;
                        let p = program.prims.len();
                        program.prims.push(def);
                        prim_ids.insert(name.clone(), p);
                        p
                    }
                };
                Op::Prim {
                    prim,
                    args: args.clone(),
                }
            }
            TermKind::Get { index, args } => Op::Get {
                index: *index,
                obj: args[0],
            },
            TermKind::Des { args } => Op::Des { args: args.clone() },
            TermKind::Con { ctor, args } => Op::Con {
                ctor: *ctor,
                args: args.clone(),
            },
            TermKind::Fun { .. } => Op::Fun {
                fun: link_fun(t, registry, program, prim_ids)?,
            },
        };
        ops.push(op);
    }

    let nargs = program.funs[id].args;
    let body: usize = ops.iter().map(op_reserve).sum();
    let apply_reserve = Heap::reserve_scope(ops.len())
        + nargs * Heap::reserve_work()
        + body
        + Heap::reserve_work(); // output fulfiller
    let tail_output = {
        let od = arg_depth(*output);
        let oo = arg_offset(*output);
        od == 0 && oo + 1 == ops.len() && ops[oo].tail_call_ok()
    };

    let f = &mut program.funs[id];
    f.ops = ops;
    f.apply_reserve = apply_reserve;
    f.tail_output = tail_output;
    Ok(id)
}
