//! SSA terms and the flat "global index" numbering.
//!
//! A program is a tree of functions; operand references are "spine"
//! indices: a function at index `k` numbers its body `k+1, k+2, ...`, and a
//! nested function occupies exactly one of those indices while its own body
//! restarts numbering at its index plus one. The numbering of a sibling
//! after a nested function therefore overlaps the nested body — which is
//! harmless, because references only ever point backwards, into the same
//! function's earlier body or into an ancestor's terms before the current
//! function began. The scope pass later rewrites each reference into a
//! packed `(depth, offset)` pair ready for interpretation.

use bitflags::bitflags;

use crate::pool::LitId;

bitflags! {
    /// Flags accumulated over many passes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TermFlags: u16 {
        const RECURSIVE = 0x01;
        const ORDERED   = 0x02;
        const EFFECT    = 0x04;
        const USED      = 0x08;
        const SINGLETON = 0x10;
        /// The term is known to evaluate to a constructor.
        const FRCON     = 0x20;
        /// A singleton function whose body was moved out by the inliner.
        const MOVED     = 0x40;
    }
}

bitflags! {
    /// Purity declaration carried by a primitive.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PrimFlags: u8 {
        /// May not be reordered past other ordered terms.
        const ORDERED = 0x01;
        /// Observable side effect; never deleted.
        const EFFECT  = 0x02;
    }
}

/// Distinguished invalid operand index (dead code by construction).
pub const INVALID: usize = usize::MAX;

/// Label the inliner always treats as a singleton (match-guard inlining).
pub const GUARD_LABEL: &str = "_ guard";

// After the scope pass a reference packs (depth, offset) into one word.
pub fn make_arg(depth: usize, offset: usize) -> usize {
    (offset << 16) | depth
}

pub fn arg_depth(arg: usize) -> usize {
    arg & 0xFFFF
}

pub fn arg_offset(arg: usize) -> usize {
    arg >> 16
}

#[derive(Debug, Clone)]
pub enum TermKind {
    /// Function parameter slot.
    Arg,
    /// Immediate value held via an interned heap root.
    Lit { value: LitId },
    /// `args[0]` is the function, the rest are arguments.
    App { args: Vec<usize> },
    /// Named intrinsic with positional arguments.
    Prim {
        name: String,
        pflags: PrimFlags,
        args: Vec<usize>,
    },
    /// Project field `index` out of `args[0]`.
    Get { index: usize, args: Vec<usize> },
    /// `args[..n-1]` are per-case handlers, `args[n-1]` the scrutinee.
    Des { args: Vec<usize> },
    /// Construct record `ctor` from `args`.
    Con { ctor: usize, args: Vec<usize> },
    /// Function body: ordered child terms and the index of its output.
    Fun {
        fragment: String,
        output: usize,
        terms: Vec<Term>,
        escapes: Vec<usize>,
        hash: Option<blake3::Hash>,
    },
}

#[derive(Debug, Clone)]
pub struct Term {
    /// Diagnostic only, not unique.
    pub label: String,
    pub flags: TermFlags,
    /// Scratch word owned by whichever pass is running.
    pub meta: u64,
    pub kind: TermKind,
}

impl Term {
    pub fn new(label: impl Into<String>, kind: TermKind) -> Self {
        Self {
            label: label.into(),
            flags: TermFlags::empty(),
            meta: 0,
            kind,
        }
    }

    pub fn set(&mut self, flag: TermFlags, value: bool) {
        self.flags.set(flag, value);
    }

    pub fn get(&self, flag: TermFlags) -> bool {
        self.flags.contains(flag)
    }

    /// Operand indices, if this kind has any.
    pub fn args(&self) -> &[usize] {
        match &self.kind {
            TermKind::App { args }
            | TermKind::Prim { args, .. }
            | TermKind::Get { args, .. }
            | TermKind::Des { args }
            | TermKind::Con { args, .. } => args,
            _ => &[],
        }
    }

    pub fn args_mut(&mut self) -> &mut [usize] {
        match &mut self.kind {
            TermKind::App { args }
            | TermKind::Prim { args, .. }
            | TermKind::Get { args, .. }
            | TermKind::Des { args }
            | TermKind::Con { args, .. } => args,
            _ => &mut [],
        }
    }

    /// Rewrite operand references through a source map.
    pub fn update(&mut self, map: &crate::stream::SourceMap) {
        for a in self.args_mut() {
            *a = map.get(*a);
        }
        if let TermKind::Fun { output, .. } = &mut self.kind {
            *output = map.get(*output);
        }
    }

    pub fn is_arg(&self) -> bool {
        matches!(self.kind, TermKind::Arg)
    }

    pub fn is_fun(&self) -> bool {
        matches!(self.kind, TermKind::Fun { .. })
    }

    /// Number of leading `Arg` terms of a function body.
    pub fn fun_args(&self) -> usize {
        match &self.kind {
            TermKind::Fun { terms, .. } => {
                terms.iter().take_while(|t| t.is_arg()).count()
            }
            _ => 0,
        }
    }

    /// Whether the evaluator may reuse the caller's continuation when this
    /// is the terminal term of a function.
    pub fn tail_call_ok(&self) -> bool {
        matches!(self.kind, TermKind::App { .. } | TermKind::Des { .. })
    }
}

/// Render a term tree for diagnostics; one term per line, nested bodies
/// indented, matching the numbering used by operand references.
pub fn format_term(term: &Term) -> String {
    let mut out = String::new();
    let mut id = 0usize;
    fmt_term(term, 0, &mut id, &mut out);
    out
}

fn fmt_term(term: &Term, depth: usize, id: &mut usize, out: &mut String) {
    let pad = "  ".repeat(depth);
    let mut flags = String::new();
    for (bit, c) in [
        (TermFlags::RECURSIVE, 'R'),
        (TermFlags::EFFECT, 'E'),
        (TermFlags::ORDERED, 'O'),
        (TermFlags::USED, 'U'),
        (TermFlags::SINGLETON, 'S'),
    ] {
        if term.get(bit) {
            flags.push(c);
        }
    }
    let label = if term.label.is_empty() {
        String::new()
    } else {
        format!(" ({})", term.label)
    };
    match &term.kind {
        TermKind::Arg => {
            out.push_str(&format!("{pad}{id}{label} [{flags}] = <arg>\n"));
        }
        TermKind::Lit { value } => {
            out.push_str(&format!("{pad}{id}{label} [{flags}] = Lit#{}\n", value.0));
        }
        TermKind::App { args } => {
            out.push_str(&format!("{pad}{id}{label} [{flags}] = App{args:?}\n"));
        }
        TermKind::Prim { name, args, .. } => {
            out.push_str(&format!("{pad}{id}{label} [{flags}] = {name}{args:?}\n"));
        }
        TermKind::Get { index, args } => {
            out.push_str(&format!("{pad}{id}{label} [{flags}] = Get:{index}{args:?}\n"));
        }
        TermKind::Des { args } => {
            out.push_str(&format!("{pad}{id}{label} [{flags}] = Des{args:?}\n"));
        }
        TermKind::Con { ctor, args } => {
            out.push_str(&format!("{pad}{id}{label} [{flags}] = Con:{ctor}{args:?}\n"));
        }
        TermKind::Fun { output, terms, .. } => {
            out.push_str(&format!(
                "{pad}{id}{label} [{flags}] = Fun(returns {output}):\n"
            ));
            for t in terms {
                *id += 1;
                fmt_term(t, depth + 1, id, out);
            }
            // Spine numbering: siblings after this function reuse the ids
            // its body consumed.
            *id -= terms.len();
        }
    }
}

/// Builds a term tree with correct global indices.
///
/// Functions open with [`TermBuilder::begin_fun`] (which allocates the
/// function's own index), receive body terms, and close with
/// [`TermBuilder::end_fun`]. Whatever each push returns is the global index
/// later terms use as an operand.
pub struct TermBuilder {
    frames: Vec<Frame>,
}

struct Frame {
    index: usize,
    next: usize,
    label: String,
    fragment: String,
    flags: TermFlags,
    terms: Vec<Term>,
}

impl Default for TermBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TermBuilder {
    pub fn new() -> Self {
        Self { frames: Vec::new() }
    }

    pub fn begin_fun(&mut self, label: impl Into<String>) -> usize {
        let index = match self.frames.last_mut() {
            Some(parent) => {
                let i = parent.next;
                parent.next += 1;
                i
            }
            None => 0,
        };
        self.frames.push(Frame {
            index,
            next: index + 1,
            label: label.into(),
            fragment: String::new(),
            flags: TermFlags::empty(),
            terms: Vec::new(),
        });
        index
    }

    /// Mark the function currently open as self-recursive.
    pub fn recursive(&mut self) {
        self.frames.last_mut().expect("no open function").flags |= TermFlags::RECURSIVE;
    }

    pub fn push(&mut self, term: Term) -> usize {
        let frame = self.frames.last_mut().expect("term outside any function");
        let index = frame.next;
        frame.next += 1;
        frame.terms.push(term);
        index
    }

    pub fn arg(&mut self, label: impl Into<String>) -> usize {
        self.push(Term::new(label, TermKind::Arg))
    }

    pub fn lit(&mut self, label: impl Into<String>, value: LitId) -> usize {
        self.push(Term::new(label, TermKind::Lit { value }))
    }

    pub fn app(&mut self, label: impl Into<String>, f: usize, x: usize) -> usize {
        self.push(Term::new(label, TermKind::App { args: vec![f, x] }))
    }

    pub fn prim(
        &mut self,
        label: impl Into<String>,
        name: impl Into<String>,
        pflags: PrimFlags,
        args: Vec<usize>,
    ) -> usize {
        self.push(Term::new(
            label,
            TermKind::Prim {
                name: name.into(),
                pflags,
                args,
            },
        ))
    }

    pub fn get(&mut self, label: impl Into<String>, index: usize, obj: usize) -> usize {
        self.push(Term::new(
            label,
            TermKind::Get {
                index,
                args: vec![obj],
            },
        ))
    }

    pub fn des(&mut self, label: impl Into<String>, args: Vec<usize>) -> usize {
        self.push(Term::new(label, TermKind::Des { args }))
    }

    pub fn con(&mut self, label: impl Into<String>, ctor: usize, args: Vec<usize>) -> usize {
        self.push(Term::new(label, TermKind::Con { ctor, args }))
    }

    /// Close the innermost function. For the outermost frame this returns
    /// the finished tree; for nested frames the function is appended to its
    /// parent and its global index (from `begin_fun`) stays valid.
    pub fn end_fun(&mut self, output: usize) -> Result<usize, Term> {
        let frame = self.frames.pop().expect("end_fun without begin_fun");
        let mut term = Term::new(
            frame.label,
            TermKind::Fun {
                fragment: frame.fragment,
                output,
                terms: frame.terms,
                escapes: Vec::new(),
                hash: None,
            },
        );
        term.flags = frame.flags;
        match self.frames.last_mut() {
            Some(parent) => {
                parent.terms.push(term);
                Ok(frame.index)
            }
            None => Err(term),
        }
    }

    /// Close the outermost function and take the tree.
    pub fn finish(mut self, output: usize) -> Term {
        match self.end_fun(output) {
            Err(root) => root,
            Ok(_) => panic!("finish with nested functions still open"),
        }
    }
}
