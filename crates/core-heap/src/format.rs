//! Diagnostic value formatter.

use crate::heap::Heap;
use crate::object::{job, Addr, Tag};
use crate::promise::PromiseState;

const MAX_DEPTH: usize = 8;

/// Render a value for diagnostics and logs. Records print as
/// `Con#k a b`, unfulfilled slots as `_`, depth is capped so cyclic
/// environments cannot hang the formatter.
pub fn format_value(heap: &Heap, addr: Addr) -> String {
    let mut out = String::new();
    format_into(heap, addr, 0, &mut out);
    out
}

fn format_into(heap: &Heap, addr: Addr, depth: usize, out: &mut String) {
    if depth > MAX_DEPTH {
        out.push('…');
        return;
    }
    match heap.tag(addr) {
        Tag::String => {
            out.push('"');
            for c in heap.string_value(addr).chars() {
                match c {
                    '"' => out.push_str("\\\""),
                    '\\' => out.push_str("\\\\"),
                    '\n' => out.push_str("\\n"),
                    '\t' => out.push_str("\\t"),
                    c => out.push(c),
                }
            }
            out.push('"');
        }
        Tag::Integer => out.push_str(&heap.integer_value(addr).to_string()),
        Tag::Double => out.push_str(&format!("{:?}", heap.double_value(addr))),
        Tag::RegExp => {
            out.push('`');
            out.push_str(&heap.string_value(heap.regexp_pattern(addr)));
            out.push('`');
        }
        Tag::Closure => {
            out.push_str(&format!(
                "<fn#{}/{}>",
                heap.closure_fun(addr),
                heap.closure_applied(addr)
            ));
        }
        Tag::Record => {
            let arity = heap.record_arity(addr);
            if depth > 0 && arity > 0 {
                out.push('(');
            }
            out.push_str(&format!("Con#{}", heap.record_ctor(addr)));
            for i in 0..arity {
                out.push(' ');
                match heap.promise_state(addr, heap.record_slot(i)) {
                    PromiseState::Fulfilled(v) => format_into(heap, v, depth + 1, out),
                    PromiseState::Waiting(_) => out.push('_'),
                }
            }
            if depth > 0 && arity > 0 {
                out.push(')');
            }
        }
        Tag::Scope => {
            out.push_str(&format!("<scope/{}>", heap.scope_size(addr)));
        }
        Tag::Job => {
            out.push_str(&format!("Job {}", heap.get(addr, job::DB_ID) as i64));
        }
        Tag::Work | Tag::Forward => out.push_str("<work>"),
    }
}
