//! Shallow and deep value digests.
//!
//! The shallow hash covers one object's immediate contents plus its type
//! discriminator. The deep hash folds fulfilled children in structurally
//! and halts at any unfulfilled promise by hashing that promise's location
//! instead, so deep hashing is always safe but pessimistic on values that
//! are still being computed.

use std::collections::HashMap;

use crate::heap::Heap;
use crate::object::{job, Addr, Tag, NIL};
use crate::promise::PromiseState;

enum Child {
    Value(Addr),
    /// Unfulfilled promise at (holder, slot).
    Broken(Addr, usize),
}

impl Heap {
    /// 256-bit digest of the object's immediate contents.
    pub fn shallow_hash(&self, addr: Addr) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new();
        self.update_shallow(&mut hasher, addr);
        hasher.finalize()
    }

    fn update_shallow(&self, hasher: &mut blake3::Hasher, addr: Addr) {
        let tag = self.tag(addr);
        hasher.update(&[tag as u8]);
        match tag {
            Tag::String => {
                hasher.update(&self.string_bytes(addr));
            }
            Tag::Integer => {
                hasher.update(&self.integer_value(addr).to_signed_bytes_le());
            }
            Tag::Double => {
                hasher.update(&self.double_value(addr).to_bits().to_le_bytes());
            }
            Tag::RegExp => {
                hasher.update(&self.string_bytes(self.regexp_pattern(addr)));
            }
            Tag::Closure => {
                hasher.update(&(self.closure_fun(addr) as u64).to_le_bytes());
                hasher.update(&(self.closure_applied(addr) as u64).to_le_bytes());
            }
            Tag::Record => {
                hasher.update(&(self.record_ctor(addr) as u64).to_le_bytes());
                hasher.update(&(self.record_arity(addr) as u64).to_le_bytes());
            }
            Tag::Scope => {
                hasher.update(&(self.scope_size(addr) as u64).to_le_bytes());
            }
            Tag::Job => {
                hasher.update(&self.get(addr, job::DB_ID).to_le_bytes());
                for off in [job::DIR, job::STDIN_FILE, job::CMDLINE, job::LABEL] {
                    let s = self.get_addr(addr, off);
                    if s != NIL {
                        hasher.update(&self.string_bytes(s));
                    }
                    hasher.update(&[0]);
                }
            }
            Tag::Work | Tag::Forward => panic!("hash of non-value {tag:?}"),
        }
    }

    /// Fulfilled children of a value, promise slots reported distinctly.
    fn hash_children(&self, addr: Addr) -> Vec<Child> {
        let mut out = Vec::new();
        let mut slot = |holder: Addr, off: usize, out: &mut Vec<Child>| {
            match self.promise_state(holder, off) {
                PromiseState::Fulfilled(v) => out.push(Child::Value(v)),
                PromiseState::Waiting(_) => out.push(Child::Broken(holder, off)),
            }
        };
        match self.tag(addr) {
            Tag::String | Tag::Integer | Tag::Double | Tag::RegExp | Tag::Job => {}
            Tag::Closure => {
                let scope = self.closure_scope(addr);
                if scope != NIL {
                    out.push(Child::Value(scope));
                }
            }
            Tag::Record => {
                for i in 0..self.record_arity(addr) {
                    slot(addr, self.record_slot(i), &mut out);
                }
            }
            Tag::Scope => {
                for i in 0..self.scope_size(addr) {
                    slot(addr, self.scope_slot(i), &mut out);
                }
                let parent = self.scope_parent(addr);
                if parent != NIL {
                    out.push(Child::Value(parent));
                }
            }
            Tag::Work | Tag::Forward => panic!("hash of non-value"),
        }
        out
    }

    /// Structural 256-bit digest; memoized, cycle-tolerant.
    pub fn deep_hash(&self, addr: Addr) -> blake3::Hash {
        enum Frame {
            Enter(Addr),
            Exit(Addr),
        }
        let mut memo: HashMap<Addr, blake3::Hash> = HashMap::new();
        let mut entered: std::collections::HashSet<Addr> = std::collections::HashSet::new();
        let mut stack = vec![Frame::Enter(addr)];

        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Enter(a) => {
                    if memo.contains_key(&a) || !entered.insert(a) {
                        continue;
                    }
                    stack.push(Frame::Exit(a));
                    for child in self.hash_children(a) {
                        if let Child::Value(c) = child {
                            stack.push(Frame::Enter(c));
                        }
                    }
                }
                Frame::Exit(a) => {
                    let mut hasher = blake3::Hasher::new();
                    self.update_shallow(&mut hasher, a);
                    for child in self.hash_children(a) {
                        match child {
                            Child::Value(c) => match memo.get(&c) {
                                Some(h) => {
                                    hasher.update(h.as_bytes());
                                }
                                // Cycle through an in-progress node: fold in
                                // its identity instead of recursing.
                                None => {
                                    hasher.update(b"cycle");
                                    hasher.update(&(c as u64).to_le_bytes());
                                }
                            },
                            Child::Broken(holder, slot) => {
                                hasher.update(b"promise");
                                hasher.update(&((holder + slot) as u64).to_le_bytes());
                            }
                        }
                    }
                    memo.insert(a, hasher.finalize());
                }
            }
        }
        memo[&addr]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigInt;

    #[test]
    fn shallow_hash_discriminates_types() {
        let mut h = Heap::new(2.0, 0);
        let s = h.alloc_string("1").unwrap();
        let i = h.alloc_integer(&BigInt::from(1)).unwrap();
        assert_ne!(h.shallow_hash(s), h.shallow_hash(i));
    }

    #[test]
    fn deep_hash_equal_for_equal_structures() {
        let mut h = Heap::new(2.0, 0);
        let mk = |h: &mut Heap| {
            let v = h.alloc_string("field").unwrap();
            h.reserve(Heap::reserve_record(2)).unwrap();
            let r = h.claim_record(3, 2);
            h.instant_fulfill(r, h.record_slot(0), v);
            h.instant_fulfill(r, h.record_slot(1), v);
            r
        };
        let a = mk(&mut h);
        let b = mk(&mut h);
        assert_eq!(h.deep_hash(a), h.deep_hash(b));
    }

    #[test]
    fn deep_hash_distinguishes_contents() {
        let mut h = Heap::new(2.0, 0);
        let x = h.alloc_string("x").unwrap();
        let y = h.alloc_string("y").unwrap();
        h.reserve(Heap::reserve_record(1) * 2).unwrap();
        let rx = h.claim_record(0, 1);
        h.instant_fulfill(rx, h.record_slot(0), x);
        let ry = h.claim_record(0, 1);
        h.instant_fulfill(ry, h.record_slot(0), y);
        assert_ne!(h.deep_hash(rx), h.deep_hash(ry));
    }

    #[test]
    fn deep_hash_halts_at_unfulfilled_promises() {
        let mut h = Heap::new(2.0, 0);
        h.reserve(Heap::reserve_record(1)).unwrap();
        let r = h.claim_record(0, 1);
        // Must not hang or panic on the empty slot.
        let first = h.deep_hash(r);
        assert_eq!(first, h.deep_hash(r));
    }

    #[test]
    fn deep_hash_stable_across_gc() {
        let mut h = Heap::new(2.0, 0);
        let v = h.alloc_string("stable").unwrap();
        h.reserve(Heap::reserve_record(1)).unwrap();
        let r = h.claim_record(1, 1);
        h.instant_fulfill(r, h.record_slot(0), v);
        let before = h.deep_hash(r);
        let root = h.root(r);
        h.gc(0);
        let after = h.deep_hash(h.get_root(root));
        assert_eq!(before, after);
    }
}
