//! Literal interning.
//!
//! `Lit` terms do not hold heap addresses directly: a collection would
//! invalidate them. Instead every literal value is registered here, pinned
//! by a heap root, and deduplicated by deep hash — two structurally equal
//! literals intern to the same [`LitId`], which is what lets the inliner's
//! constant pool compare literals by identity.

use std::collections::HashMap;

use core_heap::{Addr, Heap, RootId};

/// Identity of an interned literal. Equal ids mean structurally equal
/// values sharing one heap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LitId(pub usize);

#[derive(Default)]
pub struct LiteralPool {
    roots: Vec<RootId>,
    hashes: Vec<blake3::Hash>,
    by_hash: HashMap<blake3::Hash, LitId>,
}

impl LiteralPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `value`, pinning it against collection. Returns an existing
    /// id when a structurally equal literal is already present.
    pub fn intern(&mut self, heap: &mut Heap, value: Addr) -> LitId {
        let hash = heap.deep_hash(value);
        if let Some(&id) = self.by_hash.get(&hash) {
            return id;
        }
        let id = LitId(self.roots.len());
        self.roots.push(heap.root(value));
        self.hashes.push(hash);
        self.by_hash.insert(hash, id);
        id
    }

    /// Current heap address of an interned literal.
    pub fn addr(&self, heap: &Heap, id: LitId) -> Addr {
        heap.get_root(self.roots[id.0])
    }

    /// Deep hash recorded at intern time.
    pub fn hash(&self, id: LitId) -> blake3::Hash {
        self.hashes[id.0]
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Drop every root, e.g. when the program is released.
    pub fn release(self, heap: &mut Heap) {
        for root in self.roots {
            heap.release_root(root);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigInt;

    #[test]
    fn equal_literals_share_an_id() {
        let mut heap = Heap::new(2.0, 0);
        let mut pool = LiteralPool::new();
        let a = heap.alloc_integer(&BigInt::from(1)).unwrap();
        let b = heap.alloc_integer(&BigInt::from(1)).unwrap();
        let c = heap.alloc_integer(&BigInt::from(2)).unwrap();
        let ia = pool.intern(&mut heap, a);
        let ib = pool.intern(&mut heap, b);
        let ic = pool.intern(&mut heap, c);
        assert_eq!(ia, ib);
        assert_ne!(ia, ic);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn interned_literals_survive_collection() {
        let mut heap = Heap::new(2.0, 0);
        let mut pool = LiteralPool::new();
        let s = heap.alloc_string("constant").unwrap();
        let id = pool.intern(&mut heap, s);
        heap.gc(0);
        assert_eq!(heap.string_value(pool.addr(&heap, id)), "constant");
    }
}
