//! The semispace heap: bump allocation, the root arena, the Cheney copying
//! collector, the destroyable arena, and heap profiling.

use std::collections::BTreeMap;

use regex::Regex;
use tracing::{debug, info};

use crate::object::{
    header, header_meta, header_tag, pads_from_header, pointer_offsets, Addr, Tag, NIL, NIL_CELL,
};
use crate::space::Space;

/// Control-flow signal: a reservation did not fit and the caller must let
/// the outer loop collect. Not an error; carrying it through `Result` keeps
/// allocation paths honest about which of them can trigger a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcNeeded(pub usize);

/// Handle into the root arena. Releasing is explicit and O(1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootId(usize);

struct DestroyEntry {
    compiled: Regex,
    addr: Addr,
}

#[derive(Default, Clone)]
struct TypeStats {
    objects: u64,
    pads: u64,
}

/// Peak statistics retained across the run when profiling is enabled.
#[derive(Default, Clone)]
pub struct HeapProfile {
    pub peak_live_pads: usize,
    pub peak_alloc_pads: usize,
    pub gc_count: u64,
    peak_by_type: Vec<(&'static str, u64, u64)>,
}

impl HeapProfile {
    /// Emit the retained peak report through tracing.
    pub fn report(&self) {
        info!(
            target: "heap.profile",
            peak_live_bytes = self.peak_live_pads * 8,
            peak_alloc_bytes = self.peak_alloc_pads * 8,
            collections = self.gc_count,
            "heap_peak"
        );
        for &(ty, objects, pads) in &self.peak_by_type {
            info!(
                target: "heap.profile",
                object_type = ty,
                objects,
                bytes = pads * 8,
                "heap_peak_type"
            );
        }
    }
}

pub struct Heap {
    spaces: [Space; 2],
    active: usize,
    free: usize,
    end: usize,
    last_pads: usize,
    factor: f64,
    profile_level: u8,
    profile: HeapProfile,
    roots: Vec<Option<Addr>>,
    roots_free: Vec<usize>,
    destroyables: Vec<Option<DestroyEntry>>,
    destroy_free: Vec<usize>,
}

impl Heap {
    /// `factor` multiplies the live-set estimate when sizing the
    /// destination semispace (clamped to at least 1.0); `profile_level`
    /// 0 disables statistics, 1 retains peaks, 2 additionally reports each
    /// collection.
    pub fn new(factor: f64, profile_level: u8) -> Self {
        let spaces = [Space::new(), Space::new()];
        let end = spaces[0].size;
        Self {
            spaces,
            active: 0,
            free: 0,
            end,
            last_pads: 0,
            factor: factor.max(1.0),
            profile_level,
            profile: HeapProfile::default(),
            roots: Vec::new(),
            roots_free: Vec::new(),
            destroyables: Vec::new(),
            destroy_free: Vec::new(),
        }
    }

    // ---------------------------------------------------------------------
    // Allocation
    // ---------------------------------------------------------------------

    /// Ensure `pads` of contiguous space are available. On failure the
    /// caller must unwind to a point with no unrooted addresses and run
    /// [`Heap::gc`].
    pub fn reserve(&mut self, pads: usize) -> Result<(), GcNeeded> {
        if self.end - self.free < pads {
            Err(GcNeeded(pads))
        } else {
            Ok(())
        }
    }

    /// Consume `pads` previously covered by `reserve`. Infallible.
    pub fn claim(&mut self, pads: usize) -> Addr {
        debug_assert!(self.free + pads <= self.end, "claim without reserve");
        let addr = self.free;
        self.free += pads;
        addr
    }

    pub fn alloc(&mut self, pads: usize) -> Result<Addr, GcNeeded> {
        self.reserve(pads)?;
        Ok(self.claim(pads))
    }

    /// Bytes of the active semispace already handed out.
    pub fn used(&self) -> usize {
        self.free * 8
    }

    /// Bytes the active semispace may hand out in total.
    pub fn alloc_limit(&self) -> usize {
        self.end * 8
    }

    /// `alloc_limit() - used()`.
    pub fn avail(&self) -> usize {
        (self.end - self.free) * 8
    }

    /// Backing-store bytes across both semispaces.
    pub fn total_allocated(&self) -> usize {
        (self.spaces[0].alloc() + self.spaces[1].alloc()) * 8
    }

    pub fn profile(&self) -> &HeapProfile {
        &self.profile
    }

    // ---------------------------------------------------------------------
    // Cell access
    // ---------------------------------------------------------------------

    pub(crate) fn get(&self, addr: Addr, off: usize) -> u64 {
        self.spaces[self.active].buf[addr + off]
    }

    pub(crate) fn set(&mut self, addr: Addr, off: usize, v: u64) {
        self.spaces[self.active].buf[addr + off] = v;
    }

    pub(crate) fn get_addr(&self, addr: Addr, off: usize) -> Addr {
        let v = self.get(addr, off);
        if v == NIL_CELL {
            NIL
        } else {
            v as Addr
        }
    }

    pub(crate) fn set_addr(&mut self, addr: Addr, off: usize, target: Addr) {
        let v = if target == NIL {
            NIL_CELL
        } else {
            target as u64
        };
        self.set(addr, off, v);
    }

    // ---------------------------------------------------------------------
    // Roots
    // ---------------------------------------------------------------------

    /// Pin `addr` (which may be [`NIL`]) against collection.
    pub fn root(&mut self, addr: Addr) -> RootId {
        let slot = if let Some(i) = self.roots_free.pop() {
            self.roots[i] = Some(addr);
            i
        } else {
            self.roots.push(Some(addr));
            self.roots.len() - 1
        };
        RootId(slot)
    }

    pub fn get_root(&self, id: RootId) -> Addr {
        self.roots[id.0].expect("released root")
    }

    pub fn set_root(&mut self, id: RootId, addr: Addr) {
        debug_assert!(self.roots[id.0].is_some(), "released root");
        self.roots[id.0] = Some(addr);
    }

    pub fn release_root(&mut self, id: RootId) {
        debug_assert!(self.roots[id.0].is_some(), "double release");
        self.roots[id.0] = None;
        self.roots_free.push(id.0);
    }

    // ---------------------------------------------------------------------
    // Destroyables
    // ---------------------------------------------------------------------

    pub(crate) fn register_destroyable(&mut self, compiled: Regex, addr: Addr) -> usize {
        let entry = DestroyEntry { compiled, addr };
        if let Some(i) = self.destroy_free.pop() {
            self.destroyables[i] = Some(entry);
            i
        } else {
            self.destroyables.push(Some(entry));
            self.destroyables.len() - 1
        }
    }

    pub(crate) fn destroyable(&self, slot: usize) -> &Regex {
        &self.destroyables[slot].as_ref().expect("destroyed regexp").compiled
    }

    /// Live compiled matchers; exposed for tests and the heap report.
    pub fn destroyable_count(&self) -> usize {
        self.destroyables.iter().filter(|e| e.is_some()).count()
    }

    // ---------------------------------------------------------------------
    // Collection
    // ---------------------------------------------------------------------

    /// Copy live objects into the idle semispace. Callers must hold no
    /// addresses outside the root arena.
    pub fn gc(&mut self, requested_pads: usize) {
        let started = std::time::Instant::now();
        self.profile.gc_count += 1;

        let no_gc_overrun = self.free + requested_pads;
        let estimate = (self.factor * self.last_pads as f64) as usize + requested_pads;
        let elems = no_gc_overrun.max(estimate);

        let from = self.active;
        let to = from ^ 1;
        self.spaces[to].resize(elems);
        self.profile.peak_alloc_pads = self
            .profile
            .peak_alloc_pads
            .max(self.spaces[0].alloc() + self.spaces[1].alloc());

        // Move and compact every root, then Cheney-scan the copied prefix.
        let mut free = 0usize;
        for i in 0..self.roots.len() {
            if let Some(addr) = self.roots[i] {
                if addr != NIL {
                    let moved = move_object(&mut self.spaces, from, to, &mut free, addr);
                    self.roots[i] = Some(moved);
                }
            }
        }

        let mut stats: BTreeMap<&'static str, TypeStats> = BTreeMap::new();
        let profiling = self.profile_level > 0;
        let mut scan = 0usize;
        while scan < free {
            let hdr = self.spaces[to].buf[scan];
            let pads = pads_from_header(hdr);
            for off in pointer_offsets(hdr) {
                let cell = self.spaces[to].buf[scan + off];
                if cell != NIL_CELL {
                    let moved =
                        move_object(&mut self.spaces, from, to, &mut free, cell as Addr);
                    self.spaces[to].buf[scan + off] = moved as u64;
                }
            }
            if profiling {
                let s = stats.entry(header_tag(hdr).name()).or_default();
                s.objects += 1;
                s.pads += pads as u64;
            }
            scan += pads;
        }

        // Reconcile the destroyable arena: entries whose old cell forwards
        // were copied, everything else was collected and is dropped here.
        for i in 0..self.destroyables.len() {
            let Some(entry) = &self.destroyables[i] else {
                continue;
            };
            let old_hdr = self.spaces[from].buf[entry.addr];
            if header_tag(old_hdr) == Tag::Forward {
                let new_addr = header_meta(old_hdr) as Addr;
                self.destroyables[i].as_mut().unwrap().addr = new_addr;
            } else {
                self.destroyables[i] = None;
                self.destroy_free.push(i);
            }
        }

        self.active = to;
        self.free = free;
        self.last_pads = free;
        self.end = self.spaces[to].size;
        // Contain growth caused by the pessimistic pre-collection resize.
        let desired = (self.factor * self.last_pads as f64) as usize + requested_pads;
        if desired < elems {
            self.end = desired;
        }

        if profiling {
            let mut ranked: Vec<(&'static str, u64, u64)> = stats
                .iter()
                .map(|(ty, s)| (*ty, s.objects, s.pads))
                .collect();
            ranked.sort_by(|a, b| b.2.cmp(&a.2));

            if self.profile_level > 1 {
                debug!(
                    target: "heap.gc",
                    collection = self.profile.gc_count,
                    live_bytes = self.last_pads * 8,
                    limit_bytes = self.end * 8,
                    requested_bytes = requested_pads * 8,
                    elapsed_us = started.elapsed().as_micros() as u64,
                    "collection"
                );
                for &(ty, objects, pads) in ranked.iter().take(5) {
                    debug!(
                        target: "heap.gc",
                        object_type = ty,
                        objects,
                        bytes = pads * 8,
                        "collection_type"
                    );
                }
            }

            if self.last_pads > self.profile.peak_live_pads {
                ranked.truncate(10);
                self.profile.peak_by_type = ranked;
            }
        }
        self.profile.peak_live_pads = self.profile.peak_live_pads.max(self.last_pads);
    }
}

/// Copy one object into the destination space, leaving a forwarder in the
/// source cell; a no-op returning the prior destination when the object has
/// already moved.
fn move_object(
    spaces: &mut [Space; 2],
    from: usize,
    to: usize,
    free: &mut usize,
    addr: Addr,
) -> Addr {
    let (from_buf, to_buf) = if from < to {
        let (a, b) = spaces.split_at_mut(to);
        (&mut a[from].buf, &mut b[0].buf)
    } else {
        let (a, b) = spaces.split_at_mut(from);
        (&mut b[0].buf, &mut a[to].buf)
    };

    let hdr = from_buf[addr];
    if header_tag(hdr) == Tag::Forward {
        return header_meta(hdr) as Addr;
    }
    let pads = pads_from_header(hdr);
    let dst = *free;
    to_buf[dst..dst + pads].copy_from_slice(&from_buf[addr..addr + pads]);
    *free += pads;
    from_buf[addr] = header(Tag::Forward, dst as u64);
    dst
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::NIL;
    use num_bigint::BigInt;

    #[test]
    fn survives_collection_with_roots() {
        let mut h = Heap::new(2.0, 1);
        let s = h.alloc_string("hello world").unwrap();
        let i = h.alloc_integer(&BigInt::from(42)).unwrap();
        let rs = h.root(s);
        let ri = h.root(i);
        h.gc(0);
        assert_eq!(h.string_value(h.get_root(rs)), "hello world");
        assert_eq!(h.integer_value(h.get_root(ri)), BigInt::from(42));
    }

    #[test]
    fn unrooted_objects_are_collected() {
        let mut h = Heap::new(2.0, 0);
        let _dead = h.alloc_string("this one dies").unwrap();
        let live = h.alloc_double(2.5).unwrap();
        let root = h.root(live);
        h.gc(0);
        // Only the double survives.
        assert_eq!(h.used(), 2 * 8);
        assert_eq!(h.double_value(h.get_root(root)), 2.5);
    }

    #[test]
    fn chains_are_traced_through_records() {
        let mut h = Heap::new(2.0, 0);
        // Build a three-deep chain: r2.0 -> r1.0 -> string
        let s = h.alloc_string("payload").unwrap();
        h.reserve(Heap::reserve_record(1) * 2).unwrap();
        let r1 = h.claim_record(0, 1);
        h.instant_fulfill(r1, h.record_slot(0), s);
        let r2 = h.claim_record(1, 1);
        h.instant_fulfill(r2, h.record_slot(0), r1);
        let root = h.root(r2);
        h.gc(0);
        let r2 = h.get_root(root);
        let r1 = match h.promise_state(r2, h.record_slot(0)) {
            crate::promise::PromiseState::Fulfilled(v) => v,
            _ => panic!("slot must stay fulfilled"),
        };
        let s = match h.promise_state(r1, h.record_slot(0)) {
            crate::promise::PromiseState::Fulfilled(v) => v,
            _ => panic!("slot must stay fulfilled"),
        };
        assert_eq!(h.string_value(s), "payload");
    }

    #[test]
    fn nil_roots_are_skipped() {
        let mut h = Heap::new(2.0, 0);
        let r = h.root(NIL);
        h.gc(0);
        assert_eq!(h.get_root(r), NIL);
        h.release_root(r);
    }

    #[test]
    fn root_slots_are_reused() {
        let mut h = Heap::new(2.0, 0);
        let a = h.root(NIL);
        h.release_root(a);
        let b = h.root(NIL);
        assert_eq!(a, b);
        h.release_root(b);
    }

    #[test]
    fn destroyables_follow_moves_and_deaths() {
        let mut h = Heap::new(2.0, 0);
        let pat = h.alloc_string("a+b").unwrap();
        let re = regex::RegexBuilder::new("a+b")
            .dot_matches_new_line(true)
            .build()
            .unwrap();
        h.reserve(Heap::reserve_regexp()).unwrap();
        let rx = h.claim_regexp(pat, re);
        let root = h.root(rx);
        assert_eq!(h.destroyable_count(), 1);
        h.gc(0);
        let rx = h.get_root(root);
        assert!(h.regexp(rx).is_match("aab"));
        assert_eq!(h.destroyable_count(), 1);
        h.release_root(root);
        h.gc(0);
        assert_eq!(h.destroyable_count(), 0);
    }

    #[test]
    fn reserve_signals_gc_and_recovers() {
        let mut h = Heap::new(1.0, 0);
        // Fill most of the initial space with garbage.
        while h.reserve(64).is_ok() {
            let _ = h.claim(64);
            let top = h.free;
            // Stamp valid headers so a stray scan cannot trip; these are
            // unreachable strings of 63 data pads.
            h.set(top - 64, 0, crate::object::header(Tag::String, 62 * 8));
        }
        let err = h.reserve(64).unwrap_err();
        assert_eq!(err, GcNeeded(64));
        h.gc(64);
        assert!(h.reserve(64).is_ok());
        assert_eq!(h.used(), 0);
    }

    #[test]
    fn heap_shrinks_back_after_spike() {
        let mut h = Heap::new(1.0, 0);
        let keep = h.alloc_string("small").unwrap();
        let root = h.root(keep);
        // Force a large transient reservation, then collect again small.
        h.gc(100_000);
        let spike_limit = h.alloc_limit();
        h.gc(0);
        assert!(h.alloc_limit() < spike_limit);
        assert_eq!(h.string_value(h.get_root(root)), "small");
    }

    #[test]
    fn used_never_exceeds_limit() {
        let mut h = Heap::new(2.0, 0);
        for i in 0..200 {
            match h.alloc_string(&format!("string number {i}")) {
                Ok(_) => {}
                Err(GcNeeded(n)) => h.gc(n),
            }
            assert!(h.used() <= h.alloc_limit());
            assert_eq!(h.avail(), h.alloc_limit() - h.used());
        }
    }
}
