//! Tagged object encoding: header packing, per-type layout, constructors
//! and accessors. Every object starts with a header pad whose low byte is
//! the type tag and whose upper bits carry type-specific metadata. Tag 0 is
//! the forwarder left behind by the collector; its metadata is the new
//! address.

use num_bigint::{BigInt, Sign};
use regex::Regex;

use crate::heap::{GcNeeded, Heap};

/// A heap address: a pad index into the active semispace.
pub type Addr = usize;

/// Absent pointer / empty promise sentinel.
pub const NIL: Addr = usize::MAX;

pub(crate) const NIL_CELL: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    Forward = 0,
    String = 1,
    Integer = 2,
    Double = 3,
    RegExp = 4,
    Closure = 5,
    Record = 6,
    Scope = 7,
    Job = 8,
    Work = 9,
}

impl Tag {
    pub(crate) fn from_u8(v: u8) -> Tag {
        match v {
            0 => Tag::Forward,
            1 => Tag::String,
            2 => Tag::Integer,
            3 => Tag::Double,
            4 => Tag::RegExp,
            5 => Tag::Closure,
            6 => Tag::Record,
            7 => Tag::Scope,
            8 => Tag::Job,
            9 => Tag::Work,
            other => panic!("corrupt heap header tag {other}"),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Tag::Forward => "Forward",
            Tag::String => "String",
            Tag::Integer => "Integer",
            Tag::Double => "Double",
            Tag::RegExp => "RegExp",
            Tag::Closure => "Closure",
            Tag::Record => "Record",
            Tag::Scope => "Scope",
            Tag::Job => "Job",
            Tag::Work => "Work",
        }
    }

    /// Work-tagged objects are the evaluator's suspended continuations;
    /// everything else is a value. Promise slots discriminate on this.
    pub fn is_value(self) -> bool {
        !matches!(self, Tag::Work | Tag::Forward)
    }
}

pub(crate) fn header(tag: Tag, meta: u64) -> u64 {
    debug_assert!(meta <= (u64::MAX >> 8));
    (meta << 8) | tag as u64
}

pub(crate) fn header_tag(hdr: u64) -> Tag {
    Tag::from_u8((hdr & 0xFF) as u8)
}

pub(crate) fn header_meta(hdr: u64) -> u64 {
    hdr >> 8
}

// The forwarder must fit in the smallest heap object so a move can always
// overwrite the original header in place.
pub(crate) const FORWARD_PADS: usize = 1;
pub(crate) const MIN_OBJECT_PADS: usize = 2; // Double: header + bits
const _: () = assert!(FORWARD_PADS <= MIN_OBJECT_PADS);

/// Field offsets and stage bits of the `Job` heap object.
pub mod job {
    /// Stage bitmask values, accumulated as the external process advances.
    pub const FORKED: u64 = 1;
    pub const STDOUT: u64 = 2;
    pub const STDERR: u64 = 4;
    pub const MERGED: u64 = 8;
    pub const FINISHED: u64 = 16;

    pub const DB_ID: usize = 1;
    pub const STATE: usize = 2;
    pub const PATHTIME: usize = 3;
    pub const LABEL: usize = 4;
    pub const CMDLINE: usize = 5;
    pub const STDIN_FILE: usize = 6;
    pub const DIR: usize = 7;
    pub const BAD_LAUNCH: usize = 8;
    pub const BAD_FINISH: usize = 9;
    /// Six wait chains, one per observable, contiguous from here.
    pub const Q_STDOUT: usize = 10;
    pub const Q_STDERR: usize = 11;
    pub const Q_REALITY: usize = 12;
    pub const Q_INPUTS: usize = 13;
    pub const Q_OUTPUTS: usize = 14;
    pub const Q_REPORT: usize = 15;

    pub(crate) const PADS: usize = 16;
    pub(crate) const FIRST_PTR: usize = LABEL;
}

/// Field offsets and kind codes of the `Work` heap object. The kinds
/// themselves are interpreted by the evaluator; the heap only needs the
/// pointer mask so the collector can trace payload pads.
pub mod work {
    pub const NEXT: usize = 1;
    pub const VALUE: usize = 2;
    pub const P0: usize = 3;
    pub const P1: usize = 4;
    pub const P2: usize = 5;
    pub const P3: usize = 6;

    pub(crate) const PADS: usize = 7;
    pub(crate) const PAYLOAD: usize = 4;
}

/// Object footprint in pads, derived from the header alone.
pub(crate) fn pads_from_header(hdr: u64) -> usize {
    let meta = header_meta(hdr);
    match header_tag(hdr) {
        Tag::Forward => FORWARD_PADS,
        Tag::String => 2 + (meta as usize) / 8,
        Tag::Integer => 1 + (meta as usize >> 1),
        Tag::Double => 2,
        Tag::RegExp => 3,
        Tag::Closure => 3,
        Tag::Record => 2 + meta as usize,
        Tag::Scope => 3 + meta as usize,
        Tag::Job => job::PADS,
        Tag::Work => work::PADS,
    }
}

/// Offsets (relative to the object) of every pad that holds a heap
/// pointer. Work payload pads are covered by the mask in the header.
pub(crate) fn pointer_offsets(hdr: u64) -> impl Iterator<Item = usize> {
    let meta = header_meta(hdr);
    let (range, mask) = match header_tag(hdr) {
        Tag::Forward => panic!("descend into forwarder"),
        Tag::String | Tag::Integer | Tag::Double => (0..0, 0u64),
        Tag::RegExp => (1..2, 0),
        Tag::Closure => (2..3, 0),
        Tag::Record => (2..2 + meta as usize, 0),
        Tag::Scope => (2..3 + meta as usize, 0),
        Tag::Job => (job::FIRST_PTR..job::PADS, 0),
        Tag::Work => (work::NEXT..work::VALUE + 1, meta >> 8),
    };
    let payload = (0..work::PAYLOAD).filter_map(move |i| {
        if (mask >> i) & 1 != 0 {
            Some(work::P0 + i)
        } else {
            None
        }
    });
    range.chain(payload)
}

fn string_pads(len: usize) -> usize {
    2 + len / 8
}

impl Heap {
    // ---------------------------------------------------------------------
    // Reservation helpers: pad counts for each object shape, so callers can
    // reserve a whole allocation sequence before claiming any of it.
    // ---------------------------------------------------------------------

    pub fn reserve_string(s: &str) -> usize {
        string_pads(s.len())
    }

    pub fn reserve_integer(v: &BigInt) -> usize {
        1 + v.iter_u64_digits().count().max(1)
    }

    pub fn reserve_double() -> usize {
        2
    }

    pub fn reserve_regexp() -> usize {
        3
    }

    pub fn reserve_closure() -> usize {
        3
    }

    pub fn reserve_record(arity: usize) -> usize {
        2 + arity
    }

    pub fn reserve_scope(size: usize) -> usize {
        3 + size
    }

    pub fn reserve_job() -> usize {
        job::PADS
    }

    pub fn reserve_work() -> usize {
        work::PADS
    }

    // ---------------------------------------------------------------------
    // Constructors. `claim_*` require a prior successful `reserve` covering
    // the object; `alloc_*` bundle the reservation and may demand a GC.
    // ---------------------------------------------------------------------

    pub fn claim_string(&mut self, s: &str) -> Addr {
        let bytes = s.as_bytes();
        let pads = string_pads(bytes.len());
        let addr = self.claim(pads);
        self.set(addr, 0, header(Tag::String, bytes.len() as u64));
        // Bytes are packed little-endian; the zero padding keeps at least
        // one NUL after the content.
        for (i, chunk) in bytes.chunks(8).enumerate() {
            let mut pad = [0u8; 8];
            pad[..chunk.len()].copy_from_slice(chunk);
            self.set(addr, 1 + i, u64::from_le_bytes(pad));
        }
        for i in bytes.len().div_ceil(8)..pads - 1 {
            self.set(addr, 1 + i, 0);
        }
        addr
    }

    pub fn alloc_string(&mut self, s: &str) -> Result<Addr, GcNeeded> {
        self.reserve(Self::reserve_string(s))?;
        Ok(self.claim_string(s))
    }

    pub fn claim_integer(&mut self, v: &BigInt) -> Addr {
        let digits: Vec<u64> = v.iter_u64_digits().collect();
        let limbs = digits.len().max(1);
        let neg = (v.sign() == Sign::Minus) as u64;
        let addr = self.claim(1 + limbs);
        self.set(addr, 0, header(Tag::Integer, ((limbs as u64) << 1) | neg));
        for i in 0..limbs {
            self.set(addr, 1 + i, digits.get(i).copied().unwrap_or(0));
        }
        addr
    }

    pub fn alloc_integer(&mut self, v: &BigInt) -> Result<Addr, GcNeeded> {
        self.reserve(Self::reserve_integer(v))?;
        Ok(self.claim_integer(v))
    }

    pub fn claim_double(&mut self, v: f64) -> Addr {
        let addr = self.claim(2);
        self.set(addr, 0, header(Tag::Double, 0));
        self.set(addr, 1, v.to_bits());
        addr
    }

    pub fn alloc_double(&mut self, v: f64) -> Result<Addr, GcNeeded> {
        self.reserve(2)?;
        Ok(self.claim_double(v))
    }

    /// Claim a RegExp cell. The pattern string must already be on the heap;
    /// the compiled matcher enters the destroyable arena and is dropped when
    /// the cell dies.
    pub fn claim_regexp(&mut self, pattern: Addr, compiled: Regex) -> Addr {
        let addr = self.claim(3);
        let slot = self.register_destroyable(compiled, addr);
        self.set(addr, 0, header(Tag::RegExp, 0));
        self.set_addr(addr, 1, pattern);
        self.set(addr, 2, slot as u64);
        addr
    }

    pub fn claim_closure(&mut self, fun: usize, applied: usize, scope: Addr) -> Addr {
        let addr = self.claim(3);
        self.set(addr, 0, header(Tag::Closure, applied as u64));
        self.set(addr, 1, fun as u64);
        self.set_addr(addr, 2, scope);
        addr
    }

    /// Claim a record with all promise slots empty.
    pub fn claim_record(&mut self, ctor: usize, arity: usize) -> Addr {
        let addr = self.claim(2 + arity);
        self.set(addr, 0, header(Tag::Record, arity as u64));
        self.set(addr, 1, ctor as u64);
        for i in 0..arity {
            self.set(addr, 2 + i, NIL_CELL);
        }
        addr
    }

    pub fn claim_scope(&mut self, fun: usize, size: usize, parent: Addr) -> Addr {
        let addr = self.claim(3 + size);
        self.set(addr, 0, header(Tag::Scope, size as u64));
        self.set(addr, 1, fun as u64);
        self.set_addr(addr, 2, parent);
        for i in 0..size {
            self.set(addr, 3 + i, NIL_CELL);
        }
        addr
    }

    pub fn claim_job(
        &mut self,
        db_id: i64,
        label: Addr,
        cmdline: Addr,
        stdin_file: Addr,
        dir: Addr,
    ) -> Addr {
        let addr = self.claim(job::PADS);
        self.set(addr, 0, header(Tag::Job, 0));
        self.set(addr, job::DB_ID, db_id as u64);
        self.set(addr, job::STATE, 0);
        self.set(addr, job::PATHTIME, 0f64.to_bits());
        self.set_addr(addr, job::LABEL, label);
        self.set_addr(addr, job::CMDLINE, cmdline);
        self.set_addr(addr, job::STDIN_FILE, stdin_file);
        self.set_addr(addr, job::DIR, dir);
        for off in job::BAD_LAUNCH..job::PADS {
            self.set(addr, off, NIL_CELL);
        }
        addr
    }

    /// Claim a work item. `ptr_mask` marks which payload pads hold heap
    /// pointers so the collector can trace them.
    pub fn claim_work(&mut self, kind: u8, ptr_mask: u8, payload: [u64; 4]) -> Addr {
        let addr = self.claim(work::PADS);
        let meta = u64::from(kind) | (u64::from(ptr_mask) << 8);
        self.set(addr, 0, header(Tag::Work, meta));
        self.set(addr, work::NEXT, NIL_CELL);
        self.set(addr, work::VALUE, NIL_CELL);
        for (i, v) in payload.into_iter().enumerate() {
            self.set(addr, work::P0 + i, v);
        }
        addr
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    pub fn tag(&self, addr: Addr) -> Tag {
        header_tag(self.get(addr, 0))
    }

    pub fn string_bytes(&self, addr: Addr) -> Vec<u8> {
        debug_assert_eq!(self.tag(addr), Tag::String);
        let len = header_meta(self.get(addr, 0)) as usize;
        let mut out = Vec::with_capacity(len);
        let mut i = 0;
        while out.len() < len {
            let pad = self.get(addr, 1 + i).to_le_bytes();
            let take = (len - out.len()).min(8);
            out.extend_from_slice(&pad[..take]);
            i += 1;
        }
        out
    }

    pub fn string_value(&self, addr: Addr) -> String {
        String::from_utf8_lossy(&self.string_bytes(addr)).into_owned()
    }

    pub fn integer_value(&self, addr: Addr) -> BigInt {
        debug_assert_eq!(self.tag(addr), Tag::Integer);
        let meta = header_meta(self.get(addr, 0));
        let limbs = (meta >> 1) as usize;
        let neg = meta & 1 != 0;
        let digits: Vec<u64> = (0..limbs).map(|i| self.get(addr, 1 + i)).collect();
        let magnitude = BigInt::new(
            Sign::Plus,
            digits
                .iter()
                .flat_map(|d| [(*d & 0xFFFF_FFFF) as u32, (*d >> 32) as u32])
                .collect(),
        );
        if neg {
            -magnitude
        } else {
            magnitude
        }
    }

    pub fn double_value(&self, addr: Addr) -> f64 {
        debug_assert_eq!(self.tag(addr), Tag::Double);
        f64::from_bits(self.get(addr, 1))
    }

    pub fn regexp_pattern(&self, addr: Addr) -> Addr {
        debug_assert_eq!(self.tag(addr), Tag::RegExp);
        self.get_addr(addr, 1)
    }

    pub fn regexp(&self, addr: Addr) -> &Regex {
        debug_assert_eq!(self.tag(addr), Tag::RegExp);
        self.destroyable(self.get(addr, 2) as usize)
    }

    pub fn closure_fun(&self, addr: Addr) -> usize {
        self.get(addr, 1) as usize
    }

    pub fn closure_applied(&self, addr: Addr) -> usize {
        header_meta(self.get(addr, 0)) as usize
    }

    pub fn closure_scope(&self, addr: Addr) -> Addr {
        self.get_addr(addr, 2)
    }

    pub fn record_ctor(&self, addr: Addr) -> usize {
        debug_assert_eq!(self.tag(addr), Tag::Record);
        self.get(addr, 1) as usize
    }

    pub fn record_arity(&self, addr: Addr) -> usize {
        header_meta(self.get(addr, 0)) as usize
    }

    /// Absolute pad offset of record slot `i` (for the promise API).
    pub fn record_slot(&self, i: usize) -> usize {
        2 + i
    }

    pub fn scope_fun(&self, addr: Addr) -> usize {
        self.get(addr, 1) as usize
    }

    pub fn scope_size(&self, addr: Addr) -> usize {
        header_meta(self.get(addr, 0)) as usize
    }

    pub fn scope_parent(&self, addr: Addr) -> Addr {
        self.get_addr(addr, 2)
    }

    /// Absolute pad offset of scope slot `i` (for the promise API).
    pub fn scope_slot(&self, i: usize) -> usize {
        3 + i
    }

    pub fn work_kind(&self, addr: Addr) -> u8 {
        debug_assert_eq!(self.tag(addr), Tag::Work);
        (header_meta(self.get(addr, 0)) & 0xFF) as u8
    }

    pub fn work_next(&self, addr: Addr) -> Addr {
        self.get_addr(addr, work::NEXT)
    }

    pub fn set_work_next(&mut self, addr: Addr, next: Addr) {
        self.set_addr(addr, work::NEXT, next);
    }

    pub fn work_value(&self, addr: Addr) -> Addr {
        self.get_addr(addr, work::VALUE)
    }

    pub fn set_work_value(&mut self, addr: Addr, value: Addr) {
        self.set_addr(addr, work::VALUE, value);
    }

    pub fn work_payload(&self, addr: Addr, i: usize) -> u64 {
        self.get(addr, work::P0 + i)
    }

    /// Overwrite one payload pad. The pointer mask is fixed at claim time,
    /// so a pad may only change within its pointer/non-pointer category.
    pub fn set_work_payload(&mut self, addr: Addr, i: usize, v: u64) {
        self.set(addr, work::P0 + i, v);
    }

    // ---------------------------------------------------------------------
    // Job fields
    // ---------------------------------------------------------------------

    pub fn job_db_id(&self, addr: Addr) -> i64 {
        debug_assert_eq!(self.tag(addr), Tag::Job);
        self.get(addr, job::DB_ID) as i64
    }

    pub fn set_job_db_id(&mut self, addr: Addr, id: i64) {
        self.set(addr, job::DB_ID, id as u64);
    }

    pub fn job_state(&self, addr: Addr) -> u64 {
        self.get(addr, job::STATE)
    }

    pub fn set_job_state(&mut self, addr: Addr, state: u64) {
        self.set(addr, job::STATE, state);
    }

    pub fn job_pathtime(&self, addr: Addr) -> f64 {
        f64::from_bits(self.get(addr, job::PATHTIME))
    }

    pub fn set_job_pathtime(&mut self, addr: Addr, pathtime: f64) {
        self.set(addr, job::PATHTIME, pathtime.to_bits());
    }

    /// Read a pointer-bearing job field (`job::LABEL..=job::Q_REPORT`).
    pub fn job_ptr(&self, addr: Addr, off: usize) -> Addr {
        debug_assert!((job::FIRST_PTR..job::PADS).contains(&off));
        self.get_addr(addr, off)
    }

    pub fn set_job_ptr(&mut self, addr: Addr, off: usize, target: Addr) {
        debug_assert!((job::FIRST_PTR..job::PADS).contains(&off));
        self.set_addr(addr, off, target);
    }

    /// Detach a job wait chain, leaving the field empty.
    pub fn take_job_chain(&mut self, addr: Addr, off: usize) -> Addr {
        let head = self.job_ptr(addr, off);
        self.set_job_ptr(addr, off, NIL);
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_round_trip() {
        let mut h = Heap::new(2.0, 0);
        for s in ["", "a", "exactly8", "longer than eight bytes", "naïve✓"] {
            let addr = h.alloc_string(s).unwrap();
            assert_eq!(h.tag(addr), Tag::String);
            assert_eq!(h.string_value(addr), s);
        }
    }

    #[test]
    fn integer_round_trip() {
        let mut h = Heap::new(2.0, 0);
        for v in [
            BigInt::from(0),
            BigInt::from(-1),
            BigInt::from(u64::MAX) * 3 + 7,
            -(BigInt::from(u64::MAX) * BigInt::from(u64::MAX)),
        ] {
            let addr = h.alloc_integer(&v).unwrap();
            assert_eq!(h.integer_value(addr), v);
        }
    }

    #[test]
    fn double_and_record_layout() {
        let mut h = Heap::new(2.0, 0);
        let d = h.alloc_double(1.5).unwrap();
        assert_eq!(h.double_value(d), 1.5);
        h.reserve(Heap::reserve_record(3)).unwrap();
        let r = h.claim_record(7, 3);
        assert_eq!(h.record_ctor(r), 7);
        assert_eq!(h.record_arity(r), 3);
    }

    #[test]
    fn work_payload_mask() {
        let hdr = header(Tag::Work, 5 | (0b1010 << 8));
        let ptrs: Vec<usize> = pointer_offsets(hdr).collect();
        assert_eq!(ptrs, vec![work::NEXT, work::VALUE, work::P1, work::P3]);
    }
}
