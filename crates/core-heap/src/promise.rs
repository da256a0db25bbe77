//! Single-assignment promise slots and the evaluator's LIFO work stack.
//!
//! A promise is one pad inside a record, scope, or job. It holds [`NIL`]
//! (empty, no waiters), a Work-tagged address (empty, chain of waiting
//! continuations), or a value address (fulfilled). The discriminator is the
//! category of the pointed-to object, so no extra state pad is needed.
//!
//! The work stack is a chain through the `next` field of Work objects whose
//! head the evaluator keeps in a root. Scheduling pushes; fulfilling a
//! promise splices its whole waiter chain onto the stack head-first, so
//! waiters run in reverse enqueue order.

use crate::heap::Heap;
use crate::object::{work, Addr, Tag, NIL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    /// Fulfilled with this value.
    Fulfilled(Addr),
    /// Empty; the address is the waiter-chain head (or [`NIL`]).
    Waiting(Addr),
}

impl Heap {
    pub fn promise_state(&self, holder: Addr, slot: usize) -> PromiseState {
        let cell = self.get_addr(holder, slot);
        if cell == NIL {
            PromiseState::Waiting(NIL)
        } else if self.tag(cell) == Tag::Work {
            PromiseState::Waiting(cell)
        } else {
            PromiseState::Fulfilled(cell)
        }
    }

    /// Push one work item onto the stack. The item must not already be
    /// queued anywhere.
    pub fn schedule(&mut self, stack: &mut Addr, item: Addr) {
        debug_assert_eq!(self.work_next(item), NIL, "work item already queued");
        self.set_work_next(item, *stack);
        *stack = item;
    }

    /// Hand `value` to `cont` and schedule it.
    pub fn resume(&mut self, stack: &mut Addr, cont: Addr, value: Addr) {
        self.set_work_value(cont, value);
        self.schedule(stack, cont);
    }

    /// Observe a promise: run `cont` now if the value is there, otherwise
    /// prepend it to the waiter chain.
    pub fn await_slot(&mut self, holder: Addr, slot: usize, cont: Addr, stack: &mut Addr) {
        match self.promise_state(holder, slot) {
            PromiseState::Fulfilled(value) => self.resume(stack, cont, value),
            PromiseState::Waiting(chain) => {
                self.set_work_next(cont, chain);
                self.set_addr(holder, slot, cont);
            }
        }
    }

    /// Transition a promise empty → fulfilled, waking every waiter. Calling
    /// this on a fulfilled promise is a programmer error and panics.
    pub fn fulfill(&mut self, holder: Addr, slot: usize, value: Addr, stack: &mut Addr) {
        debug_assert!(self.tag(value).is_value(), "fulfill with non-value");
        match self.promise_state(holder, slot) {
            PromiseState::Fulfilled(_) => panic!("promise fulfilled twice"),
            PromiseState::Waiting(chain) => {
                if chain != NIL {
                    self.splice_chain(chain, value, stack);
                }
                self.set_addr(holder, slot, value);
            }
        }
    }

    /// Store a value into a promise of an object that cannot have waiters
    /// yet (it was just constructed).
    pub fn instant_fulfill(&mut self, holder: Addr, slot: usize, value: Addr) {
        debug_assert!(self.tag(value).is_value(), "fulfill with non-value");
        debug_assert_eq!(self.get_addr(holder, slot), NIL, "instant_fulfill on used slot");
        self.set_addr(holder, slot, value);
    }

    /// Populate a fresh promise (in a just-constructed holder) from an
    /// existing one: copy the value if available, otherwise enqueue a
    /// fulfiller continuation on the source.
    pub fn claim_instant_fulfiller(
        &mut self,
        holder: Addr,
        slot: usize,
        src_holder: Addr,
        src_slot: usize,
        stack: &mut Addr,
    ) {
        match self.promise_state(src_holder, src_slot) {
            PromiseState::Fulfilled(value) => self.instant_fulfill(holder, slot, value),
            PromiseState::Waiting(_) => {
                let cont = self.claim_fulfiller(holder, slot);
                self.await_slot(src_holder, src_slot, cont, stack);
            }
        }
    }

    /// Walk a waiter chain assigning `value` to each continuation, then
    /// splice the whole chain onto the stack in chain order (head ends up
    /// on top).
    pub fn splice_chain(&mut self, chain: Addr, value: Addr, stack: &mut Addr) {
        let mut cur = chain;
        loop {
            self.set_work_value(cur, value);
            let next = self.work_next(cur);
            if next == NIL {
                self.set_work_next(cur, *stack);
                break;
            }
            cur = next;
        }
        *stack = chain;
    }

    /// Wake a plain continuation chain (job wait queues) with `value`.
    /// The chain head cell should be cleared by the caller.
    pub fn wake_chain(&mut self, chain: Addr, value: Addr, stack: &mut Addr) {
        if chain != NIL {
            self.splice_chain(chain, value, stack);
        }
    }

    /// Pop the next work item off the stack, if any.
    pub fn pop_work(&mut self, stack: &mut Addr) -> Option<Addr> {
        if *stack == NIL {
            return None;
        }
        let item = *stack;
        *stack = self.work_next(item);
        self.set_work_next(item, NIL);
        Some(item)
    }
}

/// Work kind of the generic fulfiller continuation: when resumed, store the
/// received value into `(payload0, payload1)` = (holder, slot). The
/// evaluator owns all other kinds.
pub const WORK_FULFILL: u8 = 0;

impl Heap {
    /// Claim a fulfiller continuation for `holder.slot`. Requires a prior
    /// reservation of [`Heap::reserve_work`] pads.
    pub fn claim_fulfiller(&mut self, holder: Addr, slot: usize) -> Addr {
        self.claim_work(WORK_FULFILL, 0b0001, [holder as u64, slot as u64, 0, 0])
    }

    /// Execute a fulfiller continuation. Panics on other kinds; the
    /// evaluator dispatches those before falling back here.
    pub fn execute_fulfiller(&mut self, item: Addr, stack: &mut Addr) {
        debug_assert_eq!(self.work_kind(item), WORK_FULFILL);
        let holder = self.work_payload(item, 0) as Addr;
        let slot = self.work_payload(item, 1) as usize;
        let value = self.work_value(item);
        self.fulfill(holder, slot, value, stack);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    fn record_with_slot(h: &mut Heap) -> Addr {
        h.reserve(Heap::reserve_record(1)).unwrap();
        h.claim_record(0, 1)
    }

    #[test]
    fn fulfill_then_await_runs_immediately() {
        let mut h = Heap::new(2.0, 0);
        let mut stack = NIL;
        let r = record_with_slot(&mut h);
        let v = h.alloc_double(3.5).unwrap();
        let slot = h.record_slot(0);
        h.fulfill(r, slot, v, &mut stack);
        assert_eq!(stack, NIL);

        h.reserve(Heap::reserve_work() + Heap::reserve_record(1)).unwrap();
        let sink = h.claim_record(0, 1);
        let cont = h.claim_fulfiller(sink, h.record_slot(0));
        h.await_slot(r, slot, cont, &mut stack);
        // Await on a fulfilled promise schedules at once.
        let item = h.pop_work(&mut stack).unwrap();
        assert_eq!(item, cont);
        h.execute_fulfiller(item, &mut stack);
        assert_eq!(
            h.promise_state(sink, h.record_slot(0)),
            PromiseState::Fulfilled(v)
        );
    }

    #[test]
    fn waiters_run_in_reverse_enqueue_order() {
        let mut h = Heap::new(2.0, 0);
        let mut stack = NIL;
        let r = record_with_slot(&mut h);
        let slot = h.record_slot(0);

        // 100 awaiters, each a fulfiller into its own sink record.
        let mut sinks = Vec::new();
        for _ in 0..100 {
            h.reserve(Heap::reserve_work() + Heap::reserve_record(1)).unwrap();
            let sink = h.claim_record(0, 1);
            let cont = h.claim_fulfiller(sink, h.record_slot(0));
            h.await_slot(r, slot, cont, &mut stack);
            sinks.push(sink);
        }
        assert_eq!(stack, NIL, "nothing runs before the fulfill");

        let v = h.alloc_double(1.0).unwrap();
        h.fulfill(r, slot, v, &mut stack);

        // Exactly 100 continuations, most recently enqueued first.
        let mut order = Vec::new();
        while let Some(item) = h.pop_work(&mut stack) {
            let sink = h.work_payload(item, 0) as Addr;
            h.execute_fulfiller(item, &mut stack);
            order.push(sink);
        }
        assert_eq!(order.len(), 100);
        let mut expect = sinks.clone();
        expect.reverse();
        assert_eq!(order, expect);
        for sink in sinks {
            assert_eq!(
                h.promise_state(sink, h.record_slot(0)),
                PromiseState::Fulfilled(v)
            );
        }
    }

    #[test]
    #[should_panic(expected = "promise fulfilled twice")]
    fn double_fulfill_panics() {
        let mut h = Heap::new(2.0, 0);
        let mut stack = NIL;
        let r = record_with_slot(&mut h);
        let v = h.alloc_double(0.0).unwrap();
        let slot = h.record_slot(0);
        h.fulfill(r, slot, v, &mut stack);
        h.fulfill(r, slot, v, &mut stack);
    }

    #[test]
    fn instant_fulfiller_copies_or_chains() {
        let mut h = Heap::new(2.0, 0);
        let mut stack = NIL;
        let src = record_with_slot(&mut h);
        let done = h.alloc_string("ready").unwrap();
        h.fulfill(src, h.record_slot(0), done, &mut stack);

        // Fulfilled source: straight copy.
        h.reserve(Heap::reserve_record(2) + Heap::reserve_work()).unwrap();
        let dst = h.claim_record(0, 2);
        h.claim_instant_fulfiller(dst, h.record_slot(0), src, h.record_slot(0), &mut stack);
        assert_eq!(
            h.promise_state(dst, h.record_slot(0)),
            PromiseState::Fulfilled(done)
        );

        // Empty source: a fulfiller is parked on it.
        let empty = record_with_slot(&mut h);
        h.reserve(Heap::reserve_work()).unwrap();
        h.claim_instant_fulfiller(dst, h.record_slot(1), empty, h.record_slot(0), &mut stack);
        assert!(matches!(
            h.promise_state(dst, h.record_slot(1)),
            PromiseState::Waiting(_)
        ));
        let v = h.alloc_double(9.0).unwrap();
        h.fulfill(empty, h.record_slot(0), v, &mut stack);
        let item = h.pop_work(&mut stack).unwrap();
        h.execute_fulfiller(item, &mut stack);
        assert_eq!(
            h.promise_state(dst, h.record_slot(1)),
            PromiseState::Fulfilled(v)
        );
    }
}
