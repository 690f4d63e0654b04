//! Per-worker session table.
//!
//! Grounded in the teacher crate's use of `slab::Slab` to index connections
//! in `Listener`/`MultiListener` (`examples/ryanseipp-rask-old/src/listener.rs`,
//! `src/multilistener.rs`). `slab::Slab::remove` discards slot metadata on
//! free, which loses the generation counter this table needs to survive slot
//! reuse — so the free-list and generation bookkeeping are hand-rolled here,
//! in the same "`Vec` indexed by slot, usize free list" shape `slab` itself
//! uses internally.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::id::{Sid, SEQ_LIMIT};

const VACANT: u32 = u32::MAX;

/// Cross-thread-visible snapshot of which slots are occupied and at which
/// generation, published alongside a [`SessionTable`] it mirrors.
///
/// Lets [`crate::layer::Layer`] resolve a stale `sid` to
/// [`crate::error::Error::NotFound`] synchronously, at the call site,
/// without a per-session lock or a round trip through the worker's task
/// queue — the `sid` encoding already gives every thread the slot index in
/// O(1); this just makes the slot's current generation visible too.
#[derive(Clone)]
pub struct Liveness {
    slots: Arc<[AtomicU32]>,
}

impl Liveness {
    /// Whether `sid` currently names a live slot, as of the last update
    /// this worker published. Like any cross-thread snapshot, this can go
    /// stale the instant after the read — callers already tolerate that,
    /// since the session could equally die between this check and the
    /// enqueued task's eventual execution.
    pub fn contains(&self, sid: Sid) -> bool {
        match self.slots.get(sid.slot() as usize) {
            Some(slot) => slot.load(Ordering::Acquire) == sid.seq(),
            None => false,
        }
    }
}

struct Slot<T> {
    seq: u32,
    value: Option<T>,
}

/// Fixed-capacity `slot -> T` map with generation-checked lookups.
///
/// Capacity is set once at worker start (`nclients / nthreads`, rounded up)
/// and never grows: exceeding it is an [`crate::error::Error::Overflow`]
/// condition, not a reason to reallocate.
pub struct SessionTable<T> {
    worker: u8,
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
    liveness: Liveness,
}

impl<T> SessionTable<T> {
    /// Creates a table for the given worker with the given slot capacity.
    pub fn new(worker: u8, capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        let mut free = Vec::with_capacity(capacity);
        for i in (0..capacity).rev() {
            slots.push(Slot { seq: 0, value: None });
            free.push(i as u32);
        }
        let liveness = Liveness { slots: (0..capacity).map(|_| AtomicU32::new(VACANT)).collect() };
        Self { worker, slots, free, len: 0, liveness }
    }

    /// Returns a cheaply-clonable, cross-thread-visible handle onto this
    /// table's occupancy, for publishing to callers outside the worker.
    pub fn liveness(&self) -> Liveness {
        self.liveness.clone()
    }

    /// Number of live sessions currently held.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the table holds no live sessions.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total slot capacity, fixed at construction.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Inserts a value into a free slot, returning the id it was assigned.
    ///
    /// Returns `None` if the table is at capacity ([`Error::Overflow`] at
    /// the call site).
    pub fn insert(&mut self, value: T) -> Option<Sid> {
        self.insert_with(|_sid| value)
    }

    /// Like [`Self::insert`], but builds the value from the `Sid` it is
    /// about to be assigned — for values (like [`crate::session::Session`])
    /// that need to know their own id. Mirrors the teacher's
    /// `Slab::vacant_entry()` pattern, where the key is known before the
    /// value is constructed.
    pub fn insert_with<F: FnOnce(Sid) -> T>(&mut self, f: F) -> Option<Sid> {
        let slot = self.free.pop()?;
        let entry = &mut self.slots[slot as usize];
        let sid = Sid::encode(self.worker, slot, entry.seq);
        entry.value = Some(f(sid));
        self.len += 1;
        self.liveness.slots[slot as usize].store(sid.seq(), Ordering::Release);
        Some(sid)
    }

    /// Resolves an id to its value, rejecting stale generations.
    pub fn get(&self, sid: Sid) -> Option<&T> {
        let entry = self.slots.get(sid.slot() as usize)?;
        if entry.seq != sid.seq() {
            return None;
        }
        entry.value.as_ref()
    }

    /// Resolves an id to a mutable reference, rejecting stale generations.
    pub fn get_mut(&mut self, sid: Sid) -> Option<&mut T> {
        let entry = self.slots.get_mut(sid.slot() as usize)?;
        if entry.seq != sid.seq() {
            return None;
        }
        entry.value.as_mut()
    }

    /// Removes and returns the value for `sid`, bumping the slot's
    /// generation and returning it to the free list.
    ///
    /// Returns `None` if `sid` does not resolve to a live value (already
    /// removed, or a stale generation).
    pub fn remove(&mut self, sid: Sid) -> Option<T> {
        let slot = sid.slot();
        let entry = self.slots.get_mut(slot as usize)?;
        if entry.seq != sid.seq() || entry.value.is_none() {
            return None;
        }
        let value = entry.value.take();
        entry.seq = (entry.seq + 1) % SEQ_LIMIT;
        self.free.push(slot);
        self.len -= 1;
        self.liveness.slots[slot as usize].store(VACANT, Ordering::Release);
        value
    }

    /// Looks a value up directly by its slot index, bypassing generation
    /// validation — used by the worker's reactor dispatch, where the
    /// `mio::Token` carried on an event *is* the slot index and is always
    /// current (deregistration happens before a slot is ever reused).
    pub fn get_by_slot_mut(&mut self, slot: usize) -> Option<(Sid, &mut T)> {
        let entry = self.slots.get_mut(slot)?;
        let seq = entry.seq;
        let worker = self.worker;
        entry.value.as_mut().map(|v| (Sid::encode(worker, slot as u32, seq), v))
    }

    /// Iterates over all live `(Sid, &T)` pairs, e.g. for `broadcast2`.
    pub fn iter(&self) -> impl Iterator<Item = (Sid, &T)> {
        self.slots.iter().enumerate().filter_map(move |(slot, entry)| {
            entry
                .value
                .as_ref()
                .map(|v| (Sid::encode(self.worker, slot as u32, entry.seq), v))
        })
    }

    /// Iterates over all live `(Sid, &mut T)` pairs.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Sid, &mut T)> {
        let worker = self.worker;
        self.slots.iter_mut().enumerate().filter_map(move |(slot, entry)| {
            let seq = entry.seq;
            entry.value.as_mut().map(move |v| (Sid::encode(worker, slot as u32, seq), v))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove_round_trip() {
        let mut table = SessionTable::new(0, 4);
        let sid = table.insert("a").unwrap();
        assert_eq!(table.get(sid), Some(&"a"));
        assert_eq!(table.remove(sid), Some("a"));
        assert_eq!(table.get(sid), None);
    }

    #[test]
    fn overflow_when_full() {
        let mut table = SessionTable::new(0, 1);
        assert!(table.insert(1).is_some());
        assert!(table.insert(2).is_none());
    }

    #[test]
    fn stale_generation_is_rejected_after_reuse() {
        let mut table = SessionTable::new(0, 1);
        let first = table.insert("first").unwrap();
        table.remove(first).unwrap();
        let second = table.insert("second").unwrap();

        assert_ne!(first, second);
        assert_eq!(table.get(first), None);
        assert_eq!(table.get(second), Some(&"second"));
    }

    #[test]
    fn liveness_tracks_insert_and_remove() {
        let mut table = SessionTable::new(0, 1);
        let liveness = table.liveness();
        assert!(!liveness.contains(Sid::encode(0, 0, 0)));

        let sid = table.insert("a").unwrap();
        assert!(liveness.contains(sid));

        table.remove(sid).unwrap();
        assert!(!liveness.contains(sid));
    }

    #[test]
    fn liveness_rejects_reused_slot_with_stale_seq() {
        let mut table = SessionTable::new(0, 1);
        let first = table.insert("first").unwrap();
        table.remove(first).unwrap();
        let second = table.insert("second").unwrap();
        let liveness = table.liveness();

        assert!(!liveness.contains(first));
        assert!(liveness.contains(second));
    }
}
