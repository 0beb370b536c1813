//! Finalization queue.
//!
//! Objects of a finalizable type are registered at allocation. When a
//! collection finds a registered object dead, the object is resurrected
//! (it and everything it reaches survive the cycle), moved to the ready
//! list, and never registered again; once the embedder has drained it and
//! run its finalizer, the object is ordinary garbage for the next cycle.

use parking_lot::Mutex;

use crate::object::ObjRef;

#[derive(Default)]
pub struct FinalizeQueue {
    /// Finalizable objects that have not died yet.
    registered: Mutex<Vec<usize>>,
    /// Dead, resurrected objects awaiting their finalizer.
    ready: Mutex<Vec<usize>>,
}

impl FinalizeQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, obj: ObjRef) {
        self.registered.lock().push(obj.addr());
    }

    /// Number of registered, not-yet-finalized objects.
    #[must_use]
    pub fn registered_count(&self) -> usize {
        self.registered.lock().len()
    }

    /// Number of objects awaiting finalization.
    #[must_use]
    pub fn ready_count(&self) -> usize {
        self.ready.lock().len()
    }

    /// Takes every object whose finalizer is due. The embedder runs the
    /// finalizers; the references are strong until the next collection.
    #[must_use]
    pub fn drain_ready(&self) -> Vec<ObjRef> {
        self.ready
            .lock()
            .drain(..)
            .filter_map(ObjRef::from_addr)
            .collect()
    }

    /// Reports every undrained ready entry as a strong root. A resurrected
    /// object stays reachable from here across any number of collections
    /// until the embedder drains it.
    pub(crate) fn report_ready(&self, mut report: impl FnMut(ObjRef)) {
        for &addr in self.ready.lock().iter() {
            if let Some(obj) = ObjRef::from_addr(addr) {
                report(obj);
            }
        }
    }

    /// Moves registered objects that `is_dead` reports dead to the ready
    /// list and calls `resurrect` on each so the marker keeps them alive.
    /// Runs while the world is stopped, after the mark phase.
    pub(crate) fn promote_dead(
        &self,
        mut is_dead: impl FnMut(ObjRef) -> bool,
        mut resurrect: impl FnMut(ObjRef),
    ) {
        let mut registered = self.registered.lock();
        let mut ready = self.ready.lock();
        registered.retain(|&addr| {
            let Some(obj) = ObjRef::from_addr(addr) else {
                return false;
            };
            if is_dead(obj) {
                resurrect(obj);
                ready.push(addr);
                false
            } else {
                true
            }
        });
    }

    /// Rewrites queued addresses after compaction moved objects.
    pub(crate) fn relocate(&self, mut forward: impl FnMut(ObjRef) -> ObjRef) {
        for addr in self.registered.lock().iter_mut() {
            if let Some(obj) = ObjRef::from_addr(*addr) {
                *addr = forward(obj).addr();
            }
        }
        for addr in self.ready.lock().iter_mut() {
            if let Some(obj) = ObjRef::from_addr(*addr) {
                *addr = forward(obj).addr();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_ref(addr: usize) -> ObjRef {
        ObjRef::from_addr(addr).unwrap()
    }

    #[test]
    fn dead_objects_move_to_ready_once() {
        let queue = FinalizeQueue::new();
        queue.register(fake_ref(0x1000));
        queue.register(fake_ref(0x2000));

        let mut resurrected = Vec::new();
        queue.promote_dead(|obj| obj.addr() == 0x1000, |obj| resurrected.push(obj.addr()));
        assert_eq!(resurrected, vec![0x1000]);
        assert_eq!(queue.registered_count(), 1);
        assert_eq!(queue.ready_count(), 1);

        let ready = queue.drain_ready();
        assert_eq!(ready, vec![fake_ref(0x1000)]);
        assert_eq!(queue.ready_count(), 0);

        // A finalized object does not come back even when it dies again.
        queue.promote_dead(|_| true, |_| {});
        assert_eq!(queue.ready_count(), 1);
        assert_eq!(queue.drain_ready(), vec![fake_ref(0x2000)]);
    }

    #[test]
    fn relocate_rewrites_both_lists() {
        let queue = FinalizeQueue::new();
        queue.register(fake_ref(0x1000));
        queue.register(fake_ref(0x2000));
        queue.promote_dead(|obj| obj.addr() == 0x2000, |_| {});

        queue.relocate(|obj| fake_ref(obj.addr() + 0x10));
        assert_eq!(queue.drain_ready(), vec![fake_ref(0x2010)]);
        queue.promote_dead(|_| true, |_| {});
        assert_eq!(queue.drain_ready(), vec![fake_ref(0x1010)]);
    }
}
