//! Managed object layout and type metadata.
//!
//! Every heap object starts with two header words:
//!
//! ```text
//! word 0:  [ flags : 32 bits ][ type index : 32 bits ]
//! word 1:  object size in bytes (including the header, 8-byte aligned)
//! ```
//!
//! followed by the payload as word-sized slots. Which slots hold object
//! references is described by the [`TypeDescriptor`] registered for the
//! type index, the layout contract supplied by the (external) type-loading
//! collaborator. The size word makes linear segment walks possible; free
//! space between objects is tiled with filler objects of the reserved
//! [`TYPE_FREE`] index carrying the gap length in their size word.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Size of the object header in bytes (two words).
pub const HEADER_BYTES: usize = 16;

/// Object alignment; all object sizes are multiples of this.
pub const OBJECT_ALIGN: usize = 8;

/// Bytes per payload slot.
pub const SLOT_BYTES: usize = 8;

/// Flag bit: object is marked reachable in the current collection cycle.
pub const FLAG_MARK: u32 = 1 << 0;

/// Flag bit: object must not be relocated this cycle.
pub const FLAG_PIN: u32 = 1 << 1;

/// Identifier of a registered managed type; index into the [`TypeRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(pub u32);

/// Reserved type index for free-space filler objects.
pub const TYPE_FREE: TypeId = TypeId(0);

/// A reference to a managed heap object.
///
/// Points at the object's header. Never null; absent references are
/// represented as `Option<ObjRef>` at the API surface and as a zero word
/// in heap slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(NonZeroUsize);

impl ObjRef {
    /// Wraps a raw object address. Returns `None` for the null address.
    #[must_use]
    pub fn from_addr(addr: usize) -> Option<Self> {
        NonZeroUsize::new(addr).map(Self)
    }

    /// The object's address (of its header word).
    #[must_use]
    pub const fn addr(self) -> usize {
        self.0.get()
    }

    fn header_atom(self) -> &'static AtomicU64 {
        // SAFETY: an ObjRef is only constructed for addresses inside a
        // committed heap segment, where the first word is the header word.
        // AtomicU64 has no invalid bit patterns and the word is 8-aligned.
        unsafe { &*(self.addr() as *const AtomicU64) }
    }

    /// Reads the packed header word (flags + type index).
    ///
    /// Acquire pairs with the release store in [`write_header`], so a
    /// walker that observes a fresh header also observes the size word and
    /// zeroed payload written before it.
    #[must_use]
    pub fn header_word(self) -> u64 {
        self.header_atom().load(Ordering::Acquire)
    }

    /// The object's type index.
    #[must_use]
    pub fn type_id(self) -> TypeId {
        #[allow(clippy::cast_possible_truncation)]
        TypeId(self.header_word() as u32)
    }

    /// The object's total size in bytes, including header and any padding
    /// folded into the allocation.
    #[must_use]
    pub fn size(self) -> usize {
        // SAFETY: word 1 of a live object is its size; see module docs.
        unsafe { (*((self.addr() + SLOT_BYTES) as *const AtomicUsize)).load(Ordering::Relaxed) }
    }

    /// Current flag bits.
    #[must_use]
    pub fn flags(self) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        {
            (self.header_word() >> 32) as u32
        }
    }

    /// Atomically sets flag bits. Returns the previous flags.
    pub fn set_flags(self, bits: u32) -> u32 {
        let prev = self.header_atom().fetch_or(u64::from(bits) << 32, Ordering::AcqRel);
        #[allow(clippy::cast_possible_truncation)]
        {
            (prev >> 32) as u32
        }
    }

    /// Atomically clears flag bits.
    pub fn clear_flags(self, bits: u32) {
        self.header_atom().fetch_and(!(u64::from(bits) << 32), Ordering::AcqRel);
    }

    /// Whether the mark flag is set.
    #[must_use]
    pub fn is_marked(self) -> bool {
        self.flags() & FLAG_MARK != 0
    }

    /// Whether the pin flag is set.
    #[must_use]
    pub fn is_pinned(self) -> bool {
        self.flags() & FLAG_PIN != 0
    }

    /// Address of payload slot `slot`.
    #[must_use]
    pub const fn slot_addr(self, slot: usize) -> usize {
        self.addr() + HEADER_BYTES + slot * SLOT_BYTES
    }

    /// Reads payload slot `slot` as a raw word.
    ///
    /// # Safety
    ///
    /// `slot` must be within the object's payload.
    #[must_use]
    pub unsafe fn read_slot(self, slot: usize) -> usize {
        // SAFETY: caller guarantees the slot is in bounds. Atomic because
        // the marker may read slots an exempted mutator is writing.
        unsafe { (*(self.slot_addr(slot) as *const AtomicUsize)).load(Ordering::Relaxed) }
    }

    /// Writes payload slot `slot` as a raw word.
    ///
    /// # Safety
    ///
    /// `slot` must be within the object's payload, and for reference slots
    /// the caller must have executed the write barrier.
    pub unsafe fn write_slot(self, slot: usize, value: usize) {
        // SAFETY: caller guarantees the slot is in bounds.
        unsafe { (*(self.slot_addr(slot) as *const AtomicUsize)).store(value, Ordering::Relaxed) };
    }
}

// SAFETY: ObjRef is an address into the shared managed heap; all header
// mutation goes through atomics and payload access is synchronized by the
// collection protocol.
unsafe impl Send for ObjRef {}
unsafe impl Sync for ObjRef {}

/// Writes a fresh object header at `addr`.
///
/// # Safety
///
/// `addr..addr + size` must be committed, exclusively owned memory.
pub unsafe fn write_header(addr: usize, ty: TypeId, size: usize, flags: u32) {
    debug_assert_eq!(size % OBJECT_ALIGN, 0);
    let word0 = (u64::from(flags) << 32) | u64::from(ty.0);
    // SAFETY: caller guarantees ownership of the range. The size word goes
    // first; the release store of word 0 publishes it (and any payload
    // initialization) to walkers.
    unsafe {
        (*((addr + SLOT_BYTES) as *const AtomicUsize)).store(size, Ordering::Relaxed);
        (*(addr as *const AtomicU64)).store(word0, Ordering::Release);
    }
}

/// Tiles `addr..addr + len` with a free-space filler object so linear
/// segment walks skip over it.
///
/// # Safety
///
/// The range must be committed memory owned by the heap, at least
/// [`HEADER_BYTES`] long, and not overlap any live object.
pub unsafe fn write_free_filler(addr: usize, len: usize) {
    debug_assert!(len >= HEADER_BYTES);
    // SAFETY: per the caller contract.
    unsafe { write_header(addr, TYPE_FREE, len, 0) };
}

/// Layout metadata for a managed type, supplied by the type-loading
/// collaborator.
#[derive(Debug, Clone)]
pub struct TypeDescriptor {
    /// Diagnostic name.
    pub name: String,
    /// Total object size in bytes (header + payload), 8-byte aligned.
    pub size: usize,
    /// Number of payload slots.
    pub slots: usize,
    /// Payload slots that hold object references.
    pub ref_slots: Vec<u16>,
    /// Whether dead instances are routed through the finalization queue.
    pub finalizable: bool,
}

impl TypeDescriptor {
    /// Builds a descriptor for a type with `slots` word-sized payload slots,
    /// of which `ref_slots` hold references.
    ///
    /// # Panics
    ///
    /// Panics if a ref slot index is out of range.
    #[must_use]
    pub fn new(name: impl Into<String>, slots: usize, ref_slots: Vec<u16>, finalizable: bool) -> Self {
        for &r in &ref_slots {
            assert!((r as usize) < slots, "ref slot out of range");
        }
        let size = HEADER_BYTES + slots * SLOT_BYTES;
        Self {
            name: name.into(),
            size,
            slots,
            ref_slots,
            finalizable,
        }
    }
}

/// Process-wide table of registered type descriptors.
///
/// Index 0 is reserved for the free-space filler. An object header whose
/// type index is not present here is fatal heap corruption when observed
/// by the collector.
pub struct TypeRegistry {
    types: RwLock<Vec<Arc<TypeDescriptor>>>,
}

impl TypeRegistry {
    pub(crate) fn new() -> Self {
        let free = Arc::new(TypeDescriptor {
            name: "<free>".to_owned(),
            size: HEADER_BYTES,
            slots: 0,
            ref_slots: Vec::new(),
            finalizable: false,
        });
        Self {
            types: RwLock::new(vec![free]),
        }
    }

    /// Registers a descriptor, returning its type index.
    ///
    /// # Panics
    ///
    /// Panics if more than `u32::MAX` types are registered.
    pub fn register(&self, desc: TypeDescriptor) -> TypeId {
        let mut types = self.types.write();
        let id = u32::try_from(types.len()).expect("type registry full");
        types.push(Arc::new(desc));
        TypeId(id)
    }

    /// Looks up a descriptor. Returns `None` for unknown indices.
    #[must_use]
    pub fn get(&self, id: TypeId) -> Option<Arc<TypeDescriptor>> {
        self.types.read().get(id.0 as usize).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_size_includes_header() {
        let d = TypeDescriptor::new("pair", 2, vec![0, 1], false);
        assert_eq!(d.size, HEADER_BYTES + 2 * SLOT_BYTES);
        assert_eq!(d.size % OBJECT_ALIGN, 0);
    }

    #[test]
    #[should_panic(expected = "ref slot out of range")]
    fn descriptor_rejects_bad_ref_slot() {
        let _ = TypeDescriptor::new("bad", 1, vec![3], false);
    }

    #[test]
    fn registry_reserves_free_index() {
        let reg = TypeRegistry::new();
        let free = reg.get(TYPE_FREE).unwrap();
        assert_eq!(free.size, HEADER_BYTES);
        let id = reg.register(TypeDescriptor::new("node", 1, vec![0], false));
        assert_eq!(id.0, 1);
        assert_eq!(reg.get(id).unwrap().name, "node");
        assert!(reg.get(TypeId(99)).is_none());
    }

    #[test]
    fn header_roundtrip() {
        let mut buf = [0u64; 4];
        let addr = buf.as_mut_ptr() as usize;
        // Test-only: the buffer stands in for committed segment memory.
        unsafe { write_header(addr, TypeId(7), 24, 0) };
        let obj = ObjRef::from_addr(addr).unwrap();
        assert_eq!(obj.type_id(), TypeId(7));
        assert_eq!(obj.size(), 24);
        assert!(!obj.is_marked());
        obj.set_flags(FLAG_MARK | FLAG_PIN);
        assert!(obj.is_marked());
        assert!(obj.is_pinned());
        obj.clear_flags(FLAG_MARK);
        assert!(!obj.is_marked());
        assert!(obj.is_pinned());
        assert_eq!(obj.type_id(), TypeId(7));
    }
}
