//! Virtual memory primitives for a garbage-collected heap.
//!
//! The central type is [`Reservation`]: a contiguous range of address space
//! reserved up front with no access rights, inside which pages are committed
//! (made readable/writable) and decommitted on demand. This is the split the
//! heap's segment model needs: reserving is cheap and does not consume
//! physical memory, committing does.
//!
//! Freshly committed pages are zero-filled by the OS on every supported
//! platform; callers may rely on that.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows this is typically 64KB; reservations are aligned to it.
/// On Unix it equals the page size.
#[must_use]
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// A reserved range of address space.
///
/// The whole range is inaccessible until parts of it are committed with
/// [`Reservation::commit`]. The range is released when the handle is dropped.
pub struct Reservation {
    inner: os::ReservationInner,
    /// Offset of the aligned base inside the raw OS mapping (see
    /// [`Reservation::reserve_aligned`]).
    base_offset: usize,
    /// Usable length starting at the aligned base.
    len: usize,
}

impl Reservation {
    /// Reserves `len` bytes of address space with no access rights.
    ///
    /// # Errors
    ///
    /// Returns the OS error when the address space cannot be reserved.
    pub fn reserve(len: usize) -> io::Result<Self> {
        let inner = os::ReservationInner::reserve(len)?;
        Ok(Self {
            inner,
            base_offset: 0,
            len,
        })
    }

    /// Reserves `len` bytes whose base address is aligned to `align`.
    ///
    /// Over-reserves by `align` and exposes the aligned sub-range; the OS
    /// keeps the slop reserved but it is never committed. `align` must be a
    /// power of two and a multiple of the allocation granularity.
    ///
    /// # Errors
    ///
    /// Returns the OS error when the address space cannot be reserved.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    pub fn reserve_aligned(len: usize, align: usize) -> io::Result<Self> {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        let raw_len = len + align;
        let inner = os::ReservationInner::reserve(raw_len)?;
        let raw = inner.ptr() as usize;
        let aligned = (raw + align - 1) & !(align - 1);
        Ok(Self {
            inner,
            base_offset: aligned - raw,
            len,
        })
    }

    /// Returns the (aligned) base pointer of the usable range.
    #[must_use]
    pub fn base(&self) -> *mut u8 {
        // SAFETY: base_offset is within the raw mapping by construction.
        unsafe { self.inner.ptr().add(self.base_offset) }
    }

    /// Returns the usable length in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the usable length is zero.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Commits `[offset, offset + commit_len)` for read/write access.
    ///
    /// Offsets are relative to [`Reservation::base`] and must be
    /// page-aligned. Committed pages read as zero until first written.
    ///
    /// # Errors
    ///
    /// Returns the OS error when the commit fails (typically commit-charge
    /// or physical memory exhaustion). The reservation stays valid.
    pub fn commit(&self, offset: usize, commit_len: usize) -> io::Result<()> {
        debug_assert!(offset + commit_len <= self.len);
        // SAFETY: the range lies inside this reservation.
        unsafe { self.inner.commit(self.base_offset + offset, commit_len) }
    }

    /// Returns committed pages in `[offset, offset + decommit_len)` to the OS.
    ///
    /// Advisory: the pages become inaccessible (or zero on next touch) and
    /// their physical backing may be reclaimed. Never required for
    /// correctness.
    ///
    /// # Errors
    ///
    /// Returns the OS error when the decommit fails.
    pub fn decommit(&self, offset: usize, decommit_len: usize) -> io::Result<()> {
        debug_assert!(offset + decommit_len <= self.len);
        // SAFETY: the range lies inside this reservation.
        unsafe { self.inner.decommit(self.base_offset + offset, decommit_len) }
    }
}

// SAFETY: the reservation is an owned OS resource; access to the memory it
// covers is governed by the owning heap, not by this handle.
unsafe impl Send for Reservation {}
unsafe impl Sync for Reservation {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn page_size_is_power_of_two() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0);
    }

    #[test]
    fn granularity_at_least_page_size() {
        let ag = allocation_granularity();
        assert!(ag >= page_size());
        assert_eq!(ag & (ag - 1), 0);
    }

    #[test]
    fn commit_then_write() {
        let len = page_size() * 4;
        let res = Reservation::reserve(len).expect("reserve failed");
        res.commit(0, page_size()).expect("commit failed");

        let ptr = res.base();
        unsafe {
            ptr::write_volatile(ptr, 42u8);
            assert_eq!(ptr::read_volatile(ptr), 42);
        }
    }

    #[test]
    fn committed_pages_are_zero() {
        let res = Reservation::reserve(page_size()).expect("reserve failed");
        res.commit(0, page_size()).expect("commit failed");
        let slice = unsafe { std::slice::from_raw_parts(res.base(), page_size()) };
        assert!(slice.iter().all(|&b| b == 0));
    }

    #[test]
    fn aligned_reservation() {
        let align = 1 << 20;
        let res = Reservation::reserve_aligned(align, align).expect("reserve failed");
        assert_eq!(res.base() as usize % align, 0);
        res.commit(0, page_size()).expect("commit failed");
        unsafe {
            ptr::write_volatile(res.base(), 7u8);
        }
    }

    #[test]
    fn decommit_then_recommit() {
        let len = page_size() * 2;
        let res = Reservation::reserve(len).expect("reserve failed");
        res.commit(0, len).expect("commit failed");
        unsafe {
            ptr::write_volatile(res.base(), 1u8);
        }
        res.decommit(0, page_size()).expect("decommit failed");
        res.commit(0, page_size()).expect("recommit failed");
        // Recommitted page must read as zero again.
        assert_eq!(unsafe { ptr::read_volatile(res.base()) }, 0);
    }
}
