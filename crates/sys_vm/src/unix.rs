use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

pub struct ReservationInner {
    ptr: *mut libc::c_void,
    len: usize,
}

impl ReservationInner {
    /// Reserves `len` bytes of address space with `PROT_NONE`.
    ///
    /// `MAP_NORESERVE` keeps the kernel from charging swap for the whole
    /// range up front; access rights are granted per-range by `commit`.
    pub fn reserve(len: usize) -> io::Result<Self> {
        #[cfg(any(
            target_os = "linux",
            target_os = "android",
            target_vendor = "apple",
            target_os = "netbsd",
        ))]
        let no_reserve = libc::MAP_NORESERVE;
        #[cfg(not(any(
            target_os = "linux",
            target_os = "android",
            target_vendor = "apple",
            target_os = "netbsd",
        )))]
        let no_reserve = 0;

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON | no_reserve,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }

        Ok(Self { ptr, len })
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    /// # Safety
    ///
    /// The range must lie inside this reservation and be page-aligned.
    pub unsafe fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        let addr = unsafe { self.ptr.cast::<u8>().add(offset) };
        let rc = unsafe { libc::mprotect(addr.cast(), len, libc::PROT_READ | libc::PROT_WRITE) };
        if rc != 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    /// # Safety
    ///
    /// The range must lie inside this reservation and be page-aligned.
    pub unsafe fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        let addr = unsafe { self.ptr.cast::<u8>().add(offset) };
        // Drop the backing pages, then remove access so a stray touch faults
        // instead of silently reading zeros.
        #[cfg(any(target_os = "linux", target_os = "android"))]
        let advice = libc::MADV_DONTNEED;
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let advice = libc::MADV_FREE;

        let rc = unsafe { libc::madvise(addr.cast(), len, advice) };
        if rc != 0 {
            return Err(Error::last_os_error());
        }
        let rc = unsafe { libc::mprotect(addr.cast(), len, libc::PROT_NONE) };
        if rc != 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for ReservationInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}
