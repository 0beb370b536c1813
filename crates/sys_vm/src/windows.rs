use std::io::{self, Error};
use std::mem;
use std::ptr;

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS,
    PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

/// Returns the system allocation granularity.
///
/// `VirtualAlloc` reservation bases are aligned to this value (typically
/// 64KB), which is larger than the page size (typically 4KB).
pub fn allocation_granularity() -> usize {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let gran = info.dwAllocationGranularity as usize;
        if gran == 0 {
            65536
        } else {
            gran
        }
    }
}

pub fn page_size() -> usize {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let size = info.dwPageSize as usize;
        if size == 0 {
            4096
        } else {
            size
        }
    }
}

pub struct ReservationInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
}

impl ReservationInner {
    pub fn reserve(len: usize) -> io::Result<Self> {
        let ptr = unsafe { VirtualAlloc(ptr::null(), len, MEM_RESERVE, PAGE_NOACCESS) };
        if ptr.is_null() {
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
        let ptr = unsafe { VirtualAlloc(addr.cast(), len, MEM_COMMIT, PAGE_READWRITE) };
        if ptr.is_null() {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    /// # Safety
    ///
    /// The range must lie inside this reservation and be page-aligned.
    pub unsafe fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        let addr = unsafe { self.ptr.cast::<u8>().add(offset) };
        let ok = unsafe { VirtualFree(addr.cast(), len, MEM_DECOMMIT) };
        if ok == 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for ReservationInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                // MEM_RELEASE requires dwSize to be 0.
                VirtualFree(self.ptr, 0, MEM_RELEASE);
            }
        }
    }
}
