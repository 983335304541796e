use std::io;

#[cfg(target_family = "unix")]
use rustix::mm::{self as mman, MapFlags, MprotectFlags, ProtFlags};
#[cfg(target_family = "windows")]
use windows::Win32::System::Memory;

// TODO: query the page size instead of assuming 4 KiB pages
pub const PAGE_SIZE: usize = 4 * bytesize::KIB as usize;
const REGION_MIN_LEN: usize = 128 * bytesize::KIB as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    ReadExec,
    ReadWrite,
}

/// An owned memory mapped region. Unmapped on drop.
pub struct Region {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the mapping is owned by this value and protection changes can be done from any thread
unsafe impl Send for Region {}

impl Region {
    /// Maps a new region of at least `len` bytes, trying to place it at `addr_hint`.
    pub fn new(addr_hint: Option<usize>, len: usize) -> io::Result<Self> {
        let addr_hint = addr_hint.map(|a| a.next_multiple_of(PAGE_SIZE));
        let len = len.max(REGION_MIN_LEN).next_multiple_of(PAGE_SIZE);

        // SAFETY: the hint is page aligned and has no provenance, the kernel is free to ignore it
        #[cfg(target_family = "unix")]
        let ptr = unsafe {
            mman::mmap_anonymous(
                addr_hint
                    .map(std::ptr::without_provenance_mut)
                    .unwrap_or_default(),
                len,
                ProtFlags::empty(),
                MapFlags::PRIVATE,
            )
        }?;

        #[cfg(target_family = "windows")]
        let ptr = unsafe {
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;
            let hinted = addr_hint.map(|addr| std::ptr::without_provenance(addr));
            let mut result = Memory::VirtualAlloc(hinted, len, flags, Memory::PAGE_NOACCESS);
            if result.is_null() {
                result = Memory::VirtualAlloc(None, len, flags, Memory::PAGE_NOACCESS);
            }

            if result.is_null() {
                return Err(io::Error::last_os_error());
            }

            result
        };

        Ok(Self {
            ptr: ptr.cast(),
            len,
        })
    }

    /// Changes the protection of `length` bytes starting at `offset` to `protection`. The range
    /// is widened to page boundaries.
    pub fn protect(&self, offset: usize, length: usize, protection: Protection) -> io::Result<()> {
        let start = offset - offset % PAGE_SIZE;
        let end = (offset + length).next_multiple_of(PAGE_SIZE).min(self.len);
        if start >= end {
            return Ok(());
        }

        #[cfg(target_family = "unix")]
        {
            let flags = match protection {
                Protection::ReadExec => MprotectFlags::READ | MprotectFlags::EXEC,
                Protection::ReadWrite => MprotectFlags::READ | MprotectFlags::WRITE,
            };

            // SAFETY: the range lies inside this region, which was mapped by `new`
            unsafe { mman::mprotect(self.ptr.add(start).cast(), end - start, flags) }?;
        }

        #[cfg(target_family = "windows")]
        {
            let mut prev = Memory::PAGE_PROTECTION_FLAGS(0);
            let flags = match protection {
                Protection::ReadExec => Memory::PAGE_EXECUTE_READ,
                Protection::ReadWrite => Memory::PAGE_READWRITE,
            };

            // SAFETY: the range lies inside this region, which was allocated by `new`
            unsafe {
                Memory::VirtualProtect(
                    self.ptr.add(start).cast(),
                    end - start,
                    flags,
                    &raw mut prev,
                )
            }
            .map_err(io::Error::other)?;
        }

        Ok(())
    }

    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: this region was mapped by `new` and nothing points into it anymore, as
        // enforced by the owner
        #[cfg(target_family = "unix")]
        if let Err(e) = unsafe { mman::munmap(self.ptr.cast(), self.len) } {
            tracing::error!("failed to unmap JIT region: {e}");
        }

        #[cfg(target_family = "windows")]
        if let Err(e) = unsafe { Memory::VirtualFree(self.ptr.cast(), 0, Memory::MEM_RELEASE) } {
            tracing::error!("failed to free JIT region: {e}");
        }
    }
}
