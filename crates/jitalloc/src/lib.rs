//! Arena allocator for JITs.
mod region;

use std::io;
use std::marker::PhantomData;
use std::ptr::NonNull;

#[cfg(target_family = "windows")]
use windows::Win32::System::{
    Diagnostics::Debug::FlushInstructionCache, Threading::GetCurrentProcess,
};

#[cfg(target_os = "macos")]
unsafe extern "C" {
    unsafe fn sys_icache_invalidate(start: *mut std::ffi::c_void, len: usize);
}

use crate::region::Region;

#[rustfmt::skip]
pub use crate::region::{Protection, PAGE_SIZE};

/// # Safety considerations
/// The allocator this allocation comes from must not be modified while the allocation
/// is accessed, and must outlive it: dropping or resetting the allocator unmaps every allocation
/// it handed out.
pub struct Allocation<K>(NonNull<[u8]>, PhantomData<K>);

impl<K> Allocation<K> {
    /// Returns a pointer to the allocation.
    ///
    /// # Safety
    /// In order to access the data behind the pointer, accesses to the underlying allocator must
    /// be synchronized, as stated in the type docs. For more information, see
    /// [`Allocator::allocate`].
    #[inline(always)]
    pub unsafe fn as_ptr(&self) -> NonNull<[u8]> {
        self.0
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// SAFETY: safe to send to another thread as long as accesses to the allocation are synchronized
// with accesses to the allocator, which is the user's responsibility
unsafe impl<K> Send for Allocation<K> {}

/// Trait for kinds of allocations.
pub trait AllocKind {
    /// The protection of this kind of allocation.
    const PROTECTION: Protection;
}

/// Readable and executable allocation kind.
pub struct ReadExec;
impl AllocKind for ReadExec {
    const PROTECTION: Protection = Protection::ReadExec;
}

/// Readable and writable allocation kind.
pub struct ReadWrite;
impl AllocKind for ReadWrite {
    const PROTECTION: Protection = Protection::ReadWrite;
}

/// An arena allocator for data with the given protection kind `K`.
///
/// Allocations are never freed individually. [`Allocator::reset`] releases all of them at once.
pub struct Allocator<K> {
    /// Every region mapped so far, the last one being the active one
    regions: Vec<Region>,
    /// Offset into the active region
    offset: usize,
    /// Phantom
    _phantom: PhantomData<K>,
}

impl<K> Default for Allocator<K>
where
    K: AllocKind,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Allocator<K>
where
    K: AllocKind,
{
    #[inline(always)]
    pub const fn new() -> Self {
        Self {
            regions: Vec::new(),
            offset: 0,
            _phantom: PhantomData,
        }
    }

    /// Total amount of bytes mapped by this allocator.
    pub fn mapped(&self) -> usize {
        self.regions.iter().map(Region::len).sum()
    }

    /// Unmaps every region, invalidating all allocations made so far.
    ///
    /// # Safety
    /// No allocation of this allocator may be used after this call.
    pub unsafe fn reset(&mut self) {
        self.regions.clear();
        self.offset = 0;
    }

    /// Maps a new region right after the active one (if possible) and makes it active.
    fn grow(&mut self, length: usize) -> io::Result<()> {
        let hint = self
            .regions
            .last()
            .map(|region| region.as_ptr().addr() + region.len());

        self.regions.push(Region::new(hint, length)?);
        self.offset = 0;

        Ok(())
    }

    /// Reserves `length` bytes aligned to `alignment` in the active region, returning the offset
    /// of the reservation.
    fn reserve(&mut self, alignment: usize, length: usize) -> io::Result<usize> {
        assert!(length > 0);
        let alignment = alignment.max(1).next_power_of_two();

        loop {
            let effective_offset = self.offset.next_multiple_of(alignment);
            let fits = self.regions.last().is_some_and(|region| {
                region
                    .len()
                    .checked_sub(effective_offset)
                    .is_some_and(|remaining| remaining >= length)
            });

            if fits {
                self.offset = effective_offset + length;
                return Ok(effective_offset);
            }

            self.grow(length + alignment)?;
        }
    }

    fn allocation(&self, offset: usize, length: usize) -> Option<Allocation<K>> {
        let region = self.regions.last()?;

        // SAFETY: `offset + length` was reserved inside the active region
        let start = unsafe { region.as_ptr().add(offset) };
        let start = NonNull::new(start)?;

        Some(Allocation(
            NonNull::slice_from_raw_parts(start, length),
            PhantomData,
        ))
    }

    /// Allocates a region of memory with the given `alignment` and initializes it with `data`.
    ///
    /// # Safety considerations
    /// While creating an allocation is safe, _accessing_ the allocations must _not_ be done while
    /// allocation takes place.
    ///
    /// This is because the memory protection of existing allocations sharing a page with the new
    /// one is temporarily modified during the process of allocating.
    ///
    /// This is enforced in [`Allocation`]'s `as_ptr` method as a safety requirement.
    pub fn allocate(&mut self, alignment: usize, data: &[u8]) -> io::Result<Allocation<K>> {
        let offset = self.reserve(alignment, data.len())?;
        let region = self.regions.last().ok_or(io::ErrorKind::OutOfMemory)?;
        region.protect(offset, data.len(), Protection::ReadWrite)?;

        let alloc = self
            .allocation(offset, data.len())
            .ok_or(io::ErrorKind::OutOfMemory)?;

        // SAFETY: the allocation is guaranteed to be `data.len()` bytes long and writable, since
        // we've protected it as `ReadWrite`. the pointers also do not overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), alloc.0.as_ptr().cast(), data.len())
        };

        if K::PROTECTION != Protection::ReadWrite {
            region.protect(offset, data.len(), K::PROTECTION)?;
        }

        if K::PROTECTION == Protection::ReadExec {
            flush_icache(alloc.0.as_ptr().cast(), data.len())?;
        }

        Ok(alloc)
    }
}

/// Makes freshly written code visible to instruction fetch.
#[allow(unused_variables)]
fn flush_icache(ptr: *mut u8, len: usize) -> io::Result<()> {
    #[cfg(target_family = "windows")]
    unsafe {
        let process = GetCurrentProcess();
        FlushInstructionCache(process, Some(ptr.cast()), len).map_err(io::Error::other)?;
    }

    #[cfg(target_os = "macos")]
    unsafe {
        sys_icache_invalidate(ptr.cast(), len);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_aligned_and_initialized() {
        let mut alloc = Allocator::<ReadWrite>::new();
        let first = alloc.allocate(1, &[1, 2, 3]).unwrap();
        let second = alloc.allocate(16, &[4; 5]).unwrap();

        unsafe {
            let first = first.as_ptr();
            let second = second.as_ptr();

            assert_eq!(second.cast::<u8>().as_ptr().addr() % 16, 0);
            assert_eq!(first.as_ref(), &[1, 2, 3]);
            assert_eq!(second.as_ref(), &[4; 5]);
        }
    }

    #[test]
    fn large_allocations_map_new_regions() {
        let mut alloc = Allocator::<ReadWrite>::new();
        alloc.allocate(1, &[0; 16]).unwrap();
        let before = alloc.mapped();

        let data = vec![0xAB; before * 2];
        let big = alloc.allocate(8, &data).unwrap();

        assert!(alloc.mapped() > before);
        assert_eq!(big.len(), data.len());
        unsafe { assert!(big.as_ptr().as_ref().iter().all(|&b| b == 0xAB)) };
    }

    #[test]
    fn reset_releases_regions() {
        let mut alloc = Allocator::<ReadExec>::new();
        alloc.allocate(16, &[0xC3; 32]).unwrap();
        assert!(alloc.mapped() > 0);

        unsafe { alloc.reset() };
        assert_eq!(alloc.mapped(), 0);

        alloc.allocate(16, &[0xC3; 32]).unwrap();
        assert!(alloc.mapped() > 0);
    }
}
