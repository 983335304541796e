use std::io;

use jitalloc::{Allocation, Allocator, ReadExec};

/// A module that owns the code of compiled blocks.
pub struct Module {
    code_allocator: Allocator<ReadExec>,
}

impl Module {
    pub fn new() -> Self {
        Self {
            code_allocator: Allocator::new(),
        }
    }

    pub fn allocate_code(&mut self, code: &[u8]) -> io::Result<Allocation<ReadExec>> {
        self.code_allocator.allocate(64, code)
    }

    /// Bytes of code memory mapped so far.
    pub fn mapped(&self) -> usize {
        self.code_allocator.mapped()
    }

    /// Releases every code allocation.
    ///
    /// # Safety
    /// No allocation of this module may be used after this call.
    pub unsafe fn reset(&mut self) {
        unsafe { self.code_allocator.reset() }
    }
}
