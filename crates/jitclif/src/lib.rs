//! Utilities shared by cranelift based JITs: ISA presets, libcall resolution and relocation
//! patching.
mod isa;
mod libcalls;

use cranelift_codegen::FinalizedMachReloc;
use cranelift_codegen::binemit::Reloc;
use easyerr::Error;

#[rustfmt::skip]
pub use crate::{
    isa::{IsaError, x86_64_v1},
    libcalls::get as libcall,
};

#[derive(Debug, Error)]
pub enum RelocError {
    #[error("relocation kind {kind:?} is not supported")]
    Unsupported { kind: Reloc },
    #[error("relocation at offset {offset} is out of bounds")]
    OutOfBounds { offset: u32 },
}

/// Writes a relocation in the given buffer.
pub fn write_relocation(
    code: &mut [u8],
    reloc: &FinalizedMachReloc,
    addr: usize,
) -> Result<(), RelocError> {
    match reloc.kind {
        Reloc::Abs8 => {
            let base = reloc.offset as usize;
            let target = code
                .get_mut(base..base + size_of::<usize>())
                .ok_or(RelocError::OutOfBounds {
                    offset: reloc.offset,
                })?;

            target.copy_from_slice(&addr.to_ne_bytes());
            Ok(())
        }
        kind => Err(RelocError::Unsupported { kind }),
    }
}
