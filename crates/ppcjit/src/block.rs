use std::ffi::c_void;
use std::ptr::NonNull;

use jitalloc::{Allocation, ReadExec};
use strum::FromRepr;

use crate::Sequence;
use crate::hooks::Context;

/// Why a block returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromRepr)]
#[repr(u8)]
pub enum ExitReason {
    /// Execution reached the end of the block, or a conditional branch wasn't taken. PC points to
    /// the next sequential instruction.
    #[default]
    FallThrough = 0,
    /// A branch was taken, or an interpreted instruction redirected PC.
    Branch = 1,
    /// A guest exception was raised. PC points to the exception vector.
    Exception = 2,
}

/// Information about block execution. Written by the block on exit.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Info {
    /// How many instructions were executed, including the one that raised an exception.
    pub instructions: u32,
    /// How many cycles were executed.
    pub cycles: u32,
    /// Raw [`ExitReason`].
    pub exit: u8,
}

impl Info {
    /// The reason the block returned.
    pub fn exit_reason(&self) -> ExitReason {
        ExitReason::from_repr(self.exit).unwrap_or_else(|| {
            tracing::error!("block returned with invalid exit reason {}", self.exit);
            ExitReason::Exception
        })
    }
}

/// Meta information regarding a block.
#[derive(Debug, Clone)]
pub struct Meta {
    /// The sequence of instructions this block contains.
    pub seq: Sequence,
    /// How many of the instructions are handed to the interpreter.
    pub interpreted: u32,
    /// The Cranelift IR of this block. Only available if `cfg!(debug_assertions)` is true.
    pub clir: Option<String>,
    /// The disassembly of this block. Only available if `cfg!(debug_assertions)` is true.
    pub disasm: Option<String>,
    /// How many cycles this block executes at most.
    pub cycles: u32,
}

/// A handle representing a compiled block of PowerPC instructions. This struct does not manage the
/// memory behind the block.
///
/// In order to call the block, use [`Jit::call`](super::Jit::call).
pub struct Block {
    code: Allocation<ReadExec>,
    meta: Meta,
}

/// A opaque handle representing the function of a compiled [`Block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct BlockFn(NonNull<c_void>);

impl Block {
    pub(crate) fn new(code: Allocation<ReadExec>, meta: Meta) -> Self {
        Self { code, meta }
    }

    /// Meta information regarding this block.
    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// Amount of instructions in this block.
    pub fn len(&self) -> u32 {
        self.meta.seq.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.meta.seq.is_empty()
    }

    /// Returns a pointer to the function of this block.
    pub fn as_ptr(&self) -> BlockFn {
        // SAFETY: the pointer isn't accessed by anything other than Jit::call
        BlockFn(unsafe { self.code.as_ptr().cast() })
    }
}

/// A trampoline that allows calling blocks produced by a [`Jit`](super::Jit) compiler.
pub(super) struct Trampoline(pub(super) Allocation<ReadExec>);

type TrampolineFn = extern "C-unwind" fn(*mut Info, *mut Context, BlockFn);

impl Trampoline {
    /// Calls the given block using this trampoline.
    ///
    /// # Safety
    /// The allocator used for this trampoline and the block must not be used while the block is
    /// being called (i.e. this function is being executed).
    pub unsafe fn call(&self, ctx: *mut Context, block: BlockFn) -> Info {
        let mut info = Info::default();

        let trampoline: TrampolineFn = unsafe { std::mem::transmute(self.0.as_ptr().cast::<u8>()) };
        trampoline(&raw mut info, ctx, block);

        info
    }
}
