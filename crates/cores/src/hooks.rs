use gekko::{Address, Cpu, Memory, Primitive};
use ppcjit::hooks::{self as jit, Hooks};

use crate::blocks::Blocks;

/// Size in bytes of an instruction cache block.
const CACHE_BLOCK_LEN: u32 = 32;

/// Guest memory as seen by running blocks. Writes that hit compiled code queue an invalidation of
/// the written bytes.
pub struct Watched<'a, M> {
    pub inner: &'a mut M,
    pub blocks: [&'a Blocks; 2],
    pub pending: &'a mut Vec<(Address, u32)>,
}

impl<M: Memory> Memory for Watched<'_, M> {
    #[inline(always)]
    fn read<P: Primitive>(&mut self, addr: Address) -> Option<P> {
        self.inner.read(addr)
    }

    #[inline(always)]
    fn write<P: Primitive>(&mut self, addr: Address, value: P) -> bool {
        if !self.inner.write(addr, value) {
            return false;
        }

        let len = P::SIZE as u32;
        if self.blocks.iter().any(|blocks| blocks.contains_code(addr, len)) {
            tracing::debug!("write to {addr} modifies compiled code");
            self.pending.push((addr, len));
        }

        true
    }
}

/// Context passed to JIT blocks.
pub struct Context<'a, M> {
    pub cpu: &'a mut Cpu,
    pub mem: Watched<'a, M>,
}

/// # Safety
/// `ctx` must point to a live [`Context`] over `M`.
#[inline(always)]
unsafe fn context<'a, M: Memory>(ctx: *mut jit::Context) -> &'a mut Context<'a, M> {
    unsafe { &mut *ctx.cast::<Context<'a, M>>() }
}

extern "C-unwind" fn get_registers<M: Memory>(ctx: *mut jit::Context) -> *mut Cpu {
    let ctx = unsafe { context::<M>(ctx) };
    &raw mut *ctx.cpu
}

extern "C-unwind" fn read<M: Memory, P: Primitive>(
    ctx: *mut jit::Context,
    addr: Address,
    value: *mut P,
) -> bool {
    let ctx = unsafe { context::<M>(ctx) };
    if let Some(read) = ctx.mem.read(addr) {
        unsafe { value.write(read) };
        true
    } else {
        tracing::debug!(pc = ?ctx.cpu.pc, "failed to read from {addr}");
        false
    }
}

extern "C-unwind" fn write<M: Memory, P: Primitive>(
    ctx: *mut jit::Context,
    addr: Address,
    value: P,
) -> bool {
    let ctx = unsafe { context::<M>(ctx) };
    if ctx.mem.write(addr, value) {
        true
    } else {
        tracing::debug!(pc = ?ctx.cpu.pc, "failed to write to {addr}");
        false
    }
}

extern "C-unwind" fn interpret<M: Memory>(ctx: *mut jit::Context, code: u32) -> u8 {
    let ctx = unsafe { context::<M>(ctx) };
    ppcint::step(ctx.cpu, &mut ctx.mem, code) as u8
}

extern "C-unwind" fn invalidate_icache<M: Memory>(ctx: *mut jit::Context, addr: Address) {
    let ctx = unsafe { context::<M>(ctx) };
    let base = addr.align_down(CACHE_BLOCK_LEN);
    ctx.mem.pending.push((base, CACHE_BLOCK_LEN));
}

/// Hooks operating on a [`Context`] over `M`.
pub fn hooks<M: Memory>() -> Hooks {
    Hooks {
        get_registers: get_registers::<M>,
        read_i32: read::<M, i32>,
        write_i32: write::<M, i32>,
        read_i64: read::<M, i64>,
        write_i64: write::<M, i64>,
        interpret: interpret::<M>,
        invalidate_icache: invalidate_icache::<M>,
    }
}
