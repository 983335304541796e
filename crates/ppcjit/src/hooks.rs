use cranelift::codegen::ir;
use cranelift::codegen::isa::CallConv;
use gekko::{Address, Cpu};
use strum::FromRepr;

pub type Context = std::ffi::c_void;

pub type GetRegistersHook = extern "C-unwind" fn(*mut Context) -> *mut Cpu;

pub type ReadHook<T> = extern "C-unwind" fn(*mut Context, Address, *mut T) -> bool;
pub type WriteHook<T> = extern "C-unwind" fn(*mut Context, Address, T) -> bool;

/// Executes one instruction word at the current PC through the interpreter. Returns 0 if execution
/// continues sequentially, 1 if the instruction branched and 2 if it raised an exception.
pub type InterpretHook = extern "C-unwind" fn(*mut Context, u32) -> u8;

pub type InvalidateICacheHook = extern "C-unwind" fn(*mut Context, Address);

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u32)]
pub enum HookKind {
    GetRegisters,
    ReadI32,
    ReadI64,
    WriteI32,
    WriteI64,
    Interpret,
    InvICache,
}

/// External functions that JITed code calls.
#[derive(Clone, Copy)]
pub struct Hooks {
    /// Hook that returns a pointer to the CPU state struct given the context.
    pub get_registers: GetRegistersHook,

    // memory
    pub read_i32: ReadHook<i32>,
    pub write_i32: WriteHook<i32>,
    pub read_i64: ReadHook<i64>,
    pub write_i64: WriteHook<i64>,

    /// Hook that executes an instruction the JIT doesn't compile natively.
    pub interpret: InterpretHook,

    // cache
    pub invalidate_icache: InvalidateICacheHook,
}

impl Hooks {
    /// Address of the hook of the given kind.
    pub(crate) fn address(&self, kind: HookKind) -> usize {
        match kind {
            HookKind::GetRegisters => self.get_registers as usize,
            HookKind::ReadI32 => self.read_i32 as usize,
            HookKind::ReadI64 => self.read_i64 as usize,
            HookKind::WriteI32 => self.write_i32 as usize,
            HookKind::WriteI64 => self.write_i64 as usize,
            HookKind::Interpret => self.interpret as usize,
            HookKind::InvICache => self.invalidate_icache as usize,
        }
    }

    /// Returns the function signature for the `get_registers` hook.
    pub(crate) fn get_registers_sig(ptr_type: ir::Type, call_conv: CallConv) -> ir::Signature {
        ir::Signature {
            params: vec![
                ir::AbiParam::new(ptr_type), // ctx
            ],
            returns: vec![ir::AbiParam::new(ptr_type)], // registers
            call_conv,
        }
    }

    /// Returns the function signature for a memory read hook.
    pub(crate) fn read_sig(ptr_type: ir::Type, call_conv: CallConv) -> ir::Signature {
        ir::Signature {
            params: vec![
                ir::AbiParam::new(ptr_type),       // ctx
                ir::AbiParam::new(ir::types::I32), // address
                ir::AbiParam::new(ptr_type),       // value ptr
            ],
            returns: vec![ir::AbiParam::new(ir::types::I8)], // success
            call_conv,
        }
    }

    /// Returns the function signature for a memory write hook.
    pub(crate) fn write_sig(
        ptr_type: ir::Type,
        write_type: ir::Type,
        call_conv: CallConv,
    ) -> ir::Signature {
        ir::Signature {
            params: vec![
                ir::AbiParam::new(ptr_type),       // ctx
                ir::AbiParam::new(ir::types::I32), // address
                ir::AbiParam::new(write_type),     // value
            ],
            returns: vec![ir::AbiParam::new(ir::types::I8)], // success
            call_conv,
        }
    }

    /// Returns the function signature for the interpret hook.
    pub(crate) fn interpret_sig(ptr_type: ir::Type, call_conv: CallConv) -> ir::Signature {
        ir::Signature {
            params: vec![
                ir::AbiParam::new(ptr_type),       // ctx
                ir::AbiParam::new(ir::types::I32), // instruction word
            ],
            returns: vec![ir::AbiParam::new(ir::types::I8)], // outcome
            call_conv,
        }
    }

    /// Returns the function signature for a invalidate icache hook.
    pub(crate) fn invalidate_icache_sig(ptr_type: ir::Type, call_conv: CallConv) -> ir::Signature {
        ir::Signature {
            params: vec![
                ir::AbiParam::new(ptr_type),       // ctx
                ir::AbiParam::new(ir::types::I32), // address
            ],
            returns: vec![],
            call_conv,
        }
    }
}
