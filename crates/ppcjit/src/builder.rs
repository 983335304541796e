mod branch;
mod exception;
mod fallback;
mod floating;
mod integer;
mod memory;
mod paired;
mod util;

use std::mem::offset_of;

use cranelift::codegen::ir;
use cranelift::frontend;
use cranelift::prelude::InstBuilder;
use gekko::disasm::Ins;
use gekko::{FPR, Reg};

use crate::block::{ExitReason, Info};
use crate::builder::util::IntoIrValue;
use crate::helpers::Internal;
use crate::hooks::{HookKind, Hooks};
use crate::regcache::{Backing, RegCache};
use crate::tables::{Handler, Tables};
use crate::{Codegen, NAMESPACE_INTERNALS, NAMESPACE_USER_HOOKS, Sequence};

const MEMFLAGS: ir::MemFlags = ir::MemFlags::trusted();

/// A lane of a floating point register, as tracked by the float register cache.
pub(crate) type Lane = (FPR, usize);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Action {
    /// Continue emitting instructions.
    Continue,
    /// The instruction already emitted every exit of the block.
    Finish,
}

#[derive(Debug, Clone, Copy)]
pub struct InstructionInfo {
    pub cycles: u8,
    pub action: Action,
}

/// The guest register file in memory, as seen by the register caches.
struct RegFile<'a, 'ctx> {
    bd: &'a mut frontend::FunctionBuilder<'ctx>,
    regs_ptr: ir::Value,
}

impl Backing<Reg> for RegFile<'_, '_> {
    type Value = ir::Value;

    fn load(&mut self, reg: Reg) -> ir::Value {
        self.bd.ins().load(
            ir::types::I32,
            MEMFLAGS,
            self.regs_ptr,
            reg.offset() as i32,
        )
    }

    fn store(&mut self, reg: Reg, value: ir::Value) {
        self.bd
            .ins()
            .store(MEMFLAGS, value, self.regs_ptr, reg.offset() as i32);
    }
}

impl Backing<Lane> for RegFile<'_, '_> {
    type Value = ir::Value;

    fn load(&mut self, (fpr, lane): Lane) -> ir::Value {
        self.bd.ins().load(
            ir::types::F64,
            MEMFLAGS,
            self.regs_ptr,
            fpr.lane_offset(lane) as i32,
        )
    }

    fn store(&mut self, (fpr, lane): Lane, value: ir::Value) {
        self.bd
            .ins()
            .store(MEMFLAGS, value, self.regs_ptr, fpr.lane_offset(lane) as i32);
    }
}

/// External functions imported into the block.
struct Funcs {
    read_i32: ir::FuncRef,
    read_i64: ir::FuncRef,
    write_i32: ir::FuncRef,
    write_i64: ir::FuncRef,
    interpret: ir::FuncRef,
    inv_icache: ir::FuncRef,

    /// Indexed by [`Internal`].
    internals: Vec<ir::FuncRef>,
}

/// Constants used through block building.
struct Consts {
    ptr_type: ir::Type,

    info_ptr: ir::Value,
    ctx_ptr: ir::Value,
    regs_ptr: ir::Value,

    /// PC of the first instruction of the block.
    entry_pc: ir::Value,
    read_stack_slot: ir::StackSlot,
}

/// Structure to build JIT blocks.
pub struct BlockBuilder<'ctx> {
    codegen: &'ctx Codegen,
    tables: &'ctx Tables,
    bd: frontend::FunctionBuilder<'ctx>,
    consts: Consts,
    funcs: Funcs,

    ints: RegCache<Reg, ir::Value>,
    floats: RegCache<Lane, ir::Value>,

    executed_cycles: u32,
    executed_instructions: u32,
    interpreted: u32,
    floats_checked: bool,
}

impl<'ctx> BlockBuilder<'ctx> {
    pub fn new(
        codegen: &'ctx Codegen,
        tables: &'ctx Tables,
        mut builder: frontend::FunctionBuilder<'ctx>,
    ) -> Self {
        let entry_bb = builder.create_block();
        builder.append_block_params_for_function_params(entry_bb);
        builder.switch_to_block(entry_bb);
        builder.seal_block(entry_bb);

        let read_stack_slot = builder.create_sized_stack_slot(ir::StackSlotData::new(
            ir::StackSlotKind::ExplicitSlot,
            size_of::<u64>() as u32,
            align_of::<u64>().ilog2() as u8,
        ));

        let ptr_type = codegen.isa.pointer_type();
        let default = codegen.isa.default_call_conv();
        let params = builder.block_params(entry_bb);
        let info_ptr = params[0];
        let ctx_ptr = params[1];
        let regs_ptr = params[2];

        let entry_pc = builder.ins().load(
            ir::types::I32,
            MEMFLAGS,
            regs_ptr,
            Reg::PC.offset() as i32,
        );

        let mut import = |namespace, index, sig: ir::Signature| {
            let signature = builder.import_signature(sig);
            let name = builder
                .func
                .declare_imported_user_function(ir::UserExternalName::new(namespace, index));

            builder.import_function(ir::ExtFuncData {
                name: ir::ExternalName::User(name),
                signature,
                colocated: false,
                patchable: false,
            })
        };

        let mut hook =
            |kind: HookKind, sig: ir::Signature| import(NAMESPACE_USER_HOOKS, kind as u32, sig);

        let read_i32 = hook(HookKind::ReadI32, Hooks::read_sig(ptr_type, default));
        let read_i64 = hook(HookKind::ReadI64, Hooks::read_sig(ptr_type, default));
        let write_i32 = hook(
            HookKind::WriteI32,
            Hooks::write_sig(ptr_type, ir::types::I32, default),
        );
        let write_i64 = hook(
            HookKind::WriteI64,
            Hooks::write_sig(ptr_type, ir::types::I64, default),
        );
        let interpret = hook(HookKind::Interpret, Hooks::interpret_sig(ptr_type, default));
        let inv_icache = hook(
            HookKind::InvICache,
            Hooks::invalidate_icache_sig(ptr_type, default),
        );

        let internals = std::iter::successors(Some(0u32), |i| Some(i + 1))
            .map_while(Internal::from_repr)
            .map(|internal| {
                import(
                    NAMESPACE_INTERNALS,
                    internal as u32,
                    internal.signature(ptr_type, default),
                )
            })
            .collect();

        let funcs = Funcs {
            read_i32,
            read_i64,
            write_i32,
            write_i64,
            interpret,
            inv_icache,
            internals,
        };

        let consts = Consts {
            ptr_type,

            info_ptr,
            ctx_ptr,
            regs_ptr,

            entry_pc,
            read_stack_slot,
        };

        let capacity = tables.capacity();
        Self {
            codegen,
            tables,
            bd: builder,
            consts,
            funcs,

            ints: RegCache::new(capacity.int.max(1) as usize),
            floats: RegCache::new(capacity.float.max(1) as usize),

            executed_cycles: 0,
            executed_instructions: 0,
            interpreted: 0,
            floats_checked: false,
        }
    }

    fn switch_to_bb(&mut self, bb: ir::Block) {
        self.bd.switch_to_block(bb);
        self.bd
            .set_srcloc(ir::SourceLoc::new(self.executed_instructions));
    }

    /// Gets the current value of the given integer register, binding it in the cache.
    fn get(&mut self, reg: impl Into<Reg>) -> ir::Value {
        let mut file = RegFile {
            bd: &mut self.bd,
            regs_ptr: self.consts.regs_ptr,
        };

        self.ints.bind_read(&mut file, reg.into()).1
    }

    /// Sets the value of the given integer register. The value must be an I32.
    fn set(&mut self, reg: impl Into<Reg>, value: impl IntoIrValue) {
        let reg = reg.into();
        let value = self.ir_value(value);
        debug_assert_eq!(self.bd.func.dfg.value_type(value), ir::types::I32);

        let mut file = RegFile {
            bd: &mut self.bd,
            regs_ptr: self.consts.regs_ptr,
        };

        self.ints.bind_write(&mut file, reg, value);
    }

    /// Gets the current value of the given lane of a floating point register.
    fn get_lane(&mut self, fpr: FPR, lane: usize) -> ir::Value {
        let mut file = RegFile {
            bd: &mut self.bd,
            regs_ptr: self.consts.regs_ptr,
        };

        self.floats.bind_read(&mut file, (fpr, lane)).1
    }

    /// Sets a single lane of a floating point register. The value must be an F64.
    fn set_lane(&mut self, fpr: FPR, lane: usize, value: ir::Value) {
        debug_assert_eq!(self.bd.func.dfg.value_type(value), ir::types::F64);

        let mut file = RegFile {
            bd: &mut self.bd,
            regs_ptr: self.consts.regs_ptr,
        };

        self.floats.bind_write(&mut file, (fpr, lane), value);
    }

    /// Gets both lanes of a floating point register.
    fn get_pair(&mut self, fpr: FPR) -> [ir::Value; 2] {
        let mut file = RegFile {
            bd: &mut self.bd,
            regs_ptr: self.consts.regs_ptr,
        };

        let [(_, ps0), (_, ps1)] = self.floats.bind_pair(&mut file, [(fpr, 0), (fpr, 1)]);
        [ps0, ps1]
    }

    /// Sets both lanes of a floating point register.
    fn set_pair(&mut self, fpr: FPR, values: [ir::Value; 2]) {
        let mut file = RegFile {
            bd: &mut self.bd,
            regs_ptr: self.consts.regs_ptr,
        };

        self.floats
            .bind_pair_write(&mut file, [(fpr, 0), (fpr, 1)], values);
    }

    /// Stores every dirty cached register without touching the cache. Safe to use in side exits,
    /// since the main path keeps its bindings.
    fn write_back(&mut self) {
        let mut file = RegFile {
            bd: &mut self.bd,
            regs_ptr: self.consts.regs_ptr,
        };

        self.ints.write_back(&mut file);
        self.floats.write_back(&mut file);
    }

    /// Stores every dirty cached register and empties the caches.
    fn flush_all(&mut self) {
        let mut file = RegFile {
            bd: &mut self.bd,
            regs_ptr: self.consts.regs_ptr,
        };

        self.ints.flush_all(&mut file);
        self.floats.flush_all(&mut file);
    }

    /// PC of the instruction currently being emitted.
    fn current_pc(&mut self) -> ir::Value {
        self.pc_after(0)
    }

    /// PC of the instruction `delta` instructions after the current one.
    fn pc_after(&mut self, delta: u32) -> ir::Value {
        let offset = 4 * (self.executed_instructions + delta);
        self.bd
            .ins()
            .iadd_imm(self.consts.entry_pc, offset as i32 as i64)
    }

    fn store_pc(&mut self, pc: ir::Value) {
        self.bd.ins().store(
            MEMFLAGS,
            pc,
            self.consts.regs_ptr,
            Reg::PC.offset() as i32,
        );
    }

    /// Calls a runtime helper.
    fn call_internal(&mut self, internal: Internal, args: &[ir::Value]) -> ir::Inst {
        let func = self.funcs.internals[internal as usize];
        self.bd.ins().call(func, args)
    }

    /// Calls a runtime helper which returns a value.
    fn call_internal_value(&mut self, internal: Internal, args: &[ir::Value]) -> ir::Value {
        let inst = self.call_internal(internal, args);
        self.bd.inst_results(inst)[0]
    }

    /// Writes the Info struct, counting the current instruction as executed.
    fn write_info(&mut self, exit: ir::Value, info: InstructionInfo) {
        let instructions = self.ir_value(self.executed_instructions + 1);
        let cycles = self.ir_value(self.executed_cycles + info.cycles as u32);

        self.bd.ins().store(
            MEMFLAGS,
            instructions,
            self.consts.info_ptr,
            offset_of!(Info, instructions) as i32,
        );
        self.bd.ins().store(
            MEMFLAGS,
            cycles,
            self.consts.info_ptr,
            offset_of!(Info, cycles) as i32,
        );
        self.bd.ins().store(
            MEMFLAGS,
            exit,
            self.consts.info_ptr,
            offset_of!(Info, exit) as i32,
        );
    }

    /// Leaves the block as if the current instruction, described by `info`, had executed.
    /// Registers are written back but the caches keep their bindings.
    fn exit(&mut self, reason: ExitReason, pc: Option<ir::Value>, info: InstructionInfo) {
        self.write_back();
        if let Some(pc) = pc {
            self.store_pc(pc);
        }

        let reason = self.ir_value(reason as u8);
        self.write_info(reason, info);
        self.bd.ins().return_(&[]);
    }

    /// Creates a cold block which is entered whenever `ok` is zero. `cold` emits its contents and
    /// must leave the block. Emission continues on the path where `ok` is non-zero.
    fn side_exit(&mut self, ok: ir::Value, cold: impl FnOnce(&mut Self)) {
        let exit_bb = self.bd.create_block();
        let continue_bb = self.bd.create_block();

        self.bd.set_cold_block(exit_bb);
        self.bd.ins().brif(ok, continue_bb, &[], exit_bb, &[]);

        self.bd.seal_block(exit_bb);
        self.bd.seal_block(continue_bb);

        self.switch_to_bb(exit_bb);
        cold(self);

        self.switch_to_bb(continue_bb);
    }

    /// Emits the given instruction into the block.
    fn emit(&mut self, ins: Ins) -> Action {
        self.bd
            .set_srcloc(ir::SourceLoc::new(self.executed_instructions));

        let info = match self.tables.dispatch(ins) {
            Handler::Native { emit, .. } => emit(self, ins),
            Handler::Fallback => self.fallback(ins),
        };

        self.ints.unlock_all();
        self.floats.unlock_all();

        self.executed_instructions += 1;
        self.executed_cycles += info.cycles as u32;

        info.action
    }

    /// Emits instructions until one of them ends the block or the iterator is exhausted. Returns
    /// the sequence that was compiled, how many cycles it takes and how many of its instructions
    /// are interpreted.
    pub fn build(mut self, instructions: impl Iterator<Item = Ins>) -> (Sequence, u32, u32) {
        let mut sequence = Sequence::default();
        let mut finished = false;

        for ins in instructions {
            sequence.0.push(ins);
            if self.emit(ins) == Action::Finish {
                finished = true;
                break;
            }
        }

        self.bd.set_srcloc(ir::SourceLoc::new(u32::MAX));
        if !finished {
            // ran out of instructions: resume at the next sequential one
            self.flush_all();
            let pc = self.pc_after(0);
            self.store_pc(pc);

            let instructions = self.ir_value(self.executed_instructions);
            let cycles = self.ir_value(self.executed_cycles);
            let reason = self.ir_value(ExitReason::FallThrough as u8);
            for (value, offset) in [
                (instructions, offset_of!(Info, instructions)),
                (cycles, offset_of!(Info, cycles)),
                (reason, offset_of!(Info, exit)),
            ] {
                self.bd
                    .ins()
                    .store(MEMFLAGS, value, self.consts.info_ptr, offset as i32);
            }

            self.bd.ins().return_(&[]);
        }

        self.bd.finalize();
        (sequence, self.executed_cycles, self.interpreted)
    }
}
