use cranelift::codegen::ir;
use cranelift::prelude::InstBuilder;
use gekko::disasm::Ins;
use gekko::InsExt;

use super::BlockBuilder;
use crate::block::ExitReason;
use crate::builder::{Action, InstructionInfo};
use crate::helpers::Internal;

const LOAD_INFO: InstructionInfo = InstructionInfo {
    cycles: 2,
    action: Action::Continue,
};

const STORE_INFO: InstructionInfo = InstructionInfo {
    cycles: 2,
    action: Action::Continue,
};

const INV_ICACHE_INFO: InstructionInfo = InstructionInfo {
    cycles: 4,
    action: Action::Finish,
};

/// Width of a memory access performed through the memory hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Width {
    Word,
    Double,
}

impl Width {
    fn ir_type(self) -> ir::Type {
        match self {
            Width::Word => ir::types::I32,
            Width::Double => ir::types::I64,
        }
    }
}

/// Addressing mode of a floating point load or store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// `rA|0 + d`
    Imm,
    /// `rA + d`, then `rA` is updated.
    ImmUpdate,
    /// `rA|0 + rB`
    Idx,
    /// `rA + rB`, then `rA` is updated.
    IdxUpdate,
}

impl Mode {
    fn updates(self) -> bool {
        matches!(self, Mode::ImmUpdate | Mode::IdxUpdate)
    }
}

impl BlockBuilder<'_> {
    fn effective_address(&mut self, ins: Ins, mode: Mode) -> ir::Value {
        let base = if mode.updates() {
            self.get(ins.gpr_a())
        } else {
            self.gpr_or_zero(ins.gpr_a())
        };

        match mode {
            Mode::Imm | Mode::ImmUpdate => self.bd.ins().iadd_imm(base, ins.simm() as i64),
            Mode::Idx | Mode::IdxUpdate => {
                let offset = self.get(ins.gpr_b());
                self.bd.ins().iadd(base, offset)
            }
        }
    }

    /// Raises a DSI for `addr` if `success` (an I8) is zero.
    fn check_access(&mut self, success: ir::Value, addr: ir::Value, store: bool) {
        let info = if store { STORE_INFO } else { LOAD_INFO };
        self.side_exit(success, |this| {
            tracing::trace!(store, "emitting data storage exit");

            let pc = this.current_pc();
            this.store_pc(pc);

            let store = this.ir_value(store);
            this.call_internal(Internal::RaiseDsi, &[this.consts.regs_ptr, addr, store]);

            this.exit(ExitReason::Exception, None, info);
        });
    }

    /// Reads a value of the given width through the memory hooks.
    fn mem_read(&mut self, addr: ir::Value, width: Width) -> ir::Value {
        let hook = match width {
            Width::Word => self.funcs.read_i32,
            Width::Double => self.funcs.read_i64,
        };

        let slot_ptr =
            self.bd
                .ins()
                .stack_addr(self.consts.ptr_type, self.consts.read_stack_slot, 0);
        let inst = self
            .bd
            .ins()
            .call(hook, &[self.consts.ctx_ptr, addr, slot_ptr]);
        let success = self.bd.inst_results(inst)[0];

        self.check_access(success, addr, false);

        self.bd
            .ins()
            .stack_load(width.ir_type(), self.consts.read_stack_slot, 0)
    }

    /// Writes a value of the given width through the memory hooks.
    fn mem_write(&mut self, addr: ir::Value, value: ir::Value, width: Width) {
        let hook = match width {
            Width::Word => self.funcs.write_i32,
            Width::Double => self.funcs.write_i64,
        };

        let inst = self
            .bd
            .ins()
            .call(hook, &[self.consts.ctx_ptr, addr, value]);
        let success = self.bd.inst_results(inst)[0];

        self.check_access(success, addr, true);
    }

    fn load_float(&mut self, ins: Ins, mode: Mode, width: Width) -> InstructionInfo {
        self.check_floats();

        let addr = self.effective_address(ins, mode);
        let raw = self.mem_read(addr, width);

        match width {
            Width::Word => {
                let value = self.call_internal_value(Internal::LoadSingle, &[raw]);
                self.set_pair(ins.fpr_d(), [value, value]);
            }
            Width::Double => {
                let value = self.bd.ins().bitcast(ir::types::F64, ir::MemFlags::new(), raw);
                self.set_lane(ins.fpr_d(), 0, value);
            }
        }

        if mode.updates() {
            self.set(ins.gpr_a(), addr);
        }

        LOAD_INFO
    }

    fn store_float(&mut self, ins: Ins, mode: Mode, width: Width) -> InstructionInfo {
        self.check_floats();

        let addr = self.effective_address(ins, mode);
        let value = self.get_lane(ins.fpr_s(), 0);
        let raw = match width {
            Width::Word => self.call_internal_value(Internal::StoreSingle, &[value]),
            Width::Double => self.bd.ins().bitcast(ir::types::I64, ir::MemFlags::new(), value),
        };

        self.mem_write(addr, raw, width);

        if mode.updates() {
            self.set(ins.gpr_a(), addr);
        }

        STORE_INFO
    }

    pub fn lfs(&mut self, ins: Ins) -> InstructionInfo {
        self.load_float(ins, Mode::Imm, Width::Word)
    }

    pub fn lfsu(&mut self, ins: Ins) -> InstructionInfo {
        self.load_float(ins, Mode::ImmUpdate, Width::Word)
    }

    pub fn lfsx(&mut self, ins: Ins) -> InstructionInfo {
        self.load_float(ins, Mode::Idx, Width::Word)
    }

    pub fn lfsux(&mut self, ins: Ins) -> InstructionInfo {
        self.load_float(ins, Mode::IdxUpdate, Width::Word)
    }

    pub fn lfd(&mut self, ins: Ins) -> InstructionInfo {
        self.load_float(ins, Mode::Imm, Width::Double)
    }

    pub fn lfdu(&mut self, ins: Ins) -> InstructionInfo {
        self.load_float(ins, Mode::ImmUpdate, Width::Double)
    }

    pub fn lfdx(&mut self, ins: Ins) -> InstructionInfo {
        self.load_float(ins, Mode::Idx, Width::Double)
    }

    pub fn lfdux(&mut self, ins: Ins) -> InstructionInfo {
        self.load_float(ins, Mode::IdxUpdate, Width::Double)
    }

    pub fn stfs(&mut self, ins: Ins) -> InstructionInfo {
        self.store_float(ins, Mode::Imm, Width::Word)
    }

    pub fn stfsu(&mut self, ins: Ins) -> InstructionInfo {
        self.store_float(ins, Mode::ImmUpdate, Width::Word)
    }

    pub fn stfsx(&mut self, ins: Ins) -> InstructionInfo {
        self.store_float(ins, Mode::Idx, Width::Word)
    }

    pub fn stfsux(&mut self, ins: Ins) -> InstructionInfo {
        self.store_float(ins, Mode::IdxUpdate, Width::Word)
    }

    pub fn stfd(&mut self, ins: Ins) -> InstructionInfo {
        self.store_float(ins, Mode::Imm, Width::Double)
    }

    pub fn stfdu(&mut self, ins: Ins) -> InstructionInfo {
        self.store_float(ins, Mode::ImmUpdate, Width::Double)
    }

    pub fn stfdx(&mut self, ins: Ins) -> InstructionInfo {
        self.store_float(ins, Mode::Idx, Width::Double)
    }

    pub fn stfdux(&mut self, ins: Ins) -> InstructionInfo {
        self.store_float(ins, Mode::IdxUpdate, Width::Double)
    }

    pub fn stfiwx(&mut self, ins: Ins) -> InstructionInfo {
        self.check_floats();

        let addr = self.effective_address(ins, Mode::Idx);
        let value = self.get_lane(ins.fpr_s(), 0);
        let bits = self.bd.ins().bitcast(ir::types::I64, ir::MemFlags::new(), value);
        let word = self.bd.ins().ireduce(ir::types::I32, bits);

        self.mem_write(addr, word, Width::Word);

        STORE_INFO
    }

    /// Invalidates the instruction cache block containing the effective address and leaves the
    /// block, since the rest of it may have been modified.
    pub fn icbi(&mut self, ins: Ins) -> InstructionInfo {
        let addr = self.effective_address(ins, Mode::Idx);
        self.bd
            .ins()
            .call(self.funcs.inv_icache, &[self.consts.ctx_ptr, addr]);

        let next = self.pc_after(1);
        self.exit(ExitReason::FallThrough, Some(next), INV_ICACHE_INFO);

        self.ints.clear();
        self.floats.clear();

        INV_ICACHE_INFO
    }
}

