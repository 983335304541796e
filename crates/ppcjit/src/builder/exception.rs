use cranelift::codegen::ir;
use cranelift::codegen::ir::InstBuilder;
use gekko::disasm::Ins;
use gekko::{Exception, Reg};

use super::{BlockBuilder, MEMFLAGS};
use crate::block::ExitReason;
use crate::builder::{Action, InstructionInfo};
use crate::helpers::Internal;

const SC_INFO: InstructionInfo = InstructionInfo {
    cycles: 2,
    action: Action::Finish,
};

/// Cost of the instruction that faults when floating point is unavailable.
const FP_UNAVAILABLE_INFO: InstructionInfo = InstructionInfo {
    cycles: 1,
    action: Action::Finish,
};

impl BlockBuilder<'_> {
    /// Raises `exception` and leaves the block. The PC saved in SRR0 is the one of the current
    /// instruction, and `info` describes its cost.
    pub fn raise_and_exit(&mut self, exception: Exception, info: InstructionInfo) {
        tracing::trace!(?exception, "emitting exception exit");

        self.write_back();
        let pc = self.current_pc();
        self.store_pc(pc);

        let exception = self
            .bd
            .ins()
            .iconst(ir::types::I16, exception as u16 as i64);
        self.call_internal(Internal::RaiseException, &[self.consts.regs_ptr, exception]);

        self.exit(ExitReason::Exception, None, info);
    }

    /// Checks whether floating point operations are enabled in MSR and raises an exception if not.
    /// Emitted at most once per block, before the first floating point instruction.
    pub fn check_floats(&mut self) {
        if self.floats_checked || self.codegen.settings.force_fpu {
            return;
        }
        self.floats_checked = true;

        // MSR isn't cached: it can only change through fallback instructions
        let msr = self.bd.ins().load(
            ir::types::I32,
            MEMFLAGS,
            self.consts.regs_ptr,
            Reg::MSR.offset() as i32,
        );
        let fp_enabled = self.get_bit(msr, 13);

        self.side_exit(fp_enabled, |this| {
            this.raise_and_exit(Exception::FloatUnavailable, FP_UNAVAILABLE_INFO);
        });
    }

    pub fn sc(&mut self, _: Ins) -> InstructionInfo {
        if self.codegen.settings.nop_syscalls {
            let next = self.pc_after(1);
            self.exit(ExitReason::FallThrough, Some(next), SC_INFO);
        } else {
            self.raise_and_exit(Exception::Syscall, SC_INFO);
        }

        self.ints.clear();
        self.floats.clear();

        SC_INFO
    }
}
