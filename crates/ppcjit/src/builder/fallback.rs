use cranelift::codegen::ir;
use cranelift::codegen::ir::InstBuilder;
use gekko::InsExt;
use gekko::disasm::{Ins, ParsedIns};

use super::BlockBuilder;
use crate::builder::{Action, InstructionInfo};

const FALLBACK_INFO: InstructionInfo = InstructionInfo {
    cycles: 2,
    action: Action::Continue,
};

/// Whether the instruction always ends a block when handed to the interpreter, since it may
/// redirect control or change the machine state the block was compiled under.
pub fn ends_block(ins: Ins) -> bool {
    match ins.primary() {
        16..=18 => true,
        19 => matches!(ins.subop10(), 16 | 50 | 150 | 528),
        31 => matches!(ins.subop10(), 146),
        _ => false,
    }
}

impl BlockBuilder<'_> {
    /// Hands the instruction to the interpreter. The register caches are flushed beforehand,
    /// so the interpreter sees (and may modify) the architectural state.
    pub fn fallback(&mut self, ins: Ins) -> InstructionInfo {
        if tracing::enabled!(tracing::Level::TRACE) {
            let mut parsed = ParsedIns::new();
            ins.parse_basic(&mut parsed);
            tracing::trace!("routing {parsed} to the interpreter");
        }

        self.interpreted += 1;
        self.flush_all();

        let pc = self.current_pc();
        self.store_pc(pc);

        let code = self.ir_value(ins.code);
        let inst = self
            .bd
            .ins()
            .call(self.funcs.interpret, &[self.consts.ctx_ptr, code]);
        let outcome = self.bd.inst_results(inst)[0];

        if ends_block(ins) {
            self.write_info(outcome, FALLBACK_INFO);
            self.bd.ins().return_(&[]);

            return InstructionInfo {
                action: Action::Finish,
                ..FALLBACK_INFO
            };
        }

        // non-zero outcomes redirected PC, leave with the outcome as the exit reason
        let exit_bb = self.bd.create_block();
        let continue_bb = self.bd.create_block();

        self.bd.set_cold_block(exit_bb);
        self.bd.ins().brif(outcome, exit_bb, &[], continue_bb, &[]);

        self.bd.seal_block(exit_bb);
        self.bd.seal_block(continue_bb);

        self.switch_to_bb(exit_bb);
        self.write_info(outcome, FALLBACK_INFO);
        self.bd.ins().return_(&[]);

        self.switch_to_bb(continue_bb);
        FALLBACK_INFO
    }
}
