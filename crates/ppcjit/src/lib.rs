//! A block JIT for Gekko PowerPC code, built on cranelift.
//!
//! Guest instructions are dispatched through [`tables`] to native emitters, which keep guest
//! registers in a [`regcache::RegCache`] while a block is being built, or to the fallback bridge,
//! which hands single instructions to an interpreter through the [`hooks::Hooks::interpret`] hook.

mod builder;
mod helpers;
mod module;
mod sequence;

#[cfg(test)]
mod test;

pub mod block;
pub mod hooks;
pub mod regcache;
pub mod tables;

use std::borrow::Cow;
use std::io;
use std::sync::Arc;

use cranelift::codegen::entity::PrimaryMap;
use cranelift::codegen::ir::InstBuilder;
use cranelift::codegen::isa::{CallConv, TargetIsa};
use cranelift::codegen::settings::{Configurable, SetError};
use cranelift::codegen::{self, ir};
use cranelift::{frontend, native};
use easyerr::{Error, ResultExt};
use gekko::disasm::Ins;

use crate::block::{BlockFn, Info, Meta, Trampoline};
use crate::builder::BlockBuilder;
use crate::helpers::Internal;
use crate::hooks::{Context, HookKind, Hooks};
use crate::module::Module;
use crate::tables::Tables;

#[rustfmt::skip]
pub use crate::{
    block::{Block, ExitReason},
    sequence::Sequence,
};

/// Host register budget modelled by the register cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Capacity {
    /// Integer slots (GPRs, CR, XER, LR, CTR).
    pub int: u8,
    /// Float slots, one per FPR lane.
    pub float: u8,
}

impl Default for Capacity {
    fn default() -> Self {
        Self { int: 12, float: 16 }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Hash)]
pub struct CodegenSettings {
    /// Whether to treat `sc` instructions as no-ops.
    pub nop_syscalls: bool,
    /// Whether to ignore the FPU enabled bit in MSR.
    pub force_fpu: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Settings {
    /// Codegen settings
    pub codegen: CodegenSettings,
    /// Register budget of compiled blocks. Handlers which need more registers than this are
    /// routed to the interpreter.
    pub capacity: Capacity,
}

const NAMESPACE_USER_HOOKS: u32 = 0;
const NAMESPACE_INTERNALS: u32 = 1;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("block contains no instructions")]
    EmptyBlock,
    #[error("host machine is not supported: {reason}")]
    UnsupportedHost { reason: &'static str },
    #[error(transparent)]
    Setting { source: SetError },
    #[error("failed to compile block")]
    Codegen {
        source: codegen::CodegenError,
        sequence: Sequence,
        clir: Option<String>,
    },
    #[error("failed to allocate code memory")]
    Alloc { source: io::Error },
    #[error("unresolved external symbol {name}")]
    Unresolved { name: String },
    #[error(transparent)]
    Relocation { source: jitclif::RelocError },
}

/// Compiled machine code, before relocations are applied.
struct Artifact {
    code: Vec<u8>,
    user_named_funcs: PrimaryMap<ir::UserExternalNameRef, ir::UserExternalName>,
    relocs: Vec<codegen::FinalizedMachReloc>,
    disasm: Option<String>,
}

struct Codegen {
    settings: CodegenSettings,
    hooks: Hooks,
    isa: Arc<dyn TargetIsa>,
    module: Module,
    code_ctx: codegen::Context,
}

impl Codegen {
    fn new(
        isa: codegen::isa::Builder,
        settings: CodegenSettings,
        hooks: Hooks,
    ) -> Result<Self, BuildError> {
        let verifier = if cfg!(debug_assertions) {
            "true"
        } else {
            "false"
        };

        let mut codegen = codegen::settings::builder();
        for (name, value) in [
            ("preserve_frame_pointers", "true"),
            ("use_colocated_libcalls", "false"),
            ("unwind_info", "false"),
            ("is_pic", "false"),
            // affect runtime performance
            ("opt_level", "speed"),
            ("enable_verifier", verifier),
            ("enable_alias_analysis", "true"),
            ("regalloc_algorithm", "backtracking"),
            ("regalloc_checker", "false"),
            ("enable_heap_access_spectre_mitigation", "false"),
            ("enable_table_access_spectre_mitigation", "false"),
        ] {
            codegen.set(name, value).context(BuildCtx::Setting)?;
        }

        let flags = codegen::settings::Flags::new(codegen);
        let isa = isa
            .finish(flags)
            .with_context(|_| BuildCtx::Codegen {
                sequence: Sequence::default(),
                clir: None,
            })?;

        Ok(Codegen {
            settings,
            hooks,
            isa,
            module: Module::new(),
            code_ctx: codegen::Context::new(),
        })
    }

    fn block_signature(&self) -> ir::Signature {
        let ptr = self.isa.pointer_type();
        ir::Signature {
            // info, ctx, regs
            params: vec![ir::AbiParam::new(ptr); 3],
            returns: vec![],
            call_conv: CallConv::Tail,
        }
    }

    fn trampoline_signature(&self, call_conv: CallConv) -> ir::Signature {
        let ptr = self.isa.pointer_type();
        ir::Signature {
            // info, ctx, block
            params: vec![ir::AbiParam::new(ptr); 3],
            returns: vec![],
            call_conv,
        }
    }

    /// Compiles a cranelift function in the code context into an artifact.
    fn compile(
        &mut self,
        func: ir::Function,
        disasm: bool,
    ) -> Result<Artifact, codegen::CodegenError> {
        self.code_ctx.clear();
        self.code_ctx.func = func;
        self.code_ctx.want_disasm = disasm;

        let compiled = self
            .code_ctx
            .compile(&*self.isa, &mut Default::default())
            .map_err(|e| e.inner)?;

        let code = compiled.code_buffer().to_owned();
        let relocs = compiled.buffer.relocs().to_owned();
        let disasm = compiled.vcode.clone();

        Ok(Artifact {
            code,
            user_named_funcs: self.code_ctx.func.params.user_named_funcs().clone(),
            relocs,
            disasm,
        })
    }

    /// Address of a user external name.
    fn resolve(&self, name: &ir::UserExternalName) -> Option<usize> {
        match name.namespace {
            NAMESPACE_USER_HOOKS => HookKind::from_repr(name.index).map(|k| self.hooks.address(k)),
            NAMESPACE_INTERNALS => Internal::from_repr(name.index).map(Internal::address),
            _ => None,
        }
    }

    /// Applies all relocations to the given buffer.
    fn apply_relocations(&self, artifact: &mut Artifact) -> Result<(), BuildError> {
        for reloc in &artifact.relocs {
            let codegen::FinalizedRelocTarget::ExternalName(ext_name) = &reloc.target else {
                return Err(BuildError::Unresolved {
                    name: format!("{:?}", reloc.target),
                });
            };

            let addr = match ext_name {
                ir::ExternalName::User(name_ref) => artifact
                    .user_named_funcs
                    .get(*name_ref)
                    .and_then(|name| self.resolve(name)),
                ir::ExternalName::LibCall(libcall) => jitclif::libcall(*libcall),
                _ => None,
            };

            let Some(addr) = addr else {
                return Err(BuildError::Unresolved {
                    name: format!("{ext_name:?}"),
                });
            };

            jitclif::write_relocation(&mut artifact.code, reloc, addr)
                .context(BuildCtx::Relocation)?;
        }

        Ok(())
    }
}

/// A JIT compiler, producing [`Block`]s.
pub struct Jit {
    codegen: Codegen,
    func_ctx: frontend::FunctionBuilderContext,
    tables: Cow<'static, Tables>,
    compiled_count: u64,
    trampoline: Trampoline,
}

impl Jit {
    /// Compiles and returns a trampoline to call blocks.
    fn trampoline(
        codegen: &mut Codegen,
        func_ctx: &mut frontend::FunctionBuilderContext,
    ) -> Result<Trampoline, BuildError> {
        let block_sig = codegen.block_signature();
        let default = codegen.isa.default_call_conv();

        let mut func = ir::Function::new();
        func.signature = codegen.trampoline_signature(default);

        let mut builder = frontend::FunctionBuilder::new(&mut func, func_ctx);
        let entry_bb = builder.create_block();
        builder.append_block_params_for_function_params(entry_bb);
        builder.switch_to_block(entry_bb);
        builder.seal_block(entry_bb);

        let params = builder.block_params(entry_bb);
        let info_ptr = params[0];
        let ctx_ptr = params[1];
        let block_ptr = params[2];
        let ptr_type = codegen.isa.pointer_type();

        // extract regs ptr
        let get_regs_sig = builder.import_signature(Hooks::get_registers_sig(ptr_type, default));
        let get_registers = builder.ins().iconst(
            ptr_type,
            codegen.hooks.address(HookKind::GetRegisters) as i64,
        );
        let inst = builder
            .ins()
            .call_indirect(get_regs_sig, get_registers, &[ctx_ptr]);
        let regs_ptr = builder.inst_results(inst)[0];

        // call the block
        let block_sig = builder.import_signature(block_sig);
        builder
            .ins()
            .call_indirect(block_sig, block_ptr, &[info_ptr, ctx_ptr, regs_ptr]);

        builder.ins().return_(&[]);
        builder.finalize();

        let mut artifact = codegen
            .compile(func, false)
            .with_context(|_| BuildCtx::Codegen {
                sequence: Sequence::default(),
                clir: None,
            })?;

        codegen.apply_relocations(&mut artifact)?;
        let alloc = codegen
            .module
            .allocate_code(&artifact.code)
            .context(BuildCtx::Alloc)?;

        Ok(Trampoline(alloc))
    }

    /// Creates a new [`Jit`] instance with the given ISA.
    pub fn with_isa(
        isa: codegen::isa::Builder,
        settings: Settings,
        hooks: Hooks,
    ) -> Result<Self, BuildError> {
        let mut codegen = Codegen::new(isa, settings.codegen, hooks)?;
        let mut func_ctx = frontend::FunctionBuilderContext::new();
        let trampoline = Self::trampoline(&mut codegen, &mut func_ctx)?;

        let tables = if settings.capacity == Capacity::default() {
            Cow::Borrowed(tables::init())
        } else {
            Cow::Owned(Tables::new(settings.capacity))
        };

        Ok(Self {
            codegen,
            func_ctx,
            tables,
            compiled_count: 0,
            trampoline,
        })
    }

    /// Creates a new [`Jit`] instance with the host's ISA.
    pub fn new(settings: Settings, hooks: Hooks) -> Result<Self, BuildError> {
        let isa = native::builder().map_err(|reason| BuildError::UnsupportedHost { reason })?;
        Self::with_isa(isa, settings, hooks)
    }

    /// The dispatch tables used by this compiler.
    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    /// How many blocks have been compiled so far.
    pub fn compiled_count(&self) -> u64 {
        self.compiled_count
    }

    /// Bytes of code memory mapped so far.
    pub fn code_size(&self) -> usize {
        self.codegen.module.mapped()
    }

    /// Builds a block with the given instructions (up until an instruction that ends the block or
    /// the end of the iterator).
    pub fn build(&mut self, instructions: impl Iterator<Item = Ins>) -> Result<Block, BuildError> {
        let _span = tracing::debug_span!("build", index = self.compiled_count).entered();

        let mut func = ir::Function::new();
        func.signature = self.codegen.block_signature();

        let func_builder = frontend::FunctionBuilder::new(&mut func, &mut self.func_ctx);
        let builder = BlockBuilder::new(&self.codegen, &self.tables, func_builder);

        let (sequence, cycles, interpreted) = builder.build(instructions);
        if sequence.is_empty() {
            return Err(BuildError::EmptyBlock);
        }

        let clir = cfg!(debug_assertions).then(|| func.display().to_string());
        let mut artifact = self
            .codegen
            .compile(func, cfg!(debug_assertions))
            .with_context(|_| BuildCtx::Codegen {
                sequence: sequence.clone(),
                clir: clir.clone(),
            })?;

        self.codegen.apply_relocations(&mut artifact)?;
        let alloc = self
            .codegen
            .module
            .allocate_code(&artifact.code)
            .context(BuildCtx::Alloc)?;

        tracing::trace!(
            len = sequence.len(),
            interpreted,
            size = artifact.code.len(),
            "compiled block"
        );

        let meta = Meta {
            seq: sequence,
            interpreted,
            clir,
            disasm: artifact.disasm,
            cycles,
        };

        self.compiled_count += 1;
        Ok(Block::new(alloc, meta))
    }

    /// Calls the given block with the given context.
    ///
    /// # Safety
    /// `ctx` must match the type expected by the hooks of this JIT context, and `block` must have
    /// been built by this JIT after its last [`reset`](Self::reset).
    pub unsafe fn call(&mut self, ctx: *mut Context, block: BlockFn) -> Info {
        // SAFETY: the exclusive reference to the context guarantees the allocator is not being
        // used, keeping the allocations safe
        unsafe { self.trampoline.call(ctx, block) }
    }

    /// Releases every compiled block and recompiles the trampoline.
    ///
    /// # Safety
    /// No [`Block`] built by this JIT may be called after this.
    pub unsafe fn reset(&mut self) -> Result<(), BuildError> {
        // SAFETY: upheld by the caller
        unsafe { self.codegen.module.reset() };
        self.trampoline = Self::trampoline(&mut self.codegen, &mut self.func_ctx)?;

        Ok(())
    }
}
