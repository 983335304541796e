//! The translation block manager: compiles guest code into [`ppcjit`] blocks on first execution,
//! caches them by entry address and retires them when the code they were built from changes.

mod blocks;
mod hooks;

#[cfg(test)]
mod test;

use easyerr::{Error, ResultExt};
use gekko::{Address, Cpu, Exception, Memory};
use ppcjit::block::BlockFn;
use ppcjit::{BuildError, Jit};

use crate::hooks::{Context, Watched};

pub use crate::blocks::Blocks;
pub use ppcjit::{self, ExitReason};

/// Block manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of instructions per block.
    pub instr_per_block: u32,
    /// Bytes of code memory the compiler may map before every block is dropped and the memory
    /// reclaimed.
    pub code_budget: usize,
    /// JIT settings.
    pub jit: ppcjit::Settings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instr_per_block: 64,
            code_budget: 64 * bytesize::MIB as usize,
            jit: ppcjit::Settings::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("failed to create the JIT compiler")]
    Init { source: BuildError },
    #[error("failed to compile block at {addr}")]
    Build { addr: Address, source: BuildError },
    #[error("failed to reset the JIT compiler")]
    Reset { source: BuildError },
}

/// Where and why execution of a block stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exit {
    /// The guest PC to resume at.
    pub pc: Address,
    pub reason: ExitReason,
    /// Instructions executed, including one that raised an exception.
    pub instructions: u32,
    pub cycles: u32,
}

/// Totals of a [`Core::run`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Executed {
    pub instructions: u64,
    pub cycles: u64,
    pub blocks: u64,
}

type ExitCallback = Box<dyn FnMut(Address, ExitReason)>;

/// A JIT driven Gekko core over the memory `M`.
pub struct Core<M: Memory> {
    pub cpu: Cpu,
    pub mem: M,
    config: Config,
    compiler: Jit,
    blocks: Blocks,
    /// Single instruction blocks used by [`Core::step`].
    steps: Blocks,
    pending: Vec<(Address, u32)>,
    on_exit: Option<ExitCallback>,
}

impl<M: Memory> Core<M> {
    pub fn new(config: Config, cpu: Cpu, mem: M) -> Result<Self, CompileError> {
        let compiler = Jit::new(config.jit.clone(), hooks::hooks::<M>()).context(CompileCtx::Init)?;

        Ok(Self {
            cpu,
            mem,
            config,
            compiler,
            blocks: Blocks::default(),
            steps: Blocks::default(),
            pending: Vec::new(),
            on_exit: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The compiled blocks.
    pub fn blocks(&self) -> &Blocks {
        &self.blocks
    }

    /// The single instruction blocks compiled by [`Core::step`].
    pub fn steps(&self) -> &Blocks {
        &self.steps
    }

    /// The JIT compiler.
    pub fn compiler(&self) -> &Jit {
        &self.compiler
    }

    /// Sets a callback invoked with the resume PC and the exit reason whenever a block returns.
    pub fn on_exit(&mut self, callback: impl FnMut(Address, ExitReason) + 'static) {
        self.on_exit = Some(Box::new(callback));
    }

    /// Compiles a block of at most `limit` instructions starting at `addr`. Stops early at the
    /// first instruction that can't be fetched. Returns `None` if not even the first one could.
    fn compile(&mut self, addr: Address, limit: u32) -> Result<Option<ppcjit::Block>, CompileError> {
        let _span = tracing::trace_span!("compiling new block", addr = ?addr).entered();

        let mem = &mut self.mem;
        let mut count = 0;
        let instructions = std::iter::from_fn(|| {
            if count >= limit {
                return None;
            }

            let current = addr + 4 * count;
            let Some(code) = mem.read::<u32>(current) else {
                tracing::debug!("failed to fetch instruction at {current}");
                return None;
            };

            count += 1;
            Some(ppcint::decode(code))
        });

        match self.compiler.build(instructions) {
            Ok(block) => {
                tracing::trace!(instructions = block.len(), "block sequence built");
                Ok(Some(block))
            }
            Err(BuildError::EmptyBlock) => Ok(None),
            Err(source) => Err(CompileError::Build { addr, source }),
        }
    }

    /// Executes the given block, then applies every invalidation queued while it ran.
    fn execute(&mut self, block: BlockFn) -> Exit {
        let mut ctx = Context {
            cpu: &mut self.cpu,
            mem: Watched {
                inner: &mut self.mem,
                blocks: [&self.blocks, &self.steps],
                pending: &mut self.pending,
            },
        };

        // SAFETY: the context matches the hooks the compiler was created with, and the block was
        // built by the compiler after its last reset
        let info = unsafe {
            self.compiler
                .call((&raw mut ctx).cast::<ppcjit::hooks::Context>(), block)
        };

        // the block that just ran may be among these: it is only retired now that it returned
        for (start, len) in self.pending.drain(..) {
            self.blocks.invalidate_range(start, len);
            self.steps.invalidate_range(start, len);
        }

        let exit = Exit {
            pc: self.cpu.pc,
            reason: info.exit_reason(),
            instructions: info.instructions,
            cycles: info.cycles,
        };

        tracing::trace!(?exit, "block returned");
        if let Some(on_exit) = &mut self.on_exit {
            on_exit(exit.pc, exit.reason);
        }

        exit
    }

    /// Raises an ISI for a PC that can't be fetched.
    fn fetch_fault(&mut self) -> Exit {
        tracing::debug!(pc = ?self.cpu.pc, "instruction fetch fault");
        self.cpu.raise_exception(Exception::ISI);

        let exit = Exit {
            pc: self.cpu.pc,
            reason: ExitReason::Exception,
            instructions: 0,
            cycles: 0,
        };

        if let Some(on_exit) = &mut self.on_exit {
            on_exit(exit.pc, exit.reason);
        }

        exit
    }

    /// Drops every block once the compiler went over its code budget. Code of retired blocks
    /// stays mapped until then.
    fn reclaim(&mut self) -> Result<(), CompileError> {
        let size = self.compiler.code_size();
        if size > self.config.code_budget {
            tracing::debug!(
                size = %bytesize::ByteSize(size as u64),
                "code budget exceeded, dropping every block"
            );
            self.clear()?;
        }

        Ok(())
    }

    /// Compiles (if not cached) and executes the block starting at `pc`.
    pub fn compile_and_run(&mut self, pc: Address) -> Result<Exit, CompileError> {
        self.cpu.pc = pc;

        let block = match self.blocks.get(pc) {
            Some(block) => block.as_ptr(),
            None => {
                self.reclaim()?;
                let Some(block) = self.compile(pc, self.config.instr_per_block)? else {
                    return Ok(self.fetch_fault());
                };

                // the code lives in the compiler's arena, moving the handle doesn't move it
                let ptr = block.as_ptr();
                self.blocks.insert(pc, block);
                ptr
            }
        };

        Ok(self.execute(block))
    }

    /// Executes a single instruction at the current PC. Single instruction blocks are cached
    /// apart from regular blocks.
    pub fn step(&mut self) -> Result<Exit, CompileError> {
        let pc = self.cpu.pc;
        let block = match self.steps.get(pc) {
            Some(block) => block.as_ptr(),
            None => {
                self.reclaim()?;
                let Some(block) = self.compile(pc, 1)? else {
                    return Ok(self.fetch_fault());
                };

                let ptr = block.as_ptr();
                self.steps.insert(pc, block);
                ptr
            }
        };

        Ok(self.execute(block))
    }

    /// Executes blocks starting at the current PC until at least `instructions` instructions were
    /// executed or no progress can be made. The last block may overshoot.
    pub fn run(&mut self, instructions: u64) -> Result<Executed, CompileError> {
        let mut executed = Executed::default();
        let mut faulted = false;
        while executed.instructions < instructions {
            let exit = self.compile_and_run(self.cpu.pc)?;
            executed.instructions += exit.instructions as u64;
            executed.cycles += exit.cycles as u64;
            executed.blocks += 1;

            if exit.instructions == 0 {
                // the exception vector can't be fetched either
                if faulted {
                    break;
                }

                faulted = true;
            } else {
                faulted = false;
            }
        }

        Ok(executed)
    }

    /// Discards every block whose code intersects the `len` bytes at `start`.
    pub fn invalidate_range(&mut self, start: Address, len: u32) {
        let count =
            self.blocks.invalidate_range(start, len) + self.steps.invalidate_range(start, len);
        tracing::debug!(?start, len, count, "invalidated range");
    }

    /// Returns the register file for inspection. Blocks write every cached register back before
    /// returning, so between blocks it is always up to date.
    pub fn flush_register_cache(&self) -> &Cpu {
        &self.cpu
    }

    /// Drops every block and releases their code.
    pub fn clear(&mut self) -> Result<(), CompileError> {
        self.blocks.clear();
        self.steps.clear();
        self.pending.clear();

        // SAFETY: every block was dropped above
        unsafe { self.compiler.reset() }.context(CompileCtx::Reset)
    }
}
