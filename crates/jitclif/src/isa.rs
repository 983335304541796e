use cranelift_codegen::isa::{self, LookupError};
use easyerr::{Error, ResultExt};

#[derive(Debug, Error)]
pub enum IsaError {
    #[error(transparent)]
    Lookup { source: LookupError },
}

/// Baseline x86_64, SSE2 only.
pub fn x86_64_v1() -> Result<isa::Builder, IsaError> {
    isa::lookup_by_name("x86_64").context(IsaCtx::Lookup)
}
