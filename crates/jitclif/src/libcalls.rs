use cranelift_codegen::ir;

extern "C" fn floor_f32(x: f32) -> f32 {
    x.floor()
}

extern "C" fn floor_f64(x: f64) -> f64 {
    x.floor()
}

extern "C" fn ceil_f32(x: f32) -> f32 {
    x.ceil()
}

extern "C" fn ceil_f64(x: f64) -> f64 {
    x.ceil()
}

extern "C" fn trunc_f32(x: f32) -> f32 {
    x.trunc()
}

extern "C" fn trunc_f64(x: f64) -> f64 {
    x.trunc()
}

// `nearest` rounds half to even, unlike `f64::round`
extern "C" fn nearest_f32(x: f32) -> f32 {
    x.round_ties_even()
}

extern "C" fn nearest_f64(x: f64) -> f64 {
    x.round_ties_even()
}

extern "C" fn fma_f32(a: f32, b: f32, c: f32) -> f32 {
    a.mul_add(b, c)
}

extern "C" fn fma_f64(a: f64, b: f64, c: f64) -> f64 {
    a.mul_add(b, c)
}

/// Address of the host implementation of `libcall`, if there is one.
pub fn get(libcall: ir::LibCall) -> Option<usize> {
    macro_rules! fn_addr {
        ($fn:expr) => {
            ($fn as *const () as usize)
        };
    }

    Some(match libcall {
        ir::LibCall::CeilF32 => fn_addr!(ceil_f32),
        ir::LibCall::CeilF64 => fn_addr!(ceil_f64),
        ir::LibCall::FloorF32 => fn_addr!(floor_f32),
        ir::LibCall::FloorF64 => fn_addr!(floor_f64),
        ir::LibCall::TruncF32 => fn_addr!(trunc_f32),
        ir::LibCall::TruncF64 => fn_addr!(trunc_f64),
        ir::LibCall::NearestF32 => fn_addr!(nearest_f32),
        ir::LibCall::NearestF64 => fn_addr!(nearest_f64),
        ir::LibCall::FmaF32 => fn_addr!(fma_f32),
        ir::LibCall::FmaF64 => fn_addr!(fma_f64),
        ir::LibCall::Memcpy => fn_addr!(libc::memcpy),
        ir::LibCall::Memset => fn_addr!(libc::memset),
        ir::LibCall::Memmove => fn_addr!(libc::memmove),
        ir::LibCall::Memcmp => fn_addr!(libc::memcmp),
        _ => return None,
    })
}
