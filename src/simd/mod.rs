//! Four-wide SIMD primitives for the culling pipeline.
//!
//! `Vec4f` and `Vec4i` expose exactly the operation set the rasterizer and
//! the occludee tests depend on: lane arithmetic, bitwise ops, constant
//! shifts, sign-mask extraction, select-on-mask, and i32/f32 conversion.
//! On x86_64 the backend is SSE2 (baseline for the architecture, so no
//! runtime detection is needed); everywhere else a portable array backend
//! with identical semantics is used. Float-to-int conversion rounds to
//! nearest-even in both backends so results do not depend on the backend.

#[cfg(target_arch = "x86_64")]
mod sse2;
#[cfg(target_arch = "x86_64")]
pub use sse2::{Vec4f, Vec4i};

#[cfg(not(target_arch = "x86_64"))]
mod portable;
#[cfg(not(target_arch = "x86_64"))]
pub use portable::{Vec4f, Vec4i};

/// Enable DAZ and FTZ in the MXCSR so denormal depth values flush to zero.
/// Denormal operands near the far plane otherwise stall the quad loop badly.
/// DAZ is bit 6 and FTZ is bit 15, hence the 0x8040 mask.
#[cfg(target_arch = "x86_64")]
pub fn flush_denormals_to_zero() {
    #[allow(deprecated)]
    unsafe {
        use core::arch::x86_64::{_mm_getcsr, _mm_setcsr};
        _mm_setcsr(_mm_getcsr() | 0x8040);
    }
}

#[cfg(not(target_arch = "x86_64"))]
pub fn flush_denormals_to_zero() {}
