//! SSE2 backend. SSE2 is part of the x86_64 baseline, so these wrappers
//! need no feature detection. Instructions that only exist in SSE4.1
//! (`pmulld`, `pminsd`, `pmaxsd`) are emulated with SSE2 sequences.

use core::arch::x86_64::*;
use std::ops::{Add, BitAnd, BitOr, BitXor, Div, Mul, Sub};

/// Four f32 lanes in one SSE register.
#[derive(Copy, Clone)]
pub struct Vec4f(__m128);

/// Four i32 lanes in one SSE register.
#[derive(Copy, Clone)]
pub struct Vec4i(__m128i);

impl Vec4f {
    #[inline(always)]
    pub fn splat(v: f32) -> Self {
        unsafe { Self(_mm_set1_ps(v)) }
    }

    #[inline(always)]
    pub fn zero() -> Self {
        unsafe { Self(_mm_setzero_ps()) }
    }

    #[inline(always)]
    pub fn from_array(a: [f32; 4]) -> Self {
        unsafe { Self(_mm_loadu_ps(a.as_ptr())) }
    }

    #[inline(always)]
    pub fn to_array(self) -> [f32; 4] {
        let mut out = [0.0f32; 4];
        unsafe { _mm_storeu_ps(out.as_mut_ptr(), self.0) };
        out
    }

    /// Load four consecutive floats. Caller guarantees `ptr` is valid for
    /// four reads.
    #[inline(always)]
    pub unsafe fn load(ptr: *const f32) -> Self {
        Self(_mm_loadu_ps(ptr))
    }

    /// Store four consecutive floats. Caller guarantees `ptr` is valid for
    /// four writes.
    #[inline(always)]
    pub unsafe fn store(self, ptr: *mut f32) {
        _mm_storeu_ps(ptr, self.0);
    }

    #[inline(always)]
    pub fn min(self, other: Self) -> Self {
        unsafe { Self(_mm_min_ps(self.0, other.0)) }
    }

    #[inline(always)]
    pub fn max(self, other: Self) -> Self {
        unsafe { Self(_mm_max_ps(self.0, other.0)) }
    }

    /// Four sign bits, lane 0 in bit 0.
    #[inline(always)]
    pub fn movemask(self) -> i32 {
        unsafe { _mm_movemask_ps(self.0) }
    }

    /// Lane-wise merge: where `mask`'s sign bit is set take `b`, else `a`.
    #[inline(always)]
    pub fn select(a: Self, b: Self, mask: Vec4i) -> Self {
        unsafe {
            let m = _mm_castsi128_ps(_mm_srai_epi32::<31>(mask.0));
            Self(_mm_or_ps(_mm_and_ps(m, b.0), _mm_andnot_ps(m, a.0)))
        }
    }

    /// Convert to i32 lanes, rounding to nearest even.
    #[inline(always)]
    pub fn round_to_i32(self) -> Vec4i {
        unsafe { Vec4i(_mm_cvtps_epi32(self.0)) }
    }

    #[inline(always)]
    pub fn cmp_lt(self, other: Self) -> Vec4i {
        unsafe { Vec4i(_mm_castps_si128(_mm_cmplt_ps(self.0, other.0))) }
    }

    #[inline(always)]
    pub fn cmp_le(self, other: Self) -> Vec4i {
        unsafe { Vec4i(_mm_castps_si128(_mm_cmple_ps(self.0, other.0))) }
    }

    #[inline(always)]
    pub fn cmp_gt(self, other: Self) -> Vec4i {
        unsafe { Vec4i(_mm_castps_si128(_mm_cmpgt_ps(self.0, other.0))) }
    }

    /// All four lanes set to the f32 sign bit pattern.
    #[inline(always)]
    pub fn sign_bit_mask() -> Self {
        unsafe { Self(_mm_castsi128_ps(_mm_set1_epi32(i32::MIN))) }
    }

    /// Reinterpret integer lanes as float bit patterns.
    #[inline(always)]
    pub fn from_bits(bits: Vec4i) -> Self {
        unsafe { Self(_mm_castsi128_ps(bits.0)) }
    }

    /// Horizontal minimum of the four lanes.
    #[inline(always)]
    pub fn min_lane(self) -> f32 {
        let a = self.to_array();
        a[0].min(a[1]).min(a[2].min(a[3]))
    }
}

impl Add for Vec4f {
    type Output = Self;
    #[inline(always)]
    fn add(self, rhs: Self) -> Self {
        unsafe { Self(_mm_add_ps(self.0, rhs.0)) }
    }
}

impl Sub for Vec4f {
    type Output = Self;
    #[inline(always)]
    fn sub(self, rhs: Self) -> Self {
        unsafe { Self(_mm_sub_ps(self.0, rhs.0)) }
    }
}

impl Mul for Vec4f {
    type Output = Self;
    #[inline(always)]
    fn mul(self, rhs: Self) -> Self {
        unsafe { Self(_mm_mul_ps(self.0, rhs.0)) }
    }
}

impl Div for Vec4f {
    type Output = Self;
    #[inline(always)]
    fn div(self, rhs: Self) -> Self {
        unsafe { Self(_mm_div_ps(self.0, rhs.0)) }
    }
}

impl BitAnd for Vec4f {
    type Output = Self;
    #[inline(always)]
    fn bitand(self, rhs: Self) -> Self {
        unsafe { Self(_mm_and_ps(self.0, rhs.0)) }
    }
}

impl BitOr for Vec4f {
    type Output = Self;
    #[inline(always)]
    fn bitor(self, rhs: Self) -> Self {
        unsafe { Self(_mm_or_ps(self.0, rhs.0)) }
    }
}

impl BitXor for Vec4f {
    type Output = Self;
    #[inline(always)]
    fn bitxor(self, rhs: Self) -> Self {
        unsafe { Self(_mm_xor_ps(self.0, rhs.0)) }
    }
}

impl Vec4i {
    #[inline(always)]
    pub fn splat(v: i32) -> Self {
        unsafe { Self(_mm_set1_epi32(v)) }
    }

    #[inline(always)]
    pub fn zero() -> Self {
        unsafe { Self(_mm_setzero_si128()) }
    }

    #[inline(always)]
    pub fn from_array(a: [i32; 4]) -> Self {
        unsafe { Self(_mm_loadu_si128(a.as_ptr() as *const __m128i)) }
    }

    #[inline(always)]
    pub fn to_array(self) -> [i32; 4] {
        let mut out = [0i32; 4];
        unsafe { _mm_storeu_si128(out.as_mut_ptr() as *mut __m128i, self.0) };
        out
    }

    #[inline(always)]
    pub fn shl<const N: i32>(self) -> Self {
        unsafe { Self(_mm_slli_epi32::<N>(self.0)) }
    }

    #[inline(always)]
    pub fn shr_arithmetic<const N: i32>(self) -> Self {
        unsafe { Self(_mm_srai_epi32::<N>(self.0)) }
    }

    #[inline(always)]
    pub fn shr_logical<const N: i32>(self) -> Self {
        unsafe { Self(_mm_srli_epi32::<N>(self.0)) }
    }

    #[inline(always)]
    pub fn min(self, other: Self) -> Self {
        unsafe {
            let gt = _mm_cmpgt_epi32(self.0, other.0);
            Self(_mm_or_si128(
                _mm_and_si128(gt, other.0),
                _mm_andnot_si128(gt, self.0),
            ))
        }
    }

    #[inline(always)]
    pub fn max(self, other: Self) -> Self {
        unsafe {
            let gt = _mm_cmpgt_epi32(self.0, other.0);
            Self(_mm_or_si128(
                _mm_and_si128(gt, self.0),
                _mm_andnot_si128(gt, other.0),
            ))
        }
    }

    #[inline(always)]
    pub fn cmp_gt(self, other: Self) -> Self {
        unsafe { Self(_mm_cmpgt_epi32(self.0, other.0)) }
    }

    /// Four sign bits, lane 0 in bit 0.
    #[inline(always)]
    pub fn movemask(self) -> i32 {
        unsafe { _mm_movemask_ps(_mm_castsi128_ps(self.0)) }
    }

    #[inline(always)]
    pub fn is_all_negative(self) -> bool {
        self.movemask() == 0b1111
    }

    #[inline(always)]
    pub fn to_f32(self) -> Vec4f {
        unsafe { Vec4f(_mm_cvtepi32_ps(self.0)) }
    }
}

impl Add for Vec4i {
    type Output = Self;
    #[inline(always)]
    fn add(self, rhs: Self) -> Self {
        unsafe { Self(_mm_add_epi32(self.0, rhs.0)) }
    }
}

impl Sub for Vec4i {
    type Output = Self;
    #[inline(always)]
    fn sub(self, rhs: Self) -> Self {
        unsafe { Self(_mm_sub_epi32(self.0, rhs.0)) }
    }
}

impl Mul for Vec4i {
    type Output = Self;
    /// 32-bit low multiply. `pmulld` is SSE4.1, so build it from the two
    /// 32x32->64 even-lane multiplies SSE2 does have.
    #[inline(always)]
    fn mul(self, rhs: Self) -> Self {
        unsafe {
            let even = _mm_mul_epu32(self.0, rhs.0);
            let odd = _mm_mul_epu32(
                _mm_srli_si128::<4>(self.0),
                _mm_srli_si128::<4>(rhs.0),
            );
            // _MM_SHUFFLE(0, 0, 2, 0): pack the low dwords of lanes 0/2
            // (resp. 1/3) into the bottom half, then interleave.
            let even32 = _mm_shuffle_epi32::<0b0000_1000>(even);
            let odd32 = _mm_shuffle_epi32::<0b0000_1000>(odd);
            Self(_mm_unpacklo_epi32(even32, odd32))
        }
    }
}

impl BitAnd for Vec4i {
    type Output = Self;
    #[inline(always)]
    fn bitand(self, rhs: Self) -> Self {
        unsafe { Self(_mm_and_si128(self.0, rhs.0)) }
    }
}

impl BitOr for Vec4i {
    type Output = Self;
    #[inline(always)]
    fn bitor(self, rhs: Self) -> Self {
        unsafe { Self(_mm_or_si128(self.0, rhs.0)) }
    }
}

impl BitXor for Vec4i {
    type Output = Self;
    #[inline(always)]
    fn bitxor(self, rhs: Self) -> Self {
        unsafe { Self(_mm_xor_si128(self.0, rhs.0)) }
    }
}
