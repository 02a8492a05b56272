//! Validity oracle over the GEMM parameter space
//!
//! Maps a `(parameters, device, operand description)` triple to `VALID` or
//! the first failed rule, as a negative code the tuner can filter on. The
//! oracle is a pure function; it never touches the device, only its
//! capability record.
//!
//! The full historical code table −1..−18 is carried so tuner outputs stay
//! comparable across engine versions; a few codes (−5, −10, −13) belong to
//! fetch schedules this engine no longer emits and are never returned by
//! [`check`].

use crate::driver::Device;
use crate::expr::Dtype;
use crate::params::{FetchingPolicy, GemmParameters, Trans};

/// The code returned for a parameter point that passes every rule.
pub const VALID: i32 = 0;

/// One failed validity rule, carrying its historical negative code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InvalidKernel {
    /// −1: shared-memory panels exceed the device's local memory.
    #[error("local memory usage exceeds the device limit")]
    LocalMemoryOverflow,
    /// −2: work-group thread count exceeds the device limit.
    #[error("work-group size exceeds the device limit")]
    WorkGroupSizeOverflow,
    /// −3: first work-group extent exceeds the device limit.
    #[error("local size 0 exceeds the device limit")]
    LocalSize0Overflow,
    /// −4: second work-group extent exceeds the device limit.
    #[error("local size 1 exceeds the device limit")]
    LocalSize1Overflow,
    /// −5: third work-group extent exceeds the device limit (historical).
    #[error("local size 2 exceeds the device limit")]
    LocalSize2Overflow,
    /// −6: thread count is not a warp/wavefront multiple.
    #[error("work-group size is not a multiple of the warp size")]
    LocalSizeNotWarpMultiple,
    /// −7: vector width outside {1, 2, 4, 8}.
    #[error("invalid simd width")]
    InvalidSimdWidth,
    /// −8: a work-group tile extent exceeds 256.
    #[error("work-group tile exceeds the 256-element bound")]
    BlockSizeTooLarge,
    /// −9: a fetch schedule other than shared-memory staging.
    #[error("unsupported fetching policy")]
    InvalidFetchingPolicy,
    /// −10: direct-from-global fetch with a nonzero local-fetch geometry
    /// (historical).
    #[error("global fetching requires a zero local-fetch geometry")]
    GlobalMemoryRequiresZeroLocalFetch,
    /// −11: a register-tile extent is not a simd-width multiple.
    #[error("mS and nS must be multiples of the simd width")]
    MsNsMustBeSimdWidthMultiple,
    /// −12: the K register tile does not subdivide the K shared tile.
    #[error("kS must be smaller than kL and divide it")]
    KsMustBeSmallerThanKl,
    /// −13: the device requires scalar accesses here (historical).
    #[error("simd width must be one")]
    SimdWidthMustBeOne,
    /// −14: cooperative-copy geometry does not cover the work-group.
    #[error("local fetch product must match the local size product")]
    LocalFetchProductMustMatchLocalSizeProduct,
    /// −15: first copy extent does not divide the K tile.
    #[error("local fetch 0 must divide the K tile")]
    LocalFetch0MustBeKlMultiple,
    /// −16: first copy extent does not divide the spatial tile.
    #[error("local fetch 0 must divide the spatial tile")]
    LocalFetch0MustBeNlMultiple,
    /// −17: second copy extent does not divide the K tile.
    #[error("local fetch 1 must divide the K tile")]
    LocalFetch1MustBeKlMultiple,
    /// −18: second copy extent does not divide the spatial tile.
    #[error("local fetch 1 must divide the spatial tile")]
    LocalFetch1MustBeMlMultiple,
}

impl InvalidKernel {
    /// The negative code observed by the tuner.
    pub fn code(self) -> i32 {
        match self {
            InvalidKernel::LocalMemoryOverflow => -1,
            InvalidKernel::WorkGroupSizeOverflow => -2,
            InvalidKernel::LocalSize0Overflow => -3,
            InvalidKernel::LocalSize1Overflow => -4,
            InvalidKernel::LocalSize2Overflow => -5,
            InvalidKernel::LocalSizeNotWarpMultiple => -6,
            InvalidKernel::InvalidSimdWidth => -7,
            InvalidKernel::BlockSizeTooLarge => -8,
            InvalidKernel::InvalidFetchingPolicy => -9,
            InvalidKernel::GlobalMemoryRequiresZeroLocalFetch => -10,
            InvalidKernel::MsNsMustBeSimdWidthMultiple => -11,
            InvalidKernel::KsMustBeSmallerThanKl => -12,
            InvalidKernel::SimdWidthMustBeOne => -13,
            InvalidKernel::LocalFetchProductMustMatchLocalSizeProduct => -14,
            InvalidKernel::LocalFetch0MustBeKlMultiple => -15,
            InvalidKernel::LocalFetch0MustBeNlMultiple => -16,
            InvalidKernel::LocalFetch1MustBeKlMultiple => -17,
            InvalidKernel::LocalFetch1MustBeMlMultiple => -18,
        }
    }
}

/// Check one parameter point against the rule list; the first failure wins.
pub fn check(
    p: &GemmParameters,
    device: &Device,
    dtype: Dtype,
    a_trans: Trans,
    b_trans: Trans,
) -> Result<(), InvalidKernel> {
    // 1. Only the shared-memory staging path is emitted.
    if p.a_fetching_policy != FetchingPolicy::Local
        || p.b_fetching_policy != FetchingPolicy::Local
    {
        return Err(InvalidKernel::InvalidFetchingPolicy);
    }

    // 2. Vector width and register-tile divisibility.
    if !matches!(p.simd_width, 1 | 2 | 4 | 8) {
        return Err(InvalidKernel::InvalidSimdWidth);
    }
    if p.ms % p.simd_width != 0 || p.ns % p.simd_width != 0 {
        return Err(InvalidKernel::MsNsMustBeSimdWidthMultiple);
    }

    // 3. Work-group tile bound.
    if p.ml > 256 || p.nl > 256 {
        return Err(InvalidKernel::BlockSizeTooLarge);
    }

    // 4. The inner loop walks 0..kL in steps of kS with unrolled bodies,
    // so kS must strictly subdivide kL.
    if p.ks == 0 || p.ks >= p.kl || p.kl % p.ks != 0 {
        return Err(InvalidKernel::KsMustBeSmallerThanKl);
    }

    // 5. The cooperative copy uses every thread exactly once.
    if p.local_fetch_0 * p.local_fetch_1 != p.local_size_0 * p.local_size_1 {
        return Err(InvalidKernel::LocalFetchProductMustMatchLocalSizeProduct);
    }

    // 6. Copy geometry must tile each staged operand panel.
    {
        let (bound0, bound1) = match a_trans {
            Trans::N => (p.ml, p.kl),
            Trans::T => (p.kl, p.ml),
        };
        if p.local_fetch_1 > 0 && bound1 % p.local_fetch_1 != 0 {
            return Err(match a_trans {
                Trans::N => InvalidKernel::LocalFetch1MustBeKlMultiple,
                Trans::T => InvalidKernel::LocalFetch1MustBeMlMultiple,
            });
        }
        if p.local_fetch_0 > 0 && bound0 % (p.local_fetch_0 * p.simd_width) != 0 {
            return Err(match a_trans {
                Trans::N => InvalidKernel::LocalFetch0MustBeNlMultiple,
                Trans::T => InvalidKernel::LocalFetch0MustBeKlMultiple,
            });
        }
    }
    {
        let (bound0, bound1) = match b_trans {
            Trans::T => (p.nl, p.kl),
            Trans::N => (p.kl, p.nl),
        };
        if p.local_fetch_1 > 0 && bound1 % p.local_fetch_1 != 0 {
            return Err(match b_trans {
                Trans::T => InvalidKernel::LocalFetch1MustBeKlMultiple,
                Trans::N => InvalidKernel::LocalFetch1MustBeMlMultiple,
            });
        }
        if p.local_fetch_0 > 0 && bound0 % (p.local_fetch_0 * p.simd_width) != 0 {
            return Err(match b_trans {
                Trans::T => InvalidKernel::LocalFetch0MustBeNlMultiple,
                Trans::N => InvalidKernel::LocalFetch0MustBeKlMultiple,
            });
        }
    }

    // 7. Device limits.
    let lmem = (p.kl * p.ml + p.kl * p.nl) as usize * dtype.size_of();
    if lmem > device.local_mem_size() {
        return Err(InvalidKernel::LocalMemoryOverflow);
    }
    let sizes = device.max_work_item_sizes();
    if p.local_size_0 as usize > sizes[0] {
        return Err(InvalidKernel::LocalSize0Overflow);
    }
    if p.local_size_1 as usize > sizes[1] {
        return Err(InvalidKernel::LocalSize1Overflow);
    }
    let threads = p.num_threads();
    if threads as usize > device.max_work_group_size() {
        return Err(InvalidKernel::WorkGroupSizeOverflow);
    }
    if threads % device.warp_size() != 0 {
        return Err(InvalidKernel::LocalSizeNotWarpMultiple);
    }

    Ok(())
}

/// Tuner-facing form of [`check`]: `0` or the first failed rule's code.
pub fn is_invalid(
    p: &GemmParameters,
    device: &Device,
    dtype: Dtype,
    a_trans: Trans,
    b_trans: Trans,
) -> i32 {
    match check(p, device, dtype, a_trans, b_trans) {
        Ok(()) => VALID,
        Err(e) => e.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scalar staging geometry: 8×8 threads, 8×8 copy, 32×32 tiles, kL = 8.
    fn valid_point() -> GemmParameters {
        GemmParameters::new(
            1,
            8,
            8,
            8,
            1,
            4,
            4,
            4,
            FetchingPolicy::Local,
            FetchingPolicy::Local,
            8,
            8,
        )
    }

    /// Vectorized geometry: simd 4, 8×8 threads, 2×32 copy, kL = 32.
    fn valid_simd4_point() -> GemmParameters {
        GemmParameters::new(
            4,
            8,
            32,
            8,
            1,
            4,
            4,
            4,
            FetchingPolicy::Local,
            FetchingPolicy::Local,
            2,
            32,
        )
    }

    fn code(p: &GemmParameters) -> i32 {
        is_invalid(p, &Device::host(), Dtype::F32, Trans::N, Trans::N)
    }

    #[test]
    fn reference_points_are_valid() {
        assert_eq!(code(&valid_point()), VALID);
        assert_eq!(code(&valid_simd4_point()), VALID);
        // The TN geometry of a larger vectorized point.
        let p = GemmParameters::new(
            4,
            16,
            16,
            16,
            1,
            4,
            4,
            4,
            FetchingPolicy::Local,
            FetchingPolicy::Local,
            4,
            64,
        );
        assert_eq!(
            is_invalid(&p, &Device::host(), Dtype::F32, Trans::T, Trans::N),
            VALID
        );
    }

    #[test]
    fn each_rule_reports_its_code() {
        let mut p = valid_point();
        p.b_fetching_policy = FetchingPolicy::GlobalStrided;
        assert_eq!(code(&p), -9);

        let mut p = valid_point();
        p.simd_width = 3;
        assert_eq!(code(&p), -7);

        let mut p = valid_simd4_point();
        p.ms = 6; // not a multiple of simd_width = 4
        assert_eq!(code(&p), -11);

        // 512-wide tile exceeds the 256 bound.
        let p = GemmParameters::new(
            4,
            32,
            8,
            8,
            1,
            16,
            4,
            4,
            FetchingPolicy::Local,
            FetchingPolicy::Local,
            16,
            16,
        );
        assert_eq!(code(&p), -8);

        let mut p = valid_point();
        p.ks = 8; // equal to kl
        assert_eq!(code(&p), -12);
        p.ks = 3; // smaller but does not divide kl = 8
        assert_eq!(code(&p), -12);

        let mut p = valid_point();
        p.local_fetch_0 = 4; // 4·8 ≠ 8·8
        assert_eq!(code(&p), -14);

        // bound1 = kL = 8 not divisible by lf1 = 16 (the product rule stays
        // satisfied with lf0 = 4).
        let p = GemmParameters::new(
            1,
            8,
            8,
            8,
            1,
            4,
            4,
            4,
            FetchingPolicy::Local,
            FetchingPolicy::Local,
            4,
            16,
        );
        assert_eq!(code(&p), -17);
    }

    #[test]
    fn odd_register_tile_against_vector_width_is_rejected() {
        let mut q = valid_simd4_point();
        q.simd_width = 2;
        q.ms = 5;
        assert_eq!(code(&q), -11);
    }

    #[test]
    fn first_failure_wins() {
        let mut p = valid_point();
        p.a_fetching_policy = FetchingPolicy::GlobalContiguous;
        p.simd_width = 5;
        assert_eq!(code(&p), -9);
    }

    #[test]
    fn growing_kl_only_introduces_local_memory_overflow() {
        // Monotonicity: scale kL upward (lf geometry divides every power of
        // two here) and the only failure that can appear is the
        // local-memory rule.
        let mut seen = Vec::new();
        for kl in [8u32, 16, 32, 64, 128, 256, 512, 1024] {
            let mut p = valid_point();
            p.kl = kl;
            seen.push(code(&p));
        }
        for c in &seen {
            assert!(*c == VALID || *c == -1, "unexpected code {c}");
        }
        assert_eq!(seen[0], VALID);
        assert_eq!(*seen.last().unwrap(), -1);
    }

    #[test]
    fn growing_simd_only_introduces_multiple_violation() {
        // The copy geometry of the fixture divides for every width in
        // {1,2,4,8}, so raising the width can only surface the
        // register-tile divisibility rule.
        for simd in [1u32, 2, 4, 8] {
            let mut p = valid_simd4_point();
            p.simd_width = simd;
            let c = code(&p);
            assert!(c == VALID || c == -11, "unexpected code {c}");
        }
        let mut p = valid_simd4_point();
        p.simd_width = 8; // ms = ns = 4 no longer divide
        assert_eq!(code(&p), -11);
    }

    #[test]
    fn transposed_bounds_swap_error_codes() {
        // mL = 8 against lf1 = 16: under A 'T' the second copy extent must
        // divide the spatial tile, reported as such.
        let p = GemmParameters::new(
            1,
            8,
            16,
            8,
            1,
            1,
            4,
            1,
            FetchingPolicy::Local,
            FetchingPolicy::Local,
            4,
            16,
        );
        assert_eq!(
            is_invalid(&p, &Device::host(), Dtype::F32, Trans::N, Trans::N),
            // B 'N': bound1 = nL = 8 vs lf1 = 16 fails as the spatial rule.
            -18
        );
        assert_eq!(
            is_invalid(&p, &Device::host(), Dtype::F32, Trans::T, Trans::N),
            // A 'T': bound1 = mL = 8 vs lf1 = 16 fails first, same code.
            -18
        );
    }

    #[test]
    fn device_limits_fire_last() {
        // 64·(128+128)·8 = 128 KiB of f64 panels overflows the 48 KiB record.
        let p = GemmParameters::new(
            4,
            16,
            64,
            16,
            1,
            8,
            4,
            8,
            FetchingPolicy::Local,
            FetchingPolicy::Local,
            16,
            16,
        );
        assert_eq!(
            is_invalid(&p, &Device::host(), Dtype::F64, Trans::N, Trans::N),
            -1
        );

        // Warp-multiple rule on the CUDA reference record: 8·2 = 16 threads
        // is not a multiple of 32.
        let p = GemmParameters::new(
            1,
            8,
            8,
            2,
            1,
            1,
            4,
            1,
            FetchingPolicy::Local,
            FetchingPolicy::Local,
            8,
            2,
        );
        assert_eq!(
            is_invalid(&p, &Device::cuda_reference(), Dtype::F32, Trans::N, Trans::N),
            -6
        );
    }
}
