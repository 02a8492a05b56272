//! Tunable GEMM parameter record
//!
//! A parameter point fully describes one tiling of the matrix product:
//! the work-group geometry, the shared-memory K-tile, the per-work-item
//! register tile, the split-K factor, and the geometry of the cooperative
//! global→shared copy. The record enforces **no** invariants at
//! construction; every constraint lives in [`crate::validity`] so the tuner
//! can enumerate the raw space and filter by code.
//!
//! The derived work-group tile extents `mL = mS·local_size_0` and
//! `nL = nS·local_size_1` are computed once by the constructor and cached in
//! the record.
//!
//! Records are value types: `Copy`, totally ordered and hashable over all
//! fields so they can key specialization caches and be sorted by the tuner,
//! and serde-encodable so tuner outputs round-trip through JSON.

use serde::{Deserialize, Serialize};

/// How the global→shared (or global→register) copy is scheduled.
///
/// The matrix-product engine only implements the shared-memory staging path
/// ([`FetchingPolicy::Local`]); the other two spellings remain addressable
/// by the tuner and are rejected by the validity oracle.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum FetchingPolicy {
    /// Stage tiles through shared memory with a cooperative copy.
    Local,
    /// Strided direct-from-global fetch (unsupported by this engine).
    GlobalStrided,
    /// Contiguous direct-from-global fetch (unsupported by this engine).
    GlobalContiguous,
}

/// Transpose flag for an operand, as it appears above the leaf in the
/// expression tree.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Trans {
    /// Operand is consumed as stored.
    N,
    /// Operand is consumed transposed.
    T,
}

impl Trans {
    /// Single-letter spelling used in kernel names and diagnostics.
    #[inline]
    pub fn as_char(self) -> char {
        match self {
            Trans::N => 'N',
            Trans::T => 'T',
        }
    }
}

/// One point of the GEMM tuning space.
///
/// Field names follow the tile glossary: `m`/`n` are the two spatial axes of
/// the output, `k` is the contracting axis, the `l` suffix marks the
/// work-group tile and the `s` suffix the per-work-item register tile.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct GemmParameters {
    /// Vector width of packed loads/stores (1, 2, 4 or 8).
    pub simd_width: u32,
    /// Work-group extent along the first spatial axis.
    pub local_size_0: u32,
    /// Work-group extent along the second spatial axis.
    pub local_size_1: u32,
    /// K-tile depth copied to shared memory per outer iteration.
    pub kl: u32,
    /// Split-K factor; `1` disables the reduction pass.
    pub depth: u32,
    /// Register-tile extent along M per work-item.
    pub ms: u32,
    /// Register-tile extent along K per work-item.
    pub ks: u32,
    /// Register-tile extent along N per work-item.
    pub ns: u32,
    /// Fetch schedule for the A operand.
    pub a_fetching_policy: FetchingPolicy,
    /// Fetch schedule for the B operand.
    pub b_fetching_policy: FetchingPolicy,
    /// First extent of the cooperative-copy geometry.
    pub local_fetch_0: u32,
    /// Second extent of the cooperative-copy geometry.
    pub local_fetch_1: u32,
    /// Derived: work-group tile extent along M (`ms · local_size_0`).
    pub ml: u32,
    /// Derived: work-group tile extent along N (`ns · local_size_1`).
    pub nl: u32,
}

impl GemmParameters {
    /// Build a parameter point and cache the derived tile extents.
    ///
    /// Argument order mirrors the tuner's flattened vector:
    /// `(simd, ls0, kL, ls1, depth, mS, kS, nS, Afetch, Bfetch, lf0, lf1)`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        simd_width: u32,
        local_size_0: u32,
        kl: u32,
        local_size_1: u32,
        depth: u32,
        ms: u32,
        ks: u32,
        ns: u32,
        a_fetching_policy: FetchingPolicy,
        b_fetching_policy: FetchingPolicy,
        local_fetch_0: u32,
        local_fetch_1: u32,
    ) -> Self {
        GemmParameters {
            simd_width,
            local_size_0,
            local_size_1,
            kl,
            depth,
            ms,
            ks,
            ns,
            a_fetching_policy,
            b_fetching_policy,
            local_fetch_0,
            local_fetch_1,
            ml: ms * local_size_0,
            nl: ns * local_size_1,
        }
    }

    /// Threads per work-group.
    #[inline]
    pub fn num_threads(&self) -> u32 {
        self.local_size_0 * self.local_size_1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point() -> GemmParameters {
        GemmParameters::new(
            4,
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

    #[test]
    fn derived_tile_extents() {
        let p = point();
        assert_eq!(p.ml, 32);
        assert_eq!(p.nl, 32);
        assert_eq!(p.num_threads(), 64);
    }

    #[test]
    fn record_is_totally_ordered_and_hashable() {
        use std::collections::BTreeSet;
        let mut a = point();
        let b = point();
        assert_eq!(a, b);
        a.depth = 4;
        assert_ne!(a, b);

        let set: BTreeSet<GemmParameters> = [a, b, point()].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn json_round_trip() {
        let p = point();
        let text = serde_json::to_string(&p).unwrap();
        let back: GemmParameters = serde_json::from_str(&text).unwrap();
        assert_eq!(p, back);
    }
}
