//! Launch planning for the tiled matrix product
//!
//! A [`Gemm`] pairs one parameter point with the transpose flags and the
//! bounds-check mode, and drives the whole launch sequence: preset
//! extraction from the expression tree, the empty-shape early return, the
//! stride inspection that switches to the fallback specialization, grid and
//! block sizing, split-K scratch allocation, binder-driven argument
//! packing in the exact emitted-signature order, and submission of the
//! main kernel plus the optional reduction.
//!
//! The fallback dispatch is a specialization switch, not error recovery:
//! strided inputs re-enter the same sequence under the `fallback` entry
//! points with bounds checking on. Failures (shape mismatch, missing entry
//! point, scratch allocation) surface immediately; nothing is retried.

use crate::binder::{push_array, ArgPack, BindingPolicy, SymbolicBinder};
use crate::driver::{DriverError, Program, Stream};
use crate::emit::{generate, SpecializationKey};
use crate::expr::{Array, Dtype, ExprError, ExprTree, GemmArgs};
use crate::params::{FetchingPolicy, GemmParameters, Trans};
use crate::validity::{self, InvalidKernel};
use crate::backend::Backend;
use crate::driver::Device;

/// Failures surfaced by the planner.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// The expression tree is not a supported matrix-product shape.
    #[error(transparent)]
    Expr(#[from] ExprError),
    /// The parameter point was rejected by the validity oracle.
    #[error("parameter point rejected: {0}")]
    Invalid(#[from] InvalidKernel),
    /// A driver operation failed.
    #[error(transparent)]
    Driver(#[from] DriverError),
}

#[inline]
fn ceil_div(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

/// One specialized matrix-product launcher.
#[derive(Clone, Debug)]
pub struct Gemm {
    params: GemmParameters,
    a_trans: Trans,
    b_trans: Trans,
    check_bounds: bool,
}

impl Gemm {
    /// Pair a parameter point with transpose flags and a bounds mode.
    pub fn new(
        params: GemmParameters,
        check_bounds: bool,
        a_trans: Trans,
        b_trans: Trans,
    ) -> Gemm {
        Gemm { params, a_trans, b_trans, check_bounds }
    }

    /// `C ← α·A·B + β·C`.
    pub fn nn(params: GemmParameters, check_bounds: bool) -> Gemm {
        Gemm::new(params, check_bounds, Trans::N, Trans::N)
    }

    /// `C ← α·A·Bᵀ + β·C`.
    pub fn nt(params: GemmParameters, check_bounds: bool) -> Gemm {
        Gemm::new(params, check_bounds, Trans::N, Trans::T)
    }

    /// `C ← α·Aᵀ·B + β·C`.
    pub fn tn(params: GemmParameters, check_bounds: bool) -> Gemm {
        Gemm::new(params, check_bounds, Trans::T, Trans::N)
    }

    /// `C ← α·Aᵀ·Bᵀ + β·C`.
    pub fn tt(params: GemmParameters, check_bounds: bool) -> Gemm {
        Gemm::new(params, check_bounds, Trans::T, Trans::T)
    }

    /// The fixed safe point backing the bounds-checked fallback
    /// specialization: scalar accesses, 8×8 threads, unit register tile.
    pub fn fallback(a_trans: Trans, b_trans: Trans) -> Gemm {
        let params = GemmParameters::new(
            1,
            8,
            8,
            8,
            1,
            1,
            1,
            1,
            FetchingPolicy::Local,
            FetchingPolicy::Local,
            8,
            8,
        );
        Gemm::new(params, true, a_trans, b_trans)
    }

    /// Parameter point.
    pub fn params(&self) -> &GemmParameters {
        &self.params
    }

    /// Whether this launcher is the bounds-checked flavor.
    pub fn check_bounds(&self) -> bool {
        self.check_bounds
    }

    /// Shared-memory footprint of the two staged panels, in bytes.
    pub fn lmem_usage(&self, dtype: Dtype) -> usize {
        let p = &self.params;
        (p.kl * p.ml + p.kl * p.nl) as usize * dtype.size_of()
    }

    /// Register footprint of the per-work-item tiles, in bytes.
    pub fn registers_usage(&self, dtype: Dtype) -> usize {
        let p = &self.params;
        (p.ms * p.ns + p.ms * p.ks + p.ks * p.ns) as usize * dtype.size_of()
    }

    /// Scratch elements needed by a launch of `tree` (zero unless
    /// splitting K).
    pub fn temporary_workspace(&self, tree: &ExprTree) -> Result<usize, LaunchError> {
        let [m, n, _] = self.input_sizes(tree)?;
        if self.params.depth > 1 {
            Ok(m * n * self.params.depth as usize)
        } else {
            Ok(0)
        }
    }

    /// `(M, N, K)` extracted through the preset matcher.
    pub fn input_sizes(&self, tree: &ExprTree) -> Result<[usize; 3], LaunchError> {
        Ok(GemmArgs::match_tree(tree)?.sizes())
    }

    /// The specialization this launcher emits on `backend` over `dtype`.
    pub fn specialization(&self, backend: Backend, dtype: Dtype) -> SpecializationKey {
        SpecializationKey {
            params: self.params,
            a_trans: self.a_trans,
            b_trans: self.b_trans,
            check_bounds: self.check_bounds,
            backend,
            dtype,
        }
    }

    /// Validity of this point on `device`, as the oracle's code.
    pub fn is_invalid(&self, device: &Device, dtype: Dtype) -> i32 {
        validity::is_invalid(&self.params, device, dtype, self.a_trans, self.b_trans)
    }

    /// Emit the translation unit for `device`'s backend, after the oracle
    /// accepts the point.
    pub fn generate(
        &self,
        suffix: &str,
        device: &Device,
        dtype: Dtype,
    ) -> Result<String, LaunchError> {
        validity::check(&self.params, device, dtype, self.a_trans, self.b_trans)?;
        let key = self.specialization(device.backend(), dtype);
        tracing::debug!(digest = %key.digest(), suffix, "emitting specialization");
        Ok(generate(&key, suffix))
    }

    /// Run the full launch sequence for `tree` on `queue`, routing to
    /// `fallback`'s specialization when a contiguous-axis stride exceeds
    /// one.
    pub fn enqueue(
        &self,
        queue: &Stream,
        program: &Program,
        suffix: &str,
        fallback: &Gemm,
        tree: &ExprTree,
    ) -> Result<(), LaunchError> {
        let args = GemmArgs::match_tree(tree)?;
        let [m, n, k] = args.sizes();
        if m == 0 || n == 0 || k == 0 {
            return Ok(());
        }
        let strided = args.a.stride()[0] > 1
            || args.b.stride()[0] > 1
            || args.c.stride()[0] > 1;
        if strided {
            tracing::debug!(m, n, k, "strided contiguous axis, taking the fallback specialization");
            fallback.enqueue_block(queue, program, "fallback", &args)
        } else {
            self.enqueue_block(queue, program, suffix, &args)
        }
    }

    fn enqueue_block(
        &self,
        queue: &Stream,
        program: &Program,
        suffix: &str,
        args: &GemmArgs,
    ) -> Result<(), LaunchError> {
        let [m, n, k] = args.sizes();
        if m == 0 || n == 0 || k == 0 {
            return Ok(());
        }
        let p = &self.params;
        let dtype = args.c.dtype();
        let backend = queue.context().device().backend();
        let (ls0, ls1) = (p.local_size_0 as usize, p.local_size_1 as usize);

        let gemm_kernel = program.kernel(&format!("gemm{suffix}"))?;

        // Split-K partials land in a transient (M, N, depth) tensor from
        // C's context; it is released when this frame unwinds.
        let scratch;
        let out: &Array = if p.depth > 1 {
            scratch = Array::new(args.c.context(), &[m, n, p.depth as usize], dtype)?;
            &scratch
        } else {
            &args.c
        };

        let grid = [
            ceil_div(ceil_div(m, p.ms as usize), ls0),
            ceil_div(ceil_div(n, p.ns as usize), ls1),
            p.depth as usize,
        ];
        let block = [ls0, ls1, 1];
        tracing::trace!(?grid, ?block, m, n, k, "main kernel geometry");

        let mut binder = SymbolicBinder::new(BindingPolicy::Independent);
        let mut pack = ArgPack::new(backend);
        pack.push_size(m as u64);
        pack.push_size(n as u64);
        pack.push_size(k as u64);
        push_array(&mut pack, &mut binder, out);
        pack.push_scalar(dtype, args.alpha);
        push_array(&mut pack, &mut binder, &args.a);
        push_array(&mut pack, &mut binder, &args.b);
        pack.push_scalar(dtype, args.beta);
        queue.enqueue(&gemm_kernel, grid, block, &pack, None)?;

        if p.depth > 1 {
            let reduce_kernel = program.kernel(&format!("reduce{suffix}"))?;
            let grid = [ceil_div(m, ls0), ceil_div(n, ls1), 1];
            tracing::trace!(?grid, "reduction geometry");

            let mut binder = SymbolicBinder::new(BindingPolicy::Independent);
            let mut pack = ArgPack::new(backend);
            pack.push_size(m as u64);
            pack.push_size(n as u64);
            pack.push_size(u64::from(p.depth));
            let (_slot, _) = binder.bind(out.data().handle());
            pack.push_handle(out.data().handle());
            pack.push_size(out.ld() as u64);
            let (_slot, _) = binder.bind(args.c.data().handle());
            pack.push_handle(args.c.data().handle());
            pack.push_size(args.c.ld() as u64);
            pack.push_size(args.c.start()[0] as u64);
            pack.push_size(args.c.start()[1] as u64);
            pack.push_size(args.c.stride()[0] as u64);
            pack.push_size(args.c.stride()[1] as u64);
            pack.push_scalar(dtype, args.beta);
            queue.enqueue(&reduce_kernel, grid, block, &pack, None)?;
        }
        Ok(())
    }
}
