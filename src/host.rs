//! Host-backend kernel execution
//!
//! The CPU path runs launches on the enqueueing thread. An entry point is
//! dispatched by [`KernelKind`]: the main kernel unpacks the packed
//! argument buffer with exactly the launch ABI the binder wrote and walks
//! the work-group grid: per z-group it computes its K-slice
//! `div = ⌈K/depth⌉, offz = div·gz, Kloc = min(K − offz, div)` and
//! accumulates the `(i, j)` outputs of its spatial tile, honoring every
//! stride descriptor. The per-lane tiling of the emitted text is collapsed
//! into bounds-equivalent element loops; accumulation happens in the
//! kernel's scalar type with fused multiply-adds.
//!
//! Single-pass launches write `α·acc + β·C`; split-K launches store
//! α-scaled raw partials into the scratch plane of their z-group and leave
//! β to the reduction kernel.

use crate::binder::ArgPack;
use crate::driver::{Context, DriverError, KernelKind};
use crate::emit::SpecializationKey;
use crate::expr::Dtype;
use crate::params::Trans;
use std::sync::Arc;

/// Execute one resolved entry point.
pub(crate) fn launch(
    kind: &KernelKind,
    ctx: &Arc<Context>,
    grid: [usize; 3],
    _block: [usize; 3],
    args: &ArgPack,
) -> Result<(), DriverError> {
    match kind {
        KernelKind::Gemm(key) => match key.dtype {
            Dtype::F32 => gemm_kernel::<f32>(key, ctx, grid, args),
            Dtype::F64 => gemm_kernel::<f64>(key, ctx, grid, args),
        },
        KernelKind::Reduce { dtype } => match dtype {
            Dtype::F32 => reduce_kernel::<f32>(ctx, args, *dtype),
            Dtype::F64 => reduce_kernel::<f64>(ctx, args, *dtype),
        },
    }
}

trait HostScalar: Copy {
    const BYTES: usize;
    const ZERO: Self;
    fn from_f64(v: f64) -> Self;
    fn mul(self, o: Self) -> Self;
    fn add(self, o: Self) -> Self;
    fn mul_add(self, a: Self, b: Self) -> Self;
    fn read(bytes: &[u8], idx: u64) -> Result<Self, DriverError>;
    fn write(bytes: &mut [u8], idx: u64, v: Self) -> Result<(), DriverError>;
}

macro_rules! impl_host_scalar {
    ($t:ty, $bytes:expr) => {
        impl HostScalar for $t {
            const BYTES: usize = $bytes;
            const ZERO: Self = 0.0;
            #[inline]
            fn from_f64(v: f64) -> Self {
                v as $t
            }
            #[inline]
            fn mul(self, o: Self) -> Self {
                self * o
            }
            #[inline]
            fn add(self, o: Self) -> Self {
                self + o
            }
            #[inline]
            fn mul_add(self, a: Self, b: Self) -> Self {
                <$t>::mul_add(self, a, b)
            }
            fn read(bytes: &[u8], idx: u64) -> Result<Self, DriverError> {
                let off = idx as usize * Self::BYTES;
                let raw = bytes.get(off..off + Self::BYTES).ok_or(
                    DriverError::OutOfRange {
                        len: Self::BYTES,
                        offset: off,
                        capacity: bytes.len(),
                    },
                )?;
                let mut le = [0u8; $bytes];
                le.copy_from_slice(raw);
                Ok(<$t>::from_le_bytes(le))
            }
            fn write(bytes: &mut [u8], idx: u64, v: Self) -> Result<(), DriverError> {
                let off = idx as usize * Self::BYTES;
                let capacity = bytes.len();
                let raw = bytes.get_mut(off..off + Self::BYTES).ok_or(
                    DriverError::OutOfRange {
                        len: Self::BYTES,
                        offset: off,
                        capacity,
                    },
                )?;
                raw.copy_from_slice(&v.to_le_bytes());
                Ok(())
            }
        }
    };
}

impl_host_scalar!(f32, 4);
impl_host_scalar!(f64, 8);

fn gemm_kernel<T: HostScalar>(
    key: &SpecializationKey,
    ctx: &Arc<Context>,
    grid: [usize; 3],
    args: &ArgPack,
) -> Result<(), DriverError> {
    let mut r = args.reader();
    let m = r.next_size()?;
    let n = r.next_size()?;
    let k = r.next_size()?;
    let c_handle = r.next_handle()?;
    let ldc = r.next_size()?;
    let offc = r.next_size()?;
    let cs1 = r.next_size()?;
    let alpha = T::from_f64(r.next_scalar(key.dtype)?);
    let a_handle = r.next_handle()?;
    let lda = r.next_size()?;
    let offa = r.next_size()?;
    let as1 = r.next_size()?;
    let b_handle = r.next_handle()?;
    let ldb = r.next_size()?;
    let offb = r.next_size()?;
    let bs1 = r.next_size()?;
    let beta = T::from_f64(r.next_scalar(key.dtype)?);

    let a = ctx.buffer_bytes(a_handle)?;
    let b = ctx.buffer_bytes(b_handle)?;
    let mut c = ctx.buffer_bytes(c_handle)?;

    let p = &key.params;
    let (ml, nl) = (u64::from(p.ml), u64::from(p.nl));
    let depth = u64::from(p.depth);
    let div = (k + depth - 1) / depth;

    for gz in 0..grid[2] as u64 {
        let offz = div * gz;
        let kloc = div.min(k.saturating_sub(offz));
        for gx in 0..grid[0] as u64 {
            for gy in 0..grid[1] as u64 {
                for i in (gx * ml)..((gx + 1) * ml).min(m) {
                    for j in (gy * nl)..((gy + 1) * nl).min(n) {
                        let mut acc = T::ZERO;
                        for kk in offz..offz + kloc {
                            let ai = match key.a_trans {
                                Trans::N => offa + i * as1 + kk * lda,
                                Trans::T => offa + kk * as1 + i * lda,
                            };
                            let bi = match key.b_trans {
                                Trans::N => offb + kk * bs1 + j * ldb,
                                Trans::T => offb + j * bs1 + kk * ldb,
                            };
                            let av = T::read(&a, ai)?;
                            let bv = T::read(&b, bi)?;
                            acc = av.mul_add(bv, acc);
                        }
                        if depth > 1 {
                            let idx = offc + i * cs1 + j * ldc + gz * ldc * n;
                            T::write(&mut c, idx, alpha.mul(acc))?;
                        } else {
                            let idx = offc + i * cs1 + j * ldc;
                            let prev = T::read(&c, idx)?;
                            T::write(&mut c, idx, alpha.mul(acc).add(beta.mul(prev)))?;
                        }
                    }
                }
            }
        }
    }
    ctx.overwrite_buffer(c_handle, c)
}

fn reduce_kernel<T: HostScalar>(
    ctx: &Arc<Context>,
    args: &ArgPack,
    dtype: Dtype,
) -> Result<(), DriverError> {
    let mut r = args.reader();
    let m = r.next_size()?;
    let n = r.next_size()?;
    let d = r.next_size()?;
    let z_handle = r.next_handle()?;
    let zld = r.next_size()?;
    let c_handle = r.next_handle()?;
    let ldc = r.next_size()?;
    let cstart1 = r.next_size()?;
    let cstart2 = r.next_size()?;
    let cs1 = r.next_size()?;
    let cs2 = r.next_size()?;
    let beta = T::from_f64(r.next_scalar(dtype)?);

    let z = ctx.buffer_bytes(z_handle)?;
    let mut c = ctx.buffer_bytes(c_handle)?;

    let base = cstart1 + cstart2 * ldc;
    let ldc2 = ldc * cs2;
    for i in 0..m {
        for j in 0..n {
            let mut acc = T::ZERO;
            for kk in 0..d {
                acc = acc.add(T::read(&z, i + j * zld + kk * zld * n)?);
            }
            let idx = base + i * cs1 + j * ldc2;
            let prev = T::read(&c, idx)?;
            T::write(&mut c, idx, acc.add(beta.mul(prev)))?;
        }
    }
    ctx.overwrite_buffer(c_handle, c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::driver::Device;
    use crate::params::{FetchingPolicy, GemmParameters};

    fn small_key(depth: u32) -> SpecializationKey {
        SpecializationKey {
            params: GemmParameters::new(
                1,
                8,
                8,
                8,
                depth,
                1,
                4,
                1,
                FetchingPolicy::Local,
                FetchingPolicy::Local,
                8,
                8,
            ),
            a_trans: Trans::N,
            b_trans: Trans::N,
            check_bounds: false,
            backend: Backend::Host,
            dtype: Dtype::F32,
        }
    }

    fn upload(ctx: &Arc<Context>, vals: &[f32]) -> crate::driver::Buffer {
        let buf = ctx.alloc(vals.len() * 4).unwrap();
        let mut bytes = Vec::new();
        for v in vals {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        ctx.write_buffer(buf.handle(), 0, &bytes).unwrap();
        buf
    }

    fn download(ctx: &Arc<Context>, buf: &crate::driver::Buffer) -> Vec<f32> {
        ctx.buffer_bytes(buf.handle())
            .unwrap()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn two_by_two_product_with_coefficients() {
        let ctx = Context::new(&Device::host()).unwrap();
        // Column-major: A = [[1,3],[2,4]], B = [[5,7],[6,8]], C prefilled 1.
        let a = upload(&ctx, &[1.0, 2.0, 3.0, 4.0]);
        let b = upload(&ctx, &[5.0, 6.0, 7.0, 8.0]);
        let c = upload(&ctx, &[1.0, 1.0, 1.0, 1.0]);

        let key = small_key(1);
        let mut pack = ArgPack::new(Backend::Host);
        for v in [2u64, 2, 2] {
            pack.push_size(v);
        }
        pack.push_handle(c.handle());
        for v in [2u64, 0, 1] {
            pack.push_size(v);
        }
        pack.push_scalar(Dtype::F32, 2.0); // alpha
        pack.push_handle(a.handle());
        for v in [2u64, 0, 1] {
            pack.push_size(v);
        }
        pack.push_handle(b.handle());
        for v in [2u64, 0, 1] {
            pack.push_size(v);
        }
        pack.push_scalar(Dtype::F32, 0.5); // beta

        launch(&KernelKind::Gemm(key), &ctx, [1, 1, 1], [8, 8, 1], &pack).unwrap();

        // A·B = [[23,31],[34,46]]; 2·AB + 0.5·1 = [[46.5,62.5],[68.5,92.5]].
        assert_eq!(download(&ctx, &c), vec![46.5, 68.5, 62.5, 92.5]);
    }

    #[test]
    fn split_k_partials_then_reduce() {
        let ctx = Context::new(&Device::host()).unwrap();
        // 1×1 output over K = 4, split in two: A = [1,2,3,4] row, B column.
        let a = upload(&ctx, &[1.0, 2.0, 3.0, 4.0]); // 1×4, lda = 1
        let b = upload(&ctx, &[10.0, 20.0, 30.0, 40.0]); // 4×1, ldb = 4
        let c = upload(&ctx, &[7.0]);
        let scratch = upload(&ctx, &[0.0, 0.0]); // (1,1,2)

        let key = small_key(2);
        let mut pack = ArgPack::new(Backend::Host);
        for v in [1u64, 1, 4] {
            pack.push_size(v);
        }
        pack.push_handle(scratch.handle());
        for v in [1u64, 0, 1] {
            pack.push_size(v);
        }
        pack.push_scalar(Dtype::F32, 1.0);
        pack.push_handle(a.handle());
        for v in [1u64, 0, 1] {
            pack.push_size(v);
        }
        pack.push_handle(b.handle());
        for v in [4u64, 0, 1] {
            pack.push_size(v);
        }
        pack.push_scalar(Dtype::F32, 3.0);

        launch(&KernelKind::Gemm(key), &ctx, [1, 1, 2], [8, 8, 1], &pack).unwrap();
        // Partials: z0 = 1·10 + 2·20 = 50, z1 = 3·30 + 4·40 = 250.
        assert_eq!(download(&ctx, &scratch), vec![50.0, 250.0]);

        let mut pack = ArgPack::new(Backend::Host);
        for v in [1u64, 1, 2] {
            pack.push_size(v);
        }
        pack.push_handle(scratch.handle());
        pack.push_size(1); // Zld
        pack.push_handle(c.handle());
        for v in [1u64, 0, 0, 1, 1] {
            pack.push_size(v);
        }
        pack.push_scalar(Dtype::F32, 3.0);

        launch(
            &KernelKind::Reduce { dtype: Dtype::F32 },
            &ctx,
            [1, 1, 1],
            [8, 8, 1],
            &pack,
        )
        .unwrap();
        // 50 + 250 + 3·7 = 321.
        assert_eq!(download(&ctx, &c), vec![321.0]);
    }
}
