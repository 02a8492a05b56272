//! Kernel source emission
//!
//! Turns one specialization key (a parameter point, the two transpose
//! flags, the bounds-check mode, the backend tag and the scalar type) into
//! a self-contained device translation unit. Emission is a pure function of
//! the key: no device is touched, and identical keys produce identical
//! text, which is what lets callers cache compiled binaries by key digest.
//!
//! One unit carries the main kernel `gemm<suffix>` and, when the split-K
//! factor exceeds one, the reduction kernel `reduce<suffix>`, so a single
//! compile yields both entry points.
//!
//! The main kernel body goes through six phases:
//! 1. backend preamble,
//! 2. declarations (register tile, register panels, shared panels, global
//!    pointer arrays),
//! 3. index computation and pointer adjustment (including the per-z-group
//!    K-slice when splitting K),
//! 4. the outer `while (K >= kL)` loop: barrier, cooperative copy into
//!    shared memory, barrier, fully unrolled register fetch and FMA block,
//!    pointer advance,
//! 5. the tail: per-lane boundary predicates and a zero-padding re-run of
//!    the copy-and-compute block,
//! 6. writeback with α (and β on the single-pass path), or the raw-partial
//!    store into the split-K scratch.
//!
//! The emitter is a flat state machine over a string builder; tile loops
//! are unrolled with explicit index arithmetic at emission time.

use crate::backend::{append_width, vector_component, vload, vstore, Backend};
use crate::expr::Dtype;
use crate::params::{GemmParameters, Trans};

/// The full tuple identifying one emitted kernel text.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SpecializationKey {
    /// Tuning parameter point.
    pub params: GemmParameters,
    /// Transpose flag on A.
    pub a_trans: Trans,
    /// Transpose flag on B.
    pub b_trans: Trans,
    /// Fallback flavor: emit stride multiplications on every
    /// contiguous-axis access.
    pub check_bounds: bool,
    /// Target dialect.
    pub backend: Backend,
    /// Scalar element type.
    pub dtype: Dtype,
}

impl SpecializationKey {
    /// Canonical little-endian byte encoding, stable across processes.
    pub fn encode(&self) -> Vec<u8> {
        let p = &self.params;
        let mut out = Vec::with_capacity(64);
        for v in [
            p.simd_width,
            p.local_size_0,
            p.local_size_1,
            p.kl,
            p.depth,
            p.ms,
            p.ks,
            p.ns,
            p.local_fetch_0,
            p.local_fetch_1,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.push(p.a_fetching_policy as u8);
        out.push(p.b_fetching_policy as u8);
        out.push(self.a_trans.as_char() as u8);
        out.push(self.b_trans.as_char() as u8);
        out.push(u8::from(self.check_bounds));
        out.push(match self.backend {
            Backend::Cuda => 0,
            Backend::OpenCl => 1,
            Backend::Host => 2,
        });
        out.push(self.dtype.tag());
        out
    }

    /// Digest of the canonical encoding, for keying external program
    /// caches.
    pub fn digest(&self) -> blake3::Hash {
        blake3::hash(&self.encode())
    }
}

// ===========================================================================
// Emission stream
// ===========================================================================

/// A string builder with indentation tracking; the emitter's only state.
#[derive(Debug, Default)]
pub struct SourceText {
    buf: String,
    tab: usize,
}

impl SourceText {
    /// An empty stream.
    pub fn new() -> SourceText {
        SourceText::default()
    }

    /// Append one indented line.
    pub fn line(&mut self, s: impl AsRef<str>) {
        for _ in 0..self.tab {
            self.buf.push_str("  ");
        }
        self.buf.push_str(s.as_ref());
        self.buf.push('\n');
    }

    /// Append an empty line.
    pub fn blank(&mut self) {
        self.buf.push('\n');
    }

    /// Increase the indentation level.
    pub fn indent(&mut self) {
        self.tab += 1;
    }

    /// Decrease the indentation level.
    pub fn dedent(&mut self) {
        self.tab = self.tab.saturating_sub(1);
    }

    /// Finish and take the accumulated text.
    pub fn finish(self) -> String {
        self.buf
    }
}

// ===========================================================================
// Emitter
// ===========================================================================

/// Emit the translation unit for `key`, naming its entry points
/// `gemm<suffix>` (and `reduce<suffix>` when splitting K).
pub fn generate(key: &SpecializationKey, suffix: &str) -> String {
    Emitter::new(key, suffix).run()
}

struct Emitter<'a> {
    key: &'a SpecializationKey,
    p: GemmParameters,
    backend: Backend,
    gemm_name: String,
    reduce_name: String,
    sdtype: &'static str,
    vdtype: String,
    size_t: &'static str,
    glob: &'static str,
    // Shared-panel leading dimensions and global-pointer-array extents.
    llda: u32,
    lldb: u32,
    np_a: u32,
    np_b: u32,
    // Contiguous-axis stride suffixes; empty on the fast path.
    as1: &'static str,
    bs1: &'static str,
    cs1: &'static str,
    has_depth: bool,
}

impl<'a> Emitter<'a> {
    fn new(key: &'a SpecializationKey, suffix: &str) -> Emitter<'a> {
        let p = key.params;
        let llda = match key.a_trans {
            Trans::N => p.ml,
            Trans::T => p.kl,
        };
        let lldb = match key.b_trans {
            Trans::T => p.nl,
            Trans::N => p.kl,
        };
        let np_a = p.ml
            / match key.a_trans {
                Trans::N => p.local_fetch_0 * p.simd_width,
                Trans::T => p.local_fetch_1,
            };
        let np_b = p.nl
            / match key.b_trans {
                Trans::T => p.local_fetch_0 * p.simd_width,
                Trans::N => p.local_fetch_1,
            };
        let sdtype = key.dtype.c_name();
        Emitter {
            key,
            p,
            backend: key.backend,
            gemm_name: format!("gemm{suffix}"),
            reduce_name: format!("reduce{suffix}"),
            sdtype,
            vdtype: append_width(sdtype, p.simd_width),
            size_t: key.backend.size_type(),
            glob: key.backend.global_qualifier(),
            llda,
            lldb,
            np_a,
            np_b,
            as1: if key.check_bounds { "*Astride1" } else { "" },
            bs1: if key.check_bounds { "*Bstride1" } else { "" },
            cs1: if key.check_bounds { "*Cstride1" } else { "" },
            has_depth: p.depth > 1,
        }
    }

    fn run(&self) -> String {
        let mut st = SourceText::new();
        self.preamble(&mut st);
        self.signature(&mut st);
        st.line("{");
        st.indent();
        self.declarations(&mut st);
        self.indexing(&mut st);
        self.outer_loop(&mut st);
        self.tail(&mut st);
        self.writeback(&mut st);
        st.dedent();
        st.line("}");
        if self.has_depth {
            self.reduce_kernel(&mut st);
        }
        st.finish()
    }

    // Phase 1: backend preamble.
    fn preamble(&self, st: &mut SourceText) {
        match self.backend {
            Backend::Cuda => st.line("#include \"helper_math.h\""),
            Backend::OpenCl => st.line(format!(
                "__attribute__((reqd_work_group_size({},{},1)))",
                self.p.local_size_0, self.p.local_size_1
            )),
            Backend::Host => st.line("#include \"host_math.h\""),
        }
    }

    fn signature(&self, st: &mut SourceText) {
        let (s, g, d) = (self.size_t, self.glob, self.sdtype);
        st.line(format!(
            "{} void {}({s} M, {s} N, {s} K, {g}{d}* C, {s} ldc, {s} offc, {s} Cstride1, \
             {d} alpha, {g}{d}* A, {s} lda, {s} offa, {s} Astride1, \
             {g}{d}* B, {s} ldb, {s} offb, {s} Bstride1, {d} beta)",
            self.backend.kernel_prefix(),
            self.gemm_name,
        ));
    }

    // Phase 2: register tile, register panels, shared panels, pointer
    // arrays, identifiers.
    fn declarations(&self, st: &mut SourceText) {
        let p = &self.p;
        st.line("//blocks");
        st.line(format!("{} rC[{}][{}] = {{{{0}}}};", self.sdtype, p.ms, p.ns));
        st.line(format!(
            "{} rA[{}][{}];",
            self.vdtype,
            p.ks,
            p.ms / p.simd_width
        ));
        st.line(format!(
            "{} rB[{}][{}];",
            self.vdtype,
            p.ks,
            p.ns / p.simd_width
        ));
        st.blank();

        st.line("//pointers");
        let lq = self.backend.local_qualifier();
        st.line(format!("{lq} {} lA[{}];", self.sdtype, p.kl * p.ml));
        st.line(format!("{lq} {} lB[{}];", self.sdtype, p.kl * p.nl));
        st.line(format!("{}{}* Ai[{}];", self.glob, self.sdtype, self.np_a));
        st.line(format!("{}{}* Bi[{}];", self.glob, self.sdtype, self.np_b));
        st.blank();

        st.line("//identifiers");
        st.line("int2 idT;");
        st.line("int idt;");
        if self.has_depth {
            st.line("int gidz, div, offz;");
        }
        st.line("uint4 ids;");
        st.line(format!("ids.x = {};", self.backend.group_idx(0)));
        st.line(format!("ids.y = {};", self.backend.group_idx(1)));
        st.line(format!("ids.z = {};", self.backend.local_idx(0)));
        st.line(format!("ids.w = {};", self.backend.local_idx(1)));
        st.blank();
    }

    // Phase 3: base offsets, split-K slice, flat id decomposition, and the
    // per-work-item pointer/bound adjustment.
    fn indexing(&self, st: &mut SourceText) {
        let p = &self.p;
        st.line("//offsets");
        st.line("A += offa;");
        st.line("B += offb;");
        st.line("C += offc;");
        if self.has_depth {
            st.line(format!("gidz = {};", self.backend.group_idx(2)));
            st.line(format!("div = (K+{})/{};", p.depth - 1, p.depth));
            st.line("offz = div*gidz;");
            st.line(format!("K = min(K - div*gidz, ({})div);", self.size_t));
        }
        st.blank();

        st.line(format!("idt = {}*ids.w + ids.z;", p.local_size_0));
        st.line(format!("idT.y = idt/{};", p.local_fetch_0));
        st.line(format!("idT.x = idt - {}*idT.y;", p.local_fetch_0));
        st.blank();

        st.line("//Adjust pointers and bounds per work-item");
        st.line(format!("ids.x *= {};", p.ml));
        st.line(format!("ids.y *= {};", p.nl));
        st.line(format!("idT.x *= {};", p.simd_width));
        st.line("M -= ids.x;");
        match self.key.a_trans {
            Trans::N => st.line("M -= idT.x;"),
            Trans::T => st.line("M -= idT.y;"),
        }
        st.line("N -= ids.y;");
        match self.key.b_trans {
            Trans::T => st.line("N -= idT.x;"),
            Trans::N => st.line("N -= idT.y;"),
        }

        match self.key.a_trans {
            Trans::N => {
                st.line(format!("A += ids.x{};", self.as1));
                st.line("A += idT.y*lda;");
                if self.has_depth {
                    st.line("A += offz*lda;");
                }
            }
            Trans::T => {
                st.line("A += ids.x*lda;");
                st.line(format!("A += idT.x{};", self.as1));
                if self.has_depth {
                    st.line("A += offz;");
                }
            }
        }
        match self.key.b_trans {
            Trans::T => {
                st.line(format!("B += ids.y{};", self.bs1));
                st.line("B += idT.y*ldb;");
                if self.has_depth {
                    st.line("B += offz*ldb;");
                }
            }
            Trans::N => {
                st.line("B += ids.y*ldb;");
                st.line(format!("B += idT.x{};", self.bs1));
                if self.has_depth {
                    st.line("B += offz;");
                }
            }
        }
        st.blank();

        st.line("#pragma unroll");
        st.line(format!("for(int i = 0 ; i < {} ; ++i){{", self.np_a));
        st.indent();
        st.line("Ai[i] = A;");
        st.dedent();
        st.line("}");
        st.line("#pragma unroll");
        st.line(format!("for(int i = 0 ; i < {} ; ++i){{", self.np_b));
        st.indent();
        st.line("Bi[i] = B;");
        st.dedent();
        st.line("}");
        st.blank();

        // Clamp each staged row/column pointer to the matrix extent so
        // edge groups never form out-of-bounds addresses.
        for i in 0..self.np_a {
            match self.key.a_trans {
                Trans::N => {
                    let c = i * p.local_fetch_0 * p.simd_width;
                    st.line(format!(
                        "Ai[{i}] += ({c} < M) ? (int)((idT.x + {c}){}) : 0;",
                        self.as1
                    ));
                }
                Trans::T => {
                    let c = i * p.local_fetch_1;
                    st.line(format!(
                        "Ai[{i}] += ({c} < M) ? (int)((idT.y + {c})*lda) : 0;"
                    ));
                }
            }
        }
        for i in 0..self.np_b {
            match self.key.b_trans {
                Trans::T => {
                    let c = i * p.local_fetch_0 * p.simd_width;
                    st.line(format!(
                        "Bi[{i}] += ({c} < N) ? (int)((idT.x + {c}){}) : 0;",
                        self.bs1
                    ));
                }
                Trans::N => {
                    let c = i * p.local_fetch_1;
                    st.line(format!(
                        "Bi[{i}] += ({c} < N) ? (int)((idT.y + {c})*ldb) : 0;"
                    ));
                }
            }
        }
        st.blank();
    }

    // Phase 4: the steady-state outer loop.
    fn outer_loop(&self, st: &mut SourceText) {
        st.line("//Outer loop");
        st.line(format!("while(K >= {})", self.p.kl));
        st.line("{");
        st.indent();
        self.copy_and_compute(st, false);
        st.dedent();
        st.line("}");
    }

    // Phase 5: boundary predicates plus a zero-padding re-run.
    fn tail(&self, st: &mut SourceText) {
        let p = &self.p;
        if self.key.a_trans == Trans::N || self.key.b_trans == Trans::T {
            st.line("int Ky = K - idT.y;");
            for k in (0..p.kl).step_by(p.local_fetch_1 as usize) {
                st.line(format!("int condy{k} = {k} < Ky;"));
            }
        }
        if self.key.a_trans == Trans::T || self.key.b_trans == Trans::N {
            st.line("int Kx = K - idT.x;");
            for k in (0..p.kl).step_by((p.local_fetch_0 * p.simd_width) as usize) {
                for s in 0..p.simd_width {
                    st.line(format!("int condx{} = {} < Kx;", k + s, k + s));
                }
            }
        }
        self.copy_and_compute(st, true);
    }

    /// One barrier-copy-barrier-compute round. `last_iteration` swaps the
    /// packed loads for per-lane predicated scalar loads with zero padding.
    fn copy_and_compute(&self, st: &mut SourceText, last_iteration: bool) {
        let p = &self.p;
        let (sw, lf0, lf1) = (p.simd_width, p.local_fetch_0, p.local_fetch_1);
        st.line(format!("{};", self.backend.barrier()));
        let lp = self.backend.local_ptr_qualifier();
        st.line(format!(
            "{lp}{}* ldsA = lA + idT.y*{} + idT.x;",
            self.sdtype, self.llda
        ));
        st.line(format!(
            "{lp}{}* ldsB = lB + idT.y*{} + idT.x;",
            self.sdtype, self.lldb
        ));

        st.line("//Fetch A to local memory");
        match self.key.a_trans {
            Trans::N => {
                for k in (0..p.kl).step_by(lf1 as usize) {
                    for m in (0..p.ml).step_by((lf0 * sw) as usize) {
                        let mm = m / (sw * lf0);
                        if last_iteration {
                            for s in 0..sw {
                                st.line(format!(
                                    "ldsA[{}] = (condy{k} && {s} < M) ? Ai[{mm}][{k}*lda + {s}{}] : 0;",
                                    k * self.llda + m + s,
                                    self.as1
                                ));
                            }
                        } else {
                            let load = vload(
                                sw,
                                self.sdtype,
                                "0",
                                &format!("&Ai[{mm}][{k}*lda]"),
                                self.backend,
                                false,
                            );
                            st.line(format!(
                                "{};",
                                vstore(
                                    sw,
                                    self.sdtype,
                                    &load,
                                    "0",
                                    &format!("ldsA + {}", k * self.llda + m),
                                    self.backend
                                )
                            ));
                        }
                    }
                }
            }
            Trans::T => {
                for k in (0..p.kl).step_by((lf0 * sw) as usize) {
                    for m in (0..p.ml).step_by(lf1 as usize) {
                        let mm = m / lf1;
                        if last_iteration {
                            for s in 0..sw {
                                st.line(format!(
                                    "ldsA[{}] = condx{} ? Ai[{mm}][{}{}] : 0;",
                                    m * self.llda + k + s,
                                    k + s,
                                    k + s,
                                    self.as1
                                ));
                            }
                        } else {
                            let load = vload(
                                sw,
                                self.sdtype,
                                "0",
                                &format!("&Ai[{mm}][{k}{}]", self.as1),
                                self.backend,
                                false,
                            );
                            st.line(format!(
                                "{};",
                                vstore(
                                    sw,
                                    self.sdtype,
                                    &load,
                                    "0",
                                    &format!("ldsA + {}", m * self.llda + k),
                                    self.backend
                                )
                            ));
                        }
                    }
                }
            }
        }

        st.line("//Fetch B to local memory");
        match self.key.b_trans {
            Trans::T => {
                for k in (0..p.kl).step_by(lf1 as usize) {
                    for n in (0..p.nl).step_by((lf0 * sw) as usize) {
                        let nn = n / (sw * lf0);
                        if last_iteration {
                            for s in 0..sw {
                                st.line(format!(
                                    "ldsB[{}] = (condy{k} && {s} < N) ? Bi[{nn}][{k}*ldb + {s}{}] : 0;",
                                    k * self.lldb + n + s,
                                    self.bs1
                                ));
                            }
                        } else {
                            let load = vload(
                                sw,
                                self.sdtype,
                                "0",
                                &format!("&Bi[{nn}][{k}*ldb]"),
                                self.backend,
                                false,
                            );
                            st.line(format!(
                                "{};",
                                vstore(
                                    sw,
                                    self.sdtype,
                                    &load,
                                    "0",
                                    &format!("ldsB + {}", k * self.lldb + n),
                                    self.backend
                                )
                            ));
                        }
                    }
                }
            }
            Trans::N => {
                for k in (0..p.kl).step_by((lf0 * sw) as usize) {
                    for n in (0..p.nl).step_by(lf1 as usize) {
                        let nn = n / lf1;
                        if last_iteration {
                            for s in 0..sw {
                                st.line(format!(
                                    "ldsB[{}] = condx{} ? Bi[{nn}][{}{}] : 0;",
                                    n * self.lldb + k + s,
                                    k + s,
                                    k + s,
                                    self.bs1
                                ));
                            }
                        } else {
                            let load = vload(
                                sw,
                                self.sdtype,
                                "0",
                                &format!("&Bi[{nn}][{k}{}]", self.bs1),
                                self.backend,
                                false,
                            );
                            st.line(format!(
                                "{};",
                                vstore(
                                    sw,
                                    self.sdtype,
                                    &load,
                                    "0",
                                    &format!("ldsB + {}", n * self.lldb + k),
                                    self.backend
                                )
                            ));
                        }
                    }
                }
            }
        }

        // Rebase the shared-panel pointers to this work-item's lanes.
        match self.key.a_trans {
            Trans::N => st.line(format!("ldsA = lA + ids.z*{};", sw)),
            Trans::T => st.line(format!("ldsA = lA + ids.z*{};", self.llda * sw)),
        }
        match self.key.b_trans {
            Trans::T => st.line(format!("ldsB = lB + ids.w*{};", sw)),
            Trans::N => st.line(format!("ldsB = lB + ids.w*{};", self.lldb * sw)),
        }
        st.line(format!("{};", self.backend.barrier()));

        st.line("//Inner loop");
        st.line(format!(
            "for(unsigned int k = 0; k < {}; k+={}){{",
            p.kl, p.ks
        ));
        st.indent();

        st.line("//Fetch A to registers");
        st.line("#pragma unroll");
        st.line(format!("for(unsigned int kk = 0; kk < {}; kk++)", p.ks));
        st.line(format!("#pragma unroll {}", p.ms / sw));
        st.line(format!(
            "for(unsigned int mm = 0; mm < {}; mm++)",
            p.ms / sw
        ));
        st.line("{");
        st.indent();
        match self.key.a_trans {
            Trans::N => {
                let ptr = format!(
                    "ldsA + k*{} + mm*{} + kk*{}",
                    self.llda,
                    p.local_size_0 * sw,
                    self.llda
                );
                st.line(format!(
                    "rA[kk][mm] = {};",
                    vload(sw, self.sdtype, "0", &ptr, self.backend, true)
                ));
            }
            Trans::T => {
                if sw == 1 {
                    st.line(format!(
                        "rA[kk][mm] = ldsA[k + mm*{} + kk];",
                        p.local_size_0 * self.llda
                    ));
                } else {
                    for s in 0..sw {
                        st.line(format!(
                            "{} = ldsA[k + (mm*{} + {s})*{} + kk];",
                            vector_component("rA[kk][mm]", s),
                            sw * p.local_size_0,
                            self.llda
                        ));
                    }
                }
            }
        }
        st.dedent();
        st.line("}");

        st.line("//Fetch B to registers");
        st.line(format!("#pragma unroll {}", p.ks));
        st.line(format!("for(unsigned int kk = 0; kk < {}; kk++)", p.ks));
        st.line(format!("#pragma unroll {}", p.ns / sw));
        st.line(format!(
            "for(unsigned int nn = 0; nn < {}; nn++)",
            p.ns / sw
        ));
        st.line("{");
        st.indent();
        match self.key.b_trans {
            Trans::T => {
                let ptr = format!(
                    "ldsB + k*{} + nn*{} + kk*{}",
                    self.lldb,
                    p.local_size_1 * sw,
                    self.lldb
                );
                st.line(format!(
                    "rB[kk][nn] = {};",
                    vload(sw, self.sdtype, "0", &ptr, self.backend, true)
                ));
            }
            Trans::N => {
                if sw == 1 {
                    st.line(format!(
                        "rB[kk][nn] = ldsB[k + nn*{} + kk];",
                        p.local_size_1 * self.lldb
                    ));
                } else {
                    for s in 0..sw {
                        st.line(format!(
                            "{} = ldsB[k + (nn*{} + {s})*{} + kk];",
                            vector_component("rB[kk][nn]", s),
                            sw * p.local_size_1,
                            self.lldb
                        ));
                    }
                }
            }
        }
        st.dedent();
        st.line("}");

        st.line("//FMA computations");
        for kk in 0..p.ks {
            for nn in 0..p.ns {
                for mm in 0..p.ms {
                    let res = format!("rC[{mm}][{nn}]");
                    let lhs = if sw == 1 {
                        format!("rA[{kk}][{mm}]")
                    } else {
                        vector_component(&format!("rA[{kk}][{}]", mm / sw), mm % sw)
                    };
                    let rhs = if sw == 1 {
                        format!("rB[{kk}][{nn}]")
                    } else {
                        vector_component(&format!("rB[{kk}][{}]", nn / sw), nn % sw)
                    };
                    st.line(format!("{res} = fma({lhs},{rhs},{res});"));
                }
            }
        }

        st.dedent();
        st.line("}");
        st.line(format!("K -= {};", p.kl));

        // Advance the staged pointers along the contracting axis.
        match self.key.a_trans {
            Trans::N => {
                for i in 0..self.np_a {
                    st.line(format!("Ai[{i}] += {}*lda;", p.kl));
                }
            }
            Trans::T => {
                for i in 0..self.np_a {
                    st.line(format!("Ai[{i}] += {}{};", p.kl, self.as1));
                }
            }
        }
        match self.key.b_trans {
            Trans::T => {
                for i in 0..self.np_b {
                    st.line(format!("Bi[{i}] += {}*ldb;", p.kl));
                }
            }
            Trans::N => {
                for i in 0..self.np_b {
                    st.line(format!("Bi[{i}] += {}{};", p.kl, self.bs1));
                }
            }
        }
    }

    // Phase 6: writeback.
    fn writeback(&self, st: &mut SourceText) {
        let p = &self.p;
        let sw = p.simd_width;
        st.line("//Write back C");
        st.line("M += ids.x;");
        match self.key.a_trans {
            Trans::N => st.line("M += idT.x;"),
            Trans::T => st.line("M += idT.y;"),
        }
        match self.key.b_trans {
            Trans::T => st.line("N += idT.x;"),
            Trans::N => st.line("N += idT.y;"),
        }
        st.line("N += ids.y;");

        st.line(format!("C += ids.x{};", self.cs1));
        st.line(format!("C += ids.z*{}{};", sw, self.cs1));
        st.line("C += ids.y*ldc;");
        st.line(format!("C += ids.w*{}*ldc;", sw));
        if self.has_depth {
            st.line("C += gidz*ldc*N;");
        }

        st.line("M -= ids.x;");
        st.line(format!("M -= ids.z*{};", sw));
        st.line("N -= ids.y;");
        st.line(format!("N -= ids.w*{};", sw));

        for n in 0..p.ns {
            let cj = (n / sw) * (p.local_size_1 * sw) + n % sw;
            st.line(format!("if({cj} >= N) return;"));
            for m in 0..p.ms {
                st.line(format!("rC[{m}][{n}] *= alpha;"));
            }
            for m in 0..p.ms {
                let ci = (m / sw) * (p.local_size_0 * sw) + m % sw;
                if self.has_depth {
                    // Raw α-scaled partials; β belongs to the reduction.
                    st.line(format!(
                        "if({ci} < M) C[{ci}{}] = rC[{m}][{n}];",
                        self.cs1
                    ));
                } else {
                    st.line(format!(
                        "if({ci} < M) C[{ci}{}] = rC[{m}][{n}] + beta*C[{ci}{}];",
                        self.cs1, self.cs1
                    ));
                }
            }
            if (n + 1) % sw == 0 {
                st.line(format!("C += ldc*{};", p.local_size_1 * sw - sw + 1));
            } else {
                st.line("C += ldc;");
            }
        }
    }

    // The split-K reduction: iterate the output plane, fold the partial
    // planes, apply β against the user's C.
    fn reduce_kernel(&self, st: &mut SourceText) {
        let (s, g, d) = (self.size_t, self.glob, self.sdtype);
        st.line(format!(
            "{} void {}({s} M, {s} N, {s} D, {g}{d}* Z, {s} Zld, {g}{d}* C, {s} ldc, \
             {s} Cstart1, {s} Cstart2, {s} Cstride1, {s} Cstride2, {d} beta)",
            self.backend.kernel_prefix(),
            self.reduce_name,
        ));
        st.line("{");
        st.indent();
        st.line("C += Cstart1 + Cstart2*ldc;");
        st.line("ldc *= Cstride2;");
        st.line(format!(
            "for(unsigned int i = {} ; i < M ; i += {})",
            self.backend.global_idx(0),
            self.backend.global_size(0)
        ));
        st.line("{");
        st.indent();
        st.line(format!(
            "for(unsigned int j = {} ; j < N ; j += {})",
            self.backend.global_idx(1),
            self.backend.global_size(1)
        ));
        st.line("{");
        st.indent();
        st.line(format!("{} acc = 0;", self.sdtype));
        st.line("for(unsigned int k = 0 ; k < D ; k++)");
        st.indent();
        st.line("acc += Z[i + j*Zld + k*Zld*N];");
        st.dedent();
        st.line("C[i*Cstride1 + j*ldc] = acc + beta*C[i*Cstride1 + j*ldc];");
        st.dedent();
        st.line("}");
        st.dedent();
        st.line("}");
        st.dedent();
        st.line("}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::FetchingPolicy;

    fn params(simd: u32, depth: u32) -> GemmParameters {
        GemmParameters::new(
            simd,
            8,
            8,
            8,
            depth,
            4,
            4,
            4,
            FetchingPolicy::Local,
            FetchingPolicy::Local,
            8,
            8,
        )
    }

    fn key(backend: Backend, simd: u32, depth: u32, check_bounds: bool) -> SpecializationKey {
        SpecializationKey {
            params: params(simd, depth),
            a_trans: Trans::N,
            b_trans: Trans::N,
            check_bounds,
            backend,
            dtype: Dtype::F32,
        }
    }

    #[test]
    fn cuda_preamble_and_signature() {
        let src = generate(&key(Backend::Cuda, 1, 1, false), "");
        assert!(src.contains("#include \"helper_math.h\""));
        assert!(src.contains("extern \"C\" __global__ void gemm("));
        assert!(src.contains("unsigned int M, unsigned int N, unsigned int K"));
        assert!(src.contains("while(K >= 8)"));
        assert!(src.contains("__syncthreads();"));
        assert!(src.contains("__shared__ float lA[256];"));
    }

    #[test]
    fn opencl_preamble_and_size_type() {
        let src = generate(&key(Backend::OpenCl, 4, 1, false), "");
        assert!(src.contains("__attribute__((reqd_work_group_size(8,8,1)))"));
        assert!(src.contains("__kernel void gemm("));
        assert!(src.contains("unsigned long M, unsigned long N, unsigned long K"));
        assert!(src.contains("barrier(CLK_LOCAL_MEM_FENCE);"));
        assert!(src.contains("vload4("));
        assert!(src.contains("vstore4("));
        assert!(src.contains("__local float lA"));
    }

    #[test]
    fn host_preamble() {
        let src = generate(&key(Backend::Host, 1, 1, false), "");
        assert!(src.contains("#include \"host_math.h\""));
        assert!(src.contains("static void gemm("));
        assert!(src.contains("size_t M"));
    }

    #[test]
    fn fma_block_is_fully_unrolled_twice() {
        // mS·nS·kS = 64 multiply-adds per round, steady state plus tail.
        let src = generate(&key(Backend::Cuda, 1, 1, false), "");
        let count = src.matches("= fma(").count();
        assert_eq!(count, 2 * 4 * 4 * 4);
    }

    #[test]
    fn fast_path_elides_strides_and_fallback_emits_them() {
        let fast = generate(&key(Backend::Cuda, 1, 1, false), "");
        assert!(!fast.contains("*Astride1"));
        assert!(!fast.contains("*Cstride1"));

        let fallback = generate(&key(Backend::Cuda, 1, 1, true), "fallback");
        assert!(fallback.contains("void gemmfallback("));
        assert!(fallback.contains("*Astride1"));
        assert!(fallback.contains("*Bstride1"));
        assert!(fallback.contains("*Cstride1"));
    }

    #[test]
    fn single_pass_applies_beta_in_writeback() {
        let src = generate(&key(Backend::Cuda, 1, 1, false), "");
        assert!(src.contains("+ beta*C["));
        assert!(!src.contains("void reduce"));
    }

    #[test]
    fn split_k_emits_two_entry_points_and_defers_beta() {
        let src = generate(&key(Backend::Cuda, 1, 4, false), "");
        let reduce_at = src.find("void reduce").expect("reduction kernel");
        let main = &src[..reduce_at];
        let reduce = &src[reduce_at..];
        assert!(main.contains("gidz"));
        assert!(main.contains("div = (K+3)/4;"));
        assert!(!main.contains("+ beta*C["));
        assert!(reduce.contains("acc + beta*C["));
        assert!(reduce.contains("Z[i + j*Zld + k*Zld*N]"));
    }

    #[test]
    fn tail_predicates_match_transposes() {
        let nn = generate(&key(Backend::Cuda, 1, 1, false), "");
        // A 'N' loads guard with condy, B 'N' with condx.
        assert!(nn.contains("int Ky = K - idT.y;"));
        assert!(nn.contains("int Kx = K - idT.x;"));
        assert!(nn.contains("condy0"));
        assert!(nn.contains("condx0"));

        let mut k = key(Backend::Cuda, 1, 1, false);
        k.a_trans = Trans::T;
        k.b_trans = Trans::T;
        let tt = generate(&k, "");
        // A 'T' uses condx, B 'T' uses condy.
        assert!(tt.contains("int Ky = K - idT.y;"));
        assert!(tt.contains("int Kx = K - idT.x;"));
    }

    #[test]
    fn emission_is_pure_and_digest_is_stable() {
        let k = key(Backend::OpenCl, 4, 4, false);
        assert_eq!(generate(&k, ""), generate(&k, ""));
        assert_eq!(k.digest(), k.digest());

        let mut other = k.clone();
        other.params.depth = 1;
        assert_ne!(k.digest(), other.digest());
        let mut other = k.clone();
        other.check_bounds = true;
        assert_ne!(k.digest(), other.digest());
    }

    #[test]
    fn shared_panel_layout_follows_transposes() {
        // NN: llda = mL = 32, lldb = kL = 8.
        let nn = generate(&key(Backend::Cuda, 1, 1, false), "");
        assert!(nn.contains("ldsA = lA + idT.y*32 + idT.x;"));
        assert!(nn.contains("ldsB = lB + idT.y*8 + idT.x;"));

        let mut k = key(Backend::Cuda, 1, 1, false);
        k.a_trans = Trans::T;
        let tn = generate(&k, "");
        assert!(tn.contains("ldsA = lA + idT.y*8 + idT.x;"));
    }
}
