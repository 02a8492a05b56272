//! Crate root: public surface and engine-wide invariants
//!
//! This module is the **single canonical entry-point** for downstream users
//! of the library. It re-exports the types that make up the specialization
//! pipeline (parameter records, the validity oracle, the source emitter,
//! the argument binder, the launch planner and the driver seam) so callers
//! import from the crate root rather than from individual submodules.
//!
//! ## Invariants (engine-wide)
//!
//! - **Purity of the front half.** Parameter validation and source emission
//!   are pure functions of their inputs: the oracle never touches a device,
//!   and identical [`SpecializationKey`]s always yield identical text. Both
//!   are therefore safe to call from any thread and to cache by key digest.
//!
//! - **One specialization per key.** A kernel text is determined by the
//!   full tuple `(parameters, A-transpose, B-transpose, bounds mode,
//!   backend, scalar type)`. Compiled binaries are cached externally under
//!   the key's digest; nothing in this crate retains them.
//!
//! - **Launch ABI.** The packed argument buffer written by the binder
//!   matches the emitted signature exactly: machine-word buffer handles,
//!   naturally aligned; size-type integers 32-bit on CUDA and 64-bit on
//!   OpenCL and the host; dtype-sized α/β payloads. See [`binder`].
//!
//! - **Ordering.** Within one stream, enqueues execute in order; the
//!   split-K reduction is sequenced after its main kernel by stream order
//!   alone. Nothing is retried: validation failures are values, driver
//!   failures are structured errors, and the strided-input fallback is a
//!   specialization switch rather than error recovery.
//!
//! We **forbid unsafe** throughout the crate; device memory is addressed
//! exclusively through opaque buffer handles resolved by the owning
//! context.

#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms)]

/// Backend tag and the keyword table consumed by the emitter.
pub mod backend;
/// Argument slot assignment and the packed launch ABI.
pub mod binder;
/// Devices, contexts, buffers, streams, programs, events.
pub mod driver;
/// Kernel source emission (the specialization engine).
pub mod emit;
/// Expression containers and the GEMM preset matcher.
pub mod expr;
/// Host-backend kernel execution.
mod host;
/// Launch planning: grid math, split-K scratch, fallback switch.
pub mod launch;
/// Tunable parameter records.
pub mod params;
/// Tuning profiles and the random-forest predictor.
pub mod profiles;
/// The validity oracle and its code table.
pub mod validity;

pub use backend::Backend;
pub use binder::{ArgPack, BindingPolicy, SymbolicBinder};
pub use driver::{Buffer, Context, ContextGuard, Device, DriverError, Event, Kernel, Program,
    ProgramUnit, Stream};
pub use emit::{generate, SourceText, SpecializationKey};
pub use expr::{Array, Dtype, ExprError, ExprNode, ExprTree, GemmArgs};
pub use launch::{Gemm, LaunchError};
pub use params::{FetchingPolicy, GemmParameters, Trans};
pub use profiles::{Profile, RandomForest};
pub use validity::{check, is_invalid, InvalidKernel, VALID};
