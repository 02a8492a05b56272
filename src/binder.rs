//! Argument binding and the packed launch ABI
//!
//! A launch marshals its arguments into one contiguous byte buffer whose
//! layout must match the emitted kernel signature exactly: buffer handles
//! are machine words, naturally aligned; size-type scalars are 32-bit on
//! CUDA and 64-bit on OpenCL and the host; α/β payloads are dtype-sized and
//! dtype-aligned. [`ArgPack`] is the writer, [`ArgReader`] the matching
//! unpacker used by the host backend.
//!
//! Slot assignment follows one of two policies while walking an expression
//! tree in left-to-right post-order: `Independent` gives every occurrence
//! of a tensor a fresh slot, `ToHandle` shares a slot between occurrences
//! of the same underlying buffer. The matrix-product planner binds
//! independently and writes the signature order by hand; the tree walk is
//! the generic surface.

use crate::backend::Backend;
use crate::driver::DriverError;
use crate::expr::{Array, Dtype, ExprNode, ExprTree};
use std::collections::HashMap;

/// How occurrences of the same tensor map to argument slots.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BindingPolicy {
    /// Every occurrence gets a fresh slot.
    Independent,
    /// Occurrences sharing an underlying buffer handle share a slot.
    ToHandle,
}

/// Assigns argument slots to tensor handles under a [`BindingPolicy`].
#[derive(Debug)]
pub struct SymbolicBinder {
    policy: BindingPolicy,
    slots: HashMap<u64, u32>,
    next: u32,
}

impl SymbolicBinder {
    /// A binder with the given policy.
    pub fn new(policy: BindingPolicy) -> SymbolicBinder {
        SymbolicBinder { policy, slots: HashMap::new(), next: 0 }
    }

    /// Bind one tensor occurrence. Returns `(slot, first_binding)`;
    /// `first_binding` is `false` only under `ToHandle` when the handle was
    /// seen before.
    pub fn bind(&mut self, handle: u64) -> (u32, bool) {
        match self.policy {
            BindingPolicy::Independent => {
                let slot = self.next;
                self.next += 1;
                (slot, true)
            }
            BindingPolicy::ToHandle => {
                if let Some(&slot) = self.slots.get(&handle) {
                    return (slot, false);
                }
                let slot = self.next;
                self.next += 1;
                self.slots.insert(handle, slot);
                (slot, true)
            }
        }
    }

    /// Number of distinct slots assigned so far.
    pub fn num_slots(&self) -> u32 {
        self.next
    }
}

// ===========================================================================
// Packed argument buffer
// ===========================================================================

#[inline]
fn align_up(cursor: usize, align: usize) -> usize {
    (cursor + align - 1) / align * align
}

/// The packed argument buffer for one launch, plus its write cursor.
#[derive(Clone, Debug)]
pub struct ArgPack {
    backend: Backend,
    bytes: Vec<u8>,
}

impl ArgPack {
    /// An empty pack targeting `backend`'s ABI.
    pub fn new(backend: Backend) -> ArgPack {
        ArgPack { backend, bytes: Vec::new() }
    }

    /// Backend whose size-type width governs integer slots.
    pub fn backend(&self) -> Backend {
        self.backend
    }

    fn pad_to(&mut self, align: usize) {
        let target = align_up(self.bytes.len(), align);
        self.bytes.resize(target, 0);
    }

    /// Append a size-type scalar (32-bit on CUDA, 64-bit elsewhere).
    pub fn push_size(&mut self, v: u64) {
        let width = self.backend.size_width();
        self.pad_to(width);
        if width == 4 {
            debug_assert!(v <= u64::from(u32::MAX), "size argument overflows 32 bits");
            self.bytes.extend_from_slice(&(v as u32).to_le_bytes());
        } else {
            self.bytes.extend_from_slice(&v.to_le_bytes());
        }
    }

    /// Append a machine-word buffer handle, naturally aligned.
    pub fn push_handle(&mut self, handle: u64) {
        self.pad_to(8);
        self.bytes.extend_from_slice(&handle.to_le_bytes());
    }

    /// Append a dtype-sized scalar payload, aligned to the dtype.
    pub fn push_scalar(&mut self, dtype: Dtype, v: f64) {
        self.pad_to(dtype.size_of());
        match dtype {
            Dtype::F32 => self.bytes.extend_from_slice(&(v as f32).to_le_bytes()),
            Dtype::F64 => self.bytes.extend_from_slice(&v.to_le_bytes()),
        }
    }

    /// Raw packed bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Current write cursor (total packed length).
    pub fn cursor(&self) -> usize {
        self.bytes.len()
    }

    /// An unpacker positioned at the start of the pack.
    pub fn reader(&self) -> ArgReader<'_> {
        ArgReader { backend: self.backend, bytes: &self.bytes, cursor: 0 }
    }
}

/// Sequential unpacker over an [`ArgPack`], walking the same alignment
/// discipline as the writer.
pub struct ArgReader<'a> {
    backend: Backend,
    bytes: &'a [u8],
    cursor: usize,
}

impl<'a> ArgReader<'a> {
    fn take(&mut self, align: usize, len: usize) -> Result<&'a [u8], DriverError> {
        let start = align_up(self.cursor, align);
        let end = start + len;
        if end > self.bytes.len() {
            return Err(DriverError::BadArguments { cursor: self.cursor });
        }
        self.cursor = end;
        Ok(&self.bytes[start..end])
    }

    /// Read the next size-type scalar.
    pub fn next_size(&mut self) -> Result<u64, DriverError> {
        let width = self.backend.size_width();
        let raw = self.take(width, width)?;
        Ok(if width == 4 {
            u64::from(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
        } else {
            u64::from_le_bytes([
                raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
            ])
        })
    }

    /// Read the next buffer handle.
    pub fn next_handle(&mut self) -> Result<u64, DriverError> {
        let raw = self.take(8, 8)?;
        Ok(u64::from_le_bytes([
            raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
        ]))
    }

    /// Read the next dtype-sized scalar payload.
    pub fn next_scalar(&mut self, dtype: Dtype) -> Result<f64, DriverError> {
        let raw = self.take(dtype.size_of(), dtype.size_of())?;
        Ok(match dtype {
            Dtype::F32 => f64::from(f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
            Dtype::F64 => f64::from_le_bytes([
                raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
            ]),
        })
    }
}

// ===========================================================================
// Binding helpers
// ===========================================================================

/// Bind one tensor occurrence and write its argument group: base handle,
/// `ld·stride[1]`, start offset, `stride[0]`.
pub fn push_array(pack: &mut ArgPack, binder: &mut SymbolicBinder, array: &Array) {
    let (_slot, _first) = binder.bind(array.data().handle());
    pack.push_handle(array.data().handle());
    pack.push_size((array.ld() * array.stride()[1]) as u64);
    pack.push_size((array.start()[0] + array.start()[1] * array.ld()) as u64);
    pack.push_size(array.stride()[0] as u64);
}

/// Walk `tree` in left-to-right post-order (node ids memoized, so shared
/// subterms bind once) and pack every tensor and scalar leaf under the
/// given policy. Returns the pack and its binder.
pub fn bind_expression(
    tree: &ExprTree,
    policy: BindingPolicy,
    backend: Backend,
) -> (ArgPack, SymbolicBinder) {
    let mut pack = ArgPack::new(backend);
    let mut binder = SymbolicBinder::new(policy);
    tree.visit_post_order(|_, node| match node {
        ExprNode::Leaf(array) => {
            let (_slot, first) = binder.bind(array.data().handle());
            if first {
                pack.push_handle(array.data().handle());
                pack.push_size((array.ld() * array.stride()[1]) as u64);
                pack.push_size(
                    (array.start()[0] + array.start()[1] * array.ld()) as u64,
                );
                pack.push_size(array.stride()[0] as u64);
            }
        }
        ExprNode::Scalar { dtype, value } => {
            pack.push_scalar(*dtype, *value);
        }
        _ => {}
    });
    (pack, binder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Context, Device};
    use crate::params::Trans;

    #[test]
    fn cuda_sizes_are_narrow_and_handles_aligned() {
        let mut pack = ArgPack::new(Backend::Cuda);
        pack.push_size(64); // bytes 0..4
        pack.push_handle(7); // pads to 8, bytes 8..16
        pack.push_size(3); // bytes 16..20
        pack.push_scalar(Dtype::F32, 1.5); // bytes 20..24
        assert_eq!(pack.cursor(), 24);

        let mut r = pack.reader();
        assert_eq!(r.next_size().unwrap(), 64);
        assert_eq!(r.next_handle().unwrap(), 7);
        assert_eq!(r.next_size().unwrap(), 3);
        assert_eq!(r.next_scalar(Dtype::F32).unwrap(), 1.5);
        assert!(r.next_size().is_err());
    }

    #[test]
    fn opencl_sizes_are_wide() {
        let mut pack = ArgPack::new(Backend::OpenCl);
        pack.push_size(1u64 << 40);
        pack.push_scalar(Dtype::F64, -2.25);
        assert_eq!(pack.cursor(), 16);
        let mut r = pack.reader();
        assert_eq!(r.next_size().unwrap(), 1u64 << 40);
        assert_eq!(r.next_scalar(Dtype::F64).unwrap(), -2.25);
    }

    #[test]
    fn binding_policies_differ_on_shared_handles() {
        let mut ind = SymbolicBinder::new(BindingPolicy::Independent);
        assert_eq!(ind.bind(42), (0, true));
        assert_eq!(ind.bind(42), (1, true));
        assert_eq!(ind.num_slots(), 2);

        let mut shared = SymbolicBinder::new(BindingPolicy::ToHandle);
        assert_eq!(shared.bind(42), (0, true));
        assert_eq!(shared.bind(42), (0, false));
        assert_eq!(shared.bind(43), (1, true));
        assert_eq!(shared.num_slots(), 2);
    }

    #[test]
    fn tree_walk_packs_shared_leaf_once_under_to_handle() {
        let ctx = Context::new(&Device::host()).unwrap();
        let a = Array::new(&ctx, &[8, 4], Dtype::F32).unwrap();
        let b = Array::new(&ctx, &[4, 8], Dtype::F32).unwrap();
        let c = Array::new(&ctx, &[8, 8], Dtype::F32).unwrap();
        let tree = crate::expr::gemm(1.0, &a, Trans::N, &b, Trans::N, 1.0, &c);

        let (_pack, binder) = bind_expression(&tree, BindingPolicy::ToHandle, Backend::Host);
        // Three distinct tensors, the shared C leaf bound once.
        assert_eq!(binder.num_slots(), 3);
    }
}
