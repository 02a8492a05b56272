//! Expression container and GEMM preset matcher
//!
//! The engine consumes a small in-memory expression tree: dense matrix
//! leaves, scalar coefficients, `Trans` markers above leaves, a matrix
//! product, scaling, addition, and an assignment root. Trees are arenas of
//! nodes addressed by [`NodeId`]; shared subterms (a scalar reused in α and
//! β, a leaf appearing on both sides of the assignment) are expressed by
//! reusing ids, and every traversal memoizes visited ids rather than relying
//! on reference identity.
//!
//! The preset matcher recognizes the one shape the engine specializes,
//! `C ← β·C + α·op(A)·op(B)`, and extracts operands, coefficients and
//! transpose flags. Anything else is `operation not supported`.

use crate::driver::{Buffer, Context, DriverError, Stream};
use crate::params::Trans;
use std::sync::Arc;

/// Scalar element type of a tensor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Dtype {
    /// IEEE-754 binary32.
    F32,
    /// IEEE-754 binary64.
    F64,
}

impl Dtype {
    /// Element size in bytes.
    #[inline]
    pub fn size_of(self) -> usize {
        match self {
            Dtype::F32 => 4,
            Dtype::F64 => 8,
        }
    }

    /// Spelling in emitted device source.
    #[inline]
    pub fn c_name(self) -> &'static str {
        match self {
            Dtype::F32 => "float",
            Dtype::F64 => "double",
        }
    }

    /// Stable tag used in canonical key encodings.
    #[inline]
    pub fn tag(self) -> u8 {
        match self {
            Dtype::F32 => 0,
            Dtype::F64 => 1,
        }
    }
}

/// Errors surfaced by the expression layer.
#[derive(Debug, thiserror::Error)]
pub enum ExprError {
    /// The tree does not have the one shape the engine specializes, or its
    /// operand shapes are incoherent.
    #[error("operation not supported: {0}")]
    OperationNotSupported(&'static str),
}

// ===========================================================================
// Dense array descriptor
// ===========================================================================

/// A dense column-major matrix (or 3-D split-K scratch) view over a device
/// buffer.
///
/// Element `(i, j)` lives at `start[0] + i·stride[0] + (start[1] + j·stride[1])·ld`
/// in elements from the buffer base. A third shape extent addresses split-K
/// planes of `ld·shape[1]` elements each.
#[derive(Clone, Debug)]
pub struct Array {
    shape: Vec<usize>,
    ld: usize,
    start: [usize; 2],
    stride: [usize; 2],
    dtype: Dtype,
    data: Buffer,
}

impl Array {
    /// Allocate a contiguous array of the given shape (`ld = shape[0]`,
    /// zero start, unit strides).
    pub fn new(ctx: &Arc<Context>, shape: &[usize], dtype: Dtype) -> Result<Array, DriverError> {
        let elems: usize = shape.iter().product();
        let data = ctx.alloc(elems * dtype.size_of())?;
        Ok(Array {
            shape: shape.to_vec(),
            ld: shape.first().copied().unwrap_or(0),
            start: [0, 0],
            stride: [1, 1],
            dtype,
            data,
        })
    }

    /// Allocate a 2-D array with an explicit layout. The backing buffer is
    /// sized to the furthest addressed element.
    pub fn with_layout(
        ctx: &Arc<Context>,
        shape: [usize; 2],
        dtype: Dtype,
        ld: usize,
        start: [usize; 2],
        stride: [usize; 2],
    ) -> Result<Array, DriverError> {
        let span = start[0]
            + start[1] * ld
            + stride[0] * shape[0].saturating_sub(1)
            + ld * stride[1] * shape[1].saturating_sub(1)
            + 1;
        let data = ctx.alloc(span * dtype.size_of())?;
        Ok(Array {
            shape: shape.to_vec(),
            ld,
            start,
            stride,
            dtype,
            data,
        })
    }

    /// Logical shape.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Leading dimension in elements.
    pub fn ld(&self) -> usize {
        self.ld
    }

    /// Start offsets along the two axes, in elements.
    pub fn start(&self) -> [usize; 2] {
        self.start
    }

    /// Strides along the two axes, in elements.
    pub fn stride(&self) -> [usize; 2] {
        self.stride
    }

    /// Element type.
    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    /// Backing device buffer.
    pub fn data(&self) -> &Buffer {
        &self.data
    }

    /// Owning context of the backing buffer.
    pub fn context(&self) -> &Arc<Context> {
        self.data.context()
    }

    /// Upload `f32` elements linearly into the backing buffer.
    pub fn upload_f32(&self, queue: &Stream, host: &[f32]) -> Result<(), DriverError> {
        let mut bytes = Vec::with_capacity(host.len() * 4);
        for v in host {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        queue.write(&self.data, 0, &bytes)
    }

    /// Download the whole backing buffer as `f32` elements.
    pub fn download_f32(&self, queue: &Stream) -> Result<Vec<f32>, DriverError> {
        let bytes = queue.read(&self.data)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

// ===========================================================================
// Expression tree
// ===========================================================================

/// Index of a node in an [`ExprTree`] arena.
pub type NodeId = usize;

/// One node of the expression tree.
#[derive(Clone, Debug)]
pub enum ExprNode {
    /// Dense matrix leaf.
    Leaf(Array),
    /// Scalar coefficient leaf.
    Scalar {
        /// Element type the payload is marshalled as.
        dtype: Dtype,
        /// Coefficient value.
        value: f64,
    },
    /// Transpose marker above an operand.
    Trans(NodeId),
    /// Matrix product of two operands.
    MatMul(NodeId, NodeId),
    /// Scalar · term.
    Scale(NodeId, NodeId),
    /// Sum of two terms.
    Add(NodeId, NodeId),
    /// Assignment of the right term into the left leaf.
    Assign(NodeId, NodeId),
}

/// An arena-allocated expression DAG with a designated root.
#[derive(Clone, Debug, Default)]
pub struct ExprTree {
    nodes: Vec<ExprNode>,
    root: NodeId,
}

impl ExprTree {
    /// Append a node and return its id.
    pub fn push(&mut self, node: ExprNode) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Mark `id` as the root.
    pub fn set_root(&mut self, id: NodeId) {
        self.root = id;
    }

    /// Root id.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Node accessor.
    pub fn node(&self, id: NodeId) -> &ExprNode {
        &self.nodes[id]
    }

    /// Number of nodes in the arena.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the arena is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Left-to-right post-order traversal from the root, visiting every
    /// node **once**. Shared subterms are memoized by id, so DAGs are
    /// handled without reference identity.
    pub fn visit_post_order(&self, mut f: impl FnMut(NodeId, &ExprNode)) {
        let mut seen = vec![false; self.nodes.len()];
        self.visit_rec(self.root, &mut seen, &mut f);
    }

    fn visit_rec(
        &self,
        id: NodeId,
        seen: &mut [bool],
        f: &mut impl FnMut(NodeId, &ExprNode),
    ) {
        if seen[id] {
            return;
        }
        seen[id] = true;
        match &self.nodes[id] {
            ExprNode::Leaf(_) | ExprNode::Scalar { .. } => {}
            ExprNode::Trans(a) => self.visit_rec(*a, seen, f),
            ExprNode::MatMul(a, b) | ExprNode::Scale(a, b) | ExprNode::Add(a, b)
            | ExprNode::Assign(a, b) => {
                self.visit_rec(*a, seen, f);
                self.visit_rec(*b, seen, f);
            }
        }
        f(id, &self.nodes[id]);
    }
}

/// Build the canonical GEMM tree `C ← β·C + α·op(A)·op(B)`.
///
/// The C leaf is a single shared node referenced from both sides of the
/// assignment, so the tree is a genuine DAG.
pub fn gemm(
    alpha: f64,
    a: &Array,
    a_trans: Trans,
    b: &Array,
    b_trans: Trans,
    beta: f64,
    c: &Array,
) -> ExprTree {
    let dtype = c.dtype();
    let mut t = ExprTree::default();
    let c_leaf = t.push(ExprNode::Leaf(c.clone()));
    let a_leaf = t.push(ExprNode::Leaf(a.clone()));
    let b_leaf = t.push(ExprNode::Leaf(b.clone()));
    let a_op = match a_trans {
        Trans::N => a_leaf,
        Trans::T => t.push(ExprNode::Trans(a_leaf)),
    };
    let b_op = match b_trans {
        Trans::N => b_leaf,
        Trans::T => t.push(ExprNode::Trans(b_leaf)),
    };
    let prod = t.push(ExprNode::MatMul(a_op, b_op));
    let alpha_s = t.push(ExprNode::Scalar { dtype, value: alpha });
    let scaled = t.push(ExprNode::Scale(alpha_s, prod));
    let beta_s = t.push(ExprNode::Scalar { dtype, value: beta });
    let c_term = t.push(ExprNode::Scale(beta_s, c_leaf));
    let sum = t.push(ExprNode::Add(c_term, scaled));
    let root = t.push(ExprNode::Assign(c_leaf, sum));
    t.set_root(root);
    t
}

// ===========================================================================
// Preset matcher
// ===========================================================================

/// Operands and coefficients extracted from a GEMM-shaped tree.
#[derive(Clone, Debug)]
pub struct GemmArgs {
    /// Left operand.
    pub a: Array,
    /// Right operand.
    pub b: Array,
    /// Output (and β-scaled input).
    pub c: Array,
    /// Transpose flag on A.
    pub a_trans: Trans,
    /// Transpose flag on B.
    pub b_trans: Trans,
    /// α coefficient.
    pub alpha: f64,
    /// β coefficient.
    pub beta: f64,
}

impl GemmArgs {
    /// Match `C ← β·C + α·op(A)·op(B)` (α, β, the addition and the transpose
    /// markers each optional) and validate operand-shape coherence.
    pub fn match_tree(tree: &ExprTree) -> Result<GemmArgs, ExprError> {
        let (target, rhs) = match tree.node(tree.root()) {
            ExprNode::Assign(lhs, rhs) => (*lhs, *rhs),
            _ => return Err(ExprError::OperationNotSupported("root is not an assignment")),
        };
        let c = match tree.node(target) {
            ExprNode::Leaf(arr) => arr.clone(),
            _ => return Err(ExprError::OperationNotSupported("assignment target is not a leaf")),
        };

        // Split the right side into a product term and an optional β term.
        let (prod_term, beta_term) = match tree.node(rhs) {
            ExprNode::Add(x, y) => {
                if Self::find_product(tree, *x).is_some() {
                    (*x, Some(*y))
                } else {
                    (*y, Some(*x))
                }
            }
            _ => (rhs, None),
        };

        let (alpha, prod) = Self::find_product(tree, prod_term)
            .ok_or(ExprError::OperationNotSupported("no matrix product term"))?;
        let (a_id, b_id) = match tree.node(prod) {
            ExprNode::MatMul(a, b) => (*a, *b),
            _ => return Err(ExprError::OperationNotSupported("no matrix product term")),
        };
        let (a, a_trans) = Self::strip_trans(tree, a_id)?;
        let (b, b_trans) = Self::strip_trans(tree, b_id)?;

        let beta = match beta_term {
            None => 0.0,
            Some(id) => {
                let (value, leaf) = match tree.node(id) {
                    ExprNode::Leaf(_) => (1.0, id),
                    ExprNode::Scale(s, t) => match tree.node(*s) {
                        ExprNode::Scalar { value, .. } => (*value, *t),
                        _ => {
                            return Err(ExprError::OperationNotSupported(
                                "β term is not scalar·leaf",
                            ))
                        }
                    },
                    _ => return Err(ExprError::OperationNotSupported("β term is not scalar·leaf")),
                };
                match tree.node(leaf) {
                    ExprNode::Leaf(arr) if arr.data().handle() == c.data().handle() => {}
                    _ => {
                        return Err(ExprError::OperationNotSupported(
                            "β term does not read the assignment target",
                        ))
                    }
                }
                value
            }
        };

        let args = GemmArgs { a, b, c, a_trans, b_trans, alpha, beta };
        args.validate_shapes()?;
        Ok(args)
    }

    /// `(M, N, K)` with K derived from A according to its transpose flag.
    pub fn sizes(&self) -> [usize; 3] {
        let m = self.c.shape()[0];
        let n = self.c.shape()[1];
        let k = match self.a_trans {
            Trans::N => self.a.shape()[1],
            Trans::T => self.a.shape()[0],
        };
        [m, n, k]
    }

    fn validate_shapes(&self) -> Result<(), ExprError> {
        let [m, n, k] = self.sizes();
        let a_ok = match self.a_trans {
            Trans::N => self.a.shape() == [m, k],
            Trans::T => self.a.shape() == [k, m],
        };
        let b_ok = match self.b_trans {
            Trans::N => self.b.shape() == [k, n],
            Trans::T => self.b.shape() == [n, k],
        };
        if !a_ok || !b_ok || self.c.shape().len() != 2 {
            return Err(ExprError::OperationNotSupported("operand shapes are incoherent"));
        }
        Ok(())
    }

    /// Recognize `MatMul` or `Scale(scalar, MatMul)`, returning `(α, product)`.
    fn find_product(tree: &ExprTree, id: NodeId) -> Option<(f64, NodeId)> {
        match tree.node(id) {
            ExprNode::MatMul(..) => Some((1.0, id)),
            ExprNode::Scale(s, t) => match (tree.node(*s), tree.node(*t)) {
                (ExprNode::Scalar { value, .. }, ExprNode::MatMul(..)) => Some((*value, *t)),
                _ => None,
            },
            _ => None,
        }
    }

    fn strip_trans(tree: &ExprTree, id: NodeId) -> Result<(Array, Trans), ExprError> {
        match tree.node(id) {
            ExprNode::Leaf(arr) => Ok((arr.clone(), Trans::N)),
            ExprNode::Trans(inner) => match tree.node(*inner) {
                ExprNode::Leaf(arr) => Ok((arr.clone(), Trans::T)),
                _ => Err(ExprError::OperationNotSupported("transpose of a non-leaf")),
            },
            _ => Err(ExprError::OperationNotSupported("product operand is not a leaf")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Device;

    fn ctx() -> Arc<Context> {
        Context::new(&Device::host()).unwrap()
    }

    #[test]
    fn preset_extracts_operands_and_flags() {
        let ctx = ctx();
        let a = Array::new(&ctx, &[64, 32], Dtype::F32).unwrap();
        let b = Array::new(&ctx, &[32, 48], Dtype::F32).unwrap();
        let c = Array::new(&ctx, &[64, 48], Dtype::F32).unwrap();
        let tree = gemm(2.0, &a, Trans::N, &b, Trans::N, 0.5, &c);

        let args = GemmArgs::match_tree(&tree).unwrap();
        assert_eq!(args.sizes(), [64, 48, 32]);
        assert_eq!(args.alpha, 2.0);
        assert_eq!(args.beta, 0.5);
        assert_eq!(args.a_trans, Trans::N);
        assert_eq!(args.b_trans, Trans::N);
        assert_eq!(args.c.data().handle(), c.data().handle());
    }

    #[test]
    fn transposed_operands_swap_k_derivation() {
        let ctx = ctx();
        // Aᵀ: stored (K, M) = (32, 64).
        let a = Array::new(&ctx, &[32, 64], Dtype::F32).unwrap();
        let b = Array::new(&ctx, &[48, 32], Dtype::F32).unwrap();
        let c = Array::new(&ctx, &[64, 48], Dtype::F32).unwrap();
        let tree = gemm(1.0, &a, Trans::T, &b, Trans::T, 0.0, &c);
        let args = GemmArgs::match_tree(&tree).unwrap();
        assert_eq!(args.sizes(), [64, 48, 32]);
        assert_eq!(args.a_trans, Trans::T);
        assert_eq!(args.b_trans, Trans::T);
    }

    #[test]
    fn shape_mismatch_is_not_supported() {
        let ctx = ctx();
        let a = Array::new(&ctx, &[64, 32], Dtype::F32).unwrap();
        let b = Array::new(&ctx, &[33, 48], Dtype::F32).unwrap();
        let c = Array::new(&ctx, &[64, 48], Dtype::F32).unwrap();
        let tree = gemm(1.0, &a, Trans::N, &b, Trans::N, 0.0, &c);
        assert!(GemmArgs::match_tree(&tree).is_err());
    }

    #[test]
    fn shared_leaf_is_visited_once() {
        let ctx = ctx();
        let a = Array::new(&ctx, &[8, 8], Dtype::F32).unwrap();
        let b = Array::new(&ctx, &[8, 8], Dtype::F32).unwrap();
        let c = Array::new(&ctx, &[8, 8], Dtype::F32).unwrap();
        // β ≠ 0 shares the C leaf between target and read side.
        let tree = gemm(1.0, &a, Trans::N, &b, Trans::N, 1.0, &c);
        let mut leaves = 0;
        tree.visit_post_order(|_, n| {
            if matches!(n, ExprNode::Leaf(_)) {
                leaves += 1;
            }
        });
        assert_eq!(leaves, 3);
    }
}
