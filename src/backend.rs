//! Backend tag and keyword table
//!
//! The set of targets is a closed sum: CUDA, OpenCL, or the CPU host path.
//! Every backend-specific spelling the emitter needs (address-space
//! qualifiers, the kernel-entry prefix, barriers, id accessors, the integer
//! size-type, and the vector load/store forms) is a pure function of the
//! tag. No dynamic dispatch, no capability objects.
//!
//! Host text targets a plain-C dialect whose launch state is carried in an
//! implicit `lc` (launch context) pointer; its vector structs and `min` come
//! from `host_math.h`, mirroring the `helper_math.h` include on CUDA.

use serde::{Deserialize, Serialize};

/// Target dialect for emitted device source.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Backend {
    /// NVIDIA CUDA C.
    Cuda,
    /// OpenCL C.
    OpenCl,
    /// CPU host path (plain C with an implicit launch-context parameter).
    Host,
}

impl Backend {
    /// Qualifier prefixing the kernel entry point.
    pub fn kernel_prefix(self) -> &'static str {
        match self {
            Backend::Cuda => "extern \"C\" __global__",
            Backend::OpenCl => "__kernel",
            Backend::Host => "static",
        }
    }

    /// Global address-space qualifier, with a trailing space when non-empty.
    pub fn global_qualifier(self) -> &'static str {
        match self {
            Backend::Cuda => "",
            Backend::OpenCl => "__global ",
            Backend::Host => "",
        }
    }

    /// Local (shared) memory qualifier for array declarations.
    pub fn local_qualifier(self) -> &'static str {
        match self {
            Backend::Cuda => "__shared__",
            Backend::OpenCl => "__local",
            Backend::Host => "static",
        }
    }

    /// Qualifier for pointers into local memory, with a trailing space when
    /// non-empty.
    pub fn local_ptr_qualifier(self) -> &'static str {
        match self {
            Backend::Cuda => "",
            Backend::OpenCl => "__local ",
            Backend::Host => "",
        }
    }

    /// Work-group barrier statement (without the trailing semicolon).
    pub fn barrier(self) -> &'static str {
        match self {
            Backend::Cuda => "__syncthreads()",
            Backend::OpenCl => "barrier(CLK_LOCAL_MEM_FENCE)",
            Backend::Host => "lc_barrier(lc)",
        }
    }

    /// Work-group index along `axis ∈ {0,1,2}`.
    pub fn group_idx(self, axis: usize) -> &'static str {
        const CUDA: [&str; 3] = ["blockIdx.x", "blockIdx.y", "blockIdx.z"];
        const OCL: [&str; 3] = ["get_group_id(0)", "get_group_id(1)", "get_group_id(2)"];
        const HOST: [&str; 3] = ["lc->group_id[0]", "lc->group_id[1]", "lc->group_id[2]"];
        match self {
            Backend::Cuda => CUDA[axis],
            Backend::OpenCl => OCL[axis],
            Backend::Host => HOST[axis],
        }
    }

    /// Intra-group (local) index along `axis ∈ {0,1}`.
    pub fn local_idx(self, axis: usize) -> &'static str {
        const CUDA: [&str; 2] = ["threadIdx.x", "threadIdx.y"];
        const OCL: [&str; 2] = ["get_local_id(0)", "get_local_id(1)"];
        const HOST: [&str; 2] = ["lc->local_id[0]", "lc->local_id[1]"];
        match self {
            Backend::Cuda => CUDA[axis],
            Backend::OpenCl => OCL[axis],
            Backend::Host => HOST[axis],
        }
    }

    /// Flattened global index along `axis ∈ {0,1}`.
    pub fn global_idx(self, axis: usize) -> &'static str {
        const CUDA: [&str; 2] = [
            "(blockIdx.x*blockDim.x + threadIdx.x)",
            "(blockIdx.y*blockDim.y + threadIdx.y)",
        ];
        const OCL: [&str; 2] = ["get_global_id(0)", "get_global_id(1)"];
        const HOST: [&str; 2] = ["lc->global_id[0]", "lc->global_id[1]"];
        match self {
            Backend::Cuda => CUDA[axis],
            Backend::OpenCl => OCL[axis],
            Backend::Host => HOST[axis],
        }
    }

    /// Total global extent along `axis ∈ {0,1}`.
    pub fn global_size(self, axis: usize) -> &'static str {
        const CUDA: [&str; 2] = ["(blockDim.x*gridDim.x)", "(blockDim.y*gridDim.y)"];
        const OCL: [&str; 2] = ["get_global_size(0)", "get_global_size(1)"];
        const HOST: [&str; 2] = ["lc->global_size[0]", "lc->global_size[1]"];
        match self {
            Backend::Cuda => CUDA[axis],
            Backend::OpenCl => OCL[axis],
            Backend::Host => HOST[axis],
        }
    }

    /// Spelling of the size-type used for every integer kernel argument.
    pub fn size_type(self) -> &'static str {
        match self {
            Backend::Cuda => "unsigned int",
            Backend::OpenCl => "unsigned long",
            Backend::Host => "size_t",
        }
    }

    /// Width in bytes of the size-type on the launch ABI.
    pub fn size_width(self) -> usize {
        match self {
            Backend::Cuda => 4,
            Backend::OpenCl => 8,
            Backend::Host => 8,
        }
    }
}

/// Append a vector width to a scalar type name (`"float"`, 4 → `"float4"`).
/// Width 1 is the scalar itself.
pub fn append_width(scalar: &str, width: u32) -> String {
    if width == 1 {
        scalar.to_owned()
    } else {
        format!("{scalar}{width}")
    }
}

/// Component accessor on a vector value: `.x/.y/.z/.w` for the first four
/// lanes, OpenCL `.sN` spelling beyond.
pub fn vector_component(value: &str, lane: u32) -> String {
    const XYZW: [char; 4] = ['x', 'y', 'z', 'w'];
    if lane < 4 {
        format!("{value}.{}", XYZW[lane as usize])
    } else {
        format!("{value}.s{lane}")
    }
}

/// A `width`-wide packed load of `scalar` elements from `ptr` at vector
/// offset `offset`.
///
/// CUDA and the host dialect use pointer-casted packed access; OpenCL uses
/// `vloadN`. `aligned` distinguishes shared-memory accesses (always aligned
/// to the vector) from global loads that may not be; unaligned loads gather
/// per lane through the vector constructor.
pub fn vload(
    width: u32,
    scalar: &str,
    offset: &str,
    ptr: &str,
    backend: Backend,
    aligned: bool,
) -> String {
    if width == 1 {
        return format!("({ptr})[{offset}]");
    }
    let vtype = append_width(scalar, width);
    match backend {
        Backend::OpenCl => format!("vload{width}({offset}, {ptr})"),
        Backend::Cuda | Backend::Host => {
            if aligned {
                format!("*(({vtype}*)({ptr}) + {offset})")
            } else {
                let lanes: Vec<String> = (0..width)
                    .map(|s| format!("({ptr})[{offset}*{width} + {s}]"))
                    .collect();
                format!("make_{vtype}({})", lanes.join(", "))
            }
        }
    }
}

/// A `width`-wide packed store of `value` to `ptr` at vector offset
/// `offset`. Stores are only ever emitted to vector-aligned destinations.
pub fn vstore(
    width: u32,
    scalar: &str,
    value: &str,
    offset: &str,
    ptr: &str,
    backend: Backend,
) -> String {
    if width == 1 {
        return format!("({ptr})[{offset}] = {value}");
    }
    let vtype = append_width(scalar, width);
    match backend {
        Backend::OpenCl => format!("vstore{width}({value}, {offset}, {ptr})"),
        Backend::Cuda | Backend::Host => {
            format!("*(({vtype}*)({ptr}) + {offset}) = {value}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_types_match_abi_widths() {
        assert_eq!(Backend::Cuda.size_type(), "unsigned int");
        assert_eq!(Backend::Cuda.size_width(), 4);
        assert_eq!(Backend::OpenCl.size_type(), "unsigned long");
        assert_eq!(Backend::OpenCl.size_width(), 8);
        assert_eq!(Backend::Host.size_width(), 8);
    }

    #[test]
    fn vector_spellings() {
        assert_eq!(append_width("float", 1), "float");
        assert_eq!(append_width("double", 4), "double4");
        assert_eq!(vector_component("rA[0][1]", 2), "rA[0][1].z");
        assert_eq!(vector_component("v", 5), "v.s5");
    }

    #[test]
    fn load_store_forms() {
        assert_eq!(
            vload(4, "float", "0", "lA + 8", Backend::OpenCl, true),
            "vload4(0, lA + 8)"
        );
        assert_eq!(
            vload(4, "float", "0", "lA + 8", Backend::Cuda, true),
            "*((float4*)(lA + 8) + 0)"
        );
        assert!(vload(2, "float", "0", "p", Backend::Cuda, false).starts_with("make_float2("));
        assert_eq!(vload(1, "float", "k", "p", Backend::Cuda, true), "(p)[k]");
        assert_eq!(
            vstore(4, "float", "v", "0", "lB", Backend::OpenCl),
            "vstore4(v, 0, lB)"
        );
        assert_eq!(
            vstore(1, "float", "v", "0", "lB", Backend::Host),
            "(lB)[0] = v"
        );
    }

    #[test]
    fn barrier_and_ids_differ_per_backend() {
        assert_eq!(Backend::Cuda.barrier(), "__syncthreads()");
        assert_eq!(Backend::OpenCl.barrier(), "barrier(CLK_LOCAL_MEM_FENCE)");
        assert_eq!(Backend::OpenCl.group_idx(2), "get_group_id(2)");
        assert_eq!(Backend::Cuda.local_idx(1), "threadIdx.y");
    }
}
