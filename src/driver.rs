//! Driver abstraction: devices, contexts, buffers, streams, programs
//!
//! This layer is the seam between the pure code-generation core and an
//! accelerator runtime. The capability surface mirrors what the emitter and
//! the launch planner consume: a [`Device`] is a plain record of limits, a
//! [`Context`] owns buffer storage and lives in a process-wide cache keyed
//! by raw handle, a [`Stream`] enqueues kernel launches in order, and a
//! [`Program`] holds one compiled translation unit with its entry points.
//!
//! Only the CPU host backend is linked into this build; constructing a
//! context on CUDA or OpenCL fails with [`DriverError::BackendUnavailable`]
//! so planners refuse those targets up front. Host launches resolve the
//! packed argument buffer's opaque handles through the owning context and
//! run synchronously on the enqueueing thread, which trivially satisfies
//! the in-order stream guarantee.
//!
//! Every driver entry that would require an active device context takes a
//! scoped [`ContextGuard`]; activation nests through a thread-local stack
//! and is released on all exit paths by `Drop`.

use crate::backend::Backend;
use crate::binder::ArgPack;
use crate::emit::SpecializationKey;
use crate::expr::Dtype;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

/// Failures surfaced by the driver layer. None are retried.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// The requested backend is not linked into this build.
    #[error("{0:?} driver is not available in this build")]
    BackendUnavailable(Backend),
    /// Device allocation failed.
    #[error("out of device memory (requested {requested} bytes)")]
    OutOfMemory {
        /// Bytes requested from the context.
        requested: usize,
    },
    /// The program has no entry point of the requested name.
    #[error("invalid program: no kernel named `{name}`")]
    InvalidProgram {
        /// Entry-point name that failed to resolve.
        name: String,
    },
    /// A buffer handle did not resolve in its context.
    #[error("unknown buffer handle {0}")]
    InvalidHandle(u64),
    /// A transfer overran the buffer extent.
    #[error("access of {len} bytes at offset {offset} exceeds buffer of {capacity} bytes")]
    OutOfRange {
        /// Transfer length in bytes.
        len: usize,
        /// Transfer offset in bytes.
        offset: usize,
        /// Buffer capacity in bytes.
        capacity: usize,
    },
    /// The packed argument buffer was exhausted or misaligned at unpack.
    #[error("malformed argument buffer at byte {cursor}")]
    BadArguments {
        /// Byte cursor where unpacking failed.
        cursor: usize,
    },
}

// ===========================================================================
// Device
// ===========================================================================

/// Capability record of one accelerator (or the host CPU).
#[derive(Clone, Debug)]
pub struct Device {
    backend: Backend,
    name: String,
    local_mem_size: usize,
    global_mem_size: usize,
    max_work_group_size: usize,
    max_work_item_sizes: [usize; 3],
    warp_size: u32,
    address_bits: u32,
    fp64_support: bool,
}

impl Device {
    /// The CPU host device. Always available.
    pub fn host() -> Device {
        Device {
            backend: Backend::Host,
            name: "host".to_owned(),
            // No hardware scratchpad; limit mirrors a typical GPU.
            local_mem_size: 48 << 10,
            global_mem_size: 1 << 40,
            max_work_group_size: 1024,
            max_work_item_sizes: [1024, 1024, 64],
            warp_size: 1,
            address_bits: 64,
            fp64_support: true,
        }
    }

    /// A representative CUDA capability record, usable by the validity
    /// oracle and the emitter without a driver present.
    pub fn cuda_reference() -> Device {
        Device {
            backend: Backend::Cuda,
            name: "cuda-reference".to_owned(),
            local_mem_size: 48 << 10,
            global_mem_size: 8 << 30,
            max_work_group_size: 1024,
            max_work_item_sizes: [1024, 1024, 64],
            warp_size: 32,
            address_bits: 64,
            fp64_support: true,
        }
    }

    /// A representative OpenCL capability record (wavefront-64 class).
    pub fn opencl_reference() -> Device {
        Device {
            backend: Backend::OpenCl,
            name: "opencl-reference".to_owned(),
            local_mem_size: 32 << 10,
            global_mem_size: 8 << 30,
            max_work_group_size: 256,
            max_work_item_sizes: [256, 256, 256],
            warp_size: 64,
            address_bits: 64,
            fp64_support: true,
        }
    }

    /// Enumerate the devices of one backend. Only the host is linked here.
    pub fn all(backend: Backend) -> Result<Vec<Device>, DriverError> {
        match backend {
            Backend::Host => Ok(vec![Device::host()]),
            other => Err(DriverError::BackendUnavailable(other)),
        }
    }

    /// Backend tag.
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Human-readable device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared (local) memory per work-group, in bytes.
    pub fn local_mem_size(&self) -> usize {
        self.local_mem_size
    }

    /// Total device memory, in bytes.
    pub fn global_mem_size(&self) -> usize {
        self.global_mem_size
    }

    /// Maximum threads per work-group.
    pub fn max_work_group_size(&self) -> usize {
        self.max_work_group_size
    }

    /// Maximum work-group extent per axis.
    pub fn max_work_item_sizes(&self) -> [usize; 3] {
        self.max_work_item_sizes
    }

    /// Warp (wavefront) width.
    pub fn warp_size(&self) -> u32 {
        self.warp_size
    }

    /// Pointer width of the device address space.
    pub fn address_bits(&self) -> u32 {
        self.address_bits
    }

    /// Whether binary64 arithmetic is supported.
    pub fn fp64_support(&self) -> bool {
        self.fp64_support
    }
}

// ===========================================================================
// Context and the process-wide context cache
// ===========================================================================

struct BufferTable {
    map: HashMap<u64, Vec<u8>>,
    next: u64,
}

/// An owning device context: buffer storage plus a raw handle identifying
/// it in the process-wide cache.
pub struct Context {
    device: Device,
    handle: u64,
    buffers: Mutex<BufferTable>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("device", &self.device.name)
            .field("handle", &self.handle)
            .finish()
    }
}

static CONTEXT_CACHE: OnceLock<Mutex<HashMap<u64, Arc<Context>>>> = OnceLock::new();
static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

fn cache() -> MutexGuard<'static, HashMap<u64, Arc<Context>>> {
    CONTEXT_CACHE
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

/// Initialize the process-wide context cache. Idempotent; `Context::new`
/// also initializes lazily, so this exists for deterministic startup.
pub fn init() {
    let _ = CONTEXT_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
}

/// Release every cached context reference before library unload. Contexts
/// still held by callers stay alive until their last `Arc` drops.
pub fn teardown() {
    if let Some(c) = CONTEXT_CACHE.get() {
        let mut cache = c.lock().unwrap_or_else(|e| e.into_inner());
        tracing::debug!(contexts = cache.len(), "releasing cached device contexts");
        cache.clear();
    }
}

impl Context {
    /// Create (and cache) a context on `device`. Refused for backends whose
    /// driver is not linked.
    pub fn new(device: &Device) -> Result<Arc<Context>, DriverError> {
        match device.backend() {
            Backend::Host => {}
            other => return Err(DriverError::BackendUnavailable(other)),
        }
        let handle = NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed);
        let ctx = Arc::new(Context {
            device: device.clone(),
            handle,
            buffers: Mutex::new(BufferTable { map: HashMap::new(), next: 1 }),
        });
        cache().insert(handle, ctx.clone());
        tracing::debug!(handle, device = %ctx.device.name(), "context created");
        Ok(ctx)
    }

    /// Look up a cached context by raw handle; concurrent users share one
    /// owning reference.
    pub fn import(handle: u64) -> Option<Arc<Context>> {
        cache().get(&handle).cloned()
    }

    /// Device this context was created on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Raw handle keying the process-wide cache.
    pub fn handle(&self) -> u64 {
        self.handle
    }

    /// Allocate a zero-initialized buffer of `len` bytes.
    pub fn alloc(self: &Arc<Self>, len: usize) -> Result<Buffer, DriverError> {
        if len > self.device.global_mem_size() {
            return Err(DriverError::OutOfMemory { requested: len });
        }
        let handle = {
            let mut table = self.table();
            let handle = table.next;
            table.next += 1;
            table.map.insert(handle, vec![0u8; len]);
            handle
        };
        Ok(Buffer { inner: Arc::new(BufferInner { ctx: self.clone(), handle, len }) })
    }

    fn table(&self) -> MutexGuard<'_, BufferTable> {
        self.buffers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn buffer_bytes(&self, handle: u64) -> Result<Vec<u8>, DriverError> {
        self.table()
            .map
            .get(&handle)
            .cloned()
            .ok_or(DriverError::InvalidHandle(handle))
    }

    pub(crate) fn overwrite_buffer(&self, handle: u64, bytes: Vec<u8>) -> Result<(), DriverError> {
        let mut table = self.table();
        match table.map.get_mut(&handle) {
            Some(slot) => {
                *slot = bytes;
                Ok(())
            }
            None => Err(DriverError::InvalidHandle(handle)),
        }
    }

    pub(crate) fn write_buffer(
        &self,
        handle: u64,
        offset: usize,
        bytes: &[u8],
    ) -> Result<(), DriverError> {
        let mut table = self.table();
        let slot = table.map.get_mut(&handle).ok_or(DriverError::InvalidHandle(handle))?;
        let end = offset + bytes.len();
        if end > slot.len() {
            return Err(DriverError::OutOfRange {
                len: bytes.len(),
                offset,
                capacity: slot.len(),
            });
        }
        slot[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    fn release_buffer(&self, handle: u64) {
        self.table().map.remove(&handle);
    }
}

// ===========================================================================
// Scoped context activation
// ===========================================================================

thread_local! {
    static ACTIVE_CONTEXTS: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

/// Scoped activation of a context around a driver call. Reentrant: nested
/// guards on the same thread stack, and each pops exactly its own entry on
/// drop, on every exit path.
pub struct ContextGuard {
    handle: u64,
}

impl ContextGuard {
    /// Activate `ctx` on the current thread.
    pub fn new(ctx: &Context) -> ContextGuard {
        ACTIVE_CONTEXTS.with(|s| s.borrow_mut().push(ctx.handle));
        ContextGuard { handle: ctx.handle }
    }

    /// Depth of the activation stack on the current thread.
    pub fn depth() -> usize {
        ACTIVE_CONTEXTS.with(|s| s.borrow().len())
    }

    /// Handle of the innermost active context, if any.
    pub fn current() -> Option<u64> {
        ACTIVE_CONTEXTS.with(|s| s.borrow().last().copied())
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        ACTIVE_CONTEXTS.with(|s| {
            let popped = s.borrow_mut().pop();
            debug_assert_eq!(popped, Some(self.handle), "unbalanced context activation");
        });
    }
}

// ===========================================================================
// Buffer
// ===========================================================================

struct BufferInner {
    ctx: Arc<Context>,
    handle: u64,
    len: usize,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        self.ctx.release_buffer(self.handle);
    }
}

/// A device allocation. Clones share the allocation; the storage is
/// released when the last clone drops.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("handle", &self.inner.handle)
            .field("len", &self.inner.len)
            .finish()
    }
}

impl Buffer {
    /// Opaque machine-word handle marshalled into argument buffers.
    pub fn handle(&self) -> u64 {
        self.inner.handle
    }

    /// Allocation size in bytes.
    pub fn len(&self) -> usize {
        self.inner.len
    }

    /// Whether the allocation is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Owning context.
    pub fn context(&self) -> &Arc<Context> {
        &self.inner.ctx
    }
}

// ===========================================================================
// Program and kernels
// ===========================================================================

/// What a resolved entry point executes on the host backend.
#[derive(Clone, Debug)]
pub enum KernelKind {
    /// The main tiled matrix-product kernel of one specialization.
    Gemm(SpecializationKey),
    /// The split-K reduction pass.
    Reduce {
        /// Element type of the partial sums and the output.
        dtype: Dtype,
    },
}

/// One translation unit to compile into a program: the emitted source, the
/// specialization it was generated from, and the entry-point suffix.
#[derive(Clone, Debug)]
pub struct ProgramUnit {
    /// Specialization the source was emitted for.
    pub key: SpecializationKey,
    /// Entry-point suffix (`gemm<suffix>` / `reduce<suffix>`).
    pub suffix: String,
    /// Emitted device source text.
    pub source: String,
}

/// A compiled program: owned source plus resolvable entry points.
pub struct Program {
    ctx: Arc<Context>,
    source: String,
    entries: HashMap<String, KernelKind>,
}

impl Program {
    /// Build a program from one or more emitted units. On the host backend
    /// the entry points are interpreter dispatches derived from each unit's
    /// specialization; other backends would hand the source to their
    /// external compiler and are refused here.
    pub fn build(ctx: &Arc<Context>, units: Vec<ProgramUnit>) -> Result<Program, DriverError> {
        match ctx.device().backend() {
            Backend::Host => {}
            other => return Err(DriverError::BackendUnavailable(other)),
        }
        let mut source = String::new();
        let mut entries = HashMap::new();
        for unit in units {
            source.push_str(&unit.source);
            entries.insert(
                format!("gemm{}", unit.suffix),
                KernelKind::Gemm(unit.key.clone()),
            );
            if unit.key.params.depth > 1 {
                entries.insert(
                    format!("reduce{}", unit.suffix),
                    KernelKind::Reduce { dtype: unit.key.dtype },
                );
            }
        }
        Ok(Program { ctx: ctx.clone(), source, entries })
    }

    /// Owning context.
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// The concatenated source text of every unit.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Resolve an entry point by name.
    pub fn kernel(&self, name: &str) -> Result<Kernel, DriverError> {
        match self.entries.get(name) {
            Some(kind) => Ok(Kernel { name: name.to_owned(), kind: kind.clone() }),
            None => Err(DriverError::InvalidProgram { name: name.to_owned() }),
        }
    }
}

/// A resolved kernel entry point.
#[derive(Clone, Debug)]
pub struct Kernel {
    name: String,
    pub(crate) kind: KernelKind,
}

impl Kernel {
    /// Entry-point name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

// ===========================================================================
// Events and streams
// ===========================================================================

/// Optional wall-clock timing recorded around one launch.
#[derive(Debug, Default)]
pub struct Event {
    start: Option<Instant>,
    end: Option<Instant>,
}

impl Event {
    /// A fresh, unrecorded event.
    pub fn new() -> Event {
        Event::default()
    }

    /// Time between the recorded start and end marks, if both exist.
    pub fn elapsed(&self) -> Option<Duration> {
        match (self.start, self.end) {
            (Some(s), Some(e)) => Some(e.duration_since(s)),
            _ => None,
        }
    }
}

/// An ordered command stream on one context.
///
/// Successive enqueues execute in order; `synchronize` waits for all
/// pending work. Streams are not thread-safe for concurrent enqueue;
/// callers serialize.
pub struct Stream {
    ctx: Arc<Context>,
}

impl Stream {
    /// Create a stream on `ctx`.
    pub fn new(ctx: &Arc<Context>) -> Stream {
        Stream { ctx: ctx.clone() }
    }

    /// Owning context.
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Enqueue one kernel launch with the given work-group grid and block
    /// extents and a packed argument buffer.
    pub fn enqueue(
        &self,
        kernel: &Kernel,
        grid: [usize; 3],
        block: [usize; 3],
        args: &ArgPack,
        mut event: Option<&mut Event>,
    ) -> Result<(), DriverError> {
        let _active = ContextGuard::new(&self.ctx);
        match self.ctx.device().backend() {
            Backend::Host => {
                if let Some(e) = event.as_deref_mut() {
                    e.start = Some(Instant::now());
                }
                crate::host::launch(&kernel.kind, &self.ctx, grid, block, args)?;
                if let Some(e) = event {
                    e.end = Some(Instant::now());
                }
                Ok(())
            }
            other => Err(DriverError::BackendUnavailable(other)),
        }
    }

    /// Block until all enqueued work completes. Host launches run on the
    /// enqueueing thread, so this only marks the ordering point.
    pub fn synchronize(&self) -> Result<(), DriverError> {
        let _active = ContextGuard::new(&self.ctx);
        Ok(())
    }

    /// Blocking write into a buffer.
    pub fn write(&self, buffer: &Buffer, offset: usize, bytes: &[u8]) -> Result<(), DriverError> {
        let _active = ContextGuard::new(&self.ctx);
        self.ctx.write_buffer(buffer.handle(), offset, bytes)
    }

    /// Blocking read of a whole buffer.
    pub fn read(&self, buffer: &Buffer) -> Result<Vec<u8>, DriverError> {
        let _active = ContextGuard::new(&self.ctx);
        self.ctx.buffer_bytes(buffer.handle())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_cache_shares_by_handle() {
        let ctx = Context::new(&Device::host()).unwrap();
        let again = Context::import(ctx.handle()).expect("cached");
        assert!(Arc::ptr_eq(&ctx, &again));
        assert!(Context::import(u64::MAX).is_none());
    }

    #[test]
    fn unlinked_backends_are_refused() {
        assert!(matches!(
            Context::new(&Device::cuda_reference()),
            Err(DriverError::BackendUnavailable(Backend::Cuda))
        ));
        assert!(Device::all(Backend::OpenCl).is_err());
        assert_eq!(Device::all(Backend::Host).unwrap().len(), 1);
    }

    #[test]
    fn context_activation_nests_and_releases() {
        let ctx = Context::new(&Device::host()).unwrap();
        let base = ContextGuard::depth();
        {
            let _a = ContextGuard::new(&ctx);
            assert_eq!(ContextGuard::depth(), base + 1);
            {
                let _b = ContextGuard::new(&ctx);
                assert_eq!(ContextGuard::depth(), base + 2);
                assert_eq!(ContextGuard::current(), Some(ctx.handle()));
            }
            assert_eq!(ContextGuard::depth(), base + 1);
        }
        assert_eq!(ContextGuard::depth(), base);
    }

    #[test]
    fn buffers_release_on_last_drop() {
        let ctx = Context::new(&Device::host()).unwrap();
        let buf = ctx.alloc(64).unwrap();
        let handle = buf.handle();
        let clone = buf.clone();
        drop(buf);
        assert!(ctx.buffer_bytes(handle).is_ok());
        drop(clone);
        assert!(matches!(
            ctx.buffer_bytes(handle),
            Err(DriverError::InvalidHandle(_))
        ));
    }

    #[test]
    fn stream_write_read_round_trip() {
        let ctx = Context::new(&Device::host()).unwrap();
        let queue = Stream::new(&ctx);
        let buf = ctx.alloc(8).unwrap();
        queue.write(&buf, 2, &[1, 2, 3]).unwrap();
        let bytes = queue.read(&buf).unwrap();
        assert_eq!(bytes, vec![0, 0, 1, 2, 3, 0, 0, 0]);
        assert!(matches!(
            queue.write(&buf, 7, &[9, 9]),
            Err(DriverError::OutOfRange { .. })
        ));
    }

    #[test]
    fn oversized_allocation_is_oom() {
        let ctx = Context::new(&Device::host()).unwrap();
        let request = ctx.device().global_mem_size() + 1;
        assert!(matches!(
            ctx.alloc(request),
            Err(DriverError::OutOfMemory { .. })
        ));
    }
}
