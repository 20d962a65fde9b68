//! The native API seam.
//!
//! [`Driver`] lists the native entry points the core consumes. Handles cross
//! the seam as plain typed ids; reference counting, scheduling and callback
//! delivery are the driver's business. `backend::mock` implements it in
//! process, `backend::opencl` forwards to a real ICD loader.

use crate::flags::{DeviceType, MapAccess, MemFlags, QueueProperties};
use crate::status::{ExecutionStatus, NativeResult};
use crate::work::WorkSize;
use std::fmt;

macro_rules! raw_id {
    ($($(#[$meta:meta])* $name:ident),+ $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub usize);

            impl $name {
                #[must_use]
                pub const fn as_raw(self) -> usize {
                    self.0
                }
            }
        )+
    };
}

raw_id!(
    PlatformId,
    DeviceId,
    ContextId,
    QueueId,
    /// Buffer or sub-buffer.
    MemId,
    ProgramId,
    KernelId,
    EventId,
);

/// The reference-counted handle kinds. Platforms are not reference counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Context,
    CommandQueue,
    Device,
    Event,
    Kernel,
    Memory,
    Program,
}

impl ResourceKind {
    /// Status a driver reports for an id of this kind it does not know.
    #[must_use]
    pub const fn invalid_status(self) -> crate::status::Status {
        use crate::status::Status;
        match self {
            Self::Context => Status::INVALID_CONTEXT,
            Self::CommandQueue => Status::INVALID_COMMAND_QUEUE,
            Self::Device => Status::INVALID_DEVICE,
            Self::Event => Status::INVALID_EVENT,
            Self::Kernel => Status::INVALID_KERNEL,
            Self::Memory => Status::INVALID_MEM_OBJECT,
            Self::Program => Status::INVALID_PROGRAM,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Context => "context",
            Self::CommandQueue => "command queue",
            Self::Device => "device",
            Self::Event => "event",
            Self::Kernel => "kernel",
            Self::Memory => "memory object",
            Self::Program => "program",
        })
    }
}

/// What the core needs to know about a device to select it and size launches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub vendor: String,
    pub kind: DeviceType,
    pub compute_units: u32,
    pub max_work_group_size: usize,
}

/// A positional kernel argument value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelArg {
    /// A buffer or sub-buffer.
    Mem(MemId),
    /// Plain bytes copied into the argument slot.
    Scalar(Vec<u8>),
    /// Size in bytes of a `__local` allocation.
    Local(usize),
}

impl KernelArg {
    pub fn scalar<T: bytemuck::Pod>(value: T) -> Self {
        Self::Scalar(bytemuck::bytes_of(&value).to_vec())
    }

    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Self::Mem(_) => std::mem::size_of::<usize>(),
            Self::Scalar(bytes) => bytes.len(),
            Self::Local(size) => *size,
        }
    }
}

/// Invoked by the driver, on a thread of its choosing, once an event reaches
/// the registered status. Receives the event and the status actually reached.
pub type EventCallback = Box<dyn FnOnce(EventId, ExecutionStatus) + Send + 'static>;

/// Invoked by the driver once an asynchronous program build finishes.
pub type BuildCallback = Box<dyn FnOnce(ProgramId) + Send + 'static>;

/// Native compute API entry points.
///
/// Every enqueue takes the ids of the events it must wait for (`wait`, empty
/// for none) and, when `want_event` is set, returns the id of a new event
/// tracking the command. The caller owns one reference to that event.
pub trait Driver: Send + Sync + 'static {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    // Discovery
    fn platform_ids(&self) -> NativeResult<Vec<PlatformId>>;
    fn platform_name(&self, platform: PlatformId) -> NativeResult<String>;
    fn device_ids(&self, platform: PlatformId, kind: DeviceType) -> NativeResult<Vec<DeviceId>>;
    fn device_info(&self, device: DeviceId) -> NativeResult<DeviceInfo>;

    // Creation
    fn create_context(&self, devices: &[DeviceId]) -> NativeResult<ContextId>;
    fn create_command_queue(
        &self,
        context: ContextId,
        device: DeviceId,
        properties: QueueProperties,
    ) -> NativeResult<QueueId>;
    /// Allocates `size` bytes. With `host` set the contents are copied from it.
    fn create_buffer(
        &self,
        context: ContextId,
        flags: MemFlags,
        size: usize,
        host: Option<&[u8]>,
    ) -> NativeResult<MemId>;
    fn create_sub_buffer(
        &self,
        parent: MemId,
        flags: MemFlags,
        origin: usize,
        size: usize,
    ) -> NativeResult<MemId>;
    fn create_program_with_source(
        &self,
        context: ContextId,
        sources: &[&str],
    ) -> NativeResult<ProgramId>;
    /// Builds for `devices`. With `notify` set the build may finish
    /// asynchronously and `notify` is called when it does.
    fn build_program(
        &self,
        program: ProgramId,
        devices: &[DeviceId],
        options: &str,
        notify: Option<BuildCallback>,
    ) -> NativeResult<()>;
    fn program_build_log(&self, program: ProgramId, device: DeviceId) -> NativeResult<String>;
    fn create_kernel(&self, program: ProgramId, name: &str) -> NativeResult<KernelId>;
    fn set_kernel_arg(&self, kernel: KernelId, index: u32, arg: &KernelArg) -> NativeResult<()>;
    fn create_user_event(&self, context: ContextId) -> NativeResult<EventId>;

    // Reference counting
    fn retain_context(&self, id: ContextId) -> NativeResult<()>;
    fn retain_command_queue(&self, id: QueueId) -> NativeResult<()>;
    fn retain_device(&self, id: DeviceId) -> NativeResult<()>;
    fn retain_event(&self, id: EventId) -> NativeResult<()>;
    fn retain_kernel(&self, id: KernelId) -> NativeResult<()>;
    fn retain_mem(&self, id: MemId) -> NativeResult<()>;
    fn retain_program(&self, id: ProgramId) -> NativeResult<()>;
    fn release_context(&self, id: ContextId) -> NativeResult<()>;
    fn release_command_queue(&self, id: QueueId) -> NativeResult<()>;
    fn release_device(&self, id: DeviceId) -> NativeResult<()>;
    fn release_event(&self, id: EventId) -> NativeResult<()>;
    fn release_kernel(&self, id: KernelId) -> NativeResult<()>;
    fn release_mem(&self, id: MemId) -> NativeResult<()>;
    fn release_program(&self, id: ProgramId) -> NativeResult<()>;

    // Events
    fn event_status(&self, event: EventId) -> NativeResult<ExecutionStatus>;
    fn set_user_event_status(&self, event: EventId, status: ExecutionStatus) -> NativeResult<()>;
    /// Blocks the calling thread until every event is complete or errored.
    fn wait_for_events(&self, events: &[EventId]) -> NativeResult<()>;
    fn set_event_callback(
        &self,
        event: EventId,
        status: ExecutionStatus,
        callback: EventCallback,
    ) -> NativeResult<()>;

    // Commands
    fn enqueue_nd_range_kernel(
        &self,
        queue: QueueId,
        kernel: KernelId,
        work: &WorkSize,
        wait: &[EventId],
        want_event: bool,
    ) -> NativeResult<Option<EventId>>;

    /// Copies `len` bytes at `offset` of `mem` into `dst`.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for `len` byte writes until the command completes.
    /// With `blocking` set that is the return of this call; otherwise it is
    /// the completion of the returned event or of the queue.
    #[allow(clippy::too_many_arguments)]
    unsafe fn enqueue_read_buffer(
        &self,
        queue: QueueId,
        mem: MemId,
        blocking: bool,
        offset: usize,
        dst: *mut u8,
        len: usize,
        wait: &[EventId],
        want_event: bool,
    ) -> NativeResult<Option<EventId>>;

    /// Copies `len` bytes from `src` into `mem` at `offset`.
    ///
    /// # Safety
    ///
    /// `src` must be valid for `len` byte reads until the command completes,
    /// as for [`Driver::enqueue_read_buffer`].
    #[allow(clippy::too_many_arguments)]
    unsafe fn enqueue_write_buffer(
        &self,
        queue: QueueId,
        mem: MemId,
        blocking: bool,
        offset: usize,
        src: *const u8,
        len: usize,
        wait: &[EventId],
        want_event: bool,
    ) -> NativeResult<Option<EventId>>;

    /// Maps `size` bytes at `offset` and returns the host pointer, valid until
    /// the matching unmap completes.
    #[allow(clippy::too_many_arguments)]
    fn enqueue_map_buffer(
        &self,
        queue: QueueId,
        mem: MemId,
        blocking: bool,
        access: MapAccess,
        offset: usize,
        size: usize,
        wait: &[EventId],
        want_event: bool,
    ) -> NativeResult<(*mut u8, Option<EventId>)>;

    /// # Safety
    ///
    /// `ptr` must come from [`Driver::enqueue_map_buffer`] on the same `mem`
    /// and must not be used after this call.
    unsafe fn enqueue_unmap(
        &self,
        queue: QueueId,
        mem: MemId,
        ptr: *mut u8,
        wait: &[EventId],
        want_event: bool,
    ) -> NativeResult<Option<EventId>>;

    fn enqueue_marker(
        &self,
        queue: QueueId,
        wait: &[EventId],
        want_event: bool,
    ) -> NativeResult<Option<EventId>>;
    fn enqueue_barrier(
        &self,
        queue: QueueId,
        wait: &[EventId],
        want_event: bool,
    ) -> NativeResult<Option<EventId>>;
    fn flush(&self, queue: QueueId) -> NativeResult<()>;
    fn finish(&self, queue: QueueId) -> NativeResult<()>;
}
