//! Host-side handles over native objects and their release discipline.
//!
//! Handles are cheap to clone: a clone names the same native object and does
//! not touch its reference count. Every acquisition (a constructor or an
//! explicit [`retain`](Context::retain)) must be balanced by exactly one
//! release. Nothing is released implicitly; see [`crate::scope`] for scoped
//! acquisition.

use crate::driver::{
    ContextId, DeviceId, DeviceInfo, Driver, EventId, KernelArg, KernelId, MemId, PlatformId,
    ProgramId, QueueId, ResourceKind,
};
use crate::error::{ClError, Result};
use crate::flags::{DeviceType, MemFlags, QueueProperties};
use crate::status::{ExecutionStatus, NativeResult, Status};
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

pub(crate) type DriverRef = Arc<dyn Driver>;

macro_rules! handle_debug {
    ($name:ident) => {
        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.id.0).finish()
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.id == other.id
            }
        }

        impl Eq for $name {}
    };
}

macro_rules! refcounted {
    ($name:ident, $kind:ident, $retain:ident, $release:ident) => {
        impl $name {
            /// Adds one native reference. Balance with [`Self::release`].
            ///
            /// # Errors
            ///
            /// Returns the native status if the driver rejects the handle.
            pub fn retain(&self) -> Result<()> {
                self.driver.$retain(self.id)?;
                Ok(())
            }

            /// Drops one native reference.
            ///
            /// # Errors
            ///
            /// Returns [`ClError::Release`] if the driver reports a failure.
            pub fn release(&self) -> Result<()> {
                tracing::debug!(kind = %ResourceKind::$kind, id = self.id.0, "release");
                self.driver
                    .$release(self.id)
                    .map_err(|status| ClError::release(ResourceKind::$kind, status))
            }
        }
    };
}

/// A vendor implementation. Not reference counted.
#[derive(Clone)]
pub struct Platform {
    pub(crate) id: PlatformId,
    pub(crate) driver: DriverRef,
}

handle_debug!(Platform);

impl Platform {
    /// Enumerates the driver's platforms.
    ///
    /// # Errors
    ///
    /// Returns the native status of a failed enumeration.
    pub fn list(driver: &Arc<dyn Driver>) -> Result<Vec<Self>> {
        let ids = driver.platform_ids()?;
        Ok(ids
            .into_iter()
            .map(|id| Self {
                id,
                driver: Arc::clone(driver),
            })
            .collect())
    }

    #[must_use]
    pub fn id(&self) -> PlatformId {
        self.id
    }

    /// # Errors
    ///
    /// Returns the native status of a failed query.
    pub fn name(&self) -> Result<String> {
        Ok(self.driver.platform_name(self.id)?)
    }

    /// Devices of category `kind`. A platform without such devices yields an
    /// empty list rather than an error.
    ///
    /// # Errors
    ///
    /// Returns the native status of a failed enumeration.
    pub fn devices(&self, kind: DeviceType) -> Result<Vec<Device>> {
        let ids = match self.driver.device_ids(self.id, kind) {
            Ok(ids) => ids,
            Err(Status::DEVICE_NOT_FOUND) => Vec::new(),
            Err(status) => return Err(status.into()),
        };
        Ok(ids
            .into_iter()
            .map(|id| Device {
                id,
                driver: Arc::clone(&self.driver),
            })
            .collect())
    }
}

/// A compute unit exposed by a platform.
#[derive(Clone)]
pub struct Device {
    pub(crate) id: DeviceId,
    pub(crate) driver: DriverRef,
}

handle_debug!(Device);
refcounted!(Device, Device, retain_device, release_device);

impl Device {
    #[must_use]
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// # Errors
    ///
    /// Returns the native status of a failed query.
    pub fn info(&self) -> Result<DeviceInfo> {
        Ok(self.driver.device_info(self.id)?)
    }
}

/// Owning scope for queues, memory, programs and kernels on a set of devices.
/// Must outlive everything created from it.
#[derive(Clone)]
pub struct Context {
    pub(crate) id: ContextId,
    pub(crate) driver: DriverRef,
    devices: Arc<[Device]>,
}

handle_debug!(Context);
refcounted!(Context, Context, retain_context, release_context);

impl Context {
    /// Creates a context over `devices`.
    ///
    /// # Errors
    ///
    /// Fails with [`ClError::InvalidArgument`] for an empty device list, or
    /// with the native status of a failed creation.
    pub fn new(devices: &[Device]) -> Result<Self> {
        let first = devices
            .first()
            .ok_or_else(|| ClError::invalid("a context needs at least one device"))?;
        let driver = Arc::clone(&first.driver);
        let ids: Vec<DeviceId> = devices.iter().map(|d| d.id).collect();
        let id = driver.create_context(&ids)?;
        tracing::debug!(id = id.0, devices = ids.len(), "context created");
        Ok(Self {
            id,
            driver,
            devices: devices.into(),
        })
    }

    #[must_use]
    pub fn id(&self) -> ContextId {
        self.id
    }

    #[must_use]
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }
}

/// Ordered submission channel to one device of one context.
#[derive(Clone)]
pub struct CommandQueue {
    pub(crate) id: QueueId,
    pub(crate) driver: DriverRef,
    device: DeviceId,
    properties: QueueProperties,
}

handle_debug!(CommandQueue);
refcounted!(CommandQueue, CommandQueue, retain_command_queue, release_command_queue);

impl CommandQueue {
    /// # Errors
    ///
    /// Returns the native status of a failed creation.
    pub fn new(context: &Context, device: &Device, properties: QueueProperties) -> Result<Self> {
        let id = context
            .driver
            .create_command_queue(context.id, device.id, properties)?;
        tracing::debug!(id = id.0, device = device.id.0, %properties, "command queue created");
        Ok(Self {
            id,
            driver: Arc::clone(&context.driver),
            device: device.id,
            properties,
        })
    }

    #[must_use]
    pub fn id(&self) -> QueueId {
        self.id
    }

    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    #[must_use]
    pub fn properties(&self) -> QueueProperties {
        self.properties
    }
}

/// A contiguous device memory region, or a non-owning view into one.
///
/// A sub-buffer must not outlive its parent; releasing it leaves the parent
/// untouched.
#[derive(Clone)]
pub struct Buffer {
    pub(crate) id: MemId,
    pub(crate) driver: DriverRef,
    size: usize,
    parent: Option<(MemId, usize)>,
}

handle_debug!(Buffer);
refcounted!(Buffer, Memory, retain_mem, release_mem);

impl Buffer {
    /// Allocates `size` uninitialised bytes.
    ///
    /// # Errors
    ///
    /// Fails with [`ClError::InvalidArgument`] for a zero size or for
    /// `use-host-ptr`, which would let the device alias host memory the
    /// caller does not pin; otherwise with the native status.
    pub fn new(context: &Context, flags: MemFlags, size: usize) -> Result<Self> {
        Self::create(context, flags, size, None)
    }

    /// Allocates a buffer initialised from `data`.
    ///
    /// # Errors
    ///
    /// As [`Buffer::new`].
    pub fn from_slice<T: bytemuck::Pod>(
        context: &Context,
        flags: MemFlags,
        data: &[T],
    ) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        Self::create(context, flags | MemFlags::COPY_HOST_PTR, bytes.len(), Some(bytes))
    }

    fn create(
        context: &Context,
        flags: MemFlags,
        size: usize,
        host: Option<&[u8]>,
    ) -> Result<Self> {
        if size == 0 {
            return Err(ClError::invalid("buffer size must be non-zero"));
        }
        if flags.contains(MemFlags::USE_HOST_PTR) {
            return Err(ClError::invalid("use-host-ptr buffers are not supported"));
        }
        let id = context.driver.create_buffer(context.id, flags, size, host)?;
        tracing::debug!(id = id.0, size, %flags, "buffer created");
        Ok(Self {
            id,
            driver: Arc::clone(&context.driver),
            size,
            parent: None,
        })
    }

    /// Creates a view over `size` bytes starting at `origin`.
    ///
    /// # Errors
    ///
    /// Fails with [`ClError::InvalidArgument`] if the range is empty or
    /// exceeds this buffer; otherwise with the native status (for example a
    /// misaligned origin, or a view of a view).
    pub fn sub_buffer(&self, flags: MemFlags, origin: usize, size: usize) -> Result<Self> {
        if size == 0 || origin.checked_add(size).map_or(true, |end| end > self.size) {
            return Err(ClError::invalid(format!(
                "sub-buffer range {origin}..{} exceeds parent of {} bytes",
                origin.saturating_add(size),
                self.size
            )));
        }
        let id = self.driver.create_sub_buffer(self.id, flags, origin, size)?;
        tracing::debug!(id = id.0, parent = self.id.0, origin, size, "sub-buffer created");
        Ok(Self {
            id,
            driver: Arc::clone(&self.driver),
            size,
            parent: Some((self.id, origin)),
        })
    }

    #[must_use]
    pub fn id(&self) -> MemId {
        self.id
    }

    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Parent buffer and byte origin, for sub-buffers.
    #[must_use]
    pub fn parent(&self) -> Option<(MemId, usize)> {
        self.parent
    }

    /// The argument value that binds this buffer to a kernel slot.
    #[must_use]
    pub fn arg(&self) -> KernelArg {
        KernelArg::Mem(self.id)
    }
}

/// Source compiled for specific devices.
#[derive(Clone)]
pub struct Program {
    pub(crate) id: ProgramId,
    pub(crate) driver: DriverRef,
    devices: Arc<[Device]>,
}

handle_debug!(Program);
refcounted!(Program, Program, retain_program, release_program);

impl Program {
    /// # Errors
    ///
    /// Returns the native status of a failed creation.
    pub fn with_source(context: &Context, sources: &[&str]) -> Result<Self> {
        let id = context.driver.create_program_with_source(context.id, sources)?;
        tracing::debug!(id = id.0, sources = sources.len(), "program created");
        Ok(Self {
            id,
            driver: Arc::clone(&context.driver),
            devices: Arc::clone(&context.devices),
        })
    }

    #[must_use]
    pub fn id(&self) -> ProgramId {
        self.id
    }

    /// Builds for `devices`, or for every context device when empty.
    ///
    /// # Errors
    ///
    /// A failed compile or link yields [`ClError::Build`] carrying the build
    /// log of every target device. Other failures yield the native status.
    pub fn build(&self, devices: &[Device], options: &str) -> Result<&Self> {
        let targets = self.targets(devices);
        let ids: Vec<DeviceId> = targets.iter().map(|d| d.id).collect();
        let outcome = self.driver.build_program(self.id, &ids, options, None);
        self.check_build(outcome, targets)?;
        tracing::debug!(id = self.id.0, options, "program built");
        Ok(self)
    }

    /// Attaches build logs to a failed compile or link.
    pub(crate) fn check_build(&self, outcome: NativeResult<()>, targets: &[Device]) -> Result<()> {
        match outcome {
            Ok(()) => Ok(()),
            Err(
                status @ (Status::BUILD_PROGRAM_FAILURE
                | Status::COMPILE_PROGRAM_FAILURE
                | Status::LINK_PROGRAM_FAILURE),
            ) => Err(ClError::Build {
                code: status.code(),
                name: status.name(),
                logs: self.build_logs(targets)?,
            }),
            Err(status) => Err(status.into()),
        }
    }

    /// Build log of each device, paired with the device name.
    ///
    /// # Errors
    ///
    /// Returns the native status of a failed query.
    pub fn build_logs(&self, devices: &[Device]) -> Result<Vec<(String, String)>> {
        self.targets(devices)
            .iter()
            .map(|device| {
                let name = device
                    .info()
                    .map_or_else(|_| format!("device {}", device.id.0), |info| info.name);
                let log = self.driver.program_build_log(self.id, device.id)?;
                Ok((name, log))
            })
            .collect()
    }

    /// Extracts the entry point `name` from the built program.
    ///
    /// # Errors
    ///
    /// Returns the native status, e.g. `INVALID_KERNEL_NAME`.
    pub fn kernel(&self, name: &str) -> Result<Kernel> {
        let id = self.driver.create_kernel(self.id, name)?;
        tracing::debug!(id = id.0, program = self.id.0, name, "kernel created");
        Ok(Kernel {
            id,
            driver: Arc::clone(&self.driver),
            name: name.into(),
            _not_sync: PhantomData,
        })
    }

    pub(crate) fn targets<'a>(&'a self, devices: &'a [Device]) -> &'a [Device] {
        if devices.is_empty() {
            &self.devices
        } else {
            devices
        }
    }
}

/// One entry point of a built program.
///
/// Argument slots are bound immediately before each launch. Binding then
/// launching is not atomic, so a handle is not `Sync`; concurrent launch
/// sites should each create their own kernel from the program.
#[derive(Clone)]
pub struct Kernel {
    pub(crate) id: KernelId,
    pub(crate) driver: DriverRef,
    name: Arc<str>,
    _not_sync: PhantomData<Cell<()>>,
}

handle_debug!(Kernel);
refcounted!(Kernel, Kernel, retain_kernel, release_kernel);

impl Kernel {
    #[must_use]
    pub fn id(&self) -> KernelId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Binds one positional argument.
    ///
    /// # Errors
    ///
    /// Returns the native status, e.g. `INVALID_ARG_INDEX`.
    pub fn set_arg(&self, index: u32, arg: &KernelArg) -> Result<&Self> {
        self.driver.set_kernel_arg(self.id, index, arg)?;
        Ok(self)
    }

    /// Binds `args` to slots `0..args.len()`.
    ///
    /// # Errors
    ///
    /// Stops at, and returns, the first native failure.
    pub fn set_args(&self, args: &[KernelArg]) -> Result<&Self> {
        for (index, arg) in (0u32..).zip(args) {
            self.set_arg(index, arg)?;
        }
        Ok(self)
    }
}

/// Completion state of one enqueued command, or a host-controlled user event.
#[derive(Clone)]
pub struct Event {
    pub(crate) id: EventId,
    pub(crate) driver: DriverRef,
}

handle_debug!(Event);
refcounted!(Event, Event, retain_event, release_event);

impl Event {
    pub(crate) fn from_raw(id: EventId, driver: &DriverRef) -> Self {
        Self {
            id,
            driver: Arc::clone(driver),
        }
    }

    /// Creates a user event, initially submitted, whose status the host sets.
    ///
    /// # Errors
    ///
    /// Returns the native status of a failed creation.
    pub fn user(context: &Context) -> Result<Self> {
        let id = context.driver.create_user_event(context.id)?;
        tracing::debug!(id = id.0, "user event created");
        Ok(Self::from_raw(id, &context.driver))
    }

    #[must_use]
    pub fn id(&self) -> EventId {
        self.id
    }

    /// # Errors
    ///
    /// Returns the native status of a failed query.
    pub fn status(&self) -> Result<ExecutionStatus> {
        Ok(self.driver.event_status(self.id)?)
    }

    /// Sets a user event to complete or to an error code.
    ///
    /// # Errors
    ///
    /// Fails with [`ClError::InvalidArgument`] for a non-terminal status, or
    /// with the native status (e.g. the event is not a user event, or was
    /// already set).
    pub fn set_status(&self, status: ExecutionStatus) -> Result<()> {
        if !status.is_terminal() {
            return Err(ClError::invalid(format!(
                "a user event can only be set to complete or an error, not {status}"
            )));
        }
        self.driver.set_user_event_status(self.id, status)?;
        Ok(())
    }

    /// Blocks until this event is complete or errored.
    ///
    /// # Errors
    ///
    /// Returns the native status of a failed wait.
    pub fn wait(&self) -> Result<()> {
        Self::wait_all(std::slice::from_ref(self))
    }

    /// Blocks until every event is complete or errored.
    ///
    /// # Errors
    ///
    /// Returns the native status of a failed wait, e.g.
    /// `EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST`.
    pub fn wait_all(events: &[Self]) -> Result<()> {
        let Some(first) = events.first() else {
            return Ok(());
        };
        let ids = ids(events);
        first.driver.wait_for_events(&ids)?;
        Ok(())
    }
}

pub(crate) fn ids(events: &[Event]) -> Vec<EventId> {
    events.iter().map(|e| e.id).collect()
}

/// Any reference-counted handle, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Context(Context),
    CommandQueue(CommandQueue),
    Device(Device),
    Event(Event),
    Kernel(Kernel),
    Memory(Buffer),
    Program(Program),
}

impl Resource {
    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Context(_) => ResourceKind::Context,
            Self::CommandQueue(_) => ResourceKind::CommandQueue,
            Self::Device(_) => ResourceKind::Device,
            Self::Event(_) => ResourceKind::Event,
            Self::Kernel(_) => ResourceKind::Kernel,
            Self::Memory(_) => ResourceKind::Memory,
            Self::Program(_) => ResourceKind::Program,
        }
    }

    /// Drops one native reference through the kind's release call.
    ///
    /// # Errors
    ///
    /// Returns [`ClError::Release`] if the driver reports a failure.
    pub fn release(&self) -> Result<()> {
        match self {
            Self::Context(r) => r.release(),
            Self::CommandQueue(r) => r.release(),
            Self::Device(r) => r.release(),
            Self::Event(r) => r.release(),
            Self::Kernel(r) => r.release(),
            Self::Memory(r) => r.release(),
            Self::Program(r) => r.release(),
        }
    }
}

macro_rules! into_resource {
    ($($variant:ident($ty:ty)),+ $(,)?) => {
        $(
            impl From<$ty> for Resource {
                fn from(value: $ty) -> Self {
                    Self::$variant(value)
                }
            }

            impl From<$ty> for Releasable {
                fn from(value: $ty) -> Self {
                    Self::One(Resource::$variant(value))
                }
            }
        )+
    };
}

into_resource!(
    Context(Context),
    CommandQueue(CommandQueue),
    Device(Device),
    Event(Event),
    Kernel(Kernel),
    Memory(Buffer),
    Program(Program),
);

/// A single resource or an arbitrarily nested ordered collection of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Releasable {
    One(Resource),
    Many(Vec<Releasable>),
}

impl Releasable {
    /// Number of leaf resources.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::One(_) => 1,
            Self::Many(items) => items.iter().map(Self::len).sum(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Resource> for Releasable {
    fn from(value: Resource) -> Self {
        Self::One(value)
    }
}

impl<T: Into<Releasable>> From<Vec<T>> for Releasable {
    fn from(items: Vec<T>) -> Self {
        Self::Many(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Releasable>> From<Option<T>> for Releasable {
    fn from(item: Option<T>) -> Self {
        item.map_or_else(|| Self::Many(Vec::new()), Into::into)
    }
}

/// Releases one resource through its kind's release call.
///
/// # Errors
///
/// Returns [`ClError::Release`] if the driver reports a failure.
pub fn release(resource: impl Into<Resource>) -> Result<()> {
    resource.into().release()
}

/// Releases every leaf of `value` exactly once, in order, and returns how
/// many leaves were visited.
///
/// A failing leaf does not stop the traversal.
///
/// # Errors
///
/// The single release failure, or [`ClError::Aggregate`] when several fail.
pub fn release_all(value: impl Into<Releasable>) -> Result<usize> {
    let value = value.into();
    let mut failures = Vec::new();
    let visited = release_leaves(&value, &mut failures);
    match ClError::collect(failures) {
        None => Ok(visited),
        Some(err) => Err(err),
    }
}

fn release_leaves(value: &Releasable, failures: &mut Vec<ClError>) -> usize {
    match value {
        Releasable::One(resource) => {
            if let Err(err) = resource.release() {
                failures.push(err);
            }
            1
        }
        Releasable::Many(items) => items.iter().map(|item| release_leaves(item, failures)).sum(),
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::backend::mock::MockDriver;
    use crate::flags::MemFlags;

    fn setup() -> (Arc<MockDriver>, Context) {
        let mock = Arc::new(MockDriver::new());
        let driver: Arc<dyn Driver> = mock.clone();
        let platform = Platform::list(&driver).unwrap().remove(0);
        let devices = platform.devices(DeviceType::All).unwrap();
        let context = Context::new(&devices).unwrap();
        (mock, context)
    }

    #[test]
    fn release_all_visits_every_leaf_once() {
        let (mock, ctx) = setup();
        let buf = |n| Buffer::new(&ctx, MemFlags::READ_WRITE, n).unwrap();
        let (a, b, c, d, e) = (buf(4), buf(8), buf(16), buf(32), buf(64));
        let nested = Releasable::Many(vec![
            a.into(),
            Releasable::Many(vec![b.into(), vec![c, d].into()]),
            e.into(),
        ]);
        assert_eq!(nested.len(), 5);
        let before = mock.release_log().len();
        assert_eq!(release_all(nested).unwrap(), 5);
        assert_eq!(mock.release_log().len() - before, 5);
        release(ctx).unwrap();
    }

    #[test]
    fn release_dispatches_by_kind() {
        let (mock, ctx) = setup();
        let queue = CommandQueue::new(&ctx, &ctx.devices()[0], QueueProperties::IN_ORDER).unwrap();
        let event = Event::user(&ctx).unwrap();
        release_all(vec![Resource::from(event), queue.into(), ctx.into()]).unwrap();
        let kinds: Vec<ResourceKind> = mock.release_log().into_iter().map(|(k, _)| k).collect();
        assert_eq!(
            kinds,
            vec![ResourceKind::Event, ResourceKind::CommandQueue, ResourceKind::Context]
        );
    }

    #[test]
    fn double_release_surfaces_release_error() {
        let (_mock, ctx) = setup();
        let buffer = Buffer::new(&ctx, MemFlags::READ_WRITE, 16).unwrap();
        buffer.release().unwrap();
        let err = buffer.release().unwrap_err();
        assert!(matches!(
            err,
            ClError::Release { kind: ResourceKind::Memory, code: -38, .. }
        ));
        ctx.release().unwrap();
    }

    #[test]
    fn release_all_continues_past_failures() {
        let (mock, ctx) = setup();
        let a = Buffer::new(&ctx, MemFlags::READ_WRITE, 4).unwrap();
        let b = Buffer::new(&ctx, MemFlags::READ_WRITE, 4).unwrap();
        let c = Buffer::new(&ctx, MemFlags::READ_WRITE, 4).unwrap();
        mock.fail_release(a.id().as_raw(), Status::OUT_OF_RESOURCES);
        mock.fail_release(c.id().as_raw(), Status::OUT_OF_RESOURCES);
        let err = release_all(vec![a, b.clone(), c]).unwrap_err();
        assert!(matches!(err, ClError::Aggregate(ref v) if v.len() == 2));
        assert!(mock.release_log().contains(&(ResourceKind::Memory, b.id().as_raw())));
    }

    #[test]
    fn retain_requires_a_matching_release() {
        let (_mock, ctx) = setup();
        let buffer = Buffer::new(&ctx, MemFlags::READ_WRITE, 16).unwrap();
        buffer.retain().unwrap();
        buffer.release().unwrap();
        buffer.release().unwrap();
        assert!(buffer.release().is_err());
    }

    #[test]
    fn sub_buffer_range_is_checked_and_parent_survives() {
        let (_mock, ctx) = setup();
        let parent = Buffer::new(&ctx, MemFlags::READ_WRITE, 64).unwrap();
        assert!(matches!(
            parent.sub_buffer(MemFlags::READ_WRITE, 48, 32),
            Err(ClError::InvalidArgument(_))
        ));
        let view = parent.sub_buffer(MemFlags::READ_WRITE, 16, 32).unwrap();
        assert_eq!(view.parent(), Some((parent.id(), 16)));
        assert_eq!(view.size(), 32);
        view.release().unwrap();
        parent.release().unwrap();
    }

    #[test]
    fn context_needs_devices() {
        assert!(matches!(Context::new(&[]), Err(ClError::InvalidArgument(_))));
    }

    #[test]
    fn failed_build_collects_logs_per_device() {
        let (_mock, ctx) = setup();
        let program = Program::with_source(&ctx, &["#error missing semicolon\n"]).unwrap();
        let err = program.build(&[], "").unwrap_err();
        match err {
            ClError::Build { code, logs, .. } => {
                assert_eq!(code, Status::BUILD_PROGRAM_FAILURE.code());
                assert_eq!(logs.len(), ctx.devices().len());
                assert!(logs.iter().all(|(_, log)| log.contains("missing semicolon")));
            }
            other => panic!("expected build error, got {other:?}"),
        }
    }

    #[test]
    fn kernel_lookup_by_name() {
        let (_mock, ctx) = setup();
        let program = Program::with_source(&ctx, &["__kernel void square(__global float* x) {}"])
            .unwrap();
        program.build(&[], "-cl-fast-relaxed-math").unwrap();
        let kernel = program.kernel("square").unwrap();
        assert_eq!(kernel.name(), "square");
        assert_eq!(
            program.kernel("cube").unwrap_err().status(),
            Some(Status::INVALID_KERNEL_NAME)
        );
    }
}
