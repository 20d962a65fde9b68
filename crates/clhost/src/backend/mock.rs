//! In-process native layer.
//!
//! Every object lives in one table behind a mutex. Ids come from a single
//! counter, so a raw id names at most one object of any kind. An object whose
//! reference count reaches zero stays in the table so that pending commands
//! can still resolve it, but every entry point treats it as invalid. Events
//! are dropped from the table once they are unreferenced, terminal and no
//! queue or pending command depends on them.
//!
//! Commands run synchronously on the enqueueing thread as soon as their
//! dependencies are terminal; blocked commands are re-examined whenever an
//! event changes state. Callbacks always run on a freshly spawned thread.

use crate::driver::{
    BuildCallback, ContextId, DeviceId, DeviceInfo, Driver, EventCallback, EventId, KernelArg,
    KernelId, MemId, PlatformId, ProgramId, QueueId, ResourceKind,
};
use crate::flags::{DeviceType, MapAccess, MemFlags, QueueProperties};
use crate::status::{ExecutionStatus, NativeResult, Status};
use crate::work::WorkSize;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Host implementation of a kernel, looked up by entry-point name at launch.
pub type HostKernel =
    Arc<dyn Fn(&WorkSize, &mut KernelMemory) -> NativeResult<()> + Send + Sync + 'static>;

/// A kernel launch as it reached the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRecord {
    pub queue: QueueId,
    pub kernel: String,
    pub work: WorkSize,
    pub args: Vec<KernelArg>,
}

/// Argument values handed to a [`HostKernel`]. Buffer arguments are copied in
/// before the call and written back after it returns `Ok`.
#[derive(Debug)]
pub struct KernelMemory {
    slots: Vec<Slot>,
}

#[derive(Debug)]
enum Slot {
    Mem { id: usize, bytes: Vec<u8> },
    Scalar(Vec<u8>),
    Local(Vec<u8>),
}

impl KernelMemory {
    /// Number of bound arguments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Contents of a buffer or local-memory argument.
    ///
    /// # Errors
    ///
    /// `INVALID_ARG_INDEX` past the last argument, `INVALID_ARG_VALUE` for a
    /// scalar.
    pub fn bytes(&self, index: usize) -> NativeResult<&[u8]> {
        match self.slots.get(index) {
            Some(Slot::Mem { bytes, .. } | Slot::Local(bytes)) => Ok(bytes.as_slice()),
            Some(Slot::Scalar(_)) => Err(Status::INVALID_ARG_VALUE),
            None => Err(Status::INVALID_ARG_INDEX),
        }
    }

    /// # Errors
    ///
    /// As [`KernelMemory::bytes`].
    pub fn bytes_mut(&mut self, index: usize) -> NativeResult<&mut [u8]> {
        match self.slots.get_mut(index) {
            Some(Slot::Mem { bytes, .. } | Slot::Local(bytes)) => Ok(bytes.as_mut_slice()),
            Some(Slot::Scalar(_)) => Err(Status::INVALID_ARG_VALUE),
            None => Err(Status::INVALID_ARG_INDEX),
        }
    }

    /// Decodes a buffer argument as a vector of `T`. Trailing bytes that do
    /// not fill a whole `T` are ignored.
    ///
    /// # Errors
    ///
    /// As [`KernelMemory::bytes`].
    pub fn read<T: bytemuck::Pod>(&self, index: usize) -> NativeResult<Vec<T>> {
        let bytes = self.bytes(index)?;
        Ok(bytes
            .chunks_exact(std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    /// Stores `values` into a buffer argument starting at element `at`.
    ///
    /// # Errors
    ///
    /// `INVALID_VALUE` if the values do not fit, otherwise as
    /// [`KernelMemory::bytes`].
    pub fn write<T: bytemuck::Pod>(&mut self, index: usize, at: usize, values: &[T]) -> NativeResult<()> {
        let src: &[u8] = bytemuck::cast_slice(values);
        let start = at * std::mem::size_of::<T>();
        let dst = self
            .bytes_mut(index)?
            .get_mut(start..start + src.len())
            .ok_or(Status::INVALID_VALUE)?;
        dst.copy_from_slice(src);
        Ok(())
    }

    /// Decodes a scalar argument.
    ///
    /// # Errors
    ///
    /// `INVALID_ARG_SIZE` if the bound bytes are not exactly a `T`,
    /// `INVALID_ARG_VALUE` for a non-scalar argument.
    pub fn scalar<T: bytemuck::Pod>(&self, index: usize) -> NativeResult<T> {
        match self.slots.get(index) {
            Some(Slot::Scalar(bytes)) => {
                bytemuck::try_pod_read_unaligned(bytes).map_err(|_| Status::INVALID_ARG_SIZE)
            }
            Some(_) => Err(Status::INVALID_ARG_VALUE),
            None => Err(Status::INVALID_ARG_INDEX),
        }
    }
}

struct Entry<T> {
    refs: usize,
    value: T,
}

impl<T> Entry<T> {
    fn new(value: T) -> Self {
        Self { refs: 1, value }
    }
}

struct PlatformObj {
    id: PlatformId,
    name: String,
    devices: Vec<DeviceId>,
}

struct ContextObj {
    devices: Vec<DeviceId>,
}

struct QueueObj {
    context: usize,
    device: DeviceId,
    out_of_order: bool,
    tail: Option<usize>,
    barrier: Option<usize>,
}

enum Storage {
    Owned(Vec<u8>),
    View { parent: usize, origin: usize },
}

struct MemObj {
    context: usize,
    size: usize,
    storage: Storage,
}

struct ProgramObj {
    context: usize,
    source: String,
    kernels: Option<Vec<(String, usize)>>,
    logs: HashMap<DeviceId, String>,
}

struct KernelObj {
    context: usize,
    name: String,
    args: Vec<Option<KernelArg>>,
}

struct EventObj {
    status: ExecutionStatus,
    user: bool,
    callbacks: Vec<(ExecutionStatus, EventCallback)>,
}

impl EventObj {
    fn new(status: ExecutionStatus, user: bool) -> Self {
        Self {
            status,
            user,
            callbacks: Vec::new(),
        }
    }
}

/// Destination of a pending read.
struct HostPtr(*mut u8);

// SAFETY: the enqueuer guarantees the pointee stays valid until the read
// completes, whichever thread completes it.
unsafe impl Send for HostPtr {}

/// Heap block handed out by a map and reclaimed when the unmap runs.
struct Shadow {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the block is uniquely owned by its mapping entry.
unsafe impl Send for Shadow {}

impl Shadow {
    fn new(len: usize) -> Self {
        let block: Box<[u8]> = vec![0; len].into_boxed_slice();
        let len = block.len();
        Self {
            ptr: Box::into_raw(block).cast::<u8>(),
            len,
        }
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: `ptr` is a live allocation of `len` bytes until drop.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as `bytes`.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for Shadow {
    fn drop(&mut self) {
        // SAFETY: reconstructs the box leaked in `new`.
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr, self.len,
            )));
        }
    }
}

struct Mapping {
    mem: usize,
    offset: usize,
    access: MapAccess,
    shadow: Shadow,
}

enum Action {
    Nop,
    Kernel {
        name: String,
        args: Vec<KernelArg>,
        work: WorkSize,
    },
    Read {
        mem: usize,
        offset: usize,
        dst: HostPtr,
        len: usize,
    },
    Write {
        mem: usize,
        offset: usize,
        data: Vec<u8>,
    },
    Map {
        key: usize,
    },
    Unmap {
        key: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Order {
    Command,
    Marker,
    Barrier,
}

struct Command {
    event: usize,
    queue: usize,
    deps: Vec<usize>,
    action: Action,
}

struct Fired {
    callback: EventCallback,
    event: EventId,
    status: ExecutionStatus,
}

fn live<T>(map: &HashMap<usize, Entry<T>>, id: usize, kind: ResourceKind) -> NativeResult<&T> {
    match map.get(&id) {
        Some(entry) if entry.refs > 0 => Ok(&entry.value),
        _ => Err(kind.invalid_status()),
    }
}

fn live_mut<T>(
    map: &mut HashMap<usize, Entry<T>>,
    id: usize,
    kind: ResourceKind,
) -> NativeResult<&mut T> {
    match map.get_mut(&id) {
        Some(entry) if entry.refs > 0 => Ok(&mut entry.value),
        _ => Err(kind.invalid_status()),
    }
}

#[derive(Default)]
struct State {
    next_id: usize,
    platforms: Vec<PlatformObj>,
    devices: HashMap<DeviceId, DeviceInfo>,
    contexts: HashMap<usize, Entry<ContextObj>>,
    queues: HashMap<usize, Entry<QueueObj>>,
    mems: HashMap<usize, Entry<MemObj>>,
    programs: HashMap<usize, Entry<ProgramObj>>,
    kernels: HashMap<usize, Entry<KernelObj>>,
    events: HashMap<usize, Entry<EventObj>>,
    pending: Vec<Command>,
    mappings: HashMap<usize, Mapping>,
    host_kernels: HashMap<String, HostKernel>,
    release_log: Vec<(ResourceKind, usize)>,
    release_faults: HashMap<usize, Status>,
    launches: Vec<LaunchRecord>,
}

impl State {
    fn alloc(&mut self) -> usize {
        self.next_id += 1;
        self.next_id
    }

    fn refs_mut(&mut self, kind: ResourceKind, raw: usize) -> Option<&mut usize> {
        match kind {
            ResourceKind::Context => self.contexts.get_mut(&raw).map(|e| &mut e.refs),
            ResourceKind::CommandQueue => self.queues.get_mut(&raw).map(|e| &mut e.refs),
            ResourceKind::Event => self.events.get_mut(&raw).map(|e| &mut e.refs),
            ResourceKind::Kernel => self.kernels.get_mut(&raw).map(|e| &mut e.refs),
            ResourceKind::Memory => self.mems.get_mut(&raw).map(|e| &mut e.refs),
            ResourceKind::Program => self.programs.get_mut(&raw).map(|e| &mut e.refs),
            ResourceKind::Device => None,
        }
    }

    fn status_of(&self, event: usize) -> ExecutionStatus {
        self.events.get(&event).map_or(
            ExecutionStatus::Error(Status::INVALID_EVENT.code()),
            |e| e.value.status,
        )
    }

    fn check_wait(&self, wait: &[EventId]) -> NativeResult<()> {
        if wait
            .iter()
            .all(|e| self.events.get(&e.0).is_some_and(|entry| entry.refs > 0))
        {
            Ok(())
        } else {
            Err(Status::INVALID_EVENT_WAIT_LIST)
        }
    }

    fn queue_context(&self, queue: QueueId) -> NativeResult<usize> {
        Ok(live(&self.queues, queue.0, ResourceKind::CommandQueue)?.context)
    }

    /// Size of `mem`, checked to belong to `context`.
    fn mem_in(&self, mem: MemId, context: usize) -> NativeResult<usize> {
        let obj = live(&self.mems, mem.0, ResourceKind::Memory)?;
        if obj.context == context {
            Ok(obj.size)
        } else {
            Err(Status::INVALID_CONTEXT)
        }
    }

    /// Backing bytes of `mem`, resolving views to their parent's storage.
    /// Ignores reference counts so queued commands outlive their handles.
    fn bytes_mut(&mut self, mem: usize, offset: usize, len: usize) -> NativeResult<&mut [u8]> {
        let (root, origin) = match self.mems.get(&mem).map(|e| &e.value.storage) {
            Some(Storage::Owned(_)) => (mem, 0),
            Some(Storage::View { parent, origin }) => (*parent, *origin),
            None => return Err(Status::INVALID_MEM_OBJECT),
        };
        let start = origin + offset;
        match self.mems.get_mut(&root).map(|e| &mut e.value.storage) {
            Some(Storage::Owned(bytes)) => bytes
                .get_mut(start..start + len)
                .ok_or(Status::INVALID_VALUE),
            _ => Err(Status::INVALID_MEM_OBJECT),
        }
    }

    fn enqueue(
        &mut self,
        queue: QueueId,
        wait: &[EventId],
        order: Order,
        want_event: bool,
        action: Action,
    ) -> NativeResult<usize> {
        self.check_wait(wait)?;
        let q = live_mut(&mut self.queues, queue.0, ResourceKind::CommandQueue)?;
        self.next_id += 1;
        let id = self.next_id;
        let mut deps: Vec<usize> = wait.iter().map(|e| e.0).collect();
        if q.out_of_order {
            if order != Order::Command && wait.is_empty() {
                deps.extend(
                    self.pending
                        .iter()
                        .filter(|c| c.queue == queue.0)
                        .map(|c| c.event),
                );
            }
            deps.extend(q.barrier);
            if order == Order::Barrier {
                q.barrier = Some(id);
            }
        } else {
            deps.extend(q.tail);
        }
        q.tail = Some(id);
        self.events.insert(
            id,
            Entry {
                refs: usize::from(want_event),
                value: EventObj::new(ExecutionStatus::Queued, false),
            },
        );
        self.pending.push(Command {
            event: id,
            queue: queue.0,
            deps,
            action,
        });
        Ok(id)
    }

    /// Runs every command whose dependencies are terminal until none is left.
    fn pump(&mut self, fired: &mut Vec<Fired>) {
        while let Some(pos) = self
            .pending
            .iter()
            .position(|c| c.deps.iter().all(|d| self.status_of(*d).is_terminal()))
        {
            let command = self.pending.remove(pos);
            let upstream_failed = command
                .deps
                .iter()
                .any(|d| matches!(self.status_of(*d), ExecutionStatus::Error(_)));
            let status = if upstream_failed {
                ExecutionStatus::Error(Status::EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST.code())
            } else {
                match self.execute(command.action) {
                    Ok(()) => ExecutionStatus::Complete,
                    Err(status) => ExecutionStatus::Error(status.code()),
                }
            };
            self.settle(command.event, status, fired);
        }
        self.prune_events();
    }

    /// Pins `events` for a blocked caller so they outlive a concurrent
    /// release until the caller has seen their outcome.
    fn hold(&mut self, events: &[usize]) {
        for event in events {
            if let Some(entry) = self.events.get_mut(event) {
                entry.refs += 1;
            }
        }
    }

    fn unhold(&mut self, events: &[usize]) {
        for event in events {
            if let Some(entry) = self.events.get_mut(event) {
                entry.refs -= 1;
            }
        }
        self.prune_events();
    }

    /// Drops events nothing can observe any more.
    fn prune_events(&mut self) {
        let mut pinned: HashSet<usize> = self
            .pending
            .iter()
            .flat_map(|c| c.deps.iter().copied())
            .collect();
        pinned.extend(
            self.queues
                .values()
                .flat_map(|q| q.value.tail.into_iter().chain(q.value.barrier)),
        );
        self.events
            .retain(|id, e| e.refs > 0 || !e.value.status.is_terminal() || pinned.contains(id));
    }

    fn settle(&mut self, event: usize, status: ExecutionStatus, fired: &mut Vec<Fired>) {
        let Some(entry) = self.events.get_mut(&event) else {
            return;
        };
        entry.value.status = status;
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut entry.value.callbacks)
            .into_iter()
            .partition(|(target, _)| status.has_reached(*target));
        entry.value.callbacks = waiting;
        fired.extend(ready.into_iter().map(|(_, callback)| Fired {
            callback,
            event: EventId(event),
            status,
        }));
    }

    fn execute(&mut self, action: Action) -> NativeResult<()> {
        match action {
            Action::Nop => Ok(()),
            Action::Kernel { name, args, work } => self.run_kernel(&name, &args, &work),
            Action::Read {
                mem,
                offset,
                dst,
                len,
            } => {
                let src = self.bytes_mut(mem, offset, len)?;
                // SAFETY: the enqueuer guarantees `dst` is valid for `len`
                // byte writes until this command completes.
                unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst.0, len) };
                Ok(())
            }
            Action::Write { mem, offset, data } => {
                self.bytes_mut(mem, offset, data.len())?
                    .copy_from_slice(&data);
                Ok(())
            }
            Action::Map { key } => {
                let (mem, offset, len) = self
                    .mappings
                    .get(&key)
                    .map(|m| (m.mem, m.offset, m.shadow.len))
                    .ok_or(Status::INVALID_VALUE)?;
                let current = self.bytes_mut(mem, offset, len)?.to_vec();
                if let Some(mapping) = self.mappings.get_mut(&key) {
                    mapping.shadow.bytes_mut().copy_from_slice(&current);
                }
                Ok(())
            }
            Action::Unmap { key } => {
                let mapping = self.mappings.remove(&key).ok_or(Status::INVALID_VALUE)?;
                let writes = mapping.access.contains(MapAccess::WRITE)
                    || mapping.access.contains(MapAccess::WRITE_INVALIDATE_REGION);
                if writes {
                    self.bytes_mut(mapping.mem, mapping.offset, mapping.shadow.len)?
                        .copy_from_slice(mapping.shadow.bytes());
                }
                Ok(())
            }
        }
    }

    fn run_kernel(&mut self, name: &str, args: &[KernelArg], work: &WorkSize) -> NativeResult<()> {
        let Some(run) = self.host_kernels.get(name).cloned() else {
            return Ok(());
        };
        let mut memory = KernelMemory {
            slots: Vec::with_capacity(args.len()),
        };
        for arg in args {
            memory.slots.push(match arg {
                KernelArg::Mem(id) => {
                    let size = self
                        .mems
                        .get(&id.0)
                        .map(|e| e.value.size)
                        .ok_or(Status::INVALID_MEM_OBJECT)?;
                    Slot::Mem {
                        id: id.0,
                        bytes: self.bytes_mut(id.0, 0, size)?.to_vec(),
                    }
                }
                KernelArg::Scalar(bytes) => Slot::Scalar(bytes.clone()),
                KernelArg::Local(size) => Slot::Local(vec![0; *size]),
            });
        }
        run(work, &mut memory)?;
        for slot in memory.slots {
            if let Slot::Mem { id, bytes } = slot {
                self.bytes_mut(id, 0, bytes.len())?.copy_from_slice(&bytes);
            }
        }
        Ok(())
    }
}

fn parse_kernels(source: &str) -> Vec<(String, usize)> {
    fn is_ident(c: char) -> bool {
        c.is_ascii_alphanumeric() || c == '_'
    }

    let mut found = Vec::new();
    for (at, keyword) in source.match_indices("kernel") {
        let before = &source[..at];
        let before = before.strip_suffix("__").unwrap_or(before);
        if before.chars().next_back().is_some_and(is_ident) {
            continue;
        }
        let rest = &source[at + keyword.len()..];
        if !rest.starts_with(char::is_whitespace) {
            continue;
        }
        let Some(rest) = rest.trim_start().strip_prefix("void") else {
            continue;
        };
        if !rest.starts_with(char::is_whitespace) {
            continue;
        }
        let rest = rest.trim_start();
        let end = rest.find(|c: char| !is_ident(c)).unwrap_or(rest.len());
        let (name, rest) = rest.split_at(end);
        let Some(params) = rest.trim_start().strip_prefix('(') else {
            continue;
        };
        let Some(close) = params.find(')') else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        let params = params[..close].trim();
        let arity = if params.is_empty() || params == "void" {
            0
        } else {
            params.split(',').count()
        };
        found.push((name.to_owned(), arity));
    }
    found
}

fn check_options(options: &str) -> NativeResult<()> {
    let mut expects_value = false;
    for token in options.split_whitespace() {
        if expects_value {
            expects_value = false;
        } else if token == "-D" || token == "-I" {
            expects_value = true;
        } else if !token.starts_with('-') {
            return Err(Status::INVALID_BUILD_OPTIONS);
        }
    }
    Ok(())
}

fn deliver(fired: Vec<Fired>) {
    for Fired {
        callback,
        event,
        status,
    } in fired
    {
        std::thread::spawn(move || callback(event, status));
    }
}

fn default_devices() -> Vec<DeviceInfo> {
    vec![
        DeviceInfo {
            name: "Mock CPU".to_owned(),
            vendor: "clhost".to_owned(),
            kind: DeviceType::Cpu,
            compute_units: 8,
            max_work_group_size: 1024,
        },
        DeviceInfo {
            name: "Mock GPU".to_owned(),
            vendor: "clhost".to_owned(),
            kind: DeviceType::Gpu,
            compute_units: 32,
            max_work_group_size: 256,
        },
    ]
}

/// Simulated native layer with one platform.
pub struct MockDriver {
    state: Mutex<State>,
    changed: Condvar,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    /// One platform with a CPU and a GPU device.
    #[must_use]
    pub fn new() -> Self {
        Self::with_devices(default_devices())
    }

    /// One platform exposing `devices` in order.
    #[must_use]
    pub fn with_devices(devices: Vec<DeviceInfo>) -> Self {
        let mut state = State::default();
        let platform = PlatformId(state.alloc());
        let mut ids = Vec::with_capacity(devices.len());
        for info in devices {
            let id = DeviceId(state.alloc());
            state.devices.insert(id, info);
            ids.push(id);
        }
        state.platforms.push(PlatformObj {
            id: platform,
            name: "Mock Platform".to_owned(),
            devices: ids,
        });
        Self {
            state: Mutex::new(state),
            changed: Condvar::new(),
        }
    }

    /// Installs the host implementation run when a kernel named `name` is
    /// launched. Replaces any earlier registration.
    pub fn register_kernel<F>(&self, name: &str, kernel: F)
    where
        F: Fn(&WorkSize, &mut KernelMemory) -> NativeResult<()> + Send + Sync + 'static,
    {
        self.state
            .lock()
            .host_kernels
            .insert(name.to_owned(), Arc::new(kernel));
    }

    /// Every successful release, in call order.
    #[must_use]
    pub fn release_log(&self) -> Vec<(ResourceKind, usize)> {
        self.state.lock().release_log.clone()
    }

    /// Every kernel launch, in enqueue order.
    #[must_use]
    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.state.lock().launches.clone()
    }

    /// Makes the next release of the object with raw id `raw` fail with
    /// `status`, leaving its reference count untouched.
    pub fn fail_release(&self, raw: usize, status: Status) {
        self.state.lock().release_faults.insert(raw, status);
    }

    /// Number of reference-counted objects (devices aside) still holding a
    /// reference.
    #[must_use]
    pub fn live_objects(&self) -> usize {
        fn count<T>(map: &HashMap<usize, Entry<T>>) -> usize {
            map.values().filter(|e| e.refs > 0).count()
        }
        let st = self.state.lock();
        count(&st.contexts)
            + count(&st.queues)
            + count(&st.mems)
            + count(&st.programs)
            + count(&st.kernels)
            + count(&st.events)
    }

    /// Number of events still in the table, referenced or not.
    #[must_use]
    pub fn tracked_events(&self) -> usize {
        self.state.lock().events.len()
    }

    /// Runs whatever became ready, wakes blocked waiters and fires callbacks
    /// outside the lock.
    fn commit(&self, mut st: MutexGuard<'_, State>, mut fired: Vec<Fired>) {
        st.pump(&mut fired);
        drop(st);
        self.changed.notify_all();
        deliver(fired);
    }

    fn submit(
        &self,
        mut st: MutexGuard<'_, State>,
        event: usize,
        blocking: bool,
        want_event: bool,
    ) -> NativeResult<Option<EventId>> {
        if blocking {
            st.hold(&[event]);
        }
        self.commit(st, Vec::new());
        if blocking {
            self.await_held(&[event])?;
        }
        Ok(want_event.then_some(EventId(event)))
    }

    /// Waits on events pinned with [`State::hold`], then unpins them.
    fn await_held(&self, events: &[usize]) -> NativeResult<()> {
        let waited = self.await_events(events);
        self.state.lock().unhold(events);
        waited
    }

    fn await_events(&self, events: &[usize]) -> NativeResult<()> {
        let mut st = self.state.lock();
        loop {
            let statuses: Vec<ExecutionStatus> = events.iter().map(|e| st.status_of(*e)).collect();
            if statuses.iter().all(|s| s.is_terminal()) {
                return if statuses.iter().any(|s| matches!(s, ExecutionStatus::Error(_))) {
                    Err(Status::EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST)
                } else {
                    Ok(())
                };
            }
            self.changed.wait(&mut st);
        }
    }

    fn retain(&self, kind: ResourceKind, raw: usize) -> NativeResult<()> {
        let mut st = self.state.lock();
        if kind == ResourceKind::Device {
            return if st.devices.contains_key(&DeviceId(raw)) {
                Ok(())
            } else {
                Err(kind.invalid_status())
            };
        }
        let refs = st
            .refs_mut(kind, raw)
            .filter(|refs| **refs > 0)
            .ok_or(kind.invalid_status())?;
        *refs += 1;
        Ok(())
    }

    fn release(&self, kind: ResourceKind, raw: usize) -> NativeResult<()> {
        let mut st = self.state.lock();
        if let Some(status) = st.release_faults.remove(&raw) {
            return Err(status);
        }
        if kind == ResourceKind::Device {
            if !st.devices.contains_key(&DeviceId(raw)) {
                return Err(kind.invalid_status());
            }
        } else {
            let refs = st
                .refs_mut(kind, raw)
                .filter(|refs| **refs > 0)
                .ok_or(kind.invalid_status())?;
            *refs -= 1;
            if kind == ResourceKind::Event {
                st.prune_events();
            }
        }
        st.release_log.push((kind, raw));
        Ok(())
    }

    fn enqueue_sync(
        &self,
        queue: QueueId,
        wait: &[EventId],
        order: Order,
        want_event: bool,
    ) -> NativeResult<Option<EventId>> {
        let mut st = self.state.lock();
        let event = st.enqueue(queue, wait, order, want_event, Action::Nop)?;
        self.submit(st, event, false, want_event)
    }
}

impl Driver for MockDriver {
    fn name(&self) -> &str {
        "mock"
    }

    fn platform_ids(&self) -> NativeResult<Vec<PlatformId>> {
        Ok(self.state.lock().platforms.iter().map(|p| p.id).collect())
    }

    fn platform_name(&self, platform: PlatformId) -> NativeResult<String> {
        self.state
            .lock()
            .platforms
            .iter()
            .find(|p| p.id == platform)
            .map(|p| p.name.clone())
            .ok_or(Status::INVALID_PLATFORM)
    }

    fn device_ids(&self, platform: PlatformId, kind: DeviceType) -> NativeResult<Vec<DeviceId>> {
        let st = self.state.lock();
        let platform = st
            .platforms
            .iter()
            .find(|p| p.id == platform)
            .ok_or(Status::INVALID_PLATFORM)?;
        let mut ids: Vec<DeviceId> = platform
            .devices
            .iter()
            .copied()
            .filter(|id| st.devices.get(id).is_some_and(|info| kind.selects(info.kind)))
            .collect();
        if kind == DeviceType::Default {
            ids.truncate(1);
        }
        if ids.is_empty() {
            Err(Status::DEVICE_NOT_FOUND)
        } else {
            Ok(ids)
        }
    }

    fn device_info(&self, device: DeviceId) -> NativeResult<DeviceInfo> {
        self.state
            .lock()
            .devices
            .get(&device)
            .cloned()
            .ok_or(Status::INVALID_DEVICE)
    }

    fn create_context(&self, devices: &[DeviceId]) -> NativeResult<ContextId> {
        let mut st = self.state.lock();
        if devices.is_empty() {
            return Err(Status::INVALID_VALUE);
        }
        if !devices.iter().all(|d| st.devices.contains_key(d)) {
            return Err(Status::INVALID_DEVICE);
        }
        let id = st.alloc();
        st.contexts.insert(
            id,
            Entry::new(ContextObj {
                devices: devices.to_vec(),
            }),
        );
        Ok(ContextId(id))
    }

    fn create_command_queue(
        &self,
        context: ContextId,
        device: DeviceId,
        properties: QueueProperties,
    ) -> NativeResult<QueueId> {
        let mut st = self.state.lock();
        let ctx = live(&st.contexts, context.0, ResourceKind::Context)?;
        if !ctx.devices.contains(&device) {
            return Err(Status::INVALID_DEVICE);
        }
        let known = QueueProperties::OUT_OF_ORDER | QueueProperties::PROFILING;
        if !known.contains(properties) {
            return Err(Status::INVALID_QUEUE_PROPERTIES);
        }
        let id = st.alloc();
        st.queues.insert(
            id,
            Entry::new(QueueObj {
                context: context.0,
                device,
                out_of_order: properties.is_out_of_order(),
                tail: None,
                barrier: None,
            }),
        );
        Ok(QueueId(id))
    }

    fn create_buffer(
        &self,
        context: ContextId,
        flags: MemFlags,
        size: usize,
        host: Option<&[u8]>,
    ) -> NativeResult<MemId> {
        let mut st = self.state.lock();
        live(&st.contexts, context.0, ResourceKind::Context)?;
        if size == 0 {
            return Err(Status::INVALID_BUFFER_SIZE);
        }
        let access = [MemFlags::READ_WRITE, MemFlags::WRITE_ONLY, MemFlags::READ_ONLY]
            .into_iter()
            .filter(|f| flags.contains(*f))
            .count();
        if access > 1 {
            return Err(Status::INVALID_VALUE);
        }
        let copies = flags.contains(MemFlags::COPY_HOST_PTR) || flags.contains(MemFlags::USE_HOST_PTR);
        let storage = match host {
            Some(bytes) if copies && bytes.len() == size => bytes.to_vec(),
            None if !copies => vec![0; size],
            _ => return Err(Status::INVALID_HOST_PTR),
        };
        let id = st.alloc();
        st.mems.insert(
            id,
            Entry::new(MemObj {
                context: context.0,
                size,
                storage: Storage::Owned(storage),
            }),
        );
        Ok(MemId(id))
    }

    fn create_sub_buffer(
        &self,
        parent: MemId,
        _flags: MemFlags,
        origin: usize,
        size: usize,
    ) -> NativeResult<MemId> {
        let mut st = self.state.lock();
        let obj = live(&st.mems, parent.0, ResourceKind::Memory)?;
        if matches!(obj.storage, Storage::View { .. }) {
            return Err(Status::INVALID_MEM_OBJECT);
        }
        if size == 0 {
            return Err(Status::INVALID_BUFFER_SIZE);
        }
        if origin.checked_add(size).map_or(true, |end| end > obj.size) {
            return Err(Status::INVALID_VALUE);
        }
        let context = obj.context;
        let id = st.alloc();
        st.mems.insert(
            id,
            Entry::new(MemObj {
                context,
                size,
                storage: Storage::View {
                    parent: parent.0,
                    origin,
                },
            }),
        );
        Ok(MemId(id))
    }

    fn create_program_with_source(
        &self,
        context: ContextId,
        sources: &[&str],
    ) -> NativeResult<ProgramId> {
        let mut st = self.state.lock();
        live(&st.contexts, context.0, ResourceKind::Context)?;
        if sources.iter().all(|s| s.is_empty()) {
            return Err(Status::INVALID_VALUE);
        }
        let id = st.alloc();
        st.programs.insert(
            id,
            Entry::new(ProgramObj {
                context: context.0,
                source: sources.join("\n"),
                kernels: None,
                logs: HashMap::new(),
            }),
        );
        Ok(ProgramId(id))
    }

    fn build_program(
        &self,
        program: ProgramId,
        devices: &[DeviceId],
        options: &str,
        notify: Option<BuildCallback>,
    ) -> NativeResult<()> {
        let mut st = self.state.lock();
        let st = &mut *st;
        let obj = live_mut(&mut st.programs, program.0, ResourceKind::Program)?;
        let context = live(&st.contexts, obj.context, ResourceKind::Context)?;
        let targets = if devices.is_empty() {
            context.devices.clone()
        } else {
            devices.to_vec()
        };
        if !targets.iter().all(|d| context.devices.contains(d)) {
            return Err(Status::INVALID_DEVICE);
        }
        check_options(options)?;

        let diagnostics: Vec<String> = obj
            .source
            .lines()
            .filter_map(|line| line.trim_start().strip_prefix("#error"))
            .map(|message| format!("error: {}", message.trim()))
            .collect();
        let log = diagnostics.join("\n");
        for device in targets {
            obj.logs.insert(device, log.clone());
        }
        let outcome = if diagnostics.is_empty() {
            obj.kernels = Some(parse_kernels(&obj.source));
            Ok(())
        } else {
            obj.kernels = None;
            Err(Status::BUILD_PROGRAM_FAILURE)
        };

        match notify {
            Some(notify) => {
                std::thread::spawn(move || notify(program));
                Ok(())
            }
            None => outcome,
        }
    }

    fn program_build_log(&self, program: ProgramId, device: DeviceId) -> NativeResult<String> {
        let st = self.state.lock();
        let obj = live(&st.programs, program.0, ResourceKind::Program)?;
        let context = live(&st.contexts, obj.context, ResourceKind::Context)?;
        if !context.devices.contains(&device) {
            return Err(Status::INVALID_DEVICE);
        }
        Ok(obj.logs.get(&device).cloned().unwrap_or_default())
    }

    fn create_kernel(&self, program: ProgramId, name: &str) -> NativeResult<KernelId> {
        let mut st = self.state.lock();
        let obj = live(&st.programs, program.0, ResourceKind::Program)?;
        let arity = obj
            .kernels
            .as_ref()
            .ok_or(Status::INVALID_PROGRAM_EXECUTABLE)?
            .iter()
            .find(|(kernel, _)| kernel == name)
            .map(|(_, arity)| *arity)
            .ok_or(Status::INVALID_KERNEL_NAME)?;
        let context = obj.context;
        let id = st.alloc();
        st.kernels.insert(
            id,
            Entry::new(KernelObj {
                context,
                name: name.to_owned(),
                args: vec![None; arity],
            }),
        );
        Ok(KernelId(id))
    }

    fn set_kernel_arg(&self, kernel: KernelId, index: u32, arg: &KernelArg) -> NativeResult<()> {
        let mut st = self.state.lock();
        let st = &mut *st;
        let obj = live_mut(&mut st.kernels, kernel.0, ResourceKind::Kernel)?;
        let slot = usize::try_from(index)
            .ok()
            .and_then(|i| obj.args.get_mut(i))
            .ok_or(Status::INVALID_ARG_INDEX)?;
        match arg {
            KernelArg::Mem(mem) => {
                let mem = live(&st.mems, mem.0, ResourceKind::Memory)?;
                if mem.context != obj.context {
                    return Err(Status::INVALID_MEM_OBJECT);
                }
            }
            KernelArg::Scalar(bytes) if bytes.is_empty() => return Err(Status::INVALID_ARG_SIZE),
            KernelArg::Local(0) => return Err(Status::INVALID_ARG_SIZE),
            KernelArg::Scalar(_) | KernelArg::Local(_) => {}
        }
        *slot = Some(arg.clone());
        Ok(())
    }

    fn create_user_event(&self, context: ContextId) -> NativeResult<EventId> {
        let mut st = self.state.lock();
        live(&st.contexts, context.0, ResourceKind::Context)?;
        let id = st.alloc();
        st.events
            .insert(id, Entry::new(EventObj::new(ExecutionStatus::Submitted, true)));
        Ok(EventId(id))
    }

    fn retain_context(&self, id: ContextId) -> NativeResult<()> {
        self.retain(ResourceKind::Context, id.0)
    }

    fn retain_command_queue(&self, id: QueueId) -> NativeResult<()> {
        self.retain(ResourceKind::CommandQueue, id.0)
    }

    fn retain_device(&self, id: DeviceId) -> NativeResult<()> {
        self.retain(ResourceKind::Device, id.0)
    }

    fn retain_event(&self, id: EventId) -> NativeResult<()> {
        self.retain(ResourceKind::Event, id.0)
    }

    fn retain_kernel(&self, id: KernelId) -> NativeResult<()> {
        self.retain(ResourceKind::Kernel, id.0)
    }

    fn retain_mem(&self, id: MemId) -> NativeResult<()> {
        self.retain(ResourceKind::Memory, id.0)
    }

    fn retain_program(&self, id: ProgramId) -> NativeResult<()> {
        self.retain(ResourceKind::Program, id.0)
    }

    fn release_context(&self, id: ContextId) -> NativeResult<()> {
        self.release(ResourceKind::Context, id.0)
    }

    fn release_command_queue(&self, id: QueueId) -> NativeResult<()> {
        self.release(ResourceKind::CommandQueue, id.0)
    }

    fn release_device(&self, id: DeviceId) -> NativeResult<()> {
        self.release(ResourceKind::Device, id.0)
    }

    fn release_event(&self, id: EventId) -> NativeResult<()> {
        self.release(ResourceKind::Event, id.0)
    }

    fn release_kernel(&self, id: KernelId) -> NativeResult<()> {
        self.release(ResourceKind::Kernel, id.0)
    }

    fn release_mem(&self, id: MemId) -> NativeResult<()> {
        self.release(ResourceKind::Memory, id.0)
    }

    fn release_program(&self, id: ProgramId) -> NativeResult<()> {
        self.release(ResourceKind::Program, id.0)
    }

    fn event_status(&self, event: EventId) -> NativeResult<ExecutionStatus> {
        let st = self.state.lock();
        Ok(live(&st.events, event.0, ResourceKind::Event)?.status)
    }

    fn set_user_event_status(&self, event: EventId, status: ExecutionStatus) -> NativeResult<()> {
        let mut st = self.state.lock();
        let obj = live(&st.events, event.0, ResourceKind::Event)?;
        if !obj.user {
            return Err(Status::INVALID_EVENT);
        }
        if !status.is_terminal() {
            return Err(Status::INVALID_VALUE);
        }
        if obj.status.is_terminal() {
            return Err(Status::INVALID_OPERATION);
        }
        let mut fired = Vec::new();
        st.settle(event.0, status, &mut fired);
        self.commit(st, fired);
        Ok(())
    }

    fn wait_for_events(&self, events: &[EventId]) -> NativeResult<()> {
        if events.is_empty() {
            return Err(Status::INVALID_VALUE);
        }
        let raw: Vec<usize> = events.iter().map(|e| e.0).collect();
        {
            let mut st = self.state.lock();
            for event in events {
                live(&st.events, event.0, ResourceKind::Event)?;
            }
            st.hold(&raw);
        }
        self.await_held(&raw)
    }

    fn set_event_callback(
        &self,
        event: EventId,
        status: ExecutionStatus,
        callback: EventCallback,
    ) -> NativeResult<()> {
        if !matches!(
            status,
            ExecutionStatus::Submitted | ExecutionStatus::Running | ExecutionStatus::Complete
        ) {
            return Err(Status::INVALID_VALUE);
        }
        let mut st = self.state.lock();
        let obj = live_mut(&mut st.events, event.0, ResourceKind::Event)?;
        let current = obj.status;
        if current.has_reached(status) {
            drop(st);
            deliver(vec![Fired {
                callback,
                event,
                status: current,
            }]);
        } else {
            obj.callbacks.push((status, callback));
        }
        Ok(())
    }

    fn enqueue_nd_range_kernel(
        &self,
        queue: QueueId,
        kernel: KernelId,
        work: &WorkSize,
        wait: &[EventId],
        want_event: bool,
    ) -> NativeResult<Option<EventId>> {
        let mut st = self.state.lock();
        let context = st.queue_context(queue)?;
        let device = live(&st.queues, queue.0, ResourceKind::CommandQueue)?.device;
        let obj = live(&st.kernels, kernel.0, ResourceKind::Kernel)?;
        if obj.context != context {
            return Err(Status::INVALID_CONTEXT);
        }
        let args: Vec<KernelArg> = obj
            .args
            .iter()
            .cloned()
            .collect::<Option<_>>()
            .ok_or(Status::INVALID_KERNEL_ARGS)?;
        let name = obj.name.clone();
        if work.global().contains(&0) {
            return Err(Status::INVALID_GLOBAL_WORK_SIZE);
        }
        let max_group = st
            .devices
            .get(&device)
            .map_or(0, |info| info.max_work_group_size);
        if work.local().contains(&0) || work.local().iter().product::<usize>() > max_group {
            return Err(Status::INVALID_WORK_GROUP_SIZE);
        }
        st.check_wait(wait)?;
        st.launches.push(LaunchRecord {
            queue,
            kernel: name.clone(),
            work: *work,
            args: args.clone(),
        });
        let event = st.enqueue(
            queue,
            wait,
            Order::Command,
            want_event,
            Action::Kernel {
                name,
                args,
                work: *work,
            },
        )?;
        self.submit(st, event, false, want_event)
    }

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
    ) -> NativeResult<Option<EventId>> {
        let mut st = self.state.lock();
        let context = st.queue_context(queue)?;
        let size = st.mem_in(mem, context)?;
        if offset.checked_add(len).map_or(true, |end| end > size) || dst.is_null() {
            return Err(Status::INVALID_VALUE);
        }
        let action = Action::Read {
            mem: mem.0,
            offset,
            dst: HostPtr(dst),
            len,
        };
        let event = st.enqueue(queue, wait, Order::Command, want_event, action)?;
        self.submit(st, event, blocking, want_event)
    }

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
    ) -> NativeResult<Option<EventId>> {
        let mut st = self.state.lock();
        let context = st.queue_context(queue)?;
        let size = st.mem_in(mem, context)?;
        if offset.checked_add(len).map_or(true, |end| end > size) || src.is_null() {
            return Err(Status::INVALID_VALUE);
        }
        // SAFETY: the caller guarantees `src` is valid for `len` byte reads.
        let data = unsafe { std::slice::from_raw_parts(src, len) }.to_vec();
        let action = Action::Write {
            mem: mem.0,
            offset,
            data,
        };
        let event = st.enqueue(queue, wait, Order::Command, want_event, action)?;
        self.submit(st, event, blocking, want_event)
    }

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
    ) -> NativeResult<(*mut u8, Option<EventId>)> {
        let mut st = self.state.lock();
        let context = st.queue_context(queue)?;
        let total = st.mem_in(mem, context)?;
        if size == 0 || access.is_empty() || offset.checked_add(size).map_or(true, |end| end > total) {
            return Err(Status::INVALID_VALUE);
        }
        st.check_wait(wait)?;
        let shadow = Shadow::new(size);
        let ptr = shadow.ptr;
        let key = ptr as usize;
        st.mappings.insert(
            key,
            Mapping {
                mem: mem.0,
                offset,
                access,
                shadow,
            },
        );
        let event = match st.enqueue(queue, wait, Order::Command, want_event, Action::Map { key }) {
            Ok(event) => event,
            Err(status) => {
                st.mappings.remove(&key);
                return Err(status);
            }
        };
        let event = self.submit(st, event, blocking, want_event)?;
        Ok((ptr, event))
    }

    unsafe fn enqueue_unmap(
        &self,
        queue: QueueId,
        mem: MemId,
        ptr: *mut u8,
        wait: &[EventId],
        want_event: bool,
    ) -> NativeResult<Option<EventId>> {
        let mut st = self.state.lock();
        st.queue_context(queue)?;
        let key = ptr as usize;
        if st.mappings.get(&key).map_or(true, |m| m.mem != mem.0) {
            return Err(Status::INVALID_VALUE);
        }
        let event = st.enqueue(queue, wait, Order::Command, want_event, Action::Unmap { key })?;
        self.submit(st, event, false, want_event)
    }

    fn enqueue_marker(
        &self,
        queue: QueueId,
        wait: &[EventId],
        want_event: bool,
    ) -> NativeResult<Option<EventId>> {
        self.enqueue_sync(queue, wait, Order::Marker, want_event)
    }

    fn enqueue_barrier(
        &self,
        queue: QueueId,
        wait: &[EventId],
        want_event: bool,
    ) -> NativeResult<Option<EventId>> {
        self.enqueue_sync(queue, wait, Order::Barrier, want_event)
    }

    fn flush(&self, queue: QueueId) -> NativeResult<()> {
        let st = self.state.lock();
        st.queue_context(queue)?;
        self.commit(st, Vec::new());
        Ok(())
    }

    fn finish(&self, queue: QueueId) -> NativeResult<()> {
        let st = self.state.lock();
        st.queue_context(queue)?;
        self.commit(st, Vec::new());
        let mut st = self.state.lock();
        while st.pending.iter().any(|c| c.queue == queue.0) {
            self.changed.wait(&mut st);
        }
        Ok(())
    }
}
