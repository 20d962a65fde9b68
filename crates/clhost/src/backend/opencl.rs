//! [`Driver`] over a system OpenCL ICD loader.
//!
//! Raw ids are the native handle addresses. Every call forwards to the
//! matching `cl*` entry point and returns its status untouched; callbacks are
//! boxed and passed as user data to `extern "C"` trampolines.

use crate::driver::{
    BuildCallback, ContextId, DeviceId, DeviceInfo, Driver, EventCallback, EventId, KernelArg,
    KernelId, MemId, PlatformId, ProgramId, QueueId,
};
use crate::error::{ClError, Result};
use crate::flags::{DeviceType, MapAccess, MemFlags, QueueProperties};
use crate::status::{check, ExecutionStatus, NativeResult, Status};
use crate::work::WorkSize;
use opencl_sys::{
    cl_bool, cl_buffer_region, cl_command_queue, cl_device_id, cl_device_info, cl_device_type,
    cl_event, cl_int, cl_mem, cl_platform_id, cl_program, cl_uint, cl_ulong, clBuildProgram,
    clCreateBuffer, clCreateCommandQueue, clCreateContext, clCreateKernel,
    clCreateProgramWithSource, clCreateSubBuffer, clCreateUserEvent, clEnqueueBarrierWithWaitList,
    clEnqueueMapBuffer, clEnqueueMarkerWithWaitList, clEnqueueNDRangeKernel, clEnqueueReadBuffer,
    clEnqueueUnmapMemObject, clEnqueueWriteBuffer, clFinish, clFlush, clGetDeviceIDs,
    clGetDeviceInfo, clGetEventInfo, clGetPlatformIDs, clGetPlatformInfo, clGetProgramBuildInfo,
    clReleaseCommandQueue, clReleaseContext, clReleaseDevice, clReleaseEvent, clReleaseKernel,
    clReleaseMemObject, clReleaseProgram, clRetainCommandQueue, clRetainContext, clRetainDevice,
    clRetainEvent, clRetainKernel, clRetainMemObject, clRetainProgram, clSetEventCallback,
    clSetKernelArg, clSetUserEventStatus, clWaitForEvents, CL_BUFFER_CREATE_TYPE_REGION,
    CL_DEVICE_MAX_COMPUTE_UNITS, CL_DEVICE_MAX_WORK_GROUP_SIZE, CL_DEVICE_NAME, CL_DEVICE_TYPE,
    CL_DEVICE_VENDOR, CL_EVENT_COMMAND_EXECUTION_STATUS, CL_MEM_COPY_HOST_PTR, CL_PLATFORM_NAME,
    CL_PROGRAM_BUILD_LOG,
};
use std::ffi::{c_char, c_void, CString};
use std::mem::size_of;
use std::ptr;

/// Returned by loaders that find no installed platform.
const PLATFORM_NOT_FOUND: Status = Status(-1001);

/// Stateless; every handle lives in the native layer.
#[derive(Debug, Default)]
pub struct OpenClDriver;

impl OpenClDriver {
    /// Connects to the loader and checks that it reports a platform.
    ///
    /// # Errors
    ///
    /// [`ClError::BackendUnavailable`] when no platform is installed,
    /// otherwise the native status of the enumeration.
    pub fn try_new() -> Result<Self> {
        let driver = Self;
        match driver.platform_ids() {
            Ok(ids) if !ids.is_empty() => Ok(driver),
            Ok(_) | Err(PLATFORM_NOT_FOUND) => Err(ClError::BackendUnavailable),
            Err(status) => Err(status.into()),
        }
    }
}

fn handle<T>(raw: usize) -> *mut T {
    raw as *mut T
}

fn addr<T>(ptr: *mut T) -> usize {
    ptr as usize
}

fn ok(code: cl_int) -> NativeResult<()> {
    check(code, ())
}

fn count(len: usize) -> NativeResult<cl_uint> {
    cl_uint::try_from(len).map_err(|_| Status::INVALID_VALUE)
}

/// Native wait list, kept alive for the duration of a call.
struct WaitList(Vec<cl_event>);

impl WaitList {
    fn new(events: &[EventId]) -> Self {
        Self(events.iter().map(|e| handle(e.0)).collect())
    }

    fn len(&self) -> NativeResult<cl_uint> {
        cl_uint::try_from(self.0.len()).map_err(|_| Status::INVALID_EVENT_WAIT_LIST)
    }

    fn as_ptr(&self) -> *const cl_event {
        if self.0.is_empty() {
            ptr::null()
        } else {
            self.0.as_ptr()
        }
    }
}

/// Output slot for the event a command may create.
struct EventOut {
    want: bool,
    event: cl_event,
}

impl EventOut {
    fn new(want: bool) -> Self {
        Self {
            want,
            event: ptr::null_mut(),
        }
    }

    fn as_mut_ptr(&mut self) -> *mut cl_event {
        if self.want {
            &mut self.event
        } else {
            ptr::null_mut()
        }
    }

    fn finish(self, code: cl_int) -> NativeResult<Option<EventId>> {
        ok(code)?;
        Ok(self.want.then(|| EventId(addr(self.event))))
    }
}

/// Runs a two-step `clGet*Info` string query: size first, then contents.
fn info_string(
    mut query: impl FnMut(usize, *mut c_void, *mut usize) -> cl_int,
) -> NativeResult<String> {
    let mut len = 0usize;
    ok(query(0, ptr::null_mut(), &mut len))?;
    let mut bytes = vec![0u8; len];
    ok(query(len, bytes.as_mut_ptr().cast(), ptr::null_mut()))?;
    while bytes.last() == Some(&0) {
        bytes.pop();
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn info_value<T: Default>(
    mut query: impl FnMut(usize, *mut c_void, *mut usize) -> cl_int,
) -> NativeResult<T> {
    let mut value = T::default();
    ok(query(
        size_of::<T>(),
        ptr::addr_of_mut!(value).cast(),
        ptr::null_mut(),
    ))?;
    Ok(value)
}

extern "C" fn event_trampoline(event: cl_event, status: cl_int, user_data: *mut c_void) {
    // SAFETY: `user_data` is the box leaked by `set_event_callback`, and the
    // loader invokes each registration once.
    let callback = unsafe { Box::from_raw(user_data.cast::<EventCallback>()) };
    let status = ExecutionStatus::from_code(status).unwrap_or(ExecutionStatus::Error(status));
    callback(EventId(addr(event)), status);
}

extern "C" fn build_trampoline(program: cl_program, user_data: *mut c_void) {
    // SAFETY: `user_data` is the box leaked by `build_program`.
    let callback = unsafe { Box::from_raw(user_data.cast::<BuildCallback>()) };
    callback(ProgramId(addr(program)));
}

macro_rules! refcount {
    ($($retain:ident / $release:ident ($id:ty) => $cl_retain:ident / $cl_release:ident;)+) => {
        $(
            fn $retain(&self, id: $id) -> NativeResult<()> {
                // SAFETY: the loader validates the handle.
                ok(unsafe { $cl_retain(handle(id.0)) })
            }

            fn $release(&self, id: $id) -> NativeResult<()> {
                // SAFETY: as above.
                ok(unsafe { $cl_release(handle(id.0)) })
            }
        )+
    };
}

#[allow(deprecated)]
impl Driver for OpenClDriver {
    fn name(&self) -> &str {
        "opencl"
    }

    fn platform_ids(&self) -> NativeResult<Vec<PlatformId>> {
        let mut n: cl_uint = 0;
        // SAFETY: count query with no output array.
        ok(unsafe { clGetPlatformIDs(0, ptr::null_mut(), &mut n) })?;
        let mut ids: Vec<cl_platform_id> = vec![ptr::null_mut(); n as usize];
        // SAFETY: `ids` holds `n` slots.
        ok(unsafe { clGetPlatformIDs(n, ids.as_mut_ptr(), ptr::null_mut()) })?;
        Ok(ids.into_iter().map(|id| PlatformId(addr(id))).collect())
    }

    fn platform_name(&self, platform: PlatformId) -> NativeResult<String> {
        info_string(|size, value, ret| {
            // SAFETY: `value` is null or holds `size` bytes.
            unsafe { clGetPlatformInfo(handle(platform.0), CL_PLATFORM_NAME, size, value, ret) }
        })
    }

    fn device_ids(&self, platform: PlatformId, kind: DeviceType) -> NativeResult<Vec<DeviceId>> {
        let platform: cl_platform_id = handle(platform.0);
        let kind: cl_device_type = kind.code();
        let mut n: cl_uint = 0;
        // SAFETY: count query with no output array.
        ok(unsafe { clGetDeviceIDs(platform, kind, 0, ptr::null_mut(), &mut n) })?;
        let mut ids: Vec<cl_device_id> = vec![ptr::null_mut(); n as usize];
        // SAFETY: `ids` holds `n` slots.
        ok(unsafe { clGetDeviceIDs(platform, kind, n, ids.as_mut_ptr(), ptr::null_mut()) })?;
        Ok(ids.into_iter().map(|id| DeviceId(addr(id))).collect())
    }

    fn device_info(&self, device: DeviceId) -> NativeResult<DeviceInfo> {
        let device: cl_device_id = handle(device.0);
        let query = |param: cl_device_info| {
            move |size: usize, value: *mut c_void, ret: *mut usize| {
                // SAFETY: `value` is null or holds `size` bytes.
                unsafe { clGetDeviceInfo(device, param, size, value, ret) }
            }
        };
        let kind: cl_ulong = info_value(query(CL_DEVICE_TYPE))?;
        Ok(DeviceInfo {
            name: info_string(query(CL_DEVICE_NAME))?,
            vendor: info_string(query(CL_DEVICE_VENDOR))?,
            // Devices may report the default bit alongside their category.
            kind: DeviceType::from_code(kind & !DeviceType::Default.code())
                .or_else(|| DeviceType::from_code(kind))
                .unwrap_or(DeviceType::Custom),
            compute_units: info_value::<cl_uint>(query(CL_DEVICE_MAX_COMPUTE_UNITS))?,
            max_work_group_size: info_value::<usize>(query(CL_DEVICE_MAX_WORK_GROUP_SIZE))?,
        })
    }

    fn create_context(&self, devices: &[DeviceId]) -> NativeResult<ContextId> {
        let ids: Vec<cl_device_id> = devices.iter().map(|d| handle(d.0)).collect();
        let mut code = 0;
        // SAFETY: `ids` outlives the call; no notify callback is installed.
        let context = unsafe {
            clCreateContext(
                ptr::null(),
                count(ids.len())?,
                ids.as_ptr(),
                None,
                ptr::null_mut(),
                &mut code,
            )
        };
        check(code, ContextId(addr(context)))
    }

    fn create_command_queue(
        &self,
        context: ContextId,
        device: DeviceId,
        properties: QueueProperties,
    ) -> NativeResult<QueueId> {
        let mut code = 0;
        // SAFETY: plain handle arguments.
        let queue: cl_command_queue = unsafe {
            clCreateCommandQueue(
                handle(context.0),
                handle(device.0),
                properties.bits(),
                &mut code,
            )
        };
        check(code, QueueId(addr(queue)))
    }

    fn create_buffer(
        &self,
        context: ContextId,
        flags: MemFlags,
        size: usize,
        host: Option<&[u8]>,
    ) -> NativeResult<MemId> {
        let (bits, host_ptr) = match host {
            Some(data) => (
                flags.bits() | CL_MEM_COPY_HOST_PTR,
                data.as_ptr().cast::<c_void>().cast_mut(),
            ),
            None => (flags.bits(), ptr::null_mut()),
        };
        let mut code = 0;
        // SAFETY: with COPY_HOST_PTR the loader copies `size` bytes from
        // `host_ptr` before returning.
        let mem: cl_mem =
            unsafe { clCreateBuffer(handle(context.0), bits, size, host_ptr, &mut code) };
        check(code, MemId(addr(mem)))
    }

    fn create_sub_buffer(
        &self,
        parent: MemId,
        flags: MemFlags,
        origin: usize,
        size: usize,
    ) -> NativeResult<MemId> {
        let region = cl_buffer_region { origin, size };
        let mut code = 0;
        // SAFETY: `region` outlives the call.
        let mem: cl_mem = unsafe {
            clCreateSubBuffer(
                handle(parent.0),
                flags.bits(),
                CL_BUFFER_CREATE_TYPE_REGION,
                ptr::addr_of!(region).cast(),
                &mut code,
            )
        };
        check(code, MemId(addr(mem)))
    }

    fn create_program_with_source(
        &self,
        context: ContextId,
        sources: &[&str],
    ) -> NativeResult<ProgramId> {
        let strings: Vec<*const c_char> = sources.iter().map(|s| s.as_ptr().cast()).collect();
        let lengths: Vec<usize> = sources.iter().map(|s| s.len()).collect();
        let mut code = 0;
        // SAFETY: explicit lengths, so the sources need no terminator.
        let program: cl_program = unsafe {
            clCreateProgramWithSource(
                handle(context.0),
                count(strings.len())?,
                strings.as_ptr(),
                lengths.as_ptr(),
                &mut code,
            )
        };
        check(code, ProgramId(addr(program)))
    }

    fn build_program(
        &self,
        program: ProgramId,
        devices: &[DeviceId],
        options: &str,
        notify: Option<BuildCallback>,
    ) -> NativeResult<()> {
        let options = CString::new(options).map_err(|_| Status::INVALID_BUILD_OPTIONS)?;
        let ids: Vec<cl_device_id> = devices.iter().map(|d| handle(d.0)).collect();
        let trampoline = notify
            .is_some()
            .then_some(build_trampoline as extern "C" fn(cl_program, *mut c_void));
        let user_data = notify.map_or(ptr::null_mut(), |callback| {
            Box::into_raw(Box::new(callback)).cast::<c_void>()
        });
        // SAFETY: `ids` and `options` outlive the call. A failed call may
        // still have scheduled the trampoline, so its box is not reclaimed.
        ok(unsafe {
            clBuildProgram(
                handle(program.0),
                count(ids.len())?,
                if ids.is_empty() { ptr::null() } else { ids.as_ptr() },
                options.as_ptr(),
                trampoline.map(|f| f as _),
                user_data,
            )
        })
    }

    fn program_build_log(&self, program: ProgramId, device: DeviceId) -> NativeResult<String> {
        info_string(|size, value, ret| {
            // SAFETY: `value` is null or holds `size` bytes.
            unsafe {
                clGetProgramBuildInfo(
                    handle(program.0),
                    handle(device.0),
                    CL_PROGRAM_BUILD_LOG,
                    size,
                    value,
                    ret,
                )
            }
        })
    }

    fn create_kernel(&self, program: ProgramId, name: &str) -> NativeResult<KernelId> {
        let name = CString::new(name).map_err(|_| Status::INVALID_KERNEL_NAME)?;
        let mut code = 0;
        // SAFETY: `name` is nul-terminated and outlives the call.
        let kernel = unsafe { clCreateKernel(handle(program.0), name.as_ptr(), &mut code) };
        check(code, KernelId(addr(kernel)))
    }

    fn set_kernel_arg(&self, kernel: KernelId, index: u32, arg: &KernelArg) -> NativeResult<()> {
        let kernel = handle(kernel.0);
        match arg {
            KernelArg::Mem(mem) => {
                let mem: cl_mem = handle(mem.0);
                // SAFETY: the value is the handle itself, read during the call.
                ok(unsafe {
                    clSetKernelArg(kernel, index, size_of::<cl_mem>(), ptr::addr_of!(mem).cast())
                })
            }
            KernelArg::Scalar(bytes) => {
                // SAFETY: `bytes` is read during the call.
                ok(unsafe { clSetKernelArg(kernel, index, bytes.len(), bytes.as_ptr().cast()) })
            }
            KernelArg::Local(size) => {
                // SAFETY: a null value requests local memory of `size` bytes.
                ok(unsafe { clSetKernelArg(kernel, index, *size, ptr::null()) })
            }
        }
    }

    fn create_user_event(&self, context: ContextId) -> NativeResult<EventId> {
        let mut code = 0;
        // SAFETY: plain handle argument.
        let event = unsafe { clCreateUserEvent(handle(context.0), &mut code) };
        check(code, EventId(addr(event)))
    }

    refcount! {
        retain_context / release_context (ContextId) => clRetainContext / clReleaseContext;
        retain_command_queue / release_command_queue (QueueId) => clRetainCommandQueue / clReleaseCommandQueue;
        retain_device / release_device (DeviceId) => clRetainDevice / clReleaseDevice;
        retain_event / release_event (EventId) => clRetainEvent / clReleaseEvent;
        retain_kernel / release_kernel (KernelId) => clRetainKernel / clReleaseKernel;
        retain_mem / release_mem (MemId) => clRetainMemObject / clReleaseMemObject;
        retain_program / release_program (ProgramId) => clRetainProgram / clReleaseProgram;
    }

    fn event_status(&self, event: EventId) -> NativeResult<ExecutionStatus> {
        let code: cl_int = info_value(|size, value, ret| {
            // SAFETY: `value` holds `size` bytes.
            unsafe {
                clGetEventInfo(
                    handle(event.0),
                    CL_EVENT_COMMAND_EXECUTION_STATUS,
                    size,
                    value,
                    ret,
                )
            }
        })?;
        ExecutionStatus::from_code(code).ok_or(Status::INVALID_VALUE)
    }

    fn set_user_event_status(&self, event: EventId, status: ExecutionStatus) -> NativeResult<()> {
        // SAFETY: plain handle argument.
        ok(unsafe { clSetUserEventStatus(handle(event.0), status.code()) })
    }

    fn wait_for_events(&self, events: &[EventId]) -> NativeResult<()> {
        let list = WaitList::new(events);
        // SAFETY: `list` outlives the call.
        ok(unsafe { clWaitForEvents(list.len()?, list.as_ptr()) })
    }

    fn set_event_callback(
        &self,
        event: EventId,
        status: ExecutionStatus,
        callback: EventCallback,
    ) -> NativeResult<()> {
        let user_data = Box::into_raw(Box::new(callback));
        // SAFETY: on success the loader hands `user_data` to the trampoline
        // exactly once.
        let code = unsafe {
            clSetEventCallback(
                handle(event.0),
                status.code(),
                Some(event_trampoline as extern "C" fn(cl_event, cl_int, *mut c_void) as _),
                user_data.cast(),
            )
        };
        if code != Status::SUCCESS.code() {
            // SAFETY: the registration was refused, so the box is still ours.
            drop(unsafe { Box::from_raw(user_data) });
        }
        ok(code)
    }

    fn enqueue_nd_range_kernel(
        &self,
        queue: QueueId,
        kernel: KernelId,
        work: &WorkSize,
        wait: &[EventId],
        want_event: bool,
    ) -> NativeResult<Option<EventId>> {
        let list = WaitList::new(wait);
        let mut out = EventOut::new(want_event);
        let offset = work.offset().map_or(ptr::null(), <[usize]>::as_ptr);
        // SAFETY: the geometry slices and `list` outlive the call.
        let code = unsafe {
            clEnqueueNDRangeKernel(
                handle(queue.0),
                handle(kernel.0),
                count(work.dims())?,
                offset,
                work.global().as_ptr(),
                work.local().as_ptr(),
                list.len()?,
                list.as_ptr(),
                out.as_mut_ptr(),
            )
        };
        out.finish(code)
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
        let list = WaitList::new(wait);
        let mut out = EventOut::new(want_event);
        let code = clEnqueueReadBuffer(
            handle(queue.0),
            handle(mem.0),
            cl_bool::from(blocking),
            offset,
            len,
            dst.cast(),
            list.len()?,
            list.as_ptr(),
            out.as_mut_ptr(),
        );
        out.finish(code)
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
        let list = WaitList::new(wait);
        let mut out = EventOut::new(want_event);
        let code = clEnqueueWriteBuffer(
            handle(queue.0),
            handle(mem.0),
            cl_bool::from(blocking),
            offset,
            len,
            src.cast(),
            list.len()?,
            list.as_ptr(),
            out.as_mut_ptr(),
        );
        out.finish(code)
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
        let list = WaitList::new(wait);
        let mut out = EventOut::new(want_event);
        let mut code = 0;
        // SAFETY: `list` outlives the call; the returned region is owned by
        // the loader until unmapped.
        let region = unsafe {
            clEnqueueMapBuffer(
                handle(queue.0),
                handle(mem.0),
                cl_bool::from(blocking),
                access.bits(),
                offset,
                size,
                list.len()?,
                list.as_ptr(),
                out.as_mut_ptr(),
                &mut code,
            )
        };
        let event = out.finish(code)?;
        Ok((region.cast(), event))
    }

    unsafe fn enqueue_unmap(
        &self,
        queue: QueueId,
        mem: MemId,
        ptr: *mut u8,
        wait: &[EventId],
        want_event: bool,
    ) -> NativeResult<Option<EventId>> {
        let list = WaitList::new(wait);
        let mut out = EventOut::new(want_event);
        let code = clEnqueueUnmapMemObject(
            handle(queue.0),
            handle(mem.0),
            ptr.cast(),
            list.len()?,
            list.as_ptr(),
            out.as_mut_ptr(),
        );
        out.finish(code)
    }

    fn enqueue_marker(
        &self,
        queue: QueueId,
        wait: &[EventId],
        want_event: bool,
    ) -> NativeResult<Option<EventId>> {
        let list = WaitList::new(wait);
        let mut out = EventOut::new(want_event);
        // SAFETY: `list` outlives the call.
        let code = unsafe {
            clEnqueueMarkerWithWaitList(
                handle(queue.0),
                list.len()?,
                list.as_ptr(),
                out.as_mut_ptr(),
            )
        };
        out.finish(code)
    }

    fn enqueue_barrier(
        &self,
        queue: QueueId,
        wait: &[EventId],
        want_event: bool,
    ) -> NativeResult<Option<EventId>> {
        let list = WaitList::new(wait);
        let mut out = EventOut::new(want_event);
        // SAFETY: `list` outlives the call.
        let code = unsafe {
            clEnqueueBarrierWithWaitList(
                handle(queue.0),
                list.len()?,
                list.as_ptr(),
                out.as_mut_ptr(),
            )
        };
        out.finish(code)
    }

    fn flush(&self, queue: QueueId) -> NativeResult<()> {
        // SAFETY: plain handle argument.
        ok(unsafe { clFlush(handle(queue.0)) })
    }

    fn finish(&self, queue: QueueId) -> NativeResult<()> {
        // SAFETY: plain handle argument.
        ok(unsafe { clFinish(handle(queue.0)) })
    }
}
