//! Command enqueue protocol.
//!
//! Every operation takes a wait-list of upstream events (empty for none
//! beyond queue order) and an optional slot that receives the event tracking
//! the new command. Operations return the queue so calls chain with `?`.

use crate::driver::{EventId, MemId, ResourceKind};
use crate::error::{ClError, Result};
use crate::flags::MapAccess;
use crate::resource::{ids, Buffer, CommandQueue, Event, Kernel};
use crate::status::Status;
use crate::work::WorkSize;

/// Where an enqueue stores the event of the command it submits.
pub type EventSlot<'a> = Option<&'a mut Option<Event>>;

impl CommandQueue {
    fn deliver(&self, raw: Option<EventId>, slot: EventSlot<'_>) {
        if let (Some(id), Some(slot)) = (raw, slot) {
            *slot = Some(Event::from_raw(id, &self.driver));
        }
    }

    fn check_range(buffer: &Buffer, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= buffer.size() => Ok(()),
            _ => Err(ClError::invalid(format!(
                "range {offset}+{len} exceeds buffer of {} bytes",
                buffer.size()
            ))),
        }
    }

    /// Submits `kernel` over `work`. The kernel's arguments must already be
    /// bound; geometry is passed to the driver unchanged.
    ///
    /// # Errors
    ///
    /// Returns the native status, e.g. `INVALID_KERNEL_ARGS`.
    pub fn launch(
        &self,
        kernel: &Kernel,
        work: &WorkSize,
        wait: &[Event],
        done: EventSlot<'_>,
    ) -> Result<&Self> {
        tracing::debug!(
            queue = self.id.0,
            kernel = kernel.name(),
            global = ?work.global(),
            local = ?work.local(),
            "launch"
        );
        let raw = self.driver.enqueue_nd_range_kernel(
            self.id,
            kernel.id,
            work,
            &ids(wait),
            done.is_some(),
        )?;
        self.deliver(raw, done);
        Ok(self)
    }

    /// Reads `dst.len()` elements starting at byte `offset` and returns once
    /// they have arrived.
    ///
    /// # Errors
    ///
    /// Fails with [`ClError::InvalidArgument`] if the range exceeds the
    /// buffer, otherwise with the native status.
    pub fn read<T: bytemuck::Pod>(
        &self,
        buffer: &Buffer,
        offset: usize,
        dst: &mut [T],
        wait: &[Event],
        done: EventSlot<'_>,
    ) -> Result<&Self> {
        // SAFETY: blocking, so `dst` is only written before this call returns.
        unsafe { self.read_raw(buffer, offset, dst, true, wait, done) }
    }

    /// Starts a read and returns immediately; completion is observed through
    /// the `done` event, a later blocking command, or [`CommandQueue::finish`].
    ///
    /// # Errors
    ///
    /// As [`CommandQueue::read`].
    ///
    /// # Safety
    ///
    /// `dst` must stay alive, unmoved, and otherwise untouched until the read
    /// completes.
    pub unsafe fn read_nonblocking<T: bytemuck::Pod>(
        &self,
        buffer: &Buffer,
        offset: usize,
        dst: &mut [T],
        wait: &[Event],
        done: EventSlot<'_>,
    ) -> Result<&Self> {
        self.read_raw(buffer, offset, dst, false, wait, done)
    }

    unsafe fn read_raw<T: bytemuck::Pod>(
        &self,
        buffer: &Buffer,
        offset: usize,
        dst: &mut [T],
        blocking: bool,
        wait: &[Event],
        done: EventSlot<'_>,
    ) -> Result<&Self> {
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(dst);
        Self::check_range(buffer, offset, bytes.len())?;
        tracing::debug!(queue = self.id.0, mem = buffer.id.0, offset, len = bytes.len(), blocking, "read");
        let raw = self.driver.enqueue_read_buffer(
            self.id,
            buffer.id,
            blocking,
            offset,
            bytes.as_mut_ptr(),
            bytes.len(),
            &ids(wait),
            done.is_some(),
        )?;
        self.deliver(raw, done);
        Ok(self)
    }

    /// Writes `src` at byte `offset` and returns once the transfer is done.
    ///
    /// # Errors
    ///
    /// As [`CommandQueue::read`].
    pub fn write<T: bytemuck::Pod>(
        &self,
        buffer: &Buffer,
        offset: usize,
        src: &[T],
        wait: &[Event],
        done: EventSlot<'_>,
    ) -> Result<&Self> {
        // SAFETY: blocking, so `src` is only read before this call returns.
        unsafe { self.write_raw(buffer, offset, src, true, wait, done) }
    }

    /// Starts a write and returns immediately.
    ///
    /// # Errors
    ///
    /// As [`CommandQueue::read`].
    ///
    /// # Safety
    ///
    /// `src` must stay alive and unmodified until the write completes.
    pub unsafe fn write_nonblocking<T: bytemuck::Pod>(
        &self,
        buffer: &Buffer,
        offset: usize,
        src: &[T],
        wait: &[Event],
        done: EventSlot<'_>,
    ) -> Result<&Self> {
        self.write_raw(buffer, offset, src, false, wait, done)
    }

    unsafe fn write_raw<T: bytemuck::Pod>(
        &self,
        buffer: &Buffer,
        offset: usize,
        src: &[T],
        blocking: bool,
        wait: &[Event],
        done: EventSlot<'_>,
    ) -> Result<&Self> {
        let bytes: &[u8] = bytemuck::cast_slice(src);
        Self::check_range(buffer, offset, bytes.len())?;
        tracing::debug!(queue = self.id.0, mem = buffer.id.0, offset, len = bytes.len(), blocking, "write");
        let raw = self.driver.enqueue_write_buffer(
            self.id,
            buffer.id,
            blocking,
            offset,
            bytes.as_ptr(),
            bytes.len(),
            &ids(wait),
            done.is_some(),
        )?;
        self.deliver(raw, done);
        Ok(self)
    }

    /// Reads the whole buffer as elements of `T` once `wait` completes.
    ///
    /// # Errors
    ///
    /// [`ClError::InvalidArgument`] if `T` is zero-sized or the buffer is
    /// not a whole number of `T`s, otherwise as [`CommandQueue::read`].
    pub fn read_into<T: bytemuck::Pod>(&self, buffer: &Buffer, wait: &[Event]) -> Result<Vec<T>> {
        let width = std::mem::size_of::<T>();
        if width == 0 || buffer.size() % width != 0 {
            return Err(ClError::invalid(format!(
                "buffer of {} bytes is not a whole number of {width}-byte elements",
                buffer.size()
            )));
        }
        let mut out = vec![T::zeroed(); buffer.size() / width];
        self.read(buffer, 0, &mut out, wait, None)?;
        Ok(out)
    }

    /// Writes `data` at the start of the buffer and returns once done.
    ///
    /// # Errors
    ///
    /// As [`CommandQueue::write`].
    pub fn write_from<T: bytemuck::Pod>(&self, buffer: &Buffer, data: &[T]) -> Result<&Self> {
        self.write(buffer, 0, data, &[], None)
    }

    /// Maps `size` bytes at `offset` into host memory, blocking until the
    /// view is usable. The view stays valid until passed to
    /// [`CommandQueue::unmap`].
    ///
    /// # Errors
    ///
    /// Fails with [`ClError::InvalidArgument`] if the range exceeds the
    /// buffer or `access` is empty, otherwise with the native status.
    pub fn map(
        &self,
        buffer: &Buffer,
        access: MapAccess,
        offset: usize,
        size: usize,
        wait: &[Event],
        done: EventSlot<'_>,
    ) -> Result<MappedRegion> {
        if access.is_empty() {
            return Err(ClError::invalid("map access must not be empty"));
        }
        Self::check_range(buffer, offset, size)?;
        tracing::debug!(queue = self.id.0, mem = buffer.id.0, offset, size, %access, "map");
        // The region holds its own reference until it is unmapped.
        self.driver.retain_mem(buffer.id)?;
        let mapped = self.driver.enqueue_map_buffer(
            self.id,
            buffer.id,
            true,
            access,
            offset,
            size,
            &ids(wait),
            done.is_some(),
        );
        let (ptr, raw) = match mapped {
            Ok((ptr, raw)) if !ptr.is_null() || size == 0 => (ptr, raw),
            Ok((_, raw)) => {
                return Err(self.abandon_map(buffer.id, raw, Status::MAP_FAILURE.into()));
            }
            Err(status) => return Err(self.abandon_map(buffer.id, None, status.into())),
        };
        self.deliver(raw, done);
        Ok(MappedRegion {
            mem: buffer.id,
            ptr,
            len: size,
            access,
        })
    }

    /// Drops the reference taken by a map that produced no region.
    fn abandon_map(&self, mem: MemId, event: Option<EventId>, original: ClError) -> ClError {
        let mut release = Vec::new();
        if let Some(event) = event {
            if let Err(status) = self.driver.release_event(event) {
                release.push(ClError::release(ResourceKind::Event, status));
            }
        }
        if let Err(status) = self.driver.release_mem(mem) {
            release.push(ClError::release(ResourceKind::Memory, status));
        }
        if release.is_empty() {
            original
        } else {
            ClError::Unwind {
                original: Box::new(original),
                release,
            }
        }
    }

    /// Releases a mapped view. Writes through a `write` mapping become
    /// visible to the device once the unmap completes.
    ///
    /// # Errors
    ///
    /// If the unmap cannot be enqueued the view stays mapped and comes back
    /// in [`UnmapError::region`], ready for another attempt.
    pub fn unmap(
        &self,
        region: MappedRegion,
        wait: &[Event],
        done: EventSlot<'_>,
    ) -> std::result::Result<&Self, UnmapError> {
        tracing::debug!(queue = self.id.0, mem = region.mem.0, "unmap");
        // SAFETY: `region` was produced by `map` and is only consumed once
        // the driver has accepted the unmap.
        let enqueued = unsafe {
            self.driver
                .enqueue_unmap(self.id, region.mem, region.ptr, &ids(wait), done.is_some())
        };
        let raw = match enqueued {
            Ok(raw) => raw,
            Err(status) => {
                return Err(UnmapError {
                    error: status.into(),
                    region: Some(region),
                });
            }
        };
        self.deliver(raw, done);
        self.driver.release_mem(region.mem).map_err(|status| UnmapError {
            error: ClError::release(ResourceKind::Memory, status),
            region: None,
        })?;
        Ok(self)
    }

    /// A synchronisation point that completes once `wait` (or, when empty,
    /// every earlier command) completes. Has no other effect.
    ///
    /// # Errors
    ///
    /// Returns the native status.
    pub fn marker(&self, wait: &[Event], done: EventSlot<'_>) -> Result<&Self> {
        let raw = self
            .driver
            .enqueue_marker(self.id, &ids(wait), done.is_some())?;
        self.deliver(raw, done);
        Ok(self)
    }

    /// No later command in this queue starts until `wait` (or, when empty,
    /// every earlier command) completes.
    ///
    /// # Errors
    ///
    /// Returns the native status.
    pub fn barrier(&self, wait: &[Event], done: EventSlot<'_>) -> Result<&Self> {
        let raw = self
            .driver
            .enqueue_barrier(self.id, &ids(wait), done.is_some())?;
        self.deliver(raw, done);
        Ok(self)
    }

    /// Holds back later commands in this queue until every event in `events`
    /// is complete. An empty list adds no dependency.
    ///
    /// # Errors
    ///
    /// Returns the native status.
    pub fn wait_for(&self, events: &[Event]) -> Result<&Self> {
        if events.is_empty() {
            return Ok(self);
        }
        self.driver.enqueue_barrier(self.id, &ids(events), false)?;
        Ok(self)
    }

    /// Submits everything enqueued so far without waiting.
    ///
    /// # Errors
    ///
    /// Returns the native status.
    pub fn flush(&self) -> Result<&Self> {
        self.driver.flush(self.id)?;
        Ok(self)
    }

    /// Blocks until every command enqueued so far has completed.
    ///
    /// # Errors
    ///
    /// Returns the native status.
    pub fn finish(&self) -> Result<&Self> {
        self.driver.finish(self.id)?;
        Ok(self)
    }
}

/// A failed [`CommandQueue::unmap`].
#[derive(thiserror::Error, Debug)]
#[error("unmap failed: {error}")]
pub struct UnmapError {
    #[source]
    pub error: ClError,
    /// The view, still mapped, when the unmap was never enqueued.
    pub region: Option<MappedRegion>,
}

/// Converting keeps only the error. A view carried along stays mapped and
/// keeps its buffer alive.
impl From<UnmapError> for ClError {
    fn from(err: UnmapError) -> Self {
        err.error
    }
}

/// Host view of mapped device memory. Holds a reference on its buffer, so
/// releasing the buffer while mapped leaves the view usable.
#[must_use = "a mapped region must be passed back to `unmap`"]
#[derive(Debug)]
pub struct MappedRegion {
    mem: MemId,
    ptr: *mut u8,
    len: usize,
    access: MapAccess,
}

impl MappedRegion {
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn access(&self) -> MapAccess {
        self.access
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        // SAFETY: the region's reference keeps the buffer alive and the
        // driver keeps `ptr..ptr+len` mapped until `unmap` consumes it.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        if self.len == 0 {
            return &mut [];
        }
        // SAFETY: as `as_slice`; `&mut self` makes the borrow unique.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}
