//! Driver callbacks turned into channel messages.
//!
//! A native callback may run on a thread the application does not own, at a
//! point where blocking is not allowed. The closures installed here do one
//! thing: build a message and offer it to a [`Sink`] without blocking. All
//! handling happens wherever the receiving end is read.

use crate::driver::{EventId, ProgramId};
use crate::error::Result;
use crate::resource::{Device, Event, Program};
use crate::status::ExecutionStatus;
use std::sync::mpsc;
use tokio::sync::mpsc as async_mpsc;

/// The sending half of a channel that accepts messages without blocking.
pub trait Sink<M>: Send + 'static {
    /// Hands `message` over, or returns it if the channel is full or closed.
    ///
    /// # Errors
    ///
    /// Gives the message back when it could not be queued.
    fn offer(&self, message: M) -> std::result::Result<(), M>;
}

impl<M: Send + 'static> Sink<M> for async_mpsc::UnboundedSender<M> {
    fn offer(&self, message: M) -> std::result::Result<(), M> {
        self.send(message).map_err(|err| err.0)
    }
}

impl<M: Send + 'static> Sink<M> for async_mpsc::Sender<M> {
    fn offer(&self, message: M) -> std::result::Result<(), M> {
        self.try_send(message).map_err(|err| match err {
            async_mpsc::error::TrySendError::Full(m) | async_mpsc::error::TrySendError::Closed(m) => m,
        })
    }
}

impl<M: Send + 'static> Sink<M> for mpsc::Sender<M> {
    fn offer(&self, message: M) -> std::result::Result<(), M> {
        self.send(message).map_err(|err| err.0)
    }
}

impl<M: Send + 'static> Sink<M> for mpsc::SyncSender<M> {
    fn offer(&self, message: M) -> std::result::Result<(), M> {
        self.try_send(message).map_err(|err| match err {
            mpsc::TrySendError::Full(m) | mpsc::TrySendError::Disconnected(m) => m,
        })
    }
}

/// An event reached the status a callback was registered for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackMessage<T> {
    pub event: EventId,
    /// The status actually reached. An error status if the command failed.
    pub status: ExecutionStatus,
    pub data: T,
}

/// A program build registered through [`build_notify`] finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildMessage<T> {
    pub program: ProgramId,
    pub data: T,
}

/// An unbounded async channel, the default sink.
#[must_use]
pub fn channel<M>() -> (async_mpsc::UnboundedSender<M>, async_mpsc::UnboundedReceiver<M>) {
    async_mpsc::unbounded_channel()
}

/// Arranges for one [`CallbackMessage`] carrying `data` to be offered to
/// `sink` once `event` reaches `status` (or fails). Returns `sink`.
///
/// A message the sink refuses is dropped.
///
/// # Errors
///
/// Returns the native status if the driver rejects the registration, e.g.
/// for a status other than submitted, running or complete.
pub fn register_callback<S, T>(event: &Event, sink: S, status: ExecutionStatus, data: T) -> Result<S>
where
    S: Sink<CallbackMessage<T>> + Clone,
    T: Send + 'static,
{
    let handoff = sink.clone();
    event.driver.set_event_callback(
        event.id,
        status,
        Box::new(move |event, status| {
            let _ = handoff.offer(CallbackMessage { event, status, data });
        }),
    )?;
    Ok(sink)
}

/// A sink bound to a target status, so call sites only name the event.
#[derive(Debug, Clone)]
pub struct Follow<S> {
    sink: S,
    status: ExecutionStatus,
}

/// Follows events to completion through `sink`.
pub fn follow<S>(sink: S) -> Follow<S> {
    Follow {
        sink,
        status: ExecutionStatus::Complete,
    }
}

impl<S> Follow<S> {
    /// Targets `status` instead of completion.
    #[must_use]
    pub fn on(self, status: ExecutionStatus) -> Self {
        Self { status, ..self }
    }

    #[must_use]
    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Registers `event` with the bound sink and status.
    ///
    /// # Errors
    ///
    /// As [`register_callback`].
    pub fn event<T>(&self, event: &Event, data: T) -> Result<&Self>
    where
        S: Sink<CallbackMessage<T>> + Clone,
        T: Send + 'static,
    {
        register_callback(event, self.sink.clone(), self.status, data)?;
        Ok(self)
    }
}

/// Starts building `program` for `devices` (every context device when empty)
/// and offers one [`BuildMessage`] to `sink` when the build finishes, whether
/// or not it succeeded. Inspect the outcome with [`Program::build_logs`] or by
/// creating a kernel. Returns `sink`.
///
/// # Errors
///
/// Returns the native status if the build cannot be started, or
/// [`crate::ClError::Build`] if the driver reports a failed build right away.
pub fn build_notify<S, T>(
    program: &Program,
    devices: &[Device],
    options: &str,
    sink: S,
    data: T,
) -> Result<S>
where
    S: Sink<BuildMessage<T>> + Clone,
    T: Send + 'static,
{
    let targets = program.targets(devices);
    let ids: Vec<_> = targets.iter().map(Device::id).collect();
    let handoff = sink.clone();
    let outcome = program.driver.build_program(
        program.id,
        &ids,
        options,
        Some(Box::new(move |program| {
            let _ = handoff.offer(BuildMessage { program, data });
        })),
    );
    program.check_build(outcome, targets)?;
    tracing::debug!(id = program.id.0, options, "program build started");
    Ok(sink)
}
