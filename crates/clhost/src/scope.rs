//! Scoped acquisition.
//!
//! A [`Scope`] is a stack of acquired resources. Leaving the scope releases
//! every binding in reverse order of acquisition, so later (dependent)
//! resources go before the ones they were derived from.
//!
//! ```ignore
//! let total = with_release(|scope| {
//!     let ctx = scope.adopt(Context::new(&devices)?);
//!     let queue = scope.adopt(CommandQueue::new(&ctx, &devices[0], QueueProperties::IN_ORDER)?);
//!     let buf = scope.adopt(Buffer::from_slice(&ctx, MemFlags::READ_ONLY, &data)?);
//!     run(&queue, &buf)
//! })?;
//! ```

use crate::error::{ClError, Result};
use crate::resource::{release_all, Releasable};

/// Stack of resources released in reverse order when the scope ends.
///
/// Prefer [`with_release`], which reports release failures. A scope that is
/// dropped without [`Scope::close`] (for example while panicking) still
/// releases its stack, but can only log failures.
#[derive(Debug, Default)]
pub struct Scope {
    stack: Vec<Releasable>,
}

impl Scope {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `resource` to the scope and hands back a handle to it.
    pub fn adopt<T>(&mut self, resource: T) -> T
    where
        T: Clone + Into<Releasable>,
    {
        self.stack.push(resource.clone().into());
        resource
    }

    /// Binds a resource or a nested group of resources released together.
    pub fn push(&mut self, value: impl Into<Releasable>) {
        self.stack.push(value.into());
    }

    /// Number of bindings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stack.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Releases every binding, most recent first.
    ///
    /// # Errors
    ///
    /// The release failure, or [`ClError::Aggregate`] when several fail.
    pub fn close(mut self) -> Result<()> {
        match ClError::collect(self.unwind()) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    fn unwind(&mut self) -> Vec<ClError> {
        let mut failures = Vec::new();
        while let Some(binding) = self.stack.pop() {
            match release_all(binding) {
                Ok(_) => {}
                Err(ClError::Aggregate(errors)) => failures.extend(errors),
                Err(err) => failures.push(err),
            }
        }
        failures
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        if self.stack.is_empty() {
            return;
        }
        for failure in self.unwind() {
            tracing::warn!(error = %failure, "release failed while dropping scope");
        }
    }
}

/// Runs `body` with a fresh [`Scope`] and releases everything it bound on
/// every exit path.
///
/// If `body` succeeds, the first release failure (or an aggregate of them)
/// replaces its value. If `body` fails and every release succeeds, its error
/// propagates unchanged. If both fail, the result is [`ClError::Unwind`]
/// whose source is the body's error.
///
/// # Errors
///
/// See above.
pub fn with_release<R, F>(body: F) -> Result<R>
where
    F: FnOnce(&mut Scope) -> Result<R>,
{
    let mut scope = Scope::new();
    let outcome = body(&mut scope);
    let failures = scope.unwind();
    match outcome {
        Ok(value) => match ClError::collect(failures) {
            None => Ok(value),
            Some(err) => Err(err),
        },
        Err(original) if failures.is_empty() => Err(original),
        Err(original) => Err(ClError::Unwind {
            original: Box::new(original),
            release: failures,
        }),
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::backend::mock::MockDriver;
    use crate::driver::{Driver, ResourceKind};
    use crate::flags::{DeviceType, MemFlags, QueueProperties};
    use crate::resource::{Buffer, CommandQueue, Context, Platform};
    use crate::status::Status;
    use std::sync::Arc;

    fn devices(mock: &Arc<MockDriver>) -> Vec<crate::resource::Device> {
        let driver: Arc<dyn Driver> = mock.clone();
        Platform::list(&driver).unwrap()[0]
            .devices(DeviceType::All)
            .unwrap()
    }

    fn kinds(mock: &MockDriver) -> Vec<ResourceKind> {
        mock.release_log().into_iter().map(|(k, _)| k).collect()
    }

    #[test]
    fn bindings_release_in_reverse_order() {
        let mock = Arc::new(MockDriver::new());
        let devices = devices(&mock);
        let size = with_release(|scope| {
            let ctx = scope.adopt(Context::new(&devices)?);
            let _queue = scope.adopt(CommandQueue::new(&ctx, &devices[0], QueueProperties::IN_ORDER)?);
            let buf = scope.adopt(Buffer::new(&ctx, MemFlags::READ_WRITE, 64)?);
            Ok(buf.size())
        })
        .unwrap();
        assert_eq!(size, 64);
        assert_eq!(
            kinds(&mock),
            vec![ResourceKind::Memory, ResourceKind::CommandQueue, ResourceKind::Context]
        );
    }

    #[test]
    fn failing_body_still_releases_and_propagates_original() {
        let mock = Arc::new(MockDriver::new());
        let devices = devices(&mock);
        let result: Result<()> = with_release(|scope| {
            let ctx = scope.adopt(Context::new(&devices)?);
            scope.adopt(Buffer::new(&ctx, MemFlags::READ_WRITE, 8)?);
            Err(ClError::invalid("body failed"))
        });
        assert!(matches!(result, Err(ClError::InvalidArgument(ref m)) if m == "body failed"));
        assert_eq!(kinds(&mock), vec![ResourceKind::Memory, ResourceKind::Context]);
    }

    #[test]
    fn release_failure_during_unwind_is_kept_beside_original() {
        let mock = Arc::new(MockDriver::new());
        let devices = devices(&mock);
        let result: Result<()> = with_release(|scope| {
            let ctx = scope.adopt(Context::new(&devices)?);
            let buf = scope.adopt(Buffer::new(&ctx, MemFlags::READ_WRITE, 8)?);
            mock.fail_release(buf.id().as_raw(), Status::OUT_OF_RESOURCES);
            Err(ClError::invalid("body failed"))
        });
        match result {
            Err(ClError::Unwind { original, release }) => {
                assert!(matches!(*original, ClError::InvalidArgument(_)));
                assert_eq!(release.len(), 1);
                assert!(matches!(
                    release[0],
                    ClError::Release { kind: ResourceKind::Memory, code: -5, .. }
                ));
            }
            other => panic!("expected unwind error, got {other:?}"),
        }
        // The context after the failing buffer was still released.
        assert_eq!(kinds(&mock), vec![ResourceKind::Context]);
    }

    #[test]
    fn release_failure_after_success_is_reported() {
        let mock = Arc::new(MockDriver::new());
        let devices = devices(&mock);
        let result = with_release(|scope| {
            let ctx = scope.adopt(Context::new(&devices)?);
            mock.fail_release(ctx.id().as_raw(), Status::INVALID_CONTEXT);
            Ok(1)
        });
        assert!(matches!(result, Err(ClError::Release { kind: ResourceKind::Context, .. })));
    }

    #[test]
    fn nested_groups_release_every_leaf() {
        let mock = Arc::new(MockDriver::new());
        let devices = devices(&mock);
        let ctx = Context::new(&devices).unwrap();
        let mut scope = Scope::new();
        let buffers: Vec<Buffer> = (1..=3)
            .map(|i| Buffer::new(&ctx, MemFlags::READ_WRITE, i * 4).unwrap())
            .collect();
        scope.push(vec![buffers.clone(), Vec::new()]);
        scope.push(ctx.clone());
        assert_eq!(scope.len(), 2);
        scope.close().unwrap();
        assert_eq!(
            kinds(&mock),
            vec![
                ResourceKind::Context,
                ResourceKind::Memory,
                ResourceKind::Memory,
                ResourceKind::Memory
            ]
        );
    }

    #[test]
    fn dropped_scope_releases_on_panic() {
        let mock = Arc::new(MockDriver::new());
        let devices = devices(&mock);
        let ctx = Context::new(&devices).unwrap();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut scope = Scope::new();
            scope.adopt(ctx.clone());
            panic!("body panicked");
        }));
        assert!(outcome.is_err());
        assert_eq!(kinds(&mock), vec![ResourceKind::Context]);
    }
}
