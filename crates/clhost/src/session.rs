//! An explicit bundle of the objects most host programs need at once.
//!
//! A [`Session`] holds one platform, one device, a context over that device
//! and a command queue on it. It is passed around by reference; nothing is
//! bound globally.

use crate::driver::{DeviceInfo, Driver};
use crate::error::{ClError, Result};
use crate::flags::{DeviceType, QueueProperties};
use crate::resource::{release_all, CommandQueue, Context, Device, Platform, Releasable};
use std::sync::Arc;

/// Which platform, device and queue kind to open. Indices count from zero in
/// driver enumeration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionConfig {
    pub platform: usize,
    pub device_type: DeviceType,
    pub device: usize,
    pub queue: QueueProperties,
}

#[derive(Debug, Clone)]
pub struct Session {
    platform: Platform,
    device: Device,
    context: Context,
    queue: CommandQueue,
}

impl Session {
    /// Selects a device as `config` describes and creates a context and a
    /// queue for it. Nothing stays acquired if creation fails.
    ///
    /// # Errors
    ///
    /// [`ClError::InvalidArgument`] if the platform or device index is out of
    /// range, otherwise the native status of the failed call.
    pub fn open(driver: &Arc<dyn Driver>, config: &SessionConfig) -> Result<Self> {
        let platforms = Platform::list(driver)?;
        let platform = platforms.get(config.platform).cloned().ok_or_else(|| {
            ClError::invalid(format!(
                "platform {} requested, {} available",
                config.platform,
                platforms.len()
            ))
        })?;
        let devices = platform.devices(config.device_type)?;
        let device = devices.get(config.device).cloned().ok_or_else(|| {
            ClError::invalid(format!(
                "{} device {} requested, {} available",
                config.device_type,
                config.device,
                devices.len()
            ))
        })?;

        let context = Context::new(std::slice::from_ref(&device))?;
        let queue = match CommandQueue::new(&context, &device, config.queue) {
            Ok(queue) => queue,
            Err(original) => {
                return Err(match context.release() {
                    Ok(()) => original,
                    Err(failure) => ClError::Unwind {
                        original: Box::new(original),
                        release: vec![failure],
                    },
                });
            }
        };
        tracing::info!(
            driver = driver.name(),
            platform = platform.id().0,
            device = device.id().0,
            queue = %config.queue,
            "session opened"
        );
        Ok(Self {
            platform,
            device,
            context,
            queue,
        })
    }

    #[must_use]
    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    #[must_use]
    pub fn context(&self) -> &Context {
        &self.context
    }

    #[must_use]
    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// # Errors
    ///
    /// Returns the native status of the query.
    pub fn device_info(&self) -> Result<DeviceInfo> {
        self.device.info()
    }

    /// Releases the queue, then the context.
    ///
    /// # Errors
    ///
    /// As [`release_all`].
    pub fn release(self) -> Result<()> {
        release_all(self).map(|_| ())
    }
}

impl From<Session> for Releasable {
    fn from(session: Session) -> Self {
        Self::Many(vec![session.queue.into(), session.context.into()])
    }
}
