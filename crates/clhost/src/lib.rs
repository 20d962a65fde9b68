#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
//! Host-side control layer for OpenCL-style compute devices.
//!
//! The crate sits between application code and a native compute driver. It
//! releases native handles deterministically (including when a guarded body
//! fails), partitions work into groups, wraps every enqueue with optional
//! wait lists and completion events, turns driver callbacks into channel
//! messages, and drives multi-pass tree reductions.
//!
//! The native API is reached through the [`Driver`] trait. The `mock`
//! feature (on by default) provides an in-process driver for tests and demos;
//! the `opencl` feature forwards to a system OpenCL loader.

use std::sync::Arc;

pub mod backend;
pub mod callback;
pub mod driver;
pub mod error;
pub mod flags;
pub mod queue;
pub mod reduce;
pub mod resource;
pub mod scope;
pub mod session;
pub mod status;
pub mod work;

pub use callback::{
    build_notify, channel, follow, register_callback, BuildMessage, CallbackMessage, Follow, Sink,
};
pub use driver::{Driver, KernelArg};
pub use error::{ClError, Result};
pub use flags::{DeviceType, MapAccess, MemFlags, QueueProperties};
pub use queue::{EventSlot, MappedRegion, UnmapError};
pub use reduce::{reduce, reduce_2d};
pub use resource::{
    release, release_all, Buffer, CommandQueue, Context, Device, Event, Kernel, Platform, Program,
    Releasable, Resource,
};
pub use scope::{with_release, Scope};
pub use session::{Session, SessionConfig};
pub use status::{ExecutionStatus, Status};
pub use work::{group_count, WorkSize};

/// Picks the native layer: a system OpenCL loader when the `opencl` feature is
/// on and it reports at least one platform, the in-process mock otherwise.
///
/// # Errors
///
/// [`ClError::BackendUnavailable`] when no OpenCL platform is found and the
/// `mock` feature is off.
pub fn default_driver() -> Result<Arc<dyn Driver>> {
    #[cfg(feature = "opencl")]
    {
        match backend::opencl::OpenClDriver::try_new() {
            Ok(driver) => {
                tracing::info!("Using OpenCL driver.");
                return Ok(Arc::new(driver));
            }
            Err(err) => tracing::warn!(%err, "OpenCL driver unavailable, falling back..."),
        }
    }
    fallback_driver()
}

#[cfg(feature = "mock")]
#[allow(clippy::unnecessary_wraps)]
fn fallback_driver() -> Result<Arc<dyn Driver>> {
    tracing::info!("Using mock driver.");
    Ok(Arc::new(backend::mock::MockDriver::new()))
}

#[cfg(not(feature = "mock"))]
fn fallback_driver() -> Result<Arc<dyn Driver>> {
    Err(ClError::BackendUnavailable)
}

#[cfg(not(any(feature = "mock", feature = "opencl")))]
compile_error!("No driver available. Enable the 'mock' feature or the 'opencl' feature.");

#[cfg(all(test, feature = "mock", not(feature = "opencl")))]
mod tests {
    use super::*;

    #[test]
    fn default_driver_falls_back_to_mock() {
        let driver = default_driver().unwrap();
        assert_eq!(driver.name(), "mock");
        assert!(!Platform::list(&driver).unwrap().is_empty());
    }
}
