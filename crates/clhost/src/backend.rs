//! [`Driver`](crate::driver::Driver) implementations.

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "opencl")]
pub mod opencl;
