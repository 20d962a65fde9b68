//! Native status codes and command execution states.
//!
//! Every native entry point reports success or failure as a signed integer.
//! [`Status`] wraps that integer, [`check`] turns it into a `Result`, and
//! [`ExecutionStatus`] decodes the per-command state carried by events.

use std::fmt;

/// Result of a raw native call. The error side is the untouched status code.
pub type NativeResult<T> = std::result::Result<T, Status>;

/// A native status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub i32);

impl Status {
    pub const SUCCESS: Self = Self(0);
    pub const DEVICE_NOT_FOUND: Self = Self(-1);
    pub const DEVICE_NOT_AVAILABLE: Self = Self(-2);
    pub const COMPILER_NOT_AVAILABLE: Self = Self(-3);
    pub const MEM_OBJECT_ALLOCATION_FAILURE: Self = Self(-4);
    pub const OUT_OF_RESOURCES: Self = Self(-5);
    pub const OUT_OF_HOST_MEMORY: Self = Self(-6);
    pub const PROFILING_INFO_NOT_AVAILABLE: Self = Self(-7);
    pub const MEM_COPY_OVERLAP: Self = Self(-8);
    pub const BUILD_PROGRAM_FAILURE: Self = Self(-11);
    pub const MAP_FAILURE: Self = Self(-12);
    pub const MISALIGNED_SUB_BUFFER_OFFSET: Self = Self(-13);
    pub const EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST: Self = Self(-14);
    pub const COMPILE_PROGRAM_FAILURE: Self = Self(-15);
    pub const LINK_PROGRAM_FAILURE: Self = Self(-17);
    pub const INVALID_VALUE: Self = Self(-30);
    pub const INVALID_DEVICE_TYPE: Self = Self(-31);
    pub const INVALID_PLATFORM: Self = Self(-32);
    pub const INVALID_DEVICE: Self = Self(-33);
    pub const INVALID_CONTEXT: Self = Self(-34);
    pub const INVALID_QUEUE_PROPERTIES: Self = Self(-35);
    pub const INVALID_COMMAND_QUEUE: Self = Self(-36);
    pub const INVALID_HOST_PTR: Self = Self(-37);
    pub const INVALID_MEM_OBJECT: Self = Self(-38);
    pub const INVALID_BINARY: Self = Self(-42);
    pub const INVALID_BUILD_OPTIONS: Self = Self(-43);
    pub const INVALID_PROGRAM: Self = Self(-44);
    pub const INVALID_PROGRAM_EXECUTABLE: Self = Self(-45);
    pub const INVALID_KERNEL_NAME: Self = Self(-46);
    pub const INVALID_KERNEL_DEFINITION: Self = Self(-47);
    pub const INVALID_KERNEL: Self = Self(-48);
    pub const INVALID_ARG_INDEX: Self = Self(-49);
    pub const INVALID_ARG_VALUE: Self = Self(-50);
    pub const INVALID_ARG_SIZE: Self = Self(-51);
    pub const INVALID_KERNEL_ARGS: Self = Self(-52);
    pub const INVALID_WORK_DIMENSION: Self = Self(-53);
    pub const INVALID_WORK_GROUP_SIZE: Self = Self(-54);
    pub const INVALID_WORK_ITEM_SIZE: Self = Self(-55);
    pub const INVALID_GLOBAL_OFFSET: Self = Self(-56);
    pub const INVALID_EVENT_WAIT_LIST: Self = Self(-57);
    pub const INVALID_EVENT: Self = Self(-58);
    pub const INVALID_OPERATION: Self = Self(-59);
    pub const INVALID_BUFFER_SIZE: Self = Self(-61);
    pub const INVALID_GLOBAL_WORK_SIZE: Self = Self(-63);
    pub const INVALID_PROPERTY: Self = Self(-64);

    #[must_use]
    pub const fn code(self) -> i32 {
        self.0
    }

    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    /// Symbolic name of the code, or `"UNKNOWN_STATUS"` for codes outside the table.
    #[must_use]
    pub const fn name(self) -> &'static str {
        status_name(self.0)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

/// Maps a native status code to its symbolic name.
#[must_use]
pub const fn status_name(code: i32) -> &'static str {
    match code {
        0 => "SUCCESS",
        -1 => "DEVICE_NOT_FOUND",
        -2 => "DEVICE_NOT_AVAILABLE",
        -3 => "COMPILER_NOT_AVAILABLE",
        -4 => "MEM_OBJECT_ALLOCATION_FAILURE",
        -5 => "OUT_OF_RESOURCES",
        -6 => "OUT_OF_HOST_MEMORY",
        -7 => "PROFILING_INFO_NOT_AVAILABLE",
        -8 => "MEM_COPY_OVERLAP",
        -9 => "IMAGE_FORMAT_MISMATCH",
        -10 => "IMAGE_FORMAT_NOT_SUPPORTED",
        -11 => "BUILD_PROGRAM_FAILURE",
        -12 => "MAP_FAILURE",
        -13 => "MISALIGNED_SUB_BUFFER_OFFSET",
        -14 => "EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST",
        -15 => "COMPILE_PROGRAM_FAILURE",
        -16 => "LINKER_NOT_AVAILABLE",
        -17 => "LINK_PROGRAM_FAILURE",
        -18 => "DEVICE_PARTITION_FAILED",
        -19 => "KERNEL_ARG_INFO_NOT_AVAILABLE",
        -30 => "INVALID_VALUE",
        -31 => "INVALID_DEVICE_TYPE",
        -32 => "INVALID_PLATFORM",
        -33 => "INVALID_DEVICE",
        -34 => "INVALID_CONTEXT",
        -35 => "INVALID_QUEUE_PROPERTIES",
        -36 => "INVALID_COMMAND_QUEUE",
        -37 => "INVALID_HOST_PTR",
        -38 => "INVALID_MEM_OBJECT",
        -39 => "INVALID_IMAGE_FORMAT_DESCRIPTOR",
        -40 => "INVALID_IMAGE_SIZE",
        -41 => "INVALID_SAMPLER",
        -42 => "INVALID_BINARY",
        -43 => "INVALID_BUILD_OPTIONS",
        -44 => "INVALID_PROGRAM",
        -45 => "INVALID_PROGRAM_EXECUTABLE",
        -46 => "INVALID_KERNEL_NAME",
        -47 => "INVALID_KERNEL_DEFINITION",
        -48 => "INVALID_KERNEL",
        -49 => "INVALID_ARG_INDEX",
        -50 => "INVALID_ARG_VALUE",
        -51 => "INVALID_ARG_SIZE",
        -52 => "INVALID_KERNEL_ARGS",
        -53 => "INVALID_WORK_DIMENSION",
        -54 => "INVALID_WORK_GROUP_SIZE",
        -55 => "INVALID_WORK_ITEM_SIZE",
        -56 => "INVALID_GLOBAL_OFFSET",
        -57 => "INVALID_EVENT_WAIT_LIST",
        -58 => "INVALID_EVENT",
        -59 => "INVALID_OPERATION",
        -60 => "INVALID_GL_OBJECT",
        -61 => "INVALID_BUFFER_SIZE",
        -62 => "INVALID_MIP_LEVEL",
        -63 => "INVALID_GLOBAL_WORK_SIZE",
        -64 => "INVALID_PROPERTY",
        -65 => "INVALID_IMAGE_DESCRIPTOR",
        -66 => "INVALID_COMPILER_OPTIONS",
        -67 => "INVALID_LINKER_OPTIONS",
        -68 => "INVALID_DEVICE_PARTITION_COUNT",
        _ => "UNKNOWN_STATUS",
    }
}

/// Returns `value` when `code` is the success status, the status otherwise.
///
/// # Errors
///
/// Returns `Status(code)` for every non-zero code.
pub fn check<T>(code: i32, value: T) -> NativeResult<T> {
    if code == Status::SUCCESS.0 {
        Ok(value)
    } else {
        Err(Status(code))
    }
}

/// Execution state of the command an event tracks.
///
/// Native codes count down towards completion: queued (3), submitted (2),
/// running (1), complete (0). Negative codes are terminal errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionStatus {
    Queued,
    Submitted,
    Running,
    Complete,
    Error(i32),
}

impl ExecutionStatus {
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Queued => 3,
            Self::Submitted => 2,
            Self::Running => 1,
            Self::Complete => 0,
            Self::Error(code) => code,
        }
    }

    /// Decodes a native execution status. Positive codes above 3 have no
    /// meaning and yield `None`.
    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            3 => Some(Self::Queued),
            2 => Some(Self::Submitted),
            1 => Some(Self::Running),
            0 => Some(Self::Complete),
            c if c < 0 => Some(Self::Error(c)),
            _ => None,
        }
    }

    /// `true` for complete and error states.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        self.code() <= 0
    }

    /// `true` once the state has progressed at least as far as `target`.
    /// Errors reach every target.
    #[must_use]
    pub const fn has_reached(self, target: Self) -> bool {
        self.code() <= target.code()
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => f.write_str("queued"),
            Self::Submitted => f.write_str("submitted"),
            Self::Running => f.write_str("running"),
            Self::Complete => f.write_str("complete"),
            Self::Error(code) => write!(f, "error {}", status_name(*code)),
        }
    }
}
