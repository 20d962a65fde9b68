use crate::driver::ResourceKind;
use crate::status::Status;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClError>;

#[derive(Error, Debug)]
pub enum ClError {
    /// A native call returned a non-success status.
    #[error("native call failed: {name} ({code})")]
    Native { code: i32, name: &'static str },

    /// Program compilation or linking failed. `logs` holds one
    /// `(device name, build log)` pair per target device.
    #[error("program build failed with {name} ({code}){}", format_logs(.logs))]
    Build {
        code: i32,
        name: &'static str,
        logs: Vec<(String, String)>,
    },

    /// A caller-supplied geometry or parameter violates a precondition.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Releasing a handle returned a non-success status.
    #[error("releasing {kind} failed: {name} ({code})")]
    Release {
        kind: ResourceKind,
        code: i32,
        name: &'static str,
    },

    /// An operation failed and at least one release failed while cleaning
    /// up after it, e.g. a scope's body or a map. `original` is the first
    /// error.
    #[error("{original} (and {} release failure(s) while unwinding)", .release.len())]
    Unwind {
        #[source]
        original: Box<ClError>,
        release: Vec<ClError>,
    },

    /// Several failures at once, e.g. more than one release in a single
    /// `release_all`, or a failed pass plus the cleanup after it.
    #[error("{} operations failed, first: {}", .0.len(), .0.first().map(ToString::to_string).unwrap_or_default())]
    Aggregate(Vec<ClError>),

    #[error("backend not available")]
    BackendUnavailable,
}

impl ClError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub(crate) fn release(kind: ResourceKind, status: Status) -> Self {
        Self::Release {
            kind,
            code: status.code(),
            name: status.name(),
        }
    }

    /// The native status behind this error, if there is exactly one.
    #[must_use]
    pub fn status(&self) -> Option<Status> {
        match self {
            Self::Native { code, .. } | Self::Build { code, .. } | Self::Release { code, .. } => {
                Some(Status(*code))
            }
            Self::Unwind { original, .. } => original.status(),
            _ => None,
        }
    }

    /// Folds a list of failures into at most one error.
    pub(crate) fn collect(mut errors: Vec<ClError>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Aggregate(errors)),
        }
    }
}

impl From<Status> for ClError {
    fn from(status: Status) -> Self {
        Self::Native {
            code: status.code(),
            name: status.name(),
        }
    }
}

fn format_logs(logs: &[(String, String)]) -> String {
    let mut out = String::new();
    for (device, log) in logs {
        out.push_str("\n[");
        out.push_str(device);
        out.push_str("]\n");
        out.push_str(log.trim_end());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_error_carries_code_and_name() {
        let err = ClError::from(Status::INVALID_KERNEL_ARGS);
        assert!(matches!(err, ClError::Native { code: -52, name: "INVALID_KERNEL_ARGS" }));
        assert_eq!(err.to_string(), "native call failed: INVALID_KERNEL_ARGS (-52)");
    }

    #[test]
    fn build_error_lists_every_device_log() {
        let err = ClError::Build {
            code: -11,
            name: "BUILD_PROGRAM_FAILURE",
            logs: vec![
                ("cpu0".into(), "error: a\n".into()),
                ("gpu0".into(), "error: b".into()),
            ],
        };
        let text = err.to_string();
        assert!(text.contains("[cpu0]\nerror: a"));
        assert!(text.contains("[gpu0]\nerror: b"));
    }

    #[test]
    fn unwind_exposes_original_as_source() {
        use std::error::Error as _;
        let err = ClError::Unwind {
            original: Box::new(ClError::invalid("boom")),
            release: vec![ClError::release(ResourceKind::Context, Status::INVALID_CONTEXT)],
        };
        let source = err.source().map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("invalid argument: boom"));
        assert!(err.to_string().contains("1 release failure"));
    }

    #[test]
    fn collect_folds_failures() {
        assert!(ClError::collect(Vec::new()).is_none());
        let one = ClError::collect(vec![ClError::invalid("x")]);
        assert!(matches!(one, Some(ClError::InvalidArgument(_))));
        let many = ClError::collect(vec![ClError::invalid("x"), ClError::invalid("y")]);
        assert!(matches!(many, Some(ClError::Aggregate(v)) if v.len() == 2));
    }
}
