// src/error.rs
//
// Unified error handling for strip-slicer
// Uses thiserror for simple, type-safe error handling
//
// Error Taxonomy:
// - UserError: bad paths, bad cut plans, bad arguments
// - CodecError: decode/encode failures
// - ResourceLimit: pixel/memory ceilings, unwritable destinations
// - Cancelled: cooperative cancellation (not reported as a failure)

use std::borrow::Cow;
use std::path::Path;
use thiserror::Error;

/// Error taxonomy used by callers to decide how to message a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCategory {
    /// Invalid input, recoverable by user
    UserError,
    /// Format/encoding issues
    CodecError,
    /// Memory/pixel limits and filesystem capacity
    ResourceLimit,
    /// The operation was cancelled by the caller
    Cancelled,
}

/// Flat error kind, independent of any slice/file context wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InputNotFound,
    InputUnreadable,
    OutputUnwritable,
    InvalidCutPlan,
    InvalidArgument,
    PixelLimitExceeded,
    MemoryBudgetExceeded,
    DecodeFailed,
    EncodeFailed,
    Cancelled,
}

/// strip-slicer error types
///
/// Leaf variants carry the violated condition; the `Slice`, `Input` and
/// `Chunk` variants wrap a leaf with the position being processed when it
/// failed.
#[derive(Debug, Error)]
pub enum SlicerError {
    #[error("Input not found: {path}")]
    InputNotFound { path: Cow<'static, str> },

    #[error("Cannot read input '{path}': {reason}")]
    InputUnreadable {
        path: Cow<'static, str>,
        reason: Cow<'static, str>,
    },

    #[error("Output '{path}' is not writable: {source}")]
    OutputUnwritable {
        path: Cow<'static, str>,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid cut plan for image height {height}: {reason}")]
    InvalidCutPlan {
        height: u32,
        reason: Cow<'static, str>,
    },

    #[error("Invalid value for {name}: {value}. {reason}")]
    InvalidArgument {
        name: Cow<'static, str>,
        value: Cow<'static, str>,
        reason: Cow<'static, str>,
    },

    #[error("{context}: pixel count {pixels} exceeds maximum {max}")]
    PixelLimitExceeded {
        context: Cow<'static, str>,
        pixels: u64,
        max: u64,
    },

    #[error("{context}: estimated {required_mib:.1} MiB exceeds limit of {limit_mib:.1} MiB")]
    MemoryBudgetExceeded {
        context: Cow<'static, str>,
        required_mib: f64,
        limit_mib: f64,
    },

    #[error("Failed to decode '{path}': {message}")]
    DecodeFailed {
        path: Cow<'static, str>,
        message: Cow<'static, str>,
    },

    #[error("Failed to encode as {format}: {message}")]
    EncodeFailed {
        format: Cow<'static, str>,
        message: Cow<'static, str>,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Slice {index}/{total} failed: {source}")]
    Slice {
        /// 1-based slice number
        index: usize,
        total: usize,
        #[source]
        source: Box<SlicerError>,
    },

    #[error("Input #{index} ({path}) failed: {source}")]
    Input {
        /// 1-based position in the input list
        index: usize,
        path: Cow<'static, str>,
        #[source]
        source: Box<SlicerError>,
    },

    #[error("Chunk {index} of '{path}' failed: {source}")]
    Chunk {
        index: usize,
        path: Cow<'static, str>,
        #[source]
        source: Box<SlicerError>,
    },
}

fn display_path(path: &Path) -> Cow<'static, str> {
    Cow::Owned(path.display().to_string())
}

const MIB: f64 = 1024.0 * 1024.0;

// Constructor Helpers
impl SlicerError {
    pub fn input_not_found(path: &Path) -> Self {
        Self::InputNotFound {
            path: display_path(path),
        }
    }

    pub fn input_unreadable(path: &Path, reason: impl Into<Cow<'static, str>>) -> Self {
        Self::InputUnreadable {
            path: display_path(path),
            reason: reason.into(),
        }
    }

    pub fn output_unwritable(path: &Path, source: std::io::Error) -> Self {
        Self::OutputUnwritable {
            path: display_path(path),
            source,
        }
    }

    pub fn invalid_cut_plan(height: u32, reason: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidCutPlan {
            height,
            reason: reason.into(),
        }
    }

    pub fn invalid_argument(
        name: impl Into<Cow<'static, str>>,
        value: impl Into<Cow<'static, str>>,
        reason: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::InvalidArgument {
            name: name.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    pub fn pixel_limit_exceeded(
        context: impl Into<Cow<'static, str>>,
        pixels: u64,
        max: u64,
    ) -> Self {
        Self::PixelLimitExceeded {
            context: context.into(),
            pixels,
            max,
        }
    }

    pub fn memory_budget_exceeded(
        context: impl Into<Cow<'static, str>>,
        required_bytes: u64,
        limit_bytes: u64,
    ) -> Self {
        Self::MemoryBudgetExceeded {
            context: context.into(),
            required_mib: required_bytes as f64 / MIB,
            limit_mib: limit_bytes as f64 / MIB,
        }
    }

    pub fn decode_failed(path: &Path, message: impl Into<Cow<'static, str>>) -> Self {
        Self::DecodeFailed {
            path: display_path(path),
            message: message.into(),
        }
    }

    pub fn encode_failed(
        format: impl Into<Cow<'static, str>>,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::EncodeFailed {
            format: format.into(),
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::Cancelled
    }

    /// Attach slice context. `index` is 0-based; the message shows it 1-based.
    /// Cancellation passes through unwrapped.
    pub fn at_slice(self, index: usize, total: usize) -> Self {
        if self.is_cancelled() {
            return self;
        }
        Self::Slice {
            index: index + 1,
            total,
            source: Box::new(self),
        }
    }

    /// Attach input-file context. `index` is 0-based.
    pub fn at_input(self, index: usize, path: &Path) -> Self {
        if self.is_cancelled() {
            return self;
        }
        Self::Input {
            index: index + 1,
            path: display_path(path),
            source: Box::new(self),
        }
    }

    pub fn at_chunk(self, index: usize, path: &Path) -> Self {
        if self.is_cancelled() {
            return self;
        }
        Self::Chunk {
            index,
            path: display_path(path),
            source: Box::new(self),
        }
    }

    /// The kind of the innermost error, looking through context wrappers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InputNotFound { .. } => ErrorKind::InputNotFound,
            Self::InputUnreadable { .. } => ErrorKind::InputUnreadable,
            Self::OutputUnwritable { .. } => ErrorKind::OutputUnwritable,
            Self::InvalidCutPlan { .. } => ErrorKind::InvalidCutPlan,
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::PixelLimitExceeded { .. } => ErrorKind::PixelLimitExceeded,
            Self::MemoryBudgetExceeded { .. } => ErrorKind::MemoryBudgetExceeded,
            Self::DecodeFailed { .. } => ErrorKind::DecodeFailed,
            Self::EncodeFailed { .. } => ErrorKind::EncodeFailed,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Slice { source, .. } | Self::Input { source, .. } | Self::Chunk { source, .. } => {
                source.kind()
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }

    /// Get the error category for this error
    pub fn category(&self) -> ErrorCategory {
        match self.kind() {
            ErrorKind::InputNotFound
            | ErrorKind::InvalidCutPlan
            | ErrorKind::InvalidArgument
            | ErrorKind::InputUnreadable => ErrorCategory::UserError,

            ErrorKind::DecodeFailed | ErrorKind::EncodeFailed => ErrorCategory::CodecError,

            ErrorKind::PixelLimitExceeded
            | ErrorKind::MemoryBudgetExceeded
            | ErrorKind::OutputUnwritable => ErrorCategory::ResourceLimit,

            ErrorKind::Cancelled => ErrorCategory::Cancelled,
        }
    }

    /// Whether retrying the same operation can succeed once the environment
    /// changes (permissions fixed, memory freed, file restored).
    ///
    /// `PixelLimitExceeded` is fatal: the composite is too large to address
    /// no matter how much memory is available.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::OutputUnwritable | ErrorKind::MemoryBudgetExceeded | ErrorKind::InputNotFound
        )
    }
}

// Result type alias
pub type Result<T> = std::result::Result<T, SlicerError>;


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SlicerError::input_not_found(Path::new("/path/to/strip.png"));
        assert!(err.to_string().contains("/path/to/strip.png"));
    }

    #[test]
    fn test_context_wrappers_keep_kind() {
        let err = SlicerError::encode_failed("jpeg", "boom").at_slice(2, 5);
        assert_eq!(err.kind(), ErrorKind::EncodeFailed);
        assert!(err.to_string().starts_with("Slice 3/5 failed"));

        let err = SlicerError::decode_failed(Path::new("b.png"), "truncated")
            .at_input(1, Path::new("b.png"));
        assert_eq!(err.kind(), ErrorKind::DecodeFailed);
        assert!(err.to_string().contains("Input #2"));
    }

    #[test]
    fn test_cancelled_is_never_wrapped() {
        let err = SlicerError::cancelled().at_slice(0, 3);
        assert!(matches!(err, SlicerError::Cancelled));
        let err = SlicerError::cancelled().at_input(4, Path::new("x.png"));
        assert!(matches!(err, SlicerError::Cancelled));
        assert_eq!(err.category(), ErrorCategory::Cancelled);
    }

    #[test]
    fn test_error_category() {
        assert_eq!(
            SlicerError::invalid_cut_plan(100, "offset 0").category(),
            ErrorCategory::UserError
        );
        assert_eq!(
            SlicerError::decode_failed(Path::new("a.psd"), "bad").category(),
            ErrorCategory::CodecError
        );
        assert_eq!(
            SlicerError::pixel_limit_exceeded("merge", 10, 5).category(),
            ErrorCategory::ResourceLimit
        );
    }

    #[test]
    fn test_retryable_split() {
        let io = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert!(SlicerError::output_unwritable(Path::new("/out"), io).is_retryable());
        assert!(SlicerError::memory_budget_exceeded("decode", 10, 5).is_retryable());
        assert!(!SlicerError::pixel_limit_exceeded("merge", 10, 5).is_retryable());
        assert!(!SlicerError::invalid_cut_plan(10, "x").is_retryable());
    }

    #[test]
    fn test_memory_message_reports_mib() {
        let err = SlicerError::memory_budget_exceeded("decode a.psd", 3 * 1024 * 1024, 1024 * 1024);
        let msg = err.to_string();
        assert!(msg.contains("3.0 MiB"));
        assert!(msg.contains("1.0 MiB"));
    }
}
