//! Error types for the filament runtime

use core::fmt;

/// Result type for runtime operations
pub type RtResult<T> = Result<T, ReactorError>;

/// Errors from fiber lifecycle operations
///
/// Lifecycle violations (resuming a non-ready fiber, resetting a live
/// one) are programming errors and abort via assertion; these variants
/// cover the recoverable surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FiberError {
    /// reset() called on a fiber that has not terminated
    NotTerminated,

    /// The fiber's stack could not be mapped
    StackAllocation(i32),
}

impl fmt::Display for FiberError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberError::NotTerminated => write!(f, "fiber has not terminated"),
            FiberError::StackAllocation(errno) => {
                write!(f, "fiber stack allocation failed: errno {}", errno)
            }
        }
    }
}

impl std::error::Error for FiberError {}

/// Errors from reactor event registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactorError {
    /// The event bit is already registered on this fd
    AlreadyArmed,

    /// The fd has no context and none could be created
    BadDescriptor,

    /// The multiplexer rejected the operation (errno attached)
    Multiplexer(i32),

    /// Reactor setup failed (epoll/pipe creation, errno attached)
    Setup(i32),
}

impl fmt::Display for ReactorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReactorError::AlreadyArmed => write!(f, "event already armed on fd"),
            ReactorError::BadDescriptor => write!(f, "bad file descriptor"),
            ReactorError::Multiplexer(errno) => {
                write!(f, "multiplexer operation failed: errno {}", errno)
            }
            ReactorError::Setup(errno) => write!(f, "reactor setup failed: errno {}", errno),
        }
    }
}

impl std::error::Error for ReactorError {}

impl From<FiberError> for ReactorError {
    fn from(e: FiberError) -> Self {
        match e {
            FiberError::StackAllocation(errno) => ReactorError::Setup(errno),
            FiberError::NotTerminated => ReactorError::BadDescriptor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = ReactorError::AlreadyArmed;
        assert_eq!(format!("{}", e), "event already armed on fd");

        let e = ReactorError::Multiplexer(22);
        assert_eq!(format!("{}", e), "multiplexer operation failed: errno 22");

        let e = FiberError::NotTerminated;
        assert_eq!(format!("{}", e), "fiber has not terminated");
    }
}
