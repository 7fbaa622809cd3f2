//! Error types for the tracing runtime
//!
//! Policy: configuration, resource and protocol errors at init are fatal;
//! stack-depth overflow is fatal; argument overflow degrades (the payload is
//! dropped, the record still goes out); buffer-full drops are `losts`
//! accounting, not errors.

use core::fmt;

/// Result type for runtime operations
pub type TraceResult<T> = Result<T, TraceError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceError {
    /// Bad environment value, unreadable exe, invalid config combination
    Config(&'static str),

    /// A kernel resource could not be obtained
    Resource(ResourceError),

    /// Short or failed write on the control pipe
    Protocol(&'static str),

    /// A bounded structure ran out of room
    Overflow(OverflowError),
}

impl fmt::Display for TraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceError::Config(msg) => write!(f, "configuration error: {}", msg),
            TraceError::Resource(e) => write!(f, "resource error: {}", e),
            TraceError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            TraceError::Overflow(e) => write!(f, "overflow: {}", e),
        }
    }
}

impl std::error::Error for TraceError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceError {
    /// shm_open failed
    ShmOpen,
    /// ftruncate on a fresh segment failed
    ShmResize,
    /// mmap of a segment failed
    ShmMap,
    /// The pipe fd from the environment is not a FIFO
    BadPipeFd,
    /// Could not read the OS entropy source
    Entropy,
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceError::ShmOpen => write!(f, "cannot open shmem segment"),
            ResourceError::ShmResize => write!(f, "cannot resize shmem segment"),
            ResourceError::ShmMap => write!(f, "cannot map shmem segment"),
            ResourceError::BadPipeFd => write!(f, "pipe fd is not a FIFO"),
            ResourceError::Entropy => write!(f, "cannot read entropy source"),
        }
    }
}

impl From<ResourceError> for TraceError {
    fn from(e: ResourceError) -> Self {
        TraceError::Resource(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowError {
    /// Call nesting exceeded the configured max stack depth
    StackDepth,
    /// Packed argument payload does not fit one argbuf slot
    ArgPayload,
}

impl fmt::Display for OverflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverflowError::StackDepth => write!(f, "too deeply nested calls"),
            OverflowError::ArgPayload => write!(f, "argument data is too big"),
        }
    }
}

impl From<OverflowError> for TraceError {
    fn from(e: OverflowError) -> Self {
        TraceError::Overflow(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let e = TraceError::from(ResourceError::ShmMap);
        assert_eq!(format!("{}", e), "resource error: cannot map shmem segment");

        let e = TraceError::from(OverflowError::StackDepth);
        assert_eq!(format!("{}", e), "overflow: too deeply nested calls");
    }

    #[test]
    fn test_conversion() {
        let e: TraceError = ResourceError::BadPipeFd.into();
        assert!(matches!(e, TraceError::Resource(ResourceError::BadPipeFd)));
    }
}
