//! Error types for the Aurora Mirror replication engine.
//!
//! The engine uses structured error handling with detailed context for
//! debugging and observability. Background work distinguishes transient
//! conditions (retried by re-arming a timer or re-queueing) from hard
//! failures that escalate into a connection state change.

/// Result type alias for replication-engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Comprehensive error types for replication-engine operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Hard I/O error from the lower block device or the meta-data device
    #[error("I/O error: {message}")]
    Io {
        /// Descriptive error message
        message: String,
    },

    /// Resource contention; the operation should be retried later
    #[error("resource temporarily unavailable: {message}")]
    WouldBlock {
        /// Descriptive error message
        message: String,
    },

    /// A blocking wait was interrupted by a signal or shutdown request
    #[error("interrupted: {message}")]
    Interrupted {
        /// Descriptive error message
        message: String,
    },

    /// Allocation pressure; transient for background work
    #[error("resource exhausted: {resource}")]
    ResourceExhausted {
        /// The exhausted resource type
        resource: String,
    },

    /// The transport stream is not connected
    #[error("transport disconnected: {message}")]
    Disconnected {
        /// Descriptive error message
        message: String,
    },

    /// Replication protocol errors (framing, unexpected message)
    #[error("protocol error: {message}")]
    Protocol {
        /// Descriptive error message
        message: String,
    },

    /// Configuration errors
    #[error("configuration error: {message}")]
    Config {
        /// Descriptive error message
        message: String,
    },

    /// A requested state transition was refused by the state machinery
    #[error("state change refused: {message}")]
    StateChange {
        /// Descriptive error message
        message: String,
    },

    /// Installing a resync-after dependency would create a cycle
    #[error("resync-after dependency cycle via device {minor}")]
    SyncAfterCycle {
        /// Minor number of the device closing the cycle
        minor: u32,
    },

    /// The resync-after target device does not exist
    #[error("unknown resync-after device {minor}")]
    SyncAfterUnknown {
        /// Minor number that could not be resolved
        minor: u32,
    },
}

impl Error {
    /// Create a hard I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create a transient "try again" error
    pub fn would_block<S: Into<String>>(message: S) -> Self {
        Self::WouldBlock {
            message: message.into(),
        }
    }

    /// Create an interrupted-wait error
    pub fn interrupted<S: Into<String>>(message: S) -> Self {
        Self::Interrupted {
            message: message.into(),
        }
    }

    /// Create a resource-exhaustion error
    pub fn resource_exhausted<S: Into<String>>(resource: S) -> Self {
        Self::ResourceExhausted {
            resource: resource.into(),
        }
    }

    /// Create a transport-down error
    pub fn disconnected<S: Into<String>>(message: S) -> Self {
        Self::Disconnected {
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a state-change-refused error
    pub fn state_change<S: Into<String>>(message: S) -> Self {
        Self::StateChange {
            message: message.into(),
        }
    }

    /// Check whether this error should be retried rather than escalated
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::WouldBlock { .. } | Self::ResourceExhausted { .. }
        )
    }

    /// Get error category for metrics and monitoring
    pub fn category(&self) -> &'static str {
        match self {
            Self::Io { .. } => "io",
            Self::WouldBlock { .. } => "would_block",
            Self::Interrupted { .. } => "interrupted",
            Self::ResourceExhausted { .. } => "resource",
            Self::Disconnected { .. } => "disconnected",
            Self::Protocol { .. } => "protocol",
            Self::Config { .. } => "config",
            Self::StateChange { .. } => "state",
            Self::SyncAfterCycle { .. } | Self::SyncAfterUnknown { .. } => "sync_after",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::would_block("al busy").is_transient());
        assert!(Error::resource_exhausted("digest buffer").is_transient());
        assert!(!Error::io("disk broke down").is_transient());
        assert!(!Error::disconnected("stream gone").is_transient());
    }

    #[test]
    fn test_category() {
        assert_eq!(Error::io("x").category(), "io");
        assert_eq!(Error::SyncAfterCycle { minor: 3 }.category(), "sync_after");
    }
}
