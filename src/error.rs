//! Error types for the voice conversation pipeline.

/// Top-level error type for the conversation orchestrator.
///
/// Variants map onto recovery classes: transient failures degrade the
/// current turn, protocol violations reset the offending collaborator,
/// cancellation unwinds quietly, and configuration errors are fatal at
/// startup only.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    /// Recoverable collaborator failure (network drop, timeout, 5xx).
    /// The session survives; the current turn is degraded.
    #[error("transient {component} error: {message}")]
    Transport {
        /// Collaborator that failed ("stt", "llm", "tts", "memory").
        component: &'static str,
        /// Underlying failure description.
        message: String,
    },

    /// Collaborator returned malformed frames or messages. The offending
    /// connection is reset; the current turn is not retried.
    #[error("protocol violation from {component}: {message}")]
    Protocol {
        component: &'static str,
        message: String,
    },

    /// Cooperative cancellation signal.
    #[error("cancelled")]
    Cancelled,

    /// Illegal state-machine transition.
    #[error("invalid transition: {from} on {event}")]
    InvalidTransition {
        /// State the machine was in.
        from: &'static str,
        /// Event that was rejected.
        event: &'static str,
    },

    /// Missing or invalid configuration. Fatal at startup.
    #[error("config error: {0}")]
    Config(String),

    /// Queue overflow, pool exhaustion. Degrade and log.
    #[error("resource exhausted: {0}")]
    Exhausted(String),

    /// Audio device or stream error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// Severity ordering used when joining producer/consumer errors at the
    /// turn boundary: the worst class wins.
    pub fn severity(&self) -> u8 {
        match self {
            Self::Cancelled => 0,
            Self::Exhausted(_) => 1,
            Self::Transport { .. } => 2,
            Self::Audio(_) | Self::Channel(_) | Self::Io(_) => 3,
            Self::Protocol { .. } => 4,
            Self::InvalidTransition { .. } => 5,
            Self::Config(_) => 6,
        }
    }

    /// Pick the worse of two errors by class.
    pub fn worse(self, other: Self) -> Self {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    /// Convenience constructor for transient collaborator failures.
    pub fn transport(component: &'static str, message: impl Into<String>) -> Self {
        Self::Transport {
            component,
            message: message.into(),
        }
    }

    /// Convenience constructor for protocol violations.
    pub fn protocol(component: &'static str, message: impl Into<String>) -> Self {
        Self::Protocol {
            component,
            message: message.into(),
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, VoiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_classes() {
        let cancelled = VoiceError::Cancelled;
        let transport = VoiceError::transport("llm", "connection reset");
        let protocol = VoiceError::protocol("stt", "bad frame");

        assert!(cancelled.severity() < transport.severity());
        assert!(transport.severity() < protocol.severity());
    }

    #[test]
    fn worse_picks_higher_class() {
        let joined = VoiceError::Cancelled.worse(VoiceError::transport("tts", "timeout"));
        assert!(matches!(joined, VoiceError::Transport { .. }));

        // Ties keep the first error.
        let joined = VoiceError::transport("llm", "a").worse(VoiceError::transport("tts", "b"));
        match joined {
            VoiceError::Transport { component, .. } => assert_eq!(component, "llm"),
            other => unreachable!("expected Transport, got {other:?}"),
        }
    }

    #[test]
    fn display_includes_component() {
        let err = VoiceError::transport("stt", "socket closed");
        assert_eq!(err.to_string(), "transient stt error: socket closed");
    }
}
