use thiserror::Error;

/// Errors surfaced by an endpoint driver to the application.
///
/// The same value may be delivered to several callbacks (handshake, read, and
/// pending writes), so payloads are owned strings rather than wrapped source
/// errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("early data rejected by peer")]
    EarlyDataRejected,
    #[error("transport already open")]
    AlreadyOpen,
    #[error("no underlying transport")]
    NoUnderlyingSocket,
    #[error("handshake not complete")]
    HandshakeNotComplete,
    #[error("operation canceled: {0}")]
    Canceled(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl EndpointError {
    /// Cancellation error used when a close tears down outstanding work.
    pub fn closed_locally() -> Self {
        EndpointError::Canceled("transport closed locally".to_string())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        EndpointError::Protocol(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_render_lowercase() {
        assert_eq!(
            EndpointError::EarlyDataRejected.to_string(),
            "early data rejected by peer"
        );
        assert_eq!(
            EndpointError::protocol("bad finished").to_string(),
            "protocol error: bad finished"
        );
        assert_eq!(
            EndpointError::closed_locally().to_string(),
            "operation canceled: transport closed locally"
        );
    }
}
