use thiserror::Error;

/// Which wait ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Frame was not accepted onto the bus in time.
    Send,
    /// No reply frame from the peer.
    Response,
    /// No ISO-TP flow control after a first frame or block.
    FlowControl,
    /// No TP2.0 acknowledgement.
    Ack,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AutomotiveError {
    // Recoverable wait failures
    #[error("Operation timed out ({0:?})")]
    Timeout(TimeoutKind),

    // Protocol errors
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("Negative response, NRC 0x{0:02X}")]
    NegativeResponse(u8),
    #[error("Peer refused the frame (NACK)")]
    Nack,
    #[error("Channel setup rejected with status 0x{0:02X}")]
    ChannelRejected(u8),

    // Resource exhaustion
    #[error("Acceptance filter table is full")]
    FilterTableFull,
    #[error("Payload of {0} bytes exceeds the protocol limit")]
    PayloadTooLarge(usize),

    // Session and parameter errors
    #[error("Filter entry not found")]
    FilterNotFound,
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("No diagnostic session is open")]
    NotInSession,
    #[error("Session closed by peer")]
    SessionClosed,

    // Platform errors
    #[error("CAN link error: {0}")]
    LinkError(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AutomotiveError {
    /// True for errors that only abort the current exchange.
    pub fn is_timeout(&self) -> bool {
        matches!(self, AutomotiveError::Timeout(_))
    }
}

impl From<toml::de::Error> for AutomotiveError {
    fn from(err: toml::de::Error) -> Self {
        AutomotiveError::Config(err.to_string())
    }
}

impl From<std::io::Error> for AutomotiveError {
    fn from(err: std::io::Error) -> Self {
        AutomotiveError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AutomotiveError>;
