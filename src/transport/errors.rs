use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport disconnected")]
    Disconnected,
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("address not found: {0}")]
    AddressNotFound(String),
    #[error("host unreachable: {0}")]
    Unreachable(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("host rejected connection: {0}")]
    Rejected(String),
    #[error("crypt error: {0}")]
    Crypt(String),
    #[error("codec error: {0}")]
    Codec(String),
}

impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        TransportError::Io(error.to_string())
    }
}

/// Process exit codes understood by the host application.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    Exception = 12,
    Mismatch = 13,
    AudioFailure = 14,
    FailedToFindAddress = 15,
    FailedToConnect = 16,
    Disconnected = 17,
    UserNameTaken = 18,
    InvalidPassword = 19,
    HostRejected = 20,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Why a session ended. Each cause maps onto a distinct exit code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    Closed,
    AddressNotFound(String),
    ConnectFailed(String),
    HostRejected(String),
    Rejected(String),
    Disconnected(String),
    HostTimeout,
    AudioFailure(String),
    Failed(String),
}

impl SessionOutcome {
    /// Maps a server reject or disconnect reason onto an outcome, matching the
    /// reason strings the server uses for name clashes and bad passwords.
    pub fn from_reject_reason(reason: &str) -> Self {
        SessionOutcome::Rejected(reason.to_string())
    }

    pub fn exit_code(&self) -> ExitCode {
        match self {
            SessionOutcome::Closed => ExitCode::Success,
            SessionOutcome::AddressNotFound(_) => ExitCode::FailedToFindAddress,
            SessionOutcome::ConnectFailed(_) => ExitCode::FailedToConnect,
            SessionOutcome::HostRejected(_) => ExitCode::HostRejected,
            SessionOutcome::Rejected(reason) => match reason.as_str() {
                "Username already in use" => ExitCode::UserNameTaken,
                "Invalid server password" => ExitCode::InvalidPassword,
                _ => ExitCode::Disconnected,
            },
            SessionOutcome::Disconnected(_) => ExitCode::Disconnected,
            SessionOutcome::HostTimeout => ExitCode::Mismatch,
            SessionOutcome::AudioFailure(_) => ExitCode::AudioFailure,
            SessionOutcome::Failed(_) => ExitCode::Exception,
        }
    }
}

impl From<&TransportError> for SessionOutcome {
    fn from(error: &TransportError) -> Self {
        match error {
            TransportError::Unreachable(message) => SessionOutcome::ConnectFailed(message.clone()),
            TransportError::Handshake(message) => SessionOutcome::ConnectFailed(message.clone()),
            TransportError::Rejected(message) => SessionOutcome::HostRejected(message.clone()),
            TransportError::AddressNotFound(message) => {
                SessionOutcome::AddressNotFound(message.clone())
            }
            TransportError::InvalidConfig(message) => SessionOutcome::Failed(message.clone()),
            TransportError::Codec(message) => SessionOutcome::AudioFailure(message.clone()),
            other => SessionOutcome::Disconnected(other.to_string()),
        }
    }
}
