use std::io;

use thiserror::Error;

/// The two failure families the bulk-verdict policy distinguishes.
#[cfg_attr(feature = "with-serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// TCP connect refused or unreachable; falls back to `no_conn_is_valid`.
    Connection,
    /// Anything that broke an established conversation; falls back to
    /// `no_comm_is_valid`.
    Communication,
}

/// Errors that end (or refuse to start) an SMTP probe session.
///
/// The dispatcher never propagates these out of a run; it matches on
/// [`SessionError::kind`] to pick the bulk fallback verdict and records the
/// display text as the run's `mail_error`.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection to {host} failed: {source}")]
    NoConnection {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("timed out waiting for reply to {command} from {host}")]
    Timeout { host: String, command: String },
    #[error("{host} closed the connection during {command}")]
    NoResponse { host: String, command: String },
    #[error("unexpected reply to {command} from {host}: {reply}")]
    UnexpectedReply {
        host: String,
        command: String,
        reply: String,
    },
    #[error("failed to send {command} to {host}: {source}")]
    SendFailed {
        host: String,
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("EHLO must be accepted before MAIL FROM")]
    NoHelo,
    #[error("MAIL FROM must be accepted before RCPT TO")]
    NoMailFrom,
}

impl SessionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::NoConnection { .. } => FailureKind::Connection,
            _ => FailureKind::Communication,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connect_failures_are_connection_kind() {
        let err = SessionError::NoConnection {
            host: "mx.test".to_string(),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert_eq!(err.kind(), FailureKind::Connection);

        let err = SessionError::Timeout {
            host: "mx.test".to_string(),
            command: "EHLO".to_string(),
        };
        assert_eq!(err.kind(), FailureKind::Communication);

        let err = SessionError::UnexpectedReply {
            host: "mx.test".to_string(),
            command: "EHLO".to_string(),
            reply: "421 busy".to_string(),
        };
        assert_eq!(err.kind(), FailureKind::Communication);
        assert!(err.to_string().contains("421 busy"));
    }
}
