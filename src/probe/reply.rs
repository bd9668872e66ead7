//! SMTP reply model and numeric-code classification.

/// One logical SMTP reply, all continuation lines drained.
#[cfg_attr(feature = "with-serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpReply {
    /// Code of the final line. `None` when the server sent unframed text
    /// (seen in the wild on NOOP).
    pub code: Option<u16>,
    /// Concatenated reply lines, CRLF terminators preserved.
    pub raw: String,
}

impl SmtpReply {
    pub fn category(&self) -> ReplyCategory {
        match self.code {
            Some(code) => ReplyCategory::from_code(code),
            None => ReplyCategory::Unknown,
        }
    }

    pub fn code_is(&self, expected: &[u16]) -> bool {
        self.code.map(|c| expected.contains(&c)).unwrap_or(false)
    }

    /// Reply text without the trailing newline, for diagnostics.
    pub fn trimmed(&self) -> &str {
        self.raw.trim_end_matches(['\r', '\n'])
    }
}

/// What a reply code means for the probe.
#[cfg_attr(feature = "with-serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCategory {
    /// 220: greeting banner, also acceptable after QUIT.
    ConnectBanner,
    /// 221: closing channel.
    QuitOk,
    /// 250: requested action completed.
    Success,
    /// 251: user not local, will forward. Success for RCPT purposes.
    UserNotLocal,
    /// 252: cannot VRFY but will attempt delivery.
    CannotVerify,
    /// 421: service shutting down. Fatal for the session no matter which
    /// command solicited it.
    ServiceUnavailable,
    /// 450/451/452: transient mailbox or storage deferral, the greylisting
    /// family.
    Greylisted,
    /// 500/502/503: syntax error or bad command sequence.
    SyntaxOrSequence,
    /// 550: mailbox unavailable.
    MailboxUnavailable,
    /// 554: transaction failed.
    TransactionFailed,
    Unknown,
}

impl ReplyCategory {
    pub fn from_code(code: u16) -> Self {
        match code {
            220 => Self::ConnectBanner,
            221 => Self::QuitOk,
            250 => Self::Success,
            251 => Self::UserNotLocal,
            252 => Self::CannotVerify,
            421 => Self::ServiceUnavailable,
            450 | 451 | 452 => Self::Greylisted,
            500 | 502 | 503 => Self::SyntaxOrSequence,
            550 => Self::MailboxUnavailable,
            554 => Self::TransactionFailed,
            _ => Self::Unknown,
        }
    }
}
