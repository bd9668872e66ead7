//! Probe configuration.

use std::borrow::Cow;
use std::time::Duration;

use crate::probe::results::VerdictPolicy;

/// HTTP-CONNECT proxy endpoint for tunneled probes.
#[cfg_attr(feature = "with-serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
}

/// Per-command read deadlines. The defaults follow the generous RFC 5321
/// §4.5.3.2 tradition; `connected` doubles as the TCP connect timeout and
/// the baseline read deadline.
#[cfg_attr(feature = "with-serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTimeouts {
    pub connected: Duration,
    pub ehlo: Duration,
    pub mail: Duration,
    pub rcpt: Duration,
    pub rset: Duration,
    pub quit: Duration,
    pub noop: Duration,
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self {
            connected: Duration::from_secs(10),
            ehlo: Duration::from_secs(120),
            mail: Duration::from_secs(300),
            rcpt: Duration::from_secs(300),
            rset: Duration::from_secs(30),
            quit: Duration::from_secs(60),
            noop: Duration::from_secs(60),
        }
    }
}

/// Configuration knobs for [`Verifier`](crate::probe::Verifier).
#[cfg_attr(feature = "with-serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyOptions {
    pub port: u16,
    /// `MAIL FROM` identity; the domain part doubles as the `EHLO`
    /// argument. An empty string sends a null reverse-path (`<>`).
    pub sender: String,
    pub timeouts: CommandTimeouts,
    /// Probe a random mailbox per domain to detect catch-all behaviour.
    pub catchall_test: bool,
    /// Whether a catch-all domain counts its addresses as deliverable.
    pub catchall_is_valid: bool,
    /// Fallback verdict when the conversation broke mid-session.
    pub no_comm_is_valid: bool,
    /// Fallback verdict when no TCP connection could be established.
    pub no_conn_is_valid: bool,
    /// Treat 450/451/452 on RCPT as acceptance.
    pub greylisted_considered_valid: bool,
    /// Mirror diagnostics log entries to stdout.
    pub debug: bool,
    /// Domains probed on every MX instead of one random pick. Operators of
    /// these domains spread mailbox existence across their exchangers.
    pub probe_all_domains: Vec<String>,
    pub proxy: Option<ProxyConfig>,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            port: 25,
            sender: "user@localhost".to_string(),
            timeouts: CommandTimeouts::default(),
            catchall_test: false,
            catchall_is_valid: true,
            no_comm_is_valid: false,
            no_conn_is_valid: false,
            greylisted_considered_valid: true,
            debug: false,
            probe_all_domains: vec!["qq.com".to_string()],
            proxy: None,
        }
    }
}

impl VerifyOptions {
    /// Domain part of the sender, used as the `EHLO` hostname.
    pub fn ehlo_domain(&self) -> Cow<'_, str> {
        match self.sender.rsplit_once('@') {
            Some((_, domain)) if !domain.is_empty() => Cow::Borrowed(domain),
            _ => Cow::Borrowed("localhost"),
        }
    }

    pub fn probe_all_mx(&self, domain: &str) -> bool {
        self.probe_all_domains
            .iter()
            .any(|d| d.eq_ignore_ascii_case(domain))
    }

    pub(crate) fn policy(&self) -> VerdictPolicy {
        VerdictPolicy {
            catchall_is_valid: self.catchall_is_valid,
            no_comm_is_valid: self.no_comm_is_valid,
            no_conn_is_valid: self.no_conn_is_valid,
            greylisted_considered_valid: self.greylisted_considered_valid,
        }
    }
}
