//! Verdicts and the aggregated result map.

use crate::probe::error::FailureKind;

/// The verifier's conclusion for one address.
#[cfg_attr(feature = "with-serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// `RCPT TO` accepted; holds the server's raw acceptance text.
    Accepted(String),
    Rejected,
    /// Deferred with 450/451/452 while greylisting counts as acceptance.
    Greylisted(String),
    /// The domain accepts any local part, so the probe proves nothing about
    /// this mailbox in particular.
    CatchAll,
    /// No conclusive SMTP answer; the kind selects the fallback policy flag.
    Inconclusive { kind: FailureKind, detail: String },
}

/// Flags that coerce non-definitive verdicts one way or the other.
#[cfg_attr(feature = "with-serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerdictPolicy {
    pub catchall_is_valid: bool,
    pub no_comm_is_valid: bool,
    pub no_conn_is_valid: bool,
    pub greylisted_considered_valid: bool,
}

impl Verdict {
    pub fn is_deliverable(&self, policy: &VerdictPolicy) -> bool {
        match self {
            Self::Accepted(_) => true,
            Self::Rejected => false,
            Self::Greylisted(_) => policy.greylisted_considered_valid,
            Self::CatchAll => policy.catchall_is_valid,
            Self::Inconclusive { kind, .. } => match kind {
                FailureKind::Connection => policy.no_conn_is_valid,
                FailureKind::Communication => policy.no_comm_is_valid,
            },
        }
    }
}

/// Catch-all determination for one domain.
#[cfg_attr(feature = "with-serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchAllStatus {
    NotTested,
    Detected,
    NotDetected,
    /// The server dropped the connection during the probe. Deliberately not
    /// folded into `NotDetected`: some MTAs hang up on suspicious probes.
    Indeterminate,
}

/// Per-domain record in the run results.
#[cfg_attr(feature = "with-serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainInfo {
    /// Local parts verified on this domain, input order.
    pub users: Vec<String>,
    /// The sorted MX list the dispatcher worked from.
    pub mxs: Vec<String>,
    pub catchall: CatchAllStatus,
}

/// Result of one verification run.
///
/// The entry order preserves input order per domain; keys are the original
/// input strings, case intact. Failures never escape a run: the last
/// transport or protocol failure message lands in `mail_error`.
#[cfg_attr(feature = "with-serde", derive(serde::Serialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct RunResults {
    policy: VerdictPolicy,
    entries: Vec<(String, Verdict)>,
    domains: Vec<(String, DomainInfo)>,
    pub mail_error: Option<String>,
    /// Raw accepted RCPT replies, in RCPT order, for callers who need the
    /// servers' exact acceptance text.
    pub pass_res: Vec<String>,
}

impl RunResults {
    pub(crate) fn new(policy: VerdictPolicy) -> Self {
        Self {
            policy,
            entries: Vec::new(),
            domains: Vec::new(),
            mail_error: None,
            pass_res: Vec::new(),
        }
    }

    /// Record (or overwrite) the verdict for one address.
    pub(crate) fn record(&mut self, original: &str, verdict: Verdict) {
        match self.entries.iter_mut().find(|(key, _)| key == original) {
            Some((_, slot)) => *slot = verdict,
            None => self.entries.push((original.to_string(), verdict)),
        }
    }

    pub(crate) fn record_domain(&mut self, domain: &str, info: DomainInfo) {
        match self.domains.iter_mut().find(|(key, _)| key == domain) {
            Some((_, slot)) => *slot = info,
            None => self.domains.push((domain.to_string(), info)),
        }
    }

    pub(crate) fn set_catchall(&mut self, domain: &str, status: CatchAllStatus) {
        if let Some((_, info)) = self.domains.iter_mut().find(|(key, _)| key == domain) {
            info.catchall = status;
        }
    }

    pub fn verdict(&self, address: &str) -> Option<&Verdict> {
        self.entries
            .iter()
            .find(|(key, _)| key == address)
            .map(|(_, verdict)| verdict)
    }

    /// The verdict coerced through the policy flags.
    pub fn is_deliverable(&self, address: &str) -> Option<bool> {
        self.verdict(address)
            .map(|verdict| verdict.is_deliverable(&self.policy))
    }

    /// All verdicts, input order preserved per domain.
    pub fn entries(&self) -> &[(String, Verdict)] {
        &self.entries
    }

    pub fn domain(&self, domain: &str) -> Option<&DomainInfo> {
        self.domains
            .iter()
            .find(|(key, _)| key == domain)
            .map(|(_, info)| info)
    }

    pub fn domains(&self) -> &[(String, DomainInfo)] {
        &self.domains
    }

    pub fn policy(&self) -> &VerdictPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> VerdictPolicy {
        VerdictPolicy {
            catchall_is_valid: true,
            no_comm_is_valid: false,
            no_conn_is_valid: false,
            greylisted_considered_valid: true,
        }
    }

    #[test]
    fn accepted_and_rejected_ignore_flags() {
        let p = policy();
        assert!(Verdict::Accepted("250 ok\r\n".to_string()).is_deliverable(&p));
        assert!(!Verdict::Rejected.is_deliverable(&p));
    }

    #[test]
    fn greylist_follows_flag() {
        let mut p = policy();
        let verdict = Verdict::Greylisted("451 try later\r\n".to_string());
        assert!(verdict.is_deliverable(&p));
        p.greylisted_considered_valid = false;
        assert!(!verdict.is_deliverable(&p));
    }

    #[test]
    fn catchall_follows_flag() {
        let mut p = policy();
        assert!(Verdict::CatchAll.is_deliverable(&p));
        p.catchall_is_valid = false;
        assert!(!Verdict::CatchAll.is_deliverable(&p));
    }

    #[test]
    fn inconclusive_picks_flag_by_kind() {
        let mut p = policy();
        p.no_conn_is_valid = true;
        let conn = Verdict::Inconclusive {
            kind: FailureKind::Connection,
            detail: "refused".to_string(),
        };
        let comm = Verdict::Inconclusive {
            kind: FailureKind::Communication,
            detail: "421 busy".to_string(),
        };
        assert!(conn.is_deliverable(&p));
        assert!(!comm.is_deliverable(&p));
    }

    #[test]
    fn record_overwrites_in_place() {
        let mut results = RunResults::new(policy());
        results.record("a@d.test", Verdict::Accepted("250 ok\r\n".to_string()));
        results.record("b@d.test", Verdict::Rejected);
        results.record("a@d.test", Verdict::CatchAll);
        assert_eq!(results.entries().len(), 2);
        assert_eq!(results.entries()[0].0, "a@d.test");
        assert_eq!(results.verdict("a@d.test"), Some(&Verdict::CatchAll));
        assert_eq!(results.is_deliverable("missing@d.test"), None);
    }
}
