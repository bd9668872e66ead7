//! SMTP deliverability probing.
//!
//! The public entry point is [`Verifier::verify`], which groups the input
//! addresses by domain, dials the caller-supplied MX hosts, and drives one
//! RFC 5321 session per attempt up to `RCPT TO` (never DATA). Failures are
//! folded into per-address verdicts; the run as a whole always returns a
//! [`RunResults`].

mod error;
mod log;
mod options;
mod reply;
mod results;
mod session;
mod transcript;
mod transport;


pub use error::{FailureKind, SessionError};
pub use log::ProbeLog;
pub use options::{CommandTimeouts, ProxyConfig, VerifyOptions};
pub use reply::{ReplyCategory, SmtpReply};
pub use results::{CatchAllStatus, DomainInfo, RunResults, Verdict, VerdictPolicy};
pub use transcript::{classify_transcript, TranscriptOutcome};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::address::{Address, DomainBatch, DomainGroup};
use session::Session;

/// Drives verification runs. One live transport at a time; per-run
/// diagnostics land in [`Verifier::log`].
pub struct Verifier {
    options: VerifyOptions,
    rng: StdRng,
    log: ProbeLog,
}

impl Verifier {
    pub fn new(options: VerifyOptions) -> Self {
        let rng = StdRng::from_entropy();
        Self::with_rng(options, rng)
    }

    /// Deterministic MX selection for tests.
    pub fn with_rng(options: VerifyOptions, rng: StdRng) -> Self {
        let log = ProbeLog::new(options.debug);
        Self { options, rng, log }
    }

    pub fn options(&self) -> &VerifyOptions {
        &self.options
    }

    /// Diagnostics for the most recent run, oldest first.
    pub fn log(&self) -> &[String] {
        self.log.entries()
    }

    /// Verify every address in `emails` against the caller-supplied MX
    /// hosts. Never fails as a whole: transport and protocol failures land
    /// in per-address verdicts and [`RunResults::mail_error`].
    pub fn verify<I, S>(&mut self, emails: I, mxs: &[String]) -> RunResults
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.log.clear();
        let batch = DomainBatch::new(emails);
        let mut results = RunResults::new(self.options.policy());

        for (input, err) in batch.rejected() {
            self.log
                .note(&format!("rejecting malformed address '{input}': {err}"));
            results.record(input, Verdict::Rejected);
        }

        for group in batch.groups() {
            verify_domain(
                &self.options,
                &mut self.rng,
                &mut self.log,
                group,
                mxs,
                &mut results,
            );
        }
        results
    }

    /// Apply a recorded tunneled-session transcript to a batch of
    /// addresses, bulk-setting every verdict from the single recovered
    /// outcome (the "cURL mode" companion to [`Verifier::verify`]).
    pub fn classify_transcript_run<I, S, T>(&mut self, emails: I, transcript: &[T]) -> RunResults
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        T: AsRef<str>,
    {
        self.log.clear();
        let batch = DomainBatch::new(emails);
        let mut results = RunResults::new(self.options.policy());

        for (input, err) in batch.rejected() {
            self.log
                .note(&format!("rejecting malformed address '{input}': {err}"));
            results.record(input, Verdict::Rejected);
        }

        let outcome = classify_transcript(transcript);
        match &outcome {
            TranscriptOutcome::Accepted(raw) => {
                self.log.note(&format!("transcript: accepted ({})", raw.trim_end()));
                results.pass_res.push(raw.clone());
            }
            TranscriptOutcome::Rejected => self.log.note("transcript: rejected"),
            TranscriptOutcome::Failure { detail, .. } => {
                self.log.note(&format!("transcript: {detail}"));
                results.mail_error = Some(detail.clone());
            }
        }

        for group in batch.groups() {
            results.record_domain(
                &group.domain,
                DomainInfo {
                    users: group.recipients.iter().map(|a| a.local.clone()).collect(),
                    mxs: Vec::new(),
                    catchall: CatchAllStatus::NotTested,
                },
            );
            for addr in &group.recipients {
                let verdict = match &outcome {
                    TranscriptOutcome::Accepted(raw) => Verdict::Accepted(raw.clone()),
                    TranscriptOutcome::Rejected => Verdict::Rejected,
                    TranscriptOutcome::Failure { kind, detail } => Verdict::Inconclusive {
                        kind: *kind,
                        detail: detail.clone(),
                    },
                };
                results.record(&addr.original, verdict);
            }
        }
        results
    }
}

fn verify_domain(
    options: &VerifyOptions,
    rng: &mut StdRng,
    log: &mut ProbeLog,
    group: &DomainGroup,
    mxs: &[String],
    results: &mut RunResults,
) {
    let domain = group.domain.as_str();
    let mut sorted = mxs.to_vec();
    sorted.sort();

    results.record_domain(
        domain,
        DomainInfo {
            users: group.recipients.iter().map(|a| a.local.clone()).collect(),
            mxs: sorted.clone(),
            catchall: CatchAllStatus::NotTested,
        },
    );

    let mut pending: Vec<&Address> = group.recipients.iter().collect();

    if sorted.is_empty() {
        let detail = format!("no MX hosts supplied for {domain}");
        log.note(&detail);
        results.mail_error = Some(detail.clone());
        for addr in &pending {
            results.record(
                &addr.original,
                Verdict::Inconclusive {
                    kind: FailureKind::Connection,
                    detail: detail.clone(),
                },
            );
        }
        return;
    }

    // qq.com-class operators spread mailbox existence across exchangers,
    // so those domains get every MX; everyone else gets one random pick
    let candidates: Vec<&str> = if options.probe_all_mx(domain) {
        log.note(&format!("{domain}: probing every MX"));
        sorted.iter().map(String::as_str).collect()
    } else {
        let pick = rng.gen_range(0..sorted.len());
        log.note(&format!(
            "{domain}: picked MX {} of {}",
            pick + 1,
            sorted.len()
        ));
        vec![sorted[pick].as_str()]
    };

    let mut last_failure: Option<SessionError> = None;
    for mx in candidates {
        match probe_mx(options, log, mx, domain, &mut pending, results) {
            Ok(()) => {}
            Err(err) => {
                log.note(&format!("! {err}"));
                results.mail_error = Some(err.to_string());
                last_failure = Some(err);
            }
        }
        if pending.is_empty() {
            break;
        }
    }

    if !pending.is_empty() {
        let (kind, detail) = match &last_failure {
            Some(err) => (err.kind(), err.to_string()),
            None => (
                FailureKind::Communication,
                format!("no verdict reached for {domain}"),
            ),
        };
        for addr in &pending {
            results.record(
                &addr.original,
                Verdict::Inconclusive {
                    kind,
                    detail: detail.clone(),
                },
            );
        }
    }
}

/// One MX attempt: fresh session, fresh state. Verdicts observed before a
/// failure stay recorded; the caller retries only what is still pending.
fn probe_mx<'g>(
    options: &VerifyOptions,
    log: &mut ProbeLog,
    mx: &str,
    domain: &str,
    pending: &mut Vec<&'g Address>,
    results: &mut RunResults,
) -> Result<(), SessionError> {
    let mut session = Session::open(mx, options, log)?;
    let outcome = run_dialogue(options, &mut session, domain, pending, results);
    session.quit();
    outcome
}

fn run_dialogue<'g>(
    options: &VerifyOptions,
    session: &mut Session<'_>,
    domain: &str,
    pending: &mut Vec<&'g Address>,
    results: &mut RunResults,
) -> Result<(), SessionError> {
    session.ehlo()?;
    session.mail_from()?;

    let mut rcpt_sent = false;
    if options.catchall_test {
        match session.probe_catch_all(domain) {
            Ok(CatchAllStatus::Detected) => {
                results.set_catchall(domain, CatchAllStatus::Detected);
                // the verdict covers every address on the domain; probing
                // them individually would only echo it
                for addr in pending.drain(..) {
                    results.record(&addr.original, Verdict::CatchAll);
                }
                let _ = session.rset();
                return Ok(());
            }
            Ok(_) => {
                results.set_catchall(domain, CatchAllStatus::NotDetected);
                rcpt_sent = true;
            }
            Err(err) => {
                results.set_catchall(domain, CatchAllStatus::Indeterminate);
                return Err(err);
            }
        }
    }

    while let Some(addr) = pending.first().copied() {
        if rcpt_sent {
            session.noop()?;
        }
        let reply = session.rcpt_to(&addr.forward_path())?;
        rcpt_sent = true;
        let verdict = classify_rcpt(&reply, options.greylisted_considered_valid);
        match &verdict {
            Verdict::Accepted(raw) | Verdict::Greylisted(raw) => results.pass_res.push(raw.clone()),
            _ => {}
        }
        results.record(&addr.original, verdict);
        pending.remove(0);
    }

    session.rset()?;
    Ok(())
}

fn classify_rcpt(reply: &SmtpReply, greylist_ok: bool) -> Verdict {
    match reply.category() {
        ReplyCategory::Success | ReplyCategory::UserNotLocal => {
            Verdict::Accepted(reply.raw.clone())
        }
        ReplyCategory::Greylisted if greylist_ok => Verdict::Greylisted(reply.raw.clone()),
        _ => Verdict::Rejected,
    }
}

#[cfg(test)]
mod dispatch_tests {
    use super::*;

    #[test]
    fn classify_rcpt_follows_greylist_flag() {
        let deferred = SmtpReply {
            code: Some(451),
            raw: "451 try later\r\n".to_string(),
        };
        assert!(matches!(
            classify_rcpt(&deferred, true),
            Verdict::Greylisted(_)
        ));
        assert!(matches!(classify_rcpt(&deferred, false), Verdict::Rejected));

        let accepted = SmtpReply {
            code: Some(251),
            raw: "251 forwarded\r\n".to_string(),
        };
        assert!(matches!(classify_rcpt(&accepted, false), Verdict::Accepted(_)));

        let unknown = SmtpReply {
            code: Some(299),
            raw: "299 ??\r\n".to_string(),
        };
        assert!(matches!(classify_rcpt(&unknown, true), Verdict::Rejected));
    }

    #[test]
    fn no_mx_hosts_bulk_sets_connection_fallback() {
        let mut verifier = Verifier::new(VerifyOptions::default());
        let results = verifier.verify(["a@nomx.test", "b@nomx.test"], &[]);
        for addr in ["a@nomx.test", "b@nomx.test"] {
            assert!(matches!(
                results.verdict(addr),
                Some(Verdict::Inconclusive {
                    kind: FailureKind::Connection,
                    ..
                })
            ));
            assert_eq!(results.is_deliverable(addr), Some(false));
        }
        assert!(results.mail_error.is_some());
        let info = results.domain("nomx.test").expect("domain info");
        assert_eq!(info.users, ["a", "b"]);
        assert!(info.mxs.is_empty());
    }

    #[test]
    fn malformed_addresses_are_rejected_individually() {
        let mut verifier = Verifier::new(VerifyOptions::default());
        let results = verifier.verify(["not-an-address"], &[]);
        assert_eq!(results.verdict("not-an-address"), Some(&Verdict::Rejected));
        assert_eq!(results.is_deliverable("not-an-address"), Some(false));
    }
}
