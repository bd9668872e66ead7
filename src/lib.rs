#![forbid(unsafe_code)]
//! mailprobe — SMTP mailbox deliverability probing (RCPT TO, no DATA)
//!
//! The crate drives an RFC 5321 dialogue against caller-supplied mail
//! exchangers up to, but not including, the DATA phase, and classifies each
//! recipient address as accepted, rejected, greylisted, catch-all, or
//! inconclusive. The public entry point is [`Verifier::verify`].

pub mod address;
pub mod probe;

pub use address::{Address, AddressError, DomainBatch};
pub use probe::{
    classify_transcript, CatchAllStatus, CommandTimeouts, DomainInfo, FailureKind, ProbeLog,
    ProxyConfig, ReplyCategory, RunResults, SessionError, SmtpReply, TranscriptOutcome, Verdict,
    VerdictPolicy, Verifier, VerifyOptions,
};
