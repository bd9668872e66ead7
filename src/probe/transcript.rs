//! Classification of tunneled-session transcripts.
//!
//! A CONNECT-tunneled probe may only be observable through its recorded
//! transcript. These patterns recover the session outcome from the lines,
//! in the order the failures would have occurred on the wire.

use regex::Regex;

use crate::probe::error::FailureKind;

/// Outcome recovered from a transcript.
#[cfg_attr(feature = "with-serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptOutcome {
    /// The recipient `RCPT TO` drew a 250; holds the acceptance line.
    Accepted(String),
    Rejected,
    Failure { kind: FailureKind, detail: String },
}

/// Classify a transcript. Lines may carry arbitrary prefixes (timestamps);
/// all patterns match anywhere in the line.
pub fn classify_transcript<S: AsRef<str>>(lines: &[S]) -> TranscriptOutcome {
    let lines: Vec<&str> = lines.iter().map(AsRef::as_ref).collect();
    let find = |needle: &str| lines.iter().position(|l| l.contains(needle));

    if find("too many connections").is_some() {
        return failure(
            FailureKind::Communication,
            "server refused: too many connections",
        );
    }
    if find("Connection reset by peer").is_some() {
        return failure(FailureKind::Communication, "connection reset by peer");
    }
    let connect_failed = Regex::new(r"connect to \S+ port \d+ failed").unwrap();
    if let Some(line) = lines.iter().find(|l| connect_failed.is_match(l)) {
        return failure(FailureKind::Connection, line);
    }
    if find("Connection timed out").is_some() {
        return failure(FailureKind::Connection, "connection timed out");
    }

    // CONNECT was issued but the proxy never granted it
    if let Some(pos) = find("Proxy-Connection: Keep-Alive") {
        let status = Regex::new(r"HTTP/\d\.\d (\d{3})").unwrap();
        let granted = lines[pos..]
            .iter()
            .find_map(|l| status.captures(l))
            .and_then(|c| c.get(1))
            .map(|m| m.as_str() == "200")
            .unwrap_or(false);
        if !granted {
            return failure(FailureKind::Connection, "proxy refused CONNECT");
        }
    }

    let reply = Regex::new(r"< (\d{3})").unwrap();
    let reply_code_after = |pos: usize| -> Option<u16> {
        lines[pos + 1..]
            .iter()
            .find_map(|l| reply.captures(l))
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    };

    if let Some(pos) = find("Proxy replied OK to CONNECT") {
        if reply_code_after(pos) != Some(220) {
            return failure(FailureKind::Communication, "no service banner after CONNECT");
        }
    }
    if let Some(pos) = find("> EHLO") {
        if reply_code_after(pos) != Some(250) {
            return failure(FailureKind::Communication, "EHLO rejected");
        }
    }
    if let Some(pos) = find("> MAIL FROM") {
        if reply_code_after(pos) != Some(250) {
            return failure(FailureKind::Communication, "MAIL FROM rejected");
        }
    }

    match find("> RCPT TO") {
        Some(pos) => {
            let acceptance = lines[pos + 1..].iter().find_map(|l| {
                reply
                    .captures(l)
                    .and_then(|c| c.get(1))
                    .filter(|m| m.as_str() == "250")
                    .map(|_| (*l).to_string())
            });
            // the first reply after RCPT decides; a later 250 (e.g. to
            // RSET) must not count
            match reply_code_after(pos) {
                Some(250) => match acceptance {
                    Some(line) => TranscriptOutcome::Accepted(line),
                    None => TranscriptOutcome::Rejected,
                },
                _ => TranscriptOutcome::Rejected,
            }
        }
        None => failure(
            FailureKind::Communication,
            "transcript ended before RCPT TO",
        ),
    }
}

fn failure(kind: FailureKind, detail: &str) -> TranscriptOutcome {
    TranscriptOutcome::Failure {
        kind,
        detail: detail.to_string(),
    }
}
