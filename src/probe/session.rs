//! The per-connection SMTP state machine.
//!
//! `connect → banner → EHLO → MAIL FROM → RCPT TO* → RSET → QUIT`, with
//! progress flags gating illegal orderings. One session talks to one MX;
//! the dispatcher opens a fresh session per attempt, so no state survives a
//! disconnect.

use std::io;
use std::time::Duration;

use chrono::Utc;

use crate::probe::error::SessionError;
use crate::probe::log::ProbeLog;
use crate::probe::options::VerifyOptions;
use crate::probe::reply::{ReplyCategory, SmtpReply};
use crate::probe::results::CatchAllStatus;
use crate::probe::transport::Transport;

/// Progress flags. `helo_done` gates MAIL, `mail_done` gates RCPT; RSET
/// clears the transaction flags but keeps `helo_done`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SessionState {
    helo_done: bool,
    mail_done: bool,
    rcpt_done: bool,
}

pub(crate) struct Session<'a> {
    transport: Transport,
    state: SessionState,
    options: &'a VerifyOptions,
    log: &'a mut ProbeLog,
}

impl<'a> Session<'a> {
    /// Connect (directly or through the configured tunnel) and consume the
    /// 220 banner. Multi-line banners are drained in full before anything
    /// is written.
    pub fn open(
        host: &str,
        options: &'a VerifyOptions,
        log: &'a mut ProbeLog,
    ) -> Result<Self, SessionError> {
        log.note(&format!("connecting to {}:{}", host, options.port));
        let transport = match &options.proxy {
            Some(proxy) => Transport::connect_via_proxy(
                proxy,
                host,
                options.port,
                options.timeouts.connected,
                log,
            )?,
            None => Transport::connect(host, options.port, options.timeouts.connected)?,
        };
        let mut session = Self {
            transport,
            state: SessionState::default(),
            options,
            log,
        };
        // the baseline read deadline equals the connect timeout, which is
        // exactly what the banner wait needs
        let banner = session.read_reply("banner")?;
        session.check_expected("banner", &banner, &[220])?;
        Ok(session)
    }

    pub fn connected(&self) -> bool {
        self.transport.is_open()
    }

    pub fn ehlo(&mut self) -> Result<(), SessionError> {
        let domain = self.options.ehlo_domain().into_owned();
        // no HELO fallback: a server that refuses EHLO is treated as dead
        let reply = self.command(&format!("EHLO {domain}"), self.options.timeouts.ehlo)?;
        self.check_expected("EHLO", &reply, &[250])?;
        self.state.helo_done = true;
        Ok(())
    }

    pub fn mail_from(&mut self) -> Result<(), SessionError> {
        if !self.state.helo_done {
            return Err(SessionError::NoHelo);
        }
        let sender = self.options.sender.as_str();
        let command = if sender.is_empty() {
            "MAIL FROM:<>".to_string()
        } else {
            format!("MAIL FROM:<{sender}>")
        };
        let reply = self.command(&command, self.options.timeouts.mail)?;
        // some MTAs drop the line right after rejecting MAIL FROM; close
        // without QUIT instead of trusting the stream
        self.check_expected("MAIL FROM", &reply, &[250])?;
        self.state.mail_done = true;
        Ok(())
    }

    /// `RCPT TO` probe. `Ok` carries any in-protocol reply for the caller
    /// to classify; 421 and transport failures abort via `Err`.
    pub fn rcpt_to(&mut self, forward_path: &str) -> Result<SmtpReply, SessionError> {
        if !self.state.mail_done {
            return Err(SessionError::NoMailFrom);
        }
        let reply = self.command(
            &format!("RCPT TO:<{forward_path}>"),
            self.options.timeouts.rcpt,
        )?;
        if reply.category() == ReplyCategory::ServiceUnavailable {
            return Err(self.unexpected("RCPT TO", &reply));
        }
        if reply.code_is(&[250, 251]) {
            self.state.rcpt_done = true;
        }
        Ok(reply)
    }

    /// Cheap liveness check between RCPTs. Odd-but-present replies are
    /// tolerated (some servers answer NOOP with unframed `SMTP` text);
    /// only a dead transport or 421 is an error.
    pub fn noop(&mut self) -> Result<(), SessionError> {
        let reply = self.command("NOOP", self.options.timeouts.noop)?;
        if reply.category() == ReplyCategory::ServiceUnavailable {
            return Err(self.unexpected("NOOP", &reply));
        }
        if !reply.code_is(&[250, 500, 502, 503, 220]) && !reply.raw.starts_with("SMTP") {
            self.log.note("unrecognized NOOP reply; continuing");
        }
        Ok(())
    }

    /// Probe a mailbox that cannot plausibly exist. Acceptance marks the
    /// domain catch-all; a drop during the probe is surfaced to the caller,
    /// which records the catch-all state as indeterminate.
    pub fn probe_catch_all(&mut self, domain: &str) -> Result<CatchAllStatus, SessionError> {
        let probe = format!("catch-all-test-{}@{}", Utc::now().timestamp(), domain);
        let reply = self.rcpt_to(&probe)?;
        if reply.code_is(&[250, 251]) {
            self.log
                .note(&format!("{domain} accepted <{probe}>: catch-all"));
            Ok(CatchAllStatus::Detected)
        } else {
            Ok(CatchAllStatus::NotDetected)
        }
    }

    pub fn rset(&mut self) -> Result<(), SessionError> {
        let reply = self.command("RSET", self.options.timeouts.rset)?;
        self.check_expected("RSET", &reply, &[250, 220, 502, 554])?;
        self.state.mail_done = false;
        self.state.rcpt_done = false;
        Ok(())
    }

    /// `QUIT` (only once EHLO succeeded) and drop the stream. Outcomes are
    /// ignored; the remote may well hang up first.
    pub fn quit(&mut self) {
        if self.state.helo_done && self.transport.is_open() {
            // 250 or 221 expected, but nothing depends on it
            let _ = self.command("QUIT", self.options.timeouts.quit);
        }
        self.transport.close();
        self.state = SessionState::default();
    }

    fn command(&mut self, command: &str, timeout: Duration) -> Result<SmtpReply, SessionError> {
        if let Err(source) = self.transport.set_deadline(timeout) {
            self.transport.close();
            return Err(SessionError::SendFailed {
                host: self.transport.host().to_string(),
                command: command.to_string(),
                source,
            });
        }
        self.log.note(&format!("> {command}"));
        if let Err(source) = self.transport.send_command(command) {
            self.log.note(&format!("! send failed: {source}"));
            self.transport.close();
            return Err(SessionError::SendFailed {
                host: self.transport.host().to_string(),
                command: command.to_string(),
                source,
            });
        }
        self.read_reply(command)
    }

    fn read_reply(&mut self, command: &str) -> Result<SmtpReply, SessionError> {
        let host = self.transport.host().to_string();
        match self.transport.read_reply() {
            Ok(Some(reply)) => {
                for line in reply.raw.lines() {
                    self.log.note(&format!("< {line}"));
                }
                Ok(reply)
            }
            Ok(None) => {
                self.log
                    .note(&format!("! {host} closed the connection during {command}"));
                self.transport.close();
                Err(SessionError::NoResponse {
                    host,
                    command: command.to_string(),
                })
            }
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                self.log
                    .note(&format!("! timed out waiting for {command} reply from {host}"));
                self.transport.close();
                Err(SessionError::Timeout {
                    host,
                    command: command.to_string(),
                })
            }
            Err(err) => {
                self.log
                    .note(&format!("! read error during {command} from {host}: {err}"));
                self.transport.close();
                Err(SessionError::NoResponse {
                    host,
                    command: command.to_string(),
                })
            }
        }
    }

    fn check_expected(
        &mut self,
        command: &str,
        reply: &SmtpReply,
        expected: &[u16],
    ) -> Result<(), SessionError> {
        // 421 is never acceptable, whatever the expected list says
        if reply.category() == ReplyCategory::ServiceUnavailable || !reply.code_is(expected) {
            return Err(self.unexpected(command, reply));
        }
        Ok(())
    }

    fn unexpected(&mut self, command: &str, reply: &SmtpReply) -> SessionError {
        let host = self.transport.host().to_string();
        self.log.note(&format!(
            "! unexpected reply to {command} from {host}: {}",
            reply.trimmed()
        ));
        self.transport.close();
        SessionError::UnexpectedReply {
            host,
            command: command.to_string(),
            reply: reply.trimmed().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dead_session<'a>(options: &'a VerifyOptions, log: &'a mut ProbeLog) -> Session<'a> {
        Session {
            transport: Transport::closed("mx.test"),
            state: SessionState::default(),
            options,
            log,
        }
    }

    #[test]
    fn mail_from_requires_ehlo() {
        let options = VerifyOptions::default();
        let mut log = ProbeLog::new(false);
        let mut session = dead_session(&options, &mut log);
        let err = session.mail_from().expect_err("guard");
        assert!(matches!(err, SessionError::NoHelo));
    }

    #[test]
    fn rcpt_requires_mail_from() {
        let options = VerifyOptions::default();
        let mut log = ProbeLog::new(false);
        let mut session = dead_session(&options, &mut log);
        let err = session.rcpt_to("a@example.com").expect_err("guard");
        assert!(matches!(err, SessionError::NoMailFrom));
    }

    #[test]
    fn quit_without_helo_only_closes() {
        let options = VerifyOptions::default();
        let mut log = ProbeLog::new(false);
        let mut session = dead_session(&options, &mut log);
        session.quit();
        assert!(!session.connected());
        // no QUIT line was written to the log
        assert!(log.entries().iter().all(|e| !e.contains("QUIT")));
    }
}
