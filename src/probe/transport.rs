//! TCP transport and SMTP wire framing.
//!
//! One logical reply is a run of `NNN-` continuation lines closed by a
//! `NNN ` (or bare `NNN`) line; the final line's code is the reply's code.
//! Lines longer than [`MAX_LINE_LEN`] are truncated, not an error.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::probe::error::SessionError;
use crate::probe::log::ProbeLog;
use crate::probe::options::ProxyConfig;
use crate::probe::reply::SmtpReply;

const MAX_LINE_LEN: usize = 1024;

/// Line-oriented reader with its own buffer, so per-command read deadlines
/// can be adjusted on the underlying socket at any time.
pub(crate) struct LineReader<R> {
    inner: R,
    buffer: Vec<u8>,
    skipping: bool,
}

impl<R: Read> LineReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            skipping: false,
        }
    }

    /// Read one newline-terminated line, CRLF trimmed, truncated to
    /// [`MAX_LINE_LEN`] bytes. `Ok(None)` signals EOF with nothing pending.
    pub(crate) fn read_line(&mut self) -> io::Result<Option<String>> {
        loop {
            if self.skipping {
                // rest of an oversized line; drop through the newline
                match self.buffer.iter().position(|b| *b == b'\n') {
                    Some(pos) => {
                        self.buffer.drain(..=pos);
                        self.skipping = false;
                    }
                    None => self.buffer.clear(),
                }
                if self.skipping {
                    if !self.fill()? {
                        return Ok(None);
                    }
                    continue;
                }
            }
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
                if line.ends_with(b"\n") {
                    line.pop();
                }
                if line.ends_with(b"\r") {
                    line.pop();
                }
                line.truncate(MAX_LINE_LEN);
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }
            if self.buffer.len() >= MAX_LINE_LEN {
                let line: Vec<u8> = self.buffer.drain(..MAX_LINE_LEN).collect();
                self.skipping = true;
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }
            if !self.fill()? {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                // peer closed mid-line; hand out what arrived
                let mut line = std::mem::take(&mut self.buffer);
                line.truncate(MAX_LINE_LEN);
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }
        }
    }

    fn fill(&mut self) -> io::Result<bool> {
        let mut buf = [0u8; 512];
        let read = self.inner.read(&mut buf)?;
        self.buffer.extend_from_slice(&buf[..read]);
        Ok(read > 0)
    }
}

/// Drain one logical reply. `Ok(None)` means EOF before a complete reply.
pub(crate) fn read_reply<R: Read>(reader: &mut LineReader<R>) -> io::Result<Option<SmtpReply>> {
    let mut raw = String::new();
    loop {
        let line = match reader.read_line()? {
            Some(line) => line,
            None => return Ok(None),
        };
        raw.push_str(&line);
        raw.push_str("\r\n");
        let code = parse_code(&line);
        let continuation = code.is_some() && line.as_bytes().get(3) == Some(&b'-');
        if !continuation {
            return Ok(Some(SmtpReply { code, raw }));
        }
    }
}

fn parse_code(line: &str) -> Option<u16> {
    let digits = line.get(..3)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

struct Conn {
    stream: TcpStream,
    reader: LineReader<TcpStream>,
}

/// One TCP stream to an MX (or through an HTTP-CONNECT tunnel). `close` is
/// idempotent; dropping the transport closes without ceremony.
pub(crate) struct Transport {
    host: String,
    conn: Option<Conn>,
}

impl Transport {
    /// Connect directly. The read deadline starts out equal to the connect
    /// timeout; commands override it via [`Transport::set_deadline`].
    pub(crate) fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
    ) -> Result<Self, SessionError> {
        let stream = open_stream(host, port, connect_timeout)?;
        let conn = wrap_stream(host, stream, connect_timeout)?;
        Ok(Self {
            host: host.to_string(),
            conn: Some(conn),
        })
    }

    /// Connect through `proxy` and establish a CONNECT tunnel to
    /// `host:port`. Once the proxy answers 200 the stream is
    /// indistinguishable from a direct one.
    pub(crate) fn connect_via_proxy(
        proxy: &ProxyConfig,
        host: &str,
        port: u16,
        connect_timeout: Duration,
        log: &mut ProbeLog,
    ) -> Result<Self, SessionError> {
        let stream = open_stream(&proxy.host, proxy.port, connect_timeout)?;
        let mut conn = wrap_stream(&proxy.host, stream, connect_timeout)?;
        establish_tunnel(&mut conn, proxy, host, port, log)?;
        Ok(Self {
            host: host.to_string(),
            conn: Some(conn),
        })
    }

    #[cfg(test)]
    pub(crate) fn closed(host: &str) -> Self {
        Self {
            host: host.to_string(),
            conn: None,
        }
    }

    pub(crate) fn host(&self) -> &str {
        &self.host
    }

    pub(crate) fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    pub(crate) fn close(&mut self) {
        self.conn = None;
    }

    pub(crate) fn set_deadline(&mut self, deadline: Duration) -> io::Result<()> {
        match &self.conn {
            Some(conn) => conn.stream.set_read_timeout(Some(deadline)),
            None => Err(not_connected()),
        }
    }

    pub(crate) fn send_command(&mut self, command: &str) -> io::Result<()> {
        let conn = self.conn.as_mut().ok_or_else(not_connected)?;
        let mut line = command.as_bytes().to_vec();
        line.extend_from_slice(b"\r\n");
        conn.stream.write_all(&line)?;
        conn.stream.flush()
    }

    pub(crate) fn read_reply(&mut self) -> io::Result<Option<SmtpReply>> {
        let conn = self.conn.as_mut().ok_or_else(not_connected)?;
        read_reply(&mut conn.reader)
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport closed")
}

fn open_stream(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, SessionError> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|source| SessionError::NoConnection {
            host: host.to_string(),
            source,
        })?;
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(SessionError::NoConnection {
        host: host.to_string(),
        source: last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no socket address available",
            )
        }),
    })
}

fn wrap_stream(host: &str, stream: TcpStream, baseline: Duration) -> Result<Conn, SessionError> {
    let io_err = |source| SessionError::NoConnection {
        host: host.to_string(),
        source,
    };
    stream.set_read_timeout(Some(baseline)).map_err(io_err)?;
    stream.set_write_timeout(Some(baseline)).map_err(io_err)?;
    let reader = LineReader::new(stream.try_clone().map_err(io_err)?);
    Ok(Conn { stream, reader })
}

fn establish_tunnel(
    conn: &mut Conn,
    proxy: &ProxyConfig,
    host: &str,
    port: u16,
    log: &mut ProbeLog,
) -> Result<(), SessionError> {
    let request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\nProxy-Connection: Keep-Alive\r\n\r\n"
    );
    log.note(&format!("> CONNECT {host}:{port} HTTP/1.1"));
    log.note("Proxy-Connection: Keep-Alive");
    let send_failed = |source| SessionError::SendFailed {
        host: proxy.host.clone(),
        command: "CONNECT".to_string(),
        source,
    };
    conn.stream
        .write_all(request.as_bytes())
        .map_err(send_failed)?;
    conn.stream.flush().map_err(send_failed)?;

    let status = match conn.reader.read_line().map_err(|err| tunnel_read_err(proxy, err))? {
        Some(line) => line,
        None => {
            return Err(SessionError::NoResponse {
                host: proxy.host.clone(),
                command: "CONNECT".to_string(),
            })
        }
    };
    log.note(&format!("< {status}"));
    let code = status
        .split_whitespace()
        .nth(1)
        .and_then(|c| c.parse::<u16>().ok());
    if code != Some(200) {
        return Err(SessionError::NoConnection {
            host: proxy.host.clone(),
            source: io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("proxy refused CONNECT: {status}"),
            ),
        });
    }
    // drain response headers up to the blank line
    loop {
        match conn.reader.read_line().map_err(|err| tunnel_read_err(proxy, err))? {
            Some(line) if line.is_empty() => break,
            Some(_) => continue,
            None => {
                return Err(SessionError::NoResponse {
                    host: proxy.host.clone(),
                    command: "CONNECT".to_string(),
                })
            }
        }
    }
    log.note("Proxy replied OK to CONNECT");
    Ok(())
}

fn tunnel_read_err(proxy: &ProxyConfig, err: io::Error) -> SessionError {
    if err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::TimedOut {
        SessionError::Timeout {
            host: proxy.host.clone(),
            command: "CONNECT".to_string(),
        }
    } else {
        SessionError::NoResponse {
            host: proxy.host.clone(),
            command: "CONNECT".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reader(bytes: &[u8]) -> LineReader<Cursor<Vec<u8>>> {
        LineReader::new(Cursor::new(bytes.to_vec()))
    }

    #[test]
    fn single_line_reply() {
        let mut r = reader(b"250 ok\r\n");
        let reply = read_reply(&mut r).expect("io").expect("reply");
        assert_eq!(reply.code, Some(250));
        assert_eq!(reply.raw, "250 ok\r\n");
    }

    #[test]
    fn multi_line_reply_takes_last_code() {
        let mut r = reader(b"250-mx.test greets you\r\n250-SIZE 35882577\r\n250 HELP\r\n");
        let reply = read_reply(&mut r).expect("io").expect("reply");
        assert_eq!(reply.code, Some(250));
        assert_eq!(
            reply.raw,
            "250-mx.test greets you\r\n250-SIZE 35882577\r\n250 HELP\r\n"
        );
    }

    #[test]
    fn multi_line_banner_is_one_reply() {
        let mut r = reader(b"220-greeting\r\n220 ready\r\n");
        let reply = read_reply(&mut r).expect("io").expect("reply");
        assert_eq!(reply.code, Some(220));
        assert!(read_reply(&mut r).expect("io").is_none());
    }

    #[test]
    fn bare_code_is_final() {
        let mut r = reader(b"250\r\n");
        let reply = read_reply(&mut r).expect("io").expect("reply");
        assert_eq!(reply.code, Some(250));
        assert_eq!(reply.raw, "250\r\n");
    }

    #[test]
    fn tab_separator_is_final() {
        let mut r = reader(b"250\tok\r\n");
        let reply = read_reply(&mut r).expect("io").expect("reply");
        assert_eq!(reply.code, Some(250));
    }

    #[test]
    fn unframed_text_has_no_code() {
        let mut r = reader(b"SMTP ready\r\n");
        let reply = read_reply(&mut r).expect("io").expect("reply");
        assert_eq!(reply.code, None);
        assert_eq!(reply.raw, "SMTP ready\r\n");
    }

    #[test]
    fn eof_is_none() {
        let mut r = reader(b"");
        assert!(read_reply(&mut r).expect("io").is_none());
    }

    #[test]
    fn eof_mid_reply_is_none() {
        let mut r = reader(b"250-partial\r\n");
        assert!(read_reply(&mut r).expect("io").is_none());
    }

    #[test]
    fn lf_only_lines_are_tolerated() {
        let mut r = reader(b"250 ok\n");
        let reply = read_reply(&mut r).expect("io").expect("reply");
        assert_eq!(reply.code, Some(250));
        assert_eq!(reply.raw, "250 ok\r\n");
    }

    #[test]
    fn oversized_line_is_truncated_not_an_error() {
        let mut input = Vec::new();
        input.extend_from_slice(b"250 ");
        input.extend_from_slice(&vec![b'x'; 3000]);
        input.extend_from_slice(b"\r\n");
        let mut r = reader(&input);
        let line = r.read_line().expect("io").expect("line");
        assert_eq!(line.len(), MAX_LINE_LEN);
        assert!(line.starts_with("250 xxx"));
        // the overflow is discarded, the stream stays line-aligned
        assert!(r.read_line().expect("io").is_none());
    }

    #[test]
    fn line_after_truncated_line_is_intact() {
        let mut input = Vec::new();
        input.extend_from_slice(b"250-");
        input.extend_from_slice(&vec![b'y'; 2000]);
        input.extend_from_slice(b"\r\n250 ok\r\n");
        let mut r = reader(&input);
        let reply = read_reply(&mut r).expect("io").expect("reply");
        assert_eq!(reply.code, Some(250));
        assert!(reply.raw.ends_with("250 ok\r\n"));
    }

    #[test]
    fn reparsing_raw_reply_is_idempotent() {
        let mut r = reader(b"250-first\r\n250 last\r\n");
        let reply = read_reply(&mut r).expect("io").expect("reply");
        let mut r2 = reader(reply.raw.as_bytes());
        let reparsed = read_reply(&mut r2).expect("io").expect("reply");
        assert_eq!(reparsed, reply);
    }

    #[test]
    fn eof_mid_line_hands_out_partial() {
        let mut r = reader(b"220 welco");
        let line = r.read_line().expect("io").expect("line");
        assert_eq!(line, "220 welco");
        assert!(r.read_line().expect("io").is_none());
    }
}
