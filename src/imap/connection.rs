/*
 * imapmirror - imap module.
 *
 * Copyright 2024 imapmirror developers
 *
 * This file is part of imapmirror.
 *
 * imapmirror is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * imapmirror is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with imapmirror. If not, see <http://www.gnu.org/licenses/>.
 */

/*! Blocking transport and tagged command channel.
 *
 * One [`ImapStream`] is one session: a TCP connection (optionally wrapped in
 * TLS before any protocol bytes), the tag counter, and a read buffer. The
 * engine is strictly serial, so the channel never has more than one command
 * in flight.
 */

use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    time::Duration,
};

use native_tls::TlsConnector;

use crate::{
    error::{Error, ErrorKind, Result, ResultIntoError},
    imap::{protocol_parser, ImapServerConf},
};

/// Read/write deadline outside IDLE.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug)]
enum Transport {
    Plain(TcpStream),
    Tls(native_tls::TlsStream<TcpStream>),
}

impl Transport {
    fn tcp(&self) -> &TcpStream {
        match self {
            Self::Plain(stream) => stream,
            Self::Tls(stream) => stream.get_ref(),
        }
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.read(buf),
            Self::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.write(buf),
            Self::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Plain(stream) => stream.flush(),
            Self::Tls(stream) => stream.flush(),
        }
    }
}

#[derive(Debug)]
pub struct ImapStream {
    pub cmd_id: usize,
    transport: Transport,
    /// Bytes read off the wire but not yet consumed as a line or literal.
    pending: Vec<u8>,
}

impl ImapStream {
    pub fn new_connection(server_conf: &ImapServerConf) -> Result<Self> {
        let addr = lookup_addr(&server_conf.server_hostname, server_conf.server_port)?;
        let socket = TcpStream::connect(addr).chain_err_summary(|| {
            format!(
                "Could not connect to {}:{}",
                server_conf.server_hostname, server_conf.server_port
            )
        })?;
        socket.set_read_timeout(Some(COMMAND_TIMEOUT))?;
        socket.set_write_timeout(Some(COMMAND_TIMEOUT))?;

        let transport = if server_conf.use_tls {
            let connector = TlsConnector::builder().build()?;
            let stream = connector
                .connect(&server_conf.server_hostname, socket)
                .map_err(|err| match err {
                    native_tls::HandshakeError::Failure(err) => Error::from(err),
                    err @ native_tls::HandshakeError::WouldBlock(_) => {
                        Error::new(err.to_string()).set_kind(ErrorKind::Network)
                    }
                })
                .chain_err_summary(|| {
                    format!(
                        "TLS handshake with {} failed",
                        server_conf.server_hostname
                    )
                })?;
            Transport::Tls(stream)
        } else {
            Transport::Plain(socket)
        };

        let mut ret = Self {
            cmd_id: 1,
            transport,
            pending: Vec::with_capacity(READ_CHUNK),
        };
        let greeting = ret.read_line()?;
        if greeting.starts_with(b"* BYE") {
            return Err(Error::new(format!(
                "{} refused the connection: {}",
                server_conf.server_hostname,
                String::from_utf8_lossy(&greeting)
            ))
            .set_kind(ErrorKind::Network));
        }
        log::debug!(
            "{} greeted us with {:?}",
            server_conf.server_hostname,
            String::from_utf8_lossy(&greeting)
        );
        Ok(ret)
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.transport.tcp().set_read_timeout(timeout)?;
        Ok(())
    }

    /// One CRLF-terminated line with the CRLF stripped. A signal that
    /// arrives while the read blocks surfaces as [`ErrorKind::Interrupted`]
    /// once shutdown has been requested.
    pub fn read_line(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(pos) = find_crlf(&self.pending) {
                let mut line: Vec<u8> = self.pending.drain(..pos + 2).collect();
                line.truncate(pos);
                log::trace!("S: {}", String::from_utf8_lossy(&line));
                return Ok(line);
            }
            self.fill_pending()?;
        }
    }

    /// Exactly `n` raw bytes, straight off the wire.
    pub fn read_literal(&mut self, n: usize) -> Result<Vec<u8>> {
        while self.pending.len() < n {
            self.fill_pending()?;
        }
        Ok(self.pending.drain(..n).collect())
    }

    fn fill_pending(&mut self) -> Result<()> {
        let mut buf = [0; READ_CHUNK];
        loop {
            match self.transport.read(&mut buf) {
                Ok(0) => {
                    return Err(Error::new("unexpected EOF from server")
                        .set_kind(ErrorKind::Network));
                }
                Ok(len) => {
                    self.pending.extend_from_slice(&buf[..len]);
                    return Ok(());
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {
                    if crate::shutdown_requested() {
                        return Err(Error::new("shutdown requested")
                            .set_kind(ErrorKind::Interrupted));
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.transport.write_all(bytes)?;
        self.transport.flush()?;
        Ok(())
    }

    /// Issue `<tag> <command>\r\n` and return the tag. The counter
    /// increments at issue time so every command gets a fresh tag.
    pub fn send_command(&mut self, command: &[u8]) -> Result<usize> {
        let tag = self.cmd_id;
        self.cmd_id += 1;
        let mut line = Vec::with_capacity(command.len() + 16);
        line.extend_from_slice(tag.to_string().as_bytes());
        line.push(b' ');
        line.extend_from_slice(command);
        line.extend_from_slice(b"\r\n");
        self.write_all(&line)?;
        if command.starts_with(b"LOGIN") || command.starts_with(b"AUTHENTICATE") {
            log::trace!("C: {} {}", tag, {
                let verb = command.split(|&b| b == b' ').next().unwrap_or(command);
                String::from_utf8_lossy(verb)
            });
        } else {
            log::trace!("C: {} {}", tag, String::from_utf8_lossy(command));
        }
        Ok(tag)
    }

    /// Write `raw` plus CRLF without consuming a tag (`DONE`, SASL replies).
    pub fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        let mut line = Vec::with_capacity(raw.len() + 2);
        line.extend_from_slice(raw);
        line.extend_from_slice(b"\r\n");
        self.write_all(&line)?;
        log::trace!("C: {}", String::from_utf8_lossy(raw));
        Ok(())
    }

    /// The conventional unsolicited logout on shutdown; best effort.
    pub fn send_unsolicited_logout(&mut self) -> Result<()> {
        self.send_raw(b"0 LOGOUT")
    }

    /// Assemble one logical response starting from `first`: while the
    /// current line announces a trailing literal, pull the declared bytes
    /// and the continuation line off the transport. The returned buffer is
    /// the response in wire form (literals inline), ready for
    /// [`protocol_parser::parse_tokens`].
    pub fn read_logical_response(&mut self, first: Vec<u8>) -> Result<Vec<u8>> {
        let mut response = Vec::new();
        let mut line = first;
        loop {
            match protocol_parser::trailing_literal_len(&line) {
                Some(n) => {
                    response.extend_from_slice(&line);
                    response.extend_from_slice(b"\r\n");
                    let literal = self.read_literal(n)?;
                    response.extend_from_slice(&literal);
                    line = self.read_line()?;
                }
                None => {
                    response.extend_from_slice(&line);
                    return Ok(response);
                }
            }
        }
    }

    /// Run one command to tagged completion. Untagged responses are
    /// assembled into logical responses and handed to `on_untagged` in
    /// arrival order; `OK` yields the rest of the tagged line, `NO`/`BAD`
    /// fail with it. An unsolicited `BYE` fails the session.
    pub fn exec_command(
        &mut self,
        command: &[u8],
        mut on_untagged: impl FnMut(Vec<u8>) -> Result<()>,
    ) -> Result<Vec<u8>> {
        let tag = self.send_command(command)?;
        let tag_prefix = format!("{} ", tag);
        loop {
            let line = self.read_line()?;
            if line.starts_with(b"* BYE") {
                return Err(Error::new(format!(
                    "server closed the session: {}",
                    String::from_utf8_lossy(&line)
                ))
                .set_kind(ErrorKind::Network));
            } else if line.starts_with(protocol_parser::UNTAGGED_PREFIX) {
                let logical = self.read_logical_response(line)?;
                on_untagged(logical)?;
            } else if line.starts_with(b"+") {
                return Err(Error::new(format!(
                    "unexpected continuation request during {}",
                    String::from_utf8_lossy(command)
                ))
                .set_kind(ErrorKind::Protocol));
            } else if line.starts_with(tag_prefix.as_bytes()) {
                let rest = &line[tag_prefix.len()..];
                if rest.starts_with(b"OK") {
                    return Ok(rest.to_vec());
                }
                return Err(Error::new(format!(
                    "command failed: {}",
                    String::from_utf8_lossy(rest)
                )));
            } else {
                log::debug!(
                    "ignoring unexpected line {:?}",
                    String::from_utf8_lossy(&line)
                );
            }
        }
    }
}

fn find_crlf(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(2)
        .position(|window| window == b"\r\n")
}

fn lookup_addr(host: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = (host, port)
        .to_socket_addrs()
        .chain_err_summary(|| format!("Could not resolve {}", host))
        .chain_err_kind(ErrorKind::Network)?;
    addrs
        .next()
        .ok_or_else(|| Error::new(format!("{} resolves to no address", host)).set_kind(ErrorKind::Network))
}
