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

/*! The IDLE wait between fetch rounds (RFC 2177).
 *
 * The refresh timer is the socket read deadline: when it fires without any
 * server push, `DONE` is written, the round is completed and IDLE is
 * re-entered, keeping the session safely below RFC 2177's 29-minute
 * server-may-drop-you limit. An `EXISTS` push completes the round the same
 * way but returns control to the discovery phase instead. Whichever event
 * fires first wins; the `done_sent` flag guarantees a single `DONE` per
 * round.
 */

use std::time::Duration;

use crate::{
    error::{Error, ErrorKind, Result},
    imap::{connection::COMMAND_TIMEOUT, protocol_parser, ImapConnection},
};

/// Refresh ceiling; IDLE rounds never outlive this.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Park in IDLE until the server announces new messages. Returns `Ok(())`
/// when the caller should run discovery again; transport and protocol
/// failures unwind to the reconnect loop.
pub fn idle_wait(conn: &mut ImapConnection) -> Result<()> {
    conn.stream.set_read_timeout(Some(IDLE_TIMEOUT))?;
    let ret = idle_rounds(conn);
    if ret.is_ok() {
        conn.stream.set_read_timeout(Some(COMMAND_TIMEOUT))?;
    }
    ret
}

fn idle_rounds(conn: &mut ImapConnection) -> Result<()> {
    'reidle: loop {
        if crate::shutdown_requested() {
            return Err(Error::new("shutdown requested").set_kind(ErrorKind::Interrupted));
        }
        let tag = conn.stream.send_command(b"IDLE")?;
        let tag_prefix = format!("{} ", tag);
        let mut done_sent = false;
        let mut new_data = false;
        let mut refresh = false;
        loop {
            let line = match conn.stream.read_line() {
                Ok(line) => line,
                Err(err) if err.kind == ErrorKind::Timeout && !done_sent => {
                    log::debug!("idle ceiling reached, refreshing");
                    conn.stream.send_raw(b"DONE")?;
                    done_sent = true;
                    refresh = true;
                    continue;
                }
                Err(err) => return Err(err),
            };
            if line.starts_with(b"+") {
                // the server's "+ idling" acknowledgement
                continue;
            }
            if line.starts_with(b"* BYE") {
                return Err(Error::new(format!(
                    "server closed the session during IDLE: {}",
                    String::from_utf8_lossy(&line)
                ))
                .set_kind(ErrorKind::Network));
            }
            if line.starts_with(tag_prefix.as_bytes()) {
                let rest = &line[tag_prefix.len()..];
                if !rest.starts_with(b"OK") {
                    return Err(Error::new(format!(
                        "IDLE failed: {}",
                        String::from_utf8_lossy(rest)
                    ))
                    .set_kind(ErrorKind::Network));
                }
                if new_data || !refresh {
                    return Ok(());
                }
                continue 'reidle;
            }
            if let Ok((_, count)) = protocol_parser::untagged_exists(&line) {
                log::debug!("server announces {} messages", count);
                if !done_sent {
                    conn.stream.send_raw(b"DONE")?;
                    done_sent = true;
                }
                new_data = true;
                continue;
            }
            // EXPUNGE, RECENT, flag FETCHes: nothing the mirror acts on
            log::trace!("idle: ignoring {}", String::from_utf8_lossy(&line));
        }
    }
}
