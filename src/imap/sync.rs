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

/*! The incremental fetch loop.
 *
 * DISCOVER finds which UIDs beyond the checkpoint exist, STREAM fetches and
 * sinks them one by one (checkpoint advances only after the sink accepted a
 * message), then the engine parks in IDLE until the server pushes news.
 * Every transport error unwinds to the caller, which reconnects and
 * re-enters at DISCOVER; the checkpoint is never rewound, so a crash can at
 * worst re-deliver the one message whose checkpoint write did not land.
 */

use smallvec::SmallVec;

use crate::{
    error::{Error, ErrorKind, Result},
    imap::{
        protocol_parser::{self, MessageStatus, UNTAGGED_PREFIX},
        watch, FetchedMessage, ImapConnection, UID,
    },
    sink::Sink,
    state::UidCheckpoint,
};

/// What DISCOVER learned about the mailbox relative to the checkpoint.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SyncWindow {
    /// Sequence number of the checkpointed message, 0 when it is gone.
    pub lastid: usize,
    /// Highest sequence number seen.
    pub highestid: usize,
    /// Highest UID seen; `None` on an empty response.
    pub highestuid: Option<UID>,
}

pub fn run(conn: &mut ImapConnection, checkpoint: &UidCheckpoint, sink: &mut Sink) -> Result<()> {
    let mut last_uid = checkpoint.load();
    if last_uid > 0 {
        log::info!("resuming above uid {}", last_uid);
    } else {
        log::info!("no previous state, mirroring everything");
    }
    loop {
        if crate::shutdown_requested() {
            return Err(Error::new("shutdown requested").set_kind(ErrorKind::Interrupted));
        }
        let window = discover(conn, last_uid)?;
        log::debug!(
            "window: lastid {} highestid {} highestuid {:?}",
            window.lastid,
            window.highestid,
            window.highestuid
        );
        if window.highestuid.map_or(false, |uid| uid > last_uid) {
            stream_new_messages(conn, sink, checkpoint, &mut last_uid, &window)?;
        }
        if crate::shutdown_requested() {
            return Err(Error::new("shutdown requested").set_kind(ErrorKind::Interrupted));
        }
        watch::idle_wait(conn)?;
    }
}

/// Phase 1: ask for the UIDs at and above the checkpoint.
fn discover(conn: &mut ImapConnection, checkpoint_uid: UID) -> Result<SyncWindow> {
    let command = if checkpoint_uid > 0 {
        format!("UID FETCH {},* (UID)", checkpoint_uid)
    } else {
        "UID FETCH * (UID)".to_string()
    };
    let mut rows: SmallVec<[(usize, UID); 64]> = SmallVec::new();
    conn.stream.exec_command(command.as_bytes(), |logical| {
        match protocol_parser::uid_fetch_uid_response(&logical) {
            Ok((_, row)) => rows.push(row),
            Err(_) => log::trace!(
                "discovery: ignoring {}",
                String::from_utf8_lossy(&logical)
            ),
        }
        Ok(())
    })?;
    Ok(compute_window(&rows, checkpoint_uid))
}

fn compute_window(rows: &[(usize, UID)], checkpoint_uid: UID) -> SyncWindow {
    let mut window = SyncWindow::default();
    for &(seq, uid) in rows {
        if uid == checkpoint_uid {
            window.lastid = seq;
        }
        window.highestid = window.highestid.max(seq);
        window.highestuid = Some(window.highestuid.map_or(uid, |h: UID| h.max(uid)));
    }
    window
}

/// Phase 2: stream everything above the checkpoint, oldest first, and
/// checkpoint after each sunk message.
fn stream_new_messages(
    conn: &mut ImapConnection,
    sink: &mut Sink,
    checkpoint: &UidCheckpoint,
    last_uid: &mut UID,
    window: &SyncWindow,
) -> Result<()> {
    let attributes = if conn.has_gmail() {
        "(RFC822 INTERNALDATE X-GM-LABELS)"
    } else {
        "(RFC822 INTERNALDATE)"
    };
    let command = format!("UID FETCH {}:* {}", *last_uid + 1, attributes);
    conn.stream.exec_command(command.as_bytes(), |logical| {
        if !is_fetch_response(&logical) {
            log::trace!("stream: ignoring {}", String::from_utf8_lossy(&logical));
            return Ok(());
        }
        let tokens = protocol_parser::parse_tokens(&logical[UNTAGGED_PREFIX.len()..])?;
        let row = match protocol_parser::fetch_row(tokens) {
            Ok(row) => row,
            Err(err) => {
                log::warn!("skipping malformed FETCH row: {}", err);
                return Ok(());
            }
        };
        let seq = row.seq;
        let (uid, body, internal_date) = match (row.uid, row.body, row.internal_date) {
            (Some(uid), Some(body), Some(internal_date)) => (uid, body, internal_date),
            (uid, body, date) => {
                log::warn!(
                    "seq {}: incomplete FETCH row (uid {} body {} date {}), skipping",
                    seq,
                    uid.map_or("missing".into(), |u| u.to_string()),
                    if body.is_some() { "present" } else { "missing" },
                    if date.is_some() { "present" } else { "missing" },
                );
                return Ok(());
            }
        };
        if uid <= *last_uid {
            log::warn!("seq {}: uid {} already mirrored, skipping", seq, uid);
            return Ok(());
        }
        let status = row
            .labels
            .as_deref()
            .map(MessageStatus::from_labels)
            .unwrap_or(MessageStatus::Unknown);
        let message = FetchedMessage {
            seq,
            uid,
            internal_date,
            body,
            status,
        };
        sink.deliver(&message)?;
        checkpoint.store(uid)?;
        *last_uid = uid;
        println!(
            "Fetching messages {}/{} (new {}/{})",
            seq,
            window.highestid,
            seq.saturating_sub(window.lastid),
            window.highestid.saturating_sub(window.lastid)
        );
        Ok(())
    })?;
    Ok(())
}

/// `* <digits> FETCH ...`?
fn is_fetch_response(line: &[u8]) -> bool {
    let Some(line) = line.strip_prefix(UNTAGGED_PREFIX) else {
        return false;
    };
    let digits = line.iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        return false;
    }
    let mut rest = &line[digits..];
    while let Some(stripped) = rest.strip_prefix(b" ") {
        rest = stripped;
    }
    rest.starts_with(b"FETCH")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_fresh_mailbox() {
        // three messages, nothing mirrored yet
        let rows = [(1, 10), (2, 11), (3, 12)];
        let window = compute_window(&rows, 0);
        assert_eq!(
            window,
            SyncWindow {
                lastid: 0,
                highestid: 3,
                highestuid: Some(12),
            }
        );
    }

    #[test]
    fn test_window_resume() {
        // checkpoint at uid 11, one new message
        let rows = [(2, 11), (3, 12)];
        let window = compute_window(&rows, 11);
        assert_eq!(
            window,
            SyncWindow {
                lastid: 2,
                highestid: 3,
                highestuid: Some(12),
            }
        );
    }

    #[test]
    fn test_window_nothing_new() {
        let rows = [(3, 12)];
        let window = compute_window(&rows, 12);
        assert_eq!(window.lastid, 3);
        assert_eq!(window.highestuid, Some(12));
        // caller skips STREAM because highestuid <= checkpoint
        assert!(!window.highestuid.map_or(false, |uid| uid > 12));
    }

    #[test]
    fn test_window_empty() {
        let window = compute_window(&[], 5);
        assert_eq!(window.highestuid, None);
        assert_eq!(window.lastid, 0);
    }

    #[test]
    fn test_is_fetch_response() {
        assert!(is_fetch_response(b"* 1 FETCH (UID 42)"));
        assert!(is_fetch_response(b"* 1429 FETCH (RFC822 {26}\r\n..."));
        assert!(!is_fetch_response(b"* 3 EXISTS"));
        assert!(!is_fetch_response(b"* OK [UIDNEXT 44] ok"));
        assert!(!is_fetch_response(b"1 OK Fetch completed"));
    }
}
