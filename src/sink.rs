/*
 * imapmirror - sink module.
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

/*! Where fetched messages go.
 *
 * Either an append-only mbox file in the target directory, or a subprocess
 * that receives the raw message on stdin and `<date> <uid> <status>` as
 * positional arguments. The choice is made once per run from the
 * configuration. The sync engine checkpoints a UID only after
 * [`Sink::deliver`] returned `Ok`.
 */

use std::{
    io::Write,
    path::PathBuf,
    process::{Command, Stdio},
};

use chrono::{DateTime, FixedOffset, Local};

use crate::{
    conf::MirrorConf,
    error::{Error, Result, ResultIntoError},
    imap::FetchedMessage,
};

pub const MBOX_FILE: &str = "mbox";
pub const INTERNALDATE_FMT: &str = "%d-%b-%Y %H:%M:%S %z";
/// `From ` separator date, asctime form.
const SEPARATOR_DATE_FMT: &str = "%a %b %d %H:%M:%S %Y";

#[derive(Debug)]
pub enum Sink {
    Mbox(MboxSink),
    Subprocess(SubprocessSink),
}

impl Sink {
    pub fn from_conf(conf: &MirrorConf) -> Self {
        match conf.command.as_ref() {
            Some(command) => Self::Subprocess(SubprocessSink {
                command: command.clone(),
            }),
            None => Self::Mbox(MboxSink {
                path: conf.directory.join(MBOX_FILE),
            }),
        }
    }

    pub fn deliver(&mut self, message: &FetchedMessage) -> Result<()> {
        match self {
            Self::Mbox(sink) => sink.deliver(message),
            Self::Subprocess(sink) => sink.deliver(message),
        }
    }
}

#[derive(Debug)]
pub struct MboxSink {
    path: PathBuf,
}

impl MboxSink {
    fn deliver(&mut self, message: &FetchedMessage) -> Result<()> {
        let date = match parse_internal_date(&message.internal_date) {
            Some(date) => date,
            None => {
                log::warn!(
                    "uid {}: unparsable INTERNALDATE {:?}, substituting current time",
                    message.uid,
                    String::from_utf8_lossy(&message.internal_date)
                );
                Local::now().fixed_offset()
            }
        };
        let sender = envelope_sender(&message.body);

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .chain_err_summary(|| format!("Could not open {}", self.path.display()))?;
        let mut out = Vec::with_capacity(message.body.len() + 128);
        out.extend_from_slice(b"From ");
        out.extend_from_slice(sender.as_bytes());
        out.extend_from_slice(b"  ");
        out.extend_from_slice(date.format(SEPARATOR_DATE_FMT).to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
        escape_from_lines(&message.body, &mut out);
        if !out.ends_with(b"\r\n") {
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        file.write_all(&out)
            .chain_err_summary(|| format!("Could not append to {}", self.path.display()))?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct SubprocessSink {
    command: String,
}

impl SubprocessSink {
    fn deliver(&mut self, message: &FetchedMessage) -> Result<()> {
        let mut argv = self.command.split_whitespace();
        let program = argv.next().ok_or_else(|| Error::new("empty command"))?;
        let mut child = Command::new(program)
            .args(argv)
            .arg(String::from_utf8_lossy(&message.internal_date).as_ref())
            .arg(message.uid.to_string())
            .arg(message.status.to_string())
            .stdin(Stdio::piped())
            .spawn()
            .chain_err_summary(|| format!("Could not spawn {:?}", self.command))?;
        {
            // stdin(Stdio::piped()) above guarantees the handle is present
            let mut stdin = child.stdin.take().ok_or_else(|| {
                Error::new(format!("{:?}: no stdin handle", self.command))
            })?;
            stdin
                .write_all(&message.body)
                .chain_err_summary(|| format!("Could not write message to {:?}", self.command))?;
        }
        let status = child
            .wait()
            .chain_err_summary(|| format!("Could not wait for {:?}", self.command))?;
        if !status.success() {
            log::warn!("uid {}: {:?} exited with {}", message.uid, self.command, status);
        }
        Ok(())
    }
}

fn parse_internal_date(raw: &[u8]) -> Option<DateTime<FixedOffset>> {
    let raw = std::str::from_utf8(raw).ok()?;
    DateTime::parse_from_str(raw.trim(), INTERNALDATE_FMT).ok()
}

/// `Return-Path:` of the message with angle brackets and interior whitespace
/// removed, or the invoking user's login name when the header is missing or
/// empty.
fn envelope_sender(body: &[u8]) -> String {
    if let Some(value) = header_value(body, b"Return-Path") {
        let cleaned: String = value
            .trim()
            .trim_start_matches('<')
            .trim_end_matches('>')
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        if !cleaned.is_empty() {
            return cleaned;
        }
    }
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "MAILER-DAEMON".to_string())
}

fn header_value(body: &[u8], name: &[u8]) -> Option<String> {
    for line in body.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            // end of header block
            return None;
        }
        if line.len() > name.len()
            && line[..name.len()].eq_ignore_ascii_case(name)
            && line[name.len()] == b':'
        {
            return Some(String::from_utf8_lossy(&line[name.len() + 1..]).into_owned());
        }
    }
    None
}

/// Prefix one more `>` to every body line that would otherwise be read back
/// as a message separator, i.e. lines matching `^>*From `.
fn escape_from_lines(body: &[u8], out: &mut Vec<u8>) {
    for line in LineIter::new(body) {
        let content = line
            .strip_suffix(b"\r\n")
            .or_else(|| line.strip_suffix(b"\n"))
            .unwrap_or(line);
        let stripped = {
            let mut s = content;
            while let Some(rest) = s.strip_prefix(b">") {
                s = rest;
            }
            s
        };
        if stripped.starts_with(b"From ") {
            out.push(b'>');
        }
        out.extend_from_slice(content);
        if line.len() != content.len() {
            out.extend_from_slice(b"\r\n");
        }
    }
}

struct LineIter<'a> {
    slice: &'a [u8],
}

impl<'a> LineIter<'a> {
    fn new(slice: &'a [u8]) -> Self {
        Self { slice }
    }
}

impl<'a> Iterator for LineIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.slice.is_empty() {
            return None;
        }
        if let Some(pos) = self.slice.iter().position(|&b| b == b'\n') {
            let ret = &self.slice[..=pos];
            self.slice = &self.slice[pos + 1..];
            Some(ret)
        } else {
            let ret = self.slice;
            self.slice = &self.slice[ret.len()..];
            Some(ret)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imap::MessageStatus;

    fn message(body: &[u8]) -> FetchedMessage {
        FetchedMessage {
            seq: 1,
            uid: 7,
            internal_date: b"01-Jan-2020 10:20:30 +0000".to_vec(),
            body: body.to_vec(),
            status: MessageStatus::Unknown,
        }
    }

    #[test]
    fn test_internal_date() {
        let date = parse_internal_date(b"01-Jan-2020 10:20:30 +0000").unwrap();
        assert_eq!(
            date.format(SEPARATOR_DATE_FMT).to_string(),
            "Wed Jan 01 10:20:30 2020"
        );
        let date = parse_internal_date(b"02-Feb-2021 11:22:33 -0500").unwrap();
        assert_eq!(
            date.format(SEPARATOR_DATE_FMT).to_string(),
            "Tue Feb 02 11:22:33 2021"
        );
        assert!(parse_internal_date(b"yesterday").is_none());
        assert!(parse_internal_date(b"01-Bla-2020 10:20:30 +0000").is_none());
    }

    #[test]
    fn test_envelope_sender() {
        assert_eq!(
            envelope_sender(b"Return-Path: <who@example.com>\r\nSubject: x\r\n\r\nbody"),
            "who@example.com"
        );
        // interior whitespace is squeezed out
        assert_eq!(
            envelope_sender(b"Return-path: < who @example.com >\r\n\r\n"),
            "who@example.com"
        );
        // headers below the blank line do not count
        let fallback = envelope_sender(b"Subject: x\r\n\r\nReturn-Path: <no@no>\r\n");
        assert!(!fallback.contains('@'));
    }

    #[test]
    fn test_from_escaping() {
        let mut out = Vec::new();
        escape_from_lines(
            b"From the start\r\n>From quoted\r\n>>Fromless\r\nplain\r\nFrom a\r\n",
            &mut out,
        );
        assert_eq!(
            out,
            b">From the start\r\n>>From quoted\r\n>>Fromless\r\nplain\r\n>From a\r\n".to_vec()
        );
    }

    #[test]
    fn test_mbox_delivery() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = MboxSink {
            path: dir.path().join(MBOX_FILE),
        };
        sink.deliver(&message(
            b"Return-Path: <a@b.c>\r\nSubject: hi\r\n\r\nFrom here on\r\n",
        ))
        .unwrap();
        let mbox = std::fs::read(dir.path().join(MBOX_FILE)).unwrap();
        let text = String::from_utf8(mbox).unwrap();
        assert!(text.starts_with("From a@b.c  Wed Jan 01 10:20:30 2020\r\n"));
        assert!(text.contains("\r\n>From here on\r\n"));
        assert!(text.ends_with("\r\n\r\n"));

        // appending keeps earlier entries intact
        sink.deliver(&message(b"Return-Path: <d@e.f>\r\n\r\nsecond\r\n"))
            .unwrap();
        let text = std::fs::read_to_string(dir.path().join(MBOX_FILE)).unwrap();
        assert_eq!(text.matches("From a@b.c").count(), 1);
        assert_eq!(text.matches("From d@e.f").count(), 1);
    }
}
