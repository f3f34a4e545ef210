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

/*! The IMAP4rev1 session: connect, authenticate, pick a folder, EXAMINE it.
 *
 * The subset spoken here is CAPABILITY, LOGIN, AUTHENTICATE XOAUTH2, LIST,
 * EXAMINE, UID FETCH, IDLE and LOGOUT; the folder is only ever opened
 * read-only, so the mirror can never change server state.
 */

pub mod connection;
pub mod protocol_parser;
pub mod sync;
pub mod watch;

use data_encoding::BASE64;
use indexmap::IndexSet;

pub use self::connection::ImapStream;
pub use self::protocol_parser::MessageStatus;
use crate::{
    conf::{AuthMethod, MirrorConf},
    error::{Error, ErrorKind, Result},
    oauth2,
};

pub type UID = u64;

pub type Capabilities = IndexSet<Vec<u8>>;

#[derive(Clone, Debug)]
pub struct ImapServerConf {
    pub server_hostname: String,
    pub server_port: u16,
    pub use_tls: bool,
}

impl From<&MirrorConf> for ImapServerConf {
    fn from(conf: &MirrorConf) -> Self {
        Self {
            server_hostname: conf.server.clone(),
            server_port: conf.port,
            use_tls: conf.use_tls,
        }
    }
}

/// One fully validated row of the streaming fetch, ready for the sink.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FetchedMessage {
    pub seq: usize,
    pub uid: UID,
    /// Raw INTERNALDATE string, `dd-Mon-yyyy HH:MM:SS +HHMM`.
    pub internal_date: Vec<u8>,
    /// Raw RFC822 bytes, untouched.
    pub body: Vec<u8>,
    pub status: MessageStatus,
}

#[derive(Debug)]
pub struct ImapConnection {
    pub stream: ImapStream,
    pub capabilities: Capabilities,
    server_conf: ImapServerConf,
}

fn latch_capabilities(capabilities: &mut Capabilities, input: &[u8]) {
    if let Ok((_, caps)) = protocol_parser::capabilities(input) {
        for cap in caps {
            capabilities.insert(cap.to_vec());
        }
    }
}

fn has_capability(capabilities: &Capabilities, needle: &[u8]) -> bool {
    capabilities
        .iter()
        .any(|cap| cap.eq_ignore_ascii_case(needle))
}

/// Tagged NO/BAD during authentication keeps its message but becomes an
/// authentication error; transport failures stay what they are.
fn auth_err(err: Error) -> Error {
    if err.kind == ErrorKind::None {
        err.set_kind(ErrorKind::Authentication)
    } else {
        err
    }
}

/// `base64("user=" user "\x01auth=Bearer " token "\x01\x01")`, the SASL
/// initial response of AUTHENTICATE XOAUTH2.
fn xoauth2_initial_response(user: &str, token: &str) -> String {
    BASE64.encode(format!("user={}\x01auth=Bearer {}\x01\x01", user, token).as_bytes())
}

/// Inspect a `+` continuation payload. Token failures come back as a JSON
/// document (optionally base64-wrapped) whose `status` starts with 4 or 5.
fn challenge_failure(payload: &[u8]) -> Option<String> {
    let decoded = BASE64.decode(payload).unwrap_or_else(|_| payload.to_vec());
    let json: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    let status = json.get("status")?;
    let status = match status {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if status.starts_with('4') || status.starts_with('5') {
        Some(String::from_utf8_lossy(&decoded).into_owned())
    } else {
        None
    }
}

impl ImapConnection {
    /// Connect and authenticate according to the configuration. Exactly one
    /// auth option is set at this point (conf validation guarantees it).
    pub fn connect_and_login(conf: &MirrorConf) -> Result<Self> {
        let server_conf = ImapServerConf::from(conf);
        let stream = ImapStream::new_connection(&server_conf)?;
        let mut ret = Self {
            stream,
            capabilities: Capabilities::default(),
            server_conf,
        };
        match &conf.auth {
            AuthMethod::Login { password } => ret.login(&conf.user, password)?,
            AuthMethod::XOauth2Token { access_token } => {
                ret.authenticate_xoauth2(&conf.user, access_token.clone())?
            }
            AuthMethod::XOauth2Refresh {
                request_url,
                client_id,
                client_secret,
                refresh_token,
            } => {
                let access_token = oauth2::fetch_access_token(
                    request_url,
                    client_id,
                    client_secret,
                    refresh_token,
                )?;
                ret.authenticate_xoauth2(&conf.user, access_token)?
            }
        }
        log::debug!(
            "{}: authenticated, gmail extensions {}",
            ret.server_conf.server_hostname,
            if ret.has_gmail() { "present" } else { "absent" }
        );
        Ok(ret)
    }

    pub fn has_gmail(&self) -> bool {
        has_capability(&self.capabilities, b"X-GM-EXT-1")
    }

    pub fn has_xoauth2(&self) -> bool {
        has_capability(&self.capabilities, b"SASL-IR")
            && has_capability(&self.capabilities, b"AUTH=XOAUTH2")
    }

    fn run_capability(&mut self) -> Result<()> {
        let capabilities = &mut self.capabilities;
        let text = self.stream.exec_command(b"CAPABILITY", |logical| {
            latch_capabilities(capabilities, &logical);
            Ok(())
        })?;
        latch_capabilities(&mut self.capabilities, &text);
        Ok(())
    }

    fn login(&mut self, user: &str, password: &str) -> Result<()> {
        let capabilities = &mut self.capabilities;
        let command = format!("LOGIN {} {}", user, password);
        let text = self
            .stream
            .exec_command(command.as_bytes(), |logical| {
                latch_capabilities(capabilities, &logical);
                Ok(())
            })
            .map_err(auth_err)?;
        latch_capabilities(&mut self.capabilities, &text);
        Ok(())
    }

    fn authenticate_xoauth2(&mut self, user: &str, access_token: String) -> Result<()> {
        self.run_capability()?;
        if !self.has_xoauth2() {
            return Err(Error::new(format!(
                "{} does not advertise SASL-IR and AUTH=XOAUTH2, cannot use a bearer token",
                self.server_conf.server_hostname
            ))
            .set_kind(ErrorKind::Authentication));
        }

        let command = format!(
            "AUTHENTICATE XOAUTH2 {}",
            xoauth2_initial_response(user, &access_token)
        );
        let tag = self.stream.send_command(command.as_bytes())?;
        let tag_prefix = format!("{} ", tag);
        let mut challenge_error: Option<Error> = None;
        loop {
            let line = self.stream.read_line()?;
            if line.starts_with(b"* BYE") {
                return Err(Error::new(format!(
                    "server closed the session: {}",
                    String::from_utf8_lossy(&line)
                ))
                .set_kind(ErrorKind::Network));
            } else if line.starts_with(b"+") {
                let payload = &line[1..];
                let payload: &[u8] = match payload.first() {
                    Some(b' ') => &payload[1..],
                    _ => payload,
                };
                if let Some(details) = challenge_failure(payload) {
                    challenge_error = Some(
                        Error::new("server rejected the bearer token")
                            .set_details(details)
                            .set_kind(ErrorKind::Authentication),
                    );
                }
                // empty SASL response lets the server finish the exchange
                self.stream.send_raw(b"")?;
            } else if line.starts_with(protocol_parser::UNTAGGED_PREFIX) {
                latch_capabilities(&mut self.capabilities, &line);
            } else if line.starts_with(tag_prefix.as_bytes()) {
                let rest = &line[tag_prefix.len()..];
                if let Some(err) = challenge_error.take() {
                    return Err(err);
                }
                if rest.starts_with(b"OK") {
                    latch_capabilities(&mut self.capabilities, rest);
                    return Ok(());
                }
                return Err(Error::new(format!(
                    "authentication failed: {}",
                    String::from_utf8_lossy(rest)
                ))
                .set_kind(ErrorKind::Authentication));
            } else {
                log::debug!(
                    "ignoring unexpected line {:?}",
                    String::from_utf8_lossy(&line)
                );
            }
        }
    }

    /// The folder to mirror: the configured name verbatim, or the first
    /// LIST row whose flag set contains the configured flag (exact match,
    /// backslash included). The returned name keeps the server's quoting
    /// and is handed to EXAMINE unchanged.
    pub fn resolve_folder(&mut self, conf: &MirrorConf) -> Result<Vec<u8>> {
        if let Some(folder) = conf.folder.as_ref() {
            return Ok(folder.clone().into_bytes());
        }
        let flag = conf.folder_flag.as_ref().ok_or_else(|| {
            Error::new("neither folder nor folder_flag configured")
                .set_kind(ErrorKind::Configuration)
        })?;
        let mut found: Option<Vec<u8>> = None;
        self.stream.exec_command(b"LIST \"\" \"*\"", |logical| {
            if found.is_some() {
                return Ok(());
            }
            match protocol_parser::list_response(&logical) {
                Ok((_, list)) => {
                    if list.flags.iter().any(|f| f.as_slice() == flag.as_bytes()) {
                        found = Some(list.name);
                    }
                }
                Err(_) => {
                    log::debug!(
                        "unparsable LIST response {:?}",
                        String::from_utf8_lossy(&logical)
                    );
                }
            }
            Ok(())
        })?;
        found.ok_or_else(|| {
            Error::new(format!("no folder carries the {} flag", flag))
                .set_kind(ErrorKind::NotFound)
        })
    }

    /// Read-only select. Untagged EXISTS/FLAGS/OK lines are informational
    /// for our purposes and only logged.
    pub fn examine(&mut self, folder: &[u8]) -> Result<()> {
        let mut command = b"EXAMINE ".to_vec();
        command.extend_from_slice(folder);
        self.stream.exec_command(&command, |logical| {
            log::trace!("examine: {}", String::from_utf8_lossy(&logical));
            Ok(())
        })?;
        log::info!("examining {}", String::from_utf8_lossy(folder));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_latching() {
        let mut caps = Capabilities::default();
        latch_capabilities(
            &mut caps,
            b"* CAPABILITY IMAP4rev1 IDLE SASL-IR AUTH=XOAUTH2 X-GM-EXT-1",
        );
        assert!(has_capability(&caps, b"X-GM-EXT-1"));
        assert!(has_capability(&caps, b"x-gm-ext-1"));
        assert!(has_capability(&caps, b"SASL-IR"));
        assert!(has_capability(&caps, b"AUTH=XOAUTH2"));
        assert!(!has_capability(&caps, b"AUTH=PLAIN"));

        // latching from the tagged OK response code accumulates
        latch_capabilities(&mut caps, b"OK [CAPABILITY IMAP4rev1 UIDPLUS] done");
        assert!(has_capability(&caps, b"UIDPLUS"));
        assert!(has_capability(&caps, b"IDLE"));
    }

    #[test]
    fn test_xoauth2_initial_response() {
        let encoded = xoauth2_initial_response("someuser@example.com", "ya29.token");
        let decoded = BASE64.decode(encoded.as_bytes()).unwrap();
        assert_eq!(
            decoded,
            b"user=someuser@example.com\x01auth=Bearer ya29.token\x01\x01".to_vec()
        );
    }

    #[test]
    fn test_challenge_failure() {
        let payload = BASE64.encode(br#"{"status":"401","schemes":"Bearer"}"#);
        assert!(challenge_failure(payload.as_bytes()).is_some());
        let payload = BASE64.encode(br#"{"status":"500"}"#);
        assert!(challenge_failure(payload.as_bytes()).is_some());
        // numeric status values count too
        assert!(challenge_failure(br#"{"status":401}"#).is_some());
        // 2xx or absent status is not a failure
        let payload = BASE64.encode(br#"{"status":"200"}"#);
        assert!(challenge_failure(payload.as_bytes()).is_none());
        assert!(challenge_failure(b"").is_none());
        assert!(challenge_failure(b"opaque-not-json").is_none());
    }
}
