/*
 * imapmirror - error module.
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

/*! An error object for the entire crate.
 *
 * Every fallible call returns [`Result`]. The [`ErrorKind`] discriminant is
 * what the outer engine loop inspects to decide between reconnecting and
 * exiting: transport-level kinds are recoverable, everything else is fatal.
 */

use std::{borrow::Cow, fmt, io, result, str, string, sync::Arc};

pub type Result<T> = result::Result<T, Error>;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ErrorKind {
    /// Unclassified failure; treated as fatal.
    #[default]
    None,
    /// Connection, TLS or mid-command I/O failure. Recoverable by
    /// reconnecting and resuming from the checkpoint.
    Network,
    /// A read deadline elapsed. Recoverable like [`ErrorKind::Network`].
    Timeout,
    /// LOGIN/AUTHENTICATE was rejected, or the token endpoint failed.
    /// Never retried.
    Authentication,
    /// The server sent something the protocol engine cannot make sense of,
    /// or lacks a capability the configuration requires.
    Protocol,
    /// Invalid or conflicting configuration, unusable target directory.
    Configuration,
    /// A requested entity (e.g. a folder with the configured flag) does not
    /// exist on the server.
    NotFound,
    /// A termination signal arrived while a read was blocked. The engine
    /// turns this into a clean logout, not a failure.
    Interrupted,
}

impl ErrorKind {
    /// Whether dropping the session and reconnecting can clear this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Network | Self::Timeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(match self {
            Self::None => "Error",
            Self::Network => "Network error",
            Self::Timeout => "Timeout",
            Self::Authentication => "Authentication error",
            Self::Protocol => "Protocol error",
            Self::Configuration => "Configuration error",
            Self::NotFound => "Not found",
            Self::Interrupted => "Interrupted",
        })
    }
}

#[derive(Clone, Debug)]
pub struct Error {
    pub summary: Cow<'static, str>,
    pub details: Option<Cow<'static, str>>,
    pub source: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
    pub kind: ErrorKind,
}

impl Error {
    pub fn new<M>(msg: M) -> Self
    where
        M: Into<Cow<'static, str>>,
    {
        Self {
            summary: msg.into(),
            details: None,
            source: None,
            kind: ErrorKind::default(),
        }
    }

    pub fn set_details<M>(mut self, details: M) -> Self
    where
        M: Into<Cow<'static, str>>,
    {
        self.details = Some(details.into());
        self
    }

    pub fn set_source(
        mut self,
        new_val: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        self.source = new_val;
        self
    }

    pub fn set_kind(mut self, new_val: ErrorKind) -> Self {
        self.kind = new_val;
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", self.summary)?;
        if let Some(details) = self.details.as_ref() {
            write!(fmt, ": {}", details)?;
        }
        if let Some(source) = self.source.as_ref() {
            write!(fmt, "\nCaused by: {}", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|s| &(*(*s)) as _)
    }
}

pub trait IntoError {
    fn set_err_summary<M>(self, msg: M) -> Error
    where
        M: Into<Cow<'static, str>>;

    fn set_err_kind(self, kind: ErrorKind) -> Error;
}

pub trait ResultIntoError<T> {
    fn chain_err_summary<M, F>(self, msg_fn: F) -> Result<T>
    where
        F: Fn() -> M,
        M: Into<Cow<'static, str>>;

    fn chain_err_kind(self, kind: ErrorKind) -> Result<T>;
}

impl<I: Into<Error>> IntoError for I {
    #[inline]
    fn set_err_summary<M>(self, msg: M) -> Error
    where
        M: Into<Cow<'static, str>>,
    {
        let mut err: Error = self.into();
        if err.details.is_none() {
            err.details = Some(std::mem::replace(&mut err.summary, Cow::Borrowed("")));
        }
        err.summary = msg.into();
        err
    }

    #[inline]
    fn set_err_kind(self, kind: ErrorKind) -> Error {
        let err: Error = self.into();
        err.set_kind(kind)
    }
}

impl<T, I: Into<Error>> ResultIntoError<T> for result::Result<T, I> {
    #[inline]
    fn chain_err_summary<M, F>(self, msg_fn: F) -> Result<T>
    where
        F: Fn() -> M,
        M: Into<Cow<'static, str>>,
    {
        self.map_err(|err| err.set_err_summary(msg_fn()))
    }

    #[inline]
    fn chain_err_kind(self, kind: ErrorKind) -> Result<T> {
        self.map_err(|err| err.set_err_kind(kind))
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ErrorKind::Timeout,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => ErrorKind::Network,
            _ => ErrorKind::None,
        };
        Self::new(err.to_string())
            .set_source(Some(Arc::new(err)))
            .set_kind(kind)
    }
}

impl From<native_tls::Error> for Error {
    #[inline]
    fn from(err: native_tls::Error) -> Self {
        Self::new(err.to_string())
            .set_source(Some(Arc::new(err)))
            .set_kind(ErrorKind::Network)
    }
}

impl From<native_tls::HandshakeError<std::net::TcpStream>> for Error {
    #[inline]
    fn from(err: native_tls::HandshakeError<std::net::TcpStream>) -> Self {
        Self::new(err.to_string()).set_kind(ErrorKind::Network)
    }
}

impl From<isahc::Error> for Error {
    #[inline]
    fn from(err: isahc::Error) -> Self {
        Self::new(err.to_string())
            .set_source(Some(Arc::new(err)))
            .set_kind(ErrorKind::Network)
    }
}

impl From<isahc::http::Error> for Error {
    #[inline]
    fn from(err: isahc::http::Error) -> Self {
        Self::new(err.to_string()).set_source(Some(Arc::new(err)))
    }
}

impl From<serde_json::Error> for Error {
    #[inline]
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string()).set_source(Some(Arc::new(err)))
    }
}

impl From<string::FromUtf8Error> for Error {
    #[inline]
    fn from(err: string::FromUtf8Error) -> Self {
        Self::new(err.to_string()).set_source(Some(Arc::new(err)))
    }
}

impl From<str::Utf8Error> for Error {
    #[inline]
    fn from(err: str::Utf8Error) -> Self {
        Self::new(err.to_string()).set_source(Some(Arc::new(err)))
    }
}

impl From<std::num::ParseIntError> for Error {
    #[inline]
    fn from(err: std::num::ParseIntError) -> Self {
        Self::new(err.to_string()).set_source(Some(Arc::new(err)))
    }
}

impl From<data_encoding::DecodeError> for Error {
    #[inline]
    fn from(err: data_encoding::DecodeError) -> Self {
        Self::new(err.to_string()).set_source(Some(Arc::new(err)))
    }
}

impl<'a> From<nom::Err<nom::error::Error<&'a [u8]>>> for Error {
    #[inline]
    fn from(err: nom::Err<nom::error::Error<&'a [u8]>>) -> Self {
        Self::new(format!("{:?}", err)).set_kind(ErrorKind::Protocol)
    }
}

impl From<Cow<'_, str>> for Error {
    #[inline]
    fn from(msg: Cow<'_, str>) -> Self {
        Self::new(msg.into_owned())
    }
}

impl From<String> for Error {
    #[inline]
    fn from(msg: String) -> Self {
        Self::new(msg)
    }
}

impl From<&'static str> for Error {
    #[inline]
    fn from(msg: &'static str) -> Self {
        Self::new(msg)
    }
}
