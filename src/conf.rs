/*
 * imapmirror - configuration module.
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

/*! Settings for the mirror run, read from `<directory>/config`.
 *
 * The file is line-oriented `key=value`; `#` starts a comment and blank
 * lines are skipped. Keys are folded to lowercase, values keep their case.
 */

use std::{collections::HashMap, path::Path, path::PathBuf};

use crate::error::{Error, ErrorKind, Result, ResultIntoError};

pub const DEFAULT_PORT_TLS: u16 = 993;
pub const DEFAULT_PORT_PLAIN: u16 = 143;

/// How the session proves who it is. The config file must select exactly
/// one variant.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AuthMethod {
    Login {
        password: String,
    },
    /// A bearer token obtained out of band, used verbatim.
    XOauth2Token {
        access_token: String,
    },
    /// Refresh the bearer token against an OAuth2 token endpoint before
    /// authenticating.
    XOauth2Refresh {
        request_url: String,
        client_id: String,
        client_secret: String,
        refresh_token: String,
    },
}

#[derive(Clone, Debug)]
pub struct MirrorConf {
    /// The target directory holding config, lock, checkpoint and mbox.
    pub directory: PathBuf,
    pub server: String,
    pub port: u16,
    pub use_tls: bool,
    pub user: String,
    pub auth: AuthMethod,
    /// Explicit folder name, passed to EXAMINE verbatim.
    pub folder: Option<String>,
    /// Flag to look for in `LIST` output when `folder` is not set,
    /// e.g. `\All`.
    pub folder_flag: Option<String>,
    /// External command to pipe each message into instead of the mbox.
    pub command: Option<String>,
}

const KNOWN_KEYS: &[&str] = &[
    "server",
    "port",
    "ssl",
    "user",
    "pass",
    "xoauth2_access_token",
    "xoauth2_request_url",
    "xoauth2_client_id",
    "xoauth2_client_secret",
    "xoauth2_refresh_token",
    "folder",
    "folder_flag",
    "command",
];

fn is_truthy(value: &str) -> bool {
    ["1", "true", "yes", "on"]
        .iter()
        .any(|t| value.eq_ignore_ascii_case(t))
}

impl MirrorConf {
    pub fn load(directory: &Path) -> Result<Self> {
        if !directory.is_dir() {
            return Err(Error::new(format!(
                "{} is not a directory",
                directory.display()
            ))
            .set_kind(ErrorKind::Configuration));
        }
        let path = directory.join("config");
        let contents = std::fs::read_to_string(&path)
            .chain_err_summary(|| format!("Could not read {}", path.display()))
            .chain_err_kind(ErrorKind::Configuration)?;
        Self::parse(directory, &contents)
    }

    fn parse(directory: &Path, contents: &str) -> Result<Self> {
        let mut map: HashMap<String, String> = HashMap::new();
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                Error::new(format!("config line {}: expected key=value", lineno + 1))
                    .set_kind(ErrorKind::Configuration)
            })?;
            let key = key.trim().to_lowercase();
            if !KNOWN_KEYS.contains(&key.as_str()) {
                log::warn!("config line {}: unknown key {:?} ignored", lineno + 1, key);
                continue;
            }
            map.insert(key, value.trim().to_string());
        }

        let required = |key: &'static str| -> Result<String> {
            map.get(key).cloned().ok_or_else(|| {
                Error::new(format!("missing required config key {:?}", key))
                    .set_kind(ErrorKind::Configuration)
            })
        };

        let server = required("server")?;
        let user = required("user")?;
        let use_tls = map.get("ssl").map(|v| is_truthy(v)).unwrap_or(false);
        let port = match map.get("port") {
            Some(v) => v
                .parse::<u16>()
                .chain_err_summary(|| format!("invalid port value {:?}", v))
                .chain_err_kind(ErrorKind::Configuration)?,
            None if use_tls => DEFAULT_PORT_TLS,
            None => DEFAULT_PORT_PLAIN,
        };

        let auth = {
            let pass = map.get("pass");
            let access_token = map.get("xoauth2_access_token");
            let request_url = map.get("xoauth2_request_url");
            match (pass, access_token, request_url) {
                (Some(password), None, None) => AuthMethod::Login {
                    password: password.clone(),
                },
                (None, Some(access_token), None) => AuthMethod::XOauth2Token {
                    access_token: access_token.clone(),
                },
                (None, None, Some(request_url)) => AuthMethod::XOauth2Refresh {
                    request_url: request_url.clone(),
                    client_id: required("xoauth2_client_id")?,
                    client_secret: required("xoauth2_client_secret")?,
                    refresh_token: required("xoauth2_refresh_token")?,
                },
                (None, None, None) => {
                    return Err(Error::new(
                        "one of pass, xoauth2_access_token or xoauth2_request_url is required",
                    )
                    .set_kind(ErrorKind::Configuration));
                }
                _ => {
                    return Err(Error::new(
                        "pass, xoauth2_access_token and xoauth2_request_url are mutually \
                         exclusive",
                    )
                    .set_kind(ErrorKind::Configuration));
                }
            }
        };

        let folder = map.get("folder").cloned();
        let folder_flag = map.get("folder_flag").cloned();
        if folder.is_none() && folder_flag.is_none() {
            return Err(
                Error::new("either folder or folder_flag is required")
                    .set_kind(ErrorKind::Configuration),
            );
        }

        Ok(Self {
            directory: directory.to_path_buf(),
            server,
            port,
            use_tls,
            user,
            auth,
            folder,
            folder_flag,
            command: map.get("command").cloned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(contents: &str) -> Result<MirrorConf> {
        MirrorConf::parse(Path::new("/tmp"), contents)
    }

    #[test]
    fn test_conf_defaults() {
        let conf = parse(
            "server=imap.example.com\n\
             user=admin\n\
             pass=hunter2\n\
             folder=INBOX\n",
        )
        .unwrap();
        assert_eq!(conf.server, "imap.example.com");
        assert!(!conf.use_tls);
        assert_eq!(conf.port, DEFAULT_PORT_PLAIN);
        assert_eq!(
            conf.auth,
            AuthMethod::Login {
                password: "hunter2".into()
            }
        );
        assert_eq!(conf.folder.as_deref(), Some("INBOX"));

        let conf = parse(
            "server=imap.example.com\nssl=1\nuser=admin\npass=hunter2\nfolder=INBOX\n",
        )
        .unwrap();
        assert!(conf.use_tls);
        assert_eq!(conf.port, DEFAULT_PORT_TLS);
    }

    #[test]
    fn test_conf_comments_case_and_unknown_keys() {
        let conf = parse(
            "# mirror of the work account\n\
             \n\
             SERVER=imap.example.com\n\
             Port = 1993\n\
             ssl=TRUE\n\
             user=admin\n\
             pass=S3cret= with = equals\n\
             whatever=ignored\n\
             folder_flag=\\All\n",
        )
        .unwrap();
        assert_eq!(conf.port, 1993);
        assert!(conf.use_tls);
        // Only the first `=` splits; value case is preserved.
        assert_eq!(
            conf.auth,
            AuthMethod::Login {
                password: "S3cret= with = equals".into()
            }
        );
        assert_eq!(conf.folder_flag.as_deref(), Some("\\All"));
    }

    #[test]
    fn test_conf_auth_exclusive() {
        let err = parse(
            "server=s\nuser=u\npass=p\nxoauth2_access_token=tok\nfolder=INBOX\n",
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);

        let err = parse("server=s\nuser=u\nfolder=INBOX\n").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);

        // the refresh path requires the client credentials
        let err = parse(
            "server=s\nuser=u\nxoauth2_request_url=https://x/token\nfolder=INBOX\n",
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);

        let conf = parse(
            "server=s\nuser=u\nfolder=INBOX\n\
             xoauth2_request_url=https://x/token\n\
             xoauth2_client_id=id\n\
             xoauth2_client_secret=sec\n\
             xoauth2_refresh_token=ref\n",
        )
        .unwrap();
        assert!(matches!(conf.auth, AuthMethod::XOauth2Refresh { .. }));
    }

    #[test]
    fn test_conf_needs_folder_or_flag() {
        let err = parse("server=s\nuser=u\npass=p\n").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
    }
}
