/*
 * imapmirror - oauth2 module.
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

/*! OAuth2 token endpoint client.
 *
 * Exchanges a long-lived refresh token for a short-lived bearer token
 * before `AUTHENTICATE XOAUTH2`. One POST per (re)connection; failures are
 * authentication errors and never retried by the engine.
 */

use std::time::Duration;

use isahc::{config::Configurable, config::RedirectPolicy, HttpClient, ReadResponseExt};

use crate::error::{Error, ErrorKind, Result, ResultIntoError};

const TOKEN_TIMEOUT: Duration = Duration::from_secs(10);

pub fn fetch_access_token(
    request_url: &str,
    client_id: &str,
    client_secret: &str,
    refresh_token: &str,
) -> Result<String> {
    let body: String = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("client_id", client_id)
        .append_pair("client_secret", client_secret)
        .append_pair("refresh_token", refresh_token)
        .append_pair("grant_type", "refresh_token")
        .finish();

    let client = HttpClient::builder()
        .timeout(TOKEN_TIMEOUT)
        .redirect_policy(RedirectPolicy::Limit(3))
        .default_header("content-type", "application/x-www-form-urlencoded")
        .build()?;
    let mut response = client
        .post(request_url, body)
        .chain_err_summary(|| format!("Could not reach token endpoint {}", request_url))
        .chain_err_kind(ErrorKind::Authentication)?;
    let text = response
        .text()
        .chain_err_summary(|| "Could not read token endpoint response")
        .chain_err_kind(ErrorKind::Authentication)?;

    parse_token_response(&text)
}

fn parse_token_response(text: &str) -> Result<String> {
    let json: serde_json::Value = serde_json::from_str(text)
        .chain_err_summary(|| "Token endpoint did not return JSON")
        .chain_err_kind(ErrorKind::Authentication)?;
    if let Some(error) = json.get("error").and_then(|v| v.as_str()) {
        let description = json
            .get("error_description")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        return Err(Error::new(format!(
            "Token endpoint refused the refresh token: {} {}",
            error, description
        ))
        .set_kind(ErrorKind::Authentication));
    }
    json.get("access_token")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            Error::new("Token endpoint response carries no access_token")
                .set_kind(ErrorKind::Authentication)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_response() {
        assert_eq!(
            parse_token_response(r#"{"access_token":"ya29.tok","expires_in":3599}"#).unwrap(),
            "ya29.tok"
        );
        let err = parse_token_response(
            r#"{"error":"invalid_grant","error_description":"Token has been revoked."}"#,
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Authentication);
        assert!(err.summary.contains("invalid_grant"));

        assert!(parse_token_response("not json").is_err());
        assert!(parse_token_response("{}").is_err());
    }
}
