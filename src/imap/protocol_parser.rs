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

/*! Parsers for the RFC 3501 response subset the mirror consumes.
 *
 * Two layers: [`parse_tokens`] turns one complete logical response (wire
 * bytes, literals inline) into a token tree, and a handful of nom parsers
 * handle the line-shaped responses (CAPABILITY, LIST, EXISTS, the UID-only
 * FETCH rows of the discovery phase) that never carry literals.
 */

use std::str::FromStr;

use nom::{
    bytes::complete::{is_not, tag, take, take_until, take_while1},
    character::complete::digit1,
    combinator::{map_res, opt},
    multi::separated_list1,
    sequence::delimited,
    IResult,
};
use smallvec::SmallVec;

use crate::error::{Error, ErrorKind, Result};

pub const UNTAGGED_PREFIX: &[u8] = b"* ";

macro_rules! to_str (
    ($v:expr) => (unsafe{ std::str::from_utf8_unchecked($v) })
);

/// One node of a parsed server response.
///
/// Atoms keep their raw bytes (including any leading backslash of flag
/// atoms); quoted strings are stored with their escapes resolved; literals
/// are the exact byte block the server declared.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ResponseToken {
    Atom(Vec<u8>),
    Quoted(Vec<u8>),
    Literal(Vec<u8>),
    List(Vec<ResponseToken>),
}

impl ResponseToken {
    pub fn as_atom(&self) -> Option<&[u8]> {
        match self {
            Self::Atom(a) => Some(a),
            _ => None,
        }
    }

    /// The payload bytes of any non-list token.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Atom(b) | Self::Quoted(b) | Self::Literal(b) => Some(b),
            Self::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ResponseToken]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }
}

fn nested_level_error() -> Error {
    Error::new("incorrect nested level").set_kind(ErrorKind::Protocol)
}

/// If `line` ends in a literal marker `{N}`, the declared byte count.
///
/// The command channel uses this while assembling a logical response: the
/// next N wire bytes belong to this response verbatim, and the response
/// continues on the line after them.
pub fn trailing_literal_len(line: &[u8]) -> Option<usize> {
    if !line.ends_with(b"}") {
        return None;
    }
    let open = line.iter().rposition(|&b| b == b'{')?;
    let digits = &line[open + 1..line.len() - 1];
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    usize::from_str(to_str!(digits)).ok()
}

/// Parse one logical response into its top-level tokens.
///
/// `input` is the raw response with any literals inline in their wire form
/// (`{N}\r\n` followed by N bytes), which is exactly how the command channel
/// hands responses over.
pub fn parse_tokens(input: &[u8]) -> Result<Vec<ResponseToken>> {
    let mut stack: Vec<Vec<ResponseToken>> = vec![Vec::new()];
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            b' ' | b'\t' | b'\r' | b'\n' => {
                i += 1;
            }
            b'(' => {
                stack.push(Vec::new());
                i += 1;
            }
            b')' => {
                let list = stack.pop().unwrap_or_default();
                match stack.last_mut() {
                    Some(parent) => parent.push(ResponseToken::List(list)),
                    None => return Err(nested_level_error()),
                }
                i += 1;
            }
            b'"' => {
                let mut value = Vec::new();
                let mut j = i + 1;
                loop {
                    match input.get(j) {
                        Some(b'\\') => {
                            match input.get(j + 1) {
                                Some(&escaped) => value.push(escaped),
                                None => {
                                    return Err(Error::new("unterminated quoted string")
                                        .set_kind(ErrorKind::Protocol));
                                }
                            }
                            j += 2;
                        }
                        Some(b'"') => {
                            j += 1;
                            break;
                        }
                        Some(&b) => {
                            value.push(b);
                            j += 1;
                        }
                        None => {
                            return Err(Error::new("unterminated quoted string")
                                .set_kind(ErrorKind::Protocol));
                        }
                    }
                }
                // a `)` straight after the closing quote is picked up by the
                // next loop iteration without requiring whitespace
                stack
                    .last_mut()
                    .ok_or_else(nested_level_error)?
                    .push(ResponseToken::Quoted(value));
                i = j;
            }
            b'{' => match parse_inline_literal(&input[i..]) {
                Some((consumed, value)) => {
                    stack
                        .last_mut()
                        .ok_or_else(nested_level_error)?
                        .push(ResponseToken::Literal(value));
                    i += consumed;
                }
                None => {
                    let (consumed, atom) = take_atom(&input[i..]);
                    stack
                        .last_mut()
                        .ok_or_else(nested_level_error)?
                        .push(ResponseToken::Atom(atom));
                    i += consumed;
                }
            },
            _ => {
                let (consumed, atom) = take_atom(&input[i..]);
                stack
                    .last_mut()
                    .ok_or_else(nested_level_error)?
                    .push(ResponseToken::Atom(atom));
                i += consumed;
            }
        }
    }
    if stack.len() != 1 {
        return Err(nested_level_error());
    }
    Ok(stack.pop().unwrap_or_default())
}

/// `{N}\r\n<N bytes>`; returns (bytes consumed, literal contents).
fn parse_inline_literal(input: &[u8]) -> Option<(usize, Vec<u8>)> {
    let close = input.iter().position(|&b| b == b'}')?;
    let digits = &input[1..close];
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let len = usize::from_str(to_str!(digits)).ok()?;
    let start = close + 1 + b"\r\n".len();
    if !input[close + 1..].starts_with(b"\r\n") || input.len() < start + len {
        return None;
    }
    Some((start + len, input[start..start + len].to_vec()))
}

fn take_atom(input: &[u8]) -> (usize, Vec<u8>) {
    let end = input
        .iter()
        .position(|&b| matches!(b, b' ' | b'\t' | b'\r' | b'\n' | b'(' | b')' | b'"'))
        .unwrap_or(input.len());
    (end, input[..end].to_vec())
}

/// Delivery status of a mirrored message, derived from `X-GM-LABELS` when
/// the server advertises `X-GM-EXT-1`. Servers without the extension yield
/// [`MessageStatus::Unknown`]; nothing is fabricated for them.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum MessageStatus {
    Received,
    Sent,
    SentReceived,
    Draft,
    #[default]
    Unknown,
}

impl MessageStatus {
    pub fn from_labels(labels: &[Vec<u8>]) -> Self {
        let has = |needle: &[u8]| labels.iter().any(|l| l.as_slice() == needle);
        if has(b"\\Sent") && has(b"\\Inbox") {
            Self::SentReceived
        } else if has(b"\\Sent") {
            Self::Sent
        } else if has(b"\\Draft") {
            Self::Draft
        } else {
            Self::Received
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str(match self {
            Self::Received => "Received",
            Self::Sent => "Sent",
            Self::SentReceived => "Sent+Received",
            Self::Draft => "Draft",
            Self::Unknown => "Unknown",
        })
    }
}

/// The attributes the streaming phase extracts from one FETCH row.
#[derive(Debug, Default)]
pub struct FetchRow {
    pub seq: usize,
    pub uid: Option<u64>,
    pub internal_date: Option<Vec<u8>>,
    pub body: Option<Vec<u8>>,
    pub labels: Option<Vec<Vec<u8>>>,
}

/// Interpret the token tree of one `* <seq> FETCH (...)` response.
pub fn fetch_row(tokens: Vec<ResponseToken>) -> Result<FetchRow> {
    let mut iter = tokens.into_iter();
    let seq = match iter.next() {
        Some(ResponseToken::Atom(seq)) if seq.iter().all(u8::is_ascii_digit) => {
            usize::from_str(to_str!(&seq))?
        }
        other => {
            return Err(Error::new(format!(
                "expected FETCH sequence number, got {:?}",
                other
            ))
            .set_kind(ErrorKind::Protocol));
        }
    };
    match iter.next() {
        Some(ResponseToken::Atom(verb)) if verb.eq_ignore_ascii_case(b"FETCH") => {}
        other => {
            return Err(
                Error::new(format!("expected FETCH, got {:?}", other))
                    .set_kind(ErrorKind::Protocol),
            );
        }
    }
    let fields = match iter.next() {
        Some(ResponseToken::List(fields)) => fields,
        other => {
            return Err(Error::new(format!(
                "expected FETCH attribute list, got {:?}",
                other
            ))
            .set_kind(ErrorKind::Protocol));
        }
    };

    let mut row = FetchRow {
        seq,
        ..FetchRow::default()
    };
    let mut fields = fields.into_iter();
    while let Some(key) = fields.next() {
        let key = match key {
            ResponseToken::Atom(key) => key,
            other => {
                log::debug!("skipping non-atom FETCH key {:?}", other);
                continue;
            }
        };
        let value = fields.next();
        match (key.as_slice(), value) {
            (b"UID", Some(ResponseToken::Atom(uid))) => {
                row.uid = Some(u64::from_str(to_str!(&uid))?);
            }
            (b"RFC822", Some(ResponseToken::Literal(body))) => {
                row.body = Some(body);
            }
            (b"INTERNALDATE", Some(ResponseToken::Quoted(date))) => {
                row.internal_date = Some(date);
            }
            (b"X-GM-LABELS", Some(ResponseToken::List(labels))) => {
                row.labels = Some(
                    labels
                        .into_iter()
                        .filter_map(|l| match l {
                            ResponseToken::Atom(a) | ResponseToken::Quoted(a) => Some(a),
                            _ => None,
                        })
                        .collect(),
                );
            }
            (key, value) => {
                log::debug!(
                    "ignoring FETCH attribute {} = {:?}",
                    String::from_utf8_lossy(key),
                    value
                );
            }
        }
    }
    Ok(row)
}

/* Input Example:
 * ==============
 *
 *  "1 OK [CAPABILITY IMAP4rev1 LITERAL+ SASL-IR IDLE] Logged in\r\n"
 *  "* CAPABILITY IMAP4rev1 UNSELECT IDLE NAMESPACE QUOTA ID XLIST CHILDREN
 *   X-GM-EXT-1 XYZZY SASL-IR AUTH=XOAUTH2 AUTH=PLAIN\r\n"
 */
pub fn capabilities(input: &[u8]) -> IResult<&[u8], Vec<&[u8]>> {
    let (input, _) = take_until("CAPABILITY")(input)?;
    let (input, _) = tag("CAPABILITY ")(input)?;
    separated_list1(tag(" "), is_not(" ]\r\n"))(input)
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ListResponse {
    pub flags: SmallVec<[Vec<u8>; 8]>,
    /// The folder name exactly as the server sent it, quoting included; it
    /// is passed through to EXAMINE without requoting.
    pub name: Vec<u8>,
}

/*
 * LIST (\HasNoChildren) "/" INBOX
 * LIST (\All \HasNoChildren) "/" "[Gmail]/All Mail"
 */
pub fn list_response(input: &[u8]) -> IResult<&[u8], ListResponse> {
    let (input, _) = tag("* LIST (")(input)?;
    let (input, properties) = take_until(")")(input)?;
    let (input, _) = tag(") ")(input)?;
    let (input, _separator) = nom::branch::alt((
        delimited(tag("\""), take(1_usize), tag("\"")),
        tag("NIL"),
    ))(input)?;
    let (input, _) = tag(" ")(input)?;
    let name = match input.strip_suffix(b"\r\n") {
        Some(name) => name,
        None => input,
    };
    Ok((
        &input[input.len()..],
        ListResponse {
            flags: properties
                .split(|&b| b == b' ')
                .filter(|f| !f.is_empty())
                .map(<[u8]>::to_vec)
                .collect(),
            name: name.to_vec(),
        },
    ))
}

/* "* 172 EXISTS" */
pub fn untagged_exists(input: &[u8]) -> IResult<&[u8], usize> {
    let (input, _) = tag(UNTAGGED_PREFIX)(input)?;
    let (input, num) = map_res(digit1, |s| usize::from_str(to_str!(s)))(input)?;
    let (input, _) = tag(" EXISTS")(input)?;
    Ok((input, num))
}

/* Discovery rows: "* 23 FETCH (UID 4827313)" */
pub fn uid_fetch_uid_response(input: &[u8]) -> IResult<&[u8], (usize, u64)> {
    let (input, _) = tag(UNTAGGED_PREFIX)(input)?;
    let (input, seq) = map_res(digit1, |s| usize::from_str(to_str!(s)))(input)?;
    let (input, _) = tag(" FETCH (")(input)?;
    let (input, _) = opt(tag(" "))(input)?;
    let (input, _) = tag("UID ")(input)?;
    let (input, uid) = map_res(take_while1(|b: u8| b.is_ascii_digit()), |s| {
        u64::from_str(to_str!(s))
    })(input)?;
    let (input, _) = opt(tag(" "))(input)?;
    let (input, _) = tag(")")(input)?;
    Ok((input, (seq, uid)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atom(s: &str) -> ResponseToken {
        ResponseToken::Atom(s.as_bytes().to_vec())
    }

    fn quoted(s: &str) -> ResponseToken {
        ResponseToken::Quoted(s.as_bytes().to_vec())
    }

    #[test]
    fn test_parse_tokens_fetch_with_literal() {
        let input =
            b"* 1 FETCH (UID 42 INTERNALDATE \"01-Jan-2020 10:20:30 +0000\" RFC822 {5}\r\nhello)";
        let tokens = parse_tokens(input).unwrap();
        assert_eq!(
            tokens,
            vec![
                atom("*"),
                atom("1"),
                atom("FETCH"),
                ResponseToken::List(vec![
                    atom("UID"),
                    atom("42"),
                    atom("INTERNALDATE"),
                    quoted("01-Jan-2020 10:20:30 +0000"),
                    atom("RFC822"),
                    ResponseToken::Literal(b"hello".to_vec()),
                ]),
            ]
        );
    }

    #[test]
    fn test_parse_tokens_literal_resumes_next_line() {
        // the literal is exactly 3 bytes (`a\r\n`); parsing resumes on the
        // continuation line with `b`
        let input = b"* 2 FETCH (UID 43 X-GM-LABELS (\\Inbox \\Sent) RFC822 {3}\r\na\r\nb INTERNALDATE \"02-Feb-2021 11:22:33 -0500\")";
        let tokens = parse_tokens(input).unwrap();
        assert_eq!(
            tokens,
            vec![
                atom("*"),
                atom("2"),
                atom("FETCH"),
                ResponseToken::List(vec![
                    atom("UID"),
                    atom("43"),
                    atom("X-GM-LABELS"),
                    ResponseToken::List(vec![atom("\\Inbox"), atom("\\Sent")]),
                    atom("RFC822"),
                    ResponseToken::Literal(b"a\r\n".to_vec()),
                    atom("b"),
                    atom("INTERNALDATE"),
                    quoted("02-Feb-2021 11:22:33 -0500"),
                ]),
            ]
        );
    }

    #[test]
    fn test_parse_tokens_literal_verbatim_bytes() {
        // CRLF, parens, braces and 8-bit bytes inside the declared length
        // must come through untouched
        let mut input = b"* 9 FETCH (RFC822 {12}\r\n".to_vec();
        let payload = b")\r\n{\xc3\xa9\x00\xffabc}";
        assert_eq!(payload.len(), 12);
        input.extend_from_slice(payload);
        input.extend_from_slice(b")");
        let tokens = parse_tokens(&input).unwrap();
        assert_eq!(
            tokens[3].as_list().unwrap()[1],
            ResponseToken::Literal(payload.to_vec())
        );
    }

    #[test]
    fn test_parse_tokens_quoted_escapes() {
        let tokens = parse_tokens(b"(\"a\\\"b\\\\c\")").unwrap();
        assert_eq!(
            tokens,
            vec![ResponseToken::List(vec![quoted("a\"b\\c")])]
        );
        // closing paren directly after the closing quote
        let tokens = parse_tokens(b"(INTERNALDATE \"x\")").unwrap();
        assert_eq!(
            tokens,
            vec![ResponseToken::List(vec![atom("INTERNALDATE"), quoted("x")])]
        );
        assert!(parse_tokens(b"\"unterminated").is_err());
    }

    #[test]
    fn test_parse_tokens_nesting_errors() {
        let err = parse_tokens(b"(a))").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Protocol);
        assert!(err.summary.contains("incorrect nested level"));
        assert!(parse_tokens(b"((a)").is_err());
        assert!(parse_tokens(b")").is_err());
        // balanced nesting parses at any depth
        let tokens = parse_tokens(b"(a (b (c)) d)").unwrap();
        assert_eq!(
            tokens,
            vec![ResponseToken::List(vec![
                atom("a"),
                ResponseToken::List(vec![atom("b"), ResponseToken::List(vec![atom("c")])]),
                atom("d"),
            ])]
        );
    }

    #[test]
    fn test_parse_tokens_stray_brace_is_atom() {
        let tokens = parse_tokens(b"{notaliteral} x").unwrap();
        assert_eq!(tokens, vec![atom("{notaliteral}"), atom("x")]);
    }

    #[test]
    fn test_trailing_literal_len() {
        assert_eq!(trailing_literal_len(b"* 1 FETCH (RFC822 {5}"), Some(5));
        assert_eq!(trailing_literal_len(b"* 1 FETCH (RFC822 {0}"), Some(0));
        assert_eq!(trailing_literal_len(b"* 1 FETCH (UID 42)"), None);
        assert_eq!(trailing_literal_len(b"* x {}"), None);
        assert_eq!(trailing_literal_len(b"* x {5a}"), None);
    }

    #[test]
    fn test_fetch_row_extraction() {
        let input =
            b"* 1 FETCH (UID 42 INTERNALDATE \"01-Jan-2020 10:20:30 +0000\" RFC822 {5}\r\nhello)";
        let row = fetch_row(parse_tokens(&input[UNTAGGED_PREFIX.len()..]).unwrap()).unwrap();
        assert_eq!(row.seq, 1);
        assert_eq!(row.uid, Some(42));
        assert_eq!(row.body.as_deref(), Some(&b"hello"[..]));
        assert_eq!(
            row.internal_date.as_deref(),
            Some(&b"01-Jan-2020 10:20:30 +0000"[..])
        );
        assert_eq!(row.labels, None);
    }

    #[test]
    fn test_fetch_row_labels() {
        let input = b"* 7 FETCH (X-GM-LABELS (\\Inbox \\Sent) UID 50 INTERNALDATE \"01-Jan-2020 00:00:00 +0000\" RFC822 {2}\r\nhi)";
        let row = fetch_row(parse_tokens(&input[UNTAGGED_PREFIX.len()..]).unwrap()).unwrap();
        let labels = row.labels.unwrap();
        assert_eq!(
            MessageStatus::from_labels(&labels),
            MessageStatus::SentReceived
        );
    }

    #[test]
    fn test_status_derivation() {
        let l = |labels: &[&[u8]]| -> Vec<Vec<u8>> { labels.iter().map(|l| l.to_vec()).collect() };
        assert_eq!(
            MessageStatus::from_labels(&l(&[b"\\Inbox", b"\\Sent"])),
            MessageStatus::SentReceived
        );
        assert_eq!(
            MessageStatus::from_labels(&l(&[b"\\Sent"])),
            MessageStatus::Sent
        );
        assert_eq!(
            MessageStatus::from_labels(&l(&[b"\\Draft"])),
            MessageStatus::Draft
        );
        assert_eq!(
            MessageStatus::from_labels(&l(&[b"\\Inbox", b"work"])),
            MessageStatus::Received
        );
        assert_eq!(MessageStatus::from_labels(&l(&[])), MessageStatus::Received);
        assert_eq!(MessageStatus::SentReceived.to_string(), "Sent+Received");
    }

    #[test]
    fn test_capabilities() {
        let (_, caps) = capabilities(
            b"* CAPABILITY IMAP4rev1 UNSELECT IDLE X-GM-EXT-1 SASL-IR AUTH=XOAUTH2 AUTH=PLAIN\r\n",
        )
        .unwrap();
        assert!(caps.contains(&&b"X-GM-EXT-1"[..]));
        assert!(caps.contains(&&b"SASL-IR"[..]));
        assert!(caps.contains(&&b"AUTH=XOAUTH2"[..]));

        // capabilities embedded in a tagged OK response code
        let (_, caps) =
            capabilities(b"1 OK [CAPABILITY IMAP4rev1 LITERAL+ IDLE] Logged in\r\n").unwrap();
        assert_eq!(caps, vec![&b"IMAP4rev1"[..], b"LITERAL+", b"IDLE"]);
    }

    #[test]
    fn test_list_response() {
        let (_, list) =
            list_response(b"* LIST (\\All \\HasNoChildren) \"/\" \"[Gmail]/All Mail\"\r\n")
                .unwrap();
        assert_eq!(list.flags.len(), 2);
        assert!(list.flags.iter().any(|f| f == b"\\All"));
        // quoting comes through verbatim
        assert_eq!(list.name, b"\"[Gmail]/All Mail\"".to_vec());

        let (_, list) = list_response(b"* LIST (\\HasNoChildren) \"/\" INBOX\r\n").unwrap();
        assert_eq!(list.name, b"INBOX".to_vec());

        let (_, list) = list_response(b"* LIST () NIL Drafts").unwrap();
        assert!(list.flags.is_empty());
        assert_eq!(list.name, b"Drafts".to_vec());
    }

    #[test]
    fn test_untagged_exists() {
        assert_eq!(untagged_exists(b"* 172 EXISTS").unwrap().1, 172);
        assert!(untagged_exists(b"* OK still here").is_err());
        assert!(untagged_exists(b"* 3 RECENT").is_err());
    }

    #[test]
    fn test_uid_fetch_uid_response() {
        assert_eq!(
            uid_fetch_uid_response(b"* 23 FETCH (UID 4827313)").unwrap().1,
            (23, 4827313)
        );
        assert!(uid_fetch_uid_response(b"* 23 FETCH (FLAGS (\\Seen))").is_err());
    }
}
