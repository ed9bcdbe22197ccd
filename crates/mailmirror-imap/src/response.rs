//! Parsed server responses.
//!
//! Only the shapes the sync engine consumes are modelled in detail: status
//! lines, `EXISTS`/`EXPUNGE` counters and `FETCH` attributes carrying a UID,
//! flags and a message section. Everything else parses to
//! [`Untagged::Other`].

#![allow(clippy::missing_errors_doc)]

use crate::lexer::{Lexer, Token};
use crate::{Error, Result};

/// Status of a status response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Command completed.
    Ok,
    /// Command failed.
    No,
    /// Command was malformed.
    Bad,
    /// Session is pre-authenticated.
    PreAuth,
    /// Server is closing the connection.
    Bye,
}

impl Status {
    fn parse(atom: &str) -> Option<Self> {
        match atom.to_ascii_uppercase().as_str() {
            "OK" => Some(Self::Ok),
            "NO" => Some(Self::No),
            "BAD" => Some(Self::Bad),
            "PREAUTH" => Some(Self::PreAuth),
            "BYE" => Some(Self::Bye),
            _ => None,
        }
    }
}

/// Attributes of one `FETCH` response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedMessage {
    /// Message sequence number.
    pub seq: u32,
    /// UID, when requested.
    pub uid: Option<u32>,
    /// Flags, when requested.
    pub flags: Option<Vec<String>>,
    /// Content of the `BODY[...]` or `RFC822*` item, if any.
    pub section: Option<Vec<u8>>,
}

/// Untagged server data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Untagged {
    /// `* OK|NO|BAD|PREAUTH|BYE [code] text`.
    Status {
        /// Response status.
        status: Status,
        /// Bracketed response code, without brackets.
        code: Option<String>,
        /// Human readable text.
        text: String,
    },
    /// `* n EXISTS`.
    Exists(u32),
    /// `* n EXPUNGE`.
    Expunge(u32),
    /// `* n FETCH (...)`.
    Fetch(FetchedMessage),
    /// Anything the engine does not need.
    Other,
}

/// A parsed server response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Command completion.
    Tagged {
        /// Tag of the completed command.
        tag: String,
        /// Completion status.
        status: Status,
        /// Human readable text.
        text: String,
    },
    /// `+ text` continuation request.
    Continuation(String),
    /// Untagged data.
    Untagged(Untagged),
}

/// Parses one complete response as returned by the framed reader.
pub fn parse(input: &[u8]) -> Result<Response> {
    let mut lexer = Lexer::new(input);
    match lexer.next_token()? {
        Token::Plus => Ok(Response::Continuation(rest_text(&lexer))),
        Token::Asterisk => {
            lexer.expect_space()?;
            parse_untagged(&mut lexer).map(Response::Untagged)
        }
        Token::Atom(tag) => {
            lexer.expect_space()?;
            let status = match lexer.next_token()? {
                Token::Atom(atom) => Status::parse(atom),
                _ => None,
            }
            .ok_or_else(|| lexer.error("expected status after tag"))?;
            Ok(Response::Tagged {
                tag: tag.to_string(),
                status,
                text: rest_text(&lexer),
            })
        }
        token => Err(lexer.error(&format!("unexpected response start {token:?}"))),
    }
}

fn parse_untagged(lexer: &mut Lexer<'_>) -> Result<Untagged> {
    match lexer.next_token()? {
        Token::Number(n) => {
            let n = u32::try_from(n).map_err(|_| lexer.error("number out of range"))?;
            lexer.expect_space()?;
            let Token::Atom(kind) = lexer.next_token()? else {
                return Ok(Untagged::Other);
            };
            match kind.to_ascii_uppercase().as_str() {
                "EXISTS" => Ok(Untagged::Exists(n)),
                "EXPUNGE" => Ok(Untagged::Expunge(n)),
                "FETCH" => {
                    lexer.expect_space()?;
                    parse_fetch(lexer, n).map(Untagged::Fetch)
                }
                _ => Ok(Untagged::Other),
            }
        }
        Token::Atom(atom) => match Status::parse(atom) {
            Some(status) => {
                let (code, text) = split_code(&rest_text(lexer));
                Ok(Untagged::Status { status, code, text })
            }
            None => Ok(Untagged::Other),
        },
        _ => Ok(Untagged::Other),
    }
}

fn parse_fetch(lexer: &mut Lexer<'_>, seq: u32) -> Result<FetchedMessage> {
    if lexer.next_token()? != Token::LParen {
        return Err(lexer.error("expected '(' after FETCH"));
    }
    let mut message = FetchedMessage {
        seq,
        ..FetchedMessage::default()
    };

    loop {
        let name = match lexer.next_token()? {
            Token::RParen => break,
            Token::Space => continue,
            Token::Atom(name) => name.to_ascii_uppercase(),
            token => return Err(lexer.error(&format!("unexpected {token:?} in FETCH"))),
        };

        match name.as_str() {
            "UID" => {
                lexer.expect_space()?;
                message.uid = Some(lexer.read_u32()?);
            }
            "FLAGS" => {
                lexer.expect_space()?;
                message.flags = Some(read_flag_list(lexer)?);
            }
            "BODY" if lexer.peek() == Some(b'[') => {
                lexer.skip_past(b']')?;
                if lexer.peek() == Some(b'<') {
                    lexer.skip_past(b'>')?;
                }
                lexer.expect_space()?;
                message.section = read_nstring(lexer)?;
            }
            "RFC822" | "RFC822.HEADER" | "RFC822.TEXT" => {
                lexer.expect_space()?;
                message.section = read_nstring(lexer)?;
            }
            _ => {
                lexer.expect_space()?;
                skip_value(lexer)?;
            }
        }
    }

    Ok(message)
}

fn read_flag_list(lexer: &mut Lexer<'_>) -> Result<Vec<String>> {
    if lexer.next_token()? != Token::LParen {
        return Err(lexer.error("expected flag list"));
    }
    let mut flags = Vec::new();
    loop {
        match lexer.next_token()? {
            Token::RParen => return Ok(flags),
            Token::Space => {}
            Token::Atom(flag) => flags.push(flag.to_string()),
            token => return Err(lexer.error(&format!("unexpected {token:?} in flag list"))),
        }
    }
}

fn read_nstring(lexer: &mut Lexer<'_>) -> Result<Option<Vec<u8>>> {
    match lexer.next_token()? {
        Token::Nil => Ok(None),
        Token::Literal(data) => Ok(Some(data.to_vec())),
        Token::Quoted(s) => Ok(Some(s.into_bytes())),
        token => Err(lexer.error(&format!("expected nstring, got {token:?}"))),
    }
}

fn skip_value(lexer: &mut Lexer<'_>) -> Result<()> {
    let mut depth = 0usize;
    loop {
        match lexer.next_token()? {
            Token::LParen => depth += 1,
            Token::RParen if depth > 0 => depth -= 1,
            Token::Eof | Token::Crlf | Token::RParen => {
                return Err(lexer.error("unterminated FETCH attribute"));
            }
            _ => {}
        }
        if depth == 0 {
            return Ok(());
        }
    }
}

fn rest_text(lexer: &Lexer<'_>) -> String {
    let rest = lexer.remaining();
    let rest = rest.strip_suffix(b"\r\n").unwrap_or(rest);
    let rest = rest.strip_prefix(b" ").unwrap_or(rest);
    String::from_utf8_lossy(rest).into_owned()
}

fn split_code(text: &str) -> (Option<String>, String) {
    if let Some(inner) = text.strip_prefix('[')
        && let Some((code, rest)) = inner.split_once(']')
    {
        return (Some(code.to_string()), rest.trim_start().to_string());
    }
    (None, text.to_string())
}

/// Extracts `UIDVALIDITY` from a response code such as `UIDVALIDITY 3857529045`.
#[must_use]
pub fn uid_validity(code: &str) -> Option<u32> {
    let (name, value) = code.split_once(' ')?;
    if name.eq_ignore_ascii_case("UIDVALIDITY") {
        value.trim().parse().ok()
    } else {
        None
    }
}

impl Status {
    /// Converts a tagged completion into a result.
    pub fn check(self, text: String) -> Result<()> {
        match self {
            Self::Ok => Ok(()),
            Self::No => Err(Error::No(text)),
            Self::Bad => Err(Error::Bad(text)),
            Self::Bye => Err(Error::Bye(text)),
            Self::PreAuth => Err(Error::Protocol(format!(
                "unexpected PREAUTH completion: {text}"
            ))),
        }
    }
}
