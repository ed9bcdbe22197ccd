//! Canonical header digest and archive rendering.
//!
//! The digest covers only `From`, `Date` and `Message-ID`, so the same
//! message fetched from two mailboxes (or re-fetched after a crash) lands on
//! the same archive path even when the transport altered other headers.

use std::io::{self, Write};

use sha2::{Digest as _, Sha256};
use thiserror::Error;

/// Length of a content digest in bytes.
pub const DIGEST_LEN: usize = 20;

/// Truncated SHA-256 over the canonical headers.
pub type Digest = [u8; DIGEST_LEN];

/// Headers hashed into the digest, in hashing order.
pub const CANONICAL_HEADERS: [&str; 3] = ["From", "Date", "Message-ID"];

/// Headers written to an archived message, in output order.
pub const ARCHIVE_HEADERS: [&str; 12] = [
    "From",
    "To",
    "Cc",
    "Subject",
    "In-Reply-To",
    "References",
    "Date",
    "Message-ID",
    "MIME-Version",
    "Content-Type",
    "Content-Disposition",
    "Content-Transfer-Encoding",
];

/// A message header block that could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// No header lines before the end of input or the blank line.
    #[error("message has no header fields")]
    Empty,

    /// A line is neither a field nor a continuation.
    #[error("malformed header line {line}")]
    Malformed {
        /// One-based line number.
        line: usize,
    },
}

/// Header fields in arrival order, with folded values unfolded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    /// Creates an empty header block.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a field.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    /// Returns the first non-empty value of a field, matched case-insensitively.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.is_empty())
    }

    /// The `Message-ID` without angle brackets.
    #[must_use]
    pub fn message_id(&self) -> Option<&str> {
        self.get("Message-ID")
            .map(|id| id.trim_matches(|c| c == '<' || c == '>'))
            .filter(|id| !id.is_empty())
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if there are no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Parses a header block, stopping at the first blank line.
    ///
    /// Bytes that are not valid UTF-8 are replaced rather than rejected.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] when there are no fields or a line is
    /// neither `Name: value` nor a continuation.
    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        let text = String::from_utf8_lossy(raw);
        let mut headers = Self::new();

        for (n, line) in text.split('\n').enumerate() {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() {
                break;
            }

            if line.starts_with([' ', '\t']) {
                let Some((_, value)) = headers.fields.last_mut() else {
                    return Err(ParseError::Malformed { line: n + 1 });
                };
                if !value.is_empty() {
                    value.push(' ');
                }
                value.push_str(line.trim());
                continue;
            }

            match line.split_once(':') {
                Some((name, value)) if !name.is_empty() && !name.contains(' ') => {
                    headers.push(name, value.trim());
                }
                _ => return Err(ParseError::Malformed { line: n + 1 }),
            }
        }

        if headers.is_empty() {
            return Err(ParseError::Empty);
        }
        Ok(headers)
    }
}

/// Splits a raw message into its header block and body at the first blank line.
///
/// Without a blank line the whole input is treated as headers.
#[must_use]
pub fn split_message(raw: &[u8]) -> (&[u8], &[u8]) {
    let mut start = 0;
    while start < raw.len() {
        let end = raw[start..]
            .iter()
            .position(|&b| b == b'\n')
            .map_or(raw.len(), |p| start + p + 1);
        let line = &raw[start..end];
        if line == b"\n" || line == b"\r\n" {
            return (&raw[..start], &raw[end..]);
        }
        start = end;
    }
    (raw, &[])
}

fn write_fields<W: Write>(headers: &Headers, names: &[&str], out: &mut W) -> io::Result<u64> {
    let mut written = 0;
    for name in names {
        if let Some(value) = headers.get(name) {
            let line = format!("{name}: {value}\n");
            out.write_all(line.as_bytes())?;
            written += line.len() as u64;
        }
    }
    Ok(written)
}

/// The bytes hashed into the digest: one `Name: value\n` line per
/// canonical header that is present.
#[must_use]
pub fn canonical_bytes(headers: &Headers) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    // Writing into a Vec cannot fail.
    let _ = write_fields(headers, &CANONICAL_HEADERS, &mut out);
    out
}

/// Computes the content digest of a header block.
#[must_use]
pub fn digest(headers: &Headers) -> Digest {
    let hash = Sha256::digest(canonical_bytes(headers));
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(&hash[..DIGEST_LEN]);
    out
}

/// Writes the archived form of a message and returns the bytes written.
///
/// # Errors
///
/// Propagates write errors from `out`.
pub fn render<W: Write>(headers: &Headers, body: &[u8], out: &mut W) -> io::Result<u64> {
    let mut written = write_fields(headers, &ARCHIVE_HEADERS, out)?;
    out.write_all(b"\n")?;
    out.write_all(body)?;
    written += 1 + body.len() as u64;
    Ok(written)
}

/// Lowercase hex encoding.
#[must_use]
pub fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

/// Decodes lowercase or uppercase hex into exactly `N` bytes.
#[must_use]
pub fn from_hex<const N: usize>(hex: &str) -> Option<[u8; N]> {
    if hex.len() != N * 2 || !hex.is_ascii() {
        return None;
    }
    let mut out = [0u8; N];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MESSAGE: &[u8] = b"Received: from mx\r\n\
From: Alice <alice@example.com>\r\n\
To: bob@example.com\r\n\
Subject: lunch\r\n\
Date: Mon, 1 Jan 2024 12:00:00 +0000\r\n\
Message-ID: <abc@example.com>\r\n\
X-Spam: 0\r\n\
\r\n\
see you at noon\r\n";

    fn parsed() -> Headers {
        let (head, _) = split_message(MESSAGE);
        Headers::parse(head).unwrap()
    }

    #[test]
    fn parse_unfolds_and_ignores_case() {
        let headers = Headers::parse(b"subject: a\r\n  long\r\n\tline\r\nFROM: x@y\r\n").unwrap();
        assert_eq!(headers.get("Subject"), Some("a long line"));
        assert_eq!(headers.get("from"), Some("x@y"));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(Headers::parse(b""), Err(ParseError::Empty));
        assert_eq!(Headers::parse(b"\r\nbody"), Err(ParseError::Empty));
        assert_eq!(
            Headers::parse(b" leading continuation\r\n"),
            Err(ParseError::Malformed { line: 1 })
        );
        assert_eq!(
            Headers::parse(b"From: a\r\nnot a header\r\n"),
            Err(ParseError::Malformed { line: 2 })
        );
    }

    #[test]
    fn message_id_strips_brackets() {
        assert_eq!(parsed().message_id(), Some("abc@example.com"));
    }

    #[test]
    fn split_finds_first_blank_line() {
        let (head, body) = split_message(b"A: 1\nB: 2\n\nbody\n\nmore");
        assert_eq!(head, b"A: 1\nB: 2\n");
        assert_eq!(body, b"body\n\nmore");

        let (head, body) = split_message(b"A: 1\r\n");
        assert_eq!(head, b"A: 1\r\n");
        assert!(body.is_empty());
    }

    #[test]
    fn canonical_bytes_use_declared_names_and_order() {
        let mut headers = Headers::new();
        headers.push("message-id", "<m@x>");
        headers.push("DATE", "today");
        headers.push("from", "a@x");
        assert_eq!(
            canonical_bytes(&headers),
            b"From: a@x\nDate: today\nMessage-ID: <m@x>\n"
        );
    }

    #[test]
    fn digest_ignores_body_and_other_headers() {
        let mut other = MESSAGE.to_vec();
        other.extend_from_slice(b"P.S. bring cake\r\n");
        let (head, _) = split_message(&other);
        let mut headers = Headers::parse(head).unwrap();
        headers.push("Subject", "changed");
        assert_eq!(digest(&headers), digest(&parsed()));
    }

    #[test]
    fn digest_depends_on_canonical_values() {
        let mut changed = parsed();
        changed.fields.retain(|(n, _)| n != "Date");
        changed.push("Date", "Tue, 2 Jan 2024 12:00:00 +0000");
        assert_ne!(digest(&changed), digest(&parsed()));
    }

    #[test]
    fn digest_skips_absent_headers() {
        let mut only_from = Headers::new();
        only_from.push("From", "a@x");
        only_from.push("Date", "");
        let mut expected = Headers::new();
        expected.push("From", "a@x");
        assert_eq!(digest(&only_from), digest(&expected));
    }

    #[test]
    fn render_writes_ordered_subset_then_body() {
        let (head, body) = split_message(MESSAGE);
        let headers = Headers::parse(head).unwrap();
        let mut out = Vec::new();
        let n = render(&headers, body, &mut out).unwrap();

        let expected = b"From: Alice <alice@example.com>\n\
To: bob@example.com\n\
Subject: lunch\n\
Date: Mon, 1 Jan 2024 12:00:00 +0000\n\
Message-ID: <abc@example.com>\n\
\n\
see you at noon\r\n";
        assert_eq!(out, expected);
        assert_eq!(n, expected.len() as u64);
    }

    #[test]
    fn rendered_copy_rehashes_to_the_same_digest() {
        let (head, body) = split_message(MESSAGE);
        let headers = Headers::parse(head).unwrap();
        let mut out = Vec::new();
        render(&headers, body, &mut out).unwrap();

        let (head, _) = split_message(&out);
        assert_eq!(digest(&Headers::parse(head).unwrap()), digest(&headers));
    }

    #[test]
    fn hex_round_trip() {
        assert_eq!(to_hex(&[0x00, 0xab, 0x7f]), "00ab7f");
        assert_eq!(from_hex::<3>("00AB7f"), Some([0x00, 0xab, 0x7f]));
        assert_eq!(from_hex::<3>("00ab"), None);
        assert_eq!(from_hex::<2>("zz00"), None);
    }

    proptest! {
        #[test]
        fn digest_is_independent_of_field_order(
            from in "[a-z]{1,12}@[a-z]{1,8}\\.com",
            date in "[A-Za-z0-9 ,:+]{1,30}",
            id in "<[a-z0-9]{1,16}@[a-z]{1,8}>",
        ) {
            let mut a = Headers::new();
            a.push("From", from.clone());
            a.push("Date", date.clone());
            a.push("Message-ID", id.clone());
            let mut b = Headers::new();
            b.push("Message-ID", id);
            b.push("X-Other", "noise");
            b.push("Date", date);
            b.push("From", from);
            prop_assert_eq!(digest(&a), digest(&b));
        }
    }
}
