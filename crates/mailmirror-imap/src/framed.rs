//! Framed I/O for the IMAP wire format.
//!
//! Responses are CRLF-terminated lines that may embed `{n}` literals. A
//! FETCH of a full message arrives as one response whose literal carries
//! the whole RFC 5322 text.

#![allow(clippy::missing_errors_doc)]

use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::{Error, Result};

const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Maximum line length to prevent memory exhaustion.
const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Maximum literal size to prevent memory exhaustion.
const MAX_LITERAL_SIZE: usize = 100 * 1024 * 1024;

/// Buffered reader/writer over an IMAP connection.
pub struct FramedStream<S> {
    reader: BufReader<S>,
    /// Partial line carried across cancelled reads.
    line: Vec<u8>,
    write_buffer: BytesMut,
}

impl<S> FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Creates a new framed stream.
    pub fn new(stream: S) -> Self {
        Self {
            reader: BufReader::with_capacity(DEFAULT_BUFFER_SIZE, stream),
            line: Vec::new(),
            write_buffer: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
        }
    }

    /// Reads one complete response, including any embedded literals.
    pub async fn read_response(&mut self) -> Result<Vec<u8>> {
        let mut response = Vec::new();

        loop {
            let line = self.read_line().await?;
            response.extend_from_slice(&line);

            let Some(literal_len) = parse_literal_length(&line) else {
                break;
            };
            if literal_len > MAX_LITERAL_SIZE {
                return Err(Error::Protocol(format!(
                    "literal too large: {literal_len} bytes (max {MAX_LITERAL_SIZE})"
                )));
            }
            let start = response.len();
            response.resize(start + literal_len, 0);
            self.reader.read_exact(&mut response[start..]).await?;
        }

        Ok(response)
    }

    /// Waits until at least one byte is buffered.
    ///
    /// Cancel safe: no data is consumed, so it can race against a stop
    /// signal inside `tokio::select!`.
    pub async fn wait_readable(&mut self) -> Result<()> {
        if !self.line.is_empty() {
            return Ok(());
        }
        if self.reader.fill_buf().await?.is_empty() {
            return Err(connection_closed());
        }
        Ok(())
    }

    async fn read_line(&mut self) -> Result<Vec<u8>> {
        loop {
            let buf = self.reader.fill_buf().await?;
            if buf.is_empty() {
                return Err(connection_closed());
            }

            // A CR may already sit at the end of the partial line.
            let search_from = self.line.len().saturating_sub(1);
            self.line.extend_from_slice(buf);
            let consumed = buf.len();

            if let Some(pos) = find_crlf(&self.line[search_from..]) {
                let end = search_from + pos + 2;
                let overshoot = self.line.len() - end;
                self.reader.consume(consumed - overshoot);
                self.line.truncate(end);
                return Ok(std::mem::take(&mut self.line));
            }

            self.reader.consume(consumed);
            if self.line.len() > MAX_LINE_LENGTH {
                self.line.clear();
                return Err(Error::Protocol("line too long".to_string()));
            }
        }
    }

    /// Writes a complete command and flushes it.
    pub async fn write_command(&mut self, data: &[u8]) -> Result<()> {
        self.write_buffer.clear();
        self.write_buffer.extend_from_slice(data);

        let stream = self.reader.get_mut();
        stream.write_all(&self.write_buffer).await?;
        stream.flush().await?;

        Ok(())
    }
}

fn connection_closed() -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "connection closed",
    ))
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Parses a literal length from the end of a line: `{123}\r\n` or `{123+}\r\n`.
pub(crate) fn parse_literal_length(line: &[u8]) -> Option<usize> {
    let line = line.strip_suffix(b"\r\n")?;
    let line = line.strip_suffix(b"}")?;
    let line = line.strip_suffix(b"+").unwrap_or(line);
    let open = line.iter().rposition(|&b| b == b'{')?;
    let digits = &line[open + 1..];
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}
