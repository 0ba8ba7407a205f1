//! # Line Protocol Codec
//!
//! Purpose: Frame commands and read responses for the projector's
//! newline-delimited text protocol.
//!
//! ## Design Principles
//! 1. **Uniform Framing**: Every response is one line; quoting and JSON
//!    payloads are left to the caller.
//! 2. **Fail Fast**: A short write is reported, never continued, because
//!    the connection is no longer trustworthy.
//! 3. **Deadline Per Call**: Each write and each read sets its own deadline.

use std::time::Duration;

use crate::conn::{Connection, Deadline};
use crate::error::{ClientError, ClientResult};

/// Appended to every outgoing command.
pub const TERMINATOR: &[u8] = b"\r\n";

/// Ends every incoming response.
pub const DELIMITER: u8 = b'\n';

/// Encodes `text` followed by the terminator.
pub fn frame_command(text: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(text.len() + TERMINATOR.len());
    buf.extend_from_slice(text.as_bytes());
    buf.extend_from_slice(TERMINATOR);
    buf
}

/// Writes one framed command within `timeout`.
pub async fn write_command(
    conn: &mut dyn Connection,
    text: &str,
    timeout: Duration,
) -> ClientResult<()> {
    let frame = frame_command(text);
    conn.set_write_deadline(Some(Deadline::after(timeout)));

    let written = conn.write(&frame).await?;
    if written != frame.len() {
        return Err(ClientError::ShortWrite {
            written,
            expected: frame.len(),
            command: text.to_string(),
        });
    }
    Ok(())
}

/// Reads one response line within `timeout` and trims surrounding
/// whitespace, including the line terminator.
pub async fn read_response(conn: &mut dyn Connection, timeout: Duration) -> ClientResult<String> {
    conn.set_read_deadline(Some(Deadline::after(timeout)));

    let line = conn.read_until(DELIMITER).await?;
    tracing::debug!(parent: conn.span(), "response from command: {}", Hex(&line));

    Ok(String::from_utf8_lossy(&line).trim().to_string())
}

/// Writes `text` and reads its response, each bounded by `timeout`.
pub async fn exchange(
    conn: &mut dyn Connection,
    text: &str,
    timeout: Duration,
) -> ClientResult<String> {
    write_command(conn, text, timeout).await?;
    read_response(conn, timeout).await
}

/// Strips one pair of surrounding double quotes, if present.
pub fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(value)
}

struct Hex<'a>(&'a [u8]);

impl std::fmt::Display for Hex<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("0x")?;
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}
