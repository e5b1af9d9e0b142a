use std::io;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

pub const NICKNAME_PROMPT: &str = "Enter your nickname:";

/// Notices sent back to the client that caused them. `Display` is the exact
/// wire text, without the trailing newline.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Nickname cannot be empty.")]
    EmptyNickname,
    #[error("Nickname already taken. Please choose another.")]
    NicknameTaken,
    #[error("Invalid message format. Use @username <message>")]
    InvalidFormat,
    #[error("User '{0}' not found.")]
    UnknownUser(String),
}

/// A trimmed chat-mode line, classified by how the router treats it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatLine<'a> {
    Public(&'a str),
    Private { target: &'a str, body: &'a str },
    /// An `@` line with no message body.
    Malformed,
}

impl<'a> ChatLine<'a> {
    pub fn parse(line: &'a str) -> Self {
        if !line.starts_with('@') {
            return ChatLine::Public(line);
        }

        match line.split_once(char::is_whitespace) {
            Some((token, body)) => ChatLine::Private {
                target: &token[1..],
                body,
            },
            None => ChatLine::Malformed,
        }
    }
}

pub fn public_line(sender: &str, text: &str) -> String {
    format!("[Public] {sender}: {text}")
}

pub fn echo_line(sender: &str, text: &str) -> String {
    format!("[You] {sender}: {text}")
}

pub fn private_line(sender: &str, target: &str, text: &str) -> String {
    format!("[Private] {sender} -> {target}: {text}")
}

/// Reads one line, returning `None` once the peer has closed the stream.
/// Surrounding whitespace (including `\r\n`) is trimmed. Bytes that are not
/// UTF-8 become U+FFFD rather than failing the read.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let bytes = reader.read_until(b'\n', &mut line).await?;
    if bytes == 0 {
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(&line).trim().to_string()))
}

pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    // Line and terminator go out as a single buffer.
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}
