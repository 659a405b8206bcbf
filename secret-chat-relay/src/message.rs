use std::io;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// A username bound to the base64 public key it registered with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub username: String,
    pub public_key: String,
}

impl Identity {
    pub fn new(username: impl Into<String>, public_key: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            public_key: public_key.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ClientToRelay {
    #[serde(rename_all = "camelCase")]
    RegisterPublicKey { username: String, public_key: String },
    Message { username: String, message: String },
    /// `message` is a sealed box. The relay never looks inside it and
    /// ignores the client's `encrypted` claim.
    #[serde(rename_all = "camelCase")]
    PrivateMessage {
        username: String,
        message: String,
        target_username: String,
        #[serde(default)]
        encrypted: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum RelayToClient {
    Init {
        users: Vec<Identity>,
    },
    /// Confirms a registration. `users` is the roster as of the moment the
    /// name was taken; later joins and leaves arrive as separate events.
    Welcome {
        username: String,
        #[serde(default)]
        users: Vec<Identity>,
    },
    #[serde(rename_all = "camelCase")]
    NewUser {
        username: String,
        public_key: String,
    },
    UserLeft {
        username: String,
    },
    Message {
        username: String,
        message: String,
        #[serde(default)]
        encrypted: bool,
    },
    #[serde(rename_all = "camelCase")]
    PrivateMessage {
        username: String,
        target_username: String,
        message: String,
        encrypted: bool,
    },
    #[serde(rename_all = "camelCase")]
    RecipientNotFound {
        target_username: String,
    },
    Error {
        message: String,
    },
}

/// Usernames are ASCII letters, digits and underscores, so every
/// registered name can be addressed with `!secret`.
pub fn is_valid_username(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Reads events from a line stream, keeping partial lines across calls so
/// that `next` can sit in a `select!` next to other branches.
pub struct MessageReader<R> {
    inner: R,
    line: Vec<u8>,
}

impl<R> MessageReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            line: Vec::new(),
        }
    }

    pub async fn next<T>(&mut self) -> io::Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        loop {
            // read_until appends, so bytes from a cancelled call are still here.
            let bytes = self.inner.read_until(b'\n', &mut self.line).await?;
            if bytes == 0 {
                return Ok(None);
            }

            let line = std::mem::take(&mut self.line);
            let trimmed = trim_line_ending(&line);
            if trimmed.is_empty() {
                continue;
            }

            return serde_json::from_slice(trimmed).map(Some).map_err(to_io_error);
        }
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let end = line
        .iter()
        .rposition(|byte| !matches!(byte, b'\n' | b'\r'))
        .map_or(0, |last| last + 1);
    &line[..end]
}

/// One-shot read. Not cancel safe; use [`MessageReader`] inside `select!`.
pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    // One JSON object per line; blank lines are keep-alives and skipped.
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Decode failures surface as `InvalidData` so callers can tell a bad
/// payload apart from a broken connection.
pub fn is_malformed(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::InvalidData
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
