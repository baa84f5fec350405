//! Wire format shared by the dispatch server and the command executor.
//!
//! Every message is a single JSON object. Writers terminate each object with a
//! newline; readers decode objects incrementally from the byte stream, so peers
//! that send bare back-to-back objects (the Blender add-on does) are accepted
//! as well as newline-delimited ones.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

pub const DEFAULT_EXECUTOR_PORT: u16 = 9876;
/// Largest single message a reader will buffer before giving up.
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;
const READ_CHUNK: usize = 8192;

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct CommandMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub params: Map<String, JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
}

impl CommandMessage {
    pub fn new(kind: impl Into<String>, params: Map<String, JsonValue>) -> Self {
        Self {
            kind: kind.into(),
            params,
            id: Some(Uuid::new_v4()),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Outcome {
    Success {
        #[serde(default)]
        result: JsonValue,
    },
    Error {
        #[serde(default = "unknown_error")]
        message: String,
    },
}

fn unknown_error() -> String {
    "Unknown error from Blender".to_string()
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ResultMessage {
    #[serde(flatten)]
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
}

impl ResultMessage {
    pub fn success(id: Option<Uuid>, result: JsonValue) -> Self {
        Self {
            outcome: Outcome::Success { result },
            id,
        }
    }

    pub fn error(id: Option<Uuid>, message: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Error {
                message: message.into(),
            },
            id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success { .. })
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid JSON: {0}")]
    Syntax(serde_json::Error),
    #[error("unexpected message shape: {0}")]
    Shape(serde_json::Error),
    #[error("connection closed in the middle of a message")]
    Incomplete,
    #[error("message exceeds {0} bytes")]
    TooLarge(usize),
}

/// Tracks how far the buffer has been scanned for the end of the first
/// top-level value, so bytes are only looked at once per message.
#[derive(Debug, Default)]
struct Scan {
    pos: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl Scan {
    /// Advances over `buf` and reports whether it now holds a complete
    /// top-level value, or something that is not an object or array and
    /// must be handed to the parser as is.
    fn advance(&mut self, buf: &[u8]) -> bool {
        while self.pos < buf.len() {
            let byte = buf[self.pos];
            self.pos += 1;
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                }
                continue;
            }
            match byte {
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth = self.depth.saturating_sub(1);
                    if self.depth == 0 {
                        return true;
                    }
                }
                _ if self.depth == 0 && !byte.is_ascii_whitespace() => return true,
                b'"' => self.in_string = true,
                _ => {}
            }
        }
        false
    }
}

/// Incremental JSON object reader over any async byte stream.
pub struct MessageReader<R> {
    reader: R,
    buf: Vec<u8>,
    scan: Scan,
    limit: usize,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_limit(reader, MAX_MESSAGE_BYTES)
    }

    pub fn with_limit(reader: R, limit: usize) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            scan: Scan::default(),
            limit,
        }
    }

    /// Reads the next message, or `None` once the peer closes cleanly.
    pub async fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>, FrameError> {
        match self.next_value().await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(FrameError::Shape),
            None => Ok(None),
        }
    }

    pub async fn next_value(&mut self) -> Result<Option<JsonValue>, FrameError> {
        loop {
            if self.scan.advance(&self.buf) {
                if let Some(value) = self.try_decode()? {
                    return Ok(Some(value));
                }
            }
            if self.buf.len() > self.limit {
                return Err(FrameError::TooLarge(self.limit));
            }
            let mut chunk = [0u8; READ_CHUNK];
            let read = self.reader.read(&mut chunk).await?;
            if read == 0 {
                if self.buf.iter().all(u8::is_ascii_whitespace) {
                    return Ok(None);
                }
                return Err(FrameError::Incomplete);
            }
            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    fn try_decode(&mut self) -> Result<Option<JsonValue>, FrameError> {
        let mut stream = serde_json::Deserializer::from_slice(&self.buf).into_iter::<JsonValue>();
        match stream.next() {
            Some(Ok(value)) => {
                let consumed = stream.byte_offset();
                self.buf.drain(..consumed);
                self.scan = Scan::default();
                Ok(Some(value))
            }
            Some(Err(err)) if err.is_eof() => Ok(None),
            Some(Err(err)) => Err(FrameError::Syntax(err)),
            None => {
                self.buf.clear();
                self.scan = Scan::default();
                Ok(None)
            }
        }
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await
}
