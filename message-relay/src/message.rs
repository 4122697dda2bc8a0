use std::{fmt, io};

use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{DeserializeOwned, MapAccess, Visitor},
};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Service name a client must present in its `hello` frame.
pub const SERVICE_NAME: &str = "message-relay";

/// Longest line either side accepts, newline included.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Largest encoded [`Message`] that still fits a `request` frame with any id.
pub const MAX_MESSAGE_BYTES: usize = MAX_FRAME_BYTES - 64;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

/// Scalar payload value carried by a [`Message`] entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(value) => write!(f, "{value}"),
            Value::Integer(value) => write!(f, "{value}"),
            Value::Float(value) => write!(f, "{value}"),
            Value::String(value) => f.write_str(value),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

/// Ordered mapping of string keys to scalar values.
///
/// The broker never looks inside a message. Consumers treat the first entry as
/// the payload, so entry order is preserved on the wire: a message serializes
/// to a JSON object whose keys appear in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    entries: Vec<(String, Value)>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new().with(key, value)
    }

    /// Appends an entry. A repeated key replaces the earlier value in place.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((key, value)),
        }
        self
    }

    pub fn first(&self) -> Option<(&str, &Value)> {
        self.entries
            .first()
            .map(|(key, value)| (key.as_str(), value))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Size of the message as it appears inside a frame.
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map_or(usize::MAX, |encoded| encoded.len())
    }

    pub fn fits_in_frame(&self) -> bool {
        self.encoded_len() <= MAX_MESSAGE_BYTES
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.entries.iter().map(|(key, value)| (key, value)))
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MessageVisitor;

        impl<'de> Visitor<'de> for MessageVisitor {
            type Value = Message;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of string keys to scalar values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Message, A::Error> {
                let mut message = Message::new();
                while let Some((key, value)) = access.next_entry::<String, Value>()? {
                    message = message.with(key, value);
                }
                Ok(message)
            }
        }

        deserializer.deserialize_map(MessageVisitor)
    }
}

/// Status a receiver reports back for a request it was sent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Failure,
    ResourceLimitsExceeded,
    RemoteSystemUnavailable,
    MessageSizeTooLarge,
    Unknown,
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ResponseStatus::Success => "success",
            ResponseStatus::Failure => "failure",
            ResponseStatus::ResourceLimitsExceeded => "resource limits exceeded",
            ResponseStatus::RemoteSystemUnavailable => "remote system unavailable",
            ResponseStatus::MessageSizeTooLarge => "message size too large",
            ResponseStatus::Unknown => "unknown",
        };
        f.write_str(text)
    }
}

/// Frames exchanged between the broker and a client, in either direction once
/// the handshake has completed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Hello { service: String },
    Accepted,
    Rejected { reason: String },
    Request { id: u64, message: Message },
    Response { id: u64, status: ResponseStatus },
}

/// Reads the next frame, skipping blank lines. `Ok(None)` is a clean end of
/// stream. A line longer than [`MAX_FRAME_BYTES`] is refused without reading
/// the rest of it.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, FrameError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = (&mut *reader)
            .take(MAX_FRAME_BYTES as u64)
            .read_line(&mut line)
            .await?;
        if bytes == 0 {
            return Ok(None);
        }
        if bytes == MAX_FRAME_BYTES && !line.ends_with('\n') {
            return Err(FrameError::TooLarge {
                limit: MAX_FRAME_BYTES,
            });
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if !trimmed.is_empty() {
            return Ok(Some(serde_json::from_str(trimmed)?));
        }
    }
}

pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(frame)?;
    encoded.push(b'\n');
    if encoded.len() > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge {
            limit: MAX_FRAME_BYTES,
        });
    }
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_keeps_insertion_order_on_the_wire() {
        let message = Message::new().with("Echo", "hi").with("Count", 3_i64).with("A", true);

        let encoded = serde_json::to_string(&message).expect("encode message");
        assert_eq!(encoded, r#"{"Echo":"hi","Count":3,"A":true}"#);

        let decoded: Message = serde_json::from_str(r#"{"Z":1,"B":"two"}"#).expect("decode");
        assert_eq!(decoded.first(), Some(("Z", &Value::Integer(1))));
        assert_eq!(decoded.get("B"), Some(&Value::String("two".into())));
    }

    #[test]
    fn repeated_key_replaces_value_in_place() {
        let message = Message::single("Echo", "one").with("Other", 1.5).with("Echo", "two");
        let keys: Vec<_> = message.iter().map(|(key, _)| key).collect();
        assert_eq!(keys, vec!["Echo", "Other"]);
        assert_eq!(message.get("Echo"), Some(&Value::from("two")));
    }

    #[test]
    fn nested_values_are_rejected() {
        let result = serde_json::from_str::<Message>(r#"{"Echo":{"nested":1}}"#);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn request_frame_survives_the_line_codec() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = tokio::io::BufReader::new(reader);
        let frame = Frame::Request {
            id: 7,
            message: Message::single("Echo", "hi"),
        };

        write_frame(&mut writer, &frame).await.expect("write frame");
        let parsed = read_frame::<_, Frame>(&mut reader)
            .await
            .expect("read frame")
            .expect("expected frame");

        assert_eq!(frame, parsed);
    }

    #[test]
    fn largest_message_fits_a_request_frame_with_any_id() {
        let overhead = Message::single("Echo", "").encoded_len();
        let message = Message::single("Echo", "x".repeat(MAX_MESSAGE_BYTES - overhead));
        assert!(message.fits_in_frame());
        assert!(!message.clone().with("Echo", "x".repeat(MAX_MESSAGE_BYTES)).fits_in_frame());

        let frame = Frame::Request {
            id: u64::MAX,
            message,
        };
        let encoded = serde_json::to_vec(&frame).expect("encode frame");
        assert!(encoded.len() < MAX_FRAME_BYTES);
    }

    #[tokio::test]
    async fn oversized_lines_are_refused_on_read() {
        let mut input = vec![b' '; MAX_FRAME_BYTES + 10];
        input.push(b'\n');
        let mut reader = tokio::io::BufReader::new(input.as_slice());

        let result = read_frame::<_, Frame>(&mut reader).await;
        assert!(matches!(result, Err(FrameError::TooLarge { .. })));
    }

    #[tokio::test]
    async fn oversized_frames_are_never_written() {
        let mut written = Vec::new();
        let frame = Frame::Rejected {
            reason: "x".repeat(MAX_FRAME_BYTES),
        };

        let result = write_frame(&mut written, &frame).await;
        assert!(matches!(result, Err(FrameError::TooLarge { .. })));
        assert!(written.is_empty());
    }

    #[tokio::test]
    async fn garbage_is_reported_as_malformed() {
        let input: &[u8] = b"{not json\n";
        let mut reader = tokio::io::BufReader::new(input);

        let result = read_frame::<_, Frame>(&mut reader).await;
        assert!(matches!(result, Err(FrameError::Malformed(_))));
    }

    #[tokio::test]
    async fn read_frame_skips_blank_lines_and_reports_eof() {
        let input: &[u8] = b"\r\n\n{\"type\":\"accepted\"}\n";
        let mut reader = tokio::io::BufReader::new(input);

        let first = read_frame::<_, Frame>(&mut reader).await.expect("read");
        assert_eq!(first, Some(Frame::Accepted));
        let second = read_frame::<_, Frame>(&mut reader).await.expect("read");
        assert_eq!(second, None);
    }
}
