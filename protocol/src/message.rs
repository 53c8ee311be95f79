use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::mode::StreamName;
use crate::run::RemoteRun;
use crate::run::RunRecord;

/// Correlates a [`WorkerRequest`] with its [`WorkerResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Host → worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    Request { id: RequestId, body: WorkerRequest },
    Notification { body: WorkerNotification },
}

/// Requests that expect a correlated [`WorkerResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum WorkerRequest {
    Ping,
    SyncRun { run: RunRecord },
}

/// One-way messages. The worker processes them in arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum WorkerNotification {
    Run { run: RunRecord },
    Output { chunk: OutputChunk },
    Config { config: IndexMap<String, Value> },
    History { row: IndexMap<String, Value> },
    /// Flush and exit. Nothing sent after this is read.
    Shutdown,
}

/// Worker → host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Ready { pid: u32, version: String },
    Response { id: RequestId, result: WorkerResult },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerResult {
    Pong,
    Run { run: RemoteRun },
    Error { message: String },
}

/// A captured slice of a host stream. Bytes travel base64-encoded because
/// captured output is not guaranteed to be valid UTF-8.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub stream: StreamName,
    data: String,
}

impl OutputChunk {
    pub fn new(stream: StreamName, bytes: &[u8]) -> Self {
        Self {
            stream,
            data: BASE64.encode(bytes),
        }
    }

    pub fn bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.data)
    }
}

/// Serializes `message` as a single protocol line, including the trailing
/// newline.
pub fn encode_line<T: Serialize>(message: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

pub fn decode_line<T: DeserializeOwned>(line: &str) -> serde_json::Result<T> {
    serde_json::from_str(line.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn request_line_shape_is_stable() {
        let line = encode_line(&HostMessage::Request {
            id: RequestId(7),
            body: WorkerRequest::Ping,
        })
        .expect("encode");
        assert_eq!(
            line,
            "{\"type\":\"request\",\"id\":7,\"body\":{\"method\":\"ping\"}}\n"
        );
    }

    #[test]
    fn output_chunk_survives_non_utf8_bytes() {
        let chunk = OutputChunk::new(StreamName::Stderr, &[0xff, b'o', b'k', b'\n']);
        let line = encode_line(&HostMessage::Notification {
            body: WorkerNotification::Output {
                chunk: chunk.clone(),
            },
        })
        .expect("encode");

        let decoded = match decode_line::<HostMessage>(&line).expect("decode") {
            HostMessage::Notification {
                body: WorkerNotification::Output { chunk },
            } => chunk,
            other => panic!("unexpected message: {other:?}"),
        };
        assert_eq!(decoded.stream, StreamName::Stderr);
        assert_eq!(decoded.bytes().expect("base64"), vec![0xff, b'o', b'k', b'\n']);
    }

    #[test]
    fn remote_run_keeps_unknown_fields() {
        let line = r#"{"type":"response","id":3,"result":{"kind":"run","run":{"id":"abc","url":"https://example.test/r/abc","storage":"s3"}}}"#;
        let (id, run) = match decode_line::<WorkerMessage>(line).expect("decode") {
            WorkerMessage::Response {
                id,
                result: WorkerResult::Run { run },
            } => (id, run),
            other => panic!("unexpected message: {other:?}"),
        };
        assert_eq!(id, RequestId(3));
        assert_eq!(run.id, "abc");
        assert_eq!(run.extra.get("storage"), Some(&Value::from("s3")));
    }
}
