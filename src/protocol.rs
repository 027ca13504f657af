//! Wire protocol
//!
//! Every message is framed as:
//!
//! ```text
//! "ZBXD" | flags (0x01) | payload length (u64, little endian) | payload
//! ```
//!
//! Passive checks carry the item key in the request payload and the value,
//! or `ZBX_NOTSUPPORTED\0<error>`, in the response. Passive requests may also
//! arrive as a bare text line. Active checks exchange JSON documents.

use crate::error::TaskError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const HEADER: &[u8; 4] = b"ZBXD";
pub const FLAG_PROTOCOL: u8 = 0x01;
pub const MAX_PAYLOAD: u64 = 128 * 1024 * 1024;
/// Upper bound for passive check requests, framed or plain
pub const MAX_REQUEST: u64 = 64 * 1024;
pub const NOT_SUPPORTED: &str = "ZBX_NOTSUPPORTED";

const INITIAL_BUFFER: u64 = 4096;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid protocol header")]
    InvalidHeader,

    #[error("unsupported protocol flags 0x{0:02x}")]
    UnsupportedFlags(u8),

    #[error("message size {0} exceeds the allowed maximum")]
    TooLarge(u64),

    #[error("connection closed before a request was received")]
    Empty,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Frame a payload
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER.len() + 9 + payload.len());
    frame.extend_from_slice(HEADER);
    frame.push(FLAG_PROTOCOL);
    frame.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    writer.write_all(&encode(payload)).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the part of a frame that follows the 4 byte header
///
/// The payload buffer grows with the data actually received, never with the
/// length announced by the peer.
async fn read_frame_body<R: AsyncRead + Unpin>(
    reader: &mut R,
    limit: u64,
) -> Result<Vec<u8>, ProtocolError> {
    let flags = reader.read_u8().await?;
    if flags != FLAG_PROTOCOL {
        return Err(ProtocolError::UnsupportedFlags(flags));
    }

    let length = reader.read_u64_le().await?;
    if length > limit {
        return Err(ProtocolError::TooLarge(length));
    }

    let mut payload = Vec::with_capacity(length.min(INITIAL_BUFFER) as usize);
    (&mut *reader).take(length).read_to_end(&mut payload).await?;
    if (payload.len() as u64) < length {
        return Err(ProtocolError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("frame truncated after {} of {} bytes", payload.len(), length),
        )));
    }
    Ok(payload)
}

/// Read one framed message
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, ProtocolError> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;
    if &header != HEADER {
        return Err(ProtocolError::InvalidHeader);
    }
    read_frame_body(reader, MAX_PAYLOAD).await
}

/// Read a passive check request, framed or as a plain text line
pub async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, ProtocolError> {
    let mut prefix = Vec::with_capacity(HEADER.len());
    while prefix.len() < HEADER.len() {
        let mut byte = [0u8; 1];
        if reader.read(&mut byte).await? == 0 {
            break;
        }
        prefix.push(byte[0]);
    }

    let payload = if prefix.as_slice() == HEADER {
        read_frame_body(reader, MAX_REQUEST).await?
    } else {
        let mut data = prefix;
        let mut chunk = [0u8; 1024];
        while !data.contains(&b'\n') {
            if data.len() as u64 > MAX_REQUEST {
                return Err(ProtocolError::TooLarge(data.len() as u64));
            }
            let read = reader.read(&mut chunk).await?;
            if read == 0 {
                break;
            }
            data.extend_from_slice(&chunk[..read]);
        }
        if let Some(end) = data.iter().position(|b| *b == b'\n') {
            data.truncate(end);
        }
        data
    };

    let request = String::from_utf8_lossy(&payload)
        .trim_end_matches(['\r', '\n', '\0'])
        .trim()
        .to_string();

    if request.is_empty() {
        return Err(ProtocolError::Empty);
    }
    Ok(request)
}

/// Payload of a passive check response
pub fn encode_passive_result<T: fmt::Display>(result: &Result<T, TaskError>) -> Vec<u8> {
    match result {
        Ok(value) => value.to_string().into_bytes(),
        Err(err) => {
            let mut payload = NOT_SUPPORTED.as_bytes().to_vec();
            payload.push(0);
            payload.extend_from_slice(err.to_string().as_bytes());
            payload
        }
    }
}

/// Split a passive check response payload into value or error message
pub fn decode_passive_result(payload: &[u8]) -> Result<String, String> {
    let text = String::from_utf8_lossy(payload);
    match text.strip_prefix(NOT_SUPPORTED) {
        Some(rest) => Err(rest.trim_start_matches('\0').to_string()),
        None => Ok(text.into_owned()),
    }
}

/// Send a JSON request and read the JSON reply on the same stream
pub async fn exchange<S, Req, Resp>(stream: &mut S, request: &Req) -> Result<Resp, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let payload = serde_json::to_vec(request)?;
    write_frame(stream, &payload).await?;
    let reply = read_frame(stream).await?;
    Ok(serde_json::from_slice(&reply)?)
}

/// `{"request":"active checks","host":...}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveChecksRequest {
    pub request: String,
    pub host: String,
}

impl ActiveChecksRequest {
    pub fn new(host: &str) -> Self {
        Self {
            request: "active checks".to_string(),
            host: host.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveCheck {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub itemid: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveChecksResponse {
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    #[serde(default)]
    pub data: Vec<ActiveCheck>,
}

/// One value in an agent data report; `state` 1 marks an unsupported item
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentValue {
    pub id: u64,
    pub host: String,
    pub key: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<u8>,
    pub clock: i64,
    pub ns: u32,
}

/// `{"request":"agent data",...}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentDataRequest {
    pub request: String,
    pub session: String,
    pub data: Vec<AgentValue>,
    pub clock: i64,
    pub ns: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentDataResponse {
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::ItemValue;
    use std::time::Duration;

    #[tokio::test]
    async fn test_frame_roundtrip_over_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, b"agent.ping").await.unwrap();
        let payload = read_frame(&mut server).await.unwrap();
        assert_eq!(payload, b"agent.ping");
    }

    #[test]
    fn test_encode_layout() {
        let frame = encode(b"abc");
        assert_eq!(&frame[..4], b"ZBXD");
        assert_eq!(frame[4], FLAG_PROTOCOL);
        assert_eq!(u64::from_le_bytes(frame[5..13].try_into().unwrap()), 3);
        assert_eq!(&frame[13..], b"abc");
    }

    #[tokio::test]
    async fn test_read_plain_request() {
        let mut input: &[u8] = b"system.cpu.load[,avg1]\n";
        let request = read_request(&mut input).await.unwrap();
        assert_eq!(request, "system.cpu.load[,avg1]");

        let mut short: &[u8] = b"ab";
        assert_eq!(read_request(&mut short).await.unwrap(), "ab");
    }

    #[tokio::test]
    async fn test_read_framed_request() {
        let frame = encode(b"agent.version\n");
        let mut input: &[u8] = &frame;
        assert_eq!(read_request(&mut input).await.unwrap(), "agent.version");
    }

    #[tokio::test]
    async fn test_rejects_bad_frames() {
        let mut input: &[u8] = b"";
        assert!(matches!(
            read_request(&mut input).await,
            Err(ProtocolError::Empty)
        ));

        let mut frame = encode(b"x");
        frame[4] = 0x02;
        let mut input: &[u8] = &frame;
        assert!(matches!(
            read_request(&mut input).await,
            Err(ProtocolError::UnsupportedFlags(0x02))
        ));

        let mut oversized = HEADER.to_vec();
        oversized.push(FLAG_PROTOCOL);
        oversized.extend_from_slice(&(MAX_PAYLOAD + 1).to_le_bytes());
        let mut input: &[u8] = &oversized;
        assert!(matches!(
            read_frame(&mut input).await,
            Err(ProtocolError::TooLarge(_))
        ));

        let mut input: &[u8] = b"HTTP/1.1 200 OK\r\n";
        assert!(matches!(
            read_frame(&mut input).await,
            Err(ProtocolError::InvalidHeader)
        ));
    }

    #[tokio::test]
    async fn test_passive_request_size_limit() {
        let mut announced = HEADER.to_vec();
        announced.push(FLAG_PROTOCOL);
        announced.extend_from_slice(&MAX_PAYLOAD.to_le_bytes());
        let mut input: &[u8] = &announced;
        assert!(matches!(
            read_request(&mut input).await,
            Err(ProtocolError::TooLarge(length)) if length == MAX_PAYLOAD
        ));

        let key = format!("echo[{}]", "x".repeat(MAX_REQUEST as usize));
        let frame = encode(key.as_bytes());
        let mut input: &[u8] = &frame;
        assert!(matches!(
            read_request(&mut input).await,
            Err(ProtocolError::TooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_rejected() {
        let mut frame = HEADER.to_vec();
        frame.push(FLAG_PROTOCOL);
        frame.extend_from_slice(&1000u64.to_le_bytes());
        frame.extend_from_slice(b"agent.ping");

        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        client.write_all(&frame).await.unwrap();
        drop(client);

        match read_request(&mut server).await {
            Err(ProtocolError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_passive_result_payloads() {
        let ok = encode_passive_result(&Ok(ItemValue::Unsigned(1)));
        assert_eq!(decode_passive_result(&ok), Ok("1".to_string()));

        let err = encode_passive_result::<String>(&Err(TaskError::Timeout(Duration::from_secs(3))));
        assert!(err.starts_with(b"ZBX_NOTSUPPORTED\0"));
        let message = decode_passive_result(&err).unwrap_err();
        assert!(message.starts_with("Timeout occurred"));
    }

    #[test]
    fn test_active_checks_json() {
        let request = serde_json::to_string(&ActiveChecksRequest::new("web-01")).unwrap();
        assert_eq!(request, r#"{"request":"active checks","host":"web-01"}"#);

        let response: ActiveChecksResponse = serde_json::from_str(
            r#"{"response":"success","data":[{"key":"agent.ping","delay":30,"lastlogsize":0}]}"#,
        )
        .unwrap();
        assert_eq!(response.response, "success");
        assert_eq!(response.data.len(), 1);
        assert_eq!(response.data[0].key, "agent.ping");
    }
}
