//! RPC message types and framing.
//!
//! Every message is bincode encoded and sent with a 4-byte big-endian length
//! prefix. Requests and responses are correlated by `request_id`.

use crate::error::{NetworkError, RemoteError, Result};
use crate::types::{CacheStatus, HintKey, ResponseKeyShape, RowMap};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame accepted on the wire.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Network message wrapper for all communication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    Request {
        request_id: u64,
        request: CacheRequest,
    },
    Response {
        request_id: u64,
        result: std::result::Result<CacheReply, RemoteError>,
    },
}

/// Operations a node serves, for clients and for peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CacheRequest {
    /// Read rows. `keys` wins over `key` when it is not empty.
    Fetch {
        table: String,
        key: Option<HintKey>,
        keys: Vec<HintKey>,
        fields: Vec<String>,
        shape: ResponseKeyShape,
    },
    /// Insert or update one row.
    Modify {
        table: String,
        key: HintKey,
        values: BTreeMap<String, String>,
    },
    Delete {
        table: String,
        key: HintKey,
    },
    /// Drop cached rows by hint id.
    Invalidate { table: String, hints: Vec<i64> },
    /// Drop every cached row of a table and its schema. `internal` marks a
    /// notification from a peer, which is not broadcast again.
    InvalidateTable { table: String, internal: bool },
    /// Reload the peer roster.
    RefreshCluster,
    Status,
}

impl CacheRequest {
    /// Keys a fetch addresses, honouring the single-key form.
    pub fn fetch_keys(key: Option<HintKey>, keys: Vec<HintKey>) -> Vec<HintKey> {
        if !keys.is_empty() {
            keys
        } else {
            key.into_iter().collect()
        }
    }

    /// Operation name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            CacheRequest::Fetch { .. } => "fetch",
            CacheRequest::Modify { .. } => "modify",
            CacheRequest::Delete { .. } => "delete",
            CacheRequest::Invalidate { .. } => "invalidate",
            CacheRequest::InvalidateTable { .. } => "invalidate_table",
            CacheRequest::RefreshCluster => "refresh_cluster",
            CacheRequest::Status => "status",
        }
    }
}

/// Successful answer to a [`CacheRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CacheReply {
    Rows(RowMap),
    Empty,
    Status(CacheStatus),
}

/// Encode a message to bytes.
pub fn encode_message(msg: &Message) -> std::result::Result<Vec<u8>, bincode::Error> {
    bincode::serialize(msg)
}

/// Decode a message from bytes.
pub fn decode_message(data: &[u8]) -> std::result::Result<Message, bincode::Error> {
    bincode::deserialize(data)
}

/// Frame a message with length prefix for TCP transmission.
pub fn frame_message(msg: &Message) -> std::result::Result<Vec<u8>, bincode::Error> {
    let data = encode_message(msg)?;
    let len = data.len() as u32;

    let mut framed = Vec::with_capacity(4 + data.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&data);

    Ok(framed)
}

/// Read one framed message. Returns `None` on a clean end of stream.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(NetworkError::Io(e).into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(NetworkError::ReceiveFailed("message too large".to_string()).into());
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await.map_err(NetworkError::Io)?;

    Ok(Some(decode_message(&data)?))
}

/// Write one framed message.
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let framed = frame_message(msg)?;
    writer.write_all(&framed).await.map_err(NetworkError::Io)?;
    writer.flush().await.map_err(NetworkError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteErrorKind;

    #[test]
    fn test_fetch_keys_prefers_list() {
        assert_eq!(
            CacheRequest::fetch_keys(Some(HintKey::Int(1)), vec![HintKey::Int(2), HintKey::Int(3)]),
            vec![HintKey::Int(2), HintKey::Int(3)]
        );
        assert_eq!(
            CacheRequest::fetch_keys(Some(HintKey::Int(1)), Vec::new()),
            vec![HintKey::Int(1)]
        );
        assert!(CacheRequest::fetch_keys(None, Vec::new()).is_empty());
    }

    #[test]
    fn test_frame_message() {
        let msg = Message::Request {
            request_id: 9,
            request: CacheRequest::Invalidate {
                table: "users".to_string(),
                hints: vec![1, 2],
            },
        };

        let framed = frame_message(&msg).unwrap();
        let len = u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
        assert_eq!(len, framed.len() - 4);

        match decode_message(&framed[4..]).unwrap() {
            Message::Request {
                request_id,
                request: CacheRequest::Invalidate { table, hints },
            } => {
                assert_eq!(request_id, 9);
                assert_eq!(table, "users");
                assert_eq!(hints, vec![1, 2]);
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_write_over_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let mut rows = RowMap::new();
        rows.insert(HintKey::from("k"), vec!["v".to_string()]);
        let reply = Message::Response {
            request_id: 3,
            result: Ok(CacheReply::Rows(rows.clone())),
        };
        let failure = Message::Response {
            request_id: 4,
            result: Err(RemoteError {
                kind: RemoteErrorKind::TableNotFound,
                message: "users".to_string(),
                code: 0,
                raiser: "tablecache".to_string(),
            }),
        };

        write_message(&mut client, &reply).await.unwrap();
        write_message(&mut client, &failure).await.unwrap();
        drop(client);

        match read_message(&mut server).await.unwrap() {
            Some(Message::Response { request_id: 3, result: Ok(CacheReply::Rows(got)) }) => {
                assert_eq!(got, rows)
            }
            other => panic!("unexpected: {:?}", other),
        }
        match read_message(&mut server).await.unwrap() {
            Some(Message::Response { request_id: 4, result: Err(e) }) => {
                assert_eq!(e.kind, RemoteErrorKind::TableNotFound)
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(read_message(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut client, &len).await.unwrap();

        assert!(read_message(&mut server).await.is_err());
    }
}
