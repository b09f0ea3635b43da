//! Length-prefixed peer wire messages: parsing from and serializing to an
//! async byte stream.

use super::{ProtocolError, ProtocolResult};
use crate::bitfield::Bitfield;
use byteorder::{BigEndian, ByteOrder};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::instrument;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    BitField(Bitfield),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Port { port: u16 },
    /// An unrecognized message type id; preserved rather than dropped so a
    /// peer speaking an extension never crashes the connection.
    Unknown { id: u8, payload: Vec<u8> },
}

const CHOKE: u8 = 0;
const UNCHOKE: u8 = 1;
const INTERESTED: u8 = 2;
const NOT_INTERESTED: u8 = 3;
const HAVE: u8 = 4;
const BITFIELD: u8 = 5;
const REQUEST: u8 = 6;
const PIECE: u8 = 7;
const CANCEL: u8 = 8;
const PORT: u8 = 9;

impl Message {
    /// Reads one message (KeepAlive or typed) from `reader`.
    #[instrument(skip(reader), level = "trace")]
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> ProtocolResult<Message> {
        let mut len_buf = [0u8; 4];
        reader
            .read_exact(&mut len_buf)
            .await
            .map_err(|_| ProtocolError::ShortRead)?;
        let length = BigEndian::read_u32(&len_buf) as usize;

        if length == 0 {
            return Ok(Message::KeepAlive);
        }

        let mut body = vec![0u8; length];
        reader
            .read_exact(&mut body)
            .await
            .map_err(|_| ProtocolError::ShortRead)?;

        let id = body[0];
        let payload = &body[1..];
        Message::decode(id, payload)
    }

    fn decode(id: u8, payload: &[u8]) -> ProtocolResult<Message> {
        match id {
            CHOKE => Ok(Message::Choke),
            UNCHOKE => Ok(Message::Unchoke),
            INTERESTED => Ok(Message::Interested),
            NOT_INTERESTED => Ok(Message::NotInterested),
            HAVE => {
                if payload.len() != 4 {
                    return Err(ProtocolError::BadMessageLength);
                }
                Ok(Message::Have {
                    piece_index: BigEndian::read_u32(payload),
                })
            }
            BITFIELD => Ok(Message::BitField(Bitfield::from_bytes(payload.to_vec()))),
            REQUEST => {
                if payload.len() != 12 {
                    return Err(ProtocolError::BadMessageLength);
                }
                Ok(Message::Request {
                    index: BigEndian::read_u32(&payload[0..4]),
                    begin: BigEndian::read_u32(&payload[4..8]),
                    length: BigEndian::read_u32(&payload[8..12]),
                })
            }
            PIECE => {
                if payload.len() < 8 {
                    return Err(ProtocolError::BadMessageLength);
                }
                Ok(Message::Piece {
                    index: BigEndian::read_u32(&payload[0..4]),
                    begin: BigEndian::read_u32(&payload[4..8]),
                    block: payload[8..].to_vec(),
                })
            }
            CANCEL => {
                if payload.len() != 12 {
                    return Err(ProtocolError::BadMessageLength);
                }
                Ok(Message::Cancel {
                    index: BigEndian::read_u32(&payload[0..4]),
                    begin: BigEndian::read_u32(&payload[4..8]),
                    length: BigEndian::read_u32(&payload[8..12]),
                })
            }
            PORT => {
                if payload.len() != 2 {
                    return Err(ProtocolError::BadMessageLength);
                }
                Ok(Message::Port {
                    port: BigEndian::read_u16(payload),
                })
            }
            other => Ok(Message::Unknown {
                id: other,
                payload: payload.to_vec(),
            }),
        }
    }

    fn encode(&self) -> Vec<u8> {
        match self {
            Message::KeepAlive => Vec::new(),
            Message::Choke => vec![CHOKE],
            Message::Unchoke => vec![UNCHOKE],
            Message::Interested => vec![INTERESTED],
            Message::NotInterested => vec![NOT_INTERESTED],
            Message::Have { piece_index } => {
                let mut buf = vec![HAVE];
                let mut be = [0u8; 4];
                BigEndian::write_u32(&mut be, *piece_index);
                buf.extend_from_slice(&be);
                buf
            }
            Message::BitField(bitfield) => {
                let mut buf = vec![BITFIELD];
                buf.extend_from_slice(bitfield.bytes());
                buf
            }
            Message::Request { index, begin, length } | Message::Cancel { index, begin, length } => {
                let id = if matches!(self, Message::Request { .. }) { REQUEST } else { CANCEL };
                let mut buf = vec![id];
                let mut be = [0u8; 4];
                BigEndian::write_u32(&mut be, *index);
                buf.extend_from_slice(&be);
                BigEndian::write_u32(&mut be, *begin);
                buf.extend_from_slice(&be);
                BigEndian::write_u32(&mut be, *length);
                buf.extend_from_slice(&be);
                buf
            }
            Message::Piece { index, begin, block } => {
                let mut buf = vec![PIECE];
                let mut be = [0u8; 4];
                BigEndian::write_u32(&mut be, *index);
                buf.extend_from_slice(&be);
                BigEndian::write_u32(&mut be, *begin);
                buf.extend_from_slice(&be);
                buf.extend_from_slice(block);
                buf
            }
            Message::Port { port } => {
                let mut buf = vec![PORT];
                let mut be = [0u8; 2];
                BigEndian::write_u16(&mut be, *port);
                buf.extend_from_slice(&be);
                buf
            }
            Message::Unknown { id, payload } => {
                let mut buf = vec![*id];
                buf.extend_from_slice(payload);
                buf
            }
        }
    }

    /// Writes this message's length-prefixed wire form to `writer`.
    #[instrument(skip(self, writer), level = "trace")]
    pub async fn write<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> ProtocolResult<()> {
        let body = self.encode();
        let mut len_buf = [0u8; 4];
        BigEndian::write_u32(&mut len_buf, body.len() as u32);
        writer
            .write_all(&len_buf)
            .await
            .map_err(|_| ProtocolError::ShortRead)?;
        writer
            .write_all(&body)
            .await
            .map_err(|_| ProtocolError::ShortRead)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn round_trip(msg: Message) {
        let mut buf = Vec::new();
        msg.write(&mut buf).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let parsed = Message::read(&mut cursor).await.unwrap();
        assert_eq!(parsed, msg);
    }

    #[tokio::test]
    async fn round_trips_every_typed_variant() {
        round_trip(Message::KeepAlive).await;
        round_trip(Message::Choke).await;
        round_trip(Message::Unchoke).await;
        round_trip(Message::Interested).await;
        round_trip(Message::NotInterested).await;
        round_trip(Message::Have { piece_index: 7 }).await;
        round_trip(Message::BitField(Bitfield::from_bytes(vec![0xff, 0x01]))).await;
        round_trip(Message::Request {
            index: 1,
            begin: 2,
            length: 0x4000,
        })
        .await;
        round_trip(Message::Piece {
            index: 1,
            begin: 0,
            block: vec![1, 2, 3, 4],
        })
        .await;
        round_trip(Message::Cancel {
            index: 1,
            begin: 2,
            length: 0x4000,
        })
        .await;
        round_trip(Message::Port { port: 6881 }).await;
        round_trip(Message::Unknown {
            id: 20,
            payload: vec![9, 9],
        })
        .await;
    }

    #[tokio::test]
    async fn bitfield_message_matches_scenario_6() {
        let mut buf = Vec::new();
        Message::BitField(Bitfield::from_bytes(vec![0xff, 0xff, 0xff, 0x01]))
            .write(&mut buf)
            .await
            .unwrap();
        assert_eq!(buf, [0, 0, 0, 5, 5, 0xff, 0xff, 0xff, 0x01]);
    }

    #[tokio::test]
    async fn truncated_message_is_short_read() {
        let mut cursor = std::io::Cursor::new(vec![0u8, 0, 0, 5, 0]);
        let err = Message::read(&mut cursor).await.unwrap_err();
        assert_eq!(err, ProtocolError::ShortRead);
    }

    #[tokio::test]
    async fn bad_have_length_is_rejected() {
        let mut buf = vec![0u8, 0, 0, 2];
        buf.push(HAVE);
        buf.push(0);
        let mut cursor = std::io::Cursor::new(buf);
        let err = Message::read(&mut cursor).await.unwrap_err();
        assert_eq!(err, ProtocolError::BadMessageLength);
    }
}
