//! Peer wire protocol: handshake, message codec, connection abstraction, and
//! the per-connection/service state machine that drives them.

use thiserror::Error;

pub mod connection;
pub mod handshake;
pub mod message;
pub mod policy;
pub mod service;

pub use connection::{Connection, ConnectionFactory, TcpConnectionFactory};
pub use handshake::Handshake;
pub use message::Message;
pub use service::{PeerConnection, PeerService, Phase};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("handshake protocol identifier did not match \"BitTorrent protocol\"")]
    NotBitTorrentProtocol,

    #[error("handshake info-hash did not match the one we sent")]
    InfoHashMismatch,

    #[error("connection closed before the expected number of bytes arrived")]
    ShortRead,

    #[error("message declared a length that could not be satisfied")]
    BadMessageLength,

    #[error("unrecognized message type {0}")]
    UnknownMessageType(u8),
}

pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("dial timed out")]
    DialTimeout,

    #[error("dial was refused: {0}")]
    DialRefused(#[source] std::io::Error),

    #[error("connection closed on read")]
    ReadClosed,

    #[error("connection closed on write")]
    WriteClosed,
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;
