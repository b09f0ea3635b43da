//! The 68-byte fixed handshake that opens every peer connection.

use super::connection::Connection;
use super::{ProtocolError, ProtocolResult};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::instrument;

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

/** The fixed-format message that opens every peer connection, before any
length-prefixed messages are exchanged.

Only the two fields that vary per-connection are stored; the protocol
string length (19), protocol string, and 8 reserved bytes are constants
reconstructed by [`Handshake::serialize`]. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Builds a handshake to send to a peer for the given torrent.
    ///
    /// # Arguments
    /// - `info_hash` — the SHA-1 hash of the torrent's `info` dictionary.
    /// - `peer_id` — this client's 20-byte peer id.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Handshake { info_hash, peer_id }
    }

    /// Serializes this handshake into its 68-byte wire form:
    /// 1 byte length (19), 19 bytes protocol string, 8 reserved bytes (zero),
    /// 20 bytes info-hash, 20 bytes peer-id.
    ///
    /// # Returns
    /// The 68-byte wire representation.
    pub fn serialize(&self) -> [u8; 68] {
        let mut buf = [0u8; 68];
        buf[0] = 19;
        buf[1..20].copy_from_slice(PROTOCOL);
        // buf[20..28] reserved, left zero.
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Reads a handshake from `conn`.
    ///
    /// Reads all 68 bytes in a single call (per spec.md §4.D: "read one
    /// byte, read pstrlen+48 more bytes in a single blocking read") rather
    /// than parsing the protocol-string length first and branching on it,
    /// since the length is fixed for the protocol version this crate speaks.
    ///
    /// # Errors
    /// - `ProtocolError::ShortRead` if the connection closes before 68 bytes
    ///   arrive.
    /// - `ProtocolError::NotBitTorrentProtocol` if the length byte or
    ///   protocol string don't match `"BitTorrent protocol"`.
    #[instrument(skip(conn), level = "trace")]
    pub async fn read(conn: &mut (impl Connection + ?Sized)) -> ProtocolResult<Handshake> {
        let mut buf = [0u8; 68];
        conn.read_exact(&mut buf)
            .await
            .map_err(|_| ProtocolError::ShortRead)?;

        if buf[0] != 19 || &buf[1..20] != PROTOCOL {
            return Err(ProtocolError::NotBitTorrentProtocol);
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Handshake { info_hash, peer_id })
    }

    /// Writes this handshake's 68-byte wire form to `conn`.
    ///
    /// # Errors
    /// `ProtocolError::ShortRead` if the write does not complete (the
    /// connection closed partway through).
    #[instrument(skip(self, conn), level = "trace")]
    pub async fn write(&self, conn: &mut (impl Connection + ?Sized)) -> ProtocolResult<()> {
        conn.write_all(&self.serialize())
            .await
            .map_err(|_| ProtocolError::ShortRead)
    }

    /// Checks that this handshake is for the torrent we expect.
    ///
    /// # Errors
    /// `ProtocolError::InfoHashMismatch` if `info_hash` does not match
    /// `expected_info_hash`.
    pub fn validate(&self, expected_info_hash: [u8; 20]) -> ProtocolResult<()> {
        if self.info_hash != expected_info_hash {
            return Err(ProtocolError::InfoHashMismatch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::connection::mock::mock_pair;

    #[test]
    fn serializes_per_scenario_5() {
        let info_hash = [
            0x6f, 0xda, 0xb6, 0xc1, 0x9f, 0x72, 0x14, 0x76, 0xfa, 0xca, 0xab, 0x36, 0x60, 0x8a,
            0x87, 0x7a, 0x2a, 0xac, 0xbf, 0xc9,
        ];
        let peer_id = [7u8; 20];
        let hs = Handshake::new(info_hash, peer_id);
        let bytes = hs.serialize();
        assert_eq!(bytes.len(), 68);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], PROTOCOL);
        assert_eq!(&bytes[20..28], &[0u8; 8]);
        assert_eq!(&bytes[28..48], &info_hash);
        assert_eq!(&bytes[48..68], &peer_id);
    }

    #[tokio::test]
    async fn round_trips_over_a_mock_connection() {
        let (mut conn, mut peer) = mock_pair();
        let hs = Handshake::new([1u8; 20], [2u8; 20]);
        let bytes = hs.serialize();
        peer.send(&bytes).await;
        let parsed = Handshake::read(&mut conn).await.unwrap();
        assert_eq!(parsed, hs);
    }

    #[tokio::test]
    async fn bad_protocol_string_is_rejected() {
        let (mut conn, mut peer) = mock_pair();
        let mut bytes = Handshake::new([1u8; 20], [2u8; 20]).serialize();
        bytes[1] = b'X';
        peer.send(&bytes).await;
        let err = Handshake::read(&mut conn).await.unwrap_err();
        assert_eq!(err, ProtocolError::NotBitTorrentProtocol);
    }

    #[test]
    fn mismatched_info_hash_fails_validation() {
        let hs = Handshake::new([1u8; 20], [2u8; 20]);
        let err = hs.validate([9u8; 20]).unwrap_err();
        assert_eq!(err, ProtocolError::InfoHashMismatch);
    }
}
