//! Library root for bitwire: a BitTorrent peer-wire and tracker client toolkit.
//!
//! Re-exports the core modules for use by the `bitwire` binary and by
//! downstream crates: `bencode` (the wire codec), `bitfield`, `torrent`
//! (metainfo parsing), `peer` (handshake/message/connection state machine),
//! and `tracker` (HTTP announce client).
pub mod bencode;
pub mod bitfield;
pub mod peer;
pub mod torrent;
pub mod tracker;
