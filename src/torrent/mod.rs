//! Torrent metainfo parsing and error handling.
//!
//! Builds a typed [`metainfo::Metainfo`] from bencoded bytes, computing the
//! info-hash from the codec's raw byte span rather than by re-encoding the
//! parsed tree (see `bencode::info_span`).

use crate::bencode::CodecError;
use thiserror::Error;

pub mod metainfo;

pub use metainfo::{File, Info, Metainfo};

#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("I/O error reading torrent file: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode decoding error: {0}")]
    Codec(#[from] CodecError),

    #[error("missing required field: {0}")]
    MissingRequired(String),

    #[error("field has the wrong type: {0}")]
    TypeMismatch(String),
}

pub type MetainfoResult<T> = std::result::Result<T, MetainfoError>;
