use super::{MetainfoError, MetainfoResult};
use crate::bencode::{self, Dict, Lexer, Value};
use sha1::Digest;
use std::path::PathBuf;
use tracing::instrument;

/// A parsed `.torrent` file.
#[derive(Debug, PartialEq, Clone)]
pub struct Metainfo {
    pub announce: String,
    pub announce_list: Vec<Vec<String>>,
    pub creation_date: Option<i64>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub encoding: Option<String>,
    pub info: Info,
    pub info_hash: [u8; 20],
}

#[derive(Debug, PartialEq, Clone)]
pub struct Info {
    pub piece_length: i64,
    /// Concatenated 20-byte SHA-1 hashes, one per piece. Stored verbatim; a
    /// length that isn't a multiple of 20 is not rejected here.
    pub pieces: Vec<u8>,
    pub private: bool,
    pub name: String,
    /// `Some` in single-file mode, `None` when `files` is present.
    pub length: Option<i64>,
    pub files: Vec<File>,
}

/// One entry of a multi-file torrent's file list.
#[derive(Debug, PartialEq, Clone)]
pub struct File {
    pub length: i64,
    pub md5sum: Option<Vec<u8>>,
    /// Path components relative to `Info::name`, e.g. `["subdir", "file.bin"]`.
    pub path: Vec<String>,
}

impl Metainfo {
    /**
    Parses a `.torrent` file's raw bytes into a `Metainfo`.

    # How it works:
    1. Lexes and parses the bencoded bytes into a `Value` tree.
    2. Computes `info_hash` as the SHA-1 digest of the raw byte span of the
       `info` dictionary (via `bencode::info_span`), not by re-encoding the
       parsed tree, so the hash matches what a byte-for-byte-identical peer
       would compute even if this codec's own encoder would serialize keys
       in a different order than the source file.
    3. Extracts `announce`, `announce-list`, `creation date`, `comment`,
       `created by`, `encoding`, and `info`, validating required fields.

    # Errors
    Returns `MetainfoError::MissingRequired`/`TypeMismatch` if a required
    field is absent or has the wrong bencode type, or `MetainfoError::Codec`
    if the bytes aren't valid bencode.
    */
    #[instrument(skip(bytes), level = "debug")]
    pub fn parse(bytes: &[u8]) -> MetainfoResult<Metainfo> {
        let tokens = Lexer::new(bytes).collect_tokens()?;
        let value = bencode::parse(&tokens)?;

        let span = bencode::info_span(bytes, &tokens)
            .ok_or_else(|| MetainfoError::MissingRequired("info".into()))?;
        let info_hash: [u8; 20] = sha1::Sha1::digest(span).into();

        let root = as_dict(&value, "root")?;

        let announce = required_string(root, "announce")?;
        let announce_list = optional_announce_list(root)?;
        let creation_date = root.get(b"creation date").and_then(Value::as_integer);
        let comment = optional_string(root, "comment")?;
        let created_by = optional_string(root, "created by")?;
        let encoding = optional_string(root, "encoding")?;

        let info_value = root
            .get(b"info")
            .ok_or_else(|| MetainfoError::MissingRequired("info".into()))?;
        let info = Info::from_value(info_value)?;

        Ok(Metainfo {
            announce,
            announce_list,
            creation_date,
            comment,
            created_by,
            encoding,
            info,
            info_hash,
        })
    }

    /// Reads a `.torrent` file from `path` and parses it.
    ///
    /// # Errors
    /// `MetainfoError::Io` if the file can't be read, or any error
    /// [`Metainfo::parse`] returns.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> MetainfoResult<Metainfo> {
        let bytes = std::fs::read(path)?;
        Metainfo::parse(&bytes)
    }

    /// The info-hash, lower-case hex encoded.
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// Returns the total length of all files in the torrent.
    pub fn total_length(&self) -> i64 {
        match self.info.length {
            Some(length) => length,
            None => self.info.files.iter().map(|f| f.length).sum(),
        }
    }

    /// Returns the total number of pieces in the torrent.
    /// Derived from the number of 20-byte hashes in `info.pieces`.
    pub fn num_pieces(&self) -> usize {
        self.info.pieces.len() / 20
    }

    pub fn piece_size(&self, index: usize) -> i64 {
        if index >= self.num_pieces() {
            return 0;
        }
        if index < self.num_pieces() - 1 {
            self.info.piece_length
        } else {
            let total_length = self.total_length();
            let full_pieces_length = (self.num_pieces() - 1) as i64 * self.info.piece_length;
            let last_piece_size = total_length - full_pieces_length;
            if last_piece_size == 0 && self.num_pieces() > 0 {
                self.info.piece_length
            } else {
                last_piece_size
            }
        }
    }

    /**
    Returns a vector of file paths that contain data for a specific piece in the torrent.

    # How it works:
    1. Calculates the byte range (start and end) of the requested piece.
    2. For single-file torrents, returns the main file path if the piece is valid.
    3. For multi-file torrents, checks each file's byte range against the piece range
       and returns paths of files that overlap with the piece.

    Returns an empty vector if `index` is out of range.
    */
    pub fn file_paths_for_piece(&self, index: usize) -> Vec<PathBuf> {
        if index >= self.num_pieces() {
            return Vec::new();
        }
        let piece_start = (index as i64) * self.info.piece_length;
        let piece_end = piece_start + self.piece_size(index);

        if self.info.files.is_empty() {
            return vec![PathBuf::from(&self.info.name)];
        }

        let mut current_data_position: i64 = 0;
        let mut result_paths = Vec::new();
        for file in &self.info.files {
            let file_start = current_data_position;
            let file_end = file_start + file.length;
            if file_end > piece_start && file_start < piece_end {
                let mut full_path = PathBuf::from(&self.info.name);
                for component in &file.path {
                    full_path = full_path.join(component);
                }
                result_paths.push(full_path);
            }
            current_data_position = file_end;
        }
        result_paths
    }
}

impl Info {
    fn from_value(value: &Value) -> MetainfoResult<Info> {
        let dict = as_dict(value, "info")?;

        let piece_length = required_integer(dict, "piece length")?;
        // Stored verbatim regardless of length; verifying it against the
        // piece hash list is an external collaborator's job, not the parser's.
        let pieces = required_bytes(dict, "pieces")?.to_vec();
        let private = dict
            .get(b"private")
            .and_then(Value::as_integer)
            .map(|n| n != 0)
            .unwrap_or(false);
        let name = required_string(dict, "name")?;

        let files = match dict.get(b"files") {
            Some(Value::List(entries)) => entries
                .iter()
                .map(File::from_value)
                .collect::<MetainfoResult<Vec<_>>>()?,
            Some(_) => return Err(MetainfoError::TypeMismatch("info.files".into())),
            None => Vec::new(),
        };

        let length = if files.is_empty() {
            Some(required_integer(dict, "length")?)
        } else {
            None
        };

        Ok(Info {
            piece_length,
            pieces,
            private,
            name,
            length,
            files,
        })
    }
}

impl File {
    fn from_value(value: &Value) -> MetainfoResult<File> {
        let dict = as_dict(value, "info.files[]")?;
        let length = required_integer(dict, "length")?;
        let md5sum = dict.get(b"md5sum").and_then(Value::as_bytes).map(<[u8]>::to_vec);
        let path = match dict.get(b"path") {
            Some(Value::List(segments)) => segments
                .iter()
                .map(|seg| {
                    seg.as_bytes()
                        .map(|b| String::from_utf8_lossy(b).into_owned())
                        .ok_or_else(|| MetainfoError::TypeMismatch("info.files[].path".into()))
                })
                .collect::<MetainfoResult<Vec<_>>>()?,
            _ => return Err(MetainfoError::MissingRequired("info.files[].path".into())),
        };
        Ok(File {
            length,
            md5sum,
            path,
        })
    }
}

fn as_dict<'a>(value: &'a Value, field: &str) -> MetainfoResult<&'a Dict> {
    value
        .as_dict()
        .ok_or_else(|| MetainfoError::TypeMismatch(field.into()))
}

fn required_string(dict: &Dict, key: &str) -> MetainfoResult<String> {
    dict.get(key.as_bytes())
        .and_then(Value::as_bytes)
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .ok_or_else(|| MetainfoError::MissingRequired(key.into()))
}

fn optional_string(dict: &Dict, key: &str) -> MetainfoResult<Option<String>> {
    match dict.get(key.as_bytes()) {
        None => Ok(None),
        Some(Value::String(b)) => Ok(Some(String::from_utf8_lossy(b).into_owned())),
        Some(_) => Err(MetainfoError::TypeMismatch(key.into())),
    }
}

fn required_integer(dict: &Dict, key: &str) -> MetainfoResult<i64> {
    dict.get(key.as_bytes())
        .and_then(Value::as_integer)
        .ok_or_else(|| MetainfoError::MissingRequired(key.into()))
}

fn required_bytes<'a>(dict: &'a Dict, key: &str) -> MetainfoResult<&'a [u8]> {
    dict.get(key.as_bytes())
        .and_then(Value::as_bytes)
        .ok_or_else(|| MetainfoError::MissingRequired(key.into()))
}

fn optional_announce_list(dict: &Dict) -> MetainfoResult<Vec<Vec<String>>> {
    match dict.get(b"announce-list") {
        None => Ok(Vec::new()),
        Some(Value::List(tiers)) => tiers
            .iter()
            .map(|tier| match tier {
                Value::List(urls) => urls
                    .iter()
                    .map(|u| {
                        u.as_bytes()
                            .map(|b| String::from_utf8_lossy(b).into_owned())
                            .ok_or_else(|| MetainfoError::TypeMismatch("announce-list".into()))
                    })
                    .collect::<MetainfoResult<Vec<_>>>(),
                _ => Err(MetainfoError::TypeMismatch("announce-list".into())),
            })
            .collect::<MetainfoResult<Vec<_>>>(),
        Some(_) => Err(MetainfoError::TypeMismatch("announce-list".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ubuntu_like() -> Vec<u8> {
        b"d8:announce23:http://tracker.example/4:infod6:lengthi1028653056e4:name32:ubuntu-14.04.1-desktop-amd64.iso12:piece lengthi524288e6:pieces40:0123456789012345678901234567890123456789ee".to_vec()
    }

    #[test]
    fn parses_single_file_torrent() {
        let bytes = ubuntu_like();
        let meta = Metainfo::parse(&bytes).unwrap();
        assert_eq!(meta.announce, "http://tracker.example/");
        assert_eq!(meta.info.name, "ubuntu-14.04.1-desktop-amd64.iso");
        assert_eq!(meta.info.length, Some(1028653056));
        assert!(meta.info.files.is_empty());
        assert_eq!(meta.total_length(), 1028653056);
        assert_eq!(meta.num_pieces(), 2);
    }

    #[test]
    fn info_hash_matches_raw_span_not_reencoding() {
        let bytes = ubuntu_like();
        let meta = Metainfo::parse(&bytes).unwrap();

        let tokens = Lexer::new(&bytes).collect_tokens().unwrap();
        let span = bencode::info_span(&bytes, &tokens).unwrap();
        let expected: [u8; 20] = sha1::Sha1::digest(span).into();
        assert_eq!(meta.info_hash, expected);
    }

    #[test]
    fn missing_announce_is_missing_required() {
        let bytes = b"d4:infod6:lengthi1e4:name1:a12:piece lengthi1e6:pieces0:ee".to_vec();
        let err = Metainfo::parse(&bytes).unwrap_err();
        assert!(matches!(err, MetainfoError::MissingRequired(ref f) if f == "announce"));
    }

    #[test]
    fn multi_file_mode_sums_lengths() {
        let bytes = b"d8:announce4:http4:infod5:filesld6:lengthi10e4:pathl1:a1:beed6:lengthi20e4:pathl1:ceee4:name1:x12:piece lengthi10e6:pieces0:ee".to_vec();
        let meta = Metainfo::parse(&bytes).unwrap();
        assert_eq!(meta.info.files.len(), 2);
        assert_eq!(meta.total_length(), 30);
        assert_eq!(meta.info.files[0].path, vec!["a", "b"]);
    }
}
