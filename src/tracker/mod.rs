//! HTTP tracker announce client: builds the GET query, decodes the bencoded
//! response, and yields a peer list (compact or non-compact form).

use crate::bencode::{self, CodecError, Lexer, Value};
use crate::torrent::Metainfo;
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("HTTP request to tracker failed: {0}")]
    HttpFailure(#[from] reqwest::Error),

    #[error("failed to decode tracker response: {0}")]
    DecodeFailure(#[from] CodecError),

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("tracker returned a failure reason: {0}")]
    TrackerFailure(String),

    #[error("tracker response was missing required field: {0}")]
    MissingField(&'static str),
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Started,
    Stopped,
    Completed,
}

impl Event {
    fn as_query_value(self) -> &'static str {
        match self {
            Event::Started => "started",
            Event::Stopped => "stopped",
            Event::Completed => "completed",
        }
    }
}

/// Parameters for a single announce call, built against a [`Metainfo`].
#[derive(Debug)]
pub struct TrackerRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: i64,
    pub downloaded: i64,
    pub compact: bool,
    pub no_peer_id: bool,
    pub corrupt: i64,
    pub numwant: Option<i64>,
    pub event: Option<Event>,
    total_length: i64,
}

impl TrackerRequest {
    pub fn new(metainfo: &Metainfo, peer_id: [u8; 20], port: u16) -> Self {
        TrackerRequest {
            info_hash: metainfo.info_hash,
            peer_id,
            port,
            uploaded: 0,
            downloaded: 0,
            compact: true,
            no_peer_id: false,
            corrupt: 0,
            numwant: None,
            event: Some(Event::Started),
            total_length: metainfo.total_length(),
        }
    }

    /// Bytes remaining, derived from the torrent's total length and
    /// `downloaded` at call time rather than frozen at construction, so it
    /// stays correct if a caller mutates `downloaded` after `new()`.
    pub fn left(&self) -> i64 {
        self.total_length - self.downloaded
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub ip: IpAddr,
    pub port: u16,
}

/// Parsed tracker announce response. `failure_reason` being present means
/// the rest of the fields were never produced (see `TrackerClient::announce`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerResponse {
    pub complete: i64,
    pub incomplete: i64,
    pub interval: i64,
    pub downloaded: Option<i64>,
    pub min_interval: Option<i64>,
    pub peers: Vec<Peer>,
}

pub struct TrackerClient {
    peer_id: [u8; 20],
    port: u16,
    http: reqwest::Client,
}

impl TrackerClient {
    pub fn new(port: u16) -> Self {
        TrackerClient {
            peer_id: generate_peer_id(),
            port,
            http: reqwest::Client::new(),
        }
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    /// Issues the announce GET request for `metainfo` and returns the
    /// decoded peer list, or `TrackerFailure` if the tracker rejected the
    /// request.
    #[instrument(skip(self, metainfo), level = "debug")]
    pub async fn announce(&self, metainfo: &Metainfo) -> TrackerResult<TrackerResponse> {
        let request = TrackerRequest::new(metainfo, self.peer_id, self.port);
        self.announce_with(metainfo, request).await
    }

    pub async fn announce_with(
        &self,
        metainfo: &Metainfo,
        request: TrackerRequest,
    ) -> TrackerResult<TrackerResponse> {
        let url = build_announce_url(&metainfo.announce, &request)?;
        debug!(%url, "making announce request to tracker");

        let response = self.http.get(url).send().await?;
        let body = response.bytes().await?;
        parse_announce_response(&body)
    }
}

/// Builds the announce URL, appending query parameters in the exact order
/// the tracker protocol requires (spec.md §4.E). `info_hash`/`peer_id` are
/// percent-encoded by hand over their raw bytes rather than through
/// `url`'s own encoder, because those two fields must encode the raw
/// 20-byte values (which are not valid UTF-8 in general) rather than a
/// string.
fn build_announce_url(announce: &str, request: &TrackerRequest) -> TrackerResult<url::Url> {
    let mut base = announce.to_string();
    base.push_str(if announce.contains('?') { "&" } else { "?" });
    base.push_str(&format!(
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact={}&no_peer_id={}&corrupt={}",
        url_encode(&request.info_hash),
        url_encode(&request.peer_id),
        request.port,
        request.uploaded,
        request.downloaded,
        request.left(),
        request.compact as u8,
        request.no_peer_id as u8,
        request.corrupt,
    ));
    if let Some(numwant) = request.numwant {
        base.push_str(&format!("&numwant={}", numwant));
    }
    base.push_str(&format!(
        "&event={}",
        request.event.map(Event::as_query_value).unwrap_or("")
    ));
    Ok(url::Url::parse(&base)?)
}

fn parse_announce_response(bytes: &[u8]) -> TrackerResult<TrackerResponse> {
    let tokens = Lexer::new(bytes).collect_tokens()?;
    let value = bencode::parse(&tokens)?;
    let dict = value.as_dict().ok_or(TrackerError::MissingField("root"))?;

    if let Some(reason) = dict.get(b"failure reason").and_then(Value::as_bytes) {
        return Err(TrackerError::TrackerFailure(
            String::from_utf8_lossy(reason).into_owned(),
        ));
    }

    let complete = dict
        .get(b"complete")
        .and_then(Value::as_integer)
        .ok_or(TrackerError::MissingField("complete"))?;
    let incomplete = dict
        .get(b"incomplete")
        .and_then(Value::as_integer)
        .ok_or(TrackerError::MissingField("incomplete"))?;
    let interval = dict
        .get(b"interval")
        .and_then(Value::as_integer)
        .ok_or(TrackerError::MissingField("interval"))?;
    let downloaded = dict.get(b"downloaded").and_then(Value::as_integer);
    let min_interval = dict.get(b"min interval").and_then(Value::as_integer);

    let peers = match dict.get(b"peers") {
        Some(Value::String(bytes)) => bytes
            .chunks_exact(6)
            .map(|chunk| Peer {
                ip: IpAddr::V4(Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3])),
                port: u16::from_be_bytes([chunk[4], chunk[5]]),
            })
            .collect(),
        Some(Value::List(entries)) => entries
            .iter()
            .filter_map(|entry| {
                let dict = entry.as_dict()?;
                let ip: IpAddr = dict
                    .get(b"ip")
                    .and_then(Value::as_bytes)
                    .and_then(|b| std::str::from_utf8(b).ok())
                    .and_then(|s| s.parse().ok())?;
                let port = dict.get(b"port").and_then(Value::as_integer)? as u16;
                Some(Peer { ip, port })
            })
            .collect(),
        _ => Vec::new(),
    };

    Ok(TrackerResponse {
        complete,
        incomplete,
        interval,
        downloaded,
        min_interval,
        peers,
    })
}

fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    let prefix = b"-RT0001-";
    peer_id[..prefix.len()].copy_from_slice(prefix);
    rand::rng().fill(&mut peer_id[prefix.len()..]);
    peer_id
}

/// Percent-encodes raw bytes per RFC 3986's unreserved set; used for
/// `info_hash`/`peer_id`, which are arbitrary bytes, not text.
fn url_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_raw_bytes_as_percent_escapes() {
        assert_eq!(url_encode(b"ab\xff"), "ab%FF");
    }

    #[test]
    fn builds_url_with_params_in_spec_order() {
        let request = TrackerRequest {
            info_hash: [0xaa; 20],
            peer_id: *b"-RT0001-01234567890",
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            compact: true,
            no_peer_id: false,
            corrupt: 0,
            numwant: Some(50),
            event: Some(Event::Started),
            total_length: 100,
        };
        let url = build_announce_url("http://tracker.example/announce", &request).unwrap();
        let query = url.query().unwrap();
        let keys: Vec<&str> = query.split('&').map(|kv| kv.split('=').next().unwrap()).collect();
        assert_eq!(
            keys,
            vec![
                "info_hash",
                "peer_id",
                "port",
                "uploaded",
                "downloaded",
                "left",
                "compact",
                "no_peer_id",
                "corrupt",
                "numwant",
                "event",
            ]
        );
    }

    #[test]
    fn left_recomputes_after_downloaded_changes() {
        let mut request = TrackerRequest {
            info_hash: [0u8; 20],
            peer_id: [0u8; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            compact: true,
            no_peer_id: false,
            corrupt: 0,
            numwant: None,
            event: None,
            total_length: 1000,
        };
        assert_eq!(request.left(), 1000);
        request.downloaded = 400;
        assert_eq!(request.left(), 600);
    }

    #[test]
    fn parses_compact_peer_list() {
        let body = b"d8:completei1e10:incompletei2e8:intervali900e5:peers6:\x7f\x00\x00\x01\x1a\xe1e";
        let resp = parse_announce_response(body).unwrap();
        assert_eq!(resp.peers.len(), 1);
        assert_eq!(resp.peers[0].ip, IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(resp.peers[0].port, 0x1ae1);
    }

    #[test]
    fn failure_reason_short_circuits_the_rest_of_the_response() {
        let body = b"d14:failure reason17:torrent not founde";
        let err = parse_announce_response(body).unwrap_err();
        assert!(matches!(err, TrackerError::TrackerFailure(ref m) if m == "torrent not found"));
    }

    #[test]
    fn parses_non_compact_peer_list() {
        let body = b"d8:completei1e10:incompletei2e8:intervali900e5:peersld2:ip9:127.0.0.14:porti6881eeee";
        let resp = parse_announce_response(body).unwrap();
        assert_eq!(resp.peers.len(), 1);
        assert_eq!(resp.peers[0].port, 6881);
    }
}
