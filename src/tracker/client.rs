//! HTTP(S) announce client
//!
//! `info_hash` and `peer_id` travel as percent-encoded raw bytes, never hex.
//! A `failure reason` in the response surfaces as `TrackerFailure` without
//! retry; tier rotation is the engine's job.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::bencode::{decode, Value};
use crate::error::TorrentError;
use crate::tracker::identity::{Identity, RequestTransform};
use crate::tracker::peers::{parse_compact, PeerEndpoint};

/// Default announce interval when the tracker omits one
const DEFAULT_INTERVAL_SECS: u64 = 1800;

/// Announce lifecycle marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Stopped,
    Completed,
}

impl AnnounceEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnounceEvent::Started => "started",
            AnnounceEvent::Stopped => "stopped",
            AnnounceEvent::Completed => "completed",
        }
    }
}

/// One announce's parameters
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Option<AnnounceEvent>,
    pub numwant: u32,
}

/// Parsed announce response
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    pub interval: Duration,
    pub min_interval: Option<Duration>,
    pub peers: Vec<PeerEndpoint>,
}

/// Transport seam so engine tests can stub announces
#[async_trait]
pub trait AnnounceTransport: Send + Sync {
    async fn announce(&self, url: &str, request: &AnnounceRequest) -> Result<AnnounceResponse>;
}

/// Production announce client over reqwest
pub struct TrackerClient {
    http: reqwest::Client,
    source_ip: Option<std::net::Ipv4Addr>,
    transform: Option<Arc<dyn RequestTransform>>,
}

impl TrackerClient {
    pub fn new(identity: &Identity, announce_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(announce_timeout)
            .build()
            .map_err(|e| TorrentError::tracker_failure(format!("http client init: {}", e)))?;
        Ok(Self {
            http,
            source_ip: identity.source_ip,
            transform: None,
        })
    }

    /// Install the embedder's request-wrapping transform
    pub fn with_transform(mut self, transform: Arc<dyn RequestTransform>) -> Self {
        self.transform = Some(transform);
        self
    }

    fn build_url(&self, base: &str, req: &AnnounceRequest) -> String {
        let sep = if base.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&numwant={}",
            base,
            sep,
            percent_encode_bytes(&req.info_hash),
            percent_encode_bytes(&req.peer_id),
            req.port,
            req.uploaded,
            req.downloaded,
            req.left,
            req.numwant,
        );
        if let Some(event) = req.event {
            url.push_str("&event=");
            url.push_str(event.as_str());
        }
        if let Some(ip) = self.source_ip {
            url.push_str("&ip=");
            url.push_str(&ip.to_string());
        }
        url
    }
}

#[async_trait]
impl AnnounceTransport for TrackerClient {
    async fn announce(&self, url: &str, request: &AnnounceRequest) -> Result<AnnounceResponse> {
        let full_url = self.build_url(url, request);
        debug!("Announcing: {}", full_url);

        let mut builder = self.http.get(&full_url);
        if let Some(transform) = &self.transform {
            builder = transform.apply(builder);
        }

        let body = builder
            .send()
            .await
            .map_err(|e| TorrentError::tracker_failure_url(e.to_string(), url))?
            .bytes()
            .await
            .map_err(|e| TorrentError::tracker_failure_url(e.to_string(), url))?;

        let response = parse_response(&body)
            .map_err(|e| match e.downcast::<TorrentError>() {
                Ok(structured) => structured,
                Err(e) => TorrentError::tracker_failure_url(e.to_string(), url),
            })?;

        info!(
            "Announce to {} returned {} peers (interval {:?})",
            url,
            response.peers.len(),
            response.interval
        );
        Ok(response)
    }
}

/// Parse a bencoded announce response body
pub fn parse_response(body: &[u8]) -> Result<AnnounceResponse> {
    let root = decode(body)
        .map_err(|e| TorrentError::tracker_failure(format!("unparseable response: {}", e)))?;

    if let Some(reason) = root.get(b"failure reason") {
        let reason = reason
            .as_str()
            .unwrap_or("tracker returned a non-text failure reason");
        return Err(TorrentError::tracker_failure(reason).into());
    }

    let interval = root
        .get(b"interval")
        .and_then(Value::as_int)
        .and_then(|n| u64::try_from(n).ok())
        .unwrap_or(DEFAULT_INTERVAL_SECS);

    let min_interval = root
        .get(b"min interval")
        .and_then(Value::as_int)
        .and_then(|n| u64::try_from(n).ok())
        .map(Duration::from_secs);

    let peers = match root.get(b"peers") {
        Some(Value::Bytes(compact)) => parse_compact(compact)?,
        Some(Value::List(list)) => parse_dict_peers(list),
        Some(_) => {
            return Err(
                TorrentError::tracker_failure("peers is neither compact nor a list").into(),
            )
        }
        None => Vec::new(),
    };

    Ok(AnnounceResponse {
        interval: Duration::from_secs(interval),
        min_interval,
        peers,
    })
}

/// Dictionary-form peer list: entries with `ip`, `port`, optional `peer id`
fn parse_dict_peers(list: &[Value]) -> Vec<PeerEndpoint> {
    let mut peers = Vec::with_capacity(list.len());
    for entry in list {
        let Some(ip) = entry.get(b"ip").and_then(Value::as_str) else {
            warn!("Skipping peer entry without ip");
            continue;
        };
        let Ok(ip) = ip.parse::<std::net::Ipv4Addr>() else {
            // IPv6 and DNS names are out of scope for this core
            warn!("Skipping non-IPv4 peer address: {}", ip);
            continue;
        };
        let Some(port) = entry
            .get(b"port")
            .and_then(Value::as_int)
            .and_then(|p| u16::try_from(p).ok())
        else {
            warn!("Skipping peer entry without usable port");
            continue;
        };
        peers.push(PeerEndpoint {
            addr: std::net::SocketAddrV4::new(ip, port),
            peer_id: entry.get(b"peer id").and_then(Value::as_bytes).map(<[u8]>::to_vec),
        });
    }
    peers
}

/// Percent-encode raw bytes for a query parameter
///
/// Unreserved characters pass through; everything else, including the NUL
/// and high bytes common in infohashes, becomes `%XX`.
pub fn percent_encode_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for &b in bytes {
        match b {
            b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => {
                out.push('%');
                out.push_str(&format!("{:02X}", b));
            }
        }
    }
    out
}
