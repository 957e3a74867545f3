use crate::error::ApplicationError;
use crate::peer::Peer;
use crate::torrent::Torrent;
use async_trait::async_trait;
use log::debug;
use percent_encoding::{NON_ALPHANUMERIC, percent_encode};
use reqwest::Client;
use serde::Deserialize;
use serde_bencode::de;
use serde_bencode::value::Value;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use url::Url;

/// Peers returned by one announce, plus the tracker's preferred interval.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Announce {
    pub peers:    Vec<Peer>,
    pub interval: Option<Duration>,
}

/// Where the session gets its peer lists from.
#[async_trait]
pub trait PeerSource: Send + Sync {
    async fn get_peers(&self) -> Result<Announce, ApplicationError>;
}

/// Represents the response returned by a tracker announce request
#[derive(Debug, Deserialize)]
pub struct AnnounceResponse {
    #[serde(rename = "failure reason")]
    pub failure_reason: Option<String>,
    #[serde(rename = "peers")]
    pub peers_data: Option<Value>,
    pub interval:   Option<i64>,
}

impl AnnounceResponse {
    pub fn from_bytes(raw: &[u8]) -> Result<Self, ApplicationError> {
        de::from_bytes(raw).map_err(|e| ApplicationError::TrackerError(format!("{}", e)))
    }

    pub fn peers(&self) -> Vec<Peer> {
        let mut result = Vec::new();

        match &self.peers_data {
            // Compact form: 4 bytes of IPv4 address then a big-endian port
            Some(Value::Bytes(data)) => {
                for chunk in data.chunks(6) {
                    if chunk.len() == 6 {
                        let ip   = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                        let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                        result.push(Peer {
                            ip:   IpAddr::V4(ip),
                            port,
                        });
                    }
                }
            }
            // Dictionary form: a list of {"ip": <string>, "port": <int>}
            Some(Value::List(list)) => {
                for item in list {
                    if let Value::Dict(dict) = item {
                        let ip = dict.get(&b"ip".to_vec())
                            .and_then(|v| match v {
                                Value::Bytes(b) => String::from_utf8(b.clone()).ok(),
                                           _    => None,
                            })
                            .and_then(|s| s.parse::<IpAddr>().ok());

                        let port = dict.get(&b"port".to_vec())
                            .and_then(|v| match v {
                                Value::Int(n)   => u16::try_from(*n).ok(),
                                           _    => None,
                            });

                        if let (Some(ip), Some(port)) = (ip, port) {
                            result.push(Peer { ip, port });
                        }
                    }
                }
            }
            _ => {}
        }
        result
    }

    pub fn into_announce(self) -> Result<Announce, ApplicationError> {
        if let Some(reason) = &self.failure_reason {
            return Err(ApplicationError::TrackerError(reason.clone()));
        }
        Ok(Announce {
            peers:    self.peers(),
            interval: self
                .interval
                .filter(|i| *i > 0)
                .map(|i| Duration::from_secs(i as u64)),
        })
    }
}

/// HTTP tracker client for a single torrent
pub struct Tracker {
    client:    Client,
    announce:  Url,
    info_hash: [u8; 20],
    peer_id:   [u8; 20],
    port:      u16,
    left:      u64,
}

impl Tracker {
    pub fn new(torrent: &Torrent, peer_id: [u8; 20], port: u16) -> Result<Self, ApplicationError> {
        let announce = Url::parse(&torrent.announce)
            .map_err(|e| ApplicationError::TrackerError(format!("{}", e)))?;

        Ok(Self {
            client: Client::new(),
            announce,
            info_hash: torrent.info_hash(),
            peer_id,
            port,
            left: torrent.total_size(),
        })
    }

    fn announce_url(&self) -> String {
        let params = [
            ("info_hash",  percent_encode(&self.info_hash, NON_ALPHANUMERIC).to_string()),
            ("peer_id",    percent_encode(&self.peer_id, NON_ALPHANUMERIC).to_string()),
            ("port",       self.port.to_string()),
            ("uploaded",   "0".to_string()),
            ("downloaded", "0".to_string()),
            ("left",       self.left.to_string()),
            ("compact",    "1".to_string()),
            ("event",      "started".to_string()),
        ];

        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        let sep = if self.announce.query().is_some() { '&' } else { '?' };
        format!("{}{}{}", self.announce, sep, query)
    }
}

#[async_trait]
impl PeerSource for Tracker {
    /// Sends an announce request to the tracker and returns the list of peers
    async fn get_peers(&self) -> Result<Announce, ApplicationError> {
        let url = self.announce_url();
        debug!("announcing to {}", self.announce);

        let raw = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ApplicationError::TrackerError(format!("{}", e)))?
            .bytes()
            .await
            .map_err(|e| ApplicationError::TrackerError(format!("{}", e)))?;

        AnnounceResponse::from_bytes(&raw)?.into_announce()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compact_peers_and_interval() {
        let mut raw = b"d8:intervali900e5:peers12:".to_vec();
        raw.extend([192, 168, 1, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0x1a, 0xe2]);
        raw.push(b'e');

        let announce = AnnounceResponse::from_bytes(&raw)
            .unwrap()
            .into_announce()
            .unwrap();

        assert_eq!(announce.interval, Some(Duration::from_secs(900)));
        assert_eq!(
            announce.peers,
            vec![
                Peer { ip: "192.168.1.1".parse().unwrap(), port: 6881 },
                Peer { ip: "10.0.0.2".parse().unwrap(), port: 6882 },
            ]
        );
    }

    #[test]
    fn parses_dictionary_peers() {
        let raw = b"d5:peersld2:ip9:127.0.0.14:porti51413eed2:ip3:bad4:porti1eeee";
        let announce = AnnounceResponse::from_bytes(raw)
            .unwrap()
            .into_announce()
            .unwrap();

        assert_eq!(announce.interval, None);
        assert_eq!(
            announce.peers,
            vec![Peer { ip: "127.0.0.1".parse().unwrap(), port: 51413 }]
        );
    }

    #[test]
    fn failure_reason_is_an_error() {
        let raw = b"d14:failure reason9:not founde";
        let result = AnnounceResponse::from_bytes(raw).unwrap().into_announce();
        assert!(matches!(result, Err(ApplicationError::TrackerError(r)) if r == "not found"));
    }
}
