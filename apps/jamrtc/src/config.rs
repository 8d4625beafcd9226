use std::time::Duration;

use url::Url;

use crate::error::EngineError;
use crate::media::MediaBackend;
use crate::transport::{SignalingBackend, TransportConfig};

pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Jitter buffers longer than this are accepted but flagged.
pub const JITTER_BUFFER_WARN_MS: u32 = 1000;

/// Engine configuration, assembled by the bootstrap layer and checked by `init`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Janus WebSocket endpoint (`ws://` or `wss://`).
    pub endpoint: Url,
    pub ice_servers: Vec<IceServer>,
    pub jitter_buffer_ms: u32,
    pub media: MediaBackend,
    pub signaling: SignalingBackend,
    pub keepalive_interval: Duration,
    pub plugin: String,
    pub transport: TransportConfig,
    /// Our own participant UUID; a random one is generated when absent.
    pub local_uuid: Option<String>,
}

impl EngineConfig {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            ice_servers: Vec::new(),
            jitter_buffer_ms: 0,
            media: MediaBackend::default(),
            signaling: SignalingBackend::default(),
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            plugin: janus_proto::VIDEOROOM_PLUGIN.to_string(),
            transport: TransportConfig::from_env(),
            local_uuid: None,
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        match self.endpoint.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(EngineError::InvalidConfig(format!(
                    "endpoint scheme must be ws or wss, got {other}"
                )));
            }
        }
        if self.endpoint.host_str().map_or(true, str::is_empty) {
            return Err(EngineError::InvalidConfig("endpoint has no host".into()));
        }
        if self.keepalive_interval.is_zero() {
            return Err(EngineError::InvalidConfig("keepalive interval must be non-zero".into()));
        }
        if self.plugin.is_empty() {
            return Err(EngineError::InvalidConfig("plugin name is empty".into()));
        }
        Ok(())
    }
}

/// Parse a signaling endpoint string.
pub fn parse_endpoint(raw: &str) -> Result<Url, EngineError> {
    Url::parse(raw).map_err(|err| EngineError::InvalidConfig(format!("invalid endpoint {raw:?}: {err}")))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    /// `host:port`
    pub fn stun(address: &str) -> Result<Self, EngineError> {
        let address = validate_address(address)?;
        Ok(Self {
            url: format!("stun:{address}"),
            username: None,
            credential: None,
        })
    }

    /// `user:password@host:port`
    pub fn turn(spec: &str) -> Result<Self, EngineError> {
        let (credentials, address) = spec
            .rsplit_once('@')
            .ok_or_else(|| EngineError::InvalidConfig(format!("turn server {spec:?} lacks credentials")))?;
        let (username, credential) = credentials
            .split_once(':')
            .ok_or_else(|| EngineError::InvalidConfig(format!("turn server {spec:?} lacks a password")))?;
        let address = validate_address(address)?;
        Ok(Self {
            url: format!("turn:{address}"),
            username: Some(username.to_string()),
            credential: Some(credential.to_string()),
        })
    }
}

fn validate_address(address: &str) -> Result<&str, EngineError> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| EngineError::InvalidConfig(format!("{address:?} is not host:port")))?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(EngineError::InvalidConfig(format!("{address:?} is not host:port")));
    }
    Ok(address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ws_endpoints_only() {
        let config = EngineConfig::new(parse_endpoint("ws://127.0.0.1:8188").unwrap());
        assert!(config.validate().is_ok());

        let config = EngineConfig::new(parse_endpoint("http://127.0.0.1:8088/janus").unwrap());
        assert!(matches!(config.validate(), Err(EngineError::InvalidConfig(_))));

        assert!(parse_endpoint("not a url").is_err());
    }

    #[test]
    fn defaults_match_janus_videoroom() {
        let config = EngineConfig::new(parse_endpoint("wss://janus.example.com/ws").unwrap());
        assert_eq!(config.keepalive_interval, Duration::from_secs(15));
        assert_eq!(config.plugin, "janus.plugin.videoroom");
    }

    #[test]
    fn parses_stun_and_turn_servers() {
        let stun = IceServer::stun("stun.l.google.com:19302").unwrap();
        assert_eq!(stun.url, "stun:stun.l.google.com:19302");
        assert_eq!(stun.username, None);

        let turn = IceServer::turn("jam:s3cret@turn.example.com:3478").unwrap();
        assert_eq!(turn.url, "turn:turn.example.com:3478");
        assert_eq!(turn.username.as_deref(), Some("jam"));
        assert_eq!(turn.credential.as_deref(), Some("s3cret"));

        assert!(IceServer::stun("nohost").is_err());
        assert!(IceServer::stun("host:notaport").is_err());
        assert!(IceServer::turn("turn.example.com:3478").is_err());
    }
}
