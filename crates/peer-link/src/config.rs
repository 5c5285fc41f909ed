//! Configuration for the relay, the peer transport and data channels.
//!
//! Defaults can be overridden through `PEER_LINK_*` environment variables.
//! Values that fail to parse are logged and replaced by the default.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::model::{
    ClientSource, ConnectionSecrets, NegotiationRole, PeerConnectionId, PeerConnectionState,
};
use crate::signaling::Notification;

pub const DEFAULT_SIGNALING_URL: &str = "wss://signaling-server-betanet.radixdlt.com";
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(55);
pub const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_STUN_SERVERS: [&str; 5] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid signaling url: {0}")]
    InvalidUrl(String),
    #[error("signaling url cannot carry a path: {0}")]
    CannotBeABase(Url),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingServerConfig {
    pub base_url: Url,
    /// Keepalive ping period on the relay WebSocket. `None` disables pings.
    pub ping_interval: Option<Duration>,
}

impl Default for SignalingServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_signaling_url(),
            ping_interval: Some(DEFAULT_PING_INTERVAL),
        }
    }
}

fn default_signaling_url() -> Url {
    Url::parse(DEFAULT_SIGNALING_URL).expect("default signaling url is a valid url")
}

impl SignalingServerConfig {
    pub fn from_env() -> Self {
        let base_url = match std::env::var("PEER_LINK_SIGNALING_URL") {
            Ok(raw) => match Url::parse(raw.trim()) {
                Ok(url) => url,
                Err(err) => {
                    warn!(
                        target = "peer_link::config",
                        var = "PEER_LINK_SIGNALING_URL",
                        error = %err,
                        default = DEFAULT_SIGNALING_URL,
                        "failed to parse signaling url; using default"
                    );
                    default_signaling_url()
                }
            },
            Err(_) => default_signaling_url(),
        };
        let ping_secs = parse_u64_env("PEER_LINK_WS_PING_SECS", DEFAULT_PING_INTERVAL.as_secs());
        Self {
            base_url,
            ping_interval: (ping_secs > 0).then(|| Duration::from_secs(ping_secs)),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Result<Self, ConfigError> {
        self.base_url = Url::parse(base_url).map_err(|err| ConfigError::InvalidUrl(err.to_string()))?;
        Ok(self)
    }

    /// `<base>/<hex connection id>?target=<other side>&source=<this side>`
    pub fn server_url(
        &self,
        connection_id: &PeerConnectionId,
        source: ClientSource,
    ) -> Result<Url, ConfigError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ConfigError::CannotBeABase(self.base_url.clone()))?
            .pop_if_empty()
            .push(&connection_id.to_hex());
        url.query_pairs_mut()
            .clear()
            .append_pair("target", source.opposite().as_str())
            .append_pair("source", source.as_str());
        Ok(url)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalingChannelConfig {
    /// Wait for the relay to confirm each request before `send_to_remote` returns.
    pub require_send_confirmation: bool,
    pub confirmation_timeout: Duration,
}

impl Default for SignalingChannelConfig {
    fn default() -> Self {
        Self {
            require_send_confirmation: true,
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
        }
    }
}

impl SignalingChannelConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            require_send_confirmation: parse_bool_env(
                "PEER_LINK_SEND_CONFIRMATION",
                defaults.require_send_confirmation,
            ),
            confirmation_timeout: Duration::from_millis(parse_u64_env(
                "PEER_LINK_CONFIRMATION_TIMEOUT_MS",
                defaults.confirmation_timeout.as_millis() as u64,
            )),
        }
    }

    pub fn without_confirmation() -> Self {
        Self {
            require_send_confirmation: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Events that tear a peer connection down and rebuild it under the same id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectTriggers {
    pub peer_connection_states: Vec<PeerConnectionState>,
    pub notifications: Vec<Notification>,
}

impl Default for ReconnectTriggers {
    fn default() -> Self {
        Self {
            peer_connection_states: vec![PeerConnectionState::Failed],
            notifications: Vec::new(),
        }
    }
}

impl ReconnectTriggers {
    pub fn none() -> Self {
        Self {
            peer_connection_states: Vec::new(),
            notifications: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebRtcConfig {
    pub ice_servers: Vec<IceServer>,
    pub reconnect_triggers: ReconnectTriggers,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_STUN_SERVERS.iter().map(|url| IceServer::stun(*url)).collect(),
            reconnect_triggers: ReconnectTriggers::default(),
        }
    }
}

impl WebRtcConfig {
    /// Host candidates only, for loopback and in-memory runs.
    pub fn local_only() -> Self {
        Self {
            ice_servers: Vec::new(),
            reconnect_triggers: ReconnectTriggers::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataChannelConfig {
    pub ordered: bool,
    /// Both sides open the channel with the same id instead of announcing it in-band.
    pub negotiated: bool,
    #[serde(default)]
    pub max_retransmits: Option<u16>,
}

impl Default for DataChannelConfig {
    fn default() -> Self {
        Self {
            ordered: true,
            negotiated: true,
            max_retransmits: None,
        }
    }
}

/// Everything one endpoint needs to bring up a link.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub webrtc: WebRtcConfig,
    pub data_channel: DataChannelConfig,
    pub role: NegotiationRole,
    pub secrets: ConnectionSecrets,
    pub source: ClientSource,
    pub signaling_server: SignalingServerConfig,
    pub signaling_channel: SignalingChannelConfig,
}

impl LinkConfig {
    pub fn new(secrets: ConnectionSecrets, role: NegotiationRole, source: ClientSource) -> Self {
        Self {
            webrtc: WebRtcConfig::default(),
            data_channel: DataChannelConfig::default(),
            role,
            secrets,
            source,
            signaling_server: SignalingServerConfig::from_env(),
            signaling_channel: SignalingChannelConfig::from_env(),
        }
    }
}

pub(crate) fn parse_usize_env(var: &str, default: usize, min: usize) -> usize {
    match std::env::var(var) {
        Ok(value) => match value.trim().parse::<usize>() {
            Ok(parsed) if parsed >= min => parsed,
            Ok(parsed) => {
                warn!(
                    target = "peer_link::config",
                    var, parsed, min, default, "config value below minimum; using default"
                );
                default
            }
            Err(err) => {
                warn!(
                    target = "peer_link::config",
                    var,
                    error = %err,
                    default,
                    "failed to parse config from env; using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

pub(crate) fn parse_u64_env(var: &str, default: u64) -> u64 {
    match std::env::var(var) {
        Ok(value) => value.trim().parse::<u64>().unwrap_or_else(|err| {
            warn!(
                target = "peer_link::config",
                var,
                error = %err,
                default,
                "failed to parse config from env; using default"
            );
            default
        }),
        Err(_) => default,
    }
}

pub(crate) fn parse_bool_env(var: &str, default: bool) -> bool {
    match std::env::var(var) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            other => {
                warn!(
                    target = "peer_link::config",
                    var,
                    value = other,
                    default,
                    "unrecognised boolean in env; using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_url_targets_the_other_side() {
        let config = SignalingServerConfig::default();
        let id = PeerConnectionId::new([0x01; 32]);
        let url = config.server_url(&id, ClientSource::Wallet).expect("url");
        assert_eq!(
            url.as_str(),
            format!(
                "wss://signaling-server-betanet.radixdlt.com/{}?target=extension&source=wallet",
                "01".repeat(32)
            )
        );

        let url = config.server_url(&id, ClientSource::Extension).expect("url");
        assert!(url.as_str().ends_with("?target=wallet&source=extension"));
    }

    #[test]
    fn server_url_appends_to_existing_path() {
        let config = SignalingServerConfig::default()
            .with_base_url("ws://127.0.0.1:8080/relay/")
            .expect("base url");
        let id = PeerConnectionId::new([0xff; 32]);
        let url = config.server_url(&id, ClientSource::Wallet).expect("url");
        assert_eq!(url.path(), format!("/relay/{}", "ff".repeat(32)));
    }

    #[test]
    fn defaults_match_documented_values() {
        let webrtc = WebRtcConfig::default();
        assert_eq!(webrtc.ice_servers.len(), 5);
        assert_eq!(
            webrtc.reconnect_triggers.peer_connection_states,
            vec![PeerConnectionState::Failed]
        );
        let channel = DataChannelConfig::default();
        assert!(channel.ordered && channel.negotiated);
        assert!(SignalingChannelConfig::default().require_send_confirmation);
        assert!(!SignalingChannelConfig::without_confirmation().require_send_confirmation);
    }
}
