use std::{env, net::IpAddr, time::Duration};

use derivative::Derivative;
use webrtc::{
    ice_transport::ice_server::RTCIceServer,
    peer_connection::configuration::RTCConfiguration,
    rtp_transceiver::rtp_codec::RTPCodecType,
};

use crate::error::{ConfigErrorKind, Error};

/// Timing and sizing parameters of a [`crate::channel::SignalingChannel`].
/// The defaults are what browsers talking to this server expect.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// The connection is considered dead when nothing arrives for this long.
    pub read_timeout: Duration,
    /// Keepalive ping period. Must be shorter than `read_timeout`.
    pub ping_interval: Duration,
    /// Deadline for every single outbound write.
    pub write_timeout: Duration,
    /// Inbound frames larger than this close the connection.
    pub max_message_size: usize,
    /// Capacity of the outbound queue between callers and the write task.
    pub send_queue_capacity: usize,
}

impl ChannelConfig {
    /// Builds a config with `read_timeout` and a ping interval of 90% of it.
    pub fn with_read_timeout(read_timeout: Duration) -> Self {
        Self {
            read_timeout,
            ping_interval: read_timeout * 9 / 10,
            ..Default::default()
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        let read_timeout = Duration::from_secs(60);
        Self {
            read_timeout,
            ping_interval: read_timeout * 9 / 10,
            write_timeout: Duration::from_secs(10),
            max_message_size: 8192,
            send_queue_capacity: 256,
        }
    }
}

/// Media settings applied to every peer created by [`crate::rtc_peer::RtcEngine`].
#[derive(Debug, Clone)]
pub struct MediaConfig {
    /// Kind of the single `sendrecv` transceiver each peer starts with.
    pub codec_type: RTPCodecType,
    pub receive_mtu: usize,
    /// Period of keyframe requests sent for received video tracks.
    pub pli_interval: Duration,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            codec_type: RTPCodecType::Audio,
            receive_mtu: 65000,
            pli_interval: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

/// Network settings of the peer connections.
#[derive(Derivative, Clone, Default)]
#[derivative(Debug)]
pub struct WebRTCTransportConfig {
    #[derivative(Debug = "ignore")]
    pub configuration: RTCConfiguration,
    /// Public addresses announced as host candidates instead of the local ones.
    pub announced_ips: Vec<IpAddr>,
    pub port_range: Option<PortRange>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub channel: ChannelConfig,
    pub media: MediaConfig,
    pub transport: WebRTCTransportConfig,
    /// How long an `OfferRequest` waits before checking the signaling state.
    pub offer_request_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            media: MediaConfig::default(),
            transport: WebRTCTransportConfig::default(),
            offer_request_grace: Duration::from_secs(1),
        }
    }
}

pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

/// Settings of the demo HTTP server, read from the environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub public_ip: Option<IpAddr>,
    pub ice_servers: Vec<String>,
    pub port_range: Option<PortRange>,
}

impl ServerConfig {
    /// Reads `PORT`, `PUBLIC_IP`, `ICE_SERVERS`, `RTC_MIN_PORT` and `RTC_MAX_PORT`.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = match lookup("PORT") {
            Some(value) => parse_env("PORT", &value)?,
            None => 8000,
        };
        let public_ip = match lookup("PUBLIC_IP") {
            Some(value) => Some(parse_env("PUBLIC_IP", &value)?),
            None => None,
        };
        let ice_servers = lookup("ICE_SERVERS")
            .unwrap_or_else(|| DEFAULT_ICE_SERVER.to_string())
            .split(',')
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect();
        let port_range = match (lookup("RTC_MIN_PORT"), lookup("RTC_MAX_PORT")) {
            (None, None) => None,
            (Some(min), Some(max)) => {
                let min: u16 = parse_env("RTC_MIN_PORT", &min)?;
                let max: u16 = parse_env("RTC_MAX_PORT", &max)?;
                if min > max {
                    return Err(Error::new_config(
                        format!("RTC_MIN_PORT {} is greater than RTC_MAX_PORT {}", min, max),
                        ConfigErrorKind::InvalidPortRangeError,
                    ));
                }
                Some(PortRange { min, max })
            }
            _ => {
                return Err(Error::new_config(
                    "RTC_MIN_PORT and RTC_MAX_PORT must be set together".to_string(),
                    ConfigErrorKind::InvalidPortRangeError,
                ))
            }
        };

        Ok(Self {
            port,
            public_ip,
            ice_servers,
            port_range,
        })
    }

    /// Peer connection settings derived from this server config.
    pub fn transport_config(&self) -> WebRTCTransportConfig {
        let mut config = WebRTCTransportConfig::default();
        if !self.ice_servers.is_empty() {
            config.configuration.ice_servers = vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }];
        }
        config.announced_ips = self.public_ip.into_iter().collect();
        config.port_range = self.port_range.clone();
        config
    }
}

fn parse_env<T>(key: &str, value: &str) -> Result<T, Error>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|err| {
        Error::new_config(
            format!("failed to parse {}={}: {}", key, value, err),
            ConfigErrorKind::InvalidEnvError,
        )
    })
}
