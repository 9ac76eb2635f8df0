//! Peer connection configuration
//!
//! Configuration can be assembled in code with the builder methods or loaded
//! from a TOML file. Environment variables prefixed with `PEERLINK__`
//! override file values (`PEERLINK__SDP_SEMANTICS=plan-b`).
//!
//! ```rust
//! use peerlink_negotiation_core::config::{PeerConnectionConfig, SdpSemantics};
//!
//! let config = PeerConnectionConfig::new()
//!     .with_ice_server("stun:stun.l.google.com:19302")
//!     .with_sdp_semantics(SdpSemantics::UnifiedPlan);
//!
//! assert!(config.validate().is_ok());
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "PEERLINK";

/// SDP dialect used when rendering descriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SdpSemantics {
    /// One m-line per kind, tracks multiplexed by ssrc
    PlanB,
    /// One m-line per transceiver
    UnifiedPlan,
}

impl Default for SdpSemantics {
    fn default() -> Self {
        Self::UnifiedPlan
    }
}

/// What to do when a remote offer arrives while a local offer is outstanding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GlarePolicy {
    /// Reject the remote offer with a negotiation error
    Fail,
    /// Roll back the local offer and accept the remote one
    Rollback,
}

impl Default for GlarePolicy {
    fn default() -> Self {
        Self::Fail
    }
}

/// A STUN or TURN server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    /// Server URLs (`stun:`, `stuns:`, `turn:` or `turns:`)
    pub urls: Vec<String>,

    /// TURN username
    #[serde(default)]
    pub username: Option<String>,

    /// TURN credential
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// Server reachable through a single URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// Attach TURN credentials
    pub fn with_credentials(mut self, username: impl Into<String>, credential: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.credential = Some(credential.into());
        self
    }

    /// Validate every URL of this server
    pub fn validate(&self) -> Result<()> {
        if self.urls.is_empty() {
            return Err(Error::configuration("ICE server without URLs"));
        }

        for url in &self.urls {
            let parsed = IceServerUrl::parse(url)?;
            if parsed.scheme.is_turn() && (self.username.is_none() || self.credential.is_none()) {
                return Err(Error::configuration(format!(
                    "TURN server {} requires a username and credential",
                    url
                )));
            }
        }

        Ok(())
    }
}

/// URL scheme of an ICE server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceServerScheme {
    Stun,
    Stuns,
    Turn,
    Turns,
}

impl IceServerScheme {
    fn is_turn(self) -> bool {
        matches!(self, Self::Turn | Self::Turns)
    }

    fn default_port(self) -> u16 {
        match self {
            Self::Stun | Self::Turn => crate::constants::DEFAULT_STUN_PORT,
            Self::Stuns | Self::Turns => crate::constants::DEFAULT_TURNS_PORT,
        }
    }
}

/// Parsed form of `scheme:host[:port][?transport=udp|tcp]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServerUrl {
    pub scheme: IceServerScheme,
    pub host: String,
    pub port: u16,
    pub transport: Option<String>,
}

impl IceServerUrl {
    /// Parse an ICE server URL
    pub fn parse(url: &str) -> Result<Self> {
        let (scheme, rest) = url
            .split_once(':')
            .ok_or_else(|| Error::configuration(format!("ICE server URL without scheme: {}", url)))?;

        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "stun" => IceServerScheme::Stun,
            "stuns" => IceServerScheme::Stuns,
            "turn" => IceServerScheme::Turn,
            "turns" => IceServerScheme::Turns,
            other => {
                return Err(Error::configuration(format!(
                    "unsupported ICE server scheme '{}' in {}",
                    other, url
                )))
            }
        };

        let (address, query) = match rest.split_once('?') {
            Some((address, query)) => (address, Some(query)),
            None => (rest, None),
        };

        let transport = match query {
            None => None,
            Some(query) => {
                if scheme == IceServerScheme::Stun || scheme == IceServerScheme::Stuns {
                    return Err(Error::configuration(format!("STUN URL cannot carry a query: {}", url)));
                }
                match query.strip_prefix("transport=") {
                    Some(t @ ("udp" | "tcp")) => Some(t.to_string()),
                    _ => {
                        return Err(Error::configuration(format!(
                            "invalid transport parameter in {}",
                            url
                        )))
                    }
                }
            }
        };

        let (host, port) = split_host_port(address)
            .ok_or_else(|| Error::configuration(format!("invalid host or port in {}", url)))?;

        Ok(Self {
            scheme,
            host: host.to_string(),
            port: port.unwrap_or_else(|| scheme.default_port()),
            transport,
        })
    }
}

fn split_host_port(address: &str) -> Option<(&str, Option<u16>)> {
    if address.is_empty() || address.starts_with("//") {
        return None;
    }

    // Bracketed IPv6 literal
    if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(port) => Some(port.parse().ok()?),
            None if tail.is_empty() => None,
            None => return None,
        };
        return Some((host, port));
    }

    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => Some((host, Some(port.parse().ok()?))),
        Some(_) => None,
        None => Some((address, None)),
    }
}

/// Configuration for a single peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConnectionConfig {
    /// STUN/TURN servers handed to the transport
    #[serde(default)]
    pub ice_servers: Vec<IceServerConfig>,

    /// SDP dialect
    #[serde(default)]
    pub sdp_semantics: SdpSemantics,

    /// Handling of simultaneous offers
    #[serde(default)]
    pub glare_policy: GlarePolicy,
}

impl Default for PeerConnectionConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            sdp_semantics: SdpSemantics::default(),
            glare_policy: GlarePolicy::default(),
        }
    }
}

impl PeerConnectionConfig {
    /// Empty configuration (host candidates only)
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a server reachable through a single URL
    pub fn with_ice_server(mut self, url: impl Into<String>) -> Self {
        self.ice_servers.push(IceServerConfig::new(url));
        self
    }

    /// Add a fully specified server
    pub fn with_ice_server_config(mut self, server: IceServerConfig) -> Self {
        self.ice_servers.push(server);
        self
    }

    /// Set the SDP dialect
    pub fn with_sdp_semantics(mut self, semantics: SdpSemantics) -> Self {
        self.sdp_semantics = semantics;
        self
    }

    /// Set the glare policy
    pub fn with_glare_policy(mut self, policy: GlarePolicy) -> Self {
        self.glare_policy = policy;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        for server in &self.ice_servers {
            server.validate()?;
        }
        Ok(())
    }

    /// Load from a TOML file, applying `PEERLINK__*` environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let parsed: Self = settings.try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Load from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()?;

        let parsed: Self = settings.try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }
}
