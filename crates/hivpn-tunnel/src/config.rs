//! Tunnel Configuration
//!
//! `TunnelConfig` is the per-session request (where to connect, what to
//! call the session). `ClientSettings` holds the host-level settings that
//! stay fixed across sessions: the virtual interface layout, the connect
//! timeout and the socket mark used to keep upstream traffic out of the
//! tunnel.

use crate::error::{Result, TunnelError};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::time::Duration;

/// Connect request as received on the command bridge
///
/// Every field is optional on the wire so that a missing field is
/// reported as a configuration error rather than a parse failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub server_address: Option<String>,
    pub server_port: Option<i64>,
    pub connection_name: Option<String>,
}

/// Validated session configuration, immutable once a session starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Upstream server host name or IP address
    pub server_address: String,
    /// Upstream server port
    pub server_port: u16,
    /// Session/display name given to the virtual interface
    pub connection_name: String,
}

impl TunnelConfig {
    /// Create a configuration, validating every field
    pub fn new(
        server_address: impl Into<String>,
        server_port: u16,
        connection_name: impl Into<String>,
    ) -> Result<Self> {
        let config = Self {
            server_address: server_address.into(),
            server_port,
            connection_name: connection_name.into(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check that every required field is present and well-formed
    pub fn validate(&self) -> Result<()> {
        let address = self.server_address.trim();
        if address.is_empty() {
            return Err(TunnelError::Config("serverAddress is required".into()));
        }
        if address.chars().any(char::is_whitespace) {
            return Err(TunnelError::Config(format!(
                "serverAddress {:?} is not a host name or IP address",
                self.server_address
            )));
        }
        if self.server_port == 0 {
            return Err(TunnelError::Config(
                "serverPort must be in 1-65535".into(),
            ));
        }
        if self.connection_name.trim().is_empty() {
            return Err(TunnelError::Config("connectionName is required".into()));
        }
        Ok(())
    }

    /// `address:port` form for logging
    pub fn endpoint(&self) -> String {
        match self.server_address.parse::<IpAddr>() {
            Ok(IpAddr::V6(addr)) => format!("[{}]:{}", addr, self.server_port),
            _ => format!("{}:{}", self.server_address, self.server_port),
        }
    }
}

impl TryFrom<ConnectRequest> for TunnelConfig {
    type Error = TunnelError;

    fn try_from(request: ConnectRequest) -> Result<Self> {
        let server_address = request
            .server_address
            .ok_or_else(|| TunnelError::Config("serverAddress is required".into()))?;
        let port = request
            .server_port
            .ok_or_else(|| TunnelError::Config("serverPort is required".into()))?;
        let server_port = u16::try_from(port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| {
                TunnelError::Config(format!("serverPort {} is outside 1-65535", port))
            })?;
        let connection_name = request
            .connection_name
            .ok_or_else(|| TunnelError::Config("connectionName is required".into()))?;

        Self::new(server_address, server_port, connection_name)
    }
}

/// Virtual interface layout applied at bring-up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceSettings {
    /// Interface name requested from the host
    pub name: String,
    /// Local IPv4 address and prefix
    pub address: Ipv4Net,
    /// Local IPv6 address, applied only when the host supports IPv6
    pub ipv6: Option<Ipv6Net>,
    /// Resolvers advertised on the interface (never queried by us)
    pub dns: Vec<IpAddr>,
    /// Routes directed into the interface
    pub routes: Vec<IpNet>,
    pub mtu: u16,
    /// Applications whose traffic must not be captured
    pub excluded_applications: Vec<String>,
}

impl Default for InterfaceSettings {
    fn default() -> Self {
        Self {
            name: "hivpn0".to_string(),
            address: Ipv4Net::new(Ipv4Addr::new(10, 8, 0, 1), 24)
                .unwrap_or_default(),
            ipv6: Ipv6Net::new(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1), 64).ok(),
            dns: vec![
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), // Google
                IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4)), // Google secondary
                IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), // Cloudflare
            ],
            routes: vec![
                IpNet::V4(Ipv4Net::default()), // 0.0.0.0/0
                IpNet::V6(Ipv6Net::default()), // ::/0
            ],
            mtu: 1500,
            excluded_applications: vec![
                "com.android.systemui".to_string(),
                "com.android.settings".to_string(),
            ],
        }
    }
}

/// Host-level client settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Upstream connect budget (milliseconds)
    pub connect_timeout_ms: u64,
    /// Socket mark that keeps the upstream connection off the tunnel
    pub fwmark: u32,
    /// Policy routing table holding the tunnel's routes
    pub route_table: u32,
    /// Log forwarding statistics every N packets
    pub stats_log_interval: u64,
    /// Read buffer per forwarding direction
    pub buffer_size: usize,
    pub interface: InterfaceSettings,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            fwmark: 0x4856,
            route_table: 4856,
            stats_log_interval: 500,
            buffer_size: 32 * 1024,
            interface: InterfaceSettings::default(),
        }
    }
}

impl ClientSettings {
    /// Load settings from a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TunnelError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Parse settings from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let settings: Self =
            toml::from_str(content).map_err(|e| TunnelError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Render settings as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| TunnelError::Config(e.to_string()))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interface.name.trim().is_empty() {
            return Err(TunnelError::Config("interface name is empty".into()));
        }
        if self.interface.mtu < 68 {
            return Err(TunnelError::Config(format!(
                "MTU {} is too small (minimum 68)",
                self.interface.mtu
            )));
        }
        if self.connect_timeout_ms == 0 {
            return Err(TunnelError::Config("connect timeout must be non-zero".into()));
        }
        if self.buffer_size < usize::from(self.interface.mtu) {
            return Err(TunnelError::Config(format!(
                "buffer size {} is smaller than the MTU",
                self.buffer_size
            )));
        }
        Ok(())
    }
}
