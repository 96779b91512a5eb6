//! Virtual Interface Management
//!
//! Brings up the virtual network adapter the tunnel captures traffic on.
//!
//! # Bring-up Steps
//!
//! | Step | Fatal | Notes |
//! |------|-------|-------|
//! | create device (address, MTU) | yes | permission or creation failure aborts |
//! | DNS resolvers | no | advertised only, never queried |
//! | routes (0.0.0.0/0, ::/0) | no | IPv6 routes only with IPv6 support |
//! | IPv6 address | no | only when the host supports IPv6 |
//! | excluded applications | no | often unsupported outside mobile hosts |
//!
//! Optional steps are logged and recorded in [`AppliedSteps`]; their
//! failure never aborts bring-up.

use crate::config::InterfaceSettings;
use crate::error::{Result, TunnelError};
use async_trait::async_trait;
use ipnet::IpNet;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Duplex packet handle of an established virtual interface
///
/// Each `recv` yields one whole packet; each `send` writes one whole
/// packet. A `recv` of zero bytes means the device was closed.
#[async_trait]
pub trait PacketDevice: Send + Sync {
    /// Interface name
    fn name(&self) -> &str;

    fn mtu(&self) -> u16;

    /// Read one packet
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one packet
    async fn send(&self, packet: &[u8]) -> io::Result<usize>;
}

/// Host OS operations needed to run a virtual interface
#[async_trait]
pub trait InterfaceBackend: Send + Sync {
    /// Whether the host offers virtual interfaces at all
    fn is_available(&self) -> bool;

    /// Whether IPv6 can be configured on the interface
    fn supports_ipv6(&self) -> bool;

    /// Ask the host for permission to create an interface
    async fn prepare(&self) -> Result<bool>;

    /// Create the interface with its IPv4 address and MTU
    async fn create(
        &self,
        settings: &InterfaceSettings,
        session_name: &str,
    ) -> Result<Arc<dyn PacketDevice>>;

    async fn add_dns(&self, device: &str, servers: &[IpAddr]) -> Result<()>;

    async fn add_route(&self, device: &str, route: IpNet) -> Result<()>;

    async fn add_ipv6_address(&self, device: &str, address: ipnet::Ipv6Net) -> Result<()>;

    async fn exclude_application(&self, application: &str) -> Result<()>;

    /// Undo everything `create` and the optional steps installed
    async fn tear_down(&self, device: &str) -> Result<()>;
}

/// Which optional bring-up steps took effect
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedSteps {
    pub dns: bool,
    pub routes: Vec<IpNet>,
    pub ipv6: bool,
    pub excluded_applications: Vec<String>,
}

/// An established interface, owned by exactly one session
pub struct InterfaceHandle {
    device: Arc<dyn PacketDevice>,
    applied: AppliedSteps,
}

impl InterfaceHandle {
    pub fn name(&self) -> &str {
        self.device.name()
    }

    pub fn mtu(&self) -> u16 {
        self.device.mtu()
    }

    pub fn applied(&self) -> &AppliedSteps {
        &self.applied
    }

    /// Device shared with the forwarding loops for the session's lifetime
    pub(crate) fn device(&self) -> Arc<dyn PacketDevice> {
        self.device.clone()
    }
}

impl std::fmt::Debug for InterfaceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceHandle")
            .field("name", &self.name())
            .field("mtu", &self.mtu())
            .field("applied", &self.applied)
            .finish()
    }
}

/// Applies [`InterfaceSettings`] through an [`InterfaceBackend`]
#[derive(Clone)]
pub struct InterfaceManager {
    backend: Arc<dyn InterfaceBackend>,
}

impl InterfaceManager {
    pub fn new(backend: Arc<dyn InterfaceBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn InterfaceBackend> {
        &self.backend
    }

    /// Bring the interface up
    ///
    /// Only device creation is fatal; every other step degrades with a
    /// warning.
    pub async fn bring_up(
        &self,
        settings: &InterfaceSettings,
        session_name: &str,
    ) -> Result<InterfaceHandle> {
        if settings.mtu < 68 {
            return Err(TunnelError::Config(format!(
                "MTU {} is too small (minimum 68)",
                settings.mtu
            )));
        }

        let device = self.backend.create(settings, session_name).await?;
        let name = device.name().to_string();
        info!(
            "Virtual interface {} up ({}, MTU {}) for session {:?}",
            name, settings.address, settings.mtu, session_name
        );

        let mut applied = AppliedSteps::default();
        let ipv6 = self.backend.supports_ipv6();

        if !settings.dns.is_empty() {
            match self.backend.add_dns(&name, &settings.dns).await {
                Ok(()) => {
                    applied.dns = true;
                    debug!("DNS servers configured: {:?}", settings.dns);
                }
                Err(e) => warn!("Could not add DNS servers: {}", e),
            }
        }

        if ipv6 {
            if let Some(address) = settings.ipv6 {
                match self.backend.add_ipv6_address(&name, address).await {
                    Ok(()) => {
                        applied.ipv6 = true;
                        debug!("IPv6 address {} configured", address);
                    }
                    Err(e) => warn!("IPv6 setup failed: {}", e),
                }
            }
        }

        for route in &settings.routes {
            if matches!(route, IpNet::V6(_)) && !applied.ipv6 {
                debug!("Skipping IPv6 route {} (no IPv6 on interface)", route);
                continue;
            }
            match self.backend.add_route(&name, *route).await {
                Ok(()) => {
                    applied.routes.push(*route);
                    debug!("Route {} configured", route);
                }
                Err(e) => warn!("Could not add route {}: {}", route, e),
            }
        }

        for application in &settings.excluded_applications {
            match self.backend.exclude_application(application).await {
                Ok(()) => applied.excluded_applications.push(application.clone()),
                Err(e) => warn!("Could not exclude {}: {}", application, e),
            }
        }

        Ok(InterfaceHandle { device, applied })
    }

    /// Remove the interface; errors are logged since nothing can retry them
    pub async fn tear_down(&self, handle: InterfaceHandle) {
        let name = handle.name().to_string();

        if let Err(e) = self.backend.tear_down(&name).await {
            warn!("Tear-down of {} incomplete: {}", name, e);
        }
        drop(handle);

        info!("Virtual interface {} torn down", name);
    }
}
