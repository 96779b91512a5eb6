//! Linux interface backend
//!
//! Creates a TUN device with `tun-rs` and configures it with `ip` and
//! `resolvectl`. Captured routes go into a dedicated policy table that
//! only unmarked traffic consults:
//!
//! ```text
//! ip route add 0.0.0.0/0 dev hivpn0 table 4856
//! ip rule add not fwmark 0x4856 table 4856
//! ip rule add table main suppress_prefixlength 0
//! ```
//!
//! The upstream socket carries the mark (see `FwmarkProtector`) and keeps
//! using the main table, so it never loops back into the tunnel.

use crate::config::InterfaceSettings;
use crate::error::{Result, TunnelError};
use crate::interface::{InterfaceBackend, PacketDevice};
use async_trait::async_trait;
use ipnet::{IpNet, Ipv6Net};
use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tracing::{debug, info, warn};

const TUN_PATH: &str = "/dev/net/tun";
const IF_INET6_PATH: &str = "/proc/net/if_inet6";

/// Address family flag for `ip`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Family {
    V4,
    V6,
}

impl Family {
    fn of(route: &IpNet) -> Self {
        match route {
            IpNet::V4(_) => Family::V4,
            IpNet::V6(_) => Family::V6,
        }
    }

    fn flag(self) -> &'static str {
        match self {
            Family::V4 => "-4",
            Family::V6 => "-6",
        }
    }
}

/// Host changes to undo for one device
#[derive(Debug, Default)]
struct Installed {
    rules: Vec<Family>,
    dns: bool,
}

pub struct LinuxBackend {
    fwmark: u32,
    route_table: u32,
    installed: Mutex<HashMap<String, Installed>>,
}

impl LinuxBackend {
    pub fn new(fwmark: u32, route_table: u32) -> Self {
        Self {
            fwmark,
            route_table,
            installed: Mutex::new(HashMap::new()),
        }
    }

    fn with_installed<R>(&self, device: &str, f: impl FnOnce(&mut Installed) -> R) -> R {
        let mut installed = self.installed.lock().unwrap_or_else(|e| e.into_inner());
        f(installed.entry(device.to_string()).or_default())
    }

    /// Policy rules sending unmarked traffic to the tunnel table
    async fn install_rules(&self, family: Family) -> Result<()> {
        let mark = format!("{:#x}", self.fwmark);
        let table = self.route_table.to_string();

        run("ip", &[family.flag(), "rule", "add", "not", "fwmark", &mark, "table", &table]).await?;
        run(
            "ip",
            &[family.flag(), "rule", "add", "table", "main", "suppress_prefixlength", "0"],
        )
        .await
    }

    async fn remove_rules(&self, family: Family) -> Result<()> {
        let mark = format!("{:#x}", self.fwmark);
        let table = self.route_table.to_string();

        let first =
            run("ip", &[family.flag(), "rule", "del", "not", "fwmark", &mark, "table", &table]).await;
        let second = run(
            "ip",
            &[family.flag(), "rule", "del", "table", "main", "suppress_prefixlength", "0"],
        )
        .await;
        first.and(second)
    }
}

#[async_trait]
impl InterfaceBackend for LinuxBackend {
    fn is_available(&self) -> bool {
        Path::new(TUN_PATH).exists()
    }

    fn supports_ipv6(&self) -> bool {
        Path::new(IF_INET6_PATH).exists()
    }

    async fn prepare(&self) -> Result<bool> {
        match std::fs::OpenOptions::new().read(true).write(true).open(TUN_PATH) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                info!("No permission to open {}", TUN_PATH);
                Ok(false)
            }
            Err(e) => Err(TunnelError::Interface(format!("cannot open {}: {}", TUN_PATH, e))),
        }
    }

    async fn create(
        &self,
        settings: &InterfaceSettings,
        session_name: &str,
    ) -> Result<Arc<dyn PacketDevice>> {
        let device = tun_rs::DeviceBuilder::new()
            .name(&settings.name)
            .ipv4(
                settings.address.addr(),
                settings.address.prefix_len(),
                None::<std::net::Ipv4Addr>,
            )
            .mtu(settings.mtu)
            .build_async()
            .map_err(|e| match e.kind() {
                io::ErrorKind::PermissionDenied => TunnelError::PermissionDenied(format!(
                    "creating {} needs CAP_NET_ADMIN: {}",
                    settings.name, e
                )),
                _ => TunnelError::Interface(format!("cannot create {}: {}", settings.name, e)),
            })?;

        let name = device
            .name()
            .map_err(|e| TunnelError::Interface(e.to_string()))?;
        debug!("TUN device {} created for session {:?}", name, session_name);

        Ok(Arc::new(TunDevice {
            inner: device,
            name,
            mtu: settings.mtu,
        }))
    }

    async fn add_dns(&self, device: &str, servers: &[IpAddr]) -> Result<()> {
        let servers: Vec<String> = servers.iter().map(ToString::to_string).collect();
        let mut args = vec!["dns", device];
        args.extend(servers.iter().map(String::as_str));

        run("resolvectl", &args).await?;
        self.with_installed(device, |installed| installed.dns = true);
        Ok(())
    }

    async fn add_route(&self, device: &str, route: IpNet) -> Result<()> {
        let family = Family::of(&route);
        let table = self.route_table.to_string();
        let destination = route.to_string();

        run(
            "ip",
            &[family.flag(), "route", "add", &destination, "dev", device, "table", &table],
        )
        .await?;

        let needs_rules = self.with_installed(device, |installed| {
            if installed.rules.contains(&family) {
                false
            } else {
                installed.rules.push(family);
                true
            }
        });
        if needs_rules {
            if let Err(e) = self.install_rules(family).await {
                self.with_installed(device, |installed| installed.rules.retain(|f| *f != family));
                return Err(e);
            }
        }
        Ok(())
    }

    async fn add_ipv6_address(&self, device: &str, address: Ipv6Net) -> Result<()> {
        run("ip", &["-6", "addr", "add", &address.to_string(), "dev", device]).await
    }

    async fn exclude_application(&self, application: &str) -> Result<()> {
        Err(TunnelError::NotSupported(format!(
            "per-application exclusion of {}",
            application
        )))
    }

    async fn tear_down(&self, device: &str) -> Result<()> {
        let installed = {
            let mut all = self.installed.lock().unwrap_or_else(|e| e.into_inner());
            all.remove(device).unwrap_or_default()
        };

        let mut result = Ok(());
        for family in installed.rules {
            if let Err(e) = self.remove_rules(family).await {
                warn!("Could not remove policy rules: {}", e);
                result = Err(e);
            }
            let table = self.route_table.to_string();
            if let Err(e) = run("ip", &[family.flag(), "route", "flush", "table", &table]).await {
                debug!("Route flush failed: {}", e);
            }
        }
        if installed.dns {
            if let Err(e) = run("resolvectl", &["revert", device]).await {
                debug!("DNS revert failed: {}", e);
            }
        }

        // the device itself disappears when its descriptor closes
        result
    }
}

/// `tun-rs` device as a [`PacketDevice`]
struct TunDevice {
    inner: tun_rs::AsyncDevice,
    name: String,
    mtu: u16,
}

#[async_trait]
impl PacketDevice for TunDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.recv(buf).await
    }

    async fn send(&self, packet: &[u8]) -> io::Result<usize> {
        self.inner.send(packet).await
    }
}

async fn run(program: &str, args: &[&str]) -> Result<()> {
    debug!("Running {} {}", program, args.join(" "));

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| TunnelError::Interface(format!("failed to run {}: {}", program, e)))?;

    if !output.status.success() {
        return Err(TunnelError::Interface(format!(
            "{} {} failed: {}",
            program,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}
