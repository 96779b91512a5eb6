//! HiVPN Tunnel Client
//!
//! Brings up a virtual network interface, opens a protected byte-stream
//! connection to the remote tunnel server and forwards packets between
//! the two, answering DNS queries locally with stub responses.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        TunnelClient                           │
//! │                             │                                 │
//! │                       TunnelSession                           │
//! │          ┌──────────────────┼───────────────────┐             │
//! │          ▼                  ▼                   ▼             │
//! │  InterfaceManager    UpstreamConnector    StatusReporter      │
//! │   (tun device)      (fwmark-protected)    (state/counters)    │
//! │          │                  │                                 │
//! │          └──────► PacketRouter ◄──────┘                       │
//! │                  │    │     │                                 │
//! │            DNS stub  upstream  loopback                       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! `Idle → Establishing → TunnelConnected → Active`, with `Failed` and
//! `Stopped` reachable from any non-terminal state. A failed or stopped
//! session is never restarted; the client builds a fresh one.

mod bridge;
mod client;
mod config;
mod dns;
mod error;
mod interface;
mod router;
mod session;
mod status;
mod upstream;

#[cfg(target_os = "linux")]
mod linux;

#[cfg(test)]
mod mock;

pub use bridge::{execute, handle_line, Command, ErrorBody, Response};
pub use client::TunnelClient;
pub use config::{ClientSettings, ConnectRequest, InterfaceSettings, TunnelConfig};
pub use dns::{is_dns_query, synthesize_response};
pub use error::{Result, TunnelError};
pub use interface::{
    AppliedSteps, InterfaceBackend, InterfaceHandle, InterfaceManager, PacketDevice,
};
pub use router::{PacketRouter, RouterTask};
pub use session::TunnelSession;
pub use status::{ConnectionState, Counters, StatusReporter, TunnelStats};
pub use upstream::{SocketProtector, UpstreamConnector};

#[cfg(unix)]
pub use upstream::CallbackProtector;

#[cfg(target_os = "linux")]
pub use linux::LinuxBackend;

#[cfg(target_os = "linux")]
pub use upstream::FwmarkProtector;
