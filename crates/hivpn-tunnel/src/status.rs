//! Session Status
//!
//! Connection state, forwarding counters and upstream health for one
//! session. The forwarding loops update counters concurrently with
//! status queries, so everything here is atomic or behind a `watch`
//! channel; nothing holds a lock across an await.

use crate::error::{Result, TunnelError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Session connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    /// Session created, nothing started
    Idle,
    /// Interface bring-up and upstream connect in progress
    Establishing,
    /// Upstream connected, forwarding not yet running
    TunnelConnected,
    /// Forwarding in both directions
    Active,
    /// Terminated by an error
    Failed,
    /// Terminated on request
    Stopped,
}

impl ConnectionState {
    /// `Failed` and `Stopped` never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Stopped)
    }

    /// Whether a transition to `next` is allowed
    ///
    /// The happy path only moves forward one step at a time; `Failed` and
    /// `Stopped` are reachable from any non-terminal state.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, next) {
            (Idle, Establishing) | (Establishing, TunnelConnected) | (TunnelConnected, Active) => {
                true
            }
            (current, Failed | Stopped) => !current.is_terminal(),
            _ => false,
        }
    }

    /// Human-readable status line
    pub fn description(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "VPN idle",
            ConnectionState::Establishing => "VPN connecting...",
            ConnectionState::TunnelConnected => "VPN tunnel connected",
            ConnectionState::Active => "VPN connected",
            ConnectionState::Failed => "VPN connection failed",
            ConnectionState::Stopped => "VPN disconnected",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Per-session counters
///
/// Monotonically non-decreasing for the lifetime of the session.
#[derive(Debug, Default)]
pub struct Counters {
    packets_total: AtomicU64,
    dns_responses: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    tunnel_active: AtomicBool,
}

impl Counters {
    /// Count one packet read from the interface, returning the new total
    pub fn record_packet(&self) -> u64 {
        self.packets_total.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_dns_response(&self) {
        self.dns_responses.fetch_add(1, Ordering::Relaxed);
    }

    /// Bytes written to the upstream connection
    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Bytes read from the upstream connection
    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn packets_total(&self) -> u64 {
        self.packets_total.load(Ordering::Relaxed)
    }

    pub fn dns_responses(&self) -> u64 {
        self.dns_responses.load(Ordering::Relaxed)
    }

    pub fn tunnel_active(&self) -> bool {
        self.tunnel_active.load(Ordering::Acquire)
    }

    fn set_tunnel_active(&self, active: bool) {
        self.tunnel_active.store(active, Ordering::Release);
    }
}

/// Snapshot returned by `getStats`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStats {
    pub packets_total: u64,
    pub dns_responses: u64,
    pub tunnel_active: bool,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub state: ConnectionState,
}

impl TunnelStats {
    /// Stats for a client with no session
    pub fn idle() -> Self {
        Self {
            packets_total: 0,
            dns_responses: 0,
            tunnel_active: false,
            bytes_sent: 0,
            bytes_received: 0,
            state: ConnectionState::Idle,
        }
    }

    /// Format as human-readable string
    pub fn format(&self) -> String {
        format!(
            "{} packets, {} DNS responses, TX: {:.2}MB, RX: {:.2}MB [{}]",
            self.packets_total,
            self.dns_responses,
            self.bytes_sent as f64 / (1024.0 * 1024.0),
            self.bytes_received as f64 / (1024.0 * 1024.0),
            if self.tunnel_active { "TUNNEL ACTIVE" } else { "LOCAL MODE" }
        )
    }
}

/// State, counters and upstream health of one session
pub struct StatusReporter {
    state: watch::Sender<ConnectionState>,
    counters: Counters,
    upstream_healthy: AtomicBool,
}

impl StatusReporter {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);

        Self {
            state,
            counters: Counters::default(),
            upstream_healthy: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Move to `next`, rejecting transitions the state machine forbids
    pub fn transition(&self, next: ConnectionState) -> Result<ConnectionState> {
        let mut previous = None;

        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                previous = Some(*current);
                *current = next;
                true
            } else {
                false
            }
        });

        match previous {
            Some(from) => {
                info!("Session {} -> {}: {}", from, next, next.description());
                Ok(from)
            }
            None => Err(TunnelError::State(format!(
                "cannot move from {} to {}",
                self.state(),
                next
            ))),
        }
    }

    /// Record a successful upstream connect
    ///
    /// Ignored once the session is `Failed` or `Stopped`; the check runs
    /// under the state lock so a concurrent stop cannot be overwritten.
    pub fn mark_tunnel_up(&self) -> bool {
        let mut marked = false;

        self.state.send_if_modified(|current| {
            if !current.is_terminal() {
                self.upstream_healthy.store(true, Ordering::Release);
                self.counters.set_tunnel_active(true);
                marked = true;
            }
            false
        });

        if marked {
            debug!("Upstream marked healthy");
        }
        marked
    }

    /// Stop forwarding to upstream; later packets fall back to loopback
    ///
    /// Does not change the connection state.
    pub fn mark_upstream_broken(&self) {
        if self.upstream_healthy.swap(false, Ordering::AcqRel) {
            warn!("Upstream marked broken, falling back to loopback");
        }
    }

    /// Clear every "up" indicator when the session ends
    pub fn mark_tunnel_down(&self) {
        self.upstream_healthy.store(false, Ordering::Release);
        self.counters.set_tunnel_active(false);
    }

    pub fn upstream_healthy(&self) -> bool {
        self.upstream_healthy.load(Ordering::Acquire)
    }

    /// Actual upstream health, not merely "a session exists"
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Active
            && self.counters.tunnel_active()
            && self.upstream_healthy()
    }

    pub fn stats(&self) -> TunnelStats {
        TunnelStats {
            packets_total: self.counters.packets_total(),
            dns_responses: self.counters.dns_responses(),
            tunnel_active: self.counters.tunnel_active(),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            state: self.state(),
        }
    }
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new()
    }
}
