//! Tunnel Client
//!
//! Host-facing entry point. Holds the host settings and platform hooks,
//! creates a fresh [`TunnelSession`] per `connect` and answers status
//! queries against the current one.

use crate::config::{ClientSettings, ConnectRequest, TunnelConfig};
use crate::error::{Result, TunnelError};
use crate::interface::{InterfaceBackend, InterfaceManager};
use crate::session::TunnelSession;
use crate::status::{ConnectionState, TunnelStats};
use crate::upstream::{SocketProtector, UpstreamConnector};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

pub struct TunnelClient {
    settings: ClientSettings,
    interfaces: InterfaceManager,
    connector: UpstreamConnector,
    initialized: AtomicBool,
    session: Mutex<Option<Arc<TunnelSession>>>,
}

impl TunnelClient {
    pub fn new(
        settings: ClientSettings,
        backend: Arc<dyn InterfaceBackend>,
        protector: Arc<dyn SocketProtector>,
    ) -> Self {
        Self {
            settings,
            interfaces: InterfaceManager::new(backend),
            connector: UpstreamConnector::new(protector),
            initialized: AtomicBool::new(false),
            session: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Mark the client ready; returns whether virtual interfaces exist here
    pub fn initialize(&self) -> bool {
        let available = self.interfaces.backend().is_available();
        self.initialized.store(true, Ordering::Release);
        info!("Tunnel client initialized (interfaces available: {})", available);
        available
    }

    /// Ask the host for permission to create an interface
    pub async fn prepare(&self) -> bool {
        if !self.initialized.load(Ordering::Acquire) {
            warn!("prepare called before initialize");
            return false;
        }

        match self.interfaces.backend().prepare().await {
            Ok(granted) => granted,
            Err(e) => {
                warn!("Interface permission check failed: {}", e);
                false
            }
        }
    }

    /// Start a new session in the background
    ///
    /// `Ok(true)` means the request was accepted; whether the tunnel came
    /// up is observed through [`state`](Self::state) and
    /// [`is_connected`](Self::is_connected). Invalid requests and a host
    /// that refuses interface permission fail here, before any session
    /// exists.
    pub async fn connect(&self, request: ConnectRequest) -> Result<bool> {
        let config = TunnelConfig::try_from(request)?;

        if !self.interfaces.backend().prepare().await? {
            warn!("Connect refused: no permission to create a virtual interface");
            return Err(TunnelError::PermissionDenied(
                "host has not granted virtual interface permission".into(),
            ));
        }

        let session = {
            let mut current = self.lock_session();
            if let Some(existing) = current.as_ref() {
                let state = existing.state();
                if !state.is_terminal() {
                    return Err(TunnelError::State(format!(
                        "session {:?} is {}",
                        existing.config().connection_name,
                        state
                    )));
                }
            }

            let session = Arc::new(TunnelSession::new(
                config,
                self.settings.clone(),
                self.interfaces.clone(),
                self.connector.clone(),
            ));
            *current = Some(session.clone());
            session
        };

        info!(
            "Connect requested: {} ({})",
            session.config().endpoint(),
            session.config().connection_name
        );

        tokio::spawn(async move {
            if let Err(e) = session.start().await {
                debug!("Session start ended with error: {}", e);
            }
        });

        Ok(true)
    }

    /// Stop the current session; returns whether one was running
    pub async fn disconnect(&self) -> bool {
        let Some(session) = self.current() else {
            return false;
        };
        if session.state().is_terminal() {
            return false;
        }

        session.stop().await;
        true
    }

    pub fn is_connected(&self) -> bool {
        self.current().is_some_and(|s| s.is_connected())
    }

    pub fn get_stats(&self) -> TunnelStats {
        self.current()
            .map(|s| s.stats())
            .unwrap_or_else(TunnelStats::idle)
    }

    pub fn state(&self) -> ConnectionState {
        self.current()
            .map(|s| s.state())
            .unwrap_or(ConnectionState::Idle)
    }

    /// Current (possibly finished) session
    pub fn current(&self) -> Option<Arc<TunnelSession>> {
        self.lock_session().clone()
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Arc<TunnelSession>>> {
        // the slot holds a plain Option; a poisoned lock leaves it usable
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }
}
