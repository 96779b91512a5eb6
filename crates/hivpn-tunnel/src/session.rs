//! Tunnel Session
//!
//! One attempt at running the tunnel, from interface bring-up to
//! tear-down. A session owns its interface, its upstream connection and
//! its forwarding loops; once it reaches `Failed` or `Stopped` it is
//! finished and a new session must be created.

use crate::config::{ClientSettings, TunnelConfig};
use crate::error::{Result, TunnelError};
use crate::interface::{InterfaceHandle, InterfaceManager};
use crate::router::{PacketRouter, RouterTask};
use crate::status::{ConnectionState, StatusReporter, TunnelStats};
use crate::upstream::UpstreamConnector;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct TunnelSession {
    config: TunnelConfig,
    settings: ClientSettings,
    interfaces: InterfaceManager,
    connector: UpstreamConnector,
    reporter: Arc<StatusReporter>,
    cancel: CancellationToken,
    interface: Mutex<Option<InterfaceHandle>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl TunnelSession {
    pub fn new(
        config: TunnelConfig,
        settings: ClientSettings,
        interfaces: InterfaceManager,
        connector: UpstreamConnector,
    ) -> Self {
        Self {
            config,
            settings,
            interfaces,
            connector,
            reporter: Arc::new(StatusReporter::new()),
            cancel: CancellationToken::new(),
            interface: Mutex::new(None),
            monitor: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.reporter.state()
    }

    pub fn stats(&self) -> TunnelStats {
        self.reporter.stats()
    }

    pub fn is_connected(&self) -> bool {
        self.reporter.is_connected()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.reporter.subscribe()
    }

    /// Bring the tunnel up and start forwarding
    ///
    /// Returns once the session is `Active` or has failed. Every failure
    /// leaves the session `Failed` with nothing left installed on the
    /// host. A concurrent [`stop`](Self::stop) makes this return a
    /// `State` error after cleaning up whatever was already set up.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if let Err(e) = self.config.validate() {
            self.fail(&e);
            return Err(e);
        }

        self.reporter.transition(ConnectionState::Establishing)?;
        info!(
            "Starting session {:?} to {}",
            self.config.connection_name,
            self.config.endpoint()
        );

        let handle = match self
            .interfaces
            .bring_up(&self.settings.interface, &self.config.connection_name)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };

        if self.cancel.is_cancelled() {
            self.interfaces.tear_down(handle).await;
            return Err(TunnelError::State("session stopped during bring-up".into()));
        }

        let connect = self.connector.connect(
            &self.config.server_address,
            self.config.server_port,
            self.settings.connect_timeout(),
        );
        let connected = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.interfaces.tear_down(handle).await;
                return Err(TunnelError::State("session stopped while connecting".into()));
            }
            connected = connect => connected,
        };

        let stream = match connected {
            Ok(stream) => stream,
            Err(e) => {
                self.interfaces.tear_down(handle).await;
                self.fail(&e);
                return Err(e);
            }
        };

        if let Err(e) = self.reporter.transition(ConnectionState::TunnelConnected) {
            drop(stream);
            self.interfaces.tear_down(handle).await;
            return Err(e);
        }
        if !self.reporter.mark_tunnel_up() {
            drop(stream);
            self.interfaces.tear_down(handle).await;
            return Err(TunnelError::State("session stopped while connecting".into()));
        }

        let router = PacketRouter::new(handle.device(), self.reporter.clone(), self.cancel.clone())
            .with_buffer_size(self.settings.buffer_size)
            .with_stats_interval(self.settings.stats_log_interval)
            .spawn(stream);
        *self.interface.lock().await = Some(handle);

        if let Err(e) = self.reporter.transition(ConnectionState::Active) {
            router.stop();
            let _ = router.join().await;
            self.reporter.mark_tunnel_down();
            self.release_interface().await;
            return Err(e);
        }

        let session = Arc::clone(self);
        let monitor = tokio::spawn(async move { session.supervise(router).await });
        *self.monitor.lock().await = Some(monitor);

        Ok(())
    }

    /// Stop forwarding and remove the interface
    ///
    /// No-op on a session that already finished.
    pub async fn stop(&self) {
        let state = self.reporter.state();
        if state.is_terminal() {
            debug!("Stop on {} session ignored", state);
            return;
        }
        if self.reporter.transition(ConnectionState::Stopped).is_err() {
            return;
        }

        self.cancel.cancel();
        let monitor = self.monitor.lock().await.take();
        if let Some(monitor) = monitor {
            let _ = monitor.await;
        }

        self.reporter.mark_tunnel_down();
        self.release_interface().await;
        info!("Session {:?} stopped", self.config.connection_name);
    }

    /// Wait on the forwarding loops; a failure ends the session
    async fn supervise(&self, router: RouterTask) {
        if let Err(e) = router.join().await {
            self.fail(&e);
            self.cancel.cancel();
            self.release_interface().await;
        }
    }

    fn fail(&self, e: &TunnelError) {
        if self.reporter.transition(ConnectionState::Failed).is_ok() {
            error!("Session {:?} failed: {}", self.config.connection_name, e);
        }
        self.reporter.mark_tunnel_down();
    }

    async fn release_interface(&self) {
        let handle = self.interface.lock().await.take();
        if let Some(handle) = handle {
            self.interfaces.tear_down(handle).await;
        }
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
