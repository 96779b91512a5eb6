//! In-memory doubles for the host-facing traits

use crate::config::InterfaceSettings;
use crate::error::{Result, TunnelError};
use crate::interface::{InterfaceBackend, PacketDevice};
use crate::upstream::SocketProtector;
use async_trait::async_trait;
use ipnet::{IpNet, Ipv6Net};
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpSocket;
use tokio::sync::mpsc;

/// Packet device fed by the test
pub struct MockDevice {
    name: String,
    mtu: u16,
    inbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    reader: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    written: Mutex<Vec<Vec<u8>>>,
}

impl MockDevice {
    pub fn new(name: &str, mtu: u16) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        Self {
            name: name.to_string(),
            mtu,
            inbound: Mutex::new(Some(tx)),
            reader: tokio::sync::Mutex::new(rx),
            written: Mutex::new(Vec::new()),
        }
    }

    /// Queue a packet for the next `recv`
    pub fn inject(&self, packet: Vec<u8>) {
        if let Some(tx) = self.inbound.lock().unwrap().as_ref() {
            let _ = tx.send(packet);
        }
    }

    /// Make `recv` report end of stream once queued packets drain
    pub fn close(&self) {
        self.inbound.lock().unwrap().take();
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap().clone()
    }

    pub async fn wait_for_written(&self, count: usize) -> Vec<Vec<u8>> {
        wait_until(|| self.written.lock().unwrap().len() >= count).await;
        self.written()
    }
}

#[async_trait]
impl PacketDevice for MockDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut reader = self.reader.lock().await;
        match reader.recv().await {
            Some(packet) => {
                let len = packet.len().min(buf.len());
                buf[..len].copy_from_slice(&packet[..len]);
                Ok(len)
            }
            None => Ok(0),
        }
    }

    async fn send(&self, packet: &[u8]) -> io::Result<usize> {
        self.written.lock().unwrap().push(packet.to_vec());
        Ok(packet.len())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    Create(String),
    Dns(Vec<IpAddr>),
    Route(IpNet),
    Ipv6Address(Ipv6Net),
    Exclude(String),
    TearDown(String),
}

/// Backend that records calls and hands out [`MockDevice`]s
pub struct MockBackend {
    calls: Mutex<Vec<BackendCall>>,
    devices: Mutex<Vec<Arc<MockDevice>>>,
    create_error: Mutex<Option<TunnelError>>,
    fail_optional: AtomicBool,
    ipv6: AtomicBool,
    available: AtomicBool,
    prepare_granted: AtomicBool,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            devices: Mutex::new(Vec::new()),
            create_error: Mutex::new(None),
            fail_optional: AtomicBool::new(false),
            ipv6: AtomicBool::new(true),
            available: AtomicBool::new(true),
            prepare_granted: AtomicBool::new(true),
        }
    }

    pub fn fail_optional_steps(&self) {
        self.fail_optional.store(true, Ordering::SeqCst);
    }

    pub fn set_ipv6(&self, supported: bool) {
        self.ipv6.store(supported, Ordering::SeqCst);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_prepare_granted(&self, granted: bool) {
        self.prepare_granted.store(granted, Ordering::SeqCst);
    }

    /// Fail the next `create`
    pub fn fail_create(&self, error: TunnelError) {
        *self.create_error.lock().unwrap() = Some(error);
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&BackendCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(*c)).count()
    }

    pub fn last_device(&self) -> Option<Arc<MockDevice>> {
        self.devices.lock().unwrap().last().cloned()
    }

    fn record(&self, call: BackendCall) -> Result<()> {
        let optional = !matches!(call, BackendCall::Create(_) | BackendCall::TearDown(_));
        self.calls.lock().unwrap().push(call);

        if optional && self.fail_optional.load(Ordering::SeqCst) {
            return Err(TunnelError::Interface("injected failure".into()));
        }
        Ok(())
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InterfaceBackend for MockBackend {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn supports_ipv6(&self) -> bool {
        self.ipv6.load(Ordering::SeqCst)
    }

    async fn prepare(&self) -> Result<bool> {
        Ok(self.prepare_granted.load(Ordering::SeqCst))
    }

    async fn create(
        &self,
        settings: &InterfaceSettings,
        _session_name: &str,
    ) -> Result<Arc<dyn PacketDevice>> {
        self.record(BackendCall::Create(settings.name.clone()))?;
        if let Some(error) = self.create_error.lock().unwrap().take() {
            return Err(error);
        }

        let device = Arc::new(MockDevice::new(&settings.name, settings.mtu));
        self.devices.lock().unwrap().push(device.clone());
        Ok(device)
    }

    async fn add_dns(&self, _device: &str, servers: &[IpAddr]) -> Result<()> {
        self.record(BackendCall::Dns(servers.to_vec()))
    }

    async fn add_route(&self, _device: &str, route: IpNet) -> Result<()> {
        self.record(BackendCall::Route(route))
    }

    async fn add_ipv6_address(&self, _device: &str, address: Ipv6Net) -> Result<()> {
        self.record(BackendCall::Ipv6Address(address))
    }

    async fn exclude_application(&self, application: &str) -> Result<()> {
        self.record(BackendCall::Exclude(application.to_string()))
    }

    async fn tear_down(&self, device: &str) -> Result<()> {
        self.record(BackendCall::TearDown(device.to_string()))?;
        if let Some(device) = self.last_device() {
            device.close();
        }
        Ok(())
    }
}

pub struct AllowAll;

impl SocketProtector for AllowAll {
    fn protect(&self, _socket: &TcpSocket) -> io::Result<()> {
        Ok(())
    }
}

pub struct DenyAll;

impl SocketProtector for DenyAll {
    fn protect(&self, _socket: &TcpSocket) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::PermissionDenied, "protect refused"))
    }
}

/// Poll `condition` until it holds; panics after five seconds
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);

    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// IPv4/UDP packet from 10.8.0.1:40000 to 8.8.8.8:`dest_port`
pub fn udp_packet(dest_port: u16, payload: &[u8]) -> Vec<u8> {
    let udp_len = (8 + payload.len()) as u16;
    let total_len = 20 + udp_len;

    let mut packet = vec![0u8; 20];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&total_len.to_be_bytes());
    packet[8] = 64;
    packet[9] = 17;
    packet[12..16].copy_from_slice(&[10, 8, 0, 1]);
    packet[16..20].copy_from_slice(&[8, 8, 8, 8]);

    packet.extend_from_slice(&40000u16.to_be_bytes());
    packet.extend_from_slice(&dest_port.to_be_bytes());
    packet.extend_from_slice(&udp_len.to_be_bytes());
    packet.extend_from_slice(&[0, 0]);
    packet.extend_from_slice(payload);
    packet
}

/// DNS query for `example.com` A
pub fn dns_query(transaction_id: u16) -> Vec<u8> {
    let mut dns = Vec::new();
    dns.extend_from_slice(&transaction_id.to_be_bytes());
    dns.extend_from_slice(&[0x01, 0x00]);
    dns.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    for label in ["example", "com"] {
        dns.push(label.len() as u8);
        dns.extend_from_slice(label.as_bytes());
    }
    dns.push(0);
    dns.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);

    udp_packet(crate::dns::DNS_PORT, &dns)
}
