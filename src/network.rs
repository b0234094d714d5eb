//! UDP transport and registry of device sessions.
//! One socket serves every device; inbound datagrams are routed by sender address.

use crate::device::{Device, DeviceBuilder};
use crate::error::{MiioError, Result};
use crate::protocol::{DEFAULT_PORT, Token};
use crate::tokens::TokenStore;
use futures_util::future::{BoxFuture, FutureExt};
use log::{debug, info, warn};
use parking_lot::RwLock;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// Largest frame the 16-bit length field can describe.
const RECV_BUFFER: usize = u16::MAX as usize;

/// Datagram sender used by device sessions.
pub trait Transport: Send + Sync {
    /// Send one datagram to `addr`. Fails only on local send errors.
    fn send<'a>(&'a self, data: &'a [u8], addr: SocketAddr) -> BoxFuture<'a, Result<()>>;
}

/// [`Transport`] over a shared tokio UDP socket.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl Transport for UdpTransport {
    fn send<'a>(&'a self, data: &'a [u8], addr: SocketAddr) -> BoxFuture<'a, Result<()>> {
        async move {
            self.socket.send_to(data, addr).await?;
            Ok(())
        }
        .boxed()
    }
}

struct RegistryEntry {
    device: Device,
    ref_count: usize,
}

type Registry = Arc<RwLock<HashMap<SocketAddr, RegistryEntry>>>;

/// Owns the UDP socket and the sessions of every device talked to through it.
#[derive(Clone)]
pub struct Network {
    inner: Arc<NetworkInner>,
}

struct NetworkInner {
    transport: Arc<UdpTransport>,
    local_addr: SocketAddr,
    devices: Registry,
    tokens: Option<TokenStore>,
    cancel_token: CancellationToken,
}

impl Network {
    /// Bind to an ephemeral port on all interfaces.
    pub fn new(tokens: Option<TokenStore>) -> Result<Self> {
        Self::bind(SocketAddr::from(([0, 0, 0, 0], 0)), tokens)
    }

    /// Bind the shared socket and start routing inbound datagrams.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(addr: SocketAddr, tokens: Option<TokenStore>) -> Result<Self> {
        let socket = Arc::new(create_socket(addr)?);
        let local_addr = socket.local_addr()?;
        let devices: Registry = Arc::new(RwLock::new(HashMap::new()));
        let cancel_token = CancellationToken::new();

        tokio::spawn(receive_loop(
            socket.clone(),
            devices.clone(),
            cancel_token.clone(),
        ));
        info!("miIO network listening on {}", local_addr);

        Ok(Self {
            inner: Arc::new(NetworkInner {
                transport: Arc::new(UdpTransport { socket }),
                local_addr,
                devices,
                tokens,
                cancel_token,
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Connect to the device at `address` (`ip` or `ip:port`): handshake,
    /// then identify it. An existing session for the address is reused.
    pub async fn connect(&self, address: &str, token: Option<Token>) -> Result<Device> {
        let addr = parse_address(address)?;
        let device = self.acquire(addr);
        if let Some(t) = token {
            device.set_token(t);
        }

        let connected = async {
            device.handshake().await?;
            device.enrich().await
        }
        .await;

        match connected {
            Ok(()) => Ok(device),
            Err(e) => {
                warn!("Could not connect to {}: {}", addr, e);
                self.release(&device);
                Err(e)
            }
        }
    }

    /// Register a session built from `builder` without talking to the device.
    ///
    /// If the address already has a session, that session is returned instead.
    pub fn add(&self, builder: DeviceBuilder) -> Device {
        let builder = match &self.inner.tokens {
            Some(tokens) => builder.token_store(tokens.clone()),
            None => builder,
        };
        let device = builder.build(self.inner.transport.clone());
        let mut guard = self.inner.devices.write();
        let entry = guard
            .entry(device.address())
            .or_insert_with(|| RegistryEntry {
                device: device.clone(),
                ref_count: 0,
            });
        entry.ref_count += 1;
        entry.device.clone()
    }

    fn acquire(&self, addr: SocketAddr) -> Device {
        if let Some(entry) = self.inner.devices.write().get_mut(&addr) {
            entry.ref_count += 1;
            debug!("Device {} reused (ref_count: {})", addr, entry.ref_count);
            return entry.device.clone();
        }
        self.add(DeviceBuilder::new(addr.ip()).port(addr.port()))
    }

    /// Session registered for `addr`, if any.
    pub fn device(&self, addr: SocketAddr) -> Option<Device> {
        self.inner.devices.read().get(&addr).map(|e| e.device.clone())
    }

    /// Drop one reference to `device`; the session is forgotten with the last one.
    pub fn release(&self, device: &Device) {
        let addr = device.address();
        let mut guard = self.inner.devices.write();
        if let Some(entry) = guard.get_mut(&addr) {
            entry.ref_count = entry.ref_count.saturating_sub(1);
            if entry.ref_count == 0 {
                guard.remove(&addr);
                info!("Device {} released", addr);
            }
        }
    }

    /// Stop receiving and forget all sessions.
    pub fn shutdown(&self) {
        self.inner.cancel_token.cancel();
        self.inner.devices.write().clear();
    }
}

impl Drop for NetworkInner {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

fn parse_address(address: &str) -> Result<SocketAddr> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }
    address
        .parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, DEFAULT_PORT))
        .map_err(|_| MiioError::Config(format!("invalid device address '{}'", address)))
}

/// Create and configure a non-blocking UDP socket.
fn create_socket(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if let Err(e) = socket.set_reuse_address(true) {
        warn!("Failed to set reuse_address on {}: {}", addr, e);
    }
    socket.bind(&SockAddr::from(addr))?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

async fn receive_loop(socket: Arc<UdpSocket>, devices: Registry, cancel_token: CancellationToken) {
    let mut buf = vec![0u8; RECV_BUFFER];
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            res = socket.recv_from(&mut buf) => {
                match res {
                    Ok((len, addr)) => {
                        debug!("<- {} {} bytes: {}", addr, len, hex::encode(&buf[..len]));
                        let device = devices.read().get(&addr).map(|e| e.device.clone());
                        match device {
                            Some(device) => device.handle_message(&buf[..len]),
                            None => debug!("Dropping datagram from unknown sender {}", addr),
                        }
                    }
                    Err(e) => {
                        // ICMP errors surface here on some platforms; keep listening
                        debug!("UDP receive error: {}", e);
                    }
                }
            }
        }
    }
    debug!("miIO receive loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_default_to_miio_port() {
        assert_eq!(
            parse_address("192.168.1.20").unwrap(),
            "192.168.1.20:54321".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_address("127.0.0.1:9000").unwrap(),
            "127.0.0.1:9000".parse::<SocketAddr>().unwrap()
        );
        assert!(matches!(parse_address("lamp"), Err(MiioError::Config(_))));
    }

    #[tokio::test]
    async fn sessions_are_reference_counted() {
        let network = Network::bind("127.0.0.1:0".parse().unwrap(), None).unwrap();
        let addr: SocketAddr = "127.0.0.1:54321".parse().unwrap();

        let a = network.add(DeviceBuilder::new(addr.ip()));
        let b = network.add(DeviceBuilder::new(addr.ip()));
        assert!(network.device(addr).is_some());

        network.release(&a);
        assert!(network.device(addr).is_some());
        network.release(&b);
        assert!(network.device(addr).is_none());
        network.shutdown();
    }
}
