//! The adapter's single owned state bundle (§5 Design Notes). Every piece
//! of mutable CIP/encapsulation state lives behind one `AdapterContext`,
//! held exclusively by the task running the network handler's event loop
//! and threaded through the router/connection-manager call chain as
//! `&mut` — never behind an `Arc<Mutex<_>>`.

use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::cip::class::ClassRegistry;
use crate::cip::connection_manager::ConnectionManager;
use crate::cip::identity::DeviceIdentity;
use crate::cip::{ethernetlink, identity, tcpip};
use crate::config::AdapterConfig;
use crate::encapsulation::SessionTable;
use crate::hooks::AdapterHooks;

/// Owns every piece of state the encapsulation/CIP layers touch. Built
/// once at startup from an [`AdapterConfig`] and a collaborator-supplied
/// [`AdapterHooks`] implementation.
pub struct AdapterContext {
    pub sessions: SessionTable,
    pub registry: ClassRegistry,
    pub conn_mgr: ConnectionManager,
    pub identity: DeviceIdentity,
    pub hooks: Arc<dyn AdapterHooks>,
    pub responder_addr: std::net::SocketAddrV4,
}

impl AdapterContext {
    pub fn new(config: &AdapterConfig, hooks: Arc<dyn AdapterHooks>) -> Self {
        let mut registry = ClassRegistry::new();
        registry.register(identity::build_class(&config.identity));
        registry.register(tcpip::build_class(&config.tcpip));
        registry.register(ethernetlink::build_class(&config.ethernet_link));

        let mut conn_mgr = ConnectionManager::new(config.class1_capacity, config.class3_capacity);
        let host_ip = if config.bind_address == Ipv4Addr::UNSPECIFIED {
            local_ipv4_hint()
        } else {
            config.bind_address
        };
        conn_mgr.set_host_ip(host_ip);
        conn_mgr.set_netmask(config.tcpip.netmask);
        conn_mgr.set_multicast_ttl(config.tcpip.ttl_value);
        conn_mgr.set_rpi_bounds(config.min_rpi_usecs, config.max_rpi_usecs);

        AdapterContext {
            sessions: SessionTable::new(),
            registry,
            conn_mgr,
            identity: config.identity.clone(),
            hooks,
            responder_addr: std::net::SocketAddrV4::new(host_ip, config.port),
        }
    }
}

/// Best-effort local address for multicast host-portion derivation when
/// the adapter was configured to bind `0.0.0.0`. Falls back to loopback;
/// a wildcard-bound adapter has no single "real" address to report in
/// ListIdentity/multicast math, and CIPster makes the same approximation
/// via `gethostbyname` in `main.c`.
fn local_ipv4_hint() -> Ipv4Addr {
    use std::net::UdpSocket;
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| {
            s.connect("198.18.0.1:1")?;
            s.local_addr()
        })
        .ok()
        .and_then(|addr| match addr.ip() {
            std::net::IpAddr::V4(v4) => Some(v4),
            std::net::IpAddr::V6(_) => None,
        })
        .unwrap_or(Ipv4Addr::LOCALHOST)
}
