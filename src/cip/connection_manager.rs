//! Connection Manager (class 0x06), §4.I. Forward-Open/Forward-Close and
//! the connection state machine, grounded in CIPster's connection-manager
//! object and the Class-1/Class-3 pooling pattern in `cipclass3connection.c`.
//! Connection storage uses fixed-capacity `Vec<Option<CipConn>>` pools
//! rather than the source's intrusive singly-linked list — see `DESIGN.md`
//! for why that simplification is safe here.

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::bytebuf::{BufReader, BufWriter};
use crate::cip::identity::DeviceIdentity;
use crate::cpf::SockAddrInfoItems;
use crate::epath::{CipAppPath, ElectronicKey, PathFlavor};
use crate::error::{CipError, ConnMgrStatus, Result};

/// EtherNet/IP's standard I/O (Class 1) UDP port, Vol2 2-2.1.
pub const IO_PORT: u16 = 0x08AE;

pub const CLASS_ID: u32 = 0x06;
pub const INSTANCE_ID: u32 = 1;

const SERVICE_FORWARD_OPEN: u8 = 0x54;
const SERVICE_FORWARD_CLOSE: u8 = 0x4E;

const MULTICAST_BASE: u32 = 0xEF_C0_01_00; // 239.192.1.0
const NUM_MULTICAST_ADDRESSES: u32 = 32;

/// Network connection parameters word, bits 14-15: connection type. Vol1
/// Table 3-5.11. `01` selects multicast production for that direction.
const CONN_TYPE_MASK: u16 = 0x6000;
const CONN_TYPE_MULTICAST: u16 = 0x2000;

/// Conservative RPI bounds applied when [`ConnectionManager::set_rpi_bounds`]
/// is never called: 1ms to 1 hour, wide enough not to reject any
/// reasonable Forward-Open while still giving §4.I step 5 something to
/// check.
const DEFAULT_MIN_RPI_USECS: u32 = 1_000;
const DEFAULT_MAX_RPI_USECS: u32 = 3_600_000_000;

/// The originator-chosen 96-bit identity of a connection: serial number,
/// vendor id, and originator serial number together uniquely name it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Triad {
    pub connection_serial: u16,
    pub originator_vendor_id: u16,
    pub originator_serial: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnClass {
    Class1,
    Class3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Established,
    TimedOut,
    Closing,
}

/// A live connection, established by a successful Forward-Open (§4.I).
#[derive(Debug, Clone)]
pub struct CipConn {
    pub triad: Triad,
    pub class: ConnClass,
    pub consuming_path: CipAppPath,
    pub producing_path: CipAppPath,
    pub o_to_t_rpi_usecs: u32,
    pub t_to_o_rpi_usecs: u32,
    pub timeout_multiplier: u8,
    pub o_to_t_connection_id: u32,
    pub t_to_o_connection_id: u32,
    pub transport_class_trigger: u8,
    pub electronic_key: Option<ElectronicKey>,
    pub state: ConnState,
    pub next_send_time_usecs: u64,
    pub watchdog_deadline_usecs: u64,
    /// T->O sequence number, incremented on every production (§4.I).
    pub sequence: u16,
    /// Where the network handler sends T->O (produced) datagrams. Defaults
    /// to the originator's TCP peer address on [`IO_PORT`]; a SockAddr Info
    /// Item in the Forward-Open CPF frame overrides it to a multicast
    /// group for Class 1 connections that request one (§3 Data Model).
    pub target_addr: SocketAddrV4,
}

impl CipConn {
    /// `(RPI_consumed × 4) << timeout_multiplier` microseconds, per §4.I step 9.
    fn watchdog_span_usecs(rpi_consumed_usecs: u32, timeout_multiplier: u8) -> u64 {
        (rpi_consumed_usecs as u64 * 4) << timeout_multiplier
    }

    pub fn rearm_watchdog(&mut self, now_usecs: u64) {
        self.watchdog_deadline_usecs =
            now_usecs + Self::watchdog_span_usecs(self.o_to_t_rpi_usecs, self.timeout_multiplier);
    }
}

/// Fixed-size Class 1 and Class 3 connection pools plus a monotonic
/// connection-id generator, owned by the [`crate::context::AdapterContext`].
pub struct ConnectionManager {
    class1_pool: Vec<Option<CipConn>>,
    class3_pool: Vec<Option<CipConn>>,
    next_connection_id: u32,
    host_ip: Ipv4Addr,
    netmask: Ipv4Addr,
    min_rpi_usecs: u32,
    max_rpi_usecs: u32,
    multicast_ttl: u8,
}

impl ConnectionManager {
    pub fn new(class1_capacity: usize, class3_capacity: usize) -> Self {
        ConnectionManager {
            class1_pool: (0..class1_capacity).map(|_| None).collect(),
            class3_pool: (0..class3_capacity).map(|_| None).collect(),
            next_connection_id: 1,
            host_ip: Ipv4Addr::UNSPECIFIED,
            netmask: Ipv4Addr::UNSPECIFIED,
            min_rpi_usecs: DEFAULT_MIN_RPI_USECS,
            max_rpi_usecs: DEFAULT_MAX_RPI_USECS,
            multicast_ttl: 1,
        }
    }

    pub fn set_host_ip(&mut self, ip: Ipv4Addr) {
        self.host_ip = ip;
    }

    pub fn set_netmask(&mut self, netmask: Ipv4Addr) {
        self.netmask = netmask;
    }

    /// Configures the advertised supported RPI range (§4.I step 5).
    pub fn set_rpi_bounds(&mut self, min_usecs: u32, max_usecs: u32) {
        self.min_rpi_usecs = min_usecs;
        self.max_rpi_usecs = max_usecs;
    }

    /// TCP/IP Interface object attribute 8 (§4.F), consulted by the network
    /// handler's cyclic production loop when it sets `IP_MULTICAST_TTL` on
    /// the ephemeral production socket.
    pub fn set_multicast_ttl(&mut self, ttl: u8) {
        self.multicast_ttl = ttl;
    }

    pub fn multicast_ttl(&self) -> u8 {
        self.multicast_ttl
    }

    fn allocate_connection_id(&mut self) -> u32 {
        let id = self.next_connection_id;
        self.next_connection_id = self.next_connection_id.wrapping_add(1).max(1);
        id
    }

    /// Vol2 3-5.3 multicast address allocation: `base + ((host_portion - 1)
    /// mod 32) * 32`, where `host_portion` is the device's address with its
    /// network bits (from [`ConnectionManager::set_netmask`]) masked off.
    pub fn multicast_address_for(&self) -> Ipv4Addr {
        let host_bits = u32::from(self.host_ip) & !u32::from(self.netmask);
        let index = host_bits.wrapping_sub(1) % NUM_MULTICAST_ADDRESSES;
        Ipv4Addr::from(MULTICAST_BASE + index * NUM_MULTICAST_ADDRESSES)
    }

    fn find_by_triad(&self, triad: &Triad) -> Option<(ConnClass, usize)> {
        for (i, slot) in self.class1_pool.iter().enumerate() {
            if let Some(conn) = slot {
                if conn.triad == *triad {
                    return Some((ConnClass::Class1, i));
                }
            }
        }
        for (i, slot) in self.class3_pool.iter().enumerate() {
            if let Some(conn) = slot {
                if conn.triad == *triad {
                    return Some((ConnClass::Class3, i));
                }
            }
        }
        None
    }

    fn pool_mut(&mut self, class: ConnClass) -> &mut Vec<Option<CipConn>> {
        match class {
            ConnClass::Class1 => &mut self.class1_pool,
            ConnClass::Class3 => &mut self.class3_pool,
        }
    }

    fn free_slot(&self, class: ConnClass) -> Option<usize> {
        let pool = match class {
            ConnClass::Class1 => &self.class1_pool,
            ConnClass::Class3 => &self.class3_pool,
        };
        pool.iter().position(|s| s.is_none())
    }

    /// Scans the Class 1 pool for connections whose `next_send_time_usecs`
    /// is due, emitting each at most once per call (§4.I cyclic
    /// production). Class 3 connections are transactional explicit
    /// messaging over TCP and never produce cyclic I/O, so they are not
    /// scanned here. Callers capture the list of due indices up front, so
    /// a connection that transitions to `TimedOut`/`Closing` mid-scan
    /// cannot be visited twice — the Rust analogue of "capture the
    /// successor before invoking the callback" for the source's intrusive
    /// list. Returns, per due connection, the connection id, the sequence
    /// number to stamp on the datagram, and where to send it.
    pub fn due_for_production(&mut self, now_usecs: u64) -> Vec<(u32, u16, SocketAddrV4)> {
        let mut due = Vec::new();
        for slot in self.class1_pool.iter_mut() {
            if let Some(conn) = slot {
                if conn.state == ConnState::Established && conn.next_send_time_usecs <= now_usecs {
                    conn.sequence = conn.sequence.wrapping_add(1);
                    due.push((conn.t_to_o_connection_id, conn.sequence, conn.target_addr));
                    conn.next_send_time_usecs += conn.t_to_o_rpi_usecs as u64;
                }
            }
        }
        due
    }

    /// Resets the watchdog of the Class 1 connection whose O->T connection
    /// id matches a just-consumed datagram (§4.I "Established + consumed
    /// datagram -> Established"). Returns whether a matching connection
    /// was found. Class 3 connections have no consumed cyclic datagram to
    /// arm from; their watchdog only ever expires.
    pub fn deliver_consumed(&mut self, o_to_t_connection_id: u32, now_usecs: u64) -> bool {
        for slot in self.class1_pool.iter_mut() {
            if let Some(conn) = slot {
                if conn.o_to_t_connection_id == o_to_t_connection_id && conn.state == ConnState::Established {
                    conn.rearm_watchdog(now_usecs);
                    return true;
                }
            }
        }
        false
    }

    /// Expires watchdogs; returns the triads of connections that timed out
    /// this tick so callers can invoke the collaborator's connection-event
    /// hook (§6).
    pub fn expire_watchdogs(&mut self, now_usecs: u64) -> Vec<Triad> {
        let mut timed_out = Vec::new();
        for pool in [&mut self.class1_pool, &mut self.class3_pool] {
            for slot in pool.iter_mut() {
                if let Some(conn) = slot {
                    if conn.state == ConnState::Established && conn.watchdog_deadline_usecs <= now_usecs {
                        conn.state = ConnState::TimedOut;
                        timed_out.push(conn.triad);
                    }
                }
            }
        }
        timed_out
    }

    /// Removes every `TimedOut`/`Closing` connection, releasing its slot.
    pub fn reap(&mut self) {
        for pool in [&mut self.class1_pool, &mut self.class3_pool] {
            for slot in pool.iter_mut() {
                if matches!(slot, Some(c) if matches!(c.state, ConnState::TimedOut | ConnState::Closing)) {
                    *slot = None;
                }
            }
        }
    }
}

struct ForwardOpenRequest {
    triad: Triad,
    timeout_multiplier: u8,
    o_to_t_rpi: u32,
    t_to_o_rpi: u32,
    t_to_o_params: u16,
    transport_class_trigger: u8,
    electronic_key: Option<ElectronicKey>,
    consuming_path: CipAppPath,
    producing_path: CipAppPath,
}

fn parse_connection_path(input: &mut BufReader, path_words: usize) -> Result<(Option<ElectronicKey>, CipAppPath, CipAppPath)> {
    let path_bytes = input.get_bytes(path_words * 2)?;
    let mut reader = BufReader::new(path_bytes);

    let key = if reader.as_slice().first() == Some(&0x34) {
        reader.get_u8()?;
        Some(ElectronicKey::deserialize(&mut reader)?)
    } else {
        None
    };

    let mut paths = Vec::new();
    let mut previous: Option<CipAppPath> = None;
    while !reader.is_empty() {
        let path = CipAppPath::deserialize(&mut reader, PathFlavor::Padded, previous.as_ref())?;
        previous = Some(path.clone());
        paths.push(path);
    }

    match paths.len() {
        0 => Err(CipError::PathSegmentError),
        1 => Ok((key, paths[0].clone(), paths[0].clone())),
        _ => Ok((key, paths[0].clone(), paths[1].clone())),
    }
}

fn parse_forward_open(data: &[u8]) -> Result<ForwardOpenRequest> {
    let mut input = BufReader::new(data);
    input.get_u8()?; // priority_time_tick
    input.get_u8()?; // timeout_ticks
    input.get_u32_le()?; // O_to_T_network_connection_id, re-derived below
    input.get_u32_le()?; // T_to_O_network_connection_id, re-derived below
    let connection_serial = input.get_u16_le()?;
    let originator_vendor_id = input.get_u16_le()?;
    let originator_serial = input.get_u32_le()?;
    let timeout_multiplier = input.get_u8()?;
    input.get_bytes(3)?; // reserved
    let o_to_t_rpi = input.get_u32_le()?;
    input.get_u16_le()?; // O_to_T_network_connection_parameters
    let t_to_o_rpi = input.get_u32_le()?;
    let t_to_o_params = input.get_u16_le()?;
    let transport_class_trigger = input.get_u8()?;
    let path_words = input.get_u8()? as usize;
    let (electronic_key, consuming_path, producing_path) = parse_connection_path(&mut input, path_words)?;

    Ok(ForwardOpenRequest {
        triad: Triad {
            connection_serial,
            originator_vendor_id,
            originator_serial,
        },
        timeout_multiplier,
        o_to_t_rpi,
        t_to_o_rpi,
        t_to_o_params,
        transport_class_trigger,
        electronic_key,
        consuming_path,
        producing_path,
    })
}

/// A connection lifecycle transition worth surfacing to the collaborator's
/// connection-event hook (§6), alongside watchdog expiry.
#[derive(Debug, Clone, Copy)]
pub enum ConnEvent {
    None,
    Opened(Triad),
    Closed(Triad),
}

/// Dispatches Forward-Open (0x54) / Forward-Close (0x4E) against the
/// connection manager, §4.I. `originator` is the requesting peer's TCP
/// address, used as the default Class 1 production target; `identity` is
/// checked against an electronic key segment when one is present.
/// `now_usecs` anchors the new connection's watchdog deadline and first
/// production time to wall-clock time.
pub fn dispatch(
    conn_mgr: &mut ConnectionManager,
    identity: &DeviceIdentity,
    originator: SocketAddrV4,
    sock_info: &SockAddrInfoItems,
    service: u8,
    now_usecs: u64,
    data: &[u8],
    out: &mut BufWriter,
) -> Result<(usize, ConnEvent)> {
    match service {
        SERVICE_FORWARD_OPEN => forward_open(conn_mgr, identity, originator, sock_info, now_usecs, data, out),
        SERVICE_FORWARD_CLOSE => forward_close(conn_mgr, data, out),
        _ => Err(CipError::ServiceNotSupported),
    }
}

fn forward_open(
    conn_mgr: &mut ConnectionManager,
    identity: &DeviceIdentity,
    originator: SocketAddrV4,
    sock_info: &SockAddrInfoItems,
    now_usecs: u64,
    data: &[u8],
    out: &mut BufWriter,
) -> Result<(usize, ConnEvent)> {
    let req = parse_forward_open(data)?;

    if let Some(key) = &req.electronic_key {
        key.check(identity.vendor_id, identity.device_type, identity.product_code, identity.major_revision, identity.minor_revision)
            .map_err(CipError::ConnMgr)?;
    }

    if conn_mgr.find_by_triad(&req.triad).is_some() {
        return Err(CipError::ConnMgr(ConnMgrStatus::ConnectionInUse));
    }

    if req.o_to_t_rpi < conn_mgr.min_rpi_usecs
        || req.o_to_t_rpi > conn_mgr.max_rpi_usecs
        || req.t_to_o_rpi < conn_mgr.min_rpi_usecs
        || req.t_to_o_rpi > conn_mgr.max_rpi_usecs
    {
        return Err(CipError::RpiNotAcceptable(conn_mgr.min_rpi_usecs));
    }

    // Transport trigger bit 0x01 selects Class 1 (cyclic) vs Class 3 (explicit).
    let class = if req.transport_class_trigger & 0x0F == 1 {
        ConnClass::Class1
    } else {
        ConnClass::Class3
    };

    let slot = conn_mgr
        .free_slot(class)
        .ok_or(CipError::ConnMgr(ConnMgrStatus::NoMoreConnectionsAvailable))?;

    let o_to_t_connection_id = conn_mgr.allocate_connection_id();
    let t_to_o_connection_id = conn_mgr.allocate_connection_id();

    // §4.I step 7: multicast if the T->O connection parameters request it;
    // otherwise an explicit T->O SockAddr Info Item (§4.B) overrides the
    // default unicast target of the originator's own TCP peer address.
    let target_addr = if req.t_to_o_params & CONN_TYPE_MASK == CONN_TYPE_MULTICAST {
        SocketAddrV4::new(conn_mgr.multicast_address_for(), IO_PORT)
    } else if let Some(sock_addr) = sock_info.target_to_originator {
        sock_addr.into()
    } else {
        SocketAddrV4::new(*originator.ip(), IO_PORT)
    };

    let conn = CipConn {
        triad: req.triad,
        class,
        consuming_path: req.consuming_path,
        producing_path: req.producing_path,
        o_to_t_rpi_usecs: req.o_to_t_rpi,
        t_to_o_rpi_usecs: req.t_to_o_rpi,
        timeout_multiplier: req.timeout_multiplier,
        o_to_t_connection_id,
        t_to_o_connection_id,
        transport_class_trigger: req.transport_class_trigger,
        electronic_key: req.electronic_key,
        state: ConnState::Established,
        next_send_time_usecs: now_usecs + req.t_to_o_rpi as u64,
        watchdog_deadline_usecs: now_usecs + CipConn::watchdog_span_usecs(req.o_to_t_rpi, req.timeout_multiplier),
        sequence: 0,
        target_addr,
    };

    let triad = req.triad;
    conn_mgr.pool_mut(class)[slot] = Some(conn);

    out.put_u32_le(o_to_t_connection_id)?;
    out.put_u32_le(t_to_o_connection_id)?;
    out.put_u16_le(req.triad.connection_serial)?;
    out.put_u16_le(req.triad.originator_vendor_id)?;
    out.put_u32_le(req.triad.originator_serial)?;
    out.put_u32_le(req.o_to_t_rpi)?; // actual O->T API, unchanged from requested
    out.put_u32_le(req.t_to_o_rpi)?; // actual T->O API
    out.put_u8(0)?; // application_reply_size (words)
    out.put_u8(0)?; // reserved
    Ok((out.position(), ConnEvent::Opened(triad)))
}

fn forward_close(conn_mgr: &mut ConnectionManager, data: &[u8], out: &mut BufWriter) -> Result<(usize, ConnEvent)> {
    let mut input = BufReader::new(data);
    input.get_u8()?; // priority_time_tick
    input.get_u8()?; // timeout_ticks
    let connection_serial = input.get_u16_le()?;
    let originator_vendor_id = input.get_u16_le()?;
    let originator_serial = input.get_u32_le()?;
    let path_words = input.get_u8()? as usize;
    input.get_u8()?; // reserved
    input.get_bytes(path_words * 2)?; // connection_path, used only for matching in CIPster; ignored here

    let triad = Triad {
        connection_serial,
        originator_vendor_id,
        originator_serial,
    };

    let (class, index) = conn_mgr
        .find_by_triad(&triad)
        .ok_or(CipError::ConnMgr(ConnMgrStatus::ConnectionNotFoundAtTargetApplication))?;

    if let Some(conn) = conn_mgr.pool_mut(class)[index].as_mut() {
        conn.state = ConnState::Closing;
    }

    out.put_u16_le(connection_serial)?;
    out.put_u16_le(originator_vendor_id)?;
    out.put_u32_le(originator_serial)?;
    out.put_u8(0)?; // application_reply_size (words)
    out.put_u8(0)?; // reserved
    Ok((out.position(), ConnEvent::Closed(triad)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_path_bytes() -> Vec<u8> {
        let path = CipAppPath {
            class: Some(0x04),
            instance: Some(100),
            ..Default::default()
        };
        let mut buf = [0u8; 16];
        let n;
        {
            let mut w = BufWriter::new(&mut buf);
            path.serialize(&mut w, PathFlavor::Padded, crate::epath::OmitFlags::empty())
                .unwrap();
            n = w.position();
        }
        buf[..n].to_vec()
    }

    fn sample_forward_open_bytes(serial: u16, transport_trigger: u8) -> Vec<u8> {
        sample_forward_open_bytes_with(serial, transport_trigger, 1_000_000, 1_000_000, 0)
    }

    fn sample_forward_open_bytes_with(
        serial: u16,
        transport_trigger: u8,
        o_to_t_rpi: u32,
        t_to_o_rpi: u32,
        t_to_o_params: u16,
    ) -> Vec<u8> {
        let path = sample_path_bytes();
        let mut data = Vec::new();
        data.push(10); // priority_time_tick
        data.push(10); // timeout_ticks
        data.extend_from_slice(&0u32.to_le_bytes()); // O_to_T conn id (ignored on input)
        data.extend_from_slice(&0u32.to_le_bytes()); // T_to_O conn id (ignored on input)
        data.extend_from_slice(&serial.to_le_bytes());
        data.extend_from_slice(&1u16.to_le_bytes()); // vendor
        data.extend_from_slice(&1u32.to_le_bytes()); // originator serial
        data.push(0); // timeout multiplier
        data.extend_from_slice(&[0, 0, 0]); // reserved
        data.extend_from_slice(&o_to_t_rpi.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes()); // O_to_T params
        data.extend_from_slice(&t_to_o_rpi.to_le_bytes());
        data.extend_from_slice(&t_to_o_params.to_le_bytes());
        data.push(transport_trigger);
        data.push((path.len() / 2) as u8);
        data.extend_from_slice(&path);
        data
    }

    fn originator() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 12345)
    }

    #[test]
    fn forward_open_allocates_a_class3_connection() {
        let mut conn_mgr = ConnectionManager::new(4, 4);
        let identity = DeviceIdentity::default();
        let req = sample_forward_open_bytes(42, 0x0A); // trigger nibble != 1 -> Class 3
        let mut out = [0u8; 64];
        let mut w = BufWriter::new(&mut out);
        let (n, event) = forward_open(&mut conn_mgr, &identity, originator(), &SockAddrInfoItems::default(), 0, &req, &mut w).unwrap();
        assert_eq!(n, 20);
        assert!(matches!(event, ConnEvent::Opened(_)));
        assert_eq!(conn_mgr.class3_pool.iter().flatten().count(), 1);
    }

    #[test]
    fn forward_open_rejects_duplicate_triad() {
        let mut conn_mgr = ConnectionManager::new(4, 4);
        let identity = DeviceIdentity::default();
        let req = sample_forward_open_bytes(7, 0x0A);
        let mut out1 = [0u8; 64];
        let mut w1 = BufWriter::new(&mut out1);
        forward_open(&mut conn_mgr, &identity, originator(), &SockAddrInfoItems::default(), 0, &req, &mut w1).unwrap();

        let mut out2 = [0u8; 64];
        let mut w2 = BufWriter::new(&mut out2);
        let err = forward_open(&mut conn_mgr, &identity, originator(), &SockAddrInfoItems::default(), 0, &req, &mut w2).unwrap_err();
        assert!(matches!(err, CipError::ConnMgr(ConnMgrStatus::ConnectionInUse)));
    }

    #[test]
    fn forward_open_exhausts_pool() {
        let mut conn_mgr = ConnectionManager::new(1, 1);
        let identity = DeviceIdentity::default();
        let req1 = sample_forward_open_bytes(1, 0x01); // Class 1
        let mut out1 = [0u8; 64];
        let mut w1 = BufWriter::new(&mut out1);
        forward_open(&mut conn_mgr, &identity, originator(), &SockAddrInfoItems::default(), 0, &req1, &mut w1).unwrap();

        let req2 = sample_forward_open_bytes(2, 0x01);
        let mut out2 = [0u8; 64];
        let mut w2 = BufWriter::new(&mut out2);
        let err = forward_open(&mut conn_mgr, &identity, originator(), &SockAddrInfoItems::default(), 0, &req2, &mut w2).unwrap_err();
        assert!(matches!(
            err,
            CipError::ConnMgr(ConnMgrStatus::NoMoreConnectionsAvailable)
        ));
    }

    #[test]
    fn forward_close_transitions_to_closing_then_reap_frees_slot() {
        let mut conn_mgr = ConnectionManager::new(2, 2);
        let identity = DeviceIdentity::default();
        let open_req = sample_forward_open_bytes(9, 0x0A);
        let mut open_out = [0u8; 64];
        let mut ow = BufWriter::new(&mut open_out);
        forward_open(&mut conn_mgr, &identity, originator(), &SockAddrInfoItems::default(), 0, &open_req, &mut ow).unwrap();

        let mut close_data = Vec::new();
        close_data.push(10);
        close_data.push(10);
        close_data.extend_from_slice(&9u16.to_le_bytes());
        close_data.extend_from_slice(&1u16.to_le_bytes());
        close_data.extend_from_slice(&1u32.to_le_bytes());
        let path = sample_path_bytes();
        close_data.push((path.len() / 2) as u8);
        close_data.push(0);
        close_data.extend_from_slice(&path);

        let mut close_out = [0u8; 64];
        let mut cw = BufWriter::new(&mut close_out);
        forward_close(&mut conn_mgr, &close_data, &mut cw).unwrap();

        assert_eq!(conn_mgr.class3_pool.iter().flatten().count(), 1);
        conn_mgr.reap();
        assert_eq!(conn_mgr.class3_pool.iter().flatten().count(), 0);
    }

    #[test]
    fn multicast_address_derivation_stays_in_cip_range() {
        let mut conn_mgr = ConnectionManager::new(1, 1);
        conn_mgr.set_host_ip(Ipv4Addr::new(192, 168, 1, 37));
        conn_mgr.set_netmask(Ipv4Addr::new(255, 255, 255, 0));
        let addr = conn_mgr.multicast_address_for();
        assert!(u32::from(addr) >= MULTICAST_BASE);
        assert!(u32::from(addr) < MULTICAST_BASE + NUM_MULTICAST_ADDRESSES * NUM_MULTICAST_ADDRESSES);
    }

    #[test]
    fn forward_open_rejects_rpi_outside_supported_range() {
        let mut conn_mgr = ConnectionManager::new(4, 4);
        conn_mgr.set_rpi_bounds(10_000, 1_000_000);
        let identity = DeviceIdentity::default();
        let req = sample_forward_open_bytes_with(1, 0x0A, 1_000, 1_000_000, 0);
        let mut out = [0u8; 64];
        let mut w = BufWriter::new(&mut out);
        let err = forward_open(&mut conn_mgr, &identity, originator(), &SockAddrInfoItems::default(), 0, &req, &mut w)
            .unwrap_err();
        assert!(matches!(err, CipError::RpiNotAcceptable(10_000)));
    }

    #[test]
    fn forward_open_targets_multicast_address_when_requested() {
        let mut conn_mgr = ConnectionManager::new(4, 4);
        conn_mgr.set_host_ip(Ipv4Addr::new(192, 168, 1, 37));
        conn_mgr.set_netmask(Ipv4Addr::new(255, 255, 255, 0));
        let identity = DeviceIdentity::default();
        let req = sample_forward_open_bytes_with(2, 0x01, 1_000_000, 1_000_000, CONN_TYPE_MULTICAST);
        let mut out = [0u8; 64];
        let mut w = BufWriter::new(&mut out);
        forward_open(&mut conn_mgr, &identity, originator(), &SockAddrInfoItems::default(), 0, &req, &mut w).unwrap();
        let conn = conn_mgr.class1_pool.iter().flatten().next().unwrap();
        assert_eq!(conn.target_addr.ip(), &conn_mgr.multicast_address_for());
        assert_eq!(conn.target_addr.port(), IO_PORT);
    }

    #[test]
    fn forward_open_honors_explicit_sockaddr_override_for_unicast() {
        let mut conn_mgr = ConnectionManager::new(4, 4);
        let identity = DeviceIdentity::default();
        let req = sample_forward_open_bytes_with(3, 0x0A, 1_000_000, 1_000_000, 0);
        let mut out = [0u8; 64];
        let mut w = BufWriter::new(&mut out);
        let override_addr = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 99), 0x1234);
        let sock_info = SockAddrInfoItems {
            originator_to_target: None,
            target_to_originator: Some(override_addr.into()),
        };
        forward_open(&mut conn_mgr, &identity, originator(), &sock_info, 0, &req, &mut w).unwrap();
        let conn = conn_mgr.class3_pool.iter().flatten().next().unwrap();
        assert_eq!(conn.target_addr, override_addr);
    }

    #[test]
    fn due_for_production_never_scans_class3() {
        let mut conn_mgr = ConnectionManager::new(4, 4);
        let identity = DeviceIdentity::default();
        let req = sample_forward_open_bytes_with(11, 0x0A, 1_000_000, 1_000_000, 0); // Class 3
        let mut out = [0u8; 64];
        let mut w = BufWriter::new(&mut out);
        forward_open(&mut conn_mgr, &identity, originator(), &SockAddrInfoItems::default(), 0, &req, &mut w).unwrap();

        assert!(conn_mgr.due_for_production(1_000_000_000).is_empty());
    }

    #[test]
    fn deliver_consumed_rearms_the_matching_class1_watchdog() {
        let mut conn_mgr = ConnectionManager::new(4, 4);
        let identity = DeviceIdentity::default();
        let req = sample_forward_open_bytes_with(12, 0x01, 1_000, 1_000, 0); // Class 1
        let mut out = [0u8; 64];
        let mut w = BufWriter::new(&mut out);
        forward_open(&mut conn_mgr, &identity, originator(), &SockAddrInfoItems::default(), 0, &req, &mut w).unwrap();

        let o_to_t_connection_id = conn_mgr.class1_pool.iter().flatten().next().unwrap().o_to_t_connection_id;
        assert!(conn_mgr.deliver_consumed(o_to_t_connection_id, 500_000));
        let conn = conn_mgr.class1_pool.iter().flatten().next().unwrap();
        assert_eq!(conn.watchdog_deadline_usecs, 500_000 + CipConn::watchdog_span_usecs(1_000, 0));

        assert!(conn_mgr.expire_watchdogs(500_000 + CipConn::watchdog_span_usecs(1_000, 0) - 1).is_empty());
    }
}
