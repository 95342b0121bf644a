//! ENIP encapsulation layer (§4.H): the 24-byte header, session table, and
//! command dispatch that wraps CPF-framed CIP traffic. Grounded in
//! CIPster's `encap.c` (`HandleReceivedExplicitTcpData`,
//! `HandleReceivedExplictUdpData`, the `RegisterSession`/`SendRRData`
//! command handlers) and its `g_registered_sessions` table.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use crate::bytebuf::{BufReader, BufWriter};
use crate::cip::class::ClassRegistry;
use crate::cip::connection_manager::ConnectionManager;
use crate::cip::identity::DeviceIdentity;
use crate::cip::message_router;
use crate::cpf::{self, CpfMessage};
use crate::error::{CipError, EncapsulationStatus, Result};
use crate::hooks::AdapterHooks;

pub const HEADER_LEN: usize = 24;
const PROTOCOL_VERSION: u16 = 1;

pub const CMD_NOP: u16 = 0x0000;
pub const CMD_LIST_SERVICES: u16 = 0x0004;
pub const CMD_LIST_IDENTITY: u16 = 0x0063;
pub const CMD_LIST_INTERFACES: u16 = 0x0064;
pub const CMD_REGISTER_SESSION: u16 = 0x0065;
pub const CMD_UNREGISTER_SESSION: u16 = 0x0066;
pub const CMD_SEND_RR_DATA: u16 = 0x006F;
pub const CMD_SEND_UNIT_DATA: u16 = 0x0070;

const LIST_SERVICES_ITEM_TYPE: u16 = 0x0100;
const SUPPORTED_PROTOCOL_CAPABILITY: u16 = 0x0020; // supports CIP over TCP

/// A 24-byte encapsulation header (§4.H).
#[derive(Debug, Clone, Copy, Default)]
pub struct EncapHeader {
    pub command: u16,
    pub length: u16,
    pub session: u32,
    pub status: u32,
    pub sender_context: [u8; 8],
    pub options: u32,
}

impl EncapHeader {
    pub fn decode(input: &mut BufReader) -> Result<Self> {
        let command = input.get_u16_le()?;
        let length = input.get_u16_le()?;
        let session = input.get_u32_le()?;
        let status = input.get_u32_le()?;
        let sender_context = input.get_bytes(8)?.try_into().unwrap();
        let options = input.get_u32_le()?;
        Ok(EncapHeader {
            command,
            length,
            session,
            status,
            sender_context,
            options,
        })
    }

    pub fn encode(&self, out: &mut BufWriter) -> Result<()> {
        out.put_u16_le(self.command)?;
        out.put_u16_le(self.length)?;
        out.put_u32_le(self.session)?;
        out.put_u32_le(self.status)?;
        out.put_bytes(&self.sender_context)?;
        out.put_u32_le(self.options)?;
        Ok(())
    }
}

/// Per-connection session table: handle issuance and the
/// Unregistered/Registered state CIPster tracks in `g_registered_sessions`.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: BTreeMap<u32, SocketAddr>,
    next_handle: u32,
}

impl SessionTable {
    pub fn new() -> Self {
        SessionTable {
            sessions: BTreeMap::new(),
            next_handle: 1,
        }
    }

    fn register(&mut self, peer: SocketAddr) -> u32 {
        if let Some((&handle, _)) = self.sessions.iter().find(|(_, &p)| p == peer) {
            return handle; // duplicate register on the same socket returns the existing handle
        }
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        self.sessions.insert(handle, peer);
        handle
    }

    pub fn is_registered(&self, handle: u32) -> bool {
        self.sessions.contains_key(&handle)
    }

    pub fn unregister(&mut self, handle: u32) {
        self.sessions.remove(&handle);
    }

    /// Drops every session associated with a peer, e.g. on TCP disconnect.
    pub fn drop_peer(&mut self, peer: SocketAddr) {
        self.sessions.retain(|_, &mut p| p != peer);
    }
}

/// Everything the command dispatcher needs to answer a request.
pub struct EncapContext<'a> {
    pub sessions: &'a mut SessionTable,
    pub registry: &'a mut ClassRegistry,
    pub conn_mgr: &'a mut ConnectionManager,
    pub hooks: &'a dyn AdapterHooks,
    pub identity: &'a DeviceIdentity,
    /// The adapter's own IPv4 endpoint, reported back in the ListIdentity
    /// SockAddr field. Always v4: the listener sockets are bound IPv4-only
    /// (§4.J).
    pub responder_addr: std::net::SocketAddrV4,
}

/// Decodes one encapsulation frame from `input`, dispatches it, and writes
/// the reply frame (header + payload) into `out`. Returns the number of
/// bytes written, or `0` for commands that warrant no reply (NOP).
/// `now_usecs` anchors any Forward-Open this frame triggers.
pub async fn handle_frame(
    ctx: &mut EncapContext<'_>,
    peer: SocketAddr,
    now_usecs: u64,
    input: &mut BufReader<'_>,
    out: &mut [u8],
) -> Result<usize> {
    let header = EncapHeader::decode(input)?;
    let payload = input.get_bytes(header.length as usize)?;

    if header.command == CMD_NOP {
        return Ok(0);
    }

    let (status, reply_payload_len, reply_session) = match dispatch_command(ctx, peer, &header, now_usecs, payload, out).await {
        Ok((n, session)) => (EncapsulationStatus::Success, n, session),
        Err(e) => (e.encapsulation_status(), 0, header.session),
    };

    let reply_header = EncapHeader {
        command: header.command,
        length: reply_payload_len as u16,
        session: reply_session,
        status: status as u32,
        sender_context: header.sender_context,
        options: 0,
    };

    // Reply payload was already written at the front of `out` by
    // `dispatch_command`; re-home it after the header by shifting in place.
    let payload_copy = out[..reply_payload_len].to_vec();
    let mut writer = BufWriter::new(out);
    reply_header.encode(&mut writer)?;
    writer.put_bytes(&payload_copy)?;
    Ok(writer.position())
}

/// Dispatches one encapsulation command, returning the reply payload
/// length and the session handle to stamp into the reply header. Every
/// command but `RegisterSession` echoes `header.session` unchanged;
/// `RegisterSession` returns the handle it just allocated, since the
/// request necessarily carries `session == 0`.
async fn dispatch_command(
    ctx: &mut EncapContext<'_>,
    peer: SocketAddr,
    header: &EncapHeader,
    now_usecs: u64,
    payload: &[u8],
    out: &mut [u8],
) -> Result<(usize, u32)> {
    match header.command {
        CMD_LIST_SERVICES => write_list_services(out).map(|n| (n, header.session)),
        CMD_LIST_IDENTITY => write_list_identity(ctx, out).map(|n| (n, header.session)),
        CMD_LIST_INTERFACES => {
            let mut w = BufWriter::new(out);
            w.put_u16_le(0)?; // item_count: no optional interfaces advertised
            Ok((w.position(), header.session))
        }
        CMD_REGISTER_SESSION => register_session(ctx, peer, payload, out),
        CMD_UNREGISTER_SESSION => {
            if header.session != 0 {
                ctx.sessions.unregister(header.session);
            }
            Ok((0, header.session))
        }
        CMD_SEND_RR_DATA | CMD_SEND_UNIT_DATA => {
            if header.session == 0 || !ctx.sessions.is_registered(header.session) {
                return Err(CipError::InvalidSession);
            }
            handle_send_data(ctx, peer, now_usecs, payload, out)
                .await
                .map(|n| (n, header.session))
        }
        _ => Err(CipError::InvalidCommand),
    }
}

fn register_session(
    ctx: &mut EncapContext<'_>,
    peer: SocketAddr,
    payload: &[u8],
    out: &mut [u8],
) -> Result<(usize, u32)> {
    let mut input = BufReader::new(payload);
    let protocol_version = input.get_u16_le()?;
    let _options_flags = input.get_u16_le()?;
    if protocol_version != PROTOCOL_VERSION {
        return Err(CipError::UnsupportedProtocol);
    }
    let handle = ctx.sessions.register(peer);
    let mut w = BufWriter::new(out);
    w.put_u16_le(PROTOCOL_VERSION)?;
    w.put_u16_le(0)?; // options_flags echoed back as 0
    Ok((w.position(), handle))
}

async fn handle_send_data(
    ctx: &mut EncapContext<'_>,
    peer: SocketAddr,
    now_usecs: u64,
    payload: &[u8],
    out: &mut [u8],
) -> Result<usize> {
    let mut input = BufReader::new(payload);
    input.get_u32_le()?; // interface_handle, always 0
    input.get_u16_le()?; // timeout, advisory only
    let (message, sock_info) = cpf::parse(&mut input)?;

    let mut router_buf = [0u8; 1400];
    let request_data = match message {
        CpfMessage::Unconnected { data } => data,
        CpfMessage::Connected { data, .. } => data,
    };

    let originator = match peer {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(_) => return Err(CipError::InvalidCommand),
    };

    let response = message_router::dispatch(
        request_data,
        ctx.registry,
        ctx.conn_mgr,
        ctx.identity,
        originator,
        &sock_info,
        ctx.hooks,
        now_usecs,
        &mut router_buf,
    )
    .await;

    let mut mr_reply = [0u8; 1400];
    let mr_len;
    {
        let mut w = BufWriter::new(&mut mr_reply);
        w.put_u8(response.reply_service)?;
        w.put_u8(0)?; // reserved
        w.put_u8(response.general_status)?;
        w.put_u8(response.extended_status.len() as u8)?;
        for word in &response.extended_status {
            w.put_u16_le(*word)?;
        }
        w.put_bytes(&router_buf[..response.data_len])?;
        mr_len = w.position();
    }

    let mut cpf_writer = BufWriter::new(out);
    cpf_writer.put_u32_le(0)?; // interface_handle
    cpf_writer.put_u16_le(0)?; // timeout
    cpf::write_unconnected(&mut cpf_writer, &mr_reply[..mr_len])?;
    Ok(cpf_writer.position())
}

fn write_list_services(out: &mut [u8]) -> Result<usize> {
    let mut w = BufWriter::new(out);
    w.put_u16_le(1)?; // item_count
    w.put_u16_le(LIST_SERVICES_ITEM_TYPE)?;
    w.put_u16_le(20)?; // item length
    w.put_u16_le(1)?; // version
    w.put_u16_le(SUPPORTED_PROTOCOL_CAPABILITY)?;
    let mut name = [0u8; 16];
    let service_name = b"Communications";
    name[..service_name.len()].copy_from_slice(service_name);
    w.put_bytes(&name)?;
    Ok(w.position())
}

fn write_list_identity(ctx: &EncapContext, out: &mut [u8]) -> Result<usize> {
    let mut identity_payload = [0u8; 64];
    let identity_len;
    {
        let mut w = BufWriter::new(&mut identity_payload);
        w.put_u16_le(PROTOCOL_VERSION)?;
        crate::sockaddr::CipSockAddr::from(ctx.responder_addr).encode(&mut w)?;
        w.put_u16_le(ctx.identity.vendor_id)?;
        w.put_u16_le(ctx.identity.device_type)?;
        w.put_u16_le(ctx.identity.product_code)?;
        w.put_u8(ctx.identity.major_revision)?;
        w.put_u8(ctx.identity.minor_revision)?;
        w.put_u16_le(0)?; // status
        w.put_u32_le(ctx.identity.serial_number)?;
        w.put_short_string(&ctx.identity.product_name, false)?;
        w.put_u8(0xFF)?; // state
        identity_len = w.position();
    }

    let mut w = BufWriter::new(out);
    cpf::write_list_identity(&mut w, &identity_payload[..identity_len])?;
    Ok(w.position())
}
