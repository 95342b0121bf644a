//! CIP Message Router (§4.E): parses a UCMM-style request, resolves it
//! through the class registry and EPATH codec, dispatches to a service,
//! and builds the response. Grounded in CIPster's `cipmessagerouter.h` /
//! `NotifyMR` dispatch chain.

use std::net::SocketAddrV4;

use crate::bytebuf::{BufReader, BufWriter};
use crate::cip::class::{self, AttrValue, ClassRegistry};
use crate::cip::connection_manager::{self, ConnEvent, ConnectionManager};
use crate::cip::identity::{self, DeviceIdentity};
use crate::cpf::SockAddrInfoItems;
use crate::epath::{CipAppPath, PathFlavor};
use crate::error::{CipError, Result};
use crate::hooks::{AdapterHooks, ConnectionEvent};

pub const SERVICE_GET_ATTRIBUTE_ALL: u8 = 0x01;
pub const SERVICE_SET_ATTRIBUTE_ALL: u8 = 0x02;
pub const SERVICE_RESET: u8 = 0x05;
pub const SERVICE_GET_ATTRIBUTE_SINGLE: u8 = 0x0E;
pub const SERVICE_SET_ATTRIBUTE_SINGLE: u8 = 0x10;
pub const SERVICE_FORWARD_OPEN: u8 = 0x54;
pub const SERVICE_FORWARD_CLOSE: u8 = 0x4E;

pub const REPLY_SERVICE_BIT: u8 = 0x80;

/// The outcome of a full request/response round trip: wire-ready fields
/// the encapsulation/CPF layers need to frame a reply (§4.E step 6).
pub struct RouterResponse {
    pub reply_service: u8,
    pub general_status: u8,
    pub extended_status: Vec<u16>,
    pub data_len: usize,
}

/// Parses `service:u8 | path_word_count:u8 | padded_epath | data...` and
/// dispatches it through the registry, writing reply data into `out`.
/// `now_usecs` anchors any Forward-Open this request triggers.
pub async fn dispatch(
    raw: &[u8],
    registry: &mut ClassRegistry,
    conn_mgr: &mut ConnectionManager,
    identity: &DeviceIdentity,
    originator: SocketAddrV4,
    sock_info: &SockAddrInfoItems,
    hooks: &dyn AdapterHooks,
    now_usecs: u64,
    out: &mut [u8],
) -> RouterResponse {
    match dispatch_inner(raw, registry, conn_mgr, identity, originator, sock_info, hooks, now_usecs, out).await {
        Ok((service, data_len)) => RouterResponse {
            reply_service: service | REPLY_SERVICE_BIT,
            general_status: 0,
            extended_status: Vec::new(),
            data_len,
        },
        Err((service, err)) => RouterResponse {
            reply_service: service | REPLY_SERVICE_BIT,
            general_status: err.general_status() as u8,
            extended_status: err.extended_status_words(),
            data_len: 0,
        },
    }
}

async fn dispatch_inner(
    raw: &[u8],
    registry: &mut ClassRegistry,
    conn_mgr: &mut ConnectionManager,
    identity: &DeviceIdentity,
    originator: SocketAddrV4,
    sock_info: &SockAddrInfoItems,
    hooks: &dyn AdapterHooks,
    now_usecs: u64,
    out: &mut [u8],
) -> std::result::Result<(u8, usize), (u8, CipError)> {
    let mut input = BufReader::new(raw);
    let service = input.get_u8().map_err(|e| (0, e))?;
    let path_word_count = input.get_u8().map_err(|e| (service, e))? as usize;
    let path_bytes = input
        .get_bytes(path_word_count * 2)
        .map_err(|e| (service, e))?;
    let mut path_reader = BufReader::new(path_bytes);
    let path = CipAppPath::deserialize(&mut path_reader, PathFlavor::Padded, None)
        .map_err(|e| (service, e))?;
    let remaining = input.as_slice();

    let class_id = path.class.ok_or((service, CipError::PathDestinationUnknown))?;

    if class_id == identity::CLASS_ID && service == SERVICE_RESET {
        identity::reset_service(remaining, hooks)
            .await
            .map(|()| (service, 0))
            .map_err(|e| (service, e))?;
        unreachable!("reset_service always returns Err");
    }

    if class_id == connection_manager::CLASS_ID
        && (service == SERVICE_FORWARD_OPEN || service == SERVICE_FORWARD_CLOSE)
    {
        let (n, event) = {
            let mut writer = BufWriter::new(out);
            connection_manager::dispatch(conn_mgr, identity, originator, sock_info, service, now_usecs, remaining, &mut writer)
                .map_err(|e| (service, e))?
        };
        match event {
            ConnEvent::Opened(triad) => {
                hooks
                    .notify_io_connection_event(triad.connection_serial as u32, ConnectionEvent::Opened)
                    .await
            }
            ConnEvent::Closed(triad) => {
                hooks
                    .notify_io_connection_event(triad.connection_serial as u32, ConnectionEvent::Closed)
                    .await
            }
            ConnEvent::None => {}
        }
        return Ok((service, n));
    }

    let class = registry
        .class_mut(class_id)
        .ok_or((service, CipError::ObjectDoesNotExist))?;

    let instance_id = path.instance_or_conn_pt().unwrap_or(0);

    if instance_id == 0 {
        // Class-level (meta) target.
        let mut writer = BufWriter::new(out);
        return match service {
            SERVICE_GET_ATTRIBUTE_SINGLE => {
                let attr_id = path.attribute.ok_or((service, CipError::PathDestinationUnknown))? as u16;
                class
                    .get_class_attribute_single(attr_id, &mut writer)
                    .map(|n| (service, n))
                    .map_err(|e| (service, e))
            }
            SERVICE_GET_ATTRIBUTE_ALL => class
                .get_class_attribute_all(&mut writer)
                .map(|n| (service, n))
                .map_err(|e| (service, e)),
            _ => Err((service, CipError::ServiceNotSupported)),
        };
    }

    let instance = class
        .instance(instance_id)
        .ok_or((service, CipError::PathDestinationUnknown))?;

    let mut writer = BufWriter::new(out);
    match service {
        SERVICE_GET_ATTRIBUTE_SINGLE => {
            let attr_id = path.attribute.ok_or((service, CipError::PathDestinationUnknown))? as u16;
            class::get_attribute_single(instance, attr_id, &mut writer)
                .map(|n| (service, n))
                .map_err(|e| (service, e))
        }
        SERVICE_GET_ATTRIBUTE_ALL => class::get_attribute_all(instance, &mut writer)
            .map(|n| (service, n))
            .map_err(|e| (service, e)),
        SERVICE_SET_ATTRIBUTE_SINGLE => {
            let attr_id = path.attribute.ok_or((service, CipError::PathDestinationUnknown))? as u16;
            let current_type = instance
                .attributes
                .get(attr_id)
                .ok_or((service, CipError::AttributeNotSupported))?
                .value
                .clone();
            let mut value_reader = BufReader::new(remaining);
            let new_value = decode_like(&current_type, &mut value_reader).map_err(|e| (service, e))?;
            let instance_mut = class.instance_mut(instance_id).expect("checked above");
            class::set_attribute_single(instance_mut, attr_id, new_value)
                .map(|()| (service, 0))
                .map_err(|e| (service, e))
        }
        _ => Err((service, CipError::ServiceNotSupported)),
    }
}

/// Decodes a replacement value for an attribute whose current value
/// establishes the expected wire type, mirroring CIPster's
/// `DecodeData`/type-tag-driven attribute codec.
fn decode_like(current: &AttrValue, input: &mut BufReader) -> Result<AttrValue> {
    Ok(match current {
        AttrValue::Bool(_) => AttrValue::Bool(input.get_u8()? != 0),
        AttrValue::Byte(_) => AttrValue::Byte(input.get_u8()?),
        AttrValue::Word(_) => AttrValue::Word(input.get_u16_le()?),
        AttrValue::Dword(_) => AttrValue::Dword(input.get_u32_le()?),
        AttrValue::Sint(_) => AttrValue::Sint(input.get_i8()?),
        AttrValue::Int(_) => AttrValue::Int(input.get_i16_le()?),
        AttrValue::Dint(_) => AttrValue::Dint(input.get_i32_le()?),
        AttrValue::Usint(_) => AttrValue::Usint(input.get_u8()?),
        AttrValue::Uint(_) => AttrValue::Uint(input.get_u16_le()?),
        AttrValue::Udint(_) => AttrValue::Udint(input.get_u32_le()?),
        AttrValue::Revision(_, _) => AttrValue::Revision(input.get_u8()?, input.get_u8()?),
        AttrValue::Mac(_) => {
            let bytes = input.get_bytes(6)?;
            let mut mac = [0u8; 6];
            mac.copy_from_slice(bytes);
            AttrValue::Mac(mac)
        }
        AttrValue::Real(_) => AttrValue::Real(input.get_f32_le()?),
        AttrValue::ShortString(_) => AttrValue::ShortString(input.get_short_string(false)?),
        AttrValue::CipString(_) => AttrValue::CipString(input.get_string(false)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytebuf::BufWriter;
    use crate::cip::class::{Attribute, CipClass, Instance};
    use crate::hooks::NullHooks;

    fn registry_with_test_class() -> ClassRegistry {
        let mut registry = ClassRegistry::new();
        let mut class = CipClass::new(1, "Identity", 1, CipClass::ATTR_REVISION);
        let mut instance = Instance::new(1, 1);
        instance
            .attributes
            .insert(Attribute::get_only(1, AttrValue::Uint(0x1234)));
        class.insert_instance(instance).unwrap();
        registry.register(class);
        registry
    }

    fn encode_request(service: u8, class_id: u32, instance_id: u32, attr: Option<u32>) -> Vec<u8> {
        let path = CipAppPath {
            class: Some(class_id),
            instance: Some(instance_id),
            attribute: attr,
            ..Default::default()
        };
        let mut path_buf = [0u8; 32];
        let path_len;
        {
            let mut w = BufWriter::new(&mut path_buf);
            path.serialize(&mut w, PathFlavor::Padded, crate::epath::OmitFlags::empty())
                .unwrap();
            path_len = w.position();
        }
        let mut raw = vec![service, (path_len / 2) as u8];
        raw.extend_from_slice(&path_buf[..path_len]);
        raw
    }

    fn test_peer() -> SocketAddrV4 {
        SocketAddrV4::new(std::net::Ipv4Addr::new(10, 0, 0, 9), 11111)
    }

    #[tokio::test]
    async fn get_attribute_single_success() {
        let mut registry = registry_with_test_class();
        let mut conn_mgr = ConnectionManager::new(4, 4);
        let hooks = NullHooks;
        let identity = identity::DeviceIdentity::default();
        let raw = encode_request(SERVICE_GET_ATTRIBUTE_SINGLE, 1, 1, Some(1));
        let mut out = [0u8; 64];
        let resp = dispatch(&raw, &mut registry, &mut conn_mgr, &identity, test_peer(), &SockAddrInfoItems::default(), &hooks, 0, &mut out).await;
        assert_eq!(resp.general_status, 0);
        assert_eq!(resp.reply_service, SERVICE_GET_ATTRIBUTE_SINGLE | REPLY_SERVICE_BIT);
        assert_eq!(&out[..resp.data_len], &0x1234u16.to_le_bytes());
    }

    #[tokio::test]
    async fn get_attribute_single_unknown_attribute() {
        let mut registry = registry_with_test_class();
        let mut conn_mgr = ConnectionManager::new(4, 4);
        let hooks = NullHooks;
        let identity = identity::DeviceIdentity::default();
        let raw = encode_request(SERVICE_GET_ATTRIBUTE_SINGLE, 1, 1, Some(99));
        let mut out = [0u8; 64];
        let resp = dispatch(&raw, &mut registry, &mut conn_mgr, &identity, test_peer(), &SockAddrInfoItems::default(), &hooks, 0, &mut out).await;
        assert_eq!(resp.general_status, CipError::AttributeNotSupported.general_status() as u8);
    }

    #[tokio::test]
    async fn unknown_class_is_object_does_not_exist() {
        let mut registry = registry_with_test_class();
        let mut conn_mgr = ConnectionManager::new(4, 4);
        let hooks = NullHooks;
        let identity = identity::DeviceIdentity::default();
        let raw = encode_request(SERVICE_GET_ATTRIBUTE_SINGLE, 99, 1, Some(1));
        let mut out = [0u8; 64];
        let resp = dispatch(&raw, &mut registry, &mut conn_mgr, &identity, test_peer(), &SockAddrInfoItems::default(), &hooks, 0, &mut out).await;
        assert_eq!(resp.general_status, CipError::ObjectDoesNotExist.general_status() as u8);
    }
}
