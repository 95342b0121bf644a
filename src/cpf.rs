//! Common Packet Format (§4.G): the item-based framing carried inside
//! `SendRRData`/`SendUnitData` encapsulation payloads. Grounded in
//! CIPster's `cpf.c` (`NotifyCommonPacketFormat`,
//! `NotifyConnectedCommonPacketFormat`, `AssembleLinearMessage`).

use crate::bytebuf::{BufReader, BufWriter};
use crate::error::{CipError, Result};
use crate::sockaddr::CipSockAddr;

pub const TYPE_NULL_ADDRESS: u16 = 0x0000;
pub const TYPE_CONNECTION_ADDRESS: u16 = 0x00A1;
pub const TYPE_UNCONNECTED_DATA: u16 = 0x00B2;
pub const TYPE_CONNECTED_DATA: u16 = 0x00B1;
pub const TYPE_SOCKADDR_O_TO_T: u16 = 0x8000;
pub const TYPE_SOCKADDR_T_TO_O: u16 = 0x8001;
pub const TYPE_LIST_IDENTITY_RESPONSE: u16 = 0x0C;

/// A decoded, dispatch-ready CPF frame: either an unconnected explicit
/// message, or a connected (Class 1/3) datagram carrying a connection id
/// and sequence number.
#[derive(Debug, Clone)]
pub enum CpfMessage<'a> {
    Unconnected { data: &'a [u8] },
    Connected {
        connection_id: u32,
        sequence_number: u16,
        data: &'a [u8],
    },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SockAddrInfoItems {
    pub originator_to_target: Option<CipSockAddr>,
    pub target_to_originator: Option<CipSockAddr>,
}

struct RawItem<'a> {
    type_id: u16,
    data: &'a [u8],
}

fn parse_items<'a>(input: &mut BufReader<'a>) -> Result<Vec<RawItem<'a>>> {
    let item_count = input.get_u16_le()?;
    let mut items = Vec::with_capacity(item_count as usize);
    for _ in 0..item_count {
        let type_id = input.get_u16_le()?;
        let len = input.get_u16_le()? as usize;
        let data = input.get_bytes(len)?;
        items.push(RawItem { type_id, data });
    }
    Ok(items)
}

/// Parses a CPF frame: `item_count:u16` then that many `type:u16 |
/// len:u16 | data` items. Accepts either the unconnected shape (Null
/// Address + Unconnected Data) or the connected shape (Connection Address
/// + Connected Data), plus up to two trailing SockAddr Info items, which
/// CIPster always emits (and expects) in originator-to-target-then-
/// target-to-originator order.
pub fn parse<'a>(input: &mut BufReader<'a>) -> Result<(CpfMessage<'a>, SockAddrInfoItems)> {
    let items = parse_items(input)?;
    if items.len() < 2 {
        return Err(CipError::NotEnoughData);
    }

    let mut sock_info = SockAddrInfoItems::default();
    for item in items.iter().skip(2) {
        let mut r = BufReader::new(item.data);
        match item.type_id {
            TYPE_SOCKADDR_O_TO_T => sock_info.originator_to_target = Some(CipSockAddr::decode(&mut r)?),
            TYPE_SOCKADDR_T_TO_O => sock_info.target_to_originator = Some(CipSockAddr::decode(&mut r)?),
            _ => return Err(CipError::PathSegmentError),
        }
    }

    let address_item = &items[0];
    let data_item = &items[1];

    let message = match (address_item.type_id, data_item.type_id) {
        (TYPE_NULL_ADDRESS, TYPE_UNCONNECTED_DATA) => CpfMessage::Unconnected {
            data: data_item.data,
        },
        (TYPE_CONNECTION_ADDRESS, TYPE_CONNECTED_DATA) => {
            if address_item.data.len() != 4 {
                return Err(CipError::NotEnoughData);
            }
            let connection_id = u32::from_le_bytes(address_item.data.try_into().unwrap());
            if data_item.data.len() < 2 {
                return Err(CipError::NotEnoughData);
            }
            let sequence_number = u16::from_le_bytes([data_item.data[0], data_item.data[1]]);
            CpfMessage::Connected {
                connection_id,
                sequence_number,
                data: &data_item.data[2..],
            }
        }
        _ => return Err(CipError::PathSegmentError),
    };

    Ok((message, sock_info))
}

/// Assembles a CPF frame for an unconnected (explicit messaging) response:
/// Null Address Item + Unconnected Data Item.
pub fn write_unconnected(out: &mut BufWriter, payload: &[u8]) -> Result<()> {
    out.put_u16_le(2)?; // item_count
    out.put_u16_le(TYPE_NULL_ADDRESS)?;
    out.put_u16_le(0)?;
    out.put_u16_le(TYPE_UNCONNECTED_DATA)?;
    out.put_u16_le(payload.len() as u16)?;
    out.put_bytes(payload)?;
    Ok(())
}

/// Assembles a CPF frame for a connected (Class 1/3) datagram: Connection
/// Address Item + Connected Data Item (sequence number + payload).
pub fn write_connected(
    out: &mut BufWriter,
    connection_id: u32,
    sequence_number: u16,
    payload: &[u8],
) -> Result<()> {
    out.put_u16_le(2)?;
    out.put_u16_le(TYPE_CONNECTION_ADDRESS)?;
    out.put_u16_le(4)?;
    out.put_u32_le(connection_id)?;
    out.put_u16_le(TYPE_CONNECTED_DATA)?;
    out.put_u16_le((payload.len() + 2) as u16)?;
    out.put_u16_le(sequence_number)?;
    out.put_bytes(payload)?;
    Ok(())
}

/// Assembles a single-item CPF frame carrying a ListIdentity response
/// (§8 scenario 1): item type 0x0C wrapping the Identity payload.
pub fn write_list_identity(out: &mut BufWriter, identity_payload: &[u8]) -> Result<()> {
    out.put_u16_le(1)?;
    out.put_u16_le(TYPE_LIST_IDENTITY_RESPONSE)?;
    out.put_u16_le(identity_payload.len() as u16)?;
    out.put_bytes(identity_payload)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_unconnected_message() {
        let mut buf = [0u8; 32];
        let n;
        {
            let mut w = BufWriter::new(&mut buf);
            write_unconnected(&mut w, &[0x0E, 0x01]).unwrap();
            n = w.position();
        }
        let mut r = BufReader::new(&buf[..n]);
        let (msg, sock) = parse(&mut r).unwrap();
        match msg {
            CpfMessage::Unconnected { data } => assert_eq!(data, &[0x0E, 0x01]),
            _ => panic!("expected unconnected"),
        }
        assert!(sock.originator_to_target.is_none());
    }

    #[test]
    fn parse_connected_message_extracts_sequence_number() {
        let mut buf = [0u8; 32];
        let n;
        {
            let mut w = BufWriter::new(&mut buf);
            write_connected(&mut w, 0x1234_5678, 7, &[0xAB]).unwrap();
            n = w.position();
        }
        let mut r = BufReader::new(&buf[..n]);
        let (msg, _) = parse(&mut r).unwrap();
        match msg {
            CpfMessage::Connected {
                connection_id,
                sequence_number,
                data,
            } => {
                assert_eq!(connection_id, 0x1234_5678);
                assert_eq!(sequence_number, 7);
                assert_eq!(data, &[0xAB]);
            }
            _ => panic!("expected connected"),
        }
    }

    #[test]
    fn mismatched_item_type_pairing_is_rejected() {
        let mut buf = [0u8; 32];
        let n;
        {
            let mut w = BufWriter::new(&mut buf);
            w.put_u16_le(2).unwrap();
            w.put_u16_le(TYPE_NULL_ADDRESS).unwrap();
            w.put_u16_le(0).unwrap();
            w.put_u16_le(TYPE_CONNECTED_DATA).unwrap();
            w.put_u16_le(2).unwrap();
            w.put_u16_le(0).unwrap();
            n = w.position();
        }
        let mut r = BufReader::new(&buf[..n]);
        assert!(parse(&mut r).is_err());
    }
}
