//! CIP EPATH codec (CIP Vol1 Appendix C-1): application paths, port
//! segments, electronic keys, network (PIT) segments, and the simple data
//! segment. Modeled on CIPster's `cipepath.h`/`cipepath.cc`, reworked as a
//! `Result`-returning codec over owned field values instead of a bitmask
//! over an inline C array.

use crate::bytebuf::{BufReader, BufWriter};
use crate::error::{CipError, ConnMgrStatus, Result};

pub const ASSEMBLY_CLASS_CODE: u32 = 0x04;
const MAX_TAG_LEN: usize = 41;

/// Selects between the padded (pad byte after 16/32-bit logical segment
/// headers) and packed (no pad byte) EPATH encoding flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathFlavor {
    Padded,
    Packed,
}

/// Suppresses emission of a segment that a preceding compacted path
/// already established, mirroring the source's `OMIT_*` control flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OmitFlags(u8);

impl OmitFlags {
    pub const OMIT_CLASS: OmitFlags = OmitFlags(1 << 0);
    pub const OMIT_INSTANCE: OmitFlags = OmitFlags(1 << 1);
    pub const OMIT_CONN_PT: OmitFlags = OmitFlags(1 << 2);

    pub const fn empty() -> Self {
        OmitFlags(0)
    }

    pub fn contains(&self, flag: OmitFlags) -> bool {
        self.0 & flag.0 != 0
    }
}

impl std::ops::BitOr for OmitFlags {
    type Output = OmitFlags;
    fn bitor(self, rhs: OmitFlags) -> OmitFlags {
        OmitFlags(self.0 | rhs.0)
    }
}

/// Rank of a logical field in the C-1.6 hierarchy; higher outranks lower.
/// Segments at or above the highest rank seen so far in the current path
/// terminate that path (it becomes the start of the next one).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Rank {
    Attribute = 0,
    ConnPt = 1,
    Instance = 2,
    Class = 3,
}

/// A decoded CIP application path: the addressing of a class, optionally an
/// instance/connection-point, attribute, and (for symbolic addressing) a
/// tag name plus up to three array-member subscripts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CipAppPath {
    pub class: Option<u32>,
    pub instance: Option<u32>,
    pub attribute: Option<u32>,
    pub conn_pt: Option<u32>,
    pub tag: Option<String>,
    pub member1: Option<u32>,
    pub member2: Option<u32>,
    pub member3: Option<u32>,
}

impl CipAppPath {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_assembly(&self) -> bool {
        self.class == Some(ASSEMBLY_CLASS_CODE)
    }

    /// True once enough fields are present to resolve a target object:
    /// class + instance for ordinary classes, class + (instance or
    /// connection-point) for Assembly.
    pub fn is_sufficient(&self) -> bool {
        if self.class.is_none() {
            return false;
        }
        if self.is_assembly() {
            self.instance.is_some() || self.conn_pt.is_some()
        } else {
            self.instance.is_some()
        }
    }

    /// Assembly class overloads "instance" and "connection point" as the
    /// same addressing dimension; this hides that ambiguity for callers
    /// that just want "the instance-like id".
    pub fn instance_or_conn_pt(&self) -> Option<u32> {
        if self.is_assembly() {
            self.instance.or(self.conn_pt)
        } else {
            self.instance
        }
    }

    fn highest_rank(&self) -> Option<Rank> {
        if self.class.is_some() {
            Some(Rank::Class)
        } else if self.instance.is_some() {
            Some(Rank::Instance)
        } else if self.conn_pt.is_some() {
            Some(Rank::ConnPt)
        } else if self.attribute.is_some() {
            Some(Rank::Attribute)
        } else {
            None
        }
    }

    /// C-1.6: copy ranks higher than `up_to_and_including` from `from` into
    /// `self`, for fields this path did not itself specify. The Assembly
    /// exception: a path that began with INSTANCE never inherits INSTANCE
    /// from its predecessor (it already made its own instance-vs-conn_pt
    /// choice).
    fn inherit(&mut self, from: &CipAppPath, started_with_instance: bool) {
        if self.class.is_none() {
            self.class = from.class;
        }
        if self.is_assembly() && started_with_instance {
            // Assembly exception: do not inherit instance into a path that
            // explicitly began with its own instance/conn_pt segment.
            return;
        }
        if self.instance.is_none() && self.conn_pt.is_none() {
            self.instance = from.instance;
            self.conn_pt = from.conn_pt;
        }
    }

    /// Serializes this path per the grammar on Vol1 page C-17: symbolic
    /// form if a tag is present, Assembly form (instance XOR conn_pt) if
    /// class == 4, generic form otherwise.
    pub fn serialize(&self, out: &mut BufWriter, flavor: PathFlavor, omit: OmitFlags) -> Result<()> {
        if let Some(tag) = &self.tag {
            self.serialize_symbolic(out, flavor, tag)?;
            if !omit.contains(OmitFlags::OMIT_CONN_PT) {
                if let Some(cp) = self.conn_pt {
                    serialize_logical(out, 0x2C, cp, flavor)?;
                }
            }
            for member in [self.member1, self.member2, self.member3] {
                if let Some(m) = member {
                    serialize_logical(out, 0x28, m, flavor)?;
                }
            }
            return Ok(());
        }

        if !omit.contains(OmitFlags::OMIT_CLASS) {
            if let Some(c) = self.class {
                serialize_logical(out, 0x20, c, flavor)?;
            }
        }

        if self.is_assembly() {
            if !omit.contains(OmitFlags::OMIT_INSTANCE) {
                if let Some(i) = self.instance {
                    serialize_logical(out, 0x24, i, flavor)?;
                } else if !omit.contains(OmitFlags::OMIT_CONN_PT) {
                    if let Some(cp) = self.conn_pt {
                        serialize_logical(out, 0x2C, cp, flavor)?;
                    }
                }
            }
            if let Some(a) = self.attribute {
                serialize_logical(out, 0x30, a, flavor)?;
            }
            return Ok(());
        }

        if !omit.contains(OmitFlags::OMIT_INSTANCE) {
            if let Some(i) = self.instance {
                serialize_logical(out, 0x24, i, flavor)?;
            }
        }
        if let Some(a) = self.attribute {
            serialize_logical(out, 0x30, a, flavor)?;
        } else if !omit.contains(OmitFlags::OMIT_CONN_PT) {
            if let Some(cp) = self.conn_pt {
                serialize_logical(out, 0x2C, cp, flavor)?;
            }
        }
        Ok(())
    }

    fn serialize_symbolic(&self, out: &mut BufWriter, flavor: PathFlavor, tag: &str) -> Result<()> {
        if tag.len() > MAX_TAG_LEN {
            return Err(CipError::PathSegmentError);
        }
        out.put_u8(0x91)?;
        out.put_u8(tag.len() as u8)?;
        out.put_bytes(tag.as_bytes())?;
        if matches!(flavor, PathFlavor::Padded) && tag.len() % 2 == 1 {
            out.put_u8(0)?;
        }
        Ok(())
    }

    /// Decodes a sequence of application-path segments starting at the
    /// front of `input`, stopping at the first byte that is not a logical,
    /// symbolic, or member segment, or at a hierarchy descent (C-1.6).
    /// `previous` supplies ranks to inherit when this path terminates
    /// without re-specifying them.
    pub fn deserialize(
        input: &mut BufReader,
        flavor: PathFlavor,
        previous: Option<&CipAppPath>,
    ) -> Result<Self> {
        let mut path = CipAppPath::new();
        let mut highest_seen: Option<Rank> = None;
        let mut started_with_instance = false;

        loop {
            let remaining = input.as_slice();
            let Some(&header) = remaining.first() else {
                break;
            };

            if header == 0x91 {
                // Symbolic segment never mixes with logical rank tracking;
                // it is always path-leading in practice.
                input.get_u8()?;
                let len = input.get_u8()? as usize;
                if len > MAX_TAG_LEN {
                    return Err(CipError::PathSegmentError);
                }
                let bytes = input.get_bytes(len)?;
                path.tag = Some(String::from_utf8_lossy(bytes).into_owned());
                if matches!(flavor, PathFlavor::Padded) && len % 2 == 1 {
                    input.get_u8()?;
                }
                continue;
            }

            if header == 0x28 {
                input.get_u8()?;
                let m = deserialize_value(input, header, flavor)?;
                if path.member1.is_none() {
                    path.member1 = Some(m);
                } else if path.member2.is_none() {
                    path.member2 = Some(m);
                } else if path.member3.is_none() {
                    path.member3 = Some(m);
                } else {
                    return Err(CipError::PathSegmentError);
                }
                continue;
            }

            let kind = header & 0xE0;
            let rank = match kind {
                0x20 => Rank::Class,
                0x24 => Rank::Instance,
                0x30 => Rank::Attribute,
                0x2C => Rank::ConnPt,
                _ => break, // not an application-path segment; stop here
            };

            if let Some(h) = highest_seen {
                let is_assembly_exception =
                    path.is_assembly() && h == Rank::Instance && rank == Rank::ConnPt;
                if rank >= h && !is_assembly_exception {
                    break;
                }
            }

            input.get_u8()?;
            let value = deserialize_value(input, header, flavor)?;

            match kind {
                0x20 => path.class = Some(value),
                0x24 => {
                    path.instance = Some(value);
                    started_with_instance = true;
                }
                0x30 => path.attribute = Some(value),
                0x2C => path.conn_pt = Some(value),
                _ => unreachable!(),
            }

            highest_seen = Some(rank);
        }

        if let Some(prev) = previous {
            path.inherit(prev, started_with_instance);
        }

        Ok(path)
    }
}

fn serialize_logical(out: &mut BufWriter, kind: u8, value: u32, flavor: PathFlavor) -> Result<()> {
    if value <= 0xFF {
        out.put_u8(kind)?;
        out.put_u8(value as u8)?;
    } else if value <= 0xFFFF {
        out.put_u8(kind | 0x01)?;
        if matches!(flavor, PathFlavor::Padded) {
            out.put_u8(0)?;
        }
        out.put_u16_le(value as u16)?;
    } else {
        out.put_u8(kind | 0x02)?;
        if matches!(flavor, PathFlavor::Padded) {
            out.put_u8(0)?;
        }
        out.put_u32_le(value)?;
    }
    Ok(())
}

fn deserialize_value(input: &mut BufReader, header: u8, flavor: PathFlavor) -> Result<u32> {
    match header & 0x03 {
        0 => Ok(input.get_u8()? as u32),
        1 => {
            if matches!(flavor, PathFlavor::Padded) {
                input.get_u8()?;
            }
            Ok(input.get_u16_le()? as u32)
        }
        2 => {
            if matches!(flavor, PathFlavor::Padded) {
                input.get_u8()?;
            }
            Ok(input.get_u32_le()?)
        }
        _ => Err(CipError::PathSegmentError),
    }
}

/// Fixed 10-byte electronic key segment: `0x34 0x04 vendor device product
/// major minor`, with the top bit of `major` as the compatibility flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectronicKey {
    pub vendor_id: u16,
    pub device_type: u16,
    pub product_code: u16,
    pub major_revision: u8,
    pub minor_revision: u8,
}

impl ElectronicKey {
    pub fn is_compatibility_mode(&self) -> bool {
        self.major_revision & 0x80 != 0
    }

    pub fn major(&self) -> u8 {
        self.major_revision & 0x7F
    }

    pub fn serialize(&self, out: &mut BufWriter) -> Result<()> {
        out.put_u8(0x34)?;
        out.put_u8(0x04)?;
        out.put_u16_le(self.vendor_id)?;
        out.put_u16_le(self.device_type)?;
        out.put_u16_le(self.product_code)?;
        out.put_u8(self.major_revision)?;
        out.put_u8(self.minor_revision)?;
        Ok(())
    }

    pub fn deserialize(input: &mut BufReader) -> Result<Self> {
        let format = input.get_u8()?;
        if format != 0x04 {
            return Err(CipError::PathSegmentError);
        }
        Ok(ElectronicKey {
            vendor_id: input.get_u16_le()?,
            device_type: input.get_u16_le()?,
            product_code: input.get_u16_le()?,
            major_revision: input.get_u8()?,
            minor_revision: input.get_u8()?,
        })
    }

    /// Checks a requested key against a device's actual identity. `zero`
    /// fields in the request act as wildcards. Non-compatibility mode
    /// requires exact match on whichever of major/minor are non-zero;
    /// compatibility mode requires an exact major match and a minor that is
    /// non-zero and no greater than the device's.
    pub fn check(
        &self,
        device_vendor: u16,
        device_device_type: u16,
        device_product: u16,
        device_major: u8,
        device_minor: u8,
    ) -> std::result::Result<(), ConnMgrStatus> {
        if (self.vendor_id != 0 && self.vendor_id != device_vendor)
            || (self.product_code != 0 && self.product_code != device_product)
        {
            return Err(ConnMgrStatus::VendorIdOrProductCodeError);
        }
        if self.device_type != 0 && self.device_type != device_device_type {
            return Err(ConnMgrStatus::DeviceTypeError);
        }

        if self.is_compatibility_mode() {
            if self.major() != device_major {
                return Err(ConnMgrStatus::RevisionMismatch);
            }
            if self.minor_revision == 0 || self.minor_revision > device_minor {
                return Err(ConnMgrStatus::RevisionMismatch);
            }
        } else {
            if self.major() != 0 && self.major() != device_major {
                return Err(ConnMgrStatus::RevisionMismatch);
            }
            if self.minor_revision != 0 && self.minor_revision != device_minor {
                return Err(ConnMgrStatus::RevisionMismatch);
            }
        }
        Ok(())
    }
}

/// A port segment: a backplane/network port number plus a variable-length
/// link address, used to route a path across a CIP router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSegment {
    pub port: u16,
    pub link_address: Vec<u8>,
}

impl PortSegment {
    pub fn serialize(&self, out: &mut BufWriter) -> Result<()> {
        if self.link_address.len() > 255 {
            return Err(CipError::PathSegmentError);
        }
        let extended_link = self.link_address.len() > 1;
        let mut header = if extended_link { 0x10 } else { 0 };
        if self.port <= 14 {
            header |= self.port as u8;
            out.put_u8(header)?;
        } else {
            header |= 0x0F;
            out.put_u8(header)?;
            out.put_u16_le(self.port)?;
        }
        if extended_link {
            out.put_u8(self.link_address.len() as u8)?;
        }
        out.put_bytes(&self.link_address)?;
        if self.link_address.len() % 2 == 1 && extended_link {
            out.put_u8(0)?;
        }
        Ok(())
    }

    pub fn deserialize(input: &mut BufReader) -> Result<Self> {
        let header = input.get_u8()?;
        let extended_link = header & 0x10 != 0;
        let port_field = header & 0x0F;
        let port = if port_field == 0x0F {
            input.get_u16_le()?
        } else {
            port_field as u16
        };
        let link_len = if extended_link {
            input.get_u8()? as usize
        } else {
            1
        };
        let link_address = input.get_bytes(link_len)?.to_vec();
        if extended_link && link_len % 2 == 1 {
            input.get_u8()?;
        }
        Ok(PortSegment { port, link_address })
    }
}

/// Production Inhibit Time, stored internally in microseconds regardless of
/// whether it arrived as a PIT-msecs (`0x43`) or PIT-usecs (`0x51`) segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProductionInhibitTime {
    pub usecs: u32,
}

impl ProductionInhibitTime {
    pub fn deserialize_msecs(input: &mut BufReader) -> Result<Self> {
        let ms = input.get_u8()?;
        Ok(ProductionInhibitTime {
            usecs: ms as u32 * 1000,
        })
    }

    pub fn deserialize_usecs(input: &mut BufReader) -> Result<Self> {
        let nwords = input.get_u8()?;
        let usecs = match nwords {
            1 => input.get_u16_le()? as u32,
            2 => input.get_u32_le()?,
            _ => return Err(CipError::PathSegmentError),
        };
        Ok(ProductionInhibitTime { usecs })
    }
}

/// Simple data segment (`0x80 <word_count> <u16...>`), an opaque word array
/// sometimes carried alongside a port/key sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimpleDataSegment {
    pub words: Vec<u16>,
}

impl SimpleDataSegment {
    pub fn serialize(&self, out: &mut BufWriter) -> Result<()> {
        out.put_u8(0x80)?;
        out.put_u8(self.words.len() as u8)?;
        for w in &self.words {
            out.put_u16_le(*w)?;
        }
        Ok(())
    }

    pub fn deserialize(input: &mut BufReader) -> Result<Self> {
        let _header = input.get_u8()?; // caller already peeked 0x80
        let count = input.get_u8()? as usize;
        let mut words = Vec::with_capacity(count);
        for _ in 0..count {
            words.push(input.get_u16_le()?);
        }
        Ok(SimpleDataSegment { words })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(path: &CipAppPath, flavor: PathFlavor) -> CipAppPath {
        let mut buf = [0u8; 64];
        let n;
        {
            let mut w = BufWriter::new(&mut buf);
            path.serialize(&mut w, flavor, OmitFlags::empty()).unwrap();
            n = w.position();
        }
        let mut r = BufReader::new(&buf[..n]);
        CipAppPath::deserialize(&mut r, flavor, None).unwrap()
    }

    #[test]
    fn generic_path_round_trips_padded_and_packed() {
        let path = CipAppPath {
            class: Some(6),
            instance: Some(2),
            attribute: Some(1),
            ..Default::default()
        };
        assert_eq!(round_trip(&path, PathFlavor::Padded), path);
        assert_eq!(round_trip(&path, PathFlavor::Packed), path);
    }

    #[test]
    fn large_values_pick_widest_encoding() {
        let path = CipAppPath {
            class: Some(0x1234),
            instance: Some(0x0001_0000),
            ..Default::default()
        };
        assert_eq!(round_trip(&path, PathFlavor::Padded), path);
    }

    #[test]
    fn assembly_path_prefers_instance_over_conn_pt_when_both_absent() {
        let path = CipAppPath {
            class: Some(ASSEMBLY_CLASS_CODE),
            conn_pt: Some(100),
            ..Default::default()
        };
        assert!(path.is_sufficient());
        assert_eq!(path.instance_or_conn_pt(), Some(100));
    }

    #[test]
    fn inheritance_copies_higher_ranked_fields() {
        let p1 = CipAppPath {
            class: Some(6),
            instance: Some(2),
            attribute: Some(1),
            ..Default::default()
        };
        // An encoding with only an attribute segment, decoded in the
        // context of p1, should inherit class and instance.
        let mut buf = [0u8; 8];
        let n;
        {
            let mut w = BufWriter::new(&mut buf);
            serialize_logical(&mut w, 0x30, 9, PathFlavor::Padded).unwrap();
            n = w.position();
        }
        let mut r = BufReader::new(&buf[..n]);
        let p2 = CipAppPath::deserialize(&mut r, PathFlavor::Padded, Some(&p1)).unwrap();
        assert_eq!(p2.class, Some(6));
        assert_eq!(p2.instance, Some(2));
        assert_eq!(p2.attribute, Some(9));
    }

    #[test]
    fn assembly_exception_does_not_inherit_instance_into_conn_pt_path() {
        let p1 = CipAppPath {
            class: Some(ASSEMBLY_CLASS_CODE),
            instance: Some(100),
            ..Default::default()
        };
        let mut buf = [0u8; 8];
        let n;
        {
            let mut w = BufWriter::new(&mut buf);
            // a conn_pt-only segment, following an assembly instance path
            serialize_logical(&mut w, 0x2C, 5, PathFlavor::Padded).unwrap();
            n = w.position();
        }
        let mut r = BufReader::new(&buf[..n]);
        let p2 = CipAppPath::deserialize(&mut r, PathFlavor::Padded, Some(&p1)).unwrap();
        // p2 gets its own conn_pt and inherits class, but NOT p1's instance.
        assert_eq!(p2.class, Some(ASSEMBLY_CLASS_CODE));
        assert_eq!(p2.conn_pt, Some(5));
        assert_eq!(p2.instance, None);
    }

    #[test]
    fn overlong_symbolic_tag_is_rejected() {
        let mut buf = [0u8; 64];
        let long_tag = "x".repeat(MAX_TAG_LEN + 1);
        {
            let mut w = BufWriter::new(&mut buf);
            w.put_u8(0x91).unwrap();
            w.put_u8(long_tag.len() as u8).unwrap();
            w.put_bytes(long_tag.as_bytes()).unwrap();
        }
        let mut r = BufReader::new(&buf);
        let result = CipAppPath::deserialize(&mut r, PathFlavor::Padded, None);
        assert!(matches!(result, Err(CipError::PathSegmentError)));
    }

    #[test]
    fn electronic_key_compatibility_mode() {
        let key = ElectronicKey {
            vendor_id: 10,
            device_type: 20,
            product_code: 30,
            major_revision: 5 | 0x80,
            minor_revision: 3,
        };
        assert!(key.check(10, 20, 30, 5, 4).is_ok());
        assert_eq!(
            key.check(10, 20, 30, 5, 2),
            Err(ConnMgrStatus::RevisionMismatch)
        );
    }

    #[test]
    fn electronic_key_exact_mode_zero_is_wildcard() {
        let key = ElectronicKey {
            vendor_id: 10,
            device_type: 0,
            product_code: 30,
            major_revision: 0,
            minor_revision: 0,
        };
        assert!(key.check(10, 999, 30, 1, 1).is_ok());
    }

    #[test]
    fn port_segment_round_trip_short_and_extended_link() {
        let short = PortSegment {
            port: 1,
            link_address: vec![5],
        };
        let mut buf = [0u8; 16];
        let n;
        {
            let mut w = BufWriter::new(&mut buf);
            short.serialize(&mut w).unwrap();
            n = w.position();
        }
        let mut r = BufReader::new(&buf[..n]);
        assert_eq!(PortSegment::deserialize(&mut r).unwrap(), short);

        let extended = PortSegment {
            port: 2,
            link_address: vec![1, 2, 3],
        };
        let mut buf2 = [0u8; 16];
        let n2;
        {
            let mut w = BufWriter::new(&mut buf2);
            extended.serialize(&mut w).unwrap();
            n2 = w.position();
        }
        let mut r2 = BufReader::new(&buf2[..n2]);
        assert_eq!(PortSegment::deserialize(&mut r2).unwrap(), extended);
    }

    #[test]
    fn pit_msecs_converted_to_usecs() {
        let mut buf = [10u8];
        let mut r = BufReader::new(&mut buf);
        let pit = ProductionInhibitTime::deserialize_msecs(&mut r).unwrap();
        assert_eq!(pit.usecs, 10_000);
    }
}
