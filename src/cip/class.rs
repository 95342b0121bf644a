//! Class/Instance/Attribute registry (§4.D): sorted-by-id containers and
//! the three standard CIP services. Modeled on CIPster's `cipclass.cc` /
//! `cipattribute.cc`, re-architected per the spec's Design Notes: rather
//! than a class being a disguised instance that owns an inverted
//! meta-class, a [`CipClass`] carries two independent, explicitly-named
//! attribute/service surfaces — one for the class itself, one for its
//! instances — so there is no meta-class object to construct or free.

use std::collections::BTreeMap;

use crate::bytebuf::BufWriter;
use crate::error::{CipError, Result};

/// A closed enumeration of the CIP data types this adapter needs to encode.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Bool(bool),
    Byte(u8),
    Word(u16),
    Dword(u32),
    Sint(i8),
    Int(i16),
    Dint(i32),
    Usint(u8),
    Uint(u16),
    Udint(u32),
    /// Major/minor revision pair, CIP's "USINT USINT" pseudo-type.
    Revision(u8, u8),
    /// 6-byte MAC address, CIP's "6USINT" pseudo-type.
    Mac([u8; 6]),
    Real(f32),
    ShortString(String),
    CipString(String),
}

impl AttrValue {
    pub fn encode(&self, out: &mut BufWriter) -> Result<()> {
        match self {
            AttrValue::Bool(v) => out.put_u8(if *v { 1 } else { 0 }),
            AttrValue::Byte(v) => out.put_u8(*v),
            AttrValue::Word(v) => out.put_u16_le(*v),
            AttrValue::Dword(v) => out.put_u32_le(*v),
            AttrValue::Sint(v) => out.put_i8(*v),
            AttrValue::Int(v) => out.put_i16_le(*v),
            AttrValue::Dint(v) => out.put_i32_le(*v),
            AttrValue::Usint(v) => out.put_u8(*v),
            AttrValue::Uint(v) => out.put_u16_le(*v),
            AttrValue::Udint(v) => out.put_u32_le(*v),
            AttrValue::Revision(maj, min) => {
                out.put_u8(*maj)?;
                out.put_u8(*min)
            }
            AttrValue::Mac(bytes) => out.put_bytes(bytes),
            AttrValue::Real(v) => out.put_f32_le(*v),
            AttrValue::ShortString(s) => out.put_short_string(s, false),
            AttrValue::CipString(s) => out.put_string(s, false),
        }
    }
}

/// One attribute of a class or instance: an id, a current value, and
/// gettable/settable/getable-all permissions. The absence of a setter in
/// the source is modeled here as `settable == false` rather than an
/// `Option<fn>`, since every attribute in this adapter stores its value
/// inline rather than indirecting through foreign memory.
#[derive(Debug, Clone)]
pub struct Attribute {
    pub id: u16,
    pub value: AttrValue,
    pub gettable: bool,
    pub settable: bool,
    pub getable_all: bool,
}

impl Attribute {
    pub fn get_only(id: u16, value: AttrValue) -> Self {
        Attribute {
            id,
            value,
            gettable: true,
            settable: false,
            getable_all: true,
        }
    }

    pub fn get_only_excluded_from_all(id: u16, value: AttrValue) -> Self {
        Attribute {
            id,
            value,
            gettable: true,
            settable: false,
            getable_all: false,
        }
    }

    pub fn get_set(id: u16, value: AttrValue) -> Self {
        Attribute {
            id,
            value,
            gettable: true,
            settable: true,
            getable_all: true,
        }
    }
}

/// An ordered (by id) attribute table, shared between class-level and
/// instance-level attribute surfaces.
#[derive(Debug, Clone, Default)]
pub struct AttributeTable {
    attributes: BTreeMap<u16, Attribute>,
}

impl AttributeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, attr: Attribute) {
        self.attributes.insert(attr.id, attr);
    }

    pub fn get(&self, id: u16) -> Option<&Attribute> {
        self.attributes.get(&id)
    }

    pub fn get_mut(&mut self, id: u16) -> Option<&mut Attribute> {
        self.attributes.get_mut(&id)
    }

    pub fn iter_ascending(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.values()
    }

    pub fn largest_id(&self) -> u16 {
        self.attributes.keys().next_back().copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

/// A non-zero-id instance of a class: its own attribute table plus an
/// immutable back-reference to its owning class id, fixed at insertion.
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: u32,
    pub class_id: u32,
    pub attributes: AttributeTable,
}

impl Instance {
    pub fn new(id: u32, class_id: u32) -> Self {
        Instance {
            id,
            class_id,
            attributes: AttributeTable::new(),
        }
    }
}

/// The outcome of a standard service call: either the response buffer was
/// filled and should be sent, or the call failed with a general status
/// (and optional connection-manager extended status, attached by callers
/// that need it).
pub type ServiceResult = Result<usize>;

/// A registered CIP class: identity, a class-level attribute table (the
/// "class attributes" of Vol1 Table 4-4.2 — instance count, largest
/// instance id, and so on), and a sorted set of instances each with their
/// own attribute table. `class_id == 0` is never used; instance id 0
/// always denotes "the class itself" at the message-router level (§4.E).
#[derive(Debug, Clone)]
pub struct CipClass {
    pub class_id: u32,
    pub name: String,
    pub revision: u16,
    pub class_attributes: AttributeTable,
    instances: BTreeMap<u32, Instance>,
}

impl CipClass {
    /// Standard class-attribute mask bits, Vol1 Table 4-4.2. Bit n enables
    /// class attribute n.
    pub const ATTR_REVISION: u8 = 1 << 1;
    pub const ATTR_MAX_INSTANCE: u8 = 1 << 2;
    pub const ATTR_NUM_INSTANCES: u8 = 1 << 3;
    pub const ATTR_OPTIONAL_ATTR_LIST: u8 = 1 << 4;
    pub const ATTR_OPTIONAL_SERVICE_LIST: u8 = 1 << 5;
    pub const ATTR_MAX_CLASS_ATTR: u8 = 1 << 6;
    pub const ATTR_MAX_INSTANCE_ATTR: u8 = 1 << 7;

    pub fn new(class_id: u32, name: impl Into<String>, revision: u16, std_attrs: u8) -> Self {
        let mut class_attributes = AttributeTable::new();
        if std_attrs & Self::ATTR_REVISION != 0 {
            class_attributes.insert(Attribute::get_only(1, AttrValue::Uint(revision)));
        }
        // attrs 2/3/6/7 are computed lazily in `class_attribute_value`
        // because they depend on live instance/attribute counts; they are
        // still registered here so GetAttributeAll/GetAttributeSingle see
        // them as present.
        if std_attrs & Self::ATTR_MAX_INSTANCE != 0 {
            class_attributes.insert(Attribute::get_only(2, AttrValue::Uint(0)));
        }
        if std_attrs & Self::ATTR_NUM_INSTANCES != 0 {
            class_attributes.insert(Attribute::get_only(3, AttrValue::Uint(0)));
        }
        if std_attrs & Self::ATTR_OPTIONAL_ATTR_LIST != 0 {
            class_attributes.insert(Attribute::get_only(4, AttrValue::Uint(0)));
        }
        if std_attrs & Self::ATTR_OPTIONAL_SERVICE_LIST != 0 {
            class_attributes.insert(Attribute::get_only(5, AttrValue::Uint(0)));
        }
        if std_attrs & Self::ATTR_MAX_CLASS_ATTR != 0 {
            class_attributes.insert(Attribute::get_only(6, AttrValue::Uint(0)));
        }
        if std_attrs & Self::ATTR_MAX_INSTANCE_ATTR != 0 {
            class_attributes.insert(Attribute::get_only(7, AttrValue::Uint(0)));
        }

        CipClass {
            class_id,
            name: name.into(),
            revision,
            class_attributes,
            instances: BTreeMap::new(),
        }
    }

    /// Live values for the computed class attributes (2/3/6/7), recomputed
    /// on every read rather than tracked incrementally — mirrors
    /// CIPster's `getInstanceCount`/`getLargestInstanceId`/etc. attribute
    /// functions, which dynamic_cast back onto the class and read its
    /// current containers at call time.
    fn computed_class_attribute(&self, id: u16) -> Option<AttrValue> {
        match id {
            2 => Some(AttrValue::Uint(
                self.instances.keys().next_back().copied().unwrap_or(0) as u16,
            )),
            3 => Some(AttrValue::Uint(self.instances.len() as u16)),
            6 => Some(AttrValue::Uint(self.class_attributes.largest_id())),
            7 => Some(AttrValue::Uint(
                self.instances
                    .values()
                    .map(|i| i.attributes.largest_id())
                    .max()
                    .unwrap_or(0),
            )),
            _ => None,
        }
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Sorted insert; rejects a duplicate id.
    pub fn insert_instance(&mut self, instance: Instance) -> Result<()> {
        if self.instances.contains_key(&instance.id) {
            return Err(CipError::InvalidParameter);
        }
        self.instances.insert(instance.id, instance);
        Ok(())
    }

    pub fn instance(&self, id: u32) -> Option<&Instance> {
        self.instances.get(&id)
    }

    pub fn instance_mut(&mut self, id: u32) -> Option<&mut Instance> {
        self.instances.get_mut(&id)
    }

    pub fn instances_ascending(&self) -> impl Iterator<Item = &Instance> {
        self.instances.values()
    }

    pub fn remove_instance(&mut self, id: u32) -> Option<Instance> {
        self.instances.remove(&id)
    }

    /// *GetAttributeSingle* on a class-level (id 0) target: §4.D.
    pub fn get_class_attribute_single(&self, attr_id: u16, out: &mut BufWriter) -> ServiceResult {
        if let Some(v) = self.computed_class_attribute(attr_id) {
            v.encode(out)?;
            return Ok(out.position());
        }
        let attr = self
            .class_attributes
            .get(attr_id)
            .ok_or(CipError::AttributeNotSupported)?;
        if !attr.gettable {
            return Err(CipError::AttributeNotGettable);
        }
        attr.value.encode(out)?;
        Ok(out.position())
    }

    /// *GetAttributeAll* on a class-level (id 0) target: §4.D.
    pub fn get_class_attribute_all(&self, out: &mut BufWriter) -> ServiceResult {
        let start = out.position();
        for attr in self.class_attributes.iter_ascending() {
            if attr.id < 32 && attr.getable_all {
                let value = self.computed_class_attribute(attr.id).unwrap_or_else(|| attr.value.clone());
                value.encode(out)?;
            }
        }
        Ok(out.position() - start)
    }
}

/// *GetAttributeSingle* on an instance: §4.D.
pub fn get_attribute_single(instance: &Instance, attr_id: u16, out: &mut BufWriter) -> ServiceResult {
    let attr = instance
        .attributes
        .get(attr_id)
        .ok_or(CipError::AttributeNotSupported)?;
    if !attr.gettable {
        return Err(CipError::AttributeNotGettable);
    }
    attr.value.encode(out)?;
    Ok(out.position())
}

/// *GetAttributeAll* on an instance: concatenate every attribute whose id
/// is < 32 and flagged `getable_all`, in ascending id order. A single
/// failed attribute aborts the whole response (§4.D): the only way
/// `get_attribute_single` can fail here is `AttributeNotGettable`, since
/// every attribute iterated is one the instance itself reports.
pub fn get_attribute_all(instance: &Instance, out: &mut BufWriter) -> ServiceResult {
    if instance.attributes.is_empty() {
        return Err(CipError::ServiceNotSupported);
    }
    let start = out.position();
    for attr in instance.attributes.iter_ascending() {
        if attr.id < 32 && attr.getable_all {
            if !attr.gettable {
                return Err(CipError::AttributeNotGettable);
            }
            attr.value.encode(out)?;
        }
    }
    Ok(out.position() - start)
}

/// *SetAttributeSingle* on an instance: §4.D. Decoding a new value from
/// the wire is left to the caller (message router), which knows the
/// attribute's type tag from its current value and hands back the decoded
/// [`AttrValue`] to store.
pub fn set_attribute_single(instance: &mut Instance, attr_id: u16, value: AttrValue) -> Result<()> {
    let attr = instance
        .attributes
        .get_mut(attr_id)
        .ok_or(CipError::AttributeNotSupported)?;
    if !attr.settable {
        return Err(CipError::AttributeNotSettable);
    }
    attr.value = value;
    Ok(())
}

/// The process-wide registry of CIP classes, keyed by class id. Owns every
/// class; there is exactly one per adapter process (§9 Design Notes,
/// Global mutable state).
#[derive(Debug, Clone, Default)]
pub struct ClassRegistry {
    classes: BTreeMap<u32, CipClass>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, class: CipClass) {
        self.classes.insert(class.class_id, class);
    }

    pub fn class(&self, class_id: u32) -> Option<&CipClass> {
        self.classes.get(&class_id)
    }

    pub fn class_mut(&mut self, class_id: u32) -> Option<&mut CipClass> {
        self.classes.get_mut(&class_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_class() -> CipClass {
        let mut class = CipClass::new(
            1,
            "Sample",
            1,
            CipClass::ATTR_REVISION | CipClass::ATTR_NUM_INSTANCES,
        );
        let mut inst = Instance::new(1, 1);
        inst.attributes
            .insert(Attribute::get_only(1, AttrValue::Uint(42)));
        inst.attributes
            .insert(Attribute::get_set(2, AttrValue::Udint(7)));
        class.insert_instance(inst).unwrap();
        class
    }

    #[test]
    fn instances_sorted_and_duplicate_insert_rejected() {
        let mut class = sample_class();
        assert!(class.insert_instance(Instance::new(1, 1)).is_err());
        assert_eq!(class.instance_count(), 1);
    }

    #[test]
    fn get_attribute_single_unknown_attribute_not_supported() {
        let class = sample_class();
        let instance = class.instance(1).unwrap();
        let mut buf = [0u8; 8];
        let mut w = BufWriter::new(&mut buf);
        let err = get_attribute_single(instance, 99, &mut w).unwrap_err();
        assert!(matches!(err, CipError::AttributeNotSupported));
    }

    #[test]
    fn get_attribute_all_concatenates_getable_all_attributes_in_order() {
        let class = sample_class();
        let instance = class.instance(1).unwrap();
        let mut buf = [0u8; 16];
        let mut w = BufWriter::new(&mut buf);
        let n = get_attribute_all(instance, &mut w).unwrap();
        assert_eq!(n, 2 + 4); // Uint + Udint
    }

    #[test]
    fn set_attribute_single_rejects_unsettable_attribute() {
        let mut class = sample_class();
        let instance = class.instance_mut(1).unwrap();
        let err = set_attribute_single(instance, 1, AttrValue::Uint(1)).unwrap_err();
        assert!(matches!(err, CipError::AttributeNotSettable));
        set_attribute_single(instance, 2, AttrValue::Udint(100)).unwrap();
        assert_eq!(instance.attributes.get(2).unwrap().value, AttrValue::Udint(100));
    }

    #[test]
    fn class_attribute_num_instances_is_computed_live() {
        let class = sample_class();
        let mut buf = [0u8; 8];
        let mut w = BufWriter::new(&mut buf);
        class.get_class_attribute_single(3, &mut w).unwrap();
        assert_eq!(buf[..2], [1, 0]); // one instance, u16 LE
    }
}
