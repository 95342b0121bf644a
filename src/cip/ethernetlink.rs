//! Ethernet Link Object (class 0xF6), §4.F. Read-only link-state
//! reporting: speed, duplex/link-status flags, and the physical (MAC)
//! address.

use crate::cip::class::{AttrValue, Attribute, CipClass, Instance};

pub const CLASS_ID: u32 = 0xF6;
pub const INSTANCE_ID: u32 = 1;

pub const FLAG_LINK_UP: u32 = 1 << 0;
pub const FLAG_FULL_DUPLEX: u32 = 1 << 1;

#[derive(Debug, Clone)]
pub struct EthernetLinkConfig {
    pub interface_speed_mbps: u32,
    pub flags: u32,
    pub mac_address: [u8; 6],
}

impl Default for EthernetLinkConfig {
    fn default() -> Self {
        EthernetLinkConfig {
            interface_speed_mbps: 100,
            flags: FLAG_LINK_UP | FLAG_FULL_DUPLEX,
            mac_address: [0; 6],
        }
    }
}

pub fn build_class(config: &EthernetLinkConfig) -> CipClass {
    let mut class = CipClass::new(CLASS_ID, "Ethernet Link", 4, CipClass::ATTR_REVISION);

    let mut instance = Instance::new(INSTANCE_ID, CLASS_ID);
    instance.attributes.insert(Attribute::get_only(
        1,
        AttrValue::Udint(config.interface_speed_mbps),
    ));
    instance
        .attributes
        .insert(Attribute::get_only(2, AttrValue::Dword(config.flags)));
    instance
        .attributes
        .insert(Attribute::get_only(3, AttrValue::Mac(config.mac_address)));

    class.insert_instance(instance).expect("fresh class has no instance 1 yet");
    class
}
