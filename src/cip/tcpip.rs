//! TCP/IP Interface Object (class 0xF5), §4.F. Exposes the attributes
//! collaborators may persist (§6): interface configuration, hostname,
//! multicast TTL, and the inactivity timeout that governs idle explicit
//! sessions (§5).

use crate::cip::class::{AttrValue, Attribute, CipClass, Instance};

pub const CLASS_ID: u32 = 0xF5;
pub const INSTANCE_ID: u32 = 1;

#[derive(Debug, Clone)]
pub struct TcpIpConfig {
    pub ip: std::net::Ipv4Addr,
    pub netmask: std::net::Ipv4Addr,
    pub gateway: std::net::Ipv4Addr,
    pub hostname: String,
    pub ttl_value: u8,
    pub inactivity_timeout_secs: u32,
}

impl Default for TcpIpConfig {
    fn default() -> Self {
        TcpIpConfig {
            ip: std::net::Ipv4Addr::UNSPECIFIED,
            netmask: std::net::Ipv4Addr::UNSPECIFIED,
            gateway: std::net::Ipv4Addr::UNSPECIFIED,
            hostname: String::new(),
            ttl_value: 1,
            inactivity_timeout_secs: 120,
        }
    }
}

pub fn build_class(config: &TcpIpConfig) -> CipClass {
    let mut class = CipClass::new(CLASS_ID, "TCP/IP Interface", 4, CipClass::ATTR_REVISION);

    let mut instance = Instance::new(INSTANCE_ID, CLASS_ID);
    instance
        .attributes
        .insert(Attribute::get_only(1, AttrValue::Dword(0)));
    instance
        .attributes
        .insert(Attribute::get_only(2, AttrValue::Dword(1))); // configuration_capability: BOOTP-capable bit only
    instance
        .attributes
        .insert(Attribute::get_set(3, AttrValue::Dword(0))); // configuration_control
    instance
        .attributes
        .insert(Attribute::get_only(4, AttrValue::Udint(0))); // physical_link_object EPATH, encoded elsewhere
    instance.attributes.insert(Attribute::get_set(
        5,
        AttrValue::Udint(u32::from(config.ip)),
    ));
    instance.attributes.insert(Attribute::get_set(
        6,
        AttrValue::ShortString(config.hostname.clone()),
    ));
    instance
        .attributes
        .insert(Attribute::get_set(8, AttrValue::Usint(config.ttl_value)));
    instance.attributes.insert(Attribute::get_set(
        13,
        AttrValue::Udint(config.inactivity_timeout_secs),
    ));

    class.insert_instance(instance).expect("fresh class has no instance 1 yet");
    class
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_attribute_is_settable() {
        let mut class = build_class(&TcpIpConfig::default());
        let instance = class.instance_mut(INSTANCE_ID).unwrap();
        crate::cip::class::set_attribute_single(instance, 8, AttrValue::Usint(16)).unwrap();
        assert_eq!(instance.attributes.get(8).unwrap().value, AttrValue::Usint(16));
    }
}
