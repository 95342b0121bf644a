//! Identity Object (class 0x01), §4.F. Grounded in CIPster's
//! `cipidentity.cc`: seven read-only instance attributes, and a `Reset`
//! service whose every reboot-triggering branch answers
//! `DeviceStateConflict` before invoking the collaborator's reset hook,
//! since the device is about to become unavailable and cannot truthfully
//! report success.

use crate::cip::class::{AttrValue, Attribute, CipClass, Instance};
use crate::error::{CipError, Result};
use crate::hooks::AdapterHooks;

pub const CLASS_ID: u32 = 0x01;
pub const INSTANCE_ID: u32 = 1;
pub const SERVICE_RESET: u8 = 0x05;

/// Static device identity values, sourced from [`crate::config::AdapterConfig`].
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub device_type: u16,
    pub product_code: u16,
    pub major_revision: u8,
    pub minor_revision: u8,
    pub serial_number: u32,
    pub product_name: String,
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        DeviceIdentity {
            vendor_id: 0,
            device_type: 0,
            product_code: 0,
            major_revision: 1,
            minor_revision: 1,
            serial_number: 0,
            product_name: "Generic EtherNet/IP Adapter".to_string(),
        }
    }
}

/// Builds the Identity class with its single instance populated from
/// `identity`. Class attribute 3 (number of instances) is deliberately
/// excluded from the class-level mask, matching CIPster's
/// `CipIdentityInit` `MASK6(1,2,4,5,6,7)`.
pub fn build_class(identity: &DeviceIdentity) -> CipClass {
    let std_attrs = CipClass::ATTR_REVISION
        | CipClass::ATTR_MAX_INSTANCE
        | CipClass::ATTR_OPTIONAL_ATTR_LIST
        | CipClass::ATTR_OPTIONAL_SERVICE_LIST
        | CipClass::ATTR_MAX_CLASS_ATTR
        | CipClass::ATTR_MAX_INSTANCE_ATTR;

    let mut class = CipClass::new(CLASS_ID, "Identity", 1, std_attrs);

    let mut instance = Instance::new(INSTANCE_ID, CLASS_ID);
    instance
        .attributes
        .insert(Attribute::get_only(1, AttrValue::Uint(identity.vendor_id)));
    instance
        .attributes
        .insert(Attribute::get_only(2, AttrValue::Uint(identity.device_type)));
    instance.attributes.insert(Attribute::get_only(
        3,
        AttrValue::Uint(identity.product_code),
    ));
    instance.attributes.insert(Attribute::get_only(
        4,
        AttrValue::Revision(identity.major_revision, identity.minor_revision),
    ));
    instance
        .attributes
        .insert(Attribute::get_only(5, AttrValue::Word(0)));
    instance.attributes.insert(Attribute::get_only(
        6,
        AttrValue::Udint(identity.serial_number),
    ));
    instance.attributes.insert(Attribute::get_only(
        7,
        AttrValue::ShortString(identity.product_name.clone()),
    ));

    class.insert_instance(instance).expect("fresh class has no instance 1 yet");
    class
}

/// Reset type carried in the first data byte of a `Reset` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetType {
    Default,
    PowerCycle,
    ToInitialConfiguration,
}

impl ResetType {
    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(ResetType::Default),
            1 => Ok(ResetType::PowerCycle),
            2 => Ok(ResetType::ToInitialConfiguration),
            _ => Err(CipError::InvalidParameter),
        }
    }
}

/// Dispatches the `Reset` service (0x05). Every branch that actually
/// triggers a reboot reports `DeviceStateConflict`: the request is
/// genuinely accepted, but the device cannot send a "success" reply from
/// a state it is about to leave.
pub async fn reset_service(data: &[u8], hooks: &dyn AdapterHooks) -> Result<()> {
    let reset_type = ResetType::from_byte(data.first().copied().unwrap_or(0))?;
    match reset_type {
        ResetType::Default | ResetType::PowerCycle => {
            hooks.reset_device().await;
        }
        ResetType::ToInitialConfiguration => {
            hooks.reset_device_to_initial_configuration(true).await;
        }
    }
    Err(CipError::DeviceStateConflict)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_attribute_3_excluded_from_class_getable_all_mask() {
        let class = build_class(&DeviceIdentity::default());
        // class attribute 3 ("number of instances") must not be registered
        // as part of the class attribute table per CipIdentityInit's MASK6.
        assert!(class.class_attributes.get(3).is_none());
    }

    #[test]
    fn reset_out_of_range_type_is_invalid_parameter() {
        assert!(matches!(
            ResetType::from_byte(9),
            Err(CipError::InvalidParameter)
        ));
    }

    #[tokio::test]
    async fn reset_always_reports_device_state_conflict() {
        let hooks = crate::hooks::NullHooks;
        let err = reset_service(&[0], &hooks).await.unwrap_err();
        assert!(matches!(err, CipError::DeviceStateConflict));
    }
}
