//! Error taxonomy for the adapter: transport (encapsulation), general (CIP),
//! and extended (Connection Manager) status layers, unified behind one
//! `thiserror`-derived enum so every fallible call in the protocol engine
//! returns a single `Result` type.

use thiserror::Error;

/// Encapsulation-layer status, carried in the 4-byte `status` field of the
/// ENIP header (Vol2 Table 2-3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EncapsulationStatus {
    Success = 0x0000,
    InvalidCommand = 0x0001,
    InsufficientMemory = 0x0002,
    IncorrectData = 0x0003,
    InvalidSession = 0x0064,
    InvalidLength = 0x0065,
    UnsupportedProtocol = 0x0069,
}

/// CIP general status, the single status byte in a message router response
/// (Vol1 Appendix B).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GeneralStatus {
    Success = 0x00,
    ConnectionFailure = 0x01,
    ResourceUnavailable = 0x02,
    InvalidParameterValue = 0x03,
    PathSegmentError = 0x04,
    PathDestinationUnknown = 0x05,
    PartialTransfer = 0x06,
    ConnectionLost = 0x07,
    ServiceNotSupported = 0x08,
    InvalidAttributeValue = 0x09,
    AttributeListError = 0x0A,
    AlreadyInRequestedMode = 0x0B,
    ObjectStateConflict = 0x0C,
    ObjectAlreadyExists = 0x0D,
    AttributeNotSettable = 0x0E,
    PrivilegeViolation = 0x0F,
    DeviceStateConflict = 0x10,
    ReplyDataTooLarge = 0x11,
    FragmentationOfPrimitiveValue = 0x12,
    NotEnoughData = 0x13,
    AttributeNotSupported = 0x14,
    TooMuchData = 0x15,
    ObjectDoesNotExist = 0x16,
    ServiceFragmentationOutOfSequence = 0x17,
    NoStoredAttributeData = 0x18,
    StoreOperationFailure = 0x19,
    RoutingFailureRequestTooLarge = 0x1A,
    RoutingFailureResponseTooLarge = 0x1B,
    MissingAttributeListEntryData = 0x1C,
    InvalidAttributeValueList = 0x1D,
    EmbeddedServiceError = 0x1E,
    VendorSpecificError = 0x1F,
    InvalidParameter = 0x20,
    WriteOnceValueOrMediumAlreadyWritten = 0x21,
    InvalidReplyReceived = 0x22,
    KeyFailureInPath = 0x25,
    PathSizeInvalid = 0x26,
    UnexpectedAttributeInList = 0x27,
    InvalidMemberId = 0x28,
    MemberNotSettable = 0x29,
    GroupToLarge = 0x2A,
    ConnectionManagerInUse = 0x2B,
}

/// Connection Manager extended status (Vol1 Table 3-5.8), a status code
/// optionally followed by further u16 words of detail (e.g. the lowest
/// acceptable RPI as a UDINT), carried alongside `general_status ==
/// ConnectionFailure` for any connection-manager-originated failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ConnMgrStatus {
    ConnectionInUse = 0x0100,
    TransportTriggerNotSupported = 0x0103,
    OwnershipConflict = 0x0106,
    ConnectionNotFoundAtTargetApplication = 0x0107,
    InvalidNetworkConnectionParameter = 0x0108,
    InvalidConnectionSize = 0x0109,
    TargetForConnectionNotConfigured = 0x0110,
    RpiNotSupported = 0x0111,
    RpiValuesNotAcceptable = 0x0112,
    NoMoreConnectionsAvailable = 0x0113,
    VendorIdOrProductCodeError = 0x0114,
    DeviceTypeError = 0x0115,
    RevisionMismatch = 0x0116,
    InvalidProducingOrConsumingApplicationPath = 0x0117,
    InvalidConfigurationApplicationPath = 0x0118,
    InconsistentApplicationPathCombo = 0x011A,
    InvalidOToTConnectionSize = 0x0127,
    InvalidTToOConnectionSize = 0x0128,
}

/// Unified crate error type. Every variant carries enough context to map
/// back onto one of the three wire-status layers via [`CipError::general_status`]
/// and [`CipError::extended_status_words`].
#[derive(Debug, Error)]
pub enum CipError {
    #[error("not enough data to satisfy the request")]
    NotEnoughData,
    #[error("more data supplied than the operation accepts")]
    TooMuchData,
    #[error("malformed path segment")]
    PathSegmentError,
    #[error("path does not resolve to a known class or instance")]
    PathDestinationUnknown,
    #[error("object (class or instance) does not exist")]
    ObjectDoesNotExist,
    #[error("service not supported by target object")]
    ServiceNotSupported,
    #[error("attribute not supported")]
    AttributeNotSupported,
    #[error("attribute is not gettable")]
    AttributeNotGettable,
    #[error("attribute is not settable")]
    AttributeNotSettable,
    #[error("invalid attribute value")]
    InvalidAttributeValue,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("device state conflict")]
    DeviceStateConflict,
    #[error("connection failure")]
    ConnectionFailure,
    #[error("resource unavailable")]
    ResourceUnavailable,
    #[error("connection manager error: {0:?}")]
    ConnMgr(ConnMgrStatus),
    #[error("requested RPI not in supported range, lowest acceptable is {0} usecs")]
    RpiNotAcceptable(u32),
    #[error("invalid encapsulation command")]
    InvalidCommand,
    #[error("invalid or unregistered session")]
    InvalidSession,
    #[error("unsupported encapsulation protocol version")]
    UnsupportedProtocol,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CipError {
    /// The CIP general status byte this error maps to.
    pub fn general_status(&self) -> GeneralStatus {
        use CipError::*;
        match self {
            NotEnoughData => GeneralStatus::NotEnoughData,
            TooMuchData => GeneralStatus::TooMuchData,
            PathSegmentError => GeneralStatus::PathSegmentError,
            PathDestinationUnknown => GeneralStatus::PathDestinationUnknown,
            ObjectDoesNotExist => GeneralStatus::ObjectDoesNotExist,
            ServiceNotSupported => GeneralStatus::ServiceNotSupported,
            AttributeNotSupported => GeneralStatus::AttributeNotSupported,
            AttributeNotGettable => GeneralStatus::AttributeNotSupported,
            AttributeNotSettable => GeneralStatus::AttributeNotSettable,
            InvalidAttributeValue => GeneralStatus::InvalidAttributeValue,
            InvalidParameter => GeneralStatus::InvalidParameter,
            DeviceStateConflict => GeneralStatus::DeviceStateConflict,
            ConnectionFailure => GeneralStatus::ConnectionFailure,
            ResourceUnavailable => GeneralStatus::ResourceUnavailable,
            ConnMgr(_) | RpiNotAcceptable(_) => GeneralStatus::ConnectionFailure,
            InvalidCommand | InvalidSession | UnsupportedProtocol | Io(_) => {
                GeneralStatus::ServiceNotSupported
            }
        }
    }

    /// Extended status words, if this error carries connection-manager
    /// detail. `RpiNotAcceptable` additionally echoes the lowest acceptable
    /// RPI (Vol1 Table 3-5.8) as a UDINT split across two little-endian words.
    pub fn extended_status_words(&self) -> Vec<u16> {
        match self {
            CipError::ConnMgr(status) => vec![*status as u16],
            CipError::RpiNotAcceptable(min_usecs) => vec![
                ConnMgrStatus::RpiValuesNotAcceptable as u16,
                (*min_usecs & 0xFFFF) as u16,
                (*min_usecs >> 16) as u16,
            ],
            _ => Vec::new(),
        }
    }

    /// The encapsulation-layer status this error maps to, for errors that
    /// originate below the message router (session/command handling).
    pub fn encapsulation_status(&self) -> EncapsulationStatus {
        match self {
            CipError::InvalidCommand => EncapsulationStatus::InvalidCommand,
            CipError::InvalidSession => EncapsulationStatus::InvalidSession,
            CipError::UnsupportedProtocol => EncapsulationStatus::UnsupportedProtocol,
            CipError::NotEnoughData => EncapsulationStatus::IncorrectData,
            _ => EncapsulationStatus::Success,
        }
    }
}

pub type Result<T> = std::result::Result<T, CipError>;
