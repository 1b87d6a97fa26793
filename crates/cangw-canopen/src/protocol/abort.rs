//! SDO abort codes (CiA 301)

use std::fmt;

/// Abort code sent by a node to refuse an SDO transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdoAbortCode {
    ToggleBitNotAlternated,
    ProtocolTimedOut,
    InvalidCommandSpecifier,
    OutOfMemory,
    UnsupportedAccess,
    ReadOfWriteOnlyObject,
    WriteOfReadOnlyObject,
    ObjectDoesNotExist,
    HardwareError,
    LengthMismatch,
    SubindexDoesNotExist,
    ValueRangeExceeded,
    GeneralError,
    CannotStore,
    CannotStoreLocalControl,
    CannotStoreDeviceState,
    NoObjectDictionary,
    Unknown(u32),
}

impl From<u32> for SdoAbortCode {
    fn from(value: u32) -> Self {
        match value {
            0x0503_0000 => Self::ToggleBitNotAlternated,
            0x0504_0000 => Self::ProtocolTimedOut,
            0x0504_0001 => Self::InvalidCommandSpecifier,
            0x0504_0005 => Self::OutOfMemory,
            0x0601_0000 => Self::UnsupportedAccess,
            0x0601_0001 => Self::ReadOfWriteOnlyObject,
            0x0601_0002 => Self::WriteOfReadOnlyObject,
            0x0602_0000 => Self::ObjectDoesNotExist,
            0x0606_0000 => Self::HardwareError,
            0x0607_0010 => Self::LengthMismatch,
            0x0609_0011 => Self::SubindexDoesNotExist,
            0x0609_0030 => Self::ValueRangeExceeded,
            0x0800_0000 => Self::GeneralError,
            0x0800_0020 => Self::CannotStore,
            0x0800_0021 => Self::CannotStoreLocalControl,
            0x0800_0022 => Self::CannotStoreDeviceState,
            0x0800_0023 => Self::NoObjectDictionary,
            other => Self::Unknown(other),
        }
    }
}

impl From<SdoAbortCode> for u32 {
    fn from(code: SdoAbortCode) -> Self {
        match code {
            SdoAbortCode::ToggleBitNotAlternated => 0x0503_0000,
            SdoAbortCode::ProtocolTimedOut => 0x0504_0000,
            SdoAbortCode::InvalidCommandSpecifier => 0x0504_0001,
            SdoAbortCode::OutOfMemory => 0x0504_0005,
            SdoAbortCode::UnsupportedAccess => 0x0601_0000,
            SdoAbortCode::ReadOfWriteOnlyObject => 0x0601_0001,
            SdoAbortCode::WriteOfReadOnlyObject => 0x0601_0002,
            SdoAbortCode::ObjectDoesNotExist => 0x0602_0000,
            SdoAbortCode::HardwareError => 0x0606_0000,
            SdoAbortCode::LengthMismatch => 0x0607_0010,
            SdoAbortCode::SubindexDoesNotExist => 0x0609_0011,
            SdoAbortCode::ValueRangeExceeded => 0x0609_0030,
            SdoAbortCode::GeneralError => 0x0800_0000,
            SdoAbortCode::CannotStore => 0x0800_0020,
            SdoAbortCode::CannotStoreLocalControl => 0x0800_0021,
            SdoAbortCode::CannotStoreDeviceState => 0x0800_0022,
            SdoAbortCode::NoObjectDictionary => 0x0800_0023,
            SdoAbortCode::Unknown(v) => v,
        }
    }
}

impl fmt::Display for SdoAbortCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let desc = match self {
            Self::ToggleBitNotAlternated => "Toggle bit not alternated",
            Self::ProtocolTimedOut => "SDO protocol timed out",
            Self::InvalidCommandSpecifier => "Client/server command specifier not valid",
            Self::OutOfMemory => "Out of memory",
            Self::UnsupportedAccess => "Unsupported access to an object",
            Self::ReadOfWriteOnlyObject => "Attempt to read a write only object",
            Self::WriteOfReadOnlyObject => "Attempt to write a read only object",
            Self::ObjectDoesNotExist => "Object does not exist in the object dictionary",
            Self::HardwareError => "Access failed due to a hardware error",
            Self::LengthMismatch => "Data type does not match, length of service parameter does not match",
            Self::SubindexDoesNotExist => "Sub-index does not exist",
            Self::ValueRangeExceeded => "Value range of parameter exceeded",
            Self::GeneralError => "General error",
            Self::CannotStore => "Data cannot be transferred or stored to the application",
            Self::CannotStoreLocalControl => {
                "Data cannot be transferred or stored because of local control"
            }
            Self::CannotStoreDeviceState => {
                "Data cannot be transferred or stored because of the present device state"
            }
            Self::NoObjectDictionary => "Object dictionary not present",
            Self::Unknown(_) => "Unknown abort code",
        };
        f.write_str(desc)
    }
}
