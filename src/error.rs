use crate::AcquisitionState;
use std::fmt;
use thiserror::Error;

/// Status codes reported by the hardware access layer.
#[repr(i32)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Debug)]
pub enum ReturnCode {
    Success = 0,
    CommError = -1,
    GenericError = -2,
    InvalidParam = -3,
    InvalidLinkType = -4,
    InvalidHandle = -5,
    MaxDevicesError = -6,
    BadBoardType = -7,
    BadInterruptLev = -8,
    BadEventNumber = -9,
    ReadDeviceRegisterFail = -10,
    WriteDeviceRegisterFail = -11,
    InvalidChannelNumber = -13,
    ChannelBusy = -14,
    FPIOModeInvalid = -15,
    WrongAcqMode = -16,
    FunctionNotAllowed = -17,
    Timeout = -18,
    InvalidBuffer = -19,
    EventNotFound = -20,
    InvalidEvent = -21,
    OutOfMemory = -22,
    CalibrationError = -23,
    DigitizerNotFound = -24,
    DigitizerAlreadyOpen = -25,
    DigitizerNotReady = -26,
    InterruptNotConfigured = -27,
    DigitizerMemoryCorrupted = -28,
    DPPFirmwareNotSupported = -29,
    InvalidLicense = -30,
    InvalidDigitizerStatus = -31,
    UnsupportedTrace = -32,
    InvalidTraceSource = -33,
    UnsupportedBaseAddress = -34,
    NotYetImplemented = -99,
    Unknown = 1,
}

impl From<i32> for ReturnCode {
    fn from(value: i32) -> Self {
        match value {
            0 => Self::Success,
            -1 => Self::CommError,
            -2 => Self::GenericError,
            -3 => Self::InvalidParam,
            -4 => Self::InvalidLinkType,
            -5 => Self::InvalidHandle,
            -6 => Self::MaxDevicesError,
            -7 => Self::BadBoardType,
            -8 => Self::BadInterruptLev,
            -9 => Self::BadEventNumber,
            -10 => Self::ReadDeviceRegisterFail,
            -11 => Self::WriteDeviceRegisterFail,
            -13 => Self::InvalidChannelNumber,
            -14 => Self::ChannelBusy,
            -15 => Self::FPIOModeInvalid,
            -16 => Self::WrongAcqMode,
            -17 => Self::FunctionNotAllowed,
            -18 => Self::Timeout,
            -19 => Self::InvalidBuffer,
            -20 => Self::EventNotFound,
            -21 => Self::InvalidEvent,
            -22 => Self::OutOfMemory,
            -23 => Self::CalibrationError,
            -24 => Self::DigitizerNotFound,
            -25 => Self::DigitizerAlreadyOpen,
            -26 => Self::DigitizerNotReady,
            -27 => Self::InterruptNotConfigured,
            -28 => Self::DigitizerMemoryCorrupted,
            -29 => Self::DPPFirmwareNotSupported,
            -30 => Self::InvalidLicense,
            -31 => Self::InvalidDigitizerStatus,
            -32 => Self::UnsupportedTrace,
            -33 => Self::InvalidTraceSource,
            -34 => Self::UnsupportedBaseAddress,
            -99 => Self::NotYetImplemented,
            _ => Self::Unknown,
        }
    }
}

impl ReturnCode {
    /// Soft failures: the device is still usable after one of these.
    pub fn is_warning(self) -> bool {
        matches!(
            self,
            Self::ChannelBusy
                | Self::FunctionNotAllowed
                | Self::Timeout
                | Self::DigitizerAlreadyOpen
                | Self::DPPFirmwareNotSupported
                | Self::NotYetImplemented
        )
    }

    /// The device does not implement the requested primitive.
    pub fn is_unsupported(self) -> bool {
        matches!(self, Self::NotYetImplemented | Self::FunctionNotAllowed)
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::CommError => "Communication error",
            Self::GenericError | Self::Unknown => "Unspecified error",
            Self::InvalidParam => "Invalid parameter",
            Self::InvalidLinkType => "Invalid link type",
            Self::InvalidHandle => "Invalid device handle",
            Self::MaxDevicesError => "Maximum number of devices exceeded",
            Self::BadBoardType => "The operation is not allowed on this type of board",
            Self::BadInterruptLev => "The interrupt level is not allowed",
            Self::BadEventNumber => "The event number is bad",
            Self::ReadDeviceRegisterFail => "Unable to read the registry",
            Self::WriteDeviceRegisterFail => "Unable to write into the registry",
            Self::InvalidChannelNumber => "The channel number is invalid",
            Self::ChannelBusy => "The channel is busy",
            Self::FPIOModeInvalid => "Invalid FPIO mode",
            Self::WrongAcqMode => "Wrong acquisition mode",
            Self::FunctionNotAllowed => "This function is not allowed for this module",
            Self::Timeout => "Communication timeout",
            Self::InvalidBuffer => "The buffer is invalid",
            Self::EventNotFound => "The event is not found",
            Self::InvalidEvent => "The event is invalid",
            Self::OutOfMemory => "Out of memory",
            Self::CalibrationError => "Unable to calibrate the board",
            Self::DigitizerNotFound => "Unable to open the digitizer",
            Self::DigitizerAlreadyOpen => "The digitizer is already open",
            Self::DigitizerNotReady => "The digitizer is not ready to operate",
            Self::InterruptNotConfigured => "The digitizer has not the IRQ configured",
            Self::DigitizerMemoryCorrupted => "The digitizer flash memory is corrupted",
            Self::DPPFirmwareNotSupported => "The digitizer DPP firmware is not supported",
            Self::InvalidLicense => "Invalid firmware license",
            Self::InvalidDigitizerStatus => "The digitizer is found in a corrupted status",
            Self::UnsupportedTrace => "The given trace is not supported by the digitizer",
            Self::InvalidTraceSource => "The given signal source is not supported for the given trace",
            Self::UnsupportedBaseAddress => "The base address is not supported",
            Self::NotYetImplemented => "The function is not yet implemented",
        }
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), *self as i32)
    }
}

/// Every failure the acquisition pipeline can report.
///
/// A failing operation leaves all host-side state as it was before the
/// call, with two exceptions. On [`DigitizerError::Decode`] the offending raw
/// buffer has already been handed over and is discarded. A drain that fails
/// after some reads succeeded keeps those events in the host buffer, since
/// they no longer exist on the device.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DigitizerError {
    #[error("invalid configuration field `{field}`: {reason}")]
    Configuration { field: String, reason: String },

    #[error("`{operation}` is not permitted while {state}")]
    InvalidState {
        operation: &'static str,
        state: AcquisitionState,
    },

    #[error("device error during `{operation}`: {code}")]
    Device {
        operation: &'static str,
        code: ReturnCode,
    },

    #[error("malformed raw event buffer: {0}")]
    Decode(String),

    #[error("event index {index} out of range ({len} events stored)")]
    Index { index: usize, len: usize },
}

impl DigitizerError {
    pub(crate) fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Name of the offending field for configuration errors.
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::Configuration { field, .. } => Some(field),
            _ => None,
        }
    }
}

pub type Result<T, E = DigitizerError> = std::result::Result<T, E>;
