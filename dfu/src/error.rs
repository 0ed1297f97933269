use thiserror::Error;

use crate::connection::{DfuState, DfuStatusCode};

/// A control transfer or device operation failed at the USB layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("device is not open")]
    NotOpen,
    #[error("no interface claimed")]
    NotClaimed,
    #[error("device disconnected")]
    Disconnected,
    #[error("control transfer stalled")]
    Stall,
    #[error("device returned an invalid descriptor")]
    InvalidDescriptor,
    #[error("transfer error: {0}")]
    Transfer(nusb::transfer::TransferError),
    #[error("USB error: {0}")]
    Usb(nusb::Error),
}

impl TransportError {
    /// True when the failure means the device has already left the bus.
    ///
    /// Devices reboot on their own once manifestation starts, so a few
    /// steps at the end of a download expect this and only this.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, TransportError::Disconnected)
    }
}

impl From<nusb::transfer::TransferError> for TransportError {
    fn from(err: nusb::transfer::TransferError) -> Self {
        use nusb::transfer::TransferError;
        match err {
            TransferError::Disconnected => TransportError::Disconnected,
            TransferError::Stall => TransportError::Stall,
            err => TransportError::Transfer(err),
        }
    }
}

impl From<nusb::GetDescriptorError> for TransportError {
    fn from(err: nusb::GetDescriptorError) -> Self {
        match err {
            nusb::GetDescriptorError::Transfer(err) => err.into(),
            nusb::GetDescriptorError::InvalidDescriptor => {
                TransportError::InvalidDescriptor
            }
        }
    }
}

impl From<nusb::Error> for TransportError {
    fn from(err: nusb::Error) -> Self {
        match err.kind() {
            nusb::ErrorKind::Disconnected => TransportError::Disconnected,
            _ => TransportError::Usb(err),
        }
    }
}

/// A binary descriptor could not be decoded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("{kind} descriptor truncated: {len} bytes, expected {expected}")]
    Truncated {
        kind: &'static str,
        len: usize,
        expected: usize,
    },
    #[error("invalid descriptor length {length} at offset {offset}")]
    InvalidLength { offset: usize, length: u8 },
    #[error(
        "unexpected descriptor type {found:#04x}, expected {expected:#04x}"
    )]
    UnexpectedType { expected: u8, found: u8 },
    #[error("not a DfuSe memory descriptor: \"{0}\"")]
    NotMemoryDescriptor(String),
}

/// The device answered, but not the way the exchange requires.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("{operation} failed state={state}, status={status}")]
    UnexpectedStatus {
        operation: &'static str,
        state: DfuState,
        status: DfuStatusCode,
    },
    #[error("failed to return to idle state after abort: state {0}")]
    NotIdle(DfuState),
    #[error("short {request} response: {len} bytes")]
    ShortResponse { request: &'static str, len: usize },
    #[error("short write: {written} of {expected} bytes accepted")]
    ShortWrite { written: usize, expected: usize },
    #[error(
        "special DfuSe command {command} failed state={state}, status={status}"
    )]
    CommandFailed {
        command: &'static str,
        state: DfuState,
        status: DfuStatusCode,
    },
}

/// The request cannot be carried out with the selected device/interface.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("no DFU device found")]
    NoDevice,
    #[error("{0} DFU devices match, narrow the selection")]
    ManyDevices(usize),
    #[error("the selected device does not have any USB DFU interfaces")]
    NoDfuInterfaces,
    #[error("no interface with flash address {0} found")]
    NoFlashInterface(String),
    #[error("no memory map available")]
    NoMemoryMap,
    #[error("address {0:#010x} outside of memory map")]
    AddressOutOfRange(u32),
    #[error("device does not support download")]
    DownloadNotSupported,
    #[error("device does not support upload")]
    UploadNotSupported,
    #[error("device is disconnected")]
    Disconnected,
    #[error("invalid address fixup \"{0}\", expected REPORTED+OFFSET")]
    InvalidFixup(String),
}

#[derive(Debug, Error)]
pub enum DfuError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

impl DfuError {
    pub fn is_disconnect(&self) -> bool {
        matches!(self, DfuError::Transport(err) if err.is_disconnect())
    }
}
