//! USB Device Firmware Upgrade (DFU) host based on [`nusb`]
//!
//! Implements the host side of DFU 1.1 together with the STMicroelectronics
//! extensions (aka "DfuSe"): device discovery, descriptor and memory map
//! parsing, sector erase, programming, manifestation and read-back.
//!
//! Useful references:
//! - DFU: [USB Device Firmware Upgrade Specification, Revision 1.1](https://www.usb.org/sites/default/files/DFU_1.1.pdf)
//! - DfuSe: [STMicroelectronics AN3156](https://www.st.com/resource/en/application_note/an3156-usb-dfu-protocol-used-in-the-stm32-bootloader-stmicroelectronics.pdf)
//!
//! # Example
//!
//! Flash an image onto the only DFU device attached:
//! ```no_run
//! use dfu_host::{DeviceFilter, LogReporter, SessionOptions, connect};
//!
//! async_io::block_on(async {
//!     let image = std::fs::read("firmware.bin")?;
//!     let mut session = connect(
//!         &DeviceFilter::default(),
//!         &SessionOptions::default(),
//!         Box::new(LogReporter),
//!     )
//!     .await?;
//!     session.flash(&image).await?;
//!     session.close().await;
//!     Ok::<(), Box<dyn std::error::Error>>(())
//! })?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! [`nusb`]: https://docs.rs/nusb

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000u64);
pub(crate) const DEFAULT_TRANSFER_SIZE: u16 = 1024;

mod connection;
mod descriptor;
mod device;
mod dfuse;
mod error;
mod interface;
mod memory;
#[cfg(test)]
mod mock;
mod report;
mod session;
mod transfer;
mod transport;

use std::time::Duration;

// Re-exports
pub use connection::{DfuConnection, DfuState, DfuStatus, DfuStatusCode};
pub use descriptor::{
    ConfigDescriptor, DFUSE_VERSION_NUMBER, DeviceDescriptor, DfuDescriptor,
};
pub use device::{DfuDevice, find_dfu_devices};
pub use dfuse::{DfuseCommand, DfuseTransfer, dfuse_command};
pub use error::{
    ConfigurationError, DescriptorError, DfuError, ProtocolError,
    TransportError,
};
pub use interface::{DfuInterface, DfuMode};
pub use memory::{DfuMemSegment, DfuMemory, EraseStep, parse_memory_descriptor};
pub use report::{LogReporter, Reporter};
pub use session::{
    AddressFixup, DeviceFilter, Session, SessionOptions, SessionPhase,
    connect,
};
pub use transfer::{DfuTransfer, FirmwareTransfer, TransferStrategy};
pub use transport::{ControlRequest, NusbTransport, Transport};
