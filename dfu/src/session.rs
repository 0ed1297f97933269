//! Connect, negotiate, flash/read and disconnect sequencing.
//!
//! A [`Session`] owns the opened device for its whole lifetime. Every
//! operation takes `&mut self`, so two transfers against the same device
//! can never interleave.

use std::{fmt, pin::pin, str::FromStr, time::Duration};

use async_io::Timer;
use futures::{
    FutureExt, StreamExt,
    future::{self, Either},
};
use log::{debug, warn};

use crate::connection::{DfuConnection, DfuState};
use crate::descriptor::DfuDescriptor;
use crate::device::{DfuDevice, find_dfu_devices};
use crate::dfuse::DfuseTransfer;
use crate::error::*;
use crate::interface::DfuInterface;
use crate::memory::DfuMemory;
use crate::report::Reporter;
use crate::transfer::{DfuTransfer, FirmwareTransfer, TransferStrategy};
use crate::transport::{NusbTransport, Transport};

/// Selects devices before any of them is opened.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub serial_number: Option<String>,
}

impl DeviceFilter {
    pub fn matches(
        &self,
        vendor_id: u16,
        product_id: u16,
        serial_number: Option<&str>,
    ) -> bool {
        self.vendor_id.is_none_or(|id| id == vendor_id)
            && self.product_id.is_none_or(|id| id == product_id)
            && self
                .serial_number
                .as_deref()
                .is_none_or(|serial| serial_number == Some(serial))
    }
}

/// Base address correction for hardware that reports its flash at the
/// wrong place: `reported` is moved up by `offset`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressFixup {
    pub reported: u32,
    pub offset: u32,
}

impl AddressFixup {
    pub fn apply(&self, addr: u32) -> Option<u32> {
        (addr == self.reported).then(|| addr.wrapping_add(self.offset))
    }
}

fn parse_u32(s: &str) -> Option<u32> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

impl FromStr for AddressFixup {
    type Err = ConfigurationError;

    /// `REPORTED+OFFSET`, e.g. `0x90000000+0x40000`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigurationError::InvalidFixup(s.to_string());
        let (reported, offset) = s.split_once('+').ok_or_else(invalid)?;
        Ok(AddressFixup {
            reported: parse_u32(reported).ok_or_else(invalid)?,
            offset: parse_u32(offset).ok_or_else(invalid)?,
        })
    }
}

impl fmt::Display for AddressFixup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}+0x{:x}", self.reported, self.offset)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionOptions {
    /// DfuSe start address; defaults to the first writable segment.
    pub start_address: Option<u32>,
    /// Picks the flash interface when a device exposes several.
    pub flash_base_token: String,
    pub address_fixups: Vec<AddressFixup>,
    /// Overrides `wTransferSize`.
    pub transfer_size: Option<u16>,
    /// How long a device that is not manifestation tolerant gets to
    /// leave the bus after a download.
    pub disconnect_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            start_address: None,
            flash_base_token: "0x08000000".to_string(),
            address_fixups: Vec::new(),
            transfer_size: None,
            disconnect_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    Connected,
    Programming,
    Reading,
    Manifesting,
    Disconnected,
}

fn nice_size(n: u64) -> String {
    const KIB: u64 = 1024;
    match n {
        n if n >= KIB * KIB * KIB => format!("{}GiB", n / (KIB * KIB * KIB)),
        n if n >= KIB * KIB => format!("{}MiB", n / (KIB * KIB)),
        n if n >= KIB => format!("{}KiB", n / KIB),
        n => format!("{n}B"),
    }
}

async fn claim<T: Transport>(
    transport: &mut T,
    interface: &DfuInterface,
) -> Result<(), TransportError> {
    transport.select_configuration(interface.config()).await?;
    transport.claim_interface(interface.interface()).await?;
    transport
        .select_alternate(interface.interface(), interface.alt_setting())
        .await
}

/// One opened DFU interface and everything negotiated for it.
pub struct Session<T: Transport> {
    conn: DfuConnection<T>,
    device_id: T::DeviceId,
    interface: DfuInterface,
    descriptor: DfuDescriptor,
    strategy: TransferStrategy,
    disconnects: Option<T::Disconnects>,
    phase: SessionPhase,
    disconnect_timeout: Duration,
}

impl<T: Transport> Session<T> {
    /// Open `device`, claim its flash interface and pick the transfer
    /// strategy.
    pub async fn connect(
        device: DfuDevice<T>,
        options: &SessionOptions,
        reporter: Box<dyn Reporter>,
    ) -> Result<Self, DfuError> {
        let interface = device
            .select_interface(&options.flash_base_token)?
            .clone();
        let functional = device.functional_descriptor(&interface);
        let is_dfuse = device.is_dfuse(&interface);

        let mut transport = device.into_transport();
        let device_id = transport.device_id();
        transport.open().await?;
        if let Err(err) = claim(&mut transport, &interface).await {
            transport.close().await;
            return Err(err.into());
        }

        let descriptor = match functional {
            Some(desc) => {
                debug!(
                    "WillDetach={}, ManifestationTolerant={}, CanUpload={}, \
                     CanDnload={}, TransferSize={}, DetachTimeOut={}, \
                     Version={:04x}",
                    desc.will_detach(),
                    desc.manifestation_tolerant(),
                    desc.can_upload(),
                    desc.can_download(),
                    desc.transfer_size(),
                    desc.detach_timeout(),
                    desc.dfu_version()
                );
                desc
            }
            None => {
                reporter.warn(
                    "No DFU functional descriptor found, using defaults",
                );
                DfuDescriptor::default()
            }
        };

        let transfer_size =
            options.transfer_size.unwrap_or(descriptor.transfer_size());
        let disconnects = match transport.watch_disconnects() {
            Ok(disconnects) => Some(disconnects),
            Err(err) => {
                warn!("Unable to watch for disconnects: {err}");
                None
            }
        };
        let conn = DfuConnection::new(
            transport,
            interface.interface(),
            transfer_size,
            reporter,
        );

        let strategy = if is_dfuse {
            TransferStrategy::Dfuse(Self::dfuse_transfer(
                &conn, &interface, options,
            ))
        } else {
            TransferStrategy::Dfu(DfuTransfer)
        };
        conn.reporter().debug(&format!("Claimed {interface}"));
        conn.reporter().info("The selected device has been connected.");

        Ok(Session {
            conn,
            device_id,
            interface,
            descriptor,
            strategy,
            disconnects,
            phase: SessionPhase::Connected,
            disconnect_timeout: options.disconnect_timeout,
        })
    }

    fn dfuse_transfer(
        conn: &DfuConnection<T>,
        interface: &DfuInterface,
        options: &SessionOptions,
    ) -> DfuseTransfer {
        let reporter = conn.reporter();
        let memory = match interface.memory() {
            Some(Ok(memory)) => Some(memory),
            Some(Err(err)) => {
                reporter.warn(&err.to_string());
                None
            }
            None => None,
        };
        let Some(memory) = memory else {
            return DfuseTransfer::new(None, options.start_address);
        };

        reporter.info(&format!(
            "Selected memory region: {} ({})",
            memory.name,
            nice_size(memory.total_size())
        ));
        for segment in memory.segments.iter() {
            reporter.debug(&segment.to_string());
        }

        let start_address = options.start_address.or_else(|| {
            let start = memory.first_writable_segment()?.start_addr();
            let fixed = options
                .address_fixups
                .iter()
                .find_map(|fixup| fixup.apply(start));
            if let Some(fixed) = fixed {
                debug!("Start address 0x{start:08x} moved to 0x{fixed:08x}");
            }
            Some(fixed.unwrap_or(start))
        });
        if let Some(start) = start_address {
            debug!(
                "Start address 0x{start:08x}, up to {} bytes readable",
                memory.max_read_size(start)
            );
        }
        DfuseTransfer::new(Some(memory), start_address)
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn device_id(&self) -> &T::DeviceId {
        &self.device_id
    }

    pub fn interface(&self) -> &DfuInterface {
        &self.interface
    }

    pub fn functional_descriptor(&self) -> &DfuDescriptor {
        &self.descriptor
    }

    pub fn strategy(&self) -> &TransferStrategy {
        &self.strategy
    }

    pub fn memory(&self) -> Option<&DfuMemory> {
        self.strategy.memory()
    }

    pub fn transfer_size(&self) -> u16 {
        self.conn.transfer_size()
    }

    pub fn connection(&self) -> &DfuConnection<T> {
        &self.conn
    }

    fn reporter(&self) -> &dyn Reporter {
        self.conn.reporter()
    }

    fn ensure_connected(&mut self) -> Result<(), ConfigurationError> {
        self.poll_disconnects();
        if self.phase == SessionPhase::Disconnected {
            Err(ConfigurationError::Disconnected)
        } else {
            Ok(())
        }
    }

    /// Program `image` and manifest it.
    pub async fn flash(&mut self, image: &[u8]) -> Result<(), DfuError> {
        self.ensure_connected()?;
        if !self.descriptor.can_download() {
            return Err(ConfigurationError::DownloadNotSupported.into());
        }

        let cleared = async {
            if self.conn.get_status().await?.state == DfuState::Error {
                self.conn.clear_status().await?;
            }
            Ok::<(), DfuError>(())
        };
        if let Err(err) = cleared.await {
            self.reporter().warn(&format!("Failed to clear status: {err}"));
        }

        self.reporter().info("Flashing... do not disconnect.");
        self.phase = SessionPhase::Programming;
        let tolerant = self.descriptor.manifestation_tolerant();
        let result = self.strategy.download(&self.conn, image, tolerant).await;
        self.phase = SessionPhase::Connected;
        if let Err(err) = result {
            self.poll_disconnects();
            return Err(err);
        }
        self.reporter().info("Flashing done!");

        if tolerant {
            self.poll_disconnects();
            return Ok(());
        }

        self.phase = SessionPhase::Manifesting;
        if self.wait_disconnected(self.disconnect_timeout).await {
            self.reporter().info("Flashing and disconnection completed.");
        } else {
            self.phase = SessionPhase::Connected;
            self.reporter().warn(
                "Device unexpectedly tolerated manifestation \
                 (no reset and disconnect).",
            );
        }
        Ok(())
    }

    /// Read up to `max_size` bytes; `None` reads until the device ends
    /// the upload.
    pub async fn read(
        &mut self,
        max_size: Option<usize>,
    ) -> Result<Vec<u8>, DfuError> {
        self.ensure_connected()?;
        if !self.descriptor.can_upload() {
            return Err(ConfigurationError::UploadNotSupported.into());
        }

        self.phase = SessionPhase::Reading;
        let result = self.strategy.upload(&self.conn, max_size).await;
        self.phase = SessionPhase::Connected;
        self.poll_disconnects();
        result
    }

    /// Ask a runtime-mode device to re-enumerate in DFU mode.
    pub async fn detach(&mut self) -> Result<(), DfuError> {
        self.ensure_connected()?;
        self.reporter().info("Sending DFU detach request");
        self.conn.detach().await?;

        if !self.descriptor.will_detach() {
            match self.conn.transport().reset().await {
                Ok(()) => {}
                Err(err) if err.is_disconnect() => {}
                Err(err) => return Err(err.into()),
            }
        }

        let detach_timeout =
            Duration::from_millis(self.descriptor.detach_timeout() as u64);
        let timeout = self.disconnect_timeout.max(detach_timeout);
        if self.wait_disconnected(timeout).await {
            self.reporter().info("Detached");
        } else {
            self.reporter().warn("Device did not disconnect after detach");
        }
        Ok(())
    }

    /// Handle a disconnect notification. Returns `true` only the first
    /// time the tracked device is reported gone.
    pub fn handle_disconnect(&mut self, id: &T::DeviceId) -> bool {
        if *id != self.device_id || self.phase == SessionPhase::Disconnected {
            return false;
        }
        self.phase = SessionPhase::Disconnected;
        self.disconnects = None;
        self.reporter().info("Device disconnected.");
        self.reporter().disconnected();
        true
    }

    /// Process disconnect notifications that have already arrived.
    pub fn poll_disconnects(&mut self) {
        let Some(disconnects) = self.disconnects.as_mut() else {
            return;
        };
        let mut ids = Vec::new();
        while let Some(Some(id)) = disconnects.next().now_or_never() {
            ids.push(id);
        }
        for id in ids {
            self.handle_disconnect(&id);
        }
    }

    /// Wait up to `timeout` for the device to leave the bus.
    pub async fn wait_disconnected(&mut self, timeout: Duration) -> bool {
        if self.phase == SessionPhase::Disconnected {
            return true;
        }
        let Some(mut disconnects) = self.disconnects.take() else {
            debug!("Not watching for disconnects");
            return false;
        };

        let device_id = self.device_id.clone();
        let disconnected = async {
            while let Some(id) = disconnects.next().await {
                if id == device_id {
                    return true;
                }
            }
            false
        };
        let timer = Timer::after(timeout);
        let observed = match future::select(pin!(disconnected), timer).await {
            Either::Left((observed, _)) => observed,
            Either::Right(_) => false,
        };

        self.disconnects = Some(disconnects);
        if observed {
            let id = self.device_id.clone();
            self.handle_disconnect(&id);
        }
        observed
    }

    /// Stop watching for disconnects and release the device.
    pub async fn close(mut self) {
        self.disconnects = None;
        self.conn.transport_mut().close().await;
    }
}

/// Connect to the single DFU device selected by `filter`.
pub async fn connect(
    filter: &DeviceFilter,
    options: &SessionOptions,
    reporter: Box<dyn Reporter>,
) -> Result<Session<NusbTransport>, DfuError> {
    let mut devices = find_dfu_devices(filter).await?;
    let device = match devices.len() {
        0 => return Err(ConfigurationError::NoDevice.into()),
        1 => devices.remove(0),
        n => return Err(ConfigurationError::ManyDevices(n).into()),
    };
    Session::connect(device, options, reporter).await
}
