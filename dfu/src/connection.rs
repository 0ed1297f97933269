use std::{fmt, time::Duration};

use async_io::Timer;
use log::trace;

use crate::error::*;
use crate::report::Reporter;
use crate::transport::{ControlRequest, Transport};

const DFU_CMD_DETACH: u8 = 0;
const DFU_CMD_DOWNLOAD: u8 = 1;
const DFU_CMD_UPLOAD: u8 = 2;
const DFU_CMD_GETSTATUS: u8 = 3;
const DFU_CMD_CLRSTATUS: u8 = 4;
const DFU_CMD_GETSTATE: u8 = 5;
const DFU_CMD_ABORT: u8 = 6;

const DFU_STATUS_LEN: u16 = 6;
const DFU_DETACH_TIMEOUT_MS: u16 = 1000;

/// Device state as reported by `DFU_GETSTATUS` / `DFU_GETSTATE`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DfuState {
    AppIdle,
    AppDetach,
    DfuIdle,
    DnloadSync,
    DnBusy,
    DnloadIdle,
    ManifestSync,
    Manifest,
    ManifestWaitReset,
    UploadIdle,
    Error,
    Unknown(u8),
}

impl From<u8> for DfuState {
    fn from(code: u8) -> Self {
        match code {
            0x00 => DfuState::AppIdle,
            0x01 => DfuState::AppDetach,
            0x02 => DfuState::DfuIdle,
            0x03 => DfuState::DnloadSync,
            0x04 => DfuState::DnBusy,
            0x05 => DfuState::DnloadIdle,
            0x06 => DfuState::ManifestSync,
            0x07 => DfuState::Manifest,
            0x08 => DfuState::ManifestWaitReset,
            0x09 => DfuState::UploadIdle,
            0x0a => DfuState::Error,
            code => DfuState::Unknown(code),
        }
    }
}

impl DfuState {
    pub fn code(&self) -> u8 {
        match *self {
            DfuState::AppIdle => 0x00,
            DfuState::AppDetach => 0x01,
            DfuState::DfuIdle => 0x02,
            DfuState::DnloadSync => 0x03,
            DfuState::DnBusy => 0x04,
            DfuState::DnloadIdle => 0x05,
            DfuState::ManifestSync => 0x06,
            DfuState::Manifest => 0x07,
            DfuState::ManifestWaitReset => 0x08,
            DfuState::UploadIdle => 0x09,
            DfuState::Error => 0x0a,
            DfuState::Unknown(code) => code,
        }
    }
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DfuState::AppIdle => "appIDLE",
            DfuState::AppDetach => "appDETACH",
            DfuState::DfuIdle => "dfuIDLE",
            DfuState::DnloadSync => "dfuDNLOAD_SYNC",
            DfuState::DnBusy => "dfuDNBUSY",
            DfuState::DnloadIdle => "dfuDNLOAD_IDLE",
            DfuState::ManifestSync => "dfuMANIFEST_SYNC",
            DfuState::Manifest => "dfuMANIFEST",
            DfuState::ManifestWaitReset => "dfuMANIFEST_WAIT_RESET",
            DfuState::UploadIdle => "dfuUPLOAD_IDLE",
            DfuState::Error => "dfuERROR",
            DfuState::Unknown(code) => return write!(f, "unknown({code})"),
        };
        f.write_str(name)
    }
}

/// `bStatus` of a `DFU_GETSTATUS` response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DfuStatusCode {
    Ok,
    ErrTarget,
    ErrFile,
    ErrWrite,
    ErrErase,
    ErrCheckErased,
    ErrProg,
    ErrVerify,
    ErrAddress,
    ErrNotDone,
    ErrFirmware,
    ErrVendor,
    ErrUsbReset,
    ErrPowerOnReset,
    ErrUnknown,
    ErrStalledPkt,
    Unknown(u8),
}

const STATUS_CODES: [(DfuStatusCode, &str); 16] = [
    (DfuStatusCode::Ok, "OK"),
    (DfuStatusCode::ErrTarget, "errTARGET"),
    (DfuStatusCode::ErrFile, "errFILE"),
    (DfuStatusCode::ErrWrite, "errWRITE"),
    (DfuStatusCode::ErrErase, "errERASE"),
    (DfuStatusCode::ErrCheckErased, "errCHECK_ERASED"),
    (DfuStatusCode::ErrProg, "errPROG"),
    (DfuStatusCode::ErrVerify, "errVERIFY"),
    (DfuStatusCode::ErrAddress, "errADDRESS"),
    (DfuStatusCode::ErrNotDone, "errNOTDONE"),
    (DfuStatusCode::ErrFirmware, "errFIRMWARE"),
    (DfuStatusCode::ErrVendor, "errVENDOR"),
    (DfuStatusCode::ErrUsbReset, "errUSBR"),
    (DfuStatusCode::ErrPowerOnReset, "errPOR"),
    (DfuStatusCode::ErrUnknown, "errUNKNOWN"),
    (DfuStatusCode::ErrStalledPkt, "errSTALLEDPKT"),
];

impl From<u8> for DfuStatusCode {
    fn from(code: u8) -> Self {
        STATUS_CODES
            .get(code as usize)
            .map_or(DfuStatusCode::Unknown(code), |(status, _)| *status)
    }
}

impl DfuStatusCode {
    pub fn code(&self) -> u8 {
        match *self {
            DfuStatusCode::Unknown(code) => code,
            status => STATUS_CODES
                .iter()
                .position(|(s, _)| *s == status)
                .unwrap_or_default() as u8,
        }
    }
}

impl fmt::Display for DfuStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match STATUS_CODES.get(self.code() as usize) {
            Some((_, name)) if !matches!(self, DfuStatusCode::Unknown(_)) => {
                f.write_str(name)
            }
            _ => write!(f, "unknown({})", self.code()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DfuStatus {
    pub status: DfuStatusCode,
    /// Milliseconds to wait before the next `DFU_GETSTATUS`.
    pub poll_timeout: u32,
    pub state: DfuState,
}

impl DfuStatus {
    pub fn from_raw(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < DFU_STATUS_LEN as usize {
            return Err(ProtocolError::ShortResponse {
                request: "GETSTATUS",
                len: data.len(),
            });
        }
        Ok(DfuStatus {
            status: data[0].into(),
            poll_timeout: (data[3] as u32) << 16
                | (data[2] as u32) << 8
                | (data[1] as u32),
            state: data[4].into(),
        })
    }

    pub fn is_ok(&self) -> bool {
        self.status == DfuStatusCode::Ok
    }

    /// Fail with the state and status named after `operation`.
    pub fn check(&self, operation: &'static str) -> Result<(), ProtocolError> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(ProtocolError::UnexpectedStatus {
                operation,
                state: self.state,
                status: self.status,
            })
        }
    }
}

/// DFU class requests against one claimed interface, plus the generic
/// upload/download sequences built from them.
pub struct DfuConnection<T> {
    transport: T,
    interface: u8,
    xfer_size: u16,
    reporter: Box<dyn Reporter>,
}

impl<T: Transport> DfuConnection<T> {
    pub fn new(
        transport: T,
        interface: u8,
        xfer_size: u16,
        reporter: Box<dyn Reporter>,
    ) -> Self {
        DfuConnection {
            transport,
            interface,
            xfer_size: if xfer_size > 0 {
                xfer_size
            } else {
                crate::DEFAULT_TRANSFER_SIZE
            },
            reporter,
        }
    }

    pub fn transfer_size(&self) -> u16 {
        self.xfer_size
    }

    pub fn interface(&self) -> u8 {
        self.interface
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn reporter(&self) -> &dyn Reporter {
        self.reporter.as_ref()
    }

    /// Ask a runtime-mode device to re-enumerate in DFU mode.
    pub async fn detach(&self) -> Result<(), DfuError> {
        self.dfu_cmd_out(DFU_CMD_DETACH, DFU_DETACH_TIMEOUT_MS, &[])
            .await
            .map(|_| ())
    }

    pub async fn dnload(
        &self,
        transaction: u16,
        data: &[u8],
    ) -> Result<usize, DfuError> {
        self.dfu_cmd_out(DFU_CMD_DOWNLOAD, transaction, data).await
    }

    pub async fn upload(
        &self,
        transaction: u16,
        length: u16,
    ) -> Result<Vec<u8>, DfuError> {
        self.dfu_cmd_in(DFU_CMD_UPLOAD, transaction, length).await
    }

    pub async fn get_status(&self) -> Result<DfuStatus, DfuError> {
        let data = self
            .dfu_cmd_in(DFU_CMD_GETSTATUS, 0, DFU_STATUS_LEN)
            .await?;
        Ok(DfuStatus::from_raw(&data)?)
    }

    pub async fn clear_status(&self) -> Result<(), DfuError> {
        self.dfu_cmd_out(DFU_CMD_CLRSTATUS, 0, &[]).await.map(|_| ())
    }

    pub async fn get_state(&self) -> Result<DfuState, DfuError> {
        let data = self.dfu_cmd_in(DFU_CMD_GETSTATE, 0, 1).await?;
        match data.first() {
            Some(&state) => Ok(state.into()),
            None => Err(ProtocolError::ShortResponse {
                request: "GETSTATE",
                len: 0,
            }
            .into()),
        }
    }

    pub async fn abort(&self) -> Result<(), DfuError> {
        self.dfu_cmd_out(DFU_CMD_ABORT, 0, &[]).await.map(|_| ())
    }

    /// ABORT, clearing a pending error, until the device is `dfuIDLE`.
    pub async fn abort_to_idle(&self) -> Result<(), DfuError> {
        self.abort().await?;
        let mut state = self.get_state().await?;
        if state == DfuState::Error {
            self.clear_status().await?;
            state = self.get_state().await?;
        }
        if state != DfuState::DfuIdle {
            return Err(ProtocolError::NotIdle(state).into());
        }
        Ok(())
    }

    /// Poll `DFU_GETSTATUS`, honouring `bwPollTimeout`, until `predicate`
    /// accepts the state or the device enters `dfuERROR`.
    pub async fn poll_until(
        &self,
        predicate: impl Fn(DfuState) -> bool,
    ) -> Result<DfuStatus, DfuError> {
        let mut status = self.get_status().await?;
        while !predicate(status.state) && status.state != DfuState::Error {
            trace!(
                "{}: sleeping for {}ms",
                status.state, status.poll_timeout
            );
            Timer::after(Duration::from_millis(status.poll_timeout as u64))
                .await;
            status = self.get_status().await?;
        }
        Ok(status)
    }

    pub async fn poll_until_idle(
        &self,
        idle_state: DfuState,
    ) -> Result<DfuStatus, DfuError> {
        self.poll_until(|state| state == idle_state).await
    }

    /// Read up to `max_size` bytes (unbounded with `None`) in
    /// `xfer_size` blocks, numbering transactions from `first_block`.
    ///
    /// A block shorter than requested ends the upload.
    pub async fn do_upload(
        &self,
        xfer_size: u16,
        max_size: Option<usize>,
        first_block: u16,
    ) -> Result<Vec<u8>, DfuError> {
        let xfer_size = xfer_size.max(1) as usize;
        let mut transaction = first_block;
        let mut data = Vec::new();

        self.reporter.info("Copying data from DFU device");
        self.reporter.progress(0, max_size);
        if max_size == Some(0) {
            return Ok(data);
        }

        loop {
            let remaining =
                max_size.map_or(usize::MAX, |max| max - data.len());
            let bytes_to_read = remaining.min(xfer_size);
            let block = self.upload(transaction, bytes_to_read as u16).await?;
            transaction = transaction.wrapping_add(1);
            self.reporter.debug(&format!("Read {} bytes", block.len()));

            let short = block.len() < bytes_to_read;
            data.extend_from_slice(&block[..block.len().min(bytes_to_read)]);
            self.reporter.progress(data.len(), max_size);

            if short || max_size.is_some_and(|max| data.len() >= max) {
                break;
            }
        }

        if max_size == Some(data.len()) {
            // the device may still be mid-upload
            self.abort_to_idle().await?;
        }

        self.reporter.info(&format!("Read {} bytes", data.len()));
        Ok(data)
    }

    /// Write `data` in `xfer_size` chunks, then manifest and reset.
    pub async fn do_download(
        &self,
        xfer_size: u16,
        data: &[u8],
        manifestation_tolerant: bool,
    ) -> Result<(), DfuError> {
        let expected_size = data.len();
        let mut bytes_sent = 0;
        let mut transaction: u16 = 0;

        self.reporter.info("Copying data to DFU device");
        self.reporter.progress(bytes_sent, Some(expected_size));

        for chunk in data.chunks(xfer_size.max(1) as usize) {
            let bytes_written = self.dnload(transaction, chunk).await?;
            transaction = transaction.wrapping_add(1);
            self.reporter.debug(&format!("Sent {bytes_written} bytes"));

            let status = self.poll_until_idle(DfuState::DnloadIdle).await?;
            status.check("DFU DOWNLOAD")?;
            if bytes_written != chunk.len() {
                return Err(ProtocolError::ShortWrite {
                    written: bytes_written,
                    expected: chunk.len(),
                }
                .into());
            }

            bytes_sent += bytes_written;
            self.reporter.progress(bytes_sent, Some(expected_size));
        }

        self.reporter.debug("Sending empty block");
        self.dnload(transaction, &[]).await?;

        self.reporter.info(&format!("Wrote {bytes_sent} bytes"));
        self.reporter.info("Manifesting new firmware");

        if manifestation_tolerant {
            let result = self
                .poll_until(|state| {
                    state == DfuState::DfuIdle
                        || state == DfuState::ManifestWaitReset
                })
                .await;
            match result {
                Ok(status) => {
                    if status.state == DfuState::ManifestWaitReset {
                        self.reporter.debug(
                            "Device transitioned to MANIFEST_WAIT_RESET \
                             even though it is manifestation tolerant",
                        );
                    }
                    status.check("DFU MANIFEST")?;
                }
                Err(err) if err.is_disconnect() => {
                    self.reporter
                        .warn("Unable to poll final manifestation status");
                }
                Err(err) => return Err(err),
            }
        } else {
            // one poll to trigger manifestation; the device may already be
            // resetting
            match self.get_status().await {
                Ok(status) => self.reporter.debug(&format!(
                    "Final DFU status: state={}, status={}",
                    status.state, status.status
                )),
                Err(err) => self
                    .reporter
                    .debug(&format!("Manifest GET_STATUS poll error: {err}")),
            }
        }

        match self.transport.reset().await {
            Ok(()) => Ok(()),
            Err(err) if err.is_disconnect() => {
                self.reporter.debug("Ignored reset error");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn dfu_cmd_out(
        &self,
        req: u8,
        value: u16,
        data: &[u8],
    ) -> Result<usize, DfuError> {
        let request = ControlRequest::class(req, value, self.interface);
        Ok(self.transport.control_out(request, data).await?)
    }

    async fn dfu_cmd_in(
        &self,
        req: u8,
        value: u16,
        length: u16,
    ) -> Result<Vec<u8>, DfuError> {
        let request = ControlRequest::class(req, value, self.interface);
        Ok(self.transport.control_in(request, length).await?)
    }
}
