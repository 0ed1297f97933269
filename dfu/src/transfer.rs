use crate::connection::DfuConnection;
use crate::dfuse::DfuseTransfer;
use crate::error::DfuError;
use crate::memory::DfuMemory;
use crate::transport::Transport;

/// Firmware upload/download specialised by device family, on top of the
/// shared DFU requests of a [`DfuConnection`].
#[allow(async_fn_in_trait)]
pub trait FirmwareTransfer {
    async fn download<T: Transport>(
        &self,
        conn: &DfuConnection<T>,
        data: &[u8],
        manifestation_tolerant: bool,
    ) -> Result<(), DfuError>;

    /// Read up to `max_size` bytes, or until the device sends a short block.
    async fn upload<T: Transport>(
        &self,
        conn: &DfuConnection<T>,
        max_size: Option<usize>,
    ) -> Result<Vec<u8>, DfuError>;
}

/// Plain DFU 1.1: sequential blocks numbered from 0.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DfuTransfer;

impl FirmwareTransfer for DfuTransfer {
    async fn download<T: Transport>(
        &self,
        conn: &DfuConnection<T>,
        data: &[u8],
        manifestation_tolerant: bool,
    ) -> Result<(), DfuError> {
        conn.do_download(conn.transfer_size(), data, manifestation_tolerant)
            .await
    }

    async fn upload<T: Transport>(
        &self,
        conn: &DfuConnection<T>,
        max_size: Option<usize>,
    ) -> Result<Vec<u8>, DfuError> {
        conn.do_upload(conn.transfer_size(), max_size, 0).await
    }
}

/// Transfer behaviour picked when a session connects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferStrategy {
    Dfu(DfuTransfer),
    Dfuse(DfuseTransfer),
}

impl TransferStrategy {
    pub fn is_dfuse(&self) -> bool {
        matches!(self, TransferStrategy::Dfuse(_))
    }

    pub fn memory(&self) -> Option<&DfuMemory> {
        match self {
            TransferStrategy::Dfu(_) => None,
            TransferStrategy::Dfuse(dfuse) => dfuse.memory(),
        }
    }
}

impl FirmwareTransfer for TransferStrategy {
    async fn download<T: Transport>(
        &self,
        conn: &DfuConnection<T>,
        data: &[u8],
        manifestation_tolerant: bool,
    ) -> Result<(), DfuError> {
        match self {
            TransferStrategy::Dfu(dfu) => {
                dfu.download(conn, data, manifestation_tolerant).await
            }
            TransferStrategy::Dfuse(dfuse) => {
                dfuse.download(conn, data, manifestation_tolerant).await
            }
        }
    }

    async fn upload<T: Transport>(
        &self,
        conn: &DfuConnection<T>,
        max_size: Option<usize>,
    ) -> Result<Vec<u8>, DfuError> {
        match self {
            TransferStrategy::Dfu(dfu) => dfu.upload(conn, max_size).await,
            TransferStrategy::Dfuse(dfuse) => {
                dfuse.upload(conn, max_size).await
            }
        }
    }
}
