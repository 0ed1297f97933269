use std::time::{Duration, Instant};

use async_io::Timer;
use dfu_host::{
    DeviceFilter, DfuMode, SessionOptions, connect, find_dfu_devices,
};

use crate::{CliError, reporter::ConsoleReporter};

const REENUMERATE_TIMEOUT: Duration = Duration::from_secs(30);
const RESCAN_INTERVAL: Duration = Duration::from_millis(500);

pub(crate) async fn detach(
    filter: &DeviceFilter,
    options: &SessionOptions,
) -> Result<(), CliError> {
    let reporter = Box::new(ConsoleReporter::new("Detaching"));
    let mut session = connect(filter, options, reporter).await?;
    if session.interface().mode() == DfuMode::Dfu {
        println!("Device is already in DFU mode");
        session.close().await;
        return Ok(());
    }

    let vendor_id = session.connection().transport().info().vendor_id();
    let result = session.detach().await;
    session.close().await;
    result?;

    println!("Waiting for device to reconnect...");
    let start = Instant::now();
    let filter = DeviceFilter {
        vendor_id: Some(vendor_id),
        ..Default::default()
    };
    loop {
        let devices = find_dfu_devices(&filter).await?;
        let reconnected = devices.iter().any(|device| {
            device
                .interfaces()
                .iter()
                .any(|intf| intf.mode() == DfuMode::Dfu)
        });
        if reconnected {
            println!("Reconnected in DFU mode after {:?}", start.elapsed());
            return Ok(());
        }
        if start.elapsed() >= REENUMERATE_TIMEOUT {
            return Err(CliError::Timeout);
        }
        Timer::after(RESCAN_INTERVAL).await;
    }
}
