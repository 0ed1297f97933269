use dfu_host::{
    DeviceFilter, DfuDevice, DfuMemSegment, NusbTransport, find_dfu_devices,
};

use crate::CliError;

pub(crate) async fn list_dfu_devices(
    filter: &DeviceFilter,
) -> Result<(), CliError> {
    let devices = find_dfu_devices(filter).await?;
    if devices.is_empty() {
        println!("No DFU device found");
    } else {
        print_devices(&devices);
    }
    Ok(())
}

fn print_segment(prefix: &str, segment: &DfuMemSegment) {
    let mut sector_size = segment.sector_size();
    let size_char = if sector_size >= 1024 {
        sector_size /= 1024;
        "K"
    } else {
        " "
    };
    println!(
        "{}0x{:08X} {:3} sectors of {:4}{} bytes ({}{}{})",
        prefix,
        segment.start_addr(),
        segment.sectors(),
        sector_size,
        size_char,
        if segment.readable() { "r" } else { "" },
        if segment.writable() { "w" } else { "" },
        if segment.erasable() { "e" } else { "" },
    );
}

fn print_devices(devices: &[DfuDevice<NusbTransport>]) {
    for device in devices {
        println!(
            "Bus {} Device {:03}: ID {:04x}:{:04x} {}",
            device.bus_id(),
            device.device_address(),
            device.vendor_id(),
            device.product_id(),
            device.product_string().unwrap_or_default(),
        );

        for interface in device.interfaces() {
            println!(
                "  {interface}{}",
                if device.is_dfuse(interface) { " (dfuse)" } else { "" }
            );
            match interface.memory() {
                Some(Ok(memory)) => {
                    for segment in memory.segments.iter() {
                        print_segment("    ", segment);
                    }
                }
                Some(Err(err)) if device.is_dfuse(interface) => {
                    println!("    {err}");
                }
                _ => {}
            }
        }
    }
}
