use std::{fs, path::Path};

use dfu_host::{DeviceFilter, SessionOptions, TransferStrategy, connect};

use crate::{CliError, reporter::ConsoleReporter};

pub(crate) async fn read_file(
    file: &Path,
    filter: &DeviceFilter,
    options: &SessionOptions,
    length: Option<u32>,
) -> Result<(), CliError> {
    let reporter = Box::new(ConsoleReporter::new("Reading"));
    let mut session = connect(filter, options, reporter).await?;

    // DfuSe reads stop at the end of the readable span
    let max_size =
        length
            .map(|l| l as usize)
            .or_else(|| match session.strategy() {
                TransferStrategy::Dfuse(dfuse) => {
                    let start = dfuse.start_address()?;
                    Some(dfuse.memory()?.max_read_size(start) as usize)
                }
                TransferStrategy::Dfu(_) => None,
            });

    let result = session.read(max_size).await;
    session.close().await;
    let data = result?;
    fs::write(file, &data)?;
    println!("Read {} bytes into {}", data.len(), file.display());
    Ok(())
}
