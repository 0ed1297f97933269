use std::{fs, path::Path};

use dfu_host::{DeviceFilter, SessionOptions, connect};

use crate::{CliError, reporter::ConsoleReporter};

pub(crate) async fn write_file(
    file: &Path,
    filter: &DeviceFilter,
    options: &SessionOptions,
) -> Result<(), CliError> {
    let data = fs::read(file)?;
    let reporter = Box::new(ConsoleReporter::new("Flashing"));
    let mut session = connect(filter, options, reporter).await?;

    let result = session.flash(&data).await;
    session.close().await;
    Ok(result?)
}
