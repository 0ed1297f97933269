use std::{path::PathBuf, process::ExitCode};

use clap::{Args, Parser, Subcommand};
use clap_num::maybe_hex;
use parse_size::parse_size;

use dfu_host::{AddressFixup, DeviceFilter, SessionOptions};
use detach::*;
use error::CliError;
use list::*;
use read::*;
use write::*;

mod detach;
mod error;
mod list;
mod read;
mod reporter;
mod write;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Clone, Default)]
struct FilterArgs {
    /// vendor ID (ex: "0483")
    #[clap(short, long, value_parser=hex_u16)]
    vendor: Option<u16>,
    /// product ID (ex: "df11")
    #[clap(short, long, value_parser=hex_u16)]
    product: Option<u16>,
    /// serial number
    #[clap(short, long)]
    serial: Option<String>,
}

impl From<FilterArgs> for DeviceFilter {
    fn from(args: FilterArgs) -> Self {
        DeviceFilter {
            vendor_id: args.vendor,
            product_id: args.product,
            serial_number: args.serial,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// list DFU devices
    List {
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// read from device
    Read {
        /// file to write
        file: PathBuf,
        #[command(flatten)]
        filter: FilterArgs,
        /// start address (ex: 0x08000000)
        #[clap(short = 'a', long, value_parser=maybe_hex::<u32>)]
        start_address: Option<u32>,
        /// length (ex: 64K, 2MB)
        #[clap(short, long, value_parser=parse_length)]
        length: Option<u32>,
    },
    /// write to device
    Write {
        /// raw binary image
        file: PathBuf,
        #[command(flatten)]
        filter: FilterArgs,
        /// start address (ex: 0x08000000)
        #[clap(short = 'a', long, value_parser=maybe_hex::<u32>)]
        start_address: Option<u32>,
        /// move a reported base address (ex: 0x90000000+0x40000)
        #[clap(long)]
        address_fixup: Vec<AddressFixup>,
        /// override the transfer size reported by the device
        #[clap(short, long, value_parser=maybe_hex::<u16>)]
        transfer_size: Option<u16>,
    },
    /// detach a runtime device into its DFU bootloader
    Detach {
        #[command(flatten)]
        filter: FilterArgs,
    },
}

impl Default for Commands {
    fn default() -> Self {
        Commands::List {
            filter: FilterArgs::default(),
        }
    }
}

fn hex_u16(s: &str) -> Result<u16, String> {
    <u16>::from_str_radix(s, 16).map_err(|e| format!("{e}"))
}

fn parse_length(s: &str) -> Result<u32, String> {
    let len = parse_size(s).map_err(|e| format!("{e}"))?;
    len.try_into().map_err(|e| format!("{e}"))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::init();

    let result = async_io::block_on(async {
        match cli.command.unwrap_or_default() {
            Commands::List { filter } => list_dfu_devices(&filter.into()).await,
            Commands::Read {
                file,
                filter,
                start_address,
                length,
            } => {
                let options = SessionOptions {
                    start_address,
                    ..Default::default()
                };
                read_file(&file, &filter.into(), &options, length).await
            }
            Commands::Write {
                file,
                filter,
                start_address,
                address_fixup,
                transfer_size,
            } => {
                let options = SessionOptions {
                    start_address,
                    address_fixups: address_fixup,
                    transfer_size,
                    ..Default::default()
                };
                write_file(&file, &filter.into(), &options).await
            }
            Commands::Detach { filter } => {
                detach(&filter.into(), &SessionOptions::default()).await
            }
        }
    });

    if let Err(err) = result {
        eprintln!("Error: {err}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
