//! Shared command-line types and helpers for the `tockloader` binary.

use std::io::Write;
use std::path::PathBuf;

use clap::{Args, ValueEnum};
use comfy_table::{presets::UTF8_FULL, Cell, Table};
use log::info;
use serde_json::json;

use crate::app::App;
use crate::attributes::Attribute;
use crate::board::bootloader::BootloaderSerial;
use crate::board::flash_file::FlashFile;
use crate::board::{BoardInterface, BoardSettings, KNOWN_BOARDS};
use crate::connection::Connection;
use crate::errors::Error;
use crate::loader::{BoardInfo, Loader, LoaderOptions};
use crate::tbf::tlv::parse_int;

/// Parse a decimal or `0x`-prefixed address argument.
pub fn parse_address(s: &str) -> Result<u32, String> {
    parse_int(s)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| format!("\"{}\" is not a valid address", s))
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable tables.
    Terminal,
    /// Machine-readable JSON.
    Json,
}

/// Flags every subcommand accepts.
#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Name of the board to operate on
    #[arg(long, global = true)]
    pub board: Option<String>,

    /// Processor architecture apps must be compiled for
    #[arg(long, global = true)]
    pub arch: Option<String>,

    /// Flash page size in bytes
    #[arg(long, global = true, value_parser = parse_address)]
    pub page_size: Option<u32>,

    /// Address in flash where apps start
    #[arg(long, global = true, value_parser = parse_address)]
    pub app_address: Option<u32>,

    /// Serial port connected to the board
    #[arg(short = 'p', long, global = true)]
    pub port: Option<String>,

    /// Baud rate to negotiate after connecting
    #[arg(long, global = true)]
    pub baud_rate: Option<u32>,

    /// Use JLinkExe to flash (external programmer)
    #[arg(long, global = true)]
    pub jlink: bool,

    /// Use OpenOCD to flash (external programmer)
    #[arg(long, global = true)]
    pub openocd: bool,

    /// Use stlink to flash (external programmer)
    #[arg(long, global = true)]
    pub stlink: bool,

    /// Operate on a local flash image file instead of hardware
    #[arg(long, global = true, value_name = "FILE")]
    pub flash_file: Option<PathBuf>,

    /// Address where flash starts in the chip's address space
    #[arg(long, global = true, value_parser = parse_address)]
    pub flash_address: Option<u32>,

    /// Concatenate all apps and flash the region in one write
    #[arg(long, global = true)]
    pub bundle_apps: bool,

    /// Explicit app layout, e.g. "Tp4096T"
    #[arg(long, global = true)]
    pub layout: Option<String>,

    /// Keep apps in the order given instead of sorting them
    #[arg(long, global = true)]
    pub preserve_order: bool,

    /// Remove all non-sticky apps before installing
    #[arg(long, global = true)]
    pub erase: bool,

    /// Install alongside existing apps instead of replacing same-named ones
    #[arg(long, global = true)]
    pub no_replace: bool,

    /// Allow operations the board or app metadata advises against
    #[arg(long, global = true)]
    pub force: bool,

    /// Print lots of operational detail
    #[arg(long, global = true)]
    pub debug: bool,

    /// How results should be printed
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Terminal)]
    pub output_format: OutputFormat,
}

impl GlobalArgs {
    pub fn board_settings(&self) -> BoardSettings {
        let mut settings = BoardSettings {
            board: self.board.clone(),
            arch: self.arch.clone(),
            page_size: self.page_size.unwrap_or(0),
            apps_start_address: self.app_address,
            flash_address: self.flash_address.unwrap_or(0),
        };
        settings.absorb_known_board();
        settings
    }

    pub fn loader_options(&self) -> LoaderOptions {
        LoaderOptions {
            force: self.force,
            bundle_apps: self.bundle_apps,
            preserve_order: self.preserve_order,
        }
    }
}

/// Pick the transport the flags ask for.
pub fn select_channel(args: &GlobalArgs) -> Result<Box<dyn BoardInterface>, Error> {
    if args.jlink || args.openocd || args.stlink {
        return Err(Error::Usage(
            "External programmer transports (JLinkExe, OpenOCD, stlink) are driven as \
             separate programs and are not built into this tool."
                .into(),
        ));
    }
    let settings = args.board_settings();
    if let Some(path) = &args.flash_file {
        return Ok(Box::new(FlashFile::new(path.clone(), settings)));
    }
    Ok(Box::new(BootloaderSerial::new(
        args.port.clone(),
        args.baud_rate,
        settings,
    )))
}

pub fn make_loader(args: &GlobalArgs) -> Result<Loader, Error> {
    Ok(Loader::new(select_channel(args)?, args.loader_options()))
}

/// Relay serial output from the board to the terminal until interrupted.
pub fn listen(args: &GlobalArgs) -> Result<(), Error> {
    let mut connection = Connection::open(args.port.as_deref())?;
    info!("Listening for serial output.");
    let stdout = std::io::stdout();
    let mut buffer = [0u8; 256];
    loop {
        let n = connection.read_raw(&mut buffer)?;
        if n > 0 {
            let mut handle = stdout.lock();
            handle.write_all(&buffer[..n])?;
            handle.flush()?;
        }
    }
}

/// Print the apps found on the board.
pub fn print_apps(apps: &[App], verbose: bool, quiet: bool, format: OutputFormat) {
    if format == OutputFormat::Json {
        let list: Vec<_> = apps
            .iter()
            .map(|app| {
                json!({
                    "name": app.name(),
                    "is_app": app.is_app(),
                    "enabled": app.is_enabled(),
                    "sticky": app.is_sticky(),
                    "size": app.size().ok(),
                    "address": app.address(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&json!({ "apps": list })).unwrap());
        return;
    }

    if quiet {
        let names: Vec<String> = apps.iter().map(App::name).collect();
        println!("{}", names.join(" "));
        return;
    }

    if apps.is_empty() {
        println!("No found apps.");
        return;
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(["Name", "Enabled", "Sticky", "Size", "Address"]);
    for app in apps {
        table.add_row([
            Cell::new(app.name()),
            Cell::new(app.is_enabled()),
            Cell::new(app.is_sticky()),
            Cell::new(
                app.size()
                    .map(|s| format!("{} bytes", s))
                    .unwrap_or_else(|_| "?".into()),
            ),
            Cell::new(
                app.address()
                    .map(|a| format!("{:#x}", a))
                    .unwrap_or_else(|| "-".into()),
            ),
        ]);
    }
    println!("{table}");

    if verbose {
        for app in apps {
            match app {
                App::Installed(installed) => {
                    println!();
                    println!("{}", installed.header());
                    if let Some(footer) = installed.footer() {
                        println!("{}", footer);
                    }
                }
                App::Padding(padding) => {
                    println!();
                    println!("Padding ({} bytes)", padding.size());
                }
                App::Tab(_) => {}
            }
        }
    }
}

/// Print the attribute table.
pub fn print_attributes(attributes: &[Option<Attribute>], format: OutputFormat) {
    if format == OutputFormat::Json {
        let list: Vec<_> = attributes
            .iter()
            .enumerate()
            .filter_map(|(index, attribute)| {
                attribute
                    .as_ref()
                    .map(|a| json!({"index": index, "key": a.key, "value": a.value}))
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({ "attributes": list })).unwrap()
        );
        return;
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(["Slot", "Key", "Value"]);
    for (index, attribute) in attributes.iter().enumerate() {
        match attribute {
            Some(attribute) => table.add_row([
                Cell::new(index),
                Cell::new(&attribute.key),
                Cell::new(&attribute.value),
            ]),
            None => table.add_row([Cell::new(index), Cell::new(""), Cell::new("")]),
        };
    }
    println!("{table}");
}

/// Print everything `info` collected.
pub fn print_info(info: &BoardInfo, format: OutputFormat) {
    if format == OutputFormat::Json {
        let value = json!({
            "board": info.board,
            "arch": info.arch,
            "page_size": info.page_size,
            "apps_start_address": info.apps_start_address,
            "bootloader_version": info.bootloader_version,
            "kernel_version": info.kernel_version.map(|(major, minor)| format!("{}.{}", major, minor)),
            "apps": info.apps,
            "attributes": info.attributes.iter()
                .map(|a| json!({"key": a.key, "value": a.value}))
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&value).unwrap());
        return;
    }

    println!("Board:              {}", info.board.as_deref().unwrap_or("unknown"));
    println!("Architecture:       {}", info.arch.as_deref().unwrap_or("unknown"));
    println!("Page size:          {} bytes", info.page_size);
    println!("Apps start address: {:#x}", info.apps_start_address);
    println!(
        "Bootloader version: {}",
        info.bootloader_version.as_deref().unwrap_or("unknown")
    );
    match info.kernel_version {
        Some((major, minor)) => println!("Kernel version:     {}.{}", major, minor),
        None => println!("Kernel version:     unknown"),
    }
    if info.apps.is_empty() {
        println!("Apps:               none");
    } else {
        println!("Apps:               {}", info.apps.join(", "));
    }
    println!();
    let attributes: Vec<Option<Attribute>> =
        info.attributes.iter().cloned().map(Some).collect();
    print_attributes(&attributes, OutputFormat::Terminal);
}

/// Print the boards tockloader has built-in settings for.
pub fn print_known_boards(format: OutputFormat) {
    if format == OutputFormat::Json {
        let list: Vec<_> = KNOWN_BOARDS
            .iter()
            .map(|board| {
                json!({
                    "name": board.name,
                    "description": board.description,
                    "arch": board.arch,
                    "page_size": board.page_size,
                    "apps_start_address": board.apps_start_address,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({ "boards": list })).unwrap()
        );
        return;
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(["Board", "Description", "Arch", "Page Size", "Apps Address"]);
    for board in KNOWN_BOARDS {
        table.add_row([
            Cell::new(board.name),
            Cell::new(board.description),
            Cell::new(board.arch),
            Cell::new(board.page_size),
            Cell::new(
                board
                    .apps_start_address
                    .map(|a| format!("{:#x}", a))
                    .unwrap_or_else(|| "-".into()),
            ),
        ]);
    }
    println!("{table}");
}

/// Hex dump in the classic 16-bytes-per-line format.
pub fn print_hex_dump(bytes: &[u8], base_address: u32) {
    for (i, chunk) in bytes.chunks(16).enumerate() {
        let mut line = format!("{:#010x}  ", base_address as usize + i * 16);
        for byte in chunk {
            line.push_str(&format!("{:02x} ", byte));
        }
        let ascii: String = chunk
            .iter()
            .map(|&b| {
                if (0x20..0x7f).contains(&b) {
                    b as char
                } else {
                    '.'
                }
            })
            .collect();
        println!("{:<62} |{}|", line, ascii);
    }
}
