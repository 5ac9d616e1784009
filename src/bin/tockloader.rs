use std::fs;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use log::LevelFilter;
use tockloader::app::TabApp;
use tockloader::cli::{
    self, listen, make_loader, parse_address, print_apps, print_attributes, print_hex_dump,
    print_info, print_known_boards, GlobalArgs,
};
use tockloader::errors::Error;
use tockloader::loader::{InstallOptions, ReplaceMode};
use tockloader::logging::initialize_logger;
use tockloader::tab::Tab;
use tockloader::tbf::CredentialCheck;

/// Main CLI parser.
#[derive(Debug, Parser)]
#[command(about, max_term_width = 100, propagate_version = true, version)]
struct Cli {
    #[command(subcommand)]
    subcommand: Commands,

    #[clap(flatten)]
    global: GlobalArgs,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Open the serial port and print the board's console output
    Listen,
    /// List the apps installed on the board
    List(ListArgs),
    /// Install apps from TAB files onto the board
    Install(InstallArgs),
    /// Update apps that are already installed on the board
    Update(TabListArgs),
    /// Remove apps from the board by name
    Uninstall(AppNamesArgs),
    /// Mark apps so the kernel starts them at boot
    EnableApp(AppNamesArgs),
    /// Mark apps so the kernel does not start them
    DisableApp(AppNamesArgs),
    /// Mark apps sticky so erases skip them
    StickyApp(AppNamesArgs),
    /// Clear the sticky flag
    UnstickyApp(AppNamesArgs),
    /// Write an arbitrary binary file at an address
    Flash(FlashArgs),
    /// Read a range of flash and hex dump it
    Read(ReadArgs),
    /// Fill a range of flash with a byte value
    Write(WriteArgs),
    /// Remove all (non-sticky) apps
    EraseApps,
    /// Print everything known about the attached board
    Info,
    /// Print the bootloader's attribute table
    ListAttributes,
    /// Store a key/value attribute on the board
    SetAttribute(SetAttributeArgs),
    /// Clear an attribute slot by key
    RemoveAttribute(RemoveAttributeArgs),
    /// Tell the bootloader where the kernel starts
    SetStartAddress(AddressArg),
    /// Hex dump one flash page
    DumpFlashPage(PageArg),
    /// List boards with built-in settings
    ListKnownBoards,
    /// Show every TBF inside TAB files
    InspectTab(TabListArgs),
    /// Operate on TBF headers and footers inside TAB files
    Tbf(TbfArgs),
    /// Operate on a TicKV database in flash
    Tickv(TickvArgs),
}

#[derive(Debug, Args)]
struct ListArgs {
    /// Also show padding apps and full header contents
    #[arg(short, long)]
    verbose: bool,
    /// Print only the app names
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Debug, Args)]
struct InstallArgs {
    /// TAB files to install
    #[arg(value_name = "TAB")]
    tab: Vec<PathBuf>,
    /// Mark the installed apps sticky
    #[arg(long)]
    sticky: bool,
}

#[derive(Debug, Args)]
struct TabListArgs {
    /// TAB files
    #[arg(value_name = "TAB", required = true)]
    tab: Vec<PathBuf>,
}

#[derive(Debug, Args)]
struct AppNamesArgs {
    /// Names of apps to operate on (all matching apps when omitted)
    name: Vec<String>,
}

#[derive(Debug, Args)]
struct FlashArgs {
    /// Binary file to write
    binary: PathBuf,
    /// Address to write it at
    #[arg(value_parser = parse_address)]
    address: u32,
}

#[derive(Debug, Args)]
struct ReadArgs {
    #[arg(value_parser = parse_address)]
    address: u32,
    #[arg(value_parser = parse_address)]
    length: u32,
}

#[derive(Debug, Args)]
struct WriteArgs {
    #[arg(value_parser = parse_address)]
    address: u32,
    #[arg(value_parser = parse_address)]
    length: u32,
    /// Byte value to fill with
    #[arg(default_value = "0", value_parser = parse_address)]
    value: u32,
}

#[derive(Debug, Args)]
struct SetAttributeArgs {
    key: String,
    value: String,
}

#[derive(Debug, Args)]
struct RemoveAttributeArgs {
    key: String,
}

#[derive(Debug, Args)]
struct AddressArg {
    #[arg(value_parser = parse_address)]
    address: u32,
}

#[derive(Debug, Args)]
struct PageArg {
    /// Page number (not address)
    #[arg(value_parser = parse_address)]
    page: u32,
}

#[derive(Debug, Args)]
struct TbfArgs {
    #[command(subcommand)]
    command: TbfCommands,
}

#[derive(Debug, Subcommand)]
enum TbfCommands {
    /// Add, modify, or delete header TLVs
    Tlv {
        #[command(subcommand)]
        command: TlvCommands,
    },
    /// Add or delete footer credentials
    Credential {
        #[command(subcommand)]
        command: CredentialCommands,
    },
}

#[derive(Debug, Subcommand)]
enum TlvCommands {
    /// Add a TLV built from parameters to every TBF in a TAB
    Add {
        tab: PathBuf,
        /// TLV name, e.g. "fixed_addresses"
        name: String,
        /// TLV-specific parameters
        parameters: Vec<String>,
    },
    /// Set a field of an existing TLV
    Modify {
        tab: PathBuf,
        name: String,
        field: String,
        #[arg(value_parser = cli::parse_address)]
        value: u32,
    },
    /// Remove a TLV from every TBF in a TAB
    Delete { tab: PathBuf, name: String },
}

#[derive(Debug, Subcommand)]
enum CredentialCommands {
    /// Compute and insert a credential into every TBF footer
    Add {
        tab: PathBuf,
        /// Credential type, e.g. "sha256" or "ecdsap256"
        kind: String,
        /// Public key file, when the credential type needs one
        #[arg(long)]
        public_key: Option<PathBuf>,
        /// Private key file, when the credential type needs one
        #[arg(long)]
        private_key: Option<PathBuf>,
        /// Identifier for cleartext_id credentials
        #[arg(long, default_value_t = 0)]
        cleartext_id: u64,
    },
    /// Replace a credential with reserved padding
    Delete { tab: PathBuf, kind: String },
}

#[derive(Debug, Args)]
struct TickvArgs {
    #[command(subcommand)]
    command: TickvCommands,

    /// Address of the database in flash
    #[arg(long, value_parser = parse_address)]
    start_address: Option<u32>,

    /// Size of one database region
    #[arg(long, value_parser = parse_address)]
    region_size: Option<u32>,

    /// Number of regions in the database
    #[arg(long, value_parser = parse_address)]
    number_regions: Option<u32>,
}

#[derive(Debug, Subcommand)]
enum TickvCommands {
    /// Read the value stored under a key
    Get { key: String },
    /// Store a key/value pair
    Append {
        key: String,
        value: String,
        #[arg(long, default_value_t = 0)]
        write_id: u32,
    },
    /// Mark the value stored under a key as deleted
    Invalidate { key: String },
    /// Show every object in the database
    Dump,
    /// Reclaim space held by invalidated objects
    Cleanup,
    /// Erase the database and re-initialize it
    Reset,
}

fn main() {
    miette::set_panic_hook();

    let cli = Cli::parse();
    let level = if cli.global.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    initialize_logger(level);

    if let Err(error) = run(cli) {
        let code = error.exit_code();
        eprintln!("{:?}", miette::Report::new(error));
        std::process::exit(code);
    }
}

fn run(cli: Cli) -> Result<(), Error> {
    let global = &cli.global;
    let format = global.output_format;

    match cli.subcommand {
        Commands::Listen => listen(global),
        Commands::List(args) => {
            let mut loader = make_loader(global)?;
            let apps = loader.list_apps(args.verbose)?;
            print_apps(&apps, args.verbose, args.quiet, format);
            Ok(())
        }
        Commands::Install(args) => {
            let tabs = open_tabs(&args.tab)?;
            let mut loader = make_loader(global)?;
            loader.install(
                &tabs,
                InstallOptions {
                    replace: if global.no_replace {
                        ReplaceMode::No
                    } else {
                        ReplaceMode::Yes
                    },
                    erase: global.erase,
                    sticky: args.sticky,
                    layout: global.layout.clone(),
                },
            )
        }
        Commands::Update(args) => {
            let tabs = open_tabs(&args.tab)?;
            let mut loader = make_loader(global)?;
            loader.install(
                &tabs,
                InstallOptions {
                    replace: ReplaceMode::Only,
                    erase: global.erase,
                    sticky: false,
                    layout: None,
                },
            )
        }
        Commands::Uninstall(args) => make_loader(global)?.uninstall(&args.name),
        Commands::EnableApp(args) => make_loader(global)?.set_flag(&args.name, "enable", true),
        Commands::DisableApp(args) => make_loader(global)?.set_flag(&args.name, "enable", false),
        Commands::StickyApp(args) => make_loader(global)?.set_flag(&args.name, "sticky", true),
        Commands::UnstickyApp(args) => make_loader(global)?.set_flag(&args.name, "sticky", false),
        Commands::Flash(args) => {
            let binary = fs::read(&args.binary)?;
            make_loader(global)?.flash_binary(args.address, &binary)
        }
        Commands::Read(args) => {
            let bytes = make_loader(global)?.read_flash(args.address, args.length)?;
            print_hex_dump(&bytes, args.address);
            Ok(())
        }
        Commands::Write(args) => {
            make_loader(global)?.fill_flash(args.address, args.length, args.value as u8)
        }
        Commands::EraseApps => make_loader(global)?.erase_apps(),
        Commands::Info => {
            let info = make_loader(global)?.info()?;
            print_info(&info, format);
            Ok(())
        }
        Commands::ListAttributes => {
            let attributes = make_loader(global)?.list_attributes()?;
            print_attributes(&attributes, format);
            Ok(())
        }
        Commands::SetAttribute(args) => {
            make_loader(global)?.set_attribute(&args.key, &args.value)
        }
        Commands::RemoveAttribute(args) => make_loader(global)?.remove_attribute(&args.key),
        Commands::SetStartAddress(args) => make_loader(global)?.set_start_address(args.address),
        Commands::DumpFlashPage(args) => {
            let (bytes, address) = make_loader(global)?.dump_flash_page(args.page)?;
            print_hex_dump(&bytes, address);
            Ok(())
        }
        Commands::ListKnownBoards => {
            print_known_boards(format);
            Ok(())
        }
        Commands::InspectTab(args) => inspect_tabs(&args.tab),
        Commands::Tbf(args) => match args.command {
            TbfCommands::Tlv { command } => run_tlv_command(command),
            TbfCommands::Credential { command } => run_credential_command(command),
        },
        Commands::Tickv(args) => run_tickv_command(global, args),
    }
}

fn open_tabs(paths: &[PathBuf]) -> Result<Vec<Tab>, Error> {
    if paths.is_empty() {
        return Err(Error::Usage("No TAB files specified.".into()));
    }
    paths.iter().map(|path| Tab::open(path)).collect()
}

fn inspect_tabs(paths: &[PathBuf]) -> Result<(), Error> {
    for path in paths {
        let tab = Tab::open(path)?;
        println!("{}", tab);
        for tbf in tab.extract_all()? {
            println!();
            println!("{}:", tbf.filename());
            println!("{}", tbf.header());
            if let Some(footer) = tbf.footer() {
                println!("{}", footer);
            }
        }
        println!();
    }
    Ok(())
}

/// Load a TAB, apply `operation` to the app, and write the TAB back.
fn modify_tab(
    path: &PathBuf,
    operation: impl FnOnce(&mut TabApp) -> Result<(), Error>,
) -> Result<(), Error> {
    let mut tab = Tab::open(path)?;
    let tbfs = tab.extract_all()?;
    let mut app = TabApp::new(tab.app_name().to_string(), tbfs);
    operation(&mut app)?;
    let members = app.names_and_binaries()?;
    tab.write_back(path, members)
}

fn run_tlv_command(command: TlvCommands) -> Result<(), Error> {
    match command {
        TlvCommands::Add {
            tab,
            name,
            parameters,
        } => modify_tab(&tab, |app| app.add_tlv(&name, &parameters)),
        TlvCommands::Modify {
            tab,
            name,
            field,
            value,
        } => modify_tab(&tab, |app| app.modify_tlv(&name, &field, value as u64)),
        TlvCommands::Delete { tab, name } => modify_tab(&tab, |app| app.delete_tlv(&name)),
    }
}

fn run_credential_command(command: CredentialCommands) -> Result<(), Error> {
    match command {
        CredentialCommands::Add {
            tab,
            kind,
            public_key,
            private_key,
            cleartext_id,
        } => {
            let public_key = public_key.map(fs::read).transpose()?;
            let private_key = private_key.map(fs::read).transpose()?;
            modify_tab(&tab, |app| {
                app.add_credential(
                    &kind,
                    public_key.as_deref(),
                    private_key.as_deref(),
                    cleartext_id,
                )
            })?;
            // Prove the credential verifies before declaring success.
            let tab = Tab::open(&tab)?;
            let app = TabApp::new(tab.app_name().to_string(), tab.extract_all()?);
            let keys: Vec<Vec<u8>> = Vec::new();
            for (filename, credential_kind, check) in app.verify_credentials(&keys) {
                if check == CredentialCheck::Fail {
                    log::error!(
                        "Credential {:#x} in {} failed verification",
                        credential_kind,
                        filename
                    );
                    return Err(Error::CredentialVerifyFailed);
                }
            }
            Ok(())
        }
        CredentialCommands::Delete { tab, kind } => {
            modify_tab(&tab, |app| app.delete_credential(&kind))
        }
    }
}

fn run_tickv_command(global: &GlobalArgs, args: TickvArgs) -> Result<(), Error> {
    let mut loader = make_loader(global)?;
    let location =
        loader.tickv_location(args.start_address, args.region_size, args.number_regions)?;

    match args.command {
        TickvCommands::Get { key } => {
            let database = loader.tickv_database(location)?;
            let object = database.get(&key)?;
            println!("{}", object);
            println!(
                "  Value: {}",
                object
                    .value
                    .iter()
                    .map(|b| format!("{:02x}", b))
                    .collect::<String>()
            );
            if let Ok(text) = std::str::from_utf8(&object.value) {
                println!("  Text:  {}", text);
            }
            Ok(())
        }
        TickvCommands::Append {
            key,
            value,
            write_id,
        } => {
            let mut database = loader.tickv_database(location)?;
            database.append(&key, value.into_bytes(), write_id)?;
            loader.tickv_write_database(location, &database)
        }
        TickvCommands::Invalidate { key } => {
            let mut database = loader.tickv_database(location)?;
            database.invalidate(&key)?;
            loader.tickv_write_database(location, &database)
        }
        TickvCommands::Dump => {
            let database = loader.tickv_database(location)?;
            print!("{}", database.dump());
            Ok(())
        }
        TickvCommands::Cleanup => {
            let mut database = loader.tickv_database(location)?;
            database.cleanup()?;
            loader.tickv_write_database(location, &database)
        }
        TickvCommands::Reset => {
            let mut database = loader.tickv_database(location)?;
            database.reset();
            loader.tickv_write_database(location, &database)
        }
    }
}
