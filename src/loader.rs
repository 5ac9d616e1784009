//! The app-layout engine: walking the TBF linked list, merging installed
//! apps with TAB apps, computing placements, and writing the minimal set of
//! page-aligned changes back to the board.

use log::{debug, info, warn};
use regex::Regex;

use crate::app::{App, InstalledApp, PaddingApp};
use crate::attributes::{empty_slot, encode_slot, Attribute};
use crate::board::{
    bootloader_flag_present, find_known_board, read_kernel_attributes, AppSettings,
    BoardInterface,
};
use crate::errors::Error;
use crate::tab::Tab;
use crate::tbf::{TbfFooter, TbfHeader, TBF_BASE_SIZE};
use crate::tickv::TockTicKV;

/// How many bytes to read when probing for a TBF header during the flash
/// walk.
const HEADER_PROBE_LENGTH: u32 = 200;

/// Fixed-address apps further than this past the apps region are assumed to
/// belong to another flash bank.
const FIXED_ADDRESS_WINDOW: u32 = 0x200000;

/// What `install` should do with name collisions.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReplaceMode {
    /// Replace matching apps, add the rest.
    Yes,
    /// Keep duplicates.
    No,
    /// Only replace apps already on the board (`update`).
    Only,
}

/// Options for one `install` invocation.
#[derive(Clone, Debug)]
pub struct InstallOptions {
    pub replace: ReplaceMode,
    pub erase: bool,
    pub sticky: bool,
    pub layout: Option<String>,
}

/// Cross-command behavior switches from the command line.
#[derive(Clone, Debug, Default)]
pub struct LoaderOptions {
    pub force: bool,
    pub bundle_apps: bool,
    pub preserve_order: bool,
}

/// TicKV database placement, resolved from flags or the known-boards table.
#[derive(Clone, Copy, Debug)]
pub struct TickvLocation {
    pub start_address: u32,
    pub region_size: u32,
    pub number_regions: u32,
}

/// Everything `info` reports about a board.
#[derive(Clone, Debug)]
pub struct BoardInfo {
    pub board: Option<String>,
    pub arch: Option<String>,
    pub page_size: u32,
    pub apps_start_address: u32,
    pub bootloader_version: Option<String>,
    pub kernel_version: Option<(u16, u16)>,
    pub apps: Vec<String>,
    pub attributes: Vec<Attribute>,
}

/// Owns a transport and implements every flash-mutating operation.
pub struct Loader {
    channel: Box<dyn BoardInterface>,
    options: LoaderOptions,
}

impl Loader {
    pub fn new(channel: Box<dyn BoardInterface>, options: LoaderOptions) -> Loader {
        Loader { channel, options }
    }

    /// Open the transport, enter the bootloader, resolve the board, run
    /// `operation`, and always attempt to exit the bootloader again.
    fn with_board<T>(
        &mut self,
        operation: impl FnOnce(&mut Loader) -> Result<T, Error>,
    ) -> Result<T, Error> {
        self.channel.open()?;
        self.channel.enter_bootloader_mode()?;
        let result = match self.channel.determine_current_board() {
            Ok(()) => operation(self),
            Err(e) => Err(e),
        };
        if let Err(e) = self.channel.exit_bootloader_mode() {
            // Exit is best effort; the primary error is the interesting one.
            warn!("Could not exit bootloader mode: {}", e);
        }
        result
    }

    fn app_settings(&self) -> AppSettings {
        AppSettings::for_arch(self.channel.get_board_arch())
    }

    fn apps_start_address(&mut self) -> Result<u32, Error> {
        self.channel.get_apps_start_address()
    }

    fn read(&mut self, address: u32, length: u32) -> Result<Vec<u8>, Error> {
        let translated = self.channel.translate_address(address)?;
        self.channel.read_range(translated, length)
    }

    /// Write `bytes` at `address`, expanded to page boundaries, skipping the
    /// write entirely when flash already matches. Returns whether anything
    /// was written.
    fn write_if_changed(&mut self, address: u32, bytes: &[u8]) -> Result<bool, Error> {
        if bytes.is_empty() {
            return Ok(false);
        }
        let existing = self.read(address, bytes.len() as u32)?;
        if existing == bytes {
            debug!(
                "Skipping write at {:#x}: {} bytes already match",
                address,
                bytes.len()
            );
            return Ok(false);
        }

        let page_size = self.channel.get_page_size().max(1);
        let start = address - (address % page_size);
        let end_unaligned = address + bytes.len() as u32;
        let end = end_unaligned.div_ceil(page_size) * page_size;

        // Pull in the neighbors so partial edge pages survive the write.
        let mut buffer = Vec::with_capacity((end - start) as usize);
        if start < address {
            buffer.extend_from_slice(&self.read(start, address - start)?);
        }
        buffer.extend_from_slice(bytes);
        if end > end_unaligned {
            buffer.extend_from_slice(&self.read(end_unaligned, end - end_unaligned)?);
        }

        let translated = self.channel.translate_address(start)?;
        self.channel.flash_binary(translated, &buffer)?;
        Ok(true)
    }

    fn clear_at(&mut self, address: u32) -> Result<(), Error> {
        let translated = self.channel.translate_address(address)?;
        self.channel.clear_bytes(translated)
    }

    /// Terminate the app linked list at `address` unless flash there already
    /// reads as erased.
    fn clear_tail(&mut self, address: u32) -> Result<(), Error> {
        let tail = self.read(address, 16)?;
        if tail.iter().all(|&b| b == 0xff) {
            return Ok(());
        }
        self.clear_at(address)
    }

    /// Walk the TBF linked list from the apps start address.
    ///
    /// Parse failures end the walk, so a partially corrupted flash still
    /// yields the prefix of apps that parses.
    fn extract_installed_apps(&mut self, read_binaries: bool) -> Result<Vec<App>, Error> {
        let mut apps = Vec::new();
        let mut address = self.apps_start_address()?;

        loop {
            debug!("Reading for app header @{:#x}", address);
            let flash = self.read(address, HEADER_PROBE_LENGTH)?;
            let header = match TbfHeader::parse(&flash) {
                Ok(header) => header,
                Err(e) => {
                    debug!("Flash walk ends at {:#x}: {}", address, e);
                    break;
                }
            };
            let total_size = header.app_size();

            if header.is_app() {
                let footer = if header.has_footer() {
                    let footer_start = address + header.binary_end_offset();
                    let footer_bytes = self.read(footer_start, header.footer_size())?;
                    match TbfFooter::parse(&footer_bytes) {
                        Ok(footer) => Some(footer),
                        Err(e) => {
                            warn!("Unparseable footer at {:#x}: {}", footer_start, e);
                            None
                        }
                    }
                } else {
                    None
                };

                let app_binary = if read_binaries {
                    let binary_start = address + header.size_before_app();
                    let binary_length = header.binary_end_offset() - header.size_before_app();
                    Some(self.read(binary_start, binary_length)?)
                } else {
                    None
                };

                apps.push(App::Installed(InstalledApp::new(
                    header, footer, address, app_binary,
                )));
            } else {
                apps.push(App::Padding(PaddingApp::from_flash(header, address)));
            }

            address += total_size;
        }

        debug!("Found {} entries on the board.", apps.len());
        Ok(apps)
    }

    /// Installed apps only (padding dropped), which is what merge logic
    /// works with.
    fn installed_apps(&mut self, read_binaries: bool) -> Result<Vec<App>, Error> {
        Ok(self
            .extract_installed_apps(read_binaries)?
            .into_iter()
            .filter(|app| app.is_app())
            .collect())
    }

    /// Turn TABs into apps for this board, checking compatibility.
    fn extract_apps_from_tabs(&mut self, tabs: &[Tab], arch: &str) -> Result<Vec<App>, Error> {
        let board = self.channel.get_board_name().map(str::to_string);
        let kernel_version = read_kernel_attributes(self.channel.as_mut())
            .ok()
            .and_then(|attrs| attrs.kernel_version);
        let settings = self.app_settings();

        let mut apps = Vec::new();
        for tab in tabs {
            if !self.options.force && !tab.is_compatible_with_board(board.as_deref()) {
                info!(
                    "App \"{}\" is not compatible with your board.",
                    tab.app_name()
                );
                continue;
            }
            if !self.options.force && !tab.is_compatible_with_kernel_version(kernel_version) {
                info!(
                    "App \"{}\" requires a different kernel version than the board is running.",
                    tab.app_name()
                );
                continue;
            }
            let mut app = match tab.extract_app(arch) {
                Ok(app) => app,
                Err(Error::UnsupportedArch(_)) => {
                    info!(
                        "App \"{}\" has no TBF for architecture \"{}\"; skipping.",
                        tab.app_name(),
                        arch
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };
            if settings.size_power_of_two {
                app.round_size_up_to_power_of_two();
            }
            apps.push(App::Tab(app));
        }

        if apps.is_empty() {
            return Err(Error::Usage(
                "No valid apps for this board were provided. Use --force to override.".into(),
            ));
        }
        Ok(apps)
    }

    /// Add or update TABs on the board.
    pub fn install(&mut self, tabs: &[Tab], install: InstallOptions) -> Result<(), Error> {
        if tabs.is_empty() {
            return Err(Error::Usage("No TABs to install.".into()));
        }
        self.with_board(|loader| {
            let arch = loader
                .channel
                .get_board_arch()
                .map(str::to_string)
                .ok_or_else(|| {
                    Error::Usage("Need a known arch to install apps; use --arch.".into())
                })?;

            // An explicit layout bypasses merge logic and all constraints.
            if let Some(layout) = &install.layout {
                let mut replacements = loader.extract_apps_from_tabs(tabs, &arch)?;
                let resulting = build_layout(layout, &mut replacements)?;
                return loader.reshuffle_apps(resulting, true, AppSettings::unconstrained());
            }

            let mut replacements = loader.extract_apps_from_tabs(tabs, &arch)?;
            if install.sticky {
                info!("Marking apps as sticky.");
                for app in &mut replacements {
                    app.set_sticky()?;
                }
            }

            let mut existing = loader.installed_apps(false)?;
            let mut changed = false;

            if install.erase {
                let kept: Vec<App> = existing.drain(..).filter(App::is_sticky).collect();
                if !kept.is_empty() {
                    info!("Not erasing {} sticky app(s).", kept.len());
                }
                changed = true;
                existing = kept;
            }

            let mut resulting: Vec<App> = Vec::new();
            match install.replace {
                ReplaceMode::Yes | ReplaceMode::Only => {
                    for existing_app in existing {
                        let replacement = replacements
                            .iter()
                            .find(|candidate| candidate.name() == existing_app.name())
                            .cloned();
                        match replacement {
                            Some(app) => {
                                resulting.push(app);
                                changed = true;
                            }
                            None => resulting.push(existing_app),
                        }
                    }
                    if install.replace == ReplaceMode::Yes {
                        for replacement in replacements {
                            if !resulting
                                .iter()
                                .any(|app| app.name() == replacement.name())
                            {
                                resulting.push(replacement);
                                changed = true;
                            }
                        }
                    }
                }
                ReplaceMode::No => {
                    resulting = existing;
                    resulting.extend(replacements);
                    changed = true;
                }
            }

            if !changed {
                info!("No matching installed app; nothing to update.");
                return Ok(());
            }
            let preserve_order = loader.options.preserve_order;
            let settings = loader.app_settings();
            loader.reshuffle_apps(resulting, preserve_order, settings)
        })
    }

    /// Remove apps by name by overwriting their headers with padding.
    pub fn uninstall(&mut self, app_names: &[String]) -> Result<(), Error> {
        self.with_board(|loader| {
            let apps = loader.installed_apps(false)?;
            if apps.is_empty() {
                return Err(Error::Usage("No apps are installed on the board.".into()));
            }

            let candidates: Vec<&App> = if app_names.is_empty() {
                if apps.len() == 1 {
                    info!("Only one app on board.");
                    apps.iter().collect()
                } else {
                    let names: Vec<String> = apps.iter().map(App::name).collect();
                    return Err(Error::Usage(format!(
                        "Specify the app(s) to uninstall. Installed: {}",
                        names.join(", ")
                    )));
                }
            } else {
                apps.iter()
                    .filter(|app| app_names.contains(&app.name()))
                    .collect()
            };

            let mut remove = Vec::new();
            for app in candidates {
                if app.is_sticky() && !loader.options.force {
                    info!(
                        "Not removing app \"{}\" because it is sticky; use --force.",
                        app.name()
                    );
                } else {
                    remove.push((app.name(), app.address().unwrap_or(0), app.size()?));
                }
            }
            if remove.is_empty() {
                return Err(Error::Usage(
                    "Could not find any apps on the board to uninstall.".into(),
                ));
            }

            for (name, address, size) in remove {
                debug!(
                    "Replacing \"{}\" at {:#x} with a padding header ({} bytes)",
                    name, address, size
                );
                let padding_header = TbfHeader::padding(size).emit();
                loader.write_if_changed(address, &padding_header)?;
            }
            info!("Uninstall complete.");
            Ok(())
        })
    }

    /// Remove every non-sticky app.
    pub fn erase_apps(&mut self) -> Result<(), Error> {
        self.with_board(|loader| {
            let start = loader.apps_start_address()?;
            if loader.options.force {
                return loader.clear_at(start);
            }

            let apps = loader.installed_apps(false)?;
            let keep: Vec<App> = apps.into_iter().filter(App::is_sticky).collect();
            if keep.is_empty() {
                loader.clear_at(start)?;
                info!("All apps have been erased.");
                Ok(())
            } else {
                info!("Keeping {} sticky app(s).", keep.len());
                let settings = loader.app_settings();
                loader.reshuffle_apps(keep, false, settings)
            }
        })
    }

    /// Set the `enable` or `sticky` flag on apps by name (all apps when
    /// `app_names` is empty).
    pub fn set_flag(
        &mut self,
        app_names: &[String],
        flag_name: &str,
        flag_value: bool,
    ) -> Result<(), Error> {
        self.with_board(|loader| {
            let mut apps = loader.installed_apps(false)?;
            if apps.is_empty() {
                return Err(Error::Usage("No apps are installed on the board.".into()));
            }

            let mut changed = Vec::new();
            for app in &mut apps {
                if app_names.is_empty() || app_names.contains(&app.name()) {
                    if let App::Installed(installed) = app {
                        installed.header_mut().set_flag(flag_name, flag_value)?;
                        changed.push(installed.name().to_string());
                    }
                }
            }
            if changed.is_empty() {
                info!("No matching apps found. Nothing changed.");
                return Ok(());
            }

            let settings = loader.app_settings();
            loader.reshuffle_apps(apps, false, settings)?;
            info!(
                "Set flag \"{}\" to \"{}\" for apps: {}",
                flag_name,
                flag_value,
                changed.join(", ")
            );
            Ok(())
        })
    }

    /// All entries in the apps region; padding included when `verbose`.
    pub fn list_apps(&mut self, verbose: bool) -> Result<Vec<App>, Error> {
        self.with_board(|loader| {
            let apps = loader.extract_installed_apps(false)?;
            Ok(if verbose {
                apps
            } else {
                apps.into_iter().filter(App::is_app).collect()
            })
        })
    }

    /// Board identity, versions, attributes, and installed apps.
    pub fn info(&mut self) -> Result<BoardInfo, Error> {
        self.with_board(|loader| {
            let apps = loader
                .extract_installed_apps(false)?
                .into_iter()
                .filter(App::is_app)
                .map(|app| app.name())
                .collect();
            let attributes = loader
                .channel
                .get_all_attributes()?
                .into_iter()
                .flatten()
                .collect();
            let bootloader_version = loader.channel.get_bootloader_version()?;
            let kernel_version = read_kernel_attributes(loader.channel.as_mut())
                .ok()
                .and_then(|attrs| attrs.kernel_version);
            let apps_start_address = loader.channel.get_apps_start_address()?;
            Ok(BoardInfo {
                board: loader.channel.get_board_name().map(str::to_string),
                arch: loader.channel.get_board_arch().map(str::to_string),
                page_size: loader.channel.get_page_size(),
                apps_start_address,
                bootloader_version,
                kernel_version,
                apps,
                attributes,
            })
        })
    }

    pub fn list_attributes(&mut self) -> Result<Vec<Option<Attribute>>, Error> {
        self.with_board(|loader| {
            if !bootloader_flag_present(loader.channel.as_mut())? {
                return Err(Error::Usage(
                    "No bootloader found! That means there is nowhere for attributes to go."
                        .into(),
                ));
            }
            loader.channel.get_all_attributes()
        })
    }

    /// Store `key=value`, reusing the key's slot or taking the first free
    /// one.
    pub fn set_attribute(&mut self, key: &str, value: &str) -> Result<(), Error> {
        let slot = encode_slot(key, value)?;
        self.with_board(|loader| {
            if !bootloader_flag_present(loader.channel.as_mut())? {
                return Err(Error::Usage(
                    "No bootloader found! That means there is nowhere for attributes to go."
                        .into(),
                ));
            }
            let all = loader.channel.get_all_attributes()?;
            let mut open_index = None;
            for (index, attribute) in all.iter().enumerate() {
                match attribute {
                    Some(attribute) if attribute.key == key => {
                        if attribute.value == value {
                            info!("Attribute already set at slot {}. Nothing to do.", index);
                            return Ok(());
                        }
                        info!("Overwriting attribute at slot {}.", index);
                        return loader.channel.set_attribute(index as u8, &slot);
                    }
                    Some(_) => {}
                    None => {
                        if open_index.is_none() {
                            open_index = Some(index);
                        }
                    }
                }
            }
            match open_index {
                Some(index) => {
                    info!("Writing new attribute to slot {}.", index);
                    loader.channel.set_attribute(index as u8, &slot)
                }
                None => Err(Error::Usage("No open slot to save this attribute.".into())),
            }
        })
    }

    pub fn remove_attribute(&mut self, key: &str) -> Result<(), Error> {
        self.with_board(|loader| {
            let all = loader.channel.get_all_attributes()?;
            for (index, attribute) in all.iter().enumerate() {
                if attribute.as_ref().is_some_and(|a| a.key == key) {
                    info!("Clearing attribute slot {}.", index);
                    return loader.channel.set_attribute(index as u8, &empty_slot());
                }
            }
            Err(Error::Usage(format!("Attribute \"{}\" not found.", key)))
        })
    }

    pub fn set_start_address(&mut self, address: u32) -> Result<(), Error> {
        self.with_board(|loader| loader.channel.set_start_address(address))
    }

    pub fn read_flash(&mut self, address: u32, length: u32) -> Result<Vec<u8>, Error> {
        self.with_board(|loader| loader.read(address, length))
    }

    /// Fill a range with one byte value (`write` subcommand).
    pub fn fill_flash(&mut self, address: u32, length: u32, value: u8) -> Result<(), Error> {
        self.with_board(|loader| {
            loader.write_if_changed(address, &vec![value; length as usize])?;
            Ok(())
        })
    }

    /// Write an arbitrary binary at an address (`flash` subcommand).
    pub fn flash_binary(&mut self, address: u32, binary: &[u8]) -> Result<(), Error> {
        self.with_board(|loader| {
            loader.write_if_changed(address, binary)?;
            Ok(())
        })
    }

    pub fn dump_flash_page(&mut self, page_number: u32) -> Result<(Vec<u8>, u32), Error> {
        self.with_board(|loader| {
            let page_size = loader.channel.get_page_size();
            let address = page_number * page_size;
            let bytes = loader.read(address, page_size)?;
            Ok((bytes, address))
        })
    }

    /// Read the whole TicKV database out of flash.
    pub fn tickv_database(&mut self, location: TickvLocation) -> Result<TockTicKV, Error> {
        self.with_board(|loader| {
            let length = location.region_size * location.number_regions;
            let storage = loader.read(location.start_address, length)?;
            TockTicKV::new(storage, location.region_size as usize)
        })
    }

    /// Write a (mutated) TicKV database back.
    pub fn tickv_write_database(
        &mut self,
        location: TickvLocation,
        database: &TockTicKV,
    ) -> Result<(), Error> {
        self.with_board(|loader| {
            info!("Writing TicKV database back to flash");
            loader.write_if_changed(location.start_address, database.storage())?;
            Ok(())
        })
    }

    /// Resolve the TicKV region from flags, falling back to the board table.
    pub fn tickv_location(
        &mut self,
        start_address: Option<u32>,
        region_size: Option<u32>,
        number_regions: Option<u32>,
    ) -> Result<TickvLocation, Error> {
        if let (Some(start_address), Some(region_size), Some(number_regions)) =
            (start_address, region_size, number_regions)
        {
            return Ok(TickvLocation {
                start_address,
                region_size,
                number_regions,
            });
        }
        let known = self
            .channel
            .get_board_name()
            .and_then(find_known_board)
            .and_then(|board| board.tickv);
        match known {
            Some(tickv) => Ok(TickvLocation {
                start_address: start_address.unwrap_or(tickv.start_address),
                region_size: region_size.unwrap_or(tickv.region_size),
                number_regions: number_regions.unwrap_or(tickv.number_regions),
            }),
            None => Err(Error::Usage(
                "TicKV settings not specified; pass --start-address, --region-size, and \
                 --number-regions."
                    .into(),
            )),
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Placement and writing
    ////////////////////////////////////////////////////////////////////////

    /// Arrange `apps` in the apps region and write out whatever changed.
    fn reshuffle_apps(
        &mut self,
        mut apps: Vec<App>,
        preserve_order: bool,
        settings: AppSettings,
    ) -> Result<(), Error> {
        let start = self.apps_start_address()?;
        debug!("Shuffling apps. Flash={:#x}", start);

        let fixed_count = apps.iter().filter(|app| app.has_fixed_addresses()).count();
        if fixed_count > 0 && fixed_count < apps.len() {
            return Err(Error::PlacementImpossible(
                "mixing fixed-address and position-independent apps is unsupported".into(),
            ));
        }

        let mut placement = if fixed_count > 0 {
            if preserve_order {
                return Err(Error::PlacementImpossible(
                    "cannot preserve order with fixed-address apps".into(),
                ));
            }
            self.place_fixed_apps(apps, start)?
        } else {
            if !preserve_order && settings.sort_size_descending {
                apps.sort_by_key(|app| std::cmp::Reverse(app.size().unwrap_or(0)));
            }
            plan_positions(apps, start, settings)?
        };

        // Apps that move, changed, or get bundled need their binaries in
        // memory before anything on the board is overwritten.
        self.read_in_binaries(&mut placement)?;

        let end = match placement.last() {
            Some((address, app)) => address + app.size()?,
            None => start,
        };

        if self.options.bundle_apps {
            self.write_bundle(placement, start)
        } else {
            for (address, app) in &mut placement {
                if let Some(bytes) = app.binary_at(*address)? {
                    debug!("Writing \"{}\" at {:#x}", app.name(), address);
                    self.write_if_changed(*address, &bytes)?;
                }
            }
            self.clear_tail(end)
        }
    }

    /// Read binaries off the board for installed apps that are about to
    /// move, were modified, or will be bundled.
    fn read_in_binaries(&mut self, placement: &mut [(u32, App)]) -> Result<(), Error> {
        let bundle = self.options.bundle_apps;
        for index in 0..placement.len() {
            let read_span = match &placement[index] {
                (address, App::Installed(installed)) => {
                    let needs_binary =
                        bundle || installed.address() != *address || installed.is_modified();
                    if needs_binary && !installed.has_app_binary() {
                        let header = installed.header();
                        Some((
                            installed.address() + header.size_before_app(),
                            header.binary_end_offset() - header.size_before_app(),
                        ))
                    } else {
                        None
                    }
                }
                _ => None,
            };
            if let Some((binary_start, binary_length)) = read_span {
                info!("Reading app binary at {:#x} from the board.", binary_start);
                let binary = self.read(binary_start, binary_length)?;
                if let (_, App::Installed(installed)) = &mut placement[index] {
                    installed.set_app_binary(binary);
                }
            }
        }
        Ok(())
    }

    /// Placement for fixed-address apps: pick one TBF per app so that the
    /// chosen regions do not overlap, then lay them out with padding between.
    fn place_fixed_apps(
        &mut self,
        mut apps: Vec<App>,
        start: u32,
    ) -> Result<Vec<(u32, App)>, Error> {
        // Builds whose fixed RAM address cannot exist on this board are
        // dropped before anything else.
        if let Ok(attrs) = read_kernel_attributes(self.channel.as_mut()) {
            if let Some((ram_start, _)) = attrs.app_memory {
                for app in &mut apps {
                    if let App::Tab(tab) = app {
                        tab.filter_fixed_ram_address(ram_start);
                    }
                }
            }
        }

        // Candidate (aligned start, size) pairs per app.
        let mut candidates: Vec<Vec<(u32, u32)>> = Vec::with_capacity(apps.len());
        for app in &apps {
            let options: Vec<(u32, u32)> = match app {
                App::Tab(tab) => tab
                    .fixed_starts_and_sizes()
                    .into_iter()
                    .filter(|(candidate, _)| {
                        if *candidate < start {
                            return false;
                        }
                        if *candidate > start + FIXED_ADDRESS_WINDOW {
                            debug!("Ignoring start address {:#x} as too large.", candidate);
                            return false;
                        }
                        true
                    })
                    .collect(),
                App::Installed(installed) => vec![(installed.address(), installed.size())],
                App::Padding(padding) => {
                    vec![(padding.address().unwrap_or(start), padding.size())]
                }
            };
            if options.is_empty() {
                return Err(Error::PlacementImpossible(format!(
                    "app \"{}\" has no usable fixed flash address",
                    app.name()
                )));
            }
            candidates.push(options);
        }

        let chosen = solve_fixed_order(&candidates).ok_or_else(|| {
            Error::PlacementImpossible(
                "could not find a non-overlapping order for the fixed addresses".into(),
            )
        })?;

        // Apps sorted by their assigned start address.
        let mut order: Vec<(u32, usize)> = chosen
            .iter()
            .enumerate()
            .map(|(app_index, &(address, _))| (address, app_index))
            .collect();
        order.sort();

        info!("Found sort order:");
        for (address, app_index) in &order {
            info!(
                "  App \"{}\" at Flash={:#x}",
                apps[*app_index].name(),
                address
            );
        }

        // Walk the cursor forward, narrowing each app to the variant that
        // fits and padding the gaps.
        let mut placement = Vec::new();
        let mut taken: Vec<Option<App>> = apps.into_iter().map(Some).collect();
        let mut cursor = start;
        for (_, app_index) in order {
            let mut app = taken[app_index].take().expect("each app is placed once");
            match app.fix_at_next_loadable_address(cursor) {
                Some(next) if next == cursor => {
                    cursor += app.size()?;
                    placement.push((next, app));
                }
                Some(next) => {
                    let padding = PaddingApp::new(next - cursor);
                    placement.push((cursor, App::Padding(padding)));
                    let size = app.size()?;
                    placement.push((next, app));
                    cursor = next + size;
                }
                None => {
                    return Err(Error::PlacementImpossible(format!(
                        "could not place app \"{}\" at or after {:#x}",
                        app.name(),
                        cursor
                    )));
                }
            }
        }
        Ok(placement)
    }

    /// Concatenate the whole region into one write (`--bundle-apps`).
    fn write_bundle(&mut self, mut placement: Vec<(u32, App)>, start: u32) -> Result<(), Error> {
        let mut bundle = Vec::new();
        for (address, app) in &mut placement {
            let mut bytes = app.emitted_binary(*address)?;
            // Every entry contributes exactly its declared footprint so the
            // addresses that follow stay correct.
            bytes.resize(app.size()? as usize, 0xff);
            bundle.extend_from_slice(&bytes);
        }
        // A terminator so the kernel finds the end of the list.
        bundle.extend_from_slice(&[0xff; 8]);
        info!("Installing app bundle. Size: {} bytes.", bundle.len());
        self.write_if_changed(start, &bundle)?;
        Ok(())
    }
}

/// Compute addresses for position-independent apps, inserting padding where
/// the MPU alignment rule forces a gap.
fn plan_positions(
    apps: Vec<App>,
    start: u32,
    settings: AppSettings,
) -> Result<Vec<(u32, App)>, Error> {
    let mut placement = Vec::new();
    let mut cursor = start;
    for app in apps {
        let size = app.size()?;
        if settings.align_to_size && size > 0 && cursor % size != 0 {
            let next = cursor.div_ceil(size) * size;
            let gap = next - cursor;
            if gap < TBF_BASE_SIZE as u32 {
                return Err(Error::PlacementImpossible(format!(
                    "a {} byte gap at {:#x} is too small for a padding header",
                    gap, cursor
                )));
            }
            debug!("Inserting {} byte padding app at {:#x}", gap, cursor);
            placement.push((cursor, App::Padding(PaddingApp::new(gap))));
            cursor = next;
        }
        if !settings.aligned_ok(cursor, size) {
            return Err(Error::PlacementImpossible(format!(
                "app \"{}\" ({:#x} bytes) cannot satisfy MPU alignment at {:#x}",
                app.name(),
                size,
                cursor
            )));
        }
        placement.push((cursor, app));
        cursor += size;
    }
    Ok(placement)
}

/// Exhaustively search for one candidate per app such that the chosen
/// regions can be laid out in ascending order without overlap.
fn solve_fixed_order(candidates: &[Vec<(u32, u32)>]) -> Option<Vec<(u32, u32)>> {
    fn valid(chosen: &[(u32, u32)]) -> bool {
        let mut regions: Vec<(u32, u32)> = chosen.to_vec();
        regions.sort();
        let mut end = 0u32;
        for (start, size) in regions {
            if start < end {
                return false;
            }
            end = start + size;
        }
        true
    }

    fn search(
        candidates: &[Vec<(u32, u32)>],
        chosen: &mut Vec<(u32, u32)>,
    ) -> bool {
        if chosen.len() == candidates.len() {
            return valid(chosen);
        }
        for &option in &candidates[chosen.len()] {
            chosen.push(option);
            if search(candidates, chosen) {
                return true;
            }
            chosen.pop();
        }
        false
    }

    let mut chosen = Vec::with_capacity(candidates.len());
    if search(candidates, &mut chosen) {
        Some(chosen)
    } else {
        None
    }
}

/// Parse a `--layout` string: `T` consumes the next TAB app, `p<N>` inserts
/// N bytes of padding.
fn build_layout(layout: &str, replacements: &mut Vec<App>) -> Result<Vec<App>, Error> {
    let token = Regex::new(r"(T)|p([0-9]+)").expect("static regex");
    let mut resulting = Vec::new();
    let mut next_app = 0;

    let mut described = Vec::new();
    for capture in token.captures_iter(layout) {
        if capture.get(1).is_some() {
            if next_app >= replacements.len() {
                return Err(Error::Usage(format!(
                    "Insufficient TABs specified for layout: {}",
                    layout
                )));
            }
            resulting.push(replacements[next_app].clone());
            next_app += 1;
            described.push("TBF".to_string());
        } else if let Some(size) = capture.get(2) {
            let size: u32 = size
                .as_str()
                .parse()
                .map_err(|_| Error::Usage(format!("Bad padding size in layout: {}", layout)))?;
            resulting.push(App::Padding(PaddingApp::new(size)));
            described.push(format!("PaddingApp {} bytes", size));
        }
    }
    if resulting.is_empty() {
        return Err(Error::Usage(format!("Unintelligible layout: {}", layout)));
    }
    info!("Using layout: {}", described.join(", "));
    Ok(resulting)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::AppSettings;

    fn padding(size: u32) -> App {
        App::Padding(PaddingApp::new(size))
    }

    #[test]
    fn plan_inserts_padding_for_alignment() {
        // 0x2000 app at 0x30000, then a 0x8000 app must move to 0x38000.
        let apps = vec![padding(0x2000), padding(0x8000)];
        let settings = AppSettings {
            sort_size_descending: false,
            size_power_of_two: false,
            align_to_size: true,
        };
        let placement = plan_positions(apps, 0x30000, settings).unwrap();
        let addresses: Vec<u32> = placement.iter().map(|(address, _)| *address).collect();
        assert_eq!(addresses, vec![0x30000, 0x32000, 0x38000]);
        // The inserted padding covers the gap exactly.
        assert_eq!(placement[1].1.size().unwrap(), 0x6000);
    }

    #[test]
    fn plan_places_back_to_back_when_aligned() {
        let apps = vec![padding(0x4000), padding(0x4000)];
        let settings = AppSettings::for_arch(Some("rv32imac"));
        let placement = plan_positions(apps, 0x40430000, settings).unwrap();
        let addresses: Vec<u32> = placement.iter().map(|(address, _)| *address).collect();
        assert_eq!(addresses, vec![0x40430000, 0x40434000]);
    }

    #[test]
    fn fixed_order_solver_rejects_overlap() {
        // Two apps pinned to the same address cannot both be placed.
        let candidates = vec![vec![(0x38000, 0x4000)], vec![(0x38000, 0x4000)]];
        assert!(solve_fixed_order(&candidates).is_none());
    }

    #[test]
    fn fixed_order_solver_picks_compatible_variants() {
        // First app offers 0x30000 and 0x38000; second only 0x30000. The
        // solver must give the second app 0x30000.
        let candidates = vec![
            vec![(0x30000, 0x4000), (0x38000, 0x4000)],
            vec![(0x30000, 0x4000)],
        ];
        let chosen = solve_fixed_order(&candidates).unwrap();
        assert_eq!(chosen[0].0, 0x38000);
        assert_eq!(chosen[1].0, 0x30000);
    }

    #[test]
    fn layout_string_builds_padding_and_apps() {
        let mut replacements = vec![padding(0x1000), padding(0x1000)];
        let resulting = build_layout("Tp4096T", &mut replacements).unwrap();
        assert_eq!(resulting.len(), 3);
        assert_eq!(resulting[1].size().unwrap(), 4096);
        assert!(build_layout("TTT", &mut replacements).is_err());
    }
}
