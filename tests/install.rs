//! End-to-end layout engine tests driven through the flash-file back-end.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use tockloader::app::App;
use tockloader::attributes::Attribute;
use tockloader::board::flash_file::FlashFile;
use tockloader::board::{BoardInterface, BoardSettings};
use tockloader::errors::Error;
use tockloader::loader::{InstallOptions, Loader, LoaderOptions, ReplaceMode};
use tockloader::tab::Tab;
use tockloader::tbf::tlv::{Tlv, TlvFixedAddresses, TlvMain, TlvProgram};
use tockloader::tbf::{checksum_of, TbfHeader};

const APPS_START: u32 = 0x30000;

/// Build a complete TBF: base header, TLVs, app binary fill, optional footer.
fn make_tbf(tlvs: Vec<Tlv>, total_size: u32, footer_size: u32, fill: u8) -> Vec<u8> {
    let header_size = 16 + tlvs.iter().map(|t| t.size()).sum::<usize>();
    let mut header = Vec::new();
    header.extend_from_slice(&2u16.to_le_bytes());
    header.extend_from_slice(&(header_size as u16).to_le_bytes());
    header.extend_from_slice(&total_size.to_le_bytes());
    header.extend_from_slice(&1u32.to_le_bytes()); // enabled
    header.extend_from_slice(&0u32.to_le_bytes());
    for tlv in &tlvs {
        header.extend_from_slice(&tlv.pack());
    }
    let checksum = checksum_of(&header);
    header[12..16].copy_from_slice(&checksum.to_le_bytes());

    let mut tbf = header;
    tbf.resize((total_size - footer_size) as usize, fill);
    if footer_size > 0 {
        // One reserved credential filling the whole footer.
        tbf.extend_from_slice(&0x80u16.to_le_bytes());
        tbf.extend_from_slice(&((footer_size - 4) as u16).to_le_bytes());
        tbf.extend_from_slice(&0u32.to_le_bytes());
        tbf.resize(total_size as usize, 0);
    }
    tbf
}

/// A position-independent app with a `Main` TLV.
fn make_pic_tbf(name: &str, total_size: u32) -> Vec<u8> {
    make_tbf(
        vec![
            Tlv::Main(TlvMain {
                init_fn_offset: 41,
                protected_size: 0,
                minimum_ram_size: 4096,
            }),
            Tlv::PackageName(name.into()),
        ],
        total_size,
        0,
        0x61,
    )
}

/// A fixed-address app with a `Program` TLV and reserved footer space.
fn make_fixed_tbf(name: &str, total_size: u32, fixed_flash: u32, footer_size: u32) -> Vec<u8> {
    let tlvs = vec![
        Tlv::Program(TlvProgram {
            init_fn_offset: 41,
            protected_size: 0,
            minimum_ram_size: 4096,
            binary_end_offset: total_size - footer_size,
            app_version: 0,
        }),
        Tlv::PackageName(name.into()),
        Tlv::FixedAddresses(TlvFixedAddresses {
            ram_address: 0x20008000,
            flash_address: fixed_flash,
        }),
    ];
    make_tbf(tlvs, total_size, footer_size, 0x63)
}

/// Write a TAB archive holding one TBF for cortex-m4.
fn make_tab(dir: &Path, name: &str, tbf: &[u8]) -> PathBuf {
    let path = dir.join(format!("{}.tab", name));
    let file = std::fs::File::create(&path).unwrap();
    let mut builder = tar::Builder::new(file);

    let metadata = format!("tab-version = 1\nname = \"{}\"\n", name);
    let mut header = tar::Header::new_gnu();
    header.set_size(metadata.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "metadata.toml", metadata.as_bytes())
        .unwrap();

    let mut header = tar::Header::new_gnu();
    header.set_size(tbf.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, "cortex-m4.tbf", tbf).unwrap();
    builder.into_inner().unwrap();
    path
}

fn board_settings(page_size: u32) -> BoardSettings {
    BoardSettings {
        board: Some("hail".into()),
        arch: Some("cortex-m4".into()),
        page_size,
        apps_start_address: Some(APPS_START),
        flash_address: 0,
    }
}

/// Wraps a flash-file board and counts mutating transport calls.
struct CountingBoard {
    inner: FlashFile,
    writes: std::rc::Rc<std::cell::Cell<usize>>,
}

impl BoardInterface for CountingBoard {
    fn open(&mut self) -> Result<(), Error> {
        self.inner.open()
    }
    fn enter_bootloader_mode(&mut self) -> Result<(), Error> {
        self.inner.enter_bootloader_mode()
    }
    fn exit_bootloader_mode(&mut self) -> Result<(), Error> {
        self.inner.exit_bootloader_mode()
    }
    fn read_range(&mut self, address: u32, length: u32) -> Result<Vec<u8>, Error> {
        self.inner.read_range(address, length)
    }
    fn flash_binary(&mut self, address: u32, binary: &[u8]) -> Result<(), Error> {
        self.writes.set(self.writes.get() + 1);
        self.inner.flash_binary(address, binary)
    }
    fn erase_page(&mut self, address: u32) -> Result<(), Error> {
        self.writes.set(self.writes.get() + 1);
        self.inner.erase_page(address)
    }
    fn clear_bytes(&mut self, address: u32) -> Result<(), Error> {
        self.writes.set(self.writes.get() + 1);
        self.inner.clear_bytes(address)
    }
    fn get_attribute(&mut self, index: u8) -> Result<Option<Attribute>, Error> {
        self.inner.get_attribute(index)
    }
    fn get_all_attributes(&mut self) -> Result<Vec<Option<Attribute>>, Error> {
        self.inner.get_all_attributes()
    }
    fn set_attribute(&mut self, index: u8, raw: &[u8; 64]) -> Result<(), Error> {
        self.inner.set_attribute(index, raw)
    }
    fn set_start_address(&mut self, address: u32) -> Result<(), Error> {
        self.inner.set_start_address(address)
    }
    fn get_board_name(&self) -> Option<&str> {
        self.inner.get_board_name()
    }
    fn get_board_arch(&self) -> Option<&str> {
        self.inner.get_board_arch()
    }
    fn get_page_size(&self) -> u32 {
        self.inner.get_page_size()
    }
    fn get_apps_start_address(&mut self) -> Result<u32, Error> {
        self.inner.get_apps_start_address()
    }
    fn get_flash_address(&self) -> u32 {
        self.inner.get_flash_address()
    }
    fn translate_address(&self, address: u32) -> Result<u32, Error> {
        self.inner.translate_address(address)
    }
    fn attached_board_exists(&mut self) -> bool {
        self.inner.attached_board_exists()
    }
    fn bootloader_is_present(&mut self) -> Result<Option<bool>, Error> {
        self.inner.bootloader_is_present()
    }
    fn get_bootloader_version(&mut self) -> Result<Option<String>, Error> {
        self.inner.get_bootloader_version()
    }
    fn determine_current_board(&mut self) -> Result<(), Error> {
        self.inner.determine_current_board()
    }
}

fn loader_for(flash_path: &Path, page_size: u32) -> Loader {
    let board = FlashFile::new(flash_path.to_path_buf(), board_settings(page_size));
    Loader::new(Box::new(board), LoaderOptions::default())
}

fn counting_loader(
    flash_path: &Path,
    page_size: u32,
) -> (Loader, std::rc::Rc<std::cell::Cell<usize>>) {
    let writes = std::rc::Rc::new(std::cell::Cell::new(0));
    let board = CountingBoard {
        inner: FlashFile::new(flash_path.to_path_buf(), board_settings(page_size)),
        writes: writes.clone(),
    };
    (Loader::new(Box::new(board), LoaderOptions::default()), writes)
}

fn install_options() -> InstallOptions {
    InstallOptions {
        replace: ReplaceMode::Yes,
        erase: false,
        sticky: false,
        layout: None,
    }
}

#[test]
fn install_one_app_and_walk_it_back() {
    let dir = TempDir::new().unwrap();
    let tab_path = make_tab(dir.path(), "blink", &make_pic_tbf("blink", 0x4000));
    let flash = dir.path().join("flash.bin");

    let mut loader = loader_for(&flash, 512);
    let tab = Tab::open(&tab_path).unwrap();
    loader.install(&[tab], install_options()).unwrap();

    // Walking the linked list yields exactly one app named blink.
    let mut loader = loader_for(&flash, 512);
    let apps = loader.list_apps(false).unwrap();
    assert_eq!(apps.len(), 1);
    assert_eq!(apps[0].name(), "blink");
    assert_eq!(apps[0].size().unwrap(), 0x4000);
    assert_eq!(apps[0].address(), Some(APPS_START));

    // The byte after the app reads as erased flash.
    let mut loader = loader_for(&flash, 512);
    let tail = loader.read_flash(APPS_START + 0x4000, 1).unwrap();
    assert_eq!(tail, vec![0xff]);
}

#[test]
fn second_install_of_same_tab_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let tab_path = make_tab(dir.path(), "blink", &make_pic_tbf("blink", 0x4000));
    let flash = dir.path().join("flash.bin");

    let tab = Tab::open(&tab_path).unwrap();
    let mut loader = loader_for(&flash, 512);
    loader.install(&[tab], install_options()).unwrap();

    let tab = Tab::open(&tab_path).unwrap();
    let (mut loader, writes) = counting_loader(&flash, 512);
    loader.install(&[tab], install_options()).unwrap();
    assert_eq!(writes.get(), 0, "identical install must be write-free");
}

#[test]
fn uninstall_replaces_app_with_padding() {
    let dir = TempDir::new().unwrap();
    let tab_a = make_tab(dir.path(), "a", &make_pic_tbf("a", 0x4000));
    let tab_b = make_tab(dir.path(), "b", &make_pic_tbf("b", 0x4000));
    let flash = dir.path().join("flash.bin");

    let tabs = vec![Tab::open(&tab_a).unwrap(), Tab::open(&tab_b).unwrap()];
    let mut loader = loader_for(&flash, 512);
    loader.install(&tabs, install_options()).unwrap();

    let mut loader = loader_for(&flash, 512);
    loader.uninstall(&["b".to_string()]).unwrap();

    // The walk now yields "a" followed by a padding entry of b's size.
    let mut loader = loader_for(&flash, 512);
    let entries = loader.list_apps(true).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].name(), "a");
    assert!(matches!(entries[1], App::Padding(_)));
    assert_eq!(entries[1].size().unwrap(), 0x4000);
}

#[test]
fn install_fixed_address_app_pads_from_region_start() {
    let dir = TempDir::new().unwrap();
    // Binary must land at 0x38400; region starts at 0x30000 (page 1024).
    let tbf = make_fixed_tbf("c", 0x4000, 0x38400, 0x800);
    let tab_path = make_tab(dir.path(), "c", &tbf);
    let flash = dir.path().join("flash.bin");

    let tab = Tab::open(&tab_path).unwrap();
    let mut loader = loader_for(&flash, 1024);
    loader.install(&[tab], install_options()).unwrap();

    let mut loader = loader_for(&flash, 1024);
    let entries = loader.list_apps(true).unwrap();
    assert_eq!(entries.len(), 2);
    // A padding app fills 0x30000..0x38000.
    assert!(matches!(entries[0], App::Padding(_)));
    assert_eq!(entries[0].address(), Some(APPS_START));
    assert_eq!(entries[0].size().unwrap(), 0x8000);
    // The app's header grew so its binary sits exactly at 0x38400.
    assert_eq!(entries[1].name(), "c");
    assert_eq!(entries[1].address(), Some(0x38000));
    match &entries[1] {
        App::Installed(installed) => {
            assert_eq!(installed.header().size_before_app(), 0x400);
            assert_eq!(
                installed.header().fixed_addresses(),
                Some((0x20008000, 0x38400))
            );
        }
        _ => panic!("expected an installed app"),
    }
}

#[test]
fn update_without_matching_app_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let tab_a = make_tab(dir.path(), "a", &make_pic_tbf("a", 0x4000));
    let tab_c = make_tab(dir.path(), "c", &make_pic_tbf("c", 0x4000));
    let flash = dir.path().join("flash.bin");

    let mut loader = loader_for(&flash, 512);
    loader
        .install(&[Tab::open(&tab_a).unwrap()], install_options())
        .unwrap();

    // `update` (replace=only) with an app that is not installed: success,
    // zero writes.
    let (mut loader, writes) = counting_loader(&flash, 512);
    loader
        .install(
            &[Tab::open(&tab_c).unwrap()],
            InstallOptions {
                replace: ReplaceMode::Only,
                erase: false,
                sticky: false,
                layout: None,
            },
        )
        .unwrap();
    assert_eq!(writes.get(), 0);

    let mut loader = loader_for(&flash, 512);
    let apps = loader.list_apps(false).unwrap();
    assert_eq!(apps.len(), 1);
    assert_eq!(apps[0].name(), "a");
}

#[test]
fn mpu_placement_is_size_aligned() {
    let dir = TempDir::new().unwrap();
    // 0x600 rounds up to a 0x800 power-of-two footprint.
    let tab_small = make_tab(dir.path(), "small", &make_pic_tbf("small", 0x600));
    let tab_big = make_tab(dir.path(), "big", &make_pic_tbf("big", 0x2000));
    let flash = dir.path().join("flash.bin");

    let tabs = vec![Tab::open(&tab_small).unwrap(), Tab::open(&tab_big).unwrap()];
    let mut loader = loader_for(&flash, 512);
    loader.install(&tabs, install_options()).unwrap();

    let mut loader = loader_for(&flash, 512);
    let apps = loader.list_apps(false).unwrap();
    assert_eq!(apps.len(), 2);
    for app in &apps {
        let address = app.address().unwrap();
        let size = app.size().unwrap();
        assert!(size.is_power_of_two() && size >= 256);
        assert_eq!(address % size, 0, "app at {:#x} misaligned", address);
    }
    // Bigger app first, apps end to end.
    assert_eq!(apps[0].name(), "big");
    assert_eq!(apps[0].address(), Some(APPS_START));
    assert_eq!(apps[1].address(), Some(APPS_START + 0x2000));
}

#[test]
fn erase_apps_clears_the_first_header() {
    let dir = TempDir::new().unwrap();
    let tab_path = make_tab(dir.path(), "blink", &make_pic_tbf("blink", 0x4000));
    let flash = dir.path().join("flash.bin");

    let mut loader = loader_for(&flash, 512);
    loader
        .install(&[Tab::open(&tab_path).unwrap()], install_options())
        .unwrap();

    let mut loader = loader_for(&flash, 512);
    loader.erase_apps().unwrap();

    let mut loader = loader_for(&flash, 512);
    assert!(loader.list_apps(false).unwrap().is_empty());
}

#[test]
fn disable_app_survives_round_trip() {
    let dir = TempDir::new().unwrap();
    let tab_path = make_tab(dir.path(), "blink", &make_pic_tbf("blink", 0x4000));
    let flash = dir.path().join("flash.bin");

    let mut loader = loader_for(&flash, 512);
    loader
        .install(&[Tab::open(&tab_path).unwrap()], install_options())
        .unwrap();

    let mut loader = loader_for(&flash, 512);
    loader
        .set_flag(&["blink".to_string()], "enable", false)
        .unwrap();

    let mut loader = loader_for(&flash, 512);
    let apps = loader.list_apps(false).unwrap();
    assert_eq!(apps.len(), 1);
    assert!(!apps[0].is_enabled());

    // The rewritten header still verifies where it stands.
    let mut loader = loader_for(&flash, 512);
    let header_bytes = loader.read_flash(APPS_START, 200).unwrap();
    TbfHeader::parse(&header_bytes).unwrap();
}

#[test]
fn sticky_app_survives_erase() {
    let dir = TempDir::new().unwrap();
    let tab_a = make_tab(dir.path(), "a", &make_pic_tbf("a", 0x4000));
    let tab_b = make_tab(dir.path(), "b", &make_pic_tbf("b", 0x4000));
    let flash = dir.path().join("flash.bin");

    let mut loader = loader_for(&flash, 512);
    loader
        .install(
            &[Tab::open(&tab_a).unwrap()],
            InstallOptions {
                sticky: true,
                ..install_options()
            },
        )
        .unwrap();
    let mut loader = loader_for(&flash, 512);
    loader
        .install(&[Tab::open(&tab_b).unwrap()], install_options())
        .unwrap();

    let mut loader = loader_for(&flash, 512);
    loader.erase_apps().unwrap();

    let mut loader = loader_for(&flash, 512);
    let apps = loader.list_apps(false).unwrap();
    assert_eq!(apps.len(), 1);
    assert_eq!(apps[0].name(), "a");
    assert!(apps[0].is_sticky());
}
