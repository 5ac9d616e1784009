//! The capability contract every transport implements, plus the built-in
//! knowledge tockloader has about Tock boards.

pub mod bootloader;
pub mod flash_file;
pub mod kernel_attributes;

use log::debug;

use crate::attributes::Attribute;
use crate::errors::Error;
use self::kernel_attributes::KernelAttributes;

/// Where apps start when nothing else says otherwise.
pub const DEFAULT_APPS_START_ADDRESS: u32 = 0x30000;

/// Flash offset of the `TOCKBOOTLOADER` marker string.
pub const BOOTLOADER_FLAG_OFFSET: u32 = 0x400;
pub const BOOTLOADER_FLAG: &[u8; 14] = b"TOCKBOOTLOADER";

/// TicKV placement for boards that carry a database.
#[derive(Clone, Copy, Debug)]
pub struct TickvSettings {
    pub start_address: u32,
    pub region_size: u32,
    pub number_regions: u32,
}

/// Built-in board knowledge: enough to use a board whose attribute table is
/// missing or stale.
#[derive(Clone, Copy, Debug)]
pub struct KnownBoard {
    pub name: &'static str,
    pub description: &'static str,
    pub arch: &'static str,
    pub page_size: u32,
    pub apps_start_address: Option<u32>,
    pub tickv: Option<TickvSettings>,
}

/// Boards tockloader has built-in settings for.
pub static KNOWN_BOARDS: &[KnownBoard] = &[
    KnownBoard {
        name: "hail",
        description: "Hail development module",
        arch: "cortex-m4",
        page_size: 512,
        apps_start_address: Some(0x30000),
        tickv: None,
    },
    KnownBoard {
        name: "imix",
        description: "Low-power IoT research platform",
        arch: "cortex-m4",
        page_size: 512,
        apps_start_address: Some(0x30000),
        tickv: None,
    },
    KnownBoard {
        name: "nrf52dk",
        description: "Nordic nRF52-based development kit",
        arch: "cortex-m4",
        page_size: 4096,
        apps_start_address: Some(0x40000),
        tickv: Some(TickvSettings {
            start_address: 0x12000000,
            region_size: 4096,
            number_regions: 32,
        }),
    },
    KnownBoard {
        name: "nano33ble",
        description: "Arduino Nano 33 BLE board",
        arch: "cortex-m4",
        page_size: 4096,
        apps_start_address: Some(0x40000),
        tickv: None,
    },
    KnownBoard {
        name: "microbit_v2",
        description: "BBC micro:bit v2",
        arch: "cortex-m4",
        page_size: 4096,
        apps_start_address: Some(0x40000),
        tickv: None,
    },
    KnownBoard {
        name: "hifive1b",
        description: "SiFive HiFive1 rev B RISC-V board",
        arch: "rv32imac",
        page_size: 4096,
        apps_start_address: Some(0x20040000),
        tickv: None,
    },
    KnownBoard {
        name: "arty",
        description: "Arty FPGA running a SiFive RISC-V core",
        arch: "rv32imac",
        page_size: 0x10000,
        apps_start_address: Some(0x40430000),
        tickv: None,
    },
    KnownBoard {
        name: "raspberry_pi_pico",
        description: "Raspberry Pi Pico",
        arch: "cortex-m0",
        page_size: 4096,
        apps_start_address: Some(0x10020000),
        tickv: None,
    },
    KnownBoard {
        name: "stm32f4discovery",
        description: "STM32F4-based discovery board",
        arch: "cortex-m4",
        page_size: 2048,
        apps_start_address: Some(0x08040000),
        tickv: None,
    },
];

pub fn find_known_board(name: &str) -> Option<&'static KnownBoard> {
    KNOWN_BOARDS.iter().find(|board| board.name == name)
}

/// How apps must be sized and aligned for this board's memory protection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppSettings {
    /// Place bigger apps first so alignment padding stays small.
    pub sort_size_descending: bool,
    /// Round each app's `total_length` up to a power of two.
    pub size_power_of_two: bool,
    /// Start each app on a multiple of its own size.
    pub align_to_size: bool,
}

impl AppSettings {
    /// The Cortex-M MPU wants power-of-two regions aligned to their size;
    /// RISC-V PMP imposes nothing the kernel cannot handle.
    pub fn for_arch(arch: Option<&str>) -> AppSettings {
        match arch {
            Some(arch) if arch.starts_with("cortex-m") => AppSettings {
                sort_size_descending: true,
                size_power_of_two: true,
                align_to_size: true,
            },
            _ => AppSettings::unconstrained(),
        }
    }

    /// Used when the user supplies an explicit layout.
    pub fn unconstrained() -> AppSettings {
        AppSettings {
            sort_size_descending: false,
            size_power_of_two: false,
            align_to_size: false,
        }
    }

    /// The MPU alignment predicate: can an app of `size` bytes live at
    /// `address`?
    pub fn aligned_ok(&self, address: u32, size: u32) -> bool {
        if self.size_power_of_two && (!size.is_power_of_two() || size < 256) {
            return false;
        }
        if self.align_to_size && size != 0 && address % size != 0 {
            return false;
        }
        true
    }
}

/// Identity of the attached board, resolved from (in priority order) command
/// line options, the board's attribute table, and the known-boards table.
#[derive(Clone, Debug, Default)]
pub struct BoardSettings {
    pub board: Option<String>,
    pub arch: Option<String>,
    pub page_size: u32,
    pub apps_start_address: Option<u32>,
    /// Address where flash begins in the MCU's address space.
    pub flash_address: u32,
}

impl BoardSettings {
    /// Fill unset fields from the attribute table read off the board.
    pub fn absorb_attributes(&mut self, attributes: &[Option<Attribute>]) {
        for attribute in attributes.iter().flatten() {
            match attribute.key.as_str() {
                "board" if self.board.is_none() => {
                    self.board = Some(attribute.value.clone());
                }
                "arch" if self.arch.is_none() => {
                    self.arch = Some(attribute.value.clone());
                }
                "pagesize" if self.page_size == 0 => {
                    if let Some(value) = attribute.value_as_int() {
                        self.page_size = value as u32;
                    }
                }
                "appaddr" if self.apps_start_address.is_none() => {
                    if let Some(value) = attribute.value_as_int() {
                        self.apps_start_address = Some(value as u32);
                    }
                }
                _ => {}
            }
        }
    }

    /// Fill unset fields from the known-boards table.
    pub fn absorb_known_board(&mut self) {
        let Some(known) = self.board.as_deref().and_then(find_known_board) else {
            return;
        };
        debug!("Using built-in settings for board \"{}\"", known.name);
        if self.arch.is_none() {
            self.arch = Some(known.arch.to_string());
        }
        if self.page_size == 0 {
            self.page_size = known.page_size;
        }
        if self.apps_start_address.is_none() {
            self.apps_start_address = known.apps_start_address;
        }
    }

    /// Fail unless board, arch, and page size are all known.
    pub fn require_complete(&self) -> Result<(), Error> {
        if self.board.is_none() {
            return Err(Error::Usage(
                "Could not determine the board. Specify one with --board.".into(),
            ));
        }
        if self.arch.is_none() {
            return Err(Error::Usage(
                "Could not determine the architecture. Specify one with --arch.".into(),
            ));
        }
        if self.page_size == 0 {
            return Err(Error::Usage(
                "Could not determine the flash page size. Specify one with --page-size.".into(),
            ));
        }
        Ok(())
    }
}

/// The capability surface of a transport: everything the layout engine needs
/// to manipulate a board's flash.
///
/// Addresses passed to `read_range`, `flash_binary`, `erase_page`, and
/// `clear_bytes` are already translated; callers go through
/// `translate_address` first.
pub trait BoardInterface {
    /// Open the link to the board (serial port, file handle, ...).
    fn open(&mut self) -> Result<(), Error>;

    /// Get the board into a mode where flash can be read and written.
    fn enter_bootloader_mode(&mut self) -> Result<(), Error>;

    /// Leave bootloader mode so the kernel runs again.
    fn exit_bootloader_mode(&mut self) -> Result<(), Error>;

    fn read_range(&mut self, address: u32, length: u32) -> Result<Vec<u8>, Error>;

    /// Write `binary` at `address`. Both must be page aligned.
    fn flash_binary(&mut self, address: u32, binary: &[u8]) -> Result<(), Error>;

    fn erase_page(&mut self, address: u32) -> Result<(), Error>;

    /// Clear at least one byte at `address` so the flash after the last app
    /// no longer parses as a TBF header.
    fn clear_bytes(&mut self, address: u32) -> Result<(), Error>;

    fn get_attribute(&mut self, index: u8) -> Result<Option<Attribute>, Error>;

    fn get_all_attributes(&mut self) -> Result<Vec<Option<Attribute>>, Error>;

    fn set_attribute(&mut self, index: u8, raw: &[u8; 64]) -> Result<(), Error>;

    /// Tell the bootloader where the kernel starts.
    fn set_start_address(&mut self, address: u32) -> Result<(), Error>;

    fn get_board_name(&self) -> Option<&str>;

    fn get_board_arch(&self) -> Option<&str>;

    fn get_page_size(&self) -> u32;

    fn get_apps_start_address(&mut self) -> Result<u32, Error>;

    /// Address where flash begins in the MCU address space.
    fn get_flash_address(&self) -> u32;

    /// Map a kernel-visible address to the address this transport uses
    /// (memory-mapped QSPI, flash-file offsets).
    fn translate_address(&self, address: u32) -> Result<u32, Error>;

    /// Whether a board this transport can drive appears to be attached.
    fn attached_board_exists(&mut self) -> bool;

    /// `Some(true)`/`Some(false)` when the transport knows, `None` when only
    /// the flash contents can tell.
    fn bootloader_is_present(&mut self) -> Result<Option<bool>, Error>;

    fn get_bootloader_version(&mut self) -> Result<Option<String>, Error>;

    /// Resolve board identity (name, arch, page size), typically from the
    /// attribute table.
    fn determine_current_board(&mut self) -> Result<(), Error>;
}

/// Read the kernel attributes that sit right below the apps region.
pub fn read_kernel_attributes(
    channel: &mut dyn BoardInterface,
) -> Result<KernelAttributes, Error> {
    let apps_start = channel.get_apps_start_address()?;
    let address = channel.translate_address(apps_start.saturating_sub(100))?;
    let buffer = channel.read_range(address, 100)?;
    Ok(KernelAttributes::parse(&buffer))
}

/// Check for the bootloader marker string when the transport cannot answer
/// directly.
pub fn bootloader_flag_present(channel: &mut dyn BoardInterface) -> Result<bool, Error> {
    if let Some(known) = channel.bootloader_is_present()? {
        return Ok(known);
    }
    let address =
        channel.translate_address(channel.get_flash_address() + BOOTLOADER_FLAG_OFFSET)?;
    let flag = channel.read_range(address, BOOTLOADER_FLAG.len() as u32)?;
    Ok(flag == BOOTLOADER_FLAG)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cortex_m_settings_enforce_mpu_rules() {
        let settings = AppSettings::for_arch(Some("cortex-m4"));
        assert!(settings.aligned_ok(0x30000, 0x4000));
        // Not a power of two.
        assert!(!settings.aligned_ok(0x30000, 0x3000));
        // Smaller than the minimum MPU region.
        assert!(!settings.aligned_ok(0x30000, 128));
        // Misaligned for its size.
        assert!(!settings.aligned_ok(0x32000, 0x4000));
    }

    #[test]
    fn riscv_settings_are_unconstrained() {
        let settings = AppSettings::for_arch(Some("rv32imac"));
        assert!(settings.aligned_ok(0x40430004, 0x3001));
    }

    #[test]
    fn board_settings_resolution_order() {
        let mut settings = BoardSettings {
            board: Some("hail".into()),
            page_size: 256,
            ..Default::default()
        };
        settings.absorb_attributes(&[
            Some(Attribute {
                key: "arch".into(),
                value: "cortex-m4".into(),
            }),
            Some(Attribute {
                key: "appaddr".into(),
                value: "0x38000".into(),
            }),
            None,
        ]);
        settings.absorb_known_board();
        // The explicit page size wins over hail's built-in 512.
        assert_eq!(settings.page_size, 256);
        assert_eq!(settings.arch.as_deref(), Some("cortex-m4"));
        assert_eq!(settings.apps_start_address, Some(0x38000));
        assert!(settings.require_complete().is_ok());
    }
}
