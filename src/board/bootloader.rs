//! `BoardInterface` over the Tock bootloader's serial protocol.

use crc::Crc;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use serde::Deserialize;

use crate::attributes::{self, Attribute, ATTRIBUTE_SLOTS};
use crate::board::{BoardInterface, BoardSettings};
use crate::command::{Command, MAX_READ_LENGTH};
use crate::connection::{any_board_attached, Connection, FAST_BAUD_RATE};
use crate::errors::{ConnectionError, Error};

/// The bootloader computes CRCs with the IEEE polynomial (0xEDB88320
/// reflected); `CRC_32_ISO_HDLC` is that algorithm.
const FLASH_CRC: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// Full write-then-verify attempts before giving up on a range.
const FLASH_VERIFY_ATTEMPTS: usize = 3;

/// The version field of the INFO response blob.
#[derive(Deserialize)]
struct BootloaderInfo {
    version: String,
}

/// A board driven through a Tock bootloader on a serial port.
pub struct BootloaderSerial {
    device: Option<String>,
    baud_rate: u32,
    settings: BoardSettings,
    connection: Option<Connection>,
    attributes: Option<Vec<Option<Attribute>>>,
}

impl BootloaderSerial {
    pub fn new(device: Option<String>, baud_rate: Option<u32>, settings: BoardSettings) -> Self {
        BootloaderSerial {
            device,
            baud_rate: baud_rate.unwrap_or(FAST_BAUD_RATE),
            settings,
            connection: None,
            attributes: None,
        }
    }

    fn connection(&mut self) -> Result<&mut Connection, Error> {
        self.connection
            .as_mut()
            .ok_or(Error::Connection(ConnectionError::DeviceNotFound))
    }

    fn page_size_checked(&self) -> Result<u32, Error> {
        let page_size = self.settings.page_size;
        if page_size == 0 {
            return Err(Error::Usage(
                "Flash page size unknown; specify --page-size.".into(),
            ));
        }
        Ok(page_size)
    }

    /// One pass of WRITE_PAGE commands over the whole range.
    fn write_pages(&mut self, address: u32, binary: &[u8], page_size: u32) -> Result<(), Error> {
        let pages = binary.chunks_exact(page_size as usize);
        let bar = ProgressBar::new((binary.len() / page_size as usize) as u64);
        bar.set_style(
            ProgressStyle::with_template("[{bar:40}] {pos:>4}/{len:4} pages")
                .expect("static template")
                .progress_chars("=> "),
        );
        for (i, page) in pages.enumerate() {
            let page_address = address + i as u32 * page_size;
            self.connection()?.issue_command(&Command::WritePage {
                address: page_address,
                page,
            })?;
            bar.inc(1);
        }
        bar.finish_and_clear();
        Ok(())
    }

    fn crc_internal_flash(&mut self, address: u32, length: u32) -> Result<u32, Error> {
        let response = self
            .connection()?
            .issue_command(&Command::CrcInternalFlash { address, length })?;
        Ok(u32::from_le_bytes(response[0..4].try_into().unwrap()))
    }
}

impl BoardInterface for BootloaderSerial {
    fn open(&mut self) -> Result<(), Error> {
        if self.connection.is_none() {
            self.connection = Some(Connection::open(self.device.as_deref())?);
        }
        Ok(())
    }

    fn enter_bootloader_mode(&mut self) -> Result<(), Error> {
        let baud_rate = self.baud_rate;
        let connection = self.connection()?;
        connection.enter_bootloader_mode()?;
        // Speculatively go faster; the default stays if the bootloader is
        // too old to negotiate.
        connection.change_baud_rate(baud_rate)?;
        Ok(())
    }

    fn exit_bootloader_mode(&mut self) -> Result<(), Error> {
        self.connection()?.exit_bootloader_mode()
    }

    fn read_range(&mut self, mut address: u32, length: u32) -> Result<Vec<u8>, Error> {
        debug!("Reading {:#x}..{:#x}", address, address + length);
        let mut out = Vec::with_capacity(length as usize);
        let mut remaining = length;
        while remaining > 0 {
            let chunk = remaining.min(MAX_READ_LENGTH as u32) as u16;
            let bytes = self.connection()?.issue_command(&Command::ReadRange {
                address,
                length: chunk,
            })?;
            out.extend_from_slice(&bytes);
            address += chunk as u32;
            remaining -= chunk as u32;
        }
        Ok(out)
    }

    fn flash_binary(&mut self, address: u32, binary: &[u8]) -> Result<(), Error> {
        let page_size = self.page_size_checked()?;
        if address % page_size != 0 || binary.len() % page_size as usize != 0 {
            return Err(Error::Usage(format!(
                "flash_binary needs page-aligned writes; got {:#x} + {:#x} with {} byte pages",
                address,
                binary.len(),
                page_size
            )));
        }

        for attempt in 0..FLASH_VERIFY_ATTEMPTS {
            self.write_pages(address, binary, page_size)?;

            // Read back a CRC over the whole run and compare with ours.
            let expected = FLASH_CRC.checksum(binary);
            let on_chip = self.crc_internal_flash(address, binary.len() as u32)?;
            if expected == on_chip {
                if attempt > 0 {
                    info!("Flash CRC verified after {} retries", attempt);
                }
                return Ok(());
            }
            warn!(
                "CRC mismatch at {:#x}: local {:#010x}, board {:#010x}",
                address, expected, on_chip
            );
        }
        Err(Error::FlashVerifyFailed {
            address,
            length: binary.len(),
        })
    }

    fn erase_page(&mut self, address: u32) -> Result<(), Error> {
        self.connection()?
            .issue_command(&Command::ErasePage { address })?;
        Ok(())
    }

    fn clear_bytes(&mut self, address: u32) -> Result<(), Error> {
        debug!("Clearing bytes starting at {:#x}", address);
        let page_size = self.page_size_checked()?;
        if address % page_size == 0 {
            return self.erase_page(address);
        }
        // Not on a page boundary: rewrite the containing page with 0xFF over
        // the bytes being cleared.
        let page_address = address - (address % page_size);
        let mut page = self.read_range(page_address, page_size)?;
        let offset = (address - page_address) as usize;
        let end = (offset + 8).min(page.len());
        page[offset..end].fill(0xff);
        self.flash_binary(page_address, &page)
    }

    fn get_attribute(&mut self, index: u8) -> Result<Option<Attribute>, Error> {
        if let Some(cache) = &self.attributes {
            if let Some(slot) = cache.get(index as usize) {
                return Ok(slot.clone());
            }
        }
        let raw = self
            .connection()?
            .issue_command(&Command::GetAttribute { index })?;
        Ok(attributes::decode_slot(&raw))
    }

    fn get_all_attributes(&mut self) -> Result<Vec<Option<Attribute>>, Error> {
        if let Some(cache) = &self.attributes {
            return Ok(cache.clone());
        }
        let mut all = Vec::with_capacity(ATTRIBUTE_SLOTS as usize);
        for index in 0..ATTRIBUTE_SLOTS {
            let raw = self
                .connection()?
                .issue_command(&Command::GetAttribute { index })?;
            all.push(attributes::decode_slot(&raw));
        }
        self.attributes = Some(all.clone());
        Ok(all)
    }

    fn set_attribute(&mut self, index: u8, raw: &[u8; 64]) -> Result<(), Error> {
        // The cache no longer matches the board.
        self.attributes = None;
        self.connection()?
            .issue_command(&Command::SetAttribute {
                index,
                raw: &raw[..],
            })?;
        Ok(())
    }

    fn set_start_address(&mut self, address: u32) -> Result<(), Error> {
        self.connection()?
            .issue_command(&Command::SetStartAddress { address })?;
        Ok(())
    }

    fn get_board_name(&self) -> Option<&str> {
        self.settings.board.as_deref()
    }

    fn get_board_arch(&self) -> Option<&str> {
        self.settings.arch.as_deref()
    }

    fn get_page_size(&self) -> u32 {
        self.settings.page_size
    }

    fn get_apps_start_address(&mut self) -> Result<u32, Error> {
        if let Some(address) = self.settings.apps_start_address {
            return Ok(address);
        }
        let all = self.get_all_attributes()?;
        self.settings.absorb_attributes(&all);
        Ok(self
            .settings
            .apps_start_address
            .unwrap_or(crate::board::DEFAULT_APPS_START_ADDRESS))
    }

    fn get_flash_address(&self) -> u32 {
        self.settings.flash_address
    }

    fn translate_address(&self, address: u32) -> Result<u32, Error> {
        // The bootloader addresses flash the same way the kernel does.
        Ok(address)
    }

    fn attached_board_exists(&mut self) -> bool {
        any_board_attached()
    }

    fn bootloader_is_present(&mut self) -> Result<Option<bool>, Error> {
        // We are talking to it.
        Ok(Some(true))
    }

    fn get_bootloader_version(&mut self) -> Result<Option<String>, Error> {
        let response = self.connection()?.issue_command(&Command::Info)?;
        let length = response[0] as usize;
        if length == 0 || length >= response.len() {
            return Ok(None);
        }
        let Ok(json) = std::str::from_utf8(&response[1..1 + length]) else {
            return Ok(None);
        };
        match serde_json::from_str::<BootloaderInfo>(json) {
            Ok(parsed) => Ok(Some(parsed.version)),
            Err(_) => {
                debug!("INFO response was not the expected JSON: {:?}", json);
                Ok(None)
            }
        }
    }

    fn determine_current_board(&mut self) -> Result<(), Error> {
        if self.settings.board.is_some()
            && self.settings.arch.is_some()
            && self.settings.page_size > 0
        {
            return Ok(());
        }
        let all = self.get_all_attributes()?;
        self.settings.absorb_attributes(&all);
        self.settings.absorb_known_board();
        self.settings.require_complete()
    }
}
