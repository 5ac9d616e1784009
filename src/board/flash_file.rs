//! `BoardInterface` over a flash image file on the host.
//!
//! Nothing here talks to hardware: the file stands in for a board's flash,
//! which makes it useful for preparing images and for exercising the layout
//! engine end to end.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use log::{debug, info};

use crate::attributes::{self, Attribute, ATTRIBUTES_OFFSET, ATTRIBUTE_SLOTS, ATTRIBUTE_SLOT_SIZE};
use crate::board::{BoardInterface, BoardSettings};
use crate::errors::{ConnectionError, Error};

/// Cap on how large a flash file may grow, to catch wild addresses before
/// they fill the disk.
const MAX_FLASH_FILE_SIZE: u64 = 0x0800_0000;

/// A board whose flash is a file.
pub struct FlashFile {
    path: PathBuf,
    file: Option<File>,
    settings: BoardSettings,
}

impl FlashFile {
    pub fn new(path: PathBuf, settings: BoardSettings) -> FlashFile {
        FlashFile {
            path,
            file: None,
            settings,
        }
    }

    fn file(&mut self) -> Result<&mut File, Error> {
        self.file
            .as_mut()
            .ok_or(Error::Connection(ConnectionError::DeviceNotFound))
    }

    fn read_at(&mut self, offset: u32, length: u32) -> Result<Vec<u8>, Error> {
        let file = self.file()?;
        let file_length = file.metadata()?.len();
        let mut out = vec![0xffu8; length as usize];
        if (offset as u64) < file_length {
            let available = ((file_length - offset as u64) as usize).min(length as usize);
            file.seek(SeekFrom::Start(offset as u64))?;
            file.read_exact(&mut out[..available])?;
        }
        // Everything past the end of the file reads as erased flash.
        Ok(out)
    }

    fn write_at(&mut self, offset: u32, data: &[u8]) -> Result<(), Error> {
        if offset as u64 + data.len() as u64 > MAX_FLASH_FILE_SIZE {
            return Err(Error::Usage(format!(
                "Write at {:#x} would grow the flash file past {:#x} bytes",
                offset, MAX_FLASH_FILE_SIZE
            )));
        }
        let file = self.file()?;
        let file_length = file.metadata()?.len();
        if (offset as u64) > file_length {
            // Fill the gap with erased flash so reads stay consistent.
            file.seek(SeekFrom::Start(file_length))?;
            let gap = offset as u64 - file_length;
            file.write_all(&vec![0xffu8; gap as usize])?;
        }
        file.seek(SeekFrom::Start(offset as u64))?;
        file.write_all(data)?;
        file.flush()?;
        Ok(())
    }
}

impl BoardInterface for FlashFile {
    fn open(&mut self) -> Result<(), Error> {
        if self.file.is_none() {
            info!("Operating on flash file \"{}\".", self.path.display());
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.path)?;
            self.file = Some(file);
        }
        Ok(())
    }

    fn enter_bootloader_mode(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn exit_bootloader_mode(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn read_range(&mut self, address: u32, length: u32) -> Result<Vec<u8>, Error> {
        debug!("Reading {:#x}..{:#x} from file", address, address + length);
        self.read_at(address, length)
    }

    fn flash_binary(&mut self, address: u32, binary: &[u8]) -> Result<(), Error> {
        self.write_at(address, binary)
    }

    fn erase_page(&mut self, address: u32) -> Result<(), Error> {
        let page_size = self.settings.page_size.max(1);
        self.write_at(address, &vec![0xffu8; page_size as usize])
    }

    fn clear_bytes(&mut self, address: u32) -> Result<(), Error> {
        // Eight zero bytes cannot parse as a version 2 TBF header, which is
        // all "clear" has to guarantee.
        self.write_at(address, &[0u8; 8])
    }

    fn get_attribute(&mut self, index: u8) -> Result<Option<Attribute>, Error> {
        let offset = ATTRIBUTES_OFFSET + index as u32 * ATTRIBUTE_SLOT_SIZE as u32;
        let raw = self.read_at(offset, ATTRIBUTE_SLOT_SIZE as u32)?;
        Ok(attributes::decode_slot(&raw))
    }

    fn get_all_attributes(&mut self) -> Result<Vec<Option<Attribute>>, Error> {
        let raw = self.read_at(
            ATTRIBUTES_OFFSET,
            (ATTRIBUTE_SLOTS as usize * ATTRIBUTE_SLOT_SIZE) as u32,
        )?;
        Ok(raw
            .chunks_exact(ATTRIBUTE_SLOT_SIZE)
            .map(attributes::decode_slot)
            .collect())
    }

    fn set_attribute(&mut self, index: u8, raw: &[u8; 64]) -> Result<(), Error> {
        let offset = ATTRIBUTES_OFFSET + index as u32 * ATTRIBUTE_SLOT_SIZE as u32;
        self.write_at(offset, raw)
    }

    fn set_start_address(&mut self, _address: u32) -> Result<(), Error> {
        Err(Error::Usage(
            "A flash file has no bootloader to set a start address on.".into(),
        ))
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
        // The file starts at the beginning of flash; MCU addresses become
        // file offsets.
        address
            .checked_sub(self.settings.flash_address)
            .ok_or(Error::Connection(ConnectionError::AddressOutOfRange(
                address,
            )))
    }

    fn attached_board_exists(&mut self) -> bool {
        self.path.exists()
    }

    fn bootloader_is_present(&mut self) -> Result<Option<bool>, Error> {
        // Only the flash contents can answer.
        Ok(None)
    }

    fn get_bootloader_version(&mut self) -> Result<Option<String>, Error> {
        Ok(None)
    }

    fn determine_current_board(&mut self) -> Result<(), Error> {
        let all = self.get_all_attributes()?;
        self.settings.absorb_attributes(&all);
        self.settings.absorb_known_board();
        self.settings.require_complete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_board(dir: &TempDir) -> FlashFile {
        let settings = BoardSettings {
            board: Some("hail".into()),
            arch: Some("cortex-m4".into()),
            page_size: 512,
            apps_start_address: Some(0x30000),
            flash_address: 0,
        };
        let mut board = FlashFile::new(dir.path().join("flash.bin"), settings);
        board.open().unwrap();
        board
    }

    #[test]
    fn unwritten_flash_reads_as_erased() {
        let dir = TempDir::new().unwrap();
        let mut board = open_board(&dir);
        assert_eq!(board.read_range(0x1000, 16).unwrap(), vec![0xff; 16]);
    }

    #[test]
    fn writes_read_back_and_gap_is_erased() {
        let dir = TempDir::new().unwrap();
        let mut board = open_board(&dir);
        board.flash_binary(0x200, &[1, 2, 3, 4]).unwrap();
        assert_eq!(board.read_range(0x200, 4).unwrap(), vec![1, 2, 3, 4]);
        // The unwritten prefix reads as erased.
        assert_eq!(board.read_range(0x1fc, 4).unwrap(), vec![0xff; 4]);
    }

    #[test]
    fn attributes_round_trip_through_the_file() {
        let dir = TempDir::new().unwrap();
        let mut board = open_board(&dir);
        let slot = attributes::encode_slot("board", "hail").unwrap();
        board.set_attribute(3, &slot).unwrap();
        let attribute = board.get_attribute(3).unwrap().unwrap();
        assert_eq!(attribute.key, "board");
        assert_eq!(attribute.value, "hail");
        assert!(board.get_attribute(4).unwrap().is_none());
    }

    #[test]
    fn translate_address_subtracts_flash_base() {
        let dir = TempDir::new().unwrap();
        let settings = BoardSettings {
            flash_address: 0x0800_0000,
            page_size: 512,
            ..Default::default()
        };
        let board = FlashFile::new(dir.path().join("flash.bin"), settings);
        assert_eq!(board.translate_address(0x0804_0000).unwrap(), 0x4_0000);
        assert!(board.translate_address(0x100).is_err());
    }
}
