//! Apps discovered by walking the TBF linked list on a board.

use crate::errors::Error;
use crate::tbf::{TbfFooter, TbfHeader};

/// An application found in flash. The header is always present; the
/// application binary itself is only read from the board when the app might
/// need to move or be re-emitted.
#[derive(Clone, Debug)]
pub struct InstalledApp {
    header: TbfHeader,
    footer: Option<TbfFooter>,
    address: u32,
    app_binary: Option<Vec<u8>>,
    name: String,
}

impl InstalledApp {
    pub fn new(
        header: TbfHeader,
        footer: Option<TbfFooter>,
        address: u32,
        app_binary: Option<Vec<u8>>,
    ) -> InstalledApp {
        // Headers without a package name still need something to print and
        // match against.
        let name = header
            .app_name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("app_{:#x}", address));
        InstalledApp {
            header,
            footer,
            address,
            app_binary,
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn header(&self) -> &TbfHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut TbfHeader {
        &mut self.header
    }

    pub fn footer(&self) -> Option<&TbfFooter> {
        self.footer.as_ref()
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn size(&self) -> u32 {
        self.header.app_size()
    }

    pub fn is_modified(&self) -> bool {
        self.header.is_modified()
            || self.footer.as_ref().is_some_and(|f| f.is_modified())
    }

    pub fn has_app_binary(&self) -> bool {
        self.app_binary.is_some()
    }

    /// Store the application binary read back from the board. The bytes run
    /// from the end of the protected region to `binary_end_offset`.
    pub fn set_app_binary(&mut self, binary: Vec<u8>) {
        self.app_binary = Some(binary);
    }

    pub fn app_binary(&self) -> Option<&[u8]> {
        self.app_binary.as_deref()
    }

    /// The integrity blob when the binary is in memory: finalized header plus
    /// application binary up to `binary_end_offset`.
    pub fn integrity_blob(&self) -> Option<Vec<u8>> {
        let binary = self.app_binary.as_ref()?;
        let mut blob = self.header.emit_with_protected();
        blob.extend_from_slice(binary);
        Some(blob)
    }

    /// Emission for placement at `address`: `None` when the board already
    /// holds exactly this app there, the full image otherwise.
    pub fn binary_at(&mut self, address: u32) -> Result<Option<Vec<u8>>, Error> {
        if !self.is_modified() && address == self.address {
            return Ok(None);
        }
        self.emitted_binary().map(Some)
    }

    /// Serialize the full app image, skip logic bypassed (bundled writes
    /// need every app's bytes).
    pub fn emitted_binary(&self) -> Result<Vec<u8>, Error> {
        let Some(binary) = self.app_binary.as_ref() else {
            // The layout engine reads binaries in before moving anything;
            // getting here is a sequencing bug, not a user error.
            return Err(Error::PlacementImpossible(format!(
                "app \"{}\" must be read from the board before it can move",
                self.name
            )));
        };
        let mut out = self.header.emit_with_protected();
        out.extend_from_slice(binary);
        if let Some(footer) = &self.footer {
            out.extend_from_slice(&footer.emit());
        }
        let total = self.size() as usize;
        if out.len() > total {
            out.truncate(total);
        }
        Ok(out)
    }
}
