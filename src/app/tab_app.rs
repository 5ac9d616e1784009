//! Apps extracted from TAB files.

use log::debug;

use crate::errors::Error;
use crate::tbf::{CredentialCheck, TbfFooter, TbfHeader};

/// Fixed-address TAB headers may start anywhere, but placement keeps things
/// simple by starting them on this alignment.
const FIXED_ADDRESS_ALIGNMENT: u32 = 1024;

/// One TBF out of a TAB: header, application binary, and optional footer.
#[derive(Clone, Debug)]
pub struct TabTbf {
    filename: String,
    header: TbfHeader,
    /// Bytes from the end of the protected region to `binary_end_offset`.
    app_binary: Vec<u8>,
    footer: Option<TbfFooter>,
}

impl TabTbf {
    pub fn new(
        filename: String,
        header: TbfHeader,
        app_binary: Vec<u8>,
        footer: Option<TbfFooter>,
    ) -> TabTbf {
        TabTbf {
            filename,
            header,
            app_binary,
            footer,
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn header(&self) -> &TbfHeader {
        &self.header
    }

    pub fn footer(&self) -> Option<&TbfFooter> {
        self.footer.as_ref()
    }

    /// Finalized header plus application binary: what credentials cover.
    pub fn integrity_blob(&self) -> Vec<u8> {
        let mut blob = self.header.emit_with_protected();
        blob.extend_from_slice(&self.app_binary);
        blob
    }

    /// Serialize the complete TBF for placement at `address`, adjusting the
    /// header for fixed-address apps and keeping `total_length` intact.
    fn emit_at(&mut self, address: u32) -> Result<Vec<u8>, Error> {
        let grown = self.header.adjust_starting_address(address)?;
        if grown > 0 {
            // The header grew in front of the binary; the footer gives the
            // space back so the app's total footprint is unchanged.
            match self.footer.as_mut() {
                Some(footer) => footer.shrink(grown as usize)?,
                None => {
                    return Err(Error::PlacementImpossible(format!(
                        "\"{}\" needs {} bytes of reserved footer space to move",
                        self.filename, grown
                    )))
                }
            }
        }

        let mut out = self.header.emit_with_protected();
        out.extend_from_slice(&self.app_binary);
        if let Some(footer) = &self.footer {
            out.extend_from_slice(&footer.emit());
        }
        let total = self.header.app_size() as usize;
        if out.len() > total {
            // elf2tab sometimes pads binaries; anything past total_length is
            // padding and safe to drop.
            out.truncate(total);
        }
        Ok(out)
    }
}

/// An app from a TAB. Holds one TBF per alternative build (fixed-address apps
/// ship several); position-independent apps have exactly one.
#[derive(Clone, Debug)]
pub struct TabApp {
    name: String,
    tbfs: Vec<TabTbf>,
}

impl TabApp {
    pub fn new(name: String, tbfs: Vec<TabTbf>) -> TabApp {
        TabApp { name, tbfs }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tbfs(&self) -> &[TabTbf] {
        &self.tbfs
    }

    fn single_tbf(&self) -> Result<&TabTbf, Error> {
        match self.tbfs.as_slice() {
            [tbf] => Ok(tbf),
            _ => Err(Error::PlacementImpossible(format!(
                "app \"{}\" still has {} candidate TBFs",
                self.name,
                self.tbfs.len()
            ))),
        }
    }

    pub fn size(&self) -> Result<u32, Error> {
        Ok(self.single_tbf()?.header.app_size())
    }

    pub fn app_version(&self) -> u32 {
        self.tbfs
            .first()
            .map(|tbf| tbf.header.app_version())
            .unwrap_or(0)
    }

    pub fn is_sticky(&self) -> bool {
        self.tbfs.first().is_some_and(|tbf| tbf.header.is_sticky())
    }

    pub fn is_enabled(&self) -> bool {
        self.tbfs.first().is_some_and(|tbf| tbf.header.is_enabled())
    }

    /// Apply a flag to every contained TBF.
    pub fn set_flag(&mut self, flag_name: &str, flag_value: bool) -> Result<(), Error> {
        for tbf in &mut self.tbfs {
            tbf.header.set_flag(flag_name, flag_value)?;
        }
        Ok(())
    }

    /// Grow every TBF's `total_length` to at least `size`.
    pub fn set_minimum_size(&mut self, size: u32) {
        for tbf in &mut self.tbfs {
            if tbf.header.app_size() < size {
                tbf.header.set_app_size(size);
            }
        }
    }

    /// Round every TBF's `total_length` up to a power of two (the cortex-m
    /// MPU size rule).
    pub fn round_size_up_to_power_of_two(&mut self) {
        for tbf in &mut self.tbfs {
            let size = tbf.header.app_size();
            if !size.is_power_of_two() {
                let rounded = size.next_power_of_two();
                debug!(
                    "Rounding app \"{}\" up to power-of-two size ({} bytes)",
                    self.name, rounded
                );
                tbf.header.set_app_size(rounded);
            }
        }
    }

    pub fn has_fixed_addresses(&self) -> bool {
        self.tbfs
            .iter()
            .any(|tbf| tbf.header.has_fixed_addresses())
    }

    /// Drop fixed-address TBFs whose RAM requirement cannot fit the board's
    /// app RAM region.
    pub fn filter_fixed_ram_address(&mut self, ram_address: u32) {
        self.tbfs.retain(|tbf| match tbf.header.fixed_addresses() {
            Some((fixed_ram, _)) => {
                fixed_ram >= ram_address && fixed_ram <= ram_address + 0x200000
            }
            None => true,
        });
    }

    /// `(aligned_start_address, total_size)` for every contained
    /// fixed-address build.
    pub fn fixed_starts_and_sizes(&self) -> Vec<(u32, u32)> {
        self.tbfs
            .iter()
            .filter_map(|tbf| {
                Self::candidate_start(tbf).map(|start| (start, tbf.header.app_size()))
            })
            .collect()
    }

    /// The start address a TBF would use for its fixed binary address: back
    /// off by the space in front of the binary, rounded down to a 1024-byte
    /// boundary. The protected region grows to absorb the slack.
    pub fn candidate_start(tbf: &TabTbf) -> Option<u32> {
        let (_, fixed_flash) = tbf.header.fixed_addresses()?;
        let front = tbf.header.size_before_app();
        let start = fixed_flash.checked_sub(front)?;
        Some(start - (start % FIXED_ADDRESS_ALIGNMENT))
    }

    /// The smallest aligned start address >= `address` where some contained
    /// TBF can go. Narrows the app to that TBF and returns the address, or
    /// `None` when no candidate fits.
    pub fn fix_at_next_loadable_address(&mut self, address: u32) -> Option<u32> {
        if !self.has_fixed_addresses() {
            return Some(address);
        }

        let mut best: Option<(u32, usize)> = None;
        for (i, tbf) in self.tbfs.iter().enumerate() {
            let Some(wanted) = Self::candidate_start(tbf) else {
                continue;
            };
            if wanted >= address {
                match best {
                    Some((current, _)) if wanted >= current => {}
                    _ => best = Some((wanted, i)),
                }
            }
        }

        let (start, index) = best?;
        let chosen = self.tbfs.swap_remove(index);
        self.tbfs = vec![chosen];
        Some(start)
    }

    /// Serialize for placement at `address`.
    pub fn binary_at(&mut self, address: u32) -> Result<Vec<u8>, Error> {
        match self.tbfs.as_mut_slice() {
            [tbf] => tbf.emit_at(address),
            _ => Err(Error::PlacementImpossible(format!(
                "app \"{}\" was never narrowed to one TBF",
                self.name
            ))),
        }
    }

    /// `tbf tlv delete` across every contained TBF.
    pub fn delete_tlv(&mut self, name: &str) -> Result<(), Error> {
        for tbf in &mut self.tbfs {
            tbf.header.delete_tlv(name)?;
        }
        Ok(())
    }

    /// `tbf tlv modify` across every contained TBF.
    pub fn modify_tlv(&mut self, name: &str, field: &str, value: u64) -> Result<(), Error> {
        for tbf in &mut self.tbfs {
            tbf.header.modify_tlv(name, field, value)?;
        }
        Ok(())
    }

    /// `tbf tlv add` across every contained TBF.
    pub fn add_tlv(&mut self, name: &str, params: &[String]) -> Result<(), Error> {
        for tbf in &mut self.tbfs {
            tbf.header.add_tlv(name, params)?;
        }
        Ok(())
    }

    /// Compute and install a credential in every contained TBF's footer.
    pub fn add_credential(
        &mut self,
        kind_name: &str,
        public_key: Option<&[u8]>,
        private_key: Option<&[u8]>,
        cleartext_id: u64,
    ) -> Result<(), Error> {
        for tbf in &mut self.tbfs {
            let blob = tbf.integrity_blob();
            let footer = tbf.footer.as_mut().ok_or_else(|| {
                Error::Tbf(crate::errors::TbfError::InsufficientFooter(
                    kind_name.to_string(),
                ))
            })?;
            footer.add_credential(kind_name, public_key, private_key, &blob, cleartext_id)?;
        }
        Ok(())
    }

    /// Replace a credential with reserved padding in every contained TBF.
    pub fn delete_credential(&mut self, kind_name: &str) -> Result<(), Error> {
        for tbf in &mut self.tbfs {
            if let Some(footer) = tbf.footer.as_mut() {
                footer.delete_credential(kind_name)?;
            }
        }
        Ok(())
    }

    /// Verify every credential in every contained TBF.
    pub fn verify_credentials(
        &self,
        public_keys: &[Vec<u8>],
    ) -> Vec<(String, u32, CredentialCheck)> {
        let mut results = Vec::new();
        for tbf in &self.tbfs {
            let blob = tbf.integrity_blob();
            if let Some(footer) = &tbf.footer {
                for (kind, check) in footer.verify_credentials(public_keys, Some(&blob)) {
                    results.push((tbf.filename.clone(), kind, check));
                }
            }
        }
        results
    }

    /// `(filename, full TBF bytes)` for writing the TAB back to disk.
    pub fn names_and_binaries(&mut self) -> Result<Vec<(String, Vec<u8>)>, Error> {
        let mut out = Vec::new();
        for tbf in &mut self.tbfs {
            let filename = tbf.filename.clone();
            let mut bytes = tbf.header.emit_with_protected();
            bytes.extend_from_slice(&tbf.app_binary);
            if let Some(footer) = &tbf.footer {
                bytes.extend_from_slice(&footer.emit());
            }
            let total = tbf.header.app_size() as usize;
            if bytes.len() > total {
                bytes.truncate(total);
            }
            out.push((filename, bytes));
        }
        Ok(out)
    }
}
