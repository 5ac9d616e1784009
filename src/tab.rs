//! TAB (Tock Application Bundle) files: uncompressed tar archives holding
//! `metadata.toml` and one TBF per supported architecture.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use log::debug;
use serde::Deserialize;

use crate::app::{TabApp, TabTbf};
use crate::errors::Error;
use crate::tbf::{TbfFooter, TbfHeader};

/// `metadata.toml` as elf2tab writes it.
#[derive(Clone, Debug, Deserialize)]
pub struct TabMetadata {
    #[serde(rename = "tab-version")]
    pub tab_version: u32,
    pub name: String,
    #[serde(rename = "only-for-boards", default)]
    pub only_for_boards: Option<BoardList>,
    #[serde(rename = "build-date", default)]
    pub build_date: Option<toml::Value>,
    #[serde(rename = "minimum-tock-kernel-version", default)]
    pub minimum_tock_kernel_version: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, toml::Value>,
}

/// `only-for-boards` appears both as a comma-separated string and as a list.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum BoardList {
    Text(String),
    List(Vec<String>),
}

impl BoardList {
    fn contains(&self, board: &str) -> bool {
        match self {
            BoardList::Text(text) => {
                text.is_empty() || text.split(',').any(|entry| entry.trim() == board)
            }
            BoardList::List(list) => list.is_empty() || list.iter().any(|entry| entry == board),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            BoardList::Text(text) => text.is_empty(),
            BoardList::List(list) => list.is_empty(),
        }
    }
}

/// A TAB archive, fully read into memory.
pub struct Tab {
    metadata: TabMetadata,
    metadata_raw: String,
    /// Member name -> raw bytes, for every `*.tbf` member.
    tbf_files: BTreeMap<String, Vec<u8>>,
}

impl Tab {
    /// Open and index a TAB from disk.
    pub fn open(path: &Path) -> Result<Tab, Error> {
        let file = File::open(path).map_err(|e| {
            Error::Usage(format!("Could not open TAB {}: {}", path.display(), e))
        })?;
        let mut archive = tar::Archive::new(file);

        let mut metadata_raw: Option<String> = None;
        let mut tbf_files = BTreeMap::new();

        for entry in archive
            .entries()
            .map_err(|e| Error::InvalidTab(format!("not a tar archive: {}", e)))?
        {
            let mut entry =
                entry.map_err(|e| Error::InvalidTab(format!("bad tar entry: {}", e)))?;
            let name = entry
                .path()
                .map_err(|e| Error::InvalidTab(format!("bad member name: {}", e)))?
                .to_string_lossy()
                .into_owned();
            if name == "metadata.toml" {
                let mut raw = String::new();
                entry
                    .read_to_string(&mut raw)
                    .map_err(|e| Error::InvalidTab(format!("unreadable metadata: {}", e)))?;
                metadata_raw = Some(raw);
            } else if name.ends_with(".tbf") {
                let mut raw = Vec::new();
                entry
                    .read_to_end(&mut raw)
                    .map_err(|e| Error::InvalidTab(format!("unreadable member {}: {}", name, e)))?;
                tbf_files.insert(name, raw);
            }
        }

        let metadata_raw =
            metadata_raw.ok_or_else(|| Error::InvalidTab("missing metadata.toml".into()))?;
        let metadata: TabMetadata = toml::from_str(&metadata_raw)
            .map_err(|e| Error::InvalidTab(format!("bad metadata.toml: {}", e)))?;
        if metadata.tab_version != 1 {
            return Err(Error::InvalidTab(format!(
                "unknown tab-version {}",
                metadata.tab_version
            )));
        }

        Ok(Tab {
            metadata,
            metadata_raw,
            tbf_files,
        })
    }

    /// Replace TBF members and write the archive back out.
    pub fn write_back(
        &mut self,
        path: &Path,
        replacements: Vec<(String, Vec<u8>)>,
    ) -> Result<(), Error> {
        for (name, bytes) in replacements {
            self.tbf_files.insert(name, bytes);
        }

        let file = File::create(path).map_err(|e| {
            Error::Usage(format!("Could not rewrite TAB {}: {}", path.display(), e))
        })?;
        let mut builder = tar::Builder::new(file);

        let mut append = |name: &str, bytes: &[u8]| -> Result<(), Error> {
            let mut header = tar::Header::new_gnu();
            header.set_size(bytes.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, bytes)
                .map_err(|e| Error::InvalidTab(format!("writing member {}: {}", name, e)))
        };

        append("metadata.toml", self.metadata_raw.as_bytes())?;
        for (name, bytes) in &self.tbf_files {
            append(name, bytes)?;
        }
        builder
            .into_inner()
            .map_err(|e| Error::InvalidTab(format!("finishing archive: {}", e)))?;
        Ok(())
    }

    pub fn metadata(&self) -> &TabMetadata {
        &self.metadata
    }

    pub fn app_name(&self) -> &str {
        &self.metadata.name
    }

    /// Architectures with at least one contained TBF.
    pub fn supported_architectures(&self) -> Vec<String> {
        let mut archs: Vec<String> = self
            .tbf_files
            .keys()
            .filter_map(|name| {
                name.strip_suffix(".tbf")
                    .map(|stem| stem.split('.').next().unwrap_or(stem).to_string())
            })
            .collect();
        archs.dedup();
        archs
    }

    /// Whether the TAB's metadata allows this board.
    pub fn is_compatible_with_board(&self, board: Option<&str>) -> bool {
        match (&self.metadata.only_for_boards, board) {
            (None, _) => true,
            (Some(list), _) if list.is_empty() => true,
            (Some(list), Some(board)) => list.contains(board),
            (Some(_), None) => false,
        }
    }

    /// Whether the TAB was built for the kernel version running on the board.
    /// Unknown on either side counts as compatible.
    pub fn is_compatible_with_kernel_version(&self, kernel_version: Option<(u16, u16)>) -> bool {
        let (Some(minimum), Some((major, _minor))) =
            (&self.metadata.minimum_tock_kernel_version, kernel_version)
        else {
            return true;
        };
        let Some(required_major) = minimum
            .split('.')
            .next()
            .and_then(|s| s.trim().parse::<u16>().ok())
        else {
            return true;
        };
        major >= required_major
    }

    /// Build the `TabApp` for one architecture. Fixed-address apps contribute
    /// every matching variant (`<arch>.<suffix>.tbf`); the layout engine
    /// picks among them later.
    pub fn extract_app(&self, arch: &str) -> Result<TabApp, Error> {
        let mut tbfs = Vec::new();
        for (name, raw) in &self.tbf_files {
            let stem = name.strip_suffix(".tbf").unwrap_or(name);
            let matches = stem == arch || stem.starts_with(&format!("{}.", arch));
            if !matches {
                continue;
            }
            debug!("Parsing TBF {} from TAB {}", name, self.metadata.name);
            tbfs.push(parse_tbf(name.clone(), raw)?);
        }
        if tbfs.is_empty() {
            return Err(Error::UnsupportedArch(arch.to_string()));
        }
        Ok(TabApp::new(self.metadata.name.clone(), tbfs))
    }

    /// Parse every contained TBF, for `inspect-tab`.
    pub fn extract_all(&self) -> Result<Vec<TabTbf>, Error> {
        self.tbf_files
            .iter()
            .map(|(name, raw)| parse_tbf(name.clone(), raw))
            .collect()
    }
}

fn parse_tbf(filename: String, raw: &[u8]) -> Result<TabTbf, Error> {
    let header = TbfHeader::parse(raw)?;
    let total = header.app_size() as usize;
    if raw.len() > total {
        return Err(Error::InvalidTab(format!(
            "{}: binary is longer than its declared total_length",
            filename
        )));
    }

    let binary_start = header.size_before_app() as usize;
    let binary_end = (header.binary_end_offset() as usize).min(raw.len());
    if binary_start > binary_end {
        return Err(Error::InvalidTab(format!(
            "{}: header and protected region overrun the binary",
            filename
        )));
    }
    let app_binary = raw[binary_start..binary_end].to_vec();

    let footer = if header.has_footer() && raw.len() > binary_end {
        Some(TbfFooter::parse(&raw[binary_end..])?)
    } else {
        None
    };

    Ok(TabTbf::new(filename, header, app_binary, footer))
}

impl Display for Tab {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "TAB: {}", self.metadata.name)?;
        writeln!(f, "  tab-version: {}", self.metadata.tab_version)?;
        if let Some(boards) = &self.metadata.only_for_boards {
            match boards {
                BoardList::Text(text) => writeln!(f, "  only-for-boards: {}", text)?,
                BoardList::List(list) => writeln!(f, "  only-for-boards: {}", list.join(", "))?,
            }
        }
        if let Some(minimum) = &self.metadata.minimum_tock_kernel_version {
            writeln!(f, "  minimum-tock-kernel-version: {}", minimum)?;
        }
        write!(
            f,
            "  included architectures: {}",
            self.supported_architectures().join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn board_list_matching() {
        let list = BoardList::Text("hail, imix".into());
        assert!(list.contains("hail"));
        assert!(list.contains("imix"));
        assert!(!list.contains("nrf52dk"));

        let list = BoardList::List(vec!["hail".into()]);
        assert!(list.contains("hail"));
        assert!(!list.contains("imix"));

        // An empty restriction allows everything.
        let list = BoardList::Text(String::new());
        assert!(list.contains("anything"));
    }

    #[test]
    fn metadata_parses_known_and_extra_keys() {
        let metadata: TabMetadata = toml::from_str(
            r#"
            tab-version = 1
            name = "blink"
            only-for-boards = "hail"
            build-date = "2024-05-01T00:00:00Z"
            custom-key = 7
            "#,
        )
        .unwrap();
        assert_eq!(metadata.name, "blink");
        assert_eq!(metadata.tab_version, 1);
        assert!(metadata.extra.contains_key("custom-key"));
    }
}
