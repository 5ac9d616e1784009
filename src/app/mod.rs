//! The applications the layout engine arranges: apps discovered on the
//! board, apps from TAB files, and padding between them.

pub mod installed;
pub mod tab_app;

pub use installed::InstalledApp;
pub use tab_app::{TabApp, TabTbf};

use crate::errors::Error;
use crate::tbf::TbfHeader;

/// A TBF whose only job is to occupy space while keeping the linked list
/// walkable.
#[derive(Clone, Debug)]
pub struct PaddingApp {
    header: TbfHeader,
    /// Where this padding sits in flash, when it was discovered there.
    address: Option<u32>,
}

impl PaddingApp {
    pub fn new(total_size: u32) -> PaddingApp {
        PaddingApp {
            header: TbfHeader::padding(total_size),
            address: None,
        }
    }

    pub fn from_flash(header: TbfHeader, address: u32) -> PaddingApp {
        PaddingApp {
            header,
            address: Some(address),
        }
    }

    pub fn size(&self) -> u32 {
        self.header.app_size()
    }

    pub fn address(&self) -> Option<u32> {
        self.address
    }

    pub fn header(&self) -> &TbfHeader {
        &self.header
    }

    /// The padding header followed by zeros out to its declared size.
    pub fn binary(&self) -> Vec<u8> {
        let mut out = self.header.emit();
        out.resize(self.size() as usize, 0);
        out
    }
}

/// Any entry in an app layout.
#[derive(Clone, Debug)]
pub enum App {
    Installed(InstalledApp),
    Tab(TabApp),
    Padding(PaddingApp),
}

impl App {
    pub fn name(&self) -> String {
        match self {
            App::Installed(app) => app.name().to_string(),
            App::Tab(app) => app.name().to_string(),
            App::Padding(_) => "padding".to_string(),
        }
    }

    /// Padding is not an app; everything else is.
    pub fn is_app(&self) -> bool {
        !matches!(self, App::Padding(_))
    }

    pub fn is_sticky(&self) -> bool {
        match self {
            App::Installed(app) => app.header().is_sticky(),
            App::Tab(app) => app.is_sticky(),
            App::Padding(_) => false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        match self {
            App::Installed(app) => app.header().is_enabled(),
            App::Tab(app) => app.is_enabled(),
            App::Padding(_) => false,
        }
    }

    pub fn is_modified(&self) -> bool {
        match self {
            App::Installed(app) => app.is_modified(),
            // A TAB app is always new to the board.
            App::Tab(_) => true,
            App::Padding(_) => true,
        }
    }

    /// Total flash footprint. Only valid once fixed-address apps have been
    /// narrowed to a single TBF.
    pub fn size(&self) -> Result<u32, Error> {
        match self {
            App::Installed(app) => Ok(app.size()),
            App::Tab(app) => app.size(),
            App::Padding(padding) => Ok(padding.size()),
        }
    }

    /// Where the app currently sits in flash, for apps that came from flash.
    pub fn address(&self) -> Option<u32> {
        match self {
            App::Installed(app) => Some(app.address()),
            App::Tab(_) => None,
            App::Padding(padding) => padding.address,
        }
    }

    pub fn has_fixed_addresses(&self) -> bool {
        match self {
            App::Installed(app) => app.header().has_fixed_addresses(),
            App::Tab(app) => app.has_fixed_addresses(),
            App::Padding(_) => false,
        }
    }

    pub fn set_sticky(&mut self) -> Result<(), Error> {
        match self {
            App::Installed(app) => app.header_mut().set_flag("sticky", true)?,
            App::Tab(app) => app.set_flag("sticky", true)?,
            App::Padding(_) => {}
        }
        Ok(())
    }

    /// Grow `total_length` to at least `size`.
    pub fn set_minimum_size(&mut self, size: u32) -> Result<(), Error> {
        match self {
            App::Installed(app) => {
                if app.size() < size {
                    app.header_mut().set_app_size(size);
                }
            }
            App::Tab(app) => app.set_minimum_size(size),
            App::Padding(_) => {}
        }
        Ok(())
    }

    /// The bytes to write when placing this app at `address`, or `None` when
    /// flash already holds exactly this app at that address.
    pub fn binary_at(&mut self, address: u32) -> Result<Option<Vec<u8>>, Error> {
        match self {
            App::Installed(app) => app.binary_at(address),
            App::Tab(app) => app.binary_at(address).map(Some),
            App::Padding(padding) => Ok(Some(padding.binary())),
        }
    }

    /// Whether the full app image is held in memory (needed before an app can
    /// move to a new address).
    pub fn has_app_binary(&self) -> bool {
        match self {
            App::Installed(app) => app.has_app_binary(),
            App::Tab(_) => true,
            App::Padding(_) => true,
        }
    }

    /// Like `binary_at`, but always emits bytes; bundled writes need every
    /// app's image regardless of whether it changed.
    pub fn emitted_binary(&mut self, address: u32) -> Result<Vec<u8>, Error> {
        match self {
            App::Installed(app) => app.emitted_binary(),
            App::Tab(app) => app.binary_at(address),
            App::Padding(padding) => Ok(padding.binary()),
        }
    }

    /// The smallest address >= `cursor` this app can start at, narrowing
    /// fixed-address TAB apps to the variant that fits. `None` when no
    /// placement works.
    pub fn fix_at_next_loadable_address(&mut self, cursor: u32) -> Option<u32> {
        match self {
            App::Tab(app) => app.fix_at_next_loadable_address(cursor),
            App::Installed(app) => {
                if !app.header().has_fixed_addresses() {
                    Some(cursor)
                } else if app.address() >= cursor {
                    // Installed fixed-address apps stay where they are.
                    Some(app.address())
                } else {
                    None
                }
            }
            App::Padding(_) => Some(cursor),
        }
    }
}
