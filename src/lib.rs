//! A library and application for managing Tock applications on hardware
//! boards.
//!
//! ## As an application
//!
//! [tockloader] installs, inspects, and maintains the set of userspace
//! applications on a board running the Tock operating system:
//!
//! ```bash
//! $ tockloader install blink.tab
//! $ tockloader list
//! $ tockloader uninstall blink
//! ```
//!
//! ## As a library
//!
//! The pieces the binary is made of are usable directly: the TBF codec
//! ([`tbf`]), the app-layout engine ([`loader`]), the bootloader serial
//! protocol ([`connection`]), and the TicKV codec ([`tickv`]).
//!
//! [tockloader]: https://github.com/tock/tockloader

pub mod app;
pub mod attributes;
pub mod board;
pub mod cli;
pub mod command;
pub mod connection;
pub mod errors;
pub mod framing;
pub mod loader;
pub mod tab;
pub mod tbf;
pub mod tickv;

pub use errors::Error;

/// Logging utilities
pub mod logging {
    use env_logger::Env;
    use log::LevelFilter;

    /// Initialize the logger with the given [LevelFilter]
    pub fn initialize_logger(filter: LevelFilter) {
        env_logger::Builder::from_env(Env::default().default_filter_or(filter.as_str()))
            .format_target(false)
            .init();
    }
}
