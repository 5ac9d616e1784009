//! Library and application errors

use std::fmt::{Display, Formatter};
use std::io;

use miette::Diagnostic;
use thiserror::Error;

use crate::command::{CommandType, ResponseCode};

/// Top level error type for everything tockloader can do.
#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum Error {
    #[error("Error while communicating with the board")]
    #[diagnostic(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Bootloader(#[from] BootloaderError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Tbf(#[from] TbfError),

    #[error("TAB file is malformed: {0}")]
    #[diagnostic(
        code(tockloader::invalid_tab),
        help("Re-create the TAB with a current elf2tab")
    )]
    InvalidTab(String),

    #[error("No TBF in the TAB is compiled for architecture \"{0}\"")]
    #[diagnostic(
        code(tockloader::unsupported_arch),
        help("Check `tockloader inspect-tab` for the architectures the TAB contains")
    )]
    UnsupportedArch(String),

    #[error("TAB is not compatible with board \"{0}\"")]
    #[diagnostic(
        code(tockloader::board_mismatch),
        help("The TAB metadata limits which boards the app can run on; use --force to override")
    )]
    BoardMismatch(String),

    #[error("Could not find a valid placement for apps: {0}")]
    #[diagnostic(code(tockloader::placement))]
    PlacementImpossible(String),

    #[error("Flash contents failed CRC verification at {address:#x} ({length} bytes)")]
    #[diagnostic(
        code(tockloader::flash_verify),
        help("The write may have been interrupted; run the command again")
    )]
    FlashVerifyFailed { address: u32, length: usize },

    #[error("Key \"{0}\" not found in the TicKV database")]
    #[diagnostic(code(tockloader::key_not_found))]
    KeyNotFound(String),

    #[error("TicKV database has no room for the new object")]
    #[diagnostic(
        code(tockloader::tickv_full),
        help("Run `tockloader tickv cleanup` to reclaim invalidated space")
    )]
    TickvFull,

    #[error("TicKV storage is malformed: {0}")]
    #[diagnostic(code(tockloader::tickv_corrupt))]
    TickvCorrupt(String),

    #[error("Credential type \"{0}\" is not supported for this operation")]
    #[diagnostic(code(tockloader::unsupported_credential))]
    UnsupportedCredential(String),

    #[error("A footer credential failed verification")]
    #[diagnostic(code(tockloader::credential_verify))]
    CredentialVerifyFailed,

    #[error("{0}")]
    #[diagnostic(code(tockloader::usage))]
    Usage(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// The stable process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Usage(_) => 2,
            Error::Connection(_) | Error::Bootloader(_) => 3,
            Error::PlacementImpossible(_) => 4,
            Error::FlashVerifyFailed { .. } | Error::CredentialVerifyFailed => 5,
            _ => 1,
        }
    }
}

/// Errors from the transport layer: the serial port itself, timeouts, and the
/// per-port exclusion lock.
#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(tockloader::serial_error))]
    Serial(#[source] serialport::Error),

    #[error("No serial ports found attached to this host")]
    #[diagnostic(
        code(tockloader::no_serial),
        help("Connect a board, or pass --port to name the device explicitly")
    )]
    NoSerial,

    #[error("Serial port not found")]
    #[diagnostic(
        code(tockloader::device_not_found),
        help("Ensure the board is connected and the serial adapter is recognized")
    )]
    DeviceNotFound,

    #[error("Another tockloader process is using {0}")]
    #[diagnostic(
        code(tockloader::serial_busy),
        help("Stop the other tockloader instance (e.g. `tockloader listen`) and retry")
    )]
    SerialBusy(String),

    #[error("Timeout while running {0}command")]
    #[diagnostic(code(tockloader::timeout))]
    Timeout(TimedOutCommand),

    #[error("Received response has invalid framing")]
    #[diagnostic(
        code(tockloader::framing),
        help("Reset the board and try again; persistent errors suggest baud rate mismatch")
    )]
    Framing,

    #[error("Bootloader did not respond to PING")]
    #[diagnostic(
        code(tockloader::no_pong),
        help(
            "Things that could be wrong:\n\
             - The bootloader is not flashed on the chip\n\
             - The DTR/RTS lines are not working\n\
             - The serial port being used is incorrect"
        )
    )]
    NoPong,

    #[error("Bootloader did not start")]
    #[diagnostic(code(tockloader::bootloader_missing))]
    BootloaderDidNotStart,

    #[error("Read past the end of the flash region")]
    #[diagnostic(code(tockloader::address_range))]
    AddressOutOfRange(u32),
}

impl From<serialport::Error> for ConnectionError {
    fn from(err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::Io(kind) => from_error_kind(kind, err),
            serialport::ErrorKind::NoDevice => ConnectionError::DeviceNotFound,
            _ => ConnectionError::Serial(err),
        }
    }
}

impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Self::Connection(err.into())
    }
}

fn from_error_kind<E: Into<serialport::Error>>(kind: io::ErrorKind, err: E) -> ConnectionError {
    match kind {
        io::ErrorKind::TimedOut => ConnectionError::Timeout(TimedOutCommand::default()),
        io::ErrorKind::NotFound => ConnectionError::DeviceNotFound,
        _ => ConnectionError::Serial(err.into()),
    }
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        from_error_kind(err.kind(), err)
    }
}

/// Records which command a timeout interrupted, when known.
#[derive(Debug, Default, Clone)]
pub struct TimedOutCommand {
    command: Option<CommandType>,
}

impl From<CommandType> for TimedOutCommand {
    fn from(c: CommandType) -> Self {
        TimedOutCommand { command: Some(c) }
    }
}

impl Display for TimedOutCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.command {
            Some(command) => write!(f, "{} ", command),
            None => Ok(()),
        }
    }
}

/// The bootloader answered, but with an error code.
#[derive(Copy, Clone, Debug, Error, Diagnostic)]
#[error("Bootloader returned {code} while running {command} command")]
#[diagnostic(code(tockloader::bootloader_error))]
pub struct BootloaderError {
    command: CommandType,
    code: ResponseCode,
}

impl BootloaderError {
    pub fn new(command: CommandType, code: ResponseCode) -> Self {
        BootloaderError { command, code }
    }

    pub fn response_code(&self) -> ResponseCode {
        self.code
    }
}

/// Errors from the TBF codec.
#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum TbfError {
    #[error("Invalid TBF header: {reason}")]
    #[diagnostic(code(tockloader::invalid_header))]
    InvalidHeader { reason: String },

    #[error("Invalid TLV (id {id:#x}): {reason}")]
    #[diagnostic(code(tockloader::invalid_tlv))]
    InvalidTlv { id: u16, reason: String },

    #[error("Invalid TBF footer: {0}")]
    #[diagnostic(code(tockloader::invalid_footer))]
    InvalidFooter(String),

    #[error("Not enough reserved footer space for a {0} credential")]
    #[diagnostic(
        code(tockloader::insufficient_footer),
        help("Rebuild the app with a larger reserved footer (elf2tab --footer-size)")
    )]
    InsufficientFooter(String),

    #[error("Unknown credential type \"{0}\"")]
    #[diagnostic(code(tockloader::unknown_credential))]
    UnknownCredential(String),
}

impl TbfError {
    pub fn invalid_header(reason: impl Into<String>) -> Self {
        TbfError::InvalidHeader {
            reason: reason.into(),
        }
    }

    pub fn invalid_tlv(id: u16, reason: impl Into<String>) -> Self {
        TbfError::InvalidTlv {
            id,
            reason: reason.into(),
        }
    }
}

pub(crate) trait ResultExt {
    /// Mark the command from which this error originates.
    fn for_command(self, command: CommandType) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn for_command(self, command: CommandType) -> Self {
        match self {
            Err(Error::Connection(ConnectionError::Timeout(_))) => Err(Error::Connection(
                ConnectionError::Timeout(command.into()),
            )),
            res => res,
        }
    }
}
