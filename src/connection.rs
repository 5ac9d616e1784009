//! Serial link to a Tock bootloader: port discovery, the per-port exclusion
//! lock, bootloader entry and exit, and the framed request/response cycle.

use std::hash::Hasher;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use serialport::{SerialPort, SerialPortType};
use siphasher::sip::SipHasher24;

use crate::command::{BaudMode, Command, CommandType, ResponseCode};
use crate::errors::{BootloaderError, ConnectionError, Error, ResultExt};
use crate::framing::{escape, FrameDecoder, ESCAPE_CHAR};

/// Baud rate boards boot at.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Rate we negotiate up to once the bootloader answers.
pub const FAST_BAUD_RATE: u32 = 921_600;

const PING_ATTEMPTS: usize = 30;
const COMMAND_RETRIES: usize = 3;
const PORT_REAPPEAR_ATTEMPTS: usize = 30;

/// Holds a TCP listener on a port derived from the serial device path so that
/// only one tockloader drives a given device at a time. The listener thread
/// accepts and drops connections for the life of the process.
pub struct PortLock {
    local_port: u16,
}

impl PortLock {
    pub fn acquire(device_path: &str) -> Result<PortLock, ConnectionError> {
        let mut hasher = SipHasher24::new_with_key(&[0u8; 16]);
        hasher.write(device_path.as_bytes());
        let local_port = 10000 + (hasher.finish() & 0x7fff) as u16;

        let listener = TcpListener::bind(("127.0.0.1", local_port))
            .map_err(|_| ConnectionError::SerialBusy(device_path.to_string()))?;
        debug!(
            "Holding exclusion lock for {} on 127.0.0.1:{}",
            device_path, local_port
        );

        thread::Builder::new()
            .name("tockloader port lock".into())
            .spawn(move || {
                for connection in listener.incoming() {
                    // Another tockloader checking whether the port is taken;
                    // closing the connection is the whole answer.
                    drop(connection);
                }
            })
            .expect("spawning the lock thread cannot fail");

        Ok(PortLock { local_port })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }
}

/// An open serial link, lock held, framing state attached.
pub struct Connection {
    port: Box<dyn SerialPort>,
    device_path: String,
    decoder: FrameDecoder,
    _lock: PortLock,
}

impl Connection {
    /// Open `device` (or the first plausible USB serial port) at the default
    /// baud rate.
    pub fn open(device: Option<&str>) -> Result<Connection, Error> {
        let device_path = match device {
            Some(path) => path.to_string(),
            None => discover_port()?,
        };
        let lock = PortLock::acquire(&device_path)?;

        info!("Using serial port {}", device_path);
        let port = serialport::new(&device_path, DEFAULT_BAUD_RATE)
            .timeout(Duration::from_millis(500))
            .flow_control(serialport::FlowControl::None)
            .open()?;

        Ok(Connection {
            port,
            device_path,
            decoder: FrameDecoder::new(),
            _lock: lock,
        })
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.port.set_timeout(timeout)?;
        Ok(())
    }

    /// Send one command and collect its response payload.
    ///
    /// Timeouts are retried with capped exponential backoff; error responses
    /// from the bootloader (BADADDR and friends) surface immediately.
    pub fn issue_command(&mut self, command: &Command) -> Result<Vec<u8>, Error> {
        let ty = command.command_type();
        let mut backoff = Duration::from_millis(100);
        let mut attempt = 0;
        loop {
            match self.issue_command_once(command) {
                Err(Error::Connection(ConnectionError::Timeout(_)))
                    if attempt + 1 < COMMAND_RETRIES =>
                {
                    attempt += 1;
                    debug!(
                        "Timeout running {} command, retry {} after {:?}",
                        ty, attempt, backoff
                    );
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(Duration::from_secs(1));
                }
                other => return other.for_command(ty),
            }
        }
    }

    fn issue_command_once(&mut self, command: &Command) -> Result<Vec<u8>, Error> {
        let ty = command.command_type();
        self.set_timeout(ty.timeout_for_size(command.payload().len() as u32))?;

        // Stale bytes from the kernel's console would confuse the response
        // scan.
        self.port.clear(serialport::ClearBuffer::Input)?;
        self.decoder.clear();

        let payload = command.payload();
        let mut frame = Vec::with_capacity(payload.len() + 2);
        frame.push(ESCAPE_CHAR);
        frame.push(ty as u8);
        frame.extend_from_slice(&escape(&payload));
        self.port
            .write_all(&frame)
            .map_err(ConnectionError::from)?;
        self.port.flush().map_err(ConnectionError::from)?;

        let code = self.decoder.read_header(&mut self.port)?;
        let (expected_code, expected_length) = command.expected_response();
        let code = ResponseCode::from(code);
        if code != expected_code {
            return Err(Error::Bootloader(BootloaderError::new(ty, code)));
        }
        let response = self.decoder.read_payload(&mut self.port, expected_length)?;
        Ok(response)
    }

    /// Fire one PING and wait briefly for the PONG.
    pub fn ping(&mut self) -> bool {
        self.issue_command_once(&Command::Ping).is_ok()
    }

    /// Reset the chip with the bootloader-select line held so it comes up in
    /// the bootloader.
    fn toggle_bootloader_entry_dtr_rts(&mut self) -> Result<(), Error> {
        // DTR pulses reset; RTS selects the bootloader.
        self.port.write_data_terminal_ready(true)?;
        self.port.write_request_to_send(true)?;
        thread::sleep(Duration::from_millis(100));
        self.port.write_data_terminal_ready(false)?;
        // Give the bootloader time to come up before releasing the select
        // line.
        thread::sleep(Duration::from_millis(500));
        self.port.write_request_to_send(false)?;
        Ok(())
    }

    /// Touch the port at 1200 baud, which some boards treat as a request to
    /// reboot into the bootloader. Returns true when the board visibly reset.
    fn toggle_bootloader_entry_baud_rate(&mut self) -> Result<bool, Error> {
        self.port.set_baud_rate(1200)?;
        thread::sleep(Duration::from_millis(100));

        let mut scratch = [0u8; 10];
        match self.port.read(&mut scratch) {
            Ok(_) => {
                // Still talking: this entry mode is a no-op for this board.
                self.port.set_baud_rate(DEFAULT_BAUD_RATE)?;
                Ok(false)
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                self.port.set_baud_rate(DEFAULT_BAUD_RATE)?;
                Ok(false)
            }
            Err(_) => {
                // The port died under us, which means the chip reset. Wait
                // for the bootloader's port to appear and reopen it.
                info!("Waiting for the bootloader to start");
                self.reopen_after_reset()?;
                Ok(true)
            }
        }
    }

    fn reopen_after_reset(&mut self) -> Result<(), Error> {
        for attempt in 0..PORT_REAPPEAR_ATTEMPTS {
            // The OS takes a moment to tear the old device down; waiting
            // first avoids immediately rediscovering the dying port.
            thread::sleep(Duration::from_millis(500));

            let candidate = if attempt < PORT_REAPPEAR_ATTEMPTS / 2 {
                // The bootloader usually reappears on the same device path.
                self.device_path.clone()
            } else {
                match discover_port() {
                    Ok(path) => path,
                    Err(_) => continue,
                }
            };

            match serialport::new(&candidate, DEFAULT_BAUD_RATE)
                .timeout(Duration::from_millis(500))
                .flow_control(serialport::FlowControl::None)
                .open()
            {
                Ok(port) => {
                    debug!("Bootloader port reappeared as {}", candidate);
                    self.port = port;
                    self.device_path = candidate;
                    self.decoder.clear();
                    return Ok(());
                }
                Err(_) => continue,
            }
        }
        Err(Error::Connection(ConnectionError::BootloaderDidNotStart))
    }

    fn ping_until_pong(&mut self) -> Result<(), Error> {
        for _ in 0..PING_ATTEMPTS {
            if self.ping() {
                return Ok(());
            }
        }
        Err(Error::Connection(ConnectionError::NoPong))
    }

    /// Get the board into bootloader mode: DTR/RTS toggle first, the 1200
    /// baud trick as fallback, PONG as proof either way.
    pub fn enter_bootloader_mode(&mut self) -> Result<(), Error> {
        if self.toggle_bootloader_entry_dtr_rts().is_err() {
            // The control lines are not wired up on every adapter.
            debug!("DTR/RTS toggle failed; port may already be the bootloader");
        }

        if self.ping() {
            return Ok(());
        }

        if let Err(e) = self.toggle_bootloader_entry_baud_rate() {
            debug!("1200 baud entry failed: {}", e);
        }

        match self.ping_until_pong() {
            Ok(()) => Ok(()),
            Err(_) => {
                // One more DTR/RTS cycle before giving up.
                thread::sleep(Duration::from_secs(1));
                let _ = self.toggle_bootloader_entry_dtr_rts();
                self.ping_until_pong()
            }
        }
    }

    /// Leave the bootloader: ask over the wire, then pulse reset in case the
    /// command is not supported.
    pub fn exit_bootloader_mode(&mut self) -> Result<(), Error> {
        // EXIT gets no response once the chip reboots, so fire and forget.
        let frame = [ESCAPE_CHAR, CommandType::Exit as u8];
        let _ = self.port.write_all(&frame);
        let _ = self.port.flush();

        // Reset via DTR with the select line released. Any of this can fail
        // if the EXIT above already tore the port down; that still counts as
        // having exited.
        let _ = self.port.write_data_terminal_ready(true);
        let _ = self.port.write_request_to_send(false);
        thread::sleep(Duration::from_millis(100));
        let _ = self.port.write_data_terminal_ready(false);
        Ok(())
    }

    /// Negotiate a faster baud rate; fall back to the default when the
    /// confirm step fails.
    pub fn change_baud_rate(&mut self, baud: u32) -> Result<(), Error> {
        if baud == DEFAULT_BAUD_RATE {
            return Ok(());
        }
        if self
            .issue_command_once(&Command::ChangeBaud {
                mode: BaudMode::Set,
                baud,
            })
            .is_err()
        {
            // Bootloader too old to know the command; stay at the default.
            return Ok(());
        }
        self.port.set_baud_rate(baud)?;
        if self
            .issue_command_once(&Command::ChangeBaud {
                mode: BaudMode::Verify,
                baud,
            })
            .is_err()
        {
            warn!(
                "Baud rate negotiation failed, staying at {}",
                DEFAULT_BAUD_RATE
            );
            self.port.set_baud_rate(DEFAULT_BAUD_RATE)?;
        } else {
            debug!("Communicating at {} baud", baud);
        }
        Ok(())
    }

    /// Read raw bytes, for `listen`.
    pub fn read_raw(&mut self, buffer: &mut [u8]) -> Result<usize, Error> {
        match self.port.read(buffer) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(Error::Connection(ConnectionError::from(e))),
        }
    }
}

/// Pick a serial port that plausibly belongs to a Tock board.
fn discover_port() -> Result<String, Error> {
    let ports = serialport::available_ports()?;
    let usb_ports: Vec<_> = ports
        .iter()
        .filter(|info| matches!(info.port_type, SerialPortType::UsbPort(_)))
        .collect();

    // Prefer a device that advertises itself as a Tock bootloader.
    for info in &usb_ports {
        if let SerialPortType::UsbPort(usb) = &info.port_type {
            let product = usb.product.as_deref().unwrap_or("");
            if product.to_lowercase().contains("tock") {
                return Ok(info.port_name.clone());
            }
        }
    }
    if let Some(info) = usb_ports.first() {
        return Ok(info.port_name.clone());
    }
    Err(Error::Connection(ConnectionError::NoSerial))
}

/// Whether any serial port that could be a Tock board is attached.
pub fn any_board_attached() -> bool {
    discover_port().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_lock_is_deterministic_and_exclusive() {
        let first = PortLock::acquire("/dev/ttyTESTLOCK0").unwrap();
        assert!(first.local_port() >= 10000);
        // A second lock on the same device must fail...
        let second = PortLock::acquire("/dev/ttyTESTLOCK0");
        assert!(matches!(
            second,
            Err(ConnectionError::SerialBusy(path)) if path == "/dev/ttyTESTLOCK0"
        ));
        // ...while a different device hashes to a different port.
        let other = PortLock::acquire("/dev/ttyTESTLOCK1").unwrap();
        assert_ne!(first.local_port(), other.local_port());
    }
}
