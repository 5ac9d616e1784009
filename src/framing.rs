//! Byte framing for the Tock bootloader wire protocol.
//!
//! Commands are sent as `ESC CMD [payload]` and responses arrive as
//! `ESC RSP_START RSP_CODE [payload]`. Any literal `ESC` byte inside a
//! payload is doubled on the wire.

use std::collections::VecDeque;
use std::io::{Read, Write};

use crate::errors::ConnectionError;

/// Every frame starts with this byte; inside payloads it is doubled.
pub const ESCAPE_CHAR: u8 = 0x1B;

/// Follows an unescaped `ESCAPE_CHAR` at the start of every response.
pub const RESPONSE_START: u8 = 0xFC;

/// Escape a payload for transmission by doubling every `ESC` byte.
pub fn escape(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len());
    for &byte in payload {
        if byte == ESCAPE_CHAR {
            out.push(ESCAPE_CHAR);
        }
        out.push(byte);
    }
    out
}

/// Writes a single command frame: the `ESC CMD` introducer followed by the
/// escaped payload.
pub struct FrameEncoder<'a, W: Write> {
    writer: &'a mut W,
    len: usize,
}

impl<'a, W: Write> FrameEncoder<'a, W> {
    /// Start a frame for `command`.
    pub fn new(writer: &'a mut W, command: u8) -> std::io::Result<Self> {
        let len = writer.write(&[ESCAPE_CHAR, command])?;
        Ok(Self { writer, len })
    }

    pub fn finish(self) -> std::io::Result<usize> {
        self.writer.flush()?;
        Ok(self.len)
    }
}

impl<W: Write> Write for FrameEncoder<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        for &value in buf {
            if value == ESCAPE_CHAR {
                self.len += self.writer.write(&[ESCAPE_CHAR, ESCAPE_CHAR])?;
            } else {
                self.len += self.writer.write(&[value])?;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

/// Incremental decoder for response frames.
///
/// Reads from the serial port in chunks and hands back logical (unescaped)
/// bytes. Garbage before the `ESC RSP_START` introducer is discarded, which
/// covers boot banners and stale bytes left in the OS buffer.
pub struct FrameDecoder {
    pending: VecDeque<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder {
            pending: VecDeque::new(),
        }
    }

    fn next_byte<R: Read>(&mut self, source: &mut R) -> Result<u8, ConnectionError> {
        loop {
            if let Some(byte) = self.pending.pop_front() {
                return Ok(byte);
            }
            let mut buf = [0u8; 256];
            let n = source.read(&mut buf).map_err(|e| {
                if e.kind() == std::io::ErrorKind::TimedOut {
                    ConnectionError::Timeout(Default::default())
                } else {
                    ConnectionError::Serial(serialport::Error::from(e))
                }
            })?;
            if n == 0 {
                return Err(ConnectionError::Timeout(Default::default()));
            }
            self.pending.extend(&buf[..n]);
        }
    }

    /// Scan forward to the next `ESC RSP_START` introducer and return the
    /// response code that follows it.
    pub fn read_header<R: Read>(&mut self, source: &mut R) -> Result<u8, ConnectionError> {
        loop {
            if self.next_byte(source)? != ESCAPE_CHAR {
                continue;
            }
            match self.next_byte(source)? {
                RESPONSE_START => return self.next_byte(source),
                // A doubled escape is stray payload data; anything else is
                // noise we skip past.
                _ => continue,
            }
        }
    }

    /// Read `length` logical payload bytes, collapsing doubled escapes.
    pub fn read_payload<R: Read>(
        &mut self,
        source: &mut R,
        length: usize,
    ) -> Result<Vec<u8>, ConnectionError> {
        let mut out = Vec::with_capacity(length);
        while out.len() < length {
            let byte = self.next_byte(source)?;
            if byte == ESCAPE_CHAR {
                if self.next_byte(source)? != ESCAPE_CHAR {
                    return Err(ConnectionError::Framing);
                }
                out.push(ESCAPE_CHAR);
            } else {
                out.push(byte);
            }
        }
        Ok(out)
    }

    /// Drop any bytes that were buffered but not consumed.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_doubles_escape_bytes() {
        assert_eq!(escape(&[0x01, 0x02]), vec![0x01, 0x02]);
        assert_eq!(escape(&[0x1b]), vec![0x1b, 0x1b]);
        assert_eq!(
            escape(&[0x00, 0x1b, 0x1b, 0x05]),
            vec![0x00, 0x1b, 0x1b, 0x1b, 0x1b, 0x05]
        );
    }

    #[test]
    fn encoder_writes_introducer_then_escaped_payload() {
        let mut out: Vec<u8> = Vec::new();
        let mut encoder = FrameEncoder::new(&mut out, 0x13).unwrap();
        encoder.write_all(&[0x00, 0x1b, 0x40]).unwrap();
        encoder.finish().unwrap();
        assert_eq!(out, vec![0x1b, 0x13, 0x00, 0x1b, 0x1b, 0x40]);
    }

    #[test]
    fn decoder_finds_header_after_noise() {
        let input = [0x55u8, 0xaa, 0x1b, 0xfc, 0x15];
        let mut decoder = FrameDecoder::new();
        let code = decoder.read_header(&mut input.as_ref()).unwrap();
        assert_eq!(code, 0x15);
    }

    #[test]
    fn decoder_unescapes_payload() {
        // Payload [0x01, 0x1b, 0x03] on the wire with the escape doubled.
        let input = [0x1bu8, 0xfc, 0x20, 0x01, 0x1b, 0x1b, 0x03];
        let mut decoder = FrameDecoder::new();
        let code = decoder.read_header(&mut input.as_ref()).unwrap();
        assert_eq!(code, 0x20);
        let payload = decoder.read_payload(&mut input.as_ref(), 3).unwrap();
        assert_eq!(payload, vec![0x01, 0x1b, 0x03]);
    }

    #[test]
    fn decoder_rejects_lone_escape_in_payload() {
        let input = [0x1bu8, 0xfc, 0x20, 0x1b, 0x07];
        let mut decoder = FrameDecoder::new();
        decoder.read_header(&mut input.as_ref()).unwrap();
        let err = decoder.read_payload(&mut input.as_ref(), 2).unwrap_err();
        assert!(matches!(err, ConnectionError::Framing));
    }

    #[test]
    fn decoder_times_out_on_empty_source() {
        let input: [u8; 0] = [];
        let mut decoder = FrameDecoder::new();
        let err = decoder.read_header(&mut input.as_ref()).unwrap_err();
        assert!(matches!(err, ConnectionError::Timeout(_)));
    }
}
