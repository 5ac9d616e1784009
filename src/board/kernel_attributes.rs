//! Attributes the kernel leaves at the end of its own flash region,
//! immediately before the apps region. Parsed backwards from a "TOCK"
//! sentinel.

const SENTINEL: &[u8; 4] = b"TOCK";

const TYPE_APP_MEMORY: u16 = 0x0101;
const TYPE_KERNEL_BINARY: u16 = 0x0102;
const TYPE_KERNEL_VERSION: u16 = 0x0103;

#[derive(Clone, Debug, Default)]
pub struct KernelAttributes {
    pub app_memory: Option<(u32, u32)>,
    pub kernel_binary: Option<(u32, u32)>,
    pub kernel_version: Option<(u16, u16)>,
}

impl KernelAttributes {
    /// Parse the bytes ending right where apps begin. Returns an empty set
    /// when the sentinel is missing (older kernels).
    pub fn parse(buffer: &[u8]) -> KernelAttributes {
        let mut attrs = KernelAttributes::default();
        if buffer.len() < 8 || &buffer[buffer.len() - 4..] != SENTINEL {
            return attrs;
        }
        let mut end = buffer.len() - 4;
        // One version byte and three reserved bytes.
        let version = buffer[end - 1];
        end -= 4;
        if version != 1 {
            return attrs;
        }

        while end > 4 {
            let t = u16::from_le_bytes(buffer[end - 4..end - 2].try_into().unwrap());
            let l = u16::from_le_bytes(buffer[end - 2..end].try_into().unwrap()) as usize;
            end -= 4;
            if l != 8 || end < l {
                break;
            }
            let body = &buffer[end - l..end];
            end -= l;
            match t {
                TYPE_APP_MEMORY => {
                    attrs.app_memory = Some((
                        u32::from_le_bytes(body[0..4].try_into().unwrap()),
                        u32::from_le_bytes(body[4..8].try_into().unwrap()),
                    ));
                }
                TYPE_KERNEL_BINARY => {
                    attrs.kernel_binary = Some((
                        u32::from_le_bytes(body[0..4].try_into().unwrap()),
                        u32::from_le_bytes(body[4..8].try_into().unwrap()),
                    ));
                }
                TYPE_KERNEL_VERSION => {
                    attrs.kernel_version = Some((
                        u16::from_le_bytes(body[0..2].try_into().unwrap()),
                        u16::from_le_bytes(body[2..4].try_into().unwrap()),
                    ));
                }
                _ => break,
            }
        }
        attrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(tlvs: &[(u16, [u8; 8])]) -> Vec<u8> {
        let mut out = vec![0u8; 16];
        for (t, body) in tlvs {
            out.extend_from_slice(body);
            out.extend_from_slice(&t.to_le_bytes());
            out.extend_from_slice(&8u16.to_le_bytes());
        }
        // Reserved bytes, version, sentinel.
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(SENTINEL);
        out
    }

    #[test]
    fn parses_app_memory_and_version() {
        let mut app_memory = [0u8; 8];
        app_memory[0..4].copy_from_slice(&0x2000_8000u32.to_le_bytes());
        app_memory[4..8].copy_from_slice(&0x8000u32.to_le_bytes());
        let mut kernel_version = [0u8; 8];
        kernel_version[0..2].copy_from_slice(&2u16.to_le_bytes());
        kernel_version[2..4].copy_from_slice(&1u16.to_le_bytes());

        let buffer = build(&[
            (TYPE_KERNEL_VERSION, kernel_version),
            (TYPE_APP_MEMORY, app_memory),
        ]);
        let attrs = KernelAttributes::parse(&buffer);
        assert_eq!(attrs.app_memory, Some((0x2000_8000, 0x8000)));
        assert_eq!(attrs.kernel_version, Some((2, 1)));
    }

    #[test]
    fn missing_sentinel_yields_nothing() {
        let attrs = KernelAttributes::parse(&[0xff; 100]);
        assert!(attrs.app_memory.is_none());
        assert!(attrs.kernel_version.is_none());
    }
}
