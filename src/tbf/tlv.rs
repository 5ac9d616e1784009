//! Type-length-value entries found in TBF headers.

use std::fmt::{self, Display, Formatter};

use crate::errors::TbfError;

pub const TLV_ID_MAIN: u16 = 0x01;
pub const TLV_ID_WRITEABLE_FLASH_REGIONS: u16 = 0x02;
pub const TLV_ID_PACKAGE_NAME: u16 = 0x03;
pub const TLV_ID_PIC_OPTION_1: u16 = 0x04;
pub const TLV_ID_FIXED_ADDRESSES: u16 = 0x05;
pub const TLV_ID_PERMISSIONS: u16 = 0x06;
pub const TLV_ID_PERSISTENT_ACL: u16 = 0x07;
pub const TLV_ID_KERNEL_VERSION: u16 = 0x08;
pub const TLV_ID_PROGRAM: u16 = 0x09;
pub const TLV_ID_SHORT_ID: u16 = 0x0a;

pub(crate) fn roundup(x: usize, to: usize) -> usize {
    x.div_ceil(to) * to
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(buf[offset..offset + 2].try_into().unwrap())
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
}

/// `Main` TLV: entry point and memory requirements for a process binary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlvMain {
    pub init_fn_offset: u32,
    pub protected_size: u32,
    pub minimum_ram_size: u32,
}

/// `Program` TLV: like `Main` but additionally delimits the application
/// binary, which is what makes footers possible.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlvProgram {
    pub init_fn_offset: u32,
    pub protected_size: u32,
    pub minimum_ram_size: u32,
    pub binary_end_offset: u32,
    pub app_version: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteableFlashRegion {
    pub offset: u32,
    pub length: u32,
}

/// Offsets the kernel needs when loading a position-independent binary built
/// the old C way.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlvPicOption1 {
    pub text_offset: u32,
    pub data_offset: u32,
    pub data_size: u32,
    pub bss_memory_offset: u32,
    pub bss_size: u32,
    pub relocation_data_offset: u32,
    pub relocation_data_size: u32,
    pub got_offset: u32,
    pub got_size: u32,
    pub minimum_stack_length: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TlvFixedAddresses {
    pub ram_address: u32,
    pub flash_address: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DriverPermission {
    pub driver_number: u32,
    pub offset: u32,
    pub allowed_commands: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlvPersistentAcl {
    pub write_id: u32,
    pub read_ids: Vec<u32>,
    pub access_ids: Vec<u32>,
}

/// A single TLV entry in a TBF header.
#[derive(Clone, Debug, PartialEq)]
pub enum Tlv {
    Main(TlvMain),
    Program(TlvProgram),
    WriteableFlashRegions(Vec<WriteableFlashRegion>),
    PackageName(String),
    PicOption1(TlvPicOption1),
    FixedAddresses(TlvFixedAddresses),
    Permissions(Vec<DriverPermission>),
    PersistentAcl(TlvPersistentAcl),
    KernelVersion { major: u16, minor: u16 },
    ShortId(u32),
    /// A TLV id this version does not understand. The raw bytes are preserved
    /// so the header can be re-emitted unchanged.
    Unknown { id: u16, data: Vec<u8> },
}

impl Tlv {
    pub fn tlv_id(&self) -> u16 {
        match self {
            Tlv::Main(_) => TLV_ID_MAIN,
            Tlv::Program(_) => TLV_ID_PROGRAM,
            Tlv::WriteableFlashRegions(_) => TLV_ID_WRITEABLE_FLASH_REGIONS,
            Tlv::PackageName(_) => TLV_ID_PACKAGE_NAME,
            Tlv::PicOption1(_) => TLV_ID_PIC_OPTION_1,
            Tlv::FixedAddresses(_) => TLV_ID_FIXED_ADDRESSES,
            Tlv::Permissions(_) => TLV_ID_PERMISSIONS,
            Tlv::PersistentAcl(_) => TLV_ID_PERSISTENT_ACL,
            Tlv::KernelVersion { .. } => TLV_ID_KERNEL_VERSION,
            Tlv::ShortId(_) => TLV_ID_SHORT_ID,
            Tlv::Unknown { id, .. } => *id,
        }
    }

    /// Decode one TLV body. `body` is exactly the declared `length` bytes.
    pub fn parse(id: u16, body: &[u8]) -> Result<Tlv, TbfError> {
        match id {
            TLV_ID_MAIN => {
                if body.len() != 12 {
                    return Err(TbfError::invalid_tlv(id, "Main TLV must be 12 bytes"));
                }
                Ok(Tlv::Main(TlvMain {
                    init_fn_offset: read_u32(body, 0),
                    protected_size: read_u32(body, 4),
                    minimum_ram_size: read_u32(body, 8),
                }))
            }
            TLV_ID_PROGRAM => {
                if body.len() != 20 {
                    return Err(TbfError::invalid_tlv(id, "Program TLV must be 20 bytes"));
                }
                Ok(Tlv::Program(TlvProgram {
                    init_fn_offset: read_u32(body, 0),
                    protected_size: read_u32(body, 4),
                    minimum_ram_size: read_u32(body, 8),
                    binary_end_offset: read_u32(body, 12),
                    app_version: read_u32(body, 16),
                }))
            }
            TLV_ID_WRITEABLE_FLASH_REGIONS => {
                if body.is_empty() || body.len() % 8 != 0 {
                    return Err(TbfError::invalid_tlv(
                        id,
                        "writeable flash regions must be a multiple of 8 bytes",
                    ));
                }
                let regions = body
                    .chunks_exact(8)
                    .map(|chunk| WriteableFlashRegion {
                        offset: read_u32(chunk, 0),
                        length: read_u32(chunk, 4),
                    })
                    .collect();
                Ok(Tlv::WriteableFlashRegions(regions))
            }
            TLV_ID_PACKAGE_NAME => {
                let name = String::from_utf8(body.to_vec())
                    .map_err(|_| TbfError::invalid_tlv(id, "package name is not UTF-8"))?;
                Ok(Tlv::PackageName(name))
            }
            TLV_ID_PIC_OPTION_1 => {
                if body.len() != 40 {
                    return Err(TbfError::invalid_tlv(id, "PIC option TLV must be 40 bytes"));
                }
                Ok(Tlv::PicOption1(TlvPicOption1 {
                    text_offset: read_u32(body, 0),
                    data_offset: read_u32(body, 4),
                    data_size: read_u32(body, 8),
                    bss_memory_offset: read_u32(body, 12),
                    bss_size: read_u32(body, 16),
                    relocation_data_offset: read_u32(body, 20),
                    relocation_data_size: read_u32(body, 24),
                    got_offset: read_u32(body, 28),
                    got_size: read_u32(body, 32),
                    minimum_stack_length: read_u32(body, 36),
                }))
            }
            TLV_ID_FIXED_ADDRESSES => {
                if body.len() != 8 {
                    return Err(TbfError::invalid_tlv(id, "fixed addresses TLV must be 8 bytes"));
                }
                Ok(Tlv::FixedAddresses(TlvFixedAddresses {
                    ram_address: read_u32(body, 0),
                    flash_address: read_u32(body, 4),
                }))
            }
            TLV_ID_PERMISSIONS => {
                if body.len() < 2 {
                    return Err(TbfError::invalid_tlv(id, "permissions TLV too short"));
                }
                let count = read_u16(body, 0) as usize;
                let entries = &body[2..];
                if entries.len() < count * 16 {
                    return Err(TbfError::invalid_tlv(
                        id,
                        "permissions TLV shorter than its declared entry count",
                    ));
                }
                let perms = entries[..count * 16]
                    .chunks_exact(16)
                    .map(|chunk| DriverPermission {
                        driver_number: read_u32(chunk, 0),
                        offset: read_u32(chunk, 4),
                        allowed_commands: read_u64(chunk, 8),
                    })
                    .collect();
                Ok(Tlv::Permissions(perms))
            }
            TLV_ID_PERSISTENT_ACL => {
                if body.len() < 8 {
                    return Err(TbfError::invalid_tlv(id, "persistent ACL TLV too short"));
                }
                let write_id = read_u32(body, 0);
                let mut offset = 4;
                let num_read = read_u16(body, offset) as usize;
                offset += 2;
                if body.len() < offset + num_read * 4 + 2 {
                    return Err(TbfError::invalid_tlv(id, "persistent ACL read ids overrun"));
                }
                let read_ids = (0..num_read)
                    .map(|i| read_u32(body, offset + i * 4))
                    .collect();
                offset += num_read * 4;
                let num_access = read_u16(body, offset) as usize;
                offset += 2;
                if body.len() != offset + num_access * 4 {
                    return Err(TbfError::invalid_tlv(id, "persistent ACL access ids overrun"));
                }
                let access_ids = (0..num_access)
                    .map(|i| read_u32(body, offset + i * 4))
                    .collect();
                Ok(Tlv::PersistentAcl(TlvPersistentAcl {
                    write_id,
                    read_ids,
                    access_ids,
                }))
            }
            TLV_ID_KERNEL_VERSION => {
                if body.len() != 4 {
                    return Err(TbfError::invalid_tlv(id, "kernel version TLV must be 4 bytes"));
                }
                Ok(Tlv::KernelVersion {
                    major: read_u16(body, 0),
                    minor: read_u16(body, 2),
                })
            }
            TLV_ID_SHORT_ID => {
                if body.len() != 4 {
                    return Err(TbfError::invalid_tlv(id, "short id TLV must be 4 bytes"));
                }
                Ok(Tlv::ShortId(read_u32(body, 0)))
            }
            _ => Ok(Tlv::Unknown {
                id,
                data: body.to_vec(),
            }),
        }
    }

    /// The TLV body (without the 4-byte type/length introducer and without
    /// alignment padding).
    fn body(&self) -> Vec<u8> {
        match self {
            Tlv::Main(main) => {
                let mut out = Vec::with_capacity(12);
                out.extend_from_slice(&main.init_fn_offset.to_le_bytes());
                out.extend_from_slice(&main.protected_size.to_le_bytes());
                out.extend_from_slice(&main.minimum_ram_size.to_le_bytes());
                out
            }
            Tlv::Program(program) => {
                let mut out = Vec::with_capacity(20);
                out.extend_from_slice(&program.init_fn_offset.to_le_bytes());
                out.extend_from_slice(&program.protected_size.to_le_bytes());
                out.extend_from_slice(&program.minimum_ram_size.to_le_bytes());
                out.extend_from_slice(&program.binary_end_offset.to_le_bytes());
                out.extend_from_slice(&program.app_version.to_le_bytes());
                out
            }
            Tlv::WriteableFlashRegions(regions) => {
                let mut out = Vec::with_capacity(regions.len() * 8);
                for region in regions {
                    out.extend_from_slice(&region.offset.to_le_bytes());
                    out.extend_from_slice(&region.length.to_le_bytes());
                }
                out
            }
            Tlv::PackageName(name) => name.as_bytes().to_vec(),
            Tlv::PicOption1(pic) => {
                let fields = [
                    pic.text_offset,
                    pic.data_offset,
                    pic.data_size,
                    pic.bss_memory_offset,
                    pic.bss_size,
                    pic.relocation_data_offset,
                    pic.relocation_data_size,
                    pic.got_offset,
                    pic.got_size,
                    pic.minimum_stack_length,
                ];
                let mut out = Vec::with_capacity(40);
                for field in fields {
                    out.extend_from_slice(&field.to_le_bytes());
                }
                out
            }
            Tlv::FixedAddresses(fixed) => {
                let mut out = Vec::with_capacity(8);
                out.extend_from_slice(&fixed.ram_address.to_le_bytes());
                out.extend_from_slice(&fixed.flash_address.to_le_bytes());
                out
            }
            Tlv::Permissions(perms) => {
                let mut out = Vec::with_capacity(2 + perms.len() * 16);
                out.extend_from_slice(&(perms.len() as u16).to_le_bytes());
                for perm in perms {
                    out.extend_from_slice(&perm.driver_number.to_le_bytes());
                    out.extend_from_slice(&perm.offset.to_le_bytes());
                    out.extend_from_slice(&perm.allowed_commands.to_le_bytes());
                }
                out
            }
            Tlv::PersistentAcl(acl) => {
                let mut out = Vec::new();
                out.extend_from_slice(&acl.write_id.to_le_bytes());
                out.extend_from_slice(&(acl.read_ids.len() as u16).to_le_bytes());
                for read_id in &acl.read_ids {
                    out.extend_from_slice(&read_id.to_le_bytes());
                }
                out.extend_from_slice(&(acl.access_ids.len() as u16).to_le_bytes());
                for access_id in &acl.access_ids {
                    out.extend_from_slice(&access_id.to_le_bytes());
                }
                out
            }
            Tlv::KernelVersion { major, minor } => {
                let mut out = Vec::with_capacity(4);
                out.extend_from_slice(&major.to_le_bytes());
                out.extend_from_slice(&minor.to_le_bytes());
                out
            }
            Tlv::ShortId(short_id) => short_id.to_le_bytes().to_vec(),
            Tlv::Unknown { data, .. } => data.clone(),
        }
    }

    /// Serialize the TLV including its introducer, zero-padded to a 4-byte
    /// boundary.
    pub fn pack(&self) -> Vec<u8> {
        let body = self.body();
        let mut out = Vec::with_capacity(4 + roundup(body.len(), 4));
        out.extend_from_slice(&self.tlv_id().to_le_bytes());
        out.extend_from_slice(&(body.len() as u16).to_le_bytes());
        out.extend_from_slice(&body);
        out.resize(4 + roundup(body.len(), 4), 0);
        out
    }

    /// The number of header bytes this TLV occupies when packed.
    pub fn size(&self) -> usize {
        4 + roundup(self.body().len(), 4)
    }

    /// Where this TLV sorts in canonical emission order: binary descriptors
    /// first, then the common metadata TLVs, unknown entries last.
    pub fn canonical_rank(&self) -> usize {
        match self {
            Tlv::Main(_) | Tlv::Program(_) => 0,
            Tlv::WriteableFlashRegions(_) => 1,
            Tlv::PackageName(_) => 2,
            Tlv::FixedAddresses(_) => 3,
            Tlv::KernelVersion { .. } => 4,
            Tlv::PicOption1(_) => 5,
            Tlv::Permissions(_) => 5,
            Tlv::PersistentAcl(_) => 5,
            Tlv::ShortId(_) => 5,
            Tlv::Unknown { .. } => 6,
        }
    }

    /// The user-facing name used by `tbf tlv` subcommands.
    pub fn name(&self) -> &'static str {
        match self {
            Tlv::Main(_) => "main",
            Tlv::Program(_) => "program",
            Tlv::WriteableFlashRegions(_) => "writeable_flash_regions",
            Tlv::PackageName(_) => "name",
            Tlv::PicOption1(_) => "pic_option_1",
            Tlv::FixedAddresses(_) => "fixed_addresses",
            Tlv::Permissions(_) => "permissions",
            Tlv::PersistentAcl(_) => "persistent_acl",
            Tlv::KernelVersion { .. } => "kernel_version",
            Tlv::ShortId(_) => "short_id",
            Tlv::Unknown { .. } => "unknown",
        }
    }

    /// Map a `tbf tlv` subcommand name to the TLV id it refers to.
    pub fn id_from_name(name: &str) -> Option<u16> {
        match name {
            "main" => Some(TLV_ID_MAIN),
            "program" => Some(TLV_ID_PROGRAM),
            "writeable_flash_regions" => Some(TLV_ID_WRITEABLE_FLASH_REGIONS),
            "name" => Some(TLV_ID_PACKAGE_NAME),
            "pic_option_1" => Some(TLV_ID_PIC_OPTION_1),
            "fixed_addresses" => Some(TLV_ID_FIXED_ADDRESSES),
            "permissions" => Some(TLV_ID_PERMISSIONS),
            "persistent_acl" | "persistent_storage" => Some(TLV_ID_PERSISTENT_ACL),
            "kernel_version" => Some(TLV_ID_KERNEL_VERSION),
            "short_id" => Some(TLV_ID_SHORT_ID),
            _ => None,
        }
    }

    /// Build a new TLV from `tbf tlv add` parameters.
    pub fn from_params(name: &str, params: &[String]) -> Result<Tlv, TbfError> {
        let parse_num = |s: &str| -> Result<u64, TbfError> {
            parse_int(s).ok_or_else(|| TbfError::invalid_tlv(0, format!("bad number \"{}\"", s)))
        };
        match (name, params.len()) {
            ("name", 1) => Ok(Tlv::PackageName(params[0].clone())),
            ("fixed_addresses", 2) => Ok(Tlv::FixedAddresses(TlvFixedAddresses {
                ram_address: parse_num(&params[0])? as u32,
                flash_address: parse_num(&params[1])? as u32,
            })),
            ("kernel_version", 1) => {
                let (major, minor) = params[0]
                    .split_once('.')
                    .ok_or_else(|| TbfError::invalid_tlv(TLV_ID_KERNEL_VERSION, "expected <major>.<minor>"))?;
                Ok(Tlv::KernelVersion {
                    major: parse_num(major)? as u16,
                    minor: parse_num(minor)? as u16,
                })
            }
            ("short_id", 1) => Ok(Tlv::ShortId(parse_num(&params[0])? as u32)),
            ("writeable_flash_regions", 2) => Ok(Tlv::WriteableFlashRegions(vec![
                WriteableFlashRegion {
                    offset: parse_num(&params[0])? as u32,
                    length: parse_num(&params[1])? as u32,
                },
            ])),
            ("permissions", 2) => {
                let driver_number = parse_num(&params[0])? as u32;
                let command_number = parse_num(&params[1])?;
                let offset = (command_number / 64) as u32;
                let index = command_number % 64;
                Ok(Tlv::Permissions(vec![DriverPermission {
                    driver_number,
                    offset,
                    allowed_commands: 1 << index,
                }]))
            }
            ("persistent_acl", 1..=3) => {
                let parse_list = |s: &str| -> Result<Vec<u32>, TbfError> {
                    s.split(',')
                        .filter(|part| !part.is_empty())
                        .map(|part| parse_num(part).map(|v| v as u32))
                        .collect()
                };
                Ok(Tlv::PersistentAcl(TlvPersistentAcl {
                    write_id: parse_num(&params[0])? as u32,
                    read_ids: params.get(1).map(|s| parse_list(s)).transpose()?.unwrap_or_default(),
                    access_ids: params.get(2).map(|s| parse_list(s)).transpose()?.unwrap_or_default(),
                }))
            }
            _ => Err(TbfError::invalid_tlv(
                Tlv::id_from_name(name).unwrap_or(0),
                format!("cannot create TLV \"{}\" from {} parameters", name, params.len()),
            )),
        }
    }

    /// For `tbf tlv modify`: set one named field to a numeric value.
    pub fn modify_field(&mut self, field: &str, value: u64) -> Result<(), TbfError> {
        let id = self.tlv_id();
        let missing = || TbfError::invalid_tlv(id, format!("no field \"{}\" in this TLV", field));
        match self {
            Tlv::Main(main) => match field {
                "init_fn_offset" => main.init_fn_offset = value as u32,
                "protected_size" => main.protected_size = value as u32,
                "minimum_ram_size" => main.minimum_ram_size = value as u32,
                _ => return Err(missing()),
            },
            Tlv::Program(program) => match field {
                "init_fn_offset" => program.init_fn_offset = value as u32,
                "protected_size" => program.protected_size = value as u32,
                "minimum_ram_size" => program.minimum_ram_size = value as u32,
                "binary_end_offset" => program.binary_end_offset = value as u32,
                "app_version" => program.app_version = value as u32,
                _ => return Err(missing()),
            },
            Tlv::FixedAddresses(fixed) => match field {
                "fixed_address_ram" => fixed.ram_address = value as u32,
                "fixed_address_flash" => fixed.flash_address = value as u32,
                _ => return Err(missing()),
            },
            Tlv::KernelVersion { major, minor } => match field {
                "kernel_major" => *major = value as u16,
                "kernel_minor" => *minor = value as u16,
                _ => return Err(missing()),
            },
            Tlv::ShortId(short_id) => match field {
                "short_id" => *short_id = value as u32,
                _ => return Err(missing()),
            },
            _ => return Err(missing()),
        }
        Ok(())
    }
}

impl Display for Tlv {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Tlv::Main(main) => {
                writeln!(f, "TLV: Main ({})", TLV_ID_MAIN)?;
                writeln!(f, "  init_fn_offset      : {:>10} {:>#12x}", main.init_fn_offset, main.init_fn_offset)?;
                writeln!(f, "  protected_size      : {:>10} {:>#12x}", main.protected_size, main.protected_size)?;
                write!(f, "  minimum_ram_size    : {:>10} {:>#12x}", main.minimum_ram_size, main.minimum_ram_size)
            }
            Tlv::Program(program) => {
                writeln!(f, "TLV: Program ({})", TLV_ID_PROGRAM)?;
                writeln!(f, "  init_fn_offset      : {:>10} {:>#12x}", program.init_fn_offset, program.init_fn_offset)?;
                writeln!(f, "  protected_size      : {:>10} {:>#12x}", program.protected_size, program.protected_size)?;
                writeln!(f, "  minimum_ram_size    : {:>10} {:>#12x}", program.minimum_ram_size, program.minimum_ram_size)?;
                writeln!(f, "  binary_end_offset   : {:>10} {:>#12x}", program.binary_end_offset, program.binary_end_offset)?;
                write!(f, "  app_version         : {:>10}", program.app_version)
            }
            Tlv::WriteableFlashRegions(regions) => {
                write!(f, "TLV: Writeable Flash Regions ({})", TLV_ID_WRITEABLE_FLASH_REGIONS)?;
                for (i, region) in regions.iter().enumerate() {
                    write!(
                        f,
                        "\n  region {}: offset {:#x} length {:#x}",
                        i, region.offset, region.length
                    )?;
                }
                Ok(())
            }
            Tlv::PackageName(name) => {
                writeln!(f, "TLV: Package Name ({})", TLV_ID_PACKAGE_NAME)?;
                write!(f, "  package_name        : {}", name)
            }
            Tlv::PicOption1(_) => {
                writeln!(f, "TLV: PIC Option 1 ({})", TLV_ID_PIC_OPTION_1)?;
                write!(f, "  PIC                 : C Style")
            }
            Tlv::FixedAddresses(fixed) => {
                writeln!(f, "TLV: Fixed Addresses ({})", TLV_ID_FIXED_ADDRESSES)?;
                writeln!(f, "  fixed_address_ram   : {:>10} {:>#12x}", fixed.ram_address, fixed.ram_address)?;
                write!(f, "  fixed_address_flash : {:>10} {:>#12x}", fixed.flash_address, fixed.flash_address)
            }
            Tlv::Permissions(perms) => {
                write!(f, "TLV: Permissions ({})", TLV_ID_PERMISSIONS)?;
                for perm in perms {
                    write!(f, "\n  Driver Number: {:#x}", perm.driver_number)?;
                    for bit in 0..64 {
                        if perm.allowed_commands & (1 << bit) != 0 {
                            let cmd = perm.offset as u64 * 64 + bit;
                            write!(f, "\n    Allowed Command: {} ({:#x})", cmd, cmd)?;
                        }
                    }
                }
                Ok(())
            }
            Tlv::PersistentAcl(acl) => {
                writeln!(f, "TLV: Persistent Storage ({})", TLV_ID_PERSISTENT_ACL)?;
                writeln!(f, "  Write ID            : {:>10} {:>#12x}", acl.write_id, acl.write_id)?;
                writeln!(f, "  Read IDs            : {:?}", acl.read_ids)?;
                write!(f, "  Modify IDs          : {:?}", acl.access_ids)
            }
            Tlv::KernelVersion { major, minor } => {
                writeln!(f, "TLV: Kernel Version ({})", TLV_ID_KERNEL_VERSION)?;
                write!(f, "  kernel version      : ^{}.{}", major, minor)
            }
            Tlv::ShortId(short_id) => {
                writeln!(f, "TLV: ShortID ({})", TLV_ID_SHORT_ID)?;
                write!(f, "  short_id            : {:>10} {:>#12x}", short_id, short_id)
            }
            Tlv::Unknown { id, data } => {
                write!(f, "TLV: Unknown ({:#x}), {} bytes", id, data.len())
            }
        }
    }
}

/// Parse a decimal or `0x`-prefixed number.
pub fn parse_int(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_tlv_round_trip() {
        let tlv = Tlv::Main(TlvMain {
            init_fn_offset: 41,
            protected_size: 0,
            minimum_ram_size: 4096,
        });
        let packed = tlv.pack();
        assert_eq!(packed.len(), 16);
        assert_eq!(&packed[0..2], &TLV_ID_MAIN.to_le_bytes());
        assert_eq!(&packed[2..4], &12u16.to_le_bytes());
        let parsed = Tlv::parse(TLV_ID_MAIN, &packed[4..]).unwrap();
        assert_eq!(parsed, tlv);
    }

    #[test]
    fn package_name_pads_to_alignment() {
        let tlv = Tlv::PackageName("blink".into());
        let packed = tlv.pack();
        // 4 byte introducer + 5 byte name + 3 bytes padding.
        assert_eq!(packed.len(), 12);
        assert_eq!(&packed[2..4], &5u16.to_le_bytes());
        assert_eq!(&packed[9..], &[0, 0, 0]);
        assert_eq!(tlv.size(), 12);
    }

    #[test]
    fn permissions_length_excludes_padding() {
        let tlv = Tlv::Permissions(vec![DriverPermission {
            driver_number: 2,
            offset: 0,
            allowed_commands: 0b111,
        }]);
        let packed = tlv.pack();
        // Declared length is 2 + 16, padded out by 2 bytes.
        assert_eq!(&packed[2..4], &18u16.to_le_bytes());
        assert_eq!(packed.len(), 4 + 20);
        let parsed = Tlv::parse(TLV_ID_PERMISSIONS, &packed[4..4 + 18]).unwrap();
        assert_eq!(parsed, tlv);
    }

    #[test]
    fn unknown_tlv_preserves_bytes() {
        let tlv = Tlv::parse(0x77, &[1, 2, 3, 4]).unwrap();
        assert!(matches!(&tlv, Tlv::Unknown { id: 0x77, data } if data == &vec![1, 2, 3, 4]));
        assert_eq!(&tlv.pack()[4..], &[1, 2, 3, 4]);
    }

    #[test]
    fn persistent_acl_round_trip() {
        let tlv = Tlv::PersistentAcl(TlvPersistentAcl {
            write_id: 7,
            read_ids: vec![1, 2],
            access_ids: vec![3],
        });
        let packed = tlv.pack();
        let declared = read_u16(&packed, 2) as usize;
        assert_eq!(declared, 4 + 2 + 8 + 2 + 4);
        let parsed = Tlv::parse(TLV_ID_PERSISTENT_ACL, &packed[4..4 + declared]).unwrap();
        assert_eq!(parsed, tlv);
    }

    #[test]
    fn parse_int_accepts_hex_and_decimal() {
        assert_eq!(parse_int("0x30000"), Some(0x30000));
        assert_eq!(parse_int("512"), Some(512));
        assert_eq!(parse_int("zzz"), None);
    }
}
