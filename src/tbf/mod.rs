//! The Tock Binary Format codec: headers, footers, and their TLV entries.

pub mod footer;
pub mod header;
pub mod tlv;

pub use footer::{CredentialCheck, TbfFooter};
pub use header::{checksum_of, TbfHeader, TBF_BASE_SIZE};
pub use tlv::Tlv;
