//! TBF footers and their credential TLVs.
//!
//! A footer occupies the bytes between a `Program` TLV's `binary_end_offset`
//! and `total_length`. Credentials are computed over the integrity blob: the
//! finalized header concatenated with the application binary.

use std::fmt::{self, Display, Formatter};

use hmac::{Hmac, Mac};
use log::{debug, warn};
use p256::ecdsa::signature::{Signer as _, Verifier};
use p256::pkcs8::DecodePublicKey;
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::errors::TbfError;

/// The only footer TLV type defined for TBF version 2.
pub const FOOTER_TLV_CREDENTIALS: u16 = 0x80;

pub const CREDENTIALS_TYPE_RESERVED: u32 = 0x00;
pub const CREDENTIALS_TYPE_RSA3072: u32 = 0x01;
pub const CREDENTIALS_TYPE_RSA4096: u32 = 0x02;
pub const CREDENTIALS_TYPE_SHA256: u32 = 0x03;
pub const CREDENTIALS_TYPE_SHA384: u32 = 0x04;
pub const CREDENTIALS_TYPE_SHA512: u32 = 0x05;
pub const CREDENTIALS_TYPE_ECDSAP256: u32 = 0x06;
pub const CREDENTIALS_TYPE_HMAC_SHA256: u32 = 0x07;
pub const CREDENTIALS_TYPE_RSA2048: u32 = 0x0a;
pub const CREDENTIALS_TYPE_CLEARTEXT_ID: u32 = 0xf1;

/// Outcome of checking one credential against the integrity blob.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CredentialCheck {
    Pass,
    Fail,
    /// A key would be needed and none of the provided ones matched.
    SkippedNoKey,
    /// This tool cannot check this credential type.
    Unsupported,
}

impl Display for CredentialCheck {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            CredentialCheck::Pass => "verified",
            CredentialCheck::Fail => "verification failed",
            CredentialCheck::SkippedNoKey => "no matching key",
            CredentialCheck::Unsupported => "unsupported",
        };
        write!(f, "{}", s)
    }
}

/// One credentials TLV in a footer.
#[derive(Clone, Debug, PartialEq)]
pub struct Credential {
    kind: u32,
    data: Vec<u8>,
}

impl Credential {
    pub fn kind(&self) -> u32 {
        self.kind
    }

    pub fn kind_name(&self) -> &'static str {
        credential_type_name(self.kind)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Packed size on flash, including the TLV introducer and type word.
    pub fn size(&self) -> usize {
        4 + 4 + self.data.len()
    }

    fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        out.extend_from_slice(&FOOTER_TLV_CREDENTIALS.to_le_bytes());
        out.extend_from_slice(&((4 + self.data.len()) as u16).to_le_bytes());
        out.extend_from_slice(&self.kind.to_le_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    /// The defined payload length for a credential type, or `None` when any
    /// length is allowed.
    fn expected_data_length(kind: u32) -> Option<usize> {
        match kind {
            CREDENTIALS_TYPE_RESERVED => None,
            CREDENTIALS_TYPE_CLEARTEXT_ID => Some(8),
            CREDENTIALS_TYPE_SHA256 => Some(32),
            CREDENTIALS_TYPE_SHA384 => Some(48),
            CREDENTIALS_TYPE_SHA512 => Some(64),
            CREDENTIALS_TYPE_ECDSAP256 => Some(64),
            CREDENTIALS_TYPE_HMAC_SHA256 => Some(32),
            CREDENTIALS_TYPE_RSA2048 => Some(256),
            CREDENTIALS_TYPE_RSA4096 => Some(1024),
            _ => None,
        }
    }

    /// Check this credential against `integrity_blob` using `keys`.
    pub fn verify(&self, keys: &[LoadedKey], integrity_blob: Option<&[u8]>) -> CredentialCheck {
        let Some(blob) = integrity_blob else {
            // Without the app binary (e.g. headers-only flash walk) nothing
            // can be checked.
            return CredentialCheck::SkippedNoKey;
        };
        match self.kind {
            CREDENTIALS_TYPE_SHA256 => {
                digest_matches(&Sha256::digest(blob), &self.data)
            }
            CREDENTIALS_TYPE_SHA384 => {
                digest_matches(&Sha384::digest(blob), &self.data)
            }
            CREDENTIALS_TYPE_SHA512 => {
                digest_matches(&Sha512::digest(blob), &self.data)
            }
            CREDENTIALS_TYPE_HMAC_SHA256 => {
                let mut outcome = CredentialCheck::SkippedNoKey;
                for key in keys {
                    let LoadedKey::Raw(raw) = key else { continue };
                    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(raw)
                        .expect("HMAC accepts any key length");
                    mac.update(blob);
                    if mac.finalize().into_bytes().as_slice() == self.data.as_slice() {
                        return CredentialCheck::Pass;
                    }
                    outcome = CredentialCheck::Fail;
                }
                outcome
            }
            CREDENTIALS_TYPE_ECDSAP256 => {
                let Ok(signature) = p256::ecdsa::Signature::from_slice(&self.data) else {
                    return CredentialCheck::Fail;
                };
                let mut outcome = CredentialCheck::SkippedNoKey;
                for key in keys {
                    let LoadedKey::P256(verifying_key) = key else { continue };
                    if verifying_key.verify(blob, &signature).is_ok() {
                        return CredentialCheck::Pass;
                    }
                    outcome = CredentialCheck::Fail;
                }
                outcome
            }
            CREDENTIALS_TYPE_RSA2048 => {
                let mut outcome = CredentialCheck::SkippedNoKey;
                for key in keys {
                    let LoadedKey::Rsa { der, .. } = key else { continue };
                    let public = ring::signature::UnparsedPublicKey::new(
                        &ring::signature::RSA_PKCS1_2048_8192_SHA256,
                        der,
                    );
                    if public.verify(blob, &self.data).is_ok() {
                        return CredentialCheck::Pass;
                    }
                    outcome = CredentialCheck::Fail;
                }
                outcome
            }
            CREDENTIALS_TYPE_RSA4096 => {
                // The credential embeds the public modulus followed by the
                // signature; only a key with the same modulus can judge it.
                let modulus = &self.data[..512];
                let signature = &self.data[512..];
                for key in keys {
                    let LoadedKey::Rsa { n, der } = key else { continue };
                    if strip_leading_zeros(n) != strip_leading_zeros(modulus) {
                        continue;
                    }
                    let public = ring::signature::UnparsedPublicKey::new(
                        &ring::signature::RSA_PKCS1_2048_8192_SHA512,
                        der,
                    );
                    return if public.verify(blob, signature).is_ok() {
                        CredentialCheck::Pass
                    } else {
                        CredentialCheck::Fail
                    };
                }
                CredentialCheck::SkippedNoKey
            }
            CREDENTIALS_TYPE_RESERVED | CREDENTIALS_TYPE_CLEARTEXT_ID => {
                CredentialCheck::SkippedNoKey
            }
            _ => CredentialCheck::Unsupported,
        }
    }
}

fn digest_matches(digest: &[u8], stored: &[u8]) -> CredentialCheck {
    if digest == stored {
        CredentialCheck::Pass
    } else {
        CredentialCheck::Fail
    }
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

/// A public key parsed from user-provided bytes.
pub enum LoadedKey {
    P256(p256::ecdsa::VerifyingKey),
    Rsa { n: Vec<u8>, der: Vec<u8> },
    /// Raw bytes, used as-is for HMAC.
    Raw(Vec<u8>),
}

/// Interpret each key file every way we know how. Unparseable keys are
/// dropped with a warning; verification then reports `SkippedNoKey`.
pub fn load_public_keys(key_files: &[Vec<u8>]) -> Vec<LoadedKey> {
    let mut keys = Vec::new();
    for bytes in key_files {
        let mut recognized = false;
        if let Ok(text) = std::str::from_utf8(bytes) {
            if let Ok(vk) = p256::ecdsa::VerifyingKey::from_public_key_pem(text) {
                keys.push(LoadedKey::P256(vk));
                recognized = true;
            }
        }
        if let Ok(vk) = p256::ecdsa::VerifyingKey::from_sec1_bytes(bytes) {
            keys.push(LoadedKey::P256(vk));
            recognized = true;
        }
        if let Ok((n, _e)) = rsa_der::public_key_from_der(bytes) {
            keys.push(LoadedKey::Rsa {
                n,
                der: bytes.clone(),
            });
            recognized = true;
        }
        if !recognized {
            debug!("Key file not recognized as P256 or RSA; keeping raw for HMAC");
        }
        keys.push(LoadedKey::Raw(bytes.clone()));
    }
    keys
}

/// One entry in a footer. Anything that is not a credentials TLV is carried
/// opaquely so the footer can be re-emitted byte for byte.
#[derive(Clone, Debug, PartialEq)]
pub enum FooterEntry {
    Credential(Credential),
    Unknown { id: u16, data: Vec<u8> },
}

impl FooterEntry {
    fn size(&self) -> usize {
        match self {
            FooterEntry::Credential(credential) => credential.size(),
            FooterEntry::Unknown { data, .. } => 4 + data.len(),
        }
    }
}

/// The footer of a `Program` TBF: a sequence of credential TLVs that fills
/// the bytes between `binary_end_offset` and `total_length`.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct TbfFooter {
    entries: Vec<FooterEntry>,
    /// 1-3 trailing bytes that cannot hold a TLV introducer.
    trailing: usize,
    modified: bool,
}

impl TbfFooter {
    /// Parse the footer region of a TBF.
    pub fn parse(mut buffer: &[u8]) -> Result<TbfFooter, TbfError> {
        let mut entries = Vec::new();
        while buffer.len() >= 4 {
            let id = u16::from_le_bytes(buffer[0..2].try_into().unwrap());
            let length = u16::from_le_bytes(buffer[2..4].try_into().unwrap()) as usize;
            if buffer.len() - 4 < length {
                return Err(TbfError::InvalidFooter(format!(
                    "TLV (id {:#x}) length {:#x} overruns the footer",
                    id, length
                )));
            }
            let body = &buffer[4..4 + length];
            if id == FOOTER_TLV_CREDENTIALS {
                if length < 4 {
                    return Err(TbfError::InvalidFooter(
                        "credentials TLV too short for a type word".into(),
                    ));
                }
                let kind = u32::from_le_bytes(body[0..4].try_into().unwrap());
                let data = body[4..].to_vec();
                if let Some(expected) = Credential::expected_data_length(kind) {
                    if data.len() != expected {
                        return Err(TbfError::InvalidFooter(format!(
                            "{} credential has {} data bytes, expected {}",
                            credential_type_name(kind),
                            data.len(),
                            expected
                        )));
                    }
                }
                if Credential::expected_data_length(kind).is_none()
                    && kind != CREDENTIALS_TYPE_RESERVED
                {
                    warn!(
                        "Unknown credential type ({:#04x}) in TBF footer TLV.",
                        kind
                    );
                }
                entries.push(FooterEntry::Credential(Credential { kind, data }));
            } else {
                entries.push(FooterEntry::Unknown {
                    id,
                    data: body.to_vec(),
                });
            }
            buffer = &buffer[4 + length..];
        }
        Ok(TbfFooter {
            entries,
            trailing: buffer.len(),
            modified: false,
        })
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn credentials(&self) -> impl Iterator<Item = &Credential> {
        self.entries.iter().filter_map(|entry| match entry {
            FooterEntry::Credential(credential) => Some(credential),
            FooterEntry::Unknown { .. } => None,
        })
    }

    /// Total packed size, trailing padding included.
    pub fn size(&self) -> usize {
        self.entries.iter().map(|e| e.size()).sum::<usize>() + self.trailing
    }

    /// Serialize the footer. Trailing padding is emitted as zeros.
    pub fn emit(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        for entry in &self.entries {
            match entry {
                FooterEntry::Credential(credential) => out.extend_from_slice(&credential.pack()),
                FooterEntry::Unknown { id, data } => {
                    out.extend_from_slice(&id.to_le_bytes());
                    out.extend_from_slice(&(data.len() as u16).to_le_bytes());
                    out.extend_from_slice(data);
                }
            }
        }
        out.resize(out.len() + self.trailing, 0);
        out
    }

    /// Compute and insert a credential, taking the space from a Reserved
    /// credential so the footer size is unchanged.
    pub fn add_credential(
        &mut self,
        kind_name: &str,
        public_key: Option<&[u8]>,
        private_key: Option<&[u8]>,
        integrity_blob: &[u8],
        cleartext_id: u64,
    ) -> Result<(), TbfError> {
        let kind = credential_id_from_name(kind_name)
            .ok_or_else(|| TbfError::UnknownCredential(kind_name.to_string()))?;
        let data = compute_credential(kind, public_key, private_key, integrity_blob, cleartext_id)?;
        let new = Credential { kind, data };

        let reserved_index = self
            .entries
            .iter()
            .position(|entry| matches!(entry, FooterEntry::Credential(c) if c.kind == CREDENTIALS_TYPE_RESERVED))
            .ok_or_else(|| TbfError::InsufficientFooter(kind_name.to_string()))?;
        let reserved_size = self.entries[reserved_index].size();

        if reserved_size == new.size() {
            // Exact fit: the new credential takes the reserved slot entirely.
            self.entries[reserved_index] = FooterEntry::Credential(new);
        } else if reserved_size >= new.size() + 8 {
            // Shrink the reserved credential and put the new one in front of
            // it. A reserved credential can never go below its 8-byte shell.
            if let FooterEntry::Credential(reserved) = &mut self.entries[reserved_index] {
                reserved.data.truncate(reserved.data.len() - new.size());
            }
            self.entries.insert(reserved_index, FooterEntry::Credential(new));
        } else {
            return Err(TbfError::InsufficientFooter(kind_name.to_string()));
        }
        self.modified = true;
        Ok(())
    }

    /// Replace every credential of the named type with Reserved padding of
    /// equal total length, preserving `total_length`.
    pub fn delete_credential(&mut self, kind_name: &str) -> Result<(), TbfError> {
        let kind = credential_id_from_name(kind_name)
            .ok_or_else(|| TbfError::UnknownCredential(kind_name.to_string()))?;
        let mut found = false;
        for entry in &mut self.entries {
            if let FooterEntry::Credential(credential) = entry {
                if credential.kind == kind {
                    credential.kind = CREDENTIALS_TYPE_RESERVED;
                    credential.data = vec![0; credential.data.len()];
                    found = true;
                }
            }
        }
        if !found {
            return Err(TbfError::InvalidFooter(format!(
                "no {} credential in footer",
                kind_name
            )));
        }
        self.modified = true;
        Ok(())
    }

    /// Give back up to `bytes` of footer space by shrinking Reserved padding.
    /// Used when the header in front of the binary has to grow.
    pub fn shrink(&mut self, bytes: usize) -> Result<(), TbfError> {
        if bytes == 0 {
            return Ok(());
        }
        for entry in &mut self.entries {
            if let FooterEntry::Credential(credential) = entry {
                if credential.kind == CREDENTIALS_TYPE_RESERVED && credential.data.len() >= bytes {
                    credential.data.truncate(credential.data.len() - bytes);
                    self.modified = true;
                    return Ok(());
                }
            }
        }
        Err(TbfError::InsufficientFooter(format!(
            "need {} bytes of reserved footer space",
            bytes
        )))
    }

    /// Check every credential; returns one result per credentials TLV.
    pub fn verify_credentials(
        &self,
        public_keys: &[Vec<u8>],
        integrity_blob: Option<&[u8]>,
    ) -> Vec<(u32, CredentialCheck)> {
        let keys = load_public_keys(public_keys);
        self.credentials()
            .map(|credential| (credential.kind(), credential.verify(&keys, integrity_blob)))
            .collect()
    }
}

fn compute_credential(
    kind: u32,
    _public_key: Option<&[u8]>,
    private_key: Option<&[u8]>,
    integrity_blob: &[u8],
    cleartext_id: u64,
) -> Result<Vec<u8>, TbfError> {
    match kind {
        CREDENTIALS_TYPE_CLEARTEXT_ID => Ok(cleartext_id.to_le_bytes().to_vec()),
        CREDENTIALS_TYPE_SHA256 => Ok(Sha256::digest(integrity_blob).to_vec()),
        CREDENTIALS_TYPE_SHA384 => Ok(Sha384::digest(integrity_blob).to_vec()),
        CREDENTIALS_TYPE_SHA512 => Ok(Sha512::digest(integrity_blob).to_vec()),
        CREDENTIALS_TYPE_HMAC_SHA256 => {
            let key = private_key.ok_or_else(|| {
                TbfError::UnknownCredential("hmac_sha256 requires a key file".into())
            })?;
            let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
                .expect("HMAC accepts any key length");
            mac.update(integrity_blob);
            Ok(mac.finalize().into_bytes().to_vec())
        }
        CREDENTIALS_TYPE_ECDSAP256 => {
            let pem_bytes = private_key.ok_or_else(|| {
                TbfError::UnknownCredential("ecdsap256 requires a private key".into())
            })?;
            let pem = std::str::from_utf8(pem_bytes).map_err(|_| {
                TbfError::UnknownCredential("ecdsap256 private key is not PEM".into())
            })?;
            let secret = p256::SecretKey::from_sec1_pem(pem)
                .or_else(|_| {
                    use p256::pkcs8::DecodePrivateKey;
                    p256::SecretKey::from_pkcs8_pem(pem)
                })
                .map_err(|_| {
                    TbfError::UnknownCredential("could not parse ecdsap256 private key".into())
                })?;
            let signing_key = p256::ecdsa::SigningKey::from(&secret);
            let signature: p256::ecdsa::Signature = signing_key
                .try_sign(integrity_blob)
                .map_err(|_| TbfError::UnknownCredential("ecdsap256 signing failed".into()))?;
            Ok(signature.to_bytes().to_vec())
        }
        _ => Err(TbfError::UnknownCredential(format!(
            "cannot compute a {} credential",
            credential_type_name(kind)
        ))),
    }
}

pub fn credential_type_name(kind: u32) -> &'static str {
    match kind {
        CREDENTIALS_TYPE_RESERVED => "Reserved",
        CREDENTIALS_TYPE_RSA3072 => "RSA3072",
        CREDENTIALS_TYPE_RSA4096 => "RSA4096",
        CREDENTIALS_TYPE_SHA256 => "SHA256",
        CREDENTIALS_TYPE_SHA384 => "SHA384",
        CREDENTIALS_TYPE_SHA512 => "SHA512",
        CREDENTIALS_TYPE_ECDSAP256 => "ECDSAP256",
        CREDENTIALS_TYPE_HMAC_SHA256 => "HMACSHA256",
        CREDENTIALS_TYPE_RSA2048 => "RSA2048",
        CREDENTIALS_TYPE_CLEARTEXT_ID => "CleartextID",
        _ => "Unknown",
    }
}

pub fn credential_id_from_name(name: &str) -> Option<u32> {
    match name {
        "reserved" => Some(CREDENTIALS_TYPE_RESERVED),
        "cleartext_id" => Some(CREDENTIALS_TYPE_CLEARTEXT_ID),
        "rsa3072" => Some(CREDENTIALS_TYPE_RSA3072),
        "rsa4096" => Some(CREDENTIALS_TYPE_RSA4096),
        "sha256" => Some(CREDENTIALS_TYPE_SHA256),
        "sha384" => Some(CREDENTIALS_TYPE_SHA384),
        "sha512" => Some(CREDENTIALS_TYPE_SHA512),
        "ecdsap256" => Some(CREDENTIALS_TYPE_ECDSAP256),
        "hmac_sha256" => Some(CREDENTIALS_TYPE_HMAC_SHA256),
        "rsa2048" => Some(CREDENTIALS_TYPE_RSA2048),
        _ => None,
    }
}

impl Display for TbfFooter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "Footer ({} bytes)", self.size())?;
        for entry in &self.entries {
            match entry {
                FooterEntry::Credential(credential) => {
                    writeln!(
                        f,
                        "  Credentials: {} ({}), {} bytes",
                        credential.kind_name(),
                        credential.kind(),
                        credential.data().len()
                    )?;
                    if credential.kind() == CREDENTIALS_TYPE_CLEARTEXT_ID {
                        let value =
                            u64::from_le_bytes(credential.data()[0..8].try_into().unwrap());
                        writeln!(f, "    Value: {}", value)?;
                    }
                }
                FooterEntry::Unknown { id, data } => {
                    writeln!(f, "  Unknown footer TLV {:#x}, {} bytes", id, data.len())?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reserved_footer(data_len: usize) -> TbfFooter {
        TbfFooter {
            entries: vec![FooterEntry::Credential(Credential {
                kind: CREDENTIALS_TYPE_RESERVED,
                data: vec![0; data_len],
            })],
            trailing: 0,
            modified: false,
        }
    }

    #[test]
    fn parse_emit_round_trip() {
        let mut footer = reserved_footer(100);
        footer
            .add_credential("sha256", None, None, b"hello tock", 0)
            .unwrap();
        let bytes = footer.emit();
        let reparsed = TbfFooter::parse(&bytes).unwrap();
        assert_eq!(reparsed.emit(), bytes);
        assert_eq!(reparsed.credentials().count(), 2);
    }

    #[test]
    fn add_credential_preserves_total_size() {
        let mut footer = reserved_footer(200);
        let before = footer.size();
        footer
            .add_credential("sha512", None, None, b"blob", 0)
            .unwrap();
        assert_eq!(footer.size(), before);
    }

    #[test]
    fn add_credential_fails_without_room() {
        // Reserved data of 16 bytes cannot absorb a 40-byte sha256 TLV.
        let mut footer = reserved_footer(16);
        let err = footer
            .add_credential("sha256", None, None, b"blob", 0)
            .unwrap_err();
        assert!(matches!(err, TbfError::InsufficientFooter(_)));
    }

    #[test]
    fn sha256_credential_verifies() {
        let blob = b"integrity covered bytes";
        let mut footer = reserved_footer(100);
        footer.add_credential("sha256", None, None, blob, 0).unwrap();
        let results = footer.verify_credentials(&[], Some(blob));
        assert!(results
            .iter()
            .any(|(kind, check)| *kind == CREDENTIALS_TYPE_SHA256
                && *check == CredentialCheck::Pass));
        // A different blob must fail.
        let results = footer.verify_credentials(&[], Some(b"other bytes"));
        assert!(results
            .iter()
            .any(|(kind, check)| *kind == CREDENTIALS_TYPE_SHA256
                && *check == CredentialCheck::Fail));
    }

    #[test]
    fn hmac_credential_round_trip() {
        let blob = b"covered";
        let key = b"super secret key".to_vec();
        let mut footer = reserved_footer(100);
        footer
            .add_credential("hmac_sha256", None, Some(&key), blob, 0)
            .unwrap();
        let results = footer.verify_credentials(&[key], Some(blob));
        assert!(results
            .iter()
            .any(|(kind, check)| *kind == CREDENTIALS_TYPE_HMAC_SHA256
                && *check == CredentialCheck::Pass));
    }

    #[test]
    fn delete_credential_replaces_with_reserved() {
        let blob = b"blob";
        let mut footer = reserved_footer(100);
        footer.add_credential("sha256", None, None, blob, 0).unwrap();
        let before = footer.size();
        footer.delete_credential("sha256").unwrap();
        assert_eq!(footer.size(), before);
        assert!(footer
            .credentials()
            .all(|c| c.kind() == CREDENTIALS_TYPE_RESERVED));
    }

    #[test]
    fn cleartext_id_is_little_endian() {
        let mut footer = reserved_footer(100);
        footer
            .add_credential("cleartext_id", None, None, b"", 0x1122334455667788)
            .unwrap();
        let credential = footer
            .credentials()
            .find(|c| c.kind() == CREDENTIALS_TYPE_CLEARTEXT_ID)
            .unwrap();
        assert_eq!(credential.data(), &0x1122334455667788u64.to_le_bytes());
    }

    #[test]
    fn footer_with_overrunning_tlv_is_rejected() {
        // Declared length larger than the remaining footer bytes.
        let bytes = [0x80u8, 0x00, 0x40, 0x00, 0x03, 0x00, 0x00, 0x00];
        assert!(TbfFooter::parse(&bytes).is_err());
    }
}
