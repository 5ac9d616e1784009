//! Codec for TicKV, the kernel's log-structured key-value store.
//!
//! The database is a fixed flash range split into equal-size regions. Objects
//! are appended to regions, never rewritten in place except to clear the
//! valid bit. Keys are SipHash-2-4 hashes of the key string with a zero key,
//! so any process hashing the same string finds the same object.

use std::fmt::{self, Display, Formatter};
use std::hash::Hasher;

use crc::Crc;
use log::{debug, info};
use siphasher::sip::SipHasher24;

use crate::errors::Error;

/// Object checksums use the same CRC the Tock tickv library uses: poly
/// 0x04c11db7, init 0, no reflection, xorout 0xFFFFFFFF.
const OBJECT_CRC: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_CKSUM);

/// Object header: version, flags, big-endian length, big-endian hashed key.
const OBJECT_HEADER_SIZE: usize = 12;

/// The length field counts the length field itself, the hashed key, the
/// value, and the checksum.
const LENGTH_OVERHEAD: u16 = 14;

/// Bit 3 of the flags byte marks a live object.
const FLAG_VALID: u8 = 0x08;

const OBJECT_VERSION: u8 = 1;

/// The well-known key the kernel writes once to mark a database initialized.
const INIT_KEY: &str = "tickv-init";

/// SipHash-2-4 with a zero key, as the kernel computes it.
pub fn hash_key(key: &str) -> u64 {
    let mut hasher = SipHasher24::new_with_key(&[0u8; 16]);
    hasher.write(key.as_bytes());
    hasher.finish()
}

/// One object in a TicKV database.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TicKVObject {
    version: u8,
    flags: u8,
    hashed_key: u64,
    value: Vec<u8>,
}

impl TicKVObject {
    pub fn new(hashed_key: u64, value: Vec<u8>) -> TicKVObject {
        TicKVObject {
            version: OBJECT_VERSION,
            flags: FLAG_VALID,
            hashed_key,
            value,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.flags & FLAG_VALID == FLAG_VALID
    }

    pub fn invalidate(&mut self) {
        self.flags &= !FLAG_VALID;
    }

    pub fn hashed_key(&self) -> u64 {
        self.hashed_key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Bytes this object occupies on flash.
    pub fn total_size(&self) -> usize {
        OBJECT_HEADER_SIZE + self.value.len() + 4
    }

    fn length_field(&self) -> u16 {
        LENGTH_OVERHEAD + self.value.len() as u16
    }

    /// Serialize: big-endian header, value, little-endian CRC.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_size());
        out.push(self.version);
        out.push(self.flags);
        out.extend_from_slice(&self.length_field().to_be_bytes());
        out.extend_from_slice(&self.hashed_key.to_be_bytes());
        out.extend_from_slice(&self.value);
        let checksum = OBJECT_CRC.checksum(&out);
        out.extend_from_slice(&checksum.to_le_bytes());
        out
    }

    /// Parse the object at the front of `buffer`. Erased flash or a corrupt
    /// header ends the scan of a region.
    pub fn parse(buffer: &[u8]) -> Option<TicKVObject> {
        if buffer.len() < OBJECT_HEADER_SIZE + 4 {
            return None;
        }
        let version = buffer[0];
        if version != OBJECT_VERSION {
            return None;
        }
        let flags = buffer[1];
        let length = u16::from_be_bytes(buffer[2..4].try_into().unwrap());
        if length < LENGTH_OVERHEAD {
            return None;
        }
        let value_length = (length - LENGTH_OVERHEAD) as usize;
        let total = OBJECT_HEADER_SIZE + value_length + 4;
        if buffer.len() < total {
            return None;
        }
        let hashed_key = u64::from_be_bytes(buffer[4..12].try_into().unwrap());
        let value = buffer[OBJECT_HEADER_SIZE..OBJECT_HEADER_SIZE + value_length].to_vec();
        let stored_checksum = u32::from_le_bytes(
            buffer[total - 4..total].try_into().unwrap(),
        );
        let computed = OBJECT_CRC.checksum(&buffer[..total - 4]);
        if stored_checksum != computed {
            debug!(
                "TicKV object checksum mismatch (stored {:#x}, computed {:#x})",
                stored_checksum, computed
            );
            return None;
        }
        Some(TicKVObject {
            version,
            flags,
            hashed_key,
            value,
        })
    }
}

impl Display for TicKVObject {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TicKV Object hash={:#x} version={} flags={:#x} length={} valid={}",
            self.hashed_key,
            self.version,
            self.flags,
            self.total_size(),
            self.is_valid(),
        )
    }
}

/// The value the Tock kernel stores inside a TicKV object: a small sub-header
/// carrying the writing app's `write_id`, then the payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TockStorageObject {
    pub version: u8,
    pub write_id: u32,
    pub value: Vec<u8>,
}

impl TockStorageObject {
    pub fn new(value: Vec<u8>, write_id: u32) -> TockStorageObject {
        TockStorageObject {
            version: 0,
            write_id,
            value,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(7 + self.value.len());
        out.push(self.version);
        out.extend_from_slice(&self.write_id.to_le_bytes());
        out.extend_from_slice(&(self.value.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.value);
        out
    }

    pub fn parse(buffer: &[u8]) -> Result<TockStorageObject, Error> {
        if buffer.len() < 7 {
            return Err(Error::TickvCorrupt(
                "value too short for a Tock storage header".into(),
            ));
        }
        let version = buffer[0];
        let write_id = u32::from_le_bytes(buffer[1..5].try_into().unwrap());
        let length = u16::from_le_bytes(buffer[5..7].try_into().unwrap()) as usize;
        if buffer.len() < 7 + length {
            return Err(Error::TickvCorrupt(
                "Tock storage value shorter than its declared length".into(),
            ));
        }
        Ok(TockStorageObject {
            version,
            write_id,
            value: buffer[7..7 + length].to_vec(),
        })
    }
}

impl Display for TockStorageObject {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TockTicKV Object version={} write_id={} length={}",
            self.version,
            self.write_id,
            self.value.len()
        )
    }
}

/// An in-memory copy of a TicKV database, read from and written back to a
/// fixed flash range.
pub struct TicKV {
    storage: Vec<u8>,
    region_size: usize,
}

impl TicKV {
    pub fn new(storage: Vec<u8>, region_size: usize) -> Result<TicKV, Error> {
        if region_size == 0 || storage.len() % region_size != 0 {
            return Err(Error::TickvCorrupt(format!(
                "storage length {:#x} is not a multiple of the region size {:#x}",
                storage.len(),
                region_size
            )));
        }
        Ok(TicKV {
            storage,
            region_size,
        })
    }

    pub fn storage(&self) -> &[u8] {
        &self.storage
    }

    fn number_regions(&self) -> usize {
        self.storage.len() / self.region_size
    }

    fn region(&self, index: usize) -> &[u8] {
        &self.storage[index * self.region_size..(index + 1) * self.region_size]
    }

    fn starting_region(&self, hashed_key: u64) -> usize {
        (hashed_key & 0xffff) as usize % self.number_regions()
    }

    /// Regions in circular order beginning at the key's home region.
    fn region_order(&self, start: usize) -> impl Iterator<Item = usize> {
        let count = self.number_regions();
        (0..count).map(move |i| (start + i) % count)
    }

    /// Offsets of every parseable object in a region.
    fn region_objects(&self, region_index: usize) -> Vec<(usize, TicKVObject)> {
        let region = self.region(region_index);
        let mut objects = Vec::new();
        let mut offset = 0;
        while let Some(object) = TicKVObject::parse(&region[offset..]) {
            let size = object.total_size();
            objects.push((offset, object));
            offset += size;
        }
        objects
    }

    /// The most recent valid object for a hashed key, if any.
    pub fn get(&self, hashed_key: u64) -> Option<TicKVObject> {
        for region_index in self.region_order(self.starting_region(hashed_key)) {
            for (_, object) in self.region_objects(region_index) {
                if object.is_valid() && object.hashed_key() == hashed_key {
                    return Some(object);
                }
            }
        }
        None
    }

    /// All objects in a region, optionally only the live ones.
    pub fn get_all(&self, region_index: usize, valid_only: bool) -> Vec<TicKVObject> {
        self.region_objects(region_index)
            .into_iter()
            .map(|(_, object)| object)
            .filter(|object| !valid_only || object.is_valid())
            .collect()
    }

    /// Clear the valid bit of every live object with this hashed key.
    /// Returns true when something was invalidated.
    pub fn invalidate(&mut self, hashed_key: u64) -> bool {
        let mut found = false;
        for region_index in self.region_order(self.starting_region(hashed_key)) {
            let base = region_index * self.region_size;
            for (offset, mut object) in self.region_objects(region_index) {
                if object.is_valid() && object.hashed_key() == hashed_key {
                    debug!(
                        "Invalidating object with hkey={:#x} at region {} offset {}",
                        hashed_key, region_index, offset
                    );
                    object.invalidate();
                    let bytes = object.to_bytes();
                    self.storage[base + offset..base + offset + bytes.len()]
                        .copy_from_slice(&bytes);
                    found = true;
                }
            }
        }
        found
    }

    /// Append an object, invalidating any live object with the same key
    /// first. Fails with `TickvFull` when no region has room.
    pub fn append(&mut self, object: TicKVObject) -> Result<(), Error> {
        self.invalidate(object.hashed_key());

        let bytes = object.to_bytes();
        for region_index in self.region_order(self.starting_region(object.hashed_key())) {
            let end_offset = self
                .region_objects(region_index)
                .last()
                .map(|(offset, object)| offset + object.total_size())
                .unwrap_or(0);

            // The free area must actually read as erased flash; a region with
            // unparseable garbage is left alone.
            let region = self.region(region_index);
            let window = &region[end_offset..(end_offset + OBJECT_HEADER_SIZE + 2).min(region.len())];
            if !window.iter().all(|&b| b == 0xff) {
                continue;
            }
            if self.region_size - end_offset < bytes.len() {
                continue;
            }

            debug!(
                "Writing object with hkey {:#x} to region {} offset {}",
                object.hashed_key(),
                region_index,
                end_offset
            );
            let base = region_index * self.region_size;
            self.storage[base + end_offset..base + end_offset + bytes.len()]
                .copy_from_slice(&bytes);
            return Ok(());
        }
        Err(Error::TickvFull)
    }

    /// Erase everything and write the one-time init object into region 0.
    pub fn reset(&mut self) {
        info!("Resetting TicKV database");
        self.storage.fill(0xff);
        let init = TicKVObject::new(hash_key(INIT_KEY), Vec::new());
        let bytes = init.to_bytes();
        self.storage[..bytes.len()].copy_from_slice(&bytes);
    }

    /// Drop invalidated objects by collecting the live ones, resetting, and
    /// re-appending.
    pub fn cleanup(&mut self) -> Result<(), Error> {
        info!("Cleaning TicKV database");
        let init_hash = hash_key(INIT_KEY);
        let mut live = Vec::new();
        for region_index in 0..self.number_regions() {
            for object in self.get_all(region_index, true) {
                if object.hashed_key() != init_hash {
                    live.push(object);
                }
            }
        }
        debug!("Found {} valid objects to re-store in database", live.len());
        self.reset();
        for object in live {
            self.append(object)?;
        }
        Ok(())
    }
}

/// A TicKV database holding Tock-formatted values.
pub struct TockTicKV {
    pub db: TicKV,
}

impl TockTicKV {
    pub fn new(storage: Vec<u8>, region_size: usize) -> Result<TockTicKV, Error> {
        Ok(TockTicKV {
            db: TicKV::new(storage, region_size)?,
        })
    }

    pub fn storage(&self) -> &[u8] {
        self.db.storage()
    }

    /// Fetch and unwrap the Tock storage object stored under `key`.
    pub fn get(&self, key: &str) -> Result<TockStorageObject, Error> {
        info!("Finding key \"{}\" in Tock-style TicKV database.", key);
        let hashed_key = hash_key(key);
        let object = self
            .db
            .get(hashed_key)
            .ok_or_else(|| Error::KeyNotFound(key.to_string()))?;
        TockStorageObject::parse(object.value())
    }

    /// Store `value` under `key` with the given `write_id`.
    pub fn append(&mut self, key: &str, value: Vec<u8>, write_id: u32) -> Result<(), Error> {
        info!("Appending TockTicKV object {}", key);
        let storage_object = TockStorageObject::new(value, write_id);
        let object = TicKVObject::new(hash_key(key), storage_object.to_bytes());
        self.db.append(object)
    }

    /// Mark the object stored under `key` as deleted.
    pub fn invalidate(&mut self, key: &str) -> Result<(), Error> {
        if self.db.invalidate(hash_key(key)) {
            Ok(())
        } else {
            Err(Error::KeyNotFound(key.to_string()))
        }
    }

    pub fn reset(&mut self) {
        self.db.reset();
    }

    pub fn cleanup(&mut self) -> Result<(), Error> {
        self.db.cleanup()
    }

    /// Render every region's objects, for `tickv dump`.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for region_index in 0..self.db.number_regions() {
            out.push_str(&format!("REGION {}\n", region_index));
            for object in self.db.get_all(region_index, false) {
                out.push_str(&format!("{}\n", object));
                match TockStorageObject::parse(object.value()) {
                    Ok(storage) => {
                        out.push_str(&format!("  {}\n", storage));
                        out.push_str(&format!("  Value: {}\n", hex_string(&storage.value)));
                    }
                    Err(_) => {
                        out.push_str(&format!("  Value: {}\n", hex_string(object.value())));
                    }
                }
            }
            out.push('\n');
        }
        out
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_db() -> TockTicKV {
        let mut db = TockTicKV::new(vec![0xff; 4096 * 4], 4096).unwrap();
        db.reset();
        db
    }

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(hash_key("abc"), hash_key("abc"));
        assert_ne!(hash_key("abc"), hash_key("abd"));
    }

    #[test]
    fn object_round_trip() {
        let object = TicKVObject::new(hash_key("k"), b"value bytes".to_vec());
        let bytes = object.to_bytes();
        // Empty value objects have length 0x0e; this one is 11 bytes longer.
        assert_eq!(
            u16::from_be_bytes(bytes[2..4].try_into().unwrap()),
            0x0e + 11
        );
        let parsed = TicKVObject::parse(&bytes).unwrap();
        assert_eq!(parsed, object);
    }

    #[test]
    fn corrupt_checksum_fails_parse() {
        let object = TicKVObject::new(1234, b"v".to_vec());
        let mut bytes = object.to_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(TicKVObject::parse(&bytes).is_none());
    }

    #[test]
    fn erased_flash_fails_parse() {
        assert!(TicKVObject::parse(&[0xff; 64]).is_none());
    }

    #[test]
    fn reset_writes_init_object_in_region_zero() {
        let db = fresh_db();
        let object = TicKVObject::parse(db.storage()).unwrap();
        assert_eq!(object.hashed_key(), hash_key("tickv-init"));
        assert!(object.is_valid());
        assert!(object.value().is_empty());
    }

    #[test]
    fn append_then_get_returns_last_value() {
        let mut db = fresh_db();
        db.append("k", b"first".to_vec(), 0).unwrap();
        db.append("k", b"second".to_vec(), 7).unwrap();
        let stored = db.get("k").unwrap();
        assert_eq!(stored.value, b"second");
        assert_eq!(stored.write_id, 7);
    }

    #[test]
    fn invalidate_then_get_is_key_not_found() {
        let mut db = fresh_db();
        db.append("k", b"v".to_vec(), 0).unwrap();
        db.invalidate("k").unwrap();
        assert!(matches!(db.get("k"), Err(Error::KeyNotFound(_))));
        // Invalidating a missing key also reports KeyNotFound.
        assert!(matches!(db.invalidate("zzz"), Err(Error::KeyNotFound(_))));
    }

    #[test]
    fn cleanup_preserves_live_keys() {
        let mut db = fresh_db();
        db.append("keep", b"live".to_vec(), 1).unwrap();
        db.append("drop", b"dead".to_vec(), 2).unwrap();
        db.invalidate("drop").unwrap();
        db.cleanup().unwrap();
        assert_eq!(db.get("keep").unwrap().value, b"live");
        assert!(matches!(db.get("drop"), Err(Error::KeyNotFound(_))));
    }

    #[test]
    fn append_overflows_into_next_region() {
        // One region is 256 bytes; two big values must spill over.
        let mut db = TockTicKV::new(vec![0xff; 256 * 4], 256).unwrap();
        db.reset();
        db.append("a", vec![1; 150], 0).unwrap();
        db.append("b", vec![2; 150], 0).unwrap();
        assert_eq!(db.get("a").unwrap().value, vec![1; 150]);
        assert_eq!(db.get("b").unwrap().value, vec![2; 150]);
    }

    #[test]
    fn full_database_reports_no_space() {
        let mut db = TockTicKV::new(vec![0xff; 128], 128).unwrap();
        db.reset();
        let result = db.append("k", vec![0; 120], 0);
        assert!(matches!(result, Err(Error::TickvFull)));
    }
}
