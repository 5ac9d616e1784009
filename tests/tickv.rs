//! TicKV database operations through the flash-file back-end.

use std::path::Path;

use tempfile::TempDir;

use tockloader::board::flash_file::FlashFile;
use tockloader::board::BoardSettings;
use tockloader::errors::Error;
use tockloader::loader::{Loader, LoaderOptions, TickvLocation};

const LOCATION: TickvLocation = TickvLocation {
    start_address: 0x50000,
    region_size: 4096,
    number_regions: 4,
};

fn loader_for(flash_path: &Path) -> Loader {
    let settings = BoardSettings {
        board: Some("hail".into()),
        arch: Some("cortex-m4".into()),
        page_size: 512,
        apps_start_address: Some(0x30000),
        flash_address: 0,
    };
    let board = FlashFile::new(flash_path.to_path_buf(), settings);
    Loader::new(Box::new(board), LoaderOptions::default())
}

#[test]
fn reset_append_get_round_trips_through_flash() {
    let dir = TempDir::new().unwrap();
    let flash = dir.path().join("flash.bin");

    // Reset, then store a value with a write_id.
    let mut loader = loader_for(&flash);
    let mut database = loader.tickv_database(LOCATION).unwrap();
    database.reset();
    database.append("k", b"v".to_vec(), 7).unwrap();
    loader.tickv_write_database(LOCATION, &database).unwrap();

    // A fresh read of the flash sees the same object.
    let mut loader = loader_for(&flash);
    let database = loader.tickv_database(LOCATION).unwrap();
    let stored = database.get("k").unwrap();
    assert_eq!(stored.value, b"v");
    assert_eq!(stored.write_id, 7);
}

#[test]
fn invalidate_persists() {
    let dir = TempDir::new().unwrap();
    let flash = dir.path().join("flash.bin");

    let mut loader = loader_for(&flash);
    let mut database = loader.tickv_database(LOCATION).unwrap();
    database.reset();
    database.append("gone", b"bytes".to_vec(), 0).unwrap();
    database.invalidate("gone").unwrap();
    loader.tickv_write_database(LOCATION, &database).unwrap();

    let mut loader = loader_for(&flash);
    let database = loader.tickv_database(LOCATION).unwrap();
    assert!(matches!(database.get("gone"), Err(Error::KeyNotFound(_))));
}

#[test]
fn cleanup_keeps_live_values_on_flash() {
    let dir = TempDir::new().unwrap();
    let flash = dir.path().join("flash.bin");

    let mut loader = loader_for(&flash);
    let mut database = loader.tickv_database(LOCATION).unwrap();
    database.reset();
    database.append("keep", b"live".to_vec(), 3).unwrap();
    database.append("drop", b"dead".to_vec(), 4).unwrap();
    database.invalidate("drop").unwrap();
    database.cleanup().unwrap();
    loader.tickv_write_database(LOCATION, &database).unwrap();

    let mut loader = loader_for(&flash);
    let database = loader.tickv_database(LOCATION).unwrap();
    assert_eq!(database.get("keep").unwrap().value, b"live");
    assert_eq!(database.get("keep").unwrap().write_id, 3);
    assert!(matches!(database.get("drop"), Err(Error::KeyNotFound(_))));
}
