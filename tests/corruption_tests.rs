//! Tampering and corruption behavior: the password oracle, the header CRC,
//! and the blast radius of a flipped ciphertext bit in the data region.

use std::io::SeekFrom;

use cryptofile::{Container, Error, KeySize};
use tempfile::TempDir;

const DATA_OFFSET: u64 = 122;
const HEADER_OFFSET: u64 = 42;
const HEADER_SIZE: u64 = 80;
const SECTOR: usize = 256;

fn flip_bit(path: &std::path::Path, byte_offset: u64, bit: u8) {
    let mut bytes = std::fs::read(path).expect("read file");
    bytes[byte_offset as usize] ^= 1 << bit;
    std::fs::write(path, bytes).expect("write file");
}

#[test]
fn header_bit_flips_yield_password_or_corrupted() {
    let dir = TempDir::new().expect("tempdir");
    let original = dir.path().join("original.cf");

    Container::create(&original, "pw", KeySize::Aes256)
        .expect("create")
        .close()
        .expect("close");
    let pristine = std::fs::read(&original).expect("snapshot");

    // Sample bytes across all five CBC blocks of the header ciphertext.
    for byte in [0u64, 3, 7, 15, 16, 31, 40, 47, 48, 63, 64, 79] {
        let victim = dir.path().join(format!("flip-{byte}.cf"));
        std::fs::write(&victim, &pristine).expect("copy");
        flip_bit(&victim, HEADER_OFFSET + byte, (byte % 8) as u8);

        match Container::open(&victim, "pw", true) {
            Err(Error::Password | Error::Corrupted) => {}
            other => panic!("header byte {byte}: expected Password or Corrupted, got {other:?}"),
        }
    }

    // Sanity: the pristine copy still opens.
    Container::open(&original, "pw", true).expect("pristine still opens");
}

#[test]
fn magic_version_and_key_size_are_validated_in_order() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("prefix.cf");

    Container::create(&path, "pw", KeySize::Aes256)
        .expect("create")
        .close()
        .expect("close");
    let pristine = std::fs::read(&path).expect("snapshot");

    // Magic.
    flip_bit(&path, 0, 0);
    assert!(matches!(
        Container::open(&path, "pw", true),
        Err(Error::Format)
    ));

    // Version.
    std::fs::write(&path, &pristine).expect("restore");
    let mut bytes = pristine.clone();
    bytes[4] = 9;
    std::fs::write(&path, &bytes).expect("bump version");
    assert!(matches!(
        Container::open(&path, "pw", true),
        Err(Error::Version(9))
    ));

    // Key-size byte.
    let mut bytes = pristine.clone();
    bytes[5] = 7;
    std::fs::write(&path, &bytes).expect("break key size");
    assert!(matches!(
        Container::open(&path, "pw", true),
        Err(Error::Arguments(_))
    ));
}

#[test]
fn data_sector_corruption_stays_inside_the_sector() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("blast.cf");

    // Three sectors with distinct fill patterns.
    let mut container = Container::create(&path, "pw", KeySize::Aes256).expect("create");
    let mut payload = Vec::new();
    payload.extend_from_slice(&[0xA1; SECTOR]);
    payload.extend_from_slice(&[0xB2; SECTOR]);
    payload.extend_from_slice(&[0xC3; SECTOR]);
    container.write(&payload).expect("write");
    container.close().expect("close");

    // Flip one ciphertext bit in the middle sector.
    flip_bit(&path, DATA_OFFSET + SECTOR as u64 + 100, 3);

    let mut container = Container::open(&path, "pw", true).expect("open");
    assert_eq!(container.len(), payload.len() as u64, "length unaffected");

    let mut back = vec![0u8; payload.len()];
    let mut filled = 0;
    while filled < back.len() {
        let n = container.read(&mut back[filled..]).expect("read");
        assert!(n > 0);
        filled += n;
    }

    assert_eq!(&back[..SECTOR], &payload[..SECTOR], "sector 0 untouched");
    assert_eq!(
        &back[2 * SECTOR..],
        &payload[2 * SECTOR..],
        "sector 2 untouched"
    );
    assert_ne!(
        &back[SECTOR..2 * SECTOR],
        &payload[SECTOR..2 * SECTOR],
        "tampered sector decrypts to garbage"
    );
}

#[test]
fn truncated_header_fails_cleanly() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("short.cf");

    Container::create(&path, "pw", KeySize::Aes256)
        .expect("create")
        .close()
        .expect("close");

    // Cut the file inside the header ciphertext.
    let bytes = std::fs::read(&path).expect("read");
    std::fs::write(&path, &bytes[..(HEADER_OFFSET + HEADER_SIZE / 2) as usize]).expect("cut");

    assert!(matches!(Container::open(&path, "pw", true), Err(Error::Io(_))));
    assert!(!Container::can_open(&path), "probe must fail on a short file");
}

#[test]
fn failed_read_restores_the_offset() {
    // A failing read must restore the caller-visible offset. Force a read
    // failure by shearing the data region between close and reopen.
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("sheared.cf");

    let mut container = Container::create(&path, "pw", KeySize::Aes256).expect("create");
    container.write(&[0x5A; 8192]).expect("write");
    container.close().expect("close");

    // Keep the first cache window's worth of sectors, drop the rest.
    let bytes = std::fs::read(&path).expect("read");
    std::fs::write(&path, &bytes[..DATA_OFFSET as usize + 4096]).expect("shear");

    let mut container = Container::open(&path, "pw", true).expect("reopen");
    assert_eq!(container.len(), 8192, "header still records the full length");

    container.seek(SeekFrom::Start(5000)).expect("seek");
    let mut buf = [0u8; 64];
    match container.read(&mut buf) {
        Err(Error::Io(_)) => {}
        other => panic!("expected Io error, got {other:?}"),
    }
    assert_eq!(container.position(), 5000, "offset restored after failure");

    // Reads inside the surviving region still work.
    container.seek(SeekFrom::Start(0)).expect("seek");
    assert_eq!(container.read(&mut buf).expect("read"), 64);
    assert_eq!(buf, [0x5A; 64]);

    container.close().expect("close");
}
