//! Property-based tests: any sequence of random-access operations must
//! leave the container byte-for-byte equivalent to a plain in-memory file
//! with last-writer semantics, gaps reading as zeros.
//!
//! Volatile containers keep these cheap: no key derivation on the way in.

use std::io::SeekFrom;
use std::path::Path;

use cryptofile::{Container, KeySize};
use proptest::prelude::*;

fn scratch() -> Container {
    Container::create_volatile(None::<&Path>, KeySize::Aes256).expect("volatile container")
}

fn read_all(container: &mut Container) -> Vec<u8> {
    container.seek(SeekFrom::Start(0)).expect("rewind");
    let mut out = vec![0u8; container.len() as usize];
    let mut filled = 0;
    while filled < out.len() {
        let n = container.read(&mut out[filled..]).expect("read");
        assert!(n > 0, "unexpected EOF");
        filled += n;
    }
    out
}

/// Apply a write to the reference model with plain-file semantics.
fn reference_write(reference: &mut Vec<u8>, offset: usize, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    let end = offset + data.len();
    if end > reference.len() {
        reference.resize(end, 0);
    }
    reference[offset..end].copy_from_slice(data);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn write_sequence_matches_reference(
        ops in prop::collection::vec(
            (0u64..20_000, prop::collection::vec(any::<u8>(), 0..600)),
            1..24,
        )
    ) {
        let mut container = scratch();
        let mut reference: Vec<u8> = Vec::new();

        for (offset, data) in &ops {
            container.seek(SeekFrom::Start(*offset)).expect("seek");
            container.write(data).expect("write");
            reference_write(&mut reference, *offset as usize, data);
            prop_assert_eq!(container.len(), reference.len() as u64);
        }

        prop_assert_eq!(read_all(&mut container), reference);
    }

    #[test]
    fn interleaved_reads_see_the_last_writer(
        ops in prop::collection::vec(
            (0u64..8_000, prop::collection::vec(any::<u8>(), 1..300), 0u64..8_200),
            1..16,
        )
    ) {
        let mut container = scratch();
        let mut reference: Vec<u8> = Vec::new();

        for (offset, data, probe) in &ops {
            container.seek(SeekFrom::Start(*offset)).expect("seek");
            container.write(data).expect("write");
            reference_write(&mut reference, *offset as usize, data);

            // Read a probe window right away, while writes sit in cache.
            container.seek(SeekFrom::Start(*probe)).expect("seek");
            let mut buf = [0u8; 128];
            let n = container.read(&mut buf).expect("read");

            let expected_n = reference
                .len()
                .saturating_sub(*probe as usize)
                .min(buf.len());
            prop_assert_eq!(n, expected_n);
            prop_assert_eq!(&buf[..n], &reference[*probe as usize..*probe as usize + n]);
        }
    }

    #[test]
    fn truncate_sequence_matches_reference(
        initial in prop::collection::vec(any::<u8>(), 0..5_000),
        cuts in prop::collection::vec(0u64..6_000, 1..6),
    ) {
        let mut container = scratch();
        container.write(&initial).expect("write");
        let mut reference = initial;

        for cut in &cuts {
            container.truncate(*cut).expect("truncate");
            reference.resize(*cut as usize, 0);
            prop_assert_eq!(container.len(), *cut);
        }

        prop_assert_eq!(read_all(&mut container), reference);
    }
}
