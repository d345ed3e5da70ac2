use scratchbin::{ChecksumError, Hash, Scratch, ScratchError, SourceConfig};
use tempfile::tempdir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Small files so the wheel rotates quickly under test-sized data.
fn small_config(dir: &std::path::Path, files: u32) -> SourceConfig {
    SourceConfig::single(dir, files, 64 * 1024)
}

fn write_bytes(scratch: &Scratch, realm: u32, payload: &[u8]) -> Hash {
    let hash = Hash::of(payload);
    let owned = payload.to_vec();
    scratch
        .write(realm, hash, owned.len(), move |buf| buf.copy_from_slice(&owned))
        .unwrap();
    hash
}

#[test]
fn round_trip_hello_world() {
    init_logging();
    let dir = tempdir().unwrap();
    let scratch = Scratch::open(small_config(dir.path(), 4)).unwrap();
    assert_eq!(scratch.count(), 0);

    let hash = write_bytes(&scratch, 1337, b"Hello, world!");
    assert!(scratch.contains(1337, hash));
    assert_eq!(scratch.count(), 1);

    let bytes = scratch.read(1337, hash, |b| b.to_vec()).unwrap();
    assert_eq!(bytes, b"Hello, world!");

    // Reading does not consume the block.
    let len = scratch.read(1337, hash, |b| b.len()).unwrap();
    assert_eq!(len, 13);
}

#[test]
fn removing_one_block_leaves_its_neighbor_readable() {
    init_logging();
    let dir = tempdir().unwrap();
    let scratch = Scratch::open(small_config(dir.path(), 4)).unwrap();

    let first = write_bytes(&scratch, 1, b"the first block");
    let second = write_bytes(&scratch, 1, b"the second block");
    assert_eq!(scratch.count(), 2);

    scratch.remove(1, first);
    assert!(!scratch.contains(1, first));
    assert!(matches!(
        scratch.read(1, first, |b| b.len()),
        Err(ScratchError::MissingBlock { .. })
    ));

    let bytes = scratch.read(1, second, |b| b.to_vec()).unwrap();
    assert_eq!(bytes, b"the second block");
    assert_eq!(scratch.count(), 1);
}

#[test]
fn realms_partition_the_key_space() {
    init_logging();
    let dir = tempdir().unwrap();
    let scratch = Scratch::open(small_config(dir.path(), 4)).unwrap();

    let hash = write_bytes(&scratch, 1, b"tenant payload");
    // Same bytes, same hash, different tenant: a distinct block.
    write_bytes(&scratch, 2, b"tenant payload");
    assert_eq!(scratch.count(), 2);

    scratch.remove(1, hash);
    assert!(!scratch.contains(1, hash));
    assert_eq!(scratch.read(2, hash, |b| b.to_vec()).unwrap(), b"tenant payload");
}

#[test]
fn reading_an_unknown_key_is_a_missing_block() {
    init_logging();
    let dir = tempdir().unwrap();
    let scratch = Scratch::open(small_config(dir.path(), 4)).unwrap();

    let err = scratch.read(5, Hash::of(b"never written"), |b| b.len()).unwrap_err();
    match err {
        ScratchError::MissingBlock { realm, hash } => {
            assert_eq!(realm, 5);
            assert_eq!(hash, Hash::of(b"never written"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn oversized_blocks_are_rejected() {
    init_logging();
    let dir = tempdir().unwrap();
    let scratch = Scratch::open(small_config(dir.path(), 5)).unwrap();

    // Larger than one 64 KiB file: no amount of recycling can fit it.
    let huge = vec![0x5Au8; 200 * 1024];
    let hash = Hash::of(&huge);
    let err = scratch
        .write(1, hash, huge.len(), move |buf| buf.copy_from_slice(&huge))
        .unwrap_err();
    assert!(matches!(err, ScratchError::WriteTooLarge { length } if length == 200 * 1024));
    assert!(!scratch.contains(1, hash));

    // The wheel still serves ordinary writes afterwards.
    let hash = write_bytes(&scratch, 1, b"still alive");
    assert_eq!(scratch.read(1, hash, |b| b.to_vec()).unwrap(), b"still alive");
}

#[test]
fn blocks_survive_a_reopen_once_their_file_leaves_the_writer_slots() {
    init_logging();
    let dir = tempdir().unwrap();

    // ~24 KiB payloads: three blocks fill a 64 KiB file, so a few dozen
    // writes push the wheel well past the two always-fresh writer slots.
    let payloads: Vec<Vec<u8>> = (0..30u8)
        .map(|i| {
            let mut p = vec![i; 24 * 1024];
            p[0] = i.wrapping_add(1);
            p
        })
        .collect();
    let keys: Vec<Hash> = payloads.iter().map(|p| Hash::of(p)).collect();

    {
        let scratch = Scratch::open(small_config(dir.path(), 6)).unwrap();
        for p in &payloads {
            write_bytes(&scratch, 9, p);
        }
        // Everything still indexed is readable before shutdown.
        for (p, &h) in payloads.iter().zip(&keys) {
            if scratch.contains(9, h) {
                assert_eq!(scratch.read(9, h, |b| b.to_vec()).unwrap(), *p);
            }
        }
        scratch.dispose();
    }
    // Retired writers are closed on detached threads; give them a moment
    // before re-reading their files.
    std::thread::sleep(std::time::Duration::from_millis(300));

    let scratch = Scratch::open(small_config(dir.path(), 6)).unwrap();
    // The two writer files start fresh on every open, so only blocks whose
    // file had already rotated out survive. There must be some, and every
    // survivor must read back byte-identical.
    assert!(scratch.count() > 0, "no blocks survived the reopen");
    let mut survivors = 0;
    for (p, &h) in payloads.iter().zip(&keys) {
        match scratch.read(9, h, |b| b.to_vec()) {
            Ok(bytes) => {
                assert_eq!(bytes, *p);
                survivors += 1;
            }
            Err(ScratchError::MissingBlock { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    // An untouched recovered file primes one (0, zero-hash) sentinel entry;
    // reading it fails verification and drops it.
    let _ = scratch.read(0, Hash::ZERO, |b| b.len());
    assert_eq!(survivors, scratch.count());
}

#[test]
fn old_blocks_are_recycled_for_new_ones() {
    init_logging();
    let dir = tempdir().unwrap();
    let scratch = Scratch::open(small_config(dir.path(), 4)).unwrap();

    // Far more data than 4 × 64 KiB of files can hold.
    let mut keys = Vec::new();
    for i in 0..120u32 {
        let payload = vec![(i % 251) as u8; 16 * 1024];
        let hash = Hash::of(&payload);
        let realm = 3;
        let owned = payload.clone();
        scratch
            .write(realm, hash, owned.len(), move |buf| buf.copy_from_slice(&owned))
            .unwrap();
        keys.push((hash, payload));
    }

    // The oldest blocks were evicted with their files; the newest write is
    // always readable.
    let (last_hash, last_payload) = keys.last().unwrap();
    assert_eq!(
        scratch.read(3, *last_hash, |b| b.to_vec()).unwrap(),
        *last_payload
    );
    assert!((scratch.count() as usize) < keys.len());
}

// ── The external payload-parsing layer ───────────────────────────────────────
//
// The cache stores opaque bytes; a parsing layer on top frames them with its
// own CRC. These tests emulate that layer: payload = data ++ crc32(data),
// with the reader rejecting a bad CRC via `ChecksumError`.

fn frame_with_crc(data: &[u8]) -> Vec<u8> {
    let mut framed = data.to_vec();
    framed.extend_from_slice(&crc32fast::hash(data).to_le_bytes());
    framed
}

fn unframe_checked(framed: &[u8]) -> Result<Vec<u8>, ChecksumError> {
    if framed.len() < 4 {
        return Err(ChecksumError);
    }
    let (data, stored) = framed.split_at(framed.len() - 4);
    let stored = u32::from_le_bytes(stored.try_into().map_err(|_| ChecksumError)?);
    if crc32fast::hash(data) != stored {
        return Err(ChecksumError);
    }
    Ok(data.to_vec())
}

#[test]
fn checksummed_payloads_round_trip_through_try_read() {
    init_logging();
    let dir = tempdir().unwrap();
    let scratch = Scratch::open(small_config(dir.path(), 4)).unwrap();

    let framed = frame_with_crc(b"typed value bytes");
    let hash = write_bytes(&scratch, 2, &framed);

    let data = scratch.try_read(2, hash, |b| unframe_checked(b)).unwrap();
    assert_eq!(data, b"typed value bytes");
}

#[test]
fn checksum_rejection_drops_the_index_entry() {
    init_logging();
    let dir = tempdir().unwrap();
    let scratch = Scratch::open(small_config(dir.path(), 4)).unwrap();

    let hash = write_bytes(&scratch, 2, b"unframed bytes the parser rejects");
    assert!(scratch.contains(2, hash));

    let err = scratch.try_read(2, hash, |b| unframe_checked(b)).unwrap_err();
    assert!(matches!(err, ScratchError::ChecksumFailed { .. }));
    assert!(!scratch.contains(2, hash));
}

#[test]
fn concurrent_writers_and_readers() {
    init_logging();
    let dir = tempdir().unwrap();
    let scratch = Scratch::open(SourceConfig::single(dir.path(), 6, 256 * 1024)).unwrap();

    std::thread::scope(|s| {
        for t in 0..4u32 {
            let scratch = &scratch;
            s.spawn(move || {
                for i in 0..50u32 {
                    let payload = format!("thread {t} block {i}").into_bytes();
                    let hash = Hash::of(&payload);
                    let owned = payload.clone();
                    scratch
                        .write(t, hash, owned.len(), move |buf| buf.copy_from_slice(&owned))
                        .unwrap();
                    match scratch.read(t, hash, |b| b.to_vec()) {
                        Ok(bytes) => assert_eq!(bytes, payload),
                        // A racing recycle may have evicted it; never wrong bytes.
                        Err(ScratchError::MissingBlock { .. }) => {}
                        Err(other) => panic!("unexpected error: {other}"),
                    }
                }
            });
        }
    });
}

#[test]
#[ignore = "minutes of runtime; exercises wheel rotation under sustained load"]
fn sustained_write_read_remove_stress() {
    init_logging();
    let dir = tempdir().unwrap();
    let scratch = Scratch::open(SourceConfig::single(dir.path(), 8, 1 << 20)).unwrap();

    let mut rng_state = 0x2545_F491_4F6C_DD1Du64;
    let mut next = move || {
        rng_state ^= rng_state << 13;
        rng_state ^= rng_state >> 7;
        rng_state ^= rng_state << 17;
        rng_state
    };

    for round in 0..200_000u64 {
        let seed = next();
        let payload = seed.to_le_bytes().repeat(1 + (seed % 64) as usize);
        let hash = Hash::of(&payload);
        let realm = (round % 7) as u32;
        let owned = payload.clone();
        scratch
            .write(realm, hash, owned.len(), move |buf| buf.copy_from_slice(&owned))
            .unwrap();
        match scratch.read(realm, hash, |b| b.to_vec()) {
            Ok(bytes) => assert_eq!(bytes, payload),
            Err(ScratchError::MissingBlock { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
        if round % 3 == 0 {
            scratch.remove(realm, hash);
        }
    }
}
