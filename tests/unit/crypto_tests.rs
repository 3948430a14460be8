use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;

use jailfs::crypto::blockio::{self, BlockCache};
use jailfs::crypto::{CryptoParams, KeySchedule, DEFAULT_PASSWORD};
use tempfile::tempdir;

const BS: usize = 1024;

fn schedule() -> KeySchedule {
    KeySchedule::from_password(DEFAULT_PASSWORD, CryptoParams::default())
}

fn schedule_no_holes() -> KeySchedule {
    KeySchedule::from_password(
        DEFAULT_PASSWORD,
        CryptoParams {
            allow_holes: false,
            ..CryptoParams::default()
        },
    )
}

fn temp_file() -> (tempfile::TempDir, std::fs::File) {
    let dir = tempdir().unwrap();
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(dir.path().join("blob"))
        .unwrap();
    (dir, file)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8 + 1).collect()
}

#[test]
fn write_then_read_single_partial_block() {
    let ks = schedule();
    let (_dir, file) = temp_file();
    let mut cache = BlockCache::new(BS);

    let data = pattern(100);
    let written = blockio::write_blocks(&ks, &mut cache, &file, 0, &data, 0).unwrap();
    assert_eq!(written, 100);

    // On-disk bytes are ciphertext.
    let mut raw = vec![0u8; 100];
    file.read_at(&mut raw, 0).unwrap();
    assert_ne!(raw, data);

    let mut fresh = BlockCache::new(BS);
    let mut out = vec![0u8; 100];
    let n = blockio::read_blocks(&ks, &mut fresh, &file, &mut out, 0).unwrap();
    assert_eq!(n, 100);
    assert_eq!(out, data);
}

#[test]
fn write_then_read_multiple_blocks_unaligned() {
    let ks = schedule();
    let (_dir, file) = temp_file();
    let mut cache = BlockCache::new(BS);

    let data = pattern(3 * BS + 700);
    blockio::write_blocks(&ks, &mut cache, &file, 0, &data, 0).unwrap();

    // Unaligned read crossing several block boundaries.
    let mut out = vec![0u8; 2 * BS];
    let n = blockio::read_blocks(&ks, &mut BlockCache::new(BS), &file, &mut out, 500).unwrap();
    assert_eq!(n, 2 * BS);
    assert_eq!(out, data[500..500 + 2 * BS]);
}

#[test]
fn read_past_eof_returns_zero_bytes() {
    let ks = schedule();
    let (_dir, file) = temp_file();
    let mut cache = BlockCache::new(BS);

    blockio::write_blocks(&ks, &mut cache, &file, 0, &pattern(10), 0).unwrap();

    let mut out = vec![0u8; 64];
    let n = blockio::read_blocks(&ks, &mut BlockCache::new(BS), &file, &mut out, 4096).unwrap();
    assert_eq!(n, 0);
}

#[test]
fn overwrite_merges_into_existing_block() {
    let ks = schedule();
    let (_dir, file) = temp_file();
    let mut cache = BlockCache::new(BS);

    let base = vec![b'x'; 9];
    blockio::write_blocks(&ks, &mut cache, &file, 0, &base, 0).unwrap();
    blockio::write_blocks(&ks, &mut cache, &file, 9, b"Y", 0).unwrap();

    let mut out = vec![0u8; 9];
    let n = blockio::read_blocks(&ks, &mut BlockCache::new(BS), &file, &mut out, 0).unwrap();
    assert_eq!(n, 9);
    assert_eq!(&out, b"Yxxxxxxxx");
}

#[test]
fn write_past_eof_pads_intermediate_blocks() {
    let ks = schedule();
    let (_dir, file) = temp_file();
    let mut cache = BlockCache::new(BS);

    blockio::write_blocks(&ks, &mut cache, &file, 0, &pattern(100), 0).unwrap();
    // Leave a gap of several blocks; the hole must read back as zeros.
    let tail = pattern(50);
    let offset = (4 * BS + 10) as u64;
    blockio::write_blocks(&ks, &mut cache, &file, 100, &tail, offset).unwrap();

    let mut out = vec![0u8; BS];
    let n = blockio::read_blocks(&ks, &mut BlockCache::new(BS), &file, &mut out, 2 * BS as u64)
        .unwrap();
    assert_eq!(n, BS);
    assert!(out.iter().all(|&b| b == 0));

    let mut tail_out = vec![0u8; 50];
    let n = blockio::read_blocks(&ks, &mut BlockCache::new(BS), &file, &mut tail_out, offset)
        .unwrap();
    assert_eq!(n, 50);
    assert_eq!(tail_out, tail);
}

#[test]
fn padding_without_holes_writes_zero_blocks() {
    let ks = schedule_no_holes();
    let (_dir, file) = temp_file();
    let mut cache = BlockCache::new(BS);

    blockio::write_blocks(&ks, &mut cache, &file, 0, b"abc", 0).unwrap();
    blockio::write_blocks(&ks, &mut cache, &file, 3, b"z", (2 * BS + 1) as u64).unwrap();

    // The intermediate block was materialized, not left sparse.
    let meta = file.metadata().unwrap();
    assert!(meta.len() >= (2 * BS + 2) as u64);

    let mut out = vec![0u8; BS];
    let n = blockio::read_blocks(&ks, &mut BlockCache::new(BS), &file, &mut out, BS as u64).unwrap();
    assert_eq!(n, BS);
    assert!(out.iter().all(|&b| b == 0));
}

#[test]
fn cache_serves_repeated_reads_of_one_block() {
    let ks = schedule();
    let (_dir, file) = temp_file();
    let mut cache = BlockCache::new(BS);

    let data = pattern(BS);
    blockio::write_blocks(&ks, &mut cache, &file, 0, &data, 0).unwrap();

    let mut out1 = vec![0u8; BS];
    blockio::read_blocks(&ks, &mut cache, &file, &mut out1, 0).unwrap();

    // Corrupt the backing file; a cached read must not notice.
    file.write_all_at(&vec![0xAA; BS], 0).unwrap();
    let mut out2 = vec![0u8; BS];
    blockio::read_blocks(&ks, &mut cache, &file, &mut out2, 0).unwrap();
    assert_eq!(out1, out2);
}

#[test]
fn encode_file_roundtrips_through_read_blocks() {
    let ks = schedule();
    let dir = tempdir().unwrap();

    let src_path = dir.path().join("plain");
    let data = pattern(2 * BS + 333);
    std::fs::write(&src_path, &data).unwrap();
    let src = std::fs::File::open(&src_path).unwrap();

    let dst_path = dir.path().join("cipher");
    let dst = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&dst_path)
        .unwrap();

    let total = blockio::encode_file(&ks, &src, &dst).unwrap();
    assert_eq!(total, data.len() as u64);
    assert_eq!(std::fs::metadata(&dst_path).unwrap().len(), data.len() as u64);
    assert_ne!(std::fs::read(&dst_path).unwrap(), data);

    let mut out = vec![0u8; data.len()];
    let n = blockio::read_blocks(&ks, &mut BlockCache::new(BS), &dst, &mut out, 0).unwrap();
    assert_eq!(n, data.len());
    assert_eq!(out, data);
}

#[test]
fn all_zero_blocks_stay_plaintext_with_holes_allowed() {
    let ks = schedule();
    let (_dir, file) = temp_file();

    // A raw zero block on disk decodes to zeros without a cipher pass.
    file.write_all_at(&vec![0u8; BS], 0).unwrap();
    let mut out = vec![0u8; BS];
    let n = blockio::read_blocks(&ks, &mut BlockCache::new(BS), &file, &mut out, 0).unwrap();
    assert_eq!(n, BS);
    assert!(out.iter().all(|&b| b == 0));
}
