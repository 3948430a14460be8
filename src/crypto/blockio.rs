//! Block-granular encrypted file I/O with a per-node one-block cache.
//!
//! Reads always fetch whole blocks from the backing file and decrypt them
//! into the cache; writes encrypt a private copy so the caller's buffer is
//! never clobbered. A request that is not block-aligned, or longer than one
//! block, is split into per-block requests here.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use tracing::debug;

use super::KeySchedule;

/// Single-slot plaintext cache. `len == 0` means empty.
#[derive(Debug)]
pub struct BlockCache {
    offset: u64,
    len: usize,
    data: Vec<u8>,
}

impl BlockCache {
    pub fn new(block_size: usize) -> Self {
        Self {
            offset: 0,
            len: 0,
            data: vec![0u8; block_size],
        }
    }

    pub fn clear(&mut self) {
        self.data.fill(0);
        self.len = 0;
    }
}

fn all_zero(buf: &[u8]) -> bool {
    buf.iter().all(|&b| b == 0)
}

/// Read one block (or its tail at EOF) at a block-aligned offset and decrypt
/// it in place. Full all-zero blocks pass through untouched when holes are
/// allowed.
pub fn read_one_block(
    ks: &KeySchedule,
    file: &File,
    buf: &mut [u8],
    offset: u64,
) -> io::Result<usize> {
    let block_size = ks.block_size();
    let block_num = offset / block_size as u64;

    let read = file.read_at(buf, offset)?;
    if read == 0 {
        return Ok(0);
    }

    let data = &mut buf[..read];
    if read == block_size {
        if !(ks.allow_holes() && all_zero(data)) {
            ks.block_decode(data, block_num)?;
        }
    } else {
        ks.stream_decode(data, block_num)?;
    }

    Ok(read)
}

/// Encrypt `buf` in place and write it at a block-aligned offset.
pub fn write_one_block(
    ks: &KeySchedule,
    file: &File,
    buf: &mut [u8],
    offset: u64,
) -> io::Result<usize> {
    let block_size = ks.block_size();
    let block_num = offset / block_size as u64;

    if buf.len() == block_size {
        ks.block_encode(buf, block_num)?;
    } else {
        ks.stream_encode(buf, block_num)?;
    }

    file.write_all_at(buf, offset)?;
    Ok(buf.len())
}

/// Serve a read of at most one block at a block-aligned offset, through the
/// cache. Always fetches full blocks from the backing file; a short result
/// means the last block of the file.
pub fn cache_read_one_block(
    ks: &KeySchedule,
    cache: &mut BlockCache,
    file: &File,
    out: &mut [u8],
    offset: u64,
) -> io::Result<usize> {
    if offset == cache.offset && cache.len != 0 {
        let len = out.len().min(cache.len);
        out[..len].copy_from_slice(&cache.data[..len]);
        return Ok(len);
    }

    if cache.len > 0 {
        cache.clear();
    }

    let block_size = ks.block_size();
    let mut block = std::mem::take(&mut cache.data);
    let result = read_one_block(ks, file, &mut block[..block_size], offset);
    cache.data = block;

    let read = result?;
    if read > 0 {
        cache.offset = offset;
        cache.len = read;
        let len = read.min(out.len());
        out[..len].copy_from_slice(&cache.data[..len]);
        return Ok(len);
    }
    Ok(0)
}

/// Write at most one block at a block-aligned offset through the cache. The
/// data is copied before encryption so the caller's buffer stays plaintext;
/// on success the cache holds what was persisted, on failure it is dropped.
pub fn cache_write_one_block(
    ks: &KeySchedule,
    cache: &mut BlockCache,
    file: &File,
    data: &[u8],
    offset: u64,
) -> io::Result<usize> {
    cache.data[..data.len()].copy_from_slice(data);

    let mut scratch = std::mem::take(&mut cache.data);
    let result = write_one_block(ks, file, &mut scratch[..data.len()], offset);
    cache.data = scratch;

    match result {
        Ok(written) => {
            cache.data[..data.len()].copy_from_slice(data);
            cache.offset = offset;
            cache.len = data.len();
            Ok(written)
        }
        Err(e) => {
            cache.clear();
            Err(e)
        }
    }
}

/// Read an arbitrary range. Partial head and tail blocks go through a
/// scratch buffer; interior aligned whole blocks land directly in `out`.
pub fn read_blocks(
    ks: &KeySchedule,
    cache: &mut BlockCache,
    file: &File,
    out: &mut [u8],
    offset: u64,
) -> io::Result<usize> {
    let block_size = ks.block_size();
    let mut partial_offset = (offset % block_size as u64) as usize;
    let mut block_num = offset / block_size as u64;

    if partial_offset == 0 && out.len() <= block_size {
        return cache_read_one_block(ks, cache, file, out, offset);
    }

    let mut scratch: Option<Vec<u8>> = None;
    let mut produced = 0usize;
    let mut remaining = out.len();

    while remaining != 0 {
        let block_offset = block_num * block_size as u64;
        let direct = partial_offset == 0 && remaining >= block_size;

        let read = if direct {
            let dst = &mut out[produced..produced + block_size];
            cache_read_one_block(ks, cache, file, dst, block_offset)?
        } else {
            let buf = scratch.get_or_insert_with(|| vec![0u8; block_size]);
            cache_read_one_block(ks, cache, file, &mut buf[..block_size], block_offset)?
        };

        if read <= partial_offset {
            break;
        }

        let copy = (read - partial_offset).min(remaining);
        if !direct {
            let buf = scratch.as_ref().expect("scratch allocated for partial block");
            out[produced..produced + copy]
                .copy_from_slice(&buf[partial_offset..partial_offset + copy]);
        }

        produced += copy;
        remaining -= copy;
        block_num += 1;
        partial_offset = 0;

        if read < block_size {
            break;
        }
    }

    Ok(produced)
}

/// Grow the file from `old_size` to `new_size`: round the current last block
/// up to full length, then write zero blocks unless holes are allowed, then
/// optionally the final partial block.
pub fn pad_file(
    ks: &KeySchedule,
    cache: &mut BlockCache,
    file: &File,
    old_size: u64,
    new_size: u64,
    force_write: bool,
) -> io::Result<()> {
    let block_size = ks.block_size() as u64;
    let mut old_last_block = old_size / block_size;
    let new_last_block = new_size / block_size;
    let new_block_len = (new_size % block_size) as usize;

    if old_last_block == new_last_block {
        // The merging write will read and pad this block anyway.
        debug!(old_size, new_size, "pad skipped within last block");
        return Ok(());
    }

    let mut data = vec![0u8; block_size as usize];

    // Extend the trailing partial block to full length.
    let head_len = (old_size % block_size) as usize;
    if head_len != 0 {
        let offset = old_last_block * block_size;
        data.fill(0);
        cache_read_one_block(ks, cache, file, &mut data[..head_len], offset)?;
        cache_write_one_block(ks, cache, file, &data[..block_size as usize], offset)?;
        old_last_block += 1;
    }

    if !ks.allow_holes() {
        while old_last_block != new_last_block {
            let offset = old_last_block * block_size;
            data.fill(0);
            cache_write_one_block(ks, cache, file, &data[..block_size as usize], offset)?;
            old_last_block += 1;
        }
    }

    if force_write && new_block_len != 0 {
        let offset = new_last_block * block_size;
        data.fill(0);
        cache_write_one_block(ks, cache, file, &data[..new_block_len], offset)?;
    }

    Ok(())
}

/// Write an arbitrary range. Extends the file first when the write starts
/// past EOF, then merges into each affected block as needed.
pub fn write_blocks(
    ks: &KeySchedule,
    cache: &mut BlockCache,
    file: &File,
    file_size: u64,
    data: &[u8],
    offset: u64,
) -> io::Result<usize> {
    let block_size = ks.block_size();
    let mut block_num = offset / block_size as u64;
    let mut partial_offset = (offset % block_size as u64) as usize;

    let last_file_block = file_size / block_size as u64;
    let last_block_len = (file_size % block_size as u64) as usize;

    let last_nonempty_block: i64 = if last_block_len == 0 {
        last_file_block as i64 - 1
    } else {
        last_file_block as i64
    };

    if offset > file_size {
        pad_file(ks, cache, file, file_size, offset, false)?;
    }

    // Whole-block writes, and partial writes that cover at least what the
    // last block already holds, need no merge.
    if partial_offset == 0 && data.len() <= block_size {
        if data.len() == block_size
            || (block_num == last_file_block && data.len() >= last_block_len)
        {
            return cache_write_one_block(ks, cache, file, data, offset);
        }
    }

    let mut merge: Option<Vec<u8>> = None;
    let mut consumed = 0usize;
    let mut remaining = data.len();

    while remaining != 0 {
        let block_offset = block_num * block_size as u64;
        let to_copy = (block_size - partial_offset).min(remaining);

        if to_copy == block_size
            || (partial_offset == 0 && block_offset + to_copy as u64 >= file_size)
        {
            // Write directly from the caller's data.
            cache_write_one_block(
                ks,
                cache,
                file,
                &data[consumed..consumed + to_copy],
                block_offset,
            )?;
        } else {
            let buf = merge.get_or_insert_with(|| vec![0u8; block_size]);
            buf.fill(0);

            let mut len = partial_offset + to_copy;
            if block_num as i64 <= last_nonempty_block {
                let read = cache_read_one_block(ks, cache, file, &mut buf[..block_size], block_offset)?;
                if read > len {
                    len = read;
                }
            }
            buf[partial_offset..partial_offset + to_copy]
                .copy_from_slice(&data[consumed..consumed + to_copy]);

            cache_write_one_block(ks, cache, file, &buf[..len], block_offset)?;
        }

        remaining -= to_copy;
        consumed += to_copy;
        block_num += 1;
        partial_offset = 0;
    }

    Ok(data.len())
}

/// Sequentially encode the whole of `src` into `dst`, block by block. Used
/// by copy-up; the destination is a fresh staging file so no cache is
/// involved.
pub fn encode_file(ks: &KeySchedule, src: &File, dst: &File) -> io::Result<u64> {
    let block_size = ks.block_size();
    let mut buf = vec![0u8; block_size];
    let mut offset = 0u64;

    loop {
        buf.fill(0);

        // Fill a whole block so every write stays block-aligned; only the
        // final block may come up short.
        let mut filled = 0;
        while filled < block_size {
            let n = src.read_at(&mut buf[filled..block_size], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }

        write_one_block(ks, dst, &mut buf[..filled], offset)?;
        offset += filled as u64;
    }

    Ok(offset)
}
