// At the end of every sector NTFS overwrites the last two bytes of a
// multi-sector structure (FILE record, INDX block) with the Update Sequence
// Number. The genuine bytes live in the Update Sequence Array right after
// the USN itself.

use log::{debug, warn};

use crate::bytes::ByteView;
use crate::error::{DirTreeError, Result};

/// Outcome of correcting one block inside a larger buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Signature matched and every sector trailer was restored.
    Fixed,
    /// No signature, e.g. a zeroed filler cluster. Left untouched.
    Unsigned,
    /// Signature matched but a sector trailer did not carry the USN.
    Torn,
}

fn usa_location(block: &[u8], sector_size: usize) -> Result<(usize, usize)> {
    let view = ByteView::new(block);
    let usa_offset = view.u16_at(4)? as usize;
    let usa_count = view.u16_at(6)? as usize;

    if usa_count == 0 {
        return Err(DirTreeError::Corruption("empty update sequence array".into()));
    }
    if usa_offset + 2 * usa_count > block.len() {
        return Err(DirTreeError::Corruption(format!(
            "update sequence array at 0x{usa_offset:X} ({usa_count} entries) lies outside the block"
        )));
    }
    if (usa_count - 1) * sector_size > block.len() {
        return Err(DirTreeError::Corruption(format!(
            "update sequence array protects {} sectors but the block holds {}",
            usa_count - 1,
            block.len() / sector_size
        )));
    }
    Ok((usa_offset, usa_count))
}

/// Restore the sector trailers of a single FILE/INDX structure in place.
pub fn apply_fixups(block: &mut [u8], sector_size: usize) -> Result<()> {
    let (usa_offset, usa_count) = usa_location(block, sector_size)?;
    let usn = [block[usa_offset], block[usa_offset + 1]];

    // Check every sector first so a torn block is left as read.
    for i in 1..usa_count {
        let sector_end = i * sector_size - 2;
        if block[sector_end..sector_end + 2] != usn {
            return Err(DirTreeError::Corruption(format!(
                "update sequence mismatch in sector {} (expected {:02X}{:02X}, found {:02X}{:02X})",
                i - 1,
                usn[1],
                usn[0],
                block[sector_end + 1],
                block[sector_end]
            )));
        }
    }
    for i in 1..usa_count {
        let sector_end = i * sector_size - 2;
        let fix_pos = usa_offset + 2 * i;
        block[sector_end] = block[fix_pos];
        block[sector_end + 1] = block[fix_pos + 1];
    }
    Ok(())
}

/// Correct every `block_size` chunk of `buf` that starts with `magic`.
pub fn fixup_blocks(
    buf: &mut [u8],
    block_size: usize,
    sector_size: usize,
    magic: &[u8; 4],
) -> Result<Vec<BlockState>> {
    if block_size == 0 || sector_size == 0 || block_size % sector_size != 0 {
        return Err(DirTreeError::InvalidVolume(format!(
            "block size {block_size} is not a multiple of sector size {sector_size}"
        )));
    }

    let mut states = Vec::with_capacity(buf.len() / block_size);
    for (i, block) in buf.chunks_exact_mut(block_size).enumerate() {
        if &block[..4] != magic {
            debug!(
                "Block {i} has no {} signature, skipping fixup",
                String::from_utf8_lossy(magic)
            );
            states.push(BlockState::Unsigned);
            continue;
        }
        match apply_fixups(block, sector_size) {
            Ok(()) => states.push(BlockState::Fixed),
            Err(e) => {
                warn!("Block {i}: {e}");
                states.push(BlockState::Torn);
            }
        }
    }
    Ok(states)
}

/// Inverse of `apply_fixups`: stash each sector trailer in the USA and
/// stamp `usn` over it, as the disk driver does before a write.
pub fn protect(block: &mut [u8], sector_size: usize, usn: u16) -> Result<()> {
    let (usa_offset, usa_count) = usa_location(block, sector_size)?;
    let usn = usn.to_le_bytes();
    block[usa_offset..usa_offset + 2].copy_from_slice(&usn);
    for i in 1..usa_count {
        let sector_end = i * sector_size - 2;
        let fix_pos = usa_offset + 2 * i;
        block[fix_pos] = block[sector_end];
        block[fix_pos + 1] = block[sector_end + 1];
        block[sector_end..sector_end + 2].copy_from_slice(&usn);
    }
    Ok(())
}
