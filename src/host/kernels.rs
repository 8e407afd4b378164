//! Work-group emulation of the kernel set.
//!
//! Work-groups run one after another. Inside a group each
//! barrier-delimited phase is a loop over the local ids, so a phase sees
//! everything the previous one wrote to local memory, as on a device.
//! Errors carry the OpenCL-numbered status the launch fails with.

use crate::radix_sort::{ELEMENTS_PER_ITEM, RADIX_BITS, RADIX_BUCKETS};
use crate::surface::{STATUS_INVALID_ARG_SIZE, STATUS_INVALID_VALUE, STATUS_INVALID_WORK_GROUP_SIZE};

/// Key used to fill the tail of the last tile. All digits are 15, so the
/// padding sorts behind every real key of the tile.
const PAD_KEY: u32 = u32::MAX;

/// ND-range of one launch.
#[derive(Debug, Clone, Copy)]
pub(super) struct Grid {
    pub global: usize,
    pub local: usize,
}

impl Grid {
    pub fn groups(&self) -> usize {
        self.global / self.local
    }
}

fn digit(key: u32, bit_offset: u32) -> usize {
    ((key >> bit_offset) as usize) & (RADIX_BUCKETS - 1)
}

/// Double-buffered Hillis-Steele inclusive scan of `scratch[..w]`.
///
/// `scratch` holds `2w` words; returns the offset of the half holding the
/// result.
fn hillis_steele(scratch: &mut [u32], w: usize) -> usize {
    let mut src = 0;
    let mut offset = 1;
    while offset < w {
        let dst = w - src;
        for lid in 0..w {
            let v = scratch[src + lid];
            scratch[dst + lid] = if lid >= offset {
                v.wrapping_add(scratch[src + lid - offset])
            } else {
                v
            };
        }
        src = dst;
        offset *= 2;
    }
    src
}

/// `block_scan(data, block_sums, n, scratch[2W])`
pub(super) fn block_scan(
    data: &mut [u32],
    block_sums: &mut [u32],
    n: usize,
    scratch: &mut [u32],
    grid: Grid,
) -> Result<(), i32> {
    let w = grid.local;
    if scratch.len() < 2 * w {
        return Err(STATUS_INVALID_ARG_SIZE);
    }
    if data.len() < n || block_sums.len() < grid.groups() {
        return Err(STATUS_INVALID_VALUE);
    }

    for grp in 0..grid.groups() {
        let base = grp * w;
        for lid in 0..w {
            let gid = base + lid;
            scratch[lid] = if gid < n { data[gid] } else { 0 };
        }
        let out = hillis_steele(scratch, w);
        for lid in 0..w {
            let gid = base + lid;
            let inclusive = scratch[out + lid];
            if gid < n {
                data[gid] = inclusive.wrapping_sub(data[gid]);
            }
            if lid == w - 1 {
                block_sums[grp] = inclusive;
            }
        }
    }
    Ok(())
}

/// `uniform_add(data, carries, n)`
pub(super) fn uniform_add(
    data: &mut [u32],
    carries: &[u32],
    n: usize,
    grid: Grid,
) -> Result<(), i32> {
    let w = grid.local;
    let end = n.min(grid.global);
    if data.len() < n || carries.len() < end.div_ceil(w) {
        return Err(STATUS_INVALID_VALUE);
    }
    for gid in 0..end {
        data[gid] = data[gid].wrapping_add(carries[gid / w]);
    }
    Ok(())
}

/// Scalar arguments shared by `radix_local` and `radix_permute`.
#[derive(Debug, Clone, Copy)]
pub(super) struct RadixPass {
    pub bit_offset: u32,
    pub n: usize,
    pub num_blocks: usize,
    pub stride: usize,
}

impl RadixPass {
    fn check(&self, data_len: usize, table_len: usize, grid: Grid) -> Result<(), i32> {
        if grid.local < RADIX_BUCKETS {
            return Err(STATUS_INVALID_WORK_GROUP_SIZE);
        }
        if !(1..=2).contains(&self.stride) || self.bit_offset + RADIX_BITS > u32::BITS {
            return Err(STATUS_INVALID_VALUE);
        }
        if data_len < self.n * self.stride
            || table_len < RADIX_BUCKETS * self.num_blocks
            || grid.groups() > self.num_blocks
        {
            return Err(STATUS_INVALID_VALUE);
        }
        Ok(())
    }
}

/// Local memory of one `radix_local` work-group.
pub(super) struct RadixScratch<'a> {
    /// `ELEMENTS_PER_ITEM * W * stride` words.
    pub tile: &'a mut [u32],
    /// `2W` words.
    pub scan: &'a mut [u32],
    /// Digit start and end positions, `2 * RADIX_BUCKETS` words.
    pub digits: &'a mut [u32],
}

/// One stable split of the tile on `bit`: keys with the bit clear keep
/// their order at the front, keys with the bit set keep theirs behind.
fn split(local: &mut RadixScratch<'_>, stride: usize, bit: u32, w: usize) {
    // Private registers: each work-item holds its own consecutive entries.
    let mut regs = vec![(0u32, 0u32); w * ELEMENTS_PER_ITEM];
    let mut own = vec![0u32; w];
    for lid in 0..w {
        let mut falses = 0;
        for k in 0..ELEMENTS_PER_ITEM {
            let p = lid * ELEMENTS_PER_ITEM + k;
            let key = local.tile[p * stride];
            let value = if stride == 2 { local.tile[p * stride + 1] } else { 0 };
            regs[p] = (key, value);
            falses += 1 - ((key >> bit) & 1);
        }
        own[lid] = falses;
        local.scan[lid] = falses;
    }

    let out = hillis_steele(local.scan, w);
    let total_false = local.scan[out + w - 1] as usize;

    for lid in 0..w {
        let mut before = (local.scan[out + lid] - own[lid]) as usize;
        for k in 0..ELEMENTS_PER_ITEM {
            let p = lid * ELEMENTS_PER_ITEM + k;
            let (key, value) = regs[p];
            let dest = if (key >> bit) & 1 == 0 {
                before += 1;
                before - 1
            } else {
                total_false + p - before
            };
            local.tile[dest * stride] = key;
            if stride == 2 {
                local.tile[dest * stride + 1] = value;
            }
        }
    }
}

/// `radix_local(data, hist, block_offsets, bit_offset, n, num_blocks,
/// stride, tile, scan, digits)`
pub(super) fn radix_local(
    data: &mut [u32],
    hist: &mut [u32],
    block_offsets: &mut [u32],
    pass: RadixPass,
    mut local: RadixScratch<'_>,
    grid: Grid,
) -> Result<(), i32> {
    pass.check(data.len(), hist.len().min(block_offsets.len()), grid)?;
    let w = grid.local;
    let stride = pass.stride;
    let tile_len = ELEMENTS_PER_ITEM * w;
    if local.tile.len() < tile_len * stride
        || local.scan.len() < 2 * w
        || local.digits.len() < 2 * RADIX_BUCKETS
    {
        return Err(STATUS_INVALID_ARG_SIZE);
    }

    for grp in 0..grid.groups() {
        let base = grp * tile_len;
        let valid = pass.n.saturating_sub(base).min(tile_len);

        for k in 0..ELEMENTS_PER_ITEM {
            for lid in 0..w {
                let p = lid + k * w;
                let (key, value) = if p < valid {
                    let idx = (base + p) * stride;
                    (data[idx], if stride == 2 { data[idx + 1] } else { 0 })
                } else {
                    (PAD_KEY, 0)
                };
                local.tile[p * stride] = key;
                if stride == 2 {
                    local.tile[p * stride + 1] = value;
                }
            }
        }

        for bit in pass.bit_offset..pass.bit_offset + RADIX_BITS {
            split(&mut local, stride, bit, w);
        }

        for lid in 0..RADIX_BUCKETS {
            local.digits[lid] = 0;
            local.digits[RADIX_BUCKETS + lid] = 0;
        }
        for lid in 0..w {
            for k in 0..ELEMENTS_PER_ITEM {
                let p = lid * ELEMENTS_PER_ITEM + k;
                if p >= valid {
                    continue;
                }
                let d = digit(local.tile[p * stride], pass.bit_offset);
                if p == 0 || digit(local.tile[(p - 1) * stride], pass.bit_offset) != d {
                    local.digits[d] = p as u32;
                }
                if p + 1 == valid || digit(local.tile[(p + 1) * stride], pass.bit_offset) != d {
                    local.digits[RADIX_BUCKETS + d] = (p + 1) as u32;
                }
            }
        }

        for d in 0..RADIX_BUCKETS {
            let start = local.digits[d];
            let end = local.digits[RADIX_BUCKETS + d];
            hist[d * pass.num_blocks + grp] = end - start;
            block_offsets[grp * RADIX_BUCKETS + d] = start;
        }

        for k in 0..ELEMENTS_PER_ITEM {
            for lid in 0..w {
                let p = lid + k * w;
                if p < valid {
                    let idx = (base + p) * stride;
                    data[idx] = local.tile[p * stride];
                    if stride == 2 {
                        data[idx + 1] = local.tile[p * stride + 1];
                    }
                }
            }
        }
    }
    Ok(())
}

/// `radix_permute(src, dst, hist, block_offsets, bit_offset, n,
/// num_blocks, stride)`
pub(super) fn radix_permute(
    src: &[u32],
    dst: &mut [u32],
    hist: &[u32],
    block_offsets: &[u32],
    pass: RadixPass,
    grid: Grid,
) -> Result<(), i32> {
    pass.check(src.len(), hist.len().min(block_offsets.len()), grid)?;
    if dst.len() < pass.n * pass.stride {
        return Err(STATUS_INVALID_VALUE);
    }
    let w = grid.local;
    let stride = pass.stride;
    let tile_len = ELEMENTS_PER_ITEM * w;

    for grp in 0..grid.groups() {
        for k in 0..ELEMENTS_PER_ITEM {
            for lid in 0..w {
                let p = lid + k * w;
                let idx = grp * tile_len + p;
                if idx >= pass.n {
                    continue;
                }
                let key = src[idx * stride];
                let d = digit(key, pass.bit_offset);
                let base = hist[d * pass.num_blocks + grp] as usize;
                let start = block_offsets[grp * RADIX_BUCKETS + d] as usize;
                let dest = match (base + p).checked_sub(start) {
                    Some(dest) if dest < pass.n => dest,
                    _ => return Err(STATUS_INVALID_VALUE),
                };
                dst[dest * stride] = key;
                if stride == 2 {
                    dst[dest * stride + 1] = src[idx * stride + 1];
                }
            }
        }
    }
    Ok(())
}
