//! Stable LSD radix sort of 32-bit keys, optionally carrying a 32-bit
//! value, four key bits per pass.
//!
//! Each pass over digit `d` runs three steps on the device:
//!
//! 1. `radix_local` sorts every tile of `4W` elements by `d` in local
//!    memory (four stable one-bit splits), writes the tile back and emits
//!    per-tile digit counts and digit start offsets. Counts are stored
//!    column-major, `hist[digit * num_blocks + block]`.
//! 2. The embedded [`BlockScanEngine`] scans the count table in place, so
//!    every (digit, block) cell becomes the global position of that
//!    block's first element with that digit.
//! 3. `radix_permute` scatters each element to
//!    `hist[digit][block] + (tile position - digit start)` in the other
//!    half of a [`DoubleBuffer`], which then swaps.
//!
//! Key/value data is interleaved on the device: key `i` at word `2i`,
//! its value at `2i + 1`.

use crate::config::{ScanConfig, SortConfig, WorkGroupSize, MIN_SORT_WORK_GROUP_SIZE};
use crate::gpu_common::DoubleBuffer;
use crate::plan::Reservation;
use crate::scan::{scan_local_bytes, BlockScanEngine};
use crate::surface::{resolve_work_group_size, DeviceSurface, KernelArg, KernelName};
use crate::{ClppError, ClppResult, EngineState};

use std::sync::Arc;

/// Key bits consumed per pass.
pub const RADIX_BITS: u32 = 4;

/// Distinct digit values per pass.
pub const RADIX_BUCKETS: usize = 1 << RADIX_BITS;

/// Elements each work-item handles; a tile is `ELEMENTS_PER_ITEM * W`.
pub const ELEMENTS_PER_ITEM: usize = 4;

/// Words of local memory `radix_local` needs besides the tile and the
/// `2W` scan scratch: one start and one end position per digit.
const DIGIT_SCRATCH_WORDS: usize = 2 * RADIX_BUCKETS;

const WORD: usize = std::mem::size_of::<u32>();

/// Device layout of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortLayout {
    /// One key per word.
    #[default]
    KeysOnly,
    /// Interleaved `(key, value)` word pairs.
    KeyValue,
}

impl SortLayout {
    /// Words per element.
    pub fn stride(&self) -> usize {
        match self {
            Self::KeysOnly => 1,
            Self::KeyValue => 2,
        }
    }
}

/// Local memory of one `radix_local` work-group, in bytes.
pub fn radix_local_bytes(w: usize, layout: SortLayout) -> usize {
    (ELEMENTS_PER_ITEM * w * layout.stride() + 2 * w + DIGIT_SCRATCH_WORDS) * WORD
}

/// Tiles needed to cover `len` elements.
fn tiles(len: usize, w: usize) -> usize {
    len.div_ceil(ELEMENTS_PER_ITEM * w)
}

/// Device buffers of one capacity.
struct SortBuffers<B> {
    data: DoubleBuffer<B>,
    hist: B,
    block_offsets: B,
}

/// Radix sort engine.
///
/// Lifecycle: push → [`sort`](Self::sort) → pop, after which the sorted
/// data is loaded again and may be re-sorted or replaced by a new push.
pub struct RadixSortEngine<S: DeviceSurface> {
    surface: Arc<S>,
    max_elements: usize,
    key_bits: u32,
    work_group_size: usize,
    scan: BlockScanEngine<S>,
    /// Capacity in words; the histograms are sized for as many elements.
    buffers: Reservation<SortBuffers<S::Buffer>>,
    layout: SortLayout,
    len: usize,
    state: EngineState,
}

impl<S: DeviceSurface> std::fmt::Debug for RadixSortEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RadixSortEngine")
            .field("device", &self.surface.device_name())
            .field("max_elements", &self.max_elements)
            .field("key_bits", &self.key_bits)
            .field("work_group_size", &self.work_group_size)
            .field("layout", &self.layout)
            .field("len", &self.len)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<S: DeviceSurface> RadixSortEngine<S> {
    /// Configure an engine for datasets of up to `config.max_elements`.
    pub fn new(surface: Arc<S>, config: SortConfig) -> ClppResult<Self> {
        config.validate()?;
        if u32::try_from(config.max_elements.saturating_mul(2)).is_err() {
            return Err(ClppError::ConfigError(format!(
                "max_elements {} does not fit a 32-bit kernel argument",
                config.max_elements
            )));
        }
        let work_group_size = resolve_work_group_size(
            surface.as_ref(),
            &KernelName::ALL,
            config.work_group_size,
            MIN_SORT_WORK_GROUP_SIZE,
            |w| radix_local_bytes(w, SortLayout::KeyValue).max(scan_local_bytes(w)),
        )?;

        let table_len = RADIX_BUCKETS * tiles(config.max_elements, work_group_size).max(1);
        let scan = BlockScanEngine::new(
            Arc::clone(&surface),
            ScanConfig::new(table_len).work_group_size(WorkGroupSize::Fixed(work_group_size)),
        )?;
        log::debug!(
            "sort engine on {}: W={work_group_size}, key bits {}, histogram table {table_len}",
            surface.device_name(),
            config.key_bits
        );

        Ok(Self {
            surface,
            max_elements: config.max_elements,
            key_bits: config.key_bits,
            work_group_size,
            scan,
            buffers: Reservation::new(),
            layout: SortLayout::KeysOnly,
            len: 0,
            state: EngineState::Configured,
        })
    }

    /// Diagnostic name, depending on the layout of the last push.
    pub fn name(&self) -> &'static str {
        match self.layout {
            SortLayout::KeysOnly => "Radix sort",
            SortLayout::KeyValue => "Radix sort (key/value)",
        }
    }

    pub fn work_group_size(&self) -> usize {
        self.work_group_size
    }

    pub fn key_bits(&self) -> u32 {
        self.key_bits
    }

    pub fn max_elements(&self) -> usize {
        self.max_elements
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn layout(&self) -> SortLayout {
        self.layout
    }

    /// Element count of the current dataset.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of digit passes a sort runs.
    pub fn passes(&self) -> usize {
        self.key_bits.div_ceil(RADIX_BITS) as usize
    }

    /// How many times the data and histogram buffers were allocated.
    pub fn allocation_count(&self) -> usize {
        self.buffers.allocations()
    }

    /// Make room for `len` elements of `layout` and return the buffers,
    /// with slot 0 of the pair current.
    fn prepare(&mut self, len: usize, layout: SortLayout) -> ClppResult<&mut SortBuffers<S::Buffer>> {
        if len > self.max_elements {
            return Err(ClppError::CapacityExceeded {
                requested: len,
                capacity: self.max_elements,
            });
        }
        // The old dataset is gone once the buffers are touched.
        self.len = 0;
        self.state = EngineState::Configured;
        let words = len * layout.stride();
        let w = self.work_group_size;
        let surface = &self.surface;
        self.buffers.allocate_or_reuse(words, |words| {
            let table = RADIX_BUCKETS * tiles(words, w).max(1);
            log::debug!("sort buffers: 2 x {words} words, histograms 2 x {table}");
            Ok(SortBuffers {
                data: DoubleBuffer::new(
                    surface.create_buffer(words)?,
                    surface.create_buffer(words)?,
                ),
                hist: surface.create_buffer(table)?,
                block_offsets: surface.create_buffer(table)?,
            })
        })?;
        let buffers = self
            .buffers
            .get_mut()
            .ok_or(ClppError::InvalidState("sort buffers missing"))?;
        buffers.data.reset();
        Ok(buffers)
    }

    /// Allocate the buffers for `len` elements of `layout` up front, so
    /// later pushes up to that size allocate nothing. Discards any loaded
    /// dataset.
    pub fn reserve(&mut self, len: usize, layout: SortLayout) -> ClppResult<()> {
        self.prepare(len, layout)?;
        self.layout = layout;
        Ok(())
    }

    fn load(&mut self, len: usize, layout: SortLayout) {
        self.len = len;
        self.layout = layout;
        self.state = EngineState::Loaded;
    }

    fn upload(&mut self, words: &[u32], len: usize, layout: SortLayout) -> ClppResult<()> {
        let surface = Arc::clone(&self.surface);
        let buffers = self.prepare(len, layout)?;
        if !words.is_empty() {
            surface.write_buffer(buffers.data.current_mut(), words)?;
        }
        self.load(len, layout);
        Ok(())
    }

    /// Upload keys to sort. Overwrites any previous dataset, also when
    /// the upload fails.
    pub fn push_keys(&mut self, keys: &[u32]) -> ClppResult<()> {
        self.upload(keys, keys.len(), SortLayout::KeysOnly)
    }

    /// Upload keys with one value each; the lengths must match.
    pub fn push_pairs(&mut self, keys: &[u32], values: &[u32]) -> ClppResult<()> {
        if keys.len() != values.len() {
            return Err(ClppError::InvalidInput);
        }
        let interleaved: Vec<u32> = keys
            .iter()
            .zip(values)
            .flat_map(|(&k, &v)| [k, v])
            .collect();
        self.upload(&interleaved, keys.len(), SortLayout::KeyValue)
    }

    /// Take `len` elements of `layout` from the start of a device buffer,
    /// copied on the device.
    pub fn push_device(&mut self, buffer: &S::Buffer, len: usize, layout: SortLayout) -> ClppResult<()> {
        let surface = Arc::clone(&self.surface);
        let buffers = self.prepare(len, layout)?;
        if len > 0 {
            surface.copy_buffer(buffer, buffers.data.current_mut(), len * layout.stride())?;
        }
        self.load(len, layout);
        Ok(())
    }

    /// Enqueue the sort of the pushed dataset.
    ///
    /// A failure leaves the data undefined and the engine back in
    /// [`EngineState::Configured`].
    pub fn sort(&mut self) -> ClppResult<()> {
        if self.state != EngineState::Loaded {
            return Err(ClppError::InvalidState("sort() requires pushed data"));
        }
        let result = self.run_passes();
        self.state = match result {
            Ok(()) => EngineState::Computed,
            Err(_) => EngineState::Configured,
        };
        result
    }

    fn run_passes(&mut self) -> ClppResult<()> {
        let n = self.len;
        if n == 0 {
            return Ok(());
        }
        let w = self.work_group_size;
        let layout = self.layout;
        let stride = layout.stride() as u32;
        let num_blocks = tiles(n, w);
        let table_len = RADIX_BUCKETS * num_blocks;
        let global = num_blocks * w;

        let Self {
            surface,
            scan,
            buffers,
            key_bits,
            ..
        } = self;
        let buffers = buffers
            .get_mut()
            .ok_or(ClppError::InvalidState("sort buffers missing"))?;
        log::debug!(
            "sort: {n} elements, {num_blocks} tiles, {} passes",
            key_bits.div_ceil(RADIX_BITS)
        );

        for bit_offset in (0..*key_bits).step_by(RADIX_BITS as usize) {
            let scalars = [bit_offset, n as u32, num_blocks as u32, stride];
            surface.launch(
                KernelName::RadixLocal,
                &[
                    KernelArg::Buffer(buffers.data.current()),
                    KernelArg::Buffer(&buffers.hist),
                    KernelArg::Buffer(&buffers.block_offsets),
                    KernelArg::Uint(scalars[0]),
                    KernelArg::Uint(scalars[1]),
                    KernelArg::Uint(scalars[2]),
                    KernelArg::Uint(scalars[3]),
                    KernelArg::Local(ELEMENTS_PER_ITEM * w * layout.stride() * WORD),
                    KernelArg::Local(2 * w * WORD),
                    KernelArg::Local(DIGIT_SCRATCH_WORDS * WORD),
                ],
                global,
                w,
            )?;

            scan.scan_device(&buffers.hist, table_len)?;

            let (src, dst) = buffers.data.pair();
            surface.launch(
                KernelName::RadixPermute,
                &[
                    KernelArg::Buffer(src),
                    KernelArg::Buffer(dst),
                    KernelArg::Buffer(&buffers.hist),
                    KernelArg::Buffer(&buffers.block_offsets),
                    KernelArg::Uint(scalars[0]),
                    KernelArg::Uint(scalars[1]),
                    KernelArg::Uint(scalars[2]),
                    KernelArg::Uint(scalars[3]),
                ],
                global,
                w,
            )?;
            buffers.data.swap();
        }
        Ok(())
    }

    /// Block until every enqueued command has completed.
    pub fn wait_completion(&self) -> ClppResult<()> {
        self.surface.finish()
    }

    /// Finish the queue and return the side holding the result.
    fn sorted(&self) -> ClppResult<&S::Buffer> {
        if self.state != EngineState::Computed {
            return Err(ClppError::InvalidState("pop requires a completed sort()"));
        }
        let buffers = self
            .buffers
            .get()
            .ok_or(ClppError::InvalidState("sort buffers missing"))?;
        self.surface.finish()?;
        Ok(buffers.data.current())
    }

    /// Download the sorted keys. `keys` must have the pushed length.
    pub fn pop_keys(&mut self, keys: &mut [u32]) -> ClppResult<()> {
        if keys.len() != self.len {
            return Err(ClppError::InvalidInput);
        }
        let sorted = self.sorted()?;
        if self.len > 0 {
            match self.layout {
                SortLayout::KeysOnly => self.surface.read_buffer(sorted, keys)?,
                SortLayout::KeyValue => {
                    let mut words = vec![0; 2 * self.len];
                    self.surface.read_buffer(sorted, &mut words)?;
                    for (key, pair) in keys.iter_mut().zip(words.chunks_exact(2)) {
                        *key = pair[0];
                    }
                }
            }
        }
        self.state = EngineState::Loaded;
        Ok(())
    }

    /// Download sorted keys and the values that travelled with them.
    pub fn pop_pairs(&mut self, keys: &mut [u32], values: &mut [u32]) -> ClppResult<()> {
        if self.layout != SortLayout::KeyValue
            || keys.len() != self.len
            || values.len() != self.len
        {
            return Err(ClppError::InvalidInput);
        }
        let sorted = self.sorted()?;
        if self.len > 0 {
            let mut words = vec![0; 2 * self.len];
            self.surface.read_buffer(sorted, &mut words)?;
            for ((key, value), pair) in keys.iter_mut().zip(values.iter_mut()).zip(words.chunks_exact(2)) {
                *key = pair[0];
                *value = pair[1];
            }
        }
        self.state = EngineState::Loaded;
        Ok(())
    }

    /// Copy the sorted data, in the pushed layout, into the start of a
    /// device buffer.
    pub fn pop_device(&mut self, buffer: &mut S::Buffer) -> ClppResult<()> {
        let sorted = self.sorted()?;
        if self.len > 0 {
            self.surface
                .copy_buffer(sorted, buffer, self.len * self.layout.stride())?;
        }
        self.state = EngineState::Loaded;
        Ok(())
    }
}
