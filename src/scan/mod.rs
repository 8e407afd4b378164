//! Multi-level exclusive prefix sum.
//!
//! The dataset is cut into blocks of one work-group each. `block_scan`
//! scans every block in place and writes the block totals to the next
//! level, which is scanned the same way until a level fits in a single
//! block. `uniform_add` then walks back down, adding each block's
//! scanned carry to its elements.
//!
//! ```text
//! level 0  [ b0 | b1 | b2 | ... ]   block_scan  -> sums[0]
//! level 1  [ sums[0] ]              block_scan  -> sums[1]
//!   ...                                  ...
//! level k  [ one block ]            block_scan  (done)
//!          uniform_add(level k-1, sums[k-1]) ... uniform_add(level 0, sums[0])
//! ```
//!
//! All arithmetic wraps modulo 2^32.

use crate::config::{ScanConfig, MIN_SCAN_WORK_GROUP_SIZE};
use crate::plan::{BlockPlan, LevelBuffers, Reservation};
use crate::surface::{resolve_work_group_size, DeviceSurface, KernelArg, KernelName};
use crate::{ClppError, ClppResult, EngineState};

use std::sync::Arc;

/// Kernels the scan engine launches.
pub const SCAN_KERNELS: [KernelName; 2] = [KernelName::BlockScan, KernelName::UniformAdd];

/// Local memory of one `block_scan` work-group of `w` items, in bytes.
pub fn scan_local_bytes(w: usize) -> usize {
    2 * w * std::mem::size_of::<u32>()
}

/// Exclusive prefix sum engine.
///
/// Lifecycle: [`push`](Self::push) → [`scan`](Self::scan) →
/// [`pop`](Self::pop). Results stay poppable until the next push.
pub struct BlockScanEngine<S: DeviceSurface> {
    surface: Arc<S>,
    max_elements: usize,
    work_group_size: usize,
    /// Block sums for every pass, sized for `max_elements`.
    levels: LevelBuffers<S::Buffer>,
    /// Dataset buffer, allocated on first push.
    base: Reservation<S::Buffer>,
    plan: BlockPlan,
    state: EngineState,
}

impl<S: DeviceSurface> std::fmt::Debug for BlockScanEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockScanEngine")
            .field("device", &self.surface.device_name())
            .field("max_elements", &self.max_elements)
            .field("work_group_size", &self.work_group_size)
            .field("levels", &self.plan.levels())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<S: DeviceSurface> BlockScanEngine<S> {
    /// Configure an engine for datasets of up to `config.max_elements`.
    ///
    /// Resolves the work-group size and allocates the block-sum buffer of
    /// every level. Fails with [`ClppError::ConfigError`] when the size is
    /// invalid for the device or allocation fails.
    pub fn new(surface: Arc<S>, config: ScanConfig) -> ClppResult<Self> {
        if u32::try_from(config.max_elements).is_err() {
            return Err(ClppError::ConfigError(format!(
                "max_elements {} does not fit a 32-bit kernel argument",
                config.max_elements
            )));
        }
        let work_group_size = resolve_work_group_size(
            surface.as_ref(),
            &SCAN_KERNELS,
            config.work_group_size,
            MIN_SCAN_WORK_GROUP_SIZE,
            scan_local_bytes,
        )?;

        let max_plan = BlockPlan::new(config.max_elements, work_group_size);
        let levels = LevelBuffers::allocate(&max_plan, |len| surface.create_buffer(len))
            .map_err(|e| ClppError::ConfigError(format!("block-sum allocation failed: {e}")))?;
        log::debug!(
            "scan engine on {}: W={work_group_size}, max levels {:?}",
            surface.device_name(),
            max_plan.levels()
        );

        Ok(Self {
            surface,
            max_elements: config.max_elements,
            work_group_size,
            levels,
            base: Reservation::new(),
            plan: BlockPlan::new(0, work_group_size),
            state: EngineState::Configured,
        })
    }

    /// Diagnostic name of the primitive.
    pub fn name(&self) -> &'static str {
        "Prefix sum (exclusive)"
    }

    pub fn work_group_size(&self) -> usize {
        self.work_group_size
    }

    pub fn max_elements(&self) -> usize {
        self.max_elements
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Element count of the current dataset.
    pub fn len(&self) -> usize {
        self.plan.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plan.is_empty()
    }

    /// Level sizes of the current dataset.
    pub fn levels(&self) -> &[usize] {
        self.plan.levels()
    }

    /// How many times the dataset buffer was allocated.
    pub fn allocation_count(&self) -> usize {
        self.base.allocations()
    }

    fn check_capacity(&self, len: usize) -> ClppResult<()> {
        if len > self.max_elements {
            return Err(ClppError::CapacityExceeded {
                requested: len,
                capacity: self.max_elements,
            });
        }
        Ok(())
    }

    fn ensure_base(&mut self) -> ClppResult<&mut S::Buffer> {
        let surface = &self.surface;
        self.base
            .allocate_or_reuse(self.max_elements, |len| surface.create_buffer(len))?;
        self.base
            .get_mut()
            .ok_or(ClppError::InvalidState("dataset buffer missing"))
    }

    fn unload(&mut self) {
        self.plan = BlockPlan::new(0, self.work_group_size);
        self.state = EngineState::Configured;
    }

    fn load(&mut self, len: usize) {
        self.plan = BlockPlan::new(len, self.work_group_size);
        self.state = EngineState::Loaded;
        log::debug!("scan push: levels {:?}", self.plan.levels());
    }

    /// Upload a host dataset. Overwrites any previous one, also when the
    /// upload fails.
    pub fn push(&mut self, data: &[u32]) -> ClppResult<()> {
        self.check_capacity(data.len())?;
        self.unload();
        let surface = Arc::clone(&self.surface);
        let base = self.ensure_base()?;
        if !data.is_empty() {
            surface.write_buffer(base, data)?;
        }
        self.load(data.len());
        Ok(())
    }

    /// Take the first `len` words of a device buffer as the dataset,
    /// copied on the device.
    pub fn push_device(&mut self, buffer: &S::Buffer, len: usize) -> ClppResult<()> {
        self.check_capacity(len)?;
        self.unload();
        let surface = Arc::clone(&self.surface);
        let base = self.ensure_base()?;
        if len > 0 {
            surface.copy_buffer(buffer, base, len)?;
        }
        self.load(len);
        Ok(())
    }

    /// Enqueue the scan of the pushed dataset.
    ///
    /// A failure leaves the data undefined and the engine back in
    /// [`EngineState::Configured`].
    pub fn scan(&mut self) -> ClppResult<()> {
        if self.state != EngineState::Loaded {
            return Err(ClppError::InvalidState("scan() requires pushed data"));
        }
        let result = match self.base.get() {
            Some(base) => self.run(base, &self.plan),
            None => Err(ClppError::InvalidState("dataset buffer missing")),
        };
        self.state = match result {
            Ok(()) => EngineState::Computed,
            Err(_) => EngineState::Configured,
        };
        result
    }

    /// Scan the first `len` words of a device buffer in place.
    ///
    /// Does not touch the engine's own dataset or state.
    pub fn scan_device(&mut self, buffer: &S::Buffer, len: usize) -> ClppResult<()> {
        self.check_capacity(len)?;
        let plan = BlockPlan::new(len, self.work_group_size);
        self.run(buffer, &plan)
    }

    fn run(&self, data: &S::Buffer, plan: &BlockPlan) -> ClppResult<()> {
        let w = self.work_group_size;
        let passes = plan.passes();
        if !self.levels.fits(plan) {
            return Err(ClppError::InvalidState("block-sum buffers too small"));
        }
        for i in 0..passes {
            let n = plan.levels()[i];
            self.surface.launch(
                KernelName::BlockScan,
                &[
                    KernelArg::Buffer(self.level(data, i)?),
                    KernelArg::Buffer(self.sums(i)?),
                    KernelArg::Uint(n as u32),
                    KernelArg::Local(scan_local_bytes(w)),
                ],
                plan.block_sum_len(i) * w,
                w,
            )?;
        }

        // Carries of level i are the scanned block sums of pass i.
        for i in (0..passes.saturating_sub(1)).rev() {
            let n = plan.levels()[i];
            self.surface.launch(
                KernelName::UniformAdd,
                &[
                    KernelArg::Buffer(self.level(data, i)?),
                    KernelArg::Buffer(self.sums(i)?),
                    KernelArg::Uint(n as u32),
                ],
                plan.block_sum_len(i) * w,
                w,
            )?;
        }
        Ok(())
    }

    /// Data of level `i`: the dataset itself, then the block sums of the
    /// pass below.
    fn level<'a>(&'a self, data: &'a S::Buffer, i: usize) -> ClppResult<&'a S::Buffer> {
        match i {
            0 => Ok(data),
            _ => self.sums(i - 1),
        }
    }

    fn sums(&self, i: usize) -> ClppResult<&S::Buffer> {
        self.levels
            .get(i)
            .ok_or(ClppError::InvalidState("block-sum buffer missing"))
    }

    /// Block until every enqueued command has completed.
    pub fn wait_completion(&self) -> ClppResult<()> {
        self.surface.finish()
    }

    fn computed_base(&self) -> ClppResult<&S::Buffer> {
        if self.state != EngineState::Computed {
            return Err(ClppError::InvalidState("pop requires a completed scan()"));
        }
        self.base
            .get()
            .ok_or(ClppError::InvalidState("dataset buffer missing"))
    }

    /// Download the scan result into `out`, whose length must match the
    /// pushed dataset.
    pub fn pop(&mut self, out: &mut [u32]) -> ClppResult<()> {
        let base = self.computed_base()?;
        if out.len() != self.plan.len() {
            return Err(ClppError::InvalidInput);
        }
        self.surface.finish()?;
        if !out.is_empty() {
            self.surface.read_buffer(base, out)?;
        }
        Ok(())
    }

    /// Download the scan result into a new vector.
    pub fn pop_vec(&mut self) -> ClppResult<Vec<u32>> {
        let mut out = vec![0; self.plan.len()];
        self.pop(&mut out)?;
        Ok(out)
    }

    /// Copy the scan result into the start of a device buffer.
    pub fn pop_device(&mut self, buffer: &mut S::Buffer) -> ClppResult<()> {
        let base = self.computed_base()?;
        self.surface.finish()?;
        if !self.plan.is_empty() {
            self.surface.copy_buffer(base, buffer, self.plan.len())?;
        }
        Ok(())
    }
}
